//! Store configuration.
//!
//! Loaded from a JSON file (`quill.json` by default), then overridden from
//! the environment. Everything has a default, so a missing file is fine.

use std::fs;
use std::path::Path;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{QuillError, QuillResult};
use crate::object::Identity;

/// Default config file name, looked up in the working directory.
pub const CONFIG_FILE: &str = "quill.json";

/// Shared configuration of a correction store and its background loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// URL of the origin; cloned from when the store directory is missing.
    pub remote_url: Option<String>,
    /// Name of the git remote.
    pub remote: String,
    /// Branch holding the tracked files.
    pub branch: String,
    /// Regex selecting the tracked files a pass works on (unanchored).
    pub path_filter: String,
    /// Path of the user dictionary inside the tracked tree.
    pub dictionary_path: String,
    /// Identity for commits the store writes on its own behalf.
    pub bot: Identity,
    /// Seconds to sleep after a successful pass.
    pub idle_delay_secs: u64,
    /// Seconds to sleep after a failed pass.
    pub error_delay_secs: u64,
    /// Access token for the remote. Never written back to disk.
    #[serde(skip_serializing)]
    pub token: Option<String>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            remote_url: None,
            remote: "origin".to_string(),
            branch: "main".to_string(),
            path_filter: r"story/.*\.md".to_string(),
            dictionary_path: "dictionary.txt".to_string(),
            bot: Identity::new("Review Bot", "noreply@review.bot"),
            idle_delay_secs: 30,
            error_delay_secs: 60,
            token: None,
        }
    }
}

impl StoreConfig {
    /// Read `path` if it exists, defaults otherwise. Env overrides applied.
    pub fn load(path: &Path) -> QuillResult<Self> {
        let config = if path.exists() {
            let raw = fs::read_to_string(path)?;
            serde_json::from_str(&raw)
                .map_err(|e| QuillError::Config(format!("{}: {e}", path.display())))?
        } else {
            Self::default()
        };
        let config = config.with_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Apply `QUILL_*` overrides looked up through `lookup`.
    pub fn with_overrides<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        if let Some(url) = get("QUILL_REMOTE_URL") {
            self.remote_url = Some(url);
        }
        if let Some(branch) = get("QUILL_BRANCH") {
            self.branch = branch;
        }
        if let Some(filter) = get("QUILL_PATH_FILTER") {
            self.path_filter = filter;
        }
        if let Some(token) = get("QUILL_TOKEN").or_else(|| get("GITHUB_API_TOKEN")) {
            self.token = Some(token);
        }
        self
    }

    pub fn validate(&self) -> QuillResult<()> {
        if self.branch.trim().is_empty() {
            return Err(QuillError::Config("branch must not be empty".to_string()));
        }
        if self.remote.trim().is_empty() {
            return Err(QuillError::Config("remote must not be empty".to_string()));
        }
        self.path_regex()?;
        Ok(())
    }

    pub fn path_regex(&self) -> QuillResult<Regex> {
        Regex::new(&self.path_filter)
            .map_err(|e| QuillError::Config(format!("path_filter: {e}")))
    }

    pub fn idle_delay(&self) -> Duration {
        Duration::from_secs(self.idle_delay_secs)
    }

    pub fn error_delay(&self) -> Duration {
        Duration::from_secs(self.error_delay_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = StoreConfig::default();
        assert_eq!(config.branch, "main");
        assert_eq!(config.remote, "origin");
        assert_eq!(config.idle_delay(), Duration::from_secs(30));
        assert_eq!(config.error_delay(), Duration::from_secs(60));
        let re = config.path_regex().unwrap();
        assert!(re.is_match("story/chapter-1.md"));
        assert!(!re.is_match("notes/todo.txt"));
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig::load(&dir.path().join("absent.json")).unwrap();
        assert_eq!(config.dictionary_path, "dictionary.txt");
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        fs::write(&path, r#"{"branch": "draft", "idle_delay_secs": 5}"#).unwrap();
        let config: StoreConfig =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(config.branch, "draft");
        assert_eq!(config.idle_delay(), Duration::from_secs(5));
        assert_eq!(config.remote, "origin");
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("QUILL_BRANCH", "review"),
            ("QUILL_PATH_FILTER", r"^chapters/"),
            ("GITHUB_API_TOKEN", "ghp_x"),
            ("QUILL_REMOTE_URL", "  "),
        ]
        .into_iter()
        .collect();
        let config = StoreConfig::default().with_overrides(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(config.branch, "review");
        assert_eq!(config.path_filter, "^chapters/");
        assert_eq!(config.token.as_deref(), Some("ghp_x"));
        assert_eq!(config.remote_url, None);
    }

    #[test]
    fn test_bad_regex_is_config_error() {
        let config = StoreConfig {
            path_filter: "(".to_string(),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(QuillError::Config(_))));
    }

    #[test]
    fn test_token_not_serialized() {
        let config = StoreConfig {
            token: Some("secret".into()),
            ..Default::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        assert!(!json.contains("secret"));
    }
}
