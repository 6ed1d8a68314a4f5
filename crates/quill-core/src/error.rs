//! Error types for correction store operations.

use std::fmt;
use std::io;

/// All possible quill errors.
#[derive(Debug)]
pub enum QuillError {
    /// The given directory is not a git repository.
    NotARepo(String),
    /// A ref, blob, tree or commit is absent.
    ObjectNotFound(String),
    /// A fetch, push or clone failed on the wire.
    Network(String),
    /// A stored metadata blob matches neither record schema.
    CorruptRecord {
        /// Why the legacy schema rejected the record.
        legacy: String,
        /// Why the current schema rejected the record.
        current: String,
    },
    /// Three-way merge inputs disagree on paragraph structure.
    MergeInvariant(String),
    /// A record does not match the paragraphs of the content it is keyed on.
    Misaligned(String),
    /// A paragraph's selected text does not resolve to a string.
    BuildText(String),
    /// A tracked path is malformed (leading/trailing slash, empty segment).
    InvalidPath(String),
    /// The local branch and its remote counterpart have diverged.
    BranchDiverged { branch: String },
    /// A non-force ref update found the ref moved underneath it.
    RefMoved { name: String },
    /// A review id is empty or not usable as a ref name.
    InvalidReviewId(String),
    /// The branch head moved during a pass; the pass must restart.
    HeadMoved,
    /// The background loop is already running.
    AlreadyRunning,
    /// Could not acquire the store lock within the timeout.
    LockTimeout,
    /// Configuration could not be loaded or is invalid.
    Config(String),
    /// Any other libgit2 failure.
    Git(git2::Error),
    /// An I/O error occurred.
    Io(io::Error),
    /// JSON serialization/deserialization failed.
    Json(serde_json::Error),
}

impl fmt::Display for QuillError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QuillError::NotARepo(path) => write!(f, "not a git repository: {path}"),
            QuillError::ObjectNotFound(what) => write!(f, "object not found: {what}"),
            QuillError::Network(msg) => write!(f, "network error: {msg}"),
            QuillError::CorruptRecord { legacy, current } => write!(
                f,
                "corrupt correction record (legacy schema: {legacy}; current schema: {current})"
            ),
            QuillError::MergeInvariant(msg) => write!(f, "merge invariant violated: {msg}"),
            QuillError::Misaligned(msg) => write!(f, "record misaligned: {msg}"),
            QuillError::BuildText(msg) => write!(f, "cannot build corrected text: {msg}"),
            QuillError::InvalidPath(path) => write!(f, "invalid path: '{path}'"),
            QuillError::BranchDiverged { branch } => {
                write!(f, "branch '{branch}' has diverged from its remote")
            }
            QuillError::RefMoved { name } => write!(f, "ref '{name}' moved during update"),
            QuillError::InvalidReviewId(id) => write!(f, "invalid review id: '{id}'"),
            QuillError::HeadMoved => write!(f, "branch head moved during pass"),
            QuillError::AlreadyRunning => write!(f, "background loop already running"),
            QuillError::LockTimeout => write!(f, "could not acquire store lock within timeout"),
            QuillError::Config(msg) => write!(f, "configuration error: {msg}"),
            QuillError::Git(e) => write!(f, "git error: {e}"),
            QuillError::Io(e) => write!(f, "I/O error: {e}"),
            QuillError::Json(e) => write!(f, "JSON error: {e}"),
        }
    }
}

impl std::error::Error for QuillError {}

impl From<io::Error> for QuillError {
    fn from(e: io::Error) -> Self {
        QuillError::Io(e)
    }
}

impl From<serde_json::Error> for QuillError {
    fn from(e: serde_json::Error) -> Self {
        QuillError::Json(e)
    }
}

impl From<git2::Error> for QuillError {
    fn from(e: git2::Error) -> Self {
        if e.code() == git2::ErrorCode::NotFound {
            return QuillError::ObjectNotFound(e.message().to_string());
        }
        match e.class() {
            git2::ErrorClass::Net
            | git2::ErrorClass::Http
            | git2::ErrorClass::Ssh
            | git2::ErrorClass::Ssl => QuillError::Network(e.message().to_string()),
            _ => QuillError::Git(e),
        }
    }
}

/// Convenience alias for Results in quill.
pub type QuillResult<T> = Result<T, QuillError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_maps_to_object_not_found() {
        let e = git2::Error::new(
            git2::ErrorCode::NotFound,
            git2::ErrorClass::Reference,
            "reference 'refs/spellcheck/abc' not found",
        );
        assert!(matches!(QuillError::from(e), QuillError::ObjectNotFound(_)));
    }

    #[test]
    fn test_net_class_maps_to_network() {
        let e = git2::Error::new(
            git2::ErrorCode::GenericError,
            git2::ErrorClass::Net,
            "connection refused",
        );
        assert!(matches!(QuillError::from(e), QuillError::Network(_)));
    }

    #[test]
    fn test_corrupt_record_display_carries_both_reasons() {
        let e = QuillError::CorruptRecord {
            legacy: "missing field `text`".to_string(),
            current: "missing field `original`".to_string(),
        };
        let msg = e.to_string();
        assert!(msg.contains("missing field `text`"));
        assert!(msg.contains("missing field `original`"));
    }
}
