//! Sync driver — clone, pull, fetch and push of the content branch and of
//! every correction ref.
//!
//! The content branch only ever fast-forwards; a diverged branch is an
//! error for a human to resolve. Correction refs are owned by the workers,
//! so a diverged correction ref is merged field by field and the result is
//! force-pushed.

use std::collections::BTreeSet;
use std::path::Path;

use chrono::{DateTime, Utc};
use git2::Oid;
use serde::Serialize;

use crate::config::StoreConfig;
use crate::error::{QuillError, QuillResult};
use crate::merge::{self, FieldConflict};
use crate::object::{ObjectCache, ObjectStore};
use crate::repo::{local_ref, CorrectionEvent, CorrectionRepository, SPELLCHECK_PREFIX};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// What happened to the content branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BranchOutcome {
    /// No remote configured; nothing was exchanged.
    Offline,
    Unchanged,
    /// Local branch created from the remote one.
    Created,
    FastForwarded,
    /// Local commits pushed.
    Pushed,
}

/// What happened to one correction ref.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum RefOutcome {
    Unchanged,
    Created,
    FastForwarded,
    Pushed,
    Merged { conflicts: Vec<FieldConflict> },
    /// The ref could not be merged; left as it was.
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RefSync {
    pub spellcheck_id: String,
    #[serde(flatten)]
    pub outcome: RefOutcome,
}

/// Summary of one sync run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub branch: BranchOutcome,
    /// Correction refs that were not already in sync.
    pub refs: Vec<RefSync>,
}

impl SyncReport {
    pub fn merged(&self) -> usize {
        self.refs
            .iter()
            .filter(|r| matches!(r.outcome, RefOutcome::Merged { .. }))
            .count()
    }

    pub fn failed(&self) -> usize {
        self.refs
            .iter()
            .filter(|r| matches!(r.outcome, RefOutcome::Failed { .. }))
            .count()
    }
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

/// Open the store at `dir`, cloning `remote_url` into it when it is missing.
pub fn open_or_clone(dir: &Path, config: &StoreConfig) -> QuillResult<CorrectionRepository> {
    let is_empty_dir = dir.is_dir() && std::fs::read_dir(dir)?.next().is_none();
    if dir.exists() && !is_empty_dir {
        return CorrectionRepository::open(dir, config);
    }
    let url = config
        .remote_url
        .as_deref()
        .ok_or_else(|| QuillError::NotARepo(dir.display().to_string()))?;
    tracing::info!(url, dir = %dir.display(), branch = %config.branch, "cloning");
    let store = ObjectStore::clone_from(url, dir, &config.branch, &config.remote, config.token.clone())?;
    CorrectionRepository::from_store(store, config)
}

/// Reconciles one repository with its remote.
pub struct SyncDriver<'a> {
    repo: &'a CorrectionRepository,
}

impl<'a> SyncDriver<'a> {
    pub fn new(repo: &'a CorrectionRepository) -> Self {
        Self { repo }
    }

    /// Pull the branch, then fetch, merge and push every correction ref.
    pub fn sync(&self) -> QuillResult<SyncReport> {
        let started_at = Utc::now();
        let store = self.repo.store();
        if !store.has_remote() {
            tracing::debug!("no remote configured, skipping sync");
            return Ok(SyncReport {
                started_at,
                finished_at: Utc::now(),
                branch: BranchOutcome::Offline,
                refs: Vec::new(),
            });
        }

        let branch = self.sync_branch()?;
        let refs = self.sync_corrections()?;

        let report = SyncReport {
            started_at,
            finished_at: Utc::now(),
            branch,
            refs,
        };
        tracing::info!(
            branch = ?report.branch,
            refs = report.refs.len(),
            merged = report.merged(),
            failed = report.failed(),
            "sync finished"
        );
        Ok(report)
    }

    fn sync_branch(&self) -> QuillResult<BranchOutcome> {
        let store = self.repo.store();
        let branch = self.repo.branch();
        let local_name = self.repo.branch_ref();
        let tracking_name = format!("refs/remotes/{}/{branch}", store.remote_name());

        let refspec = format!("+{local_name}:{tracking_name}");
        store.fetch(&[refspec.as_str()])?;

        let local = store.resolve_ref(&local_name)?;
        let remote = store.resolve_ref(&tracking_name)?;
        let outcome = match (local, remote) {
            (None, None) => {
                return Err(QuillError::ObjectNotFound(format!("branch '{branch}'")));
            }
            (None, Some(r)) => {
                store.write_ref(&local_name, r, false)?;
                store.checkout_head()?;
                BranchOutcome::Created
            }
            (Some(_), None) => {
                store.push(&local_name, false)?;
                BranchOutcome::Pushed
            }
            (Some(l), Some(r)) if l == r => BranchOutcome::Unchanged,
            (Some(l), Some(r)) => {
                if store.is_descendant(r, l)? {
                    store.update_ref(&local_name, r, l)?;
                    store.checkout_head()?;
                    BranchOutcome::FastForwarded
                } else if store.is_descendant(l, r)? {
                    store.push(&local_name, false)?;
                    BranchOutcome::Pushed
                } else {
                    return Err(QuillError::BranchDiverged {
                        branch: branch.to_string(),
                    });
                }
            }
        };
        tracing::debug!(branch, ?outcome, "branch synced");
        Ok(outcome)
    }

    fn sync_corrections(&self) -> QuillResult<Vec<RefSync>> {
        let store = self.repo.store();
        let remote_prefix = format!("refs/remotes/{}/spellcheck/", store.remote_name());
        let refspec = format!("+{SPELLCHECK_PREFIX}*:{remote_prefix}*");
        store.fetch(&[refspec.as_str()])?;

        let local_refs = store.list_refs(SPELLCHECK_PREFIX)?;
        let remote_refs = store.list_refs(&remote_prefix)?;
        let ids: BTreeSet<&str> = local_refs
            .iter()
            .filter_map(|(name, _)| name.strip_prefix(SPELLCHECK_PREFIX))
            .chain(
                remote_refs
                    .iter()
                    .filter_map(|(name, _)| name.strip_prefix(remote_prefix.as_str())),
            )
            .collect();

        let mut results = Vec::new();
        for id in ids {
            let Ok(spellcheck_id) = Oid::from_str(id) else {
                tracing::warn!(id, "ignoring correction ref with a malformed id");
                continue;
            };
            let local = store.resolve_ref(&format!("{SPELLCHECK_PREFIX}{id}"))?;
            let remote = store.resolve_ref(&format!("{remote_prefix}{id}"))?;
            let outcome = match self.sync_correction(spellcheck_id, local, remote) {
                Ok(outcome) => outcome,
                Err(e @ (QuillError::CorruptRecord { .. } | QuillError::MergeInvariant(_))) => {
                    tracing::warn!(id, error = %e, "correction ref left diverged");
                    RefOutcome::Failed {
                        reason: e.to_string(),
                    }
                }
                Err(e) => return Err(e),
            };
            if outcome != RefOutcome::Unchanged {
                results.push(RefSync {
                    spellcheck_id: id.to_string(),
                    outcome,
                });
            }
        }
        Ok(results)
    }

    fn sync_correction(
        &self,
        spellcheck_id: Oid,
        local: Option<Oid>,
        remote: Option<Oid>,
    ) -> QuillResult<RefOutcome> {
        let store = self.repo.store();
        let name = local_ref(spellcheck_id);
        match (local, remote) {
            (None, None) => Ok(RefOutcome::Unchanged),
            (None, Some(r)) => {
                store.write_ref(&name, r, false)?;
                Ok(RefOutcome::Created)
            }
            (Some(_), None) => {
                store.push(&name, true)?;
                Ok(RefOutcome::Pushed)
            }
            (Some(l), Some(r)) if l == r => Ok(RefOutcome::Unchanged),
            (Some(l), Some(r)) => {
                if store.is_descendant(r, l)? {
                    store.write_ref(&name, r, true)?;
                    Ok(RefOutcome::FastForwarded)
                } else if store.is_descendant(l, r)? {
                    store.push(&name, true)?;
                    Ok(RefOutcome::Pushed)
                } else {
                    self.merge_correction(spellcheck_id, l, r)
                }
            }
        }
    }

    fn merge_correction(&self, spellcheck_id: Oid, local: Oid, remote: Oid) -> QuillResult<RefOutcome> {
        let store = self.repo.store();
        let mut cache = ObjectCache::new();
        let local_record = self.repo.record_at(local, &mut cache)?;
        let remote_record = self.repo.record_at(remote, &mut cache)?;

        // Chains rooted on a content commit have no shared record.
        let ancestor = match store.find_merge_base(local, remote)? {
            Some(base) => match self.repo.record_at(base, &mut cache) {
                Ok(record) => record,
                Err(QuillError::ObjectNotFound(_)) => merge::empty_ancestor(&local_record),
                Err(e) => return Err(e),
            },
            None => merge::empty_ancestor(&local_record),
        };

        let outcome = merge::merge_records(&ancestor, &local_record, &remote_record)?;
        let commit = self.repo.write_correction(
            spellcheck_id,
            &outcome.record,
            vec![local, remote],
            format!("Merged {spellcheck_id}"),
            None,
            None,
        )?;
        store.push(&local_ref(spellcheck_id), true)?;

        tracing::info!(%spellcheck_id, %commit, conflicts = outcome.conflicts.len(), "merged correction");
        self.repo.notify(&CorrectionEvent {
            path: None,
            spellcheck_id,
            commit,
            record: outcome.record,
        });
        Ok(RefOutcome::Merged {
            conflicts: outcome.conflicts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{Judgment, JudgmentText, SelectedText};
    use crate::repo::tests::{commit_file, init_git, test_config};
    use crate::repo::{CommitDetails, CorrectionQuery, WriteMode};
    use std::path::PathBuf;
    use tempfile::TempDir;

    const PATH: &str = "story/one.md";

    /// A bare remote seeded with one tracked file on `main`.
    fn setup_remote() -> (TempDir, StoreConfig) {
        let tmp = TempDir::new().unwrap();
        let seed_dir = tmp.path().join("seed");
        let remote_dir = tmp.path().join("remote.git");

        git2::Repository::init_bare(&remote_dir).unwrap();
        let seed = init_git(&seed_dir);
        commit_file(&seed, PATH, "Erster Absatz.\n\nZweiter Absatz.\n", "initial");
        seed.remote("origin", remote_dir.to_str().unwrap()).unwrap();
        seed.find_remote("origin")
            .unwrap()
            .push(&["refs/heads/main:refs/heads/main"], None)
            .unwrap();

        let config = StoreConfig {
            remote_url: Some(remote_dir.to_str().unwrap().to_string()),
            ..test_config()
        };
        (tmp, config)
    }

    fn worker(tmp: &TempDir, name: &str, config: &StoreConfig) -> CorrectionRepository {
        let dir: PathBuf = tmp.path().join(name);
        open_or_clone(&dir, config).unwrap()
    }

    fn read(repo: &CorrectionRepository) -> crate::record::CorrectionRecord {
        let mut cache = ObjectCache::new();
        repo.get_correction(&CorrectionQuery::path(PATH), &mut cache).unwrap()
    }

    #[test]
    fn test_clone_then_sync_is_unchanged() {
        let (tmp, config) = setup_remote();
        let a = worker(&tmp, "a", &config);
        assert_eq!(a.get_text(PATH).unwrap(), "Erster Absatz.\n\nZweiter Absatz.\n");

        let report = SyncDriver::new(&a).sync().unwrap();
        assert_eq!(report.branch, BranchOutcome::Unchanged);
        assert!(report.refs.is_empty());
    }

    #[test]
    fn test_missing_dir_without_url_is_not_a_repo() {
        let tmp = TempDir::new().unwrap();
        assert!(matches!(
            open_or_clone(&tmp.path().join("none"), &test_config()),
            Err(QuillError::NotARepo(_))
        ));
    }

    #[test]
    fn test_offline_store_skips_sync() {
        let tmp = TempDir::new().unwrap();
        let git = init_git(tmp.path());
        commit_file(&git, PATH, "x", "initial");
        let repo = CorrectionRepository::open(tmp.path(), &test_config()).unwrap();
        let report = SyncDriver::new(&repo).sync().unwrap();
        assert_eq!(report.branch, BranchOutcome::Offline);
    }

    #[test]
    fn test_correction_pushed_by_one_worker_is_created_on_other() {
        let (tmp, config) = setup_remote();
        let a = worker(&tmp, "a", &config);
        let b = worker(&tmp, "b", &config);

        let mut record = a.get_or_create_metadata(PATH).unwrap();
        record.paragraph_info[0].edited = Some("Erster!".into());
        a.correct_text(PATH, &record, None, WriteMode::FileChange).unwrap();

        let report = SyncDriver::new(&b).sync().unwrap();
        assert_eq!(report.refs.len(), 1);
        assert_eq!(report.refs[0].outcome, RefOutcome::Created);
        assert_eq!(read(&b), record);
    }

    #[test]
    fn test_diverged_correction_is_merged_and_pushed() {
        let (tmp, config) = setup_remote();
        let a = worker(&tmp, "a", &config);
        let b = worker(&tmp, "b", &config);

        let base = a.get_or_create_metadata(PATH).unwrap();
        a.correct_text(PATH, &base, None, WriteMode::FileChange).unwrap();
        SyncDriver::new(&b).sync().unwrap();

        let mut from_a = base.clone();
        from_a.paragraph_info[0].judgment.insert(
            "m1".into(),
            Judgment {
                score: 3.0,
                text: JudgmentText {
                    correction: "Erster Absatz!".into(),
                    alternative: Default::default(),
                },
                ..Default::default()
            },
        );
        from_a.paragraph_info[0].selected_text = Some(SelectedText::Correction { model: "m1".into() });
        from_a.time_spent_ms = 40;
        a.correct_text(PATH, &from_a, None, WriteMode::FileChange).unwrap();

        // b force-pushes last, hiding a's commit on the remote.
        let mut from_b = base.clone();
        from_b.paragraph_info[1].edited = Some("Zweiter, bearbeitet.".into());
        from_b.time_spent_ms = 10;
        b.correct_text(PATH, &from_b, None, WriteMode::FileChange).unwrap();

        let report = SyncDriver::new(&a).sync().unwrap();
        assert_eq!(report.merged(), 1);
        let merged = read(&a);
        assert!(merged.paragraph_info[0].judgment.contains_key("m1"));
        assert_eq!(merged.paragraph_info[1].edited.as_deref(), Some("Zweiter, bearbeitet."));
        assert_eq!(merged.time_spent_ms, 50);

        let tip = a.correction_oid(PATH, 0).unwrap().unwrap();
        let info = a.store().read_commit(tip).unwrap();
        assert_eq!(info.parents.len(), 2);
        assert!(info.message.starts_with("Merged "));

        let report = SyncDriver::new(&b).sync().unwrap();
        assert_eq!(report.refs[0].outcome, RefOutcome::FastForwarded);
        assert_eq!(read(&b), merged);
    }

    #[test]
    fn test_branch_fast_forwards_from_remote() {
        let (tmp, config) = setup_remote();
        let a = worker(&tmp, "a", &config);
        let b = worker(&tmp, "b", &config);

        b.set_text("story/two.md", "Neu.", &CommitDetails::message("add two"))
            .unwrap();
        let report = SyncDriver::new(&a).sync().unwrap();
        assert_eq!(report.branch, BranchOutcome::FastForwarded);
        assert_eq!(a.get_text("story/two.md").unwrap(), "Neu.");
        assert!(tmp.path().join("a/story/two.md").exists());
    }

    #[test]
    fn test_diverged_branch_is_an_error() {
        let (tmp, config) = setup_remote();
        let a = worker(&tmp, "a", &config);
        let b = worker(&tmp, "b", &config);

        a.set_text("story/a.md", "A", &CommitDetails::message("a")).unwrap();
        assert!(b.set_text("story/b.md", "B", &CommitDetails::message("b")).is_err());
        assert!(matches!(
            SyncDriver::new(&b).sync(),
            Err(QuillError::BranchDiverged { .. })
        ));
    }
}
