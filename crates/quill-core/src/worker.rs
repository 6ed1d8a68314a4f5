//! Background correction loop.
//!
//! A pass syncs with the remote, picks the tracked files matching the path
//! filter, and runs each [`Corrector`] phase over all files before the next
//! phase starts. A phase works on the record through a
//! [`CorrectionSession`] and calls [`CorrectionSession::checkpoint`] after
//! each unit of work, which commits the record under the content it was
//! built from and checks that the branch has not moved since the pass
//! started. If it has, the pass is abandoned and restarted at once.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use git2::Oid;

use crate::config::StoreConfig;
use crate::error::{QuillError, QuillResult};
use crate::lock::StoreLock;
use crate::record::CorrectionRecord;
use crate::repo::{CorrectionRepository, WriteMode};
use crate::sync::{SyncDriver, SyncReport};

/// Process-wide state shared by the loop and its callers.
#[derive(Debug)]
pub struct StoreState {
    running: AtomicBool,
    config: StoreConfig,
}

impl StoreState {
    pub fn new(config: StoreConfig) -> Self {
        Self {
            running: AtomicBool::new(false),
            config,
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Mark the loop as running until the guard drops.
    pub fn start(&self) -> QuillResult<RunningGuard<'_>> {
        self.running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| QuillError::AlreadyRunning)?;
        Ok(RunningGuard { state: self })
    }
}

/// Clears the running flag on drop.
#[derive(Debug)]
pub struct RunningGuard<'a> {
    state: &'a StoreState,
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.state.running.store(false, Ordering::SeqCst);
    }
}

/// One correction phase, e.g. a grammar checker or a language model.
pub trait Corrector {
    fn name(&self) -> &str;

    /// False when the record already holds everything this phase produces.
    fn needs_work(&self, record: &CorrectionRecord) -> bool;

    /// Mutate the session's record, checkpointing after each unit of work.
    fn process(&mut self, session: &mut CorrectionSession<'_>) -> QuillResult<()>;
}

/// A record being worked on by one phase.
pub struct CorrectionSession<'a> {
    repo: &'a CorrectionRepository,
    path: String,
    /// Blob of `path` at `pass_head`; every checkpoint is written for it.
    spellcheck_id: Oid,
    record: CorrectionRecord,
    pass_head: Oid,
    since: Instant,
}

impl<'a> CorrectionSession<'a> {
    /// Open a session on `path` as it is in `pass_head`.
    pub fn new(
        repo: &'a CorrectionRepository,
        path: &str,
        record: CorrectionRecord,
        pass_head: Oid,
    ) -> QuillResult<Self> {
        let spellcheck_id = repo
            .store()
            .blob_at_path(pass_head, path)?
            .ok_or_else(|| QuillError::ObjectNotFound(format!("'{path}' in {pass_head}")))?;
        Ok(Self {
            repo,
            path: path.to_string(),
            spellcheck_id,
            record,
            pass_head,
            since: Instant::now(),
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn spellcheck_id(&self) -> Oid {
        self.spellcheck_id
    }

    pub fn repository(&self) -> &'a CorrectionRepository {
        self.repo
    }

    pub fn record(&self) -> &CorrectionRecord {
        &self.record
    }

    pub fn record_mut(&mut self) -> &mut CorrectionRecord {
        &mut self.record
    }

    /// Commit the record for the session's blob, then fail with
    /// `HeadMoved` if the branch moved.
    pub fn checkpoint(&mut self) -> QuillResult<Oid> {
        let elapsed = u64::try_from(self.since.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.record.time_spent_ms = self.record.time_spent_ms.saturating_add(elapsed);
        self.since = Instant::now();

        let commit = self.repo.correct_blob(
            &self.path,
            self.spellcheck_id,
            &self.record,
            None,
            WriteMode::FileChange,
        )?;
        self.ensure_head()?;
        Ok(commit)
    }

    /// `HeadMoved` unless the branch still points where the pass started.
    pub fn ensure_head(&self) -> QuillResult<()> {
        if self.repo.head()? != self.pass_head {
            return Err(QuillError::HeadMoved);
        }
        Ok(())
    }
}

/// Summary of one pass.
#[derive(Debug, Clone)]
pub struct PassReport {
    pub sync: SyncReport,
    /// Files matching the path filter, in processing order.
    pub files: Vec<String>,
    /// `(path, phase)` for every phase that ran, in execution order.
    pub processed: Vec<(String, String)>,
}

/// The pass loop over one repository.
pub struct BackgroundLoop<'a> {
    state: &'a StoreState,
    repo: &'a CorrectionRepository,
    phases: Vec<Box<dyn Corrector + 'a>>,
}

impl<'a> BackgroundLoop<'a> {
    pub fn new(state: &'a StoreState, repo: &'a CorrectionRepository) -> Self {
        Self {
            state,
            repo,
            phases: Vec::new(),
        }
    }

    /// Append a phase; phases run in the order they were added.
    pub fn with_phase<C: Corrector + 'a>(mut self, phase: C) -> Self {
        self.phases.push(Box::new(phase));
        self
    }

    /// Run passes until `max_passes` is reached, or forever without a limit.
    pub fn run(&mut self, max_passes: Option<usize>) -> QuillResult<()> {
        let (state, repo) = (self.state, self.repo);
        let _running = state.start()?;
        let _lock = StoreLock::try_acquire(repo.store().git_dir())?;
        tracing::info!(phases = self.phases.len(), ?max_passes, "background loop started");

        let mut passes = 0usize;
        loop {
            if max_passes.is_some_and(|max| passes >= max) {
                tracing::info!(passes, "background loop finished");
                return Ok(());
            }
            passes += 1;

            let delay = match self.run_once() {
                Ok(report) => {
                    tracing::info!(
                        pass = passes,
                        files = report.files.len(),
                        processed = report.processed.len(),
                        "pass complete"
                    );
                    state.config().idle_delay()
                }
                Err(QuillError::HeadMoved) => {
                    tracing::info!(pass = passes, "branch moved during pass, restarting");
                    continue;
                }
                Err(e) => {
                    tracing::error!(pass = passes, error = %e, "pass failed");
                    state.config().error_delay()
                }
            };

            if !max_passes.is_some_and(|max| passes >= max) {
                sleep(delay);
            }
        }
    }

    /// One pass: sync, select, order, then each phase over every file.
    pub fn run_once(&mut self) -> QuillResult<PassReport> {
        let repo = self.repo;
        let sync = SyncDriver::new(repo).sync()?;
        let pass_head = repo.head()?;
        let files = self.select_files()?;

        let mut processed = Vec::new();
        for phase in self.phases.iter_mut() {
            for path in &files {
                if repo.head()? != pass_head {
                    return Err(QuillError::HeadMoved);
                }
                // Re-read so a phase sees what earlier phases committed.
                let record = repo.get_or_create_metadata(path)?;
                if !phase.needs_work(&record) {
                    continue;
                }
                tracing::debug!(path = %path, phase = phase.name(), "running phase");
                let mut session = CorrectionSession::new(repo, path, record, pass_head)?;
                phase.process(&mut session)?;
                processed.push((path.clone(), phase.name().to_string()));
            }
        }
        if repo.head()? != pass_head {
            return Err(QuillError::HeadMoved);
        }

        Ok(PassReport {
            sync,
            files,
            processed,
        })
    }

    /// Tracked files matching the path filter, most recently corrected
    /// first and never-corrected last, ties by path.
    fn select_files(&self) -> QuillResult<Vec<String>> {
        let config = self.state.config();
        let filter = config.path_regex()?;
        let mut ranked = Vec::new();
        for entry in self.repo.list_files()? {
            if entry.path == config.dictionary_path || !filter.is_match(&entry.path) {
                continue;
            }
            let depth = self.repo.latest_correction_depth(&entry.path)?;
            ranked.push((depth.is_none(), depth.unwrap_or(0), entry.path));
        }
        ranked.sort();
        Ok(ranked.into_iter().map(|(_, _, path)| path).collect())
    }
}

fn sleep(delay: Duration) {
    if !delay.is_zero() {
        std::thread::sleep(delay);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{Judgment, JudgmentText};
    use crate::object::ObjectCache;
    use crate::repo::tests::{commit_file, init_git, test_config};
    use crate::repo::{local_ref, CommitDetails, CorrectionQuery};
    use std::cell::RefCell;
    use std::rc::Rc;
    use tempfile::TempDir;

    /// Gives every paragraph a judgment from `model`, checkpointing each one.
    struct EchoModel {
        model: String,
        log: Rc<RefCell<Vec<String>>>,
    }

    impl Corrector for EchoModel {
        fn name(&self) -> &str {
            &self.model
        }

        fn needs_work(&self, record: &CorrectionRecord) -> bool {
            record
                .paragraph_info
                .iter()
                .any(|p| !p.judgment.contains_key(&self.model))
        }

        fn process(&mut self, session: &mut CorrectionSession<'_>) -> QuillResult<()> {
            self.log.borrow_mut().push(session.path().to_string());
            for i in 0..session.record().paragraph_info.len() {
                let paragraph = &mut session.record_mut().paragraph_info[i];
                let correction = paragraph.original.to_uppercase();
                paragraph.judgment.insert(
                    self.model.clone(),
                    Judgment {
                        score: 5.0,
                        text: JudgmentText {
                            correction,
                            alternative: Default::default(),
                        },
                        ..Default::default()
                    },
                );
                session.checkpoint()?;
            }
            Ok(())
        }
    }

    /// Edits the branch mid-pass.
    struct Meddler;

    impl Corrector for Meddler {
        fn name(&self) -> &str {
            "meddler"
        }

        fn needs_work(&self, _record: &CorrectionRecord) -> bool {
            true
        }

        fn process(&mut self, session: &mut CorrectionSession<'_>) -> QuillResult<()> {
            session
                .repository()
                .set_text("notes.txt", "moved", &CommitDetails::message("meddle"))?;
            session.checkpoint()?;
            Ok(())
        }
    }

    /// Records `(phase, path)` and marks every paragraph with one checkpoint.
    struct Stamp {
        phase: &'static str,
        log: Rc<RefCell<Vec<(String, String)>>>,
    }

    impl Corrector for Stamp {
        fn name(&self) -> &str {
            self.phase
        }

        fn needs_work(&self, record: &CorrectionRecord) -> bool {
            record
                .paragraph_info
                .iter()
                .any(|p| !p.judgment.contains_key(self.phase))
        }

        fn process(&mut self, session: &mut CorrectionSession<'_>) -> QuillResult<()> {
            self.log
                .borrow_mut()
                .push((self.phase.to_string(), session.path().to_string()));
            for paragraph in &mut session.record_mut().paragraph_info {
                paragraph.judgment.insert(self.phase.to_string(), Judgment::default());
            }
            session.checkpoint()?;
            Ok(())
        }
    }

    fn quiet_config() -> StoreConfig {
        StoreConfig {
            idle_delay_secs: 0,
            error_delay_secs: 0,
            ..test_config()
        }
    }

    fn setup() -> (TempDir, git2::Repository, CorrectionRepository) {
        let tmp = TempDir::new().unwrap();
        let git = init_git(tmp.path());
        commit_file(&git, "story/a.md", "Eins.\n\nZwei.", "a");
        commit_file(&git, "story/b.md", "Drei.", "b");
        commit_file(&git, "notes.txt", "not tracked", "notes");
        let repo = CorrectionRepository::open(tmp.path(), &quiet_config()).unwrap();
        (tmp, git, repo)
    }

    fn echo(log: &Rc<RefCell<Vec<String>>>) -> EchoModel {
        EchoModel {
            model: "echo".into(),
            log: log.clone(),
        }
    }

    #[test]
    fn test_start_twice_is_already_running() {
        let state = StoreState::new(quiet_config());
        let guard = state.start().unwrap();
        assert!(state.is_running());
        assert!(matches!(state.start(), Err(QuillError::AlreadyRunning)));
        drop(guard);
        assert!(!state.is_running());
        state.start().unwrap();
    }

    #[test]
    fn test_run_refuses_while_running() {
        let (_tmp, _git, repo) = setup();
        let state = StoreState::new(quiet_config());
        let _guard = state.start().unwrap();
        let mut background = BackgroundLoop::new(&state, &repo);
        assert!(matches!(background.run(Some(1)), Err(QuillError::AlreadyRunning)));
    }

    #[test]
    fn test_run_refuses_when_store_locked() {
        let (_tmp, _git, repo) = setup();
        let _other = StoreLock::try_acquire(repo.store().git_dir()).unwrap();
        let state = StoreState::new(quiet_config());
        let mut background = BackgroundLoop::new(&state, &repo);
        assert!(matches!(background.run(Some(1)), Err(QuillError::AlreadyRunning)));
        assert!(!state.is_running());
    }

    #[test]
    fn test_pass_corrects_filtered_files() {
        let (_tmp, _git, repo) = setup();
        let state = StoreState::new(quiet_config());
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut background = BackgroundLoop::new(&state, &repo).with_phase(echo(&log));

        let report = background.run_once().unwrap();
        assert_eq!(report.files, vec!["story/a.md", "story/b.md"]);
        assert_eq!(report.processed.len(), 2);
        assert!(repo.has_correction("story/a.md", 0).unwrap());
        assert!(!repo.has_correction("notes.txt", 0).unwrap());

        let record = repo.try_get_correction("story/a.md").unwrap().unwrap();
        assert_eq!(record.flatten().unwrap(), "EINS.\n\nZWEI.");
        let tip = repo.correction_oid("story/a.md", 0).unwrap().unwrap();
        let message = repo.store().read_commit(tip).unwrap().message;
        assert!(message.starts_with("Correct story/a.md 2/2 "));

        // Nothing left to do on the second pass.
        let again = background.run_once().unwrap();
        assert!(again.processed.is_empty());
    }

    #[test]
    fn test_recently_corrected_files_come_first() {
        let (_tmp, git, repo) = setup();
        let record = repo.get_or_create_metadata("story/b.md").unwrap();
        repo.correct_text("story/b.md", &record, None, WriteMode::FileChange).unwrap();
        commit_file(&git, "story/c.md", "Vier.", "c");

        let state = StoreState::new(quiet_config());
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut background = BackgroundLoop::new(&state, &repo).with_phase(echo(&log));
        let report = background.run_once().unwrap();
        assert_eq!(report.files, vec!["story/b.md", "story/a.md", "story/c.md"]);
        assert_eq!(*log.borrow(), report.files);
    }

    #[test]
    fn test_head_guard_restarts_pass() {
        let (_tmp, _git, repo) = setup();
        let state = StoreState::new(quiet_config());
        let mut background = BackgroundLoop::new(&state, &repo).with_phase(Meddler);
        assert!(matches!(background.run_once(), Err(QuillError::HeadMoved)));
    }

    #[test]
    fn test_each_phase_covers_all_files_before_the_next() {
        let (_tmp, _git, repo) = setup();
        let state = StoreState::new(quiet_config());
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut background = BackgroundLoop::new(&state, &repo)
            .with_phase(Stamp { phase: "grammar", log: log.clone() })
            .with_phase(Stamp { phase: "model", log: log.clone() });

        let report = background.run_once().unwrap();
        let expected: Vec<(String, String)> = [
            ("grammar", "story/a.md"),
            ("grammar", "story/b.md"),
            ("model", "story/a.md"),
            ("model", "story/b.md"),
        ]
        .iter()
        .map(|(phase, path)| (phase.to_string(), path.to_string()))
        .collect();
        assert_eq!(*log.borrow(), expected);
        let processed: Vec<(String, String)> =
            report.processed.iter().map(|(path, phase)| (phase.clone(), path.clone())).collect();
        assert_eq!(processed, expected);

        // The model phase built on what the grammar phase committed.
        let record = repo.try_get_correction("story/a.md").unwrap().unwrap();
        assert!(record.paragraph_info[0].judgment.contains_key("grammar"));
        assert!(record.paragraph_info[0].judgment.contains_key("model"));
    }

    #[test]
    fn test_checkpoint_after_own_file_changed_keeps_old_blob() {
        let (_tmp, _git, repo) = setup();
        let head = repo.head().unwrap();
        let old_id = repo.spellcheck_id("story/a.md").unwrap();
        let record = repo.get_or_create_metadata("story/a.md").unwrap();
        let mut session = CorrectionSession::new(&repo, "story/a.md", record, head).unwrap();
        assert_eq!(session.spellcheck_id(), old_id);

        repo.set_text("story/a.md", "Ganz anders.", &CommitDetails::message("rewrite"))
            .unwrap();
        assert!(matches!(session.checkpoint(), Err(QuillError::HeadMoved)));

        let new_id = repo.spellcheck_id("story/a.md").unwrap();
        assert!(repo.store().resolve_ref(&local_ref(new_id)).unwrap().is_none());

        let mut cache = ObjectCache::new();
        let stored = repo
            .get_correction(&CorrectionQuery::spellcheck_id(old_id), &mut cache)
            .unwrap();
        let originals: Vec<&str> = stored.paragraph_info.iter().map(|p| p.original.as_str()).collect();
        assert_eq!(originals, vec!["Eins.", "Zwei."]);
    }

    #[test]
    fn test_bounded_run_executes_passes() {
        let (_tmp, _git, repo) = setup();
        let state = StoreState::new(quiet_config());
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut background = BackgroundLoop::new(&state, &repo).with_phase(echo(&log));
        background.run(Some(2)).unwrap();
        assert_eq!(log.borrow().len(), 2);
        assert!(!state.is_running());
    }

    #[test]
    fn test_checkpoint_accumulates_time() {
        let (_tmp, _git, repo) = setup();
        let head = repo.head().unwrap();
        let record = repo.get_or_create_metadata("story/b.md").unwrap();
        let mut session = CorrectionSession::new(&repo, "story/b.md", record, head).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        session.checkpoint().unwrap();
        assert!(session.record().time_spent_ms >= 5);
        session.ensure_head().unwrap();
    }
}
