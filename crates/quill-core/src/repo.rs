//! Correction repository — the main entry point for correction data.
//!
//! Maps a tracked file to its correction record through the blob OID of the
//! file's content at the branch tip (the *spellcheck id*). Each record lives
//! on its own ref, `refs/spellcheck/<spellcheck id>`, as a chain of commits
//! whose trees hold three blobs:
//!
//! - `correction`: the flattened corrected text,
//! - `original`: the tracked blob itself,
//! - `metadata`: the record as pretty-printed JSON.
//!
//! The tracked files themselves are only touched by [`CorrectionRepository::set_text`].

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use git2::Oid;
use serde::Serialize;

use crate::config::StoreConfig;
use crate::dictionary::Dictionary;
use crate::error::{QuillError, QuillResult};
use crate::object::{validate_path, CommitSpec, EntryKind, Identity, ObjectCache, ObjectStore, TreeEntry};
use crate::paragraph;
use crate::record::CorrectionRecord;
use crate::review::{review_ref, Review, REVIEW_BLOB, REVIEW_PREFIX, TARGET_BLOB};
use crate::schema;

/// Namespace of local correction refs.
pub const SPELLCHECK_PREFIX: &str = "refs/spellcheck/";
/// Name of the flattened text blob in a correction tree.
pub const CORRECTION_BLOB: &str = "correction";
/// Name of the tracked blob in a correction tree.
pub const ORIGINAL_BLOB: &str = "original";
/// Name of the record blob in a correction tree.
pub const METADATA_BLOB: &str = "metadata";

/// How far back first-parent walks look for older corrections.
pub const HISTORY_SCAN_LIMIT: usize = 64;

/// Local correction ref for a spellcheck id.
pub fn local_ref(spellcheck_id: Oid) -> String {
    format!("{SPELLCHECK_PREFIX}{spellcheck_id}")
}

/// Remote-tracking correction ref for a spellcheck id.
pub fn remote_ref(remote: &str, spellcheck_id: Oid) -> String {
    format!("refs/remotes/{remote}/spellcheck/{spellcheck_id}")
}

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// What a correction lookup is keyed on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// A tracked path, resolved at the branch tip.
    Path(String),
    /// A blob OID directly.
    SpellcheckId(Oid),
}

/// Which side of a correction ref to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CorrectionKind {
    #[default]
    Local,
    Remote,
    /// Merge base of the local and remote refs.
    CommonParent,
}

/// A correction lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorrectionQuery {
    pub target: Target,
    pub kind: CorrectionKind,
    /// First-parent steps back along the correction chain.
    pub depth: usize,
}

impl CorrectionQuery {
    pub fn path(path: impl Into<String>) -> Self {
        Self {
            target: Target::Path(path.into()),
            kind: CorrectionKind::Local,
            depth: 0,
        }
    }

    pub fn spellcheck_id(oid: Oid) -> Self {
        Self {
            target: Target::SpellcheckId(oid),
            kind: CorrectionKind::Local,
            depth: 0,
        }
    }

    pub fn kind(mut self, kind: CorrectionKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn depth(mut self, depth: usize) -> Self {
        self.depth = depth;
        self
    }
}

/// Parentage of a correction commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Continue the local chain (or start it on the branch tip).
    FileChange,
    /// Join the local and remote chains.
    Merge,
}

/// Caller-supplied commit metadata for user-initiated writes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitDetails {
    pub message: Option<String>,
    pub author: Option<Identity>,
    pub committer: Option<Identity>,
}

impl CommitDetails {
    pub fn message(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Default::default()
        }
    }
}

/// The three blobs of a correction commit.
#[derive(Debug, Clone, PartialEq)]
pub struct CorrectionFiles {
    pub correction: String,
    pub original: String,
    pub metadata: CorrectionRecord,
}

/// Emitted after every correction commit.
#[derive(Debug, Clone)]
pub struct CorrectionEvent {
    /// Tracked path, when the write came through a path.
    pub path: Option<String>,
    pub spellcheck_id: Oid,
    pub commit: Oid,
    pub record: CorrectionRecord,
}

/// A tracked file and whether its current content has a correction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileEntry {
    pub path: String,
    pub has_correction: bool,
}

/// The branch tip, for display.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HeadCommit {
    pub oid: String,
    pub summary: String,
    pub author: Identity,
    pub time: DateTime<Utc>,
}

type Listener = Box<dyn Fn(&CorrectionEvent) + Send>;

/// Correction records of one git repository.
pub struct CorrectionRepository {
    store: ObjectStore,
    branch: String,
    dictionary_path: String,
    bot: Identity,
    listeners: Mutex<Vec<Listener>>,
    last_event: Mutex<Option<CorrectionEvent>>,
}

impl CorrectionRepository {
    /// Open the git repository at `path`.
    pub fn open(path: &Path, config: &StoreConfig) -> QuillResult<Self> {
        let store = ObjectStore::open(path, &config.remote, config.token.clone())?;
        Self::from_store(store, config)
    }

    /// Wrap an opened store, configuring the remote URL when one is set.
    pub fn from_store(store: ObjectStore, config: &StoreConfig) -> QuillResult<Self> {
        if let Some(url) = &config.remote_url {
            store.ensure_remote(url)?;
        }
        Ok(Self {
            store,
            branch: config.branch.clone(),
            dictionary_path: config.dictionary_path.clone(),
            bot: config.bot.clone(),
            listeners: Mutex::new(Vec::new()),
            last_event: Mutex::new(None),
        })
    }

    pub fn store(&self) -> &ObjectStore {
        &self.store
    }

    pub fn branch(&self) -> &str {
        &self.branch
    }

    pub fn branch_ref(&self) -> String {
        format!("refs/heads/{}", self.branch)
    }

    /// Register a callback for every correction written.
    ///
    /// The most recent event, if any, is delivered right away.
    pub fn subscribe<F>(&self, listener: F)
    where
        F: Fn(&CorrectionEvent) + Send + 'static,
    {
        if let Ok(mut listeners) = self.listeners.lock() {
            if let Ok(last) = self.last_event.lock() {
                if let Some(event) = last.as_ref() {
                    listener(event);
                }
            }
            listeners.push(Box::new(listener));
        }
    }

    pub(crate) fn notify(&self, event: &CorrectionEvent) {
        if let Ok(listeners) = self.listeners.lock() {
            if let Ok(mut last) = self.last_event.lock() {
                *last = Some(event.clone());
            }
            for listener in listeners.iter() {
                listener(event);
            }
        }
    }

    // --- Addressing ---

    /// The branch tip.
    pub fn head(&self) -> QuillResult<Oid> {
        self.store
            .resolve_ref(&self.branch_ref())?
            .ok_or_else(|| QuillError::ObjectNotFound(format!("branch '{}'", self.branch)))
    }

    /// Blob OID of `path` at the branch tip.
    pub fn spellcheck_id(&self, path: &str) -> QuillResult<Oid> {
        let head = self.head()?;
        self.store
            .blob_at_path(head, path)?
            .ok_or_else(|| QuillError::ObjectNotFound(format!("'{path}' on '{}'", self.branch)))
    }

    /// Correction commit for `path` as it was `depth` commits before the tip.
    pub fn correction_oid(&self, path: &str, depth: usize) -> QuillResult<Option<Oid>> {
        let mut cache = ObjectCache::new();
        let Some(commit) = self.ancestor(self.head()?, depth, &mut cache)? else {
            return Ok(None);
        };
        match cache.blob_at_path(&self.store, commit, path)? {
            Some(blob) => self.store.resolve_ref(&local_ref(blob)),
            None => Ok(None),
        }
    }

    pub fn has_correction(&self, path: &str, depth: usize) -> QuillResult<bool> {
        Ok(self.correction_oid(path, depth)?.is_some())
    }

    /// Smallest `d` for which [`has_correction`](Self::has_correction) holds,
    /// looking at most [`HISTORY_SCAN_LIMIT`] commits back.
    pub fn latest_correction_depth(&self, path: &str) -> QuillResult<Option<usize>> {
        let mut cache = ObjectCache::new();
        let mut current = Some(self.head()?);
        let mut depth = 0;
        while let Some(commit) = current {
            if depth > HISTORY_SCAN_LIMIT {
                break;
            }
            if let Some(blob) = cache.blob_at_path(&self.store, commit, path)? {
                if self.store.resolve_ref(&local_ref(blob))?.is_some() {
                    return Ok(Some(depth));
                }
            }
            current = cache.commit(&self.store, commit)?.parents.first().copied();
            depth += 1;
        }
        Ok(None)
    }

    /// Fewest parent edges from the tip to a commit holding `spellcheck_id`
    /// at `path`, searching breadth-first over all parents.
    pub fn shortest_commit_depth(&self, path: &str, spellcheck_id: Oid) -> QuillResult<Option<usize>> {
        let mut cache = ObjectCache::new();
        let mut queue = VecDeque::from([(self.head()?, 0usize)]);
        let mut seen = HashSet::new();
        while let Some((commit, depth)) = queue.pop_front() {
            if !seen.insert(commit) {
                continue;
            }
            if cache.blob_at_path(&self.store, commit, path)? == Some(spellcheck_id) {
                return Ok(Some(depth));
            }
            for parent in cache.commit(&self.store, commit)?.parents {
                queue.push_back((parent, depth + 1));
            }
        }
        Ok(None)
    }

    fn ancestor(&self, start: Oid, depth: usize, cache: &mut ObjectCache) -> QuillResult<Option<Oid>> {
        let mut current = start;
        for _ in 0..depth {
            match cache.commit(&self.store, current)?.parents.first() {
                Some(parent) => current = *parent,
                None => return Ok(None),
            }
        }
        Ok(Some(current))
    }

    fn resolve_target(&self, target: &Target) -> QuillResult<Oid> {
        match target {
            Target::Path(path) => self.spellcheck_id(path),
            Target::SpellcheckId(oid) => Ok(*oid),
        }
    }

    /// The correction commit a query starts from, before walking `depth`.
    fn correction_tip(&self, spellcheck_id: Oid, kind: CorrectionKind) -> QuillResult<Oid> {
        let local = local_ref(spellcheck_id);
        let remote = remote_ref(self.store.remote_name(), spellcheck_id);
        let missing = |name: &str| QuillError::ObjectNotFound(format!("ref '{name}'"));
        match kind {
            CorrectionKind::Local => self.store.resolve_ref(&local)?.ok_or_else(|| missing(&local)),
            CorrectionKind::Remote => self.store.resolve_ref(&remote)?.ok_or_else(|| missing(&remote)),
            CorrectionKind::CommonParent => {
                let l = self.store.resolve_ref(&local)?.ok_or_else(|| missing(&local))?;
                let r = self.store.resolve_ref(&remote)?.ok_or_else(|| missing(&remote))?;
                self.store.find_merge_base(l, r)?.ok_or_else(|| {
                    QuillError::ObjectNotFound(format!("merge base of '{local}' and '{remote}'"))
                })
            }
        }
    }

    // --- Reading ---

    /// Read, migrate and dictionary-filter a correction record.
    pub fn get_correction(
        &self,
        query: &CorrectionQuery,
        cache: &mut ObjectCache,
    ) -> QuillResult<CorrectionRecord> {
        let mut record = self.read_record(query, cache)?;
        self.dictionary()?.filter(&mut record);
        Ok(record)
    }

    /// Current local correction of `path`, if any.
    pub fn try_get_correction(&self, path: &str) -> QuillResult<Option<CorrectionRecord>> {
        if !self.has_correction(path, 0)? {
            return Ok(None);
        }
        let mut cache = ObjectCache::new();
        self.get_correction(&CorrectionQuery::path(path), &mut cache)
            .map(Some)
    }

    /// All three blobs of a correction commit.
    pub fn get_correction_files(
        &self,
        query: &CorrectionQuery,
        cache: &mut ObjectCache,
    ) -> QuillResult<CorrectionFiles> {
        let commit = self.query_commit(query, cache)?;
        let correction = self.blob_text(commit, CORRECTION_BLOB, cache)?;
        let original = self.blob_text(commit, ORIGINAL_BLOB, cache)?;
        let mut metadata = self.record_at(commit, cache)?;
        self.dictionary()?.filter(&mut metadata);
        Ok(CorrectionFiles {
            correction,
            original,
            metadata,
        })
    }

    /// Migrated but unfiltered record; what writers build on.
    pub(crate) fn read_record(
        &self,
        query: &CorrectionQuery,
        cache: &mut ObjectCache,
    ) -> QuillResult<CorrectionRecord> {
        let commit = self.query_commit(query, cache)?;
        self.record_at(commit, cache)
    }

    fn query_commit(&self, query: &CorrectionQuery, cache: &mut ObjectCache) -> QuillResult<Oid> {
        let spellcheck_id = self.resolve_target(&query.target)?;
        let tip = self.correction_tip(spellcheck_id, query.kind)?;
        self.ancestor(tip, query.depth, cache)?.ok_or_else(|| {
            QuillError::ObjectNotFound(format!(
                "correction {spellcheck_id} has fewer than {} ancestors",
                query.depth
            ))
        })
    }

    fn blob_text(&self, commit: Oid, name: &str, cache: &mut ObjectCache) -> QuillResult<String> {
        let oid = cache
            .blob_at_path(&self.store, commit, name)?
            .ok_or_else(|| QuillError::ObjectNotFound(format!("{name} in {commit}")))?;
        Ok(String::from_utf8_lossy(&cache.blob(&self.store, oid)?).into_owned())
    }

    pub(crate) fn record_at(&self, commit: Oid, cache: &mut ObjectCache) -> QuillResult<CorrectionRecord> {
        let oid = cache
            .blob_at_path(&self.store, commit, METADATA_BLOB)?
            .ok_or_else(|| QuillError::ObjectNotFound(format!("metadata in {commit}")))?;
        schema::parse_record(&cache.blob(&self.store, oid)?)
    }

    /// Content of `path` at the branch tip.
    pub fn get_text(&self, path: &str) -> QuillResult<String> {
        let oid = self.spellcheck_id(path)?;
        Ok(String::from_utf8_lossy(&self.store.read_blob(oid)?).into_owned())
    }

    /// The user dictionary; empty when the file does not exist yet.
    pub fn dictionary(&self) -> QuillResult<Dictionary> {
        match self.get_text(&self.dictionary_path) {
            Ok(text) => Ok(Dictionary::parse(&text)),
            Err(QuillError::ObjectNotFound(_)) => Ok(Dictionary::default()),
            Err(e) => Err(e),
        }
    }

    /// Every file at the branch tip, sorted, with its correction state.
    pub fn list_files(&self) -> QuillResult<Vec<FileEntry>> {
        let head = self.head()?;
        let mut cache = ObjectCache::new();
        let mut entries = Vec::new();
        for path in self.store.list_files(head)? {
            let has_correction = match cache.blob_at_path(&self.store, head, &path)? {
                Some(blob) => self.store.resolve_ref(&local_ref(blob))?.is_some(),
                None => false,
            };
            entries.push(FileEntry {
                path,
                has_correction,
            });
        }
        Ok(entries)
    }

    pub fn current_commit(&self) -> QuillResult<HeadCommit> {
        let info = self.store.read_commit(self.head()?)?;
        Ok(HeadCommit {
            oid: info.oid.to_string(),
            summary: info.message.lines().next().unwrap_or("").to_string(),
            author: info.author,
            time: info.time,
        })
    }

    /// The record a pass should work on for `path`.
    ///
    /// The existing correction when there is one; otherwise a fresh record
    /// for the current paragraphs, reusing entries of the newest older
    /// correction whose `original` is unchanged.
    pub fn get_or_create_metadata(&self, path: &str) -> QuillResult<CorrectionRecord> {
        let spellcheck_id = self.spellcheck_id(path)?;
        let mut cache = ObjectCache::new();
        if self.store.resolve_ref(&local_ref(spellcheck_id))?.is_some() {
            return self.read_record(&CorrectionQuery::spellcheck_id(spellcheck_id), &mut cache);
        }

        let text = String::from_utf8_lossy(&self.store.read_blob(spellcheck_id)?).into_owned();
        let mut record = CorrectionRecord::from_paragraphs(paragraph::segment(&text));

        if let Some(older) = self.newest_older_correction(path, spellcheck_id, &mut cache)? {
            let mut reusable: HashMap<&str, _> = HashMap::new();
            for entry in &older.paragraph_info {
                reusable.entry(entry.original.as_str()).or_insert(entry);
            }
            let mut reused = 0;
            for entry in &mut record.paragraph_info {
                if let Some(previous) = reusable.get(entry.original.as_str()) {
                    *entry = (*previous).clone();
                    reused += 1;
                }
            }
            tracing::debug!(path, reused, total = record.paragraph_info.len(), "seeded record from older correction");
        }
        Ok(record)
    }

    fn newest_older_correction(
        &self,
        path: &str,
        current: Oid,
        cache: &mut ObjectCache,
    ) -> QuillResult<Option<CorrectionRecord>> {
        let mut commit = self.head()?;
        for _ in 0..HISTORY_SCAN_LIMIT {
            let Some(parent) = cache.commit(&self.store, commit)?.parents.first().copied() else {
                break;
            };
            commit = parent;
            let Some(blob) = cache.blob_at_path(&self.store, commit, path)? else {
                break;
            };
            if blob == current {
                continue;
            }
            if let Some(tip) = self.store.resolve_ref(&local_ref(blob))? {
                return self.record_at(tip, cache).map(Some);
            }
        }
        Ok(None)
    }

    // --- Writing ---

    /// Commit `record` as the new correction of `path`'s current content.
    ///
    /// Force-updates the local correction ref and force-pushes it when a
    /// remote is configured. Returns the correction commit.
    pub fn correct_text(
        &self,
        path: &str,
        record: &CorrectionRecord,
        details: Option<&CommitDetails>,
        mode: WriteMode,
    ) -> QuillResult<Oid> {
        validate_path(path)?;
        let spellcheck_id = self.spellcheck_id(path)?;
        self.correct_blob(path, spellcheck_id, record, details, mode)
    }

    /// [`correct_text`](Self::correct_text) for a specific content of
    /// `path`, whether or not it is still the one at the branch tip.
    ///
    /// `record` must be aligned with that content: one entry per segmented
    /// paragraph, with matching `original` texts. Otherwise `Misaligned`
    /// and nothing is written.
    pub fn correct_blob(
        &self,
        path: &str,
        spellcheck_id: Oid,
        record: &CorrectionRecord,
        details: Option<&CommitDetails>,
        mode: WriteMode,
    ) -> QuillResult<Oid> {
        validate_path(path)?;
        self.check_alignment(spellcheck_id, record)?;

        let local = local_ref(spellcheck_id);
        let parents = match mode {
            WriteMode::FileChange => match self.store.resolve_ref(&local)? {
                Some(previous) => vec![previous],
                None => vec![self.head()?],
            },
            WriteMode::Merge => {
                let remote = remote_ref(self.store.remote_name(), spellcheck_id);
                let l = self.store.resolve_ref(&local)?;
                let r = self.store.resolve_ref(&remote)?;
                match (l, r) {
                    (Some(l), Some(r)) => vec![l, r],
                    _ => {
                        return Err(QuillError::ObjectNotFound(format!(
                            "merge of '{path}' needs both '{local}' and '{remote}'"
                        )))
                    }
                }
            }
        };

        let message = details
            .and_then(|d| d.message.clone())
            .unwrap_or_else(|| match mode {
                WriteMode::FileChange => {
                    let (done, total) = record.progress();
                    format!("Correct {path} {done}/{total} {}", record.time_spent_ms)
                }
                WriteMode::Merge => format!("Merge {path}"),
            });
        let author = details.and_then(|d| d.author.clone());
        let committer = details.and_then(|d| d.committer.clone());

        let commit = self.write_correction(spellcheck_id, record, parents, message, author, committer)?;

        if self.store.has_remote() {
            self.store.push(&local, true)?;
        }
        self.notify(&CorrectionEvent {
            path: Some(path.to_string()),
            spellcheck_id,
            commit,
            record: record.clone(),
        });
        Ok(commit)
    }

    fn check_alignment(&self, spellcheck_id: Oid, record: &CorrectionRecord) -> QuillResult<()> {
        let text = String::from_utf8_lossy(&self.store.read_blob(spellcheck_id)?).into_owned();
        let paragraphs = paragraph::segment(&text);
        if paragraphs.len() != record.paragraph_info.len() {
            return Err(QuillError::Misaligned(format!(
                "{spellcheck_id} has {} paragraphs, record has {}",
                paragraphs.len(),
                record.paragraph_info.len()
            )));
        }
        let mismatch = paragraphs
            .iter()
            .zip(&record.paragraph_info)
            .position(|(text, entry)| *text != entry.original);
        match mismatch {
            Some(i) => Err(QuillError::Misaligned(format!(
                "paragraph {i} of {spellcheck_id} differs from the record's original"
            ))),
            None => Ok(()),
        }
    }

    /// Write the correction tree and commit, and force-move the local ref.
    ///
    /// No push and no notification; callers decide both.
    pub fn write_correction(
        &self,
        spellcheck_id: Oid,
        record: &CorrectionRecord,
        parents: Vec<Oid>,
        message: String,
        author: Option<Identity>,
        committer: Option<Identity>,
    ) -> QuillResult<Oid> {
        let corrected = record.flatten()?;
        let correction_blob = self.store.write_blob(corrected.as_bytes())?;
        let metadata_blob = self.store.write_blob(&serde_json::to_vec_pretty(record)?)?;
        let tree = self.store.write_tree(&[
            TreeEntry::blob(CORRECTION_BLOB, correction_blob),
            TreeEntry::blob(METADATA_BLOB, metadata_blob),
            TreeEntry::blob(ORIGINAL_BLOB, spellcheck_id),
        ])?;

        let author = author.unwrap_or_else(|| self.bot.clone());
        let committer = committer.unwrap_or_else(|| author.clone());
        let commit = self.store.write_commit(&CommitSpec {
            message,
            tree,
            parents,
            author,
            committer,
        })?;
        self.store.write_ref(&local_ref(spellcheck_id), commit, true)?;

        let (done, total) = record.progress();
        tracing::info!(%spellcheck_id, %commit, done, total, "correction written");
        Ok(commit)
    }

    /// Replace the content of `path` on the branch with `new_text`.
    ///
    /// The branch ref only moves if it still points at the commit the
    /// rewrite was based on; otherwise `RefMoved`. Returns the new tip.
    pub fn set_text(&self, path: &str, new_text: &str, details: &CommitDetails) -> QuillResult<Oid> {
        validate_path(path)?;
        let head = self.head()?;
        let base = self.store.read_commit(head)?;

        let blob = self.store.write_blob(new_text.as_bytes())?;
        let segments: Vec<&str> = path.split('/').collect();
        let tree = self.replace_in_tree(Some(base.tree), &segments, blob, path)?;
        if tree == base.tree {
            return Ok(head);
        }

        let author = details.author.clone().unwrap_or_else(|| self.bot.clone());
        let committer = details.committer.clone().unwrap_or_else(|| author.clone());
        let commit = self.store.write_commit(&CommitSpec {
            message: details
                .message
                .clone()
                .unwrap_or_else(|| format!("Update {path}")),
            tree,
            parents: vec![head],
            author,
            committer,
        })?;

        let branch_ref = self.branch_ref();
        self.store.update_ref(&branch_ref, commit, head)?;
        self.store.checkout_head()?;
        tracing::info!(path, %commit, "text updated");

        if self.store.has_remote() {
            self.store.push(&branch_ref, false)?;
        }
        Ok(commit)
    }

    fn replace_in_tree(
        &self,
        tree: Option<Oid>,
        segments: &[&str],
        blob: Oid,
        path: &str,
    ) -> QuillResult<Oid> {
        let mut entries = match tree {
            Some(oid) => self.store.read_tree(oid)?,
            None => Vec::new(),
        };
        let (name, rest) = match segments.split_first() {
            Some(split) => split,
            None => return Err(QuillError::InvalidPath(path.to_string())),
        };
        let existing = entries.iter().position(|e| e.name == *name);

        let replacement = if rest.is_empty() {
            let mut entry = TreeEntry::blob(*name, blob);
            if let Some(i) = existing {
                if entries[i].kind != EntryKind::Blob {
                    return Err(QuillError::InvalidPath(path.to_string()));
                }
                entry.mode = entries[i].mode;
            }
            entry
        } else {
            let subtree = match existing {
                Some(i) if entries[i].kind == EntryKind::Tree => Some(entries[i].oid),
                Some(_) => return Err(QuillError::InvalidPath(path.to_string())),
                None => None,
            };
            TreeEntry::tree(*name, self.replace_in_tree(subtree, rest, blob, path)?)
        };

        match existing {
            Some(i) => entries[i] = replacement,
            None => entries.push(replacement),
        }
        self.store.write_tree(&entries)
    }

    // --- Reviews ---

    /// Store `review` for the current content of `path` and return its id.
    ///
    /// A missing id is replaced by a fresh UUID. An existing review with the
    /// same id is never overwritten (`RefMoved`).
    pub fn add_review(&self, path: &str, mut review: Review) -> QuillResult<String> {
        validate_path(path)?;
        let target = self.spellcheck_id(path)?;
        let id = review
            .id
            .take()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let name = review_ref(&id)?;
        review.id = Some(id.clone());

        let review_blob = self.store.write_blob(&serde_json::to_vec(&review)?)?;
        let tree = self.store.write_tree(&[
            TreeEntry::blob(REVIEW_BLOB, review_blob),
            TreeEntry::blob(TARGET_BLOB, target),
        ])?;
        let commit = self.store.write_commit(&CommitSpec {
            message: "Add review".to_string(),
            tree,
            parents: vec![self.head()?],
            author: self.bot.clone(),
            committer: self.bot.clone(),
        })?;
        self.store.write_ref(&name, commit, false)?;
        tracing::info!(path, id = %id, %commit, "review added");
        Ok(id)
    }

    pub fn get_review(&self, id: &str) -> QuillResult<Review> {
        let name = review_ref(id)?;
        let commit = self
            .store
            .resolve_ref(&name)?
            .ok_or_else(|| QuillError::ObjectNotFound(format!("ref '{name}'")))?;
        self.review_at(commit)
    }

    /// Every stored review, ordered by id.
    pub fn list_reviews(&self) -> QuillResult<Vec<Review>> {
        self.store
            .list_refs(REVIEW_PREFIX)?
            .into_iter()
            .map(|(_, commit)| self.review_at(commit))
            .collect()
    }

    /// Blob the review was written for.
    pub fn review_target(&self, id: &str) -> QuillResult<Oid> {
        let name = review_ref(id)?;
        let commit = self
            .store
            .resolve_ref(&name)?
            .ok_or_else(|| QuillError::ObjectNotFound(format!("ref '{name}'")))?;
        self.store
            .blob_at_path(commit, TARGET_BLOB)?
            .ok_or_else(|| QuillError::ObjectNotFound(format!("{TARGET_BLOB} in {commit}")))
    }

    fn review_at(&self, commit: Oid) -> QuillResult<Review> {
        let blob = self
            .store
            .blob_at_path(commit, REVIEW_BLOB)?
            .ok_or_else(|| QuillError::ObjectNotFound(format!("{REVIEW_BLOB} in {commit}")))?;
        Ok(serde_json::from_slice(&self.store.read_blob(blob)?)?)
    }

    /// Add `word` to the user dictionary. False when it was already there.
    pub fn add_word_to_dictionary(&self, word: &str) -> QuillResult<bool> {
        let word = word.trim();
        if word.is_empty() || word.contains('\n') {
            return Ok(false);
        }
        let current = match self.get_text(&self.dictionary_path) {
            Ok(text) => text,
            Err(QuillError::ObjectNotFound(_)) => String::new(),
            Err(e) => return Err(e),
        };
        if Dictionary::parse(&current).contains(word) {
            return Ok(false);
        }

        let mut updated = current;
        if !updated.is_empty() && !updated.ends_with('\n') {
            updated.push('\n');
        }
        updated.push_str(word);
        updated.push('\n');

        self.set_text(
            &self.dictionary_path,
            &updated,
            &CommitDetails::message(format!("Add '{word}' to dictionary")),
        )?;
        Ok(true)
    }
}
