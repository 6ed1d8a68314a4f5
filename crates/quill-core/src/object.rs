//! Object store adapter — thin wrapper over git plumbing.
//!
//! Every operation maps onto one libgit2 primitive. There is no policy
//! here: no retries, no merging, no ref naming conventions. Absence that
//! callers routinely expect (a missing ref, no merge base) is `None`;
//! everything else is an error.

use std::cell::RefCell;
use std::collections::HashMap;
use std::path::Path;

use chrono::{DateTime, TimeZone, Utc};
use git2::{
    Cred, ErrorCode, FetchOptions, ObjectType, Oid, PushOptions, RemoteCallbacks,
    Repository, Signature,
};
use serde::{Deserialize, Serialize};

use crate::error::{QuillError, QuillResult};

/// File mode for regular blobs.
pub const MODE_BLOB: i32 = 0o100644;
/// File mode for subtrees.
pub const MODE_TREE: i32 = 0o040000;

/// A person or bot that authors commits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub name: String,
    pub email: String,
}

impl Identity {
    pub fn new(name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            email: email.into(),
        }
    }

    fn signature(&self) -> QuillResult<Signature<'static>> {
        Ok(Signature::now(&self.name, &self.email)?)
    }
}

/// Kind of object a tree entry points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Blob,
    Tree,
    /// Submodule link or anything else we never descend into.
    Other,
}

/// One entry of a git tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeEntry {
    pub name: String,
    pub oid: Oid,
    pub kind: EntryKind,
    pub mode: i32,
}

impl TreeEntry {
    pub fn blob(name: impl Into<String>, oid: Oid) -> Self {
        Self {
            name: name.into(),
            oid,
            kind: EntryKind::Blob,
            mode: MODE_BLOB,
        }
    }

    pub fn tree(name: impl Into<String>, oid: Oid) -> Self {
        Self {
            name: name.into(),
            oid,
            kind: EntryKind::Tree,
            mode: MODE_TREE,
        }
    }
}

/// Parsed commit.
#[derive(Debug, Clone, PartialEq)]
pub struct CommitInfo {
    pub oid: Oid,
    pub tree: Oid,
    pub parents: Vec<Oid>,
    pub message: String,
    pub author: Identity,
    pub time: DateTime<Utc>,
}

/// Everything needed to write a commit.
#[derive(Debug, Clone)]
pub struct CommitSpec {
    pub message: String,
    pub tree: Oid,
    pub parents: Vec<Oid>,
    pub author: Identity,
    pub committer: Identity,
}

/// Per-batch memo of parsed objects.
///
/// Threaded through one logical operation (a depth walk, a sync pass) to
/// avoid re-reading the same commits and blobs. Nothing in it outlives the
/// batch; refs are never cached.
#[derive(Debug, Default)]
pub struct ObjectCache {
    blobs: HashMap<Oid, Vec<u8>>,
    commits: HashMap<Oid, CommitInfo>,
    paths: HashMap<(Oid, String), Option<Oid>>,
}

impl ObjectCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn blob(&mut self, store: &ObjectStore, oid: Oid) -> QuillResult<Vec<u8>> {
        if let Some(data) = self.blobs.get(&oid) {
            return Ok(data.clone());
        }
        let data = store.read_blob(oid)?;
        self.blobs.insert(oid, data.clone());
        Ok(data)
    }

    pub fn commit(&mut self, store: &ObjectStore, oid: Oid) -> QuillResult<CommitInfo> {
        if let Some(info) = self.commits.get(&oid) {
            return Ok(info.clone());
        }
        let info = store.read_commit(oid)?;
        self.commits.insert(oid, info.clone());
        Ok(info)
    }

    pub fn blob_at_path(
        &mut self,
        store: &ObjectStore,
        commit: Oid,
        path: &str,
    ) -> QuillResult<Option<Oid>> {
        let key = (commit, path.to_string());
        if let Some(found) = self.paths.get(&key) {
            return Ok(*found);
        }
        let found = store.blob_at_path(commit, path)?;
        self.paths.insert(key, found);
        Ok(found)
    }
}

/// Reject paths that cannot name a blob inside a tree.
pub fn validate_path(path: &str) -> QuillResult<()> {
    if path.is_empty()
        || path.starts_with('/')
        || path.ends_with('/')
        || path.split('/').any(|seg| seg.is_empty() || seg == "." || seg == "..")
    {
        return Err(QuillError::InvalidPath(path.to_string()));
    }
    Ok(())
}

/// The git object database plus the remote it syncs with.
pub struct ObjectStore {
    repo: Repository,
    remote: String,
    token: Option<String>,
}

impl ObjectStore {
    /// Open the repository at `path`.
    pub fn open(path: &Path, remote: &str, token: Option<String>) -> QuillResult<Self> {
        let repo = Repository::open(path)
            .map_err(|_| QuillError::NotARepo(path.display().to_string()))?;
        Ok(Self {
            repo,
            remote: remote.to_string(),
            token,
        })
    }

    /// Clone `url` into `path`, checking out `branch`.
    pub fn clone_from(
        url: &str,
        path: &Path,
        branch: &str,
        remote: &str,
        token: Option<String>,
    ) -> QuillResult<Self> {
        let mut fo = FetchOptions::new();
        fo.remote_callbacks(credential_callbacks(token.clone(), None));
        let remote_name = remote.to_string();
        let repo = git2::build::RepoBuilder::new()
            .branch(branch)
            .fetch_options(fo)
            .remote_create(move |repo, _name, url| repo.remote(&remote_name, url))
            .clone(url, path)
            .map_err(|e| QuillError::Network(format!("clone {url}: {}", e.message())))?;
        Ok(Self {
            repo,
            remote: remote.to_string(),
            token,
        })
    }

    /// Wrap an already opened repository.
    pub fn from_repository(repo: Repository, remote: &str, token: Option<String>) -> Self {
        Self {
            repo,
            remote: remote.to_string(),
            token,
        }
    }

    /// The `.git` directory (or the bare repository root).
    pub fn git_dir(&self) -> &Path {
        self.repo.path()
    }

    pub fn remote_name(&self) -> &str {
        &self.remote
    }

    // --- Blobs ---

    pub fn read_blob(&self, oid: Oid) -> QuillResult<Vec<u8>> {
        let blob = self
            .repo
            .find_blob(oid)
            .map_err(|_| QuillError::ObjectNotFound(format!("blob {oid}")))?;
        Ok(blob.content().to_vec())
    }

    pub fn write_blob(&self, data: &[u8]) -> QuillResult<Oid> {
        Ok(self.repo.blob(data)?)
    }

    /// The OID `data` would get as a blob, without writing it.
    pub fn hash_blob(data: &[u8]) -> QuillResult<Oid> {
        Ok(Oid::hash_object(ObjectType::Blob, data)?)
    }

    // --- Trees ---

    pub fn read_tree(&self, oid: Oid) -> QuillResult<Vec<TreeEntry>> {
        let tree = self
            .repo
            .find_tree(oid)
            .map_err(|_| QuillError::ObjectNotFound(format!("tree {oid}")))?;
        Ok(tree
            .iter()
            .map(|entry| TreeEntry {
                name: entry.name().unwrap_or("").to_string(),
                oid: entry.id(),
                kind: match entry.kind() {
                    Some(ObjectType::Blob) => EntryKind::Blob,
                    Some(ObjectType::Tree) => EntryKind::Tree,
                    _ => EntryKind::Other,
                },
                mode: entry.filemode(),
            })
            .collect())
    }

    pub fn write_tree(&self, entries: &[TreeEntry]) -> QuillResult<Oid> {
        let mut builder = self.repo.treebuilder(None)?;
        for entry in entries {
            builder.insert(&entry.name, entry.oid, entry.mode)?;
        }
        Ok(builder.write()?)
    }

    /// Blob OID at `path` inside the tree of `commit`, if there is one.
    pub fn blob_at_path(&self, commit: Oid, path: &str) -> QuillResult<Option<Oid>> {
        validate_path(path)?;
        let commit = self
            .repo
            .find_commit(commit)
            .map_err(|_| QuillError::ObjectNotFound(format!("commit {commit}")))?;
        let tree = commit.tree()?;
        match tree.get_path(Path::new(path)) {
            Ok(entry) if entry.kind() == Some(ObjectType::Blob) => Ok(Some(entry.id())),
            Ok(_) => Ok(None),
            Err(e) if e.code() == ErrorCode::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Every blob path reachable from the tree of `commit`, sorted.
    pub fn list_files(&self, commit: Oid) -> QuillResult<Vec<String>> {
        let tree = self.repo.find_commit(commit)?.tree()?;
        let mut files = Vec::new();
        tree.walk(git2::TreeWalkMode::PreOrder, |root, entry| {
            if entry.kind() == Some(ObjectType::Blob) {
                if let Some(name) = entry.name() {
                    files.push(format!("{root}{name}"));
                }
            }
            git2::TreeWalkResult::Ok
        })?;
        files.sort();
        Ok(files)
    }

    // --- Commits ---

    pub fn read_commit(&self, oid: Oid) -> QuillResult<CommitInfo> {
        let commit = self
            .repo
            .find_commit(oid)
            .map_err(|_| QuillError::ObjectNotFound(format!("commit {oid}")))?;
        let author = commit.author();
        let time = Utc
            .timestamp_opt(commit.time().seconds(), 0)
            .single()
            .unwrap_or_else(Utc::now);
        Ok(CommitInfo {
            oid,
            tree: commit.tree_id(),
            parents: commit.parent_ids().collect(),
            message: commit.message().unwrap_or("").to_string(),
            author: Identity::new(author.name().unwrap_or(""), author.email().unwrap_or("")),
            time,
        })
    }

    pub fn write_commit(&self, spec: &CommitSpec) -> QuillResult<Oid> {
        let tree = self.repo.find_tree(spec.tree)?;
        let parents = spec
            .parents
            .iter()
            .map(|oid| self.repo.find_commit(*oid))
            .collect::<Result<Vec<_>, _>>()?;
        let parent_refs: Vec<&git2::Commit> = parents.iter().collect();
        let author = spec.author.signature()?;
        let committer = spec.committer.signature()?;
        Ok(self
            .repo
            .commit(None, &author, &committer, &spec.message, &tree, &parent_refs)?)
    }

    pub fn first_parent(&self, commit: Oid) -> QuillResult<Option<Oid>> {
        Ok(self.read_commit(commit)?.parents.first().copied())
    }

    /// True if `descendant` has `ancestor` in its history.
    pub fn is_descendant(&self, descendant: Oid, ancestor: Oid) -> QuillResult<bool> {
        Ok(self.repo.graph_descendant_of(descendant, ancestor)?)
    }

    pub fn find_merge_base(&self, a: Oid, b: Oid) -> QuillResult<Option<Oid>> {
        match self.repo.merge_base(a, b) {
            Ok(oid) => Ok(Some(oid)),
            Err(e) if e.code() == ErrorCode::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    // --- Refs ---

    pub fn resolve_ref(&self, name: &str) -> QuillResult<Option<Oid>> {
        match self.repo.refname_to_id(name) {
            Ok(oid) => Ok(Some(oid)),
            Err(e) if e.code() == ErrorCode::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Point `name` at `oid`. Without `force` the ref must not exist yet.
    pub fn write_ref(&self, name: &str, oid: Oid, force: bool) -> QuillResult<()> {
        match self.repo.reference(name, oid, force, "quill: update ref") {
            Ok(_) => Ok(()),
            Err(e) if e.code() == ErrorCode::Exists => Err(QuillError::RefMoved {
                name: name.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    /// Compare-and-swap: move `name` to `oid` only if it still points at
    /// `expected`.
    pub fn update_ref(&self, name: &str, oid: Oid, expected: Oid) -> QuillResult<()> {
        match self
            .repo
            .reference_matching(name, oid, true, expected, "quill: advance ref")
        {
            Ok(_) => Ok(()),
            Err(e) if e.code() == ErrorCode::Modified || e.code() == ErrorCode::NotFound => {
                Err(QuillError::RefMoved {
                    name: name.to_string(),
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// `(name, target)` of every direct ref under `prefix`, sorted by name.
    pub fn list_refs(&self, prefix: &str) -> QuillResult<Vec<(String, Oid)>> {
        let mut refs = Vec::new();
        for reference in self.repo.references_glob(&format!("{prefix}*"))? {
            let reference = reference?;
            if let (Some(name), Some(target)) = (reference.name(), reference.target()) {
                refs.push((name.to_string(), target));
            }
        }
        refs.sort();
        Ok(refs)
    }

    /// Refresh the working tree after a ref under HEAD moved.
    pub fn checkout_head(&self) -> QuillResult<()> {
        if self.repo.is_bare() {
            return Ok(());
        }
        let mut builder = git2::build::CheckoutBuilder::new();
        builder.force();
        self.repo.checkout_head(Some(&mut builder))?;
        Ok(())
    }

    // --- Network ---

    pub fn has_remote(&self) -> bool {
        self.repo.find_remote(&self.remote).is_ok()
    }

    /// Configure the remote URL, creating the remote when missing.
    pub fn ensure_remote(&self, url: &str) -> QuillResult<()> {
        match self.repo.find_remote(&self.remote) {
            Ok(existing) if existing.url() == Some(url) => Ok(()),
            Ok(_) => Ok(self.repo.remote_set_url(&self.remote, url)?),
            Err(_) => {
                self.repo.remote(&self.remote, url)?;
                Ok(())
            }
        }
    }

    pub fn fetch(&self, refspecs: &[&str]) -> QuillResult<()> {
        let mut remote = self.repo.find_remote(&self.remote)?;
        let mut fo = FetchOptions::new();
        fo.remote_callbacks(credential_callbacks(
            self.token.clone(),
            self.repo.config().ok(),
        ));
        remote
            .fetch(refspecs, Some(&mut fo), None)
            .map_err(|e| QuillError::Network(e.message().to_string()))
    }

    /// Push `local_ref` to the same name on the remote.
    pub fn push(&self, local_ref: &str, force: bool) -> QuillResult<()> {
        let refspec = if force {
            format!("+{local_ref}:{local_ref}")
        } else {
            format!("{local_ref}:{local_ref}")
        };
        let mut remote = self.repo.find_remote(&self.remote)?;
        let rejected: RefCell<Option<String>> = RefCell::new(None);
        {
            let mut callbacks =
                credential_callbacks(self.token.clone(), self.repo.config().ok());
            callbacks.push_update_reference(|_name, status| {
                if let Some(msg) = status {
                    *rejected.borrow_mut() = Some(msg.to_string());
                }
                Ok(())
            });
            let mut options = PushOptions::new();
            options.remote_callbacks(callbacks);
            remote
                .push(&[refspec.as_str()], Some(&mut options))
                .map_err(|e| push_error(local_ref, e.message()))?;
        }
        match rejected.into_inner() {
            Some(msg) => Err(push_error(local_ref, &msg)),
            None => Ok(()),
        }
    }
}

fn push_error(refname: &str, message: &str) -> QuillError {
    let msg = message.to_lowercase();
    if msg.contains("fast-forward") || msg.contains("fastforward") || msg.contains("fetch first") {
        QuillError::BranchDiverged {
            branch: refname.to_string(),
        }
    } else {
        QuillError::Network(format!("push {refname}: {message}"))
    }
}

/// Token as plaintext password first, then ssh-agent, then the credential
/// helper, then whatever libgit2 defaults to.
fn credential_callbacks<'a>(
    token: Option<String>,
    config: Option<git2::Config>,
) -> RemoteCallbacks<'a> {
    let mut callbacks = RemoteCallbacks::new();
    callbacks.credentials(move |url, username_from_url, allowed| {
        if allowed.is_user_pass_plaintext() {
            if let Some(ref token) = token {
                return Cred::userpass_plaintext(
                    username_from_url.unwrap_or("x-access-token"),
                    token,
                );
            }
        }
        if allowed.is_ssh_key() {
            if let Some(user) = username_from_url {
                return Cred::ssh_key_from_agent(user);
            }
        }
        if allowed.is_user_pass_plaintext() {
            if let Some(ref cfg) = config {
                if let Ok(cred) = Cred::credential_helper(cfg, url, username_from_url) {
                    return Ok(cred);
                }
            }
        }
        Cred::default()
    });
    callbacks
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn bot() -> Identity {
        Identity::new("Test", "test@test.com")
    }

    fn setup() -> (TempDir, ObjectStore) {
        let tmp = TempDir::new().unwrap();
        let repo = Repository::init(tmp.path()).unwrap();
        (tmp, ObjectStore::from_repository(repo, "origin", None))
    }

    fn commit_files(store: &ObjectStore, files: &[(&str, &str)], parents: Vec<Oid>) -> Oid {
        let entries: Vec<TreeEntry> = files
            .iter()
            .map(|(name, content)| TreeEntry::blob(*name, store.write_blob(content.as_bytes()).unwrap()))
            .collect();
        let tree = store.write_tree(&entries).unwrap();
        store
            .write_commit(&CommitSpec {
                message: "test".to_string(),
                tree,
                parents,
                author: bot(),
                committer: bot(),
            })
            .unwrap()
    }

    #[test]
    fn test_blob_roundtrip_matches_hash() {
        let (_tmp, store) = setup();
        let oid = store.write_blob(b"hello").unwrap();
        assert_eq!(store.read_blob(oid).unwrap(), b"hello");
        assert_eq!(ObjectStore::hash_blob(b"hello").unwrap(), oid);
    }

    #[test]
    fn test_read_missing_blob_is_not_found() {
        let (_tmp, store) = setup();
        let missing = ObjectStore::hash_blob(b"never written").unwrap();
        assert!(matches!(
            store.read_blob(missing),
            Err(QuillError::ObjectNotFound(_))
        ));
    }

    #[test]
    fn test_tree_and_commit_roundtrip() {
        let (_tmp, store) = setup();
        let c1 = commit_files(&store, &[("a.md", "one")], vec![]);
        let c2 = commit_files(&store, &[("a.md", "two"), ("b.md", "x")], vec![c1]);

        let info = store.read_commit(c2).unwrap();
        assert_eq!(info.parents, vec![c1]);
        assert_eq!(info.author, bot());
        let names: Vec<String> = store
            .read_tree(info.tree)
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, vec!["a.md", "b.md"]);
        assert_eq!(store.first_parent(c2).unwrap(), Some(c1));
        assert_eq!(store.first_parent(c1).unwrap(), None);
    }

    #[test]
    fn test_blob_at_path_nested_and_missing() {
        let (_tmp, store) = setup();
        let leaf = store.write_blob(b"deep").unwrap();
        let sub = store.write_tree(&[TreeEntry::blob("c.md", leaf)]).unwrap();
        let root = store.write_tree(&[TreeEntry::tree("story", sub)]).unwrap();
        let commit = store
            .write_commit(&CommitSpec {
                message: "nested".into(),
                tree: root,
                parents: vec![],
                author: bot(),
                committer: bot(),
            })
            .unwrap();

        assert_eq!(store.blob_at_path(commit, "story/c.md").unwrap(), Some(leaf));
        assert_eq!(store.blob_at_path(commit, "story/none.md").unwrap(), None);
        assert_eq!(store.blob_at_path(commit, "story").unwrap(), None);
        assert!(matches!(
            store.blob_at_path(commit, "/story/c.md"),
            Err(QuillError::InvalidPath(_))
        ));
        assert_eq!(store.list_files(commit).unwrap(), vec!["story/c.md"]);
    }

    #[test]
    fn test_refs_force_and_compare_and_swap() {
        let (_tmp, store) = setup();
        let c1 = commit_files(&store, &[("a", "1")], vec![]);
        let c2 = commit_files(&store, &[("a", "2")], vec![c1]);

        assert_eq!(store.resolve_ref("refs/spellcheck/x").unwrap(), None);
        store.write_ref("refs/spellcheck/x", c1, false).unwrap();
        assert!(matches!(
            store.write_ref("refs/spellcheck/x", c2, false),
            Err(QuillError::RefMoved { .. })
        ));
        store.write_ref("refs/spellcheck/x", c2, true).unwrap();
        assert_eq!(store.resolve_ref("refs/spellcheck/x").unwrap(), Some(c2));

        assert!(matches!(
            store.update_ref("refs/spellcheck/x", c1, c1),
            Err(QuillError::RefMoved { .. })
        ));
        store.update_ref("refs/spellcheck/x", c1, c2).unwrap();
        assert_eq!(store.resolve_ref("refs/spellcheck/x").unwrap(), Some(c1));

        store.write_ref("refs/spellcheck/y", c2, true).unwrap();
        let listed: Vec<String> = store
            .list_refs("refs/spellcheck/")
            .unwrap()
            .into_iter()
            .map(|(n, _)| n)
            .collect();
        assert_eq!(listed, vec!["refs/spellcheck/x", "refs/spellcheck/y"]);
    }

    #[test]
    fn test_merge_base_and_descendants() {
        let (_tmp, store) = setup();
        let base = commit_files(&store, &[("a", "0")], vec![]);
        let left = commit_files(&store, &[("a", "l")], vec![base]);
        let right = commit_files(&store, &[("a", "r")], vec![base]);
        let orphan = commit_files(&store, &[("a", "o")], vec![]);

        assert_eq!(store.find_merge_base(left, right).unwrap(), Some(base));
        assert_eq!(store.find_merge_base(left, orphan).unwrap(), None);
        assert!(store.is_descendant(left, base).unwrap());
        assert!(!store.is_descendant(left, right).unwrap());
    }

    #[test]
    fn test_cache_serves_repeated_reads() {
        let (_tmp, store) = setup();
        let commit = commit_files(&store, &[("a.md", "x")], vec![]);
        let mut cache = ObjectCache::new();
        let first = cache.blob_at_path(&store, commit, "a.md").unwrap().unwrap();
        let again = cache.blob_at_path(&store, commit, "a.md").unwrap().unwrap();
        assert_eq!(first, again);
        assert_eq!(cache.blob(&store, first).unwrap(), b"x");
        assert_eq!(cache.commit(&store, commit).unwrap().oid, commit);
    }

    #[test]
    fn test_validate_path() {
        assert!(validate_path("story/a.md").is_ok());
        assert!(validate_path("").is_err());
        assert!(validate_path("story/").is_err());
        assert!(validate_path("a//b").is_err());
        assert!(validate_path("../etc").is_err());
    }
}
