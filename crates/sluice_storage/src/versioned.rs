//! The versioned store: repositories, branches and commits.
//!
//! Commits live in an arena keyed by ID and are never mutated after they
//! are finished. Branches are a separate map from name to head ID, plus
//! the log of commits finished on that branch, which is what
//! subscriptions replay.

use crate::commit::{BranchInfo, CommitInfo, CommitOrigin, RepoInfo};
use crate::store::ContentStore;
use crate::transfer;
use crate::tree::{FileEntry, FileTree};
use bytes::Bytes;
use sluice_core::{CommitId, CoreError, CoreResult, Timestamp};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{RwLock, watch};
use tracing::{debug, info};

#[derive(Debug)]
struct CommitRecord {
    info: CommitInfo,
    tree: FileTree,
    /// Datum outputs keyed by datum ID, merged in key order at finish
    staged: BTreeMap<String, FileTree>,
    /// Parent that was still open when this commit started. `tree` then
    /// holds only this commit's own writes until finish.
    base: Option<CommitId>,
    /// Deletions made while `base` is set, replayed onto the parent's tree
    deletions: Vec<String>,
}

#[derive(Debug, Default)]
struct BranchRecord {
    head: Option<CommitId>,
    finished: Vec<CommitId>,
}

#[derive(Debug)]
struct RepoRecord {
    created: Timestamp,
    description: String,
    branches: BTreeMap<String, BranchRecord>,
    commit_count: usize,
}

#[derive(Debug, Default)]
struct StoreState {
    repos: BTreeMap<String, RepoRecord>,
    commits: HashMap<CommitId, CommitRecord>,
}

impl StoreState {
    fn repo(&self, name: &str) -> CoreResult<&RepoRecord> {
        self.repos
            .get(name)
            .ok_or_else(|| CoreError::not_found("repo", name))
    }

    fn repo_mut(&mut self, name: &str) -> CoreResult<&mut RepoRecord> {
        self.repos
            .get_mut(name)
            .ok_or_else(|| CoreError::not_found("repo", name))
    }

    fn commit(&self, repo: &str, id: &CommitId) -> CoreResult<&CommitRecord> {
        self.repo(repo)?;
        self.commits
            .get(id)
            .filter(|c| c.info.repo == repo)
            .ok_or_else(|| CoreError::not_found("commit", format!("{}@{}", repo, id)))
    }

    fn open_commit_mut(&mut self, repo: &str, id: &CommitId) -> CoreResult<&mut CommitRecord> {
        self.repo(repo)?;
        let record = self
            .commits
            .get_mut(id)
            .filter(|c| c.info.repo == repo)
            .ok_or_else(|| CoreError::not_found("commit", format!("{}@{}", repo, id)))?;
        if record.info.is_finished() {
            return Err(CoreError::AlreadyFinished {
                commit: id.to_string(),
            });
        }
        Ok(record)
    }

    fn finished_commit(&self, repo: &str, id: &CommitId) -> CoreResult<&CommitRecord> {
        let record = self.commit(repo, id)?;
        if !record.info.is_finished() {
            return Err(CoreError::validation(
                "commit",
                format!("commit {} is still open", id),
            ));
        }
        Ok(record)
    }
}

fn validate_name(kind: &str, name: &str) -> CoreResult<()> {
    if name.is_empty()
        || !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(CoreError::validation(
            kind,
            format!("{:?} must be non-empty and use only [A-Za-z0-9_-]", name),
        ));
    }
    Ok(())
}

/// Versioned commit/branch store
#[derive(Debug, Clone)]
pub struct VersionedStore {
    content: Arc<ContentStore>,
    state: Arc<RwLock<StoreState>>,
    /// Bumped on every finished commit
    finish_tx: Arc<watch::Sender<u64>>,
}

impl VersionedStore {
    /// Create a store over a content store
    #[must_use]
    pub fn new(content: Arc<ContentStore>) -> Self {
        let (finish_tx, _) = watch::channel(0);
        Self {
            content,
            state: Arc::new(RwLock::new(StoreState::default())),
            finish_tx: Arc::new(finish_tx),
        }
    }

    /// Create a store with a fresh default content store
    #[must_use]
    pub fn in_memory() -> Self {
        Self::new(Arc::new(ContentStore::new()))
    }

    /// Get the underlying content store
    #[must_use]
    pub fn content(&self) -> &Arc<ContentStore> {
        &self.content
    }

    /// Create a repository
    ///
    /// # Errors
    ///
    /// Returns error if the name is invalid or already taken
    pub async fn create_repo(&self, name: &str, description: &str) -> CoreResult<RepoInfo> {
        validate_name("repo", name)?;
        let mut state = self.state.write().await;
        if state.repos.contains_key(name) {
            return Err(CoreError::already_exists("repo", name));
        }
        let record = RepoRecord {
            created: Timestamp::now(),
            description: description.to_string(),
            branches: BTreeMap::new(),
            commit_count: 0,
        };
        let info = repo_info(name, &record);
        state.repos.insert(name.to_string(), record);
        info!(repo = %name, "created repo");
        Ok(info)
    }

    /// Inspect a repository
    ///
    /// # Errors
    ///
    /// Returns error if the repository does not exist
    pub async fn inspect_repo(&self, name: &str) -> CoreResult<RepoInfo> {
        let state = self.state.read().await;
        Ok(repo_info(name, state.repo(name)?))
    }

    /// List all repositories in name order
    pub async fn list_repo(&self) -> Vec<RepoInfo> {
        let state = self.state.read().await;
        state
            .repos
            .iter()
            .map(|(name, record)| repo_info(name, record))
            .collect()
    }

    /// Create a branch, optionally pointing at an existing commit
    ///
    /// # Errors
    ///
    /// Returns error if the repo or head commit is missing, or the branch
    /// already exists
    pub async fn create_branch(
        &self,
        repo: &str,
        branch: &str,
        head: Option<CommitId>,
    ) -> CoreResult<BranchInfo> {
        validate_name("branch", branch)?;
        let mut state = self.state.write().await;
        let mut finished = Vec::new();
        if let Some(id) = head {
            if state.commit(repo, &id)?.info.is_finished() {
                finished.push(id);
            }
        }
        let record = state.repo_mut(repo)?;
        if record.branches.contains_key(branch) {
            return Err(CoreError::already_exists("branch", format!("{}@{}", repo, branch)));
        }
        record
            .branches
            .insert(branch.to_string(), BranchRecord { head, finished });
        info!(repo = %repo, branch = %branch, "created branch");
        Ok(BranchInfo {
            repo: repo.to_string(),
            name: branch.to_string(),
            head,
        })
    }

    /// Inspect a branch
    ///
    /// # Errors
    ///
    /// Returns error if the repo or branch does not exist
    pub async fn inspect_branch(&self, repo: &str, branch: &str) -> CoreResult<BranchInfo> {
        let state = self.state.read().await;
        let record = state
            .repo(repo)?
            .branches
            .get(branch)
            .ok_or_else(|| CoreError::not_found("branch", format!("{}@{}", repo, branch)))?;
        Ok(BranchInfo {
            repo: repo.to_string(),
            name: branch.to_string(),
            head: record.head,
        })
    }

    /// Open a user commit as the new head of `branch`.
    ///
    /// The commit starts with its parent's files. The parent defaults to
    /// the current head; the branch is created if missing. If the parent
    /// is still open, the commit's writes are applied to the parent's
    /// finished tree when it finishes, so the parent must finish first.
    ///
    /// # Errors
    ///
    /// Returns error if the repo or explicit parent does not exist
    pub async fn start_commit(
        &self,
        repo: &str,
        branch: &str,
        parent: Option<CommitId>,
    ) -> CoreResult<CommitInfo> {
        self.open_commit(repo, branch, parent, CommitOrigin::User)
            .await
    }

    /// Open an output commit as the new head of `branch`.
    ///
    /// Unlike [`VersionedStore::start_commit`] the commit starts empty; its
    /// files are the datum outputs staged before it is finished.
    ///
    /// # Errors
    ///
    /// Returns error if the repo or explicit parent does not exist
    pub async fn start_output_commit(
        &self,
        repo: &str,
        branch: &str,
        parent: Option<CommitId>,
    ) -> CoreResult<CommitInfo> {
        self.open_commit(repo, branch, parent, CommitOrigin::Output)
            .await
    }

    async fn open_commit(
        &self,
        repo: &str,
        branch: &str,
        parent: Option<CommitId>,
        origin: CommitOrigin,
    ) -> CoreResult<CommitInfo> {
        validate_name("branch", branch)?;
        let mut state = self.state.write().await;
        let current_head = state
            .repo(repo)?
            .branches
            .get(branch)
            .and_then(|b| b.head);
        let parent = parent.or(current_head);
        let (tree, base) = match (parent, origin) {
            (Some(p), CommitOrigin::User) => {
                let parent_record = state.commit(repo, &p)?;
                if parent_record.info.is_finished() {
                    (parent_record.tree.clone(), None)
                } else {
                    (FileTree::new(), Some(p))
                }
            }
            (Some(p), CommitOrigin::Output) => {
                state.commit(repo, &p)?;
                (FileTree::new(), None)
            }
            (None, _) => (FileTree::new(), None),
        };

        let info = CommitInfo {
            id: CommitId::new(),
            repo: repo.to_string(),
            branch: Some(branch.to_string()),
            parent,
            origin,
            started: Timestamp::now(),
            finished: None,
            size_bytes: tree.total_size(),
            description: String::new(),
        };
        let record = state.repo_mut(repo)?;
        record.commit_count += 1;
        record.branches.entry(branch.to_string()).or_default().head = Some(info.id);
        state.commits.insert(
            info.id,
            CommitRecord {
                info: info.clone(),
                tree,
                staged: BTreeMap::new(),
                base,
                deletions: Vec::new(),
            },
        );
        info!(repo = %repo, branch = %branch, commit = %info.id, ?origin, "started commit");
        Ok(info)
    }

    /// Close a commit, making its files readable and immutable.
    ///
    /// Staged datum outputs are merged into the tree in datum-ID order,
    /// then branch subscribers are notified.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown commit, `AlreadyFinished` if it
    /// was closed before, and `Validation` while its parent is still open
    pub async fn finish_commit(&self, repo: &str, commit: &CommitId) -> CoreResult<CommitInfo> {
        let info = {
            let mut state = self.state.write().await;
            let base = state.open_commit_mut(repo, commit)?.base;
            let base_tree = match base {
                Some(parent) => {
                    let parent_record = state.commit(repo, &parent)?;
                    if !parent_record.info.is_finished() {
                        return Err(CoreError::validation(
                            "parent",
                            format!("parent {} of commit {} is still open", parent, commit),
                        ));
                    }
                    Some(parent_record.tree.clone())
                }
                None => None,
            };

            let record = state.open_commit_mut(repo, commit)?;
            if let Some(mut tree) = base_tree {
                for path in record.deletions.drain(..) {
                    tree.remove(&path)?;
                }
                tree.merge(&record.tree);
                record.tree = tree;
                record.base = None;
            }
            let staged = std::mem::take(&mut record.staged);
            for tree in staged.values() {
                record.tree.merge(tree);
            }
            record.info.finished = Some(Timestamp::now());
            record.info.size_bytes = record.tree.total_size();
            let info = record.info.clone();

            if let Some(branch) = &info.branch {
                if let Some(b) = state.repo_mut(repo)?.branches.get_mut(branch) {
                    b.finished.push(info.id);
                }
            }
            info
        };
        self.finish_tx.send_modify(|n| *n += 1);
        info!(
            repo = %repo,
            commit = %commit,
            size_bytes = info.size_bytes,
            "finished commit"
        );
        Ok(info)
    }

    /// Inspect a commit
    ///
    /// # Errors
    ///
    /// Returns error if the commit is not in `repo`
    pub async fn inspect_commit(&self, repo: &str, commit: &CommitId) -> CoreResult<CommitInfo> {
        let state = self.state.read().await;
        Ok(state.commit(repo, commit)?.info.clone())
    }

    /// List commits newest first. With a branch, walks the parent chain
    /// from the head; without, lists every commit in the repo.
    ///
    /// # Errors
    ///
    /// Returns error if the repo or branch does not exist
    pub async fn list_commit(&self, repo: &str, branch: Option<&str>) -> CoreResult<Vec<CommitInfo>> {
        let state = self.state.read().await;
        let repo_record = state.repo(repo)?;
        match branch {
            Some(branch) => {
                let mut cursor = repo_record
                    .branches
                    .get(branch)
                    .ok_or_else(|| CoreError::not_found("branch", format!("{}@{}", repo, branch)))?
                    .head;
                let mut out = Vec::new();
                while let Some(id) = cursor {
                    let record = state.commit(repo, &id)?;
                    out.push(record.info.clone());
                    cursor = record.info.parent;
                }
                Ok(out)
            }
            None => {
                let mut out: Vec<CommitInfo> = state
                    .commits
                    .values()
                    .filter(|c| c.info.repo == repo)
                    .map(|c| c.info.clone())
                    .collect();
                out.sort_by(|a, b| b.started.cmp(&a.started));
                Ok(out)
            }
        }
    }

    /// Most recently finished commit on a branch
    ///
    /// # Errors
    ///
    /// Returns error if the repo or branch does not exist
    pub async fn latest_finished(&self, repo: &str, branch: &str) -> CoreResult<Option<CommitInfo>> {
        let state = self.state.read().await;
        let record = state
            .repo(repo)?
            .branches
            .get(branch)
            .ok_or_else(|| CoreError::not_found("branch", format!("{}@{}", repo, branch)))?;
        match record.finished.last() {
            Some(id) => Ok(Some(state.commit(repo, id)?.info.clone())),
            None => Ok(None),
        }
    }

    /// Commits finished on a branch, in finish order
    ///
    /// # Errors
    ///
    /// Returns error if the repo or branch does not exist
    pub async fn finished_commits(&self, repo: &str, branch: &str) -> CoreResult<Vec<CommitId>> {
        let state = self.state.read().await;
        let record = state
            .repo(repo)?
            .branches
            .get(branch)
            .ok_or_else(|| CoreError::not_found("branch", format!("{}@{}", repo, branch)))?;
        Ok(record.finished.clone())
    }

    /// Write a file into an open commit
    ///
    /// # Errors
    ///
    /// Returns error if the commit is finished or missing, the path is
    /// invalid, or the file is too large
    pub async fn put_file(
        &self,
        repo: &str,
        commit: &CommitId,
        path: &str,
        data: impl Into<Bytes>,
    ) -> CoreResult<()> {
        let data = data.into();
        let size = data.len() as u64;
        let address = self.content.write(data)?;
        let mut state = self.state.write().await;
        let record = state.open_commit_mut(repo, commit)?;
        record.tree.insert(path, FileEntry { address, size })?;
        debug!(repo = %repo, commit = %commit, path = %path, size, "put file");
        Ok(())
    }

    /// Delete a file, or a directory and everything under it, from an
    /// open commit. Returns the number of files removed; while the parent
    /// is open only this commit's own writes are counted.
    ///
    /// # Errors
    ///
    /// Returns error if the commit is finished or missing
    pub async fn delete_file(&self, repo: &str, commit: &CommitId, path: &str) -> CoreResult<usize> {
        let mut state = self.state.write().await;
        let record = state.open_commit_mut(repo, commit)?;
        let removed = record.tree.remove(path)?;
        if record.base.is_some() {
            record.deletions.push(path.to_string());
        }
        Ok(removed)
    }

    /// Read a file from a finished commit
    ///
    /// # Errors
    ///
    /// Returns error if the commit is open or the file does not exist
    pub async fn get_file(&self, repo: &str, commit: &CommitId, path: &str) -> CoreResult<Bytes> {
        let entry = {
            let state = self.state.read().await;
            let record = state.finished_commit(repo, commit)?;
            *record
                .tree
                .get(path)
                .ok_or_else(|| CoreError::not_found("file", format!("{}@{}:{}", repo, commit, path)))?
        };
        self.content.read(&entry.address)
    }

    /// The file tree of a finished commit
    ///
    /// # Errors
    ///
    /// Returns error if the commit is open or missing
    pub async fn get_tree(&self, repo: &str, commit: &CommitId) -> CoreResult<FileTree> {
        let state = self.state.read().await;
        Ok(state.finished_commit(repo, commit)?.tree.clone())
    }

    /// List files of a finished commit under `prefix` (all when `None`)
    ///
    /// # Errors
    ///
    /// Returns error if the commit is open or missing
    pub async fn list_file(
        &self,
        repo: &str,
        commit: &CommitId,
        prefix: Option<&str>,
    ) -> CoreResult<Vec<(String, FileEntry)>> {
        let tree = self.get_tree(repo, commit).await?;
        let tree = match prefix {
            Some(p) => tree.subtree(p),
            None => tree,
        };
        Ok(tree.iter().map(|(p, e)| (p.clone(), *e)).collect())
    }

    /// Write every file of a tar stream into an open commit. Returns the
    /// number of files written.
    ///
    /// # Errors
    ///
    /// Returns error if the stream is malformed or the commit is not open
    pub async fn put_tar(&self, repo: &str, commit: &CommitId, stream: &[u8]) -> CoreResult<usize> {
        let entries = transfer::decode_entries(stream)?;
        let mut staged = FileTree::new();
        for (path, data) in entries {
            let size = data.len() as u64;
            let address = self.content.write(data)?;
            staged.insert(&path, FileEntry { address, size })?;
        }
        let mut state = self.state.write().await;
        let record = state.open_commit_mut(repo, commit)?;
        record.tree.merge(&staged);
        debug!(repo = %repo, commit = %commit, files = staged.len(), "put tar");
        Ok(staged.len())
    }

    /// Read files of a finished commit under `prefix` as a tar stream
    ///
    /// # Errors
    ///
    /// Returns error if the commit is open or missing
    pub async fn get_tar(&self, repo: &str, commit: &CommitId, prefix: &str) -> CoreResult<Vec<u8>> {
        let tree = self.get_tree(repo, commit).await?.subtree(prefix);
        transfer::encode_tree(&self.content, &tree)
    }

    /// Stage the output tree of one datum in an open commit. A second
    /// write for the same datum replaces the first.
    ///
    /// # Errors
    ///
    /// Returns error if the commit is finished or missing
    pub async fn put_datum_output(
        &self,
        repo: &str,
        commit: &CommitId,
        datum: &str,
        tree: FileTree,
    ) -> CoreResult<()> {
        let mut state = self.state.write().await;
        let record = state.open_commit_mut(repo, commit)?;
        let files = tree.len();
        if record.staged.insert(datum.to_string(), tree).is_some() {
            debug!(commit = %commit, datum = %datum, "replaced datum output");
        } else {
            debug!(commit = %commit, datum = %datum, files, "staged datum output");
        }
        Ok(())
    }

    /// Drop every staged datum output of an open commit
    ///
    /// # Errors
    ///
    /// Returns error if the commit is finished or missing
    pub async fn discard_datum_outputs(&self, repo: &str, commit: &CommitId) -> CoreResult<usize> {
        let mut state = self.state.write().await;
        let record = state.open_commit_mut(repo, commit)?;
        let dropped = record.staged.len();
        record.staged.clear();
        info!(repo = %repo, commit = %commit, dropped, "discarded datum outputs");
        Ok(dropped)
    }

    /// IDs of the datum outputs staged in an open commit
    ///
    /// # Errors
    ///
    /// Returns error if the commit is finished or missing
    pub async fn staged_datums(&self, repo: &str, commit: &CommitId) -> CoreResult<Vec<String>> {
        let mut state = self.state.write().await;
        let record = state.open_commit_mut(repo, commit)?;
        Ok(record.staged.keys().cloned().collect())
    }

    /// Subscribe to commits finished on a branch, in finish order.
    ///
    /// With `after`, delivery starts with the first commit finished after
    /// it; an unfinished `after` starts at the next finish. Without it,
    /// every finished commit is replayed first.
    ///
    /// # Errors
    ///
    /// Returns error if the repo or branch does not exist, or `after` is
    /// not a commit of the repo
    pub async fn subscribe_branch(
        &self,
        repo: &str,
        branch: &str,
        after: Option<CommitId>,
    ) -> CoreResult<BranchSubscription> {
        let ticks = self.finish_tx.subscribe();
        let state = self.state.read().await;
        let record = state
            .repo(repo)?
            .branches
            .get(branch)
            .ok_or_else(|| CoreError::not_found("branch", format!("{}@{}", repo, branch)))?;
        let next = match after {
            Some(id) => {
                state.commit(repo, &id)?;
                record
                    .finished
                    .iter()
                    .position(|c| *c == id)
                    .map_or(record.finished.len(), |i| i + 1)
            }
            None => 0,
        };
        Ok(BranchSubscription {
            store: self.clone(),
            repo: repo.to_string(),
            branch: branch.to_string(),
            next,
            ticks,
        })
    }

    async fn finished_at(&self, repo: &str, branch: &str, index: usize) -> CoreResult<Option<CommitInfo>> {
        let state = self.state.read().await;
        let id = state
            .repo(repo)?
            .branches
            .get(branch)
            .and_then(|b| b.finished.get(index).copied());
        match id {
            Some(id) => Ok(Some(state.commit(repo, &id)?.info.clone())),
            None => Ok(None),
        }
    }
}

fn repo_info(name: &str, record: &RepoRecord) -> RepoInfo {
    RepoInfo {
        name: name.to_string(),
        created: record.created,
        description: record.description.clone(),
        branches: record.branches.keys().cloned().collect(),
        commit_count: record.commit_count,
    }
}

/// Ordered stream of commits finished on one branch
#[derive(Debug)]
pub struct BranchSubscription {
    store: VersionedStore,
    repo: String,
    branch: String,
    next: usize,
    ticks: watch::Receiver<u64>,
}

impl BranchSubscription {
    /// Repository watched
    #[must_use]
    pub fn repo(&self) -> &str {
        &self.repo
    }

    /// Branch watched
    #[must_use]
    pub fn branch(&self) -> &str {
        &self.branch
    }

    /// Wait for the next finished commit. Cancel by dropping the future.
    ///
    /// # Errors
    ///
    /// Returns `Cancelled` if the store was dropped
    pub async fn next(&mut self) -> CoreResult<CommitInfo> {
        loop {
            self.ticks.borrow_and_update();
            if let Some(info) = self
                .store
                .finished_at(&self.repo, &self.branch, self.next)
                .await?
            {
                self.next += 1;
                return Ok(info);
            }
            self.ticks
                .changed()
                .await
                .map_err(|_| CoreError::Cancelled)?;
        }
    }
}
