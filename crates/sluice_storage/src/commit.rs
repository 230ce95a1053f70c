//! Repository, branch and commit metadata.

use serde::{Deserialize, Serialize};
use sluice_core::{CommitId, Timestamp};

/// How a commit came to be
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommitOrigin {
    /// Written by a user; starts from its parent's files
    User,
    /// Output of a pipeline job; starts empty and is assembled from
    /// datum outputs at finish
    Output,
}

/// Commit metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitInfo {
    /// Commit ID
    pub id: CommitId,
    /// Owning repository
    pub repo: String,
    /// Branch the commit was started on
    pub branch: Option<String>,
    /// Parent commit
    pub parent: Option<CommitId>,
    /// Origin
    pub origin: CommitOrigin,
    /// When the commit was opened
    pub started: Timestamp,
    /// When the commit was closed, if it was
    pub finished: Option<Timestamp>,
    /// Total size of the commit's files (final once finished)
    pub size_bytes: u64,
    /// Free-form description
    pub description: String,
}

impl CommitInfo {
    /// Whether the commit is closed
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.finished.is_some()
    }
}

/// Branch metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchInfo {
    /// Owning repository
    pub repo: String,
    /// Branch name
    pub name: String,
    /// Current head, if any commit was ever started on the branch
    pub head: Option<CommitId>,
}

/// Repository metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoInfo {
    /// Repository name
    pub name: String,
    /// Creation time
    pub created: Timestamp,
    /// Free-form description
    pub description: String,
    /// Branch names in order
    pub branches: Vec<String>,
    /// Number of commits, open and finished
    pub commit_count: usize,
}
