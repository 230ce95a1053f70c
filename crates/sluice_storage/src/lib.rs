//! sluice storage
//!
//! Versioned commit/branch store over a content-addressed file store.
//! Commits are immutable once finished; branch heads are the only
//! mutable pointers and the only trigger signal pipelines consume.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod commit;
pub mod store;
pub mod transfer;
pub mod tree;
pub mod versioned;

pub use commit::{BranchInfo, CommitInfo, CommitOrigin, RepoInfo};
pub use store::{ContentStore, StoreConfig, StoreError, StoreStats};
pub use tree::{FileEntry, FileTree, normalize_path};
pub use versioned::{BranchSubscription, VersionedStore};
