//! sluice core types
//!
//! Pure types shared by every sluice crate: identifiers, content hashes,
//! timestamps, the error taxonomy and retry policy. No I/O lives here.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod hash;
pub mod id;
pub mod retry;
pub mod time;

// Re-exports
pub use error::{CoreError, CoreResult};
pub use hash::{Hash, HashError, Hasher};
pub use id::{CommitId, JobId, ReplicaId, WorkerId};
pub use retry::{Backoff, retry_transient};
pub use time::Timestamp;
