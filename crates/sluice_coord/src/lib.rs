//! sluice coordinator
//!
//! A consistent, watchable key-value store holding pipeline and job
//! records, plus the leases used to elect one controller per pipeline.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod election;
pub mod kv;
pub mod lease;
pub mod memory;
pub mod metadata;
pub mod redb_kv;

pub use election::{ElectionConfig, ElectionState, LeaderElection, Leadership};
pub use kv::{CoordError, KvBackend, KvEntry, KvEvent};
pub use lease::{Lease, LeaseManager};
pub use memory::MemoryKv;
pub use metadata::{KvWatch, MetadataStore, Versioned};
pub use redb_kv::RedbKv;
