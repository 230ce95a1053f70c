//! sluice worker layer
//!
//! Turns input trees into datums, and runs them on pools of long-lived
//! workers. Each job's dispatcher feeds a bounded queue, tracks claims
//! with heartbeats so a crashed worker's datum is redispatched, retries
//! failures with backoff and applies the pipeline's failure policy.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cache;
pub mod datum;
pub mod dispatcher;
pub mod pool;
pub mod process;
pub mod queue;
pub mod runner;
pub mod stats;
pub mod worker;

// Re-exports
pub use cache::DatumCache;
pub use datum::{Datum, DatumId, DatumPart, Glob, InputTree, JoinMode, enumerate};
pub use dispatcher::{
    DispatchOutcome, DispatchRequest, DispatchVerdict, FailurePolicy, FailureThreshold, dispatch,
};
pub use pool::WorkerPool;
pub use process::ProcessRunner;
pub use queue::{ClaimTable, OutputGate};
pub use runner::{DatumFiles, DatumRunner, FnRunner, InputFile, OutputFile, RunError};
pub use stats::{DatumCounts, DatumOutcome, DatumStats, JobStats};
pub use worker::{WorkerConfig, WorkerState};
