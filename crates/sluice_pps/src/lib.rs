//! sluice pipeline system
//!
//! Pipeline specs, the job state machine, the pipeline controllers that
//! turn input commits into jobs and output commits, and the client API.
//! [`LocalCluster`] runs all of it in one process.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod api;
pub mod catalog;
pub mod cluster;
pub mod config;
pub mod controller;
pub mod inputs;
pub mod job;
pub mod pipeline;
pub mod pools;
pub mod runtime;

// Re-exports
pub use api::PpsApi;
pub use catalog::{Catalog, PipelineRecord};
pub use cluster::LocalCluster;
pub use config::{ClusterConfig, ControllerConfig, MetadataConfig};
pub use controller::{ControllerContext, PipelineController};
pub use job::{InputCommit, InputOrigin, JobRecord, JobState, JobStatus, input_key};
pub use pipeline::{InputSource, InputSpec, PipelineSpec, Transform};
pub use pools::PoolRegistry;
pub use runtime::RunnerRegistry;
