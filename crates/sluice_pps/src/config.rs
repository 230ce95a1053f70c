//! Cluster configuration.

use serde::{Deserialize, Serialize};
use sluice_coord::ElectionConfig;
use sluice_core::{CoreError, CoreResult};
use sluice_storage::StoreConfig;
use sluice_worker::WorkerConfig;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Metadata backend
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum MetadataConfig {
    /// In-memory; lost on exit
    #[default]
    Memory,
    /// Durable redb database file
    Redb {
        /// Database path
        path: PathBuf,
    },
}

/// Pipeline controller configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Controller replicas competing for each pipeline
    pub replicas: usize,
    /// Leadership lease time-to-live in milliseconds
    pub lease_ttl_ms: u64,
    /// Lease renewal interval in milliseconds
    pub lease_renew_ms: u64,
    /// Interval of the recovery scan in milliseconds
    pub recovery_interval_ms: u64,
    /// A RUNNING job whose heartbeat is older than this is stale
    pub job_liveness_ms: u64,
}

impl ControllerConfig {
    /// Create a new controller config
    #[must_use]
    pub fn new() -> Self {
        Self {
            replicas: 1,
            lease_ttl_ms: 10_000,
            lease_renew_ms: 3_000,
            recovery_interval_ms: 5_000,
            job_liveness_ms: 30_000,
        }
    }

    /// Set the replica count
    #[must_use]
    pub fn with_replicas(mut self, replicas: usize) -> Self {
        self.replicas = replicas;
        self
    }

    /// Set lease timing
    #[must_use]
    pub fn with_lease(mut self, ttl_ms: u64, renew_ms: u64) -> Self {
        self.lease_ttl_ms = ttl_ms;
        self.lease_renew_ms = renew_ms;
        self
    }

    /// Set the recovery scan interval
    #[must_use]
    pub fn with_recovery_interval(mut self, interval_ms: u64) -> Self {
        self.recovery_interval_ms = interval_ms;
        self
    }

    /// Set the job liveness deadline
    #[must_use]
    pub fn with_job_liveness(mut self, liveness_ms: u64) -> Self {
        self.job_liveness_ms = liveness_ms;
        self
    }

    /// Election settings derived from the lease timing
    #[must_use]
    pub fn election(&self) -> ElectionConfig {
        ElectionConfig::new(self.lease_ttl_ms, self.lease_renew_ms)
    }

    /// Recovery scan interval
    #[must_use]
    pub fn recovery_interval(&self) -> Duration {
        Duration::from_millis(self.recovery_interval_ms.max(1))
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration of a whole local cluster
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Metadata backend
    pub metadata: MetadataConfig,
    /// Controllers
    pub controller: ControllerConfig,
    /// Worker pools
    pub worker: WorkerConfig,
    /// Content store
    pub storage: StoreConfig,
}

impl ClusterConfig {
    /// Create the default configuration
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Load from a JSON file. Missing fields take their defaults.
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or is not valid
    pub fn from_file(path: impl AsRef<Path>) -> CoreResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw).map_err(|e| {
            CoreError::validation("config", format!("{}: {}", path.display(), e))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Set the metadata backend
    #[must_use]
    pub fn with_metadata(mut self, metadata: MetadataConfig) -> Self {
        self.metadata = metadata;
        self
    }

    /// Set the controller config
    #[must_use]
    pub fn with_controller(mut self, controller: ControllerConfig) -> Self {
        self.controller = controller;
        self
    }

    /// Set the worker config
    #[must_use]
    pub fn with_worker(mut self, worker: WorkerConfig) -> Self {
        self.worker = worker;
        self
    }

    /// Set the store config
    #[must_use]
    pub fn with_storage(mut self, storage: StoreConfig) -> Self {
        self.storage = storage;
        self
    }

    /// Check the configuration is usable
    ///
    /// # Errors
    ///
    /// Returns `Validation` naming the offending field
    pub fn validate(&self) -> CoreResult<()> {
        let c = &self.controller;
        if c.replicas == 0 {
            return Err(CoreError::validation("controller.replicas", "must be at least 1"));
        }
        if c.lease_renew_ms == 0 || c.lease_renew_ms >= c.lease_ttl_ms {
            return Err(CoreError::validation(
                "controller.lease_renew_ms",
                "must be positive and below lease_ttl_ms",
            ));
        }
        let w = &self.worker;
        if w.heartbeat_interval_ms == 0 || w.heartbeat_interval_ms >= w.claim_timeout_ms {
            return Err(CoreError::validation(
                "worker.heartbeat_interval_ms",
                "must be positive and below claim_timeout_ms",
            ));
        }
        if w.queue_capacity == 0 {
            return Err(CoreError::validation("worker.queue_capacity", "must be at least 1"));
        }
        Ok(())
    }
}
