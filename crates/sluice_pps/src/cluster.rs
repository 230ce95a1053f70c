//! In-process cluster: store, coordinator, worker pools and controller
//! replicas wired together.

use crate::api::PpsApi;
use crate::catalog::{Catalog, PIPELINE_PREFIX};
use crate::config::{ClusterConfig, MetadataConfig};
use crate::controller::{ControllerContext, PipelineController};
use crate::job::JobStatus;
use crate::pools::PoolRegistry;
use crate::runtime::RunnerRegistry;
use sluice_coord::{KvBackend, KvEvent, LeaseManager, MemoryKv, MetadataStore, RedbKv};
use sluice_core::{CoreError, CoreResult, JobId, ReplicaId};
use sluice_storage::{ContentStore, VersionedStore};
use sluice_worker::WorkerPool;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// A whole sluice deployment in one process
#[derive(Debug)]
pub struct LocalCluster {
    config: ClusterConfig,
    ctx: ControllerContext,
    api: PpsApi,
    replicas: Vec<ReplicaId>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl LocalCluster {
    /// Start a cluster with fresh storage and the configured metadata
    /// backend
    ///
    /// # Errors
    ///
    /// Returns error if the configuration is invalid or the metadata
    /// backend cannot be opened
    pub async fn start(config: ClusterConfig) -> CoreResult<Self> {
        config.validate()?;
        let backend: Arc<dyn KvBackend> = match &config.metadata {
            MetadataConfig::Memory => Arc::new(MemoryKv::new()),
            MetadataConfig::Redb { path } => Arc::new(RedbKv::open(path)?),
        };
        let store = VersionedStore::new(Arc::new(ContentStore::with_config(config.storage.clone())));
        Self::from_parts(config, MetadataStore::new(backend), store).await
    }

    /// Start controllers over an existing metadata store and versioned
    /// store, as a restarted process would
    ///
    /// # Errors
    ///
    /// Returns error if the configuration is invalid
    pub async fn from_parts(config: ClusterConfig, meta: MetadataStore, store: VersionedStore) -> CoreResult<Self> {
        config.validate()?;
        let catalog = Catalog::new(meta.clone());
        let ctx = ControllerContext {
            catalog: catalog.clone(),
            store: store.clone(),
            leases: LeaseManager::new(meta),
            runners: RunnerRegistry::new(),
            pools: PoolRegistry::new(store.clone(), config.worker.clone()),
            config: config.controller.clone(),
        };
        let replicas: Vec<ReplicaId> = (0..config.controller.replicas).map(|_| ReplicaId::new()).collect();
        let shutdown = CancellationToken::new();

        let tasks = replicas
            .iter()
            .map(|replica| tokio::spawn(supervise(*replica, ctx.clone(), shutdown.child_token())))
            .collect();
        info!(replicas = replicas.len(), "cluster started");

        Ok(Self {
            config,
            api: PpsApi::new(catalog, store),
            ctx,
            replicas,
            shutdown,
            tasks: Mutex::new(tasks),
        })
    }

    /// Client API
    #[must_use]
    pub fn api(&self) -> &PpsApi {
        &self.api
    }

    /// Versioned store
    #[must_use]
    pub fn store(&self) -> &VersionedStore {
        &self.ctx.store
    }

    /// Metadata store
    #[must_use]
    pub fn meta(&self) -> &MetadataStore {
        self.ctx.catalog.meta()
    }

    /// Transform runners; register in-process runners here
    #[must_use]
    pub fn runners(&self) -> &RunnerRegistry {
        &self.ctx.runners
    }

    /// Configuration the cluster runs with
    #[must_use]
    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    /// Controller replicas
    #[must_use]
    pub fn replicas(&self) -> &[ReplicaId] {
        &self.replicas
    }

    /// Worker pool of a pipeline, once one of its jobs started
    pub async fn pool(&self, pipeline: &str) -> Option<Arc<WorkerPool>> {
        self.ctx.pools.pool(pipeline).await
    }

    /// Wait until a job reaches a terminal status
    ///
    /// # Errors
    ///
    /// Returns `Timeout` if it does not within `timeout`, `NotFound` for
    /// an unknown job
    pub async fn wait_for_job(&self, id: &JobId, timeout: Duration) -> CoreResult<JobStatus> {
        let wait = async {
            let mut watch = self.ctx.catalog.watch_jobs();
            loop {
                let status = self.api.get_job_status(id).await?;
                if matches!(status, JobStatus::Success | JobStatus::Error | JobStatus::Killed) {
                    return Ok(status);
                }
                tokio::select! {
                    _ = watch.next() => {}
                    _ = tokio::time::sleep(Duration::from_millis(20)) => {}
                }
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| CoreError::Timeout {
                operation: format!("wait for job {}", id),
            })?
    }

    /// Stop controllers and worker pools
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        for task in tasks {
            if let Err(err) = task.await {
                warn!(error = %err, "controller supervisor failed");
            }
        }
        self.ctx.pools.shutdown().await;
        info!("cluster stopped");
    }
}

impl Drop for LocalCluster {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Run one replica: a controller for every pipeline, present and future
async fn supervise(replica: ReplicaId, ctx: ControllerContext, shutdown: CancellationToken) {
    let mut watch = ctx.catalog.watch_pipelines();
    let mut controllers: HashMap<String, JoinHandle<()>> = HashMap::new();

    let existing = loop {
        match ctx.catalog.pipelines().await {
            Ok(pipelines) => break pipelines,
            Err(err) => {
                warn!(replica = %replica, error = %err, "cannot list pipelines, retrying");
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = tokio::time::sleep(ctx.config.recovery_interval()) => {}
                }
            }
        }
    };
    for record in existing {
        spawn_controller(&mut controllers, &record.spec.name, replica, &ctx, &shutdown);
    }

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            event = watch.next() => match event {
                Ok(KvEvent::Put(entry)) => {
                    if let Some(name) = entry.key.strip_prefix(PIPELINE_PREFIX) {
                        spawn_controller(&mut controllers, name, replica, &ctx, &shutdown);
                    }
                }
                Ok(KvEvent::Delete { .. }) => {}
                Err(_) => break,
            }
        }
    }

    for (name, handle) in controllers {
        if let Err(err) = handle.await {
            warn!(pipeline = %name, replica = %replica, error = %err, "controller task failed");
        }
    }
}

fn spawn_controller(
    controllers: &mut HashMap<String, JoinHandle<()>>,
    name: &str,
    replica: ReplicaId,
    ctx: &ControllerContext,
    shutdown: &CancellationToken,
) {
    if controllers.contains_key(name) {
        return;
    }
    let controller = PipelineController::new(name, replica, ctx.clone());
    controllers.insert(name.to_string(), tokio::spawn(controller.run(shutdown.child_token())));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let cluster = LocalCluster::start(ClusterConfig::new()).await.unwrap();
        assert_eq!(cluster.replicas().len(), 1);
        assert!(cluster.api().list_pipelines().await.unwrap().is_empty());
        assert!(cluster.pool("none").await.is_none());
        let err = cluster
            .wait_for_job(&JobId::new(), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        cluster.shutdown().await;
    }

    #[tokio::test]
    async fn test_redb_backend() {
        let dir = tempfile::tempdir().unwrap();
        let config = ClusterConfig::new().with_metadata(MetadataConfig::Redb {
            path: dir.path().join("meta.redb"),
        });
        let cluster = LocalCluster::start(config).await.unwrap();
        assert!(cluster.api().list_jobs(None).await.unwrap().is_empty());
        cluster.shutdown().await;
    }
}
