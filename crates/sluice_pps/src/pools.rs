//! Worker pools and datum caches, one of each per pipeline.

use crate::pipeline::PipelineSpec;
use sluice_storage::VersionedStore;
use sluice_worker::{DatumCache, WorkerConfig, WorkerPool};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

#[derive(Debug)]
struct PipelineWorkers {
    pool: Arc<WorkerPool>,
    cache: DatumCache,
}

/// Lazily started worker pools, shared by every controller replica of
/// a cluster
#[derive(Debug, Clone)]
pub struct PoolRegistry {
    store: VersionedStore,
    config: WorkerConfig,
    pipelines: Arc<Mutex<HashMap<String, PipelineWorkers>>>,
}

impl PoolRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new(store: VersionedStore, config: WorkerConfig) -> Self {
        Self {
            store,
            config,
            pipelines: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Pool and datum cache of a pipeline, starting the pool on first use
    pub async fn workers(&self, spec: &PipelineSpec) -> (Arc<WorkerPool>, DatumCache) {
        let mut pipelines = self.pipelines.lock().await;
        let entry = pipelines.entry(spec.name.clone()).or_insert_with(|| {
            info!(pipeline = %spec.name, parallelism = spec.parallelism, "starting worker pool");
            PipelineWorkers {
                pool: Arc::new(WorkerPool::start(
                    spec.name.clone(),
                    spec.parallelism,
                    self.store.clone(),
                    self.config.clone(),
                )),
                cache: DatumCache::new(),
            }
        });
        (entry.pool.clone(), entry.cache.clone())
    }

    /// Pool of a pipeline, if started
    pub async fn pool(&self, pipeline: &str) -> Option<Arc<WorkerPool>> {
        self.pipelines.lock().await.get(pipeline).map(|w| w.pool.clone())
    }

    /// Stop every pool
    pub async fn shutdown(&self) {
        let pools: Vec<Arc<WorkerPool>> = {
            let mut pipelines = self.pipelines.lock().await;
            pipelines.drain().map(|(_, w)| w.pool).collect()
        };
        for pool in pools {
            pool.shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{InputSpec, Transform};
    use sluice_worker::Glob;

    #[tokio::test]
    async fn test_pool_started_once() {
        let registry = PoolRegistry::new(VersionedStore::in_memory(), WorkerConfig::new());
        let spec = PipelineSpec::new("p", Transform::new("img", vec!["cat".into()]))
            .with_input(InputSpec::repo("in", "r", "master", Glob::Root))
            .with_parallelism(2);
        assert!(registry.pool("p").await.is_none());

        let (a, cache) = registry.workers(&spec).await;
        let (b, _) = registry.workers(&spec).await;
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.workers().await.len(), 2);
        assert!(cache.is_empty());

        registry.shutdown().await;
        assert!(registry.pool("p").await.is_none());
    }
}
