//! Worker pool: a bounded work queue shared by a fixed set of workers.

use crate::queue::WorkTask;
use crate::worker::{self, Worker, WorkerConfig, WorkerState};
use sluice_core::{CoreError, CoreResult, WorkerId};
use sluice_storage::VersionedStore;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug)]
struct WorkerHandle {
    state: Arc<RwLock<WorkerState>>,
    task: JoinHandle<()>,
}

/// A pool of workers serving one pipeline
#[derive(Debug)]
pub struct WorkerPool {
    name: String,
    config: WorkerConfig,
    store: VersionedStore,
    sender: mpsc::Sender<WorkTask>,
    queue: Arc<Mutex<mpsc::Receiver<WorkTask>>>,
    workers: RwLock<BTreeMap<WorkerId, WorkerHandle>>,
    shutdown: CancellationToken,
}

impl WorkerPool {
    /// Start a pool of `parallelism` workers
    #[must_use]
    pub fn start(
        name: impl Into<String>,
        parallelism: usize,
        store: VersionedStore,
        config: WorkerConfig,
    ) -> Self {
        let name = name.into();
        let (sender, receiver) = mpsc::channel(config.queue_capacity.max(1));
        let mut pool = Self {
            name,
            config,
            store,
            sender,
            queue: Arc::new(Mutex::new(receiver)),
            workers: RwLock::new(BTreeMap::new()),
            shutdown: CancellationToken::new(),
        };

        let mut workers = BTreeMap::new();
        for _ in 0..parallelism.max(1) {
            let (id, handle) = pool.spawn_worker();
            workers.insert(id, handle);
        }
        pool.workers = RwLock::new(workers);
        info!(pool = %pool.name, parallelism = parallelism.max(1), "worker pool started");
        pool
    }

    fn spawn_worker(&self) -> (WorkerId, WorkerHandle) {
        let id = WorkerId::new();
        let state = Arc::new(RwLock::new(WorkerState::Idle));
        let task = worker::spawn(Worker {
            id,
            store: self.store.clone(),
            queue: self.queue.clone(),
            state: state.clone(),
            heartbeat: self.config.heartbeat_interval(),
            shutdown: self.shutdown.child_token(),
        });
        (id, WorkerHandle { state, task })
    }

    /// Pool name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Worker configuration
    #[must_use]
    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Sending half of the work queue
    #[must_use]
    pub fn sender(&self) -> mpsc::Sender<WorkTask> {
        self.sender.clone()
    }

    /// Store workers read inputs from and stage outputs into
    #[must_use]
    pub fn store(&self) -> &VersionedStore {
        &self.store
    }

    /// Workers and their states
    pub async fn workers(&self) -> Vec<(WorkerId, WorkerState)> {
        let workers = self.workers.read().await;
        let mut out = Vec::with_capacity(workers.len());
        for (id, handle) in workers.iter() {
            out.push((*id, *handle.state.read().await));
        }
        out
    }

    /// Kill a worker as if its process died and start a replacement.
    /// Whatever it was running is left to claim expiry.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown worker
    pub async fn crash_worker(&self, id: &WorkerId) -> CoreResult<WorkerId> {
        let mut workers = self.workers.write().await;
        let handle = workers
            .remove(id)
            .ok_or_else(|| CoreError::not_found("worker", id))?;
        handle.task.abort();
        warn!(pool = %self.name, worker = %id, "worker crashed");

        let (replacement, handle) = self.spawn_worker();
        workers.insert(replacement, handle);
        Ok(replacement)
    }

    /// Stop every worker and wait for them to exit
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handles: Vec<WorkerHandle> = {
            let mut workers = self.workers.write().await;
            std::mem::take(&mut *workers).into_values().collect()
        };
        for handle in handles {
            if let Err(err) = handle.task.await {
                if !err.is_cancelled() {
                    warn!(pool = %self.name, error = %err, "worker task failed");
                }
            }
        }
        info!(pool = %self.name, "worker pool stopped");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
