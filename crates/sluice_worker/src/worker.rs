//! Worker: pulls datums off a pool queue and runs them.

use crate::queue::{AttemptResult, DatumReport, WorkTask, WorkerEvent};
use crate::runner::{DatumFiles, InputFile, OutputFile, RunError};
use serde::{Deserialize, Serialize};
use sluice_core::{Backoff, CoreResult, WorkerId};
use sluice_storage::{FileEntry, FileTree, VersionedStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Worker configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// A claim without a heartbeat for this long is considered lost
    pub claim_timeout_ms: u64,
    /// Heartbeat interval in milliseconds
    pub heartbeat_interval_ms: u64,
    /// Capacity of a pool's work queue
    pub queue_capacity: usize,
    /// Delay between retries of a failed datum
    pub datum_backoff: Backoff,
}

impl WorkerConfig {
    /// Create a new worker config
    #[must_use]
    pub fn new() -> Self {
        Self {
            claim_timeout_ms: 10_000,
            heartbeat_interval_ms: 1_000,
            queue_capacity: 64,
            datum_backoff: Backoff::new(100, 5_000, 3),
        }
    }

    /// Set the claim timeout
    #[must_use]
    pub fn with_claim_timeout(mut self, timeout_ms: u64) -> Self {
        self.claim_timeout_ms = timeout_ms;
        self
    }

    /// Set the heartbeat interval
    #[must_use]
    pub fn with_heartbeat_interval(mut self, interval_ms: u64) -> Self {
        self.heartbeat_interval_ms = interval_ms;
        self
    }

    /// Set the queue capacity
    #[must_use]
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Set the retry backoff
    #[must_use]
    pub fn with_datum_backoff(mut self, backoff: Backoff) -> Self {
        self.datum_backoff = backoff;
        self
    }

    /// Claim timeout as a duration
    #[must_use]
    pub fn claim_timeout(&self) -> Duration {
        Duration::from_millis(self.claim_timeout_ms.max(1))
    }

    /// Heartbeat interval as a duration
    #[must_use]
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms.max(1))
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Worker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerState {
    /// Waiting for work
    Idle,
    /// Running a datum
    Busy,
    /// Stopped
    Shutdown,
}

/// One long-lived worker task
#[derive(Debug, Clone)]
pub(crate) struct Worker {
    pub(crate) id: WorkerId,
    pub(crate) store: VersionedStore,
    pub(crate) queue: Arc<Mutex<mpsc::Receiver<WorkTask>>>,
    pub(crate) state: Arc<RwLock<WorkerState>>,
    pub(crate) heartbeat: Duration,
    pub(crate) shutdown: CancellationToken,
}

impl Worker {
    async fn next_task(&self) -> Option<WorkTask> {
        let mut queue = self.queue.lock().await;
        tokio::select! {
            () = self.shutdown.cancelled() => None,
            task = queue.recv() => task,
        }
    }

    /// Pull and process tasks until the queue closes or shutdown
    pub(crate) async fn run(self) {
        debug!(worker = %self.id, "worker started");
        while let Some(task) = self.next_task().await {
            let ctx = task.ctx.clone();
            // Claim before any await so an abort cannot lose the task silently.
            let claimed = ctx.events.send(WorkerEvent::Claimed {
                index: task.datum.index,
                attempt: task.attempt,
                worker: self.id,
            });
            if claimed.is_err() || ctx.cancel.is_cancelled() {
                debug!(worker = %self.id, job = %ctx.job, "dropping task of finished job");
                continue;
            }

            *self.state.write().await = WorkerState::Busy;
            let started = Instant::now();
            let result = self.process(&task).await;
            let report = DatumReport {
                index: task.datum.index,
                datum: task.datum.id,
                attempt: task.attempt,
                worker: self.id,
                result,
                duration: started.elapsed(),
            };
            // The dispatcher may already be gone.
            let _ = ctx.events.send(WorkerEvent::Finished(report));
            *self.state.write().await = WorkerState::Idle;
        }
        *self.state.write().await = WorkerState::Shutdown;
        debug!(worker = %self.id, "worker stopped");
    }

    async fn process(&self, task: &WorkTask) -> AttemptResult {
        let ctx = &task.ctx;
        let datum = &task.datum;
        let files = match self.load(task) {
            Ok(files) => files,
            Err(err) => return AttemptResult::Failed(format!("loading inputs: {}", err)),
        };

        let run = async {
            match tokio::time::timeout(ctx.timeout, ctx.runner.run(&files)).await {
                Ok(result) => result,
                Err(_) => Err(RunError::Timeout(ctx.timeout.as_millis() as u64)),
            }
        };
        tokio::pin!(run);

        let mut ticker = tokio::time::interval(self.heartbeat);
        ticker.tick().await;
        let outcome = loop {
            tokio::select! {
                () = ctx.cancel.cancelled() => {
                    debug!(worker = %self.id, datum = %datum.id.short(), "abandoning datum of cancelled job");
                    return AttemptResult::Refused;
                }
                result = &mut run => break result,
                _ = ticker.tick() => {
                    let _ = ctx.events.send(WorkerEvent::Heartbeat {
                        index: datum.index,
                        attempt: task.attempt,
                    });
                }
            }
        };

        let outputs = match outcome {
            Ok(outputs) => outputs,
            Err(err) => {
                warn!(
                    worker = %self.id,
                    job = %ctx.job,
                    datum = %datum.id.short(),
                    attempt = task.attempt,
                    error = %err,
                    "datum failed"
                );
                return AttemptResult::Failed(err.to_string());
            }
        };

        let tree = match self.write_outputs(outputs) {
            Ok(tree) => tree,
            Err(err) => return AttemptResult::Failed(format!("writing outputs: {}", err)),
        };
        match ctx
            .gate
            .stage(&self.store, datum.index, &datum.id, task.attempt, tree.clone())
            .await
        {
            Ok(true) => {
                debug!(worker = %self.id, datum = %datum.id.short(), files = tree.len(), "datum staged");
                AttemptResult::Staged(tree)
            }
            Ok(false) => AttemptResult::Refused,
            Err(err) => AttemptResult::Failed(format!("staging output: {}", err)),
        }
    }

    fn load(&self, task: &WorkTask) -> CoreResult<DatumFiles> {
        let content = self.store.content();
        let mut files = Vec::new();
        for part in &task.datum.parts {
            for (path, entry) in part.files.iter() {
                files.push(InputFile {
                    input: part.input.clone(),
                    path: path.clone(),
                    data: content.read(&entry.address)?,
                });
            }
        }
        Ok(DatumFiles {
            datum: task.datum.id,
            job: task.ctx.job,
            attempt: task.attempt,
            files,
        })
    }

    fn write_outputs(&self, outputs: Vec<OutputFile>) -> CoreResult<FileTree> {
        let content = self.store.content();
        let mut tree = FileTree::new();
        for output in outputs {
            let size = output.data.len() as u64;
            let address = content.write(output.data)?;
            tree.insert(&output.path, FileEntry { address, size })?;
        }
        Ok(tree)
    }
}

/// Spawn a worker task
pub(crate) fn spawn(worker: Worker) -> tokio::task::JoinHandle<()> {
    info!(worker = %worker.id, "spawning worker");
    tokio::spawn(worker.run())
}
