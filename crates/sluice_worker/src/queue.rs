//! Work items, worker reports, datum claims and the output gate.
//!
//! A dispatcher hands [`WorkTask`]s to a pool's bounded queue. Workers
//! answer on the task's event channel: a claim when they start, periodic
//! heartbeats, and one report when they finish. The dispatcher's
//! [`ClaimTable`] turns missing heartbeats into redispatch, and the
//! [`OutputGate`] makes sure only the current attempt of an unsettled
//! datum can stage output, and nothing can after the job ends.

use crate::datum::{Datum, DatumId};
use crate::runner::DatumRunner;
use sluice_core::{CommitId, CoreResult, JobId, WorkerId};
use sluice_storage::{FileTree, VersionedStore};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Per-job context shared by all of its tasks
#[derive(Debug)]
pub struct JobContext {
    /// Job being processed
    pub job: JobId,
    /// Transform
    pub runner: Arc<dyn DatumRunner>,
    /// Per-attempt execution limit
    pub timeout: Duration,
    /// Output admission for the job's output commit
    pub gate: Arc<OutputGate>,
    /// Channel back to the job's dispatcher
    pub events: mpsc::UnboundedSender<WorkerEvent>,
    /// Fires when the job stops dispatching
    pub cancel: CancellationToken,
}

/// One attempt at one datum
#[derive(Debug, Clone)]
pub struct WorkTask {
    /// Job context
    pub ctx: Arc<JobContext>,
    /// Datum to process
    pub datum: Arc<Datum>,
    /// Attempt number, starting at 1
    pub attempt: u32,
}

/// Result of one attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptResult {
    /// Output staged in the commit
    Staged(FileTree),
    /// Output was produced but refused by the gate
    Refused,
    /// Transform failed
    Failed(String),
}

/// Report of a finished attempt
#[derive(Debug, Clone)]
pub struct DatumReport {
    /// Enumeration index of the datum
    pub index: usize,
    /// Datum identity
    pub datum: DatumId,
    /// Attempt the report is for
    pub attempt: u32,
    /// Worker that ran it
    pub worker: WorkerId,
    /// What happened
    pub result: AttemptResult,
    /// Execution time
    pub duration: Duration,
}

/// Messages from workers to a dispatcher
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    /// A worker took the task off the queue
    Claimed {
        /// Datum index
        index: usize,
        /// Attempt
        attempt: u32,
        /// Worker
        worker: WorkerId,
    },
    /// The worker is still running the attempt
    Heartbeat {
        /// Datum index
        index: usize,
        /// Attempt
        attempt: u32,
    },
    /// The attempt finished
    Finished(DatumReport),
}

/// Outstanding claim on one datum
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claim {
    /// Current attempt
    pub attempt: u32,
    /// Failed executions so far
    pub failures: u32,
    /// Worker running the current attempt, once claimed
    pub worker: Option<WorkerId>,
    /// Liveness deadline, once claimed
    pub deadline: Option<Instant>,
}

/// Outstanding claims of one job, keyed by datum index
#[derive(Debug)]
pub struct ClaimTable {
    claims: HashMap<usize, Claim>,
    timeout: Duration,
}

impl ClaimTable {
    /// Create a table whose claims expire after `timeout` without a heartbeat
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self {
            claims: HashMap::new(),
            timeout,
        }
    }

    /// Track a queued datum
    pub fn queue(&mut self, index: usize, attempt: u32) {
        let claim = self.claims.entry(index).or_insert(Claim {
            attempt,
            failures: 0,
            worker: None,
            deadline: None,
        });
        claim.attempt = attempt;
        claim.worker = None;
        claim.deadline = None;
    }

    /// Record that `worker` started `attempt`. Returns false for a stale
    /// or unknown attempt.
    pub fn claim(&mut self, index: usize, attempt: u32, worker: WorkerId) -> bool {
        let deadline = Instant::now() + self.timeout;
        match self.claims.get_mut(&index) {
            Some(claim) if claim.attempt == attempt => {
                claim.worker = Some(worker);
                claim.deadline = Some(deadline);
                true
            }
            _ => false,
        }
    }

    /// Extend the deadline of a live attempt
    pub fn heartbeat(&mut self, index: usize, attempt: u32) -> bool {
        let deadline = Instant::now() + self.timeout;
        match self.claims.get_mut(&index) {
            Some(claim) if claim.attempt == attempt && claim.worker.is_some() => {
                claim.deadline = Some(deadline);
                true
            }
            _ => false,
        }
    }

    /// Claim of the current attempt, if `attempt` is current
    #[must_use]
    pub fn current(&self, index: usize, attempt: u32) -> Option<&Claim> {
        self.claims.get(&index).filter(|c| c.attempt == attempt)
    }

    /// Count a failed execution; returns the failures so far
    pub fn record_failure(&mut self, index: usize) -> u32 {
        match self.claims.get_mut(&index) {
            Some(claim) => {
                claim.failures += 1;
                claim.worker = None;
                claim.deadline = None;
                claim.failures
            }
            None => 0,
        }
    }

    /// Drop a datum with a final outcome
    pub fn settle(&mut self, index: usize) -> Option<Claim> {
        self.claims.remove(&index)
    }

    /// Claims whose deadline passed, in index order
    #[must_use]
    pub fn expired(&self, now: Instant) -> Vec<(usize, Claim)> {
        let mut expired: Vec<(usize, Claim)> = self
            .claims
            .iter()
            .filter(|(_, c)| c.deadline.is_some_and(|d| d <= now))
            .map(|(i, c)| (*i, c.clone()))
            .collect();
        expired.sort_by_key(|(i, _)| *i);
        expired
    }

    /// Datums without a final outcome
    #[must_use]
    pub fn len(&self) -> usize {
        self.claims.len()
    }

    /// Whether every tracked datum is settled
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.claims.is_empty()
    }

    /// Indexes of every unsettled datum
    #[must_use]
    pub fn outstanding(&self) -> Vec<usize> {
        let mut indexes: Vec<usize> = self.claims.keys().copied().collect();
        indexes.sort_unstable();
        indexes
    }
}

#[derive(Debug, Default)]
struct GateState {
    closed: bool,
    current: HashMap<usize, u32>,
}

/// Admission control for datum outputs of one job's output commit
#[derive(Debug)]
pub struct OutputGate {
    repo: String,
    commit: CommitId,
    state: Mutex<GateState>,
}

impl OutputGate {
    /// Create an open gate in front of an output commit
    #[must_use]
    pub fn new(repo: impl Into<String>, commit: CommitId) -> Self {
        Self {
            repo: repo.into(),
            commit,
            state: Mutex::new(GateState::default()),
        }
    }

    /// Output repository
    #[must_use]
    pub fn repo(&self) -> &str {
        &self.repo
    }

    /// Output commit
    #[must_use]
    pub fn commit(&self) -> &CommitId {
        &self.commit
    }

    /// Make `attempt` the only attempt of `index` allowed to stage
    pub async fn admit(&self, index: usize, attempt: u32) {
        self.state.lock().await.current.insert(index, attempt);
    }

    /// Stop admitting anything for `index`
    pub async fn settle(&self, index: usize) {
        self.state.lock().await.current.remove(&index);
    }

    /// Refuse every future write
    pub async fn close(&self) {
        let mut state = self.state.lock().await;
        state.closed = true;
        state.current.clear();
    }

    /// Whether the gate is closed
    pub async fn is_closed(&self) -> bool {
        self.state.lock().await.closed
    }

    /// Stage a datum output if `attempt` is admitted. The check and the
    /// write happen under one lock, so a concurrent close either precedes
    /// the write or follows it.
    ///
    /// # Errors
    ///
    /// Returns error if the store rejects the write
    pub async fn stage(
        &self,
        store: &VersionedStore,
        index: usize,
        datum: &DatumId,
        attempt: u32,
        output: FileTree,
    ) -> CoreResult<bool> {
        let state = self.state.lock().await;
        if state.closed || state.current.get(&index) != Some(&attempt) {
            debug!(datum = %datum.short(), attempt, "output refused");
            return Ok(false);
        }
        store
            .put_datum_output(&self.repo, &self.commit, &datum.to_string(), output)
            .await?;
        Ok(true)
    }
}
