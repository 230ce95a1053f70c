//! Per-job datum dispatch.
//!
//! The dispatcher owns everything about one job's datums: the ready
//! queue feeding the pool (bounded, so sends wait when workers are
//! saturated), the claim table, retry scheduling and the verdict.

use crate::cache::DatumCache;
use crate::datum::{Datum, DatumId};
use crate::pool::WorkerPool;
use crate::queue::{AttemptResult, ClaimTable, DatumReport, JobContext, OutputGate, WorkTask, WorkerEvent};
use crate::runner::DatumRunner;
use crate::stats::{DatumCounts, DatumOutcome, DatumStats, JobStats};
use serde::{Deserialize, Serialize};
use sluice_core::{Backoff, CommitId, CoreError, CoreResult, JobId, retry_transient};
use sluice_storage::{FileTree, VersionedStore};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How many permanently failed datums a best-effort job tolerates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureThreshold {
    /// At most this many failed datums
    Count(u64),
    /// At most this percentage (0-100) of the job's datums
    Percent(u8),
}

/// What permanent datum failures do to a job
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// The first permanent failure fails the job, stops dispatch and
    /// discards every staged output
    #[default]
    FailFast,
    /// Every datum is attempted and successful outputs are kept; the job
    /// succeeds if the failures stay within the threshold
    BestEffort {
        /// Tolerated failures
        threshold: FailureThreshold,
    },
}

impl FailurePolicy {
    /// Whether `failed` out of `total` datums is an acceptable result
    #[must_use]
    pub fn allows(&self, failed: u64, total: u64) -> bool {
        match self {
            Self::FailFast => failed == 0,
            Self::BestEffort {
                threshold: FailureThreshold::Count(n),
            } => failed <= *n,
            Self::BestEffort {
                threshold: FailureThreshold::Percent(p),
            } => failed.saturating_mul(100) <= u64::from(*p).saturating_mul(total),
        }
    }

    /// Whether outputs of successful datums survive a failed job
    #[must_use]
    pub fn keeps_partial_output(&self) -> bool {
        matches!(self, Self::BestEffort { .. })
    }
}

/// Everything needed to dispatch one job
#[derive(Debug)]
pub struct DispatchRequest {
    /// Job being dispatched
    pub job: JobId,
    /// Datums in enumeration order
    pub datums: Vec<Datum>,
    /// Output repository
    pub output_repo: String,
    /// Open output commit
    pub output_commit: CommitId,
    /// Transform
    pub runner: Arc<dyn DatumRunner>,
    /// Executions per datum before it fails permanently
    pub tries: u32,
    /// Per-attempt execution limit
    pub timeout: Duration,
    /// Delay between retries
    pub backoff: Backoff,
    /// Failure tolerance
    pub policy: FailurePolicy,
    /// Collect per-datum statistics
    pub enable_stats: bool,
    /// Outputs of previously processed datums
    pub cache: Option<DatumCache>,
    /// Stops dispatch when fired
    pub cancel: CancellationToken,
    /// Receives counters as they change
    pub progress: Option<watch::Sender<DatumCounts>>,
}

impl DispatchRequest {
    /// Create a request with default retry and failure settings
    #[must_use]
    pub fn new(
        job: JobId,
        datums: Vec<Datum>,
        output_repo: impl Into<String>,
        output_commit: CommitId,
        runner: Arc<dyn DatumRunner>,
    ) -> Self {
        Self {
            job,
            datums,
            output_repo: output_repo.into(),
            output_commit,
            runner,
            tries: 3,
            timeout: Duration::from_secs(300),
            backoff: Backoff::default(),
            policy: FailurePolicy::FailFast,
            enable_stats: false,
            cache: None,
            cancel: CancellationToken::new(),
            progress: None,
        }
    }

    /// Set executions per datum
    #[must_use]
    pub fn with_tries(mut self, tries: u32) -> Self {
        self.tries = tries.max(1);
        self
    }

    /// Set the per-attempt timeout
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the retry backoff
    #[must_use]
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Set the failure policy
    #[must_use]
    pub fn with_policy(mut self, policy: FailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Enable or disable statistics
    #[must_use]
    pub fn with_stats(mut self, enable: bool) -> Self {
        self.enable_stats = enable;
        self
    }

    /// Use a datum cache
    #[must_use]
    pub fn with_cache(mut self, cache: DatumCache) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Use a cancellation token
    #[must_use]
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Publish progress counters
    #[must_use]
    pub fn with_progress(mut self, progress: watch::Sender<DatumCounts>) -> Self {
        self.progress = Some(progress);
        self
    }
}

/// How a dispatch ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DispatchVerdict {
    /// Every datum settled within the failure policy
    Success,
    /// The failure policy was violated
    Failure {
        /// Human-readable reason
        reason: String,
    },
    /// Dispatch was cancelled
    Cancelled,
}

/// Result of dispatching one job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchOutcome {
    /// Verdict
    pub verdict: DispatchVerdict,
    /// Final counters
    pub counts: DatumCounts,
    /// Permanently failed datums
    pub failed: Vec<DatumId>,
    /// Per-datum statistics, when enabled
    pub stats: Option<JobStats>,
}

struct Dispatch {
    store: VersionedStore,
    ctx: Arc<JobContext>,
    datums: Vec<Arc<Datum>>,
    claims: ClaimTable,
    ready: VecDeque<(usize, u32)>,
    delayed: Vec<(Instant, usize, u32)>,
    counts: DatumCounts,
    failed: Vec<DatumId>,
    stats: BTreeMap<usize, DatumStats>,
    tries: u32,
    backoff: Backoff,
    policy: FailurePolicy,
    cache: Option<DatumCache>,
    progress: Option<watch::Sender<DatumCounts>>,
    stop: Option<String>,
}

impl Dispatch {
    async fn schedule(&mut self, index: usize, attempt: u32, delay: Duration) {
        self.claims.queue(index, attempt);
        self.ctx.gate.admit(index, attempt).await;
        if delay.is_zero() {
            self.ready.push_back((index, attempt));
        } else {
            self.delayed.push((Instant::now() + delay, index, attempt));
        }
    }

    fn publish(&self) {
        if let Some(progress) = &self.progress {
            progress.send_replace(self.counts);
        }
    }

    fn promote_delayed(&mut self, now: Instant) {
        let (due, later): (Vec<_>, Vec<_>) = self.delayed.drain(..).partition(|(at, _, _)| *at <= now);
        self.delayed = later;
        self.ready.extend(due.into_iter().map(|(_, i, a)| (i, a)));
    }

    async fn reap(&mut self, now: Instant) {
        for (index, claim) in self.claims.expired(now) {
            let next = claim.attempt + 1;
            warn!(
                job = %self.ctx.job,
                datum = %self.datums[index].id.short(),
                attempt = claim.attempt,
                worker = ?claim.worker,
                "datum claim expired, redispatching"
            );
            self.counts.record_recovery();
            self.schedule(index, next, Duration::ZERO).await;
        }
    }

    /// Stage a previous run's output without executing the datum
    async fn stage_cached(&mut self, index: usize, output: FileTree) -> CoreResult<()> {
        let datum = self.datums[index].clone();
        self.ctx.gate.admit(index, 0).await;
        let backoff = self.backoff.clone();
        retry_transient(&backoff, "stage cached datum", || {
            self.ctx
                .gate
                .stage(&self.store, index, &datum.id, 0, output.clone())
        })
        .await?;
        self.ctx.gate.settle(index).await;
        self.counts.record_skip();
        if let Some(stat) = self.stats.get_mut(&index) {
            stat.outcome = DatumOutcome::Skipped;
        }
        debug!(job = %self.ctx.job, datum = %datum.id.short(), "datum skipped, output cached");
        Ok(())
    }

    async fn handle(&mut self, event: WorkerEvent) {
        match event {
            WorkerEvent::Claimed {
                index,
                attempt,
                worker,
            } => {
                if self.claims.claim(index, attempt, worker) {
                    if let Some(stat) = self.stats.get_mut(&index) {
                        stat.attempts += 1;
                        stat.worker = Some(worker);
                    }
                    debug!(job = %self.ctx.job, datum = %self.datums[index].id.short(), attempt, worker = %worker, "datum claimed");
                }
            }
            WorkerEvent::Heartbeat { index, attempt } => {
                self.claims.heartbeat(index, attempt);
            }
            WorkerEvent::Finished(report) => self.finished(report).await,
        }
    }

    async fn finished(&mut self, report: DatumReport) {
        if self.claims.current(report.index, report.attempt).is_none() {
            debug!(job = %self.ctx.job, datum = %report.datum.short(), attempt = report.attempt, "ignoring stale result");
            return;
        }
        if let Some(stat) = self.stats.get_mut(&report.index) {
            stat.duration_ms = report.duration.as_millis() as u64;
            stat.worker = Some(report.worker);
        }

        let reason = match report.result {
            AttemptResult::Staged(output) => {
                self.claims.settle(report.index);
                self.ctx.gate.settle(report.index).await;
                self.counts.record_processed();
                if let Some(cache) = &self.cache {
                    cache.insert(report.datum, output);
                }
                if let Some(stat) = self.stats.get_mut(&report.index) {
                    stat.outcome = DatumOutcome::Success;
                }
                debug!(job = %self.ctx.job, datum = %report.datum.short(), "datum succeeded");
                self.publish();
                return;
            }
            AttemptResult::Refused => "output refused".to_string(),
            AttemptResult::Failed(reason) => reason,
        };

        let failures = self.claims.record_failure(report.index);
        if failures < self.tries {
            let delay = self.backoff.delay_for(failures);
            debug!(
                job = %self.ctx.job,
                datum = %report.datum.short(),
                failures,
                delay_ms = delay.as_millis() as u64,
                "retrying datum"
            );
            self.schedule(report.index, report.attempt + 1, delay).await;
            return;
        }

        error!(job = %self.ctx.job, datum = %report.datum.short(), failures, reason = %reason, "datum failed permanently");
        self.claims.settle(report.index);
        self.ctx.gate.settle(report.index).await;
        self.counts.record_failure();
        self.failed.push(report.datum);
        if let Some(stat) = self.stats.get_mut(&report.index) {
            stat.outcome = DatumOutcome::Failed {
                reason: reason.clone(),
            };
        }
        if !self.policy.keeps_partial_output() {
            self.stop = Some(format!("datum {} failed: {}", report.datum.short(), reason));
        }
        self.publish();
    }

    fn verdict(&self) -> DispatchVerdict {
        if let Some(reason) = &self.stop {
            return DispatchVerdict::Failure {
                reason: reason.clone(),
            };
        }
        if self.policy.allows(self.counts.failed, self.counts.total) {
            if self.counts.failed > 0 {
                warn!(job = %self.ctx.job, failed = self.counts.failed, "datum failures within tolerance");
            }
            DispatchVerdict::Success
        } else {
            DispatchVerdict::Failure {
                reason: format!(
                    "{} of {} datums failed",
                    self.counts.failed, self.counts.total
                ),
            }
        }
    }
}

/// Dispatch one job's datums to `pool` and wait until every datum has a
/// final outcome, the failure policy stops the job, or `cancel` fires.
///
/// On return the job's output gate is closed: no worker can stage output
/// for this job any more, so callers may discard or finish the commit.
///
/// # Errors
///
/// Returns error if the pool is shut down or a cached output cannot be
/// staged
pub async fn dispatch(pool: &WorkerPool, request: DispatchRequest) -> CoreResult<DispatchOutcome> {
    let started = Instant::now();
    let (events, mut events_rx) = mpsc::unbounded_channel();
    let job_cancel = request.cancel.child_token();
    let ctx = Arc::new(JobContext {
        job: request.job,
        runner: request.runner,
        timeout: request.timeout,
        gate: Arc::new(OutputGate::new(request.output_repo, request.output_commit)),
        events,
        cancel: job_cancel.clone(),
    });

    let datums: Vec<Arc<Datum>> = request.datums.into_iter().map(Arc::new).collect();
    let stats = datums
        .iter()
        .map(|d| {
            (
                d.index,
                DatumStats {
                    datum: d.id,
                    index: d.index,
                    attempts: 0,
                    worker: None,
                    duration_ms: 0,
                    outcome: DatumOutcome::Abandoned,
                },
            )
        })
        .collect();

    let mut state = Dispatch {
        store: pool.store().clone(),
        ctx: ctx.clone(),
        counts: DatumCounts::new(datums.len() as u64),
        datums,
        claims: ClaimTable::new(pool.config().claim_timeout()),
        ready: VecDeque::new(),
        delayed: Vec::new(),
        failed: Vec::new(),
        stats,
        tries: request.tries.max(1),
        backoff: request.backoff,
        policy: request.policy,
        cache: request.cache,
        progress: request.progress,
        stop: None,
    };

    let mut cached = 0usize;
    for index in 0..state.datums.len() {
        let hit = state
            .cache
            .as_ref()
            .and_then(|cache| cache.get(&state.datums[index].id));
        match hit {
            Some(output) => {
                state.stage_cached(index, output).await?;
                cached += 1;
            }
            None => state.schedule(index, 1, Duration::ZERO).await,
        }
    }
    state.publish();
    info!(
        job = %ctx.job,
        datums = state.datums.len(),
        cached,
        policy = ?state.policy,
        "dispatch started"
    );

    let sender = pool.sender();
    let tick = (pool.config().heartbeat_interval() / 2).clamp(Duration::from_millis(5), Duration::from_millis(100));
    let mut ticker = tokio::time::interval(tick);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let verdict = loop {
        if state.stop.is_some() || state.claims.is_empty() {
            break state.verdict();
        }
        tokio::select! {
            biased;
            () = request.cancel.cancelled() => {
                info!(job = %ctx.job, "dispatch cancelled");
                break DispatchVerdict::Cancelled;
            }
            Some(event) = events_rx.recv() => state.handle(event).await,
            permit = sender.reserve(), if !state.ready.is_empty() => {
                let permit = permit.map_err(|_| CoreError::unavailable("worker pool", "work queue closed"))?;
                if let Some((index, attempt)) = state.ready.pop_front() {
                    permit.send(WorkTask {
                        ctx: ctx.clone(),
                        datum: state.datums[index].clone(),
                        attempt,
                    });
                }
            }
            _ = ticker.tick() => {
                let now = Instant::now();
                state.reap(now).await;
                state.promote_delayed(now);
            }
        }
    };

    job_cancel.cancel();
    ctx.gate.close().await;
    state.publish();

    let outstanding = state.claims.outstanding();
    if !outstanding.is_empty() {
        debug!(job = %ctx.job, outstanding = outstanding.len(), "abandoning unsettled datums");
    }
    info!(
        job = %ctx.job,
        verdict = ?verdict,
        processed = state.counts.processed,
        skipped = state.counts.skipped,
        failed = state.counts.failed,
        recovered = state.counts.recovered,
        "dispatch finished"
    );

    let total_duration_ms = started.elapsed().as_millis() as u64;
    Ok(DispatchOutcome {
        verdict,
        counts: state.counts,
        failed: state.failed,
        stats: request.enable_stats.then(|| JobStats {
            counts: state.counts,
            datums: state.stats.into_values().collect(),
            total_duration_ms,
        }),
    })
}
