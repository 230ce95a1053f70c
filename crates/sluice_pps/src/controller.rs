//! Pipeline controllers.
//!
//! Every replica runs one controller per pipeline. Controllers campaign
//! for the pipeline's lease and only the holder acts: it turns finished
//! input commits into jobs, drives released jobs one at a time in
//! creation order, and finishes output commits a crash left open. The
//! lease is re-validated before every commit start or finish.

use crate::catalog::{Catalog, job_key, leader_resource};
use crate::config::ControllerConfig;
use crate::inputs;
use crate::job::{InputCommit, JobRecord, JobState};
use crate::pipeline::PipelineSpec;
use crate::pools::PoolRegistry;
use crate::runtime::RunnerRegistry;
use sluice_coord::{KvEntry, KvEvent, KvWatch, LeaderElection, LeaseManager, Leadership};
use sluice_core::{CommitId, CoreError, CoreResult, JobId, ReplicaId, Timestamp};
use sluice_storage::{CommitOrigin, VersionedStore};
use sluice_worker::{
    DatumCache, DatumCounts, DatumRunner, DispatchRequest, DispatchVerdict, JobStats, WorkerPool,
    dispatch, enumerate,
};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Input names fed by one branch, and the commit just finished on it
type Trigger = (Vec<String>, CommitId);

/// Services shared by every controller of a cluster
#[derive(Debug, Clone)]
pub struct ControllerContext {
    /// Pipeline and job records
    pub catalog: Catalog,
    /// Versioned store
    pub store: VersionedStore,
    /// Leadership leases
    pub leases: LeaseManager,
    /// Transform runners
    pub runners: RunnerRegistry,
    /// Worker pools
    pub pools: PoolRegistry,
    /// Controller settings
    pub config: ControllerConfig,
}

/// One replica's controller for one pipeline
#[derive(Debug)]
pub struct PipelineController {
    pipeline: String,
    replica: ReplicaId,
    ctx: ControllerContext,
}

impl PipelineController {
    /// Create a controller
    #[must_use]
    pub fn new(pipeline: impl Into<String>, replica: ReplicaId, ctx: ControllerContext) -> Self {
        Self {
            pipeline: pipeline.into(),
            replica,
            ctx,
        }
    }

    /// Pipeline controlled
    #[must_use]
    pub fn pipeline(&self) -> &str {
        &self.pipeline
    }

    /// Campaign, lead while the lease holds, and campaign again after
    /// losing it, until `shutdown` fires. The lease is released on
    /// shutdown.
    pub async fn run(self, shutdown: CancellationToken) {
        let election = LeaderElection::new(
            self.ctx.config.election(),
            self.ctx.leases.clone(),
            leader_resource(&self.pipeline),
            self.replica.to_string(),
        );
        loop {
            let leadership = match election.campaign(&shutdown).await {
                Ok(leadership) => leadership,
                Err(CoreError::Cancelled) => break,
                Err(err) => {
                    warn!(pipeline = %self.pipeline, replica = %self.replica, error = %err, "campaign failed");
                    if pause(&shutdown, self.ctx.config.recovery_interval()).await {
                        break;
                    }
                    continue;
                }
            };

            let result = self.lead(&leadership, &shutdown).await;
            let lost = leadership.lost().is_cancelled();
            match result {
                Ok(()) => {}
                Err(CoreError::NotLeader { .. }) => {
                    info!(pipeline = %self.pipeline, replica = %self.replica, "leadership lost");
                }
                Err(err) => {
                    error!(pipeline = %self.pipeline, replica = %self.replica, error = %err, "controller failed, stepping down");
                }
            }

            if shutdown.is_cancelled() || !lost {
                if let Err(err) = leadership.resign().await {
                    warn!(pipeline = %self.pipeline, error = %err, "could not release lease");
                }
            }
            if shutdown.is_cancelled() || pause(&shutdown, self.ctx.config.recovery_interval()).await {
                break;
            }
        }
        info!(pipeline = %self.pipeline, replica = %self.replica, "controller stopped");
    }

    async fn lead(&self, leadership: &Leadership, shutdown: &CancellationToken) -> CoreResult<()> {
        let spec = self.ctx.catalog.pipeline(&self.pipeline).await?.spec;
        let (pool, cache) = self.ctx.pools.workers(&spec).await;
        let runner = self.ctx.runners.runner_for(&spec.transform);
        let scope = link(shutdown, &leadership.lost());
        info!(pipeline = %spec.name, replica = %self.replica, "leading pipeline");

        let leader = Leader {
            ctx: &self.ctx,
            replica: self.replica,
            spec,
            leadership,
            scope: scope.clone(),
            pool,
            cache,
            runner,
        };
        let result = leader.serve().await;
        scope.cancel();
        result
    }
}

/// Sleep unless cancelled first; returns whether it was cancelled
async fn pause(token: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        _ = token.cancelled() => true,
        _ = tokio::time::sleep(duration) => false,
    }
}

/// Token cancelled when either input is
fn link(a: &CancellationToken, b: &CancellationToken) -> CancellationToken {
    let scope = a.child_token();
    let (b, linked) = (b.clone(), scope.clone());
    tokio::spawn(async move {
        tokio::select! {
            _ = b.cancelled() => linked.cancel(),
            _ = linked.cancelled() => {}
        }
    });
    scope
}

/// State of a controller while it holds the lease
struct Leader<'a> {
    ctx: &'a ControllerContext,
    replica: ReplicaId,
    spec: PipelineSpec,
    leadership: &'a Leadership,
    scope: CancellationToken,
    pool: Arc<WorkerPool>,
    cache: DatumCache,
    runner: Arc<dyn DatumRunner>,
}

impl Leader<'_> {
    async fn serve(&self) -> CoreResult<()> {
        self.ensure_input_branches().await?;
        self.recover(true).await?;

        let (tx, mut triggers) = mpsc::unbounded_channel();
        let heads = self.subscribe(&tx).await?;
        self.trigger(&heads).await?;

        let stop = self.scope.child_token();
        let (served, ()) = tokio::join!(
            async {
                let result = self.serve_loop(&mut triggers).await;
                stop.cancel();
                result
            },
            self.recovery_loop(&stop),
        );
        drop(tx);
        served
    }

    async fn serve_loop(&self, triggers: &mut mpsc::UnboundedReceiver<Trigger>) -> CoreResult<()> {
        let mut ticker = tokio::time::interval(self.ctx.config.recovery_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            let mut jobs = self.ctx.catalog.watch_jobs();
            self.run_pending().await?;
            loop {
                tokio::select! {
                    biased;
                    _ = self.scope.cancelled() => return Ok(()),
                    trigger = triggers.recv() => match trigger {
                        Some((names, commit)) => {
                            let pins: Vec<(String, CommitId)> =
                                names.into_iter().map(|name| (name, commit)).collect();
                            self.trigger(&pins).await?;
                            break;
                        }
                        None => return Ok(()),
                    },
                    event = jobs.next() => match event? {
                        KvEvent::Put(entry) if self.wants(&entry) => break,
                        _ => {}
                    },
                    _ = ticker.tick() => break,
                }
            }
        }
    }

    /// Whether a job record change may give this leader work
    fn wants(&self, entry: &KvEntry) -> bool {
        serde_json::from_slice::<JobRecord>(&entry.value)
            .map(|job| job.pipeline == self.spec.name && job.released && !job.state.is_terminal())
            .unwrap_or(false)
    }

    async fn recovery_loop(&self, stop: &CancellationToken) {
        let mut ticker = tokio::time::interval(self.ctx.config.recovery_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = stop.cancelled() => return,
                _ = ticker.tick() => {
                    if let Err(err) = self.recover(false).await {
                        warn!(pipeline = %self.spec.name, error = %err, "recovery scan failed");
                    }
                }
            }
        }
    }

    async fn ensure_input_branches(&self) -> CoreResult<()> {
        for (_, repo, branch) in self.spec.repo_inputs() {
            ensure_branch(&self.ctx.store, repo, branch).await?;
        }
        Ok(())
    }

    /// Subscribe to every input branch. A branch whose commits already
    /// fed a job of this pipeline resumes after the newest such commit,
    /// so commits finished while no leader ran are replayed. Any other
    /// branch starts from its current head, which is returned pinned per
    /// input.
    async fn subscribe(&self, tx: &mpsc::UnboundedSender<Trigger>) -> CoreResult<Vec<(String, CommitId)>> {
        let mut branches: BTreeMap<(&str, &str), Vec<String>> = BTreeMap::new();
        for (input, repo, branch) in self.spec.repo_inputs() {
            branches.entry((repo, branch)).or_default().push(input.name.clone());
        }
        let seen: HashSet<CommitId> = self
            .ctx
            .catalog
            .jobs(Some(&self.spec.name))
            .await?
            .iter()
            .flat_map(|job| job.inputs.iter().filter_map(InputCommit::commit_id))
            .collect();

        let mut heads = Vec::new();
        for ((repo, branch), names) in branches {
            let finished = self.ctx.store.finished_commits(repo, branch).await?;
            let start = match finished.iter().rposition(|id| seen.contains(id)) {
                Some(index) => {
                    debug!(
                        pipeline = %self.spec.name,
                        repo,
                        branch,
                        commit = %finished[index],
                        missed = finished.len() - index - 1,
                        "resuming input branch"
                    );
                    Some(finished[index])
                }
                None => {
                    let head = finished.last().copied();
                    if let Some(head) = head {
                        heads.extend(names.iter().map(|name| (name.clone(), head)));
                    }
                    head
                }
            };
            let mut subscription = self.ctx.store.subscribe_branch(repo, branch, start).await?;
            let (scope, tx) = (self.scope.clone(), tx.clone());
            let pipeline = self.spec.name.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = scope.cancelled() => break,
                        next = subscription.next() => match next {
                            Ok(commit) => {
                                debug!(pipeline = %pipeline, repo = %commit.repo, commit = %commit.id, "input commit finished");
                                if tx.send((names.clone(), commit.id)).is_err() {
                                    break;
                                }
                            }
                            Err(err) => {
                                warn!(pipeline = %pipeline, error = %err, "branch subscription ended");
                                break;
                            }
                        }
                    }
                }
            });
        }
        Ok(heads)
    }

    /// Create, or release, the job for an input commit set
    async fn trigger(&self, pins: &[(String, CommitId)]) -> CoreResult<()> {
        let inputs = match inputs::resolve(&self.ctx.store, &self.spec, pins).await {
            Ok(Some(inputs)) => inputs,
            Ok(None) => {
                debug!(pipeline = %self.spec.name, "inputs not ready");
                return Ok(());
            }
            Err(err) if err.is_transient() => return Err(err),
            Err(err) => {
                warn!(pipeline = %self.spec.name, error = %err, "cannot resolve inputs, ignoring trigger");
                return Ok(());
            }
        };

        let record = JobRecord::new(&self.spec.name, self.spec.output_repo(), inputs, true);
        let (job, created) = self.ctx.catalog.create_job_once(&record).await?;
        if created {
            info!(pipeline = %self.spec.name, job = %job.id, inputs = %job.input_key, "job created");
        } else if !job.released && !job.state.is_terminal() {
            self.ctx
                .catalog
                .update_job(&job.id, |mut j| {
                    j.released = true;
                    Ok(j)
                })
                .await?;
            info!(pipeline = %self.spec.name, job = %job.id, "job released by trigger");
        } else {
            debug!(pipeline = %self.spec.name, job = %job.id, state = %job.state, "duplicate trigger ignored");
        }
        Ok(())
    }

    /// Drive released jobs, oldest first, until none is left
    async fn run_pending(&self) -> CoreResult<()> {
        while !self.scope.is_cancelled() {
            let jobs = self.ctx.catalog.jobs(Some(&self.spec.name)).await?;
            let Some(job) = jobs
                .into_iter()
                .find(|j| j.released && !j.state.is_terminal())
            else {
                return Ok(());
            };
            if let Some(previous) = job.leader {
                if previous != self.replica && !job.is_stale(self.ctx.config.job_liveness_ms) {
                    debug!(pipeline = %self.spec.name, job = %job.id, previous = %previous, "waiting for job of previous leader to go stale");
                    return Ok(());
                }
            }
            self.drive(job).await?;
        }
        Ok(())
    }

    /// Read-modify-write a job unless it was killed. `Ok(None)` means it
    /// was.
    async fn update<F>(&self, id: &JobId, mut change: F) -> CoreResult<Option<JobRecord>>
    where
        F: FnMut(&mut JobRecord) -> CoreResult<()>,
    {
        let result = self
            .ctx
            .catalog
            .update_job(id, |mut job| {
                if job.state == JobState::Killed {
                    return Err(CoreError::Cancelled);
                }
                change(&mut job)?;
                Ok(job)
            })
            .await;
        match result {
            Ok(job) => Ok(Some(job)),
            Err(CoreError::Cancelled) => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn drive(&self, job: JobRecord) -> CoreResult<()> {
        let id = job.id;
        let replica = self.replica;
        self.leadership.validate().await?;
        info!(pipeline = %self.spec.name, job = %id, state = %job.state, "driving job");

        let Some(job) = self
            .update(&id, |j| {
                j.leader = Some(replica);
                j.heartbeat = Some(Timestamp::now());
                Ok(())
            })
            .await?
        else {
            return self.close_killed(&job).await;
        };

        let commit = match job.output_commit {
            Some(commit) => commit,
            None => {
                self.leadership.validate().await?;
                let info = self
                    .ctx
                    .store
                    .start_output_commit(&job.output_repo, &self.spec.output_branch, None)
                    .await?;
                let recorded = self
                    .update(&id, |j| {
                        j.output_commit = Some(info.id);
                        Ok(())
                    })
                    .await?;
                if recorded.is_none() {
                    info!(pipeline = %self.spec.name, job = %id, "job killed while starting");
                    return self.close_output(info.id, true).await;
                }
                info.id
            }
        };

        let datums = match inputs::load_trees(&self.ctx.store, &self.spec, &job.inputs).await {
            Ok(trees) => enumerate(&self.spec.salt(), &trees, self.spec.join),
            Err(err) if err.is_transient() => return Err(err),
            Err(err) => {
                let reason = format!("cannot load inputs: {}", err);
                return self.conclude(&id, commit, JobState::Failure, Some(reason), None, None).await;
            }
        };

        let total = datums.len() as u64;
        let running = self
            .update(&id, |j| {
                j.advance(JobState::Running)?;
                j.counts = DatumCounts::new(total);
                j.heartbeat = Some(Timestamp::now());
                Ok(())
            })
            .await?;
        if running.is_none() {
            return self.close_output(commit, true).await;
        }
        info!(pipeline = %self.spec.name, job = %id, commit = %commit, datums = total, "job running");

        let cancel = self.scope.child_token();
        let kill = CancellationToken::new();
        let done = CancellationToken::new();
        let (progress, progress_rx) = watch::channel(DatumCounts::new(total));
        let request = DispatchRequest::new(id, datums, self.spec.output_repo(), commit, self.runner.clone())
            .with_tries(self.spec.datum_tries)
            .with_timeout(Duration::from_millis(self.spec.datum_timeout_ms))
            .with_backoff(self.pool.config().datum_backoff.clone())
            .with_policy(self.spec.failure_policy)
            .with_stats(self.spec.enable_stats)
            .with_cache(self.cache.clone())
            .with_cancel(cancel.clone())
            .with_progress(progress);

        let (outcome, ()) = tokio::join!(
            async {
                let outcome = dispatch(&self.pool, request).await;
                done.cancel();
                outcome
            },
            self.monitor(&id, progress_rx, &done, &cancel, &kill),
        );

        let killed = kill.is_cancelled() || self.ctx.catalog.job(&id).await?.state == JobState::Killed;
        if killed {
            info!(pipeline = %self.spec.name, job = %id, "job killed, discarding its output");
            return self.close_output(commit, true).await;
        }
        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(_) if self.scope.is_cancelled() => return Ok(()),
            Err(err) => {
                let reason = format!("dispatch failed: {}", err);
                return self.conclude(&id, commit, JobState::Failure, Some(reason), None, None).await;
            }
        };

        match outcome.verdict {
            DispatchVerdict::Success => {
                self.conclude(&id, commit, JobState::Success, None, Some(outcome.counts), outcome.stats)
                    .await
            }
            DispatchVerdict::Failure { reason } => {
                self.conclude(&id, commit, JobState::Failure, Some(reason), Some(outcome.counts), outcome.stats)
                    .await
            }
            DispatchVerdict::Cancelled => {
                info!(pipeline = %self.spec.name, job = %id, "dispatch interrupted, job left for the next leader");
                Ok(())
            }
        }
    }

    fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis((self.ctx.config.job_liveness_ms / 3).clamp(10, 1_000))
    }

    /// Persist progress and liveness while a job dispatches, and cancel
    /// dispatch as soon as the job is killed
    async fn monitor(
        &self,
        id: &JobId,
        progress: watch::Receiver<DatumCounts>,
        done: &CancellationToken,
        cancel: &CancellationToken,
        kill: &CancellationToken,
    ) {
        let mut record: Option<KvWatch> = Some(self.ctx.catalog.meta().watch(&job_key(id)));
        let mut ticker = tokio::time::interval(self.heartbeat_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            let killed = tokio::select! {
                biased;
                _ = done.cancelled() => return,
                event = async {
                    match record.as_mut() {
                        Some(w) => w.next().await,
                        None => std::future::pending().await,
                    }
                } => match event {
                    Ok(KvEvent::Put(entry)) => serde_json::from_slice::<JobRecord>(&entry.value)
                        .map(|job| job.state == JobState::Killed)
                        .unwrap_or(false),
                    Ok(KvEvent::Delete { .. }) => false,
                    Err(_) => {
                        record = None;
                        false
                    }
                },
                _ = ticker.tick() => {
                    let counts = *progress.borrow();
                    let update = self
                        .update(id, |j| {
                            j.counts = counts;
                            j.heartbeat = Some(Timestamp::now());
                            Ok(())
                        })
                        .await;
                    match update {
                        Ok(Some(_)) => false,
                        Ok(None) => true,
                        Err(err) => {
                            warn!(pipeline = %self.spec.name, job = %id, error = %err, "could not record job progress");
                            false
                        }
                    }
                }
            };
            if killed {
                info!(pipeline = %self.spec.name, job = %id, "job killed, stopping dispatch");
                kill.cancel();
                cancel.cancel();
                return;
            }
        }
    }

    /// Persist a terminal state, then finish the output commit
    async fn conclude(
        &self,
        id: &JobId,
        commit: CommitId,
        state: JobState,
        reason: Option<String>,
        counts: Option<DatumCounts>,
        stats: Option<JobStats>,
    ) -> CoreResult<()> {
        if let (true, Some(stats)) = (self.spec.enable_stats, stats.as_ref()) {
            self.ctx.catalog.put_stats(id, stats).await?;
        }
        let concluded = self
            .update(id, |j| {
                j.advance(state)?;
                j.reason = reason.clone();
                if let Some(counts) = counts {
                    j.counts = counts;
                }
                Ok(())
            })
            .await?;
        let Some(job) = concluded else {
            return self.close_output(commit, true).await;
        };

        match state {
            JobState::Success => {
                info!(pipeline = %self.spec.name, job = %id, processed = job.counts.processed, skipped = job.counts.skipped, "job succeeded");
            }
            _ => {
                error!(pipeline = %self.spec.name, job = %id, reason = job.reason.as_deref().unwrap_or(""), "job failed");
            }
        }
        let discard = state == JobState::Failure && !self.spec.failure_policy.keeps_partial_output();
        self.close_output(commit, discard).await
    }

    async fn close_killed(&self, job: &JobRecord) -> CoreResult<()> {
        match job.output_commit {
            Some(commit) => self.close_output(commit, true).await,
            None => Ok(()),
        }
    }

    /// Finish an output commit, optionally dropping its staged outputs.
    /// Finishing an already finished commit succeeds.
    async fn close_output(&self, commit: CommitId, discard: bool) -> CoreResult<()> {
        let repo = self.spec.output_repo();
        if discard {
            match self.ctx.store.discard_datum_outputs(repo, &commit).await {
                Ok(_) => {}
                Err(err) if err.is_already_finished() => {}
                Err(err) => return Err(err),
            }
        }
        self.leadership.validate().await?;
        match self.ctx.store.finish_commit(repo, &commit).await {
            Ok(info) => {
                info!(pipeline = %self.spec.name, commit = %commit, size = info.size_bytes, "finished output commit");
                Ok(())
            }
            Err(err) if err.is_already_finished() => {
                debug!(pipeline = %self.spec.name, commit = %commit, "output commit already finished");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Finish output commits of terminal jobs that are still open. At
    /// startup, also finish open output commits no job records.
    async fn recover(&self, startup: bool) -> CoreResult<()> {
        let repo = self.spec.output_repo();
        let jobs = self.ctx.catalog.jobs(Some(&self.spec.name)).await?;

        for job in jobs.iter().filter(|j| j.state.is_terminal()) {
            let Some(commit) = job.output_commit else {
                continue;
            };
            match self.ctx.store.inspect_commit(repo, &commit).await {
                Ok(info) if !info.is_finished() => {
                    warn!(pipeline = %self.spec.name, job = %job.id, state = %job.state, commit = %commit, "terminal job left its output commit open, finishing it");
                    let discard = job.state == JobState::Killed
                        || (job.state == JobState::Failure && !self.spec.failure_policy.keeps_partial_output());
                    self.close_output(commit, discard).await?;
                }
                Ok(_) => {}
                Err(err) if err.is_not_found() => {
                    warn!(pipeline = %self.spec.name, job = %job.id, commit = %commit, "output commit of job is missing");
                }
                Err(err) => return Err(err),
            }
        }

        for job in jobs
            .iter()
            .filter(|j| j.state == JobState::Running && j.is_stale(self.ctx.config.job_liveness_ms))
        {
            warn!(pipeline = %self.spec.name, job = %job.id, leader = ?job.leader, "running job is stale, it will be re-dispatched");
        }

        if startup {
            let referenced: HashSet<CommitId> = jobs.iter().filter_map(|j| j.output_commit).collect();
            for commit in self.ctx.store.list_commit(repo, None).await? {
                let orphan = !commit.is_finished()
                    && commit.origin == CommitOrigin::Output
                    && commit.branch.as_deref() == Some(self.spec.output_branch.as_str())
                    && !referenced.contains(&commit.id);
                if orphan {
                    warn!(pipeline = %self.spec.name, commit = %commit.id, "finishing orphaned output commit");
                    self.close_output(commit.id, true).await?;
                }
            }
        }
        Ok(())
    }
}

/// Create a branch unless it exists
///
/// # Errors
///
/// Returns error if the repository does not exist
pub async fn ensure_branch(store: &VersionedStore, repo: &str, branch: &str) -> CoreResult<()> {
    match store.inspect_branch(repo, branch).await {
        Ok(_) => Ok(()),
        Err(err) if err.is_not_found() => match store.create_branch(repo, branch, None).await {
            Ok(_) => Ok(()),
            Err(err) if err.is_already_exists() => Ok(()),
            Err(err) => Err(err),
        },
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::PipelineRecord;
    use crate::pipeline::{InputSpec, Transform};
    use sluice_coord::{MemoryKv, MetadataStore};
    use sluice_worker::{DatumFiles, FnRunner, Glob, OutputFile, RunError, WorkerConfig};

    struct Fixture {
        ctx: ControllerContext,
        shutdown: CancellationToken,
    }

    async fn fixture(spec: PipelineSpec) -> Fixture {
        let meta = MetadataStore::new(Arc::new(MemoryKv::new()));
        let store = VersionedStore::in_memory();
        let runners = RunnerRegistry::new();
        runners.register(
            "copy",
            Arc::new(FnRunner::new("copy", |d: &DatumFiles| -> Result<Vec<OutputFile>, RunError> {
                Ok(d.files.iter().map(|f| OutputFile::new(f.path.clone(), f.data.clone())).collect())
            })),
        );
        let ctx = ControllerContext {
            catalog: Catalog::new(meta.clone()),
            store: store.clone(),
            leases: LeaseManager::new(meta),
            runners,
            pools: PoolRegistry::new(
                store.clone(),
                WorkerConfig::new().with_claim_timeout(500).with_heartbeat_interval(20),
            ),
            config: ControllerConfig::new()
                .with_lease(1_000, 100)
                .with_recovery_interval(50)
                .with_job_liveness(300),
        };
        store.create_repo("in", "").await.unwrap();
        store.create_repo(&spec.name, "").await.unwrap();
        ctx.catalog
            .create_pipeline(&PipelineRecord {
                spec,
                created: Timestamp::now(),
            })
            .await
            .unwrap();
        Fixture {
            ctx,
            shutdown: CancellationToken::new(),
        }
    }

    fn spec() -> PipelineSpec {
        PipelineSpec::new("copy", Transform::new("copy", vec!["cp".into()]))
            .with_input(InputSpec::repo("in", "in", "master", Glob::Files))
    }

    async fn wait_terminal(catalog: &Catalog, id: &JobId) -> JobRecord {
        for _ in 0..400 {
            let job = catalog.job(id).await.unwrap();
            if job.state.is_terminal() {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {} never finished", id);
    }

    #[tokio::test]
    async fn test_trigger_runs_job_and_finishes_commit() {
        let f = fixture(spec()).await;
        let controller = PipelineController::new("copy", ReplicaId::new(), f.ctx.clone());
        let task = tokio::spawn(controller.run(f.shutdown.clone()));

        let c = f.ctx.store.start_commit("in", "master", None).await.unwrap();
        f.ctx.store.put_file("in", &c.id, "/a", b"1".to_vec()).await.unwrap();
        f.ctx.store.finish_commit("in", &c.id).await.unwrap();

        let id = JobRecord::new("copy", "copy", vec![InputCommit::commit("in", "in", c.id)], true).id;
        let mut job = None;
        for _ in 0..200 {
            if let Ok(j) = f.ctx.catalog.job(&id).await {
                job = Some(j);
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(job.is_some());
        let job = wait_terminal(&f.ctx.catalog, &id).await;
        assert_eq!(job.state, JobState::Success);

        let out = job.output_commit.unwrap();
        for _ in 0..200 {
            if f.ctx.store.inspect_commit("copy", &out).await.unwrap().is_finished() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(f.ctx.store.get_file("copy", &out, "/a").await.unwrap().as_ref(), b"1");

        f.shutdown.cancel();
        task.await.unwrap();
        assert!(f.ctx.leases.holder(&leader_resource("copy")).await.unwrap().is_none());
    }

    async fn commit_input(store: &VersionedStore, path: &str) -> CommitId {
        let c = store.start_commit("in", "master", None).await.unwrap();
        store.put_file("in", &c.id, path, b"x".to_vec()).await.unwrap();
        store.finish_commit("in", &c.id).await.unwrap();
        c.id
    }

    async fn wait_created(catalog: &Catalog, id: &JobId) {
        for _ in 0..200 {
            if catalog.job(id).await.is_ok() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {} never created", id);
    }

    #[tokio::test]
    async fn test_new_leader_replays_commits_finished_between_leaders() {
        let f = fixture(spec()).await;
        let job_for = |commit| JobRecord::new("copy", "copy", vec![InputCommit::commit("in", "in", commit)], true).id;

        let first = PipelineController::new("copy", ReplicaId::new(), f.ctx.clone());
        let task = tokio::spawn(first.run(f.shutdown.clone()));
        let c1 = commit_input(&f.ctx.store, "/one").await;
        wait_created(&f.ctx.catalog, &job_for(c1)).await;
        assert_eq!(wait_terminal(&f.ctx.catalog, &job_for(c1)).await.state, JobState::Success);
        f.shutdown.cancel();
        task.await.unwrap();

        let c2 = commit_input(&f.ctx.store, "/two").await;
        let c3 = commit_input(&f.ctx.store, "/three").await;

        let shutdown = CancellationToken::new();
        let second = PipelineController::new("copy", ReplicaId::new(), f.ctx.clone());
        let task = tokio::spawn(second.run(shutdown.clone()));
        for commit in [c2, c3] {
            wait_created(&f.ctx.catalog, &job_for(commit)).await;
            assert_eq!(wait_terminal(&f.ctx.catalog, &job_for(commit)).await.state, JobState::Success);
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(f.ctx.catalog.jobs(Some("copy")).await.unwrap().len(), 3);
        shutdown.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_first_leader_starts_at_head() {
        let f = fixture(spec()).await;
        let old = commit_input(&f.ctx.store, "/old").await;
        let head = commit_input(&f.ctx.store, "/head").await;

        let controller = PipelineController::new("copy", ReplicaId::new(), f.ctx.clone());
        let task = tokio::spawn(controller.run(f.shutdown.clone()));
        let id = JobRecord::new("copy", "copy", vec![InputCommit::commit("in", "in", head)], true).id;
        wait_created(&f.ctx.catalog, &id).await;
        assert_eq!(wait_terminal(&f.ctx.catalog, &id).await.state, JobState::Success);
        tokio::time::sleep(Duration::from_millis(100)).await;

        let jobs = f.ctx.catalog.jobs(Some("copy")).await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert!(jobs[0].inputs.iter().all(|i| i.commit_id() != Some(old)));
        f.shutdown.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_startup_finishes_orphaned_commit() {
        let f = fixture(spec()).await;
        let orphan = f
            .ctx
            .store
            .start_output_commit("copy", "master", None)
            .await
            .unwrap();

        let controller = PipelineController::new("copy", ReplicaId::new(), f.ctx.clone());
        let task = tokio::spawn(controller.run(f.shutdown.clone()));
        let mut finished = false;
        for _ in 0..200 {
            if f.ctx.store.inspect_commit("copy", &orphan.id).await.unwrap().is_finished() {
                finished = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(finished);
        f.shutdown.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_unreleased_job_waits() {
        let f = fixture(spec()).await;
        let c = f.ctx.store.start_commit("in", "master", None).await.unwrap();
        f.ctx.store.put_file("in", &c.id, "/a", b"1".to_vec()).await.unwrap();
        f.ctx.store.finish_commit("in", &c.id).await.unwrap();

        let other = f.ctx.store.start_commit("in", "master", None).await.unwrap();
        f.ctx.store.finish_commit("in", &other.id).await.unwrap();
        let manual = JobRecord::new("copy", "copy", vec![InputCommit::commit("in", "in", c.id)], false);
        f.ctx.catalog.create_job_once(&manual).await.unwrap();

        let controller = PipelineController::new("copy", ReplicaId::new(), f.ctx.clone());
        let task = tokio::spawn(controller.run(f.shutdown.clone()));
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(f.ctx.catalog.job(&manual.id).await.unwrap().state, JobState::Starting);

        f.ctx
            .catalog
            .update_job(&manual.id, |mut j| {
                j.released = true;
                Ok(j)
            })
            .await
            .unwrap();
        assert_eq!(wait_terminal(&f.ctx.catalog, &manual.id).await.state, JobState::Success);
        f.shutdown.cancel();
        task.await.unwrap();
    }
}
