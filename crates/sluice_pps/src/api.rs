//! Client-facing pipeline and job operations.
//!
//! The API only writes records; controllers observe them and act. A
//! malformed pipeline is rejected here, before any repository, commit
//! or job exists for it.

use crate::catalog::{Catalog, PipelineRecord};
use crate::controller::ensure_branch;
use crate::inputs;
use crate::job::{JobRecord, JobState, JobStatus};
use crate::pipeline::PipelineSpec;
use sluice_core::{CommitId, CoreError, CoreResult, JobId, Timestamp};
use sluice_storage::{BranchInfo, CommitInfo, VersionedStore};
use sluice_worker::JobStats;
use tracing::info;

/// Pipeline and job API over the catalog and the versioned store
#[derive(Debug, Clone)]
pub struct PpsApi {
    catalog: Catalog,
    store: VersionedStore,
}

impl PpsApi {
    /// Create an API handle
    #[must_use]
    pub fn new(catalog: Catalog, store: VersionedStore) -> Self {
        Self { catalog, store }
    }

    /// Validate and register a pipeline, creating its output repository
    /// and branch
    ///
    /// # Errors
    ///
    /// Returns `Validation` for a malformed spec, `NotFound` if an input
    /// repository is missing, `AlreadyExists` if the name is taken
    pub async fn create_pipeline(&self, spec: PipelineSpec) -> CoreResult<PipelineRecord> {
        spec.validate()?;
        match self.catalog.pipeline(&spec.name).await {
            Ok(_) => return Err(CoreError::already_exists("pipeline", &spec.name)),
            Err(err) if err.is_not_found() => {}
            Err(err) => return Err(err),
        }
        for (_, repo, _) in spec.repo_inputs() {
            self.store.inspect_repo(repo).await?;
        }

        for (_, repo, branch) in spec.repo_inputs() {
            ensure_branch(&self.store, repo, branch).await?;
        }
        match self
            .store
            .create_repo(spec.output_repo(), &format!("output of pipeline {}", spec.name))
            .await
        {
            Ok(_) => {}
            Err(err) if err.is_already_exists() => {}
            Err(err) => return Err(err),
        }
        ensure_branch(&self.store, spec.output_repo(), &spec.output_branch).await?;

        let record = PipelineRecord {
            spec,
            created: Timestamp::now(),
        };
        self.catalog.create_pipeline(&record).await?;
        info!(pipeline = %record.spec.name, inputs = record.spec.inputs.len(), "pipeline created");
        Ok(record)
    }

    /// Read a pipeline
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown pipeline
    pub async fn get_pipeline(&self, name: &str) -> CoreResult<PipelineRecord> {
        self.catalog.pipeline(name).await
    }

    /// Every pipeline
    ///
    /// # Errors
    ///
    /// Returns error if the coordinator cannot be read
    pub async fn list_pipelines(&self) -> CoreResult<Vec<PipelineRecord>> {
        self.catalog.pipelines().await
    }

    /// Create a job for explicit input commits without starting it.
    /// Inputs not named use their branch's latest finished commit.
    /// Creating the same input set again returns the existing job while
    /// it is in flight or succeeded; after a failed or killed job it
    /// creates a fresh one.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown pipeline or commit, `Validation`
    /// for unknown inputs, open commits, or inputs with no finished
    /// commit yet
    pub async fn create_job(&self, pipeline: &str, commits: &[(String, CommitId)]) -> CoreResult<JobRecord> {
        let spec = self.catalog.pipeline(pipeline).await?.spec;
        let inputs = inputs::resolve(&self.store, &spec, commits)
            .await?
            .ok_or_else(|| CoreError::validation("inputs", "an input branch has no finished commit"))?;
        let record = JobRecord::new(&spec.name, spec.output_repo(), inputs, false);
        let (job, created) = self.catalog.create_job_or_rerun(&record).await?;
        if created {
            info!(
                pipeline = %pipeline,
                job = %job.id,
                inputs = %job.input_key,
                generation = job.generation,
                "job created"
            );
        }
        Ok(job)
    }

    /// Release a created job to its pipeline's controller
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown job
    pub async fn start_job(&self, id: &JobId) -> CoreResult<JobRecord> {
        let job = self
            .catalog
            .update_job(id, |mut job| {
                job.released = true;
                Ok(job)
            })
            .await?;
        info!(job = %id, pipeline = %job.pipeline, "job started");
        Ok(job)
    }

    /// Current status of a job. `SUCCESS` is only reported once the
    /// output commit is finished.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown job
    pub async fn get_job_status(&self, id: &JobId) -> CoreResult<JobStatus> {
        let job = self.catalog.job(id).await?;
        let output_finished = match (job.state, job.output_commit) {
            (JobState::Success, Some(commit)) => {
                self.store.inspect_commit(&job.output_repo, &commit).await?.is_finished()
            }
            _ => false,
        };
        Ok(JobStatus::from_state(job.state, output_finished))
    }

    /// Full job record
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown job
    pub async fn inspect_job(&self, id: &JobId) -> CoreResult<JobRecord> {
        self.catalog.job(id).await
    }

    /// Jobs of a pipeline, or of every pipeline, oldest first
    ///
    /// # Errors
    ///
    /// Returns error if the coordinator cannot be read
    pub async fn list_jobs(&self, pipeline: Option<&str>) -> CoreResult<Vec<JobRecord>> {
        self.catalog.jobs(pipeline).await
    }

    /// Kill a job. Killing a killed job is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown job and `Validation` if it
    /// already succeeded or failed
    pub async fn kill_job(&self, id: &JobId) -> CoreResult<JobRecord> {
        let job = self
            .catalog
            .update_job(id, |mut job| {
                if job.state != JobState::Killed {
                    job.advance(JobState::Killed)?;
                    job.reason = Some("killed".to_string());
                }
                Ok(job)
            })
            .await?;
        info!(job = %id, pipeline = %job.pipeline, "job killed");
        Ok(job)
    }

    /// Per-datum statistics of a job, when its pipeline records them
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the job is unknown or has no statistics
    pub async fn get_job_stats(&self, id: &JobId) -> CoreResult<JobStats> {
        self.catalog.job(id).await?;
        self.catalog
            .stats(id)
            .await?
            .ok_or_else(|| CoreError::not_found("job stats", id))
    }

    /// Inspect a commit
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown repository or commit
    pub async fn inspect_commit(&self, repo: &str, commit: &CommitId) -> CoreResult<CommitInfo> {
        self.store.inspect_commit(repo, commit).await
    }

    /// Inspect a branch
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown repository or branch
    pub async fn inspect_branch(&self, repo: &str, branch: &str) -> CoreResult<BranchInfo> {
        self.store.inspect_branch(repo, branch).await
    }
}
