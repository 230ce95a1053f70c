//! Pipeline, job and statistics records in the metadata store.
//!
//! Key layout:
//!
//! - `pipelines/<name>`: [`PipelineRecord`]
//! - `jobs/<job-id>`: [`JobRecord`]
//! - `stats/<job-id>`: [`JobStats`]
//!
//! Leadership leases live under `leases/pipeline/<name>`, owned by the
//! coordinator crate.

use crate::job::{JobRecord, JobState};
use crate::pipeline::PipelineSpec;
use serde::{Deserialize, Serialize};
use sluice_coord::{KvWatch, MetadataStore};
use sluice_core::{Backoff, CoreError, CoreResult, JobId, Timestamp, retry_transient};
use sluice_worker::JobStats;
use tracing::{debug, warn};

/// Prefix of pipeline records
pub const PIPELINE_PREFIX: &str = "pipelines/";
/// Prefix of job records
pub const JOB_PREFIX: &str = "jobs/";
/// Prefix of statistics records
pub const STATS_PREFIX: &str = "stats/";

/// Key of a pipeline record
#[must_use]
pub fn pipeline_key(name: &str) -> String {
    format!("{}{}", PIPELINE_PREFIX, name)
}

/// Key of a job record
#[must_use]
pub fn job_key(id: &JobId) -> String {
    format!("{}{}", JOB_PREFIX, id)
}

/// Key of a job's statistics
#[must_use]
pub fn stats_key(id: &JobId) -> String {
    format!("{}{}", STATS_PREFIX, id)
}

/// Lease resource guarding a pipeline's output branch
#[must_use]
pub fn leader_resource(pipeline: &str) -> String {
    format!("pipeline/{}", pipeline)
}

/// Persisted pipeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineRecord {
    /// The validated spec
    pub spec: PipelineSpec,
    /// Creation time
    pub created: Timestamp,
}

/// Typed access to pipeline, job and statistics records.
///
/// Transient coordinator errors are retried with the catalog's backoff
/// before they reach the caller.
#[derive(Debug, Clone)]
pub struct Catalog {
    meta: MetadataStore,
    backoff: Backoff,
}

impl Catalog {
    /// Create a catalog
    #[must_use]
    pub fn new(meta: MetadataStore) -> Self {
        Self {
            meta,
            backoff: Backoff::default(),
        }
    }

    /// Set the backoff used for transient errors
    #[must_use]
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Underlying metadata store
    #[must_use]
    pub fn meta(&self) -> &MetadataStore {
        &self.meta
    }

    /// Insert a pipeline record
    ///
    /// # Errors
    ///
    /// Returns `AlreadyExists` if the name is taken
    pub async fn create_pipeline(&self, record: &PipelineRecord) -> CoreResult<()> {
        let key = pipeline_key(&record.spec.name);
        retry_transient(&self.backoff, "create_pipeline", || self.meta.create_json(&key, record))
            .await
            .map_err(|err| match err {
                CoreError::AlreadyExists { .. } => CoreError::already_exists("pipeline", &record.spec.name),
                other => other,
            })?;
        Ok(())
    }

    /// Read a pipeline
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown pipeline
    pub async fn pipeline(&self, name: &str) -> CoreResult<PipelineRecord> {
        let key = pipeline_key(name);
        retry_transient(&self.backoff, "get_pipeline", || self.meta.get_json::<PipelineRecord>(&key))
            .await?
            .map(|v| v.value)
            .ok_or_else(|| CoreError::not_found("pipeline", name))
    }

    /// Every pipeline, by name
    ///
    /// # Errors
    ///
    /// Returns error if the coordinator cannot be read
    pub async fn pipelines(&self) -> CoreResult<Vec<PipelineRecord>> {
        let entries = retry_transient(&self.backoff, "list_pipelines", || {
            self.meta.list_json::<PipelineRecord>(PIPELINE_PREFIX)
        })
        .await?;
        Ok(entries.into_iter().map(|(_, v)| v.value).collect())
    }

    /// Insert a job unless its input set already has one. Returns the
    /// newest stored record of the set and whether this call created it.
    ///
    /// # Errors
    ///
    /// Returns error if the coordinator cannot be written
    pub async fn create_job_once(&self, record: &JobRecord) -> CoreResult<(JobRecord, bool)> {
        self.insert_job(record, false).await
    }

    /// Insert a job unless its input set has one in flight or one that
    /// succeeded. When every earlier job of the set failed or was killed,
    /// the record is stored as the next generation. Concurrent callers race for the same
    /// generation key, so at most one of them creates a job.
    ///
    /// # Errors
    ///
    /// Returns error if the coordinator cannot be written
    pub async fn create_job_or_rerun(&self, record: &JobRecord) -> CoreResult<(JobRecord, bool)> {
        self.insert_job(record, true).await
    }

    async fn insert_job(&self, record: &JobRecord, rerun: bool) -> CoreResult<(JobRecord, bool)> {
        let mut generation = 0;
        let mut latest: Option<JobRecord> = None;
        loop {
            let candidate = record.clone().with_generation(generation);
            match self.job(&candidate.id).await {
                Ok(existing) if !matches!(existing.state, JobState::Failure | JobState::Killed) => {
                    return Ok((existing, false));
                }
                Ok(existing) => {
                    latest = Some(existing);
                    generation += 1;
                    continue;
                }
                Err(err) if err.is_not_found() => {}
                Err(err) => return Err(err),
            }
            if let (false, Some(existing)) = (rerun, latest.take()) {
                return Ok((existing, false));
            }
            let key = job_key(&candidate.id);
            match retry_transient(&self.backoff, "create_job", || self.meta.create_json(&key, &candidate)).await {
                Ok(_) => return Ok((candidate, true)),
                Err(CoreError::AlreadyExists { .. }) => {
                    debug!(job = %candidate.id, pipeline = %candidate.pipeline, "job already exists");
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Read a job
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown job
    pub async fn job(&self, id: &JobId) -> CoreResult<JobRecord> {
        let key = job_key(id);
        retry_transient(&self.backoff, "get_job", || self.meta.get_json::<JobRecord>(&key))
            .await?
            .map(|v| v.value)
            .ok_or_else(|| CoreError::not_found("job", id))
    }

    /// Jobs, optionally of one pipeline, oldest first
    ///
    /// # Errors
    ///
    /// Returns error if the coordinator cannot be read
    pub async fn jobs(&self, pipeline: Option<&str>) -> CoreResult<Vec<JobRecord>> {
        let entries = retry_transient(&self.backoff, "list_jobs", || {
            self.meta.list_json::<JobRecord>(JOB_PREFIX)
        })
        .await?;
        let mut jobs: Vec<JobRecord> = entries
            .into_iter()
            .map(|(_, v)| v.value)
            .filter(|job| pipeline.is_none_or(|p| job.pipeline == p))
            .collect();
        jobs.sort_by(|a, b| a.created.cmp(&b.created).then_with(|| a.id.cmp(&b.id)));
        Ok(jobs)
    }

    /// Read-modify-write a job with compare-and-swap. Errors returned by
    /// `update` abort the write and are passed through.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown job, the error from `update`, or
    /// the last transient error once retries run out
    pub async fn update_job<F>(&self, id: &JobId, mut update: F) -> CoreResult<JobRecord>
    where
        F: FnMut(JobRecord) -> CoreResult<JobRecord>,
    {
        let key = job_key(id);
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.meta.update_json(&key, &mut update).await {
                Ok(v) => return Ok(v.value),
                Err(CoreError::NotFound { .. }) => return Err(CoreError::not_found("job", id)),
                Err(err) if err.is_transient() && self.backoff.allows(attempt) => {
                    warn!(job = %id, attempt, error = %err, "job update failed, retrying");
                    tokio::time::sleep(self.backoff.delay_for(attempt)).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Store a job's statistics
    ///
    /// # Errors
    ///
    /// Returns error if the coordinator cannot be written
    pub async fn put_stats(&self, id: &JobId, stats: &JobStats) -> CoreResult<()> {
        let key = stats_key(id);
        retry_transient(&self.backoff, "put_stats", || self.meta.put_json(&key, stats)).await?;
        Ok(())
    }

    /// Read a job's statistics, if any were recorded
    ///
    /// # Errors
    ///
    /// Returns error if the coordinator cannot be read
    pub async fn stats(&self, id: &JobId) -> CoreResult<Option<JobStats>> {
        let key = stats_key(id);
        Ok(
            retry_transient(&self.backoff, "get_stats", || self.meta.get_json::<JobStats>(&key))
                .await?
                .map(|v| v.value),
        )
    }

    /// Watch job records
    #[must_use]
    pub fn watch_jobs(&self) -> KvWatch {
        self.meta.watch(JOB_PREFIX)
    }

    /// Watch pipeline records
    #[must_use]
    pub fn watch_pipelines(&self) -> KvWatch {
        self.meta.watch(PIPELINE_PREFIX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::InputCommit;
    use crate::pipeline::{InputSpec, Transform};
    use sluice_coord::MemoryKv;
    use sluice_core::CommitId;
    use sluice_worker::Glob;
    use std::sync::Arc;

    fn catalog() -> (Arc<MemoryKv>, Catalog) {
        let kv = Arc::new(MemoryKv::new());
        let catalog = Catalog::new(MetadataStore::new(kv.clone())).with_backoff(Backoff::immediate(3));
        (kv, catalog)
    }

    fn job(pipeline: &str) -> JobRecord {
        JobRecord::new(
            pipeline,
            pipeline,
            vec![InputCommit::commit("in", "r", CommitId::new())],
            true,
        )
    }

    #[tokio::test]
    async fn test_pipeline_records() {
        let (_, catalog) = catalog();
        let spec = PipelineSpec::new("p", Transform::new("img", vec!["cat".into()]))
            .with_input(InputSpec::repo("in", "r", "master", Glob::Root));
        let record = PipelineRecord {
            spec,
            created: Timestamp::now(),
        };
        catalog.create_pipeline(&record).await.unwrap();
        assert!(catalog.create_pipeline(&record).await.unwrap_err().is_already_exists());
        assert_eq!(catalog.pipeline("p").await.unwrap(), record);
        assert!(catalog.pipeline("q").await.unwrap_err().is_not_found());
        assert_eq!(catalog.pipelines().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_create_job_once() {
        let (_, catalog) = catalog();
        let record = job("p");
        let (first, created) = catalog.create_job_once(&record).await.unwrap();
        assert!(created);

        let mut again = record.clone();
        again.released = false;
        let (second, created) = catalog.create_job_once(&again).await.unwrap();
        assert!(!created);
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_rerun_after_terminal_job() {
        let (_, catalog) = catalog();
        let record = job("p");
        let (first, _) = catalog.create_job_or_rerun(&record).await.unwrap();

        let (same, created) = catalog.create_job_or_rerun(&record).await.unwrap();
        assert!(!created);
        assert_eq!(same.id, first.id);

        catalog
            .update_job(&first.id, |mut j| {
                j.advance(JobState::Killed)?;
                Ok(j)
            })
            .await
            .unwrap();

        let (killed, created) = catalog.create_job_once(&record).await.unwrap();
        assert!(!created);
        assert_eq!(killed.state, JobState::Killed);

        let (second, created) = catalog.create_job_or_rerun(&record).await.unwrap();
        assert!(created);
        assert_ne!(second.id, first.id);
        assert_eq!(second.generation, 1);
        assert_eq!(second.state, JobState::Starting);

        let (newest, created) = catalog.create_job_once(&record).await.unwrap();
        assert!(!created);
        assert_eq!(newest.id, second.id);
        assert_eq!(catalog.jobs(Some("p")).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_update_job_checks_transitions() {
        let (_, catalog) = catalog();
        let record = job("p");
        catalog.create_job_once(&record).await.unwrap();

        let updated = catalog
            .update_job(&record.id, |mut j| {
                j.advance(JobState::Running)?;
                Ok(j)
            })
            .await
            .unwrap();
        assert_eq!(updated.state, JobState::Running);

        let err = catalog
            .update_job(&record.id, |mut j| {
                j.advance(JobState::Starting)?;
                Ok(j)
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Validation { .. }));
        assert!(catalog.update_job(&JobId::new(), Ok).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_jobs_filter_and_order() {
        let (_, catalog) = catalog();
        let a = job("p");
        let b = job("q");
        let c = job("p");
        for j in [&a, &b, &c] {
            catalog.create_job_once(j).await.unwrap();
        }
        let p_jobs = catalog.jobs(Some("p")).await.unwrap();
        assert_eq!(p_jobs.len(), 2);
        assert!(p_jobs[0].created <= p_jobs[1].created);
        assert_eq!(catalog.jobs(None).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried_then_surface() {
        let (kv, catalog) = catalog();
        kv.set_online(false);
        let err = catalog.pipelines().await.unwrap_err();
        assert!(err.is_transient());
        kv.set_online(true);
        assert!(catalog.pipelines().await.unwrap().is_empty());
    }
}
