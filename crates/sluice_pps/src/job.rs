//! Job records and the job state machine.
//!
//! Transitions are persisted before they are acted on. Every transition
//! the controller attempts is checked here first, so recovery code and
//! the live controller agree on what a record may become.

use serde::{Deserialize, Serialize};
use sluice_core::{CommitId, CoreError, CoreResult, JobId, ReplicaId, Timestamp};
use sluice_worker::DatumCounts;
use std::fmt;
use std::path::PathBuf;

/// Lifecycle state of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    /// Record persisted, output commit not yet opened
    Starting,
    /// Output commit open, datums being dispatched
    Running,
    /// Every datum settled within the failure policy
    Success,
    /// Failure policy violated or inputs unusable
    Failure,
    /// Cancelled from outside
    Killed,
}

impl JobState {
    /// Whether no further transition is possible
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failure | Self::Killed)
    }

    /// Whether `next` may follow this state. Re-entering the current
    /// non-terminal state is allowed so a new leader can re-persist it.
    #[must_use]
    pub fn can_transition_to(&self, next: JobState) -> bool {
        use JobState::*;
        match (self, next) {
            (Starting, Starting | Running | Failure | Killed) => true,
            (Running, Running | Success | Failure | Killed) => true,
            _ => false,
        }
    }

    /// Check a transition
    ///
    /// # Errors
    ///
    /// Returns `Validation` for a transition the state machine forbids
    pub fn transition(&self, next: JobState) -> CoreResult<JobState> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(CoreError::validation(
                "state",
                format!("job cannot move from {} to {}", self, next),
            ))
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Starting => "STARTING",
            Self::Running => "RUNNING",
            Self::Success => "SUCCESS",
            Self::Failure => "FAILURE",
            Self::Killed => "KILLED",
        };
        write!(f, "{}", s)
    }
}

/// Client-facing job status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// Created or starting
    Creating,
    /// Running, or succeeded with its output commit not yet closed
    Running,
    /// Succeeded; output commit finished
    Success,
    /// Failed
    Error,
    /// Killed
    Killed,
}

impl JobStatus {
    /// Status of a job in `state`, given whether its output commit is
    /// finished. A job is never reported successful before its output
    /// is visible.
    #[must_use]
    pub fn from_state(state: JobState, output_finished: bool) -> Self {
        match state {
            JobState::Starting => Self::Creating,
            JobState::Running => Self::Running,
            JobState::Success if output_finished => Self::Success,
            JobState::Success => Self::Running,
            JobState::Failure => Self::Error,
            JobState::Killed => Self::Killed,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Creating => "CREATING",
            Self::Running => "RUNNING",
            Self::Success => "SUCCESS",
            Self::Error => "ERROR",
            Self::Killed => "KILLED",
        };
        write!(f, "{}", s)
    }
}

/// Where one input's data was read from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InputOrigin {
    /// A finished commit
    Commit {
        /// Repository
        repo: String,
        /// Commit
        commit: CommitId,
    },
    /// A host directory, pinned by the digest of its imported tree
    HostDir {
        /// Directory path
        path: PathBuf,
        /// Digest of the imported files
        digest: String,
    },
}

/// One entry of a job's input commit set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputCommit {
    /// Input name
    pub input: String,
    /// Data source
    pub source: InputOrigin,
}

impl InputCommit {
    /// Input bound to a commit
    #[must_use]
    pub fn commit(input: impl Into<String>, repo: impl Into<String>, commit: CommitId) -> Self {
        Self {
            input: input.into(),
            source: InputOrigin::Commit {
                repo: repo.into(),
                commit,
            },
        }
    }

    /// Commit, for commit-backed inputs
    #[must_use]
    pub fn commit_id(&self) -> Option<CommitId> {
        match &self.source {
            InputOrigin::Commit { commit, .. } => Some(*commit),
            InputOrigin::HostDir { .. } => None,
        }
    }
}

/// Canonical key of an input commit set, in input order
#[must_use]
pub fn input_key(inputs: &[InputCommit]) -> String {
    inputs
        .iter()
        .map(|input| match &input.source {
            InputOrigin::Commit { repo, commit } => format!("{}:{}@{}", input.input, repo, commit),
            InputOrigin::HostDir { path, digest } => {
                format!("{}:{}#{}", input.input, path.display(), digest)
            }
        })
        .collect::<Vec<_>>()
        .join(",")
}

/// Persisted job record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRecord {
    /// Job ID, derived from the pipeline, input key and generation
    pub id: JobId,
    /// Run of this input set. Generation 0 is the first job; each
    /// explicit re-run after a terminal job takes the next one.
    #[serde(default)]
    pub generation: u32,
    /// Owning pipeline
    pub pipeline: String,
    /// One entry per pipeline input
    pub inputs: Vec<InputCommit>,
    /// Canonical form of `inputs`
    pub input_key: String,
    /// Output repository
    pub output_repo: String,
    /// Output commit, once opened
    pub output_commit: Option<CommitId>,
    /// Current state
    pub state: JobState,
    /// Whether the controller may run the job. Triggered jobs are
    /// released at creation; `CreateJob` jobs wait for `StartJob`.
    pub released: bool,
    /// Why the job failed or was killed
    pub reason: Option<String>,
    /// Replica that last drove the job
    pub leader: Option<ReplicaId>,
    /// Datum progress
    pub counts: DatumCounts,
    /// When the record was created
    pub created: Timestamp,
    /// When the job started running
    pub started: Option<Timestamp>,
    /// When the job reached a terminal state
    pub finished: Option<Timestamp>,
    /// Last liveness update from the driving controller
    pub heartbeat: Option<Timestamp>,
}

impl JobRecord {
    /// New `STARTING` record for an input commit set
    #[must_use]
    pub fn new(pipeline: &str, output_repo: &str, inputs: Vec<InputCommit>, released: bool) -> Self {
        let input_key = input_key(&inputs);
        Self {
            id: JobId::for_inputs(pipeline, &input_key),
            generation: 0,
            pipeline: pipeline.to_string(),
            inputs,
            input_key,
            output_repo: output_repo.to_string(),
            output_commit: None,
            state: JobState::Starting,
            released,
            reason: None,
            leader: None,
            counts: DatumCounts::default(),
            created: Timestamp::now(),
            started: None,
            finished: None,
            heartbeat: None,
        }
    }

    /// The same record as run `generation` of its input set
    #[must_use]
    pub fn with_generation(mut self, generation: u32) -> Self {
        self.generation = generation;
        self.id = if generation == 0 {
            JobId::for_inputs(&self.pipeline, &self.input_key)
        } else {
            JobId::for_inputs(&self.pipeline, &format!("{}#{}", self.input_key, generation))
        };
        self
    }

    /// Apply a checked transition, stamping timestamps
    ///
    /// # Errors
    ///
    /// Returns `Validation` if the state machine forbids it
    pub fn advance(&mut self, next: JobState) -> CoreResult<()> {
        self.state = self.state.transition(next)?;
        let now = Timestamp::now();
        if next == JobState::Running && self.started.is_none() {
            self.started = Some(now);
        }
        if next.is_terminal() {
            self.finished = Some(now);
        }
        Ok(())
    }

    /// Whether the driving controller has been silent longer than
    /// `deadline_ms`
    #[must_use]
    pub fn is_stale(&self, deadline_ms: u64) -> bool {
        let last = self.heartbeat.or(self.started).unwrap_or(self.created);
        Timestamp::now().elapsed_since(&last).as_millis() > u128::from(deadline_ms)
    }
}
