//! Pipeline specifications.
//!
//! A pipeline binds a transform to one or more inputs and an output
//! branch. Specs are validated in full before anything is created for
//! them.

use regex::Regex;
use serde::{Deserialize, Serialize};
use sluice_core::{CoreError, CoreResult, Hash, Hasher};
use sluice_worker::{FailurePolicy, FailureThreshold, Glob, JoinMode};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

/// Pattern for pipeline and input names
const NAME_PATTERN: &str = "^[A-Za-z0-9_-]+$";

/// The user code a pipeline runs
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transform {
    /// Container image
    pub image: String,
    /// Command and arguments
    pub cmd: Vec<String>,
    /// Lines fed to the command's standard input
    #[serde(default)]
    pub stdin: Vec<String>,
    /// Extra environment
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl Transform {
    /// Create a transform
    #[must_use]
    pub fn new(image: impl Into<String>, cmd: Vec<String>) -> Self {
        Self {
            image: image.into(),
            cmd,
            ..Self::default()
        }
    }

    /// Set standard input lines
    #[must_use]
    pub fn with_stdin(mut self, lines: Vec<String>) -> Self {
        self.stdin = lines;
        self
    }

    /// Add an environment variable
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

/// Where an input's files come from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InputSource {
    /// Finished commits of a branch
    Repo {
        /// Repository
        repo: String,
        /// Branch
        branch: String,
        /// Split rule
        #[serde(default)]
        glob: Glob,
    },
    /// A fixed directory on the host
    HostDir {
        /// Directory path
        path: PathBuf,
        /// Split rule
        #[serde(default)]
        glob: Glob,
    },
}

impl InputSource {
    /// Split rule of the input
    #[must_use]
    pub fn glob(&self) -> Glob {
        match self {
            Self::Repo { glob, .. } | Self::HostDir { glob, .. } => *glob,
        }
    }
}

/// One named input of a pipeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputSpec {
    /// Input name, also its directory under the transform's input root
    pub name: String,
    /// Source of the files
    pub source: InputSource,
}

impl InputSpec {
    /// Input reading a branch
    #[must_use]
    pub fn repo(name: impl Into<String>, repo: impl Into<String>, branch: impl Into<String>, glob: Glob) -> Self {
        Self {
            name: name.into(),
            source: InputSource::Repo {
                repo: repo.into(),
                branch: branch.into(),
                glob,
            },
        }
    }

    /// Input reading a host directory
    #[must_use]
    pub fn host_dir(name: impl Into<String>, path: impl Into<PathBuf>, glob: Glob) -> Self {
        Self {
            name: name.into(),
            source: InputSource::HostDir {
                path: path.into(),
                glob,
            },
        }
    }

    /// Repository and branch, for branch inputs
    #[must_use]
    pub fn branch(&self) -> Option<(&str, &str)> {
        match &self.source {
            InputSource::Repo { repo, branch, .. } => Some((repo, branch)),
            InputSource::HostDir { .. } => None,
        }
    }
}

fn default_output_branch() -> String {
    "master".to_string()
}

fn default_parallelism() -> usize {
    1
}

fn default_datum_tries() -> u32 {
    3
}

fn default_datum_timeout_ms() -> u64 {
    300_000
}

/// A pipeline specification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineSpec {
    /// Unique pipeline name; also the name of its output repository
    pub name: String,
    /// User code
    pub transform: Transform,
    /// Inputs, in the order datums list them
    pub inputs: Vec<InputSpec>,
    /// How inputs are combined into datums
    #[serde(default)]
    pub join: JoinMode,
    /// Branch of the output repository the pipeline commits to
    #[serde(default = "default_output_branch")]
    pub output_branch: String,
    /// Record per-datum statistics
    #[serde(default)]
    pub enable_stats: bool,
    /// Workers in the pipeline's pool
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,
    /// Executions per datum before it fails permanently
    #[serde(default = "default_datum_tries")]
    pub datum_tries: u32,
    /// Per-execution timeout in milliseconds
    #[serde(default = "default_datum_timeout_ms")]
    pub datum_timeout_ms: u64,
    /// What permanent datum failures do to a job
    #[serde(default)]
    pub failure_policy: FailurePolicy,
    /// Free-form description
    #[serde(default)]
    pub description: String,
}

impl PipelineSpec {
    /// Create a spec with defaults and no inputs
    #[must_use]
    pub fn new(name: impl Into<String>, transform: Transform) -> Self {
        Self {
            name: name.into(),
            transform,
            inputs: Vec::new(),
            join: JoinMode::default(),
            output_branch: default_output_branch(),
            enable_stats: false,
            parallelism: default_parallelism(),
            datum_tries: default_datum_tries(),
            datum_timeout_ms: default_datum_timeout_ms(),
            failure_policy: FailurePolicy::default(),
            description: String::new(),
        }
    }

    /// Add an input
    #[must_use]
    pub fn with_input(mut self, input: InputSpec) -> Self {
        self.inputs.push(input);
        self
    }

    /// Set the join mode
    #[must_use]
    pub fn with_join(mut self, join: JoinMode) -> Self {
        self.join = join;
        self
    }

    /// Set the output branch
    #[must_use]
    pub fn with_output_branch(mut self, branch: impl Into<String>) -> Self {
        self.output_branch = branch.into();
        self
    }

    /// Enable statistics
    #[must_use]
    pub fn with_stats(mut self, enable: bool) -> Self {
        self.enable_stats = enable;
        self
    }

    /// Set the pool size
    #[must_use]
    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism;
        self
    }

    /// Set executions per datum
    #[must_use]
    pub fn with_datum_tries(mut self, tries: u32) -> Self {
        self.datum_tries = tries;
        self
    }

    /// Set the per-datum timeout
    #[must_use]
    pub fn with_datum_timeout(mut self, timeout_ms: u64) -> Self {
        self.datum_timeout_ms = timeout_ms;
        self
    }

    /// Set the failure policy
    #[must_use]
    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    /// Name of the output repository
    #[must_use]
    pub fn output_repo(&self) -> &str {
        &self.name
    }

    /// Inputs reading branches
    pub fn repo_inputs(&self) -> impl Iterator<Item = (&InputSpec, &str, &str)> {
        self.inputs
            .iter()
            .filter_map(|input| input.branch().map(|(repo, branch)| (input, repo, branch)))
    }

    /// Datum identity salt: the pipeline name and everything about the
    /// transform that can change its output
    #[must_use]
    pub fn salt(&self) -> Hash {
        let mut hasher = Hasher::new();
        hasher
            .str_field(&self.name)
            .str_field(&self.transform.image);
        for arg in &self.transform.cmd {
            hasher.str_field(arg);
        }
        hasher.field(&[0]);
        for line in &self.transform.stdin {
            hasher.str_field(line);
        }
        hasher.field(&[0]);
        for (key, value) in &self.transform.env {
            hasher.str_field(key).str_field(value);
        }
        hasher.finish()
    }

    /// Check the spec before anything is created for it
    ///
    /// # Errors
    ///
    /// Returns `Validation` naming the first offending field
    pub fn validate(&self) -> CoreResult<()> {
        let names = Regex::new(NAME_PATTERN).map_err(|e| CoreError::internal(e.to_string()))?;
        if !names.is_match(&self.name) {
            return Err(CoreError::validation(
                "name",
                format!("{:?} must match {}", self.name, NAME_PATTERN),
            ));
        }
        if self.transform.cmd.is_empty() || self.transform.cmd[0].trim().is_empty() {
            return Err(CoreError::validation("transform.cmd", "command is empty"));
        }
        if self.inputs.is_empty() {
            return Err(CoreError::validation("inputs", "at least one input is required"));
        }

        let mut seen = BTreeSet::new();
        for input in &self.inputs {
            if !names.is_match(&input.name) {
                return Err(CoreError::validation(
                    "inputs.name",
                    format!("{:?} must match {}", input.name, NAME_PATTERN),
                ));
            }
            if !seen.insert(input.name.as_str()) {
                return Err(CoreError::validation(
                    "inputs.name",
                    format!("duplicate input {:?}", input.name),
                ));
            }
            match &input.source {
                InputSource::Repo { repo, branch, .. } => {
                    if repo.trim().is_empty() || branch.trim().is_empty() {
                        return Err(CoreError::validation(
                            "inputs.source",
                            format!("input {:?} needs a repo and a branch", input.name),
                        ));
                    }
                    if repo == self.output_repo() {
                        return Err(CoreError::validation(
                            "inputs.source",
                            format!("input {:?} reads the pipeline's own output", input.name),
                        ));
                    }
                }
                InputSource::HostDir { path, .. } => {
                    if path.as_os_str().is_empty() {
                        return Err(CoreError::validation(
                            "inputs.source",
                            format!("input {:?} has an empty path", input.name),
                        ));
                    }
                }
            }
        }

        if self.output_branch.trim().is_empty() {
            return Err(CoreError::validation("output_branch", "output branch is empty"));
        }
        if self.parallelism == 0 {
            return Err(CoreError::validation("parallelism", "must be at least 1"));
        }
        if self.datum_tries == 0 {
            return Err(CoreError::validation("datum_tries", "must be at least 1"));
        }
        if self.datum_timeout_ms == 0 {
            return Err(CoreError::validation("datum_timeout_ms", "must be positive"));
        }
        if let FailurePolicy::BestEffort {
            threshold: FailureThreshold::Percent(p),
        } = self.failure_policy
        {
            if p > 100 {
                return Err(CoreError::validation(
                    "failure_policy",
                    format!("percentage {} is above 100", p),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> PipelineSpec {
        PipelineSpec::new("cat", Transform::new("busybox", vec!["cat".to_string()]))
            .with_input(InputSpec::repo("data", "data", "master", Glob::Files))
    }

    fn field(err: CoreError) -> String {
        match err {
            CoreError::Validation { field, .. } => field,
            other => panic!("expected validation error, got {:?}", other),
        }
    }

    #[test]
    fn test_valid_spec() {
        spec().validate().unwrap();
        spec()
            .with_input(InputSpec::host_dir("host", "/tmp/in", Glob::Root))
            .with_failure_policy(FailurePolicy::BestEffort {
                threshold: FailureThreshold::Percent(100),
            })
            .validate()
            .unwrap();
    }

    #[test]
    fn test_invalid_specs() {
        let mut s = spec();
        s.name = "bad name".to_string();
        assert_eq!(field(s.validate().unwrap_err()), "name");

        let mut s = spec();
        s.transform.cmd.clear();
        assert_eq!(field(s.validate().unwrap_err()), "transform.cmd");

        let mut s = spec();
        s.inputs.clear();
        assert_eq!(field(s.validate().unwrap_err()), "inputs");

        let s = spec().with_input(InputSpec::repo("data", "other", "master", Glob::Root));
        assert_eq!(field(s.validate().unwrap_err()), "inputs.name");

        let s = spec().with_input(InputSpec::repo("own", "cat", "master", Glob::Root));
        assert_eq!(field(s.validate().unwrap_err()), "inputs.source");

        let s = spec().with_input(InputSpec::repo("nobranch", "x", "", Glob::Root));
        assert_eq!(field(s.validate().unwrap_err()), "inputs.source");

        assert_eq!(field(spec().with_parallelism(0).validate().unwrap_err()), "parallelism");
        assert_eq!(field(spec().with_datum_tries(0).validate().unwrap_err()), "datum_tries");
        assert_eq!(
            field(spec().with_output_branch(" ").validate().unwrap_err()),
            "output_branch"
        );
        let s = spec().with_failure_policy(FailurePolicy::BestEffort {
            threshold: FailureThreshold::Percent(101),
        });
        assert_eq!(field(s.validate().unwrap_err()), "failure_policy");
    }

    #[test]
    fn test_json_defaults_and_roundtrip() {
        let json = r#"{
            "name": "wc",
            "transform": {"image": "busybox", "cmd": ["wc", "-l"]},
            "inputs": [{"name": "logs", "source": {"type": "repo", "repo": "logs", "branch": "master", "glob": "/*"}}]
        }"#;
        let parsed: PipelineSpec = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.output_branch, "master");
        assert_eq!(parsed.parallelism, 1);
        assert_eq!(parsed.datum_tries, 3);
        assert_eq!(parsed.failure_policy, FailurePolicy::FailFast);
        assert_eq!(parsed.inputs[0].source.glob(), Glob::TopLevel);

        let back: PipelineSpec = serde_json::from_str(&serde_json::to_string(&parsed).unwrap()).unwrap();
        assert_eq!(back, parsed);
    }

    #[test]
    fn test_salt_tracks_transform() {
        let a = spec();
        let b = PipelineSpec {
            transform: a.transform.clone().with_env("MODE", "fast"),
            ..a.clone()
        };
        assert_eq!(a.salt(), spec().salt());
        assert_ne!(a.salt(), b.salt());
    }
}
