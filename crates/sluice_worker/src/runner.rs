//! User transform execution seam.

use crate::datum::DatumId;
use async_trait::async_trait;
use bytes::Bytes;
use sluice_core::JobId;
use std::fmt;

/// One materialized input file of a datum
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputFile {
    /// Input name
    pub input: String,
    /// Path within the input, `/`-prefixed
    pub path: String,
    /// File contents
    pub data: Bytes,
}

/// Everything a transform sees for one datum
#[derive(Debug, Clone)]
pub struct DatumFiles {
    /// Datum being processed
    pub datum: DatumId,
    /// Owning job
    pub job: JobId,
    /// Attempt number, starting at 1
    pub attempt: u32,
    /// Input files in input order, then path order
    pub files: Vec<InputFile>,
}

impl DatumFiles {
    /// Files of one input
    pub fn input<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a InputFile> + 'a {
        self.files.iter().filter(move |f| f.input == name)
    }
}

/// One file produced by a transform
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputFile {
    /// Output path, `/`-prefixed
    pub path: String,
    /// File contents
    pub data: Bytes,
}

impl OutputFile {
    /// Create an output file
    #[must_use]
    pub fn new(path: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            path: path.into(),
            data: data.into(),
        }
    }
}

/// Transform errors
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    /// Process exited unsuccessfully
    #[error("transform exited with {code:?}: {stderr}")]
    Exit {
        /// Exit code, `None` if killed by a signal
        code: Option<i32>,
        /// Captured standard error
        stderr: String,
    },

    /// Execution exceeded the datum timeout
    #[error("transform timed out after {0} ms")]
    Timeout(u64),

    /// Scratch directory or process I/O failed
    #[error("transform i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// In-process transform failure
    #[error("{0}")]
    Transform(String),
}

/// Runs the user transform against one datum
#[async_trait]
pub trait DatumRunner: Send + Sync + fmt::Debug {
    /// Process a datum and return the files it produced
    async fn run(&self, datum: &DatumFiles) -> Result<Vec<OutputFile>, RunError>;
}

/// Runner backed by an in-process closure
pub struct FnRunner<F> {
    name: String,
    f: F,
}

impl<F> FnRunner<F>
where
    F: Fn(&DatumFiles) -> Result<Vec<OutputFile>, RunError> + Send + Sync,
{
    /// Wrap a closure
    #[must_use]
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self { name: name.into(), f }
    }
}

impl<F> fmt::Debug for FnRunner<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnRunner").field("name", &self.name).finish()
    }
}

#[async_trait]
impl<F> DatumRunner for FnRunner<F>
where
    F: Fn(&DatumFiles) -> Result<Vec<OutputFile>, RunError> + Send + Sync,
{
    async fn run(&self, datum: &DatumFiles) -> Result<Vec<OutputFile>, RunError> {
        (self.f)(datum)
    }
}
