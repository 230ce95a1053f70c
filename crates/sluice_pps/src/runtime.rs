//! Mapping pipeline transforms to datum runners.
//!
//! Images registered here run in-process; anything else runs the
//! transform's command as a local process.

use crate::pipeline::Transform;
use sluice_worker::{DatumRunner, ProcessRunner};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::debug;

/// Registry of in-process runners keyed by image name
#[derive(Clone, Default)]
pub struct RunnerRegistry {
    runners: Arc<RwLock<HashMap<String, Arc<dyn DatumRunner>>>>,
}

impl RunnerRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Run transforms with `image` through `runner`
    pub fn register(&self, image: impl Into<String>, runner: Arc<dyn DatumRunner>) {
        let image = image.into();
        debug!(image = %image, ?runner, "registered runner");
        self.runners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(image, runner);
    }

    /// Runner for a transform
    #[must_use]
    pub fn runner_for(&self, transform: &Transform) -> Arc<dyn DatumRunner> {
        let registered = self
            .runners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&transform.image)
            .cloned();
        registered.unwrap_or_else(|| {
            Arc::new(
                ProcessRunner::new(transform.cmd.clone())
                    .with_stdin(transform.stdin.clone())
                    .with_env(transform.env.clone()),
            )
        })
    }
}

impl fmt::Debug for RunnerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let runners = self.runners.read().unwrap_or_else(PoisonError::into_inner);
        let mut images: Vec<&String> = runners.keys().collect();
        images.sort();
        f.debug_struct("RunnerRegistry").field("images", &images).finish()
    }
}
