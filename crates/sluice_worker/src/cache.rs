//! Outputs of previously processed datums.
//!
//! Datum identity covers the transform and every input file's content, so
//! a datum seen before under the same pipeline produces the same output
//! and can be staged again without running.

use crate::datum::DatumId;
use sluice_storage::FileTree;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

/// Shared map from datum identity to output tree
#[derive(Debug, Clone, Default)]
pub struct DatumCache {
    entries: Arc<RwLock<HashMap<DatumId, FileTree>>>,
}

impl DatumCache {
    /// Create an empty cache
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Output of a previous successful run
    #[must_use]
    pub fn get(&self, datum: &DatumId) -> Option<FileTree> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(datum)
            .cloned()
    }

    /// Remember the output of a successful run
    pub fn insert(&self, datum: DatumId, output: FileTree) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(datum, output);
    }

    /// Number of cached datums
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether the cache is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forget everything
    pub fn clear(&self) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}
