//! Content-addressed blob store.
//!
//! Files are stored once per distinct content; commit trees only hold
//! addresses into this store.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use sluice_core::{CoreError, CoreResult, Hash};
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use thiserror::Error;

/// Store configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Maximum file size in bytes (0 = unlimited)
    pub max_file_size: usize,
}

impl StoreConfig {
    /// Set the maximum file size
    #[must_use]
    pub fn with_max_file_size(mut self, max_file_size: usize) -> Self {
        self.max_file_size = max_file_size;
        self
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_file_size: 100 * 1024 * 1024, // 100 MB
        }
    }
}

/// Storage errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// Blob not found
    #[error("Blob not found: {0}")]
    BlobNotFound(Hash),

    /// File exceeds the configured size limit
    #[error("File too large: {size} bytes (limit: {limit})")]
    FileTooLarge {
        /// Actual size
        size: usize,
        /// Configured limit
        limit: usize,
    },

    /// Path cannot be stored in a file tree
    #[error("Invalid path {path:?}: {reason}")]
    InvalidPath {
        /// Offending path
        path: String,
        /// Why it was rejected
        reason: String,
    },

    /// Tar stream could not be read or written
    #[error("Tar stream error: {0}")]
    Tar(String),
}

impl From<StoreError> for CoreError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::BlobNotFound(hash) => CoreError::not_found("blob", hash),
            StoreError::FileTooLarge { .. } => CoreError::validation("file", err.to_string()),
            StoreError::InvalidPath { .. } => CoreError::validation("path", err.to_string()),
            StoreError::Tar(_) => CoreError::validation("tar", err.to_string()),
        }
    }
}

/// Store statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStats {
    /// Total number of blobs
    pub blob_count: usize,
    /// Total bytes stored
    pub total_bytes: u64,
    /// Number of reads
    pub read_count: u64,
    /// Number of writes, including deduplicated ones
    pub write_count: u64,
}

/// In-memory content store
#[derive(Debug)]
pub struct ContentStore {
    config: StoreConfig,
    blobs: RwLock<HashMap<Hash, Bytes>>,
    stats: RwLock<StoreStats>,
}

impl ContentStore {
    /// Create a new content store
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(StoreConfig::default())
    }

    /// Create with custom configuration
    #[must_use]
    pub fn with_config(config: StoreConfig) -> Self {
        Self {
            config,
            blobs: RwLock::new(HashMap::new()),
            stats: RwLock::new(StoreStats::default()),
        }
    }

    /// Get the configuration
    #[must_use]
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Write content and return its address
    ///
    /// # Errors
    ///
    /// Returns error if the content exceeds the size limit
    pub fn write(&self, data: impl Into<Bytes>) -> CoreResult<Hash> {
        let data = data.into();
        let size = data.len();
        if self.config.max_file_size > 0 && size > self.config.max_file_size {
            return Err(StoreError::FileTooLarge {
                size,
                limit: self.config.max_file_size,
            }
            .into());
        }

        let address = Hash::compute(&data);
        let is_new = {
            let mut blobs = self.blobs.write().unwrap_or_else(PoisonError::into_inner);
            match blobs.entry(address) {
                std::collections::hash_map::Entry::Occupied(_) => false,
                std::collections::hash_map::Entry::Vacant(slot) => {
                    slot.insert(data);
                    true
                }
            }
        };

        let mut stats = self.stats.write().unwrap_or_else(PoisonError::into_inner);
        stats.write_count += 1;
        if is_new {
            stats.blob_count += 1;
            stats.total_bytes += size as u64;
        }

        Ok(address)
    }

    /// Read content by address
    ///
    /// # Errors
    ///
    /// Returns error if no blob has this address
    pub fn read(&self, address: &Hash) -> CoreResult<Bytes> {
        let data = self
            .blobs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(address)
            .cloned()
            .ok_or(StoreError::BlobNotFound(*address))?;

        self.stats
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .read_count += 1;
        Ok(data)
    }

    /// Check if a blob exists
    #[must_use]
    pub fn contains(&self, address: &Hash) -> bool {
        self.blobs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(address)
    }

    /// Get store statistics
    #[must_use]
    pub fn stats(&self) -> StoreStats {
        self.stats
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Default for ContentStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_write_read() {
        let store = ContentStore::new();
        let id = store.write(b"hello world".to_vec()).unwrap();

        let data = store.read(&id).unwrap();
        assert_eq!(&data[..], b"hello world");
        assert!(store.contains(&id));
    }

    #[test]
    fn test_store_write_duplicate() {
        let store = ContentStore::new();
        let id1 = store.write(Bytes::from_static(b"duplicate")).unwrap();
        let id2 = store.write(Bytes::from_static(b"duplicate")).unwrap();

        assert_eq!(id1, id2);
        let stats = store.stats();
        assert_eq!(stats.blob_count, 1);
        assert_eq!(stats.total_bytes, 9);
        assert_eq!(stats.write_count, 2);
    }

    #[test]
    fn test_store_file_too_large() {
        let store = ContentStore::with_config(StoreConfig::default().with_max_file_size(10));
        let err = store.write(vec![0u8; 100]).unwrap_err();
        assert!(matches!(err, CoreError::Validation { .. }));
    }

    #[test]
    fn test_store_read_missing() {
        let store = ContentStore::new();
        let err = store.read(&Hash::compute(b"absent")).unwrap_err();
        assert!(err.is_not_found());
    }
}
