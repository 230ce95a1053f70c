//! Key-value backend contract.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sluice_core::{CoreError, CoreResult};
use thiserror::Error;

/// A stored value with its version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvEntry {
    /// Key
    pub key: String,
    /// Raw value
    pub value: Vec<u8>,
    /// Store-wide revision of the last write to this key. Strictly
    /// increases across writes, including delete and re-create.
    pub version: u64,
}

/// A change observed through a watch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KvEvent {
    /// Key written
    Put(KvEntry),
    /// Key removed
    Delete {
        /// Key
        key: String,
    },
}

impl KvEvent {
    /// Key the event concerns
    #[must_use]
    pub fn key(&self) -> &str {
        match self {
            Self::Put(entry) => &entry.key,
            Self::Delete { key } => key,
        }
    }
}

/// Coordinator errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoordError {
    /// Backend failed or is unreachable
    #[error("Backend error: {0}")]
    Backend(String),

    /// A stored entry could not be decoded
    #[error("Corrupt entry at {key}")]
    CorruptEntry {
        /// Key of the entry
        key: String,
    },

    /// Backend was switched off (fault injection)
    #[error("Backend offline")]
    Offline,
}

impl From<CoordError> for CoreError {
    fn from(err: CoordError) -> Self {
        match err {
            CoordError::CorruptEntry { .. } => CoreError::InvalidEncoding,
            CoordError::Backend(_) | CoordError::Offline => {
                CoreError::unavailable("metadata", err.to_string())
            }
        }
    }
}

/// Versioned key-value backend
#[async_trait]
pub trait KvBackend: Send + Sync + std::fmt::Debug {
    /// Read one key
    async fn get(&self, key: &str) -> CoreResult<Option<KvEntry>>;

    /// Write unconditionally
    async fn put(&self, key: &str, value: Vec<u8>) -> CoreResult<KvEntry>;

    /// Insert only if absent; `AlreadyExists` otherwise
    async fn create(&self, key: &str, value: Vec<u8>) -> CoreResult<KvEntry>;

    /// Write only if the current version is `expected_version`;
    /// `Conflict` if it changed, `NotFound` if the key is gone
    async fn compare_and_swap(
        &self,
        key: &str,
        expected_version: u64,
        value: Vec<u8>,
    ) -> CoreResult<KvEntry>;

    /// Remove a key, optionally only at `expected_version`. Returns
    /// whether the key existed.
    async fn delete(&self, key: &str, expected_version: Option<u64>) -> CoreResult<bool>;

    /// All entries whose key starts with `prefix`, in key order
    async fn list(&self, prefix: &str) -> CoreResult<Vec<KvEntry>>;
}
