//! In-memory KV backend.

use crate::kv::{CoordError, KvBackend, KvEntry};
use async_trait::async_trait;
use sluice_core::{CoreError, CoreResult};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;

#[derive(Debug, Default)]
struct MemoryState {
    entries: BTreeMap<String, KvEntry>,
    revision: u64,
}

impl MemoryState {
    fn write(&mut self, key: &str, value: Vec<u8>) -> KvEntry {
        self.revision += 1;
        let entry = KvEntry {
            key: key.to_string(),
            value,
            version: self.revision,
        };
        self.entries.insert(key.to_string(), entry.clone());
        entry
    }
}

/// In-memory backend for tests and single-process clusters.
///
/// Can be switched offline to exercise `Unavailable` handling.
#[derive(Debug)]
pub struct MemoryKv {
    state: RwLock<MemoryState>,
    online: AtomicBool,
}

impl MemoryKv {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: RwLock::new(MemoryState::default()),
            online: AtomicBool::new(true),
        }
    }

    /// Make every call fail with `Unavailable` until switched back on
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    fn check_online(&self) -> CoreResult<()> {
        if self.online.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(CoordError::Offline.into())
        }
    }
}

impl Default for MemoryKv {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KvBackend for MemoryKv {
    async fn get(&self, key: &str) -> CoreResult<Option<KvEntry>> {
        self.check_online()?;
        Ok(self.state.read().await.entries.get(key).cloned())
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> CoreResult<KvEntry> {
        self.check_online()?;
        Ok(self.state.write().await.write(key, value))
    }

    async fn create(&self, key: &str, value: Vec<u8>) -> CoreResult<KvEntry> {
        self.check_online()?;
        let mut state = self.state.write().await;
        if state.entries.contains_key(key) {
            return Err(CoreError::already_exists("key", key));
        }
        Ok(state.write(key, value))
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected_version: u64,
        value: Vec<u8>,
    ) -> CoreResult<KvEntry> {
        self.check_online()?;
        let mut state = self.state.write().await;
        match state.entries.get(key).map(|e| e.version) {
            None => Err(CoreError::not_found("key", key)),
            Some(current) if current != expected_version => Err(CoreError::Conflict {
                key: key.to_string(),
            }),
            Some(_) => Ok(state.write(key, value)),
        }
    }

    async fn delete(&self, key: &str, expected_version: Option<u64>) -> CoreResult<bool> {
        self.check_online()?;
        let mut state = self.state.write().await;
        match (state.entries.get(key).map(|e| e.version), expected_version) {
            (None, _) => Ok(false),
            (Some(current), Some(expected)) if current != expected => {
                Err(CoreError::Conflict {
                    key: key.to_string(),
                })
            }
            _ => {
                state.revision += 1;
                state.entries.remove(key);
                Ok(true)
            }
        }
    }

    async fn list(&self, prefix: &str) -> CoreResult<Vec<KvEntry>> {
        self.check_online()?;
        let state = self.state.read().await;
        Ok(state
            .entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(_, e)| e.clone())
            .collect())
    }
}
