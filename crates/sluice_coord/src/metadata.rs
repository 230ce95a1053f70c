//! Typed, watchable view over a KV backend.

use crate::kv::{KvBackend, KvEntry, KvEvent};
use serde::Serialize;
use serde::de::DeserializeOwned;
use sluice_core::{CoreError, CoreResult};
use std::sync::Arc;
use tokio::sync::{Mutex, broadcast};
use tracing::{debug, warn};

/// Capacity of the watch broadcast buffer
const WATCH_BUFFER: usize = 1024;

/// Attempts of the read-modify-CAS loop in [`MetadataStore::update_json`]
const UPDATE_ATTEMPTS: usize = 16;

/// A decoded value with the version it was read at
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned<T> {
    /// Decoded value
    pub value: T,
    /// Version of the entry
    pub version: u64,
}

fn decode<T: DeserializeOwned>(entry: &KvEntry) -> CoreResult<Versioned<T>> {
    let value = serde_json::from_slice(&entry.value).map_err(|e| {
        warn!(key = %entry.key, error = %e, "undecodable metadata entry");
        CoreError::InvalidEncoding
    })?;
    Ok(Versioned {
        value,
        version: entry.version,
    })
}

/// Metadata store: JSON records, CAS updates and prefix watches.
///
/// Every mutation goes through one writer lock so watchers see events in
/// the order the backend applied them.
#[derive(Debug, Clone)]
pub struct MetadataStore {
    backend: Arc<dyn KvBackend>,
    events: broadcast::Sender<KvEvent>,
    write_lock: Arc<Mutex<()>>,
}

impl MetadataStore {
    /// Wrap a backend
    #[must_use]
    pub fn new(backend: Arc<dyn KvBackend>) -> Self {
        let (events, _) = broadcast::channel(WATCH_BUFFER);
        Self {
            backend,
            events,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    /// The wrapped backend
    #[must_use]
    pub fn backend(&self) -> &Arc<dyn KvBackend> {
        &self.backend
    }

    fn publish(&self, event: KvEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    /// Read a raw entry
    ///
    /// # Errors
    ///
    /// Returns error if the backend fails
    pub async fn get(&self, key: &str) -> CoreResult<Option<KvEntry>> {
        self.backend.get(key).await
    }

    /// Read and decode a JSON record
    ///
    /// # Errors
    ///
    /// Returns error if the backend fails or the record does not decode
    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> CoreResult<Option<Versioned<T>>> {
        match self.backend.get(key).await? {
            Some(entry) => Ok(Some(decode(&entry)?)),
            None => Ok(None),
        }
    }

    /// Write a JSON record unconditionally
    ///
    /// # Errors
    ///
    /// Returns error if the backend fails
    pub async fn put_json<T: Serialize + Sync>(&self, key: &str, value: &T) -> CoreResult<u64> {
        let bytes = serde_json::to_vec(value)?;
        let _guard = self.write_lock.lock().await;
        let entry = self.backend.put(key, bytes).await?;
        let version = entry.version;
        self.publish(KvEvent::Put(entry));
        Ok(version)
    }

    /// Insert a JSON record if the key is free
    ///
    /// # Errors
    ///
    /// Returns `AlreadyExists` if the key is taken
    pub async fn create_json<T: Serialize + Sync>(&self, key: &str, value: &T) -> CoreResult<u64> {
        let bytes = serde_json::to_vec(value)?;
        let _guard = self.write_lock.lock().await;
        let entry = self.backend.create(key, bytes).await?;
        let version = entry.version;
        debug!(key = %key, version, "created record");
        self.publish(KvEvent::Put(entry));
        Ok(version)
    }

    /// Replace a JSON record if it is still at `version`
    ///
    /// # Errors
    ///
    /// Returns `Conflict` if the record changed since it was read
    pub async fn cas_json<T: Serialize + Sync>(
        &self,
        key: &str,
        version: u64,
        value: &T,
    ) -> CoreResult<u64> {
        let bytes = serde_json::to_vec(value)?;
        let _guard = self.write_lock.lock().await;
        let entry = self.backend.compare_and_swap(key, version, bytes).await?;
        let version = entry.version;
        self.publish(KvEvent::Put(entry));
        Ok(version)
    }

    /// Read-modify-write a JSON record with compare-and-swap, re-reading
    /// on conflict. `update` may abort by returning an error, which is
    /// passed through untouched.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the record is absent, `Conflict` if every
    /// attempt lost a race, or the error produced by `update`
    pub async fn update_json<T, F>(&self, key: &str, mut update: F) -> CoreResult<Versioned<T>>
    where
        T: Serialize + DeserializeOwned + Sync,
        F: FnMut(T) -> CoreResult<T>,
    {
        for attempt in 1..=UPDATE_ATTEMPTS {
            let current: Versioned<T> = self
                .get_json(key)
                .await?
                .ok_or_else(|| CoreError::not_found("key", key))?;
            let next = update(current.value)?;
            match self.cas_json(key, current.version, &next).await {
                Ok(version) => return Ok(Versioned { value: next, version }),
                Err(CoreError::Conflict { .. }) => {
                    debug!(key = %key, attempt, "update lost a race, retrying");
                }
                Err(err) => return Err(err),
            }
        }
        Err(CoreError::Conflict {
            key: key.to_string(),
        })
    }

    /// Delete a key, optionally only at `version`
    ///
    /// # Errors
    ///
    /// Returns `Conflict` if the version does not match
    pub async fn delete(&self, key: &str, version: Option<u64>) -> CoreResult<bool> {
        let _guard = self.write_lock.lock().await;
        let existed = self.backend.delete(key, version).await?;
        if existed {
            self.publish(KvEvent::Delete {
                key: key.to_string(),
            });
        }
        Ok(existed)
    }

    /// Decode every record under `prefix`, in key order
    ///
    /// # Errors
    ///
    /// Returns error if the backend fails or a record does not decode
    pub async fn list_json<T: DeserializeOwned>(&self, prefix: &str) -> CoreResult<Vec<(String, Versioned<T>)>> {
        self.backend
            .list(prefix)
            .await?
            .iter()
            .map(|entry| Ok((entry.key.clone(), decode(entry)?)))
            .collect()
    }

    /// Watch changes to keys under `prefix` made from now on
    #[must_use]
    pub fn watch(&self, prefix: &str) -> KvWatch {
        KvWatch {
            prefix: prefix.to_string(),
            rx: self.events.subscribe(),
        }
    }
}

/// Stream of changes under a key prefix
#[derive(Debug)]
pub struct KvWatch {
    prefix: String,
    rx: broadcast::Receiver<KvEvent>,
}

impl KvWatch {
    /// Wait for the next matching event. Events dropped because the
    /// watcher fell behind are skipped with a warning; callers that must
    /// not miss a state change re-read the key.
    ///
    /// # Errors
    ///
    /// Returns `Cancelled` once the store is gone
    pub async fn next(&mut self) -> CoreResult<KvEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) if event.key().starts_with(&self.prefix) => return Ok(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(prefix = %self.prefix, skipped, "watch lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return Err(CoreError::Cancelled),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryKv;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Counter {
        n: u32,
    }

    fn store() -> MetadataStore {
        MetadataStore::new(Arc::new(MemoryKv::new()))
    }

    #[tokio::test]
    async fn test_json_roundtrip() {
        let store = store();
        let version = store.create_json("c/1", &Counter { n: 1 }).await.unwrap();
        let got: Versioned<Counter> = store.get_json("c/1").await.unwrap().unwrap();
        assert_eq!(got.value, Counter { n: 1 });
        assert_eq!(got.version, version);
        assert!(store
            .create_json("c/1", &Counter { n: 2 })
            .await
            .unwrap_err()
            .is_already_exists());
    }

    #[tokio::test]
    async fn test_update_json_concurrent() {
        let store = store();
        store.create_json("c/1", &Counter { n: 0 }).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .update_json("c/1", |mut c: Counter| {
                        c.n += 1;
                        Ok(c)
                    })
                    .await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }

        let got: Versioned<Counter> = store.get_json("c/1").await.unwrap().unwrap();
        assert_eq!(got.value.n, 8);
    }

    #[tokio::test]
    async fn test_update_json_abort() {
        let store = store();
        store.create_json("c/1", &Counter { n: 0 }).await.unwrap();
        let err = store
            .update_json("c/1", |_: Counter| Err(CoreError::Cancelled))
            .await
            .unwrap_err();
        assert_eq!(err, CoreError::Cancelled);

        let err = store
            .update_json("c/missing", |c: Counter| Ok(c))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_watch_prefix_in_order() {
        let store = store();
        let mut watch = store.watch("jobs/");

        store.put_json("pipelines/p", &Counter { n: 0 }).await.unwrap();
        store.put_json("jobs/a", &Counter { n: 1 }).await.unwrap();
        store.put_json("jobs/a", &Counter { n: 2 }).await.unwrap();
        store.delete("jobs/a", None).await.unwrap();

        let first = watch.next().await.unwrap();
        let second = watch.next().await.unwrap();
        let third = watch.next().await.unwrap();
        assert!(matches!(first, KvEvent::Put(ref e) if e.key == "jobs/a"));
        match (&first, &second) {
            (KvEvent::Put(a), KvEvent::Put(b)) => assert!(b.version > a.version),
            other => panic!("unexpected events {:?}", other),
        }
        assert_eq!(
            third,
            KvEvent::Delete {
                key: "jobs/a".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_list_json() {
        let store = store();
        store.put_json("jobs/a", &Counter { n: 1 }).await.unwrap();
        store.put_json("jobs/b", &Counter { n: 2 }).await.unwrap();
        let all: Vec<(String, Versioned<Counter>)> = store.list_json("jobs/").await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[1].1.value.n, 2);
    }
}
