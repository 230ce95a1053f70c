//! Durable KV backend on redb.
//!
//! Values are stored as an 8-byte big-endian version followed by the raw
//! bytes. The store-wide revision counter lives in a separate table and
//! is bumped in the same write transaction as the entry.

use crate::kv::{CoordError, KvBackend, KvEntry};
use async_trait::async_trait;
use redb::{Database, ReadableTable, TableDefinition};
use sluice_core::{CoreError, CoreResult};
use std::path::Path;
use std::sync::Arc;

const ENTRIES: TableDefinition<&str, &[u8]> = TableDefinition::new("entries");
const META: TableDefinition<&str, u64> = TableDefinition::new("meta");
const REVISION_KEY: &str = "revision";

fn backend_error(err: impl Into<redb::Error>) -> CoreError {
    CoordError::Backend(err.into().to_string()).into()
}

fn encode(version: u64, value: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + value.len());
    out.extend_from_slice(&version.to_be_bytes());
    out.extend_from_slice(value);
    out
}

fn decode(key: &str, raw: &[u8]) -> CoreResult<KvEntry> {
    if raw.len() < 8 {
        return Err(CoordError::CorruptEntry {
            key: key.to_string(),
        }
        .into());
    }
    let (version, value) = raw.split_at(8);
    let mut buf = [0u8; 8];
    buf.copy_from_slice(version);
    Ok(KvEntry {
        key: key.to_string(),
        value: value.to_vec(),
        version: u64::from_be_bytes(buf),
    })
}

/// What a write transaction should do given the current entry
enum WriteOp {
    Put(Vec<u8>),
    Remove,
}

/// redb-backed KV store
#[derive(Clone)]
pub struct RedbKv {
    db: Arc<Database>,
}

impl std::fmt::Debug for RedbKv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedbKv").finish_non_exhaustive()
    }
}

impl RedbKv {
    /// Open or create a database file
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be opened or initialized
    pub fn open(path: impl AsRef<Path>) -> CoreResult<Self> {
        let db = Database::create(path.as_ref()).map_err(backend_error)?;
        let txn = db.begin_write().map_err(backend_error)?;
        {
            txn.open_table(ENTRIES).map_err(backend_error)?;
            txn.open_table(META).map_err(backend_error)?;
        }
        txn.commit().map_err(backend_error)?;
        tracing::info!(path = %path.as_ref().display(), "opened metadata database");
        Ok(Self { db: Arc::new(db) })
    }

    async fn blocking<T, F>(&self, f: F) -> CoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Database) -> CoreResult<T> + Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || f(&db))
            .await
            .map_err(|e| CoreError::internal(format!("redb task failed: {}", e)))?
    }

    /// Run one write transaction. `decide` sees the current entry and
    /// picks the operation; its error aborts the transaction.
    async fn write_txn<F>(&self, key: &str, decide: F) -> CoreResult<Option<KvEntry>>
    where
        F: FnOnce(Option<KvEntry>) -> CoreResult<WriteOp> + Send + 'static,
    {
        let key = key.to_string();
        self.blocking(move |db| {
            let txn = db.begin_write().map_err(backend_error)?;
            let written = {
                let mut entries = txn.open_table(ENTRIES).map_err(backend_error)?;
                let mut meta = txn.open_table(META).map_err(backend_error)?;

                let current = match entries.get(key.as_str()).map_err(backend_error)? {
                    Some(raw) => Some(decode(&key, raw.value())?),
                    None => None,
                };
                let revision = meta
                    .get(REVISION_KEY)
                    .map_err(backend_error)?
                    .map_or(0, |v| v.value())
                    + 1;

                match decide(current)? {
                    WriteOp::Put(value) => {
                        entries
                            .insert(key.as_str(), encode(revision, &value).as_slice())
                            .map_err(backend_error)?;
                        meta.insert(REVISION_KEY, revision).map_err(backend_error)?;
                        Some(KvEntry {
                            key: key.clone(),
                            value,
                            version: revision,
                        })
                    }
                    WriteOp::Remove => {
                        entries.remove(key.as_str()).map_err(backend_error)?;
                        meta.insert(REVISION_KEY, revision).map_err(backend_error)?;
                        None
                    }
                }
            };
            txn.commit().map_err(backend_error)?;
            Ok(written)
        })
        .await
    }
}

fn written(entry: Option<KvEntry>) -> CoreResult<KvEntry> {
    entry.ok_or_else(|| CoreError::internal("write produced no entry"))
}

#[async_trait]
impl KvBackend for RedbKv {
    async fn get(&self, key: &str) -> CoreResult<Option<KvEntry>> {
        let key = key.to_string();
        self.blocking(move |db| {
            let txn = db.begin_read().map_err(backend_error)?;
            let entries = txn.open_table(ENTRIES).map_err(backend_error)?;
            match entries.get(key.as_str()).map_err(backend_error)? {
                Some(raw) => Ok(Some(decode(&key, raw.value())?)),
                None => Ok(None),
            }
        })
        .await
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> CoreResult<KvEntry> {
        written(self.write_txn(key, move |_| Ok(WriteOp::Put(value))).await?)
    }

    async fn create(&self, key: &str, value: Vec<u8>) -> CoreResult<KvEntry> {
        let k = key.to_string();
        written(
            self.write_txn(key, move |current| match current {
                Some(_) => Err(CoreError::already_exists("key", k)),
                None => Ok(WriteOp::Put(value)),
            })
            .await?,
        )
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected_version: u64,
        value: Vec<u8>,
    ) -> CoreResult<KvEntry> {
        let k = key.to_string();
        written(
            self.write_txn(key, move |current| match current {
                None => Err(CoreError::not_found("key", k)),
                Some(entry) if entry.version != expected_version => {
                    Err(CoreError::Conflict { key: k })
                }
                Some(_) => Ok(WriteOp::Put(value)),
            })
            .await?,
        )
    }

    async fn delete(&self, key: &str, expected_version: Option<u64>) -> CoreResult<bool> {
        if self.get(key).await?.is_none() {
            return Ok(false);
        }
        let k = key.to_string();
        let result = self
            .write_txn(key, move |current| match (current, expected_version) {
                (None, _) => Err(CoreError::not_found("key", k)),
                (Some(entry), Some(expected)) if entry.version != expected => {
                    Err(CoreError::Conflict { key: k })
                }
                _ => Ok(WriteOp::Remove),
            })
            .await;
        match result {
            Ok(_) => Ok(true),
            Err(err) if err.is_not_found() => Ok(false),
            Err(err) => Err(err),
        }
    }

    async fn list(&self, prefix: &str) -> CoreResult<Vec<KvEntry>> {
        let prefix = prefix.to_string();
        self.blocking(move |db| {
            let txn = db.begin_read().map_err(backend_error)?;
            let entries = txn.open_table(ENTRIES).map_err(backend_error)?;
            let mut out = Vec::new();
            for item in entries.range(prefix.as_str()..).map_err(backend_error)? {
                let (key, raw) = item.map_err(backend_error)?;
                let key = key.value();
                if !key.starts_with(prefix.as_str()) {
                    break;
                }
                out.push(decode(key, raw.value())?);
            }
            Ok(out)
        })
        .await
    }
}
