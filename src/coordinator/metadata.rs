//! Persistent versioned store using RocksDB
//!
//! Column families:
//! - `records`: path → bincode(`StoredRecord`)
//! - `meta`: store-wide version sequence
//!
//! Conditional writes take a store-wide write lock around the version check
//! and the batch that persists the record together with the advanced
//! sequence. Reads never take the lock.

use crate::common::storage::{child_name, child_prefix, VersionedStore};
use crate::common::{Error, Record, Result, Version, VersionedRecord};
use rocksdb::{ColumnFamily, Direction, IteratorMode, Options, WriteBatch, DB};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::{Arc, Mutex};

const CF_RECORDS: &str = "records";
const CF_META: &str = "meta";
const KEY_VERSION_SEQ: &[u8] = b"version_seq";

#[derive(Serialize, Deserialize)]
struct StoredRecord {
    version: u64,
    record: Record,
}

/// RocksDB-backed [`VersionedStore`]
///
/// All RocksDB calls run in `tokio::task::spawn_blocking`, so they never
/// stall a runtime worker and a caller's timeout can expire while one is in
/// progress.
pub struct RocksStore {
    inner: Arc<RocksInner>,
}

struct RocksInner {
    db: DB,
    write_lock: Mutex<()>,
}

impl RocksStore {
    /// Open or create the store
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let db = DB::open_cf(&opts, path, vec![CF_RECORDS, CF_META])?;
        tracing::debug!("Opened record store");

        Ok(Self {
            inner: Arc::new(RocksInner {
                db,
                write_lock: Mutex::new(()),
            }),
        })
    }

    /// Flush memtables to disk
    pub fn flush(&self) -> Result<()> {
        self.inner.db.flush()?;
        Ok(())
    }

    async fn blocking<T, F>(&self, op: F) -> Result<T>
    where
        F: FnOnce(&RocksInner) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || op(&inner))
            .await
            .map_err(|e| Error::Internal(format!("record store task failed: {}", e)))?
    }
}

impl RocksInner {
    fn cf(&self, name: &str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| Error::Internal(format!("missing column family {}", name)))
    }

    fn get_stored(&self, path: &str) -> Result<Option<StoredRecord>> {
        let cf = self.cf(CF_RECORDS)?;
        match self.db.get_cf(cf, path.as_bytes())? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    fn last_version(&self) -> Result<u64> {
        let cf = self.cf(CF_META)?;
        match self.db.get_cf(cf, KEY_VERSION_SEQ)? {
            Some(bytes) => {
                let raw: [u8; 8] = bytes.as_slice().try_into().map_err(|_| {
                    Error::Serialization("version sequence is not 8 bytes".into())
                })?;
                Ok(u64::from_le_bytes(raw))
            }
            None => Ok(0),
        }
    }

    /// Persist `record` at `path` with the next version. Caller holds the
    /// write lock.
    fn put_next(&self, path: &str, mut record: Record) -> Result<Version> {
        let version = self.last_version()? + 1;
        record.clear_marks();
        let value = bincode::serialize(&StoredRecord { version, record })?;

        let mut batch = WriteBatch::default();
        batch.put_cf(self.cf(CF_RECORDS)?, path.as_bytes(), value);
        batch.put_cf(self.cf(CF_META)?, KEY_VERSION_SEQ, version.to_le_bytes());
        self.db.write(batch)?;

        Ok(Version::new(version))
    }

    fn read(&self, path: &str) -> Result<Option<VersionedRecord>> {
        Ok(self.get_stored(path)?.map(|stored| VersionedRecord {
            record: stored.record,
            version: Version::new(stored.version),
        }))
    }

    fn conditional_write(&self, path: &str, record: Record, expected: Version) -> Result<Version> {
        let _guard = self.write_lock.lock().unwrap();
        let current = self
            .get_stored(path)?
            .ok_or_else(|| Error::NotFound(path.to_string()))?;

        if current.version != expected.get() {
            return Err(Error::VersionConflict {
                path: path.to_string(),
                expected: expected.to_string(),
                actual: Version::new(current.version).to_string(),
            });
        }

        self.put_next(path, record)
    }

    fn create(&self, path: &str, record: Record) -> Result<Version> {
        let _guard = self.write_lock.lock().unwrap();
        if self.get_stored(path)?.is_some() {
            return Err(Error::AlreadyExists(path.to_string()));
        }
        self.put_next(path, record)
    }

    fn delete(&self, path: &str) -> Result<bool> {
        let _guard = self.write_lock.lock().unwrap();
        let cf = self.cf(CF_RECORDS)?;
        if self.db.get_cf(cf, path.as_bytes())?.is_none() {
            return Ok(false);
        }
        self.db.delete_cf(cf, path.as_bytes())?;
        Ok(true)
    }

    fn children(&self, path: &str) -> Result<Vec<String>> {
        let prefix = child_prefix(path);
        let cf = self.cf(CF_RECORDS)?;
        let iter = self.db.iterator_cf(
            cf,
            IteratorMode::From(prefix.as_bytes(), Direction::Forward),
        );

        let mut names = BTreeSet::new();
        for item in iter {
            let (key_bytes, _) = item?;
            let key = std::str::from_utf8(&key_bytes)
                .map_err(|_| Error::Serialization("path is not valid UTF-8".into()))?;
            if !key.starts_with(&prefix) {
                break;
            }
            if let Some(name) = child_name(key, &prefix) {
                names.insert(name.to_string());
            }
        }

        Ok(names.into_iter().collect())
    }
}

impl VersionedStore for RocksStore {
    async fn read(&self, path: &str) -> Result<Option<VersionedRecord>> {
        let path = path.to_string();
        self.blocking(move |db| db.read(&path)).await
    }

    async fn conditional_write(
        &self,
        path: &str,
        record: Record,
        expected: Version,
    ) -> Result<Version> {
        let path = path.to_string();
        self.blocking(move |db| db.conditional_write(&path, record, expected))
            .await
    }

    async fn create(&self, path: &str, record: Record) -> Result<Version> {
        let path = path.to_string();
        self.blocking(move |db| db.create(&path, record)).await
    }

    async fn delete(&self, path: &str) -> Result<bool> {
        let path = path.to_string();
        self.blocking(move |db| db.delete(&path)).await
    }

    async fn children(&self, path: &str) -> Result<Vec<String>> {
        let path = path.to_string();
        self.blocking(move |db| db.children(&path)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_record_store_cas() {
        let dir = tempdir().unwrap();
        let store = RocksStore::open(dir.path().join("records.db")).unwrap();

        let mut record = Record::new("n1");
        record.set_simple_field("HOST", "localhost");
        let v1 = store.create("/c/CONFIGS/n1", record.clone()).await.unwrap();

        let read = store.read("/c/CONFIGS/n1").await.unwrap().unwrap();
        assert_eq!(read.version, v1);
        assert_eq!(read.record, record);

        record.set_simple_field("ENABLED", "false");
        let v2 = store
            .conditional_write("/c/CONFIGS/n1", record.clone(), v1)
            .await
            .unwrap();
        assert!(v2 > v1);

        let err = store
            .conditional_write("/c/CONFIGS/n1", record, v1)
            .await
            .unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_record_store_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("records.db");

        let v1 = {
            let store = RocksStore::open(&path).unwrap();
            let v = store.create("/c", Record::new("c")).await.unwrap();
            store.flush().unwrap();
            v
        };

        let store = RocksStore::open(&path).unwrap();
        let read = store.read("/c").await.unwrap().unwrap();
        assert_eq!(read.version, v1);

        // The sequence survives the restart.
        let v2 = store.create("/d", Record::new("d")).await.unwrap();
        assert!(v2 > v1);
    }

    #[tokio::test]
    async fn test_record_store_children_and_delete() {
        let dir = tempdir().unwrap();
        let store = RocksStore::open(dir.path().join("records.db")).unwrap();

        store.create("/c", Record::new("c")).await.unwrap();
        store.create("/c/CONFIGS/a", Record::new("a")).await.unwrap();
        store.create("/c/CONFIGS/b", Record::new("b")).await.unwrap();
        store.create("/d", Record::new("d")).await.unwrap();

        assert_eq!(store.children("").await.unwrap(), vec!["c", "d"]);
        assert_eq!(store.children("/c/CONFIGS").await.unwrap(), vec!["a", "b"]);

        assert!(store.delete("/c/CONFIGS/a").await.unwrap());
        assert!(!store.delete("/c/CONFIGS/a").await.unwrap());
        assert_eq!(store.children("/c/CONFIGS").await.unwrap(), vec!["b"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_record_store_concurrent_creates() {
        let dir = tempdir().unwrap();
        let store = Arc::new(RocksStore::open(dir.path().join("records.db")).unwrap());

        let handles: Vec<_> = (0..16)
            .map(|i| {
                let store = store.clone();
                tokio::spawn(async move {
                    store
                        .create(&format!("/c/CONFIGS/n{}", i), Record::new(format!("n{}", i)))
                        .await
                })
            })
            .collect();

        let mut versions = BTreeSet::new();
        for handle in handles {
            versions.insert(handle.await.unwrap().unwrap());
        }
        assert_eq!(versions.len(), 16);
        assert_eq!(store.children("/c/CONFIGS").await.unwrap().len(), 16);
    }
}
