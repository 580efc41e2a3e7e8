//! Versioned store abstraction
//!
//! Every record lives at a path and carries a store-assigned version. Writes
//! other than `create` are conditional on the version the writer observed.
//! The in-memory backend is used by tests and embedded setups; the RocksDB
//! backend lives in `coordinator::metadata`.

use crate::common::record::{Record, Version, VersionedRecord};
use crate::common::{Error, Result};
use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::Mutex;

/// Key-addressed store of versioned records with compare-and-swap writes.
///
/// Methods return `impl Future + Send` so callers can drive them from
/// spawned tasks without boxing.
pub trait VersionedStore: Send + Sync + 'static {
    /// Read the record at `path` together with its current version.
    fn read(&self, path: &str) -> impl Future<Output = Result<Option<VersionedRecord>>> + Send;

    /// Replace the record at `path` if its version still equals `expected`.
    ///
    /// Fails with [`Error::VersionConflict`] when another writer got there
    /// first, or [`Error::NotFound`] when the path has been removed.
    fn conditional_write(
        &self,
        path: &str,
        record: Record,
        expected: Version,
    ) -> impl Future<Output = Result<Version>> + Send;

    /// Create the record at `path`. Fails with [`Error::AlreadyExists`].
    fn create(&self, path: &str, record: Record) -> impl Future<Output = Result<Version>> + Send;

    /// Remove the record at `path`. Returns whether it existed.
    fn delete(&self, path: &str) -> impl Future<Output = Result<bool>> + Send;

    /// Names of the direct children of `path` (`""` lists top-level names).
    fn children(&self, path: &str) -> impl Future<Output = Result<Vec<String>>> + Send;
}

/// Prefix under which descendants of `path` are stored.
pub(crate) fn child_prefix(path: &str) -> String {
    format!("{}/", path.trim_end_matches('/'))
}

/// Direct child name of `key` under `prefix`, if `key` is a descendant.
pub(crate) fn child_name<'a>(key: &'a str, prefix: &str) -> Option<&'a str> {
    let rest = key.strip_prefix(prefix)?;
    rest.split('/').next().filter(|name| !name.is_empty())
}

struct StoredEntry {
    record: Record,
    version: Version,
}

struct MemInner {
    entries: BTreeMap<String, StoredEntry>,
    last_version: u64,
}

/// In-memory versioned store
///
/// Versions come from a single store-wide counter, so a path that is deleted
/// and recreated never reuses a version.
pub struct MemStore {
    inner: Mutex<MemInner>,
}

impl MemStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MemInner {
                entries: BTreeMap::new(),
                last_version: 0,
            }),
        }
    }

    /// Number of records currently stored
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new()
    }
}

impl VersionedStore for MemStore {
    async fn read(&self, path: &str) -> Result<Option<VersionedRecord>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.entries.get(path).map(|entry| VersionedRecord {
            record: entry.record.clone(),
            version: entry.version,
        }))
    }

    async fn conditional_write(
        &self,
        path: &str,
        mut record: Record,
        expected: Version,
    ) -> Result<Version> {
        let mut inner = self.inner.lock().unwrap();
        let next = Version::new(inner.last_version + 1);
        let entry = inner
            .entries
            .get_mut(path)
            .ok_or_else(|| Error::NotFound(path.to_string()))?;

        if entry.version != expected {
            return Err(Error::VersionConflict {
                path: path.to_string(),
                expected: expected.to_string(),
                actual: entry.version.to_string(),
            });
        }

        record.clear_marks();
        entry.record = record;
        entry.version = next;
        inner.last_version = next.get();
        Ok(next)
    }

    async fn create(&self, path: &str, mut record: Record) -> Result<Version> {
        let mut inner = self.inner.lock().unwrap();
        if inner.entries.contains_key(path) {
            return Err(Error::AlreadyExists(path.to_string()));
        }

        let version = Version::new(inner.last_version + 1);
        inner.last_version = version.get();
        record.clear_marks();
        inner
            .entries
            .insert(path.to_string(), StoredEntry { record, version });
        Ok(version)
    }

    async fn delete(&self, path: &str) -> Result<bool> {
        Ok(self.inner.lock().unwrap().entries.remove(path).is_some())
    }

    async fn children(&self, path: &str) -> Result<Vec<String>> {
        let prefix = child_prefix(path);
        let inner = self.inner.lock().unwrap();
        let names: BTreeSet<String> = inner
            .entries
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .filter_map(|(key, _)| child_name(key, &prefix).map(str::to_string))
            .collect();
        Ok(names.into_iter().collect())
    }
}
