//! Group commit: coalesce concurrent partial updates into conditional writes
//!
//! Callers hand a partial record for a path to [`GroupCommit::commit`] and
//! return immediately. Per path, the first caller that finds no committer
//! running becomes the committer and spawns the merge loop; everyone else
//! only enqueues. The merge loop drains the queue, merges the batch in
//! enqueue order, reads the stored record, applies the batch and writes it
//! back conditional on the version it read, retrying on conflict. It keeps
//! draining until the queue is empty.
//!
//! `commit` returning means the update was accepted, not that it is durable.
//! Poll the store (or [`GroupCommit::is_idle`]) to observe convergence.

use crate::common::{
    coalesce, Backoff, Error, GroupCommitConfig, MetricsRegistry, Record, Result, Version,
    VersionedRecord, VersionedStore,
};
use dashmap::DashMap;
use rand::Rng;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::runtime::Handle;

/// Consecutive conflicts after which the committer sleeps a random slice of
/// the initial backoff before re-reading.
const CONFLICT_JITTER_EVERY: u32 = 8;

/// Receives merge-loop outcomes. `commit` has already returned by the time
/// any of these fire, so this is the only place store failures surface.
pub trait CommitObserver: Send + Sync {
    /// A coalesced batch became durable at `version`.
    fn on_commit(&self, _path: &str, _version: Version, _batch_size: usize) {}

    /// The store failed `attempts` times in a row for `path`. The committer
    /// keeps retrying.
    fn on_store_error(&self, path: &str, error: &Error, attempts: u32);
}

/// Default observer: log through tracing
pub struct LoggingObserver;

impl CommitObserver for LoggingObserver {
    fn on_commit(&self, path: &str, version: Version, batch_size: usize) {
        tracing::trace!(path, %version, batch_size, "group commit durable");
    }

    fn on_store_error(&self, path: &str, error: &Error, attempts: u32) {
        tracing::error!(path, attempts, error = %error, "group commit cannot reach store");
    }
}

#[derive(Default)]
struct SlotState {
    pending: VecDeque<Record>,
    committer_active: bool,
}

/// Per-path queue and committer flag, guarded together.
#[derive(Default)]
struct PathSlot {
    state: Mutex<SlotState>,
}

struct Inner<S> {
    store: Arc<S>,
    slots: DashMap<String, Arc<PathSlot>>,
    config: GroupCommitConfig,
    observer: Arc<dyn CommitObserver>,
    metrics: Arc<MetricsRegistry>,
    runtime: Handle,
    shutting_down: AtomicBool,
}

/// Coalescing writer in front of a [`VersionedStore`]
pub struct GroupCommit<S> {
    inner: Arc<Inner<S>>,
}

impl<S> Clone for GroupCommit<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: VersionedStore> GroupCommit<S> {
    /// Create a group commit bound to the current tokio runtime.
    pub fn new(store: Arc<S>, config: GroupCommitConfig) -> Result<Self> {
        let runtime = Handle::try_current().map_err(|_| {
            Error::Internal("group commit must be created inside a tokio runtime".into())
        })?;
        Self::with_runtime(store, config, runtime)
    }

    /// Create a group commit whose merge loops run on `runtime`.
    pub fn with_runtime(store: Arc<S>, config: GroupCommitConfig, runtime: Handle) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(Inner {
                store,
                slots: DashMap::new(),
                config,
                observer: Arc::new(LoggingObserver),
                metrics: Arc::new(MetricsRegistry::new()),
                runtime,
                shutting_down: AtomicBool::new(false),
            }),
        })
    }

    /// Replace the observer. Must be called before the instance is shared.
    pub fn with_observer(self, observer: Arc<dyn CommitObserver>) -> Self {
        let inner = match Arc::try_unwrap(self.inner) {
            Ok(mut inner) => {
                inner.observer = observer;
                inner
            }
            Err(shared) => {
                tracing::warn!("observer not installed: group commit already shared");
                return Self { inner: shared };
            }
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Accept `partial` for eventual merge into the record at `path`.
    ///
    /// Never waits on the store. Safe to call from any thread.
    pub fn commit(&self, path: &str, partial: Record) {
        let slot = self.slot(path);
        let elected = {
            let mut state = slot.state.lock().unwrap();
            state.pending.push_back(partial);
            !std::mem::replace(&mut state.committer_active, true)
        };
        self.inner.metrics.updates_accepted.inc();

        if elected {
            let inner = Arc::clone(&self.inner);
            let path = path.to_string();
            self.inner
                .runtime
                .spawn(async move { inner.run_committer(path, slot).await });
        }
    }

    /// Updates accepted for `path` but not yet drained by a committer
    pub fn pending(&self, path: &str) -> usize {
        self.inner
            .slots
            .get(path)
            .map(|slot| slot.state.lock().unwrap().pending.len())
            .unwrap_or(0)
    }

    /// No queued updates and no committer running for `path`
    pub fn is_idle(&self, path: &str) -> bool {
        self.inner
            .slots
            .get(path)
            .map(|slot| {
                let state = slot.state.lock().unwrap();
                state.pending.is_empty() && !state.committer_active
            })
            .unwrap_or(true)
    }

    /// Stop retrying failed writes. Committers that hit a store failure after
    /// this put their batch back in the queue and exit.
    pub fn shutdown(&self) {
        tracing::info!("Group commit shutting down");
        self.inner.shutting_down.store(true, Ordering::SeqCst);
    }

    pub fn metrics(&self) -> &MetricsRegistry {
        &self.inner.metrics
    }

    pub fn store(&self) -> &Arc<S> {
        &self.inner.store
    }

    fn slot(&self, path: &str) -> Arc<PathSlot> {
        if let Some(slot) = self.inner.slots.get(path) {
            return Arc::clone(slot.value());
        }
        Arc::clone(self.inner.slots.entry(path.to_string()).or_default().value())
    }
}

impl<S: VersionedStore> Inner<S> {
    async fn run_committer(self: Arc<Self>, path: String, slot: Arc<PathSlot>) {
        self.metrics.active_committers.inc();
        tracing::debug!(path = %path, "committer elected");

        loop {
            // Drain, or release the flag if nothing is left. Both happen
            // under the lock `commit` uses, so no enqueue is missed.
            let batch: Vec<Record> = {
                let mut state = slot.state.lock().unwrap();
                if state.pending.is_empty() {
                    state.committer_active = false;
                    break;
                }
                state.pending.drain(..).collect()
            };

            let batch_size = batch.len();
            let delta = coalesce(batch);
            let started = Instant::now();

            match self.write_through(&path, &delta).await {
                Ok(version) => {
                    self.metrics.batches_committed.inc();
                    self.metrics.batch_size.observe(batch_size as f64);
                    self.metrics
                        .write_latency
                        .observe(started.elapsed().as_secs_f64() * 1000.0);
                    self.observer.on_commit(&path, version, batch_size);
                }
                Err(e) => {
                    let left = {
                        let mut state = slot.state.lock().unwrap();
                        state.pending.push_front(delta);
                        state.committer_active = false;
                        state.pending.len()
                    };
                    tracing::warn!(
                        path = %path,
                        error = %e,
                        "committer stopped during shutdown; {} merged update(s) still queued",
                        left
                    );
                    break;
                }
            }
        }

        self.metrics.active_committers.dec();
    }

    /// Apply `delta` to the stored record until a conditional write succeeds.
    /// Only gives up (returning the last error) once shutdown was requested.
    async fn write_through(&self, path: &str, delta: &Record) -> Result<Version> {
        let mut backoff = Backoff::new(self.config.initial_backoff(), self.config.max_backoff());
        let mut failures = 0u32;
        let mut conflicts = 0u32;
        // Candidates whose write timed out: any of them may have landed.
        let mut unacknowledged: Vec<Record> = Vec::new();

        loop {
            match self.attempt(path, delta, &mut unacknowledged).await {
                Ok(version) => {
                    self.metrics.writes_succeeded.inc();
                    return Ok(version);
                }
                Err(e) if e.is_conflict() || matches!(e, Error::NotFound(_)) => {
                    // The store answered; only the race was lost.
                    conflicts += 1;
                    failures = 0;
                    backoff.reset();
                    self.metrics.version_conflicts.inc();
                    tracing::debug!(path, conflicts, error = %e, "lost write race; re-reading");
                    if conflicts % CONFLICT_JITTER_EVERY == 0 {
                        tokio::time::sleep(self.conflict_jitter()).await;
                    }
                }
                Err(e) => {
                    failures += 1;
                    self.metrics.store_errors.inc();
                    tracing::warn!(path, attempt = failures, error = %e, "store write failed");

                    if !e.is_retryable() || failures % self.config.max_retries == 0 {
                        self.observer.on_store_error(path, &e, failures);
                    }
                    if self.shutting_down.load(Ordering::SeqCst) {
                        return Err(e);
                    }
                    tokio::time::sleep(backoff.next_delay()).await;
                }
            }
        }
    }

    /// One read-merge-write round trip. Nothing read here outlives the call.
    ///
    /// A write that times out may still land. Its candidate is kept in
    /// `unacknowledged`; if a later read finds the stored record equal to one
    /// of them, the batch is already applied and is not merged again.
    async fn attempt(
        &self,
        path: &str,
        delta: &Record,
        unacknowledged: &mut Vec<Record>,
    ) -> Result<Version> {
        let current = self.timed("read", path, self.store.read(path)).await?;

        if let Some(stored) = &current {
            if unacknowledged.iter().any(|sent| *sent == stored.record) {
                tracing::debug!(path, version = %stored.version, "timed-out write had landed");
                return Ok(stored.version);
            }
        }

        let (mut candidate, expected) = match current {
            Some(VersionedRecord {
                mut record,
                version,
            }) => {
                record.merge(delta.clone());
                (record, Some(version))
            }
            None => (Record::new(record_id(path, delta)).merged(delta.clone()), None),
        };
        candidate.clear_marks();

        let result = match expected {
            Some(version) => {
                self.timed(
                    "conditional_write",
                    path,
                    self.store.conditional_write(path, candidate.clone(), version),
                )
                .await
            }
            None => {
                self.timed("create", path, self.store.create(path, candidate.clone()))
                    .await
            }
        };

        if matches!(result, Err(Error::Timeout(_))) {
            unacknowledged.push(candidate);
        }
        result
    }

    async fn timed<T>(
        &self,
        op: &str,
        path: &str,
        fut: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        let limit = self.config.op_timeout();
        tokio::time::timeout(limit, fut).await.map_err(|_| {
            Error::Timeout(format!("{} {} exceeded {:?}", op, path, limit))
        })?
    }

    fn conflict_jitter(&self) -> Duration {
        let ceiling = self.config.initial_backoff_ms.max(1);
        Duration::from_millis(rand::thread_rng().gen_range(0..=ceiling))
    }
}

/// Id for a record created by group commit: the caller's id if given,
/// otherwise the last path segment.
fn record_id(path: &str, delta: &Record) -> String {
    if !delta.id().is_empty() {
        return delta.id().to_string();
    }
    path.rsplit('/').next().unwrap_or(path).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::MemStore;

    fn fast_config() -> GroupCommitConfig {
        GroupCommitConfig {
            op_timeout_ms: 1_000,
            initial_backoff_ms: 1,
            max_backoff_ms: 5,
            max_retries: 2,
        }
    }

    async fn wait_idle<S: VersionedStore>(commit: &GroupCommit<S>, path: &str) {
        for _ in 0..1_000 {
            if commit.is_idle(path) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("group commit for {} did not go idle", path);
    }

    #[tokio::test]
    async fn test_first_commit_creates_record() {
        let store = Arc::new(MemStore::new());
        let commit = GroupCommit::new(store.clone(), fast_config()).unwrap();

        let mut partial = Record::default();
        partial.set_simple_field("SESSION_ID", "abc");
        commit.commit("/c/LIVEINSTANCES/n1", partial);
        wait_idle(&commit, "/c/LIVEINSTANCES/n1").await;

        let stored = store.read("/c/LIVEINSTANCES/n1").await.unwrap().unwrap();
        assert_eq!(stored.record.id(), "n1");
        assert_eq!(stored.record.simple_field("SESSION_ID"), Some("abc"));
        assert_eq!(commit.metrics().updates_accepted.get(), 1);
        assert_eq!(commit.metrics().writes_succeeded.get(), 1);
    }

    #[tokio::test]
    async fn test_commit_preserves_existing_fields() {
        let store = Arc::new(MemStore::new());
        let mut existing = Record::new("TestDB");
        existing.set_simple_field("owner", "ops");
        existing.set_map_entry("TestDB_0", "CURRENT_STATE", "OFFLINE");
        store.create("/c/CURRENTSTATES/n1/TestDB", existing).await.unwrap();

        let commit = GroupCommit::new(store.clone(), fast_config()).unwrap();
        let mut partial = Record::new("TestDB");
        partial.set_map_entry("TestDB_1", "CURRENT_STATE", "SLAVE");
        commit.commit("/c/CURRENTSTATES/n1/TestDB", partial);
        wait_idle(&commit, "/c/CURRENTSTATES/n1/TestDB").await;

        let stored = store
            .read("/c/CURRENTSTATES/n1/TestDB")
            .await
            .unwrap()
            .unwrap()
            .record;
        assert_eq!(stored.simple_field("owner"), Some("ops"));
        assert!(stored.map_field("TestDB_0").is_some());
        assert!(stored.map_field("TestDB_1").is_some());
    }

    #[tokio::test]
    async fn test_idle_for_unknown_path() {
        let store = Arc::new(MemStore::new());
        let commit = GroupCommit::new(store, fast_config()).unwrap();
        assert!(commit.is_idle("/never"));
        assert_eq!(commit.pending("/never"), 0);
    }

    #[test]
    fn test_new_requires_runtime() {
        let store = Arc::new(MemStore::new());
        assert!(GroupCommit::new(store, fast_config()).is_err());
    }

    #[test]
    fn test_record_id_falls_back_to_path() {
        assert_eq!(record_id("/c/CONFIGS/n1", &Record::default()), "n1");
        assert_eq!(record_id("/c/CONFIGS/n1", &Record::new("x")), "x");
    }
}
