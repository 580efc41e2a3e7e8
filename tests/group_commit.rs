//! Group commit under concurrency and store failures

use clustermgr::common::{GroupCommitConfig, MemStore, Record, Version, VersionedRecord, VersionedStore};
use clustermgr::coordinator::{CommitObserver, GroupCommit};
use clustermgr::{Error, Result};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn fast_config() -> GroupCommitConfig {
    GroupCommitConfig {
        op_timeout_ms: 2_000,
        initial_backoff_ms: 1,
        max_backoff_ms: 5,
        max_retries: 2,
    }
}

async fn wait_until(what: &str, mut done: impl FnMut() -> bool) {
    for _ in 0..2_000 {
        if done() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {}", what);
}

fn simple(key: impl Into<String>, value: impl Into<String>) -> Record {
    let mut record = Record::default();
    record.set_simple_field(key, value);
    record
}

/// MemStore that tracks overlapping writes and can be made to fail
#[derive(Default)]
struct InstrumentedStore {
    inner: MemStore,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    writes: AtomicUsize,
    failures_left: AtomicUsize,
    down: AtomicBool,
    write_delay: Option<Duration>,
}

impl InstrumentedStore {
    fn slow(delay: Duration) -> Self {
        Self {
            write_delay: Some(delay),
            ..Default::default()
        }
    }

    fn failing_first(n: usize) -> Self {
        let store = Self::default();
        store.failures_left.store(n, Ordering::SeqCst);
        store
    }

    fn check_available(&self) -> Result<()> {
        if self.down.load(Ordering::SeqCst) {
            return Err(Error::StoreUnavailable("store is down".into()));
        }
        let failed = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(Error::StoreUnavailable("injected failure".into()));
        }
        Ok(())
    }

    async fn tracked<T>(&self, op: impl std::future::Future<Output = Result<T>>) -> Result<T> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if let Some(delay) = self.write_delay {
            tokio::time::sleep(delay).await;
        }
        let result = match self.check_available() {
            Ok(()) => op.await,
            Err(e) => Err(e),
        };
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.writes.fetch_add(1, Ordering::SeqCst);
        result
    }
}

impl VersionedStore for InstrumentedStore {
    async fn read(&self, path: &str) -> Result<Option<VersionedRecord>> {
        self.inner.read(path).await
    }

    async fn conditional_write(&self, path: &str, record: Record, expected: Version) -> Result<Version> {
        self.tracked(self.inner.conditional_write(path, record, expected))
            .await
    }

    async fn create(&self, path: &str, record: Record) -> Result<Version> {
        self.tracked(self.inner.create(path, record)).await
    }

    async fn delete(&self, path: &str) -> Result<bool> {
        self.inner.delete(path).await
    }

    async fn children(&self, path: &str) -> Result<Vec<String>> {
        self.inner.children(path).await
    }
}

#[derive(Default)]
struct RecordingObserver {
    errors: Mutex<Vec<(String, u32)>>,
    versions: Mutex<Vec<Version>>,
}

impl CommitObserver for RecordingObserver {
    fn on_commit(&self, _path: &str, version: Version, _batch_size: usize) {
        self.versions.lock().unwrap().push(version);
    }

    fn on_store_error(&self, path: &str, _error: &Error, attempts: u32) {
        self.errors.lock().unwrap().push((path.to_string(), attempts));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_no_lost_updates_from_many_threads() {
    const THREADS: usize = 400;
    const PER_THREAD: usize = 6;
    let path = "/test-cluster/CURRENTSTATES/localhost_8900/TestDB";

    let store = Arc::new(MemStore::new());
    let commit = GroupCommit::new(store.clone(), fast_config()).unwrap();

    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let commit = commit.clone();
            std::thread::spawn(move || {
                for k in 0..PER_THREAD {
                    let i = t * PER_THREAD + k;
                    commit.commit(path, simple(format!("test_id{}", i), i.to_string()));
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    wait_until("group commit to drain", || commit.is_idle(path)).await;

    let stored = store.read(path).await.unwrap().unwrap().record;
    assert_eq!(stored.simple_fields().len(), THREADS * PER_THREAD);
    for i in 0..THREADS * PER_THREAD {
        assert_eq!(
            stored.simple_field(&format!("test_id{}", i)),
            Some(i.to_string().as_str())
        );
    }
    assert_eq!(
        commit.metrics().updates_accepted.get(),
        (THREADS * PER_THREAD) as u64
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_single_committer_per_path() {
    const UPDATES: usize = 500;
    let path = "/c/LIVEINSTANCES/n1";

    let store = Arc::new(InstrumentedStore::slow(Duration::from_millis(1)));
    let commit = GroupCommit::new(store.clone(), fast_config()).unwrap();

    let handles: Vec<_> = (0..10)
        .map(|t| {
            let commit = commit.clone();
            std::thread::spawn(move || {
                for k in 0..UPDATES / 10 {
                    commit.commit(path, simple(format!("k{}_{}", t, k), "v"));
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    wait_until("group commit to drain", || commit.is_idle(path)).await;

    assert_eq!(store.max_in_flight.load(Ordering::SeqCst), 1);
    assert!(store.writes.load(Ordering::SeqCst) < UPDATES);
    let stored = store.read(path).await.unwrap().unwrap().record;
    assert_eq!(stored.simple_fields().len(), UPDATES);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_versions_increase_per_path() {
    let path = "/c/CONFIGS/n1";
    let store = Arc::new(MemStore::new());
    let observer = Arc::new(RecordingObserver::default());
    let commit = GroupCommit::new(store.clone(), fast_config())
        .unwrap()
        .with_observer(observer.clone());

    for i in 0..50 {
        commit.commit(path, simple("counter", i.to_string()));
        if i % 10 == 0 {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    }
    wait_until("group commit to drain", || commit.is_idle(path)).await;

    let versions = observer.versions.lock().unwrap().clone();
    assert!(!versions.is_empty());
    assert!(versions.windows(2).all(|w| w[0] < w[1]));

    // Last writer wins within the path's enqueue order
    let stored = store.read(path).await.unwrap().unwrap();
    assert_eq!(stored.record.simple_field("counter"), Some("49"));
    assert_eq!(Some(&stored.version), versions.last());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_interfering_writer_is_not_clobbered() {
    let path = "/c/IDEALSTATES/TestDB";
    let store = Arc::new(MemStore::new());
    store.create(path, Record::new("TestDB")).await.unwrap();
    let commit = GroupCommit::new(store.clone(), fast_config()).unwrap();

    let writer_store = store.clone();
    let writer = tokio::spawn(async move {
        for i in 0..200 {
            loop {
                let current = writer_store.read(path).await.unwrap().unwrap();
                let mut record = current.record;
                record.set_simple_field(format!("external{}", i), "x");
                match writer_store
                    .conditional_write(path, record, current.version)
                    .await
                {
                    Ok(_) => break,
                    Err(e) if e.is_conflict() => continue,
                    Err(e) => panic!("unexpected store error: {}", e),
                }
            }
            tokio::task::yield_now().await;
        }
    });

    for i in 0..200 {
        commit.commit(path, simple(format!("internal{}", i), "y"));
        if i % 20 == 0 {
            tokio::task::yield_now().await;
        }
    }

    writer.await.unwrap();
    wait_until("group commit to drain", || commit.is_idle(path)).await;

    let stored = store.read(path).await.unwrap().unwrap().record;
    assert_eq!(stored.simple_fields().len(), 400);
}

#[tokio::test]
async fn test_store_failures_reach_observer() {
    let path = "/c/LIVEINSTANCES/n2";
    let store = Arc::new(InstrumentedStore::failing_first(4));
    let observer = Arc::new(RecordingObserver::default());
    let commit = GroupCommit::new(store.clone(), fast_config())
        .unwrap()
        .with_observer(observer.clone());

    commit.commit(path, simple("SESSION_ID", "s1"));
    wait_until("group commit to drain", || commit.is_idle(path)).await;

    // max_retries = 2: told after the 2nd and 4th consecutive failure
    let errors = observer.errors.lock().unwrap().clone();
    assert_eq!(errors, vec![(path.to_string(), 2), (path.to_string(), 4)]);
    assert_eq!(commit.metrics().store_errors.get(), 4);

    let stored = store.read(path).await.unwrap().unwrap().record;
    assert_eq!(stored.simple_field("SESSION_ID"), Some("s1"));
}

#[tokio::test]
async fn test_shutdown_requeues_batch() {
    let path = "/c/CURRENTSTATES/n1/TestDB";
    let store = Arc::new(InstrumentedStore::default());
    store.down.store(true, Ordering::SeqCst);
    let commit = GroupCommit::new(store.clone(), fast_config()).unwrap();

    let mut first = Record::new("TestDB");
    first.set_map_entry("TestDB_0", "CURRENT_STATE", "SLAVE");
    commit.commit(path, first);

    wait_until("a failed write", || commit.metrics().store_errors.get() > 0).await;
    commit.shutdown();
    wait_until("batch to be requeued", || {
        commit.pending(path) == 1 && commit.metrics().active_committers.get() == 0
    })
    .await;
    assert!(!commit.is_idle(path));

    // The next accepted update elects a new committer that carries the old batch
    store.down.store(false, Ordering::SeqCst);
    let mut second = Record::new("TestDB");
    second.set_map_entry("TestDB_1", "CURRENT_STATE", "MASTER");
    commit.commit(path, second);
    wait_until("group commit to drain", || commit.is_idle(path)).await;

    let stored = store.read(path).await.unwrap().unwrap().record;
    assert_eq!(stored.map_field("TestDB_0").unwrap()["CURRENT_STATE"], "SLAVE");
    assert_eq!(stored.map_field("TestDB_1").unwrap()["CURRENT_STATE"], "MASTER");
}

#[tokio::test]
async fn test_append_lists_across_batches() {
    let path = "/c/IDEALSTATES/Queue";
    let store = Arc::new(MemStore::new());
    let commit = GroupCommit::new(store.clone(), fast_config()).unwrap();

    let mut first = Record::new("Queue");
    first.set_list_field("members", vec!["a".into()]);
    commit.commit(path, first);
    wait_until("group commit to drain", || commit.is_idle(path)).await;

    let mut more = Record::new("Queue");
    more.append_list_field("members", vec!["b".into()]);
    commit.commit(path, more);
    let mut again = Record::new("Queue");
    again.append_list_field("members", vec!["c".into()]);
    commit.commit(path, again);
    wait_until("group commit to drain", || commit.is_idle(path)).await;

    let stored = store.read(path).await.unwrap().unwrap().record;
    assert_eq!(stored.list_field("members").unwrap(), &["a", "b", "c"]);
    assert!(!stored.is_append("members"));
}

/// MemStore that applies the first write, then answers late
#[derive(Default)]
struct LateAckStore {
    inner: MemStore,
    acked_late: AtomicBool,
    ack_delay: Duration,
}

impl LateAckStore {
    async fn maybe_stall(&self) {
        if !self.acked_late.swap(true, Ordering::SeqCst) {
            tokio::time::sleep(self.ack_delay).await;
        }
    }
}

impl VersionedStore for LateAckStore {
    async fn read(&self, path: &str) -> Result<Option<VersionedRecord>> {
        self.inner.read(path).await
    }

    async fn conditional_write(&self, path: &str, record: Record, expected: Version) -> Result<Version> {
        let result = self.inner.conditional_write(path, record, expected).await;
        self.maybe_stall().await;
        result
    }

    async fn create(&self, path: &str, record: Record) -> Result<Version> {
        let result = self.inner.create(path, record).await;
        self.maybe_stall().await;
        result
    }

    async fn delete(&self, path: &str) -> Result<bool> {
        self.inner.delete(path).await
    }

    async fn children(&self, path: &str) -> Result<Vec<String>> {
        self.inner.children(path).await
    }
}

fn short_timeout_config() -> GroupCommitConfig {
    GroupCommitConfig {
        op_timeout_ms: 50,
        ..fast_config()
    }
}

#[tokio::test]
async fn test_late_acknowledged_write_applied_once() {
    let path = "/c/IDEALSTATES/Queue";
    let store = Arc::new(LateAckStore {
        ack_delay: Duration::from_millis(200),
        ..Default::default()
    });
    let mut existing = Record::new("Queue");
    existing.set_list_field("members", vec!["a".into()]);
    store.inner.create(path, existing).await.unwrap();

    let commit = GroupCommit::new(store.clone(), short_timeout_config()).unwrap();
    let mut more = Record::new("Queue");
    more.append_list_field("members", vec!["b".into()]);
    commit.commit(path, more);
    wait_until("group commit to drain", || commit.is_idle(path)).await;

    let stored = store.read(path).await.unwrap().unwrap().record;
    assert_eq!(stored.list_field("members").unwrap(), &["a", "b"]);
    assert_eq!(commit.metrics().store_errors.get(), 1);
}

#[tokio::test]
async fn test_late_acknowledged_create_applied_once() {
    let path = "/c/IDEALSTATES/Fresh";
    let store = Arc::new(LateAckStore {
        ack_delay: Duration::from_millis(200),
        ..Default::default()
    });
    let commit = GroupCommit::new(store.clone(), short_timeout_config()).unwrap();

    let mut first = Record::new("Fresh");
    first.append_list_field("members", vec!["x".into()]);
    commit.commit(path, first);
    wait_until("group commit to drain", || commit.is_idle(path)).await;

    let stored = store.read(path).await.unwrap().unwrap().record;
    assert_eq!(stored.list_field("members").unwrap(), &["x"]);
}

/// MemStore where the path disappears between read and write, once
#[derive(Default)]
struct VanishingStore {
    inner: MemStore,
    vanished: AtomicBool,
}

impl VersionedStore for VanishingStore {
    async fn read(&self, path: &str) -> Result<Option<VersionedRecord>> {
        self.inner.read(path).await
    }

    async fn conditional_write(&self, path: &str, record: Record, expected: Version) -> Result<Version> {
        if !self.vanished.swap(true, Ordering::SeqCst) {
            self.inner.delete(path).await?;
        }
        self.inner.conditional_write(path, record, expected).await
    }

    async fn create(&self, path: &str, record: Record) -> Result<Version> {
        self.inner.create(path, record).await
    }

    async fn delete(&self, path: &str) -> Result<bool> {
        self.inner.delete(path).await
    }

    async fn children(&self, path: &str) -> Result<Vec<String>> {
        self.inner.children(path).await
    }
}

#[tokio::test]
async fn test_path_removed_mid_write_is_retried_as_race() {
    let path = "/c/LIVEINSTANCES/n3";
    let store = Arc::new(VanishingStore::default());
    store
        .inner
        .create(path, simple("OLD_SESSION", "s0"))
        .await
        .unwrap();

    let observer = Arc::new(RecordingObserver::default());
    let commit = GroupCommit::new(store.clone(), fast_config())
        .unwrap()
        .with_observer(observer.clone());
    commit.commit(path, simple("SESSION_ID", "s1"));
    wait_until("group commit to drain", || commit.is_idle(path)).await;

    let stored = store.read(path).await.unwrap().unwrap().record;
    assert_eq!(stored.simple_field("SESSION_ID"), Some("s1"));
    assert_eq!(stored.simple_field("OLD_SESSION"), None);
    assert_eq!(commit.metrics().store_errors.get(), 0);
    assert_eq!(commit.metrics().version_conflicts.get(), 1);
    assert!(observer.errors.lock().unwrap().is_empty());
}
