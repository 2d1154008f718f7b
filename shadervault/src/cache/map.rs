//! The artifact map and its pending-build tracking.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use crate::cache::stats::{CacheSnapshot, CacheStats};
use crate::cache::types::{Artifact, BuildJob, BuildKey, JobFactory, Lookup};
use crate::queue::{Priority, QueueConfig, WorkQueue, WorkerInit};

/// One cache slot. An entry with no artifact and `pending == false`
/// records a failed build; such keys are never rebuilt.
struct CacheEntry<A> {
    artifact: Option<A>,
    pending: bool,
}

impl<A> CacheEntry<A> {
    fn vacant() -> Self {
        Self {
            artifact: None,
            pending: false,
        }
    }

    fn in_flight() -> Self {
        Self {
            artifact: None,
            pending: true,
        }
    }
}

/// Internal work item carrying a build operation through the queue.
struct QueuedBuild<K, A> {
    key: K,
    job: Box<dyn BuildJob<Artifact = A>>,
    compiled_ok: bool,
    artifact: Option<A>,
}

impl<K, A> QueuedBuild<K, A> {
    fn new(key: K, job: Box<dyn BuildJob<Artifact = A>>) -> Self {
        Self {
            key,
            job,
            compiled_ok: false,
            artifact: None,
        }
    }
}

impl<K: BuildKey, A: Artifact> crate::queue::WorkItem for QueuedBuild<K, A> {
    fn compile(&mut self) -> bool {
        self.compiled_ok = self.job.compile();
        self.compiled_ok
    }

    fn retrieve(&mut self) {
        let artifact = self.job.retrieve();
        if self.compiled_ok {
            self.artifact = artifact;
        }
    }
}

/// Key-to-artifact map with background builds.
///
/// Lookups never block on a build. A miss enqueues at most one build per
/// key; results are published only by [`ArtifactCache::drain`] (or the
/// synchronous paths), called from the owning thread. A published
/// artifact is immutable for the process lifetime; only
/// [`ArtifactCache::invalidate_all`] removes entries.
pub struct ArtifactCache<K: BuildKey, A: Artifact> {
    entries: Mutex<BTreeMap<K, CacheEntry<A>>>,
    queue: WorkQueue<QueuedBuild<K, A>>,
    factory: Arc<dyn JobFactory<K, Artifact = A>>,
    stats: CacheStats,
}

impl<K: BuildKey, A: Artifact> ArtifactCache<K, A> {
    /// Creates an empty cache. Workers are not started until
    /// [`ArtifactCache::start_workers`] is called.
    pub fn new(factory: Arc<dyn JobFactory<K, Artifact = A>>, queue: QueueConfig) -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
            queue: WorkQueue::new(queue),
            factory,
            stats: CacheStats::new(),
        }
    }

    /// Starts the configured compile workers; returns how many started.
    pub fn start_workers(&self, init: Option<WorkerInit>) -> usize {
        self.queue.start(init)
    }

    /// Pure lookup with no side effects.
    pub fn get(&self, key: &K) -> Option<A> {
        let entries = self.entries.lock().unwrap();
        entries.get(key).and_then(|entry| entry.artifact.clone())
    }

    /// Returns the cached artifact, or classifies the miss and enqueues a
    /// background build if no build for this key is queued, executing, or
    /// already failed.
    ///
    /// The entry check and the pending transition happen under one lock,
    /// so concurrent callers agree on exactly one enqueuer per key.
    pub fn get_or_enqueue(&self, key: &K, priority: Priority) -> Lookup<A> {
        let mut entries = self.entries.lock().unwrap();
        if let Some(entry) = entries.get(key) {
            if let Some(artifact) = &entry.artifact {
                self.stats.record_hit();
                return Lookup::Hit(artifact.clone());
            }
            self.stats.record_miss();
            return if entry.pending {
                Lookup::InFlight
            } else {
                Lookup::Failed
            };
        }
        self.stats.record_miss();
        entries.insert(key.clone(), CacheEntry::in_flight());
        drop(entries);

        let job = self.factory.create_job(key);
        self.queue.queue(QueuedBuild::new(key.clone(), job), priority);
        Lookup::Enqueued
    }

    /// Publishes every finished build and returns the fresh (key,
    /// artifact) pairs that should be persisted.
    ///
    /// Must be called from the owning thread. Failed builds are recorded
    /// as permanent no-artifact entries and logged here, once. A drained
    /// result never overwrites an artifact published earlier (for example
    /// by a synchronous build that won the race).
    pub fn drain(&self) -> Vec<(K, A)> {
        let items = self.queue.drain_completed();
        if items.is_empty() {
            return Vec::new();
        }

        let mut fresh = Vec::with_capacity(items.len());
        let mut entries = self.entries.lock().unwrap();
        for item in items {
            let QueuedBuild { key, artifact, .. } = item;
            let entry = entries
                .entry(key.clone())
                .or_insert_with(CacheEntry::vacant);
            entry.pending = false;
            match artifact {
                Some(artifact) => {
                    if entry.artifact.is_none() {
                        entry.artifact = Some(artifact.clone());
                        self.stats.record_build_completed();
                        fresh.push((key, artifact));
                    }
                }
                None => {
                    if entry.artifact.is_none() {
                        self.stats.record_build_failed();
                        tracing::warn!(
                            key = ?key,
                            "artifact build failed; key will use the fallback permanently"
                        );
                    }
                }
            }
        }
        fresh
    }

    /// Builds `key` immediately on the calling thread, bypassing the
    /// background queue, and publishes the result.
    ///
    /// Must be called from the owning thread. Returns `None` when the
    /// build fails; the failure is recorded and never retried.
    pub fn build_sync(&self, key: &K) -> Option<A> {
        if let Some(artifact) = self.get(key) {
            return Some(artifact);
        }

        let mut job = self.factory.create_job(key);
        let built = if job.compile() { job.retrieve() } else { None };

        let mut entries = self.entries.lock().unwrap();
        let entry = entries
            .entry(key.clone())
            .or_insert_with(CacheEntry::vacant);
        entry.pending = false;
        if let Some(existing) = &entry.artifact {
            // A background build for this key published between our
            // lookup and now; keep the published artifact.
            return Some(existing.clone());
        }
        match built {
            Some(artifact) => {
                entry.artifact = Some(artifact.clone());
                self.stats.record_build_completed();
                Some(artifact)
            }
            None => {
                self.stats.record_build_failed();
                tracing::warn!(
                    key = ?key,
                    "synchronous artifact build failed; key will use the fallback permanently"
                );
                None
            }
        }
    }

    /// Inserts entries trusted from the persisted store.
    ///
    /// Preloaded entries are published directly and are not reported by
    /// [`ArtifactCache::drain`], so they are never re-persisted. An entry
    /// already published for a key is kept.
    pub fn insert_preloaded(&self, preloaded: Vec<(K, A)>) {
        let count = preloaded.len() as u64;
        let mut entries = self.entries.lock().unwrap();
        for (key, artifact) in preloaded {
            let entry = entries.entry(key).or_insert_with(CacheEntry::vacant);
            if entry.artifact.is_none() {
                entry.artifact = Some(artifact);
            }
        }
        drop(entries);
        self.stats.record_preloaded(count);
    }

    /// Stops all workers, discards queued and completed builds, and
    /// releases every artifact.
    ///
    /// Call [`ArtifactCache::start_workers`] afterwards to bring the pool
    /// back.
    pub fn invalidate_all(&self) {
        self.queue.stop();
        self.queue.clear();
        let released = {
            let mut entries = self.entries.lock().unwrap();
            let released = entries.len();
            entries.clear();
            released
        };
        tracing::info!(released, "artifact cache invalidated");
    }

    /// Stops the compile workers. In-flight builds finish first.
    pub fn shutdown(&self) {
        self.queue.stop();
    }

    /// Number of entries, including pending and failed slots.
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    /// True when the cache holds no entries at all.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().unwrap().is_empty()
    }

    /// True when no build is queued or executing.
    pub fn is_idle(&self) -> bool {
        !self.queue.has_pending()
    }

    /// True while finished builds await a `drain()`.
    pub fn has_completed(&self) -> bool {
        self.queue.has_completed()
    }

    /// Monotonic (done, total) build counters for progress reporting.
    pub fn progress(&self) -> (u64, u64) {
        self.queue.progress()
    }

    /// Blocks until no build is queued or in flight; see
    /// [`WorkQueue::wait_until_idle`].
    pub fn wait_until_idle<F>(&self, progress: F) -> bool
    where
        F: FnMut(u64, u64),
    {
        self.queue.wait_until_idle(progress)
    }

    /// Point-in-time counter snapshot.
    pub fn stats(&self) -> CacheSnapshot {
        self.stats.snapshot()
    }
}
