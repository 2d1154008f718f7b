//! The orchestrating service.

use std::sync::Arc;
use std::thread;

use crate::cache::{Artifact, ArtifactCache, BuildKey, CacheSnapshot, JobFactory, Lookup};
use crate::config::ServiceConfig;
use crate::fallback::FallbackProvider;
use crate::queue::{Priority, QueueConfig};
use crate::store::DiskStore;

/// Facade over the compile queue, artifact cache, persisted store, and
/// fallback provider.
///
/// One thread owns the service and calls [`ShaderVaultService::resolve`]
/// and [`ShaderVaultService::drain`]; builds run on background workers.
/// `resolve` never blocks on a fresh build: it returns the cached
/// artifact or a fallback substitution while the real build is queued.
pub struct ShaderVaultService<K, A, P>
where
    K: BuildKey,
    A: Artifact,
    P: FallbackProvider<K, Artifact = A>,
{
    cache: ArtifactCache<K, A>,
    store: Option<DiskStore<K, A>>,
    fallback: P,
    config: ServiceConfig,
}

impl<K, A, P> ShaderVaultService<K, A, P>
where
    K: BuildKey,
    A: Artifact,
    P: FallbackProvider<K, Artifact = A>,
{
    /// Wires the components, starts the worker pool, and preloads the
    /// persisted store.
    ///
    /// A store that cannot be opened degrades the service to an
    /// in-memory-only cache with an error log; it is never fatal.
    pub fn new(
        config: ServiceConfig,
        factory: Arc<dyn JobFactory<K, Artifact = A>>,
        fallback: P,
    ) -> Self {
        let queue_config = QueueConfig::default()
            .with_threads(config.worker_threads)
            .with_poll_interval(config.poll_interval)
            .with_cancel_token(config.cancel.clone());
        let cache = ArtifactCache::new(factory, queue_config);

        let started = cache.start_workers(config.worker_init.clone());
        if started < config.worker_threads {
            tracing::warn!(
                requested = config.worker_threads,
                started,
                "compile worker pool started short"
            );
        }

        let store = if config.persist {
            match DiskStore::open(config.store_path(), config.artifact_kind_version) {
                Ok(mut store) => {
                    let preloaded = store.load();
                    if !preloaded.is_empty() {
                        cache.insert_preloaded(preloaded);
                    }
                    Some(store)
                }
                Err(error) => {
                    tracing::error!(%error, "artifact store unavailable; running without persistence");
                    None
                }
            }
        } else {
            None
        };

        tracing::info!(
            workers = started,
            persist = store.is_some(),
            "shader vault ready"
        );

        Self {
            cache,
            store,
            fallback,
            config,
        }
    }

    /// Returns the artifact to use this frame: the cached one on a hit,
    /// otherwise a fallback substitution while the build proceeds in the
    /// background. Never blocks on a build.
    pub fn resolve(&self, key: &K, priority: Priority) -> A {
        match self.cache.get_or_enqueue(key, priority) {
            Lookup::Hit(artifact) => artifact,
            _ => self.fallback.get(key),
        }
    }

    /// Like [`ShaderVaultService::resolve`] but reports whether a
    /// substitution is needed instead of performing it.
    pub fn lookup(&self, key: &K, priority: Priority) -> Lookup<A> {
        self.cache.get_or_enqueue(key, priority)
    }

    /// Pure cache lookup with no side effects.
    pub fn get(&self, key: &K) -> Option<A> {
        self.cache.get(key)
    }

    /// Builds `key` synchronously, blocking the owning thread.
    ///
    /// For contexts that must not proceed without the specialized
    /// artifact, e.g. before the first frame renders. A failed build is
    /// recorded permanently and the fallback is substituted.
    pub fn get_sync(&mut self, key: &K) -> A {
        if let Some(artifact) = self.cache.get(key) {
            return artifact;
        }
        match self.cache.build_sync(key) {
            Some(artifact) => {
                self.persist(key, &artifact);
                artifact
            }
            None => self.fallback.get(key),
        }
    }

    /// Publishes every finished background build and appends fresh ones
    /// to the persisted store. Call once per frame on the owning thread.
    pub fn drain(&mut self) {
        for (key, artifact) in self.cache.drain() {
            self.persist(&key, &artifact);
        }
    }

    /// Blocks until no build is queued or in flight, draining completed
    /// builds between polls so bulk precompiles publish as they finish.
    ///
    /// `progress` receives monotonically non-decreasing `(done, total)`
    /// pairs. Returns `false` if the cancellation token fires first.
    pub fn wait_until_idle<F>(&mut self, mut progress: F) -> bool
    where
        F: FnMut(u64, u64),
    {
        loop {
            if self.config.cancel.is_cancelled() {
                return false;
            }
            self.drain();
            let (done, total) = self.cache.progress();
            progress(done, total);
            if self.cache.is_idle() {
                // Publish anything that completed since the drain above.
                self.drain();
                return true;
            }
            thread::sleep(self.config.poll_interval);
        }
    }

    /// Discards every artifact, queued build, and persisted record, then
    /// restarts the worker pool.
    ///
    /// For host configuration changes that alter the key-to-artifact
    /// mapping in a way the keys themselves do not capture; persisted
    /// records are stale under the new mapping and are cleared too.
    pub fn invalidate_all(&mut self) {
        self.cache.invalidate_all();
        if let Some(store) = self.store.as_mut() {
            if let Err(error) = store.clear() {
                tracing::error!(%error, "failed to clear artifact store");
            }
        }
        let started = self.cache.start_workers(self.config.worker_init.clone());
        tracing::info!(workers = started, "artifact cache invalidated; workers restarted");
    }

    /// Stops the compile workers; in-flight builds finish first.
    /// Idempotent, and also performed on drop.
    pub fn shutdown(&mut self) {
        self.cache.shutdown();
    }

    /// Point-in-time cache counters.
    pub fn stats(&self) -> CacheSnapshot {
        self.cache.stats()
    }

    /// Number of cache entries, including pending and failed slots.
    pub fn entry_count(&self) -> usize {
        self.cache.len()
    }

    /// True while any build is queued or executing.
    pub fn has_pending(&self) -> bool {
        !self.cache.is_idle()
    }

    /// True while finished builds await a [`ShaderVaultService::drain`].
    pub fn has_completed(&self) -> bool {
        self.cache.has_completed()
    }

    fn persist(&mut self, key: &K, artifact: &A) {
        if let Some(store) = self.store.as_mut() {
            if let Err(error) = store.append(key, artifact) {
                tracing::error!(%error, "failed to append artifact record; disabling persistence");
                self.store = None;
            }
        }
    }
}
