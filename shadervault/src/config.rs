//! Service configuration.

use std::fmt;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::queue::{WorkerInit, DEFAULT_POLL_INTERVAL};

/// File name of the persisted artifact store inside the store directory.
pub const STORE_FILE: &str = "artifacts.svlt";

/// Configuration for a [`crate::service::ShaderVaultService`].
#[derive(Clone)]
pub struct ServiceConfig {
    /// Background compile threads. Zero disables background compilation;
    /// every build then runs synchronously on the owning thread.
    pub worker_threads: usize,
    /// Directory holding the persisted artifact store.
    pub store_dir: PathBuf,
    /// Whether built artifacts are persisted across runs.
    pub persist: bool,
    /// Version of the artifact encoding. Bump when the compiled output
    /// format changes; a bumped version invalidates previous stores.
    pub artifact_kind_version: u32,
    /// Interval between polls while waiting for the queue to go idle.
    pub poll_interval: Duration,
    /// Optional per-worker init hook (e.g. binding a shared GPU context).
    pub worker_init: Option<WorkerInit>,
    /// Cancellation token shared with the host's shutdown sequence.
    pub cancel: CancellationToken,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            // Leave a core for the render thread.
            worker_threads: thread::available_parallelism()
                .map(|n| n.get().saturating_sub(1).max(1))
                .unwrap_or(3),
            store_dir: dirs::cache_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("shadervault"),
            persist: true,
            artifact_kind_version: 1,
            poll_interval: DEFAULT_POLL_INTERVAL,
            worker_init: None,
            cancel: CancellationToken::new(),
        }
    }
}

impl ServiceConfig {
    /// Set the number of background compile threads (zero forces
    /// synchronous builds).
    pub fn with_worker_threads(mut self, threads: usize) -> Self {
        self.worker_threads = threads;
        self
    }

    /// Set the store directory.
    pub fn with_store_dir(mut self, dir: PathBuf) -> Self {
        self.store_dir = dir;
        self
    }

    /// Enable or disable persistence.
    pub fn with_persist(mut self, persist: bool) -> Self {
        self.persist = persist;
        self
    }

    /// Set the artifact kind version.
    pub fn with_artifact_kind_version(mut self, version: u32) -> Self {
        self.artifact_kind_version = version;
        self
    }

    /// Set the idle-wait polling interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the per-worker init hook.
    pub fn with_worker_init(mut self, init: WorkerInit) -> Self {
        self.worker_init = Some(init);
        self
    }

    /// Share a cancellation token with the host.
    pub fn with_cancel_token(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Full path of the persisted store file.
    pub fn store_path(&self) -> PathBuf {
        self.store_dir.join(STORE_FILE)
    }
}

impl fmt::Debug for ServiceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceConfig")
            .field("worker_threads", &self.worker_threads)
            .field("store_dir", &self.store_dir)
            .field("persist", &self.persist)
            .field("artifact_kind_version", &self.artifact_kind_version)
            .field("poll_interval", &self.poll_interval)
            .field("worker_init", &self.worker_init.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServiceConfig::default();
        assert!(config.worker_threads >= 1);
        assert!(config.persist);
        assert_eq!(config.artifact_kind_version, 1);
        assert_eq!(config.poll_interval, DEFAULT_POLL_INTERVAL);
        assert!(config.worker_init.is_none());
        assert!(config.store_dir.ends_with("shadervault"));
    }

    #[test]
    fn test_builder_methods() {
        let config = ServiceConfig::default()
            .with_worker_threads(0)
            .with_store_dir(PathBuf::from("/tmp/vault"))
            .with_persist(false)
            .with_artifact_kind_version(9)
            .with_poll_interval(Duration::from_millis(2));

        assert_eq!(config.worker_threads, 0);
        assert_eq!(config.store_dir, PathBuf::from("/tmp/vault"));
        assert!(!config.persist);
        assert_eq!(config.artifact_kind_version, 9);
        assert_eq!(config.poll_interval, Duration::from_millis(2));
    }

    #[test]
    fn test_store_path_appends_file_name() {
        let config = ServiceConfig::default().with_store_dir(PathBuf::from("/tmp/vault"));
        assert_eq!(config.store_path(), PathBuf::from("/tmp/vault/artifacts.svlt"));
    }
}
