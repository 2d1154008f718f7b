//! Always-available lower-fidelity artifact substitution.
//!
//! While a specialized build is in flight, the caller substitutes a
//! coarser artifact that is correct for a wide range of keys but slower
//! to use. The provider never misses; that property is what lets
//! `resolve` return something usable on every call without blocking.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use thiserror::Error;

use crate::cache::{BuildJob, BuildKey, JobFactory};

/// Supplies a usable artifact for any key, immediately.
///
/// Implementations must never miss and are never invalidated; the
/// returned artifact may be measurably slower to use than a specialized
/// one.
pub trait FallbackProvider<K>: Send + Sync {
    /// The artifact type supplied.
    type Artifact;

    /// Returns an artifact usable in place of the specialized build for
    /// `key`.
    fn get(&self, key: &K) -> Self::Artifact;
}

/// Errors constructing a fallback provider.
#[derive(Debug, Error)]
pub enum FallbackError {
    /// The baseline artifact could not be built. Without it the provider
    /// cannot honor its never-miss contract, so this is surfaced to the
    /// host instead of being swallowed.
    #[error("baseline fallback artifact failed to build")]
    BaselineBuildFailed,
}

/// Default provider: coarsen the key, build once, reuse forever.
///
/// The injected coarsening function drops optimization-only sub-fields
/// from a key while retaining the correctness-affecting ones, collapsing
/// many specialized keys onto few coarse ones. Coarse artifacts are built
/// synchronously through the same factory as specialized ones and
/// memoized. A baseline artifact built at construction covers the case
/// where a coarse build itself fails.
pub struct CoarseFallback<K, F: JobFactory<K>> {
    factory: Arc<F>,
    coarsen: Box<dyn Fn(&K) -> K + Send + Sync>,
    built: Mutex<BTreeMap<K, F::Artifact>>,
    baseline: F::Artifact,
}

impl<K: BuildKey, F: JobFactory<K>> CoarseFallback<K, F> {
    /// Builds the baseline artifact for `baseline_key` (after coarsening)
    /// and returns the provider.
    ///
    /// Fails if the baseline cannot be built; a host that cannot build
    /// even one coarse artifact has no way to honor the never-miss
    /// contract and must find out at startup.
    pub fn new(
        factory: Arc<F>,
        coarsen: impl Fn(&K) -> K + Send + Sync + 'static,
        baseline_key: &K,
    ) -> Result<Self, FallbackError> {
        let coarse_key = coarsen(baseline_key);
        let baseline =
            build_now(factory.as_ref(), &coarse_key).ok_or(FallbackError::BaselineBuildFailed)?;

        let mut built = BTreeMap::new();
        built.insert(coarse_key, baseline.clone());

        Ok(Self {
            factory,
            coarsen: Box::new(coarsen),
            built: Mutex::new(built),
            baseline,
        })
    }

    /// Number of coarse artifacts built so far (baseline included).
    pub fn built_count(&self) -> usize {
        self.built.lock().unwrap().len()
    }
}

impl<K: BuildKey, F: JobFactory<K>> FallbackProvider<K> for CoarseFallback<K, F> {
    type Artifact = F::Artifact;

    fn get(&self, key: &K) -> F::Artifact {
        let coarse_key = (self.coarsen)(key);
        let mut built = self.built.lock().unwrap();
        if let Some(artifact) = built.get(&coarse_key) {
            return artifact.clone();
        }
        match build_now(self.factory.as_ref(), &coarse_key) {
            Some(artifact) => {
                built.insert(coarse_key, artifact.clone());
                artifact
            }
            None => {
                tracing::warn!(
                    key = ?coarse_key,
                    "coarse fallback build failed; substituting baseline artifact"
                );
                // Memoize the substitution so the failing build is not
                // re-attempted on every frame.
                let artifact = self.baseline.clone();
                built.insert(coarse_key, artifact.clone());
                artifact
            }
        }
    }
}

/// Runs both build phases inline on the calling thread.
fn build_now<K, F: JobFactory<K>>(factory: &F, key: &K) -> Option<F::Artifact> {
    let mut job = factory.create_job(key);
    if job.compile() {
        job.retrieve()
    } else {
        None
    }
}
