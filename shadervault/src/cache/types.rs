//! Core contracts between the cache and its collaborators.

use std::fmt::Debug;
use std::hash::Hash;

/// Immutable descriptor of one build request.
///
/// A key fully determines the artifact it produces. The cache never
/// inspects a key's sub-fields; it only compares, orders, hashes, and
/// round-trips them through the persisted store.
pub trait BuildKey: Clone + Eq + Ord + Hash + Debug + Send + Sync + 'static {
    /// Appends the serialized form of this key to `out`.
    fn encode(&self, out: &mut Vec<u8>);

    /// Reconstructs a key from its serialized form.
    ///
    /// Returns `None` for any byte sequence `encode` could not have
    /// produced; a persisted store containing such a record is discarded
    /// wholesale.
    fn decode(bytes: &[u8]) -> Option<Self>;
}

/// Opaque compiled output of a build.
///
/// Cloning must be cheap (a handle or reference-counted blob); resolved
/// artifacts are handed out by value on every cache hit.
pub trait Artifact: Clone + Send + Sync + 'static {
    /// Appends the serialized form of this artifact to `out`.
    fn encode(&self, out: &mut Vec<u8>);

    /// Reconstructs an artifact from its serialized form.
    fn decode(bytes: &[u8]) -> Option<Self>;
}

/// A two-phase build operation for a single key.
///
/// `compile()` runs off the owning thread and must not touch caller-owned
/// state; `retrieve()` runs back on the owning thread and may realize
/// driver-owned objects. `retrieve()` is called even after a failed
/// compile, giving the operation a chance to release partial state; it
/// should return `None` in that case.
pub trait BuildJob: Send {
    /// The artifact type this job produces.
    type Artifact;

    /// Runs the expensive build phase. Returns `false` on failure.
    fn compile(&mut self) -> bool;

    /// Produces the finished artifact on the owning thread.
    fn retrieve(&mut self) -> Option<Self::Artifact>;
}

/// Creates build operations for keys.
///
/// The factory is the seam through which the real (driver-specific)
/// compiler is injected; the cache itself never knows how an artifact is
/// produced.
pub trait JobFactory<K>: Send + Sync + 'static {
    /// The artifact type produced by this factory's jobs.
    type Artifact: Artifact;

    /// Creates a new build operation for `key`.
    fn create_job(&self, key: &K) -> Box<dyn BuildJob<Artifact = Self::Artifact>>;
}

/// Result of a non-blocking cache lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup<A> {
    /// The artifact was cached; use it directly.
    Hit(A),
    /// Miss; a background build was enqueued just now.
    Enqueued,
    /// Miss; a build for this key was already queued or executing.
    InFlight,
    /// A build for this key failed earlier; it will not be retried.
    Failed,
}

impl<A> Lookup<A> {
    /// Unwraps a hit, discarding the miss detail.
    pub fn hit(self) -> Option<A> {
        match self {
            Lookup::Hit(artifact) => Some(artifact),
            _ => None,
        }
    }

    /// True for every outcome that requires a fallback substitution.
    pub fn is_miss(&self) -> bool {
        !matches!(self, Lookup::Hit(_))
    }
}
