//! ShaderVault - asynchronous compiled-artifact cache for real-time renderers.
//!
//! This library maps immutable build keys to expensive-to-produce compiled
//! artifacts without ever blocking the calling thread on a fresh build. A
//! request resolves immediately to a cached artifact, to an always-available
//! lower-fidelity fallback, or to a newly enqueued background build.
//!
//! # High-Level API
//!
//! For most use cases, the [`service`] module provides a simplified facade:
//!
//! ```ignore
//! use std::sync::Arc;
//! use shadervault::config::ServiceConfig;
//! use shadervault::fallback::CoarseFallback;
//! use shadervault::queue::Priority;
//! use shadervault::service::ShaderVaultService;
//!
//! let factory = Arc::new(MyPipelineFactory::new(device));
//! let fallback = CoarseFallback::new(factory.clone(), coarsen_key, &baseline_key)?;
//! let mut service = ShaderVaultService::new(ServiceConfig::default(), factory, fallback);
//!
//! // Per frame, on the owning thread:
//! let pipeline = service.resolve(&key, Priority::ON_DEMAND);
//! service.drain();
//! ```

pub mod cache;
pub mod config;
pub mod fallback;
pub mod logging;
pub mod queue;
pub mod service;
pub mod store;

/// Version of the ShaderVault library.
///
/// The version is defined in `Cargo.toml` and injected at compile time.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_is_not_empty() {
        assert!(!VERSION.is_empty(), "Version should not be empty");
    }
}
