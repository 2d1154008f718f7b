//! High-level service facade composing the queue, cache, store, and
//! fallback provider into the single surface callers use per frame.

mod facade;

pub use facade::ShaderVaultService;
