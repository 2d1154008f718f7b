//! Append-only persisted artifact store.
//!
//! A versioned header followed by length-prefixed (key, artifact) records.
//! Loading grants all-or-nothing trust: any mismatch or truncation
//! discards the entire store rather than salvaging a prefix.

mod disk;
mod format;

pub use disk::{DiskStore, StoreError};
pub use format::{Header, FORMAT_VERSION, MAGIC};
