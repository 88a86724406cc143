//! Scoped key-value persistence.
//!
//! Transfer state is written through a [`Kv`] handle, a cheap clonable
//! view onto a shared [`KvBackend`] restricted to one key prefix. Two
//! backends ship with the crate: [`MemoryBackend`] for tests and
//! short-lived processes, and [`FileBackend`] which keeps one file per key
//! in a directory.

mod file;
mod kv;
mod memory;

pub use file::FileBackend;
pub use kv::{Kv, KvBackend};
pub use memory::MemoryBackend;

/// Errors produced by storage backends.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("key not found: {0}")]
    NotFound(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("corrupt entry {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

impl StorageError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}
