use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::StorageError;
use crate::memory::MemoryBackend;

/// Separator placed between nested scopes.
const SCOPE_SEPARATOR: char = '/';

/// Flat byte store keyed by strings.
///
/// Implementations must be safe to share between threads. Every call is
/// expected to be durable once it returns.
pub trait KvBackend: Send + Sync {
    fn get(&self, key: &str) -> Result<Vec<u8>, StorageError>;

    fn set(&self, key: &str, value: &[u8]) -> Result<(), StorageError>;

    /// Deleting a missing key is not an error.
    fn delete(&self, key: &str) -> Result<(), StorageError>;

    /// Returns every stored key starting with `prefix`, in sorted order.
    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StorageError>;
}

/// A view onto a [`KvBackend`] restricted to one key prefix.
#[derive(Clone)]
pub struct Kv {
    backend: Arc<dyn KvBackend>,
    prefix: String,
}

impl Kv {
    /// Wraps a backend at its root scope.
    pub fn new(backend: Arc<dyn KvBackend>) -> Self {
        Self {
            backend,
            prefix: String::new(),
        }
    }

    /// A fresh in-memory store.
    pub fn memory() -> Self {
        Self::new(Arc::new(MemoryBackend::new()))
    }

    /// Returns a nested scope. Keys written through it land under
    /// `<current prefix><scope>/`.
    pub fn scope(&self, scope: &str) -> Kv {
        Kv {
            backend: Arc::clone(&self.backend),
            prefix: format!("{}{scope}{SCOPE_SEPARATOR}", self.prefix),
        }
    }

    /// The full prefix of this scope.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        self.backend.get(&self.full_key(key))
    }

    pub fn set(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        self.backend.set(&self.full_key(key), value)
    }

    pub fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.backend.delete(&self.full_key(key))
    }

    pub fn exists(&self, key: &str) -> Result<bool, StorageError> {
        match self.get(key) {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Reads and decodes a JSON value.
    pub fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<T, StorageError> {
        let data = self.get(key)?;
        Ok(serde_json::from_slice(&data)?)
    }

    /// Encodes and writes a JSON value.
    pub fn set_json<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<(), StorageError> {
        let data = serde_json::to_vec(value)?;
        self.set(key, &data)
    }

    /// Keys stored in this scope, relative to it.
    pub fn keys(&self) -> Result<Vec<String>, StorageError> {
        let keys = self.backend.keys_with_prefix(&self.prefix)?;
        Ok(keys
            .into_iter()
            .map(|k| k[self.prefix.len()..].to_string())
            .collect())
    }

    /// Removes every key in this scope, nested scopes included. Returns the
    /// number of keys removed.
    pub fn delete_all(&self) -> Result<usize, StorageError> {
        let keys = self.backend.keys_with_prefix(&self.prefix)?;
        for key in &keys {
            self.backend.delete(key)?;
        }
        tracing::trace!(prefix = %self.prefix, removed = keys.len(), "scope purged");
        Ok(keys.len())
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{key}", self.prefix)
    }
}
