//! Persistent key-value storage.
//!
//! The cache and the offline queue only need an opaque string store with
//! get/set/delete/list. Two backends are provided:
//! - `FileStore`: one JSON file per key inside a data directory
//! - `MemoryStore`: process-local map, used in tests and throwaway sessions

mod file;
mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("I/O error on '{key}': {message}")]
    Io { key: String, message: String },

    #[error("Corrupt record '{key}': {message}")]
    Corrupt { key: String, message: String },

    #[error("Failed to serialize '{key}': {message}")]
    Serialize { key: String, message: String },
}

impl StorageError {
    pub fn io(key: &str, err: impl std::fmt::Display) -> Self {
        StorageError::Io {
            key: key.to_string(),
            message: err.to_string(),
        }
    }

    pub fn corrupt(key: &str, err: impl std::fmt::Display) -> Self {
        StorageError::Corrupt {
            key: key.to_string(),
            message: err.to_string(),
        }
    }

    pub fn serialize(key: &str, err: impl std::fmt::Display) -> Self {
        StorageError::Serialize {
            key: key.to_string(),
            message: err.to_string(),
        }
    }
}

#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

    async fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;

    /// Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<(), StorageError>;

    /// Keys starting with `prefix`, sorted.
    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StorageError>;
}
