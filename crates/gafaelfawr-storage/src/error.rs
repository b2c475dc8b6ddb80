//! Errors from the storage backend layer.

use thiserror::Error;

/// Errors returned by a [`crate::StorageBackend`] implementation.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Failed to open or connect to the backend.
    #[error("failed to open storage at '{path}': {reason}")]
    Open { path: String, reason: String },

    /// A read operation failed.
    #[error("failed to read key '{key}': {reason}")]
    Read { key: String, reason: String },

    /// A write operation failed.
    #[error("failed to write key '{key}': {reason}")]
    Write { key: String, reason: String },

    /// A delete operation failed.
    #[error("failed to delete key '{key}': {reason}")]
    Delete { key: String, reason: String },

    /// A prefix list operation failed.
    #[error("failed to list prefix '{prefix}': {reason}")]
    List { prefix: String, reason: String },
}
