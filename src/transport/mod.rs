//! Storage transport abstraction: byte movement against named remotes.
//!
//! The pool never talks to a remote directly; everything goes through this
//! trait so the rclone subprocess adapter and the local-directory test
//! backend are interchangeable.

pub mod localdir;
pub mod rclone;

use async_trait::async_trait;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("rclone exited with code {code}: {stderr}")]
    Failed { code: i32, stderr: String },

    #[error("transport call timed out after {0}s")]
    Timeout(u64),

    #[error("could not spawn transport: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("object not found: {remote}{path}")]
    NotFound { remote: String, path: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Space usage as reported by a remote.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RemoteSpace {
    pub used: u64,
    pub free: u64,
    pub total: u64,
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn put(&self, local: &Path, remote: &str, path: &str) -> Result<(), TransportError>;

    async fn put_bytes(&self, data: &[u8], remote: &str, path: &str)
    -> Result<(), TransportError>;

    async fn get(&self, remote: &str, path: &str, local: &Path) -> Result<(), TransportError>;

    async fn get_bytes(&self, remote: &str, path: &str) -> Result<Vec<u8>, TransportError>;

    /// Fetch `length` bytes starting at `offset` within the object.
    async fn get_range(
        &self,
        remote: &str,
        path: &str,
        offset: u64,
        length: u64,
    ) -> Result<Vec<u8>, TransportError>;

    async fn delete(&self, remote: &str, path: &str) -> Result<(), TransportError>;

    /// File names (not paths) directly under `prefix`.
    async fn list_files(&self, remote: &str, prefix: &str) -> Result<Vec<String>, TransportError>;

    async fn list_dirs(&self, remote: &str, prefix: &str) -> Result<Vec<String>, TransportError>;

    /// Object size, or None when the object does not exist.
    async fn stat(&self, remote: &str, path: &str) -> Result<Option<u64>, TransportError>;

    async fn about(&self, remote: &str) -> Result<RemoteSpace, TransportError>;

    /// Whether the remote is configured and reachable at all.
    async fn exists(&self, remote: &str) -> Result<bool, TransportError>;
}
