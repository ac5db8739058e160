//! Domain error taxonomy for pool operations.

use crate::transport::TransportError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("invalid config: {0}")]
    ConfigInvalid(String),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("no remote has room for a {0}-byte chunk")]
    NoEligibleRemote(u64),

    #[error("temp space exhausted in {0}")]
    TempFull(String),

    #[error("no manifest found for {0}")]
    ManifestNotFound(String),

    #[error("manifest for {0} could not be saved to any remote")]
    ManifestSaveFailed(String),

    #[error("manifest corrupt: {0}")]
    ManifestCorrupt(String),

    #[error("chunk {index} of {file_path} is missing")]
    ChunkMissing { file_path: String, index: u32 },

    #[error("{0} already exists")]
    AlreadyExists(String),

    #[error("{new} collides with {existing} (same chunk or manifest name)")]
    NameCollision { new: String, existing: String },

    #[error("chunk size must be positive")]
    InvalidChunkSize,

    #[error("upload of {file_path} failed: {reason}")]
    UploadFailed { file_path: String, reason: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl PoolError {
    /// Map an io error on the temp dir to the dedicated kind; every other
    /// io failure stays an io error.
    pub fn from_temp_io(err: std::io::Error, temp_dir: &std::path::Path) -> Self {
        match err.kind() {
            std::io::ErrorKind::StorageFull | std::io::ErrorKind::QuotaExceeded => {
                PoolError::TempFull(temp_dir.display().to_string())
            }
            _ => PoolError::Io(err),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, PoolError::ManifestNotFound(_))
    }
}
