//! Pool configuration, loaded from a JSON file.
//!
//! Every field has a default so a partial config file is enough; unknown
//! keys are ignored for forward compatibility.

use crate::balance::Strategy;
use crate::error::PoolError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DEFAULT_CHUNK_SIZE: u64 = 104_857_600; // 100 MiB

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Base remote names, each with a trailing colon (e.g. "mega1:").
    pub remotes: Vec<String>,
    /// Crypt-wrapped remotes; used in place of `remotes` when `use_crypt`
    /// is on and the list is non-empty.
    pub crypt_remotes: Vec<String>,
    pub use_crypt: bool,
    pub chunk_size: u64,
    pub data_prefix: String,
    pub manifest_prefix: String,
    /// Scratch space for chunk spooling. /dev/shm keeps it in RAM.
    pub temp_dir: PathBuf,
    pub rclone_binary: String,
    pub rclone_flags: Vec<String>,
    pub webdav_host: String,
    pub webdav_port: u16,
    pub max_parallel_workers: usize,
    pub max_retries: u32,
    /// Base retry delay in seconds; backoff doubles it per attempt.
    pub retry_delay: f64,
    pub balancing_strategy: Strategy,
    /// Per-invocation transport timeout in seconds.
    pub transport_timeout: u64,
    /// Directory for the persistent manifest cache; empty disables it.
    pub manifest_cache_dir: Option<PathBuf>,
    /// Whether PUT/upload may replace an existing file.
    pub allow_overwrite: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            remotes: Vec::new(),
            crypt_remotes: Vec::new(),
            use_crypt: true,
            chunk_size: DEFAULT_CHUNK_SIZE,
            data_prefix: "rclonepool_data".to_string(),
            manifest_prefix: "rclonepool_manifests".to_string(),
            temp_dir: PathBuf::from("/dev/shm/rclonepool"),
            rclone_binary: "rclone".to_string(),
            rclone_flags: vec!["--fast-list".to_string(), "--no-traverse".to_string()],
            webdav_host: "0.0.0.0".to_string(),
            webdav_port: 8080,
            max_parallel_workers: 4,
            max_retries: 3,
            retry_delay: 1.0,
            balancing_strategy: Strategy::LeastUsed,
            transport_timeout: 600,
            manifest_cache_dir: default_cache_dir(),
            allow_overwrite: true,
        }
    }
}

fn default_cache_dir() -> Option<PathBuf> {
    dirs::cache_dir().map(|d| d.join("rclonepool"))
}

pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("rclonepool")
        .join("config.json")
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, PoolError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| PoolError::ConfigInvalid(format!("{}: {e}", path.display())))?;
        let config: Config = serde_json::from_str(&raw)
            .map_err(|e| PoolError::ConfigInvalid(format!("{}: {e}", path.display())))?;
        config.validate()?;
        log::info!("loaded config from {}", path.display());
        Ok(config)
    }

    /// Load the config, falling back to defaults when the file is absent.
    pub fn load_or_default(path: &Path) -> Result<Self, PoolError> {
        if path.exists() {
            Self::load(path)
        } else {
            log::warn!(
                "no config found at {}, using defaults (run `rclonepool init`)",
                path.display()
            );
            Ok(Config::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), PoolError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| PoolError::ConfigInvalid(format!("{}: {e}", parent.display())))?;
        }
        let raw = serde_json::to_string_pretty(self)
            .map_err(|e| PoolError::ConfigInvalid(e.to_string()))?;
        std::fs::write(path, raw)
            .map_err(|e| PoolError::ConfigInvalid(format!("{}: {e}", path.display())))?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), PoolError> {
        if self.chunk_size == 0 {
            return Err(PoolError::ConfigInvalid("chunk_size must be positive".into()));
        }
        if self.max_parallel_workers == 0 {
            return Err(PoolError::ConfigInvalid(
                "max_parallel_workers must be at least 1".into(),
            ));
        }
        if self.retry_delay < 0.0 {
            return Err(PoolError::ConfigInvalid("retry_delay must be non-negative".into()));
        }
        for remote in self.effective_remotes() {
            if !remote.ends_with(':') {
                return Err(PoolError::ConfigInvalid(format!(
                    "remote {remote:?} must end with ':'"
                )));
            }
        }
        Ok(())
    }

    /// The remote set actually used for placement: crypt remotes when
    /// encryption is enabled and configured, base remotes otherwise.
    pub fn effective_remotes(&self) -> &[String] {
        if self.use_crypt && !self.crypt_remotes.is_empty() {
            &self.crypt_remotes
        } else {
            &self.remotes
        }
    }
}
