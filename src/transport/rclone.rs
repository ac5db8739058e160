//! rclone subprocess adapter.
//!
//! One `rclone` invocation per operation; retries with exponential backoff
//! and jitter are layered here so callers only ever see the final error.

use super::{RemoteSpace, Transport, TransportError};
use crate::config::Config;
use async_trait::async_trait;
use rand::Rng;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::process::Output;
use std::time::Duration;
use tokio::process::Command;

// rclone reserves these exit codes for missing directories/objects.
const EXIT_DIR_NOT_FOUND: i32 = 3;
const EXIT_FILE_NOT_FOUND: i32 = 4;

const MAX_STDERR: usize = 500;

pub struct RcloneTransport {
    binary: String,
    flags: Vec<String>,
    temp_dir: PathBuf,
    timeout: Duration,
    max_retries: u32,
    retry_delay: f64,
}

impl RcloneTransport {
    pub fn new(config: &Config) -> Self {
        Self {
            binary: config.rclone_binary.clone(),
            flags: config.rclone_flags.clone(),
            temp_dir: config.temp_dir.clone(),
            timeout: Duration::from_secs(config.transport_timeout),
            max_retries: config.max_retries,
            retry_delay: config.retry_delay,
        }
    }

    async fn run_once(&self, args: &[&str]) -> Result<Output, TransportError> {
        log::debug!("running: {} {}", self.binary, args.join(" "));
        let child = Command::new(&self.binary)
            .args(args)
            .kill_on_drop(true)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
            .map_err(TransportError::Spawn)?;

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| TransportError::Timeout(self.timeout.as_secs()))?
            .map_err(TransportError::Io)?;

        if output.status.success() {
            return Ok(output);
        }
        let code = output.status.code().unwrap_or(-1);
        let stderr: String = String::from_utf8_lossy(&output.stderr)
            .trim()
            .chars()
            .take(MAX_STDERR)
            .collect();
        log::warn!("rclone exited with code {code}: {stderr}");
        Err(TransportError::Failed { code, stderr })
    }

    /// Timeouts and nonzero exits are worth another attempt; a missing
    /// object or a spawn failure is not going to improve.
    fn retry_eligible(err: &TransportError) -> bool {
        match err {
            TransportError::Failed { code, .. } => {
                *code != EXIT_DIR_NOT_FOUND && *code != EXIT_FILE_NOT_FOUND
            }
            TransportError::Timeout(_) => true,
            _ => false,
        }
    }

    async fn run(&self, args: &[&str]) -> Result<Output, TransportError> {
        let mut attempt = 0u32;
        loop {
            match self.run_once(args).await {
                Ok(output) => return Ok(output),
                Err(err) if Self::retry_eligible(&err) && attempt < self.max_retries => {
                    let backoff = self.retry_delay * f64::powi(2.0, attempt as i32);
                    let jitter = rand::rng().random_range(0.0..=self.retry_delay.max(0.001));
                    let delay = Duration::from_secs_f64(backoff + jitter);
                    attempt += 1;
                    log::warn!(
                        "transport call failed (attempt {attempt}/{}), retrying in {:.1}s: {err}",
                        self.max_retries + 1,
                        delay.as_secs_f64()
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Run with the configured passthrough flags appended.
    async fn run_flagged(&self, args: &[&str]) -> Result<Output, TransportError> {
        let mut full: Vec<&str> = args.to_vec();
        full.extend(self.flags.iter().map(String::as_str));
        self.run(&full).await
    }

    fn scratch_path(&self, tag: &str) -> PathBuf {
        self.temp_dir
            .join(format!("{tag}_{}.tmp", uuid::Uuid::new_v4()))
    }

    fn not_found(err: TransportError, remote: &str, path: &str) -> TransportError {
        match err {
            TransportError::Failed { code, .. }
                if code == EXIT_DIR_NOT_FOUND || code == EXIT_FILE_NOT_FOUND =>
            {
                TransportError::NotFound {
                    remote: remote.to_string(),
                    path: path.to_string(),
                }
            }
            other => other,
        }
    }
}

#[derive(Deserialize)]
struct AboutInfo {
    used: Option<u64>,
    free: Option<u64>,
    total: Option<u64>,
}

#[derive(Deserialize)]
struct StatEntry {
    #[serde(rename = "Size")]
    size: i64,
}

#[async_trait]
impl Transport for RcloneTransport {
    async fn put(&self, local: &Path, remote: &str, path: &str) -> Result<(), TransportError> {
        let local = local.to_string_lossy();
        let dest = format!("{remote}{path}");
        self.run_flagged(&["copyto", &local, &dest]).await?;
        Ok(())
    }

    async fn put_bytes(
        &self,
        data: &[u8],
        remote: &str,
        path: &str,
    ) -> Result<(), TransportError> {
        tokio::fs::create_dir_all(&self.temp_dir).await?;
        let scratch = self.scratch_path("put");
        tokio::fs::write(&scratch, data).await?;
        let result = self.put(&scratch, remote, path).await;
        let _ = tokio::fs::remove_file(&scratch).await;
        result
    }

    async fn get(&self, remote: &str, path: &str, local: &Path) -> Result<(), TransportError> {
        let src = format!("{remote}{path}");
        let local = local.to_string_lossy();
        self.run_flagged(&["copyto", &src, &local])
            .await
            .map_err(|e| Self::not_found(e, remote, path))?;
        Ok(())
    }

    async fn get_bytes(&self, remote: &str, path: &str) -> Result<Vec<u8>, TransportError> {
        tokio::fs::create_dir_all(&self.temp_dir).await?;
        let scratch = self.scratch_path("get");
        let result = match self.get(remote, path, &scratch).await {
            Ok(()) => tokio::fs::read(&scratch).await.map_err(TransportError::Io),
            Err(e) => Err(e),
        };
        let _ = tokio::fs::remove_file(&scratch).await;
        result
    }

    async fn get_range(
        &self,
        remote: &str,
        path: &str,
        offset: u64,
        length: u64,
    ) -> Result<Vec<u8>, TransportError> {
        let src = format!("{remote}{path}");
        let offset = offset.to_string();
        let count = length.to_string();
        let output = self
            .run(&["cat", &src, "--offset", &offset, "--count", &count])
            .await
            .map_err(|e| Self::not_found(e, remote, path))?;
        Ok(output.stdout)
    }

    async fn delete(&self, remote: &str, path: &str) -> Result<(), TransportError> {
        let target = format!("{remote}{path}");
        self.run(&["deletefile", &target])
            .await
            .map_err(|e| Self::not_found(e, remote, path))?;
        Ok(())
    }

    async fn list_files(&self, remote: &str, prefix: &str) -> Result<Vec<String>, TransportError> {
        let target = format!("{remote}{prefix}");
        let output = match self.run(&["lsf", &target, "--files-only"]).await {
            Ok(output) => output,
            // An absent prefix just means nothing has been written yet.
            Err(e) => {
                return match Self::not_found(e, remote, prefix) {
                    TransportError::NotFound { .. } => Ok(Vec::new()),
                    other => Err(other),
                };
            }
        };
        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    async fn list_dirs(&self, remote: &str, prefix: &str) -> Result<Vec<String>, TransportError> {
        let target = format!("{remote}{prefix}");
        let output = match self.run(&["lsf", &target, "--dirs-only"]).await {
            Ok(output) => output,
            Err(e) => {
                return match Self::not_found(e, remote, prefix) {
                    TransportError::NotFound { .. } => Ok(Vec::new()),
                    other => Err(other),
                };
            }
        };
        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(stdout
            .lines()
            .map(|l| l.trim().trim_end_matches('/'))
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    async fn stat(&self, remote: &str, path: &str) -> Result<Option<u64>, TransportError> {
        let target = format!("{remote}{path}");
        let output = match self.run(&["lsjson", "--stat", &target]).await {
            Ok(output) => output,
            Err(e) => {
                return match Self::not_found(e, remote, path) {
                    TransportError::NotFound { .. } => Ok(None),
                    other => Err(other),
                };
            }
        };
        let entry: StatEntry = serde_json::from_slice(&output.stdout)
            .map_err(|e| TransportError::Io(std::io::Error::other(e)))?;
        Ok(u64::try_from(entry.size).ok())
    }

    async fn about(&self, remote: &str) -> Result<RemoteSpace, TransportError> {
        let output = self.run(&["about", remote, "--json"]).await?;
        let info: AboutInfo = serde_json::from_slice(&output.stdout)
            .map_err(|e| TransportError::Io(std::io::Error::other(e)))?;
        let used = info.used.unwrap_or(0);
        let mut total = info.total.unwrap_or(0);
        // Some remotes report only used+free.
        if total == 0 {
            total = used + info.free.unwrap_or(0);
        }
        // A remote that reports nothing about free space is still eligible.
        let free = info
            .free
            .or_else(|| total.checked_sub(used).filter(|_| total > 0))
            .unwrap_or(u64::MAX);
        Ok(RemoteSpace { used, free, total })
    }

    async fn exists(&self, remote: &str) -> Result<bool, TransportError> {
        Ok(self.run_once(&["lsd", remote]).await.is_ok())
    }
}
