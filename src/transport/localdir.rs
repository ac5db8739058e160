//! Local-directory transport: each remote maps to a subdirectory of a
//! common root. Backs the test suite and local smoke runs; no subprocess,
//! no network.

use super::{RemoteSpace, Transport, TransportError};
use async_trait::async_trait;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

const DEFAULT_TOTAL: u64 = 1 << 40; // pretend each remote holds 1 TiB

pub struct LocalDirTransport {
    root: PathBuf,
    total: u64,
}

impl LocalDirTransport {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            total: DEFAULT_TOTAL,
        }
    }

    /// Override the advertised capacity (used to exercise balancer
    /// eligibility in tests).
    pub fn with_total<P: AsRef<Path>>(root: P, total: u64) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            total,
        }
    }

    fn remote_root(&self, remote: &str) -> PathBuf {
        self.root.join(remote.trim_end_matches(':'))
    }

    fn object_path(&self, remote: &str, path: &str) -> PathBuf {
        self.remote_root(remote).join(path)
    }

    fn missing(remote: &str, path: &str) -> TransportError {
        TransportError::NotFound {
            remote: remote.to_string(),
            path: path.to_string(),
        }
    }

    async fn dir_size(dir: &Path) -> std::io::Result<u64> {
        let mut pending = vec![dir.to_path_buf()];
        let mut size = 0u64;
        while let Some(dir) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e),
            };
            while let Some(entry) = entries.next_entry().await? {
                let meta = entry.metadata().await?;
                if meta.is_dir() {
                    pending.push(entry.path());
                } else {
                    size += meta.len();
                }
            }
        }
        Ok(size)
    }
}

#[async_trait]
impl Transport for LocalDirTransport {
    async fn put(&self, local: &Path, remote: &str, path: &str) -> Result<(), TransportError> {
        let data = fs::read(local).await?;
        self.put_bytes(&data, remote, path).await
    }

    async fn put_bytes(
        &self,
        data: &[u8],
        remote: &str,
        path: &str,
    ) -> Result<(), TransportError> {
        let dest = self.object_path(remote, path);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(dest, data).await?;
        Ok(())
    }

    async fn get(&self, remote: &str, path: &str, local: &Path) -> Result<(), TransportError> {
        let data = self.get_bytes(remote, path).await?;
        fs::write(local, data).await?;
        Ok(())
    }

    async fn get_bytes(&self, remote: &str, path: &str) -> Result<Vec<u8>, TransportError> {
        match fs::read(self.object_path(remote, path)).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(Self::missing(remote, path)),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_range(
        &self,
        remote: &str,
        path: &str,
        offset: u64,
        length: u64,
    ) -> Result<Vec<u8>, TransportError> {
        let mut file = match fs::File::open(self.object_path(remote, path)).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Self::missing(remote, path));
            }
            Err(e) => return Err(e.into()),
        };
        let size = file.metadata().await?.len();
        let offset = offset.min(size);
        let take = length.min(size - offset);
        file.seek(SeekFrom::Start(offset)).await?;
        let mut buf = vec![0u8; take as usize];
        file.read_exact(&mut buf).await?;
        Ok(buf)
    }

    async fn delete(&self, remote: &str, path: &str) -> Result<(), TransportError> {
        match fs::remove_file(self.object_path(remote, path)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(Self::missing(remote, path)),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_files(&self, remote: &str, prefix: &str) -> Result<Vec<String>, TransportError> {
        let dir = self.object_path(remote, prefix);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if entry.metadata().await?.is_file() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();
        Ok(names)
    }

    async fn list_dirs(&self, remote: &str, prefix: &str) -> Result<Vec<String>, TransportError> {
        let dir = self.object_path(remote, prefix);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if entry.metadata().await?.is_dir() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();
        Ok(names)
    }

    async fn stat(&self, remote: &str, path: &str) -> Result<Option<u64>, TransportError> {
        match fs::metadata(self.object_path(remote, path)).await {
            Ok(meta) => Ok(Some(meta.len())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn about(&self, remote: &str) -> Result<RemoteSpace, TransportError> {
        let used = Self::dir_size(&self.remote_root(remote)).await?;
        Ok(RemoteSpace {
            used,
            free: self.total.saturating_sub(used),
            total: self.total,
        })
    }

    async fn exists(&self, _remote: &str) -> Result<bool, TransportError> {
        Ok(true)
    }
}
