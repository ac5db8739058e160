//! Pool orchestration: chunked upload, range-aware download, listing,
//! delete, rename and status across all configured remotes.

pub mod verify;

use crate::balance::{Balancer, UsageView};
use crate::chunk::{self, plan_chunks};
use crate::config::Config;
use crate::error::PoolError;
use crate::manifest::store::ManifestStore;
use crate::manifest::{
    ChunkDescriptor, Manifest, chunk_object_name, normalize_path, sanitize, split_path,
};
use crate::transport::{Transport, TransportError};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex, OwnedMutexGuard, Semaphore};

#[derive(Debug, Clone)]
pub struct FileSummary {
    pub file_path: String,
    pub file_size: u64,
    pub chunk_count: usize,
    pub remotes: Vec<String>,
}

impl From<&Manifest> for FileSummary {
    fn from(m: &Manifest) -> Self {
        FileSummary {
            file_path: m.file_path.clone(),
            file_size: m.file_size,
            chunk_count: m.chunk_count,
            remotes: m.remotes(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DirListing {
    pub files: Vec<Manifest>,
    pub subdirs: Vec<String>,
}

#[derive(Debug)]
pub struct UploadOutcome {
    pub manifest: Manifest,
    pub replaced: bool,
}

#[derive(Debug, Default)]
pub struct DeleteOutcome {
    pub chunks_deleted: usize,
    pub chunks_failed: usize,
}

pub struct Pool {
    config: Arc<Config>,
    transport: Arc<dyn Transport>,
    manifests: Arc<ManifestStore>,
    balancer: Arc<Balancer>,
    remotes: Vec<String>,
    /// One mutex per file path; writers on the same path serialize,
    /// readers never touch these.
    path_locks: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
    io_slots: Arc<Semaphore>,
}

impl Pool {
    pub async fn new(config: Config, transport: Arc<dyn Transport>) -> Result<Self, PoolError> {
        config.validate()?;
        let remotes = config.effective_remotes().to_vec();
        if remotes.is_empty() {
            return Err(PoolError::ConfigInvalid(
                "no remotes configured (run `rclonepool init`)".into(),
            ));
        }
        let manifests = Arc::new(ManifestStore::new(
            transport.clone(),
            remotes.clone(),
            config.manifest_prefix.clone(),
            config.manifest_cache_dir.clone(),
        ));
        let balancer = Arc::new(Balancer::new(remotes.clone(), config.balancing_strategy));
        balancer.seed(transport.as_ref()).await;
        Ok(Self {
            io_slots: Arc::new(Semaphore::new(config.max_parallel_workers)),
            config: Arc::new(config),
            transport,
            manifests,
            balancer,
            remotes,
            path_locks: StdMutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn manifests(&self) -> &Arc<ManifestStore> {
        &self.manifests
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn remotes(&self) -> &[String] {
        &self.remotes
    }

    async fn lock_path(&self, file_path: &str) -> OwnedMutexGuard<()> {
        let mutex = {
            let mut locks = self.path_locks.lock().unwrap();
            locks.entry(file_path.to_string()).or_default().clone()
        };
        mutex.lock_owned().await
    }

    fn chunk_remote_path(&self, file_name: &str, index: u32) -> String {
        format!(
            "{}/{}",
            self.config.data_prefix,
            chunk_object_name(file_name, index)
        )
    }

    fn map_put_error(&self, err: TransportError) -> PoolError {
        match err {
            TransportError::Io(io)
                if matches!(
                    io.kind(),
                    std::io::ErrorKind::StorageFull | std::io::ErrorKind::QuotaExceeded
                ) =>
            {
                PoolError::TempFull(self.config.temp_dir.display().to_string())
            }
            other => PoolError::Transport(other),
        }
    }

    /// Upload a local file, splitting it into chunks spread across remotes
    /// and replicating the manifest everywhere. Either the whole upload
    /// lands or every uploaded chunk is rolled back.
    pub async fn upload(&self, local: &Path, file_path: &str) -> Result<UploadOutcome, PoolError> {
        let file_path = normalize_path(file_path);
        let _guard = self.lock_path(&file_path).await;

        let file_size = tokio::fs::metadata(local).await?.len();
        let (_, file_name) = split_path(&file_path);

        let previous = match self.manifests.load(&file_path).await {
            Ok(m) if m.file_path != file_path => {
                // A different path flattens to the same manifest name.
                return Err(PoolError::NameCollision {
                    new: file_path,
                    existing: m.file_path,
                });
            }
            Ok(m) => Some(m),
            Err(PoolError::ManifestNotFound(_)) => None,
            Err(e) => return Err(e),
        };
        if previous.is_some() && !self.config.allow_overwrite {
            return Err(PoolError::AlreadyExists(file_path));
        }
        self.check_name_collision(&file_path, &file_name).await?;

        log::info!("uploading {} ({file_size} bytes) -> {file_path}", local.display());
        let chunk_size = self.config.chunk_size;
        let windows = plan_chunks(file_size, chunk_size)?;

        let mut file = tokio::fs::File::open(local).await?;
        let mut buf = vec![0u8; chunk_size.min(file_size).max(1) as usize];
        let mut uploaded: Vec<ChunkDescriptor> = Vec::with_capacity(windows.len());

        for window in windows {
            let data = &mut buf[..window.len as usize];
            if let Err(e) = file.read_exact(data).await {
                self.rollback_chunks(&uploaded).await;
                return Err(PoolError::Io(e));
            }

            let remote = match self.balancer.reserve(window.len).await {
                Ok(remote) => remote,
                Err(e) => {
                    self.rollback_chunks(&uploaded).await;
                    return Err(e);
                }
            };
            let chunk_path = self.chunk_remote_path(&file_name, window.index);
            log::info!(
                "  chunk {}: {} bytes -> {remote}",
                window.index,
                window.len
            );
            if let Err(e) = self.transport.put_bytes(data, &remote, &chunk_path).await {
                self.balancer.record(&remote, -(window.len as i64)).await;
                self.rollback_chunks(&uploaded).await;
                let mapped = self.map_put_error(e);
                if matches!(mapped, PoolError::TempFull(_)) {
                    return Err(mapped);
                }
                return Err(PoolError::UploadFailed {
                    file_path,
                    reason: mapped.to_string(),
                });
            }
            uploaded.push(ChunkDescriptor {
                index: window.index,
                remote,
                path: chunk_path,
                size: window.len,
                offset: window.offset,
            });
        }

        let manifest = Manifest::new(&file_path, file_size, chunk_size, uploaded)?;
        if let Err(e) = self.manifests.save(&manifest).await {
            self.rollback_chunks(&manifest.chunks).await;
            return Err(e);
        }

        if let Some(old) = &previous {
            self.remove_stale_chunks(old, &manifest).await;
        }
        log::info!(
            "  upload complete: {} chunks across {} remotes",
            manifest.chunk_count,
            manifest.remotes().len()
        );
        Ok(UploadOutcome {
            manifest,
            replaced: previous.is_some(),
        })
    }

    /// Refuse an upload whose chunk object names are already claimed by a
    /// different file (same base name in another directory). Checked
    /// against the in-memory index, which is as much as one process can
    /// know without a full remote sweep.
    async fn check_name_collision(&self, file_path: &str, file_name: &str) -> Result<(), PoolError> {
        let sanitized = sanitize(file_path);
        for manifest in self.manifests.cached().await {
            if manifest.file_path == file_path {
                continue;
            }
            if manifest.file_name == file_name || sanitize(&manifest.file_path) == sanitized {
                return Err(PoolError::NameCollision {
                    new: file_path.to_string(),
                    existing: manifest.file_path,
                });
            }
        }
        Ok(())
    }

    async fn rollback_chunks(&self, chunks: &[ChunkDescriptor]) {
        for chunk in chunks {
            if let Err(e) = self.transport.delete(&chunk.remote, &chunk.path).await {
                log::warn!("rollback could not delete {}{}: {e}", chunk.remote, chunk.path);
            }
            self.balancer.record(&chunk.remote, -(chunk.size as i64)).await;
        }
    }

    /// After an overwrite, drop chunks of the old manifest that the new one
    /// no longer references.
    async fn remove_stale_chunks(&self, old: &Manifest, new: &Manifest) {
        let live: HashSet<(&str, &str)> = new
            .chunks
            .iter()
            .map(|c| (c.remote.as_str(), c.path.as_str()))
            .collect();
        for chunk in &old.chunks {
            if live.contains(&(chunk.remote.as_str(), chunk.path.as_str())) {
                continue;
            }
            match self.transport.delete(&chunk.remote, &chunk.path).await {
                Ok(()) => self.balancer.record(&chunk.remote, -(chunk.size as i64)).await,
                Err(TransportError::NotFound { .. }) => {}
                Err(e) => {
                    log::warn!("stale chunk {}{} not deleted: {e}", chunk.remote, chunk.path);
                }
            }
        }
    }

    /// Stream the whole file, chunk by chunk, into `dest`. Partial output
    /// may have been written when this returns an error.
    pub async fn download<W>(&self, file_path: &str, dest: &mut W) -> Result<u64, PoolError>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let manifest = self.manifests.load(file_path).await?;
        log::info!(
            "downloading {} ({} bytes, {} chunks)",
            manifest.file_path,
            manifest.file_size,
            manifest.chunk_count
        );
        let mut written = 0u64;
        for chunk in &manifest.chunks {
            let data = self
                .transport
                .get_bytes(&chunk.remote, &chunk.path)
                .await
                .map_err(|e| chunk_fetch_error(e, &manifest.file_path, chunk.index))?;
            if data.len() as u64 != chunk.size {
                return Err(PoolError::ChunkMissing {
                    file_path: manifest.file_path.clone(),
                    index: chunk.index,
                });
            }
            dest.write_all(&data).await?;
            written += data.len() as u64;
        }
        dest.flush().await?;
        Ok(written)
    }

    pub async fn download_to_file(&self, file_path: &str, local: &Path) -> Result<u64, PoolError> {
        let mut dest = tokio::fs::File::create(local).await?;
        self.download(file_path, &mut dest).await
    }

    /// Fetch `[start, start+length)` of the file. The length is clamped to
    /// end-of-file; a range starting at or past the end yields empty bytes.
    /// Partial chunk fetches run concurrently (bounded by the worker limit)
    /// but the result is assembled in cursor order.
    pub async fn download_range(
        &self,
        file_path: &str,
        start: u64,
        length: u64,
    ) -> Result<Vec<u8>, PoolError> {
        let manifest = self.manifests.load(file_path).await?;
        self.download_range_of(&manifest, start, length).await
    }

    pub async fn download_range_of(
        &self,
        manifest: &Manifest,
        start: u64,
        length: u64,
    ) -> Result<Vec<u8>, PoolError> {
        if start >= manifest.file_size {
            return Ok(Vec::new());
        }
        let length = length.min(manifest.file_size - start);
        if length == 0 {
            return Ok(Vec::new());
        }

        let spans = chunk::split_range(&manifest.chunks, start, length);
        let fetches = spans.iter().map(|span| {
            let chunk = &manifest.chunks[span.chunk_index];
            let transport = self.transport.clone();
            let slots = self.io_slots.clone();
            let remote = chunk.remote.clone();
            let path = chunk.path.clone();
            let file_path = manifest.file_path.clone();
            let index = chunk.index;
            let (skip, take) = (span.skip, span.take);
            async move {
                let _slot = slots.acquire_owned().await.expect("semaphore closed");
                let data = transport
                    .get_range(&remote, &path, skip, take)
                    .await
                    .map_err(|e| chunk_fetch_error(e, &file_path, index))?;
                if data.len() as u64 != take {
                    return Err(PoolError::ChunkMissing { file_path, index });
                }
                Ok::<Vec<u8>, PoolError>(data)
            }
        });
        let parts = futures::future::try_join_all(fetches).await?;

        let mut out = Vec::with_capacity(length as usize);
        for part in parts {
            out.extend_from_slice(&part);
        }
        Ok(out)
    }

    pub async fn load_manifest(&self, file_path: &str) -> Result<Manifest, PoolError> {
        self.manifests.load(file_path).await
    }

    pub async fn list(&self, dir: &str) -> Result<Vec<FileSummary>, PoolError> {
        let manifests = self.manifests.list(dir, false).await?;
        Ok(manifests.iter().map(FileSummary::from).collect())
    }

    /// Files directly in `dir` plus the immediate subdirectories implied by
    /// deeper paths. Directories are virtual; they exist exactly when some
    /// file path passes through them.
    pub async fn browse(&self, dir: &str) -> Result<DirListing, PoolError> {
        let dir = normalize_path(dir);
        let manifests = self.manifests.list(&dir, true).await?;
        let prefix = if dir == "/" { String::new() } else { dir.clone() };

        let mut files = Vec::new();
        let mut subdirs = BTreeSet::new();
        for manifest in manifests {
            if manifest.remote_dir == dir {
                files.push(manifest);
                continue;
            }
            let below = &manifest.remote_dir[prefix.len()..];
            if let Some(first) = below.split('/').find(|s| !s.is_empty()) {
                subdirs.insert(first.to_string());
            }
        }
        Ok(DirListing {
            files,
            subdirs: subdirs.into_iter().collect(),
        })
    }

    /// Whether the path names a virtual directory (the root always does).
    pub async fn is_dir(&self, path: &str) -> Result<bool, PoolError> {
        let path = normalize_path(path);
        if path == "/" {
            return Ok(true);
        }
        let manifests = self.manifests.list(&path, true).await?;
        Ok(!manifests.is_empty())
    }

    /// Delete a file: chunks first (best effort), then the manifest.
    pub async fn delete(&self, file_path: &str) -> Result<DeleteOutcome, PoolError> {
        let file_path = normalize_path(file_path);
        let _guard = self.lock_path(&file_path).await;

        let manifest = self.manifests.load(&file_path).await?;
        log::info!("deleting {} ({} chunks)", file_path, manifest.chunk_count);

        let mut outcome = DeleteOutcome::default();
        for chunk in &manifest.chunks {
            match self.transport.delete(&chunk.remote, &chunk.path).await {
                Ok(()) | Err(TransportError::NotFound { .. }) => {
                    outcome.chunks_deleted += 1;
                    self.balancer.record(&chunk.remote, -(chunk.size as i64)).await;
                }
                Err(e) => {
                    log::warn!("could not delete {}{}: {e}", chunk.remote, chunk.path);
                    outcome.chunks_failed += 1;
                }
            }
        }
        self.manifests.delete(&file_path).await;
        Ok(outcome)
    }

    /// Rename by rewriting the manifest; chunks stay where they are.
    pub async fn rename(&self, src: &str, dst: &str) -> Result<(), PoolError> {
        let src = normalize_path(src);
        let dst = normalize_path(dst);
        if src == dst {
            return Ok(());
        }
        // Lock both paths in a fixed order so concurrent renames cannot
        // deadlock.
        let (first, second) = if src < dst { (&src, &dst) } else { (&dst, &src) };
        let _guard_a = self.lock_path(first).await;
        let _guard_b = self.lock_path(second).await;

        let manifest = self.manifests.load(&src).await?;
        match self.manifests.load(&dst).await {
            Ok(existing) if existing.file_path == dst => {
                return Err(PoolError::AlreadyExists(dst));
            }
            Ok(existing) => {
                return Err(PoolError::NameCollision {
                    new: dst,
                    existing: existing.file_path,
                });
            }
            Err(PoolError::ManifestNotFound(_)) => {}
            Err(e) => return Err(e),
        }

        let mut renamed = Manifest::new(&dst, manifest.file_size, manifest.chunk_size, manifest.chunks.clone())?;
        renamed.created_at = manifest.created_at;
        renamed.extra = manifest.extra.clone();
        self.manifests.save(&renamed).await?;
        self.manifests.delete(&src).await;
        log::info!("moved {src} -> {dst}");
        Ok(())
    }

    /// Per-remote space, freshly queried where possible and falling back to
    /// the balancer's cached view for unreachable remotes.
    pub async fn status(&self) -> Vec<UsageView> {
        for remote in &self.remotes {
            if let Ok(space) = self.transport.about(remote).await {
                self.balancer.set_space(remote, space).await;
            }
        }
        self.balancer.report().await
    }
}

fn chunk_fetch_error(err: TransportError, file_path: &str, index: u32) -> PoolError {
    match err {
        TransportError::NotFound { .. } => PoolError::ChunkMissing {
            file_path: file_path.to_string(),
            index,
        },
        other => PoolError::Transport(other),
    }
}
