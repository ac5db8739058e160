//! Chunk verification, repair from a local copy, and orphan scanning.

use super::Pool;
use crate::error::PoolError;
use crate::manifest::normalize_path;
use crate::transport::TransportError;
use std::collections::HashSet;
use std::io::SeekFrom;
use std::path::Path;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyMode {
    /// Presence (and size where the remote reports one).
    Quick,
    /// Additionally fetch every chunk and compare its length.
    Full,
}

#[derive(Debug, Clone)]
pub struct VerifyReport {
    pub file_path: String,
    pub total_chunks: usize,
    pub missing: Vec<u32>,
    pub wrong_size: Vec<u32>,
}

impl VerifyReport {
    pub fn ok(&self) -> bool {
        self.missing.is_empty() && self.wrong_size.is_empty()
    }

    /// Chunk indexes that repair should rewrite.
    pub fn damaged(&self) -> Vec<u32> {
        let mut all: Vec<u32> = self
            .missing
            .iter()
            .chain(self.wrong_size.iter())
            .copied()
            .collect();
        all.sort_unstable();
        all.dedup();
        all
    }
}

#[derive(Debug)]
pub struct RepairOutcome {
    pub repaired: Vec<u32>,
    pub still_damaged: Vec<u32>,
}

#[derive(Debug, Clone)]
pub struct OrphanChunk {
    pub remote: String,
    pub path: String,
}

impl Pool {
    pub async fn verify(&self, file_path: &str, mode: VerifyMode) -> Result<VerifyReport, PoolError> {
        let manifest = self.manifests.load(file_path).await?;
        log::info!("verifying {} ({} chunks)", manifest.file_path, manifest.chunk_count);

        let mut report = VerifyReport {
            file_path: manifest.file_path.clone(),
            total_chunks: manifest.chunk_count,
            missing: Vec::new(),
            wrong_size: Vec::new(),
        };
        for chunk in &manifest.chunks {
            match mode {
                VerifyMode::Quick => match self.transport.stat(&chunk.remote, &chunk.path).await {
                    Ok(None) => report.missing.push(chunk.index),
                    Ok(Some(size)) if size != chunk.size => report.wrong_size.push(chunk.index),
                    Ok(Some(_)) => {}
                    Err(e) => {
                        log::warn!("could not stat {}{}: {e}", chunk.remote, chunk.path);
                        report.missing.push(chunk.index);
                    }
                },
                VerifyMode::Full => match self.transport.get_bytes(&chunk.remote, &chunk.path).await
                {
                    Ok(data) if data.len() as u64 == chunk.size => {}
                    Ok(_) => report.wrong_size.push(chunk.index),
                    Err(TransportError::NotFound { .. }) => report.missing.push(chunk.index),
                    Err(e) => {
                        log::warn!("could not fetch {}{}: {e}", chunk.remote, chunk.path);
                        report.missing.push(chunk.index);
                    }
                },
            }
        }
        if report.ok() {
            log::info!("  all {} chunks present", report.total_chunks);
        } else {
            log::warn!(
                "  {} missing, {} wrong-size",
                report.missing.len(),
                report.wrong_size.len()
            );
        }
        Ok(report)
    }

    pub async fn verify_all(&self, mode: VerifyMode) -> Result<Vec<VerifyReport>, PoolError> {
        let manifests = self.manifests.list("/", true).await?;
        let mut reports = Vec::with_capacity(manifests.len());
        for manifest in manifests {
            reports.push(self.verify(&manifest.file_path, mode).await?);
        }
        Ok(reports)
    }

    /// Re-upload damaged chunks from a local copy of the file, placing each
    /// on a freshly picked remote and rewriting its descriptor. The updated
    /// manifest is re-saved everywhere; if no remote acks, the in-memory
    /// manifest reverts and the new copies are dropped.
    pub async fn repair(&self, file_path: &str, local: &Path) -> Result<RepairOutcome, PoolError> {
        let file_path = normalize_path(file_path);
        let _guard = self.lock_path(&file_path).await;

        let report = self.verify(&file_path, VerifyMode::Quick).await?;
        let damaged = report.damaged();
        if damaged.is_empty() {
            log::info!("{file_path} is intact, nothing to repair");
            return Ok(RepairOutcome {
                repaired: Vec::new(),
                still_damaged: Vec::new(),
            });
        }

        let original = self.manifests.load(&file_path).await?;
        let local_size = tokio::fs::metadata(local).await?.len();
        if local_size != original.file_size {
            return Err(PoolError::UploadFailed {
                file_path,
                reason: format!(
                    "local source is {local_size} bytes, manifest says {}",
                    original.file_size
                ),
            });
        }

        log::info!("repairing {} chunks of {file_path}", damaged.len());
        let mut manifest = original.clone();
        let mut file = tokio::fs::File::open(local).await?;
        let mut placed: Vec<(String, String, u64)> = Vec::new();

        for index in &damaged {
            let chunk = &mut manifest.chunks[*index as usize];
            let mut data = vec![0u8; chunk.size as usize];
            file.seek(SeekFrom::Start(chunk.offset)).await?;
            file.read_exact(&mut data).await?;

            let remote = match self.balancer.reserve(chunk.size).await {
                Ok(remote) => remote,
                Err(e) => {
                    self.undo_placements(&placed).await;
                    return Err(e);
                }
            };
            if let Err(e) = self.transport.put_bytes(&data, &remote, &chunk.path).await {
                self.balancer.record(&remote, -(chunk.size as i64)).await;
                self.undo_placements(&placed).await;
                return Err(e.into());
            }
            log::info!("  chunk {} -> {remote}", chunk.index);
            let stale = chunk.remote.clone();
            chunk.remote = remote.clone();
            placed.push((remote.clone(), chunk.path.clone(), chunk.size));
            // Drop the broken copy when it lived somewhere else.
            if stale != remote {
                match self.transport.delete(&stale, &chunk.path).await {
                    Ok(()) | Err(TransportError::NotFound { .. }) => {}
                    Err(e) => log::warn!("stale copy on {stale} not deleted: {e}"),
                }
            }
        }

        if let Err(e) = self.manifests.save(&manifest).await {
            self.manifests.insert_cached(original).await;
            self.undo_placements(&placed).await;
            return Err(e);
        }

        let after = self.verify(&file_path, VerifyMode::Quick).await?;
        Ok(RepairOutcome {
            repaired: damaged
                .iter()
                .filter(|i| !after.damaged().contains(i))
                .copied()
                .collect(),
            still_damaged: after.damaged(),
        })
    }

    async fn undo_placements(&self, placed: &[(String, String, u64)]) {
        for (remote, path, size) in placed {
            let _ = self.transport.delete(remote, path).await;
            self.balancer.record(remote, -(*size as i64)).await;
        }
    }

    /// Chunks sitting in the data prefix of any remote that no manifest
    /// references.
    pub async fn orphans(&self) -> Result<Vec<OrphanChunk>, PoolError> {
        let manifests = self.manifests.list("/", true).await?;
        let referenced: HashSet<(String, String)> = manifests
            .iter()
            .flat_map(|m| m.chunks.iter().map(|c| (c.remote.clone(), c.path.clone())))
            .collect();
        log::info!(
            "{} chunks referenced by {} manifests",
            referenced.len(),
            manifests.len()
        );

        let mut orphans = Vec::new();
        for remote in &self.remotes {
            let names = match self
                .transport
                .list_files(remote, &self.config.data_prefix)
                .await
            {
                Ok(names) => names,
                Err(e) => {
                    log::warn!("could not scan {remote}: {e}");
                    continue;
                }
            };
            for name in names {
                let path = format!("{}/{name}", self.config.data_prefix);
                if !referenced.contains(&(remote.clone(), path.clone())) {
                    log::warn!("orphan chunk {remote}{path}");
                    orphans.push(OrphanChunk {
                        remote: remote.clone(),
                        path,
                    });
                }
            }
        }
        Ok(orphans)
    }

    /// Returns how many orphans were actually removed.
    pub async fn delete_orphans(&self, orphans: &[OrphanChunk]) -> usize {
        let mut deleted = 0;
        for orphan in orphans {
            match self.transport.delete(&orphan.remote, &orphan.path).await {
                Ok(()) => deleted += 1,
                Err(e) => log::error!("could not delete {}{}: {e}", orphan.remote, orphan.path),
            }
        }
        deleted
    }
}
