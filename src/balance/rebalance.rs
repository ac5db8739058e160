//! Chunk migration to even out placement across remotes.
//!
//! A chunk move is atomic from the pool's perspective: the new copy is
//! written first, the manifest is re-saved everywhere, and only then is the
//! old copy deleted. Re-running after completion plans nothing.

use crate::error::PoolError;
use crate::manifest::store::ManifestStore;
use crate::transport::Transport;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct ChunkMove {
    pub file_path: String,
    pub chunk_index: u32,
    pub source: String,
    pub target: String,
    pub path: String,
    pub size: u64,
}

#[derive(Debug)]
pub struct BalanceAnalysis {
    /// Chunk count per remote, in configured order.
    pub counts: Vec<(String, usize)>,
    pub total_chunks: usize,
    /// `total_chunks / remote_count`; a remote above this is overloaded.
    pub ideal: usize,
}

#[derive(Debug, Default)]
pub struct RebalanceOutcome {
    pub moved: Vec<ChunkMove>,
    pub failed: usize,
}

pub struct Rebalancer {
    transport: Arc<dyn Transport>,
    store: Arc<ManifestStore>,
    remotes: Vec<String>,
}

impl Rebalancer {
    pub fn new(
        transport: Arc<dyn Transport>,
        store: Arc<ManifestStore>,
        remotes: Vec<String>,
    ) -> Self {
        Self {
            transport,
            store,
            remotes,
        }
    }

    pub async fn analyze(&self) -> Result<BalanceAnalysis, PoolError> {
        let manifests = self.store.list("/", true).await?;
        let mut counts: HashMap<&str, usize> =
            self.remotes.iter().map(|r| (r.as_str(), 0)).collect();
        let mut total = 0usize;
        for manifest in &manifests {
            for chunk in &manifest.chunks {
                total += 1;
                if let Some(count) = counts.get_mut(chunk.remote.as_str()) {
                    *count += 1;
                }
            }
        }
        let ideal = if self.remotes.is_empty() {
            0
        } else {
            total / self.remotes.len()
        };
        Ok(BalanceAnalysis {
            counts: self
                .remotes
                .iter()
                .map(|r| (r.clone(), counts[r.as_str()]))
                .collect(),
            total_chunks: total,
            ideal,
        })
    }

    /// Plan surplus-chunk moves from overloaded remotes to the currently
    /// least-loaded underloaded remote.
    pub async fn plan(&self) -> Result<Vec<ChunkMove>, PoolError> {
        let analysis = self.analyze().await?;
        let mut counts: HashMap<String, usize> = analysis.counts.iter().cloned().collect();
        let manifests = self.store.list("/", true).await?;
        let mut moves = Vec::new();

        for source in &self.remotes {
            let mut surplus = counts[source].saturating_sub(analysis.ideal);
            if surplus == 0 {
                continue;
            }
            'chunks: for manifest in &manifests {
                for chunk in &manifest.chunks {
                    if chunk.remote != *source {
                        continue;
                    }
                    let target = self
                        .remotes
                        .iter()
                        .filter(|r| counts[*r] < analysis.ideal)
                        .min_by_key(|r| counts[*r]);
                    let Some(target) = target else { break 'chunks };
                    let target = target.clone();

                    *counts.get_mut(source).unwrap() -= 1;
                    *counts.get_mut(&target).unwrap() += 1;
                    moves.push(ChunkMove {
                        file_path: manifest.file_path.clone(),
                        chunk_index: chunk.index,
                        source: source.clone(),
                        target,
                        path: chunk.path.clone(),
                        size: chunk.size,
                    });
                    surplus -= 1;
                    if surplus == 0 {
                        break 'chunks;
                    }
                }
            }
        }
        Ok(moves)
    }

    pub async fn execute(&self, moves: Vec<ChunkMove>) -> RebalanceOutcome {
        let mut outcome = RebalanceOutcome::default();
        for mv in moves {
            match self.execute_one(&mv).await {
                Ok(()) => {
                    log::info!(
                        "moved chunk {} of {} from {} to {}",
                        mv.chunk_index,
                        mv.file_path,
                        mv.source,
                        mv.target
                    );
                    outcome.moved.push(mv);
                }
                Err(e) => {
                    log::error!(
                        "could not move chunk {} of {}: {e}",
                        mv.chunk_index,
                        mv.file_path
                    );
                    outcome.failed += 1;
                }
            }
        }
        outcome
    }

    async fn execute_one(&self, mv: &ChunkMove) -> Result<(), PoolError> {
        let data = self.transport.get_bytes(&mv.source, &mv.path).await?;
        self.transport
            .put_bytes(&data, &mv.target, &mv.path)
            .await?;

        let mut manifest = self.store.load(&mv.file_path).await?;
        let Some(chunk) = manifest
            .chunks
            .iter_mut()
            .find(|c| c.index == mv.chunk_index)
        else {
            return Err(PoolError::ManifestCorrupt(format!(
                "{}: no chunk {}",
                mv.file_path, mv.chunk_index
            )));
        };
        chunk.remote = mv.target.clone();

        if let Err(e) = self.store.save(&manifest).await {
            // Leave the old placement authoritative; drop the new copy.
            let _ = self.transport.delete(&mv.target, &mv.path).await;
            return Err(e);
        }
        if let Err(e) = self.transport.delete(&mv.source, &mv.path).await {
            log::warn!(
                "stale chunk copy left on {} at {}: {e}",
                mv.source,
                mv.path
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{ChunkDescriptor, Manifest, chunk_object_name};
    use crate::transport::localdir::LocalDirTransport;

    async fn seeded_pool(
        tmp: &std::path::Path,
        placements: &[&str],
    ) -> (Arc<LocalDirTransport>, Arc<ManifestStore>) {
        let transport = Arc::new(LocalDirTransport::new(tmp));
        let store = Arc::new(ManifestStore::new(
            transport.clone(),
            vec!["r0:".into(), "r1:".into(), "r2:".into()],
            "rclonepool_manifests".to_string(),
            None,
        ));
        // One file, one 10-byte chunk per placement entry.
        let mut chunks = Vec::new();
        for (i, remote) in placements.iter().enumerate() {
            let path = format!("rclonepool_data/{}", chunk_object_name("f.bin", i as u32));
            transport
                .put_bytes(&[i as u8; 10], remote, &path)
                .await
                .unwrap();
            chunks.push(ChunkDescriptor {
                index: i as u32,
                remote: remote.to_string(),
                path,
                size: 10,
                offset: i as u64 * 10,
            });
        }
        let manifest =
            Manifest::new("/f.bin", placements.len() as u64 * 10, 10, chunks).unwrap();
        store.save(&manifest).await.unwrap();
        (transport, store)
    }

    #[tokio::test]
    async fn skewed_placement_is_planned_toward_ideal() {
        let tmp = tempfile::tempdir().unwrap();
        let (transport, store) = seeded_pool(tmp.path(), &["r0:", "r0:", "r0:", "r0:", "r0:", "r0:"]).await;
        let rebalancer = Rebalancer::new(
            transport.clone(),
            store.clone(),
            vec!["r0:".into(), "r1:".into(), "r2:".into()],
        );

        let analysis = rebalancer.analyze().await.unwrap();
        assert_eq!(analysis.total_chunks, 6);
        assert_eq!(analysis.ideal, 2);

        let moves = rebalancer.plan().await.unwrap();
        assert_eq!(moves.len(), 4);
        assert!(moves.iter().all(|m| m.source == "r0:"));

        let outcome = rebalancer.execute(moves).await;
        assert_eq!(outcome.failed, 0);
        assert_eq!(outcome.moved.len(), 4);

        let analysis = rebalancer.analyze().await.unwrap();
        assert!(analysis.counts.iter().all(|(_, c)| *c == 2));

        // Idempotent: nothing left to plan.
        assert!(rebalancer.plan().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn moved_chunks_remain_readable() {
        let tmp = tempfile::tempdir().unwrap();
        let (transport, store) = seeded_pool(tmp.path(), &["r0:", "r0:", "r0:"]).await;
        let rebalancer = Rebalancer::new(
            transport.clone(),
            store.clone(),
            vec!["r0:".into(), "r1:".into(), "r2:".into()],
        );
        let moves = rebalancer.plan().await.unwrap();
        rebalancer.execute(moves).await;

        let manifest = store.load("/f.bin").await.unwrap();
        for chunk in &manifest.chunks {
            let data = transport.get_bytes(&chunk.remote, &chunk.path).await.unwrap();
            assert_eq!(data.len() as u64, chunk.size);
            assert_eq!(data[0], chunk.index as u8);
        }
    }
}
