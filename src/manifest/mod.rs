//! Manifest model: the only persisted metadata, one record per logical
//! file, replicated to every remote.

pub mod disk_cache;
pub mod store;

use crate::error::PoolError;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::{SystemTime, UNIX_EPOCH};

pub const MANIFEST_VERSION: u32 = 1;
pub const MANIFEST_SUFFIX: &str = ".manifest.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkDescriptor {
    pub index: u32,
    /// Remote holding this chunk, e.g. "crypt-r2:".
    pub remote: String,
    /// Path within that remote, e.g. "rclonepool_data/movie.mkv.chunk.000".
    pub path: String,
    pub size: u64,
    /// Absolute byte offset within the file.
    pub offset: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub version: u32,
    pub file_name: String,
    pub remote_dir: String,
    pub file_path: String,
    pub file_size: u64,
    pub chunk_size: u64,
    pub chunk_count: usize,
    pub chunks: Vec<ChunkDescriptor>,
    pub created_at: f64,
    pub checksum: String,
    /// Unknown keys from newer writers, preserved and echoed on save.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Manifest {
    pub fn new(
        file_path: &str,
        file_size: u64,
        chunk_size: u64,
        chunks: Vec<ChunkDescriptor>,
    ) -> Result<Self, PoolError> {
        let file_path = normalize_path(file_path);
        let (remote_dir, file_name) = split_path(&file_path);
        let manifest = Manifest {
            version: MANIFEST_VERSION,
            checksum: weak_checksum(&file_name, file_size, chunks.len()),
            file_name,
            remote_dir,
            file_path,
            file_size,
            chunk_size,
            chunk_count: chunks.len(),
            chunks,
            created_at: unix_now(),
            extra: serde_json::Map::new(),
        };
        manifest.validate()?;
        Ok(manifest)
    }

    /// Check the structural invariants: gap-free prefix-sum offsets, sizes
    /// bounded by the chunk size, indexes equal to positions, total equal
    /// to the file size. Zero chunks is valid only for an empty file.
    pub fn validate(&self) -> Result<(), PoolError> {
        let corrupt = |msg: String| PoolError::ManifestCorrupt(format!("{}: {msg}", self.file_path));

        if self.chunk_count != self.chunks.len() {
            return Err(corrupt(format!(
                "chunk_count {} != chunks.len() {}",
                self.chunk_count,
                self.chunks.len()
            )));
        }
        if self.chunks.is_empty() {
            if self.file_size != 0 {
                return Err(corrupt(format!("no chunks for {} bytes", self.file_size)));
            }
            return Ok(());
        }

        let mut expected_offset = 0u64;
        let last = self.chunks.len() - 1;
        for (i, chunk) in self.chunks.iter().enumerate() {
            if chunk.index as usize != i {
                return Err(corrupt(format!("chunk {i} has index {}", chunk.index)));
            }
            if chunk.offset != expected_offset {
                return Err(corrupt(format!(
                    "chunk {i} offset {} != {expected_offset}",
                    chunk.offset
                )));
            }
            if chunk.size > self.chunk_size || (chunk.size == 0 && self.file_size != 0) {
                return Err(corrupt(format!("chunk {i} has size {}", chunk.size)));
            }
            if i < last && chunk.size != self.chunk_size {
                return Err(corrupt(format!(
                    "non-final chunk {i} has size {} != {}",
                    chunk.size, self.chunk_size
                )));
            }
            expected_offset += chunk.size;
        }
        if expected_offset != self.file_size {
            return Err(corrupt(format!(
                "chunk sizes sum to {expected_offset}, file_size is {}",
                self.file_size
            )));
        }
        Ok(())
    }

    /// The remotes that hold at least one chunk of this file.
    pub fn remotes(&self) -> Vec<String> {
        let mut remotes: Vec<String> = self.chunks.iter().map(|c| c.remote.clone()).collect();
        remotes.sort();
        remotes.dedup();
        remotes
    }

}

fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

fn weak_checksum(file_name: &str, file_size: u64, chunk_count: usize) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{file_name}:{file_size}:{chunk_count}").as_bytes());
    hex::encode(hasher.finalize())[..16].to_string()
}

/// Collapse a virtual path to a canonical form with a leading slash and no
/// empty segments. The root is "/".
pub fn normalize_path(path: &str) -> String {
    let joined: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    if joined.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", joined.join("/"))
    }
}

/// Split a normalized path into (parent dir, base name).
pub fn split_path(path: &str) -> (String, String) {
    match path.rfind('/') {
        Some(0) => ("/".to_string(), path[1..].to_string()),
        Some(n) => (path[..n].to_string(), path[n + 1..].to_string()),
        None => ("/".to_string(), path.to_string()),
    }
}

/// Flatten a virtual path into a single object name segment.
pub fn sanitize(file_path: &str) -> String {
    let safe = file_path.replace('/', "_");
    let safe = safe.trim_matches('_');
    if safe.is_empty() {
        "root".to_string()
    } else {
        safe.to_string()
    }
}

pub fn manifest_object_name(file_path: &str) -> String {
    format!("{}{MANIFEST_SUFFIX}", sanitize(file_path))
}

/// Chunk object name; the index is zero-padded to three digits.
pub fn chunk_object_name(file_name: &str, index: u32) -> String {
    format!("{file_name}.chunk.{index:03}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunks_for(sizes: &[u64]) -> Vec<ChunkDescriptor> {
        let mut offset = 0;
        sizes
            .iter()
            .enumerate()
            .map(|(i, &size)| {
                let d = ChunkDescriptor {
                    index: i as u32,
                    remote: "r1:".to_string(),
                    path: chunk_object_name("a.bin", i as u32),
                    size,
                    offset,
                };
                offset += size;
                d
            })
            .collect()
    }

    #[test]
    fn valid_manifest_round_trips_through_json() {
        let m = Manifest::new("/t/a.bin", 250, 100, chunks_for(&[100, 100, 50])).unwrap();
        let raw = serde_json::to_string(&m).unwrap();
        let parsed: Manifest = serde_json::from_str(&raw).unwrap();
        assert_eq!(m, parsed);
    }

    #[test]
    fn unknown_keys_are_preserved() {
        let m = Manifest::new("/a.bin", 0, 100, Vec::new()).unwrap();
        let mut value = serde_json::to_value(&m).unwrap();
        value["future_field"] = serde_json::json!({"nested": true});
        let parsed: Manifest = serde_json::from_value(value).unwrap();
        assert!(parsed.extra.contains_key("future_field"));
        let echoed = serde_json::to_value(&parsed).unwrap();
        assert_eq!(echoed["future_field"]["nested"], serde_json::json!(true));
    }

    #[test]
    fn offsets_must_be_gap_free() {
        let mut chunks = chunks_for(&[100, 100]);
        chunks[1].offset = 150;
        let m = Manifest::new("/a.bin", 200, 100, chunks);
        assert!(matches!(m, Err(PoolError::ManifestCorrupt(_))));
    }

    #[test]
    fn only_last_chunk_may_be_short() {
        let m = Manifest::new("/a.bin", 150, 100, chunks_for(&[50, 100]));
        assert!(matches!(m, Err(PoolError::ManifestCorrupt(_))));
    }

    #[test]
    fn sizes_must_sum_to_file_size() {
        let m = Manifest::new("/a.bin", 300, 100, chunks_for(&[100, 100, 50]));
        assert!(matches!(m, Err(PoolError::ManifestCorrupt(_))));
    }

    #[test]
    fn empty_file_has_zero_chunks() {
        let m = Manifest::new("/t/empty", 0, 100, Vec::new()).unwrap();
        assert_eq!(m.chunk_count, 0);
        assert_eq!(m.remote_dir, "/t");
        assert_eq!(m.file_name, "empty");
    }

    #[test]
    fn sanitize_flattens_and_trims() {
        assert_eq!(sanitize("/t/a.bin"), "t_a.bin");
        assert_eq!(sanitize("/a.bin"), "a.bin");
        assert_eq!(sanitize("/"), "root");
        assert_eq!(manifest_object_name("/t/a.bin"), "t_a.bin.manifest.json");
    }

    #[test]
    fn chunk_names_are_zero_padded() {
        assert_eq!(chunk_object_name("a.bin", 0), "a.bin.chunk.000");
        assert_eq!(chunk_object_name("a.bin", 42), "a.bin.chunk.042");
    }

    #[test]
    fn normalize_and_split() {
        assert_eq!(normalize_path("t/a.bin"), "/t/a.bin");
        assert_eq!(normalize_path("//t//a.bin/"), "/t/a.bin");
        assert_eq!(normalize_path(""), "/");
        assert_eq!(split_path("/t/a.bin"), ("/t".to_string(), "a.bin".to_string()));
        assert_eq!(split_path("/a.bin"), ("/".to_string(), "a.bin".to_string()));
    }
}
