//! Optional on-disk manifest cache: one JSON file per manifest, written
//! atomically (temp file + rename). Corrupt entries are ignored and the
//! manifest is re-fetched from the remotes.

use super::{Manifest, manifest_object_name};
use std::path::PathBuf;
use tokio::fs;

pub struct DiskCache {
    dir: PathBuf,
}

impl DiskCache {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn entry_path(&self, file_path: &str) -> PathBuf {
        self.dir.join(manifest_object_name(file_path))
    }

    pub async fn get(&self, file_path: &str) -> Option<Manifest> {
        let raw = fs::read(self.entry_path(file_path)).await.ok()?;
        match serde_json::from_slice::<Manifest>(&raw) {
            Ok(manifest) if manifest.validate().is_ok() => Some(manifest),
            _ => {
                log::warn!("ignoring corrupt cache entry for {file_path}");
                None
            }
        }
    }

    pub async fn put(&self, manifest: &Manifest) {
        let path = self.entry_path(&manifest.file_path);
        let raw = match serde_json::to_vec_pretty(manifest) {
            Ok(raw) => raw,
            Err(e) => {
                log::warn!("could not serialize cache entry for {}: {e}", manifest.file_path);
                return;
            }
        };
        let tmp = path.with_extension("json.tmp");
        let result = async {
            fs::create_dir_all(&self.dir).await?;
            fs::write(&tmp, &raw).await?;
            fs::rename(&tmp, &path).await
        }
        .await;
        if let Err(e) = result {
            log::warn!("could not write cache entry for {}: {e}", manifest.file_path);
        }
    }

    pub async fn invalidate(&self, file_path: &str) {
        let _ = fs::remove_file(self.entry_path(file_path)).await;
    }

    pub async fn clear(&self) {
        let _ = fs::remove_dir_all(&self.dir).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_get_invalidate() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = DiskCache::new(tmp.path().join("manifests"));
        let manifest = Manifest::new("/t/x", 0, 100, Vec::new()).unwrap();

        assert!(cache.get("/t/x").await.is_none());
        cache.put(&manifest).await;
        assert_eq!(cache.get("/t/x").await.unwrap(), manifest);

        cache.invalidate("/t/x").await;
        assert!(cache.get("/t/x").await.is_none());
    }

    #[tokio::test]
    async fn corrupt_entries_are_ignored() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("manifests");
        let cache = DiskCache::new(dir.clone());
        fs::create_dir_all(&dir).await.unwrap();
        fs::write(dir.join(manifest_object_name("/t/x")), b"{nope")
            .await
            .unwrap();
        assert!(cache.get("/t/x").await.is_none());
    }
}
