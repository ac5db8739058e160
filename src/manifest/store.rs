//! Manifest persistence: save to every remote, load from the first one
//! that answers, with an in-memory index and an optional disk cache in
//! front.

use super::disk_cache::DiskCache;
use super::{MANIFEST_SUFFIX, Manifest, manifest_object_name, normalize_path};
use crate::error::PoolError;
use crate::transport::Transport;
use futures::future::join_all;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;

pub struct ManifestStore {
    transport: Arc<dyn Transport>,
    remotes: Vec<String>,
    manifest_prefix: String,
    cache: RwLock<HashMap<String, Manifest>>,
    disk: Option<DiskCache>,
}

impl ManifestStore {
    pub fn new(
        transport: Arc<dyn Transport>,
        remotes: Vec<String>,
        manifest_prefix: String,
        disk_cache_dir: Option<PathBuf>,
    ) -> Self {
        Self {
            transport,
            remotes,
            manifest_prefix,
            cache: RwLock::new(HashMap::new()),
            disk: disk_cache_dir.map(DiskCache::new),
        }
    }

    fn remote_path(&self, file_path: &str) -> String {
        format!("{}/{}", self.manifest_prefix, manifest_object_name(file_path))
    }

    /// Write the manifest to every remote concurrently. Durable as soon as
    /// one remote acks; returns the remotes that did.
    pub async fn save(&self, manifest: &Manifest) -> Result<Vec<String>, PoolError> {
        manifest.validate()?;
        let raw = serde_json::to_vec_pretty(manifest)
            .map_err(|e| PoolError::ManifestCorrupt(e.to_string()))?;
        let path = self.remote_path(&manifest.file_path);

        let writes = self.remotes.iter().map(|remote| {
            let raw = &raw;
            let path = &path;
            async move {
                match self.transport.put_bytes(raw, remote, path).await {
                    Ok(()) => Some(remote.clone()),
                    Err(e) => {
                        log::warn!("could not save manifest to {remote}: {e}");
                        None
                    }
                }
            }
        });
        let saved: Vec<String> = join_all(writes).await.into_iter().flatten().collect();
        if saved.is_empty() {
            return Err(PoolError::ManifestSaveFailed(manifest.file_path.clone()));
        }

        self.insert_cached(manifest.clone()).await;
        Ok(saved)
    }

    pub async fn load(&self, file_path: &str) -> Result<Manifest, PoolError> {
        let file_path = normalize_path(file_path);
        if let Some(manifest) = self.cache.read().await.get(&file_path) {
            return Ok(manifest.clone());
        }
        if let Some(disk) = &self.disk {
            if let Some(manifest) = disk.get(&file_path).await {
                self.cache
                    .write()
                    .await
                    .insert(file_path.clone(), manifest.clone());
                return Ok(manifest);
            }
        }

        let path = self.remote_path(&file_path);
        for remote in &self.remotes {
            let raw = match self.transport.get_bytes(remote, &path).await {
                Ok(raw) => raw,
                Err(e) => {
                    log::debug!("no manifest for {file_path} on {remote}: {e}");
                    continue;
                }
            };
            match parse_manifest(&raw) {
                Ok(manifest) => {
                    log::debug!("loaded manifest for {file_path} from {remote}");
                    self.insert_cached(manifest.clone()).await;
                    return Ok(manifest);
                }
                Err(e) => {
                    log::warn!("corrupt manifest for {file_path} on {remote}: {e}");
                    continue;
                }
            }
        }
        Err(PoolError::ManifestNotFound(file_path))
    }

    /// Enumerate manifests filtered by directory; with `recursive` the
    /// filter matches any depth below `dir`. Every remote is scanned and
    /// the results unioned — saves only need one remote to ack, so a
    /// manifest may exist on any subset of them.
    pub async fn list(&self, dir: &str, recursive: bool) -> Result<Vec<Manifest>, PoolError> {
        let dir = normalize_path(dir);
        let mut seen: HashSet<String> = HashSet::new();
        let mut manifests = Vec::new();
        let mut last_err: Option<PoolError> = None;
        let mut any_listed = false;

        for remote in &self.remotes {
            let names = match self.transport.list_files(remote, &self.manifest_prefix).await {
                Ok(names) => names,
                Err(e) => {
                    log::debug!("could not list manifests on {remote}: {e}");
                    last_err = Some(e.into());
                    continue;
                }
            };
            any_listed = true;

            for name in names {
                if !name.ends_with(MANIFEST_SUFFIX) || seen.contains(&name) {
                    continue;
                }
                let path = format!("{}/{name}", self.manifest_prefix);
                let raw = match self.transport.get_bytes(remote, &path).await {
                    Ok(raw) => raw,
                    Err(e) => {
                        log::debug!("could not read {path} on {remote}: {e}");
                        continue;
                    }
                };
                let manifest = match parse_manifest(&raw) {
                    Ok(manifest) => manifest,
                    Err(e) => {
                        // Another remote may still hold a good copy.
                        log::warn!("corrupt manifest {path} on {remote}: {e}");
                        continue;
                    }
                };
                seen.insert(name);
                if dir_matches(&manifest.remote_dir, &dir, recursive) {
                    self.insert_cached(manifest.clone()).await;
                    manifests.push(manifest);
                }
            }
        }

        if !any_listed && let Some(err) = last_err {
            return Err(err);
        }
        manifests.sort_by(|a, b| a.file_path.cmp(&b.file_path));
        Ok(manifests)
    }

    /// Remove the manifest from every remote; per-remote failures are
    /// warnings, not errors.
    pub async fn delete(&self, file_path: &str) {
        let file_path = normalize_path(file_path);
        let path = self.remote_path(&file_path);
        let deletes = self.remotes.iter().map(|remote| {
            let path = &path;
            async move {
                if let Err(e) = self.transport.delete(remote, path).await {
                    log::warn!("could not delete manifest from {remote}: {e}");
                }
            }
        });
        join_all(deletes).await;

        self.cache.write().await.remove(&file_path);
        if let Some(disk) = &self.disk {
            disk.invalidate(&file_path).await;
        }
    }

    pub async fn rebuild_cache(&self) -> Result<usize, PoolError> {
        self.cache.write().await.clear();
        if let Some(disk) = &self.disk {
            disk.clear().await;
        }
        let manifests = self.list("/", true).await?;
        Ok(manifests.len())
    }

    pub async fn insert_cached(&self, manifest: Manifest) {
        if let Some(disk) = &self.disk {
            disk.put(&manifest).await;
        }
        self.cache
            .write()
            .await
            .insert(manifest.file_path.clone(), manifest);
    }

    /// Snapshot of the in-memory index.
    pub async fn cached(&self) -> Vec<Manifest> {
        self.cache.read().await.values().cloned().collect()
    }
}

fn parse_manifest(raw: &[u8]) -> Result<Manifest, PoolError> {
    let manifest: Manifest =
        serde_json::from_slice(raw).map_err(|e| PoolError::ManifestCorrupt(e.to_string()))?;
    manifest.validate()?;
    Ok(manifest)
}

fn dir_matches(remote_dir: &str, wanted: &str, recursive: bool) -> bool {
    if remote_dir == wanted {
        return true;
    }
    if !recursive {
        return false;
    }
    if wanted == "/" {
        return true;
    }
    remote_dir.starts_with(&format!("{wanted}/"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::Manifest;
    use crate::transport::localdir::LocalDirTransport;

    fn store_over(tmp: &std::path::Path, remotes: &[&str]) -> ManifestStore {
        ManifestStore::new(
            Arc::new(LocalDirTransport::new(tmp)),
            remotes.iter().map(|r| r.to_string()).collect(),
            "rclonepool_manifests".to_string(),
            None,
        )
    }

    #[tokio::test]
    async fn save_replicates_to_all_remotes() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store_over(tmp.path(), &["r1:", "r2:", "r3:"]);
        let manifest = Manifest::new("/t/a", 0, 100, Vec::new()).unwrap();

        let saved = store.save(&manifest).await.unwrap();
        assert_eq!(saved.len(), 3);
        for remote in ["r1", "r2", "r3"] {
            assert!(
                tmp.path()
                    .join(remote)
                    .join("rclonepool_manifests/t_a.manifest.json")
                    .exists()
            );
        }
    }

    #[tokio::test]
    async fn load_falls_through_to_remotes_and_caches() {
        let tmp = tempfile::tempdir().unwrap();
        let manifest = Manifest::new("/t/a", 0, 100, Vec::new()).unwrap();
        {
            let store = store_over(tmp.path(), &["r1:"]);
            store.save(&manifest).await.unwrap();
        }
        // Fresh store: empty cache, must hit the remote.
        let store = store_over(tmp.path(), &["r1:"]);
        let loaded = store.load("/t/a").await.unwrap();
        assert_eq!(loaded.file_path, "/t/a");
        assert_eq!(store.cached().await.len(), 1);
    }

    #[tokio::test]
    async fn load_missing_is_manifest_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store_over(tmp.path(), &["r1:"]);
        assert!(matches!(
            store.load("/nope").await,
            Err(PoolError::ManifestNotFound(_))
        ));
    }

    #[tokio::test]
    async fn corrupt_copy_is_skipped_for_a_good_one() {
        let tmp = tempfile::tempdir().unwrap();
        let transport = LocalDirTransport::new(tmp.path());
        let manifest = Manifest::new("/t/a", 0, 100, Vec::new()).unwrap();
        {
            let store = store_over(tmp.path(), &["r2:"]);
            store.save(&manifest).await.unwrap();
        }
        transport
            .put_bytes(b"not json", "r1:", "rclonepool_manifests/t_a.manifest.json")
            .await
            .unwrap();

        let store = store_over(tmp.path(), &["r1:", "r2:"]);
        let loaded = store.load("/t/a").await.unwrap();
        assert_eq!(loaded, manifest);
    }

    #[tokio::test]
    async fn list_filters_by_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store_over(tmp.path(), &["r1:"]);
        for path in ["/a", "/t/b", "/t/deep/c"] {
            store
                .save(&Manifest::new(path, 0, 100, Vec::new()).unwrap())
                .await
                .unwrap();
        }

        let root = store.list("/", false).await.unwrap();
        assert_eq!(root.len(), 1);
        assert_eq!(root[0].file_path, "/a");

        let t = store.list("/t", false).await.unwrap();
        assert_eq!(t.len(), 1);
        assert_eq!(t[0].file_path, "/t/b");

        let all = store.list("/", true).await.unwrap();
        assert_eq!(all.len(), 3);
    }

    #[tokio::test]
    async fn list_unions_partially_replicated_manifests() {
        let tmp = tempfile::tempdir().unwrap();
        // One manifest only ever landed on r1, another only on r2, as
        // after saves that each reached a single remote.
        {
            let store = store_over(tmp.path(), &["r1:"]);
            store
                .save(&Manifest::new("/t/only-on-r1", 0, 100, Vec::new()).unwrap())
                .await
                .unwrap();
        }
        {
            let store = store_over(tmp.path(), &["r2:"]);
            store
                .save(&Manifest::new("/t/only-on-r2", 0, 100, Vec::new()).unwrap())
                .await
                .unwrap();
        }

        let store = store_over(tmp.path(), &["r1:", "r2:"]);
        let listed = store.list("/t", false).await.unwrap();
        let paths: Vec<&str> = listed.iter().map(|m| m.file_path.as_str()).collect();
        assert_eq!(paths, ["/t/only-on-r1", "/t/only-on-r2"]);
    }

    #[tokio::test]
    async fn rebuild_cache_reloads_from_remotes() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store_over(tmp.path(), &["r1:"]);
        for path in ["/a", "/t/b"] {
            store
                .save(&Manifest::new(path, 0, 100, Vec::new()).unwrap())
                .await
                .unwrap();
        }

        let count = store.rebuild_cache().await.unwrap();
        assert_eq!(count, 2);
        assert_eq!(store.cached().await.len(), 2);
    }

    #[tokio::test]
    async fn disk_cache_survives_a_new_store() {
        let tmp = tempfile::tempdir().unwrap();
        let cache_dir = tmp.path().join("cache");
        let manifest = Manifest::new("/t/a", 0, 100, Vec::new()).unwrap();
        {
            let store = ManifestStore::new(
                Arc::new(LocalDirTransport::new(tmp.path().join("remotes"))),
                vec!["r1:".into()],
                "rclonepool_manifests".to_string(),
                Some(cache_dir.clone()),
            );
            store.save(&manifest).await.unwrap();
        }
        // A store over an empty transport still finds the cached copy.
        let store = ManifestStore::new(
            Arc::new(LocalDirTransport::new(tmp.path().join("elsewhere"))),
            vec!["r1:".into()],
            "rclonepool_manifests".to_string(),
            Some(cache_dir),
        );
        assert_eq!(store.load("/t/a").await.unwrap(), manifest);
    }

    #[tokio::test]
    async fn delete_removes_every_copy_and_the_cache() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store_over(tmp.path(), &["r1:", "r2:"]);
        let manifest = Manifest::new("/t/a", 0, 100, Vec::new()).unwrap();
        store.save(&manifest).await.unwrap();

        store.delete("/t/a").await;
        assert!(store.cached().await.is_empty());
        assert!(matches!(
            store.load("/t/a").await,
            Err(PoolError::ManifestNotFound(_))
        ));
    }
}
