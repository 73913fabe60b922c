//! Raw object bytes on local disk.
//!
//! Objects live under `<root>/<key[:P]>/<key>` where `P` is the shard prefix
//! length (hex keys spread uniformly across subdirectories). Writes land in
//! `<root>/tmp/<key>` first and are renamed into place, so a published file
//! is always complete; `tmp/` sits on the same filesystem as the object tree
//! to keep the rename atomic.

use std::io::ErrorKind;
use std::path::PathBuf;
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::fs;

use super::{Extras, ObjectStore, StoreError, StoreResult, Trace};

const NAME: &str = "disk";

pub struct DiskStore {
    root: PathBuf,
    /// Shard files into subdirectories named after the first N chars of the
    /// key. 0 = flat layout.
    prefix_len: usize,
}

impl DiskStore {
    /// Open a disk store rooted at `root`, creating `root/` and `root/tmp/`
    /// if needed.
    pub async fn new(root: impl Into<PathBuf>, prefix_len: usize) -> StoreResult<Self> {
        let root = root.into();
        fs::create_dir_all(root.join("tmp")).await?;
        Ok(Self { root, prefix_len })
    }

    fn dir(&self, key: &str) -> PathBuf {
        if self.prefix_len == 0 || key.len() < self.prefix_len {
            return self.root.clone();
        }
        self.root.join(&key[..self.prefix_len])
    }

    fn path(&self, key: &str) -> PathBuf {
        self.dir(key).join(key)
    }

    fn tmp_path(&self, key: &str) -> PathBuf {
        self.root.join("tmp").join(key)
    }
}

#[async_trait]
impl ObjectStore for DiskStore {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn has(&self, key: &str, _extras: Extras) -> StoreResult<bool> {
        match fs::metadata(self.path(key)).await {
            Ok(_) => Ok(true),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    async fn get(&self, key: &str, _extras: Extras) -> (StoreResult<Bytes>, Trace) {
        let start = Instant::now();
        let result = match fs::read(self.path(key)).await {
            Ok(object) => Ok(Bytes::from(object)),
            Err(err) if err.kind() == ErrorKind::NotFound => Err(StoreError::NotFound),
            Err(err) => Err(err.into()),
        };
        (result, Trace::new(NAME, start.elapsed()))
    }

    async fn put(&self, key: &str, object: Bytes, _extras: Extras) -> StoreResult<()> {
        fs::create_dir_all(self.dir(key)).await?;
        let tmp = self.tmp_path(key);
        fs::write(&tmp, &object).await?;
        fs::rename(&tmp, self.path(key)).await?;
        Ok(())
    }

    async fn delete(&self, key: &str, _extras: Extras) -> StoreResult<()> {
        match fs::remove_file(self.path(key)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn shutdown(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    async fn store() -> (tempfile::TempDir, DiskStore) {
        let dir = tempdir().unwrap();
        let store = DiskStore::new(dir.path().join("objects"), 2).await.unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn round_trip() {
        let (_dir, store) = store().await;
        let key = "deadbeef00";
        store
            .put(key, Bytes::from_static(b"hello"), Extras::None)
            .await
            .unwrap();

        assert!(store.has(key, Extras::None).await.unwrap());
        let (object, trace) = store.get(key, Extras::None).await;
        assert_eq!(object.unwrap(), Bytes::from_static(b"hello"));
        assert!(trace.visited("disk"));
    }

    #[tokio::test]
    async fn shards_by_key_prefix() {
        let (dir, store) = store().await;
        store
            .put("cafebabe", Bytes::from_static(b"x"), Extras::None)
            .await
            .unwrap();
        assert!(dir.path().join("objects/ca/cafebabe").is_file());
        // nothing left behind in the staging directory
        assert!(!dir.path().join("objects/tmp/cafebabe").exists());
    }

    #[tokio::test]
    async fn missing_object_is_not_found() {
        let (_dir, store) = store().await;
        assert!(!store.has("00ff", Extras::None).await.unwrap());
        let (object, _) = store.get("00ff", Extras::None).await;
        assert_eq!(object.unwrap_err(), StoreError::NotFound);
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let (_dir, store) = store().await;
        store
            .put("aabb", Bytes::from_static(b"x"), Extras::None)
            .await
            .unwrap();
        store.delete("aabb", Extras::None).await.unwrap();
        store.delete("aabb", Extras::None).await.unwrap();
        assert!(!store.has("aabb", Extras::None).await.unwrap());
    }

    #[tokio::test]
    async fn short_keys_fall_back_to_flat_layout() {
        let (dir, store) = store().await;
        store
            .put("a", Bytes::from_static(b"x"), Extras::None)
            .await
            .unwrap();
        assert!(dir.path().join("objects/a").is_file());
    }
}
