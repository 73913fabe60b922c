//! Local store composed of disk bytes plus the metadata index.
//!
//! The index answers existence queries without touching the disk, ranks
//! entries for eviction, and is reconciled on read: a row whose backing file
//! has gone missing is deleted the moment the mismatch is observed.
//!
//! Ordering invariants: `put` writes bytes before the row, so a `stored`
//! row always pointed at a readable file at the moment it was committed;
//! `delete` removes bytes before the row, so the index never loses its
//! pointer to a live file.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use tracing::error;

use super::{DiskStore, Extras, ObjectIndex, ObjectStore, StoreError, StoreResult, Trace};

const NAME: &str = "db-backed";

pub struct IndexedStore {
    disk: DiskStore,
    index: Arc<ObjectIndex>,
    /// Reads only refresh `last_access` when the row is older than this.
    refresh_threshold: Duration,
}

impl IndexedStore {
    #[must_use]
    pub fn new(disk: DiskStore, index: Arc<ObjectIndex>, refresh_threshold: Duration) -> Self {
        Self {
            disk,
            index,
            refresh_threshold,
        }
    }
}

#[async_trait]
impl ObjectStore for IndexedStore {
    fn name(&self) -> &'static str {
        NAME
    }

    /// Answers from the index alone; never stats the disk.
    async fn has(&self, key: &str, _extras: Extras) -> StoreResult<bool> {
        let record = self.index.get(key).await?;
        Ok(record.map(|r| r.stored).unwrap_or(false))
    }

    async fn get(&self, key: &str, extras: Extras) -> (StoreResult<Bytes>, Trace) {
        let start = Instant::now();
        let record = match self.index.get(key).await {
            Ok(Some(record)) => record,
            Ok(None) => return (Err(StoreError::NotFound), Trace::new(NAME, start.elapsed())),
            Err(err) => return (Err(err), Trace::new(NAME, start.elapsed())),
        };

        let (object, disk_trace) = self.disk.get(key, extras).await;
        let object = match object {
            Ok(object) => object,
            Err(StoreError::NotFound) => {
                // the row lied: the file is gone, so the row goes too
                if let Err(err) = self.index.delete(key).await {
                    error!("error deleting index row for {key}: {err}");
                }
                return (
                    Err(StoreError::NotFound),
                    disk_trace.stack(NAME, start.elapsed()),
                );
            }
            Err(err) => return (Err(err), disk_trace.stack(NAME, start.elapsed())),
        };

        let refresh_cutoff = Utc::now().timestamp() - self.refresh_threshold.as_secs() as i64;
        if record.last_access < refresh_cutoff {
            if let Err(err) = self.index.touch(key).await {
                error!("error refreshing last access time for {key}: {err}");
            }
        }
        (Ok(object), disk_trace.stack(NAME, start.elapsed()))
    }

    async fn put(&self, key: &str, object: Bytes, extras: Extras) -> StoreResult<()> {
        let length = object.len() as i64;
        self.disk.put(key, object, extras).await?;
        self.index.upsert(key, length).await
    }

    async fn delete(&self, key: &str, extras: Extras) -> StoreResult<()> {
        self.disk.delete(key, extras).await?;
        self.index.delete(key).await
    }

    async fn shutdown(&self) {
        self.index.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::super::index::testutil::{set_last_access, sqlite_index};
    use super::*;
    use tempfile::TempDir;

    const SIX_HOURS: Duration = Duration::from_secs(6 * 3600);

    async fn store() -> (TempDir, TempDir, IndexedStore) {
        let (db_dir, index) = sqlite_index().await;
        let disk_dir = TempDir::new().unwrap();
        let disk = DiskStore::new(disk_dir.path().join("objects"), 2)
            .await
            .unwrap();
        let store = IndexedStore::new(disk, Arc::new(index), SIX_HOURS);
        (db_dir, disk_dir, store)
    }

    #[tokio::test]
    async fn round_trip_updates_index_and_disk() {
        let (_db, _disk, store) = store().await;
        store
            .put("aabbcc", Bytes::from_static(b"hello"), Extras::None)
            .await
            .unwrap();

        assert!(store.has("aabbcc", Extras::None).await.unwrap());
        let (object, trace) = store.get("aabbcc", Extras::None).await;
        assert_eq!(object.unwrap(), Bytes::from_static(b"hello"));
        assert!(trace.visited("db-backed"));
        assert!(trace.visited("disk"));

        let record = store.index.get("aabbcc").await.unwrap().unwrap();
        assert_eq!(record.length, 5);
        assert!(record.stored);
    }

    #[tokio::test]
    async fn get_without_row_skips_disk() {
        let (_db, disk_dir, store) = store().await;
        // orphaned file: on disk but not indexed
        std::fs::create_dir_all(disk_dir.path().join("objects/or")).unwrap();
        std::fs::write(disk_dir.path().join("objects/or/orphan"), b"x").unwrap();

        let (object, _) = store.get("orphan", Extras::None).await;
        assert_eq!(object.unwrap_err(), StoreError::NotFound);
    }

    #[tokio::test]
    async fn missing_file_reconciles_index() {
        let (_db, disk_dir, store) = store().await;
        store
            .put("aabbcc", Bytes::from_static(b"hello"), Extras::None)
            .await
            .unwrap();
        std::fs::remove_file(disk_dir.path().join("objects/aa/aabbcc")).unwrap();

        // metadata-only Has may still say yes
        assert!(store.has("aabbcc", Extras::None).await.unwrap());

        let (object, _) = store.get("aabbcc", Extras::None).await;
        assert_eq!(object.unwrap_err(), StoreError::NotFound);

        // the row is gone after the read repaired the drift
        assert!(store.index.get("aabbcc").await.unwrap().is_none());
        assert!(!store.has("aabbcc", Extras::None).await.unwrap());
    }

    #[tokio::test]
    async fn stale_read_refreshes_last_access() {
        let (_db, _disk, store) = store().await;
        store
            .put("aabbcc", Bytes::from_static(b"x"), Extras::None)
            .await
            .unwrap();
        let stale = Utc::now().timestamp() - 7 * 3600;
        set_last_access(&store.index, "aabbcc", stale).await;

        let (object, _) = store.get("aabbcc", Extras::None).await;
        object.unwrap();
        let record = store.index.get("aabbcc").await.unwrap().unwrap();
        assert!(record.last_access > stale);
    }

    #[tokio::test]
    async fn fresh_read_leaves_last_access_alone() {
        let (_db, _disk, store) = store().await;
        store
            .put("aabbcc", Bytes::from_static(b"x"), Extras::None)
            .await
            .unwrap();
        let recent = Utc::now().timestamp() - 60;
        set_last_access(&store.index, "aabbcc", recent).await;

        let (object, _) = store.get("aabbcc", Extras::None).await;
        object.unwrap();
        let record = store.index.get("aabbcc").await.unwrap().unwrap();
        assert_eq!(record.last_access, recent);
    }

    #[tokio::test]
    async fn delete_removes_bytes_and_row() {
        let (_db, disk_dir, store) = store().await;
        store
            .put("aabbcc", Bytes::from_static(b"x"), Extras::None)
            .await
            .unwrap();
        store.delete("aabbcc", Extras::None).await.unwrap();

        assert!(!disk_dir.path().join("objects/aa/aabbcc").exists());
        assert!(store.index.get("aabbcc").await.unwrap().is_none());
    }
}
