//! Layered object stores.
//!
//! Every tier (raw disk bytes, the metadata-indexed local cache, the
//! multi-bucket origin, and the wrappers that compose them) implements the
//! same `ObjectStore` capability set, so single-flight coalescing and the
//! two-tier caching store stack uniformly over any backend.

pub mod caching;
pub mod disk;
pub mod index;
pub mod indexed;
pub mod multi_s3;
pub mod single_flight;
pub mod trace;

use async_trait::async_trait;
use bytes::Bytes;
use sha1::{Digest, Sha1};
use thiserror::Error;

pub use caching::CachingStore;
pub use disk::DiskStore;
pub use index::ObjectIndex;
pub use indexed::IndexedStore;
pub use multi_s3::MultiS3Store;
pub use single_flight::SingleFlight;
pub use trace::Trace;

/// Per-call routing hint passed through the store stack.
///
/// Stores pattern-match the variant they need and fail with
/// [`StoreError::BadExtras`] on a mismatch. Layers that do not consume the
/// hint pass it through untouched.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Extras {
    #[default]
    None,
    /// Route to the origin bucket at this position in the configured list.
    MultiBucket { index: usize },
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Errors produced by the store stack.
///
/// I/O, database, and origin failures carry their rendered message rather
/// than the source error so the enum stays `Clone`: the single-flight
/// wrapper publishes one outcome to every waiter of a key.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// The object is absent at this layer. Sentinel used for control flow
    /// across tiers.
    #[error("object not found")]
    NotFound,
    #[error("{store} requires a bucket index in the call extras")]
    BadExtras { store: &'static str },
    #[error("disk i/o: {0}")]
    Io(String),
    #[error("metadata index: {0}")]
    Index(String),
    #[error("origin: {0}")]
    Origin(String),
    #[error("bucket {0} does not exist")]
    NoSuchBucket(String),
    #[error("internal: {0}")]
    Internal(String),
}

impl StoreError {
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound)
    }
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        Self::Index(err.to_string())
    }
}

/// Capability set shared by every store tier.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Short layer name, used in traces and error messages.
    fn name(&self) -> &'static str;

    /// Whether the object exists in this store.
    async fn has(&self, key: &str, extras: Extras) -> StoreResult<bool>;

    /// Fetch the object. Returns the trace alongside the result so error
    /// branches still describe which tiers the request passed through.
    async fn get(&self, key: &str, extras: Extras) -> (StoreResult<Bytes>, Trace);

    /// Store the object.
    async fn put(&self, key: &str, object: Bytes, extras: Extras) -> StoreResult<()>;

    /// Remove the object. Deleting an absent object is not an error.
    async fn delete(&self, key: &str, extras: Extras) -> StoreResult<()>;

    /// Release resources held by the store. Idempotent.
    async fn shutdown(&self);
}

/// Internal key for an external object name: 40 lowercase hex chars of its
/// SHA-1 digest. Keeps the disk layout independent of client naming and safe
/// to use as a filename.
#[must_use]
pub fn object_key(name: &str) -> String {
    hex::encode(Sha1::digest(name.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_key_is_sha1_hex() {
        // well-known digest
        assert_eq!(
            object_key("abc"),
            "a9993e364706816aba3e25717850c26c9cd0d89d"
        );
        assert_eq!(object_key("a/b/c.ts").len(), 40);
    }

    #[test]
    fn not_found_is_sentinel() {
        assert!(StoreError::NotFound.is_not_found());
        assert!(!StoreError::Io("boom".into()).is_not_found());
    }
}
