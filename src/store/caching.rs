//! Two-tier store: a local cache in front of an origin.
//!
//! Objects are addressed by external name at the origin and by the SHA-1 key
//! of that name in the cache, so the disk layout never depends on client
//! naming. Misses fall through to the origin and are admitted into the cache
//! synchronously before the response returns; an async fill would allow
//! double-fill races and unbounded concurrent writes under miss storms. Both
//! tiers sit behind their own single-flight wrapper, so miss-then-fill is
//! coalesced independently at each layer.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::error;

use super::{object_key, Extras, ObjectStore, SingleFlight, StoreResult, Trace};

const NAME: &str = "caching";

pub struct CachingStore<O, C> {
    origin: SingleFlight<O>,
    cache: SingleFlight<C>,
}

impl<O, C> CachingStore<O, C>
where
    O: ObjectStore + 'static,
    C: ObjectStore + 'static,
{
    #[must_use]
    pub fn new(origin: Arc<O>, cache: Arc<C>) -> Self {
        Self {
            origin: SingleFlight::new("sf_origin", origin),
            cache: SingleFlight::new("sf_cache", cache),
        }
    }
}

#[async_trait]
impl<O, C> ObjectStore for CachingStore<O, C>
where
    O: ObjectStore + 'static,
    C: ObjectStore + 'static,
{
    fn name(&self) -> &'static str {
        NAME
    }

    /// True if either tier has the object. Short-circuits on the first hit
    /// or error.
    async fn has(&self, name: &str, extras: Extras) -> StoreResult<bool> {
        let has = self.cache.has(&object_key(name), Extras::None).await?;
        if has {
            return Ok(true);
        }
        self.origin.has(name, extras).await
    }

    async fn get(&self, name: &str, extras: Extras) -> (StoreResult<Bytes>, Trace) {
        let start = Instant::now();
        let key = object_key(name);

        let (cached, cache_trace) = self.cache.get(&key, Extras::None).await;
        match cached {
            Ok(object) => return (Ok(object), cache_trace.stack(NAME, start.elapsed())),
            Err(err) if !err.is_not_found() => {
                return (Err(err), cache_trace.stack(NAME, start.elapsed()))
            }
            Err(_) => {}
        }

        let (fetched, origin_trace) = self.origin.get(name, extras).await;
        let trace = cache_trace.merge(origin_trace);
        let object = match fetched {
            Ok(object) => object,
            Err(err) => return (Err(err), trace.stack(NAME, start.elapsed())),
        };

        // do not make this write async unless you are prepared for mayhem
        if let Err(err) = self.cache.put(&key, object.clone(), Extras::None).await {
            error!("error saving {key} to the cache: {err}");
        }
        (Ok(object), trace.stack(NAME, start.elapsed()))
    }

    /// Store in the origin, then the cache. Origin failure short-circuits;
    /// cache failure is surfaced.
    async fn put(&self, name: &str, object: Bytes, extras: Extras) -> StoreResult<()> {
        self.origin.put(name, object.clone(), extras).await?;
        self.cache.put(&object_key(name), object, Extras::None).await
    }

    async fn delete(&self, name: &str, extras: Extras) -> StoreResult<()> {
        self.origin.delete(name, extras).await?;
        self.cache.delete(&object_key(name), Extras::None).await
    }

    async fn shutdown(&self) {
        self.origin.shutdown().await;
        self.cache.shutdown().await;
    }
}
