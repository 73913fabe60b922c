//! Bounded record of recently-missed object names.
//!
//! A name that 404'd at the origin is remembered here for a short TTL so
//! repeat lookups are answered without touching the store stack at all. Not
//! persistent, capped in size, and only ever an optimization: entries expire
//! on read.

use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use lru::LruCache;

const CAPACITY: usize = 100_000;
const TTL: Duration = Duration::from_secs(5 * 60);

pub struct NegativeCache {
    entries: Mutex<LruCache<String, Instant>>,
    ttl: Duration,
}

impl NegativeCache {
    #[must_use]
    pub fn new() -> Self {
        Self::with_limits(CAPACITY, TTL)
    }

    #[must_use]
    pub fn with_limits(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            ttl,
        }
    }

    /// Whether `name` was observed missing within the TTL.
    pub fn has(&self, name: &str) -> bool {
        let mut entries = self.entries.lock().unwrap();
        match entries.get(name) {
            Some(seen) if seen.elapsed() < self.ttl => true,
            Some(_) => {
                entries.pop(name);
                false
            }
            None => false,
        }
    }

    /// Record that `name` was just observed missing.
    pub fn insert(&self, name: &str) {
        self.entries
            .lock()
            .unwrap()
            .push(name.to_string(), Instant::now());
    }
}

impl Default for NegativeCache {
    fn default() -> Self {
        Self::new()
    }
}
