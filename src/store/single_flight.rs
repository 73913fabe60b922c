//! Per-key coalescing of concurrent store calls.
//!
//! For each key, only one physical call is in flight at a time; every other
//! caller subscribes to the leader's outcome. Gets and Puts share one key
//! space, so a Put holds back concurrent Gets of the same key on the same
//! wrapper. The leader runs in its own task and always finishes, even when
//! every waiter has hung up.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{broadcast, Mutex};

use super::{Extras, ObjectStore, StoreError, StoreResult, Trace};

/// Outcome a flight leader publishes to every waiter of the same key.
#[derive(Clone)]
enum FlightOutcome {
    Get(StoreResult<Bytes>, Trace),
    Put(StoreResult<()>),
}

type FlightMap = Arc<Mutex<HashMap<String, broadcast::Sender<FlightOutcome>>>>;

pub struct SingleFlight<S> {
    /// Trace label for this wrapper instance, e.g. `sf_cache`.
    label: &'static str,
    inner: Arc<S>,
    flights: FlightMap,
}

impl<S: ObjectStore + 'static> SingleFlight<S> {
    #[must_use]
    pub fn new(label: &'static str, inner: Arc<S>) -> Self {
        Self {
            label,
            inner,
            flights: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Join the in-flight call for `key`, or install a new one. Returns the
    /// receiver every caller waits on and, for the leader, the sender to
    /// publish with.
    async fn join(
        &self,
        key: &str,
    ) -> (
        broadcast::Receiver<FlightOutcome>,
        Option<broadcast::Sender<FlightOutcome>>,
    ) {
        let mut flights = self.flights.lock().await;
        if let Some(sender) = flights.get(key) {
            return (sender.subscribe(), None);
        }
        let (sender, receiver) = broadcast::channel(1);
        flights.insert(key.to_string(), sender.clone());
        (receiver, Some(sender))
    }
}

/// Remove the flight entry and publish its outcome. Removal happens under
/// the map lock before the send, so no caller can subscribe to an already
/// settled flight.
async fn settle(flights: &FlightMap, key: &str, sender: broadcast::Sender<FlightOutcome>, outcome: FlightOutcome) {
    let mut map = flights.lock().await;
    map.remove(key);
    let _ = sender.send(outcome);
}

#[async_trait]
impl<S: ObjectStore + 'static> ObjectStore for SingleFlight<S> {
    fn name(&self) -> &'static str {
        self.label
    }

    async fn has(&self, key: &str, extras: Extras) -> StoreResult<bool> {
        self.inner.has(key, extras).await
    }

    async fn get(&self, key: &str, extras: Extras) -> (StoreResult<Bytes>, Trace) {
        let start = Instant::now();
        loop {
            let (mut receiver, leader) = self.join(key).await;
            if let Some(sender) = leader {
                let inner = Arc::clone(&self.inner);
                let flights = Arc::clone(&self.flights);
                let key = key.to_string();
                tokio::spawn(async move {
                    let (object, trace) = inner.get(&key, extras).await;
                    settle(&flights, &key, sender, FlightOutcome::Get(object, trace)).await;
                });
            }
            match receiver.recv().await {
                Ok(FlightOutcome::Get(object, trace)) => {
                    // every caller gets its own copy of the leader's trace,
                    // topped with its own wait time
                    return (object, trace.stack(self.label, start.elapsed()));
                }
                // a Put held the key; it has settled now, try again
                Ok(FlightOutcome::Put(_)) => continue,
                Err(_) => {
                    return (
                        Err(StoreError::Internal("flight leader dropped".to_string())),
                        Trace::new(self.label, start.elapsed()),
                    )
                }
            }
        }
    }

    async fn put(&self, key: &str, object: Bytes, extras: Extras) -> StoreResult<()> {
        loop {
            let (mut receiver, leader) = self.join(key).await;
            if let Some(sender) = leader {
                let inner = Arc::clone(&self.inner);
                let flights = Arc::clone(&self.flights);
                let key = key.to_string();
                let object = object.clone();
                tokio::spawn(async move {
                    let result = inner.put(&key, object, extras).await;
                    settle(&flights, &key, sender, FlightOutcome::Put(result)).await;
                });
            }
            match receiver.recv().await {
                Ok(FlightOutcome::Put(result)) => return result,
                Ok(FlightOutcome::Get(_, _)) => continue,
                Err(_) => return Err(StoreError::Internal("flight leader dropped".to_string())),
            }
        }
    }

    async fn delete(&self, key: &str, extras: Extras) -> StoreResult<()> {
        self.inner.delete(key, extras).await
    }

    async fn shutdown(&self) {
        self.inner.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Store that counts physical calls and answers after a fixed delay.
    struct SlowStore {
        gets: AtomicUsize,
        puts: AtomicUsize,
        delay: Duration,
        fail: bool,
    }

    impl SlowStore {
        fn new(delay: Duration, fail: bool) -> Self {
            Self {
                gets: AtomicUsize::new(0),
                puts: AtomicUsize::new(0),
                delay,
                fail,
            }
        }
    }

    #[async_trait]
    impl ObjectStore for SlowStore {
        fn name(&self) -> &'static str {
            "slow"
        }

        async fn has(&self, _key: &str, _extras: Extras) -> StoreResult<bool> {
            Ok(true)
        }

        async fn get(&self, key: &str, _extras: Extras) -> (StoreResult<Bytes>, Trace) {
            self.gets.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            let trace = Trace::new("slow", self.delay);
            if self.fail {
                return (Err(StoreError::Io("boom".to_string())), trace);
            }
            (Ok(Bytes::from(format!("object:{key}"))), trace)
        }

        async fn put(&self, _key: &str, _object: Bytes, _extras: Extras) -> StoreResult<()> {
            self.puts.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            Ok(())
        }

        async fn delete(&self, _key: &str, _extras: Extras) -> StoreResult<()> {
            Ok(())
        }

        async fn shutdown(&self) {}
    }

    #[tokio::test]
    async fn concurrent_gets_share_one_physical_call() {
        let inner = Arc::new(SlowStore::new(Duration::from_millis(50), false));
        let wrapper = Arc::new(SingleFlight::new("sf_cache", Arc::clone(&inner)));

        let callers: Vec<_> = (0..50)
            .map(|_| {
                let wrapper = Arc::clone(&wrapper);
                tokio::spawn(async move { wrapper.get("k", Extras::None).await })
            })
            .collect();
        for caller in callers {
            let (object, trace) = caller.await.unwrap();
            assert_eq!(object.unwrap(), Bytes::from_static(b"object:k"));
            assert!(trace.visited("sf_cache"));
            assert!(trace.visited("slow"));
        }
        assert_eq!(inner.gets.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn distinct_keys_do_not_coalesce() {
        let inner = Arc::new(SlowStore::new(Duration::from_millis(10), false));
        let wrapper = Arc::new(SingleFlight::new("sf_cache", Arc::clone(&inner)));

        let (a, b) = tokio::join!(wrapper.get("a", Extras::None), wrapper.get("b", Extras::None));
        assert_eq!(a.0.unwrap(), Bytes::from_static(b"object:a"));
        assert_eq!(b.0.unwrap(), Bytes::from_static(b"object:b"));
        assert_eq!(inner.gets.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn errors_fan_out_to_every_waiter() {
        let inner = Arc::new(SlowStore::new(Duration::from_millis(30), true));
        let wrapper = Arc::new(SingleFlight::new("sf_origin", Arc::clone(&inner)));

        let callers: Vec<_> = (0..5)
            .map(|_| {
                let wrapper = Arc::clone(&wrapper);
                tokio::spawn(async move { wrapper.get("k", Extras::None).await })
            })
            .collect();
        for caller in callers {
            let (object, _) = caller.await.unwrap();
            assert_eq!(object.unwrap_err(), StoreError::Io("boom".to_string()));
        }
        assert_eq!(inner.gets.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_puts_coalesce() {
        let inner = Arc::new(SlowStore::new(Duration::from_millis(30), false));
        let wrapper = Arc::new(SingleFlight::new("sf_cache", Arc::clone(&inner)));

        let callers: Vec<_> = (0..10)
            .map(|_| {
                let wrapper = Arc::clone(&wrapper);
                tokio::spawn(async move {
                    wrapper
                        .put("k", Bytes::from_static(b"x"), Extras::None)
                        .await
                })
            })
            .collect();
        for caller in callers {
            caller.await.unwrap().unwrap();
        }
        assert_eq!(inner.puts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn get_during_put_of_same_key_waits_then_succeeds() {
        let inner = Arc::new(SlowStore::new(Duration::from_millis(40), false));
        let wrapper = Arc::new(SingleFlight::new("sf_cache", Arc::clone(&inner)));

        let put_wrapper = Arc::clone(&wrapper);
        let put = tokio::spawn(async move {
            put_wrapper
                .put("k", Bytes::from_static(b"x"), Extras::None)
                .await
        });
        // let the put take the flight slot first
        tokio::time::sleep(Duration::from_millis(5)).await;
        let (object, _) = wrapper.get("k", Extras::None).await;
        object.unwrap();
        put.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn leader_finishes_after_waiters_hang_up() {
        let inner = Arc::new(SlowStore::new(Duration::from_millis(50), false));
        let wrapper = Arc::new(SingleFlight::new("sf_cache", Arc::clone(&inner)));

        let abandoned = {
            let wrapper = Arc::clone(&wrapper);
            tokio::spawn(async move { wrapper.get("k", Extras::None).await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        abandoned.abort();

        tokio::time::sleep(Duration::from_millis(80)).await;
        // the physical call completed once; a fresh get starts a new flight
        assert_eq!(inner.gets.load(Ordering::SeqCst), 1);
        let (object, _) = wrapper.get("k", Extras::None).await;
        object.unwrap();
        assert_eq!(inner.gets.load(Ordering::SeqCst), 2);
    }
}
