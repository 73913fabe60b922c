//! Bounded admission queue and the worker pool that drains it.
//!
//! Every fetch is enqueued with a completion channel and executed by a fixed
//! pool of workers, so a miss storm amplifying into slow origin reads is
//! bounded by the pool size while the queue applies backpressure to the HTTP
//! framework. Panics inside a request are caught and answered with a 500;
//! the worker survives.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use futures::FutureExt;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::error;

use super::handlers::handle_get;
use super::negative_cache::NegativeCache;
use crate::store::{Extras, ObjectStore};

/// Admission queue capacity. Enqueueing blocks once this many fetches are
/// waiting.
pub const QUEUE_CAPACITY: usize = 20_000;

/// One queued fetch. `reply` is released when the worker has built the full
/// response, so the HTTP handler does not return before the work is done.
pub struct GetJob {
    pub name: String,
    pub extras: Extras,
    pub reply: oneshot::Sender<Response>,
}

/// Spawn `count` workers draining a fresh admission queue; returns the
/// enqueue side.
pub fn spawn_workers(
    count: usize,
    store: Arc<dyn ObjectStore>,
    misses: Arc<NegativeCache>,
    shutdown: CancellationToken,
) -> mpsc::Sender<GetJob> {
    let (queue, drain) = mpsc::channel::<GetJob>(QUEUE_CAPACITY);
    let drain = Arc::new(Mutex::new(drain));
    for _ in 0..count {
        let drain = Arc::clone(&drain);
        let store = Arc::clone(&store);
        let misses = Arc::clone(&misses);
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                let job = tokio::select! {
                    _ = shutdown.cancelled() => return,
                    job = async { drain.lock().await.recv().await } => job,
                };
                let Some(job) = job else { return };
                let response =
                    AssertUnwindSafe(handle_get(&store, &misses, &job.name, job.extras))
                        .catch_unwind()
                        .await
                        .unwrap_or_else(|panic| {
                            error!("recovered from panic while serving {}: {panic:?}", job.name);
                            StatusCode::INTERNAL_SERVER_ERROR.into_response()
                        });
                // the requester may have hung up; that is fine
                let _ = job.reply.send(response);
            }
        });
    }
    queue
}
