//! HTTP serving pipeline.
//!
//! Assembles the router, the negative-lookup cache, and the admission queue
//! with its worker pool around a caching store.

pub mod handlers;
pub mod negative_cache;
pub mod worker;

use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::store::ObjectStore;
use negative_cache::NegativeCache;
use worker::GetJob;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn ObjectStore>,
    pub misses: Arc<NegativeCache>,
    pub queue: mpsc::Sender<GetJob>,
}

pub struct Server {
    state: AppState,
}

impl Server {
    /// Wire the worker pool and negative cache around `store`.
    #[must_use]
    pub fn new(store: Arc<dyn ObjectStore>, workers: usize, shutdown: CancellationToken) -> Self {
        let misses = Arc::new(NegativeCache::new());
        let queue = worker::spawn_workers(
            workers,
            Arc::clone(&store),
            Arc::clone(&misses),
            shutdown,
        );
        Self {
            state: AppState {
                store,
                misses,
                queue,
            },
        }
    }

    #[must_use]
    pub fn router(&self) -> Router {
        Router::new()
            .route("/healthz", get(handlers::healthz))
            .route("/t-na/{*name}", get(handlers::get_object))
            .route("/has", get(handlers::has_object))
            .with_state(self.state.clone())
    }

    /// Serve until the shutdown token fires, then drain gracefully.
    pub async fn serve(&self, addr: &str, shutdown: CancellationToken) -> anyhow::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        info!("server listening on http://{addr}");
        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;
        Ok(())
    }
}
