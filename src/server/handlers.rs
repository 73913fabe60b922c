//! HTTP handlers for object fetch and existence checks.
//!
//! `GET /t-na/<name>` goes through the bounded admission queue; the worker
//! pool runs [`handle_get`] and hands the finished response back through a
//! completion channel. `GET /has` is metadata-only and bypasses the queue.

use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use tokio::sync::oneshot;
use tracing::error;

use super::negative_cache::NegativeCache;
use super::worker::GetJob;
use super::AppState;
use crate::errors::AppError;
use crate::store::{Extras, ObjectStore, Trace};

/// Closed whitelist of `origin` query aliases. Unknown or absent aliases
/// fall back to bucket index 0.
const ORIGIN_ALIASES: &[(&str, usize)] = &[("legacy", 0), ("wasabi", 1)];

const VIA_HEADER: &str = "Via";

#[derive(Debug, Deserialize)]
pub struct GetObjectQuery {
    pub origin: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct HasObjectQuery {
    pub object: String,
}

fn resolve_origin_alias(alias: Option<&str>) -> usize {
    alias
        .and_then(|alias| ORIGIN_ALIASES.iter().find(|(name, _)| *name == alias))
        .map_or(0, |(_, index)| *index)
}

/// Enqueue the fetch and wait for a worker to finish it. Blocking on a full
/// queue is the backpressure: the HTTP framework times out upstream clients
/// as configured.
pub async fn get_object(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<GetObjectQuery>,
) -> Response {
    let index = resolve_origin_alias(query.origin.as_deref());
    let (reply, finished) = oneshot::channel();
    let job = GetJob {
        name,
        extras: Extras::MultiBucket { index },
        reply,
    };
    if state.queue.send(job).await.is_err() {
        return AppError::internal("server is shutting down").into_response();
    }
    match finished.await {
        Ok(response) => response,
        Err(_) => AppError::internal("request worker went away").into_response(),
    }
}

/// The fetch pipeline run by the worker pool.
pub(super) async fn handle_get(
    store: &Arc<dyn ObjectStore>,
    misses: &NegativeCache,
    name: &str,
    extras: Extras,
) -> Response {
    let start = Instant::now();
    if misses.has(name) {
        return with_via(StatusCode::NOT_FOUND, &Trace::new("http", start.elapsed()))
            .body(Body::empty())
            .unwrap_or_else(|_| StatusCode::NOT_FOUND.into_response());
    }

    let (object, trace) = store.get(name, extras).await;
    let trace = trace.stack("http", start.elapsed());
    match object {
        Ok(object) => {
            let filename = name.rsplit('/').next().unwrap_or(name);
            with_via(StatusCode::OK, &trace)
                .header(header::CONTENT_TYPE, "application/octet-stream")
                .header(
                    header::CONTENT_DISPOSITION,
                    HeaderValue::from_str(&format!("filename={filename}"))
                        .unwrap_or_else(|_| HeaderValue::from_static("filename=object")),
                )
                .body(Body::from(object))
                .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
        }
        Err(err) if err.is_not_found() => {
            misses.insert(name);
            with_via(StatusCode::NOT_FOUND, &trace)
                .body(Body::empty())
                .unwrap_or_else(|_| StatusCode::NOT_FOUND.into_response())
        }
        Err(err) => {
            error!("error fetching {name}: {err}");
            with_via(StatusCode::INTERNAL_SERVER_ERROR, &trace)
                .body(Body::from(err.to_string()))
                .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
        }
    }
}

fn with_via(status: StatusCode, trace: &Trace) -> axum::http::response::Builder {
    let serialized = trace.serialize();
    let via = HeaderValue::from_str(&serialized).unwrap_or_else(|_| HeaderValue::from_static("[]"));
    axum::http::Response::builder()
        .status(status)
        .header(VIA_HEADER, via)
}

/// Metadata-only existence check: 204 if present, 404 if absent.
pub async fn has_object(
    State(state): State<AppState>,
    Query(query): Query<HasObjectQuery>,
) -> Response {
    match state
        .store
        .has(&query.object, Extras::MultiBucket { index: 0 })
        .await
    {
        Ok(true) => StatusCode::NO_CONTENT.into_response(),
        Ok(false) => StatusCode::NOT_FOUND.into_response(),
        Err(err) => {
            error!("error checking {}: {err}", query.object);
            AppError::from_store(&err).into_response()
        }
    }
}

/// Liveness probe.
pub async fn healthz() -> StatusCode {
    StatusCode::OK
}
