//! Background eviction against the disk budget.
//!
//! A single loop per node measures local usage, and when it exceeds the
//! configured budget prunes the least-recently-accessed objects until usage
//! should land below budget again, with some headroom so the next tick does
//! not immediately re-trigger. Pruning goes through the indexed local store
//! only; the origin is authoritative and is never purged.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::store::{Extras, IndexedStore, ObjectIndex, ObjectStore, StoreError, StoreResult};

/// Workers draining the prune queue.
const PRUNE_WORKERS: usize = 3;

/// Env var selecting the index-based usage measurement over walking the
/// object directory.
const SPACE_USE_DB: &str = "SPACE_USE_DB";

#[derive(Clone, Debug)]
pub struct CleanupParams {
    /// Object directory being measured.
    pub path: PathBuf,
    /// Disk budget in bytes.
    pub max_bytes: i64,
    /// Time between passes.
    pub interval: Duration,
    /// Extra percentage of used space pruned beyond the overage.
    pub headroom_percent: i64,
}

/// Run eviction until shutdown: one pass immediately (a full disk should not
/// wait out the first interval), then one per tick.
pub async fn run(
    index: Arc<ObjectIndex>,
    local: Arc<IndexedStore>,
    params: CleanupParams,
    shutdown: CancellationToken,
) {
    if let Err(err) = sweep(&index, &local, &params, &shutdown).await {
        error!("cleanup pass failed: {err}");
    }
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("stopping self cleanup");
                return;
            }
            _ = tokio::time::sleep(params.interval) => {
                if let Err(err) = sweep(&index, &local, &params, &shutdown).await {
                    error!("cleanup pass failed: {err}");
                }
            }
        }
    }
}

/// One measurement-and-prune pass.
pub async fn sweep(
    index: &Arc<ObjectIndex>,
    local: &Arc<IndexedStore>,
    params: &CleanupParams,
    shutdown: &CancellationToken,
) -> StoreResult<()> {
    let used = used_space(index, &params.path).await?;
    if used < params.max_bytes {
        return Ok(());
    }
    let started = Instant::now();
    let prune_bytes = used - params.max_bytes + used * params.headroom_percent / 100;
    let keys = index.least_recently_accessed(prune_bytes).await?;
    info!(
        "cleanup triggered: used {used}B, max {}B, pruning {prune_bytes}B across {} objects",
        params.max_bytes,
        keys.len()
    );

    // buffered to the batch size so the feeder below never blocks
    let (feed, drain) = mpsc::channel::<String>(keys.len().max(1));
    let drain = Arc::new(Mutex::new(drain));
    let mut workers = JoinSet::new();
    for _ in 0..PRUNE_WORKERS {
        let drain = Arc::clone(&drain);
        let local = Arc::clone(local);
        let shutdown = shutdown.clone();
        workers.spawn(async move {
            loop {
                if shutdown.is_cancelled() {
                    return;
                }
                let key = { drain.lock().await.recv().await };
                let Some(key) = key else { return };
                if let Err(err) = local.delete(&key, Extras::None).await {
                    error!("error pruning {key}: {err}");
                }
            }
        });
    }

    for key in keys {
        if shutdown.is_cancelled() {
            break;
        }
        if feed.send(key).await.is_err() {
            break;
        }
    }
    drop(feed);
    while workers.join_next().await.is_some() {}

    info!("cleanup finished - it took {:?}", started.elapsed());
    Ok(())
}

/// Bytes used by the local cache. Walks the object directory by default;
/// `SPACE_USE_DB=true` trusts the index total instead.
async fn used_space(index: &ObjectIndex, path: &Path) -> StoreResult<i64> {
    let use_db = std::env::var(SPACE_USE_DB)
        .ok()
        .and_then(|raw| raw.parse::<bool>().ok())
        .unwrap_or(false);
    if use_db {
        return index.total_size(true).await;
    }

    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || walk_size(&path))
        .await
        .map_err(|err| StoreError::Internal(err.to_string()))?
}

fn walk_size(path: &Path) -> StoreResult<i64> {
    let mut total: i64 = 0;
    let mut pending = vec![path.to_path_buf()];
    while let Some(dir) = pending.pop() {
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let meta = entry.metadata()?;
            if meta.is_dir() {
                pending.push(entry.path());
            } else {
                total += meta.len() as i64;
            }
        }
    }
    Ok(total)
}
