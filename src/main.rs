use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use edge_store::cleanup;
use edge_store::config::{Args, Config};
use edge_store::server::Server;
use edge_store::store::{
    CachingStore, DiskStore, IndexedStore, MultiS3Store, ObjectIndex, ObjectStore,
};

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let config = Config::load(&args.config)?;
    info!("starting edge-store with {} origin bucket(s)", config.s3_origins.len());

    // --- Metadata index ---
    let index = ObjectIndex::connect(&config.local_db.url())
        .await
        .context("connecting to the metadata database")?;

    if args.migrate {
        run_migrations(&index).await?;
        info!("database migration complete");
        return Ok(());
    }

    // --- Store stack: disk -> indexed local -> caching over multi-S3 ---
    let max_bytes = config.disk_cache.max_bytes()?;
    let disk = DiskStore::new(&config.disk_cache.path, 2)
        .await
        .context("initializing the cache directory")?;
    let index = Arc::new(index);
    let local = Arc::new(IndexedStore::new(
        disk,
        Arc::clone(&index),
        config.touch_refresh(),
    ));
    let origin = Arc::new(MultiS3Store::new(&config.s3_origins));
    let store = Arc::new(CachingStore::new(origin, Arc::clone(&local)));

    let shutdown = CancellationToken::new();

    // --- Background eviction ---
    let cleanup_task = tokio::spawn(cleanup::run(
        Arc::clone(&index),
        local,
        cleanup::CleanupParams {
            path: config.disk_cache.path.clone().into(),
            max_bytes,
            interval: config.cleanup_interval(),
            headroom_percent: config.eviction_headroom_percent,
        },
        shutdown.clone(),
    ));

    // --- Signal handling ---
    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutdown signal received");
        signal_shutdown.cancel();
    });

    // --- HTTP server ---
    let server = Server::new(
        Arc::clone(&store) as Arc<dyn ObjectStore>,
        config.http_workers,
        shutdown.clone(),
    );
    server.serve(&config.listen_address, shutdown.clone()).await?;

    // serve returned: the shutdown signal fired and connections drained
    if let Err(err) = cleanup_task.await {
        error!("cleanup task failed: {err}");
    }
    store.shutdown().await;
    info!("shutdown complete");
    Ok(())
}

/// Apply the SQL statements in `migrations/0001_init.sql`.
async fn run_migrations(index: &ObjectIndex) -> Result<()> {
    let path = "migrations/0001_init.sql";
    let sql = std::fs::read_to_string(path)
        .with_context(|| format!("reading migration file {path}"))?;
    let statements: Vec<&str> = sql
        .split(';')
        .map(str::trim)
        .filter(|stmt| !stmt.is_empty())
        .collect();

    info!("running {} migration statements", statements.len());
    for statement in statements {
        sqlx::query(statement)
            .execute(index.pool())
            .await
            .with_context(|| format!("executing migration statement `{statement}`"))?;
    }
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(err) => {
                error!("failed to install SIGTERM handler: {err}");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
