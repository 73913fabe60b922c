//! JSON configuration file and CLI arguments.

use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;

const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(120);

/// Command-line arguments.
#[derive(Parser, Debug)]
#[command(author, version, about = "Disk-backed edge cache for immutable objects")]
pub struct Args {
    /// Path to the JSON configuration file
    #[arg(long, default_value = "config.json")]
    pub config: String,

    /// Run database migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

/// Top-level configuration, loaded once at startup.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Origin buckets in bucket-index order.
    pub s3_origins: Vec<S3OriginConfig>,
    /// Metadata index backend.
    pub local_db: DbConfig,
    /// Local cache directory and budget.
    pub disk_cache: DiskCacheConfig,
    /// Seconds between eviction passes; <= 0 means the 120 s default.
    #[serde(default)]
    pub cleanup_interval_seconds: i64,
    /// Optional alert channel token.
    #[serde(default)]
    pub slack_token: Option<String>,
    #[serde(default = "default_listen_address")]
    pub listen_address: String,
    /// Size of the fetch worker pool.
    #[serde(default = "default_http_workers")]
    pub http_workers: usize,
    /// Reads older than this refresh the index's last-access time.
    #[serde(default = "default_touch_refresh_seconds")]
    pub touch_refresh_seconds: u64,
    /// Extra percentage of used space pruned beyond the overage, so the next
    /// tick does not immediately re-trigger.
    #[serde(default = "default_eviction_headroom_percent")]
    pub eviction_headroom_percent: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct S3OriginConfig {
    pub id: String,
    pub secret: String,
    pub region: String,
    pub bucket: String,
    pub endpoint: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DbConfig {
    pub host: String,
    pub user: String,
    pub database: String,
    pub password: String,
}

impl DbConfig {
    /// Connection URL for the metadata index. `host` may carry an explicit
    /// port; the MySQL default is assumed otherwise.
    #[must_use]
    pub fn url(&self) -> String {
        let host = if self.host.contains(':') {
            self.host.clone()
        } else {
            format!("{}:3306", self.host)
        };
        format!(
            "mysql://{}:{}@{}/{}",
            self.user, self.password, host, self.database
        )
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DiskCacheConfig {
    pub path: String,
    /// Human-readable byte quantity, e.g. "500 GB".
    pub size: String,
}

impl DiskCacheConfig {
    pub fn max_bytes(&self) -> Result<i64> {
        let size = parse_size(&self.size)
            .map_err(|err| anyhow::anyhow!("disk cache size for \"{}\": {err}", self.path))?;
        if size == 0 {
            anyhow::bail!("disk cache size for \"{}\" must be more than 0", self.path);
        }
        Ok(size as i64)
    }
}

fn default_listen_address() -> String {
    "0.0.0.0:2222".to_string()
}

fn default_http_workers() -> usize {
    4_000
}

fn default_touch_refresh_seconds() -> u64 {
    6 * 3600
}

fn default_eviction_headroom_percent() -> i64 {
    5
}

impl Config {
    /// Load and validate the configuration file.
    pub fn load(path: &str) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {path}"))?;
        let config: Self = serde_json::from_str(&raw)
            .with_context(|| format!("parsing config file {path}"))?;
        if config.s3_origins.is_empty() {
            anyhow::bail!("config must list at least one bucket in s3_origins");
        }
        config.disk_cache.max_bytes()?;
        Ok(config)
    }

    #[must_use]
    pub fn cleanup_interval(&self) -> Duration {
        if self.cleanup_interval_seconds <= 0 {
            DEFAULT_CLEANUP_INTERVAL
        } else {
            Duration::from_secs(self.cleanup_interval_seconds as u64)
        }
    }

    #[must_use]
    pub fn touch_refresh(&self) -> Duration {
        Duration::from_secs(self.touch_refresh_seconds)
    }
}

/// Parse a human-readable byte quantity: "4096", "500 GB", "1.5T", "512MiB".
/// Unit multipliers are binary.
pub fn parse_size(raw: &str) -> std::result::Result<u64, String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err("empty size string".to_string());
    }
    let split = raw
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(raw.len());
    let (number, unit) = raw.split_at(split);
    let multiplier: u64 = match unit.trim().to_ascii_uppercase().as_str() {
        "" | "B" => 1,
        "K" | "KB" | "KIB" => 1 << 10,
        "M" | "MB" | "MIB" => 1 << 20,
        "G" | "GB" | "GIB" => 1 << 30,
        "T" | "TB" | "TIB" => 1 << 40,
        "P" | "PB" | "PIB" => 1 << 50,
        other => return Err(format!("unknown size unit `{other}`")),
    };
    let value: f64 = number
        .parse()
        .map_err(|_| format!("invalid size number `{number}`"))?;
    if value < 0.0 {
        return Err("size cannot be negative".to_string());
    }
    Ok((value * multiplier as f64) as u64)
}
