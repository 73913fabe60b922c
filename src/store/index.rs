//! Persistent metadata index.
//!
//! Maps object keys to [`ObjectRecord`]s in a relational store. Production
//! deployments point this at the MySQL endpoint from the `local_db` config
//! section; tests run the same DML against SQLite files, so every statement
//! sticks to the portable subset (positional `?` binds, backtick-quoted
//! identifiers, `COALESCE` aggregates). Schema DDL is dialect-specific and
//! lives in `migrations/` instead.

use std::sync::Once;

use chrono::Utc;
use sqlx::any::AnyPoolOptions;
use sqlx::AnyPool;

use super::StoreResult;
use crate::models::object::ObjectRecord;

/// Rows fetched per page while scanning for eviction candidates.
const LRU_SCAN_PAGE: i64 = 10_000;

static INSTALL_DRIVERS: Once = Once::new();

pub struct ObjectIndex {
    pool: AnyPool,
}

impl ObjectIndex {
    /// Wrap an existing pool.
    #[must_use]
    pub fn new(pool: AnyPool) -> Self {
        Self { pool }
    }

    /// Connect to the index backend at `url` (`mysql://...` in production,
    /// `sqlite://...` in tests).
    pub async fn connect(url: &str) -> StoreResult<Self> {
        INSTALL_DRIVERS.call_once(sqlx::any::install_default_drivers);
        let pool = AnyPoolOptions::new()
            .min_connections(12)
            .max_connections(32)
            .connect(url)
            .await?;
        Ok(Self::new(pool))
    }

    #[must_use]
    pub fn pool(&self) -> &AnyPool {
        &self.pool
    }

    /// Point lookup by key.
    pub async fn get(&self, key: &str) -> StoreResult<Option<ObjectRecord>> {
        let record = sqlx::query_as::<_, ObjectRecord>(
            "SELECT `id`, `key`, `length`, `stored`, `last_access`
             FROM object WHERE `key` = ?",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    /// Record that `key` is stored on disk with the given length, refreshing
    /// its last-access time. Inserts the row if it does not exist yet.
    pub async fn upsert(&self, key: &str, length: i64) -> StoreResult<()> {
        let now = Utc::now().timestamp();
        let updated = sqlx::query(
            "UPDATE object SET `stored` = ?, `length` = ?, `last_access` = ? WHERE `key` = ?",
        )
        .bind(true)
        .bind(length)
        .bind(now)
        .bind(key)
        .execute(&self.pool)
        .await?;
        if updated.rows_affected() > 0 {
            return Ok(());
        }

        let inserted = sqlx::query(
            "INSERT INTO object (`key`, `stored`, `length`, `last_access`) VALUES (?, ?, ?, ?)",
        )
        .bind(key)
        .bind(true)
        .bind(length)
        .bind(now)
        .execute(&self.pool)
        .await;
        match inserted {
            Ok(_) => Ok(()),
            // lost the insert race; refresh on top of the winner's row
            Err(err) if is_unique_violation(&err) => {
                sqlx::query(
                    "UPDATE object SET `stored` = ?, `length` = ?, `last_access` = ? WHERE `key` = ?",
                )
                .bind(true)
                .bind(length)
                .bind(now)
                .bind(key)
                .execute(&self.pool)
                .await?;
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Refresh the last-access time of `key`.
    pub async fn touch(&self, key: &str) -> StoreResult<()> {
        sqlx::query("UPDATE object SET `last_access` = ? WHERE `key` = ?")
            .bind(Utc::now().timestamp())
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Remove the row for `key`. Removing an absent row is not an error.
    pub async fn delete(&self, key: &str) -> StoreResult<()> {
        sqlx::query("DELETE FROM object WHERE `key` = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Total bytes tracked by the index. `fast` skips the `stored` filter,
    /// equivalent as long as no flow writes `stored = false` rows.
    pub async fn total_size(&self, fast: bool) -> StoreResult<i64> {
        let sql = if fast {
            "SELECT CAST(COALESCE(SUM(`length`), 0) AS SIGNED) FROM object"
        } else {
            "SELECT CAST(COALESCE(SUM(`length`), 0) AS SIGNED) FROM object WHERE `stored` = ?"
        };
        let mut query = sqlx::query_scalar::<_, i64>(sql);
        if !fast {
            query = query.bind(true);
        }
        Ok(query.fetch_one(&self.pool).await?)
    }

    /// Keys of the least-recently-accessed objects whose summed length first
    /// reaches `target_bytes`. Returns every scanned key if the index is too
    /// small to reach the target.
    pub async fn least_recently_accessed(&self, target_bytes: i64) -> StoreResult<Vec<String>> {
        let mut selected = Vec::new();
        if target_bytes <= 0 {
            return Ok(selected);
        }
        let mut accumulated: i64 = 0;
        let mut offset: i64 = 0;
        loop {
            let page = sqlx::query_as::<_, (String, i64)>(
                "SELECT `key`, `length` FROM object
                 ORDER BY `last_access` ASC, `id` ASC LIMIT ? OFFSET ?",
            )
            .bind(LRU_SCAN_PAGE)
            .bind(offset)
            .fetch_all(&self.pool)
            .await?;
            if page.is_empty() {
                return Ok(selected);
            }
            offset += page.len() as i64;
            for (key, length) in page {
                selected.push(key);
                accumulated += length;
                if accumulated >= target_bytes {
                    return Ok(selected);
                }
            }
        }
    }

    /// Close the connection pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => {
            db_err.is_unique_violation() || {
                let msg = db_err.message().to_ascii_lowercase();
                msg.contains("unique") || msg.contains("duplicate entry")
            }
        }
        _ => false,
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::ObjectIndex;
    use tempfile::TempDir;

    /// SQLite rendition of `migrations/0001_init.sql`.
    pub const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS object (
        `id` INTEGER PRIMARY KEY AUTOINCREMENT,
        `key` CHAR(40) NOT NULL UNIQUE,
        `stored` TINYINT(1) NOT NULL DEFAULT 0,
        `length` BIGINT NOT NULL DEFAULT 0,
        `last_access` BIGINT NOT NULL DEFAULT 0
    )";

    /// Fresh file-backed SQLite index. The tempdir must outlive the index.
    pub async fn sqlite_index() -> (TempDir, ObjectIndex) {
        let dir = TempDir::new().unwrap();
        let url = format!("sqlite://{}/meta.db?mode=rwc", dir.path().display());
        let index = ObjectIndex::connect(&url).await.unwrap();
        sqlx::query(SCHEMA).execute(index.pool()).await.unwrap();
        (dir, index)
    }

    /// Rewrite a row's last-access time, for exercising refresh and LRU
    /// behavior without waiting.
    pub async fn set_last_access(index: &ObjectIndex, key: &str, unix: i64) {
        sqlx::query("UPDATE object SET `last_access` = ? WHERE `key` = ?")
            .bind(unix)
            .bind(key)
            .execute(index.pool())
            .await
            .unwrap();
    }
}
