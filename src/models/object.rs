//! Metadata index row for a cached object.

use sqlx::any::AnyRow;
use sqlx::{FromRow, Row};

/// One row of the metadata index.
///
/// Tracks what the disk is believed to hold, not the bytes themselves.
/// `stored = true` should mean a file named `key` exists under the object
/// directory; reads that discover otherwise remove the row.
#[derive(Clone, Debug)]
pub struct ObjectRecord {
    /// Internal row id.
    pub id: i64,

    /// 40-char lowercase hex SHA-1 of the external object name. Unique.
    pub key: String,

    /// Object size in bytes.
    pub length: i64,

    /// Whether the bytes are believed present on disk.
    pub stored: bool,

    /// Last successful read, unix seconds. Coarse-grained: refreshed only
    /// when older than the configured threshold.
    pub last_access: i64,
}

impl FromRow<'_, AnyRow> for ObjectRecord {
    // `stored` is a MySQL TINYINT / SQLite INTEGER column; sqlx's `Any`
    // driver only maps it to an integer type, never to `AnyTypeInfoKind::Bool`,
    // so it must be read as `i64` and converted rather than decoded as `bool`.
    fn from_row(row: &AnyRow) -> sqlx::Result<Self> {
        let stored: i64 = row.try_get("stored")?;
        Ok(Self {
            id: row.try_get("id")?,
            key: row.try_get("key")?,
            length: row.try_get("length")?,
            stored: stored != 0,
            last_access: row.try_get("last_access")?,
        })
    }
}
