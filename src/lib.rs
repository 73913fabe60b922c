//! Disk-backed edge cache for immutable objects.
//!
//! Serves named binary objects over HTTP from a fast local disk, filling
//! misses from one or more S3-compatible origin buckets and evicting
//! least-recently-accessed entries when the disk budget is exceeded.

pub mod cleanup;
pub mod config;
pub mod errors;
pub mod models;
pub mod server;
pub mod store;
