//! Per-request layer trace, emitted as the `Via` response header.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// A single layer visit: the layer's name and how long the call spent in it.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct TraceRecord {
    pub name: String,
    pub elapsed_ms: f64,
}

/// Ordered record of the store layers a request passed through.
///
/// Records are kept outermost-first: each wrapper [`stack`](Trace::stack)s
/// its own record in front of whatever the inner call produced, and the
/// caching store [`merge`](Trace::merge)s the cache-lookup records ahead of
/// the origin records on a miss.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Trace {
    records: Vec<TraceRecord>,
}

impl Trace {
    /// Trace with a single record, created by the innermost layer reached.
    #[must_use]
    pub fn new(name: &str, elapsed: Duration) -> Self {
        Self {
            records: vec![TraceRecord {
                name: name.to_string(),
                elapsed_ms: elapsed.as_secs_f64() * 1e3,
            }],
        }
    }

    /// Prepend the record of the layer that wraps everything recorded so far.
    #[must_use]
    pub fn stack(mut self, name: &str, elapsed: Duration) -> Self {
        self.records.insert(
            0,
            TraceRecord {
                name: name.to_string(),
                elapsed_ms: elapsed.as_secs_f64() * 1e3,
            },
        );
        self
    }

    /// Append the records of a later attempt after this trace's records.
    #[must_use]
    pub fn merge(mut self, tail: Trace) -> Self {
        self.records.extend(tail.records);
        self
    }

    #[must_use]
    pub fn records(&self) -> &[TraceRecord] {
        &self.records
    }

    /// Whether any record was produced by the named layer.
    #[must_use]
    pub fn visited(&self, name: &str) -> bool {
        self.records.iter().any(|r| r.name == name)
    }

    /// JSON array of `{name, elapsed_ms}` records, outermost first.
    #[must_use]
    pub fn serialize(&self) -> String {
        serde_json::to_string(&self.records).unwrap_or_else(|_| "[]".to_string())
    }
}
