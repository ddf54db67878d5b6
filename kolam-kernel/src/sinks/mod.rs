/**
 * SINKS - storage backends behind the persistence fan-out
 *
 * ROLE:
 * Three interfaces with different retention and access characteristics:
 * - TimeSeriesSink = tagged points for trend queries (InfluxDB)
 * - FastCache      = key -> JSON with expiry, latest values
 * - DocumentStore  = durable collections, append + upsert-by-id + field queries
 *
 * Every backend is constructed once at startup and shared as `Arc<dyn ...>`.
 */

pub mod cache;
pub mod documents;
pub mod influx;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use time::OffsetDateTime;

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("{sink} unavailable: {reason}")]
    Unavailable { sink: &'static str, reason: String },
    #[error("{sink} rejected write ({status}): {body}")]
    Rejected { sink: &'static str, status: u16, body: String },
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// One time-series point.
#[derive(Debug, Clone, PartialEq)]
pub struct Point {
    pub measurement: String,
    /// Tag set, in insertion order.
    pub tags: Vec<(String, String)>,
    pub fields: Vec<(String, f64)>,
    pub timestamp: OffsetDateTime,
}

impl Point {
    pub fn new(measurement: impl Into<String>, timestamp: OffsetDateTime) -> Self {
        Self { measurement: measurement.into(), tags: Vec::new(), fields: Vec::new(), timestamp }
    }

    pub fn tag(mut self, key: &str, value: impl Into<String>) -> Self {
        self.tags.push((key.to_string(), value.into()));
        self
    }

    pub fn field(mut self, key: &str, value: f64) -> Self {
        self.fields.push((key.to_string(), value));
        self
    }
}

#[async_trait]
pub trait TimeSeriesSink: Send + Sync {
    async fn write_point(&self, point: &Point) -> Result<(), SinkError>;
}

#[async_trait]
pub trait FastCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>, SinkError>;
    /// Overwrites any previous value under `key`.
    async fn set_ex(&self, key: &str, value: Value, ttl: Duration) -> Result<(), SinkError>;
}

/// Stored document: generated id + storage time + JSON body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub stored_at: OffsetDateTime,
    pub data: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// Top-level array field contains the value.
    ArrayContains(String, Value),
}

impl Filter {
    pub fn matches(&self, data: &Value) -> bool {
        match self {
            Filter::ArrayContains(field, value) => data
                .get(field)
                .and_then(Value::as_array)
                .is_some_and(|items| items.contains(value)),
        }
    }
}

/// Query over one collection. Results are newest first.
#[derive(Debug, Clone, PartialEq)]
pub struct DocQuery {
    pub filters: Vec<Filter>,
    pub limit: Option<usize>,
}

impl Default for DocQuery {
    fn default() -> Self {
        Self { filters: Vec::new(), limit: Some(100) }
    }
}

impl DocQuery {
    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn limit(mut self, limit: Option<usize>) -> Self {
        self.limit = limit;
        self
    }
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Appends a new document and returns its generated id.
    async fn insert(&self, collection: &str, data: Value) -> Result<String, SinkError>;
    /// Creates `id` or merges the top-level fields of `data` into it.
    async fn upsert(&self, collection: &str, id: &str, data: Value) -> Result<(), SinkError>;
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>, SinkError>;
    async fn query(&self, collection: &str, query: &DocQuery) -> Result<Vec<Document>, SinkError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_filters() {
        let user = json!({"name": "Sari", "assignedPonds": ["pond-a", "pond-c"], "role": "operator"});
        assert!(Filter::ArrayContains("assignedPonds".into(), json!("pond-c")).matches(&user));
        assert!(!Filter::ArrayContains("assignedPonds".into(), json!("pond-b")).matches(&user));
        assert!(!Filter::ArrayContains("name".into(), json!("Sari")).matches(&user));
    }

    #[test]
    fn test_default_query_is_bounded() {
        assert_eq!(DocQuery::default().limit, Some(100));
        assert_eq!(DocQuery::default().limit(None).limit, None);
    }
}
