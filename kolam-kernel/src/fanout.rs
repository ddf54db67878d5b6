//! Persistence fan-out: one reading, three independent sinks.
//!
//! The writes run concurrently, each under its own timeout. A failing sink is
//! logged and reported; it never blocks or rolls back the others.

use crate::models::{DeviceStatus, Reading};
use crate::sinks::{DocumentStore, FastCache, Point, SinkError, TimeSeriesSink};
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

pub const SENSOR_MEASUREMENT: &str = "sensor_reading";
pub const SENSOR_COLLECTION: &str = "sensor_data";
pub const DEVICE_STATUS_COLLECTION: &str = "device_status";

pub fn latest_sensor_key(pond_id: &str) -> String {
    format!("latest_sensor:{pond_id}")
}

pub fn device_status_key(device_id: &str) -> String {
    format!("device_status:{device_id}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkKind {
    TimeSeries,
    Cache,
    Durable,
}

impl fmt::Display for SinkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SinkKind::TimeSeries => "time_series",
            SinkKind::Cache => "cache",
            SinkKind::Durable => "durable",
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SinkStatus {
    Written,
    Failed(String),
    TimedOut,
}

impl SinkStatus {
    pub fn is_written(&self) -> bool {
        matches!(self, SinkStatus::Written)
    }
}

/// Per-sink outcome of persisting one reading.
#[derive(Debug, Clone, PartialEq)]
pub struct FanOutReport {
    pub time_series: SinkStatus,
    pub cache: SinkStatus,
    pub durable: SinkStatus,
}

impl FanOutReport {
    pub fn statuses(&self) -> [(SinkKind, &SinkStatus); 3] {
        [
            (SinkKind::TimeSeries, &self.time_series),
            (SinkKind::Cache, &self.cache),
            (SinkKind::Durable, &self.durable),
        ]
    }

    pub fn is_complete(&self) -> bool {
        self.statuses().iter().all(|(_, s)| s.is_written())
    }

    pub fn failed_sinks(&self) -> Vec<SinkKind> {
        self.statuses()
            .into_iter()
            .filter(|(_, s)| !s.is_written())
            .map(|(kind, _)| kind)
            .collect()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FanOutError {
    #[error("every sink timed out after {0:?}")]
    AllSinksTimedOut(Duration),
}

#[derive(Debug, Clone, PartialEq)]
pub struct StatusReport {
    pub cache: SinkStatus,
    pub durable: SinkStatus,
}

pub struct PersistenceFanOut {
    time_series: Arc<dyn TimeSeriesSink>,
    cache: Arc<dyn FastCache>,
    store: Arc<dyn DocumentStore>,
    timeout: Duration,
    latest_ttl: Duration,
    status_ttl: Duration,
}

impl PersistenceFanOut {
    pub fn new(time_series: Arc<dyn TimeSeriesSink>, cache: Arc<dyn FastCache>, store: Arc<dyn DocumentStore>) -> Self {
        Self {
            time_series,
            cache,
            store,
            timeout: Duration::from_secs(2),
            latest_ttl: Duration::from_secs(3_600),
            status_ttl: Duration::from_secs(1_800),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_ttls(mut self, latest: Duration, device_status: Duration) -> Self {
        self.latest_ttl = latest;
        self.status_ttl = device_status;
        self
    }

    pub async fn persist_reading(&self, reading: &Reading) -> Result<FanOutReport, FanOutError> {
        let point = Point::new(SENSOR_MEASUREMENT, reading.timestamp)
            .tag("device_id", reading.device_id.as_str())
            .tag("pond_id", reading.pond_id.as_str())
            .tag("location", reading.location.clone().unwrap_or_default())
            .field("temperature", reading.temperature)
            .field("oxygen", reading.oxygen)
            .field("ph_level", reading.ph_level);

        let latest_key = latest_sensor_key(&reading.pond_id);

        let (time_series, cache, durable) = tokio::join!(
            self.bounded(self.time_series.write_point(&point)),
            self.bounded(async {
                let latest = serde_json::to_value(reading)?;
                self.cache.set_ex(&latest_key, latest, self.latest_ttl).await
            }),
            self.bounded(async {
                let mut document = serde_json::to_value(reading)?;
                stamp(&mut document, "receivedAt");
                self.store.insert(SENSOR_COLLECTION, document).await.map(|_| ())
            }),
        );
        let report = FanOutReport { time_series, cache, durable };

        for (sink, status) in report.statuses() {
            log_failure(sink, status, &reading.pond_id, &reading.device_id);
        }
        if report.statuses().iter().all(|(_, s)| **s == SinkStatus::TimedOut) {
            return Err(FanOutError::AllSinksTimedOut(self.timeout));
        }
        Ok(report)
    }

    /// Device status: merge into the durable record and refresh the cached copy.
    pub async fn persist_device_status(&self, status: &DeviceStatus) -> StatusReport {
        let key = device_status_key(&status.device_id);

        let (cache, durable) = tokio::join!(
            self.bounded(async {
                let body = serde_json::to_value(status)?;
                self.cache.set_ex(&key, body, self.status_ttl).await
            }),
            self.bounded(async {
                let mut update = serde_json::to_value(status)?;
                stamp(&mut update, "lastUpdate");
                self.store.upsert(DEVICE_STATUS_COLLECTION, &status.device_id, update).await
            }),
        );
        log_failure(SinkKind::Cache, &cache, "-", &status.device_id);
        log_failure(SinkKind::Durable, &durable, "-", &status.device_id);
        StatusReport { cache, durable }
    }

    /// Read-through: cache first, then the durable record.
    pub async fn device_status(&self, device_id: &str) -> Result<Option<Value>, SinkError> {
        match self.cache.get(&device_status_key(device_id)).await {
            Ok(Some(cached)) => return Ok(Some(cached)),
            Ok(None) => {}
            Err(e) => tracing::warn!(device_id, error = %e, "device status cache read failed"),
        }
        Ok(self.store.get(DEVICE_STATUS_COLLECTION, device_id).await?.map(|doc| doc.data))
    }

    async fn bounded<F, E>(&self, write: F) -> SinkStatus
    where
        F: Future<Output = Result<(), E>>,
        E: fmt::Display,
    {
        match tokio::time::timeout(self.timeout, write).await {
            Ok(Ok(())) => SinkStatus::Written,
            Ok(Err(e)) => SinkStatus::Failed(e.to_string()),
            Err(_) => SinkStatus::TimedOut,
        }
    }
}

fn stamp(doc: &mut Value, field: &str) {
    if let (Value::Object(map), Ok(now)) = (doc, OffsetDateTime::now_utc().format(&Rfc3339)) {
        map.insert(field.to_string(), Value::String(now));
    }
}

fn log_failure(sink: SinkKind, status: &SinkStatus, pond_id: &str, device_id: &str) {
    match status {
        SinkStatus::Written => {}
        SinkStatus::Failed(reason) => {
            tracing::warn!(%sink, pond_id, device_id, error = %reason, "sink write failed")
        }
        SinkStatus::TimedOut => tracing::warn!(%sink, pond_id, device_id, "sink write timed out"),
    }
}
