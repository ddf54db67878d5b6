use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineCounters {
    pub messages_received: u64,
    pub decode_failures: u64,
    pub messages_dropped: u64,
    pub readings_processed: u64,
    pub sink_failures: u64,
    pub alerts_fired: u64,
    pub alerts_suppressed: u64,
    pub alerts_resolved: u64,
    pub commands_published: u64,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KernelHealth {
    /// `healthy` while the broker connection is up, `degraded` otherwise.
    pub status: String,
    pub timestamp: String,
    pub uptime_seconds: u64,
    pub mqtt_status: String,
    pub mqtt_reconnects: u32,
    pub active_alerts: usize,
    pub counters: PipelineCounters,
}

#[derive(Default)]
struct Counters {
    messages_received: AtomicU64,
    decode_failures: AtomicU64,
    messages_dropped: AtomicU64,
    readings_processed: AtomicU64,
    sink_failures: AtomicU64,
    alerts_fired: AtomicU64,
    alerts_suppressed: AtomicU64,
    alerts_resolved: AtomicU64,
    commands_published: AtomicU64,
}

/// Which counter to bump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    MessageReceived,
    DecodeFailure,
    MessageDropped,
    ReadingProcessed,
    SinkFailure,
    AlertFired,
    AlertSuppressed,
    AlertResolved,
    CommandPublished,
}

#[derive(Clone)]
pub struct HealthTracker {
    start_time: Instant,
    mqtt_reconnects: Arc<AtomicU32>,
    mqtt_status: Arc<Mutex<String>>,
    counters: Arc<Counters>,
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthTracker {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            mqtt_reconnects: Arc::new(AtomicU32::new(0)),
            mqtt_status: Arc::new(Mutex::new("connecting".to_string())),
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn mark_mqtt_connected(&self) {
        *self.mqtt_status.lock() = "connected".to_string();
    }

    pub fn mark_mqtt_disconnected(&self) {
        *self.mqtt_status.lock() = "disconnected".to_string();
    }

    pub fn is_mqtt_connected(&self) -> bool {
        *self.mqtt_status.lock() == "connected"
    }

    pub fn increment_reconnects(&self) {
        self.mqtt_reconnects.fetch_add(1, Ordering::Relaxed);
        *self.mqtt_status.lock() = "reconnecting".to_string();
    }

    pub fn record(&self, counter: Counter) {
        self.add(counter, 1);
    }

    pub fn add(&self, counter: Counter, n: u64) {
        let c = &self.counters;
        let slot = match counter {
            Counter::MessageReceived => &c.messages_received,
            Counter::DecodeFailure => &c.decode_failures,
            Counter::MessageDropped => &c.messages_dropped,
            Counter::ReadingProcessed => &c.readings_processed,
            Counter::SinkFailure => &c.sink_failures,
            Counter::AlertFired => &c.alerts_fired,
            Counter::AlertSuppressed => &c.alerts_suppressed,
            Counter::AlertResolved => &c.alerts_resolved,
            Counter::CommandPublished => &c.commands_published,
        };
        slot.fetch_add(n, Ordering::Relaxed);
    }

    pub fn counters(&self) -> PipelineCounters {
        let c = &self.counters;
        PipelineCounters {
            messages_received: c.messages_received.load(Ordering::Relaxed),
            decode_failures: c.decode_failures.load(Ordering::Relaxed),
            messages_dropped: c.messages_dropped.load(Ordering::Relaxed),
            readings_processed: c.readings_processed.load(Ordering::Relaxed),
            sink_failures: c.sink_failures.load(Ordering::Relaxed),
            alerts_fired: c.alerts_fired.load(Ordering::Relaxed),
            alerts_suppressed: c.alerts_suppressed.load(Ordering::Relaxed),
            alerts_resolved: c.alerts_resolved.load(Ordering::Relaxed),
            commands_published: c.commands_published.load(Ordering::Relaxed),
        }
    }

    pub fn get_health(&self) -> KernelHealth {
        let mqtt_status = self.mqtt_status.lock().clone();
        KernelHealth {
            status: if mqtt_status == "connected" { "healthy" } else { "degraded" }.to_string(),
            timestamp: OffsetDateTime::now_utc().format(&Rfc3339).unwrap_or_default(),
            uptime_seconds: self.start_time.elapsed().as_secs(),
            mqtt_status,
            mqtt_reconnects: self.mqtt_reconnects.load(Ordering::Relaxed),
            active_alerts: 0,
            counters: self.counters(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_follows_broker_connection() {
        let health = HealthTracker::new();
        assert_eq!(health.get_health().status, "degraded");
        health.mark_mqtt_connected();
        assert!(health.is_mqtt_connected());
        assert_eq!(health.get_health().status, "healthy");
        health.increment_reconnects();
        assert!(!health.is_mqtt_connected());
        let report = health.get_health();
        assert_eq!(report.mqtt_status, "reconnecting");
        assert_eq!(report.mqtt_reconnects, 1);
    }

    #[test]
    fn test_counters_are_shared_between_clones() {
        let health = HealthTracker::new();
        let lane_view = health.clone();
        lane_view.record(Counter::MessageReceived);
        lane_view.add(Counter::SinkFailure, 2);
        health.record(Counter::AlertFired);
        let counters = health.counters();
        assert_eq!(counters.messages_received, 1);
        assert_eq!(counters.sink_failures, 2);
        assert_eq!(counters.alerts_fired, 1);
        assert_eq!(counters.decode_failures, 0);
    }
}
