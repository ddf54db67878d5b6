use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use time::OffsetDateTime;

/// One decoded telemetry sample. Field names match what the pond devices publish.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reading {
    pub device_id: String,
    pub pond_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    pub temperature: f64,
    pub oxygen: f64,
    pub ph_level: f64,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

impl Reading {
    pub fn value_of(&self, metric: MetricKind) -> f64 {
        match metric {
            MetricKind::Temperature => self.temperature,
            MetricKind::Oxygen => self.oxygen,
            MetricKind::Ph => self.ph_level,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    Temperature,
    Oxygen,
    Ph,
}

impl MetricKind {
    /// Evaluation order, also the notification order for one reading.
    pub const ALL: [MetricKind; 3] = [MetricKind::Temperature, MetricKind::Oxygen, MetricKind::Ph];

    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Temperature => "temperature",
            MetricKind::Oxygen => "oxygen",
            MetricKind::Ph => "ph",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "temperature" | "temp" => Some(MetricKind::Temperature),
            "oxygen" | "do" => Some(MetricKind::Oxygen),
            "ph" | "ph_level" | "phlevel" => Some(MetricKind::Ph),
            _ => None,
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered so that `Critical > Warning`; escalation checks rely on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "warning" | "warn" => Some(Severity::Warning),
            "critical" | "crit" => Some(Severity::Critical),
            _ => None,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertStatus {
    Active,
    Resolved,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSource {
    /// Raised by the rule evaluator from a reading.
    Rule,
    /// Published by a device on the alert channel.
    Device,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    NoRecipients,
    Delivered,
    Partial,
    Failed,
}

/// A threshold violation before deduplication.
#[derive(Debug, Clone, PartialEq)]
pub struct AlertCandidate {
    pub metric: MetricKind,
    pub severity: Severity,
    pub message: String,
    pub value: f64,
    pub pond_id: String,
    pub source: AlertSource,
}

/// Key of the per-(pond, metric) alert state machine.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AlertKey {
    pub pond_id: String,
    pub metric: MetricKind,
}

impl AlertKey {
    pub fn new(pond_id: impl Into<String>, metric: MetricKind) -> Self {
        Self { pond_id: pond_id.into(), metric }
    }
}

impl fmt::Display for AlertKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.pond_id, self.metric)
    }
}

/// An alert episode as tracked in memory and recorded in the `alerts` collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    pub id: String,
    #[serde(rename = "type")]
    pub metric: MetricKind,
    pub severity: Severity,
    pub message: String,
    pub value: f64,
    pub pond_id: String,
    pub status: AlertStatus,
    pub source: AlertSource,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option", skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<OffsetDateTime>,
}

impl Alert {
    pub fn open(candidate: AlertCandidate, now: OffsetDateTime) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            metric: candidate.metric,
            severity: candidate.severity,
            message: candidate.message,
            value: candidate.value,
            pond_id: candidate.pond_id,
            status: AlertStatus::Active,
            source: candidate.source,
            created_at: now,
            updated_at: now,
            resolved_at: None,
        }
    }

    pub fn key(&self) -> AlertKey {
        AlertKey::new(self.pond_id.clone(), self.metric)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceStatus {
    pub device_id: String,
    pub online: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub last_seen: OffsetDateTime,
    #[serde(default)]
    pub actuators: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recipient {
    pub user_id: String,
    pub address: String,
}

/// Decoded inbound message, ready for a lane.
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    SensorData(Reading),
    DeviceStatus(DeviceStatus),
    DeviceAlert(AlertCandidate),
}

impl Envelope {
    /// Routing key: messages sharing it are processed in order by the same lane.
    pub fn lane_key(&self) -> &str {
        match self {
            Envelope::SensorData(reading) => &reading.pond_id,
            Envelope::DeviceStatus(status) => &status.device_id,
            Envelope::DeviceAlert(candidate) => &candidate.pond_id,
        }
    }
}
