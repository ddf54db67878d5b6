//! Telemetry envelope decoder: `(topic, payload)` into a validated [`Envelope`].
//!
//! Pure: no I/O. Every failure here is skip-and-log for the caller.

use crate::models::{AlertCandidate, AlertSource, DeviceStatus, Envelope, MetricKind, Reading, Severity};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DecodeError {
    #[error("malformed payload on {topic}: {reason}")]
    MalformedPayload { topic: String, reason: String },
    #[error("missing field `{field}` on {topic}")]
    MissingField { topic: String, field: &'static str },
    #[error("no route for topic {0}")]
    UnroutedMessage(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    SensorData,
    DeviceStatus,
    Alert,
    ControlCommand,
}

/// Topic names, built once from the configured prefix.
#[derive(Debug, Clone)]
pub struct Topics {
    pub sensor_data: String,
    pub device_status: String,
    pub alert: String,
    pub control_command: String,
}

impl Topics {
    pub fn new(prefix: &str) -> Self {
        let prefix = prefix.trim_end_matches('/');
        let topic = |suffix: &str| {
            if prefix.is_empty() {
                suffix.to_string()
            } else {
                format!("{prefix}/{suffix}")
            }
        };
        Self {
            sensor_data: topic("sensor/data"),
            device_status: topic("device/status"),
            alert: topic("alert"),
            control_command: topic("control/command"),
        }
    }

    /// Topics the kernel subscribes to.
    pub fn inbound(&self) -> [&str; 3] {
        [&self.sensor_data, &self.device_status, &self.alert]
    }

    pub fn channel_of(&self, topic: &str) -> Option<Channel> {
        if topic == self.sensor_data {
            Some(Channel::SensorData)
        } else if topic == self.device_status {
            Some(Channel::DeviceStatus)
        } else if topic == self.alert {
            Some(Channel::Alert)
        } else if topic == self.control_command {
            Some(Channel::ControlCommand)
        } else {
            None
        }
    }
}

impl Default for Topics {
    fn default() -> Self {
        Self::new("kolam")
    }
}

pub fn decode(topics: &Topics, topic: &str, payload: &[u8]) -> Result<Envelope, DecodeError> {
    match topics.channel_of(topic) {
        Some(Channel::SensorData) => decode_reading(&Fields::parse(topic, payload)?).map(Envelope::SensorData),
        Some(Channel::DeviceStatus) => decode_status(&Fields::parse(topic, payload)?).map(Envelope::DeviceStatus),
        Some(Channel::Alert) => decode_alert(&Fields::parse(topic, payload)?).map(Envelope::DeviceAlert),
        // Our own outbound commands can echo back; they are not telemetry.
        Some(Channel::ControlCommand) | None => Err(DecodeError::UnroutedMessage(topic.to_string())),
    }
}

/// JSON object plus the topic it came from, for error context.
struct Fields<'a> {
    topic: &'a str,
    map: Map<String, Value>,
}

impl<'a> Fields<'a> {
    fn parse(topic: &'a str, payload: &[u8]) -> Result<Self, DecodeError> {
        let value: Value = serde_json::from_slice(payload).map_err(|e| DecodeError::MalformedPayload {
            topic: topic.to_string(),
            reason: e.to_string(),
        })?;
        match value {
            Value::Object(map) => Ok(Self { topic, map }),
            other => Err(malformed(topic, format!("expected a JSON object, got {}", json_kind(&other)))),
        }
    }

    /// Absent and `null` both count as missing.
    fn present(&self, field: &'static str) -> Option<&Value> {
        self.map.get(field).filter(|v| !v.is_null())
    }

    fn number(&self, field: &'static str) -> Result<f64, DecodeError> {
        let value = self.present(field).ok_or_else(|| self.missing(field))?;
        value
            .as_f64()
            .filter(|n| n.is_finite())
            .ok_or_else(|| malformed(self.topic, format!("`{field}` must be a number, got {}", json_kind(value))))
    }

    fn string(&self, field: &'static str) -> Result<String, DecodeError> {
        match self.optional_string(field)? {
            Some(s) if !s.trim().is_empty() => Ok(s),
            _ => Err(self.missing(field)),
        }
    }

    fn optional_string(&self, field: &'static str) -> Result<Option<String>, DecodeError> {
        match self.present(field) {
            None => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.clone())),
            // Numeric ids show up from some firmware builds.
            Some(Value::Number(n)) => Ok(Some(n.to_string())),
            Some(other) => Err(malformed(self.topic, format!("`{field}` must be a string, got {}", json_kind(other)))),
        }
    }

    /// RFC 3339 string or epoch milliseconds; absent means now.
    fn timestamp(&self, field: &'static str) -> Result<OffsetDateTime, DecodeError> {
        match self.present(field) {
            None => Ok(OffsetDateTime::now_utc()),
            Some(Value::String(s)) => OffsetDateTime::parse(s, &Rfc3339)
                .map_err(|e| malformed(self.topic, format!("`{field}` is not RFC 3339: {e}"))),
            Some(Value::Number(n)) => n
                .as_i64()
                .and_then(|ms| OffsetDateTime::from_unix_timestamp_nanos(i128::from(ms) * 1_000_000).ok())
                .ok_or_else(|| malformed(self.topic, format!("`{field}` is not a valid epoch millisecond value"))),
            Some(other) => Err(malformed(self.topic, format!("`{field}` must be a timestamp, got {}", json_kind(other)))),
        }
    }

    fn missing(&self, field: &'static str) -> DecodeError {
        DecodeError::MissingField { topic: self.topic.to_string(), field }
    }
}

fn decode_reading(f: &Fields<'_>) -> Result<Reading, DecodeError> {
    Ok(Reading {
        device_id: f.string("deviceId")?,
        pond_id: f.string("pondId")?,
        location: f.optional_string("location")?,
        temperature: f.number("temperature")?,
        oxygen: f.number("oxygen")?,
        ph_level: f.number("phLevel")?,
        timestamp: f.timestamp("timestamp")?,
    })
}

fn decode_status(f: &Fields<'_>) -> Result<DeviceStatus, DecodeError> {
    let online = match f.present("online") {
        None => true,
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => s.eq_ignore_ascii_case("online") || s.eq_ignore_ascii_case("true"),
        Some(other) => return Err(malformed(f.topic, format!("`online` must be a boolean, got {}", json_kind(other)))),
    };
    let actuators = match f.present("actuators") {
        None => BTreeMap::new(),
        Some(Value::Object(map)) => map.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        Some(other) => return Err(malformed(f.topic, format!("`actuators` must be an object, got {}", json_kind(other)))),
    };
    let last_seen = if f.present("lastSeen").is_some() {
        f.timestamp("lastSeen")?
    } else {
        f.timestamp("timestamp")?
    };
    Ok(DeviceStatus { device_id: f.string("deviceId")?, online, last_seen, actuators })
}

fn decode_alert(f: &Fields<'_>) -> Result<AlertCandidate, DecodeError> {
    let raw_type = f.string("type")?;
    let metric = MetricKind::parse(&raw_type)
        .ok_or_else(|| malformed(f.topic, format!("unknown alert type `{raw_type}`")))?;
    let severity = match f.optional_string("severity")? {
        None => Severity::Warning,
        Some(raw) => Severity::parse(&raw).ok_or_else(|| malformed(f.topic, format!("unknown severity `{raw}`")))?,
    };
    let pond_id = f.string("pondId")?;
    let value = f.number("value")?;
    let message = f
        .optional_string("message")?
        .filter(|m| !m.trim().is_empty())
        .unwrap_or_else(|| format!("Device reported {metric} {severity} for pond {pond_id}: {value}"));
    Ok(AlertCandidate { metric, severity, message, value, pond_id, source: AlertSource::Device })
}

fn malformed(topic: &str, reason: String) -> DecodeError {
    DecodeError::MalformedPayload { topic: topic.to_string(), reason }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
