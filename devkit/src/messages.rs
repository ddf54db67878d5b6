/*!
Payload builders for the kolam MQTT topics.

Field names follow the pond firmware: camelCase, `phLevel`, RFC 3339 timestamps.
*/

use serde_json::Value;

pub struct KolamMessageBuilder;

impl KolamMessageBuilder {
    /// `kolam/sensor/data` payload stamped with the current time.
    pub fn sensor_data(device_id: &str, pond_id: &str, temperature: f64, oxygen: f64, ph_level: f64) -> Value {
        Self::sensor_data_at(device_id, pond_id, temperature, oxygen, ph_level, &chrono::Utc::now().to_rfc3339())
    }

    pub fn sensor_data_at(
        device_id: &str,
        pond_id: &str,
        temperature: f64,
        oxygen: f64,
        ph_level: f64,
        timestamp: &str,
    ) -> Value {
        serde_json::json!({
            "deviceId": device_id,
            "pondId": pond_id,
            "location": format!("{pond_id}-inlet"),
            "temperature": temperature,
            "oxygen": oxygen,
            "phLevel": ph_level,
            "timestamp": timestamp
        })
    }

    /// `kolam/device/status` payload.
    pub fn device_status(device_id: &str, online: bool, actuators: Value) -> Value {
        serde_json::json!({
            "deviceId": device_id,
            "online": online,
            "actuators": actuators,
            "timestamp": chrono::Utc::now().to_rfc3339()
        })
    }

    /// `kolam/alert` payload raised by the device itself.
    pub fn device_alert(metric: &str, severity: &str, pond_id: &str, value: f64) -> Value {
        serde_json::json!({
            "type": metric,
            "severity": severity,
            "pondId": pond_id,
            "value": value,
            "message": format!("{metric} out of range on {pond_id}")
        })
    }

    /// Body accepted by `POST /api/control/{deviceId}`.
    pub fn control_command(action: &str, target: &str) -> Value {
        serde_json::json!({ "action": action, "target": target })
    }
}
