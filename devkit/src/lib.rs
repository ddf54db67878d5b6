//! # Kolam DevKit - test helpers for the pond telemetry kernel
//!
//! - MQTT client stub that records publications, no broker needed
//! - Payload builders for the kolam topics, shaped like the ESP32 firmware output

pub mod messages;
pub mod mqtt_stub;

pub use messages::KolamMessageBuilder;
pub use mqtt_stub::{MockMessage, MockMqttClient};
