use crate::rules::{RuleConfigInvalid, ThresholdTable};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tokio::fs;

/// Cool-down values below this are raised to it.
pub const MIN_ALERT_COOLDOWN_SECS: u64 = 60;
/// Cache lifetimes and the sweep period are capped at one week.
pub const MAX_CACHE_TTL_SECS: u64 = 7 * 24 * 3_600;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Read { path: String, source: std::io::Error },
    #[error("invalid config {path}: {source}")]
    Parse { path: String, source: serde_yaml::Error },
    #[error("invalid environment override {var}={value}")]
    Env { var: &'static str, value: String },
    #[error(transparent)]
    Rules(#[from] RuleConfigInvalid),
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct KernelConfig {
    pub mqtt: MqttConf,
    pub http: HttpConf,
    pub ingest: IngestConf,
    pub persistence: PersistenceConf,
    pub rules: ThresholdTable,
    pub alerts: AlertConf,
    pub notifications: NotificationConf,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct MqttConf {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub topic_prefix: String,
    pub keep_alive_secs: u64,
}

impl Default for MqttConf {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: 1883,
            client_id: "kolam-backend-server".into(),
            topic_prefix: "kolam".into(),
            keep_alive_secs: 15,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct HttpConf {
    pub port: u16,
}

impl Default for HttpConf {
    fn default() -> Self {
        Self { port: 3000 }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct IngestConf {
    /// Number of sequential worker lanes.
    pub lanes: usize,
    /// Queue depth per lane; a full lane drops new messages.
    pub lane_capacity: usize,
}

impl Default for IngestConf {
    fn default() -> Self {
        Self { lanes: 4, lane_capacity: 256 }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct PersistenceConf {
    pub data_dir: String,
    pub sink_timeout_ms: u64,
    pub latest_ttl_secs: u64,
    pub device_status_ttl_secs: u64,
    pub cache_sweep_secs: u64,
    pub influx: InfluxConf,
}

impl Default for PersistenceConf {
    fn default() -> Self {
        Self {
            data_dir: "./data".into(),
            sink_timeout_ms: 2_000,
            latest_ttl_secs: 3_600,
            device_status_ttl_secs: 1_800,
            cache_sweep_secs: 60,
            influx: InfluxConf::default(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct InfluxConf {
    pub url: String,
    pub token: String,
    pub org: String,
    pub bucket: String,
}

impl Default for InfluxConf {
    fn default() -> Self {
        Self {
            url: "http://localhost:8086".into(),
            token: String::new(),
            org: "kolam-org".into(),
            bucket: "sensor-data".into(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct AlertConf {
    pub cooldown_secs: u64,
}

impl Default for AlertConf {
    fn default() -> Self {
        Self { cooldown_secs: 900 }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct NotificationConf {
    /// Batched webhook endpoint; notifications are only logged when unset.
    pub webhook_url: Option<String>,
    pub timeout_ms: u64,
}

impl Default for NotificationConf {
    fn default() -> Self {
        Self { webhook_url: None, timeout_ms: 5_000 }
    }
}

impl PersistenceConf {
    pub fn sink_timeout(&self) -> Duration {
        Duration::from_millis(self.sink_timeout_ms)
    }
}

impl AlertConf {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs.max(MIN_ALERT_COOLDOWN_SECS))
    }
}

impl KernelConfig {
    /// Applies the environment variables the docker deployment sets.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("MQTT_BROKER") {
            self.mqtt.host = host;
        }
        if let Some(port) = lookup("MQTT_PORT") {
            self.mqtt.port = port.parse().map_err(|_| ConfigError::Env { var: "MQTT_PORT", value: port })?;
        }
        if let Some(port) = lookup("PORT") {
            self.http.port = port.parse().map_err(|_| ConfigError::Env { var: "PORT", value: port })?;
        }
        if let Some(url) = lookup("INFLUXDB_URL") {
            self.persistence.influx.url = url;
        }
        if let Some(token) = lookup("INFLUXDB_TOKEN") {
            self.persistence.influx.token = token;
        }
        if let Some(org) = lookup("INFLUXDB_ORG") {
            self.persistence.influx.org = org;
        }
        if let Some(bucket) = lookup("INFLUXDB_BUCKET") {
            self.persistence.influx.bucket = bucket;
        }
        if let Some(dir) = lookup("KOLAM_DATA_DIR") {
            self.persistence.data_dir = dir;
        }
        if let Some(url) = lookup("KOLAM_WEBHOOK_URL") {
            self.notifications.webhook_url = Some(url).filter(|u| !u.is_empty());
        }
        Ok(())
    }

    /// Checks everything that must stop the process instead of degrading alerting.
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        self.rules.validate()?;
        if self.alerts.cooldown_secs < MIN_ALERT_COOLDOWN_SECS {
            tracing::warn!(
                configured = self.alerts.cooldown_secs,
                minimum = MIN_ALERT_COOLDOWN_SECS,
                "alert cooldown below minimum, raising it"
            );
            self.alerts.cooldown_secs = MIN_ALERT_COOLDOWN_SECS;
        }
        let persistence = &mut self.persistence;
        for (name, secs) in [
            ("latest_ttl_secs", &mut persistence.latest_ttl_secs),
            ("device_status_ttl_secs", &mut persistence.device_status_ttl_secs),
            ("cache_sweep_secs", &mut persistence.cache_sweep_secs),
        ] {
            if *secs > MAX_CACHE_TTL_SECS {
                tracing::warn!(setting = name, configured = *secs, maximum = MAX_CACHE_TTL_SECS, "cache setting above maximum, lowering it");
                *secs = MAX_CACHE_TTL_SECS;
            }
        }
        self.ingest.lanes = self.ingest.lanes.max(1);
        self.ingest.lane_capacity = self.ingest.lane_capacity.max(1);
        Ok(())
    }
}

pub fn parse_config(path: &str, txt: &str) -> Result<KernelConfig, ConfigError> {
    if txt.trim().is_empty() {
        return Ok(KernelConfig::default());
    }
    serde_yaml::from_str(txt).map_err(|source| ConfigError::Parse { path: path.to_string(), source })
}

/// Loads `$KOLAM_KERNEL_CONFIG` (or `kolam.yaml`), then env overrides, then validates.
pub async fn load_config() -> Result<KernelConfig, ConfigError> {
    let path = std::env::var("KOLAM_KERNEL_CONFIG").unwrap_or_else(|_| "kolam.yaml".into());
    let mut cfg = if Path::new(&path).exists() {
        let txt = fs::read_to_string(&path)
            .await
            .map_err(|source| ConfigError::Read { path: path.clone(), source })?;
        parse_config(&path, &txt)?
    } else {
        tracing::info!(path = %path, "no config file, using defaults");
        KernelConfig::default()
    };
    cfg.apply_env_overrides(|var| std::env::var(var).ok())?;
    cfg.validate()?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_match_deployment() {
        let cfg = KernelConfig::default();
        assert_eq!(cfg.mqtt.port, 1883);
        assert_eq!(cfg.mqtt.topic_prefix, "kolam");
        assert_eq!(cfg.persistence.latest_ttl_secs, 3_600);
        assert_eq!(cfg.persistence.device_status_ttl_secs, 1_800);
        assert_eq!(cfg.http.port, 3000);
    }

    #[test]
    fn test_partial_yaml_keeps_other_defaults() {
        let yaml = "alerts:\n  cooldown_secs: 300\nrules:\n  temperature:\n    warning: { min: 22.0, max: 28.0 }\n    critical: { min: 18.0, max: 32.0 }\n";
        let mut cfg = parse_config("test.yaml", yaml).unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.alerts.cooldown_secs, 300);
        assert_eq!(cfg.rules.temperature.warning.min, Some(22.0));
        assert_eq!(cfg.rules.oxygen.critical.min, Some(3.0));
        assert_eq!(cfg.mqtt.host, "localhost");
    }

    #[test]
    fn test_cooldown_is_raised_to_minimum() {
        let mut cfg = KernelConfig::default();
        cfg.alerts.cooldown_secs = 1;
        cfg.validate().unwrap();
        assert_eq!(cfg.alerts.cooldown_secs, MIN_ALERT_COOLDOWN_SECS);
        assert_eq!(cfg.alerts.cooldown(), Duration::from_secs(MIN_ALERT_COOLDOWN_SECS));
    }

    #[test]
    fn test_cache_lifetimes_are_capped() {
        let yaml = "persistence:\n  latest_ttl_secs: 18446744073709551615\n  device_status_ttl_secs: 600\n";
        let mut cfg = parse_config("test.yaml", yaml).unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.persistence.latest_ttl_secs, MAX_CACHE_TTL_SECS);
        assert_eq!(cfg.persistence.device_status_ttl_secs, 600);
        assert_eq!(cfg.persistence.cache_sweep_secs, 60);
    }

    #[test]
    fn test_broken_rules_are_fatal() {
        let yaml = "rules:\n  ph:\n    warning: { min: 6.5, max: 8.5 }\n    critical: { min: 7.0, max: 9.0 }\n";
        let mut cfg = parse_config("test.yaml", yaml).unwrap();
        assert!(matches!(cfg.validate(), Err(ConfigError::Rules(_))));
    }

    #[test]
    fn test_invalid_yaml_is_an_error() {
        assert!(matches!(parse_config("bad.yaml", "mqtt: [not, a, map"), Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("MQTT_BROKER", "mosquitto"),
            ("PORT", "8081"),
            ("INFLUXDB_URL", "http://influxdb:8086"),
            ("INFLUXDB_BUCKET", "ponds"),
            ("KOLAM_WEBHOOK_URL", "http://push/send"),
        ]
        .into_iter()
        .collect();
        let mut cfg = KernelConfig::default();
        cfg.apply_env_overrides(|k| env.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(cfg.mqtt.host, "mosquitto");
        assert_eq!(cfg.http.port, 8081);
        assert_eq!(cfg.persistence.influx.url, "http://influxdb:8086");
        assert_eq!(cfg.persistence.influx.bucket, "ponds");
        assert_eq!(cfg.notifications.webhook_url.as_deref(), Some("http://push/send"));
    }

    #[test]
    fn test_bad_port_override_is_rejected() {
        let mut cfg = KernelConfig::default();
        let res = cfg.apply_env_overrides(|k| (k == "MQTT_PORT").then(|| "abc".to_string()));
        assert!(matches!(res, Err(ConfigError::Env { var: "MQTT_PORT", .. })));
    }
}
