//! InfluxDB v2 time-series sink (HTTP write API, line protocol).

use super::{Point, SinkError, TimeSeriesSink};
use crate::config::InfluxConf;
use async_trait::async_trait;
use std::time::Duration;

const SINK: &str = "influxdb";

pub struct InfluxSink {
    client: reqwest::Client,
    write_url: String,
    token: String,
    org: String,
    bucket: String,
}

impl InfluxSink {
    pub fn new(conf: &InfluxConf) -> Result<Self, SinkError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| SinkError::Unavailable { sink: SINK, reason: e.to_string() })?;
        Ok(Self {
            client,
            write_url: format!("{}/api/v2/write", conf.url.trim_end_matches('/')),
            token: conf.token.clone(),
            org: conf.org.clone(),
            bucket: conf.bucket.clone(),
        })
    }
}

#[async_trait]
impl TimeSeriesSink for InfluxSink {
    async fn write_point(&self, point: &Point) -> Result<(), SinkError> {
        let line = to_line_protocol(point);
        let response = self
            .client
            .post(&self.write_url)
            .query(&[("org", self.org.as_str()), ("bucket", self.bucket.as_str()), ("precision", "ns")])
            .header(reqwest::header::AUTHORIZATION, format!("Token {}", self.token))
            .header(reqwest::header::CONTENT_TYPE, "text/plain; charset=utf-8")
            .body(line)
            .send()
            .await
            .map_err(|e| SinkError::Unavailable { sink: SINK, reason: e.to_string() })?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(SinkError::Rejected { sink: SINK, status: status.as_u16(), body })
    }
}

/// `measurement,tag=v field=1.5 <unix nanos>`. Empty tag values are dropped, Influx rejects them.
pub fn to_line_protocol(point: &Point) -> String {
    let mut line = escape(&point.measurement, &[',', ' ']);
    for (key, value) in point.tags.iter().filter(|(_, v)| !v.is_empty()) {
        line.push(',');
        line.push_str(&escape(key, &[',', '=', ' ']));
        line.push('=');
        line.push_str(&escape(value, &[',', '=', ' ']));
    }
    let fields: Vec<String> = point
        .fields
        .iter()
        .map(|(key, value)| format!("{}={}", escape(key, &[',', '=', ' ']), value))
        .collect();
    line.push(' ');
    line.push_str(&fields.join(","));
    line.push(' ');
    line.push_str(&point.timestamp.unix_timestamp_nanos().to_string());
    line
}

fn escape(raw: &str, special: &[char]) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        if c == '\\' || special.contains(&c) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}
