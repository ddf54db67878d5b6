//! Push gateway over HTTP.
//!
//! Request body:
//! `{"tokens": [...], "notification": {"title", "body"}, "data": {...}}`
//!
//! A 2xx answer may carry `{"responses": [{"success": bool, "error": "..."}]}`
//! aligned with `tokens`; a 2xx without it counts as delivered to everyone.

use crate::dispatch::{DeliveryError, DeliveryResult, Notification, NotificationTransport};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

#[derive(Serialize)]
struct MulticastRequest<'a> {
    tokens: &'a [String],
    notification: MessageBody<'a>,
    data: &'a BTreeMap<String, String>,
}

#[derive(Serialize)]
struct MessageBody<'a> {
    title: &'a str,
    body: &'a str,
}

#[derive(Debug, Deserialize)]
struct MulticastResponse {
    #[serde(default)]
    responses: Vec<SendResponse>,
}

#[derive(Debug, Deserialize)]
struct SendResponse {
    success: bool,
    #[serde(default)]
    error: Option<String>,
}

pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, DeliveryError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DeliveryError::Transport(e.to_string()))?;
        Ok(Self { client, url: url.into() })
    }
}

#[async_trait]
impl NotificationTransport for WebhookNotifier {
    async fn send_batch(&self, notification: &Notification, addresses: &[String]) -> Result<Vec<DeliveryResult>, DeliveryError> {
        let request = MulticastRequest {
            tokens: addresses,
            notification: MessageBody { title: &notification.title, body: &notification.body },
            data: &notification.data,
        };
        let response = self
            .client
            .post(&self.url)
            .json(&request)
            .send()
            .await
            .map_err(|e| DeliveryError::Transport(e.to_string()))?;

        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(DeliveryError::Rejected { status: status.as_u16(), body: text });
        }

        let responses = serde_json::from_str::<MulticastResponse>(&text)
            .map(|r| r.responses)
            .unwrap_or_default();
        if responses.is_empty() {
            return Ok(addresses.iter().map(|a| DeliveryResult::delivered(a.as_str())).collect());
        }

        Ok(addresses
            .iter()
            .enumerate()
            .map(|(i, address)| match responses.get(i) {
                Some(SendResponse { success: true, .. }) => DeliveryResult::delivered(address.as_str()),
                Some(SendResponse { error, .. }) => {
                    DeliveryResult::failed(address.as_str(), error.clone().unwrap_or_else(|| "rejected".into()))
                }
                None => DeliveryResult::failed(address.as_str(), "missing from gateway response"),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{routing::post, Json, Router};
    use serde_json::{json, Value};

    /// Local gateway that rejects every token starting with "bad".
    async fn spawn_gateway() -> String {
        async fn send(Json(body): Json<Value>) -> Json<Value> {
            let responses: Vec<Value> = body["tokens"]
                .as_array()
                .map(|tokens| {
                    tokens
                        .iter()
                        .map(|t| {
                            if t.as_str().is_some_and(|t| t.starts_with("bad")) {
                                json!({"success": false, "error": "registration-token-not-registered"})
                            } else {
                                json!({"success": true})
                            }
                        })
                        .collect()
                })
                .unwrap_or_default();
            Json(json!({ "responses": responses }))
        }

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, Router::new().route("/send", post(send))).await.unwrap();
        });
        format!("http://{addr}/send")
    }

    fn notification() -> Notification {
        Notification {
            title: "Alert: TEMPERATURE".into(),
            body: "Temperature 36°C is out of normal range (20-30°C)".into(),
            data: BTreeMap::from([("pondId".to_string(), "pond-a".to_string())]),
        }
    }

    #[tokio::test]
    async fn test_per_token_results() {
        let notifier = WebhookNotifier::new(spawn_gateway().await, Duration::from_secs(5)).unwrap();
        let tokens = vec!["tok-1".to_string(), "bad-2".to_string()];
        let results = notifier.send_batch(&notification(), &tokens).await.unwrap();
        assert_eq!(results[0], DeliveryResult::delivered("tok-1"));
        assert_eq!(results[1], DeliveryResult::failed("bad-2", "registration-token-not-registered"));
    }

    #[tokio::test]
    async fn test_unreachable_gateway_is_transport_error() {
        let notifier = WebhookNotifier::new("http://127.0.0.1:1/send", Duration::from_secs(2)).unwrap();
        let err = notifier.send_batch(&notification(), &["tok-1".to_string()]).await.unwrap_err();
        assert!(matches!(err, DeliveryError::Transport(_)));
    }
}
