//! Notification dispatcher.
//!
//! Every alert that fires is recorded in the `alerts` collection before any
//! delivery is attempted, then re-recorded with the delivery outcome. One
//! recipient failing never stops delivery to the others.

use crate::models::{Alert, DeliveryStatus, Recipient};
use crate::sinks::{DocQuery, DocumentStore, Filter, SinkError};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

pub const ALERTS_COLLECTION: &str = "alerts";
pub const USERS_COLLECTION: &str = "users";

#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("notification transport unavailable: {0}")]
    Transport(String),
    #[error("notification transport answered {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("notification transport timed out after {0:?}")]
    Timeout(Duration),
}

/// Push message as handed to a transport.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub title: String,
    pub body: String,
    pub data: BTreeMap<String, String>,
}

impl Notification {
    pub fn for_alert(alert: &Alert) -> Self {
        let data = BTreeMap::from([
            ("type".to_string(), "sensor_alert".to_string()),
            ("alertId".to_string(), alert.id.clone()),
            ("metric".to_string(), alert.metric.to_string()),
            ("severity".to_string(), alert.severity.to_string()),
            ("pondId".to_string(), alert.pond_id.clone()),
        ]);
        Self {
            title: format!("Alert: {}", alert.metric.as_str().to_uppercase()),
            body: alert.message.clone(),
            data,
        }
    }
}

/// Result for one address of a batch.
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryResult {
    pub address: String,
    pub error: Option<String>,
}

impl DeliveryResult {
    pub fn delivered(address: impl Into<String>) -> Self {
        Self { address: address.into(), error: None }
    }

    pub fn failed(address: impl Into<String>, error: impl Into<String>) -> Self {
        Self { address: address.into(), error: Some(error.into()) }
    }
}

#[async_trait]
pub trait NotificationTransport: Send + Sync {
    /// One result per address, in the same order. `Err` means nothing was sent.
    async fn send_batch(&self, notification: &Notification, addresses: &[String]) -> Result<Vec<DeliveryResult>, DeliveryError>;
}

#[async_trait]
pub trait RecipientDirectory: Send + Sync {
    async fn recipients_for(&self, pond_id: &str) -> Result<Vec<Recipient>, SinkError>;
}

/// Users assigned to a pond, read from the `users` collection.
///
/// A user document looks like `{"assignedPonds": ["pond-a"], "fcmToken": "..."}`.
/// Users without a token are skipped, and each address is notified once.
pub struct StoreRecipientDirectory {
    store: Arc<dyn DocumentStore>,
}

impl StoreRecipientDirectory {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl RecipientDirectory for StoreRecipientDirectory {
    async fn recipients_for(&self, pond_id: &str) -> Result<Vec<Recipient>, SinkError> {
        let query = DocQuery::default()
            .filter(Filter::ArrayContains("assignedPonds".into(), json!(pond_id)))
            .limit(None);
        let users = self.store.query(USERS_COLLECTION, &query).await?;

        let mut seen = HashSet::new();
        Ok(users
            .into_iter()
            .filter_map(|doc| {
                let address = doc.data.get("fcmToken")?.as_str()?.trim().to_string();
                (!address.is_empty()).then_some(Recipient { user_id: doc.id, address })
            })
            .filter(|r| seen.insert(r.address.clone()))
            .collect())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DispatchOutcome {
    pub alert_id: String,
    pub status: DeliveryStatus,
    pub recipients: usize,
    pub delivered: usize,
}

pub struct NotificationDispatcher {
    directory: Arc<dyn RecipientDirectory>,
    transport: Arc<dyn NotificationTransport>,
    store: Arc<dyn DocumentStore>,
    timeout: Duration,
}

impl NotificationDispatcher {
    pub fn new(
        directory: Arc<dyn RecipientDirectory>,
        transport: Arc<dyn NotificationTransport>,
        store: Arc<dyn DocumentStore>,
    ) -> Self {
        Self { directory, transport, store, timeout: Duration::from_secs(10) }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Records the alert, notifies everyone assigned to its pond, records the outcome.
    pub async fn dispatch(&self, alert: &Alert) -> DispatchOutcome {
        self.record(alert, DeliveryStatus::Pending, 0, 0).await;

        let recipients = match self.directory.recipients_for(&alert.pond_id).await {
            Ok(recipients) => recipients,
            Err(e) => {
                tracing::error!(alert_id = %alert.id, pond_id = %alert.pond_id, error = %e, "recipient lookup failed");
                return self.finish(alert, DeliveryStatus::Failed, 0, 0).await;
            }
        };
        if recipients.is_empty() {
            tracing::info!(alert_id = %alert.id, pond_id = %alert.pond_id, "no recipients assigned to pond");
            return self.finish(alert, DeliveryStatus::NoRecipients, 0, 0).await;
        }

        let notification = Notification::for_alert(alert);
        let addresses: Vec<String> = recipients.iter().map(|r| r.address.clone()).collect();
        let sent = tokio::time::timeout(self.timeout, self.transport.send_batch(&notification, &addresses))
            .await
            .unwrap_or(Err(DeliveryError::Timeout(self.timeout)));

        let results = match sent {
            Ok(results) => results,
            Err(e) => {
                tracing::error!(alert_id = %alert.id, recipients = recipients.len(), error = %e, "notification delivery failed");
                return self.finish(alert, DeliveryStatus::Failed, recipients.len(), 0).await;
            }
        };

        let mut delivered = 0;
        for recipient in &recipients {
            match results.iter().find(|r| r.address == recipient.address) {
                Some(DeliveryResult { error: None, .. }) => delivered += 1,
                Some(DeliveryResult { error: Some(reason), .. }) => {
                    tracing::warn!(alert_id = %alert.id, user_id = %recipient.user_id, error = %reason, "delivery failure");
                }
                None => {
                    tracing::warn!(alert_id = %alert.id, user_id = %recipient.user_id, "delivery failure: no result from transport");
                }
            }
        }

        let status = match delivered {
            0 => DeliveryStatus::Failed,
            n if n == recipients.len() => DeliveryStatus::Delivered,
            _ => DeliveryStatus::Partial,
        };
        tracing::info!(
            alert_id = %alert.id,
            pond_id = %alert.pond_id,
            severity = %alert.severity,
            delivered,
            recipients = recipients.len(),
            "alert notification sent"
        );
        self.finish(alert, status, recipients.len(), delivered).await
    }

    /// Marks the stored alert resolved. Nobody is notified.
    pub async fn record_resolution(&self, alert: &Alert) {
        match serde_json::to_value(alert) {
            Ok(body) => {
                if let Err(e) = self.store.upsert(ALERTS_COLLECTION, &alert.id, body).await {
                    tracing::error!(alert_id = %alert.id, error = %e, "failed to record alert resolution");
                }
            }
            Err(e) => tracing::error!(alert_id = %alert.id, error = %e, "failed to encode alert"),
        }
    }

    async fn finish(&self, alert: &Alert, status: DeliveryStatus, recipients: usize, delivered: usize) -> DispatchOutcome {
        self.record(alert, status, recipients, delivered).await;
        DispatchOutcome { alert_id: alert.id.clone(), status, recipients, delivered }
    }

    async fn record(&self, alert: &Alert, status: DeliveryStatus, recipients: usize, delivered: usize) {
        let mut body = match serde_json::to_value(alert) {
            Ok(body) => body,
            Err(e) => {
                tracing::error!(alert_id = %alert.id, error = %e, "failed to encode alert");
                return;
            }
        };
        if let Value::Object(map) = &mut body {
            map.insert(
                "delivery".into(),
                json!({
                    "status": status,
                    "recipients": recipients,
                    "delivered": delivered,
                    "at": OffsetDateTime::now_utc().format(&Rfc3339).ok(),
                }),
            );
        }
        if let Err(e) = self.store.upsert(ALERTS_COLLECTION, &alert.id, body).await {
            // The log line is then the only trace of the alert.
            tracing::error!(
                alert_id = %alert.id,
                pond_id = %alert.pond_id,
                metric = %alert.metric,
                severity = %alert.severity,
                message = %alert.message,
                error = %e,
                "failed to record alert"
            );
        }
    }
}
