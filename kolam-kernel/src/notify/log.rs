use crate::dispatch::{DeliveryError, DeliveryResult, Notification, NotificationTransport};
use async_trait::async_trait;

/// Logs every notification and reports it delivered.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl NotificationTransport for LogNotifier {
    async fn send_batch(&self, notification: &Notification, addresses: &[String]) -> Result<Vec<DeliveryResult>, DeliveryError> {
        tracing::info!(
            title = %notification.title,
            body = %notification.body,
            recipients = addresses.len(),
            "notification (log transport)"
        );
        Ok(addresses.iter().map(|a| DeliveryResult::delivered(a.as_str())).collect())
    }
}
