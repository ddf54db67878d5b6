use crate::config::MqttConf;
use crate::coordinator::IngestHandle;
use crate::decoder::Topics;
use crate::health::HealthTracker;
use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, Incoming, MqttOptions, QoS};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const RETRY_DELAY: Duration = Duration::from_secs(2);

/// Outbound side of the broker connection: control commands for devices.
#[async_trait]
pub trait CommandPublisher: Send + Sync {
    async fn publish_command(&self, topic: &str, payload: Vec<u8>) -> Result<(), String>;
}

#[async_trait]
impl CommandPublisher for AsyncClient {
    async fn publish_command(&self, topic: &str, payload: Vec<u8>) -> Result<(), String> {
        self.publish(topic, QoS::AtLeastOnce, false, payload).await.map_err(|e| e.to_string())
    }
}

pub fn create_mqtt_client(cfg: &MqttConf) -> (AsyncClient, EventLoop) {
    let mut opts = MqttOptions::new(cfg.client_id.as_str(), cfg.host.as_str(), cfg.port);
    opts.set_keep_alive(Duration::from_secs(cfg.keep_alive_secs));
    opts.set_clean_session(true);
    AsyncClient::new(opts, 64)
}

/// Drives the event loop: (re)subscribes on every ConnAck and hands publishes
/// to the ingest lanes. The loop never waits on pipeline work.
pub fn spawn_mqtt_listener(
    client: AsyncClient,
    mut eventloop: EventLoop,
    topics: Topics,
    ingest: IngestHandle,
    health: HealthTracker,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => break,
                event = eventloop.poll() => event,
            };
            match event {
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    health.mark_mqtt_connected();
                    tracing::info!("connected to MQTT broker");
                    for topic in topics.inbound() {
                        // try_subscribe: this task is the one draining the request queue.
                        match client.try_subscribe(topic, QoS::AtLeastOnce) {
                            Ok(()) => tracing::info!(topic, "subscribed"),
                            Err(e) => tracing::error!(topic, error = %e, "subscribe failed"),
                        }
                    }
                }
                Ok(Event::Incoming(Incoming::Publish(p))) => {
                    ingest.submit(&p.topic, &p.payload);
                }
                Ok(Event::Incoming(Incoming::Disconnect)) => {
                    health.mark_mqtt_disconnected();
                    tracing::warn!("broker sent disconnect");
                }
                Ok(_) => {}
                Err(e) => {
                    health.increment_reconnects();
                    tracing::warn!(error = %e, "MQTT connection error, retrying");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(RETRY_DELAY) => {}
                    }
                }
            }
        }

        if let Err(e) = client.try_disconnect() {
            tracing::debug!(error = %e, "disconnect request not queued");
        }
        health.mark_mqtt_disconnected();
        tracing::info!("MQTT listener stopped");
    })
}
