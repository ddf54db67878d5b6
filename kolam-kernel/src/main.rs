/**
 * KOLAM KERNEL - pond telemetry ingestion and alerting
 *
 * ROLE: wires config, sinks, rules, alert tracking, notifications, MQTT and HTTP.
 * Startup fails fast on bad configuration; everything after that degrades
 * per component instead of stopping the process.
 *
 * SHUTDOWN: SIGINT/SIGTERM cancels the MQTT listener and HTTP server, then
 * the ingest lanes drain what they already accepted.
 */

mod config;
mod coordinator;
mod decoder;
mod dispatch;
mod fanout;
mod health;
mod http;
mod models;
mod mqtt;
mod notify;
mod rules;
mod sinks;
mod tracker;

use crate::config::load_config;
use crate::coordinator::Pipeline;
use crate::decoder::Topics;
use crate::dispatch::{NotificationDispatcher, NotificationTransport, StoreRecipientDirectory};
use crate::fanout::{PersistenceFanOut, SENSOR_COLLECTION};
use crate::health::HealthTracker;
use crate::http::AppState;
use crate::notify::{LogNotifier, WebhookNotifier};
use crate::rules::RuleEvaluator;
use crate::sinks::cache::MemoryCache;
use crate::sinks::documents::JsonLinesStore;
use crate::sinks::influx::InfluxSink;
use crate::tracker::AlertTracker;

use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "kolam_kernel=info".into()),
        )
        .init();

    let cfg = load_config().await.context("invalid configuration")?;
    let rules = RuleEvaluator::new(cfg.rules.clone()).context("invalid alert rules")?;
    info!(
        cooldown_secs = cfg.alerts.cooldown().as_secs(),
        lanes = cfg.ingest.lanes,
        broker = %format!("{}:{}", cfg.mqtt.host, cfg.mqtt.port),
        "kolam kernel starting"
    );

    let shutdown = CancellationToken::new();

    // sinks
    let store = Arc::new(
        JsonLinesStore::open_with_history(&cfg.persistence.data_dir, &[SENSOR_COLLECTION])
            .await
            .with_context(|| format!("cannot open data dir {}", cfg.persistence.data_dir))?,
    );
    let cache = Arc::new(MemoryCache::new());
    MemoryCache::spawn_sweeper(cache.clone(), Duration::from_secs(cfg.persistence.cache_sweep_secs.max(1)), shutdown.clone());
    let influx = Arc::new(InfluxSink::new(&cfg.persistence.influx)?);
    let fanout = PersistenceFanOut::new(influx, cache, store.clone())
        .with_timeout(cfg.persistence.sink_timeout())
        .with_ttls(
            Duration::from_secs(cfg.persistence.latest_ttl_secs),
            Duration::from_secs(cfg.persistence.device_status_ttl_secs),
        );

    // notifications
    let notify_timeout = Duration::from_millis(cfg.notifications.timeout_ms);
    let transport: Arc<dyn NotificationTransport> = match &cfg.notifications.webhook_url {
        Some(url) => {
            info!(url = %url, "notifications via webhook");
            Arc::new(WebhookNotifier::new(url.as_str(), notify_timeout)?)
        }
        None => {
            warn!("no notification webhook configured, alerts are only logged");
            Arc::new(LogNotifier)
        }
    };
    let dispatcher = NotificationDispatcher::new(Arc::new(StoreRecipientDirectory::new(store.clone())), transport, store)
        .with_timeout(notify_timeout);

    // pipeline
    let health = HealthTracker::new();
    let topics = Topics::new(&cfg.mqtt.topic_prefix);
    let (client, eventloop) = mqtt::create_mqtt_client(&cfg.mqtt);
    let pipeline = Arc::new(Pipeline::new(
        topics.clone(),
        fanout,
        rules,
        AlertTracker::new(cfg.alerts.cooldown()),
        dispatcher,
        Arc::new(client.clone()),
        health.clone(),
        Arc::new(time::OffsetDateTime::now_utc),
    ));
    let (ingest, lanes) = coordinator::spawn_lanes(pipeline.clone(), cfg.ingest.lanes, cfg.ingest.lane_capacity);
    let listener = mqtt::spawn_mqtt_listener(client, eventloop, topics, ingest, health.clone(), shutdown.clone());

    // HTTP
    let app = http::build_router(AppState { pipeline, health });
    let addr = SocketAddr::from(([0, 0, 0, 0], cfg.http.port));
    let tcp = TcpListener::bind(addr).await.with_context(|| format!("cannot bind {addr}"))?;
    info!("listening on http://{addr}");
    let server_shutdown = shutdown.clone();
    let server = tokio::spawn(async move {
        axum::serve(tcp, app)
            .with_graceful_shutdown(async move { server_shutdown.cancelled().await })
            .await
    });

    wait_for_signal().await;
    info!("shutting down");
    shutdown.cancel();

    // The listener owns the last ingest handle; once it stops, lanes see their queues close.
    if let Err(e) = listener.await {
        warn!(error = %e, "MQTT listener ended abnormally");
    }
    let drain = futures::future::join_all(lanes);
    if tokio::time::timeout(DRAIN_TIMEOUT, drain).await.is_err() {
        warn!("ingest lanes did not drain in time");
    }
    server.await?.context("HTTP server failed")?;
    info!("stopped");
    Ok(())
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
                    _ = sigterm.recv() => info!("received SIGTERM"),
                }
                return;
            }
            Err(e) => warn!(error = %e, "cannot listen for SIGTERM"),
        }
    }
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "cannot listen for ctrl-c");
    }
}
