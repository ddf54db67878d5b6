//! In-process fast-access cache with per-key expiry.

use super::{FastCache, SinkError};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const FALLBACK_TTL: Duration = Duration::from_secs(365 * 24 * 3_600);

#[derive(Debug)]
struct Entry {
    value: Value,
    expires_at: Instant,
}

#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops expired entries, returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, e| e.expires_at > now);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Periodic sweep so keys that are never read again do not pile up.
    pub fn spawn_sweeper(cache: Arc<Self>, every: Duration, shutdown: CancellationToken) {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let removed = cache.purge_expired();
                        if removed > 0 {
                            tracing::debug!(removed, remaining = cache.len(), "cache sweep");
                        }
                    }
                    _ = shutdown.cancelled() => break,
                }
            }
        });
    }
}

#[async_trait]
impl FastCache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<Value>, SinkError> {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => Ok(Some(entry.value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set_ex(&self, key: &str, value: Value, ttl: Duration) -> Result<(), SinkError> {
        let now = Instant::now();
        // Instant cannot represent arbitrarily far expiries.
        let expires_at = now.checked_add(ttl).unwrap_or_else(|| now + FALLBACK_TTL);
        let entry = Entry { value, expires_at };
        self.entries.lock().insert(key.to_string(), entry);
        Ok(())
    }
}
