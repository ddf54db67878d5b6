//! Alert state per (pond, metric): deduplication, escalation, resolution.
//!
//! ```text
//! Inactive --breach--> Active (notify)
//! Active --same/lower severity, in cool-down--> Active (suppressed, record refreshed)
//! Active --same/lower severity, cool-down over--> Active (notify again)
//! Active --escalation--> Active (notify now)
//! Active --back in range--> Inactive (record resolved, no notification)
//! ```
//!
//! Callers take the key's async lock with [`AlertTracker::lock`] and keep it
//! until the resulting notification has been dispatched, so transitions for
//! one key never interleave. Keys with nothing active are handed back with
//! [`AlertTracker::release`] so the map only holds live alerts.

use crate::models::{Alert, AlertCandidate, AlertKey, AlertStatus, Severity};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use tokio::sync::OwnedMutexGuard;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FireReason {
    New,
    Escalated,
    CooldownElapsed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Notify recipients about this alert.
    Fire { alert: Alert, reason: FireReason },
    /// Active alert refreshed, no notification.
    Suppress { alert: Alert },
    /// Active alert cleared.
    Resolve { alert: Alert },
    /// Nothing active and nothing to report.
    Idle,
}

#[derive(Debug, Clone)]
struct Active {
    alert: Alert,
    notified_severity: Severity,
    last_notified_at: OffsetDateTime,
}

/// State machine of one key.
#[derive(Debug, Default)]
pub struct KeyState {
    active: Option<Active>,
}

impl KeyState {
    pub fn active(&self) -> Option<&Alert> {
        self.active.as_ref().map(|a| &a.alert)
    }

    pub fn on_breach(&mut self, candidate: AlertCandidate, now: OffsetDateTime, cooldown: Duration) -> Decision {
        let Some(active) = self.active.as_mut() else {
            let alert = Alert::open(candidate, now);
            self.active = Some(Active {
                alert: alert.clone(),
                notified_severity: alert.severity,
                last_notified_at: now,
            });
            return Decision::Fire { alert, reason: FireReason::New };
        };

        active.alert.severity = candidate.severity;
        active.alert.value = candidate.value;
        active.alert.message = candidate.message;
        active.alert.updated_at = now;

        let reason = if candidate.severity > active.notified_severity {
            Some(FireReason::Escalated)
        } else if now - active.last_notified_at >= cooldown {
            Some(FireReason::CooldownElapsed)
        } else {
            None
        };

        match reason {
            Some(reason) => {
                active.notified_severity = candidate.severity;
                active.last_notified_at = now;
                Decision::Fire { alert: active.alert.clone(), reason }
            }
            None => Decision::Suppress { alert: active.alert.clone() },
        }
    }

    pub fn on_in_range(&mut self, now: OffsetDateTime) -> Decision {
        match self.active.take() {
            Some(Active { mut alert, .. }) => {
                alert.status = AlertStatus::Resolved;
                alert.updated_at = now;
                alert.resolved_at = Some(now);
                Decision::Resolve { alert }
            }
            None => Decision::Idle,
        }
    }
}

pub struct AlertTracker {
    cooldown: Duration,
    // An entry is only removed while its one outside reference is the releasing guard.
    keys: Mutex<HashMap<AlertKey, Arc<tokio::sync::Mutex<KeyState>>>>,
}

impl AlertTracker {
    pub fn new(cooldown: std::time::Duration) -> Self {
        Self {
            cooldown: Duration::try_from(cooldown).unwrap_or(Duration::MAX),
            keys: Mutex::new(HashMap::new()),
        }
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    /// Exclusive access to one key's state.
    pub async fn lock(&self, key: &AlertKey) -> OwnedMutexGuard<KeyState> {
        let slot = self.keys.lock().entry(key.clone()).or_default().clone();
        slot.lock_owned().await
    }

    /// Drops the guard, forgetting the key if it is idle and nobody else is waiting on it.
    pub fn release(&self, key: &AlertKey, guard: OwnedMutexGuard<KeyState>) {
        let mut keys = self.keys.lock();
        if guard.active().is_none() {
            // Map entry plus the guard's own handle; anyone else would raise the count.
            if keys.get(key).is_some_and(|slot| Arc::strong_count(slot) == 2) {
                keys.remove(key);
            }
        }
        drop(guard);
    }

    /// Currently active alerts. Waits for keys that are mid-transition.
    pub async fn active_alerts(&self) -> Vec<Alert> {
        let slots: Vec<_> = self.keys.lock().values().cloned().collect();
        let mut alerts = Vec::new();
        for slot in slots {
            if let Some(alert) = slot.lock().await.active() {
                alerts.push(alert.clone());
            }
        }
        alerts.sort_by(|a, b| a.key().cmp(&b.key()));
        alerts
    }

    #[cfg(test)]
    pub fn tracked_keys(&self) -> usize {
        self.keys.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AlertSource, MetricKind};
    use time::macros::datetime;

    const COOLDOWN: Duration = Duration::minutes(15);

    fn candidate(severity: Severity, value: f64) -> AlertCandidate {
        AlertCandidate {
            metric: MetricKind::Temperature,
            severity,
            message: format!("Temperature {value}°C is out of normal range (20-30°C)"),
            value,
            pond_id: "pond-a".into(),
            source: AlertSource::Rule,
        }
    }

    #[test]
    fn test_first_breach_fires() {
        let mut state = KeyState::default();
        let t0 = datetime!(2024-05-01 08:00 UTC);
        match state.on_breach(candidate(Severity::Critical, 40.0), t0, COOLDOWN) {
            Decision::Fire { alert, reason } => {
                assert_eq!(reason, FireReason::New);
                assert_eq!(alert.status, AlertStatus::Active);
                assert_eq!(alert.created_at, t0);
            }
            other => panic!("expected fire, got {other:?}"),
        }
        assert!(state.active().is_some());
    }

    #[test]
    fn test_repeat_within_cooldown_is_suppressed_then_refires() {
        let mut state = KeyState::default();
        let t0 = datetime!(2024-05-01 08:00 UTC);
        let first = state.on_breach(candidate(Severity::Critical, 40.0), t0, COOLDOWN);
        let Decision::Fire { alert: opened, .. } = first else { panic!("expected fire") };

        let second = state.on_breach(candidate(Severity::Critical, 41.0), t0 + Duration::minutes(5), COOLDOWN);
        match second {
            Decision::Suppress { alert } => {
                assert_eq!(alert.id, opened.id);
                assert_eq!(alert.value, 41.0, "record keeps the latest value");
                assert_eq!(alert.updated_at, t0 + Duration::minutes(5));
            }
            other => panic!("expected suppress, got {other:?}"),
        }

        let third = state.on_breach(candidate(Severity::Critical, 40.5), t0 + Duration::minutes(16), COOLDOWN);
        assert!(matches!(third, Decision::Fire { reason: FireReason::CooldownElapsed, ref alert } if alert.id == opened.id));

        // Cool-down restarts from the last notification.
        let fourth = state.on_breach(candidate(Severity::Critical, 40.5), t0 + Duration::minutes(20), COOLDOWN);
        assert!(matches!(fourth, Decision::Suppress { .. }));
    }

    #[test]
    fn test_escalation_ignores_cooldown() {
        let mut state = KeyState::default();
        let t0 = datetime!(2024-05-01 08:00 UTC);
        state.on_breach(candidate(Severity::Warning, 32.0), t0, COOLDOWN);
        let escalated = state.on_breach(candidate(Severity::Critical, 36.0), t0 + Duration::minutes(1), COOLDOWN);
        assert!(matches!(
            escalated,
            Decision::Fire { reason: FireReason::Escalated, ref alert } if alert.severity == Severity::Critical
        ));

        // Dropping back to warning and rising again stays quiet inside the window.
        let lower = state.on_breach(candidate(Severity::Warning, 33.0), t0 + Duration::minutes(2), COOLDOWN);
        assert!(matches!(lower, Decision::Suppress { ref alert } if alert.severity == Severity::Warning));
        let again = state.on_breach(candidate(Severity::Critical, 36.0), t0 + Duration::minutes(3), COOLDOWN);
        assert!(matches!(again, Decision::Suppress { .. }));
    }

    #[test]
    fn test_back_in_range_resolves_and_clears() {
        let mut state = KeyState::default();
        let t0 = datetime!(2024-05-01 08:00 UTC);
        assert_eq!(state.on_in_range(t0), Decision::Idle);

        let Decision::Fire { alert: opened, .. } = state.on_breach(candidate(Severity::Warning, 31.0), t0, COOLDOWN) else {
            panic!("expected fire")
        };
        let resolved = state.on_in_range(t0 + Duration::minutes(3));
        match resolved {
            Decision::Resolve { alert } => {
                assert_eq!(alert.id, opened.id);
                assert_eq!(alert.status, AlertStatus::Resolved);
                assert_eq!(alert.resolved_at, Some(t0 + Duration::minutes(3)));
            }
            other => panic!("expected resolve, got {other:?}"),
        }
        assert!(state.active().is_none());

        // A new breach after resolution is a new episode.
        let reopened = state.on_breach(candidate(Severity::Warning, 31.0), t0 + Duration::minutes(4), COOLDOWN);
        assert!(matches!(reopened, Decision::Fire { reason: FireReason::New, ref alert } if alert.id != opened.id));
    }

    #[tokio::test]
    async fn test_tracker_keys_are_independent() {
        let tracker = AlertTracker::new(std::time::Duration::from_secs(900));
        assert_eq!(tracker.cooldown(), Duration::minutes(15));
        let t0 = datetime!(2024-05-01 08:00 UTC);

        let temp_a = AlertKey::new("pond-a", MetricKind::Temperature);
        let temp_b = AlertKey::new("pond-b", MetricKind::Temperature);
        {
            let mut a = tracker.lock(&temp_a).await;
            // Holding one key does not block another.
            let mut b = tracker.lock(&temp_b).await;
            a.on_breach(candidate(Severity::Warning, 31.0), t0, tracker.cooldown());
            let mut other_pond = candidate(Severity::Critical, 40.0);
            other_pond.pond_id = "pond-b".into();
            b.on_breach(other_pond, t0, tracker.cooldown());
        }
        let active = tracker.active_alerts().await;
        assert_eq!(active.len(), 2);
        assert_eq!(active[0].pond_id, "pond-a");

        let state = tracker.lock(&temp_a).await;
        assert_eq!(state.active().map(|a| a.severity), Some(Severity::Warning));
    }

    #[tokio::test]
    async fn test_release_forgets_idle_keys_only() {
        let tracker = AlertTracker::new(std::time::Duration::from_secs(900));
        let t0 = datetime!(2024-05-01 08:00 UTC);
        let key = AlertKey::new("pond-a", MetricKind::Temperature);

        let idle = tracker.lock(&key).await;
        tracker.release(&key, idle);
        assert_eq!(tracker.tracked_keys(), 0);

        let mut busy = tracker.lock(&key).await;
        busy.on_breach(candidate(Severity::Warning, 31.0), t0, tracker.cooldown());
        tracker.release(&key, busy);
        assert_eq!(tracker.tracked_keys(), 1);

        // A second holder of the slot keeps the entry even when it goes idle.
        let mut state = tracker.lock(&key).await;
        let waiter = tracker.keys.lock().get(&key).cloned().unwrap();
        state.on_in_range(t0 + Duration::minutes(1));
        tracker.release(&key, state);
        assert_eq!(tracker.tracked_keys(), 1);
        drop(waiter);

        let state = tracker.lock(&key).await;
        tracker.release(&key, state);
        assert_eq!(tracker.tracked_keys(), 0);
    }

    #[tokio::test]
    async fn test_active_alerts_waits_for_busy_keys() {
        let tracker = Arc::new(AlertTracker::new(std::time::Duration::from_secs(900)));
        let key = AlertKey::new("pond-a", MetricKind::Temperature);
        let mut state = tracker.lock(&key).await;
        state.on_breach(candidate(Severity::Critical, 40.0), datetime!(2024-05-01 08:00 UTC), tracker.cooldown());

        let reader = tokio::spawn({
            let tracker = tracker.clone();
            async move { tracker.active_alerts().await.len() }
        });
        tokio::task::yield_now().await;
        assert!(!reader.is_finished());
        drop(state);
        assert_eq!(reader.await.unwrap(), 1);
    }
}
