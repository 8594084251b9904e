use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Disabled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderHealth {
    pub provider: String,
    pub status: HealthStatus,
    pub latency_ms: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub checked_at: OffsetDateTime,
    pub consecutive_failures: u32,
}

const DEGRADED_LATENCY: Duration = Duration::from_secs(5);
const UNHEALTHY_FAILURES: u32 = 3;

/// Health derived from observed call outcomes. Each provider entry is
/// mutated under the lock on request completion; the admin emitter reads
/// snapshots.
pub struct HealthTracker {
    inner: Mutex<HashMap<String, ProviderHealth>>,
}

impl HealthTracker {
    pub fn new(providers: &[String]) -> Self {
        let now = OffsetDateTime::now_utc();
        let inner = providers
            .iter()
            .map(|name| {
                (
                    name.clone(),
                    ProviderHealth {
                        provider: name.clone(),
                        status: HealthStatus::Healthy,
                        latency_ms: 0,
                        checked_at: now,
                        consecutive_failures: 0,
                    },
                )
            })
            .collect();
        Self {
            inner: Mutex::new(inner),
        }
    }

    pub fn mark_disabled(&self, provider: &str) {
        let mut inner = self.lock();
        if let Some(entry) = inner.get_mut(provider) {
            entry.status = HealthStatus::Disabled;
            entry.checked_at = OffsetDateTime::now_utc();
        }
    }

    pub fn record_success(&self, provider: &str, latency: Duration) {
        let mut inner = self.lock();
        let Some(entry) = inner.get_mut(provider) else {
            return;
        };
        entry.latency_ms = latency.as_millis() as u64;
        entry.consecutive_failures = 0;
        entry.status = if latency >= DEGRADED_LATENCY {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };
        entry.checked_at = OffsetDateTime::now_utc();
    }

    pub fn record_failure(&self, provider: &str) {
        let mut inner = self.lock();
        let Some(entry) = inner.get_mut(provider) else {
            return;
        };
        entry.consecutive_failures = entry.consecutive_failures.saturating_add(1);
        entry.status = if entry.consecutive_failures >= UNHEALTHY_FAILURES {
            HealthStatus::Unhealthy
        } else {
            HealthStatus::Degraded
        };
        entry.checked_at = OffsetDateTime::now_utc();
    }

    pub fn snapshot(&self) -> Vec<ProviderHealth> {
        let mut entries: Vec<ProviderHealth> = self.lock().values().cloned().collect();
        entries.sort_by(|a, b| a.provider.cmp(&b.provider));
        entries
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, ProviderHealth>> {
        self.inner.lock().unwrap_or_else(|poison| poison.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> HealthTracker {
        HealthTracker::new(&["openai".to_string(), "gemini".to_string()])
    }

    #[test]
    fn failures_degrade_then_mark_unhealthy() {
        let health = tracker();
        health.record_failure("openai");
        health.record_failure("openai");
        let entry = &health.snapshot()[1];
        assert_eq!(entry.provider, "openai");
        assert_eq!(entry.status, HealthStatus::Degraded);

        health.record_failure("openai");
        let entry = health
            .snapshot()
            .into_iter()
            .find(|entry| entry.provider == "openai")
            .unwrap();
        assert_eq!(entry.status, HealthStatus::Unhealthy);
        assert_eq!(entry.consecutive_failures, 3);
    }

    #[test]
    fn success_recovers_and_records_latency() {
        let health = tracker();
        health.record_failure("gemini");
        health.record_success("gemini", Duration::from_millis(120));
        let entry = health
            .snapshot()
            .into_iter()
            .find(|entry| entry.provider == "gemini")
            .unwrap();
        assert_eq!(entry.status, HealthStatus::Healthy);
        assert_eq!(entry.latency_ms, 120);
        assert_eq!(entry.consecutive_failures, 0);
    }

    #[test]
    fn slow_success_is_degraded() {
        let health = tracker();
        health.record_success("openai", Duration::from_secs(6));
        let entry = health
            .snapshot()
            .into_iter()
            .find(|entry| entry.provider == "openai")
            .unwrap();
        assert_eq!(entry.status, HealthStatus::Degraded);
    }

    #[test]
    fn disabled_providers_stay_visible() {
        let health = tracker();
        health.mark_disabled("gemini");
        let entry = &health.snapshot()[0];
        assert_eq!(entry.provider, "gemini");
        assert_eq!(entry.status, HealthStatus::Disabled);
    }
}
