use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::info;

use rad_common::GatewayError;

use crate::events::{AdminEvent, CircuitTransition, EventHub};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy)]
pub struct CircuitConfig {
    /// Consecutive failures before the circuit opens.
    pub failure_threshold: u32,
    /// How long an open circuit waits before admitting a probe.
    pub open_cooldown: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_cooldown: Duration::from_secs(30),
        }
    }
}

#[derive(Debug)]
struct CircuitInner {
    state: CircuitState,
    opened_at: Option<Instant>,
    consecutive_failures: u32,
    reason: Option<String>,
    probe_in_flight: bool,
}

/// Per-provider three-state guard. State mutation is serialized under the
/// lock; transitions are published to the admin hub.
pub struct CircuitBreaker {
    provider: String,
    config: CircuitConfig,
    hub: EventHub,
    inner: Mutex<CircuitInner>,
}

impl CircuitBreaker {
    pub fn new(provider: impl Into<String>, config: CircuitConfig, hub: EventHub) -> Self {
        Self {
            provider: provider.into(),
            config,
            hub,
            inner: Mutex::new(CircuitInner {
                state: CircuitState::Closed,
                opened_at: None,
                consecutive_failures: 0,
                reason: None,
                probe_in_flight: false,
            }),
        }
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Admission check. `Closed` always admits; `Open` admits nothing until
    /// the cooldown elapses, at which point the circuit moves to `HalfOpen`
    /// and admits exactly one probe.
    pub fn check(&self) -> Result<(), GatewayError> {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|at| at.elapsed())
                    .unwrap_or(Duration::ZERO);
                if elapsed >= self.config.open_cooldown {
                    self.transition(&mut inner, CircuitState::HalfOpen, None);
                    inner.probe_in_flight = true;
                    Ok(())
                } else {
                    Err(GatewayError::CircuitOpen {
                        provider: self.provider.clone(),
                        retry_after: self.config.open_cooldown - elapsed,
                    })
                }
            }
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    Err(GatewayError::CircuitOpen {
                        provider: self.provider.clone(),
                        retry_after: self.config.open_cooldown,
                    })
                } else {
                    inner.probe_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.lock();
        inner.consecutive_failures = 0;
        inner.probe_in_flight = false;
        if inner.state != CircuitState::Closed {
            self.transition(&mut inner, CircuitState::Closed, None);
            inner.opened_at = None;
            inner.reason = None;
        }
    }

    pub fn record_failure(&self, reason: &str) {
        let mut inner = self.lock();
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        inner.probe_in_flight = false;
        let should_open = match inner.state {
            // A failed half-open probe reopens immediately.
            CircuitState::HalfOpen => true,
            CircuitState::Closed => {
                inner.consecutive_failures >= self.config.failure_threshold
            }
            CircuitState::Open => false,
        };
        if should_open {
            inner.reason = Some(reason.to_string());
            self.transition(&mut inner, CircuitState::Open, Some(reason.to_string()));
            inner.opened_at = Some(Instant::now());
        }
    }

    fn transition(&self, inner: &mut CircuitInner, to: CircuitState, reason: Option<String>) {
        let from = inner.state;
        inner.state = to;
        info!(
            event = "circuit_transition",
            provider = %self.provider,
            from = ?from,
            to = ?to
        );
        self.hub.emit(AdminEvent::ProviderCircuit(CircuitTransition {
            provider: self.provider.clone(),
            from,
            to,
            reason,
            at: OffsetDateTime::now_utc().unix_timestamp(),
        }));
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CircuitInner> {
        self.inner.lock().unwrap_or_else(|poison| poison.into_inner())
    }
}

/// Process-global breaker registry; built during startup, one breaker per
/// registered provider. No lazy re-initialization.
pub struct CircuitRegistry {
    breakers: HashMap<String, Arc<CircuitBreaker>>,
}

impl CircuitRegistry {
    pub fn new(providers: &[String], config: CircuitConfig, hub: EventHub) -> Self {
        let breakers = providers
            .iter()
            .map(|name| {
                (
                    name.clone(),
                    Arc::new(CircuitBreaker::new(name.clone(), config, hub.clone())),
                )
            })
            .collect();
        Self { breakers }
    }

    pub fn get(&self, provider: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(provider).cloned()
    }

    pub fn states(&self) -> HashMap<String, CircuitState> {
        self.breakers
            .iter()
            .map(|(name, breaker)| (name.clone(), breaker.state()))
            .collect()
    }
}
