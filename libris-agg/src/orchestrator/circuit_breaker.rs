//! Per-provider circuit breakers
//!
//! ```text
//! Closed --N consecutive failures--> Open --cooldown--> HalfOpen
//!   ^                                  ^                   |
//!   |                                  +----probe fails----+
//!   +-------------------probe succeeds---------------------+
//! ```
//!
//! `RateLimited` opens the circuit immediately, for the provider's
//! retry-after when it sent one. Half-open admits exactly one probe.

use crate::config::BreakerConfig;
use crate::types::{ProviderError, ProviderId};
use chrono::Utc;
use libris_common::{EventBus, LibrisEvent};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

/// Longest an open circuit stays closed off, whatever the provider asked for
pub const MAX_OPEN_DURATION: Duration = Duration::from_secs(24 * 60 * 60);

fn open_until(now: Instant, cooldown: Duration) -> Instant {
    let cooldown = cooldown.min(MAX_OPEN_DURATION);
    now.checked_add(cooldown)
        .or_else(|| now.checked_add(MAX_OPEN_DURATION))
        .unwrap_or(now)
}

/// Externally visible breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy)]
enum Breaker {
    Closed { consecutive_failures: u32 },
    Open { until: Instant },
    HalfOpen { probe_in_flight: bool },
}

impl Breaker {
    fn state(&self) -> CircuitState {
        match self {
            Self::Closed { .. } => CircuitState::Closed,
            Self::Open { .. } => CircuitState::Open,
            Self::HalfOpen { .. } => CircuitState::HalfOpen,
        }
    }
}

impl Default for Breaker {
    fn default() -> Self {
        Self::Closed {
            consecutive_failures: 0,
        }
    }
}

/// Owned registry of one breaker per provider
pub struct CircuitBreakerRegistry {
    config: BreakerConfig,
    breakers: Mutex<HashMap<ProviderId, Breaker>>,
    events: Option<EventBus>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            breakers: Mutex::new(HashMap::new()),
            events: None,
        }
    }

    /// Broadcast `CircuitStateChanged` on every transition
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ProviderId, Breaker>> {
        // Breaker state stays consistent even if a holder panicked
        self.breakers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn transition(&self, provider: ProviderId, old: CircuitState, new: CircuitState) {
        if old == new {
            return;
        }
        match new {
            CircuitState::Open => {
                tracing::warn!(provider = %provider, from = %old, "Circuit opened")
            }
            _ => tracing::info!(provider = %provider, from = %old, to = %new, "Circuit state changed"),
        }
        if let Some(events) = &self.events {
            events.emit_lossy(LibrisEvent::CircuitStateChanged {
                provider: provider.to_string(),
                old_state: old.to_string(),
                new_state: new.to_string(),
                timestamp: Utc::now(),
            });
        }
    }

    /// Whether a call to `provider` may proceed now
    ///
    /// An open circuit past its cooldown moves to half-open and admits this
    /// caller as the single probe.
    pub fn try_acquire(&self, provider: ProviderId) -> bool {
        let mut breakers = self.lock();
        let breaker = breakers.entry(provider).or_default();
        let old = breaker.state();

        let admitted = match *breaker {
            Breaker::Closed { .. } => true,
            Breaker::Open { until } if Instant::now() >= until => {
                *breaker = Breaker::HalfOpen {
                    probe_in_flight: true,
                };
                true
            }
            Breaker::Open { .. } => false,
            Breaker::HalfOpen {
                probe_in_flight: true,
            } => false,
            Breaker::HalfOpen {
                probe_in_flight: false,
            } => {
                *breaker = Breaker::HalfOpen {
                    probe_in_flight: true,
                };
                true
            }
        };

        let new = breaker.state();
        drop(breakers);
        self.transition(provider, old, new);
        admitted
    }

    /// Provider answered (including "nothing here")
    ///
    /// A success that lands while the circuit is open came from a call
    /// admitted before it opened; only the half-open probe may close it.
    pub fn record_success(&self, provider: ProviderId) {
        let mut breakers = self.lock();
        let breaker = breakers.entry(provider).or_default();
        let old = breaker.state();
        if old == CircuitState::Open {
            return;
        }
        *breaker = Breaker::default();
        drop(breakers);
        self.transition(provider, old, CircuitState::Closed);
    }

    /// Record one call outcome that was not a success
    ///
    /// `NotFound` is a healthy answer and is counted as a success.
    pub fn record_failure(&self, provider: ProviderId, error: &ProviderError) {
        if !error.is_failure() {
            self.record_success(provider);
            return;
        }

        let now = Instant::now();
        let cooldown = match error {
            ProviderError::RateLimited {
                retry_after: Some(retry_after),
            } => *retry_after,
            _ => self.config.cooldown(),
        };
        let threshold = self.config.failure_threshold.max(1);

        let mut breakers = self.lock();
        let breaker = breakers.entry(provider).or_default();
        let old = breaker.state();

        *breaker = match *breaker {
            Breaker::Closed {
                consecutive_failures,
            } => {
                let failures = consecutive_failures + 1;
                if failures >= threshold || matches!(error, ProviderError::RateLimited { .. }) {
                    Breaker::Open {
                        until: open_until(now, cooldown),
                    }
                } else {
                    Breaker::Closed {
                        consecutive_failures: failures,
                    }
                }
            }
            Breaker::HalfOpen { .. } => Breaker::Open {
                until: open_until(now, cooldown),
            },
            // Late result from a call admitted before the circuit opened
            Breaker::Open { until } => Breaker::Open {
                until: until.max(open_until(now, cooldown)),
            },
        };

        let new = breaker.state();
        drop(breakers);
        self.transition(provider, old, new);
    }

    pub fn state(&self, provider: ProviderId) -> CircuitState {
        self.lock()
            .get(&provider)
            .map(Breaker::state)
            .unwrap_or(CircuitState::Closed)
    }

    /// State of every provider, in `ProviderId::ALL` order
    pub fn snapshot(&self) -> Vec<(ProviderId, CircuitState)> {
        let breakers = self.lock();
        ProviderId::ALL
            .iter()
            .map(|p| {
                (
                    *p,
                    breakers.get(p).map(Breaker::state).unwrap_or(CircuitState::Closed),
                )
            })
            .collect()
    }

    /// Close every circuit
    pub fn reset(&self) {
        self.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> CircuitBreakerRegistry {
        CircuitBreakerRegistry::new(BreakerConfig {
            failure_threshold: 3,
            cooldown_secs: 30,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_consecutive_failures() {
        let breakers = registry();
        let p = ProviderId::Ratings;

        for _ in 0..2 {
            assert!(breakers.try_acquire(p));
            breakers.record_failure(p, &ProviderError::Timeout);
        }
        assert_eq!(breakers.state(p), CircuitState::Closed);

        assert!(breakers.try_acquire(p));
        breakers.record_failure(p, &ProviderError::Unavailable("503".to_string()));
        assert_eq!(breakers.state(p), CircuitState::Open);
        assert!(!breakers.try_acquire(p));
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_failure_count() {
        let breakers = registry();
        let p = ProviderId::Catalog;
        breakers.record_failure(p, &ProviderError::Timeout);
        breakers.record_failure(p, &ProviderError::Timeout);
        breakers.record_failure(p, &ProviderError::NotFound);
        breakers.record_failure(p, &ProviderError::Timeout);
        assert_eq!(breakers.state(p), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_admits_single_probe() {
        let breakers = registry();
        let p = ProviderId::Publisher;
        for _ in 0..3 {
            breakers.record_failure(p, &ProviderError::Timeout);
        }
        assert!(!breakers.try_acquire(p));

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(breakers.try_acquire(p));
        assert_eq!(breakers.state(p), CircuitState::HalfOpen);
        assert!(!breakers.try_acquire(p));

        breakers.record_success(p);
        assert_eq!(breakers.state(p), CircuitState::Closed);
        assert!(breakers.try_acquire(p));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_probe_reopens() {
        let breakers = registry();
        let p = ProviderId::Storefront;
        for _ in 0..3 {
            breakers.record_failure(p, &ProviderError::Timeout);
        }
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(breakers.try_acquire(p));
        breakers.record_failure(p, &ProviderError::Timeout);
        assert_eq!(breakers.state(p), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(29)).await;
        assert!(!breakers.try_acquire(p));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_opens_immediately_for_retry_after() {
        let breakers = registry();
        let p = ProviderId::Catalog;
        breakers.record_failure(
            p,
            &ProviderError::RateLimited {
                retry_after: Some(Duration::from_secs(5)),
            },
        );
        assert_eq!(breakers.state(p), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(breakers.try_acquire(p));
    }

    #[tokio::test]
    async fn test_transitions_are_broadcast() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        let breakers = registry().with_events(bus);
        let p = ProviderId::Ratings;
        breakers.record_failure(p, &ProviderError::RateLimited { retry_after: None });

        match rx.recv().await.unwrap() {
            LibrisEvent::CircuitStateChanged {
                provider,
                old_state,
                new_state,
                ..
            } => {
                assert_eq!(provider, "ratings");
                assert_eq!(old_state, "closed");
                assert_eq!(new_state, "open");
            }
            other => panic!("unexpected event {:?}", other),
        }

        breakers.reset();
        assert!(breakers
            .snapshot()
            .iter()
            .all(|(_, state)| *state == CircuitState::Closed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_success_does_not_close_open_circuit() {
        let breakers = registry();
        let p = ProviderId::Catalog;
        for _ in 0..3 {
            breakers.record_failure(p, &ProviderError::Timeout);
        }
        assert_eq!(breakers.state(p), CircuitState::Open);

        // A call admitted before the circuit opened answers late
        breakers.record_success(p);
        assert_eq!(breakers.state(p), CircuitState::Open);
        assert!(!breakers.try_acquire(p));

        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(breakers.try_acquire(p));
        breakers.record_success(p);
        assert_eq!(breakers.state(p), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_huge_retry_after_is_capped() {
        let breakers = registry();
        let p = ProviderId::Storefront;
        let throttled = ProviderError::RateLimited {
            retry_after: Some(Duration::from_secs(u64::MAX)),
        };
        breakers.record_failure(p, &throttled);
        assert_eq!(breakers.state(p), CircuitState::Open);

        // Late failures while open extend from the capped deadline too
        breakers.record_failure(p, &throttled);
        assert_eq!(breakers.state(p), CircuitState::Open);

        tokio::time::advance(MAX_OPEN_DURATION - Duration::from_secs(1)).await;
        assert!(!breakers.try_acquire(p));
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(breakers.try_acquire(p));

        breakers.record_failure(p, &throttled);
        assert_eq!(breakers.state(p), CircuitState::Open);
    }
}
