// Clima Agent -- Circuit breaker
//
// One breaker per protected upstream resource.
//
// - CLOSED: all calls pass. Failures inside the rolling window are counted;
//   reaching the threshold trips the breaker.
// - OPEN: calls fail fast until the cool-down since the trip has elapsed.
// - HALF_OPEN: exactly one trial is admitted. Success (or a neutral outcome)
//   closes the circuit; failure re-opens it and restarts the cool-down.
//
// Admission hands out a `CallPermit`. Resolving it reports the outcome;
// dropping it unresolved only releases the trial slot.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use crate::rate_limit::retry_after_secs;

/// Hint returned while a half-open trial is in flight. The trial settles the
/// circuit within one upstream round trip, after which the caller gets either
/// a closed circuit or a fresh cool-down hint.
pub const TRIAL_RETRY_HINT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    fn label(self) -> &'static str {
        match self {
            BreakerState::Closed => "CLOSED",
            BreakerState::Open => "OPEN",
            BreakerState::HalfOpen => "HALF_OPEN",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerPolicy {
    pub failure_threshold: u32,
    /// Failures further apart than this do not accumulate.
    pub failure_window: Duration,
    pub cooldown: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("circuit open for '{resource}', failing fast (retry in {}s)", retry_after_secs(.retry_after))]
pub struct CircuitOpen {
    pub resource: String,
    pub retry_after: Duration,
}

impl CircuitOpen {
    pub fn retry_after_secs(&self) -> u64 {
        retry_after_secs(&self.retry_after)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Success,
    Failure,
    Neutral,
}

#[derive(Debug)]
struct CircuitState {
    state: BreakerState,
    failure_count: u32,
    last_failure_at: Option<Instant>,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub resource: String,
    pub state: BreakerState,
    pub failure_count: u32,
    pub seconds_since_last_failure: Option<u64>,
    pub seconds_since_opened: Option<u64>,
    pub trips: u64,
    pub short_circuited: u64,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    resource: String,
    policy: BreakerPolicy,
    state: Mutex<CircuitState>,
    trips: AtomicU64,
    short_circuited: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(resource: impl Into<String>, policy: BreakerPolicy) -> Self {
        Self {
            resource: resource.into(),
            policy,
            state: Mutex::new(CircuitState {
                state: BreakerState::Closed,
                failure_count: 0,
                last_failure_at: None,
                opened_at: None,
                trial_in_flight: false,
            }),
            trips: AtomicU64::new(0),
            short_circuited: AtomicU64::new(0),
        }
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CircuitState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn state(&self) -> BreakerState {
        self.lock().state
    }

    /// Ask to call the resource. Returns a permit that must be resolved with
    /// the call's outcome.
    pub fn try_acquire(self: &Arc<Self>) -> Result<CallPermit, CircuitOpen> {
        self.try_acquire_at(Instant::now())
    }

    pub(crate) fn try_acquire_at(self: &Arc<Self>, now: Instant) -> Result<CallPermit, CircuitOpen> {
        let mut st = self.lock();
        let trial = match st.state {
            BreakerState::Closed => false,
            BreakerState::Open => {
                let opened = st.opened_at.unwrap_or(now);
                let elapsed = now.duration_since(opened);
                if elapsed < self.policy.cooldown {
                    drop(st);
                    return Err(self.reject(self.policy.cooldown - elapsed));
                }
                st.state = BreakerState::HalfOpen;
                st.trial_in_flight = true;
                tracing::info!(
                    "circuit_breaker[{}]: OPEN -> HALF_OPEN (cool-down elapsed, admitting trial)",
                    self.resource
                );
                true
            }
            BreakerState::HalfOpen => {
                if st.trial_in_flight {
                    drop(st);
                    return Err(self.reject(TRIAL_RETRY_HINT));
                }
                st.trial_in_flight = true;
                true
            }
        };
        Ok(CallPermit {
            breaker: Arc::clone(self),
            trial,
            resolved: false,
        })
    }

    /// Check without admitting: `Err` only while OPEN and cooling down.
    /// Used to refuse task submission early; the worker acquires for real.
    pub fn peek(&self) -> Result<(), CircuitOpen> {
        self.peek_at(Instant::now())
    }

    pub(crate) fn peek_at(&self, now: Instant) -> Result<(), CircuitOpen> {
        let st = self.lock();
        if st.state != BreakerState::Open {
            return Ok(());
        }
        let elapsed = st.opened_at.map(|t| now.duration_since(t)).unwrap_or_default();
        if elapsed >= self.policy.cooldown {
            return Ok(());
        }
        drop(st);
        Err(self.reject(self.policy.cooldown - elapsed))
    }

    fn reject(&self, retry_after: Duration) -> CircuitOpen {
        self.short_circuited.fetch_add(1, Ordering::Relaxed);
        CircuitOpen {
            resource: self.resource.clone(),
            retry_after,
        }
    }

    fn record(&self, outcome: Outcome, trial: bool, now: Instant) {
        let mut st = self.lock();
        let prev = st.state;
        match (st.state, outcome) {
            (BreakerState::Closed, Outcome::Success) => st.failure_count = 0,
            (BreakerState::Closed, Outcome::Failure) => {
                let within_window = st
                    .last_failure_at
                    .is_some_and(|t| now.duration_since(t) <= self.policy.failure_window);
                st.failure_count = if within_window { st.failure_count + 1 } else { 1 };
                st.last_failure_at = Some(now);
                if st.failure_count >= self.policy.failure_threshold {
                    st.state = BreakerState::Open;
                    st.opened_at = Some(now);
                    self.trips.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        "circuit_breaker[{}]: TRIPPED after {} failures, failing fast for {}s",
                        self.resource,
                        st.failure_count,
                        self.policy.cooldown.as_secs()
                    );
                }
            }
            (BreakerState::HalfOpen, Outcome::Success | Outcome::Neutral) if trial => {
                st.state = BreakerState::Closed;
                st.failure_count = 0;
                st.opened_at = None;
                st.trial_in_flight = false;
            }
            (BreakerState::HalfOpen, Outcome::Failure) if trial => {
                st.state = BreakerState::Open;
                st.opened_at = Some(now);
                st.last_failure_at = Some(now);
                st.trial_in_flight = false;
                self.trips.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    "circuit_breaker[{}]: trial failed, HALF_OPEN -> OPEN for {}s",
                    self.resource,
                    self.policy.cooldown.as_secs()
                );
            }
            // Late reports from calls admitted before the trip.
            (_, Outcome::Failure) => st.last_failure_at = Some(now),
            _ => {}
        }
        if prev != st.state && st.state == BreakerState::Closed {
            tracing::info!(
                "circuit_breaker[{}]: {} -> CLOSED (trial answered)",
                self.resource,
                prev.label()
            );
        }
    }

    fn release_trial(&self) {
        let mut st = self.lock();
        if st.state == BreakerState::HalfOpen {
            st.trial_in_flight = false;
        }
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let now = Instant::now();
        let st = self.lock();
        BreakerSnapshot {
            resource: self.resource.clone(),
            state: st.state,
            failure_count: st.failure_count,
            seconds_since_last_failure: st.last_failure_at.map(|t| now.duration_since(t).as_secs()),
            seconds_since_opened: st.opened_at.map(|t| now.duration_since(t).as_secs()),
            trips: self.trips.load(Ordering::Relaxed),
            short_circuited: self.short_circuited.load(Ordering::Relaxed),
        }
    }
}

/// Admission ticket for one upstream call.
#[derive(Debug)]
#[must_use = "a permit must be resolved with the call outcome"]
pub struct CallPermit {
    breaker: Arc<CircuitBreaker>,
    trial: bool,
    resolved: bool,
}

impl CallPermit {
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn success(self) {
        self.resolve(Outcome::Success);
    }

    /// A retryable upstream failure.
    pub fn failure(self) {
        self.resolve(Outcome::Failure);
    }

    /// The upstream answered but the call failed for caller-side reasons.
    pub fn neutral(self) {
        self.resolve(Outcome::Neutral);
    }

    fn resolve(self, outcome: Outcome) {
        self.resolve_at(outcome, Instant::now());
    }

    fn resolve_at(mut self, outcome: Outcome, now: Instant) {
        self.resolved = true;
        self.breaker.record(outcome, self.trial, now);
    }
}

impl Drop for CallPermit {
    fn drop(&mut self) {
        if !self.resolved && self.trial {
            self.breaker.release_trial();
        }
    }
}

/// Write-once set of breakers, one per protected resource.
#[derive(Debug, Default)]
pub struct CircuitBreakers {
    breakers: HashMap<String, Arc<CircuitBreaker>>,
}

impl CircuitBreakers {
    pub fn new<I, S>(resources: I, policy: BreakerPolicy) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let breakers = resources
            .into_iter()
            .map(|r| {
                let name: String = r.into();
                (name.clone(), Arc::new(CircuitBreaker::new(name, policy)))
            })
            .collect();
        Self { breakers }
    }

    pub fn get(&self, resource: &str) -> Option<&Arc<CircuitBreaker>> {
        self.breakers.get(resource)
    }

    pub fn snapshot(&self) -> Vec<BreakerSnapshot> {
        let mut all: Vec<BreakerSnapshot> = self.breakers.values().map(|b| b.snapshot()).collect();
        all.sort_by(|a, b| a.resource.cmp(&b.resource));
        all
    }
}
