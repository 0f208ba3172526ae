//! Circuit breaker for provider calls.
//!
//! CLOSED -> OPEN after `failure_threshold` consecutive failures. While OPEN,
//! calls are rejected without touching the network. Once `reset_timeout` has
//! elapsed the breaker is HALF_OPEN and admits exactly one trial call: success
//! closes it, failure reopens it for another `reset_timeout`.
//!
//! Failure counting and the cooldown clock come from `failsafe`; the gate
//! below narrows failsafe's half-open state to a single in-flight trial.

use chrono::{DateTime, TimeZone, Utc};
use failsafe::{backoff, failure_policy, Config, Instrument, StateMachine};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

type Policy = failure_policy::ConsecutiveFailures<backoff::Constant>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => BreakerState::Open,
            2 => BreakerState::HalfOpen,
            _ => BreakerState::Closed,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            BreakerState::Closed => 0,
            BreakerState::Open => 1,
            BreakerState::HalfOpen => 2,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub reset_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum CallError<E> {
    #[error("circuit breaker open")]
    Open,
    #[error(transparent)]
    Inner(E),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerSnapshot {
    pub state: BreakerState,
    pub consecutive_failures: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct Observed {
    state: AtomicU8,
    trial_in_flight: AtomicBool,
    consecutive_failures: AtomicU32,
    /// Millis since epoch, 0 when no failure was seen.
    last_failure_ms: AtomicI64,
}

impl Observed {
    fn set_state(&self, state: BreakerState) {
        self.state.store(state.as_u8(), Ordering::SeqCst);
    }

    fn state(&self) -> BreakerState {
        BreakerState::from_u8(self.state.load(Ordering::SeqCst))
    }
}

/// Mirrors failsafe's transitions so the gate can see HALF_OPEN.
#[derive(Clone)]
struct StateMirror(Arc<Observed>);

impl Instrument for StateMirror {
    fn on_call_rejected(&self) {
        tracing::debug!("Provider call rejected by open circuit");
    }

    fn on_open(&self) {
        self.0.set_state(BreakerState::Open);
        tracing::warn!("Provider circuit breaker opened");
    }

    fn on_half_open(&self) {
        self.0.set_state(BreakerState::HalfOpen);
        tracing::info!("Provider circuit breaker half-open, admitting one trial call");
    }

    fn on_closed(&self) {
        self.0.set_state(BreakerState::Closed);
        tracing::info!("Provider circuit breaker closed");
    }
}

struct TrialPermit<'a>(&'a AtomicBool);

impl Drop for TrialPermit<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[derive(Clone)]
pub struct CircuitBreaker {
    machine: StateMachine<Policy, StateMirror>,
    observed: Arc<Observed>,
    config: BreakerConfig,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        let observed = Arc::new(Observed::default());
        let policy = failure_policy::consecutive_failures(
            config.failure_threshold.max(1),
            backoff::constant(config.reset_timeout),
        );
        let machine = Config::new()
            .failure_policy(policy)
            .instrument(StateMirror(observed.clone()))
            .build();

        Self {
            machine,
            observed,
            config,
        }
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    pub fn state(&self) -> BreakerState {
        self.observed.state()
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let ms = self.observed.last_failure_ms.load(Ordering::SeqCst);
        BreakerSnapshot {
            state: self.state(),
            consecutive_failures: self.observed.consecutive_failures.load(Ordering::SeqCst),
            last_failure_at: (ms > 0)
                .then(|| Utc.timestamp_millis_opt(ms).single())
                .flatten(),
        }
    }

    /// Run `call` through the breaker. The future is never polled when the
    /// circuit rejects it.
    pub async fn call<F, T, E>(&self, call: F) -> Result<T, CallError<E>>
    where
        F: Future<Output = Result<T, E>>,
    {
        let _permit = match self.admit() {
            Some(permit) => permit,
            None => return Err(CallError::Open),
        };

        match call.await {
            Ok(value) => {
                self.machine.on_success();
                self.observed.consecutive_failures.store(0, Ordering::SeqCst);
                Ok(value)
            }
            Err(e) => {
                self.machine.on_error();
                self.observed
                    .consecutive_failures
                    .fetch_add(1, Ordering::SeqCst);
                self.observed
                    .last_failure_ms
                    .store(Utc::now().timestamp_millis(), Ordering::SeqCst);
                Err(CallError::Inner(e))
            }
        }
    }

    /// `None` rejects the call. `Some(None)` is a normal closed-state call.
    fn admit(&self) -> Option<Option<TrialPermit<'_>>> {
        if !self.machine.is_call_permitted() {
            return None;
        }

        if self.observed.state() != BreakerState::HalfOpen {
            return Some(None);
        }

        self.observed
            .trial_in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| Some(TrialPermit(&self.observed.trial_in_flight)))
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(BreakerConfig::default())
    }
}
