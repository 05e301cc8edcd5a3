//! Consecutive-failure circuit breaker.
//!
//! Closed → Open after `failure_threshold` counted failures in a row.
//! Open rejects immediately until `recovery_timeout` has passed since the last
//! failure; the next caller becomes the single HalfOpen trial. The trial's
//! success closes the circuit, its failure reopens it, and a neutral outcome
//! releases the trial slot without changing state.

use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::lock_or_recover;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    #[serde(with = "crate::config::secs")]
    pub recovery_timeout: Duration,
}

impl BreakerConfig {
    /// Office automation servers: trip early, recover slowly.
    pub fn office() -> Self {
        Self {
            failure_threshold: 3,
            recovery_timeout: Duration::from_secs(60),
        }
    }

    pub fn generic() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    pub fn with_recovery_timeout(mut self, timeout: Duration) -> Self {
        self.recovery_timeout = timeout;
        self
    }
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self::generic()
    }
}

/// Rejection from an open circuit.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("circuit '{name}' is open, retry in {retry_in:?}")]
pub struct BreakerOpen {
    pub name: String,
    pub retry_in: Duration,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failures: u32,
    last_failure: Option<Instant>,
    trial_in_flight: bool,
    /// Bumped per admitted trial; only the matching ticket may settle it.
    trial_generation: u64,
}

impl BreakerInner {
    fn owns_trial(&self, trial: Option<u64>) -> bool {
        self.state == CircuitState::HalfOpen
            && self.trial_in_flight
            && trial == Some(self.trial_generation)
    }

    fn admit_trial(&mut self) -> u64 {
        self.trial_in_flight = true;
        self.trial_generation += 1;
        self.trial_generation
    }
}

#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: StdMutex<BreakerInner>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub failures: u32,
    pub failure_threshold: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_in_ms: Option<u64>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: StdMutex::new(BreakerInner {
                state: CircuitState::Closed,
                failures: 0,
                last_failure: None,
                trial_in_flight: false,
                trial_generation: 0,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> BreakerConfig {
        self.config
    }

    pub fn state(&self) -> CircuitState {
        lock_or_recover(&self.inner, "breaker").state
    }

    /// Ask to make a call. The returned ticket must report its outcome;
    /// dropping it unreported counts as neutral.
    pub fn try_enter(&self) -> Result<BreakerTicket<'_>, BreakerOpen> {
        let mut inner = lock_or_recover(&self.inner, "breaker");
        match inner.state {
            CircuitState::Closed => Ok(BreakerTicket::new(self, None)),
            CircuitState::Open => {
                let elapsed = inner.last_failure.map(|t| t.elapsed()).unwrap_or(Duration::MAX);
                if elapsed >= self.config.recovery_timeout {
                    inner.state = CircuitState::HalfOpen;
                    let generation = inner.admit_trial();
                    tracing::info!(breaker = %self.name, "Circuit half-open - admitting trial call");
                    Ok(BreakerTicket::new(self, Some(generation)))
                } else {
                    Err(self.rejection(self.config.recovery_timeout - elapsed))
                }
            }
            CircuitState::HalfOpen if inner.trial_in_flight => Err(self.rejection(Duration::ZERO)),
            CircuitState::HalfOpen => {
                let generation = inner.admit_trial();
                tracing::debug!(breaker = %self.name, "Admitting trial call");
                Ok(BreakerTicket::new(self, Some(generation)))
            }
        }
    }

    fn rejection(&self, retry_in: Duration) -> BreakerOpen {
        BreakerOpen {
            name: self.name.clone(),
            retry_in,
        }
    }

    fn record_success(&self, trial: Option<u64>) {
        let mut inner = lock_or_recover(&self.inner, "breaker");
        match inner.state {
            CircuitState::HalfOpen if inner.owns_trial(trial) => {
                inner.state = CircuitState::Closed;
                inner.failures = 0;
                inner.trial_in_flight = false;
                tracing::info!(breaker = %self.name, "Circuit closed - trial call succeeded");
            }
            CircuitState::Closed => inner.failures = 0,
            // A call admitted before the circuit opened; it says nothing
            // about whether the resource has recovered.
            CircuitState::Open | CircuitState::HalfOpen => {}
        }
    }

    fn record_failure(&self, trial: Option<u64>) {
        let mut inner = lock_or_recover(&self.inner, "breaker");
        let now = Instant::now();
        match inner.state {
            CircuitState::Closed => {
                inner.failures = inner.failures.saturating_add(1);
                inner.last_failure = Some(now);
                if inner.failures >= self.config.failure_threshold {
                    inner.state = CircuitState::Open;
                    tracing::warn!(
                        breaker = %self.name,
                        failures = inner.failures,
                        recovery_secs = self.config.recovery_timeout.as_secs_f64(),
                        "Circuit opened"
                    );
                }
            }
            CircuitState::HalfOpen if inner.owns_trial(trial) => {
                inner.failures = inner.failures.saturating_add(1);
                inner.last_failure = Some(now);
                inner.trial_in_flight = false;
                inner.state = CircuitState::Open;
                tracing::warn!(breaker = %self.name, "Circuit reopened - trial call failed");
            }
            // Only the trial decides the HalfOpen outcome.
            CircuitState::HalfOpen => {}
            CircuitState::Open => {
                inner.failures = inner.failures.saturating_add(1);
                inner.last_failure = Some(now);
            }
        }
    }

    fn record_neutral(&self, trial: Option<u64>) {
        if trial.is_none() {
            return;
        }
        let mut inner = lock_or_recover(&self.inner, "breaker");
        if inner.owns_trial(trial) {
            inner.trial_in_flight = false;
        }
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = lock_or_recover(&self.inner, "breaker");
        let retry_in_ms = match (inner.state, inner.last_failure) {
            (CircuitState::Open, Some(at)) => Some(
                self.config
                    .recovery_timeout
                    .saturating_sub(at.elapsed())
                    .as_millis() as u64,
            ),
            _ => None,
        };
        BreakerSnapshot {
            name: self.name.clone(),
            state: inner.state,
            failures: inner.failures,
            failure_threshold: self.config.failure_threshold,
            retry_in_ms,
        }
    }
}

/// Permission to make one call through a [`CircuitBreaker`].
#[must_use = "report the call outcome with success(), failure() or neutral()"]
pub struct BreakerTicket<'a> {
    breaker: &'a CircuitBreaker,
    /// Generation of the HalfOpen trial this ticket carries, if any.
    trial: Option<u64>,
    reported: bool,
}

impl<'a> BreakerTicket<'a> {
    fn new(breaker: &'a CircuitBreaker, trial: Option<u64>) -> Self {
        Self {
            breaker,
            trial,
            reported: false,
        }
    }

    /// Whether this call is the HalfOpen trial.
    pub fn is_trial(&self) -> bool {
        self.trial.is_some()
    }

    pub fn success(mut self) {
        self.reported = true;
        self.breaker.record_success(self.trial);
    }

    pub fn failure(mut self) {
        self.reported = true;
        self.breaker.record_failure(self.trial);
    }

    /// Outcome says nothing about the resource (content error, cancellation).
    pub fn neutral(mut self) {
        self.reported = true;
        self.breaker.record_neutral(self.trial);
    }
}

impl Drop for BreakerTicket<'_> {
    fn drop(&mut self) {
        if !self.reported {
            self.breaker.record_neutral(self.trial);
        }
    }
}
