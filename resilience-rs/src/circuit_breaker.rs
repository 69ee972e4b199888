//! # Circuit Breaker
//!
//! One breaker per external dependency (the image API, the story API, the
//! database). After `failure_threshold` consecutive failures the circuit
//! opens and calls are rejected without running; once the cooldown has
//! elapsed the next caller becomes the single half-open trial, whose outcome
//! closes or reopens the circuit.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use metrics::counter;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::codes;
use crate::types::{Error, ErrorKind, Result, Severity};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitState {
    /// Normal operation, requests allowed
    Closed,
    /// Failing, requests blocked
    Open,
    /// Testing recovery with a single trial request
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "CLOSED"),
            CircuitState::Open => write!(f, "OPEN"),
            CircuitState::HalfOpen => write!(f, "HALF-OPEN"),
        }
    }
}

/// Configuration for a circuit breaker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open a closed circuit
    pub failure_threshold: u32,
    /// Time an open circuit rejects calls before allowing a trial
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(60),
        }
    }
}

/// Circuit statistics for a single dependency
#[derive(Debug)]
struct CircuitStats {
    state: CircuitState,
    consecutive_failures: u32,
    /// Set only while the circuit is open
    opened_at: Option<DateTime<Utc>>,
    trial_in_flight: bool,
    last_state_change: DateTime<Utc>,
}

impl CircuitStats {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            trial_in_flight: false,
            last_state_change: now,
        }
    }

    fn transition(&mut self, dependency: &str, to: CircuitState, now: DateTime<Utc>) {
        let from = self.state;
        self.state = to;
        self.last_state_change = now;
        self.opened_at = (to == CircuitState::Open).then_some(now);

        counter!(
            "resilience_circuit_transitions_total",
            1,
            "dependency" => dependency.to_string(),
            "to" => to.to_string()
        );
        match to {
            CircuitState::Open => warn!(
                circuit = %dependency,
                from = %from,
                failures = self.consecutive_failures,
                "Circuit OPEN: dependency failing"
            ),
            CircuitState::HalfOpen => info!(circuit = %dependency, from = %from, "Circuit HALF-OPEN: admitting trial"),
            CircuitState::Closed => info!(circuit = %dependency, from = %from, "Circuit CLOSED: dependency recovered"),
        }
    }
}

/// Point-in-time view of one dependency's circuit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitSnapshot {
    pub dependency: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub opened_at: Option<DateTime<Utc>>,
    pub trial_in_flight: bool,
    pub last_state_change: DateTime<Utc>,
}

/// Per-dependency circuit breakers sharing one configuration
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    circuits: DashMap<String, Arc<Mutex<CircuitStats>>>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: CircuitBreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            circuits: DashMap::new(),
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    fn stats(&self, dependency: &str) -> Arc<Mutex<CircuitStats>> {
        if let Some(stats) = self.circuits.get(dependency) {
            return stats.clone();
        }
        self.circuits
            .entry(dependency.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(CircuitStats::new(self.clock.now()))))
            .clone()
    }

    /// Asks to run one call against `dependency`
    ///
    /// The returned permit must be settled with [`CircuitPermit::success`] or
    /// [`CircuitPermit::failure`]. Dropping an unsettled trial permit frees
    /// the half-open slot for the next caller.
    pub fn admit(&self, dependency: &str) -> Result<CircuitPermit> {
        let stats = self.stats(dependency);
        let now = self.clock.now();

        let trial = {
            let mut circuit = stats.lock();
            let state = circuit.state;
            match state {
                CircuitState::Closed => false,
                CircuitState::Open => {
                    let opened_at = circuit.opened_at.unwrap_or(now);
                    let elapsed = (now - opened_at).to_std().unwrap_or(Duration::ZERO);
                    if elapsed < self.config.cooldown {
                        drop(circuit);
                        return Err(self.reject(dependency, self.config.cooldown - elapsed));
                    }
                    circuit.transition(dependency, CircuitState::HalfOpen, now);
                    circuit.trial_in_flight = true;
                    true
                }
                CircuitState::HalfOpen => {
                    if circuit.trial_in_flight {
                        drop(circuit);
                        return Err(self.reject(dependency, Duration::from_secs(1)));
                    }
                    circuit.trial_in_flight = true;
                    true
                }
            }
        };

        Ok(CircuitPermit {
            dependency: dependency.to_string(),
            stats,
            threshold: self.config.failure_threshold.max(1),
            clock: self.clock.clone(),
            trial,
            settled: false,
        })
    }

    /// Runs `operation` behind the circuit for `dependency`
    ///
    /// Every error returned by the operation counts as a failure.
    pub async fn call<F, Fut, T>(&self, dependency: &str, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let permit = self.admit(dependency)?;
        match operation().await {
            Ok(value) => {
                permit.success();
                Ok(value)
            }
            Err(error) => {
                permit.failure();
                Err(error)
            }
        }
    }

    fn reject(&self, dependency: &str, wait: Duration) -> Error {
        let retry_after = wait.as_secs() + u64::from(wait.subsec_nanos() > 0);
        let retry_after = retry_after.max(1);

        counter!("resilience_circuit_rejections_total", 1, "dependency" => dependency.to_string());
        debug!(circuit = %dependency, retry_after = retry_after, "Circuit open, request rejected");

        Error::new(ErrorKind::CircuitOpen, ErrorKind::CircuitOpen.user_message())
            .code(codes::NET_CIRCUIT_OPEN)
            .severity(Severity::Warning)
            .source_label(format!("circuit.{}", dependency))
            .data("dependency", dependency)
            .data("retry_after", retry_after)
            .suggestion(format!("Retry after {} seconds", retry_after))
    }

    /// Current state; unknown dependencies are closed
    pub fn state(&self, dependency: &str) -> CircuitState {
        self.circuits
            .get(dependency)
            .map(|stats| stats.lock().state)
            .unwrap_or(CircuitState::Closed)
    }

    pub fn snapshot(&self, dependency: &str) -> Option<CircuitSnapshot> {
        let stats = self.circuits.get(dependency)?.clone();
        let circuit = stats.lock();
        Some(CircuitSnapshot {
            dependency: dependency.to_string(),
            state: circuit.state,
            consecutive_failures: circuit.consecutive_failures,
            opened_at: circuit.opened_at,
            trial_in_flight: circuit.trial_in_flight,
            last_state_change: circuit.last_state_change,
        })
    }

    /// Forces the circuit closed and clears its counters
    pub fn reset(&self, dependency: &str) {
        if let Some(stats) = self.circuits.get(dependency).map(|s| s.clone()) {
            let mut circuit = stats.lock();
            circuit.consecutive_failures = 0;
            circuit.trial_in_flight = false;
            if circuit.state != CircuitState::Closed {
                circuit.transition(dependency, CircuitState::Closed, self.clock.now());
            }
        }
    }

    /// Names of every dependency seen so far
    pub fn dependencies(&self) -> Vec<String> {
        self.circuits.iter().map(|entry| entry.key().clone()).collect()
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

/// Admission to call a dependency once
#[must_use = "settle the permit with success() or failure()"]
pub struct CircuitPermit {
    dependency: String,
    stats: Arc<Mutex<CircuitStats>>,
    threshold: u32,
    clock: Arc<dyn Clock>,
    trial: bool,
    settled: bool,
}

impl CircuitPermit {
    /// True if this call is the half-open trial
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn success(mut self) {
        self.settled = true;
        let mut circuit = self.stats.lock();
        match (circuit.state, self.trial) {
            (CircuitState::HalfOpen, true) => {
                circuit.trial_in_flight = false;
                circuit.consecutive_failures = 0;
                circuit.transition(&self.dependency, CircuitState::Closed, self.clock.now());
            }
            (CircuitState::Closed, false) => circuit.consecutive_failures = 0,
            // Outcome of a call admitted before the circuit changed state
            _ => {}
        }
    }

    pub fn failure(mut self) {
        self.settled = true;
        let mut circuit = self.stats.lock();
        match (circuit.state, self.trial) {
            (CircuitState::HalfOpen, true) => {
                circuit.trial_in_flight = false;
                circuit.consecutive_failures = circuit.consecutive_failures.saturating_add(1);
                circuit.transition(&self.dependency, CircuitState::Open, self.clock.now());
            }
            (CircuitState::Closed, false) => {
                circuit.consecutive_failures = circuit.consecutive_failures.saturating_add(1);
                if circuit.consecutive_failures >= self.threshold {
                    circuit.transition(&self.dependency, CircuitState::Open, self.clock.now());
                }
            }
            _ => {}
        }
    }
}

impl Drop for CircuitPermit {
    fn drop(&mut self) {
        if self.trial && !self.settled {
            let mut circuit = self.stats.lock();
            if circuit.state == CircuitState::HalfOpen {
                circuit.trial_in_flight = false;
                debug!(circuit = %self.dependency, "Half-open trial abandoned");
            }
        }
    }
}

impl fmt::Debug for CircuitPermit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitPermit")
            .field("dependency", &self.dependency)
            .field("trial", &self.trial)
            .finish()
    }
}
