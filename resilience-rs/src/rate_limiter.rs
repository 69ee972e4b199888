//! # Rate Limiting
//!
//! Per-key fixed-window quotas over several dimensions. Each named limit type
//! (`"chat"`, `"story_tokens"`, `"image_concurrency"`, ...) maps to one
//! [`QuotaRule`]; state is tracked per `(key, limit type)` pair.
//!
//! Windows are aligned to `floor(now / window) * window` and reset when the
//! clock crosses the next boundary. Allowed requests consume their cost and
//! rejected requests consume nothing. Concurrency rules hand out RAII
//! permits instead of counting inside a window.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use dashmap::DashMap;
use metrics::{counter, decrement_gauge, increment_gauge};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::clock::{Clock, SystemClock};
use crate::codes;
use crate::types::{Error, ErrorKind, RateLimitFailure, Result, Severity};

/// Marks a concurrency slot set that the sweeper has removed
const EVICTED: u64 = u64::MAX;

/// What a quota rule counts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dimension {
    /// Requests per window; `cost` is the number of requests
    Requests,
    /// Model tokens per window
    Tokens,
    /// Operations in flight at once
    Concurrency,
    /// Monetary units (e.g. cents) per window
    Cost,
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dimension::Requests => write!(f, "requests"),
            Dimension::Tokens => write!(f, "tokens"),
            Dimension::Concurrency => write!(f, "concurrent operations"),
            Dimension::Cost => write!(f, "cost units"),
        }
    }
}

/// A shorter window layered on top of the main one, counted in requests
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BurstRule {
    pub limit: u64,
    pub window: Duration,
}

/// The quota for one named limit type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaRule {
    pub dimension: Dimension,
    pub limit: u64,
    /// Ignored for concurrency rules
    pub window: Duration,
    pub burst: Option<BurstRule>,
}

impl QuotaRule {
    const MINUTE: Duration = Duration::from_secs(60);

    pub fn requests_per_minute(limit: u64) -> Self {
        Self::new(Dimension::Requests, limit)
    }

    pub fn tokens_per_minute(limit: u64) -> Self {
        Self::new(Dimension::Tokens, limit)
    }

    pub fn cost_per_minute(limit: u64) -> Self {
        Self::new(Dimension::Cost, limit)
    }

    pub fn concurrent(limit: u64) -> Self {
        Self::new(Dimension::Concurrency, limit)
    }

    fn new(dimension: Dimension, limit: u64) -> Self {
        Self {
            dimension,
            limit,
            window: Self::MINUTE,
            burst: None,
        }
    }

    /// Replaces the main window length
    pub fn per(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    /// Adds a burst layer, e.g. 10 requests per 10 seconds
    pub fn with_burst(mut self, limit: u64, window: Duration) -> Self {
        self.burst = Some(BurstRule { limit, window });
        self
    }
}

/// Outcome of a quota check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    pub allowed: bool,
    /// Units left in the current window after this request
    pub remaining: u64,
    /// Seconds until the window that decided the outcome resets
    pub reset_in_seconds: u64,
}

/// Counter for one aligned window
#[derive(Debug, Clone, Copy)]
struct RateWindow {
    window_start_ms: i64,
    count: u64,
    tokens: u64,
}

impl RateWindow {
    fn new(now_ms: i64, window: Duration) -> Self {
        Self {
            window_start_ms: align(now_ms, window),
            count: 0,
            tokens: 0,
        }
    }

    /// Resets the counters once `now_ms` has left the window
    fn roll(&mut self, now_ms: i64, window: Duration) {
        let current = align(now_ms, window);
        if current != self.window_start_ms {
            *self = Self {
                window_start_ms: current,
                count: 0,
                tokens: 0,
            };
        }
    }

    /// The counters as they would be at `now_ms`, without resetting
    fn at(&self, now_ms: i64, window: Duration) -> Self {
        let mut view = *self;
        view.roll(now_ms, window);
        view
    }

    fn used(&self, dimension: Dimension) -> u64 {
        match dimension {
            Dimension::Requests => self.count,
            Dimension::Tokens | Dimension::Cost => self.tokens,
            Dimension::Concurrency => 0,
        }
    }

    fn consume(&mut self, dimension: Dimension, amount: u64) {
        self.count = self.count.saturating_add(if dimension == Dimension::Requests { amount } else { 1 });
        if dimension != Dimension::Requests {
            self.tokens = self.tokens.saturating_add(amount);
        }
    }

    fn release(&mut self, dimension: Dimension, amount: u64) {
        self.count = self.count.saturating_sub(if dimension == Dimension::Requests { amount } else { 1 });
        if dimension != Dimension::Requests {
            self.tokens = self.tokens.saturating_sub(amount);
        }
    }

    fn reset_at_ms(&self, window: Duration) -> i64 {
        self.window_start_ms + window_ms(window)
    }
}

fn window_ms(window: Duration) -> i64 {
    (window.as_millis() as i64).max(1)
}

fn align(now_ms: i64, window: Duration) -> i64 {
    let len = window_ms(window);
    now_ms - now_ms.rem_euclid(len)
}

fn seconds_until(reset_at_ms: i64, now_ms: i64) -> u64 {
    let millis = (reset_at_ms - now_ms).max(0) as u64;
    (millis + 999) / 1000
}

/// Window state for one `(key, limit type)` pair
#[derive(Debug)]
struct KeyState {
    main: RateWindow,
    burst: Option<RateWindow>,
    last_touched_ms: i64,
    /// Set by the sweeper under the lock; holders must fetch a fresh entry
    evicted: bool,
}

/// In-flight counter for one `(key, limit type)` concurrency pair
#[derive(Debug)]
struct ConcurrencySlots {
    in_flight: AtomicU64,
    last_touched_ms: AtomicI64,
}

/// Why a request was refused
#[derive(Debug, Clone, Copy)]
struct Rejection {
    failure: RateLimitFailure,
    current_usage: u64,
    limit: u64,
    reset_at_ms: i64,
}

struct Evaluation {
    decision: Decision,
    rejection: Option<Rejection>,
    charged: Option<ChargedWindows>,
}

/// Window starts an allowed request was counted in
#[derive(Debug, Clone, Copy)]
struct ChargedWindows {
    main_start_ms: i64,
    burst_start_ms: Option<i64>,
}

/// What a windowed admission consumed, so it can be handed back
#[derive(Debug)]
struct Charge {
    key: String,
    limit_type: String,
    cost: u64,
    windows: ChargedWindows,
}

type StateKey = (String, String);

/// Fixed-window rate limiter over named quota rules
#[derive(Debug)]
pub struct RateLimiter {
    rules: HashMap<String, QuotaRule>,
    clock: Arc<dyn Clock>,
    windows: DashMap<StateKey, Arc<Mutex<KeyState>>>,
    slots: DashMap<StateKey, Arc<ConcurrencySlots>>,
}

impl RateLimiter {
    pub fn new<I, S>(rules: I) -> Self
    where
        I: IntoIterator<Item = (S, QuotaRule)>,
        S: Into<String>,
    {
        Self::with_clock(rules, Arc::new(SystemClock))
    }

    pub fn with_clock<I, S>(rules: I, clock: Arc<dyn Clock>) -> Self
    where
        I: IntoIterator<Item = (S, QuotaRule)>,
        S: Into<String>,
    {
        Self {
            rules: rules.into_iter().map(|(name, rule)| (name.into(), rule)).collect(),
            clock,
            windows: DashMap::new(),
            slots: DashMap::new(),
        }
    }

    /// The rule registered for `limit_type`
    pub fn rule(&self, limit_type: &str) -> Option<&QuotaRule> {
        self.rules.get(limit_type)
    }

    fn require_rule(&self, limit_type: &str) -> Result<&QuotaRule> {
        self.rules.get(limit_type).ok_or_else(|| {
            Error::new(ErrorKind::Configuration, format!("Unknown rate limit type '{}'", limit_type))
                .code(codes::CFG_LIMIT_UNKNOWN)
                .source_label("rate_limit")
                .data("limit_type", limit_type)
        })
    }

    fn dimension_mismatch(limit_type: &str, expected: &str, actual: Dimension) -> Error {
        Error::new(
            ErrorKind::Configuration,
            format!("Rate limit type '{}' counts {}, not {}", limit_type, actual, expected),
        )
        .code(codes::CFG_LIMIT_MISMATCH)
        .source_label("rate_limit")
        .data("limit_type", limit_type)
    }

    /// Checks and, when allowed, consumes `cost` against the quota
    ///
    /// Concurrency rules are only reported here; use [`acquire`](Self::acquire)
    /// to take a slot.
    pub fn check(&self, key: &str, limit_type: &str, cost: u64) -> Result<Decision> {
        Ok(self.evaluate(key, limit_type, cost)?.decision)
    }

    /// Like [`check`](Self::check), but a refusal becomes a typed error
    pub fn enforce(&self, key: &str, limit_type: &str, cost: u64) -> Result<Decision> {
        let evaluation = self.evaluate(key, limit_type, cost)?;
        match evaluation.rejection {
            None => Ok(evaluation.decision),
            Some(rejection) => Err(self.rejection_error(limit_type, rejection)),
        }
    }

    /// Admits one unit of work, holding a slot when the rule counts concurrency
    pub fn admit(&self, key: &str, limit_type: &str, cost: u64) -> Result<Admission> {
        let rule = self.require_rule(limit_type)?;
        if rule.dimension == Dimension::Concurrency {
            let permit = self.acquire(key, limit_type)?;
            let in_flight = permit.slots.in_flight.load(Ordering::Acquire);
            return Ok(Admission {
                decision: Decision {
                    allowed: true,
                    remaining: rule.limit.saturating_sub(in_flight),
                    reset_in_seconds: 0,
                },
                permit: Some(permit),
                charge: None,
            });
        }

        let evaluation = self.evaluate(key, limit_type, cost)?;
        if let Some(rejection) = evaluation.rejection {
            return Err(self.rejection_error(limit_type, rejection));
        }
        Ok(Admission {
            decision: evaluation.decision,
            permit: None,
            charge: evaluation.charged.map(|windows| Charge {
                key: key.to_string(),
                limit_type: limit_type.to_string(),
                cost,
                windows,
            }),
        })
    }

    /// Admits every request in order, or none of them
    ///
    /// When one request is refused, whatever the earlier ones consumed is
    /// handed back before the error is returned.
    pub fn admit_all<'a, I>(&self, requests: I) -> Result<Vec<Admission>>
    where
        I: IntoIterator<Item = (&'a str, &'a str, u64)>,
    {
        let mut admitted = Vec::new();
        for (key, limit_type, cost) in requests {
            match self.admit(key, limit_type, cost) {
                Ok(admission) => admitted.push(admission),
                Err(error) => {
                    for admission in admitted {
                        self.refund(admission);
                    }
                    return Err(error);
                }
            }
        }
        Ok(admitted)
    }

    /// Returns what `admission` consumed, if its windows are still current
    ///
    /// A concurrency slot is released by dropping the permit.
    fn refund(&self, admission: Admission) {
        let Some(charge) = admission.charge else {
            return;
        };
        let Some(rule) = self.rules.get(&charge.limit_type) else {
            return;
        };
        let state = match self.windows.get(&(charge.key.clone(), charge.limit_type.clone())) {
            Some(state) => state.clone(),
            None => return,
        };

        let mut state = state.lock();
        if state.evicted {
            return;
        }
        if state.main.window_start_ms == charge.windows.main_start_ms {
            state.main.release(rule.dimension, charge.cost);
        }
        if let (Some(window), Some(start)) = (state.burst.as_mut(), charge.windows.burst_start_ms) {
            if window.window_start_ms == start {
                let burst_cost = if rule.dimension == Dimension::Requests { charge.cost } else { 1 };
                window.count = window.count.saturating_sub(burst_cost);
            }
        }
        debug!(key = %charge.key, limit_type = %charge.limit_type, cost = charge.cost, "Refunded rate limit charge");
    }

    fn evaluate(&self, key: &str, limit_type: &str, cost: u64) -> Result<Evaluation> {
        let rule = self.require_rule(limit_type)?;
        if rule.dimension == Dimension::Concurrency {
            return Ok(self.concurrency_report(key, limit_type, rule));
        }

        let now_ms = self.clock.now().timestamp_millis();
        let evaluation = self.with_window(key, limit_type, rule, now_ms, |state| {
            state.last_touched_ms = now_ms;
            state.main.roll(now_ms, rule.window);

            let used = state.main.used(rule.dimension);
            let main_remaining = rule.limit.saturating_sub(used);
            let main_reset = state.main.reset_at_ms(rule.window);

            if cost > main_remaining {
                let failure = match rule.dimension {
                    Dimension::Cost => RateLimitFailure::Cost,
                    _ => RateLimitFailure::Quota,
                };
                return refused(main_remaining, now_ms, Rejection {
                    failure,
                    current_usage: used,
                    limit: rule.limit,
                    reset_at_ms: main_reset,
                });
            }

            let mut remaining = main_remaining - cost;
            if let (Some(burst), Some(window)) = (&rule.burst, state.burst.as_mut()) {
                window.roll(now_ms, burst.window);
                let burst_cost = if rule.dimension == Dimension::Requests { cost } else { 1 };
                let burst_remaining = burst.limit.saturating_sub(window.count);
                if burst_cost > burst_remaining {
                    return refused(burst_remaining, now_ms, Rejection {
                        failure: RateLimitFailure::Burst,
                        current_usage: window.count,
                        limit: burst.limit,
                        reset_at_ms: window.reset_at_ms(burst.window),
                    });
                }
                window.count = window.count.saturating_add(burst_cost);
                if rule.dimension == Dimension::Requests {
                    remaining = remaining.min(burst_remaining - burst_cost);
                }
            }

            state.main.consume(rule.dimension, cost);
            Evaluation {
                decision: Decision {
                    allowed: true,
                    remaining,
                    reset_in_seconds: seconds_until(main_reset, now_ms),
                },
                rejection: None,
                charged: Some(ChargedWindows {
                    main_start_ms: state.main.window_start_ms,
                    burst_start_ms: state.burst.map(|window| window.window_start_ms),
                }),
            }
        });

        Ok(evaluation)
    }

    /// Runs `f` on the live window state, replacing entries the sweeper evicted
    fn with_window<R>(
        &self,
        key: &str,
        limit_type: &str,
        rule: &QuotaRule,
        now_ms: i64,
        f: impl FnOnce(&mut KeyState) -> R,
    ) -> R {
        let state_key = (key.to_string(), limit_type.to_string());
        loop {
            let state = self
                .windows
                .entry(state_key.clone())
                .or_insert_with(|| {
                    Arc::new(Mutex::new(KeyState {
                        main: RateWindow::new(now_ms, rule.window),
                        burst: rule.burst.as_ref().map(|b| RateWindow::new(now_ms, b.window)),
                        last_touched_ms: now_ms,
                        evicted: false,
                    }))
                })
                .clone();

            let mut guard = state.lock();
            if guard.evicted {
                continue;
            }
            return f(&mut guard);
        }
    }

    fn concurrency_report(&self, key: &str, limit_type: &str, rule: &QuotaRule) -> Evaluation {
        let in_flight = self
            .slots
            .get(&(key.to_string(), limit_type.to_string()))
            .map(|slots| slots.in_flight.load(Ordering::Acquire))
            .filter(|&n| n != EVICTED)
            .unwrap_or(0);
        let allowed = in_flight < rule.limit;
        let now_ms = self.clock.now().timestamp_millis();

        Evaluation {
            decision: Decision {
                allowed,
                remaining: rule.limit.saturating_sub(in_flight),
                reset_in_seconds: 0,
            },
            rejection: (!allowed).then_some(Rejection {
                failure: RateLimitFailure::Concurrency,
                current_usage: in_flight,
                limit: rule.limit,
                reset_at_ms: now_ms + 1000,
            }),
            charged: None,
        }
    }

    /// Takes one concurrency slot, released when the permit drops
    pub fn acquire(&self, key: &str, limit_type: &str) -> Result<ConcurrencyPermit> {
        let rule = self.require_rule(limit_type)?;
        if rule.dimension != Dimension::Concurrency {
            return Err(Self::dimension_mismatch(limit_type, "concurrency", rule.dimension));
        }

        let state_key = (key.to_string(), limit_type.to_string());
        let now_ms = self.clock.now().timestamp_millis();

        'fetch: loop {
            let slots = self
                .slots
                .entry(state_key.clone())
                .or_insert_with(|| {
                    Arc::new(ConcurrencySlots {
                        in_flight: AtomicU64::new(0),
                        last_touched_ms: AtomicI64::new(now_ms),
                    })
                })
                .clone();

            let mut current = slots.in_flight.load(Ordering::Acquire);
            loop {
                if current == EVICTED {
                    continue 'fetch;
                }
                if current >= rule.limit {
                    return Err(self.rejection_error(
                        limit_type,
                        Rejection {
                            failure: RateLimitFailure::Concurrency,
                            current_usage: current,
                            limit: rule.limit,
                            reset_at_ms: now_ms + 1000,
                        },
                    ));
                }
                match slots.in_flight.compare_exchange_weak(
                    current,
                    current + 1,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => break,
                    Err(actual) => current = actual,
                }
            }

            slots.last_touched_ms.store(now_ms, Ordering::Relaxed);
            increment_gauge!("resilience_concurrency_in_flight", 1.0, "limit_type" => limit_type.to_string());
            return Ok(ConcurrencyPermit {
                slots,
                limit_type: limit_type.to_string(),
                clock: self.clock.clone(),
            });
        }
    }

    /// Units left for `key` in the current window, without consuming any
    pub fn remaining(&self, key: &str, limit_type: &str) -> Result<u64> {
        let rule = self.require_rule(limit_type)?;
        if rule.dimension == Dimension::Concurrency {
            return Ok(self.concurrency_report(key, limit_type, rule).decision.remaining);
        }

        let state = match self.windows.get(&(key.to_string(), limit_type.to_string())) {
            Some(state) => state.clone(),
            None => return Ok(rule.limit),
        };
        let now_ms = self.clock.now().timestamp_millis();
        let state = state.lock();
        if state.evicted {
            return Ok(rule.limit);
        }

        let mut remaining = rule.limit.saturating_sub(state.main.at(now_ms, rule.window).used(rule.dimension));
        if let (Some(burst), Some(window), Dimension::Requests) = (&rule.burst, &state.burst, rule.dimension) {
            remaining = remaining.min(burst.limit.saturating_sub(window.at(now_ms, burst.window).count));
        }
        Ok(remaining)
    }

    /// Drops state untouched for `max_idle`, returning how many entries went
    ///
    /// Concurrency slots with permits in flight are always kept.
    pub fn sweep_idle(&self, max_idle: Duration) -> usize {
        let cutoff = self.clock.now().timestamp_millis() - max_idle.as_millis() as i64;
        let mut removed = 0;

        self.windows.retain(|_, state| match state.try_lock() {
            Some(mut window) if window.last_touched_ms <= cutoff => {
                window.evicted = true;
                removed += 1;
                false
            }
            _ => true,
        });

        self.slots.retain(|_, slots| {
            let idle = slots.last_touched_ms.load(Ordering::Relaxed) <= cutoff;
            if idle
                && slots
                    .in_flight
                    .compare_exchange(0, EVICTED, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
            {
                removed += 1;
                false
            } else {
                true
            }
        });

        if removed > 0 {
            debug!(removed = removed, "Swept idle rate limit state");
        }
        removed
    }

    /// Runs [`sweep_idle`](Self::sweep_idle) every `interval` until the
    /// limiter is dropped
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration, max_idle: Duration) -> JoinHandle<()> {
        let limiter: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match limiter.upgrade() {
                    Some(limiter) => {
                        limiter.sweep_idle(max_idle);
                    }
                    None => break,
                }
            }
        })
    }

    /// Number of `(key, limit type)` windows currently held
    pub fn tracked_windows(&self) -> usize {
        self.windows.len()
    }

    /// Number of `(key, limit type)` concurrency slot sets currently held
    pub fn tracked_slots(&self) -> usize {
        self.slots.len()
    }

    fn rejection_error(&self, limit_type: &str, rejection: Rejection) -> Error {
        let now = self.clock.now();
        let retry_after = seconds_until(rejection.reset_at_ms, now.timestamp_millis()).max(1);
        let reset_time: DateTime<Utc> = Utc
            .timestamp_millis_opt(rejection.reset_at_ms)
            .single()
            .unwrap_or(now);

        let (message, reason) = match rejection.failure {
            RateLimitFailure::Quota => ("Rate limit exceeded", "quota"),
            RateLimitFailure::Burst => ("Too many requests in a short time", "burst"),
            RateLimitFailure::Cost => ("Usage budget exceeded", "cost"),
            RateLimitFailure::Concurrency => ("Too many operations in progress", "concurrency"),
        };

        counter!(
            "resilience_rate_limit_rejections_total",
            1,
            "limit_type" => limit_type.to_string(),
            "reason" => reason
        );

        Error::new(ErrorKind::RateLimit(rejection.failure), message)
            .severity(Severity::Warning)
            .source_label(format!("rate_limit.{}", limit_type))
            .data("limit_type", limit_type)
            .data("current_usage", rejection.current_usage)
            .data("limit", rejection.limit)
            .data("reset_time", reset_time.to_rfc3339())
            .data("retry_after", retry_after)
            .suggestion(format!("Wait {} seconds before trying again", retry_after))
            .client_safe()
    }
}

fn refused(remaining: u64, now_ms: i64, rejection: Rejection) -> Evaluation {
    Evaluation {
        decision: Decision {
            allowed: false,
            remaining,
            reset_in_seconds: seconds_until(rejection.reset_at_ms, now_ms),
        },
        rejection: Some(rejection),
        charged: None,
    }
}

/// One held concurrency slot
#[must_use = "the slot is released as soon as the permit is dropped"]
pub struct ConcurrencyPermit {
    slots: Arc<ConcurrencySlots>,
    limit_type: String,
    clock: Arc<dyn Clock>,
}

impl Drop for ConcurrencyPermit {
    fn drop(&mut self) {
        self.slots.in_flight.fetch_sub(1, Ordering::AcqRel);
        self.slots
            .last_touched_ms
            .store(self.clock.now().timestamp_millis(), Ordering::Relaxed);
        decrement_gauge!("resilience_concurrency_in_flight", 1.0, "limit_type" => self.limit_type.clone());
    }
}

impl fmt::Debug for ConcurrencyPermit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConcurrencyPermit")
            .field("limit_type", &self.limit_type)
            .finish()
    }
}

/// A successful admission; keeps any concurrency slot until dropped
#[derive(Debug)]
pub struct Admission {
    pub decision: Decision,
    permit: Option<ConcurrencyPermit>,
    charge: Option<Charge>,
}

impl Admission {
    pub fn holds_permit(&self) -> bool {
        self.permit.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    fn limiter(rules: Vec<(&str, QuotaRule)>) -> (RateLimiter, ManualClock) {
        let clock = ManualClock::new(start());
        (RateLimiter::with_clock(rules, Arc::new(clock.clone())), clock)
    }

    #[test]
    fn test_sixth_request_rejected_then_window_resets() {
        let (limiter, clock) = limiter(vec![("chat", QuotaRule::requests_per_minute(5))]);

        for expected in (0..5).rev() {
            let decision = limiter.check("k", "chat", 1).unwrap();
            assert!(decision.allowed);
            assert_eq!(decision.remaining, expected);
        }

        let sixth = limiter.check("k", "chat", 1).unwrap();
        assert!(!sixth.allowed);
        assert_eq!(sixth.remaining, 0);
        assert_eq!(sixth.reset_in_seconds, 60);

        clock.advance(Duration::from_secs(60));
        let next = limiter.check("k", "chat", 1).unwrap();
        assert!(next.allowed);
        assert_eq!(next.remaining, 4);
    }

    #[test]
    fn test_windows_are_aligned_to_boundaries() {
        let (limiter, clock) = limiter(vec![("chat", QuotaRule::requests_per_minute(1))]);
        clock.advance(Duration::from_secs(50));

        let first = limiter.check("k", "chat", 1).unwrap();
        assert_eq!(first.reset_in_seconds, 10);
        assert!(!limiter.check("k", "chat", 1).unwrap().allowed);

        clock.advance(Duration::from_secs(10));
        assert!(limiter.check("k", "chat", 1).unwrap().allowed);
    }

    #[test]
    fn test_rejected_requests_consume_nothing() {
        let (limiter, _) = limiter(vec![("story_tokens", QuotaRule::tokens_per_minute(100))]);

        assert!(limiter.check("u1", "story_tokens", 80).unwrap().allowed);
        assert!(!limiter.check("u1", "story_tokens", 30).unwrap().allowed);
        let last = limiter.check("u1", "story_tokens", 20).unwrap();
        assert!(last.allowed);
        assert_eq!(last.remaining, 0);
    }

    #[test]
    fn test_keys_are_independent() {
        let (limiter, _) = limiter(vec![("chat", QuotaRule::requests_per_minute(1))]);
        assert!(limiter.check("a", "chat", 1).unwrap().allowed);
        assert!(limiter.check("b", "chat", 1).unwrap().allowed);
        assert!(!limiter.check("a", "chat", 1).unwrap().allowed);
    }

    #[test]
    fn test_burst_layer() {
        let rule = QuotaRule::requests_per_minute(60).with_burst(3, Duration::from_secs(10));
        let (limiter, clock) = limiter(vec![("chat", rule)]);

        for _ in 0..3 {
            limiter.enforce("k", "chat", 1).unwrap();
        }
        let err = limiter.enforce("k", "chat", 1).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RateLimit(RateLimitFailure::Burst));
        assert_eq!(err.error_code(), codes::RATE_BURST_EXCEEDED);
        assert_eq!(limiter.remaining("k", "chat").unwrap(), 0);

        clock.advance(Duration::from_secs(10));
        let decision = limiter.enforce("k", "chat", 1).unwrap();
        assert_eq!(decision.remaining, 2);
        assert_eq!(limiter.remaining("k", "chat").unwrap(), 2);
    }

    #[test]
    fn test_enforce_error_carries_limit_details() {
        let (limiter, _) = limiter(vec![("chat", QuotaRule::requests_per_minute(1))]);
        limiter.enforce("k", "chat", 1).unwrap();

        let err = limiter.enforce("k", "chat", 1).unwrap_err();
        let data = err.context().additional_data();

        assert_eq!(err.kind(), ErrorKind::RateLimit(RateLimitFailure::Quota));
        assert_eq!(err.error_code(), codes::RATE_QUOTA_EXCEEDED);
        assert_eq!(err.http_status(), 429);
        assert_eq!(data["limit_type"], "chat");
        assert_eq!(data["current_usage"], 1);
        assert_eq!(data["limit"], 1);
        assert_eq!(data["retry_after"], 60);
        assert_eq!(data["reset_time"], "2026-03-01T12:01:00+00:00");
        assert!(err.is_retryable());
    }

    #[test]
    fn test_cost_limit() {
        let (limiter, _) = limiter(vec![("generation_cost", QuotaRule::cost_per_minute(500))]);
        limiter.enforce("u1", "generation_cost", 450).unwrap();

        let err = limiter.enforce("u1", "generation_cost", 60).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RateLimit(RateLimitFailure::Cost));
        assert_eq!(err.error_code(), codes::RATE_COST_EXCEEDED);
        assert_eq!(limiter.remaining("u1", "generation_cost").unwrap(), 50);
    }

    #[test]
    fn test_unknown_limit_type() {
        let (limiter, _) = limiter(vec![]);
        let err = limiter.check("k", "video", 1).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert_eq!(err.error_code(), codes::CFG_LIMIT_UNKNOWN);

        assert_eq!(limiter.remaining("k", "video").unwrap_err().error_code(), codes::CFG_LIMIT_UNKNOWN);
    }

    #[test]
    fn test_concurrency_permits() {
        let (limiter, _) = limiter(vec![("image_concurrency", QuotaRule::concurrent(2))]);

        let first = limiter.acquire("u1", "image_concurrency").unwrap();
        let _second = limiter.acquire("u1", "image_concurrency").unwrap();

        let report = limiter.check("u1", "image_concurrency", 1).unwrap();
        assert!(!report.allowed);

        let err = limiter.acquire("u1", "image_concurrency").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RateLimit(RateLimitFailure::Concurrency));
        assert_eq!(err.error_code(), codes::RATE_CONCURRENCY_EXCEEDED);

        drop(first);
        assert_eq!(limiter.remaining("u1", "image_concurrency").unwrap(), 1);
        assert!(limiter.acquire("u1", "image_concurrency").is_ok());
    }

    #[test]
    fn test_check_does_not_take_concurrency_slots() {
        let (limiter, _) = limiter(vec![("image_concurrency", QuotaRule::concurrent(1))]);
        for _ in 0..3 {
            assert!(limiter.check("u1", "image_concurrency", 1).unwrap().allowed);
        }
        assert!(limiter.acquire("u1", "image_concurrency").is_ok());
    }

    #[test]
    fn test_dimension_mismatch() {
        let (limiter, _) = limiter(vec![("chat", QuotaRule::requests_per_minute(5))]);
        let err = limiter.acquire("u1", "chat").unwrap_err();
        assert_eq!(err.error_code(), codes::CFG_LIMIT_MISMATCH);
    }

    #[test]
    fn test_admit_holds_permit_for_concurrency() {
        let (limiter, _) = limiter(vec![
            ("chat", QuotaRule::requests_per_minute(5)),
            ("image_concurrency", QuotaRule::concurrent(1)),
        ]);

        let chat = limiter.admit("u1", "chat", 1).unwrap();
        assert!(!chat.holds_permit());
        assert_eq!(chat.decision.remaining, 4);

        let image = limiter.admit("u1", "image_concurrency", 1).unwrap();
        assert!(image.holds_permit());
        assert!(limiter.admit("u1", "image_concurrency", 1).is_err());
        drop(image);
        assert!(limiter.admit("u1", "image_concurrency", 1).is_ok());
    }

    #[test]
    fn test_admit_all_is_all_or_nothing() {
        let (limiter, _) = limiter(vec![
            ("chat", QuotaRule::requests_per_minute(2).with_burst(2, Duration::from_secs(10))),
            ("story_tokens", QuotaRule::tokens_per_minute(10)),
            ("image_concurrency", QuotaRule::concurrent(1)),
        ]);

        let err = limiter
            .admit_all([
                ("u", "chat", 1),
                ("u", "image_concurrency", 1),
                ("u", "story_tokens", 50),
            ])
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RateLimit(RateLimitFailure::Quota));
        assert_eq!(limiter.remaining("u", "chat").unwrap(), 2);
        assert_eq!(limiter.remaining("u", "story_tokens").unwrap(), 10);
        assert_eq!(limiter.remaining("u", "image_concurrency").unwrap(), 1);

        let admitted = limiter
            .admit_all([("u", "chat", 1), ("u", "story_tokens", 4)])
            .unwrap();
        assert_eq!(admitted.len(), 2);
        assert_eq!(limiter.remaining("u", "chat").unwrap(), 1);
        assert_eq!(limiter.remaining("u", "story_tokens").unwrap(), 6);
    }

    #[test]
    fn test_remaining_is_read_only() {
        let (limiter, clock) = limiter(vec![("chat", QuotaRule::requests_per_minute(5))]);
        assert_eq!(limiter.remaining("k", "chat").unwrap(), 5);
        assert_eq!(limiter.tracked_windows(), 0);

        limiter.check("k", "chat", 2).unwrap();
        assert_eq!(limiter.remaining("k", "chat").unwrap(), 3);
        assert_eq!(limiter.remaining("k", "chat").unwrap(), 3);

        clock.advance(Duration::from_secs(60));
        assert_eq!(limiter.remaining("k", "chat").unwrap(), 5);
    }

    #[test]
    fn test_sweep_idle_keeps_busy_slots() {
        let (limiter, clock) = limiter(vec![
            ("chat", QuotaRule::requests_per_minute(5)),
            ("image_concurrency", QuotaRule::concurrent(1)),
        ]);

        limiter.check("idle", "chat", 1).unwrap();
        let held = limiter.acquire("busy", "image_concurrency").unwrap();
        clock.advance(Duration::from_secs(600));
        limiter.check("fresh", "chat", 1).unwrap();

        let removed = limiter.sweep_idle(Duration::from_secs(300));

        assert_eq!(removed, 1);
        assert_eq!(limiter.tracked_windows(), 1);
        assert_eq!(limiter.tracked_slots(), 1);

        drop(held);
        clock.advance(Duration::from_secs(600));
        limiter.sweep_idle(Duration::from_secs(300));
        assert_eq!(limiter.tracked_slots(), 0);
        assert!(limiter.acquire("busy", "image_concurrency").is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_sweeper() {
        let (limiter, clock) = limiter(vec![("chat", QuotaRule::requests_per_minute(5))]);
        let limiter = Arc::new(limiter);
        limiter.check("k", "chat", 1).unwrap();
        clock.advance(Duration::from_secs(120));

        let handle = limiter.spawn_sweeper(Duration::from_secs(1), Duration::from_secs(60));
        tokio::time::sleep(Duration::from_millis(1500)).await;

        assert_eq!(limiter.tracked_windows(), 0);
        handle.abort();
    }
}
