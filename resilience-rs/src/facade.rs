//! # Error Handling Facade
//!
//! The single entry point used by routes and commands. An operation runs
//! behind a fixed sequence of gates:
//!
//! rate limits (in policy order) → circuit breaker → retry → operation
//!
//! Any failure on the way out, including panics inside the operation, is
//! classified into an [`Error`], scoped to the call site, logged by severity
//! and returned. Critical failures also reach the alert hook and, when the
//! policy asks for it, end the process.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use crate::classify::{classify_boxed, classify_panic};
use crate::clock::{Clock, SystemClock};
use crate::config::{ResilienceSettings, SettingsError};
use crate::logging::{log_structured_error, ErrorLogger, TracingLogger};
use crate::rate_limiter::{QuotaRule, RateLimiter};
use crate::reporting::{record_error_metrics, AlertHook, NoopAlertHook};
use crate::retry::{RetryEngine, RetryPolicy};
use crate::sanitization::{to_debug_response_payload, to_response_payload, ResponsePayload};
use crate::types::{BoxError, Error, ErrorKind, Result, Severity};

/// Called with the exit status when a critical failure must end the process
pub type ExitHook = Arc<dyn Fn(i32) + Send + Sync>;

/// One quota to pass before the operation runs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitPolicy {
    pub key: String,
    pub limit_type: String,
    pub cost: u64,
}

/// How a single [`ErrorHandler::execute`] call is protected
#[derive(Debug, Clone, Default)]
pub struct ExecutionPolicy {
    rate_limits: Vec<RateLimitPolicy>,
    circuit: Option<String>,
    retry: Option<RetryPolicy>,
    deadline: Option<Instant>,
    timeout: Option<Duration>,
    cancellation: Option<CancellationToken>,
    exit_on_error: bool,
    fallback_kind: Option<ErrorKind>,
    user_id: Option<String>,
    request_id: Option<String>,
    trace_id: Option<String>,
}

impl ExecutionPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a quota check; checks run in the order they were added
    pub fn rate_limit<K, L>(mut self, key: K, limit_type: L, cost: u64) -> Self
    where
        K: Into<String>,
        L: Into<String>,
    {
        self.rate_limits.push(RateLimitPolicy {
            key: key.into(),
            limit_type: limit_type.into(),
            cost,
        });
        self
    }

    /// Runs the operation behind the breaker for `dependency`
    pub fn circuit<S: Into<String>>(mut self, dependency: S) -> Self {
        self.circuit = Some(dependency.into());
        self
    }

    /// Without a retry policy the operation is attempted once
    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    pub fn deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Deadline relative to the start of `execute`
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    /// Exit the process on a critical failure
    pub fn exit_on_error(mut self, exit: bool) -> Self {
        self.exit_on_error = exit;
        self
    }

    /// Kind given to operation errors classification does not recognise
    pub fn fallback_kind(mut self, kind: ErrorKind) -> Self {
        self.fallback_kind = Some(kind);
        self
    }

    pub fn user_id<S: Into<String>>(mut self, user_id: S) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn request_id<S: Into<String>>(mut self, request_id: S) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn trace_id<S: Into<String>>(mut self, trace_id: S) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }

    /// The earlier of the absolute deadline and `start + timeout`
    fn effective_deadline(&self, start: Instant) -> Option<Instant> {
        let relative = self.timeout.map(|timeout| start + timeout);
        match (self.deadline, relative) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }
}

/// Composes the rate limiter, circuit breaker and retry engine
pub struct ErrorHandler {
    rate_limiter: Arc<RateLimiter>,
    breaker: Arc<CircuitBreaker>,
    retry: RetryEngine,
    default_retry: RetryPolicy,
    logger: Arc<dyn ErrorLogger>,
    alerts: Arc<dyn AlertHook>,
    exit: ExitHook,
    debug_mode: bool,
}

impl ErrorHandler {
    pub fn builder() -> ErrorHandlerBuilder {
        ErrorHandlerBuilder::default()
    }

    /// Builds a handler from validated settings with the default collaborators
    pub fn from_settings(settings: &ResilienceSettings) -> std::result::Result<Self, SettingsError> {
        settings.validate()?;
        Ok(Self::builder()
            .rate_limits(settings.quota_rules())
            .circuit_breaker(settings.circuit_breaker_config())
            .default_retry(RetryPolicy::new("default", settings.retry_config()))
            .debug_mode(settings.debug_mode)
            .build())
    }

    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.rate_limiter
    }

    pub fn circuit_breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// The retry policy loaded from settings
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.default_retry
    }

    /// Runs `operation` behind the gates described by `policy`
    pub async fn execute<F, Fut, T, E>(&self, label: &str, policy: &ExecutionPolicy, operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: Into<BoxError>,
    {
        let start = Instant::now();
        let gated = self.run_gates(label, policy, operation);

        let bounded = async {
            match policy.effective_deadline(start) {
                Some(deadline) => match tokio::time::timeout_at(deadline, gated).await {
                    Ok(result) => result,
                    Err(_) => Err(Error::timeout(label, deadline.saturating_duration_since(start))),
                },
                None => gated.await,
            }
        };

        let result = match &policy.cancellation {
            Some(token) => {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => Err(Error::cancelled(label)),
                    result = bounded => result,
                }
            }
            None => bounded.await,
        };

        result.map_err(|error| self.handle(label, error, policy))
    }

    async fn run_gates<F, Fut, T, E>(&self, label: &str, policy: &ExecutionPolicy, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: Into<BoxError>,
    {
        let admissions = self.rate_limiter.admit_all(
            policy
                .rate_limits
                .iter()
                .map(|limit| (limit.key.as_str(), limit.limit_type.as_str(), limit.cost)),
        )?;

        let fallback = policy.fallback_kind;
        let attempt = || {
            let started = panic::catch_unwind(AssertUnwindSafe(&mut operation));
            async move {
                match started {
                    Ok(future) => run_attempt(future, fallback).await,
                    Err(payload) => Err(classify_panic(payload)),
                }
            }
        };

        let retry_policy = policy.retry.clone().unwrap_or_else(RetryPolicy::never);
        let retried = self
            .retry
            .run(label, &retry_policy, policy.cancellation.as_ref(), attempt);

        let result = match &policy.circuit {
            Some(dependency) => self.breaker.call(dependency, || retried).await,
            None => retried.await,
        };

        drop(admissions);
        result
    }

    /// Scopes, logs and reports a failure, as `execute` does on its way out
    ///
    /// Useful for errors raised outside `execute`, e.g. in request parsing.
    pub fn handle(&self, label: &str, error: Error, policy: &ExecutionPolicy) -> Error {
        let error = error.scoped(
            label,
            policy.user_id.as_deref(),
            policy.request_id.as_deref(),
            policy.trace_id.as_deref(),
        );

        log_structured_error(self.logger.as_ref(), &error);
        record_error_metrics(&error);

        if error.severity_level() == Severity::Critical {
            self.alerts.notify_critical(&error);
            if policy.exit_on_error {
                self.logger.flush();
                (self.exit)(1);
            }
        }

        error
    }

    /// The payload to render for `error`, with details in debug mode
    pub fn response_payload(&self, error: &Error) -> ResponsePayload {
        if self.debug_mode {
            to_debug_response_payload(error)
        } else {
            to_response_payload(error)
        }
    }
}

async fn run_attempt<Fut, T, E>(future: Fut, fallback: Option<ErrorKind>) -> Result<T>
where
    Fut: Future<Output = std::result::Result<T, E>>,
    E: Into<BoxError>,
{
    match AssertUnwindSafe(future).catch_unwind().await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(error)) => Err(classify_boxed(error.into(), fallback)),
        Err(payload) => Err(classify_panic(payload)),
    }
}

impl fmt::Debug for ErrorHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorHandler")
            .field("rate_limiter", &self.rate_limiter)
            .field("breaker", &self.breaker)
            .field("default_retry", &self.default_retry)
            .field("debug_mode", &self.debug_mode)
            .finish_non_exhaustive()
    }
}

/// Assembles an [`ErrorHandler`] once at process start
pub struct ErrorHandlerBuilder {
    rules: HashMap<String, QuotaRule>,
    breaker_config: CircuitBreakerConfig,
    default_retry: RetryPolicy,
    clock: Arc<dyn Clock>,
    logger: Arc<dyn ErrorLogger>,
    alerts: Arc<dyn AlertHook>,
    exit: ExitHook,
    debug_mode: bool,
}

impl Default for ErrorHandlerBuilder {
    fn default() -> Self {
        Self {
            rules: HashMap::new(),
            breaker_config: CircuitBreakerConfig::default(),
            default_retry: RetryPolicy::default(),
            clock: Arc::new(SystemClock),
            logger: Arc::new(TracingLogger),
            alerts: Arc::new(NoopAlertHook),
            exit: Arc::new(|code| std::process::exit(code)),
            debug_mode: false,
        }
    }
}

impl ErrorHandlerBuilder {
    pub fn rate_limit<S: Into<String>>(mut self, limit_type: S, rule: QuotaRule) -> Self {
        self.rules.insert(limit_type.into(), rule);
        self
    }

    pub fn rate_limits(mut self, rules: HashMap<String, QuotaRule>) -> Self {
        self.rules.extend(rules);
        self
    }

    pub fn circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.breaker_config = config;
        self
    }

    pub fn default_retry(mut self, policy: RetryPolicy) -> Self {
        self.default_retry = policy;
        self
    }

    /// Clock shared by the rate limiter and the circuit breaker
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn logger(mut self, logger: Arc<dyn ErrorLogger>) -> Self {
        self.logger = logger;
        self
    }

    pub fn alert_hook(mut self, alerts: Arc<dyn AlertHook>) -> Self {
        self.alerts = alerts;
        self
    }

    /// Replaces `std::process::exit`
    pub fn exit_hook<F>(mut self, exit: F) -> Self
    where
        F: Fn(i32) + Send + Sync + 'static,
    {
        self.exit = Arc::new(exit);
        self
    }

    pub fn debug_mode(mut self, debug_mode: bool) -> Self {
        self.debug_mode = debug_mode;
        self
    }

    pub fn build(self) -> ErrorHandler {
        ErrorHandler {
            rate_limiter: Arc::new(RateLimiter::with_clock(self.rules, self.clock.clone())),
            breaker: Arc::new(CircuitBreaker::with_clock(self.breaker_config, self.clock)),
            retry: RetryEngine::new(self.logger.clone()),
            default_retry: self.default_retry,
            logger: self.logger,
            alerts: self.alerts,
            exit: self.exit,
            debug_mode: self.debug_mode,
        }
    }
}
