//! # Resilience Core
//!
//! Error handling and resilience for the story generation service:
//! a typed error taxonomy with stable codes, classification of foreign
//! failures, structured logging, sanitized user responses, retry with
//! exponential backoff, per-dependency circuit breaking and multi-dimension
//! rate limiting.
//!
//! ## Features
//!
//! - Error kinds with default severity, HTTP status and user-safe messages
//! - Classification of I/O, HTTP client, database and panic failures
//! - Structured logging with correlation ids
//! - Response payloads that never leak diagnostics or secrets
//! - Retry with exponential backoff and jitter
//! - Circuit breaker with a single half-open trial
//! - Rate limits on requests, tokens, concurrency and cost
//! - A facade composing all of the above around one operation
//!

pub mod circuit_breaker;
pub mod classify;
pub mod clock;
pub mod codes;
pub mod config;
pub mod context;
pub mod facade;
pub mod logging;
pub mod rate_limiter;
pub mod reporting;
pub mod retry;
pub mod sanitization;
pub mod types;

#[cfg(test)]
mod tests;

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;

// Re-export commonly used types
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use classify::{classify, classify_anyhow, classify_boxed};
pub use clock::{Clock, ManualClock, SystemClock};
pub use crate::config::{ResilienceSettings, SettingsError};
pub use context::{ErrorContext, WithContext};
pub use facade::{ErrorHandler, ExecutionPolicy};
pub use logging::{current_correlation_id, init_logging, with_correlation_id, ErrorLogger};
pub use rate_limiter::{Decision, Dimension, QuotaRule, RateLimiter};
pub use reporting::{AlertHook, InMemoryReporter};
pub use retry::{run_with_retry, RetryConfig, RetryPolicy};
pub use sanitization::{response_headers, to_response_payload, ResponsePayload};
pub use types::{Error, ErrorKind, Result, Severity};

/// A running resilience core
///
/// Holds the log writer guard and the idle-state sweeper; dropping it stops
/// the sweeper and flushes pending log lines.
pub struct Resilience {
    handler: Arc<ErrorHandler>,
    sweeper: Option<JoinHandle<()>>,
    _log_guard: Option<WorkerGuard>,
}

impl Resilience {
    pub fn handler(&self) -> &Arc<ErrorHandler> {
        &self.handler
    }
}

impl Drop for Resilience {
    fn drop(&mut self) {
        if let Some(sweeper) = self.sweeper.take() {
            sweeper.abort();
        }
    }
}

/// Initializes logging and the error handler from settings
///
/// The sweeper only starts when called inside a Tokio runtime.
pub fn init(settings: &ResilienceSettings) -> Result<Resilience> {
    let log_guard = init_logging(Some(settings.logging.clone()))?;

    let handler = ErrorHandler::from_settings(settings)
        .map(Arc::new)
        .map_err(|e| classify(&e, Some(ErrorKind::Configuration)).source_label("resilience.init"))?;

    let sweeper = match (settings.sweeper.enabled, tokio::runtime::Handle::try_current()) {
        (true, Ok(_)) => Some(handler.rate_limiter().spawn_sweeper(
            Duration::from_secs(settings.sweeper.interval_secs),
            Duration::from_secs(settings.sweeper.max_idle_secs),
        )),
        (true, Err(_)) => {
            warn!("No Tokio runtime available, idle rate limit state will not be swept");
            None
        }
        (false, _) => None,
    };

    info!(
        rate_limits = settings.rate_limits.len(),
        debug_mode = settings.debug_mode,
        "Resilience core initialized"
    );

    Ok(Resilience {
        handler,
        sweeper,
        _log_guard: log_guard,
    })
}

/// Loads settings from `path` and the environment, then initializes
pub fn init_from_env(path: Option<&str>) -> Result<Resilience> {
    let settings = ResilienceSettings::load(path)
        .map_err(|e| classify(&e, Some(ErrorKind::Configuration)).source_label("resilience.init"))?;
    init(&settings)
}
