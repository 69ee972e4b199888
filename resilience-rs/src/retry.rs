//! # Retry Mechanism
//!
//! Re-invokes transiently failing operations with exponential backoff and
//! jitter. Attempts are bounded; exhaustion hands back the last error as is.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::logging::{ErrorLogger, TracingLogger};
use crate::types::{Error, Result, Severity};

/// Decides whether a failure is worth another attempt
pub type RetryPredicate = Arc<dyn Fn(&Error) -> bool + Send + Sync>;

/// Configuration for a retry policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts including the first; values below 1 behave as 1
    pub max_attempts: u32,

    /// Delay before the second attempt; zero retries immediately
    pub base_delay: Duration,

    /// Growth of the delay between consecutive attempts
    pub backoff_factor: f64,

    /// Ceiling applied after jitter
    pub max_delay: Duration,

    /// Uniform jitter as a fraction of the delay (0.2 = ±20%)
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            backoff_factor: 2.0,
            max_delay: Duration::from_secs(30),
            jitter_factor: 0.2,
        }
    }
}

impl RetryConfig {
    /// Attempts actually made, never fewer than one
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Delay before attempt `attempt` (1-based) without jitter, uncapped
    fn nominal_delay_secs(&self, attempt: u32) -> f64 {
        if attempt < 2 {
            return 0.0;
        }
        let exponent = (attempt - 2) as i32;
        self.base_delay.as_secs_f64() * self.backoff_factor.powi(exponent)
    }

    /// Delay to wait before attempt `attempt`, jittered and capped
    pub fn delay_before(&self, attempt: u32) -> Duration {
        let nominal = self.nominal_delay_secs(attempt);
        if nominal <= 0.0 {
            return Duration::ZERO;
        }

        let jitter = self.jitter_factor.clamp(0.0, 1.0);
        let scale = if jitter > 0.0 {
            1.0 + rand::thread_rng().gen_range(-jitter..=jitter)
        } else {
            1.0
        };

        let max_secs = self.max_delay.as_secs_f64();
        let jittered = nominal * scale;
        let secs = if jittered.is_finite() {
            jittered.clamp(0.0, max_secs)
        } else {
            max_secs
        };
        Duration::try_from_secs_f64(secs).unwrap_or(self.max_delay)
    }
}

/// A named retry configuration plus the predicate that decides what to retry
#[derive(Clone)]
pub struct RetryPolicy {
    name: String,
    config: RetryConfig,
    predicate: Option<RetryPredicate>,
}

impl RetryPolicy {
    /// Creates a new retry policy with the given name and configuration
    pub fn new<S: Into<String>>(name: S, config: RetryConfig) -> Self {
        Self {
            name: name.into(),
            config,
            predicate: None,
        }
    }

    /// Creates a policy for operations that should never be retried
    pub fn never() -> Self {
        Self::new(
            "never",
            RetryConfig {
                max_attempts: 1,
                ..Default::default()
            },
        )
    }

    /// Creates a policy for calls to the generation APIs and other upstreams
    pub fn network() -> Self {
        Self::new(
            "network",
            RetryConfig {
                max_attempts: 4,
                base_delay: Duration::from_millis(200),
                backoff_factor: 2.0,
                max_delay: Duration::from_secs(10),
                jitter_factor: 0.2,
            },
        )
    }

    /// Creates a policy for database operations
    pub fn database() -> Self {
        Self::new(
            "database",
            RetryConfig {
                max_attempts: 3,
                base_delay: Duration::from_millis(50),
                backoff_factor: 2.0,
                max_delay: Duration::from_secs(2),
                jitter_factor: 0.1,
            },
        )
    }

    /// Replaces the default predicate ([`Error::is_retryable`])
    pub fn with_predicate<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Error) -> bool + Send + Sync + 'static,
    {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Checks if an error is retryable according to this policy
    pub fn should_retry(&self, error: &Error) -> bool {
        match &self.predicate {
            Some(predicate) => predicate(error),
            None => error.is_retryable(),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new("default", RetryConfig::default())
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("custom_predicate", &self.predicate.is_some())
            .finish()
    }
}

impl fmt::Display for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RetryPolicy({}, max_attempts={})", self.name, self.config.attempts())
    }
}

/// Runs operations under a [`RetryPolicy`], reporting retries to a logger
#[derive(Clone)]
pub struct RetryEngine {
    logger: Arc<dyn ErrorLogger>,
}

impl RetryEngine {
    pub fn new(logger: Arc<dyn ErrorLogger>) -> Self {
        Self { logger }
    }

    /// Executes `operation` until it succeeds, fails permanently or runs out
    /// of attempts
    ///
    /// Each retry is logged at Warning with the attempt number and delay.
    /// When `cancellation` fires during a backoff the loop stops with a
    /// `Cancelled` error.
    pub async fn run<F, Fut, T>(
        &self,
        label: &str,
        policy: &RetryPolicy,
        cancellation: Option<&CancellationToken>,
        mut operation: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = policy.config.attempts();
        let mut attempt = 1;

        loop {
            if cancellation.map_or(false, CancellationToken::is_cancelled) {
                return Err(Error::cancelled(label));
            }

            let error = match operation().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(operation = %label, attempt = attempt, "Operation succeeded after retries");
                    }
                    return Ok(value);
                }
                Err(error) => error,
            };

            if attempt >= max_attempts || !policy.should_retry(&error) {
                return Err(error);
            }

            attempt += 1;
            let delay = policy.config.delay_before(attempt);

            counter!("resilience_retry_attempts_total", 1, "policy" => policy.name.clone());
            let context = error
                .context()
                .clone()
                .with_data("attempt", attempt)
                .with_data("max_attempts", max_attempts)
                .with_data("delay_ms", delay.as_millis() as u64);
            self.logger.log(
                Severity::Warning,
                &format!(
                    "Retrying {} (attempt {}/{}) in {}ms after {}",
                    label,
                    attempt,
                    max_attempts,
                    delay.as_millis(),
                    error.error_code()
                ),
                &context,
            );

            match cancellation {
                Some(token) => {
                    tokio::select! {
                        _ = token.cancelled() => return Err(Error::cancelled(label)),
                        _ = sleep(delay) => {}
                    }
                }
                None => sleep(delay).await,
            }
        }
    }
}

impl Default for RetryEngine {
    fn default() -> Self {
        Self::new(Arc::new(TracingLogger))
    }
}

impl fmt::Debug for RetryEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryEngine").finish_non_exhaustive()
    }
}

/// Helper function to retry an operation, logging retries through `tracing`
pub async fn run_with_retry<F, Fut, T>(policy: &RetryPolicy, operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    RetryEngine::default()
        .run(policy.name(), policy, None, operation)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::testing::RecordingLogger;
    use crate::types::{ErrorKind, RateLimitFailure};

    fn fast(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(
            "test",
            RetryConfig {
                max_attempts,
                base_delay: Duration::from_millis(10),
                ..Default::default()
            },
        )
    }

    fn engine() -> (RetryEngine, Arc<RecordingLogger>) {
        let logger = Arc::new(RecordingLogger::default());
        (RetryEngine::new(logger.clone()), logger)
    }

    #[test]
    fn test_uncapped_delay_saturates() {
        let config = RetryConfig {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::MAX,
            jitter_factor: 0.0,
            ..Default::default()
        };

        assert_eq!(config.delay_before(90), Duration::MAX);
        assert_eq!(config.delay_before(3), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_always_failing_uses_every_attempt() {
        let (engine, logger) = engine();
        let mut calls = 0;

        let result: Result<()> = engine
            .run("story.generate", &fast(4), None, || {
                calls += 1;
                async { Err(Error::new(ErrorKind::Network, "connection reset")) }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls, 4);
        assert_eq!(logger.count(Severity::Warning), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_transient_failures() {
        let (engine, _) = engine();
        let mut calls = 0;

        let result = engine
            .run("story.generate", &fast(5), None, || {
                calls += 1;
                let call = calls;
                async move {
                    if call <= 2 {
                        Err(Error::new(ErrorKind::Timeout, "slow"))
                    } else {
                        Ok(call)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_returns_immediately() {
        let (engine, logger) = engine();
        let mut calls = 0;
        let started = tokio::time::Instant::now();

        let result: Result<()> = engine
            .run("story.create", &fast(5), None, || {
                calls += 1;
                async { Err(Error::new(ErrorKind::Validation, "title missing")) }
            })
            .await;

        assert_eq!(result.unwrap_err().kind(), ErrorKind::Validation);
        assert_eq!(calls, 1);
        assert_eq!(logger.count(Severity::Warning), 0);
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_returns_last_error_unchanged() {
        let (engine, _) = engine();
        let mut calls = 0;
        let mut last_id = None;

        let result: Result<()> = engine
            .run("image.fetch", &fast(2), None, || {
                calls += 1;
                let error = Error::new(ErrorKind::Network, format!("failure {}", calls));
                last_id = Some(error.context().error_id());
                async move { Err(error) }
            })
            .await;

        let error = result.unwrap_err();
        assert_eq!(error.message(), "failure 2");
        assert_eq!(Some(error.context().error_id()), last_id);
    }

    #[tokio::test]
    async fn test_zero_attempts_runs_once() {
        let (engine, _) = engine();
        let mut calls = 0;

        let _: Result<()> = engine
            .run("x", &fast(0), None, || {
                calls += 1;
                async { Err(Error::new(ErrorKind::Network, "down")) }
            })
            .await;

        assert_eq!(calls, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_retried_only_with_hint() {
        let (engine, _) = engine();
        let mut calls = 0;

        let _: Result<()> = engine
            .run("x", &fast(3), None, || {
                calls += 1;
                async { Err(Error::new(ErrorKind::RateLimit(RateLimitFailure::Quota), "busy")) }
            })
            .await;
        assert_eq!(calls, 1);

        calls = 0;
        let _: Result<()> = engine
            .run("x", &fast(3), None, || {
                calls += 1;
                async {
                    Err(Error::new(ErrorKind::RateLimit(RateLimitFailure::Quota), "busy").data("retry_after", 1))
                }
            })
            .await;
        assert_eq!(calls, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_custom_predicate() {
        let (engine, _) = engine();
        let mut calls = 0;
        let policy = fast(3).with_predicate(|e| e.kind() == ErrorKind::StoryGeneration);

        let _: Result<()> = engine
            .run("story.generate", &policy, None, || {
                calls += 1;
                async { Err(Error::new(ErrorKind::StoryGeneration, "model overloaded")) }
            })
            .await;

        assert_eq!(calls, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_during_backoff() {
        let (engine, _) = engine();
        let token = CancellationToken::new();
        let policy = RetryPolicy::new(
            "slow",
            RetryConfig {
                max_attempts: 5,
                base_delay: Duration::from_secs(10),
                ..Default::default()
            },
        );

        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            canceller.cancel();
        });

        let mut calls = 0;
        let result: Result<()> = engine
            .run("image.fetch", &policy, Some(&token), || {
                calls += 1;
                async { Err(Error::new(ErrorKind::Network, "down")) }
            })
            .await;

        assert_eq!(result.unwrap_err().kind(), ErrorKind::Cancelled);
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_delay_growth_jitter_and_ceiling() {
        let config = RetryConfig {
            max_attempts: 10,
            base_delay: Duration::from_millis(100),
            backoff_factor: 2.0,
            max_delay: Duration::from_millis(500),
            jitter_factor: 0.2,
        };

        assert_eq!(config.delay_before(1), Duration::ZERO);

        for _ in 0..50 {
            let second = config.delay_before(2).as_secs_f64();
            assert!((0.08..=0.12).contains(&second), "{}", second);

            let third = config.delay_before(3).as_secs_f64();
            assert!((0.16..=0.24).contains(&third), "{}", third);

            assert!(config.delay_before(9) <= Duration::from_millis(500));
        }
    }

    #[test]
    fn test_zero_base_delay_is_immediate() {
        let config = RetryConfig {
            base_delay: Duration::ZERO,
            ..Default::default()
        };
        assert_eq!(config.delay_before(3), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_with_retry_helper() {
        let mut calls = 0;
        let result = run_with_retry(&fast(3), || {
            calls += 1;
            let call = calls;
            async move {
                if call == 1 {
                    Err(Error::new(ErrorKind::Network, "blip"))
                } else {
                    Ok("done")
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), "done");
    }
}
