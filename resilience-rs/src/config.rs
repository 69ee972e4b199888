//! # Settings
//!
//! Construction-time configuration for the resilience core: built-in
//! defaults, then an optional settings file, then `RESILIENCE_*` environment
//! variables (nested keys separated by `__`, e.g.
//! `RESILIENCE_CIRCUIT_BREAKER__COOLDOWN_SECS=30`).

use std::collections::HashMap;
use std::time::Duration;

use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::logging::LoggingConfig;
use crate::rate_limiter::{BurstRule, Dimension, QuotaRule};
use crate::retry::RetryConfig;

/// Errors raised while loading or validating settings
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("failed to load settings: {0}")]
    Load(#[from] config::ConfigError),

    #[error("failed to encode default settings: {0}")]
    Defaults(#[from] serde_json::Error),

    #[error("invalid setting `{field}`: {reason}")]
    Invalid { field: String, reason: String },
}

fn invalid(field: impl Into<String>, reason: impl Into<String>) -> SettingsError {
    SettingsError::Invalid {
        field: field.into(),
        reason: reason.into(),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    /// Negative values are treated as zero
    pub base_delay_ms: i64,
    pub backoff_factor: f64,
    pub max_delay_ms: u64,
    pub jitter_factor: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 100,
            backoff_factor: 2.0,
            max_delay_ms: 30_000,
            jitter_factor: 0.2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerSettings {
    pub failure_threshold: u32,
    pub cooldown_secs: u64,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown_secs: 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaRuleSettings {
    pub dimension: Dimension,
    pub limit: u64,
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
    #[serde(default)]
    pub burst_limit: Option<u64>,
    #[serde(default)]
    pub burst_window_secs: Option<u64>,
}

fn default_window_secs() -> u64 {
    60
}

impl QuotaRuleSettings {
    fn per_minute(dimension: Dimension, limit: u64) -> Self {
        Self {
            dimension,
            limit,
            window_secs: default_window_secs(),
            burst_limit: None,
            burst_window_secs: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SweeperSettings {
    pub enabled: bool,
    pub interval_secs: u64,
    pub max_idle_secs: u64,
}

impl Default for SweeperSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 60,
            max_idle_secs: 600,
        }
    }
}

/// All settings of the resilience core
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceSettings {
    pub retry: RetrySettings,
    pub circuit_breaker: CircuitBreakerSettings,
    pub rate_limits: HashMap<String, QuotaRuleSettings>,
    pub sweeper: SweeperSettings,
    pub logging: LoggingConfig,
    /// Include diagnostic details in response payloads
    pub debug_mode: bool,
}

impl Default for ResilienceSettings {
    fn default() -> Self {
        let mut rate_limits = HashMap::new();
        rate_limits.insert(
            "chat".to_string(),
            QuotaRuleSettings {
                burst_limit: Some(10),
                burst_window_secs: Some(10),
                ..QuotaRuleSettings::per_minute(Dimension::Requests, 60)
            },
        );
        rate_limits.insert(
            "story_tokens".to_string(),
            QuotaRuleSettings::per_minute(Dimension::Tokens, 40_000),
        );
        rate_limits.insert(
            "image_concurrency".to_string(),
            QuotaRuleSettings::per_minute(Dimension::Concurrency, 3),
        );
        rate_limits.insert(
            "generation_cost".to_string(),
            QuotaRuleSettings::per_minute(Dimension::Cost, 500),
        );

        Self {
            retry: RetrySettings::default(),
            circuit_breaker: CircuitBreakerSettings::default(),
            rate_limits,
            sweeper: SweeperSettings::default(),
            logging: LoggingConfig::default(),
            debug_mode: false,
        }
    }
}

impl TryFrom<Config> for ResilienceSettings {
    type Error = SettingsError;

    fn try_from(cfg: Config) -> Result<Self, Self::Error> {
        let settings: ResilienceSettings = cfg.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }
}

impl ResilienceSettings {
    /// Loads defaults, then `path` if it exists, then the environment
    ///
    /// A `.env` file in the working directory is honoured.
    pub fn load(path: Option<&str>) -> Result<Self, SettingsError> {
        dotenv::dotenv().ok();

        let defaults = serde_json::to_string(&Self::default())?;
        let mut builder = Config::builder().add_source(File::from_str(&defaults, FileFormat::Json));
        if let Some(path) = path {
            builder = builder.add_source(File::with_name(path).required(false));
        }
        let cfg = builder
            .add_source(
                Environment::with_prefix("RESILIENCE")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Self::try_from(cfg)
    }

    /// Rejects settings the core cannot run with
    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.retry.backoff_factor < 1.0 || !self.retry.backoff_factor.is_finite() {
            return Err(invalid("retry.backoff_factor", "must be a finite number >= 1.0"));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter_factor) {
            return Err(invalid("retry.jitter_factor", "must be between 0.0 and 1.0"));
        }
        if self.circuit_breaker.failure_threshold == 0 {
            return Err(invalid("circuit_breaker.failure_threshold", "must be at least 1"));
        }
        if self.circuit_breaker.cooldown_secs == 0 {
            return Err(invalid("circuit_breaker.cooldown_secs", "must be at least 1 second"));
        }

        for (name, rule) in &self.rate_limits {
            let field = |suffix: &str| format!("rate_limits.{}.{}", name, suffix);
            if rule.limit == 0 {
                return Err(invalid(field("limit"), "must be at least 1"));
            }
            if rule.dimension != Dimension::Concurrency && rule.window_secs == 0 {
                return Err(invalid(field("window_secs"), "must be at least 1 second"));
            }
            match (rule.burst_limit, rule.burst_window_secs) {
                (None, None) => {}
                (Some(0), _) => return Err(invalid(field("burst_limit"), "must be at least 1")),
                (Some(_), Some(0)) => {
                    return Err(invalid(field("burst_window_secs"), "must be at least 1 second"))
                }
                (Some(_), Some(_)) if rule.dimension == Dimension::Concurrency => {
                    return Err(invalid(field("burst_limit"), "not supported for concurrency limits"))
                }
                (Some(_), Some(_)) => {}
                _ => {
                    return Err(invalid(
                        field("burst_limit"),
                        "burst_limit and burst_window_secs must be set together",
                    ))
                }
            }
        }

        if self.sweeper.enabled && self.sweeper.interval_secs == 0 {
            return Err(invalid("sweeper.interval_secs", "must be at least 1 second"));
        }
        Ok(())
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.retry.max_attempts,
            base_delay: Duration::from_millis(self.retry.base_delay_ms.max(0) as u64),
            backoff_factor: self.retry.backoff_factor,
            max_delay: Duration::from_millis(self.retry.max_delay_ms),
            jitter_factor: self.retry.jitter_factor,
        }
    }

    pub fn circuit_breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.circuit_breaker.failure_threshold,
            cooldown: Duration::from_secs(self.circuit_breaker.cooldown_secs),
        }
    }

    pub fn quota_rules(&self) -> HashMap<String, QuotaRule> {
        self.rate_limits
            .iter()
            .map(|(name, rule)| {
                let burst = rule
                    .burst_limit
                    .zip(rule.burst_window_secs)
                    .map(|(limit, window)| BurstRule {
                        limit,
                        window: Duration::from_secs(window),
                    });
                let quota = QuotaRule {
                    dimension: rule.dimension,
                    limit: rule.limit,
                    window: Duration::from_secs(rule.window_secs),
                    burst,
                };
                (name.clone(), quota)
            })
            .collect()
    }
}
