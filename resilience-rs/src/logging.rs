//! # Structured Logging
//!
//! Subscriber initialisation, task-scoped correlation ids, and the
//! [`ErrorLogger`] collaborator the facade and retry engine write through.

use std::future::Future;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter, Registry};

use crate::codes;
use crate::context::ErrorContext;
use crate::types::{Error, ErrorKind, Result, Severity};

tokio::task_local! {
    static CORRELATION_ID: String;
}

/// Configuration for the logging system
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// The log level to use (trace, debug, info, warn, error)
    pub level: String,
    /// The service name, also used as the log file prefix
    pub service_name: String,
    /// Whether to output logs to a file
    pub file_output: bool,
    /// The directory to store log files in
    pub log_dir: Option<String>,
    /// Whether to use JSON formatting
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            service_name: "story-service".to_string(),
            file_output: false,
            log_dir: None,
            json_format: true,
        }
    }
}

/// Installs the global `tracing` subscriber
///
/// The returned guard flushes the file writer when dropped; keep it alive for
/// the lifetime of the process. `RUST_LOG` overrides the configured level.
pub fn init_logging(config: Option<LoggingConfig>) -> Result<Option<WorkerGuard>> {
    let config = config.unwrap_or_default();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|e| init_error(format!("invalid log level '{}': {}", config.level, e)))?;

    let json_layer = config.json_format.then(|| {
        fmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .with_target(true)
    });
    let text_layer = (!config.json_format).then(|| fmt::layer().with_target(true));

    let (file_layer, guard) = match (config.file_output, config.log_dir.as_deref()) {
        (true, Some(log_dir)) => {
            let appender =
                tracing_appender::rolling::daily(log_dir, format!("{}.log", config.service_name));
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (Some(fmt::layer().with_writer(writer).with_ansi(false)), Some(guard))
        }
        _ => (None, None),
    };

    let subscriber = Registry::default()
        .with(filter)
        .with(json_layer)
        .with(text_layer)
        .with(file_layer);

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| init_error(format!("failed to set global subscriber: {}", e)))?;

    info!(
        service = %config.service_name,
        level = %config.level,
        json = %config.json_format,
        "Structured logging initialized"
    );

    Ok(guard)
}

fn init_error(message: String) -> Error {
    Error::new(ErrorKind::Configuration, message)
        .code(codes::CFG_LOGGING_INIT)
        .source_label("logging.init")
}

/// Runs `future` with `correlation_id` visible to every error created inside it
pub async fn with_correlation_id<F, S>(correlation_id: S, future: F) -> F::Output
where
    F: Future,
    S: Into<String>,
{
    CORRELATION_ID.scope(correlation_id.into(), future).await
}

/// Retrieves the correlation id of the current task, if one is in scope
pub fn current_correlation_id() -> Option<String> {
    CORRELATION_ID.try_with(|id| id.clone()).ok()
}

/// Sink for classified failures and retry notices
///
/// Injected into the facade; the core never owns a concrete logger.
pub trait ErrorLogger: Send + Sync {
    fn log(&self, severity: Severity, message: &str, context: &ErrorContext);

    /// Called before the process exits on a critical error
    fn flush(&self) {}
}

/// Writes through `tracing`, mapping severity to level
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLogger;

macro_rules! emit {
    ($level:ident, $message:expr, $context:expr) => {
        $level!(
            error_id = %$context.error_id(),
            source = %$context.source(),
            severity = %$context.severity(),
            user_id = ?$context.user_id(),
            request_id = ?$context.request_id(),
            trace_id = ?$context.trace_id(),
            data = %serde_json::Value::Object($context.additional_data().clone()),
            "{}",
            $message
        )
    };
}

impl ErrorLogger for TracingLogger {
    fn log(&self, severity: Severity, message: &str, context: &ErrorContext) {
        match severity {
            Severity::Info => emit!(info, message, context),
            Severity::Warning => emit!(warn, message, context),
            Severity::Error | Severity::Critical => emit!(error, message, context),
        }
    }
}

/// Logs an error at the appropriate level based on its severity
pub fn log_structured_error(logger: &dyn ErrorLogger, error: &Error) {
    let message = format!("{} [{}]: {}", error.error_code(), error.kind(), error.message());
    if let Some(details) = error.details_text() {
        debug!(error_id = %error.context().error_id(), details = %details, "error details");
    }
    logger.log(error.severity_level(), &message, error.context());
}
