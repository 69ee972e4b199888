//! # Standardized Error Types
//!
//! The error taxonomy shared by every layer of the story service. A failure is
//! an [`Error`]: a closed [`ErrorKind`], a stable code, a user-safe message and
//! an immutable [`ErrorContext`] captured where the failure was detected.

use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::codes;
use crate::context::ErrorContext;

/// A type alias for Result with the error type defaulting to our Error
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Any error an operation may hand back before classification
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// The severity level of an error
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    /// Informational, nothing is broken
    Info,
    /// Degraded but recoverable
    Warning,
    /// The request failed
    Error,
    /// The service itself is in trouble; operators are alerted
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Info => write!(f, "INFO"),
            Severity::Warning => write!(f, "WARNING"),
            Severity::Error => write!(f, "ERROR"),
            Severity::Critical => write!(f, "CRITICAL"),
        }
    }
}

/// Which part of a database interaction failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DatabaseFailure {
    Connection,
    Transaction,
    Migration,
    Integrity,
}

/// Which quota dimension rejected the request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RateLimitFailure {
    /// Requests or tokens per window
    Quota,
    /// Too many operations in flight
    Concurrency,
    /// Too many requests inside the short burst window
    Burst,
    /// Monetary budget per window
    Cost,
}

/// Categorizes different kinds of errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    Validation,
    Authentication,
    Authorization,
    NotFound,
    Database(DatabaseFailure),
    Network,
    RateLimit(RateLimitFailure),
    CircuitOpen,
    Configuration,
    ImageGeneration,
    StoryGeneration,
    Token,
    Session,
    Process,
    Timeout,
    Cancelled,
    Unexpected,
}

impl ErrorKind {
    /// Every kind, including each database and rate limit sub-kind
    pub const ALL: [ErrorKind; 23] = [
        ErrorKind::Validation,
        ErrorKind::Authentication,
        ErrorKind::Authorization,
        ErrorKind::NotFound,
        ErrorKind::Database(DatabaseFailure::Connection),
        ErrorKind::Database(DatabaseFailure::Transaction),
        ErrorKind::Database(DatabaseFailure::Migration),
        ErrorKind::Database(DatabaseFailure::Integrity),
        ErrorKind::Network,
        ErrorKind::RateLimit(RateLimitFailure::Quota),
        ErrorKind::RateLimit(RateLimitFailure::Concurrency),
        ErrorKind::RateLimit(RateLimitFailure::Burst),
        ErrorKind::RateLimit(RateLimitFailure::Cost),
        ErrorKind::CircuitOpen,
        ErrorKind::Configuration,
        ErrorKind::ImageGeneration,
        ErrorKind::StoryGeneration,
        ErrorKind::Token,
        ErrorKind::Session,
        ErrorKind::Process,
        ErrorKind::Timeout,
        ErrorKind::Cancelled,
        ErrorKind::Unexpected,
    ];

    /// Severity assigned when the raiser does not pick one
    pub fn default_severity(&self) -> Severity {
        match self {
            ErrorKind::CircuitOpen | ErrorKind::RateLimit(_) => Severity::Warning,
            ErrorKind::Cancelled => Severity::Info,
            ErrorKind::Unexpected => Severity::Critical,
            _ => Severity::Error,
        }
    }

    /// A generic user-safe message for this kind
    pub fn user_message(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "The request contains invalid data",
            ErrorKind::Authentication => "Authentication failed",
            ErrorKind::Authorization => "You do not have access to this resource",
            ErrorKind::NotFound => "The requested resource was not found",
            ErrorKind::Database(DatabaseFailure::Integrity) => "The item conflicts with existing data",
            ErrorKind::Database(_) => "The story library is temporarily unavailable",
            ErrorKind::Network => "A dependent service could not be reached",
            ErrorKind::RateLimit(_) => "Too many requests, please slow down",
            ErrorKind::CircuitOpen => "The service is temporarily unavailable",
            ErrorKind::Configuration => "The service is misconfigured",
            ErrorKind::ImageGeneration => "The illustration could not be generated",
            ErrorKind::StoryGeneration => "The story could not be generated",
            ErrorKind::Token => "The access token is invalid",
            ErrorKind::Session => "Your session has expired",
            ErrorKind::Process => "A background process failed",
            ErrorKind::Timeout => "The operation timed out",
            ErrorKind::Cancelled => "The request was cancelled",
            ErrorKind::Unexpected => "An unexpected error occurred",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Database(failure) => write!(f, "Database/{:?}", failure),
            ErrorKind::RateLimit(failure) => write!(f, "RateLimit/{:?}", failure),
            other => write!(f, "{:?}", other),
        }
    }
}

/// Core error type: one classified failure occurrence
///
/// Built once through the consuming setters below and then handed around by
/// value. `Clone` shares the underlying cause instead of copying it.
#[derive(Debug, Clone, Serialize)]
pub struct Error {
    kind: ErrorKind,
    code: String,
    message: String,
    http_status: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
    suggestions: Vec<String>,
    context: ErrorContext,
    client_safe: bool,
    transient: bool,
    #[serde(skip)]
    cause: Option<Arc<dyn StdError + Send + Sync>>,
}

impl Error {
    /// Creates a new error with the specified kind and message
    pub fn new<S: Into<String>>(kind: ErrorKind, message: S) -> Self {
        let code = codes::default_code(&kind);
        Self {
            kind,
            code: code.to_string(),
            message: message.into(),
            http_status: codes::http_status(code, &kind),
            details: None,
            suggestions: Vec::new(),
            context: ErrorContext::new(ErrorContext::UNKNOWN_SOURCE, kind.default_severity()),
            client_safe: false,
            transient: false,
            cause: None,
        }
    }

    /// Sets the error code; an empty code keeps the kind's default
    pub fn code<S: Into<String>>(mut self, code: S) -> Self {
        let code = code.into();
        if code.trim().is_empty() {
            return self;
        }
        if !codes::is_well_formed(&code) {
            tracing::debug!(code = %code, "error code does not follow DOMAIN-CATEGORY-SPECIFIC-NUMBER");
        }
        self.http_status = codes::http_status(&code, &self.kind);
        self.code = code;
        self
    }

    /// Sets the error severity
    pub fn severity(mut self, severity: Severity) -> Self {
        self.context = self.context.with_severity(severity);
        self
    }

    /// Sets the dotted source of the failure, e.g. `story.generate`
    pub fn source_label<S: Into<String>>(mut self, source: S) -> Self {
        self.context = self.context.with_source(source);
        self
    }

    /// Replaces the whole context
    pub fn with_context(mut self, context: ErrorContext) -> Self {
        self.context = context;
        self
    }

    /// Adds a diagnostic key/value pair to the context
    pub fn data<K, V>(mut self, key: K, value: V) -> Self
    where
        K: Into<String>,
        V: Serialize,
    {
        self.context = self.context.with_data(key, value);
        self
    }

    /// Sets the longer diagnostic text
    pub fn details<S: Into<String>>(mut self, details: S) -> Self {
        self.details = Some(details.into());
        self
    }

    /// Appends a remediation hint
    pub fn suggestion<S: Into<String>>(mut self, suggestion: S) -> Self {
        self.suggestions.push(suggestion.into());
        self
    }

    /// Overrides the HTTP status derived from the code
    pub fn http_status_override(mut self, status: u16) -> Self {
        self.http_status = status;
        self
    }

    /// Marks details and diagnostic data as safe to show to end users
    pub fn client_safe(mut self) -> Self {
        self.client_safe = true;
        self
    }

    /// Marks this error as transient (can be retried)
    pub fn transient(mut self) -> Self {
        self.transient = true;
        self
    }

    /// Chains this error with its cause
    pub fn cause<E>(mut self, cause: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        self.cause = Some(Arc::new(cause));
        self
    }

    /// The operation under `source` ran past its deadline
    pub fn timeout<S: Into<String>>(source: S, after: Duration) -> Self {
        Error::new(ErrorKind::Timeout, ErrorKind::Timeout.user_message())
            .code(codes::TIMEOUT)
            .source_label(source)
            .data("timeout_ms", after.as_millis() as u64)
    }

    /// The caller gave up on the operation under `source`
    pub fn cancelled<S: Into<String>>(source: S) -> Self {
        Error::new(ErrorKind::Cancelled, ErrorKind::Cancelled.user_message())
            .code(codes::CANCELLED)
            .source_label(source)
    }

    pub(crate) fn shared_cause(mut self, cause: Arc<dyn StdError + Send + Sync>) -> Self {
        self.cause = Some(cause);
        self
    }

    /// Fills in call-site identity the raiser could not know about
    pub(crate) fn scoped(
        mut self,
        source: &str,
        user_id: Option<&str>,
        request_id: Option<&str>,
        trace_id: Option<&str>,
    ) -> Self {
        self.context = self.context.fill_missing(source, user_id, request_id, trace_id);
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn error_code(&self) -> &str {
        &self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn http_status(&self) -> u16 {
        self.http_status
    }

    pub fn details_text(&self) -> Option<&str> {
        self.details.as_deref()
    }

    /// Suggestions given by the raiser, or the kind's defaults
    pub fn suggestions(&self) -> Vec<String> {
        if self.suggestions.is_empty() {
            codes::default_suggestions(&self.kind)
                .iter()
                .map(|s| s.to_string())
                .collect()
        } else {
            self.suggestions.clone()
        }
    }

    pub fn context(&self) -> &ErrorContext {
        &self.context
    }

    pub fn severity_level(&self) -> Severity {
        self.context.severity()
    }

    pub fn is_client_safe(&self) -> bool {
        self.client_safe
    }

    /// Returns true if this error was explicitly marked as transient
    pub fn is_transient(&self) -> bool {
        self.transient
    }

    /// How long the raiser asked callers to wait, from `retry_after` seconds
    pub fn retry_after(&self) -> Option<Duration> {
        self.context
            .additional_data()
            .get("retry_after")
            .and_then(|value| value.as_u64())
            .map(Duration::from_secs)
    }

    /// True when the failure carries a hint about when to retry
    pub fn has_retry_hint(&self) -> bool {
        let data = self.context.additional_data();
        data.contains_key("retry_after") || data.contains_key("reset_time")
    }

    /// Whether the default retry predicate considers this failure worth retrying
    pub fn is_retryable(&self) -> bool {
        match self.kind {
            ErrorKind::Validation
            | ErrorKind::Authentication
            | ErrorKind::Authorization
            | ErrorKind::NotFound
            | ErrorKind::Configuration
            | ErrorKind::CircuitOpen
            | ErrorKind::Cancelled => false,
            ErrorKind::Network | ErrorKind::Timeout => true,
            ErrorKind::Database(DatabaseFailure::Connection)
            | ErrorKind::Database(DatabaseFailure::Transaction) => true,
            ErrorKind::RateLimit(_) => self.has_retry_hint(),
            _ => self.transient,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} {}: {} (error_id: {})",
            self.context.severity(),
            self.code,
            self.kind,
            self.message,
            self.context.error_id()
        )
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.cause
            .as_ref()
            .map(|e| e.as_ref() as &(dyn StdError + 'static))
    }
}

/// Failure reported by the persistence layer, carrying which step failed
///
/// ORM adapters convert driver errors into this type so that classification
/// can tell a duplicate key apart from a dropped connection.
#[derive(Debug, thiserror::Error)]
#[error("database {failure:?} failure: {message}")]
pub struct DatabaseError {
    pub failure: DatabaseFailure,
    pub message: String,
}

impl DatabaseError {
    pub fn new<S: Into<String>>(failure: DatabaseFailure, message: S) -> Self {
        Self {
            failure,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = Error::new(ErrorKind::Validation, "Story title is too long")
            .source_label("story.create")
            .code("VAL-TITLE-LEN-001")
            .data("field", "title")
            .severity(Severity::Warning);

        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(err.message(), "Story title is too long");
        assert_eq!(err.error_code(), "VAL-TITLE-LEN-001");
        assert_eq!(err.severity_level(), Severity::Warning);
        assert_eq!(err.context().source(), "story.create");
        assert_eq!(err.http_status(), 400);
        assert_eq!(err.context().additional_data()["field"], "title");
    }

    #[test]
    fn test_empty_code_keeps_default() {
        let err = Error::new(ErrorKind::Authentication, "bad password").code("  ");
        assert_eq!(err.error_code(), codes::AUTH_CREDENTIALS_INVALID);
        assert_eq!(err.http_status(), 401);
    }

    #[test]
    fn test_error_display() {
        let err = Error::new(ErrorKind::Validation, "Invalid input");
        let display = format!("{}", err);
        assert!(display.contains("ERROR"));
        assert!(display.contains("VAL-INPUT-INV-001"));
        assert!(display.contains("Invalid input"));
        assert!(display.contains(&err.context().error_id().to_string()));
    }

    #[test]
    fn test_default_retryability() {
        assert!(Error::new(ErrorKind::Network, "reset").is_retryable());
        assert!(Error::new(ErrorKind::Database(DatabaseFailure::Connection), "down").is_retryable());
        assert!(!Error::new(ErrorKind::Database(DatabaseFailure::Integrity), "dup").is_retryable());
        assert!(!Error::new(ErrorKind::Authentication, "no").is_retryable());
        assert!(!Error::new(ErrorKind::CircuitOpen, "open").is_retryable());
        assert!(!Error::new(ErrorKind::RateLimit(RateLimitFailure::Quota), "slow").is_retryable());
        assert!(Error::new(ErrorKind::RateLimit(RateLimitFailure::Quota), "slow")
            .data("retry_after", 3)
            .is_retryable());
        assert!(Error::new(ErrorKind::StoryGeneration, "overloaded").transient().is_retryable());
    }

    #[test]
    fn test_default_suggestions_apply() {
        let err = Error::new(ErrorKind::CircuitOpen, "image api down");
        assert!(!err.suggestions().is_empty());

        let err = err.suggestion("Use a cached illustration");
        assert_eq!(err.suggestions(), vec!["Use a cached illustration".to_string()]);
    }

    #[test]
    fn test_cause_is_exposed_as_source() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk full");
        let err = Error::new(ErrorKind::Process, "export failed").cause(io);
        assert!(StdError::source(&err).is_some());
    }
}
