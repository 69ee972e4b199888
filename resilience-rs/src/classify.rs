//! # Classification
//!
//! Maps arbitrary failures onto the error taxonomy. Classification must never
//! fail: whatever happens while inspecting an error, the caller gets back a
//! well-formed [`Error`].

use std::any::Any;
use std::error::Error as StdError;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use crate::codes;
use crate::config::SettingsError;
use crate::types::{BoxError, DatabaseError, DatabaseFailure, Error, ErrorKind, RateLimitFailure, Severity};

/// Classifies a borrowed error, walking its source chain
///
/// Known error types map to specific kinds. Anything else becomes `fallback`
/// when given, or `SYS-UNEXPECTED-001` with critical severity.
pub fn classify(error: &(dyn StdError + 'static), fallback: Option<ErrorKind>) -> Error {
    guarded(|| {
        let chain = std::iter::successors(Some(error), |e: &&(dyn StdError + 'static)| (*e).source());
        classify_chain(chain, fallback, || error.to_string())
    })
}

/// Classifies an owned error, keeping it as the cause of the result
///
/// An error that already is an [`Error`] is returned unchanged.
pub fn classify_boxed(error: BoxError, fallback: Option<ErrorKind>) -> Error {
    let error = match error.downcast::<Error>() {
        Ok(ours) => return *ours,
        Err(other) => other,
    };
    let cause: Arc<dyn StdError + Send + Sync> = Arc::from(error);
    let classified = classify(cause.as_ref(), fallback);
    if StdError::source(&classified).is_none() {
        classified.shared_cause(cause)
    } else {
        classified
    }
}

/// Classifies an `anyhow` error using every layer of its chain
pub fn classify_anyhow(error: &anyhow::Error, fallback: Option<ErrorKind>) -> Error {
    guarded(|| classify_chain(error.chain(), fallback, || format!("{:#}", error)))
}

/// Turns a caught panic payload into an unexpected, critical error
pub fn classify_panic(payload: Box<dyn Any + Send>) -> Error {
    let text = panic_text(payload.as_ref());
    unexpected(text).data("panicked", true)
}

fn guarded<F>(classify_fn: F) -> Error
where
    F: FnOnce() -> Error,
{
    match panic::catch_unwind(AssertUnwindSafe(classify_fn)) {
        Ok(error) => error,
        Err(payload) => {
            let reason = panic_text(payload.as_ref());
            tracing::error!(reason = %reason, "error classification panicked");
            Error::new(ErrorKind::Unexpected, ErrorKind::Unexpected.user_message())
                .code(codes::UNEXPECTED)
                .severity(Severity::Critical)
                .data("classification_failure", reason)
        }
    }
}

fn classify_chain<'a, I, D>(chain: I, fallback: Option<ErrorKind>, describe: D) -> Error
where
    I: Iterator<Item = &'a (dyn StdError + 'static)>,
    D: FnOnce() -> String,
{
    for layer in chain {
        if let Some(known) = classify_known(layer) {
            return known;
        }
    }

    let text = describe();
    match fallback {
        Some(kind) if kind != ErrorKind::Unexpected => {
            Error::new(kind, kind.user_message()).details(text)
        }
        _ => unexpected(text),
    }
}

fn unexpected(text: String) -> Error {
    Error::new(ErrorKind::Unexpected, ErrorKind::Unexpected.user_message())
        .code(codes::UNEXPECTED)
        .severity(Severity::Critical)
        .details(text)
}

fn classify_known(error: &(dyn StdError + 'static)) -> Option<Error> {
    if let Some(ours) = error.downcast_ref::<Error>() {
        return Some(ours.clone());
    }
    if let Some(db) = error.downcast_ref::<DatabaseError>() {
        return Some(from_database(db));
    }
    if let Some(io) = error.downcast_ref::<io::Error>() {
        return Some(from_io(io));
    }
    if let Some(http) = error.downcast_ref::<reqwest::Error>() {
        return Some(from_reqwest(http));
    }
    if error.downcast_ref::<tokio::time::error::Elapsed>().is_some() {
        return Some(
            Error::new(ErrorKind::Timeout, ErrorKind::Timeout.user_message())
                .code(codes::TIMEOUT)
                .details(error.to_string())
                .transient(),
        );
    }
    if let Some(json) = error.downcast_ref::<serde_json::Error>() {
        return Some(
            Error::new(ErrorKind::Validation, "The request body could not be parsed")
                .code(codes::VALIDATION_PAYLOAD_MALFORMED)
                .details(json.to_string())
                .data("line", json.line())
                .data("column", json.column()),
        );
    }
    if let Some(uuid) = error.downcast_ref::<uuid::Error>() {
        return Some(
            Error::new(ErrorKind::Validation, "The identifier is not a valid id")
                .details(uuid.to_string())
                .client_safe(),
        );
    }
    if error.downcast_ref::<config::ConfigError>().is_some()
        || error.downcast_ref::<SettingsError>().is_some()
    {
        return Some(
            Error::new(ErrorKind::Configuration, ErrorKind::Configuration.user_message())
                .details(error.to_string()),
        );
    }
    None
}

fn from_database(db: &DatabaseError) -> Error {
    let kind = ErrorKind::Database(db.failure);
    let error = Error::new(kind, kind.user_message()).details(db.message.clone());
    match db.failure {
        DatabaseFailure::Connection | DatabaseFailure::Transaction => error.transient(),
        DatabaseFailure::Integrity => error.client_safe(),
        DatabaseFailure::Migration => error.severity(Severity::Critical),
    }
}

fn from_io(error: &io::Error) -> Error {
    let details = error.to_string();
    match error.kind() {
        io::ErrorKind::TimedOut => Error::new(ErrorKind::Network, "The upstream service did not respond in time")
            .code(codes::NET_REQUEST_TIMEOUT)
            .details(details)
            .transient(),
        io::ErrorKind::ConnectionRefused
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::NotConnected
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::AddrNotAvailable => Error::new(ErrorKind::Network, ErrorKind::Network.user_message())
            .details(details)
            .transient(),
        io::ErrorKind::NotFound => Error::new(ErrorKind::NotFound, ErrorKind::NotFound.user_message()).details(details),
        io::ErrorKind::PermissionDenied => {
            Error::new(ErrorKind::Authorization, ErrorKind::Authorization.user_message()).details(details)
        }
        io::ErrorKind::InvalidInput | io::ErrorKind::InvalidData => {
            Error::new(ErrorKind::Validation, ErrorKind::Validation.user_message()).details(details)
        }
        _ => Error::new(ErrorKind::Process, "A local resource could not be accessed")
            .code(codes::SYS_IO_FAILED)
            .details(details),
    }
}

fn from_reqwest(error: &reqwest::Error) -> Error {
    let details = error.to_string();
    if error.is_timeout() {
        return Error::new(ErrorKind::Network, "The upstream service did not respond in time")
            .code(codes::NET_REQUEST_TIMEOUT)
            .details(details)
            .transient();
    }
    if error.is_connect() {
        return Error::new(ErrorKind::Network, ErrorKind::Network.user_message())
            .details(details)
            .transient();
    }

    let Some(status) = error.status() else {
        return Error::new(ErrorKind::Network, ErrorKind::Network.user_message()).details(details);
    };

    let status_code = status.as_u16();
    let error = match status_code {
        401 => Error::new(ErrorKind::Authentication, "The upstream API rejected our credentials")
            .severity(Severity::Critical),
        403 => Error::new(ErrorKind::Authorization, ErrorKind::Authorization.user_message()),
        404 => Error::new(ErrorKind::NotFound, ErrorKind::NotFound.user_message()),
        429 => Error::new(
            ErrorKind::RateLimit(RateLimitFailure::Quota),
            "The upstream API is throttling requests",
        )
        .transient(),
        400..=499 => Error::new(ErrorKind::Validation, ErrorKind::Validation.user_message()),
        _ => Error::new(ErrorKind::Network, "The upstream service returned an error")
            .code(codes::NET_UPSTREAM_FAILED)
            .transient(),
    };
    error.details(details).data("upstream_status", status_code)
}

fn panic_text(payload: &(dyn Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fmt;

    #[derive(Debug)]
    struct Opaque(&'static str);

    impl fmt::Display for Opaque {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}", self.0)
        }
    }

    impl StdError for Opaque {}

    #[derive(Debug)]
    struct Exploding;

    impl fmt::Display for Exploding {
        fn fmt(&self, _f: &mut fmt::Formatter<'_>) -> fmt::Result {
            panic!("display blew up")
        }
    }

    impl StdError for Exploding {}

    #[derive(Debug)]
    struct Wrapper(io::Error);

    impl fmt::Display for Wrapper {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "while calling the image api")
        }
    }

    impl StdError for Wrapper {
        fn source(&self) -> Option<&(dyn StdError + 'static)> {
            Some(&self.0)
        }
    }

    #[test]
    fn test_unknown_error_is_unexpected_and_critical() {
        let err = classify(&Opaque("segfault in model runtime"), None);
        assert_eq!(err.kind(), ErrorKind::Unexpected);
        assert_eq!(err.error_code(), codes::UNEXPECTED);
        assert_eq!(err.severity_level(), Severity::Critical);
        assert_eq!(err.details_text(), Some("segfault in model runtime"));
    }

    #[test]
    fn test_fallback_kind_for_unknown_error() {
        let err = classify(&Opaque("no image"), Some(ErrorKind::ImageGeneration));
        assert_eq!(err.kind(), ErrorKind::ImageGeneration);
        assert_eq!(err.error_code(), codes::IMAGE_GENERATION_FAILED);
    }

    #[test]
    fn test_walks_source_chain() {
        let wrapped = Wrapper(io::Error::new(io::ErrorKind::TimedOut, "timed out"));
        let err = classify(&wrapped, None);
        assert_eq!(err.kind(), ErrorKind::Network);
        assert_eq!(err.error_code(), codes::NET_REQUEST_TIMEOUT);
        assert!(err.is_transient());
    }

    #[test]
    fn test_database_integrity_violation() {
        let db = DatabaseError::new(DatabaseFailure::Integrity, "UNIQUE constraint failed: users.email");
        let err = classify(&db, None);
        assert_eq!(err.kind(), ErrorKind::Database(DatabaseFailure::Integrity));
        assert_eq!(err.http_status(), 409);
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_our_error_passes_through_unchanged() {
        let original = Error::new(ErrorKind::Token, "expired").code("AUTH-TOKEN-EXP-001");
        let id = original.context().error_id();

        let boxed: BoxError = Box::new(original);
        let err = classify_boxed(boxed, Some(ErrorKind::Process));

        assert_eq!(err.kind(), ErrorKind::Token);
        assert_eq!(err.error_code(), "AUTH-TOKEN-EXP-001");
        assert_eq!(err.context().error_id(), id);
    }

    #[test]
    fn test_boxed_unknown_keeps_cause() {
        let boxed: BoxError = Box::new(Opaque("weird"));
        let err = classify_boxed(boxed, None);
        assert!(StdError::source(&err).is_some());
    }

    #[test]
    fn test_panicking_display_never_escapes() {
        let err = classify(&Exploding, None);
        assert_eq!(err.kind(), ErrorKind::Unexpected);
        assert_eq!(err.severity_level(), Severity::Critical);
        assert!(err.context().additional_data().contains_key("classification_failure"));
    }

    #[test]
    fn test_panic_payloads() {
        let err = classify_panic(Box::new("index out of bounds"));
        assert_eq!(err.details_text(), Some("index out of bounds"));

        let err = classify_panic(Box::new(42_u8));
        assert_eq!(err.kind(), ErrorKind::Unexpected);
        assert_eq!(err.details_text(), Some("non-string panic payload"));
    }

    #[test]
    fn test_anyhow_chain() {
        let err = anyhow::Error::new(io::Error::new(io::ErrorKind::ConnectionReset, "reset"))
            .context("fetching story outline");
        let classified = classify_anyhow(&err, None);
        assert_eq!(classified.kind(), ErrorKind::Network);

        let opaque = anyhow::anyhow!("something odd");
        assert_eq!(classify_anyhow(&opaque, None).kind(), ErrorKind::Unexpected);
    }

    #[test]
    fn test_json_error_is_validation() {
        let parse = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let err = classify(&parse, None);
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(err.error_code(), codes::VALIDATION_PAYLOAD_MALFORMED);
    }
}
