//! # Error Context Handling
//!
//! The diagnostic envelope captured at the moment a failure is detected and
//! attached to every [`Error`](crate::types::Error).

use std::error::Error as StdError;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::classify::classify;
use crate::logging::current_correlation_id;
use crate::types::{ErrorKind, Result, Severity};

/// Immutable metadata describing one failure occurrence
///
/// There are no `&mut self` methods: the `with_*` methods consume the value
/// and are only used while the owning error is being built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorContext {
    timestamp: DateTime<Utc>,
    error_id: Uuid,
    source: String,
    severity: Severity,
    #[serde(skip_serializing_if = "Option::is_none")]
    user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    request_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    trace_id: Option<String>,
    #[serde(default)]
    additional_data: serde_json::Map<String, serde_json::Value>,
}

impl ErrorContext {
    /// Source recorded when the raiser did not name one
    pub const UNKNOWN_SOURCE: &'static str = "unknown";

    /// Captures a new context now, with a fresh error id
    ///
    /// The trace id defaults to the task's correlation id when one is set.
    pub fn new<S: Into<String>>(source: S, severity: Severity) -> Self {
        Self {
            timestamp: Utc::now(),
            error_id: Uuid::new_v4(),
            source: source.into(),
            severity,
            user_id: None,
            request_id: None,
            trace_id: current_correlation_id(),
            additional_data: serde_json::Map::new(),
        }
    }

    pub fn with_source<S: Into<String>>(mut self, source: S) -> Self {
        self.source = source.into();
        self
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn with_user_id<S: Into<String>>(mut self, user_id: S) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_request_id<S: Into<String>>(mut self, request_id: S) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn with_trace_id<S: Into<String>>(mut self, trace_id: S) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }

    /// Adds a key-value pair; values that fail to serialize are dropped
    pub fn with_data<K, V>(mut self, key: K, value: V) -> Self
    where
        K: Into<String>,
        V: Serialize,
    {
        if let Ok(value) = serde_json::to_value(value) {
            self.additional_data.insert(key.into(), value);
        }
        self
    }

    /// Sets identity fields that are still empty, never overwriting
    pub(crate) fn fill_missing(
        mut self,
        source: &str,
        user_id: Option<&str>,
        request_id: Option<&str>,
        trace_id: Option<&str>,
    ) -> Self {
        if self.source == Self::UNKNOWN_SOURCE {
            self.source = source.to_string();
        }
        if self.user_id.is_none() {
            self.user_id = user_id.map(str::to_string);
        }
        if self.request_id.is_none() {
            self.request_id = request_id.map(str::to_string);
        }
        if self.trace_id.is_none() {
            self.trace_id = trace_id.map(str::to_string);
        }
        self
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn error_id(&self) -> Uuid {
        self.error_id
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn severity(&self) -> Severity {
        self.severity
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    pub fn request_id(&self) -> Option<&str> {
        self.request_id.as_deref()
    }

    pub fn trace_id(&self) -> Option<&str> {
        self.trace_id.as_deref()
    }

    pub fn additional_data(&self) -> &serde_json::Map<String, serde_json::Value> {
        &self.additional_data
    }
}

/// A trait for classifying a foreign error result at the point it is handled
pub trait WithContext<T> {
    /// Classifies the error and records the dotted source of the failure
    fn with_source<S: Into<String>>(self, source: S) -> Result<T>;

    /// Classifies the error, falling back to `kind` for unrecognised errors
    fn or_kind<S: Into<String>>(self, kind: ErrorKind, source: S) -> Result<T>;
}

impl<T, E> WithContext<T> for std::result::Result<T, E>
where
    E: StdError + Send + Sync + 'static,
{
    fn with_source<S: Into<String>>(self, source: S) -> Result<T> {
        self.map_err(|error| classify(&error, None).source_label(source))
    }

    fn or_kind<S: Into<String>>(self, kind: ErrorKind, source: S) -> Result<T> {
        self.map_err(|error| classify(&error, Some(kind)).source_label(source))
    }
}
