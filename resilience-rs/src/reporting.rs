//! # Error Reporting
//!
//! Alerting collaborators for critical failures and the error metrics the
//! facade records for every classified failure.

use std::collections::VecDeque;

use metrics::counter;
use parking_lot::RwLock;
use tokio::sync::mpsc;

use crate::types::{Error, ErrorKind, Severity};

/// Receives every critical failure the facade handles
pub trait AlertHook: Send + Sync {
    fn notify_critical(&self, error: &Error);
}

/// Drops alerts on the floor
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopAlertHook;

impl AlertHook for NoopAlertHook {
    fn notify_critical(&self, _error: &Error) {}
}

/// Forwards critical errors to a background consumer over a bounded channel
///
/// The hook never blocks the failing request: when the channel is full or
/// closed the alert is logged and discarded.
#[derive(Debug, Clone)]
pub struct ChannelAlertHook {
    sender: mpsc::Sender<Error>,
}

impl ChannelAlertHook {
    /// Creates the hook and the receiving end for the alert worker
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Error>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self { sender }, receiver)
    }
}

impl AlertHook for ChannelAlertHook {
    fn notify_critical(&self, error: &Error) {
        if let Err(e) = self.sender.try_send(error.clone()) {
            tracing::warn!(
                error_id = %error.context().error_id(),
                reason = %e,
                "Dropping critical alert"
            );
        }
    }
}

/// Keeps the most recent critical errors in memory for inspection
#[derive(Debug)]
pub struct InMemoryReporter {
    recent_errors: RwLock<VecDeque<Error>>,
    limit: usize,
}

impl InMemoryReporter {
    pub fn new(limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            recent_errors: RwLock::new(VecDeque::with_capacity(limit)),
            limit,
        }
    }

    /// Oldest first
    pub fn recent_errors(&self) -> Vec<Error> {
        self.recent_errors.read().iter().cloned().collect()
    }

    pub fn errors_by_kind(&self, kind: ErrorKind) -> Vec<Error> {
        self.recent_errors
            .read()
            .iter()
            .filter(|e| e.kind() == kind)
            .cloned()
            .collect()
    }

    pub fn errors_by_source(&self, source: &str) -> Vec<Error> {
        self.recent_errors
            .read()
            .iter()
            .filter(|e| e.context().source() == source)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.recent_errors.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.recent_errors.read().is_empty()
    }

    pub fn clear(&self) {
        self.recent_errors.write().clear();
    }
}

impl Default for InMemoryReporter {
    fn default() -> Self {
        Self::new(100)
    }
}

impl AlertHook for InMemoryReporter {
    fn notify_critical(&self, error: &Error) {
        let mut recent = self.recent_errors.write();
        if recent.len() >= self.limit {
            recent.pop_front();
        }
        recent.push_back(error.clone());
    }
}

/// Records metrics for an error
pub(crate) fn record_error_metrics(error: &Error) {
    counter!(
        "resilience_errors_total",
        1,
        "kind" => error.kind().to_string(),
        "code" => error.error_code().to_string(),
        "severity" => error.severity_level().to_string()
    );
    if error.severity_level() == Severity::Critical {
        counter!("resilience_critical_errors_total", 1, "source" => error.context().source().to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_memory_reporter_is_bounded() {
        let reporter = InMemoryReporter::new(2);

        for i in 0..3 {
            let err = Error::new(ErrorKind::Unexpected, format!("boom {}", i)).source_label("story.generate");
            reporter.notify_critical(&err);
        }

        let recent = reporter.recent_errors();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].message(), "boom 1");
        assert_eq!(recent[1].message(), "boom 2");
        assert_eq!(reporter.errors_by_source("story.generate").len(), 2);
        assert_eq!(reporter.errors_by_kind(ErrorKind::Network).len(), 0);
    }

    #[tokio::test]
    async fn test_channel_hook_delivers() {
        let (hook, mut rx) = ChannelAlertHook::new(4);
        let err = Error::new(ErrorKind::Database(crate::types::DatabaseFailure::Migration), "schema drift");

        hook.notify_critical(&err);

        let received = rx.recv().await.unwrap();
        assert_eq!(received.context().error_id(), err.context().error_id());
    }

    #[test]
    fn test_channel_hook_never_blocks_when_full() {
        let (hook, _rx) = ChannelAlertHook::new(1);
        let err = Error::new(ErrorKind::Unexpected, "first");

        hook.notify_critical(&err);
        hook.notify_critical(&err);
    }

    #[test]
    fn test_noop_hook() {
        NoopAlertHook.notify_critical(&Error::new(ErrorKind::Unexpected, "ignored"));
    }
}
