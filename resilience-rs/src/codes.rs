//! # Error Codes
//!
//! Stable `DOMAIN-CATEGORY-SPECIFIC-NUMBER` codes used by clients for branching
//! and by dashboards for aggregation. Codes are part of the public contract:
//! never renumber an existing one, add a new code instead.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::types::{DatabaseFailure, ErrorKind, RateLimitFailure};

// Validation
pub const VALIDATION_INPUT_INVALID: &str = "VAL-INPUT-INV-001";
pub const VALIDATION_PAYLOAD_MALFORMED: &str = "VAL-PAYLOAD-MAL-001";

// Authentication, authorization, tokens and sessions
pub const AUTH_CREDENTIALS_INVALID: &str = "AUTH-CRED-INV-001";
pub const AUTHZ_ACCESS_DENIED: &str = "AUTHZ-ACCESS-DEN-001";
pub const TOKEN_INVALID: &str = "AUTH-TOKEN-INV-001";
pub const SESSION_EXPIRED: &str = "AUTH-SESS-EXP-001";

// Resources
pub const RESOURCE_NOT_FOUND: &str = "RES-LOOKUP-NF-001";

// Database
pub const DB_CONNECTION_FAILED: &str = "DB-CONN-FAIL-001";
pub const DB_TRANSACTION_FAILED: &str = "DB-TXN-FAIL-001";
pub const DB_MIGRATION_FAILED: &str = "DB-MIG-FAIL-001";
pub const DB_INTEGRITY_VIOLATION: &str = "DB-INTEG-DUP-001";

// Network and upstream APIs
pub const NET_CONNECTION_FAILED: &str = "NET-CONN-FAIL-001";
pub const NET_REQUEST_TIMEOUT: &str = "NET-CONN-TMO-001";
pub const NET_UPSTREAM_FAILED: &str = "NET-HTTP-UPS-001";
pub const NET_CIRCUIT_OPEN: &str = "NET-CIRC-OPEN-001";

// Rate limiting
pub const RATE_QUOTA_EXCEEDED: &str = "RATE-QUOTA-EXC-001";
pub const RATE_CONCURRENCY_EXCEEDED: &str = "RATE-CONC-EXC-001";
pub const RATE_BURST_EXCEEDED: &str = "RATE-BURST-EXC-001";
pub const RATE_COST_EXCEEDED: &str = "RATE-COST-EXC-001";

// Configuration
pub const CFG_VALUE_INVALID: &str = "CFG-VALUE-INV-001";
pub const CFG_LIMIT_UNKNOWN: &str = "CFG-LIMIT-UNK-001";
pub const CFG_LIMIT_MISMATCH: &str = "CFG-LIMIT-DIM-001";
pub const CFG_LOGGING_INIT: &str = "CFG-LOG-INIT-001";

// Generation
pub const IMAGE_GENERATION_FAILED: &str = "GEN-IMAGE-FAIL-001";
pub const STORY_GENERATION_FAILED: &str = "GEN-STORY-FAIL-001";

// System
pub const PROCESS_FAILED: &str = "SYS-PROC-FAIL-001";
pub const SYS_IO_FAILED: &str = "SYS-IO-FAIL-001";
pub const TIMEOUT: &str = "SYS-TIMEOUT-001";
pub const CANCELLED: &str = "SYS-CANCEL-001";
pub const UNEXPECTED: &str = "SYS-UNEXPECTED-001";

static CODE_FORMAT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Z]+(-[A-Z]+){1,3}-\d{3}$").expect("code pattern is valid"));

/// Returns true if `code` follows the `DOMAIN-CATEGORY-SPECIFIC-NUMBER` layout
pub fn is_well_formed(code: &str) -> bool {
    CODE_FORMAT.is_match(code)
}

/// The code used when an error of `kind` is raised without an explicit one
pub fn default_code(kind: &ErrorKind) -> &'static str {
    match kind {
        ErrorKind::Validation => VALIDATION_INPUT_INVALID,
        ErrorKind::Authentication => AUTH_CREDENTIALS_INVALID,
        ErrorKind::Authorization => AUTHZ_ACCESS_DENIED,
        ErrorKind::NotFound => RESOURCE_NOT_FOUND,
        ErrorKind::Database(DatabaseFailure::Connection) => DB_CONNECTION_FAILED,
        ErrorKind::Database(DatabaseFailure::Transaction) => DB_TRANSACTION_FAILED,
        ErrorKind::Database(DatabaseFailure::Migration) => DB_MIGRATION_FAILED,
        ErrorKind::Database(DatabaseFailure::Integrity) => DB_INTEGRITY_VIOLATION,
        ErrorKind::Network => NET_CONNECTION_FAILED,
        ErrorKind::RateLimit(RateLimitFailure::Quota) => RATE_QUOTA_EXCEEDED,
        ErrorKind::RateLimit(RateLimitFailure::Concurrency) => RATE_CONCURRENCY_EXCEEDED,
        ErrorKind::RateLimit(RateLimitFailure::Burst) => RATE_BURST_EXCEEDED,
        ErrorKind::RateLimit(RateLimitFailure::Cost) => RATE_COST_EXCEEDED,
        ErrorKind::CircuitOpen => NET_CIRCUIT_OPEN,
        ErrorKind::Configuration => CFG_VALUE_INVALID,
        ErrorKind::ImageGeneration => IMAGE_GENERATION_FAILED,
        ErrorKind::StoryGeneration => STORY_GENERATION_FAILED,
        ErrorKind::Token => TOKEN_INVALID,
        ErrorKind::Session => SESSION_EXPIRED,
        ErrorKind::Process => PROCESS_FAILED,
        ErrorKind::Timeout => TIMEOUT,
        ErrorKind::Cancelled => CANCELLED,
        ErrorKind::Unexpected => UNEXPECTED,
    }
}

/// Maps a code (falling back to its kind) to an HTTP status
pub fn http_status(code: &str, kind: &ErrorKind) -> u16 {
    match code {
        VALIDATION_INPUT_INVALID | VALIDATION_PAYLOAD_MALFORMED => 400,
        AUTH_CREDENTIALS_INVALID | TOKEN_INVALID | SESSION_EXPIRED => 401,
        AUTHZ_ACCESS_DENIED => 403,
        RESOURCE_NOT_FOUND => 404,
        DB_INTEGRITY_VIOLATION => 409,
        RATE_QUOTA_EXCEEDED | RATE_CONCURRENCY_EXCEEDED | RATE_BURST_EXCEEDED
        | RATE_COST_EXCEEDED => 429,
        CANCELLED => 499,
        NET_CONNECTION_FAILED | NET_UPSTREAM_FAILED | IMAGE_GENERATION_FAILED
        | STORY_GENERATION_FAILED => 502,
        DB_CONNECTION_FAILED | NET_CIRCUIT_OPEN => 503,
        NET_REQUEST_TIMEOUT | TIMEOUT => 504,
        _ => kind_status(kind),
    }
}

fn kind_status(kind: &ErrorKind) -> u16 {
    match kind {
        ErrorKind::Validation => 400,
        ErrorKind::Authentication | ErrorKind::Token | ErrorKind::Session => 401,
        ErrorKind::Authorization => 403,
        ErrorKind::NotFound => 404,
        ErrorKind::Database(DatabaseFailure::Integrity) => 409,
        ErrorKind::RateLimit(_) => 429,
        ErrorKind::Cancelled => 499,
        ErrorKind::Network | ErrorKind::ImageGeneration | ErrorKind::StoryGeneration => 502,
        ErrorKind::CircuitOpen | ErrorKind::Database(DatabaseFailure::Connection) => 503,
        ErrorKind::Timeout => 504,
        _ => 500,
    }
}

/// Default remediation hints shown to end users when the raiser gave none
pub fn default_suggestions(kind: &ErrorKind) -> &'static [&'static str] {
    match kind {
        ErrorKind::Validation => &["Check the submitted fields and try again"],
        ErrorKind::Authentication | ErrorKind::Token | ErrorKind::Session => {
            &["Sign in again to refresh your session"]
        }
        ErrorKind::Authorization => &["Ask an administrator for access to this resource"],
        ErrorKind::NotFound => &["Check that the link or identifier is correct"],
        ErrorKind::Database(DatabaseFailure::Integrity) => &["This item already exists"],
        ErrorKind::Database(_) => &["Please try again in a few moments"],
        ErrorKind::Network | ErrorKind::Timeout => &["Check your connection and try again"],
        ErrorKind::RateLimit(_) => &["Wait until the limit resets before trying again"],
        ErrorKind::CircuitOpen => &["The service is recovering, please retry later"],
        ErrorKind::ImageGeneration => &["Try a simpler illustration prompt", "Retry in a minute"],
        ErrorKind::StoryGeneration => &["Try a shorter story prompt", "Retry in a minute"],
        ErrorKind::Configuration | ErrorKind::Process | ErrorKind::Unexpected => {
            &["Contact support and quote the error id"]
        }
        ErrorKind::Cancelled => &[],
    }
}
