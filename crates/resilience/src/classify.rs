//! Classification of store failures into a retry-worthy taxonomy.
//!
//! # Two tiers
//!
//! 1. **SQLSTATE lookup.** When the driver reports a five-character code, it is looked up in a
//!    fixed table: exact codes first, then the two-character class.
//! 2. **Message fallback.** When no code is available (or the code is not in the table), the
//!    lowercased message is matched against an ordered list of known phrases. The first match
//!    wins; unmatched input is [`ErrorKind::Unknown`], which is never retried.
//!
//! A new driver only has to supply a message to be compatible; codes make
//! classification exact.
//!
//! Retryability is a property of the kind alone: [`is_retryable`] is
//! `classify(err).is_retryable()`. Every phrase that signals a transient
//! condition maps to a retryable kind in tier 2, so the two can never disagree.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::StorageError;

/// Closed classification of a store failure.
///
/// The declaration order is the taxonomy order: not-found and constraint
/// errors first, transient contention and connectivity errors next, then
/// configuration-level failures and the conservative `Unknown` default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The record does not exist.
    NotFound,
    /// Unique or exclusion constraint violation.
    AlreadyExists,
    /// Foreign-key violation.
    DependencyExists,
    /// Not-null, check, or data exception.
    Validation,
    /// The database detected a deadlock and aborted this transaction.
    Deadlock,
    /// Serialization failure under concurrent update.
    ConcurrencyConflict,
    /// A row or table lock could not be acquired in time.
    LockTimeout,
    /// The connection could not be established.
    ConnectionFailed,
    /// An established connection was closed.
    ConnectionClosed,
    /// The statement or call timed out.
    Timeout,
    /// Too many connections, out of memory, disk full.
    ResourceExhausted,
    /// Credentials or privileges were rejected.
    AuthenticationFailed,
    /// Invalid SQL or a missing table/column/function.
    SyntaxOrSchemaError,
    /// Anything not recognised.
    Unknown,
}

impl ErrorKind {
    /// All kinds, in taxonomy order.
    pub const ALL: [ErrorKind; 14] = [
        Self::NotFound,
        Self::AlreadyExists,
        Self::DependencyExists,
        Self::Validation,
        Self::Deadlock,
        Self::ConcurrencyConflict,
        Self::LockTimeout,
        Self::ConnectionFailed,
        Self::ConnectionClosed,
        Self::Timeout,
        Self::ResourceExhausted,
        Self::AuthenticationFailed,
        Self::SyntaxOrSchemaError,
        Self::Unknown,
    ];

    /// Returns `true` if a failure of this kind is transient.
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::Deadlock
                | Self::ConcurrencyConflict
                | Self::LockTimeout
                | Self::ConnectionFailed
                | Self::ConnectionClosed
                | Self::Timeout
                | Self::ResourceExhausted
        )
    }

    /// Stable snake_case label used in logs and stats.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::AlreadyExists => "already_exists",
            Self::DependencyExists => "dependency_exists",
            Self::Validation => "validation",
            Self::Deadlock => "deadlock",
            Self::ConcurrencyConflict => "concurrency_conflict",
            Self::LockTimeout => "lock_timeout",
            Self::ConnectionFailed => "connection_failed",
            Self::ConnectionClosed => "connection_closed",
            Self::Timeout => "timeout",
            Self::ResourceExhausted => "resource_exhausted",
            Self::AuthenticationFailed => "authentication_failed",
            Self::SyntaxOrSchemaError => "syntax_or_schema_error",
            Self::Unknown => "unknown",
        }
    }

    /// Index into [`ErrorKind::ALL`].
    pub(crate) const fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classifies a store failure.
///
/// Never panics; unrecognised input yields [`ErrorKind::Unknown`].
#[must_use]
pub fn classify(err: &StorageError) -> ErrorKind {
    match err {
        StorageError::NotFound { .. } => ErrorKind::NotFound,
        StorageError::Timeout => ErrorKind::Timeout,
        StorageError::Database(db) => db
            .code()
            .and_then(classify_sql_state)
            .unwrap_or_else(|| classify_message(db.message())),
        StorageError::Connection { message, .. } => match classify_message(message) {
            ErrorKind::ConnectionClosed => ErrorKind::ConnectionClosed,
            _ => ErrorKind::ConnectionFailed,
        },
        StorageError::Internal { message, .. } => classify_message(message),
    }
}

/// Returns `true` if the failure is transient and the operation may be retried.
#[must_use]
pub fn is_retryable(err: &StorageError) -> bool {
    classify(err).is_retryable()
}

/// Looks up a SQLSTATE code.
///
/// Returns `None` for codes outside the table so the caller can fall back to
/// the message.
#[must_use]
pub fn classify_sql_state(code: &str) -> Option<ErrorKind> {
    let code = code.trim();
    if code.len() != 5 || !code.is_ascii() {
        return None;
    }
    let code = code.to_ascii_uppercase();

    let exact = match code.as_str() {
        // Class 02 / PL/pgSQL: no data
        "02000" | "P0002" => Some(ErrorKind::NotFound),

        // Class 23: integrity constraint violation
        "23505" | "23P01" => Some(ErrorKind::AlreadyExists),
        "23503" => Some(ErrorKind::DependencyExists),
        "23502" | "23514" => Some(ErrorKind::Validation),

        // Class 40: transaction rollback
        "40001" => Some(ErrorKind::ConcurrencyConflict),
        "40P01" => Some(ErrorKind::Deadlock),

        // Class 55: object not in prerequisite state
        "55P03" => Some(ErrorKind::LockTimeout),

        // Class 57: operator intervention
        "57014" => Some(ErrorKind::Timeout),
        "57P01" | "57P02" => Some(ErrorKind::ConnectionClosed),
        "57P03" => Some(ErrorKind::ConnectionFailed),

        // Class 08: connection exception
        "08000" | "08001" | "08006" => Some(ErrorKind::ConnectionFailed),
        "08003" => Some(ErrorKind::ConnectionClosed),
        "08004" => Some(ErrorKind::AuthenticationFailed),

        // Class 28 and privilege errors
        "28000" | "28P01" | "42501" => Some(ErrorKind::AuthenticationFailed),

        // Class 53: insufficient resources
        "53000" | "53100" | "53200" | "53300" => Some(ErrorKind::ResourceExhausted),

        // Class 42: syntax error or access rule violation
        "42601" | "42703" | "42P01" | "42883" => Some(ErrorKind::SyntaxOrSchemaError),

        _ => None,
    };
    if exact.is_some() {
        return exact;
    }

    match code.get(..2)? {
        "22" | "23" => Some(ErrorKind::Validation),
        "08" => Some(ErrorKind::ConnectionFailed),
        "28" => Some(ErrorKind::AuthenticationFailed),
        "42" => Some(ErrorKind::SyntaxOrSchemaError),
        "53" => Some(ErrorKind::ResourceExhausted),
        _ => None,
    }
}

/// A phrase rule: every fragment must occur in the lowercased message.
struct Phrase {
    all: &'static [&'static str],
    kind: ErrorKind,
}

const fn phrase(all: &'static [&'static str], kind: ErrorKind) -> Phrase {
    Phrase { all, kind }
}

/// Ordered phrase table; first match wins.
///
/// Specific phrases precede generic ones ("lock timeout" before "timeout",
/// "relation ... does not exist" before "does not exist").
const PHRASES: &[Phrase] = &[
    // Constraint violations
    phrase(&["duplicate key"], ErrorKind::AlreadyExists),
    phrase(&["unique constraint"], ErrorKind::AlreadyExists),
    phrase(&["already exists"], ErrorKind::AlreadyExists),
    phrase(&["violates foreign key constraint"], ErrorKind::DependencyExists),
    phrase(&["is still referenced from table"], ErrorKind::DependencyExists),
    phrase(&["violates not-null constraint"], ErrorKind::Validation),
    phrase(&["null value in column"], ErrorKind::Validation),
    phrase(&["violates check constraint"], ErrorKind::Validation),
    phrase(&["new row for relation"], ErrorKind::Validation),
    phrase(&["invalid input syntax"], ErrorKind::Validation),
    phrase(&["value too long"], ErrorKind::Validation),
    phrase(&["out of range"], ErrorKind::Validation),
    // Contention
    phrase(&["deadlock"], ErrorKind::Deadlock),
    phrase(&["could not serialize"], ErrorKind::ConcurrencyConflict),
    phrase(&["serialization failure"], ErrorKind::ConcurrencyConflict),
    phrase(&["concurrent update"], ErrorKind::ConcurrencyConflict),
    phrase(&["lock timeout"], ErrorKind::LockTimeout),
    phrase(&["lock not available"], ErrorKind::LockTimeout),
    phrase(&["could not obtain lock"], ErrorKind::LockTimeout),
    // Resources
    phrase(&["too many connections"], ErrorKind::ResourceExhausted),
    phrase(&["out of memory"], ErrorKind::ResourceExhausted),
    phrase(&["disk full"], ErrorKind::ResourceExhausted),
    phrase(&["no space left"], ErrorKind::ResourceExhausted),
    phrase(&["insufficient"], ErrorKind::ResourceExhausted),
    // Connectivity
    phrase(&["connection refused"], ErrorKind::ConnectionFailed),
    phrase(&["connection reset"], ErrorKind::ConnectionFailed),
    phrase(&["no connection to the server"], ErrorKind::ConnectionFailed),
    phrase(&["could not connect"], ErrorKind::ConnectionFailed),
    phrase(&["broken pipe"], ErrorKind::ConnectionClosed),
    phrase(&["connection closed"], ErrorKind::ConnectionClosed),
    phrase(&["server closed the connection"], ErrorKind::ConnectionClosed),
    phrase(&["terminating connection"], ErrorKind::ConnectionClosed),
    // Timeouts
    phrase(&["statement timeout"], ErrorKind::Timeout),
    phrase(&["deadline exceeded"], ErrorKind::Timeout),
    phrase(&["timed out"], ErrorKind::Timeout),
    phrase(&["timeout"], ErrorKind::Timeout),
    // Authentication
    phrase(&["password authentication failed"], ErrorKind::AuthenticationFailed),
    phrase(&["authentication failed"], ErrorKind::AuthenticationFailed),
    phrase(&["permission denied"], ErrorKind::AuthenticationFailed),
    // Schema
    phrase(&["syntax error"], ErrorKind::SyntaxOrSchemaError),
    phrase(&["column", "does not exist"], ErrorKind::SyntaxOrSchemaError),
    phrase(&["relation", "does not exist"], ErrorKind::SyntaxOrSchemaError),
    phrase(&["function", "does not exist"], ErrorKind::SyntaxOrSchemaError),
    // Missing records
    phrase(&["record not found"], ErrorKind::NotFound),
    phrase(&["no rows"], ErrorKind::NotFound),
    phrase(&["does not exist"], ErrorKind::NotFound),
];

/// Classifies a free-text driver message.
#[must_use]
pub fn classify_message(message: &str) -> ErrorKind {
    let lower = message.to_lowercase();
    PHRASES
        .iter()
        .find(|p| p.all.iter().all(|fragment| lower.contains(fragment)))
        .map_or(ErrorKind::Unknown, |p| p.kind)
}
