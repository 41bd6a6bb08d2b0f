//! Error types and result aliases.
//!
//! Three layers of errors flow through this crate:
//!
//! - [`StorageError`] - the raw failure a store driver hands back. This is the *input* to the
//!   [classifier](crate::classify). Drivers that speak SQL populate [`DatabaseError`] with the
//!   five-character SQLSTATE code; drivers that do not still supply a message.
//! - [`TxError`] - the single terminal outcome of a retried transaction. Callers see one of these,
//!   never the individual attempt failures.
//! - [`ConfigError`] - validation failures from the configuration builders.
//!
//! # Example
//!
//! ```
//! use monstera_resilience::{DatabaseError, ErrorKind, StorageError, classify};
//!
//! let err = StorageError::database(DatabaseError::new("40P01", "deadlock detected"));
//! assert_eq!(classify(&err), ErrorKind::Deadlock);
//! ```

use std::{sync::Arc, time::Duration};

use thiserror::Error;

use crate::classify::{ErrorKind, classify};

/// A shared error type for source chain tracking.
pub type BoxError = Arc<dyn std::error::Error + Send + Sync>;

/// Result type alias for store operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Result type alias for retried transactional operations.
pub type TxResult<T> = Result<T, TxError>;

/// Structured error reported by a relational database driver.
///
/// Mirrors the fields mainstream drivers expose: the SQLSTATE code, the
/// primary message, an optional detail line and the names of the constraint,
/// table and column involved.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DatabaseError {
    code: Option<String>,
    message: String,
    detail: Option<String>,
    constraint: Option<String>,
    table: Option<String>,
    column: Option<String>,
}

impl DatabaseError {
    /// Creates an error carrying a SQLSTATE code and message.
    #[must_use]
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self { code: Some(code.into()), message: message.into(), ..Self::default() }
    }

    /// Creates an error from a message alone, for drivers without structured codes.
    #[must_use]
    pub fn from_message(message: impl Into<String>) -> Self {
        Self { message: message.into(), ..Self::default() }
    }

    /// Attaches the driver's detail line.
    #[must_use]
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// Attaches the violated constraint name.
    #[must_use]
    pub fn with_constraint(mut self, constraint: impl Into<String>) -> Self {
        self.constraint = Some(constraint.into());
        self
    }

    /// Attaches the table name.
    #[must_use]
    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }

    /// Attaches the column name.
    #[must_use]
    pub fn with_column(mut self, column: impl Into<String>) -> Self {
        self.column = Some(column.into());
        self
    }

    /// Returns the SQLSTATE code, if the driver supplied one.
    #[must_use]
    pub fn code(&self) -> Option<&str> {
        self.code.as_deref()
    }

    /// Returns the primary message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Returns the detail line.
    #[must_use]
    pub fn detail(&self) -> Option<&str> {
        self.detail.as_deref()
    }

    /// Returns the violated constraint name.
    #[must_use]
    pub fn constraint(&self) -> Option<&str> {
        self.constraint.as_deref()
    }

    /// Returns the table name.
    #[must_use]
    pub fn table(&self) -> Option<&str> {
        self.table.as_deref()
    }

    /// Returns the column name.
    #[must_use]
    pub fn column(&self) -> Option<&str> {
        self.column.as_deref()
    }

    /// Extracts the offending value from a unique-violation detail line.
    ///
    /// PostgreSQL reports duplicates as `Key (email)=(a@example.com) already exists.`;
    /// this returns `a@example.com`. Returns `None` for any other code or
    /// when the detail does not have that shape.
    #[must_use]
    pub fn duplicate_key_value(&self) -> Option<&str> {
        if self.code() != Some("23505") {
            return None;
        }
        let detail = self.detail.as_deref()?;
        let start = detail.find("=(")? + 2;
        let len = detail[start..].find(')')?;
        Some(&detail[start..start + len])
    }
}

impl std::fmt::Display for DatabaseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.code {
            Some(code) => write!(f, "{} (SQLSTATE {code})", self.message),
            None => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for DatabaseError {}

/// Errors a store driver can hand back to this crate.
///
/// Errors preserve their source chain via the `#[source]` attribute, enabling
/// debugging tools to display the full error context.
///
/// # Non-exhaustive
///
/// New variants may be added in minor releases. Downstream match expressions
/// must include a wildcard arm.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum StorageError {
    /// The requested record or key does not exist.
    #[error("Not found: {key}")]
    NotFound {
        /// The key or identifier that was not found.
        key: String,
    },

    /// Structured relational database error.
    #[error("Database error: {0}")]
    Database(DatabaseError),

    /// Connection or network error.
    ///
    /// A failure to communicate with the store, such as connection refused,
    /// reset, or a closed pool.
    #[error("Connection error: {message}")]
    Connection {
        /// Description of the connection error.
        message: String,
        /// The underlying error that caused this connection failure.
        #[source]
        source: Option<BoxError>,
    },

    /// The store call exceeded its time limit.
    #[error("Operation timeout")]
    Timeout,

    /// Catch-all for driver errors that fit no other category.
    ///
    /// The message is still matched against known phrases by the classifier.
    #[error("Internal error: {message}")]
    Internal {
        /// Description of the internal error.
        message: String,
        /// The underlying error that caused this internal failure.
        #[source]
        source: Option<BoxError>,
    },
}

impl StorageError {
    /// Creates a new `NotFound` error for the given key.
    #[must_use]
    pub fn not_found(key: impl Into<String>) -> Self {
        Self::NotFound { key: key.into() }
    }

    /// Wraps a structured database error.
    #[must_use]
    pub fn database(error: DatabaseError) -> Self {
        Self::Database(error)
    }

    /// Shorthand for a database error with a SQLSTATE code.
    #[must_use]
    pub fn sql(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Database(DatabaseError::new(code, message))
    }

    /// Creates a new `Connection` error with the given message.
    #[must_use]
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection { message: message.into(), source: None }
    }

    /// Creates a new `Connection` error with a message and source error.
    #[must_use]
    pub fn connection_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Connection { message: message.into(), source: Some(Arc::new(source)) }
    }

    /// Creates a new `Timeout` error.
    #[must_use]
    pub fn timeout() -> Self {
        Self::Timeout
    }

    /// Creates a new `Internal` error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into(), source: None }
    }

    /// Creates a new `Internal` error with a message and source error.
    #[must_use]
    pub fn internal_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Internal { message: message.into(), source: Some(Arc::new(source)) }
    }

    /// Returns the SQLSTATE code when this is a structured database error.
    #[must_use]
    pub fn sql_state(&self) -> Option<&str> {
        match self {
            Self::Database(db) => db.code(),
            _ => None,
        }
    }

    /// Returns the human-readable message the classifier falls back to.
    #[must_use]
    pub fn message(&self) -> String {
        match self {
            Self::NotFound { key } => format!("not found: {key}"),
            Self::Database(db) => db.message().to_owned(),
            Self::Connection { message, .. } | Self::Internal { message, .. } => message.clone(),
            Self::Timeout => "operation timeout".to_owned(),
        }
    }

    /// Returns the structured database error, if any.
    #[must_use]
    pub fn as_database(&self) -> Option<&DatabaseError> {
        match self {
            Self::Database(db) => Some(db),
            _ => None,
        }
    }

    /// Classifies this error. See [`classify`](crate::classify::classify).
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        classify(self)
    }

    /// Returns `true` if retrying the operation may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }
}

/// Configuration validation error.
#[derive(Debug, Clone, PartialEq, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// A numeric field is below its minimum.
    #[error("{field} must be at least {min}, got {value}")]
    BelowMinimum {
        /// The offending field.
        field: &'static str,
        /// The minimum accepted value.
        min: String,
        /// The rejected value.
        value: String,
    },

    /// A numeric field is above its maximum.
    #[error("{field} must be at most {max}, got {value}")]
    AboveMaximum {
        /// The offending field.
        field: &'static str,
        /// The maximum accepted value.
        max: String,
        /// The rejected value.
        value: String,
    },

    /// A duration field must be non-zero.
    #[error("{field} must be positive, got {value}")]
    MustBePositive {
        /// The offending field.
        field: &'static str,
        /// The rejected value.
        value: String,
    },

    /// Two fields are inconsistent with each other.
    #[error("{field} ({value}) must not exceed {other} ({other_value})")]
    Inconsistent {
        /// The field that is out of range.
        field: &'static str,
        /// Its value.
        value: String,
        /// The field it is compared against.
        other: &'static str,
        /// That field's value.
        other_value: String,
    },
}

/// Terminal outcome of a retried transactional operation.
///
/// A caller either gets the operation's value or exactly one of these.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum TxError {
    /// The operation failed with a non-retryable error. The original store
    /// error is preserved unchanged as the source.
    #[error("{operation} failed ({kind}): {source}")]
    Failed {
        /// Name of the operation.
        operation: String,
        /// Classification of the failure.
        kind: ErrorKind,
        /// The store error.
        #[source]
        source: StorageError,
    },

    /// Every permitted attempt failed with a retryable error.
    #[error("{operation} exhausted retries after {attempts} attempts ({kind}): {source}")]
    RetriesExhausted {
        /// Name of the operation.
        operation: String,
        /// Total number of attempts made.
        attempts: u32,
        /// Classification of the last failure.
        kind: ErrorKind,
        /// The last underlying error.
        #[source]
        source: StorageError,
    },

    /// The caller's cancellation token fired.
    #[error("{operation} cancelled after {attempts} attempts")]
    Cancelled {
        /// Name of the operation.
        operation: String,
        /// Attempts started before cancellation was observed.
        attempts: u32,
    },

    /// The overall deadline for the operation elapsed.
    #[error(
        "{operation} timed out after {}ms ({attempts_completed} attempts completed{})",
        .limit.as_millis(),
        backoff_note(.during_backoff)
    )]
    Timeout {
        /// Name of the operation.
        operation: String,
        /// The deadline that elapsed.
        limit: Duration,
        /// Attempts that returned before the deadline.
        attempts_completed: u32,
        /// Whether the deadline hit while sleeping between attempts.
        during_backoff: bool,
    },

    /// A pool worker terminated without reporting a result for this slot.
    #[error("worker terminated before reporting a result for operation {index}")]
    WorkerLost {
        /// Position of the operation in the submitted batch.
        index: usize,
    },
}

fn backoff_note(during_backoff: &bool) -> &'static str {
    if *during_backoff { ", during retry backoff" } else { "" }
}

impl TxError {
    /// Returns the classification of the underlying store error, if there is one.
    #[must_use]
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Self::Failed { kind, .. } | Self::RetriesExhausted { kind, .. } => Some(*kind),
            Self::Timeout { .. } => Some(ErrorKind::Timeout),
            Self::Cancelled { .. } | Self::WorkerLost { .. } => None,
        }
    }

    /// Returns the underlying store error, if there is one.
    #[must_use]
    pub fn storage_error(&self) -> Option<&StorageError> {
        match self {
            Self::Failed { source, .. } | Self::RetriesExhausted { source, .. } => Some(source),
            _ => None,
        }
    }

    /// Returns `true` for [`TxError::Cancelled`].
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    /// Returns `true` for [`TxError::RetriesExhausted`].
    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        matches!(self, Self::RetriesExhausted { .. })
    }

    /// Returns `true` for [`TxError::Timeout`].
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error as _;

    use super::*;

    #[test]
    fn test_database_error_display_includes_code() {
        let err = DatabaseError::new("23505", "duplicate key value violates unique constraint");
        assert_eq!(
            err.to_string(),
            "duplicate key value violates unique constraint (SQLSTATE 23505)"
        );
        assert_eq!(DatabaseError::from_message("boom").to_string(), "boom");
    }

    #[test]
    fn test_duplicate_key_value_extraction() {
        let err = DatabaseError::new("23505", "duplicate key")
            .with_detail("Key (email)=(taro@duesk.co.jp) already exists.")
            .with_constraint("users_email_key")
            .with_table("users");

        assert_eq!(err.duplicate_key_value(), Some("taro@duesk.co.jp"));
        assert_eq!(err.constraint(), Some("users_email_key"));
        assert_eq!(err.table(), Some("users"));
        assert_eq!(err.column(), None);
    }

    #[test]
    fn test_duplicate_key_value_requires_unique_violation() {
        let err = DatabaseError::new("23503", "fk").with_detail("Key (id)=(1) is not present.");
        assert_eq!(err.duplicate_key_value(), None);

        let malformed = DatabaseError::new("23505", "dup").with_detail("no key here");
        assert_eq!(malformed.duplicate_key_value(), None);
    }

    #[test]
    fn test_storage_error_sql_state_and_message() {
        let err = StorageError::sql("40001", "could not serialize access");
        assert_eq!(err.sql_state(), Some("40001"));
        assert_eq!(err.message(), "could not serialize access");

        let conn = StorageError::connection("connection refused");
        assert_eq!(conn.sql_state(), None);
        assert_eq!(conn.message(), "connection refused");
    }

    #[test]
    fn test_connection_with_source_preserves_chain() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset by peer");
        let err = StorageError::connection_with_source("pool checkout failed", io);
        let source = err.source().map(ToString::to_string);
        assert_eq!(source.as_deref(), Some("reset by peer"));
    }

    #[test]
    fn test_tx_error_failed_preserves_source() {
        let source = StorageError::sql("23505", "duplicate key");
        let err = TxError::Failed {
            operation: "create_user".into(),
            kind: ErrorKind::AlreadyExists,
            source,
        };
        assert_eq!(err.kind(), Some(ErrorKind::AlreadyExists));
        assert_eq!(err.storage_error().and_then(StorageError::sql_state), Some("23505"));
        assert!(err.source().is_some());
        assert!(!err.is_exhausted());
    }

    #[test]
    fn test_tx_error_timeout_display() {
        let err = TxError::Timeout {
            operation: "bulk".into(),
            limit: Duration::from_millis(250),
            attempts_completed: 2,
            during_backoff: true,
        };
        assert_eq!(
            err.to_string(),
            "bulk timed out after 250ms (2 attempts completed, during retry backoff)"
        );
        assert_eq!(err.kind(), Some(ErrorKind::Timeout));
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::BelowMinimum {
            field: "multiplier",
            min: "1.0".into(),
            value: "0.5".into(),
        };
        assert_eq!(err.to_string(), "multiplier must be at least 1.0, got 0.5");
    }
}
