//! Error types for datastore operations
//!
//! Everything below the [`Datastore`](crate::store::Datastore) boundary may
//! return the raw `Sql`/`Json` variants; public operations pass their errors
//! through [`DatastoreError::translate`] so callers only ever see the
//! taxonomy variants.

use thiserror::Error;

/// SQLSTATE codes the datastore reacts to
pub mod pg_code {
    pub const UNIQUE_VIOLATION: &str = "23505";
    pub const QUERY_CANCELED: &str = "57014";
    pub const UNDEFINED_OBJECT: &str = "42704";
    pub const SYNTAX_ERROR: &str = "42601";
    pub const PERMISSION_DENIED: &str = "42501";
    pub const DUPLICATE_TABLE: &str = "42P07";
    pub const DUPLICATE_ALIAS: &str = "42712";
    pub const UNDEFINED_TABLE: &str = "42P01";
    pub const DUPLICATE_OBJECT: &str = "42710";
    pub const DUPLICATE_FUNCTION: &str = "42723";
}

/// Errors that can occur during datastore operations
#[derive(Debug, Error)]
pub enum DatastoreError {
    #[error("Validation error on '{key}': {message}")]
    Validation {
        key: String,
        message: String,
        /// Index of the offending record, when the error came from a write
        row: Option<usize>,
    },

    #[error("Unique violation: {message}")]
    UniqueViolation { message: String, row: Option<usize> },

    #[error("Query took too long")]
    QueryTimeout,

    #[error("Malformed query: {0}")]
    MalformedQuery(String),

    #[error("Not authorized: {0}")]
    NotAuthorized(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Resource not found: {0}")]
    ResourceNotFound(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("SQL error: {0}")]
    Sql(#[from] sqlx::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl DatastoreError {
    pub fn validation(key: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            key: key.into(),
            message: msg.into(),
            row: None,
        }
    }

    pub fn validation_row(key: impl Into<String>, msg: impl Into<String>, row: usize) -> Self {
        Self::Validation {
            key: key.into(),
            message: msg.into(),
            row: Some(row),
        }
    }

    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedQuery(msg.into())
    }

    pub fn not_authorized(msg: impl Into<String>) -> Self {
        Self::NotAuthorized(msg.into())
    }

    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn database(msg: impl Into<String>) -> Self {
        Self::Database(msg.into())
    }

    /// The validation key, if this is a validation error
    pub fn key(&self) -> Option<&str> {
        match self {
            Self::Validation { key, .. } => Some(key),
            _ => None,
        }
    }

    /// The offending record index, when known
    pub fn row(&self) -> Option<usize> {
        match self {
            Self::Validation { row, .. } | Self::UniqueViolation { row, .. } => *row,
            _ => None,
        }
    }

    /// Rewrite engine-level errors into the public taxonomy.
    pub fn translate(self) -> Self {
        match self {
            Self::Sql(err) => Self::from_sql(err, None),
            Self::Json(err) => Self::Database(format!("invalid JSON from database: {}", err)),
            other => other,
        }
    }

    /// Translate a low-level SQL error, attaching a record index when known.
    pub fn from_sql(err: sqlx::Error, row: Option<usize>) -> Self {
        let message = summary(&err);
        match sql_state(&err).as_deref() {
            Some(pg_code::UNIQUE_VIOLATION) => Self::UniqueViolation {
                message: format!(
                    "Cannot insert records or create index because of uniqueness constraint: {}",
                    message
                ),
                row,
            },
            Some(pg_code::QUERY_CANCELED) => Self::QueryTimeout,
            Some(pg_code::SYNTAX_ERROR) => Self::MalformedQuery(message),
            Some(pg_code::PERMISSION_DENIED) => {
                Self::NotAuthorized("Not authorized to read resource.".to_string())
            }
            Some(pg_code::UNDEFINED_TABLE) => Self::ResourceNotFound(message),
            Some(code) if code.starts_with("22") => Self::Validation {
                key: "data".to_string(),
                message,
                row,
            },
            _ => Self::Database(message),
        }
    }

    /// Translate an error raised while writing record `row`.
    ///
    /// Unique violations and timeouts keep their own variants; anything else
    /// the engine rejects is reported against the record.
    pub fn from_record(err: sqlx::Error, row: usize) -> Self {
        match sql_state(&err).as_deref() {
            Some(pg_code::UNIQUE_VIOLATION) | Some(pg_code::QUERY_CANCELED) => {
                Self::from_sql(err, Some(row))
            }
            Some(_) => Self::validation_row("records", summary(&err), row),
            None => Self::from_sql(err, Some(row)),
        }
    }
}

/// SQLSTATE of a database error, if the error came from the server
pub fn sql_state(err: &sqlx::Error) -> Option<String> {
    err.as_database_error()
        .and_then(|db| db.code())
        .map(|code| code.into_owned())
}

/// First line of the server message, without the statement text
pub fn summary(err: &sqlx::Error) -> String {
    let message = match err.as_database_error() {
        Some(db) => db.message().to_string(),
        None => err.to_string(),
    };
    message.lines().next().unwrap_or_default().to_string()
}

pub type Result<T> = std::result::Result<T, DatastoreError>;

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::borrow::Cow;
    use std::fmt;

    #[derive(Debug)]
    pub(crate) struct FakeDbError {
        pub code: &'static str,
        pub message: &'static str,
    }

    impl fmt::Display for FakeDbError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(self.message)
        }
    }

    impl std::error::Error for FakeDbError {}

    impl sqlx::error::DatabaseError for FakeDbError {
        fn message(&self) -> &str {
            self.message
        }

        fn code(&self) -> Option<Cow<'_, str>> {
            Some(Cow::Borrowed(self.code))
        }

        fn as_error(&self) -> &(dyn std::error::Error + Send + Sync + 'static) {
            self
        }

        fn as_error_mut(&mut self) -> &mut (dyn std::error::Error + Send + Sync + 'static) {
            self
        }

        fn into_error(self: Box<Self>) -> Box<dyn std::error::Error + Send + Sync + 'static> {
            self
        }

        fn kind(&self) -> sqlx::error::ErrorKind {
            sqlx::error::ErrorKind::Other
        }
    }

    pub(crate) fn db_error(code: &'static str, message: &'static str) -> sqlx::Error {
        sqlx::Error::Database(Box::new(FakeDbError { code, message }))
    }

    #[test]
    fn test_unique_violation_keeps_row() {
        let err = DatastoreError::from_sql(db_error("23505", "duplicate key"), Some(3));
        assert!(matches!(err, DatastoreError::UniqueViolation { row: Some(3), .. }));
        assert_eq!(err.row(), Some(3));
    }

    #[test]
    fn test_query_canceled_is_timeout() {
        let err = DatastoreError::Sql(db_error("57014", "canceling statement")).translate();
        assert!(matches!(err, DatastoreError::QueryTimeout));
    }

    #[test]
    fn test_syntax_error_is_malformed() {
        let err = DatastoreError::Sql(db_error("42601", "syntax error at or near \"FORM\"")).translate();
        match err {
            DatastoreError::MalformedQuery(msg) => assert!(msg.contains("FORM")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_permission_denied_is_not_authorized() {
        let err = DatastoreError::Sql(db_error("42501", "permission denied")).translate();
        assert!(matches!(err, DatastoreError::NotAuthorized(_)));
    }

    #[test]
    fn test_data_exception_is_validation() {
        let err = DatastoreError::from_sql(
            db_error("22P02", "invalid input syntax for type integer: \"abc\""),
            Some(1),
        );
        assert_eq!(err.key(), Some("data"));
        assert_eq!(err.row(), Some(1));
    }

    #[test]
    fn test_record_error_reports_row() {
        let err = DatastoreError::from_record(db_error("42703", "column \"x\" does not exist"), 4);
        assert_eq!(err.key(), Some("records"));
        assert_eq!(err.row(), Some(4));
    }

    #[test]
    fn test_record_unique_violation_stays_unique() {
        let err = DatastoreError::from_record(db_error("23505", "duplicate key"), 0);
        assert!(matches!(err, DatastoreError::UniqueViolation { row: Some(0), .. }));
    }

    #[test]
    fn test_summary_takes_first_line() {
        let err = db_error("42601", "syntax error\nLINE 1: SELECT");
        assert_eq!(summary(&err), "syntax error");
    }

    #[test]
    fn test_translate_leaves_taxonomy_untouched() {
        let err = DatastoreError::validation("fields", "bad").translate();
        assert_eq!(err.key(), Some("fields"));
    }
}
