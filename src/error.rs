//! Application-wide error types.

use std::path::Path;

use thiserror::Error;

/// Application-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Application-wide error type.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Database error: {0}")]
    DatabaseSqlx(#[from] sqlx::Error),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid state transition: cannot transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Entity not found: {entity_type} with id {id}")]
    NotFound { entity_type: String, id: String },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("{0}")]
    Uniqueness(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("IO error while {op} ({path}): {source}")]
    IoPath {
        op: &'static str,
        path: String,
        source: std::io::Error,
    },

    #[error("Source adapter error: {0}")]
    Adapter(String),

    #[error("Download error: {0}")]
    Download(String),

    #[error("Image processing error: {0}")]
    Processing(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn not_found(entity_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity_type: entity_type.into(),
            id: id.into(),
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn adapter(msg: impl Into<String>) -> Self {
        Self::Adapter(msg.into())
    }

    pub fn io_path(op: &'static str, path: &Path, source: std::io::Error) -> Self {
        Self::IoPath {
            op,
            path: path.display().to_string(),
            source,
        }
    }

    /// Whether this error warrants a run-level retry.
    ///
    /// NotFound, validation and uniqueness failures are deterministic and
    /// retrying cannot fix them; network, IO and store hiccups can clear up.
    pub fn is_transient(&self) -> bool {
        !matches!(
            self,
            Self::NotFound { .. }
                | Self::Validation(_)
                | Self::Uniqueness(_)
                | Self::Configuration(_)
                | Self::InvalidStateTransition { .. }
        )
    }
}

/// SQLite extended result codes for unique-constraint violations.
const SQLITE_CONSTRAINT_UNIQUE: &str = "2067";
const SQLITE_CONSTRAINT_PRIMARYKEY: &str = "1555";

/// Check whether a sqlx error is a unique-constraint violation.
pub fn is_unique_violation(err: &sqlx::Error) -> bool {
    let sqlx::Error::Database(db_err) = err else {
        return false;
    };
    match db_err.code().as_deref() {
        Some(SQLITE_CONSTRAINT_UNIQUE) | Some(SQLITE_CONSTRAINT_PRIMARYKEY) => true,
        _ => db_err
            .message()
            .to_ascii_lowercase()
            .contains("unique constraint failed"),
    }
}

/// Map a sqlx error into the application error, translating unique-constraint
/// violations into a domain-specific message.
pub fn map_unique_violation(err: sqlx::Error, message: &str) -> Error {
    if is_unique_violation(&err) {
        Error::Uniqueness(message.to_string())
    } else {
        Error::DatabaseSqlx(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(!Error::not_found("Source", "abc").is_transient());
        assert!(!Error::validation("bad params").is_transient());
        assert!(!Error::Uniqueness("a source with this name already exists".into()).is_transient());
        assert!(Error::Download("connection reset".into()).is_transient());
        assert!(Error::Adapter("HTTP 503".into()).is_transient());
        assert!(Error::Database("disk I/O error".into()).is_transient());
    }
}
