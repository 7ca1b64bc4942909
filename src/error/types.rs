// src/error/types.rs
use crate::db::migrations::MigrationError;
use crate::domain::DomainError;
use rusqlite::ffi::ErrorCode;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Connection pool is closed")]
    PoolClosed,

    /// A read that callers depend on could not be served. Startup paths must
    /// abort rather than continue with an empty view of the data.
    #[error("Fatal read failure ({context}): {source}")]
    FatalRead {
        context: String,
        #[source]
        source: rusqlite::Error,
    },

    #[error("Migration error: {0}")]
    Migration(#[from] MigrationError),

    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),

    #[error("Domain error: {0}")]
    Domain(#[from] DomainError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Other error: {0}")]
    Other(String),
}

impl Serialize for AppError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

pub type AppResult<T> = Result<T, AppError>;

/// Coarse classification of store failures.
///
/// Operational faults (locks, missing tables, unreadable files) are usually
/// transient or environmental; integrity faults are constraint violations
/// caused by the data itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DbFault {
    Operational,
    Integrity,
    Other,
}

impl DbFault {
    pub fn of(err: &rusqlite::Error) -> Self {
        match err {
            rusqlite::Error::SqliteFailure(failure, _) => match failure.code {
                ErrorCode::ConstraintViolation => DbFault::Integrity,
                ErrorCode::DatabaseBusy
                | ErrorCode::DatabaseLocked
                | ErrorCode::CannotOpen
                | ErrorCode::ReadOnly
                | ErrorCode::SystemIoFailure
                | ErrorCode::DiskFull
                | ErrorCode::DatabaseCorrupt
                | ErrorCode::NotADatabase
                | ErrorCode::PermissionDenied
                | ErrorCode::OperationAborted
                | ErrorCode::OperationInterrupted
                | ErrorCode::SchemaChanged
                | ErrorCode::FileLockingProtocolFailed
                // SQLITE_ERROR: "no such table", "no such column", syntax errors
                | ErrorCode::Unknown => DbFault::Operational,
                _ => DbFault::Other,
            },
            _ => DbFault::Other,
        }
    }
}

impl AppError {
    /// Fault class of the underlying store error, if there is one.
    pub fn db_fault(&self) -> Option<DbFault> {
        match self {
            AppError::Database(e) | AppError::FatalRead { source: e, .. } => Some(DbFault::of(e)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    #[test]
    fn test_missing_table_is_operational() {
        let conn = Connection::open_in_memory().unwrap();
        let err = conn
            .query_row("SELECT * FROM nowhere", [], |row| row.get::<_, i64>(0))
            .unwrap_err();
        assert_eq!(DbFault::of(&err), DbFault::Operational);
    }

    #[test]
    fn test_constraint_violation_is_integrity() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE t (id INTEGER PRIMARY KEY, name TEXT NOT NULL UNIQUE);")
            .unwrap();
        conn.execute("INSERT INTO t (name) VALUES ('a')", []).unwrap();
        let err = conn.execute("INSERT INTO t (name) VALUES ('a')", []).unwrap_err();
        assert_eq!(DbFault::of(&err), DbFault::Integrity);

        let app_err = AppError::from(err);
        assert_eq!(app_err.db_fault(), Some(DbFault::Integrity));
    }

    #[test]
    fn test_no_rows_is_other() {
        assert_eq!(DbFault::of(&rusqlite::Error::QueryReturnedNoRows), DbFault::Other);
        assert_eq!(AppError::PoolClosed.db_fault(), None);
    }
}
