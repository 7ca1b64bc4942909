// src/db/connection.rs
//
// Database connection factory
//
// PRINCIPLES:
// - One place decides how a connection is opened
// - Pooled, direct and migration connections get identical pragmas
// - Clear error propagation

use r2d2::ManageConnection;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;
use std::path::Path;
use std::time::Duration;

use crate::error::{AppError, AppResult};

/// Opens connections to one database file.
///
/// Only the `ManageConnection` half of r2d2 is used: pooling itself is done by
/// [`crate::db::ConnectionPool`].
pub type ConnectionManager = SqliteConnectionManager;

/// Build the connection factory for a database file.
///
/// Every connection it opens has:
/// - Foreign keys enabled (required for client -> files cascade)
/// - WAL journal mode for concurrent readers
/// - A busy timeout so lock contention waits instead of failing immediately
pub fn create_connection_manager(db_path: &Path, busy_timeout: Duration) -> ConnectionManager {
    SqliteConnectionManager::file(db_path).with_init(move |conn| {
        conn.busy_timeout(busy_timeout)?;
        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
             PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;",
        )?;
        Ok(())
    })
}

/// Open a new, unpooled connection through the factory.
pub fn open_connection(manager: &ConnectionManager) -> AppResult<Connection> {
    manager.connect().map_err(AppError::Database)
}

/// Liveness check.
///
/// A connection only passes when a trivial query succeeds and it is not
/// sitting inside a transaction somebody forgot to finish.
pub fn connection_is_alive(conn: &Connection) -> bool {
    if !conn.is_autocommit() {
        return false;
    }
    conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
        .map(|one| one == 1)
        .unwrap_or(false)
}

/// Create a standalone connection (for testing)
///
/// This creates an in-memory database, useful for unit tests that only
/// need a schema and not a pool.
pub fn create_test_connection() -> AppResult<Connection> {
    let conn = Connection::open_in_memory().map_err(AppError::Database)?;

    conn.execute_batch("PRAGMA foreign_keys = ON;")
        .map_err(AppError::Database)?;

    Ok(conn)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manager_applies_pragmas() {
        let dir = tempfile::tempdir().unwrap();
        let manager = create_connection_manager(&dir.path().join("t.db"), Duration::from_millis(250));
        let conn = open_connection(&manager).unwrap();

        let fk_enabled: i32 = conn
            .query_row("PRAGMA foreign_keys", [], |row| row.get(0))
            .unwrap();
        assert_eq!(fk_enabled, 1);

        let journal: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap();
        assert_eq!(journal.to_lowercase(), "wal");
    }

    #[test]
    fn test_liveness_check_accepts_healthy_connection() {
        let conn = create_test_connection().unwrap();
        assert!(connection_is_alive(&conn));
    }

    #[test]
    fn test_liveness_check_rejects_open_transaction() {
        let conn = create_test_connection().unwrap();
        conn.execute_batch("BEGIN;").unwrap();
        assert!(!connection_is_alive(&conn));

        conn.execute_batch("ROLLBACK;").unwrap();
        assert!(connection_is_alive(&conn));
    }

    #[test]
    fn test_test_connection() {
        let conn = create_test_connection().unwrap();

        let result: i32 = conn
            .query_row("SELECT 1 + 1", [], |row| row.get(0))
            .unwrap();
        assert_eq!(result, 2);

        let fk_enabled: i32 = conn
            .query_row("PRAGMA foreign_keys", [], |row| row.get(0))
            .unwrap();
        assert_eq!(fk_enabled, 1);
    }
}
