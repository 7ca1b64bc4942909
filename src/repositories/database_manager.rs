// src/repositories/database_manager.rs
//
// Query facade
//
// The single entry point worker threads use to run SQL. Each call borrows a
// connection (pooled, or direct when pooling is disabled), runs, and gives
// the connection back before returning. Callers never hold a connection
// across two calls.
//
// FAILURE POLICY:
// - Writes (commit = true) that fail are logged and reported as `None`/false.
//   The caller may retry.
// - Reads that expect rows and hit an operational fault escalate to
//   `AppError::FatalRead`. Startup must not continue on an empty result that
//   is really a database fault.

use log::{error, warn};
use rusqlite::types::Value;
use rusqlite::{Connection, Row, ToSql, Transaction};
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::config::DatabaseConfig;
use crate::db::catalog::{self, TableContent, TableName};
use crate::db::connection::{create_connection_manager, open_connection, ConnectionManager};
use crate::db::pool::{ConnectionPool, PooledConnection};
use crate::error::{AppError, AppResult, DbFault};

/// What the caller expects back from `execute`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fetch {
    /// Statement only; report affected rows
    None,
    /// First row, if any
    One,
    /// Every row
    All,
}

impl Fetch {
    fn expects_rows(self) -> bool {
        !matches!(self, Fetch::None)
    }
}

pub type SqlRow = Vec<Value>;

#[derive(Debug, Clone, PartialEq)]
pub enum QueryOutput {
    Affected(usize),
    Row(Option<SqlRow>),
    Rows(Vec<SqlRow>),
}

impl QueryOutput {
    pub fn affected(&self) -> Option<usize> {
        match self {
            QueryOutput::Affected(n) => Some(*n),
            _ => None,
        }
    }

    pub fn into_row(self) -> Option<SqlRow> {
        match self {
            QueryOutput::Row(row) => row,
            QueryOutput::Rows(rows) => rows.into_iter().next(),
            QueryOutput::Affected(_) => None,
        }
    }

    pub fn into_rows(self) -> Vec<SqlRow> {
        match self {
            QueryOutput::Rows(rows) => rows,
            QueryOutput::Row(row) => row.into_iter().collect(),
            QueryOutput::Affected(_) => Vec::new(),
        }
    }
}

/// A connection held for the duration of one facade call.
enum Lease {
    Pooled(PooledConnection),
    Direct(Connection),
}

impl Deref for Lease {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        match self {
            Lease::Pooled(conn) => &**conn,
            Lease::Direct(conn) => conn,
        }
    }
}

impl Lease {
    /// Return the connection, or close it if the call failed.
    fn finish(self, succeeded: bool) {
        match self {
            Lease::Pooled(conn) if succeeded => drop(conn),
            Lease::Pooled(conn) => conn.discard(),
            Lease::Direct(conn) => drop(conn),
        }
    }
}

/// Thread-safe facade over the pool. Share it as `Arc<DatabaseManager>`.
pub struct DatabaseManager {
    database_path: PathBuf,
    pool: Option<Arc<ConnectionPool>>,
    manager: Arc<ConnectionManager>,
    acquire_timeout: Duration,
}

impl DatabaseManager {
    /// Facade that opens a direct connection for every call.
    pub fn direct(config: &DatabaseConfig) -> Self {
        Self {
            database_path: config.database_path.clone(),
            manager: Arc::new(create_connection_manager(
                &config.database_path,
                config.pool.busy_timeout(),
            )),
            acquire_timeout: config.pool.acquire_timeout(),
            pool: None,
        }
    }

    /// Build from configuration, creating the pool when enabled.
    pub fn from_config(config: &DatabaseConfig) -> AppResult<Self> {
        if !config.pooling_enabled {
            return Ok(Self::direct(config));
        }
        let manager = Arc::new(create_connection_manager(
            &config.database_path,
            config.pool.busy_timeout(),
        ));
        let pool = Arc::new(ConnectionPool::new(Arc::clone(&manager), config.pool.clone())?);
        Ok(Self {
            database_path: config.database_path.clone(),
            manager,
            acquire_timeout: config.pool.acquire_timeout(),
            pool: Some(pool),
        })
    }

    pub fn database_path(&self) -> &Path {
        &self.database_path
    }

    pub fn pool(&self) -> Option<&Arc<ConnectionPool>> {
        self.pool.as_ref()
    }

    pub fn is_pooled(&self) -> bool {
        self.pool.is_some()
    }

    fn lease(&self) -> AppResult<Lease> {
        match &self.pool {
            Some(pool) => Ok(Lease::Pooled(pool.acquire(self.acquire_timeout)?)),
            None => Ok(Lease::Direct(open_connection(&self.manager)?)),
        }
    }

    // ------------------------------------------------------------------------
    // Generic contract
    // ------------------------------------------------------------------------

    /// Run one statement.
    ///
    /// Returns `Ok(Some(output))` on success, `Ok(None)` for a soft failure
    /// (any failed write, or a read failing for a non-operational reason) and
    /// `Err(AppError::FatalRead)` when a read expecting rows hits an
    /// operational fault.
    pub fn execute(
        &self,
        sql: &str,
        params: &[&dyn ToSql],
        commit: bool,
        fetch: Fetch,
    ) -> AppResult<Option<QueryOutput>> {
        let lease = match self.lease() {
            Ok(lease) => lease,
            Err(e) if commit => {
                warn!("write skipped, no connection available: {}", e);
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        let result = if commit {
            run_in_transaction(&lease, |tx| run_statement(tx, sql, params, fetch))
        } else {
            run_statement(&lease, sql, params, fetch)
        };

        match result {
            Ok(output) => {
                lease.finish(true);
                Ok(Some(output))
            }
            Err(e) => {
                lease.finish(false);
                self.soft_or_fatal(sql, e, commit, fetch.expects_rows())
                    .map(|()| None)
            }
        }
    }

    fn soft_or_fatal(
        &self,
        sql: &str,
        err: rusqlite::Error,
        commit: bool,
        expects_rows: bool,
    ) -> AppResult<()> {
        let fault = DbFault::of(&err);
        if !commit && expects_rows && fault == DbFault::Operational {
            error!("fatal read failure ({:?}): {} [{}]", fault, err, compact(sql));
            return Err(AppError::FatalRead {
                context: compact(sql),
                source: err,
            });
        }
        warn!(
            "{} failed ({:?}): {} [{}]",
            if commit { "write" } else { "query" },
            fault,
            err,
            compact(sql)
        );
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Typed helpers with the same policy
    // ------------------------------------------------------------------------

    /// Read every row through `map`.
    ///
    /// Operational faults become `FatalRead`; other failures (such as a row
    /// that cannot be decoded) are returned as `AppError::Database`, never as
    /// an empty list.
    pub fn read<T, F>(&self, sql: &str, params: &[&dyn ToSql], mut map: F) -> AppResult<Vec<T>>
    where
        F: FnMut(&Row<'_>) -> rusqlite::Result<T>,
    {
        self.with_read(sql, |conn| {
            let mut stmt = conn.prepare(sql)?;
            let rows = stmt
                .query_map(params, |row| map(row))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Read at most one row through `map`.
    pub fn read_optional<T, F>(&self, sql: &str, params: &[&dyn ToSql], map: F) -> AppResult<Option<T>>
    where
        F: FnOnce(&Row<'_>) -> rusqlite::Result<T>,
    {
        self.with_read(sql, |conn| {
            let mut stmt = conn.prepare(sql)?;
            let mut rows = stmt.query(params)?;
            match rows.next()? {
                Some(row) => Ok(Some(map(row)?)),
                None => Ok(None),
            }
        })
    }

    fn with_read<T, F>(&self, sql: &str, f: F) -> AppResult<T>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T>,
    {
        let lease = self.lease()?;
        match f(&lease) {
            Ok(value) => {
                lease.finish(true);
                Ok(value)
            }
            Err(e) => {
                lease.finish(false);
                if DbFault::of(&e) == DbFault::Operational {
                    error!("fatal read failure: {} [{}]", e, compact(sql));
                    Err(AppError::FatalRead {
                        context: compact(sql),
                        source: e,
                    })
                } else {
                    Err(AppError::Database(e))
                }
            }
        }
    }

    /// Committed write. Returns false (after logging) on failure.
    pub fn write(&self, sql: &str, params: &[&dyn ToSql]) -> bool {
        self.write_affected(sql, params).is_some()
    }

    /// Committed write returning the affected row count, `None` on failure.
    pub fn write_affected(&self, sql: &str, params: &[&dyn ToSql]) -> Option<usize> {
        match self.execute(sql, params, true, Fetch::None) {
            Ok(Some(output)) => output.affected(),
            Ok(None) => None,
            // Writes never escalate; this arm only guards the type.
            Err(e) => {
                warn!("write failed: {}", e);
                None
            }
        }
    }

    /// Several statements in one transaction, with write failure semantics.
    pub fn write_with<T, F>(&self, label: &str, f: F) -> Option<T>
    where
        F: FnOnce(&Transaction<'_>) -> rusqlite::Result<T>,
    {
        let lease = match self.lease() {
            Ok(lease) => lease,
            Err(e) => {
                warn!("{} skipped, no connection available: {}", label, e);
                return None;
            }
        };

        match run_in_transaction(&lease, f) {
            Ok(value) => {
                lease.finish(true);
                Some(value)
            }
            Err(e) => {
                lease.finish(false);
                warn!("{} failed ({:?}): {}", label, DbFault::of(&e), e);
                None
            }
        }
    }

    /// Run `f` on a borrowed connection. Errors propagate unchanged.
    pub fn with_connection<T, F>(&self, f: F) -> AppResult<T>
    where
        F: FnOnce(&Connection) -> AppResult<T>,
    {
        let lease = self.lease()?;
        let result = f(&lease);
        lease.finish(result.is_ok());
        result
    }

    // ------------------------------------------------------------------------
    // Catalog-validated browsing for administrative tooling
    // ------------------------------------------------------------------------

    pub fn get_table_names(&self) -> AppResult<Vec<String>> {
        self.with_read("sqlite_master", catalog::list_tables)
    }

    /// Columns and rows of `table`, with blob values hex-encoded.
    pub fn get_table_content(&self, table: &str) -> AppResult<TableContent> {
        self.with_connection(|conn| {
            let table = TableName::resolve(conn, table)?;
            catalog::read_table(conn, &table)
        })
    }

    /// Set `column` to `value` on rows where `key_column = key`.
    ///
    /// Identifier errors are returned; store failures follow the write policy
    /// and yield `Ok(false)`.
    pub fn update_row(
        &self,
        table: &str,
        key_column: &str,
        key: Value,
        column: &str,
        value: Value,
    ) -> AppResult<bool> {
        let (table, key_column, column) = self.with_connection(|conn| {
            let table = TableName::resolve(conn, table)?;
            let key_column = table.column(conn, key_column)?;
            let column = table.column(conn, column)?;
            Ok((table, key_column, column))
        })?;

        let label = format!("update of {}", table.as_str());
        Ok(self
            .write_with(&label, |tx| {
                catalog::update_row(tx, &table, &key_column, &key, &column, &value)
            })
            .is_some_and(|changed| changed > 0))
    }

    /// Delete rows where `key_column = key`. Same policy as `update_row`.
    pub fn delete_row(&self, table: &str, key_column: &str, key: Value) -> AppResult<bool> {
        let (table, key_column) = self.with_connection(|conn| {
            let table = TableName::resolve(conn, table)?;
            let key_column = table.column(conn, key_column)?;
            Ok((table, key_column))
        })?;

        let label = format!("delete from {}", table.as_str());
        Ok(self
            .write_with(&label, |tx| catalog::delete_row(tx, &table, &key_column, &key))
            .is_some_and(|deleted| deleted > 0))
    }

    /// Close the pool, if any. Later calls fail with `PoolClosed`.
    pub fn close(&self) {
        if let Some(pool) = &self.pool {
            pool.close_all();
        }
    }
}

fn run_in_transaction<T, F>(conn: &Connection, f: F) -> rusqlite::Result<T>
where
    F: FnOnce(&Transaction<'_>) -> rusqlite::Result<T>,
{
    let tx = conn.unchecked_transaction()?;
    let value = f(&tx)?;
    tx.commit()?;
    Ok(value)
}

fn run_statement(
    conn: &Connection,
    sql: &str,
    params: &[&dyn ToSql],
    fetch: Fetch,
) -> rusqlite::Result<QueryOutput> {
    let mut stmt = conn.prepare(sql)?;
    let width = stmt.column_count();
    let to_values = |row: &Row<'_>| -> rusqlite::Result<SqlRow> {
        (0..width).map(|i| row.get::<_, Value>(i)).collect()
    };

    match fetch {
        Fetch::None => {
            if width == 0 {
                Ok(QueryOutput::Affected(stmt.execute(params)?))
            } else {
                // Statements that return rows (e.g. PRAGMAs) are stepped through.
                let mut rows = stmt.query(params)?;
                while rows.next()?.is_some() {}
                Ok(QueryOutput::Affected(0))
            }
        }
        Fetch::One => {
            let mut rows = stmt.query(params)?;
            let first = match rows.next()? {
                Some(row) => Some(to_values(row)?),
                None => None,
            };
            Ok(QueryOutput::Row(first))
        }
        Fetch::All => {
            let rows = stmt
                .query_map(params, to_values)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(QueryOutput::Rows(rows))
        }
    }
}

/// Single-line form of a statement for log messages.
fn compact(sql: &str) -> String {
    sql.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use crate::db::schema::bootstrap_schema;
    use rusqlite::params;
    use tempfile::TempDir;

    fn config_for(dir: &TempDir, pooled: bool) -> DatabaseConfig {
        DatabaseConfig {
            database_path: dir.path().join("facade.db"),
            pooling_enabled: pooled,
            pool: PoolConfig {
                capacity: 2,
                acquire_timeout_ms: 100,
                monitor_enabled: false,
                ..PoolConfig::default()
            },
            ..DatabaseConfig::default()
        }
    }

    fn setup(pooled: bool) -> (TempDir, DatabaseManager) {
        let dir = tempfile::tempdir().unwrap();
        let config = config_for(&dir, pooled);
        let db = DatabaseManager::from_config(&config).unwrap();
        db.with_connection(|conn| bootstrap_schema(conn).map(|_| ())).unwrap();
        (dir, db)
    }

    fn insert_client(db: &DatabaseManager, id: u8, name: &str) -> bool {
        db.write(
            "INSERT INTO clients (ID, Name, LastSeen) VALUES (?1, ?2, '2024-01-01T00:00:00Z')",
            params![vec![id; 16], name],
        )
    }

    #[test]
    fn test_execute_fetch_modes() {
        for pooled in [true, false] {
            let (_dir, db) = setup(pooled);
            assert_eq!(db.is_pooled(), pooled);
            assert!(insert_client(&db, 1, "alice"));
            assert!(insert_client(&db, 2, "bob"));

            let all = db
                .execute("SELECT Name FROM clients ORDER BY Name", &[], false, Fetch::All)
                .unwrap()
                .unwrap()
                .into_rows();
            assert_eq!(
                all,
                vec![
                    vec![Value::Text("alice".to_string())],
                    vec![Value::Text("bob".to_string())],
                ]
            );

            let one = db
                .execute(
                    "SELECT Name FROM clients WHERE Name = ?1",
                    params!["bob"],
                    false,
                    Fetch::One,
                )
                .unwrap()
                .unwrap()
                .into_row();
            assert_eq!(one, Some(vec![Value::Text("bob".to_string())]));

            let none = db
                .execute("SELECT Name FROM clients WHERE Name = 'carol'", &[], false, Fetch::One)
                .unwrap()
                .unwrap();
            assert_eq!(none, QueryOutput::Row(None));
        }
    }

    #[test]
    fn test_failed_write_is_soft() {
        let (_dir, db) = setup(true);
        assert!(insert_client(&db, 1, "alice"));
        // Duplicate name: integrity fault.
        assert!(!insert_client(&db, 2, "alice"));
        // Missing table: operational fault, still soft for writes.
        let result = db
            .execute("INSERT INTO nowhere VALUES (1)", &[], true, Fetch::None)
            .unwrap();
        assert!(result.is_none());

        // Connections were closed, not leaked: the pool still serves calls.
        let metrics = db.pool().unwrap().metrics();
        assert_eq!(metrics.active_connections, 0);
        assert!(insert_client(&db, 3, "carol"));
    }

    #[test]
    fn test_failed_write_rolls_back() {
        let (_dir, db) = setup(true);
        let committed = db.write_with("two inserts", |tx| {
            tx.execute(
                "INSERT INTO clients (ID, Name, LastSeen) VALUES (x'01', 'dave', 'now')",
                [],
            )?;
            tx.execute("INSERT INTO nowhere VALUES (1)", [])?;
            Ok(())
        });
        assert!(committed.is_none());

        let count = db
            .read_optional("SELECT COUNT(*) FROM clients", &[], |row| row.get::<_, i64>(0))
            .unwrap();
        assert_eq!(count, Some(0));
    }

    #[test]
    fn test_operational_read_failure_is_fatal() {
        for pooled in [true, false] {
            let (_dir, db) = setup(pooled);
            let result = db.execute("SELECT * FROM missing_table", &[], false, Fetch::All);
            assert!(matches!(result, Err(AppError::FatalRead { .. })));

            let typed = db.read("SELECT ID FROM missing_table", &[], |row| row.get::<_, i64>(0));
            assert!(matches!(typed, Err(AppError::FatalRead { .. })));
        }
    }

    #[test]
    fn test_decode_failure_is_not_empty_result() {
        let (_dir, db) = setup(true);
        assert!(insert_client(&db, 1, "alice"));
        let result = db.read("SELECT Name FROM clients", &[], |row| row.get::<_, i64>(0));
        assert!(matches!(result, Err(AppError::Database(_))));
    }

    #[test]
    fn test_table_browsing_validates_identifiers() {
        let (_dir, db) = setup(true);
        assert!(insert_client(&db, 0xab, "alice"));

        let tables = db.get_table_names().unwrap();
        assert!(tables.contains(&"clients".to_string()));
        assert!(tables.contains(&"files".to_string()));

        let content = db.get_table_content("clients").unwrap();
        assert_eq!(content.columns[0], "ID");
        assert_eq!(content.rows[0][0], serde_json::json!("ab".repeat(16)));

        assert!(matches!(
            db.get_table_content("clients; DROP TABLE files"),
            Err(AppError::InvalidIdentifier(_))
        ));
        assert!(matches!(
            db.update_row("clients", "Name", Value::from("alice".to_string()), "Nope", Value::Null),
            Err(AppError::InvalidIdentifier(_))
        ));
    }

    #[test]
    fn test_update_and_delete_row() {
        let (_dir, db) = setup(true);
        assert!(insert_client(&db, 1, "alice"));

        let updated = db
            .update_row(
                "clients",
                "name",
                Value::Text("alice".to_string()),
                "LastSeen",
                Value::Text("2025-05-05T00:00:00Z".to_string()),
            )
            .unwrap();
        assert!(updated);

        // Unique constraint violation: soft failure.
        assert!(insert_client(&db, 2, "bob"));
        let clash = db
            .update_row(
                "clients",
                "Name",
                Value::Text("bob".to_string()),
                "Name",
                Value::Text("alice".to_string()),
            )
            .unwrap();
        assert!(!clash);

        assert!(db
            .delete_row("clients", "Name", Value::Text("alice".to_string()))
            .unwrap());
        assert!(!db
            .delete_row("clients", "Name", Value::Text("alice".to_string()))
            .unwrap());
    }

    #[test]
    fn test_closed_pool_reads_fail_and_writes_are_soft() {
        let (_dir, db) = setup(true);
        db.close();
        assert!(!insert_client(&db, 1, "alice"));
        assert!(matches!(db.get_table_names(), Err(AppError::PoolClosed)));
    }
}
