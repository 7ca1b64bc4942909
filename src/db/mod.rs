// src/db/mod.rs
//
// Database module
//
// Provides:
// - Connection factory and liveness check
// - Connection pooling with a background monitor
// - Idempotent schema bootstrap
// - Versioned schema migrations
// - Catalog-validated identifiers for dynamic table access

pub mod catalog;
pub mod connection;
pub mod migrations;
pub mod monitor;
pub mod pool;
pub mod schema;

pub use catalog::{ColumnInfo, ColumnName, TableContent, TableName};

pub use connection::{
    connection_is_alive, create_connection_manager, create_test_connection, open_connection,
    ConnectionManager,
};

pub use migrations::{
    check_migration_safety, validate_schema, Migration, MigrationEngine, MigrationError,
    MigrationRecord, MigrationReport, MigrationStatus, MIGRATIONS,
};

pub use monitor::{MonitorHandle, StopSignal};

pub use pool::{
    CleanupReport, ConnectionId, ConnectionInfo, ConnectionKind, ConnectionPool, HealthStatus,
    PoolHealth, PoolMetrics, PooledConnection,
};

pub use schema::{bootstrap_schema, missing_columns, BootstrapReport, ColumnUpgrade, CORE_TABLES};
