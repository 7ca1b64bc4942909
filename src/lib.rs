// src/lib.rs
// FileVault DB - storage layer of a multi-client file server
//
// Architecture:
// - Embedded SQLite, one database file per server
// - Bounded connection pool with emergency overflow and a health monitor
// - Query facade: soft write failures, fatal read failures
// - Additive schema bootstrap plus versioned, backed-up migrations

// ============================================================================
// FOUNDATION
// ============================================================================

pub mod config;
pub mod db;
pub mod domain;
pub mod error;
pub mod repositories;

// ============================================================================
// APPLICATION LAYER
// ============================================================================

pub mod application;

// ============================================================================
// PUBLIC API - Domain Records
// ============================================================================

pub use domain::{validate_client, validate_file, ClientRecord, DomainError, FileRecord};

// ============================================================================
// PUBLIC API - Error Types
// ============================================================================

pub use error::{AppError, AppResult, DbFault};

// ============================================================================
// PUBLIC API - Storage
// ============================================================================

pub use config::{DatabaseConfig, MigrationConfig, PoolConfig};

pub use db::{
    ConnectionPool, HealthStatus, MigrationEngine, MigrationError, MigrationReport, PoolHealth,
    PoolMetrics, PooledConnection,
};

pub use repositories::{
    ClientRepository, DatabaseManager, Fetch, FileRepository, QueryOutput,
    SqliteClientRepository, SqliteFileRepository,
};

pub use application::AppState;
