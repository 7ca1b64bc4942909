// src/application/state.rs
//
// Startup wiring for the storage layer.
//
// ORDER:
// 1. Schema bootstrap on a dedicated connection
// 2. Versioned migrations (startup aborts on failure)
// 3. Pool (when enabled) and query facade
// 4. Repositories, then the initial client load (a fatal read)

use log::info;
use std::fs;
use std::sync::Arc;

use crate::config::DatabaseConfig;
use crate::db::connection::{create_connection_manager, open_connection};
use crate::db::migrations::{MigrationEngine, MigrationReport};
use crate::db::pool::ConnectionPool;
use crate::db::schema::{bootstrap_schema, BootstrapReport};
use crate::domain::ClientRecord;
use crate::error::AppResult;
use crate::repositories::{
    ClientRepository, DatabaseManager, FileRepository, SqliteClientRepository,
    SqliteFileRepository,
};

/// Storage services shared by the server's worker threads.
/// All fields are Arc-wrapped for thread-safe sharing.
pub struct AppState {
    pub config: DatabaseConfig,
    pub database: Arc<DatabaseManager>,
    pub clients: Arc<dyn ClientRepository>,
    pub files: Arc<dyn FileRepository>,
    pub bootstrap_report: BootstrapReport,
    pub migration_report: MigrationReport,
    /// Clients registered before this start
    pub known_clients: Vec<ClientRecord>,
}

impl AppState {
    pub fn initialize(config: DatabaseConfig) -> AppResult<Self> {
        config.validate()?;

        if let Some(parent) = config.database_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        // 1. SCHEMA
        let bootstrap_report = {
            let manager =
                create_connection_manager(&config.database_path, config.pool.busy_timeout());
            let conn = open_connection(&manager)?;
            bootstrap_schema(&conn)?
        };

        // 2. MIGRATIONS
        let migration_report = Self::engine_for(&config).migrate_to_latest()?;

        // 3. FACADE
        let database = Arc::new(DatabaseManager::from_config(&config)?);

        // 4. REPOSITORIES
        let clients: Arc<dyn ClientRepository> =
            Arc::new(SqliteClientRepository::new(Arc::clone(&database)));
        let files: Arc<dyn FileRepository> =
            Arc::new(SqliteFileRepository::new(Arc::clone(&database)));

        let known_clients = match clients.load_all() {
            Ok(known) => known,
            Err(e) => {
                database.close();
                return Err(e);
            }
        };

        info!(
            "storage ready at {} (schema v{}, {} clients, pooling {})",
            config.database_path.display(),
            migration_report.to_version,
            known_clients.len(),
            if database.is_pooled() { "on" } else { "off" }
        );

        Ok(Self {
            config,
            database,
            clients,
            files,
            bootstrap_report,
            migration_report,
            known_clients,
        })
    }

    fn engine_for(config: &DatabaseConfig) -> MigrationEngine {
        MigrationEngine::new(&config.database_path, config.pool.busy_timeout())
            .with_backup_keep_count(config.migrations.backup_keep_count)
    }

    /// Engine for administrative migration commands (status, history,
    /// rollback).
    pub fn migration_engine(&self) -> MigrationEngine {
        Self::engine_for(&self.config)
    }

    pub fn pool(&self) -> Option<&Arc<ConnectionPool>> {
        self.database.pool()
    }

    /// Close every pooled connection and stop the monitor. Idempotent.
    pub fn shutdown(&self) {
        info!("shutting down storage");
        self.database.close();
    }
}
