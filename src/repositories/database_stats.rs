// src/repositories/database_stats.rs
//
// Read-only reporting over the facade: size and row counts, per-client
// storage, and a health verdict combining SQLite's own checks with the pool.

use chrono::{DateTime, Utc};
use log::warn;
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use std::fs;

use crate::db::migrations::MIGRATIONS_TABLE;
use crate::db::pool::{HealthStatus, PoolHealth, PoolMetrics};
use crate::db::schema::CORE_TABLES;
use crate::error::AppResult;
use crate::repositories::database_manager::DatabaseManager;

#[derive(Debug, Clone, Serialize)]
pub struct DatabaseStats {
    pub database_path: String,
    pub file_size_bytes: u64,
    pub page_count: i64,
    pub page_size: i64,
    pub journal_mode: String,
    pub schema_version: i64,
    pub client_count: i64,
    pub file_count: i64,
    pub verified_file_count: i64,
    pub pooled: bool,
    pub pool: Option<PoolMetrics>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClientStorage {
    pub client_name: String,
    pub file_count: i64,
    pub total_bytes: i64,
    pub verified_count: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StorageStatistics {
    pub total_files: i64,
    pub total_bytes: i64,
    pub verified_files: i64,
    pub unverified_files: i64,
    /// Files whose size was never recorded (rows from before sizes existed)
    pub files_without_size: i64,
    pub clients: Vec<ClientStorage>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DatabaseHealth {
    pub status: HealthStatus,
    pub integrity_ok: bool,
    pub integrity_messages: Vec<String>,
    pub foreign_key_violations: usize,
    pub missing_tables: Vec<String>,
    pub pool: Option<PoolHealth>,
    pub warnings: Vec<String>,
    pub checked_at: DateTime<Utc>,
}

fn table_exists(conn: &Connection, table: &str) -> rusqlite::Result<bool> {
    conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
        [table],
        |row| row.get(0),
    )
}

fn schema_version(conn: &Connection) -> rusqlite::Result<i64> {
    if !table_exists(conn, MIGRATIONS_TABLE)? {
        return Ok(0);
    }
    let version: Option<i64> = conn
        .query_row("SELECT MAX(version) FROM database_migrations", [], |row| row.get(0))
        .optional()?
        .flatten();
    Ok(version.unwrap_or(0))
}

impl DatabaseManager {
    pub fn get_database_stats(&self) -> AppResult<DatabaseStats> {
        let file_size_bytes = fs::metadata(self.database_path())
            .map(|meta| meta.len())
            .unwrap_or(0);

        let mut stats = self.with_connection(|conn| {
            let page_count: i64 = conn.query_row("PRAGMA page_count", [], |row| row.get(0))?;
            let page_size: i64 = conn.query_row("PRAGMA page_size", [], |row| row.get(0))?;
            let journal_mode: String =
                conn.query_row("PRAGMA journal_mode", [], |row| row.get(0))?;
            let (client_count, file_count, verified_file_count) = conn.query_row(
                "SELECT (SELECT COUNT(*) FROM clients),
                        (SELECT COUNT(*) FROM files),
                        (SELECT COUNT(*) FROM files WHERE Verified)",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )?;

            Ok(DatabaseStats {
                database_path: self.database_path().display().to_string(),
                file_size_bytes,
                page_count,
                page_size,
                journal_mode,
                schema_version: schema_version(conn)?,
                client_count,
                file_count,
                verified_file_count,
                pooled: self.is_pooled(),
                pool: None,
            })
        })?;

        stats.pool = self.pool().map(|pool| pool.metrics());
        Ok(stats)
    }

    pub fn get_storage_statistics(&self) -> AppResult<StorageStatistics> {
        let clients = self.read(
            "SELECT c.Name,
                    COUNT(f.ID),
                    COALESCE(SUM(f.FileSize), 0),
                    COALESCE(SUM(CASE WHEN f.Verified THEN 1 ELSE 0 END), 0)
             FROM clients c
             LEFT JOIN files f ON f.ClientID = c.ID
             GROUP BY c.ID, c.Name
             ORDER BY c.Name",
            &[],
            |row| {
                Ok(ClientStorage {
                    client_name: row.get(0)?,
                    file_count: row.get(1)?,
                    total_bytes: row.get(2)?,
                    verified_count: row.get(3)?,
                })
            },
        )?;

        let totals = self.read_optional(
            "SELECT COUNT(*),
                    COALESCE(SUM(FileSize), 0),
                    COALESCE(SUM(CASE WHEN Verified THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN FileSize IS NULL THEN 1 ELSE 0 END), 0)
             FROM files",
            &[],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, i64>(3)?,
                ))
            },
        )?;
        let (total_files, total_bytes, verified_files, files_without_size) =
            totals.unwrap_or((0, 0, 0, 0));

        Ok(StorageStatistics {
            total_files,
            total_bytes,
            verified_files,
            unverified_files: total_files - verified_files,
            files_without_size,
            clients,
        })
    }

    /// Integrity check, foreign key check, core table presence and pool
    /// health. Store errors while checking are reported as a critical
    /// verdict, not returned.
    pub fn get_database_health(&self) -> DatabaseHealth {
        let mut health = DatabaseHealth {
            status: HealthStatus::Healthy,
            integrity_ok: false,
            integrity_messages: Vec::new(),
            foreign_key_violations: 0,
            missing_tables: Vec::new(),
            pool: self.pool().map(|pool| pool.health()),
            warnings: Vec::new(),
            checked_at: Utc::now(),
        };

        let checks = self.with_connection(|conn| {
            let mut stmt = conn.prepare("PRAGMA integrity_check")?;
            let messages = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;

            let mut stmt = conn.prepare("PRAGMA foreign_key_check")?;
            let fk_violations = stmt.query_map([], |_| Ok(()))?.count();

            let mut missing = Vec::new();
            for table in CORE_TABLES.iter().copied().chain([MIGRATIONS_TABLE]) {
                if !table_exists(conn, table)? {
                    missing.push(table.to_string());
                }
            }
            Ok((messages, fk_violations, missing))
        });

        match checks {
            Ok((messages, fk_violations, missing)) => {
                health.integrity_ok = messages.len() == 1 && messages[0] == "ok";
                if !health.integrity_ok {
                    health.integrity_messages = messages;
                }
                health.foreign_key_violations = fk_violations;
                health.missing_tables = missing;
            }
            Err(e) => {
                warn!("database health check failed: {}", e);
                health.warnings.push(format!("health check failed: {}", e));
                health.status = HealthStatus::Critical;
                return health;
            }
        }

        if !health.integrity_ok {
            health.warnings.push("integrity check reported problems".to_string());
            health.status = HealthStatus::Critical;
        }
        if !health.missing_tables.is_empty() {
            health
                .warnings
                .push(format!("missing tables: {}", health.missing_tables.join(", ")));
            health.status = HealthStatus::Critical;
        }
        if health.foreign_key_violations > 0 {
            health.warnings.push(format!(
                "{} rows violate foreign keys",
                health.foreign_key_violations
            ));
            if health.status == HealthStatus::Healthy {
                health.status = HealthStatus::Warning;
            }
        }
        if let Some(pool) = &health.pool {
            health.warnings.extend(pool.warnings.iter().cloned());
            health.status = match (health.status, pool.status) {
                (HealthStatus::Critical, _) | (_, HealthStatus::Critical) => HealthStatus::Critical,
                (HealthStatus::Warning, _) | (_, HealthStatus::Warning) => HealthStatus::Warning,
                _ => HealthStatus::Healthy,
            };
        }

        health
    }
}
