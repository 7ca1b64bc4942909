// src/db/migrations.rs
//
// Versioned schema migrations
//
// PRINCIPLES:
// - Versions are strictly increasing and define application order
// - Backup before anything is applied
// - One migration = one transaction; the run stops at the first failure
// - Rollback SQL is recorded, never executed automatically
// - Migrations run on a dedicated, unpooled connection

use chrono::{NaiveDateTime, Utc};
use log::{debug, error, info, warn};
use r2d2::ManageConnection;
use regex::Regex;
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;
use thiserror::Error;

use crate::db::connection::{create_connection_manager, ConnectionManager};
use crate::db::schema::{table_exists, CORE_TABLES};

pub const MIGRATIONS_TABLE: &str = "database_migrations";

const BACKUP_STAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

/// An immutable schema change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Migration {
    pub version: i64,
    pub description: &'static str,
    pub up_sql: &'static str,
    /// Stored with the record for manual recovery
    pub rollback_sql: Option<&'static str>,
}

/// All migrations in order.
/// Add new migrations to the end of this list.
pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "Index files by owning client",
        up_sql: "CREATE INDEX IF NOT EXISTS idx_files_client_id ON files(ClientID);",
        rollback_sql: Some("DROP INDEX IF EXISTS idx_files_client_id;"),
    },
    Migration {
        version: 2,
        description: "Index client activity and file verification state",
        up_sql: "CREATE INDEX IF NOT EXISTS idx_clients_last_seen ON clients(LastSeen);
                 CREATE INDEX IF NOT EXISTS idx_files_verified ON files(Verified);",
        rollback_sql: Some(
            "DROP INDEX IF EXISTS idx_clients_last_seen;
             DROP INDEX IF EXISTS idx_files_verified;",
        ),
    },
    Migration {
        version: 3,
        description: "Per-client storage summary view",
        up_sql: "CREATE VIEW IF NOT EXISTS client_storage_summary AS
                 SELECT c.ID AS ClientID,
                        c.Name AS ClientName,
                        COUNT(f.ID) AS FileCount,
                        COALESCE(SUM(f.FileSize), 0) AS TotalBytes,
                        COALESCE(SUM(CASE WHEN f.Verified THEN 1 ELSE 0 END), 0) AS VerifiedCount
                 FROM clients c
                 LEFT JOIN files f ON f.ClientID = c.ID
                 GROUP BY c.ID, c.Name;",
        rollback_sql: Some("DROP VIEW IF EXISTS client_storage_summary;"),
    },
];

/// Persisted row of `database_migrations`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationRecord {
    pub version: i64,
    pub description: String,
    pub applied_at: String,
    pub rollback_sql: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MigrationStatus {
    pub current_version: i64,
    pub latest_version: i64,
    pub pending_count: usize,
    pub total_migrations: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationReport {
    pub from_version: i64,
    pub to_version: i64,
    pub applied: Vec<i64>,
    pub backup_path: Option<PathBuf>,
}

/// Migration errors.
#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("Failed to create backup at {}: {message}", .path.display())]
    BackupFailed { path: PathBuf, message: String },

    #[error("Migration {version} rejected: forward SQL contains destructive statement '{pattern}'")]
    UnsafeMigration { version: i64, pattern: String },

    #[error("Migration {version} failed: {message}. Backup at: {}", .backup_path.display())]
    MigrationFailed {
        version: i64,
        message: String,
        backup_path: PathBuf,
    },

    #[error("Post-migration validation failed: {details}. Backup at: {}", .backup_path.display())]
    ValidationFailed { details: String, backup_path: PathBuf },

    #[error("Invalid migration set: {0}")]
    InvalidDefinition(String),

    #[error("Nothing to roll back: {0}")]
    NothingToRollback(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn destructive_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r#"(?i)\bDROP\s+TABLE\b|\bDELETE\s+FROM\s+(?:["'`\[]?\w+["'`\]]?\s*\.\s*)?["'`\[]?(clients|files)\b"#,
        )
            .expect("destructive statement pattern is valid")
    })
}

/// Refuse forward SQL that drops tables or bulk-deletes core data.
///
/// A last-resort net: it does not replace reviewing migrations.
pub fn check_migration_safety(migration: &Migration) -> Result<(), MigrationError> {
    match destructive_pattern().find(migration.up_sql) {
        Some(found) => Err(MigrationError::UnsafeMigration {
            version: migration.version,
            pattern: found.as_str().to_string(),
        }),
        None => Ok(()),
    }
}

fn ensure_migrations_table(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS database_migrations (
            version INTEGER PRIMARY KEY,
            description TEXT NOT NULL,
            applied_at TEXT NOT NULL,
            rollback_sql TEXT
        );",
    )
}

/// Highest applied version, 0 for a database with no migrations.
///
/// Read-only: a missing migrations table counts as version 0.
pub fn current_version(conn: &Connection) -> rusqlite::Result<i64> {
    if !table_exists(conn, MIGRATIONS_TABLE)? {
        return Ok(0);
    }
    let version: Option<i64> = conn.query_row(
        "SELECT MAX(version) FROM database_migrations",
        [],
        |row| row.get(0),
    )?;
    Ok(version.unwrap_or(0))
}

/// Run SQLite's integrity check and confirm the core tables exist.
pub fn validate_schema(conn: &Connection) -> Result<(), String> {
    let integrity: String = conn
        .query_row("PRAGMA integrity_check", [], |row| row.get(0))
        .map_err(|e| format!("integrity check could not run: {}", e))?;
    if integrity != "ok" {
        return Err(format!("integrity check reported: {}", integrity));
    }

    for table in CORE_TABLES.iter().copied().chain([MIGRATIONS_TABLE]) {
        let exists =
            table_exists(conn, table).map_err(|e| format!("catalog lookup failed: {}", e))?;
        if !exists {
            return Err(format!("required table '{}' is missing", table));
        }
    }
    Ok(())
}

/// Applies versioned migrations to one database file.
pub struct MigrationEngine {
    db_path: PathBuf,
    manager: ConnectionManager,
    migrations: Vec<Migration>,
    backup_keep_count: Option<usize>,
}

impl MigrationEngine {
    /// Engine for `db_path` with the built-in migration list.
    pub fn new(db_path: &Path, busy_timeout: Duration) -> Self {
        Self {
            db_path: db_path.to_path_buf(),
            manager: create_connection_manager(db_path, busy_timeout),
            migrations: MIGRATIONS.to_vec(),
            backup_keep_count: None,
        }
    }

    /// Replace the migration list. Versions must be positive and strictly
    /// increasing.
    pub fn with_migrations(mut self, migrations: Vec<Migration>) -> Result<Self, MigrationError> {
        let mut previous = 0;
        for migration in &migrations {
            if migration.version <= previous {
                return Err(MigrationError::InvalidDefinition(format!(
                    "version {} does not follow version {}",
                    migration.version, previous
                )));
            }
            if migration.up_sql.trim().is_empty() {
                return Err(MigrationError::InvalidDefinition(format!(
                    "migration {} has no forward SQL",
                    migration.version
                )));
            }
            previous = migration.version;
        }
        self.migrations = migrations;
        Ok(self)
    }

    /// Keep only the newest `count` backups after a successful run.
    pub fn with_backup_keep_count(mut self, count: Option<usize>) -> Self {
        self.backup_keep_count = count;
        self
    }

    pub fn migrations(&self) -> &[Migration] {
        &self.migrations
    }

    pub fn latest_version(&self) -> i64 {
        self.migrations.last().map_or(0, |m| m.version)
    }

    /// Dedicated connection for schema work, never shared with the pool.
    fn open_session(&self) -> Result<Connection, MigrationError> {
        let conn = self.manager.connect()?;
        ensure_migrations_table(&conn)?;
        Ok(conn)
    }

    /// Connection for status queries. Issues no DDL.
    fn open_read_session(&self) -> Result<Connection, MigrationError> {
        Ok(self.manager.connect()?)
    }

    fn pending(&self, current: i64) -> Vec<&Migration> {
        self.migrations.iter().filter(|m| m.version > current).collect()
    }

    pub fn current_version(&self) -> Result<i64, MigrationError> {
        let conn = self.open_read_session()?;
        Ok(current_version(&conn)?)
    }

    pub fn get_migration_status(&self) -> Result<MigrationStatus, MigrationError> {
        let current = self.current_version()?;
        Ok(MigrationStatus {
            current_version: current,
            latest_version: self.latest_version(),
            pending_count: self.pending(current).len(),
            total_migrations: self.migrations.len(),
        })
    }

    /// Applied migrations, oldest first.
    pub fn get_migration_history(&self) -> Result<Vec<MigrationRecord>, MigrationError> {
        let conn = self.open_read_session()?;
        if !table_exists(&conn, MIGRATIONS_TABLE)? {
            return Ok(Vec::new());
        }
        let mut stmt = conn.prepare(
            "SELECT version, description, applied_at, rollback_sql
             FROM database_migrations ORDER BY version",
        )?;
        let records = stmt
            .query_map([], |row| {
                Ok(MigrationRecord {
                    version: row.get(0)?,
                    description: row.get(1)?,
                    applied_at: row.get(2)?,
                    rollback_sql: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    /// Bring the schema to the latest version.
    ///
    /// No-op when nothing is pending. Otherwise backs up the database file,
    /// applies each pending migration in its own transaction and validates the
    /// result. Migrations applied before a failure stay applied; the error
    /// carries the backup path.
    pub fn migrate_to_latest(&self) -> Result<MigrationReport, MigrationError> {
        let conn = self.open_session()?;
        let from_version = current_version(&conn)?;
        let pending = self.pending(from_version);

        if pending.is_empty() {
            debug!("database at version {} (up to date)", from_version);
            return Ok(MigrationReport {
                from_version,
                to_version: from_version,
                applied: Vec::new(),
                backup_path: None,
            });
        }

        info!(
            "database at version {}, {} migration(s) pending",
            from_version,
            pending.len()
        );

        let backup_path = self.backup_database(&conn)?;
        info!("Backup created: {}", backup_path.display());

        let mut applied = Vec::with_capacity(pending.len());
        for migration in pending {
            info!(
                "Running migration {}: {}",
                migration.version, migration.description
            );
            if let Err(e) = apply_on(&conn, migration) {
                error!(
                    "Migration {} failed: {}. Schema left at version {}. Backup at: {}",
                    migration.version,
                    e,
                    applied.last().copied().unwrap_or(from_version),
                    backup_path.display()
                );
                return Err(MigrationError::MigrationFailed {
                    version: migration.version,
                    message: e.to_string(),
                    backup_path,
                });
            }
            applied.push(migration.version);
            info!("Migration {} completed", migration.version);
        }

        if let Err(details) = validate_schema(&conn) {
            error!("post-migration validation failed: {}", details);
            return Err(MigrationError::ValidationFailed {
                details,
                backup_path,
            });
        }

        if let Err(e) = self.prune_backups() {
            warn!("Failed to clean up old backups: {}", e);
        }

        let to_version = current_version(&conn)?;
        Ok(MigrationReport {
            from_version,
            to_version,
            applied,
            backup_path: Some(backup_path),
        })
    }

    /// Apply a single migration outside of `migrate_to_latest`.
    ///
    /// Only the next pending migration is accepted, so versions are never
    /// skipped or applied out of order.
    pub fn apply_migration(&self, migration: &Migration) -> Result<(), MigrationError> {
        check_migration_safety(migration)?;

        let conn = self.open_session()?;
        let current = current_version(&conn)?;
        match self.pending(current).first() {
            Some(next) if next.version == migration.version => apply_on(&conn, migration),
            Some(next) => Err(MigrationError::InvalidDefinition(format!(
                "migration {} is not next: database at version {}, next pending is {}",
                migration.version, current, next.version
            ))),
            None => Err(MigrationError::InvalidDefinition(format!(
                "migration {} is not pending: database at version {}",
                migration.version, current
            ))),
        }
    }

    /// Administrative recovery: run the stored rollback SQL of the newest
    /// applied migration and remove its record.
    ///
    /// Never called by `migrate_to_latest`.
    pub fn rollback_last(&self) -> Result<MigrationRecord, MigrationError> {
        let conn = self.open_session()?;
        let record = conn
            .query_row(
                "SELECT version, description, applied_at, rollback_sql
                 FROM database_migrations ORDER BY version DESC LIMIT 1",
                [],
                |row| {
                    Ok(MigrationRecord {
                        version: row.get(0)?,
                        description: row.get(1)?,
                        applied_at: row.get(2)?,
                        rollback_sql: row.get(3)?,
                    })
                },
            )
            .optional()?
            .ok_or_else(|| MigrationError::NothingToRollback("no migrations applied".to_string()))?;

        let rollback_sql = record
            .rollback_sql
            .as_deref()
            .filter(|sql| !sql.trim().is_empty())
            .ok_or_else(|| {
                MigrationError::NothingToRollback(format!(
                    "migration {} has no rollback SQL",
                    record.version
                ))
            })?;

        let backup_path = self.backup_database(&conn)?;
        warn!(
            "Rolling back migration {} ({}). Backup at: {}",
            record.version,
            record.description,
            backup_path.display()
        );

        let tx = conn.unchecked_transaction()?;
        tx.execute_batch(rollback_sql)?;
        tx.execute(
            "DELETE FROM database_migrations WHERE version = ?1",
            [record.version],
        )?;
        tx.commit()?;

        Ok(record)
    }

    /// Snapshot the database into `<db>.backup_<YYYYMMDD_HHMMSS>`.
    ///
    /// `VACUUM INTO` reads one consistent snapshot including committed WAL
    /// content, so open readers and writers on other connections are safe.
    /// An existing backup is never overwritten: same-second backups get a
    /// `_1`, `_2`, ... suffix, and SQLite refuses a non-empty target.
    fn backup_database(&self, conn: &Connection) -> Result<PathBuf, MigrationError> {
        let stamp = Utc::now().format(BACKUP_STAMP_FORMAT).to_string();
        let backup_path = unique_backup_path(&self.db_path, &stamp);

        let target = backup_path.to_str().ok_or_else(|| MigrationError::BackupFailed {
            path: backup_path.clone(),
            message: "backup path is not valid UTF-8".to_string(),
        })?;
        conn.execute("VACUUM INTO ?1", [target])
            .map_err(|e| MigrationError::BackupFailed {
                path: backup_path.clone(),
                message: e.to_string(),
            })?;

        Ok(backup_path)
    }

    /// Backups of this database, oldest first.
    pub fn list_backups(&self) -> Result<Vec<PathBuf>, MigrationError> {
        let parent = match self.db_path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let prefix = match self.db_path.file_name().and_then(|n| n.to_str()) {
            Some(name) => format!("{}.backup_", name),
            None => return Ok(Vec::new()),
        };

        let mut backups: Vec<((NaiveDateTime, u32), PathBuf)> = fs::read_dir(&parent)?
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let name = entry.file_name();
                let key = name.to_str()?.strip_prefix(&prefix).and_then(backup_sort_key)?;
                Some((key, entry.path()))
            })
            .collect();

        backups.sort();
        Ok(backups.into_iter().map(|(_, path)| path).collect())
    }

    fn prune_backups(&self) -> Result<(), MigrationError> {
        let Some(keep) = self.backup_keep_count else {
            return Ok(());
        };
        let backups = self.list_backups()?;
        let excess = backups.len().saturating_sub(keep.max(1));
        for path in backups.into_iter().take(excess) {
            info!("Removing old backup: {}", path.display());
            fs::remove_file(path)?;
        }
        Ok(())
    }
}

/// First free backup name for `stamp`: the bare stamp, then `_1`, `_2`, ...
fn unique_backup_path(db_path: &Path, stamp: &str) -> PathBuf {
    let base = format!("{}.backup_{}", db_path.display(), stamp);
    let mut candidate = PathBuf::from(&base);
    let mut sequence = 1u32;
    while candidate.exists() {
        candidate = PathBuf::from(format!("{}_{}", base, sequence));
        sequence += 1;
    }
    candidate
}

/// Chronological order key for the part of a backup name after `.backup_`.
///
/// Anything that is not `<stamp>` or `<stamp>_<n>` (sidecar `-wal` files,
/// stray copies) is not a backup.
fn backup_sort_key(suffix: &str) -> Option<(NaiveDateTime, u32)> {
    let stamp_len = "YYYYMMDD_HHMMSS".len();
    let stamp = suffix.get(..stamp_len)?;
    let taken_at = NaiveDateTime::parse_from_str(stamp, BACKUP_STAMP_FORMAT).ok()?;
    let sequence = match &suffix[stamp_len..] {
        "" => 0,
        rest => rest.strip_prefix('_')?.parse().ok()?,
    };
    Some((taken_at, sequence))
}

/// Execute one migration and record it, atomically.
fn apply_on(conn: &Connection, migration: &Migration) -> Result<(), MigrationError> {
    if let Err(e) = check_migration_safety(migration) {
        error!("{}", e);
        return Err(e);
    }

    // Transaction rolls back on drop if anything below fails.
    let tx = conn.unchecked_transaction()?;
    tx.execute_batch(migration.up_sql)?;
    tx.execute(
        "INSERT INTO database_migrations (version, description, applied_at, rollback_sql)
         VALUES (?1, ?2, ?3, ?4)",
        rusqlite::params![
            migration.version,
            migration.description,
            Utc::now().to_rfc3339(),
            migration.rollback_sql,
        ],
    )?;
    tx.commit()?;
    Ok(())
}
