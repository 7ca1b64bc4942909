// src/config.rs
//
// Database configuration
//
// Loaded from an optional JSON file, then adjusted by environment overrides.
// Every field has a default so a partial file is enough.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{AppError, AppResult};

pub const ENV_DB_PATH: &str = "FILEVAULT_DB_PATH";
pub const ENV_POOL_SIZE: &str = "FILEVAULT_POOL_SIZE";
pub const ENV_POOLING: &str = "FILEVAULT_POOLING";

/// Top-level database configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Path of the SQLite database file
    pub database_path: PathBuf,

    /// When false every query opens (and closes) its own direct connection
    pub pooling_enabled: bool,

    pub pool: PoolConfig,

    pub migrations: MigrationConfig,
}

/// Connection pool sizing, timeouts and monitor thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Number of permanent connections
    pub capacity: usize,
    pub acquire_timeout_ms: u64,
    pub max_connection_age_secs: u64,
    pub monitor_interval_secs: u64,
    pub monitor_enabled: bool,
    /// Idle threshold used by `force_cleanup`
    pub force_cleanup_idle_secs: u64,
    /// Idle connections older than this raise a health warning
    pub long_idle_warning_secs: u64,
    /// Minimum spacing between two critical exhaustion alerts
    pub exhaustion_alert_interval_secs: u64,
    pub busy_timeout_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationConfig {
    /// Number of pre-migration backups to keep. `None` keeps all of them.
    pub backup_keep_count: Option<usize>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            capacity: 5,
            acquire_timeout_ms: 5_000,
            max_connection_age_secs: 3_600,
            monitor_interval_secs: 300,
            monitor_enabled: true,
            force_cleanup_idle_secs: 1_800,
            long_idle_warning_secs: 1_800,
            exhaustion_alert_interval_secs: 60,
            busy_timeout_ms: 5_000,
        }
    }
}

impl PoolConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn max_connection_age(&self) -> Duration {
        Duration::from_secs(self.max_connection_age_secs)
    }

    /// Idle connections are evicted after half the maximum age.
    pub fn max_idle_time(&self) -> Duration {
        self.max_connection_age() / 2
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.monitor_interval_secs)
    }

    pub fn force_cleanup_idle(&self) -> Duration {
        Duration::from_secs(self.force_cleanup_idle_secs)
    }

    pub fn long_idle_warning(&self) -> Duration {
        Duration::from_secs(self.long_idle_warning_secs)
    }

    pub fn exhaustion_alert_interval(&self) -> Duration {
        Duration::from_secs(self.exhaustion_alert_interval_secs)
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.capacity == 0 {
            return Err(AppError::Config("pool capacity must be at least 1".to_string()));
        }
        if self.acquire_timeout_ms == 0 {
            return Err(AppError::Config("acquire timeout must be positive".to_string()));
        }
        if self.monitor_enabled && self.monitor_interval_secs == 0 {
            return Err(AppError::Config("monitor interval must be positive".to_string()));
        }
        Ok(())
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            pooling_enabled: true,
            pool: PoolConfig::default(),
            migrations: MigrationConfig::default(),
        }
    }
}

impl DatabaseConfig {
    /// Configuration for a database at `path` with default settings.
    pub fn for_path(path: impl Into<PathBuf>) -> Self {
        Self {
            database_path: path.into(),
            ..Self::default()
        }
    }

    /// Read a JSON configuration file. Missing fields take their defaults.
    pub fn from_json_file(path: &Path) -> AppResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        Ok(config)
    }

    /// Load from an optional file, apply environment overrides and validate.
    pub fn load(path: Option<&Path>) -> AppResult<Self> {
        let mut config = match path {
            Some(path) => Self::from_json_file(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) -> AppResult<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides<F>(&mut self, lookup: F) -> AppResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = lookup(ENV_DB_PATH).filter(|p| !p.trim().is_empty()) {
            self.database_path = PathBuf::from(path);
        }

        if let Some(size) = lookup(ENV_POOL_SIZE) {
            self.pool.capacity = size.trim().parse().map_err(|_| {
                AppError::Config(format!("{} must be a positive integer, got '{}'", ENV_POOL_SIZE, size))
            })?;
        }

        if let Some(flag) = lookup(ENV_POOLING) {
            self.pooling_enabled = match flag.trim().to_ascii_lowercase().as_str() {
                "0" | "false" | "off" | "no" => false,
                "1" | "true" | "on" | "yes" => true,
                other => {
                    return Err(AppError::Config(format!(
                        "{} must be a boolean, got '{}'",
                        ENV_POOLING, other
                    )))
                }
            };
        }

        Ok(())
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.database_path.as_os_str().is_empty() {
            return Err(AppError::Config("database path cannot be empty".to_string()));
        }
        self.pool.validate()
    }
}

/// Default database location: {DATA_DIR}/filevault/defensive.db
///
/// Falls back to the working directory when the platform has no data dir.
pub fn default_database_path() -> PathBuf {
    dirs::data_dir()
        .map(|dir| dir.join("filevault"))
        .unwrap_or_else(|| PathBuf::from("."))
        .join("defensive.db")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = DatabaseConfig::default();
        assert!(config.pooling_enabled);
        assert_eq!(config.pool.capacity, 5);
        assert_eq!(config.pool.monitor_interval(), Duration::from_secs(300));
        assert_eq!(config.pool.max_idle_time(), Duration::from_secs(1_800));
        assert!(config.database_path.ends_with("defensive.db"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.json");
        std::fs::write(
            &path,
            r#"{ "database_path": "/tmp/vault.db", "pool": { "capacity": 2 } }"#,
        )
        .unwrap();

        let config = DatabaseConfig::from_json_file(&path).unwrap();
        assert_eq!(config.database_path, PathBuf::from("/tmp/vault.db"));
        assert_eq!(config.pool.capacity, 2);
        assert_eq!(config.pool.acquire_timeout_ms, 5_000);
        assert!(config.migrations.backup_keep_count.is_none());
    }

    #[test]
    fn test_load_from_file_validates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.json");
        let db_path = dir.path().join("vault.db");
        std::fs::write(
            &path,
            serde_json::json!({
                "database_path": db_path,
                "pooling_enabled": false,
                "migrations": { "backup_keep_count": 3 }
            })
            .to_string(),
        )
        .unwrap();

        let config = DatabaseConfig::load(Some(&path)).unwrap();
        assert_eq!(config.database_path, db_path);
        assert!(!config.pooling_enabled);
        assert_eq!(config.migrations.backup_keep_count, Some(3));
        assert_eq!(config.pool.capacity, 5);

        std::fs::write(&path, r#"{ "pool": { "capacity": 0 } }"#).unwrap();
        assert!(matches!(
            DatabaseConfig::load(Some(&path)),
            Err(AppError::Config(_))
        ));

        assert!(DatabaseConfig::load(Some(&dir.path().join("missing.json"))).is_err());
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            (ENV_DB_PATH, "/data/server.db"),
            (ENV_POOL_SIZE, " 8 "),
            (ENV_POOLING, "off"),
        ]
        .into_iter()
        .collect();

        let mut config = DatabaseConfig::default();
        config
            .apply_overrides(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.database_path, PathBuf::from("/data/server.db"));
        assert_eq!(config.pool.capacity, 8);
        assert!(!config.pooling_enabled);
    }

    #[test]
    fn test_bad_env_values_rejected() {
        let mut config = DatabaseConfig::default();
        let result = config.apply_overrides(|key| {
            (key == ENV_POOL_SIZE).then(|| "many".to_string())
        });
        assert!(matches!(result, Err(AppError::Config(_))));

        let result = config.apply_overrides(|key| (key == ENV_POOLING).then(|| "maybe".to_string()));
        assert!(matches!(result, Err(AppError::Config(_))));
    }

    #[test]
    fn test_zero_capacity_invalid() {
        let mut config = DatabaseConfig::default();
        config.pool.capacity = 0;
        assert!(matches!(config.validate(), Err(AppError::Config(_))));
    }
}
