// src/repositories/mod.rs
//
// Repository layer
//
// RULES:
// - All SQL goes through DatabaseManager; repositories never hold a connection
// - Values are bound, never interpolated
// - Records are validated before they are written
// - Explicit SQL only

pub mod client_repository;
mod columns;
pub mod database_manager;
pub mod database_stats;
pub mod file_repository;

pub use client_repository::{ClientRepository, SqliteClientRepository};
pub use database_manager::{DatabaseManager, Fetch, QueryOutput, SqlRow};
pub use database_stats::{ClientStorage, DatabaseHealth, DatabaseStats, StorageStatistics};
pub use file_repository::{FileRepository, SqliteFileRepository};
