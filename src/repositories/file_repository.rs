// src/repositories/file_repository.rs
//
// File Repository
//
// Files are keyed by (client, file name). Saving an existing pair updates the
// row in place and keeps its id.

use log::debug;
use rusqlite::{params, OptionalExtension, Row};
use std::sync::Arc;
use uuid::Uuid;

use crate::domain::{validate_file, DomainError, FileRecord};
use crate::error::AppResult;
use crate::repositories::columns::{optional_timestamp_column, unsigned_column, uuid_column};
use crate::repositories::database_manager::DatabaseManager;

const FILE_COLUMNS: &str =
    "ID, ClientID, FileName, PathName, Verified, FileSize, ModificationDate, CRC";

// ---------------------------------------------------------------------
// Repository contract
// ---------------------------------------------------------------------
pub trait FileRepository: Send + Sync {
    /// Insert or update by (client, file name). Returns the row id, or `None`
    /// when the store rejected the write (for example an unknown client).
    fn save(&self, file: &FileRecord) -> AppResult<Option<i64>>;

    fn files_for_client(&self, client_id: Uuid) -> AppResult<Vec<FileRecord>>;

    fn get(&self, client_id: Uuid, file_name: &str) -> AppResult<Option<FileRecord>>;

    fn mark_verified(&self, client_id: Uuid, file_name: &str, verified: bool) -> bool;

    fn delete(&self, client_id: Uuid, file_name: &str) -> bool;
}

pub struct SqliteFileRepository {
    db: Arc<DatabaseManager>,
}

impl SqliteFileRepository {
    pub fn new(db: Arc<DatabaseManager>) -> Self {
        Self { db }
    }

    fn row_to_file(row: &Row) -> rusqlite::Result<FileRecord> {
        Ok(FileRecord {
            id: row.get(0)?,
            client_id: uuid_column(row, 1)?,
            file_name: row.get(2)?,
            path_name: row.get(3)?,
            verified: row.get(4)?,
            file_size: unsigned_column(row, 5)?,
            modification_date: optional_timestamp_column(row, 6)?,
            crc: unsigned_column(row, 7)?,
        })
    }
}

// ---------------------------------------------------------------------
// SQLite Implementation
// ---------------------------------------------------------------------
impl FileRepository for SqliteFileRepository {
    fn save(&self, file: &FileRecord) -> AppResult<Option<i64>> {
        validate_file(file)?;

        let file_size = file
            .file_size
            .map(i64::try_from)
            .transpose()
            .map_err(|_| DomainError::InvariantViolation("File size out of range".to_string()))?;
        let crc = file.crc.map(i64::from);
        let modification_date = file.modification_date.map(|date| date.to_rfc3339());
        let client_id = file.client_id.as_bytes().as_slice();

        Ok(self.db.write_with("file save", |tx| {
            let updated = tx.execute(
                "UPDATE files
                 SET PathName = ?1, Verified = ?2, FileSize = ?3, ModificationDate = ?4, CRC = ?5
                 WHERE ClientID = ?6 AND FileName = ?7",
                params![
                    file.path_name,
                    file.verified,
                    file_size,
                    modification_date,
                    crc,
                    client_id,
                    file.file_name,
                ],
            )?;

            if updated == 0 {
                tx.execute(
                    "INSERT INTO files
                        (ClientID, FileName, PathName, Verified, FileSize, ModificationDate, CRC)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![
                        client_id,
                        file.file_name,
                        file.path_name,
                        file.verified,
                        file_size,
                        modification_date,
                        crc,
                    ],
                )?;
                debug!("stored new file '{}'", file.file_name);
                return Ok(tx.last_insert_rowid());
            }

            let id: Option<i64> = tx
                .query_row(
                    "SELECT ID FROM files WHERE ClientID = ?1 AND FileName = ?2",
                    params![client_id, file.file_name],
                    |row| row.get(0),
                )
                .optional()?;
            id.ok_or(rusqlite::Error::QueryReturnedNoRows)
        }))
    }

    fn files_for_client(&self, client_id: Uuid) -> AppResult<Vec<FileRecord>> {
        self.db.read(
            &format!(
                "SELECT {} FROM files WHERE ClientID = ?1 ORDER BY FileName",
                FILE_COLUMNS
            ),
            params![client_id.as_bytes().as_slice()],
            Self::row_to_file,
        )
    }

    fn get(&self, client_id: Uuid, file_name: &str) -> AppResult<Option<FileRecord>> {
        self.db.read_optional(
            &format!(
                "SELECT {} FROM files WHERE ClientID = ?1 AND FileName = ?2",
                FILE_COLUMNS
            ),
            params![client_id.as_bytes().as_slice(), file_name],
            Self::row_to_file,
        )
    }

    fn mark_verified(&self, client_id: Uuid, file_name: &str, verified: bool) -> bool {
        self.db
            .write_affected(
                "UPDATE files SET Verified = ?1 WHERE ClientID = ?2 AND FileName = ?3",
                params![verified, client_id.as_bytes().as_slice(), file_name],
            )
            .is_some_and(|changed| changed > 0)
    }

    fn delete(&self, client_id: Uuid, file_name: &str) -> bool {
        self.db
            .write_affected(
                "DELETE FROM files WHERE ClientID = ?1 AND FileName = ?2",
                params![client_id.as_bytes().as_slice(), file_name],
            )
            .is_some_and(|deleted| deleted > 0)
    }
}
