// src/repositories/client_repository.rs
//
// Client Repository
//
// - Validates records before writing
// - Upserts keep the row in place so cascading file rows survive
// - Loading the client list is a fatal read: an unreadable table is never
//   reported as "no clients"

use chrono::{DateTime, Utc};
use rusqlite::{params, Row};
use std::sync::Arc;
use uuid::Uuid;

use crate::domain::{validate_client, ClientRecord};
use crate::error::AppResult;
use crate::repositories::columns::{timestamp_column, uuid_column};
use crate::repositories::database_manager::DatabaseManager;

const CLIENT_COLUMNS: &str = "ID, Name, PublicKey, LastSeen, AESKey";

// ---------------------------------------------------------------------
// Repository contract
// ---------------------------------------------------------------------
pub trait ClientRepository: Send + Sync {
    /// Insert or update. Invalid records are rejected with a domain error;
    /// store failures return false.
    fn save(&self, client: &ClientRecord) -> AppResult<bool>;

    fn load_all(&self) -> AppResult<Vec<ClientRecord>>;

    fn get_by_id(&self, id: Uuid) -> AppResult<Option<ClientRecord>>;

    fn get_by_name(&self, name: &str) -> AppResult<Option<ClientRecord>>;

    fn update_last_seen(&self, id: Uuid, at: DateTime<Utc>) -> bool;

    /// Remove the client and, through the cascade, its files.
    fn delete(&self, id: Uuid) -> bool;
}

pub struct SqliteClientRepository {
    db: Arc<DatabaseManager>,
}

impl SqliteClientRepository {
    pub fn new(db: Arc<DatabaseManager>) -> Self {
        Self { db }
    }

    fn row_to_client(row: &Row) -> rusqlite::Result<ClientRecord> {
        Ok(ClientRecord {
            id: uuid_column(row, 0)?,
            name: row.get(1)?,
            public_key: row.get(2)?,
            last_seen: timestamp_column(row, 3)?,
            session_key: row.get(4)?,
        })
    }
}

// ---------------------------------------------------------------------
// SQLite Implementation
// ---------------------------------------------------------------------
impl ClientRepository for SqliteClientRepository {
    fn save(&self, client: &ClientRecord) -> AppResult<bool> {
        validate_client(client)?;

        Ok(self.db.write(
            "INSERT INTO clients (ID, Name, PublicKey, LastSeen, AESKey)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(ID) DO UPDATE SET
                Name = excluded.Name,
                PublicKey = excluded.PublicKey,
                LastSeen = excluded.LastSeen,
                AESKey = excluded.AESKey",
            params![
                client.id.as_bytes().as_slice(),
                client.name,
                client.public_key,
                client.last_seen.to_rfc3339(),
                client.session_key,
            ],
        ))
    }

    fn load_all(&self) -> AppResult<Vec<ClientRecord>> {
        self.db.read(
            &format!("SELECT {} FROM clients ORDER BY Name", CLIENT_COLUMNS),
            &[],
            Self::row_to_client,
        )
    }

    fn get_by_id(&self, id: Uuid) -> AppResult<Option<ClientRecord>> {
        self.db.read_optional(
            &format!("SELECT {} FROM clients WHERE ID = ?1", CLIENT_COLUMNS),
            params![id.as_bytes().as_slice()],
            Self::row_to_client,
        )
    }

    fn get_by_name(&self, name: &str) -> AppResult<Option<ClientRecord>> {
        self.db.read_optional(
            &format!("SELECT {} FROM clients WHERE Name = ?1", CLIENT_COLUMNS),
            params![name],
            Self::row_to_client,
        )
    }

    fn update_last_seen(&self, id: Uuid, at: DateTime<Utc>) -> bool {
        self.db
            .write_affected(
                "UPDATE clients SET LastSeen = ?1 WHERE ID = ?2",
                params![at.to_rfc3339(), id.as_bytes().as_slice()],
            )
            .is_some_and(|changed| changed > 0)
    }

    fn delete(&self, id: Uuid) -> bool {
        self.db
            .write_affected(
                "DELETE FROM clients WHERE ID = ?1",
                params![id.as_bytes().as_slice()],
            )
            .is_some_and(|deleted| deleted > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DatabaseConfig, PoolConfig};
    use crate::db::schema::bootstrap_schema;
    use crate::error::AppError;
    use tempfile::TempDir;

    fn setup() -> (TempDir, Arc<DatabaseManager>, SqliteClientRepository) {
        let dir = tempfile::tempdir().unwrap();
        let config = DatabaseConfig {
            database_path: dir.path().join("clients.db"),
            pool: PoolConfig {
                capacity: 2,
                monitor_enabled: false,
                ..PoolConfig::default()
            },
            ..DatabaseConfig::default()
        };
        let db = Arc::new(DatabaseManager::from_config(&config).unwrap());
        db.with_connection(|conn| bootstrap_schema(conn).map(|_| ())).unwrap();
        let repo = SqliteClientRepository::new(Arc::clone(&db));
        (dir, db, repo)
    }

    #[test]
    fn test_save_and_load() {
        let (_dir, _db, repo) = setup();
        let mut alice = ClientRecord::new("alice");
        alice.set_public_key(vec![3; 160]);
        alice.set_session_key(vec![9; 32]);

        assert!(repo.save(&alice).unwrap());
        assert!(repo.save(&ClientRecord::new("bob")).unwrap());

        let all = repo.load_all().unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0], alice);

        assert_eq!(repo.get_by_id(alice.id).unwrap(), Some(alice.clone()));
        assert_eq!(repo.get_by_name("alice").unwrap().map(|c| c.id), Some(alice.id));
        assert!(repo.get_by_name("carol").unwrap().is_none());
    }

    #[test]
    fn test_save_updates_in_place() {
        let (_dir, _db, repo) = setup();
        let mut client = ClientRecord::new("alice");
        assert!(repo.save(&client).unwrap());

        client.set_session_key(vec![1; 16]);
        assert!(repo.save(&client).unwrap());

        let all = repo.load_all().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].session_key, Some(vec![1; 16]));
    }

    #[test]
    fn test_invalid_client_is_rejected_before_write() {
        let (_dir, _db, repo) = setup();
        let result = repo.save(&ClientRecord::new(""));
        assert!(matches!(result, Err(AppError::Domain(_))));
        assert!(repo.load_all().unwrap().is_empty());
    }

    #[test]
    fn test_duplicate_name_is_soft_failure() {
        let (_dir, _db, repo) = setup();
        assert!(repo.save(&ClientRecord::new("alice")).unwrap());
        assert!(!repo.save(&ClientRecord::new("alice")).unwrap());
    }

    #[test]
    fn test_update_last_seen_and_delete() {
        let (_dir, _db, repo) = setup();
        let client = ClientRecord::new("alice");
        assert!(repo.save(&client).unwrap());

        let later = client.last_seen + chrono::Duration::hours(1);
        assert!(repo.update_last_seen(client.id, later));
        assert_eq!(repo.get_by_id(client.id).unwrap().unwrap().last_seen, later);

        assert!(!repo.update_last_seen(Uuid::new_v4(), later));
        assert!(repo.delete(client.id));
        assert!(!repo.delete(client.id));
    }

    #[test]
    fn test_malformed_stored_timestamp_is_an_error() {
        let (_dir, db, repo) = setup();
        assert!(db.write(
            "INSERT INTO clients (ID, Name, LastSeen) VALUES (?1, 'legacy', 'not a date')",
            params![vec![5u8; 16]],
        ));
        assert!(matches!(repo.load_all(), Err(AppError::Database(_))));
    }
}
