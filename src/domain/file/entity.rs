use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Metadata for a file a client uploaded
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    /// Database row id, assigned on first save
    pub id: Option<i64>,

    /// Owning client (files are deleted with their client)
    pub client_id: Uuid,

    /// Name as sent by the client, unique per client
    pub file_name: String,

    /// Where the server stored the file
    pub path_name: String,

    /// Set once the client confirmed the checksum
    pub verified: bool,

    /// Size in bytes. NULL for rows created before sizes were tracked.
    pub file_size: Option<u64>,

    /// Modification time reported by the client
    pub modification_date: Option<DateTime<Utc>>,

    /// Checksum computed by the server
    pub crc: Option<u32>,
}

impl FileRecord {
    /// Create an unverified record for an upload
    pub fn new(
        client_id: Uuid,
        file_name: impl Into<String>,
        path_name: impl Into<String>,
        file_size: u64,
        crc: u32,
    ) -> Self {
        Self {
            id: None,
            client_id,
            file_name: file_name.into(),
            path_name: path_name.into(),
            verified: false,
            file_size: Some(file_size),
            modification_date: Some(Utc::now()),
            crc: Some(crc),
        }
    }

    pub fn with_modification_date(mut self, date: DateTime<Utc>) -> Self {
        self.modification_date = Some(date);
        self
    }

    /// Mark verified when the client's checksum matches ours
    pub fn verify(&mut self, client_crc: u32) -> bool {
        self.verified = self.crc == Some(client_crc);
        self.verified
    }
}
