use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A registered client of the file server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientRecord {
    /// Immutable identifier, stored as a 16-byte blob
    pub id: Uuid,

    /// Display name, unique across clients
    pub name: String,

    /// Public key sent at registration
    pub public_key: Option<Vec<u8>>,

    /// Last time the client connected
    pub last_seen: DateTime<Utc>,

    /// Symmetric key of the current session
    pub session_key: Option<Vec<u8>>,
}

impl ClientRecord {
    /// Create a newly registered client
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            public_key: None,
            last_seen: Utc::now(),
            session_key: None,
        }
    }

    /// Record a reconnect
    pub fn touch(&mut self) {
        self.last_seen = Utc::now();
    }

    pub fn set_public_key(&mut self, key: Vec<u8>) {
        self.public_key = Some(key);
    }

    /// Replace the session key. A new key invalidates the old session.
    pub fn set_session_key(&mut self, key: Vec<u8>) {
        self.session_key = Some(key);
        self.touch();
    }
}
