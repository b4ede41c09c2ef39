use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::proto;

/// A single secret record owned by one user.
///
/// On the client the field slots hold plaintext; on the wire and in the
/// store they hold base64 ciphertext envelopes. An empty string means the
/// field is absent and is never encrypted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretRecord {
    /// Server-assigned identity; 0 before the first insert
    pub id: u64,
    /// Authenticated owner; immutable once set
    pub owner_id: u64,
    /// Display label, unique per `(owner_id, name)`
    pub name: String,
    /// Optimistic-concurrency token, server-assigned on every write
    pub version: u64,
    pub login: String,
    pub password: String,
    pub text: String,
    pub card_number: String,
    pub metadata: String,
    /// Attachment reference; `None` means no attachment
    pub file_id: Option<u64>,
}

impl SecretRecord {
    /// True if the record has not been persisted yet.
    pub fn is_new(&self) -> bool {
        self.id == 0
    }
}

/// Attachment metadata; ownership is transitive through the owning record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileAttachment {
    pub id: u64,
    /// Original file name, display only
    pub name: String,
    /// Server-local storage location, opaque to clients
    pub path: PathBuf,
}

/// Name-only inventory entry returned by the list operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordSummary {
    pub id: u64,
    pub name: String,
}

impl SecretRecord {
    /// Wire representation; `owner_id` never leaves the server.
    pub fn to_proto(&self, file_name: &str) -> proto::Record {
        proto::Record {
            id: self.id,
            name: self.name.clone(),
            version: self.version,
            login: self.login.clone(),
            password: self.password.clone(),
            text: self.text.clone(),
            card_number: self.card_number.clone(),
            metadata: self.metadata.clone(),
            file_id: self.file_id,
            file_name: file_name.to_string(),
        }
    }

    pub fn from_proto(rec: proto::Record, owner_id: u64) -> Self {
        Self {
            id: rec.id,
            owner_id,
            name: rec.name,
            version: rec.version,
            login: rec.login,
            password: rec.password,
            text: rec.text,
            card_number: rec.card_number,
            metadata: rec.metadata,
            file_id: rec.file_id,
        }
    }
}
