//! Session: bearer token, storage key, and the plaintext cache
//!
//! One session per login; dropping it at logout drops the derived key (it
//! zeroizes itself) and every decrypted value with it. The cache is private
//! to the process; concurrent sync operations serialize their cache writes
//! through the lock, the server-side version remains authoritative.

use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::RwLock;

use stash_crypto::StorageKey;

/// Client-side view of a record: plaintext fields plus local file state.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlainRecord {
    pub id: u64,
    pub name: String,
    pub version: u64,
    pub login: String,
    pub password: String,
    pub text: String,
    pub card_number: String,
    pub metadata: String,
    pub file_id: Option<u64>,
    /// Attachment name as stored on the server
    pub file_name: String,
    /// Local file to attach on the next save; contents are encrypted to a
    /// temporary location before they leave the machine
    pub file_path: Option<PathBuf>,
}

pub struct Session {
    token: String,
    key: StorageKey,
    cache: RwLock<HashMap<u64, PlainRecord>>,
}

impl Session {
    pub fn new(token: String, key: StorageKey) -> Self {
        Self {
            token,
            key,
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn key(&self) -> &StorageKey {
        &self.key
    }

    pub async fn cached(&self, id: u64) -> Option<PlainRecord> {
        self.cache.read().await.get(&id).cloned()
    }

    pub async fn remember(&self, record: PlainRecord) {
        self.cache.write().await.insert(record.id, record);
    }

    pub async fn evict(&self, id: u64) {
        self.cache.write().await.remove(&id);
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("token", &"[REDACTED]")
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}
