//! Narrow repository interfaces over the record and file stores
//!
//! The versioning engine talks to durable storage only through these traits;
//! the SQL layer (or the in-memory store used by tests and the default
//! daemon) lives behind them.

use stash_core::types::{FileAttachment, RecordSummary, SecretRecord};
use stash_core::VaultResult;

#[tonic::async_trait]
pub trait RecordRepository: Send + Sync {
    /// Persist a new record; assigns `record.id`. The `(owner_id, name)`
    /// uniqueness constraint is enforced here as well, mirroring the store's
    /// unique index.
    async fn insert(&self, record: &mut SecretRecord) -> VaultResult<()>;

    /// Conditional full-row write: persists `record` only if the stored
    /// version still equals `expected_version`. Returns false when no row
    /// matched `(id, expected_version)` — the compare-and-swap that closes
    /// the read-then-write race between concurrent updates.
    ///
    /// The stored `owner_id` is never overwritten.
    async fn update_versioned(
        &self,
        record: &SecretRecord,
        expected_version: u64,
    ) -> VaultResult<bool>;

    async fn get(&self, id: u64) -> VaultResult<Option<SecretRecord>>;

    /// Lookup scoped to the caller; a foreign owner reads as absence.
    async fn get_by_owner(&self, id: u64, owner_id: u64) -> VaultResult<Option<SecretRecord>>;

    /// Id of the record with this `(owner_id, name)`, if any.
    async fn id_by_name(&self, owner_id: u64, name: &str) -> VaultResult<Option<u64>>;

    async fn list(&self, owner_id: u64) -> VaultResult<Vec<RecordSummary>>;

    async fn delete(&self, id: u64) -> VaultResult<()>;
}

#[tonic::async_trait]
pub trait FileRepository: Send + Sync {
    /// Persist a new attachment row; assigns `file.id`.
    async fn insert(&self, file: &mut FileAttachment) -> VaultResult<()>;

    async fn update(&self, file: &FileAttachment) -> VaultResult<()>;

    async fn get(&self, id: u64) -> VaultResult<Option<FileAttachment>>;

    async fn delete(&self, id: u64) -> VaultResult<()>;
}
