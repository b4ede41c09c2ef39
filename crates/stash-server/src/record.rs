//! Versioning & ownership engine
//!
//! Optimistic concurrency over the record store: every update must present
//! the version it observed, and the final write is a compare-and-swap at the
//! repository boundary, so two updates racing on the same stale version
//! cannot both win. Ownership failures read as absence to the caller.

use std::sync::Arc;
use tracing::{debug, warn};

use stash_core::types::{RecordSummary, SecretRecord};
use stash_core::{VaultError, VaultResult};

use crate::file::FileService;
use crate::repository::RecordRepository;

#[derive(Clone)]
pub struct RecordService {
    records: Arc<dyn RecordRepository>,
    file_service: FileService,
}

impl RecordService {
    pub fn new(records: Arc<dyn RecordRepository>, file_service: FileService) -> Self {
        Self {
            records,
            file_service,
        }
    }

    /// Insert or update per the optimistic-concurrency protocol.
    ///
    /// Insert (id absent): the caller must not supply a version, the name
    /// must be free for this owner, and the server assigns version 1.
    ///
    /// Update (id present): the caller's version must equal the stored one
    /// (checked before any write, and again atomically at the store); a
    /// changed name re-runs the uniqueness check; the new version is
    /// strictly greater.
    pub async fn upsert(&self, record: &mut SecretRecord) -> VaultResult<()> {
        if record.is_new() {
            if record.version != 0 {
                return Err(VaultError::InvalidArgument(
                    "version must be absent on insert".into(),
                ));
            }
            self.check_name(record, None).await?;

            record.version = 1;
            self.records.insert(record).await?;
            debug!(id = record.id, owner = record.owner_id, "record inserted");
            return Ok(());
        }

        let stored = self
            .records
            .get_by_owner(record.id, record.owner_id)
            .await?
            .ok_or(VaultError::NotFound)?;

        self.gate_version(&stored, record.version)?;
        self.check_name(record, Some(&stored)).await?;

        // Attachment association changes only through the upload path
        record.file_id = stored.file_id;
        record.version = stored.version + 1;
        if !self.records.update_versioned(record, stored.version).await? {
            warn!(id = record.id, "lost version race on update");
            return Err(VaultError::VersionConflict);
        }

        debug!(id = record.id, version = record.version, "record updated");
        Ok(())
    }

    /// Owner-scoped read; a foreign or missing id is `NotFound` either way.
    pub async fn get(&self, id: u64, owner_id: u64) -> VaultResult<SecretRecord> {
        self.records
            .get_by_owner(id, owner_id)
            .await?
            .ok_or(VaultError::NotFound)
    }

    pub async fn list(&self, owner_id: u64) -> VaultResult<Vec<RecordSummary>> {
        self.records.list(owner_id).await
    }

    /// Delete the record, then its attachment row and bytes if any.
    ///
    /// An attachment that cannot be deleted fails the whole call; the
    /// record row is already gone at that point and the error is surfaced,
    /// not downgraded to a warning.
    pub async fn delete(&self, id: u64, owner_id: u64) -> VaultResult<()> {
        let stored = self.get(id, owner_id).await?;

        self.records.delete(id).await?;

        if let Some(file_id) = stored.file_id {
            self.file_service.delete(file_id).await?;
        }

        debug!(id, owner = owner_id, "record deleted");
        Ok(())
    }

    /// Authorize an upload stream before any byte hits the disk.
    ///
    /// The record must exist and be owned by the caller; a non-null
    /// requested file id must match the record's currently stored `file_id`
    /// and resolve to an existing attachment row.
    pub async fn check_upload(
        &self,
        record_id: u64,
        owner_id: u64,
        file_id: Option<u64>,
    ) -> VaultResult<SecretRecord> {
        let stored = self.get(record_id, owner_id).await?;

        if let Some(requested) = file_id.filter(|&id| id != 0) {
            if stored.file_id != Some(requested) {
                return Err(VaultError::BadFileId);
            }
            if !self.file_service.exists(requested).await? {
                return Err(VaultError::BadFileId);
            }
        }

        Ok(stored)
    }

    /// Terminal step of a successful upload: associate the new attachment
    /// and bump the version, under the same version gate as `upsert`.
    /// Returns the new version.
    pub async fn attach_file(
        &self,
        record_id: u64,
        owner_id: u64,
        caller_version: u64,
        file_id: u64,
    ) -> VaultResult<u64> {
        let stored = self.get(record_id, owner_id).await?;
        self.gate_version(&stored, caller_version)?;

        let mut updated = stored.clone();
        updated.file_id = Some(file_id);
        updated.version = stored.version + 1;

        if !self
            .records
            .update_versioned(&updated, stored.version)
            .await?
        {
            warn!(id = record_id, "lost version race on attach");
            return Err(VaultError::VersionConflict);
        }

        debug!(
            id = record_id,
            file_id,
            version = updated.version,
            "attachment associated"
        );
        Ok(updated.version)
    }

    fn gate_version(&self, stored: &SecretRecord, caller_version: u64) -> VaultResult<()> {
        if caller_version == 0 {
            return Err(VaultError::VersionAbsent);
        }
        if caller_version != stored.version {
            return Err(VaultError::VersionConflict);
        }
        Ok(())
    }

    /// Uniqueness of `(owner_id, name)` against current stored state.
    /// Keeping the same name on update trivially passes.
    async fn check_name(
        &self,
        record: &SecretRecord,
        stored: Option<&SecretRecord>,
    ) -> VaultResult<()> {
        if let Some(stored) = stored {
            if stored.name == record.name {
                return Ok(());
            }
        }

        match self.records.id_by_name(record.owner_id, &record.name).await? {
            Some(id) if id != record.id => Err(VaultError::NameNotUnique),
            _ => Ok(()),
        }
    }
}
