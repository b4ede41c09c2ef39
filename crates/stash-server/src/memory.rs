//! In-memory record and file stores
//!
//! Shared-state maps behind a tokio `RwLock`, used by tests and the default
//! daemon. `update_versioned` is the atomic compare-and-swap point: the
//! version comparison and the row write happen under one write lock, the
//! same guarantee a SQL store gives via `UPDATE … WHERE id = ? AND
//! version = ?`.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use stash_core::types::{FileAttachment, RecordSummary, SecretRecord};
use stash_core::{VaultError, VaultResult};

use crate::repository::{FileRepository, RecordRepository};

#[derive(Default)]
struct RecordTable {
    next_id: u64,
    rows: HashMap<u64, SecretRecord>,
}

/// In-memory record store.
#[derive(Clone, Default)]
pub struct MemoryRecordStore {
    inner: Arc<RwLock<RecordTable>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[tonic::async_trait]
impl RecordRepository for MemoryRecordStore {
    async fn insert(&self, record: &mut SecretRecord) -> VaultResult<()> {
        let mut table = self.inner.write().await;

        // Unique (owner_id, name) index
        if table
            .rows
            .values()
            .any(|r| r.owner_id == record.owner_id && r.name == record.name)
        {
            return Err(VaultError::NameNotUnique);
        }

        table.next_id += 1;
        record.id = table.next_id;
        table.rows.insert(record.id, record.clone());
        Ok(())
    }

    async fn update_versioned(
        &self,
        record: &SecretRecord,
        expected_version: u64,
    ) -> VaultResult<bool> {
        let mut table = self.inner.write().await;

        if table
            .rows
            .values()
            .any(|r| r.id != record.id && r.owner_id == record.owner_id && r.name == record.name)
        {
            return Err(VaultError::NameNotUnique);
        }

        let Some(stored) = table.rows.get_mut(&record.id) else {
            return Ok(false);
        };
        if stored.version != expected_version {
            return Ok(false);
        }

        let owner_id = stored.owner_id;
        *stored = record.clone();
        stored.owner_id = owner_id;
        Ok(true)
    }

    async fn get(&self, id: u64) -> VaultResult<Option<SecretRecord>> {
        Ok(self.inner.read().await.rows.get(&id).cloned())
    }

    async fn get_by_owner(&self, id: u64, owner_id: u64) -> VaultResult<Option<SecretRecord>> {
        Ok(self
            .inner
            .read()
            .await
            .rows
            .get(&id)
            .filter(|r| r.owner_id == owner_id)
            .cloned())
    }

    async fn id_by_name(&self, owner_id: u64, name: &str) -> VaultResult<Option<u64>> {
        Ok(self
            .inner
            .read()
            .await
            .rows
            .values()
            .find(|r| r.owner_id == owner_id && r.name == name)
            .map(|r| r.id))
    }

    async fn list(&self, owner_id: u64) -> VaultResult<Vec<RecordSummary>> {
        let table = self.inner.read().await;
        let mut items: Vec<_> = table
            .rows
            .values()
            .filter(|r| r.owner_id == owner_id)
            .map(|r| RecordSummary {
                id: r.id,
                name: r.name.clone(),
            })
            .collect();
        items.sort_by_key(|s| s.id);
        Ok(items)
    }

    async fn delete(&self, id: u64) -> VaultResult<()> {
        self.inner.write().await.rows.remove(&id);
        Ok(())
    }
}

#[derive(Default)]
struct FileTable {
    next_id: u64,
    rows: HashMap<u64, FileAttachment>,
}

/// In-memory attachment metadata store.
#[derive(Clone, Default)]
pub struct MemoryFileStore {
    inner: Arc<RwLock<FileTable>>,
}

impl MemoryFileStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[tonic::async_trait]
impl FileRepository for MemoryFileStore {
    async fn insert(&self, file: &mut FileAttachment) -> VaultResult<()> {
        let mut table = self.inner.write().await;
        table.next_id += 1;
        file.id = table.next_id;
        table.rows.insert(file.id, file.clone());
        Ok(())
    }

    async fn update(&self, file: &FileAttachment) -> VaultResult<()> {
        let mut table = self.inner.write().await;
        match table.rows.get_mut(&file.id) {
            Some(stored) => {
                *stored = file.clone();
                Ok(())
            }
            None => Err(VaultError::Storage(format!(
                "file row {} does not exist",
                file.id
            ))),
        }
    }

    async fn get(&self, id: u64) -> VaultResult<Option<FileAttachment>> {
        Ok(self.inner.read().await.rows.get(&id).cloned())
    }

    async fn delete(&self, id: u64) -> VaultResult<()> {
        self.inner.write().await.rows.remove(&id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(owner: u64, name: &str, version: u64) -> SecretRecord {
        SecretRecord {
            owner_id: owner,
            name: name.into(),
            version,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_insert_assigns_increasing_ids() {
        let store = MemoryRecordStore::new();
        let mut a = record(1, "a", 1);
        let mut b = record(1, "b", 1);
        store.insert(&mut a).await.unwrap();
        store.insert(&mut b).await.unwrap();
        assert!(b.id > a.id);
    }

    #[tokio::test]
    async fn test_insert_enforces_name_index() {
        let store = MemoryRecordStore::new();
        store.insert(&mut record(1, "bank", 1)).await.unwrap();
        let err = store.insert(&mut record(1, "bank", 1)).await.unwrap_err();
        assert!(matches!(err, VaultError::NameNotUnique));
        // Same name for a different owner is fine
        store.insert(&mut record(2, "bank", 1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_cas_rejects_stale_version() {
        let store = MemoryRecordStore::new();
        let mut row = record(1, "bank", 1);
        store.insert(&mut row).await.unwrap();

        let mut updated = row.clone();
        updated.version = 2;
        assert!(store.update_versioned(&updated, 1).await.unwrap());

        // Second writer still holding version 1 loses
        let mut stale = row.clone();
        stale.version = 2;
        assert!(!store.update_versioned(&stale, 1).await.unwrap());
        assert_eq!(store.get(row.id).await.unwrap().unwrap().version, 2);
    }

    #[tokio::test]
    async fn test_cas_preserves_owner() {
        let store = MemoryRecordStore::new();
        let mut row = record(1, "bank", 1);
        store.insert(&mut row).await.unwrap();

        let mut hijacked = row.clone();
        hijacked.owner_id = 99;
        hijacked.version = 2;
        assert!(store.update_versioned(&hijacked, 1).await.unwrap());
        assert_eq!(store.get(row.id).await.unwrap().unwrap().owner_id, 1);
    }

    #[tokio::test]
    async fn test_get_by_owner_filters() {
        let store = MemoryRecordStore::new();
        let mut row = record(1, "bank", 1);
        store.insert(&mut row).await.unwrap();
        assert!(store.get_by_owner(row.id, 1).await.unwrap().is_some());
        assert!(store.get_by_owner(row.id, 2).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_file_store_roundtrip() {
        let store = MemoryFileStore::new();
        let mut file = FileAttachment {
            id: 0,
            name: "doc.pdf".into(),
            path: "/tmp/doc.pdf".into(),
        };
        store.insert(&mut file).await.unwrap();
        assert_eq!(store.get(file.id).await.unwrap().unwrap().name, "doc.pdf");
        store.delete(file.id).await.unwrap();
        assert!(store.get(file.id).await.unwrap().is_none());
    }
}
