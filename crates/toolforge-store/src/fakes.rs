//! In-memory fake for the storage trait (testing only)
//!
//! `MemoryToolStore` satisfies the `ToolStore` contract without touching the
//! filesystem.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::error::{StorageError, StorageResult};
use crate::storage_traits::{ToolId, ToolMetadata, ToolRecord, ToolStore};

/// In-memory tool store backed by a `HashMap<ToolId, ToolRecord>`.
#[derive(Debug, Default)]
pub struct MemoryToolStore {
    records: Mutex<HashMap<ToolId, ToolRecord>>,
}

impl MemoryToolStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn records(&self) -> MutexGuard<'_, HashMap<ToolId, ToolRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ToolStore for MemoryToolStore {
    fn insert(&self, record: &ToolRecord) -> StorageResult<()> {
        let mut records = self.records();
        if records.contains_key(record.id()) {
            return Err(StorageError::AlreadyExists {
                id: record.id().to_string(),
            });
        }
        records.insert(record.id().clone(), record.clone());
        Ok(())
    }

    fn save_metadata(&self, metadata: &ToolMetadata) -> StorageResult<()> {
        let mut records = self.records();
        let record = records
            .get_mut(&metadata.id)
            .ok_or_else(|| StorageError::NotFound {
                id: metadata.id.to_string(),
            })?;
        record.metadata = metadata.clone();
        Ok(())
    }

    fn load_metadata(&self, id: &ToolId) -> StorageResult<ToolMetadata> {
        self.records()
            .get(id)
            .map(|r| r.metadata.clone())
            .ok_or_else(|| StorageError::NotFound { id: id.to_string() })
    }

    fn load_source(&self, id: &ToolId) -> StorageResult<String> {
        self.records()
            .get(id)
            .map(|r| r.source.clone())
            .ok_or_else(|| StorageError::NotFound { id: id.to_string() })
    }

    fn list_metadata(&self) -> StorageResult<Vec<ToolMetadata>> {
        Ok(self.records().values().map(|r| r.metadata.clone()).collect())
    }
}
