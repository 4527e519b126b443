//! In-memory index and blob stores.
//!
//! Thread-safe via `Mutex`/`RwLock`. Used by tests and local runs; not
//! durable.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, RwLock};

use async_trait::async_trait;

use crate::codec;
use crate::error::{Error, Result};
use crate::model::{
    Precondition, QueryTag, StateTransition, Tag, WorkitemDocument, WorkitemIdentifier,
    WorkitemMetadataEntry, WorkitemState, extract_tag_values,
};
use crate::store::{BlobStore, IndexStore, QueryTagSource};

// ---------------------------------------------------------------------------
// Index
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct MemoryIndex {
    next_key: i64,
    entries: HashMap<(i32, String), WorkitemMetadataEntry>,
}

impl MemoryIndex {
    /// Look up an entry and check it still matches the expected state,
    /// transaction UID and watermark.
    fn matching_entry(
        &mut self,
        identifier: &WorkitemIdentifier,
        state: WorkitemState,
        transaction_uid: Option<&str>,
        watermark: i64,
    ) -> Result<&mut WorkitemMetadataEntry> {
        let key = (
            identifier.partition_key(),
            identifier.workitem_uid().to_string(),
        );
        let entry = self
            .entries
            .get_mut(&key)
            .ok_or_else(|| Error::NotFound(format!("workitem {identifier}")))?;
        if entry.state != state || entry.transaction_uid.as_deref() != transaction_uid {
            return Err(Error::Conflict(format!(
                "workitem {identifier} is {} but {state} was expected",
                entry.state
            )));
        }
        if entry.watermark != watermark {
            return Err(Error::Conflict(format!(
                "workitem {identifier} changed since it was read (watermark {} != {watermark})",
                entry.watermark
            )));
        }
        Ok(entry)
    }
}

/// Index store backed by a `HashMap`. Also serves a fixed query-tag set.
#[derive(Debug)]
pub struct MemoryIndexStore {
    inner: Mutex<MemoryIndex>,
    query_tags: Vec<QueryTag>,
}

impl Default for MemoryIndexStore {
    fn default() -> Self {
        Self::new(QueryTag::defaults())
    }
}

impl MemoryIndexStore {
    pub fn new(query_tags: Vec<QueryTag>) -> Self {
        Self {
            inner: Mutex::new(MemoryIndex::default()),
            query_tags,
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryIndex>> {
        self.inner
            .lock()
            .map_err(|_| Error::Other("memory index lock poisoned".to_string()))
    }

    pub fn contains(&self, partition_key: i32, workitem_uid: &str) -> bool {
        self.lock()
            .map(|index| {
                index
                    .entries
                    .contains_key(&(partition_key, workitem_uid.to_string()))
            })
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.lock().map(|index| index.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl IndexStore for MemoryIndexStore {
    async fn add_entry(
        &self,
        partition_key: i32,
        document: &WorkitemDocument,
        tags: &[QueryTag],
    ) -> Result<i64> {
        let uid = document
            .workitem_uid()
            .ok_or_else(|| Error::validation("workitem document has no workitem UID"))?
            .to_string();
        let state = document
            .procedure_step_state()?
            .unwrap_or(WorkitemState::Scheduled);

        let mut index = self.lock()?;
        let key = (partition_key, uid.clone());
        if index.entries.contains_key(&key) {
            return Err(Error::AlreadyExists(format!("{partition_key}/{uid}")));
        }

        index.next_key += 1;
        let workitem_key = index.next_key;
        index.entries.insert(
            key,
            WorkitemMetadataEntry {
                identifier: WorkitemIdentifier::new(uid, workitem_key, partition_key),
                state,
                transaction_uid: document.transaction_uid().map(str::to_string),
                tags: extract_tag_values(document, tags),
                watermark: 0,
            },
        );
        Ok(workitem_key)
    }

    async fn get_entry(
        &self,
        partition_key: i32,
        workitem_uid: &str,
    ) -> Result<WorkitemMetadataEntry> {
        self.lock()?
            .entries
            .get(&(partition_key, workitem_uid.to_string()))
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("workitem {partition_key}/{workitem_uid}")))
    }

    async fn delete_entry(&self, partition_key: i32, workitem_uid: &str) -> Result<()> {
        self.lock()?
            .entries
            .remove(&(partition_key, workitem_uid.to_string()));
        Ok(())
    }

    async fn update_state(
        &self,
        identifier: &WorkitemIdentifier,
        transition: &StateTransition,
    ) -> Result<()> {
        transition.validate()?;
        let mut index = self.lock()?;
        let entry = index.matching_entry(
            identifier,
            transition.expected_state,
            transition.expected_transaction_uid.as_deref(),
            transition.expected_watermark,
        )?;
        entry.state = transition.new_state;
        entry.transaction_uid = transition.new_transaction_uid.clone();
        entry.watermark += 1;
        if let Some((_, value)) = entry
            .tags
            .iter_mut()
            .find(|(tag, _)| *tag == Tag::PROCEDURE_STEP_STATE)
        {
            *value = transition.new_state.as_dicom_str().to_string();
        }
        Ok(())
    }

    async fn update_tags(
        &self,
        identifier: &WorkitemIdentifier,
        precondition: &Precondition,
        values: &[(Tag, String)],
    ) -> Result<i64> {
        let mut index = self.lock()?;
        let entry = index.matching_entry(
            identifier,
            precondition.state,
            precondition.transaction_uid.as_deref(),
            precondition.watermark,
        )?;
        let mut tags = values.to_vec();
        tags.sort_by_key(|(tag, _)| *tag);
        entry.tags = tags;
        entry.watermark += 1;
        Ok(entry.watermark)
    }
}

#[async_trait]
impl QueryTagSource for MemoryIndexStore {
    async fn get_query_tags(&self) -> Result<Vec<QueryTag>> {
        Ok(self.query_tags.clone())
    }
}

// ---------------------------------------------------------------------------
// Blob
// ---------------------------------------------------------------------------

/// Blob store holding encoded documents in a `HashMap`.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blobs: RwLock<HashMap<WorkitemIdentifier, Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, identifier: &WorkitemIdentifier) -> bool {
        self.blobs
            .read()
            .map(|blobs| blobs.contains_key(identifier))
            .unwrap_or(false)
    }

    /// Is any document stored for this workitem UID, whatever its key?
    pub fn contains_uid(&self, partition_key: i32, workitem_uid: &str) -> bool {
        self.blobs
            .read()
            .map(|blobs| {
                blobs.keys().any(|id| {
                    id.partition_key() == partition_key && id.workitem_uid() == workitem_uid
                })
            })
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.blobs.read().map(|blobs| blobs.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(
        &self,
        identifier: &WorkitemIdentifier,
        document: &WorkitemDocument,
    ) -> Result<()> {
        let bytes = codec::to_vec(document)?;
        self.blobs
            .write()
            .map_err(|_| Error::Other("memory blob lock poisoned".to_string()))?
            .insert(identifier.clone(), bytes);
        Ok(())
    }

    async fn get(&self, identifier: &WorkitemIdentifier) -> Result<WorkitemDocument> {
        let blobs = self
            .blobs
            .read()
            .map_err(|_| Error::Other("memory blob lock poisoned".to_string()))?;
        let bytes = blobs
            .get(identifier)
            .ok_or_else(|| Error::NotFound(format!("workitem document {identifier}")))?;
        codec::from_slice(bytes)
    }

    async fn delete(&self, identifier: &WorkitemIdentifier) -> Result<()> {
        self.blobs
            .write()
            .map_err(|_| Error::Other("memory blob lock poisoned".to_string()))?
            .remove(identifier);
        Ok(())
    }
}
