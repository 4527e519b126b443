//! Shared fixtures for the integration tests.
#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::Notify;

use workitem_rs::engine::{WorkitemOrchestrator, WorkitemService};
use workitem_rs::error::{Error, Result};
use workitem_rs::model::{
    Precondition, QueryTag, StateTransition, Tag, Vr, WorkitemDocument, WorkitemIdentifier,
    WorkitemMetadataEntry,
};
use workitem_rs::query_tags::QueryTagService;
use workitem_rs::response::BaseUrlResolver;
use workitem_rs::store::{
    BlobStore, IndexStore, MemoryBlobStore, MemoryIndexStore, QueryTagSource,
};

pub const PARTITION: i32 = 1;
pub const BASE_URL: &str = "http://localhost:8080";

pub fn workitem_uid(n: u32) -> String {
    format!("1.2.826.0.1.3680043.8.498.{n}")
}

pub fn transaction_uid(n: u32) -> String {
    format!("2.25.{n}")
}

/// A minimal schedulable workitem.
pub fn new_document(uid: &str) -> WorkitemDocument {
    let mut document = WorkitemDocument::new();
    document.set_string(Tag::AFFECTED_SOP_INSTANCE_UID, Vr::UI, uid);
    document.set_string(Tag::PATIENT_NAME, Vr::PN, "Doe^Jane");
    document.set_string(Tag::PATIENT_ID, Vr::LO, "PID-0001");
    document.set_string(Tag::PROCEDURE_STEP_LABEL, Vr::LO, "CT chest");
    document.set_string(Tag::SCHEDULED_PROCEDURE_STEP_PRIORITY, Vr::CS, "MEDIUM");
    document
}

pub fn update_document(values: &[(Tag, Vr, &str)]) -> WorkitemDocument {
    let mut document = WorkitemDocument::new();
    for (tag, vr, value) in values {
        document.set_string(*tag, *vr, *value);
    }
    document
}

/// A service over in-memory stores.
pub struct Fixture {
    pub index: Arc<MemoryIndexStore>,
    pub blob: Arc<FaultyBlobStore>,
    pub orchestrator: Arc<WorkitemOrchestrator>,
    pub service: WorkitemService,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_index(Arc::new(MemoryIndexStore::default()))
    }

    pub fn with_index(index: Arc<MemoryIndexStore>) -> Self {
        let blob = Arc::new(FaultyBlobStore::default());
        let tags = Arc::new(QueryTagService::new(index.clone()));
        let orchestrator = Arc::new(WorkitemOrchestrator::new(
            index.clone(),
            blob.clone(),
            tags,
        ));
        let service = WorkitemService::new(
            orchestrator.clone(),
            Arc::new(BaseUrlResolver::new(BASE_URL)),
        );
        Self {
            index,
            blob,
            orchestrator,
            service,
        }
    }

    pub async fn entry(&self, uid: &str) -> WorkitemMetadataEntry {
        self.index.get_entry(PARTITION, uid).await.unwrap()
    }

    /// Add a workitem and assert it succeeded.
    pub async fn add(&self, uid: &str) -> WorkitemMetadataEntry {
        let outcome = self
            .service
            .process_add(PARTITION, new_document(uid))
            .await
            .unwrap();
        assert!(outcome.is_success(), "add failed: {outcome:?}");
        self.entry(uid).await
    }

    /// Add a workitem and claim it with `txn`.
    pub async fn add_in_progress(&self, uid: &str, txn: &str) -> WorkitemMetadataEntry {
        self.add(uid).await;
        let outcome = self
            .service
            .process_change_state(
                PARTITION,
                uid,
                txn,
                workitem_rs::model::WorkitemState::InProgress,
            )
            .await
            .unwrap();
        assert!(outcome.is_success(), "claim failed: {outcome:?}");
        self.entry(uid).await
    }
}

// ---------------------------------------------------------------------------
// Fault injection
// ---------------------------------------------------------------------------

/// Memory blob store whose writes can be made to fail or hang.
#[derive(Default)]
pub struct FaultyBlobStore {
    pub inner: MemoryBlobStore,
    pub fail_put: AtomicBool,
    pub fail_get: AtomicBool,
    pub hang_put: AtomicBool,
    pub puts: AtomicUsize,
}

impl FaultyBlobStore {
    pub fn fail_puts(&self) {
        self.fail_put.store(true, Ordering::SeqCst);
    }

    pub fn hang_puts(&self) {
        self.hang_put.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl BlobStore for FaultyBlobStore {
    async fn put(&self, identifier: &WorkitemIdentifier, document: &WorkitemDocument) -> Result<()> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        if self.hang_put.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.fail_put.load(Ordering::SeqCst) {
            return Err(Error::Other("blob store unavailable".to_string()));
        }
        self.inner.put(identifier, document).await
    }

    async fn get(&self, identifier: &WorkitemIdentifier) -> Result<WorkitemDocument> {
        if self.fail_get.load(Ordering::SeqCst) {
            return Err(Error::Other("blob store unavailable".to_string()));
        }
        self.inner.get(identifier).await
    }

    async fn delete(&self, identifier: &WorkitemIdentifier) -> Result<()> {
        self.inner.delete(identifier).await
    }
}

/// Memory blob store that can hold one read until released, to force an
/// interleaving between two requests.
#[derive(Default)]
pub struct GatedBlobStore {
    pub inner: MemoryBlobStore,
    armed: AtomicBool,
    pub paused: Notify,
    release: Notify,
}

impl GatedBlobStore {
    /// Hold the next `get` after it has read the document.
    pub fn pause_next_get(&self) {
        self.armed.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.release.notify_one();
    }
}

#[async_trait]
impl BlobStore for GatedBlobStore {
    async fn put(&self, identifier: &WorkitemIdentifier, document: &WorkitemDocument) -> Result<()> {
        self.inner.put(identifier, document).await
    }

    async fn get(&self, identifier: &WorkitemIdentifier) -> Result<WorkitemDocument> {
        let document = self.inner.get(identifier).await;
        if self.armed.swap(false, Ordering::SeqCst) {
            self.paused.notify_one();
            self.release.notified().await;
        }
        document
    }

    async fn delete(&self, identifier: &WorkitemIdentifier) -> Result<()> {
        self.inner.delete(identifier).await
    }
}

/// Memory index store whose cleanup and conditional writes can be made to
/// fail.
#[derive(Default)]
pub struct FaultyIndexStore {
    pub inner: MemoryIndexStore,
    pub fail_delete: AtomicBool,
    pub fail_update_tags: AtomicBool,
    pub deletes: AtomicUsize,
}

#[async_trait]
impl IndexStore for FaultyIndexStore {
    async fn add_entry(
        &self,
        partition_key: i32,
        document: &WorkitemDocument,
        tags: &[QueryTag],
    ) -> Result<i64> {
        self.inner.add_entry(partition_key, document, tags).await
    }

    async fn get_entry(&self, partition_key: i32, workitem_uid: &str) -> Result<WorkitemMetadataEntry> {
        self.inner.get_entry(partition_key, workitem_uid).await
    }

    async fn delete_entry(&self, partition_key: i32, workitem_uid: &str) -> Result<()> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        if self.fail_delete.load(Ordering::SeqCst) {
            return Err(Error::Other("index cleanup failed".to_string()));
        }
        self.inner.delete_entry(partition_key, workitem_uid).await
    }

    async fn update_state(
        &self,
        identifier: &WorkitemIdentifier,
        transition: &StateTransition,
    ) -> Result<()> {
        self.inner.update_state(identifier, transition).await
    }

    async fn update_tags(
        &self,
        identifier: &WorkitemIdentifier,
        precondition: &Precondition,
        values: &[(Tag, String)],
    ) -> Result<i64> {
        if self.fail_update_tags.load(Ordering::SeqCst) {
            return Err(Error::Other("index unavailable".to_string()));
        }
        self.inner.update_tags(identifier, precondition, values).await
    }
}

/// Query tag source counting how often it is asked.
pub struct CountingTagSource {
    pub calls: AtomicUsize,
    pub tags: Vec<QueryTag>,
}

impl CountingTagSource {
    pub fn new(tags: Vec<QueryTag>) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            tags,
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl QueryTagSource for CountingTagSource {
    async fn get_query_tags(&self) -> Result<Vec<QueryTag>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.tags.clone())
    }
}
