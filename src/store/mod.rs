//! Store contracts consumed by the orchestrator.
//!
//! The metadata index and the blob store are independent failure domains.
//! Nothing here links them transactionally; keeping them consistent is the
//! orchestrator's job.

pub mod catalog;
pub mod fs;
pub mod memory;

use async_trait::async_trait;

use crate::error::Result;
use crate::model::{
    Precondition, QueryTag, SchemaVersion, StateTransition, Tag, WorkitemDocument,
    WorkitemIdentifier, WorkitemMetadataEntry,
};

pub use catalog::TomlQueryTagSource;
pub use fs::FsBlobStore;
pub use memory::{MemoryBlobStore, MemoryIndexStore};

/// Queryable source of truth for workitem identity, state and tag values.
#[async_trait]
pub trait IndexStore: Send + Sync {
    /// Insert the index entry for `document`. Returns the assigned key.
    ///
    /// Returns `Error::AlreadyExists` if `(partition_key, workitem_uid)` is
    /// already indexed.
    async fn add_entry(
        &self,
        partition_key: i32,
        document: &WorkitemDocument,
        tags: &[QueryTag],
    ) -> Result<i64>;

    /// Returns `Error::NotFound` if absent.
    async fn get_entry(&self, partition_key: i32, workitem_uid: &str)
    -> Result<WorkitemMetadataEntry>;

    /// Succeeds even if the entry doesn't exist (idempotent).
    async fn delete_entry(&self, partition_key: i32, workitem_uid: &str) -> Result<()>;

    /// Conditional state change. Returns `Error::Conflict` if the stored
    /// state, transaction UID or watermark no longer match the
    /// transition's expectations, `Error::NotFound` if the entry is gone.
    ///
    /// An indexed ProcedureStepState value follows the new state.
    async fn update_state(
        &self,
        identifier: &WorkitemIdentifier,
        transition: &StateTransition,
    ) -> Result<()>;

    /// Conditional replacement of the indexed tag values. Same error
    /// semantics as [`IndexStore::update_state`]. Returns the entry's new
    /// watermark.
    async fn update_tags(
        &self,
        identifier: &WorkitemIdentifier,
        precondition: &Precondition,
        values: &[(Tag, String)],
    ) -> Result<i64>;
}

/// Durable home of the full workitem document.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, identifier: &WorkitemIdentifier, document: &WorkitemDocument)
    -> Result<()>;

    /// Returns `Error::NotFound` if no document is stored.
    async fn get(&self, identifier: &WorkitemIdentifier) -> Result<WorkitemDocument>;

    /// Succeeds even if nothing is stored (idempotent).
    async fn delete(&self, identifier: &WorkitemIdentifier) -> Result<()>;
}

/// Supplies the set of indexable tags.
#[async_trait]
pub trait QueryTagSource: Send + Sync {
    async fn get_query_tags(&self) -> Result<Vec<QueryTag>>;
}

/// Reports the schema version currently deployed in the metadata store.
#[async_trait]
pub trait SchemaVersionProbe: Send + Sync {
    async fn current_version(&self) -> Result<SchemaVersion>;
}
