//! Keeps the metadata index and the blob store consistent.
//!
//! The index is written first and is the source of truth for identity and
//! lifecycle state; the blob store follows. When the second write fails,
//! the first is compensated through a [`Saga`].

use std::sync::Arc;

use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use tracing::{debug, info};

use crate::engine::saga::Saga;
use crate::engine::validation::UpdatePolicy;
use crate::error::{Error, Result};
use crate::model::{
    StateTransition, Tag, Vr, WorkitemDocument, WorkitemIdentifier, WorkitemMetadataEntry,
    WorkitemState, extract_tag_values,
};
use crate::query_tags::QueryTagService;
use crate::store::{BlobStore, IndexStore};
use crate::telemetry::metrics;
use crate::telemetry::workitem::record_state_transition;

pub struct WorkitemOrchestrator {
    index: Arc<dyn IndexStore>,
    blob: Arc<dyn BlobStore>,
    query_tags: Arc<QueryTagService>,
    policy: UpdatePolicy,
}

impl WorkitemOrchestrator {
    pub fn new(
        index: Arc<dyn IndexStore>,
        blob: Arc<dyn BlobStore>,
        query_tags: Arc<QueryTagService>,
    ) -> Self {
        Self {
            index,
            blob,
            query_tags,
            policy: UpdatePolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: UpdatePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn query_tags(&self) -> &QueryTagService {
        &self.query_tags
    }

    /// Index the workitem, then store its document.
    ///
    /// If the index insert fails nothing was written and the error is
    /// returned as is. If storing the document fails the index entry is
    /// deleted again before the blob error is returned.
    pub async fn add_workitem(
        &self,
        partition_key: i32,
        mut document: WorkitemDocument,
    ) -> Result<WorkitemIdentifier> {
        let uid = document
            .workitem_uid()
            .ok_or_else(|| Error::validation("workitem document has no workitem UID"))?
            .to_string();
        let tags = self.query_tags.get_tags().await?;

        let mut saga = Saga::new("add_workitem");
        let index = Arc::clone(&self.index);
        let cleanup_uid = uid.clone();
        let workitem_key = saga
            .step(
                "delete index entry",
                self.index.add_entry(partition_key, &document, &tags),
                move || async move { index.delete_entry(partition_key, &cleanup_uid).await },
            )
            .await?;

        document.set_string(Tag::REQUESTED_SOP_INSTANCE_UID, Vr::UI, uid.as_str());
        let identifier = WorkitemIdentifier::new(uid, workitem_key, partition_key);

        saga.finish(self.blob.put(&identifier, &document)).await?;
        debug!(workitem = %identifier, "workitem stored");
        Ok(identifier)
    }

    pub async fn get_workitem_metadata(
        &self,
        partition_key: i32,
        workitem_uid: &str,
    ) -> Result<WorkitemMetadataEntry> {
        self.index.get_entry(partition_key, workitem_uid).await
    }

    /// The stored document with the index's lifecycle state applied. The
    /// transaction UID is never handed out.
    pub async fn retrieve_workitem(
        &self,
        partition_key: i32,
        workitem_uid: &str,
    ) -> Result<WorkitemDocument> {
        let entry = self.index.get_entry(partition_key, workitem_uid).await?;
        let mut document = self.blob.get(&entry.identifier).await?;
        document.set_string(Tag::PROCEDURE_STEP_STATE, Vr::CS, entry.state.as_dicom_str());
        document.remove(Tag::TRANSACTION_UID);
        Ok(document)
    }

    /// Move a scheduled or in-progress workitem to CANCELED.
    ///
    /// Checks the stored document exists before touching the index so a
    /// missing document fails the cancel without a state change. The state
    /// change is conditional on the entry's watermark, so an update that
    /// lands in between surfaces as `Error::Conflict`. The cancellation
    /// reason is not merged here; see [`Self::store_cancellation_reason`].
    pub async fn cancel_workitem(
        &self,
        partition_key: i32,
        workitem_uid: &str,
    ) -> Result<WorkitemIdentifier> {
        let entry = self.index.get_entry(partition_key, workitem_uid).await?;
        if !entry.state.can_transition_to(WorkitemState::Canceled) {
            return Err(Error::InvalidTransition {
                from: entry.state,
                to: WorkitemState::Canceled,
            });
        }

        self.blob.get(&entry.identifier).await?;

        let transition = StateTransition::from_entry(&entry, WorkitemState::Canceled, None);
        self.index
            .update_state(&entry.identifier, &transition)
            .await?;
        record_transition(entry.state, WorkitemState::Canceled);
        info!(workitem = %entry.identifier, from = %entry.state, "workitem canceled");

        Ok(entry.identifier)
    }

    /// Merge a cancellation reason into the stored document. The document
    /// is read after the state change, so it carries every update that
    /// committed before the cancel.
    pub async fn store_cancellation_reason(
        &self,
        identifier: &WorkitemIdentifier,
        reason: &str,
    ) -> Result<WorkitemDocument> {
        let mut document = self.blob.get(identifier).await?;
        document.set_string(
            Tag::PROCEDURE_STEP_STATE,
            Vr::CS,
            WorkitemState::Canceled.as_dicom_str(),
        );
        merge_cancellation_reason(&mut document, reason, Utc::now());
        self.blob.put(identifier, &document).await?;
        Ok(document)
    }

    /// Apply an update to an already validated workitem.
    ///
    /// Returns the tags the update asked to change but the policy kept
    /// unchanged. The index write is conditional on `entry`'s state,
    /// transaction UID and watermark, so a concurrent cancel or state
    /// change surfaces as `Error::Conflict`.
    pub async fn update_workitem(
        &self,
        update: &WorkitemDocument,
        entry: &WorkitemMetadataEntry,
    ) -> Result<Vec<Tag>> {
        let current = self.blob.get(&entry.identifier).await?;
        let (mut merged, ignored) = self.policy.merge(&current, update, entry.state);
        merged.set_string(Tag::PROCEDURE_STEP_STATE, Vr::CS, entry.state.as_dicom_str());

        let tags = self.query_tags.get_tags().await?;
        let values = extract_tag_values(&merged, &tags);
        let precondition = entry.precondition();

        let watermark = self
            .index
            .update_tags(&entry.identifier, &precondition, &values)
            .await?;

        let mut saga = Saga::new("update_workitem");
        let index = Arc::clone(&self.index);
        let identifier = entry.identifier.clone();
        let restore_precondition = precondition.at_watermark(watermark);
        let previous = entry.tags.clone();
        saga.register("restore index tag values", move || async move {
            index
                .update_tags(&identifier, &restore_precondition, &previous)
                .await
                .map(drop)
        });

        saga.finish(self.blob.put(&entry.identifier, &merged))
            .await?;
        debug!(workitem = %entry.identifier, ignored = ignored.len(), "workitem updated");
        Ok(ignored)
    }

    /// Conditionally move a workitem to `target`.
    ///
    /// Claiming (`SCHEDULED → IN PROGRESS`) records `transaction_uid`;
    /// leaving IN PROGRESS clears it.
    pub async fn change_workitem_state(
        &self,
        entry: &WorkitemMetadataEntry,
        target: WorkitemState,
        transaction_uid: &str,
    ) -> Result<()> {
        let new_transaction_uid =
            (target == WorkitemState::InProgress).then(|| transaction_uid.to_string());
        let transition = StateTransition::from_entry(entry, target, new_transaction_uid);
        transition.validate()?;
        self.index
            .update_state(&entry.identifier, &transition)
            .await?;
        record_transition(entry.state, target);
        info!(workitem = %entry.identifier, from = %entry.state, to = %target, "workitem state changed");
        Ok(())
    }
}

fn record_transition(from: WorkitemState, to: WorkitemState) {
    record_state_transition(
        &tracing::Span::current(),
        from.as_dicom_str(),
        to.as_dicom_str(),
    );
    metrics::state_transitions().add(
        1,
        &[
            KeyValue::new("from", from.to_string()),
            KeyValue::new("to", to.to_string()),
        ],
    );
}

/// Write the cancellation reason and time into a workitem document.
pub fn merge_cancellation_reason(document: &mut WorkitemDocument, reason: &str, at: DateTime<Utc>) {
    document.set_string(Tag::REASON_FOR_CANCELLATION, Vr::LT, reason);
    document.set_string(
        Tag::PROCEDURE_STEP_CANCELLATION_DATE_TIME,
        Vr::DT,
        at.format("%Y%m%d%H%M%S%.6f%z").to_string(),
    );
}
