//! Request validation: payload checks, the update state gate, and the
//! policy deciding which attributes an update may touch.

use crate::error::{Error, Result};
use crate::model::{
    Tag, Vr, WorkitemDocument, WorkitemMetadataEntry, WorkitemState, is_valid_uid,
};
use crate::response::FailureCode;

/// Every UI element must carry well-formed UIDs.
fn validate_uid_elements(document: &WorkitemDocument) -> Result<()> {
    for (tag, element) in document.iter().filter(|(_, e)| e.vr == Vr::UI) {
        for value in &element.values {
            let valid = value.as_str().is_some_and(is_valid_uid);
            if !valid {
                return Err(Error::validation(format!(
                    "attribute {tag} does not hold a valid UID: {value}"
                )));
            }
        }
    }
    Ok(())
}

/// Checks a workitem document submitted for creation.
pub fn validate_add_document(document: &WorkitemDocument) -> Result<()> {
    let uid = document
        .workitem_uid()
        .ok_or_else(|| Error::validation("AffectedSOPInstanceUID (0000,1000) is required"))?;
    if !is_valid_uid(uid) {
        return Err(Error::validation(format!("invalid workitem UID: {uid}")));
    }
    if document.contains(Tag::TRANSACTION_UID) {
        return Err(Error::validation(
            "TransactionUID (0008,1195) must not be present when creating a workitem",
        ));
    }
    match document.procedure_step_state()? {
        None | Some(WorkitemState::Scheduled) => {}
        Some(other) => {
            return Err(Error::validation(format!(
                "a new workitem must be SCHEDULED, not {}",
                other.as_dicom_str()
            )));
        }
    }
    validate_uid_elements(document)
}

/// The lifecycle gate for updates.
///
/// Checked in order, first violation wins:
/// 1. a scheduled workitem must not be given a transaction UID;
/// 2. an in-progress workitem requires its own transaction UID;
/// 3. completed and canceled workitems are frozen.
pub fn validate_state_and_transaction_uid(
    transaction_uid: Option<&str>,
    entry: &WorkitemMetadataEntry,
) -> Result<()> {
    let supplied = transaction_uid.filter(|uid| !uid.trim().is_empty());
    match entry.state {
        WorkitemState::Scheduled => match supplied {
            None => Ok(()),
            Some(_) => Err(Error::validation(format!(
                "workitem {} is SCHEDULED; a transaction UID must not be supplied",
                entry.identifier.workitem_uid()
            ))),
        },
        WorkitemState::InProgress => {
            if supplied.is_some() && supplied == entry.transaction_uid.as_deref() {
                Ok(())
            } else {
                Err(Error::validation(format!(
                    "transaction UID does not match workitem {}",
                    entry.identifier.workitem_uid()
                )))
            }
        }
        WorkitemState::Completed | WorkitemState::Canceled => {
            Err(Error::UpdateNotAllowed(format!(
                "workitem {} is {}",
                entry.identifier.workitem_uid(),
                entry.state.as_dicom_str()
            )))
        }
    }
}

/// Checks the attributes of an update payload.
pub fn validate_update_document(document: &WorkitemDocument) -> Result<()> {
    if document.is_empty() {
        return Err(Error::validation("update contains no attributes"));
    }
    if document.contains(Tag::PROCEDURE_STEP_STATE) {
        return Err(Error::Validation {
            code: FailureCode::UpdateNotAllowed,
            message: "ProcedureStepState (0074,1000) cannot be changed by an update".to_string(),
        });
    }
    if document.contains(Tag::TRANSACTION_UID) {
        return Err(Error::validation(
            "TransactionUID (0008,1195) belongs in the request, not the payload",
        ));
    }
    validate_uid_elements(document)
}

/// Full update check: the state gate first, then the payload.
pub fn validate_update_request(
    document: &WorkitemDocument,
    entry: &WorkitemMetadataEntry,
    transaction_uid: Option<&str>,
) -> Result<()> {
    validate_state_and_transaction_uid(transaction_uid, entry)?;
    validate_update_document(document)
}

// ---------------------------------------------------------------------------
// Update policy
// ---------------------------------------------------------------------------

/// Which attributes an update may change.
#[derive(Debug, Clone)]
pub struct UpdatePolicy {
    /// Never changed by an update.
    protected: Vec<Tag>,
    /// Only changed while the workitem is still scheduled.
    scheduled_only: Vec<Tag>,
}

impl Default for UpdatePolicy {
    fn default() -> Self {
        Self {
            protected: vec![
                Tag::AFFECTED_SOP_INSTANCE_UID,
                Tag::REQUESTED_SOP_INSTANCE_UID,
                Tag::SOP_CLASS_UID,
                Tag::SOP_INSTANCE_UID,
            ],
            scheduled_only: vec![
                Tag::SCHEDULED_PROCEDURE_STEP_START_DATE_TIME,
                Tag::SCHEDULED_PROCEDURE_STEP_PRIORITY,
            ],
        }
    }
}

impl UpdatePolicy {
    pub fn new(protected: Vec<Tag>, scheduled_only: Vec<Tag>) -> Self {
        Self {
            protected,
            scheduled_only,
        }
    }

    pub fn is_allowed(&self, tag: Tag, state: WorkitemState) -> bool {
        if self.protected.contains(&tag) {
            return false;
        }
        state == WorkitemState::Scheduled || !self.scheduled_only.contains(&tag)
    }

    /// Apply `update` on top of `current`. Returns the merged document and
    /// the tags that were requested but ignored, in tag order.
    pub fn merge(
        &self,
        current: &WorkitemDocument,
        update: &WorkitemDocument,
        state: WorkitemState,
    ) -> (WorkitemDocument, Vec<Tag>) {
        let mut merged = current.clone();
        let mut ignored = Vec::new();
        for (tag, element) in update.iter() {
            if self.is_allowed(tag, state) {
                merged.insert(tag, element.clone());
            } else {
                ignored.push(tag);
            }
        }
        (merged, ignored)
    }
}
