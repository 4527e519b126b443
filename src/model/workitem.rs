//! Workitem identity, lifecycle state, and index entries.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::model::document::{Tag, WorkitemDocument};

// ---------------------------------------------------------------------------
// Identifier
// ---------------------------------------------------------------------------

/// Identity of a workitem within a partition.
///
/// `workitem_key` is the index-assigned surrogate key; it is 0 until the
/// index insert succeeds.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkitemIdentifier {
    workitem_uid: String,
    workitem_key: i64,
    partition_key: i32,
}

impl WorkitemIdentifier {
    pub fn new(workitem_uid: impl Into<String>, workitem_key: i64, partition_key: i32) -> Self {
        Self {
            workitem_uid: workitem_uid.into(),
            workitem_key,
            partition_key,
        }
    }

    pub fn workitem_uid(&self) -> &str {
        &self.workitem_uid
    }

    pub fn workitem_key(&self) -> i64 {
        self.workitem_key
    }

    pub fn partition_key(&self) -> i32 {
        self.partition_key
    }
}

impl fmt::Display for WorkitemIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}#{}",
            self.partition_key, self.workitem_uid, self.workitem_key
        )
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Lifecycle state of a workitem (Procedure Step State).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkitemState {
    Scheduled,
    InProgress,
    Completed,
    Canceled,
}

impl WorkitemState {
    /// Can transition from self to `to`?
    pub fn can_transition_to(self, to: WorkitemState) -> bool {
        use WorkitemState::*;
        matches!(
            (self, to),
            (Scheduled, InProgress)
                | (Scheduled, Canceled) // cancel request before anyone claimed it
                | (InProgress, Completed)
                | (InProgress, Canceled)
        )
    }

    /// Is this a terminal state?
    pub fn is_terminal(self) -> bool {
        matches!(self, WorkitemState::Completed | WorkitemState::Canceled)
    }

    /// The DICOM code string for this state.
    pub fn as_dicom_str(self) -> &'static str {
        match self {
            WorkitemState::Scheduled => "SCHEDULED",
            WorkitemState::InProgress => "IN PROGRESS",
            WorkitemState::Completed => "COMPLETED",
            WorkitemState::Canceled => "CANCELED",
        }
    }
}

impl fmt::Display for WorkitemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorkitemState::Scheduled => "scheduled",
            WorkitemState::InProgress => "in_progress",
            WorkitemState::Completed => "completed",
            WorkitemState::Canceled => "canceled",
        };
        write!(f, "{s}")
    }
}

impl FromStr for WorkitemState {
    type Err = Error;

    /// Accepts both the DICOM code string and the snake_case form.
    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().replace('_', " ").as_str() {
            "SCHEDULED" => Ok(WorkitemState::Scheduled),
            "IN PROGRESS" => Ok(WorkitemState::InProgress),
            "COMPLETED" => Ok(WorkitemState::Completed),
            "CANCELED" => Ok(WorkitemState::Canceled),
            _ => Err(Error::validation(format!("unknown procedure step state: {s}"))),
        }
    }
}

impl WorkitemDocument {
    /// The Procedure Step State carried by the document, if any.
    pub fn procedure_step_state(&self) -> Result<Option<WorkitemState>> {
        self.get_string(Tag::PROCEDURE_STEP_STATE)
            .map(str::parse::<WorkitemState>)
            .transpose()
    }
}

// ---------------------------------------------------------------------------
// Index entry
// ---------------------------------------------------------------------------

/// What the metadata index knows about a workitem. Authoritative for
/// lifecycle state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkitemMetadataEntry {
    pub identifier: WorkitemIdentifier,
    pub state: WorkitemState,
    /// Present iff `state == InProgress`.
    pub transaction_uid: Option<String>,
    /// Indexed tag values, ordered by tag.
    pub tags: Vec<(Tag, String)>,
    /// Row version, advanced by every state or tag write. Stores that do
    /// not track it report 0.
    pub watermark: i64,
}

impl WorkitemMetadataEntry {
    /// The optimistic-concurrency precondition matching this entry.
    pub fn precondition(&self) -> Precondition {
        Precondition {
            state: self.state,
            transaction_uid: self.transaction_uid.clone(),
            watermark: self.watermark,
        }
    }
}

/// Expected stored state for a conditional index write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Precondition {
    pub state: WorkitemState,
    pub transaction_uid: Option<String>,
    pub watermark: i64,
}

impl Precondition {
    /// The same expectations at another row version.
    pub fn at_watermark(&self, watermark: i64) -> Self {
        Self {
            watermark,
            ..self.clone()
        }
    }
}

/// A conditional state change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateTransition {
    pub expected_state: WorkitemState,
    pub expected_transaction_uid: Option<String>,
    pub expected_watermark: i64,
    pub new_state: WorkitemState,
    pub new_transaction_uid: Option<String>,
}

impl StateTransition {
    /// Transition away from `entry`'s current state and transaction UID.
    pub fn from_entry(
        entry: &WorkitemMetadataEntry,
        new_state: WorkitemState,
        new_transaction_uid: Option<String>,
    ) -> Self {
        Self {
            expected_state: entry.state,
            expected_transaction_uid: entry.transaction_uid.clone(),
            expected_watermark: entry.watermark,
            new_state,
            new_transaction_uid,
        }
    }

    /// Reject transitions the lifecycle forbids and transaction UIDs that
    /// would break "set iff in progress".
    pub fn validate(&self) -> Result<()> {
        if !self.expected_state.can_transition_to(self.new_state) {
            return Err(Error::InvalidTransition {
                from: self.expected_state,
                to: self.new_state,
            });
        }
        let has_uid = self
            .new_transaction_uid
            .as_deref()
            .is_some_and(|uid| !uid.is_empty());
        if has_uid != (self.new_state == WorkitemState::InProgress) {
            return Err(Error::validation(format!(
                "transaction UID must be set exactly when the workitem is in progress (target {})",
                self.new_state
            )));
        }
        Ok(())
    }
}
