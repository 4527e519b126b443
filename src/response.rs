//! Request outcomes and the caller-visible failure-code taxonomy.
//!
//! A [`ResponseBuilder`] records exactly one outcome per request. The
//! public status is derived from what was recorded, never tracked
//! separately.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, ErrorKind, Result};
use crate::model::Tag;

// ---------------------------------------------------------------------------
// Failure codes
// ---------------------------------------------------------------------------

/// Stable failure codes reported to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u16)]
pub enum FailureCode {
    ProcessingFailure = 0x0110,
    ValidationFailure = 0xA900,
    InstanceAlreadyExists = 0xB00E,
    UpdateNotAllowed = 0xC300,
    InstanceNotFound = 0xC307,
    UpdateConflict = 0xC30A,
}

impl FailureCode {
    pub fn code(self) -> u16 {
        self as u16
    }
}

impl fmt::Display for FailureCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} ({:#06X})", self, self.code())
    }
}

/// Error kind → failure code. Kinds not listed map to `ProcessingFailure`.
pub const FAILURE_CODES: &[(ErrorKind, FailureCode)] = &[
    (ErrorKind::NotFound, FailureCode::InstanceNotFound),
    (ErrorKind::AlreadyExists, FailureCode::InstanceAlreadyExists),
    (ErrorKind::Conflict, FailureCode::UpdateConflict),
    (ErrorKind::Validation, FailureCode::ValidationFailure),
    (ErrorKind::UpdateNotAllowed, FailureCode::UpdateNotAllowed),
];

pub fn failure_code_for(kind: ErrorKind) -> FailureCode {
    FAILURE_CODES
        .iter()
        .find(|(k, _)| *k == kind)
        .map(|(_, code)| *code)
        .unwrap_or(FailureCode::ProcessingFailure)
}

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Success,
    Warning,
    Failure,
}

/// The single result of a workitem request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    pub status: OutcomeStatus,
    pub failure_code: Option<FailureCode>,
    pub message: Option<String>,
    pub resource_url: Option<String>,
    /// Tags the request asked to change but that were left untouched.
    pub warning_tags: Vec<Tag>,
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        self.status != OutcomeStatus::Failure
    }
}

// ---------------------------------------------------------------------------
// URL resolution
// ---------------------------------------------------------------------------

/// Builds the retrieve URL returned for a created or updated workitem.
pub trait UrlResolver: Send + Sync {
    fn retrieve_workitem_url(&self, partition_key: i32, workitem_uid: &str) -> String;
}

/// `<base>/workitems/<uid>`, or `<base>/partitions/<key>/workitems/<uid>`
/// when partitioning is enabled.
#[derive(Debug, Clone)]
pub struct BaseUrlResolver {
    base_url: String,
    partitioned: bool,
}

impl BaseUrlResolver {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            partitioned: false,
        }
    }

    pub fn partitioned(mut self, partitioned: bool) -> Self {
        self.partitioned = partitioned;
        self
    }
}

impl UrlResolver for BaseUrlResolver {
    fn retrieve_workitem_url(&self, partition_key: i32, workitem_uid: &str) -> String {
        if self.partitioned {
            format!(
                "{}/partitions/{partition_key}/workitems/{workitem_uid}",
                self.base_url
            )
        } else {
            format!("{}/workitems/{workitem_uid}", self.base_url)
        }
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct Recorded {
    failure_code: Option<FailureCode>,
    warning: bool,
    message: String,
    warning_tags: Vec<Tag>,
}

/// Single-assignment outcome builder. One per request.
pub struct ResponseBuilder<'a> {
    url_resolver: &'a dyn UrlResolver,
    partition_key: i32,
    recorded: Option<Recorded>,
}

impl<'a> ResponseBuilder<'a> {
    pub fn new(url_resolver: &'a dyn UrlResolver, partition_key: i32) -> Self {
        Self {
            url_resolver,
            partition_key,
            recorded: None,
        }
    }

    pub fn is_recorded(&self) -> bool {
        self.recorded.is_some()
    }

    pub fn add_success(&mut self, message: impl Into<String>) -> Result<()> {
        self.record(Recorded {
            failure_code: None,
            warning: false,
            message: message.into(),
            warning_tags: Vec::new(),
        })
    }

    /// Success, but some requested changes were not applied.
    pub fn add_warning(&mut self, message: impl Into<String>, warning_tags: Vec<Tag>) -> Result<()> {
        self.record(Recorded {
            failure_code: None,
            warning: true,
            message: message.into(),
            warning_tags,
        })
    }

    pub fn add_failure(&mut self, code: FailureCode, message: impl Into<String>) -> Result<()> {
        self.record(Recorded {
            failure_code: Some(code),
            warning: false,
            message: message.into(),
            warning_tags: Vec::new(),
        })
    }

    fn record(&mut self, recorded: Recorded) -> Result<()> {
        if self.recorded.is_some() {
            return Err(Error::OutcomeAlreadyRecorded);
        }
        self.recorded = Some(recorded);
        Ok(())
    }

    pub fn build_add_response(self, workitem_uid: &str) -> Result<Outcome> {
        self.build(Some(workitem_uid))
    }

    pub fn build_update_response(self, workitem_uid: &str) -> Result<Outcome> {
        self.build(Some(workitem_uid))
    }

    pub fn build_cancel_response(self) -> Result<Outcome> {
        self.build(None)
    }

    fn build(self, workitem_uid: Option<&str>) -> Result<Outcome> {
        let recorded = self.recorded.ok_or(Error::OutcomeNotRecorded)?;

        let status = match (recorded.failure_code, recorded.warning) {
            (Some(_), _) => OutcomeStatus::Failure,
            (None, true) => OutcomeStatus::Warning,
            (None, false) => OutcomeStatus::Success,
        };
        let resource_url = match (recorded.failure_code, workitem_uid) {
            (None, Some(uid)) => Some(
                self.url_resolver
                    .retrieve_workitem_url(self.partition_key, uid),
            ),
            _ => None,
        };

        Ok(Outcome {
            status,
            failure_code: recorded.failure_code,
            message: Some(recorded.message).filter(|m| !m.is_empty()),
            resource_url,
            warning_tags: recorded.warning_tags,
        })
    }
}
