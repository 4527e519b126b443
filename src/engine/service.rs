//! Request handling: validate, orchestrate, and turn the result into one
//! [`Outcome`].
//!
//! Business failures (not found, validation, illegal transition, lost
//! race) become failure outcomes. `Err` is reserved for programming errors
//! in outcome recording.

use std::sync::Arc;
use std::time::Instant;

use opentelemetry::KeyValue;
use tracing::{Instrument, info, warn};

use crate::engine::orchestrator::WorkitemOrchestrator;
use crate::engine::validation::{validate_add_document, validate_update_request};
use crate::error::{Error, ErrorKind, Result};
use crate::model::{Tag, Vr, WorkitemDocument, WorkitemMetadataEntry, WorkitemState};
use crate::response::{FailureCode, Outcome, OutcomeStatus, ResponseBuilder, UrlResolver};
use crate::telemetry::metrics;
use crate::telemetry::workitem::{record_outcome, start_workitem_span};

pub struct WorkitemService {
    orchestrator: Arc<WorkitemOrchestrator>,
    url_resolver: Arc<dyn UrlResolver>,
}

impl WorkitemService {
    pub fn new(orchestrator: Arc<WorkitemOrchestrator>, url_resolver: Arc<dyn UrlResolver>) -> Self {
        Self {
            orchestrator,
            url_resolver,
        }
    }

    pub fn orchestrator(&self) -> &WorkitemOrchestrator {
        &self.orchestrator
    }

    /// Create a workitem.
    pub async fn process_add(
        &self,
        partition_key: i32,
        mut document: WorkitemDocument,
    ) -> Result<Outcome> {
        let uid = document.workitem_uid().unwrap_or_default().to_string();
        let span = start_workitem_span("add", partition_key, &uid);
        let started = Instant::now();

        let outcome = async {
            let mut response = ResponseBuilder::new(self.url_resolver.as_ref(), partition_key);

            if let Err(e) = validate_add_document(&document) {
                info!(error = %e, "add rejected by validation");
                response.add_failure(e.failure_code(), e.to_string())?;
                return response.build_add_response(&uid);
            }
            if !document.contains(Tag::PROCEDURE_STEP_STATE) {
                document.set_string(
                    Tag::PROCEDURE_STEP_STATE,
                    Vr::CS,
                    WorkitemState::Scheduled.as_dicom_str(),
                );
            }

            match self.orchestrator.add_workitem(partition_key, document).await {
                Ok(identifier) => {
                    info!(workitem = %identifier, "workitem added");
                    response.add_success(String::new())?;
                }
                Err(e) => {
                    let code = add_failure_code(&e);
                    warn!(error = %e, failure_code = %code, "failed to add workitem");
                    response.add_failure(code, e.to_string())?;
                }
            }
            response.build_add_response(&uid)
        }
        .instrument(span.clone())
        .await?;

        finish("add", &span, started, &outcome);
        Ok(outcome)
    }

    /// Update the attributes of a scheduled or in-progress workitem.
    pub async fn process_update(
        &self,
        partition_key: i32,
        document: WorkitemDocument,
        workitem_uid: &str,
        transaction_uid: Option<&str>,
    ) -> Result<Outcome> {
        let span = start_workitem_span("update", partition_key, workitem_uid);
        let started = Instant::now();

        let outcome = async {
            let mut response = ResponseBuilder::new(self.url_resolver.as_ref(), partition_key);

            let Some(entry) = self
                .lookup(partition_key, workitem_uid, &mut response)
                .await?
            else {
                return response.build_update_response(workitem_uid);
            };

            if let Err(e) = validate_update_request(&document, &entry, transaction_uid) {
                let code = e.failure_code();
                info!(error = %e, failure_code = %code, "update rejected by validation");
                response.add_failure(code, e.to_string())?;
                return response.build_update_response(workitem_uid);
            }

            match self.orchestrator.update_workitem(&document, &entry).await {
                Ok(ignored) if !ignored.is_empty() => {
                    let listed = ignored
                        .iter()
                        .map(Tag::to_string)
                        .collect::<Vec<_>>()
                        .join(", ");
                    info!(ignored = %listed, "workitem updated with modifications");
                    response.add_warning(
                        format!(
                            "The workitem was updated with modifications. The following tags were not updated: {listed}"
                        ),
                        ignored,
                    )?;
                }
                Ok(_) => {
                    info!("workitem updated");
                    response.add_success(String::new())?;
                }
                Err(e) => {
                    let code = update_failure_code(&e);
                    warn!(error = %e, failure_code = %code, "failed to update workitem");
                    response.add_failure(code, e.to_string())?;
                }
            }
            response.build_update_response(workitem_uid)
        }
        .instrument(span.clone())
        .await?;

        finish("update", &span, started, &outcome);
        Ok(outcome)
    }

    /// Cancel a workitem. A reason, if given, is merged into the stored
    /// document after the state change; failing to store it downgrades the
    /// outcome to a warning rather than undoing the cancel.
    pub async fn process_cancel(
        &self,
        partition_key: i32,
        workitem_uid: &str,
        reason: Option<&str>,
    ) -> Result<Outcome> {
        let span = start_workitem_span("cancel", partition_key, workitem_uid);
        let started = Instant::now();

        let outcome = async {
            let mut response = ResponseBuilder::new(self.url_resolver.as_ref(), partition_key);

            let identifier = match self
                .orchestrator
                .cancel_workitem(partition_key, workitem_uid)
                .await
            {
                Ok(identifier) => identifier,
                Err(e) => {
                    let code = e.failure_code();
                    warn!(error = %e, failure_code = %code, "failed to cancel workitem");
                    response.add_failure(code, e.to_string())?;
                    return response.build_cancel_response();
                }
            };

            match reason.filter(|r| !r.trim().is_empty()) {
                None => response.add_success(String::new())?,
                Some(reason) => match self
                    .orchestrator
                    .store_cancellation_reason(&identifier, reason)
                    .await
                {
                    Ok(_) => response.add_success(String::new())?,
                    Err(e) => {
                        warn!(error = %e, workitem = %identifier, "canceled but reason not stored");
                        response.add_warning(
                            format!("The workitem was canceled but the cancellation reason was not stored: {e}"),
                            vec![Tag::REASON_FOR_CANCELLATION],
                        )?;
                    }
                },
            }
            response.build_cancel_response()
        }
        .instrument(span.clone())
        .await?;

        finish("cancel", &span, started, &outcome);
        Ok(outcome)
    }

    /// Claim, complete or cancel an in-flight workitem.
    pub async fn process_change_state(
        &self,
        partition_key: i32,
        workitem_uid: &str,
        transaction_uid: &str,
        target: WorkitemState,
    ) -> Result<Outcome> {
        let span = start_workitem_span("change_state", partition_key, workitem_uid);
        let started = Instant::now();

        let outcome = async {
            let mut response = ResponseBuilder::new(self.url_resolver.as_ref(), partition_key);

            let Some(entry) = self
                .lookup(partition_key, workitem_uid, &mut response)
                .await?
            else {
                return response.build_update_response(workitem_uid);
            };

            if let Err(e) = validate_state_change(&entry, target, transaction_uid) {
                let code = e.failure_code();
                info!(error = %e, failure_code = %code, "state change rejected");
                response.add_failure(code, e.to_string())?;
                return response.build_update_response(workitem_uid);
            }

            match self
                .orchestrator
                .change_workitem_state(&entry, target, transaction_uid)
                .await
            {
                Ok(()) => response.add_success(String::new())?,
                Err(e) => {
                    let code = update_failure_code(&e);
                    warn!(error = %e, failure_code = %code, "failed to change workitem state");
                    response.add_failure(code, e.to_string())?;
                }
            }
            response.build_update_response(workitem_uid)
        }
        .instrument(span.clone())
        .await?;

        finish("change_state", &span, started, &outcome);
        Ok(outcome)
    }

    /// The stored document for a workitem, with its current state.
    pub async fn retrieve(&self, partition_key: i32, workitem_uid: &str) -> Result<WorkitemDocument> {
        let span = start_workitem_span("retrieve", partition_key, workitem_uid);
        self.orchestrator
            .retrieve_workitem(partition_key, workitem_uid)
            .instrument(span)
            .await
    }

    /// Fetch the index entry, recording the failure outcome if it can't be
    /// loaded.
    async fn lookup(
        &self,
        partition_key: i32,
        workitem_uid: &str,
        response: &mut ResponseBuilder<'_>,
    ) -> Result<Option<WorkitemMetadataEntry>> {
        match self
            .orchestrator
            .get_workitem_metadata(partition_key, workitem_uid)
            .await
        {
            Ok(entry) => Ok(Some(entry)),
            Err(e) => {
                let code = e.failure_code();
                if e.kind() == ErrorKind::NotFound {
                    info!(workitem_uid, "workitem not found");
                } else {
                    warn!(error = %e, "failed to load workitem metadata");
                }
                response.add_failure(code, e.to_string())?;
                Ok(None)
            }
        }
    }
}

/// Rules for an explicit state change request.
pub fn validate_state_change(
    entry: &WorkitemMetadataEntry,
    target: WorkitemState,
    transaction_uid: &str,
) -> Result<()> {
    if transaction_uid.trim().is_empty() {
        return Err(Error::validation("a transaction UID is required to change state"));
    }
    if !crate::model::is_valid_uid(transaction_uid) {
        return Err(Error::validation(format!(
            "invalid transaction UID: {transaction_uid}"
        )));
    }
    match entry.state {
        WorkitemState::Scheduled if target == WorkitemState::InProgress => Ok(()),
        WorkitemState::InProgress if entry.transaction_uid.as_deref() != Some(transaction_uid) => {
            Err(Error::validation(format!(
                "transaction UID does not match workitem {}",
                entry.identifier.workitem_uid()
            )))
        }
        WorkitemState::InProgress if entry.state.can_transition_to(target) => Ok(()),
        from => Err(Error::InvalidTransition { from, to: target }),
    }
}

/// Add maps a lost insert race to its own code; everything unexpected is a
/// processing failure.
fn add_failure_code(error: &Error) -> FailureCode {
    match error.kind() {
        ErrorKind::AlreadyExists | ErrorKind::Validation => error.failure_code(),
        _ => FailureCode::ProcessingFailure,
    }
}

/// Failures raised while applying a validated update or state change.
fn update_failure_code(error: &Error) -> FailureCode {
    match error.kind() {
        ErrorKind::Conflict | ErrorKind::NotFound | ErrorKind::UpdateNotAllowed => {
            error.failure_code()
        }
        _ => FailureCode::ProcessingFailure,
    }
}

fn finish(operation: &'static str, span: &tracing::Span, started: Instant, outcome: &Outcome) {
    let result = match (outcome.status, outcome.failure_code) {
        (OutcomeStatus::Success, _) => "ok".to_string(),
        (OutcomeStatus::Warning, _) => "warning".to_string(),
        (OutcomeStatus::Failure, Some(code)) => format!("{code:?}"),
        (OutcomeStatus::Failure, None) => "failure".to_string(),
    };
    record_outcome(span, &result);
    metrics::workitem_operations().add(
        1,
        &[
            KeyValue::new("operation", operation),
            KeyValue::new("result", result),
        ],
    );
    metrics::operation_duration_ms().record(
        started.elapsed().as_secs_f64() * 1000.0,
        &[KeyValue::new("operation", operation)],
    );
}
