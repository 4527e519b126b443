//! Span helpers for workitem requests.

use tracing::Span;

/// Start a span for one workitem request.
///
/// `workitem.outcome` is declared empty and filled by [`record_outcome`].
pub fn start_workitem_span(operation: &str, partition_key: i32, workitem_uid: &str) -> Span {
    tracing::info_span!(
        "workitem.request",
        "workitem.operation" = operation,
        "workitem.partition" = partition_key,
        "workitem.uid" = workitem_uid,
        "workitem.outcome" = tracing::field::Empty,
    )
}

pub fn record_outcome(span: &Span, outcome: &str) {
    span.record("workitem.outcome", outcome);
}

/// Emit a state transition event scoped to `span`.
pub fn record_state_transition(span: &Span, from: &str, to: &str) {
    span.in_scope(|| {
        tracing::info!(from = from, to = to, "state_transition");
    });
}
