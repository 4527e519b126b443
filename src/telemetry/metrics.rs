//! Metric instrument factories.
//!
//! Instruments come from the `"workitem-rs"` meter of the globally
//! registered `MeterProvider`; without one they are no-ops.

use opentelemetry::metrics::{Counter, Histogram, Meter};

fn meter() -> Meter {
    opentelemetry::global::meter("workitem-rs")
}

/// Counter: orchestrated workitem operations.
/// Labels: `operation` ("add" | "cancel" | "update" | "change_state"),
/// `result` ("ok" | "warning" | failure code name).
pub fn workitem_operations() -> Counter<u64> {
    meter()
        .u64_counter("workitem.operations")
        .with_description("Number of workitem operations by result")
        .build()
}

/// Counter: workitem state transitions committed to the index.
/// Labels: `from`, `to`.
pub fn state_transitions() -> Counter<u64> {
    meter()
        .u64_counter("workitem.state_transitions")
        .with_description("Number of workitem state transitions")
        .build()
}

/// Counter: saga compensations run after a partial failure.
/// Labels: `saga`, `result` ("ok" | "error").
pub fn compensations() -> Counter<u64> {
    meter()
        .u64_counter("workitem.compensations")
        .with_description("Number of compensating actions executed")
        .build()
}

/// Counter: metadata store schema resolutions.
/// Labels: `version`.
pub fn schema_resolutions() -> Counter<u64> {
    meter()
        .u64_counter("workitem.schema.resolutions")
        .with_description("Number of index schema version resolutions")
        .build()
}

/// Histogram: operation duration in milliseconds.
/// Labels: `operation`.
pub fn operation_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("workitem.operation.duration_ms")
        .with_description("Workitem operation duration in milliseconds")
        .with_unit("ms")
        .build()
}
