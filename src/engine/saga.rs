//! Multi-store writes with compensating actions.
//!
//! A [`Saga`] runs actions in order. Every successful action may register a
//! compensation; on the first failure the registered compensations run in
//! reverse order and the original error is returned. Compensation failures
//! are logged and counted, never returned.
//!
//! Compensations always run on their own task, so a caller that drops the
//! saga's future mid-flight (request cancellation, timeout) does not skip
//! them. A saga dropped before [`Saga::finish`]/[`Saga::complete`] spawns
//! whatever compensations are still pending.

use std::future::Future;
use std::pin::Pin;

use opentelemetry::KeyValue;
use tracing::{info, warn};

use crate::error::Result;
use crate::telemetry::metrics;

type CompensationFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;
type Compensation = Box<dyn FnOnce() -> CompensationFuture + Send>;

pub struct Saga {
    name: &'static str,
    compensations: Vec<(&'static str, Compensation)>,
}

impl Saga {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            compensations: Vec::new(),
        }
    }

    /// Number of compensations registered and not yet run.
    pub fn pending(&self) -> usize {
        self.compensations.len()
    }

    /// Run `action`. On success register `compensation` (described by
    /// `label`) to undo it; on failure compensate everything registered so
    /// far and return the action's error.
    pub async fn step<T, A, F, Fut>(&mut self, label: &'static str, action: A, compensation: F) -> Result<T>
    where
        A: Future<Output = Result<T>>,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        match action.await {
            Ok(value) => {
                self.register(label, compensation);
                Ok(value)
            }
            Err(e) => {
                self.compensate().await;
                Err(e)
            }
        }
    }

    /// Register `compensation` for an action that already succeeded, for
    /// when the undo depends on the action's result.
    pub fn register<F, Fut>(&mut self, label: &'static str, compensation: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.compensations.push((
            label,
            Box::new(move || -> CompensationFuture { Box::pin(compensation()) }),
        ));
    }

    /// Run the last action. On success the saga is complete and nothing
    /// will be compensated; on failure everything is compensated.
    pub async fn finish<T, A>(mut self, action: A) -> Result<T>
    where
        A: Future<Output = Result<T>>,
    {
        match action.await {
            Ok(value) => {
                self.compensations.clear();
                Ok(value)
            }
            Err(e) => {
                self.compensate().await;
                Err(e)
            }
        }
    }

    /// Mark the saga successful without a final action.
    pub fn complete(mut self) {
        self.compensations.clear();
    }

    async fn compensate(&mut self) {
        let pending = std::mem::take(&mut self.compensations);
        if pending.is_empty() {
            return;
        }
        let name = self.name;
        let handle = tokio::spawn(run_compensations(name, pending));
        if let Err(e) = handle.await {
            warn!(saga = name, error = %e, "compensation task failed");
        }
    }
}

impl Drop for Saga {
    fn drop(&mut self) {
        if self.compensations.is_empty() {
            return;
        }
        let pending = std::mem::take(&mut self.compensations);
        let name = self.name;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                info!(
                    saga = name,
                    pending = pending.len(),
                    "saga abandoned, compensating in background"
                );
                handle.spawn(run_compensations(name, pending));
            }
            Err(_) => warn!(
                saga = name,
                pending = pending.len(),
                "saga abandoned outside a runtime, compensations skipped"
            ),
        }
    }
}

async fn run_compensations(name: &'static str, pending: Vec<(&'static str, Compensation)>) {
    for (label, compensation) in pending.into_iter().rev() {
        let result = compensation().await;
        let outcome = if result.is_ok() { "ok" } else { "error" };
        metrics::compensations().add(
            1,
            &[
                KeyValue::new("saga", name),
                KeyValue::new("result", outcome),
            ],
        );
        if let Err(e) = result {
            warn!(saga = name, compensation = label, error = %e, "compensation failed");
        }
    }
}
