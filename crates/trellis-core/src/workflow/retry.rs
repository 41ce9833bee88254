//! Error & retry controller.
//!
//! `RetryHandler` is stateless: whether a failed node is retried, routed to
//! its error handler, or fails the workflow is a pure function of the error
//! kind, the node's failure count and the configuration. `ErrorMonitor`
//! keeps the append-only error records per workflow and aggregates them into
//! reports.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use serde::Serialize;
use trellis_types::workflow::{BackoffConfig, ErrorKind, ErrorRecord};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// RecoveryAction
// ---------------------------------------------------------------------------

/// What the engine does after a failed attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum RecoveryAction {
    /// Re-run the same node from its pre-step context after `delay`.
    Retry { delay: Duration },
    /// Continue at the node's error handler.
    RouteToHandler {
        handler: String,
        kind: ErrorKind,
        cause: Option<ErrorKind>,
    },
    /// Terminate the workflow as `failed`.
    Fail {
        kind: ErrorKind,
        cause: Option<ErrorKind>,
    },
}

/// A failed attempt as seen by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Failure {
    pub kind: ErrorKind,
    /// Whether this failure may be retried at all.
    pub retryable: bool,
    /// Failures of the node so far, including this one.
    pub failures: u32,
}

// ---------------------------------------------------------------------------
// RetryHandler
// ---------------------------------------------------------------------------

/// Stateless retry handler for node failures.
///
/// No internal state: all logic is in associated functions that take the
/// configuration as parameters.
pub struct RetryHandler;

impl RetryHandler {
    /// Whether an error kind is retried in place by default.
    pub fn is_retryable(kind: ErrorKind) -> bool {
        matches!(kind, ErrorKind::StepExecution | ErrorKind::StepTimeout)
    }

    /// Decide the recovery action for a failed attempt.
    ///
    /// Retries while `failures < max_retries` for retryable failures. Once
    /// exhausted the reported kind becomes `max_retries_exceeded` with the
    /// original kind as cause; non-retryable failures keep their own kind.
    pub fn decide(
        failure: Failure,
        max_retries: u32,
        backoff: &BackoffConfig,
        handler: Option<&str>,
    ) -> RecoveryAction {
        if failure.retryable && failure.failures < max_retries {
            return RecoveryAction::Retry {
                delay: Self::backoff_delay(backoff, failure.failures),
            };
        }

        let (kind, cause) = if failure.retryable {
            (ErrorKind::MaxRetriesExceeded, Some(failure.kind))
        } else {
            (failure.kind, None)
        };

        match handler {
            Some(handler) => RecoveryAction::RouteToHandler {
                handler: handler.to_string(),
                kind,
                cause,
            },
            None => RecoveryAction::Fail { kind, cause },
        }
    }

    /// Delay before the next attempt after `failures` failed attempts.
    ///
    /// `failures` is 1-based: the first retry uses the initial delay.
    pub fn backoff_delay(backoff: &BackoffConfig, failures: u32) -> Duration {
        match backoff {
            BackoffConfig::Fixed { delay_ms } => Duration::from_millis(*delay_ms),
            BackoffConfig::Exponential {
                initial_ms,
                factor,
                max_ms,
            } => {
                let exponent = failures.saturating_sub(1) as i32;
                let raw = *initial_ms as f64 * factor.powi(exponent);
                let capped = if raw.is_finite() {
                    raw.min(*max_ms as f64).max(0.0)
                } else {
                    *max_ms as f64
                };
                Duration::from_millis(capped as u64)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// ErrorMonitor
// ---------------------------------------------------------------------------

/// Aggregated view of a workflow's error records.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorReport {
    pub workflow_id: Uuid,
    pub total: usize,
    pub by_kind: BTreeMap<ErrorKind, usize>,
    pub by_node: BTreeMap<String, usize>,
    pub records: Vec<ErrorRecord>,
}

/// Append-only error record log, keyed by workflow ID.
#[derive(Debug, Default)]
pub struct ErrorMonitor {
    records: DashMap<Uuid, Vec<ErrorRecord>>,
}

impl ErrorMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one record for a failed attempt and return it.
    pub fn record(
        &self,
        workflow_id: Uuid,
        node: &str,
        kind: ErrorKind,
        message: &str,
        retry_count: u32,
    ) -> ErrorRecord {
        let record = ErrorRecord {
            workflow_id,
            node: node.to_string(),
            kind,
            message: message.to_string(),
            retry_count,
            timestamp: Utc::now(),
        };
        self.records
            .entry(workflow_id)
            .or_default()
            .push(record.clone());
        record
    }

    pub fn records(&self, workflow_id: &Uuid) -> Vec<ErrorRecord> {
        self.records
            .get(workflow_id)
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    pub fn forget(&self, workflow_id: &Uuid) {
        self.records.remove(workflow_id);
    }

    /// Aggregate the records of one workflow.
    pub fn report(&self, workflow_id: &Uuid) -> ErrorReport {
        let records = self.records(workflow_id);
        let mut by_kind = BTreeMap::new();
        let mut by_node = BTreeMap::new();
        for record in &records {
            *by_kind.entry(record.kind).or_insert(0) += 1;
            *by_node.entry(record.node.clone()).or_insert(0) += 1;
        }
        ErrorReport {
            workflow_id: *workflow_id,
            total: records.len(),
            by_kind,
            by_node,
            records,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
