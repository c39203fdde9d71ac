//! Observability metrics for the reconciliation engine.
//!
//! Metrics are exposed via the `metrics` crate facade; wiring an exporter
//! is the embedder's concern and stays outside the core.
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `tenon_flow_reconciles_total` | Counter | `kind`, `outcome` | Reconcile passes by result |
//! | `tenon_flow_reconcile_duration_seconds` | Histogram | `kind` | Reconcile pass latency |
//! | `tenon_flow_requeues_total` | Counter | `kind`, `cause` | Requeues by cause |
//! | `tenon_flow_conditions_total` | Counter | `kind`, `reason` | Terminal conditions recorded |

use std::time::Instant;

use metrics::{counter, histogram};

/// Metric names as constants for consistency.
pub mod names {
    /// Counter: reconcile passes by outcome.
    pub const RECONCILES_TOTAL: &str = "tenon_flow_reconciles_total";
    /// Histogram: reconcile pass latency in seconds.
    pub const RECONCILE_DURATION_SECONDS: &str = "tenon_flow_reconcile_duration_seconds";
    /// Counter: requeues by cause.
    pub const REQUEUES_TOTAL: &str = "tenon_flow_requeues_total";
    /// Counter: terminal conditions recorded.
    pub const CONDITIONS_TOTAL: &str = "tenon_flow_conditions_total";
}

/// Label keys used across metrics.
pub mod labels {
    /// Run kind (`TaskRun` or `PipelineRun`).
    pub const KIND: &str = "kind";
    /// Reconcile outcome (`ok`, `retry`, `error`).
    pub const OUTCOME: &str = "outcome";
    /// Requeue cause (`deadline`, `backoff`, `dirty`).
    pub const CAUSE: &str = "cause";
    /// Condition reason literal.
    pub const REASON: &str = "reason";
}

/// Records one finished reconcile pass.
pub fn record_reconcile(kind: &'static str, outcome: &'static str, started: Instant) {
    counter!(names::RECONCILES_TOTAL, labels::KIND => kind, labels::OUTCOME => outcome)
        .increment(1);
    histogram!(names::RECONCILE_DURATION_SECONDS, labels::KIND => kind)
        .record(started.elapsed().as_secs_f64());
}

/// Records a requeue decision.
pub fn record_requeue(kind: &'static str, cause: &'static str) {
    counter!(names::REQUEUES_TOTAL, labels::KIND => kind, labels::CAUSE => cause).increment(1);
}

/// Records a terminal condition reason.
pub fn record_condition(kind: &'static str, reason: String) {
    counter!(names::CONDITIONS_TOTAL, labels::KIND => kind, labels::REASON => reason).increment(1);
}
