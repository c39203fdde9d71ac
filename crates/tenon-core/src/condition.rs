//! The `Succeeded` condition.
//!
//! Every run publishes exactly one condition of type `Succeeded` once it has
//! been observed. The status is three-valued (`True`, `False`, `Unknown`)
//! with an enumerated machine `reason` and a human-readable `message`.
//!
//! Terminal conditions are write-once: once the status leaves `Unknown` it
//! never changes again. [`Condition::transition`] enforces this invariant so
//! a late or duplicate reconcile pass cannot downgrade a finished run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Three-valued condition status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConditionStatus {
    /// The run finished successfully.
    True,
    /// The run finished unsuccessfully.
    False,
    /// The run has not finished.
    Unknown,
}

impl ConditionStatus {
    /// Returns true for `True` and `False`; a run with a terminal status
    /// never changes its condition again.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::True | Self::False)
    }
}

impl std::fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::True => write!(f, "True"),
            Self::False => write!(f, "False"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Enumerated reasons for the `Succeeded` condition.
///
/// The reason set is part of the compatibility surface; the serialized
/// literals below are observed by clients and must not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SucceededReason {
    /// The run has been observed but work has not started.
    Pending,
    /// The run is making progress.
    Running,
    /// The run finished successfully.
    Succeeded,
    /// The run finished successfully but some tasks were skipped.
    Completed,
    /// The run failed.
    Failed,
    /// A TaskRun exceeded its timeout.
    TaskRunTimeout,
    /// A TaskRun was cancelled.
    TaskRunCancelled,
    /// A sidecar with an observed completion policy failed.
    SidecarFailed,
    /// A declared result was missing or failed to parse as its type.
    InvalidResults,
    /// Remote resolution of the referenced Task failed.
    TaskRunResolutionFailed,
    /// The TaskRun spec failed validation on reconcile.
    TaskRunValidationFailed,
    /// A PipelineRun exhausted its wall-clock budget.
    PipelineRunTimeout,
    /// A PipelineRun was cancelled, skipping the finally group.
    Cancelled,
    /// A PipelineRun was cancelled but the finally group still ran.
    CancelledRunFinally,
    /// A PipelineRun was stopped gracefully and the finally group still ran.
    StoppedRunFinally,
    /// Remote resolution of the referenced Pipeline failed.
    PipelineRunResolutionFailed,
    /// The PipelineRun spec failed validation on reconcile.
    PipelineRunValidationFailed,
    /// A referenced Task could not be fetched for a pipeline task.
    CouldntGetTask,
}

impl std::fmt::Display for SucceededReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "Pending",
            Self::Running => "Running",
            Self::Succeeded => "Succeeded",
            Self::Completed => "Completed",
            Self::Failed => "Failed",
            Self::TaskRunTimeout => "TaskRunTimeout",
            Self::TaskRunCancelled => "TaskRunCancelled",
            Self::SidecarFailed => "SidecarFailed",
            Self::InvalidResults => "InvalidResults",
            Self::TaskRunResolutionFailed => "TaskRunResolutionFailed",
            Self::TaskRunValidationFailed => "TaskRunValidationFailed",
            Self::PipelineRunTimeout => "PipelineRunTimeout",
            Self::Cancelled => "Cancelled",
            Self::CancelledRunFinally => "CancelledRunFinally",
            Self::StoppedRunFinally => "StoppedRunFinally",
            Self::PipelineRunResolutionFailed => "PipelineRunResolutionFailed",
            Self::PipelineRunValidationFailed => "PipelineRunValidationFailed",
            Self::CouldntGetTask => "CouldntGetTask",
        };
        write!(f, "{s}")
    }
}

/// The single condition published by runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Condition type; always `"Succeeded"` for run conditions.
    #[serde(rename = "type")]
    pub type_: String,
    /// Three-valued status.
    pub status: ConditionStatus,
    /// Machine-readable reason from the enumerated set.
    pub reason: SucceededReason,
    /// Human-readable explanation.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    /// When the condition last changed status or reason.
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    /// Creates a fresh `Succeeded` condition.
    #[must_use]
    pub fn succeeded(
        status: ConditionStatus,
        reason: SucceededReason,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_: "Succeeded".to_string(),
            status,
            reason,
            message: message.into(),
            last_transition_time: Utc::now(),
        }
    }

    /// Returns true if the condition is terminal.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Applies a transition, enforcing the monotone-terminal invariant.
    ///
    /// Transitions within `Unknown` (e.g. `Pending` to `Running`) and from
    /// `Unknown` to a terminal status are applied. Re-applying the identical
    /// terminal `(status, reason)` is an idempotent no-op so duplicate
    /// reconcile passes are harmless.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TerminalCondition`] when the condition is already
    /// terminal and the target differs.
    pub fn transition(
        &mut self,
        status: ConditionStatus,
        reason: SucceededReason,
        message: impl Into<String>,
    ) -> Result<()> {
        if self.is_terminal() {
            if self.status == status && self.reason == reason {
                return Ok(());
            }
            return Err(Error::TerminalCondition {
                from: self.reason.to_string(),
                to: reason.to_string(),
            });
        }
        if self.status != status || self.reason != reason {
            self.last_transition_time = Utc::now();
        }
        self.status = status;
        self.reason = reason;
        self.message = message.into();
        Ok(())
    }
}
