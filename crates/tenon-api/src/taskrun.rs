//! TaskRuns: executions of a Task.
//!
//! The spec half names or inlines the task and supplies concrete params,
//! workspace bindings, and a timeout. The status half is written only by
//! the reconciler: the `Succeeded` condition, timestamps, per-step
//! termination state, and declared results.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tenon_core::{Condition, ConditionStatus, ObjectMeta, SucceededReason};

use crate::duration::ApiDuration;
use crate::param::{Param, ParamType, ParamValue};
use crate::pipeline::TaskRef;
use crate::task::TaskSpec;
use crate::workspace::WorkspaceBinding;

/// Default wall-clock timeout applied when the spec supplies none.
pub const DEFAULT_TIMEOUT_SECS: i64 = 3600;

/// An execution of a Task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRun {
    /// Object identity and bookkeeping.
    #[serde(default)]
    pub metadata: ObjectMeta,
    /// What to run.
    pub spec: TaskRunSpec,
    /// Observed execution state; owned by the reconciler.
    #[serde(default)]
    pub status: TaskRunStatus,
}

impl TaskRun {
    /// Returns the effective timeout: the spec value, or the default when
    /// unset. A zero timeout means unbounded.
    #[must_use]
    pub fn timeout(&self) -> ApiDuration {
        self.spec
            .timeout
            .unwrap_or_else(|| ApiDuration::from_secs(DEFAULT_TIMEOUT_SECS))
    }

    /// Returns true once the `Succeeded` condition is terminal.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.status.succeeded().is_some_and(Condition::is_terminal)
    }

    /// Returns true when the spec requests cancellation.
    #[must_use]
    pub fn is_cancellation_requested(&self) -> bool {
        matches!(self.spec.status, Some(TaskRunSpecStatus::Cancelled))
    }

    /// Returns true when the run succeeded.
    #[must_use]
    pub fn is_successful(&self) -> bool {
        self.status
            .succeeded()
            .is_some_and(|c| c.status == ConditionStatus::True)
    }
}

/// The request half of a TaskRun.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRunSpec {
    /// Reference to a stored or remote task.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_ref: Option<TaskRef>,

    /// Inline task definition; mutually exclusive with `taskRef`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_spec: Option<TaskSpec>,

    /// Concrete parameter values.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub params: Vec<Param>,

    /// Concrete workspace bindings.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub workspaces: Vec<WorkspaceBinding>,

    /// Wall-clock budget from start time; zero means unbounded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<ApiDuration>,

    /// Lifecycle request; the only mutation permitted after first reconcile.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<TaskRunSpecStatus>,

    /// Per-step resource-request overrides.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub step_overrides: Vec<StepOverride>,

    /// Per-sidecar resource-request overrides.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sidecar_overrides: Vec<StepOverride>,
}

/// Lifecycle request values for a TaskRun spec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskRunSpecStatus {
    /// Cancel the run and tear down its workload.
    #[serde(rename = "TaskRunCancelled")]
    Cancelled,
}

/// Resource-request override for a named step or sidecar.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepOverride {
    /// Name of the step or sidecar being overridden.
    pub name: String,
    /// Resource requests (e.g. `cpu`, `memory`).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub resources: BTreeMap<String, String>,
}

/// Observed state of a TaskRun.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRunStatus {
    /// Conditions; holds the single `Succeeded` entry once observed.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// When the reconciler first observed the run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,

    /// When the run reached a terminal condition.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_time: Option<DateTime<Utc>>,

    /// Name of the workload materialized for this run.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub workload_name: String,

    /// Ordered per-step termination state.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub steps: Vec<StepState>,

    /// Per-sidecar state.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sidecars: Vec<StepState>,

    /// Declared results written by terminated, successful steps.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub results: Vec<TaskRunResult>,

    /// Frozen copy of the resolved task spec the run executed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_spec: Option<TaskSpec>,
}

impl TaskRunStatus {
    /// Returns the `Succeeded` condition, if the run has been observed.
    #[must_use]
    pub fn succeeded(&self) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.type_ == "Succeeded")
    }

    /// Applies a condition transition, seeding the condition on first call.
    ///
    /// # Errors
    ///
    /// Returns an error when the existing condition is terminal and the
    /// target differs (terminal conditions are write-once).
    pub fn set_condition(
        &mut self,
        status: ConditionStatus,
        reason: SucceededReason,
        message: impl Into<String>,
    ) -> tenon_core::Result<()> {
        match self.conditions.iter_mut().find(|c| c.type_ == "Succeeded") {
            Some(existing) => existing.transition(status, reason, message)?,
            None => self
                .conditions
                .push(Condition::succeeded(status, reason, message)),
        }
        if status.is_terminal() && self.completion_time.is_none() {
            self.completion_time = Some(Utc::now());
        }
        Ok(())
    }

    /// Returns a declared result value by name.
    #[must_use]
    pub fn result(&self, name: &str) -> Option<&ParamValue> {
        self.results
            .iter()
            .find(|r| r.name == name)
            .map(|r| &r.value)
    }
}

/// A typed result value recorded on TaskRun status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRunResult {
    /// Declared result name.
    pub name: String,
    /// Declared type.
    #[serde(default, rename = "type")]
    pub type_: ParamType,
    /// Parsed value.
    pub value: ParamValue,
}

/// Observed state of one step (or sidecar) container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepState {
    /// Declared step name.
    pub name: String,

    /// Container name inside the workload.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub container_name: String,

    /// Image identifier; a digest form when the image was pulled by digest.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub image_id: String,

    /// Termination record; immutable once set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terminated: Option<TerminationState>,
}

/// Immutable record of a terminated container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminationState {
    /// Process exit code.
    pub exit_code: i32,

    /// `Completed` on exit 0, `Error` otherwise.
    pub reason: String,

    /// Truncated diagnostic output.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,

    /// When the container started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    /// When the container exited; never earlier than `startedAt`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl TerminationState {
    /// Builds a termination record from an exit code, deriving the reason
    /// and clamping `finished_at` to be no earlier than `started_at`.
    #[must_use]
    pub fn from_exit(
        exit_code: i32,
        started_at: Option<DateTime<Utc>>,
        finished_at: Option<DateTime<Utc>>,
    ) -> Self {
        let reason = if exit_code == 0 { "Completed" } else { "Error" };
        let finished_at = match (started_at, finished_at) {
            (Some(start), Some(finish)) if finish < start => Some(start),
            (_, finish) => finish,
        };
        Self {
            exit_code,
            reason: reason.to_string(),
            message: String::new(),
            started_at,
            finished_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn effective_timeout_defaults_to_an_hour() {
        let tr = TaskRun {
            metadata: ObjectMeta::named("tr"),
            spec: TaskRunSpec::default(),
            status: TaskRunStatus::default(),
        };
        assert_eq!(tr.timeout(), ApiDuration::from_secs(3600));
    }

    #[test]
    fn termination_reason_follows_exit_code() {
        let ok = TerminationState::from_exit(0, None, None);
        assert_eq!(ok.reason, "Completed");
        let bad = TerminationState::from_exit(42, None, None);
        assert_eq!(bad.reason, "Error");
    }

    #[test]
    fn finished_at_is_clamped_to_started_at() {
        let start = Utc::now();
        let earlier = start - chrono::Duration::seconds(5);
        let t = TerminationState::from_exit(0, Some(start), Some(earlier));
        assert_eq!(t.finished_at, Some(start));
    }

    #[test]
    fn condition_seeds_then_transitions() {
        let mut status = TaskRunStatus::default();
        status
            .set_condition(ConditionStatus::Unknown, SucceededReason::Pending, "")
            .unwrap();
        status
            .set_condition(ConditionStatus::True, SucceededReason::Succeeded, "done")
            .unwrap();
        assert!(status.succeeded().unwrap().is_terminal());
        assert!(status.completion_time.is_some());

        // A terminal condition cannot be downgraded.
        let err = status.set_condition(
            ConditionStatus::False,
            SucceededReason::Failed,
            "too late",
        );
        assert!(err.is_err());
    }

    #[test]
    fn cancellation_literal_is_stable() {
        let spec = TaskRunSpec {
            status: Some(TaskRunSpecStatus::Cancelled),
            ..TaskRunSpec::default()
        };
        let json = serde_json::to_value(&spec).unwrap();
        assert_eq!(json["status"], "TaskRunCancelled");
    }
}
