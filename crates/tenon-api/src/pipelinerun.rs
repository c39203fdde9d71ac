//! PipelineRuns: executions of a Pipeline.
//!
//! The spec half names or inlines the pipeline, supplies params and
//! workspace bindings, and carries the `timeouts` triplet. The status half
//! records the `Succeeded` condition, one child reference per TaskRun the
//! engine spawned, aggregated pipeline results, skip records, and a frozen
//! copy of the resolved pipeline spec.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tenon_core::{Condition, ConditionStatus, ObjectMeta, SucceededReason};

use crate::duration::ApiDuration;
use crate::param::{Param, ParamValue};
use crate::pipeline::{PipelineRef, PipelineSpec};
use crate::workspace::WorkspaceBinding;

/// Default pipeline wall-clock timeout applied when the triplet is unset.
pub const DEFAULT_PIPELINE_TIMEOUT_SECS: i64 = 3600;

/// An execution of a Pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineRun {
    /// Object identity and bookkeeping.
    #[serde(default)]
    pub metadata: ObjectMeta,
    /// What to run.
    pub spec: PipelineRunSpec,
    /// Observed execution state; owned by the reconciler.
    #[serde(default)]
    pub status: PipelineRunStatus,
}

impl PipelineRun {
    /// Returns true once the run has started (start time recorded).
    #[must_use]
    pub fn has_started(&self) -> bool {
        self.status.start_time.is_some()
    }

    /// Returns true once the `Succeeded` condition is terminal.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.status.succeeded().is_some_and(Condition::is_terminal)
    }

    /// Returns the effective timeout triplet with defaults applied.
    #[must_use]
    pub fn timeouts(&self) -> TimeoutFields {
        let supplied = self.spec.timeouts.clone().unwrap_or_default();
        TimeoutFields {
            pipeline: Some(
                supplied
                    .pipeline
                    .unwrap_or_else(|| ApiDuration::from_secs(DEFAULT_PIPELINE_TIMEOUT_SECS)),
            ),
            tasks: supplied.tasks,
            finally_: supplied.finally_,
        }
    }

    /// Returns the requested lifecycle transition, if any.
    #[must_use]
    pub fn requested_status(&self) -> Option<PipelineRunSpecStatus> {
        self.spec.status
    }
}

/// The request half of a PipelineRun.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineRunSpec {
    /// Reference to a stored or remote pipeline.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline_ref: Option<PipelineRef>,

    /// Inline pipeline definition; mutually exclusive with `pipelineRef`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline_spec: Option<PipelineSpec>,

    /// Concrete parameter values.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub params: Vec<Param>,

    /// Concrete workspace bindings.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub workspaces: Vec<WorkspaceBinding>,

    /// Hierarchical wall-clock budgets.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeouts: Option<TimeoutFields>,

    /// Lifecycle request; the only mutation permitted after first reconcile.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<PipelineRunSpecStatus>,
}

/// Lifecycle request values for a PipelineRun spec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PipelineRunSpecStatus {
    /// Hold the run: nothing is scheduled until the field is cleared.
    /// Legal only before the run has started.
    #[serde(rename = "PipelineRunPending")]
    Pending,
    /// Cancel everything, including the finally group.
    #[serde(rename = "Cancelled")]
    Cancelled,
    /// Cancel regular tasks, then run the finally group.
    #[serde(rename = "CancelledRunFinally")]
    CancelledRunFinally,
    /// Let in-flight tasks finish, schedule nothing new, then run finally.
    #[serde(rename = "StoppedRunFinally")]
    StoppedRunFinally,
}

/// The `{pipeline, tasks, finally}` budget triplet.
///
/// Each budget is a duration; zero means unbounded. Validation enforces
/// `tasks <= pipeline`, `finally <= pipeline`, and
/// `tasks + finally <= pipeline` whenever `pipeline > 0`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeoutFields {
    /// Budget for the entire run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline: Option<ApiDuration>,

    /// Budget for the regular task phase.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tasks: Option<ApiDuration>,

    /// Budget for the finally phase.
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "finally")]
    pub finally_: Option<ApiDuration>,
}

/// Observed state of a PipelineRun.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineRunStatus {
    /// Conditions; holds the single `Succeeded` entry once observed.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// When the reconciler first observed the run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,

    /// When the run reached a terminal condition.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_time: Option<DateTime<Utc>>,

    /// One entry per child TaskRun, in dispatch order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub child_references: Vec<ChildReference>,

    /// Aggregated pipeline-level results.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub results: Vec<PipelineRunResult>,

    /// Tasks that were skipped rather than executed.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub skipped_tasks: Vec<SkippedTask>,

    /// Frozen copy of the resolved pipeline spec the run executed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline_spec: Option<PipelineSpec>,
}

impl PipelineRunStatus {
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

    /// Returns the child reference for a pipeline task, if dispatched.
    #[must_use]
    pub fn child_for(&self, pipeline_task_name: &str) -> Option<&ChildReference> {
        self.child_references
            .iter()
            .find(|c| c.pipeline_task_name == pipeline_task_name)
    }

    /// Returns true if the named task was recorded as skipped.
    #[must_use]
    pub fn is_skipped(&self, pipeline_task_name: &str) -> bool {
        self.skipped_tasks
            .iter()
            .any(|s| s.name == pipeline_task_name)
    }
}

/// A record linking a pipeline task to the TaskRun it spawned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChildReference {
    /// Name of the child TaskRun object.
    pub name: String,
    /// The pipeline task the child executes.
    pub pipeline_task_name: String,
}

/// An aggregated pipeline-level result value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineRunResult {
    /// Declared result name.
    pub name: String,
    /// Evaluated value.
    pub value: ParamValue,
}

/// A record of a task the engine decided not to execute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SkippedTask {
    /// Pipeline task name.
    pub name: String,
    /// Why the task was skipped.
    pub reason: SkipReason,
}

/// Enumerated skip reasons recorded on status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SkipReason {
    /// A `when` expression evaluated to false.
    WhenExpressionsSkipped,
    /// A predecessor failed, so this task never became ready.
    ParentTasksFailed,
    /// A predecessor was itself skipped.
    ParentTasksSkipped,
    /// A consumed result was never produced.
    MissingResultsSkipped,
    /// The run was gracefully stopped before the task became ready.
    GracefullyStopped,
    /// The run was cancelled with the finally group still running.
    GracefullyCancelled,
    /// The tasks budget elapsed before the task became ready.
    PipelineTimedOutSkipped,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spec_status_wire_literals() {
        assert_eq!(
            serde_json::to_string(&PipelineRunSpecStatus::Pending).unwrap(),
            "\"PipelineRunPending\""
        );
        assert_eq!(
            serde_json::to_string(&PipelineRunSpecStatus::CancelledRunFinally).unwrap(),
            "\"CancelledRunFinally\""
        );
    }

    #[test]
    fn timeout_triplet_serializes_finally_keyword() {
        let t = TimeoutFields {
            pipeline: Some(ApiDuration::from_secs(60)),
            tasks: Some(ApiDuration::from_secs(30)),
            finally_: Some(ApiDuration::from_secs(15)),
        };
        let json = serde_json::to_value(&t).unwrap();
        assert!(json.get("finally").is_some());
        assert!(json.get("finally_").is_none());
    }

    #[test]
    fn effective_timeouts_default_pipeline_budget() {
        let pr = PipelineRun {
            metadata: ObjectMeta::named("pr"),
            spec: PipelineRunSpec::default(),
            status: PipelineRunStatus::default(),
        };
        let t = pr.timeouts();
        assert_eq!(t.pipeline, Some(ApiDuration::from_secs(3600)));
        assert!(t.tasks.is_none());
    }

    #[test]
    fn child_lookup_by_pipeline_task() {
        let mut status = PipelineRunStatus::default();
        status.child_references.push(ChildReference {
            name: "pr-build".into(),
            pipeline_task_name: "build".into(),
        });
        assert!(status.child_for("build").is_some());
        assert!(status.child_for("deploy").is_none());
    }
}
