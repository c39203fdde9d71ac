//! Pipelines: DAGs of tasks plus an optional `finally` group.
//!
//! A PipelineTask names the task it runs (inline spec or reference), binds
//! params and workspaces, guards itself with `when` expressions, and orders
//! itself after predecessors either explicitly (`runAfter`) or implicitly by
//! consuming another task's results.

use serde::{Deserialize, Serialize};
use tenon_core::ObjectMeta;

use crate::duration::ApiDuration;
use crate::param::{Param, ParamSpec, ParamType};
use crate::task::TaskSpec;
use crate::workspace::{PipelineWorkspaceDeclaration, WorkspacePipelineTaskBinding};

/// A DAG of tasks with pipeline-level params, results, and workspaces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pipeline {
    /// Object identity and bookkeeping.
    #[serde(default)]
    pub metadata: ObjectMeta,
    /// The pipeline definition.
    pub spec: PipelineSpec,
}

/// The definition half of a Pipeline.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineSpec {
    /// Human-readable description.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,

    /// Declared parameters.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub params: Vec<ParamSpec>,

    /// The regular task graph.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tasks: Vec<PipelineTask>,

    /// Tasks run after every regular task reaches a terminal state.
    #[serde(default, skip_serializing_if = "Vec::is_empty", rename = "finally")]
    pub finally_tasks: Vec<PipelineTask>,

    /// Declared pipeline-level results.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub results: Vec<PipelineResult>,

    /// Declared workspace slots.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub workspaces: Vec<PipelineWorkspaceDeclaration>,
}

impl PipelineSpec {
    /// Looks up a regular task by name.
    #[must_use]
    pub fn task(&self, name: &str) -> Option<&PipelineTask> {
        self.tasks.iter().find(|t| t.name == name)
    }

    /// Looks up a finally task by name.
    #[must_use]
    pub fn finally_task(&self, name: &str) -> Option<&PipelineTask> {
        self.finally_tasks.iter().find(|t| t.name == name)
    }

    /// Iterates regular and finally tasks in declaration order.
    pub fn all_tasks(&self) -> impl Iterator<Item = &PipelineTask> {
        self.tasks.iter().chain(self.finally_tasks.iter())
    }
}

/// A node in the pipeline DAG.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineTask {
    /// Task name, unique within the pipeline (regular and finally combined).
    pub name: String,

    /// Reference to a stored or remote task.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_ref: Option<TaskRef>,

    /// Inline task definition; mutually exclusive with `taskRef`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_spec: Option<TaskSpec>,

    /// Parameter bindings for the task. Values may reference
    /// `$(params.*)` and `$(tasks.X.results.Y)`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub params: Vec<Param>,

    /// Explicit ordering: names of tasks that must reach a terminal state
    /// before this one becomes ready.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub run_after: Vec<String>,

    /// Guards; all must evaluate true or the task is skipped.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub when: Vec<WhenExpression>,

    /// Per-task execution timeout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<ApiDuration>,

    /// Workspace slot mappings onto pipeline workspaces.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub workspaces: Vec<WorkspacePipelineTaskBinding>,

    /// Execution attempts beyond the first permitted on failure.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub retries: u32,
}

#[allow(clippy::trivially_copy_pass_by_ref)]
fn is_zero(n: &u32) -> bool {
    *n == 0
}

impl PipelineTask {
    /// Returns the names of tasks this task consumes results from, in the
    /// order referenced. These induce implicit graph edges alongside
    /// `runAfter`.
    #[must_use]
    pub fn result_dependencies(&self) -> Vec<String> {
        let mut deps = Vec::new();
        let mut scan = |text: &str, deps: &mut Vec<String>| {
            for reference in crate::subst::find_references(text) {
                if reference.scope() == "tasks" && reference.path.len() >= 3 {
                    deps.push(reference.path[1].clone());
                }
            }
        };
        for param in &self.params {
            match &param.value {
                crate::param::ParamValue::String(s) => scan(s, &mut deps),
                crate::param::ParamValue::Array(items) => {
                    for item in items {
                        scan(item, &mut deps);
                    }
                }
                crate::param::ParamValue::Object(map) => {
                    for v in map.values() {
                        scan(v, &mut deps);
                    }
                }
            }
        }
        for when in &self.when {
            scan(&when.input, &mut deps);
        }
        deps
    }
}

/// A guard expression on a pipeline task.
///
/// `input` is resolved through substitution before evaluation; the task
/// runs only when every expression holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WhenExpression {
    /// Left-hand side, typically a `$(...)` reference.
    pub input: String,
    /// Set operator.
    pub operator: WhenOperator,
    /// Right-hand side values.
    pub values: Vec<String>,
}

impl WhenExpression {
    /// Evaluates the expression against an already-substituted input.
    #[must_use]
    pub fn holds(&self, resolved_input: &str) -> bool {
        let contained = self.values.iter().any(|v| v == resolved_input);
        match self.operator {
            WhenOperator::In => contained,
            WhenOperator::NotIn => !contained,
        }
    }
}

/// Set membership operator for `when` expressions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WhenOperator {
    /// Input must appear in `values`.
    #[serde(rename = "in")]
    In,
    /// Input must not appear in `values`.
    #[serde(rename = "notin")]
    NotIn,
}

/// A declared pipeline-level result.
///
/// `value` is an expression, typically `$(tasks.X.results.Y)`, evaluated
/// once every task reaches a terminal state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineResult {
    /// Result name, unique within the pipeline.
    pub name: String,
    /// Declared type. Defaults to `string`.
    #[serde(default, rename = "type")]
    pub type_: ParamType,
    /// The expression producing the value.
    pub value: String,
    /// Human-readable description.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

/// Reference to a Task, stored or remote.
///
/// Either `name` (catalog lookup) or `resolver` + `params` (remote
/// resolution) must be set, never both.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRef {
    /// Name of a stored task.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,

    /// Remote resolver to delegate to (e.g. `bundles`, `git`).
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub resolver: String,

    /// Resolver parameters; string-typed only.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub params: Vec<Param>,
}

impl TaskRef {
    /// Creates a by-name reference.
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Returns true when this is a remote-resolver reference.
    #[must_use]
    pub fn is_remote(&self) -> bool {
        !self.resolver.is_empty()
    }
}

/// Reference to a Pipeline, stored or remote. Same shape and rules as
/// [`TaskRef`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineRef {
    /// Name of a stored pipeline.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,

    /// Remote resolver to delegate to.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub resolver: String,

    /// Resolver parameters; string-typed only.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub params: Vec<Param>,
}

impl PipelineRef {
    /// Creates a by-name reference.
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Returns true when this is a remote-resolver reference.
    #[must_use]
    pub fn is_remote(&self) -> bool {
        !self.resolver.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finally_serializes_under_its_wire_name() {
        let spec = PipelineSpec {
            finally_tasks: vec![PipelineTask {
                name: "cleanup".into(),
                task_spec: Some(TaskSpec::default()),
                ..PipelineTask::default()
            }],
            ..PipelineSpec::default()
        };
        let json = serde_json::to_value(&spec).unwrap();
        assert_eq!(json["finally"][0]["name"], "cleanup");
    }

    #[test]
    fn when_expression_in_and_notin() {
        let expr = WhenExpression {
            input: "$(params.branch)".into(),
            operator: WhenOperator::In,
            values: vec!["main".into(), "release".into()],
        };
        assert!(expr.holds("main"));
        assert!(!expr.holds("feature"));

        let neg = WhenExpression {
            operator: WhenOperator::NotIn,
            ..expr
        };
        assert!(!neg.holds("main"));
        assert!(neg.holds("feature"));
    }

    #[test]
    fn when_operator_wire_literals() {
        assert_eq!(serde_json::to_string(&WhenOperator::In).unwrap(), "\"in\"");
        assert_eq!(
            serde_json::to_string(&WhenOperator::NotIn).unwrap(),
            "\"notin\""
        );
        let parsed: WhenOperator = serde_json::from_str("\"notin\"").unwrap();
        assert_eq!(parsed, WhenOperator::NotIn);
    }

    #[test]
    fn task_ref_remote_detection() {
        assert!(!TaskRef::named("build").is_remote());
        let remote = TaskRef {
            resolver: "bundles".into(),
            params: vec![Param::new("bundle", "registry/catalog:v1")],
            ..TaskRef::default()
        };
        assert!(remote.is_remote());
    }
}
