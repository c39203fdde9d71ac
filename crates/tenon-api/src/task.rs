//! Tasks: reusable units of work.
//!
//! A Task is an ordered sequence of steps plus long-running sidecars,
//! with declared params, results, and workspace slots. Steps execute
//! strictly in declared order inside a single scheduled workload.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tenon_core::ObjectMeta;

use crate::param::{ParamSpec, ParamType, PropertySpec};
use crate::workspace::WorkspaceDeclaration;

/// A reusable unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    /// Object identity and bookkeeping.
    #[serde(default)]
    pub metadata: ObjectMeta,
    /// The task definition.
    pub spec: TaskSpec,
}

/// The definition half of a Task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSpec {
    /// Human-readable description.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,

    /// Declared parameters.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub params: Vec<ParamSpec>,

    /// Ordered steps; at least one is required.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub steps: Vec<Step>,

    /// Long-running companions, co-scheduled with the steps.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sidecars: Vec<Sidecar>,

    /// Declared results steps may write.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub results: Vec<TaskResult>,

    /// Declared workspace slots.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub workspaces: Vec<WorkspaceDeclaration>,
}

impl TaskSpec {
    /// Looks up a declared param by name.
    #[must_use]
    pub fn param(&self, name: &str) -> Option<&ParamSpec> {
        self.params.iter().find(|p| p.name == name)
    }

    /// Looks up a declared result by name.
    #[must_use]
    pub fn result(&self, name: &str) -> Option<&TaskResult> {
        self.results.iter().find(|r| r.name == name)
    }

    /// Looks up a declared workspace by name.
    #[must_use]
    pub fn workspace(&self, name: &str) -> Option<&WorkspaceDeclaration> {
        self.workspaces.iter().find(|w| w.name == name)
    }
}

/// One container execution inside a TaskRun.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    /// Step name, unique within the task.
    pub name: String,

    /// Container image to run.
    pub image: String,

    /// Entrypoint override.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,

    /// Arguments to the command.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,

    /// Environment variables.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVar>,

    /// Working directory inside the container.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub working_dir: String,

    /// Extra volume mounts beyond the implicit workspaces/tools volumes.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volume_mounts: Vec<VolumeMount>,

    /// Inline script; mutually exclusive with `command`.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub script: String,

    /// Resource requests for this step's container.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub resources: BTreeMap<String, String>,
}

/// A long-running companion container.
///
/// Sidecars share the Step shape but are started before the first step and
/// signalled to terminate after the last step exits.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sidecar {
    /// Sidecar name, unique within the task alongside step names.
    pub name: String,

    /// Container image to run.
    pub image: String,

    /// Entrypoint override.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,

    /// Arguments to the command.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,

    /// Environment variables.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVar>,

    /// Working directory inside the container.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub working_dir: String,

    /// Extra volume mounts.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volume_mounts: Vec<VolumeMount>,

    /// Inline script; mutually exclusive with `command`.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub script: String,

    /// Resource requests for this sidecar's container.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub resources: BTreeMap<String, String>,

    /// What a sidecar failure means for the run.
    #[serde(default)]
    pub completion_policy: SidecarCompletionPolicy,
}

/// Whether a sidecar failure fails the TaskRun.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SidecarCompletionPolicy {
    /// A non-zero sidecar exit fails the run with reason `SidecarFailed`.
    #[default]
    Observed,
    /// Sidecar exit status is ignored.
    Ignored,
}

/// An environment variable on a step or sidecar.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvVar {
    /// Variable name.
    pub name: String,
    /// Variable value; subject to `$(...)` substitution.
    #[serde(default)]
    pub value: String,
}

impl EnvVar {
    /// Creates a name/value pair.
    #[must_use]
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// A volume mount on a step or sidecar.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeMount {
    /// Volume name.
    pub name: String,
    /// Mount path inside the container.
    pub mount_path: String,
    /// Whether the mount is read-only.
    #[serde(default)]
    pub read_only: bool,
}

/// A declared, typed result a step may write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskResult {
    /// Result name, unique within the task.
    pub name: String,

    /// Declared type. Defaults to `string`.
    #[serde(default, rename = "type")]
    pub type_: ParamType,

    /// Declared property schema for object results.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, PropertySpec>,

    /// Human-readable description.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

impl TaskResult {
    /// Creates a string result declaration.
    #[must_use]
    pub fn string(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_: ParamType::String,
            properties: BTreeMap::new(),
            description: String::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_spec() -> TaskSpec {
        TaskSpec {
            params: vec![ParamSpec::string("url")],
            steps: vec![Step {
                name: "fetch".into(),
                image: "alpine".into(),
                script: "wget $(params.url)".into(),
                ..Step::default()
            }],
            results: vec![TaskResult::string("digest")],
            workspaces: vec![WorkspaceDeclaration::named("output")],
            ..TaskSpec::default()
        }
    }

    #[test]
    fn lookups_find_declarations() {
        let spec = sample_spec();
        assert!(spec.param("url").is_some());
        assert!(spec.result("digest").is_some());
        assert!(spec.workspace("output").is_some());
        assert!(spec.param("missing").is_none());
    }

    #[test]
    fn step_serializes_camel_case() {
        let spec = sample_spec();
        let json = serde_json::to_value(&spec).unwrap();
        assert_eq!(json["steps"][0]["name"], "fetch");
        assert!(json["steps"][0].get("workingDir").is_none());
    }

    #[test]
    fn sidecar_defaults_to_observed_policy() {
        let sc: Sidecar = serde_json::from_str(
            "{\"name\": \"registry\", \"image\": \"registry:2\"}",
        )
        .unwrap();
        assert_eq!(sc.completion_policy, SidecarCompletionPolicy::Observed);
    }
}
