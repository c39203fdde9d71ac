//! The workload contract with the substrate.
//!
//! Each TaskRun produces exactly one workload whose name derives
//! deterministically from the TaskRun name. Step containers share a volume
//! mounted at the tools path for the entrypoint wrapper, the step-ordering
//! sentinels, and the results directory (one UTF-8 file per declared
//! result, at most 4096 bytes).
//!
//! Step ordering is enforced by the entrypoint wrapper: step N's container
//! blocks until step N-1's success sentinel appears, runs the real command,
//! and posts its own sentinel on exit. Sidecar containers start before the
//! first step runs user code and are signalled to stop after the last step
//! exits.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tenon_core::{child_name, ObjectMeta, OwnerReference};

use tenon_api::subst::Substitutions;
use tenon_api::task::{Sidecar, Step, TaskSpec};
use tenon_api::taskrun::TaskRun;

/// Mount path of the shared tools volume.
pub const TOOLS_DIR: &str = "/tenon/tools";
/// Path of the entrypoint wrapper binary on the tools volume.
pub const ENTRYPOINT_BIN: &str = "/tenon/tools/entrypoint";
/// Directory holding per-step ordering sentinels.
pub const RUN_DIR: &str = "/tenon/run";
/// Directory holding one file per declared result.
pub const RESULTS_DIR: &str = "/tenon/results";
/// Directory where inline scripts are placed by the init container.
pub const SCRIPTS_DIR: &str = "/tenon/scripts";
/// Maximum size of a single result file in bytes.
pub const MAX_RESULT_BYTES: usize = 4096;

/// Name of the shared tools volume.
const TOOLS_VOLUME: &str = "tenon-internal-tools";

/// Returns the deterministic workload name for a TaskRun.
#[must_use]
pub fn workload_name(task_run_name: &str) -> String {
    child_name(task_run_name, "workload")
}

/// Returns the results-file path for a declared result name.
#[must_use]
pub fn result_path(result_name: &str) -> String {
    format!("{RESULTS_DIR}/{result_name}")
}

/// The single scheduled unit backing a TaskRun.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workload {
    /// Object identity; owner references point back at the TaskRun.
    pub metadata: ObjectMeta,
    /// Container layout.
    pub spec: WorkloadSpec,
    /// Substrate-observed state.
    #[serde(default)]
    pub status: WorkloadStatus,
}

/// Container layout of a workload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadSpec {
    /// Setup containers run to completion before any step starts.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub init_containers: Vec<Container>,
    /// One container per step, in declared order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub containers: Vec<Container>,
    /// One container per sidecar, co-scheduled with the steps.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sidecar_containers: Vec<Container>,
    /// Volumes shared by the containers.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<WorkloadVolume>,
}

/// A container inside a workload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Container {
    /// Container name.
    pub name: String,
    /// Image to run.
    pub image: String,
    /// Entrypoint; steps run through the wrapper binary.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,
    /// Arguments.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    /// Environment.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    /// Working directory.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub working_dir: String,
    /// Volume mounts.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volume_mounts: Vec<ContainerMount>,
    /// Resource requests.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub resources: BTreeMap<String, String>,
}

/// A volume mount inside a workload container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerMount {
    /// Volume name.
    pub name: String,
    /// Mount path.
    pub mount_path: String,
    /// Whether the mount is read-only.
    #[serde(default)]
    pub read_only: bool,
}

/// A volume attached to a workload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadVolume {
    /// Volume name, referenced by container mounts.
    pub name: String,
    /// Where the volume's data comes from.
    pub source: WorkloadVolumeSource,
}

/// Source of a workload volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WorkloadVolumeSource {
    /// Node-local scratch space.
    EmptyDir,
    /// A persistent claim by name.
    Claim {
        /// Claim name.
        claim_name: String,
    },
    /// A config map projection.
    ConfigMap {
        /// Config map name.
        name: String,
    },
    /// A secret projection.
    Secret {
        /// Secret name.
        name: String,
    },
    /// A CSI-provided volume.
    Csi {
        /// Driver name.
        driver: String,
    },
}

/// Lifecycle phase of a workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum WorkloadPhase {
    /// Accepted but not all containers started.
    #[default]
    Pending,
    /// At least one step container is executing.
    Running,
    /// Every step exited zero.
    Succeeded,
    /// A step exited non-zero or the workload was evicted.
    Failed,
}

/// Substrate-observed state of a workload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadStatus {
    /// Current phase.
    #[serde(default)]
    pub phase: WorkloadPhase,
    /// When the workload started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    /// Per-step container status, in spec order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub steps: Vec<ContainerStatus>,
    /// Per-sidecar container status, in spec order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sidecars: Vec<ContainerStatus>,
    /// Contents of the result files collected from the tools volume,
    /// keyed by declared result name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub result_files: BTreeMap<String, String>,
}

/// Observed state of one container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerStatus {
    /// Container name.
    pub name: String,
    /// Image identifier; digest form when pulled by digest.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub image_id: String,
    /// Exit code, once terminated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    /// When the container started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When the container exited.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

/// Builds the workload for a TaskRun from its effective (fully substituted)
/// task spec.
///
/// The effective spec's workspace declarations must already carry concrete
/// volume information via `extra_volumes`; parameter and workspace path
/// substitution is the caller's responsibility. This function wires
/// ordering: a `prepare` init container placing the entrypoint wrapper on
/// the tools volume, a `place-scripts` init container when any step carries
/// an inline script, and per-step wait/post sentinel arguments.
#[must_use]
pub fn build_workload(
    task_run: &TaskRun,
    effective: &TaskSpec,
    extra_volumes: Vec<WorkloadVolume>,
    extra_mounts: &[ContainerMount],
) -> Workload {
    let mut metadata = ObjectMeta::namespaced(
        workload_name(&task_run.metadata.name),
        task_run.metadata.namespace.clone(),
    );
    metadata.own_by(OwnerReference::controller(
        "TaskRun",
        task_run.metadata.name.clone(),
        task_run.metadata.uid.clone(),
    ));
    metadata
        .labels
        .insert("tenon.io/task-run".to_string(), task_run.metadata.name.clone());

    let mut init_containers = vec![Container {
        name: "prepare".to_string(),
        image: "tenon.io/entrypoint:latest".to_string(),
        command: vec!["/ko-app/entrypoint".to_string(), "cp".to_string()],
        args: vec!["/ko-app/entrypoint".to_string(), ENTRYPOINT_BIN.to_string()],
        volume_mounts: vec![tools_mount(false)],
        ..Container::default()
    }];

    let has_scripts = effective.steps.iter().any(|s| !s.script.is_empty());
    if has_scripts {
        init_containers.push(place_scripts_container(&effective.steps));
    }

    let containers = effective
        .steps
        .iter()
        .enumerate()
        .map(|(i, step)| step_container(i, step, extra_mounts))
        .collect();

    let sidecar_containers = effective
        .sidecars
        .iter()
        .map(|sc| sidecar_container(sc, extra_mounts))
        .collect();

    let mut volumes = vec![WorkloadVolume {
        name: TOOLS_VOLUME.to_string(),
        source: WorkloadVolumeSource::EmptyDir,
    }];
    volumes.extend(extra_volumes);

    Workload {
        metadata,
        spec: WorkloadSpec {
            init_containers,
            containers,
            sidecar_containers,
            volumes,
        },
        status: WorkloadStatus::default(),
    }
}

fn tools_mount(read_only: bool) -> ContainerMount {
    ContainerMount {
        name: TOOLS_VOLUME.to_string(),
        mount_path: "/tenon".to_string(),
        read_only,
    }
}

/// Writes every inline script onto the tools volume so step containers can
/// execute them by path.
fn place_scripts_container(steps: &[Step]) -> Container {
    let mut script_blob = String::new();
    for (i, step) in steps.iter().enumerate() {
        if step.script.is_empty() {
            continue;
        }
        script_blob.push_str(&format!(
            "cat > {SCRIPTS_DIR}/script-{i} <<'_TENON_EOF_'\n{}\n_TENON_EOF_\nchmod +x {SCRIPTS_DIR}/script-{i}\n",
            step.script
        ));
    }
    Container {
        name: "place-scripts".to_string(),
        image: "busybox:stable".to_string(),
        command: vec!["sh".to_string(), "-c".to_string()],
        args: vec![script_blob],
        volume_mounts: vec![tools_mount(false)],
        ..Container::default()
    }
}

/// Wraps one step in the entrypoint wrapper with wait/post sentinels.
fn step_container(index: usize, step: &Step, extra_mounts: &[ContainerMount]) -> Container {
    let name = if step.name.is_empty() {
        format!("step-unnamed-{index}")
    } else {
        format!("step-{}", step.name)
    };

    let mut args = Vec::new();
    if index > 0 {
        args.push("-wait_file".to_string());
        args.push(format!("{RUN_DIR}/{}/out", index - 1));
    }
    args.push("-post_file".to_string());
    args.push(format!("{RUN_DIR}/{index}/out"));
    args.push("-entrypoint".to_string());

    if step.script.is_empty() {
        let mut command = step.command.iter();
        args.push(command.next().cloned().unwrap_or_default());
        args.push("--".to_string());
        args.extend(command.cloned());
        args.extend(step.args.iter().cloned());
    } else {
        args.push(format!("{SCRIPTS_DIR}/script-{index}"));
        args.push("--".to_string());
        args.extend(step.args.iter().cloned());
    }

    let mut volume_mounts = vec![tools_mount(false)];
    volume_mounts.extend(extra_mounts.iter().cloned());
    volume_mounts.extend(step.volume_mounts.iter().map(|m| ContainerMount {
        name: m.name.clone(),
        mount_path: m.mount_path.clone(),
        read_only: m.read_only,
    }));

    Container {
        name,
        image: step.image.clone(),
        command: vec![ENTRYPOINT_BIN.to_string()],
        args,
        env: step
            .env
            .iter()
            .map(|e| (e.name.clone(), e.value.clone()))
            .collect(),
        working_dir: step.working_dir.clone(),
        volume_mounts,
        resources: step.resources.clone(),
    }
}

/// Sidecars run unwrapped; the substrate signals them after the last step.
fn sidecar_container(sidecar: &Sidecar, extra_mounts: &[ContainerMount]) -> Container {
    let mut volume_mounts = vec![tools_mount(true)];
    volume_mounts.extend(extra_mounts.iter().cloned());
    volume_mounts.extend(sidecar.volume_mounts.iter().map(|m| ContainerMount {
        name: m.name.clone(),
        mount_path: m.mount_path.clone(),
        read_only: m.read_only,
    }));

    Container {
        name: format!("sidecar-{}", sidecar.name),
        image: sidecar.image.clone(),
        command: if sidecar.script.is_empty() {
            sidecar.command.clone()
        } else {
            vec!["sh".to_string(), "-c".to_string(), sidecar.script.clone()]
        },
        args: sidecar.args.clone(),
        env: sidecar
            .env
            .iter()
            .map(|e| (e.name.clone(), e.value.clone()))
            .collect(),
        working_dir: sidecar.working_dir.clone(),
        volume_mounts,
        resources: sidecar.resources.clone(),
    }
}

/// Binds the `$(results.NAME.path)` symbols for a task's declared results.
pub fn bind_result_paths(spec: &TaskSpec, subs: &mut Substitutions) {
    for result in &spec.results {
        subs.bind_string(format!("results.{}.path", result.name), result_path(&result.name));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tenon_api::taskrun::{TaskRunSpec, TaskRunStatus};

    fn task_run() -> TaskRun {
        TaskRun {
            metadata: ObjectMeta::namespaced("tr-multiply", "builds"),
            spec: TaskRunSpec::default(),
            status: TaskRunStatus::default(),
        }
    }

    fn two_step_spec() -> TaskSpec {
        TaskSpec {
            steps: vec![
                Step {
                    name: "first".into(),
                    image: "alpine".into(),
                    command: vec!["echo".into()],
                    args: vec!["one".into()],
                    ..Step::default()
                },
                Step {
                    name: "second".into(),
                    image: "alpine".into(),
                    script: "echo two".into(),
                    ..Step::default()
                },
            ],
            ..TaskSpec::default()
        }
    }

    #[test]
    fn workload_name_is_deterministic() {
        assert_eq!(workload_name("tr-multiply"), "tr-multiply-workload");
        assert_eq!(workload_name("tr-multiply"), workload_name("tr-multiply"));
    }

    #[test]
    fn workload_carries_owner_reference() {
        let w = build_workload(&task_run(), &two_step_spec(), Vec::new(), &[]);
        let owner = &w.metadata.owner_references[0];
        assert_eq!(owner.kind, "TaskRun");
        assert_eq!(owner.name, "tr-multiply");
        assert!(owner.controller);
    }

    #[test]
    fn steps_are_wired_in_order() {
        let w = build_workload(&task_run(), &two_step_spec(), Vec::new(), &[]);
        assert_eq!(w.spec.containers.len(), 2);

        // First step has no wait file, posts sentinel 0.
        let first = &w.spec.containers[0];
        assert_eq!(first.command, vec![ENTRYPOINT_BIN.to_string()]);
        assert!(!first.args.contains(&"-wait_file".to_string()));
        assert!(first.args.contains(&format!("{RUN_DIR}/0/out")));

        // Second step waits on sentinel 0 and posts sentinel 1.
        let second = &w.spec.containers[1];
        assert!(second.args.contains(&"-wait_file".to_string()));
        assert!(second.args.contains(&format!("{RUN_DIR}/0/out")));
        assert!(second.args.contains(&format!("{RUN_DIR}/1/out")));
    }

    #[test]
    fn scripts_get_a_placement_init_container() {
        let w = build_workload(&task_run(), &two_step_spec(), Vec::new(), &[]);
        let names: Vec<&str> = w
            .spec
            .init_containers
            .iter()
            .map(|c| c.name.as_str())
            .collect();
        assert_eq!(names, vec!["prepare", "place-scripts"]);

        // The script step executes the placed file.
        let second = &w.spec.containers[1];
        assert!(second.args.contains(&format!("{SCRIPTS_DIR}/script-1")));
    }

    #[test]
    fn every_container_mounts_the_tools_volume() {
        let w = build_workload(&task_run(), &two_step_spec(), Vec::new(), &[]);
        for c in w.spec.init_containers.iter().chain(&w.spec.containers) {
            assert!(c.volume_mounts.iter().any(|m| m.name == TOOLS_VOLUME));
        }
    }

    #[test]
    fn result_path_layout() {
        assert_eq!(result_path("product"), "/tenon/results/product");
    }
}
