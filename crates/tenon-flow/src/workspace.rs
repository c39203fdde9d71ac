//! Workspace binding resolution and propagation.
//!
//! A run supplies one concrete volume source per declared workspace slot.
//! The TaskRun side turns bindings into workload volumes and mounts and
//! exposes each slot's mount path to templates; the PipelineRun side maps
//! its own bindings onto each child's declared slots through the
//! PipelineTask workspace map, so one bound volume is shared by every task
//! that maps it.

use tenon_api::subst::Substitutions;
use tenon_api::workspace::{WorkspaceBinding, WorkspaceDeclaration, WorkspacePipelineTaskBinding};

use crate::error::{Error, Result};
use crate::workload::{ContainerMount, WorkloadVolume, WorkloadVolumeSource};

/// A resolved workspace: the declaration, its binding, and the concrete
/// volume/mount pair handed to the workload builder.
#[derive(Debug, Clone)]
pub struct ResolvedWorkspace {
    /// The declared slot name.
    pub name: String,
    /// Mount path inside step containers.
    pub mount_path: String,
    /// Workload volume (absent for unbound optional slots).
    pub volume: Option<WorkloadVolume>,
    /// Container mount (absent for unbound optional slots).
    pub mount: Option<ContainerMount>,
}

/// Resolves a task's declared workspaces against the run's bindings.
///
/// Every required slot must be bound exactly once; a binding that names no
/// declared slot is rejected. Claim-template bindings must already be
/// concretized into claim references by the caller.
///
/// # Errors
///
/// Returns [`Error::Validation`]-kind failures as internal errors with
/// context; the admission layer reports the same problems as field errors.
pub fn resolve_workspaces(
    declarations: &[WorkspaceDeclaration],
    bindings: &[WorkspaceBinding],
) -> Result<Vec<ResolvedWorkspace>> {
    for binding in bindings {
        if !declarations.iter().any(|d| d.name == binding.name) {
            return Err(Error::internal(format!(
                "workspace binding \"{}\" matches no declared workspace",
                binding.name
            )));
        }
    }

    let mut resolved = Vec::with_capacity(declarations.len());
    for declaration in declarations {
        let binding = bindings.iter().find(|b| b.name == declaration.name);
        let mount_path = declaration.effective_mount_path();

        let Some(binding) = binding else {
            if declaration.optional {
                resolved.push(ResolvedWorkspace {
                    name: declaration.name.clone(),
                    mount_path,
                    volume: None,
                    mount: None,
                });
                continue;
            }
            return Err(Error::internal(format!(
                "declared workspace \"{}\" has no binding",
                declaration.name
            )));
        };

        let volume_name = format!("ws-{}", declaration.name);
        let source = binding_source(binding)?;
        resolved.push(ResolvedWorkspace {
            name: declaration.name.clone(),
            mount_path: mount_path.clone(),
            volume: Some(WorkloadVolume {
                name: volume_name.clone(),
                source,
            }),
            mount: Some(ContainerMount {
                name: volume_name,
                mount_path,
                read_only: declaration.read_only,
            }),
        });
    }
    Ok(resolved)
}

/// Maps a run binding to a workload volume source. Claim templates are
/// rejected here: the reconciler materializes them into claim references
/// before building volumes.
fn binding_source(binding: &WorkspaceBinding) -> Result<WorkloadVolumeSource> {
    if binding.empty_dir.is_some() {
        return Ok(WorkloadVolumeSource::EmptyDir);
    }
    if let Some(claim) = &binding.persistent_volume_claim {
        return Ok(WorkloadVolumeSource::Claim {
            claim_name: claim.claim_name.clone(),
        });
    }
    if let Some(cm) = &binding.config_map {
        return Ok(WorkloadVolumeSource::ConfigMap {
            name: cm.name.clone(),
        });
    }
    if let Some(secret) = &binding.secret {
        return Ok(WorkloadVolumeSource::Secret {
            name: secret.name.clone(),
        });
    }
    if binding.projected.is_some() {
        // Projected volumes surface to the substrate as a config-map-style
        // read-only projection; the adapter expands the component sources.
        return Ok(WorkloadVolumeSource::ConfigMap {
            name: format!("projected-{}", binding.name),
        });
    }
    if let Some(csi) = &binding.csi {
        return Ok(WorkloadVolumeSource::Csi {
            driver: csi.driver.clone(),
        });
    }
    if binding.volume_claim_template.is_some() {
        return Err(Error::internal(format!(
            "workspace \"{}\" still carries a claim template; it must be materialized first",
            binding.name
        )));
    }
    Err(Error::internal(format!(
        "workspace binding \"{}\" has no source",
        binding.name
    )))
}

/// Binds `$(workspaces.NAME.path)` and `$(workspaces.NAME.bound)` for every
/// declared slot.
pub fn bind_workspace_paths(resolved: &[ResolvedWorkspace], subs: &mut Substitutions) {
    for ws in resolved {
        subs.bind_string(format!("workspaces.{}.path", ws.name), ws.mount_path.clone());
        subs.bind_string(
            format!("workspaces.{}.bound", ws.name),
            if ws.volume.is_some() { "true" } else { "false" },
        );
    }
}

/// Projects a pipeline run's bindings onto one pipeline task.
///
/// Each entry of the task's workspace map picks a pipeline binding by name
/// and re-exposes it under the task-side slot name on the child TaskRun.
///
/// # Errors
///
/// Returns an error when the map names a pipeline workspace the run did
/// not bind (and no declaration marks it optional).
pub fn child_bindings(
    task_workspaces: &[WorkspacePipelineTaskBinding],
    run_bindings: &[WorkspaceBinding],
) -> Result<Vec<WorkspaceBinding>> {
    let mut child = Vec::with_capacity(task_workspaces.len());
    for mapping in task_workspaces {
        let pipeline_name = if mapping.workspace.is_empty() {
            // Shorthand: same name on both sides.
            mapping.name.as_str()
        } else {
            mapping.workspace.as_str()
        };
        let Some(binding) = run_bindings.iter().find(|b| b.name == pipeline_name) else {
            return Err(Error::internal(format!(
                "pipeline workspace \"{pipeline_name}\" is not bound by the run"
            )));
        };
        let mut propagated = binding.clone();
        propagated.name = mapping.name.clone();
        child.push(propagated);
    }
    Ok(child)
}
