//! Workspaces: declared mount slots and the concrete volumes bound to them.
//!
//! A Task declares named workspace slots; a run binds each slot to exactly
//! one volume source. A Pipeline declares its own slots and each
//! PipelineTask maps its task's slots onto the pipeline's, so one bound
//! volume can be shared across tasks.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Default parent directory for workspace mounts.
pub const WORKSPACE_DIR: &str = "/workspace";

/// A named mount slot declared by a Task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceDeclaration {
    /// Slot name, unique within the declaring task.
    pub name: String,

    /// Human-readable description.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,

    /// Where the volume is mounted inside step containers. Defaults to
    /// `/workspace/<name>`.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub mount_path: String,

    /// Whether steps may write to the workspace.
    #[serde(default)]
    pub read_only: bool,

    /// Whether the run may leave the slot unbound.
    #[serde(default)]
    pub optional: bool,
}

impl WorkspaceDeclaration {
    /// Creates a required, writable declaration with the default mount path.
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            mount_path: String::new(),
            read_only: false,
            optional: false,
        }
    }

    /// Returns the effective mount path for this declaration.
    #[must_use]
    pub fn effective_mount_path(&self) -> String {
        if self.mount_path.is_empty() {
            format!("{WORKSPACE_DIR}/{}", self.name)
        } else {
            self.mount_path.clone()
        }
    }
}

/// A named slot declared by a Pipeline (no mount path; tasks own mounting).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineWorkspaceDeclaration {
    /// Slot name, unique within the pipeline.
    pub name: String,

    /// Human-readable description.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,

    /// Whether the run may leave the slot unbound.
    #[serde(default)]
    pub optional: bool,
}

/// Maps a task's workspace slot onto a pipeline workspace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspacePipelineTaskBinding {
    /// The task-side slot name.
    pub name: String,
    /// The pipeline workspace the slot maps onto.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub workspace: String,
}

/// A concrete volume bound to a declared workspace slot by a run.
///
/// Exactly one source must be set; validation rejects bindings with zero or
/// multiple sources.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceBinding {
    /// The declared slot this binding fills.
    pub name: String,

    /// Mount sub-path within the volume.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub sub_path: String,

    /// Ephemeral scratch volume.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub empty_dir: Option<EmptyDirSource>,

    /// Reference to an existing persistent claim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistent_volume_claim: Option<PersistentVolumeClaimSource>,

    /// Template from which the engine materializes exactly one claim per
    /// run lifetime.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_claim_template: Option<VolumeClaimTemplate>,

    /// Read-only projection of a config map.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_map: Option<NamedObjectSource>,

    /// Read-only projection of a secret.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<NamedObjectSource>,

    /// Combined projection of several sources.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub projected: Option<ProjectedSource>,

    /// Vendor CSI volume.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub csi: Option<CsiSource>,
}

impl WorkspaceBinding {
    /// Counts the sources set on this binding.
    #[must_use]
    pub fn source_count(&self) -> usize {
        usize::from(self.empty_dir.is_some())
            + usize::from(self.persistent_volume_claim.is_some())
            + usize::from(self.volume_claim_template.is_some())
            + usize::from(self.config_map.is_some())
            + usize::from(self.secret.is_some())
            + usize::from(self.projected.is_some())
            + usize::from(self.csi.is_some())
    }

    /// Creates an emptyDir binding, the simplest scratch source.
    #[must_use]
    pub fn empty_dir(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            empty_dir: Some(EmptyDirSource::default()),
            ..Self::default()
        }
    }

    /// Creates a volume-claim-template binding.
    #[must_use]
    pub fn claim_template(name: impl Into<String>, template: VolumeClaimTemplate) -> Self {
        Self {
            name: name.into(),
            volume_claim_template: Some(template),
            ..Self::default()
        }
    }
}

/// Ephemeral scratch volume source.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmptyDirSource {
    /// Backing medium hint (empty means node default).
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub medium: String,
}

/// Reference to an existing persistent claim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistentVolumeClaimSource {
    /// Name of the existing claim.
    pub claim_name: String,
    /// Whether to mount read-only.
    #[serde(default)]
    pub read_only: bool,
}

/// Template for a claim materialized once per run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeClaimTemplate {
    /// Requested access modes (e.g. `ReadWriteOnce`).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub access_modes: Vec<String>,
    /// Requested storage quantity (e.g. `16Mi`).
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub storage: String,
}

/// A source identified by object name (config map or secret).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NamedObjectSource {
    /// Name of the referenced object.
    pub name: String,
    /// Optional key-to-path projections.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub items: BTreeMap<String, String>,
}

/// A combined projection of config maps and secrets.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectedSource {
    /// Config maps to project.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub config_maps: Vec<NamedObjectSource>,
    /// Secrets to project.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub secrets: Vec<NamedObjectSource>,
}

/// Vendor CSI volume source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CsiSource {
    /// CSI driver name.
    pub driver: String,
    /// Whether to mount read-only.
    #[serde(default)]
    pub read_only: bool,
    /// Driver-specific attributes.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub volume_attributes: BTreeMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_mount_path_derives_from_name() {
        let decl = WorkspaceDeclaration::named("shared-data");
        assert_eq!(decl.effective_mount_path(), "/workspace/shared-data");
    }

    #[test]
    fn explicit_mount_path_wins() {
        let mut decl = WorkspaceDeclaration::named("cache");
        decl.mount_path = "/var/cache/build".to_string();
        assert_eq!(decl.effective_mount_path(), "/var/cache/build");
    }

    #[test]
    fn source_count_reflects_set_sources() {
        let binding = WorkspaceBinding::empty_dir("scratch");
        assert_eq!(binding.source_count(), 1);

        let mut both = WorkspaceBinding::empty_dir("scratch");
        both.secret = Some(NamedObjectSource {
            name: "creds".into(),
            items: BTreeMap::new(),
        });
        assert_eq!(both.source_count(), 2);

        assert_eq!(WorkspaceBinding::default().source_count(), 0);
    }
}
