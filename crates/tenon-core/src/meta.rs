//! Object metadata shared by every persisted Tenon resource.
//!
//! The substrate stores objects as structured documents; `ObjectMeta`
//! carries identity (`name`, `namespace`, `uid`), the annotation and label
//! maps, ownership links, and the optimistic-concurrency token
//! (`resource_version`) that status writers compare-and-swap on.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Metadata attached to every persisted object.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    /// Object name, unique within `(kind, namespace)`.
    pub name: String,

    /// Namespace the object lives in.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,

    /// Substrate-assigned unique identifier, stable across updates.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub uid: String,

    /// Free-form annotations. The `tenon.io/` prefix is reserved for
    /// round-trip preservation during version conversion.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,

    /// Free-form labels used for selection.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    /// Links to owning objects; a workload owns a reference back to the
    /// TaskRun that created it, a child TaskRun back to its PipelineRun.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub owner_references: Vec<OwnerReference>,

    /// Optimistic-concurrency token; incremented by the substrate on every
    /// write. A status update carrying a stale version is rejected.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<u64>,

    /// Spec generation; incremented by the substrate on spec changes only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation: Option<u64>,

    /// When the object was first persisted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_timestamp: Option<DateTime<Utc>>,
}

impl ObjectMeta {
    /// Creates metadata with just a name.
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Creates metadata with a name and namespace.
    #[must_use]
    pub fn namespaced(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            ..Self::default()
        }
    }

    /// Returns the annotation value for `key`, if present.
    #[must_use]
    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations.get(key).map(String::as_str)
    }

    /// Sets an annotation, replacing any previous value.
    pub fn set_annotation(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.annotations.insert(key.into(), value.into());
    }

    /// Removes an annotation, returning its previous value.
    pub fn remove_annotation(&mut self, key: &str) -> Option<String> {
        self.annotations.remove(key)
    }

    /// Adds an owner reference pointing at `owner`.
    pub fn own_by(&mut self, owner: OwnerReference) {
        self.owner_references.push(owner);
    }
}

/// A link from a dependent object to the object that created it.
///
/// The substrate uses owner references for cascading deletion: deleting a
/// TaskRun removes its workload, deleting a PipelineRun removes its child
/// TaskRuns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnerReference {
    /// Kind of the owning object (e.g. `TaskRun`).
    pub kind: String,
    /// Name of the owning object.
    pub name: String,
    /// UID of the owning object.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub uid: String,
    /// Whether this owner is the managing controller.
    #[serde(default)]
    pub controller: bool,
}

impl OwnerReference {
    /// Creates a controlling owner reference.
    #[must_use]
    pub fn controller(kind: impl Into<String>, name: impl Into<String>, uid: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            name: name.into(),
            uid: uid.into(),
            controller: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn annotations_round_trip() {
        let mut meta = ObjectMeta::named("run-1");
        meta.set_annotation("tenon.io/v-a-bundle", "registry/image:tag");
        assert_eq!(
            meta.annotation("tenon.io/v-a-bundle"),
            Some("registry/image:tag")
        );
        assert_eq!(
            meta.remove_annotation("tenon.io/v-a-bundle").as_deref(),
            Some("registry/image:tag")
        );
        assert!(meta.annotation("tenon.io/v-a-bundle").is_none());
    }

    #[test]
    fn serializes_camel_case_and_skips_empty() {
        let meta = ObjectMeta::namespaced("tr-1", "builds");
        let json = serde_json::to_value(&meta).unwrap();
        assert_eq!(json["name"], "tr-1");
        assert_eq!(json["namespace"], "builds");
        assert!(json.get("ownerReferences").is_none());
        assert!(json.get("resourceVersion").is_none());
    }

    #[test]
    fn owner_reference_controller() {
        let owner = OwnerReference::controller("TaskRun", "tr-1", "uid-1");
        assert!(owner.controller);
        assert_eq!(owner.kind, "TaskRun");
    }
}
