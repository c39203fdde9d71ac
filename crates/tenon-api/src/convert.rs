//! Version conversion between the legacy revision `vA` and the
//! authoritative revision `vB` (the types in this crate).
//!
//! `vA` differs from `vB` in two places:
//!
//! - refs carry a legacy `bundle` image reference, which `vB` expresses as
//!   a resolver reference (`resolver: "bundles"` with `bundle`/`name`/`kind`
//!   params);
//! - runs carry a singular `timeout` instead of the `timeouts` triplet.
//!
//! Conversion is lossless: fields expressible in only one revision are
//! serialized into reserved annotations under the `tenon.io/` namespace on
//! the way out and rehydrated on the way back, so
//! `from_current(to_current(o)) == o` modulo that namespace. Unknown enum
//! literals fail conversion; nothing is silently rewritten.

use serde::{Deserialize, Serialize};
use tenon_core::ObjectMeta;

use crate::duration::ApiDuration;
use crate::param::{Param, ParamValue};
use crate::pipeline::{PipelineRef, PipelineSpec, TaskRef};
use crate::pipelinerun::{PipelineRun, PipelineRunSpec, PipelineRunSpecStatus, PipelineRunStatus, TimeoutFields};
use crate::task::TaskSpec;
use crate::taskrun::{TaskRun, TaskRunSpec, TaskRunSpecStatus, TaskRunStatus};
use crate::workspace::WorkspaceBinding;

/// Annotation key preserving a legacy `bundle` reference across conversion.
pub const BUNDLE_ANNOTATION_KEY: &str = "tenon.io/v-a-bundle";

/// Annotation key preserving a `timeouts` triplet that the legacy singular
/// `timeout` field cannot express.
pub const TIMEOUTS_ANNOTATION_KEY: &str = "tenon.io/v-a-timeouts";

/// The resolver name the modern form of a bundle reference delegates to.
pub const BUNDLE_RESOLVER: &str = "bundles";

/// Errors produced by version conversion.
#[derive(Debug, thiserror::Error)]
pub enum ConvertError {
    /// An enum literal has no equivalent in the target revision.
    #[error("unknown {field} value \"{value}\": cannot be converted")]
    UnknownEnum {
        /// The field holding the unconvertible literal.
        field: &'static str,
        /// The offending literal.
        value: String,
    },

    /// A preservation annotation failed to serialize or parse.
    #[error("preservation annotation {key} is corrupt: {message}")]
    CorruptAnnotation {
        /// The annotation key.
        key: &'static str,
        /// Parse or serialize failure detail.
        message: String,
    },
}

/// A `vA` task reference: `vB`'s shape plus the legacy `bundle` field.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LegacyTaskRef {
    /// Name of a stored task.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    /// Legacy image-bundle reference.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub bundle: String,
}

/// A `vA` pipeline reference; same shape as [`LegacyTaskRef`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LegacyPipelineRef {
    /// Name of a stored pipeline.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    /// Legacy image-bundle reference.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub bundle: String,
}

/// A `vA` TaskRun.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LegacyTaskRun {
    /// Object identity; annotations carry preserved fields.
    #[serde(default)]
    pub metadata: ObjectMeta,
    /// The request half.
    pub spec: LegacyTaskRunSpec,
    /// The status half (shared shape with `vB`).
    #[serde(default)]
    pub status: TaskRunStatus,
}

/// The `vA` TaskRun spec.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LegacyTaskRunSpec {
    /// Reference to a stored or bundled task.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_ref: Option<LegacyTaskRef>,
    /// Inline task definition.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_spec: Option<TaskSpec>,
    /// Concrete parameter values.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub params: Vec<Param>,
    /// Concrete workspace bindings.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub workspaces: Vec<WorkspaceBinding>,
    /// Wall-clock budget.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<ApiDuration>,
    /// Raw lifecycle request literal; parsed during conversion.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub status: String,
}

impl LegacyTaskRun {
    /// Converts this `vA` object to the authoritative revision.
    ///
    /// A `bundle` reference becomes a resolver reference and the original
    /// string is preserved under [`BUNDLE_ANNOTATION_KEY`].
    ///
    /// # Errors
    ///
    /// Returns [`ConvertError::UnknownEnum`] for an unrecognized lifecycle
    /// literal.
    pub fn to_current(&self) -> Result<TaskRun, ConvertError> {
        let mut metadata = self.metadata.clone();

        let task_ref = match &self.spec.task_ref {
            Some(legacy) => Some(convert_ref_to_current(
                &legacy.name,
                &legacy.bundle,
                "task",
                &mut metadata,
            )),
            None => None,
        };

        let status = match self.spec.status.as_str() {
            "" => None,
            "TaskRunCancelled" => Some(TaskRunSpecStatus::Cancelled),
            other => {
                return Err(ConvertError::UnknownEnum {
                    field: "spec.status",
                    value: other.to_string(),
                })
            }
        };

        Ok(TaskRun {
            metadata,
            spec: TaskRunSpec {
                task_ref,
                task_spec: self.spec.task_spec.clone(),
                params: self.spec.params.clone(),
                workspaces: self.spec.workspaces.clone(),
                timeout: self.spec.timeout,
                status,
                step_overrides: Vec::new(),
                sidecar_overrides: Vec::new(),
            },
            status: self.status.clone(),
        })
    }

    /// Converts an authoritative object back to `vA`, rehydrating preserved
    /// fields from annotations.
    ///
    /// # Errors
    ///
    /// Returns [`ConvertError::UnknownEnum`] when the modern ref uses a
    /// resolver other than `bundles` with no preserved legacy form.
    pub fn from_current(current: &TaskRun) -> Result<Self, ConvertError> {
        let mut metadata = current.metadata.clone();
        let preserved_bundle = metadata.remove_annotation(BUNDLE_ANNOTATION_KEY);

        let task_ref = match &current.spec.task_ref {
            Some(modern) => Some(convert_ref_from_current(
                &modern.name,
                &modern.resolver,
                &modern.params,
                preserved_bundle,
            )?),
            None => None,
        };

        let status = match current.spec.status {
            None => String::new(),
            Some(TaskRunSpecStatus::Cancelled) => "TaskRunCancelled".to_string(),
        };

        Ok(Self {
            metadata,
            spec: LegacyTaskRunSpec {
                task_ref,
                task_spec: current.spec.task_spec.clone(),
                params: current.spec.params.clone(),
                workspaces: current.spec.workspaces.clone(),
                timeout: current.spec.timeout,
                status,
            },
            status: current.status.clone(),
        })
    }
}

/// A `vA` PipelineRun.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LegacyPipelineRun {
    /// Object identity; annotations carry preserved fields.
    #[serde(default)]
    pub metadata: ObjectMeta,
    /// The request half.
    pub spec: LegacyPipelineRunSpec,
    /// The status half (shared shape with `vB`).
    #[serde(default)]
    pub status: PipelineRunStatus,
}

/// The `vA` PipelineRun spec: singular `timeout` instead of the triplet.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LegacyPipelineRunSpec {
    /// Reference to a stored or bundled pipeline.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline_ref: Option<LegacyPipelineRef>,
    /// Inline pipeline definition.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline_spec: Option<PipelineSpec>,
    /// Concrete parameter values.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub params: Vec<Param>,
    /// Concrete workspace bindings.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub workspaces: Vec<WorkspaceBinding>,
    /// Singular wall-clock budget for the whole run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<ApiDuration>,
    /// Raw lifecycle request literal; parsed during conversion.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub status: String,
}

impl LegacyPipelineRun {
    /// Converts this `vA` object to the authoritative revision.
    ///
    /// The singular `timeout` maps to `timeouts.pipeline`; a preserved
    /// triplet annotation (written by [`Self::from_current`]) takes
    /// precedence so the round trip restores `tasks`/`finally` budgets.
    ///
    /// # Errors
    ///
    /// Returns [`ConvertError::UnknownEnum`] for an unrecognized lifecycle
    /// literal, or [`ConvertError::CorruptAnnotation`] when a preserved
    /// triplet fails to parse.
    pub fn to_current(&self) -> Result<PipelineRun, ConvertError> {
        let mut metadata = self.metadata.clone();

        let pipeline_ref = match &self.spec.pipeline_ref {
            Some(legacy) => {
                let modern =
                    convert_ref_to_current(&legacy.name, &legacy.bundle, "pipeline", &mut metadata);
                Some(PipelineRef {
                    name: modern.name,
                    resolver: modern.resolver,
                    params: modern.params,
                })
            }
            None => None,
        };

        let timeouts = match metadata.remove_annotation(TIMEOUTS_ANNOTATION_KEY) {
            Some(raw) => {
                let triplet: TimeoutFields =
                    serde_json::from_str(&raw).map_err(|e| ConvertError::CorruptAnnotation {
                        key: TIMEOUTS_ANNOTATION_KEY,
                        message: e.to_string(),
                    })?;
                Some(triplet)
            }
            None => self.spec.timeout.map(|t| TimeoutFields {
                pipeline: Some(t),
                tasks: None,
                finally_: None,
            }),
        };

        let status = match self.spec.status.as_str() {
            "" => None,
            "PipelineRunPending" => Some(PipelineRunSpecStatus::Pending),
            "Cancelled" => Some(PipelineRunSpecStatus::Cancelled),
            "CancelledRunFinally" => Some(PipelineRunSpecStatus::CancelledRunFinally),
            "StoppedRunFinally" => Some(PipelineRunSpecStatus::StoppedRunFinally),
            other => {
                return Err(ConvertError::UnknownEnum {
                    field: "spec.status",
                    value: other.to_string(),
                })
            }
        };

        Ok(PipelineRun {
            metadata,
            spec: PipelineRunSpec {
                pipeline_ref,
                pipeline_spec: self.spec.pipeline_spec.clone(),
                params: self.spec.params.clone(),
                workspaces: self.spec.workspaces.clone(),
                timeouts,
                status,
            },
            status: self.status.clone(),
        })
    }

    /// Converts an authoritative object back to `vA`.
    ///
    /// A triplet that only sets `pipeline` collapses to the singular field;
    /// one that uses `tasks`/`finally` is preserved verbatim under
    /// [`TIMEOUTS_ANNOTATION_KEY`] alongside the collapsed singular value.
    ///
    /// # Errors
    ///
    /// Returns [`ConvertError::UnknownEnum`] when the modern ref uses a
    /// resolver other than `bundles` with no preserved legacy form, or
    /// [`ConvertError::CorruptAnnotation`] when the triplet fails to
    /// serialize.
    pub fn from_current(current: &PipelineRun) -> Result<Self, ConvertError> {
        let mut metadata = current.metadata.clone();
        let preserved_bundle = metadata.remove_annotation(BUNDLE_ANNOTATION_KEY);

        let pipeline_ref = match &current.spec.pipeline_ref {
            Some(modern) => {
                let legacy = convert_ref_from_current(
                    &modern.name,
                    &modern.resolver,
                    &modern.params,
                    preserved_bundle,
                )?;
                Some(LegacyPipelineRef {
                    name: legacy.name,
                    bundle: legacy.bundle,
                })
            }
            None => None,
        };

        let timeout = match &current.spec.timeouts {
            None => None,
            Some(triplet) => {
                if triplet.tasks.is_some() || triplet.finally_.is_some() {
                    let raw = serde_json::to_string(triplet).map_err(|e| {
                        ConvertError::CorruptAnnotation {
                            key: TIMEOUTS_ANNOTATION_KEY,
                            message: e.to_string(),
                        }
                    })?;
                    metadata.set_annotation(TIMEOUTS_ANNOTATION_KEY, raw);
                }
                triplet.pipeline
            }
        };

        let status = match current.spec.status {
            None => String::new(),
            Some(PipelineRunSpecStatus::Pending) => "PipelineRunPending".to_string(),
            Some(PipelineRunSpecStatus::Cancelled) => "Cancelled".to_string(),
            Some(PipelineRunSpecStatus::CancelledRunFinally) => "CancelledRunFinally".to_string(),
            Some(PipelineRunSpecStatus::StoppedRunFinally) => "StoppedRunFinally".to_string(),
        };

        Ok(Self {
            metadata,
            spec: LegacyPipelineRunSpec {
                pipeline_ref,
                pipeline_spec: current.spec.pipeline_spec.clone(),
                params: current.spec.params.clone(),
                workspaces: current.spec.workspaces.clone(),
                timeout,
                status,
            },
            status: current.status.clone(),
        })
    }
}

/// Rewrites a legacy `(name, bundle)` pair to the modern ref form. A
/// nonempty bundle becomes a `bundles` resolver reference carrying
/// `bundle`, `name`, and `kind` params, with the original string preserved
/// in the annotation.
fn convert_ref_to_current(
    name: &str,
    bundle: &str,
    kind: &str,
    metadata: &mut ObjectMeta,
) -> TaskRef {
    if bundle.is_empty() {
        return TaskRef::named(name);
    }
    metadata.set_annotation(BUNDLE_ANNOTATION_KEY, bundle);
    TaskRef {
        name: String::new(),
        resolver: BUNDLE_RESOLVER.to_string(),
        params: vec![
            Param::new("bundle", bundle),
            Param::new("name", name),
            Param::new("kind", kind),
        ],
    }
}

/// Rewrites a modern ref back to the legacy `(name, bundle)` pair using the
/// preserved annotation value. The original ref name travels in the
/// resolver's `name` param.
fn convert_ref_from_current(
    name: &str,
    resolver: &str,
    params: &[Param],
    preserved_bundle: Option<String>,
) -> Result<LegacyTaskRef, ConvertError> {
    if resolver.is_empty() {
        return Ok(LegacyTaskRef {
            name: name.to_string(),
            bundle: String::new(),
        });
    }
    if resolver != BUNDLE_RESOLVER {
        return Err(ConvertError::UnknownEnum {
            field: "resolver",
            value: resolver.to_string(),
        });
    }
    let Some(bundle) = preserved_bundle else {
        return Err(ConvertError::CorruptAnnotation {
            key: BUNDLE_ANNOTATION_KEY,
            message: "bundle resolver reference has no preserved legacy value".to_string(),
        });
    };
    Ok(LegacyTaskRef {
        name: bundle_ref_name(params).unwrap_or(name).to_string(),
        bundle,
    })
}

/// Extracts the `name` resolver param from a converted bundle reference.
#[must_use]
pub fn bundle_ref_name(params: &[Param]) -> Option<&str> {
    params
        .iter()
        .find(|p| p.name == "name")
        .and_then(|p| match &p.value {
            ParamValue::String(s) => Some(s.as_str()),
            _ => None,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn legacy_task_run_with_bundle() -> LegacyTaskRun {
        LegacyTaskRun {
            metadata: ObjectMeta::named("tr-legacy"),
            spec: LegacyTaskRunSpec {
                task_ref: Some(LegacyTaskRef {
                    name: "build".into(),
                    bundle: "registry.example.com/catalog:v1".into(),
                }),
                ..LegacyTaskRunSpec::default()
            },
            status: TaskRunStatus::default(),
        }
    }

    #[test]
    fn bundle_becomes_resolver_reference() {
        let current = legacy_task_run_with_bundle().to_current().unwrap();
        let r = current.spec.task_ref.unwrap();
        assert_eq!(r.resolver, BUNDLE_RESOLVER);
        assert_eq!(bundle_ref_name(&r.params), Some("build"));
        assert_eq!(
            current.metadata.annotation(BUNDLE_ANNOTATION_KEY),
            Some("registry.example.com/catalog:v1")
        );
    }

    #[test]
    fn task_run_round_trips_through_current() {
        let original = legacy_task_run_with_bundle();
        let current = original.to_current().unwrap();
        let back = LegacyTaskRun::from_current(&current).unwrap();
        assert_eq!(back, original);
    }

    #[test]
    fn unknown_task_run_status_fails_conversion() {
        let mut legacy = legacy_task_run_with_bundle();
        legacy.spec.status = "TaskRunCancell".to_string();
        let err = legacy.to_current().unwrap_err();
        assert!(matches!(err, ConvertError::UnknownEnum { .. }));
    }

    #[test]
    fn singular_timeout_maps_to_pipeline_bucket() {
        let legacy = LegacyPipelineRun {
            metadata: ObjectMeta::named("pr-legacy"),
            spec: LegacyPipelineRunSpec {
                pipeline_ref: Some(LegacyPipelineRef {
                    name: "release".into(),
                    bundle: String::new(),
                }),
                timeout: Some(ApiDuration::from_secs(1800)),
                ..LegacyPipelineRunSpec::default()
            },
            status: PipelineRunStatus::default(),
        };
        let current = legacy.to_current().unwrap();
        let timeouts = current.spec.timeouts.unwrap();
        assert_eq!(timeouts.pipeline, Some(ApiDuration::from_secs(1800)));
        assert!(timeouts.tasks.is_none());
    }

    #[test]
    fn pipeline_run_round_trips_through_legacy() {
        // A triplet with bucket budgets survives a trip through vA via the
        // preservation annotation.
        let current = PipelineRun {
            metadata: ObjectMeta::named("pr"),
            spec: PipelineRunSpec {
                pipeline_ref: Some(PipelineRef::named("release")),
                timeouts: Some(TimeoutFields {
                    pipeline: Some(ApiDuration::from_secs(3600)),
                    tasks: Some(ApiDuration::from_secs(1800)),
                    finally_: Some(ApiDuration::from_secs(600)),
                }),
                ..PipelineRunSpec::default()
            },
            status: PipelineRunStatus::default(),
        };

        let legacy = LegacyPipelineRun::from_current(&current).unwrap();
        assert_eq!(legacy.spec.timeout, Some(ApiDuration::from_secs(3600)));
        assert!(legacy
            .metadata
            .annotation(TIMEOUTS_ANNOTATION_KEY)
            .is_some());

        let restored = legacy.to_current().unwrap();
        assert_eq!(restored.spec.timeouts, current.spec.timeouts);
        // The preservation annotation is consumed on the way back.
        assert!(restored
            .metadata
            .annotation(TIMEOUTS_ANNOTATION_KEY)
            .is_none());
    }

    #[test]
    fn foreign_resolver_does_not_collapse_to_bundle() {
        let current = TaskRun {
            metadata: ObjectMeta::named("tr"),
            spec: TaskRunSpec {
                task_ref: Some(TaskRef {
                    name: String::new(),
                    resolver: "git".into(),
                    params: vec![Param::new("url", "https://example.com/repo.git")],
                }),
                ..TaskRunSpec::default()
            },
            status: TaskRunStatus::default(),
        };
        let err = LegacyTaskRun::from_current(&current).unwrap_err();
        assert!(matches!(err, ConvertError::UnknownEnum { .. }));
    }

    #[test]
    fn lifecycle_literals_round_trip() {
        for literal in [
            "PipelineRunPending",
            "Cancelled",
            "CancelledRunFinally",
            "StoppedRunFinally",
        ] {
            let legacy = LegacyPipelineRun {
                metadata: ObjectMeta::named("pr"),
                spec: LegacyPipelineRunSpec {
                    pipeline_ref: Some(LegacyPipelineRef {
                        name: "p".into(),
                        bundle: String::new(),
                    }),
                    status: literal.to_string(),
                    ..LegacyPipelineRunSpec::default()
                },
                status: PipelineRunStatus::default(),
            };
            let current = legacy.to_current().unwrap();
            let back = LegacyPipelineRun::from_current(&current).unwrap();
            assert_eq!(back.spec.status, literal);
        }
    }
}
