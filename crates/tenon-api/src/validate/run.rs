//! TaskRun and PipelineRun validation.

use std::collections::{BTreeSet, HashMap};

use super::pipeline::validate_pipeline_spec_with;
use super::task::validate_task_spec_with;
use super::{check_dns_label, check_unique_names, DeclaredSymbols, FieldError, FieldErrorList, Validate};
use crate::duration::ApiDuration;
use crate::param::{Param, ParamSpec, ParamType};
use crate::pipelinerun::{PipelineRun, PipelineRunSpecStatus, TimeoutFields, DEFAULT_PIPELINE_TIMEOUT_SECS};
use crate::subst::find_references;
use crate::taskrun::TaskRun;
use crate::workspace::WorkspaceBinding;

impl Validate for TaskRun {
    fn validate(&self) -> FieldErrorList {
        let mut errs = FieldErrorList::new();
        check_dns_label(&self.metadata.name, "metadata.name", &mut errs);

        match (&self.spec.task_ref, &self.spec.task_spec) {
            (None, None) => errs.push(
                FieldError::missing_one_of(["taskRef".to_string(), "taskSpec".to_string()])
                    .via_field("spec"),
            ),
            (Some(_), Some(_)) => errs.push(
                FieldError::multiple_one_of(["taskRef".to_string(), "taskSpec".to_string()])
                    .via_field("spec"),
            ),
            (Some(r), None) => errs.also(
                super::pipeline::validate_task_ref(r)
                    .via_field("taskRef")
                    .via_field("spec"),
            ),
            (None, Some(_)) => {}
        }

        if let Some(timeout) = self.spec.timeout {
            if timeout.is_negative() {
                errs.push(FieldError::negative_duration(timeout, "spec.timeout"));
            }
        }

        check_unique_names(
            self.spec.params.iter().map(|p| p.name.as_str()),
            "spec.params",
            &mut errs,
        );
        errs.also(validate_workspace_bindings(&self.spec.workspaces).via_field("spec"));

        if let Some(task_spec) = &self.spec.task_spec {
            let mut propagated = DeclaredSymbols::default();
            propagated.add_supplied_params(&self.spec.params);
            errs.also(validate_task_spec_with(task_spec, &propagated).via_field("spec.taskSpec"));
            errs.also(check_supplied_params(
                &task_spec.params,
                &self.spec.params,
                "spec.params",
            ));
            errs.also(
                check_array_index_bounds(task_spec, &self.spec.params)
                    .via_field("spec.taskSpec"),
            );

            for (i, o) in self.spec.step_overrides.iter().enumerate() {
                if !task_spec.steps.iter().any(|s| s.name == o.name) {
                    errs.push(FieldError::invalid_value(
                        format!("no step named \"{}\"", o.name),
                        format!("spec.stepOverrides[{i}].name"),
                    ));
                }
            }
            for (i, o) in self.spec.sidecar_overrides.iter().enumerate() {
                if !task_spec.sidecars.iter().any(|s| s.name == o.name) {
                    errs.push(FieldError::invalid_value(
                        format!("no sidecar named \"{}\"", o.name),
                        format!("spec.sidecarOverrides[{i}].name"),
                    ));
                }
            }
        }

        errs
    }
}

impl Validate for PipelineRun {
    fn validate(&self) -> FieldErrorList {
        let mut errs = FieldErrorList::new();
        check_dns_label(&self.metadata.name, "metadata.name", &mut errs);

        match (&self.spec.pipeline_ref, &self.spec.pipeline_spec) {
            (None, None) => errs.push(FieldError::missing_one_of(
                ["spec.pipelineRef".to_string(), "spec.pipelineSpec".to_string()],
            )),
            (Some(_), Some(_)) => errs.push(FieldError::multiple_one_of(
                ["spec.pipelineRef".to_string(), "spec.pipelineSpec".to_string()],
            )),
            (Some(r), None) => {
                let as_task_ref = crate::pipeline::TaskRef {
                    name: r.name.clone(),
                    resolver: r.resolver.clone(),
                    params: r.params.clone(),
                };
                errs.also(
                    super::pipeline::validate_task_ref(&as_task_ref)
                        .via_field("pipelineRef")
                        .via_field("spec"),
                );
            }
            (None, Some(_)) => {}
        }

        if let Some(timeouts) = &self.spec.timeouts {
            errs.also(validate_timeouts(timeouts).via_field("spec.timeouts"));
        }

        check_unique_names(
            self.spec.params.iter().map(|p| p.name.as_str()),
            "spec.params",
            &mut errs,
        );
        errs.also(check_no_result_expressions(&self.spec.params));
        errs.also(validate_workspace_bindings(&self.spec.workspaces).via_field("spec"));

        // A run that has started may no longer be held pending.
        if self.requested_status() == Some(PipelineRunSpecStatus::Pending) && self.has_started() {
            errs.push(FieldError::invalid_value(
                "PipelineRun cannot be Pending after it is started",
                "spec.status",
            ));
        }

        if let Some(pipeline_spec) = &self.spec.pipeline_spec {
            let mut propagated = DeclaredSymbols::default();
            propagated.add_supplied_params(&self.spec.params);
            errs.also(validate_pipeline_spec_with(pipeline_spec, &propagated).via_field("spec"));
            errs.also(check_supplied_params(
                &pipeline_spec.params,
                &self.spec.params,
                "spec.params",
            ));
        }

        errs
    }
}

/// Enforces the timeout chain invariant:
/// `tasks <= pipeline`, `finally <= pipeline`, `tasks + finally <= pipeline`
/// when `pipeline > 0`, and zero `tasks`/`finally` only beside a zero
/// `pipeline`.
pub(crate) fn validate_timeouts(timeouts: &TimeoutFields) -> FieldErrorList {
    let mut errs = FieldErrorList::new();

    for (value, path) in [
        (timeouts.pipeline, "pipeline"),
        (timeouts.tasks, "tasks"),
        (timeouts.finally_, "finally"),
    ] {
        if let Some(d) = value {
            if d.is_negative() {
                errs.push(FieldError::negative_duration(d, path));
            }
        }
    }
    if !errs.is_empty() {
        return errs;
    }

    let pipeline = timeouts
        .pipeline
        .unwrap_or_else(|| ApiDuration::from_secs(DEFAULT_PIPELINE_TIMEOUT_SECS));

    let mut check_bucket = |bucket: Option<ApiDuration>, path: &str| {
        let Some(bucket) = bucket else { return };
        if bucket.is_zero() {
            if !pipeline.is_zero() {
                errs.push(FieldError::invalid_value(
                    format!("{path} timeout cannot be 0 unless pipeline timeout is also 0"),
                    path,
                ));
            }
        } else if !pipeline.is_zero() && bucket > pipeline {
            errs.push(FieldError::invalid_value(
                format!("{bucket} (\"{path}\") should be <= pipeline duration"),
                path,
            ));
        }
    };
    check_bucket(timeouts.tasks, "tasks");
    check_bucket(timeouts.finally_, "finally");

    if let (Some(tasks), Some(finally)) = (timeouts.tasks, timeouts.finally_) {
        if !pipeline.is_zero() && !tasks.is_zero() && !finally.is_zero() && tasks + finally > pipeline
        {
            errs.push(FieldError::invalid_value(
                format!("{tasks} + {finally} (\"tasks\" + \"finally\") should be <= pipeline duration"),
                "tasks",
            ));
        }
    }

    errs
}

/// PipelineRun parameter values may not consume task results; results only
/// exist inside the pipeline.
fn check_no_result_expressions(params: &[Param]) -> FieldErrorList {
    let mut errs = FieldErrorList::new();
    for param in params {
        let mut offending: Vec<String> = Vec::new();
        let mut scan = |text: &str, offending: &mut Vec<String>| {
            for reference in find_references(text) {
                if matches!(reference.scope(), "tasks" | "finally") {
                    offending.push(reference.key());
                }
            }
        };
        match &param.value {
            crate::param::ParamValue::String(s) => scan(s, &mut offending),
            crate::param::ParamValue::Array(items) => {
                for item in items {
                    scan(item, &mut offending);
                }
            }
            crate::param::ParamValue::Object(map) => {
                for v in map.values() {
                    scan(v, &mut offending);
                }
            }
        }
        if !offending.is_empty() {
            errs.push(FieldError::invalid_value(
                format!(
                    "cannot use result expressions in [{}] as PipelineRun parameter values",
                    offending.join(", ")
                ),
                format!("spec.params[{}].value", param.name),
            ));
        }
    }
    errs
}

/// Checks supplied run params against the declarations:
/// every defaultless declared param must be supplied, shapes must match,
/// and object params must cover every required key.
pub(crate) fn check_supplied_params(
    declared: &[ParamSpec],
    supplied: &[Param],
    path: &str,
) -> FieldErrorList {
    let mut errs = FieldErrorList::new();

    let missing: Vec<&str> = declared
        .iter()
        .filter(|d| d.default.is_none() && !supplied.iter().any(|s| s.name == d.name))
        .map(|d| d.name.as_str())
        .collect();
    if !missing.is_empty() {
        errs.push(FieldError::new(
            format!(
                "missing values for these params which have no default values: [{}]",
                missing.join(", ")
            ),
            path,
        ));
    }

    for param in supplied {
        let Some(decl) = declared.iter().find(|d| d.name == param.name) else {
            continue;
        };
        let got = param.value.param_type();
        if got != decl.type_ {
            errs.push(FieldError::invalid_value(
                format!(
                    "param \"{}\" value type {got} does not match declared type {}",
                    param.name, decl.type_
                ),
                format!("{path}[{}].value", param.name),
            ));
            continue;
        }
        if decl.type_ == ParamType::Object {
            let supplied_keys: BTreeSet<&str> = param
                .value
                .as_object()
                .map(|m| m.keys().map(String::as_str).collect())
                .unwrap_or_default();
            let defaulted_keys: BTreeSet<&str> = decl
                .default
                .as_ref()
                .and_then(crate::param::ParamValue::as_object)
                .map(|m| m.keys().map(String::as_str).collect())
                .unwrap_or_default();
            let missing_keys: Vec<&str> = decl
                .properties
                .keys()
                .map(String::as_str)
                .filter(|k| !supplied_keys.contains(k) && !defaulted_keys.contains(k))
                .collect();
            if !missing_keys.is_empty() {
                errs.push(FieldError::invalid_value(
                    format!(
                        "object param \"{}\" is missing keys [{}]",
                        param.name,
                        missing_keys.join(", ")
                    ),
                    format!("{path}[{}].value", param.name),
                ));
            }
        }
    }

    errs
}

/// Checks indexed array references against the concrete array lengths the
/// run will execute with (supplied values shadowing declared defaults).
/// An index past the end can never resolve, so it is rejected up front.
fn check_array_index_bounds(
    spec: &crate::task::TaskSpec,
    supplied: &[Param],
) -> FieldErrorList {
    let mut errs = FieldErrorList::new();

    let mut lengths: HashMap<String, usize> = HashMap::new();
    for decl in &spec.params {
        if let Some(crate::param::ParamValue::Array(items)) = &decl.default {
            lengths.insert(format!("params.{}", decl.name), items.len());
        }
    }
    for param in supplied {
        if let crate::param::ParamValue::Array(items) = &param.value {
            lengths.insert(format!("params.{}", param.name), items.len());
        }
    }

    let mut check = |text: &str, path: String, errs: &mut FieldErrorList| {
        for reference in find_references(text) {
            let crate::subst::Accessor::Index(i) = reference.accessor else {
                continue;
            };
            if let Some(&len) = lengths.get(&reference.key()) {
                if i >= len {
                    errs.push(FieldError::new(
                        format!(
                            "array index {i} out of bounds in \"{}\" (length {len})",
                            reference.raw
                        ),
                        path.clone(),
                    ));
                }
            }
        }
    };

    for (si, step) in spec.steps.iter().enumerate() {
        for (i, item) in step.command.iter().enumerate() {
            check(item, format!("steps[{si}].command[{i}]"), &mut errs);
        }
        for (i, item) in step.args.iter().enumerate() {
            check(item, format!("steps[{si}].args[{i}]"), &mut errs);
        }
        check(&step.script, format!("steps[{si}].script"), &mut errs);
        for (i, env) in step.env.iter().enumerate() {
            check(&env.value, format!("steps[{si}].env[{i}].value"), &mut errs);
        }
    }
    errs
}

/// Validates a run's workspace bindings: names unique, exactly one source
/// per binding.
pub(crate) fn validate_workspace_bindings(bindings: &[WorkspaceBinding]) -> FieldErrorList {
    let mut errs = FieldErrorList::new();
    check_unique_names(
        bindings.iter().map(|b| b.name.as_str()),
        "workspaces",
        &mut errs,
    );
    for (i, binding) in bindings.iter().enumerate() {
        match binding.source_count() {
            0 => errs.push(FieldError::missing_one_of([format!(
                "workspaces[{i}].source"
            )])),
            1 => {}
            _ => errs.push(FieldError::multiple_one_of([format!(
                "workspaces[{i}].source"
            )])),
        }
    }
    errs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::param::ParamValue;
    use crate::pipeline::{PipelineRef, PipelineSpec, PipelineTask};
    use crate::pipelinerun::{PipelineRunSpec, PipelineRunStatus};
    use crate::task::{Step, TaskSpec};
    use crate::taskrun::{TaskRunSpec, TaskRunStatus};
    use tenon_core::ObjectMeta;

    fn run_with(spec: PipelineRunSpec) -> PipelineRun {
        PipelineRun {
            metadata: ObjectMeta::named("pr"),
            spec,
            status: PipelineRunStatus::default(),
        }
    }

    fn task_run_with(spec: TaskRunSpec) -> TaskRun {
        TaskRun {
            metadata: ObjectMeta::named("tr"),
            spec,
            status: TaskRunStatus::default(),
        }
    }

    fn inline_task_spec() -> TaskSpec {
        TaskSpec {
            params: vec![ParamSpec::string("input")],
            steps: vec![Step {
                name: "run".into(),
                image: "alpine".into(),
                script: "echo $(params.input)".into(),
                ..Step::default()
            }],
            ..TaskSpec::default()
        }
    }

    #[test]
    fn taskrun_needs_ref_or_spec() {
        let errs = task_run_with(TaskRunSpec::default()).validate();
        assert!(errs
            .errors()
            .iter()
            .any(|e| e.message == "expected exactly one, got neither"));
    }

    #[test]
    fn taskrun_rejects_both_ref_and_spec() {
        let spec = TaskRunSpec {
            task_ref: Some(crate::pipeline::TaskRef::named("stored")),
            task_spec: Some(inline_task_spec()),
            params: vec![Param::new("input", "x")],
            ..TaskRunSpec::default()
        };
        let errs = task_run_with(spec).validate();
        assert!(errs
            .errors()
            .iter()
            .any(|e| e.message == "expected exactly one, got both"));
    }

    #[test]
    fn taskrun_negative_timeout_rejected() {
        let spec = TaskRunSpec {
            task_spec: Some(inline_task_spec()),
            params: vec![Param::new("input", "x")],
            timeout: Some(ApiDuration::from_secs(-172_800)),
            ..TaskRunSpec::default()
        };
        let errs = task_run_with(spec).validate();
        assert!(errs
            .errors()
            .iter()
            .any(|e| e.message.contains("should be >= 0") && e.paths == ["spec.timeout"]));
    }

    #[test]
    fn taskrun_missing_required_param_rejected() {
        let spec = TaskRunSpec {
            task_spec: Some(inline_task_spec()),
            ..TaskRunSpec::default()
        };
        let errs = task_run_with(spec).validate();
        assert!(errs
            .errors()
            .iter()
            .any(|e| e.message.contains("missing values for these params")));
    }

    #[test]
    fn taskrun_param_type_mismatch_rejected() {
        let spec = TaskRunSpec {
            task_spec: Some(inline_task_spec()),
            params: vec![Param::new(
                "input",
                ParamValue::Array(vec!["a".into()]),
            )],
            ..TaskRunSpec::default()
        };
        let errs = task_run_with(spec).validate();
        assert!(errs
            .errors()
            .iter()
            .any(|e| e.message.contains("does not match declared type")));
    }

    #[test]
    fn out_of_range_array_index_rejected() {
        let spec = TaskSpec {
            params: vec![ParamSpec::array("words")],
            steps: vec![Step {
                name: "run".into(),
                image: "alpine".into(),
                script: "echo $(params.words[5])".into(),
                ..Step::default()
            }],
            ..TaskSpec::default()
        };
        let run = task_run_with(TaskRunSpec {
            task_spec: Some(spec),
            params: vec![Param::new(
                "words",
                ParamValue::Array(vec!["one".into(), "two".into()]),
            )],
            ..TaskRunSpec::default()
        });
        let errs = run.validate();
        assert!(errs
            .errors()
            .iter()
            .any(|e| e.message.contains("array index 5 out of bounds")));

        // An in-range index is fine.
        let ok_spec = TaskSpec {
            params: vec![ParamSpec::array("words")],
            steps: vec![Step {
                name: "run".into(),
                image: "alpine".into(),
                script: "echo $(params.words[1])".into(),
                ..Step::default()
            }],
            ..TaskSpec::default()
        };
        let ok = task_run_with(TaskRunSpec {
            task_spec: Some(ok_spec),
            params: vec![Param::new(
                "words",
                ParamValue::Array(vec!["one".into(), "two".into()]),
            )],
            ..TaskRunSpec::default()
        });
        assert!(ok.validate().is_empty());
    }

    #[test]
    fn object_param_requires_declared_keys() {
        let mut decl = ParamSpec::string("endpoint");
        decl.type_ = ParamType::Object;
        decl.properties.insert("url".into(), crate::param::PropertySpec::default());
        decl.properties.insert("token".into(), crate::param::PropertySpec::default());
        let supplied = vec![Param::new(
            "endpoint",
            ParamValue::Object([("url".to_string(), "x".to_string())].into_iter().collect()),
        )];
        let errs = check_supplied_params(&[decl], &supplied, "spec.params");
        assert!(errs
            .errors()
            .iter()
            .any(|e| e.message.contains("missing keys [token]")));
    }

    #[test]
    fn pipelinerun_needs_ref_or_spec() {
        let errs = run_with(PipelineRunSpec::default()).validate();
        assert!(errs
            .errors()
            .iter()
            .any(|e| e.paths.contains(&"spec.pipelineRef".to_string())));
    }

    #[test]
    fn pending_after_start_rejected() {
        let mut pr = run_with(PipelineRunSpec {
            pipeline_ref: Some(PipelineRef::named("p")),
            status: Some(PipelineRunSpecStatus::Pending),
            ..PipelineRunSpec::default()
        });
        pr.status.start_time = Some(chrono::Utc::now());
        let errs = pr.validate();
        assert!(errs
            .errors()
            .iter()
            .any(|e| e.message.contains("cannot be Pending after it is started")));
    }

    #[test]
    fn pending_before_start_accepted() {
        let pr = run_with(PipelineRunSpec {
            pipeline_ref: Some(PipelineRef::named("p")),
            status: Some(PipelineRunSpecStatus::Pending),
            ..PipelineRunSpec::default()
        });
        assert!(pr.validate().is_empty());
    }

    #[test]
    fn result_expression_in_run_params_rejected() {
        let pr = run_with(PipelineRunSpec {
            pipeline_ref: Some(PipelineRef::named("p")),
            params: vec![Param::new("p1", "$(tasks.some-task.results.foo)")],
            ..PipelineRunSpec::default()
        });
        let errs = pr.validate();
        assert!(errs
            .errors()
            .iter()
            .any(|e| e.message.contains("cannot use result expressions")));
    }

    #[test]
    fn timeout_chain_tasks_exceeds_pipeline() {
        let errs = validate_timeouts(&TimeoutFields {
            pipeline: Some(ApiDuration::from_secs(600)),
            tasks: Some(ApiDuration::from_secs(900)),
            finally_: None,
        });
        assert!(errs
            .errors()
            .iter()
            .any(|e| e.message.contains("should be <= pipeline duration")));
    }

    #[test]
    fn timeout_chain_sum_exceeds_pipeline() {
        let errs = validate_timeouts(&TimeoutFields {
            pipeline: Some(ApiDuration::from_secs(600)),
            tasks: Some(ApiDuration::from_secs(400)),
            finally_: Some(ApiDuration::from_secs(300)),
        });
        assert!(errs
            .errors()
            .iter()
            .any(|e| e.message.contains("\"tasks\" + \"finally\"")));
    }

    #[test]
    fn zero_tasks_timeout_requires_zero_pipeline() {
        let errs = validate_timeouts(&TimeoutFields {
            pipeline: Some(ApiDuration::from_secs(600)),
            tasks: Some(ApiDuration::zero()),
            finally_: None,
        });
        assert!(!errs.is_empty());

        let both_zero = validate_timeouts(&TimeoutFields {
            pipeline: Some(ApiDuration::zero()),
            tasks: Some(ApiDuration::zero()),
            finally_: Some(ApiDuration::zero()),
        });
        assert!(both_zero.is_empty());
    }

    #[test]
    fn negative_pipeline_timeout_rejected() {
        let errs = validate_timeouts(&TimeoutFields {
            pipeline: Some(ApiDuration::from_secs(-48 * 3600)),
            tasks: None,
            finally_: None,
        });
        assert!(errs
            .errors()
            .iter()
            .any(|e| e.message.contains("should be >= 0")));
    }

    #[test]
    fn workspace_binding_needs_exactly_one_source() {
        let errs = validate_workspace_bindings(&[WorkspaceBinding {
            name: "data".into(),
            ..WorkspaceBinding::default()
        }]);
        assert!(errs
            .errors()
            .iter()
            .any(|e| e.message == "expected exactly one, got neither"));
    }

    #[test]
    fn duplicate_workspace_bindings_rejected() {
        let errs = validate_workspace_bindings(&[
            WorkspaceBinding::empty_dir("data"),
            WorkspaceBinding::empty_dir("data"),
        ]);
        assert!(errs
            .errors()
            .iter()
            .any(|e| e.paths == ["workspaces[data].name"]));
    }

    #[test]
    fn propagated_run_params_satisfy_inline_pipeline_references() {
        // Step references a param declared nowhere in the pipeline; the
        // run supplies it, so propagation makes it resolvable.
        let pipeline_spec = PipelineSpec {
            tasks: vec![PipelineTask {
                name: "echoit".into(),
                task_spec: Some(TaskSpec {
                    steps: vec![Step {
                        name: "echo".into(),
                        image: "ubuntu".into(),
                        command: vec!["echo".into()],
                        args: vec!["$(params.random-words[*])".into()],
                        ..Step::default()
                    }],
                    ..TaskSpec::default()
                }),
                ..PipelineTask::default()
            }],
            ..PipelineSpec::default()
        };

        let without = run_with(PipelineRunSpec {
            pipeline_spec: Some(pipeline_spec.clone()),
            ..PipelineRunSpec::default()
        });
        let errs = without.validate();
        assert!(errs
            .errors()
            .iter()
            .any(|e| e.message == "non-existent variable in \"$(params.random-words[*])\""));

        let with = run_with(PipelineRunSpec {
            pipeline_spec: Some(pipeline_spec),
            params: vec![Param::new(
                "random-words",
                ParamValue::Array(vec!["hello".into(), "pipeline".into()]),
            )],
            ..PipelineRunSpec::default()
        });
        assert!(with.validate().is_empty());
    }
}
