//! Pipeline validation.

use std::collections::{HashMap, HashSet, VecDeque};

use super::task::validate_task_spec_with;
use super::{check_dns_label, check_unique_names, DeclaredSymbols, FieldError, FieldErrorList, Validate};
use crate::param::{Param, ParamValue};
use crate::pipeline::{Pipeline, PipelineSpec, PipelineTask, TaskRef};
use crate::subst::find_references;

impl Validate for Pipeline {
    fn validate(&self) -> FieldErrorList {
        let mut errs = FieldErrorList::new();
        check_dns_label(&self.metadata.name, "metadata.name", &mut errs);
        errs.also(self.spec.validate().via_field("spec"));
        errs
    }
}

impl Validate for PipelineSpec {
    fn validate(&self) -> FieldErrorList {
        validate_pipeline_spec_with(self, &DeclaredSymbols::default())
    }
}

/// Validates a pipeline spec with extra propagated symbols in scope
/// (run-supplied params, when validating through a PipelineRun).
pub(crate) fn validate_pipeline_spec_with(
    spec: &PipelineSpec,
    propagated: &DeclaredSymbols,
) -> FieldErrorList {
    let mut errs = FieldErrorList::new();

    if spec.tasks.is_empty() {
        errs.push(FieldError::missing_field("tasks"));
    }

    check_unique_names(
        spec.all_tasks().map(|t| t.name.as_str()),
        "tasks",
        &mut errs,
    );
    check_unique_names(spec.params.iter().map(|p| p.name.as_str()), "params", &mut errs);
    check_unique_names(spec.results.iter().map(|r| r.name.as_str()), "results", &mut errs);
    check_unique_names(
        spec.workspaces.iter().map(|w| w.name.as_str()),
        "workspaces",
        &mut errs,
    );

    let regular_names: HashSet<&str> = spec.tasks.iter().map(|t| t.name.as_str()).collect();
    let mut pipeline_symbols = DeclaredSymbols::default();
    pipeline_symbols.add_param_specs(&spec.params);
    pipeline_symbols.merge(propagated);
    for key in [
        "context.pipeline.name",
        "context.pipelineRun.name",
        "context.pipelineRun.namespace",
        "context.pipelineRun.uid",
    ] {
        pipeline_symbols.strings.insert(key.to_string());
    }

    for (i, task) in spec.tasks.iter().enumerate() {
        errs.also(
            validate_pipeline_task(task, spec, &pipeline_symbols, &regular_names, false)
                .via_index("tasks", i),
        );
    }
    for (i, task) in spec.finally_tasks.iter().enumerate() {
        errs.also(
            validate_pipeline_task(task, spec, &pipeline_symbols, &regular_names, true)
                .via_index("finally", i),
        );
    }

    for (i, result) in spec.results.iter().enumerate() {
        errs.also(validate_pipeline_result_refs(&result.value, spec).via_index("results", i));
    }

    errs.also(check_acyclic(spec));
    errs
}

fn validate_pipeline_task(
    task: &PipelineTask,
    spec: &PipelineSpec,
    pipeline_symbols: &DeclaredSymbols,
    regular_names: &HashSet<&str>,
    is_finally: bool,
) -> FieldErrorList {
    let mut errs = FieldErrorList::new();
    check_dns_label(&task.name, "name", &mut errs);

    match (&task.task_ref, &task.task_spec) {
        (None, None) => errs.push(FieldError::missing_one_of(
            ["taskRef".to_string(), "taskSpec".to_string()],
        )),
        (Some(_), Some(_)) => errs.push(FieldError::multiple_one_of(
            ["taskRef".to_string(), "taskSpec".to_string()],
        )),
        (Some(r), None) => errs.also(validate_task_ref(r).via_field("taskRef")),
        (None, Some(_)) => {}
    }

    if is_finally && !task.run_after.is_empty() {
        errs.push(FieldError::invalid_value(
            "finally tasks cannot specify runAfter",
            "runAfter",
        ));
    }
    for (i, after) in task.run_after.iter().enumerate() {
        if !regular_names.contains(after.as_str()) {
            errs.push(FieldError::invalid_value(
                format!("task \"{after}\" does not exist"),
                format!("runAfter[{i}]"),
            ));
        }
    }

    if let Some(timeout) = task.timeout {
        if timeout.is_negative() {
            errs.push(FieldError::negative_duration(timeout, "timeout"));
        }
    }

    check_unique_names(task.params.iter().map(|p| p.name.as_str()), "params", &mut errs);
    for (i, param) in task.params.iter().enumerate() {
        errs.also(
            check_task_binding_refs(&param.value, spec, pipeline_symbols, regular_names, is_finally)
                .via_field("value")
                .via_index("params", i),
        );
    }

    for (i, when) in task.when.iter().enumerate() {
        if when.values.is_empty() {
            errs.push(FieldError::missing_field(format!("when[{i}].values")));
        }
        errs.also(
            check_task_binding_refs(
                &ParamValue::String(when.input.clone()),
                spec,
                pipeline_symbols,
                regular_names,
                is_finally,
            )
            .via_field(&format!("when[{i}].input")),
        );
    }

    for (i, binding) in task.workspaces.iter().enumerate() {
        if !binding.workspace.is_empty()
            && !spec.workspaces.iter().any(|w| w.name == binding.workspace)
        {
            errs.push(FieldError::invalid_value(
                format!(
                    "pipeline workspace \"{}\" does not exist",
                    binding.workspace
                ),
                format!("workspaces[{i}].workspace"),
            ));
        }
    }

    // Inline specs see task params, the bound param names, and everything
    // propagated from the pipeline and the run.
    if let Some(task_spec) = &task.task_spec {
        let mut inline = pipeline_symbols.clone();
        inline.add_supplied_params(&task.params);
        errs.also(validate_task_spec_with(task_spec, &inline).via_field("taskSpec"));
    }

    errs
}

/// Checks a `name` xor `resolver`+`params` reference.
pub(crate) fn validate_task_ref(r: &TaskRef) -> FieldErrorList {
    let mut errs = FieldErrorList::new();
    if r.is_remote() {
        if !r.name.is_empty() {
            errs.push(FieldError::multiple_one_of(
                ["name".to_string(), "resolver".to_string()],
            ));
        }
        errs.also(validate_resolver_params(&r.params));
    } else if !r.params.is_empty() {
        errs.push(FieldError::missing_field("resolver"));
    } else if r.name.is_empty() {
        errs.push(FieldError::missing_field("name"));
    }
    errs
}

/// Resolver parameters must be string-typed.
pub(crate) fn validate_resolver_params(params: &[Param]) -> FieldErrorList {
    let mut errs = FieldErrorList::new();
    for (i, p) in params.iter().enumerate() {
        let t = p.value.param_type();
        if t != crate::param::ParamType::String {
            errs.push(FieldError::new(
                format!("remote resolution parameter type must be string, not {t}"),
                format!("params[{i}]"),
            ));
        }
    }
    errs
}

/// Validates the references inside a pipeline-task param binding or `when`
/// input: `$(params.*)` against pipeline declarations and
/// `$(tasks.X.results.Y)` against the referenced task.
fn check_task_binding_refs(
    value: &ParamValue,
    spec: &PipelineSpec,
    pipeline_symbols: &DeclaredSymbols,
    regular_names: &HashSet<&str>,
    is_finally: bool,
) -> FieldErrorList {
    let mut errs = FieldErrorList::new();
    let mut walk = |text: &str, errs: &mut FieldErrorList| {
        for reference in find_references(text) {
            match reference.scope() {
                "params" | "context" => {
                    if !pipeline_symbols.resolves(&reference) {
                        errs.push(FieldError::non_existent_variable(&reference.raw, ""));
                    }
                }
                "tasks" => {
                    errs.also(check_result_reference(&reference.raw, &reference.path, spec, regular_names, is_finally));
                }
                _ => {}
            }
        }
    };
    match value {
        ParamValue::String(s) => walk(s, &mut errs),
        ParamValue::Array(items) => {
            for item in items {
                walk(item, &mut errs);
            }
        }
        ParamValue::Object(map) => {
            for v in map.values() {
                walk(v, &mut errs);
            }
        }
    }
    errs
}

/// Checks a `tasks.X.results.Y` (or `tasks.X.status` / `tasks.status`)
/// reference against the graph.
fn check_result_reference(
    raw: &str,
    path: &[String],
    spec: &PipelineSpec,
    regular_names: &HashSet<&str>,
    is_finally: bool,
) -> FieldErrorList {
    let mut errs = FieldErrorList::new();
    match path {
        // $(tasks.status) - aggregate status, finally only.
        [_, status] if status == "status" => {
            if !is_finally {
                errs.push(FieldError::non_existent_variable(raw, ""));
            }
        }
        // $(tasks.X.status) - finally only.
        [_, task, status] if status == "status" => {
            if !is_finally || !regular_names.contains(task.as_str()) {
                errs.push(FieldError::non_existent_variable(raw, ""));
            }
        }
        // $(tasks.X.results.Y)
        [_, task, results, result] if results == "results" => {
            if !regular_names.contains(task.as_str()) {
                errs.push(FieldError::non_existent_variable(raw, ""));
                return errs;
            }
            // Result declarations are only checkable for inline specs; a
            // taskRef's results are known after resolution.
            if let Some(referenced) = spec.task(task) {
                if let Some(task_spec) = &referenced.task_spec {
                    if task_spec.result(result).is_none() {
                        errs.push(FieldError::non_existent_variable(raw, ""));
                    }
                }
            }
        }
        _ => errs.push(FieldError::non_existent_variable(raw, "")),
    }
    errs
}

/// Validates the references inside a declared pipeline result expression.
fn validate_pipeline_result_refs(value: &str, spec: &PipelineSpec) -> FieldErrorList {
    let mut errs = FieldErrorList::new();
    for reference in find_references(value) {
        match reference.scope() {
            "tasks" | "finally" => {
                let [_, task, results, result] = reference.path.as_slice() else {
                    errs.push(FieldError::non_existent_variable(&reference.raw, "value"));
                    continue;
                };
                if results != "results" {
                    errs.push(FieldError::non_existent_variable(&reference.raw, "value"));
                    continue;
                }
                let referenced = if reference.scope() == "finally" {
                    spec.finally_task(task)
                } else {
                    spec.task(task)
                };
                let Some(referenced) = referenced else {
                    errs.push(FieldError::non_existent_variable(&reference.raw, "value"));
                    continue;
                };
                if let Some(task_spec) = &referenced.task_spec {
                    if task_spec.result(result).is_none() {
                        errs.push(FieldError::non_existent_variable(&reference.raw, "value"));
                    }
                }
            }
            "params" | "context" => {}
            _ => {}
        }
    }
    errs
}

/// Rejects cycles over explicit `runAfter` edges plus implicit edges from
/// `$(tasks.X.results.Y)` references. Kahn's algorithm over a name
/// adjacency map; any unvisited node indicates a cycle.
fn check_acyclic(spec: &PipelineSpec) -> FieldErrorList {
    let mut errs = FieldErrorList::new();
    let names: Vec<&str> = spec.tasks.iter().map(|t| t.name.as_str()).collect();
    let name_set: HashSet<&str> = names.iter().copied().collect();

    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
    let mut in_degree: HashMap<&str, usize> = names.iter().map(|n| (*n, 0)).collect();

    for task in &spec.tasks {
        let mut predecessors: HashSet<&str> = HashSet::new();
        for after in &task.run_after {
            if name_set.contains(after.as_str()) {
                predecessors.insert(after.as_str());
            }
        }
        let deps = task.result_dependencies();
        for dep in &deps {
            if let Some(&existing) = name_set.get(dep.as_str()) {
                if existing != task.name {
                    predecessors.insert(existing);
                }
            }
        }
        for pred in predecessors {
            dependents.entry(pred).or_default().push(task.name.as_str());
            if let Some(d) = in_degree.get_mut(task.name.as_str()) {
                *d += 1;
            }
        }
    }

    let mut queue: VecDeque<&str> = names
        .iter()
        .filter(|n| in_degree.get(*n).copied() == Some(0))
        .copied()
        .collect();
    let mut visited = 0;
    while let Some(n) = queue.pop_front() {
        visited += 1;
        for dep in dependents.get(n).map(Vec::as_slice).unwrap_or_default() {
            if let Some(d) = in_degree.get_mut(dep) {
                *d -= 1;
                if *d == 0 {
                    queue.push_back(dep);
                }
            }
        }
    }

    if visited != names.len() {
        let stuck: Vec<&str> = names
            .iter()
            .filter(|n| in_degree.get(*n).copied().unwrap_or(0) > 0)
            .copied()
            .collect();
        errs.push(FieldError::invalid_value(
            format!("cycle detected involving tasks: {}", stuck.join(", ")),
            "tasks",
        ));
    }
    errs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::param::ParamSpec;
    use crate::task::{Step, TaskResult, TaskSpec};

    fn inline_task(name: &str, script: &str) -> PipelineTask {
        PipelineTask {
            name: name.into(),
            task_spec: Some(TaskSpec {
                steps: vec![Step {
                    name: "run".into(),
                    image: "alpine".into(),
                    script: script.into(),
                    ..Step::default()
                }],
                ..TaskSpec::default()
            }),
            ..PipelineTask::default()
        }
    }

    #[test]
    fn empty_pipeline_rejected() {
        let errs = PipelineSpec::default().validate();
        assert!(errs.errors().iter().any(|e| e.paths == ["tasks"]));
    }

    #[test]
    fn valid_linear_pipeline_accepted() {
        let mut second = inline_task("second", "echo two");
        second.run_after = vec!["first".into()];
        let spec = PipelineSpec {
            tasks: vec![inline_task("first", "echo one"), second],
            ..PipelineSpec::default()
        };
        assert!(spec.validate().is_empty());
    }

    #[test]
    fn run_after_must_name_existing_task() {
        let mut t = inline_task("only", "echo hi");
        t.run_after = vec!["ghost".into()];
        let spec = PipelineSpec {
            tasks: vec![t],
            ..PipelineSpec::default()
        };
        let errs = spec.validate();
        assert!(errs
            .errors()
            .iter()
            .any(|e| e.message.contains("\"ghost\" does not exist")));
    }

    #[test]
    fn run_after_cycle_rejected() {
        let mut a = inline_task("a", "echo a");
        a.run_after = vec!["b".into()];
        let mut b = inline_task("b", "echo b");
        b.run_after = vec!["a".into()];
        let spec = PipelineSpec {
            tasks: vec![a, b],
            ..PipelineSpec::default()
        };
        let errs = spec.validate();
        assert!(errs
            .errors()
            .iter()
            .any(|e| e.message.contains("cycle detected")));
    }

    #[test]
    fn implicit_result_edge_cycle_rejected() {
        let mut producer = inline_task("producer", "echo x");
        if let Some(spec) = &mut producer.task_spec {
            spec.results = vec![TaskResult::string("out")];
        }
        producer.params = vec![Param::new("v", "$(tasks.consumer.results.out)")];
        let mut consumer = inline_task("consumer", "echo y");
        if let Some(spec) = &mut consumer.task_spec {
            spec.results = vec![TaskResult::string("out")];
        }
        consumer.params = vec![Param::new("v", "$(tasks.producer.results.out)")];
        let spec = PipelineSpec {
            tasks: vec![producer, consumer],
            ..PipelineSpec::default()
        };
        let errs = spec.validate();
        assert!(errs
            .errors()
            .iter()
            .any(|e| e.message.contains("cycle detected")));
    }

    #[test]
    fn result_reference_to_unknown_task_rejected() {
        let mut t = inline_task("solo", "echo hi");
        t.params = vec![Param::new("v", "$(tasks.ghost.results.out)")];
        let spec = PipelineSpec {
            tasks: vec![t],
            ..PipelineSpec::default()
        };
        let errs = spec.validate();
        assert!(errs
            .errors()
            .iter()
            .any(|e| e.message.contains("non-existent variable")));
    }

    #[test]
    fn finally_may_read_task_status() {
        let mut fin = inline_task("report", "echo status");
        fin.params = vec![Param::new("s", "$(tasks.build.status)")];
        let spec = PipelineSpec {
            tasks: vec![inline_task("build", "echo build")],
            finally_tasks: vec![fin],
            ..PipelineSpec::default()
        };
        assert!(spec.validate().is_empty());
    }

    #[test]
    fn regular_task_may_not_read_task_status() {
        let mut t = inline_task("watcher", "echo hi");
        t.params = vec![Param::new("s", "$(tasks.build.status)")];
        let spec = PipelineSpec {
            tasks: vec![inline_task("build", "echo build"), t],
            ..PipelineSpec::default()
        };
        let errs = spec.validate();
        assert!(!errs.is_empty());
    }

    #[test]
    fn finally_cannot_run_after() {
        let mut fin = inline_task("cleanup", "echo done");
        fin.run_after = vec!["build".into()];
        let spec = PipelineSpec {
            tasks: vec![inline_task("build", "echo build")],
            finally_tasks: vec![fin],
            ..PipelineSpec::default()
        };
        let errs = spec.validate();
        assert!(errs
            .errors()
            .iter()
            .any(|e| e.message.contains("finally tasks cannot specify runAfter")));
    }

    #[test]
    fn pipeline_params_propagate_into_inline_specs() {
        let spec = PipelineSpec {
            params: vec![ParamSpec::string("greeting")],
            tasks: vec![inline_task("echoer", "echo $(params.greeting)")],
            ..PipelineSpec::default()
        };
        assert!(spec.validate().is_empty());
    }

    #[test]
    fn pipeline_result_must_reference_existing_result() {
        let mut producer = inline_task("producer", "echo x");
        if let Some(ts) = &mut producer.task_spec {
            ts.results = vec![TaskResult::string("out")];
        }
        let spec = PipelineSpec {
            tasks: vec![producer],
            results: vec![crate::pipeline::PipelineResult {
                name: "final".into(),
                type_: crate::param::ParamType::String,
                value: "$(tasks.producer.results.nope)".into(),
                description: String::new(),
            }],
            ..PipelineSpec::default()
        };
        let errs = spec.validate();
        assert!(!errs.is_empty());
    }
}
