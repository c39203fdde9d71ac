//! Task validation.

use super::{check_dns_label, check_unique_names, DeclaredSymbols, FieldError, FieldErrorList, Validate};
use crate::param::{ParamSpec, ParamType};
use crate::subst::{find_references, Accessor};
use crate::task::{Sidecar, Step, Task, TaskSpec};

/// Scopes a task-level reference may name.
const TASK_SCOPES: [&str; 4] = ["params", "results", "workspaces", "context"];

impl Validate for Task {
    fn validate(&self) -> FieldErrorList {
        let mut errs = FieldErrorList::new();
        check_dns_label(&self.metadata.name, "metadata.name", &mut errs);
        errs.also(self.spec.validate().via_field("spec"));
        errs
    }
}

impl Validate for TaskSpec {
    fn validate(&self) -> FieldErrorList {
        validate_task_spec_with(self, &DeclaredSymbols::default())
    }
}

/// Validates a task spec with extra propagated symbols in scope.
///
/// Standalone tasks validate with an empty extra set; pipelines and runs
/// pass the params that propagate into inline specs.
pub(crate) fn validate_task_spec_with(
    spec: &TaskSpec,
    propagated: &DeclaredSymbols,
) -> FieldErrorList {
    let mut errs = FieldErrorList::new();

    if spec.steps.is_empty() {
        errs.push(FieldError::missing_field("steps"));
    }

    check_unique_names(
        spec.steps
            .iter()
            .map(|s| s.name.as_str())
            .chain(spec.sidecars.iter().map(|s| s.name.as_str()))
            .filter(|n| !n.is_empty()),
        "steps",
        &mut errs,
    );
    check_unique_names(spec.params.iter().map(|p| p.name.as_str()), "params", &mut errs);
    check_unique_names(spec.results.iter().map(|r| r.name.as_str()), "results", &mut errs);
    check_unique_names(
        spec.workspaces.iter().map(|w| w.name.as_str()),
        "workspaces",
        &mut errs,
    );

    for (i, param) in spec.params.iter().enumerate() {
        errs.also(validate_param_spec(param).via_index("params", i));
    }

    let mut symbols = declared_task_symbols(spec);
    symbols.merge(propagated);

    for (i, step) in spec.steps.iter().enumerate() {
        errs.also(validate_step(step, &symbols).via_index("steps", i));
    }
    for (i, sidecar) in spec.sidecars.iter().enumerate() {
        errs.also(validate_sidecar(sidecar, &symbols).via_index("sidecars", i));
    }

    errs
}

/// Computes the symbols a task declares for its own steps.
pub(crate) fn declared_task_symbols(spec: &TaskSpec) -> DeclaredSymbols {
    let mut symbols = DeclaredSymbols::default();
    symbols.add_param_specs(&spec.params);
    for result in &spec.results {
        symbols.strings.insert(format!("results.{}.path", result.name));
    }
    for ws in &spec.workspaces {
        symbols.strings.insert(format!("workspaces.{}.path", ws.name));
        symbols.strings.insert(format!("workspaces.{}.bound", ws.name));
    }
    for key in ["context.task.name", "context.taskRun.name", "context.taskRun.namespace", "context.taskRun.uid"] {
        symbols.strings.insert(key.to_string());
    }
    symbols
}

fn validate_param_spec(param: &ParamSpec) -> FieldErrorList {
    let mut errs = FieldErrorList::new();
    if param.name.is_empty() {
        errs.push(FieldError::missing_field("name"));
    }
    if let Some(default) = &param.default {
        if default.param_type() != param.type_ {
            errs.push(FieldError::invalid_value(
                format!(
                    "default type {} does not match declared type {}",
                    default.param_type(),
                    param.type_
                ),
                "default",
            ));
        }
    }
    if param.type_ == ParamType::Object && param.properties.is_empty() {
        errs.push(FieldError::missing_field("properties"));
    }
    errs
}

fn validate_step(step: &Step, symbols: &DeclaredSymbols) -> FieldErrorList {
    let mut errs = FieldErrorList::new();
    if !step.name.is_empty() {
        check_dns_label(&step.name, "name", &mut errs);
    }
    if step.image.is_empty() {
        errs.push(FieldError::missing_field("image"));
    }
    if !step.script.is_empty() && !step.command.is_empty() {
        errs.push(FieldError::multiple_one_of(
            ["script".to_string(), "command".to_string()],
        ));
    }

    // Array-expandable positions accept star references.
    for (i, item) in step.command.iter().enumerate() {
        check_references(item, symbols, true, &format!("command[{i}]"), &mut errs);
    }
    for (i, item) in step.args.iter().enumerate() {
        check_references(item, symbols, true, &format!("args[{i}]"), &mut errs);
    }
    check_references(&step.script, symbols, true, "script", &mut errs);

    // String-only positions reject star references.
    check_references(&step.image, symbols, false, "image", &mut errs);
    check_references(&step.working_dir, symbols, false, "workingDir", &mut errs);
    for (i, env) in step.env.iter().enumerate() {
        check_references(&env.value, symbols, false, &format!("env[{i}].value"), &mut errs);
    }
    errs
}

fn validate_sidecar(sidecar: &Sidecar, symbols: &DeclaredSymbols) -> FieldErrorList {
    let mut errs = FieldErrorList::new();
    if !sidecar.name.is_empty() {
        check_dns_label(&sidecar.name, "name", &mut errs);
    }
    if sidecar.image.is_empty() {
        errs.push(FieldError::missing_field("image"));
    }
    if !sidecar.script.is_empty() && !sidecar.command.is_empty() {
        errs.push(FieldError::multiple_one_of(
            ["script".to_string(), "command".to_string()],
        ));
    }
    for (i, item) in sidecar.args.iter().enumerate() {
        check_references(item, symbols, true, &format!("args[{i}]"), &mut errs);
    }
    check_references(&sidecar.script, symbols, true, "script", &mut errs);
    for (i, env) in sidecar.env.iter().enumerate() {
        check_references(&env.value, symbols, false, &format!("env[{i}].value"), &mut errs);
    }
    errs
}

/// Walks one string field's references against the declared symbol set.
///
/// `array_position` marks fields that accept array expansion; a star
/// reference elsewhere is an error even when the symbol exists.
pub(crate) fn check_references(
    field_value: &str,
    symbols: &DeclaredSymbols,
    array_position: bool,
    path: &str,
    errs: &mut FieldErrorList,
) {
    for reference in find_references(field_value) {
        if !TASK_SCOPES.contains(&reference.scope()) {
            continue;
        }
        if !array_position && reference.accessor == Accessor::Star {
            errs.push(FieldError::new(
                format!("variable type invalid in \"{}\"", reference.raw),
                path,
            ));
            continue;
        }
        if !symbols.resolves(&reference) {
            errs.push(FieldError::non_existent_variable(&reference.raw, path));
        }
    }
}
