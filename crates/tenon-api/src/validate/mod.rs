//! Structured validation.
//!
//! Validation runs on admission and again on every reconcile entry.
//! Errors carry a message and the field paths they apply to; callers
//! aggregate every error found rather than failing at the first, so a bad
//! spec reports all of its problems in one pass.

mod pipeline;
mod run;
mod task;

use std::collections::HashSet;
use std::fmt;

use crate::duration::ApiDuration;

/// A single validation finding: a message plus the field paths it names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    /// Human-readable description of the problem.
    pub message: String,
    /// Dotted field paths the problem applies to.
    pub paths: Vec<String>,
}

impl FieldError {
    /// Creates an error with a single path.
    #[must_use]
    pub fn new(message: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            paths: vec![path.into()],
        }
    }

    /// A required field is absent.
    #[must_use]
    pub fn missing_field(path: impl Into<String>) -> Self {
        Self::new("missing field(s)", path)
    }

    /// Exactly one of several fields must be set, and none were.
    #[must_use]
    pub fn missing_one_of(paths: impl IntoIterator<Item = String>) -> Self {
        Self {
            message: "expected exactly one, got neither".to_string(),
            paths: paths.into_iter().collect(),
        }
    }

    /// Exactly one of several fields must be set, and more than one was.
    #[must_use]
    pub fn multiple_one_of(paths: impl IntoIterator<Item = String>) -> Self {
        Self {
            message: "expected exactly one, got both".to_string(),
            paths: paths.into_iter().collect(),
        }
    }

    /// A field holds an invalid value.
    #[must_use]
    pub fn invalid_value(value: impl fmt::Display, path: impl Into<String>) -> Self {
        Self::new(format!("invalid value: {value}"), path)
    }

    /// A `$(...)` reference names no declared symbol.
    #[must_use]
    pub fn non_existent_variable(literal: &str, path: impl Into<String>) -> Self {
        Self::new(format!("non-existent variable in \"{literal}\""), path)
    }

    /// A duration is negative.
    #[must_use]
    pub fn negative_duration(value: ApiDuration, path: impl Into<String>) -> Self {
        Self::new(format!("{value} should be >= 0"), path)
    }

    /// Prefixes every path with `field.`.
    #[must_use]
    pub fn via_field(mut self, field: &str) -> Self {
        for path in &mut self.paths {
            *path = if path.is_empty() {
                field.to_string()
            } else {
                format!("{field}.{path}")
            };
        }
        self
    }

    /// Prefixes every path with an index on `field` (e.g. `steps[2].`).
    #[must_use]
    pub fn via_index(self, field: &str, index: usize) -> Self {
        self.via_field(&format!("{field}[{index}]"))
    }
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.message, self.paths.join(", "))
    }
}

/// An aggregated list of validation findings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldErrorList {
    errors: Vec<FieldError>,
}

impl FieldErrorList {
    /// Creates an empty list.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true when no findings were recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    /// Returns the recorded findings.
    #[must_use]
    pub fn errors(&self) -> &[FieldError] {
        &self.errors
    }

    /// Records a finding.
    pub fn push(&mut self, error: FieldError) {
        self.errors.push(error);
    }

    /// Merges another list into this one.
    pub fn also(&mut self, other: Self) {
        self.errors.extend(other.errors);
    }

    /// Prefixes every finding's paths with `field.`.
    #[must_use]
    pub fn via_field(self, field: &str) -> Self {
        Self {
            errors: self
                .errors
                .into_iter()
                .map(|e| e.via_field(field))
                .collect(),
        }
    }

    /// Prefixes every finding's paths with an index on `field`.
    #[must_use]
    pub fn via_index(self, field: &str, index: usize) -> Self {
        Self {
            errors: self
                .errors
                .into_iter()
                .map(|e| e.via_index(field, index))
                .collect(),
        }
    }

    /// Converts the list into a `Result`: `Ok` when empty.
    ///
    /// # Errors
    ///
    /// Returns `self` when any finding was recorded.
    pub fn into_result(self) -> Result<(), Self> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl fmt::Display for FieldErrorList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered: Vec<String> = self.errors.iter().map(ToString::to_string).collect();
        write!(f, "{}", rendered.join("; "))
    }
}

impl std::error::Error for FieldErrorList {}

impl From<FieldError> for FieldErrorList {
    fn from(error: FieldError) -> Self {
        Self {
            errors: vec![error],
        }
    }
}

/// Types that validate themselves into an aggregated error list.
pub trait Validate {
    /// Runs every applicable rule, collecting all findings.
    fn validate(&self) -> FieldErrorList;
}

/// The set of symbols a `$(...)` reference may legally name at some scope.
///
/// String symbols satisfy plain and property references; array symbols
/// satisfy star and indexed references. Propagation merges outer scopes
/// (pipeline params, run params) into the set before inline specs are
/// checked.
#[derive(Debug, Clone, Default)]
pub(crate) struct DeclaredSymbols {
    pub(crate) strings: HashSet<String>,
    pub(crate) arrays: HashSet<String>,
}

impl DeclaredSymbols {
    /// Adds the symbols a list of param declarations contributes under the
    /// `params` scope.
    pub(crate) fn add_param_specs(&mut self, params: &[crate::param::ParamSpec]) {
        use crate::param::ParamType;
        for p in params {
            match p.type_ {
                ParamType::String => {
                    self.strings.insert(format!("params.{}", p.name));
                }
                ParamType::Array => {
                    self.arrays.insert(format!("params.{}", p.name));
                }
                ParamType::Object => {
                    for key in p.properties.keys() {
                        self.strings.insert(format!("params.{}.{key}", p.name));
                    }
                }
            }
        }
    }

    /// Adds the symbols supplied run params contribute, inferring shape
    /// from the supplied value.
    pub(crate) fn add_supplied_params(&mut self, params: &[crate::param::Param]) {
        use crate::param::ParamValue;
        for p in params {
            match &p.value {
                ParamValue::String(_) => {
                    self.strings.insert(format!("params.{}", p.name));
                }
                ParamValue::Array(_) => {
                    self.arrays.insert(format!("params.{}", p.name));
                }
                ParamValue::Object(map) => {
                    for key in map.keys() {
                        self.strings.insert(format!("params.{}.{key}", p.name));
                    }
                }
            }
        }
    }

    /// Merges another symbol set into this one.
    pub(crate) fn merge(&mut self, other: &Self) {
        self.strings.extend(other.strings.iter().cloned());
        self.arrays.extend(other.arrays.iter().cloned());
    }

    /// Returns true when the reference resolves against this set. A bare
    /// reference may name either a string or an array symbol: whole-array
    /// references are legal in array positions.
    pub(crate) fn resolves(&self, reference: &crate::subst::Reference) -> bool {
        let key = reference.key();
        match reference.accessor {
            crate::subst::Accessor::None => {
                self.strings.contains(&key) || self.arrays.contains(&key)
            }
            crate::subst::Accessor::Star | crate::subst::Accessor::Index(_) => {
                self.arrays.contains(&key)
            }
        }
    }
}

/// Checks supplied params against declarations: defaultless declared
/// params must be supplied, value shapes must match, and object params
/// must cover every required key.
///
/// Public entry point for the reconcilers' defense-in-depth pass over
/// specs fetched by reference, which the admission layer never saw.
#[must_use]
pub fn check_params(
    declared: &[crate::param::ParamSpec],
    supplied: &[crate::param::Param],
) -> FieldErrorList {
    run::check_supplied_params(declared, supplied, "params")
}

/// Validates a task spec with the run's supplied params propagated into
/// scope, the way admission validates inline specs.
///
/// Public entry point for the reconcilers' pass over specs fetched by
/// reference, which the admission layer never saw.
#[must_use]
pub fn check_task_spec(
    spec: &crate::task::TaskSpec,
    supplied: &[crate::param::Param],
) -> FieldErrorList {
    let mut propagated = DeclaredSymbols::default();
    propagated.add_supplied_params(supplied);
    task::validate_task_spec_with(spec, &propagated)
}

/// Validates a pipeline spec with the run's supplied params propagated into
/// scope. Companion to [`check_task_spec`] for referenced pipelines.
#[must_use]
pub fn check_pipeline_spec(
    spec: &crate::pipeline::PipelineSpec,
    supplied: &[crate::param::Param],
) -> FieldErrorList {
    let mut propagated = DeclaredSymbols::default();
    propagated.add_supplied_params(supplied);
    pipeline::validate_pipeline_spec_with(spec, &propagated)
}

/// Checks a set of sibling names for duplicates, reporting each duplicate
/// once at `field[<name>].name`.
pub(crate) fn check_unique_names<'a>(
    names: impl Iterator<Item = &'a str>,
    field: &str,
    errs: &mut FieldErrorList,
) {
    let mut seen: HashSet<&str> = HashSet::new();
    let mut reported: HashSet<&str> = HashSet::new();
    for name in names {
        if !seen.insert(name) && reported.insert(name) {
            errs.push(FieldError {
                message: "expected exactly one, got both".to_string(),
                paths: vec![format!("{field}[{name}].name")],
            });
        }
    }
}

/// Validates a name as a DNS label at the given path.
pub(crate) fn check_dns_label(name: &str, path: &str, errs: &mut FieldErrorList) {
    if let Err(e) = tenon_core::validate_dns_label(name) {
        let message = match e {
            tenon_core::Error::InvalidName { message } => message,
            other => other.to_string(),
        };
        errs.push(FieldError::new(message, path));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_aggregate_rather_than_short_circuit() {
        let mut errs = FieldErrorList::new();
        errs.push(FieldError::missing_field("spec.steps"));
        errs.push(FieldError::invalid_value("x", "spec.timeout"));
        assert_eq!(errs.errors().len(), 2);
        assert!(errs.into_result().is_err());
    }

    #[test]
    fn via_field_prefixes_paths() {
        let err = FieldError::missing_field("name").via_field("spec").via_field("task");
        assert_eq!(err.paths, vec!["task.spec.name"]);
    }

    #[test]
    fn via_index_renders_bracket_form() {
        let err = FieldError::missing_field("image").via_index("steps", 2);
        assert_eq!(err.paths, vec!["steps[2].image"]);
    }

    #[test]
    fn duplicate_names_reported_once_per_name() {
        let mut errs = FieldErrorList::new();
        check_unique_names(
            ["a", "b", "a", "a"].into_iter(),
            "spec.params",
            &mut errs,
        );
        assert_eq!(errs.errors().len(), 1);
        assert_eq!(errs.errors()[0].paths, vec!["spec.params[a].name"]);
    }

    #[test]
    fn negative_duration_message() {
        let err = FieldError::negative_duration(ApiDuration::from_secs(-10), "spec.timeout");
        assert!(err.message.contains("should be >= 0"));
    }
}
