//! Typed variable substitution.
//!
//! Templates reference values as `$(scope.symbol)` with optional accessors:
//! `$(params.x)` (string), `$(params.x[*])` (array expansion),
//! `$(params.x[2])` (array index), `$(params.x.key)` (object property).
//! Scopes are flat string keys (`params.x`, `tasks.build.results.digest`,
//! `workspaces.out.path`, `context.taskRun.name`); binding helpers below
//! fan a [`ParamValue`] out into the right key shapes.
//!
//! Substitution is a pure function: the same `(template, bindings)` always
//! yields the same output. Unresolved references are left intact so the
//! validation layer can report them with their field path; `$$` sequences
//! are preserved literally and never start a reference.

use std::collections::BTreeMap;

use crate::param::ParamValue;

/// Accessor suffix on a reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Accessor {
    /// Plain reference: `$(params.x)`.
    None,
    /// Whole-array expansion: `$(params.x[*])`.
    Star,
    /// Single element: `$(params.x[2])`.
    Index(usize),
}

/// A parsed `$(...)` reference found in a template string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    /// The full matched text, including `$(` and `)`.
    pub raw: String,
    /// Dot-separated path segments (e.g. `["params", "x"]`).
    pub path: Vec<String>,
    /// Accessor suffix, if any.
    pub accessor: Accessor,
}

impl Reference {
    /// The lookup key for this reference: path segments joined with dots.
    #[must_use]
    pub fn key(&self) -> String {
        self.path.join(".")
    }

    /// The scope name: the first path segment.
    #[must_use]
    pub fn scope(&self) -> &str {
        self.path.first().map_or("", String::as_str)
    }
}

/// Scans a template for `$(...)` references.
///
/// Only well-formed identifier paths are treated as references; anything
/// else (notably shell arithmetic `$((...))`) is skipped, so references
/// nested inside non-reference parentheses are still found.
#[must_use]
pub fn find_references(template: &str) -> Vec<Reference> {
    let bytes = template.as_bytes();
    let mut refs = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] != b'$' {
            i += 1;
            continue;
        }
        // `$$` is a literal; neither dollar starts a reference.
        if bytes.get(i + 1) == Some(&b'$') {
            i += 2;
            continue;
        }
        if bytes.get(i + 1) != Some(&b'(') {
            i += 1;
            continue;
        }
        match parse_reference_body(template, i + 2) {
            Some((reference, end)) => {
                refs.push(reference);
                i = end;
            }
            None => i += 1,
        }
    }
    refs
}

/// Parses a reference body starting just after `$(`. Returns the parsed
/// reference and the index one past the closing `)`.
fn parse_reference_body(template: &str, start: usize) -> Option<(Reference, usize)> {
    let bytes = template.as_bytes();
    let mut path: Vec<String> = Vec::new();
    let mut segment = String::new();
    let mut accessor = Accessor::None;
    let mut i = start;

    loop {
        let b = *bytes.get(i)?;
        match b {
            b')' => {
                if segment.is_empty() && accessor == Accessor::None {
                    return None;
                }
                if !segment.is_empty() {
                    path.push(std::mem::take(&mut segment));
                }
                if path.len() < 2 {
                    return None;
                }
                let raw = template.get(start - 2..=i)?.to_string();
                return Some((
                    Reference {
                        raw,
                        path,
                        accessor,
                    },
                    i + 1,
                ));
            }
            b'.' => {
                if segment.is_empty() || accessor != Accessor::None {
                    return None;
                }
                path.push(std::mem::take(&mut segment));
                i += 1;
            }
            b'[' => {
                if segment.is_empty() || accessor != Accessor::None {
                    return None;
                }
                path.push(std::mem::take(&mut segment));
                let close = template[i..].find(']').map(|off| i + off)?;
                let inner = &template[i + 1..close];
                accessor = if inner == "*" {
                    Accessor::Star
                } else {
                    Accessor::Index(inner.parse().ok()?)
                };
                i = close + 1;
            }
            _ if b.is_ascii_alphanumeric() || b == b'_' || b == b'-' => {
                if accessor != Accessor::None {
                    return None;
                }
                segment.push(b as char);
                i += 1;
            }
            _ => return None,
        }
    }
}

/// A set of bindings for substitution.
///
/// String bindings resolve plain and object-property references; array
/// bindings resolve star and indexed references. Later bindings for the
/// same key shadow earlier ones, which is how per-task values take
/// precedence over propagated pipeline values.
#[derive(Debug, Clone, Default)]
pub struct Substitutions {
    strings: BTreeMap<String, String>,
    arrays: BTreeMap<String, Vec<String>>,
}

impl Substitutions {
    /// Creates an empty binding set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds a plain string under a fully-qualified key.
    pub fn bind_string(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.strings.insert(key.into(), value.into());
    }

    /// Binds an array under a fully-qualified key.
    pub fn bind_array(&mut self, key: impl Into<String>, items: Vec<String>) {
        self.arrays.insert(key.into(), items);
    }

    /// Binds a typed value under a fully-qualified key, fanning object
    /// properties out into per-key string bindings.
    pub fn bind_value(&mut self, key: &str, value: &ParamValue) {
        match value {
            ParamValue::String(s) => self.bind_string(key, s.clone()),
            ParamValue::Array(items) => self.bind_array(key, items.clone()),
            ParamValue::Object(map) => {
                for (prop, v) in map {
                    self.bind_string(format!("{key}.{prop}"), v.clone());
                }
            }
        }
    }

    /// Binds a parameter under the `params` scope.
    pub fn bind_param(&mut self, name: &str, value: &ParamValue) {
        self.bind_value(&format!("params.{name}"), value);
    }

    /// Returns the string bound to `key`, if any.
    #[must_use]
    pub fn string(&self, key: &str) -> Option<&str> {
        self.strings.get(key).map(String::as_str)
    }

    /// Returns the array bound to `key`, if any.
    #[must_use]
    pub fn array(&self, key: &str) -> Option<&[String]> {
        self.arrays.get(key).map(Vec::as_slice)
    }

    /// Resolves a single reference to its string form, if bound.
    ///
    /// Star references resolve to the elements joined with spaces (the
    /// string-position rendering used in scripts); indexed references
    /// resolve to the element or `None` when out of range.
    #[must_use]
    pub fn resolve(&self, reference: &Reference) -> Option<String> {
        let key = reference.key();
        match reference.accessor {
            Accessor::None => self.strings.get(&key).cloned(),
            Accessor::Star => self.arrays.get(&key).map(|items| items.join(" ")),
            Accessor::Index(i) => self.arrays.get(&key).and_then(|items| items.get(i)).cloned(),
        }
    }

    /// Applies string substitution to a template.
    ///
    /// Every bound reference is replaced; unresolved references and `$$`
    /// sequences pass through unchanged.
    #[must_use]
    pub fn apply_to_string(&self, template: &str) -> String {
        let refs = find_references(template);
        if refs.is_empty() {
            return template.to_string();
        }

        let mut out = String::with_capacity(template.len());
        let mut rest = template;
        for reference in &refs {
            let Some(pos) = rest.find(&reference.raw) else {
                continue;
            };
            out.push_str(&rest[..pos]);
            match self.resolve(reference) {
                Some(value) => out.push_str(&value),
                None => out.push_str(&reference.raw),
            }
            rest = &rest[pos + reference.raw.len()..];
        }
        out.push_str(rest);
        out
    }

    /// Applies substitution to an array field, splicing isolated array
    /// references in place.
    ///
    /// An item that is exactly `$(key[*])` (or a bare `$(key)` naming a
    /// bound array) expands to the array's elements as siblings; every
    /// other item goes through [`Self::apply_to_string`].
    #[must_use]
    pub fn expand_array(&self, items: &[String]) -> Vec<String> {
        let mut out = Vec::with_capacity(items.len());
        for item in items {
            if let Some(elements) = self.isolated_array_elements(item) {
                out.extend(elements.iter().cloned());
            } else {
                out.push(self.apply_to_string(item));
            }
        }
        out
    }

    /// Returns the bound elements when `item` is exactly one whole-array
    /// reference.
    fn isolated_array_elements(&self, item: &str) -> Option<&[String]> {
        let refs = find_references(item);
        let [only] = refs.as_slice() else {
            return None;
        };
        if only.raw != item {
            return None;
        }
        match only.accessor {
            Accessor::Star | Accessor::None => self.array(&only.key()),
            Accessor::Index(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subs() -> Substitutions {
        let mut s = Substitutions::new();
        s.bind_param("greeting", &ParamValue::String("hello".into()));
        s.bind_param(
            "words",
            &ParamValue::Array(vec!["alpha".into(), "beta".into(), "gamma".into()]),
        );
        s.bind_param(
            "endpoint",
            &ParamValue::Object(
                [("url".to_string(), "https://example.com".to_string())]
                    .into_iter()
                    .collect(),
            ),
        );
        s
    }

    #[test]
    fn finds_simple_references() {
        let refs = find_references("echo $(params.greeting) and $(params.words[*])");
        assert_eq!(refs.len(), 2);
        assert_eq!(refs[0].key(), "params.greeting");
        assert_eq!(refs[1].accessor, Accessor::Star);
    }

    #[test]
    fn skips_shell_arithmetic_but_finds_nested_references() {
        let refs = find_references("echo -n $(( \"$(params.a)\" * \"$(params.b)\" ))");
        let keys: Vec<String> = refs.iter().map(Reference::key).collect();
        assert_eq!(keys, vec!["params.a", "params.b"]);
    }

    #[test]
    fn double_dollar_is_literal() {
        assert!(find_references("$$(params.greeting)").is_empty());
        let s = subs();
        assert_eq!(
            s.apply_to_string("cost: $$100 $$(params.greeting)"),
            "cost: $$100 $$(params.greeting)"
        );
    }

    #[test]
    fn replaces_multiple_references_on_one_line() {
        let s = subs();
        assert_eq!(
            s.apply_to_string("$(params.greeting), $(params.greeting)!"),
            "hello, hello!"
        );
    }

    #[test]
    fn object_property_access() {
        let s = subs();
        assert_eq!(
            s.apply_to_string("curl $(params.endpoint.url)"),
            "curl https://example.com"
        );
    }

    #[test]
    fn unresolved_references_pass_through() {
        let s = subs();
        assert_eq!(
            s.apply_to_string("echo $(params.missing)"),
            "echo $(params.missing)"
        );
    }

    #[test]
    fn star_expansion_splices_siblings() {
        let s = subs();
        let expanded = s.expand_array(&[
            "--first".to_string(),
            "$(params.words[*])".to_string(),
            "--last".to_string(),
        ]);
        assert_eq!(expanded, vec!["--first", "alpha", "beta", "gamma", "--last"]);
    }

    #[test]
    fn indexed_access_resolves_elements() {
        let s = subs();
        assert_eq!(s.apply_to_string("$(params.words[1])"), "beta");
        // Out of range stays unresolved for validation to report.
        assert_eq!(
            s.apply_to_string("$(params.words[9])"),
            "$(params.words[9])"
        );
    }

    #[test]
    fn star_in_string_position_joins_with_spaces() {
        let s = subs();
        assert_eq!(
            s.apply_to_string("echo $(params.words[*])"),
            "echo alpha beta gamma"
        );
    }

    #[test]
    fn substitution_is_pure() {
        let s = subs();
        let template = "run $(params.greeting) $(params.words[0]) $(params.endpoint.url)";
        let first = s.apply_to_string(template);
        let second = s.apply_to_string(template);
        assert_eq!(first, second);
    }

    #[test]
    fn compound_task_result_keys() {
        let mut s = Substitutions::new();
        s.bind_string("tasks.build.results.digest", "sha256:abc");
        assert_eq!(
            s.apply_to_string("push $(tasks.build.results.digest)"),
            "push sha256:abc"
        );
    }
}
