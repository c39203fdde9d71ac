//! Object name rules.
//!
//! Every persisted object is keyed by `(kind, namespace, name)` where the
//! name is a DNS label. Objects created on behalf of a run (the workload for
//! a TaskRun, the child TaskRuns of a PipelineRun) derive their names
//! deterministically from the parent name so that reconciliation is
//! idempotent: re-running the same pass computes the same child name and
//! finds the object it already created.

use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Maximum length of a DNS label.
pub const MAX_NAME_LENGTH: usize = 63;

/// Validates that `name` is a well-formed DNS label.
///
/// A valid label is 1-63 characters of `[a-z0-9-]`, starting and ending
/// with an alphanumeric character.
///
/// # Errors
///
/// Returns [`Error::InvalidName`] describing the first violation found.
pub fn validate_dns_label(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::invalid_name("name must not be empty"));
    }
    if name.len() > MAX_NAME_LENGTH {
        return Err(Error::invalid_name(format!(
            "name '{name}' is longer than {MAX_NAME_LENGTH} characters"
        )));
    }
    if !name
        .bytes()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
    {
        return Err(Error::invalid_name(format!(
            "invalid resource name \"{name}\": must be a valid DNS label"
        )));
    }
    let starts_ok = name
        .as_bytes()
        .first()
        .is_some_and(u8::is_ascii_alphanumeric);
    let ends_ok = name
        .as_bytes()
        .last()
        .is_some_and(u8::is_ascii_alphanumeric);
    if !starts_ok || !ends_ok {
        return Err(Error::invalid_name(format!(
            "invalid resource name \"{name}\": must start and end with an alphanumeric character"
        )));
    }
    Ok(())
}

/// Derives a deterministic child object name from a parent name and suffix.
///
/// The common case is simple concatenation: `{parent}-{suffix}`. When the
/// concatenation would exceed the DNS-label limit, the tail is replaced by a
/// truncated SHA-256 of the full logical name, keeping the result stable for
/// the same inputs while staying within the limit.
///
/// # Properties
///
/// - **Deterministic**: same `(parent, suffix)` always produces the same name
/// - **Collision-resistant**: distinct logical names hash to distinct tails
/// - **Valid**: the output is always a well-formed DNS label if the parent is
#[must_use]
pub fn child_name(parent: &str, suffix: &str) -> String {
    let full = format!("{parent}-{suffix}");
    if full.len() <= MAX_NAME_LENGTH {
        return full;
    }

    let mut hasher = Sha256::new();
    hasher.update(full.as_bytes());
    let digest = hasher.finalize();
    // 8 bytes = 16 hex chars of tail is plenty to disambiguate truncations.
    let tail: String = digest[..8].iter().map(|b| format!("{b:02x}")).collect();

    let keep = MAX_NAME_LENGTH - tail.len() - 1;
    let mut head: String = full.chars().take(keep).collect();
    // The truncation point may land on a '-'; trim so the label stays valid.
    while head.ends_with('-') {
        head.pop();
    }
    format!("{head}-{tail}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_simple_names() {
        validate_dns_label("build-and-push").unwrap();
        validate_dns_label("task1").unwrap();
        validate_dns_label("a").unwrap();
    }

    #[test]
    fn rejects_invalid_names() {
        assert!(validate_dns_label("").is_err());
        assert!(validate_dns_label("Capitalized").is_err());
        assert!(validate_dns_label("has.dots").is_err());
        assert!(validate_dns_label("pipelinerun,name").is_err());
        assert!(validate_dns_label("-leading-dash").is_err());
        assert!(validate_dns_label("trailing-dash-").is_err());
        assert!(validate_dns_label(&"x".repeat(64)).is_err());
    }

    #[test]
    fn short_child_names_concatenate() {
        assert_eq!(child_name("run", "fetch"), "run-fetch");
    }

    #[test]
    fn long_child_names_are_truncated_deterministically() {
        let parent = "a".repeat(60);
        let one = child_name(&parent, "some-long-pipeline-task-name");
        let two = child_name(&parent, "some-long-pipeline-task-name");
        assert_eq!(one, two);
        assert!(one.len() <= MAX_NAME_LENGTH);
        validate_dns_label(&one).unwrap();
    }

    #[test]
    fn distinct_long_names_do_not_collide() {
        let parent = "b".repeat(60);
        let one = child_name(&parent, "task-one");
        let two = child_name(&parent, "task-two");
        assert_ne!(one, two);
    }
}
