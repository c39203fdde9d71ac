//! Remote resolution contract.
//!
//! Refs that name a resolver instead of a stored object are delegated to a
//! collaborator behind this trait. The engine treats the returned bytes as
//! the inline spec source and is otherwise agnostic to how they were
//! fetched; retries and deadlines are the reconciler's concern.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use crate::error::{Error, Result};
use tenon_api::param::{Param, ParamValue};

/// The artifact a resolver returns.
#[derive(Debug, Clone)]
pub struct ResolvedArtifact {
    /// Raw spec bytes; parsed by the caller as the substrate's structured
    /// document format.
    pub bytes: Vec<u8>,
    /// Resolver-provided annotations (source revision, digest, ...).
    pub annotations: BTreeMap<String, String>,
}

/// Fetches remote specs on behalf of the reconcilers.
#[async_trait]
pub trait Resolver: Send + Sync {
    /// Resolves `params` through the named resolver.
    async fn resolve(&self, resolver_name: &str, params: &[Param]) -> Result<ResolvedArtifact>;
}

/// In-memory resolver for tests: artifacts are registered up front, keyed
/// by resolver name and the `bundle`/`url` param value.
#[derive(Debug, Default)]
pub struct InMemoryResolver {
    artifacts: RwLock<HashMap<(String, String), Vec<u8>>>,
}

impl InMemoryResolver {
    /// Creates an empty resolver.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an artifact under `(resolver_name, source)`.
    ///
    /// # Errors
    ///
    /// Returns an error if the registry lock is poisoned.
    pub fn register(&self, resolver_name: &str, source: &str, bytes: Vec<u8>) -> Result<()> {
        let mut artifacts = self
            .artifacts
            .write()
            .map_err(|_| Error::internal("resolver registry lock poisoned"))?;
        artifacts.insert((resolver_name.to_string(), source.to_string()), bytes);
        Ok(())
    }
}

#[async_trait]
impl Resolver for InMemoryResolver {
    async fn resolve(&self, resolver_name: &str, params: &[Param]) -> Result<ResolvedArtifact> {
        let source = params
            .iter()
            .find(|p| p.name == "bundle" || p.name == "url")
            .and_then(|p| match &p.value {
                ParamValue::String(s) => Some(s.clone()),
                _ => None,
            })
            .ok_or_else(|| Error::Resolution {
                message: format!("resolver \"{resolver_name}\" requires a bundle or url param"),
            })?;

        let artifacts = self
            .artifacts
            .read()
            .map_err(|_| Error::internal("resolver registry lock poisoned"))?;
        artifacts
            .get(&(resolver_name.to_string(), source.clone()))
            .map(|bytes| ResolvedArtifact {
                bytes: bytes.clone(),
                annotations: BTreeMap::new(),
            })
            .ok_or_else(|| Error::Resolution {
                message: format!("resolver \"{resolver_name}\" has no artifact for \"{source}\""),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::block_on;

    #[test]
    fn resolves_registered_artifacts() {
        let resolver = InMemoryResolver::new();
        resolver
            .register("bundles", "registry/catalog:v1", b"{}".to_vec())
            .unwrap();

        let artifact = block_on(resolver.resolve(
            "bundles",
            &[Param::new("bundle", "registry/catalog:v1")],
        ))
        .unwrap();
        assert_eq!(artifact.bytes, b"{}");
    }

    #[test]
    fn unknown_source_is_a_resolution_error() {
        let resolver = InMemoryResolver::new();
        let err = block_on(resolver.resolve("bundles", &[Param::new("bundle", "missing")]))
            .unwrap_err();
        assert!(matches!(err, Error::Resolution { .. }));
    }
}
