//! Pluggable stores for every substrate interaction.
//!
//! The reconcilers never talk to the substrate directly; each collaborator
//! is an explicit interface supplied to the reconciler constructor. This
//! keeps the core logic state-less between reconciles and makes the whole
//! engine drivable from tests with in-memory implementations.
//!
//! ## Optimistic concurrency
//!
//! Status writes carry the `resource_version` the reconciler read. A write
//! against a stale version returns [`UpdateResult::Conflict`]; the caller
//! re-reads and retries. Stores must additionally refuse to downgrade a
//! terminal `Succeeded` condition regardless of version.

pub mod memory;

use async_trait::async_trait;

use crate::error::Result;
use crate::workload::Workload;
use tenon_api::pipeline::{Pipeline, PipelineSpec};
use tenon_api::pipelinerun::PipelineRun;
use tenon_api::task::Task;
use tenon_api::taskrun::TaskRun;
use tenon_api::workspace::VolumeClaimTemplate;

/// Result of an optimistic status write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateResult {
    /// The write was applied; the new resource version is returned.
    Applied {
        /// Version after the write.
        resource_version: u64,
    },
    /// The carried version was stale.
    Conflict {
        /// The version the substrate holds.
        actual: u64,
    },
    /// The object no longer exists.
    NotFound,
}

impl UpdateResult {
    /// Returns true when the write was applied.
    #[must_use]
    pub const fn is_applied(&self) -> bool {
        matches!(self, Self::Applied { .. })
    }
}

/// Store of TaskRun objects.
#[async_trait]
pub trait TaskRunStore: Send + Sync {
    /// Gets a TaskRun by namespace and name.
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<TaskRun>>;

    /// Creates a TaskRun. Creating an existing name is a no-op so that a
    /// repeated reconcile pass stays idempotent.
    async fn create(&self, run: &TaskRun) -> Result<()>;

    /// Writes the run's status with optimistic concurrency. The carried
    /// `metadata.resource_version` is compared against the stored one.
    async fn update_status(&self, run: &TaskRun) -> Result<UpdateResult>;

    /// Requests cancellation by setting the run's lifecycle field. Used by
    /// the pipeline engine to tear down children.
    async fn request_cancel(&self, namespace: &str, name: &str) -> Result<()>;
}

/// Store of PipelineRun objects.
#[async_trait]
pub trait PipelineRunStore: Send + Sync {
    /// Gets a PipelineRun by namespace and name.
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<PipelineRun>>;

    /// Writes the run's status with optimistic concurrency.
    async fn update_status(&self, run: &PipelineRun) -> Result<UpdateResult>;
}

/// Read-only catalog of stored Task and Pipeline definitions.
#[async_trait]
pub trait CatalogStore: Send + Sync {
    /// Fetches a stored Task by name.
    async fn get_task(&self, namespace: &str, name: &str) -> Result<Option<Task>>;

    /// Fetches a stored Pipeline by name.
    async fn get_pipeline(&self, namespace: &str, name: &str) -> Result<Option<Pipeline>>;
}

/// Store of workload objects on the substrate.
#[async_trait]
pub trait WorkloadStore: Send + Sync {
    /// Gets a workload by namespace and name.
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Workload>>;

    /// Creates a workload. Creating an existing name is a no-op.
    async fn create(&self, workload: &Workload) -> Result<()>;

    /// Deletes a workload (cancellation/timeout teardown). Deleting a
    /// missing workload is a no-op.
    async fn delete(&self, namespace: &str, name: &str) -> Result<()>;
}

/// Materializes volume-claim-template bindings.
#[async_trait]
pub trait ClaimStore: Send + Sync {
    /// Ensures exactly one claim exists for `(owner_uid, workspace_name)`
    /// and returns its name. Repeated calls return the same claim, which
    /// is how one claim is shared across a run's lifetime.
    async fn ensure_claim(
        &self,
        namespace: &str,
        owner_uid: &str,
        owner_name: &str,
        workspace_name: &str,
        template: &VolumeClaimTemplate,
    ) -> Result<String>;
}

/// Resolves the spec bytes a remote resolver returned into a concrete type.
///
/// # Errors
///
/// Returns a resolution error when the bytes do not parse.
pub fn parse_task_spec(bytes: &[u8]) -> Result<tenon_api::task::TaskSpec> {
    serde_json::from_slice(bytes).map_err(|e| crate::error::Error::Resolution {
        message: format!("resolved task spec does not parse: {e}"),
    })
}

/// Resolves pipeline spec bytes from a remote resolver.
///
/// # Errors
///
/// Returns a resolution error when the bytes do not parse.
pub fn parse_pipeline_spec(bytes: &[u8]) -> Result<PipelineSpec> {
    serde_json::from_slice(bytes).map_err(|e| crate::error::Error::Resolution {
        message: format!("resolved pipeline spec does not parse: {e}"),
    })
}
