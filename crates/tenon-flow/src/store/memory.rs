//! In-memory store implementations for testing.
//!
//! Thread-safe via `RwLock`, with the same observable semantics the
//! production substrate adapters must provide: resource-version bumping on
//! every write, conflict detection on stale status writes, and refusal to
//! downgrade a terminal condition.
//!
//! Not suitable for production: no durability, single-process only.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use tenon_core::Condition;

use super::{CatalogStore, ClaimStore, PipelineRunStore, TaskRunStore, UpdateResult, WorkloadStore};
use crate::error::{Error, Result};
use crate::workload::{Workload, WorkloadStatus};
use tenon_api::pipeline::Pipeline;
use tenon_api::pipelinerun::PipelineRun;
use tenon_api::task::Task;
use tenon_api::taskrun::{TaskRun, TaskRunSpecStatus};
use tenon_api::workspace::VolumeClaimTemplate;

type Key = (String, String);

/// Converts a lock poison error to a transient error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::transient("store lock poisoned")
}

fn key(namespace: &str, name: &str) -> Key {
    (namespace.to_string(), name.to_string())
}

/// In-memory TaskRun store.
#[derive(Debug, Default)]
pub struct InMemoryTaskRunStore {
    runs: RwLock<HashMap<Key, TaskRun>>,
    uid_counter: AtomicU64,
}

impl InMemoryTaskRunStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a run directly, assigning identity fields (test seeding).
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn seed(&self, mut run: TaskRun) -> Result<()> {
        self.assign_identity(&mut run.metadata);
        let mut runs = self.runs.write().map_err(poison_err)?;
        runs.insert(key(&run.metadata.namespace, &run.metadata.name), run);
        Ok(())
    }

    /// Returns the number of stored runs.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn len(&self) -> Result<usize> {
        Ok(self.runs.read().map_err(poison_err)?.len())
    }

    /// Returns true when no runs are stored.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Applies an out-of-band mutation (test helper for backdating
    /// timestamps or injecting lifecycle requests).
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned or the run is missing.
    pub fn mutate(
        &self,
        namespace: &str,
        name: &str,
        f: impl FnOnce(&mut TaskRun),
    ) -> Result<()> {
        let mut runs = self.runs.write().map_err(poison_err)?;
        let stored = runs
            .get_mut(&key(namespace, name))
            .ok_or_else(|| Error::NotFound {
                kind: "TaskRun",
                name: name.to_string(),
            })?;
        f(stored);
        let v = stored.metadata.resource_version.unwrap_or(0);
        stored.metadata.resource_version = Some(v + 1);
        Ok(())
    }

    fn assign_identity(&self, meta: &mut tenon_core::ObjectMeta) {
        if meta.uid.is_empty() {
            let n = self.uid_counter.fetch_add(1, Ordering::Relaxed);
            meta.uid = format!("uid-tr-{n}");
        }
        if meta.resource_version.is_none() {
            meta.resource_version = Some(1);
        }
        if meta.creation_timestamp.is_none() {
            meta.creation_timestamp = Some(chrono::Utc::now());
        }
    }
}

/// Refuses status writes that would move a terminal condition.
fn terminal_downgrade(stored: Option<&Condition>, incoming: Option<&Condition>) -> bool {
    match (stored, incoming) {
        (Some(s), Some(i)) if s.is_terminal() => s.status != i.status || s.reason != i.reason,
        (Some(s), None) if s.is_terminal() => true,
        _ => false,
    }
}

#[async_trait]
impl TaskRunStore for InMemoryTaskRunStore {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<TaskRun>> {
        let runs = self.runs.read().map_err(poison_err)?;
        Ok(runs.get(&key(namespace, name)).cloned())
    }

    async fn create(&self, run: &TaskRun) -> Result<()> {
        let mut runs = self.runs.write().map_err(poison_err)?;
        let k = key(&run.metadata.namespace, &run.metadata.name);
        if runs.contains_key(&k) {
            return Ok(());
        }
        let mut stored = run.clone();
        self.assign_identity(&mut stored.metadata);
        runs.insert(k, stored);
        Ok(())
    }

    async fn update_status(&self, run: &TaskRun) -> Result<UpdateResult> {
        let mut runs = self.runs.write().map_err(poison_err)?;
        let Some(stored) = runs.get_mut(&key(&run.metadata.namespace, &run.metadata.name)) else {
            return Ok(UpdateResult::NotFound);
        };

        let actual = stored.metadata.resource_version.unwrap_or(0);
        if run.metadata.resource_version.unwrap_or(0) != actual {
            return Ok(UpdateResult::Conflict { actual });
        }
        if terminal_downgrade(stored.status.succeeded(), run.status.succeeded()) {
            return Ok(UpdateResult::Conflict { actual });
        }

        stored.status = run.status.clone();
        let next = actual + 1;
        stored.metadata.resource_version = Some(next);
        Ok(UpdateResult::Applied {
            resource_version: next,
        })
    }

    async fn request_cancel(&self, namespace: &str, name: &str) -> Result<()> {
        let mut runs = self.runs.write().map_err(poison_err)?;
        if let Some(stored) = runs.get_mut(&key(namespace, name)) {
            if stored.spec.status.is_none() {
                stored.spec.status = Some(TaskRunSpecStatus::Cancelled);
                let v = stored.metadata.resource_version.unwrap_or(0);
                stored.metadata.resource_version = Some(v + 1);
            }
        }
        Ok(())
    }
}

/// In-memory PipelineRun store.
#[derive(Debug, Default)]
pub struct InMemoryPipelineRunStore {
    runs: RwLock<HashMap<Key, PipelineRun>>,
    uid_counter: AtomicU64,
}

impl InMemoryPipelineRunStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a run directly, assigning identity fields (test seeding).
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn seed(&self, mut run: PipelineRun) -> Result<()> {
        if run.metadata.uid.is_empty() {
            let n = self.uid_counter.fetch_add(1, Ordering::Relaxed);
            run.metadata.uid = format!("uid-pr-{n}");
        }
        if run.metadata.resource_version.is_none() {
            run.metadata.resource_version = Some(1);
        }
        let mut runs = self.runs.write().map_err(poison_err)?;
        runs.insert(key(&run.metadata.namespace, &run.metadata.name), run);
        Ok(())
    }

    /// Applies an out-of-band mutation (test helper for lifecycle requests
    /// such as cancellation, or backdating timestamps).
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned or the run is missing.
    pub fn mutate(
        &self,
        namespace: &str,
        name: &str,
        f: impl FnOnce(&mut PipelineRun),
    ) -> Result<()> {
        let mut runs = self.runs.write().map_err(poison_err)?;
        let stored = runs
            .get_mut(&key(namespace, name))
            .ok_or_else(|| Error::NotFound {
                kind: "PipelineRun",
                name: name.to_string(),
            })?;
        f(stored);
        let v = stored.metadata.resource_version.unwrap_or(0);
        stored.metadata.resource_version = Some(v + 1);
        Ok(())
    }
}

#[async_trait]
impl PipelineRunStore for InMemoryPipelineRunStore {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<PipelineRun>> {
        let runs = self.runs.read().map_err(poison_err)?;
        Ok(runs.get(&key(namespace, name)).cloned())
    }

    async fn update_status(&self, run: &PipelineRun) -> Result<UpdateResult> {
        let mut runs = self.runs.write().map_err(poison_err)?;
        let Some(stored) = runs.get_mut(&key(&run.metadata.namespace, &run.metadata.name)) else {
            return Ok(UpdateResult::NotFound);
        };

        let actual = stored.metadata.resource_version.unwrap_or(0);
        if run.metadata.resource_version.unwrap_or(0) != actual {
            return Ok(UpdateResult::Conflict { actual });
        }
        if terminal_downgrade(stored.status.succeeded(), run.status.succeeded()) {
            return Ok(UpdateResult::Conflict { actual });
        }

        stored.status = run.status.clone();
        let next = actual + 1;
        stored.metadata.resource_version = Some(next);
        Ok(UpdateResult::Applied {
            resource_version: next,
        })
    }
}

/// In-memory catalog of stored Tasks and Pipelines.
#[derive(Debug, Default)]
pub struct InMemoryCatalogStore {
    tasks: RwLock<HashMap<Key, Task>>,
    pipelines: RwLock<HashMap<Key, Pipeline>>,
}

impl InMemoryCatalogStore {
    /// Creates an empty catalog.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a Task.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn add_task(&self, task: Task) -> Result<()> {
        let mut tasks = self.tasks.write().map_err(poison_err)?;
        tasks.insert(key(&task.metadata.namespace, &task.metadata.name), task);
        Ok(())
    }

    /// Stores a Pipeline.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn add_pipeline(&self, pipeline: Pipeline) -> Result<()> {
        let mut pipelines = self.pipelines.write().map_err(poison_err)?;
        pipelines.insert(
            key(&pipeline.metadata.namespace, &pipeline.metadata.name),
            pipeline,
        );
        Ok(())
    }
}

#[async_trait]
impl CatalogStore for InMemoryCatalogStore {
    async fn get_task(&self, namespace: &str, name: &str) -> Result<Option<Task>> {
        let tasks = self.tasks.read().map_err(poison_err)?;
        Ok(tasks.get(&key(namespace, name)).cloned())
    }

    async fn get_pipeline(&self, namespace: &str, name: &str) -> Result<Option<Pipeline>> {
        let pipelines = self.pipelines.read().map_err(poison_err)?;
        Ok(pipelines.get(&key(namespace, name)).cloned())
    }
}

/// In-memory workload store with status helpers for driving tests.
#[derive(Debug, Default)]
pub struct InMemoryWorkloadStore {
    workloads: RwLock<HashMap<Key, Workload>>,
}

impl InMemoryWorkloadStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces a workload's status, simulating the substrate runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned or the workload is missing.
    pub fn set_status(&self, namespace: &str, name: &str, status: WorkloadStatus) -> Result<()> {
        let mut workloads = self.workloads.write().map_err(poison_err)?;
        let stored = workloads
            .get_mut(&key(namespace, name))
            .ok_or_else(|| Error::NotFound {
                kind: "Workload",
                name: name.to_string(),
            })?;
        stored.status = status;
        Ok(())
    }

    /// Returns the number of stored workloads.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn len(&self) -> Result<usize> {
        Ok(self.workloads.read().map_err(poison_err)?.len())
    }

    /// Returns true when no workloads are stored.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

#[async_trait]
impl WorkloadStore for InMemoryWorkloadStore {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Workload>> {
        let workloads = self.workloads.read().map_err(poison_err)?;
        Ok(workloads.get(&key(namespace, name)).cloned())
    }

    async fn create(&self, workload: &Workload) -> Result<()> {
        let mut workloads = self.workloads.write().map_err(poison_err)?;
        let k = key(&workload.metadata.namespace, &workload.metadata.name);
        workloads.entry(k).or_insert_with(|| workload.clone());
        Ok(())
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<()> {
        let mut workloads = self.workloads.write().map_err(poison_err)?;
        workloads.remove(&key(namespace, name));
        Ok(())
    }
}

/// In-memory claim store: one claim per `(owner_uid, workspace)`.
#[derive(Debug, Default)]
pub struct InMemoryClaimStore {
    claims: RwLock<HashMap<(String, String), String>>,
}

impl InMemoryClaimStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of materialized claims.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn claim_count(&self) -> Result<usize> {
        Ok(self.claims.read().map_err(poison_err)?.len())
    }
}

#[async_trait]
impl ClaimStore for InMemoryClaimStore {
    async fn ensure_claim(
        &self,
        _namespace: &str,
        owner_uid: &str,
        owner_name: &str,
        workspace_name: &str,
        _template: &VolumeClaimTemplate,
    ) -> Result<String> {
        let mut claims = self.claims.write().map_err(poison_err)?;
        let claim = claims
            .entry((owner_uid.to_string(), workspace_name.to_string()))
            .or_insert_with(|| tenon_core::child_name(owner_name, &format!("{workspace_name}-claim")))
            .clone();
        Ok(claim)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tenon_core::{ConditionStatus, ObjectMeta, SucceededReason};
    use tenon_api::taskrun::{TaskRunSpec, TaskRunStatus};
    use tokio_test::block_on;

    fn run(name: &str) -> TaskRun {
        TaskRun {
            metadata: ObjectMeta::namespaced(name, "default"),
            spec: TaskRunSpec::default(),
            status: TaskRunStatus::default(),
        }
    }

    #[test]
    fn create_is_idempotent() {
        let store = InMemoryTaskRunStore::new();
        block_on(store.create(&run("tr"))).unwrap();
        block_on(store.create(&run("tr"))).unwrap();
        assert_eq!(store.len().unwrap(), 1);
    }

    #[test]
    fn stale_status_write_conflicts() {
        let store = InMemoryTaskRunStore::new();
        store.seed(run("tr")).unwrap();

        let mut fresh = block_on(store.get("default", "tr")).unwrap().unwrap();
        fresh
            .status
            .set_condition(ConditionStatus::Unknown, SucceededReason::Running, "")
            .unwrap();
        assert!(block_on(store.update_status(&fresh)).unwrap().is_applied());

        // The first read is now stale.
        let mut stale = fresh;
        stale.metadata.resource_version = Some(1);
        let result = block_on(store.update_status(&stale)).unwrap();
        assert_eq!(result, UpdateResult::Conflict { actual: 2 });
    }

    #[test]
    fn terminal_condition_cannot_be_downgraded() {
        let store = InMemoryTaskRunStore::new();
        store.seed(run("tr")).unwrap();

        let mut done = block_on(store.get("default", "tr")).unwrap().unwrap();
        done.status
            .set_condition(ConditionStatus::True, SucceededReason::Succeeded, "done")
            .unwrap();
        assert!(block_on(store.update_status(&done)).unwrap().is_applied());

        let mut regress = block_on(store.get("default", "tr")).unwrap().unwrap();
        regress.status.conditions.clear();
        regress
            .status
            .set_condition(ConditionStatus::False, SucceededReason::Failed, "oops")
            .unwrap();
        let result = block_on(store.update_status(&regress)).unwrap();
        assert!(matches!(result, UpdateResult::Conflict { .. }));
    }

    #[test]
    fn request_cancel_sets_lifecycle_field() {
        let store = InMemoryTaskRunStore::new();
        store.seed(run("tr")).unwrap();
        block_on(store.request_cancel("default", "tr")).unwrap();
        let stored = block_on(store.get("default", "tr")).unwrap().unwrap();
        assert_eq!(stored.spec.status, Some(TaskRunSpecStatus::Cancelled));
    }

    #[test]
    fn claims_are_one_per_owner_and_workspace() {
        let store = InMemoryClaimStore::new();
        let template = VolumeClaimTemplate::default();
        let first = block_on(store.ensure_claim("ns", "uid-1", "pr", "data", &template)).unwrap();
        let again = block_on(store.ensure_claim("ns", "uid-1", "pr", "data", &template)).unwrap();
        let other = block_on(store.ensure_claim("ns", "uid-1", "pr", "cache", &template)).unwrap();
        assert_eq!(first, again);
        assert_ne!(first, other);
        assert_eq!(store.claim_count().unwrap(), 2);
    }
}
