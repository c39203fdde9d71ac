//! The PipelineRun reconciler.
//!
//! One pass plans the task DAG and drives it one step further: gather the
//! terminal state of every child TaskRun, skip tasks whose predecessors
//! failed or whose `when` guards do not hold, dispatch every ready task in
//! declaration order, move to the `finally` group once the regular phase is
//! terminal, aggregate declared pipeline results, and compute the
//! `Succeeded` condition.
//!
//! Child status is only read after the child's own condition is terminal;
//! in-flight children contribute nothing but the fact that the pipeline is
//! still running.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::Utc;
use tenon_core::{child_name, ConditionStatus, ObjectMeta, OwnerReference, SucceededReason};

use crate::dag::TaskGraph;
use crate::error::{Error, Result};
use crate::queue::{Key, Kind, Outcome, Reconcile};
use crate::resolver::Resolver;
use crate::store::{parse_pipeline_spec, CatalogStore, ClaimStore, PipelineRunStore, TaskRunStore, UpdateResult};
use crate::workspace::child_bindings;
use tenon_api::duration::ApiDuration;
use tenon_api::param::{Param, ParamValue};
use tenon_api::pipeline::{PipelineSpec, PipelineTask, TaskRef};
use tenon_api::pipelinerun::{
    ChildReference, PipelineRun, PipelineRunResult, PipelineRunSpecStatus, SkipReason, SkippedTask,
};
use tenon_api::subst::{find_references, Substitutions};
use tenon_api::taskrun::{TaskRun, TaskRunSpec};
use tenon_api::validate::Validate;
use tenon_api::workspace::{PersistentVolumeClaimSource, WorkspaceBinding};

/// How one pipeline task currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskView {
    /// No child TaskRun exists yet.
    NotCreated,
    /// A child exists but its condition is not terminal.
    InFlight,
    /// The child succeeded.
    Succeeded,
    /// The child failed (including timeout).
    Failed,
    /// The child was cancelled.
    Cancelled,
    /// The engine decided not to run the task.
    Skipped,
}

impl TaskView {
    const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::Cancelled | Self::Skipped
        )
    }
}

/// A pass-local snapshot of the whole pipeline.
struct PipelineState {
    views: HashMap<String, TaskView>,
    results: HashMap<String, Vec<(String, ParamValue)>>,
    new_skips: Vec<SkippedTask>,
    /// Set when a child failed because its referenced task could not be
    /// fetched; surfaces as `CouldntGetTask` instead of the generic
    /// failure reason.
    resolution_failed: Option<String>,
}

impl PipelineState {
    fn view(&self, task: &str) -> TaskView {
        self.views.get(task).copied().unwrap_or(TaskView::NotCreated)
    }

    fn skip(&mut self, task: &str, reason: SkipReason) {
        self.views.insert(task.to_string(), TaskView::Skipped);
        self.new_skips.push(SkippedTask {
            name: task.to_string(),
            reason,
        });
    }

    fn all_terminal<'a>(&self, tasks: impl Iterator<Item = &'a PipelineTask>) -> bool {
        tasks.into_iter().all(|t| self.view(&t.name).is_terminal())
    }

    fn count(&self, view: TaskView) -> usize {
        self.views.values().filter(|v| **v == view).count()
    }
}

/// Reconciles PipelineRuns by planning the DAG and driving child TaskRuns.
pub struct PipelineRunReconciler {
    runs: Arc<dyn PipelineRunStore>,
    task_runs: Arc<dyn TaskRunStore>,
    catalog: Arc<dyn CatalogStore>,
    resolver: Arc<dyn Resolver>,
    claims: Arc<dyn ClaimStore>,
}

impl PipelineRunReconciler {
    /// Creates a reconciler over explicit store interfaces.
    #[must_use]
    pub fn new(
        runs: Arc<dyn PipelineRunStore>,
        task_runs: Arc<dyn TaskRunStore>,
        catalog: Arc<dyn CatalogStore>,
        resolver: Arc<dyn Resolver>,
        claims: Arc<dyn ClaimStore>,
    ) -> Self {
        Self {
            runs,
            task_runs,
            catalog,
            resolver,
            claims,
        }
    }

    /// Runs one reconcile pass.
    ///
    /// # Errors
    ///
    /// Retryable errors bubble up for the queue to back off on; terminal
    /// run outcomes are written to status and return `Ok`.
    #[tracing::instrument(skip(self))]
    pub async fn reconcile(&self, namespace: &str, name: &str) -> Result<Outcome> {
        let Some(mut run) = self.runs.get(namespace, name).await? else {
            return Ok(Outcome::Done);
        };
        if run.is_done() {
            return Ok(Outcome::Done);
        }

        let validation = run.validate();
        if !validation.is_empty() {
            run.status.set_condition(
                ConditionStatus::False,
                SucceededReason::PipelineRunValidationFailed,
                validation.to_string(),
            )?;
            return self.finish(&run).await;
        }

        // A held run is observed but schedules nothing until released.
        if run.requested_status() == Some(PipelineRunSpecStatus::Pending) {
            run.status.set_condition(
                ConditionStatus::Unknown,
                SucceededReason::Pending,
                "PipelineRun is pending",
            )?;
            return self.finish(&run).await;
        }

        if run.status.start_time.is_none() {
            run.status.start_time = Some(Utc::now());
            run.status.set_condition(
                ConditionStatus::Unknown,
                SucceededReason::Running,
                "PipelineRun started",
            )?;
        }

        let spec = match &run.status.pipeline_spec {
            Some(frozen) => frozen.clone(),
            None => match self.resolve_pipeline_spec(&mut run).await {
                Ok(spec) => spec,
                Err(outcome) => return outcome,
            },
        };

        // Graph safety is re-checked every pass (defense in depth).
        let graph = build_graph(&spec)?;
        graph.check_acyclic()?;

        let bindings = self.concretize_claims(&run).await?;
        let mut state = self.gather_state(&run, &spec).await?;

        let cancel_mode = run.requested_status();
        let pipeline_timed_out = self.pipeline_deadline_elapsed(&run);

        // The tasks bucket only counts as exhausted if the regular phase
        // was still incomplete when it elapsed; a bucket that expires after
        // every regular task already finished is not a timeout. The
        // incomplete-at-expiry fact is reconstructed from recorded skips
        // and engine-initiated child cancellations, both of which persist.
        let regular_pending = !state.all_terminal(spec.tasks.iter());
        let timeout_skip_recorded = run
            .status
            .skipped_tasks
            .iter()
            .any(|s| s.reason == SkipReason::PipelineTimedOutSkipped);
        let engine_cancelled = cancel_mode.is_none()
            && spec
                .tasks
                .iter()
                .any(|t| state.view(&t.name) == TaskView::Cancelled);
        let tasks_timed_out = pipeline_timed_out
            || (self.tasks_deadline_elapsed(&run)
                && (regular_pending || timeout_skip_recorded || engine_cancelled));

        // Regular phase.
        if matches!(
            cancel_mode,
            Some(PipelineRunSpecStatus::Cancelled | PipelineRunSpecStatus::CancelledRunFinally)
        ) || pipeline_timed_out
        {
            self.cancel_running_children(&run, &spec, &state).await?;
            let reason = if pipeline_timed_out {
                SkipReason::PipelineTimedOutSkipped
            } else {
                SkipReason::GracefullyCancelled
            };
            mark_unstarted_skipped(&spec, &mut state, reason);
        } else if tasks_timed_out {
            self.cancel_running_children(&run, &spec, &state).await?;
            mark_unstarted_skipped(&spec, &mut state, SkipReason::PipelineTimedOutSkipped);
        } else if cancel_mode == Some(PipelineRunSpecStatus::StoppedRunFinally) {
            mark_unstarted_skipped(&spec, &mut state, SkipReason::GracefullyStopped);
        } else {
            self.schedule_regular(&mut run, &spec, &graph, &bindings, &mut state)
                .await?;
        }

        // Finally phase: starts once every regular task is terminal, except
        // for a full cancellation which skips the group entirely.
        let regular_done = state.all_terminal(spec.tasks.iter());
        let run_finally = cancel_mode != Some(PipelineRunSpecStatus::Cancelled);
        if regular_done && run_finally && !pipeline_timed_out {
            self.schedule_finally(&mut run, &spec, &bindings, &mut state)
                .await?;
        } else if !run_finally || pipeline_timed_out {
            for task in &spec.finally_tasks {
                if state.view(&task.name) == TaskView::NotCreated {
                    let reason = if pipeline_timed_out {
                        SkipReason::PipelineTimedOutSkipped
                    } else {
                        SkipReason::GracefullyCancelled
                    };
                    state.skip(&task.name, reason);
                }
            }
        }

        // Persist newly recorded skips.
        for skip in state.new_skips.drain(..) {
            if !run.status.is_skipped(&skip.name) {
                run.status.skipped_tasks.push(skip);
            }
        }

        self.compute_condition(&mut run, &spec, &state, cancel_mode, pipeline_timed_out, tasks_timed_out)?;
        self.finish(&run).await
    }

    /// Writes status and converts the run's state into a queue outcome.
    async fn finish(&self, run: &PipelineRun) -> Result<Outcome> {
        match self.runs.update_status(run).await? {
            UpdateResult::Applied { .. } => {}
            UpdateResult::NotFound => return Ok(Outcome::Done),
            UpdateResult::Conflict { actual } => {
                return Err(Error::Conflict {
                    expected: run.metadata.resource_version.unwrap_or(0),
                    actual,
                });
            }
        }
        if run.is_done() {
            if let Some(c) = run.status.succeeded() {
                crate::metrics::record_condition(Kind::PipelineRun.as_str(), c.reason.to_string());
            }
            return Ok(Outcome::Done);
        }
        Ok(match self.earliest_deadline(run) {
            Some(remaining) => Outcome::RequeueAfter(remaining),
            None => Outcome::Done,
        })
    }

    async fn resolve_pipeline_spec(
        &self,
        run: &mut PipelineRun,
    ) -> std::result::Result<PipelineSpec, Result<Outcome>> {
        let spec = if let Some(inline) = &run.spec.pipeline_spec {
            inline.clone()
        } else if let Some(r) = &run.spec.pipeline_ref {
            if r.is_remote() {
                match self.resolver.resolve(&r.resolver, &r.params).await {
                    Ok(artifact) => match parse_pipeline_spec(&artifact.bytes) {
                        Ok(spec) => spec,
                        Err(e) => return Err(self.fail_resolution(run, &e.to_string()).await),
                    },
                    Err(Error::Resolution { message }) => {
                        if self.pipeline_deadline_elapsed(run) {
                            return Err(self.fail_resolution(run, &message).await);
                        }
                        return Err(Err(Error::Resolution { message }));
                    }
                    Err(other) => return Err(Err(other)),
                }
            } else {
                match self
                    .catalog
                    .get_pipeline(&run.metadata.namespace, &r.name)
                    .await
                {
                    Ok(Some(pipeline)) => pipeline.spec,
                    Ok(None) => {
                        let message = format!("Pipeline \"{}\" does not exist", r.name);
                        return Err(self.fail_resolution(run, &message).await);
                    }
                    Err(e) => return Err(Err(e)),
                }
            }
        } else {
            return Err(Err(Error::internal(
                "PipelineRun has neither pipelineRef nor pipelineSpec",
            )));
        };

        // Specs fetched by reference bypassed admission; validate now with
        // the run's params propagated the same way admission would.
        if run.spec.pipeline_spec.is_none() {
            let errs = tenon_api::validate::check_pipeline_spec(&spec, &run.spec.params);
            if !errs.is_empty() {
                if let Err(e) = run.status.set_condition(
                    ConditionStatus::False,
                    SucceededReason::PipelineRunValidationFailed,
                    errs.to_string(),
                ) {
                    return Err(Err(e.into()));
                }
                return Err(self.finish(run).await);
            }
        }
        let errs = tenon_api::validate::check_params(&spec.params, &run.spec.params);
        if !errs.is_empty() {
            if let Err(e) = run.status.set_condition(
                ConditionStatus::False,
                SucceededReason::PipelineRunValidationFailed,
                errs.to_string(),
            ) {
                return Err(Err(e.into()));
            }
            return Err(self.finish(run).await);
        }

        run.status.pipeline_spec = Some(spec.clone());
        Ok(spec)
    }

    async fn fail_resolution(&self, run: &mut PipelineRun, message: &str) -> Result<Outcome> {
        run.status.set_condition(
            ConditionStatus::False,
            SucceededReason::PipelineRunResolutionFailed,
            message.to_string(),
        )?;
        self.finish(run).await
    }

    /// Replaces claim-template bindings with references to the single claim
    /// materialized for this run's lifetime.
    async fn concretize_claims(&self, run: &PipelineRun) -> Result<Vec<WorkspaceBinding>> {
        let mut out = Vec::with_capacity(run.spec.workspaces.len());
        for binding in &run.spec.workspaces {
            let Some(template) = &binding.volume_claim_template else {
                out.push(binding.clone());
                continue;
            };
            let claim_name = self
                .claims
                .ensure_claim(
                    &run.metadata.namespace,
                    &run.metadata.uid,
                    &run.metadata.name,
                    &binding.name,
                    template,
                )
                .await?;
            let mut concrete = binding.clone();
            concrete.volume_claim_template = None;
            concrete.persistent_volume_claim = Some(PersistentVolumeClaimSource {
                claim_name,
                read_only: false,
            });
            out.push(concrete);
        }
        Ok(out)
    }

    /// Reads child TaskRuns and folds them into per-task views. Results are
    /// collected only from children whose condition is terminal.
    async fn gather_state(&self, run: &PipelineRun, spec: &PipelineSpec) -> Result<PipelineState> {
        let mut state = PipelineState {
            views: HashMap::new(),
            results: HashMap::new(),
            new_skips: Vec::new(),
            resolution_failed: None,
        };

        for skipped in &run.status.skipped_tasks {
            state
                .views
                .insert(skipped.name.clone(), TaskView::Skipped);
        }

        for task in spec.all_tasks() {
            if state.views.contains_key(&task.name) {
                continue;
            }
            let Some(child) = run.status.child_for(&task.name) else {
                state.views.insert(task.name.clone(), TaskView::NotCreated);
                continue;
            };
            let Some(child_run) = self
                .task_runs
                .get(&run.metadata.namespace, &child.name)
                .await?
            else {
                state.views.insert(task.name.clone(), TaskView::NotCreated);
                continue;
            };

            let view = match child_run.status.succeeded() {
                Some(c) if c.is_terminal() => match (c.status, c.reason) {
                    (ConditionStatus::True, _) => TaskView::Succeeded,
                    (_, SucceededReason::TaskRunCancelled) => TaskView::Cancelled,
                    (_, SucceededReason::TaskRunResolutionFailed) => {
                        if state.resolution_failed.is_none() {
                            state.resolution_failed = Some(task.name.clone());
                        }
                        TaskView::Failed
                    }
                    _ => TaskView::Failed,
                },
                _ => TaskView::InFlight,
            };
            if view == TaskView::Succeeded {
                state.results.insert(
                    task.name.clone(),
                    child_run
                        .status
                        .results
                        .iter()
                        .map(|r| (r.name.clone(), r.value.clone()))
                        .collect(),
                );
            }
            state.views.insert(task.name.clone(), view);
        }
        Ok(state)
    }

    async fn cancel_running_children(
        &self,
        run: &PipelineRun,
        spec: &PipelineSpec,
        state: &PipelineState,
    ) -> Result<()> {
        for task in spec.all_tasks() {
            if state.view(&task.name) == TaskView::InFlight {
                if let Some(child) = run.status.child_for(&task.name) {
                    self.task_runs
                        .request_cancel(&run.metadata.namespace, &child.name)
                        .await?;
                }
            }
        }
        Ok(())
    }

    /// Dispatches every ready regular task in declaration order.
    async fn schedule_regular(
        &self,
        run: &mut PipelineRun,
        spec: &PipelineSpec,
        graph: &TaskGraph,
        bindings: &[WorkspaceBinding],
        state: &mut PipelineState,
    ) -> Result<()> {
        let base = base_substitutions(run, spec);

        // Iterate the ready-set computation to a fixpoint: a skip recorded
        // mid-sweep can unblock a task declared earlier in the list.
        // Dispatch itself happens in declaration order within each sweep.
        let mut progressed = true;
        while progressed {
            progressed = false;
            for task in &spec.tasks {
                if state.view(&task.name) != TaskView::NotCreated {
                    continue;
                }

                let predecessors = graph.predecessors(&task.name)?;
                if !predecessors.iter().all(|p| state.view(p).is_terminal()) {
                    continue;
                }
                if predecessors
                    .iter()
                    .any(|p| matches!(state.view(p), TaskView::Failed | TaskView::Cancelled))
                {
                    state.skip(&task.name, SkipReason::ParentTasksFailed);
                    progressed = true;
                    continue;
                }

                let subs = task_scope_substitutions(&base, state);

                // A task consuming a result that will never exist is
                // skipped with a propagating reason rather than failing
                // the pipeline.
                if references_missing_results(task, &subs) {
                    state.skip(&task.name, SkipReason::MissingResultsSkipped);
                    progressed = true;
                    continue;
                }

                if !when_holds(task, &subs) {
                    state.skip(&task.name, SkipReason::WhenExpressionsSkipped);
                    progressed = true;
                    continue;
                }

                let child = self.build_child(run, task, bindings, &subs, false)?;
                self.task_runs.create(&child).await?;
                state.views.insert(task.name.clone(), TaskView::InFlight);
                progressed = true;
                if run.status.child_for(&task.name).is_none() {
                    run.status.child_references.push(ChildReference {
                        name: child.metadata.name.clone(),
                        pipeline_task_name: task.name.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Dispatches the finally group. Finally tasks have no edges between
    /// them and observe the aggregate state of the regular phase.
    async fn schedule_finally(
        &self,
        run: &mut PipelineRun,
        spec: &PipelineSpec,
        bindings: &[WorkspaceBinding],
        state: &mut PipelineState,
    ) -> Result<()> {
        let base = base_substitutions(run, spec);
        let mut subs = task_scope_substitutions(&base, state);
        bind_task_statuses(&mut subs, spec, state);

        for task in &spec.finally_tasks {
            if state.view(&task.name) != TaskView::NotCreated {
                continue;
            }
            if references_missing_results(task, &subs) {
                state.skip(&task.name, SkipReason::MissingResultsSkipped);
                continue;
            }
            if !when_holds(task, &subs) {
                state.skip(&task.name, SkipReason::WhenExpressionsSkipped);
                continue;
            }

            let child = self.build_child(run, task, bindings, &subs, true)?;
            self.task_runs.create(&child).await?;
            state.views.insert(task.name.clone(), TaskView::InFlight);
            if run.status.child_for(&task.name).is_none() {
                run.status.child_references.push(ChildReference {
                    name: child.metadata.name.clone(),
                    pipeline_task_name: task.name.clone(),
                });
            }
        }
        Ok(())
    }

    /// Builds the child TaskRun for one pipeline task.
    fn build_child(
        &self,
        run: &PipelineRun,
        task: &PipelineTask,
        bindings: &[WorkspaceBinding],
        subs: &Substitutions,
        is_finally: bool,
    ) -> Result<TaskRun> {
        let name = child_name(&run.metadata.name, &task.name);
        let mut metadata = ObjectMeta::namespaced(name, run.metadata.namespace.clone());
        metadata.own_by(OwnerReference::controller(
            "PipelineRun",
            run.metadata.name.clone(),
            run.metadata.uid.clone(),
        ));
        metadata.labels.insert(
            "tenon.io/pipeline-run".to_string(),
            run.metadata.name.clone(),
        );
        metadata
            .labels
            .insert("tenon.io/pipeline-task".to_string(), task.name.clone());

        let params = task
            .params
            .iter()
            .map(|p| Param {
                name: p.name.clone(),
                value: substitute_value(&p.value, subs),
            })
            .collect();

        let workspaces = child_bindings(&task.workspaces, bindings)?;

        Ok(TaskRun {
            metadata,
            spec: TaskRunSpec {
                task_ref: task.task_ref.as_ref().map(|r| TaskRef {
                    name: r.name.clone(),
                    resolver: r.resolver.clone(),
                    params: r.params.clone(),
                }),
                task_spec: task.task_spec.clone(),
                params,
                workspaces,
                timeout: self.child_timeout(run, task, is_finally),
                status: None,
                step_overrides: Vec::new(),
                sidecar_overrides: Vec::new(),
            },
            status: tenon_api::taskrun::TaskRunStatus::default(),
        })
    }

    /// Child timeout: the tightest of the task-level timeout, the relevant
    /// bucket's remainder, and the pipeline's remaining budget.
    fn child_timeout(
        &self,
        run: &PipelineRun,
        task: &PipelineTask,
        is_finally: bool,
    ) -> Option<ApiDuration> {
        let timeouts = run.timeouts();
        let mut candidates: Vec<ApiDuration> = Vec::new();

        if let Some(task_timeout) = task.timeout {
            if !task_timeout.is_zero() {
                candidates.push(task_timeout);
            }
        }
        if let Some(remaining) = self.remaining(run, timeouts.pipeline) {
            if !remaining.is_zero() {
                candidates.push(remaining);
            }
        }
        let bucket = if is_finally {
            timeouts.finally_
        } else {
            timeouts.tasks
        };
        if is_finally {
            // The finally bucket is measured from dispatch, not run start.
            if let Some(b) = bucket.filter(|b| !b.is_zero()) {
                candidates.push(b);
            }
        } else if let Some(remaining) = self.remaining(run, bucket) {
            if !remaining.is_zero() {
                candidates.push(remaining);
            }
        }

        candidates.into_iter().min().or(Some(ApiDuration::zero()))
    }

    /// Remaining budget from the run's start; `None` when unbounded.
    fn remaining(&self, run: &PipelineRun, budget: Option<ApiDuration>) -> Option<ApiDuration> {
        let budget = budget?;
        if budget.is_zero() {
            return None;
        }
        let start = run.status.start_time?;
        let deadline = start + budget.inner();
        let left = deadline - Utc::now();
        Some(ApiDuration::from(left.max(chrono::Duration::zero())))
    }

    fn pipeline_deadline_elapsed(&self, run: &PipelineRun) -> bool {
        self.remaining(run, run.timeouts().pipeline)
            .is_some_and(|left| left.is_zero())
    }

    fn tasks_deadline_elapsed(&self, run: &PipelineRun) -> bool {
        self.remaining(run, run.timeouts().tasks)
            .is_some_and(|left| left.is_zero())
    }

    fn earliest_deadline(&self, run: &PipelineRun) -> Option<StdDuration> {
        let timeouts = run.timeouts();
        [timeouts.pipeline, timeouts.tasks]
            .into_iter()
            .filter_map(|budget| self.remaining(run, budget))
            .filter(|d| !d.is_zero())
            .min()
            .map(|d| d.to_std())
    }

    /// Computes the run condition from the pass-final state.
    #[allow(clippy::too_many_arguments)]
    fn compute_condition(
        &self,
        run: &mut PipelineRun,
        spec: &PipelineSpec,
        state: &PipelineState,
        cancel_mode: Option<PipelineRunSpecStatus>,
        pipeline_timed_out: bool,
        tasks_timed_out: bool,
    ) -> Result<()> {
        let all_done = state.all_terminal(spec.all_tasks());
        let failed = state.count(TaskView::Failed);
        let cancelled = state.count(TaskView::Cancelled);
        let succeeded = state.count(TaskView::Succeeded);
        let skipped = state.count(TaskView::Skipped);

        if !all_done {
            // The pipeline waits for in-flight children before turning
            // terminal, even when the outcome is already decided.
            run.status.set_condition(
                ConditionStatus::Unknown,
                SucceededReason::Running,
                format!(
                    "Tasks Completed: {} (Failed: {failed}, Cancelled {cancelled}), Incomplete: {}, Skipped: {skipped}",
                    succeeded + failed + cancelled,
                    state.count(TaskView::NotCreated) + state.count(TaskView::InFlight),
                ),
            )?;
            return Ok(());
        }

        // Terminal: aggregate declared results first, then decide.
        aggregate_results(run, spec, state);

        if pipeline_timed_out || tasks_timed_out {
            run.status.set_condition(
                ConditionStatus::False,
                SucceededReason::PipelineRunTimeout,
                format!(
                    "PipelineRun \"{}\" failed to finish within its budget",
                    run.metadata.name
                ),
            )?;
            return Ok(());
        }

        match cancel_mode {
            Some(PipelineRunSpecStatus::Cancelled) => {
                run.status.set_condition(
                    ConditionStatus::False,
                    SucceededReason::Cancelled,
                    format!("PipelineRun \"{}\" was cancelled", run.metadata.name),
                )?;
                return Ok(());
            }
            Some(PipelineRunSpecStatus::CancelledRunFinally) => {
                run.status.set_condition(
                    ConditionStatus::False,
                    SucceededReason::CancelledRunFinally,
                    format!("PipelineRun \"{}\" was cancelled", run.metadata.name),
                )?;
                return Ok(());
            }
            Some(PipelineRunSpecStatus::StoppedRunFinally) => {
                run.status.set_condition(
                    ConditionStatus::False,
                    SucceededReason::StoppedRunFinally,
                    format!("PipelineRun \"{}\" was stopped", run.metadata.name),
                )?;
                return Ok(());
            }
            _ => {}
        }

        if failed > 0 || cancelled > 0 {
            let (reason, message) = match &state.resolution_failed {
                Some(task) => (
                    SucceededReason::CouldntGetTask,
                    format!("task \"{task}\" failed: its referenced task could not be fetched"),
                ),
                None => (
                    SucceededReason::Failed,
                    format!(
                        "Tasks Completed: {} (Failed: {failed}, Cancelled {cancelled}), Skipped: {skipped}",
                        succeeded + failed + cancelled,
                    ),
                ),
            };
            run.status.set_condition(ConditionStatus::False, reason, message)?;
        } else if skipped > 0 {
            run.status.set_condition(
                ConditionStatus::True,
                SucceededReason::Completed,
                format!("Tasks Completed: {succeeded}, Skipped: {skipped}"),
            )?;
        } else {
            run.status.set_condition(
                ConditionStatus::True,
                SucceededReason::Succeeded,
                format!("Tasks Completed: {succeeded}"),
            )?;
        }
        Ok(())
    }
}

#[async_trait]
impl Reconcile for PipelineRunReconciler {
    async fn reconcile(&self, key: &Key) -> Result<Outcome> {
        self.reconcile(&key.namespace, &key.name).await
    }
}

/// Builds the task graph: explicit `runAfter` edges plus implicit edges
/// from result consumption.
fn build_graph(spec: &PipelineSpec) -> Result<TaskGraph> {
    let mut graph = TaskGraph::new();
    for task in &spec.tasks {
        graph.add_task(&task.name);
    }
    for task in &spec.tasks {
        for after in &task.run_after {
            graph.add_dependency(after, &task.name)?;
        }
        for dep in task.result_dependencies() {
            if dep != task.name && spec.task(&dep).is_some() {
                graph.add_dependency(&dep, &task.name)?;
            }
        }
    }
    Ok(graph)
}

/// Binds the run's params (declared defaults shadowed by supplied values)
/// and the pipeline context.
fn base_substitutions(run: &PipelineRun, spec: &PipelineSpec) -> Substitutions {
    let mut subs = Substitutions::new();
    for decl in &spec.params {
        if let Some(default) = &decl.default {
            subs.bind_param(&decl.name, default);
        }
    }
    for supplied in &run.spec.params {
        subs.bind_param(&supplied.name, &supplied.value);
    }
    subs.bind_string("context.pipelineRun.name", run.metadata.name.clone());
    subs.bind_string(
        "context.pipelineRun.namespace",
        run.metadata.namespace.clone(),
    );
    subs.bind_string("context.pipelineRun.uid", run.metadata.uid.clone());
    subs
}

/// Extends the base scope with `tasks.X.results.Y` bindings for every
/// terminal, successful task.
fn task_scope_substitutions(base: &Substitutions, state: &PipelineState) -> Substitutions {
    let mut subs = base.clone();
    for (task, results) in &state.results {
        for (result, value) in results {
            subs.bind_value(&format!("tasks.{task}.results.{result}"), value);
        }
    }
    subs
}

/// Binds `$(tasks.X.status)` and the `$(tasks.status)` aggregate for the
/// finally scope.
fn bind_task_statuses(subs: &mut Substitutions, spec: &PipelineSpec, state: &PipelineState) {
    let mut any_failed = false;
    let mut any_skipped = false;
    for task in &spec.tasks {
        let status = match state.view(&task.name) {
            TaskView::Succeeded => "Succeeded",
            TaskView::Failed | TaskView::Cancelled => {
                any_failed = true;
                "Failed"
            }
            TaskView::Skipped => {
                any_skipped = true;
                "None"
            }
            TaskView::NotCreated | TaskView::InFlight => "None",
        };
        subs.bind_string(format!("tasks.{}.status", task.name), status);
    }
    let aggregate = if any_failed {
        "Failed"
    } else if any_skipped {
        "Completed"
    } else {
        "Succeeded"
    };
    subs.bind_string("tasks.status", aggregate);
}

/// True when the task consumes a `tasks.X.results.Y` reference that no
/// terminal task produced (and can no longer produce).
fn references_missing_results(task: &PipelineTask, subs: &Substitutions) -> bool {
    let mut check = |text: &str| {
        find_references(text).into_iter().any(|r| {
            r.scope() == "tasks"
                && r.path.len() == 4
                && r.path[2] == "results"
                && subs.resolve(&r).is_none()
        })
    };
    for param in &task.params {
        let missing = match &param.value {
            ParamValue::String(s) => check(s),
            ParamValue::Array(items) => items.iter().any(|i| check(i)),
            ParamValue::Object(map) => map.values().any(|v| check(v)),
        };
        if missing {
            return true;
        }
    }
    task.when.iter().any(|w| check(&w.input))
}

/// Evaluates the task's `when` guards against resolved inputs.
fn when_holds(task: &PipelineTask, subs: &Substitutions) -> bool {
    task.when.iter().all(|expr| {
        let resolved_input = subs.apply_to_string(&expr.input);
        let resolved_values: Vec<String> =
            expr.values.iter().map(|v| subs.apply_to_string(v)).collect();
        let resolved = tenon_api::pipeline::WhenExpression {
            input: resolved_input.clone(),
            operator: expr.operator,
            values: resolved_values,
        };
        resolved.holds(&resolved_input)
    })
}

/// Applies substitution to a supplied param value.
fn substitute_value(value: &ParamValue, subs: &Substitutions) -> ParamValue {
    match value {
        ParamValue::String(s) => ParamValue::String(subs.apply_to_string(s)),
        ParamValue::Array(items) => ParamValue::Array(subs.expand_array(items)),
        ParamValue::Object(map) => ParamValue::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), subs.apply_to_string(v)))
                .collect(),
        ),
    }
}

/// Marks every not-yet-started task as skipped with the given reason.
fn mark_unstarted_skipped(spec: &PipelineSpec, state: &mut PipelineState, reason: SkipReason) {
    let names: Vec<String> = spec
        .tasks
        .iter()
        .filter(|t| state.view(&t.name) == TaskView::NotCreated)
        .map(|t| t.name.clone())
        .collect();
    for name in names {
        state.skip(&name, reason);
    }
}

/// Evaluates each declared pipeline result. A result whose inputs were
/// never produced is omitted without failing the pipeline.
fn aggregate_results(run: &mut PipelineRun, spec: &PipelineSpec, state: &PipelineState) {
    if !run.status.results.is_empty() {
        return;
    }
    let base = base_substitutions(run, spec);
    let mut subs = task_scope_substitutions(&base, state);
    // Finally results live under their own scope name.
    let finally_names: BTreeMap<&str, ()> = spec
        .finally_tasks
        .iter()
        .map(|t| (t.name.as_str(), ()))
        .collect();
    for (task, results) in &state.results {
        if finally_names.contains_key(task.as_str()) {
            for (result, value) in results {
                subs.bind_value(&format!("finally.{task}.results.{result}"), value);
            }
        }
    }

    let mut aggregated = Vec::new();
    for decl in &spec.results {
        let resolved = subs.apply_to_string(&decl.value);
        // Any reference left standing means an input was never produced.
        if find_references(&resolved)
            .iter()
            .any(|r| matches!(r.scope(), "tasks" | "finally"))
        {
            continue;
        }
        aggregated.push(PipelineRunResult {
            name: decl.name.clone(),
            value: ParamValue::String(resolved),
        });
    }
    run.status.results = aggregated;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tenon_api::pipeline::{WhenExpression, WhenOperator};

    fn inline_task(name: &str) -> PipelineTask {
        PipelineTask {
            name: name.into(),
            task_spec: Some(tenon_api::task::TaskSpec::default()),
            ..PipelineTask::default()
        }
    }

    fn state_with(views: &[(&str, TaskView)]) -> PipelineState {
        PipelineState {
            views: views
                .iter()
                .map(|(n, v)| ((*n).to_string(), *v))
                .collect(),
            results: HashMap::new(),
            new_skips: Vec::new(),
            resolution_failed: None,
        }
    }

    #[test]
    fn graph_includes_implicit_result_edges() {
        let mut consumer = inline_task("consumer");
        consumer.params = vec![Param::new("v", "$(tasks.producer.results.out)")];
        let spec = PipelineSpec {
            tasks: vec![inline_task("producer"), consumer],
            ..PipelineSpec::default()
        };
        let graph = build_graph(&spec).unwrap();
        assert_eq!(graph.predecessors("consumer").unwrap(), vec!["producer"]);
    }

    #[test]
    fn when_expressions_evaluate_after_substitution() {
        let mut subs = Substitutions::new();
        subs.bind_param("branch", &ParamValue::String("main".into()));
        let mut task = inline_task("deploy");
        task.when = vec![WhenExpression {
            input: "$(params.branch)".into(),
            operator: WhenOperator::In,
            values: vec!["main".into()],
        }];
        assert!(when_holds(&task, &subs));

        task.when[0].values = vec!["release".into()];
        assert!(!when_holds(&task, &subs));
    }

    #[test]
    fn missing_result_reference_detected() {
        let state = state_with(&[("producer", TaskView::Skipped)]);
        let base = Substitutions::new();
        let subs = task_scope_substitutions(&base, &state);

        let mut task = inline_task("consumer");
        task.params = vec![Param::new("v", "$(tasks.producer.results.out)")];
        assert!(references_missing_results(&task, &subs));
    }

    #[test]
    fn available_results_are_not_missing() {
        let mut state = state_with(&[("producer", TaskView::Succeeded)]);
        state.results.insert(
            "producer".into(),
            vec![("out".into(), ParamValue::String("15".into()))],
        );
        let base = Substitutions::new();
        let subs = task_scope_substitutions(&base, &state);

        let mut task = inline_task("consumer");
        task.params = vec![Param::new("v", "$(tasks.producer.results.out)")];
        assert!(!references_missing_results(&task, &subs));
    }

    #[test]
    fn task_status_bindings_aggregate() {
        let spec = PipelineSpec {
            tasks: vec![inline_task("good"), inline_task("bad")],
            ..PipelineSpec::default()
        };
        let state = state_with(&[("good", TaskView::Succeeded), ("bad", TaskView::Failed)]);
        let mut subs = Substitutions::new();
        bind_task_statuses(&mut subs, &spec, &state);

        assert_eq!(subs.apply_to_string("$(tasks.good.status)"), "Succeeded");
        assert_eq!(subs.apply_to_string("$(tasks.bad.status)"), "Failed");
        assert_eq!(subs.apply_to_string("$(tasks.status)"), "Failed");
    }

    #[test]
    fn substitute_value_handles_all_shapes() {
        let mut subs = Substitutions::new();
        subs.bind_param("x", &ParamValue::String("one".into()));
        subs.bind_param(
            "list",
            &ParamValue::Array(vec!["a".into(), "b".into()]),
        );

        let s = substitute_value(&ParamValue::String("$(params.x)".into()), &subs);
        assert_eq!(s, ParamValue::String("one".into()));

        let a = substitute_value(
            &ParamValue::Array(vec!["$(params.list[*])".into()]),
            &subs,
        );
        assert_eq!(a, ParamValue::Array(vec!["a".into(), "b".into()]));
    }
}
