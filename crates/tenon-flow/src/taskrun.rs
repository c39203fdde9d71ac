//! The TaskRun reconciler.
//!
//! One pass takes a TaskRun from its store to its next observable state:
//! validate, resolve the referenced task, apply substitutions to produce
//! the effective task, materialize the single workload, project workload
//! status into step states and typed results, and compute the `Succeeded`
//! condition. Passes are idempotent; everything the pass learns is written
//! back through the status store under optimistic concurrency.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::Utc;
use tenon_core::{ConditionStatus, SucceededReason};

use crate::error::{Error, Result};
use crate::queue::{Key, Kind, Outcome, Reconcile};
use crate::resolver::Resolver;
use crate::store::{parse_task_spec, CatalogStore, ClaimStore, TaskRunStore, UpdateResult, WorkloadStore};
use crate::workload::{self, build_workload, workload_name, Workload, WorkloadPhase, MAX_RESULT_BYTES};
use crate::workspace::{resolve_workspaces, ResolvedWorkspace};
use tenon_api::param::{ParamType, ParamValue};
use tenon_api::subst::Substitutions;
use tenon_api::task::TaskSpec;
use tenon_api::taskrun::{StepState, TaskRun, TaskRunResult, TerminationState};
use tenon_api::validate::Validate;
use tenon_api::workspace::{PersistentVolumeClaimSource, WorkspaceBinding};

/// Reconciles TaskRuns into workloads and status.
pub struct TaskRunReconciler {
    runs: Arc<dyn TaskRunStore>,
    workloads: Arc<dyn WorkloadStore>,
    catalog: Arc<dyn CatalogStore>,
    resolver: Arc<dyn Resolver>,
    claims: Arc<dyn ClaimStore>,
}

impl TaskRunReconciler {
    /// Creates a reconciler over explicit store interfaces.
    #[must_use]
    pub fn new(
        runs: Arc<dyn TaskRunStore>,
        workloads: Arc<dyn WorkloadStore>,
        catalog: Arc<dyn CatalogStore>,
        resolver: Arc<dyn Resolver>,
        claims: Arc<dyn ClaimStore>,
    ) -> Self {
        Self {
            runs,
            workloads,
            catalog,
            resolver,
            claims,
        }
    }

    /// Runs one reconcile pass.
    ///
    /// # Errors
    ///
    /// Retryable errors (substrate failures, conflicts, pending remote
    /// resolution) bubble up for the queue to back off on; terminal run
    /// outcomes are written to status and return `Ok`.
    #[tracing::instrument(skip(self))]
    pub async fn reconcile(&self, namespace: &str, name: &str) -> Result<Outcome> {
        let Some(mut run) = self.runs.get(namespace, name).await? else {
            return Ok(Outcome::Done);
        };
        if run.is_done() {
            return Ok(Outcome::Done);
        }

        // Defense in depth: the same rules the admission layer applies.
        let validation = run.validate();
        if !validation.is_empty() {
            run.status.set_condition(
                ConditionStatus::False,
                SucceededReason::TaskRunValidationFailed,
                validation.to_string(),
            )?;
            return self.finish(&run).await;
        }

        if run.status.start_time.is_none() {
            run.status.start_time = Some(Utc::now());
            run.status.set_condition(
                ConditionStatus::Unknown,
                SucceededReason::Pending,
                "TaskRun is pending",
            )?;
        }

        if run.is_cancellation_requested() {
            self.teardown_workload(&run).await?;
            run.status.set_condition(
                ConditionStatus::False,
                SucceededReason::TaskRunCancelled,
                format!("TaskRun \"{name}\" was cancelled"),
            )?;
            return self.finish(&run).await;
        }

        if self.deadline_elapsed(&run) {
            self.teardown_workload(&run).await?;
            run.status.set_condition(
                ConditionStatus::False,
                SucceededReason::TaskRunTimeout,
                format!(
                    "TaskRun \"{name}\" failed to finish within \"{}\"",
                    run.timeout()
                ),
            )?;
            return self.finish(&run).await;
        }

        // Resolve once; the frozen copy on status is authoritative after.
        let effective = match &run.status.task_spec {
            Some(frozen) => frozen.clone(),
            None => match self.resolve_and_apply(&mut run).await {
                Ok(spec) => spec,
                Err(outcome) => return outcome,
            },
        };

        // Workspaces are recomputed each pass; claim materialization is
        // idempotent so repeated passes converge on the same volumes.
        let bindings = self.concretize_claims(&run).await?;
        let resolved_workspaces = resolve_workspaces(&effective.workspaces, &bindings)?;

        let wl_name = workload_name(&run.metadata.name);
        match self.workloads.get(namespace, &wl_name).await? {
            None => {
                let workload = self.materialize(&run, &effective, &resolved_workspaces);
                self.workloads.create(&workload).await?;
                run.status.workload_name = wl_name;
                run.status.set_condition(
                    ConditionStatus::Unknown,
                    SucceededReason::Pending,
                    "workload created, waiting for it to start",
                )?;
            }
            Some(found) => {
                run.status.workload_name = wl_name;
                self.project_status(&mut run, &effective, &found)?;
            }
        }

        self.finish(&run).await
    }

    /// Writes status and converts the run's state into a queue outcome.
    async fn finish(&self, run: &TaskRun) -> Result<Outcome> {
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
                crate::metrics::record_condition(Kind::TaskRun.as_str(), c.reason.to_string());
            }
            return Ok(Outcome::Done);
        }
        Ok(match self.time_to_deadline(run) {
            Some(remaining) => Outcome::RequeueAfter(remaining),
            None => Outcome::Done,
        })
    }

    fn deadline_elapsed(&self, run: &TaskRun) -> bool {
        self.time_to_deadline(run)
            .is_some_and(|remaining| remaining.is_zero())
    }

    /// Remaining wall-clock budget; `None` when unbounded.
    fn time_to_deadline(&self, run: &TaskRun) -> Option<StdDuration> {
        let timeout = run.timeout();
        if timeout.is_zero() {
            return None;
        }
        let start = run.status.start_time?;
        let deadline = start + timeout.inner();
        let now = Utc::now();
        if now >= deadline {
            Some(StdDuration::ZERO)
        } else {
            Some((deadline - now).to_std().unwrap_or(StdDuration::ZERO))
        }
    }

    async fn teardown_workload(&self, run: &TaskRun) -> Result<()> {
        let wl_name = workload_name(&run.metadata.name);
        self.workloads
            .delete(&run.metadata.namespace, &wl_name)
            .await
    }

    /// Resolves the referenced task and produces the effective (fully
    /// substituted) spec, freezing it onto status.
    ///
    /// Returns `Err` with the final outcome when resolution or validation
    /// settles the run (terminally or pending a retry).
    async fn resolve_and_apply(
        &self,
        run: &mut TaskRun,
    ) -> std::result::Result<TaskSpec, Result<Outcome>> {
        let spec = match self.resolve_task_spec(run).await {
            Ok(spec) => spec,
            Err(Error::Resolution { message }) => {
                if self.deadline_elapsed(run) {
                    if let Err(e) = run.status.set_condition(
                        ConditionStatus::False,
                        SucceededReason::TaskRunResolutionFailed,
                        message,
                    ) {
                        return Err(Err(e.into()));
                    }
                    return Err(self.finish(run).await);
                }
                // Still inside the budget: leave the condition Unknown and
                // let the queue retry with backoff.
                return Err(Err(Error::Resolution { message }));
            }
            Err(Error::NotFound { kind, name }) => {
                if let Err(e) = run.status.set_condition(
                    ConditionStatus::False,
                    SucceededReason::TaskRunResolutionFailed,
                    format!("{kind} \"{name}\" does not exist"),
                ) {
                    return Err(Err(e.into()));
                }
                return Err(self.finish(run).await);
            }
            Err(other) => return Err(Err(other)),
        };

        // Validate the resolved spec and the supplied params against it.
        // Inline specs were already checked with propagation at admission;
        // this pass covers specs fetched by reference, with the run's
        // params propagated the same way.
        let mut errs = if run.spec.task_spec.is_some() {
            tenon_api::validate::FieldErrorList::new()
        } else {
            tenon_api::validate::check_task_spec(&spec, &run.spec.params)
        };
        errs.also(tenon_api::validate::check_params(
            &spec.params,
            &run.spec.params,
        ));
        if !errs.is_empty() {
            if let Err(e) = run.status.set_condition(
                ConditionStatus::False,
                SucceededReason::TaskRunValidationFailed,
                errs.to_string(),
            ) {
                return Err(Err(e.into()));
            }
            return Err(self.finish(run).await);
        }

        let effective = apply_substitutions(run, &spec);
        run.status.task_spec = Some(effective.clone());
        Ok(effective)
    }

    async fn resolve_task_spec(&self, run: &TaskRun) -> Result<TaskSpec> {
        if let Some(inline) = &run.spec.task_spec {
            return Ok(inline.clone());
        }
        let Some(task_ref) = &run.spec.task_ref else {
            return Err(Error::internal("TaskRun has neither taskRef nor taskSpec"));
        };
        if task_ref.is_remote() {
            let artifact = self
                .resolver
                .resolve(&task_ref.resolver, &task_ref.params)
                .await?;
            return parse_task_spec(&artifact.bytes);
        }
        let task = self
            .catalog
            .get_task(&run.metadata.namespace, &task_ref.name)
            .await?
            .ok_or_else(|| Error::NotFound {
                kind: "Task",
                name: task_ref.name.clone(),
            })?;
        Ok(task.spec)
    }

    /// Replaces claim-template bindings with references to the single claim
    /// materialized for this run.
    async fn concretize_claims(&self, run: &TaskRun) -> Result<Vec<WorkspaceBinding>> {
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

    fn materialize(
        &self,
        run: &TaskRun,
        effective: &TaskSpec,
        workspaces: &[ResolvedWorkspace],
    ) -> Workload {
        let volumes = workspaces.iter().filter_map(|w| w.volume.clone()).collect();
        let mounts: Vec<_> = workspaces.iter().filter_map(|w| w.mount.clone()).collect();
        build_workload(run, effective, volumes, &mounts)
    }

    /// Projects observed workload state into the run's status and computes
    /// the condition.
    fn project_status(
        &self,
        run: &mut TaskRun,
        effective: &TaskSpec,
        found: &Workload,
    ) -> Result<()> {
        run.status.steps = project_steps(effective, found);
        run.status.sidecars = project_sidecars(effective, found);

        match found.status.phase {
            WorkloadPhase::Pending => run.status.set_condition(
                ConditionStatus::Unknown,
                SucceededReason::Pending,
                "workload is pending",
            )?,
            WorkloadPhase::Running => run.status.set_condition(
                ConditionStatus::Unknown,
                SucceededReason::Running,
                "not all steps have completed",
            )?,
            WorkloadPhase::Succeeded => {
                let (results, problems) = extract_results(effective, found);
                run.status.results = results;
                if let Some(failed) = failed_sidecar(effective, found) {
                    run.status.set_condition(
                        ConditionStatus::False,
                        SucceededReason::SidecarFailed,
                        format!("sidecar \"{failed}\" exited non-zero"),
                    )?;
                } else if problems.is_empty() {
                    run.status.set_condition(
                        ConditionStatus::True,
                        SucceededReason::Succeeded,
                        "all steps have completed successfully",
                    )?;
                } else {
                    run.status.set_condition(
                        ConditionStatus::False,
                        SucceededReason::InvalidResults,
                        problems.join("; "),
                    )?;
                }
            }
            WorkloadPhase::Failed => {
                // Result extraction is still attempted for whatever the
                // successful prefix of steps produced.
                let (results, _) = extract_results(effective, found);
                run.status.results = results;
                if let Some(failed) = failed_sidecar(effective, found) {
                    run.status.set_condition(
                        ConditionStatus::False,
                        SucceededReason::SidecarFailed,
                        format!("sidecar \"{failed}\" exited non-zero"),
                    )?;
                } else {
                    let detail = first_failed_step(&run.status.steps).map_or_else(
                        || "workload failed".to_string(),
                        |(step, code)| format!("step \"{step}\" exited with code {code}"),
                    );
                    run.status.set_condition(
                        ConditionStatus::False,
                        SucceededReason::Failed,
                        detail,
                    )?;
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Reconcile for TaskRunReconciler {
    async fn reconcile(&self, key: &Key) -> Result<Outcome> {
        self.reconcile(&key.namespace, &key.name).await
    }
}

/// Builds the full substitution set for a run and applies it to the spec.
fn apply_substitutions(run: &TaskRun, spec: &TaskSpec) -> TaskSpec {
    let mut subs = Substitutions::new();

    // Defaults first; run-supplied values shadow them.
    for decl in &spec.params {
        if let Some(default) = &decl.default {
            subs.bind_param(&decl.name, default);
        }
    }
    for supplied in &run.spec.params {
        subs.bind_param(&supplied.name, &supplied.value);
    }

    workload::bind_result_paths(spec, &mut subs);

    subs.bind_string("context.taskRun.name", run.metadata.name.clone());
    subs.bind_string("context.taskRun.namespace", run.metadata.namespace.clone());
    subs.bind_string("context.taskRun.uid", run.metadata.uid.clone());
    // Inline specs have no stored task name; the run name stands in.
    let task_name = run
        .spec
        .task_ref
        .as_ref()
        .filter(|r| !r.name.is_empty())
        .map_or_else(|| run.metadata.name.clone(), |r| r.name.clone());
    subs.bind_string("context.task.name", task_name);

    // Workspace paths depend only on declarations, not bindings.
    for ws in &spec.workspaces {
        subs.bind_string(
            format!("workspaces.{}.path", ws.name),
            ws.effective_mount_path(),
        );
    }

    let mut effective = apply_to_task_spec(spec, &subs);

    // Resource-request overrides merge last, keyed by step/sidecar name.
    for o in &run.spec.step_overrides {
        if let Some(step) = effective.steps.iter_mut().find(|s| s.name == o.name) {
            step.resources.extend(o.resources.clone());
        }
    }
    for o in &run.spec.sidecar_overrides {
        if let Some(sc) = effective.sidecars.iter_mut().find(|s| s.name == o.name) {
            sc.resources.extend(o.resources.clone());
        }
    }
    effective
}

/// Applies substitutions to every templated field of a task spec.
#[must_use]
pub fn apply_to_task_spec(spec: &TaskSpec, subs: &Substitutions) -> TaskSpec {
    let mut out = spec.clone();
    for step in &mut out.steps {
        step.image = subs.apply_to_string(&step.image);
        step.command = subs.expand_array(&step.command);
        step.args = subs.expand_array(&step.args);
        step.script = subs.apply_to_string(&step.script);
        step.working_dir = subs.apply_to_string(&step.working_dir);
        for env in &mut step.env {
            env.value = subs.apply_to_string(&env.value);
        }
    }
    for sidecar in &mut out.sidecars {
        sidecar.image = subs.apply_to_string(&sidecar.image);
        sidecar.command = subs.expand_array(&sidecar.command);
        sidecar.args = subs.expand_array(&sidecar.args);
        sidecar.script = subs.apply_to_string(&sidecar.script);
        for env in &mut sidecar.env {
            env.value = subs.apply_to_string(&env.value);
        }
    }
    out
}

fn project_steps(effective: &TaskSpec, workload: &Workload) -> Vec<StepState> {
    effective
        .steps
        .iter()
        .enumerate()
        .map(|(i, step)| {
            let observed = workload.status.steps.get(i);
            StepState {
                name: step.name.clone(),
                container_name: workload
                    .spec
                    .containers
                    .get(i)
                    .map(|c| c.name.clone())
                    .unwrap_or_default(),
                image_id: observed.map(|o| o.image_id.clone()).unwrap_or_default(),
                terminated: observed.and_then(|o| {
                    o.exit_code
                        .map(|code| TerminationState::from_exit(code, o.started_at, o.finished_at))
                }),
            }
        })
        .collect()
}

fn project_sidecars(effective: &TaskSpec, workload: &Workload) -> Vec<StepState> {
    effective
        .sidecars
        .iter()
        .enumerate()
        .map(|(i, sidecar)| {
            let observed = workload.status.sidecars.get(i);
            StepState {
                name: sidecar.name.clone(),
                container_name: workload
                    .spec
                    .sidecar_containers
                    .get(i)
                    .map(|c| c.name.clone())
                    .unwrap_or_default(),
                image_id: observed.map(|o| o.image_id.clone()).unwrap_or_default(),
                terminated: observed.and_then(|o| {
                    o.exit_code
                        .map(|code| TerminationState::from_exit(code, o.started_at, o.finished_at))
                }),
            }
        })
        .collect()
}

/// Returns the name of a failed sidecar whose completion policy observes
/// failures, if any.
fn failed_sidecar(effective: &TaskSpec, workload: &Workload) -> Option<String> {
    effective
        .sidecars
        .iter()
        .enumerate()
        .find(|(i, sc)| {
            sc.completion_policy == tenon_api::task::SidecarCompletionPolicy::Observed
                && workload
                    .status
                    .sidecars
                    .get(*i)
                    .and_then(|s| s.exit_code)
                    .is_some_and(|code| code != 0)
        })
        .map(|(_, sc)| sc.name.clone())
}

fn first_failed_step(steps: &[StepState]) -> Option<(String, i32)> {
    steps.iter().find_map(|s| {
        s.terminated
            .as_ref()
            .filter(|t| t.exit_code != 0)
            .map(|t| (s.name.clone(), t.exit_code))
    })
}

/// Parses the collected result files into typed values. Returns the parsed
/// results and a list of per-result problems (missing, oversized, or
/// malformed for the declared type).
fn extract_results(effective: &TaskSpec, workload: &Workload) -> (Vec<TaskRunResult>, Vec<String>) {
    let mut results = Vec::new();
    let mut problems = Vec::new();

    for decl in &effective.results {
        let Some(raw) = workload.status.result_files.get(&decl.name) else {
            problems.push(format!("missing declared result \"{}\"", decl.name));
            continue;
        };
        if raw.len() > MAX_RESULT_BYTES {
            problems.push(format!(
                "result \"{}\" exceeds {MAX_RESULT_BYTES} bytes",
                decl.name
            ));
            continue;
        }
        match parse_result_value(decl.type_, raw) {
            Ok(value) => results.push(TaskRunResult {
                name: decl.name.clone(),
                type_: decl.type_,
                value,
            }),
            Err(problem) => problems.push(format!("result \"{}\": {problem}", decl.name)),
        }
    }
    (results, problems)
}

fn parse_result_value(declared: ParamType, raw: &str) -> std::result::Result<ParamValue, String> {
    match declared {
        ParamType::String => Ok(ParamValue::String(raw.to_string())),
        ParamType::Array => serde_json::from_str::<Vec<String>>(raw)
            .map(ParamValue::Array)
            .map_err(|e| format!("does not parse as an array: {e}")),
        ParamType::Object => serde_json::from_str::<std::collections::BTreeMap<String, String>>(raw)
            .map(ParamValue::Object)
            .map_err(|e| format!("does not parse as an object: {e}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workload::{ContainerStatus, WorkloadStatus};
    use tenon_api::param::Param;
    use tenon_api::task::{Step, TaskResult};
    use tenon_core::ObjectMeta;

    fn spec_with_result() -> TaskSpec {
        TaskSpec {
            results: vec![TaskResult::string("product")],
            steps: vec![Step {
                name: "multiply".into(),
                image: "bash:latest".into(),
                script: "echo -n $((3*5)) > $(results.product.path)".into(),
                ..Step::default()
            }],
            ..TaskSpec::default()
        }
    }

    fn run_with(spec: TaskSpec, params: Vec<Param>) -> TaskRun {
        TaskRun {
            metadata: ObjectMeta::namespaced("tr", "default"),
            spec: tenon_api::taskrun::TaskRunSpec {
                task_spec: Some(spec),
                params,
                ..tenon_api::taskrun::TaskRunSpec::default()
            },
            status: tenon_api::taskrun::TaskRunStatus::default(),
        }
    }

    #[test]
    fn substitution_rewrites_result_paths() {
        let run = run_with(spec_with_result(), Vec::new());
        let effective = apply_substitutions(&run, &spec_with_result());
        assert_eq!(
            effective.steps[0].script,
            "echo -n $((3*5)) > /tenon/results/product"
        );
    }

    #[test]
    fn defaults_yield_to_supplied_values() {
        let spec = TaskSpec {
            params: vec![tenon_api::param::ParamSpec::string("greeting")
                .with_default(ParamValue::String("hello".into()))],
            steps: vec![Step {
                name: "say".into(),
                image: "alpine".into(),
                script: "echo $(params.greeting)".into(),
                ..Step::default()
            }],
            ..TaskSpec::default()
        };

        let defaulted = apply_substitutions(&run_with(spec.clone(), Vec::new()), &spec);
        assert_eq!(defaulted.steps[0].script, "echo hello");

        let supplied = apply_substitutions(
            &run_with(spec.clone(), vec![Param::new("greeting", "welcome")]),
            &spec,
        );
        assert_eq!(supplied.steps[0].script, "echo welcome");
    }

    #[test]
    fn step_overrides_merge_resource_requests() {
        let spec = spec_with_result();
        let mut run = run_with(spec.clone(), Vec::new());
        run.spec.step_overrides = vec![tenon_api::taskrun::StepOverride {
            name: "multiply".into(),
            resources: [("cpu".to_string(), "500m".to_string())].into_iter().collect(),
        }];
        let effective = apply_substitutions(&run, &spec);
        assert_eq!(
            effective.steps[0].resources.get("cpu").map(String::as_str),
            Some("500m")
        );
    }

    #[test]
    fn result_parsing_respects_declared_types() {
        assert_eq!(
            parse_result_value(ParamType::String, "15").unwrap(),
            ParamValue::String("15".into())
        );
        assert_eq!(
            parse_result_value(ParamType::Array, "[\"a\",\"b\"]").unwrap(),
            ParamValue::Array(vec!["a".into(), "b".into()])
        );
        assert!(parse_result_value(ParamType::Array, "not json").is_err());
    }

    #[test]
    fn missing_result_is_a_problem() {
        let effective = spec_with_result();
        let run = run_with(effective.clone(), Vec::new());
        let mut workload = build_workload(&run, &effective, Vec::new(), &[]);
        workload.status = WorkloadStatus {
            phase: WorkloadPhase::Succeeded,
            steps: vec![ContainerStatus {
                name: "step-multiply".into(),
                exit_code: Some(0),
                ..ContainerStatus::default()
            }],
            ..WorkloadStatus::default()
        };
        let (results, problems) = extract_results(&effective, &workload);
        assert!(results.is_empty());
        assert_eq!(problems.len(), 1);
        assert!(problems[0].contains("missing declared result"));
    }

    #[test]
    fn oversized_result_is_rejected() {
        let effective = spec_with_result();
        let run = run_with(effective.clone(), Vec::new());
        let mut workload = build_workload(&run, &effective, Vec::new(), &[]);
        workload
            .status
            .result_files
            .insert("product".into(), "x".repeat(MAX_RESULT_BYTES + 1));
        let (_, problems) = extract_results(&effective, &workload);
        assert!(problems[0].contains("exceeds"));
    }

    #[test]
    fn first_failed_step_reports_exit_code() {
        let steps = vec![
            StepState {
                name: "ok".into(),
                terminated: Some(TerminationState::from_exit(0, None, None)),
                ..StepState::default()
            },
            StepState {
                name: "boom".into(),
                terminated: Some(TerminationState::from_exit(42, None, None)),
                ..StepState::default()
            },
        ];
        assert_eq!(first_failed_step(&steps), Some(("boom".into(), 42)));
    }
}
