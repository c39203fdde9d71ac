//! Property-based tests for object-model invariants.
//!
//! These tests use proptest to verify invariants hold across randomly
//! generated inputs: conversion round-trips, substitution purity, the
//! timeout chain, unique-name rejection, and monotone conditions.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use proptest::prelude::*;

use tenon_api::convert::{LegacyPipelineRef, LegacyPipelineRun, LegacyPipelineRunSpec, LegacyTaskRef, LegacyTaskRun, LegacyTaskRunSpec};
use tenon_api::duration::ApiDuration;
use tenon_api::param::{Param, ParamSpec, ParamValue};
use tenon_api::pipeline::{PipelineRef, PipelineSpec, PipelineTask};
use tenon_api::pipelinerun::{PipelineRun, PipelineRunSpec, PipelineRunStatus, TimeoutFields};
use tenon_api::subst::Substitutions;
use tenon_api::task::{Step, TaskSpec};
use tenon_api::taskrun::TaskRunStatus;
use tenon_api::validate::Validate;
use tenon_core::{Condition, ConditionStatus, ObjectMeta, SucceededReason};

fn arb_name() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9-]{0,14}[a-z0-9]"
}

fn arb_bundle() -> impl Strategy<Value = String> {
    "[a-z]{3,8}\\.io/[a-z]{3,8}:[a-z0-9]{1,6}"
}

fn arb_param_value() -> impl Strategy<Value = ParamValue> {
    prop_oneof![
        "[ -~]{0,20}".prop_map(ParamValue::String),
        prop::collection::vec("[a-z0-9]{1,8}", 0..4).prop_map(ParamValue::Array),
        prop::collection::btree_map("[a-z]{1,6}", "[a-z0-9]{1,8}", 0..4)
            .prop_map(ParamValue::Object),
    ]
}

fn arb_params() -> impl Strategy<Value = Vec<Param>> {
    prop::collection::vec(
        (arb_name(), arb_param_value()).prop_map(|(name, value)| Param { name, value }),
        0..4,
    )
}

proptest! {
    // Round-trip: for every valid vA object,
    // from_current(to_current(o)) == o modulo the tenon.io/ namespace.
    #[test]
    fn legacy_task_run_round_trips(
        name in arb_name(),
        ref_name in arb_name(),
        bundle in prop::option::of(arb_bundle()),
        params in arb_params(),
        timeout_secs in prop::option::of(0i64..86_400),
    ) {
        let original = LegacyTaskRun {
            metadata: ObjectMeta::namespaced(name, "default"),
            spec: LegacyTaskRunSpec {
                task_ref: Some(LegacyTaskRef {
                    name: ref_name,
                    bundle: bundle.unwrap_or_default(),
                }),
                params,
                timeout: timeout_secs.map(ApiDuration::from_secs),
                ..LegacyTaskRunSpec::default()
            },
            status: TaskRunStatus::default(),
        };

        let current = original.to_current().unwrap();
        let back = LegacyTaskRun::from_current(&current).unwrap();
        prop_assert_eq!(back, original);
    }

    #[test]
    fn legacy_pipeline_run_round_trips(
        name in arb_name(),
        ref_name in arb_name(),
        bundle in prop::option::of(arb_bundle()),
        timeout_secs in prop::option::of(1i64..86_400),
    ) {
        let original = LegacyPipelineRun {
            metadata: ObjectMeta::namespaced(name, "default"),
            spec: LegacyPipelineRunSpec {
                pipeline_ref: Some(LegacyPipelineRef {
                    name: ref_name,
                    bundle: bundle.unwrap_or_default(),
                }),
                timeout: timeout_secs.map(ApiDuration::from_secs),
                ..LegacyPipelineRunSpec::default()
            },
            status: PipelineRunStatus::default(),
        };

        let current = original.to_current().unwrap();
        let back = LegacyPipelineRun::from_current(&current).unwrap();
        prop_assert_eq!(back, original);
    }

    // Substitution purity: same (template, scopes) always yields the same
    // output, and templates without references pass through untouched.
    #[test]
    fn substitution_is_a_pure_function(
        template in "[ -~]{0,60}",
        key in arb_name(),
        value in "[ -~]{0,20}",
    ) {
        let mut subs = Substitutions::new();
        subs.bind_param(&key, &ParamValue::String(value));

        let first = subs.apply_to_string(&template);
        let second = subs.apply_to_string(&template);
        prop_assert_eq!(first, second);
    }

    #[test]
    fn substitution_without_references_is_identity(
        template in "[a-zA-Z0-9 .,;:!?/_-]{0,60}",
    ) {
        let subs = Substitutions::new();
        prop_assert_eq!(subs.apply_to_string(&template), template);
    }

    // Timeout chain: tasks + finally > pipeline > 0 is rejected, as is
    // tasks > pipeline > 0.
    #[test]
    fn timeout_chain_violations_are_rejected(
        pipeline in 1i64..10_000,
        tasks in 1i64..10_000,
        finally_ in 1i64..10_000,
    ) {
        let run = PipelineRun {
            metadata: ObjectMeta::named("pr"),
            spec: PipelineRunSpec {
                pipeline_ref: Some(PipelineRef::named("p")),
                timeouts: Some(TimeoutFields {
                    pipeline: Some(ApiDuration::from_secs(pipeline)),
                    tasks: Some(ApiDuration::from_secs(tasks)),
                    finally_: Some(ApiDuration::from_secs(finally_)),
                }),
                ..PipelineRunSpec::default()
            },
            status: PipelineRunStatus::default(),
        };

        let errs = run.validate();
        let violates = tasks > pipeline || finally_ > pipeline || tasks + finally_ > pipeline;
        prop_assert_eq!(!errs.is_empty(), violates);
    }

    // Unique names: duplicate sibling names in any unique-within-scope set
    // are rejected.
    #[test]
    fn duplicate_task_param_names_are_rejected(name in arb_name()) {
        let spec = TaskSpec {
            params: vec![ParamSpec::string(&name), ParamSpec::string(&name)],
            steps: vec![Step {
                name: "run".into(),
                image: "alpine".into(),
                script: "true".into(),
                ..Step::default()
            }],
            ..TaskSpec::default()
        };
        prop_assert!(!spec.validate().is_empty());
    }

    #[test]
    fn duplicate_pipeline_task_names_are_rejected(name in arb_name()) {
        let task = PipelineTask {
            name: name.clone(),
            task_spec: Some(TaskSpec {
                steps: vec![Step {
                    name: "run".into(),
                    image: "alpine".into(),
                    script: "true".into(),
                    ..Step::default()
                }],
                ..TaskSpec::default()
            }),
            ..PipelineTask::default()
        };
        let spec = PipelineSpec {
            tasks: vec![task.clone(), task],
            ..PipelineSpec::default()
        };
        prop_assert!(!spec.validate().is_empty());
    }

    // Monotone status: conditions never leave a terminal state.
    #[test]
    fn terminal_conditions_are_monotone(
        start_terminal in prop::bool::ANY,
        attempt_status in prop::sample::select(vec![
            ConditionStatus::True,
            ConditionStatus::False,
            ConditionStatus::Unknown,
        ]),
    ) {
        let (status, reason) = if start_terminal {
            (ConditionStatus::True, SucceededReason::Succeeded)
        } else {
            (ConditionStatus::Unknown, SucceededReason::Running)
        };
        let mut condition = Condition::succeeded(status, reason, "msg");
        let before = (condition.status, condition.reason);

        let result = condition.transition(attempt_status, SucceededReason::Failed, "later");
        if start_terminal {
            // Either rejected or an idempotent no-op; the recorded state
            // never changes.
            prop_assert_eq!((condition.status, condition.reason), before);
            prop_assert!(result.is_err() || attempt_status == ConditionStatus::True);
        } else {
            prop_assert!(result.is_ok());
        }
    }
}
