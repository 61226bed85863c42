use delve_core::{
    DependencyScheduler, ExecutionContext, OrchestratorConfig, ScheduleOutcome, SharedContext,
    SkipReason, StepStatus,
};
use delve_plan::{Plan, StepId, StepRouter, StepType};
use delve_test_utils::{plan, ScriptedCapability};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::{Duration, Instant};

fn scheduler(capability: &Arc<ScriptedCapability>) -> DependencyScheduler {
    DependencyScheduler::new(StepRouter::new(), capability.registry(), &OrchestratorConfig::new())
}

async fn run(scheduler: &DependencyScheduler, plan: &Plan) -> (ExecutionContext, bool) {
    let outcome = scheduler
        .execute(plan, ExecutionContext::new(plan), Arc::new(SharedContext::new("q")))
        .await;
    match outcome {
        ScheduleOutcome::Completed {
            context,
            early_terminated,
        } => (context, early_terminated),
        other => panic!("expected completion, got {other:?}"),
    }
}

#[tokio::test]
async fn failure_skips_exactly_the_dependency_chain() {
    let plan = plan(&[
        ("KB_QUERY", &[]),
        ("WEB_SEARCH", &[]),
        ("AGGREGATE", &[1, 2]),
        ("COMPARE", &[3]),
    ]);
    let capability = Arc::new(ScriptedCapability::new().with_failure(2, "search backend down"));

    let (context, early) = run(&scheduler(&capability), &plan).await;

    assert!(!early);
    assert_eq!(context.status(StepId(1)), Some(StepStatus::Done));
    assert_eq!(context.status(StepId(2)), Some(StepStatus::Failed));
    for id in [3, 4] {
        let record = context.get(StepId(id)).unwrap();
        assert_eq!(record.status, StepStatus::Skipped);
        assert_eq!(
            record.skip_reason,
            Some(SkipReason::UpstreamFailure { failed: StepId(2) })
        );
    }
    assert_eq!(capability.invocation_count(3), 0);
    assert_eq!(capability.invocation_count(4), 0);
}

#[tokio::test]
async fn unrelated_branches_survive_a_failure() {
    let plan = plan(&[
        ("KB_QUERY", &[]),
        ("WEB_SEARCH", &[]),
        ("AGGREGATE", &[1]),
        ("COMPARE", &[2]),
    ]);
    let capability = Arc::new(ScriptedCapability::new().with_failure(2, "down"));

    let (context, _) = run(&scheduler(&capability), &plan).await;

    assert_eq!(context.status(StepId(3)), Some(StepStatus::Done));
    assert_eq!(context.status(StepId(4)), Some(StepStatus::Skipped));
    assert_eq!(context.final_output(), Some((StepId(3), "AGGREGATE: step 3")));
}

#[tokio::test]
async fn aggregation_input_ignores_completion_order() {
    let plan = plan(&[
        ("KB_QUERY", &[]),
        ("WEB_SEARCH", &[]),
        ("KB_QUERY", &[]),
        ("AGGREGATE", &[1, 2, 3]),
    ]);

    let in_order = Arc::new(
        ScriptedCapability::new()
            .with_output(1, "alpha")
            .with_output(2, "beta")
            .with_output(3, "gamma")
            .with_delay(1, Duration::from_millis(10))
            .with_delay(2, Duration::from_millis(30))
            .with_delay(3, Duration::from_millis(50)),
    );
    let reversed = Arc::new(
        ScriptedCapability::new()
            .with_output(1, "alpha")
            .with_output(2, "beta")
            .with_output(3, "gamma")
            .with_delay(1, Duration::from_millis(80))
            .with_delay(2, Duration::from_millis(40))
            .with_delay(3, Duration::from_millis(1)),
    );

    let (first, _) = run(&scheduler(&in_order), &plan).await;
    let (second, _) = run(&scheduler(&reversed), &plan).await;

    let prompt = |cap: &ScriptedCapability| {
        cap.invocations()
            .into_iter()
            .find(|inv| inv.step_type == StepType::Aggregate)
            .map(|inv| inv.prompt)
            .unwrap()
    };
    assert_eq!(prompt(in_order.as_ref()), prompt(reversed.as_ref()));
    assert_eq!(
        prompt(in_order.as_ref()),
        "Aggregate the following data:\n\nStep 1 output:\nalpha\n\nStep 2 output:\nbeta\n\nStep 3 output:\ngamma\n\n"
    );
    assert_eq!(first.final_output(), second.final_output());
}

#[tokio::test]
async fn long_synthesis_skips_remaining_gathering() {
    let plan = plan(&[
        ("KB_QUERY", &[]),
        ("AGGREGATE", &[1]),
        ("WEB_SEARCH", &[2]),
        ("NEWS_SEARCH", &[2]),
    ]);
    let capability = Arc::new(ScriptedCapability::new().with_output(2, "x".repeat(801)));

    let (context, early) = run(&scheduler(&capability), &plan).await;

    assert!(early);
    for id in [3, 4] {
        assert_eq!(
            context.get(StepId(id)).unwrap().skip_reason,
            Some(SkipReason::EarlyTermination)
        );
        assert_eq!(capability.invocation_count(id), 0);
    }
}

#[tokio::test]
async fn threshold_length_does_not_terminate() {
    let plan = plan(&[
        ("KB_QUERY", &[]),
        ("AGGREGATE", &[1]),
        ("WEB_SEARCH", &[2]),
    ]);
    let capability = Arc::new(ScriptedCapability::new().with_output(2, "x".repeat(800)));

    let (context, early) = run(&scheduler(&capability), &plan).await;

    assert!(!early);
    assert_eq!(context.count(StepStatus::Done), 3);
}

#[tokio::test]
async fn pending_synthesis_keeps_the_plan_running() {
    let plan = plan(&[
        ("KB_QUERY", &[]),
        ("AGGREGATE", &[1]),
        ("WEB_SEARCH", &[2]),
        ("COMPARE", &[2, 3]),
    ]);
    let capability = Arc::new(ScriptedCapability::new().with_output(2, "x".repeat(2000)));

    let (context, early) = run(&scheduler(&capability), &plan).await;

    assert!(!early);
    assert_eq!(context.count(StepStatus::Done), 4);
}

#[tokio::test]
async fn final_synthesis_with_nothing_left_skips_nothing() {
    let plan = plan(&[
        ("KB_QUERY", &[]),
        ("WEB_SEARCH", &[]),
        ("AGGREGATE", &[1, 2]),
    ]);
    let capability = Arc::new(ScriptedCapability::new().with_output(3, "y".repeat(900)));

    let (context, early) = run(&scheduler(&capability), &plan).await;

    assert!(!early);
    assert_eq!(context.count(StepStatus::Done), 3);
    assert_eq!(context.count(StepStatus::Skipped), 0);
}

#[tokio::test]
async fn early_termination_does_not_wait_for_running_calls() {
    let plan = plan(&[
        ("KB_QUERY", &[]),
        ("AGGREGATE", &[1]),
        ("WEB_SEARCH", &[]),
    ]);
    let capability = Arc::new(
        ScriptedCapability::new()
            .with_output(2, "z".repeat(1000))
            .with_delay(3, Duration::from_secs(30)),
    );

    let started = Instant::now();
    let (context, early) = run(&scheduler(&capability), &plan).await;

    assert!(early);
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(capability.invocation_count(3), 1);
    let record = context.get(StepId(3)).unwrap();
    assert_eq!(record.status, StepStatus::Skipped);
    assert!(record.output.is_empty());
}

#[tokio::test]
async fn independent_steps_respect_the_concurrency_cap() {
    let plan = plan(&[
        ("WEB_SEARCH", &[]),
        ("WEB_SEARCH", &[]),
        ("KB_QUERY", &[]),
        ("KB_QUERY", &[]),
        ("NEWS_SEARCH", &[]),
        ("NEWS_SEARCH", &[]),
        ("WEB_SEARCH", &[]),
    ]);
    let capability = Arc::new(
        (1..=7).fold(ScriptedCapability::new(), |cap, id| {
            cap.with_delay(id, Duration::from_millis(30))
        }),
    );

    let (context, _) = run(&scheduler(&capability), &plan).await;

    assert_eq!(context.count(StepStatus::Done), 7);
    assert_eq!(capability.peak_concurrency(), 4);
}

#[tokio::test]
async fn clarification_pauses_only_its_branch() {
    let plan = plan(&[
        ("KB_QUERY", &[]),
        ("WEB_SEARCH", &[]),
        ("AGGREGATE", &[2]),
        ("COMPARE", &[1]),
    ]);
    let capability = Arc::new(ScriptedCapability::new().with_clarification(2, &["Which year?"]));
    let scheduler = scheduler(&capability);

    let outcome = scheduler
        .execute(&plan, ExecutionContext::new(&plan), Arc::new(SharedContext::new("q")))
        .await;

    let ScheduleOutcome::Suspended {
        context,
        step_id,
        questions,
    } = outcome
    else {
        panic!("expected suspension");
    };
    assert_eq!(step_id, StepId(2));
    assert_eq!(questions, vec!["Which year?".to_string()]);
    assert_eq!(context.status(StepId(1)), Some(StepStatus::Done));
    assert_eq!(context.status(StepId(4)), Some(StepStatus::Done));
    assert_eq!(context.status(StepId(2)), Some(StepStatus::Pending));
    assert_eq!(context.status(StepId(3)), Some(StepStatus::Pending));

    // Refusing clarification turns the same reply into a failure.
    let refused = scheduler
        .execute(
            &plan,
            context,
            Arc::new(SharedContext::new("q").without_clarification()),
        )
        .await;
    let ScheduleOutcome::Completed { context, .. } = refused else {
        panic!("expected completion");
    };
    assert_eq!(context.status(StepId(2)), Some(StepStatus::Failed));
    assert_eq!(context.status(StepId(3)), Some(StepStatus::Skipped));
    assert_eq!(capability.invocation_count(1), 1);
}
