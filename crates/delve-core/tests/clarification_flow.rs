use delve_core::{
    Caveat, ConversationContext, Orchestrator, OrchestratorConfig, OrchestratorError, Outcome,
    RequestKind, StepStatus, SuspendedState,
};
use delve_plan::StepId;
use delve_test_utils::{
    collaborators, proposal, ScriptedCapability, ScriptedPlanner, ScriptedStageGenerator,
};
use pretty_assertions::assert_eq;
use std::sync::Arc;

const QUESTION: &str = "How do major companies compare on recent safety performance?";

fn orchestrator(planner: ScriptedPlanner, capability: &Arc<ScriptedCapability>) -> Orchestrator {
    Orchestrator::new(
        OrchestratorConfig::new(),
        collaborators(
            RequestKind::Plan,
            Arc::new(planner),
            capability.clone(),
            Arc::new(ScriptedStageGenerator::new()),
        ),
    )
    .unwrap()
}

fn three_step_planner() -> ScriptedPlanner {
    ScriptedPlanner::proposing(&proposal(&[
        ("KB_QUERY", &[]),
        ("WEB_SEARCH", &[]),
        ("AGGREGATE", &[1, 2]),
    ]))
}

fn expect_clarification(outcome: Outcome) -> delve_core::ClarificationRequest {
    match outcome {
        Outcome::Clarification(request) => request,
        Outcome::Answer(answer) => panic!("expected clarification, got answer: {}", answer.text),
    }
}

#[tokio::test]
async fn fourth_attempt_answers_with_lenient_defaults() {
    let capability = Arc::new(
        ScriptedCapability::new().with_clarification_times(2, &["Which companies?"], 4, "peer data"),
    );
    let orch = orchestrator(three_step_planner(), &capability);
    let conversation = ConversationContext::new();

    let mut request = expect_clarification(orch.execute_plan(QUESTION, &conversation).await.unwrap());
    for round in 1..=3 {
        assert_eq!(request.round, round);
        assert_eq!(request.step_id, Some(StepId(2)));
        assert_eq!(request.questions, vec!["Which companies?".to_string()]);
        if round == 3 {
            break;
        }
        request = expect_clarification(
            orch.resume_with_answers(request.state, vec!["not sure".into()])
                .await
                .unwrap(),
        );
    }

    let outcome = orch
        .resume_with_answers(request.state, vec!["still not sure".into()])
        .await
        .unwrap();
    let Outcome::Answer(answer) = outcome else {
        panic!("round four must answer");
    };

    assert_eq!(answer.text, "AGGREGATE: step 3");
    let assumptions = answer
        .caveats
        .iter()
        .find_map(|c| match c {
            Caveat::LenientDefaultsApplied { assumptions } => Some(assumptions.clone()),
            _ => None,
        })
        .unwrap();
    assert!(assumptions[0].contains("top 5 by market capitalization"));
    assert!(assumptions[1].contains("the most recent reporting period"));

    // The fourth question aborts the dialogue; the fifth call runs without it.
    assert_eq!(capability.invocation_count(1), 1);
    assert_eq!(capability.invocation_count(2), 5);
    let last = capability
        .invocations()
        .into_iter()
        .filter(|inv| inv.step_id == StepId(2))
        .last()
        .unwrap();
    assert!(!last.allow_clarification);
    assert!(last.prompt.contains("Assumptions:"));
    assert!(last.prompt.contains("- Which companies?: still not sure"));
}

#[tokio::test]
async fn persistent_clarification_cannot_loop_forever() {
    let capability = Arc::new(ScriptedCapability::new().with_clarification(2, &["Which year?"]));
    let orch = orchestrator(three_step_planner(), &capability);

    let mut outcome = orch
        .execute_plan(QUESTION, &ConversationContext::new())
        .await
        .unwrap();
    let mut attempts = 1;
    while let Outcome::Clarification(request) = outcome {
        assert!(attempts <= 3);
        outcome = orch
            .resume_with_answers(request.state, vec!["2024".into()])
            .await
            .unwrap();
        attempts += 1;
    }
    assert_eq!(attempts, 4);

    let answer = outcome.answer().unwrap();
    assert_eq!(answer.step_records[&StepId(2)].status, StepStatus::Failed);
    assert_eq!(answer.step_records[&StepId(3)].status, StepStatus::Skipped);
    assert_eq!(answer.text, "KB_QUERY: step 1");
    assert!(answer
        .caveats
        .iter()
        .any(|c| matches!(c, Caveat::PartialFailure { .. })));
}

#[tokio::test]
async fn planner_clarification_merges_answers_into_the_question() {
    let planner = Arc::new(ScriptedPlanner::new(&[
        "CLARIFICATION_NEEDED:\n1) Which companies?\n2) Which metric?",
        "```json\n{\"steps\":[{\"step_type\":\"web_search\",\"action\":\"A and B LTIR\"}]}\n```",
    ]));
    let capability = Arc::new(ScriptedCapability::new());
    let orch = Orchestrator::new(
        OrchestratorConfig::new(),
        collaborators(
            RequestKind::Plan,
            planner.clone(),
            capability.clone(),
            Arc::new(ScriptedStageGenerator::new()),
        ),
    )
    .unwrap();

    let request = expect_clarification(
        orch.execute_plan("Compare safety", &ConversationContext::new())
            .await
            .unwrap(),
    );
    assert_eq!(request.step_id, None);
    assert_eq!(request.questions.len(), 2);

    let outcome = orch
        .resume_with_answers(request.state, vec!["A and B".into(), "LTIR".into()])
        .await
        .unwrap();
    assert_eq!(outcome.answer().unwrap().text, "WEB_SEARCH: A and B LTIR");

    let asked = planner.questions();
    assert_eq!(asked[0], "Compare safety");
    assert_eq!(
        asked[1],
        "Original question: Compare safety\n\nAdditional context:\n- Which companies?: A and B\n- Which metric?: LTIR\n"
    );
}

#[tokio::test]
async fn suspended_state_survives_json() {
    let capability = Arc::new(
        ScriptedCapability::new().with_clarification_times(2, &["Which year?"], 1, "2024 data"),
    );
    let orch = orchestrator(three_step_planner(), &capability);

    let request = expect_clarification(
        orch.execute_plan(QUESTION, &ConversationContext::new())
            .await
            .unwrap(),
    );
    let json = request.state.to_json().unwrap();
    let restored = SuspendedState::from_json(&json).unwrap();
    assert_eq!(restored, request.state);

    let outcome = orch
        .resume_with_answers(restored, vec!["2024".into()])
        .await
        .unwrap();
    let answer = outcome.answer().unwrap();
    assert_eq!(answer.text, "AGGREGATE: step 3");
    assert!(answer.caveats.is_empty());
    assert_eq!(capability.invocation_count(1), 1);
}

#[tokio::test]
async fn tampered_state_is_rejected() {
    let capability = Arc::new(ScriptedCapability::new().with_clarification(2, &["?"]));
    let orch = orchestrator(three_step_planner(), &capability);
    let request = expect_clarification(
        orch.execute_plan(QUESTION, &ConversationContext::new())
            .await
            .unwrap(),
    );

    let mut orphaned = request.state.clone();
    orphaned.plan = None;
    let err = orch
        .resume_with_answers(orphaned, vec![])
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::Resume(_)));

    let json = request.state.to_json().unwrap();
    let broken = json.replace("\"dependencies\":[1,2]", "\"dependencies\":[3]");
    assert!(SuspendedState::from_json(&broken).is_err());
}

async fn suspended_state(orch: &Orchestrator) -> SuspendedState {
    expect_clarification(
        orch.execute_plan(QUESTION, &ConversationContext::new())
            .await
            .unwrap(),
    )
    .state
}

#[tokio::test]
async fn over_cap_plan_in_state_is_rejected() {
    let capability = Arc::new(ScriptedCapability::new().with_clarification(2, &["?"]));
    let orch = orchestrator(three_step_planner(), &capability);
    let state = suspended_state(&orch).await;

    let mut value: serde_json::Value = serde_json::from_str(&state.to_json().unwrap()).unwrap();
    value["plan"]["tier"] = "simple".into();
    let steps = value["plan"]["steps"].as_array_mut().unwrap();
    let template = steps[0].clone();
    for id in 4..=9 {
        let mut extra = template.clone();
        extra["id"] = id.into();
        steps.push(extra);
    }
    let err = SuspendedState::from_json(&value.to_string()).unwrap_err();
    assert!(err.to_string().contains("simple tier cap of 5"));

    let tight = Orchestrator::new(
        OrchestratorConfig::from_toml_str("[plan.caps]\nsimple = 2\nmedium = 2\ncomplex = 2\n").unwrap(),
        collaborators(
            RequestKind::Plan,
            Arc::new(three_step_planner()),
            capability.clone(),
            Arc::new(ScriptedStageGenerator::new()),
        ),
    )
    .unwrap();
    let err = tight.resume_with_answers(state, vec!["x".into()]).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::Resume(msg) if msg.contains("tier cap of 2")));
}

#[tokio::test]
async fn records_without_a_usable_result_are_rejected() {
    let capability = Arc::new(ScriptedCapability::new().with_clarification(2, &["?"]));
    let orch = orchestrator(three_step_planner(), &capability);
    let state = suspended_state(&orch).await;
    assert_eq!(
        state.context.as_ref().unwrap().status(StepId(1)),
        Some(StepStatus::Done)
    );
    let value: serde_json::Value = serde_json::from_str(&state.to_json().unwrap()).unwrap();

    let mut running = value.clone();
    running["context"]["records"]["1"]["status"] = "running".into();
    let running = SuspendedState::from_json(&running.to_string()).unwrap();
    let err = orch.resume_with_answers(running, vec!["x".into()]).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::Resume(msg) if msg.contains("step 1 is running")));

    let mut hollow = value;
    hollow["context"]["records"]["1"]["output"] = "".into();
    let hollow = SuspendedState::from_json(&hollow.to_string()).unwrap();
    let err = orch.resume_with_answers(hollow, vec!["x".into()]).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::Resume(msg) if msg.contains("step 1 is done")));

    assert_eq!(capability.invocation_count(3), 0);
}

#[tokio::test]
async fn invalid_proposal_is_the_only_fatal_error() {
    let planner = ScriptedPlanner::proposing(&proposal(&[("KB_QUERY", &[]), ("SUMMARIZE", &[1])]));
    let orch = orchestrator(planner, &Arc::new(ScriptedCapability::new()));

    let err = orch
        .execute_plan("q", &ConversationContext::new())
        .await
        .unwrap_err();
    assert!(err.requires_replan());
}
