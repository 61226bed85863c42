use delve_core::{
    Caveat, ConversationContext, Orchestrator, OrchestratorConfig, RequestKind, StageConfig,
    StageIndex, StageSplitter, TopicSpec,
};
use delve_test_utils::{collaborators, ScriptedCapability, ScriptedPlanner, ScriptedStageGenerator};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;

fn topic() -> TopicSpec {
    TopicSpec {
        topic: "Safety performance".to_string(),
        source_material: "LTIR fell from 0.42 to 0.31.".to_string(),
    }
}

#[tokio::test]
async fn report_follows_the_previous_answer() {
    let stages = Arc::new(
        ScriptedStageGenerator::new()
            .then_ok("## Summary\n- LTIR fell")
            .then_ok("<h2>Body</h2><p>Details</p>")
            .then_ok("<p>Done</p>"),
    );
    let orch = Orchestrator::new(
        OrchestratorConfig::new(),
        collaborators(
            RequestKind::Report,
            Arc::new(ScriptedPlanner::new(&[""])),
            Arc::new(ScriptedCapability::new()),
            stages.clone(),
        ),
    )
    .unwrap();
    let conversation = ConversationContext::new()
        .with_turn("Old question", "old answer")
        .with_turn("How is our safety?", "LTIR fell");

    let outcome = orch
        .execute_plan("Write that up as a report", &conversation)
        .await
        .unwrap();
    let answer = outcome.answer().unwrap();

    assert_eq!(
        answer.text,
        "<h2>Summary</h2>\n<ul>\n<li>LTIR fell</li>\n</ul>\n<h2>Body</h2><p>Details</p><p>Done</p>"
    );
    assert!(answer.caveats.is_empty());
    assert_eq!(answer.kind, RequestKind::Report);

    let jobs = stages.jobs();
    assert_eq!(jobs.len(), 3);
    assert_eq!(jobs[0].prior_stages_output, "");
    assert_eq!(
        jobs[2].prior_stages_output,
        "<h2>Summary</h2>\n<ul>\n<li>LTIR fell</li>\n</ul>\n<h2>Body</h2><p>Details</p>"
    );
}

#[tokio::test]
async fn failed_stage_retries_with_half_the_budget() {
    let stages = Arc::new(
        ScriptedStageGenerator::new()
            .then_ok("<p>s</p>")
            .then_err("rate limited")
            .then_ok("<p>b</p>"),
    );
    let splitter = StageSplitter::new(stages.clone(), StageConfig::default());

    let report = splitter.generate(&topic()).await;

    assert!(!report.degraded);
    let budgets: Vec<(StageIndex, u32)> = stages
        .jobs()
        .iter()
        .map(|job| (job.stage_index, job.token_budget))
        .collect();
    assert_eq!(
        budgets,
        vec![
            (StageIndex::Summary, 1024),
            (StageIndex::Body, 3072),
            (StageIndex::Body, 1536),
            (StageIndex::Conclusion, 1024),
        ]
    );
    assert_eq!(report.body, "<p>s</p><p>b</p><p>Conclusion</p>");
}

#[tokio::test(start_paused = true)]
async fn stage_timeouts_degrade_to_source_material() {
    let stages = Arc::new(ScriptedStageGenerator::new().with_delay(Duration::from_secs(30)));
    let splitter = StageSplitter::new(stages.clone(), StageConfig::default());

    let report = splitter.generate(&topic()).await;

    assert!(report.degraded);
    assert!(report.stage_outputs.is_empty());
    assert!(report.body.starts_with("[Report generation degraded:"));
    assert!(report
        .body
        .ends_with("# Safety performance\n\nLTIR fell from 0.42 to 0.31."));
    // One attempt and one retry, then no further stages.
    assert_eq!(stages.jobs().len(), 2);
}

#[tokio::test]
async fn degraded_report_is_caveated() {
    let stages = Arc::new(
        ScriptedStageGenerator::new()
            .then_ok("<p>s</p>")
            .then_ok("<p>b</p>")
            .then_err("down")
            .then_err("still down"),
    );
    let orch = Orchestrator::new(
        OrchestratorConfig::new(),
        collaborators(
            RequestKind::Report,
            Arc::new(ScriptedPlanner::new(&[""])),
            Arc::new(ScriptedCapability::new()),
            stages,
        ),
    )
    .unwrap();
    let conversation = ConversationContext::new().with_turn("Safety?", "LTIR fell");

    let outcome = orch.execute_plan("report", &conversation).await.unwrap();
    let answer = outcome.answer().unwrap();

    assert!(answer.degraded);
    assert_eq!(answer.caveats, vec![Caveat::DegradedReport]);
    assert!(answer.text.contains("still down"));
    assert!(answer.text.ends_with("# Safety?\n\nLTIR fell"));
}
