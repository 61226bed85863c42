use std::io::Write;
use std::process::Command;

fn delve() -> Command {
    Command::new(env!("CARGO_BIN_EXE_delve"))
}

fn file_with(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
}

#[test]
fn validate_prints_the_normalized_plan() {
    let proposal = file_with(
        "Here is the plan:\n```json\n{\"steps\":[\
         {\"step_type\":\"kb_query\",\"action\":\"Our LTIR\"},\
         {\"step_type\":\"web_search\",\"action\":\"Peer LTIR\"},\
         {\"step_type\":\"compare\",\"action\":\"Compare\",\"dependencies\":[1,2]}]}\n```",
    );

    let output = delve().arg("validate").arg(proposal.path()).output().unwrap();

    assert!(output.status.success());
    let plan: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    let steps = plan["steps"].as_array().unwrap();
    assert_eq!(steps.len(), 3);
    assert_eq!(steps[2]["step_type"], "COMPARE");
    assert_eq!(steps[2]["dependencies"], serde_json::json!([1, 2]));
}

#[test]
fn validate_rejects_forward_dependencies() {
    let proposal = file_with(
        "{\"steps\":[\
         {\"step_type\":\"aggregate\",\"action\":\"a\",\"dependencies\":[2]},\
         {\"step_type\":\"web_search\",\"action\":\"b\"}]}",
    );

    let output = delve().arg("validate").arg(proposal.path()).output().unwrap();

    assert_eq!(output.status.code(), Some(2));
    assert!(String::from_utf8_lossy(&output.stderr).contains("plan invalid"));
}

#[test]
fn simulate_reports_partial_failure() {
    let scenario = file_with(
        r#"
question = "Compare safety"

[[steps]]
step_type = "KB_QUERY"
action = "ours"

[[steps]]
step_type = "WEB_SEARCH"
action = "theirs"
fail = "search backend down"

[[steps]]
step_type = "COMPARE"
action = "compare"
dependencies = [1, 2]
"#,
    );

    let output = delve().arg("simulate").arg(scenario.path()).output().unwrap();

    assert!(output.status.success());
    let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(report["outcome"], "answer");
    assert_eq!(report["answer"]["text"], "simulated: ours");
    assert_eq!(report["answer"]["caveats"][0]["caveat"], "partial_failure");
}
