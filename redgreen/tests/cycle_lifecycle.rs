//! End-to-end cycle scenarios over a real project directory.
//!
//! Test runs and the generation service are scripted; files and the state
//! document live on disk.

use redgreen::core::types::{Phase, TestStatus};
use redgreen::io::state_store::load;
use redgreen::test_support::{JEST_ONE_FAILING, JEST_ONE_PASSING, TestProject};
use serde_json::Value;

const WRITE_TEST: &str = r#"{"action":"write_test","file_path":"test/sum.test.js","name":"adds two numbers","code":"const sum = require('../src/sum');\ntest('adds two numbers', () => expect(sum(1, 2)).toBe(3));\n"}"#;
const IMPLEMENT: &str = r#"{"action":"implement","file_path":"src/sum.js","code":"module.exports = (a, b) => a + b;\n","satisfies":["adds two numbers"]}"#;

fn data(response: &redgreen::action::Response) -> &Value {
    response.data.as_ref().expect("response data")
}

#[test]
fn red_green_complete() {
    let project = TestProject::new().expect("project");
    let mut orch = project.orchestrator(
        project.config(),
        &[JEST_ONE_FAILING, JEST_ONE_PASSING],
        Vec::new(),
    );

    let init =
        orch.handle_json(r#"{"action":"init","feature":"sum","description":"adds numbers"}"#);
    assert!(init.success, "{}", init.message);
    assert_eq!(data(&init)["cycle"]["phase"], "READY");

    let written = orch.handle_json(WRITE_TEST);
    assert!(written.success, "{}", written.message);
    assert_eq!(data(&written)["phase"], "RED");
    assert!(project.read("test/sum.test.js").is_some());

    let red = orch.handle_json(r#"{"action":"run_tests","expectation":"fail"}"#);
    assert!(red.success, "{}", red.message);
    assert_eq!(data(&red)["expectation"]["expectation_met"], true);
    assert_eq!(data(&red)["phase"], "RED");
    assert_eq!(data(&red)["result"]["failures"][0]["test"], "sum › adds two numbers");

    let implemented = orch.handle_json(IMPLEMENT);
    assert!(implemented.success, "{}", implemented.message);
    assert_eq!(data(&implemented)["phase"], "RED");

    let green = orch.handle_json(r#"{"action":"run_tests","expectation":"pass"}"#);
    assert!(green.success, "{}", green.message);
    assert_eq!(data(&green)["expectation"]["expectation_met"], true);
    assert_eq!(data(&green)["phase"], "GREEN");

    let cycle_id = orch.store().active_cycle().expect("active").id.clone();
    assert!(
        orch.store()
            .implementations_for(&cycle_id)
            .iter()
            .all(|imp| imp.verified)
    );
    assert_eq!(
        orch.store().tests_for(&cycle_id)[0].status,
        TestStatus::Passed
    );

    let complete = orch.handle_json(r#"{"action":"complete"}"#);
    assert!(complete.success, "{}", complete.message);
    assert_eq!(data(&complete)["cycle"]["phase"], "COMPLETE");
    assert!(orch.store().active_cycle().is_none());

    let doc = load(&project.config().state_path());
    assert!(doc.active_cycle_id.is_none());
    assert_eq!(doc.cycles.len(), 1);
    assert_eq!(doc.cycles[0].phase, Phase::Complete);
    assert_eq!(doc.tests.len(), 1);
}

#[test]
fn phase_violation_leaves_phase_unchanged() {
    let project = TestProject::new().expect("project");
    let mut orch = project.orchestrator(project.config(), &[], Vec::new());
    orch.handle_json(r#"{"action":"init","feature":"sum"}"#);

    let refused = orch.handle_json(
        r#"{"action":"refactor","file_path":"src/sum.js","code":"x","description":"tidy"}"#,
    );
    assert!(!refused.success);
    assert_eq!(data(&refused)["kind"], "phase_violation");
    assert_eq!(data(&refused)["from"], "READY");
    assert_eq!(data(&refused)["to"], "REFACTOR");
    assert_eq!(orch.store().active_cycle().expect("active").phase, Phase::Ready);
    assert!(project.read("src/sum.js").is_none());

    let refused = orch.handle_json(r#"{"action":"complete"}"#);
    assert_eq!(data(&refused)["kind"], "phase_violation");
    assert_eq!(orch.store().active_cycle().expect("active").phase, Phase::Ready);
}

#[test]
fn lenient_mode_allows_out_of_order_actions() {
    let project = TestProject::new().expect("project");
    let config = redgreen::io::config::RedgreenConfig {
        strict: false,
        ..project.config()
    };
    let mut orch = project.orchestrator(config, &[], Vec::new());
    orch.handle_json(r#"{"action":"init","feature":"sum"}"#);

    let implemented = orch.handle_json(IMPLEMENT);
    assert!(implemented.success, "{}", implemented.message);
    let completed = orch.handle_json(r#"{"action":"complete"}"#);
    assert!(completed.success, "{}", completed.message);
}

/// Rollback restores files and phase only; records added after the
/// checkpoint stay.
#[test]
fn rollback_restores_files_and_phase_but_keeps_records() {
    let project = TestProject::new().expect("project");
    let mut orch = project.orchestrator(
        project.config(),
        &[JEST_ONE_FAILING, JEST_ONE_PASSING],
        Vec::new(),
    );
    orch.handle_json(r#"{"action":"init","feature":"sum"}"#);
    orch.handle_json(WRITE_TEST);

    let checkpoint = orch.handle_json(
        r#"{"action":"checkpoint","label":"red","reason":"before implementing","extra_paths":["README.md"]}"#,
    );
    assert!(checkpoint.success, "{}", checkpoint.message);
    assert_eq!(data(&checkpoint)["phase"], "RED");
    assert_eq!(data(&checkpoint)["files"], serde_json::json!(["test/sum.test.js"]));
    let checkpoint_id = data(&checkpoint)["checkpoint_id"]
        .as_str()
        .expect("checkpoint id")
        .to_string();
    let original_test = project.read("test/sum.test.js").expect("test file");

    orch.handle_json(r#"{"action":"run_tests","expectation":"fail"}"#);
    orch.handle_json(IMPLEMENT);
    orch.handle_json(
        r#"{"action":"write_test","file_path":"test/sum.test.js","name":"adds negatives","code":"// rewritten\n"}"#,
    );
    let green = orch.handle_json(r#"{"action":"run_tests","expectation":"pass"}"#);
    assert_eq!(data(&green)["phase"], "GREEN");

    let rollback = orch.handle_json(&format!(
        r#"{{"action":"rollback","checkpoint_id":"{checkpoint_id}"}}"#
    ));
    assert!(rollback.success, "{}", rollback.message);
    assert_eq!(data(&rollback)["phase"], "RED");
    assert_eq!(data(&rollback)["restored"], serde_json::json!(["test/sum.test.js"]));

    assert_eq!(project.read("test/sum.test.js").as_deref(), Some(original_test.as_str()));
    // Not part of the checkpoint, so left as implemented.
    assert!(project.read("src/sum.js").is_some());

    let cycle = orch.store().active_cycle().expect("active").clone();
    assert_eq!(cycle.phase, Phase::Red);
    assert_eq!(orch.store().tests_for(&cycle.id).len(), 2);
    assert_eq!(orch.store().implementations_for(&cycle.id).len(), 1);
    assert_eq!(cycle.tests_written, 2);
    assert_eq!(orch.store().checkpoints_for(&cycle.id)[0].tests.len(), 1);
}

#[test]
fn rollback_of_unknown_checkpoint_is_not_found() {
    let project = TestProject::new().expect("project");
    let mut orch = project.orchestrator(project.config(), &[], Vec::new());
    orch.handle_json(r#"{"action":"init","feature":"sum"}"#);
    let response = orch.handle_json(r#"{"action":"rollback","checkpoint_id":"nope"}"#);
    assert!(!response.success);
    assert_eq!(data(&response)["kind"], "not_found");
}

#[test]
fn state_survives_a_new_orchestrator() {
    let project = TestProject::new().expect("project");
    {
        let mut orch = project.orchestrator(project.config(), &[], Vec::new());
        orch.handle_json(r#"{"action":"init","feature":"sum"}"#);
        orch.handle_json(WRITE_TEST);
    }
    let mut orch = project.orchestrator(project.config(), &[JEST_ONE_FAILING], Vec::new());
    let cycle = orch.store().active_cycle().expect("active after reopen");
    assert_eq!(cycle.phase, Phase::Red);
    assert_eq!(cycle.tests_written, 1);

    let second = orch.handle_json(r#"{"action":"init","feature":"other"}"#);
    assert_eq!(data(&second)["kind"], "validation");

    let run = orch.handle_json(r#"{"action":"run_tests"}"#);
    assert!(run.success, "{}", run.message);
    assert!(data(&run)["expectation"].is_null());
    assert_eq!(orch.normalizer().runner().requests()[0].command.display(), "npx jest --ci");
}

#[test]
fn execution_errors_are_reported() {
    let project = TestProject::new().expect("project");
    let mut orch = project.orchestrator(project.config(), &[], Vec::new());
    orch.handle_json(r#"{"action":"init","feature":"sum"}"#);
    orch.handle_json(WRITE_TEST);

    // The scripted runner has nothing queued, which surfaces like a spawn failure.
    let response = orch.handle_json(r#"{"action":"run_tests"}"#);
    assert!(!response.success);
    assert_eq!(data(&response)["kind"], "execution");

    orch.normalizer().runner().push_output(JEST_ONE_FAILING);
    let response = orch.handle_json(r#"{"action":"run_tests","pattern":"sum"}"#);
    assert!(response.success, "{}", response.message);
    assert_eq!(
        orch.normalizer().runner().requests()[1].command.display(),
        "npx jest --ci sum"
    );
}
