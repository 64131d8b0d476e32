//! CLI tests: spawn the binary and check responses and exit codes.

use std::io::Write;
use std::path::Path;
use std::process::{Command, Output, Stdio};

use redgreen::action::Response;
use redgreen::exit_codes;

fn redgreen(project: &Path) -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_redgreen"));
    cmd.env("STATE_DIR", project.join(".redgreen"))
        .env("TDD_SERVICE_URL", "http://127.0.0.1:9")
        .env_remove("RUST_LOG")
        .arg("--project-root")
        .arg(project);
    cmd
}

fn responses(output: &Output) -> Vec<Response> {
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .map(|line| serde_json::from_str(line).expect("response line"))
        .collect()
}

#[test]
fn call_executes_one_action() {
    let temp = tempfile::tempdir().expect("tempdir");
    let output = redgreen(temp.path())
        .args(["call", r#"{"action":"init","feature":"sum"}"#])
        .output()
        .expect("redgreen call");
    assert_eq!(output.status.code(), Some(exit_codes::OK));
    let first = responses(&output);
    assert_eq!(first.len(), 1);
    assert!(first[0].success);
    assert!(temp.path().join(".redgreen/state.json").exists());

    let output = redgreen(temp.path())
        .args(["call", r#"{"action":"init","feature":"again"}"#])
        .output()
        .expect("redgreen call");
    assert_eq!(output.status.code(), Some(exit_codes::ACTION_FAILED));
    assert!(!responses(&output)[0].success);
}

#[test]
fn status_exit_codes() {
    let temp = tempfile::tempdir().expect("tempdir");
    let status = redgreen(temp.path())
        .arg("status")
        .output()
        .expect("redgreen status");
    assert_eq!(status.status.code(), Some(exit_codes::NO_CYCLE));

    redgreen(temp.path())
        .args(["call", r#"{"action":"init","feature":"sum"}"#])
        .output()
        .expect("redgreen call");
    let status = redgreen(temp.path())
        .arg("status")
        .output()
        .expect("redgreen status");
    assert_eq!(status.status.code(), Some(exit_codes::OK));
    assert!(String::from_utf8_lossy(&status.stdout).contains("'sum' is READY"));
}

/// Bad lines produce failure responses; the loop keeps going until EOF.
#[test]
fn serve_answers_every_line() {
    let temp = tempfile::tempdir().expect("tempdir");
    let mut child = redgreen(temp.path())
        .arg("serve")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn serve");
    {
        let mut stdin = child.stdin.take().expect("stdin");
        writeln!(stdin, r#"{{"action":"init","feature":"sum"}}"#).expect("write");
        writeln!(stdin, "not json").expect("write");
        writeln!(stdin).expect("write");
        writeln!(
            stdin,
            r#"{{"action":"write_test","file_path":"test/sum.test.js","name":"adds","code":"test('adds', () => {{}});"}}"#
        )
        .expect("write");
        writeln!(stdin, r#"{{"action":"consult","question":"next?"}}"#).expect("write");
        writeln!(stdin, r#"{{"action":"status"}}"#).expect("write");
    }
    let output = child.wait_with_output().expect("wait serve");
    assert_eq!(output.status.code(), Some(exit_codes::OK));

    let responses = responses(&output);
    assert_eq!(responses.len(), 5);
    assert!(responses[0].success);
    assert!(!responses[1].success);
    assert_eq!(responses[1].data.as_ref().expect("data")["kind"], "validation");
    assert!(responses[2].success);
    assert!(!responses[3].success);
    assert_eq!(responses[3].data.as_ref().expect("data")["kind"], "service");
    assert!(responses[4].success);
    assert_eq!(
        responses[4].data.as_ref().expect("data")["active"]["phase"],
        "RED"
    );
    assert!(temp.path().join("test/sum.test.js").exists());
}
