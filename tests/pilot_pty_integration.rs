use serde_json::Value;
use std::process::Stdio;
use std::time::Duration;
use tempfile::tempdir;
use tokio::process::Command;
use tokio::time::timeout;

/// Run the binary against `/bin/sh -c <script>` and collect the JSON events
/// it prints on stderr.
async fn run_with_script(extra_args: &[&str], script: &str) -> Vec<Value> {
    let dir = tempdir().unwrap();

    let mut command = Command::new(env!("CARGO_BIN_EXE_pilot-pty"));
    command
        .arg("--binary")
        .arg("/bin/sh")
        .arg("--cwd")
        .arg(dir.path())
        .arg("--json-output")
        .arg("--log-level")
        .arg("error")
        .arg("--rows")
        .arg("24")
        .arg("--cols")
        .arg("80")
        .args(extra_args)
        .arg("--")
        .arg("-c")
        .arg(script)
        .env_remove("ANTHROPIC_API_KEY")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped());

    let output = timeout(Duration::from_secs(15), command.output())
        .await
        .expect("pilot-pty did not exit")
        .unwrap();

    String::from_utf8_lossy(&output.stderr)
        .lines()
        .filter_map(|line| serde_json::from_str::<Value>(line).ok())
        .collect()
}

fn of_type<'a>(events: &'a [Value], kind: &str) -> Vec<&'a Value> {
    events.iter().filter(|e| e["type"] == kind).collect()
}

#[tokio::test]
async fn test_prompt_without_credentials_is_left_to_human() {
    let events = run_with_script(&[], "printf 'Allow Read(file.txt)? (y/n) '; sleep 1").await;

    let prompts = of_type(&events, "prompt_detected");
    assert_eq!(prompts.len(), 1, "events: {:?}", events);
    assert_eq!(
        prompts[0]["context"]["promptText"],
        "Allow Read(file.txt)? (y/n)"
    );

    let responses = of_type(&events, "auto_response");
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0]["response"]["success"], false);
    assert_eq!(responses[0]["response"]["error"]["kind"], "no-credentials");

    let exits = of_type(&events, "session_exited");
    assert_eq!(exits.len(), 1);
    assert_eq!(exits[0]["code"], 0);
}

#[tokio::test]
async fn test_disabled_never_detects() {
    let events = run_with_script(
        &["--disabled"],
        "printf 'Do you want to proceed? (y/n) '; sleep 1",
    )
    .await;

    assert!(of_type(&events, "prompt_detected").is_empty());
    assert!(of_type(&events, "auto_response").is_empty());
    assert_eq!(of_type(&events, "session_exited").len(), 1);
}

#[tokio::test]
async fn test_output_becomes_completed_message() {
    let events = run_with_script(&["--idle-timeout", "500"], "echo hello; sleep 1").await;

    let completed = of_type(&events, "message_completed");
    assert!(!completed.is_empty(), "events: {:?}", events);
    let message = &completed[0]["message"];
    assert_eq!(message["role"], "assistant");
    assert_eq!(message["status"], "complete");
    assert_eq!(message["content"][0]["text"], "hello");
}

#[tokio::test]
async fn test_missing_binary_reports_error() {
    let dir = tempdir().unwrap();
    let output = timeout(
        Duration::from_secs(15),
        Command::new(env!("CARGO_BIN_EXE_pilot-pty"))
            .arg("--binary")
            .arg(dir.path().join("no-such-agent"))
            .arg("--json-output")
            .arg("--log-level")
            .arg("error")
            .env_remove("ANTHROPIC_API_KEY")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output(),
    )
    .await
    .expect("pilot-pty did not exit")
    .unwrap();

    let events: Vec<Value> = String::from_utf8_lossy(&output.stderr)
        .lines()
        .filter_map(|line| serde_json::from_str::<Value>(line).ok())
        .collect();
    assert!(events
        .iter()
        .any(|e| e["type"] == "ui_state_changed" && e["ui"]["status"] == "error"));
    assert!(!output.status.success());
    assert_eq!(output.status.code(), Some(127));
}
