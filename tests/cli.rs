use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

use tempfile::TempDir;

const FAST_CONFIG: &str = "\
detect_git_changes: false
delays:
  success_pause_secs: 0
  error_cooldown_secs: 0
";

fn write_project(dir: &Path, stories_passing: &[bool]) {
    fs::write(
        dir.join("PROMPT.md"),
        "---\ntitle: loop prompt\n---\nImplement the next story in prd.json.\n",
    )
    .expect("write prompt");
    let stories: Vec<String> = stories_passing
        .iter()
        .enumerate()
        .map(|(index, passes)| {
            format!(
                r#"{{"id": "S-{}", "story": "story", "priority": {}, "passes": {}}}"#,
                index + 1,
                index + 1,
                passes
            )
        })
        .collect();
    fs::write(
        dir.join("prd.json"),
        format!(r#"{{"userStories": [{}]}}"#, stories.join(",")),
    )
    .expect("write ledger");
    fs::write(dir.join(".ledgerloop.yml"), FAST_CONFIG).expect("write config");
}

#[cfg(unix)]
fn write_agent(dir: &Path, body: &str) -> PathBuf {
    let path = dir.join("fake-agent");
    fs::write(&path, format!("#!/bin/sh\n{}", body)).expect("write agent");
    let mut perms = fs::metadata(&path).expect("agent metadata").permissions();
    perms.set_mode(0o755);
    fs::set_permissions(&path, perms).expect("chmod agent");
    path
}

fn run_ledgerloop(project: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_ledgerloop"))
        .arg("-p")
        .arg(project)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .expect("run ledgerloop")
}

fn status_json(project: &Path) -> serde_json::Value {
    let raw = fs::read_to_string(project.join(".ledgerloop").join("status.json"))
        .expect("read status.json");
    serde_json::from_str(&raw).expect("parse status.json")
}

#[cfg(unix)]
#[test]
fn completion_token_ends_the_run_successfully() {
    let temp = TempDir::new().expect("temp dir");
    let project = temp.path();
    write_project(project, &[true, false]);
    let seen = project.join("agent.seen");
    let agent = write_agent(
        project,
        &format!(
            "cat > '{seen}.prompt'\nenv | grep '^LEDGERLOOP_' | sort > '{seen}.env'\necho 'Modified: src/lib.rs'\necho '<promise>COMPLETE</promise>'\n",
            seen = seen.display()
        ),
    );

    let output = run_ledgerloop(project, &["run", "--agent-command", &agent.display().to_string()]);

    assert_eq!(
        output.status.code(),
        Some(0),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let prompt = fs::read_to_string(format!("{}.prompt", seen.display())).expect("prompt seen");
    assert_eq!(prompt.trim_end(), "Implement the next story in prd.json.");
    let env = fs::read_to_string(format!("{}.env", seen.display())).expect("env seen");
    assert!(env.contains("LEDGERLOOP_LOOP=1"), "env: {env}");
    assert!(env.contains("LEDGERLOOP_ATTEMPT=1"), "env: {env}");
    assert!(
        env.contains("LEDGERLOOP_COMPLETION_TOKEN=<promise>COMPLETE</promise>"),
        "env: {env}"
    );

    let status = status_json(project);
    assert_eq!(status["status"], "complete");
    assert_eq!(status["loop_count"], 1);
    assert_eq!(status["stories_complete"], 1);
    assert_eq!(status["stories_total"], 2);

    let logs: Vec<String> = fs::read_dir(project.join(".ledgerloop").join("logs"))
        .expect("log dir")
        .filter_map(Result::ok)
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(logs.len(), 1, "logs: {logs:?}");
    assert!(logs[0].starts_with("agent_output_") && logs[0].ends_with("_loop1_attempt1.log"));

    let run_log = fs::read_to_string(project.join(".ledgerloop").join("ledgerloop.log"))
        .expect("run log");
    assert!(run_log.contains("[LOOP] loop=1 story=S-2"), "log: {run_log}");
}

#[cfg(unix)]
#[test]
fn finished_ledger_exits_without_calling_the_agent() {
    let temp = TempDir::new().expect("temp dir");
    let project = temp.path();
    write_project(project, &[true, true]);
    let marker = project.join("called");
    let agent = write_agent(project, &format!("touch '{}'\n", marker.display()));

    let output = run_ledgerloop(project, &["--agent-command", &agent.display().to_string()]);

    assert_eq!(output.status.code(), Some(0));
    assert!(!marker.exists(), "agent must not run when every story passes");
    assert_eq!(status_json(project)["status"], "all_complete");
}

#[cfg(unix)]
#[test]
fn max_iterations_stops_a_run_that_never_completes() {
    let temp = TempDir::new().expect("temp dir");
    let project = temp.path();
    write_project(project, &[false]);
    let agent = write_agent(project, "cat > /dev/null\necho 'Modified: a.rs'\n");

    let output = run_ledgerloop(
        project,
        &[
            "--agent-command",
            &agent.display().to_string(),
            "--max-iterations",
            "2",
        ],
    );

    assert_eq!(output.status.code(), Some(0));
    let status = status_json(project);
    assert_eq!(status["status"], "max_iterations");
    assert_eq!(status["loop_count"], 2);
    assert_eq!(status["calls_this_hour"], 2);
}

#[cfg(unix)]
#[test]
fn persistent_failures_halt_with_exit_code_2_until_reset() {
    let temp = TempDir::new().expect("temp dir");
    let project = temp.path();
    write_project(project, &[false]);
    let agent = write_agent(project, "cat > /dev/null\necho 'Error: tests failed'\nexit 1\n");
    let agent = agent.display().to_string();

    let output = run_ledgerloop(project, &["--agent-command", &agent]);
    assert_eq!(
        output.status.code(),
        Some(2),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    assert_eq!(status_json(project)["status"], "halted");

    let status = run_ledgerloop(project, &["status"]);
    assert_eq!(status.status.code(), Some(0));
    let report = String::from_utf8_lossy(&status.stdout);
    assert!(report.contains("Status: halted"), "report: {report}");
    assert!(report.contains("Circuit breaker: OPEN"), "report: {report}");
    assert!(report.contains("Calls this hour: 3/100"), "report: {report}");

    let reset = run_ledgerloop(project, &["reset-circuit", "--reason", "fixed"]);
    assert_eq!(reset.status.code(), Some(0));
    assert!(String::from_utf8_lossy(&reset.stdout).contains("reset to CLOSED"));

    let status = run_ledgerloop(project, &["status"]);
    let report = String::from_utf8_lossy(&status.stdout);
    assert!(report.contains("Circuit breaker: CLOSED"), "report: {report}");
    assert!(report.contains("opens: 1"), "report: {report}");
}

#[test]
fn missing_agent_binary_fails_at_startup() {
    let temp = TempDir::new().expect("temp dir");
    let project = temp.path();
    write_project(project, &[false]);

    let output = run_ledgerloop(
        project,
        &["--agent-command", "no-such-agent-binary-for-ledgerloop -p"],
    );

    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Agent command not found on PATH"), "stderr: {stderr}");
    assert!(!project.join(".ledgerloop").join("status.json").exists());
}
