use shell_escape::unix::escape;
use std::collections::BTreeMap;
use std::env;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use wait_timeout::ChildExt;

use crate::logger::{sanitize_log_value, Logger};

/// Exit code reported when the agent is killed for exceeding its timeout,
/// matching coreutils `timeout`.
pub(crate) const TIMEOUT_EXIT_CODE: i32 = 124;

const PIPE_GRACE: Duration = Duration::from_secs(5);

pub(crate) fn render_command(command: &str) -> String {
    format!("bash -lc {}", escape(command.into()))
}

/// Context exported to the agent command as `LEDGERLOOP_*` variables.
#[derive(Debug, Clone)]
pub(crate) struct CommandEnv {
    pub(crate) cwd: PathBuf,
    pub(crate) loop_number: u64,
    pub(crate) attempt: u32,
    pub(crate) ledger_path: PathBuf,
    pub(crate) completion_token: String,
}

impl CommandEnv {
    pub(crate) fn apply(&self, cmd: &mut Command) {
        cmd.current_dir(&self.cwd);
        cmd.env("LEDGERLOOP_PROJECT_DIR", &self.cwd);
        cmd.env("LEDGERLOOP_LOOP", self.loop_number.to_string());
        cmd.env("LEDGERLOOP_ATTEMPT", self.attempt.to_string());
        cmd.env("LEDGERLOOP_LEDGER", &self.ledger_path);
        cmd.env("LEDGERLOOP_COMPLETION_TOKEN", &self.completion_token);
    }
}

#[derive(Debug)]
pub(crate) struct ProcessOutput {
    /// Interleaved stdout and stderr.
    pub(crate) output: String,
    pub(crate) exit_code: i32,
    #[allow(dead_code)]
    pub(crate) timed_out: bool,
    pub(crate) interrupted: bool,
    pub(crate) truncated: usize,
}

/// Runs `command` under `bash -lc`, feeding `stdin` and capturing combined
/// output. The whole process group is killed once `timeout` elapses or the
/// interrupt flag is raised.
pub(crate) fn run_shell_command_with_timeout(
    command: &str,
    stdin: &str,
    timeout: Duration,
    output_limit_bytes: usize,
    env: &CommandEnv,
    interrupt_flag: &AtomicBool,
    logger: &Logger,
) -> Result<ProcessOutput, String> {
    logger.info(&format!(
        "cmd start loop={} attempt={} timeout_secs={} command={}",
        env.loop_number,
        env.attempt,
        timeout.as_secs(),
        sanitize_log_value(&render_command(command))
    ));

    let mut cmd = Command::new("bash");
    cmd.arg("-lc").arg(command);
    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    env.apply(&mut cmd);
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    let mut child = cmd
        .spawn()
        .map_err(|err| format!("Failed to run command '{}': {}", command, err))?;

    let writer = child.stdin.take().map(|mut pipe| {
        let input = stdin.as_bytes().to_vec();
        // The agent may exit without draining stdin; a broken pipe is not our failure.
        thread::spawn(move || {
            let _ = pipe.write_all(&input);
        })
    });

    let collected = Arc::new(Mutex::new(Collected::new(output_limit_bytes)));
    let mut readers = Vec::new();
    if let Some(stdout) = child.stdout.take() {
        let collected = Arc::clone(&collected);
        readers.push(thread::spawn(move || drain(stdout, &collected)));
    }
    if let Some(stderr) = child.stderr.take() {
        let collected = Arc::clone(&collected);
        readers.push(thread::spawn(move || drain(stderr, &collected)));
    }

    let deadline = Instant::now() + timeout;
    let mut timed_out = false;
    let mut interrupted = false;
    let status = loop {
        let now = Instant::now();
        let slice = deadline
            .saturating_duration_since(now)
            .min(Duration::from_secs(1));
        if let Some(status) = child
            .wait_timeout(slice)
            .map_err(|err| format!("Failed to wait for command '{}': {}", command, err))?
        {
            // Background helpers left in the group would keep our pipes open.
            kill_process_group(&mut child);
            break status;
        }
        if interrupt_flag.load(Ordering::SeqCst) {
            interrupted = true;
            logger.warn(&format!(
                "cmd interrupted loop={} attempt={}",
                env.loop_number, env.attempt
            ));
        } else if Instant::now() >= deadline {
            timed_out = true;
            logger.warn(&format!(
                "cmd timeout loop={} attempt={} timeout_secs={}",
                env.loop_number,
                env.attempt,
                timeout.as_secs()
            ));
        } else {
            continue;
        }
        kill_process_group(&mut child);
        break child
            .wait()
            .map_err(|err| format!("Failed to reap command '{}': {}", command, err))?;
    };

    // A helper that left the group can still hold a pipe; stop waiting for it
    // after a short grace period and keep whatever was collected.
    let mut pending = readers;
    pending.extend(writer);
    let grace = Instant::now() + PIPE_GRACE;
    while pending.iter().any(|handle| !handle.is_finished())
        && Instant::now() < grace
        && !interrupt_flag.load(Ordering::SeqCst)
    {
        thread::sleep(Duration::from_millis(20));
    }
    for handle in pending {
        if handle.is_finished() {
            let _ = handle.join();
        }
    }

    let collected = match Arc::try_unwrap(collected) {
        Ok(mutex) => mutex.into_inner().unwrap_or_else(|poisoned| poisoned.into_inner()),
        Err(shared) => {
            let guard = shared
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            guard.clone()
        }
    };

    let exit_code = if timed_out {
        TIMEOUT_EXIT_CODE
    } else {
        status.code().unwrap_or(1)
    };
    logger.info(&format!(
        "cmd exit loop={} attempt={} exit={} output_bytes={} truncated_bytes={}",
        env.loop_number,
        env.attempt,
        exit_code,
        collected.buf.len(),
        collected.truncated
    ));

    Ok(ProcessOutput {
        output: String::from_utf8_lossy(&collected.buf).into_owned(),
        exit_code,
        timed_out,
        interrupted,
        truncated: collected.truncated,
    })
}

#[derive(Debug, Clone)]
struct Collected {
    buf: Vec<u8>,
    truncated: usize,
    limit: usize,
}

impl Collected {
    fn new(limit: usize) -> Self {
        Self {
            buf: Vec::new(),
            truncated: 0,
            limit,
        }
    }

    fn push(&mut self, chunk: &[u8]) {
        let remaining = self.limit.saturating_sub(self.buf.len());
        let keep = chunk.len().min(remaining);
        self.buf.extend_from_slice(&chunk[..keep]);
        self.truncated += chunk.len() - keep;
    }
}

fn drain<R: Read>(mut reader: R, collected: &Mutex<Collected>) {
    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk) {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let mut guard = collected
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                guard.push(&chunk[..n]);
            }
        }
    }
}

fn kill_process_group(child: &mut Child) {
    // Agents commonly fork helpers that inherit our pipes; killing only the
    // shell would leave the readers blocked on them.
    #[cfg(unix)]
    {
        let _ = Command::new("kill")
            .arg("-KILL")
            .arg("--")
            .arg(format!("-{}", child.id()))
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
    }
    let _ = child.kill();
}

pub(crate) fn command_exists(name: &str) -> bool {
    if name.contains('/') {
        return Path::new(name).is_file();
    }
    let Some(paths) = env::var_os("PATH") else {
        return false;
    };
    env::split_paths(&paths).any(|path| {
        let full = path.join(name);
        full.is_file() || full.is_symlink()
    })
}

/// First word of a shell command line, skipping leading `VAR=value` assignments.
pub(crate) fn command_program(command: &str) -> Option<&str> {
    command
        .split_whitespace()
        .find(|word| !(word.contains('=') && !word.starts_with('=')))
}

/// `git status --porcelain` keyed by path, or `None` outside a git work tree.
pub(crate) fn git_status_snapshot(dir: &Path) -> Option<BTreeMap<String, String>> {
    let output = Command::new("git")
        .arg("status")
        .arg("--porcelain")
        .arg("--untracked-files=all")
        .current_dir(dir)
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    Some(
        stdout
            .lines()
            .filter(|line| line.len() > 3)
            .map(|line| (line[3..].to_string(), line[..2].to_string()))
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn env_for(dir: &Path) -> CommandEnv {
        CommandEnv {
            cwd: dir.to_path_buf(),
            loop_number: 3,
            attempt: 1,
            ledger_path: dir.join("prd.json"),
            completion_token: "DONE".to_string(),
        }
    }

    #[test]
    fn captures_stdin_stdout_stderr_and_exit_code() {
        let temp = TempDir::new().expect("temp dir");
        let output = run_shell_command_with_timeout(
            "read line; echo \"got:$line loop:$LEDGERLOOP_LOOP\"; echo oops >&2; exit 7",
            "hello\n",
            Duration::from_secs(30),
            1024,
            &env_for(temp.path()),
            &AtomicBool::new(false),
            &Logger::silent(),
        )
        .expect("run");
        assert_eq!(output.exit_code, 7);
        assert!(!output.timed_out);
        assert!(output.output.contains("got:hello loop:3"), "{}", output.output);
        assert!(output.output.contains("oops"), "{}", output.output);
    }

    #[test]
    fn timeout_kills_the_process_group_and_reports_124() {
        let temp = TempDir::new().expect("temp dir");
        let started = Instant::now();
        let output = run_shell_command_with_timeout(
            "echo started; sleep 30 & wait",
            "",
            Duration::from_millis(300),
            1024,
            &env_for(temp.path()),
            &AtomicBool::new(false),
            &Logger::silent(),
        )
        .expect("run");
        assert!(output.timed_out);
        assert_eq!(output.exit_code, TIMEOUT_EXIT_CODE);
        assert!(output.output.contains("started"));
        assert!(started.elapsed() < Duration::from_secs(20));
    }

    #[test]
    fn background_helpers_do_not_outlive_a_normal_exit() {
        let temp = TempDir::new().expect("temp dir");
        let started = Instant::now();
        let output = run_shell_command_with_timeout(
            "echo hi; sleep 15 &",
            "",
            Duration::from_secs(2),
            1024,
            &env_for(temp.path()),
            &AtomicBool::new(false),
            &Logger::silent(),
        )
        .expect("run");
        assert_eq!(output.exit_code, 0);
        assert!(!output.timed_out);
        assert!(output.output.contains("hi"), "{}", output.output);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn helpers_that_leave_the_group_only_delay_by_the_grace_period() {
        if !command_exists("setsid") {
            return;
        }
        let temp = TempDir::new().expect("temp dir");
        let started = Instant::now();
        let output = run_shell_command_with_timeout(
            "echo hi; setsid sleep 30 &",
            "",
            Duration::from_secs(2),
            1024,
            &env_for(temp.path()),
            &AtomicBool::new(false),
            &Logger::silent(),
        )
        .expect("run");
        assert_eq!(output.exit_code, 0);
        assert!(output.output.contains("hi"), "{}", output.output);
        assert!(started.elapsed() < PIPE_GRACE + Duration::from_secs(10));
    }

    #[test]
    fn raised_interrupt_flag_stops_the_command() {
        let temp = TempDir::new().expect("temp dir");
        let started = Instant::now();
        let output = run_shell_command_with_timeout(
            "sleep 30",
            "",
            Duration::from_secs(60),
            1024,
            &env_for(temp.path()),
            &AtomicBool::new(true),
            &Logger::silent(),
        )
        .expect("run");
        assert!(output.interrupted);
        assert!(!output.timed_out);
        assert!(started.elapsed() < Duration::from_secs(20));
    }

    #[test]
    fn output_beyond_limit_is_counted_not_kept() {
        let temp = TempDir::new().expect("temp dir");
        let output = run_shell_command_with_timeout(
            "printf '0123456789'",
            "",
            Duration::from_secs(30),
            4,
            &env_for(temp.path()),
            &AtomicBool::new(false),
            &Logger::silent(),
        )
        .expect("run");
        assert_eq!(output.output, "0123");
        assert_eq!(output.truncated, 6);
    }

    #[test]
    fn render_command_quotes_for_logs() {
        assert_eq!(render_command("claude -p"), "bash -lc 'claude -p'");
    }

    #[test]
    fn command_program_skips_env_assignments() {
        assert_eq!(command_program("FOO=1 BAR=2 claude -p"), Some("claude"));
        assert_eq!(command_program("  codex exec"), Some("codex"));
        assert_eq!(command_program(""), None);
    }

    #[test]
    fn command_exists_handles_paths_and_missing_names() {
        assert!(command_exists("sh"));
        assert!(!command_exists("definitely-not-a-real-binary-ledgerloop"));
        assert!(command_exists("/bin/sh"));
        assert!(!command_exists("/nonexistent/tool"));
    }

    #[test]
    fn git_snapshot_is_none_outside_a_repository() {
        let temp = TempDir::new().expect("temp dir");
        // TempDir may sit inside a checkout on some machines; only assert the
        // non-repo case when git itself agrees.
        let inside = Command::new("git")
            .args(["rev-parse", "--is-inside-work-tree"])
            .current_dir(temp.path())
            .output()
            .map(|out| out.status.success())
            .unwrap_or(false);
        if !inside {
            assert_eq!(git_status_snapshot(temp.path()), None);
        }
    }
}
