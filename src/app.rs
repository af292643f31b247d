use clap::Parser;
use std::env;
use std::ffi::OsString;
use std::fs;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::circuit_breaker::CircuitBreaker;
use crate::cli::{Cli, CliCommand};
use crate::config::{load_config, Config, DEFAULT_CONFIG_NAME};
use crate::countdown::CountdownSleeper;
use crate::executor::ShellAgentRunner;
use crate::ledger::load_ledger;
use crate::logger::Logger;
use crate::rate_limit::RateLimiter;
use crate::run_loop::{quit, run_loop, validate_config, Quit, RuntimeState};
use crate::shell::{command_exists, command_program};
use crate::status::{read_status, StatusSnapshot, STATUS_FILE};

pub(crate) fn require_file(path: &Path, label: &str) -> Result<(), String> {
    if !path.is_file() {
        return Err(format!("Missing {}: {}", label, path.display()));
    }
    Ok(())
}

/// Reads the prompt and drops a leading `---` frontmatter block.
pub(crate) fn render_prompt(path: &Path) -> Result<String, String> {
    let content = fs::read_to_string(path)
        .map_err(|err| format!("Failed to read prompt {}: {}", path.display(), err))?;
    let mut out = String::new();
    let mut in_frontmatter = false;
    let mut first_line = true;

    for line in content.lines() {
        if first_line && line == "---" {
            in_frontmatter = true;
            first_line = false;
            continue;
        }
        first_line = false;
        if in_frontmatter && line == "---" {
            in_frontmatter = false;
            continue;
        }
        if !in_frontmatter {
            out.push_str(line);
            out.push('\n');
        }
    }
    if out.ends_with('\n') {
        out.pop();
    }
    Ok(out)
}

fn startup_error(message: String) -> Quit {
    eprintln!("{}", message);
    Quit {
        code: 1,
        reason: message,
    }
}

fn resolve_project_dir(project: Option<PathBuf>) -> Result<PathBuf, String> {
    let dir = match project {
        Some(dir) => dir,
        None => env::current_dir()
            .map_err(|err| format!("Failed to read current directory: {}", err))?,
    };
    if !dir.is_dir() {
        return Err(format!("Missing project directory: {}", dir.display()));
    }
    Ok(dir)
}

/// An explicit `--config` must exist; the per-project default is optional.
fn load_project_config(config_path: Option<&Path>, project_dir: &Path) -> Result<Config, String> {
    let path = match config_path {
        Some(path) => {
            if !path.is_file() {
                return Err(format!("Missing config file: {}", path.display()));
            }
            path.to_path_buf()
        }
        None => {
            let default_path = project_dir.join(DEFAULT_CONFIG_NAME);
            if !default_path.is_file() {
                return Ok(Config::default());
            }
            default_path
        }
    };
    load_config(&path).map(|loaded| loaded.config)
}

fn open_logger(config: &Config, project_dir: &Path) -> Logger {
    let log_path = config.resolve(project_dir, &config.log_path);
    if let Some(parent) = log_path.parent() {
        // The logger reports its own failure if this did not work.
        let _ = fs::create_dir_all(parent);
    }
    Logger::new(Some(log_path), true)
}

fn run_with_cli_impl(cli: Cli) -> Result<(), Quit> {
    let project_dir = resolve_project_dir(cli.project.clone()).map_err(startup_error)?;
    let mut config =
        load_project_config(cli.config.as_deref(), &project_dir).map_err(startup_error)?;
    cli.overrides.apply(&mut config);

    match cli.command {
        Some(CliCommand::Status) => {
            print!("{}", describe_status(&config, &project_dir));
            Ok(())
        }
        Some(CliCommand::ResetCircuit { reason }) => reset_circuit(&config, &project_dir, &reason),
        None | Some(CliCommand::Run) => run_project(config, &project_dir),
    }
}

fn run_project(config: Config, project_dir: &Path) -> Result<(), Quit> {
    validate_config(&config).map_err(startup_error)?;

    let prompt_path = config.resolve(project_dir, &config.prompt_file);
    let ledger_path = config.resolve(project_dir, &config.ledger_file);
    require_file(&prompt_path, "prompt file").map_err(startup_error)?;
    require_file(&ledger_path, "ledger file").map_err(startup_error)?;
    match command_program(&config.agent_command) {
        Some(program) if command_exists(program) => {}
        Some(program) => {
            return Err(startup_error(format!(
                "Agent command not found on PATH: {}",
                program
            )))
        }
        None => {
            return Err(startup_error(
                "agent_command does not name a program.".to_string(),
            ))
        }
    }

    let logger = open_logger(&config, project_dir);
    let prompt = render_prompt(&prompt_path).map_err(|message| {
        eprintln!("{}", message);
        quit(&logger, &message, 1)
    })?;

    let interrupt_flag = Arc::new(AtomicBool::new(false));
    if let Err(err) = ctrlc::set_handler({
        let interrupt_flag = Arc::clone(&interrupt_flag);
        move || {
            interrupt_flag.store(true, Ordering::SeqCst);
        }
    }) {
        eprintln!("Failed to set interrupt handler: {}", err);
    }

    let mut state = RuntimeState::new(
        config,
        project_dir,
        prompt,
        logger,
        Arc::clone(&interrupt_flag),
    );
    let mut runner = ShellAgentRunner::new(
        &state.config,
        &state.project_dir,
        &state.ledger_path,
        Arc::clone(&interrupt_flag),
    );
    let mut sleeper = CountdownSleeper::new(interrupt_flag, std::io::stderr().is_terminal());

    let stop = run_loop(&mut state, &mut runner, &mut sleeper)?;
    match stop.exit_code() {
        0 => Ok(()),
        code => Err(Quit {
            code,
            reason: stop.status().to_string(),
        }),
    }
}

fn reset_circuit(config: &Config, project_dir: &Path, reason: &str) -> Result<(), Quit> {
    let logger = open_logger(config, project_dir);
    let state_dir = config.resolve(project_dir, &config.state_dir);
    let breaker = CircuitBreaker::new(&state_dir, config.breaker.clone());
    breaker.reset(&logger, reason).map_err(|message| {
        eprintln!("{}", message);
        quit(&logger, &message, 1)
    })?;
    println!(
        "Circuit breaker reset to CLOSED ({}): {}",
        reason,
        breaker.path().display()
    );
    Ok(())
}

/// Human-readable report for `ledgerloop status`. Read-only.
pub(crate) fn describe_status(config: &Config, project_dir: &Path) -> String {
    let state_dir = config.resolve(project_dir, &config.state_dir);
    let status_path = state_dir.join(STATUS_FILE);
    let mut out = String::new();

    match read_status(&status_path) {
        Some(snapshot) => out.push_str(&describe_snapshot(&snapshot)),
        None => out.push_str(&format!("No status snapshot at {}\n", status_path.display())),
    }

    let ledger_path = config.resolve(project_dir, &config.ledger_file);
    match load_ledger(&ledger_path) {
        Ok(ledger) => {
            let summary = ledger.summary();
            out.push_str(&format!(
                "Ledger: {}/{} stories complete, next: {}",
                summary.complete,
                summary.total,
                summary.next_story.as_deref().unwrap_or("none")
            ));
            if let Some(branch) = &summary.branch_name {
                out.push_str(&format!(" (branch {})", branch));
            }
            out.push('\n');
        }
        Err(err) => out.push_str(&format!("Ledger: unavailable ({})\n", err)),
    }

    let breaker = CircuitBreaker::new(&state_dir, config.breaker.clone());
    let snapshot = breaker.snapshot(&Logger::silent());
    out.push_str(&format!(
        "Circuit breaker: {} (no progress: {}, same error: {}, opens: {})\n",
        snapshot.state,
        snapshot.consecutive_no_progress,
        snapshot.consecutive_same_error,
        snapshot.total_opens
    ));
    if !snapshot.reason.is_empty() {
        out.push_str(&format!("  reason: {}\n", snapshot.reason));
    }

    let limiter = RateLimiter::new(&state_dir, config.max_calls_per_hour);
    out.push_str(&format!(
        "Calls this hour: {}/{}\n",
        limiter.calls_this_hour(),
        limiter.max_calls()
    ));
    out
}

fn describe_snapshot(snapshot: &StatusSnapshot) -> String {
    let mut out = format!(
        "Status: {} (loop {}, updated {})\n",
        snapshot.status,
        snapshot.loop_count,
        snapshot.timestamp.format("%Y-%m-%d %H:%M:%S")
    );
    if let Some(action) = &snapshot.last_action {
        out.push_str(&format!("  last action: {}\n", action));
    }
    if let Some(next_reset) = &snapshot.next_reset {
        out.push_str(&format!(
            "  next reset: {}\n",
            next_reset.format("%Y-%m-%d %H:%M:%S")
        ));
    }
    out
}

pub(crate) fn run_with_cli(cli: Cli) -> Result<(), Quit> {
    run_with_cli_impl(cli)
}

pub(crate) fn run_with_args(args: Vec<OsString>) -> Result<(), Quit> {
    let cli = match Cli::try_parse_from(args) {
        Ok(cli) => cli,
        Err(err) => {
            // clap's `Error::print()` uses termcolor and can bypass Rust's test output
            // capturing. Rendering it ourselves keeps CLI errors capture-friendly.
            eprintln!("{err}");
            return Err(Quit {
                code: err.exit_code(),
                reason: "cli_parse".to_string(),
            });
        }
    };
    run_with_cli(cli)
}

pub(crate) fn main_with_args(args: Vec<OsString>) -> ExitCode {
    let result = run_with_args(args);
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(quit) => quit.exit_code(),
    }
}

pub(crate) fn main() -> ExitCode {
    main_with_args(env::args_os().collect())
}
