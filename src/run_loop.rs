use chrono::{DateTime, Local};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::circuit_breaker::{BreakerState, CircuitBreaker};
use crate::classifier::{count_changed_paths, persist_analysis, Analysis};
use crate::config::Config;
use crate::countdown::Sleeper;
use crate::executor::{AgentRunner, Execution, Executor, InvocationOutcome};
use crate::ledger::{load_ledger, LedgerSummary};
use crate::logger::{sanitize_log_value, Logger};
use crate::rate_limit::{RateLimiter, WaitError};
use crate::shell::git_status_snapshot;
use crate::status::{publish_status, StatusSnapshot, STATUS_FILE};

pub(crate) const ANALYSIS_FILE: &str = ".response_analysis";

#[derive(Debug)]
pub(crate) struct RuntimeState {
    pub(crate) config: Config,
    pub(crate) project_dir: PathBuf,
    pub(crate) ledger_path: PathBuf,
    pub(crate) status_path: PathBuf,
    pub(crate) analysis_path: PathBuf,
    pub(crate) prompt: String,
    pub(crate) logger: Logger,
    pub(crate) limiter: RateLimiter,
    pub(crate) breaker: CircuitBreaker,
    pub(crate) executor: Executor,
    pub(crate) interrupt_flag: Arc<AtomicBool>,
    pub(crate) loop_count: u64,
    pub(crate) ledger: Option<LedgerSummary>,
    warned_duplicates: bool,
}

impl RuntimeState {
    pub(crate) fn new(
        config: Config,
        project_dir: &Path,
        prompt: String,
        logger: Logger,
        interrupt_flag: Arc<AtomicBool>,
    ) -> Self {
        let state_dir = config.resolve(project_dir, &config.state_dir);
        let log_dir = config.resolve(project_dir, &config.log_dir);
        let ledger_path = config.resolve(project_dir, &config.ledger_file);
        Self {
            project_dir: project_dir.to_path_buf(),
            status_path: state_dir.join(STATUS_FILE),
            analysis_path: state_dir.join(ANALYSIS_FILE),
            limiter: RateLimiter::new(&state_dir, config.max_calls_per_hour),
            breaker: CircuitBreaker::new(&state_dir, config.breaker.clone()),
            executor: Executor::new(&config, &log_dir),
            ledger_path,
            config,
            prompt,
            logger,
            interrupt_flag,
            loop_count: 0,
            ledger: None,
            warned_duplicates: false,
        }
    }
}

#[derive(Debug)]
pub(crate) struct Quit {
    pub(crate) code: i32,
    #[allow(dead_code)]
    pub(crate) reason: String,
}

impl Quit {
    pub(crate) fn exit_code(&self) -> ExitCode {
        ExitCode::from(self.code as u8)
    }
}

pub(crate) fn quit(logger: &Logger, reason: &str, code: i32) -> Quit {
    let sanitized = if reason.trim().is_empty() {
        "unknown".to_string()
    } else {
        sanitize_log_value(reason)
    };
    logger.info(&format!("quit reason={} code={}", sanitized, code));
    Quit {
        code,
        reason: reason.to_string(),
    }
}

/// Why the loop stopped on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LoopStop {
    AllComplete,
    ProjectComplete,
    MaxIterationsReached,
    Halted,
}

impl LoopStop {
    pub(crate) fn status(self) -> &'static str {
        match self {
            Self::AllComplete => "all_complete",
            Self::ProjectComplete => "complete",
            Self::MaxIterationsReached => "max_iterations",
            Self::Halted => "halted",
        }
    }

    pub(crate) fn exit_code(self) -> i32 {
        match self {
            Self::Halted => 2,
            Self::AllComplete | Self::ProjectComplete | Self::MaxIterationsReached => 0,
        }
    }
}

pub(crate) fn validate_config(config: &Config) -> Result<(), String> {
    if config.agent_command.trim().is_empty() {
        return Err("agent_command must not be empty.".to_string());
    }
    if config.completion_token.trim().is_empty() {
        return Err("completion_token must not be empty.".to_string());
    }
    if config.max_calls_per_hour < 1 {
        return Err(format!(
            "max_calls_per_hour must be a positive integer (got {}).",
            config.max_calls_per_hour
        ));
    }
    if config.timeout_minutes < 1 {
        return Err(format!(
            "timeout_minutes must be a positive integer (got {}).",
            config.timeout_minutes
        ));
    }
    if config.output_limit_bytes == 0 {
        return Err("output_limit_bytes must be a positive integer (got 0).".to_string());
    }
    let breaker = &config.breaker;
    if breaker.no_progress_threshold < 1 || breaker.same_error_threshold < 1 {
        return Err("breaker thresholds must be positive integers.".to_string());
    }
    if breaker.half_open_threshold > breaker.no_progress_threshold {
        return Err(format!(
            "breaker.half_open_threshold ({}) must not exceed breaker.no_progress_threshold ({}).",
            breaker.half_open_threshold, breaker.no_progress_threshold
        ));
    }
    Ok(())
}

fn interrupted(state: &RuntimeState) -> Quit {
    publish(state, "interrupted", Some("interrupted by user".to_string()), None);
    quit(&state.logger, "interrupted", 130)
}

fn check_interrupted(state: &RuntimeState) -> Result<(), Quit> {
    if state.interrupt_flag.load(Ordering::SeqCst) {
        return Err(interrupted(state));
    }
    Ok(())
}

fn pause(
    state: &RuntimeState,
    sleeper: &mut dyn Sleeper,
    duration: Duration,
    label: &str,
) -> Result<(), Quit> {
    sleeper
        .sleep(duration, label)
        .map_err(|_| interrupted(state))
}

/// Status snapshots are advisory; a failed write is logged and skipped.
fn publish(
    state: &RuntimeState,
    status: &str,
    last_action: Option<String>,
    next_reset: Option<DateTime<Local>>,
) {
    let (complete, total, current) = match &state.ledger {
        Some(summary) => (summary.complete, summary.total, summary.next_story.clone()),
        None => (0, 0, None),
    };
    let snapshot = StatusSnapshot {
        timestamp: Local::now(),
        status: status.to_string(),
        loop_count: state.loop_count,
        current_story: current,
        stories_complete: complete,
        stories_total: total,
        calls_this_hour: state.limiter.calls_this_hour(),
        max_calls_per_hour: state.limiter.max_calls(),
        last_action,
        next_reset,
    };
    if let Err(err) = publish_status(&state.status_path, &snapshot) {
        state.logger.warn(&format!(
            "status publish failed err={}",
            sanitize_log_value(&err)
        ));
    }
}

/// Rereads the ledger. A read failure keeps the previous summary.
fn refresh_ledger(state: &mut RuntimeState) {
    match load_ledger(&state.ledger_path) {
        Ok(ledger) => {
            let duplicates = ledger.duplicate_ids();
            if !duplicates.is_empty() && !state.warned_duplicates {
                state.logger.warn(&format!(
                    "ledger has duplicate story ids: {}",
                    duplicates.join(",")
                ));
                state.warned_duplicates = true;
            }
            state.ledger = Some(ledger.summary());
        }
        Err(err) => {
            state
                .logger
                .warn(&format!("ledger unreadable err={}", sanitize_log_value(&err)));
        }
    }
}

fn later(wait: Duration) -> Option<DateTime<Local>> {
    chrono::Duration::from_std(wait)
        .ok()
        .and_then(|delta| Local::now().checked_add_signed(delta))
}

fn record_breaker(
    state: &RuntimeState,
    loop_number: u64,
    files_modified: u32,
    has_error: bool,
    output_size: u64,
    error_message: &str,
) -> Result<BreakerState, Quit> {
    state
        .breaker
        .record_outcome(
            &state.logger,
            loop_number,
            files_modified,
            has_error,
            output_size,
            error_message,
        )
        .map_err(|err| quit(&state.logger, &format!("breaker_state_failed:{err}"), 1))
}

pub(crate) fn run_loop(
    state: &mut RuntimeState,
    runner: &mut dyn AgentRunner,
    sleeper: &mut dyn Sleeper,
) -> Result<LoopStop, Quit> {
    state.logger.info(&format!(
        "start project={} ledger={} max_calls_per_hour={} max_iterations={}",
        state.project_dir.display(),
        state.ledger_path.display(),
        state.config.max_calls_per_hour,
        state.config.max_iterations
    ));

    let rolled = state
        .limiter
        .roll_bucket()
        .map_err(|err| quit(&state.logger, &format!("rate_limit_state_failed:{err}"), 1))?;
    if rolled {
        state
            .logger
            .info("call budget bucket advanced to the current hour");
    }

    loop {
        check_interrupted(state)?;
        let loop_number = state.loop_count + 1;

        if let Some(max) = state.config.max_iterations() {
            if loop_number > max {
                return Ok(stop(state, LoopStop::MaxIterationsReached));
            }
        }

        if state.breaker.should_halt(&state.logger) {
            let snapshot = state.breaker.snapshot(&state.logger);
            state.logger.error(&format!(
                "circuit breaker open reason={}; run `ledgerloop reset-circuit` to continue",
                sanitize_log_value(&snapshot.reason)
            ));
            return Ok(stop(state, LoopStop::Halted));
        }

        refresh_ledger(state);
        if state.ledger.as_ref().is_some_and(|summary| summary.incomplete() == 0) {
            return Ok(stop(state, LoopStop::AllComplete));
        }

        let allowed = state
            .limiter
            .can_call()
            .map_err(|err| quit(&state.logger, &format!("rate_limit_state_failed:{err}"), 1))?;
        if !allowed {
            state.logger.warn(&format!(
                "hourly call budget exhausted calls={}/{}",
                state.limiter.calls_this_hour(),
                state.limiter.max_calls()
            ));
            let next_reset = later(crate::rate_limit::until_next_hour(Local::now()));
            publish(state, "rate_limited", None, next_reset);
            match state.limiter.wait_until_next_hour(sleeper) {
                Ok(()) => continue,
                Err(WaitError::Interrupted) => return Err(interrupted(state)),
                Err(WaitError::State(err)) => {
                    return Err(quit(
                        &state.logger,
                        &format!("rate_limit_state_failed:{err}"),
                        1,
                    ))
                }
            }
        }

        state.loop_count = loop_number;
        let calls = state
            .limiter
            .record_call()
            .map_err(|err| quit(&state.logger, &format!("rate_limit_state_failed:{err}"), 1))?;
        let story = state
            .ledger
            .as_ref()
            .and_then(|summary| summary.next_story.clone())
            .unwrap_or_else(|| "unknown".to_string());
        state.logger.loop_event(&format!(
            "loop={} story={} calls={}/{}",
            loop_number,
            story,
            calls,
            state.limiter.max_calls()
        ));
        publish(state, "running", Some(format!("invoking agent for {}", story)), None);

        let before = git_snapshot(state);
        let execution = state
            .executor
            .execute(
                runner,
                sleeper,
                &state.logger,
                &state.prompt,
                state.config.invocation_timeout(),
                loop_number,
            )
            .map_err(|_| interrupted(state))?;
        let tree_delta = match (before, git_snapshot(state)) {
            (Some(before), Some(after)) => count_changed_paths(&before, &after),
            _ => 0,
        };
        state.logger.info(&format!(
            "loop={} outcome={} attempts={} output_bytes={}",
            loop_number,
            execution.outcome.kind(),
            execution.attempts,
            execution.output_size
        ));

        if let Some(done) = handle_outcome(state, sleeper, loop_number, execution, tree_delta)? {
            return Ok(done);
        }
    }
}

fn git_snapshot(state: &RuntimeState) -> Option<std::collections::BTreeMap<String, String>> {
    if !state.config.detect_git_changes {
        return None;
    }
    git_status_snapshot(&state.project_dir)
}

fn handle_outcome(
    state: &mut RuntimeState,
    sleeper: &mut dyn Sleeper,
    loop_number: u64,
    execution: Execution,
    tree_delta: u32,
) -> Result<Option<LoopStop>, Quit> {
    let delays = state.config.delays.clone();
    match execution.outcome {
        InvocationOutcome::Success { analysis } => {
            let analysis = Analysis {
                files_modified: analysis.files_modified.max(tree_delta),
                ..analysis
            };
            if let Err(err) = persist_analysis(
                &state.analysis_path,
                loop_number,
                &analysis,
                execution.output_size,
            ) {
                state.logger.warn(&format!(
                    "analysis snapshot failed err={}",
                    sanitize_log_value(&err)
                ));
            }
            let breaker_state = record_breaker(
                state,
                loop_number,
                analysis.files_modified,
                analysis.has_errors,
                execution.output_size,
                &analysis.error_message,
            )?;
            if analysis.exit_signal {
                state
                    .logger
                    .info(&format!("loop={} agent signalled exit", loop_number));
            }
            state.logger.success(&format!(
                "loop={} files_modified={} breaker={}",
                loop_number, analysis.files_modified, breaker_state
            ));
            refresh_ledger(state);
            publish(
                state,
                "success",
                Some(format!(
                    "files_modified={} breaker={}",
                    analysis.files_modified, breaker_state
                )),
                None,
            );
            pause(state, sleeper, delays.success_pause(), "Next iteration in")?;
        }
        InvocationOutcome::ProjectComplete => {
            state
                .logger
                .success(&format!("loop={} agent reported completion", loop_number));
            refresh_ledger(state);
            publish(state, "complete", Some("completion token received".to_string()), None);
            return Ok(Some(LoopStop::ProjectComplete));
        }
        InvocationOutcome::UsageLimitReached { reset_hint } => {
            let wait = match &reset_hint {
                Some(hint) => {
                    state.logger.warn(&format!(
                        "usage limit reached; resets at {:02}:00 timezone={}",
                        hint.hour,
                        hint.timezone.as_deref().unwrap_or("local")
                    ));
                    hint.wait
                }
                None => {
                    state
                        .logger
                        .warn("usage limit reached; no reset time found, waiting one hour");
                    delays.usage_limit_fallback()
                }
            };
            publish(
                state,
                "usage_limited",
                Some("usage limit reached".to_string()),
                later(wait),
            );
            pause(state, sleeper, wait, "Usage limit; waiting for reset")?;
        }
        InvocationOutcome::ApiLimitReached => {
            let wait = delays.api_limit_cooldown();
            state.logger.warn("provider rate limit reached");
            publish(
                state,
                "api_limited",
                Some("provider rate limit reached".to_string()),
                later(wait),
            );
            pause(state, sleeper, wait, "Provider rate limit; cooling down")?;
        }
        InvocationOutcome::TimeoutExhausted => {
            let message = format!("agent timed out after {} attempts", execution.attempts);
            state
                .logger
                .error(&format!("loop={} {}", loop_number, message));
            let breaker_state = record_breaker(
                state,
                loop_number,
                tree_delta,
                true,
                execution.output_size,
                &message,
            )?;
            publish(
                state,
                "timeout",
                Some(format!("{} breaker={}", message, breaker_state)),
                None,
            );
            pause(state, sleeper, delays.timeout_cooldown(), "Timed out; cooling down")?;
        }
        InvocationOutcome::GenericError { exit_code, message } => {
            state.logger.error(&format!(
                "loop={} agent failed exit={} message={}",
                loop_number,
                exit_code,
                sanitize_log_value(&message)
            ));
            let breaker_state = record_breaker(
                state,
                loop_number,
                tree_delta,
                true,
                execution.output_size,
                &message,
            )?;
            publish(
                state,
                "error",
                Some(format!("exit {} breaker={}", exit_code, breaker_state)),
                None,
            );
            pause(state, sleeper, delays.error_cooldown(), "Agent failed; cooling down")?;
        }
    }
    Ok(None)
}

fn stop(state: &RuntimeState, reason: LoopStop) -> LoopStop {
    let message = match reason {
        LoopStop::AllComplete => "all stories complete".to_string(),
        LoopStop::ProjectComplete => "completion token received".to_string(),
        LoopStop::MaxIterationsReached => {
            format!("reached max_iterations={}", state.config.max_iterations)
        }
        LoopStop::Halted => "circuit breaker open".to_string(),
    };
    if reason == LoopStop::Halted {
        state.logger.error(&message);
    } else {
        state.logger.success(&message);
    }
    publish(state, reason.status(), Some(message), None);
    reason
}
