use chrono::Local;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use crate::classifier::{analyze, Analysis};
use crate::config::Config;
use crate::countdown::{Interrupted, Sleeper};
use crate::logger::{sanitize_log_value, Logger};
use crate::reset_time::{parse_reset_hint, ResetHint};
use crate::shell::{run_shell_command_with_timeout, CommandEnv, TIMEOUT_EXIT_CODE};

/// Terminal result of one attempt sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum InvocationOutcome {
    Success { analysis: Analysis },
    ProjectComplete,
    ApiLimitReached,
    TimeoutExhausted,
    UsageLimitReached { reset_hint: Option<ResetHint> },
    GenericError { exit_code: i32, message: String },
}

impl InvocationOutcome {
    pub(crate) fn kind(&self) -> &'static str {
        match self {
            Self::Success { .. } => "success",
            Self::ProjectComplete => "project_complete",
            Self::ApiLimitReached => "api_limit_reached",
            Self::TimeoutExhausted => "timeout_exhausted",
            Self::UsageLimitReached { .. } => "usage_limit_reached",
            Self::GenericError { .. } => "generic_error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Execution {
    pub(crate) outcome: InvocationOutcome,
    pub(crate) attempts: u32,
    /// Size in bytes of the final attempt's output.
    pub(crate) output_size: u64,
}

#[derive(Debug, Clone)]
pub(crate) struct AttemptRequest<'a> {
    pub(crate) prompt: &'a str,
    pub(crate) timeout: Duration,
    pub(crate) loop_number: u64,
    pub(crate) attempt: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct AttemptOutput {
    pub(crate) output: String,
    pub(crate) exit_code: i32,
    pub(crate) interrupted: bool,
    pub(crate) truncated: usize,
}

/// Launches one attempt of the external agent.
pub(crate) trait AgentRunner {
    fn run_attempt(
        &mut self,
        request: &AttemptRequest<'_>,
        logger: &Logger,
    ) -> Result<AttemptOutput, String>;
}

/// Runs the configured agent command through `bash -lc` with the prompt on stdin.
#[derive(Debug, Clone)]
pub(crate) struct ShellAgentRunner {
    command: String,
    project_dir: PathBuf,
    ledger_path: PathBuf,
    completion_token: String,
    output_limit_bytes: usize,
    interrupt_flag: Arc<AtomicBool>,
}

impl ShellAgentRunner {
    pub(crate) fn new(
        config: &Config,
        project_dir: &Path,
        ledger_path: &Path,
        interrupt_flag: Arc<AtomicBool>,
    ) -> Self {
        Self {
            command: config.agent_command.clone(),
            project_dir: project_dir.to_path_buf(),
            ledger_path: ledger_path.to_path_buf(),
            completion_token: config.completion_token.clone(),
            output_limit_bytes: config.output_limit_bytes,
            interrupt_flag,
        }
    }
}

impl AgentRunner for ShellAgentRunner {
    fn run_attempt(
        &mut self,
        request: &AttemptRequest<'_>,
        logger: &Logger,
    ) -> Result<AttemptOutput, String> {
        let env = CommandEnv {
            cwd: self.project_dir.clone(),
            loop_number: request.loop_number,
            attempt: request.attempt,
            ledger_path: self.ledger_path.clone(),
            completion_token: self.completion_token.clone(),
        };
        let output = run_shell_command_with_timeout(
            &self.command,
            request.prompt,
            request.timeout,
            self.output_limit_bytes,
            &env,
            &self.interrupt_flag,
            logger,
        )?;
        Ok(AttemptOutput {
            output: output.output,
            exit_code: output.exit_code,
            interrupted: output.interrupted,
            truncated: output.truncated,
        })
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Executor {
    completion_token: String,
    usage_limit_phrases: Vec<String>,
    api_limit_phrases: Vec<String>,
    max_timeout_retries: u32,
    retry_delay: Duration,
    log_dir: PathBuf,
}

impl Executor {
    pub(crate) fn new(config: &Config, log_dir: &Path) -> Self {
        Self {
            completion_token: config.completion_token.clone(),
            usage_limit_phrases: lowercase_all(&config.usage_limit_phrases),
            api_limit_phrases: lowercase_all(&config.api_limit_phrases),
            max_timeout_retries: config.max_timeout_retries,
            retry_delay: config.delays.retry_delay(),
            log_dir: log_dir.to_path_buf(),
        }
    }

    /// Runs the prompt until a terminal classification is reached. Timeouts
    /// are retried in place; everything else returns after one attempt.
    pub(crate) fn execute(
        &self,
        runner: &mut dyn AgentRunner,
        sleeper: &mut dyn Sleeper,
        logger: &Logger,
        prompt: &str,
        timeout: Duration,
        loop_number: u64,
    ) -> Result<Execution, Interrupted> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let request = AttemptRequest {
                prompt,
                timeout,
                loop_number,
                attempt,
            };
            let output = match runner.run_attempt(&request, logger) {
                Ok(output) => output,
                Err(message) => {
                    logger.error(&format!(
                        "agent launch failed loop={} attempt={} err={}",
                        loop_number, attempt, message
                    ));
                    return Ok(Execution {
                        outcome: InvocationOutcome::GenericError {
                            exit_code: -1,
                            message,
                        },
                        attempts: attempt,
                        output_size: 0,
                    });
                }
            };
            self.write_artifact(logger, loop_number, attempt, &output);
            if output.interrupted {
                return Err(Interrupted);
            }

            let output_size = output.output.len() as u64;
            let done = |outcome: InvocationOutcome| {
                Ok(Execution {
                    outcome,
                    attempts: attempt,
                    output_size,
                })
            };

            if output.exit_code == 0 {
                // Limit phrases are only consulted on a failed exit.
                if !self.completion_token.is_empty()
                    && output.output.contains(&self.completion_token)
                {
                    return done(InvocationOutcome::ProjectComplete);
                }
                let analysis = analyze(&output.output, &self.completion_token);
                return done(InvocationOutcome::Success { analysis });
            }

            let lowered = output.output.to_lowercase();
            // Checked before the timeout branch: the provider's message can
            // race with our kill.
            if contains_any(&lowered, &self.usage_limit_phrases) {
                let reset_hint = parse_reset_hint(&output.output, Local::now().naive_local());
                return done(InvocationOutcome::UsageLimitReached { reset_hint });
            }

            if output.exit_code == TIMEOUT_EXIT_CODE {
                if attempt <= self.max_timeout_retries {
                    logger.warn(&format!(
                        "agent timed out loop={} attempt={} retries_left={}",
                        loop_number,
                        attempt,
                        self.max_timeout_retries + 1 - attempt
                    ));
                    sleeper.sleep(self.retry_delay, "Agent timed out; retrying")?;
                    continue;
                }
                return done(InvocationOutcome::TimeoutExhausted);
            }

            if contains_any(&lowered, &self.api_limit_phrases) {
                return done(InvocationOutcome::ApiLimitReached);
            }

            let message = failure_message(&output.output, &self.completion_token, output.exit_code);
            return done(InvocationOutcome::GenericError {
                exit_code: output.exit_code,
                message,
            });
        }
    }

    fn write_artifact(
        &self,
        logger: &Logger,
        loop_number: u64,
        attempt: u32,
        output: &AttemptOutput,
    ) {
        let path = artifact_path(&self.log_dir, loop_number, attempt);
        let mut body = output.output.clone();
        if output.truncated > 0 {
            body.push_str(&format!("\n[agent output truncated {} bytes]\n", output.truncated));
        }
        let result = fs::create_dir_all(&self.log_dir).and_then(|()| fs::write(&path, body));
        if let Err(err) = result {
            logger.warn(&format!(
                "failed to write agent output log path={} err={}",
                path.display(),
                sanitize_log_value(&err.to_string())
            ));
        }
    }
}

pub(crate) fn artifact_path(log_dir: &Path, loop_number: u64, attempt: u32) -> PathBuf {
    let ts = Local::now().format("%Y%m%d_%H%M%S");
    log_dir.join(format!(
        "agent_output_{}_loop{}_attempt{}.log",
        ts, loop_number, attempt
    ))
}

fn lowercase_all(phrases: &[String]) -> Vec<String> {
    phrases
        .iter()
        .map(|phrase| phrase.trim().to_lowercase())
        .filter(|phrase| !phrase.is_empty())
        .collect()
}

fn contains_any(lowered: &str, phrases: &[String]) -> bool {
    phrases.iter().any(|phrase| lowered.contains(phrase.as_str()))
}

fn failure_message(output: &str, completion_token: &str, exit_code: i32) -> String {
    let analysis = analyze(output, completion_token);
    if !analysis.error_message.is_empty() {
        return analysis.error_message;
    }
    output
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(|line| line.chars().take(200).collect())
        .unwrap_or_else(|| format!("agent exited with code {}", exit_code))
}

/// Replays canned attempt outputs in order.
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct ScriptedRunner {
    pub(crate) script: std::collections::VecDeque<Result<AttemptOutput, String>>,
    pub(crate) prompts: Vec<String>,
}

#[cfg(test)]
impl ScriptedRunner {
    pub(crate) fn new(script: Vec<Result<AttemptOutput, String>>) -> Self {
        Self {
            script: script.into(),
            prompts: Vec::new(),
        }
    }

    pub(crate) fn calls(&self) -> usize {
        self.prompts.len()
    }
}

#[cfg(test)]
pub(crate) fn attempt(exit_code: i32, output: &str) -> Result<AttemptOutput, String> {
    Ok(AttemptOutput {
        output: output.to_string(),
        exit_code,
        interrupted: false,
        truncated: 0,
    })
}

#[cfg(test)]
impl AgentRunner for ScriptedRunner {
    fn run_attempt(
        &mut self,
        request: &AttemptRequest<'_>,
        _logger: &Logger,
    ) -> Result<AttemptOutput, String> {
        self.prompts.push(request.prompt.to_string());
        self.script
            .pop_front()
            .unwrap_or_else(|| Err("script exhausted".to_string()))
    }
}
