use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::config::Config;

#[derive(Debug, Parser)]
#[command(
    name = "ledgerloop",
    about = "Ledgerloop keeps feeding one prompt to a coding agent until the task ledger is done.",
    long_about = "Ledgerloop repeatedly runs an external coding agent against a JSON task ledger, guarded by an hourly call budget, a circuit breaker and reset-aware waits.\n\nLoop context is provided to the agent command via LEDGERLOOP_* environment variables.",
    disable_help_subcommand = true
)]
pub(crate) struct Cli {
    /// Load configuration from PATH instead of <project>/.ledgerloop.yml.
    #[arg(
        short = 'c',
        long = "config",
        global = true,
        value_name = "PATH",
        help = "Load configuration from PATH instead of <project>/.ledgerloop.yml."
    )]
    pub(crate) config: Option<PathBuf>,

    #[arg(
        short = 'p',
        long = "project",
        global = true,
        value_name = "DIR",
        help = "Project directory holding the prompt and ledger (defaults to the current directory)."
    )]
    pub(crate) project: Option<PathBuf>,

    #[command(flatten)]
    pub(crate) overrides: RunOverrides,

    #[command(subcommand)]
    pub(crate) command: Option<CliCommand>,
}

#[derive(Debug, Subcommand)]
pub(crate) enum CliCommand {
    /// Run the iteration loop (the default).
    Run,
    /// Print the last status snapshot, breaker state and call budget.
    Status,
    /// Force the circuit breaker back to CLOSED.
    ResetCircuit {
        #[arg(long, value_name = "TEXT", default_value = "manual reset")]
        reason: String,
    },
}

#[derive(Debug, Default, Args)]
pub(crate) struct RunOverrides {
    #[arg(long, global = true, value_name = "N", help = "Stop after N iterations (0 = unlimited).")]
    pub(crate) max_iterations: Option<u64>,

    #[arg(
        long,
        global = true,
        value_name = "N",
        help = "Agent invocations allowed per clock hour."
    )]
    pub(crate) calls_per_hour: Option<u32>,

    #[arg(long, global = true, value_name = "N", help = "Per-attempt agent timeout in minutes.")]
    pub(crate) timeout_minutes: Option<u64>,

    #[arg(long, global = true, value_name = "TEXT")]
    pub(crate) completion_token: Option<String>,

    #[arg(long, global = true, value_name = "CMD")]
    pub(crate) agent_command: Option<String>,
}

impl RunOverrides {
    pub(crate) fn apply(&self, config: &mut Config) {
        if let Some(value) = self.max_iterations {
            config.max_iterations = value;
        }
        if let Some(value) = self.calls_per_hour {
            config.max_calls_per_hour = value;
        }
        if let Some(value) = self.timeout_minutes {
            config.timeout_minutes = value;
        }
        if let Some(value) = &self.completion_token {
            config.completion_token = value.clone();
        }
        if let Some(value) = &self.agent_command {
            config.agent_command = value.clone();
        }
    }
}
