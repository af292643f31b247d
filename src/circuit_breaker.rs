use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use crate::config::BreakerConfig;
use crate::logger::Logger;
use crate::status::write_json_atomic;

const STATE_FILE: &str = ".circuit_breaker_state";
const STATE_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub(crate) enum BreakerState {
    Closed,
    HalfOpen,
    Open,
}

impl BreakerState {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "CLOSED",
            Self::HalfOpen => "HALF_OPEN",
            Self::Open => "OPEN",
        }
    }
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct OutcomeRecord {
    pub(crate) loop_number: u64,
    pub(crate) files_modified: u32,
    pub(crate) has_error: bool,
    pub(crate) output_size: u64,
    #[serde(default)]
    pub(crate) error_message: String,
    pub(crate) recorded_at: DateTime<Local>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct BreakerSnapshot {
    pub(crate) version: u32,
    pub(crate) state: BreakerState,
    #[serde(default)]
    pub(crate) consecutive_no_progress: u32,
    #[serde(default)]
    pub(crate) consecutive_same_error: u32,
    #[serde(default)]
    pub(crate) last_progress_loop: u64,
    #[serde(default)]
    pub(crate) total_opens: u32,
    /// Why the breaker is in its current state.
    #[serde(default)]
    pub(crate) reason: String,
    #[serde(default)]
    pub(crate) last_reset_reason: Option<String>,
    pub(crate) updated_at: DateTime<Local>,
    #[serde(default)]
    pub(crate) failure_history: Vec<OutcomeRecord>,
}

impl BreakerSnapshot {
    fn fresh(now: DateTime<Local>) -> Self {
        Self {
            version: STATE_VERSION,
            state: BreakerState::Closed,
            consecutive_no_progress: 0,
            consecutive_same_error: 0,
            last_progress_loop: 0,
            total_opens: 0,
            reason: String::new(),
            last_reset_reason: None,
            updated_at: now,
            failure_history: Vec::new(),
        }
    }
}

/// Trips to `OPEN` on sustained no-progress iterations or a repeated error,
/// and stays there until [`CircuitBreaker::reset`] is called.
#[derive(Debug)]
pub(crate) struct CircuitBreaker {
    path: PathBuf,
    policy: BreakerConfig,
}

impl CircuitBreaker {
    pub(crate) fn new(state_dir: &Path, policy: BreakerConfig) -> Self {
        Self {
            path: state_dir.join(STATE_FILE),
            policy,
        }
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    /// Loads persisted state; a missing, unreadable or foreign-version file is fresh state.
    pub(crate) fn snapshot(&self, logger: &Logger) -> BreakerSnapshot {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(_) => return BreakerSnapshot::fresh(Local::now()),
        };
        match serde_json::from_str::<BreakerSnapshot>(&content) {
            Ok(snapshot) if snapshot.version == STATE_VERSION => snapshot,
            Ok(snapshot) => {
                logger.warn(&format!(
                    "circuit breaker state {} has version {}; starting fresh",
                    self.path.display(),
                    snapshot.version
                ));
                BreakerSnapshot::fresh(Local::now())
            }
            Err(err) => {
                logger.warn(&format!(
                    "circuit breaker state {} is malformed ({}); starting fresh",
                    self.path.display(),
                    err
                ));
                BreakerSnapshot::fresh(Local::now())
            }
        }
    }

    pub(crate) fn state(&self, logger: &Logger) -> BreakerState {
        self.snapshot(logger).state
    }

    pub(crate) fn should_halt(&self, logger: &Logger) -> bool {
        self.state(logger) == BreakerState::Open
    }

    pub(crate) fn record_outcome(
        &self,
        logger: &Logger,
        loop_number: u64,
        files_modified: u32,
        has_error: bool,
        output_size: u64,
        error_message: &str,
    ) -> Result<BreakerState, String> {
        let mut snapshot = self.snapshot(logger);
        let now = Local::now();
        let previous_size = snapshot
            .failure_history
            .last()
            .map(|record| record.output_size);

        snapshot.failure_history.push(OutcomeRecord {
            loop_number,
            files_modified,
            has_error,
            output_size,
            error_message: error_message.to_string(),
            recorded_at: now,
        });
        let overflow = snapshot
            .failure_history
            .len()
            .saturating_sub(self.policy.history_limit.max(1));
        snapshot.failure_history.drain(..overflow);
        snapshot.updated_at = now;

        let before = snapshot.state;
        if before == BreakerState::Open {
            // Evidence keeps accumulating, the state does not move.
            self.save(&snapshot)?;
            return Ok(BreakerState::Open);
        }

        let degenerate = self.is_degenerate(output_size, previous_size);
        let progress = files_modified > 0;
        if progress {
            snapshot.consecutive_no_progress = 0;
            snapshot.last_progress_loop = loop_number;
        } else if has_error || degenerate {
            snapshot.consecutive_no_progress += 1;
        }

        let previous_error = snapshot
            .failure_history
            .iter()
            .rev()
            .nth(1)
            .filter(|record| record.has_error)
            .map(|record| record.error_message.as_str());
        if has_error && !error_message.is_empty() && previous_error == Some(error_message) {
            snapshot.consecutive_same_error += 1;
        } else if has_error && !error_message.is_empty() {
            snapshot.consecutive_same_error = 1;
        } else {
            snapshot.consecutive_same_error = 0;
        }

        let next = if snapshot.consecutive_no_progress >= self.policy.no_progress_threshold {
            snapshot.reason = format!(
                "no progress in {} consecutive loops",
                snapshot.consecutive_no_progress
            );
            BreakerState::Open
        } else if snapshot.consecutive_same_error >= self.policy.same_error_threshold {
            snapshot.reason = format!(
                "same error repeated {} times: {}",
                snapshot.consecutive_same_error, error_message
            );
            BreakerState::Open
        } else if progress {
            if before == BreakerState::HalfOpen {
                snapshot.reason = format!("progress resumed in loop {}", loop_number);
            }
            BreakerState::Closed
        } else if snapshot.consecutive_no_progress >= self.policy.half_open_threshold {
            snapshot.reason = format!(
                "monitoring: {} loops without progress",
                snapshot.consecutive_no_progress
            );
            BreakerState::HalfOpen
        } else {
            before
        };

        if next != before {
            if next == BreakerState::Open {
                snapshot.total_opens += 1;
                logger.error(&format!(
                    "circuit breaker {} -> {} loop={} reason={}",
                    before, next, loop_number, snapshot.reason
                ));
            } else {
                logger.warn(&format!(
                    "circuit breaker {} -> {} loop={} reason={}",
                    before, next, loop_number, snapshot.reason
                ));
            }
        }
        snapshot.state = next;
        self.save(&snapshot)?;
        Ok(next)
    }

    pub(crate) fn reset(&self, logger: &Logger, reason: &str) -> Result<(), String> {
        let previous = self.snapshot(logger);
        let mut snapshot = BreakerSnapshot::fresh(Local::now());
        snapshot.total_opens = previous.total_opens;
        snapshot.reason = "reset".to_string();
        snapshot.last_reset_reason = Some(reason.to_string());
        self.save(&snapshot)?;
        logger.info(&format!(
            "circuit breaker {} -> CLOSED reason={}",
            previous.state, reason
        ));
        Ok(())
    }

    fn is_degenerate(&self, output_size: u64, previous_size: Option<u64>) -> bool {
        if output_size == 0 {
            return true;
        }
        match previous_size {
            Some(previous) if previous > 0 => {
                output_size.saturating_mul(100)
                    < previous.saturating_mul(u64::from(self.policy.output_decline_percent))
            }
            _ => false,
        }
    }

    fn save(&self, snapshot: &BreakerSnapshot) -> Result<(), String> {
        write_json_atomic(&self.path, snapshot)
    }
}
