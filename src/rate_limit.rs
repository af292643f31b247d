use chrono::{DateTime, Local, Timelike};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::countdown::{Interrupted, Sleeper};

const CALL_COUNT_FILE: &str = ".call_count";
const BUCKET_FILE: &str = ".last_reset";

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum WaitError {
    Interrupted,
    State(String),
}

impl From<Interrupted> for WaitError {
    fn from(_: Interrupted) -> Self {
        Self::Interrupted
    }
}

/// Hourly call budget persisted as two scalar files so separate processes
/// (and restarts) observe the same count.
#[derive(Debug, Clone)]
pub(crate) struct RateLimiter {
    count_path: PathBuf,
    bucket_path: PathBuf,
    max_calls: u32,
}

pub(crate) fn bucket_key(now: DateTime<Local>) -> String {
    now.format("%Y%m%d%H").to_string()
}

pub(crate) fn until_next_hour(now: DateTime<Local>) -> Duration {
    let nanos = u64::from(now.nanosecond().min(999_999_999));
    let into_hour = Duration::from_secs(u64::from(now.minute() * 60 + now.second()))
        + Duration::from_nanos(nanos);
    Duration::from_secs(3600).saturating_sub(into_hour)
}

impl RateLimiter {
    pub(crate) fn new(state_dir: &Path, max_calls: u32) -> Self {
        Self {
            count_path: state_dir.join(CALL_COUNT_FILE),
            bucket_path: state_dir.join(BUCKET_FILE),
            max_calls,
        }
    }

    pub(crate) fn max_calls(&self) -> u32 {
        self.max_calls
    }

    pub(crate) fn can_call(&self) -> Result<bool, String> {
        self.can_call_at(Local::now())
    }

    pub(crate) fn record_call(&self) -> Result<u32, String> {
        self.record_call_at(Local::now())
    }

    pub(crate) fn calls_this_hour(&self) -> u32 {
        self.calls_this_hour_at(Local::now())
    }

    pub(crate) fn roll_bucket(&self) -> Result<bool, String> {
        self.roll_bucket_at(Local::now())
    }

    pub(crate) fn wait_until_next_hour(&self, sleeper: &mut dyn Sleeper) -> Result<(), WaitError> {
        self.wait_until_next_hour_at(Local::now(), sleeper)
    }

    pub(crate) fn can_call_at(&self, now: DateTime<Local>) -> Result<bool, String> {
        self.roll_bucket_at(now)?;
        Ok(self.read_count() < self.max_calls)
    }

    pub(crate) fn record_call_at(&self, now: DateTime<Local>) -> Result<u32, String> {
        self.roll_bucket_at(now)?;
        let count = self.read_count().saturating_add(1);
        write_scalar(&self.count_path, &count.to_string())?;
        Ok(count)
    }

    /// Read-only view: a stale bucket reports zero without being rewritten.
    pub(crate) fn calls_this_hour_at(&self, now: DateTime<Local>) -> u32 {
        match self.read_bucket() {
            Some(bucket) if bucket == bucket_key(now) => self.read_count(),
            _ => 0,
        }
    }

    /// Advances the stored bucket to the current hour, zeroing the count.
    /// Returns whether anything was written.
    pub(crate) fn roll_bucket_at(&self, now: DateTime<Local>) -> Result<bool, String> {
        let key = bucket_key(now);
        if self.read_bucket().as_deref() == Some(key.as_str()) {
            return Ok(false);
        }
        self.reset_bucket(&key)?;
        Ok(true)
    }

    pub(crate) fn wait_until_next_hour_at(
        &self,
        now: DateTime<Local>,
        sleeper: &mut dyn Sleeper,
    ) -> Result<(), WaitError> {
        let wait = until_next_hour(now);
        sleeper.sleep(wait, "Hourly call budget exhausted; waiting for reset")?;
        let next_hour = chrono::Duration::from_std(wait)
            .ok()
            .and_then(|delta| now.checked_add_signed(delta))
            .unwrap_or(now);
        self.reset_bucket(&bucket_key(next_hour))
            .map_err(WaitError::State)
    }

    fn reset_bucket(&self, key: &str) -> Result<(), String> {
        if let Some(parent) = self.count_path.parent() {
            fs::create_dir_all(parent).map_err(|err| {
                format!("Failed to create state dir {}: {}", parent.display(), err)
            })?;
        }
        write_scalar(&self.count_path, "0")?;
        write_scalar(&self.bucket_path, key)
    }

    fn read_count(&self) -> u32 {
        read_scalar(&self.count_path)
            .and_then(|value| value.parse::<u32>().ok())
            .unwrap_or(0)
    }

    fn read_bucket(&self) -> Option<String> {
        read_scalar(&self.bucket_path).filter(|value| !value.is_empty())
    }
}

fn read_scalar(path: &Path) -> Option<String> {
    fs::read_to_string(path)
        .ok()
        .map(|value| value.trim().to_string())
}

fn write_scalar(path: &Path, value: &str) -> Result<(), String> {
    fs::write(path, format!("{}\n", value))
        .map_err(|err| format!("Failed to write {}: {}", path.display(), err))
}
