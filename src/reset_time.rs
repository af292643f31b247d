use chrono::{NaiveDateTime, TimeDelta};
use regex::Regex;
use std::sync::OnceLock;
use std::time::Duration;

/// Added to every parsed wait so the next attempt lands after the provider resets.
pub(crate) const SAFETY_BUFFER: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ResetHint {
    /// 24-hour clock.
    pub(crate) hour: u32,
    pub(crate) timezone: Option<String>,
    pub(crate) wait: Duration,
}

fn reset_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)\bresets\s+(?:at\s+)?(\d{1,2})(?::00)?\s*(am|pm)\b(?:\s*\(([^)]+)\))?")
            .expect("reset pattern compiles")
    })
}

pub(crate) fn to_24_hour(hour: u32, meridiem: &str) -> Option<u32> {
    if !(1..=12).contains(&hour) {
        return None;
    }
    let pm = meridiem.eq_ignore_ascii_case("pm");
    Some(match (hour, pm) {
        (12, false) => 0,
        (12, true) => 12,
        (h, false) => h,
        (h, true) => h + 12,
    })
}

/// Finds "resets 3am (Zone/Name)" in agent output and returns how long to
/// wait from `now` (local wall clock) until the next occurrence of that hour.
/// A target equal to the current hour is treated as already passed.
pub(crate) fn parse_reset_hint(text: &str, now: NaiveDateTime) -> Option<ResetHint> {
    let captures = reset_pattern()
        .captures_iter(text)
        .find(|caps| {
            caps[1]
                .parse::<u32>()
                .ok()
                .and_then(|hour| to_24_hour(hour, &caps[2]))
                .is_some()
        })?;
    let hour = to_24_hour(captures[1].parse().ok()?, &captures[2])?;
    let timezone = captures
        .get(3)
        .map(|tz| tz.as_str().trim().to_string())
        .filter(|tz| !tz.is_empty());

    let mut target = now.date().and_hms_opt(hour, 0, 0)?;
    if target <= now {
        target = target.checked_add_signed(TimeDelta::days(1))?;
    }
    let wait = (target - now).to_std().ok()? + SAFETY_BUFFER;

    Some(ResetHint {
        hour,
        timezone,
        wait,
    })
}
