use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Returned when a wait is cut short by Ctrl-C.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Interrupted;

pub(crate) trait Sleeper {
    fn sleep(&mut self, duration: Duration, label: &str) -> Result<(), Interrupted>;
}

/// Blocking wait that redraws a countdown on stderr once per second and
/// polls the interrupt flag between ticks.
#[derive(Debug, Clone)]
pub(crate) struct CountdownSleeper {
    interrupt_flag: Arc<AtomicBool>,
    visible: bool,
}

impl CountdownSleeper {
    pub(crate) fn new(interrupt_flag: Arc<AtomicBool>, visible: bool) -> Self {
        Self {
            interrupt_flag,
            visible,
        }
    }

    fn draw(&self, label: &str, remaining: Duration) {
        if !self.visible {
            return;
        }
        let mut stderr = std::io::stderr().lock();
        let _ = write!(
            stderr,
            "\r{}: {} remaining   ",
            label,
            format_countdown(remaining)
        );
        let _ = stderr.flush();
    }

    fn finish_line(&self) {
        if self.visible {
            let mut stderr = std::io::stderr().lock();
            let _ = writeln!(stderr);
        }
    }
}

impl Sleeper for CountdownSleeper {
    fn sleep(&mut self, duration: Duration, label: &str) -> Result<(), Interrupted> {
        let deadline = Instant::now() + duration;
        loop {
            if self.interrupt_flag.load(Ordering::SeqCst) {
                self.finish_line();
                return Err(Interrupted);
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let remaining = deadline - now;
            self.draw(label, remaining);
            thread::sleep(remaining.min(Duration::from_secs(1)));
        }
        if !duration.is_zero() {
            self.finish_line();
        }
        Ok(())
    }
}

pub(crate) fn format_countdown(remaining: Duration) -> String {
    // Round up so the display never shows 00:00:00 while still waiting.
    let mut secs = remaining.as_secs();
    if remaining.subsec_nanos() > 0 {
        secs += 1;
    }
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
}

/// Records requested waits instead of sleeping.
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct RecordingSleeper {
    pub(crate) waits: Vec<(Duration, String)>,
    pub(crate) interrupt_after: Option<usize>,
}

#[cfg(test)]
impl RecordingSleeper {
    pub(crate) fn durations(&self) -> Vec<Duration> {
        self.waits.iter().map(|(duration, _)| *duration).collect()
    }
}

#[cfg(test)]
impl Sleeper for RecordingSleeper {
    fn sleep(&mut self, duration: Duration, label: &str) -> Result<(), Interrupted> {
        self.waits.push((duration, label.to_string()));
        match self.interrupt_after {
            Some(limit) if self.waits.len() >= limit => Err(Interrupted),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_countdown_rounds_up_partial_seconds() {
        assert_eq!(format_countdown(Duration::from_secs(0)), "00:00:00");
        assert_eq!(format_countdown(Duration::from_millis(1500)), "00:00:02");
        assert_eq!(format_countdown(Duration::from_secs(3661)), "01:01:01");
        assert_eq!(format_countdown(Duration::from_secs(22 * 3600 + 60)), "22:01:00");
    }

    #[test]
    fn countdown_returns_immediately_when_interrupted() {
        let flag = Arc::new(AtomicBool::new(true));
        let mut sleeper = CountdownSleeper::new(flag, false);
        let started = Instant::now();
        let result = sleeper.sleep(Duration::from_secs(30), "cooldown");
        assert_eq!(result, Err(Interrupted));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn countdown_zero_duration_is_a_noop() {
        let flag = Arc::new(AtomicBool::new(false));
        let mut sleeper = CountdownSleeper::new(flag, false);
        assert_eq!(sleeper.sleep(Duration::ZERO, "pause"), Ok(()));
    }
}
