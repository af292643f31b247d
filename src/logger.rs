use chrono::Local;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Level {
    Info,
    Warn,
    Error,
    Success,
    Loop,
}

impl Level {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::Info => "INFO",
            Self::Warn => "WARN",
            Self::Error => "ERROR",
            Self::Success => "SUCCESS",
            Self::Loop => "LOOP",
        }
    }
}

/// Line-oriented run log. Each record is a single sanitized line so the file
/// stays greppable even when agents emit multi-line error text.
#[derive(Debug)]
pub(crate) struct Logger {
    path: Option<PathBuf>,
    echo: bool,
    disabled: AtomicBool,
}

impl Logger {
    pub(crate) fn new(path: Option<PathBuf>, echo: bool) -> Self {
        Self {
            path,
            echo,
            disabled: AtomicBool::new(false),
        }
    }

    /// Logger that drops everything; used by read-only commands and tests.
    pub(crate) fn silent() -> Self {
        Self::new(None, false)
    }

    pub(crate) fn info(&self, message: &str) {
        self.log(Level::Info, message);
    }

    pub(crate) fn warn(&self, message: &str) {
        self.log(Level::Warn, message);
    }

    pub(crate) fn error(&self, message: &str) {
        self.log(Level::Error, message);
    }

    pub(crate) fn success(&self, message: &str) {
        self.log(Level::Success, message);
    }

    pub(crate) fn loop_event(&self, message: &str) {
        self.log(Level::Loop, message);
    }

    pub(crate) fn log(&self, level: Level, message: &str) {
        let ts = Local::now().format("%Y-%m-%d %H:%M:%S").to_string();
        let sanitized = sanitize_log_value(message);
        let line = format!("[{}] [{}] {}\n", ts, level.as_str(), sanitized);

        if self.echo {
            let mut stderr = std::io::stderr().lock();
            let _ = stderr.write_all(line.as_bytes());
        }

        let Some(path) = &self.path else {
            return;
        };
        if self.disabled.load(Ordering::Relaxed) {
            return;
        }
        let mut file = match fs::OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => file,
            Err(err) => {
                self.disable_with_warning(path, &err);
                return;
            }
        };
        if let Err(err) = file.write_all(line.as_bytes()) {
            self.disable_with_warning(path, &err);
        }
    }

    fn disable_with_warning(&self, path: &Path, err: &std::io::Error) {
        // Keep the loop running, but surface logging failures once and stop retrying.
        if self
            .disabled
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            let mut stderr = std::io::stderr().lock();
            let _ = writeln!(
                stderr,
                "Warning: run logging disabled log_path={} io_error={}",
                path.display(),
                err
            );
        }
    }
}

pub(crate) fn sanitize_log_value(value: &str) -> String {
    value
        .replace('\n', "\\n")
        .replace('\r', "\\r")
        .replace('\t', "\\t")
}
