use chrono::{DateTime, Local};
use regex::Regex;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::OnceLock;

use crate::status::write_json_atomic;

const MAX_ERROR_MESSAGE_CHARS: usize = 200;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub(crate) struct Analysis {
    pub(crate) files_modified: u32,
    pub(crate) has_errors: bool,
    pub(crate) error_message: String,
    pub(crate) exit_signal: bool,
}

#[derive(Debug, Serialize)]
struct AnalysisSnapshot<'a> {
    loop_number: u64,
    analyzed_at: DateTime<Local>,
    output_size: u64,
    #[serde(flatten)]
    analysis: &'a Analysis,
}

fn file_line_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"(?im)^\s*(?:[-*]\s+)?(?:modified|created|updated|edited|deleted|wrote)\b:?\s+`?([^\s`]+)`?",
        )
        .expect("file line pattern compiles")
    })
}

fn files_changed_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)\b(\d+)\s+files?\s+changed\b").expect("files changed pattern compiles")
    })
}

fn no_errors_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)\b(?:0|no|zero)\s+errors?\b").expect("no errors pattern compiles")
    })
}

fn exit_signal_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)\bEXIT_SIGNAL:\s*true\b").expect("exit signal pattern compiles")
    })
}

/// Extracts progress and failure signals from raw agent output.
///
/// Never fails: unrecognised output yields zero files modified and no error.
pub(crate) fn analyze(output: &str, completion_token: &str) -> Analysis {
    let error_line = output
        .lines()
        .map(str::trim)
        .find(|line| is_error_line(line));
    let error_message = error_line
        .map(|line| line.chars().take(MAX_ERROR_MESSAGE_CHARS).collect())
        .unwrap_or_default();
    let exit_signal = exit_signal_pattern().is_match(output)
        || (!completion_token.is_empty() && output.contains(completion_token));

    Analysis {
        files_modified: count_modified_files(output),
        has_errors: error_line.is_some(),
        error_message,
        exit_signal,
    }
}

fn count_modified_files(output: &str) -> u32 {
    let paths: BTreeSet<&str> = file_line_pattern()
        .captures_iter(output)
        .filter_map(|caps| caps.get(1).map(|m| m.as_str()))
        .map(|path| path.trim_end_matches([',', ';', ':']))
        .filter(|path| path.contains('.') || path.contains('/'))
        .collect();
    let summary = files_changed_pattern()
        .captures_iter(output)
        .filter_map(|caps| caps[1].parse::<u32>().ok())
        .max()
        .unwrap_or(0);
    u32::try_from(paths.len()).unwrap_or(u32::MAX).max(summary)
}

fn is_error_line(line: &str) -> bool {
    if line.is_empty() || no_errors_pattern().is_match(line) {
        return false;
    }
    let lower = line.to_lowercase();
    lower.starts_with("error:")
        || lower.starts_with("error[")
        || lower.starts_with("fatal:")
        || line.starts_with("ERROR")
        || lower.contains("panicked at")
        || line.contains("Traceback (most recent call last)")
        || line.contains("FAILED")
}

/// Number of paths whose `git status --porcelain` entry appeared, vanished or changed.
pub(crate) fn count_changed_paths(
    before: &BTreeMap<String, String>,
    after: &BTreeMap<String, String>,
) -> u32 {
    let changed = after
        .iter()
        .filter(|(path, status)| before.get(*path) != Some(*status))
        .count()
        + before.keys().filter(|path| !after.contains_key(*path)).count();
    u32::try_from(changed).unwrap_or(u32::MAX)
}

pub(crate) fn persist_analysis(
    path: &Path,
    loop_number: u64,
    analysis: &Analysis,
    output_size: u64,
) -> Result<(), String> {
    let snapshot = AnalysisSnapshot {
        loop_number,
        analyzed_at: Local::now(),
        output_size,
        analysis,
    };
    write_json_atomic(path, &snapshot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    const TOKEN: &str = "<promise>COMPLETE</promise>";

    #[test]
    fn counts_distinct_file_mentions() {
        let output = "\
Working on story US-002
Modified: src/lib.rs
- Created `tests/new_test.rs`
Updated src/lib.rs
Updated the changelog
Wrote docs/notes.md
";
        let analysis = analyze(output, TOKEN);
        assert_eq!(analysis.files_modified, 3);
        assert!(!analysis.has_errors);
        assert!(!analysis.exit_signal);
    }

    #[test]
    fn git_summary_wins_when_larger() {
        let output = "Modified: a.rs\n 7 files changed, 120 insertions(+), 4 deletions(-)\n";
        assert_eq!(analyze(output, TOKEN).files_modified, 7);
    }

    #[test]
    fn first_error_line_is_reported() {
        let output = "compiling\nerror[E0308]: mismatched types\nerror: aborting\n";
        let analysis = analyze(output, TOKEN);
        assert!(analysis.has_errors);
        assert_eq!(analysis.error_message, "error[E0308]: mismatched types");
    }

    #[test]
    fn zero_error_summaries_are_not_errors() {
        let output = "test result: ok. 0 errors\nlint: no errors found\n";
        let analysis = analyze(output, TOKEN);
        assert!(!analysis.has_errors);
        assert!(analysis.error_message.is_empty());
    }

    #[test]
    fn panics_and_tracebacks_are_errors() {
        assert!(analyze("thread 'main' panicked at src/main.rs:3:5", TOKEN).has_errors);
        assert!(analyze("Traceback (most recent call last):\n  File x", TOKEN).has_errors);
        assert!(analyze("test foo ... FAILED", TOKEN).has_errors);
    }

    #[test]
    fn long_error_lines_are_capped() {
        let output = format!("Error: {}", "x".repeat(500));
        let analysis = analyze(&output, TOKEN);
        assert_eq!(analysis.error_message.chars().count(), MAX_ERROR_MESSAGE_CHARS);
    }

    #[test]
    fn exit_signal_from_marker_or_token() {
        assert!(analyze("STATUS\nEXIT_SIGNAL: true\n", TOKEN).exit_signal);
        assert!(analyze("done <promise>COMPLETE</promise>", TOKEN).exit_signal);
        assert!(!analyze("EXIT_SIGNAL: false", TOKEN).exit_signal);
        assert!(!analyze("anything", "").exit_signal);
    }

    #[test]
    fn garbage_yields_conservative_defaults() {
        let analysis = analyze("\u{0}\u{1}binary\u{fffd}", TOKEN);
        assert_eq!(analysis, Analysis::default());
    }

    #[test]
    fn changed_paths_compares_porcelain_snapshots() {
        let before: BTreeMap<String, String> = [
            ("a.rs".to_string(), " M".to_string()),
            ("b.rs".to_string(), "??".to_string()),
        ]
        .into_iter()
        .collect();
        let after: BTreeMap<String, String> = [
            ("a.rs".to_string(), " M".to_string()),
            ("c.rs".to_string(), "A ".to_string()),
        ]
        .into_iter()
        .collect();
        assert_eq!(count_changed_paths(&before, &after), 2);
        assert_eq!(count_changed_paths(&before, &before), 0);
    }

    #[test]
    fn persisted_snapshot_is_flat_json() {
        let temp = TempDir::new().expect("temp dir");
        let path = temp.path().join(".response_analysis");
        let analysis = Analysis {
            files_modified: 2,
            has_errors: true,
            error_message: "error: nope".to_string(),
            exit_signal: false,
        };
        persist_analysis(&path, 4, &analysis, 1234).expect("persist");
        let value: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).expect("read")).expect("json");
        assert_eq!(value["loop_number"], 4);
        assert_eq!(value["files_modified"], 2);
        assert_eq!(value["has_errors"], true);
        assert_eq!(value["output_size"], 1234);
    }
}
