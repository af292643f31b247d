use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct Ledger {
    #[serde(default, alias = "branchName", deserialize_with = "lenient")]
    pub(crate) branch_name: Option<String>,
    #[serde(default, rename = "userStories", alias = "stories")]
    pub(crate) stories: Vec<Story>,
}

/// One ledger entry. Only `id`, `priority` and `passes` drive the loop;
/// descriptive fields fall back to their defaults on any unexpected shape.
#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct Story {
    #[serde(default, deserialize_with = "story_id")]
    pub(crate) id: String,
    #[serde(default, deserialize_with = "lenient")]
    pub(crate) category: String,
    #[serde(default, alias = "title", deserialize_with = "lenient")]
    pub(crate) story: String,
    #[serde(default, deserialize_with = "lenient")]
    pub(crate) steps: Vec<String>,
    #[serde(default, alias = "acceptanceCriteria", deserialize_with = "lenient")]
    pub(crate) acceptance: Vec<String>,
    #[serde(default, deserialize_with = "priority")]
    pub(crate) priority: i64,
    #[serde(default, deserialize_with = "passes")]
    pub(crate) passes: bool,
    #[serde(default, deserialize_with = "lenient")]
    pub(crate) notes: String,
}

/// Falls back to the default when the value has an unexpected shape.
fn lenient<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned + Default,
{
    let value = Value::deserialize(deserializer)?;
    Ok(serde_json::from_value(value).unwrap_or_default())
}

fn story_id<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    Ok(match Value::deserialize(deserializer)? {
        Value::String(id) => id,
        Value::Number(number) => number.to_string(),
        _ => String::new(),
    })
}

/// Integers as-is, fractions rounded down, numeric strings parsed.
fn priority<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
    let value = Value::deserialize(deserializer)?;
    let parsed = match &value {
        Value::Number(number) => number
            .as_i64()
            .or_else(|| number.as_f64().map(|float| float.floor() as i64)),
        Value::String(text) => text
            .trim()
            .parse::<f64>()
            .ok()
            .map(|float| float.floor() as i64),
        _ => None,
    };
    Ok(parsed.unwrap_or_default())
}

/// `null` reads as not passing; any other non-boolean is a ledger error.
fn passes<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    Ok(Option::<bool>::deserialize(deserializer)?.unwrap_or(false))
}

/// Aggregate view the loop uses as its progress oracle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct LedgerSummary {
    pub(crate) branch_name: Option<String>,
    pub(crate) total: usize,
    pub(crate) complete: usize,
    pub(crate) next_story: Option<String>,
}

impl LedgerSummary {
    pub(crate) fn incomplete(&self) -> usize {
        self.total - self.complete
    }
}

pub(crate) fn load_ledger(path: &Path) -> Result<Ledger, String> {
    let content = fs::read_to_string(path)
        .map_err(|err| format!("Failed to read ledger {}: {}", path.display(), err))?;
    parse_ledger(&content)
        .map_err(|err| format!("Failed to parse ledger {}: {}", path.display(), err))
}

pub(crate) fn parse_ledger(content: &str) -> Result<Ledger, String> {
    let deserializer = &mut serde_json::Deserializer::from_str(content);
    serde_path_to_error::deserialize(deserializer).map_err(|err| {
        let path = err.path().to_string();
        if path == "." {
            err.inner().to_string()
        } else {
            format!("{} (at {})", err.inner(), path)
        }
    })
}

impl Ledger {
    pub(crate) fn summary(&self) -> LedgerSummary {
        LedgerSummary {
            branch_name: self.branch_name.clone(),
            total: self.stories.len(),
            complete: self.stories.iter().filter(|story| story.passes).count(),
            next_story: self
                .incomplete_in_order()
                .first()
                .map(|story| story.id.clone()),
        }
    }

    /// Incomplete stories, lowest priority value first, ties broken by id.
    pub(crate) fn incomplete_in_order(&self) -> Vec<&Story> {
        let mut pending: Vec<&Story> = self.stories.iter().filter(|story| !story.passes).collect();
        pending.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.id.cmp(&b.id)));
        pending
    }

    pub(crate) fn duplicate_ids(&self) -> Vec<String> {
        let mut seen = BTreeSet::new();
        let mut duplicates = BTreeSet::new();
        for story in &self.stories {
            if !seen.insert(story.id.as_str()) {
                duplicates.insert(story.id.clone());
            }
        }
        duplicates.into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const SAMPLE: &str = r#"{
  "branchName": "ralph/task-priority",
  "userStories": [
    {"id": "US-003", "category": "ui", "story": "Filter", "steps": ["a"], "acceptance": ["b"], "priority": 2, "passes": false, "notes": ""},
    {"id": "US-001", "category": "db", "story": "Schema", "priority": 1, "passes": true},
    {"id": "US-002", "title": "Badge", "acceptanceCriteria": ["shown"], "priority": 2, "passes": false}
  ]
}"#;

    #[test]
    fn summary_counts_and_orders() {
        let ledger = parse_ledger(SAMPLE).expect("parse");
        let summary = ledger.summary();
        assert_eq!(summary.branch_name.as_deref(), Some("ralph/task-priority"));
        assert_eq!(summary.total, 3);
        assert_eq!(summary.complete, 1);
        assert_eq!(summary.incomplete(), 2);
        assert_eq!(summary.next_story.as_deref(), Some("US-002"));

        let order: Vec<&str> = ledger
            .incomplete_in_order()
            .iter()
            .map(|story| story.id.as_str())
            .collect();
        assert_eq!(order, vec!["US-002", "US-003"]);
        assert_eq!(ledger.stories[2].story, "Badge");
        assert_eq!(ledger.stories[2].acceptance, vec!["shown".to_string()]);
    }

    #[test]
    fn all_complete_has_no_next_story() {
        let ledger = parse_ledger(
            r#"{"stories": [{"id": "a", "passes": true}, {"id": "b", "passes": true}]}"#,
        )
        .expect("parse");
        let summary = ledger.summary();
        assert_eq!(summary.incomplete(), 0);
        assert_eq!(summary.next_story, None);
        assert_eq!(summary.branch_name, None);
    }

    #[test]
    fn duplicate_ids_are_reported_once() {
        let ledger = parse_ledger(
            r#"{"userStories": [{"id": "a"}, {"id": "b"}, {"id": "a"}, {"id": "a"}]}"#,
        )
        .expect("parse");
        assert_eq!(ledger.duplicate_ids(), vec!["a".to_string()]);
    }

    #[test]
    fn type_errors_name_the_story_field() {
        let err = parse_ledger(r#"{"userStories": [{"id": "a"}, {"id": "b", "passes": "yes"}]}"#)
            .expect_err("expected type error");
        assert!(err.contains("userStories[1].passes"), "got: {err}");
    }

    #[test]
    fn descriptive_fields_with_odd_shapes_do_not_break_parsing() {
        let ledger = parse_ledger(
            r#"{"branchName": null, "userStories": [
                {"id": 7, "notes": null, "steps": null, "category": 3, "passes": true},
                {"id": "b", "priority": 1.5, "story": {"text": "nested"}, "passes": null},
                {"id": "c", "priority": "0", "acceptance": "one line"}
            ]}"#,
        )
        .expect("parse");
        assert_eq!(ledger.stories[0].id, "7");
        assert_eq!(ledger.stories[0].notes, "");
        assert!(ledger.stories[0].steps.is_empty());
        assert_eq!(ledger.stories[1].priority, 1);
        assert_eq!(ledger.stories[1].story, "");
        assert!(!ledger.stories[1].passes);
        assert_eq!(ledger.stories[2].priority, 0);

        let summary = ledger.summary();
        assert_eq!(summary.branch_name, None);
        assert_eq!(summary.complete, 1);
        assert_eq!(summary.next_story.as_deref(), Some("c"));
    }

    #[test]
    fn load_reports_missing_file_with_path() {
        let temp = TempDir::new().expect("temp dir");
        let missing = temp.path().join("prd.json");
        let err = load_ledger(&missing).expect_err("expected read error");
        assert!(err.contains("prd.json"), "got: {err}");
    }
}
