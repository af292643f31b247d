use serde::Deserialize;
use serde_yaml::{Mapping, Value};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub(crate) const DEFAULT_CONFIG_NAME: &str = ".ledgerloop.yml";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub agent_command: String,
    pub prompt_file: String,
    pub ledger_file: String,
    pub state_dir: String,
    pub log_dir: String,
    pub log_path: String,
    /// Zero means unlimited.
    pub max_iterations: u64,
    pub max_calls_per_hour: u32,
    pub timeout_minutes: u64,
    pub max_timeout_retries: u32,
    pub completion_token: String,
    pub usage_limit_phrases: Vec<String>,
    pub api_limit_phrases: Vec<String>,
    pub detect_git_changes: bool,
    pub output_limit_bytes: usize,
    pub breaker: BreakerConfig,
    pub delays: Delays,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            agent_command: "claude -p --dangerously-skip-permissions".to_string(),
            prompt_file: "PROMPT.md".to_string(),
            ledger_file: "prd.json".to_string(),
            state_dir: ".ledgerloop".to_string(),
            log_dir: ".ledgerloop/logs".to_string(),
            log_path: ".ledgerloop/ledgerloop.log".to_string(),
            max_iterations: 0,
            max_calls_per_hour: 100,
            timeout_minutes: 15,
            max_timeout_retries: 2,
            completion_token: "<promise>COMPLETE</promise>".to_string(),
            usage_limit_phrases: vec![
                "usage limit".to_string(),
                "out of extra usage".to_string(),
            ],
            api_limit_phrases: vec![
                "rate limit".to_string(),
                "limit reached".to_string(),
                "too many requests".to_string(),
            ],
            detect_git_changes: true,
            output_limit_bytes: 8 * 1024 * 1024,
            breaker: BreakerConfig::default(),
            delays: Delays::default(),
        }
    }
}

impl Config {
    /// Resolves a configured path against the project directory unless it is absolute.
    pub fn resolve(&self, project_dir: &Path, value: &str) -> PathBuf {
        let path = Path::new(value);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            project_dir.join(path)
        }
    }

    pub fn invocation_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_minutes.saturating_mul(60))
    }

    pub fn max_iterations(&self) -> Option<u64> {
        if self.max_iterations == 0 {
            None
        } else {
            Some(self.max_iterations)
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    pub no_progress_threshold: u32,
    pub same_error_threshold: u32,
    pub half_open_threshold: u32,
    /// An output smaller than this share (percent) of the previous one counts as degenerate.
    pub output_decline_percent: u32,
    pub history_limit: usize,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            no_progress_threshold: 3,
            same_error_threshold: 5,
            half_open_threshold: 2,
            output_decline_percent: 30,
            history_limit: 20,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Delays {
    pub success_pause_secs: u64,
    pub retry_delay_secs: u64,
    pub timeout_cooldown_secs: u64,
    pub error_cooldown_secs: u64,
    pub api_limit_cooldown_secs: u64,
    pub usage_limit_fallback_secs: u64,
}

impl Default for Delays {
    fn default() -> Self {
        Self {
            success_pause_secs: 5,
            retry_delay_secs: 10,
            timeout_cooldown_secs: 60,
            error_cooldown_secs: 30,
            api_limit_cooldown_secs: 3600,
            usage_limit_fallback_secs: 3600,
        }
    }
}

impl Delays {
    pub fn success_pause(&self) -> Duration {
        Duration::from_secs(self.success_pause_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }

    pub fn timeout_cooldown(&self) -> Duration {
        Duration::from_secs(self.timeout_cooldown_secs)
    }

    pub fn error_cooldown(&self) -> Duration {
        Duration::from_secs(self.error_cooldown_secs)
    }

    pub fn api_limit_cooldown(&self) -> Duration {
        Duration::from_secs(self.api_limit_cooldown_secs)
    }

    pub fn usage_limit_fallback(&self) -> Duration {
        Duration::from_secs(self.usage_limit_fallback_secs)
    }
}

#[derive(Debug)]
pub struct LoadedConfig {
    pub config: Config,
    pub warnings: Vec<String>,
}

const TOP_LEVEL_KEYS: &[&str] = &[
    "agent_command",
    "prompt_file",
    "ledger_file",
    "state_dir",
    "log_dir",
    "log_path",
    "max_iterations",
    "max_calls_per_hour",
    "timeout_minutes",
    "max_timeout_retries",
    "completion_token",
    "usage_limit_phrases",
    "api_limit_phrases",
    "detect_git_changes",
    "output_limit_bytes",
    "breaker",
    "delays",
];

const BREAKER_KEYS: &[&str] = &[
    "no_progress_threshold",
    "same_error_threshold",
    "half_open_threshold",
    "output_decline_percent",
    "history_limit",
];

const DELAY_KEYS: &[&str] = &[
    "success_pause_secs",
    "retry_delay_secs",
    "timeout_cooldown_secs",
    "error_cooldown_secs",
    "api_limit_cooldown_secs",
    "usage_limit_fallback_secs",
];

pub fn load_config(path: &Path) -> Result<LoadedConfig, String> {
    let content = fs::read_to_string(path)
        .map_err(|err| format!("Failed to read config {}: {}", path.display(), err))?;
    load_config_from_str(&content)
        .map_err(|err| format!("Failed to parse config {}: {}", path.display(), err))
}

pub(crate) fn load_config_from_str(content: &str) -> Result<LoadedConfig, String> {
    let value: Value = serde_yaml::from_str(content).map_err(|err| err.to_string())?;
    let mapping = match value {
        // An empty file is a valid "all defaults" config.
        Value::Null => Mapping::new(),
        Value::Mapping(mapping) => mapping,
        _ => return Err("config must be a YAML mapping".to_string()),
    };

    let mut warnings = unknown_keys(&mapping, TOP_LEVEL_KEYS, "");
    for (section, allowed) in [("breaker", BREAKER_KEYS), ("delays", DELAY_KEYS)] {
        if let Some(nested) = optional_mapping(&mapping, section)? {
            warnings.extend(unknown_keys(nested, allowed, section));
        }
    }
    emit_unknown_key_warnings(&warnings);

    let config: Config = serde_path_to_error::deserialize(Value::Mapping(mapping))
        .map_err(|err| format!("{} (at {})", err.inner(), err.path()))?;

    Ok(LoadedConfig { config, warnings })
}

fn emit_unknown_key_warnings(keys: &[String]) {
    for key in keys {
        eprintln!("Warning: unknown config key: {}", key);
    }
}

fn unknown_keys(mapping: &Mapping, allowed: &[&str], prefix: &str) -> Vec<String> {
    mapping
        .keys()
        .filter_map(|key| key.as_str().map(|value| value.to_string()))
        .filter(|key| !allowed.contains(&key.as_str()))
        .map(|key| {
            if prefix.is_empty() {
                key
            } else {
                format!("{}.{}", prefix, key)
            }
        })
        .collect()
}

fn optional_mapping<'a>(
    mapping: &'a Mapping,
    key_name: &str,
) -> Result<Option<&'a Mapping>, String> {
    let key = Value::String(key_name.to_string());
    match mapping.get(&key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Mapping(value)) => Ok(Some(value)),
        Some(_) => Err(format!("{} must be a mapping", key_name)),
    }
}
