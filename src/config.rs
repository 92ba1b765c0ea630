//! Configuration loading, validation, and persistence.
//!
//! The agent keeps a single human-owned document at
//! `~/.devops-ai-agent/config.toml` (or `$DEVOPS_AGENT_CONFIG`).
//! Precedence: env vars > config file > defaults.

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::monitor::patterns::{PatternMatcher, Severity};

/// Directory name under the home directory holding all runtime state.
const RUNTIME_DIR_NAME: &str = ".devops-ai-agent";

/// Errors that make the configuration unusable. Fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A log pattern failed to compile.
    #[error("invalid log pattern {pattern:?}: {source}")]
    InvalidPattern {
        /// The offending pattern text.
        pattern: String,
        /// Underlying regex compilation error.
        #[source]
        source: regex::Error,
    },
    /// A required field is empty or absent.
    #[error("missing required config value: {0}")]
    Missing(&'static str),
    /// A field holds a value outside its accepted range.
    #[error("invalid config value for {field}: {reason}")]
    Invalid {
        /// Dotted field name.
        field: &'static str,
        /// Why the value was rejected.
        reason: String,
    },
}

// ---------------------------------------------------------------------------
// Runtime paths
// ---------------------------------------------------------------------------

/// Resolved filesystem locations used by the agent.
#[derive(Debug, Clone)]
pub struct RuntimePaths {
    /// Root runtime directory (`~/.devops-ai-agent`).
    pub root: PathBuf,
    /// Main configuration document.
    pub config_toml: PathBuf,
    /// Optional `.env` credentials file.
    pub env_file: PathBuf,
    /// Directory for rolling JSON logs.
    pub logs_dir: PathBuf,
    /// Persisted source cursors.
    pub cursor_state: PathBuf,
    /// JSONL file receiving sink records.
    pub results_jsonl: PathBuf,
}

impl RuntimePaths {
    /// Build the path layout rooted at `root`.
    pub fn under(root: PathBuf) -> Self {
        Self {
            config_toml: root.join("config.toml"),
            env_file: root.join(".env"),
            logs_dir: root.join("logs"),
            cursor_state: root.join("cursors.json"),
            results_jsonl: root.join("results.jsonl"),
            root,
        }
    }
}

/// Resolve the runtime paths under the user's home directory.
///
/// `$DEVOPS_AGENT_CONFIG` relocates only the config document.
///
/// # Errors
///
/// Returns an error if the home directory cannot be determined.
pub fn runtime_paths() -> anyhow::Result<RuntimePaths> {
    let home = directories::BaseDirs::new()
        .ok_or_else(|| anyhow::anyhow!("cannot determine home directory"))?;
    let mut paths = RuntimePaths::under(home.home_dir().join(RUNTIME_DIR_NAME));
    if let Ok(custom) = std::env::var("DEVOPS_AGENT_CONFIG") {
        if !custom.trim().is_empty() {
            paths.config_toml = PathBuf::from(custom);
        }
    }
    Ok(paths)
}

// ---------------------------------------------------------------------------
// Document
// ---------------------------------------------------------------------------

/// Top-level agent configuration.
#[derive(Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// OpenRouter API key.
    #[serde(default)]
    pub api_key: String,

    /// Model identifier (e.g. "openai/gpt-4o").
    #[serde(default)]
    pub model: String,

    /// Log monitoring settings.
    #[serde(default)]
    pub error_monitoring: ErrorMonitoringConfig,

    /// Remote analysis endpoint, retry and rate-limit settings.
    #[serde(default)]
    pub analysis: AnalysisConfig,

    /// Model catalog settings.
    #[serde(default)]
    pub catalog: CatalogConfig,
}

impl std::fmt::Debug for AgentConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentConfig")
            .field("api_key", &"[REDACTED]")
            .field("model", &self.model)
            .field("error_monitoring", &self.error_monitoring)
            .field("analysis", &self.analysis)
            .field("catalog", &self.catalog)
            .finish()
    }
}

/// A log pattern, either a bare regex or a regex with an explicit severity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PatternSpec {
    /// Regex whose severity is inferred from its keywords.
    Plain(String),
    /// Regex with a fixed severity.
    Detailed {
        /// Case-insensitive regular expression.
        regex: String,
        /// Severity assigned to matching lines.
        severity: Severity,
    },
}

impl PatternSpec {
    /// The regex source text.
    pub fn regex(&self) -> &str {
        match self {
            Self::Plain(regex) | Self::Detailed { regex, .. } => regex,
        }
    }
}

/// `[error_monitoring]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorMonitoringConfig {
    /// Master switch for the `monitor` command.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Seconds between scan ticks.
    #[serde(default = "default_scan_interval")]
    pub scan_interval: u64,

    /// Ordered pattern list.
    #[serde(default = "default_log_patterns")]
    pub log_patterns: Vec<PatternSpec>,

    /// Log files to watch.
    #[serde(default)]
    pub log_files: Vec<PathBuf>,

    /// Minimum seconds between live analyses of one error signature.
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,

    /// Lines of context sent with each matched line.
    #[serde(default = "default_context_lines")]
    pub context_lines: usize,

    /// Upper bound on concurrent analysis workers.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// Seconds in-flight analyses may run after shutdown is requested.
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,

    /// Wake the loop early when a watched file changes.
    #[serde(default)]
    pub wake_on_change: bool,

    /// Start new sources at the current end of file instead of offset 0.
    #[serde(default)]
    pub tail_only: bool,

    /// Persist source cursors between runs.
    #[serde(default = "default_true")]
    pub persist_cursors: bool,
}

impl Default for ErrorMonitoringConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            scan_interval: default_scan_interval(),
            log_patterns: default_log_patterns(),
            log_files: Vec::new(),
            cooldown_secs: default_cooldown_secs(),
            context_lines: default_context_lines(),
            max_workers: default_max_workers(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
            wake_on_change: false,
            tail_only: false,
            persist_cursors: true,
        }
    }
}

/// `[analysis]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisConfig {
    /// API base URL (OpenAI-compatible).
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Hard timeout per HTTP attempt, in seconds.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Retries after the first attempt for transient failures.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// First backoff delay in milliseconds.
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    /// Backoff ceiling in seconds.
    #[serde(default = "default_max_backoff_secs")]
    pub max_backoff_secs: u64,

    /// Jitter ratio applied to each backoff delay (0.0 - 1.0).
    #[serde(default = "default_jitter")]
    pub jitter: f64,

    /// Global outbound request budget per minute.
    #[serde(default = "default_requests_per_minute")]
    pub requests_per_minute: u32,

    /// Byte cap for the excerpt sent with each request.
    #[serde(default = "default_max_excerpt_bytes")]
    pub max_excerpt_bytes: usize,

    /// Maximum completion tokens requested from the model.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            request_timeout_secs: default_request_timeout_secs(),
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_secs: default_max_backoff_secs(),
            jitter: default_jitter(),
            requests_per_minute: default_requests_per_minute(),
            max_excerpt_bytes: default_max_excerpt_bytes(),
            max_tokens: default_max_tokens(),
        }
    }
}

/// `[catalog]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogConfig {
    /// Models offered when the remote catalog cannot be fetched.
    #[serde(default = "default_fallback_models")]
    pub fallback_models: Vec<String>,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            fallback_models: default_fallback_models(),
        }
    }
}

// Default value functions for serde

fn default_true() -> bool {
    true
}
fn default_scan_interval() -> u64 {
    300
}
fn default_log_patterns() -> Vec<PatternSpec> {
    ["error:", "exception", "failure", "fatal", "critical"]
        .into_iter()
        .map(|p| PatternSpec::Plain(p.to_owned()))
        .collect()
}
fn default_cooldown_secs() -> u64 {
    600
}
fn default_context_lines() -> usize {
    20
}
fn default_max_workers() -> usize {
    4
}
fn default_shutdown_grace_secs() -> u64 {
    10
}
fn default_base_url() -> String {
    "https://openrouter.ai/api/v1".to_owned()
}
fn default_request_timeout_secs() -> u64 {
    10
}
fn default_max_retries() -> u32 {
    3
}
fn default_initial_backoff_ms() -> u64 {
    1000
}
fn default_max_backoff_secs() -> u64 {
    10
}
fn default_jitter() -> f64 {
    0.1
}
fn default_requests_per_minute() -> u32 {
    20
}
fn default_max_excerpt_bytes() -> usize {
    8000
}
fn default_max_tokens() -> u32 {
    1024
}
fn default_fallback_models() -> Vec<String> {
    [
        "anthropic/claude-3-opus",
        "anthropic/claude-3-sonnet",
        "anthropic/claude-3-haiku",
        "google/gemini-pro",
        "google/gemini-1.5-pro",
        "openai/gpt-4o",
        "openai/gpt-4-turbo",
        "openai/gpt-3.5-turbo",
        "meta/llama-3-70b-instruct",
        "mistralai/mixtral-8x7b",
        "mistralai/mistral-7b-instruct",
    ]
    .into_iter()
    .map(str::to_owned)
    .collect()
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self::with_credentials(String::new(), String::new())
    }
}

impl AgentConfig {
    /// A fresh configuration with the given credential and model and all
    /// other sections at their defaults.
    pub fn with_credentials(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model: model.into(),
            error_monitoring: ErrorMonitoringConfig::default(),
            analysis: AnalysisConfig::default(),
            catalog: CatalogConfig::default(),
        }
    }

    /// Parse a TOML string into config (no env overrides).
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is malformed.
    pub fn from_toml(toml_str: &str) -> anyhow::Result<Self> {
        toml::from_str(toml_str).context("failed to parse config TOML")
    }

    /// Apply environment variable overrides (env > config > defaults).
    ///
    /// Takes a resolver function so tests never touch the process env.
    pub fn apply_overrides(&mut self, env: impl Fn(&str) -> Option<String>) {
        if let Some(key) = env("DEVOPS_AGENT_API_KEY").or_else(|| env("OPENROUTER_API_KEY")) {
            if !key.trim().is_empty() {
                self.api_key = key;
            }
        }
        if let Some(model) = env("DEVOPS_AGENT_MODEL") {
            if !model.trim().is_empty() {
                self.model = model;
            }
        }
        if let Some(v) = env("DEVOPS_AGENT_SCAN_INTERVAL") {
            match v.parse() {
                Ok(n) => self.error_monitoring.scan_interval = n,
                Err(_) => tracing::warn!(
                    var = "DEVOPS_AGENT_SCAN_INTERVAL",
                    value = %v,
                    "ignoring invalid env override"
                ),
            }
        }
    }

    /// Check required fields and value ranges.
    ///
    /// Also compiles every log pattern.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError`] found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.api_key.trim().is_empty() {
            return Err(ConfigError::Missing("api_key"));
        }
        if self.model.trim().is_empty() {
            return Err(ConfigError::Missing("model"));
        }
        let monitoring = &self.error_monitoring;
        if monitoring.scan_interval == 0 {
            return Err(ConfigError::Invalid {
                field: "error_monitoring.scan_interval",
                reason: "must be at least 1 second".to_owned(),
            });
        }
        if monitoring.max_workers == 0 {
            return Err(ConfigError::Invalid {
                field: "error_monitoring.max_workers",
                reason: "must be at least 1".to_owned(),
            });
        }
        if monitoring.log_patterns.is_empty() {
            return Err(ConfigError::Missing("error_monitoring.log_patterns"));
        }
        PatternMatcher::new(&monitoring.log_patterns)?;
        if self.analysis.requests_per_minute == 0 {
            return Err(ConfigError::Invalid {
                field: "analysis.requests_per_minute",
                reason: "must be at least 1".to_owned(),
            });
        }
        if !(0.0..=1.0).contains(&self.analysis.jitter) {
            return Err(ConfigError::Invalid {
                field: "analysis.jitter",
                reason: format!("{} is outside 0.0..=1.0", self.analysis.jitter),
            });
        }
        Ok(())
    }

    /// Write the config as TOML with private file permissions.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or any filesystem step fails.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let contents = toml::to_string_pretty(self).context("failed to serialize config")?;
        std::fs::write(path, contents)
            .with_context(|| format!("failed to write config at {}", path.display()))?;
        crate::credentials::enforce_private_file_permissions(path)?;
        Ok(())
    }
}

/// Load the config from a TOML file and apply process env overrides.
///
/// # Errors
///
/// Returns an error if the file cannot be read or parsed.
pub fn load_config(path: &Path) -> anyhow::Result<AgentConfig> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config at {}", path.display()))?;
    let mut config = AgentConfig::from_toml(&contents)
        .with_context(|| format!("failed to parse config at {}", path.display()))?;
    config.apply_overrides(|key| std::env::var(key).ok());
    Ok(config)
}
