//! Configuration loading and management for codeloom.
//!
//! Config is loaded from `~/.codeloom/config.toml` (or an explicit path) and
//! then overlaid with environment variables. A missing file yields defaults.
//!
//! ```toml
//! workspace_root = "/home/me/project"
//!
//! [providers.anthropic]
//! api_key = "sk-ant-..."
//!
//! [agents]
//! coder = "claude-3.7-sonnet"
//! title = "claude-3.5-haiku"
//!
//! [runtime]
//! max_iterations = 25
//! ```

use codeloom_core::model::ModelInfo;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Root configuration structure.
#[derive(Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Directory the file tools are confined to (defaults to the current directory)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_root: Option<PathBuf>,

    /// Where the session database lives (defaults to `~/.codeloom/data`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,

    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,

    #[serde(default)]
    pub agents: AgentsConfig,

    #[serde(default)]
    pub runtime: RuntimeConfig,

    #[serde(default)]
    pub http: HttpConfig,

    #[serde(default)]
    pub tools: ToolsConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    /// Extra catalog entries (self-hosted or newly released models)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub models: Vec<ModelInfo>,
}

#[derive(Clone, Default, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Override the vendor's base URL (proxies, self-hosted gateways)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_url: Option<String>,

    #[serde(default)]
    pub disabled: bool,
}

/// Model IDs per agent role.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentsConfig {
    #[serde(default = "default_coder_model")]
    pub coder: String,

    /// Model used by the `agent` tool's sub-agents
    #[serde(default = "default_coder_model")]
    pub task: String,

    #[serde(default = "default_title_model")]
    pub title: String,

    #[serde(default = "default_coder_model")]
    pub summarizer: String,

    /// Overrides each model's default completion budget
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    /// Project instruction files appended to the coder and task prompts,
    /// relative to the workspace root. A trailing `/` includes a directory.
    #[serde(default = "default_context_paths")]
    pub context_paths: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Provider calls allowed per user turn
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,

    #[serde(default = "default_tool_parallelism")]
    pub tool_parallelism: usize,

    /// Fraction of the context window that triggers summarization
    #[serde(default = "default_compaction_threshold")]
    pub compaction_threshold: f64,

    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,

    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Maximum silence between two stream chunks
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    #[serde(default = "default_bash_timeout_ms")]
    pub bash_default_timeout_ms: u64,

    #[serde(default = "default_bash_max_timeout_ms")]
    pub bash_max_timeout_ms: u64,

    #[serde(default = "default_fetch_max_bytes")]
    pub fetch_max_bytes: usize,

    /// Let `fetch` reach loopback and private-range hosts
    #[serde(default)]
    pub fetch_allow_private: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub json: bool,
}

// --- Default value functions ---

fn default_coder_model() -> String {
    "claude-3.7-sonnet".into()
}
fn default_title_model() -> String {
    "claude-3.5-haiku".into()
}
fn default_context_paths() -> Vec<String> {
    [
        ".github/copilot-instructions.md",
        ".cursorrules",
        ".cursor/rules/",
        "CODELOOM.md",
        "CODELOOM.local.md",
        "AGENTS.md",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}
fn default_max_iterations() -> u32 {
    25
}
fn default_tool_parallelism() -> usize {
    4
}
fn default_compaction_threshold() -> f64 {
    0.85
}
fn default_flush_interval_ms() -> u64 {
    100
}
fn default_shutdown_grace_ms() -> u64 {
    2_000
}
fn default_request_timeout_secs() -> u64 {
    120
}
fn default_idle_timeout_secs() -> u64 {
    60
}
fn default_max_attempts() -> u32 {
    3
}
fn default_base_delay_ms() -> u64 {
    500
}
fn default_max_delay_ms() -> u64 {
    8_000
}
fn default_bash_timeout_ms() -> u64 {
    30_000
}
fn default_bash_max_timeout_ms() -> u64 {
    600_000
}
fn default_fetch_max_bytes() -> usize {
    5 * 1024 * 1024
}
fn default_log_level() -> String {
    "info".into()
}

impl Default for AgentsConfig {
    fn default() -> Self {
        Self {
            coder: default_coder_model(),
            task: default_coder_model(),
            title: default_title_model(),
            summarizer: default_coder_model(),
            max_tokens: None,
            context_paths: default_context_paths(),
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            tool_parallelism: default_tool_parallelism(),
            compaction_threshold: default_compaction_threshold(),
            flush_interval_ms: default_flush_interval_ms(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: default_request_timeout_secs(),
            idle_timeout_secs: default_idle_timeout_secs(),
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            bash_default_timeout_ms: default_bash_timeout_ms(),
            bash_max_timeout_ms: default_bash_max_timeout_ms(),
            fetch_max_bytes: default_fetch_max_bytes(),
            fetch_allow_private: false,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            workspace_root: None,
            data_dir: None,
            providers: HashMap::new(),
            agents: AgentsConfig::default(),
            runtime: RuntimeConfig::default(),
            http: HttpConfig::default(),
            tools: ToolsConfig::default(),
            logging: LoggingConfig::default(),
            models: Vec::new(),
        }
    }
}

fn redact(s: &Option<String>) -> &'static str {
    match s {
        Some(_) => "[REDACTED]",
        None => "None",
    }
}

impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig")
            .field("workspace_root", &self.workspace_root)
            .field("data_dir", &self.data_dir)
            .field("providers", &self.providers)
            .field("agents", &self.agents)
            .field("runtime", &self.runtime)
            .field("http", &self.http)
            .field("tools", &self.tools)
            .field("logging", &self.logging)
            .field("models", &self.models.len())
            .finish()
    }
}

impl std::fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("api_key", &redact(&self.api_key))
            .field("api_url", &self.api_url)
            .field("disabled", &self.disabled)
            .finish()
    }
}

/// Environment variables that supply provider API keys.
const PROVIDER_KEY_VARS: &[(&str, &str)] = &[
    ("anthropic", "ANTHROPIC_API_KEY"),
    ("openai", "OPENAI_API_KEY"),
    ("groq", "GROQ_API_KEY"),
];

impl AppConfig {
    /// Load configuration from the default path (~/.codeloom/config.toml).
    ///
    /// Environment variables are applied on top:
    /// - `ANTHROPIC_API_KEY`, `OPENAI_API_KEY`, `GROQ_API_KEY` (only when the
    ///   file sets no key for that provider)
    /// - `CODELOOM_MODEL` (coder model)
    /// - `CODELOOM_WORKSPACE` (workspace root)
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_dir().join("config.toml");
        Self::load_with_env(&config_path)
    }

    /// Load from `path`, then apply environment overrides.
    pub fn load_with_env(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::load_from(path)?;
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Overlay values from an environment lookup.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        for (provider, var) in PROVIDER_KEY_VARS {
            let Some(key) = lookup(var).filter(|k| !k.is_empty()) else {
                continue;
            };
            let entry = self.providers.entry((*provider).to_string()).or_default();
            if entry.api_key.is_none() {
                entry.api_key = Some(key);
            }
        }

        if let Some(model) = lookup("CODELOOM_MODEL").filter(|m| !m.is_empty()) {
            self.agents.coder = model;
        }

        if let Some(root) = lookup("CODELOOM_WORKSPACE").filter(|r| !r.is_empty()) {
            self.workspace_root = Some(PathBuf::from(root));
        }
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".codeloom")
    }

    /// Workspace root, falling back to the current directory.
    pub fn workspace_root(&self) -> PathBuf {
        self.workspace_root
            .clone()
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from("."))
    }

    pub fn data_dir(&self) -> PathBuf {
        self.data_dir
            .clone()
            .unwrap_or_else(|| Self::config_dir().join("data"))
    }

    /// Path of the SQLite session database.
    pub fn database_path(&self) -> PathBuf {
        self.data_dir().join("codeloom.db")
    }

    /// Settings for `name`, unless the provider is disabled.
    pub fn provider(&self, name: &str) -> Option<&ProviderConfig> {
        self.providers.get(name).filter(|p| !p.disabled)
    }

    /// Whether an enabled provider has an API key.
    pub fn has_api_key(&self, provider: &str) -> bool {
        self.provider(provider)
            .is_some_and(|p| p.api_key.as_deref().is_some_and(|k| !k.is_empty()))
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let fail = |msg: &str| Err(ConfigError::ValidationError(msg.into()));

        if self.runtime.max_iterations == 0 {
            return fail("runtime.max_iterations must be at least 1");
        }
        if self.runtime.tool_parallelism == 0 {
            return fail("runtime.tool_parallelism must be at least 1");
        }
        let threshold = self.runtime.compaction_threshold;
        if !(threshold > 0.0 && threshold <= 1.0) {
            return fail("runtime.compaction_threshold must be in (0.0, 1.0]");
        }
        if self.runtime.flush_interval_ms == 0 {
            return fail("runtime.flush_interval_ms must be > 0");
        }
        if self.http.max_attempts == 0 {
            return fail("http.max_attempts must be at least 1");
        }
        if self.http.request_timeout_secs == 0 || self.http.idle_timeout_secs == 0 {
            return fail("http timeouts must be > 0");
        }
        if self.http.base_delay_ms > self.http.max_delay_ms {
            return fail("http.base_delay_ms must not exceed http.max_delay_ms");
        }
        if self.tools.bash_default_timeout_ms == 0
            || self.tools.bash_default_timeout_ms > self.tools.bash_max_timeout_ms
        {
            return fail("tools.bash_default_timeout_ms must be in (0, bash_max_timeout_ms]");
        }
        if self.tools.fetch_max_bytes == 0 {
            return fail("tools.fetch_max_bytes must be > 0");
        }
        for (role, model) in [
            ("coder", &self.agents.coder),
            ("task", &self.agents.task),
            ("title", &self.agents.title),
            ("summarizer", &self.agents.summarizer),
        ] {
            if model.trim().is_empty() {
                return Err(ConfigError::ValidationError(format!(
                    "agents.{role} must name a model"
                )));
            }
        }
        if self.agents.max_tokens == Some(0) {
            return fail("agents.max_tokens must be > 0");
        }
        for model in &self.models {
            if model.id.is_empty() || model.provider.is_empty() || model.context_window == 0 {
                return Err(ConfigError::ValidationError(format!(
                    "custom model '{}' needs an id, a provider and a context_window",
                    model.id
                )));
            }
        }
        Ok(())
    }

    /// Generate a default config TOML string (for `codeloom init`).
    pub fn default_toml() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

impl From<ConfigError> for codeloom_core::Error {
    fn from(err: ConfigError) -> Self {
        codeloom_core::Error::Config {
            message: err.to_string(),
        }
    }
}
