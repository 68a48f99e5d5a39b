//! Service configuration read from `iterforge.toml`.
//!
//! Layered configuration (file → `.env`/environment → CLI). Every field has
//! a default, so an empty or missing file is valid.
//!
//! # Configuration File Format
//!
//! ```toml
//! [server]
//! host = "127.0.0.1"
//! port = 7420
//! db_path = "/var/lib/iterforge/iterforge.db"
//! public_url = "http://iterforge.internal:7420"
//!
//! [context]
//! limit = "100k tokens"
//!
//! [classifier]
//! backend = "claude-cli"   # or "http", "rules"
//! claude_cmd = "claude"
//! model = "claude-3-5-haiku-latest"
//! timeout_secs = 20
//!
//! [distributor]
//! subscriber_buffer = 256
//! idle_timeout_secs = 3600
//! sweep_interval_secs = 300
//!
//! [consumer]
//! reconnect_delay_secs = 5
//! max_consecutive_failures = 2
//!
//! [worker]
//! endpoint = "http://generator.internal/run"
//!
//! [logging]
//! level = "info"
//! format = "json"
//! dir = "/var/log/iterforge"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::consumer::ConsumerConfig;
use crate::context::{ContextBudget, parse_context_limit};
use crate::distributor::DistributorConfig;

pub const CONFIG_FILE_NAME: &str = "iterforge.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// SQLite file; defaults to the user data directory
    #[serde(default)]
    pub db_path: Option<PathBuf>,
    /// Externally reachable base URL, used for worker callbacks
    #[serde(default)]
    pub public_url: Option<String>,
    /// Permissive CORS for local frontends
    #[serde(default)]
    pub dev: bool,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    7420
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            db_path: None,
            public_url: None,
            dev: false,
        }
    }
}

impl ServerSection {
    pub fn resolved_db_path(&self) -> PathBuf {
        self.db_path.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("iterforge")
                .join("iterforge.db")
        })
    }

    /// Base URL handed to remote workers for progress callbacks.
    pub fn callback_base(&self) -> String {
        self.public_url
            .clone()
            .unwrap_or_else(|| format!("http://{}:{}", self.host, self.port))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextSection {
    /// Characters ("400000") or tokens ("100k tokens", "100000t")
    #[serde(default = "default_context_limit")]
    pub limit: String,
}

fn default_context_limit() -> String {
    crate::context::MAX_CONTEXT_CHARS.to_string()
}

impl Default for ContextSection {
    fn default() -> Self {
        Self {
            limit: default_context_limit(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ClassifierBackend {
    Rules,
    #[default]
    ClaudeCli,
    Http,
}

impl std::fmt::Display for ClassifierBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClassifierBackend::Rules => write!(f, "rules"),
            ClassifierBackend::ClaudeCli => write!(f, "claude-cli"),
            ClassifierBackend::Http => write!(f, "http"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierSection {
    #[serde(default)]
    pub backend: ClassifierBackend,
    /// Claude CLI command (default: "claude")
    #[serde(default)]
    pub claude_cmd: Option<String>,
    #[serde(default = "default_model")]
    pub model: String,
    /// Prefer the ANTHROPIC_API_KEY environment variable over the file.
    #[serde(default, skip_serializing)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub api_url: Option<String>,
    #[serde(default = "default_classify_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_model() -> String {
    "claude-3-5-haiku-latest".to_string()
}

fn default_classify_timeout_secs() -> u64 {
    20
}

impl Default for ClassifierSection {
    fn default() -> Self {
        Self {
            backend: ClassifierBackend::default(),
            claude_cmd: None,
            model: default_model(),
            api_key: None,
            api_url: None,
            timeout_secs: default_classify_timeout_secs(),
        }
    }
}

impl ClassifierSection {
    pub fn claude_cmd(&self) -> String {
        self.claude_cmd.clone().unwrap_or_else(|| "claude".to_string())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistributorSection {
    #[serde(default = "default_subscriber_buffer")]
    pub subscriber_buffer: usize,
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

fn default_subscriber_buffer() -> usize {
    256
}

fn default_idle_timeout_secs() -> u64 {
    60 * 60
}

fn default_sweep_interval_secs() -> u64 {
    5 * 60
}

impl Default for DistributorSection {
    fn default() -> Self {
        Self {
            subscriber_buffer: default_subscriber_buffer(),
            idle_timeout_secs: default_idle_timeout_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerSection {
    #[serde(default = "default_reconnect_delay_secs")]
    pub reconnect_delay_secs: u64,
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,
}

fn default_reconnect_delay_secs() -> u64 {
    5
}

fn default_max_consecutive_failures() -> u32 {
    2
}

impl Default for ConsumerSection {
    fn default() -> Self {
        Self {
            reconnect_delay_secs: default_reconnect_delay_secs(),
            max_consecutive_failures: default_max_consecutive_failures(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerSection {
    /// Remote generation service; runs end in `error` when unset
    #[serde(default)]
    pub endpoint: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSection {
    /// Default `EnvFilter` directive; `RUST_LOG` wins when set
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
    /// Also write daily-rotated log files here
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
            dir: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub context: ContextSection,
    #[serde(default)]
    pub classifier: ClassifierSection,
    #[serde(default)]
    pub distributor: DistributorSection,
    #[serde(default)]
    pub consumer: ConsumerSection,
    #[serde(default)]
    pub worker: WorkerSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

impl ServiceConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
            .with_context(|| format!("Invalid config file: {}", path.display()))
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse iterforge.toml")
    }

    /// Load from `explicit` if given (it must exist), else the first of
    /// `./iterforge.toml` and `<config dir>/iterforge/iterforge.toml`, else
    /// defaults. Returns the file actually used.
    pub fn discover(explicit: Option<&Path>) -> Result<(Self, Option<PathBuf>)> {
        if let Some(path) = explicit {
            return Ok((Self::load(path)?, Some(path.to_path_buf())));
        }
        for candidate in default_search_paths() {
            if candidate.is_file() {
                let config = Self::load(&candidate)?;
                return Ok((config, Some(candidate)));
            }
        }
        Ok((Self::default(), None))
    }

    /// Apply overrides from the process environment, after loading `.env`.
    pub fn apply_env(&mut self) -> Result<()> {
        let _ = dotenvy::dotenv();
        self.apply_env_with(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary lookup.
    pub fn apply_env_with(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(port) = lookup("ITERFORGE_PORT") {
            self.server.port = port
                .trim()
                .parse()
                .with_context(|| format!("Invalid ITERFORGE_PORT: {}", port))?;
        }
        if let Some(path) = lookup("ITERFORGE_DB_PATH") {
            self.server.db_path = Some(PathBuf::from(path));
        }
        if let Some(level) = lookup("ITERFORGE_LOG") {
            self.logging.level = level;
        }
        if let Some(url) = lookup("ITERFORGE_WORKER_URL") {
            self.worker.endpoint = Some(url);
        }
        if self.classifier.claude_cmd.is_none()
            && let Some(cmd) = lookup("CLAUDE_CMD")
        {
            self.classifier.claude_cmd = Some(cmd);
        }
        if let Some(key) = lookup("ANTHROPIC_API_KEY") {
            self.classifier.api_key = Some(key);
        }
        Ok(())
    }

    pub fn context_budget(&self) -> Result<ContextBudget> {
        let limit = parse_context_limit(&self.context.limit)
            .context("Invalid [context] limit")?;
        Ok(ContextBudget::new(limit))
    }

    pub fn distributor_config(&self) -> DistributorConfig {
        DistributorConfig {
            subscriber_buffer: self.distributor.subscriber_buffer,
            idle_timeout: Duration::from_secs(self.distributor.idle_timeout_secs),
            sweep_interval: Duration::from_secs(self.distributor.sweep_interval_secs),
        }
    }

    pub fn consumer_config(&self) -> ConsumerConfig {
        ConsumerConfig {
            reconnect_delay: Duration::from_secs(self.consumer.reconnect_delay_secs),
            max_consecutive_failures: self.consumer.max_consecutive_failures,
        }
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if let Err(e) = parse_context_limit(&self.context.limit) {
            warnings.push(format!("Invalid context limit '{}': {}", self.context.limit, e));
        }
        if self.classifier.backend == ClassifierBackend::Http && self.classifier.api_key.is_none() {
            warnings.push(
                "classifier backend 'http' needs ANTHROPIC_API_KEY; falling back to rules".to_string(),
            );
        }
        if self.classifier.timeout_secs == 0 {
            warnings.push("classifier timeout_secs is 0; every model call will time out".to_string());
        }
        if self.distributor.subscriber_buffer == 0 {
            warnings.push("distributor subscriber_buffer is 0; using 1".to_string());
        }
        if self.distributor.sweep_interval_secs == 0 {
            warnings.push("distributor sweep_interval_secs is 0".to_string());
        }
        if self.consumer.max_consecutive_failures == 0 {
            warnings.push("consumer max_consecutive_failures is 0; consumers give up immediately".to_string());
        }
        if self.worker.endpoint.is_none() {
            warnings.push("no [worker] endpoint configured; runs will end in error".to_string());
        }

        warnings
    }
}

fn default_search_paths() -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from(CONFIG_FILE_NAME)];
    if let Some(dir) = dirs::config_dir() {
        paths.push(dir.join("iterforge").join(CONFIG_FILE_NAME));
    }
    paths
}
