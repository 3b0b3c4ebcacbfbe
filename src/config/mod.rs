//! Configuration management for linksite
//!
//! This module handles loading and validating configuration from environment
//! variables and TOML files. Tunable selection weights live in the store and
//! are handled by [`weights`].

pub mod weights;

pub use weights::{ScoreWeights, WeightKey};

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Database configuration
    pub database: DatabaseConfig,

    /// Rotation engine configuration
    pub director: DirectorConfig,

    /// Enrichment worker configuration
    pub worker: WorkerConfig,

    /// External API endpoints and limits
    pub apis: ApisConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// SQLite database path
    pub sqlite_path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            sqlite_path: PathBuf::from("data/linksite.db"),
        }
    }
}

/// Rotation engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectorConfig {
    /// Fixed tick interval in seconds
    pub tick_interval_secs: u64,

    /// Sleep after a tick that found no eligible candidate
    pub idle_backoff_secs: u64,

    /// Run score propagation every N completed rotations (0 disables it)
    pub propagate_every: u64,

    /// Seed for the selection RNG; entropy when unset
    pub seed: Option<u64>,
}

impl Default for DirectorConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: 2,
            idle_backoff_secs: 10,
            propagate_every: 10,
            seed: None,
        }
    }
}

/// Enrichment worker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Fixed tick interval in seconds
    pub tick_interval_secs: u64,

    /// Attempts before a task is marked dead
    pub max_attempts: u32,

    /// Upper bound on a single task execution
    pub task_timeout_secs: u64,

    /// Monthly spend cap for metered AI calls
    pub monthly_budget_usd: f64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: 10,
            max_attempts: 3,
            task_timeout_secs: 30,
            monthly_budget_usd: 50.0,
        }
    }
}

impl WorkerConfig {
    #[must_use]
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }

    #[must_use]
    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs)
    }
}

/// External API configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ApisConfig {
    pub anthropic: AnthropicConfig,
    pub reddit: RedditConfig,
    pub hn: HackerNewsConfig,
}

impl ApisConfig {
    /// Requests-per-minute quota keyed by API name
    pub fn quotas(&self) -> Vec<(&'static str, u32)> {
        vec![
            ("anthropic", self.anthropic.requests_per_minute),
            ("reddit", self.reddit.requests_per_minute),
            ("hn", self.hn.requests_per_minute),
        ]
    }
}

fn default_user_agent() -> String {
    format!("linksite/{}", env!("CARGO_PKG_VERSION"))
}

/// Anthropic Messages API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnthropicConfig {
    pub base_url: String,

    /// API key; normally supplied through `ANTHROPIC_API_KEY`
    #[serde(skip_serializing)]
    pub api_key: Option<String>,

    pub model: String,

    pub max_tokens: u32,

    pub requests_per_minute: u32,
}

impl Default for AnthropicConfig {
    fn default() -> Self {
        Self {
            base_url: String::from("https://api.anthropic.com"),
            api_key: None,
            model: String::from("claude-3-5-sonnet-20241022"),
            max_tokens: 200,
            requests_per_minute: 50,
        }
    }
}

/// Reddit discussion lookup configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedditConfig {
    pub base_url: String,
    pub user_agent: String,
    pub requests_per_minute: u32,
}

impl Default for RedditConfig {
    fn default() -> Self {
        Self {
            base_url: String::from("https://www.reddit.com"),
            user_agent: default_user_agent(),
            requests_per_minute: 30,
        }
    }
}

/// Hacker News (Algolia) discussion lookup configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HackerNewsConfig {
    pub base_url: String,
    pub user_agent: String,
    pub requests_per_minute: u32,
}

impl Default for HackerNewsConfig {
    fn default() -> Self {
        Self {
            base_url: String::from("https://hn.algolia.com"),
            user_agent: default_user_agent(),
            requests_per_minute: 60,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (text, json)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: String::from("info"),
            format: String::from("text"),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse::<T>().ok())
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env();
        Ok(config)
    }

    /// Load configuration from a TOML file, then apply environment overrides
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::with_source(
                format!("Failed to read config file: {}", path.display()),
                e,
            )
        })?;

        let mut config: Self = toml::from_str(&content).map_err(|e| {
            Error::config(format!(
                "Failed to parse TOML config file {}: {e}",
                path.display()
            ))
        })?;
        config.apply_env();

        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(path) = std::env::var("LINKSITE_SQLITE_PATH") {
            self.database.sqlite_path = PathBuf::from(path);
        }
        if let Some(v) = env_parse("LINKSITE_DIRECTOR_TICK_SECS") {
            self.director.tick_interval_secs = v;
        }
        if let Some(v) = env_parse("LINKSITE_DIRECTOR_SEED") {
            self.director.seed = Some(v);
        }
        if let Some(v) = env_parse("LINKSITE_WORKER_TICK_SECS") {
            self.worker.tick_interval_secs = v;
        }
        if let Some(v) = env_parse("LINKSITE_MAX_ATTEMPTS") {
            self.worker.max_attempts = v;
        }
        if let Some(v) = env_parse("LINKSITE_MONTHLY_BUDGET_USD") {
            self.worker.monthly_budget_usd = v;
        }
        if let Ok(key) = std::env::var("ANTHROPIC_API_KEY") {
            if !key.trim().is_empty() {
                self.apis.anthropic.api_key = Some(key);
            }
        }
        if let Ok(level) = std::env::var("LINKSITE_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(format) = std::env::var("LINKSITE_LOG_FORMAT") {
            self.logging.format = format;
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.director.tick_interval_secs == 0 {
            return Err(Error::config("director.tick_interval_secs must be greater than 0"));
        }

        if self.worker.tick_interval_secs == 0 {
            return Err(Error::config("worker.tick_interval_secs must be greater than 0"));
        }

        if self.worker.max_attempts == 0 {
            return Err(Error::config("worker.max_attempts must be greater than 0"));
        }

        if self.worker.task_timeout_secs == 0 {
            return Err(Error::config("worker.task_timeout_secs must be greater than 0"));
        }

        if !self.worker.monthly_budget_usd.is_finite() || self.worker.monthly_budget_usd < 0.0 {
            return Err(Error::config("worker.monthly_budget_usd must be a non-negative number"));
        }

        for (api, rpm) in self.apis.quotas() {
            if rpm == 0 {
                return Err(Error::config(format!(
                    "apis.{api}.requests_per_minute must be greater than 0"
                )));
            }
        }

        if !matches!(self.logging.format.as_str(), "text" | "json") {
            return Err(Error::config(format!(
                "logging.format must be 'text' or 'json', got '{}'",
                self.logging.format
            )));
        }

        Ok(())
    }

    #[must_use]
    pub fn director_tick(&self) -> Duration {
        Duration::from_secs(self.director.tick_interval_secs)
    }

    #[must_use]
    pub fn worker_tick(&self) -> Duration {
        self.worker.tick_interval()
    }

    #[must_use]
    pub fn task_timeout(&self) -> Duration {
        self.worker.task_timeout()
    }
}
