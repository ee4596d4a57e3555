//! Auto-pilot configuration.
//!
//! Sources, highest priority first: CLI flags ([`ConfigOverrides`]), a JSON
//! config file with camelCase keys, the `ANTHROPIC_API_KEY` environment
//! variable, and built-in defaults.

use crate::error::ConfigError;
use crate::patterns::PatternTable;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

pub const DEFAULT_IDLE_TIMEOUT_MS: u64 = 1500;
pub const DEFAULT_QUIET_PERIOD_MS: u64 = 400;
pub const MIN_IDLE_TIMEOUT_MS: u64 = 500;
pub const MAX_IDLE_TIMEOUT_MS: u64 = 5000;
pub const API_KEY_ENV: &str = "ANTHROPIC_API_KEY";

/// Language model used for auto-responses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Model {
    Haiku,
    Sonnet,
}

impl Model {
    /// Provider-side model identifier
    pub fn api_id(self) -> &'static str {
        match self {
            Model::Haiku => "claude-3-5-haiku-latest",
            Model::Sonnet => "claude-sonnet-4-20250514",
        }
    }
}

/// Bytes appended when a line is submitted to the agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LineTerminator {
    Lf,
    Cr,
    Crlf,
}

impl LineTerminator {
    pub fn as_str(self) -> &'static str {
        match self {
            LineTerminator::Lf => "\n",
            LineTerminator::Cr => "\r",
            LineTerminator::Crlf => "\r\n",
        }
    }
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    /// Whether detected prompts are answered automatically
    pub enabled: bool,
    /// Free-form guidance passed to the language model
    pub instructions: String,
    /// Silence before a streaming message is completed
    pub idle_timeout_ms: u64,
    /// Silence before heuristic prompt patterns are evaluated
    pub quiet_period_ms: u64,
    pub model: Model,
    pub api_key: String,
    /// Extra prompt regexes, appended after the built-in ones
    pub prompt_patterns: Vec<String>,
    /// Explicit agent binary; resolved from PATH when absent
    pub binary_path: Option<PathBuf>,
    pub binary_args: Vec<String>,
    pub line_terminator: LineTerminator,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            enabled: true,
            instructions: String::new(),
            idle_timeout_ms: DEFAULT_IDLE_TIMEOUT_MS,
            quiet_period_ms: DEFAULT_QUIET_PERIOD_MS,
            model: Model::Haiku,
            api_key: String::new(),
            prompt_patterns: Vec::new(),
            binary_path: None,
            binary_args: Vec::new(),
            line_terminator: LineTerminator::Lf,
        }
    }
}

// Hand-written so the API key never reaches the logs.
impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("enabled", &self.enabled)
            .field("instructions", &self.instructions)
            .field("idle_timeout_ms", &self.idle_timeout_ms)
            .field("quiet_period_ms", &self.quiet_period_ms)
            .field("model", &self.model)
            .field("api_key", &if self.api_key.is_empty() { "<unset>" } else { "<redacted>" })
            .field("prompt_patterns", &self.prompt_patterns)
            .field("binary_path", &self.binary_path)
            .field("binary_args", &self.binary_args)
            .field("line_terminator", &self.line_terminator)
            .finish()
    }
}

impl Config {
    /// Load a JSON config file. Missing keys take their defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Fill the API key from the environment when no other source set it.
    pub fn fill_from_env(&mut self) {
        if self.api_key.trim().is_empty() {
            if let Ok(key) = std::env::var(API_KEY_ENV) {
                self.api_key = key;
            }
        }
    }

    /// Clamp numeric ranges and reject prompt patterns that do not compile.
    pub fn validate(mut self) -> Result<Self, ConfigError> {
        self.idle_timeout_ms = self
            .idle_timeout_ms
            .clamp(MIN_IDLE_TIMEOUT_MS, MAX_IDLE_TIMEOUT_MS);
        let mut probe = PatternTable::new();
        for pattern in &self.prompt_patterns {
            probe
                .push(pattern, ())
                .map_err(|source| ConfigError::Pattern {
                    pattern: pattern.clone(),
                    source,
                })?;
        }
        Ok(self)
    }
}

/// Values given on the command line; they win over the config file and are
/// re-applied on every live reload.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub enabled: Option<bool>,
    pub instructions: Option<String>,
    pub idle_timeout_ms: Option<u64>,
    pub quiet_period_ms: Option<u64>,
    pub model: Option<Model>,
    pub api_key: Option<String>,
    pub prompt_patterns: Vec<String>,
    pub binary_path: Option<PathBuf>,
    pub binary_args: Vec<String>,
    pub line_terminator: Option<LineTerminator>,
}

impl ConfigOverrides {
    pub fn apply(&self, mut config: Config) -> Config {
        if let Some(enabled) = self.enabled {
            config.enabled = enabled;
        }
        if let Some(instructions) = &self.instructions {
            config.instructions = instructions.clone();
        }
        if let Some(ms) = self.idle_timeout_ms {
            config.idle_timeout_ms = ms;
        }
        if let Some(ms) = self.quiet_period_ms {
            config.quiet_period_ms = ms;
        }
        if let Some(model) = self.model {
            config.model = model;
        }
        if let Some(key) = self.api_key.as_ref().filter(|k| !k.trim().is_empty()) {
            config.api_key = key.clone();
        }
        config
            .prompt_patterns
            .extend(self.prompt_patterns.iter().cloned());
        if let Some(path) = &self.binary_path {
            config.binary_path = Some(path.clone());
        }
        if !self.binary_args.is_empty() {
            config.binary_args = self.binary_args.clone();
        }
        if let Some(terminator) = self.line_terminator {
            config.line_terminator = terminator;
        }
        config
    }

    /// File (optional) + overrides + environment, validated.
    pub fn resolve(&self, file: Option<&Path>) -> Result<Config, ConfigError> {
        let base = match file {
            Some(path) => Config::load(path)?,
            None => Config::default(),
        };
        let mut config = self.apply(base);
        config.fill_from_env();
        config.validate()
    }
}
