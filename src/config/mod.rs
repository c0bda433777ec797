//! Configuration for the proxy server
//!
//! Configuration is loaded in order of precedence:
//! 1. Environment variables (highest priority)
//! 2. Config file (~/.config/ccproxy/config.toml or --config path)
//! 3. Built-in defaults (lowest priority)

use anyhow::Context;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

// ─────────────────────────────────────────────────────────────────────────────
// Submodules
// ─────────────────────────────────────────────────────────────────────────────

mod providers;
mod transformers;

pub use providers::{ProviderConfig, ProviderType, Tier};
pub use transformers::TransformerConfig;

/// Version info
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// ─────────────────────────────────────────────────────────────────────────────
// Application Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Address to bind the proxy server to
    pub bind_addr: SocketAddr,

    /// Shared client secret; when unset any token is accepted
    pub api_key: Option<String>,

    /// Path to the SQLite history database
    pub db_path: PathBuf,

    /// Log level when RUST_LOG is unset
    pub log_level: String,

    /// Optional directory for rotated file logs
    pub log_dir: Option<PathBuf>,

    /// Per-request upstream timeout
    pub request_timeout_secs: u64,

    /// Retry budget for connect/timeout upstream failures
    pub upstream_retries: u32,

    /// Ceiling applied to translated max_tokens
    pub max_tokens_limit: u32,

    /// Floor applied to translated max_tokens
    pub min_tokens_limit: u32,

    /// Tier defaults, `Provider:model` or bare model
    pub big_model: Option<String>,
    pub middle_model: Option<String>,
    pub small_model: Option<String>,

    /// Provider catalog, in file order
    pub providers: Vec<ProviderConfig>,

    /// Transformer table, in file order
    pub transformers: Vec<TransformerConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8082".parse().unwrap(),
            api_key: None,
            db_path: PathBuf::from("./data/ccproxy.db"),
            log_level: "info".to_string(),
            log_dir: None,
            request_timeout_secs: 90,
            upstream_retries: 2,
            max_tokens_limit: 16384,
            min_tokens_limit: 1,
            big_model: None,
            middle_model: None,
            small_model: None,
            providers: Vec::new(),
            transformers: Vec::new(),
        }
    }
}

impl Config {
    /// Default selection for a tier, if configured
    pub fn tier_default(&self, tier: Tier) -> Option<&str> {
        match tier {
            Tier::Big => self.big_model.as_deref(),
            Tier::Middle => self.middle_model.as_deref(),
            Tier::Small => self.small_model.as_deref(),
        }
    }

    /// Look up a provider by catalog name (case-insensitive)
    pub fn provider(&self, name: &str) -> Option<&ProviderConfig> {
        self.providers
            .iter()
            .find(|p| p.name.eq_ignore_ascii_case(name))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// File Configuration (deserialization layer)
// ─────────────────────────────────────────────────────────────────────────────

/// Config file structure
#[derive(Debug, Deserialize, Default)]
struct FileConfig {
    /// The [config] table of server knobs
    config: Option<FileServerConfig>,

    /// Repeated [[provider]] tables
    #[serde(default)]
    provider: Vec<ProviderConfig>,

    /// The [transformers] table, kept raw to preserve file order
    transformers: Option<toml::Table>,
}

#[derive(Debug, Deserialize, Default)]
struct FileServerConfig {
    bind_addr: Option<String>,
    api_key: Option<String>,
    db_path: Option<String>,
    log_level: Option<String>,
    log_dir: Option<String>,
    request_timeout_secs: Option<u64>,
    upstream_retries: Option<u32>,
    max_tokens_limit: Option<u32>,
    min_tokens_limit: Option<u32>,
    big_model: Option<String>,
    middle_model: Option<String>,
    small_model: Option<String>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Configuration Loading
// ─────────────────────────────────────────────────────────────────────────────

impl Config {
    /// Default config file path: ~/.config/ccproxy/config.toml
    pub fn default_path() -> Option<PathBuf> {
        dirs::home_dir().map(|p| p.join(".config").join("ccproxy").join("config.toml"))
    }

    /// Load configuration: file -> env vars -> defaults
    ///
    /// An explicitly passed path must exist; the default path is optional.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let file = match path {
            Some(p) => Self::parse_file(p)
                .with_context(|| format!("failed to load config file {}", p.display()))?,
            None => match Self::default_path() {
                Some(p) if p.exists() => Self::parse_file(&p)
                    .with_context(|| format!("failed to load config file {}", p.display()))?,
                _ => FileConfig::default(),
            },
        };
        Self::from_file(file)
    }

    fn parse_file(path: &Path) -> anyhow::Result<FileConfig> {
        let contents = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    fn from_file(file: FileConfig) -> anyhow::Result<Self> {
        let server = file.config.unwrap_or_default();
        let defaults = Self::default();

        // Bind address: env > file > default
        let bind_addr = std::env::var("CCPROXY_BIND")
            .ok()
            .or(server.bind_addr)
            .map(|s| s.parse().context("invalid bind address"))
            .transpose()?
            .unwrap_or(defaults.bind_addr);

        // Shared secret: env > file (absent means accept any token)
        let api_key = std::env::var("CCPROXY_API_KEY").ok().or(server.api_key);

        // Database path: env > file > default
        let db_path = std::env::var("CCPROXY_DB")
            .ok()
            .or(server.db_path)
            .map(PathBuf::from)
            .unwrap_or(defaults.db_path);

        let transformers = TransformerConfig::from_table(file.transformers)?;

        let config = Self {
            bind_addr,
            api_key,
            db_path,
            log_level: server.log_level.unwrap_or(defaults.log_level),
            log_dir: server.log_dir.map(PathBuf::from),
            request_timeout_secs: server
                .request_timeout_secs
                .unwrap_or(defaults.request_timeout_secs),
            upstream_retries: server.upstream_retries.unwrap_or(defaults.upstream_retries),
            max_tokens_limit: server.max_tokens_limit.unwrap_or(defaults.max_tokens_limit),
            min_tokens_limit: server.min_tokens_limit.unwrap_or(defaults.min_tokens_limit),
            big_model: server.big_model,
            middle_model: server.middle_model,
            small_model: server.small_model,
            providers: file.provider,
            transformers,
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        for p in &self.providers {
            anyhow::ensure!(!p.name.is_empty(), "provider with empty name");
            anyhow::ensure!(
                !p.base_url.is_empty(),
                "provider {} has empty base_url",
                p.name
            );
        }
        anyhow::ensure!(
            self.min_tokens_limit <= self.max_tokens_limit,
            "min_tokens_limit exceeds max_tokens_limit"
        );
        Ok(())
    }
}
