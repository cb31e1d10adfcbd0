//! Application configuration for bulkresearch.
//!
//! User config lives at `~/.bulkresearch/bulkresearch.toml`.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{BulkResearchError, Result};
use crate::types::{DepthLevel, ModelTier, ResearchCategory};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "bulkresearch.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".bulkresearch";

// ---------------------------------------------------------------------------
// Config structs (matching bulkresearch.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Batch defaults.
    #[serde(default)]
    pub defaults: DefaultsConfig,

    /// Research endpoint settings.
    #[serde(default)]
    pub endpoint: EndpointConfig,

    /// Budget for the constrained model tier.
    #[serde(default)]
    pub budget: BudgetConfig,

    /// Where runs are persisted.
    #[serde(default)]
    pub storage: StorageConfig,
}

/// `[defaults]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsConfig {
    /// Entities per "continue?" checkpoint.
    #[serde(default = "default_window_size")]
    pub window_size: usize,

    /// Pause between consecutive requests within a window.
    #[serde(default = "default_request_delay")]
    pub request_delay_ms: u64,

    /// Per-request timeout, independent of cancellation.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    #[serde(default = "default_category")]
    pub category: ResearchCategory,

    #[serde(default = "default_depth")]
    pub depth: DepthLevel,

    /// Models included when the CLI does not name any.
    #[serde(default = "default_models")]
    pub models: Vec<String>,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            window_size: default_window_size(),
            request_delay_ms: default_request_delay(),
            request_timeout_secs: default_request_timeout(),
            category: default_category(),
            depth: default_depth(),
            models: default_models(),
        }
    }
}

fn default_window_size() -> usize {
    20
}
fn default_request_delay() -> u64 {
    1_000
}
fn default_request_timeout() -> u64 {
    300
}
fn default_category() -> ResearchCategory {
    ResearchCategory::GeneralResearch
}
fn default_depth() -> DepthLevel {
    DepthLevel::Standard
}
fn default_models() -> Vec<String> {
    vec!["perplexity".into(), "openai".into(), "claude".into()]
}

/// `[endpoint]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// Research aggregation endpoint (single POST).
    #[serde(default = "default_endpoint_url")]
    pub url: String,

    /// Name of the env var holding the API key (never store the key itself).
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            url: default_endpoint_url(),
            api_key_env: default_api_key_env(),
        }
    }
}

fn default_endpoint_url() -> String {
    "http://localhost:3000/api/research".into()
}
fn default_api_key_env() -> String {
    "BULKRESEARCH_API_KEY".into()
}

/// `[budget]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetConfig {
    /// The tier whose usage is capped.
    #[serde(default = "default_constrained_tier")]
    pub constrained_tier: ModelTier,

    /// Requests of the constrained tier allowed per calendar month (UTC).
    #[serde(default = "default_monthly_limit")]
    pub monthly_limit: u64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            constrained_tier: default_constrained_tier(),
            monthly_limit: default_monthly_limit(),
        }
    }
}

fn default_constrained_tier() -> ModelTier {
    ModelTier::SonarDeepResearch
}
fn default_monthly_limit() -> u64 {
    50
}

/// `[storage]` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Database path; defaults to `~/.bulkresearch/bulkresearch.db`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub db_path: Option<String>,
}

impl StorageConfig {
    /// Resolve the database path, falling back to the config directory.
    pub fn resolved_db_path(&self) -> Result<PathBuf> {
        match &self.db_path {
            Some(p) => Ok(PathBuf::from(p)),
            None => Ok(config_dir()?.join("bulkresearch.db")),
        }
    }
}

// ---------------------------------------------------------------------------
// Batch config (runtime, merged from config + CLI flags)
// ---------------------------------------------------------------------------

/// Runtime batch configuration.
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Research endpoint URL.
    pub endpoint: Url,
    /// API key, if one was found.
    pub api_key: Option<String>,
    /// Pause between requests in the same window.
    pub request_delay: Duration,
    /// Per-request timeout.
    pub request_timeout: Duration,
}

impl BatchConfig {
    /// Build from the app config, reading the API key from the environment.
    pub fn from_app(config: &AppConfig) -> Result<Self> {
        let endpoint = Url::parse(&config.endpoint.url).map_err(|e| {
            BulkResearchError::config(format!(
                "invalid endpoint url '{}': {e}",
                config.endpoint.url
            ))
        })?;

        Ok(Self {
            endpoint,
            api_key: resolve_api_key(config),
            request_delay: Duration::from_millis(config.defaults.request_delay_ms),
            request_timeout: Duration::from_secs(config.defaults.request_timeout_secs),
        })
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.bulkresearch/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| BulkResearchError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.bulkresearch/bulkresearch.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| BulkResearchError::io(path, e))?;

    toml::from_str(&content).map_err(|e| {
        BulkResearchError::config(format!("failed to parse {}: {e}", path.display()))
    })
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| BulkResearchError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| BulkResearchError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| BulkResearchError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Read the API key from the configured env var. Empty values count as missing.
pub fn resolve_api_key(config: &AppConfig) -> Option<String> {
    match std::env::var(&config.endpoint.api_key_env) {
        Ok(val) if !val.trim().is_empty() => Some(val),
        _ => None,
    }
}
