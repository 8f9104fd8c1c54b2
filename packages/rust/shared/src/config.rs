//! Application configuration for ChatCorpus.
//!
//! User config lives at `~/.chatcorpus/chatcorpus.toml`.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{ChatCorpusError, Result};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "chatcorpus.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".chatcorpus";

/// Default incremental-state file path, relative to the working directory.
pub const DEFAULT_STATE_FILE: &str = "./.imessage-state.json";

// ---------------------------------------------------------------------------
// Config structs (matching chatcorpus.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Global defaults.
    #[serde(default)]
    pub defaults: DefaultsConfig,

    /// Enrichment pacing and provider toggles.
    #[serde(default)]
    pub enrichment: EnrichmentDefaults,

    /// OpenRouter settings for the AI providers.
    #[serde(default)]
    pub openrouter: OpenRouterConfig,
}

/// `[defaults]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsConfig {
    /// Default output directory for corpus files.
    #[serde(default = "default_output_dir")]
    pub output_dir: String,

    /// Default incremental-state file path.
    #[serde(default = "default_state_file")]
    pub state_file: String,

    /// Default checkpoint directory.
    #[serde(default = "default_checkpoint_dir")]
    pub checkpoint_dir: String,

    /// Messages between checkpoint writes.
    #[serde(default = "default_checkpoint_interval")]
    pub checkpoint_interval: usize,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            state_file: default_state_file(),
            checkpoint_dir: default_checkpoint_dir(),
            checkpoint_interval: default_checkpoint_interval(),
        }
    }
}

fn default_output_dir() -> String {
    ".".into()
}
fn default_state_file() -> String {
    DEFAULT_STATE_FILE.into()
}
fn default_checkpoint_dir() -> String {
    "./.chatcorpus-checkpoints".into()
}
fn default_checkpoint_interval() -> usize {
    25
}

/// `[enrichment]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrichmentDefaults {
    /// Enable image analysis.
    #[serde(default = "default_true")]
    pub images: bool,

    /// Enable audio transcription.
    #[serde(default = "default_true")]
    pub audio: bool,

    /// Enable link previews.
    #[serde(default = "default_true")]
    pub links: bool,

    /// Minimum ms between provider calls.
    #[serde(default = "default_rate_limit")]
    pub rate_limit_ms: u64,

    /// Retries per message before recording a failure.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Consecutive failures before the circuit opens.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Circuit cool-down in seconds.
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
}

impl Default for EnrichmentDefaults {
    fn default() -> Self {
        Self {
            images: true,
            audio: true,
            links: true,
            rate_limit_ms: default_rate_limit(),
            max_retries: default_max_retries(),
            failure_threshold: default_failure_threshold(),
            cooldown_secs: default_cooldown_secs(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_rate_limit() -> u64 {
    1000
}
fn default_max_retries() -> u32 {
    2
}
fn default_failure_threshold() -> u32 {
    5
}
fn default_cooldown_secs() -> u64 {
    60
}

/// `[openrouter]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenRouterConfig {
    /// Name of the env var holding the API key (never store the key itself).
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// Default model for image/audio enrichment.
    #[serde(default = "default_model")]
    pub default_model: String,
}

impl Default for OpenRouterConfig {
    fn default() -> Self {
        Self {
            api_key_env: default_api_key_env(),
            default_model: default_model(),
        }
    }
}

fn default_api_key_env() -> String {
    "OPENROUTER_API_KEY".into()
}
fn default_model() -> String {
    "google/gemini-2.5-flash".into()
}

// ---------------------------------------------------------------------------
// Enrichment settings (runtime, merged from config + CLI flags)
// ---------------------------------------------------------------------------

/// Runtime enrichment settings — merged from config file + CLI flags.
///
/// These are exactly the fields covered by the checkpoint configuration
/// fingerprint: provider toggles plus rate-limit and retry settings. Changing
/// any of them starts a fresh checkpoint lineage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrichmentSettings {
    /// Enable image analysis.
    pub images: bool,
    /// Enable audio transcription.
    pub audio: bool,
    /// Enable link previews.
    pub links: bool,
    /// Minimum ms between provider calls.
    pub rate_limit_ms: u64,
    /// Retries per message before recording a failure.
    pub max_retries: u32,
    /// Consecutive failures before the circuit opens.
    pub failure_threshold: u32,
    /// Circuit cool-down in seconds.
    pub cooldown_secs: u64,
    /// Model used by the AI providers.
    pub model_id: String,
}

impl EnrichmentSettings {
    /// Build settings from the app config, before CLI overrides.
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            images: config.enrichment.images,
            audio: config.enrichment.audio,
            links: config.enrichment.links,
            rate_limit_ms: config.enrichment.rate_limit_ms,
            max_retries: config.enrichment.max_retries,
            failure_threshold: config.enrichment.failure_threshold,
            cooldown_secs: config.enrichment.cooldown_secs,
            model_id: config.openrouter.default_model.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.chatcorpus/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| ChatCorpusError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.chatcorpus/chatcorpus.toml`).
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
    let content = std::fs::read_to_string(path).map_err(|e| ChatCorpusError::io(path, e))?;

    toml::from_str(&content).map_err(|e| {
        ChatCorpusError::config(format!("failed to parse {}: {e}", path.display()))
    })
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| ChatCorpusError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| ChatCorpusError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| ChatCorpusError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Check that the OpenRouter API key env var is set and non-empty.
///
/// Only required when an AI provider (images/audio) is enabled; link previews
/// need no key.
pub fn validate_api_key(config: &AppConfig) -> Result<()> {
    let var_name = &config.openrouter.api_key_env;
    match std::env::var(var_name) {
        Ok(val) if !val.is_empty() => Ok(()),
        _ => Err(ChatCorpusError::config(format!(
            "OpenRouter API key not found. Set the {var_name} environment variable.\n\
             Get a key at https://openrouter.ai/keys"
        ))),
    }
}
