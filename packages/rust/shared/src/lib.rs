//! Shared types, error model, and configuration for ChatCorpus.
//!
//! This crate is the foundation depended on by all other ChatCorpus crates.
//! It provides:
//! - [`ChatCorpusError`] — the unified error type
//! - Domain types ([`Message`], [`MessageKind`], [`MediaInfo`], [`Enrichment`], [`Corpus`])
//! - Configuration ([`AppConfig`], [`EnrichmentSettings`], config loading)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, DEFAULT_STATE_FILE, DefaultsConfig, EnrichmentDefaults, EnrichmentSettings,
    OpenRouterConfig, config_dir, config_file_path, init_config, load_config, load_config_from,
    validate_api_key,
};
pub use error::{ChatCorpusError, Result};
pub use types::{
    CURRENT_SCHEMA_VERSION, Corpus, Enrichment, MediaInfo, Message, MessageKind, ReplyInfo,
    TapbackInfo,
};
