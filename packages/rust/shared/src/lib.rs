//! Shared types, error model, and configuration for bulkresearch.
//!
//! This crate is the foundation depended on by all other bulkresearch crates.
//! It provides:
//! - [`BulkResearchError`]: the unified error type
//! - Domain types ([`Entity`], [`ResearchCategory`], [`ModelTier`], [`ResultRecord`])
//! - Configuration ([`AppConfig`], [`BatchConfig`], config loading)

pub mod config;
pub mod entity;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, BatchConfig, BudgetConfig, DefaultsConfig, EndpointConfig, StorageConfig,
    config_dir, config_file_path, init_config, load_config, load_config_from, resolve_api_key,
};
pub use entity::{Entity, derive_display_name, parse_entity_list};
pub use error::{BulkResearchError, Result};
pub use types::{
    AnalysisType, BudgetSnapshot, CapabilityFlags, DepthLevel, ModelSelection, ModelTier,
    ResearchCategory, ResearchOptions, ResultMap, ResultRecord, RunSettings,
};
