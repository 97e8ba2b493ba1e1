//! Shared types, error model, and configuration for Playbook.
//!
//! This crate is the foundation depended on by all other Playbook crates.
//! It provides:
//! - [`PlaybookError`], the unified error type
//! - Domain types ([`Document`], [`Phase`], [`ExternalTask`], [`EnrichmentRecord`])
//! - Configuration ([`AppConfig`], config loading)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, BridgeConfig, ConversationConfig, DefaultsConfig, EnrichmentPolicyConfig,
    GenerationConfig, MatchingConfig, TrackerConfig, config_dir, config_file_path, expand_home,
    init_config, load_config, load_config_from, validate_api_key,
};
pub use error::{PlaybookError, Result};
pub use types::{
    DiagnosticKind, Document, EnrichmentRecord, ExternalTask, NamedSection, ParseDiagnostic,
    Phase, SectionKind, content_hash,
};
