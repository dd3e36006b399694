//! Shared types, error model, and configuration for the event catalog.
//!
//! This crate is the foundation depended on by all other eventcatalog crates.
//! It provides:
//! - [`CatalogError`]: the unified error type
//! - Domain types ([`SearchHit`], [`EventRecord`], [`OrganizerRecord`], [`TrustTier`])
//! - Identity-key normalization ([`normalize_url`], [`normalize_name`])
//! - Field merge rules (trust tiers for organizers, first-non-null for events)
//! - Configuration ([`AppConfig`], [`RetryPolicy`], config loading)

pub mod config;
pub mod error;
pub mod merge;
pub mod normalize;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, GoogleCseConfig, OpenRouterConfig, PipelineConfig, ResolverConfig, RetryPolicy,
    SearchConfig, SerpApiConfig, StorageConfig, config_dir, config_file_path, init_config,
    load_config, load_config_from, read_secret, validate_api_key,
};
pub use error::{CatalogError, Result};
pub use merge::{CONFLICT_PENALTY, Offer, offer, offer_ein};
pub use normalize::{
    clean_text, find_ein, normalize_date, normalize_ein, normalize_name, normalize_url, stable_id,
};
pub use types::{
    CatalogEntry, EventDetails, EventKey, EventRecord, FieldConflict, OrganizerHints,
    OrganizerKey, OrganizerRecord, OrganizerStub, ResolutionStatus, SearchHit, Sourced,
    StoredId, TrustTier,
};
