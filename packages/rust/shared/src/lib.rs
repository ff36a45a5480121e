//! Shared types, error model, configuration, and traceability hashing for Docflow.
//!
//! This crate is the foundation depended on by all other Docflow crates.

pub mod config;
pub mod error;
pub mod trace;
pub mod types;

pub use config::{
    AppConfig, ApprovalConfig, CompiledPatterns, DefaultsConfig, PipelineConfig,
    SourcePatternsConfig, config_dir, config_file_path, expand_tilde, init_config, load_config,
    load_config_from,
};
pub use error::{DocflowError, Result};
pub use types::{
    ActorRole, ArtifactRef, CURRENT_SCHEMA_VERSION, JobId, JobMeta, Manifest, PassMetrics,
    PassName, PassRecord, PassStatus, RunMetrics,
};
