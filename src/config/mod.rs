//! Configuration module for Lurker
//!
//! This module handles loading, parsing, and validating TOML configuration files.
//! Every section is optional and falls back to defaults.
//!
//! # Example
//!
//! ```no_run
//! use lurker::config::load_config;
//! use std::path::Path;
//!
//! let config = load_config(Path::new("lurker.toml")).unwrap();
//! println!("Pipeline will use {} workers", config.pipeline.workers);
//! ```

mod parser;
mod types;
mod validation;

// Re-export types
pub use types::{
    CircuitBreakerConfig, Config, ExtractConfig, ExtractRule, FetchConfig, FrontierConfig,
    PipelineConfig, RetryConfig, ScopeConfig, StorageConfig,
};

// Re-export parser functions
pub use parser::{compute_config_hash, load_config, load_config_with_hash};
pub use validation::validate;
