//! Configuration module
//!
//! This module provides configuration management and loading utilities.

mod config;
pub mod providers;

// Re-export the main configuration types
pub use config::{
    AgentStageConfig, BackendConfig, Config, LoggingConfig, NotifyStageConfig, PipelineConfig,
    ProviderClientConfig, RenderStageConfig, StagesConfig,
};
pub use providers::{expand_env_vars, load_providers, parse_providers, LaunchSpec, ProviderConfig};
