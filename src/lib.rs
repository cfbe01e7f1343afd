//! agromesh - crop disease research pipeline over supervised tool providers
//!
//! This crate launches out-of-process tool providers, builds one capability
//! registry from their catalogs, routes capability calls to the owning
//! provider and drives four LLM-backed stages in order: research, prompt
//! synthesis, image rendering and notification.

pub mod agent;
pub mod config;
pub mod error;
pub mod evaluation;
pub mod pipeline;
pub mod provider;
pub mod registry;
pub mod render;
pub mod routing;
pub mod stage;

pub use config::Config;
pub use error::{PipelineError, Result};
pub use pipeline::{PipelineOrchestrator, PipelineRun, PipelineState, RunRequest};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration file name
pub const DEFAULT_CONFIG_FILE: &str = "agromesh.yaml";
