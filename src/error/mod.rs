//! Error handling module for the pipeline
//!
//! This module provides the crate-wide error type and result alias.

mod error;

// Re-export the main error types and utilities
pub use error::{InvocationErrorKind, PipelineError, Result};
