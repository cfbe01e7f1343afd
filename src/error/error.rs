//! Error types and handling for the pipeline

use crate::stage::StageId;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, PipelineError>;

/// What went wrong while a provider was executing a capability call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationErrorKind {
    /// The provider did not answer within the request timeout
    Timeout,
    /// The request could not be written to or read from the channel
    Transport,
    /// The provider answered with an error or an `isError` result
    Remote,
    /// The connection was already closed when the call was made
    Closed,
}

impl fmt::Display for InvocationErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            InvocationErrorKind::Timeout => "timeout",
            InvocationErrorKind::Transport => "transport",
            InvocationErrorKind::Remote => "remote",
            InvocationErrorKind::Closed => "closed",
        };
        f.write_str(label)
    }
}

/// Main error type for the pipeline
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// A provider failed to start or to complete its handshake
    #[error("Connection error: provider '{provider}': {message}")]
    Connection { provider: String, message: String },

    /// A capability name that no connected provider exposes
    #[error("Unknown capability: '{name}'")]
    UnknownCapability { name: String },

    /// A capability call failed on the provider side
    #[error("Provider invocation error: provider '{provider}' capability '{capability}' ({kind}): {message}")]
    ProviderInvocation {
        provider: String,
        capability: String,
        kind: InvocationErrorKind,
        message: String,
    },

    /// Stage output did not match the stage schema
    #[error("Schema validation error in stage {stage}: {message}")]
    SchemaValidation {
        stage: StageId,
        message: String,
        raw: String,
    },

    /// Inference backend errors
    #[error("Backend error: {message}")]
    Backend { message: String },

    /// Image rendering errors
    #[error("Render error: {message}")]
    Render { message: String },

    /// The notification capability reported a failure status
    #[error("Notification error: {message}")]
    Notification { message: String },

    /// The run was cancelled before or during a stage
    #[error("Run cancelled during stage {stage}")]
    Cancelled { stage: StageId },

    /// Validation errors
    #[error("Validation error: {message}")]
    Validation { message: String },

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// YAML parsing errors
    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// HTTP client errors
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    /// Generic errors
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl PipelineError {
    /// Create a configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a connection error for a provider
    pub fn connection<P: Into<String>, S: Into<String>>(provider: P, message: S) -> Self {
        Self::Connection {
            provider: provider.into(),
            message: message.into(),
        }
    }

    /// Create an unknown capability error
    pub fn unknown_capability<S: Into<String>>(name: S) -> Self {
        Self::UnknownCapability { name: name.into() }
    }

    /// Create a provider invocation error
    pub fn invocation<P, C, S>(provider: P, capability: C, kind: InvocationErrorKind, message: S) -> Self
    where
        P: Into<String>,
        C: Into<String>,
        S: Into<String>,
    {
        Self::ProviderInvocation {
            provider: provider.into(),
            capability: capability.into(),
            kind,
            message: message.into(),
        }
    }

    /// Create a schema validation error carrying the raw response
    pub fn schema<S: Into<String>, R: Into<String>>(stage: StageId, message: S, raw: R) -> Self {
        Self::SchemaValidation {
            stage,
            message: message.into(),
            raw: raw.into(),
        }
    }

    /// Create a backend error
    pub fn backend<S: Into<String>>(message: S) -> Self {
        Self::Backend {
            message: message.into(),
        }
    }

    /// Create a render error
    pub fn render<S: Into<String>>(message: S) -> Self {
        Self::Render {
            message: message.into(),
        }
    }

    /// Create a notification error
    pub fn notification<S: Into<String>>(message: S) -> Self {
        Self::Notification {
            message: message.into(),
        }
    }

    /// Create a validation error
    pub fn validation<S: Into<String>>(message: S) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Check whether a pipeline-level policy could retry this error.
    ///
    /// Nothing inside the crate retries; this only informs callers.
    pub fn is_retryable(&self) -> bool {
        match self {
            PipelineError::ProviderInvocation { kind, .. } => matches!(
                kind,
                InvocationErrorKind::Timeout | InvocationErrorKind::Transport
            ),
            PipelineError::Connection { .. } | PipelineError::Http(_) | PipelineError::Io(_) => true,
            _ => false,
        }
    }

    /// Check whether this error is an invocation timeout
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            PipelineError::ProviderInvocation {
                kind: InvocationErrorKind::Timeout,
                ..
            }
        )
    }

    /// Get the error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            PipelineError::Config { .. } => "config",
            PipelineError::Connection { .. } => "connection",
            PipelineError::UnknownCapability { .. } => "unknown_capability",
            PipelineError::ProviderInvocation { .. } => "provider_invocation",
            PipelineError::SchemaValidation { .. } => "schema_validation",
            PipelineError::Backend { .. } => "backend",
            PipelineError::Render { .. } => "render",
            PipelineError::Notification { .. } => "notification",
            PipelineError::Cancelled { .. } => "cancelled",
            PipelineError::Validation { .. } => "validation",
            PipelineError::Io(_) => "io",
            PipelineError::Serde(_) => "serialization",
            PipelineError::Yaml(_) => "yaml",
            PipelineError::Http(_) => "http",
            PipelineError::Internal(_) => "internal",
        }
    }
}

impl Clone for PipelineError {
    fn clone(&self) -> Self {
        match self {
            PipelineError::Config { message } => PipelineError::Config { message: message.clone() },
            PipelineError::Connection { provider, message } => PipelineError::Connection {
                provider: provider.clone(),
                message: message.clone(),
            },
            PipelineError::UnknownCapability { name } => PipelineError::UnknownCapability { name: name.clone() },
            PipelineError::ProviderInvocation { provider, capability, kind, message } => {
                PipelineError::ProviderInvocation {
                    provider: provider.clone(),
                    capability: capability.clone(),
                    kind: *kind,
                    message: message.clone(),
                }
            }
            PipelineError::SchemaValidation { stage, message, raw } => PipelineError::SchemaValidation {
                stage: *stage,
                message: message.clone(),
                raw: raw.clone(),
            },
            PipelineError::Backend { message } => PipelineError::Backend { message: message.clone() },
            PipelineError::Render { message } => PipelineError::Render { message: message.clone() },
            PipelineError::Notification { message } => PipelineError::Notification { message: message.clone() },
            PipelineError::Cancelled { stage } => PipelineError::Cancelled { stage: *stage },
            PipelineError::Validation { message } => PipelineError::Validation { message: message.clone() },

            // For non-cloneable types, convert to string representation
            PipelineError::Io(e) => PipelineError::Internal(anyhow::anyhow!("IO error: {}", e)),
            PipelineError::Serde(e) => PipelineError::Internal(anyhow::anyhow!("Serialization error: {}", e)),
            PipelineError::Yaml(e) => PipelineError::config(format!("YAML error: {}", e)),
            PipelineError::Http(e) => PipelineError::backend(format!("HTTP error: {}", e)),
            PipelineError::Internal(e) => PipelineError::Internal(anyhow::anyhow!("{}", e)),
        }
    }
}
