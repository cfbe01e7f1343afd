//! Inference backend seam and registry

use crate::config::Config;
use crate::error::{PipelineError, Result};
use crate::provider::CapabilityDescriptor;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use super::llm_client::LlmClient;

/// Chat message role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
    Tool,
}

/// A tool call requested by the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

impl ToolCallRequest {
    pub fn new<I: Into<String>, N: Into<String>>(id: I, name: N, arguments: Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
        }
    }
}

/// One conversation message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallRequest>,
    /// Id of the call this message answers (tool role only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn user<S: Into<String>>(content: S) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn assistant<S: Into<String>>(content: S, tool_calls: Vec<ToolCallRequest>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
            tool_calls,
            tool_call_id: None,
        }
    }

    pub fn tool_result<I: Into<String>, S: Into<String>>(call_id: I, content: S) -> Self {
        Self {
            role: ChatRole::Tool,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: Some(call_id.into()),
        }
    }
}

/// Request sent to an inference backend
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    /// System instructions
    pub system: String,
    /// Conversation so far
    pub messages: Vec<ChatMessage>,
    /// Capabilities the model may call
    pub tools: Vec<CapabilityDescriptor>,
}

/// Backend answer: final text, tool calls, or both
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompletionResponse {
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCallRequest>,
}

impl CompletionResponse {
    pub fn text<S: Into<String>>(content: S) -> Self {
        Self {
            content: Some(content.into()),
            tool_calls: Vec::new(),
        }
    }

    pub fn calls(tool_calls: Vec<ToolCallRequest>) -> Self {
        Self {
            content: None,
            tool_calls,
        }
    }
}

/// A model that can answer chat completions with tool use
#[async_trait]
pub trait InferenceBackend: Send + Sync {
    /// Backend name for logs
    fn name(&self) -> &str;

    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse>;
}

/// Named inference backends with a default fallback
#[derive(Clone)]
pub struct BackendRegistry {
    backends: HashMap<String, Arc<dyn InferenceBackend>>,
    default_backend: String,
}

impl BackendRegistry {
    pub fn new<S: Into<String>>(default_backend: S) -> Self {
        Self {
            backends: HashMap::new(),
            default_backend: default_backend.into(),
        }
    }

    /// Build HTTP clients for every configured backend
    pub fn from_config(config: &Config) -> Result<Self> {
        let mut registry = Self::new(config.default_backend.clone());
        for (name, backend_config) in &config.backends {
            let client = LlmClient::new(name.clone(), backend_config.clone())?;
            registry.register(name.clone(), Arc::new(client));
        }

        if !registry.backends.contains_key(&registry.default_backend) {
            return Err(PipelineError::config(format!(
                "Default backend '{}' is not configured",
                registry.default_backend
            )));
        }
        Ok(registry)
    }

    pub fn register<S: Into<String>>(&mut self, name: S, backend: Arc<dyn InferenceBackend>) {
        let name = name.into();
        debug!("Registering inference backend '{}'", name);
        self.backends.insert(name, backend);
    }

    /// Backend by name; unknown or absent names fall back to the default
    pub fn resolve(&self, name: Option<&str>) -> Result<Arc<dyn InferenceBackend>> {
        if let Some(name) = name {
            if let Some(backend) = self.backends.get(name) {
                return Ok(Arc::clone(backend));
            }
            warn!(
                "Unknown backend '{}', falling back to '{}'",
                name, self.default_backend
            );
        }

        self.backends
            .get(&self.default_backend)
            .cloned()
            .ok_or_else(|| {
                PipelineError::config(format!(
                    "Default backend '{}' is not registered",
                    self.default_backend
                ))
            })
    }

    pub fn default_backend(&self) -> &str {
        &self.default_backend
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.backends.keys().cloned().collect();
        names.sort();
        names
    }
}

impl std::fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendRegistry")
            .field("backends", &self.names())
            .field("default_backend", &self.default_backend)
            .finish()
    }
}
