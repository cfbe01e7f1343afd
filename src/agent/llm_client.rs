//! HTTP client for hosted and local chat-completion backends

use crate::agent::backend::{
    ChatMessage, ChatRole, CompletionRequest, CompletionResponse, InferenceBackend, ToolCallRequest,
};
use crate::config::BackendConfig;
use crate::error::{PipelineError, Result};
use crate::provider::CapabilityDescriptor;
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, warn};
use uuid::Uuid;

/// Chat-completion client for `openai` compatible endpoints and `ollama`
#[derive(Debug, Clone)]
pub struct LlmClient {
    name: String,
    config: BackendConfig,
    http_client: reqwest::Client,
}

impl LlmClient {
    pub fn new<S: Into<String>>(name: S, config: BackendConfig) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| PipelineError::config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            name: name.into(),
            config,
            http_client,
        })
    }

    async fn complete_openai(&self, request: &CompletionRequest) -> Result<CompletionResponse> {
        let api_key = self.get_api_key()?;
        let base_url = self
            .config
            .api_base_url
            .as_deref()
            .unwrap_or("https://api.openai.com/v1");

        let body = openai_request_body(&self.config, request);

        let response = self
            .http_client
            .post(format!("{}/chat/completions", base_url.trim_end_matches('/')))
            .header("Authorization", format!("Bearer {}", api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| PipelineError::backend(format!("OpenAI API request failed: {}", e)))?;

        if !response.status().is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(PipelineError::backend(format!("OpenAI API error: {}", error_text)));
        }

        let payload: Value = response
            .json()
            .await
            .map_err(|e| PipelineError::backend(format!("Failed to parse OpenAI response: {}", e)))?;

        parse_openai_response(&payload)
    }

    async fn complete_ollama(&self, request: &CompletionRequest) -> Result<CompletionResponse> {
        let base_url = self
            .config
            .api_base_url
            .as_deref()
            .unwrap_or("http://localhost:11434");

        let body = ollama_request_body(&self.config, request);

        let response = self
            .http_client
            .post(format!("{}/api/chat", base_url.trim_end_matches('/')))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| PipelineError::backend(format!("Ollama API request failed: {}", e)))?;

        if !response.status().is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(PipelineError::backend(format!("Ollama API error: {}", error_text)));
        }

        let payload: Value = response
            .json()
            .await
            .map_err(|e| PipelineError::backend(format!("Failed to parse Ollama response: {}", e)))?;

        parse_ollama_response(&payload)
    }

    /// Get API key from environment variable
    fn get_api_key(&self) -> Result<String> {
        match &self.config.api_key_env {
            Some(env_var) => std::env::var(env_var)
                .map_err(|_| PipelineError::config(format!("Environment variable {} not found", env_var))),
            None => Err(PipelineError::config(format!(
                "No API key environment variable configured for backend '{}'",
                self.name
            ))),
        }
    }
}

#[async_trait]
impl InferenceBackend for LlmClient {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse> {
        debug!(
            "Completion on backend '{}' ({} {}), {} messages, {} tools",
            self.name,
            self.config.provider,
            self.config.model,
            request.messages.len(),
            request.tools.len()
        );

        match self.config.provider.as_str() {
            "openai" => self.complete_openai(request).await,
            "ollama" => self.complete_ollama(request).await,
            other => Err(PipelineError::config(format!("Unsupported LLM provider: {}", other))),
        }
    }
}

fn function_tools(tools: &[CapabilityDescriptor]) -> Vec<Value> {
    tools
        .iter()
        .map(|tool| {
            json!({
                "type": "function",
                "function": {
                    "name": tool.name,
                    "description": tool.description_text(),
                    "parameters": tool.input_schema,
                }
            })
        })
        .collect()
}

fn role_name(role: ChatRole) -> &'static str {
    match role {
        ChatRole::System => "system",
        ChatRole::User => "user",
        ChatRole::Assistant => "assistant",
        ChatRole::Tool => "tool",
    }
}

fn openai_message(message: &ChatMessage) -> Value {
    let mut value = json!({
        "role": role_name(message.role),
        "content": message.content,
    });

    if !message.tool_calls.is_empty() {
        value["tool_calls"] = Value::Array(
            message
                .tool_calls
                .iter()
                .map(|call| {
                    json!({
                        "id": call.id,
                        "type": "function",
                        "function": {
                            "name": call.name,
                            "arguments": call.arguments.to_string(),
                        }
                    })
                })
                .collect(),
        );
    }

    if let Some(ref id) = message.tool_call_id {
        value["tool_call_id"] = json!(id);
    }
    value
}

fn ollama_message(message: &ChatMessage) -> Value {
    let mut value = json!({
        "role": role_name(message.role),
        "content": message.content,
    });

    if !message.tool_calls.is_empty() {
        value["tool_calls"] = Value::Array(
            message
                .tool_calls
                .iter()
                .map(|call| {
                    json!({
                        "function": {
                            "name": call.name,
                            "arguments": call.arguments,
                        }
                    })
                })
                .collect(),
        );
    }
    value
}

/// Request body for `POST {base}/chat/completions`
pub fn openai_request_body(config: &BackendConfig, request: &CompletionRequest) -> Value {
    let mut messages = vec![json!({ "role": "system", "content": request.system })];
    messages.extend(request.messages.iter().map(openai_message));

    let mut body = json!({
        "model": config.model,
        "messages": messages,
        "max_tokens": config.max_tokens.unwrap_or(4000),
        "temperature": config.temperature.unwrap_or(0.7),
    });

    if !request.tools.is_empty() {
        body["tools"] = Value::Array(function_tools(&request.tools));
    }
    body
}

/// Request body for `POST {base}/api/chat`
pub fn ollama_request_body(config: &BackendConfig, request: &CompletionRequest) -> Value {
    let mut messages = vec![json!({ "role": "system", "content": request.system })];
    messages.extend(request.messages.iter().map(ollama_message));

    let mut body = json!({
        "model": config.model,
        "messages": messages,
        "stream": false,
        "options": {
            "num_predict": config.max_tokens.unwrap_or(4000),
            "temperature": config.temperature.unwrap_or(0.7),
        }
    });

    if !request.tools.is_empty() {
        body["tools"] = Value::Array(function_tools(&request.tools));
    }
    body
}

fn call_arguments(raw: Option<&Value>) -> Value {
    match raw {
        Some(Value::String(s)) => serde_json::from_str(s).unwrap_or_else(|e| {
            warn!("Tool call arguments are not valid JSON ({}): {}", e, s);
            json!({})
        }),
        Some(Value::Null) | None => json!({}),
        Some(other) => other.clone(),
    }
}

pub fn parse_openai_response(payload: &Value) -> Result<CompletionResponse> {
    let message = payload
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"))
        .ok_or_else(|| PipelineError::backend("No choices in OpenAI response"))?;

    let content = message
        .get("content")
        .and_then(|c| c.as_str())
        .map(|s| s.to_string());

    let tool_calls = message
        .get("tool_calls")
        .and_then(|calls| calls.as_array())
        .map(|calls| {
            calls
                .iter()
                .filter_map(|call| {
                    let function = call.get("function")?;
                    let name = function.get("name")?.as_str()?;
                    let id = call
                        .get("id")
                        .and_then(|id| id.as_str())
                        .map(|s| s.to_string())
                        .unwrap_or_else(|| Uuid::new_v4().to_string());
                    Some(ToolCallRequest::new(id, name, call_arguments(function.get("arguments"))))
                })
                .collect()
        })
        .unwrap_or_default();

    Ok(CompletionResponse { content, tool_calls })
}

pub fn parse_ollama_response(payload: &Value) -> Result<CompletionResponse> {
    let message = payload
        .get("message")
        .ok_or_else(|| PipelineError::backend("No message in Ollama response"))?;

    let content = message
        .get("content")
        .and_then(|c| c.as_str())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string());

    let tool_calls = message
        .get("tool_calls")
        .and_then(|calls| calls.as_array())
        .map(|calls| {
            calls
                .iter()
                .filter_map(|call| {
                    let function = call.get("function")?;
                    let name = function.get("name")?.as_str()?;
                    Some(ToolCallRequest::new(
                        Uuid::new_v4().to_string(),
                        name,
                        call_arguments(function.get("arguments")),
                    ))
                })
                .collect()
        })
        .unwrap_or_default();

    Ok(CompletionResponse { content, tool_calls })
}
