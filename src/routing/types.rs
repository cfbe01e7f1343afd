//! Routing result types

use crate::error::{InvocationErrorKind, PipelineError, Result};
use crate::provider::{CallToolResult, ToolContent};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Normalized result of one capability invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolOutput {
    /// Provider that served the call
    pub provider: String,
    /// Capability that was invoked
    pub capability: String,
    /// Content items returned by the provider
    pub content: Vec<ToolContent>,
    /// Structured payload, if the provider returned one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub structured: Option<Value>,
    /// Execution metadata (timing)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl ToolOutput {
    /// Normalize a raw provider payload.
    ///
    /// Payloads in the `tools/call` result shape are unpacked and an `isError`
    /// result becomes a remote invocation error. Any other JSON value is kept
    /// as the structured payload with a text rendering alongside.
    pub fn from_provider_result(provider: &str, capability: &str, payload: Value) -> Result<Self> {
        let looks_like_call_result = payload
            .as_object()
            .map(|object| object.contains_key("content") || object.contains_key("isError"))
            .unwrap_or(false);

        if looks_like_call_result {
            if let Ok(result) = serde_json::from_value::<CallToolResult>(payload.clone()) {
                if result.is_error {
                    let message = text_of(&result.content);
                    return Err(PipelineError::invocation(
                        provider,
                        capability,
                        InvocationErrorKind::Remote,
                        if message.is_empty() {
                            "provider reported an error".to_string()
                        } else {
                            message
                        },
                    ));
                }

                return Ok(Self {
                    provider: provider.to_string(),
                    capability: capability.to_string(),
                    content: result.content,
                    structured: result.structured_content,
                    metadata: None,
                });
            }
        }

        let text = match &payload {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        Ok(Self {
            provider: provider.to_string(),
            capability: capability.to_string(),
            content: vec![ToolContent::text(text)],
            structured: Some(payload),
            metadata: None,
        })
    }

    /// Concatenated text content, or the structured payload as JSON text
    pub fn text(&self) -> String {
        let text = text_of(&self.content);
        if text.is_empty() {
            if let Some(ref structured) = self.structured {
                return structured.to_string();
            }
        }
        text
    }

    /// First image item as `(base64 data, mime type)`
    pub fn first_image(&self) -> Option<(&str, &str)> {
        self.content.iter().find_map(|item| match item {
            ToolContent::Image { data, mime_type } => Some((data.as_str(), mime_type.as_str())),
            _ => None,
        })
    }

    /// Structured payload if present, otherwise the text parsed as JSON when possible
    pub fn to_value(&self) -> Value {
        if let Some(ref structured) = self.structured {
            return structured.clone();
        }
        let text = self.text();
        serde_json::from_str(&text).unwrap_or(Value::String(text))
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

fn text_of(content: &[ToolContent]) -> String {
    content
        .iter()
        .filter_map(|item| match item {
            ToolContent::Text { text } => Some(text.as_str()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("\n")
}
