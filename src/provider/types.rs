//! Wire types shared by provider connections
//!
//! Providers speak newline-delimited JSON-RPC 2.0 and describe their
//! capabilities with the tool listing shape used by MCP servers.

use crate::error::{PipelineError, Result};
use jsonschema::JSONSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

fn empty_object_schema() -> Value {
    json!({ "type": "object" })
}

/// A named, schema-described operation a provider can execute
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityDescriptor {
    /// Capability name (unique across the registry)
    pub name: String,
    /// Human-readable description
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub description: Option<String>,
    /// JSON Schema for input parameters
    #[serde(rename = "inputSchema", default = "empty_object_schema")]
    pub input_schema: Value,
}

impl CapabilityDescriptor {
    pub fn new<N: Into<String>, D: Into<String>>(name: N, description: D, input_schema: Value) -> Self {
        Self {
            name: name.into(),
            description: Some(description.into()),
            input_schema,
        }
    }

    /// Description or an empty string
    pub fn description_text(&self) -> &str {
        self.description.as_deref().unwrap_or("")
    }

    /// Validate arguments against the input schema
    pub fn validate_arguments(&self, arguments: &Value) -> Result<()> {
        let schema = JSONSchema::compile(&self.input_schema).map_err(|e| {
            PipelineError::validation(format!(
                "Failed to compile schema for capability '{}': {}",
                self.name, e
            ))
        })?;

        let outcome = schema.validate(arguments);
        if let Err(errors) = outcome {
            let messages: Vec<String> = errors.map(|e| format!("  - {}", e)).collect();
            return Err(PipelineError::validation(format!(
                "Invalid arguments for capability '{}': \n{}",
                self.name,
                messages.join("\n")
            )));
        }
        Ok(())
    }
}

/// Outgoing JSON-RPC request or notification
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    /// JSON-RPC version (always "2.0")
    pub jsonrpc: String,
    /// Request ID, absent for notifications
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    /// Method name
    pub method: String,
    /// Parameters
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn request(id: String, method: &str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: Some(Value::String(id)),
            method: method.to_string(),
            params,
        }
    }

    pub fn notification(method: &str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: None,
            method: method.to_string(),
            params,
        }
    }
}

/// JSON-RPC error object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub data: Option<Value>,
}

/// Any incoming JSON-RPC message (response, server request or notification)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcMessage {
    #[serde(default)]
    pub jsonrpc: Option<String>,
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcMessage {
    /// Key used to match a response to its pending request
    pub fn response_key(&self) -> Option<String> {
        if self.method.is_some() {
            return None;
        }
        match self.id.as_ref()? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }
}

/// Tool listing page
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolListResponse {
    #[serde(default)]
    pub tools: Vec<CapabilityDescriptor>,
    #[serde(rename = "nextCursor", skip_serializing_if = "Option::is_none", default)]
    pub next_cursor: Option<String>,
}

/// Content item of a capability result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ToolContent {
    /// Text content
    #[serde(rename = "text")]
    Text { text: String },
    /// Image content (base64 encoded)
    #[serde(rename = "image")]
    Image {
        data: String,
        #[serde(rename = "mimeType")]
        mime_type: String,
    },
    /// Embedded resource
    #[serde(rename = "resource")]
    Resource { resource: Value },
    /// Content kinds the pipeline does not consume
    #[serde(other)]
    Unsupported,
}

impl ToolContent {
    pub fn text<S: Into<String>>(text: S) -> Self {
        ToolContent::Text { text: text.into() }
    }

    pub fn image<D: Into<String>, M: Into<String>>(data: D, mime_type: M) -> Self {
        ToolContent::Image {
            data: data.into(),
            mime_type: mime_type.into(),
        }
    }
}

/// Result shape of a `tools/call` request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallToolResult {
    #[serde(default)]
    pub content: Vec<ToolContent>,
    #[serde(rename = "isError", default)]
    pub is_error: bool,
    #[serde(rename = "structuredContent", skip_serializing_if = "Option::is_none", default)]
    pub structured_content: Option<Value>,
}

impl CallToolResult {
    pub fn text<S: Into<String>>(text: S) -> Self {
        Self {
            content: vec![ToolContent::text(text)],
            is_error: false,
            structured_content: None,
        }
    }

    pub fn error<S: Into<String>>(message: S) -> Self {
        Self {
            content: vec![ToolContent::text(message)],
            is_error: true,
            structured_content: None,
        }
    }

    pub fn into_value(self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| json!({ "content": [] }))
    }
}
