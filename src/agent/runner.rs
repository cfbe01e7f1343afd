//! Agent loop: drive a backend to a final answer, executing its tool calls

use crate::agent::backend::{ChatMessage, CompletionRequest, InferenceBackend};
use crate::error::{PipelineError, Result};
use crate::provider::CapabilityDescriptor;
use crate::routing::{ToolOutput, ToolRouter};
use std::sync::Arc;
use tracing::{debug, info};

/// Outcome of one agent run
#[derive(Debug, Clone)]
pub struct AgentRun {
    /// Final text answer
    pub output: String,
    /// Every capability result, in call order
    pub tool_outputs: Vec<ToolOutput>,
    /// Backend round trips used
    pub turns: usize,
}

/// An LLM agent bound to a capability snapshot
pub struct Agent {
    name: String,
    instructions: String,
    backend: Arc<dyn InferenceBackend>,
    capabilities: Vec<CapabilityDescriptor>,
    max_turns: usize,
}

impl Agent {
    pub fn new<N: Into<String>, I: Into<String>>(
        name: N,
        instructions: I,
        backend: Arc<dyn InferenceBackend>,
    ) -> Self {
        Self {
            name: name.into(),
            instructions: instructions.into(),
            backend,
            capabilities: Vec::new(),
            max_turns: 10,
        }
    }

    /// Bind the capabilities this agent may call
    pub fn with_capabilities(mut self, capabilities: Vec<CapabilityDescriptor>) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_max_turns(mut self, max_turns: usize) -> Self {
        self.max_turns = max_turns.max(1);
        self
    }

    pub fn capabilities(&self) -> &[CapabilityDescriptor] {
        &self.capabilities
    }

    /// Run until the backend answers without tool calls.
    ///
    /// Tool calls are executed one at a time in the order the backend asked for
    /// them. The first failing call ends the run.
    pub async fn run(&self, router: &ToolRouter, input: &str) -> Result<AgentRun> {
        info!(
            "Agent '{}' starting on backend '{}' with {} capabilities",
            self.name,
            self.backend.name(),
            self.capabilities.len()
        );

        let mut request = CompletionRequest {
            system: self.instructions.clone(),
            messages: vec![ChatMessage::user(input)],
            tools: self.capabilities.clone(),
        };
        let mut tool_outputs = Vec::new();

        for turn in 1..=self.max_turns {
            let response = self.backend.complete(&request).await?;

            if response.tool_calls.is_empty() {
                let output = response.content.ok_or_else(|| {
                    PipelineError::backend(format!("Agent '{}' got an empty response", self.name))
                })?;
                info!("Agent '{}' finished after {} turns", self.name, turn);
                return Ok(AgentRun {
                    output,
                    tool_outputs,
                    turns: turn,
                });
            }

            request.messages.push(ChatMessage::assistant(
                response.content.unwrap_or_default(),
                response.tool_calls.clone(),
            ));

            for call in response.tool_calls {
                debug!("Agent '{}' calls '{}' with {}", self.name, call.name, call.arguments);
                let output = router.invoke(&call.name, call.arguments).await?;
                request
                    .messages
                    .push(ChatMessage::tool_result(call.id, output.text()));
                tool_outputs.push(output);
            }
        }

        Err(PipelineError::backend(format!(
            "Agent '{}' exceeded {} turns without a final answer",
            self.name, self.max_turns
        )))
    }
}
