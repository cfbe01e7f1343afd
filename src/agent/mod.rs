//! LLM agents and the inference backends that drive them

pub mod backend;
pub mod llm_client;
pub mod runner;

pub use backend::{
    BackendRegistry, ChatMessage, ChatRole, CompletionRequest, CompletionResponse, InferenceBackend,
    ToolCallRequest,
};
pub use llm_client::LlmClient;
pub use runner::{Agent, AgentRun};
