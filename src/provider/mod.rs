//! Tool provider connections
//!
//! Providers are external processes that expose named capabilities. This
//! module launches them, speaks their protocol and supervises their lifetime.

pub mod connection;
pub mod stdio;
pub mod supervisor;
pub mod types;

pub use connection::{Connector, ProviderConnection, ScarceResource};
pub use stdio::{StdioConnection, StdioConnector};
pub use supervisor::{ConnectOutcome, ConnectionFailure, ConnectionSupervisor};
pub use types::{
    CallToolResult, CapabilityDescriptor, JsonRpcError, JsonRpcMessage, JsonRpcRequest, ToolContent,
    ToolListResponse,
};
