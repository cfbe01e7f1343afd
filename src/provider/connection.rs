//! Provider connection seams
//!
//! The supervisor only sees these traits, so the stdio transport can be swapped
//! for an in-memory provider in tests.

use crate::config::ProviderConfig;
use crate::error::Result;
use crate::provider::types::CapabilityDescriptor;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

/// One live connection to an external tool provider
#[async_trait]
pub trait ProviderConnection: Send + Sync {
    /// Provider name from configuration
    fn name(&self) -> &str;

    /// Whether the channel is still usable
    fn is_alive(&self) -> bool;

    /// Ask the provider for its capability catalog
    async fn list_capabilities(&self) -> Result<Vec<CapabilityDescriptor>>;

    /// Execute one capability and return the provider's raw result payload.
    ///
    /// Failures are reported as `PipelineError::ProviderInvocation`.
    async fn invoke(&self, capability: &str, arguments: Value) -> Result<Value>;

    /// Release the channel and the provider process. Must tolerate repeated calls.
    async fn close(&self) -> Result<()>;
}

/// Establishes connections from launch specs
#[async_trait]
pub trait Connector: Send + Sync {
    /// Launch the provider and complete its handshake
    async fn connect(&self, config: &ProviderConfig) -> Result<Arc<dyn ProviderConnection>>;
}

/// A scarce resource held by this process on behalf of providers
/// (accelerator memory, a loaded model). Released last during cleanup.
#[async_trait]
pub trait ScarceResource: Send + Sync {
    fn resource_name(&self) -> &str;

    async fn release(&self) -> Result<()>;
}
