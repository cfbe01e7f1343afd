//! Router that directs capability calls to the owning provider

use crate::error::{InvocationErrorKind, PipelineError, Result};
use crate::provider::CapabilityDescriptor;
use crate::registry::CapabilityRegistry;
use crate::routing::types::ToolOutput;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// Dispatches capability calls through a registry snapshot
#[derive(Clone, Debug)]
pub struct ToolRouter {
    registry: Arc<CapabilityRegistry>,
}

impl ToolRouter {
    pub fn new(registry: Arc<CapabilityRegistry>) -> Self {
        Self { registry }
    }

    /// Capabilities reachable through this router, in registration order
    pub fn capabilities(&self) -> Vec<CapabilityDescriptor> {
        self.registry.list()
    }

    pub fn registry(&self) -> &Arc<CapabilityRegistry> {
        &self.registry
    }

    /// Route a capability call to the provider that owns it
    pub async fn invoke(&self, name: &str, arguments: Value) -> Result<ToolOutput> {
        let entry = self
            .registry
            .resolve(name)
            .ok_or_else(|| PipelineError::unknown_capability(name))?;

        debug!("Routing capability '{}' to provider '{}'", name, entry.provider);

        if let Err(e) = entry.descriptor.validate_arguments(&arguments) {
            // Providers are the authority on their own inputs
            warn!("{}", e);
        }

        let started = Instant::now();
        let payload = entry
            .connection
            .invoke(name, arguments)
            .await
            .map_err(|e| match e {
                PipelineError::ProviderInvocation { .. } => e,
                other => PipelineError::invocation(
                    entry.provider.as_str(),
                    name,
                    InvocationErrorKind::Transport,
                    other.to_string(),
                ),
            })?;
        let elapsed = started.elapsed();

        debug!(
            "Capability '{}' on provider '{}' completed in {:?}",
            name, entry.provider, elapsed
        );

        Ok(ToolOutput::from_provider_result(&entry.provider, name, payload)?
            .with_metadata(json!({ "duration_ms": elapsed.as_millis() as u64 })))
    }
}
