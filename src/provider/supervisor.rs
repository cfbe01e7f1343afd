//! Connection supervisor
//!
//! Owns every provider connection of one run, builds the capability registry
//! from them and tears everything down in reverse acquisition order.

use crate::config::ProviderConfig;
use crate::error::{PipelineError, Result};
use crate::provider::connection::{Connector, ProviderConnection, ScarceResource};
use crate::registry::CapabilityRegistry;
use crate::routing::ToolRouter;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// A provider that could not be connected or released
#[derive(Debug)]
pub struct ConnectionFailure {
    pub provider: String,
    pub error: PipelineError,
}

/// Result of connecting a set of providers
#[derive(Default)]
pub struct ConnectOutcome {
    pub connections: HashMap<String, Arc<dyn ProviderConnection>>,
    pub errors: Vec<ConnectionFailure>,
}

impl ConnectOutcome {
    /// Names that connected, sorted
    pub fn connected_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.connections.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn failed_names(&self) -> Vec<String> {
        self.errors.iter().map(|f| f.provider.clone()).collect()
    }

    pub fn is_complete(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Supervises the provider connections of one run
pub struct ConnectionSupervisor {
    connector: Arc<dyn Connector>,
    /// Live connections in acquisition order
    connections: Vec<Arc<dyn ProviderConnection>>,
    registry: Arc<CapabilityRegistry>,
    resources: Vec<Arc<dyn ScarceResource>>,
}

impl ConnectionSupervisor {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            connections: Vec::new(),
            registry: Arc::new(CapabilityRegistry::new()),
            resources: Vec::new(),
        }
    }

    /// Connect each provider independently.
    ///
    /// A failing provider is recorded and the rest still connect. The registry
    /// is rebuilt from every live connection once all attempts finish.
    pub async fn connect_all(&mut self, configs: &[ProviderConfig]) -> ConnectOutcome {
        let mut outcome = ConnectOutcome::default();

        info!("Connecting {} providers", configs.len());

        for config in configs {
            let already_held = self.connections.iter().any(|c| c.name() == config.name);
            if already_held || outcome.connections.contains_key(&config.name) {
                warn!("Provider '{}' is already connected, skipping duplicate", config.name);
                outcome.errors.push(ConnectionFailure {
                    provider: config.name.clone(),
                    error: PipelineError::connection(&config.name, "duplicate provider name"),
                });
                continue;
            }

            match self.connect_one(config).await {
                Ok(connection) => {
                    info!("Connected to provider '{}'", config.name);
                    self.connections.push(Arc::clone(&connection));
                    outcome.connections.insert(config.name.clone(), connection);
                }
                Err(e) => {
                    error!("Failed to connect provider '{}': {}", config.name, e);
                    outcome.errors.push(ConnectionFailure {
                        provider: config.name.clone(),
                        error: e,
                    });
                }
            }
        }

        for failure in self.rebuild_registry().await {
            outcome.connections.remove(&failure.provider);
            outcome.errors.push(failure);
        }

        info!(
            "Provider connection complete: {} connected, {} failed, {} capabilities",
            outcome.connections.len(),
            outcome.errors.len(),
            self.registry.len()
        );

        outcome
    }

    async fn connect_one(&self, config: &ProviderConfig) -> Result<Arc<dyn ProviderConnection>> {
        debug!("Connecting provider '{}'", config.name);
        self.connector.connect(config).await
    }

    /// Build a fresh registry from the live connections, in acquisition order.
    ///
    /// A connection whose catalog cannot be listed is closed, dropped and
    /// reported as a failure.
    async fn rebuild_registry(&mut self) -> Vec<ConnectionFailure> {
        let mut failures = Vec::new();
        let mut registry = CapabilityRegistry::new();
        let mut retained = Vec::with_capacity(self.connections.len());

        for connection in self.connections.drain(..) {
            match connection.list_capabilities().await {
                Ok(descriptors) => {
                    registry.register(Arc::clone(&connection), descriptors);
                    retained.push(connection);
                }
                Err(e) => {
                    error!("Failed to list capabilities of provider '{}': {}", connection.name(), e);
                    if let Err(close_err) = connection.close().await {
                        warn!("Failed to close provider '{}': {}", connection.name(), close_err);
                    }
                    failures.push(ConnectionFailure {
                        provider: connection.name().to_string(),
                        error: e,
                    });
                }
            }
        }

        self.connections = retained;
        self.registry = Arc::new(registry);
        failures
    }

    /// Current registry snapshot
    pub fn registry(&self) -> Arc<CapabilityRegistry> {
        Arc::clone(&self.registry)
    }

    /// Router over the current registry snapshot
    pub fn router(&self) -> ToolRouter {
        ToolRouter::new(self.registry())
    }

    /// Names of live connections in acquisition order
    pub fn connection_names(&self) -> Vec<String> {
        self.connections.iter().map(|c| c.name().to_string()).collect()
    }

    /// Hold a scarce resource until the next cleanup
    pub fn hold_resource(&mut self, resource: Arc<dyn ScarceResource>) {
        debug!("Holding resource '{}'", resource.resource_name());
        self.resources.push(resource);
    }

    /// Release every connection in reverse acquisition order, then every held
    /// resource. Failures are logged and returned; nothing stops the teardown.
    /// Calling this again, or before any connection, is a no-op.
    pub async fn cleanup(&mut self) -> Vec<ConnectionFailure> {
        let mut failures = Vec::new();

        if self.connections.is_empty() && self.resources.is_empty() {
            debug!("Nothing to clean up");
            self.registry = Arc::new(CapabilityRegistry::new());
            return failures;
        }

        info!("Releasing {} provider connections", self.connections.len());

        while let Some(connection) = self.connections.pop() {
            let name = connection.name().to_string();
            match connection.close().await {
                Ok(()) => debug!("Released provider '{}'", name),
                Err(e) => {
                    warn!("Failed to release provider '{}': {}", name, e);
                    failures.push(ConnectionFailure { provider: name, error: e });
                }
            }
        }

        self.registry = Arc::new(CapabilityRegistry::new());

        for resource in self.resources.drain(..) {
            let name = resource.resource_name().to_string();
            match resource.release().await {
                Ok(()) => info!("Released resource '{}'", name),
                Err(e) => {
                    warn!("Failed to release resource '{}': {}", name, e);
                    failures.push(ConnectionFailure { provider: name, error: e });
                }
            }
        }

        failures
    }
}

impl std::fmt::Debug for ConnectionSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionSupervisor")
            .field("connections", &self.connection_names())
            .field("registry", &self.registry)
            .field("resources", &self.resources.len())
            .finish()
    }
}
