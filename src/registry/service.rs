//! Capability registry: maps each capability name to the connection that serves it

use crate::provider::{CapabilityDescriptor, ProviderConnection};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// A capability together with the provider that owns it
#[derive(Clone)]
pub struct RegisteredCapability {
    pub descriptor: CapabilityDescriptor,
    pub provider: String,
    pub connection: Arc<dyn ProviderConnection>,
}

impl fmt::Debug for RegisteredCapability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredCapability")
            .field("name", &self.descriptor.name)
            .field("provider", &self.provider)
            .finish()
    }
}

/// Registry metadata
#[derive(Debug, Clone)]
pub struct RegistryMetadata {
    /// Number of registered capabilities
    pub capability_count: usize,

    /// Registrations that replaced an earlier provider's capability
    pub overridden_count: usize,

    /// Last update timestamp
    pub last_updated: Instant,
}

/// Capability name to owning connection.
///
/// Names are unique. When two providers expose the same name the later
/// registration wins and the earlier entry is dropped, so `list()` keeps
/// registration order without duplicates.
#[derive(Clone)]
pub struct CapabilityRegistry {
    entries: Vec<RegisteredCapability>,
    index: HashMap<String, usize>,
    metadata: RegistryMetadata,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            index: HashMap::new(),
            metadata: RegistryMetadata {
                capability_count: 0,
                overridden_count: 0,
                last_updated: Instant::now(),
            },
        }
    }

    /// Register every descriptor a connection exposes.
    ///
    /// Returns the names that replaced an earlier provider's entry.
    pub fn register(
        &mut self,
        connection: Arc<dyn ProviderConnection>,
        descriptors: Vec<CapabilityDescriptor>,
    ) -> Vec<String> {
        let provider = connection.name().to_string();
        let mut overridden = Vec::new();

        for descriptor in descriptors {
            let name = descriptor.name.clone();

            if let Some(previous) = self.index.get(&name).copied() {
                let previous_provider = self.entries[previous].provider.clone();
                warn!(
                    "Capability '{}' from provider '{}' overrides the one from provider '{}'",
                    name, provider, previous_provider
                );
                self.entries.remove(previous);
                overridden.push(name.clone());
            }

            self.entries.push(RegisteredCapability {
                descriptor,
                provider: provider.clone(),
                connection: Arc::clone(&connection),
            });
            self.reindex();
            debug!("Registered capability '{}' from provider '{}'", name, provider);
        }

        self.metadata.capability_count = self.entries.len();
        self.metadata.overridden_count += overridden.len();
        self.metadata.last_updated = Instant::now();
        overridden
    }

    fn reindex(&mut self) {
        self.index = self
            .entries
            .iter()
            .enumerate()
            .map(|(i, entry)| (entry.descriptor.name.clone(), i))
            .collect();
    }

    /// All descriptors in registration order
    pub fn list(&self) -> Vec<CapabilityDescriptor> {
        self.entries.iter().map(|entry| entry.descriptor.clone()).collect()
    }

    pub fn entries(&self) -> &[RegisteredCapability] {
        &self.entries
    }

    /// Look up the entry for a capability name
    pub fn resolve(&self, name: &str) -> Option<&RegisteredCapability> {
        self.index.get(name).map(|&i| &self.entries[i])
    }

    /// Name of the provider that serves a capability
    pub fn owner(&self, name: &str) -> Option<&str> {
        self.resolve(name).map(|entry| entry.provider.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Providers that own at least one capability, in first-seen order
    pub fn providers(&self) -> Vec<String> {
        let mut providers: Vec<String> = Vec::new();
        for entry in &self.entries {
            if !providers.contains(&entry.provider) {
                providers.push(entry.provider.clone());
            }
        }
        providers
    }

    pub fn metadata(&self) -> &RegistryMetadata {
        &self.metadata
    }
}

impl Default for CapabilityRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CapabilityRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapabilityRegistry")
            .field("entries", &self.entries)
            .field("metadata", &self.metadata)
            .finish()
    }
}
