//! Capability registry for routing capability calls to providers

pub mod service;

pub use service::{CapabilityRegistry, RegisteredCapability, RegistryMetadata};
