//! Capability registry: the process-wide catalog of invocable capabilities.
//!
//! Populated at startup and then shared behind an `Arc`, which closes it for
//! writes before any run begins.

pub mod descriptor;

pub use descriptor::{
    CapabilityDescriptor, CapabilityError, CapabilityHandler, ErrorClass, InputParam,
    OutputField, ValueKind,
};

use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("capability `{name}` is already registered")]
    DuplicateCapability { name: String },
    #[error("unknown capability `{name}`")]
    UnknownCapability { name: String },
}

#[derive(Debug, Clone, Default)]
pub struct CapabilityRegistry {
    capabilities: BTreeMap<String, CapabilityDescriptor>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, descriptor: CapabilityDescriptor) -> Result<(), RegistryError> {
        let name = descriptor.name.as_str().to_string();
        if self.capabilities.contains_key(&name) {
            return Err(RegistryError::DuplicateCapability { name });
        }
        tracing::debug!(capability = %name, "capability registered");
        self.capabilities.insert(name, descriptor);
        Ok(())
    }

    pub fn lookup(&self, name: &str) -> Result<&CapabilityDescriptor, RegistryError> {
        self.capabilities
            .get(name)
            .ok_or_else(|| RegistryError::UnknownCapability {
                name: name.to_string(),
            })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.capabilities.contains_key(name)
    }

    /// Descriptors in name order. Call again to restart the sequence.
    pub fn list(&self) -> impl Iterator<Item = &CapabilityDescriptor> + Clone + '_ {
        self.capabilities.values()
    }

    pub fn len(&self) -> usize {
        self.capabilities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.capabilities.is_empty()
    }

    pub fn catalog(&self) -> Vec<CatalogEntry> {
        self.list().map(CatalogEntry::from).collect()
    }
}

/// What the plan generator is told about one capability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogEntry {
    pub name: String,
    pub description: String,
    pub inputs: Vec<InputParam>,
    pub outputs: Vec<OutputField>,
}

impl From<&CapabilityDescriptor> for CatalogEntry {
    fn from(descriptor: &CapabilityDescriptor) -> Self {
        Self {
            name: descriptor.name.to_string(),
            description: descriptor.description.clone(),
            inputs: descriptor.inputs.clone(),
            outputs: descriptor.outputs.clone(),
        }
    }
}
