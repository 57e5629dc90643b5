//! Validated set of module descriptors.
//!
//! The registry holds the descriptors of one configuration in declaration
//! order and provides lookup by instance name.

use std::collections::HashMap;

use super::error::DescriptorError;
use super::traits::Descriptor;

/// Descriptors keyed by their unique instance name.
#[derive(Clone, Default)]
pub struct PluginRegistry {
    /// Descriptors in declaration order
    modules: Vec<Descriptor>,
    /// Index into `modules` by name
    by_name: HashMap<String, usize>,
}

impl PluginRegistry {
    /// Build a registry from configured descriptors.
    ///
    /// Every descriptor is validated, names must be unique, and at least one
    /// module is required.
    pub fn new(modules: Vec<Descriptor>) -> Result<Self, DescriptorError> {
        if modules.is_empty() {
            return Err(DescriptorError::Empty);
        }

        let mut by_name = HashMap::with_capacity(modules.len());
        for (index, desc) in modules.iter().enumerate() {
            desc.validate()?;
            if by_name.insert(desc.name.clone(), index).is_some() {
                return Err(DescriptorError::DuplicateName(desc.name.clone()));
            }
            tracing::debug!(
                module = %desc.name,
                path = %desc.path,
                version = %desc.version,
                position = %desc.position,
                "Registered module"
            );
        }

        Ok(Self { modules, by_name })
    }

    /// Get a descriptor by instance name.
    pub fn get(&self, name: &str) -> Option<&Descriptor> {
        self.by_name.get(name).map(|&i| &self.modules[i])
    }

    /// Descriptors in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = &Descriptor> {
        self.modules.iter()
    }

    /// List all registered instance names.
    pub fn names(&self) -> Vec<&str> {
        self.modules.iter().map(|d| d.name.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}

impl<'a> IntoIterator for &'a PluginRegistry {
    type Item = &'a Descriptor;
    type IntoIter = std::slice::Iter<'a, Descriptor>;

    fn into_iter(self) -> Self::IntoIter {
        self.modules.iter()
    }
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("modules", &self.names())
            .finish_non_exhaustive()
    }
}
