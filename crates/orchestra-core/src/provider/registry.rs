//! Capability registry for runtime provider lookup.

use std::collections::HashMap;

use super::box_provider::BoxCapabilityProvider;

/// Maps capability names to the provider that serves them.
///
/// One provider may be registered under several capabilities.
#[derive(Debug, Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, BoxCapabilityProvider>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider for `capability`, replacing any previous one.
    pub fn register(&mut self, capability: impl Into<String>, provider: BoxCapabilityProvider) {
        self.providers.insert(capability.into(), provider);
    }

    pub fn get(&self, capability: &str) -> Option<&BoxCapabilityProvider> {
        self.providers.get(capability)
    }

    /// Registered capability names, sorted.
    pub fn capabilities(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.providers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}
