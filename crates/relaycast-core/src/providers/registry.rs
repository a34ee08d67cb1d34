use std::collections::HashMap;
use std::sync::Arc;

use relaycast_common::types::ChannelType;

use super::MessageProvider;

/// Maps provider names to their implementations.
///
/// Built once at startup and then shared behind an `Arc`.
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn MessageProvider>>,
}

impl ProviderRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            providers: HashMap::new(),
        }
    }

    /// Register a provider under its own name, replacing any previous one.
    pub fn register(&mut self, provider: Arc<dyn MessageProvider>) {
        let name = provider.name().to_owned();
        self.providers.insert(name, provider);
    }

    /// Look up a provider by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn MessageProvider>> {
        self.providers.get(name).cloned()
    }

    /// Sorted list of all registered provider names.
    pub fn list(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.providers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Providers delivering `channel`, in name order.
    pub fn for_channel(&self, channel: ChannelType) -> Vec<Arc<dyn MessageProvider>> {
        self.list()
            .into_iter()
            .filter_map(|name| self.get(name))
            .filter(|p| p.channel() == channel)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}
