//! Name-keyed registry of `ProviderAdapter` implementations.
//!
//! The dispatcher asks the registry which adapter can handle an inbound
//! request path; new upstreams register a single `ProviderAdapter`
//! implementation here and need no other wiring.

use crate::adapter::ProviderAdapter;
use std::collections::HashMap;
use std::sync::Arc;

/// Holds every registered adapter, keyed by its `name()`.
#[derive(Default)]
pub struct AdapterRegistry {
    adapters: HashMap<&'static str, Arc<dyn ProviderAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter under its own name, replacing any prior
    /// registration with the same name.
    pub fn register(&mut self, adapter: Arc<dyn ProviderAdapter>) {
        self.adapters.insert(adapter.name(), adapter);
    }

    /// Look up an adapter by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn ProviderAdapter>> {
        self.adapters.get(name).cloned()
    }

    /// Find the first registered adapter that claims the given request path.
    pub fn find_for_path(&self, path: &str) -> Option<Arc<dyn ProviderAdapter>> {
        self.adapters.values().find(|a| a.can_handle(path)).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anthropic::AnthropicAdapter;

    #[test]
    fn registers_and_looks_up_by_name() {
        let mut registry = AdapterRegistry::new();
        registry.register(Arc::new(AnthropicAdapter));
        assert!(registry.get("anthropic").is_some());
        assert!(registry.get("openai-compatible").is_none());
    }

    #[test]
    fn finds_adapter_for_handled_path() {
        let mut registry = AdapterRegistry::new();
        registry.register(Arc::new(AnthropicAdapter));
        let found = registry.find_for_path("/v1/messages").unwrap();
        assert_eq!(found.name(), "anthropic");
    }

    #[test]
    fn returns_none_for_unhandled_path() {
        let registry = AdapterRegistry::new();
        assert!(registry.find_for_path("/v1/unknown").is_none());
    }

    #[test]
    fn re_registering_same_name_replaces_entry() {
        let mut registry = AdapterRegistry::new();
        registry.register(Arc::new(AnthropicAdapter));
        registry.register(Arc::new(AnthropicAdapter));
        assert_eq!(registry.adapters.len(), 1);
    }
}
