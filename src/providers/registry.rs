use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::info;

use crate::action::ActionKind;
use crate::config::ProvidersConfig;

use super::builtin::builtin_provider;
use super::Provider;

/// Maps each action kind to the provider that performs it.
///
/// Built once at startup and read-only afterwards; the dispatcher looks
/// providers up by kind on every request.
pub struct ProviderRegistry {
    providers: BTreeMap<ActionKind, Arc<dyn Provider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self {
            providers: BTreeMap::new(),
        }
    }

    /// Registry holding every builtin provider, configured from `config`.
    pub fn builtin(config: &ProvidersConfig) -> Self {
        let mut registry = Self::new();
        for kind in ActionKind::BUILTIN {
            if let Some(provider) = builtin_provider(&kind, config) {
                registry.register(provider);
            }
        }
        registry
    }

    /// Registers a provider under its own kind, replacing any previous one.
    pub fn register(&mut self, provider: Arc<dyn Provider>) {
        let kind = provider.kind();
        let missing = provider.missing_requirements();
        if missing.is_empty() {
            info!("Registered provider: {kind}");
        } else {
            info!("Registered provider: {kind} (not configured: {})", missing.join(", "));
        }
        self.providers.insert(kind, provider);
    }

    pub fn get(&self, kind: &ActionKind) -> Option<Arc<dyn Provider>> {
        self.providers.get(kind).cloned()
    }

    /// Registered kinds in stable order.
    pub fn kinds(&self) -> Vec<ActionKind> {
        self.providers.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Provider>> {
        self.providers.values()
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
