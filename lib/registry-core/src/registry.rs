//! Registry factories keyed by registry type

use crate::client::ClientFactory;
use crate::metrics::RegistryMetrics;
use crate::reconciler::Registry;
use crate::store::ServiceEntryStore;
use crate::{RegistryError, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

/// Table of client factories, one per registry type name
#[derive(Clone, Default)]
pub struct RegistryFactory {
    factories: HashMap<String, Arc<dyn ClientFactory>>,
}

impl RegistryFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the client factory of a registry type.
    ///
    /// Registering a type again replaces the previous factory.
    pub fn register(&mut self, kind: impl Into<String>, factory: Arc<dyn ClientFactory>) {
        let kind = kind.into();
        info!("register registry {}", kind);
        self.factories.insert(kind, factory);
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.factories.contains_key(kind)
    }

    /// Registered type names, sorted
    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.factories.keys().cloned().collect();
        kinds.sort();
        kinds
    }

    /// Create a stopped registry instance of type `kind`
    pub fn create(
        &self,
        kind: &str,
        name: &str,
        store: Arc<dyn ServiceEntryStore>,
        metrics: RegistryMetrics,
    ) -> Result<Arc<Registry>> {
        let factory = self
            .factories
            .get(kind)
            .ok_or_else(|| RegistryError::UnknownRegistry(kind.to_string()))?;

        Ok(Arc::new(Registry::new(
            name,
            kind,
            factory.clone(),
            store,
            metrics,
        )))
    }
}
