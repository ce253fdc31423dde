//! Registry instances keyed by the resource that declares them

use crate::config::RegistryConfig;
use crate::metrics::RegistryMetrics;
use crate::reconciler::Registry;
use crate::registry::RegistryFactory;
use crate::store::ServiceEntryStore;
use crate::{RegistryError, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// RegistryManager starts, reloads and stops registry instances as their
/// declarations come and go
pub struct RegistryManager {
    factory: RegistryFactory,
    store: Arc<dyn ServiceEntryStore>,
    metrics: RegistryMetrics,
    // Map of registry id (namespace/name) to the running instance
    registries: Mutex<HashMap<String, Arc<Registry>>>,
}

impl RegistryManager {
    pub fn new(
        factory: RegistryFactory,
        store: Arc<dyn ServiceEntryStore>,
        metrics: RegistryMetrics,
    ) -> Self {
        Self {
            factory,
            store,
            metrics,
            registries: Mutex::new(HashMap::new()),
        }
    }

    pub fn metrics(&self) -> &RegistryMetrics {
        &self.metrics
    }

    /// Start the registry `id`, or reload it if it is already running.
    ///
    /// Only a registry that started successfully is kept; a failed start is
    /// retried by the next update. Changing the type of a running registry
    /// stops it and starts a new instance. Host names carry the registry
    /// name, so a name already running under another id is rejected.
    pub async fn update_registry(
        &self,
        id: &str,
        name: &str,
        kind: &str,
        raw_config: &serde_json::Value,
    ) -> Result<()> {
        let config = RegistryConfig::parse(kind, raw_config)?;
        let mut registries = self.registries.lock().await;

        if let Some((other, _)) = registries
            .iter()
            .find(|(other, registry)| other.as_str() != id && registry.name() == name)
        {
            return Err(RegistryError::InvalidConfiguration(format!(
                "registry name {} is already used by {}",
                name, other
            )));
        }

        if let Some(registry) = registries.get(id) {
            if registry.kind() == kind {
                info!("reload registry {}", id);
                return registry.reload(&config).await;
            }

            info!(
                "registry {} changed type from {} to {}, restarting",
                id,
                registry.kind(),
                kind
            );
            if let Some(previous) = registries.remove(id) {
                if let Err(err) = previous.stop().await {
                    warn!("failed to stop registry {}: {}", id, err);
                }
            }
        }

        let registry = self
            .factory
            .create(kind, name, self.store.clone(), self.metrics.clone())?;

        info!("start registry {}", id);
        registry.start(&config).await?;
        registries.insert(id.to_string(), registry);
        Ok(())
    }

    /// Stop and forget the registry `id`; unknown ids are ignored
    pub async fn delete_registry(&self, id: &str) -> Result<()> {
        let Some(registry) = self.registries.lock().await.remove(id) else {
            // happens when deleting a registry that never started
            return Ok(());
        };

        info!("stop registry {}", id);
        registry.stop().await
    }

    pub async fn get(&self, id: &str) -> Option<Arc<Registry>> {
        self.registries.lock().await.get(id).cloned()
    }

    /// Ids of the running registries, sorted
    pub async fn list(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.registries.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Stop every registry
    pub async fn shutdown(&self) {
        let registries: Vec<(String, Arc<Registry>)> =
            self.registries.lock().await.drain().collect();

        for (id, registry) in registries {
            info!("stop registry {}", id);
            if let Err(err) = registry.stop().await {
                warn!("failed to stop registry {}: {}", id, err);
            }
        }
    }
}
