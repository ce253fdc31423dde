//! Registry clients for Consul and Nacos
pub mod consul;
pub mod http;
pub mod nacos;
pub mod subscription;

#[cfg(test)]
mod testing;

pub use consul::ConsulClient;
pub use nacos::NacosClient;

use registry_core::config::{CONSUL, NACOS};
use registry_core::{ClientFactory, RegistryClient, RegistryConfig, RegistryError, RegistryFactory};
use std::sync::Arc;

/// Builds [`ConsulClient`]s
pub struct ConsulClientFactory;

impl ClientFactory for ConsulClientFactory {
    fn create(&self, config: &RegistryConfig) -> registry_core::Result<Arc<dyn RegistryClient>> {
        match config {
            RegistryConfig::Consul(config) => Ok(Arc::new(ConsulClient::new(config)?)),
            other => Err(mismatch(CONSUL, other)),
        }
    }
}

/// Builds [`NacosClient`]s
pub struct NacosClientFactory;

impl ClientFactory for NacosClientFactory {
    fn create(&self, config: &RegistryConfig) -> registry_core::Result<Arc<dyn RegistryClient>> {
        match config {
            RegistryConfig::Nacos(config) => Ok(Arc::new(NacosClient::new(config)?)),
            other => Err(mismatch(NACOS, other)),
        }
    }
}

fn mismatch(expected: &str, config: &RegistryConfig) -> RegistryError {
    RegistryError::InvalidConfiguration(format!(
        "expected a {} config, got a {} config",
        expected,
        config.kind()
    ))
}

/// Factory table with every built-in registry type
pub fn builtin_factories() -> RegistryFactory {
    let mut factories = RegistryFactory::new();
    factories.register(CONSUL, Arc::new(ConsulClientFactory));
    factories.register(NACOS, Arc::new(NacosClientFactory));
    factories
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_builtin_factories() {
        let factories = builtin_factories();
        assert_eq!(factories.kinds(), vec!["consul".to_string(), "nacos".to_string()]);
    }

    #[test]
    fn test_factory_rejects_other_kind() {
        let config =
            RegistryConfig::parse("nacos", &json!({"serverUrl": "http://127.0.0.1:8848"})).unwrap();

        assert!(NacosClientFactory.create(&config).is_ok());
        assert!(matches!(
            ConsulClientFactory.create(&config),
            Err(RegistryError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn test_consul_factory() {
        let config = RegistryConfig::parse(
            "consul",
            &json!({"serverUrl": "http://127.0.0.1:8500", "dataCenter": "dc1", "namespace": "team"}),
        )
        .unwrap();

        let client = ConsulClientFactory.create(&config).unwrap();
        assert_eq!(client.namespace(), "team");
        assert!(client.groups().is_empty());
    }
}
