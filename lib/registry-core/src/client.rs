//! Capability interface implemented by each registry client

use crate::config::RegistryConfig;
use crate::error::ClientError;
use crate::key::host_key;
use crate::watch_set::ServiceSet;
use crate::{Endpoint, Result, ServiceKey};
use std::sync::Arc;

/// What a subscription delivers: the current instances, or why there are none
pub type SubscribeResult = std::result::Result<Vec<Endpoint>, ClientError>;

/// Receives membership changes of one subscribed service
#[async_trait::async_trait]
pub trait ServiceListener: Send + Sync {
    async fn on_change(&self, result: SubscribeResult);
}

/// A client for one external registry, bound to one configuration.
///
/// Subscriptions are identified by their key: subscribing a key twice and
/// unsubscribing an unknown key are both no-ops.
#[async_trait::async_trait]
pub trait RegistryClient: Send + Sync {
    /// Namespace the client reads services from
    fn namespace(&self) -> &str;

    /// Groups the client reads services from
    fn groups(&self) -> &[String];

    /// Host key of a service, unique across registries of all types
    fn host_key(&self, key: &ServiceKey, registry_name: &str, kind: &str) -> String {
        host_key([
            key.name(),
            key.group(),
            self.namespace(),
            registry_name,
            kind,
        ])
    }

    /// Fetch the full set of services known to the registry
    async fn fetch_all_services(&self) -> std::result::Result<ServiceSet, ClientError>;

    /// Start delivering membership changes of `key` to `listener`
    async fn subscribe(
        &self,
        key: &ServiceKey,
        listener: Arc<dyn ServiceListener>,
    ) -> std::result::Result<(), ClientError>;

    /// Stop delivering membership changes of `key`
    async fn unsubscribe(&self, key: &ServiceKey) -> std::result::Result<(), ClientError>;
}

/// Builds registry clients from validated configuration, without network I/O
pub trait ClientFactory: Send + Sync {
    fn create(&self, config: &RegistryConfig) -> Result<Arc<dyn RegistryClient>>;
}
