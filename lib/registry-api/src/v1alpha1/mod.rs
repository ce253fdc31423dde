/// API version v1alpha1 for service registry CRDs

pub mod service_registry;

pub use service_registry::{ServiceRegistry, ServiceRegistrySpec, ServiceRegistryStatus};

/// API group for service registry resources
pub const API_GROUP: &str = "registry.datum.net";
/// API version for service registry resources
pub const API_VERSION: &str = "v1alpha1";
