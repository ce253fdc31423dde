//! Service registry API types for Kubernetes integration
//!
//! This library defines the resources the registry controller works with:
//! - ServiceRegistry: an external registry (Consul, Nacos) to mirror
//! - ServiceEntry: the Istio resource each mirrored service is published as

pub mod v1alpha1;
pub mod istio;

pub use v1alpha1::ServiceRegistry;
pub use istio::ServiceEntry;
