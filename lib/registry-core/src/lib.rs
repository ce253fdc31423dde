//! Core service registry synchronization
//!
//! This library provides:
//! - Registry instances mirroring an external registry into service entries
//! - Watch set and soft-deleted set bookkeeping across refresh cycles
//! - The client and store interfaces registry backends plug into
//! - A manager driving registry instances from their declarations

pub mod client;
pub mod config;
pub mod endpoint;
pub mod entry;
pub mod error;
pub mod key;
pub mod manager;
pub mod metrics;
pub mod reconciler;
pub mod registry;
pub mod store;
pub mod watch_set;

#[cfg(test)]
pub(crate) mod testing;

pub use client::{ClientFactory, RegistryClient, ServiceListener, SubscribeResult};
pub use config::{ConsulConfig, NacosConfig, NacosVersion, RegistryConfig};
pub use endpoint::Endpoint;
pub use entry::{build_service_entry, Protocol, ServiceEntryWrapper};
pub use error::{ClientError, RegistryError, Result};
pub use key::{host_key, ServiceKey};
pub use manager::RegistryManager;
pub use metrics::RegistryMetrics;
pub use reconciler::{Phase, Registry};
pub use registry::RegistryFactory;
pub use store::ServiceEntryStore;
pub use watch_set::{ServiceSet, SoftDeletedSet, WatchSet, WatchState};
