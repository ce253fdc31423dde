/// Bindings to the Istio networking CRDs
///
/// Only the subset of ServiceEntry that the registry controller writes is
/// modelled here.

pub mod service_entry;

pub use service_entry::{
    Location, Resolution, ServiceEntry, ServiceEntrySpec, ServicePort, WorkloadEntry,
};
