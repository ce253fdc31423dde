use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// ServiceEntry from Istio - Adds an entry to the mesh's internal service
/// registry so that workloads can route to hosts that live outside Kubernetes
#[derive(CustomResource, Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "networking.istio.io",
    version = "v1beta1",
    kind = "ServiceEntry",
    plural = "serviceentries",
    namespaced,
    derive = "Default",
)]
#[serde(rename_all = "camelCase")]
pub struct ServiceEntrySpec {
    /// Hosts associated with the entry
    pub hosts: Vec<String>,

    /// Ports associated with the external service
    #[serde(default)]
    pub ports: Vec<ServicePort>,

    /// Whether the service is considered part of the mesh
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,

    /// Service resolution mode for the hosts
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolution: Option<Resolution>,

    /// Endpoints associated with the service
    #[serde(default)]
    pub endpoints: Vec<WorkloadEntry>,
}

/// Port of a ServiceEntry
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ServicePort {
    /// Port number
    pub number: u32,

    /// Protocol exposed on the port (HTTP, HTTPS, GRPC, HTTP2, MONGO, TCP, TLS)
    pub protocol: String,

    /// Label assigned to the port
    pub name: String,
}

/// A single endpoint of a ServiceEntry
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct WorkloadEntry {
    /// Address of the endpoint
    pub address: String,

    /// Port name to port number mapping
    #[serde(default)]
    pub ports: BTreeMap<String, u32>,

    /// Labels of the endpoint, taken from the registry instance metadata
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

/// Location of the service relative to the mesh
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Location {
    MeshExternal,
    #[default]
    MeshInternal,
}

/// How the proxy resolves the addresses of the endpoints
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Resolution {
    None,
    #[default]
    Static,
    Dns,
    DnsRoundRobin,
}
