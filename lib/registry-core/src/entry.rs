//! Service entry generation from registry endpoints

use crate::Endpoint;
use registry_api::istio::{Location, Resolution, ServiceEntrySpec, ServicePort, WorkloadEntry};
use std::collections::BTreeMap;
use std::fmt;

/// Metadata key selecting the protocol of an instance
pub const PROTOCOL_METADATA_KEY: &str = "protocol";

/// Protocols a service entry port can carry
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Protocol {
    #[default]
    Http,
    Https,
    Grpc,
    Http2,
    Mongo,
    Tcp,
    Tls,
    Unsupported,
}

impl Protocol {
    pub const ALL: [Protocol; 7] = [
        Protocol::Http,
        Protocol::Https,
        Protocol::Grpc,
        Protocol::Http2,
        Protocol::Mongo,
        Protocol::Tcp,
        Protocol::Tls,
    ];

    /// Parse a protocol name case-insensitively
    pub fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "http" => Protocol::Http,
            "https" => Protocol::Https,
            "grpc" => Protocol::Grpc,
            "http2" => Protocol::Http2,
            "mongo" => Protocol::Mongo,
            "tcp" => Protocol::Tcp,
            "tls" => Protocol::Tls,
            _ => Protocol::Unsupported,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Http => "HTTP",
            Protocol::Https => "HTTPS",
            Protocol::Grpc => "GRPC",
            Protocol::Http2 => "HTTP2",
            Protocol::Mongo => "MONGO",
            Protocol::Tcp => "TCP",
            Protocol::Tls => "TLS",
            Protocol::Unsupported => "Unsupported",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A service entry together with the registry type that produced it
#[derive(Clone, Debug, PartialEq)]
pub struct ServiceEntryWrapper {
    pub spec: ServiceEntrySpec,
    pub source: String,
}

/// Translate the instances of one service into a service entry for `host`.
///
/// The port list carries the port of the first instance only; every instance
/// becomes an endpoint labelled with its registry metadata.
pub fn build_service_entry(host: &str, endpoints: &[Endpoint], source: &str) -> ServiceEntryWrapper {
    let mut ports: Vec<ServicePort> = Vec::with_capacity(1);
    let mut workloads = Vec::with_capacity(endpoints.len());

    for endpoint in endpoints {
        let protocol = endpoint
            .metadata
            .get(PROTOCOL_METADATA_KEY)
            .filter(|p| !p.is_empty())
            .map(|p| Protocol::parse(p))
            .unwrap_or_default();

        let port = ServicePort {
            number: u32::from(endpoint.port),
            protocol: protocol.to_string(),
            name: protocol.to_string(),
        };

        workloads.push(WorkloadEntry {
            address: endpoint.ip.clone(),
            ports: BTreeMap::from([(port.protocol.clone(), port.number)]),
            labels: endpoint.metadata.clone(),
        });

        if ports.is_empty() {
            ports.push(port);
        }
    }

    ServiceEntryWrapper {
        spec: ServiceEntrySpec {
            hosts: vec![host.to_string()],
            ports,
            location: Some(Location::MeshInternal),
            resolution: Some(Resolution::Static),
            endpoints: workloads,
        },
        source: source.to_string(),
    }
}
