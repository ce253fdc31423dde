//! Consul catalog client

use crate::http::{self, REQUEST_TIMEOUT};
use crate::subscription::Subscriptions;
use registry_core::config::{parse_server_url, ConsulConfig};
use registry_core::{
    host_key, ClientError, Endpoint, RegistryClient, ServiceKey, ServiceListener, ServiceSet,
};
use reqwest::header::HeaderMap;
use reqwest::{Client, RequestBuilder};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

const TOKEN_HEADER: &str = "X-Consul-Token";
const INDEX_HEADER: &str = "X-Consul-Index";

/// How long a blocking query may wait for a change
const BLOCKING_WAIT: Duration = Duration::from_secs(30);
const MIN_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Read side of the Consul HTTP API shared by the client and its watch tasks
struct ConsulApi {
    http: Client,
    base: Url,
    data_center: String,
    namespace: String,
    token: Option<String>,
}

impl ConsulApi {
    fn get(&self, path: &str) -> RequestBuilder {
        let mut request = self.http.get(http::endpoint(&self.base, path));
        if !self.data_center.is_empty() {
            request = request.query(&[("dc", self.data_center.as_str())]);
        }
        if !self.namespace.is_empty() {
            request = request.query(&[("ns", self.namespace.as_str())]);
        }
        if let Some(token) = self.token.as_deref().filter(|t| !t.is_empty()) {
            request = request.header(TOKEN_HEADER, token);
        }
        request
    }

    async fn services(&self) -> Result<HashMap<String, Vec<String>>, ClientError> {
        http::get_json(self.get("/v1/catalog/services")).await
    }

    /// One blocking query on the health of `service`, returning the new index
    async fn health(
        &self,
        service: &str,
        index: u64,
    ) -> Result<(u64, Vec<Endpoint>), ClientError> {
        let path = format!("/v1/health/service/{}", service);
        let mut request = self.get(&path);
        if index > 0 {
            request = request
                .query(&[("index", index.to_string())])
                .query(&[("wait", format!("{}s", BLOCKING_WAIT.as_secs()))])
                .timeout(BLOCKING_WAIT + REQUEST_TIMEOUT);
        }

        let response = http::send(request).await?;
        let next = response_index(response.headers());
        let body = response.bytes().await.map_err(ClientError::transport)?;
        let entries: Vec<HealthEntry> = http::decode(&body)?;
        Ok((next, to_endpoints(entries)))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct HealthEntry {
    #[serde(default)]
    node: HealthNode,
    service: HealthService,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct HealthNode {
    #[serde(default)]
    address: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct HealthService {
    #[serde(default)]
    address: String,
    port: u16,
    #[serde(default)]
    meta: Option<BTreeMap<String, String>>,
}

fn to_endpoints(entries: Vec<HealthEntry>) -> Vec<Endpoint> {
    entries
        .into_iter()
        .map(|entry| {
            let ip = if entry.service.address.is_empty() {
                entry.node.address
            } else {
                entry.service.address
            };
            Endpoint {
                ip,
                port: entry.service.port,
                metadata: entry.service.meta.unwrap_or_default(),
            }
        })
        .collect()
}

fn response_index(headers: &HeaderMap) -> u64 {
    headers
        .get(INDEX_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}

/// Services of a catalog listing, grouped by their joined tags
fn to_service_set(services: HashMap<String, Vec<String>>) -> ServiceSet {
    services
        .into_iter()
        .map(|(name, tags)| ServiceKey::new(tags.join("-"), name))
        .collect()
}

/// Client for one Consul datacenter and namespace
pub struct ConsulClient {
    api: Arc<ConsulApi>,
    groups: Vec<String>,
    subscriptions: Subscriptions,
}

impl ConsulClient {
    pub fn new(config: &ConsulConfig) -> registry_core::Result<Self> {
        let base = parse_server_url(&config.server_url)?;
        let api = ConsulApi {
            http: http::build_client()?,
            base,
            data_center: config.data_center.clone(),
            namespace: config.namespace.clone(),
            token: config.token.clone(),
        };

        Ok(Self {
            api: Arc::new(api),
            groups: Vec::new(),
            subscriptions: Subscriptions::new(),
        })
    }

    pub fn data_center(&self) -> &str {
        &self.api.data_center
    }
}

#[async_trait::async_trait]
impl RegistryClient for ConsulClient {
    fn namespace(&self) -> &str {
        &self.api.namespace
    }

    fn groups(&self) -> &[String] {
        &self.groups
    }

    fn host_key(&self, key: &ServiceKey, registry_name: &str, kind: &str) -> String {
        host_key([
            key.group(),
            key.name(),
            self.namespace(),
            self.data_center(),
            registry_name,
            kind,
        ])
    }

    async fn fetch_all_services(&self) -> Result<ServiceSet, ClientError> {
        let services = self.api.services().await?;
        debug!(services = services.len(), "fetched consul catalog");
        Ok(to_service_set(services))
    }

    async fn subscribe(
        &self,
        key: &ServiceKey,
        listener: Arc<dyn ServiceListener>,
    ) -> Result<(), ClientError> {
        let Some(token) = self.subscriptions.register(key) else {
            return Ok(());
        };

        tokio::spawn(watch_service(
            self.api.clone(),
            key.clone(),
            listener,
            token,
        ));
        Ok(())
    }

    async fn unsubscribe(&self, key: &ServiceKey) -> Result<(), ClientError> {
        self.subscriptions.cancel(key);
        Ok(())
    }
}

/// Run blocking queries on the health of `key` until cancelled
async fn watch_service(
    api: Arc<ConsulApi>,
    key: ServiceKey,
    listener: Arc<dyn ServiceListener>,
    token: CancellationToken,
) {
    let mut index = 0u64;
    let mut backoff = MIN_BACKOFF;

    loop {
        let result = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            result = api.health(key.name(), index) => result,
        };

        match result {
            Ok((next, endpoints)) => {
                backoff = MIN_BACKOFF;
                if next == index && index > 0 {
                    // wait timed out without a change
                    continue;
                }
                index = next_index(index, next);

                if endpoints.is_empty() {
                    listener
                        .on_change(Err(ClientError::NoHosts(key.to_string())))
                        .await;
                } else {
                    listener.on_change(Ok(endpoints)).await;
                }

                if index == 0 {
                    // no usable index, the next query would not block
                    tokio::select! {
                        biased;
                        _ = token.cancelled() => break,
                        _ = tokio::time::sleep(MIN_BACKOFF) => {}
                    }
                }
            }
            Err(err) => {
                warn!(service = %key, "consul blocking query failed, err: {}", err);
                listener.on_change(Err(err)).await;

                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(backoff) => {}
                }
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }
        }
    }

    debug!(service = %key, "consul watch stopped");
}

/// Index to send with the next blocking query
fn next_index(current: u64, returned: u64) -> u64 {
    // an index going backwards means the raft state was reset
    if returned < current {
        return 0;
    }
    returned
}
