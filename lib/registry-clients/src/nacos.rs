//! Nacos naming client over the v1 and v2 open APIs

use crate::http;
use crate::subscription::{poll_instances, start_jitter, Subscriptions};
use registry_core::config::{parse_server_url, NacosConfig};
use registry_core::{
    ClientError, Endpoint, NacosVersion, RegistryClient, ServiceKey, ServiceListener, ServiceSet,
};
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info};
use url::Url;

const PAGE_SIZE: u32 = 1000;

/// Period of the instance polls of one subscription
pub const POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Upper bound of the random delay before the first poll
pub const POLL_JITTER: Duration = Duration::from_secs(1);

/// Token lifetime assumed when the login response carries none
const DEFAULT_TOKEN_TTL: u64 = 18000;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoginResponse {
    access_token: String,
    #[serde(default)]
    token_ttl: Option<u64>,
}

/// Response envelope of the v2 API
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    code: i32,
    #[serde(default)]
    message: String,
    data: Option<T>,
}

impl<T> Envelope<T> {
    fn into_data(self) -> Result<T, ClientError> {
        if self.code != 0 {
            return Err(ClientError::Response(format!(
                "nacos returned code {}: {}",
                self.code, self.message
            )));
        }
        self.data
            .ok_or_else(|| ClientError::Response("nacos returned no data".to_string()))
    }
}

#[derive(Debug, Default, Deserialize)]
struct ServicePage {
    #[serde(default)]
    count: usize,
    #[serde(default, alias = "services")]
    doms: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct InstanceList {
    #[serde(default)]
    hosts: Vec<Instance>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Instance {
    ip: String,
    port: u16,
    #[serde(default = "enabled_default")]
    enabled: bool,
    #[serde(default = "enabled_default")]
    healthy: bool,
    #[serde(default)]
    metadata: BTreeMap<String, String>,
}

fn enabled_default() -> bool {
    true
}

fn to_endpoints(list: InstanceList) -> Vec<Endpoint> {
    list.hosts
        .into_iter()
        .filter(|instance| instance.enabled && instance.healthy)
        .map(|instance| Endpoint {
            ip: instance.ip,
            port: instance.port,
            metadata: instance.metadata,
        })
        .collect()
}

struct AccessToken {
    value: String,
    refresh_at: Instant,
}

/// Naming API of one Nacos namespace, shared with the polling tasks
struct NacosApi {
    http: Client,
    base: Url,
    version: NacosVersion,
    namespace: String,
    credentials: Option<(String, String)>,
    token: Mutex<Option<AccessToken>>,
}

impl NacosApi {
    fn path(&self, resource: &str) -> String {
        match self.version {
            NacosVersion::V1 => format!("/nacos/v1/ns/{}", resource),
            NacosVersion::V2 => format!("/nacos/v2/ns/{}", resource),
        }
    }

    /// Current access token, logging in again once it is about to expire
    async fn access_token(&self) -> Result<Option<String>, ClientError> {
        let Some((username, password)) = &self.credentials else {
            return Ok(None);
        };

        let mut token = self.token.lock().await;
        if let Some(current) = token.as_ref() {
            if Instant::now() < current.refresh_at {
                return Ok(Some(current.value.clone()));
            }
        }

        let url = http::endpoint(&self.base, "/nacos/v1/auth/login");
        let response = http::send(
            self.http
                .post(url)
                .form(&[("username", username.as_str()), ("password", password.as_str())]),
        )
        .await
        .map_err(|err| ClientError::Auth(err.to_string()))?;
        let body = response.bytes().await.map_err(ClientError::transport)?;
        let login: LoginResponse =
            http::decode(&body).map_err(|err| ClientError::Auth(err.to_string()))?;

        let ttl = login.token_ttl.unwrap_or(DEFAULT_TOKEN_TTL);
        debug!("nacos login succeeded, token expires in {}s", ttl);
        *token = Some(AccessToken {
            value: login.access_token.clone(),
            refresh_at: Instant::now() + refresh_after(ttl),
        });
        Ok(Some(login.access_token))
    }

    async fn get(&self, resource: &str) -> Result<RequestBuilder, ClientError> {
        let url = http::endpoint(&self.base, &self.path(resource));
        let mut request = self.http.get(url);
        if let Some(token) = self.access_token().await? {
            request = request.query(&[("accessToken", token)]);
        }
        Ok(request)
    }

    async fn fetch<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
    ) -> Result<T, ClientError> {
        match self.version {
            NacosVersion::V1 => http::get_json(request).await,
            NacosVersion::V2 => http::get_json::<Envelope<T>>(request).await?.into_data(),
        }
    }

    async fn service_page(&self, group: &str, page: u32) -> Result<ServicePage, ClientError> {
        let request = self.get("service/list").await?.query(&[
            ("pageNo", page.to_string()),
            ("pageSize", PAGE_SIZE.to_string()),
            ("groupName", group.to_string()),
            ("namespaceId", self.namespace.clone()),
        ]);
        self.fetch(request).await
    }

    async fn services(&self, group: &str) -> Result<Vec<String>, ClientError> {
        let mut names = Vec::new();
        let mut page = 1;
        loop {
            let result = self.service_page(group, page).await?;
            let received = result.doms.len();
            names.extend(result.doms);
            if received == 0 || names.len() >= result.count {
                return Ok(names);
            }
            page += 1;
        }
    }

    async fn instances(&self, key: &ServiceKey) -> Result<Vec<Endpoint>, ClientError> {
        let request = self.get("instance/list").await?.query(&[
            ("serviceName", key.name()),
            ("groupName", key.group()),
            ("namespaceId", self.namespace.as_str()),
            ("healthyOnly", "true"),
        ]);
        let list: InstanceList = self.fetch(request).await?;
        Ok(to_endpoints(list))
    }
}

/// Refresh a token once 90% of its lifetime has passed
fn refresh_after(ttl_secs: u64) -> Duration {
    Duration::from_secs(ttl_secs - ttl_secs / 10)
}

/// Client for one Nacos namespace and its groups
pub struct NacosClient {
    api: Arc<NacosApi>,
    groups: Vec<String>,
    subscriptions: Subscriptions,
}

impl NacosClient {
    pub fn new(config: &NacosConfig) -> registry_core::Result<Self> {
        let base = parse_server_url(&config.server_url)?;
        let credentials = config
            .username
            .clone()
            .filter(|u| !u.is_empty())
            .map(|u| (u, config.password.clone().unwrap_or_default()));

        let api = NacosApi {
            http: http::build_client()?,
            base,
            version: config.version,
            namespace: config.namespace().to_string(),
            credentials,
            token: Mutex::new(None),
        };

        Ok(Self {
            api: Arc::new(api),
            groups: config.groups(),
            subscriptions: Subscriptions::new(),
        })
    }

    pub fn version(&self) -> NacosVersion {
        self.api.version
    }
}

#[async_trait::async_trait]
impl RegistryClient for NacosClient {
    fn namespace(&self) -> &str {
        &self.api.namespace
    }

    fn groups(&self) -> &[String] {
        &self.groups
    }

    async fn fetch_all_services(&self) -> Result<ServiceSet, ClientError> {
        let mut services = ServiceSet::new();
        for group in &self.groups {
            let names = self.api.services(group).await?;
            debug!(group = %group, services = names.len(), "fetched nacos services");
            services.extend(names.into_iter().map(|name| ServiceKey::new(group.clone(), name)));
        }
        Ok(services)
    }

    async fn subscribe(
        &self,
        key: &ServiceKey,
        listener: Arc<dyn ServiceListener>,
    ) -> Result<(), ClientError> {
        let Some(token) = self.subscriptions.register(key) else {
            return Ok(());
        };

        let api = self.api.clone();
        let polled = key.clone();
        tokio::spawn(poll_instances(
            key.clone(),
            listener,
            token,
            start_jitter(POLL_JITTER),
            POLL_INTERVAL,
            move || {
                let api = api.clone();
                let key = polled.clone();
                async move { api.instances(&key).await }
            },
        ));
        Ok(())
    }

    async fn unsubscribe(&self, key: &ServiceKey) -> Result<(), ClientError> {
        if self.subscriptions.cancel(key) {
            info!(service = %key, "unsubscribed nacos service");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{wait_for, Recorder};
    use serde_json::json;
    use wiremock::matchers::{body_string_contains, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(version: NacosVersion) -> NacosConfig {
        NacosConfig {
            server_url: "http://127.0.0.1:8848".to_string(),
            version,
            ..Default::default()
        }
    }

    #[test]
    fn test_defaults() {
        let client = NacosClient::new(&config(NacosVersion::V1)).unwrap();
        assert_eq!(client.namespace(), "public");
        assert_eq!(client.groups(), &["DEFAULT_GROUP".to_string()]);
        assert!(client.api.credentials.is_none());
    }

    #[test]
    fn test_paths() {
        let v1 = NacosClient::new(&config(NacosVersion::V1)).unwrap();
        assert_eq!(v1.api.path("service/list"), "/nacos/v1/ns/service/list");

        let v2 = NacosClient::new(&config(NacosVersion::V2)).unwrap();
        assert_eq!(v2.api.path("instance/list"), "/nacos/v2/ns/instance/list");
    }

    #[test]
    fn test_host_key() {
        let mut config = config(NacosVersion::V1);
        config.namespace = Some("Dev_Env".to_string());
        let client = NacosClient::new(&config).unwrap();
        let key = ServiceKey::new("DEFAULT_GROUP", "order_service");

        assert_eq!(
            client.host_key(&key, "earth", "nacos"),
            "order-service.default-group.dev-env.earth.nacos"
        );
    }

    #[test]
    fn test_v1_decoding() {
        let page: ServicePage = http::decode(br#"{"count": 2, "doms": ["a", "b"]}"#).unwrap();
        assert_eq!(page.count, 2);
        assert_eq!(page.doms, vec!["a".to_string(), "b".to_string()]);

        let list: InstanceList = http::decode(
            br#"{
                "name": "DEFAULT_GROUP@@a",
                "hosts": [
                    {"ip": "10.0.0.1", "port": 8080, "enabled": true, "healthy": true, "metadata": {"protocol": "grpc"}},
                    {"ip": "10.0.0.2", "port": 8080, "enabled": false, "healthy": true, "metadata": {}},
                    {"ip": "10.0.0.3", "port": 8080, "enabled": true, "healthy": false}
                ]
            }"#,
        )
        .unwrap();
        assert_eq!(
            to_endpoints(list),
            vec![Endpoint::new("10.0.0.1", 8080).with_metadata("protocol", "grpc")]
        );
    }

    #[test]
    fn test_v2_decoding() {
        let envelope: Envelope<ServicePage> = http::decode(
            br#"{"code": 0, "message": "success", "data": {"count": 1, "services": ["a"]}}"#,
        )
        .unwrap();
        let page = envelope.into_data().unwrap();
        assert_eq!(page.doms, vec!["a".to_string()]);

        let envelope: Envelope<InstanceList> = http::decode(
            br#"{"code": 20004, "message": "service not found", "data": null}"#,
        )
        .unwrap();
        let err = envelope.into_data().unwrap_err();
        assert!(err.to_string().contains("20004"));
    }

    #[test]
    fn test_login_decoding() {
        let login: LoginResponse = http::decode(
            br#"{"accessToken": "token", "tokenTtl": 18000, "globalAdmin": true}"#,
        )
        .unwrap();
        assert_eq!(login.access_token, "token");
        assert_eq!(login.token_ttl, Some(18000));
        assert_eq!(refresh_after(18000), Duration::from_secs(16200));
    }

    #[tokio::test]
    async fn test_anonymous_access_has_no_token() {
        let client = NacosClient::new(&config(NacosVersion::V1)).unwrap();
        assert_eq!(client.api.access_token().await.unwrap(), None);
    }

    fn server_config(server: &MockServer, version: NacosVersion) -> NacosConfig {
        NacosConfig {
            server_url: server.uri(),
            version,
            ..Default::default()
        }
    }

    fn ok_json(body: serde_json::Value) -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_json(body)
    }

    #[tokio::test]
    async fn test_service_list_is_paged() {
        let server = MockServer::start().await;
        let names: Vec<String> = (0..1500).map(|i| format!("svc-{}", i)).collect();
        for (page, chunk) in names.chunks(PAGE_SIZE as usize).enumerate() {
            Mock::given(method("GET"))
                .and(path("/nacos/v1/ns/service/list"))
                .and(query_param("pageNo", (page + 1).to_string()))
                .and(query_param("pageSize", "1000"))
                .and(query_param("groupName", "DEFAULT_GROUP"))
                .and(query_param("namespaceId", "public"))
                .respond_with(ok_json(json!({"count": 1500, "doms": chunk})))
                .expect(1)
                .mount(&server)
                .await;
        }

        let client = NacosClient::new(&server_config(&server, NacosVersion::V1)).unwrap();
        let services = client.fetch_all_services().await.unwrap().sorted();

        assert_eq!(services.len(), 1500);
        assert!(services.contains(&ServiceKey::new("DEFAULT_GROUP", "svc-1499")));
        server.verify().await;
    }

    #[tokio::test]
    async fn test_login_token_is_cached() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/nacos/v1/auth/login"))
            .and(body_string_contains("username=nacos"))
            .respond_with(ok_json(json!({"accessToken": "t1", "tokenTtl": 18000})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/nacos/v1/ns/service/list"))
            .and(query_param("accessToken", "t1"))
            .respond_with(ok_json(json!({"count": 1, "doms": ["orders"]})))
            .expect(2)
            .mount(&server)
            .await;

        let mut config = server_config(&server, NacosVersion::V1);
        config.username = Some("nacos".to_string());
        config.password = Some("secret".to_string());
        let client = NacosClient::new(&config).unwrap();

        client.fetch_all_services().await.unwrap();
        client.fetch_all_services().await.unwrap();
        server.verify().await;
    }

    #[tokio::test]
    async fn test_expired_token_logs_in_again() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/nacos/v1/auth/login"))
            .respond_with(ok_json(json!({"accessToken": "t1", "tokenTtl": 0})))
            .expect(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/nacos/v1/ns/service/list"))
            .respond_with(ok_json(json!({"count": 0, "doms": []})))
            .mount(&server)
            .await;

        let mut config = server_config(&server, NacosVersion::V1);
        config.username = Some("nacos".to_string());
        config.password = Some("secret".to_string());
        let client = NacosClient::new(&config).unwrap();

        client.fetch_all_services().await.unwrap();
        client.fetch_all_services().await.unwrap();
        server.verify().await;
    }

    #[tokio::test]
    async fn test_login_failure_is_auth_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/nacos/v1/auth/login"))
            .respond_with(ResponseTemplate::new(403).set_body_string("unknown user"))
            .mount(&server)
            .await;

        let mut config = server_config(&server, NacosVersion::V1);
        config.username = Some("nacos".to_string());
        config.password = Some("wrong".to_string());
        let client = NacosClient::new(&config).unwrap();

        let err = client.fetch_all_services().await.unwrap_err();
        assert!(matches!(err, ClientError::Auth(_)));
    }

    #[tokio::test]
    async fn test_v1_subscribe_reports_no_hosts() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/nacos/v1/ns/instance/list"))
            .and(query_param("serviceName", "orders"))
            .respond_with(ok_json(json!({
                "hosts": [{"ip": "10.0.0.1", "port": 8080, "enabled": false, "healthy": true}]
            })))
            .mount(&server)
            .await;

        let client = NacosClient::new(&server_config(&server, NacosVersion::V1)).unwrap();
        let recorder = Arc::new(Recorder::default());
        let key = ServiceKey::new("DEFAULT_GROUP", "orders");
        client.subscribe(&key, recorder.clone()).await.unwrap();

        wait_for(|| !recorder.is_empty()).await;
        assert_eq!(recorder.summary(), vec!["no-hosts"]);

        client.unsubscribe(&key).await.unwrap();
        assert!(client.subscriptions.is_empty());
    }

    #[tokio::test]
    async fn test_v2_envelope_over_http() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/nacos/v2/ns/service/list"))
            .respond_with(ok_json(json!({
                "code": 0,
                "message": "success",
                "data": {"count": 1, "services": ["orders"]}
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/nacos/v2/ns/instance/list"))
            .and(query_param("serviceName", "orders"))
            .and(query_param("groupName", "DEFAULT_GROUP"))
            .respond_with(ok_json(json!({
                "code": 0,
                "message": "success",
                "data": {"hosts": [
                    {"ip": "10.0.0.1", "port": 8080, "enabled": true, "healthy": true},
                    {"ip": "10.0.0.2", "port": 8080, "enabled": true, "healthy": false}
                ]}
            })))
            .mount(&server)
            .await;

        let client = NacosClient::new(&server_config(&server, NacosVersion::V2)).unwrap();
        let services = client.fetch_all_services().await.unwrap().sorted();
        assert_eq!(services, vec![ServiceKey::new("DEFAULT_GROUP", "orders")]);

        let recorder = Arc::new(Recorder::default());
        client.subscribe(&services[0], recorder.clone()).await.unwrap();
        wait_for(|| !recorder.is_empty()).await;
        assert_eq!(recorder.summary(), vec!["ok:10.0.0.1:8080"]);

        client.unsubscribe(&services[0]).await.unwrap();
    }

    #[tokio::test]
    async fn test_v2_error_code_over_http() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/nacos/v2/ns/service/list"))
            .respond_with(ok_json(json!({
                "code": 20004,
                "message": "namespace not found",
                "data": null
            })))
            .mount(&server)
            .await;

        let client = NacosClient::new(&server_config(&server, NacosVersion::V2)).unwrap();
        let err = client.fetch_all_services().await.unwrap_err();
        assert!(matches!(err, ClientError::Response(message) if message.contains("20004")));
    }
}
