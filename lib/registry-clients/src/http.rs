//! Shared HTTP plumbing of the registry clients

use registry_core::ClientError;
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use std::time::Duration;
use url::Url;

/// Timeout of every registry request except blocking queries
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

pub fn build_client() -> Result<Client, ClientError> {
    Client::builder()
        .connect_timeout(REQUEST_TIMEOUT)
        .timeout(REQUEST_TIMEOUT)
        .build()
        .map_err(ClientError::transport)
}

/// Resolve `path` against the server URL, keeping any path prefix it has
pub fn endpoint(base: &Url, path: &str) -> Url {
    let mut url = base.clone();
    let prefix = base.path().trim_end_matches('/');
    url.set_path(&format!("{}{}", prefix, path));
    url.set_query(None);
    url
}

/// Send a request, failing on non-success status codes
pub async fn send(request: RequestBuilder) -> Result<Response, ClientError> {
    let response = request.send().await.map_err(ClientError::transport)?;
    let status = response.status();
    if !status.is_success() {
        let url = response.url().clone();
        let body = response.text().await.unwrap_or_default();
        return Err(ClientError::Response(format!(
            "{} returned {}: {}",
            url.path(),
            status,
            body.trim()
        )));
    }
    Ok(response)
}

/// Send a request and decode its JSON body
pub async fn get_json<T: DeserializeOwned>(request: RequestBuilder) -> Result<T, ClientError> {
    let response = send(request).await?;
    let body = response.bytes().await.map_err(ClientError::transport)?;
    decode(&body)
}

pub fn decode<T: DeserializeOwned>(body: &[u8]) -> Result<T, ClientError> {
    serde_json::from_slice(body)
        .map_err(|e| ClientError::Response(format!("cannot decode response: {}", e)))
}
