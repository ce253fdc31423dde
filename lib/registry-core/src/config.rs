//! Registry configuration records and validation

use crate::{RegistryError, Result};
use serde::{Deserialize, Deserializer};
use std::time::Duration;
use url::Url;

/// Period of the refresh cycle when the config does not set one
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(30);

/// Longest accepted refresh period
pub const MAX_REFRESH_INTERVAL: Duration = Duration::from_secs(24 * 3600);

pub const DEFAULT_NACOS_NAMESPACE: &str = "public";
pub const DEFAULT_NACOS_GROUP: &str = "DEFAULT_GROUP";

pub const CONSUL: &str = "consul";
pub const NACOS: &str = "nacos";

/// Configuration of a Consul registry
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ConsulConfig {
    pub server_url: String,

    #[serde(default)]
    pub data_center: String,

    #[serde(default)]
    pub namespace: String,

    #[serde(default)]
    pub token: Option<String>,

    #[serde(default, deserialize_with = "deserialize_duration")]
    pub service_refresh_interval: Option<Duration>,
}

/// Nacos open API generation to talk to
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NacosVersion {
    #[default]
    V1,
    V2,
}

/// Configuration of a Nacos registry
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct NacosConfig {
    pub server_url: String,

    #[serde(default)]
    pub namespace: Option<String>,

    #[serde(default)]
    pub groups: Vec<String>,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    #[serde(default)]
    pub version: NacosVersion,

    #[serde(default, deserialize_with = "deserialize_duration")]
    pub service_refresh_interval: Option<Duration>,
}

impl NacosConfig {
    pub fn namespace(&self) -> &str {
        match self.namespace.as_deref() {
            Some(ns) if !ns.is_empty() => ns,
            _ => DEFAULT_NACOS_NAMESPACE,
        }
    }

    pub fn groups(&self) -> Vec<String> {
        if self.groups.is_empty() {
            vec![DEFAULT_NACOS_GROUP.to_string()]
        } else {
            self.groups.clone()
        }
    }
}

/// Configuration of one registry instance
#[derive(Clone, Debug, PartialEq)]
pub enum RegistryConfig {
    Consul(ConsulConfig),
    Nacos(NacosConfig),
}

impl RegistryConfig {
    /// Parse and validate the raw config of a registry of type `kind`
    pub fn parse(kind: &str, raw: &serde_json::Value) -> Result<Self> {
        let raw = if raw.is_null() {
            serde_json::Value::Object(Default::default())
        } else {
            raw.clone()
        };

        let config = match kind {
            CONSUL => RegistryConfig::Consul(serde_json::from_value(raw)?),
            NACOS => RegistryConfig::Nacos(serde_json::from_value(raw)?),
            other => return Err(RegistryError::UnknownRegistry(other.to_string())),
        };
        config.validate()?;
        Ok(config)
    }

    /// Registry type this config belongs to
    pub fn kind(&self) -> &'static str {
        match self {
            RegistryConfig::Consul(_) => CONSUL,
            RegistryConfig::Nacos(_) => NACOS,
        }
    }

    pub fn server_url(&self) -> &str {
        match self {
            RegistryConfig::Consul(c) => &c.server_url,
            RegistryConfig::Nacos(c) => &c.server_url,
        }
    }

    pub fn refresh_interval(&self) -> Duration {
        let configured = match self {
            RegistryConfig::Consul(c) => c.service_refresh_interval,
            RegistryConfig::Nacos(c) => c.service_refresh_interval,
        };
        configured.unwrap_or(DEFAULT_REFRESH_INTERVAL)
    }

    /// Reject configs that cannot work before any network call is made
    pub fn validate(&self) -> Result<()> {
        parse_server_url(self.server_url())?;

        let interval = self.refresh_interval();
        if interval.is_zero() {
            return Err(RegistryError::InvalidConfiguration(
                "serviceRefreshInterval must be positive".to_string(),
            ));
        }
        if interval > MAX_REFRESH_INTERVAL {
            return Err(RegistryError::InvalidConfiguration(format!(
                "serviceRefreshInterval must not exceed {:?}",
                MAX_REFRESH_INTERVAL
            )));
        }

        if let RegistryConfig::Nacos(c) = self {
            let username = c.username.as_deref().unwrap_or_default();
            let password = c.password.as_deref().unwrap_or_default();
            if !username.is_empty() && password.is_empty() {
                return Err(RegistryError::InvalidConfiguration(
                    "password is required when username is set".to_string(),
                ));
            }
            if c.groups.iter().any(|g| g.trim().is_empty()) {
                return Err(RegistryError::InvalidConfiguration(
                    "group names must not be empty".to_string(),
                ));
            }
        }

        Ok(())
    }
}

/// Parse a registry server URL, accepting only http(s) URLs with a host
pub fn parse_server_url(raw: &str) -> Result<Url> {
    let url = Url::parse(raw)
        .map_err(|_| RegistryError::InvalidConfiguration(format!("invalid server url: {}", raw)))?;

    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(RegistryError::InvalidConfiguration(format!(
            "unsupported scheme in server url: {}",
            raw
        )));
    }
    if url.host_str().map_or(true, str::is_empty) {
        return Err(RegistryError::InvalidConfiguration(format!(
            "missing host in server url: {}",
            raw
        )));
    }
    Ok(url)
}

/// Parse a duration such as "30s", "1.5s", "500ms", "2m" or "1h"
pub fn parse_duration(raw: &str) -> Option<Duration> {
    let raw = raw.trim();
    let split = raw
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(raw.len());
    let (value, unit) = raw.split_at(split);
    let value: f64 = value.parse().ok()?;
    if !value.is_finite() || value < 0.0 {
        return None;
    }

    let secs = match unit {
        "ms" => value / 1000.0,
        "s" => value,
        "m" => value * 60.0,
        "h" => value * 3600.0,
        _ => return None,
    };
    Duration::try_from_secs_f64(secs).ok()
}

fn deserialize_duration<'de, D>(deserializer: D) -> std::result::Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    match raw {
        None => Ok(None),
        Some(s) => parse_duration(&s)
            .map(Some)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid duration: {}", s))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("30s"), Some(Duration::from_secs(30)));
        assert_eq!(parse_duration("1.5s"), Some(Duration::from_millis(1500)));
        assert_eq!(parse_duration("500ms"), Some(Duration::from_millis(500)));
        assert_eq!(parse_duration("2m"), Some(Duration::from_secs(120)));
        assert_eq!(parse_duration("1h"), Some(Duration::from_secs(3600)));
        assert_eq!(parse_duration("10"), None);
        assert_eq!(parse_duration("abc"), None);
        assert_eq!(parse_duration("5d"), None);
        assert_eq!(parse_duration("99999999999999999999h"), None);
    }

    #[test]
    fn test_parse_nacos_defaults() {
        let config =
            RegistryConfig::parse(NACOS, &json!({"serverUrl": "http://127.0.0.1:8848"})).unwrap();

        let RegistryConfig::Nacos(nacos) = &config else {
            panic!("expected nacos config");
        };
        assert_eq!(nacos.namespace(), "public");
        assert_eq!(nacos.groups(), vec!["DEFAULT_GROUP".to_string()]);
        assert_eq!(nacos.version, NacosVersion::V1);
        assert_eq!(config.refresh_interval(), DEFAULT_REFRESH_INTERVAL);
        assert_eq!(config.kind(), "nacos");
    }

    #[test]
    fn test_parse_nacos_full() {
        let config = RegistryConfig::parse(
            NACOS,
            &json!({
                "serverUrl": "https://nacos.example.com",
                "namespace": "prod",
                "groups": ["a", "b"],
                "username": "nacos",
                "password": "secret",
                "version": "v2",
                "serviceRefreshInterval": "10s",
            }),
        )
        .unwrap();

        let RegistryConfig::Nacos(nacos) = &config else {
            panic!("expected nacos config");
        };
        assert_eq!(nacos.namespace(), "prod");
        assert_eq!(nacos.groups(), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(nacos.version, NacosVersion::V2);
        assert_eq!(config.refresh_interval(), Duration::from_secs(10));
    }

    #[test]
    fn test_parse_consul() {
        let config = RegistryConfig::parse(
            CONSUL,
            &json!({"serverUrl": "http://127.0.0.1:8500", "dataCenter": "dc1", "token": "t"}),
        )
        .unwrap();

        let RegistryConfig::Consul(consul) = &config else {
            panic!("expected consul config");
        };
        assert_eq!(consul.data_center, "dc1");
        assert_eq!(consul.token.as_deref(), Some("t"));
    }

    #[test]
    fn test_invalid_configs() {
        let cases = vec![
            (NACOS, json!({"serverUrl": "::not a url"})),
            (NACOS, json!({"serverUrl": "ftp://127.0.0.1"})),
            (NACOS, json!({"serverUrl": "http://127.0.0.1", "username": "nacos"})),
            (NACOS, json!({"serverUrl": "http://127.0.0.1", "groups": [""]})),
            (NACOS, json!({"serverUrl": "http://127.0.0.1", "serviceRefreshInterval": "0s"})),
            (NACOS, json!({"serverUrl": "http://127.0.0.1", "serviceRefreshInterval": "25h"})),
            (
                NACOS,
                json!({"serverUrl": "http://127.0.0.1", "serviceRefreshInterval": "3000000000000000h"}),
            ),
            (
                CONSUL,
                json!({"serverUrl": "http://127.0.0.1", "serviceRefreshInterval": "99999999999999999999h"}),
            ),
            (CONSUL, json!({"serverUrl": "http://127.0.0.1", "unknown": 1})),
            (CONSUL, json!({})),
        ];

        for (kind, raw) in cases {
            assert!(
                RegistryConfig::parse(kind, &raw).is_err(),
                "expected {} config {} to be rejected",
                kind,
                raw
            );
        }
    }

    #[test]
    fn test_refresh_interval_upper_bound() {
        let raw = |interval: &str| {
            json!({"serverUrl": "http://127.0.0.1:8848", "serviceRefreshInterval": interval})
        };

        let config = RegistryConfig::parse(NACOS, &raw("24h")).unwrap();
        assert_eq!(config.refresh_interval(), MAX_REFRESH_INTERVAL);

        let err = RegistryConfig::parse(NACOS, &raw("86401s")).unwrap_err();
        assert!(matches!(err, RegistryError::InvalidConfiguration(_)));
    }

    #[test]
    fn test_unknown_registry_type() {
        let err = RegistryConfig::parse("eureka", &json!({})).unwrap_err();
        assert!(matches!(err, RegistryError::UnknownRegistry(name) if name == "eureka"));
    }
}
