//! Process settings read from the environment

use anyhow::{bail, Context, Result};
use std::net::SocketAddr;
use std::time::Duration;

pub const DEFAULT_ROOT_NAMESPACE: &str = "istio-system";
pub const DEFAULT_METRICS_ADDR: &str = "0.0.0.0:9090";
pub const DEFAULT_STORE_SYNC_INTERVAL: Duration = Duration::from_secs(20);

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Settings {
    /// Namespace service entries are written to
    pub root_namespace: String,
    pub metrics_addr: SocketAddr,
    pub store_sync_interval: Duration,
    pub log_format: LogFormat,
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let root_namespace = var("ROOT_NAMESPACE").unwrap_or_else(|| DEFAULT_ROOT_NAMESPACE.to_string());

        let metrics_addr = var("METRICS_ADDR")
            .unwrap_or_else(|| DEFAULT_METRICS_ADDR.to_string())
            .parse::<SocketAddr>()
            .context("METRICS_ADDR must be a socket address")?;

        let store_sync_interval = match var("STORE_SYNC_INTERVAL_SECS") {
            Some(raw) => {
                let secs: u64 = raw
                    .trim()
                    .parse()
                    .context("STORE_SYNC_INTERVAL_SECS must be a number of seconds")?;
                if secs == 0 {
                    bail!("STORE_SYNC_INTERVAL_SECS must be positive");
                }
                Duration::from_secs(secs)
            }
            None => DEFAULT_STORE_SYNC_INTERVAL,
        };

        let log_format = match var("LOG_FORMAT").as_deref().map(str::to_ascii_lowercase) {
            Some(f) if f == "json" => LogFormat::Json,
            _ => LogFormat::Text,
        };

        Ok(Self {
            root_namespace,
            metrics_addr,
            store_sync_interval,
            log_format,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn settings(vars: &[(&str, &str)]) -> Result<Settings> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Settings::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn test_defaults() {
        let settings = settings(&[]).unwrap();
        assert_eq!(settings.root_namespace, "istio-system");
        assert_eq!(settings.metrics_addr, "0.0.0.0:9090".parse().unwrap());
        assert_eq!(settings.store_sync_interval, Duration::from_secs(20));
        assert_eq!(settings.log_format, LogFormat::Text);
    }

    #[test]
    fn test_overrides() {
        let settings = settings(&[
            ("ROOT_NAMESPACE", "mesh"),
            ("METRICS_ADDR", "127.0.0.1:8081"),
            ("STORE_SYNC_INTERVAL_SECS", "5"),
            ("LOG_FORMAT", "JSON"),
        ])
        .unwrap();
        assert_eq!(settings.root_namespace, "mesh");
        assert_eq!(settings.metrics_addr.port(), 8081);
        assert_eq!(settings.store_sync_interval, Duration::from_secs(5));
        assert_eq!(settings.log_format, LogFormat::Json);
    }

    #[test]
    fn test_invalid_values() {
        assert!(settings(&[("METRICS_ADDR", "localhost")]).is_err());
        assert!(settings(&[("STORE_SYNC_INTERVAL_SECS", "0")]).is_err());
        assert!(settings(&[("STORE_SYNC_INTERVAL_SECS", "soon")]).is_err());
    }
}
