//! Prometheus metrics for registry synchronization

use crate::{RegistryError, Result};
use prometheus::{Encoder, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder};
use std::sync::Arc;

/// Metrics shared by every registry instance of a process
#[derive(Clone)]
pub struct RegistryMetrics {
    /// Refresh cycles by outcome ("ok" or "error")
    pub refresh_total: IntCounterVec,
    /// Services currently subscribed
    pub watched_services: IntGaugeVec,
    /// Services unsubscribed but still published
    pub soft_deleted_services: IntGaugeVec,
    /// Failed subscribe/unsubscribe calls
    pub subscription_errors_total: IntCounterVec,
    /// Store calls by operation ("update" or "delete")
    pub store_operations_total: IntCounterVec,
    /// Prometheus registry for metrics
    pub registry: Arc<Registry>,
}

impl RegistryMetrics {
    /// Create a new set of metrics on a dedicated Prometheus registry
    pub fn new() -> Result<Self> {
        let registry = Arc::new(Registry::new());

        let refresh_total = IntCounterVec::new(
            Opts::new("registry_refresh_total", "Refresh cycles by outcome"),
            &["registry", "outcome"],
        )?;

        let watched_services = IntGaugeVec::new(
            Opts::new("registry_watched_services", "Services currently subscribed"),
            &["registry"],
        )?;

        let soft_deleted_services = IntGaugeVec::new(
            Opts::new(
                "registry_soft_deleted_services",
                "Services unsubscribed but not yet removed from the store",
            ),
            &["registry"],
        )?;

        let subscription_errors_total = IntCounterVec::new(
            Opts::new(
                "registry_subscription_errors_total",
                "Failed subscribe and unsubscribe calls",
            ),
            &["registry", "operation"],
        )?;

        let store_operations_total = IntCounterVec::new(
            Opts::new("registry_store_operations_total", "Service entry store calls"),
            &["registry", "operation"],
        )?;

        registry.register(Box::new(refresh_total.clone()))?;
        registry.register(Box::new(watched_services.clone()))?;
        registry.register(Box::new(soft_deleted_services.clone()))?;
        registry.register(Box::new(subscription_errors_total.clone()))?;
        registry.register(Box::new(store_operations_total.clone()))?;

        Ok(Self {
            refresh_total,
            watched_services,
            soft_deleted_services,
            subscription_errors_total,
            store_operations_total,
            registry,
        })
    }

    pub(crate) fn record_refresh(&self, registry: &str, ok: bool) {
        let outcome = if ok { "ok" } else { "error" };
        self.refresh_total.with_label_values(&[registry, outcome]).inc();
    }

    pub(crate) fn record_sets(&self, registry: &str, watched: usize, soft_deleted: usize) {
        self.watched_services
            .with_label_values(&[registry])
            .set(watched as i64);
        self.soft_deleted_services
            .with_label_values(&[registry])
            .set(soft_deleted as i64);
    }

    pub(crate) fn record_subscription_error(&self, registry: &str, operation: &str) {
        self.subscription_errors_total
            .with_label_values(&[registry, operation])
            .inc();
    }

    pub(crate) fn record_store(&self, registry: &str, operation: &str) {
        self.store_operations_total
            .with_label_values(&[registry, operation])
            .inc();
    }

    /// Gather all metrics in Prometheus text format
    pub fn gather(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = vec![];
        encoder.encode(&metric_families, &mut buffer)?;
        String::from_utf8(buffer)
            .map_err(|e| RegistryError::MetricsError(prometheus::Error::Msg(e.to_string())))
    }
}
