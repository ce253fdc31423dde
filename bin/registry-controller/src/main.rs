use anyhow::Result;
use kube::{Client, CustomResourceExt};
use registry_api::ServiceRegistry;
use registry_clients::builtin_factories;
use registry_core::{RegistryManager, RegistryMetrics};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod config;
mod server;
mod service_registry_controller;
mod store;

use config::{LogFormat, Settings};
use service_registry_controller::ServiceRegistryController;
use store::KubeServiceEntryStore;

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    if std::env::args().nth(1).as_deref() == Some("crd") {
        print!("{}", serde_yaml::to_string(&ServiceRegistry::crd())?);
        return Ok(());
    }

    let settings = Settings::from_env()?;
    init_tracing(settings.log_format);

    info!("Starting registry-controller...");
    info!("  - Root namespace: {}", settings.root_namespace);
    info!("  - Store sync interval: {:?}", settings.store_sync_interval);

    let client = Client::try_default().await?;
    let metrics = RegistryMetrics::new()?;
    let shutdown = CancellationToken::new();

    let store = Arc::new(KubeServiceEntryStore::new(client.clone(), &settings.root_namespace));
    let sync_task = {
        let store = store.clone();
        let shutdown = shutdown.clone();
        let interval = settings.store_sync_interval;
        tokio::spawn(async move { store.run_sync(interval, shutdown).await })
    };

    let manager = Arc::new(RegistryManager::new(
        builtin_factories(),
        store.clone(),
        metrics.clone(),
    ));

    let server_task = tokio::spawn(server::serve(
        settings.metrics_addr,
        metrics,
        shutdown.clone(),
    ));

    let controller = ServiceRegistryController::new(client, manager.clone());
    let controller_task = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = controller.run(shutdown).await {
                error!("ServiceRegistry controller error: {}", e);
            }
        })
    };

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, stopping registries...");

    shutdown.cancel();
    let _ = controller_task.await;
    manager.shutdown().await;
    let _ = sync_task.await;
    match server_task.await {
        Ok(Err(e)) => error!("Metrics server error: {}", e),
        Err(e) => error!("Metrics server task failed: {}", e),
        Ok(Ok(())) => {}
    }

    info!("registry-controller stopped");
    Ok(())
}
