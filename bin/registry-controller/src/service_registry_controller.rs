//! ServiceRegistry controller driving the registry manager

use chrono::Utc;
use futures::StreamExt;
use kube::api::{Patch, PatchParams};
use kube::{Api, Client, ResourceExt};
use kube_runtime::finalizer::{finalizer, Event as Finalizer};
use kube_runtime::watcher;
use kube_runtime::{controller::Action, Controller};
use registry_api::v1alpha1::ServiceRegistryStatus;
use registry_api::ServiceRegistry;
use registry_core::{RegistryError, RegistryManager};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const FINALIZER: &str = "registry.datum.net/cleanup";

const REQUEUE_OK: Duration = Duration::from_secs(300);
const REQUEUE_ERROR: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("Missing object key: {0}")]
    MissingObjectKey(&'static str),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Finalizer error: {0}")]
    Finalizer(#[source] Box<kube_runtime::finalizer::Error<ReconcileError>>),
}

struct Context {
    client: Client,
    manager: Arc<RegistryManager>,
}

pub struct ServiceRegistryController {
    client: Client,
    manager: Arc<RegistryManager>,
}

impl ServiceRegistryController {
    pub fn new(client: Client, manager: Arc<RegistryManager>) -> Self {
        Self { client, manager }
    }

    pub async fn run(&self, shutdown: CancellationToken) -> anyhow::Result<()> {
        info!("Starting ServiceRegistry reconciliation");

        let registries: Api<ServiceRegistry> = Api::all(self.client.clone());
        let context = Arc::new(Context {
            client: self.client.clone(),
            manager: self.manager.clone(),
        });

        let mut stream = Controller::new(registries, watcher::Config::default())
            .graceful_shutdown_on(async move { shutdown.cancelled().await })
            .run(reconcile, error_policy, context)
            .boxed();

        while let Some(item) = stream.next().await {
            match item {
                Ok((obj, _)) => debug!("Reconciled ServiceRegistry {}", obj),
                Err(e) => warn!("Error in reconciliation stream: {}", e),
            }
        }

        info!("ServiceRegistry reconciliation stopped");
        Ok(())
    }
}

async fn reconcile(
    registry: Arc<ServiceRegistry>,
    ctx: Arc<Context>,
) -> Result<Action, ReconcileError> {
    let namespace = registry
        .namespace()
        .ok_or(ReconcileError::MissingObjectKey("namespace"))?;
    let api: Api<ServiceRegistry> = Api::namespaced(ctx.client.clone(), &namespace);

    let (api_ref, ctx_ref) = (&api, ctx.as_ref());
    finalizer(&api, FINALIZER, registry, move |event| async move {
        match event {
            Finalizer::Apply(registry) => apply(registry, api_ref, ctx_ref).await,
            Finalizer::Cleanup(registry) => cleanup(registry, ctx_ref).await,
        }
    })
    .await
    .map_err(|e| ReconcileError::Finalizer(Box::new(e)))
}

fn error_policy(registry: Arc<ServiceRegistry>, err: &ReconcileError, _ctx: Arc<Context>) -> Action {
    error!("Error reconciling ServiceRegistry {}: {}", registry.name_any(), err);
    Action::requeue(REQUEUE_ERROR)
}

fn registry_id(registry: &ServiceRegistry) -> String {
    format!(
        "{}/{}",
        registry.namespace().unwrap_or_default(),
        registry.name_any()
    )
}

/// Whether the spec still has to be handed to the manager
fn needs_apply(registry: &ServiceRegistry, running: bool) -> bool {
    let Some(status) = registry.status.as_ref() else {
        return true;
    };
    !(running && status.ready && status.observed_generation == registry.metadata.generation)
}

fn next_status(
    registry: &ServiceRegistry,
    result: &Result<(), RegistryError>,
    now: &str,
) -> ServiceRegistryStatus {
    let previous = registry.status.clone().unwrap_or_default();
    match result {
        Ok(()) => ServiceRegistryStatus {
            ready: true,
            message: None,
            observed_generation: registry.metadata.generation,
            last_sync_time: Some(now.to_string()),
        },
        Err(err) => ServiceRegistryStatus {
            ready: false,
            message: Some(err.to_string()),
            observed_generation: registry.metadata.generation,
            last_sync_time: previous.last_sync_time,
        },
    }
}

async fn apply(
    registry: Arc<ServiceRegistry>,
    api: &Api<ServiceRegistry>,
    ctx: &Context,
) -> Result<Action, ReconcileError> {
    let id = registry_id(&registry);
    let running = ctx.manager.get(&id).await.is_some();
    if !needs_apply(&registry, running) {
        return Ok(Action::requeue(REQUEUE_OK));
    }

    info!("Reconciling ServiceRegistry {} of type {}", id, registry.spec.registry_type);
    let result = ctx
        .manager
        .update_registry(
            &id,
            &registry.name_any(),
            &registry.spec.registry_type,
            &registry.spec.config,
        )
        .await;

    let status = next_status(&registry, &result, &Utc::now().to_rfc3339());
    // an unchanged status produces no watch event, avoiding a retry storm
    if registry.status.as_ref() != Some(&status) {
        api.patch_status(
            &registry.name_any(),
            &PatchParams::default(),
            &Patch::Merge(json!({ "status": status })),
        )
        .await?;
    }

    result?;
    Ok(Action::requeue(REQUEUE_OK))
}

async fn cleanup(registry: Arc<ServiceRegistry>, ctx: &Context) -> Result<Action, ReconcileError> {
    let id = registry_id(&registry);
    info!("Cleaning up ServiceRegistry {}", id);
    ctx.manager.delete_registry(&id).await?;
    Ok(Action::await_change())
}
