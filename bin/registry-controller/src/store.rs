//! Service entry store backed by Istio ServiceEntry objects

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams};
use kube::{Client, ResourceExt};
use registry_api::istio::ServiceEntry;
use registry_core::{ServiceEntryStore, ServiceEntryWrapper};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const CREATED_BY_LABEL: &str = "app.kubernetes.io/created-by";
pub const CREATED_BY: &str = "service-registry";
pub const SOURCE_LABEL: &str = "registry.datum.net/source";

const FIELD_MANAGER: &str = "registry-controller";

#[derive(Debug, PartialEq, Eq)]
enum UpdatePlan {
    Apply,
    Unchanged,
    /// The host is owned by another source
    Conflict(String),
}

fn plan_update(
    cache: &HashMap<String, ServiceEntryWrapper>,
    host: &str,
    entry: &ServiceEntryWrapper,
) -> UpdatePlan {
    match cache.get(host) {
        Some(current) if current.source != entry.source => {
            UpdatePlan::Conflict(current.source.clone())
        }
        Some(current) if current.spec == entry.spec => UpdatePlan::Unchanged,
        _ => UpdatePlan::Apply,
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
struct SyncPlan {
    /// Objects left without a cached entry for two passes in a row
    delete: Vec<String>,
    /// Cached entries missing or different in the cluster
    apply: Vec<String>,
    /// Objects without a cached entry in this pass
    orphans: HashSet<String>,
}

/// Plan one sync pass.
///
/// An object is only deleted when the previous pass already found it
/// orphaned, so entries published before a restart survive until their
/// registries had a chance to publish them again.
fn plan_sync(
    cache: &HashMap<String, ServiceEntryWrapper>,
    existing: &[ServiceEntry],
    orphans: &HashSet<String>,
) -> SyncPlan {
    let mut plan = SyncPlan::default();
    let mut found = HashMap::new();

    for object in existing {
        let name = object.name_any();
        if cache.contains_key(&name) {
            found.insert(name, object);
        } else {
            if orphans.contains(&name) {
                plan.delete.push(name.clone());
            }
            plan.orphans.insert(name);
        }
    }

    for (host, entry) in cache {
        let current = found.get(host);
        let in_sync = current.is_some_and(|object| {
            object.spec == entry.spec
                && object.labels().get(SOURCE_LABEL) == Some(&entry.source)
        });
        if !in_sync {
            plan.apply.push(host.clone());
        }
    }

    plan.delete.sort();
    plan.apply.sort();
    plan
}

fn build_object(namespace: &str, host: &str, entry: &ServiceEntryWrapper) -> ServiceEntry {
    let labels = BTreeMap::from([
        (CREATED_BY_LABEL.to_string(), CREATED_BY.to_string()),
        (SOURCE_LABEL.to_string(), entry.source.clone()),
    ]);

    let mut object = ServiceEntry::new(host, entry.spec.clone());
    object.metadata = ObjectMeta {
        name: Some(host.to_string()),
        namespace: Some(namespace.to_string()),
        labels: Some(labels),
        ..Default::default()
    };
    object
}

/// First tick one full period after now
fn sync_ticker(interval: Duration) -> Interval {
    let now = Instant::now();
    let mut ticker = interval_at(now.checked_add(interval).unwrap_or(now), interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

#[derive(Default)]
struct StoreState {
    cache: HashMap<String, ServiceEntryWrapper>,
    /// Orphaned objects seen by the last sync
    orphans: HashSet<String>,
}

/// Publishes service entries into the root namespace.
///
/// The in-memory cache is the desired state; failed API calls are logged and
/// repaired by the next [`KubeServiceEntryStore::sync`].
pub struct KubeServiceEntryStore {
    api: Api<ServiceEntry>,
    namespace: String,
    state: Mutex<StoreState>,
}

impl KubeServiceEntryStore {
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            namespace: namespace.to_string(),
            state: Mutex::new(StoreState::default()),
        }
    }

    async fn apply(&self, host: &str, entry: &ServiceEntryWrapper) -> Result<(), kube::Error> {
        let object = build_object(&self.namespace, host, entry);
        self.api
            .patch(host, &PatchParams::apply(FIELD_MANAGER).force(), &Patch::Apply(&object))
            .await?;
        Ok(())
    }

    async fn remove(&self, host: &str) -> Result<(), kube::Error> {
        match self.api.delete(host, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(err)) if err.code == 404 => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Converge the cluster onto the cached entries
    pub async fn sync(&self) -> Result<(), kube::Error> {
        let selector = format!("{}={}", CREATED_BY_LABEL, CREATED_BY);
        let existing = self.api.list(&ListParams::default().labels(&selector)).await?;

        let mut state = self.state.lock().await;
        let plan = plan_sync(&state.cache, &existing.items, &state.orphans);
        state.orphans = plan.orphans;
        if plan.delete.is_empty() && plan.apply.is_empty() {
            return Ok(());
        }
        info!(
            delete = plan.delete.len(),
            apply = plan.apply.len(),
            "syncing service entries"
        );

        for host in &plan.delete {
            if let Err(err) = self.remove(host).await {
                warn!(host = %host, "failed to delete service entry, err: {}", err);
            }
        }
        for host in &plan.apply {
            if let Some(entry) = state.cache.get(host) {
                if let Err(err) = self.apply(host, entry).await {
                    warn!(host = %host, "failed to apply service entry, err: {}", err);
                }
            }
        }
        Ok(())
    }

    /// Sync every `interval` until `shutdown` fires, starting one interval
    /// from now
    pub async fn run_sync(&self, interval: Duration, shutdown: CancellationToken) {
        let mut ticker = sync_ticker(interval);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(err) = self.sync().await {
                        error!("failed to sync service entries, err: {}", err);
                    }
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl ServiceEntryStore for KubeServiceEntryStore {
    async fn update(&self, host: &str, entry: ServiceEntryWrapper) {
        let mut state = self.state.lock().await;
        match plan_update(&state.cache, host, &entry) {
            UpdatePlan::Unchanged => return,
            UpdatePlan::Conflict(owner) => {
                warn!(
                    host = %host,
                    "service entry is already published by {}, ignoring update from {}",
                    owner,
                    entry.source
                );
                return;
            }
            UpdatePlan::Apply => {}
        }

        debug!(host = %host, endpoints = entry.spec.endpoints.len(), "apply service entry");
        if let Err(err) = self.apply(host, &entry).await {
            warn!(host = %host, "failed to apply service entry, err: {}", err);
        }
        state.orphans.remove(host);
        state.cache.insert(host.to_string(), entry);
    }

    async fn delete(&self, host: &str) {
        let mut state = self.state.lock().await;
        if state.cache.remove(host).is_none() {
            return;
        }

        debug!(host = %host, "delete service entry");
        if let Err(err) = self.remove(host).await {
            warn!(host = %host, "failed to delete service entry, err: {}", err);
        }
    }
}
