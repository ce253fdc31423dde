//! Registry instance: fetch, diff, subscribe and publish cycles
//!
//! A [`Registry`] mirrors one external registry into a [`ServiceEntryStore`].
//! `start` subscribes every fetched service and launches a background task
//! that refreshes the subscriptions periodically; `reload` swaps the client
//! for one built from a new configuration; `stop` tears everything down and
//! retracts every published entry.
//!
//! Services that disappear from a fetch are unsubscribed but their entries
//! stay published ("soft-deleted") until the next `reload` or `stop`.
//! Unsubscribing waits for a push already in flight, so a retracted entry is
//! never published again by its old subscription.

use crate::client::{ClientFactory, RegistryClient, ServiceListener, SubscribeResult};
use crate::config::{RegistryConfig, MAX_REFRESH_INTERVAL};
use crate::entry::build_service_entry;
use crate::metrics::RegistryMetrics;
use crate::store::ServiceEntryStore;
use crate::watch_set::{ServiceSet, WatchSet, WatchState};
use crate::{RegistryError, Result, ServiceKey};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Lifecycle phase of a registry instance
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Stopped,
    Starting,
    Running,
    Reloading,
    Stopping,
}

struct RegistryState {
    phase: Phase,
    client: Option<Arc<dyn RegistryClient>>,
    services: WatchState,
    publishers: HashMap<ServiceKey, Arc<EntryPublisher>>,
    refresh_period: Option<watch::Sender<Duration>>,
    refresh_task: Option<JoinHandle<()>>,
}

/// One running mirror of an external registry
pub struct Registry {
    name: String,
    kind: String,
    factory: Arc<dyn ClientFactory>,
    store: Arc<dyn ServiceEntryStore>,
    metrics: RegistryMetrics,
    state: RwLock<RegistryState>,
    stopped: Arc<AtomicBool>,
    shutdown: CancellationToken,
}

impl Registry {
    pub fn new(
        name: impl Into<String>,
        kind: impl Into<String>,
        factory: Arc<dyn ClientFactory>,
        store: Arc<dyn ServiceEntryStore>,
        metrics: RegistryMetrics,
    ) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            factory,
            store,
            metrics,
            state: RwLock::new(RegistryState {
                phase: Phase::Stopped,
                client: None,
                services: WatchState::new(),
                publishers: HashMap::new(),
                refresh_period: None,
                refresh_task: None,
            }),
            stopped: Arc::new(AtomicBool::new(false)),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Registry type, also the source tag of every published entry
    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    pub async fn phase(&self) -> Phase {
        self.state.read().await.phase
    }

    /// Currently subscribed services, sorted
    pub async fn watched_services(&self) -> Vec<ServiceKey> {
        self.state.read().await.services.watching().sorted()
    }

    /// Services unsubscribed but still published, sorted
    pub async fn soft_deleted_services(&self) -> Vec<ServiceKey> {
        self.state.read().await.services.soft_deleted().sorted()
    }

    /// Fetch and subscribe every service, then refresh in the background.
    ///
    /// A service that fails to subscribe is left out and retried on the next
    /// refresh. A failed fetch leaves the instance stopped.
    pub async fn start(self: &Arc<Self>, config: &RegistryConfig) -> Result<()> {
        self.check_kind(config)?;
        config.validate()?;

        let mut state = self.state.write().await;
        if self.is_stopped() {
            return Err(RegistryError::AlreadyStopped(self.name.clone()));
        }
        if state.phase != Phase::Stopped {
            return Err(RegistryError::AlreadyStarted(self.name.clone()));
        }

        let client = self.factory.create(config)?;
        state.phase = Phase::Starting;

        let fetched = match client.fetch_all_services().await {
            Ok(fetched) => fetched,
            Err(err) => {
                state.phase = Phase::Stopped;
                return Err(err.into());
            }
        };

        let mut watching = WatchSet::new();
        for key in fetched.sorted() {
            if let Some(publisher) = self.subscribe(&client, &key).await {
                state.publishers.insert(key.clone(), publisher);
                watching.insert(key);
            }
        }
        state.services.swap(watching, Vec::new());
        state.client = Some(client);

        let period = config.refresh_interval();
        let (period_tx, period_rx) = watch::channel(period);
        state.refresh_period = Some(period_tx);
        state.refresh_task = Some(tokio::spawn(refresh_loop(
            Arc::downgrade(self),
            self.name.clone(),
            self.shutdown.clone(),
            period_rx,
        )));
        state.phase = Phase::Running;
        self.record_sets(&state);

        info!(
            registry = %self.name,
            services = state.services.watching().len(),
            "registry started, refreshing every {:?}",
            period
        );
        Ok(())
    }

    /// Run one fetch-diff-reconcile cycle.
    ///
    /// New services are subscribed, vanished ones are unsubscribed and
    /// soft-deleted. A failed fetch leaves the watch set untouched.
    pub async fn refresh(&self) -> Result<()> {
        let mut state = self.state.write().await;
        if state.phase != Phase::Running || self.is_stopped() {
            return Ok(());
        }
        let Some(client) = state.client.clone() else {
            return Ok(());
        };

        let fetched = match client.fetch_all_services().await {
            Ok(fetched) => fetched,
            Err(err) => {
                self.metrics.record_refresh(&self.name, false);
                return Err(err.into());
            }
        };

        let diff = state.services.diff(&fetched);
        let mut watching: WatchSet = diff.retained.iter().cloned().collect();
        for key in &diff.added {
            if let Some(publisher) = self.subscribe(&client, key).await {
                state.publishers.insert(key.clone(), publisher);
                watching.insert(key.clone());
            }
        }
        for key in &diff.removed {
            self.unsubscribe(&mut state.publishers, &client, key).await;
        }

        debug!(
            registry = %self.name,
            added = diff.added.len(),
            removed = diff.removed.len(),
            "refreshed services"
        );

        state.services.swap(watching, diff.removed);
        debug_assert!(state.services.is_consistent());

        self.metrics.record_refresh(&self.name, true);
        self.record_sets(&state);
        Ok(())
    }

    /// Replace the client with one built from `config`.
    ///
    /// Every service is unsubscribed from the previous client and the ones
    /// still fetched are subscribed with the new client. Entries of services
    /// that are gone, including soft-deleted ones, are retracted.
    pub async fn reload(&self, config: &RegistryConfig) -> Result<()> {
        self.check_kind(config)?;
        config.validate()?;
        let client = self.factory.create(config)?;

        let mut state = self.state.write().await;
        if state.phase != Phase::Running || self.is_stopped() {
            return Err(RegistryError::NotRunning(self.name.clone()));
        }
        let Some(previous_client) = state.client.clone() else {
            return Err(RegistryError::NotRunning(self.name.clone()));
        };
        state.phase = Phase::Reloading;

        let fetched = match client.fetch_all_services().await {
            Ok(fetched) => fetched,
            Err(err) => {
                state.phase = Phase::Running;
                return Err(err.into());
            }
        };

        let soft_deleted = state.services.take_soft_deleted();
        for key in soft_deleted.sorted() {
            if !fetched.contains(&key) {
                self.delete_entry(&previous_client, &key).await;
            }
        }

        let previous = state.services.watching().clone();
        for key in previous.sorted() {
            // subscriptions are bound to the client that created them
            self.unsubscribe(&mut state.publishers, &previous_client, &key).await;
            if !fetched.contains(&key) {
                self.delete_entry(&previous_client, &key).await;
            }
        }

        let published: ServiceSet = previous
            .iter()
            .chain(soft_deleted.iter())
            .filter(|key| fetched.contains(key))
            .cloned()
            .collect();
        for key in published.sorted() {
            let previous_host = previous_client.host_key(&key, &self.name, &self.kind);
            if previous_host != client.host_key(&key, &self.name, &self.kind) {
                self.store.delete(&previous_host).await;
                self.metrics.record_store(&self.name, "delete");
            }
        }

        let mut watching = WatchSet::new();
        let mut unsubscribed = Vec::new();
        for key in fetched.sorted() {
            if let Some(publisher) = self.subscribe(&client, &key).await {
                state.publishers.insert(key.clone(), publisher);
                watching.insert(key);
            } else if published.contains(&key) {
                unsubscribed.push(key);
            }
        }

        state.services.swap(watching, unsubscribed);
        debug_assert!(state.services.is_consistent());
        state.client = Some(client);

        let period = config.refresh_interval();
        if let Some(period_tx) = &state.refresh_period {
            period_tx.send_if_modified(|current| {
                if *current == period {
                    return false;
                }
                *current = period;
                true
            });
        }
        state.phase = Phase::Running;
        self.record_sets(&state);

        info!(
            registry = %self.name,
            services = state.services.watching().len(),
            "registry reloaded"
        );
        Ok(())
    }

    /// Stop refreshing, unsubscribe everything and retract every entry.
    ///
    /// Callbacks delivered afterwards are ignored. Stopping twice is an error.
    pub async fn stop(&self) -> Result<()> {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return Err(RegistryError::AlreadyStopped(self.name.clone()));
        }
        self.shutdown.cancel();

        let refresh_task = {
            let mut state = self.state.write().await;
            state.phase = Phase::Stopping;

            let (watching, soft_deleted) = state.services.take();
            if let Some(client) = state.client.take() {
                for key in soft_deleted.sorted() {
                    if !watching.contains(&key) {
                        self.delete_entry(&client, &key).await;
                    }
                }
                for key in watching.sorted() {
                    self.unsubscribe(&mut state.publishers, &client, &key).await;
                    self.delete_entry(&client, &key).await;
                }
            }
            for (_, publisher) in state.publishers.drain() {
                publisher.retire().await;
            }

            state.refresh_period = None;
            state.phase = Phase::Stopped;
            self.record_sets(&state);
            state.refresh_task.take()
        };

        if let Some(task) = refresh_task {
            if let Err(err) = task.await {
                warn!(registry = %self.name, "refresh task ended abnormally: {}", err);
            }
        }

        info!(registry = %self.name, "registry stopped");
        Ok(())
    }

    fn check_kind(&self, config: &RegistryConfig) -> Result<()> {
        if config.kind() != self.kind {
            return Err(RegistryError::InvalidConfiguration(format!(
                "registry {} is of type {}, got a {} config",
                self.name,
                self.kind,
                config.kind()
            )));
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        client: &Arc<dyn RegistryClient>,
        key: &ServiceKey,
    ) -> Option<Arc<EntryPublisher>> {
        let publisher = Arc::new(EntryPublisher {
            registry: self.name.clone(),
            host: client.host_key(key, &self.name, &self.kind),
            source: self.kind.clone(),
            store: self.store.clone(),
            metrics: self.metrics.clone(),
            stopped: self.stopped.clone(),
            retired: Mutex::new(false),
        });

        match client.subscribe(key, publisher.clone()).await {
            Ok(()) => {
                debug!(registry = %self.name, service = %key, "subscribed service");
                Some(publisher)
            }
            Err(err) => {
                publisher.retire().await;
                error!(
                    registry = %self.name,
                    service = %key,
                    "failed to subscribe service, err: {}",
                    err
                );
                self.metrics.record_subscription_error(&self.name, "subscribe");
                None
            }
        }
    }

    /// Unsubscribe `key` and wait for its in-flight push, if any.
    ///
    /// The store hears nothing more from the subscription once this returns,
    /// even when the client fails to unsubscribe.
    async fn unsubscribe(
        &self,
        publishers: &mut HashMap<ServiceKey, Arc<EntryPublisher>>,
        client: &Arc<dyn RegistryClient>,
        key: &ServiceKey,
    ) {
        if let Some(publisher) = publishers.remove(key) {
            publisher.retire().await;
        }

        match client.unsubscribe(key).await {
            Ok(()) => debug!(registry = %self.name, service = %key, "unsubscribed service"),
            Err(err) => {
                error!(
                    registry = %self.name,
                    service = %key,
                    "failed to unsubscribe service, err: {}",
                    err
                );
                self.metrics.record_subscription_error(&self.name, "unsubscribe");
            }
        }
    }

    async fn delete_entry(&self, client: &Arc<dyn RegistryClient>, key: &ServiceKey) {
        let host = client.host_key(key, &self.name, &self.kind);
        debug!(registry = %self.name, host = %host, "delete service entry");
        self.store.delete(&host).await;
        self.metrics.record_store(&self.name, "delete");
    }

    fn record_sets(&self, state: &RegistryState) {
        self.metrics.record_sets(
            &self.name,
            state.services.watching().len(),
            state.services.soft_deleted().len(),
        );
    }
}

/// Publishes the pushes of one subscribed service to the store
struct EntryPublisher {
    registry: String,
    host: String,
    source: String,
    store: Arc<dyn ServiceEntryStore>,
    metrics: RegistryMetrics,
    stopped: Arc<AtomicBool>,
    /// Held for the whole push; true once the subscription is gone
    retired: Mutex<bool>,
}

#[async_trait::async_trait]
impl ServiceListener for EntryPublisher {
    async fn on_change(&self, result: SubscribeResult) {
        let retired = self.retired.lock().await;
        if *retired || self.stopped.load(Ordering::Acquire) {
            return;
        }

        match result {
            Ok(endpoints) if !endpoints.is_empty() => {
                debug!(
                    registry = %self.registry,
                    host = %self.host,
                    endpoints = endpoints.len(),
                    "update service entry"
                );
                let entry = build_service_entry(&self.host, &endpoints, &self.source);
                self.store.update(&self.host, entry).await;
                self.metrics.record_store(&self.registry, "update");
            }
            Ok(_) => self.delete_empty().await,
            Err(err) if err.is_no_hosts() => self.delete_empty().await,
            Err(err) => {
                warn!(
                    registry = %self.registry,
                    host = %self.host,
                    "callback failed, keeping the previous entry, err: {}",
                    err
                );
            }
        }
    }
}

impl EntryPublisher {
    async fn retire(&self) {
        *self.retired.lock().await = true;
    }

    async fn delete_empty(&self) {
        info!(
            registry = %self.registry,
            host = %self.host,
            "delete service entry because there are no hosts"
        );
        self.store.delete(&self.host).await;
        self.metrics.record_store(&self.registry, "delete");
    }
}

fn refresh_ticker(period: Duration) -> Interval {
    let period = period.clamp(Duration::from_millis(1), MAX_REFRESH_INTERVAL);
    let now = Instant::now();
    let start = now.checked_add(period).unwrap_or(now);
    let mut ticker = interval_at(start, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

async fn refresh_loop(
    registry: Weak<Registry>,
    name: String,
    shutdown: CancellationToken,
    mut period: watch::Receiver<Duration>,
) {
    info!(registry = %name, "start refreshing services");
    let mut ticker = refresh_ticker(*period.borrow_and_update());

    loop {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => break,

            changed = period.changed() => {
                if changed.is_err() {
                    break;
                }
                let next = *period.borrow_and_update();
                info!(registry = %name, "refresh interval changed to {:?}", next);
                ticker = refresh_ticker(next);
            }

            _ = ticker.tick() => {
                let Some(registry) = registry.upgrade() else {
                    break;
                };
                if let Err(err) = registry.refresh().await {
                    error!(registry = %name, "failed to refresh services, err: {}", err);
                }
            }
        }
    }

    info!(registry = %name, "stop refreshing services");
}
