//! In-memory registry client and store used by the unit tests

use crate::client::{ClientFactory, RegistryClient, ServiceListener, SubscribeResult};
use crate::config::RegistryConfig;
use crate::entry::ServiceEntryWrapper;
use crate::error::ClientError;
use crate::store::ServiceEntryStore;
use crate::watch_set::ServiceSet;
use crate::{Result, ServiceKey};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub(crate) fn key(group: &str, name: &str) -> ServiceKey {
    ServiceKey::new(group, name)
}

#[derive(Default)]
struct FakeClientState {
    services: ServiceSet,
    fail_fetch: bool,
    fetches: usize,
    failing_subscribe: HashSet<ServiceKey>,
    failing_unsubscribe: HashSet<ServiceKey>,
    subscribed: Vec<ServiceKey>,
    unsubscribed: Vec<ServiceKey>,
    listeners: HashMap<ServiceKey, Arc<dyn ServiceListener>>,
}

/// Registry client serving a programmable service list
#[derive(Clone)]
pub(crate) struct FakeClient {
    namespace: String,
    groups: Vec<String>,
    state: Arc<Mutex<FakeClientState>>,
}

impl FakeClient {
    pub(crate) fn new(namespace: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            groups: Vec::new(),
            state: Arc::new(Mutex::new(FakeClientState::default())),
        }
    }

    pub(crate) fn with_services(self, keys: &[ServiceKey]) -> Self {
        self.set_services(keys);
        self
    }

    pub(crate) fn set_services(&self, keys: &[ServiceKey]) {
        self.state.lock().unwrap().services = keys.iter().cloned().collect();
    }

    pub(crate) fn fail_fetch(&self) {
        self.state.lock().unwrap().fail_fetch = true;
    }

    pub(crate) fn fetches(&self) -> usize {
        self.state.lock().unwrap().fetches
    }

    pub(crate) fn fail_subscribe(&self, key: &ServiceKey) {
        self.state
            .lock()
            .unwrap()
            .failing_subscribe
            .insert(key.clone());
    }

    pub(crate) fn allow_subscribe(&self, key: &ServiceKey) {
        self.state.lock().unwrap().failing_subscribe.remove(key);
    }

    pub(crate) fn fail_unsubscribe(&self, key: &ServiceKey) {
        self.state
            .lock()
            .unwrap()
            .failing_unsubscribe
            .insert(key.clone());
    }

    /// Successful subscribe calls, in call order
    pub(crate) fn subscribed(&self) -> Vec<ServiceKey> {
        self.state.lock().unwrap().subscribed.clone()
    }

    /// Unsubscribe calls, in call order
    pub(crate) fn unsubscribed(&self) -> Vec<ServiceKey> {
        self.state.lock().unwrap().unsubscribed.clone()
    }

    pub(crate) fn listener(&self, key: &ServiceKey) -> Option<Arc<dyn ServiceListener>> {
        self.state.lock().unwrap().listeners.get(key).cloned()
    }

    /// Deliver `result` to the listener of `key`, if subscribed
    pub(crate) async fn push(&self, key: &ServiceKey, result: SubscribeResult) -> bool {
        let Some(listener) = self.listener(key) else {
            return false;
        };
        listener.on_change(result).await;
        true
    }
}

#[async_trait::async_trait]
impl RegistryClient for FakeClient {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    fn groups(&self) -> &[String] {
        &self.groups
    }

    async fn fetch_all_services(&self) -> std::result::Result<ServiceSet, ClientError> {
        let mut state = self.state.lock().unwrap();
        state.fetches += 1;
        if state.fail_fetch {
            return Err(ClientError::Response("fetch failed".to_string()));
        }
        Ok(state.services.clone())
    }

    async fn subscribe(
        &self,
        key: &ServiceKey,
        listener: Arc<dyn ServiceListener>,
    ) -> std::result::Result<(), ClientError> {
        let mut state = self.state.lock().unwrap();
        if state.failing_subscribe.contains(key) {
            return Err(ClientError::Response(format!("cannot subscribe {}", key)));
        }
        state.subscribed.push(key.clone());
        state.listeners.insert(key.clone(), listener);
        Ok(())
    }

    async fn unsubscribe(&self, key: &ServiceKey) -> std::result::Result<(), ClientError> {
        let mut state = self.state.lock().unwrap();
        state.unsubscribed.push(key.clone());
        if state.failing_unsubscribe.contains(key) {
            return Err(ClientError::Response(format!("cannot unsubscribe {}", key)));
        }
        state.listeners.remove(key);
        Ok(())
    }
}

/// Hands out queued clients, or an empty client once the queue is drained
#[derive(Default)]
pub(crate) struct FakeFactory {
    clients: Mutex<VecDeque<FakeClient>>,
    created: AtomicUsize,
}

impl FakeFactory {
    pub(crate) fn push(&self, client: FakeClient) {
        self.clients.lock().unwrap().push_back(client);
    }

    pub(crate) fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

impl ClientFactory for FakeFactory {
    fn create(&self, _config: &RegistryConfig) -> Result<Arc<dyn RegistryClient>> {
        self.created.fetch_add(1, Ordering::SeqCst);
        let client = self
            .clients
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| FakeClient::new("public"));
        Ok(Arc::new(client))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum StoreCall {
    Update(String),
    Delete(String),
}

/// Store recording every call it receives
#[derive(Default)]
pub(crate) struct FakeStore {
    calls: Mutex<Vec<StoreCall>>,
    entries: Mutex<HashMap<String, ServiceEntryWrapper>>,
}

impl FakeStore {
    pub(crate) fn calls(&self) -> Vec<StoreCall> {
        self.calls.lock().unwrap().clone()
    }

    pub(crate) fn entry(&self, host: &str) -> Option<ServiceEntryWrapper> {
        self.entries.lock().unwrap().get(host).cloned()
    }
}

#[async_trait::async_trait]
impl ServiceEntryStore for FakeStore {
    async fn update(&self, host: &str, entry: ServiceEntryWrapper) {
        self.calls
            .lock()
            .unwrap()
            .push(StoreCall::Update(host.to_string()));
        self.entries.lock().unwrap().insert(host.to_string(), entry);
    }

    async fn delete(&self, host: &str) {
        self.calls
            .lock()
            .unwrap()
            .push(StoreCall::Delete(host.to_string()));
        self.entries.lock().unwrap().remove(host);
    }
}
