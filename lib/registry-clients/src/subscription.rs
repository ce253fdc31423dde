//! Per-service subscription tasks

use rand::Rng;
use registry_core::{ClientError, Endpoint, ServiceKey, ServiceListener};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Cancellation handles of the running subscription tasks, keyed by service.
///
/// Dropping the table cancels every task.
#[derive(Default)]
pub struct Subscriptions {
    tasks: Mutex<HashMap<ServiceKey, CancellationToken>>,
}

impl Subscriptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `key`, returning the token its task must watch.
    ///
    /// Returns `None` when the key already has a task.
    pub fn register(&self, key: &ServiceKey) -> Option<CancellationToken> {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        if tasks.contains_key(key) {
            return None;
        }
        let token = CancellationToken::new();
        tasks.insert(key.clone(), token.clone());
        Some(token)
    }

    /// Cancel the task of `key`, if any
    pub fn cancel(&self, key: &ServiceKey) -> bool {
        let token = self
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
        match token {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, key: &ServiceKey) -> bool {
        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn cancel_all(&self) {
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(|e| e.into_inner()));
        for token in tasks.into_values() {
            token.cancel();
        }
    }
}

impl Drop for Subscriptions {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

/// Random delay in `[0, max)` spreading the first polls of many services
pub fn start_jitter(max: Duration) -> Duration {
    if max.is_zero() {
        return Duration::ZERO;
    }
    let millis = rand::thread_rng().gen_range(0..max.as_millis().max(1) as u64);
    Duration::from_millis(millis)
}

/// Poll the instances of `key` until `token` is cancelled.
///
/// The first poll runs after `jitter`, the next ones every `interval`. The
/// listener hears about every change of the instance list; an instance list
/// turning empty is reported as `NoHosts`. Poll failures are reported as they
/// happen and do not reset the last known list.
pub async fn poll_instances<F, Fut>(
    key: ServiceKey,
    listener: Arc<dyn ServiceListener>,
    token: CancellationToken,
    jitter: Duration,
    interval: Duration,
    mut fetch: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Vec<Endpoint>, ClientError>>,
{
    let mut last: Option<Vec<Endpoint>> = None;
    let mut delay = jitter;

    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
        delay = interval;

        let result = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            result = fetch() => result,
        };

        match result {
            Ok(mut endpoints) => {
                endpoints.sort();
                if last.as_ref() == Some(&endpoints) {
                    continue;
                }
                debug!(service = %key, endpoints = endpoints.len(), "instances changed");
                last = Some(endpoints.clone());
                if endpoints.is_empty() {
                    listener
                        .on_change(Err(ClientError::NoHosts(key.to_string())))
                        .await;
                } else {
                    listener.on_change(Ok(endpoints)).await;
                }
            }
            Err(err) => listener.on_change(Err(err)).await,
        }
    }

    debug!(service = %key, "subscription stopped");
}
