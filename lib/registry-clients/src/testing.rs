//! Listener and polling helpers shared by the client tests

use registry_core::{ClientError, ServiceListener, SubscribeResult};
use std::sync::Mutex;
use std::time::Duration;

/// Listener remembering every delivery as a short summary
#[derive(Default)]
pub(crate) struct Recorder {
    results: Mutex<Vec<String>>,
}

impl Recorder {
    pub(crate) fn summary(&self) -> Vec<String> {
        self.results.lock().unwrap().clone()
    }

    pub(crate) fn len(&self) -> usize {
        self.results.lock().unwrap().len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait::async_trait]
impl ServiceListener for Recorder {
    async fn on_change(&self, result: SubscribeResult) {
        let summary = match result {
            Ok(endpoints) => {
                let addresses: Vec<String> = endpoints
                    .iter()
                    .map(|e| format!("{}:{}", e.ip, e.port))
                    .collect();
                format!("ok:{}", addresses.join(","))
            }
            Err(ClientError::NoHosts(_)) => "no-hosts".to_string(),
            Err(_) => "error".to_string(),
        };
        self.results.lock().unwrap().push(summary);
    }
}

/// Wait up to five seconds for `condition` to hold
pub(crate) async fn wait_for(condition: impl Fn() -> bool) {
    for _ in 0..100 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("condition not met in time");
}
