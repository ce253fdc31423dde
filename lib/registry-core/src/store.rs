//! Consumer side of the engine

use crate::entry::ServiceEntryWrapper;

/// Sink for published service entries.
///
/// Implementations must tolerate repeated and reordered calls for the same
/// host: updating an unchanged entry and deleting an unknown host are no-ops.
#[async_trait::async_trait]
pub trait ServiceEntryStore: Send + Sync {
    async fn update(&self, host: &str, entry: ServiceEntryWrapper);

    async fn delete(&self, host: &str);
}
