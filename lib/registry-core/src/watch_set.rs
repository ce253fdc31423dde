//! Bookkeeping of subscribed and soft-deleted services

use crate::ServiceKey;
use std::collections::hash_set;
use std::collections::HashSet;

/// An unordered set of service keys
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ServiceSet {
    services: HashSet<ServiceKey>,
}

/// Services that currently hold a subscription with the active client
pub type WatchSet = ServiceSet;

/// Services that were unsubscribed but whose store entries are still published
pub type SoftDeletedSet = ServiceSet;

impl ServiceSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: ServiceKey) -> bool {
        self.services.insert(key)
    }

    pub fn remove(&mut self, key: &ServiceKey) -> bool {
        self.services.remove(key)
    }

    pub fn contains(&self, key: &ServiceKey) -> bool {
        self.services.contains(key)
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    pub fn iter(&self) -> hash_set::Iter<'_, ServiceKey> {
        self.services.iter()
    }

    /// Keys in sorted order, for deterministic iteration
    pub fn sorted(&self) -> Vec<ServiceKey> {
        let mut keys: Vec<ServiceKey> = self.services.iter().cloned().collect();
        keys.sort();
        keys
    }
}

impl FromIterator<ServiceKey> for ServiceSet {
    fn from_iter<I: IntoIterator<Item = ServiceKey>>(iter: I) -> Self {
        Self {
            services: iter.into_iter().collect(),
        }
    }
}

impl Extend<ServiceKey> for ServiceSet {
    fn extend<I: IntoIterator<Item = ServiceKey>>(&mut self, iter: I) {
        self.services.extend(iter)
    }
}

impl IntoIterator for ServiceSet {
    type Item = ServiceKey;
    type IntoIter = hash_set::IntoIter<ServiceKey>;

    fn into_iter(self) -> Self::IntoIter {
        self.services.into_iter()
    }
}

impl<'a> IntoIterator for &'a ServiceSet {
    type Item = &'a ServiceKey;
    type IntoIter = hash_set::Iter<'a, ServiceKey>;

    fn into_iter(self) -> Self::IntoIter {
        self.services.iter()
    }
}

/// Difference between the watched services and a fresh fetch, each list sorted
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SetDiff {
    /// Fetched but not watched yet
    pub added: Vec<ServiceKey>,
    /// Watched and fetched again
    pub retained: Vec<ServiceKey>,
    /// Watched but missing from the fetch
    pub removed: Vec<ServiceKey>,
}

/// The watch set and the soft-deleted set of one registry instance.
///
/// A key is never in both sets. Both sets are only ever replaced as a whole
/// through [`WatchState::swap`], so a reader never sees a half-applied cycle.
#[derive(Debug, Default)]
pub struct WatchState {
    watching: WatchSet,
    soft_deleted: SoftDeletedSet,
}

impl WatchState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn watching(&self) -> &WatchSet {
        &self.watching
    }

    pub fn soft_deleted(&self) -> &SoftDeletedSet {
        &self.soft_deleted
    }

    pub fn diff(&self, fetched: &ServiceSet) -> SetDiff {
        let mut diff = SetDiff::default();
        for key in fetched {
            if self.watching.contains(key) {
                diff.retained.push(key.clone());
            } else {
                diff.added.push(key.clone());
            }
        }
        diff.removed = self
            .watching
            .iter()
            .filter(|key| !fetched.contains(key))
            .cloned()
            .collect();

        diff.added.sort();
        diff.retained.sort();
        diff.removed.sort();
        diff
    }

    /// Install `watching` as the new watch set and soft-delete `dropped`.
    ///
    /// Keys present in the new watch set leave the soft-deleted set. Returns
    /// the previous watch set.
    pub fn swap(
        &mut self,
        watching: WatchSet,
        dropped: impl IntoIterator<Item = ServiceKey>,
    ) -> WatchSet {
        let soft_deleted: SoftDeletedSet = self
            .soft_deleted
            .iter()
            .cloned()
            .chain(dropped)
            .filter(|key| !watching.contains(key))
            .collect();

        self.soft_deleted = soft_deleted;
        std::mem::replace(&mut self.watching, watching)
    }

    /// Clear the soft-deleted set, returning its previous content
    pub fn take_soft_deleted(&mut self) -> SoftDeletedSet {
        std::mem::take(&mut self.soft_deleted)
    }

    /// Clear both sets, returning the watch set and the soft-deleted set
    pub fn take(&mut self) -> (WatchSet, SoftDeletedSet) {
        (
            std::mem::take(&mut self.watching),
            std::mem::take(&mut self.soft_deleted),
        )
    }

    /// Whether the watch set and the soft-deleted set are disjoint
    pub fn is_consistent(&self) -> bool {
        self.watching
            .iter()
            .all(|key| !self.soft_deleted.contains(key))
    }
}
