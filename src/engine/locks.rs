use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::model::ResourceId;

/// Resource-keyed exclusive sections. One mutex per resource, created on first use.
#[derive(Default)]
pub struct LockTable {
    locks: DashMap<ResourceId, Arc<Mutex<()>>>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for the resource's section. Held until the guard drops.
    pub async fn acquire(&self, resource_id: ResourceId) -> OwnedMutexGuard<()> {
        // Clone the Arc out so the map shard is released before awaiting.
        let lock = self.locks.entry(resource_id).or_default().value().clone();
        lock.lock_owned().await
    }

    /// Non-blocking probe, `None` while another task holds the section.
    pub fn try_acquire(&self, resource_id: ResourceId) -> Option<OwnedMutexGuard<()>> {
        let lock = self.locks.entry(resource_id).or_default().value().clone();
        lock.try_lock_owned().ok()
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    #[tokio::test]
    async fn same_resource_is_exclusive() {
        let table = LockTable::new();
        let rid = Ulid::new();
        let guard = table.acquire(rid).await;
        assert!(table.try_acquire(rid).is_none());
        drop(guard);
        assert!(table.try_acquire(rid).is_some());
    }

    #[tokio::test]
    async fn different_resources_do_not_block() {
        let table = LockTable::new();
        let _a = table.acquire(Ulid::new()).await;
        let _b = table.acquire(Ulid::new()).await;
        assert_eq!(table.len(), 2);
    }
}
