//! Existence checks owned by the resource and user collaborators.

use async_trait::async_trait;
use dashmap::DashSet;

use crate::engine::EngineError;
use crate::model::{RequesterId, ResourceId};

#[async_trait]
pub trait Directory: Send + Sync {
    async fn resource_exists(&self, id: ResourceId) -> Result<bool, EngineError>;

    async fn requester_exists(&self, id: RequesterId) -> Result<bool, EngineError>;
}

/// Accepts every identifier. For deployments where the caller already vetted them.
#[derive(Debug, Default, Clone, Copy)]
pub struct OpenDirectory;

#[async_trait]
impl Directory for OpenDirectory {
    async fn resource_exists(&self, _id: ResourceId) -> Result<bool, EngineError> {
        Ok(true)
    }

    async fn requester_exists(&self, _id: RequesterId) -> Result<bool, EngineError> {
        Ok(true)
    }
}

/// A registry of known resources and requesters.
///
/// Either side can be left open, in which case it accepts every identifier.
#[derive(Debug, Default)]
pub struct StaticDirectory {
    resources: DashSet<ResourceId>,
    requesters: DashSet<RequesterId>,
    open_resources: bool,
    open_requesters: bool,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entries(
        resources: impl IntoIterator<Item = ResourceId>,
        requesters: impl IntoIterator<Item = RequesterId>,
    ) -> Self {
        let directory = Self::new();
        for id in resources {
            directory.add_resource(id);
        }
        for id in requesters {
            directory.add_requester(id);
        }
        directory
    }

    /// Seed from optional lists. `None` leaves that side open.
    pub fn seeded(
        resources: Option<Vec<ResourceId>>,
        requesters: Option<Vec<RequesterId>>,
    ) -> Self {
        let mut directory = Self::with_entries(
            resources.iter().flatten().copied(),
            requesters.iter().flatten().copied(),
        );
        directory.open_resources = resources.is_none();
        directory.open_requesters = requesters.is_none();
        directory
    }

    pub fn add_resource(&self, id: ResourceId) {
        self.resources.insert(id);
    }

    pub fn remove_resource(&self, id: &ResourceId) {
        self.resources.remove(id);
    }

    pub fn add_requester(&self, id: RequesterId) {
        self.requesters.insert(id);
    }
}

#[async_trait]
impl Directory for StaticDirectory {
    async fn resource_exists(&self, id: ResourceId) -> Result<bool, EngineError> {
        Ok(self.open_resources || self.resources.contains(&id))
    }

    async fn requester_exists(&self, id: RequesterId) -> Result<bool, EngineError> {
        Ok(self.open_requesters || self.requesters.contains(&id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    #[tokio::test]
    async fn static_directory_tracks_registrations() {
        let room = Ulid::new();
        let alice = Ulid::new();
        let dir = StaticDirectory::with_entries([room], [alice]);

        assert!(dir.resource_exists(room).await.unwrap());
        assert!(dir.requester_exists(alice).await.unwrap());
        assert!(!dir.resource_exists(alice).await.unwrap());

        dir.remove_resource(&room);
        assert!(!dir.resource_exists(room).await.unwrap());
    }

    #[tokio::test]
    async fn seeded_directory_leaves_missing_side_open() {
        let room = Ulid::new();
        let dir = StaticDirectory::seeded(Some(vec![room]), None);

        assert!(dir.resource_exists(room).await.unwrap());
        assert!(!dir.resource_exists(Ulid::new()).await.unwrap());
        assert!(dir.requester_exists(Ulid::new()).await.unwrap());
    }

    #[tokio::test]
    async fn open_directory_accepts_anything() {
        assert!(OpenDirectory.resource_exists(Ulid::new()).await.unwrap());
        assert!(OpenDirectory.requester_exists(Ulid::new()).await.unwrap());
    }
}
