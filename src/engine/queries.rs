use std::time::Instant;

use crate::model::*;

use super::{observe, Deadline, Engine, EngineError};

impl Engine {
    pub async fn get(&self, id: BookingId, deadline: Deadline) -> Result<Booking, EngineError> {
        let started = Instant::now();
        let result = deadline
            .run(self.store.get_by_id(id))
            .await
            .and_then(|found| found.ok_or(EngineError::NotFound(id)));
        observe("get", started, &result);
        result
    }

    pub async fn list_for_requester(
        &self,
        requester_id: RequesterId,
        deadline: Deadline,
    ) -> Result<Vec<Booking>, EngineError> {
        let started = Instant::now();
        let result = deadline
            .run(self.store.list_by_requester(requester_id))
            .await;
        observe("list_for_requester", started, &result);
        result
    }

    pub async fn list_for_resource(
        &self,
        resource_id: ResourceId,
        deadline: Deadline,
    ) -> Result<Vec<Booking>, EngineError> {
        let started = Instant::now();
        let result = deadline
            .run(self.store.list_by_resource(resource_id))
            .await;
        observe("list_for_resource", started, &result);
        result
    }

    pub async fn list_all(&self, deadline: Deadline) -> Result<Vec<Booking>, EngineError> {
        let started = Instant::now();
        let result = deadline.run(self.store.list_all()).await;
        observe("list_all", started, &result);
        result
    }
}
