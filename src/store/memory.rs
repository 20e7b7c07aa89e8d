use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{OwnedRwLockWriteGuard, RwLock};
use ulid::Generator;

use crate::engine::{now_ms, EngineError};
use crate::model::*;

use super::wal_store::Journal;
use super::{sort_newest_first, BookingStore};

pub type SharedLedger = Arc<RwLock<ResourceLedger>>;

/// In-memory booking arena: one ledger per resource plus reverse indexes.
/// Also the materialized state behind [`super::WalStore`].
pub struct MemoryStore {
    ledgers: DashMap<ResourceId, SharedLedger>,
    /// Reverse lookup: booking id → resource id
    booking_to_resource: DashMap<BookingId, ResourceId>,
    by_requester: DashMap<RequesterId, Vec<BookingId>>,
    ids: Mutex<Generator>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            ledgers: DashMap::new(),
            booking_to_resource: DashMap::new(),
            by_requester: DashMap::new(),
            ids: Mutex::new(Generator::new()),
        }
    }

    pub fn booking_count(&self) -> usize {
        self.booking_to_resource.len()
    }

    pub fn resource_count(&self) -> usize {
        self.ledgers.len()
    }

    fn next_id(&self) -> Result<BookingId, EngineError> {
        let mut generator = self
            .ids
            .lock()
            .map_err(|_| EngineError::StorageFailure("id generator poisoned".into()))?;
        generator
            .generate()
            .map_err(|e| EngineError::StorageFailure(format!("id generation failed: {e}")))
    }

    fn ledger(&self, resource_id: &ResourceId) -> Option<SharedLedger> {
        self.ledgers.get(resource_id).map(|e| e.value().clone())
    }

    fn ledger_or_insert(&self, resource_id: ResourceId) -> SharedLedger {
        self.ledgers
            .entry(resource_id)
            .or_insert_with(|| Arc::new(RwLock::new(ResourceLedger::new(resource_id))))
            .value()
            .clone()
    }

    /// Lookup booking → resource, acquire that ledger's write lock.
    async fn resolve_write(
        &self,
        id: BookingId,
    ) -> Result<OwnedRwLockWriteGuard<ResourceLedger>, EngineError> {
        let resource_id = self
            .booking_to_resource
            .get(&id)
            .map(|e| *e.value())
            .ok_or(EngineError::NotFound(id))?;
        let ledger = self
            .ledger(&resource_id)
            .ok_or(EngineError::NotFound(id))?;
        Ok(ledger.write_owned().await)
    }

    /// Apply an event to a ledger (caller holds its write lock) and keep the indexes in step.
    fn apply(&self, ledger: &mut ResourceLedger, event: &Event) {
        match event {
            Event::BookingCreated { booking } => {
                ledger.insert(booking.clone());
                self.booking_to_resource
                    .insert(booking.id, booking.resource_id);
                self.by_requester
                    .entry(booking.requester_id)
                    .or_default()
                    .push(booking.id);
            }
            Event::StatusChanged {
                id,
                status,
                updated_at,
                ..
            } => {
                if let Some(booking) = ledger.get_mut(*id) {
                    booking.status = *status;
                    booking.updated_at = *updated_at;
                }
            }
        }
    }

    /// Rebuild state from journal events. Runs before the store is shared, so
    /// every ledger lock is uncontended.
    pub(super) fn replay(&self, events: &[Event]) -> Result<(), EngineError> {
        for event in events {
            let ledger = self.ledger_or_insert(event.resource_id());
            let mut guard = ledger
                .try_write()
                .map_err(|_| EngineError::StorageFailure("replay: ledger contended".into()))?;
            if let Event::StatusChanged { id, .. } = event
                && guard.get(*id).is_none()
            {
                tracing::warn!(booking_id = %id, "replay: status change for unknown booking, skipped");
                continue;
            }
            self.apply(&mut guard, event);
        }
        Ok(())
    }

    /// Minimal event list recreating the current state, oldest booking first.
    pub(super) async fn snapshot(&self) -> Vec<Event> {
        let mut bookings = self.collect_all().await;
        bookings.reverse();
        bookings
            .into_iter()
            .map(|booking| Event::BookingCreated { booking })
            .collect()
    }

    pub(super) async fn create_with(
        &self,
        new: NewBooking,
        journal: Option<&Journal>,
    ) -> Result<Booking, EngineError> {
        let id = self.next_id()?;
        let now = id.timestamp_ms() as Ms;
        let booking = Booking {
            id,
            requester_id: new.requester_id,
            resource_id: new.resource_id,
            span: new.span,
            status: BookingStatus::Pending,
            created_at: now,
            updated_at: now,
        };
        let event = Event::BookingCreated {
            booking: booking.clone(),
        };

        let mut guard = self.ledger_or_insert(new.resource_id).write_owned().await;
        if let Some(journal) = journal {
            journal.append(&event).await?;
        }
        self.apply(&mut guard, &event);
        Ok(booking)
    }

    pub(super) async fn update_status_with(
        &self,
        id: BookingId,
        status: BookingStatus,
        journal: Option<&Journal>,
    ) -> Result<Booking, EngineError> {
        let mut guard = self.resolve_write(id).await?;
        let (from, created_at) = guard
            .get(id)
            .map(|b| (b.status, b.created_at))
            .ok_or(EngineError::NotFound(id))?;
        if !from.can_transition_to(status) {
            return Err(EngineError::InvalidTransition {
                id,
                from,
                to: status,
            });
        }

        let event = Event::StatusChanged {
            id,
            resource_id: guard.resource_id,
            status,
            updated_at: now_ms().max(created_at),
        };
        if let Some(journal) = journal {
            journal.append(&event).await?;
        }
        self.apply(&mut guard, &event);
        guard.get(id).cloned().ok_or(EngineError::NotFound(id))
    }

    async fn lookup(&self, id: BookingId) -> Option<Booking> {
        let resource_id = self.booking_to_resource.get(&id).map(|e| *e.value())?;
        let ledger = self.ledger(&resource_id)?;
        let guard = ledger.read().await;
        guard.get(id).cloned()
    }

    async fn collect_all(&self) -> Vec<Booking> {
        let ledgers: Vec<SharedLedger> = self.ledgers.iter().map(|e| e.value().clone()).collect();
        let mut bookings = Vec::with_capacity(self.booking_count());
        for ledger in ledgers {
            bookings.extend(ledger.read().await.bookings.iter().cloned());
        }
        sort_newest_first(&mut bookings);
        bookings
    }
}

#[async_trait]
impl BookingStore for MemoryStore {
    async fn create(&self, booking: NewBooking) -> Result<Booking, EngineError> {
        self.create_with(booking, None).await
    }

    async fn get_by_id(&self, id: BookingId) -> Result<Option<Booking>, EngineError> {
        Ok(self.lookup(id).await)
    }

    async fn update_status(
        &self,
        id: BookingId,
        status: BookingStatus,
    ) -> Result<Booking, EngineError> {
        self.update_status_with(id, status, None).await
    }

    async fn find_conflict(
        &self,
        resource_id: ResourceId,
        span: Span,
    ) -> Result<Option<BookingId>, EngineError> {
        let Some(ledger) = self.ledger(&resource_id) else {
            return Ok(None);
        };
        let guard = ledger.read().await;
        Ok(guard.first_conflict(&span).map(|b| b.id))
    }

    async fn list_by_resource(&self, resource_id: ResourceId) -> Result<Vec<Booking>, EngineError> {
        let Some(ledger) = self.ledger(&resource_id) else {
            return Ok(Vec::new());
        };
        let mut bookings = ledger.read().await.bookings.clone();
        sort_newest_first(&mut bookings);
        Ok(bookings)
    }

    async fn list_by_requester(
        &self,
        requester_id: RequesterId,
    ) -> Result<Vec<Booking>, EngineError> {
        let ids = self
            .by_requester
            .get(&requester_id)
            .map(|e| e.value().clone())
            .unwrap_or_default();
        let mut bookings = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(booking) = self.lookup(id).await {
                bookings.push(booking);
            }
        }
        sort_newest_first(&mut bookings);
        Ok(bookings)
    }

    async fn list_all(&self) -> Result<Vec<Booking>, EngineError> {
        Ok(self.collect_all().await)
    }
}
