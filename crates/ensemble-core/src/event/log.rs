//! Append-only audit log with live fan-out.

use std::sync::Arc;

use ensemble_types::error::WorkflowError;
use ensemble_types::event::WorkflowEvent;
use tokio::sync::broadcast;
use uuid::Uuid;

use super::bus::EventBus;
use crate::repository::WorkflowStore;

/// Persists events through the store and broadcasts them on the bus.
///
/// Events that are part of a composite commit are written by the store inside
/// that commit; callers then hand them to [`EventLog::announce`] so that only
/// committed events ever reach subscribers.
pub struct EventLog<S: WorkflowStore> {
    store: Arc<S>,
    bus: EventBus,
}

impl<S: WorkflowStore> EventLog<S> {
    pub fn new(store: Arc<S>, bus: EventBus) -> Self {
        Self { store, bus }
    }

    /// Persist a standalone event, then broadcast it.
    pub async fn append(&self, event: WorkflowEvent) -> Result<(), WorkflowError> {
        self.store.append_event(&event).await?;
        tracing::debug!(
            instance_id = %event.instance_id,
            event_type = %event.event_type,
            "event appended"
        );
        self.bus.publish(event);
        Ok(())
    }

    /// Broadcast events that were already persisted by a commit.
    pub fn announce(&self, events: impl IntoIterator<Item = WorkflowEvent>) {
        for event in events {
            self.bus.publish(event);
        }
    }

    /// Full audit trail of one instance, in append order.
    pub async fn list(&self, instance_id: &Uuid) -> Result<Vec<WorkflowEvent>, WorkflowError> {
        Ok(self.store.list_events(instance_id).await?)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.bus.subscribe()
    }
}
