//! Test publisher that records fulfillment events for assertions.
//!
//! `EventCollector` implements [`FulfillmentPublisher`] and accumulates every
//! broadcast event in shared storage, so a test can check that a placement
//! published exactly the events it expected.
//!
//! # Example
//!
//! ```ignore
//! let collector = EventCollector::new();
//! let collaborators = Collaborators { publisher: Arc::new(collector.clone()), .. };
//!
//! placement.place(request).await?;
//!
//! assert_eq!(collector.events().len(), 1);
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use orderflow::{FulfillmentEvent, FulfillmentPublisher, OrderId, PublishError};
use parking_lot::Mutex;

/// A publisher that collects events instead of delivering them.
///
/// Clones share storage, so a clone handed to the orchestrator and the one
/// kept by the test see the same events.
#[derive(Debug, Clone, Default)]
pub struct EventCollector {
    events: Arc<Mutex<Vec<FulfillmentEvent>>>,
}

impl EventCollector {
    /// Creates a collector with empty storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a clone of all collected events.
    pub fn events(&self) -> Vec<FulfillmentEvent> {
        self.events.lock().clone()
    }

    /// Events published for `order_id`.
    pub fn events_for(&self, order_id: OrderId) -> Vec<FulfillmentEvent> {
        self.events
            .lock()
            .iter()
            .filter(|event| event.order_id == order_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl FulfillmentPublisher for EventCollector {
    async fn broadcast(&self, event: &FulfillmentEvent) -> Result<(), PublishError> {
        self.events.lock().push(event.clone());
        Ok(())
    }
}
