//! Fulfillment events and the consumers bound to the fan-out exchange.
//!
//! Delivery is at-least-once. Consumers must tolerate seeing the same
//! [`FulfillmentEvent`] more than once; the stock consumer deduplicates on
//! [`EventId`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::collaborators::StockLine;
use crate::errors::{CollaboratorError, HandlerError};
use crate::order::Order;
use crate::types::{EventId, Money, OrderId, Timestamp, UserId};

/// Name of the fan-out exchange fulfillment events are broadcast on.
pub const FULFILLMENT_EXCHANGE: &str = "order_fanout";

/// Broadcast after an order is persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FulfillmentEvent {
    /// Unique per broadcast, stable across redeliveries.
    pub event_id: EventId,
    /// The persisted order.
    pub order_id: OrderId,
    /// Owning user.
    pub user_id: UserId,
    /// Amount charged.
    pub total: Money,
    /// Products and quantities, in line order.
    pub items: Vec<StockLine>,
    /// When the event was produced.
    pub occurred_at: Timestamp,
}

impl FulfillmentEvent {
    /// Builds the event for a freshly persisted order.
    pub fn for_order(order: &Order, occurred_at: Timestamp) -> Self {
        Self {
            event_id: EventId::generate(),
            order_id: order.id,
            user_id: order.user_id.clone(),
            total: order.total(),
            items: order.items.iter().map(StockLine::from).collect(),
            occurred_at,
        }
    }
}

/// A consumer bound to its own queue on the fulfillment exchange.
#[async_trait]
pub trait FulfillmentHandler: Send + Sync {
    /// Queue name, also used in logs.
    fn name(&self) -> &'static str;

    /// Processes one delivery.
    async fn handle(&self, event: &FulfillmentEvent) -> Result<(), HandlerError>;
}

/// Result of applying a stock decrement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecrementOutcome {
    /// Stock was decremented.
    Applied,
    /// This event was already processed; nothing changed.
    AlreadyApplied,
}

/// Inventory-side stock decrement keyed by event.
#[async_trait]
pub trait StockDecrement: Send + Sync {
    /// Subtracts each line's quantity from stock and records `event_id` as
    /// processed, atomically. A second call with the same `event_id` is a
    /// no-op.
    async fn apply_decrement(
        &self,
        event_id: EventId,
        lines: &[StockLine],
    ) -> Result<DecrementOutcome, CollaboratorError>;
}

/// Queue name of [`StockDecrementConsumer`].
pub const STOCK_QUEUE: &str = "stock_queue";

/// Decrements inventory for every fulfilled order.
#[derive(Debug, Clone)]
pub struct StockDecrementConsumer<S> {
    stock: S,
}

impl<S> StockDecrementConsumer<S> {
    /// Wraps a stock store.
    pub const fn new(stock: S) -> Self {
        Self { stock }
    }
}

#[async_trait]
impl<S> FulfillmentHandler for StockDecrementConsumer<S>
where
    S: StockDecrement,
{
    fn name(&self) -> &'static str {
        STOCK_QUEUE
    }

    #[instrument(name = "consumer.stock", skip(self, event), fields(event_id = %event.event_id, order_id = %event.order_id))]
    async fn handle(&self, event: &FulfillmentEvent) -> Result<(), HandlerError> {
        let outcome = self
            .stock
            .apply_decrement(event.event_id, &event.items)
            .await
            .map_err(|error| HandlerError {
                consumer: STOCK_QUEUE,
                event_id: event.event_id,
                detail: error.to_string(),
            })?;

        match outcome {
            DecrementOutcome::Applied => info!(
                lines = event.items.len(),
                "[consumer.stock] stock decremented"
            ),
            DecrementOutcome::AlreadyApplied => warn!(
                "[consumer.stock] duplicate delivery ignored"
            ),
        }
        Ok(())
    }
}

/// A message for the customer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    /// Order the message is about.
    pub order_id: OrderId,
    /// Recipient.
    pub user_id: UserId,
    /// Subject line.
    pub subject: String,
    /// Message body.
    pub body: String,
}

/// Delivers notifications to customers.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Sends one notification.
    async fn send(&self, notification: Notification) -> Result<(), CollaboratorError>;
}

/// Queue name of [`NotificationConsumer`].
pub const NOTIFICATION_QUEUE: &str = "notification_queue";

/// Sends an order confirmation for every fulfilled order.
#[derive(Debug, Clone)]
pub struct NotificationConsumer<N> {
    notifier: N,
}

impl<N> NotificationConsumer<N> {
    /// Wraps a notifier.
    pub const fn new(notifier: N) -> Self {
        Self { notifier }
    }

    /// Renders the confirmation for `event`.
    pub fn render(event: &FulfillmentEvent) -> Notification {
        let units: u64 = event
            .items
            .iter()
            .map(|line| u64::from(line.quantity.into_inner()))
            .sum();
        Notification {
            order_id: event.order_id,
            user_id: event.user_id.clone(),
            subject: format!("Order {} confirmed", event.order_id),
            body: format!(
                "Your order {} for {units} item(s) totalling {} is being prepared.",
                event.order_id, event.total
            ),
        }
    }
}

#[async_trait]
impl<N> FulfillmentHandler for NotificationConsumer<N>
where
    N: Notifier,
{
    fn name(&self) -> &'static str {
        NOTIFICATION_QUEUE
    }

    #[instrument(name = "consumer.notification", skip(self, event), fields(event_id = %event.event_id, order_id = %event.order_id))]
    async fn handle(&self, event: &FulfillmentEvent) -> Result<(), HandlerError> {
        self.notifier
            .send(Self::render(event))
            .await
            .map_err(|error| HandlerError {
                consumer: NOTIFICATION_QUEUE,
                event_id: event.event_id,
                detail: error.to_string(),
            })?;
        info!(user_id = %event.user_id, "[consumer.notification] confirmation sent");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ProductId, Quantity};
    use parking_lot::Mutex;
    use std::collections::HashSet;

    #[derive(Default)]
    struct CountingStock {
        seen: Mutex<HashSet<EventId>>,
        applications: Mutex<Vec<(EventId, usize)>>,
    }

    #[async_trait]
    impl StockDecrement for CountingStock {
        async fn apply_decrement(
            &self,
            event_id: EventId,
            lines: &[StockLine],
        ) -> Result<DecrementOutcome, CollaboratorError> {
            if !self.seen.lock().insert(event_id) {
                return Ok(DecrementOutcome::AlreadyApplied);
            }
            self.applications.lock().push((event_id, lines.len()));
            Ok(DecrementOutcome::Applied)
        }
    }

    fn event() -> FulfillmentEvent {
        FulfillmentEvent {
            event_id: EventId::generate(),
            order_id: OrderId::generate(),
            user_id: UserId::try_new("user-1").unwrap(),
            total: Money::from_cents(8_500).unwrap(),
            items: vec![
                StockLine {
                    product_id: ProductId::try_new("sku-1").unwrap(),
                    quantity: Quantity::try_new(2).unwrap(),
                },
                StockLine {
                    product_id: ProductId::try_new("sku-2").unwrap(),
                    quantity: Quantity::try_new(1).unwrap(),
                },
            ],
            occurred_at: Timestamp::now(),
        }
    }

    #[tokio::test]
    async fn redelivery_is_a_no_op() {
        let consumer = StockDecrementConsumer::new(CountingStock::default());
        let event = event();

        consumer.handle(&event).await.unwrap();
        consumer.handle(&event).await.unwrap();

        // one application covering both lines
        assert_eq!(
            *consumer.stock.applications.lock(),
            vec![(event.event_id, 2)]
        );
    }

    #[test]
    fn confirmation_mentions_order_and_total() {
        let event = event();
        let notification = NotificationConsumer::<()>::render(&event);

        assert_eq!(notification.user_id, event.user_id);
        assert!(notification.subject.contains(&event.order_id.to_string()));
        assert!(notification.body.contains("3 item(s)"));
        assert!(notification.body.contains("85.00"));
    }

    #[test]
    fn event_json_shape() {
        let event = event();
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["items"][0]["product_id"], "sku-1");
        assert_eq!(json["items"][0]["quantity"], 2);
        assert_eq!(json["total"], "85.00");
    }
}
