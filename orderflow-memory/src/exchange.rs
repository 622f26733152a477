use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use orderflow::{FulfillmentEvent, FulfillmentPublisher, PublishError};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, error, instrument, warn};

#[derive(Debug, Clone)]
struct Message {
    payload: Arc<[u8]>,
    redelivered: bool,
}

struct Queue {
    ready: VecDeque<Message>,
    unacked: HashMap<u64, Message>,
    notify: Arc<Notify>,
}

impl Queue {
    fn new() -> Self {
        Self {
            ready: VecDeque::new(),
            unacked: HashMap::new(),
            notify: Arc::new(Notify::new()),
        }
    }
}

#[derive(Default)]
struct ExchangeState {
    queues: HashMap<String, Queue>,
    next_tag: u64,
    published: u64,
    closed: bool,
}

/// In-process fan-out exchange with durable per-subscriber queues.
///
/// Every broadcast is copied into each bound queue. Deliveries stay unacked
/// until the consumer acks them; [`QueueSubscription::recover`] puts unacked
/// deliveries back on the queue, flagged as redelivered. Payloads travel as
/// JSON, as they would over a broker.
#[derive(Clone)]
pub struct FanoutExchange {
    name: Arc<str>,
    state: Arc<Mutex<ExchangeState>>,
}

impl FanoutExchange {
    /// Declares an exchange.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: Arc::from(name.into()),
            state: Arc::new(Mutex::new(ExchangeState::default())),
        }
    }

    /// Exchange name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declares `queue` (if needed) and binds it to this exchange.
    ///
    /// Binding the same queue twice yields competing consumers on one queue.
    pub fn bind_queue(&self, queue: &str) -> QueueSubscription {
        let mut state = self.state.lock();
        let notify = state
            .queues
            .entry(queue.to_string())
            .or_insert_with(Queue::new)
            .notify
            .clone();
        debug!(exchange = %self.name, queue, "[exchange.bind_queue] queue bound");
        QueueSubscription {
            exchange: self.clone(),
            queue: Arc::from(queue),
            notify,
        }
    }

    /// Messages in `queue` that are ready or awaiting ack.
    pub fn queue_depth(&self, queue: &str) -> Option<usize> {
        self.state
            .lock()
            .queues
            .get(queue)
            .map(|queue| queue.ready.len() + queue.unacked.len())
    }

    /// Broadcasts accepted so far.
    pub fn published_count(&self) -> u64 {
        self.state.lock().published
    }

    /// Stops accepting broadcasts. Subscribers drain their queues and then
    /// see the end of the stream.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        for queue in state.queues.values() {
            queue.notify.notify_waiters();
        }
    }

    /// Whether [`Self::close`] was called.
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

#[async_trait]
impl FulfillmentPublisher for FanoutExchange {
    #[instrument(name = "exchange.broadcast", skip_all, fields(exchange = %self.name, event_id = %event.event_id))]
    async fn broadcast(&self, event: &FulfillmentEvent) -> Result<(), PublishError> {
        let payload: Arc<[u8]> = serde_json::to_vec(event)
            .map_err(|error| PublishError::Failed {
                exchange: self.name.to_string(),
                event_id: event.event_id,
                detail: error.to_string(),
            })?
            .into();

        let mut state = self.state.lock();
        if state.closed {
            return Err(PublishError::Closed(self.name.to_string()));
        }
        state.published += 1;
        if state.queues.is_empty() {
            warn!("[exchange.broadcast] no queues bound, message dropped");
        }
        for queue in state.queues.values_mut() {
            queue.ready.push_back(Message {
                payload: Arc::clone(&payload),
                redelivered: false,
            });
            queue.notify.notify_one();
        }
        Ok(())
    }
}

/// One delivery from a queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Tag to ack or nack with.
    pub delivery_tag: u64,
    /// True when this message was delivered before and not acked.
    pub redelivered: bool,
    /// Decoded event.
    pub event: FulfillmentEvent,
}

enum Next {
    Ready(Delivery),
    Empty,
    Closed,
}

/// A consumer's handle on one bound queue.
#[derive(Clone)]
pub struct QueueSubscription {
    exchange: FanoutExchange,
    queue: Arc<str>,
    notify: Arc<Notify>,
}

impl QueueSubscription {
    /// Queue name.
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Waits for the next delivery. Returns `None` once the exchange is
    /// closed and the queue is drained.
    pub async fn next(&self) -> Option<Delivery> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.poll_next() {
                Next::Ready(delivery) => return Some(delivery),
                Next::Closed => return None,
                Next::Empty => notified.await,
            }
        }
    }

    /// Takes the next delivery without waiting.
    pub fn try_next(&self) -> Option<Delivery> {
        match self.poll_next() {
            Next::Ready(delivery) => Some(delivery),
            Next::Empty | Next::Closed => None,
        }
    }

    fn poll_next(&self) -> Next {
        let mut state = self.exchange.state.lock();
        let closed = state.closed;
        loop {
            let tag = state.next_tag;
            let Some(queue) = state.queues.get_mut(&*self.queue) else {
                return Next::Closed;
            };
            let Some(message) = queue.ready.pop_front() else {
                return if closed { Next::Closed } else { Next::Empty };
            };

            match serde_json::from_slice::<FulfillmentEvent>(&message.payload) {
                Ok(event) => {
                    let redelivered = message.redelivered;
                    queue.unacked.insert(tag, message);
                    state.next_tag += 1;
                    return Next::Ready(Delivery {
                        delivery_tag: tag,
                        redelivered,
                        event,
                    });
                }
                Err(decode) => {
                    error!(
                        queue = %self.queue,
                        error = %decode,
                        "[exchange.deliver] undecodable message dropped"
                    );
                }
            }
        }
    }

    /// Acknowledges a delivery; it will not be redelivered.
    pub fn ack(&self, delivery_tag: u64) {
        let mut state = self.exchange.state.lock();
        if let Some(queue) = state.queues.get_mut(&*self.queue) {
            queue.unacked.remove(&delivery_tag);
        }
    }

    /// Rejects a delivery, optionally putting it back on the queue.
    pub fn nack(&self, delivery_tag: u64, requeue: bool) {
        let mut state = self.exchange.state.lock();
        if let Some(queue) = state.queues.get_mut(&*self.queue) {
            if let Some(mut message) = queue.unacked.remove(&delivery_tag) {
                if requeue {
                    message.redelivered = true;
                    queue.ready.push_front(message);
                    queue.notify.notify_one();
                }
            }
        }
    }

    /// Requeues every unacked delivery, as a broker does when a consumer
    /// connection drops.
    pub fn recover(&self) -> usize {
        let mut state = self.exchange.state.lock();
        let Some(queue) = state.queues.get_mut(&*self.queue) else {
            return 0;
        };
        let mut tags: Vec<u64> = queue.unacked.keys().copied().collect();
        tags.sort_unstable();
        let count = tags.len();
        for tag in tags.into_iter().rev() {
            if let Some(mut message) = queue.unacked.remove(&tag) {
                message.redelivered = true;
                queue.ready.push_front(message);
            }
        }
        if count > 0 {
            queue.notify.notify_one();
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orderflow::{EventId, Money, OrderId, ProductId, Quantity, StockLine, Timestamp, UserId};
    use std::time::Duration;

    fn event() -> FulfillmentEvent {
        FulfillmentEvent {
            event_id: EventId::generate(),
            order_id: OrderId::generate(),
            user_id: UserId::try_new("user-1").unwrap(),
            total: Money::from_cents(1_000).unwrap(),
            items: vec![StockLine {
                product_id: ProductId::try_new("sku-1").unwrap(),
                quantity: Quantity::try_new(1).unwrap(),
            }],
            occurred_at: Timestamp::now(),
        }
    }

    #[tokio::test]
    async fn every_bound_queue_gets_a_copy() {
        let exchange = FanoutExchange::new("order_fanout");
        let stock = exchange.bind_queue("stock_queue");
        let notifications = exchange.bind_queue("notification_queue");
        let event = event();

        exchange.broadcast(&event).await.unwrap();

        assert_eq!(stock.try_next().unwrap().event, event);
        assert_eq!(notifications.try_next().unwrap().event, event);
        assert_eq!(exchange.published_count(), 1);
    }

    #[tokio::test]
    async fn unacked_deliveries_are_redelivered_after_recover() {
        let exchange = FanoutExchange::new("order_fanout");
        let queue = exchange.bind_queue("stock_queue");
        let event = event();
        exchange.broadcast(&event).await.unwrap();

        let first = queue.try_next().unwrap();
        assert!(!first.redelivered);
        assert!(queue.try_next().is_none());

        assert_eq!(queue.recover(), 1);
        let second = queue.try_next().unwrap();
        assert!(second.redelivered);
        assert_eq!(second.event.event_id, event.event_id);

        queue.ack(second.delivery_tag);
        assert_eq!(queue.recover(), 0);
        assert_eq!(exchange.queue_depth("stock_queue"), Some(0));
    }

    #[tokio::test]
    async fn nack_with_requeue_puts_message_back() {
        let exchange = FanoutExchange::new("order_fanout");
        let queue = exchange.bind_queue("stock_queue");
        exchange.broadcast(&event()).await.unwrap();

        let delivery = queue.try_next().unwrap();
        queue.nack(delivery.delivery_tag, true);
        assert!(queue.try_next().unwrap().redelivered);

        let delivery = queue.try_next();
        assert!(delivery.is_none());
    }

    #[tokio::test]
    async fn next_waits_for_a_broadcast() {
        let exchange = FanoutExchange::new("order_fanout");
        let queue = exchange.bind_queue("stock_queue");
        let event = event();

        let publisher = exchange.clone();
        let sent = event.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            publisher.broadcast(&sent).await.unwrap();
        });

        let delivery = tokio::time::timeout(Duration::from_secs(1), queue.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(delivery.event, event);
    }

    #[tokio::test]
    async fn closed_exchange_rejects_broadcasts_and_ends_streams() {
        let exchange = FanoutExchange::new("order_fanout");
        let queue = exchange.bind_queue("stock_queue");
        exchange.broadcast(&event()).await.unwrap();
        exchange.close();

        assert!(matches!(
            exchange.broadcast(&event()).await,
            Err(PublishError::Closed(_))
        ));
        // queued messages drain before the stream ends
        assert!(queue.next().await.is_some());
        assert!(queue.next().await.is_none());
    }

    #[tokio::test]
    async fn broadcast_without_queues_is_dropped() {
        let exchange = FanoutExchange::new("order_fanout");
        exchange.broadcast(&event()).await.unwrap();
        assert_eq!(exchange.published_count(), 1);
        assert_eq!(exchange.queue_depth("stock_queue"), None);
    }
}
