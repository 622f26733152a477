use std::sync::Arc;

use orderflow::FulfillmentHandler;
use tokio::task::JoinHandle;
use tracing::{error, info, info_span, Instrument};

use crate::exchange::QueueSubscription;

/// Counts reported when a consumer loop ends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumerReport {
    /// Deliveries the handler processed.
    pub handled: u64,
    /// Deliveries the handler failed on (logged and dropped).
    pub failed: u64,
}

/// Feeds every delivery on `subscription` to `handler` until the exchange
/// closes.
///
/// Every delivery is acked after the handler returns. A handler failure is
/// logged and the message dropped; there is no retry or dead-letter queue.
pub async fn run_consumer(
    subscription: QueueSubscription,
    handler: Arc<dyn FulfillmentHandler>,
) -> ConsumerReport {
    let mut report = ConsumerReport::default();
    while let Some(delivery) = subscription.next().await {
        match handler.handle(&delivery.event).await {
            Ok(()) => report.handled += 1,
            Err(failure) => {
                report.failed += 1;
                error!(
                    event_id = %delivery.event.event_id,
                    redelivered = delivery.redelivered,
                    error = %failure,
                    "[consumer.run] handler failed, message dropped"
                );
            }
        }
        subscription.ack(delivery.delivery_tag);
    }
    info!(
        handled = report.handled,
        failed = report.failed,
        "[consumer.run] exchange closed, consumer stopped"
    );
    report
}

/// Spawns [`run_consumer`] on the current runtime.
pub fn spawn_consumer(
    subscription: QueueSubscription,
    handler: Arc<dyn FulfillmentHandler>,
) -> JoinHandle<ConsumerReport> {
    let span = info_span!("consumer", queue = %subscription.queue(), handler = handler.name());
    tokio::spawn(run_consumer(subscription, handler).instrument(span))
}
