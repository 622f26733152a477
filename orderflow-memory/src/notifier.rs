use std::sync::Arc;

use async_trait::async_trait;
use orderflow::{CollaboratorError, Notification, Notifier};
use parking_lot::Mutex;
use tracing::info;

/// Notifier that keeps every notification in memory.
#[derive(Clone, Default)]
pub struct InMemoryNotifier {
    sent: Arc<Mutex<Vec<Notification>>>,
}

impl InMemoryNotifier {
    /// Creates an empty notifier.
    pub fn new() -> Self {
        Self::default()
    }

    /// Notifications sent so far.
    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl Notifier for InMemoryNotifier {
    async fn send(&self, notification: Notification) -> Result<(), CollaboratorError> {
        info!(
            order_id = %notification.order_id,
            user_id = %notification.user_id,
            subject = %notification.subject,
            "[memory.notifier.send] notification recorded"
        );
        self.sent.lock().push(notification);
        Ok(())
    }
}
