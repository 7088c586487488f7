//! Channel-based notification delivery.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::types::{Notification, NotifyError};
use crate::metrics;

/// A notification delivery backend.
#[async_trait]
pub trait Notifier: Send + Sync {
    fn name(&self) -> &str;

    async fn send(&self, notification: &Notification) -> Result<(), NotifyError>;
}

/// Handle for emitting notifications.
///
/// Cheaply cloneable. Notifications are delivered by the
/// [`NotificationDispatcher`] so a slow mail command never stalls a worker.
#[derive(Clone)]
pub struct NotificationHandle {
    tx: mpsc::Sender<Notification>,
}

impl NotificationHandle {
    pub fn new(tx: mpsc::Sender<Notification>) -> Self {
        Self { tx }
    }

    /// Queue a notification. Failures are logged, never returned.
    pub async fn emit(&self, notification: Notification) {
        if let Err(e) = self.tx.send(notification).await {
            tracing::error!("Failed to queue notification: {}", e);
        }
    }
}

/// Background task delivering queued notifications.
pub struct NotificationDispatcher {
    rx: mpsc::Receiver<Notification>,
    notifier: Arc<dyn Notifier>,
}

impl NotificationDispatcher {
    pub fn new(rx: mpsc::Receiver<Notification>, notifier: Arc<dyn Notifier>) -> Self {
        Self { rx, notifier }
    }

    /// Deliver notifications until every handle is dropped.
    pub async fn run(mut self) {
        tracing::info!("Notification dispatcher started ({})", self.notifier.name());

        while let Some(notification) = self.rx.recv().await {
            match self.notifier.send(&notification).await {
                Ok(()) => {
                    metrics::NOTIFICATIONS_TOTAL
                        .with_label_values(&["sent"])
                        .inc();
                    tracing::info!("Sent failure notification for {}", notification.rid);
                }
                Err(e) => {
                    metrics::NOTIFICATIONS_TOTAL
                        .with_label_values(&["failed"])
                        .inc();
                    tracing::error!(
                        "Failed to deliver notification for {}: {}",
                        notification.rid,
                        e
                    );
                }
            }
        }

        tracing::info!("Notification dispatcher shutting down");
    }
}

/// Create a notification system.
///
/// Returns the handle (clone it into workers) and the dispatcher (spawn it
/// with `tokio::spawn(dispatcher.run())`).
pub fn create_notification_system(
    notifier: Arc<dyn Notifier>,
    buffer_size: usize,
) -> (NotificationHandle, NotificationDispatcher) {
    let (tx, rx) = mpsc::channel(buffer_size.max(1));
    (
        NotificationHandle::new(tx),
        NotificationDispatcher::new(rx, notifier),
    )
}
