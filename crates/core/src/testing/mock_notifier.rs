//! Mock notifier for testing.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::failure::{Notification, Notifier, NotifyError};

/// Records delivered notifications.
#[derive(Debug, Default)]
pub struct MockNotifier {
    sent: Arc<RwLock<Vec<Notification>>>,
    fail_next: Arc<RwLock<bool>>,
}

impl MockNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Notifications delivered successfully.
    pub async fn sent(&self) -> Vec<Notification> {
        self.sent.read().await.clone()
    }

    /// Make the next delivery fail.
    pub async fn fail_next(&self) {
        *self.fail_next.write().await = true;
    }
}

#[async_trait]
impl Notifier for MockNotifier {
    fn name(&self) -> &str {
        "mock"
    }

    async fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
        if std::mem::take(&mut *self.fail_next.write().await) {
            return Err(NotifyError::Command("mock delivery failure".to_string()));
        }
        self.sent.write().await.push(notification.clone());
        Ok(())
    }
}
