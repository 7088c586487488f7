//! Failure notifications.
//!
//! Workers emit a [`Notification`] through a cloneable
//! [`NotificationHandle`]; a [`NotificationDispatcher`] task delivers them
//! with the configured [`Notifier`].

mod backends;
mod dispatcher;
mod types;

pub use backends::{build_notifier, CommandNotifier, FileNotifier, LogNotifier};
pub use dispatcher::{
    create_notification_system, NotificationDispatcher, NotificationHandle, Notifier,
};
pub use types::{Notification, NotifyBackend, NotifyConfig, NotifyError};
