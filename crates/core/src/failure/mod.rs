//! Failure classification, retry policy and notifications.
//!
//! Every failed attempt is routed to one [`Disposition`]:
//!
//! | Failure                         | Disposition                          |
//! |---------------------------------|--------------------------------------|
//! | transient, budget left          | `Unclaimed`, retry + 1, backoff      |
//! | transient, budget exhausted     | `Error`, notify                      |
//! | permanent                       | `Error`, retry count unchanged, notify |
//! | shutdown at a stage boundary    | `Unclaimed`, retry count unchanged   |
//! | lease lost                      | no write                             |

mod config;
pub mod notify;
mod router;
mod types;

pub use config::RetryConfig;
pub use notify::{
    build_notifier, create_notification_system, Notification, NotificationDispatcher,
    NotificationHandle, Notifier, NotifyBackend, NotifyConfig, NotifyError,
};
pub use router::FailureRouter;
pub use types::{AttemptFailure, Disposition, ErrorClass};
