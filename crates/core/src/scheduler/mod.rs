//! Worker scheduling.
//!
//! - **Server mode** ([`Scheduler::run`]): poll the work source, process
//!   claimable items through a pool of `max_concurrent` tasks, sleep the
//!   poll interval when idle. Shutdown stops attempts at their next stage
//!   boundary and releases every held lease.
//! - **Client mode** ([`Scheduler::run_once`]): one cycle on a named RID;
//!   the [`ClientOutcome`] maps to the process exit status.
//!
//! # Example
//!
//! ```ignore
//! let worker = ItemWorker::new(coordinator, executor, publisher, router);
//! let scheduler = Arc::new(Scheduler::new(config.scheduler.clone(), worker));
//! tokio::spawn({ let s = scheduler.clone(); async move { s.run().await } });
//! // ... on SIGTERM:
//! scheduler.shutdown();
//! ```

mod config;
mod gate;
mod runner;
mod types;
mod worker;

pub use config::SchedulerConfig;
pub use gate::LeaseGate;
pub use runner::Scheduler;
pub use types::{ClientOutcome, CycleReport, ItemOutcome, SchedulerError, SchedulerStatus};
pub use worker::ItemWorker;
