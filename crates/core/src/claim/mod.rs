//! Optimistic claiming of work items.
//!
//! There is no lock service. A claim is one conditional write keyed on the
//! observed record version; losing the race yields [`ClaimError::Conflict`],
//! which callers skip. Each held lease is tracked in a per-process
//! [`LeaseRegistry`] so every exit path can release it.
//!
//! # Lease lifecycle
//!
//! ```text
//! claim ──> advance/heartbeat* ──> complete | release
//!   │                │
//!   └─ Conflict      └─ LeaseExpired (record moved; abort without writing)
//! ```

mod coordinator;
mod error;
mod registry;

pub use coordinator::ClaimCoordinator;
pub use error::ClaimError;
pub use registry::LeaseRegistry;
