pub mod api;
pub mod cli;
pub mod metrics;
pub mod runtime;
pub mod state;
