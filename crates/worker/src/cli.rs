//! Command-line interface.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use imaging_core::Config;

#[derive(Debug, Parser)]
#[command(
    name = "imaging-worker",
    version,
    about = "Claims catalog-registered images and runs the processing pipeline on them"
)]
pub struct Cli {
    /// Configuration file.
    #[arg(
        short,
        long,
        env = "IMAGING_CONFIG",
        default_value = "imaging.toml",
        global = true
    )]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, PartialEq, Eq, Subcommand)]
pub enum Command {
    /// Poll the catalog until interrupted.
    Server {
        /// Seconds to sleep when a poll finds no work.
        #[arg(long)]
        poll_interval: Option<u64>,
        /// Catalog host, used to select credentials.
        #[arg(long)]
        server_name: Option<String>,
    },
    /// Run exactly one claim-process-publish cycle on one item.
    Client {
        #[arg(long)]
        rid: String,
    },
    /// Move an item in error back to the queue with its retry count reset.
    Requeue {
        #[arg(long)]
        rid: String,
    },
    /// Load and validate the configuration and the configured tools.
    Check,
}

impl Cli {
    /// Apply command-line overrides on top of the loaded configuration.
    pub fn apply_overrides(&self, config: &mut Config) {
        if let Command::Server {
            poll_interval,
            server_name,
        } = &self.command
        {
            if let Some(secs) = poll_interval {
                config.scheduler.poll_interval_secs = *secs;
            }
            if let Some(name) = server_name {
                config.catalog.server_name = Some(name.clone());
            }
        }
    }
}
