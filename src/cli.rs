//! CLI argument parsing for the crm-import-worker binary.

use clap::{Parser, Subcommand};

use crate::defaults::DEFAULT_SCHEDULED_BATCH;

#[derive(Parser)]
#[command(name = "crm-import-worker", about = "CRM bulk import worker")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Start the worker server (default if no subcommand given)
    Serve,
    /// Run database migrations and exit
    Migrate,
    /// Resume scheduled imports once and exit (for cron)
    RunScheduled {
        /// Maximum number of jobs to resume
        #[arg(long, default_value_t = DEFAULT_SCHEDULED_BATCH)]
        limit: usize,
    },
}
