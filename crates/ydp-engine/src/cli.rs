//! Command-line surface of the `ydp` binary

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Yellow Data Platform pipeline engine
#[derive(Parser, Debug)]
#[command(name = "ydp")]
#[command(author, version, about, long_about = None)]
#[command(arg_required_else_help = true)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Ecosystem model (overrides YDP_MODEL_PATH)
    #[arg(short, long, global = true)]
    pub model: Option<PathBuf>,

    /// Verbose console logging
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run every enabled cron loop until Ctrl+C or SIGTERM
    Run,

    /// Lint the model and check every routing binding
    Validate,

    /// Print each dataset group's platform, view and tables
    Routes,

    /// Capture one datastore now and merge it into every platform
    Fire {
        /// Datastore name
        datastore: String,
    },

    /// Run one replication cycle for a consumer replica group
    Replicate {
        /// Replica group name
        group: String,
    },

    /// Run a workspace's transformer once
    Transform {
        /// Workspace name
        workspace: String,
    },

    /// Show stream state and recent batches
    Status {
        /// Only this data platform
        #[arg(short, long)]
        platform: Option<String>,

        /// Only batches with this status (RUNNING, COMMITTED, FAILED)
        #[arg(short, long)]
        status: Option<String>,

        /// Number of batches to show
        #[arg(short, long, default_value = "20")]
        limit: i64,
    },
}
