use std::path::PathBuf;

use clap::{Parser, Subcommand};
use procfamily::completions::CompletionShell;

#[derive(Parser)]
#[command(name = "procctl")]
#[command(version)]
#[command(about = "Inspect and control process families tracked by procd", long_about = None)]
pub(crate) struct Cli {
    /// procd socket (defaults to the one exported in <PREFIX>_PROCD_ADDRESS)
    #[arg(long, global = true)]
    pub address: Option<PathBuf>,

    /// Prefix of the procd handoff environment variables
    #[arg(long, global = true, default_value = procfamily::clienv::DEFAULT_PREFIX)]
    pub prefix: String,

    /// Print results as JSON
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Register a process as the root of a new family
    Register {
        root_pid: i32,

        /// Process to notify when the family dies
        #[arg(long)]
        watcher: Option<i32>,

        /// Snapshot interval in seconds
        #[arg(long, default_value = "60")]
        interval: u64,
    },

    /// Show the resource usage of a family
    Usage {
        pid: i32,

        /// Query every member now instead of using the last snapshot
        #[arg(long)]
        live: bool,
    },

    /// Send a signal to one member of a family
    Signal {
        pid: i32,

        /// Signal name (TERM, SIGHUP) or number
        signal: String,
    },

    /// Stop every process of a family
    Suspend { pid: i32 },

    /// Resume a suspended family
    Continue { pid: i32 },

    /// Kill every process of a family
    Kill { pid: i32 },

    /// Stop tracking a family
    Unregister { pid: i32 },

    /// Rescan the process table now
    Snapshot,

    /// List tracked families and their members
    Dump {
        /// Only this family (all families if omitted)
        pid: Option<i32>,
    },

    /// Ask procd to exit
    Quit,

    /// Show which backend this host would use
    Backend,

    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: CompletionShell,
    },
}
