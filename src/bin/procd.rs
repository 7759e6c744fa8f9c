//! The process-family tracking daemon.
//!
//! Started by a spawner's `ProcdManager`. Anything written to stderr before
//! it is closed is reported to the spawner as the startup failure.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use procfamily::config::GidRange;
use procfamily::procd::{ProcdServer, ServerConfig};
use procfamily::tracker::{FamilyTracker, SystemHost, TrackerOptions};

#[derive(Parser)]
#[command(name = "procd")]
#[command(version)]
#[command(about = "Tracks process families on behalf of a spawner", long_about = None)]
struct Args {
    /// Unix socket to listen on
    #[arg(long)]
    address: PathBuf,

    /// Register this pid as the root family
    #[arg(long)]
    root_pid: Option<i32>,

    /// Upper bound for snapshot intervals, in seconds
    #[arg(long, default_value = "60")]
    max_snapshot_interval: u64,

    /// Supplementary gids available for group tracking, as MIN-MAX
    #[arg(long)]
    gid_range: Option<GidRange>,

    /// Append logs to this file
    #[arg(long)]
    log: Option<PathBuf>,

    /// Close stderr once the socket is listening
    #[arg(long)]
    close_stderr_when_ready: bool,
}

fn main() {
    let args = Args::parse();
    if let Err(e) = run(args) {
        eprintln!("procd: {e:#}");
        std::process::exit(1);
    }
}

fn run(args: Args) -> anyhow::Result<()> {
    // Nothing may reach stderr before the handshake unless it is an error.
    match &args.log {
        Some(path) => procfamily::logging::init(Some(path))?,
        None if !args.close_stderr_when_ready => procfamily::logging::init(None)?,
        None => {}
    }

    let tracker = FamilyTracker::new(
        SystemHost::default(),
        TrackerOptions {
            max_snapshot_interval: Duration::from_secs(args.max_snapshot_interval.max(1)),
            gid_range: args.gid_range,
        },
    );
    let server = ProcdServer::new(
        ServerConfig {
            address: args.address,
            root_pid: args.root_pid,
            close_stderr_when_ready: args.close_stderr_when_ready,
        },
        tracker,
    );

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(server.run())
}
