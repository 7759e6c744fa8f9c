//! Privileged helper. Performs one operation per invocation on behalf of an
//! unprivileged caller, acting as the user it names.
//!
//! One-shot operations print failures to stderr and exit 1. `exec` and
//! `dirusage` read their configuration from `<in-fd>` and report through
//! `<err-fd>`.

use std::os::fd::RawFd;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use procfamily::privsep::helper;

#[derive(Parser)]
#[command(name = "switchboard")]
#[command(version)]
#[command(about = "Performs file and exec operations as another user", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Op,
}

#[derive(Subcommand)]
enum Op {
    /// Open a file and pass the descriptor back over stdin
    Open {
        uid: u32,
        gid: u32,
        path: PathBuf,
        /// open(2) flags
        flags: i32,
        /// Creation mode
        mode: u32,
    },
    Mkdir {
        uid: u32,
        gid: u32,
        path: PathBuf,
        mode: u32,
    },
    /// Give a path to another owner
    Chown {
        uid: u32,
        gid: u32,
        path: PathBuf,
        new_uid: u32,
        new_gid: u32,
    },
    Chmod {
        uid: u32,
        gid: u32,
        path: PathBuf,
        mode: u32,
    },
    Rename {
        uid: u32,
        gid: u32,
        from: PathBuf,
        to: PathBuf,
    },
    /// Become a job described on <in-fd>
    Exec { in_fd: RawFd, err_fd: RawFd },
    /// Measure a directory described on <in-fd>
    Dirusage { in_fd: RawFd, err_fd: RawFd },
}

fn main() {
    let args = Args::parse();
    std::process::exit(run(args.command));
}

fn run(op: Op) -> i32 {
    let outcome = match op {
        Op::Open {
            uid,
            gid,
            path,
            flags,
            mode,
        } => helper::open_and_send(uid, gid, &path, flags, mode),
        Op::Mkdir {
            uid,
            gid,
            path,
            mode,
        } => helper::mkdir(uid, gid, &path, mode),
        Op::Chown {
            uid,
            gid,
            path,
            new_uid,
            new_gid,
        } => helper::chown(uid, gid, &path, new_uid, new_gid),
        Op::Chmod {
            uid,
            gid,
            path,
            mode,
        } => helper::chmod(uid, gid, &path, mode),
        Op::Rename { uid, gid, from, to } => helper::rename(uid, gid, &from, &to),
        Op::Exec { in_fd, err_fd } => return with_pipes(in_fd, err_fd, helper::exec_from_pipe),
        Op::Dirusage { in_fd, err_fd } => {
            return with_pipes(in_fd, err_fd, helper::dirusage_from_pipe)
        }
    };
    match outcome {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("{e:#}");
            1
        }
    }
}

fn with_pipes(
    in_fd: RawFd,
    err_fd: RawFd,
    op: fn(std::os::fd::OwnedFd, std::os::fd::OwnedFd) -> i32,
) -> i32 {
    // SAFETY: the caller opened these for us and nothing else in this
    // process touches them.
    let fds = unsafe {
        match helper::adopt_fd(in_fd) {
            Ok(input) => helper::adopt_fd(err_fd).map(|errors| (input, errors)),
            Err(e) => Err(e),
        }
    };
    match fds {
        Ok((input, errors)) => op(input, errors),
        Err(e) => {
            eprintln!("{e:#}");
            1
        }
    }
}
