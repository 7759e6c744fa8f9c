//! Privilege separation through the `switchboard` helper.
//!
//! One-shot operations pass everything on the command line and report
//! failure through stderr and the exit status. `open` additionally gets a
//! socket as its stdin and sends the opened descriptor back over it. Pipe
//! operations (`exec`, `dirusage`) read their configuration from one pipe
//! and write errors or a response to another.

pub mod fd_passing;
pub mod helper;
pub mod request;
mod spawned;

pub use request::{DirUsageConfig, ExecConfig, ExecRequest, StdStream, SwitchboardInput};

use crate::error::{ProcError, Result};
use nix::fcntl::OFlag;
use nix::sys::stat::Mode;
use spawned::{evaluate, HelperStdio, SpawnedHelper};
use std::ffi::OsString;
use std::os::fd::OwnedFd;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::{Child, Command};
use tracing::{debug, info};

/// Recursive size of a directory as seen by the helper.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirUsage {
    pub bytes: u64,
    pub files: u64,
}

#[derive(Debug, Clone)]
pub struct SwitchboardClient {
    helper: PathBuf,
}

impl SwitchboardClient {
    pub fn new(helper: impl Into<PathBuf>) -> Self {
        Self {
            helper: helper.into(),
        }
    }

    pub fn helper(&self) -> &Path {
        &self.helper
    }

    /// Opens `path` as `uid`/`gid` and returns the descriptor.
    pub async fn open(
        &self,
        uid: u32,
        gid: u32,
        path: &Path,
        flags: OFlag,
        mode: Mode,
    ) -> Result<OwnedFd> {
        let (ours, theirs) = UnixStream::pair()?;

        let mut command = Command::new(&self.helper);
        command
            .arg("open")
            .arg(uid.to_string())
            .arg(gid.to_string())
            .arg(path)
            .arg(flags.bits().to_string())
            .arg(mode.bits().to_string())
            .stdin(Stdio::from(OwnedFd::from(theirs)))
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        let child = command
            .spawn()
            .map_err(|e| ProcError::switchboard("open", format!("cannot run {}: {e}", self.helper.display())))?;
        drop(command);

        let received = tokio::task::spawn_blocking(move || fd_passing::recv_fd(&ours))
            .await
            .map_err(|e| ProcError::switchboard("open", format!("receiver task failed: {e}")))?;
        let output = child.wait_with_output().await?;
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();

        match received {
            Ok(fd) if output.status.success() => {
                debug!(path = %path.display(), uid, "Opened file through switchboard");
                Ok(fd)
            }
            Ok(_) => Err(ProcError::switchboard(
                "open",
                format!("{}: {stderr}", output.status),
            )),
            Err(ProcError::Protocol(reason)) if !stderr.is_empty() => {
                Err(ProcError::Protocol(format!("{reason}; switchboard: {stderr}")))
            }
            Err(e) => Err(e),
        }
    }

    pub async fn mkdir(&self, uid: u32, gid: u32, path: &Path, mode: Mode) -> Result<()> {
        self.one_shot(
            "mkdir",
            vec![
                uid.to_string().into(),
                gid.to_string().into(),
                path.into(),
                mode.bits().to_string().into(),
            ],
        )
        .await
    }

    /// Hands `path` to `new_uid`/`new_gid`, acting as `uid`/`gid`.
    pub async fn chown(
        &self,
        uid: u32,
        gid: u32,
        path: &Path,
        new_uid: u32,
        new_gid: u32,
    ) -> Result<()> {
        self.one_shot(
            "chown",
            vec![
                uid.to_string().into(),
                gid.to_string().into(),
                path.into(),
                new_uid.to_string().into(),
                new_gid.to_string().into(),
            ],
        )
        .await
    }

    pub async fn chmod(&self, uid: u32, gid: u32, path: &Path, mode: Mode) -> Result<()> {
        self.one_shot(
            "chmod",
            vec![
                uid.to_string().into(),
                gid.to_string().into(),
                path.into(),
                mode.bits().to_string().into(),
            ],
        )
        .await
    }

    pub async fn rename(&self, uid: u32, gid: u32, from: &Path, to: &Path) -> Result<()> {
        self.one_shot(
            "rename",
            vec![
                uid.to_string().into(),
                gid.to_string().into(),
                from.into(),
                to.into(),
            ],
        )
        .await
    }

    async fn one_shot(&self, op: &'static str, args: Vec<OsString>) -> Result<()> {
        let output = Command::new(&self.helper)
            .arg(op)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| ProcError::switchboard(op, format!("cannot run {}: {e}", self.helper.display())))?;
        let text = String::from_utf8_lossy(&output.stderr).trim().to_string();
        evaluate(op, Some(output.status), text, None)
    }

    /// Starts a job as `request.uid`. The returned child *is* the job: the
    /// helper has already exec'd into it.
    pub async fn spawn(&self, request: ExecRequest) -> Result<Child> {
        let config = request.encode()?;
        let ExecRequest {
            stdin,
            stdout,
            stderr,
            keep_open_fds,
            path,
            ..
        } = request;

        let stdio = HelperStdio {
            stdin: helper_stdio(stdin),
            stdout: helper_stdio(stdout),
            stderr: helper_stdio(stderr),
        };
        let mut helper = SpawnedHelper::launch(&self.helper, "exec", stdio, &keep_open_fds)?;
        helper.send_input(config).await?;

        // EOF arrives when the exec succeeds (close-on-exec) or the helper exits.
        let text = helper.read_errors().await?;
        if !text.is_empty() {
            let detail = match helper.wait().await {
                Ok(status) if !status.success() => format!("{status}: {text}"),
                _ => text,
            };
            return Err(ProcError::switchboard("exec", detail));
        }
        info!(path = %path.display(), pid = ?helper.pid(), "Started job through switchboard");
        Ok(helper.into_child())
    }

    /// Total size and file count under `path`, measured as `uid`.
    pub async fn directory_usage(&self, uid: u32, path: &Path) -> Result<DirUsage> {
        let config = DirUsageConfig::encode(uid, path)?;
        let mut helper =
            SpawnedHelper::launch(&self.helper, "dirusage", HelperStdio::default(), &[])?;
        helper.send_input(config).await?;
        let text = helper.read_errors().await?;
        let status = helper.wait().await?;

        let mut response = String::new();
        evaluate("dirusage", Some(status), text, Some(&mut response))?;
        parse_dir_usage(&response)
    }
}

fn helper_stdio(stream: StdStream) -> Stdio {
    match stream {
        StdStream::Inherit => Stdio::inherit(),
        StdStream::Fd(fd) => Stdio::from(fd),
        // The helper opens these itself, as the job's user.
        StdStream::Null | StdStream::Path(_) => Stdio::null(),
    }
}

fn parse_dir_usage(response: &str) -> Result<DirUsage> {
    let mut parts = response.split_whitespace();
    let mut next = || -> Option<u64> { parts.next()?.parse().ok() };
    match (next(), next()) {
        (Some(bytes), Some(files)) => Ok(DirUsage { bytes, files }),
        _ => Err(ProcError::Protocol(format!(
            "bad dirusage response '{response}'"
        ))),
    }
}
