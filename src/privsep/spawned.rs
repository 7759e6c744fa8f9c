use crate::error::{ProcError, Result};
use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use std::io::{PipeReader, PipeWriter, Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use tokio::process::{Child, Command};
use tracing::debug;

/// The job's three standard streams as the helper should receive them.
pub(crate) struct HelperStdio {
    pub stdin: Stdio,
    pub stdout: Stdio,
    pub stderr: Stdio,
}

impl Default for HelperStdio {
    fn default() -> Self {
        Self {
            stdin: Stdio::null(),
            stdout: Stdio::null(),
            stderr: Stdio::null(),
        }
    }
}

/// A running switchboard pipe operation: `switchboard <op> <in-fd> <err-fd>`.
///
/// Our ends of both pipes close when this is dropped, whatever path got us there.
pub(crate) struct SpawnedHelper {
    op: &'static str,
    child: Child,
    input: Option<PipeWriter>,
    errors: Option<PipeReader>,
}

impl SpawnedHelper {
    /// `inherit` lists spawner descriptors the helper must see under the same numbers.
    pub(crate) fn launch(
        helper: &Path,
        op: &'static str,
        stdio: HelperStdio,
        inherit: &[RawFd],
    ) -> Result<Self> {
        let (in_reader, in_writer) = std::io::pipe()?;
        let (err_reader, err_writer) = std::io::pipe()?;

        let mut keep: Vec<RawFd> = vec![in_reader.as_raw_fd(), err_writer.as_raw_fd()];
        keep.extend_from_slice(inherit);

        let mut command = Command::new(helper);
        command
            .arg(op)
            .arg(in_reader.as_raw_fd().to_string())
            .arg(err_writer.as_raw_fd().to_string())
            .stdin(stdio.stdin)
            .stdout(stdio.stdout)
            .stderr(stdio.stderr);
        // SAFETY: only fcntl runs between fork and exec.
        unsafe {
            command.pre_exec(move || {
                for fd in &keep {
                    fcntl(*fd, FcntlArg::F_SETFD(FdFlag::empty()))?;
                }
                Ok(())
            });
        }

        let child = command
            .spawn()
            .map_err(|e| ProcError::switchboard(op, format!("cannot run {}: {e}", helper.display())))?;
        // The child holds its own copies now.
        drop(command);
        drop(in_reader);
        drop(err_writer);
        debug!(op, pid = ?child.id(), "Launched switchboard");

        Ok(Self {
            op,
            child,
            input: Some(in_writer),
            errors: Some(err_reader),
        })
    }

    pub(crate) fn pid(&self) -> Option<i32> {
        self.child.id().map(|id| id as i32)
    }

    /// Writes the whole configuration and closes the input pipe.
    pub(crate) async fn send_input(&mut self, bytes: Vec<u8>) -> Result<()> {
        let Some(mut input) = self.input.take() else {
            return Ok(());
        };
        let op = self.op;
        tokio::task::spawn_blocking(move || input.write_all(&bytes))
            .await
            .map_err(|e| ProcError::switchboard(op, format!("writer task failed: {e}")))?
            .map_err(|e| ProcError::switchboard(op, format!("writing config: {e}")))
    }

    /// Everything the helper writes to the error pipe, up to EOF.
    pub(crate) async fn read_errors(&mut self) -> Result<String> {
        let Some(mut errors) = self.errors.take() else {
            return Ok(String::new());
        };
        let op = self.op;
        let bytes = tokio::task::spawn_blocking(move || {
            let mut bytes = Vec::new();
            errors.read_to_end(&mut bytes).map(|_| bytes)
        })
        .await
        .map_err(|e| ProcError::switchboard(op, format!("reader task failed: {e}")))?
        .map_err(|e| ProcError::switchboard(op, format!("reading error pipe: {e}")))?;
        Ok(String::from_utf8_lossy(&bytes).trim().to_string())
    }

    pub(crate) async fn wait(&mut self) -> Result<ExitStatus> {
        self.child
            .wait()
            .await
            .map_err(|e| ProcError::switchboard(self.op, format!("waiting for helper: {e}")))
    }

    pub(crate) fn into_child(self) -> Child {
        self.child
    }
}

/// Judges a finished pipe operation.
///
/// With a capture slot, successful output is the response and lands there.
/// Without one, any text at all means failure.
pub(crate) fn evaluate(
    op: &str,
    status: Option<ExitStatus>,
    text: String,
    capture: Option<&mut String>,
) -> Result<()> {
    let exited_ok = status.is_none_or(|s| s.success());
    if !exited_ok {
        let status = status.map(|s| s.to_string()).unwrap_or_default();
        let detail = if text.is_empty() {
            status
        } else {
            format!("{status}: {text}")
        };
        return Err(ProcError::switchboard(op, detail));
    }
    match capture {
        Some(slot) => {
            *slot = text;
            Ok(())
        }
        None if text.is_empty() => Ok(()),
        None => Err(ProcError::switchboard(op, text)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::process::ExitStatusExt;

    fn exited(code: i32) -> Option<ExitStatus> {
        Some(ExitStatus::from_raw(code << 8))
    }

    #[test]
    fn text_without_capture_is_failure() {
        assert!(evaluate("exec", exited(0), String::new(), None).is_ok());
        assert!(evaluate("exec", None, String::new(), None).is_ok());
        let err = evaluate("exec", None, "setuid failed".into(), None).unwrap_err();
        assert!(err.to_string().contains("setuid failed"));
    }

    #[test]
    fn capture_receives_response() {
        let mut slot = String::new();
        evaluate("dirusage", exited(0), "4096 3".into(), Some(&mut slot)).unwrap();
        assert_eq!(slot, "4096 3");
    }

    #[test]
    fn nonzero_exit_fails_even_with_capture() {
        let mut slot = String::new();
        let err = evaluate("dirusage", exited(1), "permission denied".into(), Some(&mut slot)).unwrap_err();
        assert!(matches!(err, ProcError::Switchboard { .. }));
        assert!(slot.is_empty());
    }
}
