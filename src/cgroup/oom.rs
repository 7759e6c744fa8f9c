use super::write_control;
use crate::error::{ProcError, Result};
use nix::errno::Errno;
use nix::sys::eventfd::{EfdFlags, EventFd};
use std::fs::File;
use std::os::fd::{AsFd, AsRawFd};
use std::path::Path;
use tracing::debug;

/// Memory-cgroup OOM notification through an eventfd.
///
/// Once an OOM kill has been seen the watch stays fired; reading the eventfd
/// resets the kernel counter, so the first positive read is latched.
#[derive(Debug)]
pub struct OomWatch {
    eventfd: EventFd,
    fired: bool,
}

impl OomWatch {
    /// Arms notification for the memory cgroup at `memory_dir`.
    pub fn register(memory_dir: &Path) -> Result<Self> {
        let eventfd = EventFd::from_value_and_flags(0, EfdFlags::EFD_NONBLOCK | EfdFlags::EFD_CLOEXEC)?;
        let control_path = memory_dir.join("memory.oom_control");
        let oom_control = File::open(&control_path).map_err(|e| ProcError::cgroup(&control_path, e))?;

        let registration = format!(
            "{} {}",
            eventfd.as_fd().as_raw_fd(),
            oom_control.as_raw_fd()
        );
        write_control(&memory_dir.join("cgroup.event_control"), &registration)?;
        debug!(cgroup = %memory_dir.display(), "Armed OOM notification");

        Ok(Self {
            eventfd,
            fired: false,
        })
    }

    /// Non-blocking: `true` once at least one OOM kill happened.
    pub fn fired(&mut self) -> Result<bool> {
        if self.fired {
            return Ok(true);
        }
        match self.eventfd.read() {
            Ok(count) => self.fired = count > 0,
            Err(Errno::EAGAIN) => {}
            Err(e) => return Err(e.into()),
        }
        Ok(self.fired)
    }
}
