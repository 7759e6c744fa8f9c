use crate::error::Result;
use crate::model::{EnvMarker, FamilyDump, UsageMode, UsageSnapshot};
use crate::tracker::{FamilyTracker, ProcessHost, SystemHost, TrackerOptions};
use nix::sys::signal::Signal;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// Delay before a new family's first periodic snapshot.
const FIRST_SNAPSHOT_DELAY: Duration = Duration::from_secs(2);

/// Tracks families inside this process, refreshed by per-family timers.
pub struct DirectFamily {
    tracker: Arc<Mutex<FamilyTracker>>,
    timers: HashMap<i32, JoinHandle<()>>,
    max_interval: Duration,
}

impl DirectFamily {
    pub fn new(options: TrackerOptions) -> Self {
        Self::with_host(SystemHost::default(), options)
    }

    pub fn with_host(host: impl ProcessHost + 'static, options: TrackerOptions) -> Self {
        Self {
            max_interval: options.max_snapshot_interval,
            tracker: Arc::new(Mutex::new(FamilyTracker::new(host, options))),
            timers: HashMap::new(),
        }
    }

    fn tracker(&self) -> MutexGuard<'_, FamilyTracker> {
        self.tracker.lock().expect("tracker lock poisoned")
    }

    pub fn register_subfamily(
        &mut self,
        root_pid: i32,
        watcher_pid: Option<i32>,
        max_snapshot_interval: Duration,
    ) -> Result<()> {
        self.tracker()
            .register_subfamily(root_pid, watcher_pid, max_snapshot_interval)?;
        let interval = max_snapshot_interval.min(self.max_interval);

        let tracker = Arc::clone(&self.tracker);
        let timer = tokio::spawn(async move {
            tokio::time::sleep(FIRST_SNAPSHOT_DELAY).await;
            let mut ticks = tokio::time::interval(interval);
            loop {
                ticks.tick().await;
                trace!(root_pid, "Direct snapshot");
                tracker.lock().expect("tracker lock poisoned").snapshot();
            }
        });
        if let Some(old) = self.timers.insert(root_pid, timer) {
            old.abort();
        }
        debug!(root_pid, ?interval, "Armed snapshot timer");
        Ok(())
    }

    fn disarm(&mut self, root_pid: i32) {
        if let Some(timer) = self.timers.remove(&root_pid) {
            timer.abort();
        }
    }

    pub fn track_family_via_environment(&mut self, pid: i32, markers: &[EnvMarker]) -> Result<()> {
        Ok(self.tracker().track_via_environment(pid, markers.to_vec())?)
    }

    pub fn track_family_via_login(&mut self, pid: i32, login: &str) -> Result<()> {
        Ok(self.tracker().track_via_login(pid, login)?)
    }

    pub fn track_family_via_allocated_supplementary_group(&mut self, pid: i32) -> Result<u32> {
        Ok(self.tracker().track_via_allocated_group(pid)?)
    }

    pub fn track_family_via_cgroup(&mut self, pid: i32, cgroup: &str) -> Result<()> {
        Ok(self.tracker().track_via_cgroup(pid, cgroup)?)
    }

    pub fn get_usage(&mut self, pid: i32, mode: UsageMode) -> Result<UsageSnapshot> {
        Ok(self.tracker().get_usage(pid, mode)?)
    }

    pub fn signal_process(&mut self, pid: i32, signal: Signal) -> Result<()> {
        Ok(self.tracker().signal_process(pid, signal)?)
    }

    pub fn suspend_family(&mut self, pid: i32) -> Result<()> {
        Ok(self.tracker().suspend_family(pid)?)
    }

    pub fn continue_family(&mut self, pid: i32) -> Result<()> {
        Ok(self.tracker().continue_family(pid)?)
    }

    pub fn kill_family(&mut self, pid: i32) -> Result<()> {
        self.tracker().kill_family(pid)?;
        self.disarm(pid);
        Ok(())
    }

    pub fn unregister_family(&mut self, pid: i32) -> Result<()> {
        self.tracker().unregister_family(pid)?;
        self.disarm(pid);
        Ok(())
    }

    pub fn snapshot(&mut self) -> Result<()> {
        self.tracker().snapshot();
        Ok(())
    }

    pub fn dump(&mut self, pid: Option<i32>) -> Result<Vec<FamilyDump>> {
        Ok(self.tracker().dump(pid)?)
    }

    pub fn quit(&mut self) -> Result<()> {
        for (_, timer) in self.timers.drain() {
            timer.abort();
        }
        Ok(())
    }
}

impl Drop for DirectFamily {
    fn drop(&mut self) {
        for timer in self.timers.values() {
            timer.abort();
        }
    }
}
