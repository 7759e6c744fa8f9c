use crate::error::Result;
use crate::model::{EnvMarker, FamilyDump, UsageMode, UsageSnapshot};
use crate::procd::{ProcdManager, ProcdOptions};
use crate::scope::ProcessScope;
use nix::sys::signal::Signal;
use std::time::Duration;

/// Families kept by procd, reached through the lifecycle manager.
pub struct DelegatedFamily {
    procd: ProcdManager,
}

impl DelegatedFamily {
    pub async fn start(options: ProcdOptions, scope: &ProcessScope) -> Result<Self> {
        Ok(Self {
            procd: ProcdManager::start(options, scope).await?,
        })
    }

    pub fn manager(&self) -> &ProcdManager {
        &self.procd
    }

    pub async fn register_subfamily(
        &mut self,
        root_pid: i32,
        watcher_pid: Option<i32>,
        max_snapshot_interval: Duration,
    ) -> Result<()> {
        self.procd
            .register_subfamily(root_pid, watcher_pid, max_snapshot_interval)
            .await
    }

    pub async fn track_family_via_environment(&mut self, pid: i32, markers: &[EnvMarker]) -> Result<()> {
        self.procd.track_family_via_environment(pid, markers).await
    }

    pub async fn track_family_via_login(&mut self, pid: i32, login: &str) -> Result<()> {
        self.procd.track_family_via_login(pid, login).await
    }

    pub async fn track_family_via_allocated_supplementary_group(&mut self, pid: i32) -> Result<u32> {
        self.procd
            .track_family_via_allocated_supplementary_group(pid)
            .await
    }

    pub async fn track_family_via_cgroup(&mut self, pid: i32, cgroup: &str) -> Result<()> {
        self.procd.track_family_via_cgroup(pid, cgroup).await
    }

    pub async fn get_usage(&mut self, pid: i32, mode: UsageMode) -> Result<UsageSnapshot> {
        self.procd.get_usage(pid, mode).await
    }

    pub async fn signal_process(&mut self, pid: i32, signal: Signal) -> Result<()> {
        self.procd.signal_process(pid, signal).await
    }

    pub async fn suspend_family(&mut self, pid: i32) -> Result<()> {
        self.procd.suspend_family(pid).await
    }

    pub async fn continue_family(&mut self, pid: i32) -> Result<()> {
        self.procd.continue_family(pid).await
    }

    pub async fn kill_family(&mut self, pid: i32) -> Result<()> {
        self.procd.kill_family(pid).await
    }

    pub async fn unregister_family(&mut self, pid: i32) -> Result<()> {
        self.procd.unregister_family(pid).await
    }

    pub async fn snapshot(&mut self) -> Result<()> {
        self.procd.snapshot().await
    }

    pub async fn dump(&mut self, pid: Option<i32>) -> Result<Vec<FamilyDump>> {
        self.procd.dump(pid).await
    }

    pub async fn quit(&mut self) -> Result<()> {
        self.procd.quit().await
    }
}
