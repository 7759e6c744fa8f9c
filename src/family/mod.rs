//! The process-family backends and the one place that picks between them.
//!
//! Every backend answers the same set of calls. A mutating call on a family
//! that does not exist fails with `FamilyNotFound`; only `unregister_family`
//! after a kill (or after `quit` on the delegated backend) succeeds without a
//! family to act on.

pub mod cgroup_v1;
pub mod delegated;
pub mod direct;
pub mod select;

pub use cgroup_v1::CgroupV1Family;
pub use delegated::DelegatedFamily;
pub use direct::DirectFamily;
pub use select::{select_backend, BackendKind, PlatformCaps};

use crate::cgroup::entry::CgroupLimits;
use crate::config::TrackerConfig;
use crate::error::{ProcError, Result};
use crate::model::{EnvMarker, FamilyDump, UsageMode, UsageSnapshot};
use crate::procd::ProcdOptions;
use crate::scope::ProcessScope;
use crate::tracker::TrackerOptions;
use nix::sys::signal::Signal;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

/// Cgroup base used when the configuration names none.
const DEFAULT_CGROUP_BASE: &str = "procfamily";

pub enum ProcFamily {
    Direct(DirectFamily),
    Delegated(DelegatedFamily),
    CgroupV1(CgroupV1Family),
}

impl ProcFamily {
    /// Probes the host, picks a backend and brings it up.
    pub async fn from_config(config: &TrackerConfig, scope: &ProcessScope) -> Result<Self> {
        let caps = PlatformCaps::detect(config);
        let kind = select_backend(config, &caps);
        let family = Self::start(kind, config, scope).await?;
        info!(backend = %kind, "Process family backend ready");
        Ok(family)
    }

    pub async fn start(kind: BackendKind, config: &TrackerConfig, scope: &ProcessScope) -> Result<Self> {
        Ok(match kind {
            BackendKind::Direct => ProcFamily::Direct(DirectFamily::new(TrackerOptions {
                max_snapshot_interval: config.procd.max_snapshot_interval(),
                gid_range: config.direct.gid_range,
            })),
            BackendKind::Delegated => ProcFamily::Delegated(
                DelegatedFamily::start(ProcdOptions::from_config(config), scope).await?,
            ),
            BackendKind::CgroupV1 => {
                let limits = CgroupLimits::from_config(&config.cgroup)?;
                let base = config
                    .cgroup
                    .base
                    .clone()
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_CGROUP_BASE));
                ProcFamily::CgroupV1(CgroupV1Family::new(&config.cgroup.mount_root, base, limits))
            }
        })
    }

    pub fn kind(&self) -> BackendKind {
        match self {
            ProcFamily::Direct(_) => BackendKind::Direct,
            ProcFamily::Delegated(_) => BackendKind::Delegated,
            ProcFamily::CgroupV1(_) => BackendKind::CgroupV1,
        }
    }

    fn unsupported(&self, op: &'static str) -> ProcError {
        ProcError::Unsupported {
            backend: self.kind().name(),
            op,
        }
    }

    /// Creates a job's cgroup before it is forked. Only the cgroup backend
    /// has anything to prepare.
    pub fn prepare_cgroup(&mut self, cgroup: &str, limits: Option<&CgroupLimits>) -> Result<()> {
        match self {
            ProcFamily::CgroupV1(b) => b.prepare_cgroup(cgroup, limits),
            _ => Err(self.unsupported("prepare_cgroup")),
        }
    }

    pub async fn register_subfamily(
        &mut self,
        root_pid: i32,
        watcher_pid: Option<i32>,
        max_snapshot_interval: Duration,
    ) -> Result<()> {
        match self {
            ProcFamily::Direct(b) => b.register_subfamily(root_pid, watcher_pid, max_snapshot_interval),
            ProcFamily::Delegated(b) => {
                b.register_subfamily(root_pid, watcher_pid, max_snapshot_interval)
                    .await
            }
            ProcFamily::CgroupV1(b) => b.register_subfamily(root_pid, watcher_pid, max_snapshot_interval),
        }
    }

    pub async fn track_family_via_environment(&mut self, pid: i32, markers: &[EnvMarker]) -> Result<()> {
        match self {
            ProcFamily::Direct(b) => b.track_family_via_environment(pid, markers),
            ProcFamily::Delegated(b) => b.track_family_via_environment(pid, markers).await,
            ProcFamily::CgroupV1(b) => b.track_family_via_environment(pid),
        }
    }

    pub async fn track_family_via_login(&mut self, pid: i32, login: &str) -> Result<()> {
        match self {
            ProcFamily::Direct(b) => b.track_family_via_login(pid, login),
            ProcFamily::Delegated(b) => b.track_family_via_login(pid, login).await,
            ProcFamily::CgroupV1(b) => b.track_family_via_login(pid),
        }
    }

    /// The gid the job must carry as a supplementary group.
    pub async fn track_family_via_allocated_supplementary_group(&mut self, pid: i32) -> Result<u32> {
        match self {
            ProcFamily::Direct(b) => b.track_family_via_allocated_supplementary_group(pid),
            ProcFamily::Delegated(b) => b.track_family_via_allocated_supplementary_group(pid).await,
            ProcFamily::CgroupV1(b) => b.track_family_via_allocated_supplementary_group(pid),
        }
    }

    pub async fn track_family_via_cgroup(&mut self, pid: i32, cgroup: &str) -> Result<()> {
        match self {
            ProcFamily::Direct(b) => b.track_family_via_cgroup(pid, cgroup),
            ProcFamily::Delegated(b) => b.track_family_via_cgroup(pid, cgroup).await,
            ProcFamily::CgroupV1(b) => b.track_family_via_cgroup(pid, cgroup),
        }
    }

    pub async fn get_usage(&mut self, pid: i32, mode: UsageMode) -> Result<UsageSnapshot> {
        match self {
            ProcFamily::Direct(b) => b.get_usage(pid, mode),
            ProcFamily::Delegated(b) => b.get_usage(pid, mode).await,
            ProcFamily::CgroupV1(b) => b.get_usage(pid, mode),
        }
    }

    pub async fn signal_process(&mut self, pid: i32, signal: Signal) -> Result<()> {
        match self {
            ProcFamily::Direct(b) => b.signal_process(pid, signal),
            ProcFamily::Delegated(b) => b.signal_process(pid, signal).await,
            ProcFamily::CgroupV1(b) => b.signal_process(pid, signal),
        }
    }

    pub async fn suspend_family(&mut self, pid: i32) -> Result<()> {
        match self {
            ProcFamily::Direct(b) => b.suspend_family(pid),
            ProcFamily::Delegated(b) => b.suspend_family(pid).await,
            ProcFamily::CgroupV1(b) => b.suspend_family(pid),
        }
    }

    pub async fn continue_family(&mut self, pid: i32) -> Result<()> {
        match self {
            ProcFamily::Direct(b) => b.continue_family(pid),
            ProcFamily::Delegated(b) => b.continue_family(pid).await,
            ProcFamily::CgroupV1(b) => b.continue_family(pid),
        }
    }

    pub async fn kill_family(&mut self, pid: i32) -> Result<()> {
        match self {
            ProcFamily::Direct(b) => b.kill_family(pid),
            ProcFamily::Delegated(b) => b.kill_family(pid).await,
            ProcFamily::CgroupV1(b) => b.kill_family(pid),
        }
    }

    pub async fn unregister_family(&mut self, pid: i32) -> Result<()> {
        match self {
            ProcFamily::Direct(b) => b.unregister_family(pid),
            ProcFamily::Delegated(b) => b.unregister_family(pid).await,
            ProcFamily::CgroupV1(b) => b.unregister_family(pid),
        }
    }

    pub async fn snapshot(&mut self) -> Result<()> {
        match self {
            ProcFamily::Direct(b) => b.snapshot(),
            ProcFamily::Delegated(b) => b.snapshot().await,
            ProcFamily::CgroupV1(b) => b.snapshot(),
        }
    }

    /// Only the cgroup backend can tell; the others always say no.
    pub async fn has_been_oom_killed(&mut self, pid: i32) -> Result<bool> {
        match self {
            ProcFamily::Direct(_) | ProcFamily::Delegated(_) => Ok(false),
            ProcFamily::CgroupV1(b) => b.has_been_oom_killed(pid),
        }
    }

    pub async fn dump(&mut self, pid: Option<i32>) -> Result<Vec<FamilyDump>> {
        match self {
            ProcFamily::Direct(b) => b.dump(pid),
            ProcFamily::Delegated(b) => b.dump(pid).await,
            ProcFamily::CgroupV1(_) => Err(self.unsupported("dump")),
        }
    }

    pub async fn quit(&mut self) -> Result<()> {
        match self {
            ProcFamily::Direct(b) => b.quit(),
            ProcFamily::Delegated(b) => b.quit().await,
            ProcFamily::CgroupV1(b) => b.quit(),
        }
    }
}
