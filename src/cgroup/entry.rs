use super::oom::OomWatch;
use super::{read_control, read_pids, remove_tree, write_control, Controller};
use crate::error::{ProcError, Result};
use crate::model::UsageSnapshot;
use nix::sys::signal::Signal;
use nix::unistd::{chown, Gid, Uid};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// cpuacct.stat counts USER_HZ ticks, which is 100 on every Linux ABI.
const USER_HZ: u64 = 100;
const FREEZE_SETTLE: Duration = Duration::from_millis(10);
const FREEZE_POLLS: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Char,
    Block,
}

/// One `devices.deny` rule, e.g. `c 195:* rwm`. `None` numbers are wildcards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRule {
    pub kind: DeviceKind,
    pub major: Option<u32>,
    pub minor: Option<u32>,
    pub access: String,
}

impl fmt::Display for DeviceRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            DeviceKind::Char => 'c',
            DeviceKind::Block => 'b',
        };
        let number = |n: Option<u32>| n.map_or_else(|| "*".to_string(), |n| n.to_string());
        write!(f, "{kind} {}:{} {}", number(self.major), number(self.minor), self.access)
    }
}

impl FromStr for DeviceRule {
    type Err = ProcError;

    fn from_str(s: &str) -> Result<Self> {
        let bad = || ProcError::Config(format!("bad device rule '{s}'"));
        let mut parts = s.split_whitespace();
        let kind = match parts.next() {
            Some("c") => DeviceKind::Char,
            Some("b") => DeviceKind::Block,
            _ => return Err(bad()),
        };
        let (major, minor) = parts.next().and_then(|n| n.split_once(':')).ok_or_else(bad)?;
        let number = |n: &str| -> Result<Option<u32>> {
            if n == "*" {
                Ok(None)
            } else {
                n.parse().map(Some).map_err(|_| bad())
            }
        };
        let access = parts.next().unwrap_or("rwm").to_string();
        if access.is_empty() || !access.chars().all(|c| matches!(c, 'r' | 'w' | 'm')) {
            return Err(bad());
        }
        Ok(DeviceRule {
            kind,
            major: number(major)?,
            minor: number(minor)?,
            access,
        })
    }
}

/// Settings applied when a cgroup is prepared. All of them are best effort.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CgroupLimits {
    pub memory_limit_bytes: Option<u64>,
    pub cpu_shares: Option<u64>,
    pub hidden_devices: Vec<DeviceRule>,
    /// The job's user, so it may manage its own cgroup.
    pub owner: Option<(u32, u32)>,
}

impl CgroupLimits {
    pub fn from_config(config: &crate::config::CgroupConfig) -> Result<Self> {
        Ok(Self {
            memory_limit_bytes: config.memory_limit_bytes,
            cpu_shares: config.cpu_shares,
            hidden_devices: config
                .hide_devices
                .iter()
                .map(|rule| rule.parse())
                .collect::<Result<_>>()?,
            owner: None,
        })
    }
}

/// One job's cgroup, present under every controller.
#[derive(Debug)]
pub struct CgroupHierarchyEntry {
    relative: PathBuf,
    paths: [(Controller, PathBuf); 4],
    oom: Option<OomWatch>,
}

impl CgroupHierarchyEntry {
    /// Creates `relative` under every controller, replacing a stale one.
    ///
    /// Directory creation failures abort; limits, ownership and the OOM
    /// watch only warn.
    pub fn create(mount_root: &Path, relative: &Path, limits: &CgroupLimits) -> Result<Self> {
        let paths = Controller::ALL.map(|c| (c, c.root(mount_root).join(relative)));

        for (controller, dir) in &paths {
            if dir.exists() {
                debug!(dir = %dir.display(), "Removing stale cgroup");
                remove_tree(dir).map_err(|e| ProcError::cgroup(dir, e))?;
            }
            fs::create_dir_all(dir).map_err(|e| ProcError::cgroup(dir, e))?;
            debug!(?controller, dir = %dir.display(), "Created cgroup");
        }

        let mut entry = Self {
            relative: relative.to_path_buf(),
            paths,
            oom: None,
        };
        entry.apply_limits(limits);
        match OomWatch::register(entry.path(Controller::Memory)) {
            Ok(watch) => entry.oom = Some(watch),
            Err(e) => warn!(cgroup = %relative.display(), "OOM notification unavailable: {}", e),
        }
        info!(cgroup = %relative.display(), "Prepared cgroup");
        Ok(entry)
    }

    pub fn relative_path(&self) -> &Path {
        &self.relative
    }

    pub fn path(&self, controller: Controller) -> &Path {
        self.paths
            .iter()
            .find(|(c, _)| *c == controller)
            .map(|(_, p)| p.as_path())
            .unwrap_or(self.paths[0].1.as_path())
    }

    pub fn procs_file(&self, controller: Controller) -> PathBuf {
        self.path(controller).join("cgroup.procs")
    }

    fn apply_limits(&self, limits: &CgroupLimits) {
        let attempts = [
            limits
                .memory_limit_bytes
                .map(|bytes| (Controller::Memory, "memory.limit_in_bytes", bytes.to_string())),
            limits
                .cpu_shares
                .map(|shares| (Controller::CpuAcct, "cpu.shares", shares.to_string())),
        ];
        for (controller, file, value) in attempts.into_iter().flatten() {
            if let Err(e) = write_control(&self.path(controller).join(file), &value) {
                warn!("Failed to set {} = {}: {}", file, value, e);
            }
        }

        let deny = self.path(Controller::Devices).join("devices.deny");
        for rule in &limits.hidden_devices {
            if let Err(e) = write_control(&deny, &rule.to_string()) {
                warn!(%rule, "Failed to hide device: {}", e);
            }
        }

        if let Some((uid, gid)) = limits.owner {
            for (_, dir) in &self.paths {
                for target in [dir.clone(), dir.join("cgroup.procs")] {
                    if let Err(e) = chown(&target, Some(Uid::from_raw(uid)), Some(Gid::from_raw(gid))) {
                        warn!(path = %target.display(), uid, gid, "Failed to chown cgroup: {}", e);
                    }
                }
            }
        }
    }

    /// Moves `pid` into every controller.
    pub fn attach(&self, pid: i32) -> Result<()> {
        for controller in Controller::ALL {
            let procs = self.procs_file(controller);
            match write_control(&procs, &pid.to_string()) {
                Ok(()) => {}
                Err(e) if controller.is_essential() => return Err(e),
                Err(e) => warn!(pid, ?controller, "Could not place process: {}", e),
            }
        }
        debug!(pid, cgroup = %self.relative.display(), "Attached process to cgroup");
        Ok(())
    }

    pub fn pids(&self) -> Result<Vec<i32>> {
        read_pids(&self.procs_file(Controller::Memory))
    }

    pub fn contains(&self, pid: i32) -> Result<bool> {
        Ok(self.pids()?.contains(&pid))
    }

    pub fn freeze(&self) -> Result<()> {
        self.set_freezer("FROZEN")
    }

    pub fn thaw(&self) -> Result<()> {
        self.set_freezer("THAWED")
    }

    fn set_freezer(&self, state: &str) -> Result<()> {
        let file = self.path(Controller::Freezer).join("freezer.state");
        write_control(&file, state)?;
        debug!(cgroup = %self.relative.display(), state, "Set freezer state");
        Ok(())
    }

    /// Freezing is asynchronous; wait until the kernel reports it done.
    pub fn wait_frozen(&self) -> Result<()> {
        let file = self.path(Controller::Freezer).join("freezer.state");
        for _ in 0..FREEZE_POLLS {
            if read_control(&file)?.trim() == "FROZEN" {
                return Ok(());
            }
            std::thread::sleep(FREEZE_SETTLE);
        }
        warn!(cgroup = %self.relative.display(), "Freezer did not settle");
        Ok(())
    }

    /// Freeze, signal every member, thaw. Nothing can fork in between.
    pub fn signal_all(&self, signal: Signal) -> Result<usize> {
        self.freeze()?;
        let signalled = self.wait_frozen().and_then(|_| self.pids()).map(|pids| {
            for pid in &pids {
                let _ = nix::sys::signal::kill(nix::unistd::Pid::from_raw(*pid), signal);
            }
            pids.len()
        });
        let thawed = self.thaw();
        let count = signalled?;
        thawed?;
        Ok(count)
    }

    pub fn read_usage(&self, registered_at: Instant) -> Result<UsageSnapshot> {
        let stat = read_control(&self.path(Controller::CpuAcct).join("cpuacct.stat"))?;
        let (user_ticks, sys_ticks) = parse_cpuacct_stat(&stat);

        let memory = self.path(Controller::Memory);
        let usage_bytes = read_u64(&memory.join("memory.usage_in_bytes"))?;
        let max_bytes = read_u64(&memory.join("memory.max_usage_in_bytes")).unwrap_or(usage_bytes);

        let user_cpu_time = user_ticks / USER_HZ;
        let sys_cpu_time = sys_ticks / USER_HZ;
        let elapsed = registered_at.elapsed().as_secs_f64();
        let percent_cpu = if elapsed > 0.0 {
            (user_ticks + sys_ticks) as f64 / USER_HZ as f64 / elapsed
        } else {
            0.0
        };

        Ok(UsageSnapshot {
            user_cpu_time,
            sys_cpu_time,
            percent_cpu,
            max_image_size: max_bytes.max(usage_bytes) / 1024,
            total_image_size: usage_bytes / 1024,
            total_resident_set_size: usage_bytes / 1024,
            num_procs: self.pids()?.len() as u32,
            block_io: None,
            instructions: None,
        })
    }

    pub fn oom_watch_mut(&mut self) -> Option<&mut OomWatch> {
        self.oom.as_mut()
    }

    pub fn take_oom_watch(&mut self) -> Option<OomWatch> {
        self.oom.take()
    }

    /// Removes the cgroup from every controller, reporting the first failure.
    pub fn remove(&self) -> Result<()> {
        let mut first_error = None;
        for (_, dir) in &self.paths {
            if let Err(e) = remove_tree(dir) {
                warn!(dir = %dir.display(), "Failed to remove cgroup: {}", e);
                first_error.get_or_insert(ProcError::cgroup(dir, e));
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => {
                info!(cgroup = %self.relative.display(), "Removed cgroup");
                Ok(())
            }
        }
    }
}

fn read_u64(path: &Path) -> Result<u64> {
    let text = read_control(path)?;
    text.trim().parse().map_err(|_| {
        ProcError::cgroup(
            path,
            std::io::Error::new(std::io::ErrorKind::InvalidData, format!("bad value '{}'", text.trim())),
        )
    })
}

/// `user N` / `system N` lines; missing lines count as zero.
fn parse_cpuacct_stat(stat: &str) -> (u64, u64) {
    let mut user = 0;
    let mut system = 0;
    for line in stat.lines() {
        let mut parts = line.split_whitespace();
        let value = |v: Option<&str>| v.and_then(|v| v.parse().ok()).unwrap_or(0);
        match parts.next() {
            Some("user") => user = value(parts.next()),
            Some("system") => system = value(parts.next()),
            _ => {}
        }
    }
    (user, system)
}
