use crate::cgroup::entry::{CgroupHierarchyEntry, CgroupLimits};
use crate::cgroup::oom::OomWatch;
use crate::error::{ErrorCode, ProcError, Result};
use crate::model::{UsageMode, UsageSnapshot};
use crate::tracker::{ProcessHost, SystemHost};
use nix::sys::signal::Signal;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

struct CgroupFamily {
    root_start: u64,
    registered_at: Instant,
    entry: Option<CgroupHierarchyEntry>,
}

/// Families confined to cgroup v1 hierarchies.
///
/// Cgroups are prepared before the job is forked and filled by
/// `track_family_via_cgroup`; everything else reads or writes the
/// controller files.
pub struct CgroupV1Family {
    host: Box<dyn ProcessHost>,
    mount_root: PathBuf,
    /// Prefix under every controller for the cgroups we create.
    base: PathBuf,
    limits: CgroupLimits,
    prepared: HashMap<PathBuf, CgroupHierarchyEntry>,
    families: HashMap<i32, CgroupFamily>,
    oom: HashMap<i32, OomWatch>,
    /// Killed families, kept until unregistered so their cgroups get removed.
    killed: HashMap<i32, CgroupFamily>,
}

impl CgroupV1Family {
    pub fn new(mount_root: impl Into<PathBuf>, base: impl Into<PathBuf>, limits: CgroupLimits) -> Self {
        Self::with_host(SystemHost::default(), mount_root, base, limits)
    }

    pub fn with_host(
        host: impl ProcessHost + 'static,
        mount_root: impl Into<PathBuf>,
        base: impl Into<PathBuf>,
        limits: CgroupLimits,
    ) -> Self {
        Self {
            host: Box::new(host),
            mount_root: mount_root.into(),
            base: base.into(),
            limits,
            prepared: HashMap::new(),
            families: HashMap::new(),
            oom: HashMap::new(),
            killed: HashMap::new(),
        }
    }

    fn relative(&self, cgroup: &str) -> Result<PathBuf> {
        let path = Path::new(cgroup);
        let clean = !cgroup.is_empty()
            && path.components().all(|c| matches!(c, Component::Normal(_)));
        if !clean {
            return Err(ProcError::Family(ErrorCode::BadCgroupInfo));
        }
        Ok(self.base.join(path))
    }

    /// Creates the cgroup a job will be placed into, before it is forked.
    /// `limits` overrides the configured ones for this job.
    pub fn prepare_cgroup(&mut self, cgroup: &str, limits: Option<&CgroupLimits>) -> Result<()> {
        let relative = self.relative(cgroup)?;
        let limits = limits.unwrap_or(&self.limits);
        let entry = CgroupHierarchyEntry::create(&self.mount_root, &relative, limits)?;
        self.prepared.insert(relative, entry);
        Ok(())
    }

    fn family(&self, pid: i32) -> Result<&CgroupFamily> {
        self.families
            .get(&pid)
            .ok_or(ProcError::Family(ErrorCode::FamilyNotFound))
    }

    fn entry(&self, pid: i32) -> Result<&CgroupHierarchyEntry> {
        self.family(pid)?
            .entry
            .as_ref()
            .ok_or(ProcError::Family(ErrorCode::BadCgroupInfo))
    }

    pub fn register_subfamily(
        &mut self,
        root_pid: i32,
        _watcher_pid: Option<i32>,
        _max_snapshot_interval: Duration,
    ) -> Result<()> {
        if root_pid <= 0 {
            return Err(ErrorCode::BadRootPid.into());
        }
        if self.families.contains_key(&root_pid) {
            return Err(ErrorCode::AlreadyRegistered.into());
        }
        let root = self.host.process(root_pid).ok_or(ErrorCode::BadRootPid)?;
        if let Some(stale) = self.killed.remove(&root_pid) {
            remove_entry(root_pid, stale.entry);
        }
        self.families.insert(
            root_pid,
            CgroupFamily {
                root_start: root.start_time,
                registered_at: Instant::now(),
                entry: None,
            },
        );
        info!(root_pid, "Registered cgroup family");
        Ok(())
    }

    /// Moves `pid` into the cgroup, creating it first if nobody prepared it.
    pub fn track_family_via_cgroup(&mut self, pid: i32, cgroup: &str) -> Result<()> {
        let relative = self.relative(cgroup)?;
        self.family(pid)?;

        let mut entry = match self.prepared.remove(&relative) {
            Some(entry) => entry,
            None => {
                debug!(cgroup, "Cgroup was not prepared, creating it now");
                CgroupHierarchyEntry::create(&self.mount_root, &relative, &self.limits)?
            }
        };
        if let Err(e) = entry.attach(pid) {
            // Nothing else holds the entry now; remove() logs its own failures.
            let _ = entry.remove();
            return Err(e);
        }
        if let Some(watch) = entry.take_oom_watch() {
            self.oom.insert(pid, watch);
        }
        if let Some(family) = self.families.get_mut(&pid) {
            family.entry = Some(entry);
        }
        info!(pid, cgroup, "Tracking family via cgroup");
        Ok(())
    }

    /// Membership is the cgroup itself.
    pub fn track_family_via_environment(&mut self, pid: i32) -> Result<()> {
        self.family(pid).map(drop)
    }

    pub fn track_family_via_login(&mut self, pid: i32) -> Result<()> {
        self.family(pid).map(drop)
    }

    pub fn track_family_via_allocated_supplementary_group(&mut self, _pid: i32) -> Result<u32> {
        Err(ErrorCode::NoGroupIdAvailable.into())
    }

    /// Cgroup counters are always current, so both modes read them.
    pub fn get_usage(&mut self, pid: i32, _mode: UsageMode) -> Result<UsageSnapshot> {
        let family = self.family(pid)?;
        let registered_at = family.registered_at;
        self.entry(pid)?.read_usage(registered_at)
    }

    pub fn signal_process(&mut self, pid: i32, signal: Signal) -> Result<()> {
        let member = self.families.contains_key(&pid)
            || self
                .families
                .values()
                .filter_map(|f| f.entry.as_ref())
                .any(|entry| entry.contains(pid).unwrap_or(false));
        if !member {
            return Err(ErrorCode::ProcessNotFound.into());
        }
        if let Some(family) = self.families.get(&pid) {
            let current = self.host.process(pid).map(|p| p.start_time);
            if current != Some(family.root_start) {
                return Err(ErrorCode::ProcessNotFound.into());
            }
        }
        self.host.signal(pid, signal).map_err(|errno| {
            debug!(pid, ?signal, %errno, "Signal failed");
            ProcError::Family(ErrorCode::ProcessNotFound)
        })
    }

    pub fn suspend_family(&mut self, pid: i32) -> Result<()> {
        let entry = self.entry(pid)?;
        entry.freeze()?;
        info!(root_pid = pid, "Froze cgroup family");
        Ok(())
    }

    pub fn continue_family(&mut self, pid: i32) -> Result<()> {
        let entry = self.entry(pid)?;
        entry.thaw()?;
        info!(root_pid = pid, "Thawed cgroup family");
        Ok(())
    }

    /// Freeze, SIGKILL everyone in the memory cgroup, thaw. The family then
    /// answers only `unregister_family`.
    pub fn kill_family(&mut self, pid: i32) -> Result<()> {
        let killed = self.entry(pid)?.signal_all(Signal::SIGKILL)?;
        if let Some(family) = self.families.remove(&pid) {
            self.killed.insert(pid, family);
        }
        info!(root_pid = pid, killed, "Killed cgroup family");
        Ok(())
    }

    /// Removes the cgroup directories in every controller.
    pub fn unregister_family(&mut self, pid: i32) -> Result<()> {
        let family = self
            .families
            .remove(&pid)
            .or_else(|| self.killed.remove(&pid))
            .ok_or(ProcError::Family(ErrorCode::FamilyNotFound))?;
        self.oom.remove(&pid);
        if let Some(entry) = family.entry {
            entry.remove()?;
        }
        info!(root_pid = pid, "Unregistered cgroup family");
        Ok(())
    }

    pub fn snapshot(&mut self) -> Result<()> {
        Ok(())
    }

    /// Non-blocking; `false` for families without an OOM watch.
    pub fn has_been_oom_killed(&mut self, pid: i32) -> Result<bool> {
        match self.oom.get_mut(&pid) {
            Some(watch) => watch.fired(),
            None => Ok(false),
        }
    }

    /// Removes every cgroup this backend created.
    pub fn quit(&mut self) -> Result<()> {
        for (_, entry) in self.prepared.drain() {
            if let Err(e) = entry.remove() {
                warn!(cgroup = %entry.relative_path().display(), "Cleanup failed: {}", e);
            }
        }
        let families: Vec<(i32, CgroupFamily)> =
            self.families.drain().chain(self.killed.drain()).collect();
        for (pid, family) in families {
            remove_entry(pid, family.entry);
        }
        self.oom.clear();
        Ok(())
    }
}

fn remove_entry(root_pid: i32, entry: Option<CgroupHierarchyEntry>) {
    if let Some(entry) = entry {
        if let Err(e) = entry.remove() {
            warn!(root_pid, "Cleanup failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cgroup::testing::{fake_mount, populate};
    use crate::cgroup::Controller;
    use crate::tracker::proc_table::fake::FakeHost;
    use std::fs;

    fn backend(mount: &Path, host: &FakeHost) -> CgroupV1Family {
        CgroupV1Family::with_host(host.clone(), mount, "procfamily", CgroupLimits::default())
    }

    fn prepared(mount: &Path, host: &FakeHost, name: &str) -> CgroupV1Family {
        let mut cgroups = backend(mount, host);
        cgroups.prepare_cgroup(name, None).unwrap();
        populate(mount, &Path::new("procfamily").join(name));
        cgroups
    }

    #[test]
    fn tracked_pid_lands_in_every_controller_and_unregister_cleans_up() {
        let mount = fake_mount();
        let host = FakeHost::default();
        host.spawn(4242, 1);
        let mut cgroups = prepared(mount.path(), &host, "job.1");

        cgroups
            .register_subfamily(4242, None, Duration::from_secs(60))
            .unwrap();
        cgroups.track_family_via_cgroup(4242, "job.1").unwrap();

        for controller in Controller::ALL {
            let dir = controller.root(mount.path()).join("procfamily/job.1");
            let procs = fs::read_to_string(dir.join("cgroup.procs")).unwrap();
            assert!(procs.lines().any(|l| l == "4242"), "{controller:?}: {procs}");
        }

        cgroups.unregister_family(4242).unwrap();
        for controller in Controller::ALL {
            assert!(!controller.root(mount.path()).join("procfamily/job.1").exists());
        }
    }

    #[test]
    fn suspend_and_continue_write_the_freezer() {
        let mount = fake_mount();
        let host = FakeHost::default();
        host.spawn(4242, 1);
        let mut cgroups = prepared(mount.path(), &host, "job.2");
        cgroups
            .register_subfamily(4242, None, Duration::from_secs(60))
            .unwrap();
        cgroups.track_family_via_cgroup(4242, "job.2").unwrap();

        let state = Controller::Freezer
            .root(mount.path())
            .join("procfamily/job.2/freezer.state");
        cgroups.suspend_family(4242).unwrap();
        assert_eq!(fs::read_to_string(&state).unwrap().trim(), "FROZEN");
        cgroups.continue_family(4242).unwrap();
        assert_eq!(fs::read_to_string(&state).unwrap().trim(), "THAWED");
    }

    #[test]
    fn usage_comes_from_accounting_files() {
        let mount = fake_mount();
        let host = FakeHost::default();
        host.spawn(4242, 1);
        let mut cgroups = prepared(mount.path(), &host, "job.3");
        cgroups
            .register_subfamily(4242, None, Duration::from_secs(60))
            .unwrap();
        cgroups.track_family_via_cgroup(4242, "job.3").unwrap();

        let cpu = Controller::CpuAcct.root(mount.path()).join("procfamily/job.3");
        fs::write(cpu.join("cpuacct.stat"), "user 500\nsystem 200\n").unwrap();
        let memory = Controller::Memory.root(mount.path()).join("procfamily/job.3");
        fs::write(memory.join("memory.usage_in_bytes"), "2048\n").unwrap();
        fs::remove_file(memory.join("memory.max_usage_in_bytes")).ok();

        let usage = cgroups.get_usage(4242, UsageMode::Live).unwrap();
        assert_eq!(usage.user_cpu_time, 5);
        assert_eq!(usage.sys_cpu_time, 2);
        assert_eq!(usage.total_image_size, 2);
        assert_eq!(usage.max_image_size, 2);
        assert_eq!(usage.num_procs, 1);
    }

    #[test]
    fn unknown_family_and_bad_paths_are_errors() {
        let mount = fake_mount();
        let host = FakeHost::default();
        host.spawn(10, 1);
        let mut cgroups = backend(mount.path(), &host);
        assert!(matches!(
            cgroups.suspend_family(10),
            Err(ProcError::Family(ErrorCode::FamilyNotFound))
        ));
        cgroups
            .register_subfamily(10, None, Duration::from_secs(60))
            .unwrap();
        assert!(matches!(
            cgroups.track_family_via_cgroup(10, "../escape"),
            Err(ProcError::Family(ErrorCode::BadCgroupInfo))
        ));
        assert!(matches!(
            cgroups.track_family_via_allocated_supplementary_group(10),
            Err(ProcError::Family(ErrorCode::NoGroupIdAvailable))
        ));
        assert!(!cgroups.has_been_oom_killed(10).unwrap());
    }

    #[test]
    fn killed_family_only_unregisters() {
        let mount = fake_mount();
        let host = FakeHost::default();
        host.spawn(4242, 1);
        let mut cgroups = prepared(mount.path(), &host, "job.4");
        cgroups
            .register_subfamily(4242, None, Duration::from_secs(60))
            .unwrap();
        cgroups.track_family_via_cgroup(4242, "job.4").unwrap();

        // Empty the cgroup so no real process gets the SIGKILL.
        let memory = Controller::Memory.root(mount.path()).join("procfamily/job.4");
        fs::write(memory.join("cgroup.procs"), "").unwrap();

        cgroups.kill_family(4242).unwrap();
        assert!(matches!(
            cgroups.get_usage(4242, UsageMode::Cached),
            Err(ProcError::Family(ErrorCode::FamilyNotFound))
        ));
        cgroups.unregister_family(4242).unwrap();
        assert!(!memory.exists());
        assert!(matches!(
            cgroups.unregister_family(4242),
            Err(ProcError::Family(ErrorCode::FamilyNotFound))
        ));
    }

    #[test]
    fn failed_placement_removes_the_cgroup() {
        let mount = fake_mount();
        let host = FakeHost::default();
        host.spawn(4242, 1);
        // Created but never populated: no cgroup.procs to write into.
        let mut cgroups = backend(mount.path(), &host);
        cgroups.prepare_cgroup("job.5", None).unwrap();
        cgroups
            .register_subfamily(4242, None, Duration::from_secs(60))
            .unwrap();

        assert!(cgroups.track_family_via_cgroup(4242, "job.5").is_err());
        for controller in Controller::ALL {
            assert!(!controller.root(mount.path()).join("procfamily/job.5").exists());
        }
        cgroups.unregister_family(4242).unwrap();
    }

    #[test]
    fn signalling_a_stranger_is_refused() {
        let mount = fake_mount();
        let host = FakeHost::default();
        host.spawn(4242, 1);
        host.spawn(5000, 1);
        let mut cgroups = prepared(mount.path(), &host, "job.6");
        cgroups
            .register_subfamily(4242, None, Duration::from_secs(60))
            .unwrap();
        cgroups.track_family_via_cgroup(4242, "job.6").unwrap();

        assert!(matches!(
            cgroups.signal_process(5000, Signal::SIGTERM),
            Err(ProcError::Family(ErrorCode::ProcessNotFound))
        ));
    }
}
