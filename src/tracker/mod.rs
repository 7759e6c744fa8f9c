//! Snapshot-based family tracking.
//!
//! A family is a root process plus everything it claims: live descendants of
//! its members, and any process matched by one of its tracking methods. When
//! families overlap, the deepest family in the registration tree owns the
//! process. Members are remembered by `(pid, start_time)`, so a child that is
//! reparented away from the root stays in the family until it exits.
//!
//! Used in-process by the direct backend and behind a socket by procd.

pub mod proc_table;

pub use proc_table::{ProcInfo, ProcTable, ProcessHost, SystemHost};

use crate::config::GidRange;
use crate::error::ErrorCode;
use crate::model::{EnvMarker, FamilyDump, MemberSummary, TrackingMethod, UsageMode, UsageSnapshot};
use nix::errno::Errno;
use nix::sys::signal::Signal;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

pub type FamilyResult<T> = std::result::Result<T, ErrorCode>;

#[derive(Debug, Clone, Copy)]
pub struct TrackerOptions {
    /// Requested snapshot intervals are capped at this.
    pub max_snapshot_interval: Duration,
    pub gid_range: Option<GidRange>,
}

impl Default for TrackerOptions {
    fn default() -> Self {
        Self {
            max_snapshot_interval: Duration::from_secs(60),
            gid_range: None,
        }
    }
}

struct Family {
    root_start: u64,
    watcher_pid: Option<i32>,
    parent: Option<i32>,
    snapshot_interval: Duration,
    tracking: Vec<TrackingMethod>,
    members: HashMap<i32, ProcInfo>,
    exited_user_ticks: u64,
    exited_sys_ticks: u64,
    max_image_kib: u64,
    last_sample: Option<(Instant, u64)>,
    allocated_gid: Option<u32>,
    usage: UsageSnapshot,
}

#[derive(Default, Clone, Copy)]
struct Totals {
    user_ticks: u64,
    sys_ticks: u64,
    image_kib: u64,
    rss_kib: u64,
    procs: u32,
}

impl Totals {
    fn add(&mut self, other: Totals) {
        self.user_ticks += other.user_ticks;
        self.sys_ticks += other.sys_ticks;
        self.image_kib += other.image_kib;
        self.rss_kib += other.rss_kib;
        self.procs += other.procs;
    }

    fn add_process(&mut self, info: &ProcInfo) {
        self.user_ticks += info.user_ticks;
        self.sys_ticks += info.sys_ticks;
        self.image_kib += info.image_kib;
        self.rss_kib += info.rss_kib;
        self.procs += 1;
    }
}

impl Family {
    fn own_totals(&self) -> Totals {
        let mut totals = Totals {
            user_ticks: self.exited_user_ticks,
            sys_ticks: self.exited_sys_ticks,
            ..Totals::default()
        };
        for info in self.members.values() {
            totals.add_process(info);
        }
        totals
    }
}

pub struct FamilyTracker {
    host: Box<dyn ProcessHost>,
    options: TrackerOptions,
    families: HashMap<i32, Family>,
    root_family: Option<i32>,
    killed: HashSet<i32>,
    allocated_gids: BTreeSet<u32>,
    last_snapshot: Option<Instant>,
}

impl FamilyTracker {
    pub fn new(host: impl ProcessHost + 'static, options: TrackerOptions) -> Self {
        Self {
            host: Box::new(host),
            options,
            families: HashMap::new(),
            root_family: None,
            killed: HashSet::new(),
            allocated_gids: BTreeSet::new(),
            last_snapshot: None,
        }
    }

    /// Registers the family that can never be unregistered.
    pub fn register_root_family(&mut self, root_pid: i32) -> FamilyResult<()> {
        self.register_subfamily(root_pid, None, self.options.max_snapshot_interval)?;
        self.root_family = Some(root_pid);
        Ok(())
    }

    pub fn process_alive(&self, pid: i32) -> bool {
        self.host.process(pid).is_some()
    }

    pub fn contains(&self, root_pid: i32) -> bool {
        self.families.contains_key(&root_pid)
    }

    pub fn family_count(&self) -> usize {
        self.families.len()
    }

    /// The shortest interval any family asked for.
    pub fn snapshot_interval(&self) -> Duration {
        self.families
            .values()
            .map(|f| f.snapshot_interval)
            .min()
            .unwrap_or(self.options.max_snapshot_interval)
    }

    pub fn last_snapshot(&self) -> Option<Instant> {
        self.last_snapshot
    }

    pub fn register_subfamily(
        &mut self,
        root_pid: i32,
        watcher_pid: Option<i32>,
        max_snapshot_interval: Duration,
    ) -> FamilyResult<()> {
        if root_pid <= 0 {
            return Err(ErrorCode::BadRootPid);
        }
        if watcher_pid.is_some_and(|w| w <= 0) {
            return Err(ErrorCode::BadWatcherPid);
        }
        if max_snapshot_interval.is_zero() {
            return Err(ErrorCode::BadSnapshotInterval);
        }
        if self.families.contains_key(&root_pid) {
            return Err(ErrorCode::AlreadyRegistered);
        }
        let root = self.host.process(root_pid).ok_or(ErrorCode::BadRootPid)?;
        if let Some(watcher) = watcher_pid {
            self.host.process(watcher).ok_or(ErrorCode::BadWatcherPid)?;
        }

        // Children forked since the last snapshot have no owner yet.
        self.snapshot();
        let parent = self.owner_of(root_pid);
        self.killed.remove(&root_pid);
        self.families.insert(
            root_pid,
            Family {
                root_start: root.start_time,
                watcher_pid,
                parent,
                snapshot_interval: max_snapshot_interval.min(self.options.max_snapshot_interval),
                tracking: Vec::new(),
                members: HashMap::from([(root_pid, root)]),
                exited_user_ticks: 0,
                exited_sys_ticks: 0,
                max_image_kib: 0,
                last_sample: None,
                allocated_gid: None,
                usage: UsageSnapshot::default(),
            },
        );
        info!(root_pid, watcher = ?watcher_pid, parent = ?parent, "Registered family");

        self.snapshot();
        Ok(())
    }

    pub fn track_via_environment(&mut self, pid: i32, markers: Vec<EnvMarker>) -> FamilyResult<()> {
        let family = self.family_mut(pid)?;
        if markers.is_empty() {
            return Err(ErrorCode::BadEnvironmentInfo);
        }
        debug!(pid, markers = markers.len(), "Tracking family via environment");
        family.tracking.push(TrackingMethod::Environment(markers));
        Ok(())
    }

    pub fn track_via_login(&mut self, pid: i32, login: &str) -> FamilyResult<()> {
        self.family_mut(pid)?;
        let uid = self
            .host
            .uid_for_login(login)
            .ok_or(ErrorCode::BadLoginInfo)?;
        debug!(pid, login, uid, "Tracking family via login");
        self.family_mut(pid)?.tracking.push(TrackingMethod::Login {
            login: login.to_string(),
            uid,
        });
        Ok(())
    }

    pub fn track_via_allocated_group(&mut self, pid: i32) -> FamilyResult<u32> {
        if let Some(gid) = self.family_mut(pid)?.allocated_gid {
            return Ok(gid);
        }
        let range = self.options.gid_range.ok_or(ErrorCode::NoGroupIdAvailable)?;
        let gid = (range.min..=range.max)
            .find(|gid| !self.allocated_gids.contains(gid))
            .ok_or(ErrorCode::NoGroupIdAvailable)?;
        self.allocated_gids.insert(gid);

        let family = self.family_mut(pid)?;
        family.allocated_gid = Some(gid);
        family.tracking.push(TrackingMethod::SupplementaryGroup(gid));
        debug!(pid, gid, "Tracking family via supplementary group");
        Ok(gid)
    }

    pub fn track_via_cgroup(&mut self, pid: i32, cgroup: &str) -> FamilyResult<()> {
        let family = self.family_mut(pid)?;
        let cgroup = cgroup.trim().trim_start_matches('/');
        if cgroup.is_empty() {
            return Err(ErrorCode::BadCgroupInfo);
        }
        debug!(pid, cgroup, "Tracking family via cgroup");
        family.tracking.push(TrackingMethod::Cgroup(cgroup.to_string()));
        Ok(())
    }

    /// Only processes inside some family may be signalled.
    pub fn signal_process(&mut self, pid: i32, signal: Signal) -> FamilyResult<()> {
        if !self.families.contains_key(&pid) && self.owner_of(pid).is_none() {
            return Err(ErrorCode::ProcessNotFound);
        }
        self.host.signal(pid, signal).map_err(|errno| {
            debug!(pid, ?signal, %errno, "Signal failed");
            ErrorCode::ProcessNotFound
        })
    }

    pub fn suspend_family(&mut self, pid: i32) -> FamilyResult<()> {
        self.family_mut(pid)?;
        self.signal_tree(pid, Signal::SIGSTOP);
        info!(root_pid = pid, "Suspended family");
        Ok(())
    }

    pub fn continue_family(&mut self, pid: i32) -> FamilyResult<()> {
        self.family_mut(pid)?;
        self.signal_tree(pid, Signal::SIGCONT);
        info!(root_pid = pid, "Continued family");
        Ok(())
    }

    /// Kills the family and its subfamilies. Afterwards the family answers
    /// only `unregister_family`.
    pub fn kill_family(&mut self, pid: i32) -> FamilyResult<()> {
        self.family_mut(pid)?;
        self.snapshot();
        self.signal_tree(pid, Signal::SIGKILL);

        for root in self.family_tree(pid) {
            if let Some(family) = self.families.remove(&root) {
                self.release_gid(&family);
                self.reparent_children(root, family.parent);
                self.killed.insert(root);
            }
        }
        info!(root_pid = pid, "Killed family");
        Ok(())
    }

    pub fn unregister_family(&mut self, pid: i32) -> FamilyResult<()> {
        if self.killed.remove(&pid) {
            debug!(root_pid = pid, "Unregistered killed family");
            return Ok(());
        }
        if self.root_family == Some(pid) {
            return Err(ErrorCode::UnregisterRoot);
        }
        self.family_mut(pid)?;
        self.remove_family(pid);
        info!(root_pid = pid, "Unregistered family");
        Ok(())
    }

    pub fn get_usage(&mut self, pid: i32, mode: UsageMode) -> FamilyResult<UsageSnapshot> {
        let usage = self.family_mut(pid)?.usage;
        match mode {
            UsageMode::Cached => Ok(usage),
            UsageMode::Live => Ok(self.live_usage(pid, usage)),
        }
    }

    /// One family, or every family when `pid` is `None`, ordered by root pid.
    pub fn dump(&mut self, pid: Option<i32>) -> FamilyResult<Vec<FamilyDump>> {
        let roots: Vec<i32> = match pid {
            Some(pid) => {
                self.family_mut(pid)?;
                vec![pid]
            }
            None => {
                let mut roots: Vec<i32> = self.families.keys().copied().collect();
                roots.sort_unstable();
                roots
            }
        };
        let tps = self.host.ticks_per_second();

        Ok(roots
            .into_iter()
            .filter_map(|root| {
                let family = self.families.get(&root)?;
                let mut members: Vec<MemberSummary> = family
                    .members
                    .values()
                    .map(|m| MemberSummary {
                        pid: m.pid,
                        ppid: m.ppid,
                        user_cpu_time: m.user_ticks / tps,
                        sys_cpu_time: m.sys_ticks / tps,
                    })
                    .collect();
                members.sort_by_key(|m| m.pid);
                Some(FamilyDump {
                    root_pid: root,
                    watcher_pid: family.watcher_pid,
                    parent_root_pid: family.parent,
                    members,
                })
            })
            .collect())
    }

    /// Re-reads the process table, reassigns membership and refreshes the
    /// cached usage of every family.
    pub fn snapshot(&mut self) {
        let table = match self.host.table() {
            Ok(table) => table,
            Err(e) => {
                warn!("Snapshot skipped, cannot read process table: {}", e);
                return;
            }
        };
        let now = Instant::now();

        self.drop_unwatched_families(&table);

        let mut children: HashMap<i32, Vec<i32>> = HashMap::new();
        for info in table.values() {
            children.entry(info.ppid).or_default().push(info.pid);
        }

        let mut claims: HashMap<i32, (usize, i32)> = HashMap::new();
        let roots: Vec<i32> = self.families.keys().copied().collect();
        for &root in &roots {
            let depth = self.depth(root);
            for pid in self.claimed_by(root, &table, &children) {
                // A family always owns its own root.
                let depth = if pid == root { usize::MAX } else { depth };
                claims
                    .entry(pid)
                    .and_modify(|claim| {
                        if depth > claim.0 {
                            *claim = (depth, root);
                        }
                    })
                    .or_insert((depth, root));
            }
        }

        let mut owned: HashMap<i32, HashMap<i32, ProcInfo>> = HashMap::new();
        for (pid, (_, root)) in claims {
            if let Some(info) = table.get(&pid) {
                owned.entry(root).or_default().insert(pid, info.clone());
            }
        }

        for (root, family) in self.families.iter_mut() {
            for (pid, old) in family.members.drain() {
                let exited = table.get(&pid).is_none_or(|p| p.start_time != old.start_time);
                if exited {
                    family.exited_user_ticks += old.user_ticks;
                    family.exited_sys_ticks += old.sys_ticks;
                }
            }
            family.members = owned.remove(root).unwrap_or_default();
        }

        self.refresh_usage(now);
        self.last_snapshot = Some(now);
        trace!(families = self.families.len(), processes = table.len(), "Snapshot taken");
    }

    /// Lookup by root pid, distinguishing "a member but not a root".
    fn family_mut(&mut self, pid: i32) -> FamilyResult<&mut Family> {
        if !self.families.contains_key(&pid) {
            return Err(if self.owner_of(pid).is_some() {
                ErrorCode::ProcessNotFamily
            } else {
                ErrorCode::FamilyNotFound
            });
        }
        self.families.get_mut(&pid).ok_or(ErrorCode::FamilyNotFound)
    }

    fn owner_of(&self, pid: i32) -> Option<i32> {
        self.families
            .iter()
            .filter(|(_, f)| f.members.contains_key(&pid))
            .map(|(root, _)| *root)
            .max_by_key(|root| self.depth(*root))
    }

    fn depth(&self, root: i32) -> usize {
        let mut depth = 0;
        let mut current = self.families.get(&root).and_then(|f| f.parent);
        while let Some(parent) = current {
            depth += 1;
            if depth > self.families.len() {
                break;
            }
            current = self.families.get(&parent).and_then(|f| f.parent);
        }
        depth
    }

    /// `root` and every family registered beneath it.
    fn family_tree(&self, root: i32) -> Vec<i32> {
        let mut tree = vec![root];
        let mut i = 0;
        while i < tree.len() {
            let current = tree[i];
            tree.extend(
                self.families
                    .iter()
                    .filter(|(_, f)| f.parent == Some(current))
                    .map(|(r, _)| *r),
            );
            i += 1;
        }
        tree
    }

    fn signal_tree(&self, root: i32, signal: Signal) {
        for family_root in self.family_tree(root) {
            let Some(family) = self.families.get(&family_root) else {
                continue;
            };
            let mut pids: Vec<i32> = family.members.keys().copied().collect();
            pids.sort_unstable();
            for pid in pids {
                match self.host.signal(pid, signal) {
                    Ok(()) | Err(Errno::ESRCH) => {}
                    Err(errno) => warn!(pid, ?signal, %errno, "Failed to signal family member"),
                }
            }
        }
    }

    fn claimed_by(
        &self,
        root: i32,
        table: &ProcTable,
        children: &HashMap<i32, Vec<i32>>,
    ) -> HashSet<i32> {
        let Some(family) = self.families.get(&root) else {
            return HashSet::new();
        };
        let alive = |pid: i32, start: u64| table.get(&pid).is_some_and(|p| p.start_time == start);

        let mut claimed: HashSet<i32> = HashSet::new();
        if alive(root, family.root_start) {
            claimed.insert(root);
        }
        claimed.extend(
            family
                .members
                .values()
                .filter(|m| alive(m.pid, m.start_time))
                .map(|m| m.pid),
        );
        for method in &family.tracking {
            claimed.extend(
                table
                    .values()
                    .filter(|p| self.matches(method, p))
                    .map(|p| p.pid),
            );
        }

        let mut pending: Vec<i32> = claimed.iter().copied().collect();
        while let Some(pid) = pending.pop() {
            for child in children.get(&pid).into_iter().flatten() {
                if claimed.insert(*child) {
                    pending.push(*child);
                }
            }
        }
        claimed
    }

    fn matches(&self, method: &TrackingMethod, process: &ProcInfo) -> bool {
        match method {
            TrackingMethod::Login { uid, .. } => process.uid == *uid,
            TrackingMethod::SupplementaryGroup(gid) => self.host.groups(process.pid).contains(gid),
            TrackingMethod::Environment(markers) => {
                self.host.environment(process.pid).is_some_and(|env| {
                    markers
                        .iter()
                        .all(|m| env.get(&m.name).is_some_and(|v| *v == m.value))
                })
            }
            TrackingMethod::Cgroup(path) => self
                .host
                .cgroups(process.pid)
                .iter()
                .any(|p| p.trim_start_matches('/') == path),
        }
    }

    fn drop_unwatched_families(&mut self, table: &ProcTable) {
        let orphaned: Vec<i32> = self
            .families
            .iter()
            .filter(|(_, f)| f.watcher_pid.is_some_and(|w| !table.contains_key(&w)))
            .map(|(root, _)| *root)
            .filter(|root| self.root_family != Some(*root))
            .collect();
        for root in orphaned {
            info!(root_pid = root, "Watcher exited, unregistering family");
            self.remove_family(root);
        }
    }

    /// Folds the family into its parent so nothing it accounted for is lost.
    fn remove_family(&mut self, root: i32) {
        let Some(family) = self.families.remove(&root) else {
            return;
        };
        self.release_gid(&family);
        self.reparent_children(root, family.parent);
        if let Some(parent) = family.parent.and_then(|p| self.families.get_mut(&p)) {
            parent.exited_user_ticks += family.exited_user_ticks;
            parent.exited_sys_ticks += family.exited_sys_ticks;
            parent.members.extend(family.members);
        }
    }

    fn reparent_children(&mut self, root: i32, new_parent: Option<i32>) {
        for family in self.families.values_mut() {
            if family.parent == Some(root) {
                family.parent = new_parent;
            }
        }
    }

    fn release_gid(&mut self, family: &Family) {
        if let Some(gid) = family.allocated_gid {
            self.allocated_gids.remove(&gid);
        }
    }

    fn refresh_usage(&mut self, now: Instant) {
        let tps = self.host.ticks_per_second();
        let own: HashMap<i32, Totals> = self
            .families
            .iter()
            .map(|(root, f)| (*root, f.own_totals()))
            .collect();
        let roots: Vec<i32> = own.keys().copied().collect();

        for root in roots {
            let mut totals = Totals::default();
            for member_family in self.family_tree(root) {
                if let Some(t) = own.get(&member_family) {
                    totals.add(*t);
                }
            }
            let Some(family) = self.families.get_mut(&root) else {
                continue;
            };
            let cpu_ticks = totals.user_ticks + totals.sys_ticks;
            let percent_cpu = percent_since(family.last_sample, now, cpu_ticks, tps);
            family.last_sample = Some((now, cpu_ticks));
            family.max_image_kib = family.max_image_kib.max(totals.image_kib);
            family.usage = UsageSnapshot {
                user_cpu_time: totals.user_ticks / tps,
                sys_cpu_time: totals.sys_ticks / tps,
                percent_cpu,
                max_image_size: family.max_image_kib,
                total_image_size: totals.image_kib,
                total_resident_set_size: totals.rss_kib,
                num_procs: totals.procs,
                block_io: None,
                instructions: None,
            };
        }
    }

    /// Re-reads every member now, without touching the cached snapshot.
    fn live_usage(&self, root: i32, cached: UsageSnapshot) -> UsageSnapshot {
        let tps = self.host.ticks_per_second();
        let mut totals = Totals::default();
        let mut last_sample = None;

        for member_family in self.family_tree(root) {
            let Some(family) = self.families.get(&member_family) else {
                continue;
            };
            if member_family == root {
                last_sample = family.last_sample;
            }
            totals.user_ticks += family.exited_user_ticks;
            totals.sys_ticks += family.exited_sys_ticks;
            for member in family.members.values() {
                match self.host.process(member.pid) {
                    Some(now) if now.start_time == member.start_time => totals.add_process(&now),
                    // Exited since the snapshot: its last known CPU still counts.
                    _ => {
                        totals.user_ticks += member.user_ticks;
                        totals.sys_ticks += member.sys_ticks;
                    }
                }
            }
        }

        let cpu_ticks = totals.user_ticks + totals.sys_ticks;
        UsageSnapshot {
            user_cpu_time: totals.user_ticks / tps,
            sys_cpu_time: totals.sys_ticks / tps,
            percent_cpu: percent_since(last_sample, Instant::now(), cpu_ticks, tps),
            max_image_size: cached.max_image_size.max(totals.image_kib),
            total_image_size: totals.image_kib,
            total_resident_set_size: totals.rss_kib,
            num_procs: totals.procs,
            block_io: cached.block_io,
            instructions: cached.instructions,
        }
    }
}

fn percent_since(last: Option<(Instant, u64)>, now: Instant, cpu_ticks: u64, tps: u64) -> f64 {
    match last {
        Some((then, ticks)) if now > then => {
            let cpu_secs = cpu_ticks.saturating_sub(ticks) as f64 / tps as f64;
            cpu_secs / now.duration_since(then).as_secs_f64()
        }
        _ => 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::proc_table::fake::FakeHost;
    use super::*;

    const MINUTE: Duration = Duration::from_secs(60);

    fn tracker(host: &FakeHost) -> FamilyTracker {
        FamilyTracker::new(host.clone(), TrackerOptions::default())
    }

    #[test]
    fn suspend_usage_kill_lifecycle() {
        let host = FakeHost::default();
        host.spawn(1000, 1);
        host.spawn(1001, 1000);
        let mut t = tracker(&host);

        t.register_subfamily(1000, None, MINUTE).unwrap();
        t.suspend_family(1000).unwrap();
        assert_eq!(
            host.signals(),
            vec![(1000, Signal::SIGSTOP), (1001, Signal::SIGSTOP)]
        );

        let usage = t.get_usage(1000, UsageMode::Cached).unwrap();
        assert_eq!(usage.num_procs, 2);

        t.kill_family(1000).unwrap();
        assert!(host.signals().contains(&(1001, Signal::SIGKILL)));
        assert_eq!(
            t.get_usage(1000, UsageMode::Cached),
            Err(ErrorCode::FamilyNotFound)
        );
        assert_eq!(t.suspend_family(1000), Err(ErrorCode::FamilyNotFound));
        assert_eq!(t.unregister_family(1000), Ok(()));
        assert_eq!(t.unregister_family(1000), Err(ErrorCode::FamilyNotFound));
    }

    #[test]
    fn child_forked_after_the_last_snapshot_joins_its_own_family() {
        let host = FakeHost::default();
        host.spawn(10, 1);
        let mut t = tracker(&host);
        t.register_root_family(10).unwrap();

        for job in 2000..2040 {
            host.spawn(job, 10);
            host.spawn(job + 100, job);
            t.register_subfamily(job, None, MINUTE).unwrap();

            let usage = t.get_usage(job, UsageMode::Cached).unwrap();
            assert_eq!(usage.num_procs, 2, "job {job}");
            let dump = t.dump(Some(job)).unwrap();
            assert_eq!(dump[0].parent_root_pid, Some(10), "job {job}");
        }
        let root = t.dump(Some(10)).unwrap();
        assert_eq!(root[0].members.len(), 1);
    }

    #[test]
    fn registration_is_validated() {
        let host = FakeHost::default();
        host.spawn(500, 1);
        host.spawn(501, 1);
        let mut t = tracker(&host);

        assert_eq!(t.register_subfamily(0, None, MINUTE), Err(ErrorCode::BadRootPid));
        assert_eq!(t.register_subfamily(-4, None, MINUTE), Err(ErrorCode::BadRootPid));
        assert_eq!(t.register_subfamily(999, None, MINUTE), Err(ErrorCode::BadRootPid));
        assert_eq!(
            t.register_subfamily(500, Some(-5), MINUTE),
            Err(ErrorCode::BadWatcherPid)
        );
        assert_eq!(
            t.register_subfamily(500, Some(777), MINUTE),
            Err(ErrorCode::BadWatcherPid)
        );
        assert_eq!(
            t.register_subfamily(500, None, Duration::ZERO),
            Err(ErrorCode::BadSnapshotInterval)
        );
        t.register_subfamily(500, Some(501), MINUTE).unwrap();
        assert_eq!(
            t.register_subfamily(500, None, MINUTE),
            Err(ErrorCode::AlreadyRegistered)
        );
        assert!(t.get_usage(500, UsageMode::Cached).unwrap().num_procs >= 1);
    }

    #[test]
    fn deepest_family_owns_shared_processes() {
        let host = FakeHost::default();
        host.spawn(1000, 1);
        host.spawn(1001, 1000);
        host.spawn(1002, 1001);
        let mut t = tracker(&host);

        t.register_subfamily(1000, None, MINUTE).unwrap();
        t.register_subfamily(1001, None, MINUTE).unwrap();

        let dump = t.dump(None).unwrap();
        let members = |root: i32| -> Vec<i32> {
            dump.iter()
                .find(|f| f.root_pid == root)
                .unwrap()
                .members
                .iter()
                .map(|m| m.pid)
                .collect()
        };
        assert_eq!(members(1000), vec![1000]);
        assert_eq!(members(1001), vec![1001, 1002]);
        assert_eq!(
            dump.iter().find(|f| f.root_pid == 1001).unwrap().parent_root_pid,
            Some(1000)
        );

        // Parent usage aggregates its subfamilies.
        assert_eq!(t.get_usage(1000, UsageMode::Cached).unwrap().num_procs, 3);
        assert_eq!(t.get_usage(1001, UsageMode::Cached).unwrap().num_procs, 2);
        assert_eq!(
            t.get_usage(1002, UsageMode::Cached),
            Err(ErrorCode::ProcessNotFamily)
        );
        assert_eq!(t.get_usage(4242, UsageMode::Cached), Err(ErrorCode::FamilyNotFound));

        t.unregister_family(1001).unwrap();
        t.snapshot();
        assert_eq!(t.get_usage(1000, UsageMode::Cached).unwrap().num_procs, 3);
    }

    #[test]
    fn reparented_member_stays_until_exit() {
        let host = FakeHost::default();
        host.spawn(1000, 1);
        host.spawn(1001, 1000);
        host.spawn(1002, 1001);
        let mut t = tracker(&host);
        t.register_subfamily(1000, None, MINUTE).unwrap();

        host.exit(1001);
        host.update(1002, |p| p.ppid = 1);
        t.snapshot();
        assert_eq!(t.get_usage(1000, UsageMode::Cached).unwrap().num_procs, 2);

        // Same pid, different process: not ours.
        host.exit(1002);
        host.spawn_with(ProcInfo {
            pid: 1002,
            ppid: 1,
            start_time: 999_999,
            user_ticks: 0,
            sys_ticks: 0,
            image_kib: 1,
            rss_kib: 1,
            uid: 0,
        });
        t.snapshot();
        assert_eq!(t.get_usage(1000, UsageMode::Cached).unwrap().num_procs, 1);
    }

    #[test]
    fn exited_members_keep_their_cpu() {
        let host = FakeHost::default();
        host.spawn(1000, 1);
        host.spawn(1001, 1000);
        let mut t = tracker(&host);
        t.register_subfamily(1000, None, MINUTE).unwrap();

        host.update(1001, |p| {
            p.user_ticks = 300;
            p.sys_ticks = 100;
        });
        t.snapshot();
        host.exit(1001);
        t.snapshot();

        let usage = t.get_usage(1000, UsageMode::Cached).unwrap();
        assert_eq!(usage.user_cpu_time, 3);
        assert_eq!(usage.sys_cpu_time, 1);
        assert_eq!(usage.num_procs, 1);
        assert!(usage.max_image_size >= 200);
    }

    #[test]
    fn environment_markers_claim_escaped_processes() {
        let host = FakeHost::default();
        host.spawn(1000, 1);
        host.spawn(2000, 1);
        host.spawn(3000, 1);
        {
            let mut state = host.state.lock().unwrap();
            state
                .environments
                .insert(2000, HashMap::from([("JOB".to_string(), "7".to_string())]));
            state
                .environments
                .insert(3000, HashMap::from([("JOB".to_string(), "8".to_string())]));
        }
        let mut t = tracker(&host);
        t.register_subfamily(1000, None, MINUTE).unwrap();

        assert_eq!(
            t.track_via_environment(1000, Vec::new()),
            Err(ErrorCode::BadEnvironmentInfo)
        );
        t.track_via_environment(1000, vec![EnvMarker::new("JOB", "7")])
            .unwrap();
        t.snapshot();
        let dump = t.dump(Some(1000)).unwrap();
        let pids: Vec<i32> = dump[0].members.iter().map(|m| m.pid).collect();
        assert_eq!(pids, vec![1000, 2000]);
    }

    #[test]
    fn login_tracking_resolves_the_user() {
        let host = FakeHost::default();
        host.spawn(1000, 1);
        host.state.lock().unwrap().users.insert("alice".into(), 1000);
        let mut t = tracker(&host);
        t.register_subfamily(1000, None, MINUTE).unwrap();

        assert_eq!(t.track_via_login(1000, "nobody-here"), Err(ErrorCode::BadLoginInfo));
        assert_eq!(t.track_via_login(9, "alice"), Err(ErrorCode::FamilyNotFound));
        t.track_via_login(1000, "alice").unwrap();
        assert_eq!(t.track_via_cgroup(1000, "/"), Err(ErrorCode::BadCgroupInfo));
        t.track_via_cgroup(1000, "/htcondor/job_1").unwrap();
    }

    #[test]
    fn group_ids_come_from_the_range_and_are_reused() {
        let host = FakeHost::default();
        host.spawn(1000, 1);
        host.spawn(2000, 1);
        let mut t = FamilyTracker::new(
            host.clone(),
            TrackerOptions {
                gid_range: Some(GidRange { min: 700, max: 700 }),
                ..TrackerOptions::default()
            },
        );
        t.register_subfamily(1000, None, MINUTE).unwrap();
        t.register_subfamily(2000, None, MINUTE).unwrap();

        assert_eq!(t.track_via_allocated_group(1000), Ok(700));
        assert_eq!(t.track_via_allocated_group(1000), Ok(700));
        assert_eq!(
            t.track_via_allocated_group(2000),
            Err(ErrorCode::NoGroupIdAvailable)
        );
        t.unregister_family(1000).unwrap();
        assert_eq!(t.track_via_allocated_group(2000), Ok(700));
    }

    #[test]
    fn watcher_exit_unregisters_the_family() {
        let host = FakeHost::default();
        host.spawn(1000, 1);
        host.spawn(50, 1);
        let mut t = tracker(&host);
        t.register_subfamily(1000, Some(50), MINUTE).unwrap();

        host.exit(50);
        t.snapshot();
        assert!(!t.contains(1000));
    }

    #[test]
    fn root_family_cannot_be_unregistered() {
        let host = FakeHost::default();
        host.spawn(10, 1);
        host.spawn(11, 10);
        let mut t = tracker(&host);
        t.register_root_family(10).unwrap();

        assert_eq!(t.unregister_family(10), Err(ErrorCode::UnregisterRoot));
        assert_eq!(t.unregister_family(11), Err(ErrorCode::ProcessNotFamily));
    }

    #[test]
    fn signals_only_reach_tracked_processes() {
        let host = FakeHost::default();
        host.spawn(1000, 1);
        host.spawn(1001, 1000);
        host.spawn(3000, 1);
        let mut t = tracker(&host);
        t.register_subfamily(1000, None, MINUTE).unwrap();

        t.signal_process(1001, Signal::SIGTERM).unwrap();
        assert_eq!(
            t.signal_process(3000, Signal::SIGTERM),
            Err(ErrorCode::ProcessNotFound)
        );
        assert_eq!(host.signals(), vec![(1001, Signal::SIGTERM)]);
    }

    #[test]
    fn snapshot_interval_is_the_minimum_requested() {
        let host = FakeHost::default();
        host.spawn(1000, 1);
        host.spawn(2000, 1);
        let mut t = tracker(&host);
        assert_eq!(t.snapshot_interval(), MINUTE);
        t.register_subfamily(1000, None, Duration::from_secs(5)).unwrap();
        t.register_subfamily(2000, None, Duration::from_secs(3600)).unwrap();
        assert_eq!(t.snapshot_interval(), Duration::from_secs(5));
    }
}
