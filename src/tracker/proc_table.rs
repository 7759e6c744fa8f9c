use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::{Pid, User};
use std::collections::HashMap;
use std::fs;
use tracing::trace;

use crate::error::Result;

/// One row of the OS process table, as far as family tracking cares.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcInfo {
    pub pid: i32,
    pub ppid: i32,
    /// Clock ticks after boot; `(pid, start_time)` identifies a process across pid reuse.
    pub start_time: u64,
    pub user_ticks: u64,
    pub sys_ticks: u64,
    pub image_kib: u64,
    pub rss_kib: u64,
    pub uid: u32,
}

impl ProcInfo {
    pub fn cpu_ticks(&self) -> u64 {
        self.user_ticks + self.sys_ticks
    }
}

pub type ProcTable = HashMap<i32, ProcInfo>;

/// Everything the tracker needs from the operating system.
pub trait ProcessHost: Send {
    fn table(&self) -> Result<ProcTable>;

    fn process(&self, pid: i32) -> Option<ProcInfo>;

    fn environment(&self, pid: i32) -> Option<HashMap<String, String>>;

    fn groups(&self, pid: i32) -> Vec<u32>;

    /// Paths from `/proc/<pid>/cgroup`, one per hierarchy.
    fn cgroups(&self, pid: i32) -> Vec<String>;

    fn uid_for_login(&self, login: &str) -> Option<u32>;

    fn signal(&self, pid: i32, signal: Signal) -> std::result::Result<(), Errno>;

    fn ticks_per_second(&self) -> u64;
}

/// The real process table, read through procfs.
#[derive(Debug, Clone)]
pub struct SystemHost {
    ticks_per_second: u64,
    page_kib: u64,
}

impl Default for SystemHost {
    fn default() -> Self {
        Self {
            ticks_per_second: procfs::ticks_per_second().max(1),
            page_kib: (procfs::page_size() / 1024).max(1),
        }
    }
}

impl SystemHost {
    fn read(&self, process: &procfs::process::Process) -> Option<ProcInfo> {
        let stat = process.stat().ok()?;
        let uid = process.uid().ok()?;
        Some(ProcInfo {
            pid: stat.pid,
            ppid: stat.ppid,
            start_time: stat.starttime,
            user_ticks: stat.utime,
            sys_ticks: stat.stime,
            image_kib: stat.vsize / 1024,
            rss_kib: (stat.rss as u64) * self.page_kib,
            uid,
        })
    }
}

impl ProcessHost for SystemHost {
    fn table(&self) -> Result<ProcTable> {
        let processes = procfs::process::all_processes()
            .map_err(|e| std::io::Error::other(format!("reading /proc: {e}")))?;
        // Processes can exit between listing and reading; those are skipped.
        let table: ProcTable = processes
            .filter_map(|p| p.ok())
            .filter_map(|p| self.read(&p))
            .map(|info| (info.pid, info))
            .collect();
        trace!(processes = table.len(), "Read process table");
        Ok(table)
    }

    fn process(&self, pid: i32) -> Option<ProcInfo> {
        let process = procfs::process::Process::new(pid).ok()?;
        self.read(&process)
    }

    fn environment(&self, pid: i32) -> Option<HashMap<String, String>> {
        let process = procfs::process::Process::new(pid).ok()?;
        let environ = process.environ().ok()?;
        Some(
            environ
                .into_iter()
                .map(|(k, v)| (k.to_string_lossy().into_owned(), v.to_string_lossy().into_owned()))
                .collect(),
        )
    }

    fn groups(&self, pid: i32) -> Vec<u32> {
        procfs::process::Process::new(pid)
            .and_then(|p| p.status())
            .map(|status| status.groups.iter().map(|g| *g as u32).collect())
            .unwrap_or_default()
    }

    fn cgroups(&self, pid: i32) -> Vec<String> {
        fs::read_to_string(format!("/proc/{pid}/cgroup"))
            .map(|content| parse_cgroup_file(&content))
            .unwrap_or_default()
    }

    fn uid_for_login(&self, login: &str) -> Option<u32> {
        User::from_name(login).ok().flatten().map(|u| u.uid.as_raw())
    }

    fn signal(&self, pid: i32, signal: Signal) -> std::result::Result<(), Errno> {
        kill(Pid::from_raw(pid), signal)
    }

    fn ticks_per_second(&self) -> u64 {
        self.ticks_per_second
    }
}

/// `hierarchy-id:controllers:path` lines to their paths.
pub fn parse_cgroup_file(content: &str) -> Vec<String> {
    content
        .lines()
        .filter_map(|line| line.splitn(3, ':').nth(2))
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    pub(crate) struct FakeState {
        pub table: ProcTable,
        pub environments: HashMap<i32, HashMap<String, String>>,
        pub groups: HashMap<i32, Vec<u32>>,
        pub cgroups: HashMap<i32, Vec<String>>,
        pub users: HashMap<String, u32>,
        pub signals: Vec<(i32, Signal)>,
    }

    /// An in-memory process table; clones share state so a test can keep a handle.
    #[derive(Clone, Default)]
    pub(crate) struct FakeHost {
        pub state: Arc<Mutex<FakeState>>,
    }

    impl FakeHost {
        pub fn spawn(&self, pid: i32, ppid: i32) {
            self.spawn_with(ProcInfo {
                pid,
                ppid,
                start_time: 1000 + pid as u64,
                user_ticks: 0,
                sys_ticks: 0,
                image_kib: 100,
                rss_kib: 10,
                uid: 1000,
            });
        }

        pub fn spawn_with(&self, info: ProcInfo) {
            self.state.lock().unwrap().table.insert(info.pid, info);
        }

        pub fn exit(&self, pid: i32) {
            self.state.lock().unwrap().table.remove(&pid);
        }

        pub fn update(&self, pid: i32, f: impl FnOnce(&mut ProcInfo)) {
            if let Some(info) = self.state.lock().unwrap().table.get_mut(&pid) {
                f(info);
            }
        }

        pub fn signals(&self) -> Vec<(i32, Signal)> {
            self.state.lock().unwrap().signals.clone()
        }
    }

    impl ProcessHost for FakeHost {
        fn table(&self) -> Result<ProcTable> {
            Ok(self.state.lock().unwrap().table.clone())
        }

        fn process(&self, pid: i32) -> Option<ProcInfo> {
            self.state.lock().unwrap().table.get(&pid).cloned()
        }

        fn environment(&self, pid: i32) -> Option<HashMap<String, String>> {
            self.state.lock().unwrap().environments.get(&pid).cloned()
        }

        fn groups(&self, pid: i32) -> Vec<u32> {
            self.state.lock().unwrap().groups.get(&pid).cloned().unwrap_or_default()
        }

        fn cgroups(&self, pid: i32) -> Vec<String> {
            self.state.lock().unwrap().cgroups.get(&pid).cloned().unwrap_or_default()
        }

        fn uid_for_login(&self, login: &str) -> Option<u32> {
            self.state.lock().unwrap().users.get(login).copied()
        }

        fn signal(&self, pid: i32, signal: Signal) -> std::result::Result<(), Errno> {
            let mut state = self.state.lock().unwrap();
            if !state.table.contains_key(&pid) {
                return Err(Errno::ESRCH);
            }
            state.signals.push((pid, signal));
            Ok(())
        }

        fn ticks_per_second(&self) -> u64 {
            100
        }
    }
}
