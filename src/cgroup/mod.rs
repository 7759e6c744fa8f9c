//! cgroup v1 plumbing: controller layout, capability checks and file helpers.

pub mod entry;
pub mod oom;

pub use entry::{CgroupHierarchyEntry, CgroupLimits, DeviceRule};
pub use oom::OomWatch;

use crate::error::{ProcError, Result};
use nix::sys::statfs::{statfs, CGROUP_SUPER_MAGIC};
use nix::unistd::{access, AccessFlags};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::trace;

pub const DEFAULT_MOUNT_ROOT: &str = "/sys/fs/cgroup";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Controller {
    Memory,
    CpuAcct,
    Freezer,
    Devices,
}

impl Controller {
    pub const ALL: [Controller; 4] = [
        Controller::Memory,
        Controller::CpuAcct,
        Controller::Freezer,
        Controller::Devices,
    ];

    /// Directory name under the mount root.
    pub fn dir_name(self) -> &'static str {
        match self {
            Controller::Memory => "memory",
            Controller::CpuAcct => "cpu,cpuacct",
            Controller::Freezer => "freezer",
            Controller::Devices => "devices",
        }
    }

    /// Failing to place a process here aborts the placement.
    pub fn is_essential(self) -> bool {
        matches!(self, Controller::Memory | Controller::CpuAcct)
    }

    pub fn root(self, mount_root: &Path) -> PathBuf {
        mount_root.join(self.dir_name())
    }
}

/// All four controllers are mounted as cgroup v1 filesystems.
pub fn is_cgroup_v1_mounted(mount_root: &Path) -> bool {
    Controller::ALL.iter().all(|c| {
        let dir = c.root(mount_root);
        let mounted = statfs(&dir).is_ok_and(|s| s.filesystem_type() == CGROUP_SUPER_MAGIC);
        trace!(dir = %dir.display(), mounted, "cgroup v1 controller check");
        mounted
    })
}

/// `relative` can be created (or is writable) under every controller.
///
/// A path that does not exist yet is judged by its nearest existing ancestor,
/// stopping at the controller root.
pub fn is_cgroup_path_writable(mount_root: &Path, relative: &Path) -> bool {
    Controller::ALL.iter().all(|c| {
        let root = c.root(mount_root);
        let mut dir = root.join(relative);
        loop {
            if dir.exists() {
                return access(&dir, AccessFlags::W_OK).is_ok();
            }
            if dir == root || !dir.pop() {
                return false;
            }
        }
    })
}

/// Writes to an existing control file; never creates one.
pub(crate) fn write_control(path: &Path, content: &str) -> Result<()> {
    let mut file = fs::OpenOptions::new()
        .write(true)
        .open(path)
        .map_err(|e| ProcError::cgroup(path, e))?;
    file.write_all(content.as_bytes())
        .map_err(|e| ProcError::cgroup(path, e))
}

pub(crate) fn read_control(path: &Path) -> Result<String> {
    fs::read_to_string(path).map_err(|e| ProcError::cgroup(path, e))
}

/// Pids listed in a `cgroup.procs` file; a missing cgroup is empty.
pub(crate) fn read_pids(procs: &Path) -> Result<Vec<i32>> {
    let content = match fs::read_to_string(procs) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(ProcError::cgroup(procs, e)),
    };
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| {
            line.parse::<i32>().map_err(|_| {
                ProcError::cgroup(
                    procs,
                    io::Error::new(io::ErrorKind::InvalidData, format!("bad pid '{line}'")),
                )
            })
        })
        .collect()
}

/// Removes a cgroup directory and everything beneath it, deepest first.
///
/// On cgroupfs a directory goes away with rmdir even though it lists control
/// files; elsewhere those files have to be removed first.
pub(crate) fn remove_tree(dir: &Path) -> io::Result<()> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    for entry in entries {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            remove_tree(&entry.path())?;
        }
    }

    match fs::remove_dir(dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) if e.raw_os_error() == Some(libc::ENOTEMPTY) => {
            for entry in fs::read_dir(dir)? {
                let entry = entry?;
                if !entry.file_type()?.is_dir() {
                    fs::remove_file(entry.path())?;
                }
            }
            fs::remove_dir(dir)
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Control files a freshly created v1 cgroup would list.
    pub(crate) fn populate(mount_root: &Path, relative: &Path) {
        for c in Controller::ALL {
            let dir = c.root(mount_root).join(relative);
            fs::create_dir_all(&dir).unwrap();
            let files: &[(&str, &str)] = match c {
                Controller::Memory => &[
                    ("cgroup.procs", ""),
                    ("memory.usage_in_bytes", "1048576\n"),
                    ("memory.max_usage_in_bytes", "4194304\n"),
                    ("memory.limit_in_bytes", ""),
                    ("memory.oom_control", "oom_kill_disable 0\n"),
                    ("cgroup.event_control", ""),
                ],
                Controller::CpuAcct => &[
                    ("cgroup.procs", ""),
                    ("cpuacct.stat", "user 250\nsystem 120\n"),
                    ("cpu.shares", ""),
                ],
                Controller::Freezer => &[("cgroup.procs", ""), ("freezer.state", "THAWED\n")],
                Controller::Devices => &[("cgroup.procs", ""), ("devices.deny", "")],
            };
            for (name, content) in files {
                fs::write(dir.join(name), content).unwrap();
            }
        }
    }

    pub(crate) fn fake_mount() -> tempfile::TempDir {
        let root = tempfile::tempdir().unwrap();
        for c in Controller::ALL {
            fs::create_dir_all(c.root(root.path())).unwrap();
        }
        root
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_directories_are_not_cgroupfs() {
        let root = testing::fake_mount();
        assert!(!is_cgroup_v1_mounted(root.path()));
    }

    #[test]
    fn writability_is_judged_by_nearest_ancestor() {
        let root = testing::fake_mount();
        assert!(is_cgroup_path_writable(root.path(), Path::new("procfamily/job_1")));

        fs::remove_dir(Controller::Devices.root(root.path())).unwrap();
        assert!(!is_cgroup_path_writable(root.path(), Path::new("procfamily/job_1")));
    }

    #[test]
    fn remove_tree_clears_files_on_plain_filesystems() {
        let root = testing::fake_mount();
        testing::populate(root.path(), Path::new("base/job_1/nested"));
        let dir = Controller::Memory.root(root.path()).join("base/job_1");
        remove_tree(&dir).unwrap();
        assert!(!dir.exists());
        assert!(Controller::Memory.root(root.path()).join("base").exists());
        remove_tree(&dir).unwrap();
    }

    #[test]
    fn pids_parse_and_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let procs = dir.path().join("cgroup.procs");
        assert_eq!(read_pids(&procs).unwrap(), Vec::<i32>::new());
        fs::write(&procs, "12\n 13 \n\n").unwrap();
        assert_eq!(read_pids(&procs).unwrap(), vec![12, 13]);
        fs::write(&procs, "twelve\n").unwrap();
        assert!(read_pids(&procs).is_err());
    }

    #[test]
    fn control_files_are_never_created() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("memory.limit_in_bytes");
        assert!(matches!(
            write_control(&missing, "1024"),
            Err(ProcError::Cgroup { .. })
        ));
        assert!(!missing.exists());
    }
}
