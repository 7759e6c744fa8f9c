use crate::cgroup;
use crate::config::{BackendPreference, TrackerConfig};
use serde::Serialize;
use std::fmt;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Direct,
    Delegated,
    CgroupV1,
}

impl BackendKind {
    pub fn name(self) -> &'static str {
        match self {
            BackendKind::Direct => "direct",
            BackendKind::Delegated => "delegated",
            BackendKind::CgroupV1 => "cgroup-v1",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// What the host offers, detected once at startup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlatformCaps {
    pub cgroup_v1_mounted: bool,
    /// The configured cgroup base can be created under every controller.
    pub cgroup_base_writable: bool,
}

impl PlatformCaps {
    pub fn detect(config: &TrackerConfig) -> Self {
        let mount_root = &config.cgroup.mount_root;
        let cgroup_v1_mounted = cgroup::is_cgroup_v1_mounted(mount_root);
        let cgroup_base_writable = cgroup_v1_mounted
            && config
                .cgroup
                .base
                .as_deref()
                .is_some_and(|base| cgroup::is_cgroup_path_writable(mount_root, base));
        let caps = Self {
            cgroup_v1_mounted,
            cgroup_base_writable,
        };
        debug!(?caps, "Probed platform capabilities");
        caps
    }
}

/// Picks the backend. An explicit preference always wins; `auto` prefers
/// a usable cgroup setup, then procd, then in-process tracking.
pub fn select_backend(config: &TrackerConfig, caps: &PlatformCaps) -> BackendKind {
    match config.backend {
        BackendPreference::Direct => BackendKind::Direct,
        BackendPreference::Procd => BackendKind::Delegated,
        BackendPreference::Cgroup => BackendKind::CgroupV1,
        BackendPreference::Auto => {
            if config.cgroup.base.is_some() && caps.cgroup_v1_mounted && caps.cgroup_base_writable {
                BackendKind::CgroupV1
            } else if config.procd.enabled {
                BackendKind::Delegated
            } else {
                BackendKind::Direct
            }
        }
    }
}
