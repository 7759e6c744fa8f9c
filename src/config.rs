use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::clienv;

/// Which backend the selector should produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendPreference {
    /// Cgroup if configured and usable, else procd if enabled, else direct.
    #[default]
    Auto,
    Direct,
    Procd,
    Cgroup,
}

impl std::str::FromStr for BackendPreference {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "direct" => Ok(Self::Direct),
            "procd" => Ok(Self::Procd),
            "cgroup" => Ok(Self::Cgroup),
            other => anyhow::bail!("unknown backend '{other}' (expected auto, direct, procd or cgroup)"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GidRange {
    pub min: u32,
    pub max: u32,
}

impl GidRange {
    pub fn contains(&self, gid: u32) -> bool {
        (self.min..=self.max).contains(&gid)
    }
}

impl std::str::FromStr for GidRange {
    type Err = anyhow::Error;

    /// `MIN-MAX`, inclusive.
    fn from_str(s: &str) -> Result<Self> {
        let (min, max) = s
            .split_once('-')
            .with_context(|| format!("gid range '{s}' is not MIN-MAX"))?;
        let range = GidRange {
            min: min.trim().parse().with_context(|| format!("bad gid '{min}'"))?,
            max: max.trim().parse().with_context(|| format!("bad gid '{max}'"))?,
        };
        anyhow::ensure!(range.min <= range.max, "gid range '{s}' is empty");
        Ok(range)
    }
}

impl std::fmt::Display for GidRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.min, self.max)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProcdConfig {
    /// Delegate tracking to procd (the "use procd" setting)
    pub enabled: bool,
    /// Socket address base; each spawner appends `.<pid>`
    pub address: PathBuf,
    /// procd executable (defaults to the `procd` next to the running binary)
    pub binary: Option<PathBuf>,
    /// Arguments placed before the ones the manager adds
    pub args: Vec<String>,
    /// procd log file
    pub log: Option<PathBuf>,
    /// Upper bound for family snapshot intervals, in seconds
    pub max_snapshot_interval: u64,
    pub restart_on_error: bool,
    /// Restart attempts per recovery before giving up
    pub max_restart_attempts: u32,
    /// Wait between liveness checks when another process owns procd, in milliseconds
    pub retry_delay_ms: u64,
    /// Abort the process when procd cannot be recovered
    pub abort_on_fatal: bool,
    /// Supplementary group ids procd may hand out for group tracking
    pub gid_range: Option<GidRange>,
}

impl Default for ProcdConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            address: clienv::default_procd_address(),
            binary: None,
            args: Vec::new(),
            log: None,
            max_snapshot_interval: 60,
            restart_on_error: true,
            max_restart_attempts: 5,
            retry_delay_ms: 1000,
            abort_on_fatal: true,
            gid_range: None,
        }
    }
}

impl ProcdConfig {
    pub fn binary_path(&self) -> PathBuf {
        self.binary
            .clone()
            .unwrap_or_else(|| clienv::sibling_binary("procd"))
    }

    pub fn max_snapshot_interval(&self) -> Duration {
        Duration::from_secs(self.max_snapshot_interval.max(1))
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SwitchboardConfig {
    /// Route privileged work through the switchboard helper
    pub enabled: bool,
    pub path: PathBuf,
}

impl Default for SwitchboardConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: clienv::sibling_binary("switchboard"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CgroupConfig {
    /// Base path under each controller; unset disables the cgroup backend
    pub base: Option<PathBuf>,
    /// Where the v1 controllers are mounted
    pub mount_root: PathBuf,
    pub memory_limit_bytes: Option<u64>,
    pub cpu_shares: Option<u64>,
    /// Device rules written to devices.deny, e.g. "c 195:* rwm"
    pub hide_devices: Vec<String>,
}

impl Default for CgroupConfig {
    fn default() -> Self {
        Self {
            base: None,
            mount_root: PathBuf::from(crate::cgroup::DEFAULT_MOUNT_ROOT),
            memory_limit_bytes: None,
            cpu_shares: None,
            hide_devices: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct DirectConfig {
    /// Supplementary group ids the in-process tracker may hand out
    pub gid_range: Option<GidRange>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TrackerConfig {
    pub backend: BackendPreference,
    /// Prefix of the procd handoff environment variables
    pub prefix: String,
    pub procd: ProcdConfig,
    pub switchboard: SwitchboardConfig,
    pub cgroup: CgroupConfig,
    pub direct: DirectConfig,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            backend: BackendPreference::Auto,
            prefix: clienv::DEFAULT_PREFIX.to_string(),
            procd: ProcdConfig::default(),
            switchboard: SwitchboardConfig::default(),
            cgroup: CgroupConfig::default(),
            direct: DirectConfig::default(),
        }
    }
}

impl TrackerConfig {
    /// Loads $PROCFAM_CONFIG (or the default path) and applies env overrides.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from(&clienv::config_path())?;
        config.apply_env()?;
        Ok(config)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        tracing::trace!(path = %path.display(), "Loading tracker config");

        if !path.exists() {
            tracing::trace!("Config file does not exist, using defaults");
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;

        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config from {}", path.display()))?;

        tracing::trace!(backend = ?config.backend, procd = config.procd.enabled, "Tracker config loaded");
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config to TOML")?;

        fs::write(path, content)
            .with_context(|| format!("Failed to write config to {}", path.display()))?;

        tracing::trace!(path = %path.display(), "Tracker config saved");
        Ok(())
    }

    /// Environment beats the file.
    pub fn apply_env(&mut self) -> Result<()> {
        if let Some(backend) = clienv::backend_override() {
            self.backend = backend.parse()?;
        }
        if let Some(enabled) = clienv::use_procd_override() {
            self.procd.enabled = enabled;
        }
        if let Some(binary) = clienv::procd_binary_override() {
            self.procd.binary = Some(binary);
        }
        if let Some(helper) = clienv::switchboard_override() {
            self.switchboard.enabled = true;
            self.switchboard.path = helper;
        }
        if let Some(base) = clienv::cgroup_base_override() {
            self.cgroup.base = Some(base);
        }
        Ok(())
    }
}
