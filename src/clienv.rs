use std::path::PathBuf;

/// Environment variables read by the tools and the library.
///
/// The procd handoff pair is not listed here because its names carry the
/// configurable prefix, see [`address_base_var`] and [`address_var`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvVar {
    ProcfamConfig,
    ProcfamLog,
    ProcfamBackend,
    ProcfamUseProcd,
    ProcfamProcdBinary,
    ProcfamSwitchboard,
    ProcfamCgroupBase,
}

impl EnvVar {
    pub fn as_str(self) -> &'static str {
        match self {
            EnvVar::ProcfamConfig => "PROCFAM_CONFIG",
            EnvVar::ProcfamLog => "PROCFAM_LOG",
            EnvVar::ProcfamBackend => "PROCFAM_BACKEND",
            EnvVar::ProcfamUseProcd => "PROCFAM_USE_PROCD",
            EnvVar::ProcfamProcdBinary => "PROCFAM_PROCD_BINARY",
            EnvVar::ProcfamSwitchboard => "PROCFAM_SWITCHBOARD",
            EnvVar::ProcfamCgroupBase => "PROCFAM_CGROUP_BASE",
        }
    }
}

pub const DEFAULT_PREFIX: &str = "PROCFAM";
const FALLBACK_CONFIG_DIR: &str = "~/.config";
const SUBDIR: &str = "procfamily";
const CONFIG_FILE: &str = "config.toml";
const PROCD_SOCKET: &str = "procd.sock";

fn env_opt(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// Config file path ($PROCFAM_CONFIG or ~/.config/procfamily/config.toml)
pub fn config_path() -> PathBuf {
    let path = env_opt(EnvVar::ProcfamConfig.as_str())
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            dirs::config_dir()
                .unwrap_or_else(|| PathBuf::from(FALLBACK_CONFIG_DIR))
                .join(SUBDIR)
                .join(CONFIG_FILE)
        });
    tracing::trace!(path = %path.display(), "Resolved config path");
    path
}

/// Directory for sockets ($XDG_RUNTIME_DIR/procfamily, or the temp dir)
pub fn runtime_dir() -> PathBuf {
    let dir = dirs::runtime_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(SUBDIR);
    tracing::trace!(dir = %dir.display(), "Resolved runtime directory");
    dir
}

/// Base address for procd sockets, before the per-spawner pid suffix
pub fn default_procd_address() -> PathBuf {
    runtime_dir().join(PROCD_SOCKET)
}

/// Log filter directive ($PROCFAM_LOG)
pub fn log_filter() -> Option<String> {
    let val = env_opt(EnvVar::ProcfamLog.as_str());
    tracing::trace!(value = ?val, "PROCFAM_LOG env var");
    val
}

/// Backend override ($PROCFAM_BACKEND)
pub fn backend_override() -> Option<String> {
    let val = env_opt(EnvVar::ProcfamBackend.as_str());
    tracing::trace!(value = ?val, "PROCFAM_BACKEND env var");
    val
}

/// Whether to delegate to procd ($PROCFAM_USE_PROCD)
pub fn use_procd_override() -> Option<bool> {
    let val = env_opt(EnvVar::ProcfamUseProcd.as_str()).map(|v| is_truthy(&v));
    tracing::trace!(value = ?val, "PROCFAM_USE_PROCD env var");
    val
}

/// procd binary override ($PROCFAM_PROCD_BINARY)
pub fn procd_binary_override() -> Option<PathBuf> {
    let val = env_opt(EnvVar::ProcfamProcdBinary.as_str()).map(PathBuf::from);
    tracing::trace!(value = ?val, "PROCFAM_PROCD_BINARY env var");
    val
}

/// Switchboard helper override ($PROCFAM_SWITCHBOARD); setting it enables privsep
pub fn switchboard_override() -> Option<PathBuf> {
    let val = env_opt(EnvVar::ProcfamSwitchboard.as_str()).map(PathBuf::from);
    tracing::trace!(value = ?val, "PROCFAM_SWITCHBOARD env var");
    val
}

/// Cgroup base override ($PROCFAM_CGROUP_BASE)
pub fn cgroup_base_override() -> Option<PathBuf> {
    let val = env_opt(EnvVar::ProcfamCgroupBase.as_str()).map(PathBuf::from);
    tracing::trace!(value = ?val, "PROCFAM_CGROUP_BASE env var");
    val
}

/// `<PREFIX>_PROCD_ADDRESS_BASE`, set by whoever spawned the shared procd
pub fn address_base_var(prefix: &str) -> String {
    format!("{prefix}_PROCD_ADDRESS_BASE")
}

/// `<PREFIX>_PROCD_ADDRESS`, the full socket path of the shared procd
pub fn address_var(prefix: &str) -> String {
    format!("{prefix}_PROCD_ADDRESS")
}

/// Base address an ancestor spawned its procd under, if any.
pub fn inherited_procd_address_base(prefix: &str) -> Option<PathBuf> {
    let val = env_opt(&address_base_var(prefix)).map(PathBuf::from);
    tracing::trace!(value = ?val, prefix, "Inherited procd address base");
    val
}

/// Address of a procd exported by an ancestor process, if any.
pub fn inherited_procd_address(prefix: &str) -> Option<PathBuf> {
    let val = env_opt(&address_var(prefix)).map(PathBuf::from);
    tracing::trace!(value = ?val, prefix, "Inherited procd address");
    val
}

/// A binary installed next to the running executable.
pub fn sibling_binary(name: &str) -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(name)))
        .unwrap_or_else(|| PathBuf::from(name))
}
