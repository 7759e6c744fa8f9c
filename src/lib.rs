pub mod cgroup;
pub mod clienv;
pub mod completions;
pub mod config;
pub mod error;
pub mod family;
pub mod logging;
pub mod model;
pub mod privsep;
pub mod procd;
pub mod reaper;
pub mod scope;
pub mod tracker;

pub use config::TrackerConfig;
pub use error::{ErrorCode, ProcError, Result};
pub use family::{BackendKind, ProcFamily};
pub use model::{EnvMarker, FamilyDump, UsageMode, UsageSnapshot};
pub use procd::{ProcdClient, ProcdManager, ProcdOptions};
pub use scope::ProcessScope;
