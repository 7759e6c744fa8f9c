//! Records shared by the backends, the procd codec and the control tool.

use serde::Serialize;
use std::time::Duration;

/// Aggregate resource usage of one process family.
///
/// CPU times are whole seconds, sizes are KiB. `percent_cpu` is CPU seconds
/// consumed per wall-clock second, so `1.0` is one fully busy core.
/// A snapshot is always produced and replaced as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct UsageSnapshot {
    pub user_cpu_time: u64,
    pub sys_cpu_time: u64,
    pub percent_cpu: f64,
    pub max_image_size: u64,
    pub total_image_size: u64,
    pub total_resident_set_size: u64,
    pub num_procs: u32,
    pub block_io: Option<BlockIo>,
    pub instructions: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct BlockIo {
    pub read_bytes: u64,
    pub write_bytes: u64,
    pub reads: u64,
    pub writes: u64,
}

/// How much work `get_usage` may do.
///
/// `Cached` returns the counters captured by the last snapshot; `Live` also
/// queries every member process right now for image size and CPU rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum UsageMode {
    #[default]
    Cached,
    Live,
}

impl UsageMode {
    pub fn as_wire(self) -> u32 {
        match self {
            UsageMode::Cached => 0,
            UsageMode::Live => 1,
        }
    }

    pub fn from_wire(value: u32) -> Option<Self> {
        match value {
            0 => Some(UsageMode::Cached),
            1 => Some(UsageMode::Live),
            _ => None,
        }
    }
}

/// An environment variable a spawner plants in a job so that its processes
/// can be recognised even after they leave the process tree.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct EnvMarker {
    pub name: String,
    pub value: String,
}

impl EnvMarker {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    /// `NAME=VALUE` pairs joined by NUL bytes.
    pub fn encode_all(markers: &[EnvMarker]) -> Vec<u8> {
        let mut out = Vec::new();
        for (i, marker) in markers.iter().enumerate() {
            if i > 0 {
                out.push(0);
            }
            out.extend_from_slice(marker.name.as_bytes());
            out.push(b'=');
            out.extend_from_slice(marker.value.as_bytes());
        }
        out
    }

    pub fn decode_all(bytes: &[u8]) -> Option<Vec<EnvMarker>> {
        if bytes.is_empty() {
            return Some(Vec::new());
        }
        bytes
            .split(|b| *b == 0)
            .map(|pair| {
                let text = std::str::from_utf8(pair).ok()?;
                let (name, value) = text.split_once('=')?;
                if name.is_empty() {
                    return None;
                }
                Some(EnvMarker::new(name, value))
            })
            .collect()
    }
}

/// Extra ways a family claims processes beyond the root's descendants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum TrackingMethod {
    Environment(Vec<EnvMarker>),
    Login { login: String, uid: u32 },
    SupplementaryGroup(u32),
    Cgroup(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MemberSummary {
    pub pid: i32,
    pub ppid: i32,
    pub user_cpu_time: u64,
    pub sys_cpu_time: u64,
}

/// One family as reported by the DUMP command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FamilyDump {
    pub root_pid: i32,
    pub watcher_pid: Option<i32>,
    pub parent_root_pid: Option<i32>,
    pub members: Vec<MemberSummary>,
}

pub(crate) fn interval_secs(interval: Duration) -> i32 {
    i32::try_from(interval.as_secs()).unwrap_or(i32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_markers_survive_encoding() {
        let markers = vec![
            EnvMarker::new("PROCFAM_JOB", "1234.0"),
            EnvMarker::new("PROCFAM_TOKEN", "a=b"),
        ];
        let encoded = EnvMarker::encode_all(&markers);
        assert_eq!(EnvMarker::decode_all(&encoded), Some(markers));
    }

    #[test]
    fn env_markers_reject_nameless_pairs() {
        assert_eq!(EnvMarker::decode_all(b"=value"), None);
        assert_eq!(EnvMarker::decode_all(b"novalue"), None);
        assert_eq!(EnvMarker::decode_all(b""), Some(Vec::new()));
    }

    #[test]
    fn usage_mode_wire_values() {
        assert_eq!(UsageMode::from_wire(UsageMode::Live.as_wire()), Some(UsageMode::Live));
        assert_eq!(UsageMode::from_wire(7), None);
    }
}
