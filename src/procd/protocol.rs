//! procd wire format.
//!
//! Every message is a sequence of fixed-width little-endian fields. A request
//! starts with its u32 command code; a response starts with an i32 error code
//! and carries a payload only when that code is success. Variable-length
//! blocks are a u32 length followed by that many bytes, capped at
//! [`MAX_BLOCK_LEN`].

use crate::error::{ErrorCode, ProcError, Result};
use crate::model::{BlockIo, EnvMarker, FamilyDump, MemberSummary, UsageMode, UsageSnapshot};
use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

pub const MAX_BLOCK_LEN: usize = 64 * 1024;

/// Upper bound on records pre-allocated from a count the peer sent.
const PREALLOC_LIMIT: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Command {
    RegisterSubfamily = 1,
    TrackViaEnvironment = 2,
    TrackViaLogin = 3,
    TrackViaAllocatedSupplementaryGroup = 4,
    TrackViaCgroup = 5,
    SignalProcess = 6,
    SuspendFamily = 7,
    ContinueFamily = 8,
    KillFamily = 9,
    GetUsage = 10,
    UnregisterFamily = 11,
    TakeSnapshot = 12,
    Dump = 13,
    Quit = 14,
}

impl Command {
    pub fn from_wire(code: u32) -> Option<Self> {
        use Command::*;
        Some(match code {
            1 => RegisterSubfamily,
            2 => TrackViaEnvironment,
            3 => TrackViaLogin,
            4 => TrackViaAllocatedSupplementaryGroup,
            5 => TrackViaCgroup,
            6 => SignalProcess,
            7 => SuspendFamily,
            8 => ContinueFamily,
            9 => KillFamily,
            10 => GetUsage,
            11 => UnregisterFamily,
            12 => TakeSnapshot,
            13 => Dump,
            14 => Quit,
            _ => return None,
        })
    }

    pub fn as_wire(self) -> u32 {
        self as u32
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    RegisterSubfamily {
        root_pid: i32,
        watcher_pid: i32,
        max_snapshot_interval: i32,
    },
    TrackViaEnvironment {
        pid: i32,
        markers: Vec<EnvMarker>,
    },
    TrackViaLogin {
        pid: i32,
        login: String,
    },
    TrackViaAllocatedSupplementaryGroup {
        pid: i32,
    },
    TrackViaCgroup {
        pid: i32,
        cgroup: String,
    },
    SignalProcess {
        pid: i32,
        signal: i32,
    },
    SuspendFamily {
        pid: i32,
    },
    ContinueFamily {
        pid: i32,
    },
    KillFamily {
        pid: i32,
    },
    GetUsage {
        pid: i32,
        mode: UsageMode,
    },
    UnregisterFamily {
        pid: i32,
    },
    TakeSnapshot,
    /// `pid == 0` dumps every family.
    Dump {
        pid: i32,
    },
    Quit,
}

impl Request {
    pub fn command(&self) -> Command {
        match self {
            Request::RegisterSubfamily { .. } => Command::RegisterSubfamily,
            Request::TrackViaEnvironment { .. } => Command::TrackViaEnvironment,
            Request::TrackViaLogin { .. } => Command::TrackViaLogin,
            Request::TrackViaAllocatedSupplementaryGroup { .. } => {
                Command::TrackViaAllocatedSupplementaryGroup
            }
            Request::TrackViaCgroup { .. } => Command::TrackViaCgroup,
            Request::SignalProcess { .. } => Command::SignalProcess,
            Request::SuspendFamily { .. } => Command::SuspendFamily,
            Request::ContinueFamily { .. } => Command::ContinueFamily,
            Request::KillFamily { .. } => Command::KillFamily,
            Request::GetUsage { .. } => Command::GetUsage,
            Request::UnregisterFamily { .. } => Command::UnregisterFamily,
            Request::TakeSnapshot => Command::TakeSnapshot,
            Request::Dump { .. } => Command::Dump,
            Request::Quit => Command::Quit,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = BytesMut::with_capacity(32);
        buf.put_u32_le(self.command().as_wire());

        match self {
            Request::RegisterSubfamily {
                root_pid,
                watcher_pid,
                max_snapshot_interval,
            } => {
                buf.put_i32_le(*root_pid);
                buf.put_i32_le(*watcher_pid);
                buf.put_i32_le(*max_snapshot_interval);
            }
            Request::TrackViaEnvironment { pid, markers } => {
                buf.put_i32_le(*pid);
                put_block(&mut buf, &EnvMarker::encode_all(markers), "environment")?;
            }
            Request::TrackViaLogin { pid, login } => {
                buf.put_i32_le(*pid);
                put_block(&mut buf, login.as_bytes(), "login")?;
            }
            Request::TrackViaCgroup { pid, cgroup } => {
                buf.put_i32_le(*pid);
                put_block(&mut buf, cgroup.as_bytes(), "cgroup")?;
            }
            Request::SignalProcess { pid, signal } => {
                buf.put_i32_le(*pid);
                buf.put_i32_le(*signal);
            }
            Request::GetUsage { pid, mode } => {
                buf.put_i32_le(*pid);
                buf.put_u32_le(mode.as_wire());
            }
            Request::TrackViaAllocatedSupplementaryGroup { pid }
            | Request::SuspendFamily { pid }
            | Request::ContinueFamily { pid }
            | Request::KillFamily { pid }
            | Request::UnregisterFamily { pid }
            | Request::Dump { pid } => buf.put_i32_le(*pid),
            Request::TakeSnapshot | Request::Quit => {}
        }

        Ok(buf.to_vec())
    }

    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self> {
        let code = reader.read_u32_le().await?;
        let command = Command::from_wire(code)
            .ok_or_else(|| ProcError::Protocol(format!("unknown command code {code}")))?;

        let request = match command {
            Command::RegisterSubfamily => Request::RegisterSubfamily {
                root_pid: reader.read_i32_le().await?,
                watcher_pid: reader.read_i32_le().await?,
                max_snapshot_interval: reader.read_i32_le().await?,
            },
            Command::TrackViaEnvironment => {
                let pid = reader.read_i32_le().await?;
                let block = read_block(reader, "environment").await?;
                let markers = EnvMarker::decode_all(&block).ok_or_else(|| {
                    ProcError::Protocol("malformed environment marker block".into())
                })?;
                Request::TrackViaEnvironment { pid, markers }
            }
            Command::TrackViaLogin => Request::TrackViaLogin {
                pid: reader.read_i32_le().await?,
                login: read_string(reader, "login").await?,
            },
            Command::TrackViaAllocatedSupplementaryGroup => {
                Request::TrackViaAllocatedSupplementaryGroup {
                    pid: reader.read_i32_le().await?,
                }
            }
            Command::TrackViaCgroup => Request::TrackViaCgroup {
                pid: reader.read_i32_le().await?,
                cgroup: read_string(reader, "cgroup").await?,
            },
            Command::SignalProcess => Request::SignalProcess {
                pid: reader.read_i32_le().await?,
                signal: reader.read_i32_le().await?,
            },
            Command::SuspendFamily => Request::SuspendFamily {
                pid: reader.read_i32_le().await?,
            },
            Command::ContinueFamily => Request::ContinueFamily {
                pid: reader.read_i32_le().await?,
            },
            Command::KillFamily => Request::KillFamily {
                pid: reader.read_i32_le().await?,
            },
            Command::GetUsage => {
                let pid = reader.read_i32_le().await?;
                let raw = reader.read_u32_le().await?;
                let mode = UsageMode::from_wire(raw)
                    .ok_or_else(|| ProcError::Protocol(format!("unknown usage mode {raw}")))?;
                Request::GetUsage { pid, mode }
            }
            Command::UnregisterFamily => Request::UnregisterFamily {
                pid: reader.read_i32_le().await?,
            },
            Command::TakeSnapshot => Request::TakeSnapshot,
            Command::Dump => Request::Dump {
                pid: reader.read_i32_le().await?,
            },
            Command::Quit => Request::Quit,
        };

        Ok(request)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    None,
    Usage(UsageSnapshot),
    Gid(u32),
    Dump(Vec<FamilyDump>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub code: ErrorCode,
    pub payload: Payload,
}

impl Response {
    pub fn ok(payload: Payload) -> Self {
        Self {
            code: ErrorCode::Success,
            payload,
        }
    }

    pub fn error(code: ErrorCode) -> Self {
        Self {
            code,
            payload: Payload::None,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = BytesMut::with_capacity(64);
        buf.put_i32_le(self.code.as_wire());
        if !self.code.is_success() {
            return Ok(buf.to_vec());
        }

        match &self.payload {
            Payload::None => {}
            Payload::Gid(gid) => buf.put_u32_le(*gid),
            Payload::Usage(usage) => put_usage(&mut buf, usage),
            Payload::Dump(families) => {
                buf.put_u32_le(wire_len(families.len(), "family count")?);
                for family in families {
                    buf.put_i32_le(family.root_pid);
                    buf.put_i32_le(family.watcher_pid.unwrap_or(0));
                    buf.put_i32_le(family.parent_root_pid.unwrap_or(0));
                    buf.put_u32_le(wire_len(family.members.len(), "member count")?);
                    for member in &family.members {
                        buf.put_i32_le(member.pid);
                        buf.put_i32_le(member.ppid);
                        buf.put_u64_le(member.user_cpu_time);
                        buf.put_u64_le(member.sys_cpu_time);
                    }
                }
            }
        }

        Ok(buf.to_vec())
    }

    /// Reads the response to `command`; the command decides the payload shape.
    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R, command: Command) -> Result<Self> {
        let raw = reader.read_i32_le().await?;
        let code = ErrorCode::from_wire(raw)
            .ok_or_else(|| ProcError::Protocol(format!("unknown error code {raw}")))?;
        if !code.is_success() {
            return Ok(Self::error(code));
        }

        let payload = match command {
            Command::GetUsage => Payload::Usage(read_usage(reader).await?),
            Command::TrackViaAllocatedSupplementaryGroup => Payload::Gid(reader.read_u32_le().await?),
            Command::Dump => Payload::Dump(read_dump(reader).await?),
            _ => Payload::None,
        };

        Ok(Self::ok(payload))
    }
}

impl From<ErrorCode> for Response {
    fn from(code: ErrorCode) -> Self {
        Response::error(code)
    }
}

fn wire_len(len: usize, what: &str) -> Result<u32> {
    u32::try_from(len).map_err(|_| ProcError::Protocol(format!("{what} {len} does not fit the wire")))
}

fn put_block(buf: &mut BytesMut, bytes: &[u8], what: &str) -> Result<()> {
    if bytes.len() > MAX_BLOCK_LEN {
        return Err(ProcError::Protocol(format!(
            "{what} block of {} bytes exceeds {MAX_BLOCK_LEN}",
            bytes.len()
        )));
    }
    buf.put_u32_le(bytes.len() as u32);
    buf.put_slice(bytes);
    Ok(())
}

async fn read_block<R: AsyncRead + Unpin>(reader: &mut R, what: &str) -> Result<Vec<u8>> {
    let len = reader.read_u32_le().await? as usize;
    if len > MAX_BLOCK_LEN {
        return Err(ProcError::Protocol(format!(
            "{what} block of {len} bytes exceeds {MAX_BLOCK_LEN}"
        )));
    }
    let mut block = vec![0u8; len];
    reader.read_exact(&mut block).await?;
    Ok(block)
}

async fn read_string<R: AsyncRead + Unpin>(reader: &mut R, what: &str) -> Result<String> {
    let block = read_block(reader, what).await?;
    String::from_utf8(block).map_err(|_| ProcError::Protocol(format!("{what} is not valid UTF-8")))
}

fn put_usage(buf: &mut BytesMut, usage: &UsageSnapshot) {
    buf.put_u64_le(usage.user_cpu_time);
    buf.put_u64_le(usage.sys_cpu_time);
    buf.put_f64_le(usage.percent_cpu);
    buf.put_u64_le(usage.max_image_size);
    buf.put_u64_le(usage.total_image_size);
    buf.put_u64_le(usage.total_resident_set_size);
    buf.put_u32_le(usage.num_procs);
    match &usage.block_io {
        Some(io) => {
            buf.put_u8(1);
            buf.put_u64_le(io.read_bytes);
            buf.put_u64_le(io.write_bytes);
            buf.put_u64_le(io.reads);
            buf.put_u64_le(io.writes);
        }
        None => buf.put_u8(0),
    }
    match usage.instructions {
        Some(count) => {
            buf.put_u8(1);
            buf.put_u64_le(count);
        }
        None => buf.put_u8(0),
    }
}

async fn read_flag<R: AsyncRead + Unpin>(reader: &mut R, what: &str) -> Result<bool> {
    match reader.read_u8().await? {
        0 => Ok(false),
        1 => Ok(true),
        other => Err(ProcError::Protocol(format!("bad {what} presence flag {other}"))),
    }
}

async fn read_usage<R: AsyncRead + Unpin>(reader: &mut R) -> Result<UsageSnapshot> {
    let mut usage = UsageSnapshot {
        user_cpu_time: reader.read_u64_le().await?,
        sys_cpu_time: reader.read_u64_le().await?,
        percent_cpu: reader.read_f64_le().await?,
        max_image_size: reader.read_u64_le().await?,
        total_image_size: reader.read_u64_le().await?,
        total_resident_set_size: reader.read_u64_le().await?,
        num_procs: reader.read_u32_le().await?,
        block_io: None,
        instructions: None,
    };
    if read_flag(reader, "block io").await? {
        usage.block_io = Some(BlockIo {
            read_bytes: reader.read_u64_le().await?,
            write_bytes: reader.read_u64_le().await?,
            reads: reader.read_u64_le().await?,
            writes: reader.read_u64_le().await?,
        });
    }
    if read_flag(reader, "instructions").await? {
        usage.instructions = Some(reader.read_u64_le().await?);
    }
    Ok(usage)
}

async fn read_dump<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Vec<FamilyDump>> {
    let count = reader.read_u32_le().await? as usize;
    let mut families = Vec::with_capacity(count.min(PREALLOC_LIMIT));
    for _ in 0..count {
        let root_pid = reader.read_i32_le().await?;
        let watcher = reader.read_i32_le().await?;
        let parent = reader.read_i32_le().await?;
        let member_count = reader.read_u32_le().await? as usize;
        let mut members = Vec::with_capacity(member_count.min(PREALLOC_LIMIT));
        for _ in 0..member_count {
            members.push(MemberSummary {
                pid: reader.read_i32_le().await?,
                ppid: reader.read_i32_le().await?,
                user_cpu_time: reader.read_u64_le().await?,
                sys_cpu_time: reader.read_u64_le().await?,
            });
        }
        families.push(FamilyDump {
            root_pid,
            watcher_pid: (watcher > 0).then_some(watcher),
            parent_root_pid: (parent > 0).then_some(parent),
            members,
        });
    }
    Ok(families)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    async fn decode_request(bytes: &[u8]) -> Result<Request> {
        let mut reader = bytes;
        Request::read_from(&mut reader).await
    }

    #[tokio::test]
    async fn register_layout_is_little_endian() {
        let request = Request::RegisterSubfamily {
            root_pid: 0x0102_0304,
            watcher_pid: -1,
            max_snapshot_interval: 60,
        };
        let bytes = request.encode().unwrap();
        assert_eq!(&bytes[..4], &[1, 0, 0, 0]);
        assert_eq!(&bytes[4..8], &[4, 3, 2, 1]);
        assert_eq!(&bytes[8..12], &[0xff; 4]);
        assert_eq!(decode_request(&bytes).await.unwrap(), request);
    }

    #[tokio::test]
    async fn environment_markers_travel_as_one_block() {
        let request = Request::TrackViaEnvironment {
            pid: 4242,
            markers: vec![
                EnvMarker::new("JOB_ID", "17.3"),
                EnvMarker::new("SCHEDD", "submit-1"),
            ],
        };
        let bytes = request.encode().unwrap();
        assert_eq!(decode_request(&bytes).await.unwrap(), request);
    }

    #[tokio::test]
    async fn unknown_command_is_a_protocol_error() {
        let bytes = 99u32.to_le_bytes();
        let err = decode_request(&bytes).await.unwrap_err();
        assert!(matches!(err, ProcError::Protocol(_)), "{err:?}");
    }

    #[tokio::test]
    async fn oversized_block_is_rejected_both_ways() {
        let request = Request::TrackViaLogin {
            pid: 1,
            login: "x".repeat(MAX_BLOCK_LEN + 1),
        };
        assert!(matches!(request.encode(), Err(ProcError::Protocol(_))));

        let mut bytes = Vec::new();
        bytes.extend_from_slice(&3u32.to_le_bytes());
        bytes.extend_from_slice(&1i32.to_le_bytes());
        bytes.extend_from_slice(&((MAX_BLOCK_LEN as u32) + 1).to_le_bytes());
        let err = decode_request(&bytes).await.unwrap_err();
        assert!(matches!(err, ProcError::Protocol(_)), "{err:?}");
    }

    #[tokio::test]
    async fn truncated_request_is_an_io_error() {
        let bytes = Request::SignalProcess { pid: 10, signal: 9 }.encode().unwrap();
        let err = decode_request(&bytes[..6]).await.unwrap_err();
        assert!(matches!(err, ProcError::Io(_)), "{err:?}");
    }

    #[tokio::test]
    async fn usage_payload_keeps_optional_sections() {
        let usage = UsageSnapshot {
            user_cpu_time: 12,
            sys_cpu_time: 3,
            percent_cpu: 0.75,
            max_image_size: 2048,
            total_image_size: 1024,
            total_resident_set_size: 512,
            num_procs: 3,
            block_io: Some(BlockIo {
                read_bytes: 4096,
                write_bytes: 8192,
                reads: 1,
                writes: 2,
            }),
            instructions: None,
        };
        let bytes = Response::ok(Payload::Usage(usage)).encode().unwrap();
        let mut reader = bytes.as_slice();
        let decoded = Response::read_from(&mut reader, Command::GetUsage).await.unwrap();
        assert_eq!(decoded.payload, Payload::Usage(usage));
        assert!(reader.is_empty());
    }

    #[tokio::test]
    async fn error_response_has_no_payload() {
        let bytes = Response::error(ErrorCode::FamilyNotFound).encode().unwrap();
        assert_eq!(bytes, 5i32.to_le_bytes());
        let mut reader = bytes.as_slice();
        let decoded = Response::read_from(&mut reader, Command::GetUsage).await.unwrap();
        assert_eq!(decoded, Response::error(ErrorCode::FamilyNotFound));
    }

    #[tokio::test]
    async fn unknown_error_code_is_a_protocol_error() {
        let bytes = 42i32.to_le_bytes();
        let mut reader = &bytes[..];
        let err = Response::read_from(&mut reader, Command::Quit).await.unwrap_err();
        assert!(matches!(err, ProcError::Protocol(_)), "{err:?}");
    }

    #[tokio::test]
    async fn dump_lists_families_and_members() {
        let families = vec![FamilyDump {
            root_pid: 100,
            watcher_pid: None,
            parent_root_pid: Some(1),
            members: vec![
                MemberSummary { pid: 100, ppid: 1, user_cpu_time: 5, sys_cpu_time: 1 },
                MemberSummary { pid: 101, ppid: 100, user_cpu_time: 0, sys_cpu_time: 0 },
            ],
        }];
        let bytes = Response::ok(Payload::Dump(families.clone())).encode().unwrap();
        let mut reader = bytes.as_slice();
        let decoded = Response::read_from(&mut reader, Command::Dump).await.unwrap();
        assert_eq!(decoded.payload, Payload::Dump(families));
    }

    #[tokio::test]
    async fn every_request_survives_the_wire() {
        let requests = vec![
            Request::RegisterSubfamily {
                root_pid: i32::MAX,
                watcher_pid: 0,
                max_snapshot_interval: i32::MIN,
            },
            Request::TrackViaEnvironment { pid: 1, markers: Vec::new() },
            Request::TrackViaLogin { pid: i32::MIN, login: String::new() },
            Request::TrackViaLogin { pid: 7, login: "condor".into() },
            Request::TrackViaAllocatedSupplementaryGroup { pid: i32::MAX },
            Request::TrackViaCgroup { pid: 2, cgroup: "htcondor/job_1.0".into() },
            Request::SignalProcess { pid: -1, signal: i32::MAX },
            Request::SignalProcess { pid: 3, signal: 0 },
            Request::SuspendFamily { pid: 4 },
            Request::ContinueFamily { pid: 5 },
            Request::KillFamily { pid: i32::MAX },
            Request::GetUsage { pid: 6, mode: UsageMode::Cached },
            Request::GetUsage { pid: 6, mode: UsageMode::Live },
            Request::UnregisterFamily { pid: 8 },
            Request::TakeSnapshot,
            Request::Dump { pid: 0 },
            Request::Quit,
        ];

        let mut commands = HashSet::new();
        for request in requests {
            let bytes = request.encode().unwrap();
            let mut reader = bytes.as_slice();
            let decoded = Request::read_from(&mut reader).await.unwrap();
            assert_eq!(decoded, request);
            assert!(reader.is_empty(), "{request:?} left trailing bytes");
            commands.insert(request.command().as_wire());
        }
        assert_eq!(commands.len(), 14);
    }

    #[tokio::test]
    async fn allocated_gid_payload() {
        for gid in [0, 4242, u32::MAX] {
            let bytes = Response::ok(Payload::Gid(gid)).encode().unwrap();
            let mut reader = bytes.as_slice();
            let decoded = Response::read_from(&mut reader, Command::TrackViaAllocatedSupplementaryGroup)
                .await
                .unwrap();
            assert_eq!(decoded.payload, Payload::Gid(gid));
            assert!(reader.is_empty());
        }
    }
}
