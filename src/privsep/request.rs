//! Text configuration written to the switchboard's input pipe.
//!
//! Scalars are `key=value` lines. Values that may hold arbitrary bytes
//! (arguments, environment entries) are `key<len>` lines followed by exactly
//! `len` bytes and a newline.

use crate::error::{ProcError, Result};
use std::ffi::{OsStr, OsString};
use std::io::{BufRead, Read};
use std::os::fd::{OwnedFd, RawFd};
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::path::{Path, PathBuf};

/// Where one of the job's standard streams goes.
#[derive(Debug, Default)]
pub enum StdStream {
    /// The spawner's own stream.
    #[default]
    Inherit,
    Null,
    /// Opened by the switchboard as the target user.
    Path(PathBuf),
    /// An already open descriptor, handed to the switchboard as its stdio.
    Fd(OwnedFd),
}

/// Everything needed to start a job through the switchboard.
#[derive(Debug, Default)]
pub struct ExecRequest {
    pub uid: u32,
    pub path: PathBuf,
    /// Full argv, argv[0] included.
    pub args: Vec<OsString>,
    pub env: Vec<(OsString, OsString)>,
    pub init_dir: Option<PathBuf>,
    pub stdin: StdStream,
    pub stdout: StdStream,
    pub stderr: StdStream,
    /// Spawner descriptors the job inherits under the same numbers.
    pub keep_open_fds: Vec<RawFd>,
    pub tracking_group: Option<u32>,
    pub std_universe: bool,
}

impl ExecRequest {
    pub fn new(uid: u32, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            uid,
            args: vec![path.clone().into_os_string()],
            path,
            ..Self::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut out = ConfigWriter::default();
        out.line("user-uid", self.uid.to_string().as_bytes())?;
        out.line("exec-path", self.path.as_os_str().as_bytes())?;
        for arg in &self.args {
            out.block("exec-arg", arg.as_bytes());
        }
        for (key, value) in &self.env {
            let mut entry = key.as_bytes().to_vec();
            entry.push(b'=');
            entry.extend_from_slice(value.as_bytes());
            out.block("exec-env", &entry);
        }
        if let Some(dir) = &self.init_dir {
            out.line("exec-init-dir", dir.as_os_str().as_bytes())?;
        }
        for (key, stream) in [
            ("exec-stdin", &self.stdin),
            ("exec-stdout", &self.stdout),
            ("exec-stderr", &self.stderr),
        ] {
            match stream {
                StdStream::Path(path) => out.line(key, path.as_os_str().as_bytes())?,
                StdStream::Null => out.line(key, b"/dev/null")?,
                StdStream::Inherit | StdStream::Fd(_) => {}
            }
        }
        for fd in &self.keep_open_fds {
            out.line("exec-keep-open-fd", fd.to_string().as_bytes())?;
        }
        if let Some(gid) = self.tracking_group {
            out.line("exec-tracking-group", gid.to_string().as_bytes())?;
        }
        if self.std_universe {
            out.line("exec-is-std-univ", b"")?;
        }
        Ok(out.finish())
    }
}

#[derive(Default)]
struct ConfigWriter {
    buf: Vec<u8>,
}

impl ConfigWriter {
    fn line(&mut self, key: &str, value: &[u8]) -> Result<()> {
        if value.contains(&b'\n') {
            return Err(ProcError::switchboard(
                "exec",
                format!("{key} value contains a newline"),
            ));
        }
        self.buf.extend_from_slice(key.as_bytes());
        if !value.is_empty() {
            self.buf.push(b'=');
            self.buf.extend_from_slice(value);
        }
        self.buf.push(b'\n');
        Ok(())
    }

    fn block(&mut self, key: &str, value: &[u8]) {
        self.buf
            .extend_from_slice(format!("{key}<{}>\n", value.len()).as_bytes());
        self.buf.extend_from_slice(value);
        self.buf.push(b'\n');
    }

    fn finish(self) -> Vec<u8> {
        self.buf
    }
}

/// Upper bound for one length-prefixed value.
const MAX_VALUE_LEN: usize = 1 << 20;

/// The parsed key/value stream, in order.
#[derive(Debug, Default, PartialEq)]
pub struct SwitchboardInput {
    entries: Vec<(String, Vec<u8>)>,
}

impl SwitchboardInput {
    pub fn parse(reader: impl Read) -> std::result::Result<Self, String> {
        let mut reader = std::io::BufReader::new(reader);
        let mut entries = Vec::new();
        let mut line = Vec::new();

        loop {
            line.clear();
            let n = reader
                .read_until(b'\n', &mut line)
                .map_err(|e| format!("reading config: {e}"))?;
            if n == 0 {
                break;
            }
            if line.last() != Some(&b'\n') {
                return Err("config ends mid-line".into());
            }
            line.pop();
            if line.is_empty() {
                continue;
            }

            let text = String::from_utf8_lossy(&line).into_owned();
            let block_header = text
                .strip_suffix('>')
                .and_then(|t| t.split_once('<'))
                .filter(|(key, _)| !key.contains('='));
            if let Some((key, len)) = block_header {
                let len: usize = len
                    .parse()
                    .map_err(|_| format!("bad length in '{text}'"))?;
                if len > MAX_VALUE_LEN {
                    return Err(format!("{key} value of {len} bytes is too long"));
                }
                let mut value = vec![0u8; len + 1];
                reader
                    .read_exact(&mut value)
                    .map_err(|_| format!("config ends inside {key}"))?;
                if value.pop() != Some(b'\n') {
                    return Err(format!("{key} value is not newline-terminated"));
                }
                entries.push((key.to_string(), value));
            } else {
                let (key, value) = match line.iter().position(|b| *b == b'=') {
                    Some(i) => (
                        String::from_utf8_lossy(&line[..i]).into_owned(),
                        line[i + 1..].to_vec(),
                    ),
                    None => (text, Vec::new()),
                };
                entries.push((key, value));
            }
        }
        Ok(Self { entries })
    }

    pub fn get(&self, key: &str) -> Option<&[u8]> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_slice())
    }

    pub fn all<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a [u8]> + 'a {
        self.entries
            .iter()
            .filter(move |(k, _)| k == key)
            .map(|(_, v)| v.as_slice())
    }

    pub fn has(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    pub fn number<T: std::str::FromStr>(&self, key: &str) -> std::result::Result<T, String> {
        let raw = self.get(key).ok_or_else(|| format!("missing {key}"))?;
        std::str::from_utf8(raw)
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .ok_or_else(|| format!("bad {key} '{}'", String::from_utf8_lossy(raw)))
    }

    pub fn path(&self, key: &str) -> Option<PathBuf> {
        self.get(key).map(|v| PathBuf::from(OsStr::from_bytes(v)))
    }
}

/// What the switchboard needs to become the job.
#[derive(Debug, PartialEq)]
pub struct ExecConfig {
    pub uid: u32,
    pub path: PathBuf,
    pub args: Vec<OsString>,
    pub env: Vec<(OsString, OsString)>,
    pub init_dir: Option<PathBuf>,
    pub stdin: Option<PathBuf>,
    pub stdout: Option<PathBuf>,
    pub stderr: Option<PathBuf>,
    pub keep_open_fds: Vec<RawFd>,
    pub tracking_group: Option<u32>,
    pub std_universe: bool,
}

const EXEC_KEYS: [&str; 11] = [
    "user-uid",
    "exec-path",
    "exec-arg",
    "exec-env",
    "exec-init-dir",
    "exec-stdin",
    "exec-stdout",
    "exec-stderr",
    "exec-keep-open-fd",
    "exec-tracking-group",
    "exec-is-std-univ",
];

impl ExecConfig {
    pub fn from_input(input: &SwitchboardInput) -> std::result::Result<Self, String> {
        if let Some(unknown) = input.keys().find(|k| !EXEC_KEYS.contains(k)) {
            return Err(format!("unknown exec config key '{unknown}'"));
        }
        let path = input.path("exec-path").ok_or("missing exec-path")?;
        let mut args: Vec<OsString> = input
            .all("exec-arg")
            .map(|a| OsString::from_vec(a.to_vec()))
            .collect();
        if args.is_empty() {
            args.push(path.clone().into_os_string());
        }
        let env = input
            .all("exec-env")
            .map(|entry| {
                let i = entry
                    .iter()
                    .position(|b| *b == b'=')
                    .ok_or_else(|| format!("exec-env entry without '=': {}", String::from_utf8_lossy(entry)))?;
                Ok((
                    OsString::from_vec(entry[..i].to_vec()),
                    OsString::from_vec(entry[i + 1..].to_vec()),
                ))
            })
            .collect::<std::result::Result<_, String>>()?;
        let keep_open_fds = input
            .all("exec-keep-open-fd")
            .map(|v| {
                std::str::from_utf8(v)
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .ok_or_else(|| format!("bad exec-keep-open-fd '{}'", String::from_utf8_lossy(v)))
            })
            .collect::<std::result::Result<_, String>>()?;

        Ok(Self {
            uid: input.number("user-uid")?,
            path,
            args,
            env,
            init_dir: input.path("exec-init-dir"),
            stdin: input.path("exec-stdin"),
            stdout: input.path("exec-stdout"),
            stderr: input.path("exec-stderr"),
            keep_open_fds,
            tracking_group: input
                .has("exec-tracking-group")
                .then(|| input.number("exec-tracking-group"))
                .transpose()?,
            std_universe: input.has("exec-is-std-univ"),
        })
    }
}

/// Request for the recursive size of a directory, measured as `uid`.
#[derive(Debug, PartialEq)]
pub struct DirUsageConfig {
    pub uid: u32,
    pub path: PathBuf,
}

impl DirUsageConfig {
    pub fn encode(uid: u32, path: &Path) -> Result<Vec<u8>> {
        let mut out = ConfigWriter::default();
        out.line("user-uid", uid.to_string().as_bytes())?;
        out.line("dir-path", path.as_os_str().as_bytes())?;
        Ok(out.finish())
    }

    pub fn from_input(input: &SwitchboardInput) -> std::result::Result<Self, String> {
        Ok(Self {
            uid: input.number("user-uid")?,
            path: input.path("dir-path").ok_or("missing dir-path")?,
        })
    }
}
