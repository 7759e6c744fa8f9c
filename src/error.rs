use std::fmt;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Status codes shared by every backend and carried verbatim on the procd wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ErrorCode {
    Success = 0,
    BadRootPid = 1,
    BadWatcherPid = 2,
    BadSnapshotInterval = 3,
    AlreadyRegistered = 4,
    FamilyNotFound = 5,
    ProcessNotFound = 6,
    ProcessNotFamily = 7,
    UnregisterRoot = 8,
    BadEnvironmentInfo = 9,
    BadLoginInfo = 10,
    NoGroupIdAvailable = 11,
    BadCgroupInfo = 12,
}

impl ErrorCode {
    pub const ALL: [ErrorCode; 13] = [
        ErrorCode::Success,
        ErrorCode::BadRootPid,
        ErrorCode::BadWatcherPid,
        ErrorCode::BadSnapshotInterval,
        ErrorCode::AlreadyRegistered,
        ErrorCode::FamilyNotFound,
        ErrorCode::ProcessNotFound,
        ErrorCode::ProcessNotFamily,
        ErrorCode::UnregisterRoot,
        ErrorCode::BadEnvironmentInfo,
        ErrorCode::BadLoginInfo,
        ErrorCode::NoGroupIdAvailable,
        ErrorCode::BadCgroupInfo,
    ];

    pub fn from_wire(code: i32) -> Option<Self> {
        Self::ALL.iter().copied().find(|c| c.as_wire() == code)
    }

    pub fn as_wire(self) -> i32 {
        self as i32
    }

    pub fn is_success(self) -> bool {
        self == ErrorCode::Success
    }

    /// Fixed human-readable text for each code.
    pub fn message(self) -> &'static str {
        match self {
            ErrorCode::Success => "success",
            ErrorCode::BadRootPid => "invalid root pid",
            ErrorCode::BadWatcherPid => "invalid watcher pid",
            ErrorCode::BadSnapshotInterval => "invalid snapshot interval",
            ErrorCode::AlreadyRegistered => "family already registered",
            ErrorCode::FamilyNotFound => "family not found",
            ErrorCode::ProcessNotFound => "process not found",
            ErrorCode::ProcessNotFamily => "process is not a family root",
            ErrorCode::UnregisterRoot => "attempt to unregister the root family",
            ErrorCode::BadEnvironmentInfo => "invalid environment tracking info",
            ErrorCode::BadLoginInfo => "invalid login tracking info",
            ErrorCode::NoGroupIdAvailable => "no tracking group id available",
            ErrorCode::BadCgroupInfo => "invalid cgroup tracking info",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

#[derive(Error, Debug)]
pub enum ProcError {
    /// The backend (or the daemon behind it) answered, and the answer was no.
    #[error("{0}")]
    Family(ErrorCode),

    #[error("protocol error: {0}")]
    Protocol(String),

    /// The daemon could not be reached, or the exchange broke off mid-message.
    #[error("cannot communicate with procd at {address}: {source}")]
    Communication {
        address: String,
        #[source]
        source: io::Error,
    },

    #[error("switchboard {op} failed: {detail}")]
    Switchboard { op: String, detail: String },

    #[error("cgroup {}: {source}", path.display())]
    Cgroup {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("procd failed to start: {0}")]
    Startup(String),

    #[error("procd unavailable: {0}")]
    Fatal(String),

    #[error("a procd proxy already exists in this process")]
    AlreadyInstantiated,

    #[error("unsupported by the {backend} backend: {op}")]
    Unsupported {
        backend: &'static str,
        op: &'static str,
    },

    #[error("config: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Os(#[from] nix::errno::Errno),
}

impl ProcError {
    pub fn is_communication_failure(&self) -> bool {
        matches!(self, ProcError::Communication { .. })
    }

    /// The application-level code, if this error is one.
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            ProcError::Family(code) => Some(*code),
            _ => None,
        }
    }

    pub(crate) fn cgroup(path: impl Into<PathBuf>, source: io::Error) -> Self {
        ProcError::Cgroup {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn switchboard(op: &str, detail: impl Into<String>) -> Self {
        ProcError::Switchboard {
            op: op.to_string(),
            detail: detail.into(),
        }
    }
}

impl From<ErrorCode> for ProcError {
    fn from(code: ErrorCode) -> Self {
        ProcError::Family(code)
    }
}

pub type Result<T> = std::result::Result<T, ProcError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_codes_are_stable() {
        for code in ErrorCode::ALL {
            assert_eq!(ErrorCode::from_wire(code.as_wire()), Some(code));
        }
        assert_eq!(ErrorCode::FamilyNotFound.as_wire(), 5);
        assert_eq!(ErrorCode::from_wire(99), None);
        assert_eq!(ErrorCode::from_wire(-1), None);
    }

    #[test]
    fn communication_failure_is_distinct_from_daemon_refusal() {
        let refused = ProcError::Family(ErrorCode::FamilyNotFound);
        let unreachable = ProcError::Communication {
            address: "/tmp/procd.sock".into(),
            source: io::Error::from(io::ErrorKind::ConnectionRefused),
        };
        assert!(!refused.is_communication_failure());
        assert_eq!(refused.code(), Some(ErrorCode::FamilyNotFound));
        assert!(unreachable.is_communication_failure());
        assert_eq!(unreachable.code(), None);
        assert_eq!(refused.to_string(), "family not found");
    }
}
