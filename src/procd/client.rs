use super::protocol::{Payload, Request, Response};
use crate::error::{ProcError, Result};
use crate::model::{interval_secs, EnvMarker, FamilyDump, UsageMode, UsageSnapshot};
use nix::sys::signal::Signal;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;
use tracing::trace;

/// One connection per request, closed after the response.
#[derive(Debug, Clone)]
pub struct ProcdClient {
    address: PathBuf,
}

impl ProcdClient {
    pub fn new(address: impl Into<PathBuf>) -> Self {
        Self {
            address: address.into(),
        }
    }

    pub fn address(&self) -> &Path {
        &self.address
    }

    fn communication(&self, source: io::Error) -> ProcError {
        ProcError::Communication {
            address: self.address.display().to_string(),
            source,
        }
    }

    /// Connects and hangs up without sending anything.
    pub async fn ping(&self) -> Result<()> {
        UnixStream::connect(&self.address)
            .await
            .map(drop)
            .map_err(|e| self.communication(e))
    }

    async fn round_trip(&self, request: &Request) -> Result<Response> {
        let bytes = request.encode()?;
        trace!(command = ?request.command(), address = %self.address.display(), "procd request");

        let mut stream = UnixStream::connect(&self.address)
            .await
            .map_err(|e| self.communication(e))?;
        stream
            .write_all(&bytes)
            .await
            .map_err(|e| self.communication(e))?;

        Response::read_from(&mut stream, request.command())
            .await
            .map_err(|e| match e {
                ProcError::Io(source) => self.communication(source),
                other => other,
            })
    }

    async fn call(&self, request: Request) -> Result<Payload> {
        let response = self.round_trip(&request).await?;
        if response.code.is_success() {
            Ok(response.payload)
        } else {
            trace!(command = ?request.command(), code = %response.code, "procd refused");
            Err(ProcError::Family(response.code))
        }
    }

    async fn call_unit(&self, request: Request) -> Result<()> {
        self.call(request).await.map(drop)
    }

    pub async fn register_subfamily(
        &self,
        root_pid: i32,
        watcher_pid: Option<i32>,
        max_snapshot_interval: Duration,
    ) -> Result<()> {
        self.call_unit(Request::RegisterSubfamily {
            root_pid,
            watcher_pid: watcher_pid.unwrap_or(0),
            max_snapshot_interval: interval_secs(max_snapshot_interval),
        })
        .await
    }

    pub async fn track_family_via_environment(&self, pid: i32, markers: &[EnvMarker]) -> Result<()> {
        self.call_unit(Request::TrackViaEnvironment {
            pid,
            markers: markers.to_vec(),
        })
        .await
    }

    pub async fn track_family_via_login(&self, pid: i32, login: &str) -> Result<()> {
        self.call_unit(Request::TrackViaLogin {
            pid,
            login: login.to_string(),
        })
        .await
    }

    pub async fn track_family_via_allocated_supplementary_group(&self, pid: i32) -> Result<u32> {
        match self
            .call(Request::TrackViaAllocatedSupplementaryGroup { pid })
            .await?
        {
            Payload::Gid(gid) => Ok(gid),
            other => Err(unexpected("gid", &other)),
        }
    }

    pub async fn track_family_via_cgroup(&self, pid: i32, cgroup: &str) -> Result<()> {
        self.call_unit(Request::TrackViaCgroup {
            pid,
            cgroup: cgroup.to_string(),
        })
        .await
    }

    pub async fn signal_process(&self, pid: i32, signal: Signal) -> Result<()> {
        self.call_unit(Request::SignalProcess {
            pid,
            signal: signal as i32,
        })
        .await
    }

    pub async fn suspend_family(&self, pid: i32) -> Result<()> {
        self.call_unit(Request::SuspendFamily { pid }).await
    }

    pub async fn continue_family(&self, pid: i32) -> Result<()> {
        self.call_unit(Request::ContinueFamily { pid }).await
    }

    pub async fn kill_family(&self, pid: i32) -> Result<()> {
        self.call_unit(Request::KillFamily { pid }).await
    }

    pub async fn get_usage(&self, pid: i32, mode: UsageMode) -> Result<UsageSnapshot> {
        match self.call(Request::GetUsage { pid, mode }).await? {
            Payload::Usage(usage) => Ok(usage),
            other => Err(unexpected("usage", &other)),
        }
    }

    pub async fn unregister_family(&self, pid: i32) -> Result<()> {
        self.call_unit(Request::UnregisterFamily { pid }).await
    }

    pub async fn snapshot(&self) -> Result<()> {
        self.call_unit(Request::TakeSnapshot).await
    }

    /// Every family when `pid` is `None`.
    pub async fn dump(&self, pid: Option<i32>) -> Result<Vec<FamilyDump>> {
        match self.call(Request::Dump { pid: pid.unwrap_or(0) }).await? {
            Payload::Dump(families) => Ok(families),
            other => Err(unexpected("dump", &other)),
        }
    }

    pub async fn quit(&self) -> Result<()> {
        self.call_unit(Request::Quit).await
    }
}

fn unexpected(expected: &str, got: &Payload) -> ProcError {
    ProcError::Protocol(format!("expected {expected} payload, got {got:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use tokio::net::UnixListener;

    /// Serves `responses` in order, one per connection, returning what was asked.
    fn fake_procd(
        path: &Path,
        responses: Vec<Response>,
    ) -> tokio::task::JoinHandle<Vec<Request>> {
        let listener = UnixListener::bind(path).unwrap();
        tokio::spawn(async move {
            let mut seen = Vec::new();
            for response in responses {
                let (mut stream, _) = listener.accept().await.unwrap();
                seen.push(Request::read_from(&mut stream).await.unwrap());
                stream.write_all(&response.encode().unwrap()).await.unwrap();
            }
            seen
        })
    }

    #[tokio::test]
    async fn refusal_is_not_a_communication_failure() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("procd.sock");
        let server = fake_procd(&path, vec![ErrorCode::FamilyNotFound.into()]);

        let client = ProcdClient::new(&path);
        let err = client.suspend_family(77).await.unwrap_err();
        assert!(matches!(err, ProcError::Family(ErrorCode::FamilyNotFound)));
        assert!(!err.is_communication_failure());
        assert_eq!(server.await.unwrap(), vec![Request::SuspendFamily { pid: 77 }]);
    }

    #[tokio::test]
    async fn missing_daemon_is_a_communication_failure() {
        let dir = tempfile::tempdir().unwrap();
        let client = ProcdClient::new(dir.path().join("nobody-home.sock"));
        let err = client.get_usage(1, UsageMode::Cached).await.unwrap_err();
        assert!(err.is_communication_failure(), "{err:?}");
        assert!(client.ping().await.is_err());
    }

    #[tokio::test]
    async fn register_sends_watcher_zero_when_absent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("procd.sock");
        let server = fake_procd(&path, vec![Response::ok(Payload::None)]);

        let client = ProcdClient::new(&path);
        client
            .register_subfamily(1234, None, Duration::from_secs(30))
            .await
            .unwrap();
        assert_eq!(
            server.await.unwrap(),
            vec![Request::RegisterSubfamily {
                root_pid: 1234,
                watcher_pid: 0,
                max_snapshot_interval: 30,
            }]
        );
    }

    #[tokio::test]
    async fn usage_and_group_payloads_are_decoded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("procd.sock");
        let usage = UsageSnapshot {
            num_procs: 2,
            user_cpu_time: 9,
            ..Default::default()
        };
        let server = fake_procd(
            &path,
            vec![Response::ok(Payload::Usage(usage)), Response::ok(Payload::Gid(701))],
        );

        let client = ProcdClient::new(&path);
        assert_eq!(client.get_usage(5, UsageMode::Live).await.unwrap(), usage);
        assert_eq!(
            client
                .track_family_via_allocated_supplementary_group(5)
                .await
                .unwrap(),
            701
        );
        server.await.unwrap();
    }

    #[tokio::test]
    async fn hangup_mid_response_is_a_communication_failure() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("procd.sock");
        let listener = UnixListener::bind(&path).unwrap();
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let _ = Request::read_from(&mut stream).await.unwrap();
            stream.write_all(&[0, 0]).await.unwrap();
        });

        let err = ProcdClient::new(&path).kill_family(3).await.unwrap_err();
        assert!(err.is_communication_failure(), "{err:?}");
        server.await.unwrap();
    }
}
