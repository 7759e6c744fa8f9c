use super::protocol::{Payload, Request, Response};
use crate::error::{ErrorCode, ProcError};
use crate::tracker::{FamilyResult, FamilyTracker};
use anyhow::{Context, Result};
use nix::sys::signal::Signal;
use std::os::fd::AsRawFd;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{UnixListener, UnixStream};
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

/// How long one client gets to deliver its request.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// How often the root process is checked for liveness.
const ROOT_CHECK_INTERVAL: Duration = Duration::from_secs(2);

pub struct ServerConfig {
    pub address: PathBuf,
    /// Registered as the root family; unregistering it is refused.
    pub root_pid: Option<i32>,
    /// Point stderr at /dev/null once listening, which tells the spawner we
    /// are ready.
    pub close_stderr_when_ready: bool,
}

enum Flow {
    Continue,
    Quit,
}

pub struct ProcdServer {
    config: ServerConfig,
    tracker: FamilyTracker,
}

impl ProcdServer {
    pub fn new(config: ServerConfig, tracker: FamilyTracker) -> Self {
        Self { config, tracker }
    }

    pub async fn run(mut self) -> Result<()> {
        info!(address = %self.config.address.display(), "procd starting");

        if let Some(root) = self.config.root_pid {
            self.tracker
                .register_root_family(root)
                .map_err(ProcError::Family)
                .with_context(|| format!("registering root family {root}"))?;
        }

        if self.config.address.exists() {
            std::fs::remove_file(&self.config.address).with_context(|| {
                format!("removing stale socket {}", self.config.address.display())
            })?;
        }
        if let Some(parent) = self.config.address.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let listener = UnixListener::bind(&self.config.address)
            .with_context(|| format!("binding {}", self.config.address.display()))?;
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            std::fs::set_permissions(&self.config.address, perms)?;
        }

        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        info!(families = self.tracker.family_count(), "procd ready");
        if self.config.close_stderr_when_ready {
            close_stderr()?;
        }

        let mut root_check = tokio::time::interval(ROOT_CHECK_INTERVAL);

        loop {
            let deadline = self
                .tracker
                .last_snapshot()
                .map(Instant::from_std)
                .unwrap_or_else(Instant::now)
                + self.tracker.snapshot_interval();

            tokio::select! {
                conn = listener.accept() => {
                    match conn {
                        Ok((stream, _)) => {
                            if let Flow::Quit = self.handle_connection(stream).await {
                                info!("Quit requested");
                                break;
                            }
                        }
                        Err(e) => error!("Accept error: {}", e),
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    trace!("Periodic snapshot");
                    self.tracker.snapshot();
                }
                _ = root_check.tick() => {
                    if let Some(root) = self.config.root_pid.filter(|root| !self.tracker.process_alive(*root)) {
                        info!(root_pid = root, "Root process is gone");
                        break;
                    }
                }
                _ = sigterm.recv() => {
                    info!("Received SIGTERM");
                    break;
                }
                _ = sigint.recv() => {
                    info!("Received SIGINT");
                    break;
                }
            }
        }

        if self.config.address.exists() {
            std::fs::remove_file(&self.config.address)?;
        }
        info!("procd stopped");
        Ok(())
    }

    async fn handle_connection(&mut self, mut stream: UnixStream) -> Flow {
        let request = match tokio::time::timeout(REQUEST_TIMEOUT, Request::read_from(&mut stream)).await {
            Ok(Ok(request)) => request,
            Ok(Err(ProcError::Io(e))) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                trace!("Connection closed without a request");
                return Flow::Continue;
            }
            Ok(Err(e)) => {
                warn!("Bad request: {}", e);
                return Flow::Continue;
            }
            Err(_) => {
                warn!("Client sent no request within {:?}", REQUEST_TIMEOUT);
                return Flow::Continue;
            }
        };

        let command = request.command();
        let (response, flow) = match request {
            Request::Quit => (Response::ok(Payload::None), Flow::Quit),
            request => (self.handle_request(request), Flow::Continue),
        };
        debug!(?command, code = %response.code, "Handled request");

        match response.encode() {
            Ok(bytes) => {
                if let Err(e) = stream.write_all(&bytes).await {
                    warn!(?command, "Failed to send response: {}", e);
                }
            }
            Err(e) => error!(?command, "Failed to encode response: {}", e),
        }
        flow
    }

    fn handle_request(&mut self, request: Request) -> Response {
        let tracker = &mut self.tracker;
        match request {
            Request::RegisterSubfamily {
                root_pid,
                watcher_pid,
                max_snapshot_interval,
            } => {
                let watcher = (watcher_pid != 0).then_some(watcher_pid);
                let interval = Duration::from_secs(max_snapshot_interval.max(0) as u64);
                unit(tracker.register_subfamily(root_pid, watcher, interval))
            }
            Request::TrackViaEnvironment { pid, markers } => {
                unit(tracker.track_via_environment(pid, markers))
            }
            Request::TrackViaLogin { pid, login } => unit(tracker.track_via_login(pid, &login)),
            Request::TrackViaAllocatedSupplementaryGroup { pid } => {
                match tracker.track_via_allocated_group(pid) {
                    Ok(gid) => Response::ok(Payload::Gid(gid)),
                    Err(code) => code.into(),
                }
            }
            Request::TrackViaCgroup { pid, cgroup } => unit(tracker.track_via_cgroup(pid, &cgroup)),
            Request::SignalProcess { pid, signal } => match Signal::try_from(signal) {
                Ok(signal) => unit(tracker.signal_process(pid, signal)),
                Err(_) => ErrorCode::ProcessNotFound.into(),
            },
            Request::SuspendFamily { pid } => unit(tracker.suspend_family(pid)),
            Request::ContinueFamily { pid } => unit(tracker.continue_family(pid)),
            Request::KillFamily { pid } => unit(tracker.kill_family(pid)),
            Request::GetUsage { pid, mode } => match tracker.get_usage(pid, mode) {
                Ok(usage) => Response::ok(Payload::Usage(usage)),
                Err(code) => code.into(),
            },
            Request::UnregisterFamily { pid } => unit(tracker.unregister_family(pid)),
            Request::TakeSnapshot => {
                tracker.snapshot();
                Response::ok(Payload::None)
            }
            Request::Dump { pid } => match tracker.dump((pid != 0).then_some(pid)) {
                Ok(dump) => Response::ok(Payload::Dump(dump)),
                Err(code) => code.into(),
            },
            Request::Quit => Response::ok(Payload::None),
        }
    }
}

fn unit(result: FamilyResult<()>) -> Response {
    match result {
        Ok(()) => Response::ok(Payload::None),
        Err(code) => code.into(),
    }
}

fn close_stderr() -> Result<()> {
    let null = std::fs::OpenOptions::new()
        .write(true)
        .open("/dev/null")
        .context("opening /dev/null")?;
    nix::unistd::dup2(null.as_raw_fd(), 2).context("redirecting stderr")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::UsageMode;
    use crate::procd::ProcdClient;
    use crate::tracker::proc_table::fake::FakeHost;
    use crate::tracker::TrackerOptions;

    fn server_with(host: &FakeHost, address: PathBuf) -> ProcdServer {
        let tracker = FamilyTracker::new(host.clone(), TrackerOptions::default());
        ProcdServer::new(
            ServerConfig {
                address,
                root_pid: Some(1),
                close_stderr_when_ready: false,
            },
            tracker,
        )
    }

    async fn wait_for_socket(client: &ProcdClient) {
        for _ in 0..100 {
            if client.ping().await.is_ok() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("procd never came up");
    }

    #[tokio::test]
    async fn serves_requests_until_quit() {
        let dir = tempfile::tempdir().unwrap();
        let address = dir.path().join("procd.sock");
        let host = FakeHost::default();
        host.spawn(1, 0);
        host.spawn(1000, 1);
        host.spawn(1001, 1000);

        let server = tokio::spawn(server_with(&host, address.clone()).run());
        let client = ProcdClient::new(&address);
        wait_for_socket(&client).await;

        client
            .register_subfamily(1000, None, Duration::from_secs(60))
            .await
            .unwrap();
        let usage = client.get_usage(1000, UsageMode::Live).await.unwrap();
        assert_eq!(usage.num_procs, 2);

        let err = client.unregister_family(1).await.unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::UnregisterRoot));

        let dump = client.dump(None).await.unwrap();
        assert!(dump.iter().any(|family| family.root_pid == 1000));

        client.quit().await.unwrap();
        server.await.unwrap().unwrap();
        assert!(!address.exists());
    }

    #[tokio::test]
    async fn empty_connections_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let address = dir.path().join("procd.sock");
        let host = FakeHost::default();
        host.spawn(1, 0);

        let server = tokio::spawn(server_with(&host, address.clone()).run());
        let client = ProcdClient::new(&address);
        wait_for_socket(&client).await;
        client.ping().await.unwrap();
        client.snapshot().await.unwrap();
        client.quit().await.unwrap();
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn stops_when_the_root_process_exits() {
        let dir = tempfile::tempdir().unwrap();
        let address = dir.path().join("procd.sock");
        let host = FakeHost::default();
        host.spawn(1, 0);

        let server = tokio::spawn(server_with(&host, address.clone()).run());
        let client = ProcdClient::new(&address);
        wait_for_socket(&client).await;

        host.exit(1);
        tokio::time::timeout(ROOT_CHECK_INTERVAL * 3, server)
            .await
            .expect("procd outlived its root")
            .unwrap()
            .unwrap();
        assert!(!address.exists());
    }
}
