//! Owning a procd: starting it, sharing it with descendants, bringing it back
//! after a crash, and shutting it down.

use super::ProcdClient;
use crate::clienv;
use crate::config::{GidRange, TrackerConfig};
use crate::error::{ProcError, Result};
use crate::model::{EnvMarker, FamilyDump, UsageMode, UsageSnapshot};
use crate::privsep::{ExecRequest, StdStream, SwitchboardClient};
use crate::scope::{ProcessScope, ProxyClaim};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::future::Future;
use std::io::Read;
use std::os::fd::OwnedFd;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::{debug, error, info, warn};

/// How a [`ProcdManager`] finds, starts and restarts its daemon.
#[derive(Debug, Clone)]
pub struct ProcdOptions {
    /// Prefix of the exported `<PREFIX>_PROCD_ADDRESS*` variables.
    pub prefix: String,
    /// The daemon listens at `<address_base>.<our pid>`.
    pub address_base: PathBuf,
    pub binary: PathBuf,
    /// Placed before the arguments the manager adds.
    pub args: Vec<String>,
    pub log: Option<PathBuf>,
    pub max_snapshot_interval: Duration,
    pub gid_range: Option<GidRange>,
    pub restart_on_error: bool,
    pub max_restart_attempts: u32,
    pub retry_delay: Duration,
    /// Abort the process on an unrecoverable daemon; otherwise return `Fatal`.
    pub abort_on_fatal: bool,
    /// Launch the daemon through this switchboard helper.
    pub switchboard: Option<PathBuf>,
}

impl ProcdOptions {
    pub fn from_config(config: &TrackerConfig) -> Self {
        let procd = &config.procd;
        Self {
            prefix: config.prefix.clone(),
            address_base: procd.address.clone(),
            binary: procd.binary_path(),
            args: procd.args.clone(),
            log: procd.log.clone(),
            max_snapshot_interval: procd.max_snapshot_interval(),
            gid_range: procd.gid_range,
            restart_on_error: procd.restart_on_error,
            max_restart_attempts: procd.max_restart_attempts,
            retry_delay: procd.retry_delay(),
            abort_on_fatal: procd.abort_on_fatal,
            switchboard: config
                .switchboard
                .enabled
                .then(|| config.switchboard.path.clone()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    NotStarted,
    Starting,
    Ready,
    Recovering,
    Fatal,
    Stopped,
}

/// The one procd proxy of this process.
pub struct ProcdManager {
    options: ProcdOptions,
    scope: ProcessScope,
    _claim: ProxyClaim,
    state: LifecycleState,
    address: PathBuf,
    client: Option<ProcdClient>,
    /// Set while we own the running daemon.
    procd_pid: Option<i32>,
    owns_daemon: bool,
    /// Last daemon pid the reaper saw exit, 0 for none.
    dead_pid: Arc<AtomicI32>,
    exported: bool,
    restart_attempts: u32,
}

impl ProcdManager {
    /// Joins the procd an ancestor exported, or spawns our own.
    pub async fn start(options: ProcdOptions, scope: &ProcessScope) -> Result<Self> {
        let claim = scope.claim_procd_proxy()?;
        let own_address = with_pid_suffix(&options.address_base, std::process::id());

        let mut manager = Self {
            scope: scope.clone(),
            _claim: claim,
            state: LifecycleState::NotStarted,
            address: own_address,
            client: None,
            procd_pid: None,
            owns_daemon: false,
            dead_pid: Arc::new(AtomicI32::new(0)),
            exported: false,
            restart_attempts: 0,
            options,
        };

        let inherited = clienv::inherited_procd_address_base(&manager.options.prefix)
            .filter(|base| *base == manager.options.address_base)
            .and_then(|_| clienv::inherited_procd_address(&manager.options.prefix));
        if let Some(address) = inherited {
            info!(address = %address.display(), "Using procd shared by an ancestor");
            manager.address = address.clone();
            manager.client = Some(ProcdClient::new(address));
            manager.state = LifecycleState::Ready;
            return Ok(manager);
        }

        manager.state = LifecycleState::Starting;
        manager.owns_daemon = true;
        if let Err(e) = manager.spawn_daemon().await {
            manager.state = LifecycleState::NotStarted;
            return Err(e);
        }
        manager.export_address();
        manager.state = LifecycleState::Ready;
        Ok(manager)
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn address(&self) -> &Path {
        &self.address
    }

    /// Pid of the daemon we spawned, while it runs.
    pub fn procd_pid(&self) -> Option<i32> {
        self.procd_pid
    }

    /// Attempts made by the most recent recovery.
    pub fn restart_attempts(&self) -> u32 {
        self.restart_attempts
    }

    fn daemon_command_args(&self) -> Vec<String> {
        let mut args = self.options.args.clone();
        args.extend([
            "--address".to_string(),
            self.address.display().to_string(),
            "--root-pid".to_string(),
            std::process::id().to_string(),
            "--max-snapshot-interval".to_string(),
            self.options.max_snapshot_interval.as_secs().to_string(),
            "--close-stderr-when-ready".to_string(),
        ]);
        if let Some(range) = self.options.gid_range {
            args.extend(["--gid-range".to_string(), range.to_string()]);
        }
        if let Some(log) = &self.options.log {
            args.extend(["--log".to_string(), log.display().to_string()]);
        }
        args
    }

    /// Starts the daemon and waits for its stderr to close.
    async fn spawn_daemon(&mut self) -> Result<()> {
        let (mut ready_reader, ready_writer) = std::io::pipe()?;
        let args = self.daemon_command_args();
        let child = match &self.options.switchboard {
            Some(helper) => {
                self.launch_through_switchboard(helper, args, ready_writer.into())
                    .await?
            }
            None => self.launch_directly(args, ready_writer.into())?,
        };

        let pid = child
            .id()
            .map(|id| id as i32)
            .ok_or_else(|| ProcError::Startup("procd exited before it could be tracked".into()))?;
        let dead = Arc::clone(&self.dead_pid);
        self.scope.reaper().register(pid, move |pid, status| {
            debug!(pid, ?status, "procd exited");
            dead.store(pid, Ordering::SeqCst);
        });
        self.scope.reaper().watch(child);

        let handshake = tokio::task::spawn_blocking(move || {
            let mut bytes = Vec::new();
            ready_reader.read_to_end(&mut bytes).map(|_| bytes)
        })
        .await
        .map_err(|e| ProcError::Startup(format!("handshake task failed: {e}")))??;

        if !handshake.is_empty() {
            let message = String::from_utf8_lossy(&handshake).trim().to_string();
            warn!(pid, "procd failed to start: {}", message);
            self.scope.reaper().cancel(pid);
            let _ = kill(Pid::from_raw(pid), Signal::SIGKILL);
            return Err(ProcError::Startup(message));
        }

        info!(pid, address = %self.address.display(), "procd is ready");
        self.procd_pid = Some(pid);
        self.client = Some(ProcdClient::new(&self.address));
        Ok(())
    }

    fn launch_directly(&self, args: Vec<String>, stderr: OwnedFd) -> Result<Child> {
        let mut command = Command::new(&self.options.binary);
        command
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::from(stderr));
        let child = command.spawn().map_err(|e| {
            ProcError::Startup(format!("cannot run {}: {e}", self.options.binary.display()))
        })?;
        // Our copy of the pipe's write end goes away with the command.
        drop(command);
        Ok(child)
    }

    async fn launch_through_switchboard(
        &self,
        helper: &Path,
        args: Vec<String>,
        stderr: OwnedFd,
    ) -> Result<Child> {
        let mut request = ExecRequest::new(nix::unistd::getuid().as_raw(), &self.options.binary);
        request.args.extend(args.into_iter().map(Into::into));
        request.env = std::env::vars_os().collect();
        request.stdin = StdStream::Null;
        request.stdout = StdStream::Null;
        request.stderr = StdStream::Fd(stderr);
        SwitchboardClient::new(helper).spawn(request).await
    }

    fn export_address(&mut self) {
        let prefix = &self.options.prefix;
        std::env::set_var(clienv::address_base_var(prefix), &self.options.address_base);
        std::env::set_var(clienv::address_var(prefix), &self.address);
        self.exported = true;
    }

    fn withdraw_address(&mut self) {
        if self.exported {
            let prefix = &self.options.prefix;
            std::env::remove_var(clienv::address_base_var(prefix));
            std::env::remove_var(clienv::address_var(prefix));
            self.exported = false;
        }
    }

    fn daemon_died(&self) -> bool {
        let dead = self.dead_pid.load(Ordering::SeqCst);
        dead != 0 && self.procd_pid == Some(dead)
    }

    fn fatal(&mut self, reason: String) -> ProcError {
        self.state = LifecycleState::Fatal;
        self.client = None;
        error!("procd cannot be recovered: {}", reason);
        if self.options.abort_on_fatal {
            std::process::abort();
        }
        ProcError::Fatal(reason)
    }

    /// Brings the daemon back, or gives up for good.
    async fn recover(&mut self) -> Result<()> {
        if !self.options.restart_on_error {
            return Err(self.fatal("procd failed and automatic restart is disabled".into()));
        }
        self.state = LifecycleState::Recovering;
        self.client = None;
        self.restart_attempts = 0;

        if let Some(old) = self.procd_pid.take() {
            self.scope.reaper().cancel(old);
            let _ = kill(Pid::from_raw(old), Signal::SIGKILL);
        }

        while self.restart_attempts < self.options.max_restart_attempts {
            self.restart_attempts += 1;
            let attempt = self.restart_attempts;
            if self.owns_daemon {
                info!(attempt, "Restarting procd");
                match self.spawn_daemon().await {
                    Ok(()) => {
                        self.state = LifecycleState::Ready;
                        return Ok(());
                    }
                    Err(e) => warn!(attempt, "procd restart failed: {}", e),
                }
            } else {
                tokio::time::sleep(self.options.retry_delay).await;
                let client = ProcdClient::new(&self.address);
                match client.ping().await {
                    Ok(()) => {
                        info!(attempt, "Shared procd is reachable again");
                        self.client = Some(client);
                        self.state = LifecycleState::Ready;
                        return Ok(());
                    }
                    Err(e) => warn!(attempt, "Shared procd still unreachable: {}", e),
                }
            }
        }
        let attempts = self.restart_attempts;
        Err(self.fatal(format!("gave up after {attempts} restart attempts")))
    }

    /// Runs `op` against the daemon, recovering and retrying on
    /// communication failure.
    async fn call<T, F, Fut>(&mut self, op: &'static str, f: F) -> Result<T>
    where
        F: Fn(ProcdClient) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut tries = 0;
        loop {
            match self.state {
                LifecycleState::Stopped => return Err(ProcError::Fatal("procd was stopped".into())),
                LifecycleState::Fatal => return Err(ProcError::Fatal("procd is gone".into())),
                _ => {}
            }
            if self.daemon_died() {
                warn!(op, pid = ?self.procd_pid, "procd died");
                self.recover().await?;
            }
            let Some(client) = self.client.clone() else {
                self.recover().await?;
                continue;
            };

            match f(client).await {
                Err(e) if e.is_communication_failure() => {
                    tries += 1;
                    warn!(op, tries, "procd call failed: {}", e);
                    if tries > self.options.max_restart_attempts {
                        return Err(self.fatal(format!("{op} keeps failing: {e}")));
                    }
                    self.recover().await?;
                }
                result => return result,
            }
        }
    }

    pub async fn register_subfamily(
        &mut self,
        root_pid: i32,
        watcher_pid: Option<i32>,
        max_snapshot_interval: Duration,
    ) -> Result<()> {
        self.call("register_subfamily", |c| async move {
            c.register_subfamily(root_pid, watcher_pid, max_snapshot_interval)
                .await
        })
        .await
    }

    pub async fn track_family_via_environment(
        &mut self,
        pid: i32,
        markers: &[EnvMarker],
    ) -> Result<()> {
        self.call("track_family_via_environment", |c| {
            let markers = markers.to_vec();
            async move { c.track_family_via_environment(pid, &markers).await }
        })
        .await
    }

    pub async fn track_family_via_login(&mut self, pid: i32, login: &str) -> Result<()> {
        self.call("track_family_via_login", |c| {
            let login = login.to_string();
            async move { c.track_family_via_login(pid, &login).await }
        })
        .await
    }

    pub async fn track_family_via_allocated_supplementary_group(&mut self, pid: i32) -> Result<u32> {
        self.call("track_family_via_allocated_supplementary_group", |c| async move {
            c.track_family_via_allocated_supplementary_group(pid).await
        })
        .await
    }

    pub async fn track_family_via_cgroup(&mut self, pid: i32, cgroup: &str) -> Result<()> {
        self.call("track_family_via_cgroup", |c| {
            let cgroup = cgroup.to_string();
            async move { c.track_family_via_cgroup(pid, &cgroup).await }
        })
        .await
    }

    pub async fn signal_process(&mut self, pid: i32, signal: Signal) -> Result<()> {
        self.call("signal_process", |c| async move { c.signal_process(pid, signal).await })
            .await
    }

    pub async fn suspend_family(&mut self, pid: i32) -> Result<()> {
        self.call("suspend_family", |c| async move { c.suspend_family(pid).await })
            .await
    }

    pub async fn continue_family(&mut self, pid: i32) -> Result<()> {
        self.call("continue_family", |c| async move { c.continue_family(pid).await })
            .await
    }

    pub async fn kill_family(&mut self, pid: i32) -> Result<()> {
        self.call("kill_family", |c| async move { c.kill_family(pid).await })
            .await
    }

    pub async fn get_usage(&mut self, pid: i32, mode: UsageMode) -> Result<UsageSnapshot> {
        self.call("get_usage", |c| async move { c.get_usage(pid, mode).await })
            .await
    }

    /// Trivially succeeds once the daemon has been shut down.
    pub async fn unregister_family(&mut self, pid: i32) -> Result<()> {
        if self.state == LifecycleState::Stopped {
            debug!(pid, "procd stopped, nothing to unregister");
            return Ok(());
        }
        self.call("unregister_family", |c| async move { c.unregister_family(pid).await })
            .await
    }

    pub async fn snapshot(&mut self) -> Result<()> {
        self.call("snapshot", |c| async move { c.snapshot().await })
            .await
    }

    pub async fn dump(&mut self, pid: Option<i32>) -> Result<Vec<FamilyDump>> {
        self.call("dump", |c| async move { c.dump(pid).await }).await
    }

    /// Stops a daemon we own and withdraws the exported address. A shared
    /// daemon is left running for its owner.
    pub async fn quit(&mut self) -> Result<()> {
        if self.state == LifecycleState::Stopped {
            return Ok(());
        }
        let result = match (&self.client, self.owns_daemon) {
            (Some(client), true) => client.quit().await,
            _ => Ok(()),
        };
        if let Some(pid) = self.procd_pid.take() {
            self.scope.reaper().cancel(pid);
        }
        self.withdraw_address();
        self.client = None;
        self.state = LifecycleState::Stopped;
        info!(address = %self.address.display(), "procd proxy stopped");
        result
    }
}

impl Drop for ProcdManager {
    fn drop(&mut self) {
        if self.owns_daemon && self.state != LifecycleState::Stopped {
            if let Some(pid) = self.procd_pid.take() {
                debug!(pid, "Stopping procd on drop");
                self.scope.reaper().cancel(pid);
                let _ = kill(Pid::from_raw(pid), Signal::SIGTERM);
            }
        }
        self.withdraw_address();
    }
}

fn with_pid_suffix(base: &Path, pid: u32) -> PathBuf {
    let mut name = base.as_os_str().to_os_string();
    name.push(format!(".{pid}"));
    PathBuf::from(name)
}
