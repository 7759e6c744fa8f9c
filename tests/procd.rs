use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use procfamily::error::{ErrorCode, ProcError};
use procfamily::model::UsageMode;
use procfamily::procd::LifecycleState;
use procfamily::{ProcdClient, ProcdManager, ProcdOptions, ProcessScope};
use serial_test::serial;

fn options(dir: &Path, prefix: &str) -> ProcdOptions {
    ProcdOptions {
        prefix: prefix.to_string(),
        address_base: dir.join("procd"),
        binary: PathBuf::from(env!("CARGO_BIN_EXE_procd")),
        args: Vec::new(),
        log: Some(dir.join("procd.log")),
        max_snapshot_interval: Duration::from_secs(60),
        gid_range: None,
        restart_on_error: true,
        max_restart_attempts: 3,
        retry_delay: Duration::from_millis(50),
        abort_on_fatal: false,
        switchboard: None,
    }
}

#[tokio::test]
#[serial]
async fn family_lifecycle_through_a_real_daemon() {
    let dir = tempfile::tempdir().unwrap();
    let scope = ProcessScope::new();
    let mut manager = ProcdManager::start(options(dir.path(), "PFIT_DAEMON"), &scope)
        .await
        .unwrap();
    assert_eq!(manager.state(), LifecycleState::Ready);
    assert!(manager.procd_pid().is_some());
    assert_eq!(
        std::env::var_os("PFIT_DAEMON_PROCD_ADDRESS").map(PathBuf::from),
        Some(manager.address().to_path_buf())
    );

    let mut job = Command::new("sleep").arg("30").spawn().unwrap();
    let pid = job.id() as i32;

    manager
        .register_subfamily(pid, None, Duration::from_secs(5))
        .await
        .unwrap();
    assert!(matches!(
        manager.register_subfamily(pid, None, Duration::from_secs(5)).await,
        Err(ProcError::Family(ErrorCode::AlreadyRegistered))
    ));

    let usage = manager.get_usage(pid, UsageMode::Live).await.unwrap();
    assert!(usage.num_procs >= 1);

    let families = manager.dump(Some(pid)).await.unwrap();
    assert_eq!(families.len(), 1);
    assert!(families[0].members.iter().any(|m| m.pid == pid));

    // A second client sees the same daemon.
    let client = ProcdClient::new(manager.address());
    client.snapshot().await.unwrap();

    manager.kill_family(pid).await.unwrap();
    let status = job.wait().unwrap();
    assert!(!status.success());

    assert!(matches!(
        manager.get_usage(pid, UsageMode::Cached).await,
        Err(ProcError::Family(ErrorCode::FamilyNotFound))
    ));
    manager.unregister_family(pid).await.unwrap();
    assert!(matches!(
        manager.unregister_family(pid).await,
        Err(ProcError::Family(ErrorCode::FamilyNotFound))
    ));

    let address = manager.address().to_path_buf();
    manager.quit().await.unwrap();
    assert_eq!(manager.state(), LifecycleState::Stopped);
    manager.unregister_family(pid).await.unwrap();
    assert!(matches!(
        manager.snapshot().await,
        Err(ProcError::Fatal(_))
    ));

    drop(manager);
    assert!(std::env::var_os("PFIT_DAEMON_PROCD_ADDRESS").is_none());

    // The daemon removes its socket on the way out.
    for _ in 0..50 {
        if !address.exists() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(!address.exists());
}

#[tokio::test]
#[serial]
async fn a_killed_daemon_is_restarted() {
    let dir = tempfile::tempdir().unwrap();
    let scope = ProcessScope::new();
    let mut manager = ProcdManager::start(options(dir.path(), "PFIT_RESTART"), &scope)
        .await
        .unwrap();
    let first = manager.procd_pid().unwrap();

    nix::sys::signal::kill(
        nix::unistd::Pid::from_raw(first),
        nix::sys::signal::Signal::SIGKILL,
    )
    .unwrap();

    let me = std::process::id() as i32;
    let families = manager.dump(None).await.unwrap();
    assert!(families.iter().any(|f| f.root_pid == me));
    let second = manager.procd_pid().unwrap();
    assert_ne!(first, second);
    assert_eq!(manager.state(), LifecycleState::Ready);
    assert!(manager.restart_attempts() >= 1);

    manager.quit().await.unwrap();
}
