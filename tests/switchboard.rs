use std::fs::File;
use std::io::Read;

use nix::fcntl::OFlag;
use nix::sys::stat::Mode;
use nix::unistd::{getgid, getuid};
use procfamily::error::ProcError;
use procfamily::privsep::{ExecRequest, StdStream, SwitchboardClient};

fn client() -> SwitchboardClient {
    SwitchboardClient::new(env!("CARGO_BIN_EXE_switchboard"))
}

fn ids() -> (u32, u32) {
    (getuid().as_raw(), getgid().as_raw())
}

#[tokio::test]
async fn opened_descriptor_reads_the_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("greeting");
    std::fs::write(&path, "hello from the other side").unwrap();
    let (uid, gid) = ids();

    let fd = client()
        .open(uid, gid, &path, OFlag::O_RDONLY, Mode::empty())
        .await
        .unwrap();
    let mut text = String::new();
    File::from(fd).read_to_string(&mut text).unwrap();
    assert_eq!(text, "hello from the other side");
}

#[tokio::test]
async fn opening_a_missing_file_fails() {
    let dir = tempfile::tempdir().unwrap();
    let (uid, gid) = ids();
    let err = client()
        .open(uid, gid, &dir.path().join("absent"), OFlag::O_RDONLY, Mode::empty())
        .await
        .unwrap_err();
    assert!(matches!(err, ProcError::Protocol(_)), "{err:?}");
    assert!(err.to_string().contains("absent"), "{err}");
}

#[tokio::test]
async fn one_shot_file_operations() {
    let dir = tempfile::tempdir().unwrap();
    let (uid, gid) = ids();
    let sb = client();

    let sub = dir.path().join("sub");
    sb.mkdir(uid, gid, &sub, Mode::from_bits_truncate(0o750))
        .await
        .unwrap();
    assert!(sub.is_dir());

    let file = sub.join("a");
    std::fs::write(&file, "12345").unwrap();
    sb.chmod(uid, gid, &file, Mode::from_bits_truncate(0o600))
        .await
        .unwrap();
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(&file).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    let moved = sub.join("b");
    sb.rename(uid, gid, &file, &moved).await.unwrap();
    assert!(moved.exists() && !file.exists());

    sb.chown(uid, gid, &moved, uid, gid).await.unwrap();

    let err = sb
        .mkdir(uid, gid, &sub, Mode::from_bits_truncate(0o750))
        .await
        .unwrap_err();
    assert!(matches!(err, ProcError::Switchboard { .. }), "{err}");

    let usage = sb.directory_usage(uid, dir.path()).await.unwrap();
    assert_eq!(usage.files, 1);
    assert_eq!(usage.bytes, 5);
}

#[tokio::test]
async fn exec_becomes_the_job() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("out");
    let (uid, _) = ids();

    let mut request = ExecRequest::new(uid, "/bin/sh")
        .arg("-c")
        .arg("echo \"$GREETING\" from $(pwd)")
        .env("GREETING", "hi");
    request.init_dir = Some(dir.path().to_path_buf());
    request.stdin = StdStream::Null;
    request.stdout = StdStream::Path(out.clone());
    request.std_universe = true;

    let mut child = client().spawn(request).await.unwrap();
    let status = child.wait().await.unwrap();
    assert!(status.success());

    let text = std::fs::read_to_string(&out).unwrap();
    let cwd = dir.path().canonicalize().unwrap();
    assert_eq!(text.trim(), format!("hi from {}", cwd.display()));
}

#[tokio::test]
async fn exec_of_a_missing_binary_is_reported() {
    let (uid, _) = ids();
    let err = client()
        .spawn(ExecRequest::new(uid, "/nonexistent/job"))
        .await
        .unwrap_err();
    match err {
        ProcError::Switchboard { op, detail } => {
            assert_eq!(op, "exec");
            assert!(detail.contains("/nonexistent/job"), "{detail}");
        }
        other => panic!("unexpected error: {other}"),
    }
}
