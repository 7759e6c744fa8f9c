//! The privileged side: what `switchboard` does for each operation.
//!
//! Everything here runs synchronously in a short-lived process. One-shot
//! operations act with the caller's uid/gid as effective ids and report
//! failure as an `Err`, which the binary prints to stderr. Pipe operations
//! report through the error descriptor they were handed.

use super::fd_passing;
use super::request::{DirUsageConfig, ExecConfig, SwitchboardInput};
use anyhow::{anyhow, bail, Context, Result};
use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use nix::unistd::{self, Gid, Uid, User};
use std::convert::Infallible;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::os::fd::{AsFd, AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::fs::{DirBuilderExt, MetadataExt, OpenOptionsExt, PermissionsExt};
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::Command;

/// Effective ids switched for the lifetime of the guard.
struct Acting {
    restore: Option<(Uid, Gid)>,
}

impl Acting {
    fn as_user(uid: u32, gid: u32) -> Result<Self> {
        let (uid, gid) = (Uid::from_raw(uid), Gid::from_raw(gid));
        if !unistd::geteuid().is_root() {
            if uid != unistd::getuid() || gid != unistd::getgid() {
                bail!("switchboard is not privileged and cannot act as {uid}:{gid}");
            }
            return Ok(Self { restore: None });
        }
        if uid.is_root() {
            return Ok(Self { restore: None });
        }
        let saved = (unistd::geteuid(), unistd::getegid());
        unistd::setegid(gid).with_context(|| format!("setegid({gid})"))?;
        unistd::seteuid(uid).with_context(|| format!("seteuid({uid})"))?;
        Ok(Self {
            restore: Some(saved),
        })
    }
}

impl Drop for Acting {
    fn drop(&mut self) {
        if let Some((uid, gid)) = self.restore.take() {
            let _ = unistd::seteuid(uid);
            let _ = unistd::setegid(gid);
        }
    }
}

/// Opens `path` as the user and sends the descriptor over our stdin socket.
pub fn open_and_send(uid: u32, gid: u32, path: &Path, flags: i32, mode: u32) -> Result<()> {
    let file = {
        let _acting = Acting::as_user(uid, gid)?;
        let access = flags & libc::O_ACCMODE;
        OpenOptions::new()
            .read(access == libc::O_RDONLY || access == libc::O_RDWR)
            .write(access == libc::O_WRONLY || access == libc::O_RDWR)
            .custom_flags(flags & !libc::O_ACCMODE)
            .mode(mode)
            .open(path)
            .with_context(|| format!("open {}", path.display()))?
    };
    let socket = std::io::stdin();
    fd_passing::send_fd(&socket, file.as_fd()).context("sending descriptor")?;
    Ok(())
}

pub fn mkdir(uid: u32, gid: u32, path: &Path, mode: u32) -> Result<()> {
    let _acting = Acting::as_user(uid, gid)?;
    std::fs::DirBuilder::new()
        .mode(mode)
        .create(path)
        .with_context(|| format!("mkdir {}", path.display()))
}

pub fn chmod(uid: u32, gid: u32, path: &Path, mode: u32) -> Result<()> {
    let _acting = Acting::as_user(uid, gid)?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
        .with_context(|| format!("chmod {}", path.display()))
}

pub fn rename(uid: u32, gid: u32, from: &Path, to: &Path) -> Result<()> {
    let _acting = Acting::as_user(uid, gid)?;
    std::fs::rename(from, to)
        .with_context(|| format!("rename {} to {}", from.display(), to.display()))
}

/// Gives away a file the acting user owns. Needs real privilege unless
/// nothing actually changes hands.
pub fn chown(uid: u32, gid: u32, path: &Path, new_uid: u32, new_gid: u32) -> Result<()> {
    let owner = {
        let _acting = Acting::as_user(uid, gid)?;
        std::fs::symlink_metadata(path)
            .with_context(|| format!("stat {}", path.display()))?
            .uid()
    };
    if uid != 0 && owner != uid {
        bail!("{} is owned by uid {owner}, not {uid}", path.display());
    }
    std::os::unix::fs::lchown(path, Some(new_uid), Some(new_gid))
        .with_context(|| format!("chown {} to {new_uid}:{new_gid}", path.display()))
}

/// Takes ownership of a descriptor number given on our command line.
///
/// # Safety
/// `fd` must be open in this process and used by nothing else.
pub unsafe fn adopt_fd(fd: RawFd) -> Result<OwnedFd> {
    if fd < 0 {
        bail!("bad descriptor {fd}");
    }
    fcntl(fd, FcntlArg::F_GETFD).with_context(|| format!("descriptor {fd} is not open"))?;
    // SAFETY: guaranteed by the caller.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Reads an exec configuration from `input` and becomes the job. Returns only
/// on failure, after writing the reason to `errors`.
pub fn exec_from_pipe(input: OwnedFd, errors: OwnedFd) -> i32 {
    let mut errors = File::from(errors);
    let outcome = set_cloexec(errors.as_raw_fd())
        .and_then(|_| read_input(input))
        .and_then(|input| ExecConfig::from_input(&input).map_err(|e| anyhow!(e)))
        .and_then(become_job);
    let err = match outcome {
        Ok(never) => match never {},
        Err(err) => err,
    };
    let _ = write!(errors, "{err:#}");
    1
}

/// Measures a directory as the user and writes `<bytes> <files>` to `errors`.
pub fn dirusage_from_pipe(input: OwnedFd, errors: OwnedFd) -> i32 {
    let mut errors = File::from(errors);
    let outcome = read_input(input)
        .and_then(|input| DirUsageConfig::from_input(&input).map_err(|e| anyhow!(e)))
        .and_then(|config| {
            let user = User::from_uid(Uid::from_raw(config.uid))?
                .ok_or_else(|| anyhow!("no user with uid {}", config.uid))?;
            let _acting = Acting::as_user(config.uid, user.gid.as_raw())?;
            directory_usage(&config.path)
        });
    match outcome {
        Ok((bytes, files)) => {
            let _ = write!(errors, "{bytes} {files}");
            0
        }
        Err(err) => {
            let _ = write!(errors, "{err:#}");
            1
        }
    }
}

fn read_input(input: OwnedFd) -> Result<SwitchboardInput> {
    let mut bytes = Vec::new();
    File::from(input)
        .read_to_end(&mut bytes)
        .context("reading input pipe")?;
    SwitchboardInput::parse(bytes.as_slice()).map_err(|e| anyhow!(e))
}

fn set_cloexec(fd: RawFd) -> Result<()> {
    fcntl(fd, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))?;
    Ok(())
}

fn become_job(config: ExecConfig) -> Result<Infallible> {
    let user = User::from_uid(Uid::from_raw(config.uid))?
        .ok_or_else(|| anyhow!("no user with uid {}", config.uid))?;

    if unistd::geteuid().is_root() {
        let mut groups = vec![user.gid];
        groups.extend(config.tracking_group.map(Gid::from_raw));
        unistd::setgroups(&groups).context("setgroups")?;
        unistd::setgid(user.gid).with_context(|| format!("setgid({})", user.gid))?;
        unistd::setuid(user.uid).with_context(|| format!("setuid({})", user.uid))?;
    } else if user.uid != unistd::getuid() {
        bail!("switchboard is not privileged and cannot run jobs as {}", user.name);
    } else if config.tracking_group.is_some() {
        bail!("a tracking group needs a privileged switchboard");
    }

    if let Some(dir) = &config.init_dir {
        unistd::chdir(dir.as_path()).with_context(|| format!("chdir {}", dir.display()))?;
    }

    // Opened after dropping privileges, so the user's permissions apply.
    let redirects = [
        (&config.stdin, 0, false),
        (&config.stdout, 1, true),
        (&config.stderr, 2, true),
    ];
    for (path, target, write) in redirects {
        let Some(path) = path else { continue };
        let file = OpenOptions::new()
            .read(!write)
            .write(write)
            .create(write)
            .append(write)
            .mode(0o644)
            .open(path)
            .with_context(|| format!("open {}", path.display()))?;
        unistd::dup2(file.as_raw_fd(), target)
            .with_context(|| format!("redirecting fd {target} to {}", path.display()))?;
    }

    for fd in &config.keep_open_fds {
        fcntl(*fd, FcntlArg::F_SETFD(FdFlag::empty()))
            .with_context(|| format!("keeping fd {fd} open"))?;
    }

    let mut command = Command::new(&config.path);
    if let Some((arg0, rest)) = config.args.split_first() {
        command.arg0(arg0).args(rest);
    }
    command.env_clear().envs(config.env.iter().map(|(k, v)| (k, v)));
    if config.std_universe {
        // SAFETY: setsid is async-signal-safe.
        unsafe {
            command.pre_exec(|| {
                unistd::setsid()?;
                Ok(())
            });
        }
    }
    let err = command.exec();
    Err(anyhow!(err).context(format!("exec {}", config.path.display())))
}

/// Apparent size and count of regular files below `root`, symlinks not followed.
pub fn directory_usage(root: &Path) -> Result<(u64, u64)> {
    let mut bytes = 0u64;
    let mut files = 0u64;
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let entries =
            std::fs::read_dir(&dir).with_context(|| format!("reading {}", dir.display()))?;
        for entry in entries {
            let entry = entry?;
            let meta = entry.metadata()?;
            if meta.is_dir() {
                pending.push(entry.path());
            } else {
                bytes += meta.len();
                files += 1;
            }
        }
    }
    Ok((bytes, files))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn me() -> (u32, u32) {
        (unistd::getuid().as_raw(), unistd::getgid().as_raw())
    }

    #[test]
    fn one_shot_ops_as_ourselves() {
        let dir = tempfile::tempdir().unwrap();
        let (uid, gid) = me();

        let made = dir.path().join("made");
        mkdir(uid, gid, &made, 0o750).unwrap();
        assert_eq!(std::fs::metadata(&made).unwrap().mode() & 0o777, 0o750);

        chmod(uid, gid, &made, 0o700).unwrap();
        assert_eq!(std::fs::metadata(&made).unwrap().mode() & 0o777, 0o700);

        let moved = dir.path().join("moved");
        rename(uid, gid, &made, &moved).unwrap();
        assert!(moved.is_dir() && !made.exists());

        chown(uid, gid, &moved, uid, gid).unwrap();
    }

    #[test]
    fn mkdir_reports_the_path() {
        let dir = tempfile::tempdir().unwrap();
        let (uid, gid) = me();
        let err = mkdir(uid, gid, &dir.path().join("a/b"), 0o755).unwrap_err();
        assert!(format!("{err:#}").contains("a/b"));
    }

    #[test]
    fn usage_counts_nested_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("one"), [0u8; 100]).unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/two"), [0u8; 28]).unwrap();
        assert_eq!(directory_usage(dir.path()).unwrap(), (128, 2));
    }

    #[test]
    fn exec_failure_lands_on_the_error_pipe() {
        let (in_reader, mut in_writer) = std::io::pipe().unwrap();
        let (mut err_reader, err_writer) = std::io::pipe().unwrap();
        let (uid, _) = me();
        write!(in_writer, "user-uid={uid}\nexec-path=/nonexistent/binary\n").unwrap();
        drop(in_writer);

        let code = exec_from_pipe(OwnedFd::from(in_reader), OwnedFd::from(err_writer));
        assert_eq!(code, 1);
        let mut text = String::new();
        err_reader.read_to_string(&mut text).unwrap();
        assert!(text.contains("/nonexistent/binary"), "{text}");
    }
}
