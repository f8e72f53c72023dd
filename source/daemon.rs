// Daemonization and privilege drop, grounded on `main()`'s pre/post-privilege-drop setup
// (milter.c ~1120-1359): pidfile locking, `chuid()`-equivalent privilege drop, and the
// fork/setsid/stdio-redirect dance. Reimplemented against `nix`/`fd-lock` instead of raw libc
// calls, per examples/other_examples KumoCorp-kumomta's precedent for this kind of syscall glue.

use anyhow::Context as _;
use std::fs;
use std::io::Write as _;
use std::os::unix::io::AsRawFd as _;
use std::path::Path;

/// Opens (creating if absent) and locks the pidfile, without writing to it yet -- the PID is
/// only known (and written) after daemonizing, same as the reference.
pub struct Pidfile {
  path: Option<std::path::PathBuf>,
  lock: Option<fd_lock::RwLock<fs::File>>,
}

impl Pidfile {
  pub fn open(path: Option<&str>) -> anyhow::Result<Pidfile> {
    let Some(path) = path else { return Ok(Pidfile { path: None, lock: None }) };
    let file = fs::OpenOptions::new()
      .read(true)
      .write(true)
      .create(true)
      .open(path)
      .with_context(|| format!("couldn't open pidfile {path}"))?;
    set_cloexec(&file)?;
    let mut lock = fd_lock::RwLock::new(file);
    lock
      .try_write()
      .with_context(|| format!("pidfile {path} is already locked, another instance running?"))?;
    Ok(Pidfile { path: Some(path.into()), lock: Some(lock) })
  }

  /// Writes the current process id, called after daemonizing so the written pid is accurate.
  pub fn write_pid(&mut self) -> anyhow::Result<()> {
    let Some(lock) = self.lock.as_mut() else { return Ok(()) };
    let mut guard = lock.try_write().context("couldn't re-lock pidfile")?;
    guard.set_len(0).context("couldn't truncate pidfile")?;
    use std::io::Seek as _;
    guard.seek(std::io::SeekFrom::Start(0)).context("couldn't seek pidfile")?;
    writeln!(guard, "{}", std::process::id()).context("couldn't write pidfile")?;
    guard.flush().context("couldn't flush pidfile")?;
    Ok(())
  }

  /// Truncates and removes the pidfile, mirroring the reference's exit-time cleanup. `rootdir`
  /// is passed so the unlink is skipped when chrooted (the reference only unlinks outside a
  /// chroot, since the path is meaningless relative to the host filesystem after exiting).
  pub fn cleanup(&mut self, rootdir_was_set: bool) {
    if let Some(lock) = self.lock.as_mut() {
      if let Ok(mut guard) = lock.try_write() {
        let _ = guard.set_len(0);
      }
    }
    if !rootdir_was_set {
      if let Some(path) = &self.path {
        let _ = fs::remove_file(path);
      }
    }
  }
}

fn set_cloexec(file: &fs::File) -> anyhow::Result<()> {
  let fd = file.as_raw_fd();
  let flags = nix::fcntl::fcntl(fd, nix::fcntl::FcntlArg::F_GETFD).context("fcntl(F_GETFD) failed")?;
  nix::fcntl::fcntl(
    fd,
    nix::fcntl::FcntlArg::F_SETFD(nix::fcntl::FdFlag::from_bits_truncate(flags) | nix::fcntl::FdFlag::FD_CLOEXEC),
  )
  .context("fcntl(F_SETFD) failed")?;
  Ok(())
}

/// Drops privileges to `user`[:`group`], optionally chrooting to `rootdir` first, mirroring
/// `chuid()`: resolve the user/group, chroot+chdir if requested, `initgroups`, then
/// `setresgid`/`setresuid`, verifying afterwards that privileges can't be regained.
pub fn drop_privileges(user: &str, group: Option<&str>, rootdir: Option<&Path>) -> anyhow::Result<()> {
  let passwd = users::get_user_by_name(user).with_context(|| format!("unknown user '{user}'"))?;
  let gid = match group {
    Some(group) => users::get_group_by_name(group)
      .with_context(|| format!("unknown group '{group}'"))?
      .gid(),
    None => passwd.primary_group_id(),
  };
  let uid = passwd.uid();

  if let Some(rootdir) = rootdir {
    nix::unistd::chroot(rootdir).with_context(|| format!("chroot({rootdir:?}) failed"))?;
    std::env::set_current_dir("/").context("chdir(/) after chroot failed")?;
  }

  nix::unistd::initgroups(
    &std::ffi::CString::new(user).context("user name contains a NUL byte")?,
    nix::unistd::Gid::from_raw(gid),
  )
  .context("initgroups() failed")?;
  nix::unistd::setresgid(
    nix::unistd::Gid::from_raw(gid),
    nix::unistd::Gid::from_raw(gid),
    nix::unistd::Gid::from_raw(gid),
  )
  .context("setresgid() failed")?;
  nix::unistd::setresuid(
    nix::unistd::Uid::from_raw(uid),
    nix::unistd::Uid::from_raw(uid),
    nix::unistd::Uid::from_raw(uid),
  )
  .context("setresuid() failed")?;

  anyhow::ensure!(
    nix::unistd::setresuid(
      nix::unistd::Uid::from_raw(u32::MAX),
      nix::unistd::Uid::from_raw(0),
      nix::unistd::Uid::from_raw(u32::MAX)
    )
    .is_err(),
    "privileges can be regained after dropping them, aborting"
  );

  Ok(())
}

/// Forks into the background, detaches from the controlling terminal, and redirects stdio to
/// `/dev/null`, mirroring `daemon(0, 1)` plus the reference's stdio redirect step. Returns
/// without forking (a no-op) if `foreground` is set.
pub fn daemonize(foreground: bool) -> anyhow::Result<()> {
  if foreground {
    return Ok(());
  }

  // SAFETY: fork() is called before any additional threads are spawned (the SHA-1 self-test and
  // argument parsing above run single-threaded), so there's no risk of forking with another
  // thread mid-allocation.
  match unsafe { nix::unistd::fork() }.context("fork() failed")? {
    nix::unistd::ForkResult::Parent { .. } => std::process::exit(0),
    nix::unistd::ForkResult::Child => {}
  }
  nix::unistd::setsid().context("setsid() failed")?;

  let devnull = fs::OpenOptions::new().read(true).write(true).open("/dev/null").context("open(/dev/null) failed")?;
  for fd in [0, 1, 2] {
    nix::unistd::dup2(devnull.as_raw_fd(), fd).context("dup2(/dev/null) failed")?;
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn pidfile_without_a_path_is_a_no_op() {
    let mut pidfile = Pidfile::open(None).unwrap();
    pidfile.write_pid().unwrap();
    pidfile.cleanup(false);
  }

  #[test]
  fn pidfile_roundtrips_the_current_pid() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("hashmilterd.pid");
    let mut pidfile = Pidfile::open(Some(path.to_str().unwrap())).unwrap();
    pidfile.write_pid().unwrap();
    let contents = fs::read_to_string(&path).unwrap();
    assert_eq!(contents.trim(), std::process::id().to_string());
  }

  #[test]
  fn a_second_lock_on_the_same_pidfile_fails() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("hashmilterd.pid");
    let _first = Pidfile::open(Some(path.to_str().unwrap())).unwrap();
    assert!(Pidfile::open(Some(path.to_str().unwrap())).is_err());
  }
}
