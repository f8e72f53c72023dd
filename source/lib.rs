mod daemon;
pub mod driver;
pub mod message;
pub mod mint;
pub mod parse;
pub mod policy;
pub mod rand;
mod sha1;
mod store;
pub mod transport;
mod verify;

use anyhow::Context as _;
use std::sync::Arc;

pub use policy::Arguments;

pub fn run(arguments: &Arguments) -> anyhow::Result<()> {
  sha1::self_test().context("SHA-1 self-test failed, refusing to start")?;

  // socket/chroot/daemonize all need to be resolved before the policy is consumed, since
  // `Policy::from_arguments` takes the raw arguments by value.
  let socket = arguments.socket.clone();
  let user = arguments.user.clone();
  let chroot = arguments.chroot.clone();
  let pidfile = arguments.pidfile.clone();
  let foreground = arguments.foreground;
  let policy = policy::Policy::from_arguments(arguments.clone())?;

  let mut pidfile = daemon::Pidfile::open(pidfile.as_deref())?;

  if let Some(user) = &user {
    daemon::drop_privileges(user, policy.group.as_deref(), chroot.as_deref().map(std::path::Path::new))
      .context("couldn't drop privileges")?;
  }

  let datafile = policy.datafile.clone();
  let shared =
    Arc::new(driver::Shared::new(policy, datafile.as_deref().map(std::path::Path::new))
      .context("couldn't open double-spend datafile")?);

  daemon::daemonize(foreground).context("couldn't daemonize")?;
  pidfile.write_pid().context("couldn't write pidfile")?;

  log::info!("hashmilterd starting up on {socket}");
  let address = transport::SocketAddress::parse(&socket)?;

  let result = transport::listen(&address, move || driver::Driver::new(Arc::clone(&shared)));

  pidfile.cleanup(chroot.is_some());
  log::info!("hashmilterd shutting down");
  result
}
