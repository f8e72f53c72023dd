// Component C: command-line surface and the resolved, immutable, process-wide policy derived
// from it. Grounded on the reference's `main()` argument loop and its cross-flag validation
// (`-d` without `-c`, `-m` without `-a`/`-i`, etc.), re-expressed as a `clap` derive struct in
// the teacher's CLI-flatten style.

use crate::parse::{domainlist::DomainList, iplist::IpList};
use anyhow::Context as _;

fn parse_bits(argument: &str) -> anyhow::Result<u32> {
  let bits: u32 = argument.parse().context("not a number")?;
  anyhow::ensure!(bits > 0 && bits <= 160, "must be between 1 and 160");
  Ok(bits)
}

fn parse_ip_list(argument: &str) -> anyhow::Result<IpList> {
  IpList::parse(argument)
}

fn parse_domain_list(argument: &str) -> anyhow::Result<DomainList> {
  Ok(DomainList::parse(argument))
}

#[derive(Clone, clap::Args)]
#[group(skip)]
pub struct Arguments {
  #[arg(long = "socket", help = "Listening socket: local:/path, inet:port@addr, inet6:port@addr")]
  pub socket: String,

  #[arg(long = "foreground", help = "Stay in the foreground instead of daemonizing")]
  pub foreground: bool,
  #[arg(long = "pidfile", help = "Write the process ID to this file")]
  pub pidfile: Option<String>,
  #[arg(long = "user", help = "Change to this user (optionally user:group) before running")]
  pub user: Option<String>,
  #[arg(long = "chroot", help = "Chroot to this directory (requires --user)")]
  pub chroot: Option<String>,

  #[arg(long = "cover-auth", help = "Mail sent after SMTP authentication is outgoing")]
  pub cover_auth: bool,
  #[arg(
    long = "cover-ipaddrs",
    help = "Mail sent from these comma-separated IP addresses/networks is outgoing",
    value_parser = parse_ip_list
  )]
  pub cover_ipaddrs: Option<IpList>,
  #[arg(
    long = "cover-domains",
    help = "Cover only mail sent from these comma-separated sender domains",
    value_parser = parse_domain_list
  )]
  pub cover_domains: Option<DomainList>,

  #[arg(
    long = "check-bits",
    help = "Check tokens on incoming messages, requiring this minimum value",
    value_parser = parse_bits
  )]
  pub check_bits: Option<u32>,
  #[arg(long = "datafile", help = "Double-spend datafile (requires --check-bits)")]
  pub datafile: Option<String>,

  #[arg(
    long = "mint-bits",
    help = "Mint tokens for outgoing messages with this value",
    value_parser = parse_bits
  )]
  pub mint_bits: Option<u32>,
  #[arg(
    long = "reduce-bits",
    help = "Reduce token value for multi-recipient messages down to this minimum",
    value_parser = parse_bits
  )]
  pub reduce_bits: Option<u32>,
  #[arg(long = "timeout", help = "Maximum seconds to spend minting per message")]
  pub timeout: Option<u64>,
}

/// Whether mail is outgoing (to be minted) or incoming (to be checked), or undecidable.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
  Outgoing,
  Incoming,
  Unknown,
}

/// Resolved, immutable, process-wide policy. Constructed once at startup by
/// `Policy::from_arguments`, which performs all the cross-flag validation the reference does in
/// `main()` before any connection is accepted.
pub struct Policy {
  pub socket: String,
  pub foreground: bool,
  pub pidfile: Option<String>,
  pub user: Option<String>,
  pub group: Option<String>,
  pub chroot: Option<String>,

  pub cover_auth: bool,
  pub cover_ipaddrs: Option<IpList>,
  pub cover_domains: Option<DomainList>,

  pub check_bits: u32,
  pub datafile: Option<String>,

  pub mint_bits: u32,
  pub reduce_bits: u32,
  pub timeout: Option<u64>,
}

impl Policy {
  pub fn from_arguments(arguments: Arguments) -> anyhow::Result<Policy> {
    let check_bits = arguments.check_bits.unwrap_or(0);
    let mint_bits = arguments.mint_bits.unwrap_or(0);
    let reduce_bits = arguments.reduce_bits.unwrap_or(0);

    anyhow::ensure!(
      check_bits != 0 || arguments.datafile.is_none(),
      "--datafile can't be specified without --check-bits"
    );
    anyhow::ensure!(
      mint_bits == 0 || arguments.cover_auth || arguments.cover_ipaddrs.is_some(),
      "either --cover-auth or --cover-ipaddrs must be specified with --mint-bits"
    );
    anyhow::ensure!(
      mint_bits != 0
        || (reduce_bits == 0 && arguments.cover_domains.is_none() && arguments.timeout.is_none()),
      "--reduce-bits, --cover-domains and --timeout can't be specified without --mint-bits"
    );
    anyhow::ensure!(
      reduce_bits <= mint_bits,
      "--reduce-bits must be no greater than --mint-bits"
    );
    anyhow::ensure!(
      mint_bits != 0 || check_bits != 0,
      "either --check-bits or --mint-bits must be specified"
    );
    anyhow::ensure!(
      arguments.chroot.is_none() || arguments.user.is_some(),
      "--chroot must be specified with --user"
    );

    let (user, group) = match arguments.user {
      Some(spec) => match spec.split_once(':') {
        Some((user, group)) => (Some(user.to_string()), Some(group.to_string())),
        None => (Some(spec), None),
      },
      None => (None, None),
    };

    Ok(Policy {
      socket: arguments.socket,
      foreground: arguments.foreground,
      pidfile: arguments.pidfile,
      user,
      group,
      chroot: arguments.chroot,
      cover_auth: arguments.cover_auth,
      cover_ipaddrs: arguments.cover_ipaddrs,
      cover_domains: arguments.cover_domains,
      check_bits,
      datafile: arguments.datafile,
      mint_bits,
      reduce_bits,
      timeout: arguments.timeout,
    })
  }

  /// Direction for a connection whose peer address was (or wasn't) matched against
  /// `cover_ipaddrs`, mirroring `hcfi_connect`'s `priv->ipaddr` assignment.
  pub fn direction_for_peer(&self, peer_is_covered: Option<bool>) -> Direction {
    match (&self.cover_ipaddrs, peer_is_covered) {
      (None, _) => Direction::Incoming,
      (Some(_), None) => Direction::Unknown,
      (Some(_), Some(true)) => Direction::Outgoing,
      (Some(_), Some(false)) => Direction::Incoming,
    }
  }
}
