// MTA callback contract (component E's collaborator) and a line-oriented reference transport.
// Grounded on the reference's libmilter callback set (`hcfi_connect`/`envfrom`/`envrcpt`/
// `header`/`eom`/`close`) and its header-editing primitives (`smfi_insheader`/`smfi_chgheader`).
// Reproducing the real sendmail wire protocol is out of scope (SPEC_FULL.md 1); this only
// standardizes the shape of the interaction so the driver and the reference binary/tests can
// exercise it in-process.

use crate::parse::iplist::PeerAddress;
use anyhow::Context as _;
use std::io::{BufRead, Write};
use std::net::{IpAddr, TcpListener};
use std::os::unix::net::UnixListener;
use std::sync::Arc;

/// One connection's view of the callback sequence a milter implementation drives:
/// Connect -> From -> Rcpt* -> Header* -> EndOfHeaders -> EndOfMessage -> Close.
pub trait Callbacks {
  /// New connection accepted; `peer` is `None` if the MTA didn't supply an address.
  fn connect(&mut self, peer: Option<PeerAddress>) -> anyhow::Result<()>;
  /// `MAIL FROM`. `queue_id`/`my_hostname` stand in for the `i`/`j` MTA macros, `auth_type` for
  /// `{auth_type}`.
  fn envelope_from(
    &mut self,
    reverse_path: &str,
    queue_id: Option<&str>,
    my_hostname: Option<&str>,
    auth_type: Option<&str>,
  ) -> anyhow::Result<()>;
  /// `RCPT TO`.
  fn envelope_recipient(&mut self, forward_path: &str) -> anyhow::Result<()>;
  /// One message header.
  fn header(&mut self, name: &str, value: &str) -> anyhow::Result<()>;
  /// End of headers / start of body; no header positions change after this point.
  fn end_of_headers(&mut self) -> anyhow::Result<()>;
  /// End of message: mint or check, as appropriate, then apply any deferred header edits.
  fn end_of_message(&mut self) -> anyhow::Result<Verdict>;
  /// Connection torn down; state must be released even if `end_of_message` was never reached.
  fn close(&mut self);
}

/// What the driver decided to do with the message, expressed independently of any particular
/// wire protocol's accept/reject vocabulary.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Verdict {
  /// Headers to insert, in order, each at the 1-based position it should land at.
  pub insertions: Vec<(u32, String, String)>,
  /// Header name + 1-based occurrence index to delete (a no-op body for `smfi_chgheader`).
  pub deletions: Vec<(String, u32)>,
}

/// `-p` socket address syntax: `local:/path`, `inet:port@addr`, `inet6:port@addr`. A total,
/// single-shot grammar, unlike the header parsers in `parse/` (SPEC_FULL.md 4.2).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SocketAddress {
  Local(String),
  Inet { port: u16, address: String },
  Inet6 { port: u16, address: String },
}

peg::parser! {
  grammar grammar_() for str {
    rule port() -> u16
      = s:$(['0'..='9']+) {? s.parse().map_err(|_| "port out of range") }

    rule rest() -> &'input str
      = s:$([_]*)

    pub rule socket() -> SocketAddress
      = "local:" path:rest() { SocketAddress::Local(path.to_string()) }
      / "inet6:" port:port() "@" address:rest()
          { SocketAddress::Inet6 { port, address: address.to_string() } }
      / "inet:" port:port() "@" address:rest()
          { SocketAddress::Inet { port, address: address.to_string() } }
  }
}

impl SocketAddress {
  pub fn parse(value: &str) -> anyhow::Result<SocketAddress> {
    grammar_::socket(value)
      .map_err(|error| anyhow::anyhow!("can't parse listening socket '{value}': {error}"))
  }
}

/// Drives one connection's worth of commands from `reader` through `callbacks`, writing the
/// end-of-message verdict back to `writer` as it goes. Line-oriented, tab-separated fields, "-"
/// for an absent optional field; not a byte-compatible libmilter implementation, just enough
/// structure for the binary and the test suite to exercise the callback contract end to end
/// (SPEC_FULL.md 1).
///
/// Commands: `MAIL <reverse-path>\t<queue-id>\t<my-hostname>\t<auth-type>`, `RCPT <forward-path>`,
/// `HEADER <name>\t<value>`, `EOH`, `EOM`, `QUIT`. `EOM` replies with zero or more `INSERT
/// <pos>\t<name>\t<value>` / `DELETE <name>\t<pos>` lines followed by `END`.
pub fn serve(
  mut reader: impl BufRead,
  mut writer: impl Write,
  peer: Option<PeerAddress>,
  callbacks: &mut impl Callbacks,
) -> anyhow::Result<()> {
  callbacks.connect(peer)?;
  let mut line = String::new();
  loop {
    line.clear();
    if reader.read_line(&mut line).context("read failed")? == 0 {
      break;
    }
    let line = line.trim_end_matches(['\r', '\n']);
    if line.is_empty() {
      continue;
    }
    let (verb, rest) = line.split_once(' ').unwrap_or((line, ""));
    match verb {
      "MAIL" => {
        let mut fields = rest.split('\t');
        let reverse_path = fields.next().unwrap_or("");
        let queue_id = fields.next().filter(|s| *s != "-");
        let my_hostname = fields.next().filter(|s| *s != "-");
        let auth_type = fields.next().filter(|s| *s != "-");
        callbacks.envelope_from(reverse_path, queue_id, my_hostname, auth_type)?;
      }
      "RCPT" => callbacks.envelope_recipient(rest)?,
      "HEADER" => {
        let (name, value) = rest.split_once('\t').context("malformed HEADER line")?;
        callbacks.header(name, value)?;
      }
      "EOH" => callbacks.end_of_headers()?,
      "EOM" => {
        let verdict = callbacks.end_of_message()?;
        for (position, name, value) in &verdict.insertions {
          writeln!(writer, "INSERT {position}\t{name}\t{value}").context("write failed")?;
        }
        for (name, position) in &verdict.deletions {
          writeln!(writer, "DELETE {name}\t{position}").context("write failed")?;
        }
        writeln!(writer, "END").context("write failed")?;
        writer.flush().context("flush failed")?;
      }
      "QUIT" => break,
      _ => anyhow::bail!("unknown command '{verb}'"),
    }
  }
  callbacks.close();
  Ok(())
}

fn peer_of(address: std::net::SocketAddr) -> PeerAddress {
  match address.ip() {
    IpAddr::V4(address) => PeerAddress::V4(address),
    IpAddr::V6(address) => PeerAddress::V6(address),
  }
}

/// Binds `address` and serves connections forever, one thread per connection, each built via
/// `make_callbacks`. Never returns on success; bind failures are returned as `Err`.
pub fn listen<C, F>(address: &SocketAddress, make_callbacks: F) -> anyhow::Result<()>
where
  C: Callbacks + Send + 'static,
  F: Fn() -> anyhow::Result<C> + Send + Sync + 'static,
{
  let make_callbacks = Arc::new(make_callbacks);
  match address {
    SocketAddress::Local(path) => {
      let _ = std::fs::remove_file(path);
      let listener =
        UnixListener::bind(path).with_context(|| format!("couldn't bind unix socket '{path}'"))?;
      for stream in listener.incoming() {
        let stream = stream.context("accept() failed")?;
        let make_callbacks = Arc::clone(&make_callbacks);
        std::thread::spawn(move || {
          let mut callbacks = match make_callbacks() {
            Ok(callbacks) => callbacks,
            Err(error) => return log::error!("couldn't set up connection: {error:#}"),
          };
          let reader = std::io::BufReader::new(stream.try_clone().expect("clone socket"));
          if let Err(error) = serve(reader, stream, Some(PeerAddress::Local), &mut callbacks) {
            log::warn!("connection error: {error:#}");
          }
        });
      }
    }
    SocketAddress::Inet { port, address } | SocketAddress::Inet6 { port, address } => {
      let listener = TcpListener::bind((address.as_str(), *port))
        .with_context(|| format!("couldn't bind '{address}:{port}'"))?;
      for stream in listener.incoming() {
        let stream = stream.context("accept() failed")?;
        let peer = stream.peer_addr().ok().map(peer_of);
        let make_callbacks = Arc::clone(&make_callbacks);
        std::thread::spawn(move || {
          let mut callbacks = match make_callbacks() {
            Ok(callbacks) => callbacks,
            Err(error) => return log::error!("couldn't set up connection: {error:#}"),
          };
          let reader = std::io::BufReader::new(stream.try_clone().expect("clone socket"));
          if let Err(error) = serve(reader, stream, peer, &mut callbacks) {
            log::warn!("connection error: {error:#}");
          }
        });
      }
    }
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  struct Recording {
    events: Vec<String>,
  }

  impl Callbacks for Recording {
    fn connect(&mut self, peer: Option<PeerAddress>) -> anyhow::Result<()> {
      self.events.push(format!("connect({peer:?})"));
      Ok(())
    }
    fn envelope_from(
      &mut self,
      reverse_path: &str,
      queue_id: Option<&str>,
      my_hostname: Option<&str>,
      auth_type: Option<&str>,
    ) -> anyhow::Result<()> {
      self.events.push(format!("from({reverse_path},{queue_id:?},{my_hostname:?},{auth_type:?})"));
      Ok(())
    }
    fn envelope_recipient(&mut self, forward_path: &str) -> anyhow::Result<()> {
      self.events.push(format!("rcpt({forward_path})"));
      Ok(())
    }
    fn header(&mut self, name: &str, value: &str) -> anyhow::Result<()> {
      self.events.push(format!("header({name},{value})"));
      Ok(())
    }
    fn end_of_headers(&mut self) -> anyhow::Result<()> {
      self.events.push("eoh".to_string());
      Ok(())
    }
    fn end_of_message(&mut self) -> anyhow::Result<Verdict> {
      self.events.push("eom".to_string());
      Ok(Verdict {
        insertions: vec![(1, "X-Hashcash".to_string(), "token".to_string())],
        deletions: vec![],
      })
    }
    fn close(&mut self) {
      self.events.push("close".to_string());
    }
  }

  #[test]
  fn serve_drives_the_full_callback_sequence() {
    let input = "MAIL hare@forest.example\tq1\tmx.example\t-\n\
                 RCPT owl@glade.example\n\
                 HEADER To\towl@glade.example\n\
                 EOH\n\
                 EOM\n\
                 QUIT\n";
    let mut output = Vec::new();
    let mut callbacks = Recording { events: Vec::new() };
    serve(input.as_bytes(), &mut output, Some(PeerAddress::Local), &mut callbacks).unwrap();
    assert_eq!(
      callbacks.events,
      vec![
        "connect(Some(Local))".to_string(),
        "from(hare@forest.example,Some(\"q1\"),Some(\"mx.example\"),None)".to_string(),
        "rcpt(owl@glade.example)".to_string(),
        "header(To,owl@glade.example)".to_string(),
        "eoh".to_string(),
        "eom".to_string(),
        "close".to_string(),
      ]
    );
    let output = String::from_utf8(output).unwrap();
    assert_eq!(output, "INSERT 1\tX-Hashcash\ttoken\nEND\n");
  }

  #[test]
  fn parses_local_socket() {
    let address = SocketAddress::parse("local:/var/run/hashmilter.sock").unwrap();
    assert_eq!(address, SocketAddress::Local("/var/run/hashmilter.sock".to_string()));
  }

  #[test]
  fn parses_inet_socket() {
    let address = SocketAddress::parse("inet:8025@127.0.0.1").unwrap();
    assert_eq!(address, SocketAddress::Inet { port: 8025, address: "127.0.0.1".to_string() });
  }

  #[test]
  fn parses_inet6_socket() {
    let address = SocketAddress::parse("inet6:8025@::1").unwrap();
    assert_eq!(address, SocketAddress::Inet6 { port: 8025, address: "::1".to_string() });
  }

  #[test]
  fn rejects_unknown_scheme() {
    assert!(SocketAddress::parse("unix:/var/run/hashmilter.sock").is_err());
  }

  #[test]
  fn rejects_missing_at_sign() {
    assert!(SocketAddress::parse("inet:8025127.0.0.1").is_err());
  }
}
