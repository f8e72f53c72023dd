// Component E: the protocol driver. Implements `transport::Callbacks` against a shared `Policy`
// and per-connection `message::State`, grounded on `hcfi_connect`/`hcfi_envfrom`/`hcfi_envrcpt`/
// `hcfi_header`/`hcfi_eom`/`hcfi_close`/`hcfi_negotiate` in `milter.c`.

use crate::message::{HashcashSpelling, Mode, State};
use crate::mint;
use crate::parse::iplist::PeerAddress;
use crate::parse::{address_list, auth_results, mailbox, token, Mailbox};
use crate::policy::{Direction, Policy};
use crate::rand::{Randomness, Urandom};
use crate::store::Store;
use crate::transport::{Callbacks, Verdict};
use crate::verify;
use chrono::Utc;
use std::sync::{Arc, Mutex};

/// Header header-name limit the reference enforces before calling `smfi_insheader`/
/// `smfi_chgheader` (RFC 5322's recommended line length budget, doubled for headers sendmail
/// folds).
const MAX_HEADER_LEN: usize = 998;

const SPECIAL_SKIP: &str = "skip";

fn is_special(value: &str, special: &str) -> bool {
  value.split_whitespace().collect::<String>() == special
}

/// Process-wide state shared by every connection: the policy and the double-spend store.
pub struct Shared {
  policy: Policy,
  store: Mutex<Store>,
}

impl Shared {
  pub fn new(policy: Policy, datafile: Option<&std::path::Path>) -> anyhow::Result<Shared> {
    Ok(Shared { policy, store: Mutex::new(Store::open(datafile)?) })
  }
}

/// Per-connection driver. One is created per accepted connection; `transport::Callbacks`
/// sequences calls into it the way a milter MTA would.
pub struct Driver {
  shared: Arc<Shared>,
  randomness: Urandom,
  state: State,
  peer: Option<PeerAddress>,
}

impl Driver {
  pub fn new(shared: Arc<Shared>) -> anyhow::Result<Driver> {
    Ok(Driver { shared, randomness: Urandom::open()?, state: State::new(), peer: None })
  }

  fn direction(&self) -> Direction {
    let peer_is_covered = match (&self.shared.policy.cover_ipaddrs, &self.peer) {
      (Some(list), Some(peer)) => Some(list.matches(peer)),
      (Some(_), None) => None,
      (None, _) => None,
    };
    self.shared.policy.direction_for_peer(peer_is_covered)
  }
}

impl Callbacks for Driver {
  fn connect(&mut self, peer: Option<PeerAddress>) -> anyhow::Result<()> {
    self.peer = peer;
    Ok(())
  }

  fn envelope_from(
    &mut self,
    reverse_path: &str,
    queue_id: Option<&str>,
    my_hostname: Option<&str>,
    auth_type: Option<&str>,
  ) -> anyhow::Result<()> {
    let policy = &self.shared.policy;

    let mode = if policy.cover_auth && auth_type.is_some() {
      Mode::Mint
    } else {
      match self.direction() {
        Direction::Outgoing => Mode::Mint,
        Direction::Incoming => Mode::Check,
        Direction::Unknown => {
          log::info!("can't decide direction for this connection, ignoring message");
          self.state.reset_for_message(Mode::Passive, true);
          self.state.queue_id = queue_id.unwrap_or(crate::message::UNKNOWN_QUEUE_ID).to_string();
          self.state.my_hostname = my_hostname.map(str::to_string);
          return Ok(());
        }
      }
    };

    let mut ignore = match mode {
      Mode::Mint => policy.mint_bits == 0,
      Mode::Check => policy.check_bits == 0,
      Mode::Passive => true,
    };

    if mode == Mode::Mint && !ignore {
      if let Some(cover_domains) = &policy.cover_domains {
        ignore = match mailbox::parse_reverse_path(reverse_path) {
          Ok(Some(sender)) => !cover_domains.matches(&sender.domain),
          Ok(None) | Err(_) => {
            log::info!("failed to parse sender '{reverse_path}', ignoring message");
            true
          }
        };
      }
    }

    self.state.reset_for_message(mode, ignore);
    self.state.queue_id = queue_id.unwrap_or(crate::message::UNKNOWN_QUEUE_ID).to_string();
    self.state.my_hostname = my_hostname.map(str::to_string);
    Ok(())
  }

  fn envelope_recipient(&mut self, forward_path: &str) -> anyhow::Result<()> {
    if self.state.ignore {
      return Ok(());
    }
    match mailbox::parse_reverse_path(forward_path) {
      Ok(Some(mailbox)) => self.state.record_env_rcpt(mailbox),
      Ok(None) | Err(_) => {
        log::info!("failed to parse recipient '{forward_path}', ignoring it");
      }
    }
    Ok(())
  }

  fn header(&mut self, name: &str, value: &str) -> anyhow::Result<()> {
    let count = self.state.begin_header();

    if name.eq_ignore_ascii_case("To") || name.eq_ignore_ascii_case("Cc") {
      if !self.state.ignore {
        match address_list::parse(value) {
          Ok(mailboxes) => {
            for mailbox in mailboxes {
              self.state.record_msg_rcpt(mailbox);
            }
          }
          Err(error) => log::info!("malformed '{name}' header: {error:#}"),
        }
      }
      return Ok(());
    }

    let is_hashcash = name.eq_ignore_ascii_case("Hashcash");
    let is_x_hashcash = name.eq_ignore_ascii_case("X-Hashcash");
    if is_hashcash || is_x_hashcash {
      match self.state.mode {
        Mode::Check if !self.state.ignore => match token::parse(value) {
          Ok(token) => self.state.tokens.push(token),
          Err(_) => self.state.neutral = true,
        },
        Mode::Check => {}
        Mode::Mint | Mode::Passive => {
          self.state.ignore = true;
          if self.state.remove_hashcash.is_none() {
            let spelling = if is_x_hashcash { HashcashSpelling::XPrefixed } else { HashcashSpelling::Plain };
            let occurrence = self.state.bump_hashcash_count(spelling);
            if is_special(value, SPECIAL_SKIP) {
              self.state.remove_hashcash = Some((spelling, occurrence));
            }
          }
        }
      }
      return Ok(());
    }

    if name.eq_ignore_ascii_case("Return-Path") || name.eq_ignore_ascii_case("Received") {
      self.state.hashcash_pos = count;
      self.state.auth_results_pos = count;
      return Ok(());
    }

    if name.eq_ignore_ascii_case("Authentication-Results") && self.state.mode != Mode::Mint {
      self.state.auth_results_pos = count;
      self.state.auth_results_count += 1;

      let Some(my_hostname) = self.state.my_hostname.clone() else {
        if !self.state.warned_auth_results {
          log::info!("my hostname unavailable, can't check '{name}' header for spoofing");
          self.state.warned_auth_results = true;
        }
        return Ok(());
      };

      let parsed = auth_results::parse(value);
      if parsed.authserv_id.eq_ignore_ascii_case(&my_hostname)
        && parsed.version == "1"
        && parsed.has_method("x-hashcash")
      {
        self.state.remove_auth_results.push(self.state.auth_results_count);
      }
    }

    Ok(())
  }

  fn end_of_headers(&mut self) -> anyhow::Result<()> {
    Ok(())
  }

  fn end_of_message(&mut self) -> anyhow::Result<Verdict> {
    let mut verdict = Verdict::default();
    if !self.state.ignore {
      match self.state.mode {
        Mode::Mint => self.mint(&mut verdict)?,
        Mode::Check => self.check(&mut verdict),
        Mode::Passive => {}
      }
    }

    // Deferred passive cleanup applies even to an otherwise-ignored message: a stray forged
    // Authentication-Results header or a leftover skip marker still needs stripping.
    if self.state.mode != Mode::Mint {
      for position in self.state.remove_auth_results.drain(..) {
        verdict.deletions.push(("Authentication-Results".to_string(), position));
      }
    }
    if self.state.mode != Mode::Check {
      if let Some((spelling, position)) = self.state.remove_hashcash.take() {
        let name = match spelling {
          HashcashSpelling::Plain => "Hashcash",
          HashcashSpelling::XPrefixed => "X-Hashcash",
        };
        verdict.deletions.push((name.to_string(), position));
      }
    }

    Ok(verdict)
  }

  fn close(&mut self) {
    self.state = State::new();
  }
}

impl Driver {
  fn mint(&mut self, verdict: &mut Verdict) -> anyhow::Result<()> {
    let policy = &self.shared.policy;
    let now = Utc::now();
    let date = crate::parse::date::format(now, 0);
    let bits = mint::effective_bits(policy.mint_bits, policy.reduce_bits, self.state.msg_rcpts.len());
    let mut ticker = mint::Ticker::new(policy.timeout.map(std::time::Duration::from_secs));
    let mut position = self.state.hashcash_pos;

    for recipient in &self.state.msg_rcpts {
      if !mailbox::is_dot_atom_text(&recipient.local) || !mailbox::is_dot_atom_text(&recipient.domain) {
        log::info!("recipient '{recipient}' isn't a plain address, skipping minting for it");
        continue;
      }
      let Some(text) = mint::mint(&recipient.local, &recipient.domain, bits, &date, &mut self.randomness, &mut ticker)?
      else {
        log::warn!("minting timed out for queue id {}", self.state.queue_id);
        break;
      };
      if text.len() > MAX_HEADER_LEN {
        log::info!("minted token too long to insert as a header, skipping it");
        continue;
      }
      position += 1;
      verdict.insertions.push((position, "X-Hashcash".to_string(), text));
    }

    log::info!(
      "minted {} token(s) for queue id {} in {:?} ({} total tries)",
      verdict.insertions.len(),
      self.state.queue_id,
      ticker.elapsed(),
      ticker.total_tries(),
    );
    Ok(())
  }

  fn check(&mut self, verdict: &mut Verdict) {
    // No stamps at all and nothing malformed either: nothing to say about this message, so stay
    // silent rather than emit a header.
    if self.state.tokens.is_empty() && !self.state.neutral {
      return;
    }

    let policy = &self.shared.policy;
    let now = Utc::now();
    let outcome = {
      let mut store = self.shared.store.lock().expect("double-spend store mutex poisoned");
      verify::check(
        &self.state.env_rcpts,
        &self.state.msg_rcpts,
        &self.state.tokens,
        policy.check_bits,
        now,
        &mut store,
      )
    };

    let Some(my_hostname) = self.state.my_hostname.clone() else {
      log::warn!("my hostname unavailable, can't add Authentication-Results header");
      return;
    };
    let value = format!("{my_hostname}; x-hashcash={}", outcome.result_comment());
    if value.len() > MAX_HEADER_LEN {
      log::info!("Authentication-Results header too long to insert, skipping it");
      return;
    }
    verdict
      .insertions
      .push((self.state.auth_results_pos + 1, "Authentication-Results".to_string(), value));
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::policy::{Arguments, Policy};

  fn policy(mint_bits: Option<u32>, check_bits: Option<u32>, cover_auth: bool) -> Policy {
    Policy::from_arguments(Arguments {
      socket: "inet:8025@127.0.0.1".to_string(),
      foreground: true,
      pidfile: None,
      user: None,
      chroot: None,
      cover_auth,
      cover_ipaddrs: None,
      cover_domains: None,
      check_bits,
      datafile: None,
      mint_bits,
      reduce_bits: None,
      timeout: None,
    })
    .unwrap()
  }

  fn shared(mint_bits: Option<u32>, check_bits: Option<u32>, cover_auth: bool) -> Arc<Shared> {
    Arc::new(Shared::new(policy(mint_bits, check_bits, cover_auth), None).unwrap())
  }

  #[test]
  fn mints_for_an_outgoing_message() {
    let mut driver = Driver::new(shared(Some(8), None, true)).unwrap();
    driver.connect(None).unwrap();
    driver
      .envelope_from("hare@forest.example", Some("q1"), Some("mx.forest.example"), Some("plain"))
      .unwrap();
    driver.envelope_recipient("owl@glade.example").unwrap();
    driver.header("To", "owl@glade.example").unwrap();
    let verdict = driver.end_of_message().unwrap();
    assert_eq!(verdict.insertions.len(), 1);
    assert_eq!(verdict.insertions[0].1, "X-Hashcash");
  }

  #[test]
  fn ignores_a_message_already_covered_by_a_stamp() {
    let mut driver = Driver::new(shared(Some(8), None, true)).unwrap();
    driver.connect(None).unwrap();
    driver
      .envelope_from("hare@forest.example", Some("q1"), Some("mx.forest.example"), Some("plain"))
      .unwrap();
    driver.envelope_recipient("owl@glade.example").unwrap();
    driver.header("X-Hashcash", "1:8:060831:hare@forest.example::abc:def").unwrap();
    let verdict = driver.end_of_message().unwrap();
    assert!(verdict.insertions.is_empty());
  }

  #[test]
  fn checks_an_incoming_message() {
    let shared_state = shared(None, Some(4), false);
    let mut minted_driver = Driver::new(Arc::clone(&shared_state)).unwrap();
    let mut ticker = mint::Ticker::new(None);
    let mut source = Urandom::open().unwrap();
    let text = mint::mint("owl", "glade.example", 4, "060831", &mut source, &mut ticker).unwrap().unwrap();
    let _ = &mut minted_driver;

    let mut driver = Driver::new(shared_state).unwrap();
    driver.connect(None).unwrap();
    driver
      .envelope_from("hare@forest.example", Some("q1"), Some("mx.glade.example"), None)
      .unwrap();
    driver.envelope_recipient("owl@glade.example").unwrap();
    driver.header("To", "owl@glade.example").unwrap();
    driver.header("X-Hashcash", &text).unwrap();
    let verdict = driver.end_of_message().unwrap();
    assert_eq!(verdict.insertions.len(), 1);
    assert_eq!(verdict.insertions[0].1, "Authentication-Results");
  }

  #[test]
  fn special_skip_value_is_detected_regardless_of_whitespace() {
    assert!(is_special("skip", SPECIAL_SKIP));
    assert!(is_special(" skip ", SPECIAL_SKIP));
    assert!(!is_special("skipper", SPECIAL_SKIP));
  }
}
