// Component D: per-message state, re-expressed from the reference's `struct hcfi_priv` (an
// intrusive-linked-list record rebuilt fresh at every `MAIL FROM`) as owned `Vec`/`String`
// fields.

use crate::parse::token::Token;
use crate::parse::Mailbox;

pub const UNKNOWN_QUEUE_ID: &str = "(unknown)";

/// Which of the two equivalent header spellings ("Hashcash" or "X-Hashcash") a message used, so
/// the driver can remove the right one by position (`smfi_chgheader`'s position parameter is
/// spelling-specific).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HashcashSpelling {
  Plain,
  XPrefixed,
}

impl HashcashSpelling {
  /// Index into `State::hashcash_count`, mirroring the reference's `x_hashcash` 0/1 boolean.
  fn index(self) -> usize {
    match self {
      HashcashSpelling::Plain => 0,
      HashcashSpelling::XPrefixed => 1,
    }
  }
}

/// Whether the connection is minting (outgoing), checking (incoming), or performing only passive
/// cleanup for this message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
  Mint,
  Check,
  Passive,
}

/// Per-message record, reset at every `MAIL FROM` and torn down at `close`.
pub struct State {
  pub queue_id: String,
  pub my_hostname: Option<String>,

  pub mode: Mode,
  /// Perform only passive actions (remove stray headers); set when the message direction is
  /// undecidable, when this direction's bits setting is 0, when sender-domain coverage excludes
  /// the message, or when a parse failure left processing unsafe to continue.
  pub ignore: bool,

  /// Envelope recipients (`RCPT TO`), deduplicated by `Mailbox::matches`.
  pub env_rcpts: Vec<Mailbox>,
  /// Recipients from `To`/`Cc` message headers, deduplicated the same way.
  pub msg_rcpts: Vec<Mailbox>,
  /// Syntactically valid tokens collected from `(X-)Hashcash` headers on an incoming message.
  pub tokens: Vec<Token>,
  /// At least one syntactically-invalid token header was seen.
  pub neutral: bool,

  pub header_count: u32,
  /// 1-based position to insert new `X-Hashcash` headers at, tracked the way `smfi_insheader`
  /// wants it: after the last trace header (`Return-Path`/`Received`) seen so far.
  pub hashcash_pos: u32,
  pub auth_results_pos: u32,
  pub auth_results_count: u32,
  /// Per-spelling occurrence counters ("Hashcash", "X-Hashcash"), used as `smfi_chgheader`'s
  /// instance index -- distinct from `header_count`, which counts headers of every name.
  pub hashcash_count: [u32; 2],

  /// Set once an outgoing message is found already covered by a `skip` token, recording which
  /// header spelling and its occurrence index among headers of that spelling, so it can be
  /// removed by `smfi_chgheader`.
  pub remove_hashcash: Option<(HashcashSpelling, u32)>,
  /// Occurrence indices (among `Authentication-Results` headers) of ones that falsely claim our
  /// own `x-hashcash` result and must be stripped before relaying.
  pub remove_auth_results: Vec<u32>,
  pub warned_auth_results: bool,
}

impl State {
  pub fn new() -> State {
    State {
      queue_id: UNKNOWN_QUEUE_ID.to_string(),
      my_hostname: None,
      mode: Mode::Passive,
      ignore: true,
      env_rcpts: Vec::new(),
      msg_rcpts: Vec::new(),
      tokens: Vec::new(),
      neutral: false,
      header_count: 0,
      hashcash_pos: 0,
      auth_results_pos: 0,
      auth_results_count: 0,
      hashcash_count: [0, 0],
      remove_hashcash: None,
      remove_auth_results: Vec::new(),
      warned_auth_results: false,
    }
  }

  /// Reinitializes per-message fields at `MAIL FROM`, keeping `queue_id`/`my_hostname` (which the
  /// driver may have already captured from MTA macros).
  pub fn reset_for_message(&mut self, mode: Mode, ignore: bool) {
    self.mode = mode;
    self.ignore = ignore;
    self.env_rcpts.clear();
    self.msg_rcpts.clear();
    self.tokens.clear();
    self.neutral = false;
    self.header_count = 0;
    self.hashcash_pos = 0;
    self.auth_results_pos = 0;
    self.auth_results_count = 0;
    self.hashcash_count = [0, 0];
    self.remove_hashcash = None;
    self.remove_auth_results.clear();
    self.warned_auth_results = false;
  }

  /// Increments and returns the occurrence counter for `spelling`, the way `smfi_chgheader`'s
  /// instance index is tracked (separately from the overall `header_count`).
  pub fn bump_hashcash_count(&mut self, spelling: HashcashSpelling) -> u32 {
    let count = &mut self.hashcash_count[spelling.index()];
    *count += 1;
    *count
  }

  pub fn record_env_rcpt(&mut self, mailbox: Mailbox) {
    if !self.env_rcpts.iter().any(|existing| existing.matches(&mailbox)) {
      self.env_rcpts.push(mailbox);
    }
  }

  pub fn record_msg_rcpt(&mut self, mailbox: Mailbox) {
    if !self.msg_rcpts.iter().any(|existing| existing.matches(&mailbox)) {
      self.msg_rcpts.push(mailbox);
    }
  }

  pub fn begin_header(&mut self) -> u32 {
    self.header_count += 1;
    self.header_count
  }
}

impl Default for State {
  fn default() -> State {
    State::new()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn mailbox(local: &str, domain: &str) -> Mailbox {
    Mailbox { local: local.to_string(), domain: domain.to_string() }
  }

  #[test]
  fn new_state_starts_ignored_and_unknown() {
    let state = State::new();
    assert!(state.ignore);
    assert_eq!(state.queue_id, UNKNOWN_QUEUE_ID);
  }

  #[test]
  fn duplicate_env_rcpts_are_collapsed() {
    let mut state = State::new();
    state.record_env_rcpt(mailbox("hare", "forest.example"));
    state.record_env_rcpt(mailbox("hare", "Forest.Example"));
    assert_eq!(state.env_rcpts.len(), 1);
  }

  #[test]
  fn distinct_local_parts_are_kept_separate() {
    let mut state = State::new();
    state.record_env_rcpt(mailbox("hare", "forest.example"));
    state.record_env_rcpt(mailbox("Hare", "forest.example"));
    assert_eq!(state.env_rcpts.len(), 2);
  }

  #[test]
  fn reset_for_message_clears_prior_tokens_and_recipients() {
    let mut state = State::new();
    state.record_env_rcpt(mailbox("hare", "forest.example"));
    state.neutral = true;
    state.header_count = 5;
    state.reset_for_message(Mode::Check, false);
    assert!(state.env_rcpts.is_empty());
    assert!(!state.neutral);
    assert_eq!(state.header_count, 0);
    assert_eq!(state.mode, Mode::Check);
    assert!(!state.ignore);
  }

  #[test]
  fn begin_header_increments_and_returns_count() {
    let mut state = State::new();
    assert_eq!(state.begin_header(), 1);
    assert_eq!(state.begin_header(), 2);
  }
}
