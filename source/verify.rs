// Component G: the verification engine. Grounded on `token_value` (util.c) for per-token
// scoring and `hcfi_eom_check` (milter.c) for the per-recipient/aggregate classification and the
// double-spend integration.

use crate::parse::date;
use crate::parse::token::Token;
use crate::parse::Mailbox;
use crate::sha1::{self, Sha1};
use crate::store::Store;
use chrono::{DateTime, Utc};

/// A token's score against a validity window, mirroring `token_value`'s return codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Value {
  /// Valid, with this many leading zero bits (always `>= bits` claimed by the token -- anything
  /// less is `Invalid`).
  Bits(u32),
  /// The claimed bits exceed what the hash actually provides.
  Invalid,
  /// The token's date is in the future, beyond the tolerance window.
  Futuristic,
  /// The token's date has expired.
  Expired,
  /// Already recorded as spent.
  Spent,
  /// No token at all was found for the recipient.
  NoStamp,
}

/// Scores `token` against `[date1, date2]`: checks the date window first, then SHA-1-hashes the
/// full token text and confirms the top `token.bits` bits are zero.
pub fn value(token: &Token, date1: &str, date2: &str) -> Value {
  match date::classify(&token.date, date1, date2) {
    date::Window::Expired => return Value::Expired,
    date::Window::Futuristic => return Value::Futuristic,
    date::Window::Valid => {}
  }

  let mut hash = Sha1::begin();
  hash.feed_bytes(token.text.as_bytes());
  let bits = sha1::leading_zero_bits(&hash.finalize());
  if bits < token.bits {
    Value::Invalid
  } else {
    Value::Bits(token.bits)
  }
}

/// Finds every token addressed to `mailbox`, in order, mirroring the repeated `find_token` walk
/// in `hcfi_eom_check`.
fn tokens_for<'a>(tokens: &'a [Token], mailbox: &Mailbox) -> impl Iterator<Item = &'a Token> {
  tokens.iter().filter(move |token| {
    Mailbox { local: token.local.clone(), domain: token.domain.clone() }.matches(mailbox)
  })
}

/// Best (highest) value across a recipient's matching tokens, with "no stamps at all" sentinel
/// behavior identical to the reference's `best == -3` seed: the first token found always
/// replaces it.
fn best_for_recipient(
  tokens: &[Token],
  mailbox: &Mailbox,
  date1: &str,
  date2: &str,
  store: &mut Store,
) -> Option<Value> {
  let mut best: Option<Value> = None;
  for token in tokens_for(tokens, mailbox) {
    let mut scored = value(token, date1, date2);
    if let Value::Bits(bits) = scored {
      let truncated = crate::store::truncate(&token.text);
      if !store.insert_if_absent(truncated.as_bytes()) {
        scored = Value::Spent;
      } else {
        scored = Value::Bits(bits);
      }
    }
    best = Some(match best {
      None => scored,
      Some(current) => max_value(current, scored),
    });
  }
  best
}

fn rank(value: Value) -> i64 {
  match value {
    Value::Spent => -4,
    Value::Invalid => -5,
    Value::NoStamp => -3,
    Value::Futuristic => -1,
    Value::Expired => -2,
    Value::Bits(bits) => bits as i64,
  }
}

fn max_value(a: Value, b: Value) -> Value {
  if rank(b) > rank(a) {
    b
  } else {
    a
  }
}

/// Outcome of checking a whole message: which `Authentication-Results` clause to attach, if any.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
  /// No recipients were eligible for checking at all.
  Neutral,
  Spent,
  InvalidToken,
  Pass(u32),
  Partial(u32),
  Policy(u32),
  PolicyFuturistic,
  PolicyExpired,
}

impl Outcome {
  pub fn result_comment(&self) -> String {
    match self {
      Outcome::Neutral => "neutral".to_string(),
      Outcome::Spent => "fail (already spent)".to_string(),
      Outcome::InvalidToken => "fail (invalid)".to_string(),
      Outcome::Pass(bits) => format!("pass ({bits} bits)"),
      Outcome::Partial(bits) => format!("partial (highest {bits} bits)"),
      Outcome::Policy(bits) => format!("policy (only {bits} bits)"),
      Outcome::PolicyFuturistic => "policy (futuristic)".to_string(),
      Outcome::PolicyExpired => "policy (expired)".to_string(),
    }
  }
}

/// Checks a message's tokens against its recipients, integrating with the double-spend store.
/// `env_rcpts`/`msg_rcpts` must intersect the way `hcfi_eom_check` requires: only recipients
/// present in both the envelope and the message headers are checked.
pub fn check(
  env_rcpts: &[Mailbox],
  msg_rcpts: &[Mailbox],
  tokens: &[Token],
  check_bits: u32,
  now: DateTime<Utc>,
  store: &mut Store,
) -> Outcome {
  let date1 = date::format(now, -(28 + 2) * 86400);
  let date2 = date::format(now, 2 * 86400);

  if date1 <= date2 {
    store.purge_outside(&date1, &date2);
  }

  let mut min_value: Option<Value> = None;
  let mut max_seen: Option<Value> = None;

  for recipient in env_rcpts {
    if !msg_rcpts.iter().any(|candidate| candidate.matches(recipient)) {
      continue;
    }
    let best = best_for_recipient(tokens, recipient, &date1, &date2, store).unwrap_or(Value::NoStamp);
    min_value = Some(match min_value {
      None => best,
      Some(current) => if rank(best) < rank(current) { best } else { current },
    });
    max_seen = Some(match max_seen {
      None => best,
      Some(current) => max_value(current, best),
    });
  }

  store.maybe_sync(false).ok();

  let (Some(min_value), Some(max_seen)) = (min_value, max_seen) else {
    return Outcome::Neutral;
  };
  if rank(min_value) > rank(max_seen) {
    return Outcome::Neutral;
  }
  if rank(min_value) <= -4 {
    return match min_value {
      Value::Invalid => Outcome::InvalidToken,
      _ => Outcome::Spent,
    };
  }
  if let Value::Bits(bits) = min_value {
    if bits >= check_bits {
      return Outcome::Pass(bits);
    }
  }
  if let Value::Bits(bits) = max_seen {
    if bits >= check_bits {
      return Outcome::Partial(bits);
    }
  }
  if let Value::Bits(bits) = max_seen {
    return Outcome::Policy(bits);
  }
  match max_seen {
    Value::Futuristic => Outcome::PolicyFuturistic,
    _ => Outcome::PolicyExpired,
  }
}
