// Component F: the minting engine. Grounded on `hcfi_eom_mint`/`iterate_counter`/`tick` in
// `milter.c`. The reference searches the counter space with a recursive function whose
// recursion depth is the counter length currently being tried; this reimplements that as an
// explicit stack of cloned `Sha1` states (one entry per counter position already committed to).

use crate::rand::Randomness;
use crate::sha1::{self, Sha1};
use std::time::{Duration, Instant};

pub const RANDOM_LEN: usize = 16;
const COUNTER_MAX: usize = 16;

/// Effective bits to mint for a message with `recipient_count` recipients: halve the recipient
/// count repeatedly, losing one bit of value per halving, down to `reduce_bits` (never below
/// it). A `reduce_bits` of 0 (or `>= mint_bits`) disables reduction.
pub fn effective_bits(mint_bits: u32, reduce_bits: u32, recipient_count: usize) -> u32 {
  if reduce_bits == 0 || reduce_bits >= mint_bits {
    return mint_bits;
  }
  let mut bits = mint_bits;
  let mut size = recipient_count;
  while bits > reduce_bits && size > 1 {
    bits -= 1;
    size /= 2;
  }
  bits
}

/// Adaptive progress ticker: scales the number of hash attempts between timeout checks so that
/// checks happen roughly every 200-300ms, mirroring `tick()`.
pub struct Ticker {
  started: Instant,
  deadline: Option<Instant>,
  last_tick: Instant,
  tick_tries: u64,
  tries_per_tick: u64,
  total_tries: u64,
}

impl Ticker {
  pub fn new(timeout: Option<Duration>) -> Ticker {
    let now = Instant::now();
    Ticker {
      started: now,
      deadline: timeout.map(|t| now + t),
      last_tick: now,
      tick_tries: 0,
      tries_per_tick: 100,
      total_tries: 0,
    }
  }

  /// Call once per hash attempt. Returns `true` if the search should stop because the deadline
  /// passed.
  fn tick(&mut self) -> bool {
    self.tick_tries += 1;
    if self.tick_tries < self.tries_per_tick {
      return false;
    }
    self.total_tries += self.tick_tries;
    self.tick_tries = 0;

    let Some(deadline) = self.deadline else { return false };
    let now = Instant::now();
    if now >= deadline {
      return true;
    }

    let tick_delta = now.duration_since(self.last_tick);
    if tick_delta > Duration::from_millis(500) {
      self.tries_per_tick /= 2;
    } else if tick_delta > Duration::from_millis(300) {
      self.tries_per_tick = self.tries_per_tick * 5 / 6;
    } else if tick_delta < Duration::from_millis(200) && self.tries_per_tick < u64::MAX / 2 {
      self.tries_per_tick *= 2;
    }
    if self.tries_per_tick < 1 {
      self.tries_per_tick = 1;
    }
    self.last_tick = now;
    false
  }

  pub fn total_tries(&self) -> u64 {
    self.total_tries + self.tick_tries
  }

  pub fn elapsed(&self) -> Duration {
    Instant::now().duration_since(self.started)
  }
}

enum SearchResult {
  Found(String),
  NotFound,
  Aborted,
}

/// Depth-first search of all `len`-character counters over `prefix_hash`, using a stack of
/// cloned SHA-1 states so that common prefixes are only hashed once.
fn search_counter_len(prefix_hash: &Sha1, bits: u32, len: usize, ticker: &mut Ticker) -> SearchResult {
  let mut stack: Vec<(Sha1, usize)> = vec![(prefix_hash.clone(), 0)];
  let mut counter = vec![0u8; len];

  loop {
    let depth = stack.len() - 1;
    let Some((hash, index)) = stack.last_mut() else { return SearchResult::NotFound };
    if *index >= crate::rand::ALPHABET.len() {
      stack.pop();
      if stack.is_empty() {
        return SearchResult::NotFound;
      }
      continue;
    }

    let c = crate::rand::ALPHABET[*index];
    *index += 1;
    let mut next_hash = hash.clone();
    next_hash.feed_byte(c);
    counter[depth] = c;

    if depth + 1 == len {
      let digest = next_hash.finalize();
      if sha1::leading_zero_bits(&digest) >= bits {
        return SearchResult::Found(String::from_utf8(counter).expect("alphabet is ASCII"));
      }
      if ticker.tick() {
        return SearchResult::Aborted;
      }
    } else {
      stack.push((next_hash, 0));
    }
  }
}

/// Mints one token for `local@domain` at the given `bits`/`date`, or `None` if the search timed
/// out. `ext` is always minted empty; non-empty `ext` only appears in tokens this crate verifies,
/// never ones it mints.
pub fn mint(
  local: &str,
  domain: &str,
  bits: u32,
  date: &str,
  randomness: &mut dyn Randomness,
  ticker: &mut Ticker,
) -> anyhow::Result<Option<String>> {
  let rand = randomness.alphabet_chars(RANDOM_LEN)?;
  let prefix = format!("1:{bits}:{date}:{local}@{domain}::{rand}:");
  let mut hash = Sha1::begin();
  hash.feed_bytes(prefix.as_bytes());

  for len in 1..=COUNTER_MAX {
    match search_counter_len(&hash, bits, len, ticker) {
      SearchResult::Found(counter) => {
        let text = format!("{prefix}{counter}");
        let token = crate::parse::token::parse(&text)?;
        anyhow::ensure!(
          token.bits == bits && sha1_value_at_least(&text, bits),
          "internal error: minted incorrect stamp {text}"
        );
        return Ok(Some(text));
      }
      SearchResult::Aborted => return Ok(None),
      SearchResult::NotFound => continue,
    }
  }
  anyhow::bail!("internal error: counter length limit ({COUNTER_MAX}) exceeded")
}

fn sha1_value_at_least(text: &str, bits: u32) -> bool {
  let mut hash = Sha1::begin();
  hash.feed_bytes(text.as_bytes());
  sha1::leading_zero_bits(&hash.finalize()) >= bits
}
