// RFC 5321 reverse/forward-path and RFC 2822 addr-spec parsing, both built on the same
// local-domain scanner parameterized by whether comments are allowed around tokens (RFC 2822
// contexts allow CFWS; RFC 5321 paths only allow folding whitespace).

use super::Mailbox;
use anyhow::Context as _;

const SPECIAL: &[u8] = b"\"(),.:;<>@[\\]";

fn is_ctl(b: u8) -> bool {
  b < 0x20 || b == 0x7f
}

fn is_space(b: u8) -> bool {
  matches!(b, b' ' | b'\t' | b'\r' | b'\n' | 0x0b | 0x0c)
}

fn is_special(b: u8) -> bool {
  SPECIAL.contains(&b)
}

pub(crate) fn skip_fws(s: &[u8]) -> &[u8] {
  let mut i = 0;
  while i < s.len() && is_space(s[i]) {
    i += 1;
  }
  &s[i..]
}

fn skip_comment(s: &[u8]) -> &[u8] {
  let mut i = 0;
  let mut depth = 0i32;
  loop {
    if i >= s.len() {
      // Unterminated comment at end of input is accepted, matching the reference scanner.
      return &s[i..];
    }
    match s[i] {
      b'(' => {
        depth += 1;
        i += 1;
      }
      b')' => {
        depth -= 1;
        i += 1;
        if depth == 0 {
          return &s[i..];
        }
      }
      b'\\' => {
        i += 1;
        if i < s.len() {
          i += 1;
        }
      }
      _ => i += 1,
    }
  }
}

pub(crate) fn skip_cfws(s: &[u8]) -> &[u8] {
  let mut s = skip_fws(s);
  while s.first() == Some(&b'(') {
    s = skip_fws(skip_comment(s));
  }
  s
}

fn ws(s: &[u8], allow_comments: bool) -> &[u8] {
  if allow_comments {
    skip_cfws(s)
  } else {
    skip_fws(s)
  }
}

/// Extends `out` with atext characters (folding `.` in as a literal separator), returning the
/// unconsumed remainder, or `None` if no atext characters were found.
fn parse_dot_atom_text<'a>(mut s: &'a [u8], out: &mut Vec<u8>) -> Option<&'a [u8]> {
  loop {
    let start_len = out.len();
    let mut i = 0;
    while i < s.len() && !is_ctl(s[i]) && !is_space(s[i]) && !is_special(s[i]) {
      out.push(s[i]);
      i += 1;
    }
    s = &s[i..];
    if out.len() == start_len {
      return None;
    }
    if s.first() == Some(&b'.') {
      out.push(b'.');
      s = &s[1..];
    } else {
      return Some(s);
    }
  }
}

pub(crate) fn skip_dot_atom_text(s: &[u8]) -> Option<&[u8]> {
  parse_dot_atom_text(s, &mut Vec::new())
}

/// Parses quoted content delimited by `open`/`close` starting just past the opening delimiter,
/// folding whitespace runs into a single space and honoring backslash escapes.
fn parse_quoted<'a>(open: u8, close: u8, mut s: &'a [u8], out: &mut Vec<u8>) -> Option<&'a [u8]> {
  let mut folding = false;
  loop {
    match s.first().copied() {
      Some(b'\\') if s.len() > 1 => {
        out.push(s[1]);
        folding = false;
        s = &s[2..];
      }
      None => return None,
      Some(b) if b == close => return Some(&s[1..]),
      Some(b) if b == open => return None,
      Some(b) if is_space(b) => {
        if !folding {
          out.push(b' ');
          folding = true;
        }
        s = &s[1..];
      }
      Some(b) => {
        out.push(b);
        folding = false;
        s = &s[1..];
      }
    }
  }
}

fn parse_local_domain(s: &[u8], allow_comments: bool) -> Option<(Mailbox, &[u8])> {
  let mut s = ws(s, allow_comments);
  let mut local = Vec::new();
  s = if s.first() == Some(&b'"') {
    parse_quoted(b'"', b'"', &s[1..], &mut local)?
  } else {
    parse_dot_atom_text(s, &mut local)?
  };
  s = ws(s, allow_comments);
  if s.first() != Some(&b'@') {
    return None;
  }
  s = &s[1..];
  s = ws(s, allow_comments);

  let mut domain = Vec::new();
  s = if s.first() == Some(&b'[') {
    domain.push(b'[');
    let rest = parse_quoted(b'[', b']', &s[1..], &mut domain)?;
    domain.push(b']');
    rest
  } else {
    parse_dot_atom_text(s, &mut domain)?
  };
  s = ws(s, allow_comments);

  Some((
    Mailbox {
      local: String::from_utf8_lossy(&local).into_owned(),
      domain: String::from_utf8_lossy(&domain).into_owned(),
    },
    s,
  ))
}

/// The RFC 2822 addr-spec form (comments allowed), used by `address_list`.
pub(super) fn parse_addr_spec(s: &[u8]) -> Option<(Mailbox, &[u8])> {
  parse_local_domain(s, true)
}

/// Parses an RFC 5321 reverse-path or forward-path: optional angle brackets, optional
/// `@a,@b:` source route, a mailbox. Returns `None` for an empty reverse-path (`<>`).
pub fn parse_reverse_path(path: &str) -> anyhow::Result<Option<Mailbox>> {
  let mut s = skip_fws(path.as_bytes());
  let mut angle = false;
  if s.first() == Some(&b'<') {
    angle = true;
    s = &s[1..];
  }
  s = skip_fws(s);

  let empty = if angle {
    s.first() == Some(&b'>') && skip_fws(&s[1..]).is_empty()
  } else {
    s.is_empty()
  };
  if empty {
    return Ok(None);
  }

  if s.first() == Some(&b'@') {
    loop {
      s = skip_fws(&s[1..]);
      s = skip_dot_atom_text(s).context("malformed source route in reverse-path")?;
      s = skip_fws(s);
      if s.first() == Some(&b',') {
        s = skip_fws(&s[1..]);
        if s.first() == Some(&b'@') {
          continue;
        }
      }
      break;
    }
    anyhow::ensure!(s.first() == Some(&b':'), "expected ':' after source route");
    s = skip_fws(&s[1..]);
  }

  let (mailbox, mut rest) =
    parse_local_domain(s, false).context("malformed mailbox in reverse-path")?;
  if angle && rest.first() == Some(&b'>') {
    rest = skip_fws(&rest[1..]);
  }
  anyhow::ensure!(rest.is_empty(), "trailing data after reverse-path mailbox");
  Ok(Some(mailbox))
}

/// Whether `s` can be rendered unquoted as dot-atom-text on both sides of `@` — i.e. the
/// rendered `local@domain` needs no quoting. Used by the minting engine to decide whether a
/// recipient mailbox can receive a stamp at all.
pub fn is_dot_atom_text(s: &str) -> bool {
  skip_dot_atom_text(s.as_bytes()).is_some_and(<[u8]>::is_empty)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn empty_reverse_path_is_none() {
    assert_eq!(parse_reverse_path("<>").unwrap(), None);
    assert_eq!(parse_reverse_path("").unwrap(), None);
  }

  #[test]
  fn simple_reverse_path() {
    let mailbox = parse_reverse_path("<hare@forest.example>").unwrap().unwrap();
    assert_eq!(mailbox.local, "hare");
    assert_eq!(mailbox.domain, "forest.example");
  }

  #[test]
  fn reverse_path_without_angle_brackets() {
    let mailbox = parse_reverse_path("fox@forest.example").unwrap().unwrap();
    assert_eq!(mailbox.local, "fox");
    assert_eq!(mailbox.domain, "forest.example");
  }

  #[test]
  fn reverse_path_with_source_route() {
    let mailbox = parse_reverse_path("<@a.example,@b.example:hare@forest.example>")
      .unwrap()
      .unwrap();
    assert_eq!(mailbox.local, "hare");
    assert_eq!(mailbox.domain, "forest.example");
  }

  #[test]
  fn domain_literal_preserves_brackets() {
    let mailbox = parse_reverse_path("<hare@[192.0.2.1]>").unwrap().unwrap();
    assert_eq!(mailbox.domain, "[192.0.2.1]");
  }

  #[test]
  fn malformed_path_is_error() {
    assert!(parse_reverse_path("<hare@").is_err());
    assert!(parse_reverse_path("not an address").is_err());
  }

  #[test]
  fn dot_atom_text_classification() {
    assert!(is_dot_atom_text("fox"));
    assert!(is_dot_atom_text("fox.hare"));
    assert!(!is_dot_atom_text("\"quoted\""));
    assert!(!is_dot_atom_text("has space"));
  }
}
