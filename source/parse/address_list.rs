// RFC 2822 address-list grammar: group (`display-name : members ;`) and mailbox
// (`display-name? <addr-spec>` or bare addr-spec) forms, yielding mailboxes in appearance order.

use super::mailbox::{self, skip_cfws};
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

fn skip_quoted_string(s: &[u8]) -> Option<&[u8]> {
  if s.first() != Some(&b'"') {
    return None;
  }
  let mut i = 1;
  while i < s.len() && s[i] != b'"' {
    if s[i] == b'\\' && i + 1 < s.len() {
      i += 1;
    }
    i += 1;
  }
  if s.get(i) == Some(&b'"') {
    Some(&s[i + 1..])
  } else {
    None
  }
}

/// Skips a display-name phrase: a run of CFWS-separated atoms, quoted-strings, and (obsolete)
/// bare dots. Always succeeds, possibly consuming nothing.
fn skip_phrase(s: &[u8]) -> &[u8] {
  let mut s = skip_cfws(s);
  loop {
    let before = s.len();
    if s.first() == Some(&b'"') {
      match skip_quoted_string(s) {
        Some(rest) => s = rest,
        None => return s,
      }
    } else if s.first() == Some(&b'.') {
      s = &s[1..];
    } else {
      let mut i = 0;
      while i < s.len() && !is_ctl(s[i]) && !is_space(s[i]) && !is_special(s[i]) {
        i += 1;
      }
      s = &s[i..];
    }
    s = skip_cfws(s);
    if s.len() == before {
      return s;
    }
  }
}

fn parse_addr_spec(s: &[u8]) -> Option<(Mailbox, &[u8])> {
  mailbox::parse_addr_spec(s)
}

fn parse_address<'a>(mailbox_only: bool, s: &'a [u8], out: &mut Vec<Mailbox>) -> Option<&'a [u8]> {
  let s0 = skip_cfws(s);
  let p = skip_phrase(s0);
  if p.len() == s0.len() && p.first() == Some(&b':') {
    // Bare leading colon with no display-name: not a valid group.
    return None;
  }
  match p.first() {
    Some(&b':') => {
      if mailbox_only {
        return None;
      }
      let mut rest = skip_cfws(&p[1..]);
      if rest.first() != Some(&b';') {
        rest = parse_address_list(true, rest, out)?;
      }
      if rest.first() != Some(&b';') {
        return None;
      }
      Some(skip_cfws(&rest[1..]))
    }
    Some(&b'<') => {
      let (found, rest) = parse_addr_spec(&p[1..])?;
      if rest.first() != Some(&b'>') {
        return None;
      }
      out.push(found);
      Some(skip_cfws(&rest[1..]))
    }
    _ => {
      let (found, rest) = parse_addr_spec(s0)?;
      out.push(found);
      Some(rest)
    }
  }
}

fn parse_address_list<'a>(
  mailbox_only: bool,
  mut s: &'a [u8],
  out: &mut Vec<Mailbox>,
) -> Option<&'a [u8]> {
  loop {
    s = parse_address(mailbox_only, s, out)?;
    if s.first() == Some(&b',') {
      s = &s[1..];
    } else {
      return Some(s);
    }
  }
}

/// Parses a `To`/`Cc`-style address-list header value into mailboxes in appearance order,
/// flattening groups.
pub fn parse(field: &str) -> anyhow::Result<Vec<Mailbox>> {
  let mut out = Vec::new();
  let rest =
    parse_address_list(false, field.as_bytes(), &mut out).context("malformed address list")?;
  anyhow::ensure!(rest.is_empty(), "trailing data after address list");
  Ok(out)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn single_mailbox() {
    let list = parse("Hare <hare@forest.example>").unwrap();
    assert_eq!(list, vec![Mailbox { local: "hare".into(), domain: "forest.example".into() }]);
  }

  #[test]
  fn bare_addr_spec() {
    let list = parse("fox@forest.example").unwrap();
    assert_eq!(list, vec![Mailbox { local: "fox".into(), domain: "forest.example".into() }]);
  }

  #[test]
  fn comma_separated_list() {
    let list = parse("hare@forest.example, Fox <fox@forest.example>").unwrap();
    assert_eq!(
      list,
      vec![
        Mailbox { local: "hare".into(), domain: "forest.example".into() },
        Mailbox { local: "fox".into(), domain: "forest.example".into() },
      ]
    );
  }

  #[test]
  fn group_syntax_flattens_members() {
    let list = parse("Animals: hare@forest.example, fox@forest.example;").unwrap();
    assert_eq!(
      list,
      vec![
        Mailbox { local: "hare".into(), domain: "forest.example".into() },
        Mailbox { local: "fox".into(), domain: "forest.example".into() },
      ]
    );
  }

  #[test]
  fn empty_group_is_allowed() {
    let list = parse("Undisclosed-recipients:;").unwrap();
    assert!(list.is_empty());
  }

  #[test]
  fn malformed_list_is_error() {
    assert!(parse("hare@forest.example,").is_err());
    assert!(parse("<hare@forest.example").is_err());
  }
}
