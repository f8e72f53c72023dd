// RFC 5451 Authentication-Results parsing. A result is either a full parse (authserv-id,
// version, and the complete resinfo list) or a partial one: the authserv-id and version parsed
// but the resinfo list failed partway through. Partial results are still useful to the driver,
// which only needs to know the authserv-id matches the local hostname and whether "x-hashcash"
// appears among whatever methods were recovered, so this can't be a single all-or-nothing grammar
// (see SPEC_FULL.md 4.2).

use super::mailbox::skip_cfws;

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

fn is_digit(b: u8) -> bool {
  b.is_ascii_digit()
}

fn is_alpha(b: u8) -> bool {
  b.is_ascii_alphabetic()
}

/// Ordinary dot-atom-text, as used for `authserv-id` and `result`.
fn skip_dot_atom_text(s: &[u8]) -> Option<&[u8]> {
  let mut i = 0;
  loop {
    if s.get(i) == Some(&b'.') {
      i += 1;
      continue;
    }
    match s.get(i) {
      Some(&b) if !is_ctl(b) && !is_space(b) && !is_special(b) => {
        i += 1;
      }
      _ => break,
    }
  }
  if i == 0 {
    None
  } else {
    Some(&s[i..])
  }
}

/// The RFC 5451 dot-atom-text variant used for `method`/`property`, which also excludes `=` and
/// `/` to resolve the grammar's ambiguity between `method/version=` and `method=`.
fn skip_dot_atom_text_5451(s: &[u8]) -> Option<&[u8]> {
  let mut i = 0;
  loop {
    if s.get(i) == Some(&b'.') {
      i += 1;
      continue;
    }
    match s.get(i) {
      Some(&b) if !is_ctl(b) && !is_space(b) && !is_special(b) && b != b'=' && b != b'/' => {
        i += 1;
      }
      _ => break,
    }
  }
  if i == 0 {
    None
  } else {
    Some(&s[i..])
  }
}

fn parse_dot_atom_text<'a>(s: &'a [u8], out: &mut String) -> Option<&'a [u8]> {
  let rest = skip_dot_atom_text(s)?;
  let consumed = &s[..s.len() - rest.len()];
  out.push_str(&String::from_utf8_lossy(consumed));
  Some(rest)
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

/// Authentication-Results, either fully or partially parsed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthResults {
  pub authserv_id: String,
  pub version: String,
  pub methods: Vec<String>,
  /// Set when the resinfo list failed to parse past `methods`; `authserv_id`/`version` are
  /// still valid in that case.
  pub partial: bool,
}

impl AuthResults {
  pub fn has_method(&self, method: &str) -> bool {
    self.methods.iter().any(|m| m.eq_ignore_ascii_case(method))
  }
}

fn parse_version(s: &[u8]) -> (String, &[u8]) {
  if !s.first().is_some_and(|&b| is_digit(b)) {
    return ("1".to_string(), s);
  }
  let mut i = 0;
  while s.get(i) == Some(&b'0') {
    i += 1;
  }
  let digits_start = i;
  while s.get(i).is_some_and(|&b| is_digit(b)) {
    i += 1;
  }
  if i == digits_start {
    ("0".to_string(), &s[i..])
  } else {
    (String::from_utf8_lossy(&s[digits_start..i]).into_owned(), &s[i..])
  }
}

/// Parses one resinfo entry (`method[/version] = result reasonspec* propspec*`), returning the
/// method name and the unconsumed remainder, or `None` on malformed input.
fn parse_resinfo<'a>(mut s: &'a [u8]) -> Option<(String, &'a [u8])> {
  s = skip_cfws(s);
  let rest = skip_dot_atom_text_5451(s)?;
  let method = String::from_utf8_lossy(&s[..s.len() - rest.len()]).into_owned();
  s = rest;

  s = skip_cfws(s);
  if s.first() == Some(&b'/') {
    s = skip_cfws(&s[1..]);
    if !s.first().is_some_and(|&b| is_digit(b)) {
      return None;
    }
    while s.first().is_some_and(|&b| is_digit(b)) {
      s = &s[1..];
    }
    s = skip_cfws(s);
  }

  if s.first() != Some(&b'=') {
    return None;
  }
  s = &s[1..];

  s = skip_cfws(s);
  s = skip_dot_atom_text(s)?; // result

  s = skip_cfws(s);
  while s.first().is_some_and(|&b| is_alpha(b)) {
    while s.first().is_some_and(|&b| is_alpha(b)) {
      s = &s[1..];
    }
    s = skip_cfws(s);
    if s.first() == Some(&b'.') {
      s = skip_dot_atom_text_5451(skip_cfws(&s[1..]))?;
      s = skip_cfws(s);
    }
    if s.first() != Some(&b'=') {
      return None;
    }
    s = &s[1..];
    s = skip_cfws(s);
    if s.first() != Some(&b'@') {
      s = if s.first() == Some(&b'"') { skip_quoted_string(s)? } else { skip_dot_atom_text(s)? };
    }
    if s.first() == Some(&b'@') {
      s = skip_dot_atom_text(&s[1..])?;
    }
    s = skip_cfws(s);
  }

  Some((method, s))
}

/// Parses an `Authentication-Results` header field body, returning either a complete result or
/// (in `Ok`, with `partial` set) whatever authserv-id/version/method prefix was recoverable.
pub fn parse(field: &str) -> AuthResults {
  let bytes = field.as_bytes();

  let mut authserv_id = String::new();
  let s = match parse_dot_atom_text(skip_cfws(bytes), &mut authserv_id) {
    Some(rest) => rest,
    None => {
      return AuthResults { authserv_id, version: String::new(), methods: Vec::new(), partial: true }
    }
  };

  let s = skip_cfws(s);
  let (version, mut s) = parse_version(s);
  s = skip_cfws(s);

  let mut methods = Vec::new();
  if s.first() != Some(&b';') {
    return AuthResults { authserv_id, version, methods, partial: true };
  }
  while s.first() == Some(&b';') {
    match parse_resinfo(skip_cfws(&s[1..])) {
      Some((method, rest)) => {
        methods.push(method);
        s = rest;
      }
      None => return AuthResults { authserv_id, version, methods, partial: true },
    }
  }
  let partial = !s.is_empty();
  AuthResults { authserv_id, version, methods, partial }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn full_parse_with_one_method() {
    let result = parse("mail.example.com 1; x-hashcash=pass");
    assert!(!result.partial);
    assert_eq!(result.authserv_id, "mail.example.com");
    assert_eq!(result.version, "1");
    assert_eq!(result.methods, vec!["x-hashcash"]);
  }

  #[test]
  fn default_version_is_one() {
    let result = parse("mail.example.com; spf=pass");
    assert_eq!(result.version, "1");
  }

  #[test]
  fn leading_zeroes_are_stripped() {
    let result = parse("mail.example.com 007; spf=pass");
    assert_eq!(result.version, "7");
  }

  #[test]
  fn all_zero_version_collapses_to_zero() {
    let result = parse("mail.example.com 000; spf=pass");
    assert_eq!(result.version, "0");
  }

  #[test]
  fn multiple_methods_with_reasonspec() {
    let result =
      parse("mail.example.com 1; spf=pass smtp.mailfrom=hare@forest.example; x-hashcash=pass");
    assert!(!result.partial);
    assert_eq!(result.methods, vec!["spf", "x-hashcash"]);
  }

  #[test]
  fn method_version_is_accepted_and_ignored() {
    let result = parse("mail.example.com 1; x-hashcash/1=pass");
    assert!(!result.partial);
    assert_eq!(result.methods, vec!["x-hashcash"]);
  }

  #[test]
  fn none_value_is_partial() {
    let result = parse("mail.example.com; none");
    assert!(result.partial);
    assert_eq!(result.authserv_id, "mail.example.com");
  }

  #[test]
  fn malformed_method_list_keeps_authserv_and_prior_methods() {
    let result = parse("mail.example.com 1; spf=pass; x-hashcash");
    assert!(result.partial);
    assert_eq!(result.authserv_id, "mail.example.com");
    assert_eq!(result.version, "1");
    assert_eq!(result.methods, vec!["spf"]);
  }

  #[test]
  fn unparsable_authserv_id_is_partial_with_empty_fields() {
    let result = parse("  ");
    assert!(result.partial);
    assert!(result.authserv_id.is_empty());
  }

  #[test]
  fn has_method_is_case_insensitive() {
    let result = parse("mail.example.com 1; X-Hashcash=pass");
    assert!(result.has_method("x-hashcash"));
  }
}
