// Hashcash token syntax: `1:bits:date:local@domain:ext:rand:counter`, exactly six colons. This
// is a total, single-shot grammar (unlike the mailbox/address-list/auth-results parsers), so it's
// expressed as a `peg` grammar in the style of the reference implementation's RFC 3501 dialect
// (see SPEC_FULL.md 4.2).

use anyhow::Context as _;

/// A parsed hashcash token. `text` retains the whitespace-stripped wire form, which is what gets
/// hashed during verification; the other fields are the token's own view of its fields.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Token {
  pub text: String,
  pub bits: u32,
  pub date: String,
  pub local: String,
  pub domain: String,
  pub ext: String,
  pub rand: String,
  pub counter: String,
}

peg::parser! {
  grammar grammar_() for str {
    rule digit() = ['0'..='9']

    rule bits() -> u32
      = s:$(digit()+) {? s.parse::<u32>().ok().filter(|v| *v <= 160).ok_or("bits out of range") }

    rule date() -> &'input str
      = s:$(digit()*<6,>)

    rule resource_part() -> &'input str
      = s:$((!['@' | ':'] [_])*)

    rule ext() -> &'input str
      = s:$((!':' [_])*)

    rule alphabet_char()
      = ['a'..='z' | 'A'..='Z' | '0'..='9' | '+' | '/' | '=']

    rule alphabet_run() -> &'input str
      = s:$(alphabet_char()*)

    pub rule token() -> (u32, &'input str, &'input str, &'input str, &'input str, &'input str, &'input str)
      = "1" ":" bits:bits() ":" date:date() ":" local:resource_part() "@" domain:resource_part()
        ":" ext:ext() ":" rand:alphabet_run() ":" counter:alphabet_run()
        { (bits, date, local, domain, ext, rand, counter) }
  }
}

/// Strips whitespace (matching the reference's `parse_token`, which copies the header value
/// skipping `isspace` bytes before syntax-checking it) and parses the result as a token.
pub fn parse(value: &str) -> anyhow::Result<Token> {
  let stripped: String = value.chars().filter(|c| !c.is_whitespace()).collect();
  let (bits, date, local, domain, ext, rand, counter) =
    grammar_::token(&stripped).context("malformed hashcash token")?;
  Ok(Token {
    bits,
    date: date.to_string(),
    local: local.to_string(),
    domain: domain.to_string(),
    ext: ext.to_string(),
    rand: rand.to_string(),
    counter: counter.to_string(),
    text: stripped,
  })
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parses_a_well_formed_token() {
    let token = parse("1:20:060831:hare@forest.example::abcd:ABCD").unwrap();
    assert_eq!(token.bits, 20);
    assert_eq!(token.date, "060831");
    assert_eq!(token.local, "hare");
    assert_eq!(token.domain, "forest.example");
    assert_eq!(token.ext, "");
    assert_eq!(token.rand, "abcd");
    assert_eq!(token.counter, "ABCD");
  }

  #[test]
  fn whitespace_is_stripped_before_parsing() {
    let token = parse("1:20:  060831:hare@forest.example::abcd:ABCD\n").unwrap();
    assert_eq!(token.text, "1:20:060831:hare@forest.example::abcd:ABCD");
  }

  #[test]
  fn rejects_bits_out_of_range() {
    assert!(parse("1:161:060831:hare@forest.example::abcd:ABCD").is_err());
  }

  #[test]
  fn rejects_short_date() {
    assert!(parse("1:20:0608:hare@forest.example::abcd:ABCD").is_err());
  }

  #[test]
  fn rejects_missing_at_sign() {
    assert!(parse("1:20:060831:hareforest.example::abcd:ABCD").is_err());
  }

  #[test]
  fn rejects_wrong_version() {
    assert!(parse("2:20:060831:hare@forest.example::abcd:ABCD").is_err());
  }

  #[test]
  fn accepts_empty_ext_rand_and_counter() {
    let token = parse("1:20:060831:hare@forest.example:::").unwrap();
    assert_eq!(token.ext, "");
    assert_eq!(token.rand, "");
    assert_eq!(token.counter, "");
  }

  #[test]
  fn rejects_non_alphabet_rand() {
    assert!(parse("1:20:060831:hare@forest.example::ab#cd:ABCD").is_err());
  }
}
