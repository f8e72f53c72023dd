// Domain allow-lists: comma/semicolon/space-separated hostnames, matched case-insensitively.
// Same rationale as `iplist` for skipping a grammar crate here.

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DomainList(Vec<String>);

impl DomainList {
  pub fn parse(list: &str) -> DomainList {
    let domains = list
      .split(|c| matches!(c, ',' | ';' | ' '))
      .filter(|item| !item.is_empty())
      .map(str::to_string)
      .collect();
    DomainList(domains)
  }

  pub fn matches(&self, domain: &str) -> bool {
    self.0.iter().any(|entry| entry.eq_ignore_ascii_case(domain))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn matches_case_insensitively() {
    let list = DomainList::parse("forest.example");
    assert!(list.matches("Forest.Example"));
    assert!(!list.matches("meadow.example"));
  }

  #[test]
  fn entries_are_separated_by_comma_semicolon_or_space() {
    let list = DomainList::parse("a.example, b.example; c.example d.example");
    assert!(list.matches("b.example"));
    assert!(list.matches("d.example"));
  }

  #[test]
  fn empty_list_matches_nothing() {
    let list = DomainList::parse("");
    assert!(!list.matches("forest.example"));
  }
}
