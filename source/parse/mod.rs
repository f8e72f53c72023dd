pub mod address_list;
pub mod auth_results;
pub mod date;
pub mod domainlist;
pub mod iplist;
pub mod mailbox;
pub mod token;

/// A `local@domain` pair, the unit RFC 5321/2822 addresses and hashcash resources are compared
/// as: local-part case-sensitive, domain case-insensitive.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Mailbox {
  pub local: String,
  pub domain: String,
}

impl Mailbox {
  pub fn matches(&self, other: &Mailbox) -> bool {
    self.local == other.local && self.domain.eq_ignore_ascii_case(&other.domain)
  }
}

impl std::fmt::Display for Mailbox {
  fn fmt(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
    write!(formatter, "{}@{}", self.local, self.domain)
  }
}
