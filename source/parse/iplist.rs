// IP/CIDR allow-lists, comma/semicolon/space-separated entries of an address with an optional
// `/prefixlen`. Not worth a `peg` grammar: the reference implementation itself just tokenizes on
// a handful of separator characters and hands each piece to the platform's address parser, which
// `std::net` already does for us.

use std::net::{Ipv4Addr, Ipv6Addr};

#[derive(Clone, Debug, PartialEq, Eq)]
enum Address {
  V4(Ipv4Addr, u32),
  V6(Ipv6Addr, u32),
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IpList(Vec<Address>);

fn parse_entry(item: &str) -> anyhow::Result<Address> {
  let (host, prefix) = match item.split_once('/') {
    Some((host, prefix)) => (host, Some(prefix)),
    None => (item, None),
  };
  let bad_netmask = || anyhow::anyhow!("can't parse netmask in '{item}'");

  if let Ok(addr) = host.parse::<Ipv6Addr>() {
    let net = match prefix {
      Some(p) => p.parse::<u32>().ok().filter(|n| *n <= 128).ok_or_else(bad_netmask)?,
      None => 128,
    };
    return Ok(Address::V6(addr, net));
  }
  if let Ok(addr) = host.parse::<Ipv4Addr>() {
    let net = match prefix {
      Some(p) => p.parse::<u32>().ok().filter(|n| *n <= 32).ok_or_else(bad_netmask)?,
      None => 32,
    };
    return Ok(Address::V4(addr, net));
  }
  anyhow::bail!("can't parse address in '{item}'")
}

impl IpList {
  pub fn parse(list: &str) -> anyhow::Result<IpList> {
    let mut out = Vec::new();
    for item in list.split(|c| matches!(c, ',' | ';' | ' ')) {
      if item.is_empty() {
        continue;
      }
      out.push(parse_entry(item)?);
    }
    Ok(IpList(out))
  }

  fn matches_v4(&self, addr: &Ipv4Addr) -> bool {
    let host = u32::from_be_bytes(addr.octets());
    self.0.iter().any(|entry| match entry {
      Address::V4(net_addr, net) => {
        *net == 0 || {
          let net_host = u32::from_be_bytes(net_addr.octets());
          net_host >> (32 - net) == host >> (32 - net)
        }
      }
      Address::V6(_, _) => false,
    })
  }

  fn matches_v6(&self, addr: &Ipv6Addr) -> bool {
    let host = addr.octets();
    self.0.iter().any(|entry| match entry {
      Address::V6(net_addr, net) => {
        let net_octets = net_addr.octets();
        let bytes = (*net as usize) / 8;
        let bits = net % 8;
        if host[..bytes] != net_octets[..bytes] {
          return false;
        }
        bits == 0 || net_octets[bytes] >> (8 - bits) == host[bytes] >> (8 - bits)
      }
      Address::V4(_, _) => false,
    })
  }

  /// Matches a connecting peer address, as captured by the protocol driver. `AF_LOCAL`
  /// (Unix-domain) peers are treated as if connecting from the IPv4 and IPv6 loopback addresses,
  /// and an IPv4-mapped IPv6 address is tried both as IPv6 and as the embedded IPv4 address.
  pub fn matches(&self, peer: &PeerAddress) -> bool {
    match peer {
      PeerAddress::V4(addr) => self.matches_v4(addr),
      PeerAddress::V6(addr) => {
        if let Some(mapped) = addr.to_ipv4_mapped() {
          if self.matches_v4(&mapped) {
            return true;
          }
        }
        self.matches_v6(addr)
      }
      PeerAddress::Local => self.matches_v4(&Ipv4Addr::LOCALHOST) || self.matches_v6(&Ipv6Addr::LOCALHOST),
    }
  }
}

/// The address family the protocol driver observed for the connecting peer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeerAddress {
  V4(Ipv4Addr),
  V6(Ipv6Addr),
  Local,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn matches_exact_v4_address() {
    let list = IpList::parse("192.0.2.1").unwrap();
    assert!(list.matches(&PeerAddress::V4("192.0.2.1".parse().unwrap())));
    assert!(!list.matches(&PeerAddress::V4("192.0.2.2".parse().unwrap())));
  }

  #[test]
  fn matches_v4_cidr_prefix() {
    let list = IpList::parse("192.0.2.0/24").unwrap();
    assert!(list.matches(&PeerAddress::V4("192.0.2.200".parse().unwrap())));
    assert!(!list.matches(&PeerAddress::V4("192.0.3.1".parse().unwrap())));
  }

  #[test]
  fn matches_v6_cidr_prefix() {
    let list = IpList::parse("2001:db8::/32").unwrap();
    assert!(list.matches(&PeerAddress::V6("2001:db8::1".parse().unwrap())));
    assert!(!list.matches(&PeerAddress::V6("2001:db9::1".parse().unwrap())));
  }

  #[test]
  fn local_peer_matches_loopback_entries() {
    let list = IpList::parse("127.0.0.1, ::1").unwrap();
    assert!(list.matches(&PeerAddress::Local));
  }

  #[test]
  fn ipv4_mapped_address_matches_v4_entry() {
    let list = IpList::parse("192.0.2.1").unwrap();
    let mapped: Ipv6Addr = "::ffff:192.0.2.1".parse().unwrap();
    assert!(list.matches(&PeerAddress::V6(mapped)));
  }

  #[test]
  fn entries_are_separated_by_comma_semicolon_or_space() {
    let list = IpList::parse("192.0.2.1, 192.0.2.2; 192.0.2.3 192.0.2.4").unwrap();
    assert!(list.matches(&PeerAddress::V4("192.0.2.4".parse().unwrap())));
  }

  #[test]
  fn rejects_unparsable_address() {
    assert!(IpList::parse("not-an-address").is_err());
  }

  #[test]
  fn rejects_out_of_range_netmask() {
    assert!(IpList::parse("192.0.2.0/33").is_err());
  }
}
