//! IPv4 addressing for nodes: CIDR parsing, validation and the auto-assignment range.

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

/// Prefix length assumed when an address is given without one.
pub const DEFAULT_PREFIX: u8 = 24;

/// Smallest prefix length accepted for a node address.
pub const MIN_PREFIX: u8 = 8;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("{0:?} is not a dotted-quad IPv4 address")]
    NotIpv4(String),
    #[error("prefix length {0} is outside 8..=32")]
    Prefix(u8),
    #[error("invalid prefix length in {0:?}")]
    PrefixSyntax(String),
    #[error("{0} lies in the reserved auto-assignment range")]
    Reserved(Ipv4Cidr),
    #[error("node id {0} does not fit in the auto-assignment range")]
    OutOfRange(u32),
}

/// An IPv4 address together with its prefix length, e.g. `10.0.0.1/24`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Ipv4Cidr {
    pub address: Ipv4Addr,
    pub prefix: u8,
}

impl Ipv4Cidr {
    pub fn new(address: Ipv4Addr, prefix: u8) -> Self {
        Self { address, prefix }
    }

    /// The network address, with host bits cleared.
    pub fn network(&self) -> Ipv4Addr {
        Ipv4Addr::from_bits(self.address.to_bits() & mask(self.prefix))
    }

    /// Whether `address` lies inside this subnet.
    pub fn contains(&self, address: Ipv4Addr) -> bool {
        address.to_bits() & mask(self.prefix) == self.network().to_bits()
    }
}

fn mask(prefix: u8) -> u32 {
    match prefix {
        0 => 0,
        p => u32::MAX << (32 - u32::from(p.min(32))),
    }
}

impl fmt::Display for Ipv4Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.address, self.prefix)
    }
}

impl FromStr for Ipv4Cidr {
    type Err = Error;

    /// Parse `a.b.c.d` or `a.b.c.d/len`. Only the syntax is checked here, see
    /// [`AutoAssignRange::validate`].
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, prefix) = match s.split_once('/') {
            Some((addr, prefix)) => {
                let prefix =
                    prefix.parse::<u8>().map_err(|_| Error::PrefixSyntax(s.to_string()))?;
                (addr, prefix)
            }
            None => (s, DEFAULT_PREFIX),
        };
        let address = addr.parse::<Ipv4Addr>().map_err(|_| Error::NotIpv4(s.to_string()))?;
        if prefix > 32 {
            return Err(Error::Prefix(prefix));
        }

        Ok(Self { address, prefix })
    }
}

/// Parse a host address given either bare or in CIDR notation, dropping the prefix length.
pub fn parse_host(s: &str) -> Result<Ipv4Addr, Error> {
    let addr = s.split_once('/').map_or(s, |(addr, _)| addr);
    addr.parse::<Ipv4Addr>().map_err(|_| Error::NotIpv4(s.to_string()))
}

/// The subnet node addresses are drawn from when none (or an invalid one) is given.
///
/// Hosts in this range are reserved for assignment by node id, `<network>.<id>`, so user
/// supplied addresses must stay outside of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AutoAssignRange {
    subnet: Ipv4Cidr,
}

impl Default for AutoAssignRange {
    fn default() -> Self {
        Self { subnet: Ipv4Cidr::new(Ipv4Addr::new(192, 168, 10, 0), 24) }
    }
}

impl AutoAssignRange {
    pub fn new(subnet: Ipv4Cidr) -> Self {
        Self { subnet }
    }

    pub fn subnet(&self) -> Ipv4Cidr {
        self.subnet
    }

    pub fn contains(&self, address: Ipv4Addr) -> bool {
        self.subnet.contains(address)
    }

    /// The address reserved for the node with the given id.
    ///
    /// Fails when the id would spill over the subnet or hit its broadcast address.
    pub fn assign(&self, id: u32) -> Result<Ipv4Cidr, Error> {
        let host_bits = 32 - u32::from(self.subnet.prefix);
        let hosts = 1u64 << host_bits;
        if id == 0 || u64::from(id) >= hosts - 1 {
            return Err(Error::OutOfRange(id));
        }

        let address = Ipv4Addr::from_bits(self.subnet.network().to_bits() | id);
        Ok(Ipv4Cidr::new(address, self.subnet.prefix))
    }

    /// Check that a user supplied address is usable for a node: dotted quad, prefix within
    /// [`MIN_PREFIX`]`..=32`, and outside of this range.
    pub fn validate(&self, s: &str) -> Result<Ipv4Cidr, Error> {
        let cidr = s.parse::<Ipv4Cidr>()?;
        if cidr.prefix < MIN_PREFIX {
            return Err(Error::Prefix(cidr.prefix));
        }
        if self.contains(cidr.address) {
            return Err(Error::Reserved(cidr));
        }

        Ok(cidr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_with_and_without_prefix() {
        let cidr: Ipv4Cidr = "10.0.0.1/16".parse().unwrap();
        assert_eq!(cidr, Ipv4Cidr::new(Ipv4Addr::new(10, 0, 0, 1), 16));
        assert_eq!(cidr.to_string(), "10.0.0.1/16");

        let bare: Ipv4Cidr = "10.0.0.2".parse().unwrap();
        assert_eq!(bare.prefix, DEFAULT_PREFIX);
    }

    #[test]
    fn rejects_malformed_addresses() {
        assert!(matches!("10.0.0".parse::<Ipv4Cidr>(), Err(Error::NotIpv4(_))));
        assert!(matches!("fe80::1/64".parse::<Ipv4Cidr>(), Err(Error::NotIpv4(_))));
        assert!(matches!("10.0.0.1/x".parse::<Ipv4Cidr>(), Err(Error::PrefixSyntax(_))));
        assert!(matches!("10.0.0.1/33".parse::<Ipv4Cidr>(), Err(Error::Prefix(33))));
    }

    #[test]
    fn host_parsing_drops_prefix() {
        assert_eq!(parse_host("10.0.0.2/24").unwrap(), Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(parse_host("10.0.0.2").unwrap(), Ipv4Addr::new(10, 0, 0, 2));
        assert!(parse_host("n2").is_err());
    }

    #[test]
    fn validation_enforces_prefix_and_reserved_range() {
        let range = AutoAssignRange::default();

        assert!(range.validate("10.0.0.1/24").is_ok());
        assert!(range.validate("10.0.0.1/32").is_ok());
        assert!(matches!(range.validate("10.0.0.1/7"), Err(Error::Prefix(7))));
        assert!(matches!(range.validate("192.168.10.7/24"), Err(Error::Reserved(_))));
        // Outside the /24 even though it shares the first two octets.
        assert!(range.validate("192.168.11.7/24").is_ok());
    }

    #[test]
    fn assigns_by_node_id() {
        let range = AutoAssignRange::default();

        assert_eq!(range.assign(3).unwrap().to_string(), "192.168.10.3/24");
        assert_eq!(range.assign(254).unwrap().to_string(), "192.168.10.254/24");
        assert_eq!(range.assign(255), Err(Error::OutOfRange(255)));
        assert_eq!(range.assign(0), Err(Error::OutOfRange(0)));
    }

    #[test]
    fn subnet_membership() {
        let subnet: Ipv4Cidr = "10.1.0.0/16".parse().unwrap();
        assert!(subnet.contains(Ipv4Addr::new(10, 1, 200, 3)));
        assert!(!subnet.contains(Ipv4Addr::new(10, 2, 0, 1)));
    }
}
