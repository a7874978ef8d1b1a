//
// prefix.rs - IPv6 prefix value type and containment test
//
// Purpose:
//   Client addresses, the IPv4-in-IPv6 carrier space and the node-client "/48" are all
//   expressed as the same (address, plen) value. This module owns parsing that value out
//   of `addr/plen` text and the bitwise containment test the rest of the core relies on.
//

use std::fmt;
use std::net::{AddrParseError, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

/// An IPv6 prefix, optionally flagged as carrying IPv4-mapped addresses.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Prefix {
    pub addr: Ipv6Addr,
    pub plen: u8,
    pub is_v4: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrefixError {
    Malformed,
    BadAddress(String),
    PlenOutOfRange(u8),
}

impl fmt::Display for PrefixError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PrefixError::Malformed => write!(f, "malformed prefix, expected addr/plen"),
            PrefixError::BadAddress(s) => write!(f, "invalid address: {s}"),
            PrefixError::PlenOutOfRange(p) => write!(f, "prefix length {p} out of range"),
        }
    }
}

impl std::error::Error for PrefixError {}

impl From<AddrParseError> for PrefixError {
    fn from(e: AddrParseError) -> Self {
        PrefixError::BadAddress(e.to_string())
    }
}

impl Prefix {
    pub fn new(addr: Ipv6Addr, plen: u8, is_v4: bool) -> Self {
        Prefix { addr, plen, is_v4 }
    }

    /// Compares the first `plen` bits of `addr` against `self.addr`.
    pub fn contains(&self, addr: &Ipv6Addr) -> bool {
        prefix_contains(self, addr)
    }
}

/// Parses `addr/plen` text into a [`Prefix`].
///
/// `is_v4` is not carried in the text form (callers that need the v4 carrier flag set
/// it themselves after parsing, e.g. for `v4prefix`).
pub fn parse_prefix(s: &str) -> Result<Prefix, PrefixError> {
    let (addr_s, plen_s) = s.split_once('/').ok_or(PrefixError::Malformed)?;
    let addr = Ipv6Addr::from_str(addr_s)?;
    let plen: u8 = plen_s.parse().map_err(|_| PrefixError::Malformed)?;
    if plen > 128 {
        return Err(PrefixError::PlenOutOfRange(plen));
    }
    Ok(Prefix { addr, plen, is_v4: false })
}

/// Bitwise compares the first `prefix.plen` bits of `addr` against `prefix.addr`.
pub fn prefix_contains(prefix: &Prefix, addr: &Ipv6Addr) -> bool {
    if prefix.plen == 0 {
        return true;
    }
    let a = prefix.addr.octets();
    let b = addr.octets();
    let full_bytes = (prefix.plen / 8) as usize;
    let rem_bits = prefix.plen % 8;

    if a[..full_bytes] != b[..full_bytes] {
        return false;
    }
    if rem_bits == 0 {
        return true;
    }
    let mask = 0xffu8 << (8 - rem_bits);
    (a[full_bytes] & mask) == (b[full_bytes] & mask)
}

/// Extracts the embedded IPv4 address from an IPv4-mapped client address, following the
/// RFC 6052-style convention of a `/96` carrier prefix with the IPv4 bytes in the low 32
/// bits. Returns `None` if `v4prefix` isn't a `/96` or `addr` isn't contained in it.
pub fn mapped_ipv4(addr: &Ipv6Addr, v4prefix: &Prefix) -> Option<Ipv4Addr> {
    if v4prefix.plen != 96 || !v4prefix.contains(addr) {
        return None;
    }
    let o = addr.octets();
    Some(Ipv4Addr::new(o[12], o[13], o[14], o[15]))
}

/// Builds the IPv4-mapped client address for `v4` under `v4prefix` (the inverse of
/// [`mapped_ipv4`]).
pub fn embed_ipv4(v4prefix: &Prefix, v4: Ipv4Addr) -> Ipv6Addr {
    let mut o = v4prefix.addr.octets();
    o[12..16].copy_from_slice(&v4.octets());
    Ipv6Addr::from(o)
}
