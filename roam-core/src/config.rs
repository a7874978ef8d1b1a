//
// config.rs - Core-consumed configuration (§6)
//
// Purpose:
//   This is the value the outer CLI/config-file layer is required to hand the core once
//   parsed and validated; the core never parses text itself. roam-daemon builds one of
//   these from `clap` flags and hands it, by value, to the components below.
//

use std::net::Ipv4Addr;
use std::time::Duration;

use crate::prefix::Prefix;

#[derive(Clone, Debug)]
pub struct Config {
    /// Start of the deterministic IPv4 allocation range (inclusive).
    pub start: Ipv4Addr,
    /// End of the deterministic IPv4 allocation range (inclusive).
    pub end: Ipv4Addr,
    /// IPv6 prefix the allocated IPv4 range is carried inside of.
    pub v4prefix: Prefix,
    /// Client prefixes the daemon is responsible for (zero or more).
    pub prefixes: Vec<Prefix>,
    /// The `/48` used to synthesize special per-client IPv6 addresses.
    pub node_client_prefix: Prefix,
    /// Numeric kernel routing table host routes are installed into.
    pub export_table: u32,
    /// Interface index packets for mapped IPv4 clients are routed through.
    pub nat46ifindex: u32,
    /// How long a departed client's addresses are kept in the old-clients set.
    pub oldclients_keep: Duration,
    /// Interval between successive seek retries (local + peer).
    pub seek_interval: Duration,
    /// Age at which a buffered packet is dropped from an unknown-destination entry.
    pub packet_timeout: Duration,
    /// UDP port special-IP sockets and the intercom transport bind to.
    pub intercom_port: u16,
    /// Interfaces a destination-less seek should broadcast a solicitation on, since no single
    /// owning interface is known yet for an address nobody has claimed.
    pub client_ifindices: Vec<u32>,
    /// TUN interface name (ambient).
    pub tun_name: String,
    /// TUN interface MTU (ambient).
    pub tun_mtu: u32,
    /// Peer node addresses for the reference intercom transport (ambient).
    pub peers: Vec<std::net::SocketAddr>,
}

impl Config {
    pub fn allocation_range(&self) -> (u32, u32) {
        (u32::from(self.start), u32::from(self.end))
    }

    /// First configured prefix that contains `addr`, if any.
    pub fn containing_prefix(&self, addr: &std::net::Ipv6Addr) -> Option<&Prefix> {
        self.prefixes.iter().find(|p| p.contains(addr))
    }

    /// Whether `addr` is an address the daemon is responsible for: in one of the configured
    /// client prefixes, or in the IPv4-in-IPv6 carrier prefix. `containing_prefix` alone misses
    /// mapped-v4 destinations, which never fall inside a configured client prefix.
    pub fn is_valid_client_address(&self, addr: &std::net::Ipv6Addr) -> bool {
        self.containing_prefix(addr).is_some() || self.v4prefix.contains(addr)
    }
}
