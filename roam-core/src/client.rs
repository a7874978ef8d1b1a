//
// client.rs - Client and ClientIp data model (§3)
//
// Purpose:
//   The tri-state per-address tag and the per-MAC registry entry the rest of the core is
//   built around. This module only carries data and the small helpers that read it;
//   transitions and their side effects live in `state_machine`.
//

use std::net::Ipv6Addr;
use std::os::fd::RawFd;
use std::time::Instant;

/// Per-address lifecycle state. See `state_machine::set_state` for the transition table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IpState {
    /// No installed route/neighbor for this address attributable to this client.
    Inactive,
    /// A host route and neighbor entry have been installed and not yet removed.
    Active,
    /// At least one solicitation has been issued; no route installed yet.
    Tentative,
}

#[derive(Clone, Debug)]
pub struct ClientIp {
    pub addr: Ipv6Addr,
    pub state: IpState,
    /// Monotonic timestamp of the last state change.
    pub changed_at: Instant,
    /// Only meaningful while `state == Tentative`.
    pub tentative_retries: u32,
}

impl ClientIp {
    pub fn new(addr: Ipv6Addr, now: Instant) -> Self {
        ClientIp {
            addr,
            state: IpState::Inactive,
            changed_at: now,
            tentative_retries: 0,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Client {
    pub mac: [u8; 6],
    pub ifindex: u32,
    pub addrs: Vec<ClientIp>,
    pub node_ip_initialized: bool,
    /// Owning fd for the special-IP socket, if bound.
    pub special_ip_fd: Option<RawFd>,
    pub special_ip: Option<Ipv6Addr>,
    /// Only set for entries living in the old-clients set.
    pub expiry: Option<Instant>,
}

impl Client {
    pub fn new(mac: [u8; 6], ifindex: u32) -> Self {
        Client {
            mac,
            ifindex,
            addrs: Vec::new(),
            node_ip_initialized: false,
            special_ip_fd: None,
            special_ip: None,
            expiry: None,
        }
    }

    /// A client is active iff at least one of its addresses is ACTIVE or TENTATIVE.
    pub fn is_active(&self) -> bool {
        self.addrs
            .iter()
            .any(|a| matches!(a.state, IpState::Active | IpState::Tentative))
    }

    pub fn find(&self, addr: &Ipv6Addr) -> Option<usize> {
        self.addrs.iter().position(|a| &a.addr == addr)
    }

    pub fn mac_is_zero(mac: &[u8; 6]) -> bool {
        mac.iter().all(|&b| b == 0)
    }
}
