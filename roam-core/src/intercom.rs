//
// intercom.rs - Peer Intercom Interface (§4.8, collaborator contract)
//
// Purpose:
//   The core only ever calls three operations on the mesh gossip layer and only ever gets
//   two callbacks dispatched back into it. This module is the seam; the wire format and
//   transport live in `roam-intercom`.
//

use std::net::{Ipv6Addr, SocketAddr};

use crate::client::IpState;

/// A read-only snapshot of a client's addresses, enough to reconstruct it on a peer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientSnapshot {
    pub mac: [u8; 6],
    pub ifindex: u32,
    pub addrs: Vec<(Ipv6Addr, IpState)>,
}

/// Operations the core consumes from the mesh gossip layer.
pub trait Intercom {
    /// Broadcasts a claim for `special_ip`/`mac`. The transport is expected to eventually
    /// invoke a client-manager callback that binds the special-IP socket if the client still
    /// exists; the reference transport in `roam-intercom` does this synchronously once the
    /// broadcast is on the wire (no acknowledgement is awaited — see Non-goals).
    fn claim(&mut self, special_ip: Ipv6Addr, mac: [u8; 6]);

    /// Unicasts a full client description to `to`.
    fn info(&mut self, to: SocketAddr, client: &ClientSnapshot, relinquished: bool);

    /// Broadcasts a discovery query for `addr`.
    fn seek(&mut self, addr: Ipv6Addr);
}

/// A no-op `Intercom` for tests that don't care about peer traffic.
#[derive(Default)]
pub struct NullIntercom {
    pub claims: Vec<(Ipv6Addr, [u8; 6])>,
    pub infos: Vec<(SocketAddr, ClientSnapshot, bool)>,
    pub seeks: Vec<Ipv6Addr>,
}

impl Intercom for NullIntercom {
    fn claim(&mut self, special_ip: Ipv6Addr, mac: [u8; 6]) {
        self.claims.push((special_ip, mac));
    }

    fn info(&mut self, to: SocketAddr, client: &ClientSnapshot, relinquished: bool) {
        self.infos.push((to, client.clone(), relinquished));
    }

    fn seek(&mut self, addr: Ipv6Addr) {
        self.seeks.push(addr);
    }
}
