//
// netlink.rs - Kernel route/neighbor adapter (routemgr collaborator, §4.3, §6)
//
// Purpose:
//   Implements `roam_core::RouteNeighborAdapter` against real `NETLINK_ROUTE` sockets. The
//   request/dump plumbing follows the usual send-request/collect-replies netlink dance; this
//   module adds the mutating (insert/remove) requests the core needs that a read-only dump
//   doesn't.
//

use std::io;
use std::net::IpAddr;
use std::os::fd::AsRawFd;

use netlink_packet_core::{
    NetlinkDeserializable, NetlinkMessage, NetlinkPayload, NetlinkSerializable, NLM_F_ACK,
    NLM_F_CREATE, NLM_F_REPLACE, NLM_F_REQUEST,
};
use netlink_packet_route::{
    neighbour::{NeighbourAddress, NeighbourAttribute, NeighbourHeader, NeighbourMessage, NeighbourState},
    route::{RouteAddress, RouteAttribute, RouteHeader, RouteMessage, RouteProtocol, RouteScope, RouteType},
    AddressFamily, RouteNetlinkMessage,
};
use netlink_sys::{Socket, SocketAddr};
use roam_core::RouteNeighborAdapter;

/// Sends a single request and collects every reply the dump callback accepts.
fn netlink_dump<T, F, R>(mut req: NetlinkMessage<T>, f: F) -> io::Result<Vec<R>>
where
    T: NetlinkSerializable + NetlinkDeserializable,
    F: Fn(NetlinkMessage<T>) -> io::Result<Option<R>>,
{
    let mut socket = Socket::new(netlink_sys::constants::NETLINK_ROUTE)?;
    socket.bind(&SocketAddr::new(0, 0))?;
    req.header.flags = NLM_F_REQUEST | netlink_packet_core::NLM_F_DUMP;
    let mut send_buf = vec![0u8; req.buffer_len()];
    req.finalize();
    req.serialize(&mut send_buf);
    if socket.send(send_buf.as_slice(), 0)? != send_buf.len() {
        return Err(io::Error::other("failed to send netlink request"));
    }
    let (recv_buf, _) = socket.recv_from_full()?;
    let mut view = &recv_buf[..];
    let mut out = Vec::new();
    while !view.is_empty() {
        let msg = NetlinkMessage::<T>::deserialize(view).map_err(io::Error::other)?;
        let len = msg.header.length as usize;
        if let Some(r) = f(msg)? {
            out.push(r);
        }
        if len == 0 || len > view.len() {
            return Err(io::Error::other("malformed netlink message"));
        }
        view = &view[len..];
    }
    Ok(out)
}

/// Sends a mutating request (insert/remove) and waits for the kernel ack, translating a
/// netlink `Error(0)` into success and any other error code into an `io::Error`.
fn netlink_ack(mut req: NetlinkMessage<RouteNetlinkMessage>, flags: u16) -> io::Result<()> {
    let mut socket = Socket::new(netlink_sys::constants::NETLINK_ROUTE)?;
    socket.bind(&SocketAddr::new(0, 0))?;
    req.header.flags = NLM_F_REQUEST | NLM_F_ACK | flags;
    let mut send_buf = vec![0u8; req.buffer_len()];
    req.finalize();
    req.serialize(&mut send_buf);
    if socket.send(send_buf.as_slice(), 0)? != send_buf.len() {
        return Err(io::Error::other("failed to send netlink request"));
    }
    let (recv_buf, _) = socket.recv_from_full()?;
    let msg = NetlinkMessage::<RouteNetlinkMessage>::deserialize(&recv_buf).map_err(io::Error::other)?;
    match msg.payload {
        NetlinkPayload::Error(e) if e.code.is_none() => Ok(()),
        NetlinkPayload::Error(e) => Err(io::Error::other(format!("netlink error: {e:?}"))),
        _ => Ok(()),
    }
}

fn route_message(table: u32, addr: IpAddr, plen: u8, oif: u32) -> RouteMessage {
    let mut msg = RouteMessage::default();
    msg.header = RouteHeader {
        address_family: if addr.is_ipv4() { AddressFamily::Inet } else { AddressFamily::Inet6 },
        destination_prefix_length: plen,
        source_prefix_length: 0,
        tos: 0,
        table: (table & 0xff) as u8,
        protocol: RouteProtocol::Static,
        scope: RouteScope::Universe,
        kind: RouteType::Unicast,
        flags: Default::default(),
    };
    msg.attributes.push(RouteAttribute::Table(table));
    msg.attributes.push(match addr {
        IpAddr::V4(v4) => RouteAttribute::Destination(RouteAddress::Inet(v4)),
        IpAddr::V6(v6) => RouteAttribute::Destination(RouteAddress::Inet6(v6)),
    });
    msg.attributes.push(RouteAttribute::Oif(oif));
    msg
}

fn neighbour_message(oif: u32, addr: IpAddr, mac: Option<[u8; 6]>) -> NeighbourMessage {
    let mut msg = NeighbourMessage::default();
    msg.header = NeighbourHeader {
        family: if addr.is_ipv4() { AddressFamily::Inet } else { AddressFamily::Inet6 },
        ifindex: oif,
        state: NeighbourState::REACHABLE,
        flags: Default::default(),
        kind: 0,
    };
    msg.attributes.push(match addr {
        IpAddr::V4(v4) => NeighbourAttribute::Destination(NeighbourAddress::Inet(v4)),
        IpAddr::V6(v6) => NeighbourAttribute::Destination(NeighbourAddress::Inet6(v6)),
    });
    if let Some(mac) = mac {
        msg.attributes.push(NeighbourAttribute::LinkLocalAddress(mac.to_vec()));
    }
    msg
}

/// Adds (`add=true`) or removes a `/128` address on the loopback interface. Backs the
/// special-IP socket lifecycle (§4.4): the special IP itself is never reachable through any
/// real link, only through the loopback-scope interface the UDP socket binds to.
pub fn set_loopback_address(addr: std::net::Ipv6Addr, add: bool) -> io::Result<()> {
    use netlink_packet_route::address::{AddressAttribute, AddressHeader, AddressMessage};

    let lo_ifindex = {
        let name = std::ffi::CString::new("lo").unwrap();
        let idx = unsafe { libc::if_nametoindex(name.as_ptr()) };
        if idx == 0 {
            return Err(io::Error::last_os_error());
        }
        idx
    };

    let mut msg = AddressMessage::default();
    msg.header = AddressHeader {
        family: AddressFamily::Inet6,
        prefix_len: 128,
        flags: Default::default(),
        scope: netlink_packet_route::address::AddressScope::Universe,
        index: lo_ifindex,
    };
    msg.attributes.push(AddressAttribute::Address(IpAddr::V6(addr)));

    let kind = if add { RouteNetlinkMessage::NewAddress(msg) } else { RouteNetlinkMessage::DelAddress(msg) };
    let req = NetlinkMessage::from(kind);
    let flags = if add { NLM_F_CREATE | NLM_F_REPLACE } else { 0 };
    netlink_ack(req, flags)
}

/// Concrete `RouteNeighborAdapter` backed by `NETLINK_ROUTE`.
#[derive(Default)]
pub struct NetlinkRouteManager;

impl NetlinkRouteManager {
    pub fn new() -> Self {
        NetlinkRouteManager
    }
}

impl RouteNeighborAdapter for NetlinkRouteManager {
    fn insert_host_route(&mut self, table: u32, addr: IpAddr, plen: u8, oif: u32) -> io::Result<()> {
        let req = NetlinkMessage::from(RouteNetlinkMessage::NewRoute(route_message(table, addr, plen, oif)));
        netlink_ack(req, NLM_F_CREATE | NLM_F_REPLACE)
    }

    fn remove_host_route(&mut self, table: u32, addr: IpAddr, plen: u8, oif: u32) -> io::Result<()> {
        let req = NetlinkMessage::from(RouteNetlinkMessage::DelRoute(route_message(table, addr, plen, oif)));
        netlink_ack(req, 0)
    }

    fn insert_neighbor(&mut self, oif: u32, addr: IpAddr, mac: [u8; 6]) -> io::Result<()> {
        let req = NetlinkMessage::from(RouteNetlinkMessage::NewNeighbour(neighbour_message(oif, addr, Some(mac))));
        netlink_ack(req, NLM_F_CREATE | NLM_F_REPLACE)
    }

    fn remove_neighbor(&mut self, oif: u32, addr: IpAddr) -> io::Result<()> {
        let req = NetlinkMessage::from(RouteNetlinkMessage::DelNeighbour(neighbour_message(oif, addr, None)));
        netlink_ack(req, 0)
    }
}

/// Sends a non-route/neighbor mutation (e.g. a link `SetLink`) and waits for its ack. Shared
/// by the TUN bring-up path, which needs the same ack plumbing for a different message type.
pub(crate) fn ack_only(req: NetlinkMessage<RouteNetlinkMessage>) -> io::Result<()> {
    netlink_ack(req, 0)
}

/// Dumps every route currently installed in `table`, used at startup to detect routes that
/// already exist for clients the daemon is about to (re)discover (§4.7's "route appeared"
/// path also fires from this signal channel's live netlink group subscription in the
/// reference event loop; this function backs the one-shot catch-up dump).
pub fn dump_table_routes(table: u32) -> io::Result<Vec<(IpAddr, u8)>> {
    let mut req_msg = RouteMessage::default();
    req_msg.header.address_family = AddressFamily::Inet6;
    let req = NetlinkMessage::from(RouteNetlinkMessage::GetRoute(req_msg));
    netlink_dump(req, |msg| match msg.payload {
        NetlinkPayload::InnerMessage(RouteNetlinkMessage::NewRoute(ref route_msg)) => {
            let in_table = route_msg.attributes.iter().any(|a| matches!(a, RouteAttribute::Table(t) if *t == table))
                || route_msg.header.table as u32 == table;
            if !in_table {
                return Ok(None);
            }
            let plen = route_msg.header.destination_prefix_length;
            for a in &route_msg.attributes {
                if let RouteAttribute::Destination(RouteAddress::Inet6(addr)) = a {
                    return Ok(Some((IpAddr::V6(*addr), plen)));
                }
                if let RouteAttribute::Destination(RouteAddress::Inet(addr)) = a {
                    return Ok(Some((IpAddr::V4(*addr), plen)));
                }
            }
            Ok(None)
        }
        _ => Ok(None),
    })
}

const RTMGRP_NEIGH: u32 = 0x04;
const RTMGRP_IPV4_ROUTE: u32 = 0x40;
const RTMGRP_IPV6_ROUTE: u32 = 0x400;

fn set_non_blocking(fd: std::os::fd::RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// A change this daemon's event loop reacts to, observed on the shared route/neighbor
/// multicast subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteEvent {
    /// A route now exists for `addr/plen` in our export table (§4.7).
    RouteAdded(IpAddr, u8),
    /// The kernel reports a neighbor (bridge FDB / ARP/NDP cache) entry for `mac` reachable
    /// on `ifindex` — the trigger for `ClientManager::notify_mac` (§2's "when a local MAC is
    /// seen").
    NeighborSeen { mac: [u8; 6], ifindex: u32 },
}

/// Subscribes to the kernel's IPv4/IPv6 route-change and neighbor-change multicast groups.
/// Backs §4.7's "route-notification adapter" and the local-MAC-seen trigger for `notify_mac`
/// — the only other way to learn either would be to poll `dump_table_routes` on a timer, which
/// this event loop prefers to avoid.
pub struct RouteMonitor {
    socket: tokio::io::unix::AsyncFd<Socket>,
    table: u32,
}

impl RouteMonitor {
    pub fn bind(table: u32) -> io::Result<Self> {
        let mut socket = Socket::new(netlink_sys::constants::NETLINK_ROUTE)?;
        socket.bind(&SocketAddr::new(0, RTMGRP_IPV4_ROUTE | RTMGRP_IPV6_ROUTE | RTMGRP_NEIGH))?;
        set_non_blocking(socket.as_raw_fd())?;
        Ok(RouteMonitor {
            socket: tokio::io::unix::AsyncFd::new(socket)?,
            table,
        })
    }

    /// Waits for the next multicast notification worth dispatching: a `NewRoute` in our
    /// export table, or a `NewNeighbour` carrying a link-layer address. Deletions and other
    /// chatter sharing the subscription are skipped.
    pub async fn recv_event(&mut self) -> io::Result<RouteEvent> {
        loop {
            let mut guard = self.socket.readable_mut().await?;
            let result = guard.try_io(|inner| inner.get_ref().recv_from_full());
            let (buf, _from) = match result {
                Ok(r) => r?,
                Err(_would_block) => continue,
            };
            let mut view = &buf[..];
            while !view.is_empty() {
                let msg = NetlinkMessage::<RouteNetlinkMessage>::deserialize(view).map_err(io::Error::other)?;
                let len = msg.header.length as usize;
                match msg.payload {
                    NetlinkPayload::InnerMessage(RouteNetlinkMessage::NewRoute(route_msg)) => {
                        let in_table = route_msg.attributes.iter().any(|a| matches!(a, RouteAttribute::Table(t) if *t == self.table))
                            || route_msg.header.table as u32 == self.table;
                        if in_table {
                            for a in &route_msg.attributes {
                                match a {
                                    RouteAttribute::Destination(RouteAddress::Inet6(addr)) => {
                                        return Ok(RouteEvent::RouteAdded(IpAddr::V6(*addr), route_msg.header.destination_prefix_length))
                                    }
                                    RouteAttribute::Destination(RouteAddress::Inet(addr)) => {
                                        return Ok(RouteEvent::RouteAdded(IpAddr::V4(*addr), route_msg.header.destination_prefix_length))
                                    }
                                    _ => {}
                                }
                            }
                        }
                    }
                    NetlinkPayload::InnerMessage(RouteNetlinkMessage::NewNeighbour(neigh_msg)) => {
                        let ifindex = neigh_msg.header.ifindex;
                        for a in &neigh_msg.attributes {
                            if let NeighbourAttribute::LinkLocalAddress(lladdr) = a {
                                if let Ok(mac) = <[u8; 6]>::try_from(lladdr.as_slice()) {
                                    return Ok(RouteEvent::NeighborSeen { mac, ifindex });
                                }
                            }
                        }
                    }
                    _ => {}
                }
                if len == 0 || len > view.len() {
                    break;
                }
                view = &view[len..];
            }
        }
    }
}
