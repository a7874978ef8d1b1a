//
// solicit.rs - ARP/ICMPv6 solicitation collaborator (§4.3, §4.6)
//
// Purpose:
//   Implements `roam_core::SolicitAdapter`. An address entering TENTATIVE gets exactly one
//   probe emitted here: an ICMPv6 Neighbor Solicitation for a native client address, or an
//   ARP request for one that's IPv4-mapped. Both go out over a raw `socket2` socket, and the
//   ARP frame is built by hand over a packet socket the same way a raw Ethernet header gets
//   assembled byte-by-byte anywhere a crate needs one without pulling in a full packet-parsing
//   dependency.
//

use std::io;
use std::net::{Ipv6Addr, SocketAddrV6};
use std::os::fd::AsRawFd;

use roam_core::prefix::mapped_ipv4;
use roam_core::{Prefix, SolicitAdapter};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};

const ND_NEIGHBOR_SOLICIT: u8 = 135;
const ND_OPT_SOURCE_LINKADDR: u8 = 1;

fn build_neighbor_solicitation(target: Ipv6Addr, src_mac: [u8; 6]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(32);
    buf.push(ND_NEIGHBOR_SOLICIT);
    buf.push(0); // code
    buf.extend_from_slice(&[0, 0]); // checksum, filled in by the kernel for raw ICMPv6 sockets
    buf.extend_from_slice(&[0, 0, 0, 0]); // reserved
    buf.extend_from_slice(&target.octets());
    buf.push(ND_OPT_SOURCE_LINKADDR);
    buf.push(1); // option length in units of 8 bytes
    buf.extend_from_slice(&src_mac);
    buf
}

fn solicited_node_multicast(target: &Ipv6Addr) -> Ipv6Addr {
    let o = target.octets();
    Ipv6Addr::new(0xff02, 0, 0, 0, 0, 1, 0xff00 | o[13] as u16, u16::from_be_bytes([o[14], o[15]]))
}

fn build_arp_request(src_mac: [u8; 6], src_ip: [u8; 4], target_ip: [u8; 4]) -> [u8; 42] {
    let mut frame = [0u8; 42];
    frame[0..6].copy_from_slice(&[0xff; 6]); // broadcast
    frame[6..12].copy_from_slice(&src_mac);
    frame[12..14].copy_from_slice(&0x0806u16.to_be_bytes()); // ethertype ARP

    let arp = &mut frame[14..42];
    arp[0..2].copy_from_slice(&1u16.to_be_bytes()); // htype ethernet
    arp[2..4].copy_from_slice(&0x0800u16.to_be_bytes()); // ptype ipv4
    arp[4] = 6; // hlen
    arp[5] = 4; // plen
    arp[6..8].copy_from_slice(&1u16.to_be_bytes()); // oper: request
    arp[8..14].copy_from_slice(&src_mac);
    arp[14..18].copy_from_slice(&src_ip);
    arp[18..24].copy_from_slice(&[0; 6]); // target hw unknown
    arp[24..28].copy_from_slice(&target_ip);
    frame
}

/// Concrete `SolicitAdapter`. Holds the client-facing node prefix needed to tell a native
/// client address apart from an IPv4-mapped one, plus this node's own address/MAC per
/// interface so probes carry a valid source.
pub struct NetSolicitor {
    v4prefix: Prefix,
    client_ifindices: Vec<u32>,
    icmp6: Socket,
}

impl NetSolicitor {
    pub fn new(v4prefix: Prefix, client_ifindices: Vec<u32>) -> io::Result<Self> {
        let icmp6 = Socket::new(Domain::IPV6, Type::RAW, Some(Protocol::ICMPV6))?;
        icmp6.set_nonblocking(true)?;
        Ok(NetSolicitor { v4prefix, client_ifindices, icmp6 })
    }

    fn send_ns(&self, target: Ipv6Addr, ifindex: u32, src_mac: [u8; 6]) -> io::Result<()> {
        let packet = build_neighbor_solicitation(target, src_mac);
        let dst = solicited_node_multicast(&target);
        let addr = SocketAddrV6::new(dst, 0, 0, ifindex);
        self.icmp6.send_to(&packet, &SockAddr::from(addr))?;
        Ok(())
    }

    fn send_arp(&self, v4: std::net::Ipv4Addr, ifindex: u32, src_mac: [u8; 6], src_ip: std::net::Ipv4Addr) -> io::Result<()> {
        let frame = build_arp_request(src_mac, src_ip.octets(), v4.octets());
        let sock = Socket::new(Domain::PACKET, Type::RAW, None)?;
        let mut sll: libc::sockaddr_ll = unsafe { std::mem::zeroed() };
        sll.sll_family = libc::AF_PACKET as u16;
        sll.sll_ifindex = ifindex as i32;
        sll.sll_halen = 6;
        sll.sll_protocol = (0x0806u16).to_be();
        let sockaddr = unsafe {
            SockAddr::new(
                std::mem::transmute_copy(&sll),
                std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
            )
        };
        sock.send_to(&frame, &sockaddr)?;
        Ok(())
    }
}

impl SolicitAdapter for NetSolicitor {
    fn solicit(&mut self, addr: Ipv6Addr, ifindex: u32) -> io::Result<()> {
        match mapped_ipv4(&addr, &self.v4prefix) {
            Some(v4) => {
                let mac = crate::mac_by_ifindex(ifindex)?;
                let src_ip = std::net::Ipv4Addr::new(0, 0, 0, 0);
                self.send_arp(v4, ifindex, mac, src_ip)
            }
            None => {
                let mac = crate::mac_by_ifindex(ifindex)?;
                self.send_ns(addr, ifindex, mac)
            }
        }
    }

    fn solicit_all(&mut self, addr: Ipv6Addr) -> io::Result<()> {
        // No single owning interface is known yet; probe every configured client-facing
        // interface and let whichever one actually carries the destination answer.
        for ifindex in self.client_ifindices.clone() {
            if let Err(e) = self.solicit(addr, ifindex) {
                log::debug!("solicit_all: probe on ifindex {ifindex} for {addr} failed: {e}");
            }
        }
        Ok(())
    }
}

impl std::os::fd::AsRawFd for NetSolicitor {
    fn as_raw_fd(&self) -> std::os::fd::RawFd {
        self.icmp6.as_raw_fd()
    }
}
