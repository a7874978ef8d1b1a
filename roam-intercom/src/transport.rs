//
// transport.rs - Reference intercom transport (§4.9)
//
// Purpose:
//   One UDP/IPv6 socket per node, bound to `[::]:INTERCOM_PORT`. `claim`/`seek` broadcast to
//   the configured peer list; `info` unicasts to whoever asked. No retries, no
//   authentication: this is the minimal transport the core needs to exercise its gossip
//   contract standalone, not a hardened protocol.
//

use std::io;
use std::net::{Ipv6Addr, SocketAddr};

use roam_core::{ClientSnapshot, Intercom};
use tokio::net::UdpSocket;

use crate::wire::{decode, encode, Message};

/// Binds `[::]:port` and remembers the peer list to gossip to.
pub struct UdpIntercom {
    socket: UdpSocket,
    peers: Vec<SocketAddr>,
    port: u16,
}

impl UdpIntercom {
    pub async fn bind(port: u16, peers: Vec<SocketAddr>) -> io::Result<Self> {
        let socket = UdpSocket::bind(("::", port)).await?;
        Ok(UdpIntercom { socket, peers, port })
    }

    fn send_best_effort(&self, buf: &[u8], to: SocketAddr) {
        match self.socket.try_send_to(buf, to) {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                log::debug!("intercom send to {to} would block, dropping (no retries by design)");
            }
            Err(e) => {
                log::warn!("intercom send to {to} failed: {e}");
            }
        }
    }

    fn broadcast(&self, msg: &Message) {
        let buf = encode(msg);
        for peer in &self.peers {
            self.send_best_effort(&buf, *peer);
        }
    }

    /// Waits for the next datagram and decodes it, returning the message and its source.
    /// Malformed datagrams are logged and skipped rather than propagated, matching the
    /// "benign miss" error kind for unsolicited garbage on the wire.
    pub async fn recv_message(&self) -> io::Result<(Message, SocketAddr)> {
        let mut buf = [0u8; 512];
        loop {
            let (n, from) = self.socket.recv_from(&mut buf).await?;
            match decode(&buf[..n]) {
                Ok(msg) => return Ok((msg, from)),
                Err(e) => {
                    log::debug!("dropping malformed intercom datagram from {from}: {e}");
                }
            }
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Intercom for UdpIntercom {
    fn claim(&mut self, special_ip: Ipv6Addr, mac: [u8; 6]) {
        self.broadcast(&Message::Claim { special_ip, mac });
    }

    fn info(&mut self, to: SocketAddr, client: &ClientSnapshot, relinquished: bool) {
        let msg = Message::Info {
            mac: client.mac,
            ifindex: client.ifindex,
            addrs: client.addrs.clone(),
            relinquished,
        };
        self.send_best_effort(&encode(&msg), to);
    }

    fn seek(&mut self, addr: Ipv6Addr) {
        self.broadcast(&Message::Seek { addr });
    }
}
