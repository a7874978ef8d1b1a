//
// sockets.rs - Special-IP socket adapter (§4.4, ambient)
//
// Purpose:
//   Implements `roam_core::SpecialIpSocketAdapter` against the real loopback-address +
//   UDP-socket plumbing in `roam-net`. Each bound socket gets its own reader task that
//   forwards decoded datagrams back to the main event loop over a channel, the same
//   one-task-per-connection shape the reference intercom transport uses for its single
//   wildcard socket, just fanned out per client.
//

use std::collections::HashMap;
use std::io;
use std::net::{Ipv6Addr, SocketAddr};
use std::os::fd::{AsRawFd, RawFd};

use roam_core::client_manager::SpecialIpSocketAdapter;
use tokio::sync::mpsc::UnboundedSender;

pub type SpecialIpDatagram = (Ipv6Addr, Vec<u8>, SocketAddr);

pub struct DaemonSockets {
    tasks: HashMap<RawFd, tokio::task::JoinHandle<()>>,
    tx: UnboundedSender<SpecialIpDatagram>,
}

impl DaemonSockets {
    pub fn new(tx: UnboundedSender<SpecialIpDatagram>) -> Self {
        DaemonSockets { tasks: HashMap::new(), tx }
    }
}

impl SpecialIpSocketAdapter for DaemonSockets {
    fn bind(&mut self, addr: Ipv6Addr, port: u16) -> io::Result<RawFd> {
        roam_net::set_loopback_address(addr, true)?;
        let std_sock = roam_net::bind_special_socket(addr, port)?;
        let sock = tokio::net::UdpSocket::from_std(std_sock)?;
        let fd = sock.as_raw_fd();
        let tx = self.tx.clone();
        let handle = tokio::spawn(async move {
            let mut buf = [0u8; 512];
            loop {
                match sock.recv_from(&mut buf).await {
                    Ok((n, from)) => {
                        if tx.send((addr, buf[..n].to_vec(), from)).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        log::debug!("special-ip socket for {addr} stopped reading: {e}");
                        break;
                    }
                }
            }
        });
        self.tasks.insert(fd, handle);
        Ok(fd)
    }

    fn unbind(&mut self, fd: RawFd, addr: Ipv6Addr) -> io::Result<()> {
        if let Some(handle) = self.tasks.remove(&fd) {
            handle.abort();
        }
        roam_net::set_loopback_address(addr, false)
    }
}
