//
// special_ip.rs - Special-IP UDP socket creation (§4.4, ambient)
//
// Purpose:
//   The per-client special-IP socket needs `IP_FREEBIND` because the address it binds to is
//   added to the loopback interface (via `netlink::set_loopback_address`) in the same call
//   that creates it, and the two aren't ordered relative to each other at the libc level.
//   Socket creation itself is the same `socket2` + raw-option pattern `solicit.rs` already
//   uses for its ICMPv6 socket; this module only adds the two options `routemgr`-adjacent
//   sockets don't need.
//

use std::io;
use std::net::{Ipv6Addr, SocketAddrV6};
use std::os::fd::AsRawFd;

use socket2::{Domain, Protocol, SockAddr, Socket, Type};

/// `IPV6_FREEBIND`, not exposed by `libc` under all target triples.
const IPV6_FREEBIND: libc::c_int = 78;

/// Creates and binds the non-blocking UDP/IPv6 socket described in §4.4: `SO_REUSEADDR`,
/// `IP_FREEBIND` (so the bind succeeds even if `set_loopback_address` hasn't completed the
/// kernel's internal route cache update yet), bound to `(addr, port)`.
pub fn bind_special_socket(addr: Ipv6Addr, port: u16) -> io::Result<std::net::UdpSocket> {
    let sock = Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::UDP))?;
    sock.set_reuse_address(true)?;
    unsafe {
        let val: libc::c_int = 1;
        let rc = libc::setsockopt(
            sock.as_raw_fd(),
            libc::IPPROTO_IPV6,
            IPV6_FREEBIND,
            &val as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    sock.set_nonblocking(true)?;
    let bind_addr = SocketAddrV6::new(addr, port, 0, 0);
    sock.bind(&SockAddr::from(bind_addr))?;
    Ok(sock.into())
}
