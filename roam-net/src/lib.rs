//! Concrete collaborator implementations for the roaming core: TUN device bring-up, netlink
//! route/neighbor management, and ARP/ICMPv6 solicitation.

pub mod netlink;
pub mod solicit;
pub mod special_ip;
pub mod tun;

pub use netlink::{set_loopback_address, NetlinkRouteManager, RouteEvent, RouteMonitor};
pub use solicit::NetSolicitor;
pub use special_ip::bind_special_socket;
pub use tun::Tun;

use std::io;

/// Returns the MAC address of the interface with the given ifindex via `SIOCGIFNAME` +
/// `SIOCGIFHWADDR`, the same two-step ioctl dance used elsewhere in this tree.
pub fn mac_by_ifindex(ifindex: u32) -> io::Result<[u8; 6]> {
    unsafe {
        let fd = libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0);
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let mut req: libc::ifreq = std::mem::zeroed();
        req.ifr_ifru.ifru_ifindex = ifindex as libc::c_int;
        if libc::ioctl(fd, libc::SIOCGIFNAME, &mut req) < 0 {
            libc::close(fd);
            return Err(io::Error::last_os_error());
        }
        if libc::ioctl(fd, libc::SIOCGIFHWADDR, &mut req) < 0 {
            libc::close(fd);
            return Err(io::Error::last_os_error());
        }
        libc::close(fd);
        let mut mac = [0u8; 6];
        for (i, v) in req.ifr_ifru.ifru_hwaddr.sa_data[..6].iter().enumerate() {
            mac[i] = *v as u8;
        }
        Ok(mac)
    }
}
