//
// tun.rs - TUN device collaborator (§4.10)
//
// Purpose:
//   Opens /dev/net/tun in IFF_TUN|IFF_NO_PI mode, brings the resulting interface up with
//   POINTOPOINT|MULTICAST|NOARP flags and the configured MTU, and exposes it as an
//   `AsyncFd<RawFd>` plus the synchronous `roam_core::TunWriter` the IP manager writes
//   through. The open/ioctl sequence follows the device-channel pattern other roaming
//   daemons use for their own TUN bring-up; the link-up step reuses this crate's own
//   netlink ack helper.
//

use std::ffi::CString;
use std::io;
use std::os::fd::{AsRawFd, RawFd};

use netlink_packet_core::NetlinkMessage;
use netlink_packet_route::link::{LinkAttribute, LinkFlags, LinkHeader, LinkMessage};
use netlink_packet_route::RouteNetlinkMessage;
use tokio::io::unix::AsyncFd;

use roam_core::TunWriter;

const TUNSETIFF: libc::c_ulong = 0x4004_54ca;
const TUN_FILE: &str = "/dev/net/tun";

fn set_non_blocking(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Opens `name` (creating it if it doesn't already exist) as an `IFF_TUN|IFF_NO_PI` device
/// and returns the raw fd plus the kernel-assigned ifindex.
fn open_tun(name: &str) -> io::Result<RawFd> {
    let path = CString::new(TUN_FILE).unwrap();
    let fd = unsafe { libc::open(path.as_ptr(), libc::O_RDWR) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }

    let mut ifr: libc::ifreq = unsafe { std::mem::zeroed() };
    let name_bytes = name.as_bytes();
    if name_bytes.len() >= ifr.ifr_name.len() {
        unsafe { libc::close(fd) };
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "interface name too long"));
    }
    for (dst, src) in ifr.ifr_name.iter_mut().zip(name_bytes.iter()) {
        *dst = *src as libc::c_char;
    }
    ifr.ifr_ifru.ifru_flags = (libc::IFF_TUN | libc::IFF_NO_PI) as libc::c_short;

    if unsafe { libc::ioctl(fd, TUNSETIFF, &mut ifr) } < 0 {
        let err = io::Error::last_os_error();
        unsafe { libc::close(fd) };
        return Err(err);
    }

    set_non_blocking(fd)?;
    Ok(fd)
}

fn ifindex_by_name(name: &str) -> io::Result<u32> {
    let cname = CString::new(name).unwrap();
    let idx = unsafe { libc::if_nametoindex(cname.as_ptr()) };
    if idx == 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(idx)
}

fn bring_link_up(ifindex: u32, mtu: u32) -> io::Result<()> {
    let mut msg = LinkMessage::default();
    msg.header = LinkHeader {
        index: ifindex,
        flags: LinkFlags::Up | LinkFlags::Pointopoint | LinkFlags::Multicast | LinkFlags::Noarp,
        change_mask: LinkFlags::Up | LinkFlags::Pointopoint | LinkFlags::Multicast | LinkFlags::Noarp,
        ..Default::default()
    };
    msg.attributes.push(LinkAttribute::Mtu(mtu));
    let req = NetlinkMessage::from(RouteNetlinkMessage::SetLink(msg));
    crate::netlink::ack_only(req)
}

/// A `/dev/net/tun` device, brought up per §4.10 (POINTOPOINT|MULTICAST|NOARP, configured MTU).
pub struct Tun {
    fd: AsyncFd<RawFd>,
    ifindex: u32,
}

impl Tun {
    pub fn open(name: &str, mtu: u32) -> io::Result<Self> {
        let fd = open_tun(name)?;
        let ifindex = match ifindex_by_name(name) {
            Ok(i) => i,
            Err(e) => {
                unsafe { libc::close(fd) };
                return Err(e);
            }
        };
        if let Err(e) = bring_link_up(ifindex, mtu) {
            unsafe { libc::close(fd) };
            return Err(e);
        }
        Ok(Tun { fd: AsyncFd::new(fd)?, ifindex })
    }

    pub fn ifindex(&self) -> u32 {
        self.ifindex
    }

    /// Waits for the device to become readable and reads one frame into `buf`, returning the
    /// number of bytes read. Used by the event loop's `tokio::select!` arm for the TUN fd.
    pub async fn read_frame(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let mut guard = self.fd.readable().await?;
            match guard.try_io(|inner| {
                let n = unsafe { libc::read(inner.as_raw_fd(), buf.as_mut_ptr() as *mut _, buf.len()) };
                if n < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(n as usize)
                }
            }) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }
}

impl Drop for Tun {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd.as_raw_fd()) };
    }
}

impl TunWriter for Tun {
    fn write_frame(&mut self, frame: &[u8]) -> io::Result<()> {
        let n = unsafe { libc::write(self.fd.as_raw_fd(), frame.as_ptr() as *const _, frame.len()) };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                return Err(err);
            }
            return Err(err);
        }
        if n as usize != frame.len() {
            return Err(io::Error::other("short write to tun device"));
        }
        Ok(())
    }
}
