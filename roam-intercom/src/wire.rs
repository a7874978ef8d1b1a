//
// wire.rs - Intercom wire envelope (§4.9)
//
// Purpose:
//   Fixed-layout encode/decode for the three gossip messages. No length-prefixing beyond the
//   address count byte is needed since every field has a known size; this keeps the codec
//   allocation-free on decode, writing headers into fixed-size buffers instead of reaching
//   for a general serializer.
//

use std::io;
use std::net::Ipv6Addr;

use roam_core::IpState;

const TAG_CLAIM: u8 = 0;
const TAG_INFO: u8 = 1;
const TAG_SEEK: u8 = 2;
const MAX_ADDRS: usize = 8;

/// One decoded gossip message plus enough of the original fields to dispatch it straight
/// into `ClientManager::handle_claim`/`handle_info`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    Claim { special_ip: Ipv6Addr, mac: [u8; 6] },
    Info { mac: [u8; 6], ifindex: u32, addrs: Vec<(Ipv6Addr, IpState)>, relinquished: bool },
    Seek { addr: Ipv6Addr },
}

fn state_to_byte(s: IpState) -> u8 {
    match s {
        IpState::Inactive => 0,
        IpState::Active => 1,
        IpState::Tentative => 2,
    }
}

fn state_from_byte(b: u8) -> io::Result<IpState> {
    match b {
        0 => Ok(IpState::Inactive),
        1 => Ok(IpState::Active),
        2 => Ok(IpState::Tentative),
        other => Err(io::Error::new(io::ErrorKind::InvalidData, format!("bad ip state byte {other}"))),
    }
}

pub fn encode(msg: &Message) -> Vec<u8> {
    let mut buf = Vec::with_capacity(1 + 16 + 6 + 4 + 1 + MAX_ADDRS * 17 + 1);
    match msg {
        Message::Claim { special_ip, mac } => {
            buf.push(TAG_CLAIM);
            buf.extend_from_slice(&special_ip.octets());
            buf.extend_from_slice(mac);
            buf.extend_from_slice(&0u32.to_be_bytes());
            buf.push(0);
            buf.push(0); // relinquished, unused
        }
        Message::Info { mac, ifindex, addrs, relinquished } => {
            buf.push(TAG_INFO);
            buf.extend_from_slice(&Ipv6Addr::UNSPECIFIED.octets());
            buf.extend_from_slice(mac);
            buf.extend_from_slice(&ifindex.to_be_bytes());
            let count = addrs.len().min(MAX_ADDRS) as u8;
            buf.push(count);
            for (addr, state) in addrs.iter().take(MAX_ADDRS) {
                buf.extend_from_slice(&addr.octets());
                buf.push(state_to_byte(*state));
            }
            buf.push(if *relinquished { 1 } else { 0 });
        }
        Message::Seek { addr } => {
            buf.push(TAG_SEEK);
            buf.extend_from_slice(&addr.octets());
            buf.extend_from_slice(&[0u8; 6]);
            buf.extend_from_slice(&0u32.to_be_bytes());
            buf.push(0);
            buf.push(0);
        }
    }
    buf
}

pub fn decode(data: &[u8]) -> io::Result<Message> {
    if data.len() < 1 + 16 + 6 + 4 + 1 {
        return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "intercom message too short"));
    }
    let tag = data[0];
    let mut addr_octets = [0u8; 16];
    addr_octets.copy_from_slice(&data[1..17]);
    let addr = Ipv6Addr::from(addr_octets);
    let mut mac = [0u8; 6];
    mac.copy_from_slice(&data[17..23]);
    let ifindex = u32::from_be_bytes(data[23..27].try_into().unwrap());
    let count = data[27] as usize;

    match tag {
        TAG_CLAIM => Ok(Message::Claim { special_ip: addr, mac }),
        TAG_SEEK => Ok(Message::Seek { addr }),
        TAG_INFO => {
            let count = count.min(MAX_ADDRS);
            let pairs_len = count * 17;
            if data.len() < 28 + pairs_len + 1 {
                return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "truncated info pairs"));
            }
            let mut addrs = Vec::with_capacity(count);
            let mut off = 28;
            for _ in 0..count {
                let mut o = [0u8; 16];
                o.copy_from_slice(&data[off..off + 16]);
                let a = Ipv6Addr::from(o);
                let s = state_from_byte(data[off + 16])?;
                addrs.push((a, s));
                off += 17;
            }
            let relinquished = data[off] != 0;
            Ok(Message::Info { mac, ifindex, addrs, relinquished })
        }
        other => Err(io::Error::new(io::ErrorKind::InvalidData, format!("unknown intercom tag {other}"))),
    }
}
