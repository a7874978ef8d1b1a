//
// state_machine.rs - Per-address IP state machine and its kernel side effects (§4.3)
//
// Purpose:
//   `set_state` is the single place that moves a `ClientIp` between INACTIVE/ACTIVE/TENTATIVE
//   and, in the same call, drives the matching route/neighbor adapter calls (and a local-seek
//   request on entry into TENTATIVE). Nothing else in the crate is allowed to flip
//   `ClientIp::state`.
//

use std::io;
use std::net::{IpAddr, Ipv6Addr};
use std::time::Instant;

use crate::client::{ClientIp, IpState};
use crate::config::Config;
use crate::prefix::mapped_ipv4;

/// Collaborator boundary onto `routemgr`: insertion/removal of kernel host routes and
/// neighbor entries. Implemented by `roam-net` against real netlink sockets; tests use an
/// in-memory recorder.
pub trait RouteNeighborAdapter {
    fn insert_host_route(&mut self, table: u32, addr: IpAddr, plen: u8, oif: u32) -> io::Result<()>;
    fn remove_host_route(&mut self, table: u32, addr: IpAddr, plen: u8, oif: u32) -> io::Result<()>;
    fn insert_neighbor(&mut self, oif: u32, addr: IpAddr, mac: [u8; 6]) -> io::Result<()>;
    fn remove_neighbor(&mut self, oif: u32, addr: IpAddr) -> io::Result<()>;
}

/// Collaborator boundary onto `icmp6`/`arp`: emits a single solicitation for `addr` on
/// `ifindex`. Whether this becomes an ARP request or an ICMPv6 neighbor solicitation is the
/// adapter's concern, driven by whether `addr` is IPv4-mapped.
pub trait SolicitAdapter {
    /// Solicits `addr` on the single interface known to carry it.
    fn solicit(&mut self, addr: Ipv6Addr, ifindex: u32) -> io::Result<()>;
    /// Solicits `addr` on every locally configured client-facing interface, used by the IP
    /// Manager when seeking a destination whose owning interface isn't known yet.
    fn solicit_all(&mut self, addr: Ipv6Addr) -> io::Result<()>;
}

fn install_route_and_neighbor(
    addr: Ipv6Addr,
    mac: [u8; 6],
    ifindex: u32,
    cfg: &Config,
    routes: &mut dyn RouteNeighborAdapter,
) -> io::Result<()> {
    match mapped_ipv4(&addr, &cfg.v4prefix) {
        Some(v4) => {
            routes.insert_host_route(cfg.export_table, IpAddr::V6(addr), 128, cfg.nat46ifindex)?;
            routes.insert_host_route(cfg.export_table, IpAddr::V4(v4), 32, ifindex)?;
            routes.insert_neighbor(ifindex, IpAddr::V4(v4), mac)
        }
        None => {
            routes.insert_host_route(cfg.export_table, IpAddr::V6(addr), 128, ifindex)?;
            routes.insert_neighbor(ifindex, IpAddr::V6(addr), mac)
        }
    }
}

fn remove_route_and_neighbor(
    addr: Ipv6Addr,
    ifindex: u32,
    cfg: &Config,
    routes: &mut dyn RouteNeighborAdapter,
) -> io::Result<()> {
    match mapped_ipv4(&addr, &cfg.v4prefix) {
        Some(v4) => {
            routes.remove_host_route(cfg.export_table, IpAddr::V6(addr), 128, cfg.nat46ifindex)?;
            routes.remove_host_route(cfg.export_table, IpAddr::V4(v4), 32, ifindex)?;
            routes.remove_neighbor(ifindex, IpAddr::V4(v4))
        }
        None => {
            routes.remove_host_route(cfg.export_table, IpAddr::V6(addr), 128, ifindex)?;
            routes.remove_neighbor(ifindex, IpAddr::V6(addr))
        }
    }
}

/// Moves `ip` to `new_state`, performing the side effects from the §4.3 transition table.
/// Errors from the route/neighbor adapter are logged at the boundary by the caller's
/// collaborator implementation; this function always completes the state change.
pub fn set_state(
    ip: &mut ClientIp,
    mac: [u8; 6],
    ifindex: u32,
    new_state: IpState,
    cfg: &Config,
    routes: &mut dyn RouteNeighborAdapter,
    solicit: &mut dyn SolicitAdapter,
    now: Instant,
) -> io::Result<()> {
    use IpState::*;

    let from = ip.state;
    match (from, new_state) {
        (Inactive, Inactive) | (Active, Active) | (Tentative, Tentative) => {
            ip.changed_at = now;
            return Ok(());
        }
        (Inactive, Active) => {
            install_route_and_neighbor(ip.addr, mac, ifindex, cfg, routes)?;
        }
        (Inactive, Tentative) => {
            ip.tentative_retries = 0;
        }
        (Active, Inactive) => {
            remove_route_and_neighbor(ip.addr, ifindex, cfg, routes)?;
        }
        (Active, Tentative) => {
            // a confirmed address being re-solicited keeps its route installed until the
            // outcome is known; only the bookkeeping state flips.
        }
        (Tentative, Inactive) => {
            // no route was ever installed while tentative; nothing to remove.
        }
        (Tentative, Active) => {
            install_route_and_neighbor(ip.addr, mac, ifindex, cfg, routes)?;
        }
    }

    ip.state = new_state;
    ip.changed_at = now;
    if new_state == Tentative {
        solicit.solicit(ip.addr, ifindex)?;
    }
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::prefix::parse_prefix;

    fn cfg() -> Config {
        Config {
            start: "10.0.0.10".parse().unwrap(),
            end: "10.0.0.20".parse().unwrap(),
            v4prefix: parse_prefix("64:ff9b::/96").unwrap(),
            prefixes: vec![parse_prefix("fd00:1::/32").unwrap()],
            node_client_prefix: parse_prefix("fd00:1:2::/48").unwrap(),
            export_table: 100,
            nat46ifindex: 9,
            oldclients_keep: std::time::Duration::from_secs(60),
            seek_interval: std::time::Duration::from_secs(2),
            packet_timeout: std::time::Duration::from_secs(5),
            intercom_port: 4433,
            tun_name: "roam0".into(),
            tun_mtu: 1400,
            peers: vec![],
            client_ifindices: vec![],
        }
    }

    #[test]
    fn inactive_to_active_installs_route_and_neighbor() {
        let cfg = cfg();
        let mut routes = RecordingAdapter::default();
        let mut solicit = RecordingSolicit::default();
        let mut ip = ClientIp::new("fd00:1::42".parse().unwrap(), Instant::now());
        set_state(&mut ip, [2, 0, 0, 0, 0, 1], 3, IpState::Active, &cfg, &mut routes, &mut solicit, Instant::now()).unwrap();
        assert_eq!(ip.state, IpState::Active);
        assert_eq!(routes.calls.len(), 2);
        assert!(routes.calls[0].starts_with("insert_route"));
        assert!(routes.calls[1].starts_with("insert_neighbor"));
    }

    #[test]
    fn active_to_inactive_removes_route_and_neighbor() {
        let cfg = cfg();
        let mut routes = RecordingAdapter::default();
        let mut solicit = RecordingSolicit::default();
        let mut ip = ClientIp::new("fd00:1::42".parse().unwrap(), Instant::now());
        ip.state = IpState::Active;
        set_state(&mut ip, [2, 0, 0, 0, 0, 1], 3, IpState::Inactive, &cfg, &mut routes, &mut solicit, Instant::now()).unwrap();
        assert_eq!(ip.state, IpState::Inactive);
        assert!(routes.calls[0].starts_with("remove_route"));
        assert!(routes.calls[1].starts_with("remove_neighbor"));
    }

    #[test]
    fn same_state_is_idempotent_and_emits_no_route_calls() {
        let cfg = cfg();
        let mut routes = RecordingAdapter::default();
        let mut solicit = RecordingSolicit::default();
        let mut ip = ClientIp::new("fd00:1::42".parse().unwrap(), Instant::now());
        ip.state = IpState::Active;
        set_state(&mut ip, [2, 0, 0, 0, 0, 1], 3, IpState::Active, &cfg, &mut routes, &mut solicit, Instant::now()).unwrap();
        assert!(routes.calls.is_empty());
        assert!(solicit.calls.is_empty());
    }

    #[test]
    fn entering_tentative_emits_a_solicitation() {
        let cfg = cfg();
        let mut routes = RecordingAdapter::default();
        let mut solicit = RecordingSolicit::default();
        let mut ip = ClientIp::new("fd00:1::42".parse().unwrap(), Instant::now());
        set_state(&mut ip, [2, 0, 0, 0, 0, 1], 3, IpState::Tentative, &cfg, &mut routes, &mut solicit, Instant::now()).unwrap();
        assert_eq!(ip.state, IpState::Tentative);
        assert!(routes.calls.is_empty());
        assert_eq!(solicit.calls, vec![(ip.addr, 3)]);
    }

    #[test]
    fn mapped_ipv4_address_installs_both_legs() {
        let cfg = cfg();
        let mut routes = RecordingAdapter::default();
        let mut solicit = RecordingSolicit::default();
        let addr: Ipv6Addr = "64:ff9b::a00:a".parse().unwrap();
        let mut ip = ClientIp::new(addr, Instant::now());
        set_state(&mut ip, [2, 0, 0, 0, 0, 1], 3, IpState::Active, &cfg, &mut routes, &mut solicit, Instant::now()).unwrap();
        assert_eq!(routes.calls.len(), 3);
        assert!(routes.calls[0].contains(&format!("{}", cfg.nat46ifindex)));
    }
}
