//
// client_manager.rs - Client Manager (§4.4)
//
// Purpose:
//   Orchestrates client creation, the claim/info handshake with peers, and the special-IP
//   socket lifecycle. This is the half of the core that owns `ClientStore`; the other half,
//   `ip_manager`, owns the unknown-destination table and never reaches in here directly.
//

use std::io;
use std::net::{Ipv6Addr, SocketAddr};
use std::os::fd::RawFd;
use std::time::Instant;

use crate::alloc::{allocate_ipv4, synthesize_special_ip};
use crate::client::{Client, IpState};
use crate::config::Config;
use crate::intercom::{ClientSnapshot, Intercom};
use crate::state_machine::{set_state, RouteNeighborAdapter, SolicitAdapter};
use crate::store::ClientStore;

/// Collaborator boundary for the special-IP UDP socket lifecycle (§4.4).
pub trait SpecialIpSocketAdapter {
    /// Opens a non-blocking UDP/IPv6 socket with `SO_REUSEADDR`/`IP_FREEBIND`, binds it to
    /// `(addr, port)`, registers it for read readiness and adds `addr` to the loopback-scope
    /// interface. Returns the owning fd.
    fn bind(&mut self, addr: Ipv6Addr, port: u16) -> io::Result<RawFd>;
    /// Deregisters, closes `fd` and removes `addr` from the loopback-scope interface.
    fn unbind(&mut self, fd: RawFd, addr: Ipv6Addr) -> io::Result<()>;
}

/// Collaborator bundle threaded through every `ClientManager` entry point. Grouping these
/// avoids a four-trait-object parameter list on every call and stands in for the explicit
/// owner object the design notes ask for in place of a global context.
pub struct Deps<'a> {
    pub routes: &'a mut dyn RouteNeighborAdapter,
    pub solicit: &'a mut dyn SolicitAdapter,
    pub intercom: &'a mut dyn Intercom,
    pub sockets: &'a mut dyn SpecialIpSocketAdapter,
}

pub struct ClientManager {
    pub store: ClientStore,
    pub cfg: Config,
}

fn snapshot(client: &Client) -> ClientSnapshot {
    ClientSnapshot {
        mac: client.mac,
        ifindex: client.ifindex,
        addrs: client.addrs.iter().map(|a| (a.addr, a.state)).collect(),
    }
}

fn install_special_ip(client: &mut Client, cfg: &Config, deps: &mut Deps, now: Instant) {
    let special_ip = match client.special_ip {
        Some(ip) => ip,
        None => {
            let (start, end) = cfg.allocation_range();
            let v4 = match allocate_ipv4(&client.mac, start, end) {
                Ok(v4) => v4,
                Err(e) => {
                    log::error!("address allocation exhausted for {:?}: {e}", client.mac);
                    return;
                }
            };
            let ip = synthesize_special_ip(&cfg.node_client_prefix, &client.mac, v4);
            client.special_ip = Some(ip);
            ip
        }
    };
    if client.node_ip_initialized {
        return;
    }
    match deps.sockets.bind(special_ip, cfg.intercom_port) {
        Ok(fd) => {
            client.special_ip_fd = Some(fd);
            client.node_ip_initialized = true;
        }
        Err(e) => log::error!("failed to bind special-ip socket for {:?}: {e}", client.mac),
    }
    let _ = now;
}

impl ClientManager {
    pub fn new(cfg: Config) -> Self {
        ClientManager {
            store: ClientStore::new(),
            cfg,
        }
    }

    /// §4.4 `notify_mac`: a local MAC was observed (e.g. bridge FDB notification).
    pub fn notify_mac(&mut self, mac: [u8; 6], ifindex: u32, deps: &mut Deps, now: Instant) {
        if Client::mac_is_zero(&mac) {
            return;
        }
        let client = self.store.get_or_create(mac, ifindex);
        if client.is_active() {
            return;
        }

        let (start, end) = self.cfg.allocation_range();
        let special_ip = match client.special_ip {
            Some(ip) => ip,
            None => match allocate_ipv4(&mac, start, end) {
                Ok(v4) => {
                    let ip = synthesize_special_ip(&self.cfg.node_client_prefix, &mac, v4);
                    client.special_ip = Some(ip);
                    ip
                }
                Err(e) => {
                    log::error!("address allocation exhausted for {mac:?}: {e}");
                    return;
                }
            },
        };

        deps.intercom.claim(special_ip, mac);
        install_special_ip(client, &self.cfg, deps, now);

        let ifindex = client.ifindex;
        for i in 0..client.addrs.len() {
            if client.addrs[i].state != IpState::Active {
                if let Err(e) = set_state(
                    &mut client.addrs[i],
                    mac,
                    ifindex,
                    IpState::Tentative,
                    &self.cfg,
                    deps.routes,
                    deps.solicit,
                    now,
                ) {
                    log::warn!("failed to enter tentative for {mac:?}: {e}");
                }
            }
        }

        // the solicitation layer overwrites the first 13 bytes of whatever address we pass;
        // the special IP is as good a placeholder as any address within a client prefix.
        if let Err(e) = deps.solicit.solicit(special_ip, ifindex) {
            log::warn!("failed to solicit special ip for {mac:?}: {e}");
        }
    }

    /// §4.4 `add_address`.
    pub fn add_address(&mut self, addr: Ipv6Addr, mac: [u8; 6], ifindex: u32, deps: &mut Deps, now: Instant) {
        if !self.cfg.is_valid_client_address(&addr) {
            log::debug!("add_address: {addr} outside any configured client prefix");
            return;
        }

        let client = self.store.get_or_create(mac, ifindex);
        client.ifindex = ifindex;
        let was_active = client.is_active();

        let idx = match client.find(&addr) {
            Some(idx) => idx,
            None => {
                client.addrs.push(crate::client::ClientIp::new(addr, now));
                client.addrs.len() - 1
            }
        };

        if let Err(e) = set_state(&mut client.addrs[idx], mac, ifindex, IpState::Active, &self.cfg, deps.routes, deps.solicit, now) {
            log::warn!("failed to activate {addr} for {mac:?}: {e}");
        }

        if !was_active {
            let special_ip = match client.special_ip {
                Some(ip) => ip,
                None => {
                    let (start, end) = self.cfg.allocation_range();
                    match allocate_ipv4(&mac, start, end) {
                        Ok(v4) => {
                            let ip = synthesize_special_ip(&self.cfg.node_client_prefix, &mac, v4);
                            client.special_ip = Some(ip);
                            ip
                        }
                        Err(e) => {
                            log::error!("address allocation exhausted for {mac:?}: {e}");
                            return;
                        }
                    }
                }
            };
            deps.intercom.claim(special_ip, mac);
            install_special_ip(client, &self.cfg, deps, now);
        }

        if let Err(e) = deps.routes.insert_neighbor(ifindex, addr.into(), mac) {
            log::debug!("neighbor refresh for {addr} failed: {e}");
        }
    }

    /// §4.4 `remove_address`.
    pub fn remove_address(&mut self, mac: [u8; 6], addr: Ipv6Addr, deps: &mut Deps, now: Instant) {
        let delete_client = {
            let Some(client) = self.store.get_mut(&mac) else {
                return;
            };
            let Some(idx) = client.find(&addr) else {
                return;
            };
            let ifindex = client.ifindex;
            if let Err(e) = set_state(&mut client.addrs[idx], mac, ifindex, IpState::Inactive, &self.cfg, deps.routes, deps.solicit, now) {
                log::warn!("failed to deactivate {addr} for {mac:?}: {e}");
            }
            client.addrs.remove(idx);
            !client.is_active()
        };
        if delete_client {
            self.delete_client(&mac, deps, now);
        }
    }

    fn delete_client(&mut self, mac: &[u8; 6], deps: &mut Deps, now: Instant) {
        if let Some(client) = self.store.get(mac) {
            if let (Some(fd), Some(ip)) = (client.special_ip_fd, client.special_ip) {
                if let Err(e) = deps.sockets.unbind(fd, ip) {
                    log::warn!("failed to unbind special ip socket for {mac:?}: {e}");
                }
            }
        }
        self.store.delete(mac, &self.cfg, deps.routes, deps.solicit, now);
    }

    /// §4.4 `handle_claim`: a peer asserts ownership of `mac`.
    pub fn handle_claim(&mut self, sender: SocketAddr, mac: [u8; 6], deps: &mut Deps, now: Instant) {
        let (snap, was_live) = if let Some(c) = self.store.get(&mac) {
            (Some(snapshot(c)), true)
        } else if let Some(c) = self.store.get_old(&mac) {
            (Some(snapshot(c)), false)
        } else {
            (None, false)
        };

        let Some(snap) = snap else {
            log::debug!("handle_claim: unknown mac {mac:?}");
            return;
        };

        // relinquished is unconditionally true: this node is giving up the MAC to `sender`
        // either way, and only gates the delete below on whether it was live.
        deps.intercom.info(sender, &snap, true);

        if was_live {
            self.delete_client(&mac, deps, now);
        }
    }

    /// Looks up the live client owning `addr`, if any. Used by the daemon's intercom dispatch
    /// loop to answer a peer's `seek(addr)` the same way `handle_claim` answers a claim: with
    /// an `info` describing the client, `relinquished=false` since we aren't giving it up.
    pub fn snapshot_for_address(&self, addr: &Ipv6Addr) -> Option<ClientSnapshot> {
        let (known, client) = self.store.is_known_address(addr);
        if known {
            client.map(snapshot)
        } else {
            None
        }
    }

    /// §4.4 `handle_info`: a peer describes a client we asked (or claimed) about.
    pub fn handle_info(&mut self, foreign: ClientSnapshot, relinquished: bool, deps: &mut Deps, now: Instant) {
        if self.store.get(&foreign.mac).is_none() {
            log::debug!("handle_info: unknown mac {:?}", foreign.mac);
            return;
        }

        let known: std::collections::HashSet<Ipv6Addr> = self
            .store
            .get(&foreign.mac)
            .map(|c| c.addrs.iter().map(|a| a.addr).collect())
            .unwrap_or_default();

        for (addr, _state) in &foreign.addrs {
            if !known.contains(addr) {
                self.add_address(*addr, foreign.mac, foreign.ifindex, deps, now);
            }
        }

        if relinquished {
            // preserved even when nothing was merged — see open question (c) in the design notes.
            if let Some(client) = self.store.get_mut(&foreign.mac) {
                install_special_ip(client, &self.cfg, deps, now);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intercom::NullIntercom;
    use crate::prefix::parse_prefix;
    use crate::state_machine::test_support::{RecordingAdapter, RecordingSolicit};

    struct NullSockets {
        next_fd: RawFd,
        unbinds: Vec<RawFd>,
    }
    impl SpecialIpSocketAdapter for NullSockets {
        fn bind(&mut self, _addr: Ipv6Addr, _port: u16) -> io::Result<RawFd> {
            self.next_fd += 1;
            Ok(self.next_fd)
        }
        fn unbind(&mut self, fd: RawFd, _addr: Ipv6Addr) -> io::Result<()> {
            self.unbinds.push(fd);
            Ok(())
        }
    }

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

    fn deps<'a>(
        routes: &'a mut RecordingAdapter,
        solicit: &'a mut RecordingSolicit,
        intercom: &'a mut NullIntercom,
        sockets: &'a mut NullSockets,
    ) -> Deps<'a> {
        Deps { routes, solicit, intercom, sockets }
    }

    #[test]
    fn notify_mac_ignores_zero_mac() {
        let mut cm = ClientManager::new(cfg());
        let (mut r, mut s, mut i, mut sk) = (RecordingAdapter::default(), RecordingSolicit::default(), NullIntercom::default(), NullSockets { next_fd: 0, unbinds: vec![] });
        cm.notify_mac([0; 6], 3, &mut deps(&mut r, &mut s, &mut i, &mut sk), Instant::now());
        assert_eq!(cm.store.live_len(), 0);
    }

    #[test]
    fn notify_mac_creates_client_and_claims() {
        let mut cm = ClientManager::new(cfg());
        let (mut r, mut s, mut i, mut sk) = (RecordingAdapter::default(), RecordingSolicit::default(), NullIntercom::default(), NullSockets { next_fd: 0, unbinds: vec![] });
        let mac = [0x02, 0xaa, 0xbb, 0xcc, 0xdd, 0xee];
        cm.notify_mac(mac, 3, &mut deps(&mut r, &mut s, &mut i, &mut sk), Instant::now());
        assert_eq!(cm.store.live_len(), 1);
        assert_eq!(i.claims.len(), 1);
        let client = cm.store.get(&mac).unwrap();
        assert!(client.special_ip.is_some());
    }

    #[test]
    fn notify_mac_binds_special_ip_socket_and_delete_unbinds_it() {
        let mut cm = ClientManager::new(cfg());
        let (mut r, mut s, mut i, mut sk) = (RecordingAdapter::default(), RecordingSolicit::default(), NullIntercom::default(), NullSockets { next_fd: 0, unbinds: vec![] });
        let mac = [0x02, 0xaa, 0xbb, 0xcc, 0xdd, 0xee];
        let now = Instant::now();
        cm.notify_mac(mac, 3, &mut deps(&mut r, &mut s, &mut i, &mut sk), now);
        let client = cm.store.get(&mac).unwrap();
        assert!(client.node_ip_initialized, "notify_mac must bind the special-ip socket");
        let fd = client.special_ip_fd.expect("socket must be bound");

        cm.delete_client(&mac, &mut deps(&mut r, &mut s, &mut i, &mut sk), now);
        assert!(cm.store.get(&mac).is_none());
        let old = cm.store.get_old(&mac).unwrap();
        assert!(!old.node_ip_initialized, "delete must unbind the special-ip socket");
        assert!(old.special_ip_fd.is_none());
        assert_eq!(sk.unbinds, vec![fd], "delete_client must call unbind on the bound fd");
    }

    #[test]
    fn notify_mac_is_noop_if_already_active() {
        let mut cm = ClientManager::new(cfg());
        let (mut r, mut s, mut i, mut sk) = (RecordingAdapter::default(), RecordingSolicit::default(), NullIntercom::default(), NullSockets { next_fd: 0, unbinds: vec![] });
        let mac = [0x02, 0xaa, 0xbb, 0xcc, 0xdd, 0xee];
        cm.add_address("fd00:1::42".parse().unwrap(), mac, 3, &mut deps(&mut r, &mut s, &mut i, &mut sk), Instant::now());
        let claims_before = i.claims.len();
        cm.notify_mac(mac, 3, &mut deps(&mut r, &mut s, &mut i, &mut sk), Instant::now());
        assert_eq!(i.claims.len(), claims_before);
    }

    #[test]
    fn add_address_outside_prefix_is_rejected() {
        let mut cm = ClientManager::new(cfg());
        let (mut r, mut s, mut i, mut sk) = (RecordingAdapter::default(), RecordingSolicit::default(), NullIntercom::default(), NullSockets { next_fd: 0, unbinds: vec![] });
        let mac = [0x02, 0xaa, 0xbb, 0xcc, 0xdd, 0xee];
        cm.add_address("2001:db8::1".parse().unwrap(), mac, 3, &mut deps(&mut r, &mut s, &mut i, &mut sk), Instant::now());
        assert_eq!(cm.store.live_len(), 0);
    }

    #[test]
    fn add_address_inside_v4prefix_is_accepted() {
        let mut cm = ClientManager::new(cfg());
        let (mut r, mut s, mut i, mut sk) = (RecordingAdapter::default(), RecordingSolicit::default(), NullIntercom::default(), NullSockets { next_fd: 0, unbinds: vec![] });
        let mac = [0x02, 0xaa, 0xbb, 0xcc, 0xdd, 0xee];
        let addr: Ipv6Addr = "64:ff9b::a00:1".parse().unwrap();
        cm.add_address(addr, mac, 3, &mut deps(&mut r, &mut s, &mut i, &mut sk), Instant::now());
        assert_eq!(cm.store.live_len(), 1, "mapped-v4 destination falls outside every client prefix but inside v4prefix");
    }

    #[test]
    fn add_then_remove_last_address_deletes_client() {
        let mut cm = ClientManager::new(cfg());
        let (mut r, mut s, mut i, mut sk) = (RecordingAdapter::default(), RecordingSolicit::default(), NullIntercom::default(), NullSockets { next_fd: 0, unbinds: vec![] });
        let mac = [0x02, 0xaa, 0xbb, 0xcc, 0xdd, 0xee];
        let addr: Ipv6Addr = "fd00:1::42".parse().unwrap();
        cm.add_address(addr, mac, 3, &mut deps(&mut r, &mut s, &mut i, &mut sk), Instant::now());
        assert_eq!(cm.store.live_len(), 1);
        cm.remove_address(mac, addr, &mut deps(&mut r, &mut s, &mut i, &mut sk), Instant::now());
        assert_eq!(cm.store.live_len(), 0);
        assert_eq!(cm.store.old_len(), 1);
    }

    #[test]
    fn handle_claim_for_live_client_replies_and_deletes() {
        let mut cm = ClientManager::new(cfg());
        let (mut r, mut s, mut i, mut sk) = (RecordingAdapter::default(), RecordingSolicit::default(), NullIntercom::default(), NullSockets { next_fd: 0, unbinds: vec![] });
        let mac = [0x02, 0xaa, 0xbb, 0xcc, 0xdd, 0xee];
        let addr: Ipv6Addr = "fd00:1::42".parse().unwrap();
        cm.add_address(addr, mac, 3, &mut deps(&mut r, &mut s, &mut i, &mut sk), Instant::now());
        let sender: SocketAddr = "[fd00:1:2::1]:4433".parse().unwrap();
        cm.handle_claim(sender, mac, &mut deps(&mut r, &mut s, &mut i, &mut sk), Instant::now());
        assert_eq!(i.infos.len(), 1);
        assert!(i.infos[0].2, "live client reply must be marked relinquished");
        assert_eq!(cm.store.live_len(), 0);
        assert_eq!(cm.store.old_len(), 1);
    }

    #[test]
    fn handle_claim_for_old_client_does_not_delete() {
        let mut cm = ClientManager::new(cfg());
        let (mut r, mut s, mut i, mut sk) = (RecordingAdapter::default(), RecordingSolicit::default(), NullIntercom::default(), NullSockets { next_fd: 0, unbinds: vec![] });
        let mac = [0x02, 0xaa, 0xbb, 0xcc, 0xdd, 0xee];
        let addr: Ipv6Addr = "fd00:1::42".parse().unwrap();
        let now = Instant::now();
        cm.add_address(addr, mac, 3, &mut deps(&mut r, &mut s, &mut i, &mut sk), now);
        cm.remove_address(mac, addr, &mut deps(&mut r, &mut s, &mut i, &mut sk), now);
        assert_eq!(cm.store.old_len(), 1);
        let sender: SocketAddr = "[fd00:1:2::1]:4433".parse().unwrap();
        cm.handle_claim(sender, mac, &mut deps(&mut r, &mut s, &mut i, &mut sk), now);
        assert_eq!(cm.store.old_len(), 1);
        assert_eq!(i.infos.len(), 1);
        assert!(i.infos[0].2, "old client reply is also marked relinquished");
    }

    #[test]
    fn handle_claim_for_unknown_mac_is_ignored() {
        let mut cm = ClientManager::new(cfg());
        let (mut r, mut s, mut i, mut sk) = (RecordingAdapter::default(), RecordingSolicit::default(), NullIntercom::default(), NullSockets { next_fd: 0, unbinds: vec![] });
        let sender: SocketAddr = "[fd00:1:2::1]:4433".parse().unwrap();
        cm.handle_claim(sender, [9; 6], &mut deps(&mut r, &mut s, &mut i, &mut sk), Instant::now());
        assert!(i.infos.is_empty());
    }

    #[test]
    fn handle_info_merges_new_addresses_and_installs_special_ip_when_relinquished() {
        let mut cm = ClientManager::new(cfg());
        let (mut r, mut s, mut i, mut sk) = (RecordingAdapter::default(), RecordingSolicit::default(), NullIntercom::default(), NullSockets { next_fd: 0, unbinds: vec![] });
        let mac = [0x02, 0xaa, 0xbb, 0xcc, 0xdd, 0xee];
        // must already be known locally for handle_info to act.
        cm.store.get_or_create(mac, 5);
        let foreign = ClientSnapshot {
            mac,
            ifindex: 7,
            addrs: vec![
                ("fd00:1::1".parse().unwrap(), IpState::Active),
                ("fd00:1::2".parse().unwrap(), IpState::Active),
            ],
        };
        cm.handle_info(foreign, true, &mut deps(&mut r, &mut s, &mut i, &mut sk), Instant::now());
        let client = cm.store.get(&mac).unwrap();
        assert_eq!(client.addrs.len(), 2);
        assert!(client.node_ip_initialized);
    }

    #[test]
    fn handle_info_for_unknown_mac_is_dropped() {
        let mut cm = ClientManager::new(cfg());
        let (mut r, mut s, mut i, mut sk) = (RecordingAdapter::default(), RecordingSolicit::default(), NullIntercom::default(), NullSockets { next_fd: 0, unbinds: vec![] });
        let foreign = ClientSnapshot { mac: [9; 6], ifindex: 1, addrs: vec![] };
        cm.handle_info(foreign, true, &mut deps(&mut r, &mut s, &mut i, &mut sk), Instant::now());
        assert_eq!(cm.store.live_len(), 0);
    }
}
