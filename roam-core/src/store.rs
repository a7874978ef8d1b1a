//
// store.rs - Client Store (§4.2)
//
// Purpose:
//   In-memory registry of live and recently-departed clients, keyed by MAC. Owns every
//   `Client` and `ClientIp` in both sets; nothing outside this module is allowed to insert
//   or remove an entry directly.
//

use std::collections::HashMap;
use std::net::Ipv6Addr;
use std::time::Instant;

use crate::client::{Client, IpState};
use crate::config::Config;
use crate::state_machine::{set_state, RouteNeighborAdapter, SolicitAdapter};

#[derive(Default)]
pub struct ClientStore {
    live: HashMap<[u8; 6], Client>,
    old: HashMap<[u8; 6], Client>,
}

impl ClientStore {
    pub fn new() -> Self {
        ClientStore::default()
    }

    pub fn get(&self, mac: &[u8; 6]) -> Option<&Client> {
        self.live.get(mac)
    }

    pub fn get_mut(&mut self, mac: &[u8; 6]) -> Option<&mut Client> {
        self.live.get_mut(mac)
    }

    pub fn get_old(&self, mac: &[u8; 6]) -> Option<&Client> {
        self.old.get(mac)
    }

    pub fn get_or_create(&mut self, mac: [u8; 6], ifindex: u32) -> &mut Client {
        self.live.entry(mac).or_insert_with(|| Client::new(mac, ifindex))
    }

    /// Scans all live clients and their addresses; O(N·M) by design (see §4.2).
    pub fn is_known_address(&self, addr: &Ipv6Addr) -> (bool, Option<&Client>) {
        for client in self.live.values() {
            if client.find(addr).is_some() {
                return (true, Some(client));
            }
        }
        (false, None)
    }

    /// Moves `mac` into the old-clients set, transitioning every address to INACTIVE first
    /// (which drives route/neighbor removal) and dropping the special-IP socket. No-op for
    /// unknown MACs.
    #[allow(clippy::too_many_arguments)]
    pub fn delete(
        &mut self,
        mac: &[u8; 6],
        cfg: &Config,
        routes: &mut dyn RouteNeighborAdapter,
        solicit: &mut dyn SolicitAdapter,
        now: Instant,
    ) {
        let Some(mut client) = self.live.remove(mac) else {
            return;
        };
        let ifindex = client.ifindex;
        for ip in client.addrs.iter_mut() {
            if ip.state != IpState::Inactive {
                if let Err(e) = set_state(ip, *mac, ifindex, IpState::Inactive, cfg, routes, solicit, now) {
                    log::warn!("failed to tear down route for {:?}/{}: {e}", mac, ip.addr);
                }
            }
        }
        client.node_ip_initialized = false;
        client.special_ip_fd = None;
        client.special_ip = None;
        client.expiry = Some(now + cfg.oldclients_keep);
        self.old.insert(*mac, client);
    }

    /// Removes every old-client whose expiry has passed. Scheduled periodically by the
    /// owning event loop every `OLDCLIENTS_KEEP_SECONDS`.
    pub fn purge_expired_old(&mut self, now: Instant) {
        self.old.retain(|_, c| c.expiry.is_none_or(|exp| exp > now));
    }

    pub fn live_iter(&self) -> impl Iterator<Item = &Client> {
        self.live.values()
    }

    pub fn old_len(&self) -> usize {
        self.old.len()
    }

    pub fn live_len(&self) -> usize {
        self.live.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ClientIp;
    use crate::prefix::parse_prefix;
    use crate::state_machine::test_support::{RecordingAdapter, RecordingSolicit};

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
    fn get_or_create_then_get_returns_same_client() {
        let mut store = ClientStore::new();
        let mac = [2, 0, 0, 0, 0, 1];
        store.get_or_create(mac, 3);
        assert!(store.get(&mac).is_some());
    }

    #[test]
    fn delete_unknown_mac_is_a_noop() {
        let mut store = ClientStore::new();
        let cfg = cfg();
        let mut routes = RecordingAdapter::default();
        let mut solicit = RecordingSolicit::default();
        store.delete(&[9; 6], &cfg, &mut routes, &mut solicit, Instant::now());
        assert_eq!(store.old_len(), 0);
    }

    #[test]
    fn delete_moves_client_to_old_and_tears_down_active_routes() {
        let mut store = ClientStore::new();
        let cfg = cfg();
        let mac = [2, 0, 0, 0, 0, 1];
        let now = Instant::now();
        {
            let c = store.get_or_create(mac, 3);
            let mut ip = ClientIp::new("fd00:1::42".parse().unwrap(), now);
            ip.state = IpState::Active;
            c.addrs.push(ip);
        }
        let mut routes = RecordingAdapter::default();
        let mut solicit = RecordingSolicit::default();
        store.delete(&mac, &cfg, &mut routes, &mut solicit, now);
        assert_eq!(store.live_len(), 0);
        assert_eq!(store.old_len(), 1);
        assert!(!routes.calls.is_empty());
        let old = store.get_old(&mac).unwrap();
        assert!(old.expiry.is_some());
    }

    #[test]
    fn purge_expired_old_removes_past_expiry_only() {
        let mut store = ClientStore::new();
        let cfg = cfg();
        let mac = [2, 0, 0, 0, 0, 1];
        let now = Instant::now();
        store.get_or_create(mac, 3);
        let mut routes = RecordingAdapter::default();
        let mut solicit = RecordingSolicit::default();
        store.delete(&mac, &cfg, &mut routes, &mut solicit, now);
        // expiry is now + oldclients_keep: not yet due.
        store.purge_expired_old(now);
        assert_eq!(store.old_len(), 1);
        store.purge_expired_old(now + cfg.oldclients_keep + std::time::Duration::from_secs(1));
        assert_eq!(store.old_len(), 0);
    }
}
