//
// ip_manager.rs - IP Manager: unknown-destination buffering, seek scheduling, reinjection
// (§3, §4.5-§4.7)
//
// Purpose:
//   Owns the unknown-destination table exclusively. Reads frames handed up from the TUN
//   device, buffers packets for destinations nobody has claimed yet, drives the two
//   self-rescheduling seek chains through `TaskQueue`, and reinjects buffered packets once a
//   route appears.
//

use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::Ipv6Addr;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::intercom::Intercom;
use crate::state_machine::SolicitAdapter;
use crate::store::ClientStore;
use crate::task_queue::{SeekKind, TaskQueue};

#[derive(Clone, Debug)]
pub struct PendingPacket {
    pub data: Vec<u8>,
    pub queued_at: Instant,
}

pub struct UnknownDestEntry {
    pub created_at: Instant,
    pub packets: VecDeque<PendingPacket>,
    token: CancellationToken,
}

impl UnknownDestEntry {
    fn new(now: Instant) -> Self {
        UnknownDestEntry {
            created_at: now,
            packets: VecDeque::new(),
            token: CancellationToken::new(),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum TunFrameOutcome {
    Dropped(&'static str),
    Buffered { new_entry: bool },
}

/// Collaborator boundary for writing reinjected frames back to the TUN device.
pub trait TunWriter {
    /// `Err` with `ErrorKind::WouldBlock` signals EAGAIN; the caller re-queues the packet.
    fn write_frame(&mut self, data: &[u8]) -> io::Result<()>;
}

#[derive(Default)]
pub struct TunWriteQueue {
    pending: VecDeque<Vec<u8>>,
}

impl TunWriteQueue {
    pub fn new() -> Self {
        TunWriteQueue::default()
    }

    pub fn enqueue(&mut self, packets: VecDeque<PendingPacket>) {
        self.pending.extend(packets.into_iter().map(|p| p.data));
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Drains in FIFO order of arrival. Stops at the first `WouldBlock`, leaving it (and
    /// everything behind it) queued for the next readiness event.
    pub fn drain(&mut self, writer: &mut dyn TunWriter) {
        while let Some(pkt) = self.pending.pop_front() {
            match writer.write_frame(&pkt) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.pending.push_front(pkt);
                    break;
                }
                Err(e) => log::warn!("dropping reinjected packet: {e}"),
            }
        }
    }
}

#[derive(Default)]
pub struct IpManager {
    unknown: HashMap<Ipv6Addr, UnknownDestEntry>,
    pub queue: TaskQueue,
}

impl IpManager {
    pub fn new() -> Self {
        IpManager::default()
    }

    pub fn entry_count(&self) -> usize {
        self.unknown.len()
    }

    pub fn has_entry(&self, addr: &Ipv6Addr) -> bool {
        self.unknown.contains_key(addr)
    }

    /// §4.5 TUN reader: demultiplexes a single frame and buffers it if it targets an
    /// unattributed client destination.
    pub fn on_tun_frame(
        &mut self,
        frame: &[u8],
        cfg: &Config,
        store: &ClientStore,
        intercom: &mut dyn Intercom,
        solicit: &mut dyn SolicitAdapter,
        now: Instant,
    ) -> TunFrameOutcome {
        if frame.len() < 40 {
            return TunFrameOutcome::Dropped("short frame");
        }
        if frame[0] >> 4 != 6 {
            return TunFrameOutcome::Dropped("not ipv6");
        }
        let dst = Ipv6Addr::from(<[u8; 16]>::try_from(&frame[24..40]).unwrap());
        if dst.octets()[0] == 0xff {
            return TunFrameOutcome::Dropped("multicast destination");
        }
        if !cfg.is_valid_client_address(&dst) {
            return TunFrameOutcome::Dropped("outside client prefix");
        }

        let new_entry = !self.unknown.contains_key(&dst);
        let entry = self.unknown.entry(dst).or_insert_with(|| UnknownDestEntry::new(now));
        entry.packets.push_back(PendingPacket { data: frame.to_vec(), queued_at: now });

        if new_entry {
            self.seek_address(dst, cfg, store, intercom, solicit, now);
        }
        TunFrameOutcome::Buffered { new_entry }
    }

    /// §4.6: schedules both seek chains for `addr`, firing the first tick of each
    /// immediately (so the caller observes a solicitation and a peer seek within the same
    /// tick the entry was created, per the end-to-end scenario).
    pub fn seek_address(
        &mut self,
        addr: Ipv6Addr,
        cfg: &Config,
        store: &ClientStore,
        intercom: &mut dyn Intercom,
        solicit: &mut dyn SolicitAdapter,
        now: Instant,
    ) {
        let token = if let Some(entry) = self.unknown.get(&addr) {
            entry.token.clone()
        } else {
            CancellationToken::new()
        };
        self.ns_tick(addr, cfg, store, solicit, now, token.clone());
        self.seek_tick(addr, cfg, store, intercom, now, token);
    }

    fn is_seek_justified(&self, addr: &Ipv6Addr, store: &ClientStore) -> bool {
        if !self.unknown.contains_key(addr) {
            return false;
        }
        let (known, _) = store.is_known_address(addr);
        if known {
            log::error!(
                "logic inconsistency: seek scheduled for {addr} which is already a known local client address; suppressing"
            );
            return false;
        }
        true
    }

    fn purge_expired(&mut self, addr: &Ipv6Addr, cfg: &Config, now: Instant) {
        let should_destroy = if let Some(entry) = self.unknown.get_mut(addr) {
            entry
                .packets
                .retain(|p| now.saturating_duration_since(p.queued_at) < cfg.packet_timeout);
            entry.packets.is_empty() && now.saturating_duration_since(entry.created_at) > cfg.seek_interval
        } else {
            false
        };
        if should_destroy {
            if let Some(entry) = self.unknown.remove(addr) {
                entry.token.cancel();
            }
        }
    }

    fn ns_tick(
        &mut self,
        addr: Ipv6Addr,
        cfg: &Config,
        store: &ClientStore,
        solicit: &mut dyn SolicitAdapter,
        now: Instant,
        token: CancellationToken,
    ) {
        self.purge_expired(&addr, cfg, now);
        if token.is_cancelled() || !self.is_seek_justified(&addr, store) {
            return;
        }
        if let Err(e) = solicit.solicit_all(addr) {
            log::debug!("solicitation for {addr} failed: {e}");
        }
        self.queue.schedule(now + cfg.seek_interval, addr, SeekKind::Ns, token);
    }

    fn seek_tick(
        &mut self,
        addr: Ipv6Addr,
        cfg: &Config,
        store: &ClientStore,
        intercom: &mut dyn Intercom,
        now: Instant,
        token: CancellationToken,
    ) {
        if token.is_cancelled() || !self.is_seek_justified(&addr, store) {
            return;
        }
        intercom.seek(addr);
        self.queue.schedule(now + cfg.seek_interval, addr, SeekKind::Peer, token);
    }

    /// Dispatches every task whose deadline has passed. Call after `tokio::time::sleep_until`
    /// wakes the owning event loop, or directly in tests.
    pub fn run_due_tasks(
        &mut self,
        now: Instant,
        cfg: &Config,
        store: &ClientStore,
        intercom: &mut dyn Intercom,
        solicit: &mut dyn SolicitAdapter,
    ) {
        for (addr, kind, token) in self.queue.pop_due(now) {
            if token.is_cancelled() {
                continue;
            }
            match kind {
                SeekKind::Ns => self.ns_tick(addr, cfg, store, solicit, now, token),
                SeekKind::Peer => self.seek_tick(addr, cfg, store, intercom, now, token),
            }
        }
    }

    /// §4.7: a route to `addr` now exists. Removes the entry eagerly and returns its
    /// buffered packets in FIFO order for the caller to reinject.
    pub fn route_appeared(&mut self, addr: Ipv6Addr) -> Option<VecDeque<PendingPacket>> {
        self.unknown.remove(&addr).map(|entry| {
            entry.token.cancel();
            entry.packets
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intercom::NullIntercom;
    use crate::prefix::parse_prefix;
    use crate::state_machine::test_support::RecordingSolicit;
    use std::time::Duration;

    fn cfg() -> Config {
        Config {
            start: "10.0.0.10".parse().unwrap(),
            end: "10.0.0.20".parse().unwrap(),
            v4prefix: parse_prefix("64:ff9b::/96").unwrap(),
            prefixes: vec![parse_prefix("fd00:1::/32").unwrap()],
            node_client_prefix: parse_prefix("fd00:1:2::/48").unwrap(),
            export_table: 100,
            nat46ifindex: 9,
            oldclients_keep: Duration::from_secs(60),
            seek_interval: Duration::from_secs(2),
            packet_timeout: Duration::from_secs(5),
            intercom_port: 4433,
            tun_name: "roam0".into(),
            tun_mtu: 1400,
            peers: vec![],
            client_ifindices: vec![],
        }
    }

    fn ipv6_frame(src: &str, dst: &str) -> Vec<u8> {
        let mut frame = vec![0u8; 40];
        frame[0] = 0x60;
        frame[8..24].copy_from_slice(&src.parse::<Ipv6Addr>().unwrap().octets());
        frame[24..40].copy_from_slice(&dst.parse::<Ipv6Addr>().unwrap().octets());
        frame
    }

    struct NullWriter {
        written: Vec<Vec<u8>>,
        block_after: usize,
    }
    impl TunWriter for NullWriter {
        fn write_frame(&mut self, data: &[u8]) -> io::Result<()> {
            if self.written.len() >= self.block_after {
                return Err(io::Error::from(io::ErrorKind::WouldBlock));
            }
            self.written.push(data.to_vec());
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn short_frame_is_dropped() {
        let mut mgr = IpManager::new();
        let cfg = cfg();
        let store = ClientStore::new();
        let mut intercom = NullIntercom::default();
        let mut solicit = RecordingSolicit::default();
        let outcome = mgr.on_tun_frame(&[0u8; 10], &cfg, &store, &mut intercom, &mut solicit, Instant::now());
        assert_eq!(outcome, TunFrameOutcome::Dropped("short frame"));
    }

    #[tokio::test(start_paused = true)]
    async fn new_unknown_destination_schedules_both_seek_chains_immediately() {
        let mut mgr = IpManager::new();
        let cfg = cfg();
        let store = ClientStore::new();
        let mut intercom = NullIntercom::default();
        let mut solicit = RecordingSolicit::default();
        let frame = ipv6_frame("2001:db8::1", "fd00:1::42");
        let outcome = mgr.on_tun_frame(&frame, &cfg, &store, &mut intercom, &mut solicit, Instant::now());
        assert_eq!(outcome, TunFrameOutcome::Buffered { new_entry: true });
        assert_eq!(intercom.seeks, vec!["fd00:1::42".parse::<Ipv6Addr>().unwrap()]);
        assert_eq!(solicit.calls.len(), 1);
        assert_eq!(mgr.entry_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn destination_inside_v4prefix_is_buffered_not_dropped() {
        let mut mgr = IpManager::new();
        let cfg = cfg();
        let store = ClientStore::new();
        let mut intercom = NullIntercom::default();
        let mut solicit = RecordingSolicit::default();
        let frame = ipv6_frame("2001:db8::1", "64:ff9b::a00:1");
        let outcome = mgr.on_tun_frame(&frame, &cfg, &store, &mut intercom, &mut solicit, Instant::now());
        assert_eq!(outcome, TunFrameOutcome::Buffered { new_entry: true });
    }

    #[tokio::test(start_paused = true)]
    async fn further_packets_augment_existing_entry_without_rescheduling() {
        let mut mgr = IpManager::new();
        let cfg = cfg();
        let store = ClientStore::new();
        let mut intercom = NullIntercom::default();
        let mut solicit = RecordingSolicit::default();
        let frame = ipv6_frame("2001:db8::1", "fd00:1::42");
        mgr.on_tun_frame(&frame, &cfg, &store, &mut intercom, &mut solicit, Instant::now());
        let outcome = mgr.on_tun_frame(&frame, &cfg, &store, &mut intercom, &mut solicit, Instant::now());
        assert_eq!(outcome, TunFrameOutcome::Buffered { new_entry: false });
        assert_eq!(intercom.seeks.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn route_appeared_drains_packets_in_fifo_order_and_requeues_on_would_block() {
        let mut mgr = IpManager::new();
        let cfg = cfg();
        let store = ClientStore::new();
        let mut intercom = NullIntercom::default();
        let mut solicit = RecordingSolicit::default();
        let dst: Ipv6Addr = "fd00:1::42".parse().unwrap();
        for i in 0..3u8 {
            let mut frame = ipv6_frame("2001:db8::1", "fd00:1::42");
            frame.push(i);
            mgr.on_tun_frame(&frame, &cfg, &store, &mut intercom, &mut solicit, Instant::now());
        }
        let packets = mgr.route_appeared(dst).unwrap();
        assert_eq!(packets.len(), 3);
        let mut q = TunWriteQueue::new();
        q.enqueue(packets);
        let mut writer = NullWriter { written: vec![], block_after: 2 };
        q.drain(&mut writer);
        assert_eq!(writer.written.len(), 2);
        assert_eq!(writer.written[0].last(), Some(&0));
        assert_eq!(writer.written[1].last(), Some(&1));
        assert_eq!(q.len(), 1);
        assert!(mgr.route_appeared(dst).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn entry_destroyed_after_packet_timeout_and_seek_interval() {
        let mut mgr = IpManager::new();
        let cfg = cfg();
        let store = ClientStore::new();
        let mut intercom = NullIntercom::default();
        let mut solicit = RecordingSolicit::default();
        let dst: Ipv6Addr = "fd00:1::42".parse().unwrap();
        let frame = ipv6_frame("2001:db8::1", "fd00:1::42");
        mgr.on_tun_frame(&frame, &cfg, &store, &mut intercom, &mut solicit, Instant::now());
        assert!(mgr.has_entry(&dst));

        tokio::time::advance(cfg.packet_timeout + Duration::from_millis(1)).await;
        let due = mgr.queue.pop_due(Instant::now());
        for (addr, kind, token) in due {
            match kind {
                SeekKind::Ns => mgr.ns_tick(addr, &cfg, &store, &mut solicit, Instant::now(), token),
                SeekKind::Peer => mgr.seek_tick(addr, &cfg, &store, &mut intercom, Instant::now(), token),
            }
        }
        // packets are expired now; advance past seek_interval too so the entry's own age
        // check fires and the entry is destroyed.
        tokio::time::advance(cfg.seek_interval + Duration::from_millis(1)).await;
        mgr.run_due_tasks(Instant::now(), &cfg, &store, &mut intercom, &mut solicit);
        assert!(!mgr.has_entry(&dst));
    }

    #[tokio::test(start_paused = true)]
    async fn seek_suppressed_when_destination_already_known_locally() {
        let mut mgr = IpManager::new();
        let cfg = cfg();
        let mut store = ClientStore::new();
        let mut intercom = NullIntercom::default();
        let mut solicit = RecordingSolicit::default();
        let dst: Ipv6Addr = "fd00:1::42".parse().unwrap();
        let frame = ipv6_frame("2001:db8::1", "fd00:1::42");
        mgr.on_tun_frame(&frame, &cfg, &store, &mut intercom, &mut solicit, Instant::now());

        // simulate the logic-inconsistency: the address becomes known locally while the
        // unknown-destination entry is still present.
        let c = store.get_or_create([2, 0, 0, 0, 0, 1], 3);
        c.addrs.push(crate::client::ClientIp::new(dst, Instant::now()));

        tokio::time::advance(cfg.seek_interval + Duration::from_millis(1)).await;
        let seeks_before = intercom.seeks.len();
        mgr.run_due_tasks(Instant::now(), &cfg, &store, &mut intercom, &mut solicit);
        assert_eq!(intercom.seeks.len(), seeks_before, "no further seek once destination is known locally");
    }
}
