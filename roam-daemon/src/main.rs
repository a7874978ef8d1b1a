//
// main.rs - event loop entry point (§5, ambient)
//
// Purpose:
//   Wires the concrete `roam-net`/`roam-intercom` collaborators into the core and runs the
//   single-threaded cooperative event loop: one `tokio::select!` multiplexing the TUN device,
//   the intercom socket, every bound special-IP socket (fanned in over a channel), the route/
//   neighbor multicast subscription, and the task queue's next deadline.
//

mod args;
mod sockets;

use std::net::IpAddr;
use std::time::{Duration, Instant as StdInstant};

use clap::Parser;
use roam_core::{ClientManager, ClientSnapshot, Deps, IpManager, TunWriteQueue};
use roam_intercom::{Message, UdpIntercom};
use roam_net::{NetSolicitor, NetlinkRouteManager, RouteEvent, RouteMonitor, Tun};
use tokio::sync::mpsc;

use crate::args::Args;
use crate::sockets::DaemonSockets;

fn handle_intercom_message(
    client_manager: &mut ClientManager,
    msg: Message,
    from: std::net::SocketAddr,
    deps: &mut Deps,
    now: StdInstant,
) {
    match msg {
        Message::Claim { mac, .. } => client_manager.handle_claim(from, mac, deps, now),
        Message::Info { mac, ifindex, addrs, relinquished } => {
            let foreign = ClientSnapshot { mac, ifindex, addrs };
            client_manager.handle_info(foreign, relinquished, deps, now);
        }
        Message::Seek { addr } => {
            if let Some(snap) = client_manager.snapshot_for_address(&addr) {
                deps.intercom.info(from, &snap, false);
            }
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let args = Args::parse();
    let cfg = args.into_config()?;
    log::info!("effective configuration: {cfg:?}");

    let mut tun = Tun::open(&cfg.tun_name, cfg.tun_mtu)?;
    log::info!("tun device {} up, ifindex {}", cfg.tun_name, tun.ifindex());

    let mut intercom = UdpIntercom::bind(cfg.intercom_port, cfg.peers.clone()).await?;
    let mut route_monitor = RouteMonitor::bind(cfg.export_table)?;

    // one-shot catch-up dump: this is the one netlink call at startup big enough to be worth
    // moving off the event-loop thread, per the concurrency model's spawn_blocking guidance.
    let export_table = cfg.export_table;
    match tokio::task::spawn_blocking(move || roam_net::dump_table_routes(export_table)).await {
        Ok(Ok(existing)) => log::debug!("{} pre-existing route(s) in export table {export_table}", existing.len()),
        Ok(Err(e)) => log::warn!("startup route dump failed: {e}"),
        Err(e) => log::warn!("startup route dump task panicked: {e}"),
    }

    let mut routes = NetlinkRouteManager::new();
    let mut solicit = NetSolicitor::new(cfg.v4prefix, cfg.client_ifindices.clone())?;

    let (sockets_tx, mut sockets_rx) = mpsc::unbounded_channel();
    let mut sockets = DaemonSockets::new(sockets_tx);

    let mut client_manager = ClientManager::new(cfg.clone());
    let mut ip_manager = IpManager::new();
    let mut tun_write_queue = TunWriteQueue::new();

    let mut purge_interval = tokio::time::interval(cfg.oldclients_keep.max(Duration::from_secs(1)));
    purge_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let mut tun_buf = vec![0u8; cfg.tun_mtu as usize + 64];

    loop {
        let next_deadline = ip_manager.queue.next_deadline();

        tokio::select! {
            result = tun.read_frame(&mut tun_buf) => {
                match result {
                    Ok(n) => {
                        let now = tokio::time::Instant::now();
                        let outcome = ip_manager.on_tun_frame(&tun_buf[..n], &cfg, &client_manager.store, &mut intercom, &mut solicit, now);
                        log::trace!("tun frame: {outcome:?}");
                    }
                    Err(e) if roam_core::core_error_kind(&e) == roam_core::CoreErrorKind::Fatal => {
                        log::error!("fatal tun read error: {e}");
                        return Err(e.into());
                    }
                    Err(e) => log::debug!("tun read error: {e}"),
                }
            }

            result = intercom.recv_message() => {
                match result {
                    Ok((msg, from)) => {
                        let mut deps = Deps { routes: &mut routes, solicit: &mut solicit, intercom: &mut intercom, sockets: &mut sockets };
                        handle_intercom_message(&mut client_manager, msg, from, &mut deps, StdInstant::now());
                    }
                    Err(e) => log::warn!("intercom recv error: {e}"),
                }
            }

            datagram = sockets_rx.recv() => {
                if let Some((special_ip, data, from)) = datagram {
                    match roam_intercom::decode(&data) {
                        Ok(msg) => {
                            let mut deps = Deps { routes: &mut routes, solicit: &mut solicit, intercom: &mut intercom, sockets: &mut sockets };
                            handle_intercom_message(&mut client_manager, msg, from, &mut deps, StdInstant::now());
                        }
                        Err(e) => log::debug!("dropping malformed datagram on special ip {special_ip}: {e}"),
                    }
                }
            }

            event = route_monitor.recv_event() => {
                match event {
                    Ok(RouteEvent::RouteAdded(IpAddr::V6(addr), 128)) => {
                        if let Some(packets) = ip_manager.route_appeared(addr) {
                            tun_write_queue.enqueue(packets);
                        }
                        tun_write_queue.drain(&mut tun);
                    }
                    Ok(RouteEvent::RouteAdded(_, _)) => {}
                    Ok(RouteEvent::NeighborSeen { mac, ifindex }) => {
                        if cfg.client_ifindices.is_empty() || cfg.client_ifindices.contains(&ifindex) {
                            let mut deps = Deps { routes: &mut routes, solicit: &mut solicit, intercom: &mut intercom, sockets: &mut sockets };
                            client_manager.notify_mac(mac, ifindex, &mut deps, StdInstant::now());
                        }
                    }
                    Err(e) => log::warn!("route monitor error: {e}"),
                }
            }

            _ = async {
                match next_deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending::<()>().await,
                }
            } => {
                let now = tokio::time::Instant::now();
                ip_manager.run_due_tasks(now, &cfg, &client_manager.store, &mut intercom, &mut solicit);
            }

            _ = purge_interval.tick() => {
                client_manager.store.purge_expired_old(StdInstant::now());
            }
        }
    }
}
