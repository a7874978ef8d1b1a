//
// args.rs - CLI flags (§4.11, ambient)
//
// Purpose:
//   Parses the options enumerated in §6 from the command line and turns them into the
//   `roam_core::Config` value the core consumes. Nothing here is interpreted by the core
//   itself; a config-file loader could replace this module without touching anything else.
//

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use clap::Parser;
use roam_core::{parse_prefix, Config, Prefix};

#[derive(Parser, Debug)]
#[command(name = "roamd", about = "Layer-3 roaming daemon", arg_required_else_help = true)]
pub struct Args {
    /// Start of the deterministic IPv4 allocation range (inclusive).
    #[arg(long)]
    pub start: Ipv4Addr,

    /// End of the deterministic IPv4 allocation range (inclusive).
    #[arg(long)]
    pub end: Ipv4Addr,

    /// IPv6 prefix the allocated IPv4 range is carried inside of, as `addr/96`.
    #[arg(long)]
    pub v4prefix: String,

    /// Client prefix the daemon is responsible for, as `addr/plen`. May be repeated.
    #[arg(long = "prefix", required = true)]
    pub prefixes: Vec<String>,

    /// The `/48` used to synthesize special per-client IPv6 addresses.
    #[arg(long)]
    pub node_client_prefix: String,

    /// Numeric kernel routing table host routes are installed into.
    #[arg(long)]
    pub export_table: u32,

    /// Interface index mapped IPv4/IPv6 traffic exits through.
    #[arg(long)]
    pub nat46ifindex: u32,

    /// How long a departed client's addresses are kept in the old-clients set, e.g. `5m`.
    #[arg(long, default_value = "300s")]
    pub oldclients_keep: String,

    /// Interval between successive seek retries (local + peer), e.g. `2s`.
    #[arg(long, default_value = "2s")]
    pub seek_interval: String,

    /// Age at which a buffered packet is dropped from an unknown-destination entry, e.g. `10s`.
    #[arg(long, default_value = "10s")]
    pub packet_timeout: String,

    /// UDP port special-IP sockets and the intercom transport bind to.
    #[arg(long, default_value_t = 4433)]
    pub intercom_port: u16,

    /// TUN interface name to create/use.
    #[arg(long, default_value = "roam0")]
    pub tun_name: String,

    /// TUN interface MTU.
    #[arg(long, default_value_t = 1400)]
    pub tun_mtu: u32,

    /// Peer node address for the reference intercom transport (`[addr]:port`). May be repeated.
    #[arg(long = "peer")]
    pub peers: Vec<SocketAddr>,

    /// Interface index to broadcast a solicitation on when no owning interface is known yet
    /// for a sought destination. May be repeated.
    #[arg(long = "client-ifindex")]
    pub client_ifindices: Vec<u32>,
}

impl Args {
    pub fn into_config(self) -> anyhow::Result<Config> {
        let mut v4prefix = parse_prefix(&self.v4prefix)?;
        v4prefix.is_v4 = true;
        if v4prefix.plen != 96 {
            anyhow::bail!("v4prefix must be a /96, got /{}", v4prefix.plen);
        }

        let prefixes = self
            .prefixes
            .iter()
            .map(|s| parse_prefix(s).map_err(anyhow::Error::from))
            .collect::<anyhow::Result<Vec<Prefix>>>()?;

        let node_client_prefix = parse_prefix(&self.node_client_prefix)?;
        if node_client_prefix.plen != 48 {
            anyhow::bail!("node_client_prefix must be a /48, got /{}", node_client_prefix.plen);
        }

        if u32::from(self.end) < u32::from(self.start) {
            anyhow::bail!("end ({}) precedes start ({})", self.end, self.start);
        }

        Ok(Config {
            start: self.start,
            end: self.end,
            v4prefix,
            prefixes,
            node_client_prefix,
            export_table: self.export_table,
            nat46ifindex: self.nat46ifindex,
            oldclients_keep: parse_duration(&self.oldclients_keep)?,
            seek_interval: parse_duration(&self.seek_interval)?,
            packet_timeout: parse_duration(&self.packet_timeout)?,
            intercom_port: self.intercom_port,
            tun_name: self.tun_name,
            tun_mtu: self.tun_mtu,
            peers: self.peers,
            client_ifindices: self.client_ifindices,
        })
    }
}

fn parse_duration(s: &str) -> anyhow::Result<Duration> {
    humantime::parse_duration(s).map_err(|e| anyhow::anyhow!("invalid duration {s:?}: {e}"))
}
