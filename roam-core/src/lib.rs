//! Core of the Layer-3 roaming daemon: client lifecycle tracking, the per-address IP state
//! machine, and unknown-destination discovery. Collaborator boundaries (kernel route/neighbor
//! tables, TUN bytes, ARP/ICMPv6 solicitation, peer intercom) are traits; concrete
//! implementations live in `roam-net` and `roam-intercom`.

pub mod alloc;
pub mod client;
pub mod client_manager;
pub mod config;
pub mod error;
pub mod intercom;
pub mod ip_manager;
pub mod prefix;
pub mod state_machine;
pub mod store;
pub mod task_queue;

pub use alloc::{allocate_ipv4, sdbm_hash, synthesize_special_ip, AllocError};
pub use client::{Client, ClientIp, IpState};
pub use client_manager::{ClientManager, Deps, SpecialIpSocketAdapter};
pub use config::Config;
pub use error::{core_error_kind, CoreError, CoreErrorKind};
pub use intercom::{ClientSnapshot, Intercom};
pub use ip_manager::{IpManager, PendingPacket, TunFrameOutcome, TunWriteQueue, TunWriter};
pub use prefix::{embed_ipv4, mapped_ipv4, parse_prefix, prefix_contains, Prefix, PrefixError};
pub use state_machine::{set_state, RouteNeighborAdapter, SolicitAdapter};
pub use store::ClientStore;
pub use task_queue::{SeekKind, TaskQueue};
