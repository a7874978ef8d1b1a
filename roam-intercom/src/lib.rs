//! Reference peer-gossip transport: wire codec plus a UDP/IPv6 `Intercom` implementation.
//! Kept out of `roam-core` so the core never depends on socket types (§4.9).

pub mod transport;
pub mod wire;

pub use transport::UdpIntercom;
pub use wire::{decode, encode, Message};
