//! # Connections (GW-06)
//!
//! Per-peer protocol state machines. Each connection's message handling is a
//! dispatch table from message type to handler function, built at
//! construction; chain-specific protocols extend the base table by inserting
//! entries. The machines are pure: all I/O goes through the
//! [`gw_05_block_pipeline::GatewayContext`] capability interface, so every
//! protocol can be driven in tests without sockets.
//!
//! ## Module Structure (Hexagonal Architecture)
//!
//! - `domain/` — connection identity and lifecycle state
//! - `adapters/` — one protocol machine per peer kind: BDN relay, Bitcoin
//!   node, Ethereum node, and the Ethereum discovery exchange

pub mod adapters;
pub mod domain;

// Module re-exports keeping the crate's flat paths stable.
pub use adapters::{btc, discovery, eth, relay};

pub use adapters::btc::BtcNodeProtocol;
pub use adapters::discovery::EthDiscoveryProtocol;
pub use adapters::eth::EthNodeProtocol;
pub use adapters::relay::RelayConnectionProtocol;
pub use domain::ConnectionInfo;
