//! Adapter layer: the per-peer protocol machines.

pub mod btc;
pub mod discovery;
pub mod eth;
pub mod relay;

pub use btc::BtcNodeProtocol;
pub use discovery::EthDiscoveryProtocol;
pub use eth::EthNodeProtocol;
pub use relay::RelayConnectionProtocol;
