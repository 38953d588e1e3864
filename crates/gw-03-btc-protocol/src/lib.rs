//! # Bitcoin Protocol (GW-03)
//!
//! The Bitcoin-facing half of the gateway.
//!
//! ## Module Structure (Hexagonal Architecture)
//!
//! - `domain/` — transaction parsing, network constants, and the two block
//!   converters (normal blocks and BIP-152 compact blocks)
//! - `adapters/` — wire framing and the message payloads the gateway reads
//!   and writes

pub mod adapters;
pub mod domain;

// Module re-exports keeping the crate's flat paths stable.
pub use adapters::{messages, wire};
pub use domain::{compact, constants, converter, tx};

pub use adapters::messages::{BtcBlockMessage, BtcCompactBlockMessage, InventoryVector};
pub use adapters::wire::{encode_btc_message, BtcCommand, BtcFrameDecoder};
pub use domain::compact::{CompactBlockConverter, CompactConversionResult};
pub use domain::converter::BtcBlockConverter;
