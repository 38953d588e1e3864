//! Adapter layer: the Bitcoin wire codec and message payloads.

pub mod messages;
pub mod wire;

pub use messages::{BtcBlockMessage, BtcCompactBlockMessage, InventoryVector};
pub use wire::{encode_btc_message, BtcCommand, BtcFrameDecoder, RawBtcFrame};
