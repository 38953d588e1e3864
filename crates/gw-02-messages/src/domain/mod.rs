//! Domain layer: message types and payload layouts.

pub mod constants;
pub mod message_type;
pub mod messages;
pub mod short_ids;
pub mod varint;

pub use message_type::BxMessageType;
pub use messages::{BxMessage, TxsEntry};
