//! # BDN Messages (GW-02)
//!
//! The overlay wire protocol spoken between the gateway and its relay peers.
//!
//! ## Module Structure (Hexagonal Architecture)
//!
//! - `domain/` — message types, payload layouts, the bx-block short-id
//!   section, and the varint codec they share
//! - `adapters/` — the wire codec: starting-sequence framing and the
//!   pre-dispatch size validator
//! - `ports/` — the `BlockConverter` contract chain modules implement, plus
//!   the `BlockInfo` compression record

pub mod adapters;
pub mod domain;
pub mod ports;

// Module re-exports keeping the crate's flat paths stable.
pub use adapters::{framing, validator};
pub use domain::{constants, message_type, messages, short_ids, varint};
pub use ports::converter;

pub use adapters::framing::{encode_frame, BxFrameDecoder};
pub use adapters::validator::BxMessageValidator;
pub use domain::message_type::BxMessageType;
pub use domain::messages::*;
pub use ports::converter::{BlockConversionResult, BlockConverter, BlockInfo, SHORT_ID_INDICATOR};
