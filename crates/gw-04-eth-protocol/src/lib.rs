//! # Ethereum Protocol (GW-04)
//!
//! The Ethereum-facing half of the gateway.
//!
//! ## Module Structure (Hexagonal Architecture)
//!
//! - `domain/` — subprotocol messages, the internal block payload, RLP item
//!   walking, and the eth block converter
//! - `transport/` — ECIES handshake, the RLPx frame cipher, the signed
//!   discovery exchange, and the secp256k1/keccak helpers they share

pub mod domain;
pub mod transport;

// Module re-exports keeping the crate's flat paths stable.
pub use domain::{block, constants, converter, messages, rlp_utils};
pub use transport::{crypto_utils, discovery, ecies, rlpx};

pub use domain::block::{InternalEthBlock, NewBlockParts};
pub use domain::converter::EthBlockConverter;
pub use domain::messages::EthMessage;
pub use transport::rlpx::{RlpxFrameCodec, RlpxHandshake, RlpxSecrets};
