//! Transport layer: encrypted framing and discovery.

pub mod crypto_utils;
pub mod discovery;
pub mod ecies;
pub mod rlpx;

pub use rlpx::{RlpxFrameCodec, RlpxHandshake, RlpxSecrets};
