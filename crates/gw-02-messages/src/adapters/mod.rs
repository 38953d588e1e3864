//! Adapter layer: the wire codec.

pub mod framing;
pub mod validator;

pub use framing::{encode_frame, BxFrameDecoder, RawBxFrame};
pub use validator::BxMessageValidator;
