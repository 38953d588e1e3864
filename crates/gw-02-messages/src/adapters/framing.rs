//! Overlay frame encoding and incremental decoding.
//!
//! Frame layout:
//!
//! ```text
//! [starting sequence: 4][payload_length: u32 LE][command: 12B null-padded]
//! [payload bytes][control_flag: u8]
//! ```
//!
//! The control flag is counted in `payload_length`. A frame with a bad
//! starting sequence or an unknown control flag is a protocol violation and
//! closes the connection; a frame with an unknown command is surfaced as
//! `RawBxFrame::Unknown` so the dispatcher can log and discard it.

use crate::domain::constants::{COMMAND_LEN, CONTROL_FLAG_VALID, HEADER_LEN, STARTING_SEQUENCE};
use crate::domain::message_type::BxMessageType;
use crate::adapters::validator::BxMessageValidator;
use shared_types::GatewayError;

/// A decoded overlay frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RawBxFrame {
    /// Known message type with its payload (control flag stripped).
    Message(BxMessageType, Vec<u8>),
    /// Unknown command; logged and discarded by the dispatcher.
    Unknown([u8; COMMAND_LEN]),
}

/// Encodes one overlay frame.
pub fn encode_frame(msg_type: BxMessageType, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len() + 1);
    out.extend_from_slice(&STARTING_SEQUENCE);
    out.extend_from_slice(&((payload.len() + 1) as u32).to_le_bytes());
    out.extend_from_slice(&msg_type.padded_command());
    out.extend_from_slice(payload);
    out.push(CONTROL_FLAG_VALID);
    out
}

/// Incremental overlay frame decoder; owns the inbound buffer of one
/// connection.
pub struct BxFrameDecoder {
    buffer: Vec<u8>,
    validator: BxMessageValidator,
}

impl BxFrameDecoder {
    /// Creates a decoder with the given size validator.
    pub fn new(validator: BxMessageValidator) -> Self {
        Self {
            buffer: Vec::new(),
            validator,
        }
    }

    /// Appends freshly read bytes.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Extracts the next complete frame, if one is buffered.
    pub fn next_frame(&mut self) -> Result<Option<RawBxFrame>, GatewayError> {
        if self.buffer.len() < HEADER_LEN {
            return Ok(None);
        }
        if self.buffer[..4] != STARTING_SEQUENCE {
            return Err(GatewayError::ProtocolViolation(
                "bad starting sequence".into(),
            ));
        }
        let payload_len = u32::from_le_bytes(
            self.buffer[4..8]
                .try_into()
                .expect("slice length checked"),
        ) as usize;
        if payload_len == 0 {
            return Err(GatewayError::ProtocolViolation(
                "payload length excludes control flag".into(),
            ));
        }

        let command: [u8; COMMAND_LEN] = self.buffer[8..8 + COMMAND_LEN]
            .try_into()
            .expect("slice length checked");
        let msg_type = BxMessageType::from_command(&command);
        self.validator.validate(msg_type, payload_len)?;

        let frame_len = HEADER_LEN + payload_len;
        if self.buffer.len() < frame_len {
            return Ok(None);
        }

        let control_flag = self.buffer[frame_len - 1];
        if control_flag != CONTROL_FLAG_VALID {
            return Err(GatewayError::ProtocolViolation(format!(
                "unknown control flag {control_flag:#04x}"
            )));
        }

        let payload = self.buffer[HEADER_LEN..frame_len - 1].to_vec();
        self.buffer.drain(..frame_len);

        Ok(Some(match msg_type {
            Some(t) => RawBxFrame::Message(t, payload),
            None => RawBxFrame::Unknown(command),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decoder() -> BxFrameDecoder {
        BxFrameDecoder::new(BxMessageValidator::default())
    }

    #[test]
    fn test_encode_decode_round_trip() {
        let frame = encode_frame(BxMessageType::Ping, &7u64.to_le_bytes());
        let mut dec = decoder();
        dec.feed(&frame);
        let decoded = dec.next_frame().unwrap().unwrap();
        assert_eq!(
            decoded,
            RawBxFrame::Message(BxMessageType::Ping, 7u64.to_le_bytes().to_vec())
        );
        assert!(dec.next_frame().unwrap().is_none());
    }

    #[test]
    fn test_partial_frame_waits_for_more_bytes() {
        let frame = encode_frame(BxMessageType::Ack, &[]);
        let mut dec = decoder();
        dec.feed(&frame[..10]);
        assert!(dec.next_frame().unwrap().is_none());
        dec.feed(&frame[10..]);
        assert_eq!(
            dec.next_frame().unwrap().unwrap(),
            RawBxFrame::Message(BxMessageType::Ack, vec![])
        );
    }

    #[test]
    fn test_two_frames_in_one_read() {
        let mut bytes = encode_frame(BxMessageType::Ack, &[]);
        bytes.extend_from_slice(&encode_frame(BxMessageType::Ping, &1u64.to_le_bytes()));
        let mut dec = decoder();
        dec.feed(&bytes);
        assert!(matches!(
            dec.next_frame().unwrap().unwrap(),
            RawBxFrame::Message(BxMessageType::Ack, _)
        ));
        assert!(matches!(
            dec.next_frame().unwrap().unwrap(),
            RawBxFrame::Message(BxMessageType::Ping, _)
        ));
    }

    #[test]
    fn test_bad_starting_sequence_is_violation() {
        let mut frame = encode_frame(BxMessageType::Ack, &[]);
        frame[0] = 0x00;
        let mut dec = decoder();
        dec.feed(&frame);
        assert!(matches!(
            dec.next_frame(),
            Err(GatewayError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn test_bad_control_flag_is_violation() {
        let mut frame = encode_frame(BxMessageType::Ack, &[]);
        let last = frame.len() - 1;
        frame[last] = 0x7F;
        let mut dec = decoder();
        dec.feed(&frame);
        assert!(matches!(
            dec.next_frame(),
            Err(GatewayError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn test_unknown_command_is_surfaced_not_fatal() {
        let mut frame = encode_frame(BxMessageType::Ack, &[]);
        frame[8..8 + 7].copy_from_slice(b"mystery");
        let mut dec = decoder();
        dec.feed(&frame);
        assert!(matches!(
            dec.next_frame().unwrap().unwrap(),
            RawBxFrame::Unknown(_)
        ));
    }
}
