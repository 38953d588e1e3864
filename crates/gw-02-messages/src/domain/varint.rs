//! Compact-size variable-length integers.
//!
//! The encoding used both by the bx-block short-id section and by the Bitcoin
//! wire protocol: one byte below 0xFD, otherwise a marker byte followed by a
//! little-endian u16/u32/u64.

use shared_types::GatewayError;

/// Encoded size of `value` in bytes.
pub fn varint_len(value: u64) -> usize {
    match value {
        0..=0xFC => 1,
        0xFD..=0xFFFF => 3,
        0x1_0000..=0xFFFF_FFFF => 5,
        _ => 9,
    }
}

/// Appends the varint encoding of `value` to `out`.
pub fn write_varint(out: &mut Vec<u8>, value: u64) {
    match value {
        0..=0xFC => out.push(value as u8),
        0xFD..=0xFFFF => {
            out.push(0xFD);
            out.extend_from_slice(&(value as u16).to_le_bytes());
        }
        0x1_0000..=0xFFFF_FFFF => {
            out.push(0xFE);
            out.extend_from_slice(&(value as u32).to_le_bytes());
        }
        _ => {
            out.push(0xFF);
            out.extend_from_slice(&value.to_le_bytes());
        }
    }
}

/// Reads a varint at `offset`, returning `(value, encoded_len)`.
pub fn read_varint(buf: &[u8], offset: usize) -> Result<(u64, usize), GatewayError> {
    let truncated = || GatewayError::ProtocolViolation("varint past end of buffer".into());
    let first = *buf.get(offset).ok_or_else(truncated)?;
    match first {
        0..=0xFC => Ok((first as u64, 1)),
        0xFD => {
            let bytes: [u8; 2] = buf
                .get(offset + 1..offset + 3)
                .ok_or_else(truncated)?
                .try_into()
                .expect("slice length checked");
            Ok((u16::from_le_bytes(bytes) as u64, 3))
        }
        0xFE => {
            let bytes: [u8; 4] = buf
                .get(offset + 1..offset + 5)
                .ok_or_else(truncated)?
                .try_into()
                .expect("slice length checked");
            Ok((u32::from_le_bytes(bytes) as u64, 5))
        }
        0xFF => {
            let bytes: [u8; 8] = buf
                .get(offset + 1..offset + 9)
                .ok_or_else(truncated)?
                .try_into()
                .expect("slice length checked");
            Ok((u64::from_le_bytes(bytes), 9))
        }
    }
}
