//! Minimal RLP item walking.
//!
//! The block converter needs to know where an RLP item ends without decoding
//! it; this is the Ethereum-side equivalent of the Bitcoin transaction-size
//! walker, with the same refusal to run past the buffer.

use shared_types::GatewayError;

fn truncated() -> GatewayError {
    GatewayError::ProtocolViolation("rlp item past end of buffer".into())
}

/// Total encoded length (prefix included) of the RLP item at `offset`.
pub fn rlp_item_len(buf: &[u8], offset: usize) -> Result<usize, GatewayError> {
    let first = *buf.get(offset).ok_or_else(truncated)?;
    let total = match first {
        0x00..=0x7F => 1,
        0x80..=0xB7 => 1 + (first as usize - 0x80),
        0xB8..=0xBF => {
            let len_len = first as usize - 0xB7;
            1 + len_len + read_length(buf, offset + 1, len_len)?
        }
        0xC0..=0xF7 => 1 + (first as usize - 0xC0),
        0xF8..=0xFF => {
            let len_len = first as usize - 0xF7;
            1 + len_len + read_length(buf, offset + 1, len_len)?
        }
    };
    if offset.checked_add(total).map_or(true, |end| end > buf.len()) {
        return Err(truncated());
    }
    Ok(total)
}

fn read_length(buf: &[u8], offset: usize, len_len: usize) -> Result<usize, GatewayError> {
    let bytes = buf.get(offset..offset + len_len).ok_or_else(truncated)?;
    let mut value: usize = 0;
    for &b in bytes {
        value = value
            .checked_mul(256)
            .and_then(|v| v.checked_add(b as usize))
            .ok_or_else(truncated)?;
    }
    Ok(value)
}
