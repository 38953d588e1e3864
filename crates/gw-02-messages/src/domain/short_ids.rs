//! Bx-block layout: offsets header and trailing short-id section.
//!
//! A bx-block is laid out as:
//!
//! ```text
//! [short_ids_offset: u64 LE][native header bytes][body pieces…][short ids]
//! ```
//!
//! where the short-id section is a varint count followed by one `u32 LE` per
//! short id.

use crate::domain::varint::{read_varint, varint_len, write_varint};
use shared_types::{GatewayError, ShortId};

/// Size of the offsets header at the front of a bx-block.
pub const BLOCK_OFFSETS_LEN: usize = 8;

/// Parsed bx-block offsets.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockOffsets {
    /// Offset of the first native block byte.
    pub block_begin_offset: usize,
    /// Offset of the short-id section.
    pub short_id_offset: usize,
}

/// Reads the offsets header of a bx-block.
pub fn block_offsets(bx_block: &[u8]) -> Result<BlockOffsets, GatewayError> {
    let header: [u8; BLOCK_OFFSETS_LEN] = bx_block
        .get(..BLOCK_OFFSETS_LEN)
        .ok_or_else(|| GatewayError::ProtocolViolation("bx-block shorter than offsets".into()))?
        .try_into()
        .expect("slice length checked");
    let short_id_offset = u64::from_le_bytes(header) as usize;
    if short_id_offset < BLOCK_OFFSETS_LEN || short_id_offset > bx_block.len() {
        return Err(GatewayError::ProtocolViolation(format!(
            "short id offset {short_id_offset} outside bx-block of {} bytes",
            bx_block.len()
        )));
    }
    Ok(BlockOffsets {
        block_begin_offset: BLOCK_OFFSETS_LEN,
        short_id_offset,
    })
}

/// Serializes a short-id section.
pub fn serialize_short_ids(short_ids: &[ShortId]) -> Vec<u8> {
    let mut out = Vec::with_capacity(varint_len(short_ids.len() as u64) + short_ids.len() * 4);
    write_varint(&mut out, short_ids.len() as u64);
    for sid in short_ids {
        out.extend_from_slice(&sid.to_le_bytes());
    }
    out
}

/// Deserializes the short-id section starting at `offset`, returning the ids
/// and the section's encoded length.
pub fn deserialize_short_ids(
    buf: &[u8],
    offset: usize,
) -> Result<(Vec<ShortId>, usize), GatewayError> {
    let (count, count_len) = read_varint(buf, offset)?;
    let count = count as usize;
    let ids_start = offset + count_len;
    let ids_end = ids_start + count * 4;
    let ids_bytes = buf.get(ids_start..ids_end).ok_or_else(|| {
        GatewayError::ProtocolViolation("short id section past end of bx-block".into())
    })?;
    let short_ids = ids_bytes
        .chunks_exact(4)
        .map(|chunk| u32::from_le_bytes(chunk.try_into().expect("chunk of 4")))
        .collect();
    Ok((short_ids, count_len + count * 4))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_ids_round_trip() {
        for ids in [vec![], vec![1u32], vec![5, 9, 1_000_000]] {
            let section = serialize_short_ids(&ids);
            let (decoded, len) = deserialize_short_ids(&section, 0).unwrap();
            assert_eq!(decoded, ids);
            assert_eq!(len, section.len());
        }
    }

    #[test]
    fn test_offsets_round_trip() {
        let mut block = Vec::new();
        block.extend_from_slice(&20u64.to_le_bytes());
        block.extend_from_slice(&[0u8; 14]);
        let offsets = block_offsets(&block).unwrap();
        assert_eq!(offsets.block_begin_offset, BLOCK_OFFSETS_LEN);
        assert_eq!(offsets.short_id_offset, 20);
    }

    #[test]
    fn test_offset_past_end_rejected() {
        let mut block = Vec::new();
        block.extend_from_slice(&100u64.to_le_bytes());
        assert!(block_offsets(&block).is_err());
    }

    #[test]
    fn test_truncated_section_rejected() {
        let section = serialize_short_ids(&[1, 2, 3]);
        assert!(deserialize_short_ids(&section[..section.len() - 1], 0).is_err());
    }
}
