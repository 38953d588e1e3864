//! Bitcoin transaction parsing.
//!
//! The gateway never validates transactions; it only needs to know where one
//! ends (to walk block bodies) and what its txid is (to look up short ids).
//! Both must refuse to walk past the end of the buffer: a truncated
//! transaction inside a block is a hard conversion failure.

use crate::domain::constants::{BTC_TX_OUTPOINT_LEN, BTC_TX_SEGWIT_FLAG, BTC_TX_SEGWIT_MARKER};
use gw_02_messages::varint::read_varint;
use shared_types::{double_sha256, GatewayError, Sha256Hash};

/// A parsed transaction: its encoded size and content hash.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParsedTx {
    /// Total encoded size, witness included.
    pub size: usize,
    /// Double-SHA256 of the de-witnessed encoding.
    pub txid: Sha256Hash,
}

fn truncated() -> GatewayError {
    GatewayError::ProtocolViolation("transaction past end of buffer".into())
}

fn take(buf: &[u8], offset: usize, len: usize) -> Result<&[u8], GatewayError> {
    let end = offset.checked_add(len).ok_or_else(truncated)?;
    buf.get(offset..end).ok_or_else(truncated)
}

/// Parses the transaction starting at `offset`, returning its size and txid.
pub fn parse_transaction(buf: &[u8], offset: usize) -> Result<ParsedTx, GatewayError> {
    let start = offset;
    let mut pos = offset;

    take(buf, pos, 4)?;
    pos += 4;

    let segwit = matches!(
        take(buf, pos, 2),
        Ok([BTC_TX_SEGWIT_MARKER, BTC_TX_SEGWIT_FLAG])
    );
    if segwit {
        pos += 2;
    }

    let body_start = pos;
    let (input_count, len) = read_varint(buf, pos).map_err(|_| truncated())?;
    pos += len;
    for _ in 0..input_count {
        take(buf, pos, BTC_TX_OUTPOINT_LEN)?;
        pos += BTC_TX_OUTPOINT_LEN;
        let (script_len, len) = read_varint(buf, pos).map_err(|_| truncated())?;
        pos += len;
        take(buf, pos, script_len as usize)?;
        pos += script_len as usize;
        take(buf, pos, 4)?; // sequence
        pos += 4;
    }

    let (output_count, len) = read_varint(buf, pos).map_err(|_| truncated())?;
    pos += len;
    for _ in 0..output_count {
        take(buf, pos, 8)?; // value
        pos += 8;
        let (script_len, len) = read_varint(buf, pos).map_err(|_| truncated())?;
        pos += len;
        take(buf, pos, script_len as usize)?;
        pos += script_len as usize;
    }
    let body_end = pos;

    if segwit {
        for _ in 0..input_count {
            let (item_count, len) = read_varint(buf, pos).map_err(|_| truncated())?;
            pos += len;
            for _ in 0..item_count {
                let (item_len, len) = read_varint(buf, pos).map_err(|_| truncated())?;
                pos += len;
                take(buf, pos, item_len as usize)?;
                pos += item_len as usize;
            }
        }
    }

    take(buf, pos, 4)?; // locktime
    pos += 4;

    let txid = if segwit {
        // txid covers version + inputs/outputs + locktime, witness stripped.
        let mut stripped =
            Vec::with_capacity(4 + (body_end - body_start) + 4);
        stripped.extend_from_slice(&buf[start..start + 4]);
        stripped.extend_from_slice(&buf[body_start..body_end]);
        stripped.extend_from_slice(&buf[pos - 4..pos]);
        double_sha256(&stripped)
    } else {
        double_sha256(&buf[start..pos])
    };

    Ok(ParsedTx {
        size: pos - start,
        txid,
    })
}

/// Size of the transaction starting at `offset`.
pub fn get_next_tx_size(buf: &[u8], offset: usize) -> Result<usize, GatewayError> {
    Ok(parse_transaction(buf, offset)?.size)
}

pub mod test_support {
    //! Builders for synthetic transactions used across the converter tests.

    /// A minimal legacy transaction with one input and one output, with
    /// `tag` mixed into the output script to vary the txid.
    pub fn legacy_tx(tag: u8) -> Vec<u8> {
        let mut tx = Vec::new();
        tx.extend_from_slice(&1u32.to_le_bytes()); // version
        tx.push(1); // input count
        tx.extend_from_slice(&[0xAA; 36]); // outpoint
        tx.push(2); // script len
        tx.extend_from_slice(&[0x51, tag]);
        tx.extend_from_slice(&0xFFFF_FFFFu32.to_le_bytes()); // sequence
        tx.push(1); // output count
        tx.extend_from_slice(&50_000u64.to_le_bytes()); // value
        tx.push(3); // script len
        tx.extend_from_slice(&[0x76, 0xA9, tag]);
        tx.extend_from_slice(&0u32.to_le_bytes()); // locktime
        tx
    }

    /// A segwit transaction with one input carrying a two-item witness.
    pub fn segwit_tx(tag: u8) -> Vec<u8> {
        let mut tx = Vec::new();
        tx.extend_from_slice(&2u32.to_le_bytes()); // version
        tx.push(0x00); // marker
        tx.push(0x01); // flag
        tx.push(1); // input count
        tx.extend_from_slice(&[tag; 36]); // outpoint
        tx.push(0); // empty script sig
        tx.extend_from_slice(&0xFFFF_FFFFu32.to_le_bytes());
        tx.push(1); // output count
        tx.extend_from_slice(&25_000u64.to_le_bytes());
        tx.push(2);
        tx.extend_from_slice(&[0x00, 0x14]);
        // witness: two items
        tx.push(2);
        tx.push(3);
        tx.extend_from_slice(&[0x01, 0x02, 0x03]);
        tx.push(2);
        tx.extend_from_slice(&[0x04, 0x05]);
        tx.extend_from_slice(&0u32.to_le_bytes()); // locktime
        tx
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::{legacy_tx, segwit_tx};
    use super::*;

    #[test]
    fn test_legacy_tx_size() {
        let tx = legacy_tx(0x01);
        let parsed = parse_transaction(&tx, 0).unwrap();
        assert_eq!(parsed.size, tx.len());
        assert_eq!(parsed.txid, double_sha256(&tx));
    }

    #[test]
    fn test_legacy_tx_at_offset() {
        let tx = legacy_tx(0x02);
        let mut buf = vec![0xEE; 10];
        buf.extend_from_slice(&tx);
        let parsed = parse_transaction(&buf, 10).unwrap();
        assert_eq!(parsed.size, tx.len());
    }

    #[test]
    fn test_segwit_tx_size_and_stripped_txid() {
        let tx = segwit_tx(0x07);
        let parsed = parse_transaction(&tx, 0).unwrap();
        assert_eq!(parsed.size, tx.len());

        // The txid must hash the stripped encoding, not the full bytes.
        assert_ne!(parsed.txid, double_sha256(&tx));

        let mut stripped = Vec::new();
        stripped.extend_from_slice(&tx[..4]);
        stripped.extend_from_slice(&tx[6..tx.len() - 12]); // body without witness
        stripped.extend_from_slice(&tx[tx.len() - 4..]);
        assert_eq!(parsed.txid, double_sha256(&stripped));
    }

    #[test]
    fn test_truncated_tx_is_error() {
        let tx = legacy_tx(0x03);
        for cut in [3, 10, tx.len() - 1] {
            assert!(parse_transaction(&tx[..cut], 0).is_err());
        }
    }

    #[test]
    fn test_different_tags_give_different_txids() {
        let a = parse_transaction(&legacy_tx(1), 0).unwrap();
        let b = parse_transaction(&legacy_tx(2), 0).unwrap();
        assert_ne!(a.txid, b.txid);
    }
}
