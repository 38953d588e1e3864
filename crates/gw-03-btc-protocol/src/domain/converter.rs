//! Bitcoin block ↔ bx-block conversion.
//!
//! Compression walks the block body transaction by transaction, replacing
//! every transaction with a known short id by a single indicator byte and
//! collecting the ids in the trailing section. Decompression reverses the
//! substitution through the transaction service; anything unresolved is
//! reported for recovery instead of failing the block.

use crate::domain::constants::{BTC_BLOCK_HDR_SIZE, BTC_HDR_COMMON_OFF};
use crate::adapters::messages::BtcBlockMessage;
use crate::domain::tx::parse_transaction;
use crate::adapters::wire::{encode_btc_message, BtcCommand};
use gw_01_tx_service::TransactionService;
use gw_02_messages::converter::{
    BlockConversionResult, BlockConverter, BlockInfo, SHORT_ID_INDICATOR,
};
use gw_02_messages::short_ids::{
    block_offsets, deserialize_short_ids, serialize_short_ids, BLOCK_OFFSETS_LEN,
};
use gw_02_messages::varint::read_varint;
use shared_types::{double_sha256, GatewayError, Sha256Hash, ShortId, NULL_SHORT_ID};
use std::time::Instant;
use tracing::{debug, warn};

/// Converter between Bitcoin wire blocks and bx-blocks.
#[derive(Clone, Copy, Debug)]
pub struct BtcBlockConverter {
    magic: u32,
}

impl BtcBlockConverter {
    /// Creates a converter for the given network magic.
    pub fn new(magic: u32) -> Self {
        Self { magic }
    }

    fn conversion_error(block_hash: Sha256Hash, reason: impl Into<String>) -> GatewayError {
        GatewayError::MessageConversion {
            block_hash,
            reason: reason.into(),
        }
    }
}

impl BlockConverter for BtcBlockConverter {
    fn block_to_bx_block(
        &self,
        block_msg: &[u8],
        tx_service: &TransactionService,
    ) -> Result<(Vec<u8>, BlockInfo), GatewayError> {
        let start = Instant::now();
        let block = BtcBlockMessage::parse(block_msg)?;
        let block_hash = block.block_hash();

        let header = &block_msg[..block.header_piece_len()];
        let mut body = Vec::with_capacity(block_msg.len() - header.len());
        let mut short_ids: Vec<ShortId> = Vec::new();

        let mut offset = block.header_piece_len();
        for _ in 0..block.txn_count() {
            let parsed = parse_transaction(block_msg, offset)
                .map_err(|_| Self::conversion_error(block_hash, "truncated transaction"))?;
            let short_id = tx_service.get_short_id(&parsed.txid);
            if short_id == NULL_SHORT_ID {
                if block_msg[offset] == SHORT_ID_INDICATOR {
                    return Err(Self::conversion_error(
                        block_hash,
                        "transaction version collides with short id indicator",
                    ));
                }
                body.extend_from_slice(&block_msg[offset..offset + parsed.size]);
            } else {
                short_ids.push(short_id);
                body.push(SHORT_ID_INDICATOR);
            }
            offset += parsed.size;
        }
        if offset != block_msg.len() {
            return Err(Self::conversion_error(
                block_hash,
                "trailing bytes after last transaction",
            ));
        }

        let serialized_sids = serialize_short_ids(&short_ids);
        let sids_offset = (BLOCK_OFFSETS_LEN + header.len() + body.len()) as u64;
        let mut bx_block =
            Vec::with_capacity(BLOCK_OFFSETS_LEN + header.len() + body.len() + serialized_sids.len());
        bx_block.extend_from_slice(&sids_offset.to_le_bytes());
        bx_block.extend_from_slice(header);
        bx_block.extend_from_slice(&body);
        bx_block.extend_from_slice(&serialized_sids);

        debug!(
            %block_hash,
            original = block_msg.len(),
            compressed = bx_block.len(),
            substituted = short_ids.len(),
            "compressed block"
        );

        let block_info = BlockInfo {
            block_hash,
            prev_block_hash: Some(block.prev_block_hash()),
            compressed_block_hash: Some(double_sha256(&bx_block)),
            txn_count: block.txn_count(),
            original_size: block_msg.len(),
            compressed_size: bx_block.len(),
            short_ids,
            start,
            duration: start.elapsed(),
        };
        Ok((bx_block, block_info))
    }

    fn bx_block_to_block(
        &self,
        bx_block: &[u8],
        tx_service: &TransactionService,
    ) -> Result<BlockConversionResult, GatewayError> {
        let start = Instant::now();
        let offsets = block_offsets(bx_block)?;
        let (short_ids, _) = deserialize_short_ids(bx_block, offsets.short_id_offset)?;

        let header_start = offsets.block_begin_offset + BTC_HDR_COMMON_OFF;
        let header_end = header_start + BTC_BLOCK_HDR_SIZE;
        let header_window = bx_block.get(header_start..header_end).ok_or_else(|| {
            GatewayError::ProtocolViolation("bx-block shorter than block header".into())
        })?;
        let block_hash = double_sha256(header_window);

        let (txn_count, txn_count_len) = read_varint(bx_block, header_end)?;
        let header_piece = &bx_block[offsets.block_begin_offset..header_end + txn_count_len];

        let build_info = |short_ids: Vec<ShortId>, compressed_hash, original_size| BlockInfo {
            block_hash,
            prev_block_hash: Sha256Hash::from_slice(&header_window[4..36]),
            compressed_block_hash: compressed_hash,
            txn_count: txn_count as usize,
            original_size,
            compressed_size: bx_block.len(),
            short_ids,
            start,
            duration: start.elapsed(),
        };

        let missing = tx_service.get_missing_transactions(&short_ids);
        if missing.any() {
            warn!(
                %block_hash,
                missing_sids = missing.sids.len(),
                missing_hashes = missing.hashes.len(),
                total_txs = txn_count,
                "block recovery needed"
            );
            return Ok(BlockConversionResult {
                block: None,
                block_info: build_info(short_ids, None, 0),
                unknown_sids: missing.sids,
                unknown_hashes: missing.hashes,
            });
        }

        let body = &bx_block[..offsets.short_id_offset];
        let mut block = Vec::with_capacity(bx_block.len());
        block.extend_from_slice(header_piece);
        let mut offset = header_end + txn_count_len;
        let mut short_tx_index = 0usize;
        while offset < offsets.short_id_offset {
            if body[offset] == SHORT_ID_INDICATOR {
                let sid = *short_ids.get(short_tx_index).ok_or_else(|| {
                    Self::conversion_error(
                        block_hash,
                        format!(
                            "short id index {short_tx_index} exceeds section of {}",
                            short_ids.len()
                        ),
                    )
                })?;
                let (_, contents) = tx_service
                    .get_transaction(sid)
                    .ok_or_else(|| Self::conversion_error(block_hash, "short id vanished"))?;
                let contents = contents
                    .ok_or_else(|| Self::conversion_error(block_hash, "contents vanished"))?;
                block.extend_from_slice(contents);
                offset += 1;
                short_tx_index += 1;
            } else {
                let parsed = parse_transaction(body, offset).map_err(|_| {
                    Self::conversion_error(block_hash, "transaction walks past end of body")
                })?;
                block.extend_from_slice(&body[offset..offset + parsed.size]);
                offset += parsed.size;
            }
        }

        debug!(%block_hash, txs = txn_count, "decompressed block");
        let original_size = block.len();
        Ok(BlockConversionResult {
            block: Some(block),
            block_info: build_info(short_ids, Some(double_sha256(bx_block)), original_size),
            unknown_sids: Vec::new(),
            unknown_hashes: Vec::new(),
        })
    }

    fn bx_tx_to_tx(&self, contents: &[u8]) -> Result<Vec<u8>, GatewayError> {
        // Validate before wrapping; a malformed tx would poison the node.
        parse_transaction(contents, 0)?;
        Ok(encode_btc_message(self.magic, BtcCommand::Tx, contents))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::constants::BTC_MAINNET_MAGIC;
    use crate::adapters::messages::build_block_message;
    use crate::domain::tx::test_support::{legacy_tx, segwit_tx};

    fn converter() -> BtcBlockConverter {
        BtcBlockConverter::new(BTC_MAINNET_MAGIC)
    }

    fn txid(tx: &[u8]) -> Sha256Hash {
        parse_transaction(tx, 0).unwrap().txid
    }

    #[test]
    fn test_round_trip_no_known_sids() {
        let txns = vec![legacy_tx(1), segwit_tx(2), legacy_tx(3)];
        let block = build_block_message(BTC_MAINNET_MAGIC, &[0x33; 80], &txns);
        let service = TransactionService::with_defaults();

        let (bx_block, info) = converter().block_to_bx_block(&block, &service).unwrap();
        assert!(info.short_ids.is_empty());
        // No substitutions: compression only adds the offsets prefix and an
        // empty short id section.
        assert_eq!(bx_block.len(), block.len() + BLOCK_OFFSETS_LEN + 1);

        let result = converter().bx_block_to_block(&bx_block, &service).unwrap();
        assert_eq!(result.block.as_deref(), Some(&block[..]));
        assert_eq!(result.block_info.txn_count, 3);
    }

    #[test]
    fn test_round_trip_with_substitution() {
        let txns = vec![legacy_tx(1), segwit_tx(2), legacy_tx(3)];
        let block = build_block_message(BTC_MAINNET_MAGIC, &[0x44; 80], &txns);

        let mut service = TransactionService::with_defaults();
        for (i, tx) in txns.iter().enumerate() {
            service.assign_short_id(txid(tx), (i + 1) as ShortId).unwrap();
            service.set_transaction_contents(txid(tx), tx.clone());
        }

        let (bx_block, info) = converter().block_to_bx_block(&block, &service).unwrap();
        assert_eq!(info.short_ids, vec![1, 2, 3]);
        assert!(bx_block.len() < block.len());
        assert!(info.compression_rate() > 0.0);

        let result = converter().bx_block_to_block(&bx_block, &service).unwrap();
        assert_eq!(result.block.as_deref(), Some(&block[..]));
        assert!(result.unknown_sids.is_empty());
    }

    #[test]
    fn test_partial_substitution_round_trip() {
        let txns = vec![legacy_tx(1), legacy_tx(2), legacy_tx(3)];
        let block = build_block_message(BTC_MAINNET_MAGIC, &[0x55; 80], &txns);

        let mut service = TransactionService::with_defaults();
        // Only the middle transaction is known.
        service.assign_short_id(txid(&txns[1]), 42).unwrap();
        service.set_transaction_contents(txid(&txns[1]), txns[1].clone());

        let (bx_block, info) = converter().block_to_bx_block(&block, &service).unwrap();
        assert_eq!(info.short_ids, vec![42]);

        let result = converter().bx_block_to_block(&bx_block, &service).unwrap();
        assert_eq!(result.block.as_deref(), Some(&block[..]));
    }

    #[test]
    fn test_unknown_sid_reports_recovery() {
        let txns = vec![legacy_tx(7)];
        let block = build_block_message(BTC_MAINNET_MAGIC, &[0x66; 80], &txns);

        let mut compressing = TransactionService::with_defaults();
        compressing.assign_short_id(txid(&txns[0]), 99).unwrap();
        compressing.set_transaction_contents(txid(&txns[0]), txns[0].clone());
        let (bx_block, _) = converter().block_to_bx_block(&block, &compressing).unwrap();

        // The decompressing side has never heard of sid 99.
        let empty = TransactionService::with_defaults();
        let result = converter().bx_block_to_block(&bx_block, &empty).unwrap();
        assert!(result.needs_recovery());
        assert_eq!(result.unknown_sids, vec![99]);
        assert!(result.unknown_hashes.is_empty());
        assert_eq!(result.block_info.block_hash, double_sha256(&[0x66; 80]));
    }

    #[test]
    fn test_known_sid_missing_contents_reports_hash() {
        let txns = vec![legacy_tx(8)];
        let block = build_block_message(BTC_MAINNET_MAGIC, &[0x77; 80], &txns);

        let mut compressing = TransactionService::with_defaults();
        compressing.assign_short_id(txid(&txns[0]), 5).unwrap();
        compressing.set_transaction_contents(txid(&txns[0]), txns[0].clone());
        let (bx_block, _) = converter().block_to_bx_block(&block, &compressing).unwrap();

        let mut decompressing = TransactionService::with_defaults();
        decompressing.assign_short_id(txid(&txns[0]), 5).unwrap();
        let result = converter().bx_block_to_block(&bx_block, &decompressing).unwrap();
        assert!(result.needs_recovery());
        assert!(result.unknown_sids.is_empty());
        assert_eq!(result.unknown_hashes, vec![txid(&txns[0])]);
    }

    #[test]
    fn test_recovery_then_redecompression_round_trip() {
        let txns = vec![legacy_tx(9), legacy_tx(10)];
        let block = build_block_message(BTC_MAINNET_MAGIC, &[0x88; 80], &txns);

        let mut compressing = TransactionService::with_defaults();
        for (i, tx) in txns.iter().enumerate() {
            compressing.assign_short_id(txid(tx), (i + 1) as ShortId).unwrap();
            compressing.set_transaction_contents(txid(tx), tx.clone());
        }
        let (bx_block, _) = converter().block_to_bx_block(&block, &compressing).unwrap();

        let mut recovering = TransactionService::with_defaults();
        let first = converter().bx_block_to_block(&bx_block, &recovering).unwrap();
        assert!(first.needs_recovery());

        // Learn the missing transactions, then decompress again.
        for (i, tx) in txns.iter().enumerate() {
            recovering.assign_short_id(txid(tx), (i + 1) as ShortId).unwrap();
            recovering.set_transaction_contents(txid(tx), tx.clone());
        }
        let second = converter().bx_block_to_block(&bx_block, &recovering).unwrap();
        assert_eq!(second.block.as_deref(), Some(&block[..]));
    }

    #[test]
    fn test_short_id_index_overflow_is_hard_failure() {
        let txns = vec![legacy_tx(11)];
        let block = build_block_message(BTC_MAINNET_MAGIC, &[0x99; 80], &txns);

        let mut service = TransactionService::with_defaults();
        service.assign_short_id(txid(&txns[0]), 3).unwrap();
        service.set_transaction_contents(txid(&txns[0]), txns[0].clone());
        let (mut bx_block, _) = converter().block_to_bx_block(&block, &service).unwrap();

        // Truncate the short id section down to zero entries.
        let sids_offset = u64::from_le_bytes(bx_block[..8].try_into().unwrap()) as usize;
        bx_block.truncate(sids_offset);
        bx_block.push(0); // varint: zero short ids

        let err = converter().bx_block_to_block(&bx_block, &service).unwrap_err();
        assert!(matches!(err, GatewayError::MessageConversion { .. }));
    }

    #[test]
    fn test_truncated_tx_in_body_is_hard_failure() {
        let txns = vec![legacy_tx(12)];
        let block = build_block_message(BTC_MAINNET_MAGIC, &[0xAB; 80], &txns);
        let service = TransactionService::with_defaults();
        let (bx_block, _) = converter().block_to_bx_block(&block, &service).unwrap();

        // Chop a few body bytes out, keeping the short id section aligned.
        let sids_offset = u64::from_le_bytes(bx_block[..8].try_into().unwrap()) as usize;
        let mut corrupted = bx_block[..sids_offset - 5].to_vec();
        let new_offset = corrupted.len() as u64;
        corrupted.extend_from_slice(&bx_block[sids_offset..]);
        corrupted[..8].copy_from_slice(&new_offset.to_le_bytes());

        let err = converter().bx_block_to_block(&corrupted, &service).unwrap_err();
        assert!(matches!(err, GatewayError::MessageConversion { .. }));
    }

    #[test]
    fn test_bx_tx_to_tx_wraps_wire_message() {
        let tx = legacy_tx(13);
        let wire = converter().bx_tx_to_tx(&tx).unwrap();
        assert_eq!(&wire[4..6], b"tx");
        assert_eq!(&wire[BTC_HDR_COMMON_OFF..], &tx[..]);
    }

    #[test]
    fn test_bx_tx_to_tx_rejects_garbage() {
        assert!(converter().bx_tx_to_tx(&[0x01, 0x02]).is_err());
    }
}
