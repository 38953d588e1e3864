//! Ethereum block ↔ bx-block conversion.
//!
//! Operates on the normalized internal payload
//! (`rlp([header, [tx…], uncles, total_difficulty])`). The header, uncles,
//! and total-difficulty items travel verbatim at the front of the bx-block;
//! each transaction item is either carried raw or replaced by the short-id
//! indicator byte.

use gw_01_tx_service::TransactionService;
use gw_02_messages::converter::{
    BlockConversionResult, BlockConverter, BlockInfo, SHORT_ID_INDICATOR,
};
use gw_02_messages::short_ids::{
    block_offsets, deserialize_short_ids, serialize_short_ids, BLOCK_OFFSETS_LEN,
};
use shared_types::{double_sha256, GatewayError, Sha256Hash, ShortId, NULL_SHORT_ID};
use std::time::Instant;
use tracing::{debug, warn};

use crate::domain::block::InternalEthBlock;
use crate::transport::crypto_utils::keccak256;
use crate::domain::messages::EthMessage;
use crate::domain::rlp_utils::rlp_item_len;

/// Converter between internal Ethereum block payloads and bx-blocks.
#[derive(Clone, Copy, Debug, Default)]
pub struct EthBlockConverter;

impl EthBlockConverter {
    fn conversion_error(block_hash: Sha256Hash, reason: impl Into<String>) -> GatewayError {
        GatewayError::MessageConversion {
            block_hash,
            reason: reason.into(),
        }
    }
}

impl BlockConverter for EthBlockConverter {
    fn block_to_bx_block(
        &self,
        block_msg: &[u8],
        tx_service: &TransactionService,
    ) -> Result<(Vec<u8>, BlockInfo), GatewayError> {
        let start = Instant::now();
        let block = InternalEthBlock::decode_payload(block_msg)?;
        let block_hash = block.block_hash();

        // Header section: header, uncles, and total difficulty verbatim.
        let mut header_section =
            Vec::with_capacity(block.header.len() + block.uncles.len() + 16);
        header_section.extend_from_slice(&block.header);
        header_section.extend_from_slice(&block.uncles);
        header_section.extend_from_slice(&rlp::encode(&block.total_difficulty));

        let mut body = Vec::new();
        let mut short_ids: Vec<ShortId> = Vec::new();
        for tx in &block.transactions {
            let tx_hash = Sha256Hash::new(keccak256(tx));
            let short_id = tx_service.get_short_id(&tx_hash);
            if short_id == NULL_SHORT_ID {
                if tx.first() == Some(&SHORT_ID_INDICATOR) {
                    return Err(Self::conversion_error(
                        block_hash,
                        "transaction item collides with short id indicator",
                    ));
                }
                body.extend_from_slice(tx);
            } else {
                short_ids.push(short_id);
                body.push(SHORT_ID_INDICATOR);
            }
        }

        let serialized_sids = serialize_short_ids(&short_ids);
        let sids_offset = (BLOCK_OFFSETS_LEN + header_section.len() + body.len()) as u64;
        let mut bx_block = Vec::with_capacity(
            BLOCK_OFFSETS_LEN + header_section.len() + body.len() + serialized_sids.len(),
        );
        bx_block.extend_from_slice(&sids_offset.to_le_bytes());
        bx_block.extend_from_slice(&header_section);
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
            prev_block_hash: block.prev_block_hash().ok(),
            compressed_block_hash: Some(double_sha256(&bx_block)),
            txn_count: block.transactions.len(),
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
        let section = &bx_block[..offsets.short_id_offset];

        // Header section: header item, uncles item, total difficulty item.
        let mut pos = offsets.block_begin_offset;
        let header_len = rlp_item_len(section, pos)?;
        let header = section[pos..pos + header_len].to_vec();
        pos += header_len;
        let uncles_len = rlp_item_len(section, pos)?;
        let uncles = section[pos..pos + uncles_len].to_vec();
        pos += uncles_len;
        let td_len = rlp_item_len(section, pos)?;
        let total_difficulty: u128 = rlp::Rlp::new(&section[pos..pos + td_len])
            .as_val()
            .map_err(|_| GatewayError::ProtocolViolation("bx-block total difficulty".into()))?;
        pos += td_len;

        let block_hash = Sha256Hash::new(keccak256(&header));
        let prev_block_hash = rlp::Rlp::new(&header)
            .val_at::<Vec<u8>>(0)
            .ok()
            .and_then(|bytes| Sha256Hash::from_slice(&bytes));

        let build_info = |short_ids: Vec<ShortId>,
                          compressed_hash: Option<Sha256Hash>,
                          txn_count: usize,
                          original_size: usize| BlockInfo {
            block_hash,
            prev_block_hash,
            compressed_block_hash: compressed_hash,
            txn_count,
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
                "block recovery needed"
            );
            return Ok(BlockConversionResult {
                block: None,
                block_info: build_info(short_ids, None, 0, 0),
                unknown_sids: missing.sids,
                unknown_hashes: missing.hashes,
            });
        }

        let mut transactions = Vec::new();
        let mut short_tx_index = 0usize;
        while pos < offsets.short_id_offset {
            if section[pos] == SHORT_ID_INDICATOR {
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
                transactions.push(contents.to_vec());
                pos += 1;
                short_tx_index += 1;
            } else {
                let tx_len = rlp_item_len(section, pos).map_err(|_| {
                    Self::conversion_error(block_hash, "transaction walks past end of body")
                })?;
                transactions.push(section[pos..pos + tx_len].to_vec());
                pos += tx_len;
            }
        }

        let txn_count = transactions.len();
        let block = InternalEthBlock {
            header,
            transactions,
            uncles,
            total_difficulty,
        };
        let payload = block.encode_payload();
        debug!(%block_hash, txs = txn_count, "decompressed block");
        let original_size = payload.len();
        Ok(BlockConversionResult {
            block: Some(payload),
            block_info: build_info(
                short_ids,
                Some(double_sha256(bx_block)),
                txn_count,
                original_size,
            ),
            unknown_sids: Vec::new(),
            unknown_hashes: Vec::new(),
        })
    }

    fn bx_tx_to_tx(&self, contents: &[u8]) -> Result<Vec<u8>, GatewayError> {
        // Validate the item boundary before forwarding.
        let item_len = rlp_item_len(contents, 0)?;
        if item_len != contents.len() {
            return Err(GatewayError::ProtocolViolation(
                "transaction item length mismatch".into(),
            ));
        }
        Ok(EthMessage::Transactions(vec![contents.to_vec()]).to_frame_content())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::block::build_header;
    use rlp::RlpStream;

    fn sample_payload(tx_count: usize) -> (Vec<u8>, Vec<Vec<u8>>) {
        let transactions: Vec<Vec<u8>> = (0..tx_count)
            .map(|i| rlp::encode(&vec![i as u8 + 1; 50 + i]).to_vec())
            .collect();
        let block = InternalEthBlock {
            header: build_header(&Sha256Hash::new([3; 32]), 500, 10),
            transactions: transactions.clone(),
            uncles: {
                let stream = RlpStream::new_list(0);
                stream.out().to_vec()
            },
            total_difficulty: 12_345,
        };
        (block.encode_payload(), transactions)
    }

    fn tx_hash(tx: &[u8]) -> Sha256Hash {
        Sha256Hash::new(keccak256(tx))
    }

    #[test]
    fn test_round_trip_no_known_sids() {
        let (payload, _) = sample_payload(3);
        let service = TransactionService::with_defaults();
        let converter = EthBlockConverter;

        let (bx_block, info) = converter.block_to_bx_block(&payload, &service).unwrap();
        assert!(info.short_ids.is_empty());
        let result = converter.bx_block_to_block(&bx_block, &service).unwrap();
        assert_eq!(result.block.as_deref(), Some(&payload[..]));
        assert_eq!(result.block_info.txn_count, 3);
    }

    #[test]
    fn test_round_trip_with_substitution() {
        let (payload, transactions) = sample_payload(4);
        let mut service = TransactionService::with_defaults();
        for (i, tx) in transactions.iter().enumerate() {
            service
                .assign_short_id(tx_hash(tx), (i + 10) as ShortId)
                .unwrap();
            service.set_transaction_contents(tx_hash(tx), tx.clone());
        }
        let converter = EthBlockConverter;

        let (bx_block, info) = converter.block_to_bx_block(&payload, &service).unwrap();
        assert_eq!(info.short_ids, vec![10, 11, 12, 13]);
        assert!(bx_block.len() < payload.len());

        let result = converter.bx_block_to_block(&bx_block, &service).unwrap();
        assert_eq!(result.block.as_deref(), Some(&payload[..]));
    }

    #[test]
    fn test_unknown_sid_reports_recovery() {
        let (payload, transactions) = sample_payload(2);
        let mut compressing = TransactionService::with_defaults();
        for (i, tx) in transactions.iter().enumerate() {
            compressing
                .assign_short_id(tx_hash(tx), (i + 1) as ShortId)
                .unwrap();
            compressing.set_transaction_contents(tx_hash(tx), tx.clone());
        }
        let converter = EthBlockConverter;
        let (bx_block, _) = converter.block_to_bx_block(&payload, &compressing).unwrap();

        let empty = TransactionService::with_defaults();
        let result = converter.bx_block_to_block(&bx_block, &empty).unwrap();
        assert!(result.needs_recovery());
        assert_eq!(result.unknown_sids, vec![1, 2]);

        // After learning the transactions, decompression completes.
        let mut recovering = empty;
        for (i, tx) in transactions.iter().enumerate() {
            recovering
                .assign_short_id(tx_hash(tx), (i + 1) as ShortId)
                .unwrap();
            recovering.set_transaction_contents(tx_hash(tx), tx.clone());
        }
        let second = converter.bx_block_to_block(&bx_block, &recovering).unwrap();
        assert_eq!(second.block.as_deref(), Some(&payload[..]));
    }

    #[test]
    fn test_total_difficulty_survives_round_trip() {
        let (payload, _) = sample_payload(1);
        let service = TransactionService::with_defaults();
        let converter = EthBlockConverter;
        let (bx_block, _) = converter.block_to_bx_block(&payload, &service).unwrap();
        let result = converter.bx_block_to_block(&bx_block, &service).unwrap();
        let block = InternalEthBlock::decode_payload(&result.block.unwrap()).unwrap();
        assert_eq!(block.total_difficulty, 12_345);
    }

    #[test]
    fn test_bx_tx_to_tx_produces_transactions_frame() {
        let tx = rlp::encode(&vec![0x99u8; 20]).to_vec();
        let content = EthBlockConverter.bx_tx_to_tx(&tx).unwrap();
        // Frame content opens with the transactions message id.
        assert_eq!(content[0], crate::domain::messages::message_id::TRANSACTIONS as u8);
    }

    #[test]
    fn test_bx_tx_to_tx_rejects_trailing_bytes() {
        let mut tx = rlp::encode(&vec![0x99u8; 20]).to_vec();
        tx.push(0x00);
        assert!(EthBlockConverter.bx_tx_to_tx(&tx).is_err());
    }
}
