//! BIP-152 compact block handling.
//!
//! A compact block carries 6-byte siphash short ids instead of transactions.
//! The gateway matches them against its transaction cache, asks the node for
//! whatever is missing (`getblocktxn`), and once complete rebuilds the full
//! block message with a fresh checksum and re-enters normal compression.

use crate::domain::converter::BtcBlockConverter;
use crate::adapters::messages::{build_block_message, BtcCompactBlockMessage};
use gw_01_tx_service::TransactionService;
use gw_02_messages::converter::{BlockConverter, BlockInfo};
use shared_types::{sha256, GatewayError, Sha256Hash};
use siphasher::sip::SipHasher24;
use std::collections::HashMap;
use std::hash::Hasher;
use tracing::debug;

/// Derives the BIP-152 siphash key from a block header and nonce.
pub fn short_id_key(block_header: &[u8], nonce: u64) -> [u8; 16] {
    let mut data = Vec::with_capacity(block_header.len() + 8);
    data.extend_from_slice(block_header);
    data.extend_from_slice(&nonce.to_le_bytes());
    let digest = sha256(&data);
    digest[..16].try_into().expect("16-byte window")
}

/// Computes a 6-byte compact-block short id for a transaction hash.
///
/// The hash is byte-reversed before hashing to match the display-order
/// convention compact blocks are built with.
pub fn compute_short_id(key: &[u8; 16], tx_hash: &Sha256Hash) -> [u8; 6] {
    let k0 = u64::from_le_bytes(key[..8].try_into().expect("8-byte window"));
    let k1 = u64::from_le_bytes(key[8..].try_into().expect("8-byte window"));
    let mut hasher = SipHasher24::new_with_keys(k0, k1);
    hasher.write(&tx_hash.reversed());
    let full = hasher.finish();
    full.to_le_bytes()[..6].try_into().expect("6-byte window")
}

/// Outcome of a compact-block conversion attempt.
#[derive(Clone, Debug)]
pub enum CompactConversionResult {
    /// All transactions resolved; the block was rebuilt and compressed.
    Complete {
        bx_block: Vec<u8>,
        block_info: BlockInfo,
    },
    /// Some transactions are unknown; request them by index and retry with
    /// the ticket.
    MissingTransactions {
        block_hash: Sha256Hash,
        recovery_ticket: u64,
        missing_indices: Vec<usize>,
    },
}

struct CompactRecoveryData {
    block_header: Vec<u8>,
    block_transactions: Vec<Option<Vec<u8>>>,
    missing_indices: Vec<usize>,
}

/// Stateful compact-block converter; one per blockchain connection.
pub struct CompactBlockConverter {
    magic: u32,
    next_ticket: u64,
    pending: HashMap<u64, CompactRecoveryData>,
}

impl CompactBlockConverter {
    /// Creates a converter for the given network magic.
    pub fn new(magic: u32) -> Self {
        Self {
            magic,
            next_ticket: 0,
            pending: HashMap::new(),
        }
    }

    /// Number of compact blocks parked awaiting recovered transactions.
    pub fn pending_recoveries(&self) -> usize {
        self.pending.len()
    }

    /// Attempts to rebuild a full block from a compact block and the
    /// transaction cache.
    pub fn compact_block_to_bx_block(
        &mut self,
        compact: &BtcCompactBlockMessage,
        tx_service: &TransactionService,
    ) -> Result<CompactConversionResult, GatewayError> {
        let block_hash = compact.block_hash();
        let key = short_id_key(&compact.header, compact.nonce);

        // Match cached transactions against the compact block's short ids.
        let wanted: HashMap<[u8; 6], usize> = compact
            .short_ids
            .iter()
            .enumerate()
            .map(|(i, id)| (*id, i))
            .collect();
        let mut found: HashMap<[u8; 6], Vec<u8>> = HashMap::new();
        for tx_hash in tx_service.transaction_hashes() {
            let short_id = compute_short_id(&key, &tx_hash);
            if wanted.contains_key(&short_id) {
                match tx_service.get_transaction_by_hash(&tx_hash) {
                    Some(contents) => {
                        found.insert(short_id, contents.to_vec());
                    }
                    None => {
                        debug!(%tx_hash, "hash matches compact short id but contents missing");
                    }
                }
            }
            if found.len() == compact.short_ids.len() {
                break;
            }
        }

        let prefilled: HashMap<usize, &Vec<u8>> =
            compact.prefilled.iter().map(|(i, tx)| (*i, tx)).collect();
        let total_txs = compact.prefilled.len() + compact.short_ids.len();

        let mut block_transactions: Vec<Option<Vec<u8>>> = Vec::with_capacity(total_txs);
        let mut missing_indices = Vec::new();
        let mut short_ids_iter = compact.short_ids.iter();
        for index in 0..total_txs {
            if let Some(tx) = prefilled.get(&index) {
                block_transactions.push(Some((*tx).clone()));
                continue;
            }
            let short_id = short_ids_iter.next().ok_or_else(|| {
                GatewayError::ProtocolViolation("compact block short id underrun".into())
            })?;
            match found.get(short_id) {
                Some(contents) => block_transactions.push(Some(contents.clone())),
                None => {
                    missing_indices.push(index);
                    block_transactions.push(None);
                }
            }
        }

        if missing_indices.is_empty() {
            return self.finish(compact.header.clone(), block_transactions, tx_service);
        }

        debug!(
            %block_hash,
            missing = missing_indices.len(),
            total = total_txs,
            "compact block requires transaction recovery"
        );
        let ticket = self.next_ticket;
        self.next_ticket += 1;
        self.pending.insert(
            ticket,
            CompactRecoveryData {
                block_header: compact.header.clone(),
                block_transactions,
                missing_indices: missing_indices.clone(),
            },
        );
        Ok(CompactConversionResult::MissingTransactions {
            block_hash,
            recovery_ticket: ticket,
            missing_indices,
        })
    }

    /// Completes a parked compact block once the node has supplied the
    /// missing transactions (in missing-index order).
    pub fn recovered_compact_block_to_bx_block(
        &mut self,
        recovery_ticket: u64,
        recovered_transactions: Vec<Vec<u8>>,
        tx_service: &TransactionService,
    ) -> Result<CompactConversionResult, GatewayError> {
        let mut data = self.pending.remove(&recovery_ticket).ok_or_else(|| {
            GatewayError::ProtocolViolation(format!("unknown recovery ticket {recovery_ticket}"))
        })?;
        if data.missing_indices.len() != recovered_transactions.len() {
            return Err(GatewayError::ProtocolViolation(format!(
                "expected {} recovered transactions, got {}",
                data.missing_indices.len(),
                recovered_transactions.len()
            )));
        }
        for (index, tx) in data.missing_indices.iter().zip(recovered_transactions) {
            data.block_transactions[*index] = Some(tx);
        }
        self.finish(data.block_header, data.block_transactions, tx_service)
    }

    /// Drops any parked recovery whose block hash matches `block_hash`.
    pub fn cancel_recovery_for_block(&mut self, block_hash: &Sha256Hash) {
        self.pending
            .retain(|_, data| &shared_types::double_sha256(&data.block_header) != block_hash);
    }

    fn finish(
        &self,
        block_header: Vec<u8>,
        block_transactions: Vec<Option<Vec<u8>>>,
        tx_service: &TransactionService,
    ) -> Result<CompactConversionResult, GatewayError> {
        let txns: Vec<Vec<u8>> = block_transactions
            .into_iter()
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| {
                GatewayError::ProtocolViolation("compact block still has holes".into())
            })?;
        let block_msg = build_block_message(self.magic, &block_header, &txns);
        let (bx_block, block_info) =
            BtcBlockConverter::new(self.magic).block_to_bx_block(&block_msg, tx_service)?;
        Ok(CompactConversionResult::Complete {
            bx_block,
            block_info,
        })
    }
}
