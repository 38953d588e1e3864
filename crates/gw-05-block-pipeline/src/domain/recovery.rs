//! Block recovery bookkeeping.
//!
//! A block that decompressed with unknown short ids or missing contents
//! parks here while the gateway queries relay-tx peers. Every newly learned
//! short id and transaction hash is checked against the open records; a
//! record whose unknown sets drain empty moves to the recovered list for
//! re-decompression. The unknown sets only ever shrink.

use gw_01_tx_service::TransactionService;
use shared_types::{Sha256Hash, ShortId};
use std::collections::{BTreeSet, HashMap};
use std::time::Instant;
use tracing::debug;

/// One block awaiting recovery, as handed to the retry scheduler.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockAwaitingRecovery {
    pub block_hash: Sha256Hash,
    pub unknown_short_ids: Vec<ShortId>,
    pub unknown_transaction_hashes: Vec<Sha256Hash>,
    pub recovery_start: Instant,
}

struct RecoveryInfo {
    bx_block: Vec<u8>,
    unknown_short_ids: BTreeSet<ShortId>,
    unknown_transaction_hashes: BTreeSet<Sha256Hash>,
    recovery_start: Instant,
}

/// Tracks blocks whose decompression is blocked on unknown transactions.
#[derive(Default)]
pub struct BlockRecoveryService {
    by_block: HashMap<Sha256Hash, RecoveryInfo>,
    /// Retry attempts per block; consulted by the retry scheduler.
    pub recovery_attempts_by_block: HashMap<Sha256Hash, u32>,
    recovered_blocks: Vec<Vec<u8>>,
}

impl BlockRecoveryService {
    /// Creates an empty service.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of blocks awaiting recovery.
    pub fn awaiting_count(&self) -> usize {
        self.by_block.len()
    }

    /// True if `block_hash` has an open recovery record.
    pub fn is_in_recovery(&self, block_hash: &Sha256Hash) -> bool {
        self.by_block.contains_key(block_hash)
    }

    /// Opens (or refreshes) a recovery record. The unknown hashes are pinned
    /// in the transaction service so eviction cannot race the recovery.
    pub fn add_block(
        &mut self,
        bx_block: Vec<u8>,
        block_hash: Sha256Hash,
        unknown_short_ids: Vec<ShortId>,
        unknown_transaction_hashes: Vec<Sha256Hash>,
        now: Instant,
        tx_service: &mut TransactionService,
    ) {
        if self.by_block.contains_key(&block_hash) {
            debug!(%block_hash, "recovery already in progress");
            return;
        }
        for tx_hash in &unknown_transaction_hashes {
            tx_service.protect(*tx_hash);
        }
        self.by_block.insert(
            block_hash,
            RecoveryInfo {
                bx_block,
                unknown_short_ids: unknown_short_ids.into_iter().collect(),
                unknown_transaction_hashes: unknown_transaction_hashes.into_iter().collect(),
                recovery_start: now,
            },
        );
        self.recovery_attempts_by_block.entry(block_hash).or_insert(0);
    }

    /// Reports a newly learned short id. Returns true if it advanced at
    /// least one recovery record.
    pub fn check_missing_sid(&mut self, short_id: ShortId) -> bool {
        let mut advanced = false;
        let mut completed = Vec::new();
        for (block_hash, info) in &mut self.by_block {
            if info.unknown_short_ids.remove(&short_id) {
                advanced = true;
                if info.unknown_short_ids.is_empty()
                    && info.unknown_transaction_hashes.is_empty()
                {
                    completed.push(*block_hash);
                }
            }
        }
        self.promote_completed(completed);
        advanced
    }

    /// Reports newly learned transaction contents. Returns true if it
    /// advanced at least one recovery record.
    pub fn check_missing_tx_hash(&mut self, tx_hash: &Sha256Hash) -> bool {
        let mut advanced = false;
        let mut completed = Vec::new();
        for (block_hash, info) in &mut self.by_block {
            if info.unknown_transaction_hashes.remove(tx_hash) {
                advanced = true;
                if info.unknown_short_ids.is_empty()
                    && info.unknown_transaction_hashes.is_empty()
                {
                    completed.push(*block_hash);
                }
            }
        }
        self.promote_completed(completed);
        advanced
    }

    /// Blocks still awaiting recovery, for retry scheduling.
    pub fn get_blocks_awaiting_recovery(&self) -> Vec<BlockAwaitingRecovery> {
        self.by_block
            .iter()
            .map(|(block_hash, info)| BlockAwaitingRecovery {
                block_hash: *block_hash,
                unknown_short_ids: info.unknown_short_ids.iter().copied().collect(),
                unknown_transaction_hashes: info
                    .unknown_transaction_hashes
                    .iter()
                    .copied()
                    .collect(),
                recovery_start: info.recovery_start,
            })
            .collect()
    }

    /// Drops the record for `block_hash`, releasing its pins. Returns true
    /// if a record existed.
    pub fn cancel_recovery_for_block(
        &mut self,
        block_hash: &Sha256Hash,
        tx_service: &mut TransactionService,
    ) -> bool {
        self.recovery_attempts_by_block.remove(block_hash);
        match self.by_block.remove(block_hash) {
            Some(info) => {
                for tx_hash in &info.unknown_transaction_hashes {
                    tx_service.unprotect(tx_hash);
                }
                true
            }
            None => false,
        }
    }

    /// Bx-blocks whose unknowns drained; ready for re-decompression.
    pub fn recovered_blocks(&self) -> &[Vec<u8>] {
        &self.recovered_blocks
    }

    /// Clears the recovered list after a retry pass.
    pub fn clean_up_recovered_blocks(&mut self) {
        self.recovered_blocks.clear();
    }

    fn promote_completed(&mut self, completed: Vec<Sha256Hash>) {
        for block_hash in completed {
            if let Some(info) = self.by_block.remove(&block_hash) {
                debug!(%block_hash, "recovery complete, queuing for re-decompression");
                self.recovered_blocks.push(info.bx_block);
            }
        }
    }
}
