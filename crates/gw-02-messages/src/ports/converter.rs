//! The block converter contract implemented by each chain module.

use gw_01_tx_service::TransactionService;
use shared_types::{GatewayError, Sha256Hash, ShortId};
use std::time::{Duration, Instant};

/// Byte standing in for a short-id-substituted transaction in a bx-block
/// body.
///
/// No real transaction starts with this byte: a Bitcoin transaction opens
/// with its version's low byte and an Ethereum body item with an RLP list
/// prefix, neither of which reaches 0xFF in practice. Compression still
/// guards against the collision and fails the block rather than corrupt it.
pub const SHORT_ID_INDICATOR: u8 = 0xFF;

/// Record of one compression or decompression pass, used for logging and the
/// short-id bookkeeping that follows a conversion.
#[derive(Clone, Debug)]
pub struct BlockInfo {
    /// Native block hash.
    pub block_hash: Sha256Hash,
    /// Short ids substituted into (or resolved out of) the block body.
    pub short_ids: Vec<ShortId>,
    /// Hash of the previous block, when the native format carries it.
    pub prev_block_hash: Option<Sha256Hash>,
    /// Hash of the compressed bytes (`dsha256`).
    pub compressed_block_hash: Option<Sha256Hash>,
    /// Transactions in the block.
    pub txn_count: usize,
    /// Native size in bytes.
    pub original_size: usize,
    /// Compressed size in bytes.
    pub compressed_size: usize,
    /// Conversion start time.
    pub start: Instant,
    /// Conversion duration.
    pub duration: Duration,
}

impl BlockInfo {
    /// Percentage saved by compression; negative when substitution lost to
    /// overhead.
    pub fn compression_rate(&self) -> f64 {
        if self.original_size == 0 {
            return 0.0;
        }
        100.0 - (self.compressed_size as f64) / (self.original_size as f64) * 100.0
    }
}

/// Outcome of decompressing a bx-block.
#[derive(Clone, Debug)]
pub struct BlockConversionResult {
    /// The rebuilt native block message, or `None` when recovery is needed.
    pub block: Option<Vec<u8>>,
    /// Conversion record.
    pub block_info: BlockInfo,
    /// Short ids with no known hash.
    pub unknown_sids: Vec<ShortId>,
    /// Hashes known for their short id but with no contents.
    pub unknown_hashes: Vec<Sha256Hash>,
}

impl BlockConversionResult {
    /// True if the converter could not finish without recovery.
    pub fn needs_recovery(&self) -> bool {
        self.block.is_none()
    }
}

/// Chain-specific block and transaction conversion.
///
/// Implementations translate between native wire messages and the overlay's
/// short-id-compressed form. The pipeline depends only on this contract.
pub trait BlockConverter: Send + Sync {
    /// Compresses a native block message into a bx-block.
    fn block_to_bx_block(
        &self,
        block_msg: &[u8],
        tx_service: &TransactionService,
    ) -> Result<(Vec<u8>, BlockInfo), GatewayError>;

    /// Decompresses a bx-block back into a native block message, reporting
    /// unresolved short ids and hashes instead of failing when the cache is
    /// incomplete.
    fn bx_block_to_block(
        &self,
        bx_block: &[u8],
        tx_service: &TransactionService,
    ) -> Result<BlockConversionResult, GatewayError>;

    /// Wraps overlay transaction contents into the native wire message the
    /// blockchain node expects.
    fn bx_tx_to_tx(&self, contents: &[u8]) -> Result<Vec<u8>, GatewayError>;
}
