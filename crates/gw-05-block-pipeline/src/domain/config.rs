//! Pipeline configuration and timing constants.

use std::time::Duration;

/// Backoff schedule for block recovery retries.
pub const BLOCK_RECOVERY_RECOVERY_INTERVAL_S: [f64; 5] = [0.1, 0.5, 1.0, 2.0, 5.0];

/// Retry budget; one attempt per interval.
pub const BLOCK_RECOVERY_MAX_RETRY_ATTEMPTS: u32 = BLOCK_RECOVERY_RECOVERY_INTERVAL_S.len() as u32;

/// How long seen blocks are remembered.
pub const GATEWAY_BLOCKS_SEEN_EXPIRATION_TIME_S: u64 = 60 * 60 * 24;

/// Expiry of unpaired ciphertext/key entries.
pub const BLOCK_HANDLING_TIME_EXPIRATION_TIME_S: u64 = 300;

/// Minimum spacing of block deliveries to the blockchain node.
pub const MAX_INTERVAL_BETWEEN_BLOCKS_S: f64 = 0.1;

/// Re-check cadence after the node reported itself not ready for a block.
pub const NODE_READINESS_FOR_BLOCKS_CHECK_INTERVAL_S: u64 = 5;

/// Grace period before a compressed block's short ids count as seen.
pub const TRACK_SEEN_SHORT_IDS_DELAY_S: u64 = 60;

/// How long to wait for block receipts before giving up and releasing the
/// key anyway.
pub const NEUTRALITY_BROADCAST_BLOCK_TIMEOUT_S: u64 = 30 * 60;

/// Interval between protocol pings to the blockchain node.
pub const BLOCKCHAIN_PING_INTERVAL_S: u64 = 15;

/// Cadence of the periodic stats log line.
pub const GATEWAY_TRANSACTION_STATS_INTERVAL_S: u64 = 60;

/// Policy deciding when an encrypted block's key is released.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NeutralityPolicy {
    /// Release after a fixed number of receipts.
    ReceiptCount,
    /// Release after a percentage of broadcast recipients confirmed.
    ReceiptPercent,
    /// Release only when both thresholds are met.
    ReceiptCountAndPercent,
    /// Release the key together with the ciphertext.
    ReleaseImmediately,
}

/// Tunable pipeline parameters.
#[derive(Clone, Debug)]
pub struct PipelineConfig {
    /// Overlay network number stamped into outbound messages.
    pub network_num: u32,
    /// How long to sit on a held block before propagating it anyway.
    pub blockchain_block_hold_timeout: Duration,
    /// Overall deadline for a block recovery.
    pub blockchain_block_recovery_timeout: Duration,
    /// Key release policy.
    pub neutrality_policy: NeutralityPolicy,
    /// Receipts required by the count policies.
    pub neutrality_expected_receipt_count: usize,
    /// Receipt percentage required by the percent policies.
    pub neutrality_expected_receipt_percent: f64,
    /// Write each compressed block's sid→hash mapping to disk.
    pub dump_short_id_mapping: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            network_num: 1,
            blockchain_block_hold_timeout: Duration::from_millis(500),
            blockchain_block_recovery_timeout: Duration::from_secs(15),
            neutrality_policy: NeutralityPolicy::ReceiptPercent,
            neutrality_expected_receipt_count: 1,
            neutrality_expected_receipt_percent: 50.0,
            dump_short_id_mapping: false,
        }
    }
}
