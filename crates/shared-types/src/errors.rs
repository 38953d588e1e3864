//! Gateway-wide error kinds.
//!
//! Per-message handlers convert these to logs and counters at the dispatch
//! boundary; only configuration errors abort the process.

use crate::entities::{Sha256Hash, ShortId};
use thiserror::Error;

/// Shared error taxonomy for the propagation pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GatewayError {
    /// Malformed framing, unknown control flag, or size overflow.
    /// The offending connection is closed and not retried.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// Block compression or decompression failed; the block is dropped and
    /// any recovery state for it is evicted.
    #[error("message conversion failed for block {block_hash}: {reason}")]
    MessageConversion {
        block_hash: Sha256Hash,
        reason: String,
    },

    /// A short id arrived already bound to a different hash. The newer
    /// binding wins; the anomaly is logged at ERROR.
    #[error("short id {short_id} already bound to {existing}")]
    SidConflict {
        short_id: ShortId,
        existing: Sha256Hash,
    },

    /// Ciphertext and key did not match; both are discarded.
    #[error("decryption failed for block {0}")]
    Decryption(Sha256Hash),

    /// Retry budget or recovery timeout exceeded; the block is discarded.
    #[error("recovery exhausted for block {0}")]
    RecoveryExhausted(Sha256Hash),

    /// Handshake not yet complete; transient, retried on the next poll.
    #[error("cipher not initialized")]
    CipherNotInitialized,

    /// Handshake, discovery, or liveness timer expired.
    #[error("{0} timed out")]
    Timeout(String),

    /// Socket-level failure; the connection is closed and reconnected with
    /// backoff.
    #[error("i/o failure: {0}")]
    Io(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_carries_block_hash() {
        let err = GatewayError::MessageConversion {
            block_hash: Sha256Hash::new([0xAB; 32]),
            reason: "short id index out of range".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("abab"));
        assert!(msg.contains("short id index"));
    }

    #[test]
    fn test_timeout_display() {
        let err = GatewayError::Timeout("handshake".into());
        assert_eq!(err.to_string(), "handshake timed out");
    }
}
