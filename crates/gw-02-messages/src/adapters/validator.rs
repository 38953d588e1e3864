//! Pre-dispatch message size validation.

use crate::domain::message_type::BxMessageType;
use shared_types::GatewayError;

/// Per-network size limits applied before a frame is buffered in full.
#[derive(Clone, Copy, Debug)]
pub struct BxMessageValidator {
    /// Largest accepted block payload.
    pub max_block_size_bytes: usize,
    /// Largest accepted transaction payload.
    pub max_tx_size_bytes: usize,
}

/// Headroom for non-blob fields in block and transaction payloads.
const ENVELOPE_OVERHEAD: usize = 1024;

/// Upper bound for control-plane messages that never carry blobs.
const CONTROL_MESSAGE_MAX: usize = 64 * 1024;

impl Default for BxMessageValidator {
    fn default() -> Self {
        Self {
            max_block_size_bytes: 32 * 1024 * 1024,
            max_tx_size_bytes: 1024 * 1024,
        }
    }
}

impl BxMessageValidator {
    /// Rejects frames whose declared payload length exceeds the limit for
    /// their message type. Unknown types get the control-plane limit.
    pub fn validate(
        &self,
        msg_type: Option<BxMessageType>,
        payload_len: usize,
    ) -> Result<(), GatewayError> {
        let limit = match msg_type {
            Some(BxMessageType::Broadcast) => self.max_block_size_bytes + ENVELOPE_OVERHEAD,
            Some(BxMessageType::Transaction) => self.max_tx_size_bytes + ENVELOPE_OVERHEAD,
            Some(
                BxMessageType::Transactions
                | BxMessageType::TxServiceSyncTxs
                | BxMessageType::BlockConfirmation
                | BxMessageType::TransactionCleanup,
            ) => self.max_block_size_bytes + ENVELOPE_OVERHEAD,
            _ => CONTROL_MESSAGE_MAX,
        };
        if payload_len > limit {
            return Err(GatewayError::ProtocolViolation(format!(
                "payload of {payload_len} bytes exceeds limit of {limit}"
            )));
        }
        Ok(())
    }
}
