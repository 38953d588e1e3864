//! Neutrality service: encrypted propagation with receipt-gated key release.
//!
//! Outbound blocks leave encrypted; the key follows only after enough
//! gateways acknowledge the ciphertext, so no single relay can withhold a
//! block it can read. If receipts never arrive, the timeout releases the key
//! anyway so the gateway cannot censor its own block.

use crate::domain::config::{NeutralityPolicy, PipelineConfig, NEUTRALITY_BROADCAST_BLOCK_TIMEOUT_S};
use crate::ports::GatewayContext;
use crate::domain::in_progress::{encrypt_block, BLOCK_KEY_LEN};
use gw_02_messages::converter::BlockInfo;
use gw_02_messages::BxMessage;
use shared_types::{double_sha256, AlarmAction, AlarmId, ConnectionId, ConnectionRole, Sha256Hash};
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tracing::{debug, info, warn};

struct ReceiptTracking {
    key: [u8; BLOCK_KEY_LEN],
    receipts: HashSet<ConnectionId>,
    broadcast_recipients: usize,
    timeout_alarm: AlarmId,
}

/// Tracks encrypted broadcasts awaiting receipts.
pub struct NeutralityService {
    network_num: u32,
    policy: NeutralityPolicy,
    expected_receipt_count: usize,
    expected_receipt_percent: f64,
    tracking: HashMap<Sha256Hash, ReceiptTracking>,
}

impl NeutralityService {
    /// Creates the service from pipeline configuration.
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            network_num: config.network_num,
            policy: config.neutrality_policy,
            expected_receipt_count: config.neutrality_expected_receipt_count,
            expected_receipt_percent: config.neutrality_expected_receipt_percent,
            tracking: HashMap::new(),
        }
    }

    /// Number of broadcasts awaiting receipts.
    pub fn awaiting_receipts(&self) -> usize {
        self.tracking.len()
    }

    /// Encrypts and broadcasts a compressed block, retaining the key until
    /// the receipt policy is satisfied.
    pub fn propagate_block_to_network(
        &mut self,
        bx_block: Vec<u8>,
        block_info: &BlockInfo,
        ctx: &mut dyn GatewayContext,
    ) {
        if self.policy == NeutralityPolicy::ReleaseImmediately {
            let (ciphertext, key) = encrypt_block(&bx_block);
            let ciphertext_hash = double_sha256(&ciphertext);
            self.broadcast_ciphertext(ciphertext_hash, ciphertext, ctx);
            self.broadcast_key(ciphertext_hash, &key, ctx);
            info!(block_hash = %block_info.block_hash, "block and key released immediately");
            return;
        }

        let (ciphertext, key) = encrypt_block(&bx_block);
        let ciphertext_hash = double_sha256(&ciphertext);
        let recipients = self.broadcast_ciphertext(ciphertext_hash, ciphertext, ctx);
        let timeout_alarm = ctx.schedule(
            Duration::from_secs(NEUTRALITY_BROADCAST_BLOCK_TIMEOUT_S),
            AlarmAction::NeutralityTimeout(ciphertext_hash),
        );
        self.tracking.insert(
            ciphertext_hash,
            ReceiptTracking {
                key,
                receipts: HashSet::new(),
                broadcast_recipients: recipients,
                timeout_alarm,
            },
        );
        info!(
            block_hash = %block_info.block_hash,
            %ciphertext_hash,
            recipients,
            "encrypted block broadcast, awaiting receipts"
        );
    }

    /// Records a `BlockReceived` receipt; releases the key once the policy
    /// is satisfied.
    pub fn record_block_receipt(
        &mut self,
        ciphertext_hash: &Sha256Hash,
        conn: ConnectionId,
        ctx: &mut dyn GatewayContext,
    ) {
        let Some(tracking) = self.tracking.get_mut(ciphertext_hash) else {
            debug!(%ciphertext_hash, "receipt for unknown broadcast");
            return;
        };
        tracking.receipts.insert(conn);
        debug!(
            %ciphertext_hash,
            receipts = tracking.receipts.len(),
            "block receipt recorded"
        );
        if Self::policy_satisfied(
            self.policy,
            self.expected_receipt_count,
            self.expected_receipt_percent,
            tracking.receipts.len(),
            tracking.broadcast_recipients,
        ) {
            let tracking = self
                .tracking
                .remove(ciphertext_hash)
                .expect("entry fetched above");
            ctx.cancel(tracking.timeout_alarm);
            self.broadcast_key(*ciphertext_hash, &tracking.key, ctx);
            info!(%ciphertext_hash, "receipt policy satisfied, key released");
        }
    }

    /// Timeout alarm: release the key anyway rather than risk withholding
    /// the block.
    pub fn on_timeout(&mut self, ciphertext_hash: &Sha256Hash, ctx: &mut dyn GatewayContext) {
        if let Some(tracking) = self.tracking.remove(ciphertext_hash) {
            warn!(
                %ciphertext_hash,
                receipts = tracking.receipts.len(),
                "receipts never satisfied policy, releasing key on timeout"
            );
            self.broadcast_key(*ciphertext_hash, &tracking.key, ctx);
        }
    }

    fn broadcast_ciphertext(
        &self,
        ciphertext_hash: Sha256Hash,
        ciphertext: Vec<u8>,
        ctx: &mut dyn GatewayContext,
    ) -> usize {
        ctx.broadcast(
            &BxMessage::Broadcast {
                block_hash: ciphertext_hash,
                network_num: self.network_num,
                is_encrypted: true,
                blob: ciphertext,
            },
            None,
            ConnectionRole::RELAY_BLOCK | ConnectionRole::GATEWAY,
            false,
        )
    }

    fn broadcast_key(
        &self,
        ciphertext_hash: Sha256Hash,
        key: &[u8; BLOCK_KEY_LEN],
        ctx: &mut dyn GatewayContext,
    ) {
        ctx.broadcast(
            &BxMessage::Key {
                block_hash: ciphertext_hash,
                network_num: self.network_num,
                key: *key,
            },
            None,
            ConnectionRole::RELAY_BLOCK | ConnectionRole::GATEWAY,
            false,
        );
    }

    fn policy_satisfied(
        policy: NeutralityPolicy,
        expected_count: usize,
        expected_percent: f64,
        receipts: usize,
        recipients: usize,
    ) -> bool {
        let count_ok = receipts >= expected_count;
        let percent_ok = if recipients == 0 {
            true
        } else {
            (receipts as f64) * 100.0 / (recipients as f64) >= expected_percent
        };
        match policy {
            NeutralityPolicy::ReceiptCount => count_ok,
            NeutralityPolicy::ReceiptPercent => percent_ok,
            NeutralityPolicy::ReceiptCountAndPercent => count_ok && percent_ok,
            NeutralityPolicy::ReleaseImmediately => true,
        }
    }
}
