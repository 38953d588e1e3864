//! Block processing orchestration.
//!
//! [`BlockPipeline`] owns every pipeline service and drives the block
//! lifecycle: the cooperative hold protocol for blocks arriving from the
//! blockchain node, pairing and decryption of encrypted broadcasts from the
//! BDN, decompression with recovery fallback, and delivery through the
//! queuing service.

use crate::domain::config::{
    PipelineConfig, BLOCK_HANDLING_TIME_EXPIRATION_TIME_S, BLOCK_RECOVERY_MAX_RETRY_ATTEMPTS,
    BLOCK_RECOVERY_RECOVERY_INTERVAL_S, GATEWAY_BLOCKS_SEEN_EXPIRATION_TIME_S,
    TRACK_SEEN_SHORT_IDS_DELAY_S,
};
use crate::ports::GatewayContext;
use crate::domain::in_progress::{InProgressBlocks, BLOCK_KEY_LEN};
use crate::domain::neutrality::NeutralityService;
use crate::domain::queuing::BlockQueuingService;
use crate::domain::recovery::{BlockAwaitingRecovery, BlockRecoveryService};
use crate::domain::stats::GatewayStats;
use gw_01_tx_service::{TransactionService, TxServiceConfig};
use gw_02_messages::converter::BlockConverter;
use gw_02_messages::BxMessage;
use shared_types::{
    double_sha256, AlarmAction, AlarmId, ConnectionId, ConnectionRole, ExpiringDict, ExpiringSet,
    GatewayError, Sha256Hash, ShortId, NULL_SHORT_ID,
};
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

/// Computes how long to sit on a held block. The default returns the
/// configured constant; a dynamic strategy can be plugged in here.
pub trait HoldTimeoutStrategy: Send {
    fn compute(&self, config: &PipelineConfig, block_msg: &[u8]) -> Duration;
}

/// The constant strategy.
pub struct ConstantHoldTimeout;

impl HoldTimeoutStrategy for ConstantHoldTimeout {
    fn compute(&self, config: &PipelineConfig, _block_msg: &[u8]) -> Duration {
        config.blockchain_block_hold_timeout
    }
}

/// A hold placed on a block hash.
struct BlockHold {
    hold_message_time: std::time::Instant,
    holding_connection: ConnectionId,
    block_message: Option<Vec<u8>>,
    alarm: Option<AlarmId>,
    held_connection: Option<ConnectionId>,
}

/// Owner of the block propagation pipeline.
pub struct BlockPipeline {
    pub config: PipelineConfig,
    pub tx_service: TransactionService,
    pub converter: Box<dyn BlockConverter>,
    pub recovery: BlockRecoveryService,
    pub queuing: BlockQueuingService,
    pub neutrality: NeutralityService,
    pub in_progress: InProgressBlocks,
    pub blocks_seen: ExpiringSet<Sha256Hash>,
    pub stats: GatewayStats,
    holds: ExpiringDict<Sha256Hash, BlockHold>,
    hold_strategy: Box<dyn HoldTimeoutStrategy>,
    cleanup_marks: std::collections::HashSet<Sha256Hash>,
}

impl BlockPipeline {
    /// Wires up the pipeline for one blockchain network.
    pub fn new(
        config: PipelineConfig,
        converter: Box<dyn BlockConverter>,
        tx_config: TxServiceConfig,
    ) -> Self {
        let neutrality = NeutralityService::new(&config);
        // Holds expire well after their alarm as a backstop against leaked
        // entries.
        let holds_ttl = config.blockchain_block_hold_timeout * 4 + Duration::from_secs(1);
        Self {
            neutrality,
            tx_service: TransactionService::new(tx_config),
            converter,
            recovery: BlockRecoveryService::new(),
            queuing: BlockQueuingService::new(),
            in_progress: InProgressBlocks::new(Duration::from_secs(
                BLOCK_HANDLING_TIME_EXPIRATION_TIME_S,
            )),
            blocks_seen: ExpiringSet::new(Duration::from_secs(
                GATEWAY_BLOCKS_SEEN_EXPIRATION_TIME_S,
            )),
            stats: GatewayStats::new(),
            holds: ExpiringDict::new(holds_ttl),
            hold_strategy: Box::new(ConstantHoldTimeout),
            cleanup_marks: std::collections::HashSet::new(),
            config,
        }
    }

    /// Marks a block so its transactions are pruned, not forwarded, when the
    /// blockchain node supplies it.
    pub fn mark_block_for_cleanup(&mut self, block_hash: Sha256Hash) {
        self.cleanup_marks.insert(block_hash);
    }

    /// Consumes a cleanup mark; true if the block was marked.
    pub fn take_cleanup_mark(&mut self, block_hash: &Sha256Hash) -> bool {
        self.cleanup_marks.remove(block_hash)
    }

    /// Replaces the hold timeout strategy.
    pub fn with_hold_strategy(mut self, strategy: Box<dyn HoldTimeoutStrategy>) -> Self {
        self.hold_strategy = strategy;
        self
    }

    /// Number of active holds.
    pub fn active_holds(&self) -> usize {
        self.holds.len()
    }

    // =========================================================================
    // HOLD PROTOCOL
    // =========================================================================

    /// Places a hold for a block another gateway claims to be propagating,
    /// and forwards the claim to peers.
    pub fn place_hold(
        &mut self,
        block_hash: Sha256Hash,
        conn: ConnectionId,
        ctx: &mut dyn GatewayContext,
    ) {
        if self.blocks_seen.contains(&block_hash) {
            return;
        }
        if self.holds.contains_key(&block_hash) {
            return;
        }
        debug!(%block_hash, %conn, "placing block hold");
        self.holds.insert(
            block_hash,
            BlockHold {
                hold_message_time: ctx.now(),
                holding_connection: conn,
                block_message: None,
                alarm: None,
                held_connection: None,
            },
            ctx.now(),
        );
        ctx.broadcast(
            &BxMessage::BlockHolding {
                block_hash,
                network_num: self.config.network_num,
            },
            Some(conn),
            ConnectionRole::RELAY_BLOCK | ConnectionRole::GATEWAY,
            false,
        );
    }

    /// Entry point for a block received from the blockchain node. Held
    /// blocks wait for the hold timeout; everything else compresses and
    /// propagates immediately.
    pub fn queue_block_for_processing(
        &mut self,
        block_hash: Sha256Hash,
        block_msg: Vec<u8>,
        conn: ConnectionId,
        ctx: &mut dyn GatewayContext,
    ) {
        if self.holds.contains_key(&block_hash) {
            let timeout = self.hold_strategy.compute(&self.config, &block_msg);
            let hold = self.holds.get_mut(&block_hash).expect("checked above");
            debug!(%block_hash, holder = %hold.holding_connection, "block is held, deferring");
            if hold.alarm.is_none() {
                hold.block_message = Some(block_msg);
                hold.held_connection = Some(conn);
                hold.alarm = Some(ctx.schedule(timeout, AlarmAction::HoldTimeout(block_hash)));
            }
            return;
        }

        // Announce the hold ahead of the block itself.
        ctx.broadcast(
            &BxMessage::BlockHolding {
                block_hash,
                network_num: self.config.network_num,
            },
            Some(conn),
            ConnectionRole::RELAY_BLOCK | ConnectionRole::GATEWAY,
            true,
        );
        self.process_and_broadcast_block(block_hash, block_msg, ctx);
    }

    /// Lifts a hold; idempotent, and never propagates the held local copy.
    pub fn cancel_hold_timeout(&mut self, block_hash: &Sha256Hash, ctx: &mut dyn GatewayContext) {
        if let Some(hold) = self.holds.remove(block_hash) {
            debug!(%block_hash, "hold lifted");
            if let Some(alarm) = hold.alarm {
                ctx.cancel(alarm);
            }
        }
    }

    /// Hold alarm fired: the block never arrived from the BDN, propagate the
    /// local copy.
    pub fn on_hold_timeout(&mut self, block_hash: Sha256Hash, ctx: &mut dyn GatewayContext) {
        let Some(hold) = self.holds.remove(&block_hash) else {
            return;
        };
        debug!(
            %block_hash,
            held_for = ?ctx.now().duration_since(hold.hold_message_time),
            held_connection = ?hold.held_connection,
            "hold timed out, propagating local copy"
        );
        if let Some(block_msg) = hold.block_message {
            self.process_and_broadcast_block(block_hash, block_msg, ctx);
        }
    }

    fn process_and_broadcast_block(
        &mut self,
        block_hash: Sha256Hash,
        block_msg: Vec<u8>,
        ctx: &mut dyn GatewayContext,
    ) {
        let (bx_block, block_info) =
            match self.converter.block_to_bx_block(&block_msg, &self.tx_service) {
                Ok(result) => result,
                Err(err) => {
                    error!(%block_hash, %err, "failed to compress block");
                    return;
                }
            };
        self.stats.record(|c| c.blocks_compressed += 1);
        info!(
            %block_hash,
            original = block_info.original_size,
            compressed = block_info.compressed_size,
            rate = format!("{:.1}%", block_info.compression_rate()),
            txs = block_info.txn_count,
            "block compressed"
        );

        if self.config.dump_short_id_mapping {
            let mapping: Vec<(ShortId, Sha256Hash)> = block_info
                .short_ids
                .iter()
                .filter_map(|sid| self.tx_service.get_transaction(*sid).map(|(h, _)| (*sid, h)))
                .collect();
            ctx.dump_short_id_mapping(&block_hash, &mapping);
        }

        let short_ids = block_info.short_ids.clone();
        self.neutrality
            .propagate_block_to_network(bx_block, &block_info, ctx);

        // Our own copy is now in flight; any BDN-side state for it is moot.
        self.recovery
            .cancel_recovery_for_block(&block_hash, &mut self.tx_service);
        self.queuing.remove(&block_hash);
        self.blocks_seen.add(block_hash, ctx.now());

        self.tx_service
            .track_seen_short_ids_delayed(block_hash, short_ids);
        ctx.schedule(
            Duration::from_secs(TRACK_SEEN_SHORT_IDS_DELAY_S),
            AlarmAction::TrackSeenShortIds(block_hash),
        );
    }

    /// Propagates a block that is already in bx form (the compact-block
    /// path compresses before reaching the pipeline).
    pub fn broadcast_compressed_block(
        &mut self,
        bx_block: Vec<u8>,
        block_info: &gw_02_messages::converter::BlockInfo,
        ctx: &mut dyn GatewayContext,
    ) {
        let block_hash = block_info.block_hash;
        self.stats.record(|c| c.blocks_compressed += 1);
        self.neutrality
            .propagate_block_to_network(bx_block, block_info, ctx);
        self.recovery
            .cancel_recovery_for_block(&block_hash, &mut self.tx_service);
        self.queuing.remove(&block_hash);
        self.blocks_seen.add(block_hash, ctx.now());
        self.tx_service
            .track_seen_short_ids_delayed(block_hash, block_info.short_ids.clone());
        ctx.schedule(
            Duration::from_secs(TRACK_SEEN_SHORT_IDS_DELAY_S),
            AlarmAction::TrackSeenShortIds(block_hash),
        );
    }

    // =========================================================================
    // INBOUND FROM THE BDN
    // =========================================================================

    /// Handles a `broadcast` message: an encrypted (or plaintext) bx-block.
    pub fn process_block_broadcast(
        &mut self,
        block_hash: Sha256Hash,
        is_encrypted: bool,
        blob: Vec<u8>,
        conn: ConnectionId,
        ctx: &mut dyn GatewayContext,
    ) {
        if !is_encrypted {
            self.handle_decrypted_block(blob, conn, ctx, false);
            return;
        }

        let expected_hash = double_sha256(&blob);
        if expected_hash != block_hash {
            warn!(
                %conn,
                expected = %expected_hash,
                actual = %block_hash,
                "block with inconsistent hashes from the BDN, dropping"
            );
            return;
        }

        if self.in_progress.has_encryption_key_for_hash(&block_hash) {
            trace!(%block_hash, "already had key for received block");
            match self.in_progress.decrypt_ciphertext(&block_hash, &blob) {
                Some(plaintext) => self.handle_decrypted_block(plaintext, conn, ctx, false),
                None => {
                    warn!(%block_hash, "{}", GatewayError::Decryption(block_hash));
                }
            }
            return;
        }

        trace!(%block_hash, "received encrypted block, storing");
        self.in_progress
            .add_ciphertext(block_hash, blob, ctx.now());
        let receipts = ctx.broadcast(
            &BxMessage::BlockReceived {
                block_hash,
                network_num: self.config.network_num,
            },
            None,
            ConnectionRole::GATEWAY,
            false,
        );
        debug!(%block_hash, receipts, "sent block receipt to gateway peers");
    }

    /// Handles a `key` message: decrypt the stored ciphertext or park the
    /// key, then pass the key along to gateway peers.
    pub fn process_block_key(
        &mut self,
        block_hash: Sha256Hash,
        key: [u8; BLOCK_KEY_LEN],
        conn: ConnectionId,
        ctx: &mut dyn GatewayContext,
    ) {
        if self.in_progress.has_encryption_key_for_hash(&block_hash) {
            return;
        }

        if self.in_progress.has_ciphertext_for_hash(&block_hash) {
            trace!(%block_hash, "cipher text found, decrypting");
            match self.in_progress.decrypt_and_get_payload(&block_hash, &key) {
                Some(plaintext) => self.handle_decrypted_block(plaintext, conn, ctx, false),
                None => {
                    warn!(%block_hash, "{}", GatewayError::Decryption(block_hash));
                }
            }
        } else {
            trace!(%block_hash, "no cipher text for key, storing");
            self.in_progress.add_key(block_hash, key, ctx.now());
        }

        ctx.broadcast(
            &BxMessage::Key {
                block_hash,
                network_num: self.config.network_num,
                key,
            },
            Some(conn),
            ConnectionRole::GATEWAY,
            false,
        );
    }

    /// Re-runs decompression for every recovery that completed.
    pub fn retry_broadcast_recovered_blocks(
        &mut self,
        conn: ConnectionId,
        ctx: &mut dyn GatewayContext,
    ) {
        let recovered: Vec<Vec<u8>> = self.recovery.recovered_blocks().to_vec();
        if recovered.is_empty() {
            return;
        }
        self.recovery.clean_up_recovered_blocks();
        for bx_block in recovered {
            self.handle_decrypted_block(bx_block, conn, ctx, true);
        }
    }

    /// Decompresses a bx-block and routes the outcome: delivery, duplicate
    /// tracking, or recovery.
    pub fn handle_decrypted_block(
        &mut self,
        bx_block: Vec<u8>,
        conn: ConnectionId,
        ctx: &mut dyn GatewayContext,
        recovered: bool,
    ) {
        if !ctx.has_blockchain_node_connection() {
            warn!("discarding block, no connection to the blockchain node");
            return;
        }

        let result = match self.converter.bx_block_to_block(&bx_block, &self.tx_service) {
            Ok(result) => result,
            Err(err) => {
                if let GatewayError::MessageConversion { block_hash, .. } = &err {
                    self.recovery
                        .cancel_recovery_for_block(block_hash, &mut self.tx_service);
                    self.queuing.remove(block_hash);
                }
                warn!(%err, "failed to decompress block");
                return;
            }
        };

        let block_hash = result.block_info.block_hash;
        let all_short_ids = result.block_info.short_ids.clone();

        self.cancel_hold_timeout(&block_hash, ctx);

        if self.blocks_seen.contains(&block_hash) {
            self.stats.record(|c| c.blocks_duplicate += 1);
            self.tx_service
                .track_seen_short_ids(block_hash, all_short_ids);
            debug!(%block_hash, "ignoring block already seen");
            return;
        }

        if recovered {
            self.stats.record(|c| c.blocks_recovery_completed += 1);
            info!(%block_hash, "successfully recovered block");
        } else {
            info!(%block_hash, "received block from the BDN");
        }

        match result.block {
            Some(block_msg) => {
                self.stats.record(|c| c.blocks_decompressed += 1);
                if recovered || self.queuing.contains(&block_hash) {
                    self.queuing
                        .update_recovered_block(&block_hash, block_msg, ctx);
                } else {
                    self.queuing.push(block_hash, Some(block_msg), false, ctx);
                }
                self.recovery
                    .cancel_recovery_for_block(&block_hash, &mut self.tx_service);
                self.blocks_seen.add(block_hash, ctx.now());
                self.tx_service
                    .track_seen_short_ids(block_hash, all_short_ids);
            }
            None => {
                if self.queuing.contains(&block_hash) && !recovered {
                    trace!(%block_hash, "handling already queued block again, ignoring");
                    return;
                }
                self.recovery.add_block(
                    bx_block,
                    block_hash,
                    result.unknown_sids.clone(),
                    result.unknown_hashes.clone(),
                    ctx.now(),
                    &mut self.tx_service,
                );
                self.stats.record(|c| c.blocks_recovery_started += 1);
                warn!(
                    %block_hash,
                    unknown_sids = result.unknown_sids.len(),
                    unknown_hashes = result.unknown_hashes.len(),
                    "block requires short id recovery, querying BDN"
                );
                self.start_transaction_recovery(
                    &result.unknown_sids,
                    &result.unknown_hashes,
                    block_hash,
                    Some(conn),
                    ctx,
                );
                if recovered {
                    // Should never happen; recovered blocks re-enter here
                    // only after their unknowns drained.
                    error!(%block_hash, "could not decompress block after recovery");
                } else {
                    self.queuing.push(block_hash, None, true, ctx);
                }
            }
        }
    }

    // =========================================================================
    // RECOVERY DRIVING
    // =========================================================================

    /// Requests the missing transactions from relay-tx peers. The initial
    /// call (with a connection) also arms the first retry.
    pub fn start_transaction_recovery(
        &mut self,
        unknown_sids: &[ShortId],
        unknown_hashes: &[Sha256Hash],
        block_hash: Sha256Hash,
        conn: Option<ConnectionId>,
        ctx: &mut dyn GatewayContext,
    ) {
        let mut all_unknown_sids: Vec<ShortId> = unknown_sids.to_vec();
        for tx_hash in unknown_hashes {
            let sid = self.tx_service.get_short_id(tx_hash);
            if sid != NULL_SHORT_ID {
                all_unknown_sids.push(sid);
            }
        }

        ctx.broadcast(
            &BxMessage::GetTxs {
                short_ids: all_unknown_sids.clone(),
            },
            None,
            ConnectionRole::RELAY_TRANSACTION,
            false,
        );
        debug!(
            %block_hash,
            requested = all_unknown_sids.len(),
            repeated = conn.is_none(),
            "requested unknown transactions from relay"
        );

        if conn.is_some() {
            // First request for this block; arm the retry schedule.
            if let Some(awaiting) = self
                .recovery
                .get_blocks_awaiting_recovery()
                .into_iter()
                .find(|b| b.block_hash == block_hash)
            {
                self.schedule_recovery_retry(&awaiting, ctx);
            }
        }
    }

    /// Schedules the next recovery attempt, or gives up once the retry
    /// budget or the overall timeout is exhausted.
    pub fn schedule_recovery_retry(
        &mut self,
        awaiting: &BlockAwaitingRecovery,
        ctx: &mut dyn GatewayContext,
    ) {
        let block_hash = awaiting.block_hash;
        let attempts = self
            .recovery
            .recovery_attempts_by_block
            .get(&block_hash)
            .copied()
            .unwrap_or(0);
        let timed_out = ctx.now().duration_since(awaiting.recovery_start)
            >= self.config.blockchain_block_recovery_timeout;

        if attempts >= BLOCK_RECOVERY_MAX_RETRY_ATTEMPTS || timed_out {
            error!(
                %block_hash,
                attempts,
                timed_out,
                "could not recover block short ids, discarding"
            );
            self.stats.record(|c| c.blocks_recovery_exhausted += 1);
            self.recovery
                .cancel_recovery_for_block(&block_hash, &mut self.tx_service);
            self.queuing.remove(&block_hash);
            return;
        }

        let delay = Duration::from_secs_f64(BLOCK_RECOVERY_RECOVERY_INTERVAL_S[attempts as usize]);
        ctx.schedule(delay, AlarmAction::RecoveryRetry(block_hash));
    }

    /// Retry alarm fired: re-request whatever is still missing.
    pub fn on_recovery_retry(&mut self, block_hash: Sha256Hash, ctx: &mut dyn GatewayContext) {
        let Some(awaiting) = self
            .recovery
            .get_blocks_awaiting_recovery()
            .into_iter()
            .find(|b| b.block_hash == block_hash)
        else {
            return;
        };
        *self
            .recovery
            .recovery_attempts_by_block
            .entry(block_hash)
            .or_insert(0) += 1;
        self.start_transaction_recovery(
            &awaiting.unknown_short_ids,
            &awaiting.unknown_transaction_hashes,
            block_hash,
            None,
            ctx,
        );
        self.schedule_recovery_retry(&awaiting, ctx);
    }

    // =========================================================================
    // ALARM ROUTING
    // =========================================================================

    /// Executes a pipeline-owned alarm action.
    pub fn on_alarm(&mut self, action: AlarmAction, ctx: &mut dyn GatewayContext) {
        match action {
            AlarmAction::HoldTimeout(block_hash) => self.on_hold_timeout(block_hash, ctx),
            AlarmAction::RecoveryRetry(block_hash) => self.on_recovery_retry(block_hash, ctx),
            AlarmAction::NeutralityTimeout(block_hash) => {
                self.neutrality.on_timeout(&block_hash, ctx)
            }
            AlarmAction::TrackSeenShortIds(block_hash) => {
                self.tx_service.commit_delayed_seen(&block_hash)
            }
            AlarmAction::ReleaseNextBlock | AlarmAction::NodeReadinessCheck => {
                self.queuing.on_release_alarm(ctx)
            }
            AlarmAction::SweepCaches => self.sweep_caches(ctx),
            AlarmAction::StatsFlush => self.stats.flush(),
            other => debug!(?other, "alarm action not owned by the pipeline"),
        }
    }

    /// Periodic sweep of every expiring cache.
    pub fn sweep_caches(&mut self, ctx: &mut dyn GatewayContext) {
        let now = ctx.now();
        self.blocks_seen.sweep(now);
        self.in_progress.sweep(now);
        for (block_hash, hold) in self.holds.sweep(now) {
            debug!(%block_hash, "expired stale hold");
            if let Some(alarm) = hold.alarm {
                ctx.cancel(alarm);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ContextEvent, ScriptedContext};
    use gw_03_btc_protocol::constants::BTC_MAINNET_MAGIC;
    use gw_03_btc_protocol::messages::build_block_message;
    use gw_03_btc_protocol::BtcBlockConverter;

    fn pipeline() -> BlockPipeline {
        BlockPipeline::new(
            PipelineConfig::default(),
            Box::new(BtcBlockConverter::new(BTC_MAINNET_MAGIC)),
            TxServiceConfig::default(),
        )
    }

    fn block(tag: u8) -> (Sha256Hash, Vec<u8>) {
        let msg = build_block_message(BTC_MAINNET_MAGIC, &[tag; 80], &[]);
        (double_sha256(&[tag; 80]), msg)
    }

    fn holding_broadcasts(ctx: &ScriptedContext) -> usize {
        ctx.broadcasts()
            .iter()
            .filter(|m| matches!(m, BxMessage::BlockHolding { .. }))
            .count()
    }

    fn encrypted_broadcasts(ctx: &ScriptedContext) -> usize {
        ctx.broadcasts()
            .iter()
            .filter(|m| matches!(m, BxMessage::Broadcast { .. }))
            .count()
    }

    #[test]
    fn test_place_hold_broadcasts_claim() {
        let mut ctx = ScriptedContext::new();
        let mut pipeline = pipeline();
        let (hash1, _) = block(1);
        let (hash2, _) = block(2);

        pipeline.place_hold(hash1, ConnectionId(1), &mut ctx);
        pipeline.place_hold(hash2, ConnectionId(1), &mut ctx);

        assert_eq!(pipeline.active_holds(), 2);
        assert_eq!(holding_broadcasts(&ctx), 2);
    }

    #[test]
    fn test_place_hold_ignored_for_seen_block() {
        let mut ctx = ScriptedContext::new();
        let mut pipeline = pipeline();
        let (hash, _) = block(1);
        pipeline.blocks_seen.add(hash, ctx.now);

        pipeline.place_hold(hash, ConnectionId(1), &mut ctx);
        assert_eq!(pipeline.active_holds(), 0);
    }

    #[test]
    fn test_queue_block_without_hold_propagates() {
        let mut ctx = ScriptedContext::new();
        let mut pipeline = pipeline();
        let (hash, msg) = block(3);

        pipeline.queue_block_for_processing(hash, msg, ConnectionId(1), &mut ctx);

        // Holding claim raced ahead, then the encrypted block went out.
        assert_eq!(holding_broadcasts(&ctx), 1);
        assert_eq!(encrypted_broadcasts(&ctx), 1);
        assert!(pipeline.blocks_seen.contains(&hash));
    }

    #[test]
    fn test_held_block_waits_for_timeout() {
        let mut ctx = ScriptedContext::new();
        let mut pipeline = pipeline();
        let (hash, msg) = block(4);

        pipeline.place_hold(hash, ConnectionId(2), &mut ctx);
        pipeline.queue_block_for_processing(hash, msg, ConnectionId(1), &mut ctx);

        // No propagation while held.
        assert_eq!(encrypted_broadcasts(&ctx), 0);
        assert_eq!(pipeline.active_holds(), 1);

        // Hold timeout fires and the local copy finally propagates.
        let due = ctx.advance(Duration::from_secs(1));
        assert!(due.contains(&AlarmAction::HoldTimeout(hash)));
        pipeline.on_alarm(AlarmAction::HoldTimeout(hash), &mut ctx);
        assert_eq!(encrypted_broadcasts(&ctx), 1);
        assert_eq!(pipeline.active_holds(), 0);
    }

    #[test]
    fn test_cancelled_hold_never_propagates() {
        let mut ctx = ScriptedContext::new();
        let mut pipeline = pipeline();
        let (hash, msg) = block(5);

        pipeline.place_hold(hash, ConnectionId(2), &mut ctx);
        pipeline.queue_block_for_processing(hash, msg, ConnectionId(1), &mut ctx);
        pipeline.cancel_hold_timeout(&hash, &mut ctx);

        assert_eq!(pipeline.active_holds(), 0);
        // The alarm was cancelled; advancing time propagates nothing.
        ctx.advance(Duration::from_secs(5));
        pipeline.on_alarm(AlarmAction::HoldTimeout(hash), &mut ctx);
        assert_eq!(encrypted_broadcasts(&ctx), 0);
    }

    #[test]
    fn test_cancel_hold_is_idempotent() {
        let mut ctx = ScriptedContext::new();
        let mut pipeline = pipeline();
        let (hash, _) = block(6);

        pipeline.place_hold(hash, ConnectionId(2), &mut ctx);
        pipeline.place_hold(hash, ConnectionId(3), &mut ctx);
        pipeline.cancel_hold_timeout(&hash, &mut ctx);
        pipeline.cancel_hold_timeout(&hash, &mut ctx);
        assert_eq!(pipeline.active_holds(), 0);
    }

    #[test]
    fn test_broadcast_hash_mismatch_dropped() {
        let mut ctx = ScriptedContext::new();
        let mut pipeline = pipeline();

        pipeline.process_block_broadcast(
            Sha256Hash::new([9; 32]),
            true,
            vec![1, 2, 3],
            ConnectionId(1),
            &mut ctx,
        );
        assert!(pipeline.in_progress.is_empty());
        assert!(ctx.broadcasts().is_empty());
    }

    #[test]
    fn test_encrypted_block_without_key_sends_receipt() {
        let mut ctx = ScriptedContext::new();
        let mut pipeline = pipeline();
        let (ciphertext, _key) = crate::domain::in_progress::encrypt_block(b"bx block");
        let block_hash = double_sha256(&ciphertext);

        pipeline.process_block_broadcast(
            block_hash,
            true,
            ciphertext,
            ConnectionId(1),
            &mut ctx,
        );

        assert!(pipeline.in_progress.has_ciphertext_for_hash(&block_hash));
        assert!(ctx
            .broadcasts()
            .iter()
            .any(|m| matches!(m, BxMessage::BlockReceived { .. })));
    }

    #[test]
    fn test_key_then_broadcast_decrypts() {
        let mut ctx = ScriptedContext::new();
        let mut pipeline = pipeline();

        // A real bx-block so decompression succeeds after decryption.
        let (_, block_msg) = block(7);
        let (bx_block, _) = pipeline
            .converter
            .block_to_bx_block(&block_msg, &pipeline.tx_service)
            .unwrap();
        let (ciphertext, key) = crate::domain::in_progress::encrypt_block(&bx_block);
        let block_hash = double_sha256(&ciphertext);

        pipeline.process_block_key(block_hash, key, ConnectionId(1), &mut ctx);
        assert!(pipeline.in_progress.has_encryption_key_for_hash(&block_hash));

        pipeline.process_block_broadcast(
            block_hash,
            true,
            ciphertext,
            ConnectionId(1),
            &mut ctx,
        );

        // Decrypted, decompressed, and delivered to the node.
        assert_eq!(ctx.node_sends(), vec![&block_msg]);
    }

    #[test]
    fn test_key_is_relayed_to_gateway_peers() {
        let mut ctx = ScriptedContext::new();
        let mut pipeline = pipeline();
        pipeline.process_block_key(
            Sha256Hash::new([8; 32]),
            [1; BLOCK_KEY_LEN],
            ConnectionId(1),
            &mut ctx,
        );
        assert!(ctx
            .broadcasts()
            .iter()
            .any(|m| matches!(m, BxMessage::Key { .. })));
    }

    #[test]
    fn test_unknown_sids_start_recovery_with_placeholder() {
        let mut ctx = ScriptedContext::new();
        let mut pipeline = pipeline();

        // Compress a block whose only transaction is known to the sender but
        // not to this gateway.
        let tx = gw_03_btc_protocol::tx::test_support::legacy_tx(1);
        let txid = gw_03_btc_protocol::tx::parse_transaction(&tx, 0).unwrap().txid;
        let block_msg = build_block_message(BTC_MAINNET_MAGIC, &[7; 80], &[tx.clone()]);

        let mut sender = TransactionService::with_defaults();
        sender.assign_short_id(txid, 99).unwrap();
        sender.set_transaction_contents(txid, tx.clone());
        let (bx_block, info) = pipeline
            .converter
            .block_to_bx_block(&block_msg, &sender)
            .unwrap();
        let block_hash = info.block_hash;

        pipeline.handle_decrypted_block(bx_block, ConnectionId(1), &mut ctx, false);

        // Placeholder queued, GetTxs [99] broadcast to relay-tx peers.
        assert!(pipeline.queuing.contains(&block_hash));
        assert!(pipeline.recovery.is_in_recovery(&block_hash));
        assert!(ctx.broadcasts().iter().any(|m| matches!(
            m,
            BxMessage::GetTxs { short_ids } if short_ids == &vec![99]
        )));
        assert!(ctx.node_sends().is_empty());

        // The missing transaction arrives; recovery completes and the block
        // is delivered.
        pipeline.tx_service.assign_short_id(txid, 99).unwrap();
        pipeline.tx_service.set_transaction_contents(txid, tx);
        assert!(pipeline.recovery.check_missing_sid(99));
        pipeline.retry_broadcast_recovered_blocks(ConnectionId(1), &mut ctx);

        assert_eq!(ctx.node_sends(), vec![&block_msg]);
        assert!(!pipeline.recovery.is_in_recovery(&block_hash));
        assert!(pipeline.blocks_seen.contains(&block_hash));
    }

    #[test]
    fn test_recovery_exhaustion_discards_block() {
        let mut ctx = ScriptedContext::new();
        let mut pipeline = pipeline();

        let tx = gw_03_btc_protocol::tx::test_support::legacy_tx(2);
        let txid = gw_03_btc_protocol::tx::parse_transaction(&tx, 0).unwrap().txid;
        let block_msg = build_block_message(BTC_MAINNET_MAGIC, &[8; 80], &[tx.clone()]);
        let mut sender = TransactionService::with_defaults();
        sender.assign_short_id(txid, 55).unwrap();
        sender.set_transaction_contents(txid, tx);
        let (bx_block, info) = pipeline
            .converter
            .block_to_bx_block(&block_msg, &sender)
            .unwrap();
        let block_hash = info.block_hash;

        pipeline.handle_decrypted_block(bx_block, ConnectionId(1), &mut ctx, false);
        assert!(pipeline.recovery.is_in_recovery(&block_hash));

        // Relay never responds: fire every retry through the schedule.
        for _ in 0..(BLOCK_RECOVERY_MAX_RETRY_ATTEMPTS + 1) {
            let due = ctx.advance(Duration::from_secs(6));
            for action in due {
                pipeline.on_alarm(action, &mut ctx);
            }
        }

        assert!(!pipeline.recovery.is_in_recovery(&block_hash));
        assert!(!pipeline.queuing.contains(&block_hash));
        assert!(ctx.node_sends().is_empty());
    }

    #[test]
    fn test_duplicate_block_only_tracks_short_ids() {
        let mut ctx = ScriptedContext::new();
        let mut pipeline = pipeline();
        let (_, block_msg) = block(9);
        let (bx_block, info) = pipeline
            .converter
            .block_to_bx_block(&block_msg, &pipeline.tx_service)
            .unwrap();

        pipeline.blocks_seen.add(info.block_hash, ctx.now);
        pipeline.handle_decrypted_block(bx_block, ConnectionId(1), &mut ctx, false);

        assert!(ctx.node_sends().is_empty());
        assert_eq!(pipeline.stats.snapshot().blocks_duplicate, 1);
    }

    #[test]
    fn test_no_node_connection_discards_block() {
        let mut ctx = ScriptedContext::new();
        ctx.node_connected = false;
        let mut pipeline = pipeline();
        let (_, block_msg) = block(10);
        let (bx_block, _) = pipeline
            .converter
            .block_to_bx_block(&block_msg, &pipeline.tx_service)
            .unwrap();

        pipeline.handle_decrypted_block(bx_block, ConnectionId(1), &mut ctx, false);
        assert!(ctx.node_sends().is_empty());
        assert!(pipeline.queuing.is_empty());
    }

    #[test]
    fn test_garbage_bx_block_evicts_recovery_state() {
        let mut ctx = ScriptedContext::new();
        let mut pipeline = pipeline();
        // A bx-block with a plausible offsets header but a truncated body.
        let mut garbage = Vec::new();
        garbage.extend_from_slice(&200u64.to_le_bytes());
        garbage.extend_from_slice(&[0u8; 100]);
        pipeline.handle_decrypted_block(garbage, ConnectionId(1), &mut ctx, false);
        assert!(ctx.node_sends().is_empty());
    }

    #[test]
    fn test_bdn_block_cancels_hold() {
        let mut ctx = ScriptedContext::new();
        let mut pipeline = pipeline();
        let (_, block_msg) = block(11);
        let (bx_block, info) = pipeline
            .converter
            .block_to_bx_block(&block_msg, &pipeline.tx_service)
            .unwrap();

        // Hold placed by a peer, local copy waiting on the alarm.
        pipeline.place_hold(info.block_hash, ConnectionId(2), &mut ctx);
        pipeline.queue_block_for_processing(
            info.block_hash,
            block_msg.clone(),
            ConnectionId(1),
            &mut ctx,
        );
        assert_eq!(encrypted_broadcasts(&ctx), 0);

        // The same block arrives via the BDN: hold cancelled, block
        // delivered, and the local copy never propagates.
        pipeline.handle_decrypted_block(bx_block, ConnectionId(3), &mut ctx, false);
        assert_eq!(pipeline.active_holds(), 0);
        assert_eq!(ctx.node_sends(), vec![&block_msg]);

        ctx.advance(Duration::from_secs(10));
        pipeline.on_alarm(AlarmAction::HoldTimeout(info.block_hash), &mut ctx);
        assert_eq!(encrypted_broadcasts(&ctx), 0);

        let cancel_count = ctx
            .events
            .iter()
            .filter(|e| matches!(e, ContextEvent::Cancelled(_)))
            .count();
        assert!(cancel_count >= 1);
    }
}
