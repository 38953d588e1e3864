//! BDN relay (and gateway peer) connection protocol.
//!
//! The dispatch table maps overlay message types to handler functions; the
//! role bitmask gates block vs transaction traffic. Unexpected messages are
//! logged and discarded, never fatal.

use gw_02_messages::constants::{NODE_ID_LEN, PROTOCOL_VERSION};
use gw_02_messages::{BxMessage, BxMessageType};
use gw_05_block_pipeline::{BlockPipeline, GatewayContext};
use shared_types::{AlarmAction, AlarmId, ConnectionRole, ConnectionState, NULL_SHORT_ID};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, error, info, trace};

use crate::domain::ConnectionInfo;
use gw_05_block_pipeline::config::BLOCKCHAIN_PING_INTERVAL_S;

/// Handshake completion deadline.
const HELLO_TIMEOUT_S: u64 = 10;

type RelayHandler =
    fn(&mut RelayConnectionProtocol, BxMessage, &mut BlockPipeline, &mut dyn GatewayContext);

/// Protocol state machine for one relay or gateway peer.
pub struct RelayConnectionProtocol {
    pub info: ConnectionInfo,
    handlers: HashMap<BxMessageType, RelayHandler>,
    handshake_alarm: Option<AlarmId>,
    ping_nonce: u64,
}

impl RelayConnectionProtocol {
    /// Builds the machine, enqueues the opening `hello`, and arms the
    /// handshake timeout.
    pub fn new(
        info: ConnectionInfo,
        network_num: u32,
        node_id: [u8; NODE_ID_LEN],
        ctx: &mut dyn GatewayContext,
    ) -> Self {
        let mut protocol = Self {
            info,
            handlers: Self::build_handlers(),
            handshake_alarm: None,
            ping_nonce: 0,
        };
        protocol.info.state = ConnectionState::Handshaking;
        let hello = BxMessage::Hello {
            protocol_version: PROTOCOL_VERSION,
            network_num,
            node_id,
        };
        ctx.send_to_connection(protocol.info.id, hello.to_frame());
        protocol.handshake_alarm = Some(ctx.schedule(
            Duration::from_secs(HELLO_TIMEOUT_S),
            AlarmAction::HandshakeTimeout(protocol.info.id),
        ));
        protocol
    }

    fn build_handlers() -> HashMap<BxMessageType, RelayHandler> {
        let mut handlers: HashMap<BxMessageType, RelayHandler> = HashMap::new();
        handlers.insert(BxMessageType::Hello, Self::msg_hello);
        handlers.insert(BxMessageType::Ack, Self::msg_ack);
        handlers.insert(BxMessageType::Ping, Self::msg_ping);
        handlers.insert(BxMessageType::Pong, Self::msg_pong);
        handlers.insert(BxMessageType::Broadcast, Self::msg_broadcast);
        handlers.insert(BxMessageType::Key, Self::msg_key);
        handlers.insert(BxMessageType::Transaction, Self::msg_tx);
        handlers.insert(BxMessageType::Transactions, Self::msg_txs);
        handlers.insert(BxMessageType::BlockHolding, Self::msg_block_holding);
        handlers.insert(BxMessageType::BlockReceived, Self::msg_block_received);
        handlers.insert(
            BxMessageType::DisconnectRelayPeer,
            Self::msg_disconnect_relay_peer,
        );
        handlers.insert(BxMessageType::TxServiceSyncTxs, Self::msg_tx_service_sync_txs);
        handlers.insert(
            BxMessageType::TxServiceSyncComplete,
            Self::msg_tx_service_sync_complete,
        );
        handlers.insert(BxMessageType::BlockConfirmation, Self::msg_cleanup);
        handlers.insert(BxMessageType::TransactionCleanup, Self::msg_cleanup);
        handlers
    }

    /// Dispatches one decoded frame.
    pub fn on_message(
        &mut self,
        msg_type: BxMessageType,
        payload: &[u8],
        pipeline: &mut BlockPipeline,
        ctx: &mut dyn GatewayContext,
    ) {
        let msg = match BxMessage::decode(msg_type, payload) {
            Ok(msg) => msg,
            Err(err) => {
                error!(conn = %self.info.id, %err, "malformed relay message, closing");
                ctx.mark_for_close(self.info.id);
                return;
            }
        };
        match self.handlers.get(&msg_type) {
            Some(handler) => handler(self, msg, pipeline, ctx),
            None => debug!(conn = %self.info.id, ?msg_type, "no handler, discarding"),
        }
    }

    /// Ping alarm entry point.
    pub fn on_send_ping(&mut self, ctx: &mut dyn GatewayContext) {
        self.ping_nonce += 1;
        ctx.send_to_connection(
            self.info.id,
            BxMessage::Ping {
                nonce: self.ping_nonce,
            }
            .to_frame(),
        );
        ctx.schedule(
            Duration::from_secs(BLOCKCHAIN_PING_INTERVAL_S),
            AlarmAction::SendPing(self.info.id),
        );
    }

    /// Handshake timeout entry point.
    pub fn on_handshake_timeout(&mut self, ctx: &mut dyn GatewayContext) {
        if !self.info.is_established() {
            error!(conn = %self.info.id, peer = %self.info.peer, "relay handshake timed out");
            ctx.mark_for_close(self.info.id);
        }
    }

    fn establish(&mut self, ctx: &mut dyn GatewayContext) {
        if self.info.is_established() {
            return;
        }
        self.info.state = ConnectionState::Established;
        if let Some(alarm) = self.handshake_alarm.take() {
            ctx.cancel(alarm);
        }
        ctx.schedule(
            Duration::from_secs(BLOCKCHAIN_PING_INTERVAL_S),
            AlarmAction::SendPing(self.info.id),
        );
        info!(conn = %self.info.id, peer = %self.info.peer, "relay connection established");
    }

    fn msg_hello(
        &mut self,
        msg: BxMessage,
        _pipeline: &mut BlockPipeline,
        ctx: &mut dyn GatewayContext,
    ) {
        let BxMessage::Hello {
            protocol_version, ..
        } = msg
        else {
            return;
        };
        if protocol_version != PROTOCOL_VERSION {
            debug!(
                conn = %self.info.id,
                peer_version = protocol_version,
                "peer speaks a different protocol version"
            );
        }
        ctx.send_to_connection(self.info.id, BxMessage::Ack.to_frame());
        self.establish(ctx);
    }

    fn msg_ack(
        &mut self,
        _msg: BxMessage,
        _pipeline: &mut BlockPipeline,
        ctx: &mut dyn GatewayContext,
    ) {
        self.establish(ctx);
    }

    fn msg_ping(
        &mut self,
        msg: BxMessage,
        _pipeline: &mut BlockPipeline,
        ctx: &mut dyn GatewayContext,
    ) {
        let BxMessage::Ping { nonce } = msg else {
            return;
        };
        ctx.send_to_connection(self.info.id, BxMessage::Pong { nonce }.to_frame());
    }

    fn msg_pong(
        &mut self,
        _msg: BxMessage,
        _pipeline: &mut BlockPipeline,
        _ctx: &mut dyn GatewayContext,
    ) {
    }

    fn msg_broadcast(
        &mut self,
        msg: BxMessage,
        pipeline: &mut BlockPipeline,
        ctx: &mut dyn GatewayContext,
    ) {
        if !self.info.role.intersects(ConnectionRole::RELAY_BLOCK) {
            error!(conn = %self.info.id, "unexpected block message on non-block relay connection");
            return;
        }
        let BxMessage::Broadcast {
            block_hash,
            is_encrypted,
            blob,
            ..
        } = msg
        else {
            return;
        };
        pipeline.process_block_broadcast(block_hash, is_encrypted, blob, self.info.id, ctx);
    }

    fn msg_key(
        &mut self,
        msg: BxMessage,
        pipeline: &mut BlockPipeline,
        ctx: &mut dyn GatewayContext,
    ) {
        if !self.info.role.intersects(ConnectionRole::RELAY_BLOCK | ConnectionRole::GATEWAY) {
            error!(conn = %self.info.id, "unexpected key message on non-block relay connection");
            return;
        }
        let BxMessage::Key {
            block_hash, key, ..
        } = msg
        else {
            return;
        };
        pipeline.process_block_key(block_hash, key, self.info.id, ctx);
    }

    /// Transaction ingest, the hottest path on the relay side.
    fn msg_tx(
        &mut self,
        msg: BxMessage,
        pipeline: &mut BlockPipeline,
        ctx: &mut dyn GatewayContext,
    ) {
        if !self.info.role.intersects(ConnectionRole::RELAY_TRANSACTION) {
            error!(conn = %self.info.id, "unexpected tx message on non-tx relay connection");
            return;
        }
        let BxMessage::Tx {
            tx_hash,
            short_id,
            contents,
            ..
        } = msg
        else {
            return;
        };
        let has_short_id = short_id != NULL_SHORT_ID;
        let has_contents = !contents.is_empty();

        if !has_short_id
            && pipeline.tx_service.has_transaction_short_id(&tx_hash)
            && pipeline.tx_service.has_transaction_contents(&tx_hash)
        {
            pipeline.stats.record(|c| c.tx_duplicate_from_relay += 1);
            trace!(conn = %self.info.id, %tx_hash, "transaction already seen");
            return;
        }

        pipeline.stats.record(|c| {
            c.tx_from_relay += 1;
            if !has_contents {
                c.tx_compact_from_relay += 1;
            }
        });

        let mut attempt_recovery = false;
        if has_short_id {
            if let Err(err) = pipeline.tx_service.assign_short_id(tx_hash, short_id) {
                error!(conn = %self.info.id, %err, "short id assignment conflict");
            }
            attempt_recovery |= pipeline.recovery.check_missing_sid(short_id);
        }

        if pipeline.tx_service.has_transaction_contents(&tx_hash) {
            trace!(%tx_hash, "transaction seen, short id newly assigned");
            if has_contents {
                pipeline.stats.record(|c| c.tx_redundant_content += 1);
            }
            if attempt_recovery {
                pipeline.retry_broadcast_recovered_blocks(self.info.id, ctx);
            }
            return;
        }

        if has_contents {
            trace!(%tx_hash, "storing contents and forwarding to node");
            pipeline
                .tx_service
                .set_transaction_contents(tx_hash, contents.clone());
            attempt_recovery |= pipeline.recovery.check_missing_tx_hash(&tx_hash);

            if ctx.has_blockchain_node_connection() {
                match pipeline.converter.bx_tx_to_tx(&contents) {
                    Ok(native) => {
                        ctx.send_to_blockchain_node(native);
                        pipeline.stats.record(|c| c.tx_forwarded_to_node += 1);
                    }
                    Err(err) => debug!(%tx_hash, %err, "transaction did not convert, not forwarding"),
                }
            }
        }

        if attempt_recovery {
            pipeline.retry_broadcast_recovered_blocks(self.info.id, ctx);
        }
    }

    fn msg_txs(
        &mut self,
        msg: BxMessage,
        pipeline: &mut BlockPipeline,
        ctx: &mut dyn GatewayContext,
    ) {
        if !self.info.role.intersects(ConnectionRole::RELAY_TRANSACTION) {
            error!(conn = %self.info.id, "unexpected txs message on non-tx relay connection");
            return;
        }
        let BxMessage::Txs { txs } = msg else {
            return;
        };
        debug!(conn = %self.info.id, count = txs.len(), "recovery transactions from relay");

        for entry in txs {
            pipeline.recovery.check_missing_sid(entry.short_id);
            if !pipeline.tx_service.has_short_id(entry.short_id) {
                if let Err(err) = pipeline
                    .tx_service
                    .assign_short_id(entry.tx_hash, entry.short_id)
                {
                    error!(%err, "short id assignment conflict in txs reply");
                }
            }
            pipeline.recovery.check_missing_tx_hash(&entry.tx_hash);
            if !pipeline.tx_service.has_transaction_contents(&entry.tx_hash)
                && !entry.contents.is_empty()
            {
                pipeline
                    .tx_service
                    .set_transaction_contents(entry.tx_hash, entry.contents);
            }
        }

        pipeline.retry_broadcast_recovered_blocks(self.info.id, ctx);

        for awaiting in pipeline.recovery.get_blocks_awaiting_recovery() {
            pipeline.schedule_recovery_retry(&awaiting, ctx);
        }
    }

    fn msg_block_holding(
        &mut self,
        msg: BxMessage,
        pipeline: &mut BlockPipeline,
        ctx: &mut dyn GatewayContext,
    ) {
        let BxMessage::BlockHolding { block_hash, .. } = msg else {
            return;
        };
        pipeline.place_hold(block_hash, self.info.id, ctx);
    }

    fn msg_block_received(
        &mut self,
        msg: BxMessage,
        pipeline: &mut BlockPipeline,
        ctx: &mut dyn GatewayContext,
    ) {
        let BxMessage::BlockReceived { block_hash, .. } = msg else {
            return;
        };
        pipeline
            .neutrality
            .record_block_receipt(&block_hash, self.info.id, ctx);
    }

    fn msg_disconnect_relay_peer(
        &mut self,
        _msg: BxMessage,
        _pipeline: &mut BlockPipeline,
        ctx: &mut dyn GatewayContext,
    ) {
        info!(conn = %self.info.id, "relay requested disconnect, dropping");
        ctx.mark_for_close(self.info.id);
    }

    fn msg_tx_service_sync_txs(
        &mut self,
        msg: BxMessage,
        pipeline: &mut BlockPipeline,
        _ctx: &mut dyn GatewayContext,
    ) {
        let BxMessage::TxServiceSyncTxs { txs, .. } = msg else {
            return;
        };
        debug!(conn = %self.info.id, count = txs.len(), "transaction service sync chunk");
        for entry in txs {
            if entry.short_id != NULL_SHORT_ID {
                let _ = pipeline.tx_service.assign_short_id(entry.tx_hash, entry.short_id);
            }
            if !entry.contents.is_empty() {
                pipeline
                    .tx_service
                    .set_transaction_contents(entry.tx_hash, entry.contents);
            }
        }
    }

    fn msg_tx_service_sync_complete(
        &mut self,
        _msg: BxMessage,
        pipeline: &mut BlockPipeline,
        _ctx: &mut dyn GatewayContext,
    ) {
        info!(
            conn = %self.info.id,
            cached = pipeline.tx_service.len(),
            "transaction service sync complete"
        );
    }

    fn msg_cleanup(
        &mut self,
        msg: BxMessage,
        pipeline: &mut BlockPipeline,
        _ctx: &mut dyn GatewayContext,
    ) {
        let (block_hash, short_ids, tx_hashes) = match msg {
            BxMessage::BlockConfirmation {
                block_hash,
                short_ids,
                tx_hashes,
                ..
            } => (Some(block_hash), short_ids, tx_hashes),
            BxMessage::TransactionCleanup {
                short_ids,
                tx_hashes,
                ..
            } => (None, short_ids, tx_hashes),
            _ => return,
        };

        if short_ids.is_empty() && tx_hashes.is_empty() {
            // Confirmation without contents: prune from the block's own
            // transaction list when the node supplies it.
            if let Some(block_hash) = block_hash {
                pipeline.mark_block_for_cleanup(block_hash);
            }
            return;
        }

        let removed = pipeline.tx_service.on_block_confirmed(&short_ids, &tx_hashes);
        debug!(conn = %self.info.id, removed, "cleaned confirmed transactions");
    }
}
