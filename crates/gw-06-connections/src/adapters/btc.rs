//! Bitcoin node connection protocol.
//!
//! The gateway initiates: it sends `version` at construction, completes the
//! handshake on the peer's `version`, then bridges traffic — `inv` is always
//! answered with `getdata`, blocks and transactions flow into the pipeline,
//! and chain queries are proxied to the remote blockchain node.

use gw_02_messages::BxMessage;
use gw_03_btc_protocol::compact::CompactConversionResult;
use gw_03_btc_protocol::messages::{
    decode_block_txn, decode_inventory, decode_nonce, encode_empty_addr, encode_get_block_txn,
    encode_inventory, encode_nonce, encode_version, inventory_type, BtcBlockMessage,
    BtcCompactBlockMessage, InventoryVector,
};
use gw_03_btc_protocol::tx::parse_transaction;
use gw_03_btc_protocol::wire::{encode_btc_message, BtcCommand};
use gw_03_btc_protocol::CompactBlockConverter;
use gw_05_block_pipeline::config::BLOCKCHAIN_PING_INTERVAL_S;
use gw_05_block_pipeline::{BlockPipeline, GatewayContext};
use shared_types::{AlarmAction, ConnectionState, ConnectionRole, Sha256Hash};
use std::collections::HashMap;
use tracing::{debug, error, info, trace, warn};

type BtcHandler =
    fn(&mut BtcNodeProtocol, BtcCommand, Vec<u8>, &mut BlockPipeline, &mut dyn GatewayContext);

/// Protocol state machine for the local Bitcoin node connection.
pub struct BtcNodeProtocol {
    pub info: crate::domain::ConnectionInfo,
    handlers: HashMap<BtcCommand, BtcHandler>,
    magic: u32,
    compact: CompactBlockConverter,
    /// Compact-block recovery tickets by block hash.
    compact_tickets: HashMap<Sha256Hash, u64>,
    ping_nonce: u64,
}

impl BtcNodeProtocol {
    /// Builds the machine and enqueues the opening `version`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        info: crate::domain::ConnectionInfo,
        magic: u32,
        external_ip: [u8; 16],
        external_port: u16,
        peer_ip: [u8; 16],
        peer_port: u16,
        nonce: u64,
        ctx: &mut dyn GatewayContext,
    ) -> Self {
        let mut handlers = Self::base_handlers();
        handlers.extend(Self::node_handlers());
        let mut protocol = Self {
            info,
            handlers,
            magic,
            compact: CompactBlockConverter::new(magic),
            compact_tickets: HashMap::new(),
            ping_nonce: 0,
        };
        protocol.info.state = ConnectionState::Handshaking;
        let version = encode_version(
            external_ip,
            external_port,
            peer_ip,
            peer_port,
            nonce,
            "/bdn-gateway:0.1.0/",
            0,
        );
        protocol.send(ctx, BtcCommand::Version, &version);
        protocol
    }

    /// Handlers every Bitcoin-side connection carries.
    fn base_handlers() -> HashMap<BtcCommand, BtcHandler> {
        let mut handlers: HashMap<BtcCommand, BtcHandler> = HashMap::new();
        handlers.insert(BtcCommand::Ping, Self::msg_ping);
        handlers.insert(BtcCommand::Pong, Self::msg_pong);
        handlers.insert(BtcCommand::GetAddr, Self::msg_getaddr);
        handlers
    }

    /// Handlers installed for the local node connection specifically.
    fn node_handlers() -> HashMap<BtcCommand, BtcHandler> {
        let mut handlers: HashMap<BtcCommand, BtcHandler> = HashMap::new();
        handlers.insert(BtcCommand::Version, Self::msg_version);
        handlers.insert(BtcCommand::Inv, Self::msg_inv);
        handlers.insert(BtcCommand::Block, Self::msg_block);
        handlers.insert(BtcCommand::Tx, Self::msg_tx);
        handlers.insert(BtcCommand::CompactBlock, Self::msg_compact_block);
        handlers.insert(BtcCommand::BlockTxn, Self::msg_block_txn);
        handlers.insert(BtcCommand::GetBlocks, Self::msg_proxy_request);
        handlers.insert(BtcCommand::GetHeaders, Self::msg_proxy_request);
        handlers.insert(BtcCommand::GetData, Self::msg_proxy_request);
        handlers
    }

    /// Dispatches one decoded frame; commands without handlers are
    /// discarded.
    pub fn on_message(
        &mut self,
        command: BtcCommand,
        payload: Vec<u8>,
        pipeline: &mut BlockPipeline,
        ctx: &mut dyn GatewayContext,
    ) {
        match self.handlers.get(&command) {
            Some(handler) => handler(self, command, payload, pipeline, ctx),
            None => trace!(conn = %self.info.id, ?command, "no handler, discarding"),
        }
    }

    /// Ping alarm entry point.
    pub fn on_send_ping(&mut self, ctx: &mut dyn GatewayContext) {
        self.ping_nonce += 1;
        let payload = encode_nonce(self.ping_nonce);
        self.send(ctx, BtcCommand::Ping, &payload);
        ctx.schedule(
            std::time::Duration::from_secs(BLOCKCHAIN_PING_INTERVAL_S),
            AlarmAction::SendPing(self.info.id),
        );
    }

    fn send(&self, ctx: &mut dyn GatewayContext, command: BtcCommand, payload: &[u8]) {
        ctx.send_to_connection(self.info.id, encode_btc_message(self.magic, command, payload));
    }

    fn msg_version(
        &mut self,
        _command: BtcCommand,
        _payload: Vec<u8>,
        _pipeline: &mut BlockPipeline,
        ctx: &mut dyn GatewayContext,
    ) {
        // The gateway initiated, so no misbehavior checks: ack and go.
        self.info.state = ConnectionState::Established;
        self.send(ctx, BtcCommand::Verack, &[]);
        ctx.schedule(
            std::time::Duration::from_secs(BLOCKCHAIN_PING_INTERVAL_S),
            AlarmAction::SendPing(self.info.id),
        );
        ctx.on_blockchain_connection_established(self.info.id);
        info!(conn = %self.info.id, peer = %self.info.peer, "bitcoin node connection established");
    }

    fn msg_inv(
        &mut self,
        _command: BtcCommand,
        payload: Vec<u8>,
        _pipeline: &mut BlockPipeline,
        ctx: &mut dyn GatewayContext,
    ) {
        // The node is our only chain source; request everything it offers.
        match decode_inventory(&payload) {
            Ok(items) if !items.is_empty() => {
                debug!(conn = %self.info.id, count = items.len(), "inv, requesting all items");
                self.send(ctx, BtcCommand::GetData, &encode_inventory(&items));
            }
            Ok(_) => {}
            Err(err) => warn!(conn = %self.info.id, %err, "malformed inv"),
        }
    }

    fn msg_block(
        &mut self,
        _command: BtcCommand,
        payload: Vec<u8>,
        pipeline: &mut BlockPipeline,
        ctx: &mut dyn GatewayContext,
    ) {
        let block_msg = encode_btc_message(self.magic, BtcCommand::Block, &payload);
        let block = match BtcBlockMessage::parse(&block_msg) {
            Ok(block) => block,
            Err(err) => {
                warn!(conn = %self.info.id, %err, "malformed block message");
                return;
            }
        };
        let block_hash = block.block_hash();

        if pipeline.take_cleanup_mark(&block_hash) {
            trace!(conn = %self.info.id, %block_hash, "block marked for cleanup");
            self.clean_block_transactions(&block_msg, pipeline);
        } else {
            pipeline.queue_block_for_processing(block_hash, block_msg.clone(), self.info.id, ctx);
        }

        // Echo an inv so the node advances our synced-headers view;
        // otherwise it stops pushing compact blocks to the gateway.
        let echo = encode_inventory(&[InventoryVector {
            inv_type: inventory_type::MSG_BLOCK,
            hash: block_hash,
        }]);
        self.send(ctx, BtcCommand::Inv, &echo);
    }

    fn clean_block_transactions(&self, block_msg: &[u8], pipeline: &mut BlockPipeline) {
        let Ok(block) = BtcBlockMessage::parse(block_msg) else {
            return;
        };
        let mut offset = block.header_piece_len();
        let mut removed = 0usize;
        for _ in 0..block.txn_count() {
            let Ok(parsed) = parse_transaction(block_msg, offset) else {
                return;
            };
            if pipeline.tx_service.remove_transaction_by_hash(&parsed.txid) {
                removed += 1;
            }
            offset += parsed.size;
        }
        debug!(conn = %self.info.id, removed, "pruned transactions of confirmed block");
    }

    fn msg_tx(
        &mut self,
        _command: BtcCommand,
        payload: Vec<u8>,
        pipeline: &mut BlockPipeline,
        ctx: &mut dyn GatewayContext,
    ) {
        let parsed = match parse_transaction(&payload, 0) {
            Ok(parsed) => parsed,
            Err(err) => {
                warn!(conn = %self.info.id, %err, "malformed transaction from node");
                return;
            }
        };
        pipeline.stats.record(|c| c.tx_from_node += 1);
        if pipeline.tx_service.has_transaction_contents(&parsed.txid) {
            trace!(txid = %parsed.txid, "transaction from node already known");
            return;
        }
        pipeline
            .tx_service
            .set_transaction_contents(parsed.txid, payload.clone());
        pipeline.recovery.check_missing_tx_hash(&parsed.txid);
        ctx.broadcast(
            &BxMessage::Tx {
                tx_hash: parsed.txid,
                network_num: pipeline.config.network_num,
                short_id: shared_types::NULL_SHORT_ID,
                contents: payload,
            },
            None,
            ConnectionRole::RELAY_TRANSACTION,
            false,
        );
    }

    fn msg_compact_block(
        &mut self,
        _command: BtcCommand,
        payload: Vec<u8>,
        pipeline: &mut BlockPipeline,
        ctx: &mut dyn GatewayContext,
    ) {
        let compact = match BtcCompactBlockMessage::parse(&payload) {
            Ok(compact) => compact,
            Err(err) => {
                warn!(conn = %self.info.id, %err, "malformed compact block");
                return;
            }
        };
        let block_hash = compact.block_hash();
        if pipeline.blocks_seen.contains(&block_hash) {
            debug!(%block_hash, "ignoring compact block already seen");
            return;
        }

        match self
            .compact
            .compact_block_to_bx_block(&compact, &pipeline.tx_service)
        {
            Ok(CompactConversionResult::Complete {
                bx_block,
                block_info,
            }) => {
                info!(%block_hash, "compact block reconstructed from mempool");
                pipeline.broadcast_compressed_block(bx_block, &block_info, ctx);
            }
            Ok(CompactConversionResult::MissingTransactions {
                block_hash,
                recovery_ticket,
                missing_indices,
            }) => {
                debug!(
                    %block_hash,
                    missing = missing_indices.len(),
                    "compact block missing transactions, requesting"
                );
                self.compact_tickets.insert(block_hash, recovery_ticket);
                let request = encode_get_block_txn(&block_hash, &missing_indices);
                self.send(ctx, BtcCommand::GetBlockTxn, &request);
            }
            Err(err) => error!(%block_hash, %err, "compact block conversion failed"),
        }
    }

    fn msg_block_txn(
        &mut self,
        _command: BtcCommand,
        payload: Vec<u8>,
        pipeline: &mut BlockPipeline,
        ctx: &mut dyn GatewayContext,
    ) {
        let (block_hash, txns) = match decode_block_txn(&payload) {
            Ok(result) => result,
            Err(err) => {
                warn!(conn = %self.info.id, %err, "malformed blocktxn");
                return;
            }
        };
        let Some(ticket) = self.compact_tickets.remove(&block_hash) else {
            debug!(%block_hash, "blocktxn for unknown compact block");
            return;
        };
        match self
            .compact
            .recovered_compact_block_to_bx_block(ticket, txns, &pipeline.tx_service)
        {
            Ok(CompactConversionResult::Complete {
                bx_block,
                block_info,
            }) => {
                info!(%block_hash, "compact block completed after recovery");
                pipeline.broadcast_compressed_block(bx_block, &block_info, ctx);
            }
            Ok(CompactConversionResult::MissingTransactions { .. }) => {
                error!(%block_hash, "compact block still incomplete after blocktxn");
            }
            Err(err) => error!(%block_hash, %err, "compact block recovery failed"),
        }
    }

    fn msg_ping(
        &mut self,
        _command: BtcCommand,
        payload: Vec<u8>,
        _pipeline: &mut BlockPipeline,
        ctx: &mut dyn GatewayContext,
    ) {
        let nonce = decode_nonce(&payload);
        self.send(ctx, BtcCommand::Pong, &encode_nonce(nonce));
    }

    fn msg_pong(
        &mut self,
        _command: BtcCommand,
        _payload: Vec<u8>,
        _pipeline: &mut BlockPipeline,
        _ctx: &mut dyn GatewayContext,
    ) {
        // Nothing to do; receipt alone proves liveness.
    }

    fn msg_getaddr(
        &mut self,
        _command: BtcCommand,
        _payload: Vec<u8>,
        _pipeline: &mut BlockPipeline,
        ctx: &mut dyn GatewayContext,
    ) {
        // Reply with an empty address list to preserve peer privacy.
        self.send(ctx, BtcCommand::Addr, &encode_empty_addr());
    }

    fn msg_proxy_request(
        &mut self,
        command: BtcCommand,
        payload: Vec<u8>,
        _pipeline: &mut BlockPipeline,
        ctx: &mut dyn GatewayContext,
    ) {
        // Chain queries the gateway cannot answer go to the remote node.
        trace!(conn = %self.info.id, ?command, "proxying request to remote node");
        let message = encode_btc_message(self.magic, command, &payload);
        let _ = ctx.send_to_remote_blockchain_node(message);
    }
}
