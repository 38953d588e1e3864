//! Ethereum node connection protocol.
//!
//! Runs over the RLPx transport (the I/O task owns the cipher; this machine
//! sees decrypted frame content). Announced blocks arrive as separate header
//! and body responses that pair up in an expiring parts map before entering
//! the pipeline; chain-state queries the gateway cannot answer are proxied
//! to the remote blockchain node.

use gw_04_eth_protocol::block::{InternalEthBlock, NewBlockParts};
use gw_04_eth_protocol::constants::{
    CHECKPOINT_BLOCK_HEADERS_REQUEST_WAIT_TIME_S, ETH_PROTOCOL_VERSION, NEW_BLOCK_PARTS_MAX_WAIT_S,
    REQUESTED_NEW_BLOCK_BODIES_MAX_COUNT,
};
use gw_04_eth_protocol::crypto_utils::keccak256;
use gw_04_eth_protocol::messages::{message_id, EthMessage};
use gw_02_messages::BxMessage;
use gw_05_block_pipeline::{BlockPipeline, GatewayContext};
use shared_types::{AlarmAction, ConnectionRole, ConnectionState, ExpiringDict, Sha256Hash};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tracing::{debug, info, trace, warn};

use crate::domain::ConnectionInfo;

/// Cadence of the block-confirmation cleanup poll.
const BLOCK_CLEANUP_POLL_INTERVAL_S: u64 = 60;

/// Headers requested per confirmation poll.
const BLOCK_CONFIRMATION_HEADER_COUNT: u64 = 100;

/// Recently submitted blocks kept for serving header/body requests.
const RECENT_BLOCKS_KEPT: usize = 64;

type EthHandler = fn(&mut EthNodeProtocol, EthMessage, &mut BlockPipeline, &mut dyn GatewayContext);

/// Protocol state machine for the local Ethereum node connection.
pub struct EthNodeProtocol {
    pub info: ConnectionInfo,
    handlers: HashMap<u64, EthHandler>,
    network_id: u64,
    /// Announced blocks awaiting their header and body.
    pending_new_blocks: ExpiringDict<Sha256Hash, NewBlockParts>,
    /// Completed parts ready to submit, in completion order.
    ready_new_blocks: VecDeque<Sha256Hash>,
    /// Hash lists of outstanding body requests, oldest first.
    block_bodies_requests: VecDeque<Vec<Sha256Hash>>,
    /// Known total difficulties by block hash.
    total_difficulties: HashMap<Sha256Hash, u128>,
    /// Raw headers and bodies of recently submitted blocks.
    recent_headers: HashMap<Sha256Hash, Vec<u8>>,
    recent_bodies: HashMap<Sha256Hash, Vec<u8>>,
    recent_order: VecDeque<Sha256Hash>,
    waiting_checkpoint_headers_request: bool,
}

impl EthNodeProtocol {
    /// Builds the machine and enqueues the opening `status`.
    pub fn new(
        info: ConnectionInfo,
        network_id: u64,
        genesis_hash: Sha256Hash,
        ctx: &mut dyn GatewayContext,
    ) -> Self {
        let mut protocol = Self {
            info,
            handlers: Self::build_handlers(),
            network_id,
            pending_new_blocks: ExpiringDict::new(Duration::from_secs(NEW_BLOCK_PARTS_MAX_WAIT_S)),
            ready_new_blocks: VecDeque::new(),
            block_bodies_requests: VecDeque::new(),
            total_difficulties: HashMap::new(),
            recent_headers: HashMap::new(),
            recent_bodies: HashMap::new(),
            recent_order: VecDeque::new(),
            waiting_checkpoint_headers_request: true,
        };
        protocol.info.state = ConnectionState::Handshaking;
        let status = EthMessage::Status {
            protocol_version: ETH_PROTOCOL_VERSION,
            network_id,
            total_difficulty: vec![0],
            best_hash: genesis_hash,
            genesis_hash,
        };
        protocol.send(ctx, &status);
        protocol
    }

    fn build_handlers() -> HashMap<u64, EthHandler> {
        let mut handlers: HashMap<u64, EthHandler> = HashMap::new();
        handlers.insert(message_id::PING, Self::msg_ping);
        handlers.insert(message_id::PONG, Self::msg_pong);
        handlers.insert(message_id::DISCONNECT, Self::msg_disconnect);
        handlers.insert(message_id::STATUS, Self::msg_status);
        handlers.insert(message_id::TRANSACTIONS, Self::msg_tx);
        handlers.insert(message_id::GET_BLOCK_HEADERS, Self::msg_get_block_headers);
        handlers.insert(message_id::GET_BLOCK_BODIES, Self::msg_get_block_bodies);
        handlers.insert(message_id::GET_NODE_DATA, Self::msg_proxy_request);
        handlers.insert(message_id::GET_RECEIPTS, Self::msg_get_receipts);
        handlers.insert(message_id::BLOCK_HEADERS, Self::msg_block_headers);
        handlers.insert(message_id::NEW_BLOCK, Self::msg_block);
        handlers.insert(message_id::NEW_BLOCK_HASHES, Self::msg_new_block_hashes);
        handlers.insert(message_id::BLOCK_BODIES, Self::msg_block_bodies);
        handlers
    }

    /// Dispatches one decrypted frame.
    pub fn on_message(
        &mut self,
        msg_id: u64,
        payload: &[u8],
        pipeline: &mut BlockPipeline,
        ctx: &mut dyn GatewayContext,
    ) {
        let msg = match EthMessage::decode(msg_id, payload) {
            Ok(msg) => msg,
            Err(err) => {
                warn!(conn = %self.info.id, msg_id, %err, "malformed eth message, discarding");
                return;
            }
        };
        match self.handlers.get(&msg_id) {
            Some(handler) => handler(self, msg, pipeline, ctx),
            None => trace!(conn = %self.info.id, msg_id, "no handler, discarding"),
        }
    }

    /// Periodic block-confirmation poll; transient before the handshake
    /// finishes.
    pub fn on_request_blocks_confirmation(
        &mut self,
        _pipeline: &mut BlockPipeline,
        ctx: &mut dyn GatewayContext,
    ) {
        self.pending_new_blocks.sweep(ctx.now());
        if !self.info.is_established() {
            info!(
                conn = %self.info.id,
                "cannot request block confirmations, handshake not complete yet"
            );
        } else if let Some(oldest) = self.recent_order.front() {
            let request = EthMessage::GetBlockHeaders {
                start_hash: Some(*oldest),
                start_number: None,
                max_headers: BLOCK_CONFIRMATION_HEADER_COUNT,
                skip: 0,
                reverse: false,
            };
            self.send(ctx, &request);
        }
        ctx.schedule(
            Duration::from_secs(BLOCK_CLEANUP_POLL_INTERVAL_S),
            AlarmAction::RequestBlockConfirmation(self.info.id),
        );
    }

    /// Checkpoint grace alarm: header requests are served locally from now
    /// on.
    pub fn on_stop_waiting_checkpoint_headers(&mut self) {
        self.waiting_checkpoint_headers_request = false;
    }

    /// Ping alarm entry point.
    pub fn on_send_ping(&mut self, ctx: &mut dyn GatewayContext) {
        self.send(ctx, &EthMessage::Ping);
        ctx.schedule(
            Duration::from_secs(gw_04_eth_protocol::constants::PING_PONG_INTERVAL_SEC),
            AlarmAction::SendPing(self.info.id),
        );
    }

    fn send(&self, ctx: &mut dyn GatewayContext, msg: &EthMessage) {
        ctx.send_to_connection(self.info.id, msg.to_frame_content());
    }

    fn proxy(&self, ctx: &mut dyn GatewayContext, msg: &EthMessage) {
        let _ = ctx.send_to_remote_blockchain_node(msg.to_frame_content());
    }

    fn remember_block(&mut self, block_hash: Sha256Hash, block: &InternalEthBlock) {
        let mut body = rlp::RlpStream::new_list(2);
        let mut txs = rlp::RlpStream::new_list(block.transactions.len());
        for tx in &block.transactions {
            txs.append_raw(tx, 1);
        }
        body.append_raw(&txs.out(), 1);
        body.append_raw(&block.uncles, 1);

        self.recent_headers.insert(block_hash, block.header.clone());
        self.recent_bodies.insert(block_hash, body.out().to_vec());
        self.recent_order.push_back(block_hash);
        while self.recent_order.len() > RECENT_BLOCKS_KEPT {
            if let Some(old) = self.recent_order.pop_front() {
                self.recent_headers.remove(&old);
                self.recent_bodies.remove(&old);
            }
        }
    }

    fn msg_status(
        &mut self,
        _msg: EthMessage,
        _pipeline: &mut BlockPipeline,
        ctx: &mut dyn GatewayContext,
    ) {
        self.info.state = ConnectionState::Established;
        self.send(ctx, &EthMessage::Ping);
        ctx.on_blockchain_connection_established(self.info.id);
        ctx.schedule(
            Duration::from_secs(CHECKPOINT_BLOCK_HEADERS_REQUEST_WAIT_TIME_S),
            AlarmAction::StopWaitingCheckpointHeaders(self.info.id),
        );
        ctx.schedule(
            Duration::from_secs(BLOCK_CLEANUP_POLL_INTERVAL_S),
            AlarmAction::RequestBlockConfirmation(self.info.id),
        );
        ctx.schedule(
            Duration::from_secs(gw_04_eth_protocol::constants::PING_PONG_INTERVAL_SEC),
            AlarmAction::SendPing(self.info.id),
        );
        info!(
            conn = %self.info.id,
            peer = %self.info.peer,
            network = self.network_id,
            "ethereum node connection established"
        );
    }

    fn msg_ping(
        &mut self,
        _msg: EthMessage,
        _pipeline: &mut BlockPipeline,
        ctx: &mut dyn GatewayContext,
    ) {
        self.send(ctx, &EthMessage::Pong);
    }

    fn msg_pong(
        &mut self,
        _msg: EthMessage,
        _pipeline: &mut BlockPipeline,
        _ctx: &mut dyn GatewayContext,
    ) {
    }

    fn msg_disconnect(
        &mut self,
        msg: EthMessage,
        _pipeline: &mut BlockPipeline,
        ctx: &mut dyn GatewayContext,
    ) {
        let EthMessage::Disconnect { reason } = msg else {
            return;
        };
        info!(conn = %self.info.id, reason, "node requested disconnect");
        ctx.mark_for_close(self.info.id);
    }

    fn msg_tx(
        &mut self,
        msg: EthMessage,
        pipeline: &mut BlockPipeline,
        ctx: &mut dyn GatewayContext,
    ) {
        let EthMessage::Transactions(items) = msg else {
            return;
        };
        for item in items {
            let tx_hash = Sha256Hash::new(keccak256(&item));
            pipeline.stats.record(|c| c.tx_from_node += 1);
            if pipeline.tx_service.has_transaction_contents(&tx_hash) {
                continue;
            }
            pipeline
                .tx_service
                .set_transaction_contents(tx_hash, item.clone());
            pipeline.recovery.check_missing_tx_hash(&tx_hash);
            ctx.broadcast(
                &BxMessage::Tx {
                    tx_hash,
                    network_num: pipeline.config.network_num,
                    short_id: shared_types::NULL_SHORT_ID,
                    contents: item,
                },
                None,
                ConnectionRole::RELAY_TRANSACTION,
                false,
            );
        }
    }

    fn msg_block(
        &mut self,
        msg: EthMessage,
        pipeline: &mut BlockPipeline,
        ctx: &mut dyn GatewayContext,
    ) {
        let EthMessage::NewBlock {
            block,
            total_difficulty,
        } = msg
        else {
            return;
        };
        let internal = match InternalEthBlock::from_new_block(&block, total_difficulty) {
            Ok(internal) => internal,
            Err(err) => {
                warn!(conn = %self.info.id, %err, "malformed new block");
                return;
            }
        };
        let block_hash = internal.block_hash();
        self.total_difficulties.insert(block_hash, total_difficulty);
        self.remember_block(block_hash, &internal);

        // The node clearly has this block; release anything queued for it.
        pipeline
            .queuing
            .mark_blocks_seen_by_blockchain_node(&[block_hash], ctx);
        pipeline.queue_block_for_processing(
            block_hash,
            internal.encode_payload(),
            self.info.id,
            ctx,
        );
    }

    fn msg_new_block_hashes(
        &mut self,
        msg: EthMessage,
        pipeline: &mut BlockPipeline,
        ctx: &mut dyn GatewayContext,
    ) {
        let EthMessage::NewBlockHashes(pairs) = msg else {
            return;
        };
        let mut wanted = Vec::new();
        for (block_hash, number) in pairs {
            if pipeline.blocks_seen.contains(&block_hash) {
                pipeline
                    .queuing
                    .mark_blocks_seen_by_blockchain_node(&[block_hash], ctx);
                debug!(%block_hash, "announced block already seen");
                continue;
            }
            pipeline
                .queuing
                .mark_blocks_seen_by_blockchain_node(&[block_hash], ctx);
            wanted.push((block_hash, number));
        }
        if wanted.is_empty() {
            return;
        }

        for (block_hash, number) in &wanted {
            self.pending_new_blocks.insert(
                *block_hash,
                NewBlockParts::announced(*number),
                ctx.now(),
            );
            self.send(
                ctx,
                &EthMessage::GetBlockHeaders {
                    start_hash: Some(*block_hash),
                    start_number: None,
                    max_headers: 1,
                    skip: 0,
                    reverse: false,
                },
            );
        }
        self.request_block_bodies(wanted.iter().map(|(hash, _)| *hash).collect(), ctx);
    }

    fn request_block_bodies(&mut self, hashes: Vec<Sha256Hash>, ctx: &mut dyn GatewayContext) {
        self.send(ctx, &EthMessage::GetBlockBodies(hashes.clone()));
        self.block_bodies_requests.push_back(hashes);
        while self.block_bodies_requests.len() > REQUESTED_NEW_BLOCK_BODIES_MAX_COUNT {
            self.block_bodies_requests.pop_front();
        }
    }

    fn msg_get_block_headers(
        &mut self,
        msg: EthMessage,
        _pipeline: &mut BlockPipeline,
        ctx: &mut dyn GatewayContext,
    ) {
        let EthMessage::GetBlockHeaders {
            start_hash,
            max_headers,
            ..
        } = &msg
        else {
            return;
        };
        if self.waiting_checkpoint_headers_request {
            self.proxy(ctx, &msg);
            return;
        }
        if let Some(start_hash) = start_hash {
            if *max_headers == 1 {
                if let Some(header) = self.recent_headers.get(start_hash) {
                    trace!(conn = %self.info.id, %start_hash, "serving header locally");
                    self.send(ctx, &EthMessage::BlockHeaders(vec![header.clone()]));
                    return;
                }
            }
        }
        self.proxy(ctx, &msg);
    }

    fn msg_get_block_bodies(
        &mut self,
        msg: EthMessage,
        _pipeline: &mut BlockPipeline,
        ctx: &mut dyn GatewayContext,
    ) {
        let EthMessage::GetBlockBodies(hashes) = &msg else {
            return;
        };
        let local: Option<Vec<Vec<u8>>> = hashes
            .iter()
            .map(|hash| self.recent_bodies.get(hash).cloned())
            .collect();
        match local {
            Some(bodies) if !bodies.is_empty() => {
                trace!(conn = %self.info.id, count = bodies.len(), "serving bodies locally");
                self.send(ctx, &EthMessage::BlockBodies(bodies));
            }
            _ => {
                debug!(conn = %self.info.id, count = hashes.len(), "proxying body request");
                self.proxy(ctx, &msg);
            }
        }
    }

    fn msg_get_receipts(
        &mut self,
        msg: EthMessage,
        _pipeline: &mut BlockPipeline,
        ctx: &mut dyn GatewayContext,
    ) {
        if let EthMessage::Raw { payload, .. } = &msg {
            debug!(conn = %self.info.id, bytes = payload.len(), "proxying receipts request");
        }
        self.proxy(ctx, &msg);
    }

    fn msg_proxy_request(
        &mut self,
        msg: EthMessage,
        _pipeline: &mut BlockPipeline,
        ctx: &mut dyn GatewayContext,
    ) {
        self.proxy(ctx, &msg);
    }

    fn msg_block_headers(
        &mut self,
        msg: EthMessage,
        pipeline: &mut BlockPipeline,
        ctx: &mut dyn GatewayContext,
    ) {
        let EthMessage::BlockHeaders(headers) = msg else {
            return;
        };
        if !self.pending_new_blocks.is_empty() && headers.len() == 1 {
            let header = &headers[0];
            let block_hash = Sha256Hash::new(keccak256(header));
            if let Some(parts) = self.pending_new_blocks.get_mut(&block_hash) {
                debug!(%block_hash, "received header for announced block");
                parts.header = Some(header.clone());
                self.check_pending_new_block(&block_hash);
                self.process_ready_new_blocks(pipeline, ctx);
                return;
            }
        }

        if headers.is_empty() {
            return;
        }
        // A confirmation response: these blocks are on the node's chain.
        let mut confirmed = Vec::with_capacity(headers.len() + 1);
        if let Ok(parent) = rlp::Rlp::new(&headers[0]).val_at::<Vec<u8>>(0) {
            if let Some(parent_hash) = Sha256Hash::from_slice(&parent) {
                confirmed.push(parent_hash);
            }
        }
        for header in &headers {
            confirmed.push(Sha256Hash::new(keccak256(header)));
        }
        pipeline
            .queuing
            .mark_blocks_seen_by_blockchain_node(&confirmed, ctx);
    }

    fn msg_block_bodies(
        &mut self,
        msg: EthMessage,
        pipeline: &mut BlockPipeline,
        ctx: &mut dyn GatewayContext,
    ) {
        let EthMessage::BlockBodies(bodies) = msg else {
            return;
        };
        let Some(requested) = self.block_bodies_requests.pop_front() else {
            trace!(conn = %self.info.id, "unsolicited block bodies");
            return;
        };
        if requested.len() != bodies.len() {
            debug!(
                expected = requested.len(),
                received = bodies.len(),
                "body count mismatch, dropping outstanding requests"
            );
            self.block_bodies_requests.clear();
            return;
        }

        for (block_hash, body) in requested.into_iter().zip(bodies) {
            if let Some(parts) = self.pending_new_blocks.get_mut(&block_hash) {
                debug!(%block_hash, "received body for announced block");
                parts.body = Some(body);
                self.check_pending_new_block(&block_hash);
            } else {
                warn!(%block_hash, "body for block not in the pending set");
            }
        }
        self.process_ready_new_blocks(pipeline, ctx);
    }

    fn check_pending_new_block(&mut self, block_hash: &Sha256Hash) {
        if let Some(parts) = self.pending_new_blocks.get(block_hash) {
            if parts.is_complete() {
                self.ready_new_blocks.push_back(*block_hash);
            }
        }
    }

    fn process_ready_new_blocks(
        &mut self,
        pipeline: &mut BlockPipeline,
        ctx: &mut dyn GatewayContext,
    ) {
        while let Some(block_hash) = self.ready_new_blocks.pop_front() {
            let Some(parts) = self.pending_new_blocks.remove(&block_hash) else {
                continue;
            };
            let total_difficulty = self.try_calculate_total_difficulty(&parts);
            let internal = match InternalEthBlock::from_new_block_parts(&parts, total_difficulty) {
                Ok(internal) => internal,
                Err(err) => {
                    warn!(%block_hash, %err, "could not assemble announced block");
                    continue;
                }
            };
            self.total_difficulties.insert(block_hash, total_difficulty);
            self.remember_block(block_hash, &internal);
            pipeline.queue_block_for_processing(
                block_hash,
                internal.encode_payload(),
                self.info.id,
                ctx,
            );
        }
    }

    /// Total difficulty of an assembled block, when the parent's is known;
    /// zero otherwise.
    fn try_calculate_total_difficulty(&self, parts: &NewBlockParts) -> u128 {
        let Some(header) = &parts.header else {
            return 0;
        };
        let header_rlp = rlp::Rlp::new(header);
        let parent: Option<Sha256Hash> = header_rlp
            .val_at::<Vec<u8>>(0)
            .ok()
            .and_then(|bytes| Sha256Hash::from_slice(&bytes));
        let difficulty: u128 = header_rlp.val_at(7).unwrap_or(0);
        match parent.and_then(|p| self.total_difficulties.get(&p)) {
            Some(parent_td) => parent_td + difficulty,
            None => 0,
        }
    }
}
