//! Outbound port: the capability interface services use to reach the rest
//! of the node.
//!
//! Connections and services never hold the node; the event loop passes a
//! context borrow into every call. This keeps ownership acyclic and makes
//! every service testable against a scripted context.

use gw_02_messages::BxMessage;
use shared_types::{AlarmAction, AlarmId, ConnectionId, ConnectionRole, Sha256Hash, ShortId};
use std::time::{Duration, Instant};

/// Outcome of pushing bytes toward the blockchain node.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeSendResult {
    /// Queued on the node connection.
    Sent,
    /// The node's outbound queue is full or no connection exists; retry
    /// after the readiness interval.
    NotReady,
}

/// Node capabilities exposed to services and connection protocols.
pub trait GatewayContext {
    /// Current time; injected so services stay deterministic under test.
    fn now(&self) -> Instant;

    /// Broadcasts an overlay message to peers whose role intersects `role`,
    /// optionally excluding the originating connection. `prepend` jumps the
    /// outbound queues. Returns the number of receiving connections.
    fn broadcast(
        &mut self,
        msg: &BxMessage,
        exclude: Option<ConnectionId>,
        role: ConnectionRole,
        prepend: bool,
    ) -> usize;

    /// Sends native wire bytes to the local blockchain node.
    fn send_to_blockchain_node(&mut self, bytes: Vec<u8>) -> NodeSendResult;

    /// Sends native wire bytes to the remote blockchain node (proxied
    /// requests).
    fn send_to_remote_blockchain_node(&mut self, bytes: Vec<u8>) -> NodeSendResult;

    /// Sends raw bytes to one connection.
    fn send_to_connection(&mut self, conn: ConnectionId, bytes: Vec<u8>);

    /// Schedules an alarm action.
    fn schedule(&mut self, delay: Duration, action: AlarmAction) -> AlarmId;

    /// Cancels a scheduled alarm (idempotent).
    fn cancel(&mut self, alarm: AlarmId);

    /// True while a blockchain node connection is established.
    fn has_blockchain_node_connection(&self) -> bool;

    /// Marks a connection for close; pending writes drain first.
    fn mark_for_close(&mut self, conn: ConnectionId);

    /// Hook for the short-id mapping dump; the runtime writes the file.
    fn dump_short_id_mapping(&mut self, _block_hash: &Sha256Hash, _mapping: &[(ShortId, Sha256Hash)]) {}

    /// Notifies the node that the blockchain connection finished its
    /// handshake; queued native messages flush here.
    fn on_blockchain_connection_established(&mut self, _conn: ConnectionId) {}

    /// Records a peer's public key learned through discovery.
    fn set_remote_public_key(&mut self, _conn: ConnectionId, _public_key: [u8; 64]) {}
}
