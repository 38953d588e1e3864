//! A scripted context recording every interaction, shared by the unit
//! and integration tests.

use crate::ports::{GatewayContext, NodeSendResult};
use gw_02_messages::BxMessage;
use shared_types::{AlarmAction, AlarmId, ConnectionId, ConnectionRole};
use std::time::{Duration, Instant};

/// Records of calls made against [`ScriptedContext`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ContextEvent {
    Broadcast {
        msg: BxMessage,
        exclude: Option<ConnectionId>,
        role_bits_relay_block: bool,
        role_bits_relay_tx: bool,
        role_bits_gateway: bool,
        prepend: bool,
    },
    SentToNode(Vec<u8>),
    SentToRemoteNode(Vec<u8>),
    SentToConnection(ConnectionId, Vec<u8>),
    Scheduled(AlarmAction),
    Cancelled(AlarmId),
    MarkedForClose(ConnectionId),
}

/// Deterministic context for driving services in tests.
pub struct ScriptedContext {
    pub now: Instant,
    pub events: Vec<ContextEvent>,
    pub alarms: shared_types::AlarmQueue<AlarmAction>,
    pub broadcast_recipients: usize,
    pub node_connected: bool,
    pub node_ready: bool,
    pub remote_keys: Vec<(ConnectionId, [u8; 64])>,
}

impl Default for ScriptedContext {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedContext {
    pub fn new() -> Self {
        Self {
            now: Instant::now(),
            events: Vec::new(),
            alarms: shared_types::AlarmQueue::new(),
            broadcast_recipients: 2,
            node_connected: true,
            node_ready: true,
            remote_keys: Vec::new(),
        }
    }

    /// Advances the scripted clock and returns the alarms now due.
    pub fn advance(&mut self, delta: Duration) -> Vec<AlarmAction> {
        self.now += delta;
        self.alarms.fire_due(self.now)
    }

    pub fn broadcasts(&self) -> Vec<&BxMessage> {
        self.events
            .iter()
            .filter_map(|e| match e {
                ContextEvent::Broadcast { msg, .. } => Some(msg),
                _ => None,
            })
            .collect()
    }

    pub fn node_sends(&self) -> Vec<&Vec<u8>> {
        self.events
            .iter()
            .filter_map(|e| match e {
                ContextEvent::SentToNode(bytes) => Some(bytes),
                _ => None,
            })
            .collect()
    }
}

impl GatewayContext for ScriptedContext {
    fn now(&self) -> Instant {
        self.now
    }

    fn broadcast(
        &mut self,
        msg: &BxMessage,
        exclude: Option<ConnectionId>,
        role: ConnectionRole,
        prepend: bool,
    ) -> usize {
        self.events.push(ContextEvent::Broadcast {
            msg: msg.clone(),
            exclude,
            role_bits_relay_block: role.intersects(ConnectionRole::RELAY_BLOCK),
            role_bits_relay_tx: role.intersects(ConnectionRole::RELAY_TRANSACTION),
            role_bits_gateway: role.intersects(ConnectionRole::GATEWAY),
            prepend,
        });
        self.broadcast_recipients
    }

    fn send_to_blockchain_node(&mut self, bytes: Vec<u8>) -> NodeSendResult {
        if !self.node_ready {
            return NodeSendResult::NotReady;
        }
        self.events.push(ContextEvent::SentToNode(bytes));
        NodeSendResult::Sent
    }

    fn send_to_remote_blockchain_node(&mut self, bytes: Vec<u8>) -> NodeSendResult {
        self.events.push(ContextEvent::SentToRemoteNode(bytes));
        NodeSendResult::Sent
    }

    fn send_to_connection(&mut self, conn: ConnectionId, bytes: Vec<u8>) {
        self.events.push(ContextEvent::SentToConnection(conn, bytes));
    }

    fn schedule(&mut self, delay: Duration, action: AlarmAction) -> AlarmId {
        self.events.push(ContextEvent::Scheduled(action.clone()));
        self.alarms.register(self.now, delay, action)
    }

    fn cancel(&mut self, alarm: AlarmId) {
        self.events.push(ContextEvent::Cancelled(alarm));
        self.alarms.unregister(alarm);
    }

    fn has_blockchain_node_connection(&self) -> bool {
        self.node_connected
    }

    fn mark_for_close(&mut self, conn: ConnectionId) {
        self.events.push(ContextEvent::MarkedForClose(conn));
    }

    fn set_remote_public_key(&mut self, conn: ConnectionId, public_key: [u8; 64]) {
        self.remote_keys.push((conn, public_key));
    }
}
