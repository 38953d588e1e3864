//! The gateway node: one event loop owning every service.
//!
//! All protocol handlers and alarms run to completion on this loop; socket
//! tasks only frame and shuttle bytes. The loop reaches the outside world
//! exclusively through [`NodeShared`], the node's implementation of the
//! pipeline's capability context.

use gw_02_messages::{BxMessage, BxMessageType, BxMessageValidator};
use gw_03_btc_protocol::constants::{BTC_MAINNET_MAGIC, BTC_TESTNET_MAGIC};
use gw_03_btc_protocol::wire::BtcCommand;
use gw_04_eth_protocol::crypto_utils::public_key_from_raw;
use gw_04_eth_protocol::messages::EthMessage;
use gw_05_block_pipeline::{BlockPipeline, GatewayContext, NodeSendResult};
use gw_06_connections::{
    BtcNodeProtocol, ConnectionInfo, EthDiscoveryProtocol, EthNodeProtocol,
    RelayConnectionProtocol,
};
use k256::SecretKey;
use shared_types::{
    AlarmAction, AlarmId, AlarmQueue, ConnectionId, ConnectionRole, ConnectionState, GatewayError,
    Sha256Hash, ShortId,
};
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::{BlockchainProtocol, GatewayOpts};
use crate::io::{self, OutboundCmd};

/// Sweep cadence for the expiring caches.
const CACHE_SWEEP_INTERVAL_S: u64 = 30;

/// Cap on native messages parked while the node connection handshakes.
const NODE_MSG_QUEUE_LIMIT: usize = 128;

/// Bound of the blockchain node outbound channel.
const NODE_OUTBOUND_CAPACITY: usize = 256;

/// Bound of relay and auxiliary outbound channels.
const RELAY_OUTBOUND_CAPACITY: usize = 1024;

/// Upper bound on the reconnect backoff.
const RECONNECT_MAX_BACKOFF_S: u64 = 60;

/// Events delivered to the loop by connection tasks.
#[derive(Debug)]
pub enum NodeEvent {
    /// A decoded inbound frame.
    Frame {
        conn: ConnectionId,
        frame: InboundFrame,
    },
    /// A connection ended; `error` carries the fatal condition, if any.
    Closed {
        conn: ConnectionId,
        error: Option<GatewayError>,
    },
    /// Backoff elapsed; re-establish a peer.
    Reconnect(PeerKind, SocketAddr),
}

/// One decoded frame, tagged by transport.
#[derive(Debug)]
pub enum InboundFrame {
    Bx(BxMessageType, Vec<u8>),
    BxUnknown([u8; 12]),
    Btc(BtcCommand, Vec<u8>),
    BtcUnknown([u8; 12]),
    Eth(u64, Vec<u8>),
    Datagram(Vec<u8>),
}

/// The kinds of peers the node establishes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeerKind {
    Relay,
    BtcNode,
    EthDiscovery,
    EthNode,
    RemoteBlockchain,
}

/// Outbound handle of one peer; the channel is bounded, so a peer that
/// stops draining eventually sheds load instead of growing the queue.
struct OutboundSender(mpsc::Sender<OutboundCmd>);

impl OutboundSender {
    /// Sends a command; false when the channel is full or closed.
    fn send(&self, cmd: OutboundCmd) -> bool {
        self.0.try_send(cmd).is_ok()
    }
}

struct PeerHandle {
    role: ConnectionRole,
    state: ConnectionState,
    kind: PeerKind,
    addr: Option<SocketAddr>,
    sender: OutboundSender,
}

/// The loop-owned state reachable from services and protocol machines.
pub struct NodeShared {
    peers: HashMap<ConnectionId, PeerHandle>,
    pub alarms: AlarmQueue<AlarmAction>,
    node_conn: Option<ConnectionId>,
    node_established: bool,
    remote_node_conn: Option<ConnectionId>,
    node_msg_queue: VecDeque<Vec<u8>>,
    /// Public key learned from discovery, consumed when dialing RLPx.
    pub discovered_node_key: Option<[u8; 64]>,
    dump_dir: Option<PathBuf>,
}

impl NodeShared {
    fn new(dump_dir: Option<PathBuf>) -> Self {
        Self {
            peers: HashMap::new(),
            alarms: AlarmQueue::new(),
            node_conn: None,
            node_established: false,
            remote_node_conn: None,
            node_msg_queue: VecDeque::new(),
            discovered_node_key: None,
            dump_dir,
        }
    }

    /// Number of registered peers.
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }
}

impl GatewayContext for NodeShared {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn broadcast(
        &mut self,
        msg: &BxMessage,
        exclude: Option<ConnectionId>,
        role: ConnectionRole,
        prepend: bool,
    ) -> usize {
        let frame = msg.to_frame();
        let mut receivers = 0;
        for (conn, peer) in &self.peers {
            if Some(*conn) == exclude
                || !peer.role.intersects(role)
                || peer.state != ConnectionState::Established
            {
                continue;
            }
            if peer.sender.send(OutboundCmd::Data {
                bytes: frame.clone(),
                prepend,
            }) {
                receivers += 1;
            }
        }
        receivers
    }

    fn send_to_blockchain_node(&mut self, bytes: Vec<u8>) -> NodeSendResult {
        let Some(conn) = self.node_conn else {
            return NodeSendResult::NotReady;
        };
        if !self.node_established {
            // Connection exists but the handshake is still in flight; park a
            // bounded number of messages for the flush on establish.
            if self.node_msg_queue.len() >= NODE_MSG_QUEUE_LIMIT {
                return NodeSendResult::NotReady;
            }
            self.node_msg_queue.push_back(bytes);
            return NodeSendResult::Sent;
        }
        let Some(peer) = self.peers.get(&conn) else {
            return NodeSendResult::NotReady;
        };
        if peer.sender.send(OutboundCmd::Data {
            bytes,
            prepend: false,
        }) {
            NodeSendResult::Sent
        } else {
            NodeSendResult::NotReady
        }
    }

    fn send_to_remote_blockchain_node(&mut self, bytes: Vec<u8>) -> NodeSendResult {
        let Some(conn) = self.remote_node_conn else {
            debug!("no remote blockchain node, dropping proxied request");
            return NodeSendResult::NotReady;
        };
        match self.peers.get(&conn) {
            Some(peer)
                if peer.sender.send(OutboundCmd::Data {
                    bytes,
                    prepend: false,
                }) =>
            {
                NodeSendResult::Sent
            }
            _ => NodeSendResult::NotReady,
        }
    }

    fn send_to_connection(&mut self, conn: ConnectionId, bytes: Vec<u8>) {
        if let Some(peer) = self.peers.get(&conn) {
            peer.sender.send(OutboundCmd::Data {
                bytes,
                prepend: false,
            });
        }
    }

    fn schedule(&mut self, delay: Duration, action: AlarmAction) -> AlarmId {
        self.alarms.register(Instant::now(), delay, action)
    }

    fn cancel(&mut self, alarm: AlarmId) {
        self.alarms.unregister(alarm);
    }

    fn has_blockchain_node_connection(&self) -> bool {
        self.node_conn.is_some()
    }

    fn mark_for_close(&mut self, conn: ConnectionId) {
        if let Some(peer) = self.peers.get_mut(&conn) {
            peer.state = ConnectionState::Closing;
            peer.sender.send(OutboundCmd::Close);
        }
    }

    fn dump_short_id_mapping(&mut self, block_hash: &Sha256Hash, mapping: &[(ShortId, Sha256Hash)]) {
        let Some(dir) = &self.dump_dir else {
            return;
        };
        let entries: HashMap<String, String> = mapping
            .iter()
            .map(|(sid, hash)| (sid.to_string(), hash.to_hex()))
            .collect();
        let path = dir.join(block_hash.to_hex());
        if let Err(err) = std::fs::create_dir_all(dir)
            .and_then(|_| std::fs::write(&path, serde_json::to_vec_pretty(&entries).unwrap_or_default()))
        {
            warn!(%err, "failed to write short id mapping dump");
        }
    }

    fn on_blockchain_connection_established(&mut self, conn: ConnectionId) {
        if self.node_conn == Some(conn) {
            self.node_established = true;
            let queued: Vec<Vec<u8>> = self.node_msg_queue.drain(..).collect();
            if !queued.is_empty() {
                info!(count = queued.len(), "flushing messages queued for the node");
            }
            for bytes in queued {
                self.send_to_blockchain_node(bytes);
            }
        }
    }

    fn set_remote_public_key(&mut self, conn: ConnectionId, public_key: [u8; 64]) {
        info!(%conn, "learned blockchain node public key via discovery");
        self.discovered_node_key = Some(public_key);
    }
}

enum ProtocolState {
    Relay(RelayConnectionProtocol),
    Btc(BtcNodeProtocol),
    Eth(EthNodeProtocol),
    Discovery(EthDiscoveryProtocol),
}

impl ProtocolState {
    fn state(&self) -> ConnectionState {
        match self {
            Self::Relay(p) => p.info.state,
            Self::Btc(p) => p.info.state,
            Self::Eth(p) => p.info.state,
            Self::Discovery(p) => p.info.state,
        }
    }
}

/// The gateway node.
pub struct GatewayNode {
    pub pipeline: BlockPipeline,
    pub shared: NodeShared,
    protocols: HashMap<ConnectionId, ProtocolState>,
    events_tx: mpsc::UnboundedSender<NodeEvent>,
    events_rx: mpsc::UnboundedReceiver<NodeEvent>,
    opts: GatewayOpts,
    node_id: [u8; 16],
    eth_secret_key: SecretKey,
    genesis_hash: Sha256Hash,
    next_conn_id: u64,
    reconnect_attempts: HashMap<SocketAddr, u32>,
    magic: u32,
}

impl GatewayNode {
    /// Wires up the node from options; the pipeline's converter follows the
    /// configured blockchain protocol.
    pub fn new(opts: GatewayOpts, node_id: [u8; 16]) -> anyhow::Result<Self> {
        let magic = match opts.blockchain_network.as_str() {
            "testnet" => BTC_TESTNET_MAGIC,
            _ => BTC_MAINNET_MAGIC,
        };
        let converter: Box<dyn gw_02_messages::BlockConverter> = match opts.blockchain_protocol {
            BlockchainProtocol::Btc => {
                Box::new(gw_03_btc_protocol::BtcBlockConverter::new(magic))
            }
            BlockchainProtocol::Eth => Box::new(gw_04_eth_protocol::EthBlockConverter),
        };
        let pipeline = BlockPipeline::new(
            opts.pipeline_config(),
            converter,
            gw_01_tx_service::TxServiceConfig::default(),
        );
        let eth_secret_key = match &opts.eth_private_key {
            Some(hex) => parse_secret_key(hex)?,
            None => SecretKey::random(&mut rand::thread_rng()),
        };
        let genesis_hash = parse_genesis_hash(&opts)?;
        let dump_dir = opts
            .dump_short_id_mapping_compression
            .then(|| PathBuf::from(crate::cookie::COOKIE_DIR).join("short_id_mappings"));
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Ok(Self {
            pipeline,
            shared: NodeShared::new(dump_dir),
            protocols: HashMap::new(),
            events_tx,
            events_rx,
            opts,
            node_id,
            eth_secret_key,
            genesis_hash,
            next_conn_id: 0,
            reconnect_attempts: HashMap::new(),
            magic,
        })
    }

    /// Sender side of the node event channel (handed to I/O tasks).
    pub fn events_sender(&self) -> mpsc::UnboundedSender<NodeEvent> {
        self.events_tx.clone()
    }

    fn allocate_conn_id(&mut self) -> ConnectionId {
        self.next_conn_id += 1;
        ConnectionId(self.next_conn_id)
    }

    /// Registers a peer and returns its id; the caller attaches a protocol
    /// machine and spawns the I/O task.
    fn register_peer(
        &mut self,
        role: ConnectionRole,
        kind: PeerKind,
        addr: Option<SocketAddr>,
        sender: OutboundSender,
    ) -> ConnectionId {
        let conn = self.allocate_conn_id();
        self.shared.peers.insert(
            conn,
            PeerHandle {
                role,
                state: ConnectionState::Connecting,
                kind,
                addr,
                sender,
            },
        );
        conn
    }

    /// Connects a relay peer.
    pub fn connect_relay(&mut self, addr: SocketAddr) {
        let (tx, rx) = mpsc::channel(RELAY_OUTBOUND_CAPACITY);
        let conn = self.register_peer(
            ConnectionRole::RELAY_ALL,
            PeerKind::Relay,
            Some(addr),
            OutboundSender(tx),
        );
        let info = ConnectionInfo::new(conn, ConnectionRole::RELAY_ALL, addr.to_string());
        let protocol =
            RelayConnectionProtocol::new(info, self.opts.network_num, self.node_id, &mut self.shared);
        self.sync_peer_state(conn, protocol.info.state);
        self.protocols.insert(conn, ProtocolState::Relay(protocol));
        tokio::spawn(io::run_bx_connection(
            addr,
            conn,
            self.events_tx.clone(),
            rx,
            BxMessageValidator::default(),
        ));
        info!(%conn, %addr, "connecting relay peer");
    }

    /// Connects the local Bitcoin node.
    pub fn connect_btc_node(&mut self, addr: SocketAddr) {
        let (tx, rx) = mpsc::channel(NODE_OUTBOUND_CAPACITY);
        let conn = self.register_peer(
            ConnectionRole::BLOCKCHAIN_NODE,
            PeerKind::BtcNode,
            Some(addr),
            OutboundSender(tx),
        );
        self.shared.node_conn = Some(conn);
        self.shared.node_established = false;

        let info = ConnectionInfo::new(conn, ConnectionRole::BLOCKCHAIN_NODE, addr.to_string());
        let external_ip = ip_bytes(self.opts.external_ip_or_default());
        let peer_ip = ip_bytes(self.opts.blockchain_ip);
        let protocol = BtcNodeProtocol::new(
            info,
            self.magic,
            external_ip,
            self.opts.external_port,
            peer_ip,
            self.opts.blockchain_port,
            rand::random(),
            &mut self.shared,
        );
        self.sync_peer_state(conn, protocol.info.state);
        self.protocols.insert(conn, ProtocolState::Btc(protocol));
        tokio::spawn(io::run_btc_connection(
            addr,
            conn,
            self.events_tx.clone(),
            rx,
            self.magic,
            64 * 1024 * 1024,
        ));
        info!(%conn, %addr, "connecting bitcoin node");
    }

    /// Starts discovery to learn the Ethereum node's identity.
    pub fn connect_eth_discovery(&mut self, addr: SocketAddr) {
        let (tx, rx) = mpsc::channel(RELAY_OUTBOUND_CAPACITY);
        let conn = self.register_peer(
            ConnectionRole::BLOCKCHAIN_NODE,
            PeerKind::EthDiscovery,
            Some(addr),
            OutboundSender(tx),
        );
        let info = ConnectionInfo::new(conn, ConnectionRole::BLOCKCHAIN_NODE, addr.to_string());
        let local = gw_04_eth_protocol::discovery::Endpoint {
            ip: ip_list(self.opts.external_ip_or_default()),
            udp_port: self.opts.external_port,
            tcp_port: self.opts.external_port,
        };
        let remote = gw_04_eth_protocol::discovery::Endpoint {
            ip: ip_list(self.opts.blockchain_ip),
            udp_port: self.opts.blockchain_port,
            tcp_port: self.opts.blockchain_port,
        };
        match EthDiscoveryProtocol::new(
            info,
            self.eth_secret_key.clone(),
            local,
            remote,
            &mut self.shared,
        ) {
            Ok(protocol) => {
                self.protocols
                    .insert(conn, ProtocolState::Discovery(protocol));
                tokio::spawn(io::run_discovery_connection(
                    addr,
                    conn,
                    self.events_tx.clone(),
                    rx,
                ));
                info!(%conn, %addr, "starting ethereum discovery");
            }
            Err(err) => {
                error!(%err, "could not start discovery");
                self.shared.peers.remove(&conn);
            }
        }
    }

    /// Connects the local Ethereum node over RLPx.
    pub fn connect_eth_node(&mut self, addr: SocketAddr, remote_key: [u8; 64]) {
        let remote_public_key = match public_key_from_raw(&remote_key) {
            Ok(key) => key,
            Err(err) => {
                error!(%err, "invalid node public key");
                return;
            }
        };
        let (tx, rx) = mpsc::channel(NODE_OUTBOUND_CAPACITY);
        let conn = self.register_peer(
            ConnectionRole::BLOCKCHAIN_NODE,
            PeerKind::EthNode,
            Some(addr),
            OutboundSender(tx),
        );
        self.shared.node_conn = Some(conn);
        self.shared.node_established = false;

        let info = ConnectionInfo::new(conn, ConnectionRole::BLOCKCHAIN_NODE, addr.to_string());
        let protocol = EthNodeProtocol::new(
            info,
            self.opts.network_num as u64,
            self.genesis_hash,
            &mut self.shared,
        );
        self.sync_peer_state(conn, protocol.info.state);
        self.protocols.insert(conn, ProtocolState::Eth(protocol));

        let hello = EthMessage::gateway_hello(
            "bdn-gateway/0.1.0".into(),
            self.opts.external_port,
            gw_04_eth_protocol::crypto_utils::public_key_to_raw(
                &self.eth_secret_key.public_key(),
            )
            .to_vec(),
        )
        .to_frame_content();
        tokio::spawn(io::run_eth_connection(
            addr,
            conn,
            self.events_tx.clone(),
            rx,
            self.eth_secret_key.clone(),
            remote_public_key,
            hello,
        ));
        info!(%conn, %addr, "connecting ethereum node");
    }

    /// Connects the remote blockchain node used for proxied requests.
    pub fn connect_remote_blockchain(&mut self, addr: SocketAddr) {
        let (tx, rx) = mpsc::channel(RELAY_OUTBOUND_CAPACITY);
        let conn = self.register_peer(
            ConnectionRole::REMOTE_BLOCKCHAIN_NODE,
            PeerKind::RemoteBlockchain,
            Some(addr),
            OutboundSender(tx),
        );
        self.shared.remote_node_conn = Some(conn);
        if let Some(peer) = self.shared.peers.get_mut(&conn) {
            peer.state = ConnectionState::Established;
        }
        tokio::spawn(io::run_btc_connection(
            addr,
            conn,
            self.events_tx.clone(),
            rx,
            self.magic,
            64 * 1024 * 1024,
        ));
        info!(%conn, %addr, "connecting remote blockchain node");
    }

    /// Establishes all configured peers and arms the housekeeping alarms.
    pub fn start(&mut self) {
        self.shared.schedule(
            Duration::from_secs(CACHE_SWEEP_INTERVAL_S),
            AlarmAction::SweepCaches,
        );
        self.shared.schedule(
            Duration::from_secs(
                gw_05_block_pipeline::config::GATEWAY_TRANSACTION_STATS_INTERVAL_S,
            ),
            AlarmAction::StatsFlush,
        );

        let relays = self.opts.relay_peers.clone();
        for addr in relays {
            self.connect_relay(addr);
        }
        if let Some(addr) = self.opts.remote_blockchain_peer {
            self.connect_remote_blockchain(addr);
        }

        let node_addr = SocketAddr::new(self.opts.blockchain_ip, self.opts.blockchain_port);
        match self.opts.blockchain_protocol {
            BlockchainProtocol::Btc => self.connect_btc_node(node_addr),
            BlockchainProtocol::Eth => match configured_eth_key(&self.opts) {
                Some(key) => self.connect_eth_node(node_addr, key),
                None => self.connect_eth_discovery(node_addr),
            },
        }
    }

    /// Runs the event loop until the event channel closes.
    pub async fn run(mut self) {
        loop {
            let timeout = self
                .shared
                .alarms
                .next_deadline()
                .map(|deadline| deadline.saturating_duration_since(Instant::now()))
                .unwrap_or(Duration::from_secs(3600));
            tokio::select! {
                maybe_event = self.events_rx.recv() => match maybe_event {
                    Some(event) => self.handle_event(event),
                    None => break,
                },
                () = tokio::time::sleep(timeout) => {
                    for action in self.shared.alarms.fire_due(Instant::now()) {
                        self.on_alarm(action);
                    }
                }
            }
        }
    }

    /// Processes one node event (public so tests can drive the loop
    /// synchronously).
    pub fn handle_event(&mut self, event: NodeEvent) {
        match event {
            NodeEvent::Frame { conn, frame } => self.dispatch_frame(conn, frame),
            NodeEvent::Closed { conn, error } => self.handle_closed(conn, error),
            NodeEvent::Reconnect(kind, addr) => self.handle_reconnect(kind, addr),
        }
    }

    fn dispatch_frame(&mut self, conn: ConnectionId, frame: InboundFrame) {
        let Some(mut protocol) = self.protocols.remove(&conn) else {
            debug!(%conn, "frame for unknown connection");
            return;
        };
        match (&mut protocol, frame) {
            (ProtocolState::Relay(p), InboundFrame::Bx(msg_type, payload)) => {
                p.on_message(msg_type, &payload, &mut self.pipeline, &mut self.shared);
            }
            (ProtocolState::Relay(p), InboundFrame::BxUnknown(command)) => {
                debug!(conn = %p.info.id, ?command, "unknown overlay command, discarding");
            }
            (ProtocolState::Btc(p), InboundFrame::Btc(command, payload)) => {
                p.on_message(command, payload, &mut self.pipeline, &mut self.shared);
            }
            (ProtocolState::Btc(p), InboundFrame::BtcUnknown(command)) => {
                debug!(conn = %p.info.id, ?command, "unknown bitcoin command, discarding");
            }
            (ProtocolState::Eth(p), InboundFrame::Eth(msg_id, payload)) => {
                p.on_message(msg_id, &payload, &mut self.pipeline, &mut self.shared);
            }
            (ProtocolState::Discovery(p), InboundFrame::Datagram(datagram)) => {
                p.on_datagram(&datagram, &mut self.shared);
            }
            (_, frame) => {
                warn!(%conn, ?frame, "frame does not match connection transport");
            }
        }
        self.sync_peer_state(conn, protocol.state());
        self.protocols.insert(conn, protocol);
    }

    fn sync_peer_state(&mut self, conn: ConnectionId, state: ConnectionState) {
        if let Some(peer) = self.shared.peers.get_mut(&conn) {
            if peer.state != ConnectionState::Closing {
                peer.state = state;
            }
        }
    }

    fn handle_closed(&mut self, conn: ConnectionId, error: Option<GatewayError>) {
        let Some(peer) = self.shared.peers.remove(&conn) else {
            return;
        };
        let was_discovery_success = matches!(peer.kind, PeerKind::EthDiscovery)
            && self.shared.discovered_node_key.is_some();
        match &error {
            Some(err) => warn!(%conn, %err, "connection closed"),
            None => info!(%conn, "connection closed"),
        }
        self.protocols.remove(&conn);

        if self.shared.node_conn == Some(conn) {
            self.shared.node_conn = None;
            self.shared.node_established = false;
        }
        if self.shared.remote_node_conn == Some(conn) {
            self.shared.remote_node_conn = None;
        }

        if was_discovery_success {
            // Discovery finished its job; dial the node over RLPx.
            let key = self.shared.discovered_node_key.expect("checked above");
            let addr = SocketAddr::new(self.opts.blockchain_ip, self.opts.blockchain_port);
            self.connect_eth_node(addr, key);
            return;
        }

        // Schedule a reconnect with exponential backoff.
        let Some(addr) = peer.addr else {
            return;
        };
        let attempts = self.reconnect_attempts.entry(addr).or_insert(0);
        *attempts += 1;
        let backoff = Duration::from_secs((1u64 << (*attempts).min(6)).min(RECONNECT_MAX_BACKOFF_S));
        debug!(%addr, ?backoff, "scheduling reconnect");
        let events = self.events_tx.clone();
        let kind = peer.kind;
        tokio::spawn(async move {
            tokio::time::sleep(backoff).await;
            let _ = events.send(NodeEvent::Reconnect(kind, addr));
        });
    }

    fn handle_reconnect(&mut self, kind: PeerKind, addr: SocketAddr) {
        match kind {
            PeerKind::Relay => self.connect_relay(addr),
            PeerKind::BtcNode => self.connect_btc_node(addr),
            PeerKind::EthDiscovery => self.connect_eth_discovery(addr),
            PeerKind::EthNode => match self.shared.discovered_node_key {
                Some(key) => self.connect_eth_node(addr, key),
                None => self.connect_eth_discovery(addr),
            },
            PeerKind::RemoteBlockchain => self.connect_remote_blockchain(addr),
        }
    }

    fn on_alarm(&mut self, action: AlarmAction) {
        match action {
            AlarmAction::SendPing(conn) => self.with_protocol(conn, |protocol, _pipeline, shared| {
                match protocol {
                    ProtocolState::Relay(p) => p.on_send_ping(shared),
                    ProtocolState::Btc(p) => p.on_send_ping(shared),
                    ProtocolState::Eth(p) => p.on_send_ping(shared),
                    ProtocolState::Discovery(_) => {}
                }
            }),
            AlarmAction::HandshakeTimeout(conn) => {
                self.with_protocol(conn, |protocol, _pipeline, shared| {
                    if let ProtocolState::Relay(p) = protocol {
                        p.on_handshake_timeout(shared);
                    }
                })
            }
            AlarmAction::DiscoveryPongTimeout(conn) => {
                self.with_protocol(conn, |protocol, _pipeline, shared| {
                    if let ProtocolState::Discovery(p) = protocol {
                        p.on_pong_timeout(shared);
                    }
                })
            }
            AlarmAction::RequestBlockConfirmation(conn) => {
                self.with_protocol(conn, |protocol, pipeline, shared| {
                    if let ProtocolState::Eth(p) = protocol {
                        p.on_request_blocks_confirmation(pipeline, shared);
                    }
                })
            }
            AlarmAction::StopWaitingCheckpointHeaders(conn) => {
                self.with_protocol(conn, |protocol, _pipeline, _shared| {
                    if let ProtocolState::Eth(p) = protocol {
                        p.on_stop_waiting_checkpoint_headers();
                    }
                })
            }
            AlarmAction::SweepCaches => {
                self.pipeline
                    .on_alarm(AlarmAction::SweepCaches, &mut self.shared);
                self.shared.schedule(
                    Duration::from_secs(CACHE_SWEEP_INTERVAL_S),
                    AlarmAction::SweepCaches,
                );
            }
            AlarmAction::StatsFlush => {
                self.pipeline
                    .on_alarm(AlarmAction::StatsFlush, &mut self.shared);
                self.shared.schedule(
                    Duration::from_secs(
                        gw_05_block_pipeline::config::GATEWAY_TRANSACTION_STATS_INTERVAL_S,
                    ),
                    AlarmAction::StatsFlush,
                );
            }
            other => self.pipeline.on_alarm(other, &mut self.shared),
        }
    }

    fn with_protocol(
        &mut self,
        conn: ConnectionId,
        f: impl FnOnce(&mut ProtocolState, &mut BlockPipeline, &mut NodeShared),
    ) {
        let Some(mut protocol) = self.protocols.remove(&conn) else {
            return;
        };
        f(&mut protocol, &mut self.pipeline, &mut self.shared);
        self.sync_peer_state(conn, protocol.state());
        self.protocols.insert(conn, protocol);
    }
}

fn parse_secret_key(hex: &str) -> anyhow::Result<SecretKey> {
    let bytes = hex_decode(hex)?;
    SecretKey::from_slice(&bytes).map_err(|_| anyhow::anyhow!("invalid secp256k1 private key"))
}

/// The genesis hash is load-bearing for the eth status handshake, so a
/// missing or malformed value is a configuration error rather than a
/// default.
fn parse_genesis_hash(opts: &GatewayOpts) -> anyhow::Result<Sha256Hash> {
    match (&opts.blockchain_protocol, &opts.genesis_hash) {
        (BlockchainProtocol::Eth, Some(hex)) => {
            let bytes = hex_decode(hex)?;
            Sha256Hash::from_slice(&bytes)
                .ok_or_else(|| anyhow::anyhow!("genesis hash must be 32 bytes"))
        }
        (BlockchainProtocol::Eth, None) => {
            anyhow::bail!("--genesis-hash is required with --blockchain-protocol eth")
        }
        (BlockchainProtocol::Btc, Some(hex)) => {
            // Accepted for symmetry; the Bitcoin side never sends it.
            let bytes = hex_decode(hex)?;
            Sha256Hash::from_slice(&bytes)
                .ok_or_else(|| anyhow::anyhow!("genesis hash must be 32 bytes"))
        }
        (BlockchainProtocol::Btc, None) => Ok(Sha256Hash::default()),
    }
}

fn configured_eth_key(opts: &GatewayOpts) -> Option<[u8; 64]> {
    let hex = opts.eth_node_public_key.as_ref()?;
    let bytes = hex_decode(hex).ok()?;
    bytes.try_into().ok()
}

fn hex_decode(hex: &str) -> anyhow::Result<Vec<u8>> {
    let hex = hex.trim_start_matches("0x");
    if hex.len() % 2 != 0 {
        anyhow::bail!("odd-length hex string");
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&hex[i..i + 2], 16).map_err(|_| anyhow::anyhow!("bad hex digit"))
        })
        .collect()
}

fn ip_bytes(ip: std::net::IpAddr) -> [u8; 16] {
    match ip {
        std::net::IpAddr::V4(v4) => v4.to_ipv6_mapped().octets(),
        std::net::IpAddr::V6(v6) => v6.octets(),
    }
}

fn ip_list(ip: std::net::IpAddr) -> Vec<u8> {
    match ip {
        std::net::IpAddr::V4(v4) => v4.octets().to_vec(),
        std::net::IpAddr::V6(v6) => v6.octets().to_vec(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn opts() -> GatewayOpts {
        GatewayOpts::parse_from(["bdn-gateway"])
    }

    fn shared_with_peer(
        role: ConnectionRole,
        state: ConnectionState,
    ) -> (NodeShared, ConnectionId, mpsc::Receiver<OutboundCmd>) {
        let mut shared = NodeShared::new(None);
        let (tx, rx) = mpsc::channel(64);
        let conn = ConnectionId(1);
        shared.peers.insert(
            conn,
            PeerHandle {
                role,
                state,
                kind: PeerKind::Relay,
                addr: None,
                sender: OutboundSender(tx),
            },
        );
        (shared, conn, rx)
    }

    #[tokio::test]
    async fn test_broadcast_filters_by_role_and_state() {
        let (mut shared, _conn, mut rx) =
            shared_with_peer(ConnectionRole::RELAY_ALL, ConnectionState::Established);
        let msg = BxMessage::Ack;

        assert_eq!(
            shared.broadcast(&msg, None, ConnectionRole::RELAY_BLOCK, false),
            1
        );
        assert!(rx.try_recv().is_ok());

        // Role mismatch: gateway-only broadcast skips the relay.
        assert_eq!(shared.broadcast(&msg, None, ConnectionRole::GATEWAY, false), 0);

        // Excluded connection is skipped.
        assert_eq!(
            shared.broadcast(&msg, Some(ConnectionId(1)), ConnectionRole::RELAY_ALL, false),
            0
        );
    }

    #[tokio::test]
    async fn test_broadcast_skips_handshaking_peers() {
        let (mut shared, _conn, _rx) =
            shared_with_peer(ConnectionRole::RELAY_ALL, ConnectionState::Handshaking);
        assert_eq!(
            shared.broadcast(&BxMessage::Ack, None, ConnectionRole::RELAY_ALL, false),
            0
        );
    }

    #[tokio::test]
    async fn test_node_send_queues_until_established() {
        let mut shared = NodeShared::new(None);
        let (tx, mut rx) = mpsc::channel(64);
        let conn = ConnectionId(2);
        shared.peers.insert(
            conn,
            PeerHandle {
                role: ConnectionRole::BLOCKCHAIN_NODE,
                state: ConnectionState::Handshaking,
                kind: PeerKind::BtcNode,
                addr: None,
                sender: OutboundSender(tx),
            },
        );
        shared.node_conn = Some(conn);

        assert_eq!(
            shared.send_to_blockchain_node(vec![1]),
            NodeSendResult::Sent
        );
        assert!(rx.try_recv().is_err()); // parked, not written

        shared.on_blockchain_connection_established(conn);
        assert!(rx.try_recv().is_ok()); // flushed
        assert_eq!(
            shared.send_to_blockchain_node(vec![2]),
            NodeSendResult::Sent
        );
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_node_send_without_connection_is_not_ready() {
        let mut shared = NodeShared::new(None);
        assert_eq!(
            shared.send_to_blockchain_node(vec![1]),
            NodeSendResult::NotReady
        );
        assert!(!shared.has_blockchain_node_connection());
    }

    #[tokio::test]
    async fn test_mark_for_close_sends_close_command() {
        let (mut shared, conn, mut rx) =
            shared_with_peer(ConnectionRole::RELAY_ALL, ConnectionState::Established);
        shared.mark_for_close(conn);
        assert!(matches!(rx.try_recv(), Ok(OutboundCmd::Close)));
        assert_eq!(shared.peers.get(&conn).unwrap().state, ConnectionState::Closing);
    }

    #[tokio::test]
    async fn test_closed_connection_schedules_reconnect() {
        let mut node = GatewayNode::new(opts(), [1; 16]).unwrap();
        let (tx, _rx) = mpsc::channel(64);
        let addr: SocketAddr = "127.0.0.1:9999".parse().unwrap();
        let conn = node.register_peer(
            ConnectionRole::RELAY_ALL,
            PeerKind::Relay,
            Some(addr),
            OutboundSender(tx),
        );
        node.handle_event(NodeEvent::Closed {
            conn,
            error: Some(GatewayError::Io("reset".into())),
        });
        assert_eq!(node.shared.peer_count(), 0);
        assert_eq!(node.reconnect_attempts.get(&addr), Some(&1));
    }

    #[test]
    fn test_eth_requires_genesis_hash() {
        let eth_opts = GatewayOpts::parse_from([
            "bdn-gateway",
            "--blockchain-protocol",
            "eth",
        ]);
        assert!(GatewayNode::new(eth_opts, [1; 16]).is_err());

        let with_genesis = GatewayOpts::parse_from([
            "bdn-gateway",
            "--blockchain-protocol",
            "eth",
            "--genesis-hash",
            "d4e56740f876aef8c010b86a40d5f56745a118d0906a34e69aec8c0db1cb8fa3",
        ]);
        let node = GatewayNode::new(with_genesis, [1; 16]).unwrap();
        assert_eq!(
            node.genesis_hash.to_hex(),
            "d4e56740f876aef8c010b86a40d5f56745a118d0906a34e69aec8c0db1cb8fa3"
        );
    }

    #[test]
    fn test_genesis_hash_must_be_32_bytes() {
        let opts = GatewayOpts::parse_from([
            "bdn-gateway",
            "--blockchain-protocol",
            "eth",
            "--genesis-hash",
            "d4e5",
        ]);
        assert!(GatewayNode::new(opts, [1; 16]).is_err());
    }

    #[test]
    fn test_hex_decode() {
        assert_eq!(hex_decode("0x0aff").unwrap(), vec![0x0A, 0xFF]);
        assert!(hex_decode("abc").is_err());
        assert!(hex_decode("zz").is_err());
    }

    #[test]
    fn test_ip_bytes_v4_mapped() {
        let bytes = ip_bytes("1.2.3.4".parse().unwrap());
        assert_eq!(&bytes[12..], &[1, 2, 3, 4]);
    }
}
