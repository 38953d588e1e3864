//! Socket I/O tasks.
//!
//! Each connection runs as one tokio task that exclusively owns its socket,
//! framing buffers, and (for RLPx) cipher state. Decoded frames flow to the
//! event loop over the node event channel; outbound bytes arrive over a
//! per-connection command channel. A framing error is fatal for the
//! connection only.

use gw_02_messages::framing::RawBxFrame;
use gw_02_messages::{BxFrameDecoder, BxMessageValidator};
use gw_03_btc_protocol::wire::RawBtcFrame;
use gw_03_btc_protocol::BtcFrameDecoder;
use gw_04_eth_protocol::rlp_utils::rlp_item_len;
use gw_04_eth_protocol::rlpx::{RlpxFrameCodec, RlpxHandshake};
use k256::{PublicKey, SecretKey};
use shared_types::{ConnectionId, GatewayError};
use std::collections::VecDeque;
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::node::{InboundFrame, NodeEvent};

/// Commands the event loop sends to a connection task.
#[derive(Debug)]
pub enum OutboundCmd {
    /// Write bytes; `prepend` jumps any backlog.
    Data { bytes: Vec<u8>, prepend: bool },
    /// Drain pending writes, then release the socket.
    Close,
}

fn notify_closed(
    events: &mpsc::UnboundedSender<NodeEvent>,
    conn: ConnectionId,
    error: Option<GatewayError>,
) {
    let _ = events.send(NodeEvent::Closed { conn, error });
}

/// Writer half shared by the TCP connection tasks: drains the command
/// channel into a deque (honoring prepend) and writes front-first.
async fn write_loop(mut socket: OwnedWriteHalf, mut rx: mpsc::Receiver<OutboundCmd>) {
    let mut queue: VecDeque<Vec<u8>> = VecDeque::new();
    let mut closing = false;
    loop {
        while let Ok(cmd) = rx.try_recv() {
            match cmd {
                OutboundCmd::Data { bytes, prepend } => {
                    if prepend {
                        queue.push_front(bytes);
                    } else {
                        queue.push_back(bytes);
                    }
                }
                OutboundCmd::Close => closing = true,
            }
        }
        if let Some(bytes) = queue.pop_front() {
            if socket.write_all(&bytes).await.is_err() {
                return;
            }
            continue;
        }
        if closing {
            let _ = socket.shutdown().await;
            return;
        }
        match rx.recv().await {
            Some(OutboundCmd::Data { bytes, prepend }) => {
                if prepend {
                    queue.push_front(bytes);
                } else {
                    queue.push_back(bytes);
                }
            }
            Some(OutboundCmd::Close) => closing = true,
            None => {
                let _ = socket.shutdown().await;
                return;
            }
        }
    }
}

/// Runs one overlay (relay/gateway) connection.
pub async fn run_bx_connection(
    addr: SocketAddr,
    conn: ConnectionId,
    events: mpsc::UnboundedSender<NodeEvent>,
    outbound: mpsc::Receiver<OutboundCmd>,
    validator: BxMessageValidator,
) {
    let stream = match TcpStream::connect(addr).await {
        Ok(stream) => stream,
        Err(err) => {
            notify_closed(&events, conn, Some(GatewayError::Io(err.to_string())));
            return;
        }
    };
    let (mut read_half, write_half) = stream.into_split();
    let writer = tokio::spawn(write_loop(write_half, outbound));

    let mut decoder = BxFrameDecoder::new(validator);
    let mut buf = vec![0u8; 64 * 1024];
    let error = 'read: loop {
        match read_half.read(&mut buf).await {
            Ok(0) => break 'read None,
            Ok(n) => {
                decoder.feed(&buf[..n]);
                loop {
                    match decoder.next_frame() {
                        Ok(Some(RawBxFrame::Message(msg_type, payload))) => {
                            let _ = events.send(NodeEvent::Frame {
                                conn,
                                frame: InboundFrame::Bx(msg_type, payload),
                            });
                        }
                        Ok(Some(RawBxFrame::Unknown(command))) => {
                            let _ = events.send(NodeEvent::Frame {
                                conn,
                                frame: InboundFrame::BxUnknown(command),
                            });
                        }
                        Ok(None) => break,
                        Err(err) => break 'read Some(err),
                    }
                }
            }
            Err(err) => break 'read Some(GatewayError::Io(err.to_string())),
        }
    };
    writer.abort();
    notify_closed(&events, conn, error);
}

/// Runs the Bitcoin node connection.
pub async fn run_btc_connection(
    addr: SocketAddr,
    conn: ConnectionId,
    events: mpsc::UnboundedSender<NodeEvent>,
    outbound: mpsc::Receiver<OutboundCmd>,
    magic: u32,
    max_payload: usize,
) {
    let stream = match TcpStream::connect(addr).await {
        Ok(stream) => stream,
        Err(err) => {
            notify_closed(&events, conn, Some(GatewayError::Io(err.to_string())));
            return;
        }
    };
    let (mut read_half, write_half) = stream.into_split();
    let writer = tokio::spawn(write_loop(write_half, outbound));

    let mut decoder = BtcFrameDecoder::new(magic, max_payload);
    let mut buf = vec![0u8; 64 * 1024];
    let error = 'read: loop {
        match read_half.read(&mut buf).await {
            Ok(0) => break 'read None,
            Ok(n) => {
                decoder.feed(&buf[..n]);
                loop {
                    match decoder.next_frame() {
                        Ok(Some(RawBtcFrame::Message(command, payload))) => {
                            let _ = events.send(NodeEvent::Frame {
                                conn,
                                frame: InboundFrame::Btc(command, payload),
                            });
                        }
                        Ok(Some(RawBtcFrame::Unknown(command))) => {
                            let _ = events.send(NodeEvent::Frame {
                                conn,
                                frame: InboundFrame::BtcUnknown(command),
                            });
                        }
                        Ok(None) => break,
                        Err(err) => break 'read Some(err),
                    }
                }
            }
            Err(err) => break 'read Some(GatewayError::Io(err.to_string())),
        }
    };
    writer.abort();
    notify_closed(&events, conn, error);
}

/// Runs the Ethereum node connection: ECIES handshake, devp2p hello, then
/// framed traffic. The cipher state never leaves this task.
pub async fn run_eth_connection(
    addr: SocketAddr,
    conn: ConnectionId,
    events: mpsc::UnboundedSender<NodeEvent>,
    mut outbound: mpsc::Receiver<OutboundCmd>,
    secret_key: SecretKey,
    remote_public_key: PublicKey,
    hello_content: Vec<u8>,
) {
    let mut stream = match TcpStream::connect(addr).await {
        Ok(stream) => stream,
        Err(err) => {
            notify_closed(&events, conn, Some(GatewayError::Io(err.to_string())));
            return;
        }
    };

    // ECIES handshake: auth out, size-prefixed ack back.
    let mut handshake = RlpxHandshake::new_initiator(secret_key, remote_public_key);
    let mut codec = match eth_handshake(&mut stream, &mut handshake).await {
        Ok(codec) => codec,
        Err(err) => {
            notify_closed(&events, conn, Some(err));
            return;
        }
    };

    // devp2p hello before any subprotocol traffic.
    let hello = match codec.seal_content(&hello_content) {
        Ok(frame) => frame,
        Err(err) => {
            notify_closed(&events, conn, Some(err));
            return;
        }
    };
    if stream.write_all(&hello).await.is_err() {
        notify_closed(&events, conn, Some(GatewayError::Io("hello write".into())));
        return;
    }

    let mut queue: VecDeque<Vec<u8>> = VecDeque::new();
    let mut closing = false;
    let mut buf = vec![0u8; 64 * 1024];
    let error = 'main: loop {
        if let Some(content) = queue.pop_front() {
            match codec.seal_content(&content) {
                Ok(frame) => {
                    if stream.write_all(&frame).await.is_err() {
                        break 'main Some(GatewayError::Io("frame write".into()));
                    }
                }
                Err(err) => break 'main Some(err),
            }
            continue;
        }
        if closing {
            let _ = stream.shutdown().await;
            break 'main None;
        }
        tokio::select! {
            read = stream.read(&mut buf) => match read {
                Ok(0) => break 'main None,
                Ok(n) => {
                    codec.feed(&buf[..n]);
                    loop {
                        match codec.next_message() {
                            Ok(Some((msg_id, payload))) => {
                                let _ = events.send(NodeEvent::Frame {
                                    conn,
                                    frame: InboundFrame::Eth(msg_id, payload),
                                });
                            }
                            Ok(None) => break,
                            Err(err) => break 'main Some(err),
                        }
                    }
                }
                Err(err) => break 'main Some(GatewayError::Io(err.to_string())),
            },
            cmd = outbound.recv() => match cmd {
                Some(OutboundCmd::Data { bytes, prepend }) => {
                    if prepend {
                        queue.push_front(bytes);
                    } else {
                        queue.push_back(bytes);
                    }
                }
                Some(OutboundCmd::Close) => closing = true,
                None => closing = true,
            },
        }
    };
    notify_closed(&events, conn, error);
}

async fn eth_handshake(
    stream: &mut TcpStream,
    handshake: &mut RlpxHandshake,
) -> Result<RlpxFrameCodec, GatewayError> {
    let auth = handshake.create_auth()?;
    stream
        .write_all(&auth)
        .await
        .map_err(|err| GatewayError::Io(err.to_string()))?;

    let mut prefix = [0u8; 2];
    stream
        .read_exact(&mut prefix)
        .await
        .map_err(|err| GatewayError::Io(err.to_string()))?;
    let ack_len = u16::from_be_bytes(prefix) as usize;
    let mut ack_body = vec![0u8; ack_len];
    stream
        .read_exact(&mut ack_body)
        .await
        .map_err(|err| GatewayError::Io(err.to_string()))?;
    let mut ack = prefix.to_vec();
    ack.extend_from_slice(&ack_body);

    let secrets = handshake.process_ack(&ack)?;
    debug!("rlpx handshake complete");
    Ok(RlpxFrameCodec::new(secrets))
}

/// Runs the discovery exchange over UDP.
pub async fn run_discovery_connection(
    remote: SocketAddr,
    conn: ConnectionId,
    events: mpsc::UnboundedSender<NodeEvent>,
    mut outbound: mpsc::Receiver<OutboundCmd>,
) {
    let socket = match UdpSocket::bind("0.0.0.0:0").await {
        Ok(socket) => socket,
        Err(err) => {
            notify_closed(&events, conn, Some(GatewayError::Io(err.to_string())));
            return;
        }
    };
    let mut buf = vec![0u8; 2048];
    loop {
        tokio::select! {
            received = socket.recv_from(&mut buf) => match received {
                Ok((n, from)) if from == remote => {
                    let _ = events.send(NodeEvent::Frame {
                        conn,
                        frame: InboundFrame::Datagram(buf[..n].to_vec()),
                    });
                }
                Ok((_, from)) => warn!(%from, "datagram from unexpected sender"),
                Err(err) => {
                    notify_closed(&events, conn, Some(GatewayError::Io(err.to_string())));
                    return;
                }
            },
            cmd = outbound.recv() => match cmd {
                Some(OutboundCmd::Data { bytes, .. }) => {
                    if socket.send_to(&bytes, remote).await.is_err() {
                        notify_closed(&events, conn, Some(GatewayError::Io("send".into())));
                        return;
                    }
                }
                Some(OutboundCmd::Close) | None => {
                    notify_closed(&events, conn, None);
                    return;
                }
            },
        }
    }
}

/// Splits id-prefixed frame content into `(msg_id, payload)` without
/// decrypting anything; used by tests that inspect outbound eth traffic.
pub fn split_frame_content(content: &[u8]) -> Result<(u64, &[u8]), GatewayError> {
    let id_len = rlp_item_len(content, 0)?;
    let msg_id: u64 = rlp::Rlp::new(&content[..id_len])
        .as_val()
        .map_err(|_| GatewayError::ProtocolViolation("frame message id".into()))?;
    Ok((msg_id, &content[id_len..]))
}
