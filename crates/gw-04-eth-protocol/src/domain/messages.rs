//! eth subprotocol messages (RLP encoded).
//!
//! Only the fields the gateway acts on are decoded; headers, bodies, and
//! transactions stay raw RLP items so they can be forwarded or hashed without
//! re-encoding.

use rlp::{Rlp, RlpStream};
use shared_types::{GatewayError, Sha256Hash};

use crate::domain::constants::{ETH_PROTOCOL_VERSION, P2P_PROTOCOL_VERSION, PUBLIC_KEY_LEN};

/// Message ids on an RLPx connection (devp2p base + eth subprotocol at
/// offset 0x10).
pub mod message_id {
    pub const HELLO: u64 = 0x00;
    pub const DISCONNECT: u64 = 0x01;
    pub const PING: u64 = 0x02;
    pub const PONG: u64 = 0x03;
    pub const STATUS: u64 = 0x10;
    pub const NEW_BLOCK_HASHES: u64 = 0x11;
    pub const TRANSACTIONS: u64 = 0x12;
    pub const GET_BLOCK_HEADERS: u64 = 0x13;
    pub const BLOCK_HEADERS: u64 = 0x14;
    pub const GET_BLOCK_BODIES: u64 = 0x15;
    pub const BLOCK_BODIES: u64 = 0x16;
    pub const NEW_BLOCK: u64 = 0x17;
    pub const GET_NODE_DATA: u64 = 0x1D;
    pub const NODE_DATA: u64 = 0x1E;
    pub const GET_RECEIPTS: u64 = 0x1F;
    pub const RECEIPTS: u64 = 0x20;
}

fn violation(reason: &str) -> GatewayError {
    GatewayError::ProtocolViolation(format!("eth message: {reason}"))
}

/// A decoded eth message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EthMessage {
    Hello {
        p2p_version: u64,
        client_name: String,
        capabilities: Vec<(String, u64)>,
        listen_port: u16,
        node_id: Vec<u8>,
    },
    Disconnect {
        reason: u8,
    },
    Ping,
    Pong,
    Status {
        protocol_version: u64,
        network_id: u64,
        total_difficulty: Vec<u8>,
        best_hash: Sha256Hash,
        genesis_hash: Sha256Hash,
    },
    /// Announced `(block hash, block number)` pairs.
    NewBlockHashes(Vec<(Sha256Hash, u64)>),
    /// Raw transaction RLP items.
    Transactions(Vec<Vec<u8>>),
    GetBlockHeaders {
        start_hash: Option<Sha256Hash>,
        start_number: Option<u64>,
        max_headers: u64,
        skip: u64,
        reverse: bool,
    },
    /// Raw header RLP items.
    BlockHeaders(Vec<Vec<u8>>),
    GetBlockBodies(Vec<Sha256Hash>),
    /// Raw body RLP items (`[transactions, uncles]` each).
    BlockBodies(Vec<Vec<u8>>),
    NewBlock {
        /// Raw `[header, transactions, uncles]` item.
        block: Vec<u8>,
        total_difficulty: u128,
    },
    /// Anything the gateway only proxies.
    Raw {
        msg_id: u64,
        payload: Vec<u8>,
    },
}

impl EthMessage {
    /// Builds the hello the gateway announces.
    pub fn gateway_hello(client_name: String, listen_port: u16, node_id: Vec<u8>) -> Self {
        Self::Hello {
            p2p_version: P2P_PROTOCOL_VERSION,
            client_name,
            capabilities: vec![("eth".into(), ETH_PROTOCOL_VERSION)],
            listen_port,
            node_id,
        }
    }

    /// Wire message id.
    pub fn msg_id(&self) -> u64 {
        match self {
            Self::Hello { .. } => message_id::HELLO,
            Self::Disconnect { .. } => message_id::DISCONNECT,
            Self::Ping => message_id::PING,
            Self::Pong => message_id::PONG,
            Self::Status { .. } => message_id::STATUS,
            Self::NewBlockHashes(_) => message_id::NEW_BLOCK_HASHES,
            Self::Transactions(_) => message_id::TRANSACTIONS,
            Self::GetBlockHeaders { .. } => message_id::GET_BLOCK_HEADERS,
            Self::BlockHeaders(_) => message_id::BLOCK_HEADERS,
            Self::GetBlockBodies(_) => message_id::GET_BLOCK_BODIES,
            Self::BlockBodies(_) => message_id::BLOCK_BODIES,
            Self::NewBlock { .. } => message_id::NEW_BLOCK,
            Self::Raw { msg_id, .. } => *msg_id,
        }
    }

    /// Serializes to frame content: `rlp(msg_id) ‖ payload`. This is the
    /// plaintext form handed to an RLPx writer for sealing.
    pub fn to_frame_content(&self) -> Vec<u8> {
        let mut out = rlp::encode(&self.msg_id()).to_vec();
        out.extend_from_slice(&self.encode_payload());
        out
    }

    /// Serializes the RLP payload.
    pub fn encode_payload(&self) -> Vec<u8> {
        match self {
            Self::Hello {
                p2p_version,
                client_name,
                capabilities,
                listen_port,
                node_id,
            } => {
                let mut stream = RlpStream::new_list(5);
                stream.append(p2p_version);
                stream.append(&client_name.as_bytes().to_vec());
                stream.begin_list(capabilities.len());
                for (name, version) in capabilities {
                    stream.begin_list(2);
                    stream.append(&name.as_bytes().to_vec());
                    stream.append(version);
                }
                stream.append(&(*listen_port as u64));
                stream.append(node_id);
                stream.out().to_vec()
            }
            Self::Disconnect { reason } => {
                let mut stream = RlpStream::new_list(1);
                stream.append(&(*reason as u64));
                stream.out().to_vec()
            }
            Self::Ping | Self::Pong => {
                let stream = RlpStream::new_list(0);
                stream.out().to_vec()
            }
            Self::Status {
                protocol_version,
                network_id,
                total_difficulty,
                best_hash,
                genesis_hash,
            } => {
                let mut stream = RlpStream::new_list(5);
                stream.append(protocol_version);
                stream.append(network_id);
                stream.append(total_difficulty);
                stream.append(&best_hash.as_bytes().to_vec());
                stream.append(&genesis_hash.as_bytes().to_vec());
                stream.out().to_vec()
            }
            Self::NewBlockHashes(pairs) => {
                let mut stream = RlpStream::new_list(pairs.len());
                for (hash, number) in pairs {
                    stream.begin_list(2);
                    stream.append(&hash.as_bytes().to_vec());
                    stream.append(number);
                }
                stream.out().to_vec()
            }
            Self::Transactions(items) | Self::BlockHeaders(items) | Self::BlockBodies(items) => {
                encode_raw_item_list(items)
            }
            Self::GetBlockHeaders {
                start_hash,
                start_number,
                max_headers,
                skip,
                reverse,
            } => {
                let mut stream = RlpStream::new_list(4);
                match (start_hash, start_number) {
                    (Some(hash), _) => stream.append(&hash.as_bytes().to_vec()),
                    (None, Some(number)) => stream.append(number),
                    (None, None) => stream.append(&0u64),
                };
                stream.append(max_headers);
                stream.append(skip);
                stream.append(&u64::from(*reverse));
                stream.out().to_vec()
            }
            Self::GetBlockBodies(hashes) => {
                let mut stream = RlpStream::new_list(hashes.len());
                for hash in hashes {
                    stream.append(&hash.as_bytes().to_vec());
                }
                stream.out().to_vec()
            }
            Self::NewBlock {
                block,
                total_difficulty,
            } => {
                let mut stream = RlpStream::new_list(2);
                stream.append_raw(block, 1);
                stream.append(total_difficulty);
                stream.out().to_vec()
            }
            Self::Raw { payload, .. } => payload.clone(),
        }
    }

    /// Parses a payload of the given message id.
    pub fn decode(msg_id: u64, payload: &[u8]) -> Result<Self, GatewayError> {
        let rlp = Rlp::new(payload);
        let msg = match msg_id {
            message_id::HELLO => {
                let capabilities_rlp = rlp.at(2).map_err(|_| violation("hello"))?;
                let mut capabilities = Vec::new();
                for cap in capabilities_rlp.iter() {
                    let name: Vec<u8> = cap.val_at(0).map_err(|_| violation("hello cap"))?;
                    let version: u64 = cap.val_at(1).map_err(|_| violation("hello cap"))?;
                    capabilities.push((String::from_utf8_lossy(&name).into_owned(), version));
                }
                let client_name: Vec<u8> = rlp.val_at(1).map_err(|_| violation("hello"))?;
                let node_id: Vec<u8> = rlp.val_at(4).map_err(|_| violation("hello"))?;
                if node_id.len() != PUBLIC_KEY_LEN {
                    return Err(violation("hello node id length"));
                }
                Self::Hello {
                    p2p_version: rlp.val_at(0).map_err(|_| violation("hello"))?,
                    client_name: String::from_utf8_lossy(&client_name).into_owned(),
                    capabilities,
                    listen_port: rlp
                        .val_at::<u64>(3)
                        .map_err(|_| violation("hello"))? as u16,
                    node_id,
                }
            }
            message_id::DISCONNECT => Self::Disconnect {
                reason: rlp.val_at::<u64>(0).unwrap_or(0) as u8,
            },
            message_id::PING => Self::Ping,
            message_id::PONG => Self::Pong,
            message_id::STATUS => Self::Status {
                protocol_version: rlp.val_at(0).map_err(|_| violation("status"))?,
                network_id: rlp.val_at(1).map_err(|_| violation("status"))?,
                total_difficulty: rlp.val_at(2).map_err(|_| violation("status"))?,
                best_hash: hash_at(&rlp, 3)?,
                genesis_hash: hash_at(&rlp, 4)?,
            },
            message_id::NEW_BLOCK_HASHES => {
                let mut pairs = Vec::new();
                for item in rlp.iter() {
                    let hash_bytes: Vec<u8> =
                        item.val_at(0).map_err(|_| violation("new block hashes"))?;
                    let number: u64 = item.val_at(1).map_err(|_| violation("new block hashes"))?;
                    let hash = Sha256Hash::from_slice(&hash_bytes)
                        .ok_or_else(|| violation("new block hash length"))?;
                    pairs.push((hash, number));
                }
                Self::NewBlockHashes(pairs)
            }
            message_id::TRANSACTIONS => Self::Transactions(decode_raw_item_list(&rlp)?),
            message_id::GET_BLOCK_HEADERS => {
                let start = rlp.at(0).map_err(|_| violation("get headers"))?;
                let start_bytes = start.data().map_err(|_| violation("get headers"))?;
                let (start_hash, start_number) = if start_bytes.len() == 32 {
                    (Sha256Hash::from_slice(start_bytes), None)
                } else {
                    (
                        None,
                        Some(start.as_val::<u64>().map_err(|_| violation("get headers"))?),
                    )
                };
                Self::GetBlockHeaders {
                    start_hash,
                    start_number,
                    max_headers: rlp.val_at(1).map_err(|_| violation("get headers"))?,
                    skip: rlp.val_at(2).map_err(|_| violation("get headers"))?,
                    reverse: rlp.val_at::<u64>(3).map_err(|_| violation("get headers"))? != 0,
                }
            }
            message_id::BLOCK_HEADERS => Self::BlockHeaders(decode_raw_item_list(&rlp)?),
            message_id::GET_BLOCK_BODIES => {
                let mut hashes = Vec::new();
                for item in rlp.iter() {
                    let bytes = item.data().map_err(|_| violation("get bodies"))?;
                    hashes.push(
                        Sha256Hash::from_slice(bytes)
                            .ok_or_else(|| violation("get bodies hash length"))?,
                    );
                }
                Self::GetBlockBodies(hashes)
            }
            message_id::BLOCK_BODIES => Self::BlockBodies(decode_raw_item_list(&rlp)?),
            message_id::NEW_BLOCK => Self::NewBlock {
                block: rlp
                    .at(0)
                    .map_err(|_| violation("new block"))?
                    .as_raw()
                    .to_vec(),
                total_difficulty: rlp.val_at(1).map_err(|_| violation("new block"))?,
            },
            other => Self::Raw {
                msg_id: other,
                payload: payload.to_vec(),
            },
        };
        Ok(msg)
    }
}

fn hash_at(rlp: &Rlp<'_>, index: usize) -> Result<Sha256Hash, GatewayError> {
    let bytes: Vec<u8> = rlp.val_at(index).map_err(|_| violation("hash field"))?;
    Sha256Hash::from_slice(&bytes).ok_or_else(|| violation("hash field length"))
}

fn encode_raw_item_list(items: &[Vec<u8>]) -> Vec<u8> {
    let mut stream = RlpStream::new_list(items.len());
    for item in items {
        stream.append_raw(item, 1);
    }
    stream.out().to_vec()
}

fn decode_raw_item_list(rlp: &Rlp<'_>) -> Result<Vec<Vec<u8>>, GatewayError> {
    if !rlp.is_list() {
        return Err(violation("expected list"));
    }
    let mut items = Vec::new();
    for item in rlp.iter() {
        items.push(item.as_raw().to_vec());
    }
    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(msg: EthMessage) {
        let payload = msg.encode_payload();
        let decoded = EthMessage::decode(msg.msg_id(), &payload).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_hello_round_trip() {
        round_trip(EthMessage::gateway_hello(
            "bdn-gateway/0.1".into(),
            30303,
            vec![7; PUBLIC_KEY_LEN],
        ));
    }

    #[test]
    fn test_status_round_trip() {
        round_trip(EthMessage::Status {
            protocol_version: 63,
            network_id: 1,
            total_difficulty: vec![0x01, 0x00],
            best_hash: Sha256Hash::new([1; 32]),
            genesis_hash: Sha256Hash::new([2; 32]),
        });
    }

    #[test]
    fn test_new_block_hashes_round_trip() {
        round_trip(EthMessage::NewBlockHashes(vec![
            (Sha256Hash::new([3; 32]), 100),
            (Sha256Hash::new([4; 32]), 101),
        ]));
    }

    #[test]
    fn test_get_block_headers_by_hash_and_number() {
        round_trip(EthMessage::GetBlockHeaders {
            start_hash: Some(Sha256Hash::new([5; 32])),
            start_number: None,
            max_headers: 1,
            skip: 0,
            reverse: false,
        });
        round_trip(EthMessage::GetBlockHeaders {
            start_hash: None,
            start_number: Some(1_000_000),
            max_headers: 100,
            skip: 2,
            reverse: true,
        });
    }

    #[test]
    fn test_raw_item_lists_round_trip() {
        let tx1 = rlp::encode(&vec![0xAAu8; 30]).to_vec();
        let tx2 = rlp::encode(&vec![0xBBu8; 60]).to_vec();
        round_trip(EthMessage::Transactions(vec![tx1, tx2]));
    }

    #[test]
    fn test_new_block_round_trip() {
        let mut block = RlpStream::new_list(3);
        block.append(&vec![1u8; 10]);
        block.begin_list(0);
        block.begin_list(0);
        round_trip(EthMessage::NewBlock {
            block: block.out().to_vec(),
            total_difficulty: 1_000_000_000_000,
        });
    }

    #[test]
    fn test_unknown_id_is_raw_passthrough() {
        let msg = EthMessage::decode(message_id::GET_NODE_DATA, &[0xC0]).unwrap();
        assert_eq!(
            msg,
            EthMessage::Raw {
                msg_id: message_id::GET_NODE_DATA,
                payload: vec![0xC0],
            }
        );
    }

    #[test]
    fn test_malformed_status_rejected() {
        assert!(EthMessage::decode(message_id::STATUS, &[0xC0]).is_err());
    }
}
