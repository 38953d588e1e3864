//! Overlay message payloads.
//!
//! Every payload has a fixed little-endian layout; variable-size fields are
//! length-prefixed with a `u32`, and trailing blobs run to the end of the
//! payload.

use crate::domain::constants::{BLOCK_KEY_LEN, NODE_ID_LEN};
use crate::adapters::framing::encode_frame;
use crate::domain::message_type::BxMessageType;
use shared_types::{GatewayError, Sha256Hash, ShortId};

/// One transaction in a `txs` or sync payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxsEntry {
    pub short_id: ShortId,
    pub tx_hash: Sha256Hash,
    pub contents: Vec<u8>,
}

/// Decoded overlay message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BxMessage {
    Hello {
        protocol_version: u32,
        network_num: u32,
        node_id: [u8; NODE_ID_LEN],
    },
    Ack,
    Ping {
        nonce: u64,
    },
    Pong {
        nonce: u64,
    },
    Broadcast {
        block_hash: Sha256Hash,
        network_num: u32,
        is_encrypted: bool,
        blob: Vec<u8>,
    },
    Key {
        block_hash: Sha256Hash,
        network_num: u32,
        key: [u8; BLOCK_KEY_LEN],
    },
    Tx {
        tx_hash: Sha256Hash,
        network_num: u32,
        short_id: ShortId,
        contents: Vec<u8>,
    },
    Txs {
        txs: Vec<TxsEntry>,
    },
    GetTxs {
        short_ids: Vec<ShortId>,
    },
    BlockHolding {
        block_hash: Sha256Hash,
        network_num: u32,
    },
    BlockReceived {
        block_hash: Sha256Hash,
        network_num: u32,
    },
    DisconnectRelayPeer,
    TxServiceSyncTxs {
        network_num: u32,
        txs: Vec<TxsEntry>,
    },
    TxServiceSyncComplete {
        network_num: u32,
    },
    BlockConfirmation {
        block_hash: Sha256Hash,
        network_num: u32,
        short_ids: Vec<ShortId>,
        tx_hashes: Vec<Sha256Hash>,
    },
    TransactionCleanup {
        network_num: u32,
        short_ids: Vec<ShortId>,
        tx_hashes: Vec<Sha256Hash>,
    },
}

impl BxMessage {
    /// Wire message type of this payload.
    pub fn msg_type(&self) -> BxMessageType {
        match self {
            Self::Hello { .. } => BxMessageType::Hello,
            Self::Ack => BxMessageType::Ack,
            Self::Ping { .. } => BxMessageType::Ping,
            Self::Pong { .. } => BxMessageType::Pong,
            Self::Broadcast { .. } => BxMessageType::Broadcast,
            Self::Key { .. } => BxMessageType::Key,
            Self::Tx { .. } => BxMessageType::Transaction,
            Self::Txs { .. } => BxMessageType::Transactions,
            Self::GetTxs { .. } => BxMessageType::GetTransactions,
            Self::BlockHolding { .. } => BxMessageType::BlockHolding,
            Self::BlockReceived { .. } => BxMessageType::BlockReceived,
            Self::DisconnectRelayPeer => BxMessageType::DisconnectRelayPeer,
            Self::TxServiceSyncTxs { .. } => BxMessageType::TxServiceSyncTxs,
            Self::TxServiceSyncComplete { .. } => BxMessageType::TxServiceSyncComplete,
            Self::BlockConfirmation { .. } => BxMessageType::BlockConfirmation,
            Self::TransactionCleanup { .. } => BxMessageType::TransactionCleanup,
        }
    }

    /// Serializes the payload (without framing).
    pub fn encode_payload(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            Self::Hello {
                protocol_version,
                network_num,
                node_id,
            } => {
                out.extend_from_slice(&protocol_version.to_le_bytes());
                out.extend_from_slice(&network_num.to_le_bytes());
                out.extend_from_slice(node_id);
            }
            Self::Ack | Self::DisconnectRelayPeer => {}
            Self::Ping { nonce } | Self::Pong { nonce } => {
                out.extend_from_slice(&nonce.to_le_bytes());
            }
            Self::Broadcast {
                block_hash,
                network_num,
                is_encrypted,
                blob,
            } => {
                out.extend_from_slice(block_hash.as_bytes());
                out.extend_from_slice(&network_num.to_le_bytes());
                out.push(u8::from(*is_encrypted));
                out.extend_from_slice(blob);
            }
            Self::Key {
                block_hash,
                network_num,
                key,
            } => {
                out.extend_from_slice(block_hash.as_bytes());
                out.extend_from_slice(&network_num.to_le_bytes());
                out.extend_from_slice(key);
            }
            Self::Tx {
                tx_hash,
                network_num,
                short_id,
                contents,
            } => {
                out.extend_from_slice(tx_hash.as_bytes());
                out.extend_from_slice(&network_num.to_le_bytes());
                out.extend_from_slice(&short_id.to_le_bytes());
                out.extend_from_slice(contents);
            }
            Self::Txs { txs } => {
                write_txs_entries(&mut out, txs);
            }
            Self::GetTxs { short_ids } => {
                write_short_id_list(&mut out, short_ids);
            }
            Self::BlockHolding {
                block_hash,
                network_num,
            }
            | Self::BlockReceived {
                block_hash,
                network_num,
            } => {
                out.extend_from_slice(block_hash.as_bytes());
                out.extend_from_slice(&network_num.to_le_bytes());
            }
            Self::TxServiceSyncTxs { network_num, txs } => {
                out.extend_from_slice(&network_num.to_le_bytes());
                write_txs_entries(&mut out, txs);
            }
            Self::TxServiceSyncComplete { network_num } => {
                out.extend_from_slice(&network_num.to_le_bytes());
            }
            Self::BlockConfirmation {
                block_hash,
                network_num,
                short_ids,
                tx_hashes,
            } => {
                out.extend_from_slice(block_hash.as_bytes());
                out.extend_from_slice(&network_num.to_le_bytes());
                write_short_id_list(&mut out, short_ids);
                write_hash_list(&mut out, tx_hashes);
            }
            Self::TransactionCleanup {
                network_num,
                short_ids,
                tx_hashes,
            } => {
                out.extend_from_slice(&network_num.to_le_bytes());
                write_short_id_list(&mut out, short_ids);
                write_hash_list(&mut out, tx_hashes);
            }
        }
        out
    }

    /// Serializes the full wire frame.
    pub fn to_frame(&self) -> Vec<u8> {
        encode_frame(self.msg_type(), &self.encode_payload())
    }

    /// Parses a payload of the given type.
    pub fn decode(msg_type: BxMessageType, payload: &[u8]) -> Result<Self, GatewayError> {
        let mut r = Reader::new(payload);
        let msg = match msg_type {
            BxMessageType::Hello => Self::Hello {
                protocol_version: r.u32()?,
                network_num: r.u32()?,
                node_id: r.array::<NODE_ID_LEN>()?,
            },
            BxMessageType::Ack => Self::Ack,
            BxMessageType::Ping => Self::Ping { nonce: r.u64()? },
            BxMessageType::Pong => Self::Pong { nonce: r.u64()? },
            BxMessageType::Broadcast => Self::Broadcast {
                block_hash: r.hash()?,
                network_num: r.u32()?,
                is_encrypted: r.u8()? != 0,
                blob: r.rest(),
            },
            BxMessageType::Key => Self::Key {
                block_hash: r.hash()?,
                network_num: r.u32()?,
                key: r.array::<BLOCK_KEY_LEN>()?,
            },
            BxMessageType::Transaction => Self::Tx {
                tx_hash: r.hash()?,
                network_num: r.u32()?,
                short_id: r.u32()?,
                contents: r.rest(),
            },
            BxMessageType::Transactions => Self::Txs {
                txs: read_txs_entries(&mut r)?,
            },
            BxMessageType::GetTransactions => Self::GetTxs {
                short_ids: read_short_id_list(&mut r)?,
            },
            BxMessageType::BlockHolding => Self::BlockHolding {
                block_hash: r.hash()?,
                network_num: r.u32()?,
            },
            BxMessageType::BlockReceived => Self::BlockReceived {
                block_hash: r.hash()?,
                network_num: r.u32()?,
            },
            BxMessageType::DisconnectRelayPeer => Self::DisconnectRelayPeer,
            BxMessageType::TxServiceSyncTxs => Self::TxServiceSyncTxs {
                network_num: r.u32()?,
                txs: read_txs_entries(&mut r)?,
            },
            BxMessageType::TxServiceSyncComplete => Self::TxServiceSyncComplete {
                network_num: r.u32()?,
            },
            BxMessageType::BlockConfirmation => Self::BlockConfirmation {
                block_hash: r.hash()?,
                network_num: r.u32()?,
                short_ids: read_short_id_list(&mut r)?,
                tx_hashes: read_hash_list(&mut r)?,
            },
            BxMessageType::TransactionCleanup => Self::TransactionCleanup {
                network_num: r.u32()?,
                short_ids: read_short_id_list(&mut r)?,
                tx_hashes: read_hash_list(&mut r)?,
            },
        };
        Ok(msg)
    }
}

fn write_short_id_list(out: &mut Vec<u8>, short_ids: &[ShortId]) {
    out.extend_from_slice(&(short_ids.len() as u32).to_le_bytes());
    for sid in short_ids {
        out.extend_from_slice(&sid.to_le_bytes());
    }
}

fn write_hash_list(out: &mut Vec<u8>, hashes: &[Sha256Hash]) {
    out.extend_from_slice(&(hashes.len() as u32).to_le_bytes());
    for hash in hashes {
        out.extend_from_slice(hash.as_bytes());
    }
}

fn write_txs_entries(out: &mut Vec<u8>, txs: &[TxsEntry]) {
    out.extend_from_slice(&(txs.len() as u32).to_le_bytes());
    for tx in txs {
        out.extend_from_slice(&tx.short_id.to_le_bytes());
        out.extend_from_slice(tx.tx_hash.as_bytes());
        out.extend_from_slice(&(tx.contents.len() as u32).to_le_bytes());
        out.extend_from_slice(&tx.contents);
    }
}

fn read_short_id_list(r: &mut Reader<'_>) -> Result<Vec<ShortId>, GatewayError> {
    let count = r.list_len()?;
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        out.push(r.u32()?);
    }
    Ok(out)
}

fn read_hash_list(r: &mut Reader<'_>) -> Result<Vec<Sha256Hash>, GatewayError> {
    let count = r.list_len()?;
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        out.push(r.hash()?);
    }
    Ok(out)
}

fn read_txs_entries(r: &mut Reader<'_>) -> Result<Vec<TxsEntry>, GatewayError> {
    let count = r.list_len()?;
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        let short_id = r.u32()?;
        let tx_hash = r.hash()?;
        let len = r.u32()? as usize;
        out.push(TxsEntry {
            short_id,
            tx_hash,
            contents: r.bytes(len)?,
        });
    }
    Ok(out)
}

/// Bounds-checked little-endian payload reader.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn truncated() -> GatewayError {
        GatewayError::ProtocolViolation("truncated payload".into())
    }

    fn bytes(&mut self, len: usize) -> Result<Vec<u8>, GatewayError> {
        let end = self.pos.checked_add(len).ok_or_else(Self::truncated)?;
        let slice = self.buf.get(self.pos..end).ok_or_else(Self::truncated)?;
        self.pos = end;
        Ok(slice.to_vec())
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], GatewayError> {
        let slice = self
            .buf
            .get(self.pos..self.pos + N)
            .ok_or_else(Self::truncated)?;
        self.pos += N;
        Ok(slice.try_into().expect("slice length checked"))
    }

    fn u8(&mut self) -> Result<u8, GatewayError> {
        let b = *self.buf.get(self.pos).ok_or_else(Self::truncated)?;
        self.pos += 1;
        Ok(b)
    }

    fn u32(&mut self) -> Result<u32, GatewayError> {
        Ok(u32::from_le_bytes(self.array::<4>()?))
    }

    fn u64(&mut self) -> Result<u64, GatewayError> {
        Ok(u64::from_le_bytes(self.array::<8>()?))
    }

    fn hash(&mut self) -> Result<Sha256Hash, GatewayError> {
        Ok(Sha256Hash::new(self.array::<32>()?))
    }

    /// List length prefix, sanity-capped against the remaining bytes.
    fn list_len(&mut self) -> Result<usize, GatewayError> {
        let count = self.u32()? as usize;
        if count > self.buf.len() - self.pos {
            return Err(GatewayError::ProtocolViolation(
                "list length exceeds payload".into(),
            ));
        }
        Ok(count)
    }

    fn rest(&mut self) -> Vec<u8> {
        let out = self.buf[self.pos..].to_vec();
        self.pos = self.buf.len();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash(byte: u8) -> Sha256Hash {
        Sha256Hash::new([byte; 32])
    }

    fn round_trip(msg: BxMessage) {
        let payload = msg.encode_payload();
        let decoded = BxMessage::decode(msg.msg_type(), &payload).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_hello_round_trip() {
        round_trip(BxMessage::Hello {
            protocol_version: 4,
            network_num: 1,
            node_id: [7; NODE_ID_LEN],
        });
    }

    #[test]
    fn test_broadcast_round_trip() {
        round_trip(BxMessage::Broadcast {
            block_hash: hash(0xAA),
            network_num: 3,
            is_encrypted: true,
            blob: vec![1, 2, 3, 4, 5],
        });
    }

    #[test]
    fn test_tx_round_trip_with_empty_contents() {
        round_trip(BxMessage::Tx {
            tx_hash: hash(0x11),
            network_num: 1,
            short_id: 42,
            contents: Vec::new(),
        });
    }

    #[test]
    fn test_txs_round_trip() {
        round_trip(BxMessage::Txs {
            txs: vec![
                TxsEntry {
                    short_id: 9,
                    tx_hash: hash(1),
                    contents: vec![0xDE, 0xAD],
                },
                TxsEntry {
                    short_id: 10,
                    tx_hash: hash(2),
                    contents: vec![],
                },
            ],
        });
    }

    #[test]
    fn test_block_confirmation_round_trip() {
        round_trip(BxMessage::BlockConfirmation {
            block_hash: hash(5),
            network_num: 2,
            short_ids: vec![1, 2, 3],
            tx_hashes: vec![hash(6), hash(7)],
        });
    }

    #[test]
    fn test_get_txs_round_trip() {
        round_trip(BxMessage::GetTxs {
            short_ids: vec![99, 100, 101],
        });
    }

    #[test]
    fn test_truncated_payload_is_violation() {
        let payload = BxMessage::Key {
            block_hash: hash(1),
            network_num: 0,
            key: [0; BLOCK_KEY_LEN],
        }
        .encode_payload();
        let err = BxMessage::decode(BxMessageType::Key, &payload[..payload.len() - 1]);
        assert!(matches!(err, Err(GatewayError::ProtocolViolation(_))));
    }

    #[test]
    fn test_absurd_list_length_rejected() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&u32::MAX.to_le_bytes());
        let err = BxMessage::decode(BxMessageType::GetTransactions, &payload);
        assert!(matches!(err, Err(GatewayError::ProtocolViolation(_))));
    }
}
