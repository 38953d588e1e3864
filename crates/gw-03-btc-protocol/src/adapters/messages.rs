//! Bitcoin message payloads the gateway reads and writes.
//!
//! Only the fields the gateway acts on are modeled; everything else stays
//! opaque bytes.

use crate::domain::constants::{
    BTC_BLOCK_HDR_SIZE, BTC_HDR_COMMON_OFF, BTC_NODE_SERVICES, BTC_PROTOCOL_VERSION,
};
use crate::domain::tx::parse_transaction;
use crate::adapters::wire::{encode_btc_message, BtcCommand};
use gw_02_messages::varint::{read_varint, write_varint};
use shared_types::{double_sha256, GatewayError, Sha256Hash};

// =============================================================================
// BLOCK MESSAGE
// =============================================================================

/// View over a full `block` wire message (envelope header included).
#[derive(Clone, Debug)]
pub struct BtcBlockMessage<'a> {
    bytes: &'a [u8],
    txn_count: usize,
    txn_count_len: usize,
}

impl<'a> BtcBlockMessage<'a> {
    /// Parses the fixed prefix of a block message.
    pub fn parse(bytes: &'a [u8]) -> Result<Self, GatewayError> {
        if bytes.len() < BTC_HDR_COMMON_OFF + BTC_BLOCK_HDR_SIZE + 1 {
            return Err(GatewayError::ProtocolViolation(
                "block message shorter than header".into(),
            ));
        }
        let (txn_count, txn_count_len) =
            read_varint(bytes, BTC_HDR_COMMON_OFF + BTC_BLOCK_HDR_SIZE)?;
        Ok(Self {
            bytes,
            txn_count: txn_count as usize,
            txn_count_len,
        })
    }

    /// The whole wire message.
    pub fn as_bytes(&self) -> &'a [u8] {
        self.bytes
    }

    /// The 80-byte block header.
    pub fn block_header(&self) -> &'a [u8] {
        &self.bytes[BTC_HDR_COMMON_OFF..BTC_HDR_COMMON_OFF + BTC_BLOCK_HDR_SIZE]
    }

    /// Double-SHA256 of the block header.
    pub fn block_hash(&self) -> Sha256Hash {
        double_sha256(self.block_header())
    }

    /// Previous-block hash from the header.
    pub fn prev_block_hash(&self) -> Sha256Hash {
        Sha256Hash::from_slice(&self.bytes[BTC_HDR_COMMON_OFF + 4..BTC_HDR_COMMON_OFF + 36])
            .expect("fixed 32-byte window")
    }

    /// Number of transactions declared by the body.
    pub fn txn_count(&self) -> usize {
        self.txn_count
    }

    /// Length of the prefix through the transaction-count varint. This is
    /// the piece a bx-block carries verbatim.
    pub fn header_piece_len(&self) -> usize {
        BTC_HDR_COMMON_OFF + BTC_BLOCK_HDR_SIZE + self.txn_count_len
    }
}

/// Builds a full `block` wire message from header and transactions.
pub fn build_block_message(magic: u32, block_header: &[u8], txns: &[Vec<u8>]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(BTC_BLOCK_HDR_SIZE + 9);
    payload.extend_from_slice(block_header);
    write_varint(&mut payload, txns.len() as u64);
    for tx in txns {
        payload.extend_from_slice(tx);
    }
    encode_btc_message(magic, BtcCommand::Block, &payload)
}

// =============================================================================
// COMPACT BLOCK MESSAGE
// =============================================================================

/// Parsed `cmpctblock` payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BtcCompactBlockMessage {
    /// The 80-byte block header.
    pub header: Vec<u8>,
    /// Nonce mixed into the siphash key.
    pub nonce: u64,
    /// 6-byte short transaction ids in block order.
    pub short_ids: Vec<[u8; 6]>,
    /// Prefilled transactions with absolute indices (the wire encodes them
    /// differentially).
    pub prefilled: Vec<(usize, Vec<u8>)>,
}

impl BtcCompactBlockMessage {
    /// Parses a `cmpctblock` payload.
    pub fn parse(payload: &[u8]) -> Result<Self, GatewayError> {
        let truncated =
            || GatewayError::ProtocolViolation("compact block past end of payload".into());
        let header = payload
            .get(..BTC_BLOCK_HDR_SIZE)
            .ok_or_else(truncated)?
            .to_vec();
        let mut pos = BTC_BLOCK_HDR_SIZE;
        let nonce_bytes: [u8; 8] = payload
            .get(pos..pos + 8)
            .ok_or_else(truncated)?
            .try_into()
            .expect("length checked");
        let nonce = u64::from_le_bytes(nonce_bytes);
        pos += 8;

        let (count, len) = read_varint(payload, pos)?;
        pos += len;
        let mut short_ids = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let id: [u8; 6] = payload
                .get(pos..pos + 6)
                .ok_or_else(truncated)?
                .try_into()
                .expect("length checked");
            short_ids.push(id);
            pos += 6;
        }

        let (prefilled_count, len) = read_varint(payload, pos)?;
        pos += len;
        let mut prefilled = Vec::with_capacity(prefilled_count as usize);
        let mut last_index: i64 = -1;
        for _ in 0..prefilled_count {
            let (diff, len) = read_varint(payload, pos)?;
            pos += len;
            let index = last_index + 1 + diff as i64;
            last_index = index;
            let parsed = parse_transaction(payload, pos)?;
            prefilled.push((index as usize, payload[pos..pos + parsed.size].to_vec()));
            pos += parsed.size;
        }

        Ok(Self {
            header,
            nonce,
            short_ids,
            prefilled,
        })
    }

    /// Block hash committed to by the header.
    pub fn block_hash(&self) -> Sha256Hash {
        double_sha256(&self.header)
    }

    /// Serializes back into a `cmpctblock` payload.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&self.header);
        out.extend_from_slice(&self.nonce.to_le_bytes());
        write_varint(&mut out, self.short_ids.len() as u64);
        for id in &self.short_ids {
            out.extend_from_slice(id);
        }
        write_varint(&mut out, self.prefilled.len() as u64);
        let mut last_index: i64 = -1;
        for (index, tx) in &self.prefilled {
            let diff = (*index as i64) - last_index - 1;
            last_index = *index as i64;
            write_varint(&mut out, diff as u64);
            out.extend_from_slice(tx);
        }
        out
    }
}

// =============================================================================
// COMPACT BLOCK FOLLOW-UPS
// =============================================================================

/// Encodes a `getblocktxn` payload requesting transactions by absolute
/// index (differentially encoded on the wire).
pub fn encode_get_block_txn(block_hash: &Sha256Hash, indices: &[usize]) -> Vec<u8> {
    let mut out = Vec::with_capacity(32 + 1 + indices.len());
    out.extend_from_slice(block_hash.as_bytes());
    write_varint(&mut out, indices.len() as u64);
    let mut last: i64 = -1;
    for &index in indices {
        write_varint(&mut out, (index as i64 - last - 1) as u64);
        last = index as i64;
    }
    out
}

/// Decodes a `blocktxn` payload into the block hash and transactions.
pub fn decode_block_txn(payload: &[u8]) -> Result<(Sha256Hash, Vec<Vec<u8>>), GatewayError> {
    let truncated = || GatewayError::ProtocolViolation("blocktxn past end of payload".into());
    let block_hash =
        Sha256Hash::from_slice(payload.get(..32).ok_or_else(truncated)?).expect("fixed window");
    let (count, len) = read_varint(payload, 32)?;
    let mut pos = 32 + len;
    let mut txns = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let parsed = parse_transaction(payload, pos)?;
        txns.push(payload[pos..pos + parsed.size].to_vec());
        pos += parsed.size;
    }
    Ok((block_hash, txns))
}

// =============================================================================
// INVENTORY
// =============================================================================

/// Inventory object types.
pub mod inventory_type {
    /// Transaction.
    pub const MSG_TX: u32 = 1;
    /// Block.
    pub const MSG_BLOCK: u32 = 2;
    /// Compact block (BIP-152).
    pub const MSG_CMPCT_BLOCK: u32 = 4;
}

/// One `inv`/`getdata` entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InventoryVector {
    pub inv_type: u32,
    pub hash: Sha256Hash,
}

/// Encodes an `inv` or `getdata` payload.
pub fn encode_inventory(items: &[InventoryVector]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + items.len() * 36);
    write_varint(&mut out, items.len() as u64);
    for item in items {
        out.extend_from_slice(&item.inv_type.to_le_bytes());
        out.extend_from_slice(item.hash.as_bytes());
    }
    out
}

/// Decodes an `inv` or `getdata` payload.
pub fn decode_inventory(payload: &[u8]) -> Result<Vec<InventoryVector>, GatewayError> {
    let truncated = || GatewayError::ProtocolViolation("inventory past end of payload".into());
    let (count, mut pos) = read_varint(payload, 0)?;
    let mut items = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let type_bytes: [u8; 4] = payload
            .get(pos..pos + 4)
            .ok_or_else(truncated)?
            .try_into()
            .expect("length checked");
        let hash = Sha256Hash::from_slice(payload.get(pos + 4..pos + 36).ok_or_else(truncated)?)
            .expect("fixed window");
        items.push(InventoryVector {
            inv_type: u32::from_le_bytes(type_bytes),
            hash,
        });
        pos += 36;
    }
    Ok(items)
}

// =============================================================================
// HANDSHAKE AND LIVENESS
// =============================================================================

/// Encodes a `version` payload.
pub fn encode_version(
    external_ip: [u8; 16],
    external_port: u16,
    peer_ip: [u8; 16],
    peer_port: u16,
    nonce: u64,
    user_agent: &str,
    start_height: i32,
) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&BTC_PROTOCOL_VERSION.to_le_bytes());
    out.extend_from_slice(&BTC_NODE_SERVICES.to_le_bytes());
    out.extend_from_slice(&0i64.to_le_bytes()); // timestamp filled by peers
    for (ip, port) in [(peer_ip, peer_port), (external_ip, external_port)] {
        out.extend_from_slice(&BTC_NODE_SERVICES.to_le_bytes());
        out.extend_from_slice(&ip);
        out.extend_from_slice(&port.to_be_bytes());
    }
    out.extend_from_slice(&nonce.to_le_bytes());
    write_varint(&mut out, user_agent.len() as u64);
    out.extend_from_slice(user_agent.as_bytes());
    out.extend_from_slice(&start_height.to_le_bytes());
    out.push(0); // no tx relay until requested
    out
}

/// Encodes a `ping`/`pong` payload.
pub fn encode_nonce(nonce: u64) -> Vec<u8> {
    nonce.to_le_bytes().to_vec()
}

/// Decodes a `ping`/`pong` payload.
pub fn decode_nonce(payload: &[u8]) -> u64 {
    payload
        .get(..8)
        .and_then(|b| b.try_into().ok())
        .map(u64::from_le_bytes)
        .unwrap_or(0)
}

/// Encodes an empty `addr` payload (privacy-preserving reply to `getaddr`).
pub fn encode_empty_addr() -> Vec<u8> {
    vec![0]
}
