//! Internal Ethereum block representation.
//!
//! The gateway normalizes every way a block can arrive (a `NewBlock` push,
//! or a header plus body assembled after a `NewBlockHashes` announcement)
//! into one payload: `rlp([header, [tx…], uncles, total_difficulty])`. This
//! is the byte string the block converter compresses.

use rlp::{Rlp, RlpStream};
use shared_types::{GatewayError, Sha256Hash};

use crate::transport::crypto_utils::keccak256;
use crate::domain::messages::EthMessage;

fn violation(reason: &str) -> GatewayError {
    GatewayError::ProtocolViolation(format!("eth block: {reason}"))
}

/// Header/body pair collected for an announced block hash.
#[derive(Clone, Debug, Default)]
pub struct NewBlockParts {
    /// Raw header item, once the header response arrives.
    pub header: Option<Vec<u8>>,
    /// Raw body item (`[transactions, uncles]`), once the body arrives.
    pub body: Option<Vec<u8>>,
    /// Block number from the announcement.
    pub number: u64,
}

impl NewBlockParts {
    /// Creates an empty entry for an announced block.
    pub fn announced(number: u64) -> Self {
        Self {
            header: None,
            body: None,
            number,
        }
    }

    /// True once both header and body are present.
    pub fn is_complete(&self) -> bool {
        self.header.is_some() && self.body.is_some()
    }
}

/// The normalized block payload the converter operates on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InternalEthBlock {
    /// Raw header RLP item.
    pub header: Vec<u8>,
    /// Raw transaction RLP items in block order.
    pub transactions: Vec<Vec<u8>>,
    /// Raw uncles list item.
    pub uncles: Vec<u8>,
    /// Total chain difficulty, zero when unknown.
    pub total_difficulty: u128,
}

impl InternalEthBlock {
    /// Builds from the `block` item of a `NewBlock` message.
    pub fn from_new_block(block: &[u8], total_difficulty: u128) -> Result<Self, GatewayError> {
        let rlp = Rlp::new(block);
        let header = rlp.at(0).map_err(|_| violation("header"))?.as_raw().to_vec();
        let txs_rlp = rlp.at(1).map_err(|_| violation("transactions"))?;
        if !txs_rlp.is_list() {
            return Err(violation("transactions not a list"));
        }
        let transactions = txs_rlp.iter().map(|item| item.as_raw().to_vec()).collect();
        let uncles = rlp.at(2).map_err(|_| violation("uncles"))?.as_raw().to_vec();
        Ok(Self {
            header,
            transactions,
            uncles,
            total_difficulty,
        })
    }

    /// Builds from a paired header and body, once both halves of an announced
    /// block have arrived.
    pub fn from_new_block_parts(
        parts: &NewBlockParts,
        total_difficulty: u128,
    ) -> Result<Self, GatewayError> {
        let header = parts.header.as_ref().ok_or_else(|| violation("missing header"))?;
        let body = parts.body.as_ref().ok_or_else(|| violation("missing body"))?;
        let body_rlp = Rlp::new(body);
        let txs_rlp = body_rlp.at(0).map_err(|_| violation("body transactions"))?;
        if !txs_rlp.is_list() {
            return Err(violation("body transactions not a list"));
        }
        let transactions = txs_rlp.iter().map(|item| item.as_raw().to_vec()).collect();
        let uncles = body_rlp
            .at(1)
            .map_err(|_| violation("body uncles"))?
            .as_raw()
            .to_vec();
        Ok(Self {
            header: header.clone(),
            transactions,
            uncles,
            total_difficulty,
        })
    }

    /// Serializes the normalized payload.
    pub fn encode_payload(&self) -> Vec<u8> {
        let mut stream = RlpStream::new_list(4);
        stream.append_raw(&self.header, 1);
        let mut txs = RlpStream::new_list(self.transactions.len());
        for tx in &self.transactions {
            txs.append_raw(tx, 1);
        }
        stream.append_raw(&txs.out(), 1);
        stream.append_raw(&self.uncles, 1);
        stream.append(&self.total_difficulty);
        stream.out().to_vec()
    }

    /// Parses a normalized payload.
    pub fn decode_payload(payload: &[u8]) -> Result<Self, GatewayError> {
        let rlp = Rlp::new(payload);
        let header = rlp.at(0).map_err(|_| violation("header"))?.as_raw().to_vec();
        let txs_rlp = rlp.at(1).map_err(|_| violation("transactions"))?;
        let transactions = txs_rlp.iter().map(|item| item.as_raw().to_vec()).collect();
        let uncles = rlp.at(2).map_err(|_| violation("uncles"))?.as_raw().to_vec();
        let total_difficulty = rlp.val_at(3).map_err(|_| violation("total difficulty"))?;
        Ok(Self {
            header,
            transactions,
            uncles,
            total_difficulty,
        })
    }

    /// Rebuilds the `NewBlock` message for the blockchain node.
    pub fn to_new_block_message(&self) -> EthMessage {
        let mut block = RlpStream::new_list(3);
        block.append_raw(&self.header, 1);
        let mut txs = RlpStream::new_list(self.transactions.len());
        for tx in &self.transactions {
            txs.append_raw(tx, 1);
        }
        block.append_raw(&txs.out(), 1);
        block.append_raw(&self.uncles, 1);
        EthMessage::NewBlock {
            block: block.out().to_vec(),
            total_difficulty: self.total_difficulty,
        }
    }

    /// keccak-256 of the raw header item.
    pub fn block_hash(&self) -> Sha256Hash {
        Sha256Hash::new(keccak256(&self.header))
    }

    /// Parent hash (header field 0).
    pub fn prev_block_hash(&self) -> Result<Sha256Hash, GatewayError> {
        let header = Rlp::new(&self.header);
        let bytes: Vec<u8> = header.val_at(0).map_err(|_| violation("parent hash"))?;
        Sha256Hash::from_slice(&bytes).ok_or_else(|| violation("parent hash length"))
    }

    /// Block difficulty (header field 7).
    pub fn difficulty(&self) -> Result<u128, GatewayError> {
        Rlp::new(&self.header)
            .val_at(7)
            .map_err(|_| violation("difficulty"))
    }

    /// Block number (header field 8).
    pub fn number(&self) -> Result<u64, GatewayError> {
        Rlp::new(&self.header)
            .val_at(8)
            .map_err(|_| violation("number"))
    }
}

/// Builds a minimal raw header item (synthetic blocks and fixtures).
pub fn build_header(parent: &Sha256Hash, difficulty: u128, number: u64) -> Vec<u8> {
    let mut stream = RlpStream::new_list(15);
    stream.append(&parent.as_bytes().to_vec()); // parent hash
    stream.append(&vec![0u8; 32]); // uncles hash
    stream.append(&vec![0u8; 20]); // coinbase
    stream.append(&vec![0u8; 32]); // state root
    stream.append(&vec![0u8; 32]); // transactions root
    stream.append(&vec![0u8; 32]); // receipts root
    stream.append(&vec![0u8; 256]); // bloom
    stream.append(&difficulty);
    stream.append(&number);
    stream.append(&8_000_000u64); // gas limit
    stream.append(&0u64); // gas used
    stream.append(&0u64); // timestamp
    stream.append(&Vec::<u8>::new()); // extra data
    stream.append(&vec![0u8; 32]); // mix hash
    stream.append(&vec![0u8; 8]); // nonce
    stream.out().to_vec()
}
