//! Overlay message types and their wire commands.

use crate::domain::constants::COMMAND_LEN;

/// Message types of the overlay protocol.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BxMessageType {
    Hello,
    Ack,
    Ping,
    Pong,
    /// Encrypted (or plaintext) bx-block broadcast.
    Broadcast,
    /// Decryption key for a previously broadcast block.
    Key,
    /// Single transaction, optionally carrying a short id and contents.
    Transaction,
    /// Batched transactions answering a `gettxs` request.
    Transactions,
    /// Request for transactions by short id.
    GetTransactions,
    /// A peer claims it will propagate a block; hold the local copy.
    BlockHolding,
    /// Receipt confirming an encrypted block arrived at a gateway.
    BlockReceived,
    /// Relay asks the gateway to drop it and request a new relay.
    DisconnectRelayPeer,
    /// Transaction service sync snapshot chunk.
    TxServiceSyncTxs,
    /// Transaction service sync finished.
    TxServiceSyncComplete,
    /// Block accepted by the blockchain node; clean its transactions.
    BlockConfirmation,
    /// Explicit transaction cleanup request.
    TransactionCleanup,
}

impl BxMessageType {
    /// All known message types.
    pub const ALL: [BxMessageType; 16] = [
        Self::Hello,
        Self::Ack,
        Self::Ping,
        Self::Pong,
        Self::Broadcast,
        Self::Key,
        Self::Transaction,
        Self::Transactions,
        Self::GetTransactions,
        Self::BlockHolding,
        Self::BlockReceived,
        Self::DisconnectRelayPeer,
        Self::TxServiceSyncTxs,
        Self::TxServiceSyncComplete,
        Self::BlockConfirmation,
        Self::TransactionCleanup,
    ];

    /// ASCII command string on the wire.
    pub fn command(&self) -> &'static [u8] {
        match self {
            Self::Hello => b"hello",
            Self::Ack => b"ack",
            Self::Ping => b"ping",
            Self::Pong => b"pong",
            Self::Broadcast => b"broadcast",
            Self::Key => b"key",
            Self::Transaction => b"tx",
            Self::Transactions => b"txs",
            Self::GetTransactions => b"gettxs",
            Self::BlockHolding => b"blkholding",
            Self::BlockReceived => b"blkrecv",
            Self::DisconnectRelayPeer => b"dropr",
            Self::TxServiceSyncTxs => b"txstart",
            Self::TxServiceSyncComplete => b"txdone",
            Self::BlockConfirmation => b"blkcnfrm",
            Self::TransactionCleanup => b"txclnup",
        }
    }

    /// Null-padded command field.
    pub fn padded_command(&self) -> [u8; COMMAND_LEN] {
        let mut out = [0u8; COMMAND_LEN];
        let cmd = self.command();
        out[..cmd.len()].copy_from_slice(cmd);
        out
    }

    /// Parses a null-padded command field; `None` for unknown commands.
    pub fn from_command(field: &[u8; COMMAND_LEN]) -> Option<Self> {
        let end = field.iter().position(|b| *b == 0).unwrap_or(COMMAND_LEN);
        let cmd = &field[..end];
        Self::ALL.iter().copied().find(|t| t.command() == cmd)
    }
}
