//! Bitcoin message framing.
//!
//! 24-byte header `[magic: u32 LE][command: 12B][length: u32 LE][checksum: 4B]`
//! followed by the payload; checksum is the first four bytes of
//! `dsha256(payload)`. Messages with an unknown command are surfaced so the
//! dispatcher can discard them without closing the connection.

use crate::domain::constants::{BTC_HDR_COMMON_OFF, BTC_HEADER_MINUS_CHECKSUM};
use shared_types::{double_sha256, GatewayError};

const COMMAND_LEN: usize = 12;

/// Commands recognized on the Bitcoin side.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BtcCommand {
    Version,
    Verack,
    Ping,
    Pong,
    GetAddr,
    Addr,
    Inv,
    GetData,
    NotFound,
    GetHeaders,
    GetBlocks,
    Tx,
    Block,
    Headers,
    Reject,
    SendHeaders,
    CompactBlock,
    SendCompact,
    GetBlockTxn,
    BlockTxn,
    FeeFilter,
}

impl BtcCommand {
    /// All recognized commands.
    pub const ALL: [BtcCommand; 21] = [
        Self::Version,
        Self::Verack,
        Self::Ping,
        Self::Pong,
        Self::GetAddr,
        Self::Addr,
        Self::Inv,
        Self::GetData,
        Self::NotFound,
        Self::GetHeaders,
        Self::GetBlocks,
        Self::Tx,
        Self::Block,
        Self::Headers,
        Self::Reject,
        Self::SendHeaders,
        Self::CompactBlock,
        Self::SendCompact,
        Self::GetBlockTxn,
        Self::BlockTxn,
        Self::FeeFilter,
    ];

    /// ASCII command string.
    pub fn as_bytes(&self) -> &'static [u8] {
        match self {
            Self::Version => b"version",
            Self::Verack => b"verack",
            Self::Ping => b"ping",
            Self::Pong => b"pong",
            Self::GetAddr => b"getaddr",
            Self::Addr => b"addr",
            Self::Inv => b"inv",
            Self::GetData => b"getdata",
            Self::NotFound => b"notfound",
            Self::GetHeaders => b"getheaders",
            Self::GetBlocks => b"getblocks",
            Self::Tx => b"tx",
            Self::Block => b"block",
            Self::Headers => b"headers",
            Self::Reject => b"reject",
            Self::SendHeaders => b"sendheaders",
            Self::CompactBlock => b"cmpctblock",
            Self::SendCompact => b"sendcmpct",
            Self::GetBlockTxn => b"getblocktxn",
            Self::BlockTxn => b"blocktxn",
            Self::FeeFilter => b"feefilter",
        }
    }

    fn from_field(field: &[u8; COMMAND_LEN]) -> Option<Self> {
        let end = field.iter().position(|b| *b == 0).unwrap_or(COMMAND_LEN);
        let cmd = &field[..end];
        Self::ALL.iter().copied().find(|c| c.as_bytes() == cmd)
    }
}

/// A decoded Bitcoin frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RawBtcFrame {
    /// Recognized command and its payload.
    Message(BtcCommand, Vec<u8>),
    /// Unknown command; discarded by the dispatcher.
    Unknown([u8; COMMAND_LEN]),
}

/// Builds a full wire message around `payload`.
pub fn encode_btc_message(magic: u32, command: BtcCommand, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(BTC_HDR_COMMON_OFF + payload.len());
    out.extend_from_slice(&magic.to_le_bytes());
    let mut cmd_field = [0u8; COMMAND_LEN];
    cmd_field[..command.as_bytes().len()].copy_from_slice(command.as_bytes());
    out.extend_from_slice(&cmd_field);
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(&double_sha256(payload).as_bytes()[..4]);
    out.extend_from_slice(payload);
    out
}

/// Incremental Bitcoin frame decoder; owns the inbound buffer of one
/// connection.
pub struct BtcFrameDecoder {
    buffer: Vec<u8>,
    magic: u32,
    max_payload: usize,
}

impl BtcFrameDecoder {
    /// Creates a decoder for the given network magic.
    pub fn new(magic: u32, max_payload: usize) -> Self {
        Self {
            buffer: Vec::new(),
            magic,
            max_payload,
        }
    }

    /// Appends freshly read bytes.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Extracts the next complete frame, if one is buffered.
    pub fn next_frame(&mut self) -> Result<Option<RawBtcFrame>, GatewayError> {
        if self.buffer.len() < BTC_HDR_COMMON_OFF {
            return Ok(None);
        }
        let magic = u32::from_le_bytes(self.buffer[..4].try_into().expect("length checked"));
        if magic != self.magic {
            return Err(GatewayError::ProtocolViolation(format!(
                "bad network magic {magic:#010x}"
            )));
        }
        let command: [u8; COMMAND_LEN] = self.buffer[4..4 + COMMAND_LEN]
            .try_into()
            .expect("length checked");
        let payload_len =
            u32::from_le_bytes(self.buffer[16..20].try_into().expect("length checked")) as usize;
        if payload_len > self.max_payload {
            return Err(GatewayError::ProtocolViolation(format!(
                "payload of {payload_len} bytes exceeds limit of {}",
                self.max_payload
            )));
        }

        let frame_len = BTC_HDR_COMMON_OFF + payload_len;
        if self.buffer.len() < frame_len {
            return Ok(None);
        }

        let payload = self.buffer[BTC_HDR_COMMON_OFF..frame_len].to_vec();
        let checksum = &self.buffer[BTC_HEADER_MINUS_CHECKSUM..BTC_HDR_COMMON_OFF];
        if checksum != &double_sha256(&payload).as_bytes()[..4] {
            return Err(GatewayError::ProtocolViolation(
                "payload checksum mismatch".into(),
            ));
        }
        self.buffer.drain(..frame_len);

        Ok(Some(match BtcCommand::from_field(&command) {
            Some(cmd) => RawBtcFrame::Message(cmd, payload),
            None => RawBtcFrame::Unknown(command),
        }))
    }
}
