//! Bitcoin wire constants.

/// Wire message header size: magic + command + length + checksum.
pub const BTC_HDR_COMMON_OFF: usize = 24;

/// Offset of the checksum field within the message header.
pub const BTC_HEADER_MINUS_CHECKSUM: usize = 20;

/// Serialized block header size.
pub const BTC_BLOCK_HDR_SIZE: usize = 80;

/// Length of a Bitcoin object hash.
pub const BTC_SHA_HASH_LEN: usize = 32;

/// Mainnet network magic.
pub const BTC_MAINNET_MAGIC: u32 = 0xD9B4_BEF9;

/// Testnet3 network magic.
pub const BTC_TESTNET_MAGIC: u32 = 0x0709_110B;

/// Protocol version the gateway advertises.
pub const BTC_PROTOCOL_VERSION: i32 = 70015;

/// Node services bits the gateway advertises (none).
pub const BTC_NODE_SERVICES: u64 = 0;

/// Outpoint size within a transaction input.
pub const BTC_TX_OUTPOINT_LEN: usize = 36;

/// Segwit marker byte.
pub const BTC_TX_SEGWIT_MARKER: u8 = 0x00;

/// Segwit flag byte.
pub const BTC_TX_SEGWIT_FLAG: u8 = 0x01;
