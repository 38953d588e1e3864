//! Ethereum transport and subprotocol constants.

/// devp2p base protocol version.
pub const P2P_PROTOCOL_VERSION: u64 = 4;

/// eth subprotocol version the gateway speaks.
pub const ETH_PROTOCOL_VERSION: u64 = 63;

/// Recoverable signature length (r ‖ s ‖ v).
pub const SIGNATURE_LEN: usize = 65;

/// Uncompressed public key length without the SEC1 prefix.
pub const PUBLIC_KEY_LEN: usize = 64;

/// Private key length.
pub const PRIVATE_KEY_LEN: usize = 32;

/// Handshake nonce length.
pub const AUTH_NONCE_LEN: usize = 32;

/// Auth message version field.
pub const AUTH_MSG_VERSION: u64 = 4;

/// ECIES ciphertext overhead: header byte + 64-byte ephemeral key + 16-byte
/// IV + 32-byte tag.
pub const ECIES_ENCRYPT_OVERHEAD_LENGTH: usize = 113;

/// SEC1 uncompressed point prefix.
pub const ECIES_HEADER: u8 = 0x04;

/// AES key length used inside ECIES.
pub const ENC_KEY_LEN: usize = 16;

/// AES-CTR IV length.
pub const IV_LEN: usize = 16;

/// RLPx frame header: 16 ciphertext bytes plus a 16-byte MAC.
pub const FRAME_HDR_TOTAL_LEN: usize = 32;

/// Plaintext bytes of an RLPx frame header.
pub const FRAME_HDR_DATA_LEN: usize = 16;

/// RLPx MAC length.
pub const FRAME_MAC_LEN: usize = 16;

/// RLPx body padding granularity.
pub const MSG_PADDING: usize = 16;

/// Largest RLPx frame body accepted.
pub const FRAME_MAX_BODY_SIZE: usize = 256 * 256 * 256;

/// Seconds a discovery ping stays valid.
pub const PING_MSG_TTL_SEC: u64 = 60;

/// Handshake completion deadline.
pub const HANDSHAKE_TIMEOUT_SEC: u64 = 30;

/// Interval between protocol pings.
pub const PING_PONG_INTERVAL_SEC: u64 = 30;

/// Liveness deadline after an unanswered ping.
pub const PING_PONG_TIMEOUT_SEC: u64 = 60;

/// Deadline for the discovery pong.
pub const DISCOVERY_PONG_TIMEOUT_SEC: u64 = 5;

/// Grace period before header requests are served from the queuing service.
pub const CHECKPOINT_BLOCK_HEADERS_REQUEST_WAIT_TIME_S: u64 = 5;

/// How long header/body parts of an announced block may wait to pair up.
pub const NEW_BLOCK_PARTS_MAX_WAIT_S: u64 = 30;

/// Outstanding block-body request lists kept per connection.
pub const REQUESTED_NEW_BLOCK_BODIES_MAX_COUNT: usize = 100;

/// Disconnect reason sent on liveness timeout.
pub const DISCONNECT_REASON_TIMEOUT: u8 = 0x0B;
