//! # Core Domain Entities
//!
//! Defines the entities every gateway subsystem speaks in:
//!
//! - **Hashes**: `Sha256Hash` object hashes and the double-SHA256 helper
//! - **Short ids**: the overlay-assigned compact transaction identifiers
//! - **Connections**: connection ids, roles, and lifecycle states
//! - **Alarms**: the `AlarmAction` tokens executed by the event loop

use sha2::{Digest, Sha256};
use std::fmt;

// =============================================================================
// HASHES
// =============================================================================

/// A 32-byte SHA-256 object hash (block hash or transaction hash).
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Sha256Hash(pub [u8; 32]);

impl Sha256Hash {
    /// Length of the binary hash in bytes.
    pub const LEN: usize = 32;

    /// Wraps raw hash bytes.
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Builds a hash from a slice; `None` if the length is not 32.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; 32] = bytes.try_into().ok()?;
        Some(Self(arr))
    }

    /// The raw hash bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// The hash with byte order reversed (Bitcoin display order).
    pub fn reversed(&self) -> [u8; 32] {
        let mut out = self.0;
        out.reverse();
        out
    }

    /// Lowercase hex rendering of the full hash.
    pub fn to_hex(&self) -> String {
        let mut s = String::with_capacity(64);
        for b in self.0 {
            s.push_str(&format!("{b:02x}"));
        }
        s
    }
}

impl fmt::Display for Sha256Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Sha256Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form keeps log lines readable.
        write!(f, "{}…", &self.to_hex()[..8])
    }
}

impl From<[u8; 32]> for Sha256Hash {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

/// SHA-256 of `data`.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let digest = Sha256::digest(data);
    digest.into()
}

/// Double SHA-256 of `data`, as used for Bitcoin object hashes and
/// encrypted-block identities.
pub fn double_sha256(data: &[u8]) -> Sha256Hash {
    Sha256Hash(sha256(&sha256(data)))
}

// =============================================================================
// SHORT IDS
// =============================================================================

/// Overlay-assigned compact transaction identifier.
pub type ShortId = u32;

/// Reserved "no short id" value.
pub const NULL_SHORT_ID: ShortId = 0;

// =============================================================================
// CONNECTIONS
// =============================================================================

/// Unique identifier of a peer connection within one gateway process.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Role bitmask of a peer connection.
///
/// A relay peer may serve blocks, transactions, or both; the mask gates which
/// message handlers accept its traffic.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ConnectionRole(u16);

impl ConnectionRole {
    /// No role assigned yet.
    pub const NONE: Self = Self(0);
    /// The local blockchain node.
    pub const BLOCKCHAIN_NODE: Self = Self(1);
    /// Relay peer serving block traffic.
    pub const RELAY_BLOCK: Self = Self(1 << 1);
    /// Relay peer serving transaction traffic.
    pub const RELAY_TRANSACTION: Self = Self(1 << 2);
    /// Relay peer serving both block and transaction traffic.
    pub const RELAY_ALL: Self = Self(Self::RELAY_BLOCK.0 | Self::RELAY_TRANSACTION.0);
    /// Peer gateway.
    pub const GATEWAY: Self = Self(1 << 3);
    /// Remote blockchain node used for proxied requests.
    pub const REMOTE_BLOCKCHAIN_NODE: Self = Self(1 << 4);

    /// True if every bit of `other` is set in `self`.
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// True if any bit of `other` is set in `self`.
    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }
}

impl std::ops::BitOr for ConnectionRole {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Lifecycle state of a peer connection.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ConnectionState {
    /// Socket opened, nothing exchanged yet.
    #[default]
    Connecting,
    /// Hello/version (or ECIES auth) in flight.
    Handshaking,
    /// Handshake complete; normal traffic flows.
    Established,
    /// Marked for close; pending writes drain, then the socket is released.
    Closing,
}

// =============================================================================
// ALARMS
// =============================================================================

/// Work tokens scheduled on the alarm queue and executed by the event loop.
///
/// Timer-driven behavior is expressed as explicit state plus one of these
/// tokens rather than as suspended functions, so all pending work remains
/// inspectable.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AlarmAction {
    /// A held block was never seen from the BDN; propagate the local copy.
    HoldTimeout(Sha256Hash),
    /// Re-request still-missing transactions for a recovering block.
    RecoveryRetry(Sha256Hash),
    /// Give up on a neutrality broadcast that never gathered receipts.
    NeutralityTimeout(Sha256Hash),
    /// Mark a compressed block's short ids as seen after the grace window.
    TrackSeenShortIds(Sha256Hash),
    /// Sweep all expiring caches.
    SweepCaches,
    /// Try to release the next queued block to the blockchain node.
    ReleaseNextBlock,
    /// Re-check blockchain node readiness after a `NotReady` push.
    NodeReadinessCheck,
    /// Send a protocol-level ping on a connection.
    SendPing(ConnectionId),
    /// Close a connection whose handshake never completed.
    HandshakeTimeout(ConnectionId),
    /// Close a discovery connection that never received a pong.
    DiscoveryPongTimeout(ConnectionId),
    /// Ask the blockchain node which recent blocks it has accepted.
    RequestBlockConfirmation(ConnectionId),
    /// End the grace period during which header requests are proxied rather
    /// than served locally.
    StopWaitingCheckpointHeaders(ConnectionId),
    /// Emit the periodic transaction stats log line.
    StatsFlush,
}
