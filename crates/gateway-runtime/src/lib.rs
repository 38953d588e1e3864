//! # Gateway Runtime
//!
//! Process-level wiring for the BDN gateway: configuration and CLI surface,
//! the cookie file, the single-threaded event loop that owns the block
//! pipeline and all protocol state machines, and the socket I/O tasks that
//! feed it.

pub mod config;
pub mod cookie;
pub mod io;
pub mod node;

pub use config::{BlockchainProtocol, GatewayOpts};
pub use node::{GatewayNode, NodeEvent};
