//! # Block Pipeline (GW-05)
//!
//! The services that move blocks between the blockchain node and the BDN:
//!
//! - **Processing**: the hold protocol, encrypted broadcast/key pairing, and
//!   decrypted-block orchestration
//! - **Recovery**: tracking blocks whose decompression hit unknown short ids,
//!   with a bounded retry schedule
//! - **Queuing**: ordered, throttled delivery to the blockchain node
//! - **Neutrality**: block encryption and receipt-gated key release
//! - **In-progress blocks**: the ciphertext + key pairing store
//!
//! ## Module Structure (Hexagonal Architecture)
//!
//! - `domain/` — the individual services and their configuration
//! - `ports/` — the `GatewayContext` capability interface the node
//!   implements for the pipeline
//! - `service.rs` — the [`BlockPipeline`] facade owning every service,
//!   driven by the node's single-threaded event loop
//! - `testing.rs` — the scripted context used by the unit and integration
//!   tests

pub mod domain;
pub mod ports;
pub mod service;
pub mod testing;

// Module re-exports keeping the crate's flat paths stable.
pub use domain::{config, in_progress, neutrality, queuing, recovery, stats};

pub use domain::config::{NeutralityPolicy, PipelineConfig};
pub use domain::in_progress::InProgressBlocks;
pub use domain::neutrality::NeutralityService;
pub use domain::queuing::BlockQueuingService;
pub use domain::recovery::{BlockAwaitingRecovery, BlockRecoveryService};
pub use domain::stats::GatewayStats;
pub use ports::{GatewayContext, NodeSendResult};
pub use service::BlockPipeline;
