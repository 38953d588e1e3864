//! Ports: how the pipeline reaches the rest of the node.

pub mod outbound;

pub use outbound::{GatewayContext, NodeSendResult};
