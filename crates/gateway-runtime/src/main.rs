//! # BDN Gateway
//!
//! Entry point: parse configuration, restore the cookie, wire the node, and
//! run the event loop until interrupted.
//!
//! Exit codes: 0 clean shutdown, 1 fatal configuration, 2 blockchain network
//! unreachable.

use anyhow::Result;
use clap::Parser;
use gateway_runtime::config::{EXIT_FATAL_CONFIG, EXIT_NETWORK_UNREACHABLE};
use gateway_runtime::{cookie, GatewayNode, GatewayOpts};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut opts = GatewayOpts::parse();
    if let Err(err) = opts.apply_file_overrides() {
        error!(%err, "invalid configuration file");
        std::process::exit(EXIT_FATAL_CONFIG);
    }

    let node_id = opts
        .node_id
        .clone()
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    info!(node_id, "starting bdn-gateway");

    // Remember the SDN endpoint across runs.
    let base_dir = Path::new(".");
    let mut cookies = cookie::load(base_dir, &node_id);
    if opts.sdn_url.is_none() {
        opts.sdn_url = cookies.sdn_url.clone();
    }
    if cookies.sdn_url != opts.sdn_url {
        cookies.sdn_url = opts.sdn_url.clone();
        if let Err(err) = cookie::store(base_dir, &node_id, &cookies) {
            error!(%err, "could not write cookie file");
        }
    }

    let node_addr = SocketAddr::new(opts.blockchain_ip, opts.blockchain_port);
    if let Err(err) = probe_blockchain_node(node_addr).await {
        error!(%node_addr, %err, "blockchain node unreachable");
        std::process::exit(EXIT_NETWORK_UNREACHABLE);
    }

    let node_id_bytes = node_id_bytes(&node_id);
    let mut node = match GatewayNode::new(opts, node_id_bytes) {
        Ok(node) => node,
        Err(err) => {
            error!(%err, "invalid configuration");
            std::process::exit(EXIT_FATAL_CONFIG);
        }
    };
    node.start();

    tokio::select! {
        () = node.run() => {
            error!("event loop terminated");
        }
        result = tokio::signal::ctrl_c() => {
            if let Err(err) = result {
                error!(%err, "signal handler failed");
            }
            info!("shutting down");
        }
    }
}

/// A quick reachability probe so a dead node address fails fast with the
/// documented exit code.
async fn probe_blockchain_node(addr: SocketAddr) -> Result<()> {
    let connect = tokio::net::TcpStream::connect(addr);
    tokio::time::timeout(Duration::from_secs(5), connect).await??;
    Ok(())
}

/// Fixed-width wire form of the node id.
fn node_id_bytes(node_id: &str) -> [u8; 16] {
    match uuid::Uuid::parse_str(node_id) {
        Ok(uuid) => *uuid.as_bytes(),
        Err(_) => {
            let mut out = [0u8; 16];
            let bytes = node_id.as_bytes();
            let len = bytes.len().min(16);
            out[..len].copy_from_slice(&bytes[..len]);
            out
        }
    }
}
