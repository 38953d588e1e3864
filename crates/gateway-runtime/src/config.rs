//! Gateway configuration: CLI flags plus an optional TOML override file.

use clap::{Parser, ValueEnum};
use gw_05_block_pipeline::{NeutralityPolicy, PipelineConfig};
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

/// Which blockchain the gateway bridges.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum BlockchainProtocol {
    Btc,
    Eth,
}

/// Command line surface of the gateway.
#[derive(Clone, Debug, Parser)]
#[command(name = "bdn-gateway", about = "Relay gateway bridging a blockchain node with the BDN")]
pub struct GatewayOpts {
    /// Blockchain protocol of the local node.
    #[arg(long, value_enum, default_value_t = BlockchainProtocol::Btc)]
    pub blockchain_protocol: BlockchainProtocol,

    /// Named blockchain network (mainnet, testnet, ...).
    #[arg(long, default_value = "mainnet")]
    pub blockchain_network: String,

    /// Address of the local blockchain node.
    #[arg(long, default_value = "127.0.0.1")]
    pub blockchain_ip: IpAddr,

    /// Port of the local blockchain node.
    #[arg(long, default_value_t = 8333)]
    pub blockchain_port: u16,

    /// Externally reachable address advertised to peers.
    #[arg(long)]
    pub external_ip: Option<IpAddr>,

    /// Externally reachable port advertised to peers.
    #[arg(long, default_value_t = 1801)]
    pub external_port: u16,

    /// Node identifier; generated when absent.
    #[arg(long)]
    pub node_id: Option<String>,

    /// Overlay network number.
    #[arg(long, default_value_t = 1)]
    pub network_num: u32,

    /// Relay peers to connect to.
    #[arg(long = "relay-peer")]
    pub relay_peers: Vec<SocketAddr>,

    /// Remote blockchain node for proxied requests.
    #[arg(long)]
    pub remote_blockchain_peer: Option<SocketAddr>,

    /// SDN endpoint, remembered across runs via the cookie file.
    #[arg(long)]
    pub sdn_url: Option<String>,

    /// Seconds to sit on a held block before propagating it anyway.
    #[arg(long, default_value_t = 0.5)]
    pub blockchain_block_hold_timeout_s: f64,

    /// Overall deadline for block short-id recovery, in seconds.
    #[arg(long, default_value_t = 15.0)]
    pub blockchain_block_recovery_timeout_s: f64,

    /// Write each compressed block's short id mapping to disk.
    #[arg(long)]
    pub dump_short_id_mapping_compression: bool,

    /// Genesis block hash of the blockchain network (64 hex chars), sent in
    /// the Ethereum status handshake. Required with `--blockchain-protocol
    /// eth`.
    #[arg(long)]
    pub genesis_hash: Option<String>,

    /// secp256k1 private key (hex) for the Ethereum transport.
    #[arg(long)]
    pub eth_private_key: Option<String>,

    /// The Ethereum node's public key (128 hex chars), if already known;
    /// otherwise discovery learns it.
    #[arg(long)]
    pub eth_node_public_key: Option<String>,

    /// Optional TOML file with peer overrides.
    #[arg(long)]
    pub config: Option<PathBuf>,
}

/// Subset of options accepted from the TOML override file.
#[derive(Debug, Default, Deserialize)]
pub struct FileOverrides {
    #[serde(default)]
    pub relay_peers: Vec<SocketAddr>,
    pub sdn_url: Option<String>,
    pub remote_blockchain_peer: Option<SocketAddr>,
    pub genesis_hash: Option<String>,
}

impl GatewayOpts {
    /// Applies the TOML override file, if configured.
    pub fn apply_file_overrides(&mut self) -> anyhow::Result<()> {
        let Some(path) = &self.config else {
            return Ok(());
        };
        let contents = std::fs::read_to_string(path)?;
        let overrides: FileOverrides = toml::from_str(&contents)?;
        self.relay_peers.extend(overrides.relay_peers);
        if self.sdn_url.is_none() {
            self.sdn_url = overrides.sdn_url;
        }
        if self.remote_blockchain_peer.is_none() {
            self.remote_blockchain_peer = overrides.remote_blockchain_peer;
        }
        if self.genesis_hash.is_none() {
            self.genesis_hash = overrides.genesis_hash;
        }
        Ok(())
    }

    /// External IP, defaulting to the unspecified address.
    pub fn external_ip_or_default(&self) -> IpAddr {
        self.external_ip
            .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
    }

    /// Pipeline configuration derived from these options.
    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            network_num: self.network_num,
            blockchain_block_hold_timeout: Duration::from_secs_f64(
                self.blockchain_block_hold_timeout_s,
            ),
            blockchain_block_recovery_timeout: Duration::from_secs_f64(
                self.blockchain_block_recovery_timeout_s,
            ),
            neutrality_policy: NeutralityPolicy::ReceiptPercent,
            neutrality_expected_receipt_count: 1,
            neutrality_expected_receipt_percent: 50.0,
            dump_short_id_mapping: self.dump_short_id_mapping_compression,
        }
    }
}

/// Exit code for configuration failures.
pub const EXIT_FATAL_CONFIG: i32 = 1;

/// Exit code when the blockchain network is unreachable.
pub const EXIT_NETWORK_UNREACHABLE: i32 = 2;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let opts = GatewayOpts::parse_from(["bdn-gateway"]);
        assert_eq!(opts.blockchain_protocol, BlockchainProtocol::Btc);
        assert_eq!(opts.blockchain_port, 8333);
        assert_eq!(opts.network_num, 1);
        assert!(!opts.dump_short_id_mapping_compression);
    }

    #[test]
    fn test_eth_selection_and_timeouts() {
        let opts = GatewayOpts::parse_from([
            "bdn-gateway",
            "--blockchain-protocol",
            "eth",
            "--blockchain-port",
            "30303",
            "--genesis-hash",
            "d4e56740f876aef8c010b86a40d5f56745a118d0906a34e69aec8c0db1cb8fa3",
            "--blockchain-block-hold-timeout-s",
            "0.2",
            "--relay-peer",
            "10.0.0.1:1809",
            "--relay-peer",
            "10.0.0.2:1809",
        ]);
        assert_eq!(opts.blockchain_protocol, BlockchainProtocol::Eth);
        assert_eq!(opts.relay_peers.len(), 2);
        assert!(opts.genesis_hash.is_some());
        let pipeline = opts.pipeline_config();
        assert_eq!(
            pipeline.blockchain_block_hold_timeout,
            Duration::from_millis(200)
        );
    }

    #[test]
    fn test_file_overrides_extend_relays() {
        let dir = std::env::temp_dir().join(format!("gw-config-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.toml");
        std::fs::write(
            &path,
            "relay_peers = [\"10.1.1.1:1809\"]\nsdn_url = \"https://sdn.example\"\ngenesis_hash = \"00000000000000000000000000000000000000000000000000000000000000aa\"\n",
        )
        .unwrap();

        let mut opts = GatewayOpts::parse_from([
            "bdn-gateway",
            "--config",
            path.to_str().unwrap(),
        ]);
        opts.apply_file_overrides().unwrap();
        assert_eq!(opts.relay_peers.len(), 1);
        assert_eq!(opts.sdn_url.as_deref(), Some("https://sdn.example"));
        assert!(opts.genesis_hash.as_deref().unwrap().ends_with("aa"));
        std::fs::remove_dir_all(&dir).ok();
    }
}
