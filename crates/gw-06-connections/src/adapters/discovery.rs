//! Ethereum discovery connection.
//!
//! A short-lived UDP exchange whose only purpose is learning the blockchain
//! node's public key: send a signed ping, recover the node's identity from
//! the pong's signature, record it, and close. No pong within the timeout
//! closes the connection with a discovery timeout.

use gw_04_eth_protocol::constants::{DISCOVERY_PONG_TIMEOUT_SEC, PING_MSG_TTL_SEC};
use gw_04_eth_protocol::crypto_utils::public_key_to_raw;
use gw_04_eth_protocol::discovery::{
    decode_packet, encode_packet, DiscoveryMessage, Endpoint,
};
use gw_05_block_pipeline::GatewayContext;
use k256::SecretKey;
use shared_types::{AlarmAction, GatewayError, Sha256Hash};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

use crate::domain::ConnectionInfo;

/// State machine for the discovery exchange with the Ethereum node.
pub struct EthDiscoveryProtocol {
    pub info: ConnectionInfo,
    secret_key: SecretKey,
    pong_received: bool,
    ping_hash: Sha256Hash,
}

impl EthDiscoveryProtocol {
    /// Sends the signed ping and arms the pong timeout.
    pub fn new(
        info: ConnectionInfo,
        secret_key: SecretKey,
        local: Endpoint,
        remote: Endpoint,
        ctx: &mut dyn GatewayContext,
    ) -> Result<Self, GatewayError> {
        let expiration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
            + PING_MSG_TTL_SEC;
        let ping = DiscoveryMessage::Ping {
            from: local,
            to: remote,
            expiration,
        };
        let packet = encode_packet(&secret_key, &ping)?;
        let ping_hash = Sha256Hash::from_slice(&packet[..32]).expect("packet hash window");
        ctx.send_to_connection(info.id, packet);
        ctx.schedule(
            Duration::from_secs(DISCOVERY_PONG_TIMEOUT_SEC),
            AlarmAction::DiscoveryPongTimeout(info.id),
        );
        Ok(Self {
            info,
            secret_key,
            pong_received: false,
            ping_hash,
        })
    }

    /// Handles one inbound datagram.
    pub fn on_datagram(&mut self, datagram: &[u8], ctx: &mut dyn GatewayContext) {
        let packet = match decode_packet(datagram) {
            Ok(packet) => packet,
            Err(err) => {
                debug!(conn = %self.info.id, %err, "undecodable discovery packet");
                return;
            }
        };
        match packet.message {
            DiscoveryMessage::Pong { .. } => {
                debug!(conn = %self.info.id, "discovery pong, recording node public key");
                self.pong_received = true;
                ctx.set_remote_public_key(self.info.id, public_key_to_raw(&packet.public_key));
                ctx.mark_for_close(self.info.id);
            }
            DiscoveryMessage::Ping { .. } => {
                // The node may probe back; it already has our key from the
                // ping signature, so there is nothing to answer with here.
            }
        }
    }

    /// Pong timeout entry point.
    pub fn on_pong_timeout(&mut self, ctx: &mut dyn GatewayContext) {
        if !self.pong_received {
            warn!(
                conn = %self.info.id,
                "{}",
                GatewayError::Timeout("discovery pong".into())
            );
            ctx.mark_for_close(self.info.id);
        }
    }

    /// Hash of the ping this connection sent (echoed by a valid pong).
    pub fn ping_hash(&self) -> Sha256Hash {
        self.ping_hash
    }

    /// The key this connection signs with.
    pub fn secret_key(&self) -> &SecretKey {
        &self.secret_key
    }
}
