//! Node discovery packets.
//!
//! The gateway only uses discovery to learn the blockchain node's public key:
//! it sends a signed `ping` and reads the identity out of the `pong`'s
//! recoverable signature. Packet layout:
//! `keccak(sig ‖ type ‖ data)(32) ‖ sig(65) ‖ type(1) ‖ rlp(data)`.

use k256::{PublicKey, SecretKey};
use rlp::{Rlp, RlpStream};
use shared_types::GatewayError;

use crate::domain::constants::SIGNATURE_LEN;
use crate::transport::crypto_utils::{keccak256, recover_public_key, sign_recoverable};

const PACKET_HASH_LEN: usize = 32;
const PACKET_TYPE_PING: u8 = 0x01;
const PACKET_TYPE_PONG: u8 = 0x02;
const DISCOVERY_PROTOCOL_VERSION: u64 = 4;

fn violation(reason: &str) -> GatewayError {
    GatewayError::ProtocolViolation(format!("discovery packet: {reason}"))
}

/// A UDP endpoint advertised in discovery messages.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Endpoint {
    /// 4-byte IPv4 or 16-byte IPv6 address.
    pub ip: Vec<u8>,
    pub udp_port: u16,
    pub tcp_port: u16,
}

impl Endpoint {
    fn append(&self, stream: &mut RlpStream) {
        stream.begin_list(3);
        stream.append(&self.ip);
        stream.append(&(self.udp_port as u64));
        stream.append(&(self.tcp_port as u64));
    }

    fn decode(rlp: &Rlp<'_>) -> Result<Self, GatewayError> {
        Ok(Self {
            ip: rlp.val_at(0).map_err(|_| violation("endpoint ip"))?,
            udp_port: rlp.val_at::<u64>(1).map_err(|_| violation("endpoint port"))? as u16,
            tcp_port: rlp.val_at::<u64>(2).map_err(|_| violation("endpoint port"))? as u16,
        })
    }
}

/// Discovery messages the gateway understands.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DiscoveryMessage {
    Ping {
        from: Endpoint,
        to: Endpoint,
        expiration: u64,
    },
    Pong {
        to: Endpoint,
        /// Hash of the ping being answered.
        echo: [u8; PACKET_HASH_LEN],
        expiration: u64,
    },
}

impl DiscoveryMessage {
    fn packet_type(&self) -> u8 {
        match self {
            Self::Ping { .. } => PACKET_TYPE_PING,
            Self::Pong { .. } => PACKET_TYPE_PONG,
        }
    }

    fn encode_data(&self) -> Vec<u8> {
        match self {
            Self::Ping {
                from,
                to,
                expiration,
            } => {
                let mut stream = RlpStream::new_list(4);
                stream.append(&DISCOVERY_PROTOCOL_VERSION);
                from.append(&mut stream);
                to.append(&mut stream);
                stream.append(expiration);
                stream.out().to_vec()
            }
            Self::Pong {
                to,
                echo,
                expiration,
            } => {
                let mut stream = RlpStream::new_list(3);
                to.append(&mut stream);
                stream.append(&echo.to_vec());
                stream.append(expiration);
                stream.out().to_vec()
            }
        }
    }

    fn decode_data(packet_type: u8, data: &[u8]) -> Result<Self, GatewayError> {
        let rlp = Rlp::new(data);
        match packet_type {
            PACKET_TYPE_PING => Ok(Self::Ping {
                from: Endpoint::decode(&rlp.at(1).map_err(|_| violation("ping from"))?)?,
                to: Endpoint::decode(&rlp.at(2).map_err(|_| violation("ping to"))?)?,
                expiration: rlp.val_at(3).map_err(|_| violation("ping expiration"))?,
            }),
            PACKET_TYPE_PONG => {
                let echo: Vec<u8> = rlp.val_at(1).map_err(|_| violation("pong echo"))?;
                Ok(Self::Pong {
                    to: Endpoint::decode(&rlp.at(0).map_err(|_| violation("pong to"))?)?,
                    echo: echo
                        .try_into()
                        .map_err(|_| violation("pong echo length"))?,
                    expiration: rlp.val_at(2).map_err(|_| violation("pong expiration"))?,
                })
            }
            other => Err(violation(&format!("unknown type {other:#04x}"))),
        }
    }
}

/// A decoded, signature-verified discovery packet.
#[derive(Clone, Debug)]
pub struct DiscoveryPacket {
    /// The sender's recovered public key.
    pub public_key: PublicKey,
    pub message: DiscoveryMessage,
    /// Packet hash (echoed in pong replies).
    pub packet_hash: [u8; PACKET_HASH_LEN],
}

/// Signs and serializes a discovery message.
pub fn encode_packet(secret_key: &SecretKey, message: &DiscoveryMessage) -> Result<Vec<u8>, GatewayError> {
    let data = message.encode_data();
    let mut signed_portion = Vec::with_capacity(1 + data.len());
    signed_portion.push(message.packet_type());
    signed_portion.extend_from_slice(&data);
    let signature = sign_recoverable(secret_key, &keccak256(&signed_portion))?;

    let mut tail = Vec::with_capacity(SIGNATURE_LEN + signed_portion.len());
    tail.extend_from_slice(&signature);
    tail.extend_from_slice(&signed_portion);
    let hash = keccak256(&tail);

    let mut out = Vec::with_capacity(PACKET_HASH_LEN + tail.len());
    out.extend_from_slice(&hash);
    out.extend_from_slice(&tail);
    Ok(out)
}

/// Parses a discovery packet, verifying its hash and recovering the sender.
pub fn decode_packet(packet: &[u8]) -> Result<DiscoveryPacket, GatewayError> {
    if packet.len() < PACKET_HASH_LEN + SIGNATURE_LEN + 1 {
        return Err(violation("too short"));
    }
    let (hash, tail) = packet.split_at(PACKET_HASH_LEN);
    if &keccak256(tail)[..] != hash {
        return Err(violation("hash mismatch"));
    }
    let (signature, signed_portion) = tail.split_at(SIGNATURE_LEN);
    let public_key = recover_public_key(&keccak256(signed_portion), signature)?;
    let message = DiscoveryMessage::decode_data(signed_portion[0], &signed_portion[1..])?;
    Ok(DiscoveryPacket {
        public_key,
        message,
        packet_hash: hash.try_into().expect("length checked"),
    })
}
