//! RLPx transport: ECIES handshake and the framed cipher stream.
//!
//! The handshake is an explicit state machine driven by the connection's I/O
//! task; it produces [`RlpxSecrets`] from which the symmetric frame codec is
//! built. Frames are `[16B header ciphertext ‖ header MAC][padded body
//! ciphertext ‖ body MAC]` under AES-256-CTR with keccak-based MACs.

use aes::cipher::{BlockEncrypt, KeyInit, KeyIvInit, StreamCipher};
use aes::Aes256;
use k256::{PublicKey, SecretKey};
use rand::RngCore;
use rlp::{Rlp, RlpStream};
use sha3::{Digest, Keccak256};
use shared_types::GatewayError;

use crate::domain::constants::{
    AUTH_MSG_VERSION, AUTH_NONCE_LEN, FRAME_HDR_DATA_LEN, FRAME_MAC_LEN, FRAME_MAX_BODY_SIZE,
    MSG_PADDING, PUBLIC_KEY_LEN, SIGNATURE_LEN,
};
use crate::transport::crypto_utils::{
    keccak256_pair, public_key_from_raw, public_key_to_raw, recover_public_key, shared_secret,
    sign_recoverable,
};
use crate::transport::ecies;

type Aes256Ctr = ctr::Ctr128BE<Aes256>;

/// Random padding appended to EIP-8 handshake plaintexts.
const HANDSHAKE_PADDING_LEN: usize = 100;

fn xor32(a: &[u8; 32], b: &[u8; 32]) -> [u8; 32] {
    let mut out = [0u8; 32];
    for i in 0..32 {
        out[i] = a[i] ^ b[i];
    }
    out
}

fn violation(reason: &str) -> GatewayError {
    GatewayError::ProtocolViolation(reason.into())
}

// =============================================================================
// HANDSHAKE
// =============================================================================

/// Symmetric secrets agreed by the handshake.
pub struct RlpxSecrets {
    pub aes_secret: [u8; 32],
    pub mac_secret: [u8; 32],
    pub egress_mac: Keccak256,
    pub ingress_mac: Keccak256,
    /// The peer's static public key (recovered from `auth` on the recipient
    /// side).
    pub remote_public_key: PublicKey,
}

/// ECIES handshake state machine (EIP-8 message format).
pub struct RlpxHandshake {
    secret_key: SecretKey,
    ephemeral_key: SecretKey,
    nonce: [u8; AUTH_NONCE_LEN],
    auth_bytes: Vec<u8>,
    remote_public_key: Option<PublicKey>,
}

impl RlpxHandshake {
    /// Creates handshake state for the initiating side.
    pub fn new_initiator(secret_key: SecretKey, remote_public_key: PublicKey) -> Self {
        Self::new(secret_key, Some(remote_public_key))
    }

    /// Creates handshake state for the receiving side; the peer's identity is
    /// learned from its `auth`.
    pub fn new_recipient(secret_key: SecretKey) -> Self {
        Self::new(secret_key, None)
    }

    fn new(secret_key: SecretKey, remote_public_key: Option<PublicKey>) -> Self {
        let mut rng = rand::thread_rng();
        let mut nonce = [0u8; AUTH_NONCE_LEN];
        rng.fill_bytes(&mut nonce);
        Self {
            secret_key,
            ephemeral_key: SecretKey::random(&mut rng),
            nonce,
            auth_bytes: Vec::new(),
            remote_public_key,
        }
    }

    /// Builds the `auth` message (initiator only).
    pub fn create_auth(&mut self) -> Result<Vec<u8>, GatewayError> {
        let remote = self
            .remote_public_key
            .as_ref()
            .ok_or(GatewayError::CipherNotInitialized)?;

        let static_shared = shared_secret(&self.secret_key, remote);
        let to_sign = xor32(&static_shared, &self.nonce);
        let signature = sign_recoverable(&self.ephemeral_key, &to_sign)?;

        let mut stream = RlpStream::new_list(4);
        stream.append(&signature.to_vec());
        stream.append(&public_key_to_raw(&self.secret_key.public_key()).to_vec());
        stream.append(&self.nonce.to_vec());
        stream.append(&AUTH_MSG_VERSION);
        let mut plaintext = stream.out().to_vec();
        let mut padding = vec![0u8; HANDSHAKE_PADDING_LEN];
        rand::thread_rng().fill_bytes(&mut padding);
        plaintext.extend_from_slice(&padding);

        self.auth_bytes = Self::seal(remote, &plaintext)?;
        Ok(self.auth_bytes.clone())
    }

    /// Processes a received `auth` and builds the `ack` reply (recipient
    /// only). Returns the ack wire bytes and the agreed secrets.
    pub fn process_auth(
        &mut self,
        auth: &[u8],
    ) -> Result<(Vec<u8>, RlpxSecrets), GatewayError> {
        self.auth_bytes = auth.to_vec();
        let plaintext = Self::open(&self.secret_key, auth)?;
        let rlp = Rlp::new(&plaintext);
        let signature: Vec<u8> = rlp.val_at(0).map_err(|_| violation("auth rlp"))?;
        let initiator_pub_raw: Vec<u8> = rlp.val_at(1).map_err(|_| violation("auth rlp"))?;
        let initiator_nonce: Vec<u8> = rlp.val_at(2).map_err(|_| violation("auth rlp"))?;

        if signature.len() != SIGNATURE_LEN || initiator_nonce.len() != AUTH_NONCE_LEN {
            return Err(violation("auth field lengths"));
        }
        let initiator_public = public_key_from_raw(&initiator_pub_raw)?;
        let initiator_nonce: [u8; AUTH_NONCE_LEN] =
            initiator_nonce.try_into().expect("length checked");

        // Recover the initiator's ephemeral key from the signature over
        // (static-shared xor nonce).
        let static_shared = shared_secret(&self.secret_key, &initiator_public);
        let signed = xor32(&static_shared, &initiator_nonce);
        let initiator_ephemeral = recover_public_key(&signed, &signature)?;

        self.remote_public_key = Some(initiator_public);

        // Build the ack.
        let mut stream = RlpStream::new_list(3);
        stream.append(&public_key_to_raw(&self.ephemeral_key.public_key()).to_vec());
        stream.append(&self.nonce.to_vec());
        stream.append(&AUTH_MSG_VERSION);
        let mut plaintext = stream.out().to_vec();
        let mut padding = vec![0u8; HANDSHAKE_PADDING_LEN];
        rand::thread_rng().fill_bytes(&mut padding);
        plaintext.extend_from_slice(&padding);
        let ack_bytes = Self::seal(&initiator_public, &plaintext)?;

        let secrets = self.derive_secrets(
            &initiator_ephemeral,
            &initiator_nonce,
            &self.nonce.clone(),
            &ack_bytes,
            false,
        )?;
        Ok((ack_bytes, secrets))
    }

    /// Processes the received `ack` (initiator only), completing the
    /// handshake.
    pub fn process_ack(&mut self, ack: &[u8]) -> Result<RlpxSecrets, GatewayError> {
        let plaintext = Self::open(&self.secret_key, ack)?;
        let rlp = Rlp::new(&plaintext);
        let recipient_ephemeral_raw: Vec<u8> = rlp.val_at(0).map_err(|_| violation("ack rlp"))?;
        let recipient_nonce: Vec<u8> = rlp.val_at(1).map_err(|_| violation("ack rlp"))?;
        if recipient_nonce.len() != AUTH_NONCE_LEN {
            return Err(violation("ack nonce length"));
        }
        let recipient_ephemeral = public_key_from_raw(&recipient_ephemeral_raw)?;
        let recipient_nonce: [u8; AUTH_NONCE_LEN] =
            recipient_nonce.try_into().expect("length checked");

        self.derive_secrets(
            &recipient_ephemeral,
            &self.nonce.clone(),
            &recipient_nonce,
            ack,
            true,
        )
    }

    /// EIP-8 envelope: two-byte size prefix authenticated as shared MAC data.
    fn seal(remote: &PublicKey, plaintext: &[u8]) -> Result<Vec<u8>, GatewayError> {
        let body_len = plaintext.len() + crate::domain::constants::ECIES_ENCRYPT_OVERHEAD_LENGTH;
        let prefix = (body_len as u16).to_be_bytes();
        let sealed = ecies::encrypt(remote, plaintext, &prefix)?;
        let mut out = Vec::with_capacity(2 + sealed.len());
        out.extend_from_slice(&prefix);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    fn open(secret_key: &SecretKey, message: &[u8]) -> Result<Vec<u8>, GatewayError> {
        if message.len() < 2 {
            return Err(violation("handshake message too short"));
        }
        let prefix: [u8; 2] = message[..2].try_into().expect("length checked");
        let declared = u16::from_be_bytes(prefix) as usize;
        let body = message
            .get(2..2 + declared)
            .ok_or_else(|| violation("handshake size prefix past end"))?;
        ecies::decrypt(secret_key, body, &prefix)
    }

    fn derive_secrets(
        &self,
        remote_ephemeral: &PublicKey,
        initiator_nonce: &[u8; AUTH_NONCE_LEN],
        recipient_nonce: &[u8; AUTH_NONCE_LEN],
        ack_bytes: &[u8],
        initiator: bool,
    ) -> Result<RlpxSecrets, GatewayError> {
        let remote_public_key = self
            .remote_public_key
            .ok_or(GatewayError::CipherNotInitialized)?;
        let ephemeral_shared = shared_secret(&self.ephemeral_key, remote_ephemeral);

        let nonce_hash = keccak256_pair(recipient_nonce, initiator_nonce);
        let shared = keccak256_pair(&ephemeral_shared, &nonce_hash);
        let aes_secret = keccak256_pair(&ephemeral_shared, &shared);
        let mac_secret = keccak256_pair(&ephemeral_shared, &aes_secret);

        let mut auth_mac = Keccak256::new();
        auth_mac.update(xor32(&mac_secret, recipient_nonce));
        auth_mac.update(&self.auth_bytes);

        let mut ack_mac = Keccak256::new();
        ack_mac.update(xor32(&mac_secret, initiator_nonce));
        ack_mac.update(ack_bytes);

        let (egress_mac, ingress_mac) = if initiator {
            (auth_mac, ack_mac)
        } else {
            (ack_mac, auth_mac)
        };

        Ok(RlpxSecrets {
            aes_secret,
            mac_secret,
            egress_mac,
            ingress_mac,
            remote_public_key,
        })
    }
}

// =============================================================================
// FRAME CODEC
// =============================================================================

struct FrameMac {
    keccak: Keccak256,
    cipher: Aes256,
}

impl FrameMac {
    fn new(keccak: Keccak256, mac_secret: &[u8; 32]) -> Self {
        Self {
            keccak,
            cipher: Aes256::new_from_slice(mac_secret).expect("32-byte key"),
        }
    }

    fn digest16(&self) -> [u8; FRAME_MAC_LEN] {
        let digest = self.keccak.clone().finalize();
        digest[..FRAME_MAC_LEN].try_into().expect("keccak digest")
    }

    fn aes(&self, data: &[u8; FRAME_MAC_LEN]) -> [u8; FRAME_MAC_LEN] {
        let mut block = [0u8; 16];
        block.copy_from_slice(data);
        let mut ga = aes::cipher::generic_array::GenericArray::from(block);
        self.cipher.encrypt_block(&mut ga);
        ga.into()
    }

    /// MAC over an encrypted header block.
    fn header_mac(&mut self, header_ciphertext: &[u8; FRAME_HDR_DATA_LEN]) -> [u8; FRAME_MAC_LEN] {
        let mut seed = self.aes(&self.digest16());
        for i in 0..FRAME_MAC_LEN {
            seed[i] ^= header_ciphertext[i];
        }
        self.keccak.update(seed);
        self.digest16()
    }

    /// MAC over an encrypted frame body.
    fn body_mac(&mut self, body_ciphertext: &[u8]) -> [u8; FRAME_MAC_LEN] {
        self.keccak.update(body_ciphertext);
        let prev = self.digest16();
        let mut seed = self.aes(&prev);
        for i in 0..FRAME_MAC_LEN {
            seed[i] ^= prev[i];
        }
        self.keccak.update(seed);
        self.digest16()
    }
}

#[derive(Clone, Copy)]
enum ReadState {
    Header,
    Body { frame_size: usize },
}

/// Symmetric RLPx frame cipher for one established connection.
pub struct RlpxFrameCodec {
    egress_cipher: Aes256Ctr,
    ingress_cipher: Aes256Ctr,
    egress_mac: FrameMac,
    ingress_mac: FrameMac,
    buffer: Vec<u8>,
    read_state: ReadState,
}

impl RlpxFrameCodec {
    /// Builds the codec from handshake secrets.
    pub fn new(secrets: RlpxSecrets) -> Self {
        let zero_iv = [0u8; 16];
        Self {
            egress_cipher: Aes256Ctr::new_from_slices(&secrets.aes_secret, &zero_iv)
                .expect("fixed lengths"),
            ingress_cipher: Aes256Ctr::new_from_slices(&secrets.aes_secret, &zero_iv)
                .expect("fixed lengths"),
            egress_mac: FrameMac::new(secrets.egress_mac, &secrets.mac_secret),
            ingress_mac: FrameMac::new(secrets.ingress_mac, &secrets.mac_secret),
            buffer: Vec::new(),
            read_state: ReadState::Header,
        }
    }

    /// Encodes one subprotocol message as a wire frame.
    pub fn write_frame(&mut self, msg_id: u64, payload: &[u8]) -> Result<Vec<u8>, GatewayError> {
        let mut content = rlp::encode(&msg_id).to_vec();
        content.extend_from_slice(payload);
        self.seal_content(&content)
    }

    /// Encodes already id-prefixed frame content (`rlp(msg_id) ‖ payload`),
    /// the form plaintext messages travel in between the event loop and the
    /// connection's writer task.
    pub fn seal_content(&mut self, content: &[u8]) -> Result<Vec<u8>, GatewayError> {
        let frame_size = content.len();
        if frame_size > FRAME_MAX_BODY_SIZE {
            return Err(violation("frame body too large"));
        }

        let mut header = [0u8; FRAME_HDR_DATA_LEN];
        header[..3].copy_from_slice(&(frame_size as u32).to_be_bytes()[1..]);
        // header-data: rlp [capability-id 0, context-id 0]
        header[3..6].copy_from_slice(&[0xC2, 0x80, 0x80]);
        self.egress_cipher.apply_keystream(&mut header);
        let header_mac = self.egress_mac.header_mac(&header);

        let padded_len = frame_size.div_ceil(MSG_PADDING) * MSG_PADDING;
        let mut body = Vec::with_capacity(padded_len);
        body.extend_from_slice(content);
        body.resize(padded_len, 0);
        self.egress_cipher.apply_keystream(&mut body);
        let body_mac = self.egress_mac.body_mac(&body);

        let mut out = Vec::with_capacity(FRAME_HDR_DATA_LEN + FRAME_MAC_LEN + body.len() + 16);
        out.extend_from_slice(&header);
        out.extend_from_slice(&header_mac);
        out.extend_from_slice(&body);
        out.extend_from_slice(&body_mac);
        Ok(out)
    }

    /// Appends freshly read bytes.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Extracts the next complete message, if buffered: `(msg_id, payload)`.
    pub fn next_message(&mut self) -> Result<Option<(u64, Vec<u8>)>, GatewayError> {
        loop {
            match self.read_state {
                ReadState::Header => {
                    if self.buffer.len() < FRAME_HDR_DATA_LEN + FRAME_MAC_LEN {
                        return Ok(None);
                    }
                    let mut header: [u8; FRAME_HDR_DATA_LEN] = self.buffer
                        [..FRAME_HDR_DATA_LEN]
                        .try_into()
                        .expect("length checked");
                    let wire_mac =
                        &self.buffer[FRAME_HDR_DATA_LEN..FRAME_HDR_DATA_LEN + FRAME_MAC_LEN];
                    let expected = self.ingress_mac.header_mac(&header);
                    if wire_mac != &expected[..] {
                        return Err(violation("header mac mismatch"));
                    }
                    self.ingress_cipher.apply_keystream(&mut header);
                    let frame_size =
                        u32::from_be_bytes([0, header[0], header[1], header[2]]) as usize;
                    if frame_size > FRAME_MAX_BODY_SIZE {
                        return Err(violation("frame body too large"));
                    }
                    self.buffer.drain(..FRAME_HDR_DATA_LEN + FRAME_MAC_LEN);
                    self.read_state = ReadState::Body { frame_size };
                }
                ReadState::Body { frame_size } => {
                    let padded_len = frame_size.div_ceil(MSG_PADDING) * MSG_PADDING;
                    if self.buffer.len() < padded_len + FRAME_MAC_LEN {
                        return Ok(None);
                    }
                    let expected = self.ingress_mac.body_mac(&self.buffer[..padded_len]);
                    if self.buffer[padded_len..padded_len + FRAME_MAC_LEN] != expected[..] {
                        return Err(violation("body mac mismatch"));
                    }
                    let mut body = self.buffer[..padded_len].to_vec();
                    self.ingress_cipher.apply_keystream(&mut body);
                    self.buffer.drain(..padded_len + FRAME_MAC_LEN);
                    self.read_state = ReadState::Header;

                    body.truncate(frame_size);
                    let id_len = crate::domain::rlp_utils::rlp_item_len(&body, 0)?;
                    let msg_id: u64 = Rlp::new(&body[..id_len])
                        .as_val()
                        .map_err(|_| violation("frame message id"))?;
                    let payload = body[id_len..].to_vec();
                    return Ok(Some((msg_id, payload)));
                }
            }
        }
    }
}
