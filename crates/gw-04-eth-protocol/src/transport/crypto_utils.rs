//! secp256k1 and keccak helpers shared by the transport modules.

use k256::ecdsa::{RecoveryId, Signature, SigningKey, VerifyingKey};
use k256::elliptic_curve::sec1::ToEncodedPoint;
use k256::{PublicKey, SecretKey};
use sha3::{Digest, Keccak256};
use shared_types::GatewayError;

use crate::domain::constants::{PUBLIC_KEY_LEN, SIGNATURE_LEN};

/// keccak-256 of `data`.
pub fn keccak256(data: &[u8]) -> [u8; 32] {
    Keccak256::digest(data).into()
}

/// keccak-256 over two concatenated buffers.
pub fn keccak256_pair(a: &[u8], b: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(a);
    hasher.update(b);
    hasher.finalize().into()
}

/// Serializes a public key to the 64-byte uncompressed form used on the
/// wire (no SEC1 prefix).
pub fn public_key_to_raw(public_key: &PublicKey) -> [u8; PUBLIC_KEY_LEN] {
    let point = public_key.to_encoded_point(false);
    point.as_bytes()[1..1 + PUBLIC_KEY_LEN]
        .try_into()
        .expect("uncompressed point is 65 bytes")
}

/// Parses a 64-byte uncompressed public key.
pub fn public_key_from_raw(raw: &[u8]) -> Result<PublicKey, GatewayError> {
    if raw.len() != PUBLIC_KEY_LEN {
        return Err(GatewayError::ProtocolViolation(format!(
            "public key of {} bytes",
            raw.len()
        )));
    }
    let mut sec1 = [0u8; 1 + PUBLIC_KEY_LEN];
    sec1[0] = 0x04;
    sec1[1..].copy_from_slice(raw);
    PublicKey::from_sec1_bytes(&sec1)
        .map_err(|_| GatewayError::ProtocolViolation("public key not on curve".into()))
}

/// ECDH agreement returning the shared x coordinate.
pub fn shared_secret(secret_key: &SecretKey, public_key: &PublicKey) -> [u8; 32] {
    let shared = k256::ecdh::diffie_hellman(secret_key.to_nonzero_scalar(), public_key.as_affine());
    (*shared.raw_secret_bytes()).into()
}

/// Signs a 32-byte prehash, producing the 65-byte recoverable form.
pub fn sign_recoverable(
    secret_key: &SecretKey,
    prehash: &[u8; 32],
) -> Result<[u8; SIGNATURE_LEN], GatewayError> {
    let signing_key = SigningKey::from(secret_key);
    let (signature, recovery_id) = signing_key
        .sign_prehash_recoverable(prehash)
        .map_err(|e| GatewayError::ProtocolViolation(format!("signing failed: {e}")))?;
    let mut out = [0u8; SIGNATURE_LEN];
    out[..64].copy_from_slice(&signature.to_bytes());
    out[64] = recovery_id.to_byte();
    Ok(out)
}

/// Recovers the signing public key from a 65-byte recoverable signature.
pub fn recover_public_key(
    prehash: &[u8; 32],
    signature: &[u8],
) -> Result<PublicKey, GatewayError> {
    if signature.len() != SIGNATURE_LEN {
        return Err(GatewayError::ProtocolViolation(format!(
            "signature of {} bytes",
            signature.len()
        )));
    }
    let sig = Signature::from_slice(&signature[..64])
        .map_err(|_| GatewayError::ProtocolViolation("malformed signature".into()))?;
    let recovery_id = RecoveryId::from_byte(signature[64])
        .ok_or_else(|| GatewayError::ProtocolViolation("bad recovery id".into()))?;
    let verifying_key = VerifyingKey::recover_from_prehash(prehash, &sig, recovery_id)
        .map_err(|_| GatewayError::ProtocolViolation("signature recovery failed".into()))?;
    Ok(PublicKey::from(&verifying_key))
}
