//! ECIES encryption for the RLPx handshake.
//!
//! Ciphertext layout: `0x04 ‖ ephemeral-pubkey(64) ‖ iv(16) ‖ ciphertext ‖
//! hmac-sha256-tag(32)`. Keys derive from the ECDH shared x coordinate via
//! the NIST concatenation KDF over SHA-256; the body cipher is AES-128-CTR
//! and the tag authenticates `iv ‖ ciphertext ‖ shared_mac_data` (the EIP-8
//! size prefix).

use aes::cipher::{KeyIvInit, StreamCipher};
use aes::Aes128;
use hmac::{Hmac, Mac};
use k256::{PublicKey, SecretKey};
use rand::RngCore;
use sha2::{Digest, Sha256};
use shared_types::GatewayError;

use crate::domain::constants::{
    ECIES_ENCRYPT_OVERHEAD_LENGTH, ECIES_HEADER, ENC_KEY_LEN, IV_LEN, PUBLIC_KEY_LEN,
};
use crate::transport::crypto_utils::{public_key_from_raw, public_key_to_raw, shared_secret};

type Aes128Ctr = ctr::Ctr128BE<Aes128>;
type HmacSha256 = Hmac<Sha256>;

/// NIST SP 800-56 concatenation KDF over SHA-256, producing `len` bytes.
fn concat_kdf(shared: &[u8; 32], len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(len);
    let mut counter: u32 = 1;
    while out.len() < len {
        let mut hasher = Sha256::new();
        hasher.update(counter.to_be_bytes());
        hasher.update(shared);
        out.extend_from_slice(&hasher.finalize());
        counter += 1;
    }
    out.truncate(len);
    out
}

fn derive_keys(shared: &[u8; 32]) -> ([u8; ENC_KEY_LEN], [u8; 32]) {
    let material = concat_kdf(shared, 2 * ENC_KEY_LEN);
    let enc_key: [u8; ENC_KEY_LEN] = material[..ENC_KEY_LEN]
        .try_into()
        .expect("kdf output length");
    // The MAC key is the hash of the second half of the derived material.
    let mac_key: [u8; 32] = Sha256::digest(&material[ENC_KEY_LEN..]).into();
    (enc_key, mac_key)
}

/// Encrypts `plaintext` to `remote_public_key`.
pub fn encrypt(
    remote_public_key: &PublicKey,
    plaintext: &[u8],
    shared_mac_data: &[u8],
) -> Result<Vec<u8>, GatewayError> {
    let mut rng = rand::thread_rng();
    let ephemeral = SecretKey::random(&mut rng);
    let shared = shared_secret(&ephemeral, remote_public_key);
    let (enc_key, mac_key) = derive_keys(&shared);

    let mut iv = [0u8; IV_LEN];
    rng.fill_bytes(&mut iv);

    let mut body = plaintext.to_vec();
    let mut cipher = Aes128Ctr::new_from_slices(&enc_key, &iv)
        .map_err(|_| GatewayError::ProtocolViolation("cipher init".into()))?;
    cipher.apply_keystream(&mut body);

    let mut mac = HmacSha256::new_from_slice(&mac_key).expect("hmac accepts any key length");
    mac.update(&iv);
    mac.update(&body);
    mac.update(shared_mac_data);
    let tag = mac.finalize().into_bytes();

    let mut out = Vec::with_capacity(ECIES_ENCRYPT_OVERHEAD_LENGTH + plaintext.len());
    out.push(ECIES_HEADER);
    out.extend_from_slice(&public_key_to_raw(&ephemeral.public_key()));
    out.extend_from_slice(&iv);
    out.extend_from_slice(&body);
    out.extend_from_slice(&tag);
    Ok(out)
}

/// Decrypts an ECIES message addressed to `secret_key`.
pub fn decrypt(
    secret_key: &SecretKey,
    message: &[u8],
    shared_mac_data: &[u8],
) -> Result<Vec<u8>, GatewayError> {
    if message.len() < ECIES_ENCRYPT_OVERHEAD_LENGTH || message[0] != ECIES_HEADER {
        return Err(GatewayError::ProtocolViolation(
            "malformed ecies message".into(),
        ));
    }
    let ephemeral = public_key_from_raw(&message[1..1 + PUBLIC_KEY_LEN])?;
    let iv_start = 1 + PUBLIC_KEY_LEN;
    let body_start = iv_start + IV_LEN;
    let tag_start = message.len() - 32;
    let iv = &message[iv_start..body_start];
    let body = &message[body_start..tag_start];
    let tag = &message[tag_start..];

    let shared = shared_secret(secret_key, &ephemeral);
    let (enc_key, mac_key) = derive_keys(&shared);

    let mut mac = HmacSha256::new_from_slice(&mac_key).expect("hmac accepts any key length");
    mac.update(iv);
    mac.update(body);
    mac.update(shared_mac_data);
    mac.verify_slice(tag)
        .map_err(|_| GatewayError::ProtocolViolation("ecies tag mismatch".into()))?;

    let mut plaintext = body.to_vec();
    let mut cipher = Aes128Ctr::new_from_slices(&enc_key, iv)
        .map_err(|_| GatewayError::ProtocolViolation("cipher init".into()))?;
    cipher.apply_keystream(&mut plaintext);
    Ok(plaintext)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypt_decrypt_round_trip() {
        let recipient = SecretKey::random(&mut rand::thread_rng());
        let plaintext = b"auth body bytes";
        let encrypted = encrypt(&recipient.public_key(), plaintext, &[]).unwrap();
        assert_eq!(
            encrypted.len(),
            plaintext.len() + ECIES_ENCRYPT_OVERHEAD_LENGTH
        );
        let decrypted = decrypt(&recipient, &encrypted, &[]).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn test_shared_mac_data_is_authenticated() {
        let recipient = SecretKey::random(&mut rand::thread_rng());
        let encrypted = encrypt(&recipient.public_key(), b"x", b"prefix").unwrap();
        assert!(decrypt(&recipient, &encrypted, b"prefix").is_ok());
        assert!(decrypt(&recipient, &encrypted, b"other").is_err());
    }

    #[test]
    fn test_tampered_ciphertext_rejected() {
        let recipient = SecretKey::random(&mut rand::thread_rng());
        let mut encrypted = encrypt(&recipient.public_key(), b"payload", &[]).unwrap();
        let mid = encrypted.len() / 2;
        encrypted[mid] ^= 0x01;
        assert!(decrypt(&recipient, &encrypted, &[]).is_err());
    }

    #[test]
    fn test_wrong_recipient_rejected() {
        let recipient = SecretKey::random(&mut rand::thread_rng());
        let other = SecretKey::random(&mut rand::thread_rng());
        let encrypted = encrypt(&recipient.public_key(), b"payload", &[]).unwrap();
        assert!(decrypt(&other, &encrypted, &[]).is_err());
    }

    #[test]
    fn test_concat_kdf_is_deterministic() {
        let shared = [9u8; 32];
        assert_eq!(concat_kdf(&shared, 32), concat_kdf(&shared, 32));
        assert_eq!(concat_kdf(&shared, 48).len(), 48);
        // Prefix property of counter-mode KDFs.
        assert_eq!(concat_kdf(&shared, 48)[..32], concat_kdf(&shared, 32)[..]);
    }
}
