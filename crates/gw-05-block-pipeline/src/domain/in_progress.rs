//! In-progress encrypted blocks: ciphertext + key pairing.
//!
//! A block arrives from the BDN as ciphertext; its key arrives separately
//! (usually from another relay, after receipts prove wide distribution).
//! Whichever half arrives first waits here; when the pair completes, the
//! entry yields plaintext and is removed. Entries expire on the sweep alarm.
//!
//! The cipher is AES-256-CTR with a random IV and an encrypt-then-MAC
//! HMAC-SHA256 tag, so a mismatched key is detected rather than producing
//! garbage bytes.

use aes::cipher::{KeyIvInit, StreamCipher};
use aes::Aes256;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::{Digest, Sha256};
use shared_types::{ExpiringDict, Sha256Hash};
use std::time::{Duration, Instant};
use tracing::debug;

type Aes256Ctr = ctr::Ctr128BE<Aes256>;
type HmacSha256 = Hmac<Sha256>;

/// Block encryption key length.
pub const BLOCK_KEY_LEN: usize = 32;

const IV_LEN: usize = 16;
const TAG_LEN: usize = 16;

fn mac_key(key: &[u8; BLOCK_KEY_LEN]) -> [u8; 32] {
    // Separate MAC key so the CTR keystream and tag never share key material.
    let mut hasher = Sha256::new();
    hasher.update(key);
    hasher.update(b"mac");
    hasher.finalize().into()
}

/// Encrypts a bx-block under a fresh random key.
/// Returns `(ciphertext, key)`; the block's BDN identity is
/// `dsha256(ciphertext)`.
pub fn encrypt_block(plaintext: &[u8]) -> (Vec<u8>, [u8; BLOCK_KEY_LEN]) {
    let mut rng = rand::thread_rng();
    let mut key = [0u8; BLOCK_KEY_LEN];
    rng.fill_bytes(&mut key);
    let mut iv = [0u8; IV_LEN];
    rng.fill_bytes(&mut iv);

    let mut body = plaintext.to_vec();
    let mut cipher = Aes256Ctr::new_from_slices(&key, &iv).expect("fixed key and iv lengths");
    cipher.apply_keystream(&mut body);

    let mut mac = HmacSha256::new_from_slice(&mac_key(&key)).expect("hmac accepts any key length");
    mac.update(&iv);
    mac.update(&body);
    let tag = mac.finalize().into_bytes();

    let mut ciphertext = Vec::with_capacity(IV_LEN + body.len() + TAG_LEN);
    ciphertext.extend_from_slice(&iv);
    ciphertext.extend_from_slice(&body);
    ciphertext.extend_from_slice(&tag[..TAG_LEN]);
    (ciphertext, key)
}

/// Decrypts a block ciphertext; `None` on tag mismatch or truncation.
pub fn decrypt_block(ciphertext: &[u8], key: &[u8; BLOCK_KEY_LEN]) -> Option<Vec<u8>> {
    if ciphertext.len() < IV_LEN + TAG_LEN {
        return None;
    }
    let (iv, rest) = ciphertext.split_at(IV_LEN);
    let (body, tag) = rest.split_at(rest.len() - TAG_LEN);

    let mut mac = HmacSha256::new_from_slice(&mac_key(key)).expect("hmac accepts any key length");
    mac.update(iv);
    mac.update(body);
    mac.verify_truncated_left(tag).ok()?;

    let mut plaintext = body.to_vec();
    let mut cipher = Aes256Ctr::new_from_slices(key, iv).ok()?;
    cipher.apply_keystream(&mut plaintext);
    Some(plaintext)
}

#[derive(Default)]
struct InProgressBlock {
    ciphertext: Option<Vec<u8>>,
    key: Option<[u8; BLOCK_KEY_LEN]>,
}

/// Store pairing block ciphertexts with their keys.
pub struct InProgressBlocks {
    entries: ExpiringDict<Sha256Hash, InProgressBlock>,
}

impl InProgressBlocks {
    /// Creates a store whose entries expire after `ttl`.
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: ExpiringDict::new(ttl),
        }
    }

    /// Stores ciphertext waiting for its key.
    pub fn add_ciphertext(&mut self, block_hash: Sha256Hash, ciphertext: Vec<u8>, now: Instant) {
        if let Some(entry) = self.entries.get_mut(&block_hash) {
            entry.ciphertext.get_or_insert(ciphertext);
            return;
        }
        self.entries.insert(
            block_hash,
            InProgressBlock {
                ciphertext: Some(ciphertext),
                key: None,
            },
            now,
        );
    }

    /// Stores a key waiting for its ciphertext.
    pub fn add_key(&mut self, block_hash: Sha256Hash, key: [u8; BLOCK_KEY_LEN], now: Instant) {
        if let Some(entry) = self.entries.get_mut(&block_hash) {
            entry.key.get_or_insert(key);
            return;
        }
        self.entries.insert(
            block_hash,
            InProgressBlock {
                ciphertext: None,
                key: Some(key),
            },
            now,
        );
    }

    /// True if the key for `block_hash` is already known.
    pub fn has_encryption_key_for_hash(&self, block_hash: &Sha256Hash) -> bool {
        self.entries
            .get(block_hash)
            .map(|e| e.key.is_some())
            .unwrap_or(false)
    }

    /// True if ciphertext for `block_hash` is waiting.
    pub fn has_ciphertext_for_hash(&self, block_hash: &Sha256Hash) -> bool {
        self.entries
            .get(block_hash)
            .map(|e| e.ciphertext.is_some())
            .unwrap_or(false)
    }

    /// Decrypts freshly received ciphertext with the stored key. The entry
    /// is removed on success; on tag mismatch both halves are dropped.
    pub fn decrypt_ciphertext(
        &mut self,
        block_hash: &Sha256Hash,
        ciphertext: &[u8],
    ) -> Option<Vec<u8>> {
        let key = self.entries.get(block_hash)?.key?;
        let plaintext = decrypt_block(ciphertext, &key);
        self.entries.remove(block_hash);
        plaintext
    }

    /// Decrypts stored ciphertext with a freshly received key. The entry is
    /// removed on success; on tag mismatch both halves are dropped.
    pub fn decrypt_and_get_payload(
        &mut self,
        block_hash: &Sha256Hash,
        key: &[u8; BLOCK_KEY_LEN],
    ) -> Option<Vec<u8>> {
        let entry = self.entries.get(block_hash)?;
        let ciphertext = entry.ciphertext.as_ref()?;
        let plaintext = decrypt_block(ciphertext, key);
        self.entries.remove(block_hash);
        plaintext
    }

    /// Drops expired entries.
    pub fn sweep(&mut self, now: Instant) {
        let expired = self.entries.sweep(now);
        if !expired.is_empty() {
            debug!(count = expired.len(), "expired unpaired block entries");
        }
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if no entries are waiting.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
