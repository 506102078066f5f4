//! Shared authenticated-encryption primitives.
//!
//! A single pair of `seal`/`open` functions (AES-256-CTR encrypt-then-MAC
//! with HMAC-SHA512/256) that both the gossip transport and the snapshot
//! envelope build their own framing on top of, instead of each hand-rolling
//! separate cipher plumbing.

use crate::error::{CoreError, Result};
use aes::cipher::{KeyIvInit, StreamCipher};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::{Digest, Sha512_256};

type Aes256Ctr = ctr::Ctr128BE<aes::Aes256>;
type HmacSha512_256 = Hmac<Sha512_256>;

pub const KEY_LEN: usize = 32;
pub const IV_LEN: usize = 16;
pub const TAG_LEN: usize = 32;

/// Derive the shared 32-byte transport/snapshot key from a DER-encoded CA
/// private key: `SHA-512/256(der)`, which already produces a 32-byte digest.
pub fn derive_key_from_ca_der(der: &[u8]) -> [u8; KEY_LEN] {
    let digest = Sha512_256::digest(der);
    let mut key = [0u8; KEY_LEN];
    key.copy_from_slice(&digest);
    key
}

/// Encrypt `plaintext` under `key`, returning `IV ‖ ciphertext ‖ HMAC(IV ‖ ciphertext)`.
pub fn seal(key: &[u8; KEY_LEN], plaintext: &[u8]) -> Vec<u8> {
    let mut iv = [0u8; IV_LEN];
    rand::rng().fill_bytes(&mut iv);

    let mut buf = plaintext.to_vec();
    let mut cipher = Aes256Ctr::new(key.into(), &iv.into());
    cipher.apply_keystream(&mut buf);

    let mut mac = HmacSha512_256::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(&iv);
    mac.update(&buf);
    let tag = mac.finalize().into_bytes();

    let mut out = Vec::with_capacity(IV_LEN + buf.len() + TAG_LEN);
    out.extend_from_slice(&iv);
    out.extend_from_slice(&buf);
    out.extend_from_slice(&tag);
    out
}

/// Inverse of [`seal`]. Verifies the HMAC tag before decrypting; any
/// tampering between the IV and the tag is rejected with [`CoreError::Auth`].
pub fn open(key: &[u8; KEY_LEN], sealed: &[u8]) -> Result<Vec<u8>> {
    if sealed.len() < IV_LEN + TAG_LEN {
        return Err(CoreError::Auth("sealed payload too short".into()));
    }

    let (iv, rest) = sealed.split_at(IV_LEN);
    let (ciphertext, tag) = rest.split_at(rest.len() - TAG_LEN);

    let mut mac = HmacSha512_256::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(iv);
    mac.update(ciphertext);
    mac.verify_slice(tag)
        .map_err(|_| CoreError::Auth("HMAC verification failed on sealed payload".into()))?;

    let mut buf = ciphertext.to_vec();
    let mut cipher = Aes256Ctr::new(key.into(), iv.into());
    cipher.apply_keystream(&mut buf);
    Ok(buf)
}
