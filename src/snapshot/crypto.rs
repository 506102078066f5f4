//! The on-disk/on-wire snapshot envelope: an optional authenticated
//! encryption layer, bit-exact so in-place upgrades can still read
//! snapshots written before or after this code changes.
//!
//! Layers on top of [`crate::crypto::seal`]/[`crate::crypto::open`], adding
//! the `ENCRYPTED:` header and varint-framed plaintext length that let a
//! decoder distinguish an encrypted snapshot from a plain one by peeking at
//! its first bytes.

use crate::crypto;
use crate::error::{CoreError, Result};

pub const HEADER: &[u8; 10] = b"ENCRYPTED:";

/// Encrypt `plaintext` under `key`, producing
/// `ENCRYPTED:` ‖ `varint(len(plaintext))` ‖ `IV` ‖ `ciphertext` ‖ `HMAC`.
pub fn encrypt(key: &[u8; crypto::KEY_LEN], plaintext: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER.len() + 10 + plaintext.len() + crypto::IV_LEN + crypto::TAG_LEN);
    out.extend_from_slice(HEADER);
    write_varint(&mut out, plaintext.len() as u64);
    out.extend_from_slice(&crypto::seal(key, plaintext));
    out
}

/// `true` if `bytes` begins with the encryption header.
pub fn is_encrypted(bytes: &[u8]) -> bool {
    bytes.len() >= HEADER.len() && &bytes[..HEADER.len()] == HEADER
}

/// Decrypt a buffer produced by [`encrypt`]. Any tampering between the
/// header and the trailing HMAC tag surfaces as [`CoreError::Auth`].
pub fn decrypt(key: &[u8; crypto::KEY_LEN], bytes: &[u8]) -> Result<Vec<u8>> {
    if !is_encrypted(bytes) {
        return Err(CoreError::Configuration("buffer is missing the ENCRYPTED: header".into()));
    }
    let mut cursor = HEADER.len();
    let (plaintext_len, consumed) = read_varint(&bytes[cursor..])?;
    cursor += consumed;

    let plaintext = crypto::open(key, &bytes[cursor..])?;
    if plaintext.len() as u64 != plaintext_len {
        return Err(CoreError::Auth("decrypted length does not match varint-framed size".into()));
    }
    Ok(plaintext)
}

fn write_varint(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let mut byte = (value & 0x7f) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if value == 0 {
            break;
        }
    }
}

fn read_varint(bytes: &[u8]) -> Result<(u64, usize)> {
    let mut value: u64 = 0;
    let mut shift = 0u32;
    for (i, &byte) in bytes.iter().enumerate() {
        value |= ((byte & 0x7f) as u64) << shift;
        if byte & 0x80 == 0 {
            return Ok((value, i + 1));
        }
        shift += 7;
        if shift >= 64 {
            return Err(CoreError::Serialization("varint too long".into()));
        }
    }
    Err(CoreError::Serialization("truncated varint".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips() {
        let key = [3u8; crypto::KEY_LEN];
        let plaintext = b"a point-in-time kv snapshot blob";
        let encrypted = encrypt(&key, plaintext);
        assert!(is_encrypted(&encrypted));
        let decrypted = decrypt(&key, &encrypted).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn rejects_tampering_between_header_and_tag() {
        let key = [3u8; crypto::KEY_LEN];
        let mut encrypted = encrypt(&key, b"payload");
        let mid = encrypted.len() - crypto::TAG_LEN - 1;
        encrypted[mid] ^= 0x01;
        assert!(matches!(decrypt(&key, &encrypted), Err(CoreError::Auth(_))));
    }

    #[test]
    fn varint_round_trips_across_boundaries() {
        for n in [0u64, 1, 127, 128, 16384, u64::from(u32::MAX)] {
            let mut buf = Vec::new();
            write_varint(&mut buf, n);
            let (decoded, used) = read_varint(&buf).unwrap();
            assert_eq!(decoded, n);
            assert_eq!(used, buf.len());
        }
    }
}
