//! `AEAD_AES_256_CBC_HMAC_SHA256` cell encryption.
//!
//! Cell layout:
//!
//! ```text
//! version (1) | tag (32) | iv (16) | AES-256-CBC ciphertext (>= 16)
//! ```
//!
//! The tag is `HMAC-SHA256(mac_key, version | iv | ciphertext | 0x01)`.
//! The three sub-keys are `HMAC-SHA256(cek, salt)` where the salt is the
//! UTF-16LE text `Microsoft SQL Server cell <purpose> key with encryption
//! algorithm:AEAD_AES_256_CBC_HMAC_SHA256 and key length:256`.

use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, block_padding::Pkcs7};
use hmac::{Hmac, Mac};
use rsa::rand_core::{OsRng, RngCore};
use sha2::Sha256;

use crate::encryption::EncryptionType;
use crate::error::AuthError;

/// Algorithm name carried in column metadata.
pub const ALGORITHM_NAME: &str = "AEAD_AES_256_CBC_HMAC_SHA256";

/// Algorithm id carried in column metadata.
pub const ALGORITHM_ID: u8 = 2;

const VERSION: u8 = 0x01;
const BLOCK: usize = 16;
const KEY_LEN: usize = 32;
const TAG_LEN: usize = 32;
const IV_LEN: usize = 16;
const MIN_CELL_LEN: usize = 1 + TAG_LEN + IV_LEN + BLOCK;

const PURPOSES: [&str; 3] = ["encryption", "MAC", "IV"];

type HmacSha256 = Hmac<Sha256>;
type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

struct SubKeys {
    enc: [u8; KEY_LEN],
    mac: [u8; KEY_LEN],
    iv: [u8; KEY_LEN],
}

impl SubKeys {
    fn derive(cek: &[u8]) -> Result<Self, AuthError> {
        if cek.len() != KEY_LEN {
            return Err(AuthError::Aead(format!(
                "column encryption key must be {KEY_LEN} bytes, got {}",
                cek.len()
            )));
        }
        let [enc, mac, iv] = PURPOSES;
        Ok(Self {
            enc: hmac_sha256(cek, &[&salt(enc)])?,
            mac: hmac_sha256(cek, &[&salt(mac)])?,
            iv: hmac_sha256(cek, &[&salt(iv)])?,
        })
    }
}

fn salt(purpose: &str) -> Vec<u8> {
    format!(
        "Microsoft SQL Server cell {purpose} key with encryption algorithm:{ALGORITHM_NAME} and key length:{}",
        KEY_LEN * 8
    )
    .encode_utf16()
    .flat_map(u16::to_le_bytes)
    .collect()
}

impl Drop for SubKeys {
    fn drop(&mut self) {
        self.enc.fill(0);
        self.mac.fill(0);
        self.iv.fill(0);
    }
}

fn hmac_sha256(key: &[u8], parts: &[&[u8]]) -> Result<[u8; 32], AuthError> {
    let mut mac =
        HmacSha256::new_from_slice(key).map_err(|e| AuthError::Aead(e.to_string()))?;
    for part in parts {
        mac.update(part);
    }
    Ok(mac.finalize().into_bytes().into())
}

/// Encrypts and decrypts cells with one unwrapped column encryption key.
pub struct AeadEncryptor {
    keys: SubKeys,
}

impl AeadEncryptor {
    /// Derive the sub-keys from a 32-byte column encryption key.
    pub fn new(cek: &[u8]) -> Result<Self, AuthError> {
        Ok(Self {
            keys: SubKeys::derive(cek)?,
        })
    }

    /// Encrypt a plaintext cell.
    ///
    /// Deterministic encryption derives the IV from the plaintext so equal
    /// inputs give equal cells.
    pub fn encrypt(&self, plaintext: &[u8], kind: EncryptionType) -> Result<Vec<u8>, AuthError> {
        let mut iv = [0u8; IV_LEN];
        match kind {
            EncryptionType::Randomized => OsRng.fill_bytes(&mut iv),
            EncryptionType::Deterministic => {
                let digest = hmac_sha256(&self.keys.iv, &[plaintext])?;
                iv.copy_from_slice(&digest[..IV_LEN]);
            }
        }

        let mut buf = vec![0u8; (plaintext.len() / BLOCK + 1) * BLOCK];
        buf[..plaintext.len()].copy_from_slice(plaintext);
        let ciphertext = Aes256CbcEnc::new_from_slices(&self.keys.enc, &iv)
            .map_err(|e| AuthError::Aead(e.to_string()))?
            .encrypt_padded_mut::<Pkcs7>(&mut buf, plaintext.len())
            .map_err(|e| AuthError::Aead(e.to_string()))?;

        let tag = self.tag(&iv, ciphertext)?;
        let mut cell = Vec::with_capacity(1 + TAG_LEN + IV_LEN + ciphertext.len());
        cell.push(VERSION);
        cell.extend_from_slice(&tag);
        cell.extend_from_slice(&iv);
        cell.extend_from_slice(ciphertext);
        Ok(cell)
    }

    /// Authenticate and decrypt a cell.
    pub fn decrypt(&self, cell: &[u8]) -> Result<Vec<u8>, AuthError> {
        if cell.len() < MIN_CELL_LEN {
            return Err(AuthError::Aead(format!(
                "cell too short: {} bytes",
                cell.len()
            )));
        }
        if cell[0] != VERSION {
            return Err(AuthError::Aead(format!(
                "unsupported cell version {:#04x}",
                cell[0]
            )));
        }
        let (tag, rest) = cell[1..].split_at(TAG_LEN);
        let (iv, ciphertext) = rest.split_at(IV_LEN);

        if !constant_time_eq(tag, &self.tag(iv, ciphertext)?) {
            return Err(AuthError::Aead("authentication tag mismatch".into()));
        }

        let mut buf = ciphertext.to_vec();
        let plaintext = Aes256CbcDec::new_from_slices(&self.keys.enc, iv)
            .map_err(|e| AuthError::Aead(e.to_string()))?
            .decrypt_padded_mut::<Pkcs7>(&mut buf)
            .map_err(|e| AuthError::Aead(e.to_string()))?;
        Ok(plaintext.to_vec())
    }

    fn tag(&self, iv: &[u8], ciphertext: &[u8]) -> Result<[u8; TAG_LEN], AuthError> {
        hmac_sha256(&self.keys.mac, &[&[VERSION], iv, ciphertext, &[1]])
    }
}

impl std::fmt::Debug for AeadEncryptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AeadEncryptor").finish_non_exhaustive()
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn cek() -> Vec<u8> {
        (0u8..32).collect()
    }

    #[test]
    fn test_randomized_round_trip() {
        let enc = AeadEncryptor::new(&cek()).unwrap();
        let cell = enc
            .encrypt(b"4111-1111-1111-1111", EncryptionType::Randomized)
            .unwrap();
        assert_eq!(cell[0], VERSION);
        assert_eq!(cell.len(), 1 + TAG_LEN + IV_LEN + 32);
        assert_eq!(enc.decrypt(&cell).unwrap(), b"4111-1111-1111-1111");

        let again = enc
            .encrypt(b"4111-1111-1111-1111", EncryptionType::Randomized)
            .unwrap();
        assert_ne!(cell, again);
    }

    #[test]
    fn test_deterministic_is_stable() {
        let enc = AeadEncryptor::new(&cek()).unwrap();
        let a = enc.encrypt(b"alice", EncryptionType::Deterministic).unwrap();
        let b = enc.encrypt(b"alice", EncryptionType::Deterministic).unwrap();
        let c = enc.encrypt(b"bob", EncryptionType::Deterministic).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(enc.decrypt(&c).unwrap(), b"bob");
    }

    #[test]
    fn test_empty_plaintext_is_one_block() {
        let enc = AeadEncryptor::new(&cek()).unwrap();
        let cell = enc.encrypt(b"", EncryptionType::Randomized).unwrap();
        assert_eq!(cell.len(), MIN_CELL_LEN);
        assert!(enc.decrypt(&cell).unwrap().is_empty());
    }

    #[test]
    fn test_tampered_cell_rejected() {
        let enc = AeadEncryptor::new(&cek()).unwrap();
        let mut cell = enc.encrypt(b"payload", EncryptionType::Randomized).unwrap();
        let last = cell.len() - 1;
        cell[last] ^= 0x01;
        let err = enc.decrypt(&cell).unwrap_err();
        assert!(err.to_string().contains("tag mismatch"));
    }

    #[test]
    fn test_wrong_key_rejected() {
        let cell = AeadEncryptor::new(&cek())
            .unwrap()
            .encrypt(b"payload", EncryptionType::Randomized)
            .unwrap();
        let other = AeadEncryptor::new(&[7u8; 32]).unwrap();
        assert!(matches!(other.decrypt(&cell), Err(AuthError::Aead(_))));
    }

    #[test]
    fn test_bad_version_and_length() {
        let enc = AeadEncryptor::new(&cek()).unwrap();
        let mut cell = enc.encrypt(b"x", EncryptionType::Randomized).unwrap();
        cell[0] = 0x02;
        assert!(enc.decrypt(&cell).unwrap_err().to_string().contains("version"));
        assert!(enc.decrypt(&[1u8; 20]).unwrap_err().to_string().contains("too short"));
    }

    #[test]
    fn test_salt_is_utf16() {
        let s = salt("MAC");
        assert_eq!(&s[..4], &[b'M', 0, b'i', 0]);
        assert!(String::from_utf16_lossy(
            &s.chunks(2).map(|c| u16::from_le_bytes([c[0], c[1]])).collect::<Vec<_>>()
        )
        .ends_with("cell MAC key with encryption algorithm:AEAD_AES_256_CBC_HMAC_SHA256 and key length:256"));
    }

    #[test]
    fn test_key_length_checked() {
        assert!(AeadEncryptor::new(&[0u8; 16]).is_err());
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(&[1, 2, 3], &[1, 2, 3]));
        assert!(!constant_time_eq(&[1, 2, 3], &[1, 2, 4]));
        assert!(!constant_time_eq(&[1, 2, 3], &[1, 2]));
    }
}
