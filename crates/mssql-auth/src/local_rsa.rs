//! Column master key held as a local RSA private key.
//!
//! Encrypted column encryption keys use this envelope:
//!
//! ```text
//! version 0x01 (1)
//! key path length (u16 LE)
//! ciphertext length (u16 LE)
//! key path, lowercased UTF-16LE
//! RSA-OAEP(SHA-1) ciphertext
//! RSA PKCS#1 v1.5 SHA-256 signature over all preceding bytes
//! ```

use std::collections::HashMap;

use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs1v15::{Signature, SigningKey, VerifyingKey};
use rsa::pkcs8::DecodePrivateKey;
use rsa::rand_core::OsRng;
use rsa::signature::{SignatureEncoding, Signer, Verifier};
use rsa::traits::PublicKeyParts;
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha1::Sha1;
use sha2::Sha256;

use crate::encryption::ColumnEncryptionKeyProvider;
use crate::error::AuthError;

/// Key-wrapping algorithm name recorded in metadata.
pub const RSA_OAEP: &str = "RSA_OAEP";

const ENVELOPE_VERSION: u8 = 0x01;
const ENVELOPE_PREFIX: usize = 5;

/// Provider backed by in-memory RSA keys, addressed by key path.
pub struct LocalRsaProvider {
    name: String,
    keys: HashMap<String, RsaPrivateKey>,
}

impl LocalRsaProvider {
    /// Create a provider registered under `name` with no keys.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            keys: HashMap::new(),
        }
    }

    /// Add a key under `key_path`. Paths compare case-insensitively.
    #[must_use]
    pub fn with_key(mut self, key_path: &str, key: RsaPrivateKey) -> Self {
        self.keys.insert(key_path.to_lowercase(), key);
        self
    }

    /// Add a PEM key (PKCS#8 or PKCS#1) under `key_path`.
    pub fn with_pem_key(self, key_path: &str, pem: &str) -> Result<Self, AuthError> {
        let key = RsaPrivateKey::from_pkcs8_pem(pem)
            .or_else(|_| RsaPrivateKey::from_pkcs1_pem(pem))
            .map_err(|e| AuthError::provider(&self.name, e))?;
        Ok(self.with_key(key_path, key))
    }

    fn key(&self, key_path: &str) -> Result<&RsaPrivateKey, AuthError> {
        self.keys.get(&key_path.to_lowercase()).ok_or_else(|| {
            AuthError::provider(&self.name, format!("no key registered for path {key_path}"))
        })
    }

    fn check_algorithm(&self, algorithm: &str) -> Result<(), AuthError> {
        if algorithm.eq_ignore_ascii_case(RSA_OAEP) {
            Ok(())
        } else {
            Err(AuthError::provider(
                &self.name,
                format!("unsupported key encryption algorithm {algorithm}"),
            ))
        }
    }

    fn wrap(&self, key_path: &str, plaintext_key: &[u8]) -> Result<Vec<u8>, AuthError> {
        let key = self.key(key_path)?;
        let ciphertext = RsaPublicKey::from(key)
            .encrypt(&mut OsRng, Oaep::new::<Sha1>(), plaintext_key)
            .map_err(|e| AuthError::provider(&self.name, e))?;
        let path = utf16_lower(key_path);

        let mut envelope = Vec::with_capacity(ENVELOPE_PREFIX + path.len() + 2 * key.size());
        envelope.push(ENVELOPE_VERSION);
        envelope.extend_from_slice(&(path.len() as u16).to_le_bytes());
        envelope.extend_from_slice(&(ciphertext.len() as u16).to_le_bytes());
        envelope.extend_from_slice(&path);
        envelope.extend_from_slice(&ciphertext);

        let signature = SigningKey::<Sha256>::new(key.clone()).sign(&envelope);
        envelope.extend_from_slice(&signature.to_vec());
        Ok(envelope)
    }

    fn unwrap(&self, key_path: &str, envelope: &[u8]) -> Result<Vec<u8>, AuthError> {
        let key = self.key(key_path)?;
        let parts = Envelope::parse(envelope, key.size())?;

        let signature = Signature::try_from(parts.signature)
            .map_err(|e| AuthError::InvalidCekEnvelope(e.to_string()))?;
        VerifyingKey::<Sha256>::new(RsaPublicKey::from(key))
            .verify(parts.signed, &signature)
            .map_err(|_| AuthError::SignatureMismatch(key_path.to_owned()))?;

        key.decrypt(Oaep::new::<Sha1>(), parts.ciphertext)
            .map_err(|e| AuthError::provider(&self.name, e))
    }
}

impl std::fmt::Debug for LocalRsaProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalRsaProvider")
            .field("name", &self.name)
            .field("keys", &self.keys.len())
            .finish()
    }
}

#[async_trait::async_trait]
impl ColumnEncryptionKeyProvider for LocalRsaProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn encrypt_column_encryption_key(
        &self,
        key_path: &str,
        algorithm: &str,
        plaintext_key: &[u8],
    ) -> Result<Vec<u8>, AuthError> {
        self.check_algorithm(algorithm)?;
        self.wrap(key_path, plaintext_key)
    }

    async fn decrypt_column_encryption_key(
        &self,
        key_path: &str,
        algorithm: &str,
        encrypted_key: &[u8],
    ) -> Result<Vec<u8>, AuthError> {
        self.check_algorithm(algorithm)?;
        self.unwrap(key_path, encrypted_key)
    }
}

struct Envelope<'a> {
    signed: &'a [u8],
    ciphertext: &'a [u8],
    signature: &'a [u8],
}

impl<'a> Envelope<'a> {
    fn parse(data: &'a [u8], key_size: usize) -> Result<Self, AuthError> {
        let invalid = |msg: &str| AuthError::InvalidCekEnvelope(msg.to_owned());
        if data.len() < ENVELOPE_PREFIX {
            return Err(invalid("envelope truncated"));
        }
        if data[0] != ENVELOPE_VERSION {
            return Err(invalid("unsupported envelope version"));
        }
        let path_len = usize::from(u16::from_le_bytes([data[1], data[2]]));
        let ct_len = usize::from(u16::from_le_bytes([data[3], data[4]]));
        if ct_len != key_size {
            return Err(invalid("ciphertext length does not match the key size"));
        }
        let signed_len = ENVELOPE_PREFIX + path_len + ct_len;
        if data.len() != signed_len + key_size {
            return Err(invalid("envelope length mismatch"));
        }
        let (signed, signature) = data.split_at(signed_len);
        Ok(Self {
            signed,
            ciphertext: &signed[ENVELOPE_PREFIX + path_len..],
            signature,
        })
    }
}

fn utf16_lower(s: &str) -> Vec<u8> {
    s.to_lowercase()
        .encode_utf16()
        .flat_map(u16::to_le_bytes)
        .collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use once_cell::sync::Lazy;
    use rsa::rand_core::RngCore;

    static KEY: Lazy<RsaPrivateKey> = Lazy::new(|| RsaPrivateKey::new(&mut OsRng, 1024).unwrap());

    fn provider() -> LocalRsaProvider {
        LocalRsaProvider::new("LOCAL_RSA").with_key("CurrentUser/My/ABC", KEY.clone())
    }

    #[tokio::test]
    async fn test_wrap_unwrap_random_key() {
        let provider = provider();
        let mut cek = [0u8; 32];
        OsRng.fill_bytes(&mut cek);

        let wrapped = provider
            .encrypt_column_encryption_key("CurrentUser/My/ABC", RSA_OAEP, &cek)
            .await
            .unwrap();
        assert_ne!(&wrapped[..], &cek[..]);
        assert_eq!(wrapped[0], ENVELOPE_VERSION);
        assert_eq!(wrapped.len(), ENVELOPE_PREFIX + 2 * 18 + 2 * 128);

        let unwrapped = provider
            .decrypt_column_encryption_key("currentuser/my/abc", "rsa_oaep", &wrapped)
            .await
            .unwrap();
        assert_eq!(unwrapped, cek);
    }

    #[tokio::test]
    async fn test_tampered_envelope_fails_signature() {
        let provider = provider();
        let mut wrapped = provider
            .encrypt_column_encryption_key("CurrentUser/My/ABC", RSA_OAEP, &[9u8; 32])
            .await
            .unwrap();
        wrapped[ENVELOPE_PREFIX + 40] ^= 0xFF;
        assert!(matches!(
            provider
                .decrypt_column_encryption_key("CurrentUser/My/ABC", RSA_OAEP, &wrapped)
                .await,
            Err(AuthError::SignatureMismatch(_))
        ));
    }

    #[tokio::test]
    async fn test_malformed_envelopes() {
        let provider = provider();
        for data in [&[][..], &[0x02, 0, 0, 0, 0][..], &[0x01, 0, 0, 128, 0, 1, 2][..]] {
            assert!(matches!(
                provider
                    .decrypt_column_encryption_key("CurrentUser/My/ABC", RSA_OAEP, data)
                    .await,
                Err(AuthError::InvalidCekEnvelope(_))
            ));
        }
    }

    #[tokio::test]
    async fn test_unknown_path_and_algorithm() {
        let provider = provider();
        assert!(matches!(
            provider
                .encrypt_column_encryption_key("other", RSA_OAEP, &[0u8; 32])
                .await,
            Err(AuthError::KeyProvider { .. })
        ));
        assert!(matches!(
            provider
                .encrypt_column_encryption_key("CurrentUser/My/ABC", "RSA_PKCS1", &[0u8; 32])
                .await,
            Err(AuthError::KeyProvider { .. })
        ));
    }

    #[test]
    fn test_pem_key() {
        use rsa::pkcs8::{EncodePrivateKey, LineEnding};
        let pem = KEY.to_pkcs8_pem(LineEnding::LF).unwrap();
        let provider = LocalRsaProvider::new("P").with_pem_key("k", &pem).unwrap();
        assert!(provider.key("K").is_ok());
        assert!(LocalRsaProvider::new("P").with_pem_key("k", "junk").is_err());
    }
}
