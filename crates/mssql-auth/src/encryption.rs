//! Always Encrypted key providers.
//!
//! A column master key lives in some external store (a key vault, a
//! certificate store, a local RSA key). Each store is reached through a
//! [`ColumnEncryptionKeyProvider`] registered under the name SQL Server
//! records in column metadata, for example `AZURE_KEY_VAULT`. The provider
//! wraps and unwraps the per-column symmetric keys; the cell cipher itself
//! lives in [`crate::aead`].
//!
//! Providers are looked up through a [`KeyProviderRegistry`]. Connections
//! normally receive a registry by injection from their configuration;
//! [`KeyProviderRegistry::global`] exists for process-wide registration and
//! has no teardown.

use std::collections::HashMap;
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::RwLock;

use crate::error::AuthError;

/// Cell encryption mode recorded in column metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptionType {
    /// Equal plaintexts produce equal cells.
    Deterministic,
    /// Every encryption uses a fresh IV.
    Randomized,
}

impl EncryptionType {
    /// Decode the metadata byte.
    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Deterministic),
            2 => Some(Self::Randomized),
            _ => None,
        }
    }

    /// Metadata byte for this mode.
    #[must_use]
    pub fn as_u8(self) -> u8 {
        match self {
            Self::Deterministic => 1,
            Self::Randomized => 2,
        }
    }
}

/// Wraps and unwraps column encryption keys with a column master key.
///
/// `key_path` is opaque to the driver. Its meaning is provider specific.
/// Decryption must fail when the envelope does not verify; returning
/// garbage key material is never acceptable.
#[async_trait::async_trait]
pub trait ColumnEncryptionKeyProvider: Send + Sync {
    /// Name under which SQL Server metadata refers to this provider.
    fn name(&self) -> &str;

    /// Wrap a plaintext column encryption key.
    async fn encrypt_column_encryption_key(
        &self,
        key_path: &str,
        algorithm: &str,
        plaintext_key: &[u8],
    ) -> Result<Vec<u8>, AuthError>;

    /// Unwrap an encrypted column encryption key.
    async fn decrypt_column_encryption_key(
        &self,
        key_path: &str,
        algorithm: &str,
        encrypted_key: &[u8],
    ) -> Result<Vec<u8>, AuthError>;
}

static GLOBAL: Lazy<KeyProviderRegistry> = Lazy::new(KeyProviderRegistry::new);

/// Name-to-provider mapping consulted when decrypting encrypted columns.
#[derive(Default, Clone)]
pub struct KeyProviderRegistry {
    providers: Arc<RwLock<HashMap<String, Arc<dyn ColumnEncryptionKeyProvider>>>>,
}

impl KeyProviderRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide registry.
    pub fn global() -> &'static KeyProviderRegistry {
        &GLOBAL
    }

    /// Register a provider under its own name.
    ///
    /// Names are unique; registering a second provider under a taken name
    /// fails instead of replacing the first.
    pub fn register(&self, provider: Arc<dyn ColumnEncryptionKeyProvider>) -> Result<(), AuthError> {
        let name = provider.name().to_owned();
        let mut providers = self.providers.write();
        if providers.contains_key(&name) {
            return Err(AuthError::KeyProviderExists(name));
        }
        tracing::debug!(provider = %name, "registered column encryption key provider");
        providers.insert(name, provider);
        Ok(())
    }

    /// Look up a provider by name.
    pub fn lookup(&self, name: &str) -> Result<Arc<dyn ColumnEncryptionKeyProvider>, AuthError> {
        self.providers
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| AuthError::KeyProviderNotFound(name.to_owned()))
    }

    /// Whether a provider is registered under `name`.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.providers.read().contains_key(name)
    }

    /// Registered provider names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.providers.read().keys().cloned().collect();
        names.sort();
        names
    }
}

impl std::fmt::Debug for KeyProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyProviderRegistry")
            .field("providers", &self.names())
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    struct Xor(&'static str);

    #[async_trait::async_trait]
    impl ColumnEncryptionKeyProvider for Xor {
        fn name(&self) -> &str {
            self.0
        }

        async fn encrypt_column_encryption_key(
            &self,
            _key_path: &str,
            _algorithm: &str,
            plaintext_key: &[u8],
        ) -> Result<Vec<u8>, AuthError> {
            Ok(plaintext_key.iter().map(|b| b ^ 0x5A).collect())
        }

        async fn decrypt_column_encryption_key(
            &self,
            _key_path: &str,
            _algorithm: &str,
            encrypted_key: &[u8],
        ) -> Result<Vec<u8>, AuthError> {
            Ok(encrypted_key.iter().map(|b| b ^ 0x5A).collect())
        }
    }

    #[test]
    fn test_encryption_type_bytes() {
        assert_eq!(EncryptionType::from_u8(1), Some(EncryptionType::Deterministic));
        assert_eq!(EncryptionType::from_u8(2), Some(EncryptionType::Randomized));
        assert_eq!(EncryptionType::from_u8(0), None);
        assert_eq!(EncryptionType::Randomized.as_u8(), 2);
    }

    #[tokio::test]
    async fn test_register_and_lookup() {
        let registry = KeyProviderRegistry::new();
        registry.register(Arc::new(Xor("TEST_STORE"))).unwrap();
        assert!(registry.contains("TEST_STORE"));

        let provider = registry.lookup("TEST_STORE").unwrap();
        let wrapped = provider
            .encrypt_column_encryption_key("k", "RSA_OAEP", b"key")
            .await
            .unwrap();
        let unwrapped = provider
            .decrypt_column_encryption_key("k", "RSA_OAEP", &wrapped)
            .await
            .unwrap();
        assert_eq!(unwrapped, b"key");
    }

    #[test]
    fn test_duplicate_and_missing() {
        let registry = KeyProviderRegistry::new();
        registry.register(Arc::new(Xor("A"))).unwrap();
        assert!(matches!(
            registry.register(Arc::new(Xor("A"))),
            Err(AuthError::KeyProviderExists(_))
        ));
        assert!(matches!(
            registry.lookup("B"),
            Err(AuthError::KeyProviderNotFound(name)) if name == "B"
        ));
    }

    #[test]
    fn test_clones_share_state() {
        let registry = KeyProviderRegistry::new();
        let clone = registry.clone();
        registry.register(Arc::new(Xor("Z"))).unwrap();
        registry.register(Arc::new(Xor("Y"))).unwrap();
        assert_eq!(clone.names(), vec!["Y".to_owned(), "Z".to_owned()]);
    }
}
