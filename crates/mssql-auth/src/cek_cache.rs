//! Cache of unwrapped column encryption keys.
//!
//! Unwrapping goes through the master-key provider, which may be a network
//! round trip. The cache keeps the derived cell cipher per
//! `(provider, key path, encrypted key)` for a bounded time.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;

use crate::aead::AeadEncryptor;
use crate::encryption::KeyProviderRegistry;
use crate::error::AuthError;

/// Default lifetime of a cached key.
pub const DEFAULT_TTL: Duration = Duration::from_secs(2 * 60 * 60);

/// Identifies one wrapped column encryption key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CekKey {
    /// Provider name from the CEK table.
    pub provider: String,
    /// Master key path from the CEK table.
    pub key_path: String,
    /// The wrapped key bytes.
    pub encrypted_key: Vec<u8>,
}

struct Entry {
    cipher: Arc<AeadEncryptor>,
    inserted: Instant,
}

/// TTL cache of cell ciphers.
pub struct CekCache {
    entries: RwLock<HashMap<CekKey, Entry>>,
    ttl: Duration,
}

impl CekCache {
    /// Cache with [`DEFAULT_TTL`].
    #[must_use]
    pub fn new() -> Self {
        Self::with_ttl(DEFAULT_TTL)
    }

    /// Cache with a custom lifetime.
    #[must_use]
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    /// Cached cipher, if present and fresh.
    pub fn get(&self, key: &CekKey) -> Option<Arc<AeadEncryptor>> {
        let entries = self.entries.read();
        let entry = entries.get(key)?;
        (entry.inserted.elapsed() < self.ttl).then(|| Arc::clone(&entry.cipher))
    }

    /// Store a cipher.
    pub fn insert(&self, key: CekKey, cipher: Arc<AeadEncryptor>) {
        self.entries.write().insert(
            key,
            Entry {
                cipher,
                inserted: Instant::now(),
            },
        );
    }

    /// Return the cipher for `key`, unwrapping through the registry on a miss.
    pub async fn get_or_unwrap(
        &self,
        registry: &KeyProviderRegistry,
        key: CekKey,
        algorithm: &str,
    ) -> Result<Arc<AeadEncryptor>, AuthError> {
        if let Some(cipher) = self.get(&key) {
            return Ok(cipher);
        }
        let provider = registry.lookup(&key.provider)?;
        tracing::debug!(provider = %key.provider, key_path = %key.key_path, "unwrapping column encryption key");
        let plaintext = provider
            .decrypt_column_encryption_key(&key.key_path, algorithm, &key.encrypted_key)
            .await?;
        let cipher = Arc::new(AeadEncryptor::new(&plaintext)?);
        self.insert(key, Arc::clone(&cipher));
        Ok(cipher)
    }

    /// Drop expired entries.
    pub fn purge_expired(&self) {
        let ttl = self.ttl;
        self.entries.write().retain(|_, e| e.inserted.elapsed() < ttl);
    }

    /// Drop everything.
    pub fn clear(&self) {
        self.entries.write().clear();
    }

    /// Number of entries, including expired ones not yet purged.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for CekCache {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CekCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CekCache")
            .field("entries", &self.len())
            .field("ttl", &self.ttl)
            .finish()
    }
}
