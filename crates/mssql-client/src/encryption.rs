//! Always Encrypted cell decryption.

use std::sync::Arc;

use mssql_auth::aead::ALGORITHM_ID;
use mssql_auth::{AuthError, CekCache, CekKey, KeyProviderRegistry};
use mssql_types::{SqlValue, decode_value};
use tds_protocol::{ProtocolError, TypeId};
use tds_protocol::token::{CekTableEntry, CryptoMetadata};

use crate::error::{Error, Result};

/// Decrypts encrypted cells using keys unwrapped through a provider
/// registry.
pub struct CellDecryptor {
    registry: KeyProviderRegistry,
    cache: Arc<CekCache>,
}

impl CellDecryptor {
    /// Decryptor over `registry` with a private key cache.
    #[must_use]
    pub fn new(registry: KeyProviderRegistry) -> Self {
        Self::with_cache(registry, Arc::new(CekCache::new()))
    }

    /// Decryptor sharing `cache` with other connections.
    #[must_use]
    pub fn with_cache(registry: KeyProviderRegistry, cache: Arc<CekCache>) -> Self {
        Self { registry, cache }
    }

    /// Decrypt and decode one cell.
    ///
    /// NULL cells are never encrypted and decode as NULL of the base type.
    /// The first CEK value whose provider is registered is used.
    pub async fn decrypt(
        &self,
        cek_table: &[CekTableEntry],
        crypto: &CryptoMetadata,
        cell: Option<&[u8]>,
    ) -> Result<SqlValue> {
        let Some(cell) = cell else {
            return Ok(SqlValue::TypedNull(crypto.base_type.decl_type_id));
        };
        if crypto.algorithm_id != ALGORITHM_ID {
            return Err(AuthError::Aead(format!(
                "unsupported cell encryption algorithm {}",
                crypto.algorithm_id
            ))
            .into());
        }
        let entry = cek_table
            .get(usize::from(crypto.cek_ordinal))
            .ok_or(Error::Protocol(ProtocolError::InvalidField {
                field: "cek_ordinal",
                value: u32::from(crypto.cek_ordinal),
            }))?;

        let mut last_err = None;
        for value in &entry.values {
            if !self.registry.contains(&value.key_store_name) {
                last_err = Some(AuthError::KeyProviderNotFound(value.key_store_name.clone()));
                continue;
            }
            let key = CekKey {
                provider: value.key_store_name.clone(),
                key_path: value.key_path.clone(),
                encrypted_key: value.encrypted_key.to_vec(),
            };
            match self
                .cache
                .get_or_unwrap(&self.registry, key, &value.algorithm)
                .await
            {
                Ok(cipher) => {
                    let plaintext = cipher.decrypt(cell)?;
                    let base = &crypto.base_type;
                    let plaintext = denormalize(base.decl_type_id, base.max_length, &plaintext);
                    return Ok(decode_value(base, Some(plaintext))?);
                }
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err
            .unwrap_or_else(|| AuthError::KeyProviderNotFound("<no CEK values>".into()))
            .into())
    }
}

impl std::fmt::Debug for CellDecryptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CellDecryptor")
            .field("providers", &self.registry.names())
            .field("cached_keys", &self.cache.len())
            .finish()
    }
}

/// Integer and bit plaintexts are normalized to 8 bytes before encryption.
fn denormalize(type_id: TypeId, max_length: u32, plaintext: &[u8]) -> &[u8] {
    let width = match type_id {
        TypeId::Int1 | TypeId::Bit | TypeId::BitN => 1,
        TypeId::Int2 => 2,
        TypeId::Int4 => 4,
        TypeId::IntN => max_length as usize,
        _ => return plaintext,
    };
    &plaintext[..width.min(plaintext.len())]
}
