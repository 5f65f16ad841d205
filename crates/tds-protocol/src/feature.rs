//! LOGIN7 feature extensions and the server's FEATUREEXTACK response.

use bytes::{Buf, BufMut, Bytes};

use crate::codec::ensure;
use crate::error::ProtocolError;

/// Feature extension identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
#[non_exhaustive]
pub enum FeatureId {
    /// Session recovery (connection resiliency).
    SessionRecovery = 0x01,
    /// Federated authentication.
    FedAuth = 0x02,
    /// Always Encrypted.
    ColumnEncryption = 0x04,
    /// Global transactions.
    GlobalTransactions = 0x05,
    /// Azure SQL support.
    AzureSqlSupport = 0x08,
    /// Data classification.
    DataClassification = 0x09,
    /// UTF-8 collation support.
    Utf8Support = 0x0A,
    /// Azure SQL DNS caching.
    AzureSqlDnsCaching = 0x0B,
    /// Native JSON type.
    JsonSupport = 0x0D,
}

impl FeatureId {
    /// Terminator byte for both the request block and FEATUREEXTACK.
    pub const TERMINATOR: u8 = 0xFF;

    /// Create from a raw byte.
    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0x01 => Self::SessionRecovery,
            0x02 => Self::FedAuth,
            0x04 => Self::ColumnEncryption,
            0x05 => Self::GlobalTransactions,
            0x08 => Self::AzureSqlSupport,
            0x09 => Self::DataClassification,
            0x0A => Self::Utf8Support,
            0x0B => Self::AzureSqlDnsCaching,
            0x0D => Self::JsonSupport,
            _ => return None,
        })
    }
}

/// Federated authentication library selector carried in the FEDAUTH extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FedAuthLibrary {
    /// Live ID compact token (unused by this driver).
    LiveId,
    /// A pre-acquired security token sent in the extension itself.
    SecurityToken,
    /// Token acquired after FEDAUTHINFO (ADAL workflow).
    Adal {
        /// Workflow byte (1 = password, 2 = integrated, 3 = default).
        workflow: u8,
    },
}

impl FedAuthLibrary {
    fn id(self) -> u8 {
        match self {
            Self::LiveId => 0x00,
            Self::SecurityToken => 0x01,
            Self::Adal { .. } => 0x02,
        }
    }
}

/// One feature extension in the LOGIN7 request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeatureExtension {
    /// Request Always Encrypted at the given version.
    ColumnEncryption {
        /// Highest version the client supports.
        version: u8,
    },
    /// Request UTF-8 collation support.
    Utf8Support,
    /// Request the native JSON type.
    JsonSupport {
        /// Highest version the client supports.
        version: u8,
    },
    /// Federated authentication.
    FedAuth {
        /// Library selector.
        library: FedAuthLibrary,
        /// Whether the server sent FEDAUTHREQUIRED in pre-login.
        echo: bool,
        /// UTF-16LE access token for [`FedAuthLibrary::SecurityToken`].
        token: Option<Bytes>,
        /// Nonce echoed from pre-login, if any.
        nonce: Option<[u8; 32]>,
    },
}

impl FeatureExtension {
    /// Feature identifier.
    #[must_use]
    pub fn id(&self) -> FeatureId {
        match self {
            Self::ColumnEncryption { .. } => FeatureId::ColumnEncryption,
            Self::Utf8Support => FeatureId::Utf8Support,
            Self::JsonSupport { .. } => FeatureId::JsonSupport,
            Self::FedAuth { .. } => FeatureId::FedAuth,
        }
    }

    fn payload(&self) -> Vec<u8> {
        match self {
            Self::ColumnEncryption { version } | Self::JsonSupport { version } => vec![*version],
            Self::Utf8Support => Vec::new(),
            Self::FedAuth {
                library,
                echo,
                token,
                nonce,
            } => {
                let mut out = Vec::new();
                out.push((library.id() << 1) | u8::from(*echo));
                match library {
                    FedAuthLibrary::SecurityToken => {
                        let token = token.as_ref().map(|t| t.as_ref()).unwrap_or_default();
                        out.put_u32_le(token.len() as u32);
                        out.extend_from_slice(token);
                        if let Some(nonce) = nonce {
                            out.extend_from_slice(nonce);
                        }
                    }
                    FedAuthLibrary::Adal { workflow } => out.push(*workflow),
                    FedAuthLibrary::LiveId => {}
                }
                out
            }
        }
    }

    /// Encoded size including id and length prefix.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        1 + 4 + self.payload().len()
    }

    /// Encode `{id, u32 length, payload}`.
    pub fn encode(&self, dst: &mut impl BufMut) {
        let payload = self.payload();
        dst.put_u8(self.id() as u8);
        dst.put_u32_le(payload.len() as u32);
        dst.put_slice(&payload);
    }
}

impl FeatureExtension {
    /// Decode a LOGIN7 extension block up to its terminator.
    ///
    /// Extensions this driver never sends are skipped by their declared length.
    pub fn decode_block(mut src: &[u8]) -> Result<Vec<Self>, ProtocolError> {
        let mut features = Vec::new();
        loop {
            ensure(&src, 1)?;
            let id = src.get_u8();
            if id == FeatureId::TERMINATOR {
                return Ok(features);
            }
            ensure(&src, 4)?;
            let len = src.get_u32_le() as usize;
            ensure(&src, len)?;
            let (mut payload, rest) = src.split_at(len);
            src = rest;
            let feature = match FeatureId::from_u8(id) {
                Some(FeatureId::ColumnEncryption) => Self::ColumnEncryption {
                    version: payload.first().copied().unwrap_or(0),
                },
                Some(FeatureId::JsonSupport) => Self::JsonSupport {
                    version: payload.first().copied().unwrap_or(0),
                },
                Some(FeatureId::Utf8Support) => Self::Utf8Support,
                Some(FeatureId::FedAuth) => {
                    ensure(&payload, 1)?;
                    let options = payload.get_u8();
                    let echo = options & 0x01 != 0;
                    let library = match options >> 1 {
                        0x00 => FedAuthLibrary::LiveId,
                        0x01 => FedAuthLibrary::SecurityToken,
                        _ => FedAuthLibrary::Adal {
                            workflow: payload.first().copied().unwrap_or(0),
                        },
                    };
                    let (token, nonce) = if library == FedAuthLibrary::SecurityToken {
                        ensure(&payload, 4)?;
                        let token_len = payload.get_u32_le() as usize;
                        ensure(&payload, token_len)?;
                        let token = Bytes::copy_from_slice(&payload[..token_len]);
                        payload.advance(token_len);
                        let nonce = payload.get(..32).and_then(|n| <[u8; 32]>::try_from(n).ok());
                        (Some(token), nonce)
                    } else {
                        (None, None)
                    };
                    Self::FedAuth {
                        library,
                        echo,
                        token,
                        nonce,
                    }
                }
                _ => continue,
            };
            features.push(feature);
        }
    }
}

/// Encode a full extension block including the terminator.
pub fn encode_feature_block(features: &[FeatureExtension], dst: &mut impl BufMut) {
    for feature in features {
        feature.encode(dst);
    }
    dst.put_u8(FeatureId::TERMINATOR);
}

/// Feature negotiation results from FEATUREEXTACK.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeatureAcks {
    /// Negotiated Always Encrypted version (0 = not acknowledged).
    pub column_encryption_version: u8,
    /// Negotiated JSON version (0 = not acknowledged).
    pub json_version: u8,
    /// Whether UTF-8 collations are supported.
    pub utf8_supported: bool,
    /// Raw FEDAUTH acknowledgement payload, if any.
    pub fed_auth: Option<Bytes>,
    /// Every acknowledgement in arrival order, including unknown ids.
    pub raw: Vec<(u8, Bytes)>,
}

impl FeatureAcks {
    /// Decode a FEATUREEXTACK token body (after the token byte).
    ///
    /// Unknown feature ids are consumed using their declared length and kept
    /// only in [`FeatureAcks::raw`].
    pub fn decode(src: &mut impl Buf) -> Result<Self, ProtocolError> {
        let mut acks = Self::default();
        loop {
            ensure(src, 1)?;
            let id = src.get_u8();
            if id == FeatureId::TERMINATOR {
                break;
            }
            ensure(src, 4)?;
            let len = src.get_u32_le() as usize;
            if src.remaining() < len {
                return Err(ProtocolError::IncompletePacket {
                    expected: len,
                    actual: src.remaining(),
                });
            }
            let data = src.copy_to_bytes(len);
            match FeatureId::from_u8(id) {
                Some(known) => acks.push(known, data),
                None => acks.raw.push((id, data)),
            }
        }
        Ok(acks)
    }

    /// Encode as a FEATUREEXTACK token from [`FeatureAcks::raw`].
    pub fn encode(&self, dst: &mut impl BufMut) {
        dst.put_u8(0xAE);
        for (id, data) in &self.raw {
            dst.put_u8(*id);
            dst.put_u32_le(data.len() as u32);
            dst.put_slice(data);
        }
        dst.put_u8(FeatureId::TERMINATOR);
    }

    /// Record an acknowledgement, updating the typed fields.
    pub fn push(&mut self, id: FeatureId, data: Bytes) {
        match id {
            FeatureId::ColumnEncryption => {
                self.column_encryption_version = data.first().copied().unwrap_or(0);
            }
            FeatureId::JsonSupport => self.json_version = data.first().copied().unwrap_or(0),
            FeatureId::Utf8Support => self.utf8_supported = data.first().is_none_or(|&b| b != 0),
            FeatureId::FedAuth => self.fed_auth = Some(data.clone()),
            _ => {}
        }
        self.raw.push((id as u8, data));
    }

    /// Whether the native JSON type may be used.
    #[must_use]
    pub fn json_supported(&self) -> bool {
        self.json_version >= 1
    }
}
