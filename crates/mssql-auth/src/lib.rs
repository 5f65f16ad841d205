//! # mssql-auth
//!
//! Authentication strategies and Always Encrypted key handling for SQL
//! Server connections.
//!
//! | Piece | Module |
//! |-------|--------|
//! | Strategy trait, SSPI/NTLM delegate | [`strategy`] |
//! | Kerberos over an external ticket source | [`kerberos`] |
//! | Federated access tokens | [`federated`] |
//! | Channel bindings | [`channel_binding`] |
//! | Key provider trait and registry | [`encryption`] |
//! | Local RSA master keys | [`local_rsa`] |
//! | Cell cipher | [`aead`] |
//! | Unwrapped key cache | [`cek_cache`] |

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod aead;
pub mod cek_cache;
pub mod channel_binding;
pub mod credentials;
pub mod encryption;
pub mod error;
pub mod federated;
pub mod kerberos;
pub mod local_rsa;
pub mod strategy;

pub use aead::AeadEncryptor;
pub use cek_cache::{CekCache, CekKey};
pub use channel_binding::{ChannelBinding, ChannelBindingType};
pub use credentials::Credentials;
pub use encryption::{ColumnEncryptionKeyProvider, EncryptionType, KeyProviderRegistry};
pub use error::AuthError;
pub use federated::{FederatedTokenStrategy, StaticToken, TokenProvider};
pub use kerberos::{KerberosStrategy, Spn, TicketSource};
pub use local_rsa::LocalRsaProvider;
pub use strategy::{AuthStrategy, AuthTarget, SecurityContext, SecurityStep, SspiStrategy, StrategyFactory};
