//! TDS token stream definitions.
//!
//! Tokens are the fundamental units of TDS response data. The server sends
//! a stream of tokens that describe metadata, rows, errors, and other information.
//!
//! ## Token Structure
//!
//! Each token begins with a 1-byte token type identifier, followed by
//! token-specific data. Token ids are not contiguous, so dispatch is by
//! explicit id. Length-prefixed tokens are decoded from a slice of exactly
//! the declared length: trailing bytes the parser does not understand are
//! skipped, while content that overruns the declared length is a fatal
//! [`ProtocolError::InvalidLength`].
//!
//! ## Usage
//!
//! ```rust,ignore
//! use tds_protocol::token::{Token, TokenParser};
//!
//! let mut parser = TokenParser::new(data);
//! let mut metadata = None;
//! while let Some(token) = parser.next_token_with_metadata(metadata.as_ref())? {
//!     match token {
//!         Token::ColMetaData(meta) => metadata = Some(meta),
//!         Token::Done(done) if !done.has_more() => break,
//!         _ => {}
//!     }
//! }
//! ```

use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::codec::{
    decode_utf16_bytes, ensure, read_b_varchar, read_us_varchar, write_b_varchar,
    write_us_varchar, utf16_byte_len,
};
use crate::error::ProtocolError;
use crate::feature::FeatureAcks;
use crate::types::{Collation, ColumnFlags, TypeInfo};
use crate::value::{read_value, write_value};
use crate::version::TdsVersion;

/// Token type identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TokenType {
    /// Offset (OFFSET).
    Offset = 0x78,
    /// Return status (RETURNSTATUS).
    ReturnStatus = 0x79,
    /// Column metadata (COLMETADATA).
    ColMetaData = 0x81,
    /// Data classification (DATACLASSIFICATION).
    DataClassification = 0xA3,
    /// Table name (TABNAME).
    TabName = 0xA4,
    /// Column info (COLINFO).
    ColInfo = 0xA5,
    /// Order (ORDER).
    Order = 0xA9,
    /// Error message (ERROR).
    Error = 0xAA,
    /// Informational message (INFO).
    Info = 0xAB,
    /// Return value (RETURNVALUE).
    ReturnValue = 0xAC,
    /// Login acknowledgment (LOGINACK).
    LoginAck = 0xAD,
    /// Feature extension acknowledgment (FEATUREEXTACK).
    FeatureExtAck = 0xAE,
    /// Row data (ROW).
    Row = 0xD1,
    /// Null bitmap compressed row (NBCROW).
    NbcRow = 0xD2,
    /// Environment change (ENVCHANGE).
    EnvChange = 0xE3,
    /// Session state (SESSIONSTATE).
    SessionState = 0xE4,
    /// SSPI authentication (SSPI).
    Sspi = 0xED,
    /// Federated authentication info (FEDAUTHINFO).
    FedAuthInfo = 0xEE,
    /// Done (DONE).
    Done = 0xFD,
    /// Done procedure (DONEPROC).
    DoneProc = 0xFE,
    /// Done in procedure (DONEINPROC).
    DoneInProc = 0xFF,
}

impl TokenType {
    /// Create a token type from a raw byte.
    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0x78 => Self::Offset,
            0x79 => Self::ReturnStatus,
            0x81 => Self::ColMetaData,
            0xA3 => Self::DataClassification,
            0xA4 => Self::TabName,
            0xA5 => Self::ColInfo,
            0xA9 => Self::Order,
            0xAA => Self::Error,
            0xAB => Self::Info,
            0xAC => Self::ReturnValue,
            0xAD => Self::LoginAck,
            0xAE => Self::FeatureExtAck,
            0xD1 => Self::Row,
            0xD2 => Self::NbcRow,
            0xE3 => Self::EnvChange,
            0xE4 => Self::SessionState,
            0xED => Self::Sspi,
            0xEE => Self::FedAuthInfo,
            0xFD => Self::Done,
            0xFE => Self::DoneProc,
            0xFF => Self::DoneInProc,
            _ => return None,
        })
    }
}

/// Parsed TDS token.
#[derive(Debug, Clone)]
pub enum Token {
    /// Column metadata describing result set structure.
    ColMetaData(ColMetaData),
    /// Row data.
    Row(RawRow),
    /// Null bitmap compressed row, expanded to one slot per column.
    NbcRow(RawRow),
    /// Completion of a SQL statement.
    Done(Done),
    /// Completion of a stored procedure.
    DoneProc(Done),
    /// Completion within a stored procedure.
    DoneInProc(Done),
    /// Return status from stored procedure.
    ReturnStatus(i32),
    /// Output parameter value.
    ReturnValue(ReturnValue),
    /// Error message from server.
    Error(ServerMessage),
    /// Informational message from server.
    Info(ServerMessage),
    /// Login acknowledgment.
    LoginAck(LoginAck),
    /// Environment change notification.
    EnvChange(EnvChange),
    /// Column ordering information.
    Order(Vec<u16>),
    /// Feature extension acknowledgment.
    FeatureExtAck(FeatureAcks),
    /// SSPI authentication data.
    Sspi(Bytes),
    /// Session state information.
    SessionState(Bytes),
    /// Federated authentication info.
    FedAuthInfo(FedAuthInfo),
}

/// One entry of the column encryption key table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CekTableEntry {
    /// Database id of the key.
    pub database_id: u32,
    /// Key id.
    pub key_id: u32,
    /// Key version.
    pub key_version: u32,
    /// Key metadata version.
    pub key_md_version: u64,
    /// Encrypted values, one per column master key.
    pub values: Vec<EncryptedKeyValue>,
}

/// A column encryption key wrapped by one column master key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedKeyValue {
    /// Wrapped key bytes.
    pub encrypted_key: Bytes,
    /// Name of the key store provider that holds the master key.
    pub key_store_name: String,
    /// Provider-specific master key path.
    pub key_path: String,
    /// Asymmetric algorithm used to wrap the key.
    pub algorithm: String,
}

/// Always Encrypted metadata for one column or return value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CryptoMetadata {
    /// Index into the CEK table.
    pub cek_ordinal: u16,
    /// User type of the plaintext column.
    pub user_type: u32,
    /// Type info of the plaintext value.
    pub base_type: TypeInfo,
    /// Cell encryption algorithm id (2 = AEAD_AES_256_CBC_HMAC_SHA256).
    pub algorithm_id: u8,
    /// Custom algorithm name when `algorithm_id` is 0.
    pub algorithm_name: Option<String>,
    /// 1 = deterministic, 2 = randomized.
    pub encryption_type: u8,
    /// Normalization rule version.
    pub normalization_version: u8,
}

impl CryptoMetadata {
    fn decode(src: &mut impl Buf, with_ordinal: bool) -> Result<Self, ProtocolError> {
        let cek_ordinal = if with_ordinal {
            ensure(src, 2)?;
            src.get_u16_le()
        } else {
            0
        };
        ensure(src, 4)?;
        let user_type = src.get_u32_le();
        let base_type = TypeInfo::decode(src)?;
        ensure(src, 1)?;
        let algorithm_id = src.get_u8();
        let algorithm_name = if algorithm_id == 0 {
            Some(read_b_varchar(src)?)
        } else {
            None
        };
        ensure(src, 2)?;
        let encryption_type = src.get_u8();
        let normalization_version = src.get_u8();
        Ok(Self {
            cek_ordinal,
            user_type,
            base_type,
            algorithm_id,
            algorithm_name,
            encryption_type,
            normalization_version,
        })
    }

    fn encode(&self, dst: &mut impl BufMut, with_ordinal: bool) {
        if with_ordinal {
            dst.put_u16_le(self.cek_ordinal);
        }
        dst.put_u32_le(self.user_type);
        self.base_type.encode(dst);
        dst.put_u8(self.algorithm_id);
        if self.algorithm_id == 0 {
            write_b_varchar(dst, self.algorithm_name.as_deref().unwrap_or_default());
        }
        dst.put_u8(self.encryption_type);
        dst.put_u8(self.normalization_version);
    }
}

/// Column definition within metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnData {
    /// Column name.
    pub name: String,
    /// User type ID.
    pub user_type: u32,
    /// Column flags.
    pub flags: ColumnFlags,
    /// Type info as sent on the wire.
    pub type_info: TypeInfo,
    /// Encryption metadata for encrypted columns.
    pub crypto: Option<CryptoMetadata>,
}

impl ColumnData {
    /// Create a column with default flags.
    #[must_use]
    pub fn new(name: impl Into<String>, type_info: TypeInfo) -> Self {
        Self {
            name: name.into(),
            user_type: 0,
            flags: ColumnFlags {
                nullable: true,
                ..Default::default()
            },
            type_info,
            crypto: None,
        }
    }

    /// Check if this column is nullable.
    #[must_use]
    pub fn is_nullable(&self) -> bool {
        self.flags.nullable
    }

    /// Check if this column carries ciphertext.
    #[must_use]
    pub fn is_encrypted(&self) -> bool {
        self.crypto.is_some()
    }
}

/// Column metadata token.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ColMetaData {
    /// Column encryption key table (empty unless Always Encrypted is active).
    pub cek_table: Vec<CekTableEntry>,
    /// Column definitions.
    pub columns: Vec<ColumnData>,
}

impl ColMetaData {
    /// Special value indicating no metadata.
    pub const NO_METADATA: u16 = 0xFFFF;

    /// Decode a COLMETADATA token body.
    ///
    /// `column_encryption` must be set when Always Encrypted was negotiated;
    /// the CEK table and per-column crypto metadata are only present then.
    pub fn decode(src: &mut impl Buf, column_encryption: bool) -> Result<Self, ProtocolError> {
        ensure(src, 2)?;
        let column_count = src.get_u16_le();
        if column_count == Self::NO_METADATA {
            return Ok(Self::default());
        }

        let cek_table = if column_encryption {
            Self::decode_cek_table(src)?
        } else {
            Vec::new()
        };

        let mut columns = Vec::with_capacity(usize::from(column_count));
        for _ in 0..column_count {
            ensure(src, 6)?;
            let user_type = src.get_u32_le();
            let flags = ColumnFlags::from_bits(src.get_u16_le());
            let type_info = TypeInfo::decode(src)?;
            let crypto = if column_encryption && flags.encrypted {
                Some(CryptoMetadata::decode(src, true)?)
            } else {
                None
            };
            let name = read_b_varchar(src)?;
            columns.push(ColumnData {
                name,
                user_type,
                flags,
                type_info,
                crypto,
            });
        }

        Ok(Self { cek_table, columns })
    }

    fn decode_cek_table(src: &mut impl Buf) -> Result<Vec<CekTableEntry>, ProtocolError> {
        ensure(src, 2)?;
        let count = src.get_u16_le();
        let mut table = Vec::with_capacity(usize::from(count));
        for _ in 0..count {
            ensure(src, 4 + 4 + 4 + 8 + 1)?;
            let database_id = src.get_u32_le();
            let key_id = src.get_u32_le();
            let key_version = src.get_u32_le();
            let key_md_version = src.get_u64_le();
            let value_count = src.get_u8();
            let mut values = Vec::with_capacity(usize::from(value_count));
            for _ in 0..value_count {
                ensure(src, 2)?;
                let len = usize::from(src.get_u16_le());
                ensure(src, len)?;
                let encrypted_key = src.copy_to_bytes(len);
                let key_store_name = read_b_varchar(src)?;
                let key_path = read_us_varchar(src)?;
                let algorithm = read_b_varchar(src)?;
                values.push(EncryptedKeyValue {
                    encrypted_key,
                    key_store_name,
                    key_path,
                    algorithm,
                });
            }
            table.push(CekTableEntry {
                database_id,
                key_id,
                key_version,
                key_md_version,
                values,
            });
        }
        Ok(table)
    }

    /// Encode a COLMETADATA token, including the token byte.
    ///
    /// Used for bulk load and by test servers.
    pub fn encode(&self, dst: &mut impl BufMut, column_encryption: bool) {
        dst.put_u8(TokenType::ColMetaData as u8);
        dst.put_u16_le(self.columns.len() as u16);
        if column_encryption {
            dst.put_u16_le(self.cek_table.len() as u16);
            for entry in &self.cek_table {
                dst.put_u32_le(entry.database_id);
                dst.put_u32_le(entry.key_id);
                dst.put_u32_le(entry.key_version);
                dst.put_u64_le(entry.key_md_version);
                dst.put_u8(entry.values.len() as u8);
                for value in &entry.values {
                    dst.put_u16_le(value.encrypted_key.len() as u16);
                    dst.put_slice(&value.encrypted_key);
                    write_b_varchar(dst, &value.key_store_name);
                    write_us_varchar(dst, &value.key_path);
                    write_b_varchar(dst, &value.algorithm);
                }
            }
        }
        for column in &self.columns {
            dst.put_u32_le(column.user_type);
            dst.put_u16_le(column.flags.to_bits());
            column.type_info.encode(dst);
            if column_encryption {
                if let Some(crypto) = &column.crypto {
                    crypto.encode(dst, true);
                }
            }
            write_b_varchar(dst, &column.name);
        }
    }

    /// Get the number of columns.
    #[must_use]
    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    /// Check if this represents no metadata.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

/// Row values aligned 1:1 with column metadata. `None` is SQL NULL.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawRow {
    /// Raw column values.
    pub values: Vec<Option<Bytes>>,
}

impl RawRow {
    /// Decode a ROW token body.
    pub fn decode(src: &mut impl Buf, metadata: &ColMetaData) -> Result<Self, ProtocolError> {
        let values = metadata
            .columns
            .iter()
            .map(|col| read_value(src, &col.type_info))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { values })
    }

    /// Decode an NBCROW token body.
    ///
    /// Bit `i` of the leading bitmap (LSB first within each byte) marks
    /// column `i` as NULL; only non-NULL columns have bytes on the wire.
    pub fn decode_nbc(src: &mut impl Buf, metadata: &ColMetaData) -> Result<Self, ProtocolError> {
        let column_count = metadata.columns.len();
        let bitmap_len = column_count.div_ceil(8);
        ensure(src, bitmap_len)?;
        let bitmap = src.copy_to_bytes(bitmap_len);

        let mut values = Vec::with_capacity(column_count);
        for (i, col) in metadata.columns.iter().enumerate() {
            if bitmap[i / 8] & (1 << (i % 8)) != 0 {
                values.push(None);
            } else {
                values.push(read_value(src, &col.type_info)?);
            }
        }
        Ok(Self { values })
    }

    /// Encode as a ROW token.
    pub fn encode(&self, dst: &mut impl BufMut, metadata: &ColMetaData) -> Result<(), ProtocolError> {
        if self.values.len() != metadata.columns.len() {
            return Err(ProtocolError::InvalidLength {
                context: "ROW",
                length: self.values.len(),
            });
        }
        dst.put_u8(TokenType::Row as u8);
        for (value, col) in self.values.iter().zip(&metadata.columns) {
            write_value(dst, &col.type_info, value.as_deref())?;
        }
        Ok(())
    }

    /// Encode as an NBCROW token.
    pub fn encode_nbc(
        &self,
        dst: &mut impl BufMut,
        metadata: &ColMetaData,
    ) -> Result<(), ProtocolError> {
        if self.values.len() != metadata.columns.len() {
            return Err(ProtocolError::InvalidLength {
                context: "NBCROW",
                length: self.values.len(),
            });
        }
        dst.put_u8(TokenType::NbcRow as u8);
        let mut bitmap = vec![0u8; self.values.len().div_ceil(8)];
        for (i, value) in self.values.iter().enumerate() {
            if value.is_none() {
                bitmap[i / 8] |= 1 << (i % 8);
            }
        }
        dst.put_slice(&bitmap);
        for (value, col) in self.values.iter().zip(&metadata.columns) {
            if let Some(data) = value {
                write_value(dst, &col.type_info, Some(data))?;
            }
        }
        Ok(())
    }

    /// Whether the column at `index` is NULL (out of range counts as NULL).
    #[must_use]
    pub fn is_null(&self, index: usize) -> bool {
        self.values.get(index).is_none_or(Option::is_none)
    }
}

bitflags! {
    /// DONE / DONEPROC / DONEINPROC status bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DoneStatus: u16 {
        /// More results follow.
        const MORE = 0x0001;
        /// The statement failed.
        const ERROR = 0x0002;
        /// A transaction is in progress.
        const IN_XACT = 0x0004;
        /// The row count is valid.
        const COUNT = 0x0010;
        /// Attention acknowledgement.
        const ATTN = 0x0020;
        /// A server error terminated the statement.
        const SRVERROR = 0x0100;
    }
}

/// Completion token for a statement or procedure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Done {
    /// Status flags.
    pub status: DoneStatus,
    /// Current command.
    pub cur_cmd: u16,
    /// Row count (valid when [`DoneStatus::COUNT`] is set).
    pub row_count: u64,
}

impl Done {
    /// Size of the DONE token body.
    pub const SIZE: usize = 12;

    /// Final DONE with an optional row count.
    #[must_use]
    pub fn final_with_count(row_count: Option<u64>) -> Self {
        Self {
            status: if row_count.is_some() {
                DoneStatus::COUNT
            } else {
                DoneStatus::empty()
            },
            cur_cmd: 0,
            row_count: row_count.unwrap_or(0),
        }
    }

    /// Decode a DONE-family token body.
    pub fn decode(src: &mut impl Buf) -> Result<Self, ProtocolError> {
        ensure(src, Self::SIZE)?;
        Ok(Self {
            status: DoneStatus::from_bits_retain(src.get_u16_le()),
            cur_cmd: src.get_u16_le(),
            row_count: src.get_u64_le(),
        })
    }

    /// Encode with the given DONE-family token byte.
    pub fn encode(&self, dst: &mut impl BufMut, token: TokenType) {
        dst.put_u8(token as u8);
        dst.put_u16_le(self.status.bits());
        dst.put_u16_le(self.cur_cmd);
        dst.put_u64_le(self.row_count);
    }

    /// Check if more results follow this token.
    #[must_use]
    pub fn has_more(&self) -> bool {
        self.status.contains(DoneStatus::MORE)
    }

    /// Check if an error occurred.
    #[must_use]
    pub fn has_error(&self) -> bool {
        self.status.intersects(DoneStatus::ERROR | DoneStatus::SRVERROR)
    }

    /// Row count, when the server marked it valid.
    #[must_use]
    pub fn rows_affected(&self) -> Option<u64> {
        self.status
            .contains(DoneStatus::COUNT)
            .then_some(self.row_count)
    }
}

/// Server ERROR or INFO message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerMessage {
    /// Message number.
    pub number: i32,
    /// Message state.
    pub state: u8,
    /// Severity class.
    pub class: u8,
    /// Message text.
    pub message: String,
    /// Server name.
    pub server: String,
    /// Procedure name.
    pub procedure: String,
    /// Line number.
    pub line: i32,
}

impl ServerMessage {
    fn decode_body(src: &mut impl Buf) -> Result<Self, ProtocolError> {
        ensure(src, 6)?;
        let number = src.get_i32_le();
        let state = src.get_u8();
        let class = src.get_u8();
        let message = read_us_varchar(src)?;
        let server = read_b_varchar(src)?;
        let procedure = read_b_varchar(src)?;
        ensure(src, 4)?;
        let line = src.get_i32_le();
        Ok(Self {
            number,
            state,
            class,
            message,
            server,
            procedure,
            line,
        })
    }

    /// Encode as an ERROR or INFO token.
    pub fn encode(&self, dst: &mut impl BufMut, token: TokenType) {
        let len = 4
            + 1
            + 1
            + 2
            + utf16_byte_len(&self.message)
            + 1
            + utf16_byte_len(&self.server)
            + 1
            + utf16_byte_len(&self.procedure)
            + 4;
        dst.put_u8(token as u8);
        dst.put_u16_le(len as u16);
        dst.put_i32_le(self.number);
        dst.put_u8(self.state);
        dst.put_u8(self.class);
        write_us_varchar(dst, &self.message);
        write_b_varchar(dst, &self.server);
        write_b_varchar(dst, &self.procedure);
        dst.put_i32_le(self.line);
    }

    /// Severity 20 and above terminates the connection.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        self.class >= 20
    }

    /// Severity 11 and above is an error rather than an informational message.
    #[must_use]
    pub const fn is_error(&self) -> bool {
        self.class > 10
    }
}

/// Login acknowledgment token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginAck {
    /// Interface type (1 = SQL).
    pub interface: u8,
    /// Negotiated TDS version.
    pub tds_version: TdsVersion,
    /// Server program name.
    pub prog_name: String,
    /// Server version as major, minor, build high, build low.
    pub prog_version: [u8; 4],
}

impl LoginAck {
    fn decode_body(src: &mut impl Buf) -> Result<Self, ProtocolError> {
        ensure(src, 5)?;
        let interface = src.get_u8();
        // The version is the only big-endian field in the token.
        let tds_version = TdsVersion::new(src.get_u32());
        let prog_name = read_b_varchar(src)?;
        ensure(src, 4)?;
        let mut prog_version = [0u8; 4];
        src.copy_to_slice(&mut prog_version);
        Ok(Self {
            interface,
            tds_version,
            prog_name,
            prog_version,
        })
    }

    /// Encode as a LOGINACK token.
    pub fn encode(&self, dst: &mut impl BufMut) {
        let len = 1 + 4 + 1 + utf16_byte_len(&self.prog_name) + 4;
        dst.put_u8(TokenType::LoginAck as u8);
        dst.put_u16_le(len as u16);
        dst.put_u8(self.interface);
        dst.put_u32(self.tds_version.raw());
        write_b_varchar(dst, &self.prog_name);
        dst.put_slice(&self.prog_version);
    }

    /// Server version as `major.minor.build`.
    #[must_use]
    pub fn server_version(&self) -> String {
        let [major, minor, hi, lo] = self.prog_version;
        format!("{major}.{minor}.{}", u16::from_be_bytes([hi, lo]))
    }
}

/// Environment change type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvChangeType {
    /// Database changed.
    Database,
    /// Language changed.
    Language,
    /// Character set changed.
    CharacterSet,
    /// Packet size changed.
    PacketSize,
    /// Unicode data sorting locale ID.
    UnicodeSortingLocalId,
    /// Unicode comparison flags.
    UnicodeComparisonFlags,
    /// SQL collation.
    SqlCollation,
    /// Begin transaction.
    BeginTransaction,
    /// Commit transaction.
    CommitTransaction,
    /// Rollback transaction.
    RollbackTransaction,
    /// Enlist DTC transaction.
    EnlistDtcTransaction,
    /// Defect DTC transaction.
    DefectTransaction,
    /// Real-time log shipping.
    RealTimeLogShipping,
    /// Promote transaction.
    PromoteTransaction,
    /// Transaction manager address.
    TransactionManagerAddress,
    /// Transaction ended.
    TransactionEnded,
    /// Reset connection completion acknowledgment.
    ResetConnectionCompletionAck,
    /// User instance started.
    UserInstanceStarted,
    /// Routing information.
    Routing,
    /// A type this driver does not know; its body is skipped.
    Unknown(u8),
}

impl EnvChangeType {
    /// Create from raw byte value.
    #[must_use]
    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Database,
            2 => Self::Language,
            3 => Self::CharacterSet,
            4 => Self::PacketSize,
            5 => Self::UnicodeSortingLocalId,
            6 => Self::UnicodeComparisonFlags,
            7 => Self::SqlCollation,
            8 => Self::BeginTransaction,
            9 => Self::CommitTransaction,
            10 => Self::RollbackTransaction,
            11 => Self::EnlistDtcTransaction,
            12 => Self::DefectTransaction,
            13 => Self::RealTimeLogShipping,
            15 => Self::PromoteTransaction,
            16 => Self::TransactionManagerAddress,
            17 => Self::TransactionEnded,
            18 => Self::ResetConnectionCompletionAck,
            19 => Self::UserInstanceStarted,
            20 => Self::Routing,
            other => Self::Unknown(other),
        }
    }

    /// Raw byte value.
    #[must_use]
    pub fn as_u8(self) -> u8 {
        match self {
            Self::Database => 1,
            Self::Language => 2,
            Self::CharacterSet => 3,
            Self::PacketSize => 4,
            Self::UnicodeSortingLocalId => 5,
            Self::UnicodeComparisonFlags => 6,
            Self::SqlCollation => 7,
            Self::BeginTransaction => 8,
            Self::CommitTransaction => 9,
            Self::RollbackTransaction => 10,
            Self::EnlistDtcTransaction => 11,
            Self::DefectTransaction => 12,
            Self::RealTimeLogShipping => 13,
            Self::PromoteTransaction => 15,
            Self::TransactionManagerAddress => 16,
            Self::TransactionEnded => 17,
            Self::ResetConnectionCompletionAck => 18,
            Self::UserInstanceStarted => 19,
            Self::Routing => 20,
            Self::Unknown(other) => other,
        }
    }

    fn is_binary(self) -> bool {
        matches!(
            self,
            Self::SqlCollation
                | Self::BeginTransaction
                | Self::CommitTransaction
                | Self::RollbackTransaction
                | Self::EnlistDtcTransaction
                | Self::DefectTransaction
                | Self::RealTimeLogShipping
                | Self::TransactionManagerAddress
                | Self::TransactionEnded
                | Self::ResetConnectionCompletionAck
        )
    }
}

/// Environment change value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvChangeValue {
    /// String value.
    String(String),
    /// Binary value.
    Binary(Bytes),
    /// Routing information.
    Routing {
        /// Host name.
        host: String,
        /// Port number.
        port: u16,
    },
}

/// Environment change token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvChange {
    /// Type of environment change.
    pub env_type: EnvChangeType,
    /// New value.
    pub new_value: EnvChangeValue,
    /// Old value.
    pub old_value: EnvChangeValue,
}

impl EnvChange {
    fn decode_body(src: &mut impl Buf) -> Result<Self, ProtocolError> {
        ensure(src, 1)?;
        let env_type = EnvChangeType::from_u8(src.get_u8());

        let (new_value, old_value) = match env_type {
            EnvChangeType::Routing => {
                ensure(src, 2 + 1 + 2)?;
                let _value_len = src.get_u16_le();
                let _protocol = src.get_u8();
                let port = src.get_u16_le();
                let host = read_us_varchar(src)?;
                (
                    EnvChangeValue::Routing { host, port },
                    EnvChangeValue::Binary(Bytes::new()),
                )
            }
            EnvChangeType::PromoteTransaction => {
                ensure(src, 4)?;
                let len = src.get_u32_le() as usize;
                ensure(src, len)?;
                (
                    EnvChangeValue::Binary(src.copy_to_bytes(len)),
                    EnvChangeValue::Binary(Bytes::new()),
                )
            }
            EnvChangeType::Unknown(_) => {
                let rest = src.copy_to_bytes(src.remaining());
                (EnvChangeValue::Binary(rest), EnvChangeValue::Binary(Bytes::new()))
            }
            t if t.is_binary() => (read_b_varbyte(src)?, read_b_varbyte(src)?),
            _ => (
                EnvChangeValue::String(read_b_varchar(src)?),
                EnvChangeValue::String(read_b_varchar(src)?),
            ),
        };

        Ok(Self {
            env_type,
            new_value,
            old_value,
        })
    }

    /// Encode as an ENVCHANGE token.
    pub fn encode(&self, dst: &mut impl BufMut) {
        let mut body = BytesMut::new();
        body.put_u8(self.env_type.as_u8());
        Self::encode_value(&mut body, &self.new_value);
        if self.env_type == EnvChangeType::Routing {
            // routing carries a u16-length old value that is always empty
            body.put_u16_le(0);
        } else {
            Self::encode_value(&mut body, &self.old_value);
        }
        dst.put_u8(TokenType::EnvChange as u8);
        dst.put_u16_le(body.len() as u16);
        dst.put_slice(&body);
    }

    fn encode_value(body: &mut BytesMut, value: &EnvChangeValue) {
        match value {
            EnvChangeValue::String(s) => write_b_varchar(body, s),
            EnvChangeValue::Binary(b) => {
                body.put_u8(b.len() as u8);
                body.put_slice(b);
            }
            EnvChangeValue::Routing { host, port } => {
                body.put_u16_le((1 + 2 + 2 + utf16_byte_len(host)) as u16);
                body.put_u8(0);
                body.put_u16_le(*port);
                write_us_varchar(body, host);
            }
        }
    }

    /// Check if this is a routing redirect.
    #[must_use]
    pub fn is_routing(&self) -> bool {
        self.env_type == EnvChangeType::Routing
    }

    /// Get routing information if this is a routing change.
    #[must_use]
    pub fn routing_info(&self) -> Option<(&str, u16)> {
        match &self.new_value {
            EnvChangeValue::Routing { host, port } => Some((host, *port)),
            _ => None,
        }
    }

    /// Get the new database name if this is a database change.
    #[must_use]
    pub fn new_database(&self) -> Option<&str> {
        match (&self.env_type, &self.new_value) {
            (EnvChangeType::Database, EnvChangeValue::String(s)) => Some(s),
            _ => None,
        }
    }

    /// Get the new packet size if this is a packet size change.
    #[must_use]
    pub fn packet_size(&self) -> Option<usize> {
        match (&self.env_type, &self.new_value) {
            (EnvChangeType::PacketSize, EnvChangeValue::String(s)) => s.parse().ok(),
            _ => None,
        }
    }

    /// Get the new collation if this is a collation change.
    #[must_use]
    pub fn collation(&self) -> Option<Collation> {
        match (&self.env_type, &self.new_value) {
            (EnvChangeType::SqlCollation, EnvChangeValue::Binary(b)) if b.len() >= 5 => {
                Collation::decode(&mut b.clone()).ok()
            }
            _ => None,
        }
    }

    /// Transaction descriptor carried by begin/commit/rollback changes.
    ///
    /// Commit and rollback report the new descriptor as empty, which maps to 0.
    #[must_use]
    pub fn transaction_descriptor(&self) -> Option<u64> {
        if !matches!(
            self.env_type,
            EnvChangeType::BeginTransaction
                | EnvChangeType::CommitTransaction
                | EnvChangeType::RollbackTransaction
                | EnvChangeType::DefectTransaction
                | EnvChangeType::EnlistDtcTransaction
        ) {
            return None;
        }
        match &self.new_value {
            EnvChangeValue::Binary(b) if b.len() == 8 => Some(b.clone().get_u64_le()),
            EnvChangeValue::Binary(b) if b.is_empty() => Some(0),
            _ => None,
        }
    }
}

fn read_b_varbyte(src: &mut impl Buf) -> Result<EnvChangeValue, ProtocolError> {
    ensure(src, 1)?;
    let len = usize::from(src.get_u8());
    ensure(src, len)?;
    Ok(EnvChangeValue::Binary(src.copy_to_bytes(len)))
}

/// Output parameter or UDF return value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReturnValue {
    /// Parameter ordinal.
    pub param_ordinal: u16,
    /// Parameter name.
    pub param_name: String,
    /// Status (1 = output parameter, 2 = UDF return value).
    pub status: u8,
    /// User type.
    pub user_type: u32,
    /// Column flags.
    pub flags: ColumnFlags,
    /// Type info.
    pub type_info: TypeInfo,
    /// Encryption metadata for encrypted output parameters.
    pub crypto: Option<CryptoMetadata>,
    /// Raw value; `None` is NULL.
    pub value: Option<Bytes>,
}

impl ReturnValue {
    /// Decode a RETURNVALUE token body.
    pub fn decode(src: &mut impl Buf, column_encryption: bool) -> Result<Self, ProtocolError> {
        ensure(src, 2)?;
        let param_ordinal = src.get_u16_le();
        let param_name = read_b_varchar(src)?;
        ensure(src, 1 + 4 + 2)?;
        let status = src.get_u8();
        let user_type = src.get_u32_le();
        let flags = ColumnFlags::from_bits(src.get_u16_le());
        let type_info = TypeInfo::decode(src)?;
        let crypto = if column_encryption && flags.encrypted {
            Some(CryptoMetadata::decode(src, false)?)
        } else {
            None
        };
        let value = read_value(src, &type_info)?;
        Ok(Self {
            param_ordinal,
            param_name,
            status,
            user_type,
            flags,
            type_info,
            crypto,
            value,
        })
    }

    /// Encode as a RETURNVALUE token.
    pub fn encode(&self, dst: &mut impl BufMut) -> Result<(), ProtocolError> {
        dst.put_u8(TokenType::ReturnValue as u8);
        dst.put_u16_le(self.param_ordinal);
        write_b_varchar(dst, &self.param_name);
        dst.put_u8(self.status);
        dst.put_u32_le(self.user_type);
        dst.put_u16_le(self.flags.to_bits());
        self.type_info.encode(dst);
        if let Some(crypto) = &self.crypto {
            crypto.encode(dst, false);
        }
        write_value(dst, &self.type_info, self.value.as_deref())
    }
}

/// Federated authentication info.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FedAuthInfo {
    /// Token endpoint (STS URL).
    pub sts_url: String,
    /// Service principal name (resource).
    pub spn: String,
}

impl FedAuthInfo {
    const STS_URL: u8 = 0x01;
    const SPN: u8 = 0x02;

    /// Decode a FEDAUTHINFO token body (after the 4-byte length).
    ///
    /// Option data offsets are relative to the start of the body.
    pub fn decode_body(body: &Bytes) -> Result<Self, ProtocolError> {
        let mut src = body.clone();
        ensure(&src, 4)?;
        let count = src.get_u32_le() as usize;
        let mut info = Self::default();
        for _ in 0..count {
            ensure(&src, 9)?;
            let id = src.get_u8();
            let len = src.get_u32_le() as usize;
            let offset = src.get_u32_le() as usize;
            let data = offset
                .checked_add(len)
                .and_then(|end| body.get(offset..end))
                .ok_or(ProtocolError::InvalidLength {
                    context: "FEDAUTHINFO option",
                    length: len,
                })?;
            let value = decode_utf16_bytes(data)?;
            match id {
                Self::STS_URL => info.sts_url = value,
                Self::SPN => info.spn = value,
                _ => {}
            }
        }
        Ok(info)
    }

    /// Encode as a FEDAUTHINFO token.
    pub fn encode(&self, dst: &mut impl BufMut) {
        let sts = crate::codec::encode_utf16(&self.sts_url);
        let spn = crate::codec::encode_utf16(&self.spn);
        let header_len = 4 + 2 * 9;
        let mut body = BytesMut::new();
        body.put_u32_le(2);
        body.put_u8(Self::STS_URL);
        body.put_u32_le(sts.len() as u32);
        body.put_u32_le(header_len as u32);
        body.put_u8(Self::SPN);
        body.put_u32_le(spn.len() as u32);
        body.put_u32_le((header_len + sts.len()) as u32);
        body.put_slice(&sts);
        body.put_slice(&spn);
        dst.put_u8(TokenType::FedAuthInfo as u8);
        dst.put_u32_le(body.len() as u32);
        dst.put_slice(&body);
    }
}

/// Encode an SSPI token.
pub fn encode_sspi(dst: &mut impl BufMut, data: &[u8]) {
    dst.put_u8(TokenType::Sspi as u8);
    dst.put_u16_le(data.len() as u16);
    dst.put_slice(data);
}

/// Encode a RETURNSTATUS token.
pub fn encode_return_status(dst: &mut impl BufMut, status: i32) {
    dst.put_u8(TokenType::ReturnStatus as u8);
    dst.put_i32_le(status);
}

/// Token stream parser over one fully received response message.
///
/// Some tokens (like `Done`, `Error`, `LoginAck`) can be parsed without context.
/// Rows need the column metadata of the current result set, which the caller
/// passes to [`next_token_with_metadata`](TokenParser::next_token_with_metadata).
#[derive(Debug, Clone)]
pub struct TokenParser {
    data: Bytes,
    position: usize,
    column_encryption: bool,
}

impl TokenParser {
    /// Create a new token parser from bytes.
    #[must_use]
    pub fn new(data: Bytes) -> Self {
        Self {
            data,
            position: 0,
            column_encryption: false,
        }
    }

    /// Expect Always Encrypted metadata in COLMETADATA and RETURNVALUE.
    #[must_use]
    pub fn with_column_encryption(mut self, enabled: bool) -> Self {
        self.column_encryption = enabled;
        self
    }

    /// Get remaining bytes in the buffer.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.position)
    }

    /// Check if there are more bytes to parse.
    #[must_use]
    pub fn has_remaining(&self) -> bool {
        self.position < self.data.len()
    }

    /// Peek at the next token type without consuming it.
    #[must_use]
    pub fn peek_token_type(&self) -> Option<TokenType> {
        self.data
            .get(self.position)
            .and_then(|&b| TokenType::from_u8(b))
    }

    /// Get the current position in the buffer.
    #[must_use]
    pub fn position(&self) -> usize {
        self.position
    }

    /// Parse the next context-free token.
    pub fn next_token(&mut self) -> Result<Option<Token>, ProtocolError> {
        self.next_token_with_metadata(None)
    }

    /// Parse the next token with optional column metadata context.
    ///
    /// Returns `None` at the end of the message. ROW and NBCROW without
    /// metadata are [`ProtocolError::MissingMetadata`].
    pub fn next_token_with_metadata(
        &mut self,
        metadata: Option<&ColMetaData>,
    ) -> Result<Option<Token>, ProtocolError> {
        loop {
            if !self.has_remaining() {
                return Ok(None);
            }
            let mut buf = self.data.slice(self.position..);
            let token_byte = buf.get_u8();
            let token_type =
                TokenType::from_u8(token_byte).ok_or(ProtocolError::InvalidTokenType(token_byte))?;

            let token = match token_type {
                TokenType::Done => Some(Token::Done(Done::decode(&mut buf)?)),
                TokenType::DoneProc => Some(Token::DoneProc(Done::decode(&mut buf)?)),
                TokenType::DoneInProc => Some(Token::DoneInProc(Done::decode(&mut buf)?)),
                TokenType::ReturnStatus => {
                    ensure(&buf, 4)?;
                    Some(Token::ReturnStatus(buf.get_i32_le()))
                }
                TokenType::Error => Some(Token::Error(with_u16_body(
                    &mut buf,
                    "ERROR",
                    ServerMessage::decode_body,
                )?)),
                TokenType::Info => Some(Token::Info(with_u16_body(
                    &mut buf,
                    "INFO",
                    ServerMessage::decode_body,
                )?)),
                TokenType::LoginAck => Some(Token::LoginAck(with_u16_body(
                    &mut buf,
                    "LOGINACK",
                    LoginAck::decode_body,
                )?)),
                TokenType::EnvChange => Some(Token::EnvChange(with_u16_body(
                    &mut buf,
                    "ENVCHANGE",
                    EnvChange::decode_body,
                )?)),
                TokenType::Order => Some(Token::Order(with_u16_body(
                    &mut buf,
                    "ORDER",
                    |body| {
                        if body.remaining() % 2 != 0 {
                            return Err(ProtocolError::InvalidLength {
                                context: "ORDER",
                                length: body.remaining(),
                            });
                        }
                        let mut columns = Vec::with_capacity(body.remaining() / 2);
                        while body.has_remaining() {
                            columns.push(body.get_u16_le());
                        }
                        Ok(columns)
                    },
                )?)),
                TokenType::Sspi => Some(Token::Sspi(with_u16_body(&mut buf, "SSPI", |body| {
                    Ok(body.copy_to_bytes(body.remaining()))
                })?)),
                TokenType::SessionState => {
                    ensure(&buf, 4)?;
                    let len = buf.get_u32_le() as usize;
                    ensure(&buf, len)?;
                    Some(Token::SessionState(buf.copy_to_bytes(len)))
                }
                TokenType::FedAuthInfo => {
                    ensure(&buf, 4)?;
                    let len = buf.get_u32_le() as usize;
                    ensure(&buf, len)?;
                    let body = buf.copy_to_bytes(len);
                    Some(Token::FedAuthInfo(FedAuthInfo::decode_body(&body)?))
                }
                TokenType::FeatureExtAck => {
                    Some(Token::FeatureExtAck(FeatureAcks::decode(&mut buf)?))
                }
                TokenType::ColMetaData => Some(Token::ColMetaData(ColMetaData::decode(
                    &mut buf,
                    self.column_encryption,
                )?)),
                TokenType::Row => {
                    let meta = metadata.ok_or(ProtocolError::MissingMetadata("ROW"))?;
                    Some(Token::Row(RawRow::decode(&mut buf, meta)?))
                }
                TokenType::NbcRow => {
                    let meta = metadata.ok_or(ProtocolError::MissingMetadata("NBCROW"))?;
                    Some(Token::NbcRow(RawRow::decode_nbc(&mut buf, meta)?))
                }
                TokenType::ReturnValue => Some(Token::ReturnValue(ReturnValue::decode(
                    &mut buf,
                    self.column_encryption,
                )?)),
                TokenType::Offset => {
                    ensure(&buf, 4)?;
                    buf.advance(4);
                    None
                }
                TokenType::ColInfo | TokenType::TabName | TokenType::DataClassification => {
                    ensure(&buf, 2)?;
                    let len = usize::from(buf.get_u16_le());
                    ensure(&buf, len)?;
                    buf.advance(len);
                    None
                }
            };

            self.position = self.data.len() - buf.remaining();
            if let Some(token) = token {
                return Ok(Some(token));
            }
        }
    }
}

/// Decode a token whose body is prefixed by a u16 length.
///
/// The body is decoded from an isolated slice so that the decoder can never
/// read past the declared length; bytes it leaves unread are skipped.
fn with_u16_body<T>(
    src: &mut Bytes,
    context: &'static str,
    decode: impl FnOnce(&mut Bytes) -> Result<T, ProtocolError>,
) -> Result<T, ProtocolError> {
    ensure(src, 2)?;
    let len = usize::from(src.get_u16_le());
    ensure(src, len)?;
    let mut body = src.split_to(len);
    decode(&mut body).map_err(|e| match e {
        ProtocolError::UnexpectedEof => ProtocolError::InvalidLength {
            context,
            length: len,
        },
        other => other,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::types::TypeId;

    fn int_column(name: &str) -> ColumnData {
        ColumnData::new(name, TypeInfo::new(TypeId::IntN).with_max_length(4))
    }

    #[test]
    fn test_done_roundtrip() {
        let done = Done {
            status: DoneStatus::COUNT | DoneStatus::MORE,
            cur_cmd: 193,
            row_count: 42,
        };
        let mut buf = BytesMut::new();
        done.encode(&mut buf, TokenType::DoneInProc);
        assert_eq!(buf[0], 0xFF);

        let mut parser = TokenParser::new(buf.freeze());
        match parser.next_token().unwrap().unwrap() {
            Token::DoneInProc(d) => {
                assert_eq!(d, done);
                assert!(d.has_more());
                assert_eq!(d.rows_affected(), Some(42));
            }
            other => panic!("unexpected token {other:?}"),
        }
        assert!(parser.next_token().unwrap().is_none());
    }

    #[test]
    fn test_token_parser_done_bytes() {
        let data = Bytes::from_static(&[
            0xFD, 0x10, 0x00, 0xC1, 0x00, 0x05, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        ]);
        let mut parser = TokenParser::new(data);
        match parser.next_token().unwrap().unwrap() {
            Token::Done(done) => {
                assert_eq!(done.cur_cmd, 193);
                assert_eq!(done.rows_affected(), Some(5));
                assert!(!done.has_more());
            }
            other => panic!("unexpected token {other:?}"),
        }
    }

    #[test]
    fn test_unknown_token_is_fatal() {
        let mut parser = TokenParser::new(Bytes::from_static(&[0x42, 0x00]));
        assert_eq!(
            parser.next_token().unwrap_err(),
            ProtocolError::InvalidTokenType(0x42)
        );
    }

    #[test]
    fn test_error_token_roundtrip() {
        let msg = ServerMessage {
            number: 208,
            state: 1,
            class: 16,
            message: "Invalid object name 'nope'.".into(),
            server: "srv".into(),
            procedure: String::new(),
            line: 1,
        };
        let mut buf = BytesMut::new();
        msg.encode(&mut buf, TokenType::Error);
        let mut parser = TokenParser::new(buf.freeze());
        match parser.next_token().unwrap().unwrap() {
            Token::Error(e) => {
                assert_eq!(e, msg);
                assert!(e.is_error());
                assert!(!e.is_fatal());
            }
            other => panic!("unexpected token {other:?}"),
        }
    }

    #[test]
    fn test_token_overrunning_declared_length_is_fatal() {
        let msg = ServerMessage {
            number: 1,
            state: 1,
            class: 1,
            message: "hello".into(),
            server: String::new(),
            procedure: String::new(),
            line: 0,
        };
        let mut buf = BytesMut::new();
        msg.encode(&mut buf, TokenType::Info);
        // shrink the declared length below the real content
        buf[1] -= 4;
        let mut parser = TokenParser::new(buf.freeze());
        assert!(matches!(
            parser.next_token(),
            Err(ProtocolError::InvalidLength { context: "INFO", .. })
        ));
    }

    #[test]
    fn test_login_ack_roundtrip() {
        let ack = LoginAck {
            interface: 1,
            tds_version: TdsVersion::V7_4,
            prog_name: "Microsoft SQL Server".into(),
            prog_version: [16, 0, 0x10, 0x00],
        };
        let mut buf = BytesMut::new();
        ack.encode(&mut buf);
        // big-endian version on the wire
        assert_eq!(&buf[4..8], &[0x74, 0x00, 0x00, 0x04]);
        let mut parser = TokenParser::new(buf.freeze());
        match parser.next_token().unwrap().unwrap() {
            Token::LoginAck(a) => {
                assert_eq!(a, ack);
                assert_eq!(a.server_version(), "16.0.4096");
            }
            other => panic!("unexpected token {other:?}"),
        }
    }

    #[test]
    fn test_env_change_variants() {
        let changes = [
            EnvChange {
                env_type: EnvChangeType::Database,
                new_value: EnvChangeValue::String("master".into()),
                old_value: EnvChangeValue::String("tempdb".into()),
            },
            EnvChange {
                env_type: EnvChangeType::PacketSize,
                new_value: EnvChangeValue::String("8000".into()),
                old_value: EnvChangeValue::String("4096".into()),
            },
            EnvChange {
                env_type: EnvChangeType::BeginTransaction,
                new_value: EnvChangeValue::Binary(Bytes::from_static(&[1, 0, 0, 0, 0, 0, 0, 0])),
                old_value: EnvChangeValue::Binary(Bytes::new()),
            },
            EnvChange {
                env_type: EnvChangeType::Routing,
                new_value: EnvChangeValue::Routing {
                    host: "replica.local".into(),
                    port: 11000,
                },
                old_value: EnvChangeValue::Binary(Bytes::new()),
            },
        ];
        let mut buf = BytesMut::new();
        for change in &changes {
            change.encode(&mut buf);
        }
        let mut parser = TokenParser::new(buf.freeze());
        let mut decoded = Vec::new();
        while let Some(Token::EnvChange(env)) = parser.next_token().unwrap() {
            decoded.push(env);
        }
        assert_eq!(decoded.len(), 4);
        assert_eq!(decoded[0].new_database(), Some("master"));
        assert_eq!(decoded[1].packet_size(), Some(8000));
        assert_eq!(decoded[2].transaction_descriptor(), Some(1));
        assert_eq!(decoded[3].routing_info(), Some(("replica.local", 11000)));
    }

    #[test]
    fn test_unknown_env_change_is_skipped() {
        let raw = [0xE3, 0x03, 0x00, 0x63, 0xAA, 0xBB, 0xFD, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0];
        let mut parser = TokenParser::new(Bytes::copy_from_slice(&raw));
        match parser.next_token().unwrap().unwrap() {
            Token::EnvChange(env) => assert_eq!(env.env_type, EnvChangeType::Unknown(0x63)),
            other => panic!("unexpected token {other:?}"),
        }
        assert!(matches!(parser.next_token().unwrap(), Some(Token::Done(_))));
    }

    #[test]
    fn test_colmetadata_and_rows() {
        let meta = ColMetaData {
            cek_table: Vec::new(),
            columns: vec![
                int_column("id"),
                ColumnData::new("name", TypeInfo::new(TypeId::NVarChar).with_max_length(40)),
            ],
        };
        let row = RawRow {
            values: vec![
                Some(Bytes::from_static(&[7, 0, 0, 0])),
                Some(Bytes::from_static(b"a\0")),
            ],
        };
        let mut buf = BytesMut::new();
        meta.encode(&mut buf, false);
        row.encode(&mut buf, &meta).unwrap();
        Done::final_with_count(Some(1)).encode(&mut buf, TokenType::Done);

        let mut parser = TokenParser::new(buf.freeze());
        let decoded_meta = match parser.next_token().unwrap().unwrap() {
            Token::ColMetaData(m) => m,
            other => panic!("unexpected token {other:?}"),
        };
        assert_eq!(decoded_meta, meta);
        match parser.next_token_with_metadata(Some(&decoded_meta)).unwrap().unwrap() {
            Token::Row(r) => assert_eq!(r, row),
            other => panic!("unexpected token {other:?}"),
        }
        assert!(matches!(
            parser.next_token_with_metadata(Some(&decoded_meta)).unwrap(),
            Some(Token::Done(_))
        ));
    }

    #[test]
    fn test_row_without_metadata() {
        let mut parser = TokenParser::new(Bytes::from_static(&[0xD1, 0x00]));
        assert_eq!(
            parser.next_token().unwrap_err(),
            ProtocolError::MissingMetadata("ROW")
        );
    }

    #[test]
    fn test_nbcrow_bitmap_is_positional() {
        let meta = ColMetaData {
            cek_table: Vec::new(),
            columns: (0..10).map(|i| int_column(&format!("c{i}"))).collect(),
        };
        let values: Vec<Option<Bytes>> = (0..10u8)
            .map(|i| (i % 3 != 0).then(|| Bytes::from(vec![i, 0, 0, 0])))
            .collect();
        let row = RawRow { values };
        let mut buf = BytesMut::new();
        row.encode_nbc(&mut buf, &meta).unwrap();
        // columns 0, 3, 6, 9 are NULL
        assert_eq!(&buf[1..3], &[0b0100_1001, 0b0000_0010]);
        // bitmap + six 5-byte values
        assert_eq!(buf.len(), 1 + 2 + 6 * 5);

        let mut parser = TokenParser::new(buf.freeze());
        match parser.next_token_with_metadata(Some(&meta)).unwrap().unwrap() {
            Token::NbcRow(r) => {
                assert_eq!(r, row);
                assert!(r.is_null(0));
                assert!(!r.is_null(1));
                assert!(r.is_null(42));
            }
            other => panic!("unexpected token {other:?}"),
        }
    }

    #[test]
    fn test_colmetadata_with_cek_table() {
        let base = TypeInfo::new(TypeId::IntN).with_max_length(4);
        let mut encrypted = ColumnData::new(
            "ssn",
            TypeInfo::new(TypeId::BigVarBinary).with_max_length(65),
        );
        encrypted.flags.encrypted = true;
        encrypted.crypto = Some(CryptoMetadata {
            cek_ordinal: 0,
            user_type: 0,
            base_type: base,
            algorithm_id: 2,
            algorithm_name: None,
            encryption_type: 1,
            normalization_version: 1,
        });
        let meta = ColMetaData {
            cek_table: vec![CekTableEntry {
                database_id: 5,
                key_id: 1,
                key_version: 1,
                key_md_version: 9,
                values: vec![EncryptedKeyValue {
                    encrypted_key: Bytes::from_static(&[1, 2, 3]),
                    key_store_name: "TEST_KEY_STORE".into(),
                    key_path: "key/path".into(),
                    algorithm: "RSA_OAEP".into(),
                }],
            }],
            columns: vec![int_column("id"), encrypted],
        };
        let mut buf = BytesMut::new();
        meta.encode(&mut buf, true);
        let mut parser = TokenParser::new(buf.freeze()).with_column_encryption(true);
        match parser.next_token().unwrap().unwrap() {
            Token::ColMetaData(m) => {
                assert_eq!(m, meta);
                assert!(m.columns[1].is_encrypted());
            }
            other => panic!("unexpected token {other:?}"),
        }
    }

    #[test]
    fn test_return_value_roundtrip() {
        let rv = ReturnValue {
            param_ordinal: 1,
            param_name: "@out".into(),
            status: 1,
            user_type: 0,
            flags: ColumnFlags::default(),
            type_info: TypeInfo::new(TypeId::IntN).with_max_length(4),
            crypto: None,
            value: Some(Bytes::from_static(&[9, 0, 0, 0])),
        };
        let mut buf = BytesMut::new();
        encode_return_status(&mut buf, 0);
        rv.encode(&mut buf).unwrap();
        let mut parser = TokenParser::new(buf.freeze());
        assert!(matches!(parser.next_token().unwrap(), Some(Token::ReturnStatus(0))));
        match parser.next_token().unwrap().unwrap() {
            Token::ReturnValue(v) => assert_eq!(v, rv),
            other => panic!("unexpected token {other:?}"),
        }
    }

    #[test]
    fn test_fedauth_info_roundtrip() {
        let info = FedAuthInfo {
            sts_url: "https://login.example/tenant".into(),
            spn: "https://database.example/".into(),
        };
        let mut buf = BytesMut::new();
        info.encode(&mut buf);
        let mut parser = TokenParser::new(buf.freeze());
        match parser.next_token().unwrap().unwrap() {
            Token::FedAuthInfo(i) => assert_eq!(i, info),
            other => panic!("unexpected token {other:?}"),
        }
    }

    #[test]
    fn test_sspi_and_order_and_skipped_tokens() {
        let mut buf = BytesMut::new();
        encode_sspi(&mut buf, &[0xA1, 0xA2]);
        buf.put_slice(&[0xA9, 0x04, 0x00, 0x01, 0x00, 0x02, 0x00]);
        buf.put_slice(&[0xA4, 0x02, 0x00, 0xEE, 0xEE]);
        buf.put_slice(&[0x78, 0x01, 0x00, 0x02, 0x00]);
        Done::final_with_count(None).encode(&mut buf, TokenType::Done);

        let mut parser = TokenParser::new(buf.freeze());
        assert!(matches!(parser.next_token().unwrap(), Some(Token::Sspi(b)) if b.as_ref() == [0xA1, 0xA2]));
        assert!(matches!(parser.next_token().unwrap(), Some(Token::Order(c)) if c == vec![1, 2]));
        assert!(matches!(parser.next_token().unwrap(), Some(Token::Done(_))));
        assert!(!parser.has_remaining());
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn nbcrow_nulls_follow_bitmap(cells in prop::collection::vec(prop::option::of(any::<i32>()), 1..40)) {
                let meta = ColMetaData {
                    cek_table: Vec::new(),
                    columns: (0..cells.len()).map(|i| int_column(&format!("c{i}"))).collect(),
                };
                let row = RawRow {
                    values: cells
                        .iter()
                        .map(|c| c.map(|v| Bytes::copy_from_slice(&v.to_le_bytes())))
                        .collect(),
                };
                let mut buf = BytesMut::new();
                row.encode_nbc(&mut buf, &meta).unwrap();

                let mut parser = TokenParser::new(buf.freeze());
                let token = parser.next_token_with_metadata(Some(&meta)).unwrap();
                prop_assert!(matches!(token, Some(Token::NbcRow(ref decoded)) if *decoded == row));
                prop_assert!(!parser.has_remaining());
            }
        }
    }
}
