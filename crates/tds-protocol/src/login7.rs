//! TDS LOGIN7 packet construction.
//!
//! The LOGIN7 packet is sent by the client to authenticate with SQL Server.
//! It has a 94-byte fixed header holding `{offset, length}` pairs that point
//! into a variable data area of UTF-16LE strings, an optional SSPI blob, and
//! an optional feature extension block.
//!
//! When feature extensions are present, the `ibExtension` slot points to a
//! 4-byte value in the variable area which in turn holds the offset of the
//! extension block itself.
//!
//! The password is obfuscated (not encrypted) using a nibble swap and XOR.
//! Always use TLS for at least the login exchange.

use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::codec::{decode_utf16_bytes, write_utf16_string};
use crate::error::ProtocolError;
use crate::feature::{FeatureExtension, encode_feature_block};
use crate::version::TdsVersion;

/// LOGIN7 packet header size (fixed portion).
pub const LOGIN7_HEADER_SIZE: usize = 94;

bitflags! {
    /// LOGIN7 OptionFlags1.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct OptionFlags1: u8 {
        /// Big-endian byte order.
        const BYTE_ORDER_BE = 0x01;
        /// EBCDIC character set.
        const CHAR_EBCDIC = 0x02;
        /// Disable dump/load.
        const DUMP_LOAD_OFF = 0x10;
        /// Warn on database change.
        const USE_DB = 0x20;
        /// Failure to change to the initial database is fatal.
        const DATABASE_FATAL = 0x40;
        /// Warn on language change.
        const SET_LANG = 0x80;
    }
}

bitflags! {
    /// LOGIN7 OptionFlags2.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct OptionFlags2: u8 {
        /// Failure to change to the initial language is fatal.
        const LANGUAGE_FATAL = 0x01;
        /// ODBC client.
        const ODBC = 0x02;
        /// Integrated security (SSPI data follows).
        const INTEGRATED_SECURITY = 0x80;
    }
}

bitflags! {
    /// LOGIN7 TypeFlags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct TypeFlags: u8 {
        /// OLE DB client.
        const OLEDB = 0x10;
        /// Read-only application intent.
        const READ_ONLY_INTENT = 0x20;
    }
}

bitflags! {
    /// LOGIN7 OptionFlags3.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct OptionFlags3: u8 {
        /// Change password request.
        const CHANGE_PASSWORD = 0x01;
        /// User instance.
        const USER_INSTANCE = 0x02;
        /// Send binary XML.
        const SEND_YUKON_BINARY_XML = 0x04;
        /// Accept unknown collations.
        const UNKNOWN_COLLATION_HANDLING = 0x08;
        /// A feature extension block is present.
        const EXTENSION = 0x10;
    }
}

/// LOGIN7 packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Login7 {
    /// TDS version to request.
    pub tds_version: TdsVersion,
    /// Requested packet size.
    pub packet_size: u32,
    /// Client program version (packed driver version).
    pub client_prog_version: u32,
    /// Client process ID.
    pub client_pid: u32,
    /// Connection ID.
    pub connection_id: u32,
    /// Option flags 1.
    pub option_flags1: OptionFlags1,
    /// Option flags 2.
    pub option_flags2: OptionFlags2,
    /// Type flags.
    pub type_flags: TypeFlags,
    /// Option flags 3.
    pub option_flags3: OptionFlags3,
    /// Client timezone offset in minutes.
    pub client_timezone: i32,
    /// Client LCID.
    pub client_lcid: u32,
    /// Workstation name.
    pub hostname: String,
    /// SQL login name.
    pub username: String,
    /// SQL login password.
    pub password: String,
    /// Application name.
    pub app_name: String,
    /// Server name as dialed.
    pub server_name: String,
    /// Client library name.
    pub library_name: String,
    /// Initial language.
    pub language: String,
    /// Initial database.
    pub database: String,
    /// Client ID (typically zeros).
    pub client_id: [u8; 6],
    /// Initial SSPI token for integrated authentication.
    pub sspi_data: Bytes,
    /// Database file to attach.
    pub attach_db_file: String,
    /// New password for a password change.
    pub new_password: String,
    /// Feature extensions, sent when non-empty.
    pub features: Vec<FeatureExtension>,
}

impl Default for Login7 {
    fn default() -> Self {
        Self {
            tds_version: TdsVersion::V7_4,
            packet_size: 4096,
            client_prog_version: 0,
            client_pid: std::process::id(),
            connection_id: 0,
            option_flags1: OptionFlags1::USE_DB | OptionFlags1::SET_LANG,
            option_flags2: OptionFlags2::ODBC,
            type_flags: TypeFlags::empty(),
            option_flags3: OptionFlags3::UNKNOWN_COLLATION_HANDLING,
            client_timezone: 0,
            client_lcid: 0x0409,
            hostname: String::new(),
            username: String::new(),
            password: String::new(),
            app_name: String::new(),
            server_name: String::new(),
            library_name: String::from("mssql-rs"),
            language: String::new(),
            database: String::new(),
            client_id: [0u8; 6],
            sspi_data: Bytes::new(),
            attach_db_file: String::new(),
            new_password: String::new(),
            features: Vec::new(),
        }
    }
}

/// Number of `{offset, length}` slots before the client id.
const SLOT_COUNT: usize = 9;

fn var_offset(var: &BytesMut) -> u16 {
    (LOGIN7_HEADER_SIZE + var.len()) as u16
}

/// Append a UTF-16LE string, returning its `{offset, char count}` slot.
fn put_text(var: &mut BytesMut, s: &str) -> (u16, u16) {
    let offset = var_offset(var);
    write_utf16_string(var, s);
    (offset, s.encode_utf16().count() as u16)
}

fn put_password(var: &mut BytesMut, s: &str) -> (u16, u16) {
    let offset = var_offset(var);
    write_obfuscated_password(var, s);
    (offset, s.encode_utf16().count() as u16)
}

impl Login7 {
    /// Create a new Login7 packet builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set SQL authentication credentials.
    #[must_use]
    pub fn with_sql_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = username.into();
        self.password = password.into();
        self.option_flags2.remove(OptionFlags2::INTEGRATED_SECURITY);
        self
    }

    /// Enable integrated authentication with the strategy's initial token.
    #[must_use]
    pub fn with_integrated_auth(mut self, sspi_data: Bytes) -> Self {
        self.sspi_data = sspi_data;
        self.option_flags2.insert(OptionFlags2::INTEGRATED_SECURITY);
        self
    }

    /// Add a feature extension.
    #[must_use]
    pub fn with_feature(mut self, feature: FeatureExtension) -> Self {
        self.features.push(feature);
        self
    }

    /// Set read-only application intent.
    #[must_use]
    pub fn with_read_only_intent(mut self, read_only: bool) -> Self {
        self.type_flags.set(TypeFlags::READ_ONLY_INTENT, read_only);
        self
    }

    /// Encode the LOGIN7 payload.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let has_extension = !self.features.is_empty();
        let mut var = BytesMut::new();

        let hostname = put_text(&mut var, &self.hostname);
        let username = put_text(&mut var, &self.username);
        let password = put_password(&mut var, &self.password);
        let app_name = put_text(&mut var, &self.app_name);
        let server_name = put_text(&mut var, &self.server_name);
        let extension = if has_extension {
            // patched with the block offset once the variable area is complete
            let slot = (var_offset(&var), 4);
            var.put_u32_le(0);
            slot
        } else {
            (var_offset(&var), 0)
        };
        let library_name = put_text(&mut var, &self.library_name);
        let language = put_text(&mut var, &self.language);
        let database = put_text(&mut var, &self.database);
        let sspi_offset = var_offset(&var);
        var.put_slice(&self.sspi_data);
        let attach_db = put_text(&mut var, &self.attach_db_file);
        let new_password = put_password(&mut var, &self.new_password);

        if has_extension {
            let block_offset = var_offset(&var) as u32;
            let at = usize::from(extension.0) - LOGIN7_HEADER_SIZE;
            var[at..at + 4].copy_from_slice(&block_offset.to_le_bytes());
            encode_feature_block(&self.features, &mut var);
        }

        let mut flags3 = self.option_flags3;
        flags3.set(OptionFlags3::EXTENSION, has_extension);

        let mut buf = BytesMut::with_capacity(LOGIN7_HEADER_SIZE + var.len());
        buf.put_u32_le((LOGIN7_HEADER_SIZE + var.len()) as u32);
        buf.put_u32_le(self.tds_version.raw());
        buf.put_u32_le(self.packet_size);
        buf.put_u32_le(self.client_prog_version);
        buf.put_u32_le(self.client_pid);
        buf.put_u32_le(self.connection_id);
        buf.put_u8(self.option_flags1.bits());
        buf.put_u8(self.option_flags2.bits());
        buf.put_u8(self.type_flags.bits());
        buf.put_u8(flags3.bits());
        buf.put_i32_le(self.client_timezone);
        buf.put_u32_le(self.client_lcid);

        for (offset, len) in [
            hostname,
            username,
            password,
            app_name,
            server_name,
            extension,
            library_name,
            language,
            database,
        ] {
            buf.put_u16_le(offset);
            buf.put_u16_le(len);
        }
        buf.put_slice(&self.client_id);
        let sspi_short = u16::try_from(self.sspi_data.len()).unwrap_or(u16::MAX);
        buf.put_u16_le(sspi_offset);
        buf.put_u16_le(sspi_short);
        for (offset, len) in [attach_db, new_password] {
            buf.put_u16_le(offset);
            buf.put_u16_le(len);
        }
        // cbSSPILong carries the real size when it does not fit in 16 bits
        buf.put_u32_le(if sspi_short == u16::MAX {
            self.sspi_data.len() as u32
        } else {
            0
        });

        buf.put_slice(&var);
        buf.freeze()
    }

    /// Decode a LOGIN7 payload.
    ///
    /// Only used by test servers; the password is de-obfuscated.
    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        if payload.len() < LOGIN7_HEADER_SIZE {
            return Err(ProtocolError::IncompletePacket {
                expected: LOGIN7_HEADER_SIZE,
                actual: payload.len(),
            });
        }
        let mut src = payload;
        let _length = src.get_u32_le();
        let tds_version = TdsVersion::new(src.get_u32_le());
        let packet_size = src.get_u32_le();
        let client_prog_version = src.get_u32_le();
        let client_pid = src.get_u32_le();
        let connection_id = src.get_u32_le();
        let option_flags1 = OptionFlags1::from_bits_retain(src.get_u8());
        let option_flags2 = OptionFlags2::from_bits_retain(src.get_u8());
        let type_flags = TypeFlags::from_bits_retain(src.get_u8());
        let option_flags3 = OptionFlags3::from_bits_retain(src.get_u8());
        let client_timezone = src.get_i32_le();
        let client_lcid = src.get_u32_le();

        let mut slots = [(0usize, 0usize); SLOT_COUNT];
        for slot in &mut slots {
            *slot = (usize::from(src.get_u16_le()), usize::from(src.get_u16_le()));
        }
        let mut client_id = [0u8; 6];
        src.copy_to_slice(&mut client_id);
        let sspi_slot = (usize::from(src.get_u16_le()), usize::from(src.get_u16_le()));
        let attach_slot = (usize::from(src.get_u16_le()), usize::from(src.get_u16_le()));
        let new_password_slot = (usize::from(src.get_u16_le()), usize::from(src.get_u16_le()));
        let sspi_long = src.get_u32_le() as usize;

        let bytes_at = |offset: usize, len: usize| -> Result<&[u8], ProtocolError> {
            offset
                .checked_add(len)
                .and_then(|end| payload.get(offset..end))
                .ok_or(ProtocolError::InvalidLength {
                    context: "LOGIN7 field",
                    length: len,
                })
        };
        let text = |(offset, chars): (usize, usize)| -> Result<String, ProtocolError> {
            decode_utf16_bytes(bytes_at(offset, chars * 2)?)
        };
        let secret = |(offset, chars): (usize, usize)| -> Result<String, ProtocolError> {
            let raw: Vec<u8> = bytes_at(offset, chars * 2)?
                .iter()
                .map(|b| (b ^ 0xA5).rotate_left(4))
                .collect();
            decode_utf16_bytes(&raw)
        };

        let features = if option_flags3.contains(OptionFlags3::EXTENSION) {
            let (pointer_offset, _) = slots[5];
            let mut pointer = bytes_at(pointer_offset, 4)?;
            let block_offset = pointer.get_u32_le() as usize;
            let block = payload
                .get(block_offset..)
                .ok_or(ProtocolError::InvalidLength {
                    context: "LOGIN7 feature block",
                    length: block_offset,
                })?;
            FeatureExtension::decode_block(block)?
        } else {
            Vec::new()
        };

        let sspi_len = if sspi_slot.1 == usize::from(u16::MAX) {
            sspi_long
        } else {
            sspi_slot.1
        };

        Ok(Self {
            tds_version,
            packet_size,
            client_prog_version,
            client_pid,
            connection_id,
            option_flags1,
            option_flags2,
            type_flags,
            option_flags3: option_flags3 - OptionFlags3::EXTENSION,
            client_timezone,
            client_lcid,
            hostname: text(slots[0])?,
            username: text(slots[1])?,
            password: secret(slots[2])?,
            app_name: text(slots[3])?,
            server_name: text(slots[4])?,
            library_name: text(slots[6])?,
            language: text(slots[7])?,
            database: text(slots[8])?,
            client_id,
            sspi_data: Bytes::copy_from_slice(bytes_at(sspi_slot.0, sspi_len)?),
            attach_db_file: text(attach_slot)?,
            new_password: secret(new_password_slot)?,
            features,
        })
    }
}

/// Swap the nibbles of every byte, then XOR with 0xA5.
fn write_obfuscated_password(dst: &mut impl BufMut, password: &str) {
    for unit in password.encode_utf16() {
        for byte in unit.to_le_bytes() {
            dst.put_u8(byte.rotate_right(4) ^ 0xA5);
        }
    }
}
