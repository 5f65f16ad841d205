//! TDS pre-login packet handling.
//!
//! The pre-login packet is the first message exchanged between client and server.
//! It negotiates encryption and carries diagnostic identifiers. Option data is
//! located through a table of `{tag, offset u16 BE, length u16 BE}` entries
//! terminated by 0xFF; offsets are absolute from the start of the payload.
//!
//! In strict mode (TDS 8.0) the same message is exchanged, but only after TLS
//! has already been established on the raw transport.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::ProtocolError;
use crate::version::{DriverVersion, SqlServerVersion};

/// Pre-login option types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum PreLoginOption {
    /// Version information.
    Version = 0x00,
    /// Encryption negotiation.
    Encryption = 0x01,
    /// Instance name (for named instances).
    Instance = 0x02,
    /// Thread ID.
    ThreadId = 0x03,
    /// MARS (Multiple Active Result Sets) support.
    Mars = 0x04,
    /// Connection and activity ids for diagnostics.
    TraceId = 0x05,
    /// Federated authentication required.
    FedAuthRequired = 0x06,
    /// Nonce for federated authentication.
    Nonce = 0x07,
    /// Terminator (end of options).
    Terminator = 0xFF,
}

impl PreLoginOption {
    /// Create from raw byte value.
    pub fn from_u8(value: u8) -> Result<Self, ProtocolError> {
        match value {
            0x00 => Ok(Self::Version),
            0x01 => Ok(Self::Encryption),
            0x02 => Ok(Self::Instance),
            0x03 => Ok(Self::ThreadId),
            0x04 => Ok(Self::Mars),
            0x05 => Ok(Self::TraceId),
            0x06 => Ok(Self::FedAuthRequired),
            0x07 => Ok(Self::Nonce),
            0xFF => Ok(Self::Terminator),
            _ => Err(ProtocolError::InvalidPreloginOption(value)),
        }
    }
}

/// Encryption byte of the ENCRYPTION option.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum EncryptionLevel {
    /// Encrypt the login exchange only.
    #[default]
    Off = 0x00,
    /// Encrypt the whole connection.
    On = 0x01,
    /// No TLS available.
    NotSupported = 0x02,
    /// Server requires encryption.
    Required = 0x03,
    /// TLS was established before pre-login.
    Strict = 0x04,
}

impl EncryptionLevel {
    /// Create from raw byte value.
    pub fn from_u8(value: u8) -> Result<Self, ProtocolError> {
        match value {
            0x00 => Ok(Self::Off),
            0x01 => Ok(Self::On),
            0x02 => Ok(Self::NotSupported),
            0x03 => Ok(Self::Required),
            0x04 => Ok(Self::Strict),
            other => Err(ProtocolError::InvalidField {
                field: "prelogin encryption",
                value: u32::from(other),
            }),
        }
    }
}

/// Connection and activity identifiers carried in TRACEID.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceId {
    /// Connection id (GUID bytes).
    pub connection_id: [u8; 16],
    /// Activity id (GUID bytes).
    pub activity_id: [u8; 16],
    /// Activity sequence number.
    pub sequence: u32,
}

impl TraceId {
    /// Encoded size.
    pub const SIZE: usize = 36;

    fn to_bytes(self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[..16].copy_from_slice(&self.connection_id);
        out[16..32].copy_from_slice(&self.activity_id);
        out[32..].copy_from_slice(&self.sequence.to_le_bytes());
        out
    }

    fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < Self::SIZE {
            return None;
        }
        let mut connection_id = [0u8; 16];
        let mut activity_id = [0u8; 16];
        connection_id.copy_from_slice(&data[..16]);
        activity_id.copy_from_slice(&data[16..32]);
        let sequence = u32::from_le_bytes([data[32], data[33], data[34], data[35]]);
        Some(Self {
            connection_id,
            activity_id,
            sequence,
        })
    }
}

/// Pre-login message, used for both the client request and the server response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PreLogin {
    /// Raw six-byte VERSION payload.
    ///
    /// The client sends its driver version; the server answers with its
    /// product version (see [`PreLogin::server_version`]).
    pub version: [u8; 6],
    /// Encryption level.
    pub encryption: EncryptionLevel,
    /// Instance name; `Some("")` still emits the option with a lone NUL.
    pub instance: Option<String>,
    /// Thread ID.
    pub thread_id: Option<u32>,
    /// MARS enabled.
    pub mars: bool,
    /// Connection and activity ids.
    pub trace_id: Option<TraceId>,
    /// Federated authentication required.
    pub fed_auth_required: bool,
    /// Nonce (server response only).
    pub nonce: Option<[u8; 32]>,
}

impl PreLogin {
    /// A client request carrying this driver's version, an empty instance,
    /// thread id 0 and MARS disabled.
    #[must_use]
    pub fn client(encryption: EncryptionLevel) -> Self {
        Self {
            version: DriverVersion::current().prelogin_bytes(),
            encryption,
            instance: Some(String::new()),
            thread_id: Some(0),
            mars: false,
            trace_id: None,
            fed_auth_required: false,
            nonce: None,
        }
    }

    /// Set the instance name.
    #[must_use]
    pub fn with_instance(mut self, instance: impl Into<String>) -> Self {
        self.instance = Some(instance.into());
        self
    }

    /// Set the trace id.
    #[must_use]
    pub fn with_trace_id(mut self, trace_id: Option<TraceId>) -> Self {
        self.trace_id = trace_id;
        self
    }

    /// Request federated authentication.
    #[must_use]
    pub fn with_fed_auth_required(mut self, required: bool) -> Self {
        self.fed_auth_required = required;
        self
    }

    /// Server product version, when the VERSION option came from a server.
    #[must_use]
    pub fn server_version(&self) -> Option<SqlServerVersion> {
        SqlServerVersion::from_bytes(&self.version)
    }

    fn options(&self) -> Vec<(PreLoginOption, Vec<u8>)> {
        let mut options = vec![
            (PreLoginOption::Version, self.version.to_vec()),
            (PreLoginOption::Encryption, vec![self.encryption as u8]),
        ];
        if let Some(instance) = &self.instance {
            let mut data = instance.as_bytes().to_vec();
            data.push(0);
            options.push((PreLoginOption::Instance, data));
        }
        if let Some(thread_id) = self.thread_id {
            options.push((PreLoginOption::ThreadId, thread_id.to_be_bytes().to_vec()));
        }
        options.push((PreLoginOption::Mars, vec![u8::from(self.mars)]));
        if let Some(trace_id) = self.trace_id {
            options.push((PreLoginOption::TraceId, trace_id.to_bytes().to_vec()));
        }
        if self.fed_auth_required {
            options.push((PreLoginOption::FedAuthRequired, vec![1]));
        }
        if let Some(nonce) = self.nonce {
            options.push((PreLoginOption::Nonce, nonce.to_vec()));
        }
        options
    }

    /// Encode the pre-login message.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let options = self.options();
        let header_size = options.len() * 5 + 1;
        let data_size: usize = options.iter().map(|(_, d)| d.len()).sum();

        let mut buf = BytesMut::with_capacity(header_size + data_size);
        let mut offset = header_size;
        for (option, data) in &options {
            buf.put_u8(*option as u8);
            buf.put_u16(offset as u16);
            buf.put_u16(data.len() as u16);
            offset += data.len();
        }
        buf.put_u8(PreLoginOption::Terminator as u8);
        for (_, data) in &options {
            buf.put_slice(data);
        }
        buf.freeze()
    }

    /// Decode a pre-login message.
    ///
    /// An option whose data lies outside the payload is a fatal
    /// [`ProtocolError::InvalidLength`].
    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        let mut src = payload;
        let mut entries = Vec::new();
        loop {
            if !src.has_remaining() {
                return Err(ProtocolError::UnexpectedEof);
            }
            let tag = src.get_u8();
            if tag == PreLoginOption::Terminator as u8 {
                break;
            }
            if src.remaining() < 4 {
                return Err(ProtocolError::UnexpectedEof);
            }
            let offset = usize::from(src.get_u16());
            let length = usize::from(src.get_u16());
            entries.push((PreLoginOption::from_u8(tag)?, offset, length));
        }

        let mut prelogin = Self {
            version: [0; 6],
            encryption: EncryptionLevel::Off,
            instance: None,
            thread_id: None,
            mars: false,
            trace_id: None,
            fed_auth_required: false,
            nonce: None,
        };
        for (option, offset, length) in entries {
            let data = payload
                .get(offset..offset + length)
                .ok_or(ProtocolError::InvalidLength {
                    context: "prelogin option",
                    length,
                })?;
            match option {
                PreLoginOption::Version => {
                    let n = data.len().min(6);
                    prelogin.version[..n].copy_from_slice(&data[..n]);
                }
                PreLoginOption::Encryption => {
                    if let Some(&b) = data.first() {
                        prelogin.encryption = EncryptionLevel::from_u8(b)?;
                    }
                }
                PreLoginOption::Instance => {
                    let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
                    prelogin.instance = Some(String::from_utf8_lossy(&data[..end]).into_owned());
                }
                PreLoginOption::ThreadId if data.len() >= 4 => {
                    prelogin.thread_id =
                        Some(u32::from_be_bytes([data[0], data[1], data[2], data[3]]));
                }
                PreLoginOption::Mars => prelogin.mars = data.first().is_some_and(|&b| b != 0),
                PreLoginOption::TraceId => prelogin.trace_id = TraceId::from_bytes(data),
                PreLoginOption::FedAuthRequired => {
                    prelogin.fed_auth_required = data.first().is_some_and(|&b| b != 0);
                }
                PreLoginOption::Nonce if data.len() >= 32 => {
                    let mut nonce = [0u8; 32];
                    nonce.copy_from_slice(&data[..32]);
                    prelogin.nonce = Some(nonce);
                }
                _ => {}
            }
        }
        Ok(prelogin)
    }
}
