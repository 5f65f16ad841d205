//! RPC (Remote Procedure Call) request encoding.
//!
//! RPC requests (packet type 0x03) call stored procedures. Parameterized
//! queries go through `sp_executesql`, addressed by its well-known id.
//!
//! ## Wire Format
//!
//! ```text
//! ALL_HEADERS
//! ProcName (US_VARCHAR) | 0xFFFF + ProcID (u16)
//! OptionFlags (u16)
//! { ParamName (B_VARCHAR), StatusFlags (u8), TYPE_INFO, value }*
//! ```

use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::codec::{encode_utf16, ensure, read_b_varchar, read_utf16_string, write_b_varchar};
use crate::codec::write_us_varchar;
use crate::error::ProtocolError;
use crate::sql_batch::{read_all_headers, write_all_headers};
use crate::types::{PLP_MARKER, TypeId, TypeInfo};
use crate::value::{read_value, write_value};

/// Name length value announcing a well-known procedure id.
const PROC_ID_MARKER: u16 = 0xFFFF;

/// Longest NVARCHAR, in bytes, that is not sent as MAX.
const MAX_INLINE_NVARCHAR_BYTES: usize = 8000;

/// Well-known stored procedure ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ProcId {
    /// sp_executesql
    ExecuteSql = 0x000A,
    /// sp_prepexec
    PrepExec = 0x000D,
    /// sp_unprepare
    Unprepare = 0x000F,
}

impl ProcId {
    fn from_u16(value: u16) -> Option<Self> {
        match value {
            0x000A => Some(Self::ExecuteSql),
            0x000D => Some(Self::PrepExec),
            0x000F => Some(Self::Unprepare),
            _ => None,
        }
    }
}

/// Target of an RPC request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Procedure {
    /// A procedure called by name.
    Named(String),
    /// A well-known procedure id.
    Id(ProcId),
}

bitflags! {
    /// RPC parameter status flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ParamFlags: u8 {
        /// Output parameter.
        const BY_REF = 0x01;
        /// Use the parameter's default value.
        const DEFAULT = 0x02;
        /// Value is Always Encrypted ciphertext.
        const ENCRYPTED = 0x08;
    }
}

/// An RPC parameter with an already-encoded value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcParam {
    /// Parameter name including the leading `@`; empty for positional.
    pub name: String,
    /// Status flags.
    pub flags: ParamFlags,
    /// Wire and declared type.
    pub type_info: TypeInfo,
    /// Encoded value; `None` is NULL.
    pub value: Option<Bytes>,
}

impl RpcParam {
    /// Create an input parameter.
    pub fn new(name: impl Into<String>, type_info: TypeInfo, value: Option<Bytes>) -> Self {
        Self {
            name: name.into(),
            flags: ParamFlags::empty(),
            type_info,
            value,
        }
    }

    /// An NVARCHAR parameter holding `text`, sent as MAX when it is long.
    pub fn nvarchar(name: impl Into<String>, text: &str) -> Self {
        let value = encode_utf16(text);
        let max_length = if value.len() > MAX_INLINE_NVARCHAR_BYTES {
            u32::from(PLP_MARKER)
        } else {
            value.len().max(2) as u32
        };
        Self::new(
            name,
            TypeInfo::new(TypeId::NVarChar).with_max_length(max_length),
            Some(value),
        )
    }

    /// Mark as an output parameter.
    #[must_use]
    pub fn as_output(mut self) -> Self {
        self.flags.insert(ParamFlags::BY_REF);
        self
    }

    /// Declaration fragment, e.g. `@p1 nvarchar(max) output`.
    #[must_use]
    pub fn declaration(&self) -> String {
        let mut decl = format!("{} {}", self.name, self.type_info.decl_name());
        if self.flags.contains(ParamFlags::BY_REF) {
            decl.push_str(" output");
        }
        decl
    }

    /// Encode name, flags, TYPE_INFO and value.
    pub fn encode(&self, dst: &mut impl BufMut) -> Result<(), ProtocolError> {
        write_b_varchar(dst, &self.name);
        dst.put_u8(self.flags.bits());
        self.type_info.encode(dst);
        write_value(dst, &self.type_info, self.value.as_deref())
    }

    fn decode(src: &mut impl Buf) -> Result<Self, ProtocolError> {
        let name = read_b_varchar(src)?;
        ensure(src, 1)?;
        let flags = ParamFlags::from_bits_retain(src.get_u8());
        let type_info = TypeInfo::decode(src)?;
        let value = read_value(src, &type_info)?;
        Ok(Self {
            name,
            flags,
            type_info,
            value,
        })
    }
}

/// RPC request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcRequest {
    /// Procedure to call.
    pub procedure: Procedure,
    /// Option flags.
    pub options: u16,
    /// Parameters in order.
    pub params: Vec<RpcParam>,
}

impl RpcRequest {
    /// Call a procedure by name.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            procedure: Procedure::Named(name.into()),
            options: 0,
            params: Vec::new(),
        }
    }

    /// Call `sp_executesql` with the statement, its parameter declaration
    /// list, and the parameters themselves.
    pub fn execute_sql(sql: &str, params: Vec<RpcParam>) -> Self {
        let mut all = Vec::with_capacity(params.len() + 2);
        all.push(RpcParam::nvarchar("", sql));
        if !params.is_empty() {
            let declarations = params
                .iter()
                .map(RpcParam::declaration)
                .collect::<Vec<_>>()
                .join(", ");
            all.push(RpcParam::nvarchar("", &declarations));
        }
        all.extend(params);
        Self {
            procedure: Procedure::Id(ProcId::ExecuteSql),
            options: 0,
            params: all,
        }
    }

    /// Add a parameter.
    #[must_use]
    pub fn param(mut self, param: RpcParam) -> Self {
        self.params.push(param);
        self
    }

    /// Encode the request payload.
    pub fn encode(&self, transaction_descriptor: u64) -> Result<Bytes, ProtocolError> {
        let mut buf = BytesMut::with_capacity(256);
        write_all_headers(&mut buf, transaction_descriptor);
        match &self.procedure {
            Procedure::Id(id) => {
                buf.put_u16_le(PROC_ID_MARKER);
                buf.put_u16_le(*id as u16);
            }
            Procedure::Named(name) => write_us_varchar(&mut buf, name),
        }
        buf.put_u16_le(self.options);
        for param in &self.params {
            param.encode(&mut buf)?;
        }
        Ok(buf.freeze())
    }

    /// Decode a request payload into its transaction descriptor and request.
    pub fn decode(payload: &[u8]) -> Result<(u64, Self), ProtocolError> {
        let mut src = payload;
        let descriptor = read_all_headers(&mut src)?.unwrap_or(0);
        ensure(&src, 2)?;
        let name_len = src.get_u16_le();
        let procedure = if name_len == PROC_ID_MARKER {
            ensure(&src, 2)?;
            let raw = src.get_u16_le();
            Procedure::Id(ProcId::from_u16(raw).ok_or(ProtocolError::InvalidField {
                field: "procedure id",
                value: u32::from(raw),
            })?)
        } else {
            Procedure::Named(read_utf16_string(&mut src, usize::from(name_len))?)
        };
        ensure(&src, 2)?;
        let options = src.get_u16_le();
        let mut params = Vec::new();
        while src.has_remaining() {
            params.push(RpcParam::decode(&mut src)?);
        }
        Ok((
            descriptor,
            Self {
                procedure,
                options,
                params,
            },
        ))
    }
}
