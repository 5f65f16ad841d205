//! TDS data type identifiers and the type descriptor table.
//!
//! Every column or parameter is described on the wire by a 1-byte type tag
//! followed by a tag-specific TYPE_INFO block. [`TypeDescriptor`] captures,
//! per tag, how that block is laid out and how values of the type are
//! length-prefixed in row data. The table is a fixed 256-entry array built at
//! compile time, so lookups never allocate.
//!
//! [`TypeInfo`] is the decoded TYPE_INFO. It deliberately carries two type
//! ids: the *wire* id that drives encoding, and the *declared* id reported to
//! the server in `sp_executesql` declarations and to reflection APIs. They
//! differ when, for example, JSON text travels as NVARCHAR but is declared as
//! the native `json` type.

use bytes::{Buf, BufMut};

use crate::codec::{ensure, read_us_varchar, write_b_varchar, write_us_varchar};
use crate::error::ProtocolError;

/// Marker used by USHORTLEN types to announce PLP (MAX) values.
pub const PLP_MARKER: u16 = 0xFFFF;

/// Size of the binary VECTOR header that precedes the element payload.
pub const VECTOR_HEADER_SIZE: usize = 8;

/// Reflection length reported for NVARCHAR(MAX) / JSON.
pub const MAX_NVARCHAR_LENGTH: i64 = 2_147_483_645 / 2;

/// Reflection length reported for VARCHAR(MAX) / VARBINARY(MAX).
pub const MAX_VARCHAR_LENGTH: i64 = 2_147_483_645;

/// TDS data type identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
#[non_exhaustive]
pub enum TypeId {
    /// NULL type.
    Null = 0x1F,
    /// 8-bit integer.
    Int1 = 0x30,
    /// Bit.
    Bit = 0x32,
    /// 16-bit integer.
    Int2 = 0x34,
    /// 32-bit integer.
    Int4 = 0x38,
    /// 64-bit integer.
    Int8 = 0x7F,
    /// Nullable datetime.
    DateTimeN = 0x6F,
    /// 32-bit float.
    Float4 = 0x3B,
    /// 64-bit float.
    Float8 = 0x3E,
    /// 8-byte money.
    Money = 0x3C,
    /// 4-byte money.
    Money4 = 0x7A,
    /// 8-byte datetime.
    DateTime = 0x3D,
    /// 4-byte datetime.
    DateTime4 = 0x3A,
    /// Unique identifier.
    Guid = 0x24,
    /// Nullable integer.
    IntN = 0x26,
    /// Legacy decimal.
    Decimal = 0x37,
    /// Legacy numeric.
    Numeric = 0x3F,
    /// Nullable bit.
    BitN = 0x68,
    /// Nullable decimal.
    DecimalN = 0x6A,
    /// Nullable numeric.
    NumericN = 0x6C,
    /// Nullable float.
    FloatN = 0x6D,
    /// Nullable money.
    MoneyN = 0x6E,
    /// Legacy char.
    Char = 0x2F,
    /// Legacy varchar.
    VarChar = 0x27,
    /// Legacy binary.
    Binary = 0x2D,
    /// Legacy varbinary.
    VarBinary = 0x25,
    /// Varchar.
    BigVarChar = 0xA7,
    /// Varbinary.
    BigVarBinary = 0xA5,
    /// Char.
    BigChar = 0xAF,
    /// Binary.
    BigBinary = 0xAD,
    /// Nchar.
    NChar = 0xEF,
    /// Nvarchar.
    NVarChar = 0xE7,
    /// Text (deprecated LOB).
    Text = 0x23,
    /// Image (deprecated LOB).
    Image = 0x22,
    /// Ntext (deprecated LOB).
    NText = 0x63,
    /// Date.
    Date = 0x28,
    /// Time.
    Time = 0x29,
    /// Datetime2.
    DateTime2 = 0x2A,
    /// Datetimeoffset.
    DateTimeOffset = 0x2B,
    /// sql_variant.
    Variant = 0x62,
    /// CLR user-defined type.
    Udt = 0xF0,
    /// XML.
    Xml = 0xF1,
    /// Native JSON.
    Json = 0xF4,
    /// Native VECTOR.
    Vector = 0xF5,
}

impl TypeId {
    /// Create a type ID from a raw byte.
    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        TypeDescriptor::lookup(value).map(|d| d.id)
    }

    /// The descriptor for this type.
    #[must_use]
    pub fn descriptor(self) -> &'static TypeDescriptor {
        // Every variant has a table entry; see `test_every_variant_has_descriptor`.
        match &DESCRIPTORS[self as usize] {
            Some(d) => d,
            None => &NULL_DESCRIPTOR,
        }
    }

    /// Check if this is a fixed-length type.
    #[must_use]
    pub fn is_fixed_length(self) -> bool {
        matches!(self.descriptor().value_len, ValueLen::Fixed(_))
    }

    /// Get the fixed size of this type in bytes, if applicable.
    #[must_use]
    pub fn fixed_size(self) -> Option<usize> {
        match self.descriptor().value_len {
            ValueLen::Fixed(n) => Some(n),
            _ => None,
        }
    }

    /// Check if this is a Unicode character type.
    #[must_use]
    pub const fn is_unicode(self) -> bool {
        matches!(self, Self::NChar | Self::NVarChar | Self::NText)
    }

    /// Check if this is a date/time type.
    #[must_use]
    pub const fn is_datetime(self) -> bool {
        matches!(
            self,
            Self::DateTime
                | Self::DateTime4
                | Self::DateTimeN
                | Self::Date
                | Self::Time
                | Self::DateTime2
                | Self::DateTimeOffset
        )
    }
}

/// Layout of the TYPE_INFO block that follows a type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InfoLayout {
    /// No TYPE_INFO bytes.
    None,
    /// 1-byte maximum length.
    ByteLen,
    /// 1-byte length, precision, scale.
    Precision,
    /// 1-byte fractional-seconds scale.
    Scale,
    /// 2-byte maximum length.
    UShortLen,
    /// 2-byte maximum length followed by a 5-byte collation.
    UShortLenCollation,
    /// 4-byte length, optional collation, and a multi-part table name.
    LongLen {
        /// Whether a collation follows the length.
        collation: bool,
    },
    /// 4-byte maximum length.
    Variant,
    /// Schema-present flag and optional schema collection names.
    Xml,
    /// 2-byte maximum length followed by four names.
    Udt,
    /// 2-byte maximum length (always the PLP marker in practice).
    Json,
    /// 2-byte size followed by a 1-byte element-type scale.
    Vector,
}

/// How a value of the type is length-prefixed inside a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueLen {
    /// Exactly `n` bytes, never NULL on the wire.
    Fixed(usize),
    /// 1-byte length; 0 means NULL.
    Byte,
    /// 2-byte length; `0xFFFF` means NULL. PLP when the max length is `0xFFFF`.
    UShort,
    /// 4-byte length; 0 means NULL.
    Long,
    /// Text pointer + timestamp + 4-byte length; empty pointer means NULL.
    TextPtr,
    /// Partially length-prefixed chunks.
    Plp,
}

/// Immutable per-type record in the descriptor table.
#[derive(Debug, Clone, Copy)]
pub struct TypeDescriptor {
    /// The type this entry describes.
    pub id: TypeId,
    /// TYPE_INFO layout.
    pub info: InfoLayout,
    /// Row value length rule.
    pub value_len: ValueLen,
    /// Base name used in parameter declarations.
    pub decl_name: &'static str,
    /// Upper-case name reported by reflection.
    pub type_name: &'static str,
}

impl TypeDescriptor {
    /// Look up the descriptor for a raw type tag.
    #[must_use]
    pub fn lookup(tag: u8) -> Option<&'static TypeDescriptor> {
        DESCRIPTORS[usize::from(tag)].as_ref()
    }
}

const fn entry(
    id: TypeId,
    info: InfoLayout,
    value_len: ValueLen,
    decl_name: &'static str,
    type_name: &'static str,
) -> TypeDescriptor {
    TypeDescriptor {
        id,
        info,
        value_len,
        decl_name,
        type_name,
    }
}

const NULL_DESCRIPTOR: TypeDescriptor = entry(
    TypeId::Null,
    InfoLayout::None,
    ValueLen::Fixed(0),
    "null",
    "NULL",
);

static DESCRIPTORS: [Option<TypeDescriptor>; 256] = build_descriptors();

const fn build_descriptors() -> [Option<TypeDescriptor>; 256] {
    use InfoLayout as I;
    use ValueLen as V;

    let entries = [
        NULL_DESCRIPTOR,
        entry(TypeId::Int1, I::None, V::Fixed(1), "tinyint", "TINYINT"),
        entry(TypeId::Bit, I::None, V::Fixed(1), "bit", "BIT"),
        entry(TypeId::Int2, I::None, V::Fixed(2), "smallint", "SMALLINT"),
        entry(TypeId::Int4, I::None, V::Fixed(4), "int", "INT"),
        entry(TypeId::Int8, I::None, V::Fixed(8), "bigint", "BIGINT"),
        entry(TypeId::Float4, I::None, V::Fixed(4), "real", "REAL"),
        entry(TypeId::Float8, I::None, V::Fixed(8), "float", "FLOAT"),
        entry(TypeId::Money, I::None, V::Fixed(8), "money", "MONEY"),
        entry(TypeId::Money4, I::None, V::Fixed(4), "smallmoney", "SMALLMONEY"),
        entry(TypeId::DateTime, I::None, V::Fixed(8), "datetime", "DATETIME"),
        entry(TypeId::DateTime4, I::None, V::Fixed(4), "smalldatetime", "SMALLDATETIME"),
        entry(TypeId::Guid, I::ByteLen, V::Byte, "uniqueidentifier", "UNIQUEIDENTIFIER"),
        entry(TypeId::IntN, I::ByteLen, V::Byte, "int", "INT"),
        entry(TypeId::BitN, I::ByteLen, V::Byte, "bit", "BIT"),
        entry(TypeId::FloatN, I::ByteLen, V::Byte, "float", "FLOAT"),
        entry(TypeId::MoneyN, I::ByteLen, V::Byte, "money", "MONEY"),
        entry(TypeId::DateTimeN, I::ByteLen, V::Byte, "datetime", "DATETIME"),
        entry(TypeId::Decimal, I::Precision, V::Byte, "decimal", "DECIMAL"),
        entry(TypeId::Numeric, I::Precision, V::Byte, "numeric", "DECIMAL"),
        entry(TypeId::DecimalN, I::Precision, V::Byte, "decimal", "DECIMAL"),
        entry(TypeId::NumericN, I::Precision, V::Byte, "numeric", "DECIMAL"),
        entry(TypeId::Char, I::ByteLen, V::Byte, "char", "CHAR"),
        entry(TypeId::VarChar, I::ByteLen, V::Byte, "varchar", "VARCHAR"),
        entry(TypeId::Binary, I::ByteLen, V::Byte, "binary", "BINARY"),
        entry(TypeId::VarBinary, I::ByteLen, V::Byte, "varbinary", "VARBINARY"),
        entry(TypeId::BigVarChar, I::UShortLenCollation, V::UShort, "varchar", "VARCHAR"),
        entry(TypeId::BigChar, I::UShortLenCollation, V::UShort, "char", "CHAR"),
        entry(TypeId::NVarChar, I::UShortLenCollation, V::UShort, "nvarchar", "NVARCHAR"),
        entry(TypeId::NChar, I::UShortLenCollation, V::UShort, "nchar", "NCHAR"),
        entry(TypeId::BigVarBinary, I::UShortLen, V::UShort, "varbinary", "VARBINARY"),
        entry(TypeId::BigBinary, I::UShortLen, V::UShort, "binary", "BINARY"),
        entry(TypeId::Text, I::LongLen { collation: true }, V::TextPtr, "text", "TEXT"),
        entry(TypeId::NText, I::LongLen { collation: true }, V::TextPtr, "ntext", "NTEXT"),
        entry(TypeId::Image, I::LongLen { collation: false }, V::TextPtr, "image", "IMAGE"),
        entry(TypeId::Date, I::None, V::Byte, "date", "DATE"),
        entry(TypeId::Time, I::Scale, V::Byte, "time", "TIME"),
        entry(TypeId::DateTime2, I::Scale, V::Byte, "datetime2", "DATETIME2"),
        entry(TypeId::DateTimeOffset, I::Scale, V::Byte, "datetimeoffset", "DATETIMEOFFSET"),
        entry(TypeId::Variant, I::Variant, V::Long, "sql_variant", "SQL_VARIANT"),
        entry(TypeId::Udt, I::Udt, V::UShort, "varbinary(max)", "UDT"),
        entry(TypeId::Xml, I::Xml, V::Plp, "xml", "XML"),
        entry(TypeId::Json, I::Json, V::Plp, "json", "JSON"),
        entry(TypeId::Vector, I::Vector, V::UShort, "vector", "VECTOR"),
    ];

    let mut table: [Option<TypeDescriptor>; 256] = [None; 256];
    let mut i = 0;
    while i < entries.len() {
        table[entries[i].id as usize] = Some(entries[i]);
        i += 1;
    }
    table
}

/// SQL Server collation (5 bytes on the wire).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Collation {
    /// Locale ID and comparison flags.
    pub lcid: u32,
    /// Sort ID.
    pub sort_id: u8,
}

/// Bit 27 of the collation info marks a UTF-8 collation.
pub const COLLATION_FLAG_UTF8: u32 = 0x0800_0000;

impl Collation {
    /// Wire size of a collation.
    pub const SIZE: usize = 5;

    /// Decode a collation.
    pub fn decode(src: &mut impl Buf) -> Result<Self, ProtocolError> {
        ensure(src, Self::SIZE)?;
        let lcid = src.get_u32_le();
        let sort_id = src.get_u8();
        Ok(Self { lcid, sort_id })
    }

    /// Encode a collation.
    pub fn encode(&self, dst: &mut impl BufMut) {
        dst.put_u32_le(self.lcid);
        dst.put_u8(self.sort_id);
    }

    /// Whether this collation stores VARCHAR data as UTF-8.
    #[must_use]
    pub fn is_utf8(&self) -> bool {
        self.lcid & COLLATION_FLAG_UTF8 != 0
    }

    /// Character encoding for single-byte VARCHAR data.
    ///
    /// Only UTF-8 and the Latin1_General default are distinguished; other
    /// code pages decode through Windows-1252.
    #[cfg(feature = "encoding")]
    #[must_use]
    pub fn encoding(&self) -> &'static encoding_rs::Encoding {
        if self.is_utf8() {
            encoding_rs::UTF_8
        } else {
            encoding_rs::WINDOWS_1252
        }
    }
}

/// Decoded TYPE_INFO for a column, parameter, or return value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeInfo {
    /// Wire type id; drives encoding and row-length rules.
    pub type_id: TypeId,
    /// Declared type id; drives declarations and reflection.
    pub decl_type_id: TypeId,
    /// Maximum length (or VECTOR size) from the TYPE_INFO block.
    pub max_length: u32,
    /// Decimal precision.
    pub precision: u8,
    /// Decimal scale, fractional-seconds scale, or VECTOR element type.
    pub scale: u8,
    /// Collation for character types.
    pub collation: Option<Collation>,
    /// UDT type name or XML schema collection, when present.
    pub udt_name: Option<String>,
    /// Full CLR UDT description for UDT columns.
    pub udt: Option<UdtInfo>,
}

/// The four names in a UDT TYPE_INFO block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UdtInfo {
    /// Database holding the type.
    pub database: String,
    /// Owning schema.
    pub schema: String,
    /// Type name.
    pub type_name: String,
    /// Assembly-qualified CLR name.
    pub assembly: String,
}

impl TypeInfo {
    /// Type info for a type whose wire and declared ids agree.
    ///
    /// Character types start with the default collation, since their
    /// TYPE_INFO block always carries one.
    #[must_use]
    pub fn new(type_id: TypeId) -> Self {
        let collated = matches!(
            type_id.descriptor().info,
            InfoLayout::UShortLenCollation | InfoLayout::LongLen { collation: true }
        );
        Self {
            type_id,
            decl_type_id: type_id,
            max_length: type_id.fixed_size().map_or(0, |n| n as u32),
            precision: 0,
            scale: 0,
            collation: collated.then(Collation::default),
            udt_name: None,
            udt: None,
        }
    }

    /// Set the maximum length.
    #[must_use]
    pub fn with_max_length(mut self, max_length: u32) -> Self {
        self.max_length = max_length;
        self
    }

    /// Set precision and scale.
    #[must_use]
    pub fn with_precision(mut self, precision: u8, scale: u8) -> Self {
        self.precision = precision;
        self.scale = scale;
        self
    }

    /// Set the scale alone (time types, VECTOR element type).
    #[must_use]
    pub fn with_scale(mut self, scale: u8) -> Self {
        self.scale = scale;
        self
    }

    /// Set the collation.
    #[must_use]
    pub fn with_collation(mut self, collation: Collation) -> Self {
        self.collation = Some(collation);
        self
    }

    /// Override the declared type id while keeping the wire id.
    #[must_use]
    pub fn declared_as(mut self, decl_type_id: TypeId) -> Self {
        self.decl_type_id = decl_type_id;
        self
    }

    /// Decode a type tag plus its TYPE_INFO block.
    ///
    /// An unknown tag is fatal: nothing after it can be located.
    pub fn decode(src: &mut impl Buf) -> Result<Self, ProtocolError> {
        ensure(src, 1)?;
        let tag = src.get_u8();
        let descriptor = TypeDescriptor::lookup(tag).ok_or(ProtocolError::UnknownType(tag))?;
        let mut info = Self::new(descriptor.id);

        match descriptor.info {
            InfoLayout::None => {}
            InfoLayout::ByteLen => {
                ensure(src, 1)?;
                info.max_length = u32::from(src.get_u8());
            }
            InfoLayout::Precision => {
                ensure(src, 3)?;
                info.max_length = u32::from(src.get_u8());
                info.precision = src.get_u8();
                info.scale = src.get_u8();
            }
            InfoLayout::Scale => {
                ensure(src, 1)?;
                info.scale = src.get_u8();
            }
            InfoLayout::UShortLen => {
                ensure(src, 2)?;
                info.max_length = u32::from(src.get_u16_le());
            }
            InfoLayout::UShortLenCollation => {
                ensure(src, 2 + Collation::SIZE)?;
                info.max_length = u32::from(src.get_u16_le());
                info.collation = Some(Collation::decode(src)?);
            }
            InfoLayout::LongLen { collation } => {
                ensure(src, 4)?;
                info.max_length = src.get_u32_le();
                if collation {
                    info.collation = Some(Collation::decode(src)?);
                }
                ensure(src, 1)?;
                let parts = src.get_u8();
                let mut names = Vec::with_capacity(usize::from(parts));
                for _ in 0..parts {
                    names.push(read_us_varchar(src)?);
                }
                if !names.is_empty() {
                    info.udt_name = Some(names.join("."));
                }
            }
            InfoLayout::Variant => {
                ensure(src, 4)?;
                info.max_length = src.get_u32_le();
            }
            InfoLayout::Xml => {
                ensure(src, 1)?;
                info.max_length = u32::from(PLP_MARKER);
                if src.get_u8() != 0 {
                    let db = read_b_varchar_name(src)?;
                    let schema = read_b_varchar_name(src)?;
                    let collection = read_us_varchar(src)?;
                    info.udt_name = Some(format!("{db}.{schema}.{collection}"));
                }
            }
            InfoLayout::Udt => {
                ensure(src, 2)?;
                info.max_length = u32::from(src.get_u16_le());
                let udt = UdtInfo {
                    database: read_b_varchar_name(src)?,
                    schema: read_b_varchar_name(src)?,
                    type_name: read_b_varchar_name(src)?,
                    assembly: read_us_varchar(src)?,
                };
                info.udt_name = Some(format!("{}.{}", udt.schema, udt.type_name));
                info.udt = Some(udt);
            }
            InfoLayout::Json => {
                ensure(src, 2)?;
                info.max_length = u32::from(src.get_u16_le());
            }
            InfoLayout::Vector => {
                ensure(src, 3)?;
                info.max_length = u32::from(src.get_u16_le());
                info.scale = src.get_u8();
            }
        }

        Ok(info)
    }

    /// Encode the type tag plus TYPE_INFO block for the wire id.
    pub fn encode(&self, dst: &mut impl BufMut) {
        let descriptor = self.type_id.descriptor();
        dst.put_u8(self.type_id as u8);
        match descriptor.info {
            InfoLayout::None => {}
            InfoLayout::ByteLen => dst.put_u8(self.max_length as u8),
            InfoLayout::Precision => {
                dst.put_u8(self.max_length as u8);
                dst.put_u8(self.precision);
                dst.put_u8(self.scale);
            }
            InfoLayout::Scale => dst.put_u8(self.scale),
            InfoLayout::UShortLen | InfoLayout::Json => dst.put_u16_le(self.max_length as u16),
            InfoLayout::UShortLenCollation => {
                dst.put_u16_le(self.max_length as u16);
                self.collation.unwrap_or_default().encode(dst);
            }
            InfoLayout::LongLen { collation } => {
                dst.put_u32_le(self.max_length);
                if collation {
                    self.collation.unwrap_or_default().encode(dst);
                }
                match &self.udt_name {
                    Some(table) => {
                        let parts: Vec<&str> = table.split('.').collect();
                        dst.put_u8(parts.len() as u8);
                        for part in parts {
                            write_us_varchar(dst, part);
                        }
                    }
                    None => dst.put_u8(0),
                }
            }
            InfoLayout::Variant => dst.put_u32_le(self.max_length),
            InfoLayout::Xml => match &self.udt_name {
                Some(collection) => {
                    let mut parts = collection.splitn(3, '.');
                    dst.put_u8(1);
                    write_b_varchar(dst, parts.next().unwrap_or_default());
                    write_b_varchar(dst, parts.next().unwrap_or_default());
                    write_us_varchar(dst, parts.next().unwrap_or_default());
                }
                None => dst.put_u8(0),
            },
            InfoLayout::Udt => {
                dst.put_u16_le(self.max_length as u16);
                let udt = self.udt.clone().unwrap_or_default();
                write_b_varchar(dst, &udt.database);
                write_b_varchar(dst, &udt.schema);
                write_b_varchar(dst, &udt.type_name);
                write_us_varchar(dst, &udt.assembly);
            }
            InfoLayout::Vector => {
                dst.put_u16_le(self.max_length as u16);
                dst.put_u8(self.scale);
            }
        }
    }

    /// Whether values of this type are carried as PLP chunks.
    #[must_use]
    pub fn is_plp(&self) -> bool {
        match self.type_id.descriptor().value_len {
            ValueLen::Plp => true,
            ValueLen::UShort => self.max_length == u32::from(PLP_MARKER),
            _ => false,
        }
    }

    /// Row value length rule, resolving USHORTLEN types with a MAX length to PLP.
    #[must_use]
    pub fn value_len(&self) -> ValueLen {
        if self.is_plp() {
            ValueLen::Plp
        } else {
            self.type_id.descriptor().value_len
        }
    }

    /// Declaration used in `sp_executesql` parameter lists.
    #[must_use]
    pub fn decl_name(&self) -> String {
        let base = self.decl_type_id.descriptor().decl_name;
        let is_max = self.max_length == 0 || self.max_length == u32::from(PLP_MARKER);
        match self.decl_type_id {
            TypeId::IntN => match self.max_length {
                1 => "tinyint".into(),
                2 => "smallint".into(),
                8 => "bigint".into(),
                _ => "int".into(),
            },
            TypeId::FloatN => match self.max_length {
                4 => "real".into(),
                _ => "float".into(),
            },
            TypeId::MoneyN => match self.max_length {
                4 => "smallmoney".into(),
                _ => "money".into(),
            },
            TypeId::DateTimeN => match self.max_length {
                4 => "smalldatetime".into(),
                _ => "datetime".into(),
            },
            TypeId::NVarChar | TypeId::NChar => {
                if is_max || self.max_length > 8000 {
                    format!("{base}(max)")
                } else {
                    format!("{base}({})", self.max_length / 2)
                }
            }
            TypeId::BigVarChar | TypeId::BigChar | TypeId::BigVarBinary | TypeId::BigBinary => {
                if is_max || self.max_length > 8000 {
                    format!("{base}(max)")
                } else {
                    format!("{base}({})", self.max_length)
                }
            }
            TypeId::Decimal | TypeId::Numeric | TypeId::DecimalN | TypeId::NumericN => {
                format!("{base}({}, {})", self.precision, self.scale)
            }
            TypeId::Time | TypeId::DateTime2 | TypeId::DateTimeOffset => {
                format!("{base}({})", self.scale)
            }
            TypeId::Vector => match self.vector_dimensions() {
                Some(dims) if self.scale == VECTOR_SCALE_FLOAT16 => {
                    format!("vector({dims}, float16)")
                }
                Some(dims) => format!("vector({dims})"),
                None => base.into(),
            },
            _ => base.into(),
        }
    }

    /// Upper-case type name for reflection.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match (self.decl_type_id, self.max_length) {
            (TypeId::IntN, 1) => "TINYINT",
            (TypeId::IntN, 2) => "SMALLINT",
            (TypeId::IntN, 8) => "BIGINT",
            (TypeId::FloatN, 4) => "REAL",
            (TypeId::MoneyN, 4) => "SMALLMONEY",
            (TypeId::DateTimeN, 4) => "SMALLDATETIME",
            (id, _) => id.descriptor().type_name,
        }
    }

    /// Reflection length: characters for text, bytes for binary, dimensions for VECTOR.
    #[must_use]
    pub fn length(&self) -> Option<i64> {
        let max = self.max_length == u32::from(PLP_MARKER);
        match self.decl_type_id {
            TypeId::NVarChar | TypeId::NChar => Some(if max {
                MAX_NVARCHAR_LENGTH
            } else {
                i64::from(self.max_length / 2)
            }),
            TypeId::BigVarChar | TypeId::BigChar | TypeId::BigVarBinary | TypeId::BigBinary => {
                Some(if max {
                    MAX_VARCHAR_LENGTH
                } else {
                    i64::from(self.max_length)
                })
            }
            TypeId::NText | TypeId::Xml | TypeId::Json => Some(MAX_NVARCHAR_LENGTH),
            TypeId::Text | TypeId::Image => Some(MAX_VARCHAR_LENGTH),
            TypeId::Vector => {
                if !matches!(self.scale, VECTOR_SCALE_FLOAT32 | VECTOR_SCALE_FLOAT16) {
                    return None;
                }
                self.vector_dimensions().map(|d| d as i64)
            }
            _ => None,
        }
    }

    /// Reflection precision and scale, for types that carry them.
    #[must_use]
    pub fn precision_scale(&self) -> Option<(u8, u8)> {
        match self.decl_type_id {
            TypeId::Decimal | TypeId::Numeric | TypeId::DecimalN | TypeId::NumericN => {
                Some((self.precision, self.scale))
            }
            TypeId::Time | TypeId::DateTime2 | TypeId::DateTimeOffset => Some((0, self.scale)),
            _ => None,
        }
    }

    /// VECTOR dimension count implied by the declared size.
    ///
    /// `None` for the PLP marker, sizes smaller than the header, a zero-length
    /// payload, or a payload that is not a whole number of elements.
    #[must_use]
    pub fn vector_dimensions(&self) -> Option<usize> {
        if self.max_length == u32::from(PLP_MARKER) {
            return None;
        }
        let size = self.max_length as usize;
        let bytes_per_element = if self.scale == VECTOR_SCALE_FLOAT16 { 2 } else { 4 };
        let payload = size.checked_sub(VECTOR_HEADER_SIZE)?;
        if payload == 0 || payload % bytes_per_element != 0 {
            return None;
        }
        Some(payload / bytes_per_element)
    }
}

/// VECTOR scale byte for float32 elements.
pub const VECTOR_SCALE_FLOAT32: u8 = 0x00;

/// VECTOR scale byte for float16 elements.
pub const VECTOR_SCALE_FLOAT16: u8 = 0x01;

fn read_b_varchar_name(src: &mut impl Buf) -> Result<String, ProtocolError> {
    crate::codec::read_b_varchar(src)
}

/// Column flags from COLMETADATA.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ColumnFlags {
    /// Column is nullable.
    pub nullable: bool,
    /// Column allows case-sensitive comparison.
    pub case_sensitive: bool,
    /// Column is an identity column.
    pub identity: bool,
    /// Column is computed.
    pub computed: bool,
    /// Column is encrypted (Always Encrypted).
    pub encrypted: bool,
    /// Column is hidden.
    pub hidden: bool,
}

impl ColumnFlags {
    /// Parse column flags from the 2-byte flags field.
    #[must_use]
    pub fn from_bits(flags: u16) -> Self {
        Self {
            nullable: flags & 0x0001 != 0,
            case_sensitive: flags & 0x0002 != 0,
            identity: flags & 0x0010 != 0,
            computed: flags & 0x0020 != 0,
            encrypted: flags & 0x0800 != 0,
            hidden: flags & 0x2000 != 0,
        }
    }

    /// Convert flags back to bits.
    #[must_use]
    pub fn to_bits(&self) -> u16 {
        [
            (self.nullable, 0x0001),
            (self.case_sensitive, 0x0002),
            (self.identity, 0x0010),
            (self.computed, 0x0020),
            (self.encrypted, 0x0800),
            (self.hidden, 0x2000),
        ]
        .iter()
        .filter(|(set, _)| *set)
        .fold(0, |acc, (_, bit)| acc | bit)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const ALL: [TypeId; 43] = [
        TypeId::Null,
        TypeId::Int1,
        TypeId::Bit,
        TypeId::Int2,
        TypeId::Int4,
        TypeId::Int8,
        TypeId::DateTimeN,
        TypeId::Float4,
        TypeId::Float8,
        TypeId::Money,
        TypeId::Money4,
        TypeId::DateTime,
        TypeId::DateTime4,
        TypeId::Guid,
        TypeId::IntN,
        TypeId::Decimal,
        TypeId::Numeric,
        TypeId::BitN,
        TypeId::DecimalN,
        TypeId::NumericN,
        TypeId::FloatN,
        TypeId::MoneyN,
        TypeId::Char,
        TypeId::VarChar,
        TypeId::Binary,
        TypeId::VarBinary,
        TypeId::BigVarChar,
        TypeId::BigVarBinary,
        TypeId::BigChar,
        TypeId::BigBinary,
        TypeId::NChar,
        TypeId::NVarChar,
        TypeId::Text,
        TypeId::Image,
        TypeId::NText,
        TypeId::Date,
        TypeId::Time,
        TypeId::DateTime2,
        TypeId::DateTimeOffset,
        TypeId::Variant,
        TypeId::Xml,
        TypeId::Json,
        TypeId::Vector,
    ];

    #[test]
    fn test_every_variant_has_descriptor() {
        for id in ALL {
            let d = TypeDescriptor::lookup(id as u8).unwrap();
            assert_eq!(d.id, id);
        }
        assert!(TypeDescriptor::lookup(TypeId::Udt as u8).is_some());
    }

    #[test]
    fn test_type_id_from_u8() {
        assert_eq!(TypeId::from_u8(0x38), Some(TypeId::Int4));
        assert_eq!(TypeId::from_u8(0xE7), Some(TypeId::NVarChar));
        assert_eq!(TypeId::from_u8(0xF4), Some(TypeId::Json));
        assert_eq!(TypeId::from_u8(0xF5), Some(TypeId::Vector));
        assert_eq!(TypeId::from_u8(0x99), None);
    }

    #[test]
    fn test_unknown_tag_is_fatal() {
        let raw = [0x99, 0x00];
        let mut cursor = &raw[..];
        assert_eq!(
            TypeInfo::decode(&mut cursor),
            Err(ProtocolError::UnknownType(0x99))
        );
    }

    #[test]
    fn test_nvarchar_type_info_roundtrip() {
        let info = TypeInfo::new(TypeId::NVarChar)
            .with_max_length(100)
            .with_collation(Collation {
                lcid: 0x0409,
                sort_id: 52,
            });
        let mut buf = bytes::BytesMut::new();
        info.encode(&mut buf);
        assert_eq!(buf.len(), 1 + 2 + 5);

        let decoded = TypeInfo::decode(&mut buf.freeze()).unwrap();
        assert_eq!(decoded, info);
        assert_eq!(decoded.decl_name(), "nvarchar(50)");
        assert_eq!(decoded.length(), Some(50));
    }

    #[test]
    fn test_json_type_info() {
        let raw = [0xF4, 0xFF, 0xFF];
        let info = TypeInfo::decode(&mut &raw[..]).unwrap();
        assert_eq!(info.type_id, TypeId::Json);
        assert!(info.is_plp());
        assert_eq!(info.decl_name(), "json");
        assert_eq!(info.type_name(), "JSON");
        assert_eq!(info.length(), Some(2_147_483_645 / 2));
        assert_eq!(info.precision_scale(), None);
    }

    #[test]
    fn test_declared_type_differs_from_wire() {
        let info = TypeInfo::new(TypeId::NVarChar)
            .with_max_length(0)
            .declared_as(TypeId::Json);
        assert_eq!(info.decl_name(), "json");
        assert_eq!(info.type_name(), "JSON");

        let mut buf = bytes::BytesMut::new();
        info.encode(&mut buf);
        assert_eq!(buf[0], 0xE7);
    }

    #[test]
    fn test_vector_decl_names() {
        let v = |size: u32, scale: u8| {
            TypeInfo::new(TypeId::Vector)
                .with_max_length(size)
                .with_scale(scale)
        };
        assert_eq!(v(20, 0).decl_name(), "vector(3)");
        assert_eq!(v(14, 1).decl_name(), "vector(3, float16)");
        assert_eq!(v(4, 0).decl_name(), "vector");
        assert_eq!(v(8, 0).decl_name(), "vector");
        assert_eq!(v(11, 0).decl_name(), "vector");
    }

    #[test]
    fn test_vector_reflection() {
        let v = |size: u32, scale: u8| {
            TypeInfo::new(TypeId::Vector)
                .with_max_length(size)
                .with_scale(scale)
        };
        assert_eq!(v(20, 0).length(), Some(3));
        assert_eq!(v(14, 1).length(), Some(3));
        assert_eq!(v(20, 99).length(), None);
        assert_eq!(v(0xFFFF, 0).length(), None);
        assert_eq!(v(4, 0).length(), None);
        assert_eq!(v(11, 0).length(), None);
        assert_eq!(v(20, 0).type_name(), "VECTOR");
        assert_eq!(v(20, 0).precision_scale(), None);
    }

    #[test]
    fn test_vector_type_info_decode() {
        let raw = [0xF5, 0x14, 0x00, 0x00];
        let info = TypeInfo::decode(&mut &raw[..]).unwrap();
        assert_eq!(info.max_length, 20);
        assert_eq!(info.value_len(), ValueLen::UShort);

        let plp = [0xF5, 0xFF, 0xFF, 0x01];
        let info = TypeInfo::decode(&mut &plp[..]).unwrap();
        assert_eq!(info.value_len(), ValueLen::Plp);
    }

    #[test]
    fn test_decimal_decl_and_precision() {
        let raw = [0x6A, 0x11, 0x26, 0x04];
        let info = TypeInfo::decode(&mut &raw[..]).unwrap();
        assert_eq!(info.decl_name(), "decimal(38, 4)");
        assert_eq!(info.precision_scale(), Some((38, 4)));
    }

    #[test]
    fn test_intn_reflection_by_length() {
        let info = TypeInfo::new(TypeId::IntN).with_max_length(8);
        assert_eq!(info.decl_name(), "bigint");
        assert_eq!(info.type_name(), "BIGINT");
        let money = TypeInfo::new(TypeId::MoneyN).with_max_length(4);
        assert_eq!(money.decl_name(), "smallmoney");
    }

    fn roundtrip(info: &TypeInfo) -> TypeInfo {
        let mut buf = bytes::BytesMut::new();
        info.encode(&mut buf);
        let mut src = buf.freeze();
        let decoded = TypeInfo::decode(&mut src).unwrap();
        assert!(src.is_empty(), "trailing TYPE_INFO bytes for {:?}", info.type_id);
        decoded
    }

    #[test]
    fn test_character_types_carry_default_collation() {
        let nvarchar = TypeInfo::new(TypeId::NVarChar).with_max_length(40);
        assert_eq!(nvarchar.collation, Some(Collation::default()));
        assert_eq!(roundtrip(&nvarchar), nvarchar);

        let text = TypeInfo::new(TypeId::Text).with_max_length(i32::MAX as u32);
        assert_eq!(roundtrip(&text), text);

        assert_eq!(TypeInfo::new(TypeId::Image).collation, None);
        assert_eq!(TypeInfo::new(TypeId::IntN).collation, None);
    }

    #[test]
    fn test_udt_and_xml_roundtrip() {
        let mut udt = TypeInfo::new(TypeId::Udt).with_max_length(u32::from(PLP_MARKER));
        udt.udt = Some(UdtInfo {
            database: "geo".into(),
            schema: "sys".into(),
            type_name: "geography".into(),
            assembly: "Microsoft.SqlServer.Types.SqlGeography".into(),
        });
        udt.udt_name = Some("sys.geography".into());
        assert_eq!(roundtrip(&udt), udt);

        let mut xml = TypeInfo::new(TypeId::Xml).with_max_length(u32::from(PLP_MARKER));
        xml.udt_name = Some("inventory.dbo.OrderSchema".into());
        assert_eq!(roundtrip(&xml), xml);

        let plain = TypeInfo::new(TypeId::Xml);
        assert_eq!(roundtrip(&plain).udt_name, None);
    }

    #[test]
    fn test_column_flags_roundtrip() {
        let flags = ColumnFlags {
            nullable: true,
            identity: true,
            encrypted: true,
            ..Default::default()
        };
        assert_eq!(ColumnFlags::from_bits(flags.to_bits()), flags);
    }
}
