//! Length framing of individual values in ROW, RETURNVALUE, RPC and bulk load
//! payloads.
//!
//! The framing is driven entirely by [`TypeInfo::value_len`]; the bytes
//! themselves are opaque here and interpreted by the type codec layer.

use bytes::{Buf, BufMut, Bytes};

use crate::codec::ensure;
use crate::error::ProtocolError;
use crate::plp::{decode_plp, encode_plp};
use crate::types::{TypeId, TypeInfo, ValueLen};

/// NULL marker for legacy BYTELEN character and binary types.
const CHARBIN_NULL: u8 = 0xFF;

/// NULL marker for USHORTLEN types.
const USHORT_NULL: u16 = 0xFFFF;

/// Text pointer length written for non-NULL TEXT/NTEXT/IMAGE values.
const TEXT_PTR_LEN: usize = 16;

fn is_legacy_charbin(type_id: TypeId) -> bool {
    matches!(
        type_id,
        TypeId::Char | TypeId::VarChar | TypeId::Binary | TypeId::VarBinary
    )
}

/// Read one framed value. `None` is SQL NULL.
pub fn read_value(src: &mut impl Buf, info: &TypeInfo) -> Result<Option<Bytes>, ProtocolError> {
    match info.value_len() {
        ValueLen::Fixed(0) => Ok(None),
        ValueLen::Fixed(n) => {
            ensure(src, n)?;
            Ok(Some(src.copy_to_bytes(n)))
        }
        ValueLen::Byte => {
            ensure(src, 1)?;
            let len = src.get_u8();
            if len == 0 && !is_legacy_charbin(info.type_id) {
                return Ok(None);
            }
            if len == CHARBIN_NULL && is_legacy_charbin(info.type_id) {
                return Ok(None);
            }
            let len = usize::from(len);
            ensure(src, len)?;
            Ok(Some(src.copy_to_bytes(len)))
        }
        ValueLen::UShort => {
            ensure(src, 2)?;
            let len = src.get_u16_le();
            if len == USHORT_NULL {
                return Ok(None);
            }
            let len = usize::from(len);
            ensure(src, len)?;
            Ok(Some(src.copy_to_bytes(len)))
        }
        ValueLen::Long => {
            ensure(src, 4)?;
            let len = src.get_u32_le() as usize;
            if len == 0 {
                return Ok(None);
            }
            ensure(src, len)?;
            Ok(Some(src.copy_to_bytes(len)))
        }
        ValueLen::TextPtr => {
            ensure(src, 1)?;
            let ptr_len = usize::from(src.get_u8());
            if ptr_len == 0 {
                return Ok(None);
            }
            // text pointer + 8-byte timestamp
            ensure(src, ptr_len + 8 + 4)?;
            src.advance(ptr_len + 8);
            let len = src.get_u32_le() as usize;
            ensure(src, len)?;
            Ok(Some(src.copy_to_bytes(len)))
        }
        ValueLen::Plp => decode_plp(src),
    }
}

/// Skip one framed value.
pub fn skip_value(src: &mut impl Buf, info: &TypeInfo) -> Result<(), ProtocolError> {
    read_value(src, info).map(|_| ())
}

/// Write one framed value.
///
/// The caller supplies the already-encoded value bytes; this only adds the
/// length prefix (or PLP chunking) required by the type.
pub fn write_value(
    dst: &mut impl BufMut,
    info: &TypeInfo,
    value: Option<&[u8]>,
) -> Result<(), ProtocolError> {
    match info.value_len() {
        ValueLen::Fixed(n) => match value {
            Some(data) if data.len() == n => dst.put_slice(data),
            Some(data) => {
                return Err(ProtocolError::InvalidLength {
                    context: "fixed-length value",
                    length: data.len(),
                });
            }
            None => {
                return Err(ProtocolError::UnsupportedFeature(format!(
                    "NULL for fixed-length type 0x{:02X}",
                    info.type_id as u8
                )));
            }
        },
        ValueLen::Byte => match value {
            None if is_legacy_charbin(info.type_id) => dst.put_u8(CHARBIN_NULL),
            None => dst.put_u8(0),
            Some(data) => {
                let len = u8::try_from(data.len()).map_err(|_| ProtocolError::InvalidLength {
                    context: "byte-length value",
                    length: data.len(),
                })?;
                dst.put_u8(len);
                dst.put_slice(data);
            }
        },
        ValueLen::UShort => match value {
            None => dst.put_u16_le(USHORT_NULL),
            Some(data) => {
                let len = u16::try_from(data.len())
                    .ok()
                    .filter(|&l| l != USHORT_NULL)
                    .ok_or(ProtocolError::InvalidLength {
                        context: "ushort-length value",
                        length: data.len(),
                    })?;
                dst.put_u16_le(len);
                dst.put_slice(data);
            }
        },
        ValueLen::Long => match value {
            None => dst.put_u32_le(0),
            Some(data) => {
                dst.put_u32_le(data.len() as u32);
                dst.put_slice(data);
            }
        },
        ValueLen::TextPtr => match value {
            None => dst.put_u8(0),
            Some(data) => {
                dst.put_u8(TEXT_PTR_LEN as u8);
                dst.put_bytes(0xFF, TEXT_PTR_LEN);
                dst.put_bytes(0, 8);
                dst.put_u32_le(data.len() as u32);
                dst.put_slice(data);
            }
        },
        ValueLen::Plp => encode_plp(dst, value),
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn test_intn_null_and_value() {
        let info = TypeInfo::new(TypeId::IntN).with_max_length(4);
        let raw = [0x00, 0x04, 0x2A, 0x00, 0x00, 0x00];
        let mut src = &raw[..];
        assert_eq!(read_value(&mut src, &info).unwrap(), None);
        assert_eq!(
            read_value(&mut src, &info).unwrap().unwrap().as_ref(),
            &[0x2A, 0, 0, 0]
        );
        assert!(src.is_empty());
    }

    #[test]
    fn test_nvarchar_null_vs_empty() {
        let info = TypeInfo::new(TypeId::NVarChar).with_max_length(20);
        let raw = [0xFF, 0xFF, 0x00, 0x00];
        let mut src = &raw[..];
        assert_eq!(read_value(&mut src, &info).unwrap(), None);
        assert_eq!(read_value(&mut src, &info).unwrap(), Some(Bytes::new()));
    }

    #[test]
    fn test_max_type_uses_plp() {
        let info = TypeInfo::new(TypeId::NVarChar).with_max_length(0xFFFF);
        let mut buf = BytesMut::new();
        write_value(&mut buf, &info, Some(b"h\0i\0")).unwrap();
        assert_eq!(buf.len(), 8 + 4 + 4 + 4);
        let value = read_value(&mut buf.freeze(), &info).unwrap().unwrap();
        assert_eq!(value.as_ref(), b"h\0i\0");
    }

    #[test]
    fn test_fixed_rejects_wrong_size() {
        let info = TypeInfo::new(TypeId::Int4);
        let mut buf = BytesMut::new();
        assert!(write_value(&mut buf, &info, Some(&[1, 2])).is_err());
        assert!(write_value(&mut buf, &info, None).is_err());
    }

    #[test]
    fn test_text_pointer_framing() {
        let info = TypeInfo::new(TypeId::Text).with_max_length(0x7FFF_FFFF);
        let mut buf = BytesMut::new();
        write_value(&mut buf, &info, Some(b"abc")).unwrap();
        write_value(&mut buf, &info, None).unwrap();
        let mut src = buf.freeze();
        assert_eq!(
            read_value(&mut src, &info).unwrap().unwrap().as_ref(),
            b"abc"
        );
        assert_eq!(read_value(&mut src, &info).unwrap(), None);
    }

    #[test]
    fn test_truncated_value_is_eof() {
        let info = TypeInfo::new(TypeId::BigVarBinary).with_max_length(100);
        let raw = [0x05, 0x00, 1, 2];
        assert_eq!(
            read_value(&mut &raw[..], &info),
            Err(ProtocolError::UnexpectedEof)
        );
    }
}
