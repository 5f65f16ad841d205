//! SQL batch request encoding and the ALL_HEADERS prefix shared by batch,
//! RPC and bulk load requests.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::codec::{decode_utf16_bytes, ensure, write_utf16_string};
use crate::error::ProtocolError;

/// Size of an ALL_HEADERS block carrying only a transaction descriptor.
pub const ALL_HEADERS_LEN: usize = 22;

const TRANSACTION_DESCRIPTOR_HEADER: u16 = 0x0002;

/// Write ALL_HEADERS with a transaction descriptor header.
///
/// `transaction_descriptor` is 0 in auto-commit mode, otherwise the value
/// reported by the BeginTransaction ENVCHANGE.
pub fn write_all_headers(dst: &mut impl BufMut, transaction_descriptor: u64) {
    dst.put_u32_le(ALL_HEADERS_LEN as u32);
    dst.put_u32_le(18);
    dst.put_u16_le(TRANSACTION_DESCRIPTOR_HEADER);
    dst.put_u64_le(transaction_descriptor);
    // outstanding request count; always 1 without MARS
    dst.put_u32_le(1);
}

/// Read ALL_HEADERS, returning the transaction descriptor if one is present.
pub fn read_all_headers(src: &mut impl Buf) -> Result<Option<u64>, ProtocolError> {
    ensure(src, 4)?;
    let total = src.get_u32_le() as usize;
    if total < 4 {
        return Err(ProtocolError::InvalidLength {
            context: "ALL_HEADERS",
            length: total,
        });
    }
    ensure(src, total - 4)?;
    let mut headers = src.copy_to_bytes(total - 4);
    let mut descriptor = None;
    while headers.has_remaining() {
        ensure(&headers, 6)?;
        let len = headers.get_u32_le() as usize;
        let kind = headers.get_u16_le();
        let body_len = len.checked_sub(6).ok_or(ProtocolError::InvalidLength {
            context: "ALL_HEADERS entry",
            length: len,
        })?;
        ensure(&headers, body_len)?;
        let mut body = headers.split_to(body_len);
        if kind == TRANSACTION_DESCRIPTOR_HEADER && body.remaining() >= 8 {
            descriptor = Some(body.get_u64_le());
        }
    }
    Ok(descriptor)
}

/// Encode a SQL batch payload: ALL_HEADERS followed by UTF-16LE text.
#[must_use]
pub fn encode_sql_batch(sql: &str, transaction_descriptor: u64) -> Bytes {
    let mut buf = BytesMut::with_capacity(ALL_HEADERS_LEN + sql.len() * 2);
    write_all_headers(&mut buf, transaction_descriptor);
    write_utf16_string(&mut buf, sql);
    buf.freeze()
}

/// Decode a SQL batch payload into its transaction descriptor and text.
pub fn decode_sql_batch(payload: &[u8]) -> Result<(u64, String), ProtocolError> {
    let mut src = payload;
    let descriptor = read_all_headers(&mut src)?.unwrap_or(0);
    Ok((descriptor, decode_utf16_bytes(src)?))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_all_headers_layout() {
        let payload = encode_sql_batch("SELECT 1", 0x1234_5678_9ABC_DEF0);
        assert_eq!(&payload[0..4], &[22, 0, 0, 0]);
        assert_eq!(&payload[4..8], &[18, 0, 0, 0]);
        assert_eq!(&payload[8..10], &[2, 0]);
        assert_eq!(
            u64::from_le_bytes(payload[10..18].try_into().unwrap()),
            0x1234_5678_9ABC_DEF0
        );
        assert_eq!(&payload[18..22], &[1, 0, 0, 0]);
        assert_eq!(payload.len(), 22 + 16);
    }

    #[test]
    fn test_decode_roundtrip() {
        let payload = encode_sql_batch("select N'é'", 7);
        let (descriptor, sql) = decode_sql_batch(&payload).unwrap();
        assert_eq!(descriptor, 7);
        assert_eq!(sql, "select N'é'");
    }

    #[test]
    fn test_bad_header_length() {
        let raw = [2u8, 0, 0, 0];
        assert!(decode_sql_batch(&raw).is_err());
    }
}
