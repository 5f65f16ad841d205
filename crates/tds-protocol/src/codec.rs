//! Low-level read/write helpers shared by every wire structure.
//!
//! All readers are bounds-checked and return [`ProtocolError`] instead of
//! panicking when the buffer is short.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::ProtocolError;

/// Fail with `UnexpectedEof` unless `src` holds at least `needed` bytes.
#[inline]
pub fn ensure(src: &impl Buf, needed: usize) -> Result<(), ProtocolError> {
    if src.remaining() < needed {
        Err(ProtocolError::UnexpectedEof)
    } else {
        Ok(())
    }
}

/// Read a UTF-16LE string prefixed by a 1-byte character count.
pub fn read_b_varchar(src: &mut impl Buf) -> Result<String, ProtocolError> {
    ensure(src, 1)?;
    let len = usize::from(src.get_u8());
    read_utf16_string(src, len)
}

/// Read a UTF-16LE string prefixed by a 2-byte character count.
pub fn read_us_varchar(src: &mut impl Buf) -> Result<String, ProtocolError> {
    ensure(src, 2)?;
    let len = usize::from(src.get_u16_le());
    read_utf16_string(src, len)
}

/// Read `char_count` UTF-16LE code units.
pub fn read_utf16_string(src: &mut impl Buf, char_count: usize) -> Result<String, ProtocolError> {
    ensure(src, char_count * 2)?;
    let units: Vec<u16> = (0..char_count).map(|_| src.get_u16_le()).collect();
    String::from_utf16(&units)
        .map_err(|_| ProtocolError::StringEncoding("invalid UTF-16 sequence".into()))
}

/// Decode a whole byte slice as UTF-16LE.
pub fn decode_utf16_bytes(bytes: &[u8]) -> Result<String, ProtocolError> {
    if bytes.len() % 2 != 0 {
        return Err(ProtocolError::InvalidLength {
            context: "UTF-16 string",
            length: bytes.len(),
        });
    }
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    String::from_utf16(&units)
        .map_err(|_| ProtocolError::StringEncoding("invalid UTF-16 sequence".into()))
}

/// Encode a string as UTF-16LE bytes.
#[must_use]
pub fn encode_utf16(s: &str) -> Bytes {
    let mut buf = BytesMut::with_capacity(s.len() * 2);
    write_utf16_string(&mut buf, s);
    buf.freeze()
}

/// Write a UTF-16LE string prefixed by a 1-byte character count (truncating at 255).
pub fn write_b_varchar(dst: &mut impl BufMut, s: &str) {
    let units: Vec<u16> = s.encode_utf16().take(usize::from(u8::MAX)).collect();
    dst.put_u8(units.len() as u8);
    units.iter().for_each(|&u| dst.put_u16_le(u));
}

/// Write a UTF-16LE string prefixed by a 2-byte character count (truncating at 65535).
pub fn write_us_varchar(dst: &mut impl BufMut, s: &str) {
    let units: Vec<u16> = s.encode_utf16().take(usize::from(u16::MAX)).collect();
    dst.put_u16_le(units.len() as u16);
    units.iter().for_each(|&u| dst.put_u16_le(u));
}

/// Write a UTF-16LE string without length prefix.
pub fn write_utf16_string(dst: &mut impl BufMut, s: &str) {
    for unit in s.encode_utf16() {
        dst.put_u16_le(unit);
    }
}

/// Number of bytes `s` occupies once encoded as UTF-16.
#[must_use]
pub fn utf16_byte_len(s: &str) -> usize {
    s.encode_utf16().count() * 2
}
