//! Partially Length-Prefixed (PLP) value framing.
//!
//! A PLP value starts with an 8-byte total length (or the NULL / unknown
//! markers), followed by any number of chunks each introduced by a 4-byte
//! length, terminated by a zero-length chunk.
//!
//! [`PlpDecoder`] is a pull-based state machine: feed it whatever bytes are
//! available and it reports whether it needs more or has produced the value.
//! This lets the same decoder run over a fully buffered message or over a
//! stream that delivers one packet at a time.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::ProtocolError;

/// Total length marking a NULL PLP value.
pub const PLP_NULL: u64 = 0xFFFF_FFFF_FFFF_FFFF;

/// Total length marking a value of unknown length (chunks follow).
pub const PLP_UNKNOWN_LEN: u64 = 0xFFFF_FFFF_FFFF_FFFE;

/// Chunk size used when encoding PLP values.
pub const PLP_CHUNK_SIZE: usize = 8000;

/// Decoder state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlpState {
    /// Waiting for the 8-byte total length.
    AwaitingTotalLength,
    /// Waiting for the next 4-byte chunk length.
    AwaitingChunkLength,
    /// Copying `remaining` bytes of the current chunk.
    ReadingChunk {
        /// Bytes still to copy from the current chunk.
        remaining: usize,
    },
    /// The value has been fully decoded.
    Done,
}

/// Result of advancing a [`PlpDecoder`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlpProgress {
    /// More input is required.
    NeedMore,
    /// The value is complete; `None` is SQL NULL.
    Complete(Option<Bytes>),
}

/// Incremental PLP decoder.
#[derive(Debug)]
pub struct PlpDecoder {
    state: PlpState,
    declared: Option<u64>,
    data: BytesMut,
    is_null: bool,
    // Length prefix bytes received so far; a prefix may straddle two feeds.
    prefix: [u8; 8],
    prefix_len: usize,
}

impl Default for PlpDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl PlpDecoder {
    /// Create a decoder waiting for the total length.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: PlpState::AwaitingTotalLength,
            declared: None,
            data: BytesMut::new(),
            is_null: false,
            prefix: [0; 8],
            prefix_len: 0,
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> PlpState {
        self.state
    }

    /// Consume as much of `src` as the current value needs.
    ///
    /// Bytes beyond the end of the value are left in `src`.
    pub fn advance(&mut self, src: &mut impl Buf) -> Result<PlpProgress, ProtocolError> {
        loop {
            match self.state {
                PlpState::AwaitingTotalLength => {
                    let Some(total) = self.take_prefix::<8>(src) else {
                        return Ok(PlpProgress::NeedMore);
                    };
                    let total = u64::from_le_bytes(total);
                    if total == PLP_NULL {
                        self.is_null = true;
                        self.state = PlpState::Done;
                        continue;
                    }
                    if total != PLP_UNKNOWN_LEN {
                        let capacity = usize::try_from(total).map_err(|_| {
                            ProtocolError::InvalidLength {
                                context: "PLP total length",
                                length: usize::MAX,
                            }
                        })?;
                        self.declared = Some(total);
                        self.data.reserve(capacity.min(1 << 20));
                    }
                    self.state = PlpState::AwaitingChunkLength;
                }
                PlpState::AwaitingChunkLength => {
                    let Some(len) = self.take_prefix::<4>(src) else {
                        return Ok(PlpProgress::NeedMore);
                    };
                    let len = u32::from_le_bytes(len) as usize;
                    if len == 0 {
                        if let Some(declared) = self.declared {
                            if declared != self.data.len() as u64 {
                                return Err(ProtocolError::InvalidLength {
                                    context: "PLP value",
                                    length: self.data.len(),
                                });
                            }
                        }
                        self.state = PlpState::Done;
                    } else {
                        self.state = PlpState::ReadingChunk { remaining: len };
                    }
                }
                PlpState::ReadingChunk { remaining } => {
                    let available = src.remaining().min(remaining);
                    if available == 0 {
                        return Ok(PlpProgress::NeedMore);
                    }
                    let chunk = src.copy_to_bytes(available);
                    self.data.extend_from_slice(&chunk);
                    let left = remaining - available;
                    self.state = if left == 0 {
                        PlpState::AwaitingChunkLength
                    } else {
                        PlpState::ReadingChunk { remaining: left }
                    };
                }
                PlpState::Done => {
                    let value = if self.is_null {
                        None
                    } else {
                        Some(std::mem::take(&mut self.data).freeze())
                    };
                    return Ok(PlpProgress::Complete(value));
                }
            }
        }
    }

    /// Accumulate an `N`-byte length prefix, returning it once complete.
    fn take_prefix<const N: usize>(&mut self, src: &mut impl Buf) -> Option<[u8; N]> {
        let wanted = (N - self.prefix_len).min(src.remaining());
        src.copy_to_slice(&mut self.prefix[self.prefix_len..self.prefix_len + wanted]);
        self.prefix_len += wanted;
        if self.prefix_len < N {
            return None;
        }
        self.prefix_len = 0;
        let mut out = [0; N];
        out.copy_from_slice(&self.prefix[..N]);
        Some(out)
    }
}

/// Decode a complete PLP value from a fully buffered source.
///
/// Running out of bytes before the terminator is an [`ProtocolError::UnexpectedEof`].
pub fn decode_plp(src: &mut impl Buf) -> Result<Option<Bytes>, ProtocolError> {
    match PlpDecoder::new().advance(src)? {
        PlpProgress::Complete(value) => Ok(value),
        PlpProgress::NeedMore => Err(ProtocolError::UnexpectedEof),
    }
}

/// Skip over a PLP value without retaining it.
pub fn skip_plp(src: &mut impl Buf) -> Result<(), ProtocolError> {
    decode_plp(src).map(|_| ())
}

/// Encode a PLP value with a known total length, split into chunks.
pub fn encode_plp(dst: &mut impl BufMut, value: Option<&[u8]>) {
    match value {
        None => dst.put_u64_le(PLP_NULL),
        Some(data) => {
            dst.put_u64_le(data.len() as u64);
            for chunk in data.chunks(PLP_CHUNK_SIZE) {
                dst.put_u32_le(chunk.len() as u32);
                dst.put_slice(chunk);
            }
            dst.put_u32_le(0);
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn chunked(total: u64, chunks: &[&[u8]]) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&total.to_le_bytes());
        for c in chunks {
            buf.extend_from_slice(&(c.len() as u32).to_le_bytes());
            buf.extend_from_slice(c);
        }
        buf.extend_from_slice(&0u32.to_le_bytes());
        buf
    }

    #[test]
    fn test_null_distinct_from_empty() {
        let null = PLP_NULL.to_le_bytes();
        assert_eq!(decode_plp(&mut &null[..]).unwrap(), None);

        let empty = chunked(0, &[]);
        assert_eq!(decode_plp(&mut &empty[..]).unwrap(), Some(Bytes::new()));
    }

    #[test]
    fn test_many_chunks_unknown_length() {
        let raw = chunked(PLP_UNKNOWN_LEN, &[b"ab", b"c", b"defg", b"h"]);
        let value = decode_plp(&mut &raw[..]).unwrap().unwrap();
        assert_eq!(&value[..], b"abcdefgh");
    }

    #[test]
    fn test_declared_length_mismatch() {
        let raw = chunked(5, &[b"abc"]);
        assert!(matches!(
            decode_plp(&mut &raw[..]),
            Err(ProtocolError::InvalidLength { .. })
        ));
    }

    #[test]
    fn test_truncated_is_eof() {
        let raw = chunked(4, &[b"abcd"]);
        let truncated = &raw[..raw.len() - 3];
        assert_eq!(
            decode_plp(&mut &truncated[..]),
            Err(ProtocolError::UnexpectedEof)
        );
    }

    #[test]
    fn test_incremental_feed() {
        let raw = chunked(6, &[b"abc", b"def"]);
        let mut decoder = PlpDecoder::new();
        let mut result = None;
        for byte in &raw {
            let mut one = &[*byte][..];
            if let PlpProgress::Complete(v) = decoder.advance(&mut one).unwrap() {
                result = Some(v);
            }
        }
        assert_eq!(result.unwrap().unwrap(), Bytes::from_static(b"abcdef"));
        assert_eq!(decoder.state(), PlpState::Done);
    }

    #[test]
    fn test_length_prefix_split_across_feeds() {
        let raw = chunked(3, &[b"xyz"]);
        let mut decoder = PlpDecoder::new();

        let mut first = &raw[..4];
        assert_eq!(decoder.advance(&mut first).unwrap(), PlpProgress::NeedMore);
        assert!(first.is_empty());
        assert_eq!(decoder.state(), PlpState::AwaitingTotalLength);

        let mut second = &raw[4..10];
        assert_eq!(decoder.advance(&mut second).unwrap(), PlpProgress::NeedMore);
        assert_eq!(decoder.state(), PlpState::AwaitingChunkLength);

        let mut rest = &raw[10..];
        assert_eq!(
            decoder.advance(&mut rest).unwrap(),
            PlpProgress::Complete(Some(Bytes::from_static(b"xyz")))
        );
    }

    #[test]
    fn test_trailing_bytes_left_in_source() {
        let mut raw = chunked(2, &[b"xy"]);
        raw.push(0xFD);
        let mut src = &raw[..];
        decode_plp(&mut src).unwrap();
        assert_eq!(src, &[0xFD]);
    }

    #[test]
    fn test_encode_splits_chunks() {
        let data = vec![7u8; PLP_CHUNK_SIZE + 10];
        let mut buf = BytesMut::new();
        encode_plp(&mut buf, Some(&data));
        assert_eq!(buf.len(), 8 + 4 + PLP_CHUNK_SIZE + 4 + 10 + 4);
        assert_eq!(decode_plp(&mut buf.freeze()).unwrap().unwrap().len(), data.len());
    }
}
