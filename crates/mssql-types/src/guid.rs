//! UNIQUEIDENTIFIER byte order.
//!
//! The first three groups of a GUID travel little-endian, the last eight
//! bytes as-is. The swap is its own inverse.

use uuid::Uuid;

use crate::error::TypeError;

fn swap(bytes: &[u8; 16]) -> [u8; 16] {
    let mut out = *bytes;
    out[..4].reverse();
    out[4..6].reverse();
    out[6..8].reverse();
    out
}

/// Convert a UUID to its wire bytes.
#[must_use]
pub fn to_wire(value: &Uuid) -> [u8; 16] {
    swap(value.as_bytes())
}

/// Convert wire bytes to a UUID.
pub fn from_wire(data: &[u8]) -> Result<Uuid, TypeError> {
    let bytes: &[u8; 16] = data
        .try_into()
        .map_err(|_| TypeError::InvalidUuid(format!("expected 16 bytes, got {}", data.len())))?;
    Ok(Uuid::from_bytes(swap(bytes)))
}
