//! The VECTOR type.
//!
//! ## Wire Format
//!
//! ```text
//! 0xA9 | 0x01 | dimensions (u16 LE) | element type | 0x00 0x00 0x00
//! dimensions x f32 LE (element type 0x00) or f16 LE (element type 0x01)
//! ```
//!
//! When the server cannot take the binary form the same values travel as a
//! JSON array inside an NVARCHAR parameter. NaN becomes `null` there; the
//! infinities have no JSON spelling and are rejected.
//!
//! Half precision is converted with round-to-nearest-even, keeping signed
//! zeros and producing subnormals where needed.

use std::fmt;
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::RwLock;
use tds_protocol::types::VECTOR_HEADER_SIZE;

use crate::error::TypeError;

/// First header byte.
pub const VECTOR_MAGIC: u8 = 0xA9;

/// Second header byte.
pub const VECTOR_VERSION: u8 = 0x01;

/// Maximum float32 dimensions: (8000 - 8) / 4.
pub const MAX_DIMENSIONS_FLOAT32: usize = 1998;

/// Maximum float16 dimensions: (8000 - 8) / 2.
pub const MAX_DIMENSIONS_FLOAT16: usize = 3996;

/// Element precision of a vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum VectorElementType {
    /// IEEE-754 single precision, 4 bytes per element.
    #[default]
    Float32 = 0x00,
    /// IEEE-754 half precision, 2 bytes per element.
    Float16 = 0x01,
}

impl VectorElementType {
    /// Parse the header / TYPE_INFO scale byte.
    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(Self::Float32),
            0x01 => Some(Self::Float16),
            _ => None,
        }
    }

    /// Bytes per element on the wire.
    #[must_use]
    pub const fn bytes_per_element(self) -> usize {
        match self {
            Self::Float32 => 4,
            Self::Float16 => 2,
        }
    }

    /// Largest dimension count the binary form can carry.
    #[must_use]
    pub const fn max_dimensions(self) -> usize {
        match self {
            Self::Float32 => MAX_DIMENSIONS_FLOAT32,
            Self::Float16 => MAX_DIMENSIONS_FLOAT16,
        }
    }

    /// Upper-case name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Float32 => "FLOAT32",
            Self::Float16 => "FLOAT16",
        }
    }
}

impl fmt::Display for VectorElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A VECTOR value. A NULL vector is `Option::<Vector>::None`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Vector {
    element_type: VectorElementType,
    values: Vec<f32>,
}

fn check_dimensions(element_type: VectorElementType, len: usize) -> Result<(), TypeError> {
    if len > element_type.max_dimensions() {
        return Err(TypeError::TooManyDimensions {
            dimensions: len,
            max: element_type.max_dimensions(),
            element_type: element_type.name(),
        });
    }
    Ok(())
}

impl Vector {
    /// A float32 vector.
    pub fn new(values: Vec<f32>) -> Result<Self, TypeError> {
        Self::with_element_type(VectorElementType::Float32, values)
    }

    /// A vector with an explicit element type.
    pub fn with_element_type(
        element_type: VectorElementType,
        values: Vec<f32>,
    ) -> Result<Self, TypeError> {
        check_dimensions(element_type, values.len())?;
        Ok(Self {
            element_type,
            values,
        })
    }

    /// A float32 vector narrowed from `f64`.
    ///
    /// The first element that does not survive the narrowing is reported to
    /// the precision-loss handler, if one is installed.
    pub fn from_f64(values: &[f64]) -> Result<Self, TypeError> {
        check_dimensions(VectorElementType::Float32, values.len())?;
        let narrowed: Vec<f32> = values.iter().map(|&v| v as f32).collect();
        if let Some(handler) = PRECISION_LOSS_HANDLER.read().clone() {
            let lossy = values
                .iter()
                .zip(&narrowed)
                .position(|(&orig, &conv)| !orig.is_nan() && f64::from(conv) != orig);
            if let Some(index) = lossy {
                handler(index, values[index], narrowed[index]);
            }
        }
        Ok(Self {
            element_type: VectorElementType::Float32,
            values: narrowed,
        })
    }

    /// Element type.
    #[must_use]
    pub fn element_type(&self) -> VectorElementType {
        self.element_type
    }

    /// Number of elements.
    #[must_use]
    pub fn dimensions(&self) -> usize {
        self.values.len()
    }

    /// Element values.
    #[must_use]
    pub fn values(&self) -> &[f32] {
        &self.values
    }

    /// Element values widened to `f64`.
    #[must_use]
    pub fn to_f64(&self) -> Vec<f64> {
        self.values.iter().map(|&v| f64::from(v)).collect()
    }

    /// Size of the binary form.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        VECTOR_HEADER_SIZE + self.values.len() * self.element_type.bytes_per_element()
    }

    /// Encode the binary form.
    pub fn encode(&self) -> Result<Bytes, TypeError> {
        check_dimensions(self.element_type, self.values.len())?;
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        buf.put_u8(VECTOR_MAGIC);
        buf.put_u8(VECTOR_VERSION);
        buf.put_u16_le(self.values.len() as u16);
        buf.put_u8(self.element_type as u8);
        buf.put_slice(&[0, 0, 0]);
        match self.element_type {
            VectorElementType::Float32 => {
                for v in &self.values {
                    buf.put_u32_le(v.to_bits());
                }
            }
            VectorElementType::Float16 => {
                for v in &self.values {
                    buf.put_u16_le(f32_to_f16(*v));
                }
            }
        }
        Ok(buf.freeze())
    }

    /// Decode the binary form. An absent buffer is a NULL vector.
    pub fn decode(data: Option<&[u8]>) -> Result<Option<Self>, TypeError> {
        let Some(data) = data else {
            return Ok(None);
        };
        if data.len() < VECTOR_HEADER_SIZE {
            return Err(TypeError::VectorTruncated(data.len()));
        }
        if data[0] != VECTOR_MAGIC {
            return Err(TypeError::InvalidVectorMagic(data[0]));
        }
        if data[1] != VECTOR_VERSION {
            return Err(TypeError::InvalidVectorVersion(data[1]));
        }
        let dimensions = usize::from(u16::from_le_bytes([data[2], data[3]]));
        let element_type = VectorElementType::from_u8(data[4])
            .ok_or(TypeError::InvalidVectorElementType(data[4]))?;

        let width = element_type.bytes_per_element();
        let expected = VECTOR_HEADER_SIZE + dimensions * width;
        if data.len() < expected {
            return Err(TypeError::VectorSizeMismatch {
                expected,
                actual: data.len(),
            });
        }

        let payload = &data[VECTOR_HEADER_SIZE..expected];
        let values = match element_type {
            VectorElementType::Float32 => payload
                .chunks_exact(4)
                .map(|c| f32::from_bits(u32::from_le_bytes([c[0], c[1], c[2], c[3]])))
                .collect(),
            VectorElementType::Float16 => payload
                .chunks_exact(2)
                .map(|c| f16_to_f32(u16::from_le_bytes([c[0], c[1]])))
                .collect(),
        };
        Ok(Some(Self {
            element_type,
            values,
        }))
    }

    /// JSON array text, e.g. `[1, 2.5, null]`.
    pub fn to_json(&self) -> Result<String, TypeError> {
        let mut out = String::with_capacity(self.values.len() * 12 + 2);
        out.push('[');
        for (index, v) in self.values.iter().enumerate() {
            if index > 0 {
                out.push_str(", ");
            }
            if v.is_nan() {
                out.push_str("null");
            } else if v.is_infinite() {
                return Err(TypeError::NonFiniteJson { index });
            } else {
                out.push_str(&v.to_string());
            }
        }
        out.push(']');
        Ok(out)
    }

    /// Parse JSON array text into a float32 vector; `null` elements become NaN.
    pub fn from_json(text: &str) -> Result<Self, TypeError> {
        let parsed: serde_json::Value =
            serde_json::from_str(text.trim()).map_err(|e| TypeError::InvalidJson(e.to_string()))?;
        let items = parsed
            .as_array()
            .ok_or_else(|| TypeError::InvalidJson("vector JSON must be an array".into()))?;
        let values = items
            .iter()
            .map(|item| match item {
                serde_json::Value::Null => Ok(f32::NAN),
                serde_json::Value::Number(n) => n
                    .as_f64()
                    .map(|f| f as f32)
                    .ok_or_else(|| TypeError::InvalidJson(format!("bad number {n}"))),
                other => Err(TypeError::InvalidJson(format!(
                    "vector element must be a number, got {other}"
                ))),
            })
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(values)
    }
}

impl fmt::Display for Vector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VECTOR({}, {}) : [", self.element_type, self.values.len())?;
        for (i, v) in self.values.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{v}")?;
        }
        f.write_str("]")
    }
}

/// Convert to IEEE-754 half precision bits.
#[must_use]
pub fn f32_to_f16(value: f32) -> u16 {
    let bits = value.to_bits();
    let sign = ((bits >> 16) & 0x8000) as u16;
    let exponent = ((bits >> 23) & 0xFF) as i32;
    let mantissa = bits & 0x7F_FFFF;

    if exponent == 0xFF {
        return if mantissa != 0 {
            sign | 0x7E00
        } else {
            sign | 0x7C00
        };
    }
    if bits & 0x7FFF_FFFF == 0 {
        return sign;
    }

    let mut half_exponent = exponent - 127 + 15;
    if half_exponent >= 31 {
        return sign | 0x7C00;
    }

    if half_exponent <= 0 {
        if half_exponent < -10 {
            return sign;
        }
        let full = mantissa | 0x80_0000;
        let shift = (1 - half_exponent) as u32;
        let mut mant = full >> (shift + 13);
        let round_bit = (full >> (shift + 12)) & 1;
        let lost = full & ((1 << (shift + 12)) - 1);
        if round_bit == 1 && (lost != 0 || mant & 1 == 1) {
            mant += 1;
        }
        return sign | mant as u16;
    }

    let mut mant = mantissa >> 13;
    let round_bit = (mantissa >> 12) & 1;
    let lost = mantissa & 0xFFF;
    if round_bit == 1 && (lost != 0 || mant & 1 == 1) {
        mant += 1;
        if mant == 0x400 {
            mant = 0;
            half_exponent += 1;
            if half_exponent >= 31 {
                return sign | 0x7C00;
            }
        }
    }
    sign | ((half_exponent as u16) << 10) | mant as u16
}

/// Convert IEEE-754 half precision bits to `f32`.
#[must_use]
pub fn f16_to_f32(value: u16) -> f32 {
    let sign = u32::from(value >> 15) << 31;
    let mut exponent = i32::from((value >> 10) & 0x1F);
    let mut mantissa = u32::from(value & 0x3FF);

    if exponent == 31 {
        if mantissa != 0 {
            return f32::NAN;
        }
        return f32::from_bits(sign | 0x7F80_0000);
    }

    if exponent == 0 {
        if mantissa == 0 {
            return f32::from_bits(sign);
        }
        while mantissa & 0x400 == 0 {
            mantissa <<= 1;
            exponent -= 1;
        }
        mantissa &= 0x3FF;
        exponent += 1;
    }

    let exponent = (exponent + (127 - 15)) as u32;
    f32::from_bits(sign | (exponent << 23) | (mantissa << 13))
}

/// Callback receiving `(index, original, narrowed)` for the first lossy element.
pub type PrecisionLossHandler = Arc<dyn Fn(usize, f64, f32) + Send + Sync>;

static PRECISION_LOSS_HANDLER: RwLock<Option<PrecisionLossHandler>> =
    parking_lot::const_rwlock(None);

/// Install the process-wide precision-loss handler.
pub fn set_precision_loss_handler<F>(handler: F)
where
    F: Fn(usize, f64, f32) + Send + Sync + 'static,
{
    *PRECISION_LOSS_HANDLER.write() = Some(Arc::new(handler));
}

/// Remove the precision-loss handler.
pub fn clear_precision_loss_handler() {
    *PRECISION_LOSS_HANDLER.write() = None;
}

/// Enable or disable a handler that logs precision loss as a warning.
pub fn set_precision_warnings(enabled: bool) {
    if enabled {
        set_precision_loss_handler(|index, original, narrowed| {
            tracing::warn!(
                index,
                original,
                narrowed = f64::from(narrowed),
                "vector element lost precision narrowing to float32"
            );
        });
    } else {
        clear_precision_loss_handler();
    }
}
