//! MONEY and SMALLMONEY.
//!
//! Both are integers scaled by 10^4. MONEY is not written as a single
//! little-endian `i64`: the high 32-bit word comes first, then the low word,
//! each little-endian. SMALLMONEY is a plain little-endian `i32`.

use std::fmt;
use std::str::FromStr;

use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;

use crate::error::{TypeError, expect_len};

/// Implicit scale of MONEY and SMALLMONEY.
pub const MONEY_SCALE: u32 = 4;

const MONEY_FACTOR: i64 = 10_000;

/// A MONEY amount backed by a decimal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Money(pub Decimal);

impl Money {
    /// Wrap a decimal amount.
    #[must_use]
    pub fn new(amount: Decimal) -> Self {
        Self(amount)
    }

    /// Build from the scaled integer carried on the wire.
    #[must_use]
    pub fn from_scaled(scaled: i64) -> Self {
        Self(Decimal::new(scaled, MONEY_SCALE))
    }

    /// The decimal amount.
    #[must_use]
    pub fn amount(&self) -> Decimal {
        self.0
    }

    /// Scaled integer; digits beyond the fourth decimal place are truncated.
    pub fn to_scaled(&self) -> Result<i64, TypeError> {
        let out_of_range = TypeError::OutOfRange {
            target_type: "MONEY",
        };
        self.0
            .checked_mul(Decimal::from(MONEY_FACTOR))
            .and_then(|scaled| scaled.trunc().to_i64())
            .ok_or(out_of_range)
    }

    /// Scaled integer that fits SMALLMONEY.
    pub fn to_small_scaled(&self) -> Result<i32, TypeError> {
        i32::try_from(self.to_scaled()?).map_err(|_| TypeError::OutOfRange {
            target_type: "SMALLMONEY",
        })
    }
}

impl FromStr for Money {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Decimal::from_str(s.trim())
            .map(Self)
            .map_err(|_| TypeError::InvalidMoney(s.to_owned()))
    }
}

impl From<Decimal> for Money {
    fn from(value: Decimal) -> Self {
        Self(value)
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Encode a scaled MONEY value: high word, then low word.
#[must_use]
pub fn encode_money(scaled: i64) -> [u8; 8] {
    let high = ((scaled >> 32) as u32).to_le_bytes();
    let low = (scaled as u32).to_le_bytes();
    [
        high[0], high[1], high[2], high[3], low[0], low[1], low[2], low[3],
    ]
}

/// Decode a MONEY value into its scaled integer.
pub fn decode_money(data: &[u8]) -> Result<i64, TypeError> {
    expect_len(data, 8)?;
    let high = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
    let low = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);
    Ok(((u64::from(high) << 32) | u64::from(low)) as i64)
}

/// Encode a scaled SMALLMONEY value.
#[must_use]
pub fn encode_small_money(scaled: i32) -> [u8; 4] {
    scaled.to_le_bytes()
}

/// Decode a SMALLMONEY value into its scaled integer.
pub fn decode_small_money(data: &[u8]) -> Result<i32, TypeError> {
    expect_len(data, 4)?;
    Ok(i32::from_le_bytes([data[0], data[1], data[2], data[3]]))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_word_order() {
        // 0x0000_0001_0000_0002 -> high word 1, low word 2
        assert_eq!(
            encode_money(0x0000_0001_0000_0002),
            [1, 0, 0, 0, 2, 0, 0, 0]
        );
        assert_eq!(encode_money(-1), [0xFF; 8]);
    }

    #[test]
    fn test_parse_negative_string() {
        let money: Money = "-882342757768.9998".parse().unwrap();
        assert_eq!(money.to_scaled().unwrap(), -8_823_427_577_689_998);
        let wire = encode_money(money.to_scaled().unwrap());
        assert_eq!(decode_money(&wire).unwrap(), -8_823_427_577_689_998);
        assert_eq!(
            Money::from_scaled(-8_823_427_577_689_998).to_string(),
            "-882342757768.9998"
        );
    }

    #[test]
    fn test_truncates_extra_digits() {
        let money: Money = "1.23459".parse().unwrap();
        assert_eq!(money.to_scaled().unwrap(), 12_345);
    }

    #[test]
    fn test_invalid_inputs() {
        assert!(matches!(
            "bulk".parse::<Money>(),
            Err(TypeError::InvalidMoney(_))
        ));
        assert!(decode_money(&[0; 7]).is_err());
        let too_big = Money::new(Decimal::MAX);
        assert!(too_big.to_scaled().is_err());
        assert!(Money::from_scaled(i64::from(i32::MAX) + 1).to_small_scaled().is_err());
    }

    #[test]
    fn test_small_money() {
        assert_eq!(encode_small_money(-10_000), (-10_000i32).to_le_bytes());
        assert_eq!(decode_small_money(&encode_small_money(214_748)).unwrap(), 214_748);
    }

    proptest! {
        #[test]
        fn prop_money_roundtrip(scaled in any::<i64>()) {
            prop_assert_eq!(decode_money(&encode_money(scaled)).unwrap(), scaled);
        }

        #[test]
        fn prop_money_decimal_roundtrip(scaled in any::<i64>()) {
            let money = Money::from_scaled(scaled);
            prop_assert_eq!(money.to_scaled().unwrap(), scaled);
        }
    }
}
