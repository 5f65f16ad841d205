//! Date and time wire formats.
//!
//! DATETIME counts days since 1900-01-01 and time of day in 1/300 second
//! ticks. Rounding a time to the nearest tick can produce a full day of
//! ticks; that carries into the day count. DATE, TIME, DATETIME2 and
//! DATETIMEOFFSET use days since 0001-01-01 and 10^-scale second units.

use chrono::{
    DateTime, Duration, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, Offset, TimeZone,
    Timelike,
};

use crate::error::{TypeError, expect_len};

/// DATETIME ticks per second.
pub const TICKS_PER_SECOND: u32 = 300;

/// DATETIME ticks per day.
pub const TICKS_PER_DAY: u32 = TICKS_PER_SECOND * 86_400;

/// Highest fractional-seconds scale.
pub const MAX_TIME_SCALE: u8 = 7;

fn date(y: i32, m: u32, d: u32) -> Result<NaiveDate, TypeError> {
    NaiveDate::from_ymd_opt(y, m, d)
        .ok_or_else(|| TypeError::InvalidDateTime(format!("{y:04}-{m:02}-{d:02}")))
}

fn epoch_1900() -> Result<NaiveDate, TypeError> {
    date(1900, 1, 1)
}

fn epoch_0001() -> Result<NaiveDate, TypeError> {
    date(1, 1, 1)
}

fn add_days(base: NaiveDate, days: i64) -> Result<NaiveDate, TypeError> {
    base.checked_add_signed(Duration::days(days))
        .ok_or_else(|| TypeError::InvalidDateTime(format!("day offset {days} out of range")))
}

/// Round nanoseconds to the nearest 1/300 second, halves away from zero.
#[must_use]
pub fn nanos_to_ticks(nanos: u32) -> u32 {
    ((u64::from(nanos) * 3 + 5_000_000) / 10_000_000) as u32
}

/// Encode a DATETIME value.
///
/// Values that round up past 9999-12-31 23:59:59.997 are clamped to it.
pub fn encode_datetime(value: NaiveDateTime) -> Result<[u8; 8], TypeError> {
    let epoch = epoch_1900()?;
    let min = date(1753, 1, 1)?;
    let max = date(9999, 12, 31)?;
    if value.date() < min {
        return Err(TypeError::OutOfRange {
            target_type: "DATETIME",
        });
    }

    let mut days = (value.date() - epoch).num_days();
    let mut ticks = value.num_seconds_from_midnight() * TICKS_PER_SECOND
        + nanos_to_ticks(value.nanosecond().min(999_999_999));
    if ticks >= TICKS_PER_DAY {
        ticks -= TICKS_PER_DAY;
        days += 1;
    }
    let max_days = (max - epoch).num_days();
    if days > max_days {
        days = max_days;
        ticks = TICKS_PER_DAY - 1;
    }

    let days = i32::try_from(days).map_err(|_| TypeError::OutOfRange {
        target_type: "DATETIME",
    })?;
    let mut out = [0u8; 8];
    out[..4].copy_from_slice(&days.to_le_bytes());
    out[4..].copy_from_slice(&ticks.to_le_bytes());
    Ok(out)
}

/// Decode a DATETIME value; fractional seconds are rounded to milliseconds.
pub fn decode_datetime(data: &[u8]) -> Result<NaiveDateTime, TypeError> {
    expect_len(data, 8)?;
    let days = i32::from_le_bytes([data[0], data[1], data[2], data[3]]);
    let ticks = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);
    if ticks >= TICKS_PER_DAY {
        return Err(TypeError::InvalidDateTime(format!(
            "DATETIME tick count {ticks} exceeds one day"
        )));
    }
    let day = add_days(epoch_1900()?, i64::from(days))?;
    let seconds = ticks / TICKS_PER_SECOND;
    let rem = ticks % TICKS_PER_SECOND;
    let millis = (rem * 20 + 3) / 6;
    let time = NaiveTime::from_num_seconds_from_midnight_opt(seconds, 0)
        .ok_or_else(|| TypeError::InvalidDateTime("DATETIME time of day".into()))?
        + Duration::milliseconds(i64::from(millis));
    // 299 ticks rounds to 997ms, so adding milliseconds never wraps the day
    Ok(day.and_time(time))
}

/// Encode a SMALLDATETIME value, rounding to the nearest minute.
pub fn encode_smalldatetime(value: NaiveDateTime) -> Result<[u8; 4], TypeError> {
    let epoch = epoch_1900()?;
    let mut days = (value.date() - epoch).num_days();
    let seconds = value.num_seconds_from_midnight();
    let mut minutes = seconds / 60;
    // 29.999 seconds and above round up
    if (seconds % 60) * 1000 + value.nanosecond() / 1_000_000 >= 29_999 {
        minutes += 1;
    }
    if minutes >= 1440 {
        minutes -= 1440;
        days += 1;
    }
    let days = u16::try_from(days).map_err(|_| TypeError::OutOfRange {
        target_type: "SMALLDATETIME",
    })?;
    let mut out = [0u8; 4];
    out[..2].copy_from_slice(&days.to_le_bytes());
    out[2..].copy_from_slice(&(minutes as u16).to_le_bytes());
    Ok(out)
}

/// Decode a SMALLDATETIME value.
pub fn decode_smalldatetime(data: &[u8]) -> Result<NaiveDateTime, TypeError> {
    expect_len(data, 4)?;
    let days = u16::from_le_bytes([data[0], data[1]]);
    let minutes = u16::from_le_bytes([data[2], data[3]]);
    let day = add_days(epoch_1900()?, i64::from(days))?;
    let time = NaiveTime::from_num_seconds_from_midnight_opt(u32::from(minutes) * 60, 0)
        .ok_or_else(|| TypeError::InvalidDateTime(format!("{minutes} minutes")))?;
    Ok(day.and_time(time))
}

/// Encode a DATE value (3 bytes).
pub fn encode_date(value: NaiveDate) -> Result<[u8; 3], TypeError> {
    let days = (value - epoch_0001()?).num_days();
    let days = u32::try_from(days).map_err(|_| TypeError::OutOfRange { target_type: "DATE" })?;
    let b = days.to_le_bytes();
    Ok([b[0], b[1], b[2]])
}

/// Decode a DATE value.
pub fn decode_date(data: &[u8]) -> Result<NaiveDate, TypeError> {
    expect_len(data, 3)?;
    let days = u32::from_le_bytes([data[0], data[1], data[2], 0]);
    add_days(epoch_0001()?, i64::from(days))
}

/// Bytes used by a TIME value of the given scale.
#[must_use]
pub fn time_len(scale: u8) -> usize {
    match scale {
        0..=2 => 3,
        3..=4 => 4,
        _ => 5,
    }
}

fn units_per_second(scale: u8) -> u64 {
    10u64.pow(u32::from(scale.min(MAX_TIME_SCALE)))
}

/// Encode a TIME value into `time_len(scale)` bytes, truncating extra precision.
#[must_use]
pub fn encode_time(value: NaiveTime, scale: u8) -> Vec<u8> {
    let nanos = u64::from(value.num_seconds_from_midnight()) * 1_000_000_000
        + u64::from(value.nanosecond().min(999_999_999));
    let units = nanos / (1_000_000_000 / units_per_second(scale));
    units.to_le_bytes()[..time_len(scale)].to_vec()
}

/// Decode a TIME value.
pub fn decode_time(data: &[u8], scale: u8) -> Result<NaiveTime, TypeError> {
    expect_len(data, time_len(scale))?;
    let mut raw = [0u8; 8];
    raw[..data.len()].copy_from_slice(data);
    let units = u64::from_le_bytes(raw);
    let nanos = units * (1_000_000_000 / units_per_second(scale));
    let seconds = u32::try_from(nanos / 1_000_000_000)
        .map_err(|_| TypeError::InvalidDateTime("TIME out of range".into()))?;
    NaiveTime::from_num_seconds_from_midnight_opt(seconds, (nanos % 1_000_000_000) as u32)
        .ok_or_else(|| TypeError::InvalidDateTime(format!("TIME of {units} units")))
}

/// Encode a DATETIME2 value: time, then date.
pub fn encode_datetime2(value: NaiveDateTime, scale: u8) -> Result<Vec<u8>, TypeError> {
    let mut out = encode_time(value.time(), scale);
    out.extend_from_slice(&encode_date(value.date())?);
    Ok(out)
}

/// Decode a DATETIME2 value.
pub fn decode_datetime2(data: &[u8], scale: u8) -> Result<NaiveDateTime, TypeError> {
    let split = time_len(scale);
    expect_len(data, split + 3)?;
    let time = decode_time(&data[..split], scale)?;
    Ok(decode_date(&data[split..])?.and_time(time))
}

/// Encode a DATETIMEOFFSET value: UTC time and date, then offset minutes.
pub fn encode_datetimeoffset(
    value: DateTime<FixedOffset>,
    scale: u8,
) -> Result<Vec<u8>, TypeError> {
    let mut out = encode_datetime2(value.naive_utc(), scale)?;
    let offset_minutes = (value.offset().fix().local_minus_utc() / 60) as i16;
    out.extend_from_slice(&offset_minutes.to_le_bytes());
    Ok(out)
}

/// Decode a DATETIMEOFFSET value.
pub fn decode_datetimeoffset(
    data: &[u8],
    scale: u8,
) -> Result<DateTime<FixedOffset>, TypeError> {
    let split = time_len(scale) + 3;
    expect_len(data, split + 2)?;
    let utc = decode_datetime2(&data[..split], scale)?;
    let minutes = i16::from_le_bytes([data[split], data[split + 1]]);
    let offset = FixedOffset::east_opt(i32::from(minutes) * 60)
        .ok_or_else(|| TypeError::InvalidDateTime(format!("offset of {minutes} minutes")))?;
    Ok(offset.from_utc_datetime(&utc))
}
