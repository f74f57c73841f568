//! Packed date/time representations.
//!
//! Wire and storage layouts (MySQL-compatible packing):
//!
//! - `DATETIME` (u64): `year*13+month` in bits 46..63, day in 41..46,
//!   hour in 36..41, minute in 30..36, second in 24..30, microseconds in 0..24.
//! - `DATE` (u32): the top 22 bits of a DATETIME, i.e. `(year*13+month) << 5 | day`.
//! - `TIME` (i32): signed; `hour << 12 | minute << 6 | second`.
//! - `TIMESTAMP` (u32): seconds since the Unix epoch.
//!
//! Conversions between the four always route through `DATETIME`.

use chrono::{Datelike, NaiveDate, NaiveDateTime, Timelike};

/// Format a packed DATETIME as `YYYY-MM-DD HH:MM:SS[.ffffff]`.
pub fn datetime_to_str(datetime: u64) -> String {
    let year_month = (datetime >> 46) & 0x1FFFF;
    let year = year_month / 13;
    let month = year_month % 13;
    let day = (datetime >> 41) & 0x1F;
    let hour = (datetime >> 36) & 0x1F;
    let minute = (datetime >> 30) & 0x3F;
    let second = (datetime >> 24) & 0x3F;
    let microsec = datetime & 0xFF_FFFF;
    if microsec > 0 {
        format!("{year:04}-{month:02}-{day:02} {hour:02}:{minute:02}:{second:02}.{microsec:06}")
    } else {
        format!("{year:04}-{month:02}-{day:02} {hour:02}:{minute:02}:{second:02}")
    }
}

/// Parse `[YY]YY-MM-DD[ HH:MM:SS[.ffffff]]` (any non-digit delimiter) into a
/// packed DATETIME. Returns 0 on malformed input, like the storage layer's
/// zero-datetime convention.
pub fn str_to_datetime(s: &str) -> u64 {
    let s = s.trim();
    let (main, frac) = match s.split_once('.') {
        Some((m, f)) => (m, f),
        None => (s, ""),
    };
    let parts: Vec<u64> = main
        .split(|c: char| !c.is_ascii_digit())
        .filter(|p| !p.is_empty())
        .filter_map(|p| p.parse().ok())
        .collect();
    if parts.len() < 3 {
        return 0;
    }
    let mut year = parts[0];
    let month = parts[1];
    let day = parts[2];
    let hour = parts.get(3).copied().unwrap_or(0);
    let minute = parts.get(4).copied().unwrap_or(0);
    let second = parts.get(5).copied().unwrap_or(0);
    // Two-digit years follow the MySQL pivot.
    if year > 70 && year < 100 {
        year += 1900;
    } else if year < 70 {
        year += 2000;
    }
    if month == 0 || month > 12 || day == 0 || day > 31 {
        return 0;
    }
    if hour > 23 || minute > 59 || second > 59 {
        return 0;
    }
    let microsec: u64 = {
        let digits: String = frac.chars().take(6).filter(|c| c.is_ascii_digit()).collect();
        if digits.is_empty() {
            0
        } else {
            let padded = format!("{digits:0<6}");
            padded.parse().unwrap_or(0)
        }
    };
    pack_datetime(year, month, day, hour, minute, second, microsec)
}

/// Assemble a packed DATETIME from components. Components are not validated.
pub fn pack_datetime(
    year: u64,
    month: u64,
    day: u64,
    hour: u64,
    minute: u64,
    second: u64,
    microsec: u64,
) -> u64 {
    let mut datetime: u64 = 0;
    datetime |= (year * 13 + month) << 46;
    datetime |= day << 41;
    datetime |= hour << 36;
    datetime |= minute << 30;
    datetime |= second << 24;
    datetime |= microsec & 0xFF_FFFF;
    datetime
}

/// DATETIME → Unix timestamp (seconds). Out-of-range dates collapse to 0.
pub fn datetime_to_timestamp(datetime: u64) -> u32 {
    let year_month = (datetime >> 46) & 0x1FFFF;
    let year = (year_month / 13) as i32;
    let month = (year_month % 13) as u32;
    let day = ((datetime >> 41) & 0x1F) as u32;
    let hour = ((datetime >> 36) & 0x1F) as u32;
    let minute = ((datetime >> 30) & 0x3F) as u32;
    let second = ((datetime >> 24) & 0x3F) as u32;
    let Some(date) = NaiveDate::from_ymd_opt(year, month, day) else {
        return 0;
    };
    let Some(dt) = date.and_hms_opt(hour, minute, second) else {
        return 0;
    };
    let ts = dt.and_utc().timestamp();
    if !(0..=u32::MAX as i64).contains(&ts) {
        return 0;
    }
    ts as u32
}

/// Unix timestamp (seconds) → packed DATETIME.
pub fn timestamp_to_datetime(timestamp: u32) -> u64 {
    let Some(dt) = chrono::DateTime::from_timestamp(timestamp as i64, 0) else {
        return 0;
    };
    let dt: NaiveDateTime = dt.naive_utc();
    pack_datetime(
        dt.year() as u64,
        dt.month() as u64,
        dt.day() as u64,
        dt.hour() as u64,
        dt.minute() as u64,
        dt.second() as u64,
        0,
    )
}

/// DATETIME → packed DATE (top 22 bits).
pub fn datetime_to_date(datetime: u64) -> u32 {
    ((datetime >> 41) & 0x3F_FFFF) as u32
}

/// Packed DATE → DATETIME at midnight.
pub fn date_to_datetime(date: u32) -> u64 {
    (date as u64) << 41
}

pub fn date_to_str(date: u32) -> String {
    let year_month = (date >> 5) & 0x1FFFF;
    let year = year_month / 13;
    let month = year_month % 13;
    let day = date & 0x1F;
    format!("{year:04}-{month:02}-{day:02}")
}

pub fn str_to_date(s: &str) -> u32 {
    datetime_to_date(str_to_datetime(s))
}

/// DATETIME → packed TIME (time-of-day component).
pub fn datetime_to_time(datetime: u64) -> i32 {
    let hour = ((datetime >> 36) & 0x1F) as i32;
    let minute = ((datetime >> 30) & 0x3F) as i32;
    let second = ((datetime >> 24) & 0x3F) as i32;
    (hour << 12) | (minute << 6) | second
}

/// Packed TIME → DATETIME on the epoch day. Negative times clamp to zero.
pub fn time_to_datetime(time: i32) -> u64 {
    let t = time.max(0) as u64;
    let hour = (t >> 12) & 0x3FF;
    let minute = (t >> 6) & 0x3F;
    let second = t & 0x3F;
    pack_datetime(1970, 1, 1, hour.min(23), minute, second, 0)
}

pub fn time_to_str(time: i32) -> String {
    let (sign, t) = if time < 0 { ("-", -time) } else { ("", time) };
    let hour = (t >> 12) & 0x3FF;
    let minute = (t >> 6) & 0x3F;
    let second = t & 0x3F;
    format!("{sign}{hour:02}:{minute:02}:{second:02}")
}

/// Parse `[-][D ]HH:MM:SS` into a packed TIME.
pub fn str_to_time(s: &str) -> i32 {
    let s = s.trim();
    let (minus, s) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s),
    };
    let (day, clock) = match s.split_once(' ') {
        Some((d, rest)) => (d.parse::<i32>().unwrap_or(0), rest),
        None => (0, s),
    };
    let parts: Vec<i32> = clock
        .split(':')
        .filter_map(|p| p.split('.').next())
        .filter_map(|p| p.parse().ok())
        .collect();
    let (hour, minute, second) = match parts.as_slice() {
        [h, m, sec] => (*h, *m, *sec),
        [m, sec] => (0, *m, *sec),
        [sec] => (0, 0, *sec),
        _ => return 0,
    };
    if day < 0 || hour < 0 || !(0..=59).contains(&minute) || !(0..=59).contains(&second) {
        return 0;
    }
    let hour = hour + day * 24;
    let mut time = second | (minute << 6) | (hour << 12);
    if minus {
        time = -time;
    }
    time
}

pub fn timestamp_to_str(timestamp: u32) -> String {
    datetime_to_str(timestamp_to_datetime(timestamp))
}

/// Seconds-of-day → packed TIME (used by TIME arithmetic).
pub fn seconds_to_time(seconds: i32) -> i32 {
    let (minus, s) = if seconds < 0 { (true, -seconds) } else { (false, seconds) };
    let sec = s % 60;
    let min = (s / 60) % 60;
    let hour = s / 3600;
    let time = sec | (min << 6) | (hour << 12);
    if minus {
        -time
    } else {
        time
    }
}
