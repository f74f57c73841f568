//! `Value`: the tagged scalar flowing through plans, keys, and rows.
//!
//! Mixed-type comparison promotes both sides to the least common
//! representative: unsigned-vs-signed integers widen to UINT64/INT64,
//! any date/time operand routes through DATETIME-family types, floats win
//! over integers, and everything else falls back to string comparison.
//! NULL compares less than any value.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use xxhash_rust::xxh3::xxh3_64;

use crate::datetime;

/// Type tag for `Value`, mirrored in slot/field descriptors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ValueType {
    #[default]
    Null,
    Bool,
    Int8,
    Int16,
    Int32,
    Int64,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Float,
    Double,
    String,
    Date,
    Time,
    DateTime,
    Timestamp,
    Hll,
    Placeholder,
}

impl ValueType {
    pub fn is_int(self) -> bool {
        matches!(
            self,
            ValueType::Bool
                | ValueType::Int8
                | ValueType::Int16
                | ValueType::Int32
                | ValueType::Int64
                | ValueType::UInt8
                | ValueType::UInt16
                | ValueType::UInt32
                | ValueType::UInt64
        )
    }

    pub fn is_uint(self) -> bool {
        matches!(
            self,
            ValueType::UInt8 | ValueType::UInt16 | ValueType::UInt32 | ValueType::UInt64
        )
    }

    pub fn is_double(self) -> bool {
        matches!(self, ValueType::Float | ValueType::Double)
    }
}

/// A single scalar. Fixed-width variants carry native representations;
/// the packed date/time layouts are documented in [`crate::datetime`].
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    UInt8(u8),
    UInt16(u16),
    UInt32(u32),
    UInt64(u64),
    Float(f32),
    Double(f64),
    String(String),
    /// Packed `(year*13+month) << 5 | day`.
    Date(u32),
    /// Signed `hour << 12 | minute << 6 | second`.
    Time(i32),
    /// MySQL-style packed datetime with microseconds.
    DateTime(u64),
    /// Seconds since the Unix epoch.
    Timestamp(u32),
    /// Opaque HyperLogLog registers.
    Hll(Vec<u8>),
    /// Unbound statement parameter.
    Placeholder,
}

impl Value {
    pub fn value_type(&self) -> ValueType {
        match self {
            Value::Null => ValueType::Null,
            Value::Bool(_) => ValueType::Bool,
            Value::Int8(_) => ValueType::Int8,
            Value::Int16(_) => ValueType::Int16,
            Value::Int32(_) => ValueType::Int32,
            Value::Int64(_) => ValueType::Int64,
            Value::UInt8(_) => ValueType::UInt8,
            Value::UInt16(_) => ValueType::UInt16,
            Value::UInt32(_) => ValueType::UInt32,
            Value::UInt64(_) => ValueType::UInt64,
            Value::Float(_) => ValueType::Float,
            Value::Double(_) => ValueType::Double,
            Value::String(_) => ValueType::String,
            Value::Date(_) => ValueType::Date,
            Value::Time(_) => ValueType::Time,
            Value::DateTime(_) => ValueType::DateTime,
            Value::Timestamp(_) => ValueType::Timestamp,
            Value::Hll(_) => ValueType::Hll,
            Value::Placeholder => ValueType::Placeholder,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn is_int(&self) -> bool {
        self.value_type().is_int()
    }

    pub fn is_uint(&self) -> bool {
        self.value_type().is_uint()
    }

    pub fn is_double(&self) -> bool {
        self.value_type().is_double()
    }

    pub fn is_string(&self) -> bool {
        matches!(self, Value::String(_))
    }

    pub fn is_numeric(&self) -> bool {
        self.is_int() || self.is_double()
    }

    /// Widen to i64, parsing strings and passing packed date/time raw bits
    /// through unchanged.
    pub fn get_i64(&self) -> i64 {
        match self {
            Value::Null | Value::Placeholder => 0,
            Value::Bool(b) => *b as i64,
            Value::Int8(v) => *v as i64,
            Value::Int16(v) => *v as i64,
            Value::Int32(v) => *v as i64,
            Value::Int64(v) => *v,
            Value::UInt8(v) => *v as i64,
            Value::UInt16(v) => *v as i64,
            Value::UInt32(v) => *v as i64,
            Value::UInt64(v) => *v as i64,
            Value::Float(v) => *v as i64,
            Value::Double(v) => *v as i64,
            Value::String(s) => parse_leading_i64(s),
            Value::Date(v) => *v as i64,
            Value::Time(v) => *v as i64,
            Value::DateTime(v) => *v as i64,
            Value::Timestamp(v) => *v as i64,
            Value::Hll(_) => 0,
        }
    }

    pub fn get_u64(&self) -> u64 {
        match self {
            Value::String(s) => parse_leading_i64(s) as u64,
            Value::Float(v) => *v as u64,
            Value::Double(v) => *v as u64,
            other => other.get_i64() as u64,
        }
    }

    pub fn get_f64(&self) -> f64 {
        match self {
            Value::Float(v) => *v as f64,
            Value::Double(v) => *v,
            Value::String(s) => parse_leading_f64(s),
            Value::UInt64(v) => *v as f64,
            other => other.get_i64() as f64,
        }
    }

    pub fn get_string(&self) -> String {
        match self {
            Value::Null | Value::Placeholder => String::new(),
            Value::Bool(b) => (*b as u8).to_string(),
            Value::Int8(v) => v.to_string(),
            Value::Int16(v) => v.to_string(),
            Value::Int32(v) => v.to_string(),
            Value::Int64(v) => v.to_string(),
            Value::UInt8(v) => v.to_string(),
            Value::UInt16(v) => v.to_string(),
            Value::UInt32(v) => v.to_string(),
            Value::UInt64(v) => v.to_string(),
            Value::Float(v) => v.to_string(),
            Value::Double(v) => v.to_string(),
            Value::String(s) => s.clone(),
            Value::Date(v) => datetime::date_to_str(*v),
            Value::Time(v) => datetime::time_to_str(*v),
            Value::DateTime(v) => datetime::datetime_to_str(*v),
            Value::Timestamp(v) => datetime::timestamp_to_str(*v),
            Value::Hll(b) => String::from_utf8_lossy(b).into_owned(),
        }
    }

    /// Cast to another type. NULL casts to NULL; date/time targets route
    /// through DATETIME when the source is not already numeric raw bits.
    pub fn cast_to(&self, target: ValueType) -> Value {
        if self.is_null() || self.value_type() == target {
            return self.clone();
        }
        match target {
            ValueType::Null => Value::Null,
            ValueType::Bool => Value::Bool(self.get_i64() != 0),
            ValueType::Int8 => Value::Int8(self.get_i64() as i8),
            ValueType::Int16 => Value::Int16(self.get_i64() as i16),
            ValueType::Int32 => Value::Int32(self.get_i64() as i32),
            ValueType::Int64 => Value::Int64(self.get_i64()),
            ValueType::UInt8 => Value::UInt8(self.get_u64() as u8),
            ValueType::UInt16 => Value::UInt16(self.get_u64() as u16),
            ValueType::UInt32 => Value::UInt32(self.get_u64() as u32),
            ValueType::UInt64 => Value::UInt64(self.get_u64()),
            ValueType::Float => Value::Float(self.get_f64() as f32),
            ValueType::Double => Value::Double(self.get_f64()),
            ValueType::String => Value::String(self.get_string()),
            ValueType::DateTime => Value::DateTime(self.to_datetime_bits()),
            ValueType::Timestamp => {
                if self.is_numeric() {
                    Value::Timestamp(self.get_u64() as u32)
                } else {
                    Value::Timestamp(datetime::datetime_to_timestamp(self.to_datetime_bits()))
                }
            }
            ValueType::Date => {
                if self.is_numeric() {
                    Value::Date(self.get_u64() as u32)
                } else {
                    Value::Date(datetime::datetime_to_date(self.to_datetime_bits()))
                }
            }
            ValueType::Time => {
                if self.is_numeric() {
                    Value::Time(self.get_i64() as i32)
                } else if let Value::String(s) = self {
                    Value::Time(datetime::str_to_time(s))
                } else {
                    Value::Time(datetime::datetime_to_time(self.to_datetime_bits()))
                }
            }
            ValueType::Hll => Value::Hll(self.get_string().into_bytes()),
            ValueType::Placeholder => Value::Placeholder,
        }
    }

    fn to_datetime_bits(&self) -> u64 {
        match self {
            Value::DateTime(v) => *v,
            Value::Timestamp(v) => datetime::timestamp_to_datetime(*v),
            Value::Date(v) => datetime::date_to_datetime(*v),
            Value::Time(v) => datetime::time_to_datetime(*v),
            Value::String(s) => datetime::str_to_datetime(s),
            other => other.get_u64(),
        }
    }

    /// Compare two values of the *same* type with native ordering.
    /// NULL sorts below everything, including another NULL's pair value.
    pub fn compare_same_type(&self, other: &Value) -> Ordering {
        match (self, other) {
            (Value::Null, Value::Null) => Ordering::Equal,
            (Value::Null, _) => Ordering::Less,
            (_, Value::Null) => Ordering::Greater,
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::Int8(a), Value::Int8(b)) => a.cmp(b),
            (Value::Int16(a), Value::Int16(b)) => a.cmp(b),
            (Value::Int32(a), Value::Int32(b)) => a.cmp(b),
            (Value::Int64(a), Value::Int64(b)) => a.cmp(b),
            (Value::UInt8(a), Value::UInt8(b)) => a.cmp(b),
            (Value::UInt16(a), Value::UInt16(b)) => a.cmp(b),
            (Value::UInt32(a), Value::UInt32(b)) => a.cmp(b),
            (Value::UInt64(a), Value::UInt64(b)) => a.cmp(b),
            (Value::Float(a), Value::Float(b)) => a.partial_cmp(b).unwrap_or(Ordering::Equal),
            (Value::Double(a), Value::Double(b)) => a.partial_cmp(b).unwrap_or(Ordering::Equal),
            (Value::String(a), Value::String(b)) => a.cmp(b),
            (Value::Date(a), Value::Date(b)) => a.cmp(b),
            (Value::Time(a), Value::Time(b)) => a.cmp(b),
            (Value::DateTime(a), Value::DateTime(b)) => a.cmp(b),
            (Value::Timestamp(a), Value::Timestamp(b)) => a.cmp(b),
            (Value::Hll(a), Value::Hll(b)) => a.cmp(b),
            _ => Ordering::Equal,
        }
    }

    /// Compare with cross-type promotion (see module docs for the ladder).
    pub fn compare(&self, other: &Value) -> Ordering {
        if self.is_null() || other.is_null() {
            return self.compare_same_type(other);
        }
        let (lt, rt) = (self.value_type(), other.value_type());
        if lt == rt {
            return self.compare_same_type(other);
        }
        let target = promote_pair(lt, rt);
        self.cast_to(target).compare_same_type(&other.cast_to(target))
    }

    /// 64-bit non-cryptographic hash over the canonical bytes: string
    /// contents, or the minimal-width little-endian numeric representation.
    pub fn hash64(&self) -> u64 {
        match self {
            Value::Null | Value::Placeholder => 0,
            Value::Bool(b) => xxh3_64(&[*b as u8]),
            Value::Int8(v) => xxh3_64(&v.to_le_bytes()),
            Value::UInt8(v) => xxh3_64(&v.to_le_bytes()),
            Value::Int16(v) => xxh3_64(&v.to_le_bytes()),
            Value::UInt16(v) => xxh3_64(&v.to_le_bytes()),
            Value::Int32(v) => xxh3_64(&v.to_le_bytes()),
            Value::UInt32(v) => xxh3_64(&v.to_le_bytes()),
            Value::Float(v) => xxh3_64(&v.to_bits().to_le_bytes()),
            Value::Timestamp(v) => xxh3_64(&v.to_le_bytes()),
            Value::Date(v) => xxh3_64(&v.to_le_bytes()),
            Value::Time(v) => xxh3_64(&v.to_le_bytes()),
            Value::Int64(v) => xxh3_64(&v.to_le_bytes()),
            Value::UInt64(v) => xxh3_64(&v.to_le_bytes()),
            Value::Double(v) => xxh3_64(&v.to_bits().to_le_bytes()),
            Value::DateTime(v) => xxh3_64(&v.to_le_bytes()),
            Value::String(s) => xxh3_64(s.as_bytes()),
            Value::Hll(b) => xxh3_64(b),
        }
    }
}

/// Least common representative for a mixed-type comparison.
fn promote_pair(l: ValueType, r: ValueType) -> ValueType {
    use ValueType::*;
    if l.is_int() && r.is_int() {
        return if l.is_uint() || r.is_uint() { UInt64 } else { Int64 };
    }
    if l == DateTime || r == DateTime {
        return DateTime;
    }
    if l == Timestamp || r == Timestamp {
        return Timestamp;
    }
    if l == Date || r == Date {
        return Date;
    }
    if l == Time || r == Time {
        return Time;
    }
    if l.is_double() || r.is_double() {
        return Double;
    }
    if l.is_int() || r.is_int() {
        return Double;
    }
    String
}

fn parse_leading_i64(s: &str) -> i64 {
    let t = s.trim();
    let end = t
        .char_indices()
        .take_while(|(i, c)| c.is_ascii_digit() || (*i == 0 && (*c == '-' || *c == '+')))
        .map(|(i, c)| i + c.len_utf8())
        .last()
        .unwrap_or(0);
    t[..end].parse().unwrap_or(0)
}

fn parse_leading_f64(s: &str) -> f64 {
    let t = s.trim();
    let end = t
        .char_indices()
        .take_while(|(i, c)| {
            c.is_ascii_digit() || *c == '.' || (*i == 0 && (*c == '-' || *c == '+'))
        })
        .map(|(i, c)| i + c.len_utf8())
        .last()
        .unwrap_or(0);
    t[..end].parse().unwrap_or(0.0)
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "NULL")
        } else {
            write!(f, "{}", self.get_string())
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.compare(other) == Ordering::Equal
    }
}

impl Eq for Value {}
