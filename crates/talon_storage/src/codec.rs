//! Key layout and order-preserving tuple encoding.
//!
//! Routing-index data keys:
//! `region_id(8B BE) || index_id(8B BE) || encoded_index_tuple`.
//! Secondary-index values carry the encoded primary-key tuple. The
//! column-store layout replaces `index_id` with `(table_id(4B), field_id(4B))`
//! and stores one non-PK field per physical key. Inverted-index keys append a
//! level byte and the term (see `talon_reverse`).
//!
//! Tuple encoding is memcomparable: byte-wise key order equals tuple order
//! under the value comparison rules. Integers are sign-flipped big-endian,
//! floats use the IEEE trick, strings escape NUL and terminate with
//! `0x00 0x00`. Every field starts with a null tag (`0x00` = NULL) so NULL
//! sorts below all values.

use bytes::BufMut;

use talon_common::error::KvError;
use talon_common::value::{Value, ValueType};

const NULL_TAG: u8 = 0x00;
const VALUE_TAG: u8 = 0x01;

/// 8-byte big-endian region prefix.
pub fn region_prefix(region_id: u64) -> Vec<u8> {
    region_id.to_be_bytes().to_vec()
}

/// Exclusive upper bound for everything under a region prefix.
pub fn region_prefix_end(region_id: u64) -> Vec<u8> {
    (region_id + 1).to_be_bytes().to_vec()
}

/// `region_id || index_id` prefix of all data keys of one index.
pub fn key_prefix(region_id: u64, index_id: u64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(16);
    buf.put_u64(region_id);
    buf.put_u64(index_id);
    buf
}

/// Full data key: prefix + encoded tuple bytes.
pub fn data_key(region_id: u64, index_id: u64, tuple: &[u8]) -> Vec<u8> {
    let mut buf = key_prefix(region_id, index_id);
    buf.extend_from_slice(tuple);
    buf
}

/// Column-store key: `region_id || table_id(4B) || field_id(4B) || pk`.
pub fn column_key(region_id: u64, table_id: u32, field_id: u32, pk: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(16 + pk.len());
    buf.put_u64(region_id);
    buf.put_u32(table_id);
    buf.put_u32(field_id);
    buf.extend_from_slice(pk);
    buf
}

/// Strip the 16-byte `region_id || index_id` prefix, returning the tuple part.
pub fn tuple_part(key: &[u8]) -> &[u8] {
    if key.len() >= 16 {
        &key[16..]
    } else {
        &[]
    }
}

/// Re-key a data key from one region prefix to another (split backfill).
pub fn rekey_region(key: &[u8], new_region_id: u64) -> Vec<u8> {
    let mut out = new_region_id.to_be_bytes().to_vec();
    if key.len() > 8 {
        out.extend_from_slice(&key[8..]);
    }
    out
}

/// Append one value in memcomparable form.
pub fn encode_value_mem(value: &Value, buf: &mut Vec<u8>) {
    if value.is_null() {
        buf.push(NULL_TAG);
        return;
    }
    buf.push(VALUE_TAG);
    match value {
        Value::Bool(b) => buf.push(*b as u8),
        Value::Int8(v) => buf.push((*v as u8) ^ 0x80),
        Value::Int16(v) => buf.put_u16((*v as u16) ^ 0x8000),
        Value::Int32(v) => buf.put_u32((*v as u32) ^ 0x8000_0000),
        Value::Int64(v) => buf.put_u64((*v as u64) ^ 0x8000_0000_0000_0000),
        Value::UInt8(v) => buf.push(*v),
        Value::UInt16(v) => buf.put_u16(*v),
        Value::UInt32(v) => buf.put_u32(*v),
        Value::UInt64(v) => buf.put_u64(*v),
        Value::Float(v) => buf.put_u32(order_f32(*v)),
        Value::Double(v) => buf.put_u64(order_f64(*v)),
        Value::Date(v) => buf.put_u32(*v),
        Value::Timestamp(v) => buf.put_u32(*v),
        Value::Time(v) => buf.put_u32((*v as u32) ^ 0x8000_0000),
        Value::DateTime(v) => buf.put_u64(*v),
        Value::String(s) => encode_bytes_mem(s.as_bytes(), buf),
        Value::Hll(b) => encode_bytes_mem(b, buf),
        Value::Null | Value::Placeholder => {}
    }
}

/// NUL-escaped, double-NUL-terminated byte encoding: preserves prefix order.
fn encode_bytes_mem(bytes: &[u8], buf: &mut Vec<u8>) {
    for &b in bytes {
        if b == 0x00 {
            buf.push(0x00);
            buf.push(0xFF);
        } else {
            buf.push(b);
        }
    }
    buf.push(0x00);
    buf.push(0x00);
}

fn order_f32(v: f32) -> u32 {
    let bits = v.to_bits();
    if bits & 0x8000_0000 != 0 {
        !bits
    } else {
        bits | 0x8000_0000
    }
}

fn order_f64(v: f64) -> u64 {
    let bits = v.to_bits();
    if bits & 0x8000_0000_0000_0000 != 0 {
        !bits
    } else {
        bits | 0x8000_0000_0000_0000
    }
}

fn unorder_f32(enc: u32) -> f32 {
    let bits = if enc & 0x8000_0000 != 0 { enc & 0x7FFF_FFFF } else { !enc };
    f32::from_bits(bits)
}

fn unorder_f64(enc: u64) -> f64 {
    let bits =
        if enc & 0x8000_0000_0000_0000 != 0 { enc & 0x7FFF_FFFF_FFFF_FFFF } else { !enc };
    f64::from_bits(bits)
}

/// Encode the leading fields of an index tuple.
pub fn encode_index_tuple(values: &[Value]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(values.len() * 9);
    for v in values {
        encode_value_mem(v, &mut buf);
    }
    buf
}

fn take(buf: &[u8], pos: usize, n: usize) -> Result<&[u8], KvError> {
    buf.get(pos..pos + n)
        .ok_or_else(|| KvError::Corruption(format!("tuple truncated at offset {pos}")))
}

/// Decode one memcomparable value; returns the value and bytes consumed.
pub fn decode_value_mem(
    buf: &[u8],
    pos: usize,
    value_type: ValueType,
) -> Result<(Value, usize), KvError> {
    let tag = *take(buf, pos, 1)?.first().unwrap_or(&NULL_TAG);
    let pos = pos + 1;
    if tag == NULL_TAG {
        return Ok((Value::Null, 1));
    }
    let (value, used) = match value_type {
        ValueType::Bool => (Value::Bool(take(buf, pos, 1)?[0] != 0), 1),
        ValueType::Int8 => (Value::Int8((take(buf, pos, 1)?[0] ^ 0x80) as i8), 1),
        ValueType::Int16 => {
            let raw = u16::from_be_bytes(take(buf, pos, 2)?.try_into().unwrap_or([0; 2]));
            (Value::Int16((raw ^ 0x8000) as i16), 2)
        }
        ValueType::Int32 => {
            let raw = u32::from_be_bytes(take(buf, pos, 4)?.try_into().unwrap_or([0; 4]));
            (Value::Int32((raw ^ 0x8000_0000) as i32), 4)
        }
        ValueType::Int64 => {
            let raw = u64::from_be_bytes(take(buf, pos, 8)?.try_into().unwrap_or([0; 8]));
            (Value::Int64((raw ^ 0x8000_0000_0000_0000) as i64), 8)
        }
        ValueType::UInt8 => (Value::UInt8(take(buf, pos, 1)?[0]), 1),
        ValueType::UInt16 => {
            let raw = u16::from_be_bytes(take(buf, pos, 2)?.try_into().unwrap_or([0; 2]));
            (Value::UInt16(raw), 2)
        }
        ValueType::UInt32 => {
            let raw = u32::from_be_bytes(take(buf, pos, 4)?.try_into().unwrap_or([0; 4]));
            (Value::UInt32(raw), 4)
        }
        ValueType::UInt64 => {
            let raw = u64::from_be_bytes(take(buf, pos, 8)?.try_into().unwrap_or([0; 8]));
            (Value::UInt64(raw), 8)
        }
        ValueType::Float => {
            let raw = u32::from_be_bytes(take(buf, pos, 4)?.try_into().unwrap_or([0; 4]));
            (Value::Float(unorder_f32(raw)), 4)
        }
        ValueType::Double => {
            let raw = u64::from_be_bytes(take(buf, pos, 8)?.try_into().unwrap_or([0; 8]));
            (Value::Double(unorder_f64(raw)), 8)
        }
        ValueType::Date => {
            let raw = u32::from_be_bytes(take(buf, pos, 4)?.try_into().unwrap_or([0; 4]));
            (Value::Date(raw), 4)
        }
        ValueType::Timestamp => {
            let raw = u32::from_be_bytes(take(buf, pos, 4)?.try_into().unwrap_or([0; 4]));
            (Value::Timestamp(raw), 4)
        }
        ValueType::Time => {
            let raw = u32::from_be_bytes(take(buf, pos, 4)?.try_into().unwrap_or([0; 4]));
            (Value::Time((raw ^ 0x8000_0000) as i32), 4)
        }
        ValueType::DateTime => {
            let raw = u64::from_be_bytes(take(buf, pos, 8)?.try_into().unwrap_or([0; 8]));
            (Value::DateTime(raw), 8)
        }
        ValueType::String | ValueType::Hll => {
            let (bytes, used) = decode_bytes_mem(buf, pos)?;
            let v = if value_type == ValueType::String {
                Value::String(String::from_utf8_lossy(&bytes).into_owned())
            } else {
                Value::Hll(bytes)
            };
            (v, used)
        }
        ValueType::Null | ValueType::Placeholder => (Value::Null, 0),
    };
    Ok((value, used + 1))
}

fn decode_bytes_mem(buf: &[u8], mut pos: usize) -> Result<(Vec<u8>, usize), KvError> {
    let start = pos;
    let mut out = Vec::new();
    loop {
        let b = *take(buf, pos, 1)?.first().unwrap_or(&0);
        if b == 0x00 {
            let next = *take(buf, pos + 1, 1)?.first().unwrap_or(&0);
            pos += 2;
            match next {
                0x00 => return Ok((out, pos - start)),
                0xFF => out.push(0x00),
                _ => return Err(KvError::Corruption("bad NUL escape in key".into())),
            }
        } else {
            out.push(b);
            pos += 1;
        }
    }
}

/// Decode a full tuple given its field types.
pub fn decode_index_tuple(buf: &[u8], types: &[ValueType]) -> Result<Vec<Value>, KvError> {
    let mut pos = 0;
    let mut out = Vec::with_capacity(types.len());
    for t in types {
        let (v, used) = decode_value_mem(buf, pos, *t)?;
        pos += used;
        out.push(v);
    }
    Ok(out)
}

/// The closed-open fit check over tuple bytes: `start ≤ key < end`, empty
/// end meaning +infinity.
pub fn fits_range(start: &[u8], end: &[u8], tuple: &[u8]) -> bool {
    if tuple < start {
        return false;
    }
    end.is_empty() || tuple < end
}
