//! # Order-Preserving Key Encoding
//!
//! Primary keys and index keys are encoded so that byte-wise lexicographic
//! comparison equals the natural order of the values. All numeric kinds get a
//! fixed width; comparison never needs type information.
//!
//! ## Primary keys
//!
//! | Kind | Encoding |
//! |---|---|
//! | uint8/16/32/64, uint | big-endian, 1/2/4/8/4 bytes |
//! | int8/16/32/64, int | same widths, sign bit flipped |
//! | bool | 0x00 / 0x01 |
//! | string, bytes | raw bytes; strings must not contain 0x00 |
//!
//! The width-agnostic `int`/`uint` kinds are always 4 bytes; values outside
//! the 32-bit domain are rejected before they reach this module.
//!
//! ## Index keys
//!
//! Concatenation of each indexed field followed by the primary key. Numeric
//! fields and bools use the fixed-width form above; time is 8-byte
//! sign-flipped seconds plus 4-byte nanoseconds; strings are raw bytes with a
//! 0x00 terminator, which is why 0x00 is reserved. The byte length up to the
//! last field before the PK is the key's *prefix*: two keys collide on a
//! unique index iff their prefixes are equal.

use smallvec::SmallVec;

use crate::error::{Error, Result};
use crate::types::{Kind, Value};

/// Key scratch buffer; typical keys stay inline.
pub type KeyBuf = SmallVec<[u8; 24]>;

/// Encode a primary key value.
pub fn pack_pk(kind: &Kind, v: &Value) -> Result<KeyBuf> {
    let mut buf = KeyBuf::new();
    match (kind, v) {
        (k, Value::Int(n)) if k.is_sint() => put_sint(&mut buf, k, *n),
        (k, Value::Uint(n)) if k.is_uint() => put_uint(&mut buf, k, *n),
        (Kind::Bool, Value::Bool(b)) => buf.push(*b as u8),
        (Kind::String, Value::String(s)) => {
            if s.as_bytes().contains(&0) {
                return Err(Error::param("string key contains reserved byte 0x00"));
            }
            buf.extend_from_slice(s.as_bytes());
        }
        (Kind::Bytes, Value::Bytes(b)) => buf.extend_from_slice(b),
        (k, v) => {
            return Err(Error::param(format!(
                "value {:?} not usable as {} primary key",
                v,
                k.name()
            )))
        }
    }
    Ok(buf)
}

/// Decode a primary key back into a value.
pub fn parse_pk(kind: &Kind, data: &[u8]) -> Result<Value> {
    match kind {
        k if k.is_sint() => {
            let w = k.int_key_width();
            if data.len() != w {
                return Err(Error::store("short signed key"));
            }
            Ok(Value::Int(get_sint(k, data)))
        }
        k if k.is_uint() => {
            let w = k.int_key_width();
            if data.len() != w {
                return Err(Error::store("short unsigned key"));
            }
            Ok(Value::Uint(get_uint(k, data)))
        }
        Kind::Bool => match data {
            [0] => Ok(Value::Bool(false)),
            [1] => Ok(Value::Bool(true)),
            _ => Err(Error::store("bad bool key")),
        },
        Kind::String => String::from_utf8(data.to_vec())
            .map(Value::String)
            .map_err(|_| Error::store("string key is not utf-8")),
        Kind::Bytes => Ok(Value::Bytes(data.to_vec())),
        k => Err(Error::store(format!("kind {} not a key kind", k.name()))),
    }
}

/// Append an index field encoding to `buf`. `kind` must be an indexable
/// scalar kind (for indexed slices, the element kind).
pub fn pack_index_field(kind: &Kind, v: &Value, buf: &mut Vec<u8>) -> Result<()> {
    match (kind, v) {
        (k, Value::Int(n)) if k.is_sint() => {
            let mut b = KeyBuf::new();
            put_sint(&mut b, k, *n);
            buf.extend_from_slice(&b);
        }
        (k, Value::Uint(n)) if k.is_uint() => {
            let mut b = KeyBuf::new();
            put_uint(&mut b, k, *n);
            buf.extend_from_slice(&b);
        }
        (Kind::Bool, Value::Bool(b)) => buf.push(*b as u8),
        (Kind::Time, Value::Time(t)) => {
            let secs = t.timestamp();
            let nanos = t.timestamp_subsec_nanos();
            buf.extend_from_slice(&((secs as u64) ^ SIGN64).to_be_bytes());
            buf.extend_from_slice(&nanos.to_be_bytes());
        }
        (Kind::String, Value::String(s)) => {
            if s.as_bytes().contains(&0) {
                return Err(Error::param("indexed string contains reserved byte 0x00"));
            }
            buf.extend_from_slice(s.as_bytes());
            buf.push(0);
        }
        (k, v) => {
            return Err(Error::param(format!(
                "value {:?} not usable in {} index field",
                v,
                k.name()
            )))
        }
    }
    Ok(())
}

/// Parse the leading index fields of `key`, returning the field values, the
/// prefix length in bytes, and the trailing primary key bytes.
pub fn parse_index_key<'k>(
    kinds: &[&Kind],
    key: &'k [u8],
) -> Result<(Vec<Value>, usize, &'k [u8])> {
    let mut pos = 0usize;
    let mut values = Vec::with_capacity(kinds.len());
    for kind in kinds {
        match kind {
            k if k.is_int() => {
                let w = k.int_key_width();
                let data = key
                    .get(pos..pos + w)
                    .ok_or_else(|| Error::store("short index key"))?;
                values.push(if k.is_sint() {
                    Value::Int(get_sint(k, data))
                } else {
                    Value::Uint(get_uint(k, data))
                });
                pos += w;
            }
            Kind::Bool => {
                let b = *key.get(pos).ok_or_else(|| Error::store("short index key"))?;
                values.push(Value::Bool(b != 0));
                pos += 1;
            }
            Kind::Time => {
                let data = key
                    .get(pos..pos + 12)
                    .ok_or_else(|| Error::store("short index key"))?;
                let secs = (u64::from_be_bytes(data[..8].try_into().unwrap()) ^ SIGN64) as i64;
                let nanos = u32::from_be_bytes(data[8..].try_into().unwrap());
                let t = chrono::DateTime::from_timestamp(secs, nanos)
                    .ok_or_else(|| Error::store("bad time in index key"))?;
                values.push(Value::Time(t.with_timezone(&chrono::Utc)));
                pos += 12;
            }
            Kind::String => {
                let rest = &key[pos..];
                let end = rest
                    .iter()
                    .position(|&b| b == 0)
                    .ok_or_else(|| Error::store("unterminated string in index key"))?;
                let s = String::from_utf8(rest[..end].to_vec())
                    .map_err(|_| Error::store("index string is not utf-8"))?;
                values.push(Value::String(s));
                pos += end + 1;
            }
            k => return Err(Error::store(format!("kind {} in index key", k.name()))),
        }
    }
    Ok((values, pos, &key[pos..]))
}

/// Smallest byte string strictly greater than every key starting with
/// `prefix`: the prefix with its last non-0xFF byte incremented. `None`
/// means unbounded (all bytes were 0xFF).
pub fn prefix_successor(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut out = prefix.to_vec();
    while let Some(last) = out.pop() {
        if last != 0xff {
            out.push(last + 1);
            return Some(out);
        }
    }
    None
}

const SIGN64: u64 = 1 << 63;

fn put_sint(buf: &mut KeyBuf, kind: &Kind, v: i64) {
    match kind.int_key_width() {
        1 => buf.extend_from_slice(&[(v as i8 as u8) ^ 0x80]),
        2 => buf.extend_from_slice(&((v as i16 as u16) ^ 0x8000).to_be_bytes()),
        4 => buf.extend_from_slice(&((v as i32 as u32) ^ 0x8000_0000).to_be_bytes()),
        _ => buf.extend_from_slice(&((v as u64) ^ SIGN64).to_be_bytes()),
    }
}

fn put_uint(buf: &mut KeyBuf, kind: &Kind, v: u64) {
    match kind.int_key_width() {
        1 => buf.extend_from_slice(&[v as u8]),
        2 => buf.extend_from_slice(&(v as u16).to_be_bytes()),
        4 => buf.extend_from_slice(&(v as u32).to_be_bytes()),
        _ => buf.extend_from_slice(&v.to_be_bytes()),
    }
}

fn get_sint(kind: &Kind, data: &[u8]) -> i64 {
    match kind.int_key_width() {
        1 => (data[0] ^ 0x80) as i8 as i64,
        2 => (u16::from_be_bytes(data.try_into().unwrap()) ^ 0x8000) as i16 as i64,
        4 => (u32::from_be_bytes(data.try_into().unwrap()) ^ 0x8000_0000) as i32 as i64,
        _ => (u64::from_be_bytes(data.try_into().unwrap()) ^ SIGN64) as i64,
    }
}

fn get_uint(kind: &Kind, data: &[u8]) -> u64 {
    match kind.int_key_width() {
        1 => data[0] as u64,
        2 => u16::from_be_bytes(data.try_into().unwrap()) as u64,
        4 => u32::from_be_bytes(data.try_into().unwrap()) as u64,
        _ => u64::from_be_bytes(data.try_into().unwrap()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pk(kind: &Kind, v: Value) -> Vec<u8> {
        pack_pk(kind, &v).unwrap().to_vec()
    }

    #[test]
    fn signed_order_is_byte_order() {
        let vals = [i64::MIN, -1000, -1, 0, 1, 1000, i64::MAX];
        let keys: Vec<_> = vals.iter().map(|&v| pk(&Kind::Int64, Value::Int(v))).collect();
        for w in keys.windows(2) {
            assert!(w[0] < w[1]);
        }
    }

    #[test]
    fn narrow_signed_order() {
        let vals = [-128i64, -1, 0, 1, 127];
        let keys: Vec<_> = vals.iter().map(|&v| pk(&Kind::Int8, Value::Int(v))).collect();
        for w in keys.windows(2) {
            assert!(w[0] < w[1]);
            assert_eq!(w[0].len(), 1);
        }
    }

    #[test]
    fn unsigned_is_big_endian() {
        assert_eq!(pk(&Kind::Uint32, Value::Uint(0x01020304)), vec![1, 2, 3, 4]);
        assert_eq!(pk(&Kind::Uint, Value::Uint(7)), vec![0, 0, 0, 7]);
    }

    #[test]
    fn pk_round_trip() {
        for (kind, v) in [
            (Kind::Int32, Value::Int(-5)),
            (Kind::Int, Value::Int(12345)),
            (Kind::Uint64, Value::Uint(u64::MAX)),
            (Kind::Bool, Value::Bool(true)),
            (Kind::String, Value::String("hello".into())),
            (Kind::Bytes, Value::Bytes(vec![1, 2, 0, 3])),
        ] {
            let key = pk(&kind, v.clone());
            assert_eq!(parse_pk(&kind, &key).unwrap(), v);
        }
    }

    #[test]
    fn string_pk_rejects_nul() {
        assert!(matches!(
            pack_pk(&Kind::String, &Value::String("a\0b".into())),
            Err(Error::Param(_))
        ));
    }

    #[test]
    fn index_key_splits_back() {
        let mut key = Vec::new();
        pack_index_field(&Kind::Uint32, &Value::Uint(9), &mut key).unwrap();
        pack_index_field(&Kind::String, &Value::String("abc".into()), &mut key).unwrap();
        let prefix_len = key.len();
        key.extend_from_slice(&[0, 0, 0, 1]); // pk suffix

        let (values, pre, pkb) =
            parse_index_key(&[&Kind::Uint32, &Kind::String], &key).unwrap();
        assert_eq!(values, vec![Value::Uint(9), Value::String("abc".into())]);
        assert_eq!(pre, prefix_len);
        assert_eq!(pkb, &[0, 0, 0, 1]);
    }

    #[test]
    fn time_index_order() {
        use chrono::TimeZone;
        let a = chrono::Utc.timestamp_opt(-5, 0).unwrap();
        let b = chrono::Utc.timestamp_opt(5, 0).unwrap();
        let c = chrono::Utc.timestamp_opt(5, 999).unwrap();
        let mut ka = Vec::new();
        let mut kb = Vec::new();
        let mut kc = Vec::new();
        pack_index_field(&Kind::Time, &Value::Time(a), &mut ka).unwrap();
        pack_index_field(&Kind::Time, &Value::Time(b), &mut kb).unwrap();
        pack_index_field(&Kind::Time, &Value::Time(c), &mut kc).unwrap();
        assert!(ka < kb && kb < kc);
    }

    #[test]
    fn prefix_successor_increments() {
        assert_eq!(prefix_successor(&[1, 2, 3]).unwrap(), vec![1, 2, 4]);
        assert_eq!(prefix_successor(&[1, 0xff]).unwrap(), vec![2]);
        assert_eq!(prefix_successor(&[0xff, 0xff]), None);
    }
}
