//! Dynamic record values.
//!
//! Integers travel as `i64`/`u64` regardless of declared width; the declared
//! [`Kind`] decides encoding width and validation bounds. `Float` carries
//! `f64`; a declared `Float32` round-trips exactly through it. `Null` is the
//! logical nil of an optional (pointer) field.

use chrono::{DateTime, Utc};

use super::kind::{FieldType, Kind, StructShape};
use crate::error::{Error, Result};

/// A field value in dynamic form.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Nil of an optional field.
    Null,
    Bool(bool),
    Int(i64),
    Uint(u64),
    Float(f64),
    String(String),
    Bytes(Vec<u8>),
    Time(DateTime<Utc>),
    /// List and fixed-array values.
    List(Vec<Value>),
    /// Map entries in insertion order; encoded in this order.
    Map(Vec<(Value, Value)>),
    /// Nested struct values, positional per the declared shape.
    Struct(Vec<Value>),
}

/// The zero timestamp: the Unix epoch.
pub fn time_zero() -> DateTime<Utc> {
    DateTime::UNIX_EPOCH
}

impl Value {
    /// The zero value of a field type. Optional fields are `Null`.
    pub fn zero(ft: &FieldType) -> Value {
        if ft.ptr {
            return Value::Null;
        }
        Value::zero_kind(&ft.kind)
    }

    fn zero_kind(kind: &Kind) -> Value {
        match kind {
            Kind::Bool => Value::Bool(false),
            k if k.is_sint() => Value::Int(0),
            k if k.is_uint() => Value::Uint(0),
            Kind::Float32 | Kind::Float64 => Value::Float(0.0),
            Kind::String => Value::String(String::new()),
            Kind::Bytes | Kind::Binary => Value::Bytes(Vec::new()),
            Kind::Time => Value::Time(time_zero()),
            Kind::List(_) => Value::List(Vec::new()),
            Kind::Array(n, elem) => Value::List(vec![Value::zero(elem); *n]),
            Kind::Map(..) => Value::Map(Vec::new()),
            Kind::Struct(shape) => {
                Value::Struct(shape.fields.iter().map(|f| Value::zero(&f.typ)).collect())
            }
            _ => unreachable!(),
        }
    }

    /// Whether a scalar value is the zero of its kind. `Null` is always
    /// zero; a list or map is zero when empty; a struct when all its fields
    /// are. This check cannot tell a list from a fixed array (both travel as
    /// `Value::List`); use [`Value::is_zero_for`] wherever the declared kind
    /// is at hand.
    pub fn is_zero(&self) -> bool {
        match self {
            Value::Null => true,
            Value::Bool(b) => !b,
            Value::Int(v) => *v == 0,
            Value::Uint(v) => *v == 0,
            Value::Float(v) => *v == 0.0,
            Value::String(s) => s.is_empty(),
            Value::Bytes(b) => b.is_empty(),
            Value::Time(t) => *t == time_zero(),
            Value::List(l) => l.is_empty(),
            Value::Map(m) => m.is_empty(),
            Value::Struct(fields) => fields.iter().all(|v| v.is_zero()),
        }
    }

    /// Kind-aware zero check. The distinction matters for the two kinds that
    /// share the `Value::List` representation: a list (slice) is zero only
    /// when it is empty, no matter what its elements hold; a fixed array is
    /// zero when every element is. Struct fields recurse with their declared
    /// types.
    pub fn is_zero_for(&self, ft: &FieldType) -> bool {
        match (&ft.kind, self) {
            (_, Value::Null) => true,
            (Kind::List(_), Value::List(l)) => l.is_empty(),
            (Kind::Array(_, elem), Value::List(l)) => l.iter().all(|v| v.is_zero_for(elem)),
            (Kind::Map(..), Value::Map(m)) => m.is_empty(),
            (Kind::Struct(shape), Value::Struct(vals)) if shape.fields.len() == vals.len() => {
                shape
                    .fields
                    .iter()
                    .zip(vals)
                    .all(|(f, v)| v.is_zero_for(&f.typ))
            }
            // Scalars, and struct shapes that are only a seq back-reference
            // here (cyclic types), fall back to the value-only check.
            _ => self.is_zero(),
        }
    }

    /// Validate the value against a field type, including integer width and
    /// the 32-bit domain of the width-agnostic kinds.
    pub fn validate(&self, ft: &FieldType) -> Result<()> {
        if let Value::Null = self {
            if ft.ptr {
                return Ok(());
            }
            return Err(Error::param(format!(
                "nil value for non-optional {} field",
                ft.kind.name()
            )));
        }
        match (&ft.kind, self) {
            (Kind::Bool, Value::Bool(_)) => Ok(()),
            (k, Value::Int(v)) if k.is_sint() => {
                let (lo, hi) = k.sint_range();
                if *v < lo || *v > hi {
                    return Err(Error::param(format!(
                        "value {} out of range for {}",
                        v,
                        k.name()
                    )));
                }
                Ok(())
            }
            (k, Value::Uint(v)) if k.is_uint() => {
                if *v > k.uint_max() {
                    return Err(Error::param(format!(
                        "value {} out of range for {}",
                        v,
                        k.name()
                    )));
                }
                Ok(())
            }
            (Kind::Float32, Value::Float(_)) => Ok(()),
            (Kind::Float64, Value::Float(_)) => Ok(()),
            (Kind::String, Value::String(_)) => Ok(()),
            (Kind::Bytes, Value::Bytes(_)) => Ok(()),
            (Kind::Binary, Value::Bytes(_)) => Ok(()),
            (Kind::Time, Value::Time(_)) => Ok(()),
            (Kind::List(elem), Value::List(l)) => {
                for v in l {
                    v.validate(elem)?;
                }
                Ok(())
            }
            (Kind::Array(n, elem), Value::List(l)) => {
                if l.len() != *n {
                    return Err(Error::param(format!(
                        "array value has {} elements, need {}",
                        l.len(),
                        n
                    )));
                }
                for v in l {
                    v.validate(elem)?;
                }
                Ok(())
            }
            (Kind::Map(kt, vt), Value::Map(m)) => {
                for (k, v) in m {
                    k.validate(kt)?;
                    v.validate(vt)?;
                }
                Ok(())
            }
            (Kind::Struct(shape), Value::Struct(values)) => validate_struct(shape, values),
            (k, v) => Err(Error::param(format!(
                "value {:?} does not fit field kind {}",
                variant_name(v),
                k.name()
            ))),
        }
    }

    /// Total order between two values of the same scalar kind, used for
    /// in-memory sorts and range filters. Compound kinds and nil are not
    /// comparable.
    pub fn cmp_order(&self, other: &Value) -> Result<std::cmp::Ordering> {
        let ord = match (self, other) {
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::Int(a), Value::Int(b)) => a.cmp(b),
            (Value::Uint(a), Value::Uint(b)) => a.cmp(b),
            (Value::Float(a), Value::Float(b)) => a.total_cmp(b),
            (Value::String(a), Value::String(b)) => a.cmp(b),
            (Value::Bytes(a), Value::Bytes(b)) => a.cmp(b),
            (Value::Time(a), Value::Time(b)) => a.cmp(b),
            _ => {
                return Err(Error::param(format!(
                    "cannot order {} against {}",
                    variant_name(self),
                    variant_name(other)
                )))
            }
        };
        Ok(ord)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Value {
        Value::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Value {
        Value::Int(v as i64)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Value {
        Value::Int(v)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Value {
        Value::Uint(v as u64)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Value {
        Value::Uint(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Value {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Value {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Value {
        Value::String(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Value {
        Value::Bytes(v)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Value {
        Value::Time(v)
    }
}

fn validate_struct(shape: &StructShape, values: &[Value]) -> Result<()> {
    if values.len() != shape.fields.len() {
        return Err(Error::param(format!(
            "struct value has {} fields, shape has {}",
            values.len(),
            shape.fields.len()
        )));
    }
    for (f, v) in shape.fields.iter().zip(values) {
        v.validate(&f.typ)?;
    }
    Ok(())
}

fn variant_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "nil",
        Value::Bool(_) => "bool",
        Value::Int(_) => "int",
        Value::Uint(_) => "uint",
        Value::Float(_) => "float",
        Value::String(_) => "string",
        Value::Bytes(_) => "bytes",
        Value::Time(_) => "time",
        Value::List(_) => "list",
        Value::Map(_) => "map",
        Value::Struct(_) => "struct",
    }
}
