//! Field kinds and type declarations.
//!
//! [`Kind`] is the tagged variant per supported field kind; compound kinds
//! nest [`FieldType`]s. The same shapes serve both sides of the registration
//! boundary: a declaration carries raw tag strings, the persisted schema
//! carries the parsed attributes (the tag string itself is never stored).

use serde::{Deserialize, Serialize};

use super::value::Value;

/// The kind of a stored field. `Int`/`Uint` are the width-agnostic integers,
/// stored at 32 bits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Kind {
    Bool,
    Int8,
    Int16,
    Int32,
    Int64,
    /// Width-agnostic signed integer, 32 bits on disk.
    Int,
    Uint8,
    Uint16,
    Uint32,
    Uint64,
    /// Width-agnostic unsigned integer, 32 bits on disk.
    Uint,
    Float32,
    Float64,
    String,
    Bytes,
    /// Timestamp with nanosecond resolution.
    Time,
    /// User type with a binary marshal/unmarshal pair; opaque bytes on disk.
    Binary,
    /// Ordered sequence of one element type.
    List(Box<FieldType>),
    /// Fixed-length array of one element type.
    Array(usize, Box<FieldType>),
    /// Mapping; key type must not be a pointer.
    Map(Box<FieldType>, Box<FieldType>),
    /// Nested record shape.
    Struct(StructShape),
}

/// A nested struct shape. `seq` is assigned at registration when the owning
/// typeVersion has recursive struct references (ondisk version 2): the first
/// occurrence of a shape carries its fields, later occurrences carry only the
/// seq.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StructShape {
    #[serde(default)]
    pub seq: u32,
    #[serde(default)]
    pub fields: Vec<Field>,
}

impl StructShape {
    pub fn new(fields: Vec<Field>) -> StructShape {
        StructShape { seq: 0, fields }
    }
}

/// A field's type: its kind, optionally lifted to an optional (pointer).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldType {
    #[serde(default)]
    pub ptr: bool,
    pub kind: Kind,
}

impl FieldType {
    /// A plain (non-optional) field type.
    pub fn plain(kind: Kind) -> FieldType {
        FieldType { ptr: false, kind }
    }

    /// An optional field type; absent values decode as logical nil.
    pub fn ptr(kind: Kind) -> FieldType {
        FieldType { ptr: true, kind }
    }
}

/// One declared or persisted field. Declarations fill `name`, `typ` and
/// `tags`; registration parses the tags into the remaining attributes and the
/// tag string is dropped from the persisted form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    pub typ: FieldType,
    #[serde(default)]
    pub nonzero: bool,
    #[serde(default)]
    pub references: Vec<String>,
    /// Default literal as declared; empty means none. Parsed once at
    /// registration/load into `default_value`.
    #[serde(default)]
    pub default: String,
    #[serde(skip)]
    pub(crate) tags: String,
    #[serde(skip)]
    pub(crate) default_value: Option<Value>,
}

impl Field {
    /// A declared field. `tags` is the comma-separated tag string; see the
    /// crate docs for the grammar.
    pub fn new(name: &str, typ: FieldType, tags: &str) -> Field {
        Field {
            name: name.to_string(),
            typ,
            nonzero: false,
            references: Vec::new(),
            default: String::new(),
            tags: tags.to_string(),
            default_value: None,
        }
    }
}

/// A declared record type: name plus ordered fields. Built by [`Record`]
/// implementations; consumed by registration.
///
/// [`Record`]: crate::Record
#[derive(Debug, Clone)]
pub struct TypeDef {
    pub(crate) name: String,
    pub(crate) fields: Vec<Field>,
}

impl TypeDef {
    pub fn new(name: &str) -> TypeDef {
        TypeDef {
            name: name.to_string(),
            fields: Vec::new(),
        }
    }

    /// Append a field. Declaration order is storage order; the first field is
    /// the primary key.
    pub fn field(mut self, name: &str, typ: FieldType, tags: &str) -> TypeDef {
        self.fields.push(Field::new(name, typ, tags));
        self
    }
}

impl Kind {
    /// Any integer kind, signed or unsigned, width-agnostic included.
    pub(crate) fn is_int(&self) -> bool {
        self.is_sint() || self.is_uint()
    }

    pub(crate) fn is_sint(&self) -> bool {
        matches!(
            self,
            Kind::Int8 | Kind::Int16 | Kind::Int32 | Kind::Int64 | Kind::Int
        )
    }

    pub(crate) fn is_uint(&self) -> bool {
        matches!(
            self,
            Kind::Uint8 | Kind::Uint16 | Kind::Uint32 | Kind::Uint64 | Kind::Uint
        )
    }

    /// Encoded key width in bytes for integer kinds. Width-agnostic integers
    /// are pinned at 4.
    pub(crate) fn int_key_width(&self) -> usize {
        match self {
            Kind::Int8 | Kind::Uint8 => 1,
            Kind::Int16 | Kind::Uint16 => 2,
            Kind::Int32 | Kind::Uint32 | Kind::Int | Kind::Uint => 4,
            Kind::Int64 | Kind::Uint64 => 8,
            _ => unreachable!("int_key_width on non-integer kind"),
        }
    }

    /// Inclusive value bounds for signed integer kinds.
    pub(crate) fn sint_range(&self) -> (i64, i64) {
        match self {
            Kind::Int8 => (i8::MIN as i64, i8::MAX as i64),
            Kind::Int16 => (i16::MIN as i64, i16::MAX as i64),
            Kind::Int32 | Kind::Int => (i32::MIN as i64, i32::MAX as i64),
            Kind::Int64 => (i64::MIN, i64::MAX),
            _ => unreachable!("sint_range on non-signed kind"),
        }
    }

    /// Inclusive upper bound for unsigned integer kinds.
    pub(crate) fn uint_max(&self) -> u64 {
        match self {
            Kind::Uint8 => u8::MAX as u64,
            Kind::Uint16 => u16::MAX as u64,
            Kind::Uint32 | Kind::Uint => u32::MAX as u64,
            Kind::Uint64 => u64::MAX,
            _ => unreachable!("uint_max on non-unsigned kind"),
        }
    }

    /// Kinds usable as a primary key.
    pub(crate) fn valid_pk(&self) -> bool {
        matches!(self, Kind::Bool | Kind::String | Kind::Bytes) || self.is_int()
    }

    /// Kinds usable as an index/unique member (a slice of such a kind is
    /// additionally allowed for non-unique indices).
    pub(crate) fn valid_index(&self) -> bool {
        matches!(self, Kind::Bool | Kind::String | Kind::Time) || self.is_int()
    }

    /// Short kind name for diagnostics.
    pub(crate) fn name(&self) -> &'static str {
        match self {
            Kind::Bool => "bool",
            Kind::Int8 => "int8",
            Kind::Int16 => "int16",
            Kind::Int32 => "int32",
            Kind::Int64 => "int64",
            Kind::Int => "int",
            Kind::Uint8 => "uint8",
            Kind::Uint16 => "uint16",
            Kind::Uint32 => "uint32",
            Kind::Uint64 => "uint64",
            Kind::Uint => "uint",
            Kind::Float32 => "float32",
            Kind::Float64 => "float64",
            Kind::String => "string",
            Kind::Bytes => "bytes",
            Kind::Time => "time",
            Kind::Binary => "binary",
            Kind::List(_) => "list",
            Kind::Array(..) => "array",
            Kind::Map(..) => "map",
            Kind::Struct(_) => "struct",
        }
    }
}
