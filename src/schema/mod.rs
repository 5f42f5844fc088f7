//! # Persisted Schema Model
//!
//! Every registered type has an append-only chain of [`TypeVersion`]s stored
//! in its `types` bucket as self-describing JSON under a 4-byte big-endian
//! version key. A new version is written whenever the declared shape is not
//! structurally equal to the current one; versions are never deleted, because
//! each stored record names the version that wrote it.
//!
//! Ondisk version 1 covers flat field graphs. As soon as a field graph
//! contains struct shapes the type is written at ondisk version 2: every
//! struct shape carries a sequence id local to the typeVersion (the top-level
//! field list is shape 1), and a recursive occurrence stores only the id.
//! That keeps the JSON finite for cyclic shapes and gives the codec a table
//! to resolve shapes by id.

pub(crate) mod parse;
pub(crate) mod registry;

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use hashbrown::HashMap;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::{Field, FieldType, Kind, StructShape, Value};

pub(crate) const ONDISK_V1: u32 = 1;
pub(crate) const ONDISK_V2: u32 = 2;

/// One secondary index of a typeVersion. Field names are persisted; runtime
/// resolution to field positions happens against the owning version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexSchema {
    pub unique: bool,
    pub fields: Vec<String>,
}

/// An immutable snapshot of a type's declared shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypeVersion {
    pub version: u32,
    pub ondisk_version: u32,
    pub noauto: bool,
    pub fields: Vec<Field>,
    pub indices: BTreeMap<String, IndexSchema>,
    pub referenced_by: BTreeSet<String>,

    #[serde(skip)]
    pub(crate) name: String,
    /// Struct shape table, seq -> fields. Seq 1 is the top-level field list
    /// for ondisk version 2 types.
    #[serde(skip)]
    pub(crate) shapes: HashMap<u32, Vec<Field>>,
    /// Names of types referenced by `ref` fields of this version.
    #[serde(skip)]
    pub(crate) references: BTreeSet<String>,
}

impl TypeVersion {
    /// The primary key field: always the first declared field.
    pub(crate) fn pk(&self) -> &Field {
        &self.fields[0]
    }

    pub(crate) fn field(&self, name: &str) -> Option<(usize, &Field)> {
        self.fields
            .iter()
            .enumerate()
            .find(|(_, f)| f.name == name)
    }

    /// Resolve a struct shape to its field list, following a seq
    /// back-reference if the occurrence is empty.
    pub(crate) fn shape_fields<'a>(&'a self, shape: &'a StructShape) -> Result<&'a [Field]> {
        if !shape.fields.is_empty() || shape.seq == 0 {
            return Ok(&shape.fields);
        }
        self.shapes
            .get(&shape.seq)
            .map(|f| f.as_slice())
            .ok_or_else(|| Error::store(format!("unknown struct shape seq {}", shape.seq)))
    }

    /// The scan kinds of an index: per index field, the key-encoded kind
    /// (for an indexed slice field, its element kind).
    pub(crate) fn index_kinds<'a>(&'a self, idx: &IndexSchema) -> Result<Vec<&'a Kind>> {
        idx.fields
            .iter()
            .map(|name| {
                let (_, f) = self
                    .field(name)
                    .ok_or_else(|| Error::store(format!("index field {name} missing")))?;
                Ok(match &f.typ.kind {
                    Kind::List(elem) => &elem.kind,
                    k => k,
                })
            })
            .collect()
    }

    /// Rebuild the derived runtime state after load or gather: the shape
    /// table, the reference summary, and parsed default values.
    pub(crate) fn prepare(&mut self, name: &str) -> Result<()> {
        self.name = name.to_string();
        self.references = BTreeSet::new();
        for f in &self.fields {
            for r in &f.references {
                self.references.insert(r.clone());
            }
        }
        let fields = std::mem::take(&mut self.fields);
        self.fields = prepare_defaults(fields)?;
        self.shapes = HashMap::new();
        if self.ondisk_version == ONDISK_V2 {
            self.shapes.insert(1, self.fields.clone());
            let mut shapes = HashMap::new();
            collect_shapes(&self.fields, &mut shapes)?;
            for (seq, fields) in shapes {
                self.shapes.insert(seq, fields);
            }
        }
        Ok(())
    }
}

fn collect_shapes(fields: &[Field], shapes: &mut HashMap<u32, Vec<Field>>) -> Result<()> {
    for f in fields {
        collect_type_shapes(&f.typ, shapes)?;
    }
    Ok(())
}

fn collect_type_shapes(ft: &FieldType, shapes: &mut HashMap<u32, Vec<Field>>) -> Result<()> {
    match &ft.kind {
        Kind::List(elem) | Kind::Array(_, elem) => collect_type_shapes(elem, shapes),
        Kind::Map(k, v) => {
            collect_type_shapes(k, shapes)?;
            collect_type_shapes(v, shapes)
        }
        Kind::Struct(shape) => {
            if shape.fields.is_empty() {
                return Ok(()); // back-reference; resolved via the table
            }
            if shape.seq != 0 && shapes.insert(shape.seq, shape.fields.clone()).is_some() {
                return Err(Error::store(format!(
                    "duplicate struct shape seq {}",
                    shape.seq
                )));
            }
            collect_shapes(&shape.fields, shapes)
        }
        _ => Ok(()),
    }
}

/// Parse default literals into values, recursing into nested struct shapes.
/// The `now` sentinel for time fields stays unparsed; it is evaluated per
/// operation against the database clock.
fn prepare_defaults(mut fields: Vec<Field>) -> Result<Vec<Field>> {
    for f in &mut fields {
        if !f.default.is_empty() && !(matches!(f.typ.kind, Kind::Time) && f.default == "now") {
            f.default_value = Some(parse_default(&f.typ.kind, &f.default)?);
        }
        if let Kind::Struct(shape) = &mut f.typ.kind {
            let inner = std::mem::take(&mut shape.fields);
            shape.fields = prepare_defaults(inner)?;
        }
        if let Kind::List(elem) | Kind::Array(_, elem) = &mut f.typ.kind {
            if let Kind::Struct(shape) = &mut elem.kind {
                let inner = std::mem::take(&mut shape.fields);
                shape.fields = prepare_defaults(inner)?;
            }
        }
    }
    Ok(fields)
}

/// Parse a `default` tag literal for a field kind.
pub(crate) fn parse_default(kind: &Kind, s: &str) -> Result<Value> {
    let bad = || Error::typ(format!("bad default value {:?} for {}", s, kind.name()));
    match kind {
        Kind::Bool => match s {
            "true" => Ok(Value::Bool(true)),
            "false" => Ok(Value::Bool(false)),
            _ => Err(bad()),
        },
        k if k.is_sint() => {
            let v: i64 = s.parse().map_err(|_| bad())?;
            let (lo, hi) = k.sint_range();
            if v < lo || v > hi {
                return Err(bad());
            }
            Ok(Value::Int(v))
        }
        k if k.is_uint() => {
            let v: u64 = s.parse().map_err(|_| bad())?;
            if v > k.uint_max() {
                return Err(bad());
            }
            Ok(Value::Uint(v))
        }
        Kind::Float32 | Kind::Float64 => Ok(Value::Float(s.parse().map_err(|_| bad())?)),
        Kind::String => Ok(Value::String(s.to_string())),
        Kind::Time => {
            let t: DateTime<Utc> = DateTime::parse_from_rfc3339(s)
                .map_err(|_| bad())?
                .with_timezone(&Utc);
            Ok(Value::Time(t))
        }
        _ => Err(Error::typ(format!(
            "default not supported for {} fields",
            kind.name()
        ))),
    }
}

/// Key and value for the `types` bucket: 4-byte big-endian version, JSON
/// payload.
pub(crate) fn pack_schema(tv: &TypeVersion) -> Result<(Vec<u8>, Vec<u8>)> {
    if tv.ondisk_version != ONDISK_V1 && tv.ondisk_version != ONDISK_V2 {
        return Err(Error::store(format!(
            "unsupported ondisk version {}",
            tv.ondisk_version
        )));
    }
    let v = serde_json::to_vec(tv)?;
    Ok((tv.version.to_be_bytes().to_vec(), v))
}

/// Parse a `types` bucket entry, validating the key against the payload.
pub(crate) fn parse_schema(name: &str, bk: &[u8], bv: &[u8]) -> Result<TypeVersion> {
    let key: [u8; 4] = bk
        .try_into()
        .map_err(|_| Error::store("schema version key must be 4 bytes"))?;
    let version = u32::from_be_bytes(key);
    let mut tv: TypeVersion = serde_json::from_slice(bv)?;
    if tv.version != version {
        return Err(Error::store(format!(
            "schema version {} does not match key {}",
            tv.version, version
        )));
    }
    if tv.ondisk_version != ONDISK_V1 && tv.ondisk_version != ONDISK_V2 {
        return Err(Error::store(format!(
            "unsupported ondisk version {}",
            tv.ondisk_version
        )));
    }
    tv.prepare(name)?;
    Ok(tv)
}

/// Structural equality of two typeVersions: fields (names, types, tags),
/// noauto and indices. `referenced_by` is excluded; changes to it version
/// the type explicitly.
pub(crate) fn type_equal(a: &TypeVersion, b: &TypeVersion) -> bool {
    a.ondisk_version == b.ondisk_version
        && a.noauto == b.noauto
        && fields_equal(&a.fields, &b.fields)
        && a.indices.len() == b.indices.len()
        && a.indices.iter().all(|(name, ia)| {
            b.indices
                .get(name)
                .is_some_and(|ib| ia.unique == ib.unique && ia.fields == ib.fields)
        })
}

fn fields_equal(a: &[Field], b: &[Field]) -> bool {
    a.len() == b.len()
        && a.iter().zip(b).all(|(fa, fb)| {
            fa.name == fb.name
                && fa.nonzero == fb.nonzero
                && fa.references == fb.references
                && fa.default == fb.default
                && field_type_equal(&fa.typ, &fb.typ)
        })
}

fn field_type_equal(a: &FieldType, b: &FieldType) -> bool {
    if a.ptr != b.ptr {
        return false;
    }
    match (&a.kind, &b.kind) {
        (Kind::List(ea), Kind::List(eb)) => field_type_equal(ea, eb),
        (Kind::Array(na, ea), Kind::Array(nb, eb)) => na == nb && field_type_equal(ea, eb),
        (Kind::Map(ka, va), Kind::Map(kb, vb)) => {
            field_type_equal(ka, kb) && field_type_equal(va, vb)
        }
        (Kind::Struct(sa), Kind::Struct(sb)) => {
            sa.seq == sb.seq && fields_equal(&sa.fields, &sb.fields)
        }
        (ka, kb) => std::mem::discriminant(ka) == std::mem::discriminant(kb),
    }
}

/// Check that a field type may evolve into another. Returns whether the
/// change widens a fixed-width key encoding, which forces a rebuild of every
/// index containing the field.
pub(crate) fn compatible(old: &FieldType, new: &FieldType) -> Result<bool> {
    // Pointer to non-pointer is forbidden when a nested field demands
    // nonzero: nil values would silently become zero values.
    if old.ptr && !new.ptr && has_nonzero_field(&new.kind) {
        return Err(Error::Incompatible(
            "pointer to non-pointer change over nonzero fields".into(),
        ));
    }

    let widened = |ks: &[&Kind]| -> Result<bool> {
        for k in ks {
            if std::mem::discriminant(*k) == std::mem::discriminant(&new.kind) {
                return Ok(true);
            }
        }
        Err(Error::Incompatible(format!(
            "cannot change {} into {}",
            old.kind.name(),
            new.kind.name()
        )))
    };

    match &old.kind {
        k if std::mem::discriminant(k) == std::mem::discriminant(&new.kind) => match (k, &new.kind)
        {
            (Kind::List(oe), Kind::List(ne)) => {
                compatible(oe, ne)?;
                Ok(false)
            }
            (Kind::Array(on, oe), Kind::Array(nn, ne)) => {
                if on != nn {
                    return Err(Error::Incompatible("array length change".into()));
                }
                compatible(oe, ne)?;
                Ok(false)
            }
            (Kind::Map(ok, ov), Kind::Map(nk, nv)) => {
                compatible(ok, nk)?;
                compatible(ov, nv)?;
                Ok(false)
            }
            (Kind::Struct(os), Kind::Struct(ns)) => {
                for nf in &ns.fields {
                    if let Some(of) = os.fields.iter().find(|of| of.name == nf.name) {
                        compatible(&of.typ, &nf.typ)?;
                    }
                }
                Ok(false)
            }
            _ => Ok(false),
        },
        Kind::Int8 => widened(&[&Kind::Int16, &Kind::Int32, &Kind::Int, &Kind::Int64]),
        Kind::Int16 => widened(&[&Kind::Int32, &Kind::Int, &Kind::Int64]),
        Kind::Int32 | Kind::Int => widened(&[&Kind::Int32, &Kind::Int, &Kind::Int64]),
        Kind::Uint8 => widened(&[&Kind::Uint16, &Kind::Uint32, &Kind::Uint, &Kind::Uint64]),
        Kind::Uint16 => widened(&[&Kind::Uint32, &Kind::Uint, &Kind::Uint64]),
        Kind::Uint32 | Kind::Uint => widened(&[&Kind::Uint32, &Kind::Uint, &Kind::Uint64]),
        k => Err(Error::Incompatible(format!(
            "cannot change {} into {}",
            k.name(),
            new.kind.name()
        ))),
    }
}

/// Enforce `nonzero` constraints on a record's values: recursively into
/// nested structs and slice elements, not into map values, not through nil
/// pointers.
pub(crate) fn check_nonzero(tv: &TypeVersion, fields: &[Field], values: &[Value]) -> Result<()> {
    for (f, v) in fields.iter().zip(values) {
        if f.nonzero && v.is_zero_for(&f.typ) {
            return Err(Error::Zero(format!("field {:?} has zero value", f.name)));
        }
        match (&f.typ.kind, v) {
            (Kind::Struct(shape), Value::Struct(vals)) => {
                check_nonzero(tv, tv.shape_fields(shape)?, vals)?;
            }
            (Kind::List(e) | Kind::Array(_, e), Value::List(elems)) => {
                if let Kind::Struct(shape) = &e.kind {
                    let inner = tv.shape_fields(shape)?;
                    for elem in elems {
                        if let Value::Struct(vals) = elem {
                            check_nonzero(tv, inner, vals)?;
                        }
                    }
                }
            }
            _ => {}
        }
    }
    Ok(())
}

/// Whether a kind has a `nonzero` field anywhere reachable without crossing
/// a pointer.
pub(crate) fn has_nonzero_field(kind: &Kind) -> bool {
    match kind {
        Kind::List(e) | Kind::Array(_, e) => !e.ptr && has_nonzero_field(&e.kind),
        Kind::Map(_, v) => !v.ptr && has_nonzero_field(&v.kind),
        Kind::Struct(shape) => shape
            .fields
            .iter()
            .any(|f| f.nonzero || (!f.typ.ptr && has_nonzero_field(&f.typ.kind))),
        _ => false,
    }
}

#[cfg(test)]
pub(crate) fn version_for_tests(fields: Vec<Field>) -> TypeVersion {
    let has_struct = fields.iter().any(|f| matches!(f.typ.kind, Kind::Struct(_)));
    let mut tv = TypeVersion {
        version: 1,
        ondisk_version: if has_struct { ONDISK_V2 } else { ONDISK_V1 },
        noauto: false,
        fields,
        indices: BTreeMap::new(),
        referenced_by: BTreeSet::new(),
        name: String::new(),
        shapes: HashMap::new(),
        references: BTreeSet::new(),
    };
    tv.prepare("test").unwrap();
    tv
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FieldType;

    fn ft(kind: Kind) -> FieldType {
        FieldType::plain(kind)
    }

    #[test]
    fn int_widening_is_compatible_and_rebuilds() {
        assert!(compatible(&ft(Kind::Int8), &ft(Kind::Int32)).unwrap());
        assert!(compatible(&ft(Kind::Uint16), &ft(Kind::Uint64)).unwrap());
        assert!(!compatible(&ft(Kind::Int32), &ft(Kind::Int32)).unwrap());
        // Width-agnostic and explicit 32-bit are interchangeable.
        assert!(compatible(&ft(Kind::Int), &ft(Kind::Int32)).unwrap());
    }

    #[test]
    fn narrowing_and_sign_changes_are_incompatible() {
        assert!(compatible(&ft(Kind::Int32), &ft(Kind::Int16)).is_err());
        assert!(compatible(&ft(Kind::Int32), &ft(Kind::Uint32)).is_err());
        assert!(compatible(&ft(Kind::Uint64), &ft(Kind::Uint32)).is_err());
        assert!(compatible(&ft(Kind::Float32), &ft(Kind::Float64)).is_err());
        assert!(compatible(&ft(Kind::String), &ft(Kind::Bytes)).is_err());
    }

    #[test]
    fn ptr_flip_allowed_unless_nonzero_underneath(){
        let plain = ft(Kind::Int32);
        let ptr = FieldType::ptr(Kind::Int32);
        assert!(compatible(&ptr, &plain).is_ok());
        assert!(compatible(&plain, &ptr).is_ok());

        let mut inner = Field::new("A", ft(Kind::String), "");
        inner.nonzero = true;
        let shape = Kind::Struct(StructShape::new(vec![inner]));
        let sptr = FieldType::ptr(shape.clone());
        let splain = ft(shape);
        assert!(matches!(
            compatible(&sptr, &splain),
            Err(Error::Incompatible(_))
        ));
    }

    #[test]
    fn nonzero_list_accepts_zero_valued_elements() {
        let mut tags = Field::new(
            "Tags",
            FieldType::plain(Kind::List(Box::new(FieldType::plain(Kind::String)))),
            "",
        );
        tags.nonzero = true;
        let tv = version_for_tests(vec![Field::new("ID", ft(Kind::Int64), ""), tags]);

        // A slice with an element satisfies nonzero even when the element
        // itself is a zero value; only an empty slice is zero.
        let held = vec![
            Value::Int(1),
            Value::List(vec![Value::String(String::new())]),
        ];
        assert!(check_nonzero(&tv, &tv.fields, &held).is_ok());

        let empty = vec![Value::Int(1), Value::List(vec![])];
        assert!(matches!(
            check_nonzero(&tv, &tv.fields, &empty),
            Err(Error::Zero(_))
        ));
    }

    #[test]
    fn schema_json_round_trip() {
        let tv = version_for_tests(vec![
            Field::new("ID", ft(Kind::Int64), ""),
            Field::new("Name", ft(Kind::String), ""),
        ]);
        let (k, v) = pack_schema(&tv).unwrap();
        let got = parse_schema("test", &k, &v).unwrap();
        assert!(type_equal(&tv, &got));
        assert_eq!(got.version, tv.version);
    }

    #[test]
    fn schema_key_mismatch_is_store_error() {
        let tv = version_for_tests(vec![Field::new("ID", ft(Kind::Int64), "")]);
        let (_, v) = pack_schema(&tv).unwrap();
        let bad_key = 9u32.to_be_bytes();
        assert!(matches!(
            parse_schema("test", &bad_key, &v),
            Err(Error::Store(_))
        ));
    }
}
