//! # Index Manager
//!
//! Computes index keys for records and keeps index buckets consistent with
//! record mutations: obsolete keys removed, new keys added, uniqueness
//! enforced by prefix comparison, reference integrity checked against and
//! from the indexed back-pointers.
//!
//! An index key is the encoded indexed fields followed by the primary key;
//! the byte length before the PK is the prefix. Two records collide on a
//! unique index iff their prefixes are equal. For an indexed slice field one
//! key is emitted per element; the PK suffix keeps equal elements of one
//! record at one physical key.

use std::ops::Bound;

use crate::encoding::key::{pack_index_field, pack_pk, prefix_successor};
use crate::error::{Error, Result};
use crate::schema::{IndexSchema, TypeVersion};
use crate::stats::Stats;
use crate::store::{bucket, RawTx};
use crate::types::{Kind, Value};

/// One computed index entry: the full key and its pre-PK prefix length.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct IndexKey {
    pub key: Vec<u8>,
    pub prefix: usize,
}

/// All index keys of one record for one index. An indexed slice field fans
/// out per element; an empty slice produces no entries.
pub(crate) fn index_keys(
    tv: &TypeVersion,
    idx: &IndexSchema,
    values: &[Value],
    pk: &[u8],
) -> Result<Vec<IndexKey>> {
    let mut bufs: Vec<Vec<u8>> = vec![Vec::with_capacity(idx.fields.len() * 8 + pk.len())];
    for name in &idx.fields {
        let (i, f) = tv
            .field(name)
            .ok_or_else(|| Error::store(format!("index field {name} missing from schema")))?;
        let v = &values[i];
        match (&f.typ.kind, v) {
            (Kind::List(elem), Value::List(elems)) => {
                let mut next = Vec::with_capacity(bufs.len() * elems.len());
                for buf in &bufs {
                    for ev in elems {
                        let mut b = buf.clone();
                        pack_index_field(&elem.kind, ev, &mut b)?;
                        next.push(b);
                    }
                }
                bufs = next;
            }
            (kind, v) => {
                for buf in &mut bufs {
                    pack_index_field(kind, v, buf)?;
                }
            }
        }
    }
    let mut out: Vec<IndexKey> = bufs
        .into_iter()
        .map(|mut buf| {
            let prefix = buf.len();
            buf.extend_from_slice(pk);
            IndexKey { key: buf, prefix }
        })
        .collect();
    // Equal slice elements within one record collapse to one physical key.
    out.sort();
    out.dedup();
    Ok(out)
}

/// Fail with `Unique` when any existing key in the index bucket shares the
/// prefix of `ik` but is not `ik` itself.
pub(crate) fn check_unique(
    raw: &RawTx,
    stats: &mut Stats,
    type_name: &str,
    index_name: &str,
    ik: &IndexKey,
) -> Result<()> {
    let b = bucket::index(type_name, index_name);
    let prefix = &ik.key[..ik.prefix];
    let upper = prefix_successor(prefix);
    let upper_bound = match &upper {
        Some(u) => Bound::Excluded(u.as_slice()),
        None => Bound::Unbounded,
    };
    stats.index.cursor += 1;
    for (k, _) in raw.seek(&b, Bound::Included(prefix), upper_bound, false, 2)? {
        if k != ik.key {
            return Err(Error::Unique(format!(
                "duplicate value on index {type_name}.{index_name}"
            )));
        }
    }
    Ok(())
}

/// Bring all index buckets in line with a record change. `old` is `None` for
/// inserts, `new` is `None` for deletes.
pub(crate) fn update_indices(
    raw: &RawTx,
    stats: &mut Stats,
    tv: &TypeVersion,
    pk: &[u8],
    old: Option<&[Value]>,
    new: Option<&[Value]>,
) -> Result<()> {
    for (iname, idx) in &tv.indices {
        let old_keys = match old {
            Some(values) => index_keys(tv, idx, values, pk)?,
            None => Vec::new(),
        };
        let new_keys = match new {
            Some(values) => index_keys(tv, idx, values, pk)?,
            None => Vec::new(),
        };
        let b = bucket::index(&tv.name, iname);
        for ik in old_keys.iter().filter(|k| !new_keys.contains(*k)) {
            stats.index.delete += 1;
            if !raw.delete(&b, &ik.key)? {
                return Err(Error::store(format!(
                    "missing index key during update of {}.{}",
                    tv.name, iname
                )));
            }
        }
        for ik in new_keys.iter().filter(|k| !old_keys.contains(*k)) {
            if idx.unique {
                check_unique(raw, stats, &tv.name, iname, ik)?;
            }
            stats.index.put += 1;
            raw.put(&b, &ik.key, &[])?;
        }
    }
    Ok(())
}

/// Check every non-zero `ref` field of a record against the referenced
/// type's records bucket.
pub(crate) fn check_references(
    raw: &RawTx,
    stats: &mut Stats,
    tv: &TypeVersion,
    values: &[Value],
) -> Result<()> {
    for (i, f) in tv.fields.iter().enumerate() {
        if f.references.is_empty() {
            continue;
        }
        let v = &values[i];
        if v.is_zero() {
            continue;
        }
        for target in &f.references {
            let pk = pack_pk(&f.typ.kind, v)?;
            stats.records.get += 1;
            if raw.get(&bucket::records(target), &pk)?.is_none() {
                return Err(Error::Reference(format!(
                    "{}.{} references absent {} record",
                    tv.name, f.name, target
                )));
            }
        }
    }
    Ok(())
}

/// Refuse deletion of a record that any other type still points at: scan
/// each referencing type's back-pointer index for a key whose field fragment
/// equals the deleted primary key.
pub(crate) fn check_referenced_by(
    raw: &RawTx,
    stats: &mut Stats,
    tv: &TypeVersion,
    referencing: &[(String, String, Kind)], // (type, index, field kind)
    pk_value: &Value,
) -> Result<()> {
    for (rname, iname, kind) in referencing {
        let mut prefix = Vec::new();
        pack_index_field(kind, pk_value, &mut prefix)?;
        let b = bucket::index(rname, iname);
        let upper = prefix_successor(&prefix);
        let upper_bound = match &upper {
            Some(u) => Bound::Excluded(u.as_slice()),
            None => Bound::Unbounded,
        };
        stats.index.cursor += 1;
        if !raw
            .seek(&b, Bound::Included(prefix.as_slice()), upper_bound, false, 1)?
            .is_empty()
        {
            return Err(Error::Reference(format!(
                "{} record still referenced by {}",
                tv.name, rname
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::version_for_tests;
    use crate::types::{Field, FieldType};
    use std::collections::BTreeMap;

    fn indexed_version() -> (TypeVersion, IndexSchema) {
        let mut tv = version_for_tests(vec![
            Field::new("ID", FieldType::plain(Kind::Int64), ""),
            Field::new("Name", FieldType::plain(Kind::String), ""),
            Field::new(
                "Tags",
                FieldType::plain(Kind::List(Box::new(FieldType::plain(Kind::String)))),
                "",
            ),
        ]);
        let idx = IndexSchema {
            unique: false,
            fields: vec!["Name".into()],
        };
        let mut indices = BTreeMap::new();
        indices.insert("Name".to_string(), idx.clone());
        tv.indices = indices;
        (tv, idx)
    }

    #[test]
    fn key_is_prefix_plus_pk() {
        let (tv, idx) = indexed_version();
        let values = vec![
            Value::Int(7),
            Value::String("ab".into()),
            Value::List(vec![]),
        ];
        let pk = pack_pk(&Kind::Int64, &values[0]).unwrap();
        let keys = index_keys(&tv, &idx, &values, &pk).unwrap();
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].prefix, 3); // "ab" + terminator
        assert!(keys[0].key.ends_with(&pk));
    }

    #[test]
    fn slice_index_fans_out_and_dedups() {
        let (tv, _) = indexed_version();
        let idx = IndexSchema {
            unique: false,
            fields: vec!["Tags".into()],
        };
        let values = vec![
            Value::Int(7),
            Value::String("x".into()),
            Value::List(vec![
                Value::String("a".into()),
                Value::String("b".into()),
                Value::String("a".into()),
            ]),
        ];
        let pk = pack_pk(&Kind::Int64, &values[0]).unwrap();
        let keys = index_keys(&tv, &idx, &values, &pk).unwrap();
        assert_eq!(keys.len(), 2); // "a" deduped

        let empty = vec![Value::Int(7), Value::String("x".into()), Value::List(vec![])];
        assert!(index_keys(&tv, &idx, &empty, &pk).unwrap().is_empty());
    }
}
