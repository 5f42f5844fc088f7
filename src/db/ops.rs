//! # Record Operations
//!
//! Insert/get/update/delete at the typed-record level, orchestrating the
//! codec, the index manager and the reference manager. These work on dynamic
//! values; the typed wrappers on [`Tx`] convert through the `Record` trait.
//!
//! Inserts substitute configured defaults for zero values (recursively into
//! nested structs and slice elements, not into maps), auto-assign zero
//! integer primary keys from the type's sequence, and keep the sequence at
//! or above every explicitly inserted key.

use std::sync::Arc;

use tracing::trace;

use crate::db::Tx;
use crate::encoding::key::{pack_pk, KeyBuf};
use crate::encoding::record::pack_record;
use crate::error::{Error, Result};
use crate::index;
use crate::schema::registry::StoreType;
use crate::schema::{check_nonzero, TypeVersion};
use crate::store::bucket;
use crate::types::{Field, Kind, Value};

/// Insert a record; `values` is updated in place with assigned defaults and
/// primary key.
pub(crate) fn insert(tx: &mut Tx<'_>, st: &Arc<StoreType>, values: &mut Vec<Value>) -> Result<()> {
    tx.check()?;
    tx.require_writable()?;
    let tv = st.current.clone();
    if values.len() != tv.fields.len() {
        return Err(Error::param(format!(
            "got {} values for {} fields of {}",
            values.len(),
            tv.fields.len(),
            tv.name
        )));
    }

    apply_defaults(tx, &tv, &tv.fields, values)?;
    for (f, v) in tv.fields.iter().zip(values.iter()) {
        v.validate(&f.typ)?;
    }
    check_nonzero(&tv, &tv.fields, values)?;

    assign_pk(tx, &tv, values)?;
    let pk = pack_pk(&tv.pk().typ.kind, &values[0])?;

    tx.stats.records.get += 1;
    if tx.raw.get(&bucket::records(&tv.name), &pk)?.is_some() {
        return Err(Error::Unique(format!(
            "duplicate primary key for {}",
            tv.name
        )));
    }
    index::check_references(&tx.raw, &mut tx.stats, &tv, values)?;

    let data = pack_record(&tv, values)?;
    tx.guard_mutation(|tx| {
        index::update_indices(&tx.raw, &mut tx.stats, &tv, &pk, None, Some(values.as_slice()))?;
        tx.stats.records.put += 1;
        tx.raw.put(&bucket::records(&tv.name), &pk, &data)
    })?;
    tx.stats.insert += 1;
    tx.mutations += 1;
    trace!(type_name = %tv.name, "inserted record");
    Ok(())
}

/// Fetch one record by primary key, shaped per the current schema.
pub(crate) fn get(tx: &mut Tx<'_>, st: &Arc<StoreType>, pk_value: &Value) -> Result<Vec<Value>> {
    tx.check()?;
    let tv = &st.current;
    let pk = pk_bytes(tv, pk_value)?;
    tx.stats.records.get += 1;
    tx.stats.get += 1;
    let data = tx
        .raw
        .get(&bucket::records(&tv.name), &pk)?
        .ok_or_else(|| Error::Absent(format!("{} record", tv.name)))?;
    st.decode(&pk, &data)
}

/// Replace the stored record with the same primary key, maintaining index
/// entries and references.
pub(crate) fn update(tx: &mut Tx<'_>, st: &Arc<StoreType>, values: &[Value]) -> Result<()> {
    tx.check()?;
    tx.require_writable()?;
    let tv = st.current.clone();
    if values.len() != tv.fields.len() {
        return Err(Error::param(format!(
            "got {} values for {} fields of {}",
            values.len(),
            tv.fields.len(),
            tv.name
        )));
    }
    for (f, v) in tv.fields.iter().zip(values.iter()) {
        v.validate(&f.typ)?;
    }
    check_nonzero(&tv, &tv.fields, values)?;
    if values[0].is_zero() {
        return Err(Error::param("cannot update record with zero primary key"));
    }

    let pk = pack_pk(&tv.pk().typ.kind, &values[0])?;
    tx.stats.records.get += 1;
    let old_data = tx
        .raw
        .get(&bucket::records(&tv.name), &pk)?
        .ok_or_else(|| Error::Absent(format!("{} record", tv.name)))?;
    let old_values = st.decode(&pk, &old_data)?;

    index::check_references(&tx.raw, &mut tx.stats, &tv, values)?;

    let data = pack_record(&tv, values)?;
    tx.guard_mutation(|tx| {
        index::update_indices(
            &tx.raw,
            &mut tx.stats,
            &tv,
            &pk,
            Some(&old_values),
            Some(values),
        )?;
        tx.stats.records.put += 1;
        tx.raw.put(&bucket::records(&tv.name), &pk, &data)
    })?;
    tx.stats.update += 1;
    tx.mutations += 1;
    Ok(())
}

/// Delete a record by primary key, refusing while other records reference
/// it.
pub(crate) fn delete(tx: &mut Tx<'_>, st: &Arc<StoreType>, pk_value: &Value) -> Result<()> {
    tx.check()?;
    tx.require_writable()?;
    let tv = st.current.clone();
    let pk = pk_bytes(&tv, pk_value)?;
    tx.stats.records.get += 1;
    let old_data = tx
        .raw
        .get(&bucket::records(&tv.name), &pk)?
        .ok_or_else(|| Error::Absent(format!("{} record", tv.name)))?;
    let old_values = st.decode(&pk, &old_data)?;

    let referencing = referencing_indices(tx, &tv)?;
    index::check_referenced_by(&tx.raw, &mut tx.stats, &tv, &referencing, pk_value)?;

    tx.guard_mutation(|tx| {
        index::update_indices(&tx.raw, &mut tx.stats, &tv, &pk, Some(&old_values), None)?;
        tx.stats.records.delete += 1;
        tx.raw.delete(&bucket::records(&tv.name), &pk)?;
        Ok(())
    })?;
    tx.stats.delete += 1;
    tx.mutations += 1;
    Ok(())
}

/// The back-pointer indices that can veto deleting a record of `tv`:
/// (referencing type, index name, indexed field kind).
pub(crate) fn referencing_indices(
    tx: &Tx<'_>,
    tv: &TypeVersion,
) -> Result<Vec<(String, String, Kind)>> {
    let mut out = Vec::new();
    let registry = tx.db.registry.read();
    for rname in &tv.referenced_by {
        let rst = registry.get_name(rname)?;
        for f in &rst.current.fields {
            if f.references.iter().any(|r| r == &tv.name) {
                out.push((
                    rname.clone(),
                    format!("{}:{}", f.name, tv.name),
                    f.typ.kind.clone(),
                ));
            }
        }
    }
    Ok(out)
}

pub(crate) fn pk_bytes(tv: &TypeVersion, pk_value: &Value) -> Result<KeyBuf> {
    if pk_value.is_zero() {
        return Err(Error::param(format!(
            "zero primary key for {}",
            tv.name
        )));
    }
    pack_pk(&tv.pk().typ.kind, pk_value)
}

/// Substitute defaults for zero values on insert. `now` evaluates the
/// database clock once per substitution.
fn apply_defaults(
    tx: &Tx<'_>,
    tv: &TypeVersion,
    fields: &[Field],
    values: &mut [Value],
) -> Result<()> {
    for (f, v) in fields.iter().zip(values.iter_mut()) {
        if v.is_zero_for(&f.typ) && !matches!(v, Value::Null) {
            if let Some(d) = &f.default_value {
                *v = d.clone();
            } else if f.default == "now" && matches!(f.typ.kind, Kind::Time) {
                *v = Value::Time((tx.db.clock)());
            }
        }
        match (&f.typ.kind, v) {
            (Kind::Struct(shape), Value::Struct(vals)) => {
                apply_defaults(tx, tv, tv.shape_fields(shape)?, vals)?;
            }
            (Kind::List(e) | Kind::Array(_, e), Value::List(elems)) => {
                if let Kind::Struct(shape) = &e.kind {
                    let inner = tv.shape_fields(shape)?;
                    for elem in elems {
                        if let Value::Struct(vals) = elem {
                            apply_defaults(tx, tv, inner, vals)?;
                        }
                    }
                }
            }
            _ => {}
        }
    }
    Ok(())
}

/// Zero integer primary keys get the next sequence value; explicit keys pull
/// the sequence up so it never hands out a duplicate.
fn assign_pk(tx: &mut Tx<'_>, tv: &TypeVersion, values: &mut [Value]) -> Result<()> {
    let kind = &tv.pk().typ.kind;
    if values[0].is_zero() {
        if tv.noauto || !kind.is_int() {
            return Err(Error::Zero(format!(
                "primary key for {} cannot have the zero value",
                tv.name
            )));
        }
        let seq = tx.raw.next_sequence(&tv.name)?;
        let max = if kind.is_sint() {
            kind.sint_range().1 as u64
        } else {
            kind.uint_max()
        };
        if seq > max {
            return Err(Error::Seq(format!(
                "next key {} exceeds {} primary key range of {}",
                seq,
                kind.name(),
                tv.name
            )));
        }
        values[0] = if kind.is_sint() {
            Value::Int(seq as i64)
        } else {
            Value::Uint(seq)
        };
        return Ok(());
    }
    let explicit = match &values[0] {
        Value::Int(v) if *v > 0 => Some(*v as u64),
        Value::Uint(v) => Some(*v),
        _ => None,
    };
    if let (true, Some(v)) = (kind.is_int(), explicit) {
        if v > tx.raw.sequence(&tv.name)? {
            tx.raw.set_sequence(&tv.name, v)?;
        }
    }
    Ok(())
}
