//! # Type Registry
//!
//! Runtime per-open state: for every registered type the declared shape, the
//! loaded chain of typeVersions, and the current one. Registration gathers a
//! candidate typeVersion from the declaration, compares it to the stored
//! current, and drives every consequence of a schema change: persisting the
//! new version, dropping and rebuilding indices, validating fresh `nonzero`
//! and `ref` constraints against existing records, maintaining the
//! `referenced_by` sets of referenced types, and advancing the primary-key
//! sequence when `noauto` goes away.
//!
//! Everything here runs inside one write transaction; the in-memory registry
//! is only swapped after that transaction commits, so a failed registration
//! leaves both the file and the process state untouched.

use std::any::TypeId;
use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;
use std::sync::Arc;

use hashbrown::HashMap;
use tracing::debug;

use super::parse::Tags;
use super::{
    compatible, pack_schema, parse_default, parse_schema, type_equal, IndexSchema, TypeVersion,
    ONDISK_V1, ONDISK_V2,
};
use crate::db::Tx;
use crate::encoding::key::{pack_pk, parse_pk};
use crate::encoding::record::{record_version, unpack_record};
use crate::error::{Error, Result};
use crate::index;
use crate::store::bucket;
use crate::types::{Field, FieldType, Kind, Registration, StructShape, TypeDef, Value};

/// A registered type: declared identity plus all known typeVersions. The
/// type id is absent for schemas loaded only for introspection.
pub(crate) struct StoreType {
    pub name: String,
    pub type_id: Option<TypeId>,
    pub current: Arc<TypeVersion>,
    pub versions: HashMap<u32, Arc<TypeVersion>>,
}

impl StoreType {
    /// Decode a stored record into values shaped per the current version.
    /// The record key is authoritative for the primary key: it survives PK
    /// field renames and width changes that the payload cannot express.
    pub fn decode(&self, key: &[u8], data: &[u8]) -> Result<Vec<Value>> {
        let version = record_version(data)?;
        let origin = self.versions.get(&version).ok_or_else(|| {
            Error::store(format!(
                "record written at unknown {} version {}",
                self.name, version
            ))
        })?;
        let values = unpack_record(origin, data)?;
        let mids = self.mids(origin.version);
        let mut values = migrate_values(origin, &self.current, &mids, values)?;
        values[0] = parse_pk(&self.current.pk().typ.kind, key)?;
        Ok(values)
    }

    /// Versions strictly between `origin` and current, ascending.
    fn mids(&self, origin: u32) -> Vec<&TypeVersion> {
        let mut mids: Vec<&TypeVersion> = self
            .versions
            .values()
            .map(|v| v.as_ref())
            .filter(|v| v.version > origin && v.version < self.current.version)
            .collect();
        mids.sort_by_key(|v| v.version);
        mids
    }
}

/// Per-open registry, stable outside of register/drop.
#[derive(Default)]
pub(crate) struct Registry {
    pub by_name: HashMap<String, Arc<StoreType>>,
    pub by_id: HashMap<TypeId, Arc<StoreType>>,
}

impl Registry {
    pub fn get_id(&self, id: TypeId) -> Result<Arc<StoreType>> {
        self.by_id
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::param("type not registered"))
    }

    pub fn get_name(&self, name: &str) -> Result<Arc<StoreType>> {
        self.by_name
            .get(name)
            .cloned()
            .ok_or_else(|| Error::param(format!("type {name} not registered")))
    }

    fn insert(&mut self, st: Arc<StoreType>) {
        self.by_name.insert(st.name.clone(), st.clone());
        if let Some(id) = st.type_id {
            self.by_id.insert(id, st);
        }
    }

    fn remove(&mut self, name: &str) {
        if let Some(st) = self.by_name.remove(name) {
            if let Some(id) = st.type_id {
                self.by_id.remove(&id);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Gathering a candidate typeVersion from a declaration.

/// Derive a typeVersion (version 0, assigned later) from a declared type,
/// validating the declaration rules.
pub(crate) fn gather(def: &TypeDef) -> Result<TypeVersion> {
    if def.fields.is_empty() {
        return Err(Error::typ("type must have at least one field"));
    }
    let pk_tags = Tags::parse(&def.fields[0].tags, true)?;
    let name = pk_tags.get("typename")?.unwrap_or(&def.name).to_string();
    if name.is_empty() || name.contains('/') {
        return Err(Error::typ(format!("invalid type name {name:?}")));
    }
    let noauto = pk_tags.has("noauto");

    let fields = gather_fields(&def.fields, true, false)?;
    if fields.is_empty() {
        return Err(Error::typ("all fields are skipped"));
    }
    let pk = &fields[0];
    if pk.typ.ptr {
        return Err(Error::typ("primary key cannot be a pointer"));
    }
    if !pk.typ.kind.valid_pk() {
        return Err(Error::typ(format!(
            "kind {} not valid for primary key",
            pk.typ.kind.name()
        )));
    }
    if noauto && !pk.typ.kind.is_int() {
        return Err(Error::typ("noauto is only valid on integer primary keys"));
    }

    let indices = gather_indices(&fields)?;

    let mut fields = fields;
    let ondisk_version = assign_shape_seqs(&mut fields)?;

    let mut tv = TypeVersion {
        version: 0,
        ondisk_version,
        noauto,
        fields,
        indices,
        referenced_by: BTreeSet::new(),
        name: String::new(),
        shapes: HashMap::new(),
        references: BTreeSet::new(),
    };
    tv.prepare(&name)?;
    Ok(tv)
}

fn gather_fields(decl: &[Field], top: bool, in_map: bool) -> Result<Vec<Field>> {
    let mut out = Vec::with_capacity(decl.len());
    let mut names = BTreeSet::new();
    for (i, df) in decl.iter().enumerate() {
        let pk = top && i == 0;
        let tags = Tags::parse(&df.tags, pk)?;
        if tags.has("-") {
            continue;
        }
        if !top
            && (tags.has("index")
                || tags.has("unique")
                || !tags.list("index").is_empty()
                || !tags.list("unique").is_empty())
        {
            return Err(Error::typ(format!(
                "field {:?}: index/unique only allowed on top-level fields",
                df.name
            )));
        }
        let references: Vec<String> = tags.list("ref").iter().map(|s| s.to_string()).collect();
        if !top && !references.is_empty() {
            return Err(Error::typ(format!(
                "field {:?}: ref only allowed on top-level fields",
                df.name
            )));
        }
        let mut seen = BTreeSet::new();
        for r in &references {
            if !seen.insert(r) {
                return Err(Error::typ(format!(
                    "duplicate reference {r:?} on field {:?}",
                    df.name
                )));
            }
        }
        if !references.is_empty() {
            if df.typ.ptr {
                return Err(Error::typ(format!(
                    "field {:?}: cannot have ref on pointer field",
                    df.name
                )));
            }
            if matches!(df.typ.kind, Kind::List(_)) {
                return Err(Error::typ(format!(
                    "field {:?}: cannot have ref on slice field",
                    df.name
                )));
            }
            if !df.typ.kind.valid_index() {
                return Err(Error::typ(format!(
                    "field {:?}: kind {} cannot reference another type",
                    df.name,
                    df.typ.kind.name()
                )));
            }
        }

        let name = tags.get("name")?.unwrap_or(&df.name).to_string();
        if !names.insert(name.clone()) {
            return Err(Error::typ(format!("duplicate field name {name:?}")));
        }
        let nonzero = tags.has("nonzero");
        if pk && nonzero {
            return Err(Error::typ("superfluous nonzero tag on primary key"));
        }

        let default = tags.get("default")?.unwrap_or("").to_string();
        if !default.is_empty() {
            if in_map {
                return Err(Error::typ("cannot have default value inside a map value"));
            }
            let kind = &df.typ.kind;
            if !(matches!(kind, Kind::Time) && default == "now") {
                parse_default(kind, &default)?;
            }
        }

        let typ = gather_field_type(&df.name, &df.typ, in_map)?;

        out.push(Field {
            name,
            typ,
            nonzero,
            references,
            default,
            tags: df.tags.clone(),
            default_value: None,
        });
    }
    Ok(out)
}

fn gather_field_type(fname: &str, ft: &FieldType, in_map: bool) -> Result<FieldType> {
    let kind = match &ft.kind {
        Kind::List(elem) => Kind::List(Box::new(gather_field_type(fname, elem, in_map)?)),
        Kind::Array(n, elem) => Kind::Array(*n, Box::new(gather_field_type(fname, elem, in_map)?)),
        Kind::Map(k, v) => {
            if k.ptr {
                return Err(Error::typ(format!(
                    "field {fname:?}: map key with pointer type not supported"
                )));
            }
            Kind::Map(
                Box::new(gather_field_type(fname, k, true)?),
                Box::new(gather_field_type(fname, v, true)?),
            )
        }
        Kind::Struct(shape) => {
            let fields = gather_fields(&shape.fields, false, in_map)?;
            Kind::Struct(StructShape {
                seq: shape.seq,
                fields,
            })
        }
        k => k.clone(),
    };
    Ok(FieldType { ptr: ft.ptr, kind })
}

fn gather_indices(fields: &[Field]) -> Result<BTreeMap<String, IndexSchema>> {
    let mut indices = BTreeMap::new();

    let mut add = |indices: &mut BTreeMap<String, IndexSchema>,
                   unique: bool,
                   iname: &str,
                   fnames: Vec<String>|
     -> Result<()> {
        if indices.contains_key(iname) {
            return Err(Error::typ(format!("duplicate unique/index {iname:?}")));
        }
        let mut seen = BTreeSet::new();
        let mut slices = 0;
        for fname in &fnames {
            if !seen.insert(fname.clone()) {
                return Err(Error::typ(format!(
                    "duplicate field {fname:?} in unique/index {iname:?}"
                )));
            }
            let f = fields
                .iter()
                .find(|f| &f.name == fname)
                .ok_or_else(|| Error::typ(format!("unknown field {fname:?} in index {iname:?}")))?;
            if f.typ.ptr {
                return Err(Error::typ(format!(
                    "cannot have index/unique on pointer field {fname:?}"
                )));
            }
            match &f.typ.kind {
                k if k.valid_index() => {}
                Kind::List(elem) if !elem.ptr && elem.kind.valid_index() => {
                    if unique {
                        return Err(Error::typ(format!(
                            "cannot have unique index on slice field {fname:?}"
                        )));
                    }
                    slices += 1;
                    if slices > 1 {
                        return Err(Error::typ(format!(
                            "at most one slice field per index, in {iname:?}"
                        )));
                    }
                }
                k => {
                    return Err(Error::typ(format!(
                        "cannot use {} field {fname:?} in index/unique",
                        k.name()
                    )))
                }
            }
        }
        indices.insert(
            iname.to_string(),
            IndexSchema {
                unique,
                fields: fnames,
            },
        );
        Ok(())
    };

    for (i, f) in fields.iter().enumerate() {
        let tags = Tags::parse(&f.tags, i == 0)?;
        if tags.has("unique") {
            add(&mut indices, true, &f.name, vec![f.name.clone()])?;
        }
        if tags.has("index") {
            add(&mut indices, false, &f.name, vec![f.name.clone()])?;
        }
        for (unique, tag) in [(true, "unique"), (false, "index")] {
            for spec in tags.list(tag) {
                let (fspec, iname) = match spec.split_once(' ') {
                    Some((fs, n)) => (fs, n.trim()),
                    None => (spec, spec),
                };
                if iname.is_empty() || iname.contains(' ') {
                    return Err(Error::typ(format!("invalid unique/index {spec:?}")));
                }
                let fnames: Vec<String> = fspec.split('+').map(|s| s.to_string()).collect();
                if fnames[0] != f.name {
                    return Err(Error::typ(format!(
                        "invalid unique/index {iname:?}: first field must be the declaring field {:?}",
                        f.name
                    )));
                }
                add(&mut indices, unique, iname, fnames)?;
            }
        }
    }

    // Reference back-pointer indices, named field:type.
    for f in fields {
        for target in &f.references {
            let iname = format!("{}:{}", f.name, target);
            if let Some(idx) = indices.get(&iname) {
                if idx.fields != [f.name.clone()] {
                    return Err(Error::typ(format!(
                        "reference requires an index, but index {iname:?} with other fields exists"
                    )));
                }
            } else {
                add(&mut indices, false, &iname, vec![f.name.clone()])?;
            }
        }
    }

    Ok(indices)
}

/// Assign struct shape sequence ids in depth-first declaration order (the
/// top-level field list is shape 1) and validate back-references. A
/// back-reference is an empty-field shape whose seq must point at an
/// already-visited shape. Returns the ondisk version: 2 when the graph
/// contains struct shapes, 1 otherwise.
fn assign_shape_seqs(fields: &mut [Field]) -> Result<u32> {
    let mut next = 2u32;
    let mut any = false;
    fn walk(ft: &mut FieldType, next: &mut u32, any: &mut bool) -> Result<()> {
        match &mut ft.kind {
            Kind::List(e) | Kind::Array(_, e) => walk(e, next, any),
            Kind::Map(k, v) => {
                walk(k, next, any)?;
                walk(v, next, any)
            }
            Kind::Struct(shape) => {
                *any = true;
                if shape.fields.is_empty() {
                    if shape.seq == 0 || shape.seq >= *next {
                        return Err(Error::typ(format!(
                            "unresolved struct shape reference (seq {})",
                            shape.seq
                        )));
                    }
                    return Ok(());
                }
                shape.seq = *next;
                *next += 1;
                for f in &mut shape.fields {
                    walk(&mut f.typ, next, any)?;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
    for f in fields {
        walk(&mut f.typ, &mut next, &mut any)?;
    }
    Ok(if any { ONDISK_V2 } else { ONDISK_V1 })
}

// ---------------------------------------------------------------------------
// Registration inside a write transaction.

struct Work {
    type_id: Option<TypeId>,
    tv: TypeVersion,
    versions: HashMap<u32, TypeVersion>,
    old_current: Option<TypeVersion>,
    /// Some(_) when this call created a new structural version: the previous
    /// index set, minus indices already dropped for widening. None for
    /// unchanged types and brand-new types.
    old_indices: Option<BTreeMap<String, IndexSchema>>,
    new_version: bool,
}

/// The registration flow. Returns the finished store types; the caller swaps
/// them into the registry after commit.
pub(crate) fn register_in_tx(tx: &mut Tx<'_>, regs: &[Registration]) -> Result<Vec<StoreType>> {
    let mut works: Vec<Work> = Vec::with_capacity(regs.len());
    let mut order: HashMap<String, usize> = HashMap::new();

    // Gather, load stored versions, decide version numbers, persist new
    // schemas, drop widened indices, advance sequences for dropped noauto.
    for reg in regs {
        let mut tv = gather(&reg.def)?;
        let name = tv.name.clone();
        if order.contains_key(&name) || tx.db_has_type(&name) {
            return Err(Error::param(format!("type {name:?} already registered")));
        }

        let records_b = bucket::records(&name);
        let types_b = bucket::types(&name);
        tx.raw.ensure_bucket(&records_b)?;
        tx.raw.ensure_bucket(&types_b)?;

        let mut versions: HashMap<u32, TypeVersion> = HashMap::new();
        let mut loaded: Vec<(Vec<u8>, Vec<u8>)> = Vec::new();
        tx.raw.for_each(&types_b, |k, v| {
            loaded.push((k.to_vec(), v.to_vec()));
            Ok(())
        })?;
        for (k, v) in loaded {
            let otv = parse_schema(&name, &k, &v)?;
            if versions.insert(otv.version, otv).is_some() {
                return Err(Error::store(format!(
                    "duplicate schema version in {types_b}"
                )));
            }
        }
        let prev = versions
            .values()
            .max_by_key(|v| v.version)
            .cloned();

        let work = match prev {
            Some(prev) if type_equal(&prev, &tv) => {
                tv.version = prev.version;
                tv.referenced_by = prev.referenced_by.clone();
                Work {
                    type_id: Some(reg.type_id),
                    tv,
                    versions,
                    old_current: Some(prev),
                    old_indices: None,
                    new_version: false,
                }
            }
            Some(prev) => {
                tv.version = prev.version + 1;
                tv.referenced_by = prev.referenced_by.clone();
                debug!(type_name = %name, version = tv.version, "new schema version");

                // Permitted evolution check; widened integers force index
                // rebuilds because index keys encode fixed widths.
                let mut recreate: BTreeSet<String> = BTreeSet::new();
                for f in &tv.fields {
                    let Some((_, of)) = prev.field(&f.name) else {
                        continue;
                    };
                    let widened = compatible(&of.typ, &f.typ)
                        .map_err(|e| match e {
                            Error::Incompatible(msg) => {
                                Error::Incompatible(format!("field {:?}: {msg}", f.name))
                            }
                            e => e,
                        })?;
                    if widened {
                        for (iname, idx) in &prev.indices {
                            if idx.fields.contains(&f.name) {
                                recreate.insert(iname.clone());
                            }
                        }
                    }
                }

                // A widened primary key changes the fixed width of every
                // record key and every index-key suffix: rewrite the records
                // bucket and recreate all indices.
                let opk = &prev.pk().typ.kind;
                let npk = &tv.pk().typ.kind;
                if opk.is_int() && npk.is_int() && opk.int_key_width() != npk.int_key_width() {
                    recreate.extend(prev.indices.keys().cloned());
                    let mut rows: Vec<(Vec<u8>, Vec<u8>)> = Vec::new();
                    tx.raw.for_each(&records_b, |k, v| {
                        rows.push((k.to_vec(), v.to_vec()));
                        Ok(())
                    })?;
                    tx.stats.records.cursor += rows.len() as u64;
                    debug!(type_name = %name, rows = rows.len(), "rewriting keys for widened primary key");
                    for (old_key, _) in &rows {
                        tx.stats.records.delete += 1;
                        tx.raw.delete(&records_b, old_key)?;
                    }
                    for (old_key, value) in &rows {
                        let pk_value = parse_pk(opk, old_key)?;
                        let new_key = pack_pk(npk, &pk_value)?;
                        tx.stats.records.put += 1;
                        tx.raw.put(&records_b, &new_key, value)?;
                    }
                }
                for iname in &recreate {
                    debug!(type_name = %name, index = %iname, "dropping index for widened field");
                    tx.raw.delete_bucket(&bucket::index(&name, iname))?;
                }
                let mut old_indices = prev.indices.clone();
                old_indices.retain(|n, _| !recreate.contains(n));

                let (k, v) = pack_schema(&tv)?;
                tx.raw.put(&types_b, &k, &v)?;

                // Autoincrement resumes from the highest stored key when
                // noauto is dropped.
                if prev.noauto && !tv.noauto {
                    tx.stats.records.cursor += 1;
                    if let Some((bk, _)) = tx
                        .raw
                        .seek(&records_b, Bound::Unbounded, Bound::Unbounded, true, 1)?
                        .pop()
                    {
                        let seq = match parse_pk(&tv.pk().typ.kind, &bk)? {
                            Value::Int(v) if v > 0 => v as u64,
                            Value::Uint(v) => v,
                            _ => 0,
                        };
                        if seq > 0 {
                            tx.raw.set_sequence(&name, seq)?;
                            debug!(type_name = %name, seq, "advanced sequence after noauto removal");
                        }
                    }
                }

                Work {
                    type_id: Some(reg.type_id),
                    tv,
                    versions,
                    old_current: Some(prev),
                    old_indices: Some(old_indices),
                    new_version: true,
                }
            }
            None => {
                tv.version = 1;
                debug!(type_name = %name, "registering new type");
                let (k, v) = pack_schema(&tv)?;
                tx.raw.put(&types_b, &k, &v)?;
                Work {
                    type_id: Some(reg.type_id),
                    tv,
                    versions,
                    old_current: None,
                    old_indices: None,
                    new_version: true,
                }
            }
        };
        order.insert(name, works.len());
        works.push(work);
    }

    // Referenced types must be in this same call, with exactly matching key
    // kinds.
    for w in &works {
        for refname in &w.tv.references {
            let Some(&ri) = order.get(refname) else {
                return Err(Error::typ(format!(
                    "type {:?} referenced by {:?} not registered in same call",
                    refname, w.tv.name
                )));
            };
            let rpk = works[ri].tv.pk().typ.kind.clone();
            for f in &w.tv.fields {
                if f.references.iter().any(|r| r == refname)
                    && std::mem::discriminant(&f.typ.kind) != std::mem::discriminant(&rpk)
                {
                    return Err(Error::typ(format!(
                        "{}.{} has kind {}, referenced primary key {}.{} has kind {}",
                        w.tv.name,
                        f.name,
                        f.typ.kind.name(),
                        refname,
                        works[ri].tv.pk().name,
                        rpk.name()
                    )));
                }
            }
        }
    }

    // Maintain referenced_by on referenced types. A reference change always
    // means the referencing type got a new version, so scanning the new
    // versions sees every add/remove.
    let mut rb_changes: Vec<(usize, String, bool)> = Vec::new(); // (target, by, added)
    for w in &works {
        if !w.new_version {
            continue;
        }
        let old_refs: BTreeSet<String> = match &w.old_current {
            Some(otv) => otv
                .fields
                .iter()
                .flat_map(|f| f.references.iter().cloned())
                .collect(),
            None => BTreeSet::new(),
        };
        for added in w.tv.references.difference(&old_refs) {
            rb_changes.push((order[added.as_str()], w.tv.name.clone(), true));
        }
        for removed in old_refs.difference(&w.tv.references) {
            let Some(&ri) = order.get(removed.as_str()) else {
                return Err(Error::typ(format!(
                    "type {:?} no longer referenced by {:?} not registered in same call",
                    removed, w.tv.name
                )));
            };
            rb_changes.push((ri, w.tv.name.clone(), false));
        }
    }
    let mut rb_updated: BTreeSet<usize> = BTreeSet::new();
    for (ti, by, added) in rb_changes {
        let target = &mut works[ti];
        if added {
            if !target.tv.referenced_by.insert(by.clone()) {
                return Err(Error::store(format!(
                    "newly referencing type {by:?} already present in {:?}",
                    target.tv.name
                )));
            }
        } else if !target.tv.referenced_by.remove(&by) {
            return Err(Error::store(format!(
                "previously referencing type {by:?} not present in {:?}",
                target.tv.name
            )));
        }
        rb_updated.insert(ti);
    }
    for ti in rb_updated {
        let w = &mut works[ti];
        if !w.new_version {
            // No structural change in this call: version the type anyway to
            // record the new referenced_by.
            w.tv.version += 1;
        }
        let (k, v) = pack_schema(&w.tv)?;
        tx.raw.put(&bucket::types(&w.tv.name), &k, &v)?;
    }

    // The reverse direction: every type referencing a registered type must
    // itself be registered, or it could not veto deletions.
    for w in &works {
        for rb in &w.tv.referenced_by {
            if !order.contains_key(rb.as_str()) {
                return Err(Error::typ(format!(
                    "must register {:?} that references {:?} in the same call",
                    rb, w.tv.name
                )));
            }
        }
    }

    // Validate new nonzero constraints against existing records.
    for w in &works {
        if !w.new_version {
            continue;
        }
        let Some(otv) = &w.old_current else {
            continue;
        };
        if nonzero_paths(&w.tv.fields, "") == nonzero_paths(&otv.fields, "") {
            continue;
        }
        let mids = mids_of(&w.versions, &w.tv);
        let mut rows = 0u64;
        tx.raw.for_each(&bucket::records(&w.tv.name), |bk, bv| {
            rows += 1;
            let values = decode_work(&w.versions, &w.tv, &mids, bk, bv)?;
            super::check_nonzero(&w.tv, &w.tv.fields, &values)
        })?;
        tx.stats.records.cursor += rows;
    }

    // Validate newly added references against existing records.
    for w in &works {
        if !w.new_version {
            continue;
        }
        let Some(otv) = &w.old_current else {
            continue;
        };
        let added = added_refs(&w.tv, otv);
        if added.is_empty() {
            continue;
        }
        let mids = mids_of(&w.versions, &w.tv);
        let mut checks: Vec<(String, Vec<u8>, String)> = Vec::new();
        tx.raw.for_each(&bucket::records(&w.tv.name), |bk, bv| {
            tx.stats.records.cursor += 1;
            let values = decode_work(&w.versions, &w.tv, &mids, bk, bv)?;
            for (fi, target) in &added {
                let v = &values[*fi];
                if v.is_zero() {
                    continue;
                }
                let pk = pack_pk(&w.tv.fields[*fi].typ.kind, v)?;
                checks.push((target.clone(), pk.to_vec(), w.tv.fields[*fi].name.clone()));
            }
            Ok(())
        })?;
        for (target, pk, fname) in checks {
            tx.stats.records.get += 1;
            if tx.raw.get(&bucket::records(&target), &pk)?.is_none() {
                return Err(Error::Reference(format!(
                    "{}.{} references absent {} record",
                    w.tv.name, fname, target
                )));
            }
        }
    }

    // Drop indices that disappeared or changed shape.
    for w in &works {
        let Some(old_indices) = &w.old_indices else {
            continue;
        };
        for (iname, oidx) in old_indices {
            let keep = w
                .tv
                .indices
                .get(iname)
                .is_some_and(|nidx| nidx.unique == oidx.unique && nidx.fields == oidx.fields);
            if !keep {
                debug!(type_name = %w.tv.name, index = %iname, "dropping index");
                tx.raw.delete_bucket(&bucket::index(&w.tv.name, iname))?;
            }
        }
    }

    // Create new/changed indices: collect all keys, sort, verify uniqueness
    // on adjacent prefixes, insert in order.
    for w in &works {
        if !w.new_version {
            continue;
        }
        let creates: Vec<(&String, &IndexSchema)> = w
            .tv
            .indices
            .iter()
            .filter(|(iname, nidx)| match &w.old_indices {
                None => w.old_current.is_none(),
                Some(old) => !old.get(*iname).is_some_and(|oidx| {
                    oidx.unique == nidx.unique && oidx.fields == nidx.fields
                }),
            })
            .collect();
        if creates.is_empty() {
            continue;
        }
        for (iname, _) in &creates {
            debug!(type_name = %w.tv.name, index = %iname, "creating index");
            tx.raw.ensure_bucket(&bucket::index(&w.tv.name, iname))?;
        }

        let mids = mids_of(&w.versions, &w.tv);
        let mut keys: Vec<Vec<index::IndexKey>> = vec![Vec::new(); creates.len()];
        tx.raw.for_each(&bucket::records(&w.tv.name), |bk, bv| {
            tx.stats.records.cursor += 1;
            let values = decode_work(&w.versions, &w.tv, &mids, bk, bv)?;
            for (i, (_, idx)) in creates.iter().enumerate() {
                keys[i].extend(index::index_keys(&w.tv, idx, &values, bk)?);
            }
            Ok(())
        })?;

        for (i, (iname, idx)) in creates.iter().enumerate() {
            let b = bucket::index(&w.tv.name, iname);
            let mut ks = std::mem::take(&mut keys[i]);
            ks.sort();
            for pair in ks.windows(2) {
                if idx.unique
                    && pair[0].key[..pair[0].prefix] == pair[1].key[..pair[1].prefix]
                {
                    return Err(Error::Unique(format!(
                        "duplicate value on index {}.{}",
                        w.tv.name, iname
                    )));
                }
            }
            for ik in &ks {
                tx.stats.index.put += 1;
                tx.raw.put(&b, &ik.key, &[])?;
            }
        }
    }

    // Freeze into store types; the caller installs them after commit.
    Ok(works
        .into_iter()
        .map(|w| {
            let name = w.tv.name.clone();
            let current = Arc::new(w.tv);
            let mut versions: HashMap<u32, Arc<TypeVersion>> = w
                .versions
                .into_iter()
                .map(|(v, tv)| (v, Arc::new(tv)))
                .collect();
            versions.insert(current.version, current.clone());
            StoreType {
                name,
                type_id: w.type_id,
                current,
                versions,
            }
        })
        .collect())
}

fn mids_of<'w>(
    versions: &'w HashMap<u32, TypeVersion>,
    current: &TypeVersion,
) -> Vec<&'w TypeVersion> {
    let mut mids: Vec<&TypeVersion> = versions
        .values()
        .filter(|v| v.version < current.version)
        .collect();
    mids.sort_by_key(|v| v.version);
    mids
}

fn decode_work(
    versions: &HashMap<u32, TypeVersion>,
    current: &TypeVersion,
    mids: &[&TypeVersion],
    key: &[u8],
    data: &[u8],
) -> Result<Vec<Value>> {
    let version = record_version(data)?;
    let mut values = if version == current.version {
        unpack_record(current, data)?
    } else {
        let origin = versions.get(&version).ok_or_else(|| {
            Error::store(format!(
                "record written at unknown {} version {}",
                current.name, version
            ))
        })?;
        let values = unpack_record(origin, data)?;
        let mids: Vec<&TypeVersion> = mids
            .iter()
            .copied()
            .filter(|v| v.version > origin.version)
            .collect();
        migrate_values(origin, current, &mids, values)?
    };
    values[0] = parse_pk(&current.pk().typ.kind, key)?;
    Ok(values)
}

/// Field name/target pairs of `ref`s present in `ntv` but not on the same
/// field of `otv`, as (field index, target).
fn added_refs(ntv: &TypeVersion, otv: &TypeVersion) -> Vec<(usize, String)> {
    let mut out = Vec::new();
    for (i, f) in ntv.fields.iter().enumerate() {
        for target in &f.references {
            let had = otv
                .field(&f.name)
                .is_some_and(|(_, of)| of.references.iter().any(|r| r == target));
            if !had {
                out.push((i, target.clone()));
            }
        }
    }
    out
}

/// Paths of all nonzero-constrained fields, dotted for nested shapes.
fn nonzero_paths(fields: &[Field], prefix: &str) -> BTreeSet<String> {
    let mut out = BTreeSet::new();
    for f in fields {
        let path = if prefix.is_empty() {
            f.name.clone()
        } else {
            format!("{prefix}.{}", f.name)
        };
        if f.nonzero {
            out.insert(path.clone());
        }
        match &f.typ.kind {
            Kind::Struct(shape) => out.extend(nonzero_paths(&shape.fields, &path)),
            Kind::List(e) | Kind::Array(_, e) => {
                if let Kind::Struct(shape) = &e.kind {
                    out.extend(nonzero_paths(&shape.fields, &path));
                }
            }
            _ => {}
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Migrating historical values onto the current shape.

/// Map values decoded at `origin` onto `current`'s field list. `mids` are
/// the versions strictly between, ascending: a field missing from any of
/// them was dropped and possibly re-added, so its old data is discarded.
pub(crate) fn migrate_values(
    origin: &TypeVersion,
    current: &TypeVersion,
    mids: &[&TypeVersion],
    values: Vec<Value>,
) -> Result<Vec<Value>> {
    if origin.version == current.version {
        return Ok(values);
    }
    let mids: Vec<(&TypeVersion, &[Field])> =
        mids.iter().map(|tv| (*tv, tv.fields.as_slice())).collect();
    migrate_struct(origin, current, &mids, &origin.fields, &current.fields, values)
}

fn migrate_struct(
    otv: &TypeVersion,
    ntv: &TypeVersion,
    mids: &[(&TypeVersion, &[Field])],
    old_fields: &[Field],
    new_fields: &[Field],
    mut values: Vec<Value>,
) -> Result<Vec<Value>> {
    let mut out = Vec::with_capacity(new_fields.len());
    for nf in new_fields {
        let old_pos = old_fields.iter().position(|f| f.name == nf.name);
        let mut dropped = false;
        let mut nested: Vec<(&TypeVersion, &[Field])> = Vec::with_capacity(mids.len());
        for (mtv, mfields) in mids {
            match mfields.iter().find(|f| f.name == nf.name) {
                Some(mf) => {
                    if let Some(fields) = shape_of(mtv, &mf.typ)? {
                        nested.push((mtv, fields));
                    }
                }
                None => {
                    dropped = true;
                    break;
                }
            }
        }
        let v = match (old_pos, dropped) {
            (Some(oi), false) => {
                let v = std::mem::replace(&mut values[oi], Value::Null);
                convert_value(otv, ntv, &nested, &old_fields[oi].typ, &nf.typ, v)?
            }
            _ => Value::zero(&nf.typ),
        };
        out.push(v);
    }
    Ok(out)
}

/// The struct shape directly under a field type, if any: the struct itself,
/// or the struct element of a list/array, or the struct value of a map.
fn shape_of<'a>(tv: &'a TypeVersion, ft: &'a FieldType) -> Result<Option<&'a [Field]>> {
    match &ft.kind {
        Kind::Struct(shape) => Ok(Some(tv.shape_fields(shape)?)),
        Kind::List(e) | Kind::Array(_, e) => match &e.kind {
            Kind::Struct(shape) => Ok(Some(tv.shape_fields(shape)?)),
            _ => Ok(None),
        },
        Kind::Map(_, v) => match &v.kind {
            Kind::Struct(shape) => Ok(Some(tv.shape_fields(shape)?)),
            _ => Ok(None),
        },
        _ => Ok(None),
    }
}

fn convert_value(
    otv: &TypeVersion,
    ntv: &TypeVersion,
    mids: &[(&TypeVersion, &[Field])],
    old_ft: &FieldType,
    new_ft: &FieldType,
    v: Value,
) -> Result<Value> {
    // Pointer flips keep the on-disk encoding: nil becomes the zero value,
    // the zero value becomes nil.
    if matches!(v, Value::Null) {
        return Ok(Value::zero(new_ft));
    }
    if new_ft.ptr && !old_ft.ptr && v.is_zero_for(old_ft) {
        return Ok(Value::Null);
    }
    let v = match (&old_ft.kind, &new_ft.kind, v) {
        (Kind::Struct(os), Kind::Struct(ns), Value::Struct(vals)) => {
            let ofields = otv.shape_fields(os)?;
            let nfields = ntv.shape_fields(ns)?;
            Value::Struct(migrate_struct(otv, ntv, mids, ofields, nfields, vals)?)
        }
        (Kind::List(oe), Kind::List(ne), Value::List(elems))
        | (Kind::Array(_, oe), Kind::Array(_, ne), Value::List(elems)) => Value::List(
            elems
                .into_iter()
                .map(|e| convert_value(otv, ntv, mids, oe, ne, e))
                .collect::<Result<_>>()?,
        ),
        (Kind::Map(_, ov), Kind::Map(_, nv), Value::Map(pairs)) => Value::Map(
            pairs
                .into_iter()
                .map(|(k, v)| Ok((k, convert_value(otv, ntv, mids, ov, nv, v)?)))
                .collect::<Result<_>>()?,
        ),
        (_, _, v) => v,
    };
    Ok(v)
}

// ---------------------------------------------------------------------------
// Dropping a type.

fn load_latest(tx: &mut Tx<'_>, name: &str) -> Result<Option<TypeVersion>> {
    let types_b = bucket::types(name);
    let mut loaded: Vec<(Vec<u8>, Vec<u8>)> = Vec::new();
    tx.raw.for_each(&types_b, |k, v| {
        loaded.push((k.to_vec(), v.to_vec()));
        Ok(())
    })?;
    let mut latest: Option<TypeVersion> = None;
    for (k, v) in loaded {
        let tv = parse_schema(name, &k, &v)?;
        if latest.as_ref().is_none_or(|l| tv.version > l.version) {
            latest = Some(tv);
        }
    }
    Ok(latest)
}

/// Remove a type and all its buckets. Registration is not required; the
/// stored schema alone decides whether the drop is allowed. The dropped
/// type is unlinked from the `referenced_by` sets of the types it
/// references; those updated typeVersions are returned so the caller can
/// refresh the registry.
pub(crate) fn drop_in_tx(tx: &mut Tx<'_>, name: &str) -> Result<Vec<TypeVersion>> {
    let Some(tv) = load_latest(tx, name)? else {
        return Err(Error::Absent(format!("type {name:?} not stored")));
    };
    if let Some(rb) = tv.referenced_by.iter().next() {
        return Err(Error::Reference(format!(
            "cannot drop {name:?}, still referenced by {rb:?}"
        )));
    }

    // Unlink from every type this one references; each gets a version bump
    // to record the shrunk referenced_by.
    let refs: BTreeSet<String> = tv
        .fields
        .iter()
        .flat_map(|f| f.references.iter().cloned())
        .collect();
    let mut updates = Vec::new();
    for refname in refs {
        let Some(mut rtv) = load_latest(tx, &refname)? else {
            continue;
        };
        if rtv.referenced_by.remove(name) {
            rtv.version += 1;
            let (k, v) = pack_schema(&rtv)?;
            tx.raw.put(&bucket::types(&refname), &k, &v)?;
            updates.push(rtv);
        }
    }

    let prefix = bucket::type_prefix(name);
    for b in tx.raw.bucket_names()? {
        if b.starts_with(&prefix) {
            tx.raw.delete_bucket(&b)?;
        }
    }
    tx.raw.delete_sequence(name)?;
    debug!(type_name = %name, "dropped type");
    Ok(updates)
}

pub(crate) fn install(registry: &mut Registry, types: Vec<StoreType>) {
    for st in types {
        registry.insert(Arc::new(st));
    }
}

/// Remove a dropped type and refresh registry entries of types whose
/// `referenced_by` shrank with it.
pub(crate) fn uninstall(registry: &mut Registry, name: &str, updates: Vec<TypeVersion>) {
    registry.remove(name);
    for tv in updates {
        let Some(old) = registry.by_name.get(&tv.name) else {
            continue;
        };
        let mut versions = old.versions.clone();
        let current = Arc::new(tv);
        versions.insert(current.version, current.clone());
        let st = StoreType {
            name: old.name.clone(),
            type_id: old.type_id,
            current,
            versions,
        };
        registry.insert(Arc::new(st));
    }
}
