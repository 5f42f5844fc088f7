//! # Database Facade
//!
//! [`Database`] owns the open store file, the per-open type registry, the
//! accumulated statistics and the clock. All record work happens inside a
//! transaction: the `read`/`write` wrappers run a closure with automatic
//! rollback on error or panic and commit on success, and the convenience
//! record methods wrap single operations the same way.
//!
//! The introspection surface (`types`, `keys`, `records`, `record`) reads
//! stored schemas directly, so it works on any database file without
//! `Record` implementations — that is what the inspection CLI is built on.

pub(crate) mod ops;
mod tx;

pub use tx::Tx;

use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use hashbrown::HashSet;
use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::context::{Clock, Context};
use crate::encoding::key::parse_pk;
use crate::error::{Error, Result};
use crate::query::Query;
use crate::schema::registry::{self, Registry, StoreType};
use crate::schema::{parse_schema, TypeVersion};
use crate::stats::Stats;
use crate::store::{bucket, RawTx, Store};
use crate::types::{FieldType, Kind, Record, Registration, Value};

/// Open options.
#[derive(Default)]
pub struct Options {
    /// How long to wait for the exclusive file lock; `None` fails
    /// immediately when the file is held.
    pub timeout: Option<Duration>,
    /// Refuse to create a missing file.
    pub must_exist: bool,
    /// Reject write transactions on this handle.
    pub read_only: bool,
    /// Wall-clock source for `default now` timestamps; tests inject a fixed
    /// clock.
    pub clock: Option<Clock>,
}

/// An open database file.
pub struct Database {
    path: PathBuf,
    pub(crate) store: Store,
    pub(crate) registry: RwLock<Registry>,
    pub(crate) stats: Mutex<Stats>,
    pub(crate) clock: Clock,
    read_only: bool,
    hints: RwLock<HashSet<String>>,
}

impl Database {
    /// Open or create the database file. Types must be registered before
    /// records of them can be stored or queried.
    pub fn open(path: impl AsRef<Path>, opts: Options) -> Result<Database> {
        let path = path.as_ref().to_path_buf();
        let store = Store::open(&path, opts.timeout, opts.must_exist)?;
        debug!(path = %path.display(), "opened database");
        Ok(Database {
            path,
            store,
            registry: RwLock::new(Registry::default()),
            stats: Mutex::new(Stats::default()),
            clock: opts.clock.unwrap_or_else(|| Arc::new(Utc::now)),
            read_only: opts.read_only,
            hints: RwLock::new(HashSet::new()),
        })
    }

    /// Close the file. Outstanding transactions must be finished first.
    pub fn close(self) -> Result<()> {
        debug!(path = %self.path.display(), "closing database");
        Ok(())
    }

    /// The database file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Register types for use with this database, creating or evolving
    /// their stored schemas. Types that reference each other must be
    /// registered in the same call.
    pub fn register(&self, ctx: &Context, regs: Vec<Registration>) -> Result<()> {
        let new_types = self.write(ctx, |tx| registry::register_in_tx(tx, &regs))?;
        registry::install(&mut self.registry.write(), new_types);
        Ok(())
    }

    /// Remove a type and all its records, types and indices. Fails with
    /// `Reference` while other types reference it. Registration is not
    /// required.
    pub fn drop_type(&self, ctx: &Context, name: &str) -> Result<()> {
        let updates = self.write(ctx, |tx| registry::drop_in_tx(tx, name))?;
        registry::uninstall(&mut self.registry.write(), name, updates);
        Ok(())
    }

    /// Advisory hint that records of `name` are inserted in roughly
    /// ascending key order; scans over such types read ahead more
    /// aggressively.
    pub fn hint_append(&self, name: &str, enabled: bool) {
        let mut hints = self.hints.write();
        if enabled {
            hints.insert(name.to_string());
        } else {
            hints.remove(name);
        }
    }

    pub(crate) fn hinted_append(&self, name: &str) -> bool {
        self.hints.read().contains(name)
    }

    /// Begin a transaction. The context is checked now and at every
    /// store-touching step of the transaction.
    pub fn begin(&self, ctx: &Context, writable: bool) -> Result<Tx<'_>> {
        ctx.err()?;
        if writable && self.read_only {
            return Err(Error::NotWritable);
        }
        let raw = if writable {
            self.store.begin_write()?
        } else {
            self.store.begin_read()?
        };
        Ok(Tx::new(self, raw, ctx.clone()))
    }

    /// Run `f` in a read-only transaction.
    pub fn read<R>(&self, ctx: &Context, f: impl FnOnce(&mut Tx<'_>) -> Result<R>) -> Result<R> {
        let tx = self.begin(ctx, false)?;
        run_tx(tx, f)
    }

    /// Run `f` in a write transaction: commit on `Ok`, roll back on error
    /// or panic (panics resume after the rollback).
    pub fn write<R>(&self, ctx: &Context, f: impl FnOnce(&mut Tx<'_>) -> Result<R>) -> Result<R> {
        let tx = self.begin(ctx, true)?;
        run_tx(tx, f)
    }

    /// Insert in its own write transaction.
    pub fn insert<T: Record>(&self, ctx: &Context, rec: &mut T) -> Result<()> {
        self.write(ctx, |tx| tx.insert(rec))
    }

    /// Get in its own read transaction.
    pub fn get<T: Record>(&self, ctx: &Context, rec: &mut T) -> Result<()> {
        self.read(ctx, |tx| tx.get(rec))
    }

    /// Update in its own write transaction.
    pub fn update<T: Record>(&self, ctx: &Context, rec: &T) -> Result<()> {
        self.write(ctx, |tx| tx.update(rec))
    }

    /// Delete in its own write transaction.
    pub fn delete<T: Record>(&self, ctx: &Context, rec: &T) -> Result<()> {
        self.write(ctx, |tx| tx.delete(rec))
    }

    /// Start a query that runs in its own transaction: read-only for read
    /// terminals, writable for delete/update terminals.
    pub fn query<T: Record>(&self, ctx: &Context) -> Result<Query<'_, '_, T>> {
        Query::new_db(self, ctx.clone())
    }

    /// Accumulated statistics of committed and rolled-back transactions.
    pub fn stats(&self) -> Stats {
        *self.stats.lock()
    }

    // -- Introspection, no `Record` implementations required. ---------------

    /// Names of all types stored in the file.
    pub fn types(&self, ctx: &Context) -> Result<Vec<String>> {
        self.read(ctx, |tx| {
            let mut names: Vec<String> = tx
                .raw
                .bucket_names()?
                .iter()
                .filter_map(|b| match bucket::split(b) {
                    Some((t, "types")) => Some(t.to_string()),
                    _ => None,
                })
                .collect();
            names.sort();
            Ok(names)
        })
    }

    /// Visit the primary key of every record of `name` in key order.
    pub fn keys(
        &self,
        ctx: &Context,
        name: &str,
        mut f: impl FnMut(Value) -> Result<()>,
    ) -> Result<()> {
        self.read(ctx, |tx| {
            let st = load_stored_type(&tx.raw, name)?;
            let ctx = tx.ctx.clone();
            let mut rows = 0u64;
            tx.raw.for_each(&bucket::records(name), |bk, _| {
                ctx.err()?;
                rows += 1;
                f(parse_pk(&st.current.pk().typ.kind, bk)?)
            })?;
            tx.stats.records.cursor += rows;
            Ok(())
        })
    }

    /// Visit every record of `name` as a JSON object keyed by field name.
    /// `fields` is set to the current schema's field names before the first
    /// callback.
    pub fn records(
        &self,
        ctx: &Context,
        name: &str,
        fields: &mut Vec<String>,
        mut f: impl FnMut(serde_json::Value) -> Result<()>,
    ) -> Result<()> {
        self.read(ctx, |tx| {
            let st = load_stored_type(&tx.raw, name)?;
            *fields = st.current.fields.iter().map(|f| f.name.clone()).collect();
            let ctx = tx.ctx.clone();
            let mut rows = 0u64;
            tx.raw.for_each(&bucket::records(name), |bk, bv| {
                ctx.err()?;
                rows += 1;
                let values = st.decode(bk, bv)?;
                f(record_json(&st.current, &values)?)
            })?;
            tx.stats.records.cursor += rows;
            Ok(())
        })
    }

    /// Fetch one record of `name` by the string representation of its
    /// primary key, as a JSON object.
    pub fn record(
        &self,
        ctx: &Context,
        name: &str,
        key: &str,
        fields: &mut Vec<String>,
    ) -> Result<serde_json::Value> {
        self.read(ctx, |tx| {
            let st = load_stored_type(&tx.raw, name)?;
            *fields = st.current.fields.iter().map(|f| f.name.clone()).collect();
            let pk_value = parse_key_repr(&st.current.pk().typ, key)?;
            let pk = ops::pk_bytes(&st.current, &pk_value)?;
            tx.stats.records.get += 1;
            let data = tx
                .raw
                .get(&bucket::records(name), &pk)?
                .ok_or_else(|| Error::Absent(format!("{name} record {key:?}")))?;
            let values = st.decode(&pk, &data)?;
            record_json(&st.current, &values)
        })
    }
}

/// A record as a JSON object, nested struct field names resolved through
/// the schema. Byte fields render as lowercase hex.
pub(crate) fn record_json(tv: &TypeVersion, values: &[Value]) -> Result<serde_json::Value> {
    fields_json(tv, &tv.fields, values)
}

fn fields_json(
    tv: &TypeVersion,
    fields: &[crate::types::Field],
    values: &[Value],
) -> Result<serde_json::Value> {
    let mut obj = serde_json::Map::with_capacity(fields.len());
    for (f, v) in fields.iter().zip(values) {
        obj.insert(f.name.clone(), value_json(tv, &f.typ, v)?);
    }
    Ok(serde_json::Value::Object(obj))
}

fn value_json(tv: &TypeVersion, ft: &FieldType, v: &Value) -> Result<serde_json::Value> {
    use serde_json::Value as J;
    let j = match (v, &ft.kind) {
        (Value::Null, _) => J::Null,
        (Value::Bool(b), _) => J::Bool(*b),
        (Value::Int(i), _) => J::from(*i),
        (Value::Uint(u), _) => J::from(*u),
        (Value::Float(f), _) => serde_json::Number::from_f64(*f)
            .map(J::Number)
            .unwrap_or(J::Null),
        (Value::String(s), _) => J::String(s.clone()),
        (Value::Bytes(b), _) => J::String(hex(b)),
        (Value::Time(t), _) => J::String(t.to_rfc3339()),
        (Value::List(l), Kind::List(e) | Kind::Array(_, e)) => J::Array(
            l.iter()
                .map(|v| value_json(tv, e, v))
                .collect::<Result<_>>()?,
        ),
        (Value::Map(m), Kind::Map(kt, vt)) => {
            if matches!(kt.kind, Kind::String) {
                let mut obj = serde_json::Map::with_capacity(m.len());
                for (k, v) in m {
                    let Value::String(ks) = k else {
                        return Err(Error::store("map key is not a string"));
                    };
                    obj.insert(ks.clone(), value_json(tv, vt, v)?);
                }
                J::Object(obj)
            } else {
                J::Array(
                    m.iter()
                        .map(|(k, v)| {
                            Ok(J::Array(vec![
                                value_json(tv, kt, k)?,
                                value_json(tv, vt, v)?,
                            ]))
                        })
                        .collect::<Result<_>>()?,
                )
            }
        }
        (Value::Struct(vals), Kind::Struct(shape)) => {
            fields_json(tv, tv.shape_fields(shape)?, vals)?
        }
        _ => return Err(Error::store("value does not match schema kind")),
    };
    Ok(j)
}

fn hex(b: &[u8]) -> String {
    b.iter().map(|x| format!("{x:02x}")).collect()
}

fn run_tx<R>(mut tx: Tx<'_>, f: impl FnOnce(&mut Tx<'_>) -> Result<R>) -> Result<R> {
    let r = catch_unwind(AssertUnwindSafe(|| f(&mut tx)));
    match r {
        Err(panic) => {
            // The store aborts the transaction when it is dropped.
            let _ = tx.rollback();
            resume_unwind(panic)
        }
        Ok(Ok(v)) => {
            tx.commit()?;
            Ok(v)
        }
        Ok(Err(e)) => {
            let _ = tx.rollback();
            Err(e)
        }
    }
}

/// Load a type's schema chain from disk into an unregistered store type.
pub(crate) fn load_stored_type(raw: &RawTx, name: &str) -> Result<Arc<StoreType>> {
    let types_b = bucket::types(name);
    let mut loaded: Vec<(Vec<u8>, Vec<u8>)> = Vec::new();
    raw.for_each(&types_b, |k, v| {
        loaded.push((k.to_vec(), v.to_vec()));
        Ok(())
    })?;
    if loaded.is_empty() {
        return Err(Error::Absent(format!("type {name:?} not stored")));
    }
    let mut versions = hashbrown::HashMap::new();
    let mut current: Option<Arc<TypeVersion>> = None;
    for (k, v) in loaded {
        let tv = Arc::new(parse_schema(name, &k, &v)?);
        if current.as_ref().is_none_or(|c| tv.version > c.version) {
            current = Some(tv.clone());
        }
        versions.insert(tv.version, tv);
    }
    Ok(Arc::new(StoreType {
        name: name.to_string(),
        type_id: None,
        current: current.unwrap(),
        versions,
    }))
}

/// Parse a primary key from its string representation, for the CLI-facing
/// `record` lookup.
fn parse_key_repr(ft: &FieldType, s: &str) -> Result<Value> {
    let bad = |k: &Kind| Error::param(format!("cannot parse {s:?} as {} key", k.name()));
    match &ft.kind {
        k if k.is_sint() => s.parse().map(Value::Int).map_err(|_| bad(k)),
        k if k.is_uint() => s.parse().map(Value::Uint).map_err(|_| bad(k)),
        Kind::Bool => match s {
            "true" => Ok(Value::Bool(true)),
            "false" => Ok(Value::Bool(false)),
            k => Err(Error::param(format!("cannot parse {k:?} as bool key"))),
        },
        Kind::String => Ok(Value::String(s.to_string())),
        Kind::Bytes => Ok(Value::Bytes(s.as_bytes().to_vec())),
        k => Err(bad(k)),
    }
}
