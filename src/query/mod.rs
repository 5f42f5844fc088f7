//! # Typed Queries
//!
//! A [`Query`] combines filters, a sort specification and a limit against
//! one record type, then executes through a plan picked by the planner:
//! direct primary-key lookup, unique-index lookup, an index range scan, or a
//! table scan with in-memory sorting.
//!
//! Builder methods chain by value and defer their errors: an invalid filter
//! is reported by the terminal operation, keeping call sites linear. A query
//! bound to a [`Database`] runs in its own transaction (read-only, or
//! writable for delete/update terminals); a query created on a [`Tx`] joins
//! that transaction.
//!
//! `next`/`next_id` turn the query into a resumable iterator. Once streaming
//! has started the one-shot terminals refuse with `Param`; a closed handle
//! reports `Finished`, an exhausted one `Absent`.

mod exec;
mod plan;

use std::any::TypeId;
use std::sync::Arc;

use crate::context::Context;
use crate::db::{ops, Database, Tx};
use crate::error::{Error, Result};
use crate::schema::registry::StoreType;
use crate::types::{Kind, Record, Value};

use exec::ExecState;
pub(crate) use plan::{Cmp, Order};

/// One filter clause, normalized to field positions.
pub(crate) enum Filter<T> {
    /// Primary-key equality (`filter_id` or an equality on the PK field).
    Pk(Value),
    /// Primary-key set membership.
    Pks(Vec<Value>),
    Equal(usize, Value),
    NotEqual(usize, Value),
    /// Set membership for scalar fields; contains-any for slice fields.
    In(usize, Vec<Value>),
    Compare(usize, Cmp, Value),
    /// Arbitrary predicate over the decoded record.
    Predicate(Box<dyn FnMut(&T) -> bool>),
}

enum Binding<'q, 'db> {
    Tx(&'q mut Tx<'db>),
    Db {
        db: &'db Database,
        ctx: Context,
        tx: Option<Tx<'db>>,
    },
}

/// A query under construction or being streamed.
pub struct Query<'q, 'db, T: Record> {
    binding: Binding<'q, 'db>,
    pub(crate) st: Arc<StoreType>,
    pub(crate) filters: Vec<Filter<T>>,
    pub(crate) orders: Vec<Order>,
    pub(crate) limit: Option<usize>,
    gather: Option<&'q mut Vec<T>>,
    gather_ids: Option<&'q mut Vec<Value>>,
    err: Option<Error>,
    pub(crate) exec: Option<ExecState>,
    closed: bool,
}

impl<'q, 'db, T: Record> Query<'q, 'db, T> {
    pub(crate) fn new_tx(tx: &'q mut Tx<'db>) -> Result<Query<'q, 'db, T>> {
        let st = tx.db.registry.read().get_id(TypeId::of::<T>())?;
        Ok(Query::new(Binding::Tx(tx), st))
    }

    pub(crate) fn new_db(db: &'db Database, ctx: Context) -> Result<Query<'db, 'db, T>> {
        let st = db.registry.read().get_id(TypeId::of::<T>())?;
        Ok(Query::new(Binding::Db { db, ctx, tx: None }, st))
    }

    fn new(binding: Binding<'q, 'db>, st: Arc<StoreType>) -> Query<'q, 'db, T> {
        Query {
            binding,
            st,
            filters: Vec::new(),
            orders: Vec::new(),
            limit: None,
            gather: None,
            gather_ids: None,
            err: None,
            exec: None,
            closed: false,
        }
    }

    fn set_err(&mut self, e: Error) {
        if self.err.is_none() {
            self.err = Some(e);
        }
    }

    fn field(&mut self, name: &str) -> Option<usize> {
        match self.st.current.field(name) {
            Some((i, f)) => {
                if f.typ.ptr {
                    self.set_err(Error::param(format!(
                        "cannot filter/sort on pointer field {name:?}"
                    )));
                    return None;
                }
                Some(i)
            }
            None => {
                self.set_err(Error::param(format!("unknown field {name:?}")));
                None
            }
        }
    }

    /// Validate a filter value against a field, set membership aware: for
    /// slice fields the element type applies.
    fn checked_value(&mut self, fi: usize, v: Value) -> Option<Value> {
        let f = &self.st.current.fields[fi];
        let r = match &f.typ.kind {
            Kind::List(elem) => v.validate(elem),
            _ => v.validate(&f.typ),
        };
        match r {
            Ok(()) => Some(v),
            Err(e) => {
                self.set_err(e);
                None
            }
        }
    }

    // -- Filters. -----------------------------------------------------------

    /// Filter on the primary key.
    pub fn filter_id(mut self, pk: impl Into<Value>) -> Self {
        let pk = pk.into();
        if let Err(e) = pk.validate(&self.st.current.pk().typ) {
            self.set_err(e);
            return self;
        }
        self.filters.push(Filter::Pk(pk));
        self
    }

    /// Filter on primary-key membership.
    pub fn filter_ids(mut self, pks: Vec<Value>) -> Self {
        for pk in &pks {
            if let Err(e) = pk.validate(&self.st.current.pk().typ) {
                self.set_err(e);
                return self;
            }
        }
        self.filters.push(Filter::Pks(pks));
        self
    }

    /// Filter on field equality. Not valid for slice, map or struct fields.
    pub fn filter_equal(mut self, name: &str, v: impl Into<Value>) -> Self {
        let Some(fi) = self.field(name) else { return self };
        if self.compound(fi, name) {
            return self;
        }
        if let Some(v) = self.checked_value(fi, v.into()) {
            if fi == 0 {
                self.filters.push(Filter::Pk(v));
            } else {
                self.filters.push(Filter::Equal(fi, v));
            }
        }
        self
    }

    /// Filter on field inequality.
    pub fn filter_not_equal(mut self, name: &str, v: impl Into<Value>) -> Self {
        let Some(fi) = self.field(name) else { return self };
        if self.compound(fi, name) {
            return self;
        }
        if let Some(v) = self.checked_value(fi, v.into()) {
            self.filters.push(Filter::NotEqual(fi, v));
        }
        self
    }

    /// Filter on membership: for scalar fields the field value must equal
    /// one of `vs`; for slice fields some element must.
    pub fn filter_in(mut self, name: &str, vs: Vec<Value>) -> Self {
        let Some(fi) = self.field(name) else { return self };
        let mut checked = Vec::with_capacity(vs.len());
        for v in vs {
            match self.checked_value(fi, v) {
                Some(v) => checked.push(v),
                None => return self,
            }
        }
        if checked.is_empty() {
            self.set_err(Error::param("filter_in needs at least one value"));
            return self;
        }
        if fi == 0 {
            self.filters.push(Filter::Pks(checked));
        } else {
            self.filters.push(Filter::In(fi, checked));
        }
        self
    }

    /// Filter on every field of `patch` that holds a non-zero value.
    pub fn filter_nonzero(mut self, patch: &T) -> Self {
        let values = match patch.to_values() {
            Ok(v) => v,
            Err(e) => {
                self.set_err(e);
                return self;
            }
        };
        let st = self.st.clone();
        let mut any = false;
        for (i, v) in values.into_iter().enumerate() {
            if v.is_zero_for(&st.current.fields[i].typ) {
                continue;
            }
            any = true;
            if i == 0 {
                self.filters.push(Filter::Pk(v));
            } else {
                self.filters.push(Filter::Equal(i, v));
            }
        }
        if !any {
            self.set_err(Error::param("filter_nonzero needs at least one nonzero field"));
        }
        self
    }

    /// Filter with an arbitrary predicate over the decoded record.
    pub fn filter_fn(mut self, f: impl FnMut(&T) -> bool + 'static) -> Self {
        self.filters.push(Filter::Predicate(Box::new(f)));
        self
    }

    pub fn filter_greater(self, name: &str, v: impl Into<Value>) -> Self {
        self.compare(name, Cmp::Gt, v.into())
    }

    pub fn filter_greater_equal(self, name: &str, v: impl Into<Value>) -> Self {
        self.compare(name, Cmp::Ge, v.into())
    }

    pub fn filter_less(self, name: &str, v: impl Into<Value>) -> Self {
        self.compare(name, Cmp::Lt, v.into())
    }

    pub fn filter_less_equal(self, name: &str, v: impl Into<Value>) -> Self {
        self.compare(name, Cmp::Le, v.into())
    }

    fn compare(mut self, name: &str, cmp: Cmp, v: Value) -> Self {
        let Some(fi) = self.field(name) else { return self };
        if self.compound(fi, name) {
            return self;
        }
        if let Some(v) = self.checked_value(fi, v) {
            self.filters.push(Filter::Compare(fi, cmp, v));
        }
        self
    }

    fn compound(&mut self, fi: usize, name: &str) -> bool {
        let kind = &self.st.current.fields[fi].typ.kind;
        if matches!(
            kind,
            Kind::List(_) | Kind::Array(..) | Kind::Map(..) | Kind::Struct(_)
        ) {
            self.set_err(Error::param(format!(
                "cannot compare {} field {name:?}",
                kind.name()
            )));
            return true;
        }
        false
    }

    // -- Sorting and limits. ------------------------------------------------

    /// Sort ascending on the named fields, appended to any previous sort.
    pub fn sort_asc(self, fields: &[&str]) -> Self {
        self.sort(fields, true)
    }

    /// Sort descending on the named fields.
    pub fn sort_desc(self, fields: &[&str]) -> Self {
        self.sort(fields, false)
    }

    fn sort(mut self, fields: &[&str], asc: bool) -> Self {
        for name in fields {
            let Some(fi) = self.field(name) else { return self };
            if self.compound(fi, name) {
                return self;
            }
            if self.orders.iter().any(|o| o.field == fi) {
                self.set_err(Error::param(format!("duplicate sort field {name:?}")));
                return self;
            }
            self.orders.push(Order { field: fi, asc });
        }
        self
    }

    /// Stop after `n` matching records.
    pub fn limit(mut self, n: usize) -> Self {
        if n == 0 {
            self.set_err(Error::param("limit must be positive"));
        } else if self.limit.is_some() {
            self.set_err(Error::param("duplicate limit"));
        } else {
            self.limit = Some(n);
        }
        self
    }

    // -- Gather side channel. -----------------------------------------------

    /// Capture the records affected by a delete/update terminal. The buffer
    /// is appended to only when the terminal succeeds.
    pub fn gather(mut self, buf: &'q mut Vec<T>) -> Self {
        self.gather = Some(buf);
        self
    }

    /// Capture the primary keys affected by a delete/update terminal.
    pub fn gather_ids(mut self, buf: &'q mut Vec<Value>) -> Self {
        self.gather_ids = Some(buf);
        self
    }

    // -- Terminals. ---------------------------------------------------------

    /// All matching records.
    pub fn list(mut self) -> Result<Vec<T>> {
        self.pre_terminal()?;
        let run = self.run(false, true, |_, m| Ok(Outcome::Keep(m)));
        let matches = self.done(run)?;
        matches.into_iter().map(record_of).collect()
    }

    /// Primary keys of all matching records.
    pub fn ids(mut self) -> Result<Vec<Value>> {
        self.pre_terminal()?;
        let run = self.run(false, false, |_, m| Ok(Outcome::Keep(m)));
        let matches = self.done(run)?;
        Ok(matches.into_iter().map(|m| m.pk_value).collect())
    }

    /// Number of matching records.
    pub fn count(mut self) -> Result<usize> {
        self.pre_terminal()?;
        let run = self.run(false, false, |_, m| Ok(Outcome::Keep(m)));
        Ok(self.done(run)?.len())
    }

    /// Whether any record matches.
    pub fn exists(mut self) -> Result<bool> {
        self.pre_terminal()?;
        if self.limit.is_none() {
            self.limit = Some(1);
        }
        let run = self.run(false, false, |_, m| Ok(Outcome::Keep(m)));
        Ok(!self.done(run)?.is_empty())
    }

    /// Exactly one matching record; `Absent` on none, `Multiple` on more.
    pub fn get(mut self) -> Result<T> {
        self.pre_terminal()?;
        let run = self.run(false, true, |_, m| Ok(Outcome::Keep(m)));
        let mut matches = self.done(run)?;
        match matches.len() {
            0 => Err(Error::Absent(format!("no {} record matches", self.st.name))),
            1 => record_of(matches.remove(0)),
            _ => Err(Error::Multiple(format!(
                "more than one {} record matches",
                self.st.name
            ))),
        }
    }

    /// Call `f` for every matching record. Returning `Err(Error::StopForEach)`
    /// stops early and reports success; other errors abort.
    pub fn for_each(mut self, mut f: impl FnMut(T) -> Result<()>) -> Result<()> {
        self.pre_terminal()?;
        let run = (|q: &mut Self| -> Result<Vec<Match>> {
            q.start(false, true)?;
            while let Some(m) = q.step()? {
                match f(record_of(m)?) {
                    Ok(()) => {}
                    Err(Error::StopForEach) => break,
                    Err(e) => return Err(e),
                }
            }
            Ok(Vec::new())
        })(&mut self);
        self.done(run)?;
        Ok(())
    }

    /// Delete all matching records, returning how many. Gather buffers
    /// receive the deleted records/keys.
    pub fn delete(mut self) -> Result<usize> {
        self.pre_terminal()?;
        let run = self.run(true, true, |tx, m| {
            ops::delete(tx, &m.st, &m.pk_value)?;
            Ok(Outcome::Keep(m))
        });
        let matches = self.done(run)?;
        let n = matches.len();
        self.fill_gather(matches)?;
        Ok(n)
    }

    /// Set every non-zero field of `patch` (except the primary key, which
    /// must be zero) on all matching records.
    pub fn update_nonzero(self, patch: &T) -> Result<usize> {
        let values = patch.to_values()?;
        if values.is_empty() {
            return Err(Error::param("record has no fields"));
        }
        if !values[0].is_zero() {
            return Err(Error::param("cannot update primary key"));
        }
        let st = self.st.clone();
        let changes: Vec<(usize, Value)> = values
            .into_iter()
            .enumerate()
            .skip(1)
            .filter(|(i, v)| !v.is_zero_for(&st.current.fields[*i].typ))
            .collect();
        self.update_with(changes)
    }

    /// Set one field on all matching records.
    pub fn update_field(self, name: &str, v: impl Into<Value>) -> Result<usize> {
        self.update_fields(vec![(name.to_string(), v.into())])
    }

    /// Set several fields on all matching records.
    pub fn update_fields(self, fields: Vec<(String, Value)>) -> Result<usize> {
        if fields.is_empty() {
            return Err(Error::param("update_fields needs at least one field"));
        }
        let mut changes = Vec::with_capacity(fields.len());
        for (name, v) in fields {
            let (fi, f) = self
                .st
                .current
                .field(&name)
                .ok_or_else(|| Error::param(format!("unknown field {name:?}")))?;
            if fi == 0 {
                return Err(Error::param("cannot update primary key"));
            }
            v.validate(&f.typ)?;
            changes.push((fi, v));
        }
        self.update_with(changes)
    }

    fn update_with(mut self, changes: Vec<(usize, Value)>) -> Result<usize> {
        if changes.is_empty() {
            return Err(Error::param("no fields to update"));
        }
        self.pre_terminal()?;
        let run = self.run(true, true, |tx, mut m| {
            let values = m
                .values
                .as_mut()
                .ok_or_else(|| Error::store("update without loaded values"))?;
            for (fi, v) in &changes {
                values[*fi] = v.clone();
            }
            ops::update(tx, &m.st, values)?;
            Ok(Outcome::Keep(m))
        });
        let matches = self.done(run)?;
        let n = matches.len();
        self.fill_gather(matches)?;
        Ok(n)
    }

    // -- Streaming. ---------------------------------------------------------

    /// The next matching record; `Absent` when exhausted, `Finished` after
    /// close.
    pub fn next(&mut self) -> Result<T> {
        self.pre_next()?;
        if self.exec.is_none() {
            self.start(false, true)?;
        }
        match self.step()? {
            Some(Match {
                values: Some(values),
                ..
            }) => T::from_values(values),
            Some(_) => Err(Error::param("stream was started with next_id")),
            None => Err(Error::Absent(format!("{} stream exhausted", self.st.name))),
        }
    }

    /// The next matching primary key.
    pub fn next_id(&mut self) -> Result<Value> {
        self.pre_next()?;
        if self.exec.is_none() {
            self.start(false, false)?;
        }
        match self.step()? {
            Some(m) => Ok(m.pk_value),
            None => Err(Error::Absent(format!("{} stream exhausted", self.st.name))),
        }
    }

    /// Release the query's resources; an owned transaction is rolled back.
    pub fn close(&mut self) {
        self.closed = true;
        self.exec = None;
        if let Binding::Db { tx, .. } = &mut self.binding {
            if let Some(tx) = tx.take() {
                let _ = tx.rollback();
            }
        }
    }

    // -- Internals. ---------------------------------------------------------

    fn pre_terminal(&mut self) -> Result<()> {
        if self.closed {
            return Err(Error::Finished);
        }
        if self.exec.is_some() {
            return Err(Error::param(
                "cannot run a one-shot terminal after streaming started",
            ));
        }
        if let Some(e) = self.err.take() {
            return Err(e);
        }
        Ok(())
    }

    fn pre_next(&mut self) -> Result<()> {
        if self.closed {
            return Err(Error::Finished);
        }
        if let Some(e) = self.err.take() {
            self.closed = true;
            return Err(e);
        }
        Ok(())
    }

    fn ensure_tx(&mut self, writable: bool) -> Result<()> {
        match &mut self.binding {
            Binding::Tx(tx) => {
                if writable {
                    tx.require_writable()?;
                }
                Ok(())
            }
            Binding::Db { db, ctx, tx } => {
                if tx.is_none() {
                    *tx = Some(db.begin(ctx, writable)?);
                }
                Ok(())
            }
        }
    }

    /// Run a terminal: plan, iterate, apply `op` per match.
    fn run(
        &mut self,
        writable: bool,
        want_values: bool,
        mut op: impl FnMut(&mut Tx<'db>, Match) -> Result<Outcome>,
    ) -> Result<Vec<Match>> {
        self.start(writable, want_values)?;
        let mut out = Vec::new();
        while let Some(m) = self.step()? {
            // Split borrow: op needs the transaction, step state stays put.
            let m = {
                let tx = match &mut self.binding {
                    Binding::Tx(tx) => tx,
                    Binding::Db { tx, .. } => match tx.as_mut() {
                        Some(tx) => tx,
                        None => return Err(Error::store("terminal without transaction")),
                    },
                };
                op(tx, m)?
            };
            match m {
                Outcome::Keep(m) => out.push(m),
            }
        }
        Ok(out)
    }

    /// Finish a terminal: resolve the run result and settle an owned
    /// transaction (commit on success, rollback on error).
    fn done<R>(&mut self, run: Result<R>) -> Result<R> {
        self.exec = None;
        self.closed = true;
        if let Binding::Db { tx, .. } = &mut self.binding {
            if let Some(tx) = tx.take() {
                match &run {
                    Ok(_) => tx.commit()?,
                    Err(_) => {
                        let _ = tx.rollback();
                    }
                }
            }
        }
        run
    }

    fn fill_gather(&mut self, matches: Vec<Match>) -> Result<()> {
        if let Some(ids) = self.gather_ids.as_deref_mut() {
            ids.extend(matches.iter().map(|m| m.pk_value.clone()));
        }
        if let Some(buf) = self.gather.as_deref_mut() {
            for m in matches {
                buf.push(record_of(m)?);
            }
        }
        Ok(())
    }
}

impl<T: Record> Drop for Query<'_, '_, T> {
    fn drop(&mut self) {
        if let Binding::Db { tx, .. } = &mut self.binding {
            if let Some(tx) = tx.take() {
                let _ = tx.rollback();
            }
        }
    }
}

/// One matched record during execution.
pub(crate) struct Match {
    pub st: Arc<StoreType>,
    pub pk_value: Value,
    /// Decoded field values; absent for id-only execution.
    pub values: Option<Vec<Value>>,
}

pub(crate) enum Outcome {
    Keep(Match),
}

fn record_of<T: Record>(m: Match) -> Result<T> {
    let values = m
        .values
        .ok_or_else(|| Error::store("record values not loaded"))?;
    T::from_values(values)
}
