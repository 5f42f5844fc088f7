//! # Transactions
//!
//! [`Tx`] wraps one store transaction together with the context, the
//! per-transaction statistics, and the botched flag. A botched transaction
//! is one whose intermediate state is known to be inconsistent (for example
//! a uniqueness violation raised after some index entries of a mutation were
//! already written); every further operation refuses with
//! [`Error::TxBotched`] and commit rolls back instead.
//!
//! Dropping a transaction without committing aborts it; the underlying
//! store discards all writes.

use std::any::TypeId;

use crate::context::Context;
use crate::db::{ops, Database};
use crate::error::{Error, Result};
use crate::query::Query;
use crate::stats::Stats;
use crate::store::RawTx;
use crate::types::Record;

/// A read or write transaction.
pub struct Tx<'db> {
    pub(crate) db: &'db Database,
    pub(crate) raw: RawTx,
    pub(crate) ctx: Context,
    pub(crate) stats: Stats,
    pub(crate) botched: bool,
    /// Bumped on every record/index mutation; cursors compare against it to
    /// notice they must reposition.
    pub(crate) mutations: u64,
}

impl<'db> Tx<'db> {
    pub(crate) fn new(db: &'db Database, raw: RawTx, ctx: Context) -> Tx<'db> {
        let mut stats = Stats::default();
        if raw.writable() {
            stats.writes += 1;
        } else {
            stats.reads += 1;
        }
        Tx {
            db,
            raw,
            ctx,
            stats,
            botched: false,
            mutations: 0,
        }
    }

    /// Refuses botched transactions and canceled contexts. Checked by every
    /// operation that touches the store and at every cursor step.
    pub(crate) fn check(&self) -> Result<()> {
        if self.botched {
            return Err(Error::TxBotched);
        }
        self.ctx.err()
    }

    pub(crate) fn require_writable(&self) -> Result<()> {
        if !self.raw.writable() {
            return Err(Error::NotWritable);
        }
        Ok(())
    }

    pub(crate) fn db_has_type(&self, name: &str) -> bool {
        self.db.registry.read().by_name.contains_key(name)
    }

    /// Run a mutation section; if it fails after some writes already
    /// happened, the transaction is botched.
    pub(crate) fn guard_mutation<R>(
        &mut self,
        f: impl FnOnce(&mut Tx<'db>) -> Result<R>,
    ) -> Result<R> {
        let before = (
            self.stats.records.put,
            self.stats.records.delete,
            self.stats.index.put,
            self.stats.index.delete,
        );
        let r = f(self);
        if r.is_err() {
            let after = (
                self.stats.records.put,
                self.stats.records.delete,
                self.stats.index.put,
                self.stats.index.delete,
            );
            if after != before {
                self.botched = true;
            }
        }
        r
    }

    /// Counters accumulated by this transaction so far.
    pub fn stats(&self) -> Stats {
        self.stats
    }

    /// Insert a record. A zero integer primary key is assigned from the
    /// type's sequence and written back, as are applied default values.
    pub fn insert<T: Record>(&mut self, rec: &mut T) -> Result<()> {
        let st = self.db.registry.read().get_id(TypeId::of::<T>())?;
        let mut values = rec.to_values()?;
        ops::insert(self, &st, &mut values)?;
        *rec = T::from_values(values)?;
        Ok(())
    }

    /// Fetch the record whose primary key is set on `rec`, overwriting the
    /// remaining fields.
    pub fn get<T: Record>(&mut self, rec: &mut T) -> Result<()> {
        let st = self.db.registry.read().get_id(TypeId::of::<T>())?;
        let values = rec.to_values()?;
        let pk = values
            .into_iter()
            .next()
            .ok_or_else(|| Error::param("record has no fields"))?;
        let got = ops::get(self, &st, &pk)?;
        *rec = T::from_values(got)?;
        Ok(())
    }

    /// Replace the stored record with the same primary key.
    pub fn update<T: Record>(&mut self, rec: &T) -> Result<()> {
        let st = self.db.registry.read().get_id(TypeId::of::<T>())?;
        let values = rec.to_values()?;
        ops::update(self, &st, &values)
    }

    /// Delete the record with `rec`'s primary key.
    pub fn delete<T: Record>(&mut self, rec: &T) -> Result<()> {
        let st = self.db.registry.read().get_id(TypeId::of::<T>())?;
        let values = rec.to_values()?;
        let pk = values
            .into_iter()
            .next()
            .ok_or_else(|| Error::param("record has no fields"))?;
        ops::delete(self, &st, &pk)
    }

    /// Start a query in this transaction.
    pub fn query<'q, T: Record>(&'q mut self) -> Result<Query<'q, 'db, T>> {
        Query::new_tx(self)
    }

    /// Commit. A botched transaction rolls back instead and reports it.
    pub fn commit(self) -> Result<()> {
        let botched = self.botched;
        let Tx { db, raw, stats, .. } = self;
        if botched {
            let _ = raw.rollback();
            db.stats.lock().add(&stats);
            return Err(Error::TxBotched);
        }
        raw.commit()?;
        db.stats.lock().add(&stats);
        Ok(())
    }

    /// Abort, discarding all writes. Transaction statistics are still merged
    /// into the database totals.
    pub fn rollback(self) -> Result<()> {
        let Tx { db, raw, stats, .. } = self;
        let r = raw.rollback();
        db.stats.lock().add(&stats);
        r
    }
}
