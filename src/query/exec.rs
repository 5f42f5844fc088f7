//! # Query Executor
//!
//! Drives the chosen plan through the store, one stateless cursor step at a
//! time. Emission order is the plan's scan order, refined where needed:
//!
//! - When the plan satisfies the full sort specification, matches stream
//!   straight through.
//! - When it satisfies none of it, all matches are collected and sorted in
//!   memory once.
//! - When it satisfies a leading prefix, matches sharing that prefix are
//!   stowed, sorted on the remaining keys, and released when the prefix
//!   value moves on ("stowed sort").
//!
//! Mutations made while iterating (delete/update terminals, or other writes
//! on the same transaction) bump the transaction's mutation counter; the
//! cursor notices on its next step, drops its read-ahead and reseeks from
//! the last emitted key. The context is checked at every step.

use std::collections::VecDeque;
use std::ops::Bound;

use crate::db::Tx;
use crate::encoding::key::{parse_index_key, parse_pk, prefix_successor};
use crate::error::{Error, Result};
use crate::schema::registry::StoreType;
use crate::store::bucket;
use crate::types::{Kind, Record, Value};

use super::plan::{self, Order, Plan, PlanKind};
use super::{Binding, Filter, Match, Query};

pub(crate) struct ExecState {
    plan: Plan,
    src: Source,
    want_values: bool,
    limit: Option<usize>,
    pending: VecDeque<Match>,
    collect: Vec<Match>,
    group: Option<Vec<Value>>,
    source_done: bool,
    emitted: usize,
}

enum Source {
    /// Direct lookups in the records bucket, keys in emit order.
    Keys {
        records: String,
        keys: Vec<Vec<u8>>,
        pos: usize,
    },
    /// At most one entry per unique-index prefix.
    Unique {
        index: String,
        prefixes: Vec<Vec<u8>>,
        pos: usize,
    },
    /// Bounded scan over the records bucket or an index bucket.
    Scan {
        bucket: String,
        index_kinds: Option<Vec<Kind>>,
        lower: Bound<Vec<u8>>,
        upper: Bound<Vec<u8>>,
        desc: bool,
        last: Option<Vec<u8>>,
        batch: VecDeque<(Vec<u8>, Vec<u8>)>,
        batch_size: usize,
        seen_mutations: u64,
        started: bool,
    },
}

impl<'q, 'db, T: Record> Query<'q, 'db, T> {
    /// Plan the query and set up the execution state.
    pub(crate) fn start(&mut self, writable: bool, want_values: bool) -> Result<()> {
        self.ensure_tx(writable)?;
        let st = self.st.clone();
        let tx: &mut Tx<'db> = match &mut self.binding {
            Binding::Tx(tx) => tx,
            Binding::Db { tx, .. } => match tx.as_mut() {
                Some(tx) => tx,
                None => return Err(Error::store("query started without transaction")),
            },
        };
        tx.check()?;
        tx.stats.queries += 1;

        let plan = plan::plan(&st.current, &mut self.filters, &self.orders, &mut tx.stats)?;
        let batch_size = if tx.db.hinted_append(&st.name) { 64 } else { 16 };

        let src = match &plan.kind {
            PlanKind::Pk { keys } => Source::Keys {
                records: bucket::records(&st.name),
                keys: keys.clone(),
                pos: 0,
            },
            PlanKind::Unique { index, prefixes } => Source::Unique {
                index: bucket::index(&st.name, index),
                prefixes: prefixes.clone(),
                pos: 0,
            },
            PlanKind::IndexScan {
                index,
                lower,
                upper,
            } => {
                let idx = &st.current.indices[index];
                let kinds: Vec<Kind> = st
                    .current
                    .index_kinds(idx)?
                    .into_iter()
                    .cloned()
                    .collect();
                Source::Scan {
                    bucket: bucket::index(&st.name, index),
                    index_kinds: Some(kinds),
                    lower: lower.clone(),
                    upper: upper.clone(),
                    desc: plan.desc,
                    last: None,
                    batch: VecDeque::new(),
                    batch_size,
                    seen_mutations: tx.mutations,
                    started: false,
                }
            }
            PlanKind::TableScan { lower, upper } => Source::Scan {
                bucket: bucket::records(&st.name),
                index_kinds: None,
                lower: lower.clone(),
                upper: upper.clone(),
                desc: plan.desc,
                last: None,
                batch: VecDeque::new(),
                batch_size,
                seen_mutations: tx.mutations,
                started: false,
            },
        };

        let needs_values = want_values
            || !self.filters.is_empty()
            || plan.norder < self.orders.len();
        self.exec = Some(ExecState {
            plan,
            src,
            want_values: needs_values,
            limit: self.limit,
            pending: VecDeque::new(),
            collect: Vec::new(),
            group: None,
            source_done: false,
            emitted: 0,
        });
        Ok(())
    }

    /// The next match in final emit order, or `None` when done.
    pub(crate) fn step(&mut self) -> Result<Option<Match>> {
        loop {
            let Query {
                binding,
                st,
                filters,
                orders,
                exec,
                ..
            } = &mut *self;
            let tx: &mut Tx<'db> = match binding {
                Binding::Tx(tx) => tx,
                Binding::Db { tx, .. } => match tx.as_mut() {
                    Some(tx) => tx,
                    None => return Err(Error::store("query stepped without transaction")),
                },
            };
            let Some(ex) = exec.as_mut() else {
                return Err(Error::store("query stepped before start"));
            };

            if let Some(limit) = ex.limit {
                if ex.emitted >= limit {
                    return Ok(None);
                }
            }
            if let Some(m) = ex.pending.pop_front() {
                ex.emitted += 1;
                return Ok(Some(m));
            }
            if ex.source_done {
                if ex.collect.is_empty() {
                    return Ok(None);
                }
                flush(ex, orders, tx)?;
                continue;
            }

            let Some((key, value)) = source_next(tx, ex)? else {
                ex.source_done = true;
                if !ex.collect.is_empty() {
                    flush(ex, orders, tx)?;
                }
                continue;
            };
            let Some(m) = materialize(tx, st, ex, filters, &key, &value)? else {
                continue;
            };
            route(ex, orders, tx, m)?;
        }
    }
}

/// Pull one raw entry from the source: (pk, record) for record-backed
/// sources, (index key, empty) for index-backed ones.
fn source_next(tx: &mut Tx<'_>, ex: &mut ExecState) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
    tx.check()?;
    match &mut ex.src {
        Source::Keys { records, keys, pos } => {
            while *pos < keys.len() {
                let k = keys[*pos].clone();
                *pos += 1;
                tx.stats.records.get += 1;
                if let Some(v) = tx.raw.get(records, &k)? {
                    return Ok(Some((k, v)));
                }
            }
            Ok(None)
        }
        Source::Unique {
            index,
            prefixes,
            pos,
        } => {
            while *pos < prefixes.len() {
                let prefix = prefixes[*pos].clone();
                *pos += 1;
                tx.stats.index.cursor += 1;
                let upper = prefix_successor(&prefix);
                let upper = match &upper {
                    Some(u) => Bound::Excluded(u.as_slice()),
                    None => Bound::Unbounded,
                };
                let mut hit =
                    tx.raw
                        .seek(index, Bound::Included(prefix.as_slice()), upper, false, 1)?;
                if let Some((k, _)) = hit.pop() {
                    return Ok(Some((k, Vec::new())));
                }
            }
            Ok(None)
        }
        Source::Scan {
            bucket,
            lower,
            upper,
            desc,
            last,
            batch,
            batch_size,
            seen_mutations,
            started,
            index_kinds,
        } => {
            if *seen_mutations != tx.mutations {
                batch.clear();
                if *started {
                    tx.stats.reseek += 1;
                }
                *seen_mutations = tx.mutations;
            }
            if batch.is_empty() {
                let (lo, hi) = match (&*last, *desc) {
                    (Some(l), false) => (Bound::Excluded(l.as_slice()), bound_ref(upper)),
                    (Some(l), true) => (bound_ref(lower), Bound::Excluded(l.as_slice())),
                    (None, _) => (bound_ref(lower), bound_ref(upper)),
                };
                if index_kinds.is_some() {
                    tx.stats.index.cursor += 1;
                } else {
                    tx.stats.records.cursor += 1;
                }
                let entries = tx.raw.seek(bucket, lo, hi, *desc, *batch_size)?;
                batch.extend(entries);
                if batch.is_empty() {
                    return Ok(None);
                }
            }
            let (k, v) = match batch.pop_front() {
                Some(e) => e,
                None => return Ok(None),
            };
            *last = Some(k.clone());
            *started = true;
            Ok(Some((k, v)))
        }
    }
}

/// Turn a raw entry into a match: resolve the primary key, fetch/decode the
/// record when needed, apply residual filters.
fn materialize<T: Record>(
    tx: &mut Tx<'_>,
    st: &std::sync::Arc<StoreType>,
    ex: &mut ExecState,
    filters: &mut [Filter<T>],
    key: &[u8],
    value: &[u8],
) -> Result<Option<Match>> {
    let tv = &st.current;
    let index_kinds = match &ex.src {
        Source::Unique { .. } => {
            let PlanKind::Unique { index, .. } = &ex.plan.kind else {
                return Err(Error::store("unique source without unique plan"));
            };
            Some(
                tv.index_kinds(&tv.indices[index])?
                    .into_iter()
                    .cloned()
                    .collect::<Vec<_>>(),
            )
        }
        Source::Scan { index_kinds, .. } => index_kinds.clone(),
        Source::Keys { .. } => None,
    };

    let (pk_bytes, record): (Vec<u8>, Option<Vec<u8>>) = match index_kinds {
        Some(kinds) => {
            let refs: Vec<&Kind> = kinds.iter().collect();
            let (_, _, pk) = parse_index_key(&refs, key)?;
            let pk = pk.to_vec();
            let need_record = ex.want_values;
            let record = if need_record {
                tx.stats.records.get += 1;
                let data = tx
                    .raw
                    .get(&bucket::records(&tv.name), &pk)?
                    .ok_or_else(|| {
                        Error::store(format!("index key without {} record", tv.name))
                    })?;
                Some(data)
            } else {
                None
            };
            (pk, record)
        }
        None => (key.to_vec(), Some(value.to_vec())),
    };

    let pk_value = parse_pk(&tv.pk().typ.kind, &pk_bytes)?;
    let values = match &record {
        Some(data) if ex.want_values => Some(st.decode(&pk_bytes, data)?),
        _ => None,
    };

    if !filters.is_empty() {
        let Some(values) = &values else {
            return Err(Error::store("residual filters without loaded values"));
        };
        let mut rec: Option<T> = None;
        for f in filters.iter_mut() {
            if !filter_matches(f, tv, values, &mut rec)? {
                return Ok(None);
            }
        }
    }

    Ok(Some(Match {
        st: st.clone(),
        pk_value,
        values,
    }))
}

fn filter_matches<T: Record>(
    f: &mut Filter<T>,
    tv: &crate::schema::TypeVersion,
    values: &[Value],
    rec: &mut Option<T>,
) -> Result<bool> {
    Ok(match f {
        Filter::Pk(v) => values[0] == *v,
        Filter::Pks(vs) => vs.contains(&values[0]),
        Filter::Equal(fi, v) => values[*fi] == *v,
        Filter::NotEqual(fi, v) => values[*fi] != *v,
        Filter::In(fi, vs) => match (&tv.fields[*fi].typ.kind, &values[*fi]) {
            (Kind::List(_), Value::List(elems)) => elems.iter().any(|e| vs.contains(e)),
            (_, v) => vs.contains(v),
        },
        Filter::Compare(fi, cmp, v) => {
            use std::cmp::Ordering::*;
            let ord = values[*fi].cmp_order(v)?;
            match cmp {
                plan::Cmp::Gt => ord == Greater,
                plan::Cmp::Ge => ord != Less,
                plan::Cmp::Lt => ord == Less,
                plan::Cmp::Le => ord != Greater,
            }
        }
        Filter::Predicate(p) => {
            if rec.is_none() {
                *rec = Some(T::from_values(values.to_vec())?);
            }
            match rec {
                Some(r) => p(r),
                None => false,
            }
        }
    })
}

/// Place a match according to how much of the sort the plan satisfies.
fn route(ex: &mut ExecState, orders: &[Order], tx: &mut Tx<'_>, m: Match) -> Result<()> {
    let norder = ex.plan.norder;
    if orders.is_empty() || norder == orders.len() {
        ex.pending.push_back(m);
        return Ok(());
    }
    if norder == 0 {
        ex.collect.push(m);
        return Ok(());
    }
    // Stowed sort: group on the satisfied prefix, sort the group on the
    // rest when the prefix value changes.
    let key: Vec<Value> = {
        let Some(values) = &m.values else {
            return Err(Error::store("stowed sort without loaded values"));
        };
        orders[..norder].iter().map(|o| values[o.field].clone()).collect()
    };
    if ex.group.as_ref() != Some(&key) {
        if !ex.collect.is_empty() {
            flush(ex, orders, tx)?;
        }
        ex.group = Some(key);
    }
    ex.collect.push(m);
    Ok(())
}

/// Sort the collected matches on the unsatisfied sort keys and queue them
/// for emission.
fn flush(ex: &mut ExecState, orders: &[Order], tx: &mut Tx<'_>) -> Result<()> {
    let rest = &orders[ex.plan.norder.min(orders.len())..];
    let mut collected = std::mem::take(&mut ex.collect);
    if !rest.is_empty() && collected.len() > 1 {
        tx.stats.sort += 1;
        let mut err = None;
        collected.sort_by(|a, b| {
            use std::cmp::Ordering;
            let (Some(av), Some(bv)) = (&a.values, &b.values) else {
                err.get_or_insert(Error::store("sort without loaded values"));
                return Ordering::Equal;
            };
            for o in rest {
                match av[o.field].cmp_order(&bv[o.field]) {
                    Ok(Ordering::Equal) => continue,
                    Ok(ord) => return if o.asc { ord } else { ord.reverse() },
                    Err(e) => {
                        err.get_or_insert(e);
                        return Ordering::Equal;
                    }
                }
            }
            Ordering::Equal
        });
        if let Some(e) = err {
            return Err(e);
        }
    }
    ex.pending.extend(collected);
    Ok(())
}

fn bound_ref(b: &Bound<Vec<u8>>) -> Bound<&[u8]> {
    match b {
        Bound::Included(v) => Bound::Included(v.as_slice()),
        Bound::Excluded(v) => Bound::Excluded(v.as_slice()),
        Bound::Unbounded => Bound::Unbounded,
    }
}
