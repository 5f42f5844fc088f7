//! # Query Planner
//!
//! Picks exactly one execution strategy for a query:
//!
//! 1. **PK plan** — any primary-key equality or set clause: direct lookups,
//!    inherently in key order.
//! 2. **Unique plan** — a unique index whose full key is pinned by
//!    equality/set clauses: at most one record per combination.
//! 3. **Index scan** — the index scoring best on pinned equality prefix,
//!    range restriction and satisfied sort prefix; ascending or descending
//!    to match the first sort key.
//! 4. **Table scan** — records in primary-key order, possibly bounded by PK
//!    range clauses.
//!
//! Clauses consumed by the plan are removed from the filter list; the rest
//! stay behind as residual in-memory filters. The planner only moves
//! counters and builds bounds; it never touches the store, so plan choice
//! can never change a result set.

use std::ops::Bound;

use tracing::trace;

use crate::encoding::key::{pack_index_field, pack_pk, prefix_successor};
use crate::error::Result;
use crate::schema::TypeVersion;
use crate::stats::Stats;
use crate::types::{Kind, Record, Value};

use super::Filter;

/// Range comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Cmp {
    Gt,
    Ge,
    Lt,
    Le,
}

/// One sort key, by field position.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Order {
    pub field: usize,
    pub asc: bool,
}

/// The chosen strategy plus ordering metadata.
pub(crate) struct Plan {
    pub kind: PlanKind,
    /// Scan direction (meaningful for scans; key lists are pre-sorted).
    pub desc: bool,
    /// How many leading sort keys the plan satisfies without sorting.
    pub norder: usize,
}

pub(crate) enum PlanKind {
    /// Direct record lookups, keys pre-sorted in emit order.
    Pk { keys: Vec<Vec<u8>> },
    /// At most one record per index-key prefix.
    Unique { index: String, prefixes: Vec<Vec<u8>> },
    /// Range scan over an index bucket.
    IndexScan {
        index: String,
        lower: Bound<Vec<u8>>,
        upper: Bound<Vec<u8>>,
    },
    /// Scan of the records bucket in key order.
    TableScan {
        lower: Bound<Vec<u8>>,
        upper: Bound<Vec<u8>>,
    },
}

/// Select the plan, removing consumed clauses from `filters`.
pub(crate) fn plan<T: Record>(
    tv: &TypeVersion,
    filters: &mut Vec<Filter<T>>,
    orders: &[Order],
    stats: &mut Stats,
) -> Result<Plan> {
    let plan = select(tv, filters, orders, stats)?;
    stats.last_ordered = orders.is_empty() || plan.norder == orders.len();
    stats.last_asc = !plan.desc;
    Ok(plan)
}

fn select<T: Record>(
    tv: &TypeVersion,
    filters: &mut Vec<Filter<T>>,
    orders: &[Order],
    stats: &mut Stats,
) -> Result<Plan> {
    // 1. Primary-key clauses win outright.
    if let Some(i) = filters.iter().position(|f| matches!(f, Filter::Pk(_) | Filter::Pks(_))) {
        let pk_kind = &tv.pk().typ.kind;
        let values = match filters.remove(i) {
            Filter::Pk(v) => vec![v],
            Filter::Pks(vs) => vs,
            _ => unreachable!(),
        };
        let mut keys = Vec::with_capacity(values.len());
        for v in &values {
            keys.push(pack_pk(pk_kind, v)?.to_vec());
        }
        keys.sort();
        keys.dedup();
        let desc = matches!(orders.first(), Some(o) if o.field == 0 && !o.asc);
        if desc {
            keys.reverse();
        }
        let norder = match orders.first() {
            Some(o) if o.field == 0 => orders.len(),
            Some(_) => 0,
            None => 0,
        };
        stats.plan_pk += 1;
        trace!(type_name = %tv.name, keys = keys.len(), "plan: primary key");
        return Ok(Plan {
            kind: PlanKind::Pk { keys },
            desc,
            norder,
        });
    }

    // 2. A unique index whose key is fully pinned by equality/set clauses.
    for (iname, idx) in tv.indices.iter().filter(|(_, idx)| idx.unique) {
        let mut used: Vec<usize> = Vec::with_capacity(idx.fields.len());
        let mut combos: Vec<Vec<u8>> = vec![Vec::new()];
        let mut ok = true;
        for fname in &idx.fields {
            let Some((fi, f)) = tv.field(fname) else {
                ok = false;
                break;
            };
            let found = filters.iter().position(|flt| match flt {
                Filter::Equal(i, _) | Filter::In(i, _) => *i == fi,
                _ => false,
            });
            let Some(pos) = found else {
                ok = false;
                break;
            };
            let values: Vec<&Value> = match &filters[pos] {
                Filter::Equal(_, v) => vec![v],
                Filter::In(_, vs) => vs.iter().collect(),
                _ => unreachable!(),
            };
            let mut next = Vec::with_capacity(combos.len() * values.len());
            for c in &combos {
                for v in &values {
                    let mut key = c.clone();
                    pack_index_field(&f.typ.kind, v, &mut key)?;
                    next.push(key);
                }
            }
            combos = next;
            used.push(pos);
        }
        if !ok {
            continue;
        }
        used.sort_unstable_by(|a, b| b.cmp(a));
        for pos in used {
            filters.remove(pos);
        }
        combos.sort();
        combos.dedup();
        stats.plan_unique += 1;
        trace!(type_name = %tv.name, index = %iname, combos = combos.len(), "plan: unique index");
        return Ok(Plan {
            kind: PlanKind::Unique {
                index: iname.clone(),
                prefixes: combos,
            },
            desc: false,
            norder: 0,
        });
    }

    // 3. Best index by equality prefix, range restriction and sort prefix.
    struct Candidate {
        iname: String,
        eq: Vec<(usize, usize)>, // (filter position, field position) pins
        range: Option<RangeSpec>,
        norder: usize,
        score: usize,
    }
    struct RangeSpec {
        field: usize, // tv field position
        lo: Option<(Value, bool)>,
        hi: Option<(Value, bool)>,
        positions: Vec<usize>, // consumed filter positions
    }

    let mut best: Option<Candidate> = None;
    'indices: for (iname, idx) in &tv.indices {
        let mut field_pos = Vec::with_capacity(idx.fields.len());
        let mut slice = Vec::with_capacity(idx.fields.len());
        for fname in &idx.fields {
            let Some((fi, f)) = tv.field(fname) else {
                continue 'indices;
            };
            field_pos.push(fi);
            slice.push(matches!(f.typ.kind, Kind::List(_)));
        }

        // Leading equality pins. A slice field pins through a single-value
        // contains clause.
        let mut eq: Vec<(usize, usize)> = Vec::new();
        let mut neq = 0;
        for (i, &fi) in field_pos.iter().enumerate() {
            let found = filters.iter().position(|flt| match flt {
                Filter::Equal(p, _) => !slice[i] && *p == fi,
                Filter::In(p, vs) => slice[i] && *p == fi && vs.len() == 1,
                _ => false,
            });
            match found {
                Some(pos) => {
                    eq.push((pos, fi));
                    neq = i + 1;
                }
                None => break,
            }
        }
        // A slice field that is not pinned would emit one key per element:
        // unusable as a scan.
        if slice.iter().skip(neq).any(|s| *s) {
            continue;
        }

        // Range clauses on the first unpinned field.
        let mut range = None;
        if let Some(&fi) = field_pos.get(neq) {
            let mut lo: Option<(Value, bool)> = None;
            let mut hi: Option<(Value, bool)> = None;
            let mut positions = Vec::new();
            for (pos, flt) in filters.iter().enumerate() {
                let Filter::Compare(p, cmp, v) = flt else {
                    continue;
                };
                if *p != fi {
                    continue;
                }
                match cmp {
                    Cmp::Gt | Cmp::Ge => {
                        let incl = *cmp == Cmp::Ge;
                        if tighter(&lo, v, incl, true)? {
                            lo = Some((v.clone(), incl));
                        }
                    }
                    Cmp::Lt | Cmp::Le => {
                        let incl = *cmp == Cmp::Le;
                        if tighter(&hi, v, incl, false)? {
                            hi = Some((v.clone(), incl));
                        }
                    }
                }
                positions.push(pos);
            }
            if !positions.is_empty() {
                range = Some(RangeSpec {
                    field: fi,
                    lo,
                    hi,
                    positions,
                });
            }
        }

        // Sort keys satisfied by the index tail, single direction.
        let mut norder = 0;
        if let Some(first) = orders.first() {
            for (j, o) in orders.iter().enumerate() {
                match field_pos.get(neq + j) {
                    Some(&fi) if fi == o.field && o.asc == first.asc => norder = j + 1,
                    _ => break,
                }
            }
        }

        let score = neq * 2 + usize::from(range.is_some()) + norder;
        if score == 0 {
            continue;
        }
        if best.as_ref().is_none_or(|b| score > b.score) {
            best = Some(Candidate {
                iname: iname.clone(),
                eq,
                range,
                norder,
                score,
            });
        }
    }

    if let Some(c) = best {
        let idx = &tv.indices[&c.iname];
        // Build the scan bounds: pinned prefix, then the range encodings.
        let mut prefix = Vec::new();
        let mut consumed: Vec<usize> = Vec::new();
        for (pos, fi) in &c.eq {
            let f = &tv.fields[*fi];
            let kind = match &f.typ.kind {
                Kind::List(elem) => &elem.kind,
                k => k,
            };
            let v = match &filters[*pos] {
                Filter::Equal(_, v) => v,
                Filter::In(_, vs) => &vs[0],
                _ => unreachable!(),
            };
            pack_index_field(kind, v, &mut prefix)?;
            consumed.push(*pos);
        }

        let mut lower = if prefix.is_empty() {
            Bound::Unbounded
        } else {
            Bound::Included(prefix.clone())
        };
        let mut upper = match prefix_successor(&prefix) {
            _ if prefix.is_empty() => Bound::Unbounded,
            Some(s) => Bound::Excluded(s),
            None => Bound::Unbounded,
        };
        if let Some(r) = &c.range {
            let kind = &tv.fields[r.field].typ.kind;
            if let Some((v, incl)) = &r.lo {
                let mut k = prefix.clone();
                pack_index_field(kind, v, &mut k)?;
                lower = if *incl {
                    Bound::Included(k)
                } else {
                    // Skip every key extending this field value.
                    match prefix_successor(&k) {
                        Some(s) => Bound::Included(s),
                        None => Bound::Excluded(k),
                    }
                };
            }
            if let Some((v, incl)) = &r.hi {
                let mut k = prefix.clone();
                pack_index_field(kind, v, &mut k)?;
                upper = if *incl {
                    match prefix_successor(&k) {
                        Some(s) => Bound::Excluded(s),
                        None => Bound::Unbounded,
                    }
                } else {
                    Bound::Excluded(k)
                };
            }
            consumed.extend(r.positions.iter().copied());
        }
        consumed.sort_unstable_by(|a, b| b.cmp(a));
        for pos in consumed {
            filters.remove(pos);
        }

        let desc = c.norder > 0 && !orders[0].asc;
        stats.plan_index_scan += 1;
        trace!(type_name = %tv.name, index = %c.iname, unique = idx.unique, desc, "plan: index scan");
        return Ok(Plan {
            kind: PlanKind::IndexScan {
                index: c.iname,
                lower,
                upper,
            },
            desc,
            norder: c.norder,
        });
    }

    // 4. Table scan in primary-key order, bounded by PK range clauses.
    let pk_kind = &tv.pk().typ.kind;
    let mut lower = Bound::Unbounded;
    let mut upper = Bound::Unbounded;
    let mut consumed = Vec::new();
    let mut lo: Option<(Value, bool)> = None;
    let mut hi: Option<(Value, bool)> = None;
    for (pos, flt) in filters.iter().enumerate() {
        let Filter::Compare(p, cmp, v) = flt else {
            continue;
        };
        if *p != 0 {
            continue;
        }
        match cmp {
            Cmp::Gt | Cmp::Ge => {
                let incl = *cmp == Cmp::Ge;
                if tighter(&lo, v, incl, true)? {
                    lo = Some((v.clone(), incl));
                }
            }
            Cmp::Lt | Cmp::Le => {
                let incl = *cmp == Cmp::Le;
                if tighter(&hi, v, incl, false)? {
                    hi = Some((v.clone(), incl));
                }
            }
        }
        consumed.push(pos);
    }
    if let Some((v, incl)) = &lo {
        let k = pack_pk(pk_kind, v)?.to_vec();
        lower = if *incl {
            Bound::Included(k)
        } else {
            Bound::Excluded(k)
        };
    }
    if let Some((v, incl)) = &hi {
        let k = pack_pk(pk_kind, v)?.to_vec();
        // String/bytes keys may extend the bound value; include extensions
        // only for the inclusive form of fixed-width kinds, where none
        // exist anyway.
        upper = if *incl {
            Bound::Included(k)
        } else {
            Bound::Excluded(k)
        };
    }
    consumed.sort_unstable_by(|a, b| b.cmp(a));
    for pos in consumed {
        filters.remove(pos);
    }

    let desc = matches!(orders.first(), Some(o) if o.field == 0 && !o.asc);
    let norder = match orders.first() {
        Some(o) if o.field == 0 => orders.len(),
        _ => 0,
    };
    stats.plan_table_scan += 1;
    trace!(type_name = %tv.name, desc, "plan: table scan");
    Ok(Plan {
        kind: PlanKind::TableScan { lower, upper },
        desc,
        norder,
    })
}

/// Whether `v` narrows the current bound. `is_lower` picks the direction.
fn tighter(cur: &Option<(Value, bool)>, v: &Value, incl: bool, is_lower: bool) -> Result<bool> {
    let Some((cv, cincl)) = cur else {
        return Ok(true);
    };
    let ord = v.cmp_order(cv)?;
    Ok(match ord {
        std::cmp::Ordering::Equal => *cincl && !incl,
        std::cmp::Ordering::Greater => is_lower,
        std::cmp::Ordering::Less => !is_lower,
    })
}
