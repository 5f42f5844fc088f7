//! Operation counters.
//!
//! Counters accumulate on the transaction and merge into the database totals
//! on commit. `sub` yields per-period deltas for monitoring loops.

/// Get/put/delete/cursor counts against one bucket family.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BucketStats {
    pub get: u64,
    pub put: u64,
    pub delete: u64,
    pub cursor: u64,
}

impl BucketStats {
    fn add(&mut self, o: &BucketStats) {
        self.get += o.get;
        self.put += o.put;
        self.delete += o.delete;
        self.cursor += o.cursor;
    }

    fn sub(&self, o: &BucketStats) -> BucketStats {
        BucketStats {
            get: self.get - o.get,
            put: self.put - o.put,
            delete: self.delete - o.delete,
            cursor: self.cursor - o.cursor,
        }
    }
}

/// Database/transaction statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    /// Read transactions begun.
    pub reads: u64,
    /// Write transactions begun.
    pub writes: u64,

    pub get: u64,
    pub insert: u64,
    pub update: u64,
    pub delete: u64,
    pub queries: u64,

    /// Queries answered by direct primary-key lookup.
    pub plan_pk: u64,
    /// Queries answered through a full unique-index key.
    pub plan_unique: u64,
    /// Queries answered by an index range scan.
    pub plan_index_scan: u64,
    /// Queries that fell back to scanning the records bucket.
    pub plan_table_scan: u64,
    /// In-memory sorts performed.
    pub sort: u64,
    /// Cursor repositionings after a mutation invalidated the position.
    pub reseek: u64,

    /// Whether the last planned query came back in requested order without
    /// an in-memory sort.
    pub last_ordered: bool,
    /// Scan direction of the last planned query.
    pub last_asc: bool,

    pub records: BucketStats,
    pub index: BucketStats,
}

impl Stats {
    /// Merge transaction counters into the totals. The `last_*` markers take
    /// the newer value.
    pub(crate) fn add(&mut self, o: &Stats) {
        self.reads += o.reads;
        self.writes += o.writes;
        self.get += o.get;
        self.insert += o.insert;
        self.update += o.update;
        self.delete += o.delete;
        self.queries += o.queries;
        self.plan_pk += o.plan_pk;
        self.plan_unique += o.plan_unique;
        self.plan_index_scan += o.plan_index_scan;
        self.plan_table_scan += o.plan_table_scan;
        self.sort += o.sort;
        self.reseek += o.reseek;
        self.last_ordered = o.last_ordered;
        self.last_asc = o.last_asc;
        self.records.add(&o.records);
        self.index.add(&o.index);
    }

    /// Delta between this snapshot and an earlier one.
    pub fn sub(&self, o: &Stats) -> Stats {
        Stats {
            reads: self.reads - o.reads,
            writes: self.writes - o.writes,
            get: self.get - o.get,
            insert: self.insert - o.insert,
            update: self.update - o.update,
            delete: self.delete - o.delete,
            queries: self.queries - o.queries,
            plan_pk: self.plan_pk - o.plan_pk,
            plan_unique: self.plan_unique - o.plan_unique,
            plan_index_scan: self.plan_index_scan - o.plan_index_scan,
            plan_table_scan: self.plan_table_scan - o.plan_table_scan,
            sort: self.sort - o.sort,
            reseek: self.reseek - o.reseek,
            last_ordered: self.last_ordered,
            last_asc: self.last_asc,
            records: self.records.sub(&o.records),
            index: self.index.sub(&o.index),
        }
    }
}
