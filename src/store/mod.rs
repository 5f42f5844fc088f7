//! # Store Adapter
//!
//! Bucket semantics over redb. Each bucket is a redb table of `&[u8]` keys
//! and values, named `<type>/records`, `<type>/types` or
//! `<type>/index.<name>`; redb orders keys byte-lexicographically, which is
//! what the key codec is built for. A single static `sequences` table holds
//! the per-type primary-key sequence counters.
//!
//! Cursors are stateless: every step is a bounded range query keyed by the
//! last emitted key, ascending or descending, fetching a small batch. No
//! iterator lives across calls, so mutating a bucket mid-scan is safe by
//! construction; the executor still tracks mutations to report reseeks.

use std::ops::Bound;
use std::path::Path;
use std::time::{Duration, Instant};

use redb::{ReadableTable, ReadableTableMetadata, TableDefinition, TableHandle};

use crate::error::{Error, Result};

const SEQUENCES: TableDefinition<&str, u64> = TableDefinition::new("sequences");

fn bucket_def(name: &str) -> TableDefinition<'_, &'static [u8], &'static [u8]> {
    TableDefinition::new(name)
}

/// The open database file.
pub(crate) struct Store {
    db: redb::Database,
}

impl Store {
    /// Open or create the file. When another handle holds the exclusive
    /// lock, retries until `timeout` (if set) and then reports
    /// [`Error::Timeout`]; without a timeout the lock failure surfaces
    /// immediately as [`Error::Store`].
    pub fn open(path: &Path, timeout: Option<Duration>, must_exist: bool) -> Result<Store> {
        if must_exist && !path.exists() {
            return Err(Error::Absent(format!("database file {}", path.display())));
        }
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            match redb::Database::create(path) {
                Ok(db) => return Ok(Store { db }),
                Err(redb::DatabaseError::DatabaseAlreadyOpen) => match deadline {
                    Some(d) if Instant::now() < d => {
                        std::thread::sleep(Duration::from_millis(10));
                    }
                    Some(_) => return Err(Error::Timeout),
                    None => return Err(Error::store("database file is locked")),
                },
                Err(e) => return Err(e.into()),
            }
        }
    }

    pub fn begin_read(&self) -> Result<RawTx> {
        Ok(RawTx::Read(self.db.begin_read()?))
    }

    pub fn begin_write(&self) -> Result<RawTx> {
        Ok(RawTx::Write(self.db.begin_write()?))
    }
}

/// A raw store transaction over buckets.
pub(crate) enum RawTx {
    Read(redb::ReadTransaction),
    Write(redb::WriteTransaction),
}

impl RawTx {
    pub fn writable(&self) -> bool {
        matches!(self, RawTx::Write(_))
    }

    fn write_tx(&self) -> Result<&redb::WriteTransaction> {
        match self {
            RawTx::Write(tx) => Ok(tx),
            RawTx::Read(_) => Err(Error::NotWritable),
        }
    }

    pub fn get(&self, bucket: &str, key: &[u8]) -> Result<Option<Vec<u8>>> {
        match self {
            RawTx::Read(tx) => match tx.open_table(bucket_def(bucket)) {
                Ok(t) => Ok(t.get(key)?.map(|g| g.value().to_vec())),
                Err(redb::TableError::TableDoesNotExist(_)) => Ok(None),
                Err(e) => Err(e.into()),
            },
            RawTx::Write(tx) => {
                let t = tx.open_table(bucket_def(bucket))?;
                let v = t.get(key)?.map(|g| g.value().to_vec());
                Ok(v)
            }
        }
    }

    pub fn put(&self, bucket: &str, key: &[u8], value: &[u8]) -> Result<()> {
        let tx = self.write_tx()?;
        let mut t = tx.open_table(bucket_def(bucket))?;
        t.insert(key, value)?;
        Ok(())
    }

    /// Delete a key; reports whether it existed.
    pub fn delete(&self, bucket: &str, key: &[u8]) -> Result<bool> {
        let tx = self.write_tx()?;
        let mut t = tx.open_table(bucket_def(bucket))?;
        let existed = t.remove(key)?.is_some();
        Ok(existed)
    }

    /// Create the bucket if it does not exist yet.
    pub fn ensure_bucket(&self, bucket: &str) -> Result<()> {
        let tx = self.write_tx()?;
        tx.open_table(bucket_def(bucket))?;
        Ok(())
    }

    pub fn delete_bucket(&self, bucket: &str) -> Result<bool> {
        let tx = self.write_tx()?;
        Ok(tx.delete_table(bucket_def(bucket))?)
    }

    /// Names of all buckets, `sequences` excluded.
    pub fn bucket_names(&self) -> Result<Vec<String>> {
        let names: Vec<String> = match self {
            RawTx::Read(tx) => tx
                .list_tables()?
                .map(|h| h.name().to_string())
                .collect(),
            RawTx::Write(tx) => tx
                .list_tables()?
                .map(|h| h.name().to_string())
                .collect(),
        };
        Ok(names
            .into_iter()
            .filter(|n| n != SEQUENCES.name())
            .collect())
    }

    /// Number of keys in a bucket.
    pub fn bucket_len(&self, bucket: &str) -> Result<u64> {
        match self {
            RawTx::Read(tx) => match tx.open_table(bucket_def(bucket)) {
                Ok(t) => Ok(t.len()?),
                Err(redb::TableError::TableDoesNotExist(_)) => Ok(0),
                Err(e) => Err(e.into()),
            },
            RawTx::Write(tx) => Ok(tx.open_table(bucket_def(bucket))?.len()?),
        }
    }

    /// Visit every key/value in byte order. The callback must not mutate the
    /// bucket; use a cursor-driven scan for that.
    pub fn for_each(
        &self,
        bucket: &str,
        mut f: impl FnMut(&[u8], &[u8]) -> Result<()>,
    ) -> Result<()> {
        match self {
            RawTx::Read(tx) => match tx.open_table(bucket_def(bucket)) {
                Ok(t) => {
                    for entry in t.range::<&[u8]>(..)? {
                        let (k, v) = entry?;
                        f(k.value(), v.value())?;
                    }
                    Ok(())
                }
                Err(redb::TableError::TableDoesNotExist(_)) => Ok(()),
                Err(e) => Err(e.into()),
            },
            RawTx::Write(tx) => {
                let t = tx.open_table(bucket_def(bucket))?;
                for entry in t.range::<&[u8]>(..)? {
                    let (k, v) = entry?;
                    f(k.value(), v.value())?;
                }
                Ok(())
            }
        }
    }

    /// One cursor step: up to `limit` entries of `bucket` within the bounds,
    /// from the low end ascending or the high end descending.
    pub fn seek(
        &self,
        bucket: &str,
        lower: Bound<&[u8]>,
        upper: Bound<&[u8]>,
        desc: bool,
        limit: usize,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        fn collect<T: ReadableTable<&'static [u8], &'static [u8]>>(
            t: &T,
            bounds: (Bound<&[u8]>, Bound<&[u8]>),
            desc: bool,
            limit: usize,
        ) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
            let mut range = t.range::<&[u8]>(bounds)?;
            let mut out = Vec::with_capacity(limit.min(64));
            while out.len() < limit {
                let entry = if desc { range.next_back() } else { range.next() };
                match entry {
                    Some(e) => {
                        let (k, v) = e?;
                        out.push((k.value().to_vec(), v.value().to_vec()));
                    }
                    None => break,
                }
            }
            Ok(out)
        }

        match self {
            RawTx::Read(tx) => match tx.open_table(bucket_def(bucket)) {
                Ok(t) => collect(&t, (lower, upper), desc, limit),
                Err(redb::TableError::TableDoesNotExist(_)) => Ok(Vec::new()),
                Err(e) => Err(e.into()),
            },
            RawTx::Write(tx) => {
                let t = tx.open_table(bucket_def(bucket))?;
                collect(&t, (lower, upper), desc, limit)
            }
        }
    }

    /// Current sequence value for a type (last assigned; 0 when unused).
    pub fn sequence(&self, name: &str) -> Result<u64> {
        match self {
            RawTx::Read(tx) => match tx.open_table(SEQUENCES) {
                Ok(t) => Ok(t.get(name)?.map_or(0, |g| g.value())),
                Err(redb::TableError::TableDoesNotExist(_)) => Ok(0),
                Err(e) => Err(e.into()),
            },
            RawTx::Write(tx) => {
                let t = tx.open_table(SEQUENCES)?;
                let v = t.get(name)?.map_or(0, |g| g.value());
                Ok(v)
            }
        }
    }

    pub fn set_sequence(&self, name: &str, v: u64) -> Result<()> {
        let tx = self.write_tx()?;
        let mut t = tx.open_table(SEQUENCES)?;
        t.insert(name, v)?;
        Ok(())
    }

    /// Advance and return the next sequence value.
    pub fn next_sequence(&self, name: &str) -> Result<u64> {
        let tx = self.write_tx()?;
        let mut t = tx.open_table(SEQUENCES)?;
        let cur = t.get(name)?.map_or(0, |g| g.value());
        let next = cur
            .checked_add(1)
            .ok_or_else(|| Error::Seq(format!("sequence for {name} exhausted")))?;
        t.insert(name, next)?;
        Ok(next)
    }

    pub fn delete_sequence(&self, name: &str) -> Result<()> {
        let tx = self.write_tx()?;
        let mut t = tx.open_table(SEQUENCES)?;
        t.remove(name)?;
        Ok(())
    }

    pub fn commit(self) -> Result<()> {
        match self {
            RawTx::Read(_) => Ok(()),
            RawTx::Write(tx) => Ok(tx.commit()?),
        }
    }

    pub fn rollback(self) -> Result<()> {
        match self {
            RawTx::Read(_) => Ok(()),
            RawTx::Write(tx) => Ok(tx.abort()?),
        }
    }
}

/// Bucket name helpers; one place knows the layout.
pub(crate) mod bucket {
    pub fn records(type_name: &str) -> String {
        format!("{type_name}/records")
    }

    pub fn types(type_name: &str) -> String {
        format!("{type_name}/types")
    }

    pub fn index(type_name: &str, index_name: &str) -> String {
        format!("{type_name}/index.{index_name}")
    }

    /// The `<type>/` prefix owning every bucket of a type.
    pub fn type_prefix(type_name: &str) -> String {
        format!("{type_name}/")
    }

    /// Split a bucket name into type name and member (`records`, `types`,
    /// `index.X`).
    pub fn split(bucket: &str) -> Option<(&str, &str)> {
        bucket.split_once('/')
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_temp() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(&dir.path().join("t.db"), None, false).unwrap();
        (dir, store)
    }

    #[test]
    fn put_get_delete() {
        let (_dir, store) = open_temp();
        let tx = store.begin_write().unwrap();
        tx.put("T/records", b"k", b"v").unwrap();
        assert_eq!(tx.get("T/records", b"k").unwrap().unwrap(), b"v");
        assert!(tx.delete("T/records", b"k").unwrap());
        assert!(!tx.delete("T/records", b"k").unwrap());
        tx.commit().unwrap();
    }

    #[test]
    fn read_of_missing_bucket_is_empty() {
        let (_dir, store) = open_temp();
        let tx = store.begin_read().unwrap();
        assert_eq!(tx.get("Nope/records", b"k").unwrap(), None);
        assert_eq!(tx.bucket_len("Nope/records").unwrap(), 0);
    }

    #[test]
    fn seek_ascending_and_descending() {
        let (_dir, store) = open_temp();
        let tx = store.begin_write().unwrap();
        for k in [b"a", b"b", b"c"] {
            tx.put("T/records", k, b"").unwrap();
        }
        let asc = tx
            .seek("T/records", Bound::Excluded(b"a".as_ref()), Bound::Unbounded, false, 10)
            .unwrap();
        assert_eq!(asc.iter().map(|(k, _)| k.as_slice()).collect::<Vec<_>>(), [b"b", b"c"]);
        let desc = tx
            .seek("T/records", Bound::Unbounded, Bound::Excluded(b"c".as_ref()), true, 1)
            .unwrap();
        assert_eq!(desc[0].0, b"b");
        tx.rollback().unwrap();
    }

    #[test]
    fn sequences_advance_and_persist() {
        let (_dir, store) = open_temp();
        let tx = store.begin_write().unwrap();
        assert_eq!(tx.next_sequence("T").unwrap(), 1);
        assert_eq!(tx.next_sequence("T").unwrap(), 2);
        tx.set_sequence("T", 10).unwrap();
        assert_eq!(tx.next_sequence("T").unwrap(), 11);
        tx.commit().unwrap();
        let tx = store.begin_read().unwrap();
        assert_eq!(tx.sequence("T").unwrap(), 11);
    }

    #[test]
    fn snapshot_isolation_for_readers() {
        let (_dir, store) = open_temp();
        let w = store.begin_write().unwrap();
        w.put("T/records", b"k", b"v1").unwrap();
        w.commit().unwrap();

        let r = store.begin_read().unwrap();
        let w = store.begin_write().unwrap();
        w.put("T/records", b"k", b"v2").unwrap();
        w.commit().unwrap();
        // Reader still sees the snapshot taken at begin.
        assert_eq!(r.get("T/records", b"k").unwrap().unwrap(), b"v1");
    }
}
