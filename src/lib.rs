//! # structdb — an embedded, typed, schema-versioned record store
//!
//! structdb stores Rust record types in a single redb-backed file and keeps
//! the bookkeeping an application would otherwise hand-roll: auto-assigned
//! integer primary keys, secondary and unique indices, referential
//! integrity, default values, nonzero constraints, and schema versions that
//! keep old records readable as types evolve. Queries combine filters,
//! sorting and limits, and a planner executes them through primary-key
//! lookups, unique-index lookups, index range scans or table scans.
//!
//! ## Declaring a type
//!
//! A stored type implements [`Record`]: it describes its shape once and
//! converts between the struct and dynamic field values. The first field is
//! the primary key. Field behavior is declared with tags:
//!
//! ```ignore
//! struct Msg {
//!     id: i64,
//!     mailbox_id: u32,
//!     uid: u32,
//!     received: DateTime<Utc>,
//! }
//!
//! impl Record for Msg {
//!     fn type_def() -> TypeDef {
//!         TypeDef::new("Msg")
//!             .field("ID", FieldType::plain(Kind::Int64), "")
//!             .field(
//!                 "MailboxID",
//!                 FieldType::plain(Kind::Uint32),
//!                 "unique MailboxID+UID,index MailboxID+Received,ref Mailbox",
//!             )
//!             .field("UID", FieldType::plain(Kind::Uint32), "")
//!             .field("Received", FieldType::plain(Kind::Time), "")
//!     }
//!     // to_values / from_values convert in declared field order.
//! }
//! ```
//!
//! Tags: `-`, `name X`, `nonzero`, `noauto`, `index`/`index A+B [name]`,
//! `unique`/`unique A+B [name]`, `ref T`, `default V` (`now` for time
//! fields), `typename N`.
//!
//! ## Using the database
//!
//! ```ignore
//! let db = Database::open("mail.db", Options::default())?;
//! let ctx = Context::background();
//! db.register(&ctx, vec![Mailbox::registration(), Msg::registration()])?;
//!
//! let mut mb = Mailbox { id: 0, name: "INBOX".into() };
//! db.insert(&ctx, &mut mb)?; // mb.id now assigned
//!
//! let unseen: Vec<Msg> = db
//!     .query::<Msg>(&ctx)?
//!     .filter_equal("MailboxID", mb.id)
//!     .filter_equal("Seen", false)
//!     .sort_desc(&["Received"])
//!     .list()?;
//! ```
//!
//! Registration is also where schema changes happen: new versions are
//! persisted, indices are (re)created, and fresh `nonzero`/`ref`/`unique`
//! constraints are validated against existing records before the change
//! commits.
//!
//! ## Consistency model
//!
//! One writer or many readers at a time, serializable, with snapshot reads;
//! transactions roll back on error or panic. A transaction that failed
//! halfway through a multi-write operation is *botched*: it refuses further
//! operations and commit rolls back. Every store-touching step checks the
//! supplied [`Context`] for cancellation or deadline.
//!
//! The file format assumes the host's endianness for the underlying store's
//! pages; numeric key widths are explicit on disk.

pub mod context;
pub mod db;
pub mod encoding;
pub mod error;
mod index;
pub mod query;
pub mod schema;
pub mod stats;
mod store;
pub mod types;

pub use context::{CancelHandle, Clock, Context};
pub use db::{Database, Options, Tx};
pub use error::{Error, Result};
pub use query::Query;
pub use stats::{BucketStats, Stats};
pub use types::{Field, FieldType, Kind, Record, Registration, StructShape, TypeDef, Value};
