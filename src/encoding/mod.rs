//! # On-Disk Encoding
//!
//! Two codecs live here with different goals:
//!
//! - [`key`]: order-preserving encodings for primary keys and index keys.
//!   Fixed width per kind, comparable with a single memcmp. Never used for
//!   record payloads.
//! - [`record`]: self-describing record payloads: a presence bitmap plus
//!   variable-length field encodings, versioned so historical records stay
//!   readable across schema changes.
//!
//! [`varint`] provides the LEB128/zig-zag integers the record codec builds on.

pub mod key;
pub mod record;
pub mod varint;
