//! Shared helpers for the integration tests.

#![allow(dead_code)]

use std::path::PathBuf;

use structdb::{Context, Database, Options, Value};

pub struct TestDb {
    pub dir: tempfile::TempDir,
    pub path: PathBuf,
}

impl TestDb {
    pub fn new() -> TestDb {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.db");
        TestDb { dir, path }
    }

    pub fn open(&self) -> Database {
        Database::open(&self.path, Options::default()).unwrap()
    }

    pub fn open_with(&self, opts: Options) -> structdb::Result<Database> {
        Database::open(&self.path, opts)
    }
}

pub fn ctx() -> Context {
    Context::background()
}

pub fn as_int(v: &Value) -> i64 {
    match v {
        Value::Int(i) => *i,
        v => panic!("expected int value, got {v:?}"),
    }
}

pub fn as_uint(v: &Value) -> u64 {
    match v {
        Value::Uint(u) => *u,
        v => panic!("expected uint value, got {v:?}"),
    }
}

pub fn as_string(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        v => panic!("expected string value, got {v:?}"),
    }
}

pub fn as_bool(v: &Value) -> bool {
    match v {
        Value::Bool(b) => *b,
        v => panic!("expected bool value, got {v:?}"),
    }
}

pub fn as_time(v: &Value) -> chrono::DateTime<chrono::Utc> {
    match v {
        Value::Time(t) => *t,
        v => panic!("expected time value, got {v:?}"),
    }
}
