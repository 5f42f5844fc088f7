//! Default values: literal defaults, the `now` sentinel with an injected
//! clock, recursion into nested structs, and map exclusion.

mod common;

use std::sync::Arc;

use chrono::{TimeZone, Utc};
use common::{as_int, as_string, as_time, ctx, TestDb};
use structdb::{
    Database, Error, Field, FieldType, Kind, Options, Record, Result, StructShape, TypeDef, Value,
};

#[derive(Debug, Clone, PartialEq)]
struct Task {
    id: i64,
    state: String,
    priority: i64,
    created: chrono::DateTime<Utc>,
}

impl Default for Task {
    fn default() -> Task {
        Task {
            id: 0,
            state: String::new(),
            priority: 0,
            created: Utc.timestamp_opt(0, 0).unwrap(),
        }
    }
}

impl Record for Task {
    fn type_def() -> TypeDef {
        TypeDef::new("Task")
            .field("ID", FieldType::plain(Kind::Int64), "")
            .field("State", FieldType::plain(Kind::String), "default new")
            .field("Priority", FieldType::plain(Kind::Int32), "default 10")
            .field("Created", FieldType::plain(Kind::Time), "default now")
    }
    fn to_values(&self) -> Result<Vec<Value>> {
        Ok(vec![
            Value::Int(self.id),
            Value::String(self.state.clone()),
            Value::Int(self.priority),
            Value::Time(self.created),
        ])
    }
    fn from_values(values: Vec<Value>) -> Result<Task> {
        let mut it = values.into_iter();
        Ok(Task {
            id: as_int(&it.next().unwrap()),
            state: as_string(&it.next().unwrap()),
            priority: as_int(&it.next().unwrap()),
            created: as_time(&it.next().unwrap()),
        })
    }
}

fn fixed_clock_db(t: &TestDb, at: chrono::DateTime<Utc>) -> Database {
    let db = t
        .open_with(Options {
            clock: Some(Arc::new(move || at)),
            ..Options::default()
        })
        .unwrap();
    db.register(&ctx(), vec![Task::registration()]).unwrap();
    db
}

#[test]
fn zero_fields_get_defaults_on_insert() {
    let t = TestDb::new();
    let at = Utc.timestamp_opt(1_600_000_000, 123).unwrap();
    let db = fixed_clock_db(&t, at);

    let mut task = Task::default();
    db.insert(&ctx(), &mut task).unwrap();

    // The caller's record is updated in place.
    assert_eq!(task.state, "new");
    assert_eq!(task.priority, 10);
    assert_eq!(task.created, at);

    let mut got = Task {
        id: task.id,
        ..Task::default()
    };
    db.get(&ctx(), &mut got).unwrap();
    assert_eq!(got, task);
}

#[test]
fn nonzero_fields_keep_their_values() {
    let t = TestDb::new();
    let at = Utc.timestamp_opt(1_600_000_000, 0).unwrap();
    let db = fixed_clock_db(&t, at);

    let explicit = Utc.timestamp_opt(1_000_000_000, 0).unwrap();
    let mut task = Task {
        id: 0,
        state: "done".into(),
        priority: -1,
        created: explicit,
    };
    db.insert(&ctx(), &mut task).unwrap();
    assert_eq!(task.state, "done");
    assert_eq!(task.priority, -1);
    assert_eq!(task.created, explicit);
}

#[test]
fn defaults_are_not_applied_on_update() {
    let t = TestDb::new();
    let at = Utc.timestamp_opt(1_600_000_000, 0).unwrap();
    let db = fixed_clock_db(&t, at);

    let mut task = Task::default();
    db.insert(&ctx(), &mut task).unwrap();
    task.state = String::new();
    db.update(&ctx(), &task).unwrap();

    let mut got = Task {
        id: task.id,
        ..Task::default()
    };
    db.get(&ctx(), &mut got).unwrap();
    assert_eq!(got.state, "");
}

#[test]
fn nested_struct_defaults_apply() {
    #[derive(Debug, Clone, Default, PartialEq)]
    struct Doc {
        id: i64,
        meta_author: String,
    }
    impl Record for Doc {
        fn type_def() -> TypeDef {
            TypeDef::new("Doc")
                .field("ID", FieldType::plain(Kind::Int64), "")
                .field(
                    "Meta",
                    FieldType::plain(Kind::Struct(StructShape::new(vec![Field::new(
                        "Author",
                        FieldType::plain(Kind::String),
                        "default anonymous",
                    )]))),
                    "",
                )
        }
        fn to_values(&self) -> Result<Vec<Value>> {
            Ok(vec![
                Value::Int(self.id),
                Value::Struct(vec![Value::String(self.meta_author.clone())]),
            ])
        }
        fn from_values(values: Vec<Value>) -> Result<Doc> {
            let mut it = values.into_iter();
            let id = as_int(&it.next().unwrap());
            let author = match it.next() {
                Some(Value::Struct(fields)) => as_string(&fields[0]),
                v => return Err(Error::Param(format!("bad meta: {v:?}"))),
            };
            Ok(Doc {
                id,
                meta_author: author,
            })
        }
    }

    let t = TestDb::new();
    let db = t.open();
    db.register(&ctx(), vec![Doc::registration()]).unwrap();

    let mut doc = Doc::default();
    db.insert(&ctx(), &mut doc).unwrap();
    assert_eq!(doc.meta_author, "anonymous");
}

#[test]
fn bad_default_literals_are_type_errors() {
    struct BadInt;
    impl Record for BadInt {
        fn type_def() -> TypeDef {
            TypeDef::new("Bad")
                .field("ID", FieldType::plain(Kind::Int64), "")
                .field("N", FieldType::plain(Kind::Int32), "default abc")
        }
        fn to_values(&self) -> Result<Vec<Value>> {
            Ok(vec![])
        }
        fn from_values(_: Vec<Value>) -> Result<BadInt> {
            Ok(BadInt)
        }
    }
    struct BadKind;
    impl Record for BadKind {
        fn type_def() -> TypeDef {
            TypeDef::new("Bad")
                .field("ID", FieldType::plain(Kind::Int64), "")
                .field(
                    "L",
                    FieldType::plain(Kind::List(Box::new(FieldType::plain(Kind::Int32)))),
                    "default 5",
                )
        }
        fn to_values(&self) -> Result<Vec<Value>> {
            Ok(vec![])
        }
        fn from_values(_: Vec<Value>) -> Result<BadKind> {
            Ok(BadKind)
        }
    }

    let t = TestDb::new();
    let db = t.open();
    assert!(matches!(
        db.register(&ctx(), vec![BadInt::registration()]),
        Err(Error::Type(_))
    ));
    assert!(matches!(
        db.register(&ctx(), vec![BadKind::registration()]),
        Err(Error::Type(_))
    ));
}
