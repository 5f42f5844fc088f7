//! Basic record operations: open, register, insert/get/update/delete,
//! primary key assignment, unique constraints, references, drop.

mod common;

use common::{as_int, as_string, ctx, TestDb};
use structdb::{Error, FieldType, Kind, Record, Result, TypeDef, Value};

#[derive(Debug, Clone, Default, PartialEq)]
struct User {
    id: i64,
    name: String,
}

impl Record for User {
    fn type_def() -> TypeDef {
        TypeDef::new("User")
            .field("ID", FieldType::plain(Kind::Int), "")
            .field("Name", FieldType::plain(Kind::String), "unique")
    }

    fn to_values(&self) -> Result<Vec<Value>> {
        Ok(vec![Value::Int(self.id), Value::String(self.name.clone())])
    }

    fn from_values(values: Vec<Value>) -> Result<User> {
        let mut it = values.into_iter();
        Ok(User {
            id: as_int(&it.next().unwrap()),
            name: as_string(&it.next().unwrap()),
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
struct Group {
    id: u32,
    name: String,
}

impl Record for Group {
    fn type_def() -> TypeDef {
        TypeDef::new("Group")
            .field("ID", FieldType::plain(Kind::Uint32), "")
            .field("Name", FieldType::plain(Kind::String), "unique")
    }

    fn to_values(&self) -> Result<Vec<Value>> {
        Ok(vec![
            Value::Uint(self.id as u64),
            Value::String(self.name.clone()),
        ])
    }

    fn from_values(values: Vec<Value>) -> Result<Group> {
        let mut it = values.into_iter();
        Ok(Group {
            id: common::as_uint(&it.next().unwrap()) as u32,
            name: as_string(&it.next().unwrap()),
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
struct Member {
    id: i64,
    group_id: u32,
}

impl Record for Member {
    fn type_def() -> TypeDef {
        TypeDef::new("Member")
            .field("ID", FieldType::plain(Kind::Int64), "")
            .field("GroupID", FieldType::plain(Kind::Uint32), "ref Group")
    }

    fn to_values(&self) -> Result<Vec<Value>> {
        Ok(vec![
            Value::Int(self.id),
            Value::Uint(self.group_id as u64),
        ])
    }

    fn from_values(values: Vec<Value>) -> Result<Member> {
        let mut it = values.into_iter();
        Ok(Member {
            id: as_int(&it.next().unwrap()),
            group_id: common::as_uint(&it.next().unwrap()) as u32,
        })
    }
}

#[test]
fn insert_assigns_sequence_and_get_round_trips() {
    let t = TestDb::new();
    let db = t.open();
    db.register(&ctx(), vec![User::registration()]).unwrap();

    let mut a = User { id: 0, name: "a".into() };
    let mut b = User { id: 0, name: "b".into() };
    db.insert(&ctx(), &mut a).unwrap();
    db.insert(&ctx(), &mut b).unwrap();
    assert_eq!(a.id, 1);
    assert_eq!(b.id, 2);

    let mut got = User { id: 1, ..User::default() };
    db.get(&ctx(), &mut got).unwrap();
    assert_eq!(got, User { id: 1, name: "a".into() });

    // Same unique name again: rejected.
    let mut dup = User { id: 0, name: "a".into() };
    assert!(matches!(db.insert(&ctx(), &mut dup), Err(Error::Unique(_))));
}

#[test]
fn duplicate_primary_key_is_unique_error() {
    let t = TestDb::new();
    let db = t.open();
    db.register(&ctx(), vec![User::registration()]).unwrap();

    let mut a = User { id: 7, name: "a".into() };
    db.insert(&ctx(), &mut a).unwrap();
    let mut b = User { id: 7, name: "b".into() };
    assert!(matches!(db.insert(&ctx(), &mut b), Err(Error::Unique(_))));
}

#[test]
fn explicit_key_advances_sequence() {
    let t = TestDb::new();
    let db = t.open();
    db.register(&ctx(), vec![User::registration()]).unwrap();

    let mut a = User { id: 10, name: "a".into() };
    db.insert(&ctx(), &mut a).unwrap();
    let mut b = User { id: 0, name: "b".into() };
    db.insert(&ctx(), &mut b).unwrap();
    assert_eq!(b.id, 11);
}

#[test]
fn get_absent_and_zero_key() {
    let t = TestDb::new();
    let db = t.open();
    db.register(&ctx(), vec![User::registration()]).unwrap();

    let mut missing = User { id: 99, ..User::default() };
    assert!(matches!(db.get(&ctx(), &mut missing), Err(Error::Absent(_))));

    let mut zero = User::default();
    assert!(matches!(db.get(&ctx(), &mut zero), Err(Error::Param(_))));
}

#[test]
fn update_replaces_and_maintains_indices() {
    let t = TestDb::new();
    let db = t.open();
    db.register(&ctx(), vec![User::registration()]).unwrap();

    let mut a = User { id: 0, name: "old".into() };
    db.insert(&ctx(), &mut a).unwrap();
    a.name = "new".into();
    db.update(&ctx(), &a).unwrap();

    let found: Vec<User> = db
        .query::<User>(&ctx())
        .unwrap()
        .filter_equal("Name", "new")
        .list()
        .unwrap();
    assert_eq!(found.len(), 1);
    let gone: Vec<User> = db
        .query::<User>(&ctx())
        .unwrap()
        .filter_equal("Name", "old")
        .list()
        .unwrap();
    assert!(gone.is_empty());

    // The freed unique value is usable again.
    let mut b = User { id: 0, name: "old".into() };
    db.insert(&ctx(), &mut b).unwrap();
}

#[test]
fn delete_then_get_is_absent() {
    let t = TestDb::new();
    let db = t.open();
    db.register(&ctx(), vec![User::registration()]).unwrap();

    let mut a = User { id: 0, name: "a".into() };
    db.insert(&ctx(), &mut a).unwrap();
    db.delete(&ctx(), &a).unwrap();
    let mut got = User { id: a.id, ..User::default() };
    assert!(matches!(db.get(&ctx(), &mut got), Err(Error::Absent(_))));
}

#[test]
fn references_are_enforced() {
    let t = TestDb::new();
    let db = t.open();
    db.register(&ctx(), vec![Group::registration(), Member::registration()])
        .unwrap();

    // Insert with a dangling reference: rejected.
    let mut m = Member { id: 0, group_id: 5 };
    assert!(matches!(
        db.insert(&ctx(), &mut m),
        Err(Error::Reference(_))
    ));

    let mut g = Group { id: 0, name: "staff".into() };
    db.insert(&ctx(), &mut g).unwrap();
    let mut m = Member { id: 0, group_id: g.id };
    db.insert(&ctx(), &mut m).unwrap();

    // The group is now pinned by the member.
    assert!(matches!(db.delete(&ctx(), &g), Err(Error::Reference(_))));
    db.delete(&ctx(), &m).unwrap();
    db.delete(&ctx(), &g).unwrap();

    // Zero reference values skip the check.
    let mut loose = Member { id: 0, group_id: 0 };
    db.insert(&ctx(), &mut loose).unwrap();
}

#[test]
fn drop_type_refuses_referenced_types() {
    let t = TestDb::new();
    let db = t.open();
    db.register(&ctx(), vec![Group::registration(), Member::registration()])
        .unwrap();

    assert!(matches!(
        db.drop_type(&ctx(), "Group"),
        Err(Error::Reference(_))
    ));
    db.drop_type(&ctx(), "Member").unwrap();
    assert!(matches!(
        db.drop_type(&ctx(), "Member"),
        Err(Error::Absent(_))
    ));
}

#[test]
fn registering_types_that_reference_each_other_requires_one_call() {
    let t = TestDb::new();
    let db = t.open();
    assert!(matches!(
        db.register(&ctx(), vec![Member::registration()]),
        Err(Error::Type(_))
    ));
}

#[test]
fn read_transaction_rejects_writes() {
    let t = TestDb::new();
    let db = t.open();
    db.register(&ctx(), vec![User::registration()]).unwrap();

    let err = db.read(&ctx(), |tx| {
        let mut u = User { id: 0, name: "x".into() };
        tx.insert(&mut u)
    });
    assert!(matches!(err, Err(Error::NotWritable)));
}

#[test]
fn rolled_back_transaction_leaves_no_trace() {
    let t = TestDb::new();
    let db = t.open();
    db.register(&ctx(), vec![User::registration()]).unwrap();

    let r: structdb::Result<()> = db.write(&ctx(), |tx| {
        let mut u = User { id: 0, name: "temp".into() };
        tx.insert(&mut u)?;
        Err(Error::Param("abort on purpose".into()))
    });
    assert!(r.is_err());

    let n = db.query::<User>(&ctx()).unwrap().count().unwrap();
    assert_eq!(n, 0);
}

#[test]
fn botched_transaction_refuses_commit() {
    #[derive(Debug, Clone, Default)]
    struct Pair {
        id: i64,
        x: u32,
        y: u32,
    }
    impl Record for Pair {
        fn type_def() -> TypeDef {
            TypeDef::new("Pair")
                .field("ID", FieldType::plain(Kind::Int64), "")
                .field("X", FieldType::plain(Kind::Uint32), "unique")
                .field("Y", FieldType::plain(Kind::Uint32), "unique")
        }
        fn to_values(&self) -> Result<Vec<Value>> {
            Ok(vec![
                Value::Int(self.id),
                Value::Uint(self.x as u64),
                Value::Uint(self.y as u64),
            ])
        }
        fn from_values(values: Vec<Value>) -> Result<Pair> {
            let mut it = values.into_iter();
            Ok(Pair {
                id: as_int(&it.next().unwrap()),
                x: common::as_uint(&it.next().unwrap()) as u32,
                y: common::as_uint(&it.next().unwrap()) as u32,
            })
        }
    }

    let t = TestDb::new();
    let db = t.open();
    db.register(&ctx(), vec![Pair::registration()]).unwrap();

    let mut a = Pair { id: 0, x: 1, y: 1 };
    db.insert(&ctx(), &mut a).unwrap();

    let mut tx = db.begin(&ctx(), true).unwrap();
    // X=2 passes and writes its index entry, then Y=1 collides: the
    // transaction is now in a known-inconsistent intermediate state.
    let mut b = Pair { id: 0, x: 2, y: 1 };
    assert!(matches!(tx.insert(&mut b), Err(Error::Unique(_))));

    let mut c = Pair { id: 0, x: 3, y: 3 };
    assert!(matches!(tx.insert(&mut c), Err(Error::TxBotched)));
    assert!(matches!(tx.commit(), Err(Error::TxBotched)));

    // Nothing of the botched transaction is visible.
    let n = db.query::<Pair>(&ctx()).unwrap().count().unwrap();
    assert_eq!(n, 1);
}

#[test]
fn hint_append_keeps_scans_working() {
    let t = TestDb::new();
    let db = t.open();
    db.register(&ctx(), vec![User::registration()]).unwrap();
    db.hint_append("User", true);

    for i in 0..50 {
        let mut u = User {
            id: 0,
            name: format!("user-{i:03}"),
        };
        db.insert(&ctx(), &mut u).unwrap();
    }
    let all: Vec<User> = db.query::<User>(&ctx()).unwrap().list().unwrap();
    assert_eq!(all.len(), 50);
    assert_eq!(all[0].id, 1);

    db.hint_append("User", false);
    assert_eq!(db.query::<User>(&ctx()).unwrap().count().unwrap(), 50);
}

#[test]
fn stats_accumulate_and_sub() {
    let t = TestDb::new();
    let db = t.open();
    db.register(&ctx(), vec![User::registration()]).unwrap();

    let before = db.stats();
    let mut u = User { id: 0, name: "a".into() };
    db.insert(&ctx(), &mut u).unwrap();
    db.query::<User>(&ctx()).unwrap().count().unwrap();

    let delta = db.stats().sub(&before);
    assert_eq!(delta.insert, 1);
    assert_eq!(delta.queries, 1);
    assert!(delta.writes >= 1);
    assert!(delta.reads >= 1);
}

#[test]
fn introspection_without_record_impls() {
    let t = TestDb::new();
    let db = t.open();
    db.register(&ctx(), vec![User::registration()]).unwrap();
    let mut u = User { id: 0, name: "alice".into() };
    db.insert(&ctx(), &mut u).unwrap();

    assert_eq!(db.types(&ctx()).unwrap(), vec!["User".to_string()]);

    let mut keys = Vec::new();
    db.keys(&ctx(), "User", |k| {
        keys.push(k);
        Ok(())
    })
    .unwrap();
    assert_eq!(keys, vec![Value::Int(1)]);

    let mut fields = Vec::new();
    let mut rows = Vec::new();
    db.records(&ctx(), "User", &mut fields, |rec| {
        rows.push(rec);
        Ok(())
    })
    .unwrap();
    assert_eq!(fields, vec!["ID".to_string(), "Name".to_string()]);
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["Name"], serde_json::json!("alice"));

    let mut fields = Vec::new();
    let rec = db.record(&ctx(), "User", "1", &mut fields).unwrap();
    assert_eq!(rec["ID"], serde_json::json!(1));
}
