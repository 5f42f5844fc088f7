//! Reading records written by older schema versions: added fields decode as
//! zero values, integers widen, pointer flips map zero/nil, and a field
//! dropped and re-added does not resurrect old data.

mod common;

use common::{as_int, as_string, ctx, TestDb};
use structdb::{Error, FieldType, Kind, Record, Result, TypeDef, Value};

fn item_def(fields: &[(&str, Kind, &str)]) -> TypeDef {
    let mut def = TypeDef::new("Item");
    for (name, kind, tags) in fields {
        def = def.field(name, FieldType::plain(kind.clone()), tags);
    }
    def
}

#[derive(Debug, Clone, Default, PartialEq)]
struct V1 {
    id: i64,
    name: String,
}

impl Record for V1 {
    fn type_def() -> TypeDef {
        item_def(&[("ID", Kind::Int64, ""), ("Name", Kind::String, "")])
    }
    fn to_values(&self) -> Result<Vec<Value>> {
        Ok(vec![Value::Int(self.id), Value::String(self.name.clone())])
    }
    fn from_values(values: Vec<Value>) -> Result<V1> {
        let mut it = values.into_iter();
        Ok(V1 {
            id: as_int(&it.next().unwrap()),
            name: as_string(&it.next().unwrap()),
        })
    }
}

#[test]
fn added_field_decodes_as_zero_for_old_records() {
    #[derive(Debug, Clone, Default, PartialEq)]
    struct V2 {
        id: i64,
        name: String,
        age: u64,
    }
    impl Record for V2 {
        fn type_def() -> TypeDef {
            item_def(&[
                ("ID", Kind::Int64, ""),
                ("Name", Kind::String, ""),
                ("Age", Kind::Uint32, ""),
            ])
        }
        fn to_values(&self) -> Result<Vec<Value>> {
            Ok(vec![
                Value::Int(self.id),
                Value::String(self.name.clone()),
                Value::Uint(self.age),
            ])
        }
        fn from_values(values: Vec<Value>) -> Result<V2> {
            let mut it = values.into_iter();
            Ok(V2 {
                id: as_int(&it.next().unwrap()),
                name: as_string(&it.next().unwrap()),
                age: common::as_uint(&it.next().unwrap()),
            })
        }
    }

    let t = TestDb::new();
    {
        let db = t.open();
        db.register(&ctx(), vec![V1::registration()]).unwrap();
        let mut v = V1 { id: 0, name: "old".into() };
        db.insert(&ctx(), &mut v).unwrap();
    }
    let db = t.open();
    db.register(&ctx(), vec![V2::registration()]).unwrap();

    let mut got = V2 { id: 1, ..V2::default() };
    db.get(&ctx(), &mut got).unwrap();
    assert_eq!(
        got,
        V2 {
            id: 1,
            name: "old".into(),
            age: 0
        }
    );

    // Updating rewrites at the current version; still readable.
    got.age = 30;
    db.update(&ctx(), &got).unwrap();
    let mut again = V2 { id: 1, ..V2::default() };
    db.get(&ctx(), &mut again).unwrap();
    assert_eq!(again.age, 30);
}

#[test]
fn removed_field_is_skipped_for_old_records() {
    #[derive(Debug, Clone, Default, PartialEq)]
    struct JustId {
        id: i64,
    }
    impl Record for JustId {
        fn type_def() -> TypeDef {
            item_def(&[("ID", Kind::Int64, "")])
        }
        fn to_values(&self) -> Result<Vec<Value>> {
            Ok(vec![Value::Int(self.id)])
        }
        fn from_values(values: Vec<Value>) -> Result<JustId> {
            Ok(JustId {
                id: as_int(&values[0]),
            })
        }
    }

    let t = TestDb::new();
    {
        let db = t.open();
        db.register(&ctx(), vec![V1::registration()]).unwrap();
        let mut v = V1 { id: 0, name: "dropme".into() };
        db.insert(&ctx(), &mut v).unwrap();
    }
    let db = t.open();
    db.register(&ctx(), vec![JustId::registration()]).unwrap();
    let mut got = JustId { id: 1 };
    db.get(&ctx(), &mut got).unwrap();
    assert_eq!(got.id, 1);
}

#[test]
fn readded_field_does_not_resurrect_old_data() {
    #[derive(Debug, Clone, Default, PartialEq)]
    struct JustId {
        id: i64,
    }
    impl Record for JustId {
        fn type_def() -> TypeDef {
            item_def(&[("ID", Kind::Int64, "")])
        }
        fn to_values(&self) -> Result<Vec<Value>> {
            Ok(vec![Value::Int(self.id)])
        }
        fn from_values(values: Vec<Value>) -> Result<JustId> {
            Ok(JustId {
                id: as_int(&values[0]),
            })
        }
    }

    let t = TestDb::new();
    {
        let db = t.open();
        db.register(&ctx(), vec![V1::registration()]).unwrap();
        let mut v = V1 { id: 0, name: "ghost".into() };
        db.insert(&ctx(), &mut v).unwrap();
    }
    {
        // Version 2 drops Name entirely.
        let db = t.open();
        db.register(&ctx(), vec![JustId::registration()]).unwrap();
    }
    // Version 3 re-adds Name: the old value stays gone.
    let db = t.open();
    db.register(&ctx(), vec![V1::registration()]).unwrap();
    let mut got = V1 { id: 1, ..V1::default() };
    db.get(&ctx(), &mut got).unwrap();
    assert_eq!(got.name, "");
}

#[test]
fn widened_integer_fields_read_old_records() {
    #[derive(Debug, Clone, Default)]
    struct Small {
        id: i64,
        n: i64,
    }
    impl Record for Small {
        fn type_def() -> TypeDef {
            item_def(&[("ID", Kind::Int64, ""), ("N", Kind::Int16, "")])
        }
        fn to_values(&self) -> Result<Vec<Value>> {
            Ok(vec![Value::Int(self.id), Value::Int(self.n)])
        }
        fn from_values(values: Vec<Value>) -> Result<Small> {
            let mut it = values.into_iter();
            Ok(Small {
                id: as_int(&it.next().unwrap()),
                n: as_int(&it.next().unwrap()),
            })
        }
    }
    #[derive(Debug, Clone, Default)]
    struct Big {
        id: i64,
        n: i64,
    }
    impl Record for Big {
        fn type_def() -> TypeDef {
            item_def(&[("ID", Kind::Int64, ""), ("N", Kind::Int64, "")])
        }
        fn to_values(&self) -> Result<Vec<Value>> {
            Ok(vec![Value::Int(self.id), Value::Int(self.n)])
        }
        fn from_values(values: Vec<Value>) -> Result<Big> {
            let mut it = values.into_iter();
            Ok(Big {
                id: as_int(&it.next().unwrap()),
                n: as_int(&it.next().unwrap()),
            })
        }
    }

    let t = TestDb::new();
    {
        let db = t.open();
        db.register(&ctx(), vec![Small::registration()]).unwrap();
        let mut s = Small { id: 0, n: -12345 };
        db.insert(&ctx(), &mut s).unwrap();
    }
    let db = t.open();
    db.register(&ctx(), vec![Big::registration()]).unwrap();
    let mut got = Big { id: 1, ..Big::default() };
    db.get(&ctx(), &mut got).unwrap();
    assert_eq!(got.n, -12345);

    let mut huge = Big { id: 0, n: i64::MAX };
    db.insert(&ctx(), &mut huge).unwrap();
}

#[test]
fn pointer_flips_map_zero_and_nil() {
    #[derive(Debug, Clone, Default, PartialEq)]
    struct Opt {
        id: i64,
        name: Option<String>,
    }
    impl Record for Opt {
        fn type_def() -> TypeDef {
            TypeDef::new("Item")
                .field("ID", FieldType::plain(Kind::Int64), "")
                .field("Name", FieldType::ptr(Kind::String), "")
        }
        fn to_values(&self) -> Result<Vec<Value>> {
            Ok(vec![
                Value::Int(self.id),
                match &self.name {
                    Some(s) => Value::String(s.clone()),
                    None => Value::Null,
                },
            ])
        }
        fn from_values(values: Vec<Value>) -> Result<Opt> {
            let mut it = values.into_iter();
            let id = as_int(&it.next().unwrap());
            let name = match it.next() {
                Some(Value::Null) => None,
                Some(Value::String(s)) => Some(s),
                v => return Err(Error::Param(format!("bad name: {v:?}"))),
            };
            Ok(Opt { id, name })
        }
    }

    let t = TestDb::new();
    {
        let db = t.open();
        db.register(&ctx(), vec![V1::registration()]).unwrap();
        let mut a = V1 { id: 0, name: "set".into() };
        let mut b = V1 { id: 0, name: String::new() };
        db.insert(&ctx(), &mut a).unwrap();
        db.insert(&ctx(), &mut b).unwrap();
    }
    let db = t.open();
    db.register(&ctx(), vec![Opt::registration()]).unwrap();

    let mut set = Opt { id: 1, ..Opt::default() };
    db.get(&ctx(), &mut set).unwrap();
    assert_eq!(set.name, Some("set".into()));

    // The old zero value turns into nil through the flip.
    let mut empty = Opt { id: 2, ..Opt::default() };
    db.get(&ctx(), &mut empty).unwrap();
    assert_eq!(empty.name, None);
}

#[test]
fn records_written_at_old_versions_round_trip_through_reencode() {
    let t = TestDb::new();
    {
        let db = t.open();
        db.register(&ctx(), vec![V1::registration()]).unwrap();
        for name in ["a", "b", "c"] {
            let mut v = V1 { id: 0, name: name.into() };
            db.insert(&ctx(), &mut v).unwrap();
        }
    }
    // Evolve, then rewrite every record at the current version.
    #[derive(Debug, Clone, Default, PartialEq)]
    struct V2 {
        id: i64,
        name: String,
        count: i64,
    }
    impl Record for V2 {
        fn type_def() -> TypeDef {
            item_def(&[
                ("ID", Kind::Int64, ""),
                ("Name", Kind::String, ""),
                ("Count", Kind::Int32, ""),
            ])
        }
        fn to_values(&self) -> Result<Vec<Value>> {
            Ok(vec![
                Value::Int(self.id),
                Value::String(self.name.clone()),
                Value::Int(self.count),
            ])
        }
        fn from_values(values: Vec<Value>) -> Result<V2> {
            let mut it = values.into_iter();
            Ok(V2 {
                id: as_int(&it.next().unwrap()),
                name: as_string(&it.next().unwrap()),
                count: as_int(&it.next().unwrap()),
            })
        }
    }

    let db = t.open();
    db.register(&ctx(), vec![V2::registration()]).unwrap();
    let n = db
        .query::<V2>(&ctx())
        .unwrap()
        .update_field("Count", 1i64)
        .unwrap();
    assert_eq!(n, 3);

    let all: Vec<V2> = db.query::<V2>(&ctx()).unwrap().list().unwrap();
    assert_eq!(all.len(), 3);
    assert!(all.iter().all(|v| v.count == 1 && !v.name.is_empty()));
}
