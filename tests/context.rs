//! Context cancellation and deadlines: at begin, mid-scan, and for the open
//! lock-acquisition timeout.

mod common;

use std::time::Duration;

use common::{as_int, ctx, TestDb};
use structdb::{Context, Error, FieldType, Kind, Options, Record, Result, TypeDef, Value};

#[derive(Debug, Clone, Default, PartialEq)]
struct Row {
    id: i64,
}

impl Record for Row {
    fn type_def() -> TypeDef {
        TypeDef::new("Row").field("ID", FieldType::plain(Kind::Int64), "")
    }
    fn to_values(&self) -> Result<Vec<Value>> {
        Ok(vec![Value::Int(self.id)])
    }
    fn from_values(values: Vec<Value>) -> Result<Row> {
        Ok(Row {
            id: as_int(&values[0]),
        })
    }
}

#[test]
fn canceled_context_refuses_to_begin() {
    let t = TestDb::new();
    let db = t.open();
    db.register(&ctx(), vec![Row::registration()]).unwrap();

    let (c, handle) = Context::with_cancel();
    handle.cancel();
    assert!(matches!(
        db.read(&c, |_| Ok(())),
        Err(Error::Canceled)
    ));
    assert!(matches!(
        db.write(&c, |_| Ok(())),
        Err(Error::Canceled)
    ));
}

#[test]
fn expired_deadline_is_timeout() {
    let t = TestDb::new();
    let db = t.open();
    db.register(&ctx(), vec![Row::registration()]).unwrap();

    let c = Context::background().with_timeout(Duration::ZERO);
    assert!(matches!(db.read(&c, |_| Ok(())), Err(Error::Timeout)));
}

#[test]
fn cancellation_is_observed_at_cursor_steps() {
    let t = TestDb::new();
    let db = t.open();
    db.register(&ctx(), vec![Row::registration()]).unwrap();
    for _ in 0..100 {
        let mut r = Row { id: 0 };
        db.insert(&ctx(), &mut r).unwrap();
    }

    let (c, handle) = Context::with_cancel();
    let mut seen = 0;
    let r = db.read(&c, |tx| {
        tx.query::<Row>()?.for_each(|_| {
            seen += 1;
            if seen == 3 {
                handle.cancel();
            }
            Ok(())
        })
    });
    assert!(matches!(r, Err(Error::Canceled)));
    assert!(seen >= 3);
    assert!(seen < 100, "cancellation did not stop the scan");
}

#[test]
fn canceled_write_rolls_back() {
    let t = TestDb::new();
    let db = t.open();
    db.register(&ctx(), vec![Row::registration()]).unwrap();

    let (c, handle) = Context::with_cancel();
    let r = db.write(&c, |tx| {
        let mut row = Row { id: 0 };
        tx.insert(&mut row)?;
        handle.cancel();
        let mut other = Row { id: 0 };
        tx.insert(&mut other)
    });
    assert!(matches!(r, Err(Error::Canceled)));
    assert_eq!(db.query::<Row>(&ctx()).unwrap().count().unwrap(), 0);
}

#[test]
fn open_times_out_when_file_is_held() {
    let t = TestDb::new();
    let first = t.open();

    let second = t.open_with(Options {
        timeout: Some(Duration::from_millis(50)),
        ..Options::default()
    });
    assert!(matches!(second, Err(Error::Timeout)));

    drop(first);
    let third = t.open_with(Options::default());
    assert!(third.is_ok());
}

#[test]
fn streaming_reports_cancellation() {
    let t = TestDb::new();
    let db = t.open();
    db.register(&ctx(), vec![Row::registration()]).unwrap();
    for _ in 0..10 {
        let mut r = Row { id: 0 };
        db.insert(&ctx(), &mut r).unwrap();
    }

    let (c, handle) = Context::with_cancel();
    let mut q = db.query::<Row>(&c).unwrap();
    q.next().unwrap();
    handle.cancel();
    assert!(matches!(q.next(), Err(Error::Canceled)));
    q.close();
}
