//! Inspection CLI for structdb database files.
//!
//! Works on any structdb file without the application's type definitions:
//! stored schemas are self-describing. `dumptype` and `dumpall` read the
//! underlying redb tables directly; everything else goes through the
//! library's introspection surface.
//!
//! Exit status: 0 on success, 2 on usage errors, 1 on runtime failure.

use std::io::Write;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use eyre::{Context as _, Result};
use redb::ReadableTable;

use structdb::{Context, Database, Options, Value};

#[derive(Parser)]
#[command(name = "structdb", version, about = "Inspect and export structdb database files")]
struct Cli {
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// List the types stored in the file.
    Types { file: PathBuf },
    /// Remove a type and all its records and indices.
    Drop { file: PathBuf, type_name: String },
    /// Print the latest schema version of a type as JSON.
    Dumptype { file: PathBuf, type_name: String },
    /// Print the primary key of every record of a type.
    Keys { file: PathBuf, type_name: String },
    /// Print every record of a type as one JSON object per line.
    Records { file: PathBuf, type_name: String },
    /// Print one record, looked up by its primary key.
    Record {
        file: PathBuf,
        type_name: String,
        key: String,
    },
    /// Export all records of a type as CSV.
    Exportcsv { file: PathBuf, type_name: String },
    /// Export one type (or all types) as JSON.
    Exportjson {
        file: PathBuf,
        type_name: Option<String>,
    },
    /// Dump schemas, index keys and raw records of every type.
    Dumpall { file: PathBuf },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.cmd {
        Cmd::Types { file } => {
            let db = open(&file)?;
            for name in db.types(&Context::background())? {
                println!("{name}");
            }
        }
        Cmd::Drop { file, type_name } => {
            let db = open(&file)?;
            db.drop_type(&Context::background(), &type_name)
                .wrap_err("drop type")?;
        }
        Cmd::Dumptype { file, type_name } => dumptype(&file, &type_name)?,
        Cmd::Keys { file, type_name } => {
            let db = open(&file)?;
            db.keys(&Context::background(), &type_name, |key| {
                println!("{}", key_repr(&key));
                Ok(())
            })
            .wrap_err("list keys")?;
        }
        Cmd::Records { file, type_name } => {
            let db = open(&file)?;
            let mut fields = Vec::new();
            let stdout = std::io::stdout();
            let mut out = stdout.lock();
            db.records(&Context::background(), &type_name, &mut fields, |rec| {
                writeln!(out, "{rec}").map_err(|e| structdb::Error::Store(e.to_string()))
            })
            .wrap_err("list records")?;
        }
        Cmd::Record {
            file,
            type_name,
            key,
        } => {
            let db = open(&file)?;
            let mut fields = Vec::new();
            let rec = db
                .record(&Context::background(), &type_name, &key, &mut fields)
                .wrap_err("fetch record")?;
            println!("{}", serde_json::to_string_pretty(&rec)?);
        }
        Cmd::Exportcsv { file, type_name } => exportcsv(&file, &type_name)?,
        Cmd::Exportjson { file, type_name } => exportjson(&file, type_name.as_deref())?,
        Cmd::Dumpall { file } => dumpall(&file)?,
    }
    Ok(())
}

fn open(file: &PathBuf) -> Result<Database> {
    Database::open(
        file,
        Options {
            must_exist: true,
            ..Options::default()
        },
    )
    .wrap_err_with(|| format!("open database {}", file.display()))
}

fn key_repr(key: &Value) -> String {
    match key {
        Value::Int(v) => v.to_string(),
        Value::Uint(v) => v.to_string(),
        Value::Bool(v) => v.to_string(),
        Value::String(s) => s.clone(),
        Value::Bytes(b) => b.iter().map(|x| format!("{x:02x}")).collect(),
        v => format!("{v:?}"),
    }
}

fn exportcsv(file: &PathBuf, type_name: &str) -> Result<()> {
    let db = open(file)?;
    let mut fields = Vec::new();
    let mut rows: Vec<serde_json::Value> = Vec::new();
    db.records(&Context::background(), type_name, &mut fields, |rec| {
        rows.push(rec);
        Ok(())
    })
    .wrap_err("list records")?;

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    writeln!(out, "{}", fields.iter().map(|f| csv_field(f)).collect::<Vec<_>>().join(","))?;
    for row in rows {
        let cells: Vec<String> = fields
            .iter()
            .map(|f| match row.get(f) {
                None | Some(serde_json::Value::Null) => String::new(),
                Some(serde_json::Value::String(s)) => csv_field(s),
                Some(serde_json::Value::Number(n)) => n.to_string(),
                Some(serde_json::Value::Bool(b)) => b.to_string(),
                Some(v) => csv_field(&v.to_string()),
            })
            .collect();
        writeln!(out, "{}", cells.join(","))?;
    }
    Ok(())
}

fn csv_field(s: &str) -> String {
    if s.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}

fn exportjson(file: &PathBuf, type_name: Option<&str>) -> Result<()> {
    let db = open(file)?;
    let ctx = Context::background();
    let stdout = std::io::stdout();
    let mut out = stdout.lock();

    let export_one = |db: &Database, out: &mut dyn Write, name: &str, indent: &str| -> Result<()> {
        let mut fields = Vec::new();
        let mut first = true;
        write!(out, "[")?;
        db.records(&ctx, name, &mut fields, |rec| {
            let lead = if first { "" } else { "," };
            first = false;
            write!(out, "{lead}\n{indent}\t{rec}")
                .map_err(|e| structdb::Error::Store(e.to_string()))
        })
        .wrap_err("list records")?;
        write!(out, "\n{indent}]")?;
        Ok(())
    };

    match type_name {
        Some(name) => {
            export_one(&db, &mut out, name, "")?;
            writeln!(out)?;
        }
        None => {
            let types = db.types(&ctx)?;
            write!(out, "{{")?;
            for (i, name) in types.iter().enumerate() {
                if i > 0 {
                    write!(out, ",")?;
                }
                write!(out, "\n\t{}: ", serde_json::Value::String(name.clone()))?;
                export_one(&db, &mut out, name, "\t")?;
            }
            writeln!(out, "\n}}")?;
        }
    }
    Ok(())
}

/// Latest schema version of a type, straight from the `types` table.
fn dumptype(file: &PathBuf, type_name: &str) -> Result<()> {
    let db = redb::Database::open(file).wrap_err("open database file")?;
    let tx = db.begin_read()?;
    let table_name = format!("{type_name}/types");
    let def: redb::TableDefinition<&[u8], &[u8]> = redb::TableDefinition::new(&table_name);
    let table = tx
        .open_table(def)
        .wrap_err_with(|| format!("no stored type {type_name:?}"))?;
    let mut latest: Option<(u32, serde_json::Value)> = None;
    for entry in table.range::<&[u8]>(..)? {
        let (k, v) = entry?;
        let version = u32::from_be_bytes(
            k.value()
                .try_into()
                .map_err(|_| eyre::eyre!("schema key is not 4 bytes"))?,
        );
        if latest.as_ref().is_none_or(|(lv, _)| version > *lv) {
            latest = Some((version, serde_json::from_slice(v.value())?));
        }
    }
    let (_, schema) = latest.ok_or_else(|| eyre::eyre!("no schema versions for {type_name:?}"))?;
    println!("{}", serde_json::to_string_pretty(&schema)?);
    Ok(())
}

/// Raw dump of every type: schema JSON, index keys in hex, records in hex.
fn dumpall(file: &PathBuf) -> Result<()> {
    use redb::TableHandle;

    let db = redb::Database::open(file).wrap_err("open database file")?;
    let tx = db.begin_read()?;
    let mut names: Vec<String> = tx.list_tables()?.map(|h| h.name().to_string()).collect();
    names.sort();

    let mut types: Vec<String> = names
        .iter()
        .filter_map(|n| n.strip_suffix("/types").map(|t| t.to_string()))
        .collect();
    types.sort();

    let hex = |b: &[u8]| b.iter().map(|x| format!("{x:02x}")).collect::<String>();
    for t in &types {
        println!("# {t}");
        println!("## types");
        let types_table_name = format!("{t}/types");
        let def: redb::TableDefinition<&[u8], &[u8]> =
            redb::TableDefinition::new(&types_table_name);
        for entry in tx.open_table(def)?.range::<&[u8]>(..)? {
            let (_, v) = entry?;
            println!("\t{}", String::from_utf8_lossy(v.value()));
        }
        println!();

        for name in names.iter().filter(|n| {
            n.strip_prefix(&format!("{t}/"))
                .is_some_and(|m| m.starts_with("index."))
        }) {
            let member = name.split_once('/').map(|(_, m)| m).unwrap_or(name);
            println!("## {member}");
            let def: redb::TableDefinition<&[u8], &[u8]> = redb::TableDefinition::new(name);
            for entry in tx.open_table(def)?.range::<&[u8]>(..)? {
                let (k, _) = entry?;
                println!("\t{}", hex(k.value()));
            }
            println!();
        }

        println!("## records");
        let records_table_name = format!("{t}/records");
        let def: redb::TableDefinition<&[u8], &[u8]> =
            redb::TableDefinition::new(&records_table_name);
        for entry in tx.open_table(def)?.range::<&[u8]>(..)? {
            let (k, v) = entry?;
            println!("\t{} {}", hex(k.value()), hex(v.value()));
        }
        println!();
    }
    Ok(())
}
