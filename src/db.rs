use std::path::Path;

use rusqlite::types::ValueRef;
use rusqlite::{params_from_iter, Connection};

use crate::error::Result;
use crate::record::{CleanRecord, Endpoint, FieldValue, ITEM_SEQ};

pub fn connect(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let conn = Connection::open(path)?;
    conn.execute_batch("PRAGMA journal_mode=WAL;")?;
    Ok(conn)
}

/// One table per endpoint, one column per kept field, keyed by `ITEM_SEQ`.
pub fn init_schema(conn: &Connection) -> Result<()> {
    for endpoint in Endpoint::ALL {
        let columns: Vec<String> = endpoint
            .fields()
            .iter()
            .map(|&f| {
                if f == ITEM_SEQ {
                    format!("{} TEXT PRIMARY KEY", f)
                } else if endpoint.numeric_fields().contains(&f) {
                    format!("{} REAL", f)
                } else {
                    format!("{} TEXT", f)
                }
            })
            .collect();
        let table = endpoint.table_name();
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                {columns},
                fetched_at TEXT NOT NULL DEFAULT (datetime('now'))
            );
            CREATE INDEX IF NOT EXISTS idx_{table}_name ON {table}(ITEM_NAME);",
            table = table,
            columns = columns.join(",\n                "),
        ))?;
    }

    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS collection_runs (
            id                INTEGER PRIMARY KEY,
            endpoint          TEXT NOT NULL,
            pages             INTEGER NOT NULL,
            fetched           INTEGER NOT NULL,
            written           INTEGER NOT NULL,
            skipped           INTEGER NOT NULL,
            finished_at       TEXT NOT NULL
        );
        ",
    )?;
    Ok(())
}

// ── Records ──

/// Insert or replace every record in one transaction. Re-running a
/// collection overwrites rows with the same `ITEM_SEQ`.
pub fn upsert_records(
    conn: &Connection,
    endpoint: Endpoint,
    records: &[CleanRecord],
    fetched_at: &str,
) -> Result<usize> {
    let fields = endpoint.fields();
    let placeholders: Vec<String> = (1..=fields.len() + 1).map(|i| format!("?{}", i)).collect();
    let sql = format!(
        "INSERT OR REPLACE INTO {} ({}, fetched_at) VALUES ({})",
        endpoint.table_name(),
        fields.join(", "),
        placeholders.join(", "),
    );

    let empty = FieldValue::Text(String::new());
    let fetched = FieldValue::Text(fetched_at.to_string());
    let tx = conn.unchecked_transaction()?;
    let mut count = 0;
    {
        let mut stmt = tx.prepare(&sql)?;
        for r in records {
            let values = fields
                .iter()
                .map(|f| r.get(f).unwrap_or(&empty))
                .chain(std::iter::once(&fetched));
            count += stmt.execute(params_from_iter(values))?;
        }
    }
    tx.commit()?;
    Ok(count)
}

pub fn load_records(conn: &Connection, endpoint: Endpoint) -> Result<Vec<CleanRecord>> {
    let fields = endpoint.fields();
    let sql = format!(
        "SELECT {} FROM {} ORDER BY ITEM_SEQ",
        fields.join(", "),
        endpoint.table_name()
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([], |row| {
            let mut rec = CleanRecord::new();
            for (i, f) in fields.iter().enumerate() {
                let value = match row.get_ref(i)? {
                    ValueRef::Integer(n) => FieldValue::Integer(n),
                    ValueRef::Real(n) => FieldValue::Decimal(n),
                    ValueRef::Text(t) => FieldValue::Text(String::from_utf8_lossy(t).into_owned()),
                    ValueRef::Null | ValueRef::Blob(_) => FieldValue::Text(String::new()),
                };
                rec.insert(*f, value);
            }
            Ok(rec)
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

// ── Runs ──

pub struct RunRow<'a> {
    pub endpoint: Endpoint,
    pub pages: usize,
    pub fetched: usize,
    pub written: usize,
    pub skipped: usize,
    pub finished_at: &'a str,
}

pub fn record_run(conn: &Connection, run: &RunRow) -> Result<()> {
    conn.execute(
        "INSERT INTO collection_runs (endpoint, pages, fetched, written, skipped, finished_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        rusqlite::params![
            run.endpoint.to_string(),
            run.pages as i64,
            run.fetched as i64,
            run.written as i64,
            run.skipped as i64,
            run.finished_at,
        ],
    )?;
    Ok(())
}

// ── Stats ──

pub struct Stats {
    pub approvals: usize,
    pub pills: usize,
    pub runs: usize,
    pub last_run: Option<String>,
}

pub fn get_stats(conn: &Connection) -> Result<Stats> {
    let count = |table: &str| -> Result<usize> {
        let n: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |r| r.get(0))?;
        Ok(n as usize)
    };
    let approvals = count(Endpoint::Approval.table_name())?;
    let pills = count(Endpoint::Pill.table_name())?;
    let runs = count("collection_runs")?;
    let last_run: Option<String> =
        conn.query_row("SELECT MAX(finished_at) FROM collection_runs", [], |r| r.get(0))?;
    Ok(Stats {
        approvals,
        pills,
        runs,
        last_run,
    })
}
