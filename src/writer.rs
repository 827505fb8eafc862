use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use rusqlite::Connection;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::db;
use crate::error::{CollectError, Result};
use crate::pipeline::RunSummary;
use crate::record::{CleanRecord, Endpoint};
use crate::settings::{OutputMode, Settings};

/// Destination for one endpoint's records during one run.
pub enum Writer {
    File(JsonFileWriter),
    Database(DbWriter),
}

impl Writer {
    pub fn open(settings: &Settings, endpoint: Endpoint, mode: OutputMode) -> Result<Self> {
        match mode {
            OutputMode::File => Ok(Writer::File(JsonFileWriter::create(&settings.json_path(endpoint))?)),
            OutputMode::Database => Ok(Writer::Database(DbWriter::open(&settings.db_path, endpoint)?)),
        }
    }

    pub fn write_batch(&mut self, records: &[CleanRecord]) -> Result<usize> {
        match self {
            Writer::File(w) => w.write_batch(records),
            Writer::Database(w) => w.write_batch(records),
        }
    }

    #[cfg(test)]
    pub fn written(&self) -> usize {
        match self {
            Writer::File(w) => w.written,
            Writer::Database(w) => w.written,
        }
    }

    /// Make the run's output durable and say where it went.
    pub fn finish(self, summary: &RunSummary) -> Result<String> {
        match self {
            Writer::File(w) => w.finish().map(|p| p.display().to_string()),
            Writer::Database(w) => w.finish(summary),
        }
    }
}

// ── JSON file ──

/// Streams a JSON array to `<name>.json.tmp` and renames it over the target
/// on `finish`. Until then the previous output stays untouched; an
/// unfinished temp file is removed on drop.
pub struct JsonFileWriter {
    path: PathBuf,
    tmp_path: PathBuf,
    out: Option<BufWriter<File>>,
    written: usize,
}

impl JsonFileWriter {
    pub fn create(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let tmp_path = path.with_extension("json.tmp");
        let mut out = BufWriter::new(File::create(&tmp_path)?);
        out.write_all(b"[")?;
        debug!("Writing records to {}", tmp_path.display());
        Ok(JsonFileWriter {
            path: path.to_path_buf(),
            tmp_path,
            out: Some(out),
            written: 0,
        })
    }

    pub fn write_batch(&mut self, records: &[CleanRecord]) -> Result<usize> {
        let out = self
            .out
            .as_mut()
            .ok_or_else(|| CollectError::Io(std::io::Error::other("writer already finished")))?;
        for r in records {
            let json = serde_json::to_string_pretty(r)?;
            out.write_all(if self.written == 0 { b"\n  " } else { b",\n  " })?;
            out.write_all(json.replace('\n', "\n  ").as_bytes())?;
            self.written += 1;
        }
        Ok(records.len())
    }

    pub fn finish(mut self) -> Result<PathBuf> {
        let mut out = self
            .out
            .take()
            .ok_or_else(|| CollectError::Io(std::io::Error::other("writer already finished")))?;
        out.write_all(if self.written == 0 { b"]\n" } else { b"\n]\n" })?;
        out.flush()?;
        out.get_ref().sync_all()?;
        drop(out);
        fs::rename(&self.tmp_path, &self.path)?;
        info!("Wrote {} records to {}", self.written, self.path.display());
        Ok(self.path.clone())
    }
}

impl Drop for JsonFileWriter {
    fn drop(&mut self) {
        if self.out.take().is_some() {
            if let Err(e) = fs::remove_file(&self.tmp_path) {
                warn!("Could not remove {}: {}", self.tmp_path.display(), e);
            }
        }
    }
}

/// Write `value` as pretty JSON through a temp file and rename.
pub fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let tmp_path = path.with_extension("json.tmp");
    let mut out = BufWriter::new(File::create(&tmp_path)?);
    serde_json::to_writer_pretty(&mut out, value)?;
    out.write_all(b"\n")?;
    out.flush()?;
    drop(out);
    fs::rename(&tmp_path, path)?;
    Ok(())
}

/// Load a JSON output file. A single object is accepted as a one-record file.
pub fn read_json(path: &Path) -> Result<Vec<CleanRecord>> {
    let value: serde_json::Value = serde_json::from_reader(BufReader::new(File::open(path)?))?;
    match value {
        serde_json::Value::Array(_) => Ok(serde_json::from_value(value)?),
        other => Ok(vec![serde_json::from_value(other)?]),
    }
}

/// Records a previous run stored for `endpoint` in the configured mode.
pub fn load_output(settings: &Settings, endpoint: Endpoint) -> Result<Vec<CleanRecord>> {
    match settings.mode {
        OutputMode::File => read_json(&settings.json_path(endpoint)),
        OutputMode::Database => {
            let conn = db::connect(&settings.db_path)?;
            db::init_schema(&conn)?;
            db::load_records(&conn, endpoint)
        }
    }
}

// ── SQLite ──

pub struct DbWriter {
    conn: Connection,
    endpoint: Endpoint,
    fetched_at: String,
    written: usize,
}

impl DbWriter {
    pub fn open(path: &Path, endpoint: Endpoint) -> Result<Self> {
        let conn = db::connect(path)?;
        db::init_schema(&conn)?;
        Ok(DbWriter {
            conn,
            endpoint,
            fetched_at: Utc::now().to_rfc3339(),
            written: 0,
        })
    }

    pub fn write_batch(&mut self, records: &[CleanRecord]) -> Result<usize> {
        let n = db::upsert_records(&self.conn, self.endpoint, records, &self.fetched_at)?;
        self.written += records.len();
        Ok(n)
    }

    pub fn finish(self, summary: &RunSummary) -> Result<String> {
        let finished_at = Utc::now().to_rfc3339();
        db::record_run(
            &self.conn,
            &db::RunRow {
                endpoint: self.endpoint,
                pages: summary.pages,
                fetched: summary.fetched,
                written: summary.written,
                skipped: summary.skipped(),
                finished_at: &finished_at,
            },
        )?;
        info!("Upserted {} records into {}", self.written, self.endpoint.table_name());
        Ok(format!("table {}", self.endpoint.table_name()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::FieldValue;

    fn sample() -> Vec<CleanRecord> {
        let mut a = CleanRecord::new();
        a.insert("ITEM_SEQ", "199303108");
        a.insert("ITEM_NAME", "타이레놀정500밀리그람");
        a.insert("THICK", FieldValue::Decimal(5.6));
        let mut b = CleanRecord::new();
        b.insert("ITEM_SEQ", "200808876");
        b.insert("ITEM_NAME", "가스디알정 \"50\"");
        vec![a, b]
    }

    #[test]
    fn json_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out").join("pill_identifications.json");
        let mut w = JsonFileWriter::create(&path).unwrap();
        w.write_batch(&sample()[..1]).unwrap();
        w.write_batch(&sample()[1..]).unwrap();
        w.finish().unwrap();

        assert_eq!(read_json(&path).unwrap(), sample());
        let text = fs::read_to_string(&path).unwrap();
        assert!(text.contains("타이레놀정"), "non-ASCII must not be escaped");
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn empty_run_writes_empty_array() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("drug_approvals.json");
        JsonFileWriter::create(&path).unwrap().finish().unwrap();
        assert!(read_json(&path).unwrap().is_empty());
    }

    #[test]
    fn unfinished_write_keeps_previous_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("drug_approvals.json");
        let mut w = JsonFileWriter::create(&path).unwrap();
        w.write_batch(&sample()).unwrap();
        w.finish().unwrap();

        let mut w = JsonFileWriter::create(&path).unwrap();
        w.write_batch(&sample()[..1]).unwrap();
        drop(w);

        assert_eq!(read_json(&path).unwrap().len(), 2);
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn single_object_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("one.json");
        fs::write(&path, r#"{"ITEM_SEQ": "1", "LENG_LONG": 8.1}"#).unwrap();
        let recs = read_json(&path).unwrap();
        assert_eq!(recs.len(), 1);
        assert_eq!(recs[0].get("LENG_LONG"), Some(&FieldValue::Decimal(8.1)));
    }

    #[test]
    fn database_writer_upserts() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = Settings::with_api_key("k");
        settings.db_path = dir.path().join("db").join("drugs.sqlite");

        let mut w = Writer::open(&settings, Endpoint::Pill, OutputMode::Database).unwrap();
        w.write_batch(&sample()).unwrap();
        w.write_batch(&sample()[..1]).unwrap();
        assert_eq!(w.written(), 3);
        let summary = RunSummary {
            pages: 1,
            fetched: 3,
            written: 3,
            ..Default::default()
        };
        w.finish(&summary).unwrap();

        let conn = db::connect(&settings.db_path).unwrap();
        let rows = db::load_records(&conn, Endpoint::Pill).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(db::get_stats(&conn).unwrap().runs, 1);
    }
}
