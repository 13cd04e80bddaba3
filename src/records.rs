//! CSV stage files
//!
//! Every stage reads the previous stage's CSV and writes its own, appending
//! columns. Writers flush after each row so that a crash loses at most the
//! row in flight; the committed file is the checkpoint a resumed run scans.

use csv::StringRecord;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::types::EntityRecord;

pub const COL_ID: &str = "EntityId";
pub const COL_NAME: &str = "EntityName";
pub const COL_FILING_DATE: &str = "FilingDate";
pub const COL_REFERENCE: &str = "Reference";

/// Leading columns of every stage file
pub const BASE_COLUMNS: [&str; 4] = [COL_ID, COL_NAME, COL_FILING_DATE, COL_REFERENCE];

/// Errors raised by stage file I/O
#[derive(Debug, Error)]
pub enum RecordError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("{path} has no '{column}' column")]
    MissingColumn { path: PathBuf, column: String },

    #[error("{path} header does not match: expected [{expected}], found [{found}]")]
    HeaderMismatch {
        path: PathBuf,
        expected: String,
        found: String,
    },

    #[error("malformed row at line {line}: {reason}")]
    Malformed { line: u64, reason: String },
}

impl RecordError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        RecordError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// One data row of a stage file
#[derive(Debug, Clone)]
pub struct StageRow {
    /// Entity view of the row
    pub record: EntityRecord,
    /// Raw fields, in header order
    pub fields: StringRecord,
    /// 1-based line in the file
    pub line: u64,
}

/// Streaming reader over a stage file
pub struct StageReader {
    path: PathBuf,
    headers: StringRecord,
    index: HashMap<String, usize>,
    reader: csv::Reader<File>,
}

impl StageReader {
    /// Open a stage file; it must have a header with an id column
    pub fn open(path: impl AsRef<Path>) -> Result<Self, RecordError> {
        Self::open_with_id(path, COL_ID)
    }

    /// Open a stage file whose id column has a different name
    pub fn open_with_id(path: impl AsRef<Path>, id_column: &str) -> Result<Self, RecordError> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path).map_err(|e| RecordError::io(&path, e))?;
        let mut reader = csv::ReaderBuilder::new().has_headers(true).from_reader(file);

        let headers = reader.headers()?.clone();
        let index: HashMap<String, usize> = headers
            .iter()
            .enumerate()
            .map(|(i, name)| (name.trim().to_string(), i))
            .collect();

        if !index.contains_key(id_column) {
            return Err(RecordError::MissingColumn {
                path,
                column: id_column.to_string(),
            });
        }

        let mut index = index;
        if id_column != COL_ID {
            if let Some(&i) = index.get(id_column) {
                index.entry(COL_ID.to_string()).or_insert(i);
            }
        }

        Ok(Self {
            path,
            headers,
            index,
            reader,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn headers(&self) -> &StringRecord {
        &self.headers
    }

    /// Position of a named column
    pub fn column_index(&self, column: &str) -> Option<usize> {
        self.index.get(column).copied()
    }

    /// Value of a named column in a row read from this file
    pub fn field<'a>(&self, row: &'a StageRow, column: &str) -> Option<&'a str> {
        self.column_index(column).and_then(|i| row.fields.get(i))
    }

    /// Iterate over data rows. Malformed rows come back as errors and the
    /// iteration continues after them.
    pub fn rows(&mut self) -> impl Iterator<Item = Result<StageRow, RecordError>> + '_ {
        let headers = &self.headers;
        let index = &self.index;
        self.reader
            .records()
            .map(move |result| build_row(headers, index, result?))
    }
}

fn build_row(
    headers: &StringRecord,
    index: &HashMap<String, usize>,
    fields: StringRecord,
) -> Result<StageRow, RecordError> {
    let line = fields.position().map(|p| p.line()).unwrap_or(0);
    let get = |column: &str| index.get(column).and_then(|&i| fields.get(i)).map(str::trim);

    let id = get(COL_ID).unwrap_or_default();
    if id.is_empty() {
        return Err(RecordError::Malformed {
            line,
            reason: "empty entity id".to_string(),
        });
    }

    let mut record = EntityRecord::new(id, get(COL_NAME).unwrap_or_default());
    if let Some(date) = get(COL_FILING_DATE).filter(|d| !d.is_empty()) {
        record.filing_date = Some(date.to_string());
    }
    if let Some(reference) = get(COL_REFERENCE).filter(|r| !r.is_empty()) {
        record.reference = Some(reference.to_string());
    }

    for (name, value) in headers.iter().zip(fields.iter()) {
        if !BASE_COLUMNS.contains(&name) {
            record.attributes.insert(name.to_string(), value.to_string());
        }
    }

    Ok(StageRow {
        record,
        fields,
        line,
    })
}

/// Header for a parsed-feed file
pub fn record_headers(attribute_columns: &[String]) -> StringRecord {
    let mut headers = StringRecord::from(BASE_COLUMNS.to_vec());
    for column in attribute_columns {
        headers.push_field(column);
    }
    headers
}

/// Fields of a parsed-feed row, matching [`record_headers`]
pub fn record_fields(record: &EntityRecord, attribute_columns: &[String]) -> StringRecord {
    let mut fields = StringRecord::new();
    fields.push_field(&record.id);
    fields.push_field(&record.name);
    fields.push_field(record.filing_date.as_deref().unwrap_or_default());
    fields.push_field(record.reference.as_deref().unwrap_or_default());
    for column in attribute_columns {
        fields.push_field(record.attribute(column).unwrap_or_default());
    }
    fields
}

/// Input headers followed by the columns a stage appends
pub fn extend_headers(base: &StringRecord, extra: &[&str]) -> StringRecord {
    let mut headers = base.clone();
    for column in extra {
        headers.push_field(column);
    }
    headers
}

/// Row-at-a-time CSV writer owned by one stage
pub struct StageWriter {
    path: PathBuf,
    writer: csv::Writer<File>,
    width: usize,
    rows_written: u64,
}

impl StageWriter {
    /// Truncate `path` and write the header
    pub fn create(path: impl AsRef<Path>, headers: &StringRecord) -> Result<Self, RecordError> {
        let path = path.as_ref().to_path_buf();
        ensure_parent(&path)?;
        let file = File::create(&path).map_err(|e| RecordError::io(&path, e))?;
        let mut writer = csv::WriterBuilder::new().from_writer(file);
        writer.write_record(headers)?;
        writer.flush().map_err(|e| RecordError::io(&path, e))?;

        Ok(Self {
            path,
            writer,
            width: headers.len(),
            rows_written: 0,
        })
    }

    /// Open `path` for appending rows, creating it with a header if it is
    /// missing or empty. An existing file must carry exactly `headers`.
    pub fn append(path: impl AsRef<Path>, headers: &StringRecord) -> Result<Self, RecordError> {
        let path = path.as_ref().to_path_buf();
        let is_empty = fs::metadata(&path).map(|m| m.len() == 0).unwrap_or(true);
        if is_empty {
            return Self::create(&path, headers);
        }

        let existing = {
            let file = File::open(&path).map_err(|e| RecordError::io(&path, e))?;
            let mut reader = csv::ReaderBuilder::new().has_headers(true).from_reader(file);
            reader.headers()?.clone()
        };
        if &existing != headers {
            return Err(RecordError::HeaderMismatch {
                path,
                expected: headers.iter().collect::<Vec<_>>().join(","),
                found: existing.iter().collect::<Vec<_>>().join(","),
            });
        }

        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .open(&path)
            .map_err(|e| RecordError::io(&path, e))?;

        // A crash can leave a torn last line; start on a fresh one
        if !ends_with_newline(&mut file).map_err(|e| RecordError::io(&path, e))? {
            file.write_all(b"\n").map_err(|e| RecordError::io(&path, e))?;
        }

        Ok(Self {
            path,
            writer: csv::WriterBuilder::new().from_writer(file),
            width: headers.len(),
            rows_written: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write input fields followed by appended values, then flush
    pub fn write_row(&mut self, base: &StringRecord, extra: &[&str]) -> Result<(), RecordError> {
        let mut row = base.clone();
        for value in extra {
            row.push_field(value);
        }
        self.write_record(&row)
    }

    /// Write a complete record, then flush
    pub fn write_record(&mut self, row: &StringRecord) -> Result<(), RecordError> {
        if row.len() != self.width {
            return Err(RecordError::Malformed {
                line: self.rows_written + 2,
                reason: format!("row has {} fields, header has {}", row.len(), self.width),
            });
        }
        self.writer.write_record(row)?;
        self.writer.flush().map_err(|e| RecordError::io(&self.path, e))?;
        self.rows_written += 1;
        Ok(())
    }

    /// Flush and sync to disk
    pub fn finish(mut self) -> Result<u64, RecordError> {
        self.writer.flush().map_err(|e| RecordError::io(&self.path, e))?;
        let file = self
            .writer
            .into_inner()
            .map_err(|e| RecordError::io(&self.path, e.into_error()))?;
        file.sync_all().map_err(|e| RecordError::io(&self.path, e))?;
        Ok(self.rows_written)
    }
}

fn ends_with_newline(file: &mut File) -> std::io::Result<bool> {
    let len = file.metadata()?.len();
    if len == 0 {
        return Ok(true);
    }
    file.seek(SeekFrom::Start(len - 1))?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last)?;
    Ok(last[0] == b'\n')
}

fn ensure_parent(path: &Path) -> Result<(), RecordError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| RecordError::io(parent, e))?;
    }
    Ok(())
}

/// Sibling path used while a file is being produced
pub fn temp_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    dest.with_file_name(name)
}

/// Atomically move a finished temp file into place
pub fn commit(temp: &Path, dest: &Path) -> Result<(), RecordError> {
    fs::rename(temp, dest).map_err(|e| RecordError::io(dest, e))
}

/// Outcome of [`compact_by_id`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompactionStats {
    pub rows_read: u64,
    pub rows_kept: u64,
    pub malformed_dropped: u64,
}

/// Rewrite `path` keeping only the last row per entity id. Ids listed in
/// `order` come first, in that order; the rest follow in order of first
/// appearance. Malformed rows are dropped.
pub fn compact_by_id(path: &Path, order: &[String]) -> Result<CompactionStats, RecordError> {
    let mut reader = StageReader::open(path)?;
    let headers = reader.headers().clone();
    let id_index = reader.column_index(COL_ID).unwrap_or(0);

    let mut stats = CompactionStats::default();
    let mut seen: Vec<String> = Vec::new();
    let mut latest: HashMap<String, StringRecord> = HashMap::new();

    for row in reader.rows() {
        stats.rows_read += 1;
        match row {
            Ok(row) => {
                let id = row.fields.get(id_index).unwrap_or_default().trim().to_string();
                if !latest.contains_key(&id) {
                    seen.push(id.clone());
                }
                latest.insert(id, row.fields);
            }
            Err(e) => {
                tracing::warn!("Dropping malformed row from {}: {}", path.display(), e);
                stats.malformed_dropped += 1;
            }
        }
    }

    let temp = temp_path(path);
    let mut writer = StageWriter::create(&temp, &headers)?;
    for id in order.iter().chain(seen.iter()) {
        if let Some(fields) = latest.remove(id) {
            writer.write_record(&fields)?;
        }
    }
    stats.rows_kept = writer.finish()?;
    commit(&temp, path)?;

    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn attrs() -> Vec<String> {
        vec!["City".to_string(), "State".to_string()]
    }

    #[test]
    fn test_write_and_read_records() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("parsed.csv");

        let record = EntityRecord::new("100", "Acme, Inc.")
            .with_filing_date("01/15/2024")
            .with_reference("884512")
            .with_attribute("City", "Boston")
            .with_attribute("Ignored", "x");

        let mut writer = StageWriter::create(&path, &record_headers(&attrs())).unwrap();
        writer.write_record(&record_fields(&record, &attrs())).unwrap();
        assert_eq!(writer.finish().unwrap(), 1);

        let mut reader = StageReader::open(&path).unwrap();
        let rows: Vec<_> = reader.rows().collect::<Result<_, _>>().unwrap();
        assert_eq!(rows.len(), 1);

        let read = &rows[0].record;
        assert_eq!(read.id, "100");
        assert_eq!(read.name, "Acme, Inc.");
        assert_eq!(read.filing_date.as_deref(), Some("01/15/2024"));
        assert_eq!(read.reference.as_deref(), Some("884512"));
        assert_eq!(read.attribute("City"), Some("Boston"));
        assert_eq!(read.attribute("State"), Some(""));
        assert_eq!(read.attribute("Ignored"), None);
        assert_eq!(reader.field(&rows[0], "City"), Some("Boston"));
    }

    #[test]
    fn test_missing_id_column() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.csv");
        fs::write(&path, "Name,Date\nAcme,01/01/2024\n").unwrap();

        assert!(matches!(
            StageReader::open(&path),
            Err(RecordError::MissingColumn { .. })
        ));
    }

    #[test]
    fn test_malformed_rows_do_not_stop_iteration() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("mixed.csv");
        fs::write(
            &path,
            "EntityId,EntityName,FilingDate,Reference\n1,A,,\n2,B\n,C,,\n3,D,,\n",
        )
        .unwrap();

        let mut reader = StageReader::open(&path).unwrap();
        let results: Vec<_> = reader.rows().collect();
        assert_eq!(results.len(), 4);

        let ok: Vec<_> = results
            .iter()
            .filter_map(|r| r.as_ref().ok())
            .map(|r| r.record.id.clone())
            .collect();
        assert_eq!(ok, vec!["1", "3"]);
    }

    #[test]
    fn test_append_checks_header_and_repairs_torn_line() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("status.csv");
        let headers = extend_headers(&record_headers(&[]), &["DownloadStatus"]);

        fs::write(&path, "EntityId,EntityName,FilingDate,Reference,DownloadStatus\n1,A,,,SUCCESS\n2,B,,").unwrap();

        let mut writer = StageWriter::append(&path, &headers).unwrap();
        writer
            .write_row(&StringRecord::from(vec!["3", "C", "", ""]), &["FAILED"])
            .unwrap();
        writer.finish().unwrap();

        let mut reader = StageReader::open(&path).unwrap();
        let results: Vec<_> = reader.rows().collect();
        assert_eq!(results.len(), 3);
        assert!(results[1].is_err());
        assert_eq!(results[2].as_ref().unwrap().record.id, "3");

        let other = extend_headers(&record_headers(&[]), &["Other"]);
        assert!(matches!(
            StageWriter::append(&path, &other),
            Err(RecordError::HeaderMismatch { .. })
        ));
    }

    #[test]
    fn test_append_creates_missing_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("new.csv");
        let headers = record_headers(&[]);

        let writer = StageWriter::append(&path, &headers).unwrap();
        assert_eq!(writer.finish().unwrap(), 0);
        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            "EntityId,EntityName,FilingDate,Reference\n"
        );
    }

    #[test]
    fn test_width_enforced() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("w.csv");
        let mut writer = StageWriter::create(&path, &record_headers(&[])).unwrap();
        assert!(writer
            .write_record(&StringRecord::from(vec!["1", "A"]))
            .is_err());
    }

    #[test]
    fn test_compact_keeps_last_row_per_id() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("log.csv");
        fs::write(
            &path,
            "EntityId,EntityName,FilingDate,Reference,DownloadStatus\n\
             1,A,,,FAILED: timeout\n\
             2,B,,,SUCCESS\n\
             1,A,,,SUCCESS\n\
             3,C\n",
        )
        .unwrap();

        let stats = compact_by_id(&path, &[]).unwrap();
        assert_eq!(stats.rows_read, 4);
        assert_eq!(stats.rows_kept, 2);
        assert_eq!(stats.malformed_dropped, 1);

        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            "EntityId,EntityName,FilingDate,Reference,DownloadStatus\n1,A,,,SUCCESS\n2,B,,,SUCCESS\n"
        );
        assert!(!temp_path(&path).exists());
    }

    #[test]
    fn test_compact_follows_input_order() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("log.csv");
        fs::write(
            &path,
            "EntityId,DownloadStatus\n1,SUCCESS\n9,SUCCESS\n3,SUCCESS\n2,FAILED\n2,SUCCESS\n",
        )
        .unwrap();

        let order: Vec<String> = ["1", "2", "3"].iter().map(|s| s.to_string()).collect();
        compact_by_id(&path, &order).unwrap();

        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            "EntityId,DownloadStatus\n1,SUCCESS\n2,SUCCESS\n3,SUCCESS\n9,SUCCESS\n"
        );
    }
}
