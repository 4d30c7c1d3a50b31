//! Append-only text data log.
//!
//! ```text
//! #Procedure: Sweep
//! #Snapshot: {"class":"Sweep","parameters":{...}}
//! #Data:
//! I1,Q1,...
//! 1.5,NaN,...
//! ```
//!
//! Readers keep a byte offset into the file and only parse what was appended
//! since their last read.

use super::line_buffer::LineBuffer;
use super::ResultsStore;
use crate::errors::{AppError, AppResult};
use crate::parameters::float_repr;
use crate::procedure::ProcedureSnapshot;
use crate::table::ResultTable;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

pub const DATA_LOG_EXTENSION: &str = "csv";
const PROCEDURE_PREFIX: &str = "#Procedure: ";
const SNAPSHOT_PREFIX: &str = "#Snapshot: ";
const DATA_MARKER: &str = "#Data:";

#[derive(Debug)]
struct ReaderState {
    table: ResultTable,
    offset: u64,
    lines: LineBuffer,
}

impl ReaderState {
    fn new(columns: &[String], offset: u64) -> Self {
        Self {
            table: ResultTable::new(columns),
            offset,
            lines: LineBuffer::new(),
        }
    }
}

#[derive(Debug)]
pub struct DataLog {
    path: PathBuf,
    snapshot: ProcedureSnapshot,
    columns: Vec<String>,
    header_len: u64,
    writer: Mutex<File>,
    reader: Mutex<ReaderState>,
}

impl DataLog {
    /// Creates a new log at `path`; an existing file is never overwritten.
    pub fn create(path: &Path, snapshot: ProcedureSnapshot, columns: &[String]) -> AppResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let mut file = match OpenOptions::new().append(true).create_new(true).open(path) {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                return Err(AppError::Collision(path.display().to_string()));
            }
            Err(err) => return Err(err.into()),
        };

        let header = format!(
            "{PROCEDURE_PREFIX}{}\n{SNAPSHOT_PREFIX}{}\n{DATA_MARKER}\n{}\n",
            snapshot.class,
            serde_json::to_string(&snapshot)?,
            columns.join(",")
        );
        file.write_all(header.as_bytes())?;
        file.flush()?;
        let header_len = header.len() as u64;

        Ok(Self {
            path: path.to_path_buf(),
            snapshot,
            columns: columns.to_vec(),
            header_len,
            writer: Mutex::new(file),
            reader: Mutex::new(ReaderState::new(columns, header_len)),
        })
    }

    /// Opens an existing log; rows are read lazily on the first [`ResultsStore::data`] call.
    pub fn open(path: &Path) -> AppResult<Self> {
        let file = File::open(path).map_err(|err| match err.kind() {
            ErrorKind::NotFound => AppError::NotFound(path.display().to_string()),
            _ => AppError::from(err),
        })?;
        let mut reader = BufReader::new(file);
        let mut header_len = 0u64;
        let mut next_line = |expected: &str| -> AppResult<String> {
            let mut line = String::new();
            let read = reader.read_line(&mut line)?;
            if read == 0 || !line.ends_with('\n') {
                return Err(AppError::Format(format!("{}: truncated header, expected {expected}", path.display())));
            }
            header_len += read as u64;
            Ok(line.trim_end_matches(['\n', '\r']).to_string())
        };

        let procedure_line = next_line("procedure line")?;
        let snapshot_line = next_line("snapshot line")?;
        let marker = next_line("data marker")?;
        let labels = next_line("column labels")?;

        let class = procedure_line
            .strip_prefix(PROCEDURE_PREFIX)
            .ok_or_else(|| AppError::Format(format!("{}: not a data log", path.display())))?;
        let snapshot: ProcedureSnapshot = serde_json::from_str(
            snapshot_line
                .strip_prefix(SNAPSHOT_PREFIX)
                .ok_or_else(|| AppError::Format(format!("{}: missing snapshot", path.display())))?,
        )?;
        if snapshot.class != class {
            return Err(AppError::Format(format!(
                "{}: header names class '{class}' but snapshot has '{}'",
                path.display(),
                snapshot.class
            )));
        }
        if marker != DATA_MARKER {
            return Err(AppError::Format(format!("{}: missing data marker", path.display())));
        }
        let columns: Vec<String> = labels.split(',').map(ToString::to_string).collect();

        let writer = OpenOptions::new().append(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            snapshot,
            reader: Mutex::new(ReaderState::new(&columns, header_len)),
            columns,
            header_len,
            writer: Mutex::new(writer),
        })
    }

    pub fn snapshot(&self) -> &ProcedureSnapshot {
        &self.snapshot
    }

    /// Whether `path` starts with a data log header.
    pub fn is_data_log(path: &Path) -> bool {
        let Ok(file) = File::open(path) else {
            return false;
        };
        let mut first = String::new();
        BufReader::new(file).read_line(&mut first).is_ok() && first.starts_with(PROCEDURE_PREFIX)
    }

    fn lock_writer(&self) -> AppResult<MutexGuard<'_, File>> {
        self.writer
            .lock()
            .map_err(|_| AppError::Internal("data log writer mutex poisoned".to_string()))
    }

    fn lock_reader(&self) -> AppResult<MutexGuard<'_, ReaderState>> {
        self.reader
            .lock()
            .map_err(|_| AppError::Internal("data log reader mutex poisoned".to_string()))
    }

    fn format_rows(&self, rows: &[Vec<f64>]) -> AppResult<String> {
        let mut text = String::new();
        for row in rows {
            if row.len() != self.columns.len() {
                return Err(AppError::InvalidInput(format!(
                    "row has {} values for {} columns",
                    row.len(),
                    self.columns.len()
                )));
            }
            let line = row.iter().map(|sample| format_sample(*sample)).collect::<Vec<_>>();
            text.push_str(&line.join(","));
            text.push('\n');
        }
        Ok(text)
    }

    fn read_new_rows(&self, state: &mut ReaderState) -> AppResult<()> {
        let mut file = File::open(&self.path)?;
        let file_len = file.metadata()?.len();
        if file_len < state.offset {
            // Truncated underneath us by a clear from another handle.
            *state = ReaderState::new(&self.columns, self.header_len);
        }
        file.seek(SeekFrom::Start(state.offset))?;
        let mut chunk = Vec::new();
        file.read_to_end(&mut chunk)?;
        state.offset += chunk.len() as u64;

        let mut rows = Vec::new();
        for line in state.lines.push(&chunk) {
            rows.push(parse_row(&line, self.columns.len()).map_err(|message| {
                AppError::Format(format!("{}: {message}", self.path.display()))
            })?);
        }
        state.table.append_rows(&rows)
    }
}

impl ResultsStore for DataLog {
    fn path(&self) -> &Path {
        &self.path
    }

    fn columns(&self) -> &[String] {
        &self.columns
    }

    fn append(&self, rows: &[Vec<f64>]) -> AppResult<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let text = self.format_rows(rows)?;
        let mut writer = self.lock_writer()?;
        writer.write_all(text.as_bytes())?;
        writer.flush()?;
        Ok(())
    }

    fn clear(&self) -> AppResult<()> {
        let writer = self.lock_writer()?;
        writer.set_len(self.header_len)?;
        drop(writer);
        let mut state = self.lock_reader()?;
        *state = ReaderState::new(&self.columns, self.header_len);
        Ok(())
    }

    fn data(&self) -> AppResult<ResultTable> {
        let mut state = self.lock_reader()?;
        self.read_new_rows(&mut state)?;
        Ok(state.table.clone())
    }

    fn reload(&self) -> AppResult<ResultTable> {
        let mut state = self.lock_reader()?;
        *state = ReaderState::new(&self.columns, self.header_len);
        self.read_new_rows(&mut state)?;
        Ok(state.table.clone())
    }

    fn replace(&self, build: &mut dyn FnMut(&ResultTable) -> AppResult<Vec<Vec<f64>>>) -> AppResult<usize> {
        // Writer then reader, the same order as `clear`.
        let mut writer = self.lock_writer()?;
        let mut state = self.lock_reader()?;
        self.read_new_rows(&mut state)?;
        let rows = build(&state.table)?;
        let text = self.format_rows(&rows)?;

        writer.set_len(self.header_len)?;
        writer.write_all(text.as_bytes())?;
        writer.flush()?;
        *state = ReaderState::new(&self.columns, self.header_len);
        self.read_new_rows(&mut state)?;
        Ok(rows.len())
    }

    fn flush(&self) -> AppResult<()> {
        self.lock_writer()?.sync_data()?;
        Ok(())
    }

    fn finish(&self) -> AppResult<()> {
        self.flush()
    }
}

fn format_sample(sample: f64) -> String {
    if sample.is_finite() {
        sample.to_string()
    } else {
        float_repr::encode(sample)
    }
}

fn parse_row(line: &str, width: usize) -> Result<Vec<f64>, String> {
    let row = line
        .split(',')
        .map(|field| float_repr::decode(field.trim()))
        .collect::<Result<Vec<_>, _>>()?;
    if row.len() != width {
        return Err(format!("row '{line}' has {} fields, expected {width}", row.len()));
    }
    Ok(row)
}

#[cfg(test)]
mod tests {
    use super::DataLog;
    use crate::errors::AppError;
    use crate::procedure::ProcedureSnapshot;
    use crate::results::ResultsStore;
    use std::collections::BTreeMap;
    use std::io::Write;

    fn snapshot() -> ProcedureSnapshot {
        ProcedureSnapshot {
            class: "Sweep".to_string(),
            parameters: BTreeMap::new(),
        }
    }

    fn columns() -> Vec<String> {
        vec!["I1".to_string(), "Q1".to_string()]
    }

    #[test]
    fn reader_sees_only_appended_rows_and_reload_rereads() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("run.csv");
        let log = DataLog::create(&path, snapshot(), &columns()).expect("create");
        log.append(&[vec![1.0, f64::NAN], vec![2.0, 3.0]]).expect("append");
        assert_eq!(log.data().expect("data").len(), 2);

        log.append(&[vec![4.0, 5.0]]).expect("append");
        let table = log.data().expect("data");
        assert_eq!(table.column("I1").expect("I1"), &[1.0, 2.0, 4.0]);
        assert!(table.column("Q1").expect("Q1")[0].is_nan());

        let reopened = DataLog::open(&path).expect("open");
        assert_eq!(reopened.snapshot(), &snapshot());
        assert_eq!(reopened.reload().expect("reload"), table);
    }

    #[test]
    fn partial_trailing_row_is_deferred() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("run.csv");
        let log = DataLog::create(&path, snapshot(), &columns()).expect("create");
        let mut raw = std::fs::OpenOptions::new().append(true).open(&path).expect("open raw");
        raw.write_all(b"1,2\n3,").expect("write partial");
        assert_eq!(log.data().expect("data").len(), 1);
        raw.write_all(b"4\n").expect("finish row");
        assert_eq!(log.data().expect("data").row(1), Some(vec![3.0, 4.0]));
    }

    #[test]
    fn clear_truncates_to_header() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("run.csv");
        let log = DataLog::create(&path, snapshot(), &columns()).expect("create");
        log.append(&[vec![1.0, 2.0]]).expect("append");
        log.clear().expect("clear");
        assert!(log.data().expect("data").is_empty());
        log.append(&[vec![7.0, 8.0]]).expect("append");
        assert_eq!(log.data().expect("data").row(0), Some(vec![7.0, 8.0]));
    }

    #[test]
    fn create_refuses_existing_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("run.csv");
        DataLog::create(&path, snapshot(), &columns()).expect("create");
        let err = DataLog::create(&path, snapshot(), &columns()).expect_err("collision");
        assert!(matches!(err, AppError::Collision(_)));
        assert!(DataLog::is_data_log(&path));
    }
}
