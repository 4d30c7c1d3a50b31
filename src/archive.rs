//! Columnar binary container for a finished run.
//!
//! Layout: `SWQA` magic, one version byte, a little-endian `u32` header length,
//! the JSON header, then each column as `rows` little-endian `f64` values in
//! header column order.

use crate::errors::{AppError, AppResult};
use crate::procedure::ProcedureSnapshot;
use crate::table::ResultTable;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

pub const ARCHIVE_EXTENSION: &str = "swq";
const MAGIC: &[u8; 4] = b"SWQA";
const VERSION: u8 = 1;
const MAX_HEADER_BYTES: u32 = 16 * 1024 * 1024;

/// Everything needed to rebuild a run's results without the original procedure.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultsPayload {
    pub snapshot: ProcedureSnapshot,
    pub metadata: serde_json::Value,
    pub table: ResultTable,
}

impl ResultsPayload {
    pub fn new(snapshot: ProcedureSnapshot, table: ResultTable) -> Self {
        Self {
            snapshot,
            metadata: serde_json::Value::Null,
            table,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ArchiveHeader {
    snapshot: ProcedureSnapshot,
    metadata: serde_json::Value,
    columns: Vec<String>,
    rows: u64,
    written_at: DateTime<Utc>,
}

pub fn is_archive(path: &Path) -> bool {
    let Ok(mut file) = File::open(path) else {
        return false;
    };
    let mut magic = [0u8; 4];
    file.read_exact(&mut magic).is_ok() && &magic == MAGIC
}

/// Writes `payload` to `path`, replacing any existing file atomically.
pub fn write(path: &Path, payload: &ResultsPayload) -> AppResult<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let tmp = temp_sibling(path);
    {
        let file = File::create(&tmp)?;
        encode(BufWriter::new(file), payload)?;
    }
    fs::rename(&tmp, path).map_err(|err| {
        let _ = fs::remove_file(&tmp);
        AppError::Io(format!("failed to move archive into {}: {err}", path.display()))
    })
}

/// Writes `payload` to `path` only if nothing exists there yet.
pub fn write_new(path: &Path, payload: &ResultsPayload) -> AppResult<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let file = match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == ErrorKind::AlreadyExists => {
            return Err(AppError::Collision(path.display().to_string()));
        }
        Err(err) => return Err(err.into()),
    };
    if let Err(err) = encode(BufWriter::new(file), payload) {
        let _ = fs::remove_file(path);
        return Err(err);
    }
    Ok(())
}

pub fn read(path: &Path) -> AppResult<ResultsPayload> {
    let file = File::open(path).map_err(|err| match err.kind() {
        ErrorKind::NotFound => AppError::NotFound(path.display().to_string()),
        _ => AppError::from(err),
    })?;
    let file_len = file.metadata()?.len();
    decode(BufReader::new(file), file_len).map_err(|err| match err {
        AppError::Format(message) => AppError::Format(format!("{}: {message}", path.display())),
        other => other,
    })
}

fn encode<W: Write>(mut writer: W, payload: &ResultsPayload) -> AppResult<()> {
    let header = ArchiveHeader {
        snapshot: payload.snapshot.clone(),
        metadata: payload.metadata.clone(),
        columns: payload.table.columns().to_vec(),
        rows: payload.table.len() as u64,
        written_at: Utc::now(),
    };
    let header_bytes = serde_json::to_vec(&header)?;
    let header_len = u32::try_from(header_bytes.len())
        .map_err(|_| AppError::Format("archive header is too large".to_string()))?;

    writer.write_all(MAGIC)?;
    writer.write_all(&[VERSION])?;
    writer.write_all(&header_len.to_le_bytes())?;
    writer.write_all(&header_bytes)?;
    for column in payload.table.raw_columns() {
        for sample in column {
            writer.write_all(&sample.to_le_bytes())?;
        }
    }
    writer.flush()?;
    Ok(())
}

/// Decodes an archive of `file_len` bytes. Sizes in the header are checked
/// against the bytes actually present before anything is allocated.
fn decode<R: Read>(mut reader: R, file_len: u64) -> AppResult<ResultsPayload> {
    let mut magic = [0u8; 4];
    reader
        .read_exact(&mut magic)
        .map_err(|_| AppError::Format("truncated archive".to_string()))?;
    if &magic != MAGIC {
        return Err(AppError::Format("not a run archive".to_string()));
    }
    let mut version = [0u8; 1];
    reader
        .read_exact(&mut version)
        .map_err(|_| AppError::Format("truncated archive".to_string()))?;
    if version[0] != VERSION {
        return Err(AppError::Format(format!("unsupported archive version {}", version[0])));
    }

    let mut len_bytes = [0u8; 4];
    reader
        .read_exact(&mut len_bytes)
        .map_err(|_| AppError::Format("truncated archive".to_string()))?;
    let header_len = u32::from_le_bytes(len_bytes);
    if header_len > MAX_HEADER_BYTES || u64::from(header_len) > file_len {
        return Err(AppError::Format(format!("archive header of {header_len} bytes is implausible")));
    }
    let mut header_bytes = vec![0u8; header_len as usize];
    reader
        .read_exact(&mut header_bytes)
        .map_err(|_| AppError::Format("truncated archive header".to_string()))?;
    let header: ArchiveHeader = serde_json::from_slice(&header_bytes)?;

    if header.columns.is_empty() && header.rows != 0 {
        return Err(AppError::Format(format!("header declares {} rows but no columns", header.rows)));
    }
    let consumed = (MAGIC.len() + 1 + len_bytes.len()) as u64 + u64::from(header_len);
    let remaining = file_len.saturating_sub(consumed);
    let expected = (header.columns.len() as u64)
        .checked_mul(header.rows)
        .and_then(|samples| samples.checked_mul(8))
        .ok_or_else(|| AppError::Format(format!("row count {} overflows", header.rows)))?;
    if expected != remaining {
        return Err(AppError::Format(format!(
            "header declares {} rows of {} columns ({expected} bytes) but {remaining} bytes follow",
            header.rows,
            header.columns.len()
        )));
    }
    let rows = usize::try_from(header.rows).map_err(|_| AppError::Format("row count overflow".to_string()))?;

    let mut data = Vec::with_capacity(header.columns.len());
    let mut bytes = vec![0u8; rows * 8];
    for _ in &header.columns {
        reader
            .read_exact(&mut bytes)
            .map_err(|_| AppError::Format("truncated archive data".to_string()))?;
        let column: Vec<f64> = bytes
            .chunks_exact(8)
            .map(|chunk| {
                let mut sample = [0u8; 8];
                sample.copy_from_slice(chunk);
                f64::from_le_bytes(sample)
            })
            .collect();
        data.push(column);
    }

    Ok(ResultsPayload {
        snapshot: header.snapshot,
        metadata: header.metadata,
        table: ResultTable::from_columns(header.columns, data)?,
    })
}

fn temp_sibling(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "archive".into());
    name.push(format!(".{}.tmp", uuid::Uuid::new_v4().simple()));
    path.with_file_name(name)
}
