//! Append-only attendance ledger persisted as CSV (`Name,Date,Time`).
//!
//! At most one record exists per name per calendar day. The duplicate check
//! and the append run under one lock, and each row reaches the file in a
//! single write that is rolled back on failure.

use chrono::{NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use serde::Serialize;
use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;

pub const DATE_FORMAT: &str = "%Y-%m-%d";
pub const TIME_FORMAT: &str = "%H:%M:%S";
const HEADER: [&str; 3] = ["Name", "Date", "Time"];

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("attendance file unavailable at {path}: {source}")]
    Storage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("csv: {0}")]
    Csv(#[from] csv::Error),
}

/// One attendance event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttendanceRecord {
    pub name: String,
    pub date: NaiveDate,
    pub time: NaiveTime,
}

impl AttendanceRecord {
    fn to_row(&self) -> [String; 3] {
        [
            self.name.clone(),
            self.date.format(DATE_FORMAT).to_string(),
            self.time.format(TIME_FORMAT).to_string(),
        ]
    }

    fn from_row(row: &csv::StringRecord) -> Option<Self> {
        let name = row.get(0)?.trim();
        if name.is_empty() {
            return None;
        }
        Some(Self {
            name: name.to_string(),
            date: NaiveDate::parse_from_str(row.get(1)?.trim(), DATE_FORMAT).ok()?,
            time: NaiveTime::parse_from_str(row.get(2)?.trim(), TIME_FORMAT).ok()?,
        })
    }
}

/// Outcome of [`AttendanceLedger::record`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    Marked,
    AlreadyMarked,
}

struct LedgerState {
    file: File,
    records: Vec<AttendanceRecord>,
    seen: HashSet<(String, NaiveDate)>,
}

/// Attendance ledger backed by a CSV file.
pub struct AttendanceLedger {
    path: PathBuf,
    state: Mutex<LedgerState>,
}

impl AttendanceLedger {
    /// Open the ledger at `path`, creating it with a header row if absent.
    ///
    /// Existing rows are loaded; malformed rows are skipped with a warning.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, LedgerError> {
        let path = path.into();
        let storage = |e: std::io::Error| LedgerError::Storage {
            path: path.clone(),
            source: e,
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(storage)?;
        }

        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&path)
            .map_err(storage)?;

        let mut contents = Vec::new();
        file.read_to_end(&mut contents).map_err(storage)?;

        if contents.is_empty() {
            file.write_all(&encode_row(&HEADER)?).map_err(storage)?;
            file.sync_data().map_err(storage)?;
        } else if contents.last() != Some(&b'\n') {
            // Hand-edited file without a trailing newline.
            file.write_all(b"\n").map_err(storage)?;
        }

        let mut records = Vec::new();
        let mut seen = HashSet::new();
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_reader(contents.as_slice());
        for (line, row) in reader.records().enumerate() {
            match row.ok().as_ref().and_then(AttendanceRecord::from_row) {
                Some(record) => {
                    seen.insert((record.name.clone(), record.date));
                    records.push(record);
                }
                None => tracing::warn!(path = %path.display(), row = line + 1, "skipping malformed attendance row"),
            }
        }

        file.seek(SeekFrom::End(0)).map_err(storage)?;
        tracing::info!(path = %path.display(), records = records.len(), "attendance ledger opened");

        Ok(Self {
            path,
            state: Mutex::new(LedgerState { file, records, seen }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> MutexGuard<'_, LedgerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record attendance for `name` at `when`, once per calendar day.
    ///
    /// Returns [`RecordOutcome::AlreadyMarked`] without touching the file when
    /// `name` already has a record dated `when.date()`. Times are stored at
    /// second precision.
    pub fn record(&self, name: &str, when: NaiveDateTime) -> Result<RecordOutcome, LedgerError> {
        let record = AttendanceRecord {
            name: name.to_string(),
            date: when.date(),
            time: when.time().with_nanosecond(0).unwrap_or_else(|| when.time()),
        };
        let key = (record.name.clone(), record.date);

        let mut state = self.lock();
        if state.seen.contains(&key) {
            tracing::debug!(name, date = %record.date, "attendance already marked");
            return Ok(RecordOutcome::AlreadyMarked);
        }

        let row = encode_row(&record.to_row())?;
        append_all_or_nothing(&mut state.file, &row).map_err(|e| LedgerError::Storage {
            path: self.path.clone(),
            source: e,
        })?;

        tracing::info!(name, date = %record.date, time = %record.time, "attendance marked");
        state.seen.insert(key);
        state.records.push(record);
        Ok(RecordOutcome::Marked)
    }

    /// All records, newest first (date then time, descending).
    pub fn list(&self) -> Vec<AttendanceRecord> {
        let mut records = self.lock().records.clone();
        sort_newest_first(&mut records);
        records
    }

    /// Records dated `date`, newest first.
    pub fn records_on(&self, date: NaiveDate) -> Vec<AttendanceRecord> {
        let mut records: Vec<AttendanceRecord> = self
            .lock()
            .records
            .iter()
            .filter(|r| r.date == date)
            .cloned()
            .collect();
        sort_newest_first(&mut records);
        records
    }

    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Write the header and every record, newest first, as CSV.
    pub fn export_csv<W: Write>(&self, writer: W) -> Result<(), LedgerError> {
        let mut out = csv::Writer::from_writer(writer);
        out.write_record(HEADER)?;
        for record in self.list() {
            out.write_record(record.to_row())?;
        }
        out.flush().map_err(|e| LedgerError::Csv(e.into()))?;
        Ok(())
    }
}

fn sort_newest_first(records: &mut [AttendanceRecord]) {
    records.sort_by(|a, b| (b.date, b.time).cmp(&(a.date, a.time)));
}

fn encode_row<I, T>(fields: I) -> Result<Vec<u8>, LedgerError>
where
    I: IntoIterator<Item = T>,
    T: AsRef<[u8]>,
{
    let mut out = csv::Writer::from_writer(Vec::new());
    out.write_record(fields)?;
    out.into_inner()
        .map_err(|e| LedgerError::Csv(e.into_error().into()))
}

/// Destination of appended ledger rows.
trait RowSink: Write {
    fn size(&self) -> std::io::Result<u64>;
    fn truncate(&self, len: u64) -> std::io::Result<()>;
    fn sync(&self) -> std::io::Result<()>;
}

impl RowSink for File {
    fn size(&self) -> std::io::Result<u64> {
        Ok(self.metadata()?.len())
    }

    fn truncate(&self, len: u64) -> std::io::Result<()> {
        self.set_len(len)
    }

    fn sync(&self) -> std::io::Result<()> {
        self.sync_data()
    }
}

/// Append `bytes` in one write; on failure truncate back to the prior length.
fn append_all_or_nothing<S: RowSink>(sink: &mut S, bytes: &[u8]) -> std::io::Result<()> {
    let before = sink.size()?;
    let result = sink
        .write_all(bytes)
        .and_then(|()| sink.flush())
        .and_then(|()| sink.sync());
    if let Err(e) = result {
        if let Err(trunc) = sink.truncate(before) {
            tracing::error!(error = %trunc, "failed to roll back partial attendance row");
        }
        return Err(e);
    }
    Ok(())
}
