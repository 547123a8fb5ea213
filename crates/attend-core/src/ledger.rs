//! Append-only attendance ledger, deduplicated per identity per day.
//!
//! The ledger owns a present-set for the current day and an injected
//! [`LedgerStore`]. A single mutex covers the present-set check, the
//! durable append and the present-set update, so concurrent recognition
//! loops cannot write the same identity twice. The store write happens
//! before the identity is marked present: a failed append leaves the
//! identity unmarked.

use crate::types::{AttendanceRecord, Method};
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;

const CSV_HEADER: &str = "Name,Time,Method";
const TIME_FORMAT: &str = "%H:%M:%S";

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("ledger I/O on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed ledger row {line} in {path}: {reason}")]
    Malformed {
        path: PathBuf,
        line: usize,
        reason: String,
    },
    #[error("storage backend rejected the write: {0}")]
    Backend(String),
    #[error("identity must not be empty")]
    EmptyIdentity,
    #[error("identity contains control characters: {0:?}")]
    ControlCharacter(String),
    #[error("ledger lock poisoned")]
    Poisoned,
}

/// Durable storage for attendance records.
pub trait LedgerStore: Send {
    /// All records already stored for `date`, in write order.
    fn load_day(&mut self, date: NaiveDate) -> Result<Vec<AttendanceRecord>, LedgerError>;

    /// Append one record. Must be durable when this returns `Ok`.
    fn append(&mut self, record: &AttendanceRecord) -> Result<(), LedgerError>;
}

/// Outcome of [`Ledger::record`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordOutcome {
    Recorded(AttendanceRecord),
    AlreadyPresent,
}

impl RecordOutcome {
    pub fn is_recorded(&self) -> bool {
        matches!(self, RecordOutcome::Recorded(_))
    }
}

struct LedgerState<S> {
    store: S,
    day: Option<NaiveDate>,
    present: HashSet<String>,
    /// Records of `day`, in write order.
    records: Vec<AttendanceRecord>,
}

impl<S: LedgerStore> LedgerState<S> {
    /// Switch to `date`, seeding the present-set from what the store already holds.
    fn open_day(&mut self, date: NaiveDate) -> Result<(), LedgerError> {
        if self.day == Some(date) {
            return Ok(());
        }
        let existing = self.store.load_day(date)?;
        if let Some(prev) = self.day {
            tracing::info!(from = %prev, to = %date, "ledger day rollover");
        }
        self.present = existing.iter().map(|r| r.identity.clone()).collect();
        self.records = existing;
        self.day = Some(date);
        tracing::debug!(date = %date, already_present = self.present.len(), "ledger day opened");
        Ok(())
    }
}

/// Deduplicating attendance ledger. Share it behind an `Arc`.
pub struct Ledger<S> {
    inner: Mutex<LedgerState<S>>,
}

impl<S: LedgerStore> Ledger<S> {
    pub fn new(store: S) -> Self {
        Self {
            inner: Mutex::new(LedgerState {
                store,
                day: None,
                present: HashSet::new(),
                records: Vec::new(),
            }),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, LedgerState<S>>, LedgerError> {
        self.inner.lock().map_err(|_| LedgerError::Poisoned)
    }

    /// Record `identity` at `at` unless it is already present that day.
    ///
    /// Identities are stored one per line, so line breaks and other control
    /// characters are rejected.
    pub fn record(
        &self,
        identity: &str,
        at: NaiveDateTime,
        method: Method,
    ) -> Result<RecordOutcome, LedgerError> {
        let identity = identity.trim();
        if identity.is_empty() {
            return Err(LedgerError::EmptyIdentity);
        }
        if identity.chars().any(char::is_control) {
            return Err(LedgerError::ControlCharacter(identity.to_string()));
        }

        let mut state = self.lock()?;
        state.open_day(at.date())?;

        if state.present.contains(identity) {
            return Ok(RecordOutcome::AlreadyPresent);
        }

        let record = AttendanceRecord::new(identity, at, method);
        state.store.append(&record)?;
        state.present.insert(record.identity.clone());
        state.records.push(record.clone());

        tracing::info!(
            identity = %record.identity,
            date = %record.date,
            time = %record.time.format(TIME_FORMAT),
            method = record.method.as_str(),
            "attendance recorded"
        );
        Ok(RecordOutcome::Recorded(record))
    }

    pub fn is_present(&self, identity: &str, date: NaiveDate) -> Result<bool, LedgerError> {
        let mut state = self.lock()?;
        state.open_day(date)?;
        Ok(state.present.contains(identity.trim()))
    }

    /// Records written for `date`, in write order.
    pub fn present(&self, date: NaiveDate) -> Result<Vec<AttendanceRecord>, LedgerError> {
        let mut state = self.lock()?;
        state.open_day(date)?;
        Ok(state.records.clone())
    }

    /// Run `f` against the backing store under the ledger lock.
    pub fn with_store<R>(&self, f: impl FnOnce(&mut S) -> R) -> Result<R, LedgerError> {
        let mut state = self.lock()?;
        Ok(f(&mut state.store))
    }
}

/// One CSV file per calendar date: `attendance_<YYYY-MM-DD>.csv`.
///
/// A crash mid-append can leave a torn final row with no line break. Loading
/// skips it, and the next append cuts it off before writing.
#[derive(Debug, Clone)]
pub struct CsvDayStore {
    dir: PathBuf,
}

impl CsvDayStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, date: NaiveDate) -> PathBuf {
        self.dir
            .join(format!("attendance_{}.csv", date.format("%Y-%m-%d")))
    }
}

impl LedgerStore for CsvDayStore {
    fn load_day(&mut self, date: NaiveDate) -> Result<Vec<AttendanceRecord>, LedgerError> {
        let path = self.path_for(date);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(LedgerError::Io { path, source }),
        };

        let contents = String::from_utf8_lossy(&bytes);
        let terminated = contents.ends_with('\n');
        let lines: Vec<&str> = contents.lines().collect();

        let mut records = Vec::new();
        for (idx, line) in lines.iter().enumerate() {
            if line.trim().is_empty() || (idx == 0 && line.starts_with("Name,")) {
                continue;
            }
            match parse_row(line, date) {
                Ok(record) => records.push(record),
                Err(reason) if !terminated && idx + 1 == lines.len() => {
                    tracing::warn!(
                        path = %path.display(),
                        line = idx + 1,
                        reason = %reason,
                        "skipping torn final ledger row"
                    );
                }
                Err(reason) => {
                    return Err(LedgerError::Malformed {
                        path,
                        line: idx + 1,
                        reason,
                    })
                }
            }
        }
        Ok(records)
    }

    fn append(&mut self, record: &AttendanceRecord) -> Result<(), LedgerError> {
        let path = self.path_for(record.date);
        let io_err = |source| LedgerError::Io {
            path: path.clone(),
            source,
        };

        fs::create_dir_all(&self.dir).map_err(|source| LedgerError::Io {
            path: self.dir.clone(),
            source,
        })?;

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(io_err)?;

        let mut existing = Vec::new();
        file.read_to_end(&mut existing).map_err(io_err)?;
        let keep = intact_len(&existing, record.date);
        if keep < existing.len() {
            tracing::warn!(
                path = %path.display(),
                dropped_bytes = existing.len() - keep,
                "cutting torn final ledger row"
            );
            file.set_len(keep as u64).map_err(io_err)?;
        }
        file.seek(SeekFrom::Start(keep as u64)).map_err(io_err)?;

        let mut buf = String::new();
        if keep == 0 {
            buf.push_str(CSV_HEADER);
            buf.push('\n');
        } else if existing[keep - 1] != b'\n' {
            buf.push('\n');
        }
        buf.push_str(&format!(
            "{},{},{}\n",
            csv_field(&record.identity),
            record.time.format(TIME_FORMAT),
            record.method.as_str()
        ));

        file.write_all(buf.as_bytes()).map_err(io_err)?;
        file.sync_data().map_err(io_err)?;
        Ok(())
    }
}

/// Parse one data row: `name,time` (legacy) or `name,time,method`.
fn parse_row(line: &str, date: NaiveDate) -> Result<AttendanceRecord, String> {
    let fields = split_csv_row(line.trim_end_matches('\r'))
        .ok_or_else(|| "unterminated quote".to_string())?;
    let (identity, time, method) = match fields.as_slice() {
        [name, time] => (name, time, Method::Camera),
        [name, time, method] => (
            name,
            time,
            Method::parse(method).ok_or_else(|| "unknown method".to_string())?,
        ),
        _ => return Err("expected 2 or 3 columns".into()),
    };
    let time = NaiveTime::parse_from_str(time.trim(), TIME_FORMAT).map_err(|e| e.to_string())?;

    Ok(AttendanceRecord {
        identity: identity.clone(),
        date,
        time,
        method,
    })
}

/// Bytes of an existing day file to keep before appending.
///
/// Everything is kept unless the file ends in an unterminated line that is
/// not a valid row; that line is the remains of an interrupted append.
fn intact_len(contents: &[u8], date: NaiveDate) -> usize {
    if contents.is_empty() || contents.ends_with(b"\n") {
        return contents.len();
    }
    let start = contents
        .iter()
        .rposition(|&b| b == b'\n')
        .map_or(0, |i| i + 1);
    let tail = String::from_utf8_lossy(&contents[start..]);
    if tail.trim().is_empty() || parse_row(&tail, date).is_ok() {
        contents.len()
    } else {
        start
    }
}

/// Quote a field when it contains a delimiter or a quote.
fn csv_field(value: &str) -> String {
    if value.contains([',', '"']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

/// Split one CSV line. Returns `None` on an unterminated quoted field.
fn split_csv_row(line: &str) -> Option<Vec<String>> {
    let mut fields = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        match (c, in_quotes) {
            ('"', true) if chars.peek() == Some(&'"') => {
                field.push('"');
                chars.next();
            }
            ('"', true) => in_quotes = false,
            ('"', false) if field.is_empty() => in_quotes = true,
            (',', false) => fields.push(std::mem::take(&mut field)),
            _ => field.push(c),
        }
    }
    if in_quotes {
        return None;
    }
    fields.push(field);
    Some(fields)
}

/// In-memory store for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Vec<AttendanceRecord>,
    fail_next: bool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `append` fail once.
    pub fn fail_next_append(&mut self) {
        self.fail_next = true;
    }

    pub fn records(&self) -> &[AttendanceRecord] {
        &self.records
    }
}

impl LedgerStore for MemoryStore {
    fn load_day(&mut self, date: NaiveDate) -> Result<Vec<AttendanceRecord>, LedgerError> {
        Ok(self
            .records
            .iter()
            .filter(|r| r.date == date)
            .cloned()
            .collect())
    }

    fn append(&mut self, record: &AttendanceRecord) -> Result<(), LedgerError> {
        if std::mem::take(&mut self.fail_next) {
            return Err(LedgerError::Backend("injected failure".into()));
        }
        self.records.push(record.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn at(day: u32, h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 5, day)
            .unwrap()
            .and_hms_opt(h, m, s)
            .unwrap()
    }

    #[test]
    fn test_record_is_idempotent_per_day() {
        let ledger = Ledger::new(MemoryStore::new());
        let first = ledger.record("Alice", at(1, 9, 0, 0), Method::Camera).unwrap();
        assert!(first.is_recorded());

        for minute in 1..10 {
            let again = ledger
                .record("Alice", at(1, 9, minute, 0), Method::Camera)
                .unwrap();
            assert_eq!(again, RecordOutcome::AlreadyPresent);
        }

        let records = ledger.with_store(|s| s.records().to_vec()).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].time, NaiveTime::from_hms_opt(9, 0, 0).unwrap());
    }

    #[test]
    fn test_external_mark_dedups_with_camera() {
        let ledger = Ledger::new(MemoryStore::new());
        ledger.record("Bob", at(1, 8, 0, 0), Method::External).unwrap();
        let again = ledger.record("Bob", at(1, 8, 5, 0), Method::Camera).unwrap();
        assert_eq!(again, RecordOutcome::AlreadyPresent);
    }

    #[test]
    fn test_failed_write_does_not_mark_present() {
        let ledger = Ledger::new(MemoryStore::new());
        ledger.with_store(|s| s.fail_next_append()).unwrap();

        let err = ledger.record("Alice", at(1, 9, 0, 0), Method::Camera);
        assert!(matches!(err, Err(LedgerError::Backend(_))));
        assert!(!ledger.is_present("Alice", at(1, 0, 0, 0).date()).unwrap());

        // Next confirmation retries and succeeds.
        let retry = ledger.record("Alice", at(1, 9, 0, 5), Method::Camera).unwrap();
        assert!(retry.is_recorded());
    }

    #[test]
    fn test_new_day_records_again() {
        let ledger = Ledger::new(MemoryStore::new());
        assert!(ledger.record("Alice", at(1, 9, 0, 0), Method::Camera).unwrap().is_recorded());
        assert!(ledger.record("Alice", at(2, 9, 0, 0), Method::Camera).unwrap().is_recorded());
        assert_eq!(ledger.present(at(1, 0, 0, 0).date()).unwrap().len(), 1);
        assert_eq!(ledger.present(at(2, 0, 0, 0).date()).unwrap().len(), 1);
    }

    #[test]
    fn test_empty_identity_rejected() {
        let ledger = Ledger::new(MemoryStore::new());
        assert!(matches!(
            ledger.record("  ", at(1, 9, 0, 0), Method::External),
            Err(LedgerError::EmptyIdentity)
        ));
    }

    #[test]
    fn test_concurrent_writers_record_once() {
        let ledger = Arc::new(Ledger::new(MemoryStore::new()));
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let ledger = Arc::clone(&ledger);
                std::thread::spawn(move || {
                    ledger
                        .record("Alice", at(1, 9, 0, i), Method::Camera)
                        .unwrap()
                        .is_recorded()
                })
            })
            .collect();

        let written = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|recorded| *recorded)
            .count();
        assert_eq!(written, 1);
        assert_eq!(ledger.with_store(|s| s.records().len()).unwrap(), 1);
    }

    #[test]
    fn test_csv_two_identities_in_write_order() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Ledger::new(CsvDayStore::new(dir.path()));
        ledger.record("Alice", at(3, 9, 1, 2), Method::Camera).unwrap();
        ledger.record("Bob", at(3, 9, 5, 0), Method::External).unwrap();
        ledger.record("Alice", at(3, 9, 7, 0), Method::Camera).unwrap();

        let path = dir.path().join("attendance_2024-05-03.csv");
        let contents = fs::read_to_string(path).unwrap();
        assert_eq!(
            contents,
            "Name,Time,Method\nAlice,09:01:02,camera\nBob,09:05:00,external\n"
        );
    }

    #[test]
    fn test_csv_restart_seeds_present_set() {
        let dir = tempfile::tempdir().unwrap();
        {
            let ledger = Ledger::new(CsvDayStore::new(dir.path()));
            ledger.record("Alice", at(3, 9, 0, 0), Method::Camera).unwrap();
        }
        let ledger = Ledger::new(CsvDayStore::new(dir.path()));
        let outcome = ledger.record("Alice", at(3, 10, 0, 0), Method::Camera).unwrap();
        assert_eq!(outcome, RecordOutcome::AlreadyPresent);

        let present = ledger.present(at(3, 0, 0, 0).date()).unwrap();
        assert_eq!(present.len(), 1);
        assert_eq!(present[0].identity, "Alice");
    }

    #[test]
    fn test_csv_quotes_awkward_names() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = CsvDayStore::new(dir.path());
        let record = AttendanceRecord::new("Doe, \"Jay\"", at(4, 12, 0, 0), Method::Camera);
        store.append(&record).unwrap();

        let loaded = store.load_day(record.date).unwrap();
        assert_eq!(loaded, vec![record]);
    }

    #[test]
    fn test_csv_reads_legacy_two_column_rows() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = CsvDayStore::new(dir.path());
        let date = at(5, 0, 0, 0).date();
        fs::write(store.path_for(date), "Name,Time\nGouri,10:11:12\n").unwrap();

        let loaded = store.load_day(date).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].identity, "Gouri");
        assert_eq!(loaded[0].method, Method::Camera);
    }

    #[test]
    fn test_csv_missing_day_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = CsvDayStore::new(dir.path());
        assert!(store.load_day(at(6, 0, 0, 0).date()).unwrap().is_empty());
    }

    #[test]
    fn test_csv_malformed_row_reports_line() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = CsvDayStore::new(dir.path());
        let date = at(7, 0, 0, 0).date();
        fs::write(store.path_for(date), "Name,Time,Method\nAlice,not-a-time,camera\n").unwrap();

        match store.load_day(date) {
            Err(LedgerError::Malformed { line, .. }) => assert_eq!(line, 2),
            other => panic!("expected malformed error, got {other:?}"),
        }
    }

    #[test]
    fn test_csv_write_failure_propagates() {
        let dir = tempfile::tempdir().unwrap();
        // A regular file where the ledger directory should be.
        let blocker = dir.path().join("ledger");
        fs::write(&blocker, b"").unwrap();

        let ledger = Ledger::new(CsvDayStore::new(&blocker));
        let result = ledger.record("Alice", at(8, 9, 0, 0), Method::Camera);
        assert!(matches!(result, Err(LedgerError::Io { .. })));
    }

    #[test]
    fn test_csv_torn_final_row_does_not_block_the_day() {
        let dir = tempfile::tempdir().unwrap();
        let store = CsvDayStore::new(dir.path());
        let path = store.path_for(at(9, 0, 0, 0).date());
        fs::write(&path, "Name,Time,Method\nAlice,09:0").unwrap();

        let ledger = Ledger::new(store);
        assert!(ledger.present(at(9, 0, 0, 0).date()).unwrap().is_empty());
        let outcome = ledger.record("Bob", at(9, 9, 30, 0), Method::Camera).unwrap();
        assert!(outcome.is_recorded());

        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            "Name,Time,Method\nBob,09:30:00,camera\n"
        );

        // A restart reads the repaired file cleanly.
        let reopened = Ledger::new(CsvDayStore::new(dir.path()));
        let present = reopened.present(at(9, 0, 0, 0).date()).unwrap();
        assert_eq!(present.len(), 1);
        assert_eq!(present[0].identity, "Bob");
    }

    #[test]
    fn test_csv_torn_header_is_rewritten() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = CsvDayStore::new(dir.path());
        let record = AttendanceRecord::new("Alice", at(10, 8, 0, 0), Method::Camera);
        fs::write(store.path_for(record.date), "Name,Ti").unwrap();

        assert!(store.load_day(record.date).unwrap().is_empty());
        store.append(&record).unwrap();
        assert_eq!(store.load_day(record.date).unwrap(), vec![record.clone()]);
        assert_eq!(
            fs::read_to_string(store.path_for(record.date)).unwrap(),
            "Name,Time,Method\nAlice,08:00:00,camera\n"
        );
    }

    #[test]
    fn test_csv_complete_row_missing_newline_is_kept() {
        let dir = tempfile::tempdir().unwrap();
        let store = CsvDayStore::new(dir.path());
        let path = store.path_for(at(11, 0, 0, 0).date());
        fs::write(&path, "Name,Time,Method\nAlice,09:00:00,external").unwrap();

        let ledger = Ledger::new(store);
        let again = ledger.record("Alice", at(11, 9, 5, 0), Method::Camera).unwrap();
        assert_eq!(again, RecordOutcome::AlreadyPresent);
        ledger.record("Bob", at(11, 9, 10, 0), Method::Camera).unwrap();

        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            "Name,Time,Method\nAlice,09:00:00,external\nBob,09:10:00,camera\n"
        );
    }

    #[test]
    fn test_control_characters_rejected() {
        let dir = tempfile::tempdir().unwrap();
        {
            let ledger = Ledger::new(CsvDayStore::new(dir.path()));
            for name in ["Ann\nLee", "Ann\rLee", "Ann\u{0}Lee"] {
                assert!(matches!(
                    ledger.record(name, at(12, 9, 0, 0), Method::External),
                    Err(LedgerError::ControlCharacter(_))
                ));
            }
            ledger.record("Ann Lee", at(12, 9, 1, 0), Method::External).unwrap();
        }

        let ledger = Ledger::new(CsvDayStore::new(dir.path()));
        assert!(ledger.record("Bob", at(12, 9, 2, 0), Method::Camera).unwrap().is_recorded());
        let names: Vec<_> = ledger
            .present(at(12, 0, 0, 0).date())
            .unwrap()
            .into_iter()
            .map(|r| r.identity)
            .collect();
        assert_eq!(names, vec!["Ann Lee", "Bob"]);
    }
}
