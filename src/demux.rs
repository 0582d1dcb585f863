//! Classifies framed records by leading tag and fans them out to per-day,
//! per-class capture files. See `spec.md` §4.2.
//!
//! Every record is appended to `<date>_raw_data.txt`; recognized classes
//! (`B`, `V`, `T`, `Z`) are additionally appended to `<date>_{class}.txt`.
//! Writes are batched in memory and flushed on whichever comes first: the
//! batch reaching `BATCH_THRESHOLD` records, or `FLUSH_INTERVAL` elapsing.
//! Day rollover flushes and closes the current files before opening the
//! next day's, so a reader never observes a write split across two days.
use crate::config;
use crate::record::{ClassTag, Record};
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::time::{Duration, Instant};

pub const BATCH_THRESHOLD: usize = 10;
pub const FLUSH_INTERVAL: Duration = Duration::from_secs(5);

struct ClassFile {
    path: PathBuf,
    file: Option<File>,
    pending: Vec<String>,
}

impl ClassFile {
    fn new(path: PathBuf) -> ClassFile {
        ClassFile { path, file: None, pending: Vec::new() }
    }

    fn ensure_open(&mut self) -> Result<()> {
        if self.file.is_some() {
            return Ok(());
        }
        let f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("open capture file {:?}", self.path))?;
        self.file = Some(f);
        Ok(())
    }

    fn push(&mut self, line: &str) {
        self.pending.push(line.to_string());
    }

    /// Flush pending lines. On write failure, reopen the handle once and
    /// retry; if still failing, keep the batch buffered (at-least-once
    /// persistence: nothing already written is lost, and the retained batch
    /// is retried on the next flush) and surface the error for logging.
    fn flush(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        self.ensure_open()?;
        match self.write_batch() {
            Ok(()) => {
                self.pending.clear();
                Ok(())
            }
            Err(e) => {
                tracing::warn!(path = ?self.path, error = %e, "capture write failed, reopening once");
                self.file = None;
                self.ensure_open()?;
                match self.write_batch() {
                    Ok(()) => {
                        self.pending.clear();
                        Ok(())
                    }
                    Err(e2) => {
                        tracing::error!(path = ?self.path, error = %e2, "capture write failed after reopen, batch retained");
                        Err(e2)
                    }
                }
            }
        }
    }

    fn write_batch(&mut self) -> Result<()> {
        let f = self.file.as_mut().expect("ensure_open called");
        for line in &self.pending {
            writeln!(f, "{line}")?;
        }
        f.flush()?;
        Ok(())
    }
}

pub struct Demultiplexer {
    out_dir: PathBuf,
    day: String,
    raw: ClassFile,
    classes: HashMap<&'static str, ClassFile>,
    last_flush: Instant,
}

impl Demultiplexer {
    pub fn new(out_dir: PathBuf) -> Demultiplexer {
        let day = config::ymd(config::now_local());
        let (raw, classes) = Self::open_for_day(&out_dir, &day);
        Demultiplexer { out_dir, day, raw, classes, last_flush: Instant::now() }
    }

    fn open_for_day(out_dir: &std::path::Path, day: &str) -> (ClassFile, HashMap<&'static str, ClassFile>) {
        let raw = ClassFile::new(out_dir.join(format!("{day}_raw_data.txt")));
        let mut classes = HashMap::new();
        for suffix in ["B", "V", "T", "Z"] {
            classes.insert(suffix, ClassFile::new(out_dir.join(format!("{day}_{suffix}.txt"))));
        }
        (raw, classes)
    }

    /// Append one record, rolling over to a fresh day's files first if the
    /// wall clock has advanced to a new date.
    pub fn push(&mut self, rec: &Record) -> Result<()> {
        self.maybe_rollover()?;

        let line = rec.to_line();
        self.raw.push(&line);
        if let Some(suffix) = rec.class().file_suffix() {
            self.classes.get_mut(suffix).expect("all suffixes preallocated").push(&line);
        }

        if self.raw.pending.len() >= BATCH_THRESHOLD || self.last_flush.elapsed() >= FLUSH_INTERVAL {
            self.flush()?;
        }
        Ok(())
    }

    fn maybe_rollover(&mut self) -> Result<()> {
        let today = config::ymd(config::now_local());
        if today == self.day {
            return Ok(());
        }
        tracing::info!(from = %self.day, to = %today, "demultiplexer day rollover");
        self.flush()?;
        let (raw, classes) = Self::open_for_day(&self.out_dir, &today);
        self.raw = raw;
        self.classes = classes;
        self.day = today;
        Ok(())
    }

    /// Force-flush every pending batch (raw plus all per-class files).
    pub fn flush(&mut self) -> Result<()> {
        self.raw.flush()?;
        for cf in self.classes.values_mut() {
            cf.flush()?;
        }
        self.last_flush = Instant::now();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn rec(payload: &str) -> Record {
        Record {
            write_ts: "20260727_093001".into(),
            packet_bytes: 10,
            delta_ms: 0,
            payload: payload.into(),
        }
    }

    #[test]
    fn routes_by_class_and_flushes_at_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let mut dx = Demultiplexer::new(dir.path().to_path_buf());
        let day = &dx.day.clone();

        for i in 0..BATCH_THRESHOLD {
            dx.push(&rec(&format!("Z:X:A:{i}"))).unwrap();
        }

        let raw = fs::read_to_string(dir.path().join(format!("{day}_raw_data.txt"))).unwrap();
        assert_eq!(raw.lines().count(), BATCH_THRESHOLD);
        let z = fs::read_to_string(dir.path().join(format!("{day}_Z.txt"))).unwrap();
        assert_eq!(z.lines().count(), BATCH_THRESHOLD);
        assert!(!dir.path().join(format!("{day}_B.txt")).exists() || fs::read_to_string(dir.path().join(format!("{day}_B.txt"))).unwrap().is_empty());
    }

    #[test]
    fn unrecognized_class_only_goes_to_raw() {
        let dir = tempfile::tempdir().unwrap();
        let mut dx = Demultiplexer::new(dir.path().to_path_buf());
        for i in 0..BATCH_THRESHOLD {
            dx.push(&rec(&format!("junk line {i}"))).unwrap();
        }
        dx.flush().unwrap();
        let day = &dx.day.clone();
        let raw = fs::read_to_string(dir.path().join(format!("{day}_raw_data.txt"))).unwrap();
        assert_eq!(raw.lines().count(), BATCH_THRESHOLD);
    }

    #[test]
    fn manual_flush_below_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let mut dx = Demultiplexer::new(dir.path().to_path_buf());
        dx.push(&rec("B:X:A:0")).unwrap();
        dx.flush().unwrap();
        let day = &dx.day.clone();
        let raw = fs::read_to_string(dir.path().join(format!("{day}_raw_data.txt"))).unwrap();
        assert_eq!(raw.lines().count(), 1);
    }
}
