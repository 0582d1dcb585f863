//! Follows an append-only capture file across rotations and truncations,
//! resuming from a checkpointed byte offset. See `spec.md` §4.4.
//!
//! One `Tailer` instance per record class (`B`/`V`/`T`/`Z`). Checkpointing is
//! deliberately best-effort: per `spec.md` §5, the offset file is a plain
//! write (no write-then-rename), because replaying a few seconds of data
//! after a crash is harmless — the tail position is monotonic and downstream
//! state reconstruction tolerates it.
use anyhow::{Context, Result};
use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;
use std::time::{Duration, Instant};

pub struct Tailer {
    path: PathBuf,
    ckpt_path: PathBuf,
    poll_interval: Duration,
    ckpt_interval: Duration,
    file: Option<File>,
    consumed_offset: u64,
    pending: String,
    last_len: u64,
    last_ckpt_at: Option<Instant>,
    last_ckpt_offset: u64,
}

impl Tailer {
    pub fn new(path: PathBuf, ckpt_path: PathBuf, poll_interval: Duration, ckpt_interval: Duration) -> Tailer {
        Tailer {
            path,
            ckpt_path,
            poll_interval,
            ckpt_interval,
            file: None,
            consumed_offset: 0,
            pending: String::new(),
            last_len: 0,
            last_ckpt_at: None,
            last_ckpt_offset: 0,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    fn read_checkpoint(ckpt_path: &std::path::Path) -> u64 {
        fs::read_to_string(ckpt_path)
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(0)
    }

    /// Open `self.path`, seeking to the checkpointed offset (or to
    /// end-of-file on fresh `live` starts / detected truncation).
    fn open(&mut self, start_at_end: bool, reset_state: bool) -> Result<()> {
        let mut f = File::open(&self.path).with_context(|| format!("open capture file {:?}", self.path))?;
        let len = f.metadata()?.len();

        let mut offset = if reset_state { 0 } else { Self::read_checkpoint(&self.ckpt_path) };
        if start_at_end && offset == 0 {
            offset = len;
        }
        offset = offset.min(len);
        f.seek(SeekFrom::Start(offset))?;

        self.file = Some(f);
        self.consumed_offset = offset;
        self.pending.clear();
        self.last_len = len;
        Ok(())
    }

    /// Current checkpoint-eligible byte offset (end of the last line
    /// returned by [`poll`](Self::poll), plus any not-yet-terminated bytes
    /// already buffered in `pending`).
    pub fn offset(&self) -> u64 {
        self.consumed_offset
    }

    /// Read whatever complete lines are available right now. Returns an
    /// empty vector (never blocks/sleeps itself — the caller decides whether
    /// to sleep `poll_interval` before calling again) when nothing new has
    /// been appended, the file doesn't exist yet, or a truncation was just
    /// handled.
    pub fn poll(&mut self, start_at_end_on_fresh_open: bool) -> Result<Vec<String>> {
        if self.file.is_none() {
            if !self.path.exists() {
                return Ok(vec![]);
            }
            self.open(start_at_end_on_fresh_open, false)?;
        }

        let len = fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0);
        if len < self.last_len {
            tracing::warn!(path = ?self.path, "tailer detected truncation, reopening from end");
            self.file = None;
            self.open(true, false)?;
            return Ok(vec![]);
        }
        self.last_len = len;

        let read_pos = self.consumed_offset + self.pending.len() as u64;
        if read_pos >= len {
            return Ok(vec![]);
        }

        let f = self.file.as_mut().expect("opened above");
        f.seek(SeekFrom::Start(read_pos))?;
        let mut chunk = Vec::new();
        f.read_to_end(&mut chunk)?;
        if chunk.is_empty() {
            return Ok(vec![]);
        }
        self.pending.push_str(&String::from_utf8_lossy(&chunk));

        let mut out = Vec::new();
        while let Some(nl) = self.pending.find('\n') {
            let raw: String = self.pending.drain(..=nl).collect();
            self.consumed_offset += raw.len() as u64;
            let line = raw.trim_end_matches(['\r', '\n']);
            if !line.is_empty() {
                out.push(line.to_string());
            }
        }

        self.maybe_checkpoint(false);
        Ok(out)
    }

    /// Persist `consumed_offset` if `ckpt_interval` has elapsed since the
    /// last write, or unconditionally when `force` (clean exit / day
    /// rollover).
    pub fn maybe_checkpoint(&mut self, force: bool) {
        let due = force
            || match self.last_ckpt_at {
                Some(t) => t.elapsed() >= self.ckpt_interval,
                None => true,
            };
        if !due || self.consumed_offset == self.last_ckpt_offset {
            return;
        }
        if let Err(e) = fs::write(&self.ckpt_path, self.consumed_offset.to_string()) {
            tracing::error!(path = ?self.ckpt_path, error = %e, "checkpoint write failed, will retry on next interval");
            return;
        }
        self.last_ckpt_at = Some(Instant::now());
        self.last_ckpt_offset = self.consumed_offset;
    }

    /// Switch to tailing a new path (day rollover): force-checkpoints the
    /// current file, then resets to tail `new_path`/`new_ckpt_path` from the
    /// start on the next [`poll`](Self::poll).
    pub fn switch_to(&mut self, new_path: PathBuf, new_ckpt_path: PathBuf) {
        self.maybe_checkpoint(true);
        self.path = new_path;
        self.ckpt_path = new_ckpt_path;
        self.file = None;
        self.pending.clear();
        self.consumed_offset = 0;
        self.last_len = 0;
        self.last_ckpt_at = None;
        self.last_ckpt_offset = 0;
    }
}
