//! Converts a raw byte stream into complete logical [`Record`]s.
//!
//! See `SPEC_FULL.md` / `spec.md` §4.1. The framer owns a growing buffer;
//! every time a `\n` is observed it cuts a [`Record`] off the front of the
//! buffer. Trailing `\r` is trimmed and empty lines are dropped. TCP reads
//! may split a logical record across packets or combine several into one —
//! neither truncates nor merges a record, because the buffer is only ever
//! cut exactly at `\n` boundaries.
//!
//! The pending (not-yet-terminated) buffer must survive a reconnect within
//! the same session — the caller keeps the same `Framer` instance across
//! reconnects and only constructs a fresh one on day rollover.
use crate::config;
use crate::record::Record;
use std::time::Instant;

pub struct Framer {
    pending: String,
    last_record_at: Option<Instant>,
}

impl Default for Framer {
    fn default() -> Self {
        Self::new()
    }
}

impl Framer {
    pub fn new() -> Framer {
        Framer { pending: String::new(), last_record_at: None }
    }

    /// True if a partial (newline-less) record is buffered.
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Feed the bytes from a single transport read. `packet_bytes` is
    /// recorded on every record cut from this chunk (a read that yields
    /// several newline-terminated lines reports the same packet size on
    /// each of them, per §4.1/§3).
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Record> {
        let packet_bytes = chunk.len();
        self.pending.push_str(&String::from_utf8_lossy(chunk));

        let mut out = Vec::new();
        while let Some(nl) = self.pending.find('\n') {
            let raw: String = self.pending.drain(..=nl).collect();
            let line = raw.trim_end_matches(['\r', '\n']);
            if line.is_empty() {
                continue;
            }

            let now = Instant::now();
            let delta_ms = match self.last_record_at {
                Some(prev) => now.duration_since(prev).as_millis() as u64,
                None => 0,
            };
            self.last_record_at = Some(now);

            out.push(Record {
                write_ts: config::write_ts(config::now_local()),
                packet_bytes,
                delta_ms,
                payload: line.to_string(),
            });
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_chunk_multiple_records() {
        let mut f = Framer::new();
        let recs = f.feed(b"B:X:A:0\nZ:Y:A:0\n");
        assert_eq!(recs.len(), 2);
        assert_eq!(recs[0].payload, "B:X:A:0");
        assert_eq!(recs[1].payload, "Z:Y:A:0");
        assert!(!f.has_pending());
    }

    #[test]
    fn record_split_across_reads() {
        let mut f = Framer::new();
        let recs = f.feed(b"B:X:A:");
        assert!(recs.is_empty());
        assert!(f.has_pending());
        let recs = f.feed(b"0\n");
        assert_eq!(recs.len(), 1);
        assert_eq!(recs[0].payload, "B:X:A:0");
    }

    #[test]
    fn trailing_cr_trimmed_and_empty_lines_dropped() {
        let mut f = Framer::new();
        let recs = f.feed(b"B:X:A:0\r\n\r\nZ:Y:A:0\r\n");
        assert_eq!(recs.len(), 2);
        assert_eq!(recs[0].payload, "B:X:A:0");
        assert_eq!(recs[1].payload, "Z:Y:A:0");
    }

    #[test]
    fn packet_bytes_shared_within_a_chunk() {
        let mut f = Framer::new();
        let chunk = b"B:X:A:0\nZ:Y:A:0\n";
        let recs = f.feed(chunk);
        assert_eq!(recs[0].packet_bytes, chunk.len());
        assert_eq!(recs[1].packet_bytes, chunk.len());
    }
}
