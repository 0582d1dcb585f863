//! Durable on-disk schema for captures and replay.
//!
//! Every line written to a capture file (`<date>_raw_data.txt` or one of the
//! per-class `<date>_{B|V|T|Z}.txt` files) has the same four-column shape:
//!
//! ```text
//! YYYYMMDD_HHMMSS,<packet_bytes>,<delta_ms>,<payload>
//! ```
//!
//! `payload` is the original protocol line as received from the feed,
//! beginning with a single-character class tag and `:`. This module owns the
//! [`Record`] type plus the class-tag/framed-line parsing shared by the
//! demultiplexer, the tailers, and the rebuild tool.
use std::fmt;

/// Upstream message class, derived from the payload's leading tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClassTag {
    B,
    V,
    T,
    Z,
    Other,
}

impl ClassTag {
    /// Classify a payload by its leading `<tag>:` prefix.
    pub fn of(payload: &str) -> ClassTag {
        let mut chars = payload.chars();
        match (chars.next(), chars.next()) {
            (Some('B'), Some(':')) => ClassTag::B,
            (Some('V'), Some(':')) => ClassTag::V,
            (Some('T'), Some(':')) => ClassTag::T,
            (Some('Z'), Some(':')) => ClassTag::Z,
            _ => ClassTag::Other,
        }
    }

    /// File-name suffix used for the per-class capture file, if any.
    pub fn file_suffix(self) -> Option<&'static str> {
        match self {
            ClassTag::B => Some("B"),
            ClassTag::V => Some("V"),
            ClassTag::T => Some("T"),
            ClassTag::Z => Some("Z"),
            ClassTag::Other => None,
        }
    }
}

impl fmt::Display for ClassTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ClassTag::B => "B",
            ClassTag::V => "V",
            ClassTag::T => "T",
            ClassTag::Z => "Z",
            ClassTag::Other => "Other",
        };
        f.write_str(s)
    }
}

/// A capture-timestamped logical line from the feed.
///
/// Created by the framer when a newline is observed; consumed by the
/// demultiplexer and, downstream, by the tailers. Never mutated once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Local wall-clock time at flush, `YYYYMMDD_HHMMSS`, exchange-local.
    pub write_ts: String,
    /// Size in bytes of the containing TCP read.
    pub packet_bytes: usize,
    /// Milliseconds since the previous record on this connection.
    pub delta_ms: u64,
    /// The original protocol line, beginning with `<tag>:`.
    pub payload: String,
}

impl Record {
    pub fn class(&self) -> ClassTag {
        ClassTag::of(&self.payload)
    }

    /// Render the four-column capture-file line (no trailing newline).
    pub fn to_line(&self) -> String {
        format!("{},{},{},{}", self.write_ts, self.packet_bytes, self.delta_ms, self.payload)
    }

    /// Parse a capture-file line of the form
    /// `YYYYMMDD_HHMMSS,<packet_bytes>,<delta_ms>,<payload>` back into a
    /// [`Record`]. The payload itself may contain commas, so only the first
    /// three are treated as field separators.
    pub fn parse_line(line: &str) -> Option<Record> {
        let mut parts = line.splitn(4, ',');
        let write_ts = parts.next()?.to_string();
        let packet_bytes: usize = parts.next()?.parse().ok()?;
        let delta_ms: u64 = parts.next()?.parse().ok()?;
        let payload = parts.next()?.to_string();
        Some(Record { write_ts, packet_bytes, delta_ms, payload })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_known_tags() {
        assert_eq!(ClassTag::of("B:PETR4:A:0"), ClassTag::B);
        assert_eq!(ClassTag::of("V:PETR4:A:..."), ClassTag::V);
        assert_eq!(ClassTag::of("T:PETR4:0:2:10!"), ClassTag::T);
        assert_eq!(ClassTag::of("Z:PETR4:A:0"), ClassTag::Z);
        assert_eq!(ClassTag::of("junk"), ClassTag::Other);
        assert_eq!(ClassTag::of(""), ClassTag::Other);
    }

    #[test]
    fn roundtrip_line() {
        let r = Record {
            write_ts: "20260727_093001".into(),
            packet_bytes: 128,
            delta_ms: 42,
            payload: "Z:PETR4:A:0:A:10.0:5:1".into(),
        };
        let line = r.to_line();
        assert_eq!(line, "20260727_093001,128,42,Z:PETR4:A:0:A:10.0:5:1");
        let back = Record::parse_line(&line).unwrap();
        assert_eq!(back, r);
    }

    #[test]
    fn parse_line_rejects_short_rows() {
        assert!(Record::parse_line("20260727_093001,128").is_none());
        assert!(Record::parse_line("not,a,number,Z:X").is_none());
    }

    #[test]
    fn payload_commas_preserved() {
        let line = "20260727_093001,10,0,T:X:0:2:1,000.5!";
        let r = Record::parse_line(line).unwrap();
        assert_eq!(r.payload, "T:X:0:2:1,000.5!");
    }
}
