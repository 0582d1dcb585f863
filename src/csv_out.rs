//! CSV emission shared by every bar aggregator. See `spec.md` §6.3.
//!
//! One file per (date, parser, bar_width); a fixed header line written once
//! when the file is empty, then one row per `(symbol, bar)`. Fields are
//! comma-joined and CSV-quoted only when they contain a comma, quote, or
//! newline, matching the minimal quoting every `original_source/parsers/*.c`
//! emitter performs. Flushed after every row (sub-1-second cadence, per
//! §6.3) rather than buffered, since bar cadence is already ≥ 1 Hz.
use anyhow::{Context, Result};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

pub struct CsvWriter {
    file: File,
}

impl CsvWriter {
    /// Open (creating if needed) `path` for append, writing `header` only if
    /// the file is currently empty.
    pub fn open(path: &Path, header: &str) -> Result<CsvWriter> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).ok();
            }
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(path)
            .with_context(|| format!("open csv output {path:?}"))?;
        let is_empty = file.metadata().map(|m| m.len() == 0).unwrap_or(true);
        if is_empty {
            writeln!(file, "{header}")?;
            file.flush()?;
        }
        Ok(CsvWriter { file })
    }

    /// Write one already-joined row (no trailing newline) and flush.
    pub fn write_row(&mut self, row: &str) -> Result<()> {
        writeln!(self.file, "{row}")?;
        self.file.flush()?;
        Ok(())
    }
}

/// Quote `field` per RFC 4180 if it contains a comma, quote, or newline.
pub fn quote(field: &str) -> String {
    if field.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

/// Join already-stringified fields into one CSV row, quoting as needed.
pub fn join_row(fields: &[String]) -> String {
    fields.iter().map(|f| quote(f)).collect::<Vec<_>>().join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quoting_only_when_needed() {
        assert_eq!(quote("plain"), "plain");
        assert_eq!(quote("has,comma"), "\"has,comma\"");
        assert_eq!(quote("has\"quote"), "\"has\"\"quote\"");
        assert_eq!(quote("has\nnewline"), "\"has\nnewline\"");
    }

    #[test]
    fn header_written_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.csv");
        {
            let mut w = CsvWriter::open(&path, "a,b,c").unwrap();
            w.write_row("1,2,3").unwrap();
        }
        {
            let mut w = CsvWriter::open(&path, "a,b,c").unwrap();
            w.write_row("4,5,6").unwrap();
        }
        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines, vec!["a,b,c", "1,2,3", "4,5,6"]);
    }

    #[test]
    fn join_row_quotes_fields_with_commas() {
        let row = join_row(&["BUY".to_string(), "1,000".to_string(), "FLAT".to_string()]);
        assert_eq!(row, "BUY,\"1,000\",FLAT");
    }
}
