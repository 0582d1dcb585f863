//! Offline rebuild mode: splits a single `<date>_raw_data.txt` back into
//! `<date>_{B,V,T,Z}.txt` plus `<date>_orphans.txt`. See `spec.md` §6.5.
//!
//! A payload not beginning with a known class prefix is a TCP-split
//! continuation of whatever record is currently pending; concatenated onto
//! it rather than treated as a new record. A continuation with no pending
//! record (stray handshake bytes, truncated capture) is routed to orphans,
//! grounded on `original_source/leitorwebsocket/leitorwebsocket_dualmode.cpp`'s
//! `rebuild_from_raw`.
use anyhow::{Context, Result};
use cedro_md::record::{ClassTag, Record};
use clap::Parser;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(version, about = "Rebuild per-class capture files from a raw_data.txt")]
struct Args {
    #[arg(long)]
    raw_file: PathBuf,

    #[arg(long)]
    date: String,

    #[arg(long, default_value = ".")]
    out_dir: PathBuf,

    /// Truncate existing output files instead of appending.
    #[arg(long)]
    overwrite: bool,
}

struct PendingRecord {
    write_ts: String,
    packet_bytes: usize,
    delta_ms: u64,
    payload: String,
}

fn open_out(path: &std::path::Path, overwrite: bool) -> Result<File> {
    OpenOptions::new()
        .create(true)
        .append(!overwrite)
        .truncate(overwrite)
        .write(overwrite)
        .open(path)
        .with_context(|| format!("open output file {path:?}"))
}

fn starts_with_class_prefix(payload: &str) -> bool {
    !matches!(ClassTag::of(payload), ClassTag::Other)
}

fn main() -> Result<()> {
    cedro_md::telemetry::init();
    let args = Args::parse();
    std::fs::create_dir_all(&args.out_dir)?;

    let mut b_out = open_out(&args.out_dir.join(format!("{}_B.txt", args.date)), args.overwrite)?;
    let mut v_out = open_out(&args.out_dir.join(format!("{}_V.txt", args.date)), args.overwrite)?;
    let mut t_out = open_out(&args.out_dir.join(format!("{}_T.txt", args.date)), args.overwrite)?;
    let mut z_out = open_out(&args.out_dir.join(format!("{}_Z.txt", args.date)), args.overwrite)?;
    let mut orphans_out = open_out(&args.out_dir.join(format!("{}_orphans.txt", args.date)), args.overwrite)?;

    let raw = File::open(&args.raw_file).with_context(|| format!("open raw file {:?}", args.raw_file))?;
    let reader = BufReader::new(raw);

    let mut pending: Option<PendingRecord> = None;
    let (mut n_b, mut n_v, mut n_t, mut n_z, mut n_orphans, mut n_lines) = (0u64, 0u64, 0u64, 0u64, 0u64, 0u64);

    let mut flush_pending = |pending: &mut Option<PendingRecord>| -> Result<()> {
        let Some(p) = pending.take() else { return Ok(()) };
        let rec = Record { write_ts: p.write_ts, packet_bytes: p.packet_bytes, delta_ms: p.delta_ms, payload: p.payload };
        let line = rec.to_line();
        match rec.class() {
            ClassTag::B => {
                writeln!(b_out, "{line}")?;
                n_b += 1;
            }
            ClassTag::V => {
                writeln!(v_out, "{line}")?;
                n_v += 1;
            }
            ClassTag::T => {
                writeln!(t_out, "{line}")?;
                n_t += 1;
            }
            ClassTag::Z => {
                writeln!(z_out, "{line}")?;
                n_z += 1;
            }
            ClassTag::Other => {}
        }
        Ok(())
    };

    for line in reader.lines() {
        let line = line?;
        n_lines += 1;
        if line.is_empty() {
            continue;
        }

        let Some(rec) = Record::parse_line(&line) else {
            n_orphans += 1;
            writeln!(orphans_out, "{line}")?;
            continue;
        };
        if rec.payload.is_empty() {
            continue;
        }

        if starts_with_class_prefix(&rec.payload) {
            flush_pending(&mut pending)?;
            pending = Some(PendingRecord {
                write_ts: rec.write_ts,
                packet_bytes: rec.packet_bytes,
                delta_ms: rec.delta_ms,
                payload: rec.payload,
            });
        } else if let Some(p) = pending.as_mut() {
            p.payload.push_str(&rec.payload);
        } else {
            n_orphans += 1;
            writeln!(orphans_out, "{line}")?;
        }
    }
    flush_pending(&mut pending)?;

    b_out.flush()?;
    v_out.flush()?;
    t_out.flush()?;
    z_out.flush()?;
    orphans_out.flush()?;

    tracing::info!(
        raw_file = ?args.raw_file,
        date = %args.date,
        lines = n_lines,
        b = n_b,
        v = n_v,
        t = n_t,
        z = n_z,
        orphans = n_orphans,
        "rebuild finished"
    );
    Ok(())
}
