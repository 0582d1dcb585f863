//! B order-granularity book parser CLI. See `spec.md` §4.6/§6.4.
//!
//! Unlike the Z/T parsers, §4.6 defines no dedicated signal engine — the
//! emitted row is the reconstructed top-of-book plus the running OFI
//! accumulator, sampled once per wall-clock second (the same snapshot
//! cadence as the Z parser, for a comparable CSV shape).
use anyhow::{Context, Result};
use cedro_md::book_b::{self, BBook};
use cedro_md::csv_out::{join_row, CsvWriter};
use cedro_md::record::Record;
use cedro_md::tailer::Tailer;
use clap::Parser;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Parser)]
#[command(version, about = "B order-granularity book reconstructor with OFI accumulation")]
struct Args {
    #[arg(long)]
    file: Option<PathBuf>,
    #[arg(long)]
    out: Option<PathBuf>,

    #[arg(long)]
    live: bool,
    #[arg(long)]
    input_dir: Option<PathBuf>,
    #[arg(long)]
    out_dir: Option<PathBuf>,
    #[arg(long)]
    state_dir: Option<PathBuf>,
    #[arg(long)]
    batch: bool,
    #[arg(long, default_value_t = 200)]
    poll_ms: u64,
    #[arg(long, default_value_t = 1)]
    ckpt_sec: u64,

    #[arg(long, default_value_t = 2000)]
    book_cap: usize,
    /// OFI magnitude threshold above which the row's `ofi_flag` column fires.
    #[arg(long, default_value_t = 10.0)]
    ofi_th: f64,
}

struct SymbolCtx {
    book: BBook,
    n_a: u64,
    n_u: u64,
    n_d1: u64,
    n_d2: u64,
    n_d3: u64,
    n_bad: u64,
}

const CSV_HEADER: &str = "write_ts,symbol,best_bid,best_ask,spread,mid,bid_qty0,ask_qty0,\
ofi_accum,ofi_flag,msg_a,msg_u,msg_d1,msg_d2,msg_d3,msg_bad";

fn write_row(w: &mut CsvWriter, write_ts: &str, symbol: &str, ctx: &SymbolCtx, ofi_th: f64) -> Result<()> {
    let bid = ctx.book.bids.best();
    let ask = ctx.book.asks.best();
    let (mid, spread) = match (bid, ask) {
        (Some(b), Some(a)) => ((b.price + a.price) / 2.0, a.price - b.price),
        _ => (0.0, 0.0),
    };
    let row = join_row(&[
        write_ts.to_string(),
        symbol.to_string(),
        bid.map(|b| b.price).unwrap_or(0.0).to_string(),
        ask.map(|a| a.price).unwrap_or(0.0).to_string(),
        spread.to_string(),
        mid.to_string(),
        bid.map(|b| b.qty).unwrap_or(0.0).to_string(),
        ask.map(|a| a.qty).unwrap_or(0.0).to_string(),
        ctx.book.ofi_accum.to_string(),
        (ctx.book.ofi_accum.abs() >= ofi_th).to_string(),
        ctx.n_a.to_string(),
        ctx.n_u.to_string(),
        ctx.n_d1.to_string(),
        ctx.n_d2.to_string(),
        ctx.n_d3.to_string(),
        ctx.n_bad.to_string(),
    ]);
    w.write_row(&row)
}

fn hhmmss_to_sec(write_ts: &str) -> Option<i64> {
    let (_, hms) = write_ts.split_once('_')?;
    if hms.len() < 6 {
        return None;
    }
    let hh: i64 = hms[0..2].parse().ok()?;
    let mm: i64 = hms[2..4].parse().ok()?;
    let ss: i64 = hms[4..6].parse().ok()?;
    Some(hh * 3600 + mm * 60 + ss)
}

fn apply_capture_line(line: &str, symbols: &mut HashMap<String, SymbolCtx>, book_cap: usize) -> Option<String> {
    let rec = Record::parse_line(line)?;
    let payload = rec.payload.strip_prefix("B:")?;
    let (symbol, op_and_args) = payload.split_once(':')?;
    let ctx = symbols.entry(symbol.to_string()).or_insert_with(|| SymbolCtx {
        book: BBook::new(book_cap),
        n_a: 0,
        n_u: 0,
        n_d1: 0,
        n_d2: 0,
        n_d3: 0,
        n_bad: 0,
    });

    match book_b::apply_line(&mut ctx.book, op_and_args) {
        Ok(outcome) => {
            use cedro_md::book_b::BOutcome::*;
            match outcome {
                Add => ctx.n_a += 1,
                Update => ctx.n_u += 1,
                DeleteOne => ctx.n_d1 += 1,
                DeleteBestUpTo => ctx.n_d2 += 1,
                Clear => ctx.n_d3 += 1,
                Bad => ctx.n_bad += 1,
                Ignored => {}
            }
        }
        Err(_) => ctx.n_bad += 1,
    }
    Some(rec.write_ts)
}

fn run_offline(args: &Args) -> Result<()> {
    let file = args.file.as_ref().expect("checked by caller");
    let out = args.out.as_ref().context("--out required with --file")?;

    let mut writer = CsvWriter::open(out, CSV_HEADER)?;
    let mut symbols: HashMap<String, SymbolCtx> = HashMap::new();
    let mut last_sec: Option<i64> = None;

    let content = std::fs::read_to_string(file).with_context(|| format!("read {file:?}"))?;
    for line in content.lines() {
        if line.is_empty() {
            continue;
        }
        let Some(write_ts) = apply_capture_line(line, &mut symbols, args.book_cap) else { continue };
        let Some(sec) = hhmmss_to_sec(&write_ts) else { continue };
        if last_sec != Some(sec) {
            last_sec = Some(sec);
            for (symbol, ctx) in symbols.iter() {
                write_row(&mut writer, &write_ts, symbol, ctx, args.ofi_th)?;
            }
        }
    }
    Ok(())
}

fn run_live(args: &Args) -> Result<()> {
    let input_dir = args.input_dir.as_ref().context("--input-dir required with --live")?;
    let out_dir = args.out_dir.as_ref().context("--out-dir required with --live")?;
    let state_dir = args.state_dir.as_ref().context("--state-dir required with --live")?;
    std::fs::create_dir_all(out_dir)?;
    std::fs::create_dir_all(state_dir)?;

    let mut day = cedro_md::config::ymd(cedro_md::config::now_local());
    let input_path = |ymd: &str| input_dir.join(format!("{ymd}_B.txt"));
    let ckpt_path = |ymd: &str| state_dir.join(format!("{ymd}_B.offset"));

    let mut tailer = Tailer::new(input_path(&day), ckpt_path(&day), Duration::from_millis(args.poll_ms), Duration::from_secs(args.ckpt_sec));
    let mut out_path = out_dir.join(format!("{day}_btop_ofi_1s.csv"));
    let mut writer = CsvWriter::open(&out_path, CSV_HEADER)?;
    let mut symbols: HashMap<String, SymbolCtx> = HashMap::new();
    let mut last_sec: Option<i64> = None;

    loop {
        let today = cedro_md::config::ymd(cedro_md::config::now_local());
        if today != day {
            tracing::info!(from = %day, to = %today, "parser_b day rollover");
            day = today;
            tailer.switch_to(input_path(&day), ckpt_path(&day));
            out_path = out_dir.join(format!("{day}_btop_ofi_1s.csv"));
            writer = CsvWriter::open(&out_path, CSV_HEADER)?;
            symbols.clear();
            last_sec = None;
        }

        let lines = tailer.poll(true)?;
        if lines.is_empty() {
            if args.batch {
                tailer.maybe_checkpoint(true);
                return Ok(());
            }
            std::thread::sleep(tailer.poll_interval());
            continue;
        }
        for line in &lines {
            let Some(write_ts) = apply_capture_line(line, &mut symbols, args.book_cap) else { continue };
            let Some(sec) = hhmmss_to_sec(&write_ts) else { continue };
            if last_sec != Some(sec) {
                last_sec = Some(sec);
                for (symbol, ctx) in symbols.iter() {
                    write_row(&mut writer, &write_ts, symbol, ctx, args.ofi_th)?;
                }
            }
        }
    }
}

fn main() -> Result<()> {
    cedro_md::telemetry::init();
    let args = Args::parse();

    if args.live {
        run_live(&args)
    } else if args.file.is_some() {
        run_offline(&args)
    } else {
        anyhow::bail!("either --file or --live must be given");
    }
}
