//! Z level-book parser/signal CLI. See `spec.md` §4.5/§4.9/§6.4.
//!
//! Two modes: `--file <path> --out <csv>` parses one capture file start to
//! finish and exits; `--live --input-dir <dir> --out-dir <dir>` tails the
//! day's `{ymd}_Z.txt` (rolling over at midnight) forever, checkpointing to
//! `--state-dir`. Book/EMA state is always rebuilt from scratch on process
//! start — only the byte offset is persisted, matching
//! `original_source/parsers/parser_Z.c`'s `read_offset`/`write_offset`
//! (§4.4's note that resumed tailing does not carry book state across a
//! restart).
use anyhow::{Context, Result};
use cedro_md::book_z::{self, ZBook};
use cedro_md::csv_out::{join_row, CsvWriter};
use cedro_md::record::Record;
use cedro_md::signal_z::{ZSignalEngine, ZSignalParams};
use cedro_md::tailer::Tailer;
use clap::Parser;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Parser)]
#[command(version, about = "Z order-book reconstructor and imbalance signal engine")]
struct Args {
    /// Offline: parse this single capture file and exit.
    #[arg(long)]
    file: Option<PathBuf>,
    #[arg(long)]
    out: Option<PathBuf>,

    /// Live: tail `{ymd}_Z.txt` under `--input-dir`, rolling at midnight.
    #[arg(long)]
    live: bool,
    #[arg(long)]
    input_dir: Option<PathBuf>,
    #[arg(long)]
    out_dir: Option<PathBuf>,
    /// Template for the tailed file name; `{ymd}` is substituted.
    #[arg(long, default_value = "{ymd}_Z.txt")]
    input_template: String,
    #[arg(long)]
    state_dir: Option<PathBuf>,
    /// Exit at EOF instead of polling forever.
    #[arg(long)]
    batch: bool,
    /// Ignore any persisted offset and reprocess from byte 0.
    #[arg(long)]
    reset_state: bool,
    #[arg(long, default_value_t = 200)]
    poll_ms: u64,
    #[arg(long, default_value_t = 1)]
    ckpt_sec: u64,

    #[arg(long, default_value_t = 15)]
    depth: usize,
    #[arg(long, default_value_t = 5)]
    levels: usize,
    #[arg(long, default_value_t = 5)]
    ema_imb_period: u32,
    #[arg(long, default_value_t = 30)]
    ema_spread_period: u32,
    #[arg(long, default_value_t = 60)]
    zwin: usize,
    #[arg(long, default_value_t = 30)]
    min_warmup: usize,
    #[arg(long, default_value_t = 1.5)]
    score_th: f64,
    /// Z signal requires sign agreement by default; pass this to disable it.
    #[arg(long)]
    no_require_sign: bool,
    #[arg(long, default_value_t = 3)]
    persist: u32,
    #[arg(long, default_value_t = 30)]
    cooldown_sec: i64,
}

struct SymbolCtx {
    book: ZBook,
    engine: ZSignalEngine,
    n_a: u64,
    n_u: u64,
    n_d1: u64,
    n_d3: u64,
    n_e: u64,
    n_bad: u64,
}

fn signal_params(args: &Args) -> ZSignalParams {
    ZSignalParams {
        levels: args.levels,
        imb_ema_period: args.ema_imb_period,
        spread_ema_period: args.ema_spread_period,
        zwin: args.zwin,
        min_warmup: args.min_warmup,
        score_th: args.score_th,
        require_sign: !args.no_require_sign,
        persist_n: args.persist,
        cooldown_sec: args.cooldown_sec,
    }
}

const CSV_HEADER: &str = "write_ts,symbol,best_bid,best_ask,spread,mid,bid_qty_topn,ask_qty_topn,\
imb,imb_ema_5,spread_ema_30,mid_chg_3,z_imb,z_mid,score,entry,block_reason,\
msg_a,msg_u,msg_d1,msg_d3,msg_e,msg_bad";

fn write_row(w: &mut CsvWriter, write_ts: &str, symbol: &str, book: &ZBook, sym: &SymbolCtx, out: &cedro_md::signal_z::ZSignalOutput) -> Result<()> {
    let bid = book.best_bid();
    let ask = book.best_ask();
    let row = join_row(&[
        write_ts.to_string(),
        symbol.to_string(),
        bid.map(|b| b.price).unwrap_or(0.0).to_string(),
        ask.map(|a| a.price).unwrap_or(0.0).to_string(),
        out.spread.to_string(),
        out.mid.to_string(),
        bid.map(|b| b.qty).unwrap_or(0.0).to_string(),
        ask.map(|a| a.qty).unwrap_or(0.0).to_string(),
        out.imb.to_string(),
        out.imb_ema_5.to_string(),
        out.spread_ema_30.to_string(),
        out.mid_chg_3.to_string(),
        out.z_imb.to_string(),
        out.z_mid.to_string(),
        out.score.to_string(),
        out.entry.map(|d| d.as_str()).unwrap_or("").to_string(),
        out.block_reason.clone(),
        sym.n_a.to_string(),
        sym.n_u.to_string(),
        sym.n_d1.to_string(),
        sym.n_d3.to_string(),
        sym.n_e.to_string(),
        sym.n_bad.to_string(),
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

/// Apply one capture-file line (four-column `Record` encoding). Returns the
/// symbol touched, if the line carried a recognized `Z:` payload.
fn apply_capture_line(
    line: &str,
    symbols: &mut HashMap<String, SymbolCtx>,
    depth: usize,
    params: &ZSignalParams,
) -> Option<(String, String)> {
    let rec = Record::parse_line(line)?;
    let payload = rec.payload.strip_prefix("Z:")?;
    let (symbol, op_and_args) = payload.split_once(':')?;
    let ctx = symbols.entry(symbol.to_string()).or_insert_with(|| SymbolCtx {
        book: ZBook::new(depth),
        engine: ZSignalEngine::new(params.clone()),
        n_a: 0,
        n_u: 0,
        n_d1: 0,
        n_d3: 0,
        n_e: 0,
        n_bad: 0,
    });

    match book_z::apply_line(&mut ctx.book, op_and_args) {
        Ok(outcome) => {
            use cedro_md::book_z::ZOutcome::*;
            match outcome {
                Add => ctx.n_a += 1,
                Update => ctx.n_u += 1,
                DeleteOne => ctx.n_d1 += 1,
                Clear => {
                    ctx.n_d3 += 1;
                    if let Some(sec) = hhmmss_to_sec(&rec.write_ts) {
                        ctx.engine.on_clear(sec);
                    }
                }
                Heartbeat => ctx.n_e += 1,
                Bad => ctx.n_bad += 1,
                Ignored => {}
            }
        }
        Err(_) => ctx.n_bad += 1,
    }
    Some((symbol.to_string(), rec.write_ts))
}

fn run_offline(args: &Args) -> Result<()> {
    let file = args.file.as_ref().expect("checked by caller");
    let out = args.out.as_ref().context("--out required with --file")?;

    let params = signal_params(args);
    let mut writer = CsvWriter::open(out, CSV_HEADER)?;
    let mut symbols: HashMap<String, SymbolCtx> = HashMap::new();
    let mut last_sec: Option<i64> = None;

    let content = std::fs::read_to_string(file).with_context(|| format!("read {file:?}"))?;
    for line in content.lines() {
        if line.is_empty() {
            continue;
        }
        let Some((_sym, write_ts)) = apply_capture_line(line, &mut symbols, args.depth, &params) else { continue };
        let Some(sec) = hhmmss_to_sec(&write_ts) else { continue };
        if last_sec != Some(sec) {
            last_sec = Some(sec);
            for (symbol, ctx) in symbols.iter_mut() {
                let snap = ctx.engine.step(sec, &ctx.book);
                write_row(&mut writer, &write_ts, symbol, &ctx.book, ctx, &snap)?;
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
    let input_path = |ymd: &str| input_dir.join(args.input_template.replace("{ymd}", ymd));
    let ckpt_path = |ymd: &str| state_dir.join(format!("{ymd}_Z.offset"));

    let mut tailer = Tailer::new(
        input_path(&day),
        ckpt_path(&day),
        Duration::from_millis(args.poll_ms),
        Duration::from_secs(args.ckpt_sec),
    );
    if args.reset_state {
        std::fs::remove_file(ckpt_path(&day)).ok();
    }

    let params = signal_params(args);
    let mut out_path = out_dir.join(format!("{day}_ztop_signal_1s.csv"));
    let mut writer = CsvWriter::open(&out_path, CSV_HEADER)?;
    let mut symbols: HashMap<String, SymbolCtx> = HashMap::new();
    let mut last_sec: Option<i64> = None;

    loop {
        let today = cedro_md::config::ymd(cedro_md::config::now_local());
        if today != day {
            tracing::info!(from = %day, to = %today, "parser_z day rollover");
            day = today;
            tailer.switch_to(input_path(&day), ckpt_path(&day));
            out_path = out_dir.join(format!("{day}_ztop_signal_1s.csv"));
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
            let Some((_sym, write_ts)) = apply_capture_line(line, &mut symbols, args.depth, &params) else { continue };
            let Some(sec) = hhmmss_to_sec(&write_ts) else { continue };
            if last_sec != Some(sec) {
                last_sec = Some(sec);
                for (symbol, ctx) in symbols.iter_mut() {
                    let snap = ctx.engine.step(sec, &ctx.book);
                    write_row(&mut writer, &write_ts, symbol, &ctx.book, ctx, &snap)?;
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
