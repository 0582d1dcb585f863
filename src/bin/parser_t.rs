//! T ticker-field aggregator CLI. See `spec.md` §4.7/§6.4, `SPEC_FULL.md` §2
//! for the supplemented `--session` window flag.
use anyhow::{Context, Result};
use cedro_md::agg_t::{self, TBarRow, TParams};
use cedro_md::csv_out::{join_row, CsvWriter};
use cedro_md::record::Record;
use cedro_md::tailer::Tailer;
use clap::Parser;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Parser)]
#[command(version, about = "Ticker-field bar aggregator with tick-direction/imbalance scoring")]
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

    #[arg(long, default_value_t = 1)]
    bar_sec: i64,
    #[arg(long, default_value_t = 2)]
    tickdir_th: i64,
    #[arg(long, default_value_t = 0.2)]
    imb_th: f64,
    #[arg(long, default_value_t = 0.01)]
    micro_th: f64,
    #[arg(long, default_value_t = 1.5)]
    enter_th: f64,
    #[arg(long, default_value_t = 1.0)]
    keep_th: f64,
    #[arg(long, default_value_t = 0.5)]
    max_spread: f64,
    #[arg(long)]
    require_trade: bool,
    #[arg(long, default_value_t = 0.0)]
    min_vol: f64,

    /// Bound processed/emitted bars to `[start, end)`, `HH:MM:SS` local time.
    /// Offline mode only; a live tail has no fixed replay window to bound.
    #[arg(long, num_args = 2, value_names = ["START", "END"])]
    session: Option<Vec<String>>,
}

fn params(args: &Args) -> TParams {
    TParams {
        bar_sec: args.bar_sec,
        tickdir_th: args.tickdir_th,
        imb_th: args.imb_th,
        micro_th: args.micro_th,
        enter_th: args.enter_th,
        keep_th: args.keep_th,
        max_spread: args.max_spread,
        require_trade: args.require_trade,
        min_vol: args.min_vol,
    }
}

fn hhmmss_to_sec(s: &str) -> Option<i64> {
    let parts: Vec<&str> = s.splitn(3, ':').collect();
    if parts.len() != 3 {
        return None;
    }
    let hh: i64 = parts[0].parse().ok()?;
    let mm: i64 = parts[1].parse().ok()?;
    let ss: i64 = parts[2].parse().ok()?;
    Some(hh * 3600 + mm * 60 + ss)
}

fn write_ts_to_sec(write_ts: &str) -> Option<i64> {
    let (_, hms) = write_ts.split_once('_')?;
    if hms.len() < 6 {
        return None;
    }
    let hh: i64 = hms[0..2].parse().ok()?;
    let mm: i64 = hms[2..4].parse().ok()?;
    let ss: i64 = hms[4..6].parse().ok()?;
    Some(hh * 3600 + mm * 60 + ss)
}

const CSV_HEADER: &str = "write_ts,symbol,bar_start_ms,carry_forward,day_reset,last,bid,ask,\
bid_qty1,ask_qty1,d_trades,d_vol,d_fin,tick_dir_sum,tick_dir_agg,imb1,micro_dev,\
s_lr,s_tick,signed_vol,delay_ms,score,decision,bad_lines,ignored_fields";

fn write_row(w: &mut CsvWriter, write_ts: &str, symbol: &str, row: &TBarRow, bad_lines: u64, ignored_fields: u64) -> Result<()> {
    let r = join_row(&[
        write_ts.to_string(),
        symbol.to_string(),
        row.bar_start_ms.to_string(),
        row.carry_forward.to_string(),
        row.day_reset.to_string(),
        row.last.unwrap_or(0.0).to_string(),
        row.bid.unwrap_or(0.0).to_string(),
        row.ask.unwrap_or(0.0).to_string(),
        row.bid_qty1.unwrap_or(0.0).to_string(),
        row.ask_qty1.unwrap_or(0.0).to_string(),
        row.d_trades.to_string(),
        row.d_vol.to_string(),
        row.d_fin.to_string(),
        row.tick_dir_sum.to_string(),
        row.tick_dir_agg.to_string(),
        row.imb1.to_string(),
        row.micro_dev.to_string(),
        row.s_lr.to_string(),
        row.s_tick.to_string(),
        row.signed_vol.to_string(),
        row.delay_ms.to_string(),
        row.score.to_string(),
        row.last_decision.as_str().to_string(),
        bad_lines.to_string(),
        ignored_fields.to_string(),
    ]);
    w.write_row(&r)
}

struct SymbolCtx {
    state: agg_t::SymbolState,
}

/// Apply one capture-file line, bucket its timestamp to `bar_sec`. Returns
/// `(symbol, write_ts, bar_start_sec)` when the line carried a recognized
/// `T:` payload.
fn apply_capture_line(line: &str, symbols: &mut HashMap<String, SymbolCtx>, bar_sec: i64) -> Option<(String, String, i64)> {
    let rec = Record::parse_line(line)?;
    let payload = rec.payload.strip_prefix("T:")?;
    let event = agg_t::parse_line(payload);
    let symbol = match &event {
        agg_t::TEvent::Fields(s, _) => s.clone(),
        agg_t::TEvent::Bad(Some(s)) => s.clone(),
        agg_t::TEvent::Bad(None) => return None,
    };
    let ctx = symbols.entry(symbol.clone()).or_insert_with(|| SymbolCtx { state: agg_t::SymbolState::new(&symbol) });
    match event {
        agg_t::TEvent::Fields(_, fields) => {
            for (idx, val) in fields {
                ctx.state.apply_field(idx, val);
            }
        }
        agg_t::TEvent::Bad(_) => ctx.state.bad_lines += 1,
    }
    let sec = write_ts_to_sec(&rec.write_ts)?;
    let bucket = (sec / bar_sec) * bar_sec;
    Some((symbol, rec.write_ts, bucket))
}

fn in_session(sec: i64, session: &Option<(i64, i64)>) -> bool {
    match session {
        Some((start, end)) => sec >= *start && sec < *end,
        None => true,
    }
}

fn run_offline(args: &Args) -> Result<()> {
    let file = args.file.as_ref().expect("checked by caller");
    let out = args.out.as_ref().context("--out required with --file")?;
    let params = params(args);

    let session = match &args.session {
        Some(v) if v.len() == 2 => {
            let start = hhmmss_to_sec(&v[0]).context("--session start must be HH:MM:SS")?;
            let end = hhmmss_to_sec(&v[1]).context("--session end must be HH:MM:SS")?;
            Some((start, end))
        }
        _ => None,
    };

    let mut writer = CsvWriter::open(out, CSV_HEADER)?;
    let mut symbols: HashMap<String, SymbolCtx> = HashMap::new();
    let mut last_bucket: Option<i64> = None;

    let content = std::fs::read_to_string(file).with_context(|| format!("read {file:?}"))?;
    for line in content.lines() {
        if line.is_empty() {
            continue;
        }
        let Some((_sym, write_ts, bucket)) = apply_capture_line(line, &mut symbols, args.bar_sec) else { continue };
        if !in_session(bucket, &session) {
            continue;
        }
        if last_bucket != Some(bucket) {
            if let Some(prev) = last_bucket {
                for (symbol, ctx) in symbols.iter_mut() {
                    let row = ctx.state.flush_bar(&params, prev * 1000, prev * 1000, prev * 1000);
                    write_row(&mut writer, &write_ts, symbol, &row, ctx.state.bad_lines, ctx.state.ignored_fields)?;
                }
            }
            last_bucket = Some(bucket);
        }
    }
    if let Some(prev) = last_bucket {
        for (symbol, ctx) in symbols.iter_mut() {
            let row = ctx.state.flush_bar(&params, prev * 1000, prev * 1000, prev * 1000);
            write_row(&mut writer, "", symbol, &row, ctx.state.bad_lines, ctx.state.ignored_fields)?;
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

    let params = params(args);
    let mut day = cedro_md::config::ymd(cedro_md::config::now_local());
    let input_path = |ymd: &str| input_dir.join(format!("{ymd}_T.txt"));
    let ckpt_path = |ymd: &str| state_dir.join(format!("{ymd}_T.offset"));

    let mut tailer = Tailer::new(input_path(&day), ckpt_path(&day), Duration::from_millis(args.poll_ms), Duration::from_secs(args.ckpt_sec));
    let mut out_path = out_dir.join(format!("{day}_tbar_signal_1s.csv"));
    let mut writer = CsvWriter::open(&out_path, CSV_HEADER)?;
    let mut symbols: HashMap<String, SymbolCtx> = HashMap::new();
    let mut last_bucket: Option<i64> = None;

    loop {
        let today = cedro_md::config::ymd(cedro_md::config::now_local());
        if today != day {
            tracing::info!(from = %day, to = %today, "parser_t day rollover");
            day = today;
            tailer.switch_to(input_path(&day), ckpt_path(&day));
            out_path = out_dir.join(format!("{day}_tbar_signal_1s.csv"));
            writer = CsvWriter::open(&out_path, CSV_HEADER)?;
            symbols.clear();
            last_bucket = None;
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
            let Some((_sym, write_ts, bucket)) = apply_capture_line(line, &mut symbols, args.bar_sec) else { continue };
            if last_bucket != Some(bucket) {
                if let Some(prev) = last_bucket {
                    for (symbol, ctx) in symbols.iter_mut() {
                        let row = ctx.state.flush_bar(&params, prev * 1000, prev * 1000, prev * 1000);
                        write_row(&mut writer, &write_ts, symbol, &row, ctx.state.bad_lines, ctx.state.ignored_fields)?;
                    }
                }
                last_bucket = Some(bucket);
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
