//! V trade-print aggregator CLI. See `spec.md` §4.8/§6.4.
//!
//! Unlike the T/Z parsers, bars close when a trade's own timestamp crosses
//! into the next bucket, not on a wall-clock second change — `agg_v`'s
//! `apply_trade` already returns the closed row at the right moment, so the
//! CLI only needs to route capture lines and write whatever comes back.
use anyhow::{Context, Result};
use cedro_md::agg_v::{self, SymbolState, VEvent, VParams};
use cedro_md::csv_out::{join_row, CsvWriter};
use cedro_md::record::Record;
use cedro_md::tailer::Tailer;
use clap::Parser;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Parser)]
#[command(version, about = "Trade-print OHLCV/VWAP bar aggregator with EMA trend signal")]
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
    #[arg(long, default_value_t = 5)]
    ema_fast_period: u32,
    #[arg(long, default_value_t = 20)]
    ema_slow_period: u32,
    #[arg(long, default_value_t = 5)]
    ema_delta_period: u32,
    #[arg(long, default_value_t = 5.0)]
    delta_ema_th: f64,
    #[arg(long, default_value_t = 0.15)]
    imb_th: f64,
    #[arg(long, default_value_t = 3)]
    min_trades: u64,
}

fn params(args: &Args) -> VParams {
    VParams {
        bar_sec: args.bar_sec,
        ema_fast_period: args.ema_fast_period,
        ema_slow_period: args.ema_slow_period,
        ema_delta_period: args.ema_delta_period,
        delta_ema_th: args.delta_ema_th,
        imb_th: args.imb_th,
        min_trades: args.min_trades,
    }
}

const CSV_HEADER: &str = "write_ts,symbol,bar_start_sec,trades,open,high,low,close,vwap,\
buy_vol,sell_vol,undef_vol,delta,imbalance,ema_fast,ema_slow,ema_delta,signal,\
late_events,bad_lines,busts";

fn write_row(w: &mut CsvWriter, write_ts: &str, symbol: &str, row: &agg_v::VBarRow, st: &SymbolState) -> Result<()> {
    let r = join_row(&[
        write_ts.to_string(),
        symbol.to_string(),
        row.bar_start_sec.to_string(),
        row.trades.to_string(),
        row.open.to_string(),
        row.high.to_string(),
        row.low.to_string(),
        row.close.to_string(),
        row.vwap.to_string(),
        row.buy_vol.to_string(),
        row.sell_vol.to_string(),
        row.undef_vol.to_string(),
        row.delta.to_string(),
        row.imbalance.to_string(),
        row.ema_fast.to_string(),
        row.ema_slow.to_string(),
        row.ema_delta.to_string(),
        row.signal.as_str().to_string(),
        st.late_events.to_string(),
        st.bad_lines.to_string(),
        st.busts.to_string(),
    ]);
    w.write_row(&r)
}

/// Apply one capture-file line. Returns `(symbol, write_ts, closed_row)` when
/// the trade crossed a bar boundary and a row was emitted.
fn apply_capture_line(line: &str, symbols: &mut HashMap<String, SymbolState>, params: &VParams) -> Option<(String, String, Option<agg_v::VBarRow>)> {
    let rec = Record::parse_line(line)?;
    let payload = rec.payload.strip_prefix("V:")?;
    let event = agg_v::parse_line(payload, params.bar_sec);

    let symbol = match &event {
        VEvent::Trade { symbol, .. } | VEvent::Bust { symbol } | VEvent::Reset { symbol } => symbol.clone(),
        VEvent::Bad(Some(symbol)) => symbol.clone(),
        VEvent::Bad(None) => return None,
    };
    let st = symbols.entry(symbol.clone()).or_insert_with(|| SymbolState::new(&symbol, params));

    let closed = match event {
        VEvent::Trade { trade, .. } => st.apply_trade(params, &trade),
        VEvent::Bust { .. } => {
            st.apply_bust();
            None
        }
        VEvent::Reset { .. } => {
            st.apply_reset(params);
            None
        }
        VEvent::Bad(_) => {
            st.bad_lines += 1;
            None
        }
    };
    Some((symbol, rec.write_ts, closed))
}

fn run_offline(args: &Args) -> Result<()> {
    let file = args.file.as_ref().expect("checked by caller");
    let out = args.out.as_ref().context("--out required with --file")?;
    let params = params(args);

    let mut writer = CsvWriter::open(out, CSV_HEADER)?;
    let mut symbols: HashMap<String, SymbolState> = HashMap::new();
    let mut last_write_ts = String::new();

    let content = std::fs::read_to_string(file).with_context(|| format!("read {file:?}"))?;
    for line in content.lines() {
        if line.is_empty() {
            continue;
        }
        let Some((symbol, write_ts, closed)) = apply_capture_line(line, &mut symbols, &params) else { continue };
        last_write_ts = write_ts.clone();
        if let Some(row) = closed {
            let st = symbols.get(&symbol).expect("just inserted above");
            write_row(&mut writer, &write_ts, &symbol, &row, st)?;
        }
    }
    for (symbol, st) in symbols.iter_mut() {
        if let Some(row) = st.flush(&params) {
            write_row(&mut writer, &last_write_ts, symbol, &row, st)?;
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
    let input_path = |ymd: &str| input_dir.join(format!("{ymd}_V.txt"));
    let ckpt_path = |ymd: &str| state_dir.join(format!("{ymd}_V.offset"));

    let mut tailer = Tailer::new(input_path(&day), ckpt_path(&day), Duration::from_millis(args.poll_ms), Duration::from_secs(args.ckpt_sec));
    let mut out_path = out_dir.join(format!("{day}_vbar_signal_1s.csv"));
    let mut writer = CsvWriter::open(&out_path, CSV_HEADER)?;
    let mut symbols: HashMap<String, SymbolState> = HashMap::new();

    loop {
        let today = cedro_md::config::ymd(cedro_md::config::now_local());
        if today != day {
            tracing::info!(from = %day, to = %today, "parser_v day rollover");
            for (symbol, st) in symbols.iter_mut() {
                if let Some(row) = st.flush(&params) {
                    write_row(&mut writer, "", symbol, &row, st)?;
                }
            }
            day = today;
            tailer.switch_to(input_path(&day), ckpt_path(&day));
            out_path = out_dir.join(format!("{day}_vbar_signal_1s.csv"));
            writer = CsvWriter::open(&out_path, CSV_HEADER)?;
            symbols.clear();
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
            let Some((symbol, write_ts, closed)) = apply_capture_line(line, &mut symbols, &params) else { continue };
            if let Some(row) = closed {
                let st = symbols.get(&symbol).expect("just inserted above");
                write_row(&mut writer, &write_ts, &symbol, &row, st)?;
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
