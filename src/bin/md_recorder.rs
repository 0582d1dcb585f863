//! Live ingestion binary: connects to the quote server, authenticates,
//! subscribes, and captures the raw stream to per-day/per-class files.
//! See `spec.md` §4.2/§4.3 and `SPEC_FULL.md` §1.3.
use anyhow::Result;
use clap::Parser;
use cedro_md::demux::Demultiplexer;
use cedro_md::session::{self, SessionConfig};
use dotenvy::dotenv;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Parser)]
#[command(version, about = "Quote-server recorder: capture raw B/V/T/Z stream to disk")]
struct Args {
    #[arg(long, env = "CEDRO_HOST", default_value = "datafeed1.cedrotech.com")]
    host: String,

    #[arg(long, env = "CEDRO_PORT", default_value_t = 81)]
    port: u16,

    #[arg(long, env = "CEDRO_USER")]
    user: String,

    #[arg(long, env = "CEDRO_PASSWORD")]
    password: String,

    /// Tracked contract codes, comma-separated (e.g. WINFUT,WDOFUT).
    #[arg(long, env = "CEDRO_CONTRACTS", value_delimiter = ',')]
    contracts: Vec<String>,

    #[arg(long, env = "CEDRO_INTEREST_RATE_SYMBOL", default_value = "DI1F27")]
    interest_rate_symbol: String,

    #[arg(long, default_value_t = 9)]
    market_open_hour: u8,

    #[arg(long, default_value_t = 19)]
    market_close_hour: u8,

    #[arg(long, default_value_t = 5)]
    reconnect_backoff_sec: u64,

    /// Directory to write `<date>_raw_data.txt` / `<date>_{B,V,T,Z}.txt` into.
    #[arg(long, env = "CEDRO_OUT_DIR", default_value = "capture")]
    out_dir: PathBuf,
}

fn main() -> Result<()> {
    dotenv().ok();
    cedro_md::telemetry::init();
    let args = Args::parse();

    std::fs::create_dir_all(&args.out_dir)?;

    let cfg = SessionConfig {
        host: args.host,
        port: args.port,
        user: args.user,
        password: args.password,
        contracts: args.contracts,
        interest_rate_symbol: args.interest_rate_symbol,
        market_open_hour: args.market_open_hour,
        market_close_hour: args.market_close_hour,
        reconnect_backoff: Duration::from_secs(args.reconnect_backoff_sec),
    };

    let stop = Arc::new(AtomicBool::new(false));
    let stop_handler = stop.clone();
    ctrlc::set_handler(move || {
        tracing::info!("stop signal received, shutting down after current record");
        stop_handler.store(true, Ordering::Relaxed);
    })?;

    let mut demux = Demultiplexer::new(args.out_dir);
    session::run(&cfg, &mut demux, &stop)?;
    demux.flush()?;
    Ok(())
}
