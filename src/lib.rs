//! Real-time market-data pipeline for a Brazilian-exchange datafeed.
//!
//! Ingestion (`framer`, `demux`, `session`) captures the raw TCP stream to
//! append-only per-day, per-class files; the tailers and per-class
//! reconstructors/aggregators (`book_z`, `book_b`, `agg_t`, `agg_v`,
//! `signal_z`) replay those files into second-resolution CSV bars with
//! buy/sell/flat signals. See `SPEC_FULL.md` for the full component map.
pub mod agg_t;
pub mod agg_v;
pub mod book_b;
pub mod book_z;
pub mod config;
pub mod csv_out;
pub mod demux;
pub mod ema;
pub mod framer;
pub mod record;
pub mod session;
pub mod signal_z;
pub mod tailer;
pub mod telemetry;
