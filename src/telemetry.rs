//! Logging setup shared by every binary in this crate.
use tracing_subscriber::EnvFilter;

/// Initialize a `tracing` subscriber from `RUST_LOG` (default: `info`).
///
/// Called once at the top of each binary's `main`, mirroring the
/// once-per-process `dotenvy::dotenv()` call that precedes it.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
