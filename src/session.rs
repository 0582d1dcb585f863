//! Session manager: owns the TCP connection lifecycle to the quote server.
//! See `spec.md` §4.3.
//!
//! State machine: `Disconnected -> Connecting -> Authenticating -> Subscribed
//! -> Streaming -> (Disconnected on error | ClosedEndOfDay)`. Outside the
//! configured market window the manager sleeps without connecting; any error
//! during `Streaming` flushes pending demux buffers, backs off 5 seconds, and
//! reconnects unless a stop flag was raised.
use crate::config;
use crate::demux::Demultiplexer;
use crate::framer::Framer;
use anyhow::{bail, Context, Result};
use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Observable session state, logged at each transition (`spec.md` §4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Authenticating,
    Subscribed,
    Streaming,
    ClosedEndOfDay,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    /// Tracked contract codes, one `BQT`/`GQT`/`SQT`/`SAB` block per entry.
    pub contracts: Vec<String>,
    /// Fixed interest-rate subscription symbol (e.g. `DI1F27`).
    pub interest_rate_symbol: String,
    pub market_open_hour: u8,
    pub market_close_hour: u8,
    pub reconnect_backoff: Duration,
}

impl Default for SessionConfig {
    fn default() -> SessionConfig {
        SessionConfig {
            host: "datafeed1.cedrotech.com".to_string(),
            port: 81,
            user: String::new(),
            password: String::new(),
            contracts: Vec::new(),
            interest_rate_symbol: "DI1F27".to_string(),
            market_open_hour: config::MARKET_OPEN_HOUR,
            market_close_hour: config::MARKET_CLOSE_HOUR,
            reconnect_backoff: Duration::from_secs(5),
        }
    }
}

/// Read from `stream` one byte at a time (no `BufRead` guarantee over a raw
/// socket) until `needle` has been seen in the accumulated text, returning
/// everything read so far. Used for the three login prompts.
fn read_until<S: Read>(stream: &mut S, needle: &str) -> Result<String> {
    let mut acc = String::new();
    let mut byte = [0u8; 1];
    loop {
        let n = stream.read(&mut byte)?;
        if n == 0 {
            bail!("connection closed while waiting for {needle:?}");
        }
        acc.push(byte[0] as char);
        if acc.contains(needle) {
            return Ok(acc);
        }
        if acc.len() > 4096 {
            bail!("did not see {needle:?} within 4096 bytes");
        }
    }
}

/// Perform the fixed username/password handshake (`spec.md` §6.1): send a
/// bare `\r\n`, then answer the `Username:`/`Password:` prompts in turn, then
/// wait for `You are connected`.
pub fn authenticate<S: Read + Write>(stream: &mut S, user: &str, password: &str) -> Result<()> {
    stream.write_all(b"\r\n").context("send initial CRLF")?;
    read_until(stream, "Username:").context("await Username prompt")?;
    stream.write_all(format!("{user}\r\n").as_bytes()).context("send username")?;
    read_until(stream, "Password:").context("await Password prompt")?;
    stream.write_all(format!("{password}\r\n").as_bytes()).context("send password")?;
    read_until(stream, "You are connected").context("await connected confirmation")?;
    Ok(())
}

/// Build the batched subscription command block (`spec.md` §4.3): one
/// `BQT`/`GQT ... S`/`SQT`/`SAB` quartet per tracked contract, plus one fixed
/// interest-rate `SQT`, each line terminated with `\r\n`.
pub fn build_subscribe_commands(contracts: &[String], interest_rate_symbol: &str) -> String {
    let mut out = String::new();
    for ctr in contracts {
        out.push_str(&format!("BQT {ctr}\r\n"));
        out.push_str(&format!("GQT {ctr} S\r\n"));
        out.push_str(&format!("SQT {ctr}\r\n"));
        out.push_str(&format!("SAB {ctr}\r\n"));
    }
    out.push_str(&format!("SQT {interest_rate_symbol}\r\n"));
    out
}

/// Send the subscription block in one write; if that fails, fall back to
/// emitting each `\r\n`-terminated command as its own write.
pub fn send_subscribe<S: Write>(stream: &mut S, cmd_batch: &str) -> Result<()> {
    if stream.write_all(cmd_batch.as_bytes()).is_ok() {
        return Ok(());
    }
    tracing::warn!("batched subscribe write failed, falling back to per-line emission");
    for line in cmd_batch.split_inclusive("\r\n") {
        stream.write_all(line.as_bytes()).context("send subscribe line")?;
    }
    Ok(())
}

/// Apply the socket tuning mandated by `spec.md` §4.3 (keepalive, no-delay,
/// 4 KiB send / 64 KiB receive buffers) to a connected stream.
#[cfg(unix)]
fn tune_socket(stream: &TcpStream) -> Result<()> {
    use std::os::unix::io::AsRawFd;
    let fd = stream.as_raw_fd();
    stream.set_nodelay(true).context("set TCP_NODELAY")?;

    let setsockopt_int = |level: libc::c_int, name: libc::c_int, val: libc::c_int| -> std::io::Result<()> {
        let ret = unsafe {
            libc::setsockopt(
                fd,
                level,
                name,
                &val as *const _ as *const libc::c_void,
                std::mem::size_of_val(&val) as libc::socklen_t,
            )
        };
        if ret == 0 {
            Ok(())
        } else {
            Err(std::io::Error::last_os_error())
        }
    };

    if let Err(e) = setsockopt_int(libc::SOL_SOCKET, libc::SO_KEEPALIVE, 1) {
        tracing::warn!(error = %e, "failed to set SO_KEEPALIVE");
    }
    if let Err(e) = setsockopt_int(libc::SOL_SOCKET, libc::SO_SNDBUF, 4096) {
        tracing::warn!(error = %e, "failed to set SO_SNDBUF");
    }
    if let Err(e) = setsockopt_int(libc::SOL_SOCKET, libc::SO_RCVBUF, 65536) {
        tracing::warn!(error = %e, "failed to set SO_RCVBUF");
    }
    Ok(())
}

#[cfg(not(unix))]
fn tune_socket(stream: &TcpStream) -> Result<()> {
    stream.set_nodelay(true).context("set TCP_NODELAY")?;
    Ok(())
}

/// Connect, apply socket tuning, authenticate, and subscribe. Returns the
/// live stream ready for the streaming read loop.
#[tracing::instrument(skip(cfg), fields(host = %cfg.host, port = cfg.port))]
pub fn connect_authenticate_subscribe(cfg: &SessionConfig) -> Result<TcpStream> {
    tracing::info!(state = ?SessionState::Connecting, "connecting");
    let mut stream = TcpStream::connect((cfg.host.as_str(), cfg.port))
        .with_context(|| format!("connect to {}:{}", cfg.host, cfg.port))?;
    tune_socket(&stream)?;

    tracing::info!(state = ?SessionState::Authenticating, "authenticating");
    authenticate(&mut stream, &cfg.user, &cfg.password)?;

    let cmd_batch = build_subscribe_commands(&cfg.contracts, &cfg.interest_rate_symbol);
    send_subscribe(&mut stream, &cmd_batch)?;
    tracing::info!(state = ?SessionState::Subscribed, n_contracts = cfg.contracts.len(), "subscribed");

    Ok(stream)
}

/// Run the full connect/stream/reconnect loop until `stop` is set. Framed
/// records are pushed into `demux`. On any I/O error during streaming,
/// pending demux buffers are flushed and the manager backs off and
/// reconnects (unless `stop` has been raised in the meantime).
pub fn run(cfg: &SessionConfig, demux: &mut Demultiplexer, stop: &AtomicBool) -> Result<()> {
    let mut framer = Framer::new();

    while !stop.load(Ordering::Relaxed) {
        let now = config::now_local();
        if !config::in_market_window(now, cfg.market_open_hour, cfg.market_close_hour) {
            tracing::info!(state = ?SessionState::Disconnected, "outside market window, sleeping");
            std::thread::sleep(Duration::from_secs(60));
            continue;
        }

        let mut stream = match connect_authenticate_subscribe(cfg) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(error = %e, "connect/auth/subscribe failed, backing off");
                std::thread::sleep(cfg.reconnect_backoff);
                continue;
            }
        };

        tracing::info!(state = ?SessionState::Streaming, "streaming");
        let mut buf = [0u8; 65536];
        loop {
            if stop.load(Ordering::Relaxed) {
                demux.flush().ok();
                return Ok(());
            }
            let now = config::now_local();
            if !config::in_market_window(now, cfg.market_open_hour, cfg.market_close_hour) {
                tracing::info!(state = ?SessionState::ClosedEndOfDay, "market window closed, ending session");
                demux.flush().ok();
                break;
            }
            match stream.read(&mut buf) {
                Ok(0) => {
                    tracing::warn!("connection closed by peer");
                    demux.flush().ok();
                    break;
                }
                Ok(n) => {
                    for rec in framer.feed(&buf[..n]) {
                        if let Err(e) = demux.push(&rec) {
                            tracing::error!(error = %e, "demux push failed");
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "stream read failed");
                    demux.flush().ok();
                    break;
                }
            }
        }

        if !stop.load(Ordering::Relaxed) {
            std::thread::sleep(cfg.reconnect_backoff);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn build_subscribe_commands_batches_per_contract_plus_interest_rate() {
        let cmds = build_subscribe_commands(&["WINFUT".to_string(), "WDOFUT".to_string()], "DI1F27");
        assert_eq!(
            cmds,
            "BQT WINFUT\r\nGQT WINFUT S\r\nSQT WINFUT\r\nSAB WINFUT\r\n\
             BQT WDOFUT\r\nGQT WDOFUT S\r\nSQT WDOFUT\r\nSAB WDOFUT\r\n\
             SQT DI1F27\r\n"
        );
    }

    #[test]
    fn build_subscribe_commands_empty_contracts_still_sends_interest_rate() {
        let cmds = build_subscribe_commands(&[], "DI1F27");
        assert_eq!(cmds, "SQT DI1F27\r\n");
    }

    /// A reader+writer double over an in-memory buffer, standing in for the
    /// socket in handshake tests.
    struct MockStream {
        inbound: Cursor<Vec<u8>>,
        pub outbound: Vec<u8>,
    }

    impl Read for MockStream {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            self.inbound.read(buf)
        }
    }
    impl Write for MockStream {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.outbound.extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn authenticate_sends_fixed_user_pass_sequence() {
        let server_script = b"Username:Password:You are connected".to_vec();
        let mut s = MockStream { inbound: Cursor::new(server_script), outbound: Vec::new() };
        authenticate(&mut s, "alice", "hunter2").unwrap();
        assert_eq!(s.outbound, b"\r\nalice\r\nhunter2\r\n");
    }

    #[test]
    fn authenticate_fails_on_early_close() {
        let mut s = MockStream { inbound: Cursor::new(b"Username:".to_vec()), outbound: Vec::new() };
        assert!(authenticate(&mut s, "alice", "hunter2").is_err());
    }

    #[test]
    fn send_subscribe_single_write_succeeds() {
        let mut out = Vec::new();
        let batch = build_subscribe_commands(&["WINFUT".to_string()], "DI1F27");
        send_subscribe(&mut out, &batch).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), batch);
    }
}
