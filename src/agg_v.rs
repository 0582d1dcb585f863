//! Trade-print aggregator: OHLCV/VWAP/buy-sell-delta bars with EMA-based
//! trend signals. See `spec.md` §4.8.
//!
//! Bar boundaries are driven by the trade's own timestamp (unlike the T/Z
//! aggregators, which flush every symbol together on a wall-clock second
//! change): each incoming trade compares its `bar_start_sec` against the
//! symbol's current bar and closes/opens bars accordingly, mirroring
//! `original_source/parsers/parser_V.c`'s `process_line`/`emit_bar` split.
use crate::ema::Ema;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aggressor {
    Buy,
    Sell,
    Undefined,
}

impl Aggressor {
    fn from_tag(tag: &str) -> Aggressor {
        match tag.chars().next() {
            Some('A') => Aggressor::Buy,
            Some('V') => Aggressor::Sell,
            _ => Aggressor::Undefined,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Buy,
    Sell,
    Flat,
}

impl Signal {
    pub fn as_str(self) -> &'static str {
        match self {
            Signal::Buy => "BUY",
            Signal::Sell => "SELL",
            Signal::Flat => "FLAT",
        }
    }
}

#[derive(Debug, Clone)]
pub struct VParams {
    pub bar_sec: i64,
    pub ema_fast_period: u32,
    pub ema_slow_period: u32,
    pub ema_delta_period: u32,
    pub delta_ema_th: f64,
    pub imb_th: f64,
    pub min_trades: u64,
}

impl Default for VParams {
    fn default() -> VParams {
        VParams {
            bar_sec: 1,
            ema_fast_period: 5,
            ema_slow_period: 20,
            ema_delta_period: 5,
            delta_ema_th: 5.0,
            imb_th: 0.15,
            min_trades: 3,
        }
    }
}

/// A single parsed `V:<sym>:A:...` trade print.
#[derive(Debug, Clone)]
pub struct Trade {
    pub bar_start_sec: i64,
    pub price: f64,
    pub qty: f64,
    pub aggressor: Aggressor,
}

#[derive(Debug, Clone)]
pub struct VBarRow {
    pub bar_start_sec: i64,
    pub trades: u64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub vwap: f64,
    pub buy_vol: f64,
    pub sell_vol: f64,
    pub undef_vol: f64,
    pub delta: f64,
    pub imbalance: f64,
    pub ema_fast: f64,
    pub ema_slow: f64,
    pub ema_delta: f64,
    pub signal: Signal,
}

#[derive(Debug, Default)]
struct BarAccum {
    bar_start_sec: i64,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    vwap_num: f64,
    vwap_den: f64,
    buy_vol: f64,
    sell_vol: f64,
    undef_vol: f64,
    trades: u64,
}

impl BarAccum {
    fn start(bar_start_sec: i64, first_price: f64) -> BarAccum {
        BarAccum { bar_start_sec, open: first_price, high: first_price, low: first_price, close: first_price, ..Default::default() }
    }

    fn update(&mut self, price: f64, qty: f64, aggressor: Aggressor) {
        if price > self.high {
            self.high = price;
        }
        if price < self.low {
            self.low = price;
        }
        self.close = price;
        self.vwap_num += price * qty;
        self.vwap_den += qty;
        self.trades += 1;
        match aggressor {
            Aggressor::Buy => self.buy_vol += qty,
            Aggressor::Sell => self.sell_vol += qty,
            Aggressor::Undefined => self.undef_vol += qty,
        }
    }
}

#[derive(Debug)]
pub struct SymbolState {
    symbol: String,
    bar: Option<BarAccum>,
    ema_fast: Ema,
    ema_slow: Ema,
    ema_delta: Ema,
    pub late_events: u64,
    pub bad_lines: u64,
    pub busts: u64,
}

impl SymbolState {
    pub fn new(symbol: &str, params: &VParams) -> SymbolState {
        SymbolState {
            symbol: symbol.to_string(),
            bar: None,
            ema_fast: Ema::new(params.ema_fast_period),
            ema_slow: Ema::new(params.ema_slow_period),
            ema_delta: Ema::new(params.ema_delta_period),
            late_events: 0,
            bad_lines: 0,
            busts: 0,
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    /// Apply a trade print, returning a closed bar row if this trade crossed
    /// into a new bar (the now-stale previous bar is emitted first).
    pub fn apply_trade(&mut self, params: &VParams, t: &Trade) -> Option<VBarRow> {
        match &mut self.bar {
            None => {
                self.bar = Some(BarAccum::start(t.bar_start_sec, t.price));
                self.bar.as_mut().unwrap().update(t.price, t.qty, t.aggressor);
                None
            }
            Some(bar) if t.bar_start_sec == bar.bar_start_sec => {
                bar.update(t.price, t.qty, t.aggressor);
                None
            }
            Some(bar) if t.bar_start_sec > bar.bar_start_sec => {
                let closed = self.close_bar(params);
                self.bar = Some(BarAccum::start(t.bar_start_sec, t.price));
                self.bar.as_mut().unwrap().update(t.price, t.qty, t.aggressor);
                closed
            }
            Some(_) => {
                self.late_events += 1;
                None
            }
        }
    }

    /// `V:<sym>:D:<id>` — trade bust. No per-trade bookkeeping is kept (the
    /// bar is an aggregate, not a trade log, matching
    /// `original_source/parsers/parser_V.c`), so a bust is counted but does
    /// not retroactively adjust the in-flight bar.
    pub fn apply_bust(&mut self) {
        self.busts += 1;
    }

    /// `V:<sym>:R` — full reset: clears the in-flight bar and every EMA
    /// state without emitting a row for the discarded partial bar.
    pub fn apply_reset(&mut self, params: &VParams) {
        self.bar = None;
        self.ema_fast = Ema::new(params.ema_fast_period);
        self.ema_slow = Ema::new(params.ema_slow_period);
        self.ema_delta = Ema::new(params.ema_delta_period);
    }

    /// Force-close whatever bar is in flight (end-of-stream / day rollover).
    pub fn flush(&mut self, params: &VParams) -> Option<VBarRow> {
        self.close_bar(params)
    }

    fn close_bar(&mut self, params: &VParams) -> Option<VBarRow> {
        let bar = self.bar.take()?;
        if bar.vwap_den <= 0.0 {
            return None;
        }
        let vwap = bar.vwap_num / bar.vwap_den;
        let delta = bar.buy_vol - bar.sell_vol;
        let denom = bar.buy_vol + bar.sell_vol;
        let imbalance = if denom > 0.0 { delta / denom } else { 0.0 };

        let ema_fast = self.ema_fast.update(vwap);
        let ema_slow = self.ema_slow.update(vwap);
        let ema_delta = self.ema_delta.update(imbalance);

        let signal = if bar.trades < params.min_trades {
            Signal::Flat
        } else if ema_fast > ema_slow && ema_delta > params.delta_ema_th && imbalance > params.imb_th {
            Signal::Buy
        } else if ema_fast < ema_slow && ema_delta < -params.delta_ema_th && imbalance < -params.imb_th {
            Signal::Sell
        } else {
            Signal::Flat
        };

        Some(VBarRow {
            bar_start_sec: bar.bar_start_sec,
            trades: bar.trades,
            open: bar.open,
            high: bar.high,
            low: bar.low,
            close: bar.close,
            vwap,
            buy_vol: bar.buy_vol,
            sell_vol: bar.sell_vol,
            undef_vol: bar.undef_vol,
            delta,
            imbalance,
            ema_fast,
            ema_slow,
            ema_delta,
            signal,
        })
    }
}

/// Parse `hh:mm:ss` (with optional millisecond suffix folded into the digits,
/// `HHMMSSmmm`) into seconds-since-midnight, bucketed to `bar_sec`.
fn hhmmssmmm_to_bar_start_sec(raw: &str, bar_sec: i64) -> Option<i64> {
    if raw.len() < 6 || !raw.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let hh: i64 = raw[0..2].parse().ok()?;
    let mm: i64 = raw[2..4].parse().ok()?;
    let ss: i64 = raw[4..6].parse().ok()?;
    if hh > 23 || mm > 59 || ss > 59 {
        return None;
    }
    let total_sec = hh * 3600 + mm * 60 + ss;
    Some((total_sec / bar_sec) * bar_sec)
}

/// Outcome of parsing a single `V:<sym>:` line, used by the caller for
/// counters and dispatch.
pub enum VEvent {
    Trade { symbol: String, trade: Trade },
    Bust { symbol: String },
    Reset { symbol: String },
    /// Malformed payload. Carries the symbol when it could be read before
    /// the rest of the line turned out malformed, so the caller can
    /// attribute the drop to that symbol's `bad_lines` counter (per §7:
    /// "Parse error -> increment `bad` counter; skip record") instead of
    /// discarding it with no target.
    Bad(Option<String>),
}

/// Parse `op_and_args` (the `V:` prefix already stripped). Distinguishes the
/// subscribe-mode 9-field trade line from the snapshot-mode 10-field line
/// (with an extra `request_id`) purely by token count, per `spec.md` §9 open
/// question (d) — there is no explicit flag.
pub fn parse_line(op_and_args: &str, bar_sec: i64) -> VEvent {
    let mut parts = op_and_args.splitn(2, ':');
    let symbol = match parts.next() {
        Some(s) if !s.is_empty() => s.to_string(),
        _ => return VEvent::Bad(None),
    };
    let rest = match parts.next() {
        Some(r) => r,
        None => return VEvent::Bad(Some(symbol)),
    };
    let mut it = rest.splitn(2, ':');
    let op = match it.next() {
        Some(o) => o,
        None => return VEvent::Bad(Some(symbol)),
    };
    let after_op = it.next().unwrap_or("");

    match op.chars().next() {
        Some('R') => VEvent::Reset { symbol },
        Some('D') => VEvent::Bust { symbol },
        Some('A') => {
            let fields: Vec<&str> = after_op.split(':').collect();
            // subscribe: time:price:buyer:seller:qty:trade_id:cond:aggressor:orig (9)
            // snapshot:  time:price:buyer:seller:qty:trade_id:request_id:cond:aggressor:orig (10)
            let is_snapshot = fields.len() >= 10;
            let (idx_time, idx_price, idx_qty, idx_aggr) = if is_snapshot {
                (0usize, 1usize, 4usize, 8usize)
            } else {
                (0usize, 1usize, 4usize, 7usize)
            };
            if fields.len() <= idx_aggr {
                return VEvent::Bad(Some(symbol));
            }
            let Some(bar_start_sec) = hhmmssmmm_to_bar_start_sec(fields[idx_time], bar_sec) else {
                return VEvent::Bad(Some(symbol));
            };
            let Ok(price) = fields[idx_price].parse::<f64>() else {
                return VEvent::Bad(Some(symbol));
            };
            let Ok(qty) = fields[idx_qty].parse::<f64>() else {
                return VEvent::Bad(Some(symbol));
            };
            if qty <= 0.0 {
                return VEvent::Bad(Some(symbol));
            }
            let aggressor = Aggressor::from_tag(fields[idx_aggr]);
            VEvent::Trade { symbol, trade: Trade { bar_start_sec, price, qty, aggressor } }
        }
        _ => VEvent::Bad(Some(symbol)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_trade_bar_scenario_from_spec() {
        let params = VParams { min_trades: 3, ..Default::default() };
        let mut st = SymbolState::new("X", &params);
        let ev = parse_line("A:090000000:100.00:001:002:10:1234:0:A:0", params.bar_sec);
        let VEvent::Trade { trade, .. } = ev else { panic!("expected trade") };
        assert!(st.apply_trade(&params, &trade).is_none());
        let row = st.flush(&params).unwrap();
        assert_eq!(row.open, 100.0);
        assert_eq!(row.high, 100.0);
        assert_eq!(row.low, 100.0);
        assert_eq!(row.close, 100.0);
        assert_eq!(row.vwap, 100.0);
        assert_eq!(row.buy_vol, 10.0);
        assert_eq!(row.sell_vol, 0.0);
        assert_eq!(row.signal, Signal::Flat); // trades(1) < min_trades(3)
    }

    #[test]
    fn snapshot_mode_extra_request_id_detected_by_token_count() {
        let params = VParams::default();
        let ev_subscribe = parse_line("A:090000000:100.00:001:002:10:1234:0:A:0", params.bar_sec);
        let ev_snapshot = parse_line("A:090000000:100.00:001:002:10:1234:9999:0:A:0", params.bar_sec);
        let (VEvent::Trade { trade: t1, .. }, VEvent::Trade { trade: t2, .. }) = (ev_subscribe, ev_snapshot) else {
            panic!("expected trades")
        };
        assert_eq!(t1.aggressor, Aggressor::Buy);
        assert_eq!(t2.aggressor, Aggressor::Buy);
        assert_eq!(t1.price, t2.price);
    }

    #[test]
    fn ohlc_and_volume_split_across_multiple_trades() {
        let params = VParams { bar_sec: 1, min_trades: 1, ..Default::default() };
        let mut st = SymbolState::new("X", &params);
        let trade = |t: &str, px: f64, qty: f64, aggr: &str| Trade {
            bar_start_sec: hhmmssmmm_to_bar_start_sec(t, 1).unwrap(),
            price: px,
            qty,
            aggressor: Aggressor::from_tag(aggr),
        };
        st.apply_trade(&params, &trade("090000000", 100.0, 5.0, "A"));
        st.apply_trade(&params, &trade("090000500", 101.0, 3.0, "V"));
        st.apply_trade(&params, &trade("090000900", 99.5, 2.0, "A"));
        let row = st.flush(&params).unwrap();
        assert_eq!(row.open, 100.0);
        assert_eq!(row.high, 101.0);
        assert_eq!(row.low, 99.5);
        assert_eq!(row.close, 99.5);
        assert_eq!(row.buy_vol, 7.0);
        assert_eq!(row.sell_vol, 3.0);
        assert_eq!(row.delta, 4.0);
        assert!((row.imbalance - 0.4).abs() < 1e-9);
    }

    #[test]
    fn late_trade_is_dropped_and_counted() {
        let params = VParams { bar_sec: 1, min_trades: 1, ..Default::default() };
        let mut st = SymbolState::new("X", &params);
        let t0 = Trade { bar_start_sec: 10, price: 100.0, qty: 1.0, aggressor: Aggressor::Buy };
        let t_late = Trade { bar_start_sec: 9, price: 100.0, qty: 1.0, aggressor: Aggressor::Buy };
        st.apply_trade(&params, &t0);
        assert!(st.apply_trade(&params, &t_late).is_none());
        assert_eq!(st.late_events, 1);
    }

    #[test]
    fn new_bar_crossing_emits_previous_bar() {
        let params = VParams { bar_sec: 1, min_trades: 1, ..Default::default() };
        let mut st = SymbolState::new("X", &params);
        let t0 = Trade { bar_start_sec: 10, price: 100.0, qty: 1.0, aggressor: Aggressor::Buy };
        let t1 = Trade { bar_start_sec: 11, price: 101.0, qty: 1.0, aggressor: Aggressor::Buy };
        assert!(st.apply_trade(&params, &t0).is_none());
        let closed = st.apply_trade(&params, &t1).unwrap();
        assert_eq!(closed.bar_start_sec, 10);
        assert_eq!(closed.close, 100.0);
    }

    #[test]
    fn reset_clears_bar_and_ema_without_emitting() {
        let params = VParams { bar_sec: 1, min_trades: 1, ..Default::default() };
        let mut st = SymbolState::new("X", &params);
        let t0 = Trade { bar_start_sec: 10, price: 100.0, qty: 1.0, aggressor: Aggressor::Buy };
        st.apply_trade(&params, &t0);
        st.apply_reset(&params);
        assert!(st.flush(&params).is_none());
    }

    #[test]
    fn bust_is_counted_and_does_not_touch_the_bar() {
        let params = VParams { bar_sec: 1, min_trades: 1, ..Default::default() };
        let mut st = SymbolState::new("X", &params);
        let t0 = Trade { bar_start_sec: 10, price: 100.0, qty: 5.0, aggressor: Aggressor::Buy };
        st.apply_trade(&params, &t0);
        st.apply_bust();
        assert_eq!(st.busts, 1);
        let row = st.flush(&params).unwrap();
        assert_eq!(row.buy_vol, 5.0);
    }

    #[test]
    fn malformed_trade_still_carries_symbol_for_bad_line_attribution() {
        // qty <= 0 is rejected after the symbol and op are already known.
        let ev = parse_line("X:A:090000000:100.00:001:002:0:1234:0:A:0", 1);
        let VEvent::Bad(Some(sym)) = ev else { panic!("expected bad with symbol") };
        assert_eq!(sym, "X");
    }

    #[test]
    fn unparseable_symbol_yields_bad_without_symbol() {
        let ev = parse_line("", 1);
        let VEvent::Bad(None) = ev else { panic!("expected bad without symbol") };
    }
}
