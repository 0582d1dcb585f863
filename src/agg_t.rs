//! Ticker-field aggregator: builds per-second bars from sparse field
//! updates with carry-forward semantics. See `spec.md` §4.7.
use crate::ema::sign;

/// Recognized field indices; anything else is ignored (per §4.7).
pub mod field {
    pub const LAST: u32 = 2;
    pub const BID: u32 = 3;
    pub const ASK: u32 = 4;
    pub const TRADE_QTY_CUR: u32 = 6;
    pub const TRADE_QTY_LAST: u32 = 7;
    pub const CUM_TRADES: u32 = 8;
    pub const CUM_VOL: u32 = 9;
    pub const CUM_FINANCIAL: u32 = 10;
    pub const BID_QTY1: u32 = 19;
    pub const ASK_QTY1: u32 = 20;
    pub const VARIATION: u32 = 21;
    pub const STATUS: u32 = 67;
    pub const PHASE: u32 = 88;
    pub const TICK_DIRECTION: u32 = 106;
    pub const EVENT_TS: u32 = 142;
    pub const TRADE_TS: u32 = 143;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Buy,
    Sell,
    Hold,
}

impl Decision {
    pub fn as_str(self) -> &'static str {
        match self {
            Decision::Buy => "BUY",
            Decision::Sell => "SELL",
            Decision::Hold => "HOLD",
        }
    }
}

#[derive(Debug, Clone)]
pub struct TParams {
    pub bar_sec: i64,
    pub tickdir_th: i64,
    pub imb_th: f64,
    pub micro_th: f64,
    pub enter_th: f64,
    pub keep_th: f64,
    pub max_spread: f64,
    pub require_trade: bool,
    pub min_vol: f64,
}

impl Default for TParams {
    fn default() -> TParams {
        TParams {
            bar_sec: 1,
            tickdir_th: 2,
            imb_th: 0.2,
            micro_th: 0.01,
            enter_th: 1.5,
            keep_th: 1.0,
            max_spread: 0.5,
            require_trade: false,
            min_vol: 0.0,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TBarRow {
    pub bar_start_ms: i64,
    pub had_update: bool,
    pub carry_forward: bool,
    pub day_reset: bool,
    pub last: Option<f64>,
    pub bid: Option<f64>,
    pub ask: Option<f64>,
    pub bid_qty1: Option<f64>,
    pub ask_qty1: Option<f64>,
    pub d_trades: f64,
    pub d_vol: f64,
    pub d_fin: f64,
    pub tick_dir_sum: i64,
    pub tick_dir_agg: f64,
    pub imb1: f64,
    pub micro_dev: f64,
    pub s_lr: f64,
    pub s_tick: f64,
    pub signed_vol: f64,
    pub delay_ms: i64,
    pub score: f64,
    pub last_decision: Decision,
}

#[derive(Debug, Clone, Default)]
pub struct SymbolState {
    symbol: String,
    last: Option<f64>,
    bid: Option<f64>,
    ask: Option<f64>,
    bid_qty1: Option<f64>,
    ask_qty1: Option<f64>,
    prev_last_cross_bar: Option<f64>,

    cum_trades: Option<f64>,
    cum_vol: Option<f64>,
    cum_financial: Option<f64>,
    prev_cum_trades: f64,
    prev_cum_vol: f64,
    prev_cum_financial: f64,

    had_update: bool,
    tick_dir_sum: i64,
    event_ts_ms: Option<i64>,
    trade_ts_ms: Option<i64>,

    pub bad_lines: u64,
    pub ignored_fields: u64,
    last_decision_dir: Decision,
}

impl SymbolState {
    pub fn new(symbol: &str) -> SymbolState {
        SymbolState { symbol: symbol.to_string(), last_decision_dir: Decision::Hold, ..Default::default() }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    /// Apply one `(idx, val)` pair from a `T:` payload.
    pub fn apply_field(&mut self, idx: u32, val: f64) {
        self.had_update = true;
        match idx {
            field::LAST => self.last = Some(val),
            field::BID => self.bid = Some(val),
            field::ASK => self.ask = Some(val),
            field::BID_QTY1 => self.bid_qty1 = Some(val),
            field::ASK_QTY1 => self.ask_qty1 = Some(val),
            field::CUM_TRADES => self.cum_trades = Some(val),
            field::CUM_VOL => self.cum_vol = Some(val),
            field::CUM_FINANCIAL => self.cum_financial = Some(val),
            field::TICK_DIRECTION => {
                if val > 0.0 {
                    self.tick_dir_sum += 1;
                } else if val < 0.0 {
                    self.tick_dir_sum -= 1;
                }
            }
            field::EVENT_TS => self.event_ts_ms = hhmmssmmm_to_ms(val),
            field::TRADE_TS => self.trade_ts_ms = hhmmssmmm_to_ms(val),
            field::TRADE_QTY_CUR | field::TRADE_QTY_LAST | field::VARIATION | field::STATUS | field::PHASE => {
                // carried via had_update only; not independently modeled as a
                // signal input, matching §4.7's field list (recognized but
                // not all feed the scoring formula).
            }
            _ => self.ignored_fields += 1,
        }
    }

    /// Close out the current bar and compute the full feature/decision row.
    /// `bar_start_ms`/`now_ms` are exchange-local milliseconds-since-midnight;
    /// `read_ms` is the local wall-clock time the flush happened, used for
    /// `delay_ms`.
    pub fn flush_bar(&mut self, params: &TParams, bar_start_ms: i64, write_ts_ms: i64, read_ms: i64) -> TBarRow {
        let carry_forward = !self.had_update;

        let (d_trades, day_reset_t) = self.cum_delta(self.cum_trades, self.prev_cum_trades);
        let (d_vol, day_reset_v) = self.cum_delta(self.cum_vol, self.prev_cum_vol);
        let (d_fin, day_reset_f) = self.cum_delta(self.cum_financial, self.prev_cum_financial);
        let day_reset = day_reset_t || day_reset_v || day_reset_f;

        if let Some(c) = self.cum_trades {
            self.prev_cum_trades = c;
        }
        if let Some(c) = self.cum_vol {
            self.prev_cum_vol = c;
        }
        if let Some(c) = self.cum_financial {
            self.prev_cum_financial = c;
        }

        let tick_dir_sum = self.tick_dir_sum;
        let tick_dir_agg = if tick_dir_sum.unsigned_abs() as i64 >= params.tickdir_th {
            sign(tick_dir_sum as f64)
        } else {
            0.0
        };

        let mid = match (self.bid, self.ask) {
            (Some(b), Some(a)) => Some((b + a) / 2.0),
            _ => None,
        };
        let spread = match (self.bid, self.ask) {
            (Some(b), Some(a)) => a - b,
            _ => 0.0,
        };
        let microprice = match (self.bid, self.ask, self.bid_qty1, self.ask_qty1) {
            (Some(b), Some(a), Some(bq), Some(aq)) if bq + aq > 0.0 => Some((b * aq + a * bq) / (bq + aq)),
            _ => None,
        };
        let imb1 = match (self.bid_qty1, self.ask_qty1) {
            (Some(bq), Some(aq)) if bq + aq > 0.0 => (bq - aq) / (bq + aq),
            _ => 0.0,
        };
        let micro_dev = match (microprice, mid) {
            (Some(mp), Some(m)) => mp - m,
            _ => 0.0,
        };

        let s_lr = match (self.last, mid) {
            (Some(l), Some(m)) => sign(l - m),
            _ => 0.0,
        };
        let s_tick = match (self.last, self.prev_last_cross_bar) {
            (Some(l), Some(pl)) => sign(l - pl),
            _ => 0.0,
        };
        let had_trade = d_vol > 0.0;
        let signed_vol = s_lr * d_vol;

        let score = (if imb1.abs() >= params.imb_th { sign(imb1) } else { 0.0 })
            + (if micro_dev.abs() >= params.micro_th { sign(micro_dev) } else { 0.0 })
            + tick_dir_agg * 0.8
            + s_tick * 0.6
            + s_lr * 0.6
            + (if had_trade { sign(signed_vol) } else { 0.0 }) * 0.5;

        let blocked = spread > params.max_spread
            || (params.require_trade && !had_trade)
            || d_vol < params.min_vol
            || self.last.is_none()
            || mid.is_none();

        let decision = if blocked {
            Decision::Hold
        } else {
            let enter = if self.last_decision_dir == Decision::Buy { params.keep_th } else { params.enter_th };
            let enter_sell = if self.last_decision_dir == Decision::Sell { params.keep_th } else { params.enter_th };
            if score >= enter {
                Decision::Buy
            } else if score <= -enter_sell {
                Decision::Sell
            } else {
                Decision::Hold
            }
        };
        self.last_decision_dir = decision;

        let latest_ts = [self.event_ts_ms, self.trade_ts_ms, Some(write_ts_ms)].into_iter().flatten().max().unwrap_or(write_ts_ms);
        let delay_ms = read_ms - latest_ts;

        if self.last.is_some() {
            self.prev_last_cross_bar = self.last;
        }
        self.had_update = false;
        self.tick_dir_sum = 0;

        TBarRow {
            bar_start_ms,
            had_update: !carry_forward,
            carry_forward,
            day_reset,
            last: self.last,
            bid: self.bid,
            ask: self.ask,
            bid_qty1: self.bid_qty1,
            ask_qty1: self.ask_qty1,
            d_trades,
            d_vol,
            d_fin,
            tick_dir_sum,
            tick_dir_agg,
            imb1,
            micro_dev,
            s_lr,
            s_tick,
            signed_vol,
            delay_ms,
            score,
            last_decision: decision,
        }
    }

    fn cum_delta(&self, cur: Option<f64>, prev: f64) -> (f64, bool) {
        match cur {
            Some(c) if c < prev => (0.0, true),
            Some(c) => (c - prev, false),
            None => (0.0, false),
        }
    }
}

/// Outcome of parsing a single `T:<sym>:<skip>:(<idx>:<val>)+!` payload.
///
/// `Bad` still carries the symbol when it could be read before the field
/// list turned out malformed, so the caller can attribute the drop to that
/// symbol's `bad_lines` counter instead of discarding it with no target
/// (per §7: "Parse error -> increment `bad` counter; skip record").
pub enum TEvent {
    Fields(String, Vec<(u32, f64)>),
    Bad(Option<String>),
}

pub fn parse_line(op_and_args: &str) -> TEvent {
    let trimmed = op_and_args.trim_end_matches('!');
    let mut parts = trimmed.split(':');
    let symbol = match parts.next() {
        Some(s) if !s.is_empty() => s.to_string(),
        _ => return TEvent::Bad(None),
    };
    let _skip = parts.next();
    let rest: Vec<&str> = parts.collect();
    let mut fields = Vec::new();
    let mut i = 0;
    while i + 1 < rest.len() + 1 && i + 1 <= rest.len() {
        if i + 1 >= rest.len() {
            break;
        }
        let Some(idx) = rest[i].parse::<u32>().ok() else { return TEvent::Bad(Some(symbol)) };
        let Some(val) = rest[i + 1].parse::<f64>().ok() else { return TEvent::Bad(Some(symbol)) };
        fields.push((idx, val));
        i += 2;
    }
    TEvent::Fields(symbol, fields)
}

fn hhmmssmmm_to_ms(val: f64) -> Option<i64> {
    let v = val as i64;
    if v < 0 {
        return None;
    }
    let hh = v / 10_000_000;
    let mm = (v / 100_000) % 100;
    let ss = (v / 1_000) % 100;
    let mmm = v % 1_000;
    if hh > 23 || mm > 59 || ss > 59 {
        return None;
    }
    Some(((hh * 3600 + mm * 60 + ss) * 1000) + mmm)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_line_field_pairs() {
        let TEvent::Fields(sym, fields) = parse_line("PETR4:0:2:10.5:3:10.4!") else { panic!("expected fields") };
        assert_eq!(sym, "PETR4");
        assert_eq!(fields, vec![(2, 10.5), (3, 10.4)]);
    }

    #[test]
    fn parse_line_bad_field_still_carries_symbol() {
        let TEvent::Bad(Some(sym)) = parse_line("PETR4:0:2:not_a_number!") else { panic!("expected bad with symbol") };
        assert_eq!(sym, "PETR4");
    }

    #[test]
    fn parse_line_bad_without_symbol_when_payload_is_empty() {
        let TEvent::Bad(None) = parse_line("") else { panic!("expected bad without symbol") };
    }

    #[test]
    fn carry_forward_scenario_from_spec() {
        let params = TParams::default();
        let mut st = SymbolState::new("X");
        st.apply_field(field::LAST, 100.0);
        let row1 = st.flush_bar(&params, 0, 0, 0);
        assert!(!row1.carry_forward);
        assert_eq!(row1.last, Some(100.0));

        // second bar: no updates at all
        let row2 = st.flush_bar(&params, 1000, 1000, 1000);
        assert!(row2.carry_forward);
        assert_eq!(row2.last, Some(100.0));
        assert_eq!(row2.d_trades, 0.0);
        assert_eq!(row2.d_vol, 0.0);
    }

    #[test]
    fn cumulative_to_delta_and_day_reset() {
        let params = TParams::default();
        let mut st = SymbolState::new("X");
        st.apply_field(field::CUM_VOL, 100.0);
        let row1 = st.flush_bar(&params, 0, 0, 0);
        assert_eq!(row1.d_vol, 100.0);
        assert!(!row1.day_reset);

        st.apply_field(field::CUM_VOL, 150.0);
        let row2 = st.flush_bar(&params, 1000, 1000, 1000);
        assert_eq!(row2.d_vol, 50.0);

        // day reset: new cumulative lower than previous
        st.apply_field(field::CUM_VOL, 10.0);
        let row3 = st.flush_bar(&params, 2000, 2000, 2000);
        assert!(row3.day_reset);
        assert_eq!(row3.d_vol, 0.0);
    }

    #[test]
    fn tick_direction_aggregation_threshold() {
        let params = TParams { tickdir_th: 2, ..Default::default() };
        let mut st = SymbolState::new("X");
        st.apply_field(field::TICK_DIRECTION, 1.0);
        let row = st.flush_bar(&params, 0, 0, 0);
        assert_eq!(row.tick_dir_agg, 0.0); // |sum|=1 < threshold

        st.apply_field(field::TICK_DIRECTION, 1.0);
        st.apply_field(field::TICK_DIRECTION, 1.0);
        let row = st.flush_bar(&params, 1000, 1000, 1000);
        assert_eq!(row.tick_dir_agg, 1.0); // |sum|=2 >= threshold
    }

    #[test]
    fn delay_uses_latest_of_event_trade_write_ts() {
        let params = TParams::default();
        let mut st = SymbolState::new("X");
        st.apply_field(field::LAST, 1.0);
        st.apply_field(field::EVENT_TS, 90000500.0); // 09:00:00.500
        let row = st.flush_bar(&params, 0, 32400000, 32401000); // read 1000ms later
        assert_eq!(row.delay_ms, 32401000 - 32400500);
    }
}
