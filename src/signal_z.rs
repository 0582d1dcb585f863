//! Z signal engine: per-second imbalance/microprice features plus the
//! persistence/cooldown decision pipeline. See `spec.md` §4.9.
//!
//! Persistence and cooldown form a Moore machine with states
//! `{Idle, Building(dir, count), Armed(dir)}` per `spec.md` §9's design
//! note; [`ZSignalEngine`] tracks it with `persist_dir`/`persist_count` and
//! `last_entry_*` rather than an explicit enum, since the only externally
//! observable transition is "entry fired", which the caller gets as
//! `Some(Direction)` from [`ZSignalEngine::step`].
use crate::book_z::{Side, ZBook};
use crate::ema::{sign, Ema, RollingZ};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Buy,
    Sell,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Buy => "BUY",
            Direction::Sell => "SELL",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ZSignalParams {
    pub levels: usize,
    pub imb_ema_period: u32,
    pub spread_ema_period: u32,
    pub zwin: usize,
    pub min_warmup: usize,
    pub score_th: f64,
    pub require_sign: bool,
    pub persist_n: u32,
    pub cooldown_sec: i64,
}

impl Default for ZSignalParams {
    fn default() -> ZSignalParams {
        ZSignalParams {
            levels: 5,
            imb_ema_period: 5,
            spread_ema_period: 30,
            zwin: 60,
            min_warmup: 30,
            score_th: 1.5,
            require_sign: true,
            persist_n: 3,
            cooldown_sec: 30,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ZSignalOutput {
    pub imb: f64,
    pub imb_ema_5: f64,
    pub spread: f64,
    pub spread_ema_30: f64,
    pub mid: f64,
    pub mid_chg_3: f64,
    pub z_imb: f64,
    pub z_mid: f64,
    pub score: f64,
    pub entry: Option<Direction>,
    pub block_reason: String,
}

pub struct ZSignalEngine {
    params: ZSignalParams,
    imb_ema: Ema,
    spread_ema: Ema,
    min_spread: f64,
    mid_ring: HashMap<i64, f64>,
    z_imb: RollingZ,
    z_mid: RollingZ,
    last_d3_sec: Option<i64>,
    persist_dir: Option<Direction>,
    persist_count: u32,
    last_entry_sec: Option<i64>,
    last_entry_dir: Option<Direction>,
}

impl ZSignalEngine {
    pub fn new(params: ZSignalParams) -> ZSignalEngine {
        let zwin = params.zwin;
        ZSignalEngine {
            imb_ema: Ema::new(params.imb_ema_period),
            spread_ema: Ema::new(params.spread_ema_period),
            min_spread: f64::INFINITY,
            mid_ring: HashMap::new(),
            z_imb: RollingZ::new(zwin),
            z_mid: RollingZ::new(zwin),
            last_d3_sec: None,
            persist_dir: None,
            persist_count: 0,
            last_entry_sec: None,
            last_entry_dir: None,
            params,
        }
    }

    /// Record that a `D:3` (full clear) happened at `sec`; blocks entries
    /// for the following 2 seconds.
    pub fn on_clear(&mut self, sec: i64) {
        self.last_d3_sec = Some(sec);
    }

    /// Advance the engine by one second-resolution snapshot.
    pub fn step(&mut self, sec: i64, book: &ZBook) -> ZSignalOutput {
        let mut block: Option<&'static str> = None;

        if !book.book_ready() {
            block = Some("book_not_ready");
        }

        let (bid, ask) = (book.best_bid(), book.best_ask());
        let (mid, spread) = match (bid, ask) {
            (Some(b), Some(a)) => ((b.price + a.price) / 2.0, a.price - b.price),
            _ => (0.0, 0.0),
        };

        if block.is_none() && spread > 0.0 && spread < self.min_spread {
            self.min_spread = spread;
        }

        let bid_q = book.top_qty(Side::Bid, self.params.levels);
        let ask_q = book.top_qty(Side::Ask, self.params.levels);
        let imb = if bid_q + ask_q > 0.0 { (bid_q - ask_q) / (bid_q + ask_q) } else { 0.0 };

        let imb_ema_5 = self.imb_ema.update(imb);
        let spread_ema_30 = if block.is_none() { self.spread_ema.update(spread) } else { self.spread_ema.value() };

        // Keyed by second-of-day rather than step count: `mid_chg_3` is only
        // defined when a snapshot exists for exactly `sec - 3`, matching
        // `original_source/parsers/parser_Z.c`'s `midring_get`. A gap second
        // (no `Z:` line at all, e.g. pre-open or an illiquid contract) must
        // not silently become "3 snapshots ago" — it falls back to 0.0.
        self.mid_ring.insert(sec, mid);
        self.mid_ring.retain(|&k, _| k >= sec - 3);
        let mid_chg_3 = self.mid_ring.get(&(sec - 3)).map_or(0.0, |prev| mid - prev);

        if block.is_none() {
            self.z_imb.push(imb_ema_5);
            self.z_mid.push(mid_chg_3);
        }
        let z_imb = self.z_imb.z_score(imb_ema_5);
        let z_mid = self.z_mid.z_score(mid_chg_3);
        let score = 0.75 * z_imb + 0.25 * z_mid;

        if block.is_none() && self.z_imb.len() < self.params.min_warmup {
            block = Some("warmup");
        }

        let max_spread = (1.8 * spread_ema_30).max(2.0 * self.min_spread);
        if block.is_none() && spread > max_spread {
            block = Some("spread");
        }

        if block.is_none() {
            if let Some(d3) = self.last_d3_sec {
                if sec - d3 < 2 {
                    block = Some("d3_recency");
                }
            }
        }

        let mut decision: Option<Direction> = None;
        if block.is_none() {
            if score.abs() < self.params.score_th {
                block = Some("score");
            } else {
                decision = Some(if score > 0.0 { Direction::Buy } else { Direction::Sell });
            }
        }

        if block.is_none() {
            if let Some(d) = decision {
                if self.params.require_sign {
                    let want = if d == Direction::Buy { 1.0 } else { -1.0 };
                    if sign(imb_ema_5) != want || sign(mid_chg_3) != want {
                        block = Some("sign_disagreement");
                        decision = None;
                    }
                }
            }
        }

        let mut entry = None;
        if block.is_none() {
            match decision {
                Some(d) => {
                    if self.persist_dir == Some(d) {
                        self.persist_count += 1;
                    } else {
                        self.persist_dir = Some(d);
                        self.persist_count = 1;
                    }
                    if self.persist_count >= self.params.persist_n {
                        let cooling_down = match self.last_entry_sec {
                            Some(last) => sec - last < self.params.cooldown_sec,
                            None => false,
                        };
                        let same_dir_as_last = self.last_entry_dir == Some(d);
                        if cooling_down || same_dir_as_last {
                            block = Some("cooldown");
                        } else {
                            entry = Some(d);
                            self.last_entry_sec = Some(sec);
                            self.last_entry_dir = Some(d);
                        }
                    } else {
                        block = Some("persistence");
                    }
                }
                None => {
                    self.persist_dir = None;
                    self.persist_count = 0;
                }
            }
        } else {
            self.persist_dir = None;
            self.persist_count = 0;
        }

        ZSignalOutput {
            imb,
            imb_ema_5,
            spread,
            spread_ema_30,
            mid,
            mid_chg_3,
            z_imb,
            z_mid,
            score,
            entry,
            block_reason: block.unwrap_or("none").to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::book_z::apply_line;

    fn ready_book() -> ZBook {
        let mut b = ZBook::new(5);
        apply_line(&mut b, "A:0:A:10.0:10:1").unwrap();
        apply_line(&mut b, "A:0:V:10.1:2:1").unwrap();
        b
    }

    #[test]
    fn blocks_when_book_not_ready() {
        let mut eng = ZSignalEngine::new(ZSignalParams::default());
        let b = ZBook::new(5);
        let out = eng.step(1, &b);
        assert_eq!(out.block_reason, "book_not_ready");
        assert!(out.entry.is_none());
    }

    #[test]
    fn blocks_during_warmup() {
        let mut eng = ZSignalEngine::new(ZSignalParams { min_warmup: 5, ..Default::default() });
        let b = ready_book();
        for i in 0..4 {
            let out = eng.step(i, &b);
            assert_eq!(out.block_reason, "warmup");
        }
    }

    #[test]
    fn persistence_then_cooldown_scenario_from_spec() {
        let mut eng = ZSignalEngine::new(ZSignalParams {
            min_warmup: 1,
            persist_n: 3,
            cooldown_sec: 30,
            score_th: 0.0,
            require_sign: false,
            ..Default::default()
        });
        let b = ready_book(); // imb positive => score should be positive => BUY
        let mut last_entry_sec = None;
        for sec in 0..3 {
            let out = eng.step(sec, &b);
            if sec == 2 {
                assert_eq!(out.entry, Some(Direction::Buy));
                last_entry_sec = Some(sec);
            } else {
                assert!(out.entry.is_none());
            }
        }
        assert_eq!(last_entry_sec, Some(2));

        // subsequent BUY before cooldown elapses is blocked
        for sec in 3..6 {
            let out = eng.step(sec, &b);
            assert_eq!(out.block_reason, "cooldown");
            assert!(out.entry.is_none());
        }
    }

    #[test]
    fn d3_recency_blocks_for_two_seconds() {
        let mut eng = ZSignalEngine::new(ZSignalParams { min_warmup: 1, score_th: 0.0, require_sign: false, ..Default::default() });
        let b = ready_book();
        eng.step(0, &b);
        eng.on_clear(1);
        let out = eng.step(2, &b);
        assert_eq!(out.block_reason, "d3_recency");
        let out = eng.step(4, &b);
        assert_ne!(out.block_reason, "d3_recency");
    }

    #[test]
    fn mid_chg_3_is_zero_across_a_gap_second_not_three_steps_ago() {
        let mut eng = ZSignalEngine::new(ZSignalParams::default());
        let b = ready_book();
        eng.step(0, &b);
        eng.step(1, &b);
        // second 2 has no Z: line at all (e.g. pre-open or illiquid contract):
        // step() is simply never called for it, leaving a hole at sec=2.
        let out = eng.step(5, &b);
        // sec=5 looks up sec-3=2, which was never recorded, so mid_chg_3 must
        // fall back to 0.0 rather than diffing against the 3rd-most-recent
        // call (sec=1), which is actually 4 seconds stale.
        assert_eq!(out.mid_chg_3, 0.0);
    }

    #[test]
    fn mid_chg_3_looks_up_the_snapshot_from_exactly_three_seconds_ago() {
        let mut eng = ZSignalEngine::new(ZSignalParams::default());
        let mut b = ZBook::new(5);
        apply_line(&mut b, "A:0:A:10.0:10:1").unwrap();
        apply_line(&mut b, "A:0:V:10.1:2:1").unwrap();
        eng.step(0, &b); // mid = 10.05

        apply_line(&mut b, "U:0:A:10.5:10:1").unwrap(); // mid = 10.3
        let out = eng.step(3, &b);
        assert!((out.mid_chg_3 - 0.25).abs() < 1e-9);
    }
}
