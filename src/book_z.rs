//! Level-aggregated order book reconstructor. See `spec.md` §4.5.
//!
//! Each side is a fixed-depth array of [`Level`]; positional `A`/`U` write a
//! slot directly (the producer has already shifted deeper levels by its own
//! convention), `D:1` shifts one slot out, and `D:3` clears both sides.
//! Out-of-range positions are dropped silently and counted as `bad`.
use anyhow::Result;

#[derive(Debug, Clone, Copy, Default)]
pub struct Level {
    pub price: f64,
    pub qty: f64,
    pub n_orders: i64,
    pub valid: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Bid,
    Ask,
}

impl Side {
    fn from_tag(tag: &str) -> Option<Side> {
        match tag {
            "A" => Some(Side::Bid),
            "V" => Some(Side::Ask),
            _ => None,
        }
    }
}

/// What a parsed `Z:` line did to the book; used by callers (CSV emission,
/// the signal engine's D:3-recency block) to react without re-parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZOutcome {
    Add,
    Update,
    DeleteOne,
    Clear,
    Heartbeat,
    Bad,
    Ignored,
}

#[derive(Debug, Clone)]
pub struct ZBook {
    pub depth: usize,
    pub bids: Vec<Level>,
    pub asks: Vec<Level>,
}

impl ZBook {
    pub fn new(depth: usize) -> ZBook {
        ZBook { depth, bids: vec![Level::default(); depth], asks: vec![Level::default(); depth] }
    }

    fn side_mut(&mut self, side: Side) -> &mut Vec<Level> {
        match side {
            Side::Bid => &mut self.bids,
            Side::Ask => &mut self.asks,
        }
    }

    fn in_range(&self, pos: i64) -> Option<usize> {
        if pos < 0 || pos as usize >= self.depth {
            None
        } else {
            Some(pos as usize)
        }
    }

    pub fn add(&mut self, side: Side, pos: i64, price: f64, qty: f64, n_orders: i64) -> bool {
        let Some(idx) = self.in_range(pos) else { return false };
        self.side_mut(side)[idx] = Level { price, qty, n_orders, valid: true };
        true
    }

    pub fn update(&mut self, side: Side, pos: i64, price: f64, qty: f64, n_orders: i64) -> bool {
        self.add(side, pos, price, qty, n_orders)
    }

    pub fn delete_one(&mut self, side: Side, pos: i64) -> bool {
        let Some(idx) = self.in_range(pos) else { return false };
        let arr = self.side_mut(side);
        for i in idx..arr.len() - 1 {
            arr[i] = arr[i + 1];
        }
        *arr.last_mut().unwrap() = Level::default();
        true
    }

    pub fn clear(&mut self) {
        self.bids.iter_mut().for_each(|l| *l = Level::default());
        self.asks.iter_mut().for_each(|l| *l = Level::default());
    }

    pub fn best_bid(&self) -> Option<Level> {
        self.bids.first().copied().filter(|l| l.valid)
    }

    pub fn best_ask(&self) -> Option<Level> {
        self.asks.first().copied().filter(|l| l.valid)
    }

    pub fn book_ready(&self) -> bool {
        self.best_bid().is_some() && self.best_ask().is_some()
    }

    /// Sum of quantity over the top `n` valid levels of a side.
    pub fn top_qty(&self, side: Side, n: usize) -> f64 {
        self.side_ref(side).iter().take(n).filter(|l| l.valid).map(|l| l.qty).sum()
    }

    fn side_ref(&self, side: Side) -> &Vec<Level> {
        match side {
            Side::Bid => &self.bids,
            Side::Ask => &self.asks,
        }
    }
}

/// Parse and apply a single `Z:<sym>:<op>:...` payload (the `Z:<sym>:` prefix
/// already stripped; `op_and_args` is everything after the symbol).
pub fn apply_line(book: &mut ZBook, op_and_args: &str) -> Result<ZOutcome> {
    let mut it = op_and_args.split(':');
    let op = match it.next() {
        Some(o) => o,
        None => return Ok(ZOutcome::Bad),
    };

    match op {
        "A" | "U" => {
            let pos: i64 = match it.next().and_then(|s| s.parse().ok()) {
                Some(v) => v,
                None => return Ok(ZOutcome::Bad),
            };
            let side = match it.next().and_then(Side::from_tag) {
                Some(s) => s,
                None => return Ok(ZOutcome::Bad),
            };
            let price: f64 = match it.next().and_then(|s| s.parse().ok()) {
                Some(v) => v,
                None => return Ok(ZOutcome::Bad),
            };
            let qty: f64 = match it.next().and_then(|s| s.parse().ok()) {
                Some(v) => v,
                None => return Ok(ZOutcome::Bad),
            };
            let n_orders: i64 = it.next().and_then(|s| s.parse().ok()).unwrap_or(0);

            let ok = if op == "A" {
                book.add(side, pos, price, qty, n_orders)
            } else {
                book.update(side, pos, price, qty, n_orders)
            };
            Ok(if ok {
                if op == "A" { ZOutcome::Add } else { ZOutcome::Update }
            } else {
                ZOutcome::Bad
            })
        }
        "D" => {
            let variant = it.next().unwrap_or("");
            match variant {
                "1" => {
                    let side = match it.next().and_then(Side::from_tag) {
                        Some(s) => s,
                        None => return Ok(ZOutcome::Bad),
                    };
                    let pos: i64 = match it.next().and_then(|s| s.parse().ok()) {
                        Some(v) => v,
                        None => return Ok(ZOutcome::Bad),
                    };
                    Ok(if book.delete_one(side, pos) { ZOutcome::DeleteOne } else { ZOutcome::Bad })
                }
                "3" => {
                    book.clear();
                    Ok(ZOutcome::Clear)
                }
                _ => Ok(ZOutcome::Bad),
            }
        }
        "E" => Ok(ZOutcome::Heartbeat),
        _ => Ok(ZOutcome::Ignored),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_and_read_best() {
        let mut b = ZBook::new(5);
        assert_eq!(apply_line(&mut b, "A:0:A:10.0:5:1").unwrap(), ZOutcome::Add);
        assert_eq!(apply_line(&mut b, "A:0:V:10.1:3:1").unwrap(), ZOutcome::Add);
        assert!(b.book_ready());
        assert_eq!(b.best_bid().unwrap().price, 10.0);
        assert_eq!(b.best_ask().unwrap().price, 10.1);
    }

    #[test]
    fn update_overwrites_slot() {
        let mut b = ZBook::new(5);
        apply_line(&mut b, "A:0:A:10.0:5:1").unwrap();
        apply_line(&mut b, "U:0:A:10.0:9:2").unwrap();
        assert_eq!(b.best_bid().unwrap().qty, 9.0);
        assert_eq!(b.best_bid().unwrap().n_orders, 2);
    }

    #[test]
    fn delete_one_shifts_left() {
        let mut b = ZBook::new(3);
        apply_line(&mut b, "A:0:A:10.0:1:1").unwrap();
        apply_line(&mut b, "A:1:A:9.5:1:1").unwrap();
        apply_line(&mut b, "A:2:A:9.0:1:1").unwrap();
        assert_eq!(apply_line(&mut b, "D:1:A:0").unwrap(), ZOutcome::DeleteOne);
        assert_eq!(b.bids[0].price, 9.5);
        assert_eq!(b.bids[1].price, 9.0);
        assert!(!b.bids[2].valid);
    }

    #[test]
    fn clear_resets_both_sides() {
        let mut b = ZBook::new(3);
        apply_line(&mut b, "A:0:A:10.0:1:1").unwrap();
        apply_line(&mut b, "A:0:V:10.1:1:1").unwrap();
        assert_eq!(apply_line(&mut b, "D:3").unwrap(), ZOutcome::Clear);
        assert!(!b.book_ready());
    }

    #[test]
    fn out_of_range_position_is_bad_and_non_mutating() {
        let mut b = ZBook::new(3);
        assert_eq!(apply_line(&mut b, "A:99:A:10.0:1:1").unwrap(), ZOutcome::Bad);
        assert!(!b.book_ready());
        assert_eq!(apply_line(&mut b, "A:-1:A:10.0:1:1").unwrap(), ZOutcome::Bad);
    }

    #[test]
    fn heartbeat_is_a_noop() {
        let mut b = ZBook::new(3);
        assert_eq!(apply_line(&mut b, "E").unwrap(), ZOutcome::Heartbeat);
        assert!(!b.book_ready());
    }

    #[test]
    fn imbalance_scenario_from_spec() {
        let mut b = ZBook::new(3);
        apply_line(&mut b, "A:0:A:10.0:5:1").unwrap();
        apply_line(&mut b, "A:0:V:10.1:3:1").unwrap();
        let bid = b.best_bid().unwrap();
        let ask = b.best_ask().unwrap();
        let mid = (bid.price + ask.price) / 2.0;
        let imb = (bid.qty - ask.qty) / (bid.qty + ask.qty);
        let microprice = (bid.price * ask.qty + ask.price * bid.qty) / (bid.qty + ask.qty);
        assert!((bid.price - 10.0).abs() < 1e-9);
        assert!((ask.price - 10.1).abs() < 1e-9);
        assert!((mid - 10.05).abs() < 1e-9);
        assert!((imb - 0.25).abs() < 1e-9);
        assert!((microprice - 10.0625).abs() < 1e-9);
    }
}
