//! Order-granularity order book reconstructor with top-of-book OFI
//! accumulation. See `spec.md` §4.6.
use anyhow::Result;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Order {
    pub price: f64,
    pub qty: f64,
    pub broker: i64,
    pub datetime_tag: i64,
    pub order_id: i64,
    pub order_type: i64,
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

/// A dynamic, shift-compacted array of resting orders for one side.
#[derive(Debug, Clone)]
pub struct SideBook {
    pub arr: Vec<Order>,
    pub cap: usize,
}

impl SideBook {
    pub fn new(cap: usize) -> SideBook {
        SideBook { arr: Vec::with_capacity(cap.min(64)), cap }
    }

    pub fn len(&self) -> usize {
        self.arr.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arr.is_empty()
    }

    fn in_range(&self, pos: i64) -> bool {
        pos >= 0 && (pos as usize) < self.cap
    }

    /// Insert at `pos`, pushing everything from `pos` deeper by one slot.
    /// If the side is already at `cap`, the deepest entry is dropped.
    pub fn insert(&mut self, pos: i64, o: Order) -> bool {
        if !self.in_range(pos) {
            return false;
        }
        let pos = (pos as usize).min(self.arr.len());
        self.arr.insert(pos, o);
        if self.arr.len() > self.cap {
            self.arr.truncate(self.cap);
        }
        true
    }

    pub fn remove_at(&mut self, pos: i64) -> bool {
        if pos < 0 || pos as usize >= self.arr.len() {
            return false;
        }
        self.arr.remove(pos as usize);
        true
    }

    /// Remove all entries in `[0..=pos]`, shifting the remainder to the
    /// front ("delete best up to").
    pub fn remove_best_up_to(&mut self, pos: i64) -> bool {
        if pos < 0 {
            return false;
        }
        let pos = pos as usize;
        if pos >= self.arr.len() {
            self.arr.clear();
        } else {
            self.arr.drain(0..=pos);
        }
        true
    }

    pub fn clear(&mut self) {
        self.arr.clear();
    }

    pub fn best(&self) -> Option<Order> {
        self.arr.first().copied()
    }
}

/// Outcome of applying a single `B:` line; used by callers for counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BOutcome {
    Add,
    Update,
    DeleteOne,
    DeleteBestUpTo,
    Clear,
    Bad,
    Ignored,
}

#[derive(Debug, Clone)]
pub struct BBook {
    pub bids: SideBook,
    pub asks: SideBook,
    prev_best_bid: Option<(f64, f64)>,
    prev_best_ask: Option<(f64, f64)>,
    pub ofi_accum: f64,
}

impl BBook {
    pub fn new(cap: usize) -> BBook {
        BBook { bids: SideBook::new(cap), asks: SideBook::new(cap), prev_best_bid: None, prev_best_ask: None, ofi_accum: 0.0 }
    }

    fn side_mut(&mut self, side: Side) -> &mut SideBook {
        match side {
            Side::Bid => &mut self.bids,
            Side::Ask => &mut self.asks,
        }
    }

    pub fn book_ready(&self) -> bool {
        !self.bids.is_empty() && !self.asks.is_empty()
    }

    /// Recompute best bid/ask and fold the top-of-book delta into the OFI
    /// accumulator, per the formula in `spec.md` §4.6. Invalidates the
    /// prior-best state (so the next present-both observation starts a
    /// fresh delta) whenever either side is currently empty.
    fn recompute_ofi(&mut self) {
        let bid = self.bids.best();
        let ask = self.asks.best();

        match (bid, ask, self.prev_best_bid, self.prev_best_ask) {
            (Some(b), Some(a), Some(pb), Some(pa)) => {
                let d_bid = if b.price > pb.0 {
                    b.qty
                } else if b.price == pb.0 {
                    b.qty - pb.1
                } else {
                    -pb.1
                };
                let d_ask = if a.price < pa.0 {
                    -a.qty
                } else if a.price == pa.0 {
                    pa.1 - a.qty
                } else {
                    pa.1
                };
                self.ofi_accum += d_bid + d_ask;
            }
            _ => { /* at least one side missing: no contribution this step */ }
        }

        self.prev_best_bid = bid.map(|b| (b.price, b.qty));
        self.prev_best_ask = ask.map(|a| (a.price, a.qty));
    }
}

/// Parse and apply `op_and_args` (the `B:<sym>:` prefix already stripped).
pub fn apply_line(book: &mut BBook, op_and_args: &str) -> Result<BOutcome> {
    let mut it = op_and_args.split(':');
    let op = match it.next() {
        Some(o) => o,
        None => return Ok(BOutcome::Bad),
    };

    let outcome = match op {
        "A" => {
            let pos: i64 = match it.next().and_then(|s| s.parse().ok()) { Some(v) => v, None => return Ok(BOutcome::Bad) };
            let side = match it.next().and_then(Side::from_tag) { Some(s) => s, None => return Ok(BOutcome::Bad) };
            let price: f64 = match it.next().and_then(|s| s.parse().ok()) { Some(v) => v, None => return Ok(BOutcome::Bad) };
            let qty: f64 = match it.next().and_then(|s| s.parse().ok()) { Some(v) => v, None => return Ok(BOutcome::Bad) };
            let broker: i64 = it.next().and_then(|s| s.parse().ok()).unwrap_or(0);
            let datetime_tag: i64 = it.next().and_then(|s| s.parse().ok()).unwrap_or(0);
            let order_id: i64 = it.next().and_then(|s| s.parse().ok()).unwrap_or(0);
            let order_type: i64 = it.next().and_then(|s| s.parse().ok()).unwrap_or(0);
            let o = Order { price, qty, broker, datetime_tag, order_id, order_type };
            if book.side_mut(side).insert(pos, o) { BOutcome::Add } else { BOutcome::Bad }
        }
        "U" => {
            let pos_new: i64 = match it.next().and_then(|s| s.parse().ok()) { Some(v) => v, None => return Ok(BOutcome::Bad) };
            let pos_old: i64 = match it.next().and_then(|s| s.parse().ok()) { Some(v) => v, None => return Ok(BOutcome::Bad) };
            let side = match it.next().and_then(Side::from_tag) { Some(s) => s, None => return Ok(BOutcome::Bad) };
            let price: f64 = match it.next().and_then(|s| s.parse().ok()) { Some(v) => v, None => return Ok(BOutcome::Bad) };
            let qty: f64 = match it.next().and_then(|s| s.parse().ok()) { Some(v) => v, None => return Ok(BOutcome::Bad) };
            let broker: i64 = it.next().and_then(|s| s.parse().ok()).unwrap_or(0);
            let datetime_tag: i64 = it.next().and_then(|s| s.parse().ok()).unwrap_or(0);
            let order_id: i64 = it.next().and_then(|s| s.parse().ok()).unwrap_or(0);
            let order_type: i64 = it.next().and_then(|s| s.parse().ok()).unwrap_or(0);
            let o = Order { price, qty, broker, datetime_tag, order_id, order_type };

            let sb = book.side_mut(side);
            if pos_new == pos_old {
                if pos_old >= 0 && (pos_old as usize) < sb.len() {
                    sb.arr[pos_old as usize] = o;
                    BOutcome::Update
                } else {
                    BOutcome::Bad
                }
            } else {
                if !sb.remove_at(pos_old) {
                    BOutcome::Bad
                } else {
                    let adj_pos_new = if pos_new > pos_old { pos_new - 1 } else { pos_new };
                    if sb.insert(adj_pos_new, o) { BOutcome::Update } else { BOutcome::Bad }
                }
            }
        }
        "D" => {
            let variant = it.next().unwrap_or("");
            match variant {
                "1" => {
                    let side = match it.next().and_then(Side::from_tag) { Some(s) => s, None => return Ok(BOutcome::Bad) };
                    let pos: i64 = match it.next().and_then(|s| s.parse().ok()) { Some(v) => v, None => return Ok(BOutcome::Bad) };
                    if book.side_mut(side).remove_at(pos) { BOutcome::DeleteOne } else { BOutcome::Bad }
                }
                "2" => {
                    let side = match it.next().and_then(Side::from_tag) { Some(s) => s, None => return Ok(BOutcome::Bad) };
                    let pos: i64 = match it.next().and_then(|s| s.parse().ok()) { Some(v) => v, None => return Ok(BOutcome::Bad) };
                    if book.side_mut(side).remove_best_up_to(pos) { BOutcome::DeleteBestUpTo } else { BOutcome::Bad }
                }
                "3" => {
                    book.bids.clear();
                    book.asks.clear();
                    BOutcome::Clear
                }
                _ => BOutcome::Bad,
            }
        }
        "E" => BOutcome::Ignored,
        _ => BOutcome::Ignored,
    };

    if !matches!(outcome, BOutcome::Bad) {
        book.recompute_ofi();
    }
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_then_cancel_best_scenario_from_spec() {
        let mut b = BBook::new(2000);
        apply_line(&mut b, "A:0:A:100.0:10:1:07010900:1:0").unwrap();
        apply_line(&mut b, "A:0:A:100.5:5:2:07010901:2:0").unwrap();
        // best bid is now 100.5 at pos 0
        assert_eq!(b.bids.best().unwrap().price, 100.5);
        apply_line(&mut b, "D:1:A:0").unwrap();
        let best = b.bids.best().unwrap();
        assert_eq!(best.price, 100.0);
        assert_eq!(best.qty, 10.0);
    }

    #[test]
    fn update_in_place_when_positions_equal() {
        let mut b = BBook::new(10);
        apply_line(&mut b, "A:0:A:100.0:10:1:0:1:0").unwrap();
        apply_line(&mut b, "U:0:0:A:101.0:11:1:0:1:0").unwrap();
        assert_eq!(b.bids.len(), 1);
        assert_eq!(b.bids.best().unwrap().price, 101.0);
    }

    #[test]
    fn update_decrements_pos_new_when_deeper_than_pos_old() {
        let mut b = BBook::new(10);
        apply_line(&mut b, "A:0:A:100.0:1:1:0:1:0").unwrap(); // pos0
        apply_line(&mut b, "A:1:A:99.0:1:2:0:2:0").unwrap(); // pos1
        apply_line(&mut b, "A:2:A:98.0:1:3:0:3:0").unwrap(); // pos2
        // Move order at pos_old=0 to pos_new=2 (deeper than pos_old => decrement to 1)
        apply_line(&mut b, "U:2:0:A:100.0:1:1:0:1:0").unwrap();
        assert_eq!(b.bids.arr[1].price, 100.0);
    }

    #[test]
    fn delete_best_up_to_truncates_front() {
        let mut b = BBook::new(10);
        apply_line(&mut b, "A:0:A:100.0:1:1:0:1:0").unwrap();
        apply_line(&mut b, "A:1:A:99.0:1:2:0:2:0").unwrap();
        apply_line(&mut b, "A:2:A:98.0:1:3:0:3:0").unwrap();
        apply_line(&mut b, "D:2:A:1").unwrap();
        assert_eq!(b.bids.len(), 1);
        assert_eq!(b.bids.best().unwrap().price, 98.0);
    }

    #[test]
    fn clear_resets_both_sides() {
        let mut b = BBook::new(10);
        apply_line(&mut b, "A:0:A:100.0:1:1:0:1:0").unwrap();
        apply_line(&mut b, "A:0:V:101.0:1:1:0:1:0").unwrap();
        apply_line(&mut b, "D:3").unwrap();
        assert!(!b.book_ready());
    }

    #[test]
    fn ofi_under_price_improvement_scenario_from_spec() {
        let mut b = BBook::new(10);
        apply_line(&mut b, "A:0:A:10.0:5:1:0:1:0").unwrap();
        apply_line(&mut b, "A:0:V:11.0:5:1:0:2:0").unwrap();
        assert_eq!(b.ofi_accum, 0.0); // first observation with both sides: no prior to diff against... but recompute runs every step

        // new best bid improves to 10.5 qty 7; ask stays at 11.0/5
        apply_line(&mut b, "U:0:0:A:10.5:7:1:0:1:0").unwrap();
        assert!((b.ofi_accum - 7.0).abs() < 1e-9);
    }

    #[test]
    fn ofi_invalidated_when_a_side_empty() {
        let mut b = BBook::new(10);
        apply_line(&mut b, "A:0:A:10.0:5:1:0:1:0").unwrap();
        // no ask side yet: recompute should not blow up and should not accumulate
        assert_eq!(b.ofi_accum, 0.0);
        apply_line(&mut b, "A:0:V:11.0:5:1:0:2:0").unwrap();
        // both sides now present for the first time: no prior-both state yet, no delta
        assert_eq!(b.ofi_accum, 0.0);
    }

    #[test]
    fn out_of_range_position_is_bad() {
        let mut b = BBook::new(10);
        assert_eq!(apply_line(&mut b, "A:-1:A:10.0:5:1:0:1:0").unwrap(), BOutcome::Bad);
        assert_eq!(apply_line(&mut b, "D:1:A:5").unwrap(), BOutcome::Bad);
    }
}
