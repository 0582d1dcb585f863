//! Exponential moving average and rolling z-score primitives shared by the
//! Z signal engine (§4.9) and the T/V aggregators (§4.7/§4.8).
//!
//! Hand-rolled rather than pulled from a stats crate: every aggregator in
//! `original_source/parsers/*.c` implements the identical formulas directly
//! against a handful of `double`s and a ring buffer, and none of the example
//! repos in this pack reach for a stats dependency for anything this small.

/// Exponential moving average with lazy initialization: the first observed
/// value seeds the average instead of being blended against zero.
#[derive(Debug, Clone, Copy, Default)]
pub struct Ema {
    value: f64,
    inited: bool,
    alpha: f64,
}

impl Ema {
    /// `period` is converted to `alpha = 2 / (period + 1)`; periods `<= 1`
    /// collapse to `alpha = 1.0` (the EMA tracks the latest value exactly).
    pub fn new(period: u32) -> Ema {
        let alpha = if period <= 1 { 1.0 } else { 2.0 / (period as f64 + 1.0) };
        Ema { value: 0.0, inited: false, alpha }
    }

    pub fn update(&mut self, x: f64) -> f64 {
        if !self.inited {
            self.inited = true;
            self.value = x;
        } else {
            self.value = self.alpha * x + (1.0 - self.alpha) * self.value;
        }
        self.value
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn is_inited(&self) -> bool {
        self.inited
    }

    pub fn reset(&mut self) {
        self.inited = false;
        self.value = 0.0;
    }
}

/// Ring-buffer rolling mean/std/z-score over the last `capacity` samples.
#[derive(Debug, Clone)]
pub struct RollingZ {
    buf: Vec<f64>,
    cap: usize,
    head: usize,
    len: usize,
    sum: f64,
    sumsq: f64,
}

impl RollingZ {
    pub fn new(capacity: usize) -> RollingZ {
        RollingZ {
            buf: vec![0.0; capacity.max(1)],
            cap: capacity.max(1),
            head: 0,
            len: 0,
            sum: 0.0,
            sumsq: 0.0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Push a new sample, evicting the oldest one once at capacity.
    pub fn push(&mut self, x: f64) {
        if self.len == self.cap {
            let old = self.buf[self.head];
            self.sum -= old;
            self.sumsq -= old * old;
            self.buf[self.head] = x;
            self.head = (self.head + 1) % self.cap;
        } else {
            let idx = (self.head + self.len) % self.cap;
            self.buf[idx] = x;
            self.len += 1;
        }
        self.sum += x;
        self.sumsq += x * x;
    }

    pub fn mean(&self) -> f64 {
        if self.len == 0 { 0.0 } else { self.sum / self.len as f64 }
    }

    pub fn std_dev(&self) -> f64 {
        if self.len < 2 { return 0.0; }
        let n = self.len as f64;
        let mean = self.mean();
        let var = (self.sumsq / n - mean * mean).max(0.0);
        var.sqrt()
    }

    /// z-score of `x` against the current window; `0.0` when the window has
    /// fewer than 2 samples or the standard deviation is ~0.
    pub fn z_score(&self, x: f64) -> f64 {
        let sd = self.std_dev();
        if self.len < 2 || sd < 1e-12 {
            0.0
        } else {
            (x - self.mean()) / sd
        }
    }
}

pub fn sign(x: f64) -> f64 {
    if x > 0.0 {
        1.0
    } else if x < 0.0 {
        -1.0
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ema_first_sample_seeds_value() {
        let mut e = Ema::new(9);
        assert_eq!(e.update(10.0), 10.0);
        assert!(e.is_inited());
    }

    #[test]
    fn ema_blends_subsequent_samples() {
        let mut e = Ema::new(3); // alpha = 0.5
        e.update(10.0);
        let v = e.update(20.0);
        assert!((v - 15.0).abs() < 1e-9);
    }

    #[test]
    fn rolling_z_window_eviction() {
        let mut z = RollingZ::new(3);
        z.push(1.0);
        z.push(2.0);
        z.push(3.0);
        assert_eq!(z.len(), 3);
        z.push(100.0); // evicts the 1.0
        assert_eq!(z.len(), 3);
        assert!((z.mean() - 35.0).abs() < 1e-9);
    }

    #[test]
    fn z_score_requires_warmup() {
        let mut z = RollingZ::new(10);
        assert_eq!(z.z_score(5.0), 0.0);
        z.push(5.0);
        assert_eq!(z.z_score(5.0), 0.0); // single sample => std_dev 0
    }

    #[test]
    fn sign_cases() {
        assert_eq!(sign(2.5), 1.0);
        assert_eq!(sign(-2.5), -1.0);
        assert_eq!(sign(0.0), 0.0);
    }
}
