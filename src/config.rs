//! Shared configuration primitives.
//!
//! Exchange-local ("wall-clock") time is fixed UTC-3 throughout this crate,
//! independent of host `TZ`, following the manual-offset approach used by
//! the original feed tooling rather than relying on the system timezone
//! database (see `SPEC_FULL.md` §2 for the rationale — DST is irrelevant for
//! current Sao Paulo standard time).
use time::{OffsetDateTime, UtcOffset};

/// Fixed exchange-local offset: UTC-3, year round.
pub const EXCHANGE_OFFSET: UtcOffset = match UtcOffset::from_hms(-3, 0, 0) {
    Ok(o) => o,
    Err(_) => unreachable!(),
};

/// Default market window, local time (inclusive start, exclusive end).
pub const MARKET_OPEN_HOUR: u8 = 9;
pub const MARKET_CLOSE_HOUR: u8 = 19;

/// Current exchange-local time.
pub fn now_local() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(EXCHANGE_OFFSET)
}

/// `YYYYMMDD` for the given exchange-local instant.
pub fn ymd(t: OffsetDateTime) -> String {
    format!("{:04}{:02}{:02}", t.year(), u8::from(t.month()), t.day())
}

/// `YYYYMMDD_HHMMSS` for the given exchange-local instant.
pub fn write_ts(t: OffsetDateTime) -> String {
    format!(
        "{:04}{:02}{:02}_{:02}{:02}{:02}",
        t.year(),
        u8::from(t.month()),
        t.day(),
        t.hour(),
        t.minute(),
        t.second()
    )
}

/// Whether `t` (exchange-local) falls inside the configured market window.
pub fn in_market_window(t: OffsetDateTime, open_hour: u8, close_hour: u8) -> bool {
    let h = t.hour();
    h >= open_hour && h < close_hour
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn offset_is_minus_three_hours() {
        assert_eq!(EXCHANGE_OFFSET.whole_hours(), -3);
    }

    #[test]
    fn market_window_boundaries() {
        let t = datetime!(2026-07-27 09:00:00 -3);
        assert!(in_market_window(t, MARKET_OPEN_HOUR, MARKET_CLOSE_HOUR));
        let t = datetime!(2026-07-27 19:00:00 -3);
        assert!(!in_market_window(t, MARKET_OPEN_HOUR, MARKET_CLOSE_HOUR));
        let t = datetime!(2026-07-27 08:59:59 -3);
        assert!(!in_market_window(t, MARKET_OPEN_HOUR, MARKET_CLOSE_HOUR));
    }

    #[test]
    fn formats_write_ts() {
        let t = datetime!(2026-07-27 09:03:04 -3);
        assert_eq!(write_ts(t), "20260727_090304");
        assert_eq!(ymd(t), "20260727");
    }
}
