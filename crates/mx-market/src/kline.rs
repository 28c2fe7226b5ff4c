//! Rolling kline buffers.
//!
//! A buffer is seeded from REST history and then advanced from the top of
//! book on every supervisor tick. Closing a bar is what drives the bots;
//! only a bar built from live prices can close, so the first tick after
//! seeding opens a bar without reporting one.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use mx_core::time_util::from_ms;
use mx_core::{Kline, SymbolKey, Timeframe, normalize_klines};

/// Bars kept per buffer.
pub const DEFAULT_CAPACITY: usize = 500;

pub struct KlineBuffer {
    pub key: SymbolKey,
    pub timeframe: Timeframe,
    bars: VecDeque<Kline>,
    capacity: usize,
    /// The last bar is built from live prices, not taken from history.
    forming: bool,
}

impl KlineBuffer {
    pub fn new(key: SymbolKey, timeframe: Timeframe, capacity: usize) -> Self {
        Self { key, timeframe, bars: VecDeque::with_capacity(capacity), capacity: capacity.max(1), forming: false }
    }

    /// Replace the contents with closed bars from history.
    pub fn seed(&mut self, history: Vec<Kline>) {
        self.bars = normalize_klines(history).into();
        self.forming = false;
        self.trim();
    }

    /// Feed one price observation. Returns the bar that closed, if `ts`
    /// opened a new one after a live bar. Observations older than the last
    /// bar are dropped.
    pub fn on_price(&mut self, ts: DateTime<Utc>, price: f64) -> Option<Kline> {
        if !(price > 0.0) {
            return None;
        }
        let open = from_ms(self.timeframe.floor_ms(ts.timestamp_millis()));
        match self.bars.back_mut() {
            Some(last) if last.timestamp == open => {
                last.update(price);
                self.forming = true;
                None
            }
            Some(last) if last.timestamp > open => None,
            Some(last) => {
                let closed = self.forming.then_some(*last);
                self.bars.push_back(Kline::flat(open, price));
                self.forming = true;
                self.trim();
                closed
            }
            None => {
                self.bars.push_back(Kline::flat(open, price));
                self.forming = true;
                None
            }
        }
    }

    /// All bars, oldest first; the last one may still be forming.
    pub fn bars(&self) -> Vec<Kline> {
        self.bars.iter().copied().collect()
    }

    pub fn last(&self) -> Option<&Kline> {
        self.bars.back()
    }

    pub fn len(&self) -> usize {
        self.bars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    fn trim(&mut self) {
        while self.bars.len() > self.capacity {
            self.bars.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mx_core::Exchange;

    fn t(min: i64, sec: i64) -> DateTime<Utc> {
        from_ms((min * 60 + sec) * 1000)
    }

    fn buffer(capacity: usize) -> KlineBuffer {
        KlineBuffer::new(SymbolKey::new("BTCUSDT", Exchange::Bybit), Timeframe::M1, capacity)
    }

    #[test]
    fn closes_bar_on_next_interval() {
        let mut buf = buffer(10);
        assert_eq!(buf.on_price(t(0, 5), 100.0), None);
        assert_eq!(buf.on_price(t(0, 30), 103.0), None);
        assert_eq!(buf.on_price(t(0, 50), 99.0), None);
        let closed = buf.on_price(t(1, 0), 101.0).unwrap();
        assert_eq!((closed.open, closed.high, closed.low, closed.close), (100.0, 103.0, 99.0, 99.0));
        assert_eq!(buf.last().unwrap().timestamp, t(1, 0));
    }

    #[test]
    fn seeded_history_does_not_close_on_first_tick() {
        let mut buf = buffer(2);
        buf.seed(vec![Kline::flat(t(2, 0), 3.0), Kline::flat(t(0, 0), 1.0), Kline::flat(t(1, 0), 2.0)]);
        assert_eq!(buf.len(), 2);
        assert_eq!(buf.bars()[0].close, 2.0);
        assert_eq!(buf.on_price(t(3, 10), 4.0), None);
        assert_eq!(buf.len(), 2);
        assert_eq!(buf.on_price(t(3, 40), 5.0), None);
        let closed = buf.on_price(t(4, 0), 6.0).unwrap();
        assert_eq!((closed.timestamp, closed.open, closed.close), (t(3, 0), 4.0, 5.0));
    }

    #[test]
    fn stale_and_empty_prices_ignored() {
        let mut buf = buffer(10);
        buf.on_price(t(5, 0), 10.0);
        assert_eq!(buf.on_price(t(4, 0), 11.0), None);
        assert_eq!(buf.on_price(t(5, 1), 0.0), None);
        assert_eq!(buf.last().unwrap().close, 10.0);
    }
}
