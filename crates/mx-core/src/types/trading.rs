//! Trading-related data structures: orders, executions, and klines.
//!
//! These types flow between strategy callers, the order ledger, and the
//! exchange adapters. Quantities are always in unified units; adapters do the
//! conversion to exchange-native contracts.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::enums::{ExecType, Side};
use super::instrument::SymbolKey;

// ---------------------------------------------------------------------------
// Client order ids
// ---------------------------------------------------------------------------

/// Separator between the sequence number and the EMI in a client order id.
pub const CL_ORD_SEPARATOR: char = '.';

/// Build a client order id of the form `<sequence>.<emi>`.
pub fn format_cl_ord_id(seq: u64, emi: &str) -> String {
    format!("{seq}{CL_ORD_SEPARATOR}{emi}")
}

/// Extract the EMI from a client order id, if it has one.
pub fn emi_of(cl_ord_id: &str) -> Option<&str> {
    cl_ord_id
        .split_once(CL_ORD_SEPARATOR)
        .map(|(_, emi)| emi)
        .filter(|emi| !emi.is_empty())
}

/// Monotonic sequence source for client order ids.
///
/// Seeded from the wall clock so ids stay unique across restarts.
pub struct ClOrdIdGen {
    next: AtomicU64,
}

impl ClOrdIdGen {
    pub fn new() -> Self {
        Self { next: AtomicU64::new(crate::time_util::now_ms().max(0) as u64) }
    }

    pub fn starting_at(seq: u64) -> Self {
        Self { next: AtomicU64::new(seq) }
    }

    pub fn next_id(&self, emi: &str) -> String {
        let seq = self.next.fetch_add(1, Ordering::Relaxed);
        format_cl_ord_id(seq, emi)
    }
}

impl Default for ClOrdIdGen {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Ledger entry
// ---------------------------------------------------------------------------

/// An open order tracked by the [`OrderLedger`](crate::ledger::OrderLedger).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    /// Stable across replaces.
    pub cl_ord_id: String,
    pub key: SymbolKey,
    pub side: Side,
    pub price: f64,
    /// Remaining unfilled quantity (unified units).
    pub leaves_qty: f64,
    pub orig_qty: f64,
    /// Exchange-assigned id.
    pub order_id: String,
    pub timestamp: DateTime<Utc>,
    /// Originating bot.
    pub emi: String,
}

// ---------------------------------------------------------------------------
// Requests and acknowledgements
// ---------------------------------------------------------------------------

/// A limit order request handed to an adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimitOrder {
    pub key: SymbolKey,
    /// Signed quantity in unified units: positive buys, negative sells.
    pub qty: f64,
    pub price: f64,
    pub cl_ord_id: String,
    /// Known exchange id (replace/cancel only).
    pub order_id: Option<String>,
}

impl LimitOrder {
    pub fn side(&self) -> Side {
        Side::from_signed(self.qty)
    }
}

/// What the exchange reported back for a trading call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderAck {
    pub order_id: String,
    pub cl_ord_id: String,
    pub price: f64,
    /// Remaining quantity if the exchange reported it.
    pub leaves_qty: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Executions
// ---------------------------------------------------------------------------

/// An append-only fill / funding / delivery record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    /// Unique per (market, account).
    pub exec_id: String,
    pub order_id: String,
    pub cl_ord_id: Option<String>,
    pub key: SymbolKey,
    pub side: Side,
    /// Absolute quantity in unified units.
    pub qty: f64,
    pub price: f64,
    /// Fee paid (negative = rebate / funding received).
    pub fee: f64,
    pub fee_currency: String,
    pub timestamp: DateTime<Utc>,
    pub exec_type: ExecType,
    /// Remaining quantity of the parent order after this fill, when known.
    pub leaves_qty: Option<f64>,
    /// Account id the record belongs to.
    pub account: String,
}

impl Execution {
    /// Signed quantity: positive buys, negative sells.
    pub fn signed_qty(&self) -> f64 {
        self.qty * self.side.sign()
    }
}

/// One page of raw trade history. Split legs are left unmerged so a caller
/// paging by count sees the exchange's own record count.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HistoryPage {
    /// Ascending by time.
    pub records: Vec<Execution>,
    /// The exchange holds further records after this page.
    pub more: bool,
}

// ---------------------------------------------------------------------------
// Klines
// ---------------------------------------------------------------------------

/// One OHLC bar; `timestamp` is the bar open time.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Kline {
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
}

impl Kline {
    pub fn flat(timestamp: DateTime<Utc>, price: f64) -> Self {
        Self { timestamp, open: price, high: price, low: price, close: price }
    }

    pub fn update(&mut self, price: f64) {
        self.high = self.high.max(price);
        self.low = self.low.min(price);
        self.close = price;
    }
}

/// Sort ascending by open time and drop duplicate timestamps.
pub fn normalize_klines(mut klines: Vec<Kline>) -> Vec<Kline> {
    klines.sort_by_key(|k| k.timestamp);
    klines.dedup_by_key(|k| k.timestamp);
    klines
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cl_ord_id_round_trip() {
        let id = format_cl_ord_id(1700000000001, "breakout");
        assert_eq!(id, "1700000000001.breakout");
        assert_eq!(emi_of(&id), Some("breakout"));
        assert_eq!(emi_of("12345"), None);
        assert_eq!(emi_of("12345."), None);
    }

    #[test]
    fn cl_ord_id_gen_is_monotonic() {
        let generator = ClOrdIdGen::starting_at(10);
        assert_eq!(generator.next_id("a"), "10.a");
        assert_eq!(generator.next_id("b"), "11.b");
    }

    #[test]
    fn klines_sorted_ascending() {
        let t = |ms| DateTime::<Utc>::from_timestamp_millis(ms).unwrap();
        let bars = vec![Kline::flat(t(120_000), 3.0), Kline::flat(t(0), 1.0), Kline::flat(t(60_000), 2.0)];
        let sorted = normalize_klines(bars);
        assert_eq!(sorted.iter().map(|k| k.close).collect::<Vec<_>>(), vec![1.0, 2.0, 3.0]);
    }
}
