//! Instrument and account records.
//!
//! Both are keyed singletons: an instrument lives under `(ticker, market)`,
//! an account under `(currency, market)`. The registries in
//! [`crate::catalog`] own them; everything else holds keys.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::enums::{Category, Exchange, InstrumentState};
use crate::precision;

/// Composite key of an instrument.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SymbolKey {
    pub ticker: String,
    pub market: Exchange,
}

impl SymbolKey {
    pub fn new(ticker: impl Into<String>, market: Exchange) -> Self {
        Self { ticker: ticker.into(), market }
    }
}

impl fmt::Display for SymbolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.ticker, self.market)
    }
}

/// Expiry of a derivative contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Expiry {
    #[default]
    Perpetual,
    At(DateTime<Utc>),
}

impl Expiry {
    /// Build from a millisecond timestamp; zero or negative means perpetual.
    pub fn from_ms(ms: i64) -> Self {
        if ms <= 0 {
            return Self::Perpetual;
        }
        DateTime::<Utc>::from_timestamp_millis(ms).map(Self::At).unwrap_or(Self::Perpetual)
    }
}

impl fmt::Display for Expiry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Perpetual => f.write_str("Perpetual"),
            Self::At(t) => write!(f, "{}", t.format("%Y-%m-%d %H:%M")),
        }
    }
}

/// Normalized per-symbol metadata plus live top-of-book and position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instrument {
    pub key: SymbolKey,
    pub category: Category,
    /// Minimum price increment, always > 0.
    pub tick_size: f64,
    /// Decimal places derived from `tick_size`.
    pub price_precision: u32,
    /// Minimum order size in unified units.
    pub min_order_qty: f64,
    /// Quantity increment in unified units, always > 0.
    pub qty_step: f64,
    /// Decimal places derived from `qty_step`.
    pub qty_precision: u32,
    /// Exchange contract multiplier as reported.
    pub multiplier: f64,
    /// Exchange-native contract units per unified unit.
    pub my_multiplier: f64,
    pub settl_currency: String,
    /// Quote currency (fee currency for spot sells).
    pub quote_currency: String,
    /// Base currency (fee currency for spot buys).
    pub base_currency: String,
    pub expiry: Expiry,
    pub state: InstrumentState,
    /// Bid levels `[price, size]`, best first.
    pub bids: Vec<[f64; 2]>,
    /// Ask levels `[price, size]`, best first.
    pub asks: Vec<[f64; 2]>,
    pub mark_price: f64,
    /// Signed position in unified units.
    pub current_qty: f64,
    pub avg_entry_price: f64,
    pub unrealized_pnl: f64,
    pub margin_call_price: f64,
}

impl Instrument {
    /// Fresh record with unit increments; adapters overwrite the metadata.
    pub fn new(key: SymbolKey) -> Self {
        Self {
            key,
            category: Category::Linear,
            tick_size: 1.0,
            price_precision: 0,
            min_order_qty: 1.0,
            qty_step: 1.0,
            qty_precision: 0,
            multiplier: 1.0,
            my_multiplier: 1.0,
            settl_currency: String::new(),
            quote_currency: String::new(),
            base_currency: String::new(),
            expiry: Expiry::Perpetual,
            state: InstrumentState::Open,
            bids: Vec::new(),
            asks: Vec::new(),
            mark_price: 0.0,
            current_qty: 0.0,
            avg_entry_price: 0.0,
            unrealized_pnl: 0.0,
            margin_call_price: 0.0,
        }
    }

    /// Set increments and keep the derived precisions in sync.
    ///
    /// Non-positive increments are rejected and leave the record unchanged.
    pub fn set_increments(&mut self, tick_size: f64, qty_step: f64, min_order_qty: f64) -> bool {
        if !(tick_size > 0.0 && qty_step > 0.0) {
            return false;
        }
        self.tick_size = tick_size;
        self.price_precision = precision::precision_of(tick_size);
        self.qty_step = qty_step;
        self.qty_precision = precision::precision_of(qty_step);
        self.min_order_qty = if min_order_qty > 0.0 { min_order_qty } else { qty_step };
        true
    }

    pub fn best_bid(&self) -> Option<f64> {
        self.bids.first().map(|l| l[0]).filter(|p| *p > 0.0)
    }

    pub fn best_ask(&self) -> Option<f64> {
        self.asks.first().map(|l| l[0]).filter(|p| *p > 0.0)
    }

    /// Mid of the top of book, falling back to the mark price.
    pub fn mid_price(&self) -> Option<f64> {
        match (self.best_bid(), self.best_ask()) {
            (Some(b), Some(a)) => Some((a + b) / 2.0),
            (Some(p), None) | (None, Some(p)) => Some(p),
            (None, None) if self.mark_price > 0.0 => Some(self.mark_price),
            _ => None,
        }
    }

    /// Unified quantity to exchange-native contracts.
    pub fn to_native_qty(&self, qty: f64) -> f64 {
        precision::round_to(qty * self.my_multiplier, 8)
    }

    /// Exchange-native contracts to unified quantity.
    pub fn from_native_qty(&self, native: f64) -> f64 {
        if self.my_multiplier == 0.0 {
            return native;
        }
        precision::round_to(native / self.my_multiplier, self.qty_precision.max(8))
    }

    /// Replace both sides, truncated to `depth` levels.
    pub fn set_book(&mut self, mut bids: Vec<[f64; 2]>, mut asks: Vec<[f64; 2]>, depth: usize) {
        bids.truncate(depth.max(1));
        asks.truncate(depth.max(1));
        self.bids = bids;
        self.asks = asks;
    }
}

/// Composite key of an account.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AccountKey {
    pub currency: String,
    pub market: Exchange,
}

impl AccountKey {
    pub fn new(currency: impl Into<String>, market: Exchange) -> Self {
        Self { currency: currency.into(), market }
    }
}

/// Per settlement currency balances.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Account {
    pub wallet_balance: f64,
    pub margin_balance: f64,
    pub available_margin: f64,
    pub order_margin: f64,
    pub position_margin: f64,
    pub unrealized_pnl: f64,
}
