//! # mx-exchange
//!
//! Exchange adapters. Each exchange implements the [`ExchangeAdapter`] trait,
//! which hides request signing, endpoint paths and payload shapes behind one
//! unified interface. Every failure leaves an adapter as a classified
//! [`ExchangeError`](mx_core::error::ExchangeError); exchange-native errors
//! never cross the trait boundary.
//!
//! ## Supported exchanges
//!
//! | Exchange | Module    | Categories                     | Stream                        |
//! |----------|-----------|--------------------------------|-------------------------------|
//! | Bitmex   | `bitmex`  | inverse, linear, quanto        | one connection, table/action  |
//! | Bybit    | `bybit`   | linear, inverse, spot, option  | public per category + private |
//! | Deribit  | `deribit` | inverse, linear, option        | one JSON-RPC connection       |
//! | Mexc     | `mexc`    | linear (USDT contracts)        | one connection                |

pub mod auth;
pub mod bitmex;
pub mod bybit;
pub mod classify;
pub mod deribit;
pub mod history;
pub mod json_util;
pub mod mexc;
pub mod registry;
pub mod rest;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveTime, Utc};
use mx_core::error::ExResult;
use mx_core::ws::StreamProtocol;
use mx_core::{
    Exchange, Execution, HistoryPage, Kline, LimitOrder, MarginRow, Order, OrderAck, OrderRow, PositionRow, SymbolKey,
    Timeframe,
};

pub use registry::create_adapter;

/// Trait implemented by all exchange adapters.
///
/// # Lifecycle
///
/// 1. Construct via [`create_adapter`] from a validated market config.
/// 2. [`get_active_instruments`](ExchangeAdapter::get_active_instruments)
///    fills the shared catalog; every other call relies on it.
/// 3. [`stream_protocols`](ExchangeAdapter::stream_protocols) describes the
///    streaming connections to open.
/// 4. [`get_user`](ExchangeAdapter::get_user) resolves the account id before
///    trading and history calls.
///
/// Quantities cross this trait in unified units (see
/// [`Instrument::my_multiplier`](mx_core::Instrument)); adapters convert to
/// exchange-native contracts internally. All methods take `&self` so
/// bootstrap stages can run concurrently.
#[async_trait]
pub trait ExchangeAdapter: Send + Sync {
    fn exchange(&self) -> Exchange;

    /// Load instrument metadata for every configured symbol into the catalog.
    ///
    /// A configured symbol missing from the exchange listing is CANCEL.
    async fn get_active_instruments(&self) -> ExResult<()>;

    /// Resolve and remember the authenticated account id.
    async fn get_user(&self) -> ExResult<String>;

    /// Account id resolved by [`get_user`](ExchangeAdapter::get_user), empty before.
    fn account_id(&self) -> String;

    async fn get_wallet_balance(&self) -> ExResult<Vec<MarginRow>>;

    async fn get_position_info(&self) -> ExResult<Vec<PositionRow>>;

    async fn open_orders(&self) -> ExResult<Vec<OrderRow>>;

    /// Place a limit order; the side is encoded in the sign of `order.qty`.
    async fn place_limit(&self, order: &LimitOrder) -> ExResult<OrderAck>;

    /// Move an open order to `price`, keeping its client order id.
    async fn replace_limit(&self, order: &Order, price: f64) -> ExResult<OrderAck>;

    async fn remove_order(&self, order: &Order) -> ExResult<()>;

    /// Closed bars from `start`, ascending by open time.
    async fn trade_bucketed(&self, key: &SymbolKey, start: DateTime<Utc>, timeframe: Timeframe) -> ExResult<Vec<Kline>>;

    /// Up to `count` raw records at or after `start`, ascending by time.
    ///
    /// Legs sharing a trade id are returned as the exchange reports them;
    /// merging is left to the caller once every page is in.
    async fn trading_history(&self, count: usize, start: DateTime<Utc>) -> ExResult<HistoryPage>;

    /// Funding and delivery records not delivered through
    /// [`trading_history`](ExchangeAdapter::trading_history).
    async fn funding_history(&self, _start: DateTime<Utc>) -> ExResult<Vec<Execution>> {
        Ok(Vec::new())
    }

    /// UTC time of day of a scheduled funding poll, for exchanges whose
    /// stream does not push funding.
    fn funding_poll_time(&self) -> Option<NaiveTime> {
        None
    }

    /// Streaming connections to open, in order.
    fn stream_protocols(&self) -> Vec<Arc<dyn StreamProtocol>>;
}
