//! Normalized streaming messages.
//!
//! Every exchange protocol parses its frames into [`StreamMessage`]s: one
//! action applied to a batch of rows of a single table. Row fields are
//! optional where exchanges send partial updates (Bitmex `update` carries only
//! changed columns); `None` means "unchanged".

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::enums::{OrderStatus, Side};
use super::instrument::{AccountKey, SymbolKey};
use super::trading::Execution;

/// What a message does to its table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Action {
    /// Full snapshot; establishes the keys it carries.
    Partial,
    Insert,
    /// Mutates existing keys; unknown keys are ignored.
    Update,
    Delete,
}

impl Action {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "partial" | "snapshot" => Some(Self::Partial),
            "insert" => Some(Self::Insert),
            "update" | "delta" => Some(Self::Update),
            "delete" => Some(Self::Delete),
            _ => None,
        }
    }
}

/// Logical table a row belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Table {
    OrderBook,
    Ticker,
    Position,
    Margin,
    Order,
    Execution,
}

/// Book levels for one instrument, best first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookRow {
    pub key: SymbolKey,
    pub bids: Vec<[f64; 2]>,
    pub asks: Vec<[f64; 2]>,
}

/// Top-of-book and mark price.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TickerRow {
    pub key: Option<SymbolKey>,
    pub bid: Option<[f64; 2]>,
    pub ask: Option<[f64; 2]>,
    pub mark_price: Option<f64>,
}

/// Position columns in unified units.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionRow {
    pub key: SymbolKey,
    pub qty: Option<f64>,
    pub avg_entry_price: Option<f64>,
    pub unrealized_pnl: Option<f64>,
    pub margin_call_price: Option<f64>,
}

/// Account columns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarginRow {
    pub key: AccountKey,
    pub wallet_balance: Option<f64>,
    pub margin_balance: Option<f64>,
    pub available_margin: Option<f64>,
    pub order_margin: Option<f64>,
    pub position_margin: Option<f64>,
    pub unrealized_pnl: Option<f64>,
}

impl MarginRow {
    pub fn empty(key: AccountKey) -> Self {
        Self {
            key,
            wallet_balance: None,
            margin_balance: None,
            available_margin: None,
            order_margin: None,
            position_margin: None,
            unrealized_pnl: None,
        }
    }
}

/// Order columns. `cl_ord_id` is absent for orders placed elsewhere.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRow {
    pub key: SymbolKey,
    pub order_id: String,
    pub cl_ord_id: Option<String>,
    pub side: Option<Side>,
    pub price: Option<f64>,
    pub leaves_qty: Option<f64>,
    pub orig_qty: Option<f64>,
    pub status: Option<OrderStatus>,
    pub timestamp: Option<DateTime<Utc>>,
}

impl OrderRow {
    pub fn new(key: SymbolKey, order_id: impl Into<String>) -> Self {
        Self {
            key,
            order_id: order_id.into(),
            cl_ord_id: None,
            side: None,
            price: None,
            leaves_qty: None,
            orig_qty: None,
            status: None,
            timestamp: None,
        }
    }
}

/// One row of any table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Row {
    Book(BookRow),
    Ticker(TickerRow),
    Position(PositionRow),
    Margin(MarginRow),
    Order(OrderRow),
    Execution(Execution),
}

impl Row {
    pub fn table(&self) -> Table {
        match self {
            Self::Book(_) => Table::OrderBook,
            Self::Ticker(_) => Table::Ticker,
            Self::Position(_) => Table::Position,
            Self::Margin(_) => Table::Margin,
            Self::Order(_) => Table::Order,
            Self::Execution(_) => Table::Execution,
        }
    }
}

/// One action applied to a batch of rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamMessage {
    pub action: Action,
    pub rows: Vec<Row>,
}

impl StreamMessage {
    pub fn new(action: Action, rows: Vec<Row>) -> Self {
        Self { action, rows }
    }

    pub fn single(action: Action, row: Row) -> Self {
        Self { action, rows: vec![row] }
    }
}
