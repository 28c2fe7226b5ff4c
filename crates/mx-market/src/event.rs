//! Queues consumed by the display layer.
//!
//! The core never waits on a consumer: both queues are unbounded and a
//! dropped receiver only discards the events.

use chrono::{DateTime, Utc};
use mx_core::error::ExchangeError;
use mx_core::ledger::LedgerChange;
use mx_core::{ErrorKind, Exchange, Order, Severity};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// One human-readable status line.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusMessage {
    pub market: Exchange,
    pub severity: Severity,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum OrderAction {
    Put,
    Delete,
    /// Every order of the market is gone (reload).
    Clear,
}

/// Ledger change for the order table view. `order` is `None` for `Clear`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderEvent {
    pub action: OrderAction,
    pub market: Exchange,
    pub order: Option<Order>,
}

/// Receiving halves, handed to whoever drains the queues.
pub struct EventStreams {
    pub status: mpsc::UnboundedReceiver<StatusMessage>,
    pub orders: mpsc::UnboundedReceiver<OrderEvent>,
}

/// Sending halves, cloned into every market.
#[derive(Clone)]
pub struct EventBus {
    status: mpsc::UnboundedSender<StatusMessage>,
    orders: mpsc::UnboundedSender<OrderEvent>,
}

impl EventBus {
    pub fn new() -> (Self, EventStreams) {
        let (status_tx, status_rx) = mpsc::unbounded_channel();
        let (orders_tx, orders_rx) = mpsc::unbounded_channel();
        (Self { status: status_tx, orders: orders_tx }, EventStreams { status: status_rx, orders: orders_rx })
    }

    pub fn status(&self, market: Exchange, severity: Severity, text: impl Into<String>) {
        let _ = self.status.send(StatusMessage { market, severity, text: text.into(), timestamp: Utc::now() });
    }

    pub fn info(&self, market: Exchange, text: impl Into<String>) {
        let text = text.into();
        info!("[{market}] {text}");
        self.status(market, Severity::Info, text);
    }

    /// One log line and one status line for a classified error.
    pub fn report(&self, market: Exchange, err: &ExchangeError) {
        let severity = match err.kind {
            ErrorKind::Ignore | ErrorKind::Retry => {
                warn!("[{market}] {err}");
                Severity::Warning
            }
            ErrorKind::Block | ErrorKind::Cancel | ErrorKind::Fatal => {
                error!("[{market}] {err}");
                Severity::Error
            }
        };
        self.status(market, severity, err.to_string());
    }

    /// Forward a ledger mutation; `Unchanged` sends nothing.
    pub fn ledger(&self, change: LedgerChange) {
        let (action, order) = match change {
            LedgerChange::Put(order) => (OrderAction::Put, order),
            LedgerChange::Delete(order) => (OrderAction::Delete, order),
            LedgerChange::Unchanged => return,
        };
        let _ = self.orders.send(OrderEvent { action, market: order.key.market, order: Some(order) });
    }

    pub fn clear(&self, market: Exchange) {
        let _ = self.orders.send(OrderEvent { action: OrderAction::Clear, market, order: None });
    }
}
