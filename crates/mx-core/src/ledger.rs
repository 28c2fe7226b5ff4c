//! Order ledger.
//!
//! The single authoritative table of open orders, keyed by client order id.
//! Every mutation (place, replace, stream order row, execution, cancel) goes
//! through one mutex so REST-driven and stream-driven updates never
//! interleave inside an update.
//!
//! Invariant: an order whose leaves quantity is `<= 0` is never present after
//! the mutation that observed it.

use std::sync::Arc;

use ahash::AHashMap;
use chrono::Utc;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::precision::QTY_EPS;
use crate::types::{Action, ClOrdIdGen, Exchange, ExecType, Execution, Order, OrderAck, OrderRow, emi_of};

/// What a ledger mutation did, for the display queue.
#[derive(Debug, Clone, PartialEq)]
pub enum LedgerChange {
    /// Order inserted or modified; carries the new state.
    Put(Order),
    /// Order removed; carries its last state.
    Delete(Order),
    Unchanged,
}

/// Result of applying an execution.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecOutcome {
    /// Client order id the execution is attributed to (synthesized when the
    /// order was unknown).
    pub cl_ord_id: String,
    pub change: LedgerChange,
    /// The order was not known and had to be adopted.
    pub adopted: bool,
}

#[derive(Default)]
struct LedgerState {
    orders: AHashMap<String, Order>,
    /// `(market, exchange order id)` → client order id.
    by_order_id: AHashMap<(Exchange, String), String>,
}

impl LedgerState {
    fn put(&mut self, order: Order) -> LedgerChange {
        if order.leaves_qty <= QTY_EPS {
            return match self.remove(&order.cl_ord_id) {
                Some(_) => LedgerChange::Delete(order),
                None => LedgerChange::Unchanged,
            };
        }
        if !order.order_id.is_empty() {
            self.by_order_id.insert((order.key.market, order.order_id.clone()), order.cl_ord_id.clone());
        }
        self.orders.insert(order.cl_ord_id.clone(), order.clone());
        LedgerChange::Put(order)
    }

    fn remove(&mut self, cl_ord_id: &str) -> Option<Order> {
        let order = self.orders.remove(cl_ord_id)?;
        self.by_order_id.remove(&(order.key.market, order.order_id.clone()));
        Some(order)
    }

    fn resolve(&self, market: Exchange, cl_ord_id: Option<&str>, order_id: &str) -> Option<String> {
        if let Some(id) = cl_ord_id.filter(|id| self.orders.contains_key(*id)) {
            return Some(id.to_string());
        }
        self.by_order_id.get(&(market, order_id.to_string())).cloned()
    }
}

/// Process-wide open-order table.
#[derive(Clone)]
pub struct OrderLedger {
    state: Arc<Mutex<LedgerState>>,
    ids: Arc<ClOrdIdGen>,
}

impl Default for OrderLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl OrderLedger {
    pub fn new() -> Self {
        Self::with_ids(ClOrdIdGen::new())
    }

    pub fn with_ids(ids: ClOrdIdGen) -> Self {
        Self { state: Arc::new(Mutex::new(LedgerState::default())), ids: Arc::new(ids) }
    }

    /// Fresh client order id `<sequence>.<emi>`.
    pub fn next_cl_ord_id(&self, emi: &str) -> String {
        self.ids.next_id(emi)
    }

    pub fn get(&self, cl_ord_id: &str) -> Option<Order> {
        self.state.lock().orders.get(cl_ord_id).cloned()
    }

    pub fn contains(&self, cl_ord_id: &str) -> bool {
        self.state.lock().orders.contains_key(cl_ord_id)
    }

    pub fn find_by_order_id(&self, market: Exchange, order_id: &str) -> Option<Order> {
        let state = self.state.lock();
        let id = state.by_order_id.get(&(market, order_id.to_string()))?;
        state.orders.get(id).cloned()
    }

    /// Open orders of one market, oldest first.
    pub fn market_orders(&self, market: Exchange) -> Vec<Order> {
        let mut out: Vec<Order> =
            self.state.lock().orders.values().filter(|o| o.key.market == market).cloned().collect();
        out.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.cl_ord_id.cmp(&b.cl_ord_id)));
        out
    }

    pub fn len(&self) -> usize {
        self.state.lock().orders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().orders.is_empty()
    }

    /// Record a freshly placed order, merging with a stream insert that may
    /// already have arrived for the same id.
    pub fn upsert(&self, order: Order) -> LedgerChange {
        let mut state = self.state.lock();
        let merged = match state.orders.get(&order.cl_ord_id) {
            Some(existing) if existing.timestamp > order.timestamp => {
                let mut kept = existing.clone();
                if kept.order_id.is_empty() {
                    kept.order_id = order.order_id;
                }
                kept
            }
            _ => order,
        };
        state.put(merged)
    }

    /// Apply a successful replace acknowledgement.
    pub fn apply_replace(&self, cl_ord_id: &str, ack: &OrderAck) -> LedgerChange {
        let mut state = self.state.lock();
        let Some(mut order) = state.orders.get(cl_ord_id).cloned() else {
            return LedgerChange::Unchanged;
        };
        order.price = ack.price;
        if let Some(leaves) = ack.leaves_qty {
            order.leaves_qty = leaves;
        }
        if !ack.order_id.is_empty() && ack.order_id != order.order_id {
            state.by_order_id.remove(&(order.key.market, order.order_id.clone()));
            order.order_id = ack.order_id.clone();
        }
        order.timestamp = ack.timestamp;
        state.put(order)
    }

    /// Remove an order after a confirmed cancel.
    pub fn remove(&self, cl_ord_id: &str) -> LedgerChange {
        match self.state.lock().remove(cl_ord_id) {
            Some(order) => LedgerChange::Delete(order),
            None => LedgerChange::Unchanged,
        }
    }

    /// Apply one row of the order table.
    ///
    /// `Update` and `Delete` on a key the ledger has never seen are no-ops:
    /// such rows arrive before the snapshot that introduces the order.
    /// `Partial` and `Insert` adopt unknown orders.
    pub fn apply_order_row(&self, action: Action, row: &OrderRow) -> LedgerChange {
        let mut state = self.state.lock();
        let market = row.key.market;
        let known = state.resolve(market, row.cl_ord_id.as_deref(), &row.order_id);

        if action == Action::Delete || row.status.is_some_and(|s| s.is_terminal()) {
            return match known.and_then(|id| state.remove(&id)) {
                Some(order) => LedgerChange::Delete(order),
                None => LedgerChange::Unchanged,
            };
        }

        match known {
            Some(id) => {
                let Some(mut order) = state.orders.get(&id).cloned() else {
                    return LedgerChange::Unchanged;
                };
                if let Some(price) = row.price {
                    order.price = price;
                }
                if let Some(leaves) = row.leaves_qty {
                    order.leaves_qty = leaves;
                }
                if let Some(orig) = row.orig_qty {
                    order.orig_qty = orig;
                }
                if order.order_id.is_empty() && !row.order_id.is_empty() {
                    order.order_id = row.order_id.clone();
                }
                if let Some(ts) = row.timestamp {
                    order.timestamp = ts;
                }
                state.put(order)
            }
            None if action == Action::Update => {
                debug!("[ledger] update for unknown order {} on {}, skipped", row.order_id, row.key);
                LedgerChange::Unchanged
            }
            None => {
                let (Some(side), Some(price), Some(leaves)) = (row.side, row.price, row.leaves_qty) else {
                    debug!("[ledger] incomplete insert for {}, skipped", row.order_id);
                    return LedgerChange::Unchanged;
                };
                let cl_ord_id = match row.cl_ord_id.as_deref().filter(|id| emi_of(id).is_some()) {
                    Some(id) => id.to_string(),
                    None => {
                        let id = self.ids.next_id(&row.key.ticker);
                        warn!("[ledger] adopting foreign order {} on {} as {id}", row.order_id, row.key);
                        id
                    }
                };
                let emi = emi_of(&cl_ord_id).unwrap_or(row.key.ticker.as_str()).to_string();
                state.put(Order {
                    cl_ord_id,
                    key: row.key.clone(),
                    side,
                    price,
                    leaves_qty: leaves,
                    orig_qty: row.orig_qty.unwrap_or(leaves),
                    order_id: row.order_id.clone(),
                    timestamp: row.timestamp.unwrap_or_else(Utc::now),
                    emi,
                })
            }
        }
    }

    /// Apply a fill to its order.
    ///
    /// Fills for orders the ledger does not know (placed from the exchange's
    /// own UI, or before this session) are attributed to a synthesized id and
    /// adopted while quantity remains.
    pub fn apply_execution(&self, exec: &Execution) -> ExecOutcome {
        let mut state = self.state.lock();
        let market = exec.key.market;

        if exec.exec_type != ExecType::Trade {
            let cl_ord_id = exec.cl_ord_id.clone().unwrap_or_else(|| exec.key.ticker.clone());
            return ExecOutcome { cl_ord_id, change: LedgerChange::Unchanged, adopted: false };
        }

        if let Some(id) = state.resolve(market, exec.cl_ord_id.as_deref(), &exec.order_id) {
            let Some(mut order) = state.orders.get(&id).cloned() else {
                return ExecOutcome { cl_ord_id: id, change: LedgerChange::Unchanged, adopted: false };
            };
            order.leaves_qty = exec.leaves_qty.unwrap_or(order.leaves_qty - exec.qty);
            order.timestamp = exec.timestamp;
            let change = state.put(order);
            return ExecOutcome { cl_ord_id: id, change, adopted: false };
        }

        let cl_ord_id = match exec.cl_ord_id.as_deref().filter(|id| emi_of(id).is_some()) {
            Some(id) => id.to_string(),
            None => self.ids.next_id(&exec.key.ticker),
        };
        warn!(
            "[ledger] execution {} for unknown order {} on {}, adopted as {cl_ord_id}",
            exec.exec_id, exec.order_id, exec.key
        );
        let leaves = exec.leaves_qty.unwrap_or(0.0);
        let emi = emi_of(&cl_ord_id).unwrap_or(exec.key.ticker.as_str()).to_string();
        let change = state.put(Order {
            cl_ord_id: cl_ord_id.clone(),
            key: exec.key.clone(),
            side: exec.side,
            price: exec.price,
            leaves_qty: leaves,
            orig_qty: leaves + exec.qty,
            order_id: exec.order_id.clone(),
            timestamp: exec.timestamp,
            emi,
        });
        ExecOutcome { cl_ord_id, change, adopted: true }
    }

    /// Drop every order of one market (reload). Returns what was removed.
    pub fn clear_market(&self, market: Exchange) -> Vec<Order> {
        let mut state = self.state.lock();
        let ids: Vec<String> =
            state.orders.values().filter(|o| o.key.market == market).map(|o| o.cl_ord_id.clone()).collect();
        ids.iter().filter_map(|id| state.remove(id)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{OrderStatus, Side, SymbolKey};

    fn key() -> SymbolKey {
        SymbolKey::new("XBTUSD", Exchange::Bitmex)
    }

    fn order(cl: &str, oid: &str, leaves: f64) -> Order {
        Order {
            cl_ord_id: cl.into(),
            key: key(),
            side: Side::Buy,
            price: 100.0,
            leaves_qty: leaves,
            orig_qty: leaves,
            order_id: oid.into(),
            timestamp: Utc::now(),
            emi: "bot".into(),
        }
    }

    fn fill(oid: &str, cl: Option<&str>, qty: f64, leaves: Option<f64>) -> Execution {
        Execution {
            exec_id: format!("x-{oid}-{qty}"),
            order_id: oid.into(),
            cl_ord_id: cl.map(str::to_string),
            key: key(),
            side: Side::Buy,
            qty,
            price: 100.0,
            fee: 0.0,
            fee_currency: "XBt".into(),
            timestamp: Utc::now(),
            exec_type: ExecType::Trade,
            leaves_qty: leaves,
            account: "1".into(),
        }
    }

    #[test]
    fn full_fill_removes_order() {
        let ledger = OrderLedger::with_ids(ClOrdIdGen::starting_at(1));
        ledger.upsert(order("1.bot", "A", 10.0));
        let out = ledger.apply_execution(&fill("A", Some("1.bot"), 4.0, Some(6.0)));
        assert!(matches!(out.change, LedgerChange::Put(ref o) if o.leaves_qty == 6.0));
        let out = ledger.apply_execution(&fill("A", None, 6.0, None));
        assert_eq!(out.cl_ord_id, "1.bot");
        assert!(matches!(out.change, LedgerChange::Delete(_)));
        assert!(ledger.get("1.bot").is_none());
        assert!(ledger.find_by_order_id(Exchange::Bitmex, "A").is_none());
    }

    #[test]
    fn unknown_execution_is_adopted() {
        let ledger = OrderLedger::with_ids(ClOrdIdGen::starting_at(7));
        let out = ledger.apply_execution(&fill("Z", None, 1.0, Some(2.0)));
        assert!(out.adopted);
        assert_eq!(out.cl_ord_id, "7.XBTUSD");
        let adopted = ledger.get("7.XBTUSD").unwrap();
        assert_eq!(adopted.leaves_qty, 2.0);
        assert_eq!(adopted.orig_qty, 3.0);
        assert_eq!(adopted.emi, "XBTUSD");
    }

    #[test]
    fn fully_filled_unknown_execution_leaves_nothing() {
        let ledger = OrderLedger::with_ids(ClOrdIdGen::starting_at(1));
        let out = ledger.apply_execution(&fill("Z", None, 1.0, Some(0.0)));
        assert!(out.adopted);
        assert_eq!(out.change, LedgerChange::Unchanged);
        assert!(ledger.is_empty());
    }

    #[test]
    fn update_before_snapshot_is_noop() {
        let ledger = OrderLedger::new();
        let mut row = OrderRow::new(key(), "A");
        row.price = Some(101.0);
        assert_eq!(ledger.apply_order_row(Action::Update, &row), LedgerChange::Unchanged);
        assert_eq!(ledger.apply_order_row(Action::Delete, &row), LedgerChange::Unchanged);
        assert!(ledger.is_empty());
    }

    #[test]
    fn order_rows_drive_lifecycle() {
        let ledger = OrderLedger::with_ids(ClOrdIdGen::starting_at(1));
        let mut row = OrderRow::new(key(), "A");
        row.cl_ord_id = Some("5.bot".into());
        row.side = Some(Side::Sell);
        row.price = Some(100.0);
        row.leaves_qty = Some(10.0);
        assert!(matches!(ledger.apply_order_row(Action::Insert, &row), LedgerChange::Put(_)));

        let mut update = OrderRow::new(key(), "A");
        update.price = Some(99.5);
        ledger.apply_order_row(Action::Update, &update);
        assert_eq!(ledger.get("5.bot").unwrap().price, 99.5);

        let mut cancel = OrderRow::new(key(), "A");
        cancel.status = Some(OrderStatus::Canceled);
        assert!(matches!(ledger.apply_order_row(Action::Update, &cancel), LedgerChange::Delete(_)));
        assert!(ledger.is_empty());
    }

    #[test]
    fn insert_without_cl_ord_id_synthesizes_one() {
        let ledger = OrderLedger::with_ids(ClOrdIdGen::starting_at(42));
        let mut row = OrderRow::new(key(), "B");
        row.side = Some(Side::Buy);
        row.price = Some(10.0);
        row.leaves_qty = Some(1.0);
        ledger.apply_order_row(Action::Partial, &row);
        assert!(ledger.contains("42.XBTUSD"));
    }

    #[test]
    fn stream_insert_before_rest_ack_keeps_one_entry() {
        let ledger = OrderLedger::new();
        let mut row = OrderRow::new(key(), "A");
        row.cl_ord_id = Some("9.bot".into());
        row.side = Some(Side::Buy);
        row.price = Some(100.0);
        row.leaves_qty = Some(3.0);
        ledger.apply_order_row(Action::Insert, &row);
        ledger.upsert(order("9.bot", "A", 3.0));
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger.find_by_order_id(Exchange::Bitmex, "A").unwrap().cl_ord_id, "9.bot");
    }

    #[test]
    fn replace_keeps_identity() {
        let ledger = OrderLedger::new();
        ledger.upsert(order("1.bot", "A", 5.0));
        let ack = OrderAck {
            order_id: "A".into(),
            cl_ord_id: "1.bot".into(),
            price: 98.0,
            leaves_qty: None,
            timestamp: Utc::now(),
        };
        let change = ledger.apply_replace("1.bot", &ack);
        assert!(matches!(change, LedgerChange::Put(ref o) if o.price == 98.0 && o.leaves_qty == 5.0));
    }

    #[test]
    fn clear_market_drops_only_that_market() {
        let ledger = OrderLedger::new();
        ledger.upsert(order("1.bot", "A", 5.0));
        let mut other = order("2.bot", "B", 5.0);
        other.key = SymbolKey::new("BTCUSDT", Exchange::Bybit);
        ledger.upsert(other);
        assert_eq!(ledger.clear_market(Exchange::Bitmex).len(), 1);
        assert_eq!(ledger.market_orders(Exchange::Bybit).len(), 1);
    }
}
