//! Applies normalized rows to the shared tables.
//!
//! One [`Dispatcher`] per market. Stream messages reach it from a single
//! consumer task, in the order the exchange delivered them; history replay
//! feeds executions through the same dedup.

use mx_core::dedup::ExecutionDedup;
use mx_core::{Action, BookRow, Exchange, Execution, MarginRow, PositionRow, Row, StreamMessage, TickerRow};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::context::AppContext;

/// Where an execution came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    /// Live fill: adjusts the ledger.
    Stream,
    /// Replayed record: the ledger already reflects it through the
    /// open-order snapshot, so only the store and the bots see it.
    History,
}

pub struct Dispatcher {
    market: Exchange,
    depth: usize,
    ctx: AppContext,
    dedup: Mutex<ExecutionDedup>,
    /// Account id stamped on executions that arrive without one.
    account: RwLock<String>,
    /// Executions that arrived before the account id was known.
    held: Mutex<Vec<Held>>,
}

/// An execution waiting for the account id. Its ledger effect is already
/// applied; `owner` is the order it was credited to.
struct Held {
    exec: Execution,
    owner: Option<String>,
}

impl Dispatcher {
    pub fn new(market: Exchange, depth: usize, ctx: AppContext) -> Self {
        Self {
            market,
            depth: depth.max(1),
            ctx,
            dedup: Mutex::new(ExecutionDedup::new()),
            account: RwLock::new(String::new()),
            held: Mutex::new(Vec::new()),
        }
    }

    /// Set the account id and record the executions held until now under it.
    pub fn set_account(&self, account: &str) {
        let held = {
            let mut held = self.held.lock();
            *self.account.write() = account.to_string();
            if account.is_empty() { Vec::new() } else { std::mem::take(&mut *held) }
        };
        if !held.is_empty() {
            debug!("[{}] recording {} execution(s) held for the account id", self.market, held.len());
        }
        for Held { mut exec, owner } in held {
            exec.account = account.to_string();
            if self.dedup.lock().check_and_insert(self.market, &exec) {
                self.record(&exec, |_| owner);
            }
        }
    }

    pub fn account(&self) -> String {
        self.account.read().clone()
    }

    /// Forget the executions seen so far; the store still rejects repeats.
    pub fn reset(&self) {
        self.dedup.lock().clear_market(self.market);
    }

    pub fn apply(&self, msg: &StreamMessage) {
        for row in &msg.rows {
            match row {
                Row::Book(book) => self.apply_book(book),
                Row::Ticker(ticker) => self.apply_ticker(ticker),
                Row::Position(pos) => self.apply_position(msg.action, pos),
                Row::Margin(margin) => self.apply_margin(msg.action, margin),
                Row::Order(order) => self.ctx.bus.ledger(self.ctx.ledger.apply_order_row(msg.action, order)),
                Row::Execution(exec) => {
                    self.ingest(exec, Source::Stream);
                }
            }
        }
    }

    /// Record one execution. Returns `false` for a repeat.
    ///
    /// Before the account id is known, an execution without one is held:
    /// the ledger sees it at once, the store and the bots once
    /// [`set_account`](Self::set_account) stamps it.
    pub fn ingest(&self, exec: &Execution, source: Source) -> bool {
        let mut exec = exec.clone();
        if exec.account.is_empty() {
            let mut held = self.held.lock();
            exec.account = self.account();
            if exec.account.is_empty() {
                if held.iter().any(|h| h.exec.exec_id == exec.exec_id && h.exec.qty == exec.qty) {
                    return false;
                }
                let owner = self.owner(&exec, source);
                debug!("[{}] holding execution {} until the account id is known", self.market, exec.exec_id);
                held.push(Held { exec, owner });
                return true;
            }
        }
        if !self.dedup.lock().check_and_insert(self.market, &exec) {
            return false;
        }
        self.record(&exec, |e| self.owner(e, source))
    }

    /// The order an execution belongs to. A live fill also adjusts the
    /// ledger.
    fn owner(&self, exec: &Execution, source: Source) -> Option<String> {
        match source {
            Source::Stream => {
                let outcome = self.ctx.ledger.apply_execution(exec);
                self.ctx.bus.ledger(outcome.change);
                Some(outcome.cl_ord_id)
            }
            Source::History => exec.cl_ord_id.clone(),
        }
    }

    /// Store a deduplicated execution, then resolve its order and credit the
    /// bot. A record the store already holds goes no further.
    fn record(&self, exec: &Execution, owner: impl FnOnce(&Execution) -> Option<String>) -> bool {
        match self.ctx.store.insert_execution(self.market, exec) {
            Ok(true) => {}
            Ok(false) => {
                debug!("[{}] execution {} already stored", self.market, exec.exec_id);
                return false;
            }
            Err(e) => warn!("[{}] {e}", self.market),
        }
        if let Some(cl_ord_id) = owner(exec) {
            self.ctx.bots.apply_execution(self.market, &cl_ord_id, exec);
        }
        true
    }

    /// Book rows are full replacements of the kept depth.
    fn apply_book(&self, book: &BookRow) {
        let depth = self.depth;
        let applied =
            self.ctx.catalog.update(&book.key, |inst| inst.set_book(book.bids.clone(), book.asks.clone(), depth));
        if applied.is_none() {
            debug!("[{}] book for unknown {}", self.market, book.key);
        }
    }

    fn apply_ticker(&self, ticker: &TickerRow) {
        let Some(key) = &ticker.key else {
            return;
        };
        let quote_only = self.depth == 1;
        self.ctx.catalog.update(key, |inst| {
            if let Some(bid) = ticker.bid.filter(|_| quote_only || inst.bids.is_empty()) {
                inst.bids = vec![bid];
            }
            if let Some(ask) = ticker.ask.filter(|_| quote_only || inst.asks.is_empty()) {
                inst.asks = vec![ask];
            }
            if let Some(mark) = ticker.mark_price {
                inst.mark_price = mark;
            }
        });
    }

    fn apply_position(&self, action: Action, pos: &PositionRow) {
        let applied = self.ctx.catalog.update(&pos.key, |inst| {
            if action == Action::Delete {
                inst.current_qty = 0.0;
                inst.avg_entry_price = 0.0;
                inst.unrealized_pnl = 0.0;
                inst.margin_call_price = 0.0;
                return;
            }
            if let Some(qty) = pos.qty {
                inst.current_qty = qty;
            }
            if let Some(price) = pos.avg_entry_price {
                inst.avg_entry_price = price;
            }
            if let Some(pnl) = pos.unrealized_pnl {
                inst.unrealized_pnl = pnl;
            }
            if let Some(price) = pos.margin_call_price {
                inst.margin_call_price = price;
            }
        });
        if applied.is_none() {
            debug!("[{}] position for unconfigured {}", self.market, pos.key);
        }
    }

    fn apply_margin(&self, action: Action, margin: &MarginRow) {
        if action == Action::Delete {
            return;
        }
        self.ctx.accounts.upsert(&margin.key, |acc| {
            if let Some(v) = margin.wallet_balance {
                acc.wallet_balance = v;
            }
            if let Some(v) = margin.margin_balance {
                acc.margin_balance = v;
            }
            if let Some(v) = margin.available_margin {
                acc.available_margin = v;
            }
            if let Some(v) = margin.order_margin {
                acc.order_margin = v;
            }
            if let Some(v) = margin.position_margin {
                acc.position_margin = v;
            }
            if let Some(v) = margin.unrealized_pnl {
                acc.unrealized_pnl = v;
            }
        });
    }

    /// Snapshot rows fetched over REST.
    pub fn apply_snapshot(&self, rows: Vec<Row>) {
        let count = rows.len();
        self.apply(&StreamMessage::new(Action::Partial, rows));
        debug!("[{}] applied {count} snapshot row(s)", self.market);
    }
}
