//! Scripted adapter for connection and supervisor tests.

use std::collections::VecDeque;
use std::sync::Arc;

use ahash::AHashMap;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mx_core::config::{BotConfig, MarketConfig, SymbolConfig};
use mx_core::error::{ExResult, ExchangeError};
use mx_core::time_util::from_ms;
use mx_core::ws::StreamProtocol;
use mx_core::{
    Category, Exchange, ExecType, Execution, HistoryPage, Instrument, InstrumentCatalog, Kline, LimitOrder, MarginRow,
    Order, OrderAck, OrderRow, PositionRow, Side, SymbolKey, Timeframe,
};
use mx_exchange::ExchangeAdapter;
use parking_lot::Mutex;

use crate::connection::MarketConnection;
use crate::context::AppContext;
use crate::event::EventStreams;
use crate::store::MemoryStore;

pub struct FakeAdapter {
    pub market: Exchange,
    pub catalog: InstrumentCatalog,
    pub store: Arc<MemoryStore>,
    instruments: Vec<Instrument>,
    calls: Mutex<Vec<&'static str>>,
    failures: Mutex<AHashMap<&'static str, ExchangeError>>,
    pub open: Mutex<Vec<OrderRow>>,
    pub positions: Mutex<Vec<PositionRow>>,
    pub history: Mutex<VecDeque<Vec<Execution>>>,
    pub history_starts: Mutex<Vec<DateTime<Utc>>>,
    pub funding: Mutex<Vec<Execution>>,
    pub bars: Mutex<Vec<Kline>>,
    pub placed: Mutex<Vec<LimitOrder>>,
    pub replaced: Mutex<Vec<(String, f64)>>,
}

impl FakeAdapter {
    pub fn new(market: Exchange, instruments: Vec<Instrument>) -> Arc<Self> {
        Arc::new(Self {
            market,
            catalog: InstrumentCatalog::new(),
            store: Arc::new(MemoryStore::new()),
            instruments,
            calls: Mutex::new(Vec::new()),
            failures: Mutex::new(AHashMap::new()),
            open: Mutex::new(Vec::new()),
            positions: Mutex::new(Vec::new()),
            history: Mutex::new(VecDeque::new()),
            history_starts: Mutex::new(Vec::new()),
            funding: Mutex::new(Vec::new()),
            bars: Mutex::new(Vec::new()),
            placed: Mutex::new(Vec::new()),
            replaced: Mutex::new(Vec::new()),
        })
    }

    pub fn fail_with(&self, op: &'static str, err: ExchangeError) {
        self.failures.lock().insert(op, err);
    }

    pub fn clear_failures(&self) {
        self.failures.lock().clear();
    }

    pub fn count(&self, op: &str) -> usize {
        self.calls.lock().iter().filter(|c| **c == op).count()
    }

    fn call(&self, op: &'static str) -> ExResult<()> {
        self.calls.lock().push(op);
        match self.failures.lock().get(op) {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl ExchangeAdapter for FakeAdapter {
    fn exchange(&self) -> Exchange {
        self.market
    }

    async fn get_active_instruments(&self) -> ExResult<()> {
        self.call("instruments")?;
        for inst in &self.instruments {
            self.catalog.upsert(&inst.key, |existing| {
                let (bids, asks) = (existing.bids.clone(), existing.asks.clone());
                *existing = inst.clone();
                existing.bids = bids;
                existing.asks = asks;
            });
        }
        Ok(())
    }

    async fn get_user(&self) -> ExResult<String> {
        self.call("user")?;
        Ok("acct".into())
    }

    fn account_id(&self) -> String {
        "acct".into()
    }

    async fn get_wallet_balance(&self) -> ExResult<Vec<MarginRow>> {
        self.call("balances")?;
        Ok(Vec::new())
    }

    async fn get_position_info(&self) -> ExResult<Vec<PositionRow>> {
        self.call("positions")?;
        Ok(self.positions.lock().clone())
    }

    async fn open_orders(&self) -> ExResult<Vec<OrderRow>> {
        self.call("open_orders")?;
        Ok(self.open.lock().clone())
    }

    async fn place_limit(&self, order: &LimitOrder) -> ExResult<OrderAck> {
        self.call("place")?;
        self.placed.lock().push(order.clone());
        Ok(OrderAck {
            order_id: format!("x-{}", order.cl_ord_id),
            cl_ord_id: order.cl_ord_id.clone(),
            price: order.price,
            leaves_qty: Some(order.qty.abs()),
            timestamp: Utc::now(),
        })
    }

    async fn replace_limit(&self, order: &Order, price: f64) -> ExResult<OrderAck> {
        self.call("replace")?;
        self.replaced.lock().push((order.cl_ord_id.clone(), price));
        Ok(OrderAck {
            order_id: order.order_id.clone(),
            cl_ord_id: order.cl_ord_id.clone(),
            price,
            leaves_qty: None,
            timestamp: Utc::now(),
        })
    }

    async fn remove_order(&self, _order: &Order) -> ExResult<()> {
        self.call("remove")
    }

    async fn trade_bucketed(
        &self,
        _key: &SymbolKey,
        _start: DateTime<Utc>,
        _timeframe: Timeframe,
    ) -> ExResult<Vec<Kline>> {
        self.call("klines")?;
        Ok(self.bars.lock().clone())
    }

    async fn trading_history(&self, count: usize, start: DateTime<Utc>) -> ExResult<HistoryPage> {
        self.call("history")?;
        self.history_starts.lock().push(start);
        let records = self.history.lock().pop_front().unwrap_or_default();
        Ok(HistoryPage { more: records.len() >= count, records })
    }

    async fn funding_history(&self, _start: DateTime<Utc>) -> ExResult<Vec<Execution>> {
        self.call("funding")?;
        Ok(self.funding.lock().clone())
    }

    fn stream_protocols(&self) -> Vec<Arc<dyn StreamProtocol>> {
        Vec::new()
    }
}

/// Connection over `fake` sharing its catalog and store, with no settle
/// delay.
pub fn connection(fake: &Arc<FakeAdapter>, private: bool) -> (Arc<MarketConnection>, AppContext, EventStreams) {
    let (mut ctx, streams) = AppContext::new(fake.store.clone());
    ctx.catalog = fake.catalog.clone();
    let symbols = fake
        .instruments
        .iter()
        .map(|i| SymbolConfig { ticker: i.key.ticker.clone(), category: Category::Linear })
        .collect();
    let mut config = MarketConfig::new(fake.market, symbols);
    config.reload_delay_ms = 0;
    if private {
        config.api_key = "key".into();
        config.api_secret = "secret".into();
    }
    let adapter: Arc<dyn ExchangeAdapter> = fake.clone();
    (MarketConnection::new(config, adapter, ctx.clone()), ctx, streams)
}

pub fn instrument(ticker: &str, market: Exchange, tick: f64, step: f64, min: f64) -> Instrument {
    let mut inst = Instrument::new(SymbolKey::new(ticker, market));
    inst.set_increments(tick, step, min);
    inst
}

pub fn bot(name: &str, market: Exchange, symbol: &str, limit: f64) -> BotConfig {
    BotConfig { name: name.into(), market, symbol: symbol.into(), timeframe: Timeframe::M1, limit }
}

pub fn order_row(
    ticker: &str,
    market: Exchange,
    order_id: &str,
    cl_ord_id: &str,
    side: Side,
    price: f64,
    leaves: f64,
) -> OrderRow {
    let mut row = OrderRow::new(SymbolKey::new(ticker, market), order_id);
    row.cl_ord_id = Some(cl_ord_id.into());
    row.side = Some(side);
    row.price = Some(price);
    row.leaves_qty = Some(leaves);
    row
}

/// A trade `secs` seconds after the epoch.
pub fn exec_at(id: &str, secs: i64) -> Execution {
    Execution {
        exec_id: id.into(),
        order_id: format!("o-{id}"),
        cl_ord_id: None,
        key: SymbolKey::new("BTCUSDT", Exchange::Bybit),
        side: Side::Buy,
        qty: 0.001,
        price: 50_000.0,
        fee: 0.01,
        fee_currency: "USDT".into(),
        timestamp: from_ms(secs * 1000),
        exec_type: ExecType::Trade,
        leaves_qty: Some(0.0),
        account: "acct".into(),
    }
}
