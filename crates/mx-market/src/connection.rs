//! One exchange end to end.
//!
//! # Bootstrap
//!
//! ```text
//! 1. instruments (REST)
//! 2. stream sessions, handshake and account subscriptions
//! 3. open orders (REST)                  hard gate
//! 4. symbol subscriptions | user | balances | positions   concurrently
//! 5. trade and funding history since the checkpoint
//! ```
//!
//! Stages 3 to 5 only run with credentials. A stage error other than IGNORE
//! or BLOCK stops the sequence. Stage 4 stops at the first CANCEL; its other
//! errors merge by precedence.
//! BLOCK is flagged and the data stages go on, so the market comes up with
//! trading blocked; the supervisor reloads it after a backoff to re-check.
//! Any other final error is flagged on the connection, and FATAL or RETRY
//! get the market reloaded by the supervisor.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures_util::future::join_all;
use mx_core::config::MarketConfig;
use mx_core::error::{ExResult, ExchangeError};
use mx_core::precision::{QTY_EPS, Rounding, round_price, round_qty};
use mx_core::time_util::{next_daily, now_ms};
use mx_core::ws::{SessionEvent, StreamSession};
use mx_core::{
    ConnectionStatus, ErrorKind, Exchange, Execution, Instrument, Kline, LimitOrder, Order, Row, Side, SymbolKey,
    Timeframe,
};
use mx_exchange::{ExchangeAdapter, history};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::context::AppContext;
use crate::dispatch::{Dispatcher, Source};
use crate::event::EventBus;

/// Attempts of the scheduled funding poll.
const FUNDING_ATTEMPTS: u32 = 3;
const FUNDING_RETRY_DELAY: Duration = Duration::from_secs(30);

/// Replay window when nothing was checkpointed and no start is configured.
const DEFAULT_HISTORY_DAYS: i64 = 1;

/// Mutable connection state.
#[derive(Debug, Clone, Default)]
pub struct MarketState {
    pub status: ConnectionStatus,
    /// `None` while healthy, otherwise the dominant unresolved error.
    pub error: Option<ErrorKind>,
    /// Private REST calls succeeded during the last bootstrap.
    pub api_active: bool,
    /// Tickers whose symbol channels are acknowledged.
    pub subscribed: Vec<String>,
    /// Wall-clock ms at which trading was blocked.
    pub blocked_since_ms: Option<i64>,
}

/// What the supervisor should do with a market.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Health {
    Healthy,
    /// Flagged FATAL or RETRY.
    NeedsReload(ErrorKind),
    /// No inbound message within the staleness window.
    Stale,
    /// Trading blocked for this many ms; the feed is still up.
    Blocked(i64),
    /// CANCEL: left alone until restart.
    Stopped,
}

pub struct MarketConnection {
    market: Exchange,
    config: MarketConfig,
    adapter: Arc<dyn ExchangeAdapter>,
    ctx: AppContext,
    dispatcher: Arc<Dispatcher>,
    state: Arc<Mutex<MarketState>>,
    /// Wall-clock ms of the last stream message, 0 before the first.
    last_message: Arc<AtomicI64>,
    sessions: tokio::sync::Mutex<Vec<StreamSession>>,
    /// Held for the whole of a start or reload.
    reload_lock: tokio::sync::Mutex<()>,
    /// Stream consumer and funding poll.
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl MarketConnection {
    pub fn new(config: MarketConfig, adapter: Arc<dyn ExchangeAdapter>, ctx: AppContext) -> Arc<Self> {
        let market = config.exchange;
        let dispatcher = Arc::new(Dispatcher::new(market, config.depth().levels(), ctx.clone()));
        Arc::new(Self {
            market,
            config,
            adapter,
            ctx,
            dispatcher,
            state: Arc::new(Mutex::new(MarketState::default())),
            last_message: Arc::new(AtomicI64::new(0)),
            sessions: tokio::sync::Mutex::new(Vec::new()),
            reload_lock: tokio::sync::Mutex::new(()),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn market(&self) -> Exchange {
        self.market
    }

    pub fn config(&self) -> &MarketConfig {
        &self.config
    }

    pub fn state(&self) -> MarketState {
        self.state.lock().clone()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.state.lock().status
    }

    pub fn last_message_ms(&self) -> i64 {
        self.last_message.load(Ordering::Relaxed)
    }

    pub fn account_id(&self) -> String {
        self.dispatcher.account()
    }

    pub fn instrument(&self, ticker: &str) -> Option<Instrument> {
        self.ctx.catalog.get(&SymbolKey::new(ticker, self.market))
    }

    /// Open orders of this market, oldest first.
    pub fn orders(&self) -> Vec<Order> {
        self.ctx.ledger.market_orders(self.market)
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// First bootstrap. A concurrent start or reload makes this a no-op.
    pub async fn start(self: &Arc<Self>) -> ExResult<()> {
        let Ok(_guard) = self.reload_lock.try_lock() else {
            debug!("[{}] start skipped, bootstrap already running", self.market);
            return Ok(());
        };
        self.run_bootstrap().await
    }

    /// Tear down, wait the settle delay, bootstrap again. At most one reload
    /// runs per market; a second caller returns immediately.
    pub async fn reload(self: &Arc<Self>) -> ExResult<()> {
        let Ok(_guard) = self.reload_lock.try_lock() else {
            debug!("[{}] reload already in progress", self.market);
            return Ok(());
        };
        self.set_status(ConnectionStatus::Reloading);
        self.ctx.bus.info(self.market, "reloading");
        self.teardown().await;
        self.ctx.ledger.clear_market(self.market);
        self.dispatcher.reset();
        self.ctx.bus.clear(self.market);
        self.ctx.catalog.reset_live(self.market);
        self.last_message.store(0, Ordering::Relaxed);
        {
            let mut state = self.state.lock();
            state.subscribed.clear();
            state.api_active = false;
        }
        tokio::time::sleep(self.config.reload_delay()).await;
        self.run_bootstrap().await
    }

    /// Close every stream and stop background tasks.
    pub async fn stop(&self) {
        self.teardown().await;
        self.set_status(ConnectionStatus::Stopped);
        info!("[{}] stopped", self.market);
    }

    pub fn health(&self, now_ms: i64, stale_after_ms: i64) -> Health {
        let state = self.state.lock();
        match state.error {
            Some(ErrorKind::Cancel) => return Health::Stopped,
            Some(kind @ (ErrorKind::Fatal | ErrorKind::Retry)) => return Health::NeedsReload(kind),
            _ => {}
        }
        let last = self.last_message_ms();
        let streaming = matches!(state.status, ConnectionStatus::Online | ConnectionStatus::Blocked);
        if streaming && last > 0 && now_ms - last > stale_after_ms {
            return Health::Stale;
        }
        match state.blocked_since_ms {
            Some(since) if state.error == Some(ErrorKind::Block) => Health::Blocked(now_ms - since),
            _ => Health::Healthy,
        }
    }

    /// Record an error raised outside the connection (staleness).
    pub fn flag(&self, err: &ExchangeError) {
        self.ctx.bus.report(self.market, err);
        flag_state(&self.state, err.kind);
    }

    async fn run_bootstrap(self: &Arc<Self>) -> ExResult<()> {
        {
            let mut state = self.state.lock();
            state.error = None;
            state.blocked_since_ms = None;
        }
        match self.bootstrap().await {
            Ok(()) => {
                let blocked = {
                    let mut state = self.state.lock();
                    let blocked = state.error == Some(ErrorKind::Block);
                    state.status = if blocked { ConnectionStatus::Blocked } else { ConnectionStatus::Online };
                    state.api_active = self.config.has_credentials();
                    blocked
                };
                if self.config.has_credentials() {
                    self.spawn_funding_poll();
                }
                self.ctx.bus.info(self.market, if blocked { "online, trading blocked" } else { "online" });
                Ok(())
            }
            Err(err) => {
                self.flag(&err);
                if err.kind == ErrorKind::Cancel {
                    self.teardown().await;
                }
                Err(err)
            }
        }
    }

    async fn bootstrap(&self) -> ExResult<()> {
        let market = self.market;
        self.set_status(ConnectionStatus::Connecting);
        self.seed_cached_instruments();

        self.pass_block(self.tolerate(self.adapter.get_active_instruments().await))?;
        let instruments = self.ctx.catalog.market(market);
        if let Err(e) = self.ctx.store.save_instruments(market, &instruments) {
            warn!("[{market}] {e}");
        }
        self.ctx.bus.info(market, format!("{} instrument(s) loaded", instruments.len()));

        self.open_streams().await?;

        let private = self.config.has_credentials();
        if private {
            let orders = self.adapter.open_orders().await.map_err(|e| match e.kind {
                ErrorKind::Cancel => e,
                _ => ExchangeError::fatal(format!("open orders: {}", e.message)),
            })?;
            info!("[{market}] {} open order(s)", orders.len());
            self.dispatcher.apply_snapshot(orders.into_iter().map(Row::Order).collect());
        }

        self.pass_block(self.parallel_stage(private).await.map(Some))?;

        if private {
            self.pass_block(self.tolerate(self.replay_history().await))?;
        }
        Ok(())
    }

    /// Cached metadata makes instruments readable before REST answers.
    fn seed_cached_instruments(&self) {
        if !self.ctx.catalog.market(self.market).is_empty() {
            return;
        }
        let cached = self.ctx.store.cached_instruments(self.market);
        if !cached.is_empty() {
            debug!("[{}] seeding {} cached instrument(s)", self.market, cached.len());
        }
        for inst in cached {
            self.ctx.catalog.insert(inst);
        }
    }

    async fn open_streams(&self) -> ExResult<()> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.spawn_consumer(rx);
        let mut sessions = self.sessions.lock().await;
        for protocol in self.adapter.stream_protocols() {
            sessions.push(StreamSession::new(protocol));
            if let Some(session) = sessions.last_mut() {
                session.start(tx.clone()).await?;
            }
        }
        Ok(())
    }

    /// Single consumer of every session of this market.
    fn spawn_consumer(&self, mut rx: mpsc::UnboundedReceiver<SessionEvent>) {
        let market = self.market;
        let dispatcher = Arc::clone(&self.dispatcher);
        let state = Arc::clone(&self.state);
        let last_message = Arc::clone(&self.last_message);
        let bus: EventBus = self.ctx.bus.clone();
        let handle = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                match event {
                    SessionEvent::Messages(messages) => {
                        last_message.store(now_ms(), Ordering::Relaxed);
                        for msg in &messages {
                            dispatcher.apply(msg);
                        }
                    }
                    SessionEvent::Closed { label, error } => {
                        warn!("[{market}] session {label} closed");
                        bus.report(market, &error);
                        flag_state(&state, error.kind);
                    }
                }
            }
        });
        self.tasks.lock().push(handle);
    }

    async fn parallel_stage(&self, private: bool) -> ExResult<()> {
        let sessions = self.sessions.lock().await;
        let subscribe = async {
            let results = join_all(sessions.iter().map(|s| s.subscribe_symbols())).await;
            results.into_iter().collect::<ExResult<Vec<()>>>().map(|_| ())
        };

        if !private {
            let result = subscribe.await;
            drop(sessions);
            if self.tolerate(result)?.is_some() {
                self.mark_subscribed();
            }
            return Ok(());
        }

        let joined = tokio::try_join!(
            async { cancel_fast(subscribe.await) },
            async { cancel_fast(self.adapter.get_user().await) },
            async { cancel_fast(self.adapter.get_wallet_balance().await) },
            async { cancel_fast(self.adapter.get_position_info().await) },
        );
        drop(sessions);
        let (subscribed, user, balances, positions) = joined?;

        let mut errors = Vec::new();
        match subscribed {
            Ok(()) => self.mark_subscribed(),
            Err(e) => errors.push(e),
        }
        match user {
            Ok(id) => {
                info!("[{}] account {id}", self.market);
                self.dispatcher.set_account(&id);
            }
            Err(e) => errors.push(e),
        }
        match balances {
            Ok(rows) => self.dispatcher.apply_snapshot(rows.into_iter().map(Row::Margin).collect()),
            Err(e) => errors.push(e),
        }
        match positions {
            Ok(rows) => self.dispatcher.apply_snapshot(rows.into_iter().map(Row::Position).collect()),
            Err(e) => errors.push(e),
        }
        self.merge_errors(errors)
    }

    /// Report every error but the dominant one, which is returned.
    fn merge_errors(&self, errors: Vec<ExchangeError>) -> ExResult<()> {
        let mut dominant: Option<ExchangeError> = None;
        for err in errors {
            if err.kind == ErrorKind::Ignore {
                self.ctx.bus.report(self.market, &err);
                continue;
            }
            match &dominant {
                Some(current) if current.kind.merge(err.kind) == current.kind => self.ctx.bus.report(self.market, &err),
                _ => {
                    if let Some(previous) = dominant.replace(err) {
                        self.ctx.bus.report(self.market, &previous);
                    }
                }
            }
        }
        dominant.map_or(Ok(()), Err)
    }

    fn mark_subscribed(&self) {
        self.state.lock().subscribed = self.config.symbols.iter().map(|s| s.ticker.clone()).collect();
    }

    /// IGNORE is reported and swallowed; every other error passes through.
    fn tolerate<T>(&self, result: ExResult<T>) -> ExResult<Option<T>> {
        match result {
            Ok(v) => Ok(Some(v)),
            Err(e) if e.kind == ErrorKind::Ignore => {
                self.ctx.bus.report(self.market, &e);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// BLOCK stops trading, not the feed: it is flagged and the stage counts
    /// as done.
    fn pass_block<T>(&self, result: ExResult<Option<T>>) -> ExResult<Option<T>> {
        match result {
            Err(e) if e.kind == ErrorKind::Block => {
                self.flag(&e);
                Ok(None)
            }
            other => other,
        }
    }

    async fn teardown(&self) {
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            task.abort();
        }
        let mut sessions = self.sessions.lock().await;
        for session in sessions.iter_mut() {
            session.stop().await;
        }
        sessions.clear();
    }

    fn set_status(&self, status: ConnectionStatus) {
        self.state.lock().status = status;
    }

    // -----------------------------------------------------------------------
    // History
    // -----------------------------------------------------------------------

    fn history_start(&self) -> DateTime<Utc> {
        self.ctx
            .store
            .checkpoint(self.market, &self.dispatcher.account())
            .or(self.config.history_start)
            .unwrap_or_else(|| Utc::now() - ChronoDuration::days(DEFAULT_HISTORY_DAYS))
    }

    /// Page through trade history from the checkpoint, then funding.
    /// Returns the number of newly recorded executions.
    ///
    /// Records at a page's last timestamp are held back until the next page,
    /// which starts at that timestamp: a fill split into legs across the
    /// boundary is merged once, and the repeated records are dropped.
    pub async fn replay_history(&self) -> ExResult<usize> {
        let market = self.market;
        let account = self.dispatcher.account();
        let chunk = self.config.history_chunk.max(1);
        let from = self.history_start();
        let mut start = from;
        let mut carried: Vec<Execution> = Vec::new();
        let mut fresh = 0usize;
        let mut pages = 0usize;

        loop {
            let page = self.adapter.trading_history(chunk, start).await?;
            pages += 1;
            let mut records = history::join_pages(std::mem::take(&mut carried), page.records);
            let Some(last) = records.last().map(|e| e.timestamp) else {
                break;
            };
            // A full page inside one timestamp must still make progress.
            let advancing = page.more && last > start;
            if advancing {
                let split = records.partition_point(|e| e.timestamp < last);
                carried = records.split_off(split);
            }
            fresh += self.ingest_history(&history::merge_split_legs(records));
            self.ctx.store.set_checkpoint(market, &account, last)?;
            if !page.more {
                break;
            }
            start = if advancing { last } else { start + ChronoDuration::milliseconds(1) };
        }

        let funding = self.adapter.funding_history(from).await?;
        fresh += self.ingest_history(&funding);
        if let Some(newest) = funding.iter().map(|e| e.timestamp).max() {
            self.ctx.store.set_checkpoint(market, &account, newest)?;
        }
        info!("[{market}] history replayed: {pages} page(s), {fresh} new record(s) since {from}");
        Ok(fresh)
    }

    fn ingest_history(&self, rows: &[Execution]) -> usize {
        rows.iter().filter(|exec| self.dispatcher.ingest(exec, Source::History)).count()
    }

    /// Daily poll for exchanges that do not stream funding.
    fn spawn_funding_poll(self: &Arc<Self>) {
        let Some(at) = self.adapter.funding_poll_time() else {
            return;
        };
        let market = self.market;
        let weak = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            loop {
                let now = Utc::now();
                let next = next_daily(now, at);
                debug!("[{market}] next funding poll at {next}");
                tokio::time::sleep((next - now).to_std().unwrap_or_default()).await;
                let Some(conn) = weak.upgrade() else {
                    return;
                };
                conn.poll_funding().await;
            }
        });
        self.tasks.lock().push(handle);
    }

    /// Fetch funding since the checkpoint. Nothing new is retried, since the
    /// exchange may not have booked the payment yet.
    pub async fn poll_funding(&self) -> usize {
        for attempt in 1..=FUNDING_ATTEMPTS {
            match self.adapter.funding_history(self.history_start()).await {
                Ok(rows) => {
                    let fresh = self.ingest_history(&rows);
                    if let Some(newest) = rows.iter().map(|e| e.timestamp).max() {
                        if let Err(e) = self.ctx.store.set_checkpoint(self.market, &self.dispatcher.account(), newest) {
                            warn!("[{}] {e}", self.market);
                        }
                    }
                    if fresh > 0 {
                        self.ctx.bus.info(self.market, format!("{fresh} funding record(s)"));
                        return fresh;
                    }
                    debug!("[{}] funding poll {attempt}/{FUNDING_ATTEMPTS}: nothing new", self.market);
                }
                Err(e) => self.ctx.bus.report(self.market, &e),
            }
            if attempt < FUNDING_ATTEMPTS {
                tokio::time::sleep(FUNDING_RETRY_DELAY).await;
            }
        }
        0
    }

    // -----------------------------------------------------------------------
    // Trading
    // -----------------------------------------------------------------------

    /// Buy for bot `emi`. `qty` defaults to the minimum order size, `price`
    /// to the best bid. Returns `None` when the position limit leaves
    /// nothing to buy.
    pub async fn buy(&self, emi: &str, qty: Option<f64>, price: Option<f64>) -> ExResult<Option<String>> {
        self.place(emi, Side::Buy, qty, price).await
    }

    /// Sell for bot `emi`; `price` defaults to the best ask.
    pub async fn sell(&self, emi: &str, qty: Option<f64>, price: Option<f64>) -> ExResult<Option<String>> {
        self.place(emi, Side::Sell, qty, price).await
    }

    async fn place(&self, emi: &str, side: Side, qty: Option<f64>, price: Option<f64>) -> ExResult<Option<String>> {
        let market = self.market;
        let bot = self
            .ctx
            .bots
            .get(emi)
            .filter(|b| b.config.market == market)
            .ok_or_else(|| ExchangeError::ignore(format!("[{market}] no bot {emi}")))?;
        let key = bot.key();
        let inst = self.ctx.catalog.get(&key).ok_or_else(|| ExchangeError::ignore(format!("{key} not loaded")))?;

        let room = match side {
            Side::Buy => bot.config.limit - bot.position,
            Side::Sell => bot.config.limit + bot.position,
        };
        let qty = round_qty(qty.unwrap_or(inst.min_order_qty).min(room).max(0.0), inst.qty_step);
        if qty <= QTY_EPS {
            debug!("[{market}] {emi} {side} clamped to zero (position {}, limit {})", bot.position, bot.config.limit);
            return Ok(None);
        }
        let (quote, mode) = match side {
            Side::Buy => (inst.best_bid(), Rounding::Down),
            Side::Sell => (inst.best_ask(), Rounding::Up),
        };
        let price = price.or(quote).ok_or_else(|| ExchangeError::ignore(format!("{key}: no price")))?;
        let price = round_price(price, inst.tick_size, mode);

        self.ensure_trading()?;
        let cl_ord_id = self.ctx.ledger.next_cl_ord_id(emi);
        let request = LimitOrder {
            key: key.clone(),
            qty: qty * side.sign(),
            price,
            cl_ord_id: cl_ord_id.clone(),
            order_id: None,
        };
        let ack = self.adapter.place_limit(&request).await.map_err(|e| self.trading_error(e))?;

        let change = self.ctx.ledger.upsert(Order {
            cl_ord_id: cl_ord_id.clone(),
            key: key.clone(),
            side,
            price: if ack.price > 0.0 { ack.price } else { price },
            leaves_qty: ack.leaves_qty.unwrap_or(qty),
            orig_qty: qty,
            order_id: ack.order_id,
            timestamp: ack.timestamp,
            emi: emi.to_string(),
        });
        self.ctx.bus.ledger(change);
        info!("[{market}] {side} {qty} {key} @ {price} as {cl_ord_id}");
        Ok(Some(cl_ord_id))
    }

    /// Move an open order. The price is rounded in the order's favour
    /// (buys down, sells up); an unchanged price sends nothing.
    pub async fn replace(&self, cl_ord_id: &str, price: f64) -> ExResult<String> {
        let order = self
            .ctx
            .ledger
            .get(cl_ord_id)
            .ok_or_else(|| ExchangeError::ignore(format!("[{}] {cl_ord_id} not found", self.market)))?;
        let tick = self.ctx.catalog.with(&order.key, |i| i.tick_size).unwrap_or(0.0);
        let mode = match order.side {
            Side::Buy => Rounding::Down,
            Side::Sell => Rounding::Up,
        };
        let price = round_price(price, tick, mode);
        if (price - order.price).abs() <= f64::EPSILON.max(tick * 1e-6) {
            debug!("[{}] {cl_ord_id} already at {price}", self.market);
            return Ok(cl_ord_id.to_string());
        }

        self.ensure_trading()?;
        let ack = match self.adapter.replace_limit(&order, price).await {
            Ok(ack) => ack,
            Err(e) => {
                if e.order_gone {
                    warn!("[{}] {cl_ord_id} no longer open after failed replace", self.market);
                    self.ctx.bus.ledger(self.ctx.ledger.remove(cl_ord_id));
                }
                return Err(self.trading_error(e));
            }
        };
        self.ctx.bus.ledger(self.ctx.ledger.apply_replace(cl_ord_id, &ack));
        info!("[{}] {cl_ord_id} moved {} -> {price}", self.market, order.price);
        Ok(cl_ord_id.to_string())
    }

    /// Cancel an open order. Unknown ids and orders the exchange no longer
    /// has are not errors.
    pub async fn remove(&self, cl_ord_id: &str) -> ExResult<()> {
        let Some(order) = self.ctx.ledger.get(cl_ord_id) else {
            debug!("[{}] {cl_ord_id} not in ledger, nothing to cancel", self.market);
            return Ok(());
        };
        match self.adapter.remove_order(&order).await {
            Ok(()) => {}
            Err(e) if e.kind == ErrorKind::Ignore => {
                debug!("[{}] {cl_ord_id} already closed: {}", self.market, e.message)
            }
            Err(e) => return Err(self.trading_error(e)),
        }
        self.ctx.bus.ledger(self.ctx.ledger.remove(cl_ord_id));
        Ok(())
    }

    /// Closed bars for `ticker` from `start`.
    pub async fn klines(&self, ticker: &str, timeframe: Timeframe, start: DateTime<Utc>) -> ExResult<Vec<Kline>> {
        let key = SymbolKey::new(ticker, self.market);
        self.adapter.trade_bucketed(&key, start, timeframe).await.inspect_err(|e| self.ctx.bus.report(self.market, e))
    }

    /// Up to `count` executions from `start`, split legs merged.
    pub async fn trading_history(&self, count: usize, start: DateTime<Utc>) -> ExResult<Vec<Execution>> {
        let page =
            self.adapter.trading_history(count, start).await.inspect_err(|e| self.ctx.bus.report(self.market, e))?;
        Ok(history::merge_split_legs(page.records))
    }

    fn ensure_trading(&self) -> ExResult<()> {
        if !self.config.has_credentials() {
            return Err(ExchangeError::cancel(format!("[{}] public mode, trading disabled", self.market)));
        }
        let state = self.state.lock();
        if state.error == Some(ErrorKind::Block) {
            return Err(ExchangeError::block(format!("[{}] trading blocked", self.market)));
        }
        if state.status != ConnectionStatus::Online {
            return Err(ExchangeError::retry(format!("[{}] not online ({:?})", self.market, state.status)));
        }
        Ok(())
    }

    /// Trading failures only change connection state for BLOCK and FATAL.
    fn trading_error(&self, err: ExchangeError) -> ExchangeError {
        self.ctx.bus.report(self.market, &err);
        if matches!(err.kind, ErrorKind::Block | ErrorKind::Fatal) {
            flag_state(&self.state, err.kind);
        }
        err
    }
}

/// Lift CANCEL into the outer result so a concurrent stage stops at the
/// first one; the remaining calls are dropped.
fn cancel_fast<T>(result: ExResult<T>) -> ExResult<ExResult<T>> {
    match result {
        Err(e) if e.kind == ErrorKind::Cancel => Err(e),
        other => Ok(other),
    }
}

fn flag_state(state: &Mutex<MarketState>, kind: ErrorKind) {
    if kind == ErrorKind::Ignore {
        return;
    }
    let mut state = state.lock();
    let merged = state.error.map_or(kind, |current| current.merge(kind));
    if merged == ErrorKind::Block && state.error != Some(ErrorKind::Block) {
        state.blocked_since_ms = Some(now_ms());
    }
    state.error = Some(merged);
    state.status = match merged {
        ErrorKind::Block => ConnectionStatus::Blocked,
        ErrorKind::Cancel => ConnectionStatus::Stopped,
        ErrorKind::Fatal | ErrorKind::Retry => ConnectionStatus::Reloading,
        ErrorKind::Ignore => state.status,
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use mx_core::PositionRow;

    use crate::event::OrderAction;
    use crate::testing::{FakeAdapter, bot, connection, exec_at, instrument, order_row};

    #[tokio::test]
    async fn default_buy_rounds_bid_down_to_tick() {
        let fake = FakeAdapter::new(Exchange::Bitmex, vec![instrument("XBTUSD", Exchange::Bitmex, 0.5, 1.0, 1.0)]);
        let (conn, ctx, _streams) = connection(&fake, true);
        ctx.bots.register(bot("bot", Exchange::Bitmex, "XBTUSD", 10.0));
        conn.start().await.unwrap();
        let key = SymbolKey::new("XBTUSD", Exchange::Bitmex);
        ctx.catalog.update(&key, |i| i.set_book(vec![[100.3, 5.0]], vec![[101.0, 5.0]], 1));

        let id = conn.buy("bot", None, None).await.unwrap().unwrap();
        let placed = fake.placed.lock().clone();
        assert_eq!(placed.len(), 1);
        assert_eq!((placed[0].price, placed[0].qty), (100.0, 1.0));
        assert_eq!(ctx.ledger.get(&id).unwrap().emi, "bot");
    }

    #[tokio::test]
    async fn buys_clamp_to_position_limit() {
        let fake = FakeAdapter::new(Exchange::Bybit, vec![instrument("BTCUSDT", Exchange::Bybit, 0.1, 0.001, 0.001)]);
        let (conn, ctx, _streams) = connection(&fake, true);
        ctx.bots.register(bot("b", Exchange::Bybit, "BTCUSDT", 0.01));
        conn.start().await.unwrap();

        ctx.bots.set_position("b", 0.008);
        conn.buy("b", Some(0.005), Some(50_000.0)).await.unwrap();
        assert!((fake.placed.lock()[0].qty - 0.002).abs() < 1e-12);

        ctx.bots.set_position("b", 0.01);
        assert_eq!(conn.buy("b", Some(0.005), Some(50_000.0)).await.unwrap(), None);
        ctx.bots.set_position("b", -0.01);
        assert_eq!(conn.sell("b", Some(0.005), Some(50_000.0)).await.unwrap(), None);
        assert_eq!(fake.placed.lock().len(), 1);
    }

    #[tokio::test]
    async fn replace_at_same_price_sends_nothing() {
        let fake = FakeAdapter::new(Exchange::Bitmex, vec![instrument("XBTUSD", Exchange::Bitmex, 0.5, 1.0, 1.0)]);
        fake.open.lock().push(order_row("XBTUSD", Exchange::Bitmex, "A", "7.bot", Side::Buy, 100.0, 5.0));
        let (conn, ctx, _streams) = connection(&fake, true);
        conn.start().await.unwrap();

        assert_eq!(conn.replace("7.bot", 100.2).await.unwrap(), "7.bot");
        assert!(fake.replaced.lock().is_empty());

        conn.replace("7.bot", 99.74).await.unwrap();
        assert_eq!(fake.replaced.lock().clone(), vec![("7.bot".to_string(), 99.5)]);
        assert_eq!(ctx.ledger.get("7.bot").unwrap().price, 99.5);
    }

    #[tokio::test]
    async fn replace_that_lost_the_order_drops_it() {
        let fake = FakeAdapter::new(Exchange::Mexc, vec![instrument("BTC_USDT", Exchange::Mexc, 0.1, 0.0001, 0.0001)]);
        fake.open.lock().push(order_row("BTC_USDT", Exchange::Mexc, "A", "3.bot", Side::Sell, 50_000.0, 0.02));
        let lost = ExchangeError::fatal("3.bot cancelled for replace, resubmit failed").with_order_gone();
        fake.fail_with("replace", lost);
        let (conn, ctx, mut streams) = connection(&fake, true);
        conn.start().await.unwrap();

        let err = conn.replace("3.bot", 50_100.0).await.unwrap_err();
        assert!(err.order_gone);
        assert!(ctx.ledger.get("3.bot").is_none());
        let actions: Vec<OrderAction> =
            std::iter::from_fn(|| streams.orders.try_recv().ok()).map(|e| e.action).collect();
        assert_eq!(actions, vec![OrderAction::Put, OrderAction::Delete]);
    }

    #[tokio::test]
    async fn remove_tolerates_closed_orders() {
        let fake =
            FakeAdapter::new(Exchange::Deribit, vec![instrument("BTC-PERPETUAL", Exchange::Deribit, 0.5, 10.0, 10.0)]);
        fake.open.lock().push(order_row("BTC-PERPETUAL", Exchange::Deribit, "A", "1.bot", Side::Sell, 50_000.0, 10.0));
        fake.fail_with("remove", ExchangeError::ignore("order not found"));
        let (conn, ctx, _streams) = connection(&fake, true);
        conn.start().await.unwrap();

        conn.remove("1.bot").await.unwrap();
        assert!(ctx.ledger.is_empty());
        conn.remove("1.bot").await.unwrap();
        assert_eq!(fake.count("remove"), 1);
    }

    #[tokio::test]
    async fn history_pages_until_short_page() {
        let fake = FakeAdapter::new(Exchange::Bybit, vec![instrument("BTCUSDT", Exchange::Bybit, 0.1, 0.001, 0.001)]);
        let page = |from: i64, n: i64| (from..from + n).map(|i| exec_at(&format!("e{i}"), i)).collect::<Vec<_>>();
        fake.history.lock().extend([page(0, 500), page(500, 500), page(1000, 120)]);
        let (conn, ctx, _streams) = connection(&fake, true);
        conn.start().await.unwrap();

        assert_eq!(fake.count("history"), 3);
        assert_eq!(ctx.store.checkpoint(Exchange::Bybit, "acct"), Some(exec_at("x", 1119).timestamp));
        assert_eq!(fake.history_starts.lock()[1], exec_at("x", 499).timestamp);
    }

    #[tokio::test]
    async fn split_fill_across_pages_is_merged_once() {
        let fake = FakeAdapter::new(Exchange::Bybit, vec![instrument("BTCUSDT", Exchange::Bybit, 0.1, 0.001, 0.001)]);
        let leg = |qty: f64| Execution { qty, ..exec_at("x", 600) };
        let mut first: Vec<Execution> = (0..499).map(|i| exec_at(&format!("e{i}"), i)).collect();
        first.push(leg(0.001));
        fake.history.lock().extend([first, vec![leg(0.001), leg(0.002), exec_at("e700", 700)]]);
        let (conn, _ctx, _streams) = connection(&fake, true);
        conn.start().await.unwrap();

        assert_eq!(fake.history_starts.lock()[1], exec_at("x", 600).timestamp);
        let stored = fake.store.executions(Exchange::Bybit);
        assert_eq!(stored.len(), 501);
        let merged: Vec<_> = stored.iter().filter(|e| e.exec_id == "x").collect();
        assert_eq!(merged.len(), 1);
        assert!((merged[0].qty - 0.003).abs() < 1e-12);
    }

    #[tokio::test]
    async fn replaying_twice_records_once() {
        let fake = FakeAdapter::new(Exchange::Bybit, vec![instrument("BTCUSDT", Exchange::Bybit, 0.1, 0.001, 0.001)]);
        let rows: Vec<Execution> = (0..3).map(|i| exec_at(&format!("e{i}"), i)).collect();
        fake.history.lock().extend([rows.clone(), rows]);
        let (conn, _ctx, _streams) = connection(&fake, true);
        conn.start().await.unwrap();
        assert_eq!(conn.replay_history().await.unwrap(), 0);
        assert_eq!(fake.store.executions(Exchange::Bybit).len(), 3);
    }

    #[tokio::test]
    async fn open_orders_gate_is_fatal() {
        let fake = FakeAdapter::new(Exchange::Bitmex, vec![instrument("XBTUSD", Exchange::Bitmex, 0.5, 1.0, 1.0)]);
        fake.fail_with("open_orders", ExchangeError::ignore("odd payload"));
        let (conn, _ctx, _streams) = connection(&fake, true);
        let err = conn.start().await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Fatal);
        assert_eq!(fake.count("user"), 0);
        assert_eq!(conn.health(now_ms(), 30_000), Health::NeedsReload(ErrorKind::Fatal));
    }

    #[tokio::test]
    async fn cancel_stops_concurrent_stage() {
        let fake = FakeAdapter::new(Exchange::Bybit, vec![instrument("BTCUSDT", Exchange::Bybit, 0.1, 0.001, 0.001)]);
        fake.fail_with("balances", ExchangeError::cancel("invalid api key"));
        fake.fail_with("positions", ExchangeError::fatal("timeout"));
        fake.fail_with("user", ExchangeError::retry("busy"));
        let (conn, _ctx, mut streams) = connection(&fake, true);
        let err = conn.start().await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Cancel);
        assert_eq!(conn.status(), ConnectionStatus::Stopped);
        assert_eq!(conn.health(now_ms(), 30_000), Health::Stopped);
        assert_eq!(fake.count("history"), 0);
        let errors = std::iter::from_fn(|| streams.status.try_recv().ok())
            .filter(|m| m.severity == mx_core::Severity::Error)
            .count();
        assert_eq!(errors, 1);
    }

    #[tokio::test]
    async fn ignored_stage_errors_continue() {
        let fake = FakeAdapter::new(Exchange::Mexc, vec![instrument("BTC_USDT", Exchange::Mexc, 0.1, 0.0001, 0.0001)]);
        fake.fail_with("positions", ExchangeError::ignore("empty"));
        let (conn, _ctx, _streams) = connection(&fake, true);
        conn.start().await.unwrap();
        assert_eq!(conn.status(), ConnectionStatus::Online);
        assert_eq!(conn.account_id(), "acct");
        assert!(conn.state().api_active);
    }

    #[tokio::test]
    async fn public_mode_skips_private_stages() {
        let fake = FakeAdapter::new(Exchange::Bitmex, vec![instrument("XBTUSD", Exchange::Bitmex, 0.5, 1.0, 1.0)]);
        let (conn, ctx, _streams) = connection(&fake, false);
        ctx.bots.register(bot("bot", Exchange::Bitmex, "XBTUSD", 10.0));
        conn.start().await.unwrap();
        assert_eq!(fake.count("open_orders") + fake.count("user") + fake.count("history"), 0);
        assert_eq!(conn.state().subscribed, vec!["XBTUSD".to_string()]);
        let err = conn.buy("bot", Some(1.0), Some(100.0)).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Cancel);
    }

    #[tokio::test]
    async fn reload_converges_and_runs_once() {
        let fake = FakeAdapter::new(Exchange::Bitmex, vec![instrument("XBTUSD", Exchange::Bitmex, 0.5, 1.0, 1.0)]);
        fake.open.lock().push(order_row("XBTUSD", Exchange::Bitmex, "A", "7.bot", Side::Buy, 100.0, 5.0));
        let (conn, ctx, mut streams) = connection(&fake, true);
        conn.start().await.unwrap();
        let pos = PositionRow {
            key: SymbolKey::new("XBTUSD", Exchange::Bitmex),
            qty: Some(3.0),
            avg_entry_price: None,
            unrealized_pnl: None,
            margin_call_price: None,
        };
        fake.positions.lock().push(pos);

        let (a, b) = tokio::join!(conn.reload(), conn.reload());
        a.unwrap();
        b.unwrap();
        assert_eq!(fake.count("instruments"), 2);
        conn.reload().await.unwrap();
        assert_eq!(ctx.ledger.len(), 1);
        assert_eq!(conn.instrument("XBTUSD").unwrap().current_qty, 3.0);

        let actions: Vec<OrderAction> =
            std::iter::from_fn(|| streams.orders.try_recv().ok()).map(|e| e.action).collect();
        assert_eq!(
            actions,
            vec![OrderAction::Put, OrderAction::Clear, OrderAction::Put, OrderAction::Clear, OrderAction::Put]
        );
    }

    #[tokio::test]
    async fn block_keeps_feed_but_stops_trading() {
        let fake = FakeAdapter::new(Exchange::Bitmex, vec![instrument("XBTUSD", Exchange::Bitmex, 0.5, 1.0, 1.0)]);
        fake.fail_with("place", ExchangeError::block("insufficient available balance"));
        let (conn, ctx, _streams) = connection(&fake, true);
        ctx.bots.register(bot("bot", Exchange::Bitmex, "XBTUSD", 10.0));
        conn.start().await.unwrap();

        assert_eq!(conn.buy("bot", Some(1.0), Some(100.0)).await.unwrap_err().kind, ErrorKind::Block);
        assert_eq!(conn.status(), ConnectionStatus::Blocked);
        assert!(matches!(conn.health(now_ms(), 30_000), Health::Blocked(_)));
        assert_eq!(conn.buy("bot", Some(1.0), Some(100.0)).await.unwrap_err().kind, ErrorKind::Block);
        assert_eq!(fake.count("place"), 1);
    }

    #[tokio::test]
    async fn block_in_bootstrap_still_replays_history() {
        let fake = FakeAdapter::new(Exchange::Bybit, vec![instrument("BTCUSDT", Exchange::Bybit, 0.1, 0.001, 0.001)]);
        fake.fail_with("balances", ExchangeError::block("account restricted"));
        fake.history.lock().push_back(vec![exec_at("e1", 1)]);
        let (conn, ctx, _streams) = connection(&fake, true);
        ctx.bots.register(bot("b", Exchange::Bybit, "BTCUSDT", 1.0));
        conn.start().await.unwrap();

        assert_eq!(conn.status(), ConnectionStatus::Blocked);
        assert_eq!((fake.count("history"), fake.count("funding")), (1, 1));
        assert_eq!(fake.store.executions(Exchange::Bybit).len(), 1);
        let blocked_at = conn.state().blocked_since_ms.unwrap();
        assert_eq!(conn.health(blocked_at + 5_000, 30_000), Health::Blocked(5_000));
        assert_eq!(conn.buy("b", Some(0.001), Some(50_000.0)).await.unwrap_err().kind, ErrorKind::Block);

        fake.clear_failures();
        conn.reload().await.unwrap();
        assert_eq!(conn.status(), ConnectionStatus::Online);
        assert_eq!(conn.state().blocked_since_ms, None);
    }

    #[tokio::test]
    async fn funding_poll_records_new_rows() {
        let fake =
            FakeAdapter::new(Exchange::Deribit, vec![instrument("BTC-PERPETUAL", Exchange::Deribit, 0.5, 10.0, 10.0)]);
        let (conn, _ctx, _streams) = connection(&fake, true);
        conn.start().await.unwrap();
        let mut row = exec_at("f1", 10);
        row.exec_type = mx_core::ExecType::Funding;
        fake.funding.lock().push(row);
        assert_eq!(conn.poll_funding().await, 1);
    }

    #[test]
    fn flags_merge_toward_cancel() {
        let state = Mutex::new(MarketState::default());
        flag_state(&state, ErrorKind::Ignore);
        assert_eq!(state.lock().error, None);
        flag_state(&state, ErrorKind::Block);
        assert_eq!(state.lock().status, ConnectionStatus::Blocked);
        flag_state(&state, ErrorKind::Fatal);
        flag_state(&state, ErrorKind::Retry);
        assert_eq!(state.lock().error, Some(ErrorKind::Fatal));
        flag_state(&state, ErrorKind::Cancel);
        assert_eq!(state.lock().status, ConnectionStatus::Stopped);
    }
}
