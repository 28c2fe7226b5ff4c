//! Top-level loop over every configured market.
//!
//! Bootstraps all markets concurrently, then on every tick checks each
//! market's health and advances the kline buffers. A market that needs a
//! reload gets it on a task of its own, so one exchange reloading never
//! holds up the others. A market with trading blocked is reloaded once the
//! block is older than `block_recheck_ms`.

use std::sync::Arc;
use std::time::Duration;

use ahash::AHashMap;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures_util::future::join_all;
use mx_core::config::{AppConfig, BotConfig, SupervisorConfig};
use mx_core::error::ExchangeError;
use mx_core::{ConnectionStatus, Exchange, Kline, SymbolKey};
use mx_exchange::create_adapter;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::bot::Strategy;
use crate::connection::{Health, MarketConnection};
use crate::context::AppContext;
use crate::kline::{DEFAULT_CAPACITY, KlineBuffer};

struct KlineSlot {
    buffer: KlineBuffer,
    bots: Vec<BotConfig>,
}

pub struct ConnectionSupervisor {
    ctx: AppContext,
    config: SupervisorConfig,
    markets: Vec<Arc<MarketConnection>>,
    strategies: AHashMap<String, Arc<dyn Strategy>>,
    klines: tokio::sync::Mutex<Vec<KlineSlot>>,
}

impl ConnectionSupervisor {
    pub fn new(ctx: AppContext, config: SupervisorConfig) -> Self {
        Self {
            ctx,
            config,
            markets: Vec::new(),
            strategies: AHashMap::new(),
            klines: tokio::sync::Mutex::new(Vec::new()),
        }
    }

    /// Register the configured bots and build one connection per market.
    /// A market whose config is rejected is reported and left out; the
    /// others are unaffected.
    pub fn from_config(app: &AppConfig, ctx: AppContext) -> Self {
        let mut supervisor = Self::new(ctx, app.supervisor.clone());
        for bot in &app.bots {
            supervisor.ctx.bots.register(bot.clone());
        }
        for market in &app.markets {
            match create_adapter(market, supervisor.ctx.catalog.clone()) {
                Ok(adapter) => {
                    let conn = MarketConnection::new(market.clone(), adapter, supervisor.ctx.clone());
                    supervisor.add_market(conn);
                }
                Err(e) => supervisor.ctx.bus.report(market.exchange, &e),
            }
        }
        supervisor
    }

    pub fn add_market(&mut self, conn: Arc<MarketConnection>) {
        self.markets.push(conn);
    }

    pub fn set_strategy(&mut self, bot: &str, strategy: Arc<dyn Strategy>) {
        self.strategies.insert(bot.to_string(), strategy);
    }

    pub fn markets(&self) -> &[Arc<MarketConnection>] {
        &self.markets
    }

    pub fn market(&self, exchange: Exchange) -> Option<&Arc<MarketConnection>> {
        self.markets.iter().find(|m| m.market() == exchange)
    }

    /// Bootstrap every market concurrently, then seed the kline buffers.
    pub async fn start(&self) {
        let results = join_all(self.markets.iter().map(|m| m.start())).await;
        let online = results.iter().filter(|r| r.is_ok()).count();
        info!("[supervisor] {online}/{} market(s) online", self.markets.len());
        self.seed_klines().await;
    }

    /// Tick until `shutdown` turns true or its sender is dropped.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(Duration::from_millis(self.config.tick_ms.max(10)));
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = interval.tick() => self.tick().await,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    pub async fn shutdown(&self) {
        join_all(self.markets.iter().map(|m| m.stop())).await;
        info!("[supervisor] all markets stopped");
    }

    pub async fn tick(&self) {
        let now = Utc::now();
        self.check_health(now.timestamp_millis());
        self.advance_klines(now).await;
    }

    fn check_health(&self, now_ms: i64) {
        let stale_after = self.config.stale_after_ms as i64;
        let block_recheck = self.config.block_recheck_ms as i64;
        for conn in &self.markets {
            match conn.health(now_ms, stale_after) {
                Health::Healthy | Health::Stopped => {}
                Health::Blocked(for_ms) if for_ms >= block_recheck => {
                    info!("[{}] trading blocked for {}s, reloading to re-check", conn.market(), for_ms / 1000);
                    spawn_reload(conn);
                }
                Health::Blocked(_) => {}
                Health::Stale => {
                    let silent = (now_ms - conn.last_message_ms()) / 1000;
                    conn.flag(&ExchangeError::fatal(format!("no stream message for {silent}s")));
                    spawn_reload(conn);
                }
                Health::NeedsReload(kind) => {
                    debug!("[{}] {kind} flagged, reloading", conn.market());
                    spawn_reload(conn);
                }
            }
        }
    }

    async fn seed_klines(&self) {
        let mut slots: Vec<KlineSlot> = Vec::new();
        for bot in self.ctx.bots.all() {
            let key = SymbolKey::new(bot.symbol.clone(), bot.market);
            match slots.iter_mut().find(|s| s.buffer.key == key && s.buffer.timeframe == bot.timeframe) {
                Some(slot) => slot.bots.push(bot),
                None => {
                    let buffer = KlineBuffer::new(key, bot.timeframe, DEFAULT_CAPACITY);
                    slots.push(KlineSlot { buffer, bots: vec![bot] });
                }
            }
        }
        for slot in &mut slots {
            let key = &slot.buffer.key;
            let Some(conn) = self.market(key.market) else {
                warn!("[supervisor] no market {} for bots on {}", key.market, key.ticker);
                continue;
            };
            let span = slot.buffer.timeframe.millis() * DEFAULT_CAPACITY as i64;
            let start = Utc::now() - ChronoDuration::milliseconds(span);
            if let Ok(bars) = conn.klines(&key.ticker, slot.buffer.timeframe, start).await {
                debug!("[{}] {} {} seeded with {} bar(s)", key.market, key.ticker, slot.buffer.timeframe, bars.len());
                slot.buffer.seed(bars);
            }
        }
        *self.klines.lock().await = slots;
    }

    /// Feed each buffer the current mid price; a closed bar calls every bot
    /// bound to that buffer once.
    async fn advance_klines(&self, now: DateTime<Utc>) {
        let mut due: Vec<(BotConfig, Vec<Kline>)> = Vec::new();
        {
            let mut slots = self.klines.lock().await;
            for slot in slots.iter_mut() {
                let Some(price) = self.ctx.catalog.with(&slot.buffer.key, |i| i.mid_price()).flatten() else {
                    continue;
                };
                if slot.buffer.on_price(now, price).is_some() {
                    let bars = slot.buffer.bars();
                    due.extend(slot.bots.iter().map(|b| (b.clone(), bars.clone())));
                }
            }
        }
        for (bot, bars) in due {
            let (Some(strategy), Some(conn)) = (self.strategies.get(&bot.name), self.market(bot.market)) else {
                continue;
            };
            if conn.status() != ConnectionStatus::Online {
                debug!("[{}] {} skipped bar, market {:?}", bot.market, bot.name, conn.status());
                continue;
            }
            strategy.on_bar(&bot, &bars, conn).await;
        }
    }
}

fn spawn_reload(conn: &Arc<MarketConnection>) {
    let conn = Arc::clone(conn);
    tokio::spawn(async move {
        if let Err(e) = conn.reload().await {
            debug!("[{}] reload failed: {e}", conn.market());
        }
    });
}
