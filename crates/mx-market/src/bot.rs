//! Bots (EMIs): configured limits, running positions, and the strategy
//! entry point.

use std::sync::Arc;

use ahash::AHashMap;
use async_trait::async_trait;
use mx_core::config::BotConfig;
use mx_core::{Exchange, ExecType, Execution, Kline, SymbolKey, emi_of};
use parking_lot::RwLock;
use tracing::debug;

use crate::connection::MarketConnection;

/// Strategy code attached to a bot. Called once per closed bar.
#[async_trait]
pub trait Strategy: Send + Sync {
    /// `bars` is the bot's buffer, oldest first, ending with the bar that
    /// just opened.
    async fn on_bar(&self, bot: &BotConfig, bars: &[Kline], market: &MarketConnection);
}

#[derive(Debug, Clone)]
pub struct BotState {
    pub config: BotConfig,
    /// Signed position in unified units built from this bot's fills.
    pub position: f64,
}

/// Registered bots keyed by name.
#[derive(Clone, Default)]
pub struct BotBook {
    inner: Arc<RwLock<AHashMap<String, BotState>>>,
}

impl BotBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, config: BotConfig) {
        self.inner.write().insert(config.name.clone(), BotState { config, position: 0.0 });
    }

    pub fn get(&self, name: &str) -> Option<BotState> {
        self.inner.read().get(name).cloned()
    }

    pub fn position(&self, name: &str) -> f64 {
        self.inner.read().get(name).map_or(0.0, |b| b.position)
    }

    pub fn set_position(&self, name: &str, position: f64) {
        if let Some(bot) = self.inner.write().get_mut(name) {
            bot.position = position;
        }
    }

    /// Bots bound to one market, by name.
    pub fn market(&self, market: Exchange) -> Vec<BotConfig> {
        let mut out: Vec<BotConfig> =
            self.inner.read().values().filter(|b| b.config.market == market).map(|b| b.config.clone()).collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    pub fn all(&self) -> Vec<BotConfig> {
        let mut out: Vec<BotConfig> = self.inner.read().values().map(|b| b.config.clone()).collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    /// Credit a fill to the bot named in `cl_ord_id`. Returns the new
    /// position, or `None` when no registered bot owns the fill.
    pub fn apply_execution(&self, market: Exchange, cl_ord_id: &str, exec: &Execution) -> Option<f64> {
        if exec.exec_type != ExecType::Trade {
            return None;
        }
        let emi = emi_of(cl_ord_id)?;
        let mut bots = self.inner.write();
        let bot = bots.get_mut(emi).filter(|b| b.config.market == market && b.config.symbol == exec.key.ticker)?;
        bot.position += exec.signed_qty();
        debug!("[{market}] {emi} position {} on {}", bot.position, exec.key);
        Some(bot.position)
    }
}

impl BotState {
    pub fn key(&self) -> SymbolKey {
        SymbolKey::new(self.config.symbol.clone(), self.config.market)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use mx_core::{Side, Timeframe};

    fn bot(name: &str) -> BotConfig {
        BotConfig {
            name: name.into(),
            market: Exchange::Bitmex,
            symbol: "XBTUSD".into(),
            timeframe: Timeframe::M5,
            limit: 100.0,
        }
    }

    fn fill(side: Side, qty: f64, exec_type: ExecType) -> Execution {
        Execution {
            exec_id: "e".into(),
            order_id: "o".into(),
            cl_ord_id: None,
            key: SymbolKey::new("XBTUSD", Exchange::Bitmex),
            side,
            qty,
            price: 1.0,
            fee: 0.0,
            fee_currency: "XBt".into(),
            timestamp: Utc::now(),
            exec_type,
            leaves_qty: None,
            account: "1".into(),
        }
    }

    #[test]
    fn fills_move_owning_bot_only() {
        let book = BotBook::new();
        book.register(bot("a"));
        book.register(bot("b"));
        assert_eq!(book.apply_execution(Exchange::Bitmex, "1.a", &fill(Side::Buy, 30.0, ExecType::Trade)), Some(30.0));
        assert_eq!(book.apply_execution(Exchange::Bitmex, "2.a", &fill(Side::Sell, 10.0, ExecType::Trade)), Some(20.0));
        assert_eq!(book.position("b"), 0.0);
    }

    #[test]
    fn foreign_and_funding_rows_ignored() {
        let book = BotBook::new();
        book.register(bot("a"));
        assert_eq!(book.apply_execution(Exchange::Bitmex, "1.zz", &fill(Side::Buy, 1.0, ExecType::Trade)), None);
        assert_eq!(book.apply_execution(Exchange::Bybit, "1.a", &fill(Side::Buy, 1.0, ExecType::Trade)), None);
        assert_eq!(book.apply_execution(Exchange::Bitmex, "1.a", &fill(Side::Buy, 1.0, ExecType::Funding)), None);
        assert_eq!(book.position("a"), 0.0);
    }
}
