//! Configuration parsing.
//!
//! All settings come from a single JSON file. The top-level structure holds
//! logging metadata, a `markets` array where each entry describes one
//! exchange connection, and the `bots` trading through those connections.
//!
//! # Example config
//!
//! ```json
//! {
//!   "app": { "log_dir": "/tmp/log", "log_level": "info" },
//!   "markets": [{
//!     "exchange": "bybit",
//!     "testnet": true,
//!     "api_key": "...", "api_secret": "...",
//!     "symbols": [{ "ticker": "BTCUSDT", "category": "linear" }],
//!     "orderbook_depth": 5
//!   }],
//!   "bots": [{ "name": "breakout", "market": "bybit", "symbol": "BTCUSDT",
//!              "timeframe": "5m", "limit": 0.01 }]
//! }
//! ```

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::error::MxError;
use crate::types::{Category, DepthMode, Exchange, Timeframe};

/// Top-level application config, deserialized from a JSON file.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Logging metadata.
    #[serde(default)]
    pub app: AppMeta,

    /// One entry per exchange connection.
    pub markets: Vec<MarketConfig>,

    /// Bots trading through the markets.
    #[serde(default)]
    pub bots: Vec<BotConfig>,

    /// Health-check loop settings.
    #[serde(default)]
    pub supervisor: SupervisorConfig,
}

/// Logging metadata block.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppMeta {
    pub log_dir: Option<String>,
    pub log_level: Option<String>,
    #[serde(default)]
    pub log_json: bool,
}

/// A configured symbol.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SymbolConfig {
    pub ticker: String,
    #[serde(default)]
    pub category: Category,
}

/// A single exchange connection.
#[derive(Debug, Clone, Deserialize)]
pub struct MarketConfig {
    pub exchange: Exchange,

    /// REST base URL; defaults per exchange and `testnet`.
    #[serde(default)]
    pub http_url: Option<String>,

    /// Streaming URL; defaults per exchange and `testnet`.
    #[serde(default)]
    pub ws_url: Option<String>,

    #[serde(default)]
    pub api_key: String,

    #[serde(default)]
    pub api_secret: String,

    #[serde(default)]
    pub testnet: bool,

    pub symbols: Vec<SymbolConfig>,

    /// Absent = top-of-book quote, N = N-level book.
    #[serde(default)]
    pub orderbook_depth: Option<usize>,

    /// REST attempts for RETRY-classified failures.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay between REST attempts.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// Settle delay between closing the stream and re-bootstrapping.
    #[serde(default = "default_reload_delay_ms")]
    pub reload_delay_ms: u64,

    /// History replay start when nothing has been checkpointed yet.
    #[serde(default)]
    pub history_start: Option<DateTime<Utc>>,

    /// Page size for history replay.
    #[serde(default = "default_history_chunk")]
    pub history_chunk: usize,
}

impl MarketConfig {
    /// Minimal config used by tests and tooling.
    pub fn new(exchange: Exchange, symbols: Vec<SymbolConfig>) -> Self {
        Self {
            exchange,
            http_url: None,
            ws_url: None,
            api_key: String::new(),
            api_secret: String::new(),
            testnet: false,
            symbols,
            orderbook_depth: None,
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            reload_delay_ms: default_reload_delay_ms(),
            history_start: None,
            history_chunk: default_history_chunk(),
        }
    }

    /// Effective REST base URL.
    pub fn http_url(&self) -> String {
        self.http_url.clone().unwrap_or_else(|| default_http_url(self.exchange, self.testnet).to_string())
    }

    /// Effective streaming URL.
    pub fn ws_url(&self) -> String {
        self.ws_url.clone().unwrap_or_else(|| default_ws_url(self.exchange, self.testnet).to_string())
    }

    pub fn depth(&self) -> DepthMode {
        DepthMode::from_depth(self.orderbook_depth)
    }

    /// Private channels and trading need both halves of the key pair.
    pub fn has_credentials(&self) -> bool {
        !self.api_key.is_empty() && !self.api_secret.is_empty()
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn reload_delay(&self) -> Duration {
        Duration::from_millis(self.reload_delay_ms)
    }

    pub fn tickers(&self, category: Category) -> Vec<String> {
        self.symbols.iter().filter(|s| s.category == category).map(|s| s.ticker.clone()).collect()
    }

    /// Reject malformed URLs and empty symbol lists before any connection is
    /// attempted.
    pub fn validate(&self) -> Result<(), MxError> {
        check_url(&self.http_url(), &["http", "https"])?;
        check_url(&self.ws_url(), &["ws", "wss"])?;
        if self.symbols.is_empty() {
            return Err(MxError::Config(format!("[{}] no symbols configured", self.exchange)));
        }
        if self.history_chunk == 0 {
            return Err(MxError::Config(format!("[{}] history_chunk must be > 0", self.exchange)));
        }
        Ok(())
    }
}

fn check_url(raw: &str, schemes: &[&str]) -> Result<(), MxError> {
    let parsed = url::Url::parse(raw).map_err(|e| MxError::Config(format!("bad url '{raw}': {e}")))?;
    if !schemes.contains(&parsed.scheme()) {
        return Err(MxError::Config(format!("bad url '{raw}': scheme must be one of {schemes:?}")));
    }
    if parsed.host_str().is_none_or(str::is_empty) {
        return Err(MxError::Config(format!("bad url '{raw}': missing host")));
    }
    Ok(())
}

/// A bot (EMI) bound to one symbol on one market.
#[derive(Debug, Clone, Deserialize)]
pub struct BotConfig {
    pub name: String,
    pub market: Exchange,
    pub symbol: String,
    pub timeframe: Timeframe,
    /// Maximum absolute position in unified units.
    pub limit: f64,
}

/// Health-check loop settings.
#[derive(Debug, Clone, Deserialize)]
pub struct SupervisorConfig {
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    /// A market with no inbound stream message for this long is reloaded.
    #[serde(default = "default_stale_after_ms")]
    pub stale_after_ms: u64,
    /// A market with trading blocked this long is reloaded to re-check.
    #[serde(default = "default_block_recheck_ms")]
    pub block_recheck_ms: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            tick_ms: default_tick_ms(),
            stale_after_ms: default_stale_after_ms(),
            block_recheck_ms: default_block_recheck_ms(),
        }
    }
}

/// Load and parse a JSON config file.
pub fn load_config(path: &std::path::Path) -> anyhow::Result<AppConfig> {
    let content = std::fs::read_to_string(path)?;
    let config: AppConfig = serde_json::from_str(&content)?;
    Ok(config)
}

// ---------------------------------------------------------------------------
// Defaults (used by serde)
// ---------------------------------------------------------------------------

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    2000
}

fn default_reload_delay_ms() -> u64 {
    3000
}

fn default_history_chunk() -> usize {
    500
}

fn default_tick_ms() -> u64 {
    1000
}

fn default_stale_after_ms() -> u64 {
    30_000
}

fn default_block_recheck_ms() -> u64 {
    300_000
}

pub fn default_http_url(exchange: Exchange, testnet: bool) -> &'static str {
    match (exchange, testnet) {
        (Exchange::Bitmex, false) => "https://www.bitmex.com",
        (Exchange::Bitmex, true) => "https://testnet.bitmex.com",
        (Exchange::Bybit, false) => "https://api.bybit.com",
        (Exchange::Bybit, true) => "https://api-testnet.bybit.com",
        (Exchange::Deribit, false) => "https://www.deribit.com",
        (Exchange::Deribit, true) => "https://test.deribit.com",
        (Exchange::Mexc, _) => "https://contract.mexc.com",
    }
}

pub fn default_ws_url(exchange: Exchange, testnet: bool) -> &'static str {
    match (exchange, testnet) {
        (Exchange::Bitmex, false) => "wss://ws.bitmex.com/realtime",
        (Exchange::Bitmex, true) => "wss://ws.testnet.bitmex.com/realtime",
        (Exchange::Bybit, false) => "wss://stream.bybit.com/v5",
        (Exchange::Bybit, true) => "wss://stream-testnet.bybit.com/v5",
        (Exchange::Deribit, false) => "wss://www.deribit.com/ws/api/v2",
        (Exchange::Deribit, true) => "wss://test.deribit.com/ws/api/v2",
        (Exchange::Mexc, _) => "wss://contract.mexc.com/edge",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_config() {
        let json = r#"{
            "app": { "log_level": "debug" },
            "markets": [{
                "exchange": "bybit",
                "testnet": true,
                "api_key": "k", "api_secret": "s",
                "symbols": [{ "ticker": "BTCUSDT", "category": "linear" }, { "ticker": "ETHUSD", "category": "inverse" }],
                "orderbook_depth": 5,
                "history_start": "2024-01-01T00:00:00Z"
            }],
            "bots": [{ "name": "b1", "market": "bybit", "symbol": "BTCUSDT", "timeframe": "5m", "limit": 0.01 }]
        }"#;
        let cfg: AppConfig = serde_json::from_str(json).unwrap();
        let m = &cfg.markets[0];
        assert_eq!(m.exchange, Exchange::Bybit);
        assert_eq!(m.http_url(), "https://api-testnet.bybit.com");
        assert_eq!(m.depth(), DepthMode::Book(5));
        assert_eq!(m.max_retries, 3);
        assert_eq!(m.history_chunk, 500);
        assert_eq!(m.tickers(Category::Inverse), vec!["ETHUSD".to_string()]);
        assert!(m.has_credentials());
        assert!(m.validate().is_ok());
        assert_eq!(cfg.bots[0].timeframe, Timeframe::M5);
        assert_eq!(cfg.supervisor.tick_ms, 1000);
        assert_eq!(cfg.supervisor.block_recheck_ms, 300_000);
    }

    #[test]
    fn rejects_bad_urls() {
        let symbols = vec![SymbolConfig { ticker: "XBTUSD".into(), category: Category::Inverse }];
        let mut m = MarketConfig::new(Exchange::Bitmex, symbols);
        m.http_url = Some("not a url".into());
        assert!(m.validate().is_err());
        m.http_url = Some("ftp://www.bitmex.com".into());
        assert!(m.validate().is_err());
        m.http_url = None;
        m.ws_url = Some("https://ws.bitmex.com/realtime".into());
        assert!(m.validate().is_err());
        m.ws_url = None;
        assert!(m.validate().is_ok());
    }

    #[test]
    fn rejects_empty_symbols() {
        let m = MarketConfig::new(Exchange::Mexc, vec![]);
        assert!(m.validate().is_err());
    }
}
