//! Bybit v5 adapter.
//!
//! Every endpoint takes a `category` (`linear`, `inverse`, `spot`,
//! `option`); the adapter derives it from the instrument and issues one
//! request per configured category where an endpoint is category-scoped.
//!
//! # REST endpoints
//!
//! | Operation     | Method | Path                              |
//! |---------------|--------|-----------------------------------|
//! | Instruments   | GET    | `/v5/market/instruments-info`     |
//! | User          | GET    | `/v5/user/query-api`              |
//! | Balances      | GET    | `/v5/account/wallet-balance`      |
//! | Positions     | GET    | `/v5/position/list`               |
//! | Open orders   | GET    | `/v5/order/realtime`              |
//! | Place         | POST   | `/v5/order/create`                |
//! | Amend         | POST   | `/v5/order/amend`                 |
//! | Cancel        | POST   | `/v5/order/cancel`                |
//! | Klines        | GET    | `/v5/market/kline`                |
//! | Trade history | GET    | `/v5/execution/list`              |
//!
//! `execution/list` only answers windows of at most seven days and pages
//! through a cursor; history replay walks both.

pub mod auth;
pub mod json_parser;
pub mod order_book;
pub mod stream;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use mx_core::config::MarketConfig;
use mx_core::error::{ExResult, ExchangeError};
use mx_core::precision::format_decimal;
use mx_core::ws::StreamProtocol;
use mx_core::{
    Category, Exchange, Execution, HistoryPage, InstrumentCatalog, Kline, LimitOrder, MarginRow, Order, OrderAck,
    OrderRow, PositionRow, SymbolKey, Timeframe,
};
use parking_lot::RwLock;
use serde_json::{Value, json};
use tracing::{debug, info};

use crate::ExchangeAdapter;
use crate::history;
use crate::json_util::{array_of, str_field};
use crate::rest::RestClient;

use self::auth::BybitSigner;
use self::json_parser as parser;
use self::stream::{BybitPrivateStream, BybitPublicStream};

/// Longest window `execution/list` accepts.
const HISTORY_WINDOW_DAYS: i64 = 7;
const HISTORY_PAGE: usize = 100;
const KLINE_LIMIT: usize = 1000;

pub struct BybitAdapter {
    config: MarketConfig,
    rest: RestClient,
    catalog: InstrumentCatalog,
    account: RwLock<String>,
}

impl BybitAdapter {
    pub fn new(config: &MarketConfig, catalog: InstrumentCatalog) -> Self {
        let signer = BybitSigner { api_key: config.api_key.clone(), api_secret: config.api_secret.clone() };
        Self {
            rest: RestClient::new(config, Box::new(signer)),
            config: config.clone(),
            catalog,
            account: RwLock::new(String::new()),
        }
    }

    /// Configured categories in first-seen order.
    fn categories(&self) -> Vec<Category> {
        let mut out: Vec<Category> = Vec::new();
        for s in &self.config.symbols {
            if !out.contains(&s.category) {
                out.push(s.category);
            }
        }
        out
    }

    fn category_of(&self, key: &SymbolKey) -> ExResult<&'static str> {
        let category = self
            .catalog
            .with(key, |i| i.category)
            .or_else(|| self.config.symbols.iter().find(|s| s.ticker == key.ticker).map(|s| s.category))
            .ok_or_else(|| ExchangeError::cancel(format!("[bybit] unknown symbol {}", key.ticker)))?;
        parser::category_str(category)
            .ok_or_else(|| ExchangeError::cancel(format!("[bybit] unsupported category {category}")))
    }

    fn format_price(&self, key: &SymbolKey, price: f64) -> String {
        let places = self.catalog.with(key, |i| i.price_precision).unwrap_or(8);
        format_decimal(price, places)
    }

    fn format_qty(&self, key: &SymbolKey, qty: f64) -> String {
        let places = self.catalog.with(key, |i| i.qty_precision).unwrap_or(8);
        format_decimal(qty, places)
    }

    fn ack(&self, result: &Value, cl_ord_id: &str, price: f64) -> ExResult<OrderAck> {
        let order_id = str_field(result, "orderId")
            .ok_or_else(|| ExchangeError::fatal(format!("[bybit] malformed ack: {result}")))?;
        let link_id = str_field(result, "orderLinkId").filter(|s| !s.is_empty());
        Ok(OrderAck {
            order_id,
            cl_ord_id: link_id.unwrap_or_else(|| cl_ord_id.to_string()),
            price,
            leaves_qty: None,
            timestamp: Utc::now(),
        })
    }

    /// All executions of one category in `[start, end)`, following the cursor.
    async fn executions_window(
        &self,
        category: Category,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> ExResult<Vec<Execution>> {
        let Some(name) = parser::category_str(category) else {
            return Ok(Vec::new());
        };
        let mut out = Vec::new();
        let mut cursor = String::new();
        loop {
            let mut query = vec![
                ("category", name.to_string()),
                ("startTime", start.timestamp_millis().to_string()),
                ("endTime", end.timestamp_millis().to_string()),
                ("limit", HISTORY_PAGE.to_string()),
            ];
            if !cursor.is_empty() {
                query.push(("cursor", cursor.clone()));
            }
            let result = self.rest.get("/v5/execution/list", &query, true).await?;
            let page = array_of(&result, "list");
            out.extend(page.iter().filter_map(|e| parser::parse_execution(e, category, &self.catalog)));
            cursor = str_field(&result, "nextPageCursor").unwrap_or_default();
            if page.is_empty() || cursor.is_empty() {
                return Ok(out);
            }
        }
    }
}

#[async_trait]
impl ExchangeAdapter for BybitAdapter {
    fn exchange(&self) -> Exchange {
        Exchange::Bybit
    }

    async fn get_active_instruments(&self) -> ExResult<()> {
        for sym in &self.config.symbols {
            let category = parser::category_str(sym.category)
                .ok_or_else(|| ExchangeError::cancel(format!("[bybit] unsupported category {}", sym.category)))?;
            let query = [("category", category.to_string()), ("symbol", sym.ticker.clone())];
            let result = self.rest.get("/v5/market/instruments-info", &query, false).await?;
            let inst = array_of(&result, "list")
                .iter()
                .filter_map(|v| parser::parse_instrument(v, sym.category))
                .find(|i| i.key.ticker == sym.ticker)
                .ok_or_else(|| ExchangeError::cancel(format!("[bybit] unknown symbol {}", sym.ticker)))?;
            debug!("[bybit] {} tick={} step={} cat={}", sym.ticker, inst.tick_size, inst.qty_step, inst.category);
            self.catalog.insert(inst);
        }
        info!("[bybit] loaded {} instruments", self.config.symbols.len());
        Ok(())
    }

    async fn get_user(&self) -> ExResult<String> {
        let result = self.rest.get("/v5/user/query-api", &[], true).await?;
        let id = str_field(&result, "userID").ok_or_else(|| ExchangeError::fatal("[bybit] query-api without userID"))?;
        *self.account.write() = id.clone();
        Ok(id)
    }

    fn account_id(&self) -> String {
        self.account.read().clone()
    }

    async fn get_wallet_balance(&self) -> ExResult<Vec<MarginRow>> {
        let result = self.rest.get("/v5/account/wallet-balance", &[("accountType", "UNIFIED".into())], true).await?;
        Ok(array_of(&result, "list").iter().flat_map(parser::parse_wallet).collect())
    }

    async fn get_position_info(&self) -> ExResult<Vec<PositionRow>> {
        let mut out = Vec::new();
        for sym in self.config.symbols.iter().filter(|s| s.category != Category::Spot) {
            let key = SymbolKey::new(sym.ticker.clone(), Exchange::Bybit);
            let query = [("category", self.category_of(&key)?.to_string()), ("symbol", sym.ticker.clone())];
            let result = self.rest.get("/v5/position/list", &query, true).await?;
            out.extend(array_of(&result, "list").iter().filter_map(parser::parse_position));
        }
        Ok(out)
    }

    async fn open_orders(&self) -> ExResult<Vec<OrderRow>> {
        let mut out = Vec::new();
        for sym in &self.config.symbols {
            let key = SymbolKey::new(sym.ticker.clone(), Exchange::Bybit);
            let query = [("category", self.category_of(&key)?.to_string()), ("symbol", sym.ticker.clone())];
            let result = self.rest.get("/v5/order/realtime", &query, true).await?;
            out.extend(array_of(&result, "list").iter().filter_map(parser::parse_order));
        }
        Ok(out)
    }

    async fn place_limit(&self, order: &LimitOrder) -> ExResult<OrderAck> {
        let body = json!({
            "category": self.category_of(&order.key)?,
            "symbol": order.key.ticker,
            "side": order.side().as_str(),
            "orderType": "Limit",
            "qty": self.format_qty(&order.key, order.qty.abs()),
            "price": self.format_price(&order.key, order.price),
            "orderLinkId": order.cl_ord_id,
            "timeInForce": "GTC",
        });
        let result = self.rest.post("/v5/order/create", &body).await?;
        self.ack(&result, &order.cl_ord_id, order.price)
    }

    async fn replace_limit(&self, order: &Order, price: f64) -> ExResult<OrderAck> {
        let body = json!({
            "category": self.category_of(&order.key)?,
            "symbol": order.key.ticker,
            "orderId": order.order_id,
            "price": self.format_price(&order.key, price),
        });
        let result = self.rest.post("/v5/order/amend", &body).await?;
        self.ack(&result, &order.cl_ord_id, price)
    }

    async fn remove_order(&self, order: &Order) -> ExResult<()> {
        let mut body = json!({ "category": self.category_of(&order.key)?, "symbol": order.key.ticker });
        if order.order_id.is_empty() {
            body["orderLinkId"] = json!(order.cl_ord_id);
        } else {
            body["orderId"] = json!(order.order_id);
        }
        self.rest.post("/v5/order/cancel", &body).await?;
        Ok(())
    }

    async fn trade_bucketed(
        &self,
        key: &SymbolKey,
        start: DateTime<Utc>,
        timeframe: Timeframe,
    ) -> ExResult<Vec<Kline>> {
        let query = [
            ("category", self.category_of(key)?.to_string()),
            ("symbol", key.ticker.clone()),
            ("interval", timeframe.bybit_interval().to_string()),
            ("start", start.timestamp_millis().to_string()),
            ("limit", KLINE_LIMIT.to_string()),
        ];
        let result = self.rest.get("/v5/market/kline", &query, false).await?;
        // Newest first, and the last entry is the bar still forming.
        let now = Utc::now();
        let mut bars: Vec<Kline> = array_of(&result, "list")
            .iter()
            .filter_map(parser::parse_kline)
            .filter(|k| k.timestamp + ChronoDuration::milliseconds(timeframe.millis()) <= now)
            .collect();
        bars.reverse();
        Ok(bars)
    }

    async fn trading_history(&self, count: usize, start: DateTime<Utc>) -> ExResult<HistoryPage> {
        let now = Utc::now();
        let mut records = Vec::new();
        let mut window_start = start;
        while window_start < now && records.len() < count {
            let window_end = (window_start + ChronoDuration::days(HISTORY_WINDOW_DAYS)).min(now);
            for category in self.categories() {
                records.extend(self.executions_window(category, window_start, window_end).await?);
            }
            window_start = window_end;
        }
        let account = self.account_id();
        for e in &mut records {
            e.account = account.clone();
        }
        history::sort_by_time(&mut records);
        let more = records.len() >= count;
        records.truncate(count);
        Ok(HistoryPage { records, more })
    }

    fn stream_protocols(&self) -> Vec<Arc<dyn StreamProtocol>> {
        let mut out: Vec<Arc<dyn StreamProtocol>> = self
            .categories()
            .into_iter()
            .filter(|c| parser::category_str(*c).is_some())
            .map(|c| Arc::new(BybitPublicStream::new(&self.config, c)) as Arc<dyn StreamProtocol>)
            .collect();
        if self.config.has_credentials() {
            out.push(Arc::new(BybitPrivateStream::new(&self.config, self.catalog.clone())));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rest::test_support::serve;
    use mx_core::ErrorKind;
    use mx_core::config::SymbolConfig;

    fn adapter(url: String) -> BybitAdapter {
        let mut cfg = MarketConfig::new(
            Exchange::Bybit,
            vec![SymbolConfig { ticker: "BTCUSDT".into(), category: Category::Linear }],
        );
        cfg.http_url = Some(url);
        cfg.api_key = "key".into();
        cfg.api_secret = "secret".into();
        BybitAdapter::new(&cfg, InstrumentCatalog::new())
    }

    fn ok(result: &str) -> (u16, String) {
        (200, format!(r#"{{"retCode":0,"retMsg":"OK","result":{result}}}"#))
    }

    #[tokio::test]
    async fn empty_listing_cancels() {
        let (url, _) = serve(vec![ok(r#"{"category":"linear","list":[]}"#)]).await;
        let err = adapter(url).get_active_instruments().await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Cancel);
    }

    #[tokio::test]
    async fn klines_ascending_without_forming_bar() {
        let now = Utc::now().timestamp_millis();
        let open = Timeframe::M1.floor_ms(now);
        let list = format!(
            r#"{{"list":[["{}","3","3","3","3","0","0"],["{}","2","2","2","2","0","0"],["{}","1","1","1","1","0","0"]]}}"#,
            open + 60_000,
            open - 60_000,
            open - 120_000
        );
        let (url, seen) = serve(vec![ok(&list)]).await;
        let key = SymbolKey::new("BTCUSDT", Exchange::Bybit);
        let start = Utc::now() - ChronoDuration::minutes(3);
        let bars = adapter(url).trade_bucketed(&key, start, Timeframe::M1).await.unwrap();
        assert_eq!(bars.iter().map(|k| k.close).collect::<Vec<_>>(), vec![1.0, 2.0]);
        assert!(seen.lock()[0].line.contains("category=linear"));
    }

    #[tokio::test]
    async fn history_follows_cursor() {
        let e = |id: &str, ms: i64| {
            format!(
                r#"{{"symbol":"BTCUSDT","execId":"{id}","orderId":"o","side":"Buy","execQty":"1","execPrice":"1","execFee":"0","execType":"Trade","execTime":"{ms}"}}"#
            )
        };
        let start = Utc::now() - ChronoDuration::days(1);
        let t0 = start.timestamp_millis();
        let page1 = ok(&format!(r#"{{"list":[{},{}],"nextPageCursor":"abc"}}"#, e("b", t0 + 2000), e("a", t0 + 1000)));
        let page2 = ok(&format!(r#"{{"list":[{}],"nextPageCursor":""}}"#, e("c", t0 + 500)));
        let (url, seen) = serve(vec![page1, page2]).await;
        let page = adapter(url).trading_history(500, start).await.unwrap();
        assert_eq!(page.records.iter().map(|e| e.exec_id.as_str()).collect::<Vec<_>>(), vec!["c", "a", "b"]);
        assert!(!page.more);
        assert!(seen.lock()[1].line.contains("cursor=abc"));
    }
}
