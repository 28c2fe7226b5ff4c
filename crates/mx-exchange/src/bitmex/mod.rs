//! Bitmex adapter.
//!
//! # REST endpoints
//!
//! | Operation        | Method | Path                              |
//! |------------------|--------|-----------------------------------|
//! | Instruments      | GET    | `/api/v1/instrument/active`       |
//! | User             | GET    | `/api/v1/user`                    |
//! | Balances         | GET    | `/api/v1/user/margin?currency=all`|
//! | Positions        | GET    | `/api/v1/position`                |
//! | Open orders      | GET    | `/api/v1/order` (`open` filter)   |
//! | Place / amend    | POST / PUT | `/api/v1/order`               |
//! | Cancel           | DELETE | `/api/v1/order`                   |
//! | Klines           | GET    | `/api/v1/trade/bucketed`          |
//! | Trade history    | GET    | `/api/v1/execution/tradeHistory`  |
//!
//! Funding and settlement arrive through the trade history and the
//! `execution` table, so no scheduled funding poll is needed.

pub mod auth;
pub mod json_parser;
pub mod stream;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, SecondsFormat, Utc};
use mx_core::config::MarketConfig;
use mx_core::error::{ExResult, ExchangeError};
use mx_core::ws::StreamProtocol;
use mx_core::{
    Exchange, HistoryPage, InstrumentCatalog, Kline, LimitOrder, MarginRow, Order, OrderAck, OrderRow, PositionRow,
    SymbolKey, Timeframe,
};
use parking_lot::RwLock;
use serde_json::{Value, json};
use tracing::{debug, info};

use crate::ExchangeAdapter;
use crate::classify;
use crate::json_util::str_field;
use crate::rest::RestClient;

use self::auth::BitmexSigner;
use self::json_parser as parser;
use self::stream::BitmexStream;

/// Maximum rows Bitmex returns per page.
const MAX_PAGE: usize = 1000;

pub struct BitmexAdapter {
    config: MarketConfig,
    rest: RestClient,
    catalog: InstrumentCatalog,
    account: RwLock<String>,
}

impl BitmexAdapter {
    pub fn new(config: &MarketConfig, catalog: InstrumentCatalog) -> Self {
        let signer = BitmexSigner { api_key: config.api_key.clone(), api_secret: config.api_secret.clone() };
        Self {
            rest: RestClient::new(config, Box::new(signer)),
            config: config.clone(),
            catalog,
            account: RwLock::new(String::new()),
        }
    }

    fn rows<T>(value: &Value, parse: impl Fn(&Value) -> Option<T>) -> Vec<T> {
        value.as_array().map(|arr| arr.iter().filter_map(parse).collect()).unwrap_or_default()
    }

    fn ack(&self, value: &Value, what: &str) -> ExResult<OrderAck> {
        parser::parse_ack(value, &self.catalog)
            .ok_or_else(|| ExchangeError::fatal(format!("[bitmex] malformed {what} response: {value}")))
    }
}

fn iso(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[async_trait]
impl ExchangeAdapter for BitmexAdapter {
    fn exchange(&self) -> Exchange {
        Exchange::Bitmex
    }

    async fn get_active_instruments(&self) -> ExResult<()> {
        let listing = self.rest.get("/api/v1/instrument/active", &[], false).await?;
        let instruments = Self::rows(&listing, parser::parse_instrument);
        for sym in &self.config.symbols {
            let Some(inst) = instruments.iter().find(|i| i.key.ticker == sym.ticker) else {
                return Err(ExchangeError::cancel(format!("[bitmex] unknown symbol {}", sym.ticker)));
            };
            debug!("[bitmex] {} tick={} step={} cat={}", sym.ticker, inst.tick_size, inst.qty_step, inst.category);
            self.catalog.insert(inst.clone());
        }
        info!("[bitmex] loaded {} instruments", self.config.symbols.len());
        Ok(())
    }

    async fn get_user(&self) -> ExResult<String> {
        let user = self.rest.get("/api/v1/user", &[], true).await?;
        let id = str_field(&user, "id").ok_or_else(|| ExchangeError::fatal("[bitmex] user response without id"))?;
        *self.account.write() = id.clone();
        Ok(id)
    }

    fn account_id(&self) -> String {
        self.account.read().clone()
    }

    async fn get_wallet_balance(&self) -> ExResult<Vec<MarginRow>> {
        let margins = self.rest.get("/api/v1/user/margin", &[("currency", "all".into())], true).await?;
        Ok(Self::rows(&margins, parser::parse_margin))
    }

    async fn get_position_info(&self) -> ExResult<Vec<PositionRow>> {
        let positions = self.rest.get("/api/v1/position", &[], true).await?;
        Ok(Self::rows(&positions, |v| parser::parse_position(v, &self.catalog)))
    }

    async fn open_orders(&self) -> ExResult<Vec<OrderRow>> {
        let query = [("filter", json!({ "open": true }).to_string()), ("count", "500".into())];
        let orders = self.rest.get("/api/v1/order", &query, true).await?;
        Ok(Self::rows(&orders, |v| parser::parse_order(v, &self.catalog)))
    }

    async fn place_limit(&self, order: &LimitOrder) -> ExResult<OrderAck> {
        let body = json!({
            "symbol": order.key.ticker,
            "side": order.side().as_str(),
            "orderQty": self.catalog.native_qty(&order.key, order.qty.abs()),
            "price": order.price,
            "clOrdID": order.cl_ord_id,
            "ordType": "Limit",
        });
        let resp = self.rest.post("/api/v1/order", &body).await?;
        self.ack(&resp, "place")
    }

    async fn replace_limit(&self, order: &Order, price: f64) -> ExResult<OrderAck> {
        let mut body = json!({ "price": price });
        if order.order_id.is_empty() {
            body["origClOrdID"] = json!(order.cl_ord_id);
        } else {
            body["orderID"] = json!(order.order_id);
        }
        let resp = self.rest.put("/api/v1/order", &body).await?;
        self.ack(&resp, "amend")
    }

    async fn remove_order(&self, order: &Order) -> ExResult<()> {
        let body = if order.order_id.is_empty() {
            json!({ "clOrdID": order.cl_ord_id })
        } else {
            json!({ "orderID": order.order_id })
        };
        let resp = self.rest.delete("/api/v1/order", &body).await?;
        // Per-order failures come back inside a 200 response.
        let failed = resp.as_array().and_then(|arr| arr.iter().find_map(|o| o.get("error").and_then(Value::as_str)));
        match failed {
            Some(msg) => Err(ExchangeError::new(classify::classify_message(msg), format!("[bitmex] cancel: {msg}"))),
            None => Ok(()),
        }
    }

    async fn trade_bucketed(
        &self,
        key: &SymbolKey,
        start: DateTime<Utc>,
        timeframe: Timeframe,
    ) -> ExResult<Vec<Kline>> {
        // Buckets are stamped with their close time.
        let query = [
            ("binSize", timeframe.bitmex_bin().to_string()),
            ("symbol", key.ticker.clone()),
            ("startTime", iso(start + ChronoDuration::milliseconds(timeframe.millis()))),
            ("count", MAX_PAGE.to_string()),
            ("partial", "false".into()),
        ];
        let buckets = self.rest.get("/api/v1/trade/bucketed", &query, false).await?;
        Ok(Self::rows(&buckets, |v| parser::parse_bucket(v, timeframe)))
    }

    async fn trading_history(&self, count: usize, start: DateTime<Utc>) -> ExResult<HistoryPage> {
        let limit = count.min(MAX_PAGE);
        let query = [("count", limit.to_string()), ("startTime", iso(start)), ("reverse", "false".into())];
        let execs = self.rest.get("/api/v1/execution/tradeHistory", &query, true).await?;
        // Rows the parser skips still count toward the page.
        let more = execs.as_array().is_some_and(|rows| rows.len() >= limit);
        let mut records = Self::rows(&execs, |v| parser::parse_execution(v, &self.catalog));
        crate::history::sort_by_time(&mut records);
        Ok(HistoryPage { records, more })
    }

    fn stream_protocols(&self) -> Vec<Arc<dyn StreamProtocol>> {
        vec![Arc::new(BitmexStream::new(&self.config, self.catalog.clone()))]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rest::test_support::serve;
    use mx_core::config::SymbolConfig;
    use mx_core::{Category, ErrorKind, Side};

    const LISTING: &str = r#"[
        {"symbol":"XBTUSD","typ":"FFWCSX","tickSize":0.5,"lotSize":100,"isInverse":true,"settlCurrency":"XBt","underlying":"XBT","quoteCurrency":"USD","state":"Open"},
        {"symbol":"XBTUSDT","typ":"FFWCSX","tickSize":0.5,"lotSize":1000,"underlyingToPositionMultiplier":1000000,"settlCurrency":"USDt","underlying":"XBT","quoteCurrency":"USDT","state":"Open"}
    ]"#;

    fn adapter(url: String, tickers: &[&str]) -> BitmexAdapter {
        let symbols =
            tickers.iter().map(|t| SymbolConfig { ticker: t.to_string(), category: Category::Linear }).collect();
        let mut cfg = MarketConfig::new(Exchange::Bitmex, symbols);
        cfg.http_url = Some(url);
        cfg.api_key = "key".into();
        cfg.api_secret = "secret".into();
        BitmexAdapter::new(&cfg, InstrumentCatalog::new())
    }

    #[tokio::test]
    async fn unknown_symbol_cancels() {
        let (url, _) = serve(vec![(200, LISTING.into())]).await;
        let err = adapter(url, &["XBTUSD", "DOGEUSD"]).get_active_instruments().await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Cancel);
    }

    #[tokio::test]
    async fn place_sends_native_contracts() {
        let ack = r#"{"orderID":"o1","clOrdID":"1.bot","symbol":"XBTUSDT","side":"Buy","price":60000,"orderQty":250000,"leavesQty":250000,"ordStatus":"New","timestamp":"2024-01-01T00:00:00.000Z"}"#;
        let (url, seen) = serve(vec![(200, LISTING.into()), (200, ack.into())]).await;
        let a = adapter(url, &["XBTUSDT"]);
        a.get_active_instruments().await.unwrap();

        let key = SymbolKey::new("XBTUSDT", Exchange::Bitmex);
        let order = LimitOrder { key, qty: 0.25, price: 60000.0, cl_ord_id: "1.bot".into(), order_id: None };
        let ack = a.place_limit(&order).await.unwrap();
        assert_eq!(ack.order_id, "o1");
        assert_eq!(ack.leaves_qty, Some(0.25));

        let sent: Value = serde_json::from_str(&seen.lock()[1].body).unwrap();
        assert_eq!(sent["orderQty"], 250000.0);
        assert_eq!(sent["side"], Side::Buy.as_str());
    }

    #[tokio::test]
    async fn cancel_of_filled_order_is_ignore() {
        let resp = r#"[{"orderID":"o1","ordStatus":"Filled","error":"Unable to cancel order due to existing state: Filled"}]"#;
        let (url, _) = serve(vec![(200, resp.into())]).await;
        let order = Order {
            cl_ord_id: "1.bot".into(),
            key: SymbolKey::new("XBTUSD", Exchange::Bitmex),
            side: Side::Buy,
            price: 100.0,
            leaves_qty: 100.0,
            orig_qty: 100.0,
            order_id: "o1".into(),
            timestamp: Utc::now(),
            emi: "bot".into(),
        };
        let err = adapter(url, &["XBTUSD"]).remove_order(&order).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Ignore);
    }

    #[tokio::test]
    async fn full_history_page_counts_skipped_rows() {
        let rows = r#"[
            {"execID":"e1","orderID":"o1","clOrdID":"1.bot","symbol":"XBTUSD","side":"Buy","lastQty":100,"lastPx":60000,
             "execType":"Trade","execComm":10,"settlCurrency":"XBt","transactTime":"2024-01-01T00:00:00.000Z"},
            {"execID":"e2","symbol":"XBTUSD","execType":"Rebalance","transactTime":"2024-01-01T00:00:01.000Z"}
        ]"#;
        let (url, seen) = serve(vec![(200, LISTING.into()), (200, rows.into())]).await;
        let a = adapter(url, &["XBTUSD"]);
        a.get_active_instruments().await.unwrap();

        let page = a.trading_history(2, DateTime::from_timestamp_millis(0).unwrap()).await.unwrap();
        assert_eq!(page.records.len(), 1);
        assert!(page.more);
        assert!(seen.lock()[1].line.contains("count=2"));
    }
}
