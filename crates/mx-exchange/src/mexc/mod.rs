//! Mexc USDT-margined contract adapter.
//!
//! | Operation      | Method | Path                                              |
//! |----------------|--------|---------------------------------------------------|
//! | Instruments    | GET    | `/api/v1/contract/detail`                         |
//! | Balances       | GET    | `/api/v1/private/account/assets`                  |
//! | Positions      | GET    | `/api/v1/private/position/open_positions`         |
//! | Open orders    | GET    | `/api/v1/private/order/list/open_orders/{symbol}` |
//! | Place          | POST   | `/api/v1/private/order/submit`                    |
//! | Cancel         | POST   | `/api/v1/private/order/cancel`                    |
//! | Cancel by id   | POST   | `/api/v1/private/order/cancel_with_external`      |
//! | Klines         | GET    | `/api/v1/contract/kline/{symbol}`                 |
//! | Trade history  | GET    | `/api/v1/private/order/list/order_deals`          |
//! | Funding        | GET    | `/api/v1/private/position/funding_records`        |
//!
//! Mexc has no amend endpoint: a replace cancels the order and submits a new
//! one under the same external id. There is no user endpoint either; the
//! API key identifies the account. Orders are placed in one-way mode with
//! cross margin.

pub mod auth;
pub mod json_parser;
pub mod stream;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use mx_core::config::MarketConfig;
use mx_core::error::{ExResult, ExchangeError};
use mx_core::ws::StreamProtocol;
use mx_core::{
    Exchange, Execution, HistoryPage, InstrumentCatalog, Kline, LimitOrder, MarginRow, Order, OrderAck, OrderRow,
    PositionRow, SymbolKey, Timeframe,
};
use parking_lot::RwLock;
use serde_json::{Value, json};
use tracing::{debug, info};

use crate::ExchangeAdapter;
use crate::classify;
use crate::history;
use crate::json_util::{array_of, i64_field};
use crate::rest::RestClient;

use self::auth::MexcSigner;
use self::json_parser as parser;
use self::stream::MexcStream;

const PAGE_SIZE: usize = 100;
/// Limit order type.
const ORDER_TYPE_LIMIT: u8 = 1;
/// Cross margin.
const OPEN_TYPE_CROSS: u8 = 2;
/// Deal queries span at most this many days.
const HISTORY_WINDOW_DAYS: i64 = 90;
const MAX_PAGES: usize = 50;

pub struct MexcAdapter {
    config: MarketConfig,
    rest: RestClient,
    catalog: InstrumentCatalog,
    account: RwLock<String>,
}

impl MexcAdapter {
    pub fn new(config: &MarketConfig, catalog: InstrumentCatalog) -> Self {
        let signer = MexcSigner { api_key: config.api_key.clone(), api_secret: config.api_secret.clone() };
        Self {
            rest: RestClient::new(config, Box::new(signer)),
            config: config.clone(),
            catalog,
            account: RwLock::new(String::new()),
        }
    }

    fn keys(&self) -> Vec<SymbolKey> {
        self.config.symbols.iter().map(|s| SymbolKey::new(&s.ticker, Exchange::Mexc)).collect()
    }

    async fn submit(&self, key: &SymbolKey, native_vol: f64, price: f64, side: u8, cl_ord_id: &str) -> ExResult<Value> {
        let body = json!({
            "symbol": key.ticker,
            "price": price,
            "vol": native_vol,
            "side": side,
            "type": ORDER_TYPE_LIMIT,
            "openType": OPEN_TYPE_CROSS,
            "externalOid": cl_ord_id,
        });
        self.rest.post("/api/v1/private/order/submit", &body).await
    }

    /// One symbol's deals in `[start, end)`, following pages.
    async fn deals(
        &self,
        key: &SymbolKey,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        count: usize,
    ) -> ExResult<Vec<Execution>> {
        let mut out = Vec::new();
        for page in 1..=MAX_PAGES {
            let query = [
                ("symbol", key.ticker.clone()),
                ("start_time", start.timestamp_millis().to_string()),
                ("end_time", end.timestamp_millis().to_string()),
                ("page_num", page.to_string()),
                ("page_size", PAGE_SIZE.to_string()),
            ];
            let data = self.rest.get("/api/v1/private/order/list/order_deals", &query, true).await?;
            let rows = match data.as_array() {
                Some(list) => list.as_slice(),
                None => array_of(&data, "resultList"),
            };
            out.extend(rows.iter().filter_map(|d| parser::parse_deal(d, &self.catalog)));
            if rows.len() < PAGE_SIZE || out.len() >= count {
                break;
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl ExchangeAdapter for MexcAdapter {
    fn exchange(&self) -> Exchange {
        Exchange::Mexc
    }

    async fn get_active_instruments(&self) -> ExResult<()> {
        let listing = self.rest.get("/api/v1/contract/detail", &[], false).await?;
        let instruments: Vec<_> =
            listing.as_array().map(|arr| arr.iter().filter_map(parser::parse_instrument).collect()).unwrap_or_default();
        for sym in &self.config.symbols {
            let Some(inst) = instruments.iter().find(|i| i.key.ticker == sym.ticker) else {
                return Err(ExchangeError::cancel(format!("[mexc] unknown symbol {}", sym.ticker)));
            };
            debug!("[mexc] {} tick={} step={} contract={}", sym.ticker, inst.tick_size, inst.qty_step, inst.multiplier);
            self.catalog.insert(inst.clone());
        }
        info!("[mexc] loaded {} instruments", self.config.symbols.len());
        Ok(())
    }

    async fn get_user(&self) -> ExResult<String> {
        if !self.config.has_credentials() {
            return Err(ExchangeError::cancel("[mexc] no api key configured"));
        }
        let id = self.config.api_key.clone();
        *self.account.write() = id.clone();
        Ok(id)
    }

    fn account_id(&self) -> String {
        self.account.read().clone()
    }

    async fn get_wallet_balance(&self) -> ExResult<Vec<MarginRow>> {
        let assets = self.rest.get("/api/v1/private/account/assets", &[], true).await?;
        Ok(assets.as_array().map(|arr| arr.iter().filter_map(parser::parse_asset).collect()).unwrap_or_default())
    }

    async fn get_position_info(&self) -> ExResult<Vec<PositionRow>> {
        let positions = self.rest.get("/api/v1/private/position/open_positions", &[], true).await?;
        Ok(positions
            .as_array()
            .map(|arr| arr.iter().filter_map(|p| parser::parse_position(p, &self.catalog)).collect())
            .unwrap_or_default())
    }

    async fn open_orders(&self) -> ExResult<Vec<OrderRow>> {
        let mut out = Vec::new();
        for key in self.keys() {
            let query = [("page_num", "1".to_string()), ("page_size", PAGE_SIZE.to_string())];
            let path = format!("/api/v1/private/order/list/open_orders/{}", key.ticker);
            let data = self.rest.get(&path, &query, true).await?;
            let rows = match data.as_array() {
                Some(list) => list.as_slice(),
                None => array_of(&data, "resultList"),
            };
            out.extend(rows.iter().filter_map(|o| parser::parse_order(o, &self.catalog)));
        }
        Ok(out)
    }

    async fn place_limit(&self, order: &LimitOrder) -> ExResult<OrderAck> {
        let native = self.catalog.native_qty(&order.key, order.qty.abs());
        let side = parser::side_code(order.side());
        let data = self.submit(&order.key, native, order.price, side, &order.cl_ord_id).await?;
        parser::submit_ack(&data, &order.cl_ord_id, order.price, order.qty.abs())
            .ok_or_else(|| ExchangeError::fatal(format!("[mexc] malformed submit response: {data}")))
    }

    /// Cancel, then resubmit under the same external id. A failed resubmit
    /// leaves the order cancelled, which the error reports.
    async fn replace_limit(&self, order: &Order, price: f64) -> ExResult<OrderAck> {
        self.remove_order(order).await?;
        let native = self.catalog.native_qty(&order.key, order.leaves_qty);
        let gone =
            |reason: &str| format!("[mexc] {} cancelled for replace, resubmit failed: {reason}", order.cl_ord_id);
        let data = self
            .submit(&order.key, native, price, parser::side_code(order.side), &order.cl_ord_id)
            .await
            .map_err(|e| ExchangeError::new(e.kind, gone(&e.message)).with_order_gone())?;
        parser::submit_ack(&data, &order.cl_ord_id, price, order.leaves_qty)
            .ok_or_else(|| ExchangeError::fatal(gone(&format!("malformed response {data}"))).with_order_gone())
    }

    async fn remove_order(&self, order: &Order) -> ExResult<()> {
        if order.order_id.is_empty() {
            let body = json!({ "symbol": order.key.ticker, "externalOid": order.cl_ord_id });
            self.rest.post("/api/v1/private/order/cancel_with_external", &body).await?;
            return Ok(());
        }
        let data = self.rest.post("/api/v1/private/order/cancel", &json!([order.order_id])).await?;
        // Per-order failures come back inside a successful response.
        let failed = data.as_array().and_then(|arr| {
            arr.iter().find_map(|r| i64_field(r, "errorCode").filter(|c| *c != 0).map(|c| (c, r.clone())))
        });
        match failed {
            Some((code, row)) => Err(ExchangeError::new(
                classify::classify_code(Exchange::Mexc, code),
                format!("[mexc] cancel {}: {row}", order.order_id),
            )),
            None => Ok(()),
        }
    }

    async fn trade_bucketed(
        &self,
        key: &SymbolKey,
        start: DateTime<Utc>,
        timeframe: Timeframe,
    ) -> ExResult<Vec<Kline>> {
        let now = Utc::now();
        let query = [
            ("interval", timeframe.mexc_interval().to_string()),
            ("start", start.timestamp().to_string()),
            ("end", now.timestamp().to_string()),
        ];
        let path = format!("/api/v1/contract/kline/{}", key.ticker);
        let data = self.rest.get(&path, &query, false).await?;
        let bar = ChronoDuration::milliseconds(timeframe.millis());
        Ok(parser::parse_klines(&data)
            .into_iter()
            .filter(|k| k.timestamp >= start && k.timestamp + bar <= now)
            .collect())
    }

    async fn trading_history(&self, count: usize, start: DateTime<Utc>) -> ExResult<HistoryPage> {
        let now = Utc::now();
        let mut records = Vec::new();
        let mut window_start = start;
        while window_start < now && records.len() < count {
            let window_end = (window_start + ChronoDuration::days(HISTORY_WINDOW_DAYS)).min(now);
            for key in self.keys() {
                records.extend(self.deals(&key, window_start, window_end, count).await?);
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

    async fn funding_history(&self, start: DateTime<Utc>) -> ExResult<Vec<Execution>> {
        let mut out = Vec::new();
        for key in self.keys() {
            for page in 1..=MAX_PAGES {
                let query = [
                    ("symbol", key.ticker.clone()),
                    ("page_num", page.to_string()),
                    ("page_size", PAGE_SIZE.to_string()),
                ];
                let data = self.rest.get("/api/v1/private/position/funding_records", &query, true).await?;
                let rows = array_of(&data, "resultList");
                let before = out.len();
                out.extend(
                    rows.iter()
                        .filter_map(|r| parser::parse_funding(r, &self.catalog))
                        .filter(|e| e.timestamp >= start),
                );
                let total_pages = i64_field(&data, "totalPage").unwrap_or(1);
                // Newest first: stop once a page reaches past `start`.
                if out.len() - before < rows.len() || page as i64 >= total_pages {
                    break;
                }
            }
        }
        let account = self.account_id();
        for e in &mut out {
            e.account = account.clone();
        }
        history::sort_by_time(&mut out);
        Ok(out)
    }

    fn stream_protocols(&self) -> Vec<Arc<dyn StreamProtocol>> {
        vec![Arc::new(MexcStream::new(&self.config, self.catalog.clone()))]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rest::test_support::serve;
    use mx_core::config::SymbolConfig;
    use mx_core::{Category, ErrorKind, Side};

    const LISTING: &str = r#"{"success":true,"code":0,"data":[
        {"symbol":"BTC_USDT","baseCoin":"BTC","quoteCoin":"USDT","settleCoin":"USDT","contractSize":0.0001,
         "minVol":1,"volUnit":1,"priceUnit":0.1,"state":0}
    ]}"#;

    fn ok(data: &str) -> (u16, String) {
        (200, format!(r#"{{"success":true,"code":0,"data":{data}}}"#))
    }

    fn adapter(url: String) -> MexcAdapter {
        let symbols = vec![SymbolConfig { ticker: "BTC_USDT".into(), category: Category::Linear }];
        let mut cfg = MarketConfig::new(Exchange::Mexc, symbols);
        cfg.http_url = Some(url);
        cfg.api_key = "key".into();
        cfg.api_secret = "secret".into();
        MexcAdapter::new(&cfg, InstrumentCatalog::new())
    }

    fn order(order_id: &str) -> Order {
        Order {
            cl_ord_id: "3.bot".into(),
            key: SymbolKey::new("BTC_USDT", Exchange::Mexc),
            side: Side::Sell,
            price: 50000.0,
            leaves_qty: 0.02,
            orig_qty: 0.05,
            order_id: order_id.into(),
            timestamp: Utc::now(),
            emi: "bot".into(),
        }
    }

    #[tokio::test]
    async fn account_id_is_api_key() {
        let a = adapter("http://127.0.0.1:1".into());
        assert_eq!(a.get_user().await.unwrap(), "key");
        assert_eq!(a.account_id(), "key");
    }

    #[tokio::test]
    async fn replace_cancels_then_resubmits_same_external_id() {
        let (url, seen) = serve(vec![
            (200, LISTING.into()),
            ok(r#"[{"orderId":"111","errorCode":0,"errorMsg":"success"}]"#),
            ok(r#""222""#),
        ])
        .await;
        let a = adapter(url);
        a.get_active_instruments().await.unwrap();

        let ack = a.replace_limit(&order("111"), 50100.0).await.unwrap();
        assert_eq!(ack.order_id, "222");
        assert_eq!(ack.cl_ord_id, "3.bot");
        assert_eq!(ack.leaves_qty, Some(0.02));

        let seen = seen.lock();
        assert!(seen[1].line.starts_with("POST /api/v1/private/order/cancel "));
        let body: Value = serde_json::from_str(&seen[2].body).unwrap();
        assert_eq!(body["externalOid"], "3.bot");
        assert_eq!(body["side"], 3);
        assert_eq!(body["vol"], 200.0);
    }

    #[tokio::test]
    async fn failed_resubmit_reports_cancelled_order() {
        let (url, _) = serve(vec![
            (200, LISTING.into()),
            ok(r#"[{"orderId":"111","errorCode":0,"errorMsg":"success"}]"#),
            (200, r#"{"success":false,"code":2005,"message":"balance insufficient"}"#.into()),
        ])
        .await;
        let a = adapter(url);
        a.get_active_instruments().await.unwrap();

        let err = a.replace_limit(&order("111"), 50100.0).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Block);
        assert!(err.order_gone);
        assert!(err.message.contains("3.bot cancelled for replace"), "{}", err.message);
    }

    #[tokio::test]
    async fn cancel_of_closed_order_is_ignore() {
        let (url, _) = serve(vec![ok(r#"[{"orderId":"111","errorCode":2041,"errorMsg":"order closed"}]"#)]).await;
        let err = adapter(url).remove_order(&order("111")).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Ignore);
    }

    #[tokio::test]
    async fn funding_stops_at_start() {
        let start = Utc::now() - ChronoDuration::hours(10);
        let recent = (Utc::now() - ChronoDuration::hours(1)).timestamp_millis();
        let old = (Utc::now() - ChronoDuration::days(2)).timestamp_millis();
        let page = format!(
            r#"{{"resultList":[
                {{"id":5,"symbol":"BTC_USDT","positionType":1,"positionValue":100.0,"funding":-0.01,"rate":0.0001,"settleTime":{recent}}},
                {{"id":4,"symbol":"BTC_USDT","positionType":1,"positionValue":100.0,"funding":-0.01,"rate":0.0001,"settleTime":{old}}}
            ],"totalPage":3}}"#
        );
        let (url, seen) = serve(vec![(200, LISTING.into()), ok(&page)]).await;
        let a = adapter(url);
        a.get_active_instruments().await.unwrap();

        let execs = a.funding_history(start).await.unwrap();
        assert_eq!(execs.len(), 1);
        assert_eq!(execs[0].exec_id, "funding-5");
        assert!((execs[0].fee - 0.01).abs() < 1e-12);
        assert_eq!(seen.lock().len(), 2);
    }
}
