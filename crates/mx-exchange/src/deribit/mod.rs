//! Deribit adapter.
//!
//! Every REST call is a JSON-RPC method reached with `GET
//! /api/v2/<scope>/<method>?<params>`; `private/*` methods are signed. All
//! calls share one [`RateLimiter`] sized to Deribit's credit limits.
//!
//! | Operation      | Method                                          |
//! |----------------|-------------------------------------------------|
//! | Instruments    | `public/get_instruments`                        |
//! | User           | `private/get_account_summary` (`extended`)      |
//! | Balances       | `private/get_account_summaries`                 |
//! | Positions      | `private/get_positions` per currency            |
//! | Open orders    | `private/get_open_orders`                       |
//! | Place          | `private/buy`, `private/sell`                   |
//! | Amend          | `private/edit`, `private/edit_by_label`         |
//! | Cancel         | `private/cancel`, `private/cancel_by_label`     |
//! | Klines         | `public/get_tradingview_chart_data`             |
//! | Trade history  | `private/get_user_trades_by_currency_and_time`  |
//! | Funding        | `private/get_transaction_log`                   |
//!
//! Trades older than a few days move to a separate historical store, so
//! history reads both stores and merges them. Funding and delivery never
//! appear among trades; they are read from the transaction log, including by
//! a daily poll shortly after the 08:00 UTC settlement.

pub mod auth;
pub mod json_parser;
pub mod stream;

use std::sync::Arc;

use ahash::AHashSet;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, NaiveTime, Utc};
use mx_core::config::MarketConfig;
use mx_core::error::{ExResult, ExchangeError};
use mx_core::rate_limit::RateLimiter;
use mx_core::ws::StreamProtocol;
use mx_core::{
    Exchange, Execution, HistoryPage, InstrumentCatalog, Kline, LimitOrder, MarginRow, Order, OrderAck, OrderRow,
    PositionRow, Side, SymbolKey, Timeframe,
};
use parking_lot::RwLock;
use serde_json::Value;
use tracing::{debug, info};

use crate::ExchangeAdapter;
use crate::history;
use crate::json_util::{array_of, i64_field, str_field};
use crate::rest::RestClient;

use self::auth::DeribitSigner;
use self::json_parser as parser;
use self::stream::DeribitStream;

/// Largest page the trade and transaction endpoints return.
const MAX_PAGE: usize = 1000;
/// Bars requested per chart call.
const CHART_BARS: i64 = 1000;
/// Transaction log pages followed per funding poll.
const MAX_LOG_PAGES: usize = 20;

pub struct DeribitAdapter {
    config: MarketConfig,
    rest: RestClient,
    catalog: InstrumentCatalog,
    account: RwLock<String>,
}

impl DeribitAdapter {
    pub fn new(config: &MarketConfig, catalog: InstrumentCatalog) -> Self {
        let signer = DeribitSigner { api_key: config.api_key.clone(), api_secret: config.api_secret.clone() };
        Self {
            rest: RestClient::new(config, Box::new(signer)).with_limiter(Arc::new(RateLimiter::deribit())),
            config: config.clone(),
            catalog,
            account: RwLock::new(String::new()),
        }
    }

    async fn call(&self, method: &str, params: &[(&str, String)]) -> ExResult<Value> {
        self.rest.get(&format!("/api/v2/{method}"), params, method.starts_with("private/")).await
    }

    /// Settlement currencies of the configured symbols, in config order.
    fn currencies(&self) -> Vec<String> {
        let mut seen = AHashSet::new();
        self.config
            .symbols
            .iter()
            .filter_map(|s| {
                self.catalog.with(&SymbolKey::new(&s.ticker, Exchange::Deribit), |i| i.settl_currency.clone())
            })
            .filter(|c| !c.is_empty() && seen.insert(c.clone()))
            .collect()
    }

    fn ack(&self, value: &Value, what: &str) -> ExResult<OrderAck> {
        parser::parse_ack(value, &self.catalog)
            .ok_or_else(|| ExchangeError::fatal(format!("[deribit] malformed {what} response: {value}")))
    }

    /// One page of user trades from the recent or the historical store, with
    /// the store's `has_more` flag.
    async fn trades_page(
        &self,
        currency: &str,
        start: DateTime<Utc>,
        count: usize,
        historical: bool,
    ) -> ExResult<(Vec<Execution>, bool)> {
        let query = [
            ("currency", currency.to_string()),
            ("start_timestamp", start.timestamp_millis().to_string()),
            ("end_timestamp", Utc::now().timestamp_millis().to_string()),
            ("count", count.min(MAX_PAGE).to_string()),
            ("sorting", "asc".into()),
            ("historical", historical.to_string()),
        ];
        let result = self.call("private/get_user_trades_by_currency_and_time", &query).await?;
        let trades = array_of(&result, "trades").iter().filter_map(|t| parser::parse_trade(t, &self.catalog)).collect();
        let more = result.get("has_more").and_then(Value::as_bool).unwrap_or(false);
        Ok((trades, more))
    }
}

#[async_trait]
impl ExchangeAdapter for DeribitAdapter {
    fn exchange(&self) -> Exchange {
        Exchange::Deribit
    }

    async fn get_active_instruments(&self) -> ExResult<()> {
        let query = [("currency", "any".into()), ("expired", "false".into())];
        let listing = self.call("public/get_instruments", &query).await?;
        let instruments: Vec<_> =
            listing.as_array().map(|arr| arr.iter().filter_map(parser::parse_instrument).collect()).unwrap_or_default();
        for sym in &self.config.symbols {
            let Some(inst) = instruments.iter().find(|i| i.key.ticker == sym.ticker) else {
                return Err(ExchangeError::cancel(format!("[deribit] unknown symbol {}", sym.ticker)));
            };
            debug!(
                "[deribit] {} tick={} step={} mult={} cat={}",
                sym.ticker, inst.tick_size, inst.qty_step, inst.my_multiplier, inst.category
            );
            self.catalog.insert(inst.clone());
        }
        info!("[deribit] loaded {} instruments", self.config.symbols.len());
        Ok(())
    }

    async fn get_user(&self) -> ExResult<String> {
        let currency = self.currencies().into_iter().next().unwrap_or_else(|| "BTC".into());
        let query = [("currency", currency), ("extended", "true".into())];
        let summary = self.call("private/get_account_summary", &query).await?;
        let id = str_field(&summary, "id").ok_or_else(|| ExchangeError::fatal("[deribit] account summary without id"))?;
        *self.account.write() = id.clone();
        Ok(id)
    }

    fn account_id(&self) -> String {
        self.account.read().clone()
    }

    async fn get_wallet_balance(&self) -> ExResult<Vec<MarginRow>> {
        let result = self.call("private/get_account_summaries", &[("extended", "true".into())]).await?;
        let summaries = match result.as_array() {
            Some(list) => list.as_slice(),
            None => array_of(&result, "summaries"),
        };
        Ok(summaries.iter().filter_map(parser::parse_portfolio).collect())
    }

    async fn get_position_info(&self) -> ExResult<Vec<PositionRow>> {
        let mut out = Vec::new();
        for currency in self.currencies() {
            let positions = self.call("private/get_positions", &[("currency", currency)]).await?;
            if let Some(list) = positions.as_array() {
                out.extend(list.iter().filter_map(|p| parser::parse_position(p, &self.catalog)));
            }
        }
        Ok(out)
    }

    async fn open_orders(&self) -> ExResult<Vec<OrderRow>> {
        let orders = self.call("private/get_open_orders", &[("type", "limit".into())]).await?;
        Ok(orders
            .as_array()
            .map(|arr| arr.iter().filter_map(|o| parser::parse_order(o, &self.catalog)).collect())
            .unwrap_or_default())
    }

    async fn place_limit(&self, order: &LimitOrder) -> ExResult<OrderAck> {
        let method = match order.side() {
            Side::Buy => "private/buy",
            Side::Sell => "private/sell",
        };
        let query = [
            ("instrument_name", order.key.ticker.clone()),
            ("amount", self.catalog.native_qty(&order.key, order.qty.abs()).to_string()),
            ("type", "limit".into()),
            ("price", order.price.to_string()),
            ("label", order.cl_ord_id.clone()),
        ];
        let resp = self.call(method, &query).await?;
        self.ack(&resp, "place")
    }

    async fn replace_limit(&self, order: &Order, price: f64) -> ExResult<OrderAck> {
        let amount = self.catalog.native_qty(&order.key, order.orig_qty).to_string();
        let resp = if order.order_id.is_empty() {
            let query = [
                ("label", order.cl_ord_id.clone()),
                ("instrument_name", order.key.ticker.clone()),
                ("amount", amount),
                ("price", price.to_string()),
            ];
            self.call("private/edit_by_label", &query).await?
        } else {
            let query = [("order_id", order.order_id.clone()), ("amount", amount), ("price", price.to_string())];
            self.call("private/edit", &query).await?
        };
        self.ack(&resp, "edit")
    }

    async fn remove_order(&self, order: &Order) -> ExResult<()> {
        if order.order_id.is_empty() {
            let query = [("label", order.cl_ord_id.clone()), ("currency", "any".into())];
            let cancelled = self.call("private/cancel_by_label", &query).await?;
            if cancelled.as_i64() == Some(0) {
                return Err(ExchangeError::ignore(format!("[deribit] no open order labelled {}", order.cl_ord_id)));
            }
        } else {
            self.call("private/cancel", &[("order_id", order.order_id.clone())]).await?;
        }
        Ok(())
    }

    async fn trade_bucketed(
        &self,
        key: &SymbolKey,
        start: DateTime<Utc>,
        timeframe: Timeframe,
    ) -> ExResult<Vec<Kline>> {
        let now = Utc::now();
        let end = (start + ChronoDuration::milliseconds(timeframe.millis() * CHART_BARS)).min(now);
        let query = [
            ("instrument_name", key.ticker.clone()),
            ("start_timestamp", start.timestamp_millis().to_string()),
            ("end_timestamp", end.timestamp_millis().to_string()),
            ("resolution", timeframe.deribit_resolution().to_string()),
        ];
        let chart = self.call("public/get_tradingview_chart_data", &query).await?;
        let bar = ChronoDuration::milliseconds(timeframe.millis());
        Ok(parser::parse_chart(&chart)
            .into_iter()
            .filter(|k| k.timestamp >= start && k.timestamp + bar <= now)
            .collect())
    }

    async fn trading_history(&self, count: usize, start: DateTime<Utc>) -> ExResult<HistoryPage> {
        let mut records = Vec::new();
        let mut more = false;
        for currency in self.currencies() {
            let (recent, recent_more) = self.trades_page(&currency, start, count, false).await?;
            let (archived, archived_more) = self.trades_page(&currency, start, count, true).await?;
            more |= recent_more || archived_more;
            records.extend(history::merge_stores(recent, archived));
        }
        let account = self.account_id();
        for e in &mut records {
            e.account = account.clone();
        }
        history::sort_by_time(&mut records);
        more |= records.len() > count;
        records.truncate(count);
        Ok(HistoryPage { records, more })
    }

    async fn funding_history(&self, start: DateTime<Utc>) -> ExResult<Vec<Execution>> {
        let mut out = Vec::new();
        for currency in self.currencies() {
            let mut continuation: Option<i64> = None;
            for _ in 0..MAX_LOG_PAGES {
                let mut query = vec![
                    ("currency", currency.clone()),
                    ("start_timestamp", start.timestamp_millis().to_string()),
                    ("end_timestamp", Utc::now().timestamp_millis().to_string()),
                    ("count", MAX_PAGE.to_string()),
                ];
                if let Some(c) = continuation {
                    query.push(("continuation", c.to_string()));
                }
                let page = self.call("private/get_transaction_log", &query).await?;
                out.extend(array_of(&page, "logs").iter().filter_map(|l| parser::parse_transaction(l, &self.catalog)));
                continuation = i64_field(&page, "continuation");
                if continuation.is_none() {
                    break;
                }
            }
        }
        let account = self.account_id();
        for e in out.iter_mut().filter(|e| e.account.is_empty()) {
            e.account = account.clone();
        }
        history::sort_by_time(&mut out);
        Ok(out)
    }

    fn funding_poll_time(&self) -> Option<NaiveTime> {
        NaiveTime::from_hms_opt(8, 0, 10)
    }

    fn stream_protocols(&self) -> Vec<Arc<dyn StreamProtocol>> {
        vec![Arc::new(DeribitStream::new(&self.config, self.catalog.clone()))]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rest::test_support::serve;
    use mx_core::config::SymbolConfig;
    use mx_core::{Category, ErrorKind, ExecType};

    const LISTING: &str = r#"{"jsonrpc":"2.0","result":[
        {"instrument_name":"BTC-PERPETUAL","kind":"future","instrument_type":"reversed","tick_size":0.5,
         "min_trade_amount":10,"contract_size":10,"base_currency":"BTC","quote_currency":"USD",
         "settlement_currency":"BTC","settlement_period":"perpetual","is_active":true}
    ]}"#;

    fn rpc(result: &str) -> (u16, String) {
        (200, format!(r#"{{"jsonrpc":"2.0","result":{result}}}"#))
    }

    fn adapter(url: String, tickers: &[&str]) -> DeribitAdapter {
        let symbols =
            tickers.iter().map(|t| SymbolConfig { ticker: t.to_string(), category: Category::Inverse }).collect();
        let mut cfg = MarketConfig::new(Exchange::Deribit, symbols);
        cfg.http_url = Some(url);
        cfg.api_key = "key".into();
        cfg.api_secret = "secret".into();
        DeribitAdapter::new(&cfg, InstrumentCatalog::new())
    }

    fn trade(id: &str, amount: f64, ts: i64) -> String {
        format!(
            r#"{{"trade_id":"{id}","order_id":"o1","label":"1.bot","instrument_name":"BTC-PERPETUAL","direction":"buy",
                "amount":{amount},"price":50000.0,"fee":0.00001,"fee_currency":"BTC","timestamp":{ts}}}"#
        )
    }

    #[tokio::test]
    async fn unknown_symbol_cancels() {
        let (url, _) = serve(vec![(200, LISTING.into())]).await;
        let err = adapter(url, &["ETH-PERPETUAL"]).get_active_instruments().await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Cancel);
    }

    #[tokio::test]
    async fn sell_sends_native_amount() {
        let ack = r#"{"order":{"order_id":"o9","label":"2.bot","instrument_name":"BTC-PERPETUAL","direction":"sell",
            "price":51000.0,"amount":120.0,"filled_amount":0.0,"order_state":"open","last_update_timestamp":1700000000000},"trades":[]}"#;
        let (url, seen) = serve(vec![(200, LISTING.into()), rpc(ack)]).await;
        let a = adapter(url, &["BTC-PERPETUAL"]);
        a.get_active_instruments().await.unwrap();

        let key = SymbolKey::new("BTC-PERPETUAL", Exchange::Deribit);
        let order = LimitOrder { key, qty: -12.0, price: 51000.0, cl_ord_id: "2.bot".into(), order_id: None };
        let ack = a.place_limit(&order).await.unwrap();
        assert_eq!(ack.order_id, "o9");
        assert_eq!(ack.leaves_qty, Some(12.0));

        let line = &seen.lock()[1].line;
        assert!(line.starts_with("GET /api/v2/private/sell?"), "{line}");
        assert!(line.contains("amount=120&"));
        assert!(line.contains("label=2.bot"));
    }

    #[tokio::test]
    async fn history_merges_stores_and_keeps_legs() {
        let page = |a: String, b: String| format!(r#"{{"trades":[{a},{b}],"has_more":false}}"#);
        let recent = page(trade("t2", 50.0, 2000), trade("t2", 30.0, 2000));
        let archived = page(trade("t1", 10.0, 1000), trade("t2", 50.0, 2000));
        let (url, seen) = serve(vec![(200, LISTING.into()), rpc(&recent), rpc(&archived)]).await;
        let a = adapter(url, &["BTC-PERPETUAL"]);
        a.get_active_instruments().await.unwrap();

        let page = a.trading_history(500, DateTime::from_timestamp_millis(0).unwrap()).await.unwrap();
        assert_eq!(page.records.iter().map(|e| e.exec_id.as_str()).collect::<Vec<_>>(), vec!["t1", "t2", "t2"]);
        assert_eq!(page.records.iter().map(|e| e.qty).collect::<Vec<_>>(), vec![1.0, 5.0, 3.0]);
        assert!(!page.more);
        assert!(seen.lock()[2].line.contains("historical=true"));
    }

    #[tokio::test]
    async fn full_page_with_split_fill_reports_more() {
        let mut trades: Vec<String> = (0..498).map(|i| trade(&format!("t{i}"), 10.0, 1000 + i)).collect();
        trades.push(trade("split", 50.0, 2000));
        trades.push(trade("split", 30.0, 2000));
        let recent = format!(r#"{{"trades":[{}],"has_more":true}}"#, trades.join(","));
        let archived = r#"{"trades":[],"has_more":false}"#;
        let (url, _) = serve(vec![(200, LISTING.into()), rpc(&recent), rpc(archived)]).await;
        let a = adapter(url, &["BTC-PERPETUAL"]);
        a.get_active_instruments().await.unwrap();

        let page = a.trading_history(500, DateTime::from_timestamp_millis(0).unwrap()).await.unwrap();
        assert_eq!(page.records.len(), 500);
        assert!(page.more);
    }

    #[tokio::test]
    async fn funding_follows_continuation() {
        let page1 = r#"{"logs":[{"id":1,"type":"settlement","instrument_name":"BTC-PERPETUAL","position":100.0,
            "interest_pl":0.0002,"currency":"BTC","timestamp":1700000000000,"user_id":7},
            {"id":2,"type":"trade","instrument_name":"BTC-PERPETUAL","timestamp":1700000000001}],"continuation":55}"#;
        let page2 = r#"{"logs":[{"id":3,"type":"delivery","instrument_name":"BTC-PERPETUAL","position":-10.0,
            "cashflow":-0.001,"price":50000.0,"currency":"BTC","timestamp":1700000001000,"user_id":7}],"continuation":null}"#;
        let (url, seen) = serve(vec![(200, LISTING.into()), rpc(page1), rpc(page2)]).await;
        let a = adapter(url, &["BTC-PERPETUAL"]);
        a.get_active_instruments().await.unwrap();

        let execs = a.funding_history(Utc::now() - ChronoDuration::days(1)).await.unwrap();
        assert_eq!(execs.len(), 2);
        assert_eq!(execs[0].exec_type, ExecType::Funding);
        assert!((execs[0].fee + 0.0002).abs() < 1e-12);
        assert_eq!(execs[1].exec_type, ExecType::Delivery);
        assert_eq!(execs[1].account, "7");
        assert!(seen.lock()[2].line.contains("continuation=55"));
    }

    #[test]
    fn daily_funding_poll() {
        let a = adapter("http://127.0.0.1:1".into(), &["BTC-PERPETUAL"]);
        assert_eq!(a.funding_poll_time(), NaiveTime::from_hms_opt(8, 0, 10));
    }
}
