//! Deribit JSON-RPC stream.
//!
//! Requests and their responses share an `id`; pushed data arrives as
//! `{"method": "subscription", "params": {"channel", "data"}}`. A subscribe
//! response lists the channels it confirmed, which is what the session waits
//! on.
//!
//! | Channel                          | Row       | Scope      |
//! |----------------------------------|-----------|------------|
//! | `user.orders.any.any.raw`        | orders    | account    |
//! | `user.trades.any.any.raw`        | fills     | account    |
//! | `user.changes.any.any.raw`       | positions | account    |
//! | `user.portfolio.any`             | balances  | account    |
//! | `book.<sym>.none.<n>.100ms`      | book      | per symbol |
//! | `quote.<sym>`                    | ticker    | per symbol |
//! | `ticker.<sym>.100ms`             | mark      | per symbol |
//!
//! After auth the client enables server heartbeats; every `test_request`
//! must be answered with `public/test` or the server drops the connection.

use std::time::Duration;

use mx_core::config::MarketConfig;
use mx_core::ws::{Heartbeat, Inbound, StreamProtocol};
use mx_core::{Action, DepthMode, InstrumentCatalog, Row, StreamMessage};
use serde_json::{Value, json};
use tracing::warn;

use super::auth::{AUTH_ID, ws_auth_message};
use super::json_parser as parser;
use crate::json_util::array_of;

const PRIVATE_CHANNELS: [&str; 4] =
    ["user.orders.any.any.raw", "user.trades.any.any.raw", "user.changes.any.any.raw", "user.portfolio.any"];

const HEARTBEAT_ID: u64 = 2;
const PRIVATE_SUBSCRIBE_ID: u64 = 3;
const PUBLIC_SUBSCRIBE_ID: u64 = 4;
const TEST_ID: u64 = 5;

/// Server heartbeat interval; Deribit's minimum.
const HEARTBEAT_SECS: u64 = 10;
const PING_EVERY: Duration = Duration::from_secs(5);
const LIVENESS: Duration = Duration::from_secs(12);

/// Book depths Deribit offers on the grouped book channel.
const BOOK_DEPTHS: [usize; 3] = [1, 10, 20];

fn request(id: u64, method: &str, params: Value) -> String {
    json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params }).to_string()
}

fn test_request() -> String {
    request(TEST_ID, "public/test", json!({}))
}

pub struct DeribitStream {
    url: String,
    credentials: Option<(String, String)>,
    symbols: Vec<String>,
    depth: DepthMode,
    catalog: InstrumentCatalog,
}

impl DeribitStream {
    pub fn new(config: &MarketConfig, catalog: InstrumentCatalog) -> Self {
        Self {
            url: config.ws_url(),
            credentials: config.has_credentials().then(|| (config.api_key.clone(), config.api_secret.clone())),
            symbols: config.symbols.iter().map(|s| s.ticker.clone()).collect(),
            depth: config.depth(),
            catalog,
        }
    }

    fn book_channel(&self, symbol: &str) -> String {
        match self.depth {
            DepthMode::Quote => format!("quote.{symbol}"),
            DepthMode::Book(n) => {
                let depth = BOOK_DEPTHS.iter().copied().find(|d| *d >= n).unwrap_or(20);
                format!("book.{symbol}.none.{depth}.100ms")
            }
        }
    }

    fn parse_notification(&self, params: &Value) -> Inbound {
        let Some(channel) = params.get("channel").and_then(Value::as_str) else {
            return Inbound::Ignore;
        };
        let Some(data) = params.get("data") else {
            return Inbound::Ignore;
        };
        let mut parts = channel.split('.');
        let message = match (parts.next(), parts.next()) {
            (Some("book"), _) => {
                parser::parse_book(data, &self.catalog).map(|b| StreamMessage::single(Action::Update, Row::Book(b)))
            }
            (Some("quote"), _) => {
                parser::parse_quote(data, &self.catalog).map(|t| StreamMessage::single(Action::Update, Row::Ticker(t)))
            }
            (Some("ticker"), _) => {
                parser::parse_ticker(data).map(|t| StreamMessage::single(Action::Update, Row::Ticker(t)))
            }
            (Some("user"), Some("orders")) => {
                let rows: Vec<Row> = match data.as_array() {
                    Some(list) => {
                        list.iter().filter_map(|o| parser::parse_order(o, &self.catalog)).map(Row::Order).collect()
                    }
                    None => parser::parse_order(data, &self.catalog).map(Row::Order).into_iter().collect(),
                };
                (!rows.is_empty()).then(|| StreamMessage::new(Action::Insert, rows))
            }
            (Some("user"), Some("trades")) => {
                let rows: Vec<Row> = data
                    .as_array()
                    .map(|list| {
                        list.iter().filter_map(|t| parser::parse_trade(t, &self.catalog)).map(Row::Execution).collect()
                    })
                    .unwrap_or_default();
                (!rows.is_empty()).then(|| StreamMessage::new(Action::Insert, rows))
            }
            (Some("user"), Some("changes")) => {
                let rows: Vec<Row> = array_of(data, "positions")
                    .iter()
                    .filter_map(|p| parser::parse_position(p, &self.catalog))
                    .map(Row::Position)
                    .collect();
                (!rows.is_empty()).then(|| StreamMessage::new(Action::Update, rows))
            }
            (Some("user"), Some("portfolio")) => {
                parser::parse_portfolio(data).map(|m| StreamMessage::single(Action::Update, Row::Margin(m)))
            }
            _ => {
                warn!("[deribit] unexpected channel {channel}");
                None
            }
        };
        match message {
            Some(m) => Inbound::Data(vec![m]),
            None => Inbound::Ignore,
        }
    }

    fn parse_response(&self, v: &Value) -> Inbound {
        let id = v.get("id").and_then(Value::as_u64);
        if let Some(err) = v.get("error") {
            let reason = format!(
                "{} {}",
                err.get("code").and_then(Value::as_i64).unwrap_or_default(),
                err.get("message").and_then(Value::as_str).unwrap_or_default()
            );
            return match id {
                Some(AUTH_ID) => Inbound::AuthFailed(reason),
                Some(PRIVATE_SUBSCRIBE_ID) | Some(PUBLIC_SUBSCRIBE_ID) => Inbound::SubscribeFailed(reason),
                _ => Inbound::Error(reason),
            };
        }
        match id {
            Some(AUTH_ID) => Inbound::AuthOk,
            Some(PRIVATE_SUBSCRIBE_ID) | Some(PUBLIC_SUBSCRIBE_ID) => {
                let channels =
                    array_of(v, "result").iter().filter_map(Value::as_str).map(str::to_string).collect::<Vec<_>>();
                Inbound::Subscribed(channels)
            }
            Some(TEST_ID) => Inbound::Pong,
            _ => Inbound::Ignore,
        }
    }
}

impl StreamProtocol for DeribitStream {
    fn label(&self) -> String {
        "deribit".into()
    }

    fn url(&self) -> String {
        self.url.clone()
    }

    fn auth_message(&self) -> Option<String> {
        self.credentials.as_ref().map(|(key, secret)| ws_auth_message(key, secret))
    }

    fn setup_messages(&self) -> Vec<String> {
        vec![request(HEARTBEAT_ID, "public/set_heartbeat", json!({ "interval": HEARTBEAT_SECS }))]
    }

    fn subscribe_messages(&self) -> Vec<String> {
        if self.credentials.is_none() {
            return Vec::new();
        }
        vec![request(PRIVATE_SUBSCRIBE_ID, "private/subscribe", json!({ "channels": self.required_topics() }))]
    }

    fn required_topics(&self) -> Vec<String> {
        if self.credentials.is_none() {
            return Vec::new();
        }
        PRIVATE_CHANNELS.iter().map(|c| c.to_string()).collect()
    }

    fn symbol_subscribe_messages(&self) -> Vec<String> {
        vec![request(PUBLIC_SUBSCRIBE_ID, "public/subscribe", json!({ "channels": self.symbol_topics() }))]
    }

    fn symbol_topics(&self) -> Vec<String> {
        self.symbols.iter().flat_map(|s| [self.book_channel(s), format!("ticker.{s}.100ms")]).collect()
    }

    fn heartbeat(&self) -> Heartbeat {
        Heartbeat { ping: Some((PING_EVERY, test_request())), liveness: LIVENESS }
    }

    fn handle(&self, text: &str) -> Inbound {
        let Ok(v) = serde_json::from_str::<Value>(text) else {
            return Inbound::Ignore;
        };
        match v.get("method").and_then(Value::as_str) {
            Some("subscription") => v.get("params").map(|p| self.parse_notification(p)).unwrap_or(Inbound::Ignore),
            Some("heartbeat") => match v.pointer("/params/type").and_then(Value::as_str) {
                Some("test_request") => Inbound::Reply(test_request()),
                _ => Inbound::Pong,
            },
            Some(_) => Inbound::Ignore,
            None => self.parse_response(&v),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mx_core::config::SymbolConfig;
    use mx_core::{Category, Exchange};

    fn stream(depth: Option<usize>, key: &str) -> DeribitStream {
        let symbols = vec![SymbolConfig { ticker: "BTC-PERPETUAL".into(), category: Category::Inverse }];
        let mut cfg = MarketConfig::new(Exchange::Deribit, symbols);
        cfg.orderbook_depth = depth;
        cfg.api_key = key.into();
        cfg.api_secret = if key.is_empty() { String::new() } else { "secret".into() };
        DeribitStream::new(&cfg, InstrumentCatalog::new())
    }

    #[test]
    fn channels_follow_depth() {
        assert_eq!(stream(None, "").symbol_topics(), vec!["quote.BTC-PERPETUAL", "ticker.BTC-PERPETUAL.100ms"]);
        assert_eq!(stream(Some(5), "").symbol_topics()[0], "book.BTC-PERPETUAL.none.10.100ms");
        assert_eq!(stream(Some(50), "").symbol_topics()[0], "book.BTC-PERPETUAL.none.20.100ms");
    }

    #[test]
    fn public_mode_skips_private_channels() {
        let s = stream(None, "");
        assert!(s.auth_message().is_none());
        assert!(s.subscribe_messages().is_empty());
        assert_eq!(s.setup_messages().len(), 1);
    }

    #[test]
    fn responses_by_id() {
        let s = stream(None, "key");
        assert_eq!(s.handle(r#"{"jsonrpc":"2.0","id":1,"result":{"access_token":"x"}}"#), Inbound::AuthOk);
        assert!(matches!(
            s.handle(r#"{"jsonrpc":"2.0","id":1,"error":{"code":13004,"message":"invalid_credentials"}}"#),
            Inbound::AuthFailed(_)
        ));
        assert_eq!(
            s.handle(r#"{"jsonrpc":"2.0","id":3,"result":["user.orders.any.any.raw"]}"#),
            Inbound::Subscribed(vec!["user.orders.any.any.raw".into()])
        );
        assert_eq!(s.handle(r#"{"jsonrpc":"2.0","id":2,"result":"ok"}"#), Inbound::Ignore);
        assert_eq!(s.handle(r#"{"jsonrpc":"2.0","id":5,"result":{"version":"1.2.26"}}"#), Inbound::Pong);
    }

    #[test]
    fn test_request_is_answered() {
        let s = stream(None, "");
        let request = r#"{"jsonrpc":"2.0","method":"heartbeat","params":{"type":"test_request"}}"#;
        let Inbound::Reply(reply) = s.handle(request) else {
            panic!("expected reply")
        };
        assert!(reply.contains("public/test"));
        assert_eq!(s.handle(r#"{"jsonrpc":"2.0","method":"heartbeat","params":{"type":"heartbeat"}}"#), Inbound::Pong);
    }

    #[test]
    fn order_notification() {
        let s = stream(None, "key");
        let frame = r#"{"jsonrpc":"2.0","method":"subscription","params":{"channel":"user.orders.any.any.raw","data":
            {"order_id":"1","label":"1.bot","instrument_name":"BTC-PERPETUAL","direction":"buy","price":100.0,
             "amount":10.0,"filled_amount":10.0,"order_state":"filled","last_update_timestamp":1700000000000}}}"#;
        let Inbound::Data(msgs) = s.handle(frame) else { panic!("expected data") };
        assert_eq!(msgs[0].action, Action::Insert);
        let Row::Order(row) = &msgs[0].rows[0] else { panic!("expected order") };
        assert_eq!(row.status, Some(mx_core::OrderStatus::Filled));
        assert_eq!(row.leaves_qty, Some(0.0));
    }

    #[test]
    fn book_notification_is_full_update() {
        let s = stream(Some(10), "");
        let frame = r#"{"jsonrpc":"2.0","method":"subscription","params":{"channel":"book.BTC-PERPETUAL.none.10.100ms",
            "data":{"instrument_name":"BTC-PERPETUAL","bids":[[100.0,20.0]],"asks":[[100.5,10.0]],"timestamp":1}}}"#;
        let Inbound::Data(msgs) = s.handle(frame) else { panic!("expected data") };
        let Row::Book(book) = &msgs[0].rows[0] else { panic!("expected book") };
        assert_eq!(book.asks, vec![[100.5, 10.0]]);
        assert_eq!(msgs[0].action, Action::Update);
    }
}
