//! Bybit v5 streams.
//!
//! Public data lives on one endpoint per category
//! (`/v5/public/{linear,inverse,spot,option}`); account data on
//! `/v5/private`. Every subscription is sent as its own frame with the topic
//! as `req_id`, so the ack names the topic it confirms.
//!
//! | Topic                | Stream  | Row            |
//! |----------------------|---------|----------------|
//! | `orderbook.1.<sym>`  | public  | top of book    |
//! | `orderbook.50.<sym>` | public  | book (local)   |
//! | `tickers.<sym>`      | public  | mark price     |
//! | `order`              | private | orders         |
//! | `execution`          | private | fills, funding |
//! | `position`           | private | positions      |
//! | `wallet`             | private | balances       |

use std::time::Duration;

use ahash::AHashMap;
use mx_core::config::MarketConfig;
use mx_core::ws::{Heartbeat, Inbound, StreamProtocol};
use mx_core::{Action, BookRow, Category, DepthMode, Exchange, InstrumentCatalog, Row, StreamMessage, SymbolKey};
use parking_lot::Mutex;
use serde_json::Value;

use super::auth::ws_auth_message;
use super::json_parser as parser;
use super::order_book::OrderBook;
use crate::json_util::{array_of, parse_levels};

const PRIVATE_TOPICS: [&str; 4] = ["order", "execution", "position", "wallet"];
const PING_EVERY: Duration = Duration::from_secs(5);
const LIVENESS: Duration = Duration::from_secs(12);
const PING: &str = r#"{"op":"ping"}"#;

fn subscribe(topic: &str) -> String {
    serde_json::json!({ "req_id": topic, "op": "subscribe", "args": [topic] }).to_string()
}

fn heartbeat() -> Heartbeat {
    Heartbeat { ping: Some((PING_EVERY, PING.into())), liveness: LIVENESS }
}

/// Control frames shared by both streams: pong, auth and subscribe acks.
fn handle_control(v: &Value) -> Option<Inbound> {
    let op = v.get("op").and_then(Value::as_str)?;
    let success = v.get("success").and_then(Value::as_bool);
    let msg = v.get("ret_msg").and_then(Value::as_str).unwrap_or_default().to_string();
    Some(match (op, success) {
        ("pong", _) | ("ping", _) => Inbound::Pong,
        ("auth", Some(true)) => Inbound::AuthOk,
        ("auth", _) => Inbound::AuthFailed(msg),
        ("subscribe", Some(true)) => match v.get("req_id").and_then(Value::as_str) {
            Some(topic) => Inbound::Subscribed(vec![topic.to_string()]),
            None => Inbound::Ignore,
        },
        ("subscribe", _) => Inbound::SubscribeFailed(msg),
        _ => Inbound::Ignore,
    })
}

// ---------------------------------------------------------------------------
// Public
// ---------------------------------------------------------------------------

/// Market data for one category.
pub struct BybitPublicStream {
    url: String,
    category: Category,
    symbols: Vec<String>,
    depth: DepthMode,
    books: Mutex<AHashMap<String, OrderBook<50>>>,
}

impl BybitPublicStream {
    pub fn new(config: &MarketConfig, category: Category) -> Self {
        let name = parser::category_str(category).unwrap_or("linear");
        Self {
            url: format!("{}/public/{name}", config.ws_url().trim_end_matches('/')),
            category,
            symbols: config.tickers(category),
            depth: config.depth(),
            books: Mutex::new(AHashMap::new()),
        }
    }

    fn book_topic(&self) -> &'static str {
        match self.depth {
            DepthMode::Quote => "orderbook.1",
            DepthMode::Book(_) => "orderbook.50",
        }
    }

    fn parse_book(&self, v: &Value) -> Option<Row> {
        let data = v.get("data")?;
        let symbol = data.get("s")?.as_str()?;
        let bids = parse_levels(data.get("b"));
        let asks = parse_levels(data.get("a"));
        let mut books = self.books.lock();
        let book = books.entry(symbol.to_string()).or_default();
        if v.get("type").and_then(Value::as_str) == Some("snapshot") {
            book.set_snapshot(&bids, &asks);
        } else {
            book.update(&bids, &asks);
        }
        let (bids, asks) = book.top(self.depth.levels());
        Some(Row::Book(BookRow { key: SymbolKey::new(symbol, Exchange::Bybit), bids, asks }))
    }
}

impl StreamProtocol for BybitPublicStream {
    fn label(&self) -> String {
        format!("bybit-{}", self.category)
    }

    fn url(&self) -> String {
        self.url.clone()
    }

    fn auth_message(&self) -> Option<String> {
        None
    }

    fn subscribe_messages(&self) -> Vec<String> {
        Vec::new()
    }

    fn required_topics(&self) -> Vec<String> {
        Vec::new()
    }

    fn symbol_subscribe_messages(&self) -> Vec<String> {
        self.symbol_topics().iter().map(|t| subscribe(t)).collect()
    }

    fn symbol_topics(&self) -> Vec<String> {
        let book = self.book_topic();
        let mark = !matches!(self.category, Category::Spot);
        self.symbols
            .iter()
            .flat_map(|s| {
                let mut topics = vec![format!("{book}.{s}")];
                if mark {
                    topics.push(format!("tickers.{s}"));
                }
                topics
            })
            .collect()
    }

    fn heartbeat(&self) -> Heartbeat {
        heartbeat()
    }

    fn handle(&self, text: &str) -> Inbound {
        let Ok(v) = serde_json::from_str::<Value>(text) else {
            return Inbound::Ignore;
        };
        let Some(topic) = v.get("topic").and_then(Value::as_str) else {
            return handle_control(&v).unwrap_or(Inbound::Ignore);
        };
        let row = if topic.starts_with("orderbook.") {
            self.parse_book(&v)
        } else if topic.starts_with("tickers.") {
            v.get("data").and_then(parser::parse_ticker).map(Row::Ticker)
        } else {
            None
        };
        match row {
            Some(row) => Inbound::Data(vec![StreamMessage::single(Action::Update, row)]),
            None => Inbound::Ignore,
        }
    }

    fn reset(&self) {
        self.books.lock().clear();
    }
}

// ---------------------------------------------------------------------------
// Private
// ---------------------------------------------------------------------------

/// Orders, fills, positions and balances.
pub struct BybitPrivateStream {
    url: String,
    api_key: String,
    api_secret: String,
    catalog: InstrumentCatalog,
}

impl BybitPrivateStream {
    pub fn new(config: &MarketConfig, catalog: InstrumentCatalog) -> Self {
        Self {
            url: format!("{}/private", config.ws_url().trim_end_matches('/')),
            api_key: config.api_key.clone(),
            api_secret: config.api_secret.clone(),
            catalog,
        }
    }

    fn parse_data(&self, topic: &str, v: &Value) -> Option<StreamMessage> {
        let data = array_of(v, "data");
        let (action, rows): (Action, Vec<Row>) = match topic {
            "order" => (Action::Insert, data.iter().filter_map(parser::parse_order).map(Row::Order).collect()),
            "execution" => {
                let rows = data
                    .iter()
                    .filter_map(|e| {
                        let category = e.get("category").and_then(Value::as_str).and_then(parser::parse_category)?;
                        parser::parse_execution(e, category, &self.catalog)
                    })
                    .map(Row::Execution)
                    .collect();
                (Action::Insert, rows)
            }
            "position" => (Action::Update, data.iter().filter_map(parser::parse_position).map(Row::Position).collect()),
            "wallet" => (Action::Update, data.iter().flat_map(parser::parse_wallet).map(Row::Margin).collect()),
            _ => return None,
        };
        (!rows.is_empty()).then(|| StreamMessage::new(action, rows))
    }
}

impl StreamProtocol for BybitPrivateStream {
    fn label(&self) -> String {
        "bybit-private".into()
    }

    fn url(&self) -> String {
        self.url.clone()
    }

    fn auth_message(&self) -> Option<String> {
        Some(ws_auth_message(&self.api_key, &self.api_secret))
    }

    fn subscribe_messages(&self) -> Vec<String> {
        PRIVATE_TOPICS.iter().map(|t| subscribe(t)).collect()
    }

    fn required_topics(&self) -> Vec<String> {
        PRIVATE_TOPICS.iter().map(|t| t.to_string()).collect()
    }

    fn heartbeat(&self) -> Heartbeat {
        heartbeat()
    }

    fn handle(&self, text: &str) -> Inbound {
        let Ok(v) = serde_json::from_str::<Value>(text) else {
            return Inbound::Ignore;
        };
        match v.get("topic").and_then(Value::as_str) {
            Some(topic) => match self.parse_data(topic, &v) {
                Some(msg) => Inbound::Data(vec![msg]),
                None => Inbound::Ignore,
            },
            None => handle_control(&v).unwrap_or(Inbound::Ignore),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mx_core::config::SymbolConfig;

    fn config(depth: Option<usize>) -> MarketConfig {
        let mut cfg = MarketConfig::new(
            Exchange::Bybit,
            vec![
                SymbolConfig { ticker: "BTCUSDT".into(), category: Category::Linear },
                SymbolConfig { ticker: "ETHUSDT".into(), category: Category::Spot },
            ],
        );
        cfg.orderbook_depth = depth;
        cfg.api_key = "key".into();
        cfg.api_secret = "secret".into();
        cfg
    }

    #[test]
    fn public_topics_per_category() {
        let linear = BybitPublicStream::new(&config(None), Category::Linear);
        assert_eq!(linear.url(), "wss://stream.bybit.com/v5/public/linear");
        assert_eq!(linear.symbol_topics(), vec!["orderbook.1.BTCUSDT", "tickers.BTCUSDT"]);
        let spot = BybitPublicStream::new(&config(Some(25)), Category::Spot);
        assert_eq!(spot.symbol_topics(), vec!["orderbook.50.ETHUSDT"]);
        assert!(spot.symbol_subscribe_messages()[0].contains(r#""req_id":"orderbook.50.ETHUSDT""#));
    }

    #[test]
    fn acks_carry_topic() {
        let s = BybitPrivateStream::new(&config(None), InstrumentCatalog::new());
        assert_eq!(s.handle(r#"{"success":true,"ret_msg":"","op":"auth","conn_id":"c"}"#), Inbound::AuthOk);
        let reply = s.handle(r#"{"success":false,"ret_msg":"Invalid apikey","op":"auth"}"#);
        assert!(matches!(reply, Inbound::AuthFailed(_)));
        assert_eq!(
            s.handle(r#"{"success":true,"ret_msg":"","req_id":"order","op":"subscribe"}"#),
            Inbound::Subscribed(vec!["order".into()])
        );
        assert_eq!(s.handle(r#"{"op":"pong","args":["1"],"conn_id":"c"}"#), Inbound::Pong);
    }

    #[test]
    fn book_snapshot_then_delta() {
        let s = BybitPublicStream::new(&config(Some(2)), Category::Linear);
        let snap = r#"{"topic":"orderbook.50.BTCUSDT","type":"snapshot","ts":1,"data":{"s":"BTCUSDT","b":[["100","1"],["99","2"],["98","3"]],"a":[["101","1"]],"u":1}}"#;
        s.handle(snap);
        let delta = r#"{"topic":"orderbook.50.BTCUSDT","type":"delta","ts":2,"data":{"s":"BTCUSDT","b":[["100","0"]],"a":[["100.5","2"]],"u":2}}"#;
        let Inbound::Data(msgs) = s.handle(delta) else { panic!("expected data") };
        let Row::Book(book) = &msgs[0].rows[0] else { panic!("expected book") };
        assert_eq!(book.bids, vec![[99.0, 2.0], [98.0, 3.0]]);
        assert_eq!(book.asks, vec![[100.5, 2.0], [101.0, 1.0]]);

        s.reset();
        assert!(s.books.lock().is_empty());
    }

    #[test]
    fn private_execution_frame() {
        let s = BybitPrivateStream::new(&config(None), InstrumentCatalog::new());
        let frame = r#"{"topic":"execution","id":"1","creationTime":1,"data":[{"category":"linear","symbol":"BTCUSDT","execId":"e1","orderId":"o1","orderLinkId":"3.bot","side":"Buy","execQty":"0.01","execPrice":"60000","execFee":"0.36","feeCurrency":"USDT","execType":"Trade","execTime":"1700000000000","leavesQty":"0"}]}"#;
        let Inbound::Data(msgs) = s.handle(frame) else { panic!("expected data") };
        assert_eq!(msgs[0].action, Action::Insert);
        let Row::Execution(e) = &msgs[0].rows[0] else { panic!("expected execution") };
        assert_eq!(e.cl_ord_id.as_deref(), Some("3.bot"));
        assert_eq!(e.leaves_qty, Some(0.0));
    }
}
