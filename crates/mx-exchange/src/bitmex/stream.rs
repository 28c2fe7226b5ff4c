//! Bitmex realtime stream.
//!
//! One connection carries everything. Frames are `{"table", "action",
//! "data"}` where the action is `partial`, `insert`, `update` or `delete`,
//! which maps one-to-one onto the unified [`Action`].
//!
//! | Topic               | Row      | Scope      |
//! |---------------------|----------|------------|
//! | `execution`         | fills    | account    |
//! | `order`             | orders   | account    |
//! | `position`          | position | account    |
//! | `margin`            | balances | account    |
//! | `orderBook10:<sym>` | book     | per symbol |
//! | `quote:<sym>`       | ticker   | per symbol |
//! | `instrument:<sym>`  | mark     | per symbol |
//!
//! Private tables are subscribed during the handshake; per-symbol topics
//! once the account state is loaded. Keep-alive is a text `ping`.

use std::time::Duration;

use mx_core::config::MarketConfig;
use mx_core::ws::{Heartbeat, Inbound, StreamProtocol};
use mx_core::{Action, DepthMode, InstrumentCatalog, Row, StreamMessage};
use serde_json::Value;
use tracing::warn;

use super::auth::ws_auth_message;
use super::json_parser as parser;
use crate::json_util::array_of;

const PRIVATE_TABLES: [&str; 4] = ["execution", "order", "position", "margin"];
const PING_EVERY: Duration = Duration::from_secs(5);
const LIVENESS: Duration = Duration::from_secs(10);

pub struct BitmexStream {
    url: String,
    credentials: Option<(String, String)>,
    symbols: Vec<String>,
    depth: DepthMode,
    catalog: InstrumentCatalog,
}

impl BitmexStream {
    pub fn new(config: &MarketConfig, catalog: InstrumentCatalog) -> Self {
        Self {
            url: config.ws_url(),
            credentials: config.has_credentials().then(|| (config.api_key.clone(), config.api_secret.clone())),
            symbols: config.symbols.iter().map(|s| s.ticker.clone()).collect(),
            depth: config.depth(),
            catalog,
        }
    }

    fn subscribe(args: &[String]) -> String {
        serde_json::json!({ "op": "subscribe", "args": args }).to_string()
    }

    fn parse_table(&self, table: &str, v: &Value) -> Inbound {
        let Some(action) = v.get("action").and_then(Value::as_str).and_then(Action::parse) else {
            return Inbound::Ignore;
        };
        let data = array_of(v, "data");
        let rows: Vec<Row> = match table {
            "orderBook10" => data.iter().filter_map(parser::parse_book).map(Row::Book).collect(),
            "quote" => data.iter().filter_map(|r| parser::parse_quote(r, &self.catalog)).map(Row::Ticker).collect(),
            "instrument" => data.iter().filter_map(parser::parse_instrument_tick).map(Row::Ticker).collect(),
            "position" => {
                data.iter().filter_map(|r| parser::parse_position(r, &self.catalog)).map(Row::Position).collect()
            }
            "margin" => data.iter().filter_map(parser::parse_margin).map(Row::Margin).collect(),
            "order" => data.iter().filter_map(|r| parser::parse_order(r, &self.catalog)).map(Row::Order).collect(),
            "execution" => {
                data.iter().filter_map(|r| parser::parse_execution(r, &self.catalog)).map(Row::Execution).collect()
            }
            other => {
                warn!("[bitmex] unexpected table {other}");
                return Inbound::Ignore;
            }
        };
        if rows.is_empty() { Inbound::Ignore } else { Inbound::Data(vec![StreamMessage::new(action, rows)]) }
    }
}

impl StreamProtocol for BitmexStream {
    fn label(&self) -> String {
        "bitmex".into()
    }

    fn url(&self) -> String {
        self.url.clone()
    }

    fn auth_message(&self) -> Option<String> {
        self.credentials.as_ref().map(|(key, secret)| ws_auth_message(key, secret))
    }

    fn subscribe_messages(&self) -> Vec<String> {
        let topics = self.required_topics();
        if topics.is_empty() { Vec::new() } else { vec![Self::subscribe(&topics)] }
    }

    fn required_topics(&self) -> Vec<String> {
        if self.credentials.is_none() {
            return Vec::new();
        }
        PRIVATE_TABLES.iter().map(|t| t.to_string()).collect()
    }

    fn symbol_subscribe_messages(&self) -> Vec<String> {
        vec![Self::subscribe(&self.symbol_topics())]
    }

    fn symbol_topics(&self) -> Vec<String> {
        let book = match self.depth {
            DepthMode::Quote => "quote",
            DepthMode::Book(_) => "orderBook10",
        };
        self.symbols.iter().flat_map(|s| [format!("{book}:{s}"), format!("instrument:{s}")]).collect()
    }

    fn heartbeat(&self) -> Heartbeat {
        Heartbeat { ping: Some((PING_EVERY, "ping".into())), liveness: LIVENESS }
    }

    fn handle(&self, text: &str) -> Inbound {
        if text == "pong" {
            return Inbound::Pong;
        }
        let Ok(v) = serde_json::from_str::<Value>(text) else {
            return Inbound::Ignore;
        };
        if let Some(table) = v.get("table").and_then(Value::as_str) {
            return self.parse_table(table, &v);
        }
        let op = v.pointer("/request/op").and_then(Value::as_str);
        if let Some(err) = v.get("error").and_then(Value::as_str) {
            return match op {
                Some("authKeyExpires") => Inbound::AuthFailed(err.to_string()),
                Some("subscribe") => Inbound::SubscribeFailed(err.to_string()),
                _ => Inbound::Error(err.to_string()),
            };
        }
        if v.get("success").and_then(Value::as_bool) == Some(true) {
            if let Some(topic) = v.get("subscribe").and_then(Value::as_str) {
                return Inbound::Subscribed(vec![topic.to_string()]);
            }
            if op == Some("authKeyExpires") {
                return Inbound::AuthOk;
            }
        }
        Inbound::Ignore
    }
}
