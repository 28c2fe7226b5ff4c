//! Mexc contract stream.
//!
//! One connection. After `login` the account channels are pushed without an
//! explicit subscription; a `personal.filter` request is sent so the
//! handshake has an ack to wait on. Market data needs `sub.*` requests whose
//! acks (`rs.sub.depth.full`, `rs.sub.ticker`) do not name the symbol, so
//! they are matched to the requests in the order those were sent.
//!
//! | Channel                      | Row       | Scope      |
//! |------------------------------|-----------|------------|
//! | `push.personal.order`        | orders    | account    |
//! | `push.personal.order.deal`   | fills     | account    |
//! | `push.personal.position`     | positions | account    |
//! | `push.personal.asset`        | balances  | account    |
//! | `push.depth.full`            | book      | per symbol |
//! | `push.ticker`                | mark      | per symbol |

use std::collections::VecDeque;
use std::time::Duration;

use mx_core::config::MarketConfig;
use mx_core::ws::{Heartbeat, Inbound, StreamProtocol};
use mx_core::{Action, DepthMode, InstrumentCatalog, Row, StreamMessage};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tracing::{debug, warn};

use super::auth::ws_login_message;
use super::json_parser as parser;

const FILTER_TOPIC: &str = "personal.filter";
const PING: &str = r#"{"method":"ping"}"#;
const PING_EVERY: Duration = Duration::from_secs(5);
const LIVENESS: Duration = Duration::from_secs(12);

/// Depth limits Mexc accepts on `sub.depth.full`.
const DEPTH_LIMITS: [usize; 3] = [5, 10, 20];

pub struct MexcStream {
    url: String,
    credentials: Option<(String, String)>,
    symbols: Vec<String>,
    depth: DepthMode,
    catalog: InstrumentCatalog,
    /// Sent market subscriptions awaiting their ack, oldest first.
    pending: Mutex<VecDeque<String>>,
}

impl MexcStream {
    pub fn new(config: &MarketConfig, catalog: InstrumentCatalog) -> Self {
        Self {
            url: config.ws_url(),
            credentials: config.has_credentials().then(|| (config.api_key.clone(), config.api_secret.clone())),
            symbols: config.symbols.iter().map(|s| s.ticker.clone()).collect(),
            depth: config.depth(),
            catalog,
            pending: Mutex::new(VecDeque::new()),
        }
    }

    fn depth_limit(&self) -> usize {
        let levels = self.depth.levels();
        DEPTH_LIMITS.iter().copied().find(|l| *l >= levels).unwrap_or(20)
    }

    /// Resolve an ack for `method` to the oldest pending topic it can confirm.
    fn match_ack(&self, method: &str) -> Inbound {
        let mut pending = self.pending.lock();
        let prefix = format!("{method}:");
        match pending.iter().position(|t| t.starts_with(&prefix)) {
            Some(idx) => match pending.remove(idx) {
                Some(topic) => Inbound::Subscribed(vec![topic]),
                None => Inbound::Ignore,
            },
            None => {
                debug!("[mexc] unmatched ack for {method}");
                Inbound::Ignore
            }
        }
    }

    fn parse_push(&self, channel: &str, v: &Value) -> Inbound {
        let Some(data) = v.get("data") else {
            return Inbound::Ignore;
        };
        let message = match channel {
            "push.depth.full" => v
                .get("symbol")
                .and_then(Value::as_str)
                .map(|s| StreamMessage::single(Action::Update, Row::Book(parser::parse_depth(s, data, &self.catalog)))),
            "push.ticker" => parser::parse_ticker(data).map(|t| StreamMessage::single(Action::Update, Row::Ticker(t))),
            "push.personal.order" => {
                parser::parse_order(data, &self.catalog).map(|o| StreamMessage::single(Action::Insert, Row::Order(o)))
            }
            "push.personal.order.deal" => parser::parse_deal(data, &self.catalog)
                .map(|e| StreamMessage::single(Action::Insert, Row::Execution(e))),
            "push.personal.position" => parser::parse_position(data, &self.catalog)
                .map(|p| StreamMessage::single(Action::Update, Row::Position(p))),
            "push.personal.asset" => {
                parser::parse_asset(data).map(|m| StreamMessage::single(Action::Update, Row::Margin(m)))
            }
            other => {
                debug!("[mexc] ignoring {other}");
                None
            }
        };
        match message {
            Some(m) => Inbound::Data(vec![m]),
            None => Inbound::Ignore,
        }
    }
}

impl StreamProtocol for MexcStream {
    fn label(&self) -> String {
        "mexc".into()
    }

    fn url(&self) -> String {
        self.url.clone()
    }

    fn auth_message(&self) -> Option<String> {
        self.credentials.as_ref().map(|(key, secret)| ws_login_message(key, secret))
    }

    fn subscribe_messages(&self) -> Vec<String> {
        if self.credentials.is_none() {
            return Vec::new();
        }
        vec![json!({ "method": FILTER_TOPIC, "param": { "filters": [] } }).to_string()]
    }

    fn required_topics(&self) -> Vec<String> {
        if self.credentials.is_none() {
            return Vec::new();
        }
        vec![FILTER_TOPIC.to_string()]
    }

    fn symbol_subscribe_messages(&self) -> Vec<String> {
        let limit = self.depth_limit();
        let mut pending = self.pending.lock();
        let mut out = Vec::with_capacity(self.symbols.len() * 2);
        for symbol in &self.symbols {
            out.push(json!({ "method": "sub.depth.full", "param": { "symbol": symbol, "limit": limit } }).to_string());
            pending.push_back(format!("depth.full:{symbol}"));
            out.push(json!({ "method": "sub.ticker", "param": { "symbol": symbol } }).to_string());
            pending.push_back(format!("ticker:{symbol}"));
        }
        out
    }

    fn symbol_topics(&self) -> Vec<String> {
        self.symbols.iter().flat_map(|s| [format!("depth.full:{s}"), format!("ticker:{s}")]).collect()
    }

    fn heartbeat(&self) -> Heartbeat {
        Heartbeat { ping: Some((PING_EVERY, PING.into())), liveness: LIVENESS }
    }

    fn handle(&self, text: &str) -> Inbound {
        let Ok(v) = serde_json::from_str::<Value>(text) else {
            return Inbound::Ignore;
        };
        let Some(channel) = v.get("channel").and_then(Value::as_str) else {
            return Inbound::Ignore;
        };
        let data_str = v.get("data").and_then(Value::as_str).unwrap_or_default();
        match channel {
            "pong" => Inbound::Pong,
            "rs.login" if data_str == "success" => Inbound::AuthOk,
            "rs.login" => Inbound::AuthFailed(v.get("data").map(Value::to_string).unwrap_or_default()),
            "rs.personal.filter" => Inbound::Subscribed(vec![FILTER_TOPIC.to_string()]),
            "rs.error" => {
                warn!("[mexc] error frame: {text}");
                Inbound::Error(data_str.to_string())
            }
            c if c.starts_with("rs.sub.") => {
                if data_str == "success" {
                    self.match_ack(c.trim_start_matches("rs.sub."))
                } else {
                    let reason = v.get("data").map(Value::to_string).unwrap_or_default();
                    Inbound::SubscribeFailed(format!("{c}: {reason}"))
                }
            }
            c if c.starts_with("push.") => self.parse_push(c, &v),
            _ => Inbound::Ignore,
        }
    }

    fn reset(&self) {
        self.pending.lock().clear();
    }
}
