//! Retrying REST client shared by all adapters.
//!
//! A request is described once (`method`, `path`, query pairs, optional JSON
//! body) and re-signed on every attempt, since every supported exchange puts
//! a timestamp into its signature. Responses go through
//! [`classify::check_response`]; a RETRY-classified failure is re-attempted up
//! to `max_retries` times with a fixed delay, anything else returns at once.

use std::sync::Arc;
use std::time::Duration;

use mx_core::config::MarketConfig;
use mx_core::error::{ExResult, ExchangeError};
use mx_core::rate_limit::RateLimiter;
use mx_core::{ErrorKind, Exchange};
use reqwest::Method;
use serde_json::Value;
use tracing::{debug, warn};

use crate::auth;
use crate::classify;

/// Per-request HTTP timeout.
const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// What a signer sees of a request.
pub struct SignInput<'a> {
    pub method: &'a Method,
    /// Path without host, e.g. `/api/v1/order`.
    pub path: &'a str,
    /// Encoded query string without `?`, possibly empty.
    pub query: &'a str,
    /// Serialized JSON body, empty for bodiless requests.
    pub body: &'a str,
}

/// Exchange-specific request signing: returns the auth headers.
pub trait Signer: Send + Sync {
    fn sign(&self, req: &SignInput<'_>) -> Vec<(String, String)>;
}

/// HTTP client bound to one exchange's REST base URL.
pub struct RestClient {
    http: reqwest::Client,
    exchange: Exchange,
    base_url: String,
    signer: Box<dyn Signer>,
    max_retries: u32,
    retry_delay: Duration,
    limiter: Option<Arc<RateLimiter>>,
}

impl RestClient {
    pub fn new(config: &MarketConfig, signer: Box<dyn Signer>) -> Self {
        let http = reqwest::Client::builder().timeout(HTTP_TIMEOUT).build().unwrap_or_else(|_| reqwest::Client::new());
        Self {
            http,
            exchange: config.exchange,
            base_url: config.http_url().trim_end_matches('/').to_string(),
            signer,
            max_retries: config.max_retries.max(1),
            retry_delay: config.retry_delay(),
            limiter: None,
        }
    }

    /// Meter every attempt through a shared limiter.
    pub fn with_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn get(&self, path: &str, query: &[(&str, String)], signed: bool) -> ExResult<Value> {
        self.request(Method::GET, path, query, None, signed).await
    }

    pub async fn post(&self, path: &str, body: &Value) -> ExResult<Value> {
        self.request(Method::POST, path, &[], Some(body), true).await
    }

    pub async fn put(&self, path: &str, body: &Value) -> ExResult<Value> {
        self.request(Method::PUT, path, &[], Some(body), true).await
    }

    pub async fn delete(&self, path: &str, body: &Value) -> ExResult<Value> {
        self.request(Method::DELETE, path, &[], Some(body), true).await
    }

    /// Send with retries; returns the unwrapped payload.
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<&Value>,
        signed: bool,
    ) -> ExResult<Value> {
        let query = auth::build_query(query);
        let body = body.map(Value::to_string).unwrap_or_default();
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.send_once(&method, path, &query, &body, signed).await {
                Err(e) if e.kind == ErrorKind::Retry && attempt < self.max_retries => {
                    warn!(
                        "[{}] {method} {path} attempt {attempt}/{} failed: {}, retrying",
                        self.exchange, self.max_retries, e.message
                    );
                    tokio::time::sleep(self.retry_delay).await;
                }
                result => return result,
            }
        }
    }

    async fn send_once(&self, method: &Method, path: &str, query: &str, body: &str, signed: bool) -> ExResult<Value> {
        if let Some(limiter) = &self.limiter {
            limiter.acquire().await;
        }
        let url = if query.is_empty() {
            format!("{}{path}", self.base_url)
        } else {
            format!("{}{path}?{query}", self.base_url)
        };
        debug!("[{}] {method} {url}", self.exchange);

        let mut req = self.http.request(method.clone(), &url).header("Accept", "application/json");
        if signed {
            for (k, v) in self.signer.sign(&SignInput { method, path, query, body }) {
                req = req.header(k, v);
            }
        }
        if !body.is_empty() {
            req = req.header("Content-Type", "application/json").body(body.to_string());
        }

        let resp = req.send().await.map_err(|e| self.transport_error(e))?;
        let status = resp.status().as_u16();
        let text = resp.text().await.map_err(|e| self.transport_error(e))?;
        let value = serde_json::from_str::<Value>(&text).unwrap_or(Value::String(text));
        classify::check_response(self.exchange, status, value)
    }

    fn transport_error(&self, e: reqwest::Error) -> ExchangeError {
        ExchangeError::new(classify::classify_transport(&e), format!("[{}] transport: {e}", self.exchange))
    }
}
