//! Mexc contract API signing.
//!
//! `Signature = HEX(HMAC_SHA256(secret, api_key + request_time + params))`
//! where `params` is the query string sorted by key for GET and the raw JSON
//! body otherwise. The stream logs in with the same scheme and empty params.

use mx_core::time_util::now_ms;

use crate::auth::hmac_sha256_hex;
use crate::rest::{SignInput, Signer};

pub struct MexcSigner {
    pub api_key: String,
    pub api_secret: String,
}

impl MexcSigner {
    pub fn signature(&self, request_time: i64, params: &str) -> String {
        hmac_sha256_hex(&self.api_secret, &format!("{}{request_time}{params}", self.api_key))
    }
}

/// Query pairs in dictionary order.
fn sorted_query(query: &str) -> String {
    let mut pairs: Vec<&str> = query.split('&').filter(|p| !p.is_empty()).collect();
    pairs.sort_unstable();
    pairs.join("&")
}

impl Signer for MexcSigner {
    fn sign(&self, req: &SignInput<'_>) -> Vec<(String, String)> {
        let ts = now_ms();
        let params = if req.body.is_empty() { sorted_query(req.query) } else { req.body.to_string() };
        vec![
            ("ApiKey".into(), self.api_key.clone()),
            ("Request-Time".into(), ts.to_string()),
            ("Signature".into(), self.signature(ts, &params)),
        ]
    }
}

/// `login` frame for the contract stream.
pub fn ws_login_message(api_key: &str, api_secret: &str) -> String {
    let ts = now_ms();
    let signature = hmac_sha256_hex(api_secret, &format!("{api_key}{ts}"));
    serde_json::json!({
        "method": "login",
        "param": { "apiKey": api_key, "reqTime": ts.to_string(), "signature": signature },
    })
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::Method;

    #[test]
    fn get_signs_sorted_query() {
        let signer = MexcSigner { api_key: "key".into(), api_secret: "secret".into() };
        let expected = hmac_sha256_hex("secret", "key1700000000000page_num=1&symbol=BTC_USDT");
        assert_eq!(signer.signature(1_700_000_000_000, &sorted_query("symbol=BTC_USDT&page_num=1")), expected);
    }

    #[test]
    fn post_signs_body() {
        let signer = MexcSigner { api_key: "key".into(), api_secret: "secret".into() };
        let headers = signer.sign(&SignInput { method: &Method::POST, path: "/x", query: "", body: r#"{"a":1}"# });
        let ts: i64 = headers[1].1.parse().unwrap();
        assert_eq!(headers[2].1, signer.signature(ts, r#"{"a":1}"#));
        assert_eq!(headers[0], ("ApiKey".to_string(), "key".to_string()));
    }

    #[test]
    fn login_frame() {
        let v: serde_json::Value = serde_json::from_str(&ws_login_message("key", "secret")).unwrap();
        assert_eq!(v["method"], "login");
        assert_eq!(v["param"]["apiKey"], "key");
        assert_eq!(v["param"]["signature"].as_str().unwrap().len(), 64);
    }
}
