//! Bybit v5 request signing.
//!
//! `X-BAPI-SIGN = HEX(HMAC_SHA256(secret, timestamp + api_key + recv_window + payload))`
//! where the payload is the query string for GET and the JSON body otherwise.

use mx_core::time_util::now_ms;

use crate::auth::hmac_sha256_hex;
use crate::rest::{SignInput, Signer};

pub const RECV_WINDOW: &str = "5000";

/// Lifetime of the stream auth signature.
const WS_EXPIRES_MS: i64 = 10_000;

pub struct BybitSigner {
    pub api_key: String,
    pub api_secret: String,
}

impl BybitSigner {
    pub fn signature(&self, timestamp: i64, payload: &str) -> String {
        hmac_sha256_hex(&self.api_secret, &format!("{timestamp}{}{RECV_WINDOW}{payload}", self.api_key))
    }
}

impl Signer for BybitSigner {
    fn sign(&self, req: &SignInput<'_>) -> Vec<(String, String)> {
        let ts = now_ms();
        let payload = if req.body.is_empty() { req.query } else { req.body };
        vec![
            ("X-BAPI-API-KEY".into(), self.api_key.clone()),
            ("X-BAPI-TIMESTAMP".into(), ts.to_string()),
            ("X-BAPI-RECV-WINDOW".into(), RECV_WINDOW.into()),
            ("X-BAPI-SIGN".into(), self.signature(ts, payload)),
        ]
    }
}

/// `auth` frame for the private stream.
pub fn ws_auth_message(api_key: &str, api_secret: &str) -> String {
    let expires = now_ms() + WS_EXPIRES_MS;
    let signature = hmac_sha256_hex(api_secret, &format!("GET/realtime{expires}"));
    serde_json::json!({ "op": "auth", "args": [api_key, expires, signature] }).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signs_timestamp_key_window_payload() {
        let signer = BybitSigner { api_key: "key".into(), api_secret: "secret".into() };
        let expected = hmac_sha256_hex("secret", "1700000000000key5000category=linear");
        assert_eq!(signer.signature(1_700_000_000_000, "category=linear"), expected);
    }

    #[test]
    fn get_signs_query_post_signs_body() {
        let signer = BybitSigner { api_key: "key".into(), api_secret: "secret".into() };
        let method = reqwest::Method::POST;
        let headers = signer.sign(&SignInput { method: &method, path: "/v5/order/create", query: "", body: "{}" });
        let ts: i64 = headers[1].1.parse().unwrap();
        assert_eq!(headers[3].1, signer.signature(ts, "{}"));
    }
}
