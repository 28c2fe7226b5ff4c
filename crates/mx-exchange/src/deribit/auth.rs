//! Deribit request signing.
//!
//! REST requests carry
//! `Authorization: deri-hmac-sha256 id=<key>,ts=<ms>,sig=<hex>,nonce=<nonce>`
//! where the signature covers `ts \n nonce \n METHOD \n URI \n BODY \n` and
//! the URI includes the query string. The stream authenticates with
//! `public/auth` using the `client_signature` grant over `ts \n nonce \n data`.

use mx_core::time_util::now_ms;
use uuid::Uuid;

use crate::auth::hmac_sha256_hex;
use crate::rest::{SignInput, Signer};

/// JSON-RPC id of the stream auth request.
pub const AUTH_ID: u64 = 1;

pub struct DeribitSigner {
    pub api_key: String,
    pub api_secret: String,
}

impl DeribitSigner {
    pub fn signature(&self, ts: i64, nonce: &str, method: &str, uri: &str, body: &str) -> String {
        hmac_sha256_hex(&self.api_secret, &format!("{ts}\n{nonce}\n{method}\n{uri}\n{body}\n"))
    }
}

fn nonce() -> String {
    Uuid::new_v4().simple().to_string()[..8].to_string()
}

impl Signer for DeribitSigner {
    fn sign(&self, req: &SignInput<'_>) -> Vec<(String, String)> {
        let ts = now_ms();
        let nonce = nonce();
        let uri = if req.query.is_empty() { req.path.to_string() } else { format!("{}?{}", req.path, req.query) };
        let sig = self.signature(ts, &nonce, req.method.as_str(), &uri, req.body);
        let value = format!("deri-hmac-sha256 id={},ts={ts},sig={sig},nonce={nonce}", self.api_key);
        vec![("Authorization".into(), value)]
    }
}

/// `public/auth` frame with the `client_signature` grant.
pub fn ws_auth_message(api_key: &str, api_secret: &str) -> String {
    let ts = now_ms();
    let nonce = nonce();
    let signature = hmac_sha256_hex(api_secret, &format!("{ts}\n{nonce}\n"));
    serde_json::json!({
        "jsonrpc": "2.0",
        "id": AUTH_ID,
        "method": "public/auth",
        "params": {
            "grant_type": "client_signature",
            "client_id": api_key,
            "timestamp": ts,
            "signature": signature,
            "nonce": nonce,
            "data": "",
        },
    })
    .to_string()
}
