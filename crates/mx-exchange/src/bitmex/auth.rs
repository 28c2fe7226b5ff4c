//! Bitmex request signing.
//!
//! REST: `api-signature = HEX(HMAC_SHA256(secret, verb + path + expires + body))`
//! where `path` includes the query string, sent with `api-expires` and
//! `api-key`. The stream authenticates with `authKeyExpires` over
//! `"GET/realtime" + expires`.

use mx_core::time_util::now_secs;

use crate::auth::hmac_sha256_hex;
use crate::rest::{SignInput, Signer};

/// Lifetime of a signature.
const EXPIRES_IN_SECS: i64 = 60;

pub struct BitmexSigner {
    pub api_key: String,
    pub api_secret: String,
}

impl BitmexSigner {
    pub fn signature(&self, verb: &str, path: &str, expires: i64, body: &str) -> String {
        hmac_sha256_hex(&self.api_secret, &format!("{verb}{path}{expires}{body}"))
    }
}

impl Signer for BitmexSigner {
    fn sign(&self, req: &SignInput<'_>) -> Vec<(String, String)> {
        let expires = now_secs() + EXPIRES_IN_SECS;
        let path = if req.query.is_empty() { req.path.to_string() } else { format!("{}?{}", req.path, req.query) };
        let signature = self.signature(req.method.as_str(), &path, expires, req.body);
        vec![
            ("api-expires".into(), expires.to_string()),
            ("api-key".into(), self.api_key.clone()),
            ("api-signature".into(), signature),
        ]
    }
}

/// `authKeyExpires` frame for the realtime stream.
pub fn ws_auth_message(api_key: &str, api_secret: &str) -> String {
    let expires = now_secs() + EXPIRES_IN_SECS;
    let signature = hmac_sha256_hex(api_secret, &format!("GET/realtime{expires}"));
    serde_json::json!({ "op": "authKeyExpires", "args": [api_key, expires, signature] }).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn documented_signature() {
        // Example from the Bitmex API key usage docs.
        let signer = BitmexSigner {
            api_key: "LAqUlngMIQkIUjXMUreyu3qn".into(),
            api_secret: "chNOOS4KvNXR_Xq4k4c9qsfoKWvnDecLATCRlcBwyKDYnWgO".into(),
        };
        let sig = signer.signature("GET", "/api/v1/instrument", 1518064236, "");
        assert_eq!(sig, "c7682d435d0cfe87c16098df34ef2eb5a549d4c5a3c2b1f0f77b8af73423bf00");
    }

    #[test]
    fn ws_auth_frame_shape() {
        let v: serde_json::Value = serde_json::from_str(&ws_auth_message("k", "s")).unwrap();
        assert_eq!(v["op"], "authKeyExpires");
        assert_eq!(v["args"][0], "k");
        assert_eq!(v["args"][2].as_str().unwrap().len(), 64);
    }
}
