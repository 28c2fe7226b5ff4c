//! Error classification.
//!
//! Maps every exchange-native failure (HTTP status, error code, error text,
//! transport error) onto the five-value [`ErrorKind`] taxonomy. The tables
//! are pure data; anything not listed is FATAL, so an unexpected failure
//! reloads the market instead of passing for success.
//!
//! | Exchange | Keyed by                 |
//! |----------|--------------------------|
//! | Bitmex   | error message text       |
//! | Bybit    | `retCode`                |
//! | Deribit  | JSON-RPC `error.code`    |
//! | Mexc     | `code`                   |

use mx_core::error::{ExResult, ExchangeError};
use mx_core::{ErrorKind, Exchange};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Tables
// ---------------------------------------------------------------------------

/// Bitmex: substring of `error.message` → kind. Checked in order.
const BITMEX_MESSAGES: &[(&str, ErrorKind)] = &[
    ("Invalid API Key", ErrorKind::Cancel),
    ("Signature not valid", ErrorKind::Cancel),
    ("This key is disabled", ErrorKind::Cancel),
    ("Access Denied", ErrorKind::Cancel),
    ("api-expires", ErrorKind::Retry),
    ("The system is currently overloaded", ErrorKind::Retry),
    ("Rate limit exceeded", ErrorKind::Retry),
    ("Service unavailable", ErrorKind::Retry),
    ("insufficient Available Balance", ErrorKind::Block),
    ("Account is suspended", ErrorKind::Block),
    ("Account has been disabled", ErrorKind::Block),
    ("Invalid ordStatus", ErrorKind::Ignore),
    ("Invalid orderID", ErrorKind::Ignore),
    ("Not Found", ErrorKind::Ignore),
    ("Unable to cancel order", ErrorKind::Ignore),
    ("Duplicate clOrdID", ErrorKind::Ignore),
    ("Invalid orderQty", ErrorKind::Ignore),
    ("Invalid price", ErrorKind::Ignore),
    ("Amended price", ErrorKind::Ignore),
    ("Executing at order price would lead to immediate liquidation", ErrorKind::Ignore),
];

/// Bybit v5 `retCode` → kind.
const BYBIT_CODES: &[(i64, ErrorKind)] = &[
    (10001, ErrorKind::Ignore),  // parameter error
    (10002, ErrorKind::Retry),   // request expired, clock drift
    (10003, ErrorKind::Cancel),  // invalid api key
    (10004, ErrorKind::Cancel),  // signature error
    (10005, ErrorKind::Cancel),  // permission denied
    (10006, ErrorKind::Retry),   // too many visits
    (10010, ErrorKind::Cancel),  // unmatched IP
    (10016, ErrorKind::Retry),   // server error
    (10018, ErrorKind::Retry),   // IP rate limit
    (10027, ErrorKind::Block),   // trading banned
    (33004, ErrorKind::Cancel),  // api key expired
    (34040, ErrorKind::Ignore),  // not modified
    (110001, ErrorKind::Ignore), // order does not exist
    (110003, ErrorKind::Ignore), // price out of range
    (110004, ErrorKind::Block),  // insufficient wallet balance
    (110007, ErrorKind::Block),  // insufficient available balance
    (110012, ErrorKind::Block),  // insufficient available balance
    (110017, ErrorKind::Ignore), // reduce-only rejected
    (110072, ErrorKind::Ignore), // duplicate orderLinkId
    (170131, ErrorKind::Block),  // spot: insufficient balance
    (170213, ErrorKind::Ignore), // spot: order does not exist
];

/// Deribit JSON-RPC `error.code` → kind.
const DERIBIT_CODES: &[(i64, ErrorKind)] = &[
    (-32602, ErrorKind::Ignore), // invalid params
    (10004, ErrorKind::Ignore),  // order_not_found
    (10009, ErrorKind::Block),   // not_enough_funds
    (10010, ErrorKind::Ignore),  // already_closed
    (10011, ErrorKind::Ignore),  // price_too_low
    (10028, ErrorKind::Retry),   // too_many_requests
    (10040, ErrorKind::Retry),   // retry
    (10041, ErrorKind::Retry),   // settlement_in_progress
    (10043, ErrorKind::Ignore),  // price_wrong_tick
    (11029, ErrorKind::Ignore),  // invalid_arguments
    (11044, ErrorKind::Ignore),  // not_open_order
    (11050, ErrorKind::Ignore),  // bad_request
    (13004, ErrorKind::Cancel),  // invalid_credentials
    (13009, ErrorKind::Cancel),  // unauthorized
    (13021, ErrorKind::Cancel),  // forbidden
    (13025, ErrorKind::Block),   // locked_by_admin
    (13028, ErrorKind::Retry),   // temporarily_unavailable
    (13888, ErrorKind::Retry),   // timed_out
];

/// Mexc contract `code` → kind.
const MEXC_CODES: &[(i64, ErrorKind)] = &[
    (401, ErrorKind::Cancel),  // unauthorized
    (402, ErrorKind::Cancel),  // api key expired
    (406, ErrorKind::Cancel),  // IP not whitelisted
    (500, ErrorKind::Retry),   // internal error
    (501, ErrorKind::Retry),   // system busy
    (510, ErrorKind::Retry),   // excessive frequency
    (600, ErrorKind::Ignore),  // parameter error
    (602, ErrorKind::Cancel),  // signature verification failed
    (1002, ErrorKind::Block),  // contract not activated
    (2005, ErrorKind::Block),  // insufficient balance
    (2009, ErrorKind::Ignore), // position does not exist
    (2011, ErrorKind::Ignore), // order quantity error
    (2015, ErrorKind::Ignore), // price out of range
    (2040, ErrorKind::Ignore), // order does not exist
    (2041, ErrorKind::Ignore), // order already closed
];

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

fn lookup(table: &[(i64, ErrorKind)], code: i64) -> Option<ErrorKind> {
    table.iter().find(|(c, _)| *c == code).map(|(_, k)| *k)
}

/// Classify a native error code. Bitmex has no codes and goes through
/// [`classify_message`].
pub fn classify_code(exchange: Exchange, code: i64) -> ErrorKind {
    let table = match exchange {
        Exchange::Bybit => BYBIT_CODES,
        Exchange::Deribit => DERIBIT_CODES,
        Exchange::Mexc => MEXC_CODES,
        Exchange::Bitmex => {
            return u16::try_from(code).ok().and_then(classify_status).unwrap_or(ErrorKind::Fatal);
        }
    };
    lookup(table, code).unwrap_or(ErrorKind::Fatal)
}

/// Classify by error text (Bitmex).
pub fn classify_message(message: &str) -> ErrorKind {
    BITMEX_MESSAGES.iter().find(|(needle, _)| message.contains(needle)).map(|(_, k)| *k).unwrap_or(ErrorKind::Fatal)
}

/// HTTP status classes that mean the same everywhere.
pub fn classify_status(status: u16) -> Option<ErrorKind> {
    match status {
        401 | 403 => Some(ErrorKind::Cancel),
        404 => Some(ErrorKind::Ignore),
        408 | 429 | 502 | 503 | 504 => Some(ErrorKind::Retry),
        _ => None,
    }
}

/// Classify a transport failure.
pub fn classify_transport(err: &reqwest::Error) -> ErrorKind {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        ErrorKind::Retry
    } else if err.is_builder() {
        ErrorKind::Cancel
    } else {
        ErrorKind::Fatal
    }
}

/// Validate a decoded response and unwrap its payload.
///
/// Returns the exchange's payload field (`result` for Bybit and Deribit,
/// `data` for Mexc, the whole body for Bitmex) or a classified error.
pub fn check_response(exchange: Exchange, status: u16, body: Value) -> ExResult<Value> {
    let ok_status = (200..300).contains(&status);
    match exchange {
        Exchange::Bitmex => {
            let message = body.get("error").map(|e| {
                let msg = e.get("message").and_then(Value::as_str).unwrap_or_default();
                let name = e.get("name").and_then(Value::as_str).unwrap_or_default();
                format!("{name}: {msg}")
            });
            match (ok_status, message) {
                (true, None) => Ok(body),
                (_, Some(msg)) => {
                    let kind = match classify_message(&msg) {
                        ErrorKind::Fatal => classify_status(status).unwrap_or(ErrorKind::Fatal),
                        kind => kind,
                    };
                    Err(ExchangeError::new(kind, format!("[bitmex] HTTP {status} {msg}")))
                }
                (false, None) => Err(status_error(exchange, status, &body)),
            }
        }
        Exchange::Bybit => {
            if !ok_status {
                return Err(status_error(exchange, status, &body));
            }
            let code = body.get("retCode").and_then(Value::as_i64).unwrap_or(-1);
            if code != 0 {
                let msg = body.get("retMsg").and_then(Value::as_str).unwrap_or_default();
                return Err(ExchangeError::new(classify_code(exchange, code), format!("[bybit] retCode {code}: {msg}")));
            }
            Ok(body.get("result").cloned().unwrap_or(Value::Null))
        }
        Exchange::Deribit => {
            if let Some(err) = body.get("error") {
                let code = err.get("code").and_then(Value::as_i64).unwrap_or(-1);
                let msg = err.get("message").and_then(Value::as_str).unwrap_or_default();
                let reason = err.get("data").and_then(|d| d.get("reason")).and_then(Value::as_str).unwrap_or_default();
                return Err(ExchangeError::new(
                    classify_code(exchange, code),
                    format!("[deribit] error {code}: {msg} {reason}").trim_end().to_string(),
                ));
            }
            if !ok_status {
                return Err(status_error(exchange, status, &body));
            }
            Ok(body.get("result").cloned().unwrap_or(Value::Null))
        }
        Exchange::Mexc => {
            if !ok_status {
                return Err(status_error(exchange, status, &body));
            }
            if body.get("success").and_then(Value::as_bool) == Some(false) {
                let code = body.get("code").and_then(Value::as_i64).unwrap_or(-1);
                let msg = body.get("message").and_then(Value::as_str).unwrap_or_default();
                return Err(ExchangeError::new(classify_code(exchange, code), format!("[mexc] code {code}: {msg}")));
            }
            Ok(body.get("data").cloned().unwrap_or(Value::Null))
        }
    }
}

fn status_error(exchange: Exchange, status: u16, body: &Value) -> ExchangeError {
    let kind = classify_status(status).unwrap_or(if status >= 500 { ErrorKind::Retry } else { ErrorKind::Fatal });
    ExchangeError::new(kind, format!("[{exchange}] HTTP {status}: {body}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn every_listed_code_is_classified() {
        let tables = [(Exchange::Bybit, BYBIT_CODES), (Exchange::Deribit, DERIBIT_CODES), (Exchange::Mexc, MEXC_CODES)];
        for (exchange, table) in tables {
            for (code, kind) in table {
                assert_eq!(classify_code(exchange, *code), *kind, "{exchange} {code}");
            }
        }
        for (needle, kind) in BITMEX_MESSAGES {
            assert_eq!(classify_message(&format!("HTTPError: {needle} (x)")), *kind);
        }
    }

    #[test]
    fn unknown_errors_are_fatal() {
        for exchange in [Exchange::Bybit, Exchange::Deribit, Exchange::Mexc] {
            assert_eq!(classify_code(exchange, 987_654), ErrorKind::Fatal);
        }
        assert_eq!(classify_message("something new"), ErrorKind::Fatal);
    }

    #[test]
    fn bybit_envelope() {
        let ok = json!({"retCode": 0, "retMsg": "OK", "result": {"list": []}});
        assert_eq!(check_response(Exchange::Bybit, 200, ok).unwrap(), json!({"list": []}));

        let bad = json!({"retCode": 110007, "retMsg": "ab not enough for new order"});
        let err = check_response(Exchange::Bybit, 200, bad).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Block);
    }

    #[test]
    fn bitmex_message_then_status() {
        let body = json!({"error": {"message": "Signature not valid.", "name": "HTTPError"}});
        assert_eq!(check_response(Exchange::Bitmex, 401, body).unwrap_err().kind, ErrorKind::Cancel);

        let body = json!({"error": {"message": "Some brand new failure", "name": "HTTPError"}});
        assert_eq!(check_response(Exchange::Bitmex, 503, body).unwrap_err().kind, ErrorKind::Retry);

        let body = json!([{"orderID": "x"}]);
        assert!(check_response(Exchange::Bitmex, 200, body).is_ok());
    }

    #[test]
    fn deribit_and_mexc_envelopes() {
        let body = json!({"jsonrpc": "2.0", "error": {"code": 10009, "message": "not_enough_funds"}});
        assert_eq!(check_response(Exchange::Deribit, 400, body).unwrap_err().kind, ErrorKind::Block);
        let body = json!({"jsonrpc": "2.0", "result": [1, 2]});
        assert_eq!(check_response(Exchange::Deribit, 200, body).unwrap(), json!([1, 2]));

        let body = json!({"success": false, "code": 602, "message": "Signature verification failed"});
        assert_eq!(check_response(Exchange::Mexc, 200, body).unwrap_err().kind, ErrorKind::Cancel);
        let body = json!({"success": true, "code": 0, "data": "123"});
        assert_eq!(check_response(Exchange::Mexc, 200, body).unwrap(), json!("123"));
    }

    #[test]
    fn server_errors_retry() {
        assert_eq!(check_response(Exchange::Mexc, 502, json!(null)).unwrap_err().kind, ErrorKind::Retry);
        assert_eq!(check_response(Exchange::Bybit, 500, json!(null)).unwrap_err().kind, ErrorKind::Retry);
        assert_eq!(check_response(Exchange::Bybit, 418, json!(null)).unwrap_err().kind, ErrorKind::Fatal);
    }
}
