//! Mexc contract JSON parsing.
//!
//! Volumes are contracts (`vol`); one contract is `contractSize` base coin.
//! The unified unit is the base coin, converted through the catalog.
//! Sides are numeric: 1 open long, 2 close short, 3 open short, 4 close long.

use chrono::{DateTime, Utc};
use mx_core::time_util::parse_ms_value;
use mx_core::{
    AccountKey, BookRow, Category, Exchange, ExecType, Execution, Instrument, InstrumentCatalog, InstrumentState, Kline,
    MarginRow, OrderAck, OrderRow, OrderStatus, PositionRow, Side, SymbolKey, TickerRow,
};
use serde_json::Value;

use crate::json_util::{array_of, f64_field, i64_field, parse_levels, str_field};

/// Wire value of a one-way order side.
pub fn side_code(side: Side) -> u8 {
    match side {
        Side::Buy => 1,
        Side::Sell => 3,
    }
}

pub fn parse_side(code: i64) -> Option<Side> {
    match code {
        1 | 2 => Some(Side::Buy),
        3 | 4 => Some(Side::Sell),
        _ => None,
    }
}

/// 1 pending, 2 open, 3 filled, 4 cancelled, 5 invalid.
pub fn parse_state(code: i64) -> Option<OrderStatus> {
    match code {
        1 | 2 => Some(OrderStatus::New),
        3 => Some(OrderStatus::Filled),
        4 => Some(OrderStatus::Canceled),
        5 => Some(OrderStatus::Rejected),
        _ => None,
    }
}

pub fn key(v: &Value) -> Option<SymbolKey> {
    Some(SymbolKey::new(v.get("symbol")?.as_str()?, Exchange::Mexc))
}

// ---------------------------------------------------------------------------
// Instruments
// ---------------------------------------------------------------------------

/// One `contract/detail` entry.
pub fn parse_instrument(v: &Value) -> Option<Instrument> {
    let mut inst = Instrument::new(key(v)?);
    inst.category = Category::Linear;
    let contract_size = f64_field(v, "contractSize").filter(|c| *c > 0.0)?;
    let step = contract_size * f64_field(v, "volUnit").unwrap_or(1.0);
    let min = contract_size * f64_field(v, "minVol").unwrap_or(1.0);
    if !inst.set_increments(f64_field(v, "priceUnit")?, step, min) {
        return None;
    }
    inst.multiplier = contract_size;
    inst.my_multiplier = 1.0 / contract_size;
    inst.base_currency = str_field(v, "baseCoin").unwrap_or_default();
    inst.quote_currency = str_field(v, "quoteCoin").unwrap_or_default();
    inst.settl_currency = str_field(v, "settleCoin").unwrap_or_else(|| inst.quote_currency.clone());
    inst.state = match i64_field(v, "state") {
        Some(0) | None => InstrumentState::Open,
        Some(_) => InstrumentState::Inactive,
    };
    Some(inst)
}

// ---------------------------------------------------------------------------
// Account
// ---------------------------------------------------------------------------

/// `account/assets` entry or `push.personal.asset` data.
pub fn parse_asset(v: &Value) -> Option<MarginRow> {
    let unrealized = f64_field(v, "unrealized");
    Some(MarginRow {
        key: AccountKey::new(v.get("currency")?.as_str()?, Exchange::Mexc),
        wallet_balance: f64_field(v, "cashBalance"),
        margin_balance: f64_field(v, "equity"),
        available_margin: f64_field(v, "availableBalance"),
        order_margin: f64_field(v, "frozenBalance"),
        position_margin: f64_field(v, "positionMargin"),
        unrealized_pnl: unrealized,
    })
}

/// Open position; `positionType` 1 is long, 2 short. A closed position
/// (`state` 3) reports zero.
pub fn parse_position(v: &Value, catalog: &InstrumentCatalog) -> Option<PositionRow> {
    let key = key(v)?;
    let vol = f64_field(v, "holdVol").unwrap_or(0.0);
    let sign = match i64_field(v, "positionType") {
        Some(2) => -1.0,
        _ => 1.0,
    };
    let closed = i64_field(v, "state") == Some(3);
    let qty = if closed { 0.0 } else { sign * catalog.unified_qty(&key, vol) };
    Some(PositionRow {
        qty: Some(qty),
        avg_entry_price: f64_field(v, "holdAvgPrice").or_else(|| f64_field(v, "openAvgPrice")),
        unrealized_pnl: None,
        margin_call_price: f64_field(v, "liquidatePrice"),
        key,
    })
}

// ---------------------------------------------------------------------------
// Orders and deals
// ---------------------------------------------------------------------------

pub fn parse_order(v: &Value, catalog: &InstrumentCatalog) -> Option<OrderRow> {
    let key = key(v)?;
    let vol = f64_field(v, "vol");
    let dealt = f64_field(v, "dealVol").unwrap_or(0.0);
    let mut row = OrderRow::new(key.clone(), str_field(v, "orderId")?);
    row.cl_ord_id = str_field(v, "externalOid").filter(|s| !s.is_empty());
    row.side = i64_field(v, "side").and_then(parse_side);
    row.price = f64_field(v, "price");
    row.orig_qty = vol.map(|q| catalog.unified_qty(&key, q));
    row.leaves_qty = vol.map(|q| catalog.unified_qty(&key, (q - dealt).max(0.0)));
    row.status = i64_field(v, "state").and_then(parse_state);
    row.timestamp = parse_ms_value(v.get("updateTime")).or_else(|| parse_ms_value(v.get("createTime")));
    Some(row)
}

/// Deal from `order/list/order_deals` or `push.personal.order.deal`.
pub fn parse_deal(v: &Value, catalog: &InstrumentCatalog) -> Option<Execution> {
    let key = key(v)?;
    Some(Execution {
        exec_id: str_field(v, "id")?,
        order_id: str_field(v, "orderId").unwrap_or_default(),
        cl_ord_id: str_field(v, "externalOid").filter(|s| !s.is_empty()),
        side: parse_side(i64_field(v, "side")?)?,
        qty: catalog.unified_qty(&key, f64_field(v, "vol").unwrap_or(0.0)),
        price: f64_field(v, "price").unwrap_or(0.0),
        fee: f64_field(v, "fee").unwrap_or(0.0),
        fee_currency: str_field(v, "feeCurrency").unwrap_or_default(),
        timestamp: parse_ms_value(v.get("timestamp"))?,
        exec_type: ExecType::Trade,
        leaves_qty: None,
        account: String::new(),
        key,
    })
}

/// `position/funding_records` entry. `funding` is signed as received, so
/// the fee is its negation.
pub fn parse_funding(v: &Value, catalog: &InstrumentCatalog) -> Option<Execution> {
    let key = key(v)?;
    let side = match i64_field(v, "positionType") {
        Some(2) => Side::Sell,
        _ => Side::Buy,
    };
    let settl_currency = catalog.with(&key, |i| i.settl_currency.clone()).unwrap_or_default();
    Some(Execution {
        exec_id: format!("funding-{}", str_field(v, "id")?),
        order_id: String::new(),
        cl_ord_id: None,
        side,
        qty: f64_field(v, "positionValue").unwrap_or(0.0),
        price: f64_field(v, "rate").unwrap_or(0.0),
        fee: -f64_field(v, "funding").unwrap_or(0.0),
        fee_currency: settl_currency,
        timestamp: parse_ms_value(v.get("settleTime"))?,
        exec_type: ExecType::Funding,
        leaves_qty: None,
        account: String::new(),
        key,
    })
}

/// Ack built from a submit response (order id) and the request.
pub fn submit_ack(data: &Value, cl_ord_id: &str, price: f64, leaves_qty: f64) -> Option<OrderAck> {
    let order_id = match data {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        other => str_field(other, "orderId")?,
    };
    Some(OrderAck {
        order_id,
        cl_ord_id: cl_ord_id.to_string(),
        price,
        leaves_qty: Some(leaves_qty),
        timestamp: Utc::now(),
    })
}

// ---------------------------------------------------------------------------
// Market data
// ---------------------------------------------------------------------------

/// `push.depth.full`: the whole top of book; levels are `[price, vol, count]`.
pub fn parse_depth(symbol: &str, data: &Value, catalog: &InstrumentCatalog) -> BookRow {
    let key = SymbolKey::new(symbol, Exchange::Mexc);
    let unify = |levels: Vec<[f64; 2]>| levels.into_iter().map(|[p, v]| [p, catalog.unified_qty(&key, v)]).collect();
    BookRow { bids: unify(parse_levels(data.get("bids"))), asks: unify(parse_levels(data.get("asks"))), key }
}

/// `push.ticker`; only the fair (mark) price is used.
pub fn parse_ticker(v: &Value) -> Option<TickerRow> {
    Some(TickerRow { key: Some(key(v)?), mark_price: Some(f64_field(v, "fairPrice")?), ..Default::default() })
}

/// `contract/kline` columns (`time` in seconds) to bars.
pub fn parse_klines(v: &Value) -> Vec<Kline> {
    let column = |name: &str| array_of(v, name).iter().map(Value::as_f64).collect::<Vec<_>>();
    let (open, high, low, close) = (column("open"), column("high"), column("low"), column("close"));
    array_of(v, "time")
        .iter()
        .enumerate()
        .filter_map(|(i, t)| {
            Some(Kline {
                timestamp: DateTime::from_timestamp(t.as_i64()?, 0)?,
                open: (*open.get(i)?)?,
                high: (*high.get(i)?)?,
                low: (*low.get(i)?)?,
                close: (*close.get(i)?)?,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn contract() -> Value {
        json!({
            "symbol": "BTC_USDT", "baseCoin": "BTC", "quoteCoin": "USDT", "settleCoin": "USDT",
            "contractSize": 0.0001, "minVol": 1, "volUnit": 1, "priceUnit": 0.1, "state": 0
        })
    }

    fn catalog() -> InstrumentCatalog {
        let catalog = InstrumentCatalog::new();
        catalog.insert(parse_instrument(&contract()).unwrap());
        catalog
    }

    #[test]
    fn contract_size_drives_units() {
        let inst = parse_instrument(&contract()).unwrap();
        assert_eq!(inst.qty_step, 0.0001);
        assert_eq!(inst.qty_precision, 4);
        assert!((inst.my_multiplier - 10_000.0).abs() < 1e-6);
        assert_eq!(inst.to_native_qty(0.05), 500.0);
    }

    #[test]
    fn order_sides_and_states() {
        let v = json!({
            "orderId": 123, "symbol": "BTC_USDT", "price": 50000.0, "vol": 500, "dealVol": 100,
            "side": 3, "state": 2, "externalOid": "4.bot", "updateTime": 1_700_000_000_000i64
        });
        let row = parse_order(&v, &catalog()).unwrap();
        assert_eq!(row.order_id, "123");
        assert_eq!(row.side, Some(Side::Sell));
        assert_eq!(row.status, Some(OrderStatus::New));
        assert_eq!(row.leaves_qty, Some(0.04));
        assert_eq!(parse_side(2), Some(Side::Buy));
        assert_eq!(side_code(Side::Sell), 3);
    }

    #[test]
    fn short_position_is_negative() {
        let v = json!({"symbol": "BTC_USDT", "holdVol": 300, "positionType": 2, "holdAvgPrice": 50000.0, "state": 1});
        assert_eq!(parse_position(&v, &catalog()).unwrap().qty, Some(-0.03));
        let closed = json!({"symbol": "BTC_USDT", "holdVol": 300, "positionType": 1, "state": 3});
        assert_eq!(parse_position(&closed, &catalog()).unwrap().qty, Some(0.0));
    }

    #[test]
    fn kline_columns_in_seconds() {
        let v = json!({"time": [1_700_000_000], "open": [1.0], "high": [2.0], "low": [0.5], "close": [1.5]});
        let bars = parse_klines(&v);
        assert_eq!(bars[0].timestamp.timestamp(), 1_700_000_000);
        assert_eq!(bars[0].high, 2.0);
    }

    #[test]
    fn submit_ack_accepts_bare_id() {
        let ack = submit_ack(&json!("7788"), "5.bot", 100.0, 0.5).unwrap();
        assert_eq!(ack.order_id, "7788");
        assert_eq!(submit_ack(&json!(7788), "5.bot", 100.0, 0.5).unwrap().order_id, "7788");
    }
}
