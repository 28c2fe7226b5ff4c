//! Bybit v5 JSON parsing, shared by REST and the private stream.
//!
//! Numbers arrive as strings, often empty. Quantities are in base coin
//! (linear, spot, option) or USD contracts (inverse), both of which are
//! already unified units.

use mx_core::time_util::parse_ms_value;
use mx_core::{
    AccountKey, Category, Exchange, ExecType, Execution, Expiry, Instrument, InstrumentCatalog, InstrumentState,
    Kline, MarginRow, OrderRow, OrderStatus, PositionRow, Side, SymbolKey, TickerRow,
};
use serde_json::Value;

use crate::json_util::{array_of, f64_field, parse_str_f64, str_field};

/// Bybit's `category` parameter; Bybit has no quanto contracts.
pub fn category_str(category: Category) -> Option<&'static str> {
    match category {
        Category::Linear => Some("linear"),
        Category::Inverse => Some("inverse"),
        Category::Spot => Some("spot"),
        Category::Option => Some("option"),
        Category::Quanto => None,
    }
}

pub fn parse_category(s: &str) -> Option<Category> {
    match s {
        "linear" => Some(Category::Linear),
        "inverse" => Some(Category::Inverse),
        "spot" => Some(Category::Spot),
        "option" => Some(Category::Option),
        _ => None,
    }
}

pub fn key(v: &Value) -> Option<SymbolKey> {
    Some(SymbolKey::new(v.get("symbol")?.as_str()?, Exchange::Bybit))
}

/// `New`, `PartiallyFilled`, `Filled`, `Cancelled`, `Rejected`, plus the
/// conditional-order states which count as open or cancelled.
pub fn parse_ord_status(s: &str) -> Option<OrderStatus> {
    match s {
        "New" | "Created" | "Untriggered" | "Triggered" => Some(OrderStatus::New),
        "PartiallyFilled" => Some(OrderStatus::PartiallyFilled),
        "Filled" => Some(OrderStatus::Filled),
        "Cancelled" | "PartiallyFilledCanceled" | "Deactivated" => Some(OrderStatus::Canceled),
        "Rejected" => Some(OrderStatus::Rejected),
        _ => None,
    }
}

fn side(v: &Value) -> Option<Side> {
    v.get("side").and_then(Value::as_str).and_then(Side::parse)
}

// ---------------------------------------------------------------------------
// Instruments
// ---------------------------------------------------------------------------

/// Build a catalog record from one `instruments-info` entry.
pub fn parse_instrument(v: &Value, category: Category) -> Option<Instrument> {
    let mut inst = Instrument::new(key(v)?);
    inst.category = category;
    let lot = v.get("lotSizeFilter")?;
    let tick = parse_str_f64(v.pointer("/priceFilter/tickSize"))?;
    let step = f64_field(lot, "qtyStep").or_else(|| f64_field(lot, "basePrecision"))?;
    if !inst.set_increments(tick, step, f64_field(lot, "minOrderQty").unwrap_or(step)) {
        return None;
    }
    inst.base_currency = str_field(v, "baseCoin").unwrap_or_default();
    inst.quote_currency = str_field(v, "quoteCoin").unwrap_or_default();
    inst.settl_currency = str_field(v, "settleCoin").unwrap_or_else(|| inst.quote_currency.clone());
    inst.expiry = match parse_ms_value(v.get("deliveryTime")) {
        Some(t) if t.timestamp_millis() > 0 => Expiry::At(t),
        _ => Expiry::Perpetual,
    };
    inst.state = match v.get("status").and_then(Value::as_str) {
        Some("Trading") | None => InstrumentState::Open,
        Some(_) => InstrumentState::Inactive,
    };
    Some(inst)
}

// ---------------------------------------------------------------------------
// Account
// ---------------------------------------------------------------------------

/// One account entry of `wallet-balance` or the `wallet` topic; one row
/// per coin.
pub fn parse_wallet(v: &Value) -> Vec<MarginRow> {
    array_of(v, "coin")
        .iter()
        .filter_map(|c| {
            Some(MarginRow {
                key: AccountKey::new(c.get("coin")?.as_str()?, Exchange::Bybit),
                wallet_balance: f64_field(c, "walletBalance"),
                margin_balance: f64_field(c, "equity"),
                available_margin: f64_field(c, "availableToWithdraw"),
                order_margin: f64_field(c, "totalOrderIM"),
                position_margin: f64_field(c, "totalPositionIM"),
                unrealized_pnl: f64_field(c, "unrealisedPnl"),
            })
        })
        .collect()
}

/// Position entry; `size` is unsigned with the direction in `side`.
pub fn parse_position(v: &Value) -> Option<PositionRow> {
    let size = f64_field(v, "size").unwrap_or(0.0);
    let signed = match side(v) {
        Some(s) => s.sign() * size,
        None => 0.0,
    };
    Some(PositionRow {
        key: key(v)?,
        qty: Some(signed),
        avg_entry_price: f64_field(v, "avgPrice").or_else(|| f64_field(v, "entryPrice")),
        unrealized_pnl: f64_field(v, "unrealisedPnl"),
        margin_call_price: f64_field(v, "liqPrice"),
    })
}

// ---------------------------------------------------------------------------
// Orders and executions
// ---------------------------------------------------------------------------

pub fn parse_order(v: &Value) -> Option<OrderRow> {
    let mut row = OrderRow::new(key(v)?, str_field(v, "orderId")?);
    row.cl_ord_id = str_field(v, "orderLinkId").filter(|s| !s.is_empty());
    row.side = side(v);
    row.price = f64_field(v, "price");
    row.leaves_qty = f64_field(v, "leavesQty");
    row.orig_qty = f64_field(v, "qty");
    row.status = v.get("orderStatus").and_then(Value::as_str).and_then(parse_ord_status);
    row.timestamp = parse_ms_value(v.get("updatedTime")).or_else(|| parse_ms_value(v.get("createdTime")));
    Some(row)
}

/// Execution entry from `execution/list` or the `execution` topic.
///
/// Spot fills without a `feeCurrency` are charged in the received coin:
/// base coin on buys, quote coin on sells.
pub fn parse_execution(v: &Value, category: Category, catalog: &InstrumentCatalog) -> Option<Execution> {
    let exec_type = match v.get("execType").and_then(Value::as_str)? {
        "Trade" | "BustTrade" | "AdlTrade" | "BlockTrade" => ExecType::Trade,
        "Funding" => ExecType::Funding,
        "Delivery" | "Settle" => ExecType::Delivery,
        _ => return None,
    };
    let key = key(v)?;
    let side = side(v).unwrap_or(Side::Buy);
    let fee_currency = match str_field(v, "feeCurrency").filter(|s| !s.is_empty()) {
        Some(c) => c,
        None => catalog
            .with(&key, |i| match (category, side) {
                (Category::Spot, Side::Buy) => i.base_currency.clone(),
                (Category::Spot, Side::Sell) => i.quote_currency.clone(),
                _ => i.settl_currency.clone(),
            })
            .unwrap_or_default(),
    };
    Some(Execution {
        exec_id: str_field(v, "execId")?,
        order_id: str_field(v, "orderId").unwrap_or_default(),
        cl_ord_id: str_field(v, "orderLinkId").filter(|s| !s.is_empty()),
        side,
        qty: f64_field(v, "execQty").unwrap_or(0.0).abs(),
        price: f64_field(v, "execPrice").unwrap_or(0.0),
        fee: f64_field(v, "execFee").unwrap_or(0.0),
        fee_currency,
        timestamp: parse_ms_value(v.get("execTime"))?,
        exec_type,
        leaves_qty: f64_field(v, "leavesQty"),
        account: String::new(),
        key,
    })
}

// ---------------------------------------------------------------------------
// Market data
// ---------------------------------------------------------------------------

/// `[start, open, high, low, close, volume, turnover]`.
pub fn parse_kline(v: &Value) -> Option<Kline> {
    let arr = v.as_array()?;
    Some(Kline {
        timestamp: parse_ms_value(arr.first())?,
        open: parse_str_f64(arr.get(1))?,
        high: parse_str_f64(arr.get(2))?,
        low: parse_str_f64(arr.get(3))?,
        close: parse_str_f64(arr.get(4))?,
    })
}

/// `tickers` topic data; deltas carry only changed fields.
pub fn parse_ticker(v: &Value) -> Option<TickerRow> {
    let level = |px: &str, sz: &str| Some([f64_field(v, px)?, f64_field(v, sz).unwrap_or(0.0)]);
    Some(TickerRow {
        key: Some(key(v)?),
        bid: level("bid1Price", "bid1Size"),
        ask: level("ask1Price", "ask1Size"),
        mark_price: f64_field(v, "markPrice"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn linear_and_spot_instruments() {
        let linear = parse_instrument(
            &json!({"symbol":"BTCUSDT","contractType":"LinearPerpetual","status":"Trading","baseCoin":"BTC","quoteCoin":"USDT","settleCoin":"USDT","deliveryTime":"0","priceFilter":{"tickSize":"0.10"},"lotSizeFilter":{"minOrderQty":"0.001","qtyStep":"0.001"}}),
            Category::Linear,
        )
        .unwrap();
        assert_eq!(linear.tick_size, 0.1);
        assert_eq!(linear.qty_precision, 3);
        assert_eq!(linear.expiry, Expiry::Perpetual);

        let spot = parse_instrument(
            &json!({"symbol":"BTCUSDT","baseCoin":"BTC","quoteCoin":"USDT","status":"Trading","lotSizeFilter":{"basePrecision":"0.000001","minOrderQty":"0.000048"},"priceFilter":{"tickSize":"0.01"}}),
            Category::Spot,
        )
        .unwrap();
        assert_eq!(spot.qty_step, 0.000001);
        assert_eq!(spot.min_order_qty, 0.000048);
        assert_eq!(spot.settl_currency, "USDT");
    }

    #[test]
    fn position_sign_from_side() {
        let p = parse_position(&json!({"symbol":"BTCUSDT","side":"Sell","size":"0.5","avgPrice":"60000","unrealisedPnl":"-3","liqPrice":""})).unwrap();
        assert_eq!(p.qty, Some(-0.5));
        assert_eq!(p.margin_call_price, None);
        let flat = parse_position(&json!({"symbol":"BTCUSDT","side":"","size":"0"})).unwrap();
        assert_eq!(flat.qty, Some(0.0));
    }

    #[test]
    fn spot_fee_currency_follows_side() {
        let catalog = InstrumentCatalog::new();
        let key = SymbolKey::new("ETHUSDT", Exchange::Bybit);
        catalog.upsert(&key, |i| {
            i.base_currency = "ETH".into();
            i.quote_currency = "USDT".into();
        });
        let mut v = json!({"symbol":"ETHUSDT","execId":"x1","orderId":"o","side":"Buy","execQty":"1","execPrice":"2000","execFee":"0.001","execType":"Trade","execTime":"1700000000000"});
        assert_eq!(parse_execution(&v, Category::Spot, &catalog).unwrap().fee_currency, "ETH");
        v["side"] = json!("Sell");
        assert_eq!(parse_execution(&v, Category::Spot, &catalog).unwrap().fee_currency, "USDT");
        v["feeCurrency"] = json!("BNB");
        assert_eq!(parse_execution(&v, Category::Spot, &catalog).unwrap().fee_currency, "BNB");
    }

    #[test]
    fn wallet_rows_per_coin() {
        let rows = parse_wallet(&json!({"accountType":"UNIFIED","coin":[
            {"coin":"USDT","walletBalance":"1000","equity":"1010","availableToWithdraw":"900","totalOrderIM":"5","totalPositionIM":"50","unrealisedPnl":"10"},
            {"coin":"BTC","walletBalance":"0.1","equity":"0.1","availableToWithdraw":"","totalOrderIM":"0","totalPositionIM":"0","unrealisedPnl":"0"}
        ]}));
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].margin_balance, Some(1010.0));
        assert_eq!(rows[1].available_margin, None);
    }

    #[test]
    fn cancelled_order_row() {
        let row = parse_order(&json!({"symbol":"BTCUSDT","orderId":"1","orderLinkId":"","side":"Buy","price":"100","qty":"1","leavesQty":"0","orderStatus":"Cancelled","updatedTime":"1700000000000"})).unwrap();
        assert_eq!(row.status, Some(OrderStatus::Canceled));
        assert_eq!(row.cl_ord_id, None);
    }
}
