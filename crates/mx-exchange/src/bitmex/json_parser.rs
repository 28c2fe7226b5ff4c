//! Bitmex JSON parsing.
//!
//! REST responses and stream rows share one schema per table, so both paths
//! parse through the functions here. Quantities arrive in contracts and are
//! converted to unified units through the catalog; money fields arrive in the
//! settlement currency's smallest unit (`XBt` satoshi, `USDt` micro-dollar)
//! and are scaled back to whole units.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use mx_core::time_util::parse_iso;
use mx_core::{
    AccountKey, BookRow, Category, Exchange, ExecType, Execution, Expiry, Instrument, InstrumentCatalog,
    InstrumentState, Kline, MarginRow, OrderAck, OrderRow, OrderStatus, PositionRow, Side, SymbolKey, TickerRow,
    Timeframe,
};
use serde_json::Value;

use crate::json_util::{f64_field, parse_levels, str_field};

/// Smallest-unit divisor of a settlement currency.
pub fn currency_scale(currency: &str) -> f64 {
    match currency {
        "XBt" => 1e8,
        "USDt" | "LAMp" => 1e6,
        "Gwei" => 1e9,
        _ => 1.0,
    }
}

fn money(v: &Value, field: &str, currency: &str) -> Option<f64> {
    f64_field(v, field).map(|x| x / currency_scale(currency))
}

fn time_field(v: &Value, field: &str) -> Option<DateTime<Utc>> {
    v.get(field).and_then(Value::as_str).and_then(parse_iso)
}

pub fn key(v: &Value) -> Option<SymbolKey> {
    Some(SymbolKey::new(v.get("symbol")?.as_str()?, Exchange::Bitmex))
}

pub fn parse_ord_status(s: &str) -> Option<OrderStatus> {
    match s {
        "New" => Some(OrderStatus::New),
        "PartiallyFilled" => Some(OrderStatus::PartiallyFilled),
        "Filled" => Some(OrderStatus::Filled),
        "Canceled" => Some(OrderStatus::Canceled),
        "Rejected" => Some(OrderStatus::Rejected),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Instruments
// ---------------------------------------------------------------------------

/// Category from the instrument flags; `IFXXXP` is the spot type code.
fn category(v: &Value) -> Category {
    if v.get("isInverse").and_then(Value::as_bool).unwrap_or(false) {
        Category::Inverse
    } else if v.get("isQuanto").and_then(Value::as_bool).unwrap_or(false) {
        Category::Quanto
    } else if v.get("typ").and_then(Value::as_str) == Some("IFXXXP") {
        Category::Spot
    } else {
        Category::Linear
    }
}

/// Build a catalog record from one `/instrument` entry.
///
/// Linear contracts are sized in fractions of the underlying
/// (`underlyingToPositionMultiplier` contracts per coin); inverse and quanto
/// contracts are their own unit.
pub fn parse_instrument(v: &Value) -> Option<Instrument> {
    let key = key(v)?;
    let mut inst = Instrument::new(key);
    inst.category = category(v);
    inst.my_multiplier = match inst.category {
        Category::Linear | Category::Spot => f64_field(v, "underlyingToPositionMultiplier").unwrap_or(1.0),
        _ => 1.0,
    };
    let tick = f64_field(v, "tickSize")?;
    let lot = f64_field(v, "lotSize").unwrap_or(1.0);
    if !inst.set_increments(tick, lot / inst.my_multiplier, lot / inst.my_multiplier) {
        return None;
    }
    inst.multiplier = f64_field(v, "multiplier").unwrap_or(1.0);
    inst.settl_currency = str_field(v, "settlCurrency").unwrap_or_default();
    inst.quote_currency = str_field(v, "quoteCurrency").unwrap_or_default();
    inst.base_currency = str_field(v, "underlying").or_else(|| str_field(v, "rootSymbol")).unwrap_or_default();
    inst.expiry = match time_field(v, "expiry") {
        Some(t) => Expiry::At(t),
        None => Expiry::Perpetual,
    };
    inst.state = match v.get("state").and_then(Value::as_str) {
        Some("Open") | None => InstrumentState::Open,
        Some(_) => InstrumentState::Inactive,
    };
    inst.mark_price = f64_field(v, "markPrice").unwrap_or(0.0);
    Some(inst)
}

// ---------------------------------------------------------------------------
// Market data rows
// ---------------------------------------------------------------------------

/// `orderBook10` row.
pub fn parse_book(v: &Value) -> Option<BookRow> {
    Some(BookRow {
        key: key(v)?,
        bids: parse_levels(v.get("bids")),
        asks: parse_levels(v.get("asks")),
    })
}

/// `quote` row: top of book with sizes in contracts.
pub fn parse_quote(v: &Value, catalog: &InstrumentCatalog) -> Option<TickerRow> {
    let key = key(v)?;
    let level = |px: &str, sz: &str| {
        let price = f64_field(v, px)?;
        Some([price, catalog.unified_qty(&key, f64_field(v, sz).unwrap_or(0.0))])
    };
    Some(TickerRow {
        bid: level("bidPrice", "bidSize"),
        ask: level("askPrice", "askSize"),
        mark_price: None,
        key: Some(key),
    })
}

/// `instrument` row; only the mark price is live state.
pub fn parse_instrument_tick(v: &Value) -> Option<TickerRow> {
    let mark_price = f64_field(v, "markPrice")?;
    Some(TickerRow { key: Some(key(v)?), mark_price: Some(mark_price), ..Default::default() })
}

// ---------------------------------------------------------------------------
// Account rows
// ---------------------------------------------------------------------------

pub fn parse_position(v: &Value, catalog: &InstrumentCatalog) -> Option<PositionRow> {
    let key = key(v)?;
    let currency = str_field(v, "currency").unwrap_or_default();
    Some(PositionRow {
        qty: f64_field(v, "currentQty").map(|q| catalog.unified_qty(&key, q)),
        avg_entry_price: f64_field(v, "avgEntryPrice"),
        unrealized_pnl: money(v, "unrealisedPnl", &currency),
        margin_call_price: f64_field(v, "liquidationPrice"),
        key,
    })
}

/// `margin` row; `initMargin` is the margin held by open orders and
/// `maintMargin` the margin held by positions.
pub fn parse_margin(v: &Value) -> Option<MarginRow> {
    let currency = str_field(v, "currency")?;
    Some(MarginRow {
        wallet_balance: money(v, "walletBalance", &currency),
        margin_balance: money(v, "marginBalance", &currency),
        available_margin: money(v, "availableMargin", &currency),
        order_margin: money(v, "initMargin", &currency),
        position_margin: money(v, "maintMargin", &currency),
        unrealized_pnl: money(v, "unrealisedPnl", &currency),
        key: AccountKey::new(currency, Exchange::Bitmex),
    })
}

// ---------------------------------------------------------------------------
// Orders and executions
// ---------------------------------------------------------------------------

/// Order row; `update` rows carry only the changed columns.
pub fn parse_order(v: &Value, catalog: &InstrumentCatalog) -> Option<OrderRow> {
    let key = key(v)?;
    let qty = |field: &str| f64_field(v, field).map(|q| catalog.unified_qty(&key, q));
    let mut row = OrderRow::new(key.clone(), str_field(v, "orderID")?);
    row.cl_ord_id = str_field(v, "clOrdID").filter(|s| !s.is_empty());
    row.side = v.get("side").and_then(Value::as_str).and_then(Side::parse);
    row.price = f64_field(v, "price");
    row.leaves_qty = qty("leavesQty");
    row.orig_qty = qty("orderQty");
    row.status = v.get("ordStatus").and_then(Value::as_str).and_then(parse_ord_status);
    row.timestamp = time_field(v, "timestamp").or_else(|| time_field(v, "transactTime"));
    Some(row)
}

pub fn parse_ack(v: &Value, catalog: &InstrumentCatalog) -> Option<OrderAck> {
    let row = parse_order(v, catalog)?;
    Some(OrderAck {
        cl_ord_id: row.cl_ord_id.unwrap_or_default(),
        price: row.price.unwrap_or(0.0),
        leaves_qty: row.leaves_qty,
        timestamp: row.timestamp.unwrap_or_else(Utc::now),
        order_id: row.order_id,
    })
}

/// Execution record from the `execution` table or `/execution/tradeHistory`.
///
/// `New`, `Canceled` and `Replaced` records describe order lifecycle and are
/// skipped (`None`). Funding rows carry the position in `lastQty` and the
/// funding amount in `execComm`.
pub fn parse_execution(v: &Value, catalog: &InstrumentCatalog) -> Option<Execution> {
    let exec_type = match v.get("execType")?.as_str()? {
        "Trade" => ExecType::Trade,
        "Funding" => ExecType::Funding,
        "Settlement" => ExecType::Delivery,
        _ => return None,
    };
    let key = key(v)?;
    let currency = str_field(v, "settlCurrency").or_else(|| str_field(v, "currency")).unwrap_or_default();
    let side = v.get("side").and_then(Value::as_str).and_then(Side::parse).unwrap_or(Side::Buy);
    Some(Execution {
        exec_id: str_field(v, "execID")?,
        order_id: str_field(v, "orderID").unwrap_or_default(),
        cl_ord_id: str_field(v, "clOrdID").filter(|s| !s.is_empty()),
        side,
        qty: catalog.unified_qty(&key, f64_field(v, "lastQty").unwrap_or(0.0).abs()),
        price: f64_field(v, "lastPx").unwrap_or(0.0),
        fee: money(v, "execComm", &currency).unwrap_or(0.0),
        timestamp: time_field(v, "transactTime").or_else(|| time_field(v, "timestamp"))?,
        exec_type,
        leaves_qty: f64_field(v, "leavesQty").map(|q| catalog.unified_qty(&key, q)),
        account: str_field(v, "account").unwrap_or_default(),
        fee_currency: currency,
        key,
    })
}

/// `/trade/bucketed` row. Bitmex stamps buckets with their close time; the
/// returned kline carries the open time.
pub fn parse_bucket(v: &Value, timeframe: Timeframe) -> Option<Kline> {
    let close_time = time_field(v, "timestamp")?;
    Some(Kline {
        timestamp: close_time - ChronoDuration::minutes(timeframe.minutes()),
        open: f64_field(v, "open")?,
        high: f64_field(v, "high")?,
        low: f64_field(v, "low")?,
        close: f64_field(v, "close")?,
    })
}
