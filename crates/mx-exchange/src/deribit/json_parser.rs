//! Deribit JSON parsing, shared by REST results and stream notifications.
//!
//! Amounts are exchange-native: USD for inverse futures, base coin for
//! linear futures and options. Inverse quantities are unified to contracts
//! through the catalog.

use chrono::{DateTime, Utc};
use mx_core::time_util::parse_ms_value;
use mx_core::{
    AccountKey, BookRow, Category, Exchange, ExecType, Execution, Expiry, Instrument, InstrumentCatalog,
    InstrumentState, Kline, MarginRow, OrderAck, OrderRow, OrderStatus, PositionRow, Side, SymbolKey, TickerRow,
};
use serde_json::Value;

use crate::json_util::{array_of, f64_field, i64_field, parse_levels, str_field};

pub fn key(v: &Value) -> Option<SymbolKey> {
    Some(SymbolKey::new(v.get("instrument_name")?.as_str()?, Exchange::Deribit))
}

fn direction(v: &Value) -> Option<Side> {
    v.get("direction").and_then(Value::as_str).and_then(Side::parse)
}

pub fn parse_order_state(s: &str) -> Option<OrderStatus> {
    match s {
        "open" | "untriggered" => Some(OrderStatus::New),
        "filled" => Some(OrderStatus::Filled),
        "cancelled" => Some(OrderStatus::Canceled),
        "rejected" => Some(OrderStatus::Rejected),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Instruments
// ---------------------------------------------------------------------------

/// `kind` plus `instrument_type` (`reversed` or `linear`) to a category.
pub fn parse_category(v: &Value) -> Option<Category> {
    match v.get("kind").and_then(Value::as_str)? {
        "option" => Some(Category::Option),
        "spot" => Some(Category::Spot),
        "future" => match v.get("instrument_type").and_then(Value::as_str) {
            Some("reversed") => Some(Category::Inverse),
            _ => Some(Category::Linear),
        },
        _ => None,
    }
}

/// One `get_instruments` entry.
///
/// Inverse futures trade USD amounts in multiples of `contract_size`; the
/// unified unit is one contract, so `my_multiplier` is the contract size.
pub fn parse_instrument(v: &Value) -> Option<Instrument> {
    let mut inst = Instrument::new(key(v)?);
    inst.category = parse_category(v)?;
    let contract_size = f64_field(v, "contract_size").unwrap_or(1.0);
    let min_amount = f64_field(v, "min_trade_amount")?;
    inst.multiplier = contract_size;
    inst.my_multiplier = match inst.category {
        Category::Inverse if contract_size > 0.0 => contract_size,
        _ => 1.0,
    };
    let step = min_amount / inst.my_multiplier;
    if !inst.set_increments(f64_field(v, "tick_size")?, step, step) {
        return None;
    }
    inst.base_currency = str_field(v, "base_currency").unwrap_or_default();
    inst.quote_currency = str_field(v, "quote_currency").unwrap_or_default();
    inst.settl_currency = str_field(v, "settlement_currency").unwrap_or_else(|| inst.base_currency.clone());
    inst.expiry = match v.get("settlement_period").and_then(Value::as_str) {
        Some("perpetual") => Expiry::Perpetual,
        _ => parse_ms_value(v.get("expiration_timestamp")).map(Expiry::At).unwrap_or(Expiry::Perpetual),
    };
    inst.state = match v.get("is_active").and_then(Value::as_bool) {
        Some(false) => InstrumentState::Inactive,
        _ => InstrumentState::Open,
    };
    Some(inst)
}

// ---------------------------------------------------------------------------
// Account
// ---------------------------------------------------------------------------

/// One account summary (REST) or `user.portfolio` notification.
pub fn parse_portfolio(v: &Value) -> Option<MarginRow> {
    let currency = v.get("currency")?.as_str()?.to_ascii_uppercase();
    Some(MarginRow {
        key: AccountKey::new(currency, Exchange::Deribit),
        wallet_balance: f64_field(v, "balance"),
        margin_balance: f64_field(v, "equity").or_else(|| f64_field(v, "margin_balance")),
        available_margin: f64_field(v, "available_funds"),
        order_margin: f64_field(v, "initial_margin"),
        position_margin: f64_field(v, "maintenance_margin"),
        unrealized_pnl: f64_field(v, "session_upl").or_else(|| f64_field(v, "futures_session_upl")),
    })
}

/// Position entry; `size` is signed and native.
pub fn parse_position(v: &Value, catalog: &InstrumentCatalog) -> Option<PositionRow> {
    let key = key(v)?;
    let size = f64_field(v, "size").unwrap_or(0.0);
    Some(PositionRow {
        qty: Some(catalog.unified_qty(&key, size)),
        avg_entry_price: f64_field(v, "average_price"),
        unrealized_pnl: f64_field(v, "floating_profit_loss"),
        margin_call_price: f64_field(v, "estimated_liquidation_price"),
        key,
    })
}

// ---------------------------------------------------------------------------
// Orders and trades
// ---------------------------------------------------------------------------

pub fn parse_order(v: &Value, catalog: &InstrumentCatalog) -> Option<OrderRow> {
    let key = key(v)?;
    let amount = f64_field(v, "amount");
    let filled = f64_field(v, "filled_amount").unwrap_or(0.0);
    let mut row = OrderRow::new(key.clone(), str_field(v, "order_id")?);
    row.cl_ord_id = str_field(v, "label").filter(|s| !s.is_empty());
    row.side = direction(v);
    row.price = f64_field(v, "price");
    row.orig_qty = amount.map(|a| catalog.unified_qty(&key, a));
    row.leaves_qty = amount.map(|a| catalog.unified_qty(&key, (a - filled).max(0.0)));
    row.status = v.get("order_state").and_then(Value::as_str).and_then(parse_order_state);
    row.timestamp =
        parse_ms_value(v.get("last_update_timestamp")).or_else(|| parse_ms_value(v.get("creation_timestamp")));
    Some(row)
}

/// `result.order` of `buy`, `sell` and `edit`.
pub fn parse_ack(v: &Value, catalog: &InstrumentCatalog) -> Option<OrderAck> {
    let row = parse_order(v.get("order").unwrap_or(v), catalog)?;
    Some(OrderAck {
        cl_ord_id: row.cl_ord_id.unwrap_or_default(),
        price: row.price?,
        leaves_qty: row.leaves_qty,
        timestamp: row.timestamp.unwrap_or_else(Utc::now),
        order_id: row.order_id,
    })
}

/// User trade from the history endpoints or the `user.trades` channel.
pub fn parse_trade(v: &Value, catalog: &InstrumentCatalog) -> Option<Execution> {
    let key = key(v)?;
    let amount = f64_field(v, "amount").unwrap_or(0.0).abs();
    Some(Execution {
        exec_id: str_field(v, "trade_id")?,
        order_id: str_field(v, "order_id").unwrap_or_default(),
        cl_ord_id: str_field(v, "label").filter(|s| !s.is_empty()),
        side: direction(v)?,
        qty: catalog.unified_qty(&key, amount),
        price: f64_field(v, "price").unwrap_or(0.0),
        fee: f64_field(v, "fee").unwrap_or(0.0),
        fee_currency: str_field(v, "fee_currency").unwrap_or_default().to_ascii_uppercase(),
        timestamp: parse_ms_value(v.get("timestamp"))?,
        exec_type: ExecType::Trade,
        leaves_qty: None,
        account: String::new(),
        key,
    })
}

/// Transaction log entry of type `settlement` (perpetual funding) or
/// `delivery`. Funding is reported as a fee: positive when paid.
pub fn parse_transaction(v: &Value, catalog: &InstrumentCatalog) -> Option<Execution> {
    let exec_type = match v.get("type").and_then(Value::as_str)? {
        "settlement" => ExecType::Funding,
        "delivery" => ExecType::Delivery,
        _ => return None,
    };
    let key = key(v)?;
    let position = f64_field(v, "position").unwrap_or(0.0);
    let paid = match exec_type {
        ExecType::Funding => -f64_field(v, "interest_pl").unwrap_or(0.0),
        _ => -f64_field(v, "cashflow").unwrap_or(0.0),
    };
    Some(Execution {
        exec_id: str_field(v, "id")?,
        order_id: String::new(),
        cl_ord_id: None,
        side: Side::from_signed(position),
        qty: catalog.unified_qty(&key, position.abs()),
        price: f64_field(v, "index_price").or_else(|| f64_field(v, "price")).unwrap_or(0.0),
        fee: paid,
        fee_currency: str_field(v, "currency").unwrap_or_default().to_ascii_uppercase(),
        timestamp: parse_ms_value(v.get("timestamp"))?,
        exec_type,
        leaves_qty: None,
        account: i64_field(v, "user_id").map(|id| id.to_string()).unwrap_or_default(),
        key,
    })
}

// ---------------------------------------------------------------------------
// Market data
// ---------------------------------------------------------------------------

/// `book.<sym>.none.<depth>.100ms`: a full snapshot of the top levels.
pub fn parse_book(v: &Value, catalog: &InstrumentCatalog) -> Option<BookRow> {
    let key = key(v)?;
    let unify = |levels: Vec<[f64; 2]>| levels.into_iter().map(|[p, a]| [p, catalog.unified_qty(&key, a)]).collect();
    Some(BookRow { bids: unify(parse_levels(v.get("bids"))), asks: unify(parse_levels(v.get("asks"))), key })
}

/// `quote.<sym>`: best bid and ask.
pub fn parse_quote(v: &Value, catalog: &InstrumentCatalog) -> Option<TickerRow> {
    let key = key(v)?;
    let level = |px: &str, amt: &str| {
        let price = f64_field(v, px).filter(|p| *p > 0.0)?;
        Some([price, catalog.unified_qty(&key, f64_field(v, amt).unwrap_or(0.0))])
    };
    Some(TickerRow {
        bid: level("best_bid_price", "best_bid_amount"),
        ask: level("best_ask_price", "best_ask_amount"),
        mark_price: None,
        key: Some(key),
    })
}

/// `ticker.<sym>.100ms`; only the mark price is used.
pub fn parse_ticker(v: &Value) -> Option<TickerRow> {
    Some(TickerRow { key: Some(key(v)?), mark_price: Some(f64_field(v, "mark_price")?), ..Default::default() })
}

/// `get_tradingview_chart_data` columns to bars.
pub fn parse_chart(v: &Value) -> Vec<Kline> {
    let column = |name: &str| array_of(v, name).iter().map(Value::as_f64).collect::<Vec<_>>();
    let ticks: Vec<Option<i64>> = array_of(v, "ticks").iter().map(Value::as_i64).collect();
    let (open, high, low, close) = (column("open"), column("high"), column("low"), column("close"));
    ticks
        .iter()
        .enumerate()
        .filter_map(|(i, tick)| {
            Some(Kline {
                timestamp: DateTime::from_timestamp_millis((*tick)?)?,
                open: (*open.get(i)?)?,
                high: (*high.get(i)?)?,
                low: (*low.get(i)?)?,
                close: (*close.get(i)?)?,
            })
        })
        .collect()
}
