//! Price and quantity rounding.
//!
//! Every price or quantity that reaches the display or an exchange goes
//! through here. All functions are idempotent: rounding an already rounded
//! value returns it unchanged.

/// Slack absorbing binary representation error when counting ticks.
const TICK_EPS: f64 = 1e-9;

/// Quantities at or below this are treated as zero (fully filled).
pub const QTY_EPS: f64 = 1e-9;

/// Direction of rounding onto the tick grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rounding {
    Down,
    Up,
    Nearest,
}

/// Number of decimal places implied by an increment (`0.5` → 1, `0.0001` → 4,
/// `25` → 0).
pub fn precision_of(increment: f64) -> u32 {
    if !(increment > 0.0) {
        return 0;
    }
    let mut places = 0u32;
    let mut scaled = increment;
    while places < 12 && (scaled - scaled.round()).abs() > TICK_EPS * scaled.abs().max(1.0) {
        scaled *= 10.0;
        places += 1;
    }
    places
}

/// Round to a fixed number of decimal places.
pub fn round_to(value: f64, places: u32) -> f64 {
    let factor = 10f64.powi(places as i32);
    (value * factor).round() / factor
}

/// Snap `price` onto the `tick` grid in the given direction.
pub fn round_price(price: f64, tick: f64, mode: Rounding) -> f64 {
    if !(tick > 0.0) {
        return price;
    }
    let ticks = price / tick;
    let snapped = match mode {
        Rounding::Down => (ticks + TICK_EPS).floor(),
        Rounding::Up => (ticks - TICK_EPS).ceil(),
        Rounding::Nearest => ticks.round(),
    };
    round_to(snapped * tick, precision_of(tick))
}

/// Snap `qty` onto the `step` grid toward zero.
pub fn round_qty(qty: f64, step: f64) -> f64 {
    if !(step > 0.0) {
        return qty;
    }
    let steps = (qty.abs() / step + TICK_EPS).floor();
    let rounded = round_to(steps * step, precision_of(step));
    if qty < 0.0 { -rounded } else { rounded }
}

/// Render a number without float noise, trimming trailing zeros.
pub fn format_decimal(value: f64, places: u32) -> String {
    let s = format!("{:.*}", places as usize, value);
    if s.contains('.') { s.trim_end_matches('0').trim_end_matches('.').to_string() } else { s }
}
