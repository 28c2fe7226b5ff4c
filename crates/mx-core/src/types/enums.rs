//! Enumerations used throughout the terminal core.
//!
//! Every exchange speaks its own vocabulary for sides, categories, and
//! intervals; these enums are the unified side of that translation. The
//! per-exchange spelling lives next to the enum (`Timeframe::bybit_interval`
//! and friends) so adapters never hand-roll string tables.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::MxError;

// ---------------------------------------------------------------------------
// Exchange identifiers
// ---------------------------------------------------------------------------

/// Supported cryptocurrency exchanges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Exchange {
    Bitmex,
    Bybit,
    Deribit,
    Mexc,
}

impl Exchange {
    pub const ALL: [Exchange; 4] = [Self::Bitmex, Self::Bybit, Self::Deribit, Self::Mexc];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Bitmex => "bitmex",
            Self::Bybit => "bybit",
            Self::Deribit => "deribit",
            Self::Mexc => "mexc",
        }
    }
}

impl fmt::Display for Exchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Exchange {
    type Err = MxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "bitmex" => Ok(Self::Bitmex),
            "bybit" => Ok(Self::Bybit),
            "deribit" => Ok(Self::Deribit),
            "mexc" => Ok(Self::Mexc),
            other => Err(MxError::Config(format!("unknown exchange '{other}'"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Instrument metadata
// ---------------------------------------------------------------------------

/// Instrument category; decides how price and quantity translate into value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    #[default]
    Linear,
    Inverse,
    Quanto,
    Spot,
    Option,
}

impl Category {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Linear => "linear",
            Self::Inverse => "inverse",
            Self::Quanto => "quanto",
            Self::Spot => "spot",
            Self::Option => "option",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Trading state reported by the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum InstrumentState {
    #[default]
    Open,
    Inactive,
}

/// Depth of the book kept per instrument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum DepthMode {
    /// Best bid/ask only.
    #[default]
    Quote,
    /// N price levels per side.
    Book(usize),
}

impl DepthMode {
    pub fn from_depth(depth: Option<usize>) -> Self {
        match depth {
            Some(n) if n > 1 => Self::Book(n),
            _ => Self::Quote,
        }
    }

    pub fn levels(self) -> usize {
        match self {
            Self::Quote => 1,
            Self::Book(n) => n,
        }
    }
}

// ---------------------------------------------------------------------------
// Order / trading enums
// ---------------------------------------------------------------------------

/// Buy or sell direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// Side encoded in a signed quantity: positive buys, negative sells.
    pub fn from_signed(qty: f64) -> Self {
        if qty < 0.0 { Self::Sell } else { Self::Buy }
    }

    /// `+1.0` for buys, `-1.0` for sells.
    pub fn sign(self) -> f64 {
        match self {
            Self::Buy => 1.0,
            Self::Sell => -1.0,
        }
    }

    /// Parse the many spellings exchanges use (`Buy`, `buy`, `BUY`).
    pub fn parse(s: &str) -> Option<Self> {
        if s.eq_ignore_ascii_case("buy") {
            Some(Self::Buy)
        } else if s.eq_ignore_ascii_case("sell") {
            Some(Self::Sell)
        } else {
            None
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Buy => "Buy",
            Self::Sell => "Sell",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Order status, unified across all exchanges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
}

impl OrderStatus {
    /// Filled, cancelled and rejected orders leave the ledger.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Filled | Self::Canceled | Self::Rejected)
    }
}

/// Kind of an execution record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExecType {
    Trade,
    Funding,
    Delivery,
}

// ---------------------------------------------------------------------------
// Error taxonomy
// ---------------------------------------------------------------------------

/// The uniform five-value error taxonomy every exchange failure is mapped to.
///
/// Higher layers never see exchange-native codes, only these values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Transient; re-attempt the same request.
    Retry,
    /// Cosmetic or non-critical; log only.
    Ignore,
    /// Trading disabled for this exchange, feed stays live.
    Block,
    /// Bootstrap of this exchange aborts, no retry.
    Cancel,
    /// This exchange reloads from scratch.
    Fatal,
}

impl ErrorKind {
    /// Rank used when concurrent stages report different kinds.
    /// `Cancel` dominates everything.
    pub fn precedence(self) -> u8 {
        match self {
            Self::Ignore => 0,
            Self::Retry => 1,
            Self::Block => 2,
            Self::Fatal => 3,
            Self::Cancel => 4,
        }
    }

    /// Keep the dominant of two kinds.
    pub fn merge(self, other: ErrorKind) -> ErrorKind {
        if other.precedence() > self.precedence() { other } else { self }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Retry => "RETRY",
            Self::Ignore => "IGNORE",
            Self::Block => "BLOCK",
            Self::Cancel => "CANCEL",
            Self::Fatal => "FATAL",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Timeframes
// ---------------------------------------------------------------------------

/// Kline interval shared by all exchanges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Timeframe {
    #[serde(rename = "1m")]
    M1,
    #[serde(rename = "5m")]
    M5,
    #[serde(rename = "1h")]
    H1,
    #[serde(rename = "1d")]
    D1,
}

impl Timeframe {
    pub fn minutes(self) -> i64 {
        match self {
            Self::M1 => 1,
            Self::M5 => 5,
            Self::H1 => 60,
            Self::D1 => 1440,
        }
    }

    pub fn duration(self) -> Duration {
        Duration::from_secs(self.minutes() as u64 * 60)
    }

    pub fn millis(self) -> i64 {
        self.minutes() * 60_000
    }

    /// Open time (ms) of the bar containing `ts_ms`.
    pub fn floor_ms(self, ts_ms: i64) -> i64 {
        ts_ms - ts_ms.rem_euclid(self.millis())
    }

    /// Bitmex `binSize`.
    pub fn bitmex_bin(self) -> &'static str {
        match self {
            Self::M1 => "1m",
            Self::M5 => "5m",
            Self::H1 => "1h",
            Self::D1 => "1d",
        }
    }

    /// Bybit v5 `interval`.
    pub fn bybit_interval(self) -> &'static str {
        match self {
            Self::M1 => "1",
            Self::M5 => "5",
            Self::H1 => "60",
            Self::D1 => "D",
        }
    }

    /// Deribit chart `resolution`.
    pub fn deribit_resolution(self) -> &'static str {
        match self {
            Self::M1 => "1",
            Self::M5 => "5",
            Self::H1 => "60",
            Self::D1 => "1D",
        }
    }

    /// Mexc contract kline `interval`.
    pub fn mexc_interval(self) -> &'static str {
        match self {
            Self::M1 => "Min1",
            Self::M5 => "Min5",
            Self::H1 => "Min60",
            Self::D1 => "Day1",
        }
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.bitmex_bin())
    }
}

// ---------------------------------------------------------------------------
// Display layer
// ---------------------------------------------------------------------------

/// Severity of a queued status line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// Connection indicator shown per market.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ConnectionStatus {
    #[default]
    Connecting,
    Online,
    Blocked,
    Reloading,
    Stopped,
}
