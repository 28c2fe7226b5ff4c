//! # mx-core
//!
//! Core crate of the multi-exchange terminal, providing:
//!
//! - **Types** (`types`): enums, instruments and accounts, orders and
//!   executions, normalized stream messages
//! - **Configuration** (`config`): JSON config deserialization and validation
//! - **Error types** (`error`): `MxError` and the classified `ExchangeError`
//! - **Catalog** (`catalog`): keyed instrument and account registries
//! - **Ledger** (`ledger`): the open-order table reconciled by every event
//! - **Precision** (`precision`): tick and lot rounding
//! - **Deduplication** (`dedup`): per-session execution dedup
//! - **Rate limiting** (`rate_limit`): burst plus sustained request windows
//! - **WebSocket** (`ws`): the stream session state machine
//! - **Time utilities** (`time_util`) and **Logging** (`logging`)

pub mod catalog;
pub mod config;
pub mod dedup;
pub mod error;
pub mod ledger;
pub mod logging;
pub mod precision;
pub mod rate_limit;
pub mod time_util;
pub mod types;
pub mod ws;

pub use catalog::{AccountRegistry, InstrumentCatalog};
pub use types::*;
