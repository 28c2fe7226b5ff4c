//! # mx-market
//!
//! Per-exchange connection lifecycle and order reconciliation.
//!
//! A [`MarketConnection`] drives one exchange through bootstrap, live
//! streaming, history replay and reload. Every market writes into the
//! shared tables held by [`AppContext`]; the [`ConnectionSupervisor`]
//! watches their health and reloads them independently.

pub mod bot;
pub mod connection;
pub mod context;
pub mod dispatch;
pub mod event;
pub mod kline;
pub mod store;
pub mod supervisor;

#[cfg(test)]
mod testing;

pub use bot::{BotBook, BotState, Strategy};
pub use connection::{Health, MarketConnection, MarketState};
pub use context::AppContext;
pub use event::{EventBus, EventStreams, OrderAction, OrderEvent, StatusMessage};
pub use store::{MemoryStore, Store};
pub use supervisor::ConnectionSupervisor;
