//! Keyed registries for instruments and accounts.
//!
//! Instruments are created lazily the first time anything refers to
//! `(ticker, market)`, and accounts the first time anything refers to
//! `(currency, market)`. Both live for the whole process; a market reload only
//! clears the live fields so that the fresh snapshots repopulate them.
//!
//! Writers take the lock for the duration of one closure. Readers get cloned
//! snapshots and may observe slightly stale data.

use std::sync::Arc;

use ahash::AHashMap;
use parking_lot::RwLock;

use crate::types::{Account, AccountKey, Exchange, Instrument, SymbolKey};

// ---------------------------------------------------------------------------
// InstrumentCatalog
// ---------------------------------------------------------------------------

/// Registry of normalized instruments keyed by `(ticker, market)`.
#[derive(Clone, Default)]
pub struct InstrumentCatalog {
    inner: Arc<RwLock<AHashMap<SymbolKey, Instrument>>>,
}

impl InstrumentCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mutate the instrument under `key`, creating it first if needed.
    pub fn upsert<R>(&self, key: &SymbolKey, f: impl FnOnce(&mut Instrument) -> R) -> R {
        let mut map = self.inner.write();
        let inst = map.entry(key.clone()).or_insert_with(|| Instrument::new(key.clone()));
        f(inst)
    }

    /// Mutate an existing instrument; `None` if it was never created.
    pub fn update<R>(&self, key: &SymbolKey, f: impl FnOnce(&mut Instrument) -> R) -> Option<R> {
        self.inner.write().get_mut(key).map(f)
    }

    /// Insert or replace the full record.
    pub fn insert(&self, inst: Instrument) {
        self.inner.write().insert(inst.key.clone(), inst);
    }

    pub fn get(&self, key: &SymbolKey) -> Option<Instrument> {
        self.inner.read().get(key).cloned()
    }

    /// Read a field without cloning the record.
    pub fn with<R>(&self, key: &SymbolKey, f: impl FnOnce(&Instrument) -> R) -> Option<R> {
        self.inner.read().get(key).map(f)
    }

    pub fn contains(&self, key: &SymbolKey) -> bool {
        self.inner.read().contains_key(key)
    }

    /// Exchange-native contracts to unified units; unknown keys pass through.
    pub fn unified_qty(&self, key: &SymbolKey, native: f64) -> f64 {
        self.with(key, |i| i.from_native_qty(native)).unwrap_or(native)
    }

    /// Unified units to exchange-native contracts; unknown keys pass through.
    pub fn native_qty(&self, key: &SymbolKey, qty: f64) -> f64 {
        self.with(key, |i| i.to_native_qty(qty)).unwrap_or(qty)
    }

    /// All instruments of one market, sorted by ticker.
    pub fn market(&self, market: Exchange) -> Vec<Instrument> {
        let mut out: Vec<Instrument> = self.inner.read().values().filter(|i| i.key.market == market).cloned().collect();
        out.sort_by(|a, b| a.key.ticker.cmp(&b.key.ticker));
        out
    }

    /// Drop book and position state of one market ahead of a reload.
    pub fn reset_live(&self, market: Exchange) {
        for inst in self.inner.write().values_mut().filter(|i| i.key.market == market) {
            inst.bids.clear();
            inst.asks.clear();
            inst.current_qty = 0.0;
            inst.avg_entry_price = 0.0;
            inst.unrealized_pnl = 0.0;
            inst.margin_call_price = 0.0;
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}

// ---------------------------------------------------------------------------
// AccountRegistry
// ---------------------------------------------------------------------------

/// Registry of per-currency balances keyed by `(currency, market)`.
#[derive(Clone, Default)]
pub struct AccountRegistry {
    inner: Arc<RwLock<AHashMap<AccountKey, Account>>>,
}

impl AccountRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert<R>(&self, key: &AccountKey, f: impl FnOnce(&mut Account) -> R) -> R {
        let mut map = self.inner.write();
        f(map.entry(key.clone()).or_default())
    }

    pub fn update<R>(&self, key: &AccountKey, f: impl FnOnce(&mut Account) -> R) -> Option<R> {
        self.inner.write().get_mut(key).map(f)
    }

    pub fn get(&self, key: &AccountKey) -> Option<Account> {
        self.inner.read().get(key).cloned()
    }

    pub fn contains(&self, key: &AccountKey) -> bool {
        self.inner.read().contains_key(key)
    }

    pub fn market(&self, market: Exchange) -> Vec<(AccountKey, Account)> {
        let mut out: Vec<_> =
            self.inner.read().iter().filter(|(k, _)| k.market == market).map(|(k, a)| (k.clone(), a.clone())).collect();
        out.sort_by(|a, b| a.0.currency.cmp(&b.0.currency));
        out
    }
}
