//! Execution deduplication.
//!
//! The same fill can arrive twice within one session: once on the private
//! execution stream and again during history replay after a reload. The
//! [`ExecutionDedup`] set filters the second copy before it reaches the
//! ledger or the store. The persistent store covers duplicates across
//! process restarts; this set only covers the live session.

use ahash::AHashSet;

use crate::types::{Exchange, Execution};

/// Identity of an execution: unique per (market, account).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ExecKey {
    pub market: Exchange,
    pub account: String,
    pub exec_id: String,
}

impl ExecKey {
    pub fn of(market: Exchange, exec: &Execution) -> Self {
        Self { market, account: exec.account.clone(), exec_id: exec.exec_id.clone() }
    }
}

/// Set of executions already ingested in this session.
///
/// # Thread safety
///
/// Not thread-safe. Each market's dispatcher owns its own instance behind
/// a lock and clears it when the market reloads.
#[derive(Default)]
pub struct ExecutionDedup {
    seen: AHashSet<ExecKey>,
}

impl ExecutionDedup {
    pub fn new() -> Self {
        Self { seen: AHashSet::new() }
    }

    /// Returns `true` if `exec` is new, recording it. Returns `false` for a
    /// repeat of an already recorded (market, account, exec_id).
    #[inline]
    pub fn check_and_insert(&mut self, market: Exchange, exec: &Execution) -> bool {
        self.seen.insert(ExecKey::of(market, exec))
    }

    /// Forget everything recorded for one market.
    pub fn clear_market(&mut self, market: Exchange) {
        self.seen.retain(|k| k.market != market);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ExecType, Side, SymbolKey};

    fn exec(id: &str, account: &str) -> Execution {
        Execution {
            exec_id: id.to_string(),
            order_id: "o1".into(),
            cl_ord_id: None,
            key: SymbolKey::new("XBTUSD", Exchange::Bitmex),
            side: Side::Buy,
            qty: 100.0,
            price: 50_000.0,
            fee: 0.0,
            fee_currency: "XBt".into(),
            timestamp: chrono::Utc::now(),
            exec_type: ExecType::Trade,
            leaves_qty: None,
            account: account.to_string(),
        }
    }

    #[test]
    fn duplicate_exec_rejected() {
        let mut d = ExecutionDedup::new();
        assert!(d.check_and_insert(Exchange::Bitmex, &exec("e1", "1")));
        assert!(!d.check_and_insert(Exchange::Bitmex, &exec("e1", "1")));
        assert!(d.check_and_insert(Exchange::Bitmex, &exec("e2", "1")));
    }

    #[test]
    fn same_id_other_account_or_market_is_new() {
        let mut d = ExecutionDedup::new();
        assert!(d.check_and_insert(Exchange::Bitmex, &exec("e1", "1")));
        assert!(d.check_and_insert(Exchange::Bitmex, &exec("e1", "2")));
        assert!(d.check_and_insert(Exchange::Bybit, &exec("e1", "1")));
    }

    #[test]
    fn clear_one_market() {
        let mut d = ExecutionDedup::new();
        d.check_and_insert(Exchange::Bitmex, &exec("e1", "1"));
        d.check_and_insert(Exchange::Bybit, &exec("e1", "1"));
        d.clear_market(Exchange::Bitmex);
        assert!(d.check_and_insert(Exchange::Bitmex, &exec("e1", "1")));
        assert!(!d.check_and_insert(Exchange::Bybit, &exec("e1", "1")));
    }
}
