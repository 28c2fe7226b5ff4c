//! Persistence seam.
//!
//! The market layer reads and writes history checkpoints, execution rows and
//! instrument metadata through [`Store`]. The SQL schema behind a real store
//! lives outside this workspace; [`MemoryStore`] backs tests and the runner.

use ahash::{AHashMap, AHashSet};
use chrono::{DateTime, Utc};
use mx_core::dedup::ExecKey;
use mx_core::error::MxError;
use mx_core::{Exchange, Execution, Instrument};
use parking_lot::RwLock;

pub trait Store: Send + Sync {
    /// Timestamp of the last replayed history record.
    fn checkpoint(&self, market: Exchange, account: &str) -> Option<DateTime<Utc>>;

    fn set_checkpoint(&self, market: Exchange, account: &str, at: DateTime<Utc>) -> Result<(), MxError>;

    /// Insert a trade or funding row. `Ok(false)` if the execution id is
    /// already stored for this market and account.
    fn insert_execution(&self, market: Exchange, exec: &Execution) -> Result<bool, MxError>;

    fn cached_instruments(&self, market: Exchange) -> Vec<Instrument>;

    fn save_instruments(&self, market: Exchange, instruments: &[Instrument]) -> Result<(), MxError>;
}

#[derive(Default)]
struct Tables {
    checkpoints: AHashMap<(Exchange, String), DateTime<Utc>>,
    exec_ids: AHashSet<ExecKey>,
    executions: Vec<Execution>,
    instruments: AHashMap<Exchange, Vec<Instrument>>,
}

/// Process-local [`Store`].
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stored rows of one market, in insertion order.
    pub fn executions(&self, market: Exchange) -> Vec<Execution> {
        self.tables.read().executions.iter().filter(|e| e.key.market == market).cloned().collect()
    }
}

impl Store for MemoryStore {
    fn checkpoint(&self, market: Exchange, account: &str) -> Option<DateTime<Utc>> {
        self.tables.read().checkpoints.get(&(market, account.to_string())).copied()
    }

    fn set_checkpoint(&self, market: Exchange, account: &str, at: DateTime<Utc>) -> Result<(), MxError> {
        let mut tables = self.tables.write();
        let slot = tables.checkpoints.entry((market, account.to_string())).or_insert(at);
        if at > *slot {
            *slot = at;
        }
        Ok(())
    }

    fn insert_execution(&self, market: Exchange, exec: &Execution) -> Result<bool, MxError> {
        if exec.exec_id.is_empty() {
            return Err(MxError::Persistence(format!("[{market}] execution without id on {}", exec.key)));
        }
        let mut tables = self.tables.write();
        if !tables.exec_ids.insert(ExecKey::of(market, exec)) {
            return Ok(false);
        }
        tables.executions.push(exec.clone());
        Ok(true)
    }

    fn cached_instruments(&self, market: Exchange) -> Vec<Instrument> {
        self.tables.read().instruments.get(&market).cloned().unwrap_or_default()
    }

    fn save_instruments(&self, market: Exchange, instruments: &[Instrument]) -> Result<(), MxError> {
        self.tables.write().instruments.insert(market, instruments.to_vec());
        Ok(())
    }
}
