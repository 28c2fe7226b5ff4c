//! Shared state handed to every market.

use std::sync::Arc;

use mx_core::ledger::OrderLedger;
use mx_core::{AccountRegistry, InstrumentCatalog};

use crate::bot::BotBook;
use crate::event::{EventBus, EventStreams};
use crate::store::Store;

/// Everything the markets share. Built once at startup; cheap to clone.
#[derive(Clone)]
pub struct AppContext {
    pub catalog: InstrumentCatalog,
    pub accounts: AccountRegistry,
    pub ledger: OrderLedger,
    pub bots: BotBook,
    pub store: Arc<dyn Store>,
    pub bus: EventBus,
}

impl AppContext {
    pub fn new(store: Arc<dyn Store>) -> (Self, EventStreams) {
        let (bus, streams) = EventBus::new();
        let ctx = Self {
            catalog: InstrumentCatalog::new(),
            accounts: AccountRegistry::new(),
            ledger: OrderLedger::new(),
            bots: BotBook::new(),
            store,
            bus,
        };
        (ctx, streams)
    }
}
