//! Adapter construction by exchange name.

use std::sync::Arc;

use mx_core::config::MarketConfig;
use mx_core::error::ExResult;
use mx_core::{Exchange, InstrumentCatalog};
use tracing::info;

use crate::ExchangeAdapter;
use crate::bitmex::BitmexAdapter;
use crate::bybit::BybitAdapter;
use crate::deribit::DeribitAdapter;
use crate::mexc::MexcAdapter;

/// Build the adapter for `config.exchange`, sharing `catalog`.
///
/// An invalid config (bad URL, no symbols) is CANCEL: retrying it cannot
/// succeed.
pub fn create_adapter(config: &MarketConfig, catalog: InstrumentCatalog) -> ExResult<Arc<dyn ExchangeAdapter>> {
    config.validate()?;
    info!(
        "[{}] adapter for {} symbol(s), {} mode",
        config.exchange,
        config.symbols.len(),
        if config.has_credentials() { "trading" } else { "public" }
    );
    Ok(match config.exchange {
        Exchange::Bitmex => Arc::new(BitmexAdapter::new(config, catalog)),
        Exchange::Bybit => Arc::new(BybitAdapter::new(config, catalog)),
        Exchange::Deribit => Arc::new(DeribitAdapter::new(config, catalog)),
        Exchange::Mexc => Arc::new(MexcAdapter::new(config, catalog)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use mx_core::ErrorKind;
    use mx_core::config::SymbolConfig;

    #[test]
    fn builds_every_exchange() {
        for exchange in Exchange::ALL {
            let symbols = vec![SymbolConfig { ticker: "X".into(), category: Default::default() }];
            let cfg = MarketConfig::new(exchange, symbols);
            let Ok(adapter) = create_adapter(&cfg, InstrumentCatalog::new()) else { panic!("{exchange} rejected") };
            assert_eq!(adapter.exchange(), exchange);
            assert!(!adapter.stream_protocols().is_empty());
        }
    }

    #[test]
    fn invalid_config_cancels() {
        let symbols = vec![SymbolConfig { ticker: "X".into(), category: Default::default() }];
        let mut cfg = MarketConfig::new(Exchange::Bybit, symbols);
        cfg.http_url = Some("ftp://nowhere".into());
        let Err(err) = create_adapter(&cfg, InstrumentCatalog::new()) else { panic!("accepted bad url") };
        assert_eq!(err.kind, ErrorKind::Cancel);

        let empty = MarketConfig::new(Exchange::Mexc, Vec::new());
        assert!(create_adapter(&empty, InstrumentCatalog::new()).is_err());
    }
}
