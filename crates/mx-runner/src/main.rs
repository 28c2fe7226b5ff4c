//! # mx-runner
//!
//! Entry point for the multi-exchange terminal core.
//!
//! Loads a JSON configuration file, connects every configured market,
//! and keeps them supervised until Ctrl+C.
//!
//! # Usage
//!
//! ```bash
//! mx-runner config.json --log-level info
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use clap::Parser;
use mx_core::Kline;
use mx_core::config::BotConfig;
use mx_core::logging::{LogOptions, init_logging};
use mx_core::{ConnectionStatus, Severity};
use mx_market::{
    AppContext, ConnectionSupervisor, EventStreams, MarketConnection, MemoryStore, OrderAction, Strategy,
};
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Multi-exchange market connection runner.
#[derive(Parser)]
#[command(name = "mx-runner", about = "Multi-exchange market connection runner")]
struct Cli {
    /// Configuration file path (JSON).
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error). Overrides the config.
    #[arg(short, long)]
    log_level: Option<String>,

    /// Optional log directory for file output. Overrides the config.
    #[arg(long)]
    log_dir: Option<String>,
}

/// Logs every closed bar with the bot's position and the market's book.
struct BarLogger;

#[async_trait]
impl Strategy for BarLogger {
    async fn on_bar(&self, bot: &BotConfig, bars: &[Kline], market: &MarketConnection) {
        let Some(closed) = bars.len().checked_sub(2).and_then(|i| bars.get(i)) else {
            return;
        };
        let (bid, ask) = market
            .instrument(&bot.symbol)
            .map(|i| (i.best_bid(), i.best_ask()))
            .unwrap_or((None, None));
        info!(
            "[{}] {} {} close={} bid={bid:?} ask={ask:?} orders={}",
            bot.market,
            bot.name,
            bot.symbol,
            closed.close,
            market.orders().len()
        );
    }
}

/// Drain the status and order queues into the log.
fn spawn_drain(mut streams: EventStreams) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                Some(msg) = streams.status.recv() => match msg.severity {
                    Severity::Info => info!("status [{}] {}", msg.market, msg.text),
                    Severity::Warning => warn!("status [{}] {}", msg.market, msg.text),
                    Severity::Error => error!("status [{}] {}", msg.market, msg.text),
                },
                Some(event) = streams.orders.recv() => {
                    let order =
                        event.order.as_ref().and_then(|o| serde_json::to_string(o).ok()).unwrap_or_default();
                    match event.action {
                        OrderAction::Clear => info!("orders [{}] cleared", event.market),
                        action => info!("orders [{}] {action:?} {order}", event.market),
                    }
                }
                else => break,
            }
        }
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // 1. Load configuration
    let config = mx_core::config::load_config(&cli.config)?;

    // 2. Initialize logging; CLI flags win over the app block
    let level =
        cli.log_level.or_else(|| config.app.log_level.clone()).unwrap_or_else(|| "info".to_string());
    let dir = cli.log_dir.or_else(|| config.app.log_dir.clone());
    let _guard = init_logging(&LogOptions {
        level: &level,
        dir: dir.as_deref(),
        file_prefix: "mx-runner",
        json_file: config.app.log_json,
    });

    info!(
        "mx-runner starting: config={}, {} market(s), {} bot(s)",
        cli.config.display(),
        config.markets.len(),
        config.bots.len()
    );

    // 3. Shared tables and the event drain
    let (ctx, streams) = AppContext::new(Arc::new(MemoryStore::new()));
    let drain = spawn_drain(streams);

    // 4. Build and start the markets
    let mut supervisor = ConnectionSupervisor::from_config(&config, ctx);
    let strategy: Arc<dyn Strategy> = Arc::new(BarLogger);
    for bot in &config.bots {
        supervisor.set_strategy(&bot.name, Arc::clone(&strategy));
    }
    supervisor.start().await;
    for market in supervisor.markets() {
        if market.status() != ConnectionStatus::Online {
            warn!("[{}] not online after bootstrap ({:?})", market.market(), market.status());
        }
    }

    let supervisor = Arc::new(supervisor);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let runner = {
        let supervisor = Arc::clone(&supervisor);
        tokio::spawn(async move { supervisor.run(shutdown_rx).await })
    };
    info!("supervising {} market(s), press Ctrl+C to stop", supervisor.markets().len());

    // 5. Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");

    // 6. Stop the loop, then every market
    let _ = shutdown_tx.send(true);
    if let Err(e) = runner.await {
        error!("supervisor loop ended abnormally: {e}");
    }
    supervisor.shutdown().await;
    drain.abort();

    info!("all markets stopped");
    Ok(())
}
