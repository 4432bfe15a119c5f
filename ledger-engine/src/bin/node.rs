//! Ledger node binary
//!
//! Usage: `ledger-node [config.toml]`. Without a file the configuration
//! comes from defaults plus `LEDGER_*` environment overrides. Set
//! `LEDGER_LOG_FORMAT=json` for JSON log lines. Balances are logged in
//! major units.

use anyhow::{Context, Result};
use ledger_engine::{Config, Ledger, LedgerEvent};
use tokio::sync::broadcast::error::RecvError;

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive(tracing::Level::INFO.into());

    if std::env::var("LEDGER_LOG_FORMAT").as_deref() == Ok("json") {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn load_config() -> Result<Config> {
    match std::env::args().nth(1) {
        Some(path) => {
            let mut config = Config::from_file(&path)
                .with_context(|| format!("failed to load configuration from {}", path))?;
            config.apply_env().context("invalid environment override")?;
            config.validate().context("invalid configuration")?;
            Ok(config)
        }
        None => Config::from_env().context("invalid environment configuration"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = load_config()?;
    tracing::info!(
        data_dir = %config.data_dir.display(),
        storage = ?config.storage,
        auto_produce = config.block.auto_produce,
        "Starting ledger node"
    );

    let ledger = Ledger::open(config).await.context("failed to open ledger")?;
    let report = ledger.recovery_report();
    if !report.is_clean() {
        tracing::warn!(
            applied = report.applied,
            cancelled = report.cancelled,
            "Recovered from unclean shutdown"
        );
    }

    let head = ledger.get_chain_head()?;
    tracing::info!(height = head.index, head = %head.hash_hex(), "Ledger ready");

    let decimals = ledger.config().currency_decimals;
    let mut events = ledger.subscribe();
    let event_log = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(LedgerEvent::BalanceChanged {
                    address,
                    previous,
                    current,
                }) => tracing::info!(
                    target: "ledger_events",
                    address = %address,
                    previous = %previous.to_major(decimals),
                    current = %current.to_major(decimals),
                    "Balance changed"
                ),
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(line) => tracing::info!(target: "ledger_events", "{}", line),
                    Err(e) => tracing::warn!("Unserializable event: {}", e),
                },
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Event log lagging");
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down ledger node");

    ledger.shutdown().await?;
    event_log.abort();
    Ok(())
}
