//! Funding Hedger - Main Entry Point

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use funding_hedger::config::Config;
use funding_hedger::exchange::{BybitClient, Exchange};
use funding_hedger::persistence::{
    HedgeStore, SqliteStore, TradeGroupStore, UnsupportedSymbolStore,
};
use funding_hedger::strategy::{candidate_source, FundingRanker, HedgeReconciler};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn, Level};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

/// Funding Hedger CLI
#[derive(Parser)]
#[command(name = "funding-hedger")]
#[command(version, about = "Delta-neutral funding rate hedging on Bybit")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the reconcile loop (default)
    Run {
        /// Run a single cycle and exit
        #[arg(long)]
        once: bool,
    },

    /// Print the current funding ranking without trading
    Rank,

    /// Show persisted trade groups and unsupported symbols
    Status {
        /// Path to SQLite database
        #[arg(short, long, default_value = "data/trading.db")]
        db: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Status { db }) => show_status(&db),
        Some(Commands::Rank) => {
            init_logging()?;
            show_ranking().await
        }
        Some(Commands::Run { once }) => {
            init_logging()?;
            run(once).await
        }
        None => {
            init_logging()?;
            run(false).await
        }
    }
}

/// Components shared by `run` and `rank`.
struct Runtime {
    config: Config,
    exchange: Arc<dyn Exchange>,
    store: Arc<SqliteStore>,
    ranker: FundingRanker,
}

fn build_runtime() -> Result<Runtime> {
    let config = Config::load()?;
    log_config(&config);

    let exchange: Arc<dyn Exchange> = Arc::new(
        BybitClient::new(&config.exchange)?.with_quote_asset(config.universe.quote_asset.clone()),
    );

    let store = Arc::new(
        SqliteStore::new(&config.runtime.db_path)
            .with_context(|| format!("Failed to open database {}", config.runtime.db_path))?,
    );
    for symbol in &config.universe.unsupported_symbols {
        store.add_unsupported_symbol(symbol)?;
    }

    let source = candidate_source(&config.universe, config.exchange.request_timeout_secs)?;
    let ranker = FundingRanker::new(
        exchange.clone(),
        source,
        config.universe.pair_list.clone(),
        store.clone(),
        config.scoring.clone(),
    )?;

    Ok(Runtime {
        config,
        exchange,
        store,
        ranker,
    })
}

async fn run(once: bool) -> Result<()> {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        "Funding Hedger starting"
    );

    let Runtime {
        config,
        exchange,
        store,
        ranker,
    } = build_runtime()?;
    let store: Arc<dyn HedgeStore> = store;
    let mut reconciler = HedgeReconciler::new(exchange.clone(), store, ranker, &config);

    let interval = Duration::from_secs(config.runtime.check_interval_minutes * 60);
    loop {
        let report = reconciler.run_cycle(Utc::now()).await;
        if !report.residual_risk.is_empty() {
            error!(
                symbols = ?report.residual_risk,
                last_error = ?exchange.last_error(),
                "Unhedged legs remain after this cycle"
            );
        }
        if report.snapshot_failed {
            warn!(last_error = ?exchange.last_error(), "Cycle skipped");
        }

        if once {
            break;
        }

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    info!("Funding Hedger shutdown complete");
    Ok(())
}

async fn show_ranking() -> Result<()> {
    let runtime = build_runtime()?;
    let ranked = runtime.ranker.refresh().await?;

    println!("Funding ranking ({} candidates kept)", ranked.len());
    for (i, entry) in ranked.iter().enumerate() {
        println!(
            "  {}. {:<14} score {:>12.8}  latest {:>12.8}",
            i + 1,
            entry.symbol,
            entry.score,
            entry.latest
        );
    }
    if ranked.is_empty() {
        println!("  (no eligible symbols)");
    }
    Ok(())
}

/// Print persisted state without contacting the exchange.
fn show_status(db_path: &str) -> Result<()> {
    if !Path::new(db_path).exists() {
        println!("Database not found: {}", db_path);
        println!("The hedger has not been started yet, or the database path is incorrect.");
        return Ok(());
    }

    let store = SqliteStore::new(db_path)?;

    let groups = store.active_trade_groups()?;
    println!("Active trade groups: {}", groups.len());
    for group in &groups {
        println!(
            "  {}  opened {}",
            group.identifier(),
            group.created_at.format("%Y-%m-%d %H:%M:%S UTC")
        );
    }

    let mut unsupported: Vec<String> = store.unsupported_symbols()?.into_iter().collect();
    unsupported.sort();
    println!("Unsupported symbols: {}", unsupported.len());
    for symbol in &unsupported {
        println!("  {}", symbol);
    }
    Ok(())
}

/// Initialize logging to stdout and an hourly rolling file.
fn init_logging() -> Result<()> {
    use tracing_subscriber::fmt::writer::MakeWriterExt;

    std::fs::create_dir_all("logs")?;

    let file_appender = tracing_appender::rolling::hourly("logs", "funding-hedger.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    // Keep the writer flushing for the program duration
    Box::leak(Box::new(guard));

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("funding_hedger=debug".parse()?)
                .add_directive(Level::INFO.into()),
        )
        .with_writer(std::io::stdout.and(file_writer))
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(true)
        .init();

    Ok(())
}

/// Log configuration on startup.
fn log_config(config: &Config) {
    info!(
        base_url = %config.exchange.base_url,
        leverage = config.exchange.default_leverage,
        source = ?config.universe.source,
        "Exchange and universe"
    );
    info!(
        periods = ?config.scoring.periods,
        weights = ?config.scoring.weights,
        top = config.scoring.top_pairs_count,
        reverse_funding = config.scoring.reverse_funding_rate,
        "Scoring"
    );
    info!(
        min = %config.position.min_position_value,
        max = %config.position.max_position_value,
        scaling = config.position.position_scaling,
        "Position limits"
    );
    info!(
        interval_minutes = config.runtime.check_interval_minutes,
        near_settlement_only = config.runtime.trade_only_near_settlement,
        db = %config.runtime.db_path,
        "Runtime"
    );
    if config.exchange.api_key.is_empty() {
        warn!("No API key configured, signed requests will be rejected");
    }
}
