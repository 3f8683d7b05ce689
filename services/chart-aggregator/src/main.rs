//! Chart Aggregator Service
//!
//! `run` recovers the candle store from its WAL, starts the rollover
//! scheduler and settles newline-delimited JSON commands read from stdin,
//! answering each with one JSON line on stdout. Prices are in ticks
//! (1 tick = 0.0001).
//!
//! ```text
//! {"cmd":"list","instrument":{"id":1,"code":"005930","name":"Samsung"},"listing_price":1000000}
//! {"cmd":"fill","instrument":1,"price":1050000,"amount":3}
//! {"cmd":"roll","interval":"1m"}
//! {"cmd":"chart","instrument":1,"mode":"dirty_read"}
//! ```
//!
//! `inspect` prints WAL statistics and the candles a replay recovers.

use anyhow::{Result, bail};
use chart_aggregator::{
    AggregatorConfig, ChartError, ChartMetrics, ChartService, Fill, Instrument, IntervalScheduler,
    IntervalType, LockMode, MemoryCandleStore, StoreOptions, Wal,
};
use chart_aggregator::store::CandleRepository;
use clap::{Parser, Subcommand};
use serde::Deserialize;
use serde_json::{Value, json};
use services_common::{Px, Symbol, Ts};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const SERVICE_NAME: &str = "chart-aggregator";

#[derive(Parser)]
#[command(name = SERVICE_NAME)]
#[command(about = "OHLCV candle aggregation with row-locked settlement")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Settle commands from stdin and roll candles on interval boundaries
    Run {
        /// TOML configuration file
        #[arg(long)]
        config: Option<String>,
    },

    /// Print WAL statistics and recovered candles
    Inspect {
        /// WAL directory
        #[arg(long)]
        wal: PathBuf,
    },
}

/// One stdin command
#[derive(Debug, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
enum Command {
    List {
        instrument: Instrument,
        listing_price: Px,
        #[serde(default)]
        intervals: Option<Vec<IntervalType>>,
    },
    Fill(Fill),
    Roll {
        interval: IntervalType,
        #[serde(default)]
        instrument: Option<Symbol>,
    },
    Chart {
        instrument: Symbol,
        #[serde(default = "default_chart_mode")]
        mode: LockMode,
    },
    Checkpoint,
    Metrics,
}

const fn default_chart_mode() -> LockMode {
    LockMode::DirtyRead
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing()?;

    match Cli::parse().command {
        Commands::Run { config } => run(config.as_deref()).await,
        Commands::Inspect { wal } => inspect(wal).await,
    }
}

async fn run(config_path: Option<&str>) -> Result<()> {
    let config = AggregatorConfig::load(config_path)?;
    info!("Starting Chart Aggregator v{}", env!("CARGO_PKG_VERSION"));

    let (store, report) = MemoryCandleStore::open(config.store_options()).await?;
    info!(
        "Store ready: {} instruments, {} candles from {} events",
        report.instruments, report.candles, report.events
    );

    let store = Arc::new(store);
    let mut service = ChartService::new(Arc::clone(&store));
    if config.metrics_enabled {
        service = service.with_metrics(ChartMetrics::new()?);
    }
    let service = Arc::new(service);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler = IntervalScheduler::new(&config.intervals, Ts::now());
    let scheduler_task = tokio::spawn(scheduler.run(Arc::clone(&service), config.scheduler_tick(), shutdown_rx));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line? {
                Some(line) if line.trim().is_empty() => {}
                Some(line) => {
                    let reply = handle_line(&service, &store, &config, &line).await;
                    println!("{reply}");
                }
                None => {
                    info!("Input closed");
                    break;
                }
            },
            signal = tokio::signal::ctrl_c() => {
                signal?;
                info!("Interrupt received");
                break;
            }
        }
    }

    shutdown_tx.send(true)?;
    scheduler_task.await?;

    match store.checkpoint().await {
        Ok(removed) => info!("Final checkpoint removed {} segments", removed),
        Err(e) => warn!("Final checkpoint failed, WAL left as is: {}", e),
    }
    info!("Chart Aggregator stopped");
    Ok(())
}

async fn handle_line(
    service: &ChartService<MemoryCandleStore>,
    store: &MemoryCandleStore,
    config: &AggregatorConfig,
    line: &str,
) -> Value {
    let command: Command = match serde_json::from_str(line) {
        Ok(command) => command,
        Err(e) => return json!({ "error": format!("invalid command: {e}"), "kind": "parse" }),
    };

    match execute(service, store, config, command).await {
        Ok(value) => json!({ "ok": value }),
        Err(e) => {
            let chart_error = e.downcast_ref::<ChartError>();
            let transient = chart_error.is_some_and(ChartError::is_transient);
            if !transient {
                error!("Command failed: {:#}", e);
            }
            json!({
                "error": format!("{e:#}"),
                "kind": chart_error.map_or("internal", ChartError::kind),
                "transient": transient,
            })
        }
    }
}

async fn execute(
    service: &ChartService<MemoryCandleStore>,
    store: &MemoryCandleStore,
    config: &AggregatorConfig,
    command: Command,
) -> Result<Value> {
    let value = match command {
        Command::List {
            instrument,
            listing_price,
            intervals,
        } => {
            let intervals = intervals.unwrap_or_else(|| config.intervals.clone());
            serde_json::to_value(service.list_instrument(instrument, listing_price, &intervals).await?)?
        }
        Command::Fill(fill) => serde_json::to_value(service.settle_trade(fill).await?)?,
        Command::Roll {
            interval,
            instrument: Some(instrument),
        } => serde_json::to_value(service.roll_candle(instrument, interval).await?)?,
        Command::Roll {
            interval,
            instrument: None,
        } => {
            let outcome = service.roll_interval_type(interval).await?;
            let mut failed = Vec::with_capacity(outcome.failed.len());
            for (key, e) in &outcome.failed {
                let mut entry = serde_json::to_value(key)?;
                entry["kind"] = Value::from(e.kind());
                entry["error"] = Value::from(e.to_string());
                failed.push(entry);
            }
            json!({ "rolled": outcome.rolled, "failed": failed })
        }
        Command::Chart { instrument, mode } => serde_json::to_value(service.chart(instrument, mode).await?)?,
        Command::Checkpoint => json!({ "removed_segments": store.checkpoint().await? }),
        Command::Metrics => match service.metrics() {
            Some(metrics) => Value::String(metrics.render()?),
            None => return Err(ChartError::validation("metrics are disabled").into()),
        },
    };
    Ok(value)
}

async fn inspect(wal_dir: PathBuf) -> Result<()> {
    if !wal_dir.is_dir() {
        bail!("WAL directory not found: {}", wal_dir.display());
    }

    let stats = Wal::new(&wal_dir, None, false)?.stats()?;
    println!("WAL {}", wal_dir.display());
    println!("  segments: {}", stats.segment_count);
    println!("  entries:  {}", stats.total_entries);
    println!("  bytes:    {}", stats.total_size);

    let options = StoreOptions {
        wal_dir: Some(wal_dir),
        sync_on_commit: false,
        ..StoreOptions::default()
    };
    let (store, report) = MemoryCandleStore::open(options).await?;
    println!(
        "Recovered {} instruments and {} candles from {} events",
        report.instruments, report.candles, report.events
    );

    for interval in IntervalType::ALL {
        for handle in store.find_by_interval_type(interval, LockMode::DirtyRead).await? {
            println!("{}", serde_json::to_string(handle.candle())?);
        }
    }
    Ok(())
}

/// Initialize tracing with environment filter. Logs go to stderr so stdout
/// carries only command replies.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("{}=info", SERVICE_NAME.replace('-', "_")).into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_line_number(true)
                .with_thread_ids(true),
        )
        .try_init()?;

    Ok(())
}
