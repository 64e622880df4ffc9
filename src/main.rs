use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use clap::Parser;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use patmem::config::EngineConfig;
use patmem::data::{CandleFeed, CsvCandleFeed, FileSignalSink};
use patmem::domain::{StoreKey, Timeframe};
use patmem::engine::{train_pair, ModelLifecycle, SignalGenerator};
use patmem::error::Severity;
use patmem::logging::{init_logging, LogConfig, LogFormat};

#[derive(Parser)]
#[command(
    name = "patmem",
    about = "Pattern-memory learning engine for multi-timeframe trading signals"
)]
struct Cli {
    /// TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
    #[arg(long, global = true)]
    models_dir: Option<PathBuf>,
    #[arg(long, global = true)]
    signals_dir: Option<PathBuf>,
    /// pretty, json or compact
    #[arg(long, global = true)]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Train pattern stores from historical candles
    Train {
        #[arg(short, long, default_value = "BTC,ETH")]
        coins: String,
        /// Comma-separated timeframes (defaults to the configured set)
        #[arg(short, long)]
        timeframes: Option<String>,
        /// Only use the most recent N candles
        #[arg(long)]
        candles: Option<usize>,
    },
    /// Generate and publish signals from committed snapshots
    Signal {
        #[arg(short, long, default_value = "BTC,ETH")]
        coins: String,
        /// Run a single cycle and exit
        #[arg(long)]
        once: bool,
        #[arg(long, default_value = "60")]
        interval_secs: u64,
    },
    /// Show the lifecycle state of every (coin, timeframe) model
    Status {
        #[arg(short, long, default_value = "BTC,ETH")]
        coins: String,
        #[arg(short, long)]
        timeframes: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut log_config = LogConfig::from_env();
    if let Some(format) = cli.log_format {
        log_config = log_config.with_format(format);
    }
    init_logging(log_config).map_err(|e| anyhow::anyhow!("failed to initialize logging: {}", e))?;

    let mut config = EngineConfig::load(cli.config.as_deref())?;
    if let Some(dir) = cli.data_dir {
        config.paths.data_dir = dir;
    }
    if let Some(dir) = cli.models_dir {
        config.paths.models_dir = dir;
    }
    if let Some(dir) = cli.signals_dir {
        config.paths.signals_dir = dir;
    }

    match cli.command {
        Commands::Train {
            coins,
            timeframes,
            candles,
        } => {
            let timeframes = parse_timeframes(timeframes.as_deref(), &config.timeframes)?;
            run_train(config, parse_coins(&coins), timeframes, candles).await?;
        }
        Commands::Signal {
            coins,
            once,
            interval_secs,
        } => {
            run_signal(config, parse_coins(&coins), once, interval_secs).await?;
        }
        Commands::Status { coins, timeframes } => {
            let timeframes = parse_timeframes(timeframes.as_deref(), &config.timeframes)?;
            run_status(&config, &parse_coins(&coins), &timeframes);
        }
    }

    Ok(())
}

fn parse_coins(coins: &str) -> Vec<String> {
    coins
        .split(',')
        .map(|c| c.trim().to_uppercase())
        .filter(|c| !c.is_empty())
        .collect()
}

fn parse_timeframes(arg: Option<&str>, configured: &[Timeframe]) -> anyhow::Result<Vec<Timeframe>> {
    match arg {
        None => Ok(configured.to_vec()),
        Some(list) => Ok(list
            .split(',')
            .filter(|s| !s.trim().is_empty())
            .map(|s| s.parse::<Timeframe>())
            .collect::<Result<Vec<_>, _>>()?),
    }
}

/// Cancel `token` on Ctrl+C so trainers stop at the next iteration boundary.
async fn shutdown_signal(token: CancellationToken) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to install Ctrl+C handler");
        return;
    }
    warn!("Received Ctrl+C, stopping trainers after their final checkpoint...");
    token.cancel();
}

async fn run_train(
    config: EngineConfig,
    coins: Vec<String>,
    timeframes: Vec<Timeframe>,
    limit: Option<usize>,
) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();
    tokio::spawn(shutdown_signal(cancel.clone()));

    let feed: Arc<dyn CandleFeed> = Arc::new(CsvCandleFeed::new(config.paths.data_dir.clone()));
    let config = Arc::new(config);

    info!(coins = ?coins, timeframes = ?timeframes, "Starting training");

    // One blocking task per (coin, timeframe); each owns its store exclusively.
    let mut tasks = JoinSet::new();
    for coin in &coins {
        for &timeframe in &timeframes {
            let key = StoreKey::new(coin, timeframe);
            let config = Arc::clone(&config);
            let feed = Arc::clone(&feed);
            let cancel = cancel.clone();
            tasks.spawn_blocking(move || {
                let result = train_pair(&config, feed.as_ref(), &key, limit, &cancel);
                (key, result)
            });
        }
    }

    let mut fatal = None;
    while let Some(joined) = tasks.join_next().await {
        let (key, result) = joined?;
        match result {
            Ok(state) => {
                println!(
                    "{:<10} candles={:>7} learned={:>6} updated={:>6} success={:>5.1}% checkpoints={} ({:.0} candles/s)",
                    key.to_string(),
                    state.candles_processed,
                    state.patterns_learned,
                    state.patterns_updated,
                    state.success_rate() * 100.0,
                    state.checkpoints_written,
                    state.candles_per_second()
                );
            }
            Err(e) if e.severity() == Severity::Fatal => {
                error!(store = %key, error = %e, "Training failed");
                fatal.get_or_insert(e);
            }
            Err(e) => {
                warn!(store = %key, error = %e, "Training skipped");
            }
        }
    }

    match fatal {
        Some(e) => Err(e.into()),
        None => Ok(()),
    }
}

async fn run_signal(
    config: EngineConfig,
    coins: Vec<String>,
    once: bool,
    interval_secs: u64,
) -> anyhow::Result<()> {
    let feed = CsvCandleFeed::new(config.paths.data_dir.clone());
    let sink = FileSignalSink::new(config.paths.signals_dir.clone());
    let mut generator = SignalGenerator::new(config);

    if once {
        let signals = generator.run_cycle(&coins, &feed, &sink, Utc::now());
        for s in &signals {
            println!(
                "{:<8} {:<8} long={} short={} confidence={:.2}{}",
                s.coin,
                format!("{:?}", s.kind).to_lowercase(),
                s.long.strength,
                s.short.strength,
                s.confidence,
                if s.staleness { " (stale)" } else { "" }
            );
        }
        return Ok(());
    }

    info!(coins = ?coins, interval_secs, "Signal loop started");
    let mut interval = tokio::time::interval(std::time::Duration::from_secs(interval_secs.max(1)));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, stopping signal loop");
                break;
            }
            _ = interval.tick() => {
                tokio::task::block_in_place(|| {
                    generator.run_cycle(&coins, &feed, &sink, Utc::now());
                });
            }
        }
    }
    Ok(())
}

fn run_status(config: &EngineConfig, coins: &[String], timeframes: &[Timeframe]) {
    let now = Utc::now();
    println!("{:<8} {:<5} {:<11} last checkpoint", "coin", "tf", "state");
    for coin in coins {
        for &timeframe in timeframes {
            let key = StoreKey::new(coin, timeframe);
            let path = key.snapshot_path(&config.paths.models_dir);
            let lifecycle = ModelLifecycle::inspect(
                &path,
                key.clone(),
                config.store.clone(),
                now,
                config.freshness_window(),
            );
            println!(
                "{:<8} {:<5} {:<11} {}",
                key.coin,
                timeframe.to_string(),
                lifecycle.state().to_string(),
                lifecycle
                    .last_checkpoint()
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_else(|| "-".to_string())
            );
        }
    }
}
