//! MARTIN CLI
//!
//! `run` starts the snapshot and orchestration loops; the remaining
//! commands inspect or adjust the ledger out-of-band.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use martin::clients::clob::ApiCredentials;
use martin::{
    decision_channel, BinanceClient, ClobClient, Config, Database, ExecutionMode, GammaClient,
    Notifier, NullNotifier, Orchestrator, SnapshotCache, SnapshotWorker, TaEngine,
    WebhookNotifier,
};

#[derive(Parser)]
#[command(name = "martin")]
#[command(about = "Trading assistant for hourly up/down prediction markets")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to the JSON config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the bot (snapshot worker + orchestrator)
    Run,

    /// Show stats and live trades
    Status,

    /// Show settled trades and totals
    Report {
        /// Number of settled trades to list
        #[arg(short, long, default_value = "20")]
        limit: i64,
    },

    /// Pause trade intake
    Pause,

    /// Resume trade intake
    Resume,

    /// Persist a runtime setting override (dot-separated key)
    Set { key: String, value: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .compact()
        .init();

    let mut config = Config::load(cli.config.as_deref())?;
    let db = Database::new(&config.app.database_path).await?;

    // Settings-table rows take precedence over file and environment.
    let settings = db.all_settings().await?;
    config
        .apply_settings(&settings)
        .context("invalid settings overrides in ledger")?;

    match cli.command {
        Commands::Run => run_bot(config, db).await?,
        Commands::Status => show_status(&db).await?,
        Commands::Report { limit } => show_report(&db, limit).await?,
        Commands::Pause => set_paused(&db, true).await?,
        Commands::Resume => set_paused(&db, false).await?,
        Commands::Set { key, value } => {
            // Validate against the known configuration surface before
            // persisting, so a typo cannot brick the next startup.
            let mut probe = config.clone();
            let mut overlay = std::collections::HashMap::new();
            overlay.insert(key.clone(), value.clone());
            probe
                .apply_settings(&overlay)
                .with_context(|| format!("rejected setting {}", key))?;
            db.set_setting(&key, &value).await?;
            println!("{} = {}", key, value);
        }
    }

    Ok(())
}

async fn run_bot(config: Config, db: Database) -> Result<()> {
    info!(
        "MARTIN starting: mode={:?} assets={:?} cap={} tick={}s snapshot={}s",
        config.execution.mode,
        config.trading.assets,
        config.trading.price_cap,
        config.loops.tick_seconds,
        config.loops.snapshot_seconds
    );
    info!(
        "Day/Night: {}..{} local ({}), night autotrade={} session={}",
        config.day_night.day_start_hour,
        config.day_night.day_end_hour,
        config.app.timezone,
        config.day_night.night_autotrade_enabled,
        config.day_night.night_session_mode
    );

    let credentials = ApiCredentials::from_env();
    if config.execution.mode == ExecutionMode::Live && credentials.is_none() {
        anyhow::bail!(
            "live execution requires POLYMARKET_API_KEY, POLYMARKET_API_SECRET and POLYMARKET_PASSPHRASE"
        );
    }

    let catalog = Arc::new(GammaClient::new(&config.apis.gamma)?);
    let candles = Arc::new(BinanceClient::new(&config.apis.binance)?);
    let book = Arc::new(ClobClient::new(&config.apis.clob, credentials)?);

    let notifier: Arc<dyn Notifier> = match &config.notifier.webhook_url {
        Some(url) => {
            info!("Webhook notifier enabled");
            Arc::new(WebhookNotifier::new(url.clone()))
        }
        None => Arc::new(NullNotifier),
    };

    let snapshots = SnapshotCache::new();
    let worker = SnapshotWorker::new(
        candles,
        snapshots.clone(),
        config.trading.assets.clone(),
        config.trading.warmup_seconds,
        std::time::Duration::from_secs(config.loops.snapshot_seconds),
    );

    // The decision sender is where a chat front end would plug in; the
    // headless binary only ever auto-resolves via timeouts.
    let (_decision_tx, decision_rx) = decision_channel();

    let orchestrator = Arc::new(Orchestrator::new(
        db,
        config,
        catalog,
        book,
        Arc::new(TaEngine::new()),
        snapshots,
        notifier,
        decision_rx,
    )?);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker_handle = tokio::spawn({
        let shutdown = shutdown_rx.clone();
        async move { worker.run(shutdown).await }
    });
    let orchestrator_handle = tokio::spawn({
        let orchestrator = orchestrator.clone();
        let shutdown = shutdown_rx;
        async move { orchestrator.run(shutdown).await }
    });

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("Shutdown requested, finishing the in-flight cycle");
    shutdown_tx.send(true).ok();

    if let Err(e) = worker_handle.await {
        error!("Snapshot worker task failed: {}", e);
    }
    match orchestrator_handle.await {
        Ok(result) => result?,
        Err(e) => error!("Orchestrator task failed: {}", e),
    }

    info!("MARTIN stopped cleanly");
    Ok(())
}

async fn show_status(db: &Database) -> Result<()> {
    let stats = db.stats().await?;

    println!("\n{}", "=".repeat(60));
    println!("  MARTIN STATUS");
    println!("{}\n", "=".repeat(60));

    println!(
        "Policy: {} | Streak: {} (night {}) | Paused: {}",
        stats.policy_mode,
        stats.trade_level_streak,
        stats.night_streak,
        if stats.is_paused { "YES" } else { "no" }
    );
    println!(
        "Totals: {} trades, {} wins, {} losses ({:.1}% win rate)",
        stats.total_trades,
        stats.total_wins,
        stats.total_losses,
        stats.win_rate()
    );

    let active = db.active_trades().await?;
    if active.is_empty() {
        println!("\nNo live trades.");
    } else {
        println!("\nLive trades ({}):", active.len());
        for trade in active {
            println!(
                "  #{} window {} [{}] decision={} reason={}",
                trade.id,
                trade.window_id,
                trade.status,
                trade.decision,
                trade
                    .cancel_reason
                    .map(|r| r.to_string())
                    .unwrap_or_else(|| "-".to_string()),
            );
        }
    }

    Ok(())
}

async fn show_report(db: &Database, limit: i64) -> Result<()> {
    let stats = db.stats().await?;
    let settled = db.settled_trades(limit).await?;

    println!("\n{}", "=".repeat(60));
    println!("  MARTIN REPORT");
    println!("{}\n", "=".repeat(60));

    println!(
        "Totals: {} trades | {} wins | {} losses | win rate {:.1}%",
        stats.total_trades,
        stats.total_wins,
        stats.total_losses,
        stats.win_rate()
    );

    if settled.is_empty() {
        println!("\nNo settled trades yet.");
        return Ok(());
    }

    println!("\nLast {} settled trades:", settled.len());
    for trade in settled {
        println!(
            "  #{} window {} {} pnl={} stake={} decision={}",
            trade.id,
            trade.window_id,
            match trade.is_win {
                Some(true) => "WIN ",
                Some(false) => "LOSS",
                None => "?   ",
            },
            trade
                .pnl
                .map(|p| p.to_string())
                .unwrap_or_else(|| "-".to_string()),
            trade.stake_amount,
            trade.decision,
        );
    }

    Ok(())
}

async fn set_paused(db: &Database, paused: bool) -> Result<()> {
    let mut stats = db.stats().await?;
    stats.is_paused = paused;
    db.update_stats(&stats).await?;
    println!("Bot {}", if paused { "paused" } else { "resumed" });
    Ok(())
}
