//! rigswitch: GPU rental mining automation
//!
//! Entry point. Loads `.env` and configuration, initialises structured
//! logging, wires the gateways together, and dispatches the CLI command.
//! The default command runs the orchestration loop until Ctrl+C.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};

use rigswitch::config::AppConfig;
use rigswitch::engine::{CoinSource, InstanceOrchestrator, MiningController, RentFailure};
use rigswitch::fleet::dry_run::DryRunFleet;
use rigswitch::fleet::vastai::VastAiClient;
use rigswitch::fleet::FleetGateway;
use rigswitch::miner::{MinerSettings, MinerSupervisor};
use rigswitch::notify::telegram::TelegramNotifier;
use rigswitch::notify::{LogNotifier, Notifications, Notifier};
use rigswitch::pool::twominers::TwoMinersClient;
use rigswitch::pool::{MinerKind, PoolStatsGateway};
use rigswitch::strategy::{CoinRanker, ProfitEstimator};

const BANNER: &str = r#"
      _                     _ _       _
 _ __(_) __ _ _____      _(_) |_ ___| |__
| '__| |/ _` / __\ \ /\ / / | __/ __| '_ \
| |  | | (_| \__ \\ V  V /| | || (__| | | |
|_|  |_|\__, |___/ \_/\_/ |_|\__\___|_| |_|
        |___/
  GPU rental mining automation v0.1.0
"#;

#[derive(Parser)]
#[command(name = "rigswitch", version, about = "Rent GPUs, mine the best coin, switch or stop as profitability moves")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, env = "RIGSWITCH_CONFIG", default_value = "config.toml")]
    config: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the orchestration loop (default).
    Run,
    /// List offers within the configured limits with their expected profit.
    Offers,
    /// Rent the first qualifying offer and start mining the best coin.
    Rent,
    /// Show pool-reported hashrate and unpaid balance for a coin's wallet.
    PoolStats {
        /// Coin name as configured under [pools], e.g. RVN.
        coin: String,
    },
    /// Supervise a miner process on this host (configured via env vars).
    Miner,
}

#[tokio::main]
async fn main() -> ExitCode {
    // Load .env file if present (non-fatal if missing)
    let _ = dotenv::dotenv();

    init_logging();

    let cli = Cli::parse();

    match dispatch(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = format!("{e:#}"), "rigswitch failed");
            ExitCode::FAILURE
        }
    }
}

async fn dispatch(cli: Cli) -> Result<()> {
    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run(&load_config(&cli.config)?, &cli.config).await,
        Command::Offers => list_offers(&load_config(&cli.config)?).await,
        Command::Rent => rent_once(&load_config(&cli.config)?).await,
        Command::PoolStats { coin } => pool_stats(&load_config(&cli.config)?, &coin).await,
        Command::Miner => {
            let settings = MinerSettings::from_env()?;
            info!(coin = %settings.coin, worker = %settings.worker, "Starting local miner supervisor");
            MinerSupervisor::new(settings).run(shutdown_signal()).await
        }
    }
}

fn load_config(path: &str) -> Result<AppConfig> {
    let cfg = AppConfig::load(path)?;
    info!(path, coins = cfg.coins.len(), dry_run = cfg.fleet.dry_run, "Configuration loaded");
    Ok(cfg)
}

// -- Commands -----------------------------------------------------------------

async fn run(cfg: &AppConfig, config_path: &str) -> Result<()> {
    cfg.validate()?;

    println!("{BANNER}");
    info!(
        interval_secs = cfg.orchestrator.check_interval_secs,
        min_profit = format!("${:.4}", cfg.orchestrator.min_profit_per_hour),
        max_price = format!("${:.4}", cfg.orchestrator.max_price_per_hour),
        "rigswitch starting up"
    );

    let fleet = build_fleet(cfg)?;
    let pool = build_pool(cfg)?;
    let controller = MiningController::new(fleet.clone(), pool, cfg.controller_config());

    let mut orchestrator = InstanceOrchestrator::new(
        fleet,
        controller,
        CoinRanker::new(cfg.coins.clone(), cfg.switch_config()),
        ProfitEstimator::new(cfg.profit_config()),
        build_notifications(cfg),
        cfg.orchestrator_config(),
    )
    .with_coin_source(coin_reloader(config_path));

    info!("Entering main loop. Press Ctrl+C to stop.");
    let report = orchestrator.run(shutdown_signal()).await;

    info!(
        profit = format!("${:.2}", report.total_profit),
        runtime = %report.runtime_display(),
        cycles = orchestrator.cycle_count(),
        orphaned = report.orphaned_rentals,
        "rigswitch shut down cleanly."
    );
    Ok(())
}

async fn list_offers(cfg: &AppConfig) -> Result<()> {
    let fleet = build_fleet(cfg)?;
    let ranker = CoinRanker::new(cfg.coins.clone(), cfg.switch_config());
    let estimator = ProfitEstimator::new(cfg.profit_config());

    let offers = fleet
        .find_offers(cfg.orchestrator.min_gpu_ram, cfg.orchestrator.max_price_per_hour)
        .await?;

    if offers.is_empty() {
        println!("No offers within limits.");
        return Ok(());
    }

    let best = ranker.rank();
    if let Some(coin) = best {
        println!("Best coin: {coin}");
    }
    for offer in &offers {
        match best {
            Some(coin) => {
                let snap = estimator.expected_profit(offer, coin, offer.price_per_hour);
                let verdict = if snap.net_profit_per_hour >= cfg.orchestrator.min_profit_per_hour {
                    "qualifies"
                } else {
                    "skip"
                };
                println!("{offer}  net=${:.4}/h  {verdict}", snap.net_profit_per_hour);
            }
            None => println!("{offer}"),
        }
    }
    Ok(())
}

async fn rent_once(cfg: &AppConfig) -> Result<()> {
    cfg.validate()?;

    let fleet = build_fleet(cfg)?;
    let pool = build_pool(cfg)?;
    let ranker = CoinRanker::new(cfg.coins.clone(), cfg.switch_config());
    let controller = MiningController::new(fleet.clone(), pool, cfg.controller_config());

    let coin = ranker.rank().context("no coins configured")?;
    let offers = fleet
        .find_offers(cfg.orchestrator.min_gpu_ram, cfg.orchestrator.max_price_per_hour)
        .await?;
    let offer = offers.first().context("no offers within limits")?;

    match controller.rent_and_mine(offer, coin).await {
        Ok(instance) => {
            println!("Mining {} on {offer} as instance {}", coin.name, instance.id);
            Ok(())
        }
        Err(e @ RentFailure::Orphaned { .. }) => {
            warn!("Rental left running; terminate it manually");
            Err(e.into())
        }
        Err(e) => Err(e.into()),
    }
}

async fn pool_stats(cfg: &AppConfig, coin: &str) -> Result<()> {
    let pool = build_pool(cfg)?;
    let stats = pool.get_pool_stats(coin).await?;
    println!("{coin}: {stats}");
    Ok(())
}

// -- Wiring -------------------------------------------------------------------

fn build_fleet(cfg: &AppConfig) -> Result<Arc<dyn FleetGateway>> {
    if cfg.fleet.dry_run {
        info!("Dry-run mode: using in-memory fleet");
        return Ok(Arc::new(DryRunFleet::default()));
    }

    let api_key = AppConfig::resolve_env(&cfg.fleet.api_key_env)?;
    Ok(Arc::new(VastAiClient::new(api_key, cfg.rental_template(), cfg.gateway_timeout())?))
}

fn build_pool(cfg: &AppConfig) -> Result<Arc<dyn PoolStatsGateway>> {
    let miner = MinerKind::from_name(&cfg.pool.miner);
    if let MinerKind::Unsupported(ref name) = miner {
        warn!(miner = %name, "Unsupported miner configured; start commands will be no-ops");
    }
    Ok(Arc::new(TwoMinersClient::new(miner, cfg.pools.clone(), cfg.gateway_timeout())?))
}

fn build_notifications(cfg: &AppConfig) -> Notifications {
    let timeout = cfg.gateway_timeout();
    let inner: Box<dyn Notifier> = match telegram(cfg) {
        Ok(Some(notifier)) => {
            info!("Telegram notifications enabled");
            Box::new(notifier)
        }
        Ok(None) => {
            info!("Telegram not configured, notifications will only be logged");
            Box::new(LogNotifier)
        }
        Err(e) => {
            warn!(error = format!("{e:#}"), "Telegram unavailable, notifications will only be logged");
            Box::new(LogNotifier)
        }
    };
    Notifications::new(inner, timeout)
}

fn telegram(cfg: &AppConfig) -> Result<Option<TelegramNotifier>> {
    let (Some(token_env), Some(chat_env)) = (
        cfg.alerts.telegram_bot_token_env.as_deref(),
        cfg.alerts.telegram_chat_id_env.as_deref(),
    ) else {
        return Ok(None);
    };

    let token = AppConfig::resolve_env(token_env)?;
    let chat_id = std::env::var(chat_env).with_context(|| format!("Environment variable not set: {chat_env}"))?;
    Ok(Some(TelegramNotifier::new(token, chat_id, cfg.gateway_timeout())?))
}

/// Re-reads `[[coins]]` from the config file so edited estimates take
/// effect on the next cycle without a restart. Invalid sets are rejected.
fn coin_reloader(path: &str) -> CoinSource {
    let path = path.to_string();
    Box::new(move || AppConfig::reload_coins(&path))
}

/// Resolves on the first Ctrl+C.
///
/// The handler is installed immediately so a signal during a long cycle
/// is not lost.
fn shutdown_signal() -> impl std::future::Future<Output = ()> {
    let (tx, rx) = tokio::sync::oneshot::channel::<()>();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                let _ = tx.send(());
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for Ctrl+C");
                // Keep the sender alive so the receiver never resolves.
                std::future::pending::<()>().await;
                drop(tx);
            }
        }
    });
    async move {
        let _ = rx.await;
    }
}

/// Initialise the `tracing` subscriber.
fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("rigswitch=info"));

    let json_logging = std::env::var("RIGSWITCH_LOG_JSON").is_ok();

    if json_logging {
        fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_thread_ids(true)
            .init();
    } else {
        fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    }
}
