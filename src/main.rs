//! Automated Equity Trading System
//!
//! Screens a symbol universe, runs technical strategies over market data,
//! aggregates their signals and trades them through a pluggable broker,
//! with risk checks, position monitoring and a REST control surface.

mod alerts;
mod api;
mod broker;
mod config;
mod db;
mod models;
mod orchestrator;
mod trading;

use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::api::AppState;
use crate::broker::config::missing_fields;
use crate::broker::{ActiveBroker, BrokerAdapter, BrokerFactory};
use crate::config::{set_env_file_var, AppConfig, LoggingConfig};
use crate::db::Database;
use crate::orchestrator::Orchestrator;
use crate::trading::OrderExecutor;

/// Automated trading system CLI.
#[derive(Parser)]
#[command(name = "autotrader")]
#[command(about = "Automated equity trading with pluggable brokers", long_about = None)]
struct Cli {
    /// Path to config.yaml
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Database URL (overrides config and DATABASE_URL)
    #[arg(short, long)]
    database: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the trading loop and the REST API
    Run {
        /// Simulate fills instead of sending orders
        #[arg(long)]
        dry_run: bool,
    },

    /// Start only the REST API
    Serve,

    /// Run a single pipeline pass and print what it did
    Cycle {
        /// Simulate fills instead of sending orders
        #[arg(long)]
        dry_run: bool,

        /// List signals recorded within this many hours after the report
        #[arg(long, default_value_t = 1)]
        signal_hours: i64,
    },

    /// Screen and score the symbol universe
    Screen {
        /// Maximum number of rows to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Show stored positions, trades and recent system events
    Status,

    /// Show the effective configuration
    Config,

    /// Manage broker selection and configuration
    Broker {
        #[command(subcommand)]
        command: BrokerCommands,
    },
}

#[derive(Subcommand)]
enum BrokerCommands {
    /// Show the active broker and its configuration state
    Status {
        /// Connect and fetch the account
        #[arg(long)]
        connect: bool,
    },

    /// Make a broker active by writing ACTIVE_BROKER to the env file
    Set {
        /// Broker directory name
        name: String,

        /// Env file to update
        #[arg(long, default_value = ".env")]
        env_file: PathBuf,
    },

    /// List discovered brokers
    List,

    /// Show the environment variables each broker reads
    Env,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let mut config = AppConfig::load_or_default(&cli.config)
        .with_context(|| format!("Failed to load {}", cli.config.display()))?;
    if let Some(url) = &cli.database {
        config.database.url = url.clone();
    }
    config.validate()?;

    let level = cli.log_level.clone().unwrap_or_else(|| config.logging.level.clone());
    init_tracing(&level, &config.logging)?;

    match cli.command {
        Commands::Run { dry_run } => {
            config.app.dry_run |= dry_run;
            let db = Database::new(&config.database.url).await?;
            let broker = create_broker(&config)?;
            let executor = Arc::new(OrderExecutor::new(Arc::clone(&broker), config.trading.execution.clone()));
            let shutdown = Arc::new(AtomicBool::new(false));

            let state = AppState {
                broker: Arc::clone(&broker),
                db: db.clone(),
                executor: Arc::clone(&executor),
                shutdown: Arc::clone(&shutdown),
                trading_enabled: true,
                dry_run: config.app.dry_run,
            };

            let mut orchestrator = Orchestrator::new(config.clone(), broker, db, executor, shutdown)?;
            orchestrator.initialize().await?;

            println!("\n=== {} ===", config.app.name);
            println!("Broker:           {}", state.broker.broker_name());
            println!("Mode:             {}", if config.app.dry_run { "DRY RUN (simulated fills)" } else { "LIVE TRADING" });
            println!("Loop interval:    {}s", config.trading.loop_interval_secs);
            println!("API:              http://{}:{}", config.app.host, config.app.port);
            println!("\nPress Ctrl+C to stop.\n");

            let host = config.app.host.clone();
            let port = config.app.port;
            let server = tokio::spawn(async move {
                api::serve(state, &host, port, async {
                    tokio::signal::ctrl_c().await.ok();
                })
                .await
            });

            if let Err(e) = orchestrator.run().await {
                error!(error = %e, "Trading loop error");
            }

            let status = orchestrator.status().await;
            println!("\nTracked symbols:  {}", status.tracked_symbols.len());
            println!("Open positions:   {}", status.monitored_positions);
            println!("Realized P&L:     ${:.2}", status.realized_pnl);

            if !server.is_finished() {
                info!("Trading stopped, API still serving until Ctrl+C");
            }
            server.await.context("API server task failed")??;
        }

        Commands::Serve => {
            let db = Database::new(&config.database.url).await?;
            let broker = create_broker(&config)?;
            broker
                .connect()
                .await
                .with_context(|| format!("Failed to connect to {}", broker.broker_name()))?;
            let executor = Arc::new(OrderExecutor::new(Arc::clone(&broker), config.trading.execution.clone()));

            let state = AppState {
                broker,
                db,
                executor,
                shutdown: Arc::new(AtomicBool::new(false)),
                trading_enabled: false,
                dry_run: config.app.dry_run,
            };
            api::serve(state, &config.app.host, config.app.port, async {
                tokio::signal::ctrl_c().await.ok();
            })
            .await?;
        }

        Commands::Cycle { dry_run, signal_hours } => {
            config.app.dry_run |= dry_run;
            let mut orchestrator = build_orchestrator(&config).await?;
            let report = orchestrator.run_cycle().await?;

            println!("\n=== Cycle Report ===");
            println!("Market open:        {}", if report.market_open { "Yes" } else { "No" });
            println!("Screened:           {}", report.screened);
            println!("Tracked symbols:    {}", report.tracked_symbols);
            println!("News signals:       {}", report.news_signals);
            println!("Strategy signals:   {}", report.strategy_signals);
            println!("Actionable signals: {}", report.actionable_signals);
            println!("Executed:           {}", report.executed);
            println!("Rejected:           {}", report.rejected);
            println!("Exits:              {}", report.exits);
            println!("Snapshot recorded:  {}", if report.snapshot_recorded { "Yes" } else { "No" });

            let signals = orchestrator.recent_signals(signal_hours).await?;
            if !signals.is_empty() {
                println!("\n{:<8} {:<5} {:>8} {:>6} {:>10} {:<10} REASON", "SYMBOL", "SIDE", "STRENGTH", "CONF", "PRICE", "STATUS");
                println!("{}", "-".repeat(70));
                for signal in &signals {
                    println!(
                        "{:<8} {:<5} {:>8.3} {:>6.2} {:>10.2} {:<10} {}",
                        truncate(&signal.symbol, 8),
                        signal.direction,
                        signal.strength,
                        signal.confidence,
                        signal.price,
                        signal.status,
                        signal.reason.as_deref().unwrap_or("-")
                    );
                }
            }
        }

        Commands::Screen { limit } => {
            let mut orchestrator = build_orchestrator(&config).await?;
            let scores = orchestrator.screen_universe().await;

            if scores.is_empty() {
                println!("No symbols passed screening.");
                return Ok(());
            }

            println!(
                "\n{:>4} {:<8} {:>7} {:>8} {:>7} {:>7} {:>9} {:>7}",
                "RANK", "SYMBOL", "SCORE", "MOMENTUM", "VOLUME", "VOLAT", "TECHNICAL", "CONF"
            );
            println!("{}", "-".repeat(66));
            for score in scores.iter().take(limit) {
                println!(
                    "{:>4} {:<8} {:>7.3} {:>8.3} {:>7.3} {:>7.3} {:>9.3} {:>7.2}",
                    score.rank,
                    truncate(&score.symbol, 8),
                    score.total_score,
                    score.momentum_score,
                    score.volume_score,
                    score.volatility_score,
                    score.technical_score,
                    score.confidence
                );
            }
        }

        Commands::Status => {
            let db = Database::new(&config.database.url).await?;
            let positions = db.get_open_positions().await?;
            let trades = db.recent_trades(10).await?;
            let logs = db.recent_logs(10).await?;
            let realized = db.total_realized_pnl().await?;
            let today = db.realized_pnl_today().await?;

            println!("\n=== P&L ===");
            println!("Realized (total): ${:.2}", realized);
            println!("Realized (today): ${:.2}", today);

            println!("\n=== Open Positions ({}) ===", positions.len());
            for pos in &positions {
                let pnl_sign = if pos.unrealized_pnl >= 0.0 { "+" } else { "" };
                println!(
                    "  {:<6} {:<5} {:>8.2} @ {:.2} -> {:.2} ({}${:.2})",
                    pos.symbol,
                    pos.side,
                    pos.quantity,
                    pos.entry_price,
                    pos.current_price,
                    pnl_sign,
                    pos.unrealized_pnl
                );
            }

            if !trades.is_empty() {
                println!("\n{:<20} {:<6} {:<5} {:>8} {:>10} {:<10}", "TIME", "SYMBOL", "SIDE", "QTY", "PRICE", "STATUS");
                println!("{}", "-".repeat(64));
                for trade in &trades {
                    println!(
                        "{:<20} {:<6} {:<5} {:>8.2} {:>10} {:<10}",
                        truncate(&trade.created_at, 20),
                        trade.symbol,
                        trade.side,
                        trade.quantity,
                        trade.price.map(|p| format!("{:.2}", p)).unwrap_or_else(|| "-".to_string()),
                        trade.status
                    );
                }
            }

            if !logs.is_empty() {
                println!("\n=== Recent Events ===");
                for entry in &logs {
                    println!(
                        "  {} [{}] {}: {}",
                        entry.timestamp,
                        entry.level,
                        entry.component,
                        truncate(&entry.message, 80)
                    );
                }
            }
        }

        Commands::Config => {
            let mut shown = config.clone();
            for value in shown.brokers.entries.values_mut() {
                redact_secrets(value);
            }
            if let Some(url) = shown.alerts.webhook_url.as_mut() {
                *url = mask(url);
            }
            println!("{}", serde_yaml::to_string(&shown)?);
        }

        Commands::Broker { command } => run_broker_command(command, &config).await?,
    }

    Ok(())
}

fn init_tracing(level: &str, logging: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_new(level.to_lowercase()).unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(logging.with_target);

    let result = match logging.format.as_str() {
        "compact" => builder.compact().try_init(),
        _ => builder.pretty().try_init(),
    };
    result.map_err(|e| anyhow!("Failed to initialize logging: {}", e))
}

/// Resolve the active broker (env, config, first enabled, first found) and
/// build its adapter.
fn create_broker(config: &AppConfig) -> Result<Arc<dyn BrokerAdapter>> {
    let factory = BrokerFactory::new(&config.brokers.directory);
    let active = resolve_active(&factory, config)?;
    info!(broker = %active.name, source = %active.source, "Using broker");

    let adapter = factory.create(&active.name, config.brokers.override_for(&active.name).as_ref())?;
    Ok(adapter)
}

fn resolve_active(factory: &BrokerFactory, config: &AppConfig) -> Result<ActiveBroker> {
    let env_value = std::env::var("ACTIVE_BROKER").ok();
    let active = factory.resolve_active(
        env_value.as_deref(),
        config.brokers.active.as_deref(),
        &config.brokers.overrides(),
    )?;
    Ok(active)
}

async fn build_orchestrator(config: &AppConfig) -> Result<Orchestrator> {
    let db = Database::new(&config.database.url).await?;
    let broker = create_broker(config)?;
    let executor = Arc::new(OrderExecutor::new(Arc::clone(&broker), config.trading.execution.clone()));
    let shutdown = Arc::new(AtomicBool::new(false));

    let mut orchestrator = Orchestrator::new(config.clone(), broker, db, executor, shutdown)?;
    orchestrator.initialize().await?;
    Ok(orchestrator)
}

// ==================== Broker Commands ====================

async fn run_broker_command(command: BrokerCommands, config: &AppConfig) -> Result<()> {
    let factory = BrokerFactory::new(&config.brokers.directory);
    let overrides = config.brokers.overrides();

    match command {
        BrokerCommands::Status { connect } => {
            let active = resolve_active(&factory, config)?;
            let global = config.brokers.override_for(&active.name);
            let settings = factory.settings_for(&active.name, global.as_ref())?;
            let missing = missing_fields(&active.name, &settings.values);

            println!("\n=== Broker Status ===");
            println!("Active broker:    {} (from {})", active.name, active.source);
            println!("Directory:        {}", factory.root().join(&active.name).display());
            println!("Compiled in:      {}", yes_no(factory.is_compiled_in(&active.name)));
            println!("Enabled:          {}", yes_no(factory.is_enabled(&active.name, &overrides)));
            if missing.is_empty() {
                println!("Configuration:    complete");
            } else {
                println!("Configuration:    missing {}", missing.join(", "));
            }

            if connect {
                let adapter = factory.create(&active.name, global.as_ref())?;
                adapter
                    .connect()
                    .await
                    .with_context(|| format!("Failed to connect to {}", active.name))?;
                let account = adapter.get_account().await?;
                let market_open = adapter.is_market_open().await?;

                println!("\n=== Account ===");
                println!("Account:          {}", account.account_id);
                println!("Status:           {}", account.status);
                println!("Portfolio value:  ${:.2}", account.portfolio_value);
                println!("Buying power:     ${:.2}", account.buying_power);
                println!("Cash:             ${:.2}", account.cash);
                println!("Market open:      {}", yes_no(market_open));

                adapter.disconnect().await?;
            }
        }

        BrokerCommands::Set { name, env_file } => {
            factory.ensure_available(&name)?;
            set_env_file_var(&env_file, "ACTIVE_BROKER", &name)
                .with_context(|| format!("Failed to update {}", env_file.display()))?;

            if !factory.is_enabled(&name, &overrides) {
                println!("Note: {} is not marked enabled in its config", name);
            }
            println!("Active broker set to {} in {}", name, env_file.display());
        }

        BrokerCommands::List => {
            let discovered = factory.discover();
            if discovered.is_empty() {
                println!("No brokers found under {}", factory.root().display());
                return Ok(());
            }

            let active = resolve_active(&factory, config).ok().map(|a| a.name);

            println!("\n{:<2} {:<16} {:<28} {:>8} {:>9}", "", "BROKER", "ADAPTER", "ENABLED", "COMPILED");
            println!("{}", "-".repeat(67));
            for broker in &discovered {
                let marker = if active.as_deref() == Some(broker.name.as_str()) { "*" } else { "" };
                println!(
                    "{:<2} {:<16} {:<28} {:>8} {:>9}",
                    marker,
                    truncate(&broker.name, 16),
                    truncate(&broker.adapter, 28),
                    yes_no(factory.is_enabled(&broker.name, &overrides)),
                    yes_no(factory.is_compiled_in(&broker.name))
                );
            }
        }

        BrokerCommands::Env => {
            for broker in factory.discover() {
                let global = config.brokers.override_for(&broker.name);
                let settings = factory.settings_for(&broker.name, global.as_ref())?;
                let vars = settings.env_var_names();

                println!("\n[{}]", broker.name);
                if vars.is_empty() {
                    println!("  (no environment variables)");
                    continue;
                }
                for var in vars {
                    let shown = match std::env::var(&var) {
                        Ok(value) if !value.is_empty() => mask(&value),
                        _ => "(not set)".to_string(),
                    };
                    println!("  {:<28} {}", var, shown);
                }
            }
            let active = std::env::var("ACTIVE_BROKER").unwrap_or_else(|_| "(not set)".to_string());
            println!("\n  {:<28} {}", "ACTIVE_BROKER", active);
        }
    }

    Ok(())
}

fn yes_no(value: bool) -> &'static str {
    if value {
        "yes"
    } else {
        "no"
    }
}

/// First four characters, then asterisks.
fn mask(value: &str) -> String {
    let prefix: String = value.chars().take(4).collect();
    format!("{}****", prefix)
}

fn redact_secrets(value: &mut Value) {
    if let Value::Object(map) = value {
        for (key, v) in map.iter_mut() {
            if key == "env_vars" {
                continue;
            }
            match v {
                Value::String(s) if key.contains("key") || key.contains("secret") => *s = mask(s),
                _ => redact_secrets(v),
            }
        }
    }
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_signal_window() {
        let cli = Cli::try_parse_from(["autotrader", "cycle", "--dry-run", "--signal-hours", "6"]).unwrap();
        match cli.command {
            Commands::Cycle { dry_run, signal_hours } => {
                assert!(dry_run);
                assert_eq!(signal_hours, 6);
            }
            _ => panic!("expected cycle"),
        }

        let cli = Cli::try_parse_from(["autotrader", "cycle"]).unwrap();
        assert!(matches!(cli.command, Commands::Cycle { dry_run: false, signal_hours: 1 }));
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("AAPL", 8), "AAPL");
        assert_eq!(truncate("VERYLONGNAME", 8), "VERYL...");
    }
}
