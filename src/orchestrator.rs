//! Trading orchestrator: the main loop.
//!
//! Each tick runs whatever stages are due:
//! - screening and scoring of the symbol universe
//! - market data refresh for tracked symbols
//! - strategy evaluation, aggregation and risk-checked entries
//! - position monitoring with exits and alerts
//! - portfolio snapshots

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use futures::future::join_all;
use rust_decimal::prelude::*;
use serde::Serialize;
use serde_json::json;
use tokio::sync::RwLock;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::alerts::{Alert, AlertLevel, AlertSink};
use crate::broker::{AccountInfo, Bar, BrokerAdapter, OrderRequest, OrderSide, Position, PositionSide};
use crate::config::AppConfig;
use crate::db::{Database, OpenPosition, StoredSignal, TradeRecord};
use crate::models::{AggregatedSignal, MarketSnapshot, PortfolioSummary, SignalDirection, StrategySignal};
use crate::trading::{
    AlertKind, ExecutionResult, ExitReason, ExitSignal, MonitoredPosition, NewsAnalyzer, OrderExecutor,
    PositionMonitor, RiskManager, ScreenResult, SignalAggregator, StockScore, StockScorer, StockScreener,
    StrategyEngine,
};

/// Mutable runtime state shared across ticks.
#[derive(Debug, Default)]
struct OrchestratorState {
    tracked_symbols: Vec<String>,
    market_data: HashMap<String, Vec<Bar>>,
    latest_signals: Vec<AggregatedSignal>,
    /// Signals from the last news refresh, fed into every aggregation until replaced
    news_signals: Vec<StrategySignal>,
    /// Pending sell signal ids handed to the monitor as technical exits
    pending_exits: HashMap<String, i64>,
    last_screening: Option<DateTime<Utc>>,
    last_market_data: Option<DateTime<Utc>>,
    last_news_update: Option<DateTime<Utc>>,
    last_strategy_run: Option<DateTime<Utc>>,
    last_monitoring: Option<DateTime<Utc>>,
    last_snapshot: Option<DateTime<Utc>>,
    realized_pnl: Decimal,
    day_start_value: Option<(NaiveDate, Decimal)>,
    halted_on: Option<NaiveDate>,
    /// `symbol:kind` keys already alerted for open positions
    alerted: HashSet<String>,
}

/// Point-in-time view of the orchestrator for status output.
#[derive(Debug, Clone, Serialize)]
pub struct OrchestratorStatus {
    pub running: bool,
    pub dry_run: bool,
    pub tracked_symbols: Vec<String>,
    pub monitored_positions: usize,
    pub latest_signals: usize,
    pub realized_pnl: Decimal,
    pub last_screening: Option<DateTime<Utc>>,
    pub last_news_update: Option<DateTime<Utc>>,
    pub last_strategy_run: Option<DateTime<Utc>>,
    pub last_monitoring: Option<DateTime<Utc>>,
    pub last_snapshot: Option<DateTime<Utc>>,
}

/// What one pipeline pass did.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CycleReport {
    pub market_open: bool,
    pub screened: usize,
    pub tracked_symbols: usize,
    pub news_signals: usize,
    pub strategy_signals: usize,
    pub actionable_signals: usize,
    pub executed: usize,
    pub rejected: usize,
    pub exits: usize,
    pub snapshot_recorded: bool,
}

/// Whether a stage last run at `last` is due again.
fn is_due(last: Option<DateTime<Utc>>, every_secs: u64, now: DateTime<Utc>) -> bool {
    match last {
        None => true,
        Some(at) => (now - at).num_seconds() >= every_secs as i64,
    }
}

fn is_opposite(direction: SignalDirection, side: PositionSide) -> bool {
    matches!(
        (direction, side),
        (SignalDirection::Sell, PositionSide::Long) | (SignalDirection::Buy, PositionSide::Short)
    )
}

fn to_decimal(value: f64) -> Decimal {
    Decimal::from_f64(value).unwrap_or_default().round_dp(6)
}

fn as_position(p: &MonitoredPosition) -> Position {
    let signed = match p.side {
        PositionSide::Long => p.quantity,
        PositionSide::Short => -p.quantity,
    };
    Position::new(&p.symbol, signed, p.entry_price, p.current_price)
}

/// Drives the trading pipeline.
pub struct Orchestrator {
    config: AppConfig,
    broker: Arc<dyn BrokerAdapter>,
    db: Database,
    executor: Arc<OrderExecutor>,
    alerts: AlertSink,
    screener: StockScreener,
    scorer: StockScorer,
    strategies: StrategyEngine,
    news: NewsAnalyzer,
    aggregator: SignalAggregator,
    risk: RiskManager,
    monitor: PositionMonitor,
    dry_run: bool,

    state: Arc<RwLock<OrchestratorState>>,
    shutdown: Arc<AtomicBool>,
}

impl Orchestrator {
    pub fn new(
        config: AppConfig,
        broker: Arc<dyn BrokerAdapter>,
        db: Database,
        executor: Arc<OrderExecutor>,
        shutdown: Arc<AtomicBool>,
    ) -> Result<Self> {
        let scorer = StockScorer::new(
            config.scoring.weights.clone(),
            config.scoring.top_n,
            config.scoring.min_score_threshold,
        )?;
        let aggregator = SignalAggregator::new(&config.strategies.aggregation, config.aggregation_weights())?;
        let strategies = StrategyEngine::from_definitions(&config.strategies.definitions);
        let alerts = AlertSink::new(config.alerts.clone(), Some(db.clone()))?;

        info!(
            strategies = strategies.len(),
            aggregation = %aggregator.method(),
            dry_run = config.app.dry_run,
            "Orchestrator created"
        );

        Ok(Self {
            screener: StockScreener::new(config.screening.criteria.clone()),
            scorer,
            strategies,
            news: NewsAnalyzer::new(config.news.clone()),
            aggregator,
            risk: RiskManager::new(&config.risk),
            monitor: PositionMonitor::new(config.monitoring.exit.clone(), config.monitoring.alerts.clone()),
            dry_run: config.app.dry_run,
            alerts,
            broker,
            db,
            executor,
            config,
            state: Arc::new(RwLock::new(OrchestratorState::default())),
            shutdown,
        })
    }

    /// Connect the broker and restore open positions and realized P&L.
    pub async fn initialize(&mut self) -> Result<()> {
        if !self.broker.is_connected() {
            self.broker
                .connect()
                .await
                .with_context(|| format!("Failed to connect to {}", self.broker.broker_name()))?;
        }

        let realized = to_decimal(self.db.total_realized_pnl().await?);
        let stored = self.db.get_open_positions().await?;
        let now = Utc::now();
        for p in &stored {
            let side = if p.side == "short" { PositionSide::Short } else { PositionSide::Long };
            let opened_at = p.opened_at_utc().unwrap_or(now);
            let mut position = MonitoredPosition::new(
                &p.symbol,
                side,
                to_decimal(p.quantity),
                to_decimal(p.entry_price),
                opened_at,
            )
            .with_stops(p.stop_loss_price.map(to_decimal), p.take_profit_price.map(to_decimal));
            position.current_price = to_decimal(p.current_price);
            position.peak_price = to_decimal(p.peak_price);
            self.monitor.track(position);
        }

        {
            let mut state = self.state.write().await;
            state.realized_pnl = realized;
            state.tracked_symbols = self.config.base_symbols.0.clone();
        }

        info!(
            broker = %self.broker.broker_name(),
            restored_positions = stored.len(),
            realized_pnl = %realized,
            dry_run = self.dry_run,
            "Orchestrator initialized"
        );
        Ok(())
    }

    /// Main run loop.
    pub async fn run(&mut self) -> Result<()> {
        let trading = self.config.trading.clone();
        info!(
            dry_run = self.dry_run,
            loop_interval = trading.loop_interval_secs,
            "Starting trading loop"
        );
        self.log_event("info", "Trading started", None).await;

        let mut ticker = interval(Duration::from_secs(trading.loop_interval_secs.max(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            info!("Shutdown signal received");
            shutdown.store(true, Ordering::SeqCst);
        });

        while !self.shutdown.load(Ordering::SeqCst) {
            ticker.tick().await;
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }

            match self.run_cycle().await {
                Ok(report) if !report.market_open => {
                    self.sleep_while_running(trading.closed_market_sleep_secs).await;
                }
                Ok(report) => debug!(?report, "Cycle complete"),
                Err(e) => {
                    error!(error = %e, "Error in trading cycle");
                    self.log_event("error", &format!("Cycle failed: {:#}", e), None).await;
                    self.sleep_while_running(trading.error_sleep_secs).await;
                }
            }
        }

        self.stop().await
    }

    async fn sleep_while_running(&self, secs: u64) {
        for _ in 0..secs {
            if self.shutdown.load(Ordering::SeqCst) {
                return;
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }

    async fn stop(&self) -> Result<()> {
        if let Err(e) = self.broker.disconnect().await {
            warn!(error = %e, "Broker disconnect failed");
        }
        self.log_event("info", "Trading stopped", None).await;
        info!("Orchestrator stopped");
        Ok(())
    }

    async fn log_event(&self, level: &str, message: &str, details: Option<serde_json::Value>) {
        if !self.config.logging.persist {
            return;
        }
        if let Err(e) = self.db.log_event(level, "orchestrator", message, details.as_ref()).await {
            warn!(error = %e, "Failed to persist system log");
        }
    }

    /// Run every due stage once.
    pub async fn run_cycle(&mut self) -> Result<CycleReport> {
        let now = Utc::now();
        let mut report = CycleReport::default();

        if !self
            .broker
            .is_market_open()
            .await
            .context("Failed to check market hours")?
        {
            info!("Market closed, skipping cycle");
            return Ok(report);
        }
        report.market_open = true;

        let cadence = self.config.data_updates.clone();
        let (last_screening, last_market_data, last_news_update, last_strategy_run, last_monitoring, last_snapshot) = {
            let state = self.state.read().await;
            (
                state.last_screening,
                state.last_market_data,
                state.last_news_update,
                state.last_strategy_run,
                state.last_monitoring,
                state.last_snapshot,
            )
        };

        if is_due(last_screening, cadence.screening_interval_secs, now) {
            report.screened = self.update_screening(now).await?;
        }

        if is_due(last_market_data, cadence.market_data_interval_secs, now) {
            self.refresh_market_data(now).await;
        }

        if self.config.news.enabled && is_due(last_news_update, cadence.news_interval_secs, now) {
            report.news_signals = self.update_news(now).await?;
        }

        if is_due(last_strategy_run, cadence.strategy_interval_secs, now) {
            let actionable = self.evaluate_strategies(now, &mut report).await?;
            report.actionable_signals = actionable.len();
            if !actionable.is_empty() {
                self.process_signals(actionable, now, &mut report).await?;
            }
        }

        if self.config.monitoring.enabled && is_due(last_monitoring, cadence.monitoring_interval_secs, now) {
            self.monitor_positions(now, &mut report).await?;
        }

        if is_due(last_snapshot, cadence.snapshot_interval_secs, now) {
            self.record_snapshot(now).await?;
            report.snapshot_recorded = true;
        }

        report.tracked_symbols = self.state.read().await.tracked_symbols.len();
        info!(
            tracked = report.tracked_symbols,
            signals = report.actionable_signals,
            executed = report.executed,
            rejected = report.rejected,
            exits = report.exits,
            "Trading cycle complete"
        );
        Ok(report)
    }

    // ==================== Screening ====================

    /// Screen and score the universe, then rebuild the tracked set.
    async fn update_screening(&mut self, now: DateTime<Utc>) -> Result<usize> {
        let base = self.config.base_symbols.0.clone();
        if !(self.config.trading.enable_automated_screening && self.config.screening.enabled) {
            let mut state = self.state.write().await;
            state.tracked_symbols = base;
            state.last_screening = Some(now);
            return Ok(0);
        }

        let universe = self.config.screening_universe();
        let (passed, scores, mut bars) = self.screen_and_score(&universe, now).await;

        let mut tracked = base;
        let mut added = 0;
        for score in &scores {
            if added >= self.config.trading.max_screened_symbols {
                break;
            }
            if !tracked.contains(&score.symbol) {
                tracked.push(score.symbol.clone());
                added += 1;
            }
        }

        info!(
            universe = universe.len(),
            passed = passed.len(),
            scored = scores.len(),
            tracked = tracked.len(),
            "Screening updated tracked symbols"
        );

        let mut state = self.state.write().await;
        for symbol in &tracked {
            if let Some(series) = bars.remove(symbol) {
                state.market_data.insert(symbol.clone(), series);
            }
        }
        state.tracked_symbols = tracked;
        state.last_screening = Some(now);
        Ok(passed.len())
    }

    /// Screen `universe`, then score the symbols that passed.
    async fn screen_and_score(
        &mut self,
        universe: &[String],
        now: DateTime<Utc>,
    ) -> (Vec<ScreenResult>, Vec<StockScore>, HashMap<String, Vec<Bar>>) {
        let bars = self.fetch_bars(universe).await;
        let snapshots: Vec<MarketSnapshot> = universe
            .iter()
            .filter_map(|symbol| {
                let series = bars.get(symbol)?;
                MarketSnapshot::from_bars(symbol, series)
                    .map(|s| s.with_sector(self.config.risk.sectors.get(symbol).cloned()))
            })
            .collect();

        let passed = self.screener.screen(&snapshots, now);
        let candidates: Vec<MarketSnapshot> = snapshots
            .into_iter()
            .filter(|s| passed.iter().any(|r| r.symbol == s.symbol))
            .collect();
        let scores = self.scorer.score(&candidates, now);
        (passed, scores, bars)
    }

    /// One-off screening pass over the configured universe, ranked by score.
    pub async fn screen_universe(&mut self) -> Vec<StockScore> {
        let universe = self.config.screening_universe();
        let (_, scores, _) = self.screen_and_score(&universe, Utc::now()).await;
        scores
    }

    // ==================== Market Data ====================

    /// Fetch bars concurrently. Symbols that fail or return nothing are left out.
    async fn fetch_bars(&self, symbols: &[String]) -> HashMap<String, Vec<Bar>> {
        let timeframe = self.config.trading.bar_timeframe.as_str();
        let limit = self.config.trading.bar_limit;
        let broker = &self.broker;

        let requests = symbols.iter().map(|symbol| async move {
            (symbol.clone(), broker.get_bars(symbol, timeframe, limit).await)
        });

        join_all(requests)
            .await
            .into_iter()
            .filter_map(|(symbol, result)| match result {
                Ok(bars) if !bars.is_empty() => Some((symbol, bars)),
                Ok(_) => {
                    debug!(symbol = %symbol, "No bars returned");
                    None
                }
                Err(e) => {
                    warn!(symbol = %symbol, error = %e, "Failed to fetch bars");
                    None
                }
            })
            .collect()
    }

    async fn refresh_market_data(&self, now: DateTime<Utc>) {
        let mut symbols = self.state.read().await.tracked_symbols.clone();
        for position in self.monitor.positions() {
            if !symbols.contains(&position.symbol) {
                symbols.push(position.symbol.clone());
            }
        }

        let bars = self.fetch_bars(&symbols).await;
        debug!(requested = symbols.len(), received = bars.len(), "Market data refreshed");

        let mut state = self.state.write().await;
        state.market_data = bars;
        state.last_market_data = Some(now);
    }

    // ==================== News ====================

    /// Score recent news for the tracked symbols, feed the sentiment to the
    /// scorer and keep the resulting signals for aggregation. A failed fetch
    /// keeps the previous signals.
    async fn update_news(&mut self, now: DateTime<Utc>) -> Result<usize> {
        let symbols = self.state.read().await.tracked_symbols.clone();
        let articles = match self.broker.get_news(&symbols, self.news.config().article_limit).await {
            Ok(articles) => articles,
            Err(e) => {
                warn!(error = %e, "Failed to fetch news");
                self.state.write().await.last_news_update = Some(now);
                return Ok(0);
            }
        };

        let summaries = self.news.analyze_all(&symbols, &articles, now);
        let mut signals = Vec::new();
        {
            let state = self.state.read().await;
            for (symbol, summary) in &summaries {
                if summary.article_count == 0 {
                    continue;
                }
                self.scorer.set_sentiment(symbol, summary.score);
                let price = state
                    .market_data
                    .get(symbol)
                    .and_then(|bars| bars.last())
                    .map(|bar| bar.close);
                if let Some(signal) = price.and_then(|p| self.news.to_signal(summary, p, now)) {
                    signals.push(signal);
                }
            }
        }

        for signal in &signals {
            self.db.save_strategy_signal(signal).await?;
        }
        info!(
            articles = articles.len(),
            symbols_with_news = summaries.values().filter(|s| s.article_count > 0).count(),
            signals = signals.len(),
            "News sentiment updated"
        );

        let count = signals.len();
        let mut state = self.state.write().await;
        state.news_signals = signals;
        state.last_news_update = Some(now);
        Ok(count)
    }

    // ==================== Signals ====================

    /// Run strategies, persist their signals and return the actionable
    /// aggregated decisions.
    async fn evaluate_strategies(&self, now: DateTime<Utc>, report: &mut CycleReport) -> Result<Vec<AggregatedSignal>> {
        let (signals, news_signals): (Vec<StrategySignal>, Vec<StrategySignal>) = {
            let state = self.state.read().await;
            let signals = self
                .strategies
                .run_all(&state.market_data, now)
                .into_values()
                .flatten()
                .collect();
            (signals, state.news_signals.clone())
        };
        report.strategy_signals = signals.len();

        for signal in &signals {
            self.db.save_strategy_signal(signal).await?;
        }
        let signals: Vec<StrategySignal> = signals.into_iter().chain(news_signals).collect();

        let expired = self
            .db
            .expire_pending_signals(self.config.strategies.aggregation.lookback_minutes)
            .await?;
        if expired > 0 {
            debug!(expired = expired, "Expired stale pending signals");
        }

        let actionable = self.aggregator.filter_actionable(self.aggregator.aggregate(&signals, now));
        for signal in &actionable {
            info!(
                symbol = %signal.symbol,
                direction = %signal.direction,
                strength = signal.strength,
                confidence = signal.confidence,
                strategies = signal.signal_count,
                "Actionable signal"
            );
        }

        let mut state = self.state.write().await;
        state.latest_signals = actionable.clone();
        state.last_strategy_run = Some(now);
        Ok(actionable)
    }

    /// Positions the risk manager should see: the broker's book when live,
    /// the simulated book in dry run.
    async fn current_positions(&self) -> Result<Vec<Position>> {
        if self.dry_run {
            return Ok(self.monitor.positions().map(as_position).collect());
        }
        self.broker.get_positions().await.context("Failed to fetch positions")
    }

    /// Today's P&L. Dry runs use realized plus unrealized simulated P&L;
    /// live runs compare portfolio value to the first value seen today.
    async fn daily_pnl(&self, account: &AccountInfo) -> Result<Decimal> {
        if self.dry_run {
            let realized = to_decimal(self.db.realized_pnl_today().await?);
            return Ok(realized + self.monitor.summary().total_unrealized_pnl);
        }

        let today = Utc::now().date_naive();
        let mut state = self.state.write().await;
        let baseline = match state.day_start_value {
            Some((day, value)) if day == today => value,
            _ => {
                let value = match self.db.first_snapshot_today().await? {
                    Some(snapshot) => to_decimal(snapshot.portfolio_value),
                    None => account.portfolio_value,
                };
                state.day_start_value = Some((today, value));
                value
            }
        };
        Ok(account.portfolio_value - baseline)
    }

    async fn reject_signal(&self, id: i64, reason: &str) -> Result<()> {
        self.db.update_signal_status(id, "rejected", Some(reason)).await
    }

    /// Risk-check and execute aggregated signals.
    async fn process_signals(
        &mut self,
        signals: Vec<AggregatedSignal>,
        now: DateTime<Utc>,
        report: &mut CycleReport,
    ) -> Result<()> {
        let mut account = self.broker.get_account().await.context("Failed to fetch account")?;
        let mut positions = self.current_positions().await?;
        let daily_pnl = self.daily_pnl(&account).await?;

        let (halted, halt_reason) = self.risk.should_halt_trading(daily_pnl, account.portfolio_value);
        if halted {
            self.on_halt(&halt_reason).await;
        }

        let mut suspension_logged = false;
        for signal in signals {
            let signal_id = self.db.save_aggregated_signal(&signal).await?;
            let held = positions.iter().find(|p| p.symbol == signal.symbol).map(|p| p.side);

            match signal.direction {
                SignalDirection::Sell => {
                    if held == Some(PositionSide::Long) {
                        // Closed by the monitor as a technical exit
                        self.state
                            .write()
                            .await
                            .pending_exits
                            .insert(signal.symbol.clone(), signal_id);
                    } else {
                        self.reject_signal(signal_id, "No open long position to sell").await?;
                        report.rejected += 1;
                    }
                    continue;
                }
                SignalDirection::Hold => continue,
                SignalDirection::Buy => {}
            }

            if halted {
                self.reject_signal(signal_id, &format!("Trading halted: {}", halt_reason))
                    .await?;
                report.rejected += 1;
                continue;
            }

            if positions.len() >= self.config.trading.max_positions {
                if !suspension_logged {
                    info!(
                        open = positions.len(),
                        max = self.config.trading.max_positions,
                        "Max positions reached, suspending new entries"
                    );
                    suspension_logged = true;
                }
                self.reject_signal(signal_id, "Entry suspended: max positions reached").await?;
                report.rejected += 1;
                continue;
            }

            let check = self.risk.check_signal(&signal, &account, &positions, daily_pnl);
            if !check.passed {
                let reason = check
                    .reason
                    .clone()
                    .unwrap_or_else(|| "Failed risk checks".to_string());
                self.reject_signal(signal_id, &reason).await?;
                if self.config.logging.persist {
                    self.db
                        .log_event(
                            "warning",
                            "risk",
                            &format!("{} rejected: {}", signal.symbol, reason),
                            Some(&json!({ "signal_id": signal_id, "checks": check.checks })),
                        )
                        .await?;
                }
                report.rejected += 1;
                continue;
            }

            match self.enter_position(&signal, signal_id, check.position_size, now).await? {
                Some(position) => {
                    account.buying_power -= position.market_value;
                    account.cash -= position.market_value;
                    positions.push(position);
                    report.executed += 1;
                }
                None => report.rejected += 1,
            }
        }
        Ok(())
    }

    async fn on_halt(&self, reason: &str) {
        let today = Utc::now().date_naive();
        {
            let mut state = self.state.write().await;
            if state.halted_on == Some(today) {
                return;
            }
            state.halted_on = Some(today);
        }
        self.alerts
            .send(Alert::new(
                AlertLevel::Critical,
                "risk",
                format!("New entries halted: {}", reason),
            ))
            .await;
    }

    async fn place(&self, order: &OrderRequest, reference_price: Decimal) -> ExecutionResult {
        if self.dry_run {
            self.executor.simulate(order, reference_price).await
        } else {
            self.executor.execute(order).await
        }
    }

    async fn record_trade(
        &self,
        order: &OrderRequest,
        result: &ExecutionResult,
        strategy: Option<&str>,
        signal_id: Option<i64>,
    ) -> Result<()> {
        self.db
            .record_trade(&TradeRecord::from_execution(order, result, strategy, signal_id))
            .await?;
        Ok(())
    }

    /// Open a long position for a passing buy signal.
    async fn enter_position(
        &mut self,
        signal: &AggregatedSignal,
        signal_id: i64,
        position_size: Decimal,
        now: DateTime<Utc>,
    ) -> Result<Option<Position>> {
        let (stop_loss, take_profit) = self.risk.stop_loss_take_profit(signal.price, OrderSide::Buy);
        let Some(order) = self
            .executor
            .build_order(signal, position_size, Some((stop_loss, take_profit)))
        else {
            self.reject_signal(signal_id, "Position size too small").await?;
            return Ok(None);
        };

        let result = self.place(&order, signal.price).await;
        let strategies = signal.contributing_strategies.join(",");
        self.record_trade(&order, &result, Some(&strategies), Some(signal_id))
            .await?;

        if !result.success {
            let reason = result
                .error
                .clone()
                .unwrap_or_else(|| format!("Order {}", result.status));
            self.reject_signal(signal_id, &reason).await?;
            self.alerts
                .send(
                    Alert::new(
                        AlertLevel::Warning,
                        "executor",
                        format!("Order for {} failed: {}", signal.symbol, reason),
                    )
                    .with_details(json!({ "signal_id": signal_id, "attempts": result.attempts })),
                )
                .await;
            return Ok(None);
        }

        let entry = result.filled_price.unwrap_or(signal.price);
        self.db
            .open_position(&OpenPosition {
                symbol: &signal.symbol,
                side: PositionSide::Long.as_str(),
                quantity: result.filled_quantity,
                entry_price: entry,
                stop_loss_price: Some(stop_loss),
                take_profit_price: Some(take_profit),
            })
            .await?;
        self.monitor.track(
            MonitoredPosition::new(&signal.symbol, PositionSide::Long, result.filled_quantity, entry, now)
                .with_stops(Some(stop_loss), Some(take_profit)),
        );
        self.db
            .update_signal_status(signal_id, "executed", result.order_id.as_deref())
            .await?;

        info!(
            symbol = %signal.symbol,
            quantity = %result.filled_quantity,
            price = %entry,
            stop_loss = %stop_loss,
            take_profit = %take_profit,
            "Position opened"
        );
        Ok(Some(Position::new(&signal.symbol, result.filled_quantity, entry, entry)))
    }

    // ==================== Monitoring ====================

    async fn monitor_positions(&mut self, now: DateTime<Utc>, report: &mut CycleReport) -> Result<()> {
        if self.dry_run {
            let symbols: Vec<String> = self.monitor.positions().map(|p| p.symbol.clone()).collect();
            if !symbols.is_empty() {
                let quotes = self.broker.get_quotes(&symbols).await.context("Failed to fetch quotes")?;
                for quote in quotes {
                    self.monitor.update_price(&quote.symbol, quote.mid());
                }
            }
        } else {
            let positions = self.broker.get_positions().await.context("Failed to fetch positions")?;
            for closed in self.monitor.sync(&positions, now) {
                self.settle_broker_close(&closed).await?;
                report.exits += 1;
            }
        }

        for position in self.monitor.positions() {
            self.db
                .update_position_price(&position.symbol, position.current_price, position.peak_price)
                .await?;
        }

        let technical: Vec<String> = {
            let state = self.state.read().await;
            self.monitor
                .positions()
                .filter(|p| {
                    state
                        .latest_signals
                        .iter()
                        .any(|s| s.symbol == p.symbol && is_opposite(s.direction, p.side))
                })
                .map(|p| p.symbol.clone())
                .collect()
        };

        for (position, exit) in self.monitor.check_all(now, &technical) {
            if self.exit_position(&position, &exit).await? {
                report.exits += 1;
            }
        }

        self.send_position_alerts().await;
        self.state.write().await.last_monitoring = Some(now);
        Ok(())
    }

    /// Close a monitored position. Returns whether the exit filled.
    async fn exit_position(&mut self, position: &MonitoredPosition, exit: &ExitSignal) -> Result<bool> {
        let book = as_position(position);
        let order = OrderRequest::market(&book.symbol, book.side.closing_side(), book.abs_quantity());
        let result = if self.dry_run {
            self.executor.simulate(&order, position.current_price).await
        } else {
            self.executor.exit_position(&book).await
        };
        self.record_trade(&order, &result, Some(exit.reason.as_str()), None)
            .await?;

        if !result.success {
            self.alerts
                .send(Alert::new(
                    AlertLevel::Warning,
                    "monitor",
                    format!(
                        "Exit for {} ({}) failed: {}",
                        position.symbol,
                        exit.reason,
                        result.error.as_deref().unwrap_or(result.status.as_str())
                    ),
                ))
                .await;
            return Ok(false);
        }

        let exit_price = result.filled_price.unwrap_or(position.current_price);
        let realized = match self
            .db
            .close_position(&position.symbol, exit_price, exit.reason.as_str())
            .await?
        {
            Some(pnl) => to_decimal(pnl),
            None => position.unrealized_pnl(),
        };
        self.monitor.untrack(&position.symbol);

        let pending_signal = {
            let mut state = self.state.write().await;
            state.realized_pnl += realized;
            let prefix = format!("{}:", position.symbol);
            state.alerted.retain(|key| !key.starts_with(&prefix));
            state.pending_exits.remove(&position.symbol)
        };
        if let Some(id) = pending_signal {
            self.db
                .update_signal_status(id, "executed", Some(exit.reason.as_str()))
                .await?;
        }

        self.alerts
            .send(
                Alert::new(
                    AlertLevel::Info,
                    "monitor",
                    format!(
                        "Exited {} ({}): realized P&L {}",
                        position.symbol,
                        exit.reason,
                        realized.round_dp(2)
                    ),
                )
                .with_details(json!({ "message": exit.message, "exit_price": exit_price })),
            )
            .await;
        Ok(true)
    }

    /// Book a position the broker closed outside this process (bracket leg,
    /// manual close) at its last known price.
    async fn settle_broker_close(&mut self, position: &MonitoredPosition) -> Result<()> {
        let reason = ExitReason::BrokerClosed.as_str();
        let realized = match self
            .db
            .close_position(&position.symbol, position.current_price, reason)
            .await?
        {
            Some(pnl) => to_decimal(pnl),
            None => position.unrealized_pnl(),
        };

        let pending_signal = {
            let mut state = self.state.write().await;
            state.realized_pnl += realized;
            let prefix = format!("{}:", position.symbol);
            state.alerted.retain(|key| !key.starts_with(&prefix));
            state.pending_exits.remove(&position.symbol)
        };
        if let Some(id) = pending_signal {
            self.db.update_signal_status(id, "executed", Some(reason)).await?;
        }

        warn!(
            symbol = %position.symbol,
            price = %position.current_price,
            realized_pnl = %realized,
            "Position closed at broker"
        );
        self.alerts
            .send(
                Alert::new(
                    AlertLevel::Warning,
                    "monitor",
                    format!(
                        "{} was closed at the broker: realized P&L {}",
                        position.symbol,
                        realized.round_dp(2)
                    ),
                )
                .with_details(json!({
                    "exit_reason": reason,
                    "last_price": position.current_price,
                    "quantity": position.quantity,
                })),
            )
            .await;
        Ok(())
    }

    /// Alert once per position and alert kind.
    async fn send_position_alerts(&self) {
        let fresh: Vec<_> = {
            let mut state = self.state.write().await;
            self.monitor
                .all_alerts()
                .into_iter()
                .filter(|alert| state.alerted.insert(format!("{}:{:?}", alert.symbol, alert.kind)))
                .collect()
        };

        for alert in fresh {
            let level = match alert.kind {
                AlertKind::LargeGain => AlertLevel::Info,
                AlertKind::LargeLoss | AlertKind::NearStopLoss => AlertLevel::Warning,
            };
            self.alerts
                .send(
                    Alert::new(level, "monitor", alert.message.clone())
                        .with_details(json!({ "symbol": alert.symbol, "pnl_percent": alert.pnl_percent })),
                )
                .await;
        }
    }

    // ==================== Portfolio ====================

    async fn record_snapshot(&self, now: DateTime<Utc>) -> Result<()> {
        let summary = self.portfolio_summary().await?;
        let account = self.broker.get_account().await.context("Failed to fetch account")?;
        let daily_pnl = self.daily_pnl(&account).await?;
        self.db.record_snapshot(&summary, daily_pnl).await?;
        self.state.write().await.last_snapshot = Some(now);
        debug!(value = %summary.account_value, daily_pnl = %daily_pnl, "Portfolio snapshot recorded");
        Ok(())
    }

    pub async fn portfolio_summary(&self) -> Result<PortfolioSummary> {
        let account = self.broker.get_account().await.context("Failed to fetch account")?;
        let positions = self.current_positions().await?;
        let realized = self.state.read().await.realized_pnl;
        Ok(PortfolioSummary::build(&account, &positions, realized))
    }

    pub async fn recent_signals(&self, hours: i64) -> Result<Vec<StoredSignal>> {
        self.db.recent_signals(hours, 100).await
    }

    pub async fn status(&self) -> OrchestratorStatus {
        let state = self.state.read().await;
        OrchestratorStatus {
            running: !self.shutdown.load(Ordering::SeqCst),
            dry_run: self.dry_run,
            tracked_symbols: state.tracked_symbols.clone(),
            monitored_positions: self.monitor.len(),
            latest_signals: state.latest_signals.len(),
            realized_pnl: state.realized_pnl,
            last_screening: state.last_screening,
            last_news_update: state.last_news_update,
            last_strategy_run: state.last_strategy_run,
            last_monitoring: state.last_monitoring,
            last_snapshot: state.last_snapshot,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{DemoBrokerAdapter, NewsArticle};
    use crate::trading::{ExitReason, NEWS_STRATEGY};
    use chrono::Duration as ChronoDuration;
    use rust_decimal_macros::dec;

    async fn setup(dry_run: bool) -> (Orchestrator, Arc<DemoBrokerAdapter>, Database) {
        let demo = Arc::new(DemoBrokerAdapter::unauthenticated());
        demo.connect().await.unwrap();
        let broker: Arc<dyn BrokerAdapter> = demo.clone();
        let db = Database::in_memory().await.unwrap();

        let mut config = AppConfig::default();
        config.app.dry_run = dry_run;
        config.alerts.webhook_url = None;
        let executor = Arc::new(OrderExecutor::new(Arc::clone(&broker), config.trading.execution.clone()));
        let shutdown = Arc::new(AtomicBool::new(false));

        let mut orchestrator = Orchestrator::new(config, broker, db.clone(), executor, shutdown).unwrap();
        orchestrator.initialize().await.unwrap();
        (orchestrator, demo, db)
    }

    fn buy_signal(symbol: &str, price: Decimal) -> AggregatedSignal {
        AggregatedSignal {
            symbol: symbol.to_string(),
            direction: SignalDirection::Buy,
            strength: 0.9,
            confidence: 0.8,
            price,
            contributing_strategies: vec!["rsi".to_string(), "momentum".to_string()],
            signal_count: 2,
            method: "weighted_average".to_string(),
            generated_at: Utc::now(),
        }
    }

    #[test]
    fn test_is_due() {
        let now = Utc::now();
        assert!(is_due(None, 60, now));
        assert!(!is_due(Some(now - ChronoDuration::seconds(30)), 60, now));
        assert!(is_due(Some(now - ChronoDuration::seconds(60)), 60, now));
    }

    #[test]
    fn test_opposite_signal() {
        assert!(is_opposite(SignalDirection::Sell, PositionSide::Long));
        assert!(is_opposite(SignalDirection::Buy, PositionSide::Short));
        assert!(!is_opposite(SignalDirection::Buy, PositionSide::Long));
        assert!(!is_opposite(SignalDirection::Hold, PositionSide::Long));
    }

    #[tokio::test]
    async fn test_full_cycle_dry_run() {
        let (mut orchestrator, _demo, db) = setup(true).await;
        let report = orchestrator.run_cycle().await.unwrap();

        assert!(report.market_open);
        assert!(report.snapshot_recorded);
        assert!(report.tracked_symbols >= orchestrator.config.base_symbols.0.len());
        assert_eq!(db.recent_snapshots(5).await.unwrap().len(), 1);

        // Nothing is due again straight away
        let again = orchestrator.run_cycle().await.unwrap();
        assert!(!again.snapshot_recorded);
        assert_eq!(again.strategy_signals, 0);

        let status = orchestrator.status().await;
        assert!(status.running);
        assert!(status.last_strategy_run.is_some());
    }

    #[tokio::test]
    async fn test_entry_then_stop_loss_exit() {
        let (mut orchestrator, demo, db) = setup(true).await;
        let now = Utc::now();
        let mut report = CycleReport::default();

        orchestrator
            .process_signals(vec![buy_signal("AAPL", dec!(100))], now, &mut report)
            .await
            .unwrap();
        assert_eq!(report.executed, 1);
        let stored = db.get_open_position("AAPL").await.unwrap().unwrap();
        assert_eq!(stored.entry_price, 100.0);
        assert_eq!(stored.stop_loss_price, Some(97.0));
        assert!(orchestrator.monitor.get("AAPL").is_some());

        // Duplicate entry is blocked by risk
        let mut second = CycleReport::default();
        orchestrator
            .process_signals(vec![buy_signal("AAPL", dec!(100))], now, &mut second)
            .await
            .unwrap();
        assert_eq!(second.rejected, 1);

        demo.seed_price("AAPL", dec!(90)).await;
        let mut monitoring = CycleReport::default();
        orchestrator.monitor_positions(now, &mut monitoring).await.unwrap();
        assert_eq!(monitoring.exits, 1);
        assert!(db.get_open_position("AAPL").await.unwrap().is_none());
        assert!(orchestrator.monitor.is_empty());

        let realized = db.total_realized_pnl().await.unwrap();
        assert!(realized < 0.0);
        assert!(orchestrator.status().await.realized_pnl < Decimal::ZERO);

        let trades = db.recent_trades(10).await.unwrap();
        assert!(trades.iter().any(|t| t.strategy.as_deref() == Some(ExitReason::StopLoss.as_str())));
    }

    #[tokio::test]
    async fn test_live_entry_opens_broker_and_stored_position() {
        let (mut orchestrator, demo, db) = setup(false).await;
        let mut report = CycleReport::default();

        orchestrator
            .process_signals(vec![buy_signal("AAPL", dec!(100))], Utc::now(), &mut report)
            .await
            .unwrap();
        assert_eq!(report.executed, 1);

        let held = demo.get_position("AAPL").await.unwrap().unwrap();
        assert_eq!(held.entry_price, dec!(100.5));
        let stored = db.get_open_position("AAPL").await.unwrap().unwrap();
        assert_eq!(stored.entry_price, 100.5);
        assert_eq!(to_decimal(stored.quantity), held.quantity);
        assert_eq!(orchestrator.monitor.get("AAPL").unwrap().quantity, held.quantity);
    }

    #[tokio::test]
    async fn test_live_stop_loss_closes_at_broker() {
        let (mut orchestrator, demo, db) = setup(false).await;
        let now = Utc::now();
        let mut report = CycleReport::default();
        orchestrator
            .process_signals(vec![buy_signal("AAPL", dec!(100))], now, &mut report)
            .await
            .unwrap();

        demo.seed_price("AAPL", dec!(90)).await;
        let mut monitoring = CycleReport::default();
        orchestrator.monitor_positions(now, &mut monitoring).await.unwrap();

        assert_eq!(monitoring.exits, 1);
        assert!(demo.get_position("AAPL").await.unwrap().is_none());
        assert!(db.get_open_position("AAPL").await.unwrap().is_none());
        assert!(orchestrator.monitor.is_empty());
        assert!(db.total_realized_pnl().await.unwrap() < 0.0);
    }

    #[tokio::test]
    async fn test_live_broker_side_close_is_settled() {
        let (mut orchestrator, demo, db) = setup(false).await;
        let now = Utc::now();
        let mut report = CycleReport::default();
        orchestrator
            .process_signals(vec![buy_signal("AAPL", dec!(100))], now, &mut report)
            .await
            .unwrap();
        let quantity = demo.get_position("AAPL").await.unwrap().unwrap().quantity;

        // Inside the minimum hold only the stop loss can fire, so this just marks the price
        demo.seed_price("AAPL", dec!(104)).await;
        let mut marked = CycleReport::default();
        orchestrator.monitor_positions(now, &mut marked).await.unwrap();
        assert_eq!(marked.exits, 0);

        demo.place_order(&OrderRequest::market("AAPL", OrderSide::Sell, quantity))
            .await
            .unwrap();
        let mut monitoring = CycleReport::default();
        orchestrator.monitor_positions(now, &mut monitoring).await.unwrap();

        assert_eq!(monitoring.exits, 1);
        assert!(orchestrator.monitor.is_empty());
        assert!(db.get_open_position("AAPL").await.unwrap().is_none());
        let expected = (dec!(104) - dec!(100.5)) * quantity;
        assert_eq!(to_decimal(db.total_realized_pnl().await.unwrap()).round_dp(2), expected.round_dp(2));
        assert_eq!(orchestrator.status().await.realized_pnl.round_dp(2), expected.round_dp(2));

        // Re-entry starts a fresh row instead of averaging into the closed one
        demo.seed_price("AAPL", dec!(200)).await;
        let mut reentry = CycleReport::default();
        orchestrator
            .process_signals(vec![buy_signal("AAPL", dec!(200))], now, &mut reentry)
            .await
            .unwrap();
        assert_eq!(reentry.executed, 1);
        let held = demo.get_position("AAPL").await.unwrap().unwrap();
        let stored = db.get_open_position("AAPL").await.unwrap().unwrap();
        assert_eq!(stored.entry_price, 200.5);
        assert_eq!(to_decimal(stored.quantity), held.quantity);
    }

    #[tokio::test]
    async fn test_sell_without_position_rejected() {
        let (mut orchestrator, _demo, db) = setup(true).await;
        let mut signal = buy_signal("MSFT", dec!(100));
        signal.direction = SignalDirection::Sell;
        let mut report = CycleReport::default();

        orchestrator
            .process_signals(vec![signal], Utc::now(), &mut report)
            .await
            .unwrap();
        assert_eq!(report.rejected, 1);
        let signals = db.recent_signals(1, 10).await.unwrap();
        assert_eq!(signals[0].status, "rejected");
        assert_eq!(signals[0].reason.as_deref(), Some("No open long position to sell"));
    }

    #[tokio::test]
    async fn test_entries_suspended_at_max_positions() {
        let (mut orchestrator, _demo, _db) = setup(true).await;
        orchestrator.config.trading.max_positions = 1;
        let now = Utc::now();
        let mut report = CycleReport::default();

        orchestrator
            .process_signals(
                vec![buy_signal("AAPL", dec!(100)), buy_signal("MSFT", dec!(100))],
                now,
                &mut report,
            )
            .await
            .unwrap();
        assert_eq!(report.executed, 1);
        assert_eq!(report.rejected, 1);
    }

    #[tokio::test]
    async fn test_restores_open_positions() {
        let (mut orchestrator, _demo, db) = setup(true).await;
        let mut report = CycleReport::default();
        orchestrator
            .process_signals(vec![buy_signal("NVDA", dec!(100))], Utc::now(), &mut report)
            .await
            .unwrap();

        let broker: Arc<dyn BrokerAdapter> = Arc::new(DemoBrokerAdapter::unauthenticated());
        let config = orchestrator.config.clone();
        let executor = Arc::new(OrderExecutor::new(Arc::clone(&broker), config.trading.execution.clone()));
        let mut restarted =
            Orchestrator::new(config, broker, db, executor, Arc::new(AtomicBool::new(false))).unwrap();
        restarted.initialize().await.unwrap();

        let restored = restarted.monitor.get("NVDA").unwrap();
        assert_eq!(restored.entry_price, dec!(100));
        assert_eq!(restored.stop_loss_price, Some(dec!(97)));
    }

    #[tokio::test]
    async fn test_portfolio_summary_dry_run() {
        let (mut orchestrator, _demo, _db) = setup(true).await;
        let empty = orchestrator.portfolio_summary().await.unwrap();
        assert_eq!(empty.positions_count, 0);
        assert_eq!(empty.realized_pnl, Decimal::ZERO);
        assert!(orchestrator.recent_signals(24).await.unwrap().is_empty());

        let mut report = CycleReport::default();
        orchestrator
            .process_signals(vec![buy_signal("AMD", dec!(100))], Utc::now(), &mut report)
            .await
            .unwrap();
        let summary = orchestrator.portfolio_summary().await.unwrap();
        assert_eq!(summary.positions_count, 1);
        assert_eq!(summary.positions[0].symbol, "AMD");
        assert_eq!(orchestrator.recent_signals(24).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_news_refresh_feeds_aggregation() {
        let (mut orchestrator, demo, db) = setup(true).await;
        let now = Utc::now();
        for (i, headline) in ["Apple beats estimates", "Analysts upgrade Apple", "Apple shares surge"]
            .iter()
            .enumerate()
        {
            demo.seed_news(NewsArticle {
                id: i.to_string(),
                headline: headline.to_string(),
                summary: String::new(),
                source: "demo".to_string(),
                url: None,
                symbols: vec!["AAPL".to_string()],
                created_at: now - ChronoDuration::minutes(30),
            })
            .await;
        }

        orchestrator.refresh_market_data(now).await;
        assert_eq!(orchestrator.update_news(now).await.unwrap(), 1);

        let last_close = {
            let state = orchestrator.state.read().await;
            assert_eq!(state.last_news_update, Some(now));
            let signal = &state.news_signals[0];
            assert_eq!(signal.symbol, "AAPL");
            assert_eq!(signal.strategy, NEWS_STRATEGY);
            assert_eq!(signal.direction, SignalDirection::Buy);
            state.market_data["AAPL"].last().unwrap().close
        };
        assert_eq!(orchestrator.state.read().await.news_signals[0].price, last_close);

        // Recorded once, then reused by every aggregation until the next refresh
        let news_rows = |signals: Vec<StoredSignal>| {
            signals
                .iter()
                .filter(|s| s.contributing_strategies == NEWS_STRATEGY)
                .count()
        };
        assert_eq!(news_rows(db.recent_signals(1, 100).await.unwrap()), 1);
        let mut report = CycleReport::default();
        orchestrator.evaluate_strategies(now, &mut report).await.unwrap();
        assert_eq!(news_rows(db.recent_signals(1, 100).await.unwrap()), 1);
        assert_eq!(orchestrator.state.read().await.news_signals.len(), 1);

        // A failed fetch keeps the previous signals
        demo.disconnect().await.unwrap();
        assert_eq!(orchestrator.update_news(now).await.unwrap(), 0);
        assert_eq!(orchestrator.state.read().await.news_signals.len(), 1);
    }

    #[tokio::test]
    async fn test_screen_universe_is_ranked() {
        let (mut orchestrator, _demo, _db) = setup(true).await;
        let scores = orchestrator.screen_universe().await;

        assert!(scores.len() <= orchestrator.config.scoring.top_n);
        assert!(scores.windows(2).all(|w| w[0].total_score >= w[1].total_score));
        assert!(scores.windows(2).all(|w| w[0].rank < w[1].rank));
    }
}
