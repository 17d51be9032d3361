//! Open position monitoring: exit rules, trailing stops and P&L alerts.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::broker::{Position, PositionSide};

/// Exit rule thresholds, as fractions of entry price.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExitConditions {
    pub stop_loss: Decimal,
    pub take_profit: Decimal,
    pub trailing_stop: Decimal,
    pub max_hold_days: i64,
    pub min_hold_minutes: i64,
}

impl Default for ExitConditions {
    fn default() -> Self {
        Self {
            stop_loss: dec!(0.03),
            take_profit: dec!(0.08),
            trailing_stop: dec!(0.02),
            max_hold_days: 30,
            min_hold_minutes: 60,
        }
    }
}

/// P&L levels that raise alerts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertThresholds {
    pub large_loss: Decimal,
    pub large_gain: Decimal,
    /// Distance from the stop-loss level that counts as "near"
    pub near_stop: Decimal,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            large_loss: dec!(-0.05),
            large_gain: dec!(0.15),
            near_stop: dec!(0.005),
        }
    }
}

/// A position as the monitor tracks it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoredPosition {
    pub symbol: String,
    /// Absolute share count
    pub quantity: Decimal,
    pub side: PositionSide,
    pub entry_price: Decimal,
    pub current_price: Decimal,
    pub opened_at: DateTime<Utc>,
    /// Best price seen: highest for longs, lowest for shorts
    pub peak_price: Decimal,
    pub stop_loss_price: Option<Decimal>,
    pub take_profit_price: Option<Decimal>,
}

impl MonitoredPosition {
    pub fn new(
        symbol: impl Into<String>,
        side: PositionSide,
        quantity: Decimal,
        entry_price: Decimal,
        opened_at: DateTime<Utc>,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            quantity: quantity.abs(),
            side,
            entry_price,
            current_price: entry_price,
            opened_at,
            peak_price: entry_price,
            stop_loss_price: None,
            take_profit_price: None,
        }
    }

    /// Track a broker position opened at `opened_at`.
    pub fn from_position(position: &Position, opened_at: DateTime<Utc>) -> Self {
        let mut monitored = Self::new(
            &position.symbol,
            position.side,
            position.quantity,
            position.entry_price,
            opened_at,
        );
        monitored.update_price(position.current_price);
        monitored
    }

    pub fn with_stops(mut self, stop_loss: Option<Decimal>, take_profit: Option<Decimal>) -> Self {
        self.stop_loss_price = stop_loss;
        self.take_profit_price = take_profit;
        self
    }

    /// Return on entry, positive when the position is winning.
    pub fn pnl_percent(&self) -> Decimal {
        if self.entry_price.is_zero() {
            return Decimal::ZERO;
        }
        match self.side {
            PositionSide::Long => (self.current_price - self.entry_price) / self.entry_price,
            PositionSide::Short => (self.entry_price - self.current_price) / self.entry_price,
        }
    }

    pub fn unrealized_pnl(&self) -> Decimal {
        let diff = self.current_price - self.entry_price;
        match self.side {
            PositionSide::Long => diff * self.quantity,
            PositionSide::Short => -diff * self.quantity,
        }
    }

    pub fn market_value(&self) -> Decimal {
        self.current_price * self.quantity
    }

    /// Mark to `price` and move the peak (or trough for shorts).
    pub fn update_price(&mut self, price: Decimal) {
        self.current_price = price;
        match self.side {
            PositionSide::Long if price > self.peak_price => self.peak_price = price,
            PositionSide::Short if price < self.peak_price => self.peak_price = price,
            _ => {}
        }
    }

    pub fn held_for(&self, now: DateTime<Utc>) -> Duration {
        now - self.opened_at
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    StopLoss,
    TakeProfit,
    TrailingStop,
    MaxHoldingPeriod,
    TechnicalExit,
    Manual,
    BrokerClosed,
    None,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitReason::StopLoss => "stop_loss",
            ExitReason::TakeProfit => "take_profit",
            ExitReason::TrailingStop => "trailing_stop",
            ExitReason::MaxHoldingPeriod => "max_holding_period",
            ExitReason::TechnicalExit => "technical_exit",
            ExitReason::Manual => "manual",
            ExitReason::BrokerClosed => "broker_closed",
            ExitReason::None => "none",
        }
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitUrgency {
    High,
    Medium,
    Low,
    None,
}

/// Exit decision for one position.
#[derive(Debug, Clone, Serialize)]
pub struct ExitSignal {
    pub should_exit: bool,
    pub reason: ExitReason,
    pub urgency: ExitUrgency,
    pub message: String,
}

impl ExitSignal {
    fn hold() -> Self {
        Self {
            should_exit: false,
            reason: ExitReason::None,
            urgency: ExitUrgency::None,
            message: String::new(),
        }
    }

    fn exit(reason: ExitReason, urgency: ExitUrgency, message: String) -> Self {
        Self {
            should_exit: true,
            reason,
            urgency,
            message,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AlertKind {
    LargeLoss,
    LargeGain,
    NearStopLoss,
}

#[derive(Debug, Clone, Serialize)]
pub struct PositionAlert {
    pub symbol: String,
    pub kind: AlertKind,
    pub pnl_percent: Decimal,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MonitorSummary {
    pub total_positions: usize,
    pub long_positions: usize,
    pub short_positions: usize,
    pub total_market_value: Decimal,
    pub total_unrealized_pnl: Decimal,
    pub best_performer: Option<(String, Decimal)>,
    pub worst_performer: Option<(String, Decimal)>,
}

fn pct(value: Decimal) -> Decimal {
    (value * dec!(100)).round_dp(2)
}

/// Tracks open positions and decides when to close them.
pub struct PositionMonitor {
    conditions: ExitConditions,
    thresholds: AlertThresholds,
    positions: BTreeMap<String, MonitoredPosition>,
}

impl PositionMonitor {
    pub fn new(conditions: ExitConditions, thresholds: AlertThresholds) -> Self {
        Self {
            conditions,
            thresholds,
            positions: BTreeMap::new(),
        }
    }

    pub fn conditions(&self) -> &ExitConditions {
        &self.conditions
    }

    // ==================== Tracking ====================

    pub fn track(&mut self, position: MonitoredPosition) {
        debug!(symbol = %position.symbol, side = position.side.as_str(), "Monitoring position");
        self.positions.insert(position.symbol.clone(), position);
    }

    pub fn untrack(&mut self, symbol: &str) -> Option<MonitoredPosition> {
        self.positions.remove(symbol)
    }

    pub fn get(&self, symbol: &str) -> Option<&MonitoredPosition> {
        self.positions.get(symbol)
    }

    pub fn positions(&self) -> impl Iterator<Item = &MonitoredPosition> {
        self.positions.values()
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    /// Mark a tracked position. Returns false if the symbol is not tracked.
    pub fn update_price(&mut self, symbol: &str, price: Decimal) -> bool {
        match self.positions.get_mut(symbol) {
            Some(position) => {
                position.update_price(price);
                true
            }
            None => false,
        }
    }

    /// Align tracking with the broker's view: add new symbols, drop closed ones
    /// and refresh prices. Existing open times and peaks are kept.
    ///
    /// Returns the positions the broker no longer holds, at their last known price.
    pub fn sync(&mut self, broker_positions: &[Position], now: DateTime<Utc>) -> Vec<MonitoredPosition> {
        let closed: Vec<String> = self
            .positions
            .keys()
            .filter(|symbol| !broker_positions.iter().any(|p| &p.symbol == *symbol))
            .cloned()
            .collect();
        let dropped: Vec<MonitoredPosition> = closed
            .iter()
            .filter_map(|symbol| self.positions.remove(symbol))
            .collect();

        for position in broker_positions {
            match self.positions.get_mut(&position.symbol) {
                Some(tracked) => {
                    tracked.quantity = position.abs_quantity();
                    tracked.update_price(position.current_price);
                }
                None => self.track(MonitoredPosition::from_position(position, now)),
            }
        }
        dropped
    }

    // ==================== Exit Signals ====================

    /// Evaluate exit rules in priority order.
    ///
    /// Only the stop loss may fire inside the minimum holding window.
    pub fn check_exit(&self, position: &MonitoredPosition, now: DateTime<Utc>, technical_exit: bool) -> ExitSignal {
        let c = &self.conditions;
        let pnl = position.pnl_percent();
        let price = position.current_price;
        let is_long = position.side == PositionSide::Long;

        let stop_crossed = position
            .stop_loss_price
            .map(|stop| if is_long { price <= stop } else { price >= stop })
            .unwrap_or(false);
        if pnl <= -c.stop_loss || stop_crossed {
            warn!(symbol = %position.symbol, pnl_pct = %pct(pnl), "Stop loss triggered");
            return ExitSignal::exit(
                ExitReason::StopLoss,
                ExitUrgency::High,
                format!("Stop loss hit at {}% ({})", pct(pnl), price),
            );
        }

        if position.held_for(now) < Duration::minutes(c.min_hold_minutes) {
            return ExitSignal::hold();
        }

        let target_crossed = position
            .take_profit_price
            .map(|target| if is_long { price >= target } else { price <= target })
            .unwrap_or(false);
        if pnl >= c.take_profit || target_crossed {
            info!(symbol = %position.symbol, pnl_pct = %pct(pnl), "Take profit triggered");
            return ExitSignal::exit(
                ExitReason::TakeProfit,
                ExitUrgency::Medium,
                format!("Take profit hit at {}% ({})", pct(pnl), price),
            );
        }

        let held = position.held_for(now);
        if held >= Duration::days(c.max_hold_days) {
            return ExitSignal::exit(
                ExitReason::MaxHoldingPeriod,
                ExitUrgency::Low,
                format!("Held for {} days (max {})", held.num_days(), c.max_hold_days),
            );
        }

        let peak = position.peak_price;
        let trailing_hit = if is_long {
            peak > position.entry_price && price <= peak * (Decimal::ONE - c.trailing_stop)
        } else {
            peak < position.entry_price && price >= peak * (Decimal::ONE + c.trailing_stop)
        };
        if trailing_hit {
            info!(symbol = %position.symbol, peak = %peak, price = %price, "Trailing stop triggered");
            return ExitSignal::exit(
                ExitReason::TrailingStop,
                ExitUrgency::Medium,
                format!("Trailing stop: {} moved {}% from best {}", price, pct(c.trailing_stop), peak),
            );
        }

        if technical_exit {
            return ExitSignal::exit(
                ExitReason::TechnicalExit,
                ExitUrgency::Medium,
                "Opposite aggregated signal".to_string(),
            );
        }

        ExitSignal::hold()
    }

    /// Exit decisions for every tracked position that should close.
    ///
    /// `technical_exits` lists symbols with an opposite aggregated signal.
    pub fn check_all(&self, now: DateTime<Utc>, technical_exits: &[String]) -> Vec<(MonitoredPosition, ExitSignal)> {
        let mut exits: Vec<(MonitoredPosition, ExitSignal)> = self
            .positions
            .values()
            .map(|p| {
                let technical = technical_exits.contains(&p.symbol);
                (p.clone(), self.check_exit(p, now, technical))
            })
            .filter(|(_, signal)| signal.should_exit)
            .collect();
        exits.sort_by_key(|(_, signal)| signal.urgency);
        exits
    }

    // ==================== Alerts ====================

    pub fn alerts(&self, position: &MonitoredPosition) -> Vec<PositionAlert> {
        let pnl = position.pnl_percent();
        let t = &self.thresholds;
        let mut alerts = Vec::new();

        if pnl <= t.large_loss {
            alerts.push(PositionAlert {
                symbol: position.symbol.clone(),
                kind: AlertKind::LargeLoss,
                pnl_percent: pnl,
                message: format!("{} down {}%", position.symbol, pct(pnl.abs())),
            });
        } else if pnl >= t.large_gain {
            alerts.push(PositionAlert {
                symbol: position.symbol.clone(),
                kind: AlertKind::LargeGain,
                pnl_percent: pnl,
                message: format!("{} up {}%", position.symbol, pct(pnl)),
            });
        }

        if (pnl + self.conditions.stop_loss).abs() < t.near_stop {
            alerts.push(PositionAlert {
                symbol: position.symbol.clone(),
                kind: AlertKind::NearStopLoss,
                pnl_percent: pnl,
                message: format!("{} within {}% of stop loss", position.symbol, pct(t.near_stop)),
            });
        }
        alerts
    }

    pub fn all_alerts(&self) -> Vec<PositionAlert> {
        self.positions.values().flat_map(|p| self.alerts(p)).collect()
    }

    pub fn summary(&self) -> MonitorSummary {
        summarize(self.positions.values())
    }
}

pub fn summarize<'a>(positions: impl Iterator<Item = &'a MonitoredPosition>) -> MonitorSummary {
    let mut summary = MonitorSummary::default();
    for p in positions {
        summary.total_positions += 1;
        match p.side {
            PositionSide::Long => summary.long_positions += 1,
            PositionSide::Short => summary.short_positions += 1,
        }
        summary.total_market_value += p.market_value();
        summary.total_unrealized_pnl += p.unrealized_pnl();

        let pnl = p.pnl_percent();
        if summary.best_performer.as_ref().map(|(_, best)| pnl > *best).unwrap_or(true) {
            summary.best_performer = Some((p.symbol.clone(), pnl));
        }
        if summary.worst_performer.as_ref().map(|(_, worst)| pnl < *worst).unwrap_or(true) {
            summary.worst_performer = Some((p.symbol.clone(), pnl));
        }
    }
    summary
}
