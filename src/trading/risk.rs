//! Pre-trade risk checks and portfolio risk metrics.

use std::collections::BTreeMap;

use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::broker::{AccountInfo, OrderSide, Position};
use crate::config::RiskConfig;
use crate::models::{AggregatedSignal, SignalDirection};

/// Risk limits, all fractions of portfolio value except `max_positions`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskLimits {
    pub max_exposure_per_trade: Decimal,
    pub max_exposure_per_sector: Decimal,
    pub max_correlation: Decimal,
    /// Share of portfolio value kept out of the market
    pub portfolio_risk_limit: Decimal,
    pub max_daily_loss: Decimal,
    pub max_position_size: Decimal,
    pub max_positions: usize,
}

impl Default for RiskLimits {
    fn default() -> Self {
        Self {
            max_exposure_per_trade: dec!(0.05),
            max_exposure_per_sector: dec!(0.20),
            max_correlation: dec!(0.7),
            portfolio_risk_limit: dec!(0.15),
            max_daily_loss: dec!(0.02),
            max_position_size: dec!(0.10),
            max_positions: 10,
        }
    }
}

impl RiskLimits {
    /// Fractional limits with their config names.
    pub fn fractions(&self) -> Vec<(&'static str, Decimal)> {
        vec![
            ("max_exposure_per_trade", self.max_exposure_per_trade),
            ("max_exposure_per_sector", self.max_exposure_per_sector),
            ("max_correlation", self.max_correlation),
            ("portfolio_risk_limit", self.portfolio_risk_limit),
            ("max_daily_loss", self.max_daily_loss),
            ("max_position_size", self.max_position_size),
        ]
    }
}

/// Outcome of the pre-trade checks for one signal.
#[derive(Debug, Clone, Serialize)]
pub struct RiskCheckResult {
    pub passed: bool,
    /// Money to commit
    pub position_size: Decimal,
    pub checks: BTreeMap<String, bool>,
    pub portfolio_value: Decimal,
    pub exposure_percent: Decimal,
    pub reason: Option<String>,
}

impl RiskCheckResult {
    pub fn failed_checks(&self) -> Vec<&str> {
        self.checks
            .iter()
            .filter(|(_, passed)| !**passed)
            .map(|(name, _)| name.as_str())
            .collect()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RiskMetrics {
    pub total_exposure: Decimal,
    pub exposure_percent: Decimal,
    pub position_count: usize,
    pub largest_position_percent: Decimal,
    pub available_buying_power: Decimal,
}

fn to_decimal(value: f64) -> Decimal {
    Decimal::from_f64(value.clamp(0.0, 1.0)).unwrap_or_default()
}

pub struct RiskManager {
    limits: RiskLimits,
    stop_loss_percent: Decimal,
    take_profit_percent: Decimal,
    sectors: BTreeMap<String, String>,
}

impl RiskManager {
    pub fn new(config: &RiskConfig) -> Self {
        Self {
            limits: config.limits.clone(),
            stop_loss_percent: config.stop_loss_percent,
            take_profit_percent: config.take_profit_percent,
            sectors: config.sectors.clone(),
        }
    }

    pub fn limits(&self) -> &RiskLimits {
        &self.limits
    }

    /// Money to commit for a signal of the given quality.
    pub fn position_size(&self, portfolio_value: Decimal, confidence: f64, strength: f64) -> Decimal {
        let scaled = portfolio_value * self.limits.max_exposure_per_trade * to_decimal(confidence) * to_decimal(strength);
        let cap = portfolio_value * self.limits.max_position_size;
        scaled.min(cap).round_dp(2)
    }

    fn sector_of(&self, symbol: &str) -> Option<&str> {
        self.sectors.get(symbol).map(String::as_str)
    }

    /// Run every applicable check for `signal` against the current book.
    pub fn check_signal(
        &self,
        signal: &AggregatedSignal,
        account: &AccountInfo,
        positions: &[Position],
        daily_pnl: Decimal,
    ) -> RiskCheckResult {
        let pv = account.portfolio_value;
        let size = self.position_size(pv, signal.confidence, signal.strength);
        let held = positions.iter().any(|p| p.symbol == signal.symbol);
        let is_exit = signal.direction == SignalDirection::Sell && held;
        let is_buy = signal.direction == SignalDirection::Buy;

        let mut checks = BTreeMap::new();
        checks.insert(
            "max_exposure_per_trade".to_string(),
            size <= pv * self.limits.max_exposure_per_trade,
        );

        let sector_ok = match self.sector_of(&signal.symbol) {
            Some(sector) => {
                let exposure: Decimal = positions
                    .iter()
                    .filter(|p| self.sector_of(&p.symbol) == Some(sector))
                    .map(|p| p.market_value.abs())
                    .sum();
                exposure + size <= pv * self.limits.max_exposure_per_sector
            }
            None => true,
        };
        checks.insert("sector_exposure".to_string(), sector_ok);

        let invested: Decimal = positions.iter().map(|p| p.market_value.abs()).sum();
        checks.insert(
            "portfolio_risk".to_string(),
            invested + size <= pv * (Decimal::ONE - self.limits.portfolio_risk_limit),
        );

        checks.insert(
            "daily_loss".to_string(),
            daily_pnl > -(pv * self.limits.max_daily_loss),
        );

        if is_buy && !is_exit {
            checks.insert("duplicate_position".to_string(), !held);
            checks.insert(
                "max_positions".to_string(),
                positions.len() < self.limits.max_positions,
            );
            checks.insert("buying_power".to_string(), size <= account.buying_power);
        }

        let mut result = RiskCheckResult {
            passed: checks.values().all(|ok| *ok),
            position_size: size,
            checks,
            portfolio_value: pv,
            exposure_percent: if pv.is_zero() { Decimal::ZERO } else { (size / pv).round_dp(4) },
            reason: None,
        };

        if result.passed {
            debug!(symbol = %signal.symbol, size = %size, "Risk checks passed");
        } else {
            let reason = format!("Failed risk checks: {}", result.failed_checks().join(", "));
            warn!(symbol = %signal.symbol, reason = %reason, "Signal rejected");
            result.reason = Some(reason);
        }
        result
    }

    /// Stop-loss and take-profit prices for an entry at `price`.
    pub fn stop_loss_take_profit(&self, price: Decimal, side: OrderSide) -> (Decimal, Decimal) {
        let (stop, target) = match side {
            OrderSide::Buy => (
                price * (Decimal::ONE - self.stop_loss_percent),
                price * (Decimal::ONE + self.take_profit_percent),
            ),
            OrderSide::Sell => (
                price * (Decimal::ONE + self.stop_loss_percent),
                price * (Decimal::ONE - self.take_profit_percent),
            ),
        };
        (stop.round_dp(2), target.round_dp(2))
    }

    pub fn risk_metrics(&self, account: &AccountInfo, positions: &[Position]) -> RiskMetrics {
        let pv = account.portfolio_value;
        let total: Decimal = positions.iter().map(|p| p.market_value.abs()).sum();
        let largest = positions
            .iter()
            .map(|p| p.market_value.abs())
            .max()
            .unwrap_or_default();
        let pct = |v: Decimal| if pv.is_zero() { Decimal::ZERO } else { (v / pv).round_dp(4) };

        RiskMetrics {
            total_exposure: total,
            exposure_percent: pct(total),
            position_count: positions.len(),
            largest_position_percent: pct(largest),
            available_buying_power: account.buying_power,
        }
    }

    /// Whether the daily loss limit has been breached.
    pub fn should_halt_trading(&self, daily_pnl: Decimal, portfolio_value: Decimal) -> (bool, String) {
        let limit = portfolio_value * self.limits.max_daily_loss;
        if daily_pnl <= -limit {
            (
                true,
                format!("Daily loss {} exceeds limit {}", daily_pnl.abs().round_dp(2), limit.round_dp(2)),
            )
        } else {
            (false, "Within daily loss limit".to_string())
        }
    }
}
